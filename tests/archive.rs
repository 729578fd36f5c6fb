//! Archive linking: lazy member selection, the pull fixed point, and
//! container unloading.
#![cfg(target_arch = "x86_64")]

mod common;

use common::{TestObject, init_logs, write_archive};
use dynld::Linker;
use object::elf::R_X86_64_64;

fn provider(name: &str) -> Vec<u8> {
    let mut obj = TestObject::new();
    obj.text(&[0xc3; 4]);
    obj.func(name, 0, 4);
    obj.build()
}

fn provider_with_ref(name: &str, dep: &str) -> Vec<u8> {
    let mut obj = TestObject::new();
    obj.text(&[0u8; 16]);
    obj.func(name, 0, 16);
    obj.reloc_text(8, dep, R_X86_64_64, 0);
    obj.build()
}

#[test]
fn only_referenced_members_load() {
    init_logs();
    let mut linker = Linker::new();
    linker
        .link_bytes("user.o", &provider_with_ref("arc_user", "wanted_fn"))
        .unwrap();

    let ar = write_archive(&[
        ("m_wanted.o", &provider("wanted_fn")),
        ("m_spare.o", &provider("spare_fn")),
    ]);
    linker.link_bytes("libarc.a", &ar).unwrap();

    assert!(linker.get_function_symbol("wanted_fn").is_some());
    assert!(
        linker.get_function_symbol("spare_fn").is_none(),
        "unreferenced member must stay out of the link"
    );
    assert!(linker.is_function_executable("arc_user"));
    // Container plus one member plus the user.
    assert_eq!(linker.modules().len(), 3);
}

#[test]
fn member_pull_reaches_a_fixed_point() {
    // m1 satisfies the user but needs m2 itself; both must come in, in
    // two rounds, with m3 untouched.
    let mut linker = Linker::new();
    linker
        .link_bytes("user.o", &provider_with_ref("chain_user", "stage_one"))
        .unwrap();

    let ar = write_archive(&[
        ("m1.o", &provider_with_ref("stage_one", "stage_two")),
        ("m2.o", &provider("stage_two")),
        ("m3.o", &provider("stage_unused")),
    ]);
    linker.link_bytes("libchain.a", &ar).unwrap();

    assert_eq!(linker.undefined_count(), 0);
    assert!(linker.is_function_executable("chain_user"));
    assert!(linker.is_function_executable("stage_one"));
    assert!(linker.get_function_symbol("stage_unused").is_none());
}

#[test]
fn archive_with_nothing_to_offer_loads_empty() {
    let mut linker = Linker::new();
    let ar = write_archive(&[("m.o", &provider("nobody_asked"))]);
    let id = linker.link_bytes("libidle.a", &ar).unwrap();
    assert!(linker.get_function_symbol("nobody_asked").is_none());
    // The container itself stays, holding no members.
    assert_eq!(linker.modules().len(), 1);
    assert_eq!(linker.modules()[0].0, id);
}

#[test]
fn unloading_the_container_drops_its_members() {
    let mut linker = Linker::new();
    linker
        .link_bytes("user.o", &provider_with_ref("drop_user", "droppable"))
        .unwrap();
    let ar = write_archive(&[("m.o", &provider("droppable"))]);
    linker.link_bytes("libdrop.a", &ar).unwrap();
    assert!(linker.is_function_executable("drop_user"));

    linker.unload_by_file("libdrop.a", true).unwrap();
    assert_eq!(linker.list_undefined_symbols(), vec!["droppable".to_owned()]);
    assert!(!linker.is_function_executable("drop_user"));
    assert_eq!(linker.modules().len(), 1, "only the user remains");
}

#[test]
fn unloading_a_member_detaches_it_from_its_container() {
    let mut linker = Linker::new();
    linker
        .link_bytes("user.o", &provider_with_ref("det_user", "det_fn"))
        .unwrap();
    let ar = write_archive(&[("m.o", &provider("det_fn"))]);
    let container = linker.link_bytes("libdet.a", &ar).unwrap();

    linker.unload_by_symbol("det_fn", true).unwrap();
    assert_eq!(linker.list_undefined_symbols(), vec!["det_fn".to_owned()]);

    // The container must have forgotten the member: a later container
    // unload has nothing extra to tear down and succeeds softly.
    linker.unload_by_file("libdet.a", false).unwrap();
    assert!(linker.executability(container).is_none());
    assert_eq!(linker.modules().len(), 1, "only the user remains");
}

#[test]
fn duplicate_member_definition_rolls_the_archive_back() {
    let mut linker = Linker::new();
    linker.link_bytes("have.o", &provider("taken_fn")).unwrap();
    linker
        .link_bytes("user.o", &provider_with_ref("dup_user", "pull_me"))
        .unwrap();

    // The pulled member also defines an already-taken name.
    let mut clash = TestObject::new();
    clash.text(&[0xc3; 8]);
    clash.func("pull_me", 0, 4);
    clash.func("taken_fn", 4, 4);
    let ar = write_archive(&[("m.o", &clash.build())]);
    assert!(linker.link_bytes("libbad.a", &ar).is_err());

    assert_eq!(linker.modules().len(), 2, "container and member rolled back");
    assert_eq!(linker.list_undefined_symbols(), vec!["pull_me".to_owned()]);
}
