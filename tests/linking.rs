//! Linking behavior: cross-module resolution, duplicate rejection, common
//! merging, GOT synthesis, trampolines, and manual symbol management.
#![cfg(target_arch = "x86_64")]

mod common;

use common::{TestObject, init_logs, read_i32, read_u64};
use dynld::{Error, Linker, os::ArenaMmap};
use object::elf::{R_X86_64_64, R_X86_64_GOTPCREL, R_X86_64_PLT32};

/// Known-address anchor for range tests; lives in the test binary's image.
#[unsafe(no_mangle)]
pub extern "C" fn dynld_far_anchor() -> u32 {
    0x5a5a
}

fn referencing_object(entry: &str, dep: &str) -> Vec<u8> {
    // 16 bytes of code with an absolute 8-byte hole at offset 8.
    let mut obj = TestObject::new();
    obj.text(&[0u8; 16]);
    obj.func(entry, 0, 16);
    obj.reloc_text(8, dep, R_X86_64_64, 0);
    obj.build()
}

fn defining_object(name: &str) -> Vec<u8> {
    let mut obj = TestObject::new();
    obj.text(&[0xc3; 4]);
    obj.func(name, 0, 4);
    obj.build()
}

#[test]
fn cross_module_resolution_flips_executability() {
    init_logs();
    let mut linker = Linker::new();
    let a = linker
        .link_bytes("a.o", &referencing_object("a_entry", "b_func"))
        .unwrap();
    assert_eq!(linker.list_undefined_symbols(), vec!["b_func".to_owned()]);
    assert!(!linker.is_function_executable("a_entry"));

    let b = linker.link_bytes("b.o", &defining_object("b_func")).unwrap();
    assert_eq!(linker.undefined_count(), 0);
    assert!(linker.is_function_executable("a_entry"));
    assert!(linker.is_function_executable("b_func"));
    assert_ne!(a, b);

    // The hole in a_entry now holds b_func's absolute address.
    let a_entry = linker.get_function_symbol("a_entry").unwrap();
    let b_func = linker.get_function_symbol("b_func").unwrap();
    assert_eq!(read_u64(a_entry + 8), b_func as u64);
}

#[test]
fn duplicate_definition_fails_and_leaves_state_equivalent() {
    let mut linker = Linker::new();
    linker.link_bytes("first.o", &defining_object("dup_func")).unwrap();
    let before_undefined = linker.list_undefined_symbols();
    let before_modules = linker.modules().len();

    // Second definition rides along with an otherwise-new symbol, which
    // must not survive the rollback either.
    let mut obj = TestObject::new();
    obj.text(&[0xc3; 8]);
    obj.func("dup_func", 0, 4);
    obj.func("innocent_bystander", 4, 4);
    let err = linker.link_bytes("second.o", &obj.build()).unwrap_err();
    assert!(matches!(err, Error::DuplicateDefinition { .. }));

    assert!(linker.last_error().unwrap().contains("dup_func"));
    assert_eq!(linker.modules().len(), before_modules);
    assert_eq!(linker.list_undefined_symbols(), before_undefined);
    assert!(linker.get_function_symbol("innocent_bystander").is_none());
}

#[test]
fn equal_size_commons_merge_and_mismatch_errors() {
    let mut linker = Linker::new();
    let mut a = TestObject::new();
    a.common("shared_block", 8);
    linker.link_bytes("ca.o", &a.build()).unwrap();
    let first = linker.get_data_symbol("shared_block").unwrap();

    let mut b = TestObject::new();
    b.common("shared_block", 8);
    linker.link_bytes("cb.o", &b.build()).unwrap();
    assert_eq!(linker.get_data_symbol("shared_block").unwrap(), first);

    let mut c = TestObject::new();
    c.common("shared_block", 4);
    let err = linker.link_bytes("cc.o", &c.build()).unwrap_err();
    assert!(matches!(
        err,
        Error::CommonSizeMismatch { have: 8, want: 4, .. }
    ));
    // The merged block survives the failed load untouched.
    assert_eq!(linker.get_data_symbol("shared_block").unwrap(), first);
}

#[test]
fn got_slots_deduplicate_by_symbol() {
    let mut linker = Linker::new();
    let mut obj = TestObject::new();
    obj.text(&[0u8; 32]);
    obj.func("got_user", 0, 32);
    obj.reloc_text(2, "got_target", R_X86_64_GOTPCREL, -4);
    obj.reloc_text(10, "got_target", R_X86_64_GOTPCREL, -4);
    obj.reloc_text(18, "other_target", R_X86_64_GOTPCREL, -4);
    linker.link_bytes("got.o", &obj.build()).unwrap();
    linker.define_symbol("got_target", 8).unwrap();
    linker.define_symbol("other_target", 8).unwrap();
    assert!(linker.is_function_executable("got_user"));

    let base = linker.get_function_symbol("got_user").unwrap();
    let slot_of = |off: usize| {
        let disp = read_i32(base + off) as i64;
        (base as i64 + off as i64 + disp + 4) as usize
    };
    let (s1, s2, s3) = (slot_of(2), slot_of(10), slot_of(18));
    assert_eq!(s1, s2, "same symbol must share one GOT slot");
    assert_ne!(s1, s3, "different symbols get distinct slots");
    assert_eq!(read_u64(s1), linker.get_data_symbol("got_target").unwrap() as u64);
    assert_eq!(read_u64(s3), linker.get_data_symbol("other_target").unwrap() as u64);
}

#[test]
fn trampoline_covers_out_of_range_branch() {
    init_logs();
    let mut linker: Linker<ArenaMmap> = Linker::with_options(Default::default());
    let exe = std::env::current_exe().unwrap();
    linker.init(&exe.to_string_lossy()).unwrap();

    let anchor = dynld_far_anchor as usize;
    if anchor <= u32::MAX as usize {
        // Loaded low enough that no trampoline is needed; nothing to test.
        return;
    }
    assert_eq!(
        linker.get_function_symbol("dynld_far_anchor"),
        Some(anchor)
    );

    let mut obj = TestObject::new();
    obj.text(&[0u8; 16]);
    obj.func("caller", 0, 16);
    // call rel32 displacement at offset 9.
    obj.reloc_text(9, "dynld_far_anchor", R_X86_64_PLT32, -4);
    linker.link_bytes("far.o", &obj.build()).unwrap();
    assert!(linker.is_function_executable("caller"));

    let base = linker.get_function_symbol("caller").unwrap();
    let disp = read_i32(base + 9) as i64;
    let branch_target = (base as i64 + 9 + disp + 4) as usize;
    assert_ne!(branch_target, anchor, "must bounce through a stub");
    assert!(
        branch_target <= u32::MAX as usize,
        "stub must sit in the module's low image"
    );
    // The stub is `jmp *0(%rip)` followed by the absolute anchor address.
    assert_eq!(read_u64(branch_target + 6), anchor as u64);
}

#[test]
fn manual_references_and_definitions_round_trip() {
    let mut linker = Linker::new();
    linker.create_reference("manual_sym");
    assert_eq!(linker.list_undefined_symbols(), vec!["manual_sym".to_owned()]);

    linker
        .link_bytes("user.o", &referencing_object("user_entry", "manual_sym"))
        .unwrap();
    assert!(!linker.is_function_executable("user_entry"));

    let addr = linker.define_symbol("manual_sym", 32).unwrap();
    assert_eq!(linker.undefined_count(), 0);
    assert_eq!(linker.get_data_symbol("manual_sym"), Some(addr));
    assert!(linker.is_function_executable("user_entry"));

    let user = linker.get_function_symbol("user_entry").unwrap();
    assert_eq!(read_u64(user + 8), addr as u64);

    linker.remove_defined_symbol("manual_sym").unwrap();
    assert_eq!(linker.list_undefined_symbols(), vec!["manual_sym".to_owned()]);
    assert!(!linker.is_function_executable("user_entry"));
    // The undone patch site is back to its pristine zeroes.
    assert_eq!(read_u64(user + 8), 0);
}

#[test]
fn aliases_chase_to_the_terminal_definition() {
    let mut linker = Linker::new();
    let real = linker.define_symbol("real_thing", 16).unwrap();
    linker.define_symbol_alias("alias_one", "real_thing").unwrap();
    linker.define_symbol_alias("alias_two", "alias_one").unwrap();
    assert_eq!(linker.get_data_symbol("alias_two"), Some(real));

    // Aliases may not shadow an existing definition.
    assert!(linker.define_symbol_alias("real_thing", "alias_one").is_err());

    // Relocations bind through the alias like any other name.
    linker
        .link_bytes("au.o", &referencing_object("alias_user", "alias_two"))
        .unwrap();
    let user = linker.get_function_symbol("alias_user").unwrap();
    assert_eq!(read_u64(user + 8), real as u64);
}

#[test]
fn relocation_offset_outside_section_is_rejected() {
    // A patch site past the end of `.text` must fail cleanly instead of
    // writing through the mapping.
    let mut obj = TestObject::new();
    obj.text(&[0u8; 16]);
    obj.func("r_entry", 0, 16);
    obj.reloc_text(0x4000_0000, "r_dep", R_X86_64_64, 0);
    let mut linker = Linker::new();
    let err = linker.link_bytes("corrupt.o", &obj.build()).unwrap_err();
    assert!(matches!(err, Error::Relocation { .. }));
    assert!(linker.modules().is_empty());
    assert_eq!(linker.undefined_count(), 0);
}

#[test]
fn symbol_value_outside_section_is_rejected() {
    let mut obj = TestObject::new();
    obj.text(&[0u8; 16]);
    obj.func("far_sym", 0x1000, 4);
    let mut linker = Linker::new();
    let err = linker.link_bytes("badsym.o", &obj.build()).unwrap_err();
    assert!(matches!(err, Error::Format { .. }));
    assert!(linker.modules().is_empty());
}

#[test]
fn unknown_file_reports_io_error() {
    let mut linker = Linker::new();
    let err = linker.link("/definitely/not/here.o").unwrap_err();
    assert!(matches!(err, Error::Io { .. }));
    assert!(linker.last_error().is_some());
}

#[test]
fn garbage_bytes_report_format_error() {
    let mut linker = Linker::new();
    let err = linker.link_bytes("junk.o", b"not an object").unwrap_err();
    assert!(matches!(err, Error::Format { .. }));
}
