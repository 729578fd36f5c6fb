//! OS-loader interop: adopting a shared object's exports and binding
//! relocatable code against them.
//!
//! These tests lean on `libm.so.6` being resolvable through the system
//! search path, which holds on any glibc host.
#![cfg(all(target_arch = "x86_64", target_os = "linux"))]

mod common;

use common::{TestObject, init_logs, read_u64};
use dynld::{DlOpenMode, Linker};
use object::elf::R_X86_64_64;

#[test]
fn dlopen_adopts_and_releases_dynamic_symbols() {
    init_logs();
    let mut linker = Linker::new();
    let id = linker.dlopen_compat("libm.so.6", DlOpenMode::Now).unwrap();

    let addr = linker.get_function_symbol("cos").unwrap();
    assert_ne!(addr, 0);
    assert!(linker.is_function_executable("cos"));
    assert_eq!(linker.module_by_path("libm.so.6"), Some(id));

    linker.unload_by_file("libm.so.6", false).unwrap();
    assert!(linker.get_function_symbol("cos").is_none());
    assert!(linker.modules().is_empty());
}

#[test]
fn objects_bind_against_adopted_exports() {
    let mut linker = Linker::new();
    linker.dlopen_compat("libm.so.6", DlOpenMode::Lazy).unwrap();

    let mut obj = TestObject::new();
    obj.text(&[0u8; 16]);
    obj.func("uses_cos", 0, 16);
    obj.reloc_text(8, "cos", R_X86_64_64, 0);
    linker.link_bytes("uses_cos.o", &obj.build()).unwrap();

    let cos = linker.get_function_symbol("cos").unwrap();
    let user = linker.get_function_symbol("uses_cos").unwrap();
    assert_eq!(read_u64(user + 8), cos as u64);
    assert!(linker.is_function_executable("uses_cos"));

    // The object binds into the shared library, so a soft unload refuses.
    assert!(linker.unload_by_file("libm.so.6", false).is_err());
    linker.unload_by_file("libm.so.6", true).unwrap();

    assert!(!linker.is_function_executable("uses_cos"));
    assert_eq!(linker.list_undefined_symbols(), vec!["cos".to_owned()]);
    assert_eq!(read_u64(user + 8), 0, "patched bytes restored on unbind");
}
