//! Helpers for synthesizing relocatable objects and archives in memory.
//!
//! Tests feed everything through `Linker::link_bytes`, so nothing touches
//! the filesystem and assertions run against linker state and patched
//! image bytes rather than by executing generated code.

#![allow(dead_code)]

use hashbrown::HashMap;

/// Call at the top of a test to surface the engine's logging under
/// `RUST_LOG=debug`.
pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}
use object::write::{Object, Relocation, Symbol, SymbolId, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationFlags, SectionKind, SymbolKind, SymbolScope,
};

pub struct TestObject {
    obj: Object<'static>,
    text: object::write::SectionId,
    data: object::write::SectionId,
    symbols: HashMap<String, SymbolId>,
}

impl TestObject {
    pub fn new() -> Self {
        let mut obj = Object::new(
            BinaryFormat::Elf,
            Architecture::X86_64,
            Endianness::Little,
        );
        let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
        let data = obj.add_section(Vec::new(), b".data".to_vec(), SectionKind::Data);
        TestObject {
            obj,
            text,
            data,
            symbols: HashMap::new(),
        }
    }

    /// Appends `bytes` to `.text`, returning their section offset.
    pub fn text(&mut self, bytes: &[u8]) -> u64 {
        self.obj.append_section_data(self.text, bytes, 16)
    }

    pub fn data(&mut self, bytes: &[u8]) -> u64 {
        self.obj.append_section_data(self.data, bytes, 8)
    }

    /// Defines a global function covering `[value, value + size)` of `.text`.
    pub fn func(&mut self, name: &str, value: u64, size: u64) -> &mut Self {
        let id = self.obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value,
            size,
            kind: SymbolKind::Text,
            scope: SymbolScope::Dynamic,
            weak: false,
            section: SymbolSection::Section(self.text),
            flags: object::SymbolFlags::None,
        });
        self.symbols.insert(name.to_owned(), id);
        self
    }

    pub fn global_data(&mut self, name: &str, value: u64, size: u64) -> &mut Self {
        let id = self.obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value,
            size,
            kind: SymbolKind::Data,
            scope: SymbolScope::Dynamic,
            weak: false,
            section: SymbolSection::Section(self.data),
            flags: object::SymbolFlags::None,
        });
        self.symbols.insert(name.to_owned(), id);
        self
    }

    /// Declares a common (tentative) data symbol.
    pub fn common(&mut self, name: &str, size: u64) -> &mut Self {
        let id = self.obj.add_common_symbol(
            Symbol {
                name: name.as_bytes().to_vec(),
                value: 0,
                size: 0,
                kind: SymbolKind::Data,
                scope: SymbolScope::Dynamic,
                weak: false,
                section: SymbolSection::Undefined,
                flags: object::SymbolFlags::None,
            },
            size,
            size.max(1).next_power_of_two().min(16),
        );
        self.symbols.insert(name.to_owned(), id);
        self
    }

    fn symbol_id(&mut self, name: &str) -> SymbolId {
        if let Some(&id) = self.symbols.get(name) {
            return id;
        }
        let id = self.obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Unknown,
            scope: SymbolScope::Dynamic,
            weak: false,
            section: SymbolSection::Undefined,
            flags: object::SymbolFlags::None,
        });
        self.symbols.insert(name.to_owned(), id);
        id
    }

    /// Adds a `.text` relocation against `name`, declaring it undefined if
    /// nothing else defined it.
    pub fn reloc_text(&mut self, offset: u64, name: &str, r_type: u32, addend: i64) -> &mut Self {
        let symbol = self.symbol_id(name);
        self.obj
            .add_relocation(
                self.text,
                Relocation {
                    offset,
                    symbol,
                    addend,
                    flags: RelocationFlags::Elf { r_type },
                },
            )
            .expect("relocation rejected");
        self
    }

    pub fn build(&mut self) -> Vec<u8> {
        self.obj.write().expect("object emission failed")
    }
}

/// Minimal GNU `ar` writer: short member names only, no symbol index (the
/// linker builds its own from the members).
pub fn write_archive(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = b"!<arch>\n".to_vec();
    for (name, data) in members {
        assert!(name.len() <= 15, "short member names only");
        let header = format!(
            "{:<16}{:<12}{:<6}{:<6}{:<8}{:<10}`\n",
            format!("{name}/"),
            0,
            0,
            0,
            "100644",
            data.len()
        );
        assert_eq!(header.len(), 60);
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(data);
        if data.len() % 2 == 1 {
            out.push(b'\n');
        }
    }
    out
}

/// Reads the u64 the linker patched at `addr`.
pub fn read_u64(addr: usize) -> u64 {
    unsafe { (addr as *const u64).read_unaligned() }
}

pub fn read_i32(addr: usize) -> i32 {
    unsafe { (addr as *const i32).read_unaligned() }
}
