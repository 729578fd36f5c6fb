//! Object-file loading: parse a relocatable ELF, lay out its image, and
//! build the module record.
//!
//! A load only touches memory it owns. The returned [`Module`] carries the
//! mapped image, the module's global/weak/common/undefined symbols (locals
//! are consumed here and discarded), and one [`RelocationRecord`] per
//! relocation, none of them applied yet. Registration with the shared
//! symbol table happens later, so a failed load leaves no trace beyond the
//! dropped mapping.

use crate::{
    Result,
    arch::Relocator,
    error::{format_error, reloc_error},
    module::{Module, ModuleId, ModuleImage, ModuleSymbol, SymbolClass},
    os::{Mmap, PAGE_SIZE, ProtFlags, roundup},
    relocation::{ArchReloc, MAX_PATCH_WIDTH, RelocTarget, RelocationRecord},
};
use hashbrown::HashMap;
use object::{
    Object, ObjectKind, ObjectSection, ObjectSymbol, RelocationFlags, RelocationTarget,
    SectionFlags, SectionIndex, SectionKind, SymbolIndex, SymbolSection,
};
use std::path::PathBuf;

/// Alignment policy for merged common symbols.
pub(crate) fn common_align(size: usize) -> usize {
    size.max(1).next_power_of_two().min(16)
}

fn expected_arch() -> object::Architecture {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            object::Architecture::X86_64
        } else if #[cfg(target_arch = "mips")] {
            object::Architecture::Mips
        } else {
            object::Architecture::Mips64
        }
    }
}

fn is_alloc(section: &object::Section<'_, '_>) -> bool {
    match section.flags() {
        SectionFlags::Elf { sh_flags } => sh_flags & u64::from(object::elf::SHF_ALLOC) != 0,
        _ => false,
    }
}

fn elf_r_type(reloc: &object::Relocation) -> Result<u32> {
    match reloc.flags() {
        RelocationFlags::Elf { r_type } => Ok(r_type),
        _ => Err(format_error("relocation is not in ELF form")),
    }
}

#[inline]
fn bad_format(path: &std::path::Path, err: impl core::fmt::Display) -> crate::Error {
    format_error(format!("{}: {err}", path.display()))
}

/// Parses `bytes` as a relocatable object and builds the module image.
pub(crate) fn load_object<M: Mmap>(
    id: ModuleId,
    path: PathBuf,
    bytes: &[u8],
) -> Result<Module<M>> {
    let file = object::File::parse(bytes).map_err(|e| bad_format(&path, e))?;
    if file.kind() != ObjectKind::Relocatable {
        return Err(bad_format(&path, "not a relocatable object"));
    }
    if file.architecture() != expected_arch() {
        return Err(bad_format(
            &path,
            format!("wrong architecture {:?}", file.architecture()),
        ));
    }

    // Section layout: allocatable sections packed at their alignment. The
    // map carries each section's size so symbol values and relocation
    // offsets can be checked against it.
    let mut section_off: HashMap<SectionIndex, (usize, usize)> = HashMap::new();
    let mut cursor = 0usize;
    for section in file.sections() {
        if !is_alloc(&section) {
            continue;
        }
        let align = (section.align() as usize).max(1);
        cursor = roundup(cursor, align);
        section_off.insert(section.index(), (cursor, section.size() as usize));
        cursor += section.size() as usize;
    }

    // Common tail: worst-case room for every common this module carries.
    let mut common_len = 0usize;
    for sym in file.symbols() {
        if sym.is_common() {
            let size = sym.size() as usize;
            common_len = roundup(common_len, common_align(size)) + size;
        }
    }

    // Upper bounds for the synthesized GOT and the trampoline table.
    let mut got_capacity = 0usize;
    let mut stub_capacity = 0usize;
    for section in file.sections() {
        if !section_off.contains_key(&section.index()) {
            continue;
        }
        for (_, reloc) in section.relocations() {
            let r_type = elf_r_type(&reloc)?;
            if Relocator::wants_got(r_type) {
                got_capacity += 1;
            }
            if Relocator::wants_stub(r_type) {
                stub_capacity += 1;
            }
        }
    }

    let common_base_off = roundup(cursor, 16);
    let got_base_off = roundup(common_base_off + common_len, core::mem::size_of::<usize>());
    let stub_base_off = got_base_off + got_capacity * core::mem::size_of::<usize>();
    let stub_entry = Relocator::STUB_ENTRY_SIZE.max(1);
    let total = roundup(stub_base_off + stub_capacity * stub_entry, PAGE_SIZE).max(PAGE_SIZE);

    let base = unsafe {
        M::mmap_anonymous(total, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE)? as usize
    };
    let mut module = Module::new(id, path);
    module.image = Some(ModuleImage::new(
        base,
        total,
        base + got_base_off,
        got_capacity,
        base + stub_base_off,
        stub_capacity,
        base + common_base_off,
        common_len,
    ));

    // Section contents; the anonymous mapping is already zeroed, so
    // uninitialized-data sections need no copy.
    for section in file.sections() {
        let Some(&(off, _)) = section_off.get(&section.index()) else {
            continue;
        };
        if section.kind() == SectionKind::UninitializedData {
            continue;
        }
        let data = section
            .data()
            .map_err(|e| bad_format(&module.path, e))?;
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), (base + off) as *mut u8, data.len());
        }
    }

    // Symbols. Locals are resolved to addresses for relocation targets and
    // then dropped; everything non-local is carried on the module.
    let mut local_addr: HashMap<SymbolIndex, usize> = HashMap::new();
    for sym in file.symbols() {
        let resolved = match sym.section() {
            SymbolSection::Section(idx) => match section_off.get(&idx) {
                Some(&(off, len)) => {
                    let value = sym.address() as usize;
                    if value > len {
                        return Err(bad_format(
                            &module.path,
                            format!(
                                "symbol `{}` lies outside its section",
                                sym.name().unwrap_or("?")
                            ),
                        ));
                    }
                    Some(base + off + value)
                }
                None => None,
            },
            SymbolSection::Absolute => Some(sym.address() as usize),
            _ => None,
        };
        if sym.is_local() {
            if let Some(addr) = resolved {
                local_addr.insert(sym.index(), addr);
            }
            continue;
        }
        let name = sym.name().map_err(|e| bad_format(&module.path, e))?;
        if name.is_empty() {
            continue;
        }
        let class = if sym.is_common() {
            SymbolClass::Common
        } else if sym.is_undefined() {
            SymbolClass::Undefined
        } else if sym.is_weak() {
            SymbolClass::Weak
        } else {
            SymbolClass::Global
        };
        let value = match class {
            SymbolClass::Global | SymbolClass::Weak => {
                let Some(addr) = resolved else {
                    return Err(bad_format(
                        &module.path,
                        format!("defined symbol `{name}` has no resolvable section"),
                    ));
                };
                addr
            }
            _ => 0,
        };
        module.symbols.push(ModuleSymbol {
            name: name.to_owned(),
            class,
            value,
            size: sym.size() as usize,
            is_func: sym.kind() == object::SymbolKind::Text,
        });
    }

    // Relocation records, one per entry, in file order (paired types rely
    // on the order for addend reassembly).
    #[cfg(any(target_arch = "mips", target_arch = "mips64"))]
    let gp = base + got_base_off + crate::arch::GP_OFFSET;
    for section in file.sections() {
        let Some(&(off, sec_len)) = section_off.get(&section.index()) else {
            continue;
        };
        let sec_base = base + off;
        for (r_off, reloc) in section.relocations() {
            let r_type = elf_r_type(&reloc)?;
            let width = Relocator::patch_width(r_type);
            if width == 0 {
                continue;
            }
            let r_off = r_off as usize;
            // A patch site must lie inside its section; anything else is
            // a corrupt relocation table.
            if r_off.checked_add(width).is_none_or(|end| end > sec_len) {
                return Err(reloc_error(format!(
                    "{}: relocation offset {r_off:#x} overruns its section ({sec_len:#x} bytes)",
                    module.path.display()
                )));
            }
            let place = sec_base + r_off;
            let mut pristine = [0u8; MAX_PATCH_WIDTH];
            unsafe {
                core::ptr::copy_nonoverlapping(place as *const u8, pristine.as_mut_ptr(), width);
            }
            let addend = if reloc.has_implicit_addend() {
                Relocator::implicit_addend(r_type, &pristine[..width])
            } else {
                reloc.addend()
            };
            let target = match reloc.target() {
                RelocationTarget::Symbol(si) => {
                    let sym = file
                        .symbol_by_index(si)
                        .map_err(|e| bad_format(&module.path, e))?;
                    #[cfg(any(target_arch = "mips", target_arch = "mips64"))]
                    if sym.name().unwrap_or("") == "_gp_disp" {
                        // AHL + GP - P, folded into a fixed per-site target.
                        module.relocs.push(RelocationRecord {
                            r_type,
                            place,
                            addend,
                            target: RelocTarget::Fixed(gp.wrapping_sub(place)),
                            pristine,
                            width,
                            applied: false,
                            bound_to: None,
                            got_slot: None,
                        });
                        continue;
                    }
                    if let Some(&addr) = local_addr.get(&si) {
                        RelocTarget::Fixed(addr)
                    } else {
                        let name = sym.name().map_err(|e| bad_format(&module.path, e))?;
                        RelocTarget::Named(name.to_owned())
                    }
                }
                RelocationTarget::Section(idx) => {
                    let Some(&(soff, _)) = section_off.get(&idx) else {
                        return Err(bad_format(
                            &module.path,
                            "relocation against a non-allocated section",
                        ));
                    };
                    RelocTarget::Fixed(base + soff)
                }
                _ => {
                    return Err(bad_format(&module.path, "unsupported relocation target"));
                }
            };
            // The local-GOT (page/offset) form is not implemented; GOT16
            // is only accepted against global names.
            #[cfg(any(target_arch = "mips", target_arch = "mips64"))]
            if r_type == object::elf::R_MIPS_GOT16 && matches!(target, RelocTarget::Fixed(_)) {
                return Err(crate::error::reloc_error(format!(
                    "{}: R_MIPS_GOT16 against a local symbol at {place:#x}",
                    module.path.display()
                )));
            }
            module.relocs.push(RelocationRecord {
                r_type,
                place,
                addend,
                target,
                pristine,
                width,
                applied: false,
                bound_to: None,
                got_slot: None,
            });
        }
    }
    Relocator::finalize_addends(&mut module.relocs);

    if let Some(image) = module.image.as_ref() {
        image.make_executable()?;
    }
    log::debug!(
        "loaded {}: base {base:#x}, size {total:#x}, {} symbols, {} relocations",
        module.path.display(),
        module.symbols.len(),
        module.relocs.len()
    );
    Ok(module)
}
