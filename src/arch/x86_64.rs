//! x86-64 relocation support for relocatable objects.
//!
//! The interesting cases are the PC-relative forms: a 32-bit displacement
//! cannot always span the distance between a module image and a target in
//! the host executable, so out-of-range branches are redirected through a
//! trampoline emitted into the module's own image, and GOT-relative loads
//! resolve through a GOT synthesized next to the module's sections.

use crate::{
    Result,
    error::reloc_error,
    relocation::{ArchReloc, PatchContext, write_unaligned},
};
use object::elf::*;

#[inline]
fn fits_u32(v: i64) -> bool {
    v >= 0 && v <= i64::from(u32::MAX)
}

#[inline]
fn fits_i32(v: i64) -> bool {
    v >= i64::from(i32::MIN) && v <= i64::from(i32::MAX)
}

/// The ELF machine type this backend links.
pub const EM_ARCH: u16 = EM_X86_64;

/// Size of each trampoline entry in bytes.
pub(crate) const STUB_ENTRY_SIZE: usize = 14;

/// Trampoline template.
///
/// Layout:
/// - jmp *0(%rip)
/// - .quad TARGET
const STUB_ENTRY: [u8; STUB_ENTRY_SIZE] = [
    0xff, 0x25, 0x00, 0x00, 0x00, 0x00, // jmp *0(%rip)
    0, 0, 0, 0, 0, 0, 0, 0, // target address
];

pub(crate) struct X86_64Relocator;

impl X86_64Relocator {
    /// `S + A - P` with a trampoline fallback when the displacement does
    /// not fit in 32 bits.
    fn pc32(ctx: &mut PatchContext<'_>, r_type: u32) -> Result<()> {
        let place = ctx.place as i64;
        let mut value = ctx.target as i64 + ctx.addend - place;
        if !fits_i32(value) {
            let Some(stubs) = ctx.stubs.as_mut() else {
                return Err(out_of_range(r_type, ctx));
            };
            let stub = stubs.get_or_create(ctx.target, Self::emit_stub)?;
            value = stub as i64 + ctx.addend - place;
            if !fits_i32(value) {
                return Err(out_of_range(r_type, ctx));
            }
        }
        write_unaligned(ctx.place, value as i32);
        Ok(())
    }
}

impl ArchReloc for X86_64Relocator {
    const STUB_ENTRY_SIZE: usize = STUB_ENTRY_SIZE;

    fn patch_width(r_type: u32) -> usize {
        match r_type {
            R_X86_64_NONE => 0,
            R_X86_64_64 | R_X86_64_PC64 => 8,
            _ => 4,
        }
    }

    fn wants_got(r_type: u32) -> bool {
        matches!(
            r_type,
            R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX | R_X86_64_REX_GOTPCRELX
        )
    }

    fn wants_stub(r_type: u32) -> bool {
        matches!(r_type, R_X86_64_PC32 | R_X86_64_PLT32)
    }

    fn apply(ctx: &mut PatchContext<'_>, r_type: u32) -> Result<()> {
        match r_type {
            // Absolute 64-bit: S + A
            R_X86_64_64 => {
                write_unaligned(ctx.place, (ctx.target as i64 + ctx.addend) as u64);
            }
            // Absolute 32-bit zero-extended: S + A, must fit unsigned
            R_X86_64_32 => {
                let value = ctx.target as i64 + ctx.addend;
                if !fits_u32(value) {
                    return Err(out_of_range(r_type, ctx));
                }
                write_unaligned(ctx.place, value as u32);
            }
            // Absolute 32-bit sign-extended: S + A, must fit signed
            R_X86_64_32S => {
                let value = ctx.target as i64 + ctx.addend;
                if !fits_i32(value) {
                    return Err(out_of_range(r_type, ctx));
                }
                write_unaligned(ctx.place, value as i32);
            }
            // PC-relative 32-bit: S + A - P, trampoline on overflow.
            // PLT32 binds directly; the trampoline plays the PLT's role.
            R_X86_64_PC32 | R_X86_64_PLT32 => Self::pc32(ctx, r_type)?,
            // PC-relative 64-bit: S + A - P
            R_X86_64_PC64 => {
                write_unaligned(ctx.place, ctx.target as i64 + ctx.addend - ctx.place as i64);
            }
            // GOT-relative: G + A - P, slot already holds S
            R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX | R_X86_64_REX_GOTPCRELX => {
                let Some(slot) = ctx.got_slot else {
                    return Err(reloc_error(format!(
                        "{} at {:#x} has no GOT slot",
                        Self::rel_type_to_str(r_type),
                        ctx.place
                    )));
                };
                let value = slot as i64 + ctx.addend - ctx.place as i64;
                if !fits_i32(value) {
                    return Err(out_of_range(r_type, ctx));
                }
                write_unaligned(ctx.place, value as i32);
            }
            _ => {
                return Err(reloc_error(format!(
                    "unsupported relocation type {} at {:#x}",
                    Self::rel_type_to_str(r_type),
                    ctx.place
                )));
            }
        }
        Ok(())
    }

    fn emit_stub(buf: &mut [u8], target: usize) {
        buf.copy_from_slice(&STUB_ENTRY);
        buf[6..14].copy_from_slice(&(target as u64).to_le_bytes());
    }

    fn rel_type_to_str(r_type: u32) -> &'static str {
        match r_type {
            R_X86_64_NONE => "R_X86_64_NONE",
            R_X86_64_64 => "R_X86_64_64",
            R_X86_64_32 => "R_X86_64_32",
            R_X86_64_32S => "R_X86_64_32S",
            R_X86_64_PC32 => "R_X86_64_PC32",
            R_X86_64_PC64 => "R_X86_64_PC64",
            R_X86_64_PLT32 => "R_X86_64_PLT32",
            R_X86_64_GOTPCREL => "R_X86_64_GOTPCREL",
            R_X86_64_GOTPCRELX => "R_X86_64_GOTPCRELX",
            R_X86_64_REX_GOTPCRELX => "R_X86_64_REX_GOTPCRELX",
            _ => "R_X86_64_UNKNOWN",
        }
    }
}

#[cold]
fn out_of_range(r_type: u32, ctx: &PatchContext<'_>) -> crate::Error {
    reloc_error(format!(
        "{} at {:#x}: value for target {:#x} out of range",
        X86_64Relocator::rel_type_to_str(r_type),
        ctx.place,
        ctx.target
    ))
}
