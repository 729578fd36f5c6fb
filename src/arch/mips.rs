//! MIPS relocation support for relocatable objects (o32, plus the 64-bit
//! absolute form on mips64).
//!
//! MIPS cannot materialize a 32-bit address in one instruction, so the ABI
//! splits addends across paired relocations (`HI16`/`LO16`) and reaches
//! most globals through a GOT addressed off the `$gp` register. The GOT
//! pointer is assumed to hold `got_base + 0x7ff0`, the conventional bias
//! that lets a signed 16-bit displacement cover the whole table.

use crate::{
    Result,
    error::{got_error, reloc_error},
    relocation::{ArchReloc, PatchContext, RelocTarget, RelocationRecord, write_unaligned},
};
use object::elf::*;

#[inline]
fn fits_i16(v: i64) -> bool {
    v >= i64::from(i16::MIN) && v <= i64::from(i16::MAX)
}

#[inline]
fn read_unaligned<T: Copy>(place: usize) -> T {
    unsafe { (place as *const T).read_unaligned() }
}

/// The ELF machine type this backend links.
pub const EM_ARCH: u16 = EM_MIPS;

/// Bias between the GOT base and the value kept in `$gp`.
pub(crate) const GP_OFFSET: usize = 0x7ff0;

/// Size of each trampoline entry in bytes.
pub(crate) const STUB_ENTRY_SIZE: usize = 16;

pub(crate) struct MipsRelocator;

#[inline]
fn sign16(raw: u32) -> i64 {
    i64::from(raw as u16 as i16)
}

/// Pairing key for `HI16`/`LO16`: both halves must bind the same target.
fn pair_key(target: &RelocTarget) -> (usize, &str) {
    match target {
        RelocTarget::Fixed(addr) => (*addr, ""),
        RelocTarget::Named(name) => (0, name.as_str()),
    }
}

/// Rewrites the low 16 bits of the instruction at the patch site.
fn patch_low16(place: usize, value: u32) {
    let insn: u32 = read_unaligned(place);
    write_unaligned(place, (insn & 0xffff_0000) | (value & 0xffff));
}

impl ArchReloc for MipsRelocator {
    const STUB_ENTRY_SIZE: usize = STUB_ENTRY_SIZE;

    fn patch_width(r_type: u32) -> usize {
        match r_type {
            R_MIPS_NONE => 0,
            R_MIPS_64 => 8,
            _ => 4,
        }
    }

    fn wants_got(r_type: u32) -> bool {
        matches!(r_type, R_MIPS_GOT16 | R_MIPS_CALL16)
    }

    fn wants_stub(r_type: u32) -> bool {
        r_type == R_MIPS_26
    }

    fn implicit_addend(r_type: u32, place: &[u8]) -> i64 {
        let word = u32::from_ne_bytes([place[0], place[1], place[2], place[3]]);
        match r_type {
            R_MIPS_32 => i64::from(word as i32),
            R_MIPS_64 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&place[..8]);
                i64::from_ne_bytes(raw)
            }
            R_MIPS_26 => i64::from(word & 0x03ff_ffff) << 2,
            // Raw half; merged into a full AHL by finalize_addends.
            R_MIPS_HI16 | R_MIPS_LO16 => i64::from(word & 0xffff),
            R_MIPS_PC16 => sign16(word) << 2,
            // GOT displacements carry no in-place addend for globals.
            _ => 0,
        }
    }

    /// Merges split `HI16`/`LO16` addends: each pair computes
    /// `AHL = (hi << 16) + (short)lo`, and both halves patch from it.
    fn finalize_addends(records: &mut [RelocationRecord]) {
        for i in 0..records.len() {
            if records[i].r_type != R_MIPS_HI16 {
                continue;
            }
            let key = {
                let (a, n) = pair_key(&records[i].target);
                (a, n.to_owned())
            };
            let hi_raw = records[i].addend as u32;
            let lo = records[i..].iter().find(|r| {
                r.r_type == R_MIPS_LO16 && {
                    let (a, n) = pair_key(&r.target);
                    (a, n) == (key.0, key.1.as_str())
                }
            });
            // An unpaired HI16 keeps AHL = hi << 16.
            let lo_raw = lo.map_or(0, |r| r.addend as u32);
            records[i].addend = (i64::from(hi_raw) << 16) + sign16(lo_raw);
        }
        let mut last_hi: hashbrown::HashMap<(usize, String), u32> = hashbrown::HashMap::new();
        for rec in records.iter_mut() {
            let (a, n) = pair_key(&rec.target);
            let key = (a, n.to_owned());
            match rec.r_type {
                R_MIPS_HI16 => {
                    // addend already holds AHL; recover the raw half.
                    last_hi.insert(key, ((rec.addend >> 16) & 0xffff) as u32);
                }
                R_MIPS_LO16 => {
                    let hi_raw = last_hi.get(&key).copied().unwrap_or(0);
                    rec.addend = (i64::from(hi_raw) << 16) + sign16(rec.addend as u32);
                }
                _ => {}
            }
        }
    }

    fn apply(ctx: &mut PatchContext<'_>, r_type: u32) -> Result<()> {
        let s = ctx.target as i64;
        let a = ctx.addend;
        match r_type {
            // Absolute word: S + A
            R_MIPS_32 => {
                write_unaligned(ctx.place, (s + a) as u32);
            }
            // Absolute doubleword: S + A
            R_MIPS_64 => {
                write_unaligned(ctx.place, (s + a) as u64);
            }
            // Jump target: (S + A) >> 2, same 256 MiB region as the
            // delay-slot PC. Out-of-region targets go through a stub.
            R_MIPS_26 => {
                let mut value = s + a;
                let pc = (ctx.place + 4) as i64;
                if (value >> 28) != (pc >> 28) {
                    let Some(stubs) = ctx.stubs.as_mut() else {
                        return Err(out_of_range(r_type, ctx));
                    };
                    let stub = stubs.get_or_create(ctx.target, Self::emit_stub)?;
                    value = stub as i64 + a;
                    if (value >> 28) != (pc >> 28) {
                        return Err(out_of_range(r_type, ctx));
                    }
                }
                if value & 3 != 0 {
                    return Err(out_of_range(r_type, ctx));
                }
                let insn: u32 = read_unaligned(ctx.place);
                write_unaligned(
                    ctx.place,
                    (insn & 0xfc00_0000) | (((value >> 2) as u32) & 0x03ff_ffff),
                );
            }
            // High half of S + AHL, compensated for the sign of the
            // low half.
            R_MIPS_HI16 => {
                patch_low16(ctx.place, (((s + a) + 0x8000) >> 16) as u32);
            }
            // Low half of S + AHL.
            R_MIPS_LO16 => {
                patch_low16(ctx.place, (s + a) as u32);
            }
            // GOT displacement: G - GP, slot already holds S. The i16
            // displacement bounds the table.
            R_MIPS_GOT16 | R_MIPS_CALL16 => {
                let Some(slot) = ctx.got_slot else {
                    return Err(reloc_error(format!(
                        "{} at {:#x} has no GOT slot",
                        Self::rel_type_to_str(r_type),
                        ctx.place
                    )));
                };
                let disp = slot as i64 - ctx.got_pointer as i64;
                if !fits_i16(disp) {
                    return Err(got_error(format!(
                        "GOT slot at {slot:#x} is out of $gp range (displacement {disp:#x})"
                    )));
                }
                patch_low16(ctx.place, disp as u32);
            }
            // Branch displacement: (S + A - P) >> 2
            R_MIPS_PC16 => {
                let value = s + a - ctx.place as i64;
                if value & 3 != 0 || !fits_i16(value >> 2) {
                    return Err(out_of_range(r_type, ctx));
                }
                patch_low16(ctx.place, (value >> 2) as u32);
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

    /// Layout:
    /// - lui  $t9, %hi(TARGET)
    /// - ori  $t9, $t9, %lo(TARGET)
    /// - jr   $t9
    /// - nop
    fn emit_stub(buf: &mut [u8], target: usize) {
        let hi = ((target >> 16) & 0xffff) as u32;
        let lo = (target & 0xffff) as u32;
        let words: [u32; 4] = [
            0x3c19_0000 | hi, // lui $t9, hi
            0x3739_0000 | lo, // ori $t9, $t9, lo
            0x0320_0008,      // jr $t9
            0x0000_0000,      // nop
        ];
        for (chunk, word) in buf.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_ne_bytes());
        }
    }

    fn rel_type_to_str(r_type: u32) -> &'static str {
        match r_type {
            R_MIPS_NONE => "R_MIPS_NONE",
            R_MIPS_32 => "R_MIPS_32",
            R_MIPS_64 => "R_MIPS_64",
            R_MIPS_26 => "R_MIPS_26",
            R_MIPS_HI16 => "R_MIPS_HI16",
            R_MIPS_LO16 => "R_MIPS_LO16",
            R_MIPS_GOT16 => "R_MIPS_GOT16",
            R_MIPS_CALL16 => "R_MIPS_CALL16",
            R_MIPS_PC16 => "R_MIPS_PC16",
            _ => "R_MIPS_UNKNOWN",
        }
    }
}

#[cold]
fn out_of_range(r_type: u32, ctx: &PatchContext<'_>) -> crate::Error {
    reloc_error(format!(
        "{} at {:#x}: value for target {:#x} out of range",
        MipsRelocator::rel_type_to_str(r_type),
        ctx.place,
        ctx.target
    ))
}
