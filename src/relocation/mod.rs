//! Relocation records and the patching machinery shared by all
//! architectures.
//!
//! Every relocation read out of a module is turned into a
//! [`RelocationRecord`]. Records against local symbols have a fixed target
//! and are patched once at load; records against global names are kept for
//! the lifetime of the module so the link can re-apply them when the
//! defining module changes, and undo them (restoring the pristine bytes)
//! when the definition goes away.

use crate::{Result, error::reloc_error};
use hashbrown::HashMap;

/// Widest patch any supported relocation writes.
pub(crate) const MAX_PATCH_WIDTH: usize = 8;

/// What a relocation record binds to.
#[derive(Clone, Debug)]
pub(crate) enum RelocTarget {
    /// A local or section symbol; the address is final at load time.
    Fixed(usize),
    /// A global name, resolved through the symbol table on every relink.
    Named(String),
}

/// One relocation, with enough state to apply it, re-apply it against a
/// moved target, or undo it.
#[derive(Clone, Debug)]
pub(crate) struct RelocationRecord {
    pub(crate) r_type: u32,
    /// Absolute address of the patch site.
    pub(crate) place: usize,
    pub(crate) addend: i64,
    pub(crate) target: RelocTarget,
    /// Bytes at the patch site before any patch, restored on undo.
    pub(crate) pristine: [u8; MAX_PATCH_WIDTH],
    /// How many of `pristine` are meaningful.
    pub(crate) width: usize,
    pub(crate) applied: bool,
    /// Target address the record was last patched against.
    pub(crate) bound_to: Option<usize>,
    /// Absolute address of the GOT slot assigned to this record.
    pub(crate) got_slot: Option<usize>,
}

impl RelocationRecord {
    /// Restores the pristine bytes at the patch site.
    pub(crate) fn undo(&mut self) {
        if !self.applied {
            return;
        }
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.pristine.as_ptr(),
                self.place as *mut u8,
                self.width,
            );
        }
        self.applied = false;
        self.bound_to = None;
    }

    /// Re-establishes the pristine bytes so the patch computes from the
    /// original in-place value (REL-style addends live in those bytes).
    pub(crate) fn restore_for_apply(&self) {
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.pristine.as_ptr(),
                self.place as *mut u8,
                self.width,
            );
        }
    }
}

/// View over a module's trampoline region, handed to the architecture
/// backend so an out-of-range branch can be redirected.
pub(crate) struct StubTable<'a> {
    pub(crate) base: usize,
    pub(crate) capacity: usize,
    pub(crate) entry_size: usize,
    pub(crate) used: &'a mut usize,
    /// target address -> stub address, so each target gets one stub.
    pub(crate) map: &'a mut HashMap<usize, usize>,
}

impl StubTable<'_> {
    /// Returns the stub jumping to `target`, emitting one if none exists.
    pub(crate) fn get_or_create(
        &mut self,
        target: usize,
        emit: fn(&mut [u8], usize),
    ) -> Result<usize> {
        if let Some(&stub) = self.map.get(&target) {
            return Ok(stub);
        }
        if *self.used >= self.capacity {
            return Err(reloc_error("trampoline table exhausted"));
        }
        let addr = self.base + *self.used * self.entry_size;
        let buf = unsafe { core::slice::from_raw_parts_mut(addr as *mut u8, self.entry_size) };
        emit(buf, target);
        *self.used += 1;
        self.map.insert(target, addr);
        Ok(addr)
    }
}

/// Everything one `apply` call may touch.
pub(crate) struct PatchContext<'a> {
    /// Absolute address of the patch site (`P`).
    pub(crate) place: usize,
    /// Resolved target address (`S`).
    pub(crate) target: usize,
    /// Effective addend (`A`), already merged for paired REL types.
    pub(crate) addend: i64,
    /// GOT slot assigned to the record, already loaded with `S`.
    pub(crate) got_slot: Option<usize>,
    /// Base the GOT pointer register is assumed to hold, where the ABI
    /// has one.
    #[cfg_attr(not(any(target_arch = "mips", target_arch = "mips64")), allow(dead_code))]
    pub(crate) got_pointer: usize,
    pub(crate) stubs: Option<StubTable<'a>>,
}

/// Architecture backend: one implementation per supported CPU, selected
/// at compile time in [`crate::arch`].
pub(crate) trait ArchReloc {
    /// Bytes of one trampoline entry; zero when the CPU never needs one.
    const STUB_ENTRY_SIZE: usize;

    /// Bytes the relocation writes at the patch site; 0 for no-ops.
    fn patch_width(r_type: u32) -> usize;

    /// Whether this relocation resolves through a GOT slot.
    fn wants_got(_r_type: u32) -> bool {
        false
    }

    /// Whether this relocation may fall back to a trampoline.
    fn wants_stub(_r_type: u32) -> bool {
        false
    }

    /// Whether GOT slot reuse must distinguish addends for this type.
    fn got_key_addend(_r_type: u32) -> bool {
        false
    }

    /// Reads the addend stored at the patch site (REL-style formats).
    /// Explicit-addend formats return 0.
    fn implicit_addend(_r_type: u32, _place: &[u8]) -> i64 {
        0
    }

    /// Fixes up addends that are split across paired relocations.
    fn finalize_addends(_records: &mut [RelocationRecord]) {}

    /// Patches one relocation. `ctx.target` is fully resolved.
    fn apply(ctx: &mut PatchContext<'_>, r_type: u32) -> Result<()>;

    /// Writes one trampoline that transfers control to `target`.
    fn emit_stub(buf: &mut [u8], target: usize);

    fn rel_type_to_str(r_type: u32) -> &'static str;
}

/// Stores a resolved address into a GOT slot.
#[inline]
pub(crate) fn write_got_slot(slot: usize, value: usize) {
    unsafe { (slot as *mut usize).write_unaligned(value) };
}

#[inline]
pub(crate) fn write_unaligned<T: Copy>(place: usize, value: T) {
    unsafe { (place as *mut T).write_unaligned(value) };
}
