//! Loaded-module bookkeeping.
//!
//! A [`Module`] is one relocatable file (or one archive container) that has
//! been mapped into the process. It keeps the mapped image alive, remembers
//! every relocation that crossed a module boundary so the link can be undone
//! and redone, and carries the dependency edges the executability oracle
//! walks.

use crate::{
    Result,
    os::{Mmap, ProtFlags},
    relocation::RelocationRecord,
};
use hashbrown::{HashMap, HashSet};
use std::path::PathBuf;

/// Opaque identity of a loaded module, unique for the lifetime of the
/// engine (ids are never reused).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(u64);

impl ModuleId {
    #[inline]
    pub(crate) fn from_raw(raw: u64) -> Self {
        ModuleId(raw)
    }

}

/// Whether every function a module's code can reach is currently resolved.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Executability {
    /// Not yet computed in the current round.
    #[default]
    Unknown,
    /// Some reachable reference is unresolved; calling in is unsafe.
    No,
    /// All reachable references resolve; safe to call into.
    Yes,
}

/// Binding class of one symbol carried by a module.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SymbolClass {
    Global,
    Weak,
    Undefined,
    Common,
}

/// One symbol as read out of a module's file, with `value` already
/// rebased onto the mapped image.
#[derive(Clone, Debug)]
pub(crate) struct ModuleSymbol {
    pub(crate) name: String,
    pub(crate) class: SymbolClass,
    pub(crate) value: usize,
    pub(crate) size: usize,
    pub(crate) is_func: bool,
}

/// One contiguous anonymous mapping holding everything a module owns:
/// its section bytes, common-storage tail, GOT, and stub table.
///
/// Held behind the module and unmapped on drop through the same [`Mmap`]
/// implementation that created it.
pub(crate) struct ModuleImage<M: Mmap> {
    base: usize,
    len: usize,
    /// Start of the GOT region inside the mapping.
    pub(crate) got_base: usize,
    /// Number of GOT slots reserved.
    pub(crate) got_capacity: usize,
    /// GOT slots handed out so far.
    pub(crate) got_used: usize,
    /// Start of the stub (range-extension trampoline) region.
    pub(crate) stub_base: usize,
    pub(crate) stub_capacity: usize,
    pub(crate) stub_used: usize,
    /// Start of the common-storage tail.
    pub(crate) common_base: usize,
    pub(crate) common_len: usize,
    _marker: core::marker::PhantomData<M>,
}

impl<M: Mmap> ModuleImage<M> {
    /// Wraps a mapping produced by `M::mmap_anonymous`. The caller hands
    /// over ownership; the image unmaps it on drop.
    pub(crate) fn new(
        base: usize,
        len: usize,
        got_base: usize,
        got_capacity: usize,
        stub_base: usize,
        stub_capacity: usize,
        common_base: usize,
        common_len: usize,
    ) -> Self {
        ModuleImage {
            base,
            len,
            got_base,
            got_capacity,
            got_used: 0,
            stub_base,
            stub_capacity,
            stub_used: 0,
            common_base,
            common_len,
            _marker: core::marker::PhantomData,
        }
    }

    /// Makes the whole image readable, writable and executable. Relocation
    /// patches bytes in place at arbitrary times, so the image stays RWX
    /// for its lifetime.
    pub(crate) fn make_executable(&self) -> Result<()> {
        unsafe {
            M::mprotect(
                self.base as _,
                self.len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
            )
        }
    }
}

impl<M: Mmap> Drop for ModuleImage<M> {
    fn drop(&mut self) {
        unsafe {
            // Nothing useful to do with an unmap failure during teardown.
            let _ = M::munmap(self.base as _, self.len);
        }
    }
}

/// One loaded module: a relocatable file, an archive container, or an
/// OS-loaded shared object held for its dynamic symbols.
pub(crate) struct Module<M: Mmap> {
    pub(crate) id: ModuleId,
    /// Path the module was loaded from; synthetic names like `<bytes>` for
    /// in-memory loads.
    pub(crate) path: PathBuf,
    /// Archive container this module is a member of, if any.
    pub(crate) parent: Option<ModuleId>,
    /// Member modules, when this module is an archive container.
    pub(crate) members: Vec<ModuleId>,
    pub(crate) is_archive: bool,
    /// Handle returned by the OS loader for `dlopen`-style loads.
    pub(crate) dl_handle: Option<*mut core::ffi::c_void>,
    pub(crate) image: Option<ModuleImage<M>>,
    pub(crate) symbols: Vec<ModuleSymbol>,
    /// Every relocation crossing out of this module, kept for re-apply
    /// and undo.
    pub(crate) relocs: Vec<RelocationRecord>,
    /// Names this module references (for the resolution pass).
    pub(crate) refs: Vec<String>,
    /// Registration log consumed by symbol-table removal.
    pub(crate) registered: Vec<crate::symtab::Registration>,
    /// Names this module references that currently have no definition.
    pub(crate) unresolved: HashSet<String>,
    /// Modules whose definitions this module's relocations bind to.
    pub(crate) uses: HashSet<ModuleId>,
    /// Modules with relocations bound into this one.
    pub(crate) used_by: HashSet<ModuleId>,
    pub(crate) executable: Executability,
    /// When false, `unload_*` refuses to remove this module.
    pub(crate) unloadable: bool,
    /// Bytes of common storage handed out so far.
    pub(crate) common_used: usize,
    /// GOT slot assigned per (symbol, addend), for slot reuse.
    pub(crate) got_map: HashMap<(String, i64), usize>,
    /// Trampoline assigned per target address, for stub reuse.
    pub(crate) stub_map: HashMap<usize, usize>,
}

// The raw dl_handle pointer is only ever passed back to dlclose.
unsafe impl<M: Mmap> Send for Module<M> {}

impl<M: Mmap> Module<M> {
    pub(crate) fn new(id: ModuleId, path: PathBuf) -> Self {
        Module {
            id,
            path,
            parent: None,
            members: Vec::new(),
            is_archive: false,
            dl_handle: None,
            image: None,
            symbols: Vec::new(),
            relocs: Vec::new(),
            refs: Vec::new(),
            registered: Vec::new(),
            unresolved: HashSet::new(),
            uses: HashSet::new(),
            used_by: HashSet::new(),
            executable: Executability::Unknown,
            unloadable: true,
            common_used: 0,
            got_map: HashMap::new(),
            stub_map: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_tests(id: ModuleId) -> Self {
        Module::new(id, PathBuf::from("<test>"))
    }

    /// Carves `size` bytes (aligned to `align`) out of the common tail.
    /// Returns the absolute address, or `None` when the tail is exhausted.
    pub(crate) fn alloc_common(&mut self, size: usize, align: usize) -> Option<usize> {
        let image = self.image.as_mut()?;
        let start = crate::os::roundup(image.common_base + self.common_used, align);
        let end = start.checked_add(size)?;
        if end > image.common_base + image.common_len {
            return None;
        }
        self.common_used = end - image.common_base;
        Some(start)
    }
}
