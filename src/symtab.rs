//! The process-wide symbol table.
//!
//! One [`SymbolTable`] is the single source of truth for every name the
//! engine knows about: definitions supplied by loaded modules, references
//! still waiting for one, seeds taken from the host executable, and manual
//! definitions installed by the embedder. A symbol that is referenced but
//! not defined is ordinary state, tracked by the global undefined counter,
//! never an error.

use crate::{
    Result,
    error::{duplicate_error, state_error},
    module::{Module, ModuleId, SymbolClass},
    os::Mmap,
};
use bitflags::bitflags;
use hashbrown::HashMap;

bitflags! {
    /// State bits of one global symbol table entry.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct SymbolFlags: u8 {
        /// The symbol currently has a definition.
        const DEFINED = 1 << 0;
        /// At least one module (or a manual reference) wants this symbol.
        const REFERENCED = 1 << 1;
        /// The definition came from the binary-file layer itself (the host
        /// executable's table or an OS-loaded shared object) rather than
        /// from relocating a module.
        const FILE_RESOLVED = 1 << 2;
        /// The definition is backed by code.
        const FUNCTION = 1 << 3;
        /// The definition owns a private allocation made by `define_symbol`.
        const PRIVATE_ALLOC = 1 << 4;
        /// The value forwards to another entry instead of being an address.
        const INDIRECT = 1 << 5;
        /// The current definition is weak (used to police duplicates).
        const WEAK = 1 << 6;
    }
}

/// The resolution of a defined symbol.
#[derive(Clone, Debug)]
pub(crate) enum SymbolValue {
    /// A concrete address.
    Absolute(usize),
    /// Forwards to the entry of another name.
    Indirect(String),
}

/// One name in the global table.
#[derive(Debug)]
pub(crate) struct SymbolEntry {
    pub(crate) flags: SymbolFlags,
    pub(crate) value: SymbolValue,
    /// The module owning the current definition; `None` for seeded and
    /// manual definitions. Invariant: at most one defining module.
    pub(crate) defined_by: Option<ModuleId>,
    pub(crate) refcount: u32,
    /// Allocation size recorded when the definition came from merging
    /// common symbols.
    pub(crate) common_size: Option<usize>,
    /// Backing region of a `define_symbol` definition, released on removal.
    pub(crate) private_region: Option<(usize, usize)>,
}

impl SymbolEntry {
    fn new() -> Self {
        SymbolEntry {
            flags: SymbolFlags::empty(),
            value: SymbolValue::Absolute(0),
            defined_by: None,
            refcount: 0,
            common_size: None,
            private_region: None,
        }
    }

    #[inline]
    pub(crate) fn is_defined(&self) -> bool {
        self.flags.contains(SymbolFlags::DEFINED)
    }

    #[inline]
    pub(crate) fn is_function(&self) -> bool {
        self.flags.contains(SymbolFlags::FUNCTION)
    }

    /// True while the entry contributes to the global undefined counter.
    #[inline]
    fn is_pending(&self) -> bool {
        self.flags.contains(SymbolFlags::REFERENCED) && !self.flags.contains(SymbolFlags::DEFINED)
    }

    fn clear_definition(&mut self) {
        self.flags.remove(
            SymbolFlags::DEFINED
                | SymbolFlags::FUNCTION
                | SymbolFlags::FILE_RESOLVED
                | SymbolFlags::INDIRECT
                | SymbolFlags::WEAK
                | SymbolFlags::PRIVATE_ALLOC,
        );
        self.value = SymbolValue::Absolute(0);
        self.defined_by = None;
        self.common_size = None;
        self.private_region = None;
    }
}

/// One reversible mutation performed while registering a module's symbols.
///
/// Removal replays this log backwards so `remove_module_symbols` undoes
/// exactly what `insert_module_symbols` (and the common allocator) did,
/// leaving the table equivalent to its prior state.
#[derive(Debug)]
pub(crate) enum Registration {
    /// The module referenced `name` (one refcount).
    Referenced(String),
    /// The module installed the current definition of `name` (and holds
    /// one refcount for it).
    Defined(String),
}

/// Process-wide map from symbol name to its current resolution state.
pub(crate) struct SymbolTable {
    entries: HashMap<String, SymbolEntry>,
    /// Number of entries that are referenced but undefined.
    undefined: usize,
}

/// Upper bound on indirect-chain hops; longer chains are treated as cyclic.
const MAX_INDIRECT_HOPS: usize = 64;

impl SymbolTable {
    pub(crate) fn new() -> Self {
        SymbolTable {
            entries: HashMap::new(),
            undefined: 0,
        }
    }

    #[inline]
    pub(crate) fn lookup(&self, name: &str) -> Option<&SymbolEntry> {
        self.entries.get(name)
    }

    #[inline]
    pub(crate) fn undefined_count(&self) -> usize {
        self.undefined
    }

    /// Names that are currently referenced but carry no definition.
    pub(crate) fn undefined_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_pending())
            .map(|(n, _)| n.clone())
            .collect();
        names.sort_unstable();
        names
    }

    /// Resolves a name to a terminal address, chasing indirect chains.
    /// The returned entry is the terminal one, so its flags and owner
    /// describe the actual definition.
    ///
    /// Returns `None` for unknown or undefined names, and for chains longer
    /// than [`MAX_INDIRECT_HOPS`] (which can only mean a cycle).
    pub(crate) fn resolve(&self, name: &str) -> Option<(usize, &SymbolEntry)> {
        let mut entry = self.entries.get(name)?;
        for _ in 0..MAX_INDIRECT_HOPS {
            if !entry.is_defined() {
                return None;
            }
            match &entry.value {
                SymbolValue::Absolute(addr) => return Some((*addr, entry)),
                SymbolValue::Indirect(next) => entry = self.entries.get(next)?,
            }
        }
        None
    }

    /// Dedicated pre-pass: rejects a module carrying a non-weak global
    /// definition of a name that already has a non-weak definition. Runs
    /// before any mutation so a failure leaves the table untouched.
    pub(crate) fn check_duplicate_definitions<M: Mmap>(&self, module: &Module<M>) -> Result<()> {
        for sym in &module.symbols {
            if sym.class != SymbolClass::Global {
                continue;
            }
            if let Some(entry) = self.entries.get(&sym.name) {
                if entry.is_defined() && !entry.flags.contains(SymbolFlags::WEAK) {
                    return Err(duplicate_error(&sym.name));
                }
            }
        }
        Ok(())
    }

    /// Registers every non-local, named symbol of `module`, logging each
    /// mutation into `module.registered`.
    ///
    /// Common symbols are registered as plain references here; the common
    /// allocator decides afterwards whether each one becomes a definition
    /// or resolves to storage merged elsewhere.
    pub(crate) fn insert_module_symbols<M: Mmap>(&mut self, module: &mut Module<M>) {
        let id = module.id;
        for idx in 0..module.symbols.len() {
            let sym = &module.symbols[idx];
            match sym.class {
                SymbolClass::Undefined | SymbolClass::Common => {
                    let name = sym.name.clone();
                    self.add_reference(&name, module);
                }
                SymbolClass::Global | SymbolClass::Weak => {
                    let sym = sym.clone();
                    let entry = self
                        .entries
                        .entry(sym.name.clone())
                        .or_insert_with(SymbolEntry::new);
                    entry.refcount += 1;
                    if entry.is_defined() {
                        // First definition wins; this one is ignored.
                        module.registered.push(Registration::Referenced(sym.name));
                        continue;
                    }
                    if entry.is_pending() {
                        self.undefined -= 1;
                    }
                    entry.flags.insert(SymbolFlags::DEFINED);
                    if sym.is_func {
                        entry.flags.insert(SymbolFlags::FUNCTION);
                    }
                    if sym.class == SymbolClass::Weak {
                        entry.flags.insert(SymbolFlags::WEAK);
                    }
                    entry.value = SymbolValue::Absolute(sym.value);
                    entry.defined_by = Some(id);
                    module.registered.push(Registration::Defined(sym.name));
                }
            }
        }
    }

    /// Adds one reference from `module` to `name`, logging it.
    fn add_reference<M: Mmap>(&mut self, name: &str, module: &mut Module<M>) {
        let entry = self
            .entries
            .entry(name.to_owned())
            .or_insert_with(SymbolEntry::new);
        entry.refcount += 1;
        let newly_pending = !entry.is_defined() && !entry.flags.contains(SymbolFlags::REFERENCED);
        entry.flags.insert(SymbolFlags::REFERENCED);
        if newly_pending {
            self.undefined += 1;
        }
        module.refs.push(name.to_owned());
        module
            .registered
            .push(Registration::Referenced(name.to_owned()));
    }

    /// Binds `name` to a freshly allocated common-storage slot owned by
    /// `module`, logging the definition.
    pub(crate) fn define_common<M: Mmap>(
        &mut self,
        name: &str,
        addr: usize,
        size: usize,
        module: &mut Module<M>,
    ) {
        let entry = self
            .entries
            .entry(name.to_owned())
            .or_insert_with(SymbolEntry::new);
        entry.refcount += 1;
        if entry.is_pending() {
            self.undefined -= 1;
        }
        entry.flags.insert(SymbolFlags::DEFINED);
        entry.value = SymbolValue::Absolute(addr);
        entry.defined_by = Some(module.id);
        entry.common_size = Some(size);
        module
            .registered
            .push(Registration::Defined(name.to_owned()));
    }

    /// Replays the registration log backwards, reversing each mutation.
    ///
    /// A definition that other modules still reference persists as
    /// "referenced, undefined"; an entry nobody wants any more is dropped.
    pub(crate) fn remove_module_symbols<M: Mmap>(&mut self, module: &mut Module<M>) {
        for reg in module.registered.drain(..).rev() {
            let name = match &reg {
                Registration::Referenced(n) | Registration::Defined(n) => n.as_str(),
            };
            let Some(entry) = self.entries.get_mut(name) else {
                debug_assert!(false, "registration log names a missing entry");
                continue;
            };
            if let Registration::Defined(_) = reg {
                debug_assert_eq!(entry.defined_by, Some(module.id));
                let was_pending = entry.is_pending();
                entry.clear_definition();
                if !was_pending && entry.is_pending() {
                    self.undefined += 1;
                }
            }
            entry.refcount -= 1;
            let refcount = entry.refcount;
            if refcount == 0 && self.droppable(name) {
                if self.entries[name].is_pending() {
                    self.undefined -= 1;
                }
                self.entries.remove(name);
            }
        }
        module.refs.clear();
    }

    /// An entry with no referencers is kept only while something other than
    /// module bookkeeping still backs it.
    fn droppable(&self, name: &str) -> bool {
        let entry = &self.entries[name];
        !entry.is_defined()
            || !entry
                .flags
                .intersects(SymbolFlags::FILE_RESOLVED | SymbolFlags::PRIVATE_ALLOC)
    }

    /// Seeds one already-resolved definition (host executable or OS loader).
    pub(crate) fn seed(&mut self, name: &str, addr: usize, is_func: bool) {
        let entry = self
            .entries
            .entry(name.to_owned())
            .or_insert_with(SymbolEntry::new);
        if entry.is_defined() {
            return;
        }
        if entry.is_pending() {
            self.undefined -= 1;
        }
        entry
            .flags
            .insert(SymbolFlags::DEFINED | SymbolFlags::FILE_RESOLVED);
        if is_func {
            entry.flags.insert(SymbolFlags::FUNCTION);
        }
        entry.value = SymbolValue::Absolute(addr);
        entry.defined_by = None;
    }

    /// Like [`seed`](Self::seed), but owned by a module (a shared object
    /// loaded through the OS loader) and logged for reversal.
    pub(crate) fn define_file_resolved<M: Mmap>(
        &mut self,
        name: &str,
        addr: usize,
        is_func: bool,
        module: &mut Module<M>,
    ) {
        let entry = self
            .entries
            .entry(name.to_owned())
            .or_insert_with(SymbolEntry::new);
        entry.refcount += 1;
        if entry.is_defined() {
            module
                .registered
                .push(Registration::Referenced(name.to_owned()));
            return;
        }
        if entry.is_pending() {
            self.undefined -= 1;
        }
        entry
            .flags
            .insert(SymbolFlags::DEFINED | SymbolFlags::FILE_RESOLVED);
        if is_func {
            entry.flags.insert(SymbolFlags::FUNCTION);
        }
        entry.value = SymbolValue::Absolute(addr);
        entry.defined_by = Some(module.id);
        module
            .registered
            .push(Registration::Defined(name.to_owned()));
    }

    /// Records a manual reference to `name` (pinning the entry).
    pub(crate) fn create_reference(&mut self, name: &str) {
        let entry = self
            .entries
            .entry(name.to_owned())
            .or_insert_with(SymbolEntry::new);
        entry.refcount += 1;
        let newly_pending = !entry.is_defined() && !entry.flags.contains(SymbolFlags::REFERENCED);
        entry.flags.insert(SymbolFlags::REFERENCED);
        if newly_pending {
            self.undefined += 1;
        }
    }

    /// Installs a synthetic definition backed by a private allocation.
    pub(crate) fn define_private(
        &mut self,
        name: &str,
        addr: usize,
        region_len: usize,
    ) -> Result<()> {
        let entry = self
            .entries
            .entry(name.to_owned())
            .or_insert_with(SymbolEntry::new);
        if entry.is_defined() {
            return Err(duplicate_error(name));
        }
        if entry.is_pending() {
            self.undefined -= 1;
        }
        entry
            .flags
            .insert(SymbolFlags::DEFINED | SymbolFlags::PRIVATE_ALLOC);
        entry.value = SymbolValue::Absolute(addr);
        entry.defined_by = None;
        entry.private_region = Some((addr, region_len));
        Ok(())
    }

    /// Withdraws a definition previously installed with
    /// [`define_private`](Self::define_private) or seeded at `init`.
    /// Returns its private region, if any, for the caller to release.
    pub(crate) fn remove_defined(&mut self, name: &str) -> Result<Option<(usize, usize)>> {
        let Some(entry) = self.entries.get_mut(name) else {
            return Err(state_error(format!("symbol `{name}` is not defined")));
        };
        if !entry.is_defined() {
            return Err(state_error(format!("symbol `{name}` is not defined")));
        }
        if entry.defined_by.is_some() {
            return Err(state_error(format!(
                "symbol `{name}` is owned by a loaded module; unload it instead"
            )));
        }
        let region = entry.private_region.take();
        let was_pending = entry.is_pending();
        entry.clear_definition();
        if !was_pending && entry.is_pending() {
            self.undefined += 1;
        }
        if entry.refcount == 0 && !entry.flags.contains(SymbolFlags::REFERENCED) {
            self.entries.remove(name);
        }
        Ok(region)
    }

    /// Forwards `name` to `target`, making its resolution indirect. The
    /// target need not be defined yet; the chain simply resolves to
    /// nothing until it is.
    pub(crate) fn define_indirect(&mut self, name: &str, target: &str) -> Result<()> {
        let entry = self
            .entries
            .entry(name.to_owned())
            .or_insert_with(SymbolEntry::new);
        if entry.is_defined() {
            return Err(duplicate_error(name));
        }
        if entry.is_pending() {
            self.undefined -= 1;
        }
        entry
            .flags
            .insert(SymbolFlags::DEFINED | SymbolFlags::INDIRECT);
        entry.value = SymbolValue::Indirect(target.to_owned());
        entry.defined_by = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{module::Module, os::DefaultMmap};

    fn module(id: u64) -> Module<DefaultMmap> {
        Module::new_for_tests(ModuleId::from_raw(id))
    }

    #[test]
    fn reference_then_define_clears_undefined_counter() {
        let mut tab = SymbolTable::new();
        tab.create_reference("x");
        assert_eq!(tab.undefined_count(), 1);
        assert_eq!(tab.undefined_names(), vec!["x".to_owned()]);
        tab.seed("x", 0x1000, false);
        assert_eq!(tab.undefined_count(), 0);
        assert_eq!(tab.resolve("x").unwrap().0, 0x1000);
    }

    #[test]
    fn removal_replays_log_exactly() {
        let mut tab = SymbolTable::new();
        let mut m = module(1);
        tab.add_reference("a", &mut m);
        tab.define_common("b", 0x2000, 8, &mut m);
        assert_eq!(tab.undefined_count(), 1);
        tab.remove_module_symbols(&mut m);
        assert_eq!(tab.undefined_count(), 0);
        assert!(tab.lookup("a").is_none());
        assert!(tab.lookup("b").is_none());
    }

    #[test]
    fn definition_survives_removal_while_referenced() {
        let mut tab = SymbolTable::new();
        let mut definer = module(1);
        tab.define_common("z", 0x3000, 4, &mut definer);
        tab.create_reference("z");
        tab.remove_module_symbols(&mut definer);
        let entry = tab.lookup("z").unwrap();
        assert!(!entry.is_defined());
        assert!(entry.flags.contains(SymbolFlags::REFERENCED));
        assert_eq!(tab.undefined_count(), 1);
    }

    #[test]
    fn indirect_chain_resolves_to_terminal_address() {
        let mut tab = SymbolTable::new();
        tab.seed("real", 0xdead0, true);
        tab.define_indirect("alias", "real").unwrap();
        tab.define_indirect("alias2", "alias").unwrap();
        let (addr, entry) = tab.resolve("alias2").unwrap();
        assert_eq!(addr, 0xdead0);
        assert!(entry.is_function());
        assert!(
            tab.lookup("alias")
                .unwrap()
                .flags
                .contains(SymbolFlags::INDIRECT)
        );
        assert!(tab.define_indirect("alias", "real").is_err());
    }

    #[test]
    fn indirect_cycle_resolves_to_none() {
        let mut tab = SymbolTable::new();
        tab.define_indirect("p", "q").unwrap();
        tab.define_indirect("q", "p").unwrap();
        assert!(tab.resolve("p").is_none());
    }

    #[test]
    fn private_definition_rejects_duplicates_and_releases() {
        let mut tab = SymbolTable::new();
        tab.define_private("buf", 0x5000, 64).unwrap();
        assert!(tab.define_private("buf", 0x6000, 64).is_err());
        let region = tab.remove_defined("buf").unwrap();
        assert_eq!(region, Some((0x5000, 64)));
        assert!(tab.lookup("buf").is_none());
    }
}
