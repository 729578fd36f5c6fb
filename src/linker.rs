//! The linking engine: the public face of the crate.
//!
//! A [`Linker`] owns the global symbol table and every loaded module, and
//! serializes all mutation through `&mut self`. Each public entry point is
//! transactional: on failure the partial registration is rolled back, the
//! message is recorded for [`Linker::last_error`], and the error returned.
//!
//! The load pipeline for one module runs: parse and map (loader), duplicate
//! pre-check, symbol registration, common allocation, fixed-target
//! relocation, then a global relink that binds every named relocation in
//! every module, rebuilds dependency edges, and recomputes executability.

use crate::{
    Result, archive, common, deps,
    error::{format_error, io_error, state_error},
    loader,
    module::{Executability, Module, ModuleId, ModuleImage},
    os::{Mmap, PAGE_SIZE, ProtFlags, roundup},
};
use crate::{
    arch::Relocator,
    relocation::{ArchReloc, PatchContext, RelocTarget, StubTable, write_got_slot},
};
use hashbrown::{HashMap, HashSet};
use std::{
    ffi::{CStr, CString},
    path::{Path, PathBuf},
};

use crate::os::DefaultMmap;

/// Binding discipline passed through to the OS loader by
/// [`Linker::dlopen_compat`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DlOpenMode {
    /// Resolve lazily (`RTLD_LAZY`).
    Lazy,
    /// Resolve everything up front (`RTLD_NOW`).
    Now,
}

/// Tunables fixed at construction.
#[derive(Clone, Debug, Default)]
pub struct LinkerOptions {
    /// Judge executability from a module's own references only, skipping
    /// the transitive walk. Off by default; matches the behavior of older
    /// tools that never looked past one level.
    pub shallow_executability: bool,
}

/// Handler invoked when a module's executability verdict changes.
pub trait ExecutabilityHandler {
    fn call(&mut self, id: ModuleId, path: &Path, state: Executability);
}

impl<F> ExecutabilityHandler for F
where
    F: FnMut(ModuleId, &Path, Executability),
{
    fn call(&mut self, id: ModuleId, path: &Path, state: Executability) {
        self(id, path, state)
    }
}

/// Handler invoked just before a module is removed.
pub trait UnloadHandler {
    fn call(&mut self, id: ModuleId, path: &Path);
}

impl<F> UnloadHandler for F
where
    F: FnMut(ModuleId, &Path),
{
    fn call(&mut self, id: ModuleId, path: &Path) {
        self(id, path)
    }
}

/// Observation points. All hooks default to no-ops.
#[derive(Default)]
pub struct LinkerHooks {
    executability: Option<Box<dyn ExecutabilityHandler>>,
    unloading: Option<Box<dyn UnloadHandler>>,
}

impl LinkerHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires after every recompute, once per module whose verdict moved.
    pub fn executability_changed(mut self, handler: impl ExecutabilityHandler + 'static) -> Self {
        self.executability = Some(Box::new(handler));
        self
    }

    /// Fires before a module's symbols and image are torn down.
    pub fn module_unloading(mut self, handler: impl UnloadHandler + 'static) -> Self {
        self.unloading = Some(Box::new(handler));
        self
    }
}

/// The in-process dynamic linking engine.
pub struct Linker<M: Mmap = DefaultMmap> {
    options: LinkerOptions,
    hooks: LinkerHooks,
    symtab: crate::symtab::SymbolTable,
    modules: HashMap<ModuleId, Module<M>>,
    next_id: u64,
    initialized: bool,
    last_error: Option<String>,
}

impl Default for Linker<DefaultMmap> {
    fn default() -> Self {
        Self::new()
    }
}

impl Linker<DefaultMmap> {
    /// An engine with default options, backed by plain `mmap`.
    pub fn new() -> Self {
        Linker::with_options(LinkerOptions::default())
    }
}

impl<M: Mmap> Linker<M> {
    pub fn with_options(options: LinkerOptions) -> Self {
        Linker::with_hooks(options, LinkerHooks::default())
    }

    pub fn with_hooks(options: LinkerOptions, hooks: LinkerHooks) -> Self {
        Linker {
            options,
            hooks,
            symtab: crate::symtab::SymbolTable::new(),
            modules: HashMap::new(),
            next_id: 1,
            initialized: false,
            last_error: None,
        }
    }

    /// Seeds the symbol table from the running program's own image.
    ///
    /// `program_path` must name the executable this process is running;
    /// addresses are rebased by the load bias the kernel reports through
    /// the auxiliary vector, so position-independent executables work.
    /// Call at most once, before anything is linked.
    pub fn init(&mut self, program_path: &str) -> Result<()> {
        let r = self.init_inner(program_path);
        self.seal(r)
    }

    fn init_inner(&mut self, program_path: &str) -> Result<()> {
        if self.initialized || !self.modules.is_empty() {
            return Err(state_error("init must run first, and only once"));
        }
        let bytes = std::fs::read(program_path)
            .map_err(|e| io_error(format!("{program_path}: {e}")))?;
        let file = object::File::parse(bytes.as_slice())
            .map_err(|e| format_error(format!("{program_path}: {e}")))?;
        let bias = load_bias(&file);
        use object::{Object, ObjectSymbol};
        let mut seeded = 0usize;
        for sym in file.symbols().chain(file.dynamic_symbols()) {
            if sym.is_local() || !sym.is_definition() {
                continue;
            }
            let Ok(name) = sym.name() else { continue };
            if name.is_empty() {
                continue;
            }
            self.symtab.seed(
                name,
                bias.wrapping_add(sym.address() as usize),
                sym.kind() == object::SymbolKind::Text,
            );
            seeded += 1;
        }
        self.initialized = true;
        log::debug!("seeded {seeded} symbols from {program_path} (bias {bias:#x})");
        Ok(())
    }

    /// Links one relocatable object or static archive from disk.
    pub fn link(&mut self, path: &str) -> Result<ModuleId> {
        let r = self.link_inner(path);
        self.seal(r)
    }

    fn link_inner(&mut self, path: &str) -> Result<ModuleId> {
        let bytes =
            std::fs::read(path).map_err(|e| io_error(format!("{path}: {e}")))?;
        self.link_bytes_inner(PathBuf::from(path), &bytes)
    }

    /// Links from memory; `name` stands in for the path everywhere.
    pub fn link_bytes(&mut self, name: &str, bytes: &[u8]) -> Result<ModuleId> {
        let r = self.link_bytes_inner(PathBuf::from(name), bytes);
        self.seal(r)
    }

    fn link_bytes_inner(&mut self, path: PathBuf, bytes: &[u8]) -> Result<ModuleId> {
        if archive::is_archive(bytes) {
            self.link_archive(path, bytes)
        } else {
            let id = self.alloc_id();
            let module = loader::load_object(id, path, bytes)?;
            let id = self.register_module(module)?;
            self.finish_or_rollback(id)?;
            Ok(id)
        }
    }

    fn link_archive(&mut self, path: PathBuf, bytes: &[u8]) -> Result<ModuleId> {
        let members = archive::parse_members(&path, bytes)?;
        let container_id = self.alloc_id();
        let mut container = Module::new(container_id, path.clone());
        container.is_archive = true;
        self.modules.insert(container_id, container);

        // Fixed point: pull any member defining a currently-undefined name,
        // then rescan, since a pulled member brings references of its own.
        let mut pulled = vec![false; members.len()];
        loop {
            let undefined: HashSet<String> =
                self.symtab.undefined_names().into_iter().collect();
            if undefined.is_empty() {
                break;
            }
            let next = members.iter().enumerate().position(|(i, m)| {
                !pulled[i] && m.defines.iter().any(|d| undefined.contains(d))
            });
            let Some(i) = next else { break };
            pulled[i] = true;
            let member = &members[i];
            let id = self.alloc_id();
            let member_path = PathBuf::from(format!("{}({})", path.display(), member.name));
            let result = loader::load_object(id, member_path, &member.data)
                .and_then(|mut module| {
                    module.parent = Some(container_id);
                    self.register_module(module)
                });
            match result {
                Ok(id) => {
                    if let Some(container) = self.modules.get_mut(&container_id) {
                        container.members.push(id);
                    }
                    log::debug!("pulled archive member {}", member.name);
                }
                Err(e) => {
                    self.rollback(container_id);
                    return Err(e);
                }
            }
        }
        self.finish_or_rollback(container_id)?;
        Ok(container_id)
    }

    /// Loads a shared object through the OS loader and adopts its exported
    /// symbols as file-resolved definitions.
    pub fn dlopen_compat(&mut self, path: &str, mode: DlOpenMode) -> Result<ModuleId> {
        let r = self.dlopen_inner(path, mode);
        self.seal(r)
    }

    fn dlopen_inner(&mut self, path: &str, mode: DlOpenMode) -> Result<ModuleId> {
        let cpath = CString::new(path)
            .map_err(|_| format_error(format!("{path}: path contains NUL")))?;
        let flags = match mode {
            DlOpenMode::Lazy => libc::RTLD_LAZY,
            DlOpenMode::Now => libc::RTLD_NOW,
        } | libc::RTLD_GLOBAL;
        let handle = unsafe { libc::dlopen(cpath.as_ptr(), flags) };
        if handle.is_null() {
            return Err(io_error(format!("{path}: {}", dlerror_message())));
        }
        // `path` may be a bare soname the loader found on its search path;
        // ask where the object actually came from before reading it back.
        let origin = dl_origin(handle).unwrap_or_else(|| PathBuf::from(path));
        let bytes = match std::fs::read(&origin) {
            Ok(b) => b,
            Err(e) => {
                unsafe { libc::dlclose(handle) };
                return Err(io_error(format!("{}: {e}", origin.display())));
            }
        };
        let id = self.alloc_id();
        let mut module = Module::new(id, PathBuf::from(path));
        module.dl_handle = Some(handle);
        if let Err(e) = adopt_dynamic_symbols(&mut module, &bytes, handle, &mut self.symtab) {
            self.symtab.remove_module_symbols(&mut module);
            unsafe { libc::dlclose(handle) };
            return Err(e);
        }
        self.modules.insert(id, module);
        self.finish_or_rollback(id)?;
        Ok(id)
    }

    /// Unloads the module loaded from `path`. A soft unload (`hard ==
    /// false`) refuses while other modules still bind into it; a hard
    /// unload proceeds, leaving their references undefined and their code
    /// non-executable.
    pub fn unload_by_file(&mut self, path: &str, hard: bool) -> Result<()> {
        let r = self
            .module_by_path(path)
            .ok_or_else(|| state_error(format!("no module loaded from `{path}`")))
            .and_then(|id| self.unload_checked(id, hard));
        self.seal(r)
    }

    /// Unloads the module that currently defines `name`.
    pub fn unload_by_symbol(&mut self, name: &str, hard: bool) -> Result<()> {
        let r = self
            .symtab
            .lookup(name)
            .and_then(|e| e.defined_by)
            .ok_or_else(|| state_error(format!("no loaded module defines `{name}`")))
            .and_then(|id| self.unload_checked(id, hard));
        self.seal(r)
    }

    fn unload_checked(&mut self, id: ModuleId, hard: bool) -> Result<()> {
        let Some(module) = self.modules.get(&id) else {
            return Err(state_error("module is not loaded"));
        };
        if !module.unloadable {
            return Err(state_error(format!(
                "{} is pinned non-unloadable",
                module.path.display()
            )));
        }
        if !hard {
            let family: HashSet<ModuleId> = module
                .members
                .iter()
                .copied()
                .chain([id])
                .chain(module.parent)
                .collect();
            let in_use = family.iter().any(|mid| {
                self.modules
                    .get(mid)
                    .is_some_and(|m| m.used_by.iter().any(|u| !family.contains(u)))
            });
            if in_use {
                return Err(state_error(format!(
                    "{} is still in use; unload dependents first or force a hard unload",
                    module.path.display()
                )));
            }
        }
        self.unload_internal(id);
        self.finish_link()
    }

    /// Tears a module (and, for containers, its members) out of the engine
    /// without the closing relink. Shared with rollback.
    fn unload_internal(&mut self, id: ModuleId) {
        let mut ids: Vec<ModuleId> = Vec::new();
        if let Some(m) = self.modules.get(&id) {
            ids.extend(m.members.iter().copied());
        }
        ids.push(id);
        for mid in ids {
            let Some(mut module) = self.modules.remove(&mid) else {
                continue;
            };
            // A member unloaded on its own must not linger in its
            // container's member list.
            if let Some(pid) = module.parent {
                if let Some(parent) = self.modules.get_mut(&pid) {
                    parent.members.retain(|&m| m != mid);
                }
            }
            if let Some(h) = self.hooks.unloading.as_mut() {
                h.call(mid, &module.path);
            }
            log::debug!("unloading {}", module.path.display());
            self.symtab.remove_module_symbols(&mut module);
            if let Some(handle) = module.dl_handle.take() {
                unsafe { libc::dlclose(handle) };
            }
            // Dropping the module unmaps its image.
        }
    }

    /// Address of a data definition, chasing indirect chains.
    pub fn get_data_symbol(&self, name: &str) -> Option<usize> {
        let (addr, entry) = self.symtab.resolve(name)?;
        (!entry.is_function()).then_some(addr)
    }

    /// Address of a function definition, chasing indirect chains. The
    /// address is returned whether or not the owning module is currently
    /// executable; gate calls with [`Linker::is_function_executable`].
    pub fn get_function_symbol(&self, name: &str) -> Option<usize> {
        let (addr, entry) = self.symtab.resolve(name)?;
        entry.is_function().then_some(addr)
    }

    /// Names that are referenced somewhere but defined nowhere.
    pub fn list_undefined_symbols(&self) -> Vec<String> {
        self.symtab.undefined_names()
    }

    /// Size of [`Linker::list_undefined_symbols`] without building it.
    pub fn undefined_count(&self) -> usize {
        self.symtab.undefined_count()
    }

    /// Whether calling through `name` is currently safe: the name resolves
    /// to a function whose owning module (if any) is executable.
    pub fn is_function_executable(&self, name: &str) -> bool {
        let Some((_, entry)) = self.symtab.resolve(name) else {
            return false;
        };
        if !entry.is_function() {
            return false;
        }
        match entry.defined_by {
            Some(id) => self
                .modules
                .get(&id)
                .is_some_and(|m| m.executable == Executability::Yes),
            // Seeded and manual definitions live outside the module graph.
            None => true,
        }
    }

    /// Registers interest in `name` so its table entry is created (and
    /// counted undefined) before any module mentions it.
    pub fn create_reference(&mut self, name: &str) {
        self.symtab.create_reference(name);
    }

    /// Defines `name` as a fresh zero-filled allocation of at least `size`
    /// bytes and binds every pending reference to it.
    pub fn define_symbol(&mut self, name: &str, size: usize) -> Result<usize> {
        let r = self.define_symbol_inner(name, size);
        self.seal(r)
    }

    fn define_symbol_inner(&mut self, name: &str, size: usize) -> Result<usize> {
        let len = roundup(size.max(1), PAGE_SIZE);
        let addr = unsafe {
            M::mmap_anonymous(len, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE)? as usize
        };
        if let Err(e) = self.symtab.define_private(name, addr, len) {
            unsafe {
                let _ = M::munmap(addr as _, len);
            }
            return Err(e);
        }
        self.finish_link()?;
        Ok(addr)
    }

    /// Defines `name` as an indirect symbol forwarding to `target`.
    /// Lookups chase the chain to the terminal definition; if `target` is
    /// (or becomes) undefined, `name` resolves to nothing with it.
    pub fn define_symbol_alias(&mut self, name: &str, target: &str) -> Result<()> {
        let r = self
            .symtab
            .define_indirect(name, target)
            .and_then(|()| self.finish_link());
        self.seal(r)
    }

    /// Withdraws a definition installed by [`Linker::define_symbol`] (or
    /// seeded at [`Linker::init`]); references revert to undefined and
    /// dependents are relinked.
    pub fn remove_defined_symbol(&mut self, name: &str) -> Result<()> {
        let r = self.remove_defined_inner(name);
        self.seal(r)
    }

    fn remove_defined_inner(&mut self, name: &str) -> Result<()> {
        let region = self.symtab.remove_defined(name)?;
        if let Some((addr, len)) = region {
            unsafe {
                let _ = M::munmap(addr as _, len);
            }
        }
        self.finish_link()
    }

    /// Human-readable record of the most recent failure, kept until the
    /// next one replaces it.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Pins (or unpins) a module against unloading. Unknown ids are
    /// ignored.
    pub fn set_unloadable(&mut self, id: ModuleId, unloadable: bool) {
        if let Some(m) = self.modules.get_mut(&id) {
            m.unloadable = unloadable;
        }
    }

    /// The module loaded from exactly `path`, if any.
    pub fn module_by_path(&self, path: &str) -> Option<ModuleId> {
        self.modules
            .iter()
            .find(|(_, m)| m.path == Path::new(path))
            .map(|(&id, _)| id)
    }

    /// Every loaded module with its current verdict, in id order.
    pub fn modules(&self) -> Vec<(ModuleId, &Path, Executability)> {
        let mut out: Vec<_> = self
            .modules
            .values()
            .map(|m| (m.id, m.path.as_path(), m.executable))
            .collect();
        out.sort_unstable_by_key(|(id, _, _)| *id);
        out
    }

    /// Current verdict for one module.
    pub fn executability(&self, id: ModuleId) -> Option<Executability> {
        self.modules.get(&id).map(|m| m.executable)
    }

    fn alloc_id(&mut self) -> ModuleId {
        let id = ModuleId::from_raw(self.next_id);
        self.next_id += 1;
        id
    }

    /// Runs the shared-state part of the load pipeline. On error the
    /// module's registrations are reversed and the module dropped.
    fn register_module(&mut self, mut module: Module<M>) -> Result<ModuleId> {
        self.symtab.check_duplicate_definitions(&module)?;
        self.symtab.insert_module_symbols(&mut module);
        let staged = common::allocate_commons(&mut module, &mut self.symtab)
            .and_then(|()| apply_fixed_relocations(&mut module));
        if let Err(e) = staged {
            self.symtab.remove_module_symbols(&mut module);
            return Err(e);
        }
        let id = module.id;
        self.modules.insert(id, module);
        Ok(id)
    }

    /// Closing phase of every link: global relink plus recompute. A
    /// failure unloads the unit that triggered it before propagating.
    fn finish_or_rollback(&mut self, id: ModuleId) -> Result<()> {
        if let Err(e) = self.finish_link() {
            self.rollback(id);
            return Err(e);
        }
        Ok(())
    }

    fn rollback(&mut self, id: ModuleId) {
        self.unload_internal(id);
        if let Err(e) = self.finish_link() {
            // Nothing left to unload; the message is still recorded.
            log::warn!("relink after rollback failed: {e}");
        }
    }

    fn finish_link(&mut self) -> Result<()> {
        self.relink_all()?;
        self.recompute_executability();
        Ok(())
    }

    /// Re-resolves every named relocation in every module: stale bindings
    /// are undone, resolvable ones (re)applied, dependency edges rebuilt.
    fn relink_all(&mut self) -> Result<()> {
        let symtab = &self.symtab;
        for module in self.modules.values_mut() {
            relink_module(module, symtab)?;
        }
        let edges: Vec<(ModuleId, ModuleId)> = self
            .modules
            .iter()
            .flat_map(|(&user, m)| m.uses.iter().map(move |&dep| (user, dep)))
            .collect();
        for module in self.modules.values_mut() {
            module.used_by.clear();
        }
        for (user, dep) in edges {
            if let Some(m) = self.modules.get_mut(&dep) {
                m.used_by.insert(user);
            }
        }
        Ok(())
    }

    fn recompute_executability(&mut self) {
        let changes = deps::recompute(&mut self.modules, self.options.shallow_executability);
        for (id, old, new) in changes {
            let Some(module) = self.modules.get(&id) else {
                continue;
            };
            log::debug!(
                "{}: executability {old:?} -> {new:?}",
                module.path.display()
            );
            let path = module.path.clone();
            if let Some(h) = self.hooks.executability.as_mut() {
                h.call(id, &path, new);
            }
        }
    }

    fn seal<T>(&mut self, r: Result<T>) -> Result<T> {
        if let Err(e) = &r {
            self.last_error = Some(e.to_string());
        }
        r
    }
}

/// Load bias of the running program: where the kernel actually put the
/// entry point versus where the file says it is. Zero for fixed-address
/// executables.
fn load_bias(file: &object::File<'_>) -> usize {
    use object::Object;
    #[cfg(target_os = "linux")]
    {
        let runtime_entry = unsafe { libc::getauxval(libc::AT_ENTRY) } as usize;
        if runtime_entry != 0 && file.entry() != 0 {
            return runtime_entry.wrapping_sub(file.entry() as usize);
        }
    }
    let _ = file;
    0
}

/// Filesystem path the OS loader resolved a handle from, via the link map.
#[cfg(target_os = "linux")]
fn dl_origin(handle: *mut core::ffi::c_void) -> Option<PathBuf> {
    #[repr(C)]
    struct LinkMapHead {
        l_addr: usize,
        l_name: *const libc::c_char,
    }
    let mut map: *mut LinkMapHead = core::ptr::null_mut();
    let rc = unsafe {
        libc::dlinfo(
            handle,
            libc::RTLD_DI_LINKMAP,
            (&raw mut map).cast::<core::ffi::c_void>(),
        )
    };
    if rc != 0 || map.is_null() {
        return None;
    }
    let name = unsafe { (*map).l_name };
    if name.is_null() {
        return None;
    }
    let name = unsafe { CStr::from_ptr(name) }.to_string_lossy();
    (!name.is_empty()).then(|| PathBuf::from(name.into_owned()))
}

#[cfg(not(target_os = "linux"))]
fn dl_origin(_handle: *mut core::ffi::c_void) -> Option<PathBuf> {
    None
}

fn dlerror_message() -> String {
    let msg = unsafe { libc::dlerror() };
    if msg.is_null() {
        "dlopen failed".to_owned()
    } else {
        unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
    }
}

/// Registers every exported definition of an OS-loaded shared object,
/// taking addresses from `dlsym` so interposition and lazy binding both
/// behave exactly as the OS loader decides.
fn adopt_dynamic_symbols<M: Mmap>(
    module: &mut Module<M>,
    bytes: &[u8],
    handle: *mut core::ffi::c_void,
    symtab: &mut crate::symtab::SymbolTable,
) -> Result<()> {
    use object::{Object, ObjectSymbol};
    let file = object::File::parse(bytes)
        .map_err(|e| format_error(format!("{}: {e}", module.path.display())))?;
    for sym in file.dynamic_symbols() {
        if sym.is_local() || !sym.is_definition() {
            continue;
        }
        let Ok(name) = sym.name() else { continue };
        if name.is_empty() {
            continue;
        }
        let cname = match CString::new(name) {
            Ok(c) => c,
            Err(_) => continue,
        };
        let addr = unsafe { libc::dlsym(handle, cname.as_ptr()) };
        if addr.is_null() {
            continue;
        }
        symtab.define_file_resolved(
            name,
            addr as usize,
            sym.kind() == object::SymbolKind::Text,
            module,
        );
    }
    Ok(())
}

/// Applies every fixed-target (local) relocation of a freshly loaded
/// module. These never change afterwards and are never undone.
fn apply_fixed_relocations<M: Mmap>(module: &mut Module<M>) -> Result<()> {
    let Module {
        relocs,
        image,
        got_map,
        stub_map,
        ..
    } = module;
    let Some(image) = image.as_mut() else {
        return Ok(());
    };
    for rec in relocs.iter_mut() {
        let addr = match &rec.target {
            RelocTarget::Fixed(a) => *a,
            RelocTarget::Named(_) => continue,
        };
        apply_record(image, got_map, stub_map, rec, addr)?;
    }
    Ok(())
}

/// Re-resolves one module's named relocations against the current table.
/// Rebuilds `uses` and `unresolved` from scratch, so the result is the
/// same whether this is the first link or the twentieth relink.
fn relink_module<M: Mmap>(
    module: &mut Module<M>,
    symtab: &crate::symtab::SymbolTable,
) -> Result<()> {
    let own = module.id;
    let Module {
        relocs,
        image,
        got_map,
        stub_map,
        unresolved,
        uses,
        refs,
        ..
    } = module;
    unresolved.clear();
    uses.clear();
    let Some(image) = image.as_mut() else {
        // Containers and OS-loaded objects carry no patchable image, but
        // their reference lists still feed the undefined bookkeeping.
        for name in refs.iter() {
            if symtab.resolve(name).is_none() {
                unresolved.insert(name.clone());
            }
        }
        return Ok(());
    };
    for rec in relocs.iter_mut() {
        let name = match &rec.target {
            RelocTarget::Named(n) => n.clone(),
            RelocTarget::Fixed(_) => continue,
        };
        match symtab.resolve(&name) {
            Some((addr, entry)) => {
                apply_record(image, got_map, stub_map, rec, addr)?;
                if let Some(def) = entry.defined_by {
                    if def != own {
                        uses.insert(def);
                    }
                }
            }
            None => {
                rec.undo();
                unresolved.insert(name);
            }
        }
    }
    Ok(())
}

/// Patches one record against a resolved target. Idempotent for an
/// unchanged target; a moved target is undone first so the patch always
/// computes from pristine bytes.
fn apply_record<M: Mmap>(
    image: &mut ModuleImage<M>,
    got_map: &mut HashMap<(String, i64), usize>,
    stub_map: &mut HashMap<usize, usize>,
    rec: &mut crate::relocation::RelocationRecord,
    target: usize,
) -> Result<()> {
    if rec.applied && rec.bound_to == Some(target) {
        return Ok(());
    }
    rec.restore_for_apply();
    rec.applied = false;
    if Relocator::wants_got(rec.r_type) && rec.got_slot.is_none() {
        let key = match &rec.target {
            RelocTarget::Named(n) => {
                let addend = if Relocator::got_key_addend(rec.r_type) {
                    rec.addend
                } else {
                    0
                };
                (n.clone(), addend)
            }
            RelocTarget::Fixed(a) => (String::new(), *a as i64),
        };
        rec.got_slot = Some(alloc_got_slot(image, got_map, key)?);
    }
    if let Some(slot) = rec.got_slot {
        write_got_slot(slot, target);
    }
    let mut ctx = PatchContext {
        place: rec.place,
        target,
        addend: rec.addend,
        got_slot: rec.got_slot,
        got_pointer: got_pointer(image),
        stubs: Some(StubTable {
            base: image.stub_base,
            capacity: image.stub_capacity,
            entry_size: <Relocator as ArchReloc>::STUB_ENTRY_SIZE.max(1),
            used: &mut image.stub_used,
            map: stub_map,
        }),
    };
    Relocator::apply(&mut ctx, rec.r_type)?;
    rec.applied = true;
    rec.bound_to = Some(target);
    Ok(())
}

fn alloc_got_slot<M: Mmap>(
    image: &mut ModuleImage<M>,
    got_map: &mut HashMap<(String, i64), usize>,
    key: (String, i64),
) -> Result<usize> {
    if let Some(&slot) = got_map.get(&key) {
        return Ok(slot);
    }
    if image.got_used >= image.got_capacity {
        return Err(crate::error::got_error("GOT is full"));
    }
    let slot = image.got_base + image.got_used * core::mem::size_of::<usize>();
    image.got_used += 1;
    got_map.insert(key, slot);
    Ok(slot)
}

#[cfg(any(target_arch = "mips", target_arch = "mips64"))]
fn got_pointer<M: Mmap>(image: &ModuleImage<M>) -> usize {
    image.got_base + crate::arch::GP_OFFSET
}

#[cfg(target_arch = "x86_64")]
fn got_pointer<M: Mmap>(_image: &ModuleImage<M>) -> usize {
    0
}
