//! # dynld
//!
//! **dynld** is an in-process dynamic linking engine. It loads relocatable
//! object files (`.o`) and static archives (`.a`) into an already-running
//! process, resolves their symbols against a process-wide table, applies
//! CPU/ABI-specific relocations, and tracks for every loaded unit whether its
//! code is currently safe to call.
//!
//! Unlike a conventional `dlopen`, the engine links incrementally: a module
//! may be loaded while some of its symbols are still undefined, become
//! executable once a later module (or an archive member pulled in lazily)
//! supplies the missing definitions, and lose executability again when a
//! dependency is unloaded. Unloading is order-independent: the engine removes
//! the unit's symbols, re-resolves every dependent, undoes relocations whose
//! targets disappeared, and recomputes executability for the remaining set.
//!
//! ## Core Features
//!
//! * **🔁 Incremental linking**: load, unload and reload object files in any
//!   order while the host process keeps running.
//! * **📚 Lazy archive resolution**: only the archive members that satisfy a
//!   currently-undefined symbol are pulled into the link.
//! * **🧭 Executability tracking**: per-module tri-state computed over the
//!   dependency graph, with hooks fired on every change.
//! * **🧩 GOT & trampoline synthesis**: position-independent references get a
//!   synthesized Global Offset Table; range-limited calls fall back to
//!   generated jump stubs.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dynld::Linker;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut linker = Linker::new();
//!     linker.init(&std::env::current_exe()?.to_string_lossy())?;
//!
//!     let module = linker.link("plugin.o")?;
//!     if linker.is_function_executable("plugin_entry") {
//!         let addr = linker.get_function_symbol("plugin_entry").unwrap();
//!         let entry: extern "C" fn() = unsafe { core::mem::transmute(addr) };
//!         entry();
//!     }
//!     linker.unload_by_file("plugin.o", false)?;
//!     let _ = module;
//!     Ok(())
//! }
//! ```
#![warn(
    clippy::unnecessary_wraps,
    clippy::unnecessary_lazy_evaluations,
    clippy::collapsible_if,
    clippy::cast_lossless,
    clippy::explicit_iter_loop,
    clippy::manual_assert,
    clippy::needless_question_mark,
    clippy::needless_return,
    clippy::redundant_clone,
    clippy::redundant_else,
    clippy::redundant_static_lifetimes
)]
#![allow(clippy::len_without_is_empty, clippy::unnecessary_cast)]

/// Compile-time check for supported architectures
#[cfg(not(any(target_arch = "x86_64", target_arch = "mips", target_arch = "mips64")))]
compile_error!("Unsupported target architecture. Supported architectures: x86_64, mips, mips64");

#[cfg(not(unix))]
compile_error!("dynld links against the host process image and requires a unix target");

pub mod arch;
mod archive;
mod common;
mod deps;
mod error;
pub mod linker;
mod loader;
mod module;
pub mod os;
mod relocation;
mod symtab;

pub use error::Error;
pub use linker::{
    DlOpenMode, ExecutabilityHandler, Linker, LinkerHooks, LinkerOptions, UnloadHandler,
};
pub use module::{Executability, ModuleId};

/// A type alias for `Result`s returned by `dynld` functions.
///
/// This is a convenience alias that eliminates the need to repeatedly specify
/// the `Error` type in function signatures.
pub type Result<T> = core::result::Result<T, Error>;
