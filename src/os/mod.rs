//! Operating system and memory-allocation abstractions.
//!
//! The engine hands out writable+executable memory regions for loaded code
//! through the [`Mmap`] trait. The default implementation delegates to the
//! OS mapping primitive; [`ArenaMmap`] is an alternate implementation that
//! serves allocations from a pre-reserved low-address region, for targets
//! whose PC-relative reach restricts where executable code may live.

use crate::Result;
use bitflags::bitflags;
use core::ffi::{c_int, c_void};

bitflags! {
    #[derive(Clone, Copy, Debug, Default)]
    /// Memory protection flags for controlling access permissions.
    ///
    /// These flags determine what operations can be performed on a mapped
    /// memory region. They can be combined using bitwise OR operations.
    pub struct ProtFlags: c_int {
        /// No access allowed. Useful for reserving address space.
        const PROT_NONE = 0;

        /// Allow reading from the memory region.
        const PROT_READ = 1;

        /// Allow writing to the memory region.
        const PROT_WRITE = 2;

        /// Allow executing code in the memory region.
        const PROT_EXEC = 4;
    }
}

bitflags! {
    #[derive(Clone, Copy)]
    /// Memory mapping configuration flags.
    pub struct MapFlags: c_int {
        /// Create a private copy-on-write mapping.
        const MAP_PRIVATE = 2;

        /// Place the mapping at exactly the specified address.
        const MAP_FIXED = 16;

        /// Create an anonymous mapping not backed by any file.
        const MAP_ANONYMOUS = 32;
    }
}

/// Low-level memory allocation interface used for module images, trampoline
/// stubs and private symbol storage.
///
/// Implementations must return zero-filled memory from
/// [`mmap_anonymous`](Mmap::mmap_anonymous).
pub trait Mmap {
    /// Maps `len` bytes of zero-filled anonymous memory with the given
    /// protection.
    ///
    /// # Safety
    /// The returned region is raw memory; the caller is responsible for
    /// releasing it through [`munmap`](Mmap::munmap).
    unsafe fn mmap_anonymous(len: usize, prot: ProtFlags) -> Result<*mut c_void>;

    /// Releases a region previously obtained from this allocator.
    ///
    /// # Safety
    /// `addr`/`len` must describe exactly one region returned by
    /// [`mmap_anonymous`](Mmap::mmap_anonymous).
    unsafe fn munmap(addr: *mut c_void, len: usize) -> Result<()>;

    /// Changes the protection of a mapped region.
    ///
    /// # Safety
    /// `addr`/`len` must lie within a region owned by this allocator.
    unsafe fn mprotect(addr: *mut c_void, len: usize, prot: ProtFlags) -> Result<()>;
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::{ArenaMmap, DefaultMmap};
    }
}

pub(crate) const PAGE_SIZE: usize = 0x1000;

#[inline]
pub(crate) fn roundup(x: usize, align: usize) -> usize {
    if align == 0 {
        return x;
    }
    (x + align - 1) & !(align - 1)
}
