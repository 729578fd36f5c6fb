//! Architecture-specific relocation backends.
//!
//! Exactly one backend is compiled in, selected by the build target. Each
//! backend implements [`crate::relocation::ArchReloc`] with a match over
//! the relocation types its ABI emits for relocatable objects.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use x86_64::EM_ARCH;
        pub(crate) use x86_64::X86_64Relocator as Relocator;
    } else if #[cfg(any(target_arch = "mips", target_arch = "mips64"))] {
        mod mips;
        pub use mips::EM_ARCH;
        pub(crate) use mips::{GP_OFFSET, MipsRelocator as Relocator};
    }
}
