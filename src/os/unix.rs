use crate::{
    Result,
    error::{map_error, oom_error},
    os::{MapFlags, Mmap, PAGE_SIZE, ProtFlags, roundup},
};
use core::ffi::c_void;
use libc::{mmap, mprotect, munmap};
use spin::Mutex;

/// The default allocator, delegating straight to the OS mapping primitive.
pub struct DefaultMmap;

impl Mmap for DefaultMmap {
    unsafe fn mmap_anonymous(len: usize, prot: ProtFlags) -> Result<*mut c_void> {
        let flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS;
        let ptr = unsafe { mmap(core::ptr::null_mut(), len, prot.bits(), flags.bits(), -1, 0) };
        if core::ptr::eq(ptr, libc::MAP_FAILED) {
            return Err(map_error("mmap anonymous failed"));
        }
        Ok(ptr)
    }

    unsafe fn munmap(addr: *mut c_void, len: usize) -> Result<()> {
        let res = unsafe { munmap(addr, len) };
        if res != 0 {
            return Err(map_error("munmap failed"));
        }
        Ok(())
    }

    unsafe fn mprotect(addr: *mut c_void, len: usize, prot: ProtFlags) -> Result<()> {
        let res = unsafe { mprotect(addr, len, prot.bits()) };
        if res != 0 {
            return Err(map_error("mprotect failed"));
        }
        Ok(())
    }
}

/// Size of the region reserved by the arena on first use.
const ARENA_RESERVE: usize = 16 * 1024 * 1024;

struct ArenaState {
    base: usize,
    len: usize,
    used: usize,
}

static ARENA: Mutex<ArenaState> = Mutex::new(ArenaState {
    base: 0,
    len: 0,
    used: 0,
});

/// An allocator serving memory from one pre-reserved low-address region.
///
/// On architectures whose branch relocations only reach a restricted address
/// range, module images and trampoline stubs must all live inside that range.
/// The arena reserves one block as low as the OS permits and bump-allocates
/// from it; regions are returned to the arena only when the whole process
/// exits, so [`munmap`](Mmap::munmap) is a no-op.
pub struct ArenaMmap;

impl ArenaMmap {
    fn reserve(state: &mut ArenaState) -> Result<()> {
        let flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS;
        let prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC;
        #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
        let flags = MapFlags::from_bits_retain(flags.bits() | libc::MAP_32BIT);
        // On targets without MAP_32BIT, hint at a low address instead.
        #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
        let hint = core::ptr::null_mut();
        #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
        let hint = 0x10000000 as *mut c_void;
        let ptr = unsafe {
            mmap(
                hint,
                ARENA_RESERVE,
                prot.bits(),
                flags.bits(),
                -1,
                0,
            )
        };
        if core::ptr::eq(ptr, libc::MAP_FAILED) {
            return Err(map_error("arena reservation failed"));
        }
        state.base = ptr as usize;
        state.len = ARENA_RESERVE;
        state.used = 0;
        Ok(())
    }
}

impl Mmap for ArenaMmap {
    unsafe fn mmap_anonymous(len: usize, _prot: ProtFlags) -> Result<*mut c_void> {
        let mut state = ARENA.lock();
        if state.len == 0 {
            Self::reserve(&mut state)?;
        }
        let len = roundup(len, PAGE_SIZE);
        if state.used + len > state.len {
            return Err(oom_error("low-address arena exhausted"));
        }
        let ptr = (state.base + state.used) as *mut c_void;
        state.used += len;
        Ok(ptr)
    }

    unsafe fn munmap(_addr: *mut c_void, _len: usize) -> Result<()> {
        // The arena never returns address space; freed regions would not be
        // reusable for code below the reach limit anyway.
        Ok(())
    }

    unsafe fn mprotect(addr: *mut c_void, len: usize, prot: ProtFlags) -> Result<()> {
        let res = unsafe { mprotect(addr, len, prot.bits()) };
        if res != 0 {
            return Err(map_error("mprotect failed"));
        }
        Ok(())
    }
}
