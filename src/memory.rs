//! Executable-memory manager: page-granular allocation of initially
//! writable memory, a bulk permission change to executable at
//! finalisation, and bulk release on teardown. Windows is the only
//! target this crate's generated code runs on; see `DESIGN.md` for why
//! the non-Windows path below still exists.

use log::{debug, trace};

use crate::error::Result;

/// One live allocation: its base pointer and size in bytes.
#[derive(Debug, Clone, Copy)]
struct Allocation {
    ptr: *mut u8,
    size: usize,
}

/// Owns every executable-memory allocation made for a single
/// [`crate::driver::JitDriver`]. `allocate` hands out initially writable
/// memory; `make_executable` flips every allocation to read-execute in
/// one step; `release` frees everything. Scoped so that `Drop` releases
/// whatever wasn't explicitly released, guaranteeing release on every
/// exit path, including panics.
#[derive(Debug, Default)]
pub struct ExecutableMemory {
    allocations: Vec<Allocation>,
    executable: bool,
}

impl ExecutableMemory {
    /// Creates a manager with no allocations yet.
    #[must_use]
    pub fn new() -> ExecutableMemory {
        ExecutableMemory { allocations: Vec::new(), executable: false }
    }

    /// Allocates `size` bytes of writable memory and returns its base
    /// pointer, stable until [`ExecutableMemory::release`].
    ///
    /// # Errors
    /// Returns [`crate::error::JitError::MemoryProtectionFailed`] if the
    /// OS refuses the allocation.
    pub fn allocate(&mut self, size: usize) -> Result<*mut u8> {
        debug_assert!(!self.executable, "allocate called after make_executable");
        let size = size.max(1);
        let ptr = os::alloc(size)?;
        trace!("allocated {size} writable bytes at {ptr:p}");
        self.allocations.push(Allocation { ptr, size });
        Ok(ptr)
    }

    /// Changes every allocation's protection to read-execute.
    ///
    /// # Errors
    /// Returns [`crate::error::JitError::MemoryProtectionFailed`] if the
    /// OS refuses the change for any allocation. Allocations already
    /// flipped before the failing one stay executable; this is fine
    /// because the driver only reaches this point once per successful
    /// finalisation and a failure here aborts finalisation entirely.
    pub fn make_executable(&mut self) -> Result<()> {
        for a in &self.allocations {
            os::protect_executable(a.ptr, a.size)?;
        }
        self.executable = true;
        debug!("marked {} allocation(s) executable", self.allocations.len());
        Ok(())
    }

    /// Frees every allocation. Idempotent: calling twice is a no-op.
    pub fn release(&mut self) {
        for a in self.allocations.drain(..) {
            os::free(a.ptr, a.size);
        }
        self.executable = false;
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        self.release();
    }
}

// SAFETY: allocations are plain OS memory blocks, not tied to any
// thread; compiled code may run concurrently on multiple threads once
// `make_executable` has returned.
unsafe impl Send for ExecutableMemory {}

#[cfg(windows)]
mod os {
    use windows_sys::Win32::Foundation::GetLastError;
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ,
        PAGE_PROTECTION_FLAGS, PAGE_READWRITE,
    };

    use crate::error::{JitError, OsErrorCode, Result};

    pub(super) fn alloc(size: usize) -> Result<*mut u8> {
        let ptr = unsafe { VirtualAlloc(std::ptr::null(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
        if ptr.is_null() {
            return Err(JitError::MemoryProtectionFailed(OsErrorCode(unsafe { GetLastError() })));
        }
        Ok(ptr as *mut u8)
    }

    pub(super) fn protect_executable(ptr: *mut u8, size: usize) -> Result<()> {
        let mut old: PAGE_PROTECTION_FLAGS = 0;
        let ok = unsafe { VirtualProtect(ptr.cast(), size, PAGE_EXECUTE_READ, &mut old) };
        if ok == 0 {
            return Err(JitError::MemoryProtectionFailed(OsErrorCode(unsafe { GetLastError() })));
        }
        Ok(())
    }

    pub(super) fn free(ptr: *mut u8, _size: usize) {
        unsafe {
            VirtualFree(ptr.cast(), 0, MEM_RELEASE);
        }
    }
}

/// Non-Windows fallback: a plain heap allocation that is never actually
/// made executable. Exists only so this crate — and the platform-
/// independent parts of its test suite (encoding-only properties, the
/// driver's patching arithmetic) — build and run on a non-Windows
/// development machine; running the generated machine code is Windows-
/// only, not the ability to compile and exercise the rest of the crate.
#[cfg(not(windows))]
mod os {
    use crate::error::Result;

    pub(super) fn alloc(size: usize) -> Result<*mut u8> {
        let boxed: Box<[u8]> = vec![0u8; size].into_boxed_slice();
        Ok(Box::into_raw(boxed) as *mut u8)
    }

    pub(super) fn protect_executable(_ptr: *mut u8, _size: usize) -> Result<()> {
        Ok(())
    }

    pub(super) fn free(ptr: *mut u8, size: usize) {
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr, size)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_release_does_not_panic() {
        let mut mem = ExecutableMemory::new();
        let ptr = mem.allocate(64).unwrap();
        assert!(!ptr.is_null());
        mem.release();
    }

    #[test]
    fn drop_releases_without_explicit_call() {
        let mut mem = ExecutableMemory::new();
        mem.allocate(32).unwrap();
        drop(mem);
    }
}
