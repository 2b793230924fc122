//! OS virtual-memory reservation, abstracted behind a small trait so
//! the allocator in `heap::mod` never touches `libc`/`windows-sys`
//! directly. The specification generalizes the source's templated
//! allocator into "a trait/interface object passed by reference" —
//! this is that seam.

use crate::error::{Error, Result};

/// A contiguous run of OS-backed virtual memory.
pub struct PageRun {
    pub base: *mut u8,
    pub len: usize,
}

// SAFETY: a `PageRun` is just a `(pointer, length)` pair describing
// memory this process owns exclusively until `release` is called;
// sending that description across threads is sound as long as the
// allocator contract (single-threaded per heap, see spec section 5)
// is respected by the caller.
unsafe impl Send for PageRun {}

/// Reserves and releases OS virtual memory in page-size multiples.
///
/// The default implementation talks to the OS directly (`mmap`/
/// `munmap` on unix, `VirtualAlloc`/`VirtualFree` on windows); tests
/// substitute `ArenaPages` (below, `#[cfg(test)]` only) with an
/// in-process arena so the allocator's logic can be exercised without
/// touching real OS mappings.
pub trait PageSource {
    /// The platform's page size in bytes.
    fn page_size(&self) -> usize;

    /// Reserves `len` bytes (already rounded up to a page multiple by
    /// the caller) of fresh, zeroed, read-write memory.
    ///
    /// `hint` is a best-effort preferred address (used to probe for
    /// adjacency with an existing island so it can be merged); the
    /// returned run may land anywhere, and callers must check
    /// `run.base` against the hint rather than assume it was honored.
    ///
    /// # Safety
    /// `len` must be a non-zero multiple of [`PageSource::page_size`].
    unsafe fn reserve(&self, len: usize, hint: Option<*mut u8>) -> Result<PageRun>;

    /// Releases a run previously returned by `reserve` or `grow`.
    ///
    /// # Safety
    /// `run` must describe memory this `PageSource` reserved and that
    /// has not already been released.
    unsafe fn release(&self, run: PageRun) -> Result<()>;
}

#[cfg(unix)]
pub struct SystemPages;

#[cfg(unix)]
impl PageSource for SystemPages {
    fn page_size(&self) -> usize {
        // SAFETY: sysconf with _SC_PAGESIZE never fails on a sane
        // host and takes no pointer arguments.
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    unsafe fn reserve(&self, len: usize, hint: Option<*mut u8>) -> Result<PageRun> {
        let addr = hint.map_or(core::ptr::null_mut(), |p| p as *mut libc::c_void);
        let ptr = libc::mmap(
            addr,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            return Err(Error::OsResource(format!(
                "mmap({len}) failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(PageRun {
            base: ptr as *mut u8,
            len,
        })
    }

    unsafe fn release(&self, run: PageRun) -> Result<()> {
        let rc = libc::munmap(run.base as *mut libc::c_void, run.len);
        if rc != 0 {
            return Err(Error::OsResource(format!(
                "munmap failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

#[cfg(windows)]
pub struct SystemPages;

#[cfg(windows)]
impl PageSource for SystemPages {
    fn page_size(&self) -> usize {
        use windows_sys::Win32::System::SystemInformation::GetSystemInfo;
        use windows_sys::Win32::System::SystemInformation::SYSTEM_INFO;
        unsafe {
            let mut info: SYSTEM_INFO = core::mem::zeroed();
            GetSystemInfo(&mut info);
            info.dwPageSize as usize
        }
    }

    unsafe fn reserve(&self, len: usize, hint: Option<*mut u8>) -> Result<PageRun> {
        use windows_sys::Win32::System::Memory::{
            VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE,
        };
        let addr = hint.map_or(core::ptr::null_mut(), |p| p as *mut core::ffi::c_void);
        let mut ptr = VirtualAlloc(addr, len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE);
        if ptr.is_null() && !addr.is_null() {
            // The exact hinted address was unavailable; retry without it.
            ptr = VirtualAlloc(
                core::ptr::null_mut(),
                len,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
            );
        }
        if ptr.is_null() {
            return Err(Error::OsResource("VirtualAlloc failed".into()));
        }
        Ok(PageRun {
            base: ptr as *mut u8,
            len,
        })
    }

    unsafe fn release(&self, run: PageRun) -> Result<()> {
        use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};
        let ok = VirtualFree(run.base as *mut core::ffi::c_void, 0, MEM_RELEASE);
        if ok == 0 {
            return Err(Error::OsResource("VirtualFree failed".into()));
        }
        Ok(())
    }
}

/// An in-process, non-OS-backed [`PageSource`] used by tests so the
/// allocator's island/free-tree logic can run (and the heap torture
/// test in particular can execute 100,000 operations) without the
/// overhead and platform variance of real `mmap` calls.
#[cfg(test)]
pub struct ArenaPages {
    page_size: usize,
}

#[cfg(test)]
impl ArenaPages {
    pub fn new(page_size: usize) -> Self {
        ArenaPages { page_size }
    }
}

#[cfg(test)]
impl PageSource for ArenaPages {
    fn page_size(&self) -> usize {
        self.page_size
    }

    unsafe fn reserve(&self, len: usize, _hint: Option<*mut u8>) -> Result<PageRun> {
        let mut buf = vec![0u8; len].into_boxed_slice();
        let base = buf.as_mut_ptr();
        core::mem::forget(buf);
        Ok(PageRun { base, len })
    }

    unsafe fn release(&self, run: PageRun) -> Result<()> {
        drop(Vec::from_raw_parts(run.base, run.len, run.len));
        Ok(())
    }
}
