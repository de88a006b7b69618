//! Memory backends for the quarantine pool.
//!
//! A backend owns raw allocation plus the arm/disarm tamper check on
//! quarantined regions. Two interchangeable strategies:
//!
//! - [`PoisonFill`]: heap allocations; quarantined memory is filled
//!   with the keystream and compared word-by-word on reclaim.
//! - [`PageGuard`] (unix): anonymous mappings; quarantined pages are
//!   additionally made read-only so a late writer faults immediately
//!   instead of silently corrupting the pattern.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

use crate::keystream::{poison_fill, verify, Divergence};

/// Alignment contract for every buffer handed to the capture driver.
pub const BUFFER_ALIGN: usize = 16;

/// What a failed quarantine check observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TamperEvidence {
    /// The poison pattern no longer matches the keystream.
    PatternMismatch(Divergence),
    /// The page protection could not be restored; someone changed it
    /// while the region was sealed.
    ProtectionFault { errno: i32 },
}

/// Raw-memory strategy behind a [`crate::BufferPool`].
///
/// # Safety contract
///
/// `dealloc`, `seal` and `check` must only be called with a pointer
/// and size pair previously returned by `alloc` on the same backend,
/// while no other party is writing through that pointer.
pub trait QuarantineBackend: Send + Sync {
    /// Allocate `size` bytes at [`BUFFER_ALIGN`] alignment.
    fn alloc(&self, size: usize) -> Option<NonNull<u8>>;

    /// Return a buffer to the operating system.
    ///
    /// # Safety
    /// `ptr`/`size` must come from `alloc` and not be sealed.
    unsafe fn dealloc(&self, ptr: NonNull<u8>, size: usize);

    /// Arm a quarantined buffer so later writes become detectable.
    ///
    /// # Safety
    /// `ptr`/`size` must come from `alloc`; the buffer must be idle.
    unsafe fn seal(&self, ptr: NonNull<u8>, size: usize);

    /// Disarm a sealed buffer and report whether it was touched.
    ///
    /// # Safety
    /// `ptr`/`size` must come from `alloc` and have been sealed.
    unsafe fn check(&self, ptr: NonNull<u8>, size: usize) -> Result<(), TamperEvidence>;

    /// Simulate an errant device write into a quarantined buffer, the
    /// way a stray DMA would land there regardless of CPU-side page
    /// protection. Harness support; real corruption comes from the
    /// driver under test.
    ///
    /// # Safety
    /// `ptr`/`size` must come from `alloc`; `offset + 4 <= size`.
    unsafe fn tamper(&self, ptr: NonNull<u8>, _size: usize, offset: usize) {
        // 0xffffffff can never be a keystream word (it exceeds the
        // modulus), so the write is always detectable.
        ptr.as_ptr().add(offset).cast::<u32>().write_unaligned(0xffff_ffff);
    }
}

fn layout_for(size: usize) -> Layout {
    // Zero-sized driver requests still get a real allocation so the
    // live registry has a unique address to track.
    Layout::from_size_align(size.max(1), BUFFER_ALIGN)
        .unwrap_or_else(|_| Layout::from_size_align(1, BUFFER_ALIGN).unwrap())
}

/// Default backend: plain heap memory, keystream poison on quarantine.
#[derive(Debug, Default)]
pub struct PoisonFill;

impl QuarantineBackend for PoisonFill {
    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        // The layout carries the 16-byte alignment directly, so there
        // is no realloc-until-aligned dance here.
        NonNull::new(unsafe { alloc(layout_for(size)) })
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, size: usize) {
        dealloc(ptr.as_ptr(), layout_for(size));
    }

    unsafe fn seal(&self, ptr: NonNull<u8>, size: usize) {
        poison_fill(std::slice::from_raw_parts_mut(ptr.as_ptr(), size));
    }

    unsafe fn check(&self, ptr: NonNull<u8>, size: usize) -> Result<(), TamperEvidence> {
        verify(std::slice::from_raw_parts(ptr.as_ptr(), size))
            .map_err(TamperEvidence::PatternMismatch)
    }
}

/// Page-level backend: quarantined buffers are poisoned and then made
/// read-only, so a stray DMA or driver write faults at the writer.
#[cfg(unix)]
#[derive(Debug)]
pub struct PageGuard {
    page_size: usize,
}

#[cfg(unix)]
impl PageGuard {
    pub fn new() -> Self {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        Self {
            page_size: usize::try_from(page_size).unwrap_or(4096),
        }
    }

    fn rounded(&self, size: usize) -> usize {
        let size = size.max(1);
        size.div_ceil(self.page_size) * self.page_size
    }
}

#[cfg(unix)]
impl Default for PageGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
impl QuarantineBackend for PageGuard {
    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                self.rounded(size),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        NonNull::new(ptr.cast::<u8>())
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, size: usize) {
        if libc::munmap(ptr.as_ptr().cast(), self.rounded(size)) != 0 {
            tracing::error!(
                ptr = ?ptr.as_ptr(),
                size,
                "munmap failed while reclaiming a quarantined buffer"
            );
        }
    }

    unsafe fn seal(&self, ptr: NonNull<u8>, size: usize) {
        poison_fill(std::slice::from_raw_parts_mut(ptr.as_ptr(), size));
        if libc::mprotect(ptr.as_ptr().cast(), self.rounded(size), libc::PROT_READ) != 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            tracing::error!(ptr = ?ptr.as_ptr(), size, errno, "mprotect(PROT_READ) failed");
        }
    }

    unsafe fn check(&self, ptr: NonNull<u8>, size: usize) -> Result<(), TamperEvidence> {
        if libc::mprotect(
            ptr.as_ptr().cast(),
            self.rounded(size),
            libc::PROT_READ | libc::PROT_WRITE,
        ) != 0
        {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(TamperEvidence::ProtectionFault { errno });
        }
        verify(std::slice::from_raw_parts(ptr.as_ptr(), size))
            .map_err(TamperEvidence::PatternMismatch)
    }

    unsafe fn tamper(&self, ptr: NonNull<u8>, size: usize, offset: usize) {
        // DMA bypasses the CPU page tables, so the simulated stray
        // write has to go around the guard as well.
        let rounded = self.rounded(size);
        libc::mprotect(
            ptr.as_ptr().cast(),
            rounded,
            libc::PROT_READ | libc::PROT_WRITE,
        );
        ptr.as_ptr().add(offset).cast::<u32>().write_unaligned(0xffff_ffff);
        libc::mprotect(ptr.as_ptr().cast(), rounded, libc::PROT_READ);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(backend: &dyn QuarantineBackend, size: usize) {
        let ptr = backend.alloc(size).expect("allocation failed");
        assert_eq!(ptr.as_ptr() as usize % BUFFER_ALIGN, 0);
        unsafe {
            backend.seal(ptr, size);
            assert_eq!(backend.check(ptr, size), Ok(()));
            backend.dealloc(ptr, size);
        }
    }

    #[test]
    fn poison_fill_round_trip() {
        for size in [1usize, 16, 100, 4096, 1920 * 1080 * 2] {
            exercise(&PoisonFill, size);
        }
    }

    #[test]
    fn poison_fill_detects_tamper() {
        let backend = PoisonFill;
        let size = 8192usize;
        let ptr = backend.alloc(size).unwrap();
        unsafe {
            backend.seal(ptr, size);
            ptr.as_ptr().add(64).write(0xff);
            let evidence = backend.check(ptr, size).unwrap_err();
            match evidence {
                TamperEvidence::PatternMismatch(div) => assert_eq!(div.valid_bytes, 64),
                other => panic!("unexpected evidence: {other:?}"),
            }
            backend.dealloc(ptr, size);
        }
    }

    #[cfg(unix)]
    #[test]
    fn page_guard_round_trip() {
        for size in [1usize, 4096, 9000] {
            exercise(&PageGuard::new(), size);
        }
    }

    #[cfg(unix)]
    #[test]
    fn page_guard_rounds_to_pages() {
        let guard = PageGuard::new();
        let page = guard.page_size;
        assert_eq!(guard.rounded(1), page);
        assert_eq!(guard.rounded(page), page);
        assert_eq!(guard.rounded(page + 1), 2 * page);
    }
}
