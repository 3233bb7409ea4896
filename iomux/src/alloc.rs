//! Process-wide aligned I/O buffer allocator.
//!
//! Device I/O wants alignment guarantees (sector-sized DMA buffers). The
//! default implementation sits on `posix_memalign`; when polled mode
//! activates, the polled runtime's allocator is swapped into a one-shot
//! slot before any worker makes its first allocation.

use std::sync::OnceLock;

use log::warn;

/// Aligned allocation contract. `free` takes only the pointer, matching the
/// C-style surface device back-ends expect.
pub trait AlignedAlloc: Send + Sync {
    /// Allocate `size` bytes aligned to `align`. Null on failure.
    fn alloc(&self, align: usize, size: usize) -> *mut u8;
    /// Release a buffer obtained from [`alloc`](Self::alloc).
    fn free(&self, buf: *mut u8);
    /// Grow or shrink a buffer, preserving contents up to the smaller of
    /// the old and new sizes.
    fn realloc(&self, buf: *mut u8, align: usize, new_size: usize) -> *mut u8;
}

/// `posix_memalign`-backed default allocator.
pub struct LibcAlloc;

impl AlignedAlloc for LibcAlloc {
    fn alloc(&self, align: usize, size: usize) -> *mut u8 {
        let mut ptr: *mut libc::c_void = std::ptr::null_mut();
        // posix_memalign requires a pointer-sized power-of-two alignment.
        let align = align.max(std::mem::size_of::<usize>()).next_power_of_two();
        let rc = unsafe { libc::posix_memalign(&mut ptr, align, size) };
        if rc != 0 { std::ptr::null_mut() } else { ptr as *mut u8 }
    }

    fn free(&self, buf: *mut u8) {
        if !buf.is_null() {
            unsafe { libc::free(buf as *mut libc::c_void) };
        }
    }

    fn realloc(&self, buf: *mut u8, align: usize, new_size: usize) -> *mut u8 {
        if buf.is_null() {
            return self.alloc(align, new_size);
        }
        let new_buf = self.alloc(align, new_size);
        if new_buf.is_null() {
            return std::ptr::null_mut();
        }
        unsafe {
            let old_usable = libc::malloc_usable_size(buf as *mut libc::c_void);
            let copy = old_usable.min(new_size);
            std::ptr::copy_nonoverlapping(buf, new_buf, copy);
            libc::free(buf as *mut libc::c_void);
        }
        new_buf
    }
}

static ALLOCATOR: OnceLock<Box<dyn AlignedAlloc>> = OnceLock::new();
static DEFAULT: LibcAlloc = LibcAlloc;

/// Install the process-wide aligned allocator. One-shot: the first caller
/// wins, later calls are ignored with a warning.
pub fn set_allocator(alloc: Box<dyn AlignedAlloc>) {
    if ALLOCATOR.set(alloc).is_err() {
        warn!("aligned allocator already installed, ignoring replacement");
    }
}

/// The currently installed allocator (libc default until swapped).
pub fn allocator() -> &'static dyn AlignedAlloc {
    match ALLOCATOR.get() {
        Some(a) => a.as_ref(),
        None => &DEFAULT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_respects_alignment() {
        let a = LibcAlloc;
        for align in [8usize, 64, 512, 4096] {
            let buf = a.alloc(align, 1024);
            assert!(!buf.is_null());
            assert_eq!(buf as usize % align, 0);
            a.free(buf);
        }
    }

    #[test]
    fn realloc_preserves_contents() {
        let a = LibcAlloc;
        let buf = a.alloc(64, 16);
        assert!(!buf.is_null());
        unsafe {
            for i in 0..16 {
                *buf.add(i) = i as u8;
            }
        }
        let grown = a.realloc(buf, 64, 4096);
        assert!(!grown.is_null());
        assert_eq!(grown as usize % 64, 0);
        unsafe {
            for i in 0..16 {
                assert_eq!(*grown.add(i), i as u8);
            }
        }
        a.free(grown);
    }
}
