//! ULP stacks
//!
//! Each stack is an anonymous mapping with an inaccessible guard page at
//! both ends. Stacks of recycled ULPs go onto a per-task free list whose
//! link lives in the lowest usable page of the stack itself, so the list
//! needs no allocation and can sit in the shared region as one pointer.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use tracing::debug;

use crate::runtime::error::{PipError, Result};
use crate::runtime::sync::SpinLock;

/// A mapped stack with guard pages
#[derive(Debug)]
pub struct StackRegion {
    base: NonNull<u8>,
    stack_size: usize,
    page_size: usize,
}

// SAFETY: the mapping is owned exclusively by the region.
unsafe impl Send for StackRegion {}

#[repr(C)]
struct FreeLink {
    next: *mut u8,
    stack_size: usize,
    page_size: usize,
}

impl StackRegion {
    pub fn map(
        stack_size: usize,
        page_size: usize,
    ) -> Result<Self> {
        if stack_size == 0 || stack_size % page_size != 0 {
            return Err(PipError::InvalidArgument("stack size must be a multiple of the page size"));
        }
        let len = stack_size + 2 * page_size;
        // SAFETY: fresh anonymous mapping.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(PipError::OutOfMemory);
        }
        let region = Self {
            base: NonNull::new(addr.cast()).ok_or(PipError::OutOfMemory)?,
            stack_size,
            page_size,
        };
        // SAFETY: both guard pages lie inside the mapping.
        unsafe {
            let low = region.base.as_ptr();
            let high = low.add(page_size + stack_size);
            for guard in [low, high] {
                if libc::mprotect(guard.cast(), page_size, libc::PROT_NONE) != 0 {
                    return Err(PipError::last_os_error());
                }
            }
        }
        Ok(region)
    }

    /// Lowest usable address.
    pub fn bottom(&self) -> *mut u8 {
        // SAFETY: within the mapping.
        unsafe { self.base.as_ptr().add(self.page_size) }
    }

    /// One past the highest usable address; stacks grow down from here.
    pub fn top(&self) -> *mut u8 {
        // SAFETY: within the mapping.
        unsafe { self.bottom().add(self.stack_size) }
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    fn mapped_len(&self) -> usize {
        self.stack_size + 2 * self.page_size
    }
}

impl Drop for StackRegion {
    fn drop(&mut self) {
        // SAFETY: the mapping is owned by `self`.
        unsafe { libc::munmap(self.base.as_ptr().cast(), self.mapped_len()) };
    }
}

/// Put `region` on the free list at `head`.
pub fn push(
    lock: &SpinLock,
    head: &AtomicPtr<u8>,
    region: StackRegion,
) {
    let _guard = lock.lock();
    let link = FreeLink {
        next: head.load(Ordering::SeqCst),
        stack_size: region.stack_size,
        page_size: region.page_size,
    };
    // SAFETY: the bottom of an unused stack is writable and suitably aligned.
    unsafe { region.bottom().cast::<FreeLink>().write(link) };
    head.store(region.base.as_ptr(), Ordering::SeqCst);
    std::mem::forget(region);
}

/// Take the most recently pushed stack off the free list at `head`.
pub fn pop(
    lock: &SpinLock,
    head: &AtomicPtr<u8>,
    page_size: usize,
) -> Option<StackRegion> {
    let _guard = lock.lock();
    let base = NonNull::new(head.load(Ordering::SeqCst))?;
    // SAFETY: every list entry was written by `push` at base + one page.
    let link = unsafe { base.as_ptr().add(page_size).cast::<FreeLink>().read() };
    head.store(link.next, Ordering::SeqCst);
    Some(StackRegion {
        base,
        stack_size: link.stack_size,
        page_size: link.page_size,
    })
}

/// A stack of `stack_size` bytes, recycled from the free list when possible.
pub fn acquire(
    lock: &SpinLock,
    head: &AtomicPtr<u8>,
    stack_size: usize,
    page_size: usize,
) -> Result<StackRegion> {
    match pop(lock, head, page_size) {
        Some(region) if region.stack_size == stack_size => {
            debug!("reusing ULP stack at {:p}", region.bottom());
            Ok(region)
        }
        // a differently sized stack is unmapped on drop
        _ => StackRegion::map(stack_size, page_size),
    }
}

/// Unmap every stack on the free list; returns how many there were.
pub fn drain(
    lock: &SpinLock,
    head: &AtomicPtr<u8>,
    page_size: usize,
) -> usize {
    let mut count = 0;
    while let Some(region) = pop(lock, head, page_size) {
        drop(region);
        count += 1;
    }
    count
}
