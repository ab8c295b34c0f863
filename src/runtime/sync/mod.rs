//! Spin locks living inside the shared region
//!
//! The region is reachable from threads and from cloned processes alike, so
//! the lock is a bare atomic word with no OS object behind it. A held lock
//! stores a non-zero owner value; by convention the holder's kernel thread id.

use std::hint::spin_loop;
use std::sync::atomic::{AtomicI32, Ordering};

const UNLOCKED: i32 = 0;
const SPINS_BEFORE_YIELD: u32 = 128;

/// Non-reentrant, unfair spin lock with sequentially consistent ordering
#[repr(C)]
#[derive(Debug, Default)]
pub struct SpinLock {
    word: AtomicI32,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            word: AtomicI32::new(UNLOCKED),
        }
    }

    /// Reset to unlocked, regardless of the current holder.
    pub fn init(&self) {
        self.word.store(UNLOCKED, Ordering::SeqCst);
    }

    /// Take the lock once, storing `1` as the owner value.
    pub fn try_lock(&self) -> Option<SpinGuard<'_>> {
        self.try_lock_with(1)
    }

    /// Take the lock once, storing `owner` as the owner value.
    pub fn try_lock_with(
        &self,
        owner: i32,
    ) -> Option<SpinGuard<'_>> {
        debug_assert_ne!(owner, UNLOCKED);
        self.word
            .compare_exchange(UNLOCKED, owner, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| SpinGuard { lock: self })
    }

    /// Spin until the lock is taken.
    pub fn lock(&self) -> SpinGuard<'_> {
        self.lock_with(1)
    }

    /// Spin until the lock is taken with `owner` as the owner value.
    pub fn lock_with(
        &self,
        owner: i32,
    ) -> SpinGuard<'_> {
        let mut spins = 0u32;
        loop {
            if let Some(guard) = self.try_lock_with(owner) {
                return guard;
            }
            while self.word.load(Ordering::Relaxed) != UNLOCKED {
                spins += 1;
                if spins % SPINS_BEFORE_YIELD == 0 {
                    std::thread::yield_now();
                } else {
                    spin_loop();
                }
            }
        }
    }

    /// Current owner value, `None` when unlocked.
    pub fn owner(&self) -> Option<i32> {
        match self.word.load(Ordering::SeqCst) {
            UNLOCKED => None,
            owner => Some(owner),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.owner().is_some()
    }
}

/// Proof that a [`SpinLock`] is held; unlocks on drop.
///
/// Functions that must run under the loader lock take `&SpinGuard` instead of
/// locking themselves, which keeps the non-reentrant lock from being taken
/// twice on one call path.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl SpinGuard<'_> {
    /// Whether this guard holds `lock`.
    pub fn holds(
        &self,
        lock: &SpinLock,
    ) -> bool {
        std::ptr::eq(self.lock, lock)
    }
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.word.store(UNLOCKED, Ordering::SeqCst);
    }
}

/// Kernel thread id of the caller.
pub fn gettid() -> i32 {
    // SAFETY: gettid has no preconditions.
    unsafe { libc::gettid() }
}

#[cfg(test)]
mod tests;
