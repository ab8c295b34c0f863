//! SpinLock 单元测试

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crate::runtime::sync::{gettid, SpinLock};

#[test]
fn test_try_lock_excludes() {
    let lock = SpinLock::new();
    let guard = lock.try_lock();
    assert!(guard.is_some());
    assert!(lock.try_lock().is_none());
    drop(guard);
    assert!(lock.try_lock().is_some());
}

#[test]
fn test_owner_value() {
    let lock = SpinLock::new();
    assert_eq!(lock.owner(), None);
    let tid = gettid();
    let guard = lock.lock_with(tid);
    assert_eq!(lock.owner(), Some(tid));
    assert!(guard.holds(&lock));
    assert!(!guard.holds(&SpinLock::new()));
    drop(guard);
    assert!(!lock.is_locked());
}

#[test]
fn test_init_releases() {
    let lock = SpinLock::new();
    let guard = lock.lock();
    std::mem::forget(guard);
    assert!(lock.is_locked());
    lock.init();
    assert!(!lock.is_locked());
}

#[test]
fn test_mutual_exclusion_under_contention() {
    let lock = Arc::new(SpinLock::new());
    let inside = Arc::new(AtomicUsize::new(0));
    let total = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let inside = Arc::clone(&inside);
            let total = Arc::clone(&total);
            thread::spawn(move || {
                for _ in 0..1000 {
                    let _guard = lock.lock_with(gettid());
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    total.fetch_add(1, Ordering::SeqCst);
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(total.load(Ordering::SeqCst), 4000);
    assert!(!lock.is_locked());
}
