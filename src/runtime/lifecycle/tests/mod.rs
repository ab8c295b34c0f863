//! Lifecycle 单元测试
//!
//! 测试等待、连接、提前退出与回收权限

use std::ffi::{c_char, c_int};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

use crate::runtime::error::PipError;
use crate::runtime::loader::BuiltinLoader;
use crate::runtime::mode::NoHooks;
use crate::runtime::shared::{PipId, TaskState};
use crate::runtime::spawn::{env_value, SpawnRequest};
use crate::runtime::{Runtime, RuntimeBuilder};
use crate::util::config::{RuntimeConfig, ENV_ROOT};

fn thread_root(ntasks: usize) -> Runtime {
    RuntimeBuilder::new()
        .ntasks(ntasks)
        .config(RuntimeConfig::default())
        .probe(NoHooks)
        .loader(BuiltinLoader)
        .create_root()
        .unwrap()
}

unsafe fn attach(envp: *mut *mut c_char) -> Option<Runtime> {
    let addr = env_value(envp, ENV_ROOT)?;
    RuntimeBuilder::new()
        .config(RuntimeConfig::default())
        .loader(BuiltinLoader)
        .attach(&addr)
        .ok()
}

unsafe extern "C" fn exit_main(
    argc: c_int,
    _argv: *mut *mut c_char,
    envp: *mut *mut c_char,
) -> c_int {
    match attach(envp) {
        Some(rt) => rt.exit(40 + argc),
        None => 99,
    }
}

static GATE: AtomicBool = AtomicBool::new(false);

unsafe extern "C" fn gated_main(
    _argc: c_int,
    _argv: *mut *mut c_char,
    _envp: *mut *mut c_char,
) -> c_int {
    while !GATE.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(1));
    }
    5
}

static RESTRICTED: AtomicI32 = AtomicI32::new(-1);

unsafe extern "C" fn restricted_main(
    _argc: c_int,
    _argv: *mut *mut c_char,
    envp: *mut *mut c_char,
) -> c_int {
    let Some(rt) = attach(envp) else {
        return 99;
    };
    let mut denied = 0;
    if matches!(rt.wait(PipId::Task(0)), Err(PipError::NotPermitted(_))) {
        denied += 1;
    }
    if matches!(rt.spawn(SpawnRequest::new("x")), Err(PipError::NotPermitted(_))) {
        denied += 1;
    }
    if matches!(rt.try_wait_any(), Err(PipError::NotPermitted(_))) {
        denied += 1;
    }
    RESTRICTED.store(denied, Ordering::SeqCst);
    0
}

unsafe extern "C" fn quick_main(
    argc: c_int,
    _argv: *mut *mut c_char,
    _envp: *mut *mut c_char,
) -> c_int {
    argc * 10
}

#[cfg(test)]
mod wait_tests {
    use super::*;

    #[test]
    fn test_exit_unwinds_to_start_routine() {
        BuiltinLoader::register("lc-exit", exit_main);
        let rt = thread_root(2);
        let id = rt
            .spawn(SpawnRequest::new("lc-exit").after(|| 0))
            .unwrap();
        assert_eq!(rt.wait(PipId::Task(id)).unwrap(), 41);
    }

    #[test]
    fn test_try_wait_then_wait() {
        BuiltinLoader::register("lc-gated", gated_main);
        GATE.store(false, Ordering::SeqCst);
        let rt = thread_root(2);
        let id = rt.spawn(SpawnRequest::new("lc-gated")).unwrap();

        assert!(matches!(rt.try_wait(PipId::Task(id)), Err(PipError::WouldBlock(_))));
        assert!(matches!(
            rt.timed_join(PipId::Task(id), Duration::from_millis(10)),
            Err(PipError::TimedOut(_))
        ));
        // the failed attempts leave the task reapable
        assert_ne!(rt.shared().unwrap().tasks()[id].state(), TaskState::Reaping);

        GATE.store(true, Ordering::SeqCst);
        assert_eq!(rt.join(PipId::Task(id)).unwrap(), 5);
        assert!(matches!(rt.wait(PipId::Task(id)), Err(PipError::NotPermitted(_))));
    }

    #[test]
    fn test_wait_any_drains() {
        BuiltinLoader::register("lc-quick", quick_main);
        let rt = thread_root(3);
        for _ in 0..3 {
            rt.spawn(SpawnRequest::new("lc-quick")).unwrap();
        }
        let mut reaped = Vec::new();
        for _ in 0..3 {
            let (slot, status) = rt.wait_any().unwrap();
            assert_eq!(status, 10);
            reaped.push(slot);
        }
        reaped.sort();
        assert_eq!(reaped, vec![0, 1, 2]);
        assert!(matches!(rt.try_wait_any(), Err(PipError::NoSuchEntity(_))));
    }

    #[test]
    fn test_bad_targets() {
        let rt = thread_root(2);
        assert!(matches!(rt.wait(PipId::Root), Err(PipError::InvalidArgument(_))));
        assert!(matches!(rt.wait(PipId::Myself), Err(PipError::InvalidArgument(_))));
        assert!(matches!(rt.wait(PipId::Any), Err(PipError::InvalidArgument(_))));
        assert!(matches!(rt.wait(PipId::Task(2)), Err(PipError::InvalidArgument(_))));
        assert!(matches!(rt.wait(PipId::Task(1)), Err(PipError::NotPermitted(_))));
    }

    #[test]
    fn test_second_reap_refused() {
        BuiltinLoader::register("lc-quick", quick_main);
        let rt = thread_root(1);
        let id = rt.spawn(SpawnRequest::new("lc-quick")).unwrap();
        assert_eq!(rt.wait(PipId::Task(id)).unwrap(), 10);
        assert!(matches!(rt.wait(PipId::Task(id)), Err(PipError::NotPermitted(_))));
        assert!(matches!(rt.try_join(PipId::Task(id)), Err(PipError::NotPermitted(_))));
    }
}

#[cfg(test)]
mod permission_tests {
    use super::*;

    #[test]
    fn test_task_cannot_reap_or_spawn() {
        BuiltinLoader::register("lc-restricted", restricted_main);
        let rt = thread_root(2);
        let id = rt.spawn(SpawnRequest::new("lc-restricted")).unwrap();
        assert_eq!(rt.wait(PipId::Task(id)).unwrap(), 0);
        assert_eq!(RESTRICTED.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_single_reaper() {
        static HOLD: AtomicBool = AtomicBool::new(false);
        unsafe extern "C" fn held_main(
            _argc: c_int,
            _argv: *mut *mut c_char,
            _envp: *mut *mut c_char,
        ) -> c_int {
            while !HOLD.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            3
        }
        BuiltinLoader::register("lc-held", held_main);
        let rt = thread_root(1);
        let id = rt.spawn(SpawnRequest::new("lc-held")).unwrap();

        std::thread::scope(|s| {
            let reaper = s.spawn(|| rt.wait(PipId::Task(id)));
            while rt.shared().unwrap().tasks()[id].state() != TaskState::Reaping {
                std::thread::yield_now();
            }
            assert!(matches!(rt.wait(PipId::Task(id)), Err(PipError::NotPermitted(_))));
            HOLD.store(true, Ordering::SeqCst);
            assert_eq!(reaper.join().unwrap().unwrap(), 3);
        });
    }

    #[test]
    fn test_join_only_from_root_thread() {
        BuiltinLoader::register("lc-quick", quick_main);
        let rt = thread_root(1);
        let id = rt.spawn(SpawnRequest::new("lc-quick")).unwrap();

        std::thread::scope(|s| {
            let other = s.spawn(|| {
                (
                    rt.join(PipId::Task(id)),
                    rt.try_join(PipId::Task(id)),
                    rt.timed_join(PipId::Task(id), Duration::from_millis(1)),
                )
            });
            let (join, try_join, timed) = other.join().unwrap();
            assert!(matches!(join, Err(PipError::NotPermitted(_))));
            assert!(matches!(try_join, Err(PipError::NotPermitted(_))));
            assert!(matches!(timed, Err(PipError::NotPermitted(_))));
        });

        // the refused joins did not touch the task
        assert_eq!(rt.join(PipId::Task(id)).unwrap(), 10);
    }

    #[test]
    fn test_kill() {
        let rt = thread_root(1);
        assert!(matches!(
            rt.kill(PipId::Root, 1000),
            Err(PipError::InvalidArgument(_))
        ));
        assert!(matches!(rt.kill(PipId::Task(0), 0), Err(PipError::NoSuchEntity(_))));
        rt.kill(PipId::Root, 0).unwrap();
    }
}
