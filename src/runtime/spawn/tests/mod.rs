//! Spawn 单元测试
//!
//! 测试参数向量、任务环境、核心绑定与线程模式下的任务启动

use std::ffi::{c_char, c_int, CStr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::runtime::error::PipError;
use crate::runtime::loader::BuiltinLoader;
use crate::runtime::mode::NoHooks;
use crate::runtime::shared::{PipId, NTASKS_MAX};
use crate::runtime::spawn::{current_cores, env_value, task_environment, CVec, CoreBinding, SpawnRequest};
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

unsafe extern "C" fn argc_main(
    argc: c_int,
    _argv: *mut *mut c_char,
    _envp: *mut *mut c_char,
) -> c_int {
    argc
}

static SEEN_ROOT: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn env_main(
    _argc: c_int,
    _argv: *mut *mut c_char,
    envp: *mut *mut c_char,
) -> c_int {
    match env_value(envp, ENV_ROOT) {
        Some(addr) => {
            let addr = usize::from_str_radix(addr.trim_start_matches("0x"), 16).unwrap_or(0);
            SEEN_ROOT.store(addr, Ordering::SeqCst);
            0
        }
        None => 1,
    }
}

#[cfg(test)]
mod cvec_tests {
    use super::*;

    #[test]
    fn test_null_terminated() {
        let v = CVec::new(["a", "bc"]).unwrap();
        assert_eq!(v.len(), 2);
        assert_eq!(v.argc(), 2);
        unsafe {
            let raw = v.as_ptr();
            assert_eq!(CStr::from_ptr(*raw).to_bytes(), b"a");
            assert_eq!(CStr::from_ptr(*raw.add(1)).to_bytes(), b"bc");
            assert!((*raw.add(2)).is_null());
        }
    }

    #[test]
    fn test_empty() {
        let v = CVec::new(Vec::<String>::new()).unwrap();
        assert!(v.is_empty());
        assert!(unsafe { (*v.as_ptr()).is_null() });
    }

    #[test]
    fn test_interior_nul_rejected() {
        let err = CVec::new(["ok", "b\0ad"]).unwrap_err();
        assert!(matches!(err, PipError::InvalidArgument(_)));
    }

    #[test]
    fn test_env_value() {
        let v = CVec::new(["A=1", "PIP_ROOTX=no", "PIP_ROOT=0x1000"]).unwrap();
        unsafe {
            assert_eq!(env_value(v.as_ptr(), "A").as_deref(), Some("1"));
            assert_eq!(env_value(v.as_ptr(), "PIP_ROOT").as_deref(), Some("0x1000"));
            assert_eq!(env_value(v.as_ptr(), "B"), None);
            assert_eq!(env_value(std::ptr::null(), "A"), None);
        }
    }
}

#[cfg(test)]
mod environment_tests {
    use super::*;

    #[test]
    fn test_root_entry_replaced() {
        let env = task_environment(
            Some(vec!["PIP_ROOT=0xdead".to_string(), "HOME=/tmp".to_string()]),
            0x4000,
        );
        let roots: Vec<_> = env.iter().filter(|e| e.starts_with(b"PIP_ROOT=")).collect();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].as_slice(), b"PIP_ROOT=0x4000");
        assert!(env.iter().any(|e| e.as_slice() == b"HOME=/tmp"));
    }

    #[test]
    fn test_inherits_process_environment() {
        let env = task_environment(None, 0x10);
        assert!(env.iter().any(|e| e.as_slice() == b"PIP_ROOT=0x10"));
        if let Some(path) = std::env::var_os("PATH") {
            let mut entry = b"PATH=".to_vec();
            entry.extend_from_slice(path.as_encoded_bytes());
            assert!(env.contains(&entry));
        }
    }
}

#[cfg(test)]
mod affinity_tests {
    use super::*;

    #[test]
    fn test_binding_restored() {
        let before = current_cores().unwrap();
        let core = before[0];
        {
            let _binding = CoreBinding::bind(core).unwrap();
            assert_eq!(current_cores().unwrap(), vec![core]);
        }
        assert_eq!(current_cores().unwrap(), before);
    }

    #[test]
    fn test_out_of_range() {
        assert!(matches!(
            CoreBinding::bind(1 << 20),
            Err(PipError::InvalidArgument(_))
        ));
        assert!(CoreBinding::bind_opt(None).unwrap().is_none());
    }
}

#[cfg(test)]
mod spawn_tests {
    use super::*;

    #[test]
    fn test_spawn_and_wait() {
        BuiltinLoader::register("spawn-argc", argc_main);
        let rt = thread_root(4);
        let id = rt
            .spawn(SpawnRequest::new("spawn-argc").args(["spawn-argc", "x", "y"]))
            .unwrap();
        assert_eq!(rt.wait(PipId::Task(id)).unwrap(), 3);
        assert_eq!(rt.ntasks().unwrap(), 0);
    }

    #[test]
    fn test_default_argv() {
        BuiltinLoader::register("spawn-argc", argc_main);
        let rt = thread_root(2);
        let id = rt.spawn(SpawnRequest::new("spawn-argc")).unwrap();
        assert_eq!(rt.wait(PipId::Task(id)).unwrap(), 1);
    }

    #[test]
    fn test_task_sees_region_address() {
        BuiltinLoader::register("spawn-env", env_main);
        let rt = thread_root(2);
        let id = rt
            .spawn(SpawnRequest::new("spawn-env").envs(["PIP_ROOT=0x1", "A=b"]))
            .unwrap();
        assert_eq!(rt.wait(PipId::Task(id)).unwrap(), 0);
        assert_eq!(SEEN_ROOT.load(Ordering::SeqCst), rt.region_addr());
    }

    #[test]
    fn test_hooks() {
        BuiltinLoader::register("spawn-argc", argc_main);
        let rt = thread_root(2);

        let after_ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&after_ran);
        let id = rt
            .spawn(SpawnRequest::new("spawn-argc").after(move || {
                flag.store(true, Ordering::SeqCst);
                0
            }))
            .unwrap();
        assert_eq!(rt.wait(PipId::Task(id)).unwrap(), 1);
        assert!(after_ran.load(Ordering::SeqCst));

        let id = rt
            .spawn(SpawnRequest::new("spawn-argc").before(|| 17))
            .unwrap();
        assert_eq!(rt.wait(PipId::Task(id)).unwrap(), 17);
    }

    #[test]
    fn test_unknown_program_frees_slot() {
        let rt = thread_root(1);
        let err = rt.spawn(SpawnRequest::new("no-such-builtin")).unwrap_err();
        assert!(matches!(err, PipError::NotExecutable { .. }));
        assert_eq!(rt.ntasks().unwrap(), 0);
        assert_eq!(rt.shared().unwrap().ntasks_accum(), 0);

        BuiltinLoader::register("spawn-argc", argc_main);
        let id = rt.spawn(SpawnRequest::new("spawn-argc")).unwrap();
        assert_eq!(id, 0);
        rt.wait(PipId::Task(id)).unwrap();
    }

    #[test]
    fn test_requested_slot() {
        BuiltinLoader::register("spawn-argc", argc_main);
        let rt = thread_root(4);
        let id = rt
            .spawn(SpawnRequest::new("spawn-argc").pipid(PipId::Task(2)))
            .unwrap();
        assert_eq!(id, 2);
        rt.wait(PipId::Task(2)).unwrap();

        let err = rt
            .spawn(SpawnRequest::new("spawn-argc").pipid(PipId::Task(9)))
            .unwrap_err();
        assert!(matches!(err, PipError::InvalidArgument(_)));
    }

    #[test]
    fn test_empty_program() {
        let rt = thread_root(1);
        assert!(matches!(
            rt.spawn(SpawnRequest::new("")),
            Err(PipError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_pinned_task() {
        BuiltinLoader::register("spawn-argc", argc_main);
        let rt = thread_root(1);
        let core = current_cores().unwrap()[0];
        let before = current_cores().unwrap();
        let id = rt.spawn(SpawnRequest::new("spawn-argc").core(core)).unwrap();
        assert_eq!(rt.wait(PipId::Task(id)).unwrap(), 1);
        assert_eq!(current_cores().unwrap(), before);
    }
}

#[cfg(test)]
mod accounting_tests {
    use super::*;

    #[test]
    fn test_concurrent_spawners_respect_lifetime_limit() {
        BuiltinLoader::register("spawn-argc", argc_main);
        const SPAWNERS: usize = 4;
        let rt = thread_root(SPAWNERS);

        let total: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..SPAWNERS)
                .map(|slot| {
                    let rt = &rt;
                    s.spawn(move || {
                        let mut spawned = 0;
                        loop {
                            match rt.spawn(SpawnRequest::new("spawn-argc").pipid(PipId::Task(slot))) {
                                Ok(id) => {
                                    assert_eq!(rt.wait(PipId::Task(id)).unwrap(), 1);
                                    spawned += 1;
                                }
                                Err(PipError::ResourceExhausted(_)) => return spawned,
                                Err(e) => panic!("unexpected spawn failure: {e}"),
                            }
                        }
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(total, NTASKS_MAX);
        let shared = rt.shared().unwrap();
        assert_eq!(shared.ntasks_accum(), NTASKS_MAX);
        assert_eq!(shared.ntasks_curr(), 0);
    }
}
