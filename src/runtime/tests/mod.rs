//! Runtime 单元测试
//!
//! 测试初始化、附着、查询接口、导出导入与跨任务内存

use std::ffi::{c_char, c_int, c_void};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::runtime::error::{AttachError, PipError};
use crate::runtime::loader::BuiltinLoader;
use crate::runtime::mode::{ExecMode, NoHooks, Options};
use crate::runtime::shared::{PipId, NTASKS_MAX};
use crate::runtime::spawn::{env_value, SpawnRequest};
use crate::runtime::{Role, Runtime, RuntimeBuilder};
use crate::util::config::{ConfigError, RuntimeConfig, ENV_ROOT};

fn builder() -> RuntimeBuilder {
    RuntimeBuilder::new()
        .config(RuntimeConfig::default())
        .probe(NoHooks)
        .loader(BuiltinLoader)
}

unsafe fn attach(envp: *mut *mut c_char) -> Option<Runtime> {
    let addr = env_value(envp, ENV_ROOT)?;
    RuntimeBuilder::new()
        .config(RuntimeConfig::default())
        .loader(BuiltinLoader)
        .attach(&addr)
        .ok()
}

static mut EXPORTED: u64 = 0x5eed;
static IMPORTED: AtomicBool = AtomicBool::new(false);
static TASK_SAW_ROOT_EXPORT: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn exporter_main(
    _argc: c_int,
    _argv: *mut *mut c_char,
    envp: *mut *mut c_char,
) -> c_int {
    let Some(rt) = attach(envp) else {
        return 99;
    };
    if let Ok(ptr) = rt.root_export() {
        TASK_SAW_ROOT_EXPORT.store(ptr as usize, Ordering::SeqCst);
    }
    if rt.export((&raw mut EXPORTED).cast()).is_err() {
        return 1;
    }
    if !matches!(rt.export((&raw mut EXPORTED).cast()), Err(PipError::Busy(_))) {
        return 2;
    }
    while !IMPORTED.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(1));
    }
    0
}

unsafe extern "C" fn alloc_main(
    _argc: c_int,
    _argv: *mut *mut c_char,
    envp: *mut *mut c_char,
) -> c_int {
    let Some(rt) = attach(envp) else {
        return 99;
    };
    match rt.malloc(64) {
        Ok(block) => {
            block.as_ptr().write_bytes(0xab, 64);
            match rt.export(block.as_ptr().cast()) {
                Ok(()) => 0,
                Err(_) => 1,
            }
        }
        Err(_) => 2,
    }
}

#[cfg(test)]
mod init_tests {
    use super::*;

    #[test]
    fn test_create_root() {
        let rt = builder().ntasks(8).create_root().unwrap();
        assert_eq!(rt.role(), Role::Root);
        assert!(rt.is_root());
        assert_eq!(rt.id(), PipId::Root);
        assert_eq!(rt.capacity().unwrap(), 8);
        assert_eq!(rt.ntasks().unwrap(), 0);
        assert_eq!(rt.mode().unwrap(), ExecMode::Thread);
        assert_eq!(rt.mode_str().unwrap(), "pthread");
        assert!(rt.is_threaded().unwrap());
        assert!(rt.shares_fd().unwrap());
        assert!(rt.shares_sighand().unwrap());
        assert_eq!(rt.idstr(), "<PIP_ROOT>");
    }

    #[test]
    fn test_capacity_limits() {
        assert!(matches!(
            builder().ntasks(0).create_root(),
            Err(PipError::InvalidArgument(_))
        ));
        assert!(matches!(
            builder().ntasks(NTASKS_MAX + 1).create_root(),
            Err(PipError::ResourceExhausted(NTASKS_MAX))
        ));
        let rt = builder().ntasks(NTASKS_MAX).create_root().unwrap();
        assert_eq!(rt.capacity().unwrap(), NTASKS_MAX);
    }

    #[test]
    fn test_process_mode_without_hooks() {
        let err = builder().options(Options::PROCESS).create_root().unwrap_err();
        assert!(matches!(err, PipError::NotPermitted(_)));
        assert_eq!(err.errno(), libc::EPERM);
    }

    #[test]
    fn test_bad_environment_mode() {
        let err = RuntimeBuilder::new()
            .config(RuntimeConfig::default().with_mode("fork"))
            .probe(NoHooks)
            .create_root()
            .unwrap_err();
        assert!(matches!(err, PipError::Config(ConfigError::UnknownMode(_))));
    }

    #[test]
    fn test_force_exit_option() {
        let rt = RuntimeBuilder::new()
            .config(RuntimeConfig::default().with_opts("ForceExit"))
            .probe(NoHooks)
            .create_root()
            .unwrap();
        assert!(rt.shared().unwrap().options().contains(Options::FORCE_EXIT));
    }

    #[test]
    fn test_pid_needs_process_mode() {
        let rt = builder().create_root().unwrap();
        assert!(matches!(rt.pid(PipId::Root), Err(PipError::NotPermitted(_))));
        assert_ne!(rt.os_id(PipId::Root).unwrap(), 0);
    }
}

#[cfg(test)]
mod attach_tests {
    use super::*;

    #[test]
    fn test_unparsable_address() {
        let err = builder().attach("zz-top").unwrap_err();
        assert!(matches!(err, PipError::Attach(AttachError::BadAddress(_))));
    }

    #[test]
    fn test_wrong_magic() {
        let bogus = Box::new([0u8; 4096]);
        let addr = format!("{:#x}", bogus.as_ptr() as usize);
        let err = builder().attach(&addr).unwrap_err();
        assert!(matches!(err, PipError::Attach(AttachError::BadMagic(_))));
    }

    #[test]
    fn test_unmapped_address_fails_closed() {
        let err = builder().attach("0x1000").unwrap_err();
        assert!(matches!(err, PipError::Attach(AttachError::BadMagic(0x1000))));
    }

    #[test]
    fn test_no_slot_for_thread() {
        let rt = builder().create_root().unwrap();
        let addr = format!("{:#x}", rt.region_addr());
        let err = builder().attach(&addr).unwrap_err();
        assert!(matches!(err, PipError::Attach(AttachError::SlotNotFound)));
        assert_eq!(err.errno(), libc::ENXIO);
    }

    #[test]
    fn test_init_dispatches_on_root_address() {
        let config = RuntimeConfig {
            root_addr: Some("0x0".to_string()),
            ..RuntimeConfig::default()
        };
        let err = RuntimeBuilder::new().config(config).init().unwrap_err();
        assert!(matches!(err, PipError::Attach(AttachError::BadMagic(0))));
    }
}

#[cfg(test)]
mod sharing_tests {
    use super::*;

    #[test]
    fn test_export_import() {
        BuiltinLoader::register("rt-exporter", exporter_main);
        let mut token = 11u32;
        let root_token = (&raw mut token).cast::<c_void>();
        let rt = builder().ntasks(2).export(root_token).create_root().unwrap();
        assert_eq!(rt.root_export().unwrap(), root_token);

        let id = rt.spawn(SpawnRequest::new("rt-exporter")).unwrap();
        let imported = loop {
            let ptr = rt.import(PipId::Task(id)).unwrap();
            if !ptr.is_null() {
                break ptr;
            }
            std::thread::yield_now();
        };
        assert_eq!(unsafe { *imported.cast::<u64>() }, 0x5eed);
        IMPORTED.store(true, Ordering::SeqCst);

        assert_eq!(rt.wait(PipId::Task(id)).unwrap(), 0);
        assert_eq!(TASK_SAW_ROOT_EXPORT.load(Ordering::SeqCst), root_token as usize);
        assert!(matches!(rt.import(PipId::Task(id)), Err(PipError::NoSuchEntity(_))));
    }

    #[test]
    fn test_export_null_rejected() {
        let rt = builder().create_root().unwrap();
        assert!(matches!(
            rt.export(std::ptr::null_mut()),
            Err(PipError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_cross_task_free() {
        BuiltinLoader::register("rt-alloc", alloc_main);
        let rt = builder().ntasks(1).create_root().unwrap();
        let id = rt.spawn(SpawnRequest::new("rt-alloc")).unwrap();
        let block = loop {
            let ptr = rt.import(PipId::Task(id)).unwrap();
            if !ptr.is_null() {
                break ptr.cast::<u8>();
            }
            std::thread::yield_now();
        };
        unsafe {
            assert_eq!(*block.add(63), 0xab);
            rt.free(std::ptr::NonNull::new(block).unwrap()).unwrap();
        }
        assert_eq!(rt.wait(PipId::Task(id)).unwrap(), 0);
    }

    #[test]
    fn test_root_malloc_free() {
        let rt = builder().create_root().unwrap();
        let block = rt.malloc(100).unwrap();
        unsafe {
            block.as_ptr().write_bytes(1, 100);
            rt.free(block).unwrap();
        }
    }
}

#[cfg(test)]
mod fin_tests {
    use super::*;

    static RELEASE: AtomicBool = AtomicBool::new(false);

    unsafe extern "C" fn parked_main(
        _argc: c_int,
        _argv: *mut *mut c_char,
        _envp: *mut *mut c_char,
    ) -> c_int {
        while !RELEASE.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
        0
    }

    #[test]
    fn test_fin_busy_then_ok() {
        BuiltinLoader::register("rt-parked", parked_main);
        let mut rt = builder().ntasks(1).create_root().unwrap();
        let id = rt.spawn(SpawnRequest::new("rt-parked")).unwrap();
        assert!(matches!(rt.fin(), Err(PipError::Busy(_))));

        RELEASE.store(true, Ordering::SeqCst);
        rt.wait(PipId::Task(id)).unwrap();
        rt.fin().unwrap();
        assert!(rt.is_finalized());
        assert!(matches!(rt.ntasks(), Err(PipError::NotPermitted(_))));
        assert!(rt.idstr().starts_with("(PID:"));
    }

    #[test]
    fn test_loaded_objects() {
        BuiltinLoader::register("rt-parked", parked_main);
        RELEASE.store(true, Ordering::SeqCst);
        let rt = builder().ntasks(1).create_root().unwrap();
        assert!(rt.loaded_objects(PipId::Root).unwrap().is_empty());
        let id = rt.spawn(SpawnRequest::new("rt-parked")).unwrap();
        if let Ok(objects) = rt.loaded_objects(PipId::Task(id)) {
            assert!(objects.iter().all(|o| o.name == "builtin:rt-parked"));
        }
        rt.wait(PipId::Task(id)).unwrap();
    }
}
