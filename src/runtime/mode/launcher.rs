//! OS-unit creation, one strategy per execution mode

use std::ffi::{c_int, c_void};
use std::mem::MaybeUninit;
use std::sync::atomic::Ordering;

use tracing::debug;

use super::ExecMode;
use crate::runtime::error::{PipError, Result};
use crate::runtime::shared::RuntimeRoot;
use crate::runtime::sync::gettid;

/// Entry point of a new thread or process
pub type StartRoutine = extern "C" fn(*mut c_void) -> *mut c_void;

/// What the new unit should run and where
#[derive(Debug)]
pub struct LaunchRequest {
    pub start: StartRoutine,
    pub arg: *mut c_void,
    pub stack_size: usize,
    pub core: Option<usize>,
}

/// Handles of the created unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Launched {
    pub thread: libc::pthread_t,
    pub pid: libc::pid_t,
}

/// Creates the OS unit that runs a task
pub trait Launcher: Sync {
    fn mode(&self) -> ExecMode;

    /// The new unit loads the program itself instead of the spawner.
    fn defers_load(&self) -> bool {
        false
    }

    /// Core binding is applied while the unit is created.
    fn binds_on_create(&self) -> bool {
        false
    }

    fn launch(
        &self,
        root: &RuntimeRoot,
        request: &LaunchRequest,
    ) -> Result<Launched>;
}

struct ThreadLauncher;
struct PreloadLauncher;
struct PipCloneLauncher;

static THREAD: ThreadLauncher = ThreadLauncher;
static PRELOAD: PreloadLauncher = PreloadLauncher;
static PIPCLONE: PipCloneLauncher = PipCloneLauncher;

/// The launcher implementing `mode`.
pub fn launcher_for(mode: ExecMode) -> &'static dyn Launcher {
    match mode {
        ExecMode::Thread => &THREAD,
        ExecMode::ProcessPreload => &PRELOAD,
        ExecMode::ProcessPipClone => &PIPCLONE,
    }
}

fn create_pthread(request: &LaunchRequest) -> Result<libc::pthread_t> {
    let mut attr = MaybeUninit::<libc::pthread_attr_t>::uninit();
    // SAFETY: attr is initialised by pthread_attr_init before any other use
    // and destroyed exactly once.
    unsafe {
        let rc = libc::pthread_attr_init(attr.as_mut_ptr());
        if rc != 0 {
            return Err(PipError::from_errno(rc));
        }
        let rc = libc::pthread_attr_setstacksize(attr.as_mut_ptr(), request.stack_size);
        if rc != 0 {
            libc::pthread_attr_destroy(attr.as_mut_ptr());
            return Err(PipError::from_errno(rc));
        }
        let mut thread: libc::pthread_t = 0;
        let rc = libc::pthread_create(&mut thread, attr.as_ptr(), request.start, request.arg);
        libc::pthread_attr_destroy(attr.as_mut_ptr());
        if rc != 0 {
            return Err(PipError::from_errno(rc));
        }
        Ok(thread)
    }
}

impl Launcher for ThreadLauncher {
    fn mode(&self) -> ExecMode {
        ExecMode::Thread
    }

    fn launch(
        &self,
        _root: &RuntimeRoot,
        request: &LaunchRequest,
    ) -> Result<Launched> {
        let thread = create_pthread(request)?;
        Ok(Launched {
            thread,
            // SAFETY: getpid has no preconditions.
            pid: unsafe { libc::getpid() },
        })
    }
}

impl Launcher for PreloadLauncher {
    fn mode(&self) -> ExecMode {
        ExecMode::ProcessPreload
    }

    fn launch(
        &self,
        root: &RuntimeRoot,
        request: &LaunchRequest,
    ) -> Result<Launched> {
        let info = root
            .cloneinfo()
            .ok_or(PipError::NotPermitted("pip_clone_info is not available"))?;

        // The wrapper also sees clone() calls from outside the runtime; the
        // held lock tells it this one is ours.
        let created = {
            let _guard = info.lock.lock_with(gettid());
            create_pthread(request)
        };
        let pid = info.pid_clone.swap(0, Ordering::SeqCst);
        let thread = created?;
        debug!("preloaded clone created pid {}", pid);
        Ok(Launched { thread, pid })
    }
}

impl Launcher for PipCloneLauncher {
    fn mode(&self) -> ExecMode {
        ExecMode::ProcessPipClone
    }

    fn defers_load(&self) -> bool {
        true
    }

    fn binds_on_create(&self) -> bool {
        true
    }

    fn launch(
        &self,
        root: &RuntimeRoot,
        request: &LaunchRequest,
    ) -> Result<Launched> {
        let clone_fn = root
            .clone_fn()
            .ok_or(PipError::NotPermitted("pip_clone_mostly_pthread is not available"))?;

        // shared VM and TLS setup, but private fd table and signal handlers
        let flags: c_int = libc::CLONE_VM
            | libc::CLONE_SETTLS
            | libc::CLONE_PARENT_SETTID
            | libc::CLONE_CHILD_CLEARTID
            | libc::CLONE_SYSVSEM
            | libc::CLONE_PTRACE
            | libc::SIGCHLD;
        let core = request.core.map_or(-1, |c| c as c_int);

        let mut thread: libc::pthread_t = 0;
        let mut pid: libc::pid_t = 0;
        // SAFETY: the hook follows the pthread_create contract for `start`
        // and `arg`, and writes the two out-parameters.
        let rc = unsafe {
            clone_fn(
                &mut thread,
                flags,
                core,
                request.stack_size,
                request.start,
                request.arg,
                &mut pid,
            )
        };
        if rc != 0 {
            return Err(PipError::from_errno(rc));
        }
        debug!("pipclone created pid {}", pid);
        Ok(Launched { thread, pid })
    }
}
