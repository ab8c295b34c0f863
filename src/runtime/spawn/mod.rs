//! Task spawner
//!
//! `spawn` claims a slot, copies the argument and environment vectors,
//! loads the program (or leaves that to the new unit for the pipclone
//! strategy) and starts an OS thread or process on [`task_entry`].
//!
//! The new unit binds itself to its core, closes close-on-exec descriptors
//! when its descriptor table is private, runs the optional `before` hook,
//! re-initialises the target's libc and calls `main` inside an exit
//! continuation. `Runtime::exit` lands on that continuation, so an early
//! exit returns here instead of tearing down the whole address space.

mod affinity;

pub use affinity::{bind_current, current_cores, CoreBinding};

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::fmt;
use std::iter;
use std::os::unix::ffi::OsStrExt;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::runtime::context::{run_with_exit, ExitFrame};
use crate::runtime::error::{PipError, Result};
use crate::runtime::loader::{load_target, ImageLoader, MainFn};
use crate::runtime::mode::{launcher_for, shared_clone_flags, LaunchRequest, Options};
use crate::runtime::shared::{PipId, RuntimeRoot, TaskControlBlock, TaskState, NTASKS_MAX};
use crate::runtime::sync::gettid;
use crate::runtime::Runtime;
use crate::util::config::ENV_ROOT;

/// Callback run inside the new task around `main`
pub type Hook = Box<dyn FnOnce() -> i32 + Send>;

/// Owned, NUL-terminated `char *[]`
pub struct CVec {
    strings: Vec<CString>,
    raw: *mut *mut c_char,
    len: usize,
}

// SAFETY: the pointer array only refers to the owned strings.
unsafe impl Send for CVec {}
unsafe impl Sync for CVec {}

impl CVec {
    pub fn new<I, S>(items: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<Vec<u8>>,
    {
        let strings = items
            .into_iter()
            .map(CString::new)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| PipError::InvalidArgument("string contains a NUL byte"))?;
        let ptrs: Box<[*mut c_char]> = strings
            .iter()
            .map(|s| s.as_ptr() as *mut c_char)
            .chain(iter::once(ptr::null_mut()))
            .collect();
        let len = strings.len();
        Ok(Self {
            strings,
            raw: Box::into_raw(ptrs).cast(),
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn argc(&self) -> c_int {
        self.len as c_int
    }

    /// The vector as `char **`, valid while `self` lives.
    pub fn as_ptr(&self) -> *mut *mut c_char {
        self.raw
    }

    pub fn iter(&self) -> impl Iterator<Item = &CStr> {
        self.strings.iter().map(CString::as_c_str)
    }
}

impl Drop for CVec {
    fn drop(&mut self) {
        // SAFETY: `raw` came from a boxed slice of `len + 1` pointers.
        unsafe {
            let slice = ptr::slice_from_raw_parts_mut(self.raw, self.len + 1);
            drop(Box::from_raw(slice));
        }
    }
}

impl fmt::Debug for CVec {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Read `name` from a `char *envp[]` vector.
///
/// # Safety
///
/// `envp` must be null or a NULL-terminated vector of C strings.
pub unsafe fn env_value(
    envp: *const *mut c_char,
    name: &str,
) -> Option<String> {
    if envp.is_null() {
        return None;
    }
    let prefix = format!("{}=", name);
    let mut cursor = envp;
    while !(*cursor).is_null() {
        let entry = CStr::from_ptr(*cursor).to_bytes();
        if let Some(value) = entry.strip_prefix(prefix.as_bytes()) {
            return Some(String::from_utf8_lossy(value).into_owned());
        }
        cursor = cursor.add(1);
    }
    None
}

/// Everything `spawn` needs to know about the new task
pub struct SpawnRequest {
    program: String,
    argv: Vec<String>,
    envp: Option<Vec<String>>,
    core: Option<usize>,
    pipid: PipId,
    before: Option<Hook>,
    after: Option<Hook>,
}

impl SpawnRequest {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            argv: Vec::new(),
            envp: None,
            core: None,
            pipid: PipId::Any,
            before: None,
            after: None,
        }
    }

    /// Full argument vector including `argv[0]`; defaults to the program path.
    pub fn args<I, S>(
        mut self,
        args: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv = args.into_iter().map(Into::into).collect();
        self
    }

    /// Environment as `NAME=value` strings; defaults to the caller's environment.
    pub fn envs<I, S>(
        mut self,
        envs: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.envp = Some(envs.into_iter().map(Into::into).collect());
        self
    }

    pub fn core(
        mut self,
        core: usize,
    ) -> Self {
        self.core = Some(core);
        self
    }

    /// Requested slot, `PipId::Any` by default.
    pub fn pipid(
        mut self,
        pipid: PipId,
    ) -> Self {
        self.pipid = pipid;
        self
    }

    /// Run `hook` in the new task before `main`; a non-zero result becomes
    /// the task's exit value and `main` is skipped.
    pub fn before<F>(
        mut self,
        hook: F,
    ) -> Self
    where
        F: FnOnce() -> i32 + Send + 'static,
    {
        self.before = Some(Box::new(hook));
        self
    }

    /// Run `hook` in the new task after `main` returned or exited.
    pub fn after<F>(
        mut self,
        hook: F,
    ) -> Self
    where
        F: FnOnce() -> i32 + Send + 'static,
    {
        self.after = Some(Box::new(hook));
        self
    }
}

impl fmt::Debug for SpawnRequest {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("SpawnRequest")
            .field("program", &self.program)
            .field("argv", &self.argv)
            .field("core", &self.core)
            .field("pipid", &self.pipid)
            .field("before", &self.before.is_some())
            .field("after", &self.after.is_some())
            .finish()
    }
}

#[derive(Default)]
struct SpawnHooks {
    before: Option<Hook>,
    after: Option<Hook>,
}

/// Spawn record, owned by the slot until the task is reaped
pub(crate) struct SpawnArgs {
    pipid: usize,
    prog: CString,
    argv: CVec,
    envv: CVec,
    core: Option<usize>,
    hooks: Mutex<SpawnHooks>,
    loader: Arc<dyn ImageLoader>,
    root: NonNull<RuntimeRoot>,
}

impl SpawnArgs {
    /// # Safety
    ///
    /// `raw` must come from `spawn` and not have been released.
    pub(crate) unsafe fn release(raw: *mut c_void) {
        if !raw.is_null() {
            drop(Box::from_raw(raw.cast::<SpawnArgs>()));
        }
    }
}

pub(crate) fn task_environment(
    envp: Option<Vec<String>>,
    root_addr: usize,
) -> Vec<Vec<u8>> {
    let prefix = format!("{}=", ENV_ROOT);
    let base: Vec<Vec<u8>> = match envp {
        Some(envs) => envs.into_iter().map(String::into_bytes).collect(),
        None => std::env::vars_os()
            .map(|(k, v)| {
                let mut entry = k.as_bytes().to_vec();
                entry.push(b'=');
                entry.extend_from_slice(v.as_bytes());
                entry
            })
            .collect(),
    };
    base.into_iter()
        .filter(|entry| !entry.starts_with(prefix.as_bytes()))
        .chain(iter::once(format!("{}{:#x}", prefix, root_addr).into_bytes()))
        .collect()
}

impl Runtime {
    /// Start a new task; returns its slot.
    pub fn spawn(
        &self,
        request: SpawnRequest,
    ) -> Result<usize> {
        let root = self.require_root()?;
        if request.program.is_empty() {
            return Err(PipError::InvalidArgument("program path is empty"));
        }
        let launcher = launcher_for(root.mode());

        let SpawnRequest {
            program,
            argv,
            envp,
            core,
            pipid,
            before,
            after,
        } = request;
        let prog = CString::new(program.clone())
            .map_err(|_| PipError::InvalidArgument("program path contains a NUL byte"))?;
        let argv = if argv.is_empty() {
            CVec::new([program.clone()])?
        } else {
            CVec::new(argv)?
        };
        let envv = CVec::new(task_environment(envp, self.root.as_ptr() as usize))?;

        let slot = {
            let guard = root.lock_ldlinux.lock_with(gettid());
            if root.ntasks_accum() >= NTASKS_MAX {
                return Err(PipError::ResourceExhausted(NTASKS_MAX));
            }
            let slot = root.claim(pipid)?;
            let tcb = &root.tasks()[slot];
            if !launcher.defers_load() {
                // load on the target core so the namespace's pages land close to it
                let loaded = CoreBinding::bind_opt(core).and_then(|_binding| {
                    load_target(self.loader.as_ref(), &prog, None, &guard)
                });
                match loaded {
                    Ok((ns, hooks)) => {
                        tcb.set_namespace(Some(ns));
                        // SAFETY: the slot was just claimed under the lock.
                        unsafe { tcb.set_hooks(hooks) };
                    }
                    Err(e) => {
                        tcb.reset();
                        return Err(e);
                    }
                }
            }
            // counted before the task can run, so a reap never sees it uncounted
            root.count_spawn();
            slot
        };

        let tcb = &root.tasks()[slot];
        let args = Box::new(SpawnArgs {
            pipid: slot,
            prog,
            argv,
            envv,
            core,
            hooks: Mutex::new(SpawnHooks { before, after }),
            loader: Arc::clone(&self.loader),
            root: self.root,
        });
        let raw = Box::into_raw(args).cast::<c_void>();
        tcb.set_args(raw);
        tcb.set_state(TaskState::Running);

        let launch = LaunchRequest {
            start: task_entry,
            arg: raw,
            stack_size: self.config.stack_size,
            core,
        };
        match launcher.launch(root, &launch) {
            Ok(launched) => {
                tcb.set_thread(launched.thread);
                tcb.set_pid(launched.pid);
                debug!(
                    "{} spawned '{}' as task {} ({})",
                    self.idstr(),
                    program,
                    slot,
                    launcher.mode()
                );
                Ok(slot)
            }
            Err(e) => {
                // SAFETY: the unit never started, so nothing else holds `raw`.
                unsafe { SpawnArgs::release(raw) };
                if let Some(ns) = tcb.namespace() {
                    let guard = root.lock_ldlinux.lock_with(gettid());
                    self.loader.close(ns, &guard);
                }
                tcb.reset();
                root.uncount_spawn();
                warn!("{} spawning '{}' failed: {}", self.idstr(), program, e);
                Err(e)
            }
        }
    }
}

/// `main` call carried through the exit continuation
pub(crate) struct MainCall {
    pub(crate) main: MainFn,
    pub(crate) argc: c_int,
    pub(crate) argv: *mut *mut c_char,
    pub(crate) envv: *mut *mut c_char,
    pub(crate) retval: i32,
}

pub(crate) unsafe extern "C" fn enter_main(arg: *mut c_void) {
    let call = &mut *arg.cast::<MainCall>();
    call.retval = (call.main)(call.argc, call.argv, call.envv);
}

/// Start routine of every task thread or process.
extern "C" fn task_entry(arg: *mut c_void) -> *mut c_void {
    // SAFETY: `arg` is the slot's SpawnArgs, alive until the task is reaped,
    // and the region outlives every task.
    let args = unsafe { &*arg.cast::<SpawnArgs>() };
    let root = unsafe { args.root.as_ref() };
    let Some(tcb) = root.task(args.pipid) else {
        return ptr::null_mut();
    };
    // SAFETY: plain identity queries.
    unsafe {
        tcb.set_thread(libc::pthread_self());
        tcb.set_pid(libc::getpid());
    }

    let retval = run_task(root, tcb, args);
    tcb.set_retval(retval);
    let _ = tcb.transition(TaskState::Running, TaskState::Exited);

    if root.options().contains(Options::FORCE_EXIT) {
        debug!("<PIPID:{}> force exit with {}", args.pipid, retval);
        // SAFETY: nothing on this stack needs dropping any more.
        unsafe {
            if root.mode().is_threaded() {
                libc::pthread_exit(ptr::null_mut());
            } else {
                libc::exit(retval);
            }
        }
    }
    retval as isize as *mut c_void
}

fn run_task(
    root: &RuntimeRoot,
    tcb: &TaskControlBlock,
    args: &SpawnArgs,
) -> i32 {
    let launcher = launcher_for(root.mode());
    if let Some(core) = args.core {
        if !launcher.binds_on_create() {
            if let Err(e) = bind_current(core) {
                warn!("<PIPID:{}> cannot bind to core {}: {}", args.pipid, core, e);
            }
        }
    }
    if shared_clone_flags(root) & libc::CLONE_FILES == 0 {
        close_on_exec();
    }

    if launcher.defers_load() {
        let guard = root.lock_ldlinux.lock_with(gettid());
        match load_target(args.loader.as_ref(), &args.prog, None, &guard) {
            Ok((ns, hooks)) => {
                tcb.set_namespace(Some(ns));
                // SAFETY: the task itself is the only loader of its slot.
                unsafe { tcb.set_hooks(hooks) };
            }
            Err(e) => {
                warn!("<PIPID:{}> {}", args.pipid, e);
                return e.errno();
            }
        }
    }

    let SpawnHooks { before, after } = std::mem::take(&mut *args.hooks.lock());
    if let Some(before) = before {
        let rc = before();
        if rc != 0 {
            debug!("<PIPID:{}> before hook returned {}", args.pipid, rc);
            return rc;
        }
    }

    let hooks = tcb.hooks();
    let Some(main) = hooks.main else {
        warn!("<PIPID:{}> no entry point resolved", args.pipid);
        return libc::ENOEXEC;
    };

    let mut frame = ExitFrame::default();
    let mut call = MainCall {
        main,
        argc: args.argv.argc(),
        argv: args.argv.as_ptr(),
        envv: args.envv.as_ptr(),
        retval: 0,
    };
    // SAFETY: the namespace stays loaded and the vectors stay alive until
    // the slot is reaped; `frame` and `call` outlive the continuation.
    let retval = unsafe {
        hooks.install(call.argc, call.argv, call.envv);
        tcb.set_exit_frame(&raw mut frame);
        let exited = run_with_exit(&raw mut frame, enter_main, (&raw mut call).cast());
        tcb.set_exit_frame(ptr::null_mut());
        if exited {
            tcb.retval()
        } else {
            call.retval
        }
    };

    if let Some(after) = after {
        let rc = after();
        if rc != 0 {
            debug!("<PIPID:{}> after hook returned {}", args.pipid, rc);
        }
    }
    // SAFETY: as above.
    unsafe { hooks.flush() };
    retval
}

/// Close every descriptor flagged close-on-exec.
fn close_on_exec() {
    let fds: Vec<c_int> = match std::fs::read_dir("/proc/self/fd") {
        Ok(dir) => dir
            .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
            .collect(),
        Err(e) => {
            debug!("cannot list /proc/self/fd: {}", e);
            return;
        }
    };
    for fd in fds {
        // SAFETY: fcntl on a stale descriptor just fails with EBADF.
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            if flags >= 0 && flags & libc::FD_CLOEXEC != 0 {
                libc::close(fd);
            }
        }
    }
}

#[cfg(test)]
mod tests;
