//! User-level processes
//!
//! A ULP is a program loaded into its own namespace like a task, but run on
//! a private stack inside the calling task's thread. Control moves between
//! the task and its ULPs only by explicit switches; nothing preempts them.
//!
//! ```text
//! task thread ──yield_to(a)──▶ ULP a ──yield_to(b)──▶ ULP b
//!      ▲                         ▲                       │
//!      └─────── a finishes ──────┴──── yield_back ───────┘
//! ```
//!
//! A finished ULP switches back to the context that last resumed it. Its
//! stack stays mapped until the handle is recycled, which puts the stack on
//! the task's free list for the next [`Runtime::ulp_spawn`].

pub mod stack;

pub use stack::StackRegion;

use std::ffi::{c_void, CString};
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::runtime::context::{exit_to, run_with_exit, switch, Context, ExitFrame};
use crate::runtime::error::{PipError, Result};
use crate::runtime::loader::{load_target, ImageLoader, Namespace, TargetHooks};
use crate::runtime::shared::{RuntimeRoot, TaskControlBlock};
use crate::runtime::spawn::{enter_main, task_environment, CVec, MainCall};
use crate::runtime::sync::gettid;
use crate::runtime::{Role, Runtime};

/// Callback run on the ULP's stack with its exit status, right after `main`
pub type ExitHook = Box<dyn FnOnce(i32) + Send>;

/// Scheduling state of a ULP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UlpState {
    Created,
    Running,
    Suspended,
    Finished,
}

/// What to run as a ULP
pub struct UlpRequest {
    program: String,
    argv: Vec<String>,
    envp: Option<Vec<String>>,
    exit_hook: Option<ExitHook>,
}

impl UlpRequest {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            argv: Vec::new(),
            envp: None,
            exit_hook: None,
        }
    }

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

    pub fn on_exit<F>(
        mut self,
        hook: F,
    ) -> Self
    where
        F: FnOnce(i32) + Send + 'static,
    {
        self.exit_hook = Some(Box::new(hook));
        self
    }
}

impl fmt::Debug for UlpRequest {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("UlpRequest")
            .field("program", &self.program)
            .field("argv", &self.argv)
            .field("on_exit", &self.exit_hook.is_some())
            .finish()
    }
}

struct UlpContext {
    ctx: Context,
    /// Context that resumed this one last; null for the task thread itself
    caller: *mut UlpContext,
    state: UlpState,
    retval: i32,
    exit_frame: ExitFrame,
    stack: Option<StackRegion>,
    namespace: Option<Namespace>,
    hooks: TargetHooks,
    argv: CVec,
    envv: CVec,
    exit_hook: Option<ExitHook>,
    owner: *const TaskControlBlock,
}

/// Handle on a spawned ULP
pub struct Ulp {
    inner: NonNull<UlpContext>,
    root: NonNull<RuntimeRoot>,
    loader: Arc<dyn ImageLoader>,
}

// SAFETY: the context is only touched by the owning task's thread through
// runtime calls; the handle itself may be moved around.
unsafe impl Send for Ulp {}

impl Ulp {
    fn inner(&self) -> &UlpContext {
        // SAFETY: owned by the handle until drop.
        unsafe { self.inner.as_ref() }
    }

    pub fn state(&self) -> UlpState {
        self.inner().state
    }

    pub fn is_finished(&self) -> bool {
        self.state() == UlpState::Finished
    }

    /// Exit status once finished.
    pub fn retval(&self) -> Option<i32> {
        self.is_finished().then(|| self.inner().retval)
    }

    /// Lowest usable address of the ULP's stack; null after recycling.
    pub fn stack_addr(&self) -> *const u8 {
        self.inner()
            .stack
            .as_ref()
            .map_or(ptr::null(), |s| s.bottom().cast_const())
    }
}

impl fmt::Debug for Ulp {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Ulp")
            .field("state", &self.state())
            .field("stack", &self.stack_addr())
            .finish()
    }
}

impl Drop for Ulp {
    fn drop(&mut self) {
        // SAFETY: the handle owns the context, which came from Box::into_raw.
        let mut inner = unsafe { Box::from_raw(self.inner.as_ptr()) };
        if inner.state == UlpState::Running || inner.state == UlpState::Suspended {
            warn!("dropping a ULP that has not finished");
        }
        if let Some(ns) = inner.namespace.take() {
            // SAFETY: the region outlives every ULP of its tasks.
            let root = unsafe { self.root.as_ref() };
            let guard = root.lock_ldlinux.lock_with(gettid());
            self.loader.close(ns, &guard);
        }
    }
}

/// Unmap the recycled stacks kept for `tcb`.
pub(crate) fn release_stacks(
    root: &RuntimeRoot,
    tcb: &TaskControlBlock,
) {
    let count = stack::drain(&root.lock_ulpstacks, tcb.ulp_stacks(), root.page_size());
    if count > 0 {
        debug!("released {} recycled ULP stacks", count);
    }
}

/// First code run on a fresh ULP stack.
unsafe extern "C" fn ulp_entry(arg: *mut c_void) -> ! {
    let ulp = arg.cast::<UlpContext>();
    let hooks = (*ulp).hooks;
    if let Some(main) = hooks.main {
        let mut call = MainCall {
            main,
            argc: (*ulp).argv.argc(),
            argv: (*ulp).argv.as_ptr(),
            envv: (*ulp).envv.as_ptr(),
            retval: 0,
        };
        hooks.install(call.argc, call.argv, call.envv);
        let exited = run_with_exit(&raw mut (*ulp).exit_frame, enter_main, (&raw mut call).cast());
        if !exited {
            (*ulp).retval = call.retval;
        }
        hooks.flush();
    } else {
        (*ulp).retval = libc::ENOEXEC;
    }

    if let Some(hook) = (*ulp).exit_hook.take() {
        hook((*ulp).retval);
    }
    (*ulp).state = UlpState::Finished;

    let caller = (*ulp).caller;
    let tcb = &*(*ulp).owner;
    tcb.set_ulp_curr(caller.cast());
    let to = if caller.is_null() {
        tcb.ulp_host().cast_const()
    } else {
        (*caller).state = UlpState::Running;
        &raw const (*caller).ctx
    };
    switch(&raw mut (*ulp).ctx, to);
    // finished contexts are never switched to
    std::process::abort()
}

impl Runtime {
    fn own_task(&self) -> Result<(&RuntimeRoot, &TaskControlBlock)> {
        let root = self.shared()?;
        match self.role {
            Role::Task(slot) => Ok((root, &root.tasks()[slot])),
            Role::Root => Err(PipError::NotPermitted("ULPs belong to tasks, not to the root")),
        }
    }

    fn current_ulp(&self) -> Result<(&TaskControlBlock, *mut UlpContext)> {
        let (_, tcb) = self.own_task()?;
        let curr = tcb.ulp_curr().cast::<UlpContext>();
        if curr.is_null() {
            return Err(PipError::NotPermitted("not running inside a ULP"));
        }
        Ok((tcb, curr))
    }

    /// Load a program as a new ULP of the calling task. It does not run
    /// until the task yields to it.
    pub fn ulp_spawn(
        &self,
        request: UlpRequest,
    ) -> Result<Ulp> {
        let (root, tcb) = self.own_task()?;
        if request.program.is_empty() {
            return Err(PipError::InvalidArgument("program path is empty"));
        }
        let UlpRequest {
            program,
            argv,
            envp,
            exit_hook,
        } = request;
        let prog = CString::new(program.clone())
            .map_err(|_| PipError::InvalidArgument("program path contains a NUL byte"))?;
        let argv = if argv.is_empty() {
            CVec::new([program.clone()])?
        } else {
            CVec::new(argv)?
        };
        let envv = CVec::new(task_environment(envp, self.region_addr()))?;

        let stack = stack::acquire(
            &root.lock_ulpstacks,
            tcb.ulp_stacks(),
            self.config.stack_size,
            root.page_size(),
        )?;
        // on failure the stack is unmapped instead of recycled
        let (namespace, hooks) = {
            let guard = root.lock_ldlinux.lock_with(gettid());
            load_target(self.loader.as_ref(), &prog, None, &guard)?
        };

        let top = stack.top();
        let inner = Box::into_raw(Box::new(UlpContext {
            ctx: Context::current(),
            caller: ptr::null_mut(),
            state: UlpState::Created,
            retval: 0,
            exit_frame: ExitFrame::default(),
            stack: Some(stack),
            namespace: Some(namespace),
            hooks,
            argv,
            envv,
            exit_hook,
            owner: tcb,
        }));
        // SAFETY: `top` ends the ULP's own stack, which lives as long as the context.
        unsafe { (*inner).ctx = Context::prepare(top, ulp_entry, inner.cast()) };
        debug!("{} created ULP '{}'", self.idstr(), program);

        Ok(Ulp {
            // SAFETY: Box::into_raw never returns null.
            inner: unsafe { NonNull::new_unchecked(inner) },
            root: self.root,
            loader: Arc::clone(&self.loader),
        })
    }

    /// Suspend the caller (task or ULP) and run `target` until it yields
    /// or finishes.
    pub fn ulp_yield_to(
        &self,
        target: &Ulp,
    ) -> Result<()> {
        let (_, tcb) = self.own_task()?;
        let to = target.inner.as_ptr();
        // SAFETY: all contexts of this task are driven by this thread only.
        unsafe {
            match (*to).state {
                UlpState::Finished => return Err(PipError::InvalidArgument("ULP has finished")),
                UlpState::Running => return Err(PipError::InvalidArgument("ULP is already running")),
                UlpState::Created | UlpState::Suspended => {}
            }
            let curr = tcb.ulp_curr().cast::<UlpContext>();
            let from = if curr.is_null() {
                tcb.ulp_host()
            } else {
                (*curr).state = UlpState::Suspended;
                &raw mut (*curr).ctx
            };
            (*to).caller = curr;
            (*to).state = UlpState::Running;
            tcb.set_ulp_curr(to.cast());
            switch(from, &raw const (*to).ctx);
            if !curr.is_null() {
                (*curr).state = UlpState::Running;
            }
        }
        Ok(())
    }

    /// From inside a ULP, switch back to the context that resumed it.
    pub fn ulp_yield_back(&self) -> Result<()> {
        let (tcb, curr) = self.current_ulp()?;
        // SAFETY: `curr` is the running ULP of this thread.
        unsafe {
            let caller = (*curr).caller;
            (*curr).state = UlpState::Suspended;
            tcb.set_ulp_curr(caller.cast());
            let to = if caller.is_null() {
                tcb.ulp_host().cast_const()
            } else {
                (*caller).state = UlpState::Running;
                &raw const (*caller).ctx
            };
            switch(&raw mut (*curr).ctx, to);
            (*curr).state = UlpState::Running;
        }
        Ok(())
    }

    /// End the running ULP with `status`; returns only on error.
    pub fn ulp_exit(
        &self,
        status: i32,
    ) -> Result<std::convert::Infallible> {
        let (_, curr) = self.current_ulp()?;
        // SAFETY: the ULP's `main` runs inside run_with_exit on its frame.
        unsafe {
            (*curr).retval = status;
            exit_to(&raw const (*curr).exit_frame)
        }
    }

    /// Release a finished ULP's namespace and keep its stack for reuse.
    /// Returns the ULP's exit status.
    pub fn ulp_recycle(
        &self,
        ulp: &mut Ulp,
    ) -> Result<i32> {
        let (root, tcb) = self.own_task()?;
        let inner = ulp.inner.as_ptr();
        // SAFETY: the handle owns the context and the ULP is not running.
        unsafe {
            if (*inner).state != UlpState::Finished {
                return Err(PipError::Busy("ULP has not finished"));
            }
            let Some(stack) = (*inner).stack.take() else {
                return Err(PipError::InvalidArgument("ULP was already recycled"));
            };
            if let Some(ns) = (*inner).namespace.take() {
                let guard = root.lock_ldlinux.lock_with(gettid());
                self.loader.close(ns, &guard);
            }
            stack::push(&root.lock_ulpstacks, tcb.ulp_stacks(), stack);
            Ok((*inner).retval)
        }
    }
}
