//! Process-in-process runtime
//!
//! A [`Runtime`] is the handle every operation goes through. The root
//! program creates the shared region with [`RuntimeBuilder::create_root`];
//! a spawned task re-enters [`RuntimeBuilder::init`], finds `PIP_ROOT` in
//! its environment and attaches to its own slot instead.
//!
//! ```no_run
//! use pip_runtime::runtime::{RuntimeBuilder, PipId};
//! use pip_runtime::runtime::spawn::SpawnRequest;
//!
//! # fn main() -> pip_runtime::runtime::Result<()> {
//! let mut rt = RuntimeBuilder::new().ntasks(4).init()?;
//! let id = rt.spawn(SpawnRequest::new("./a.out").args(["a.out", "-v"]))?;
//! let status = rt.wait(PipId::Task(id))?;
//! rt.fin()?;
//! # Ok(()) }
//! ```

pub mod context;
pub mod error;
pub mod lifecycle;
pub mod loader;
pub mod mode;
pub mod shared;
pub mod spawn;
pub mod sync;
pub mod ulp;

pub use error::{AttachError, PipError, Result};
pub use loader::{BuiltinLoader, DlmopenLoader, ImageLoader, LoadedObject};
pub use mode::{DlsymProbe, ExecMode, HookProbe, NoHooks, Options};
pub use shared::{PipId, NTASKS_MAX};

use std::ffi::c_void;
use std::fmt;
use std::io::Write;
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::util::config::{RuntimeConfig, ENV_ROOT};
use mode::negotiate;
use shared::{RootParams, RuntimeRoot, TaskControlBlock};
use sync::gettid;

/// Header in front of every [`Runtime::malloc`] block
const ALLOC_TAG: usize = 16;

/// Which participant a handle belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Root,
    Task(usize),
}

/// Handle on an initialised runtime
pub struct Runtime {
    pub(crate) root: NonNull<RuntimeRoot>,
    pub(crate) role: Role,
    pub(crate) config: RuntimeConfig,
    pub(crate) loader: Arc<dyn ImageLoader>,
    finalized: bool,
}

// SAFETY: the region is shared by design and guarded by its own atomics and
// spin locks.
unsafe impl Send for Runtime {}
unsafe impl Sync for Runtime {}

/// Configures and creates a [`Runtime`]
pub struct RuntimeBuilder {
    ntasks: usize,
    options: Options,
    config: Option<RuntimeConfig>,
    probe: Box<dyn HookProbe>,
    loader: Arc<dyn ImageLoader>,
    export: *mut c_void,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            ntasks: NTASKS_MAX,
            options: Options::empty(),
            config: None,
            probe: Box::new(DlsymProbe),
            loader: Arc::new(DlmopenLoader),
            export: ptr::null_mut(),
        }
    }

    /// Task capacity of a new root; ignored when attaching.
    pub fn ntasks(
        mut self,
        ntasks: usize,
    ) -> Self {
        self.ntasks = ntasks;
        self
    }

    pub fn options(
        mut self,
        options: Options,
    ) -> Self {
        self.options = options;
        self
    }

    /// Use `config` instead of reading the process environment.
    pub fn config(
        mut self,
        config: RuntimeConfig,
    ) -> Self {
        self.config = Some(config);
        self
    }

    pub fn probe(
        mut self,
        probe: impl HookProbe + 'static,
    ) -> Self {
        self.probe = Box::new(probe);
        self
    }

    pub fn loader(
        mut self,
        loader: impl ImageLoader + 'static,
    ) -> Self {
        self.loader = Arc::new(loader);
        self
    }

    /// Pointer published by the root for every task to import.
    pub fn export(
        mut self,
        export: *mut c_void,
    ) -> Self {
        self.export = export;
        self
    }

    /// Attach when `PIP_ROOT` is configured, create a new root otherwise.
    pub fn init(mut self) -> Result<Runtime> {
        let config = self.config.take().unwrap_or_else(RuntimeConfig::from_env);
        match config.root_addr.clone() {
            Some(addr) => self.attach_with(&addr, config),
            None => self.create_with(config),
        }
    }

    /// Create a new root regardless of the environment.
    pub fn create_root(mut self) -> Result<Runtime> {
        let config = self.config.take().unwrap_or_else(RuntimeConfig::from_env);
        self.create_with(config)
    }

    /// Attach the calling thread to the region at `addr` (hexadecimal).
    pub fn attach(
        mut self,
        addr: &str,
    ) -> Result<Runtime> {
        let config = self.config.take().unwrap_or_else(RuntimeConfig::from_env);
        self.attach_with(addr, config)
    }

    fn create_with(
        self,
        config: RuntimeConfig,
    ) -> Result<Runtime> {
        if self.ntasks == 0 {
            return Err(PipError::InvalidArgument("task capacity must be positive"));
        }
        if self.ntasks > NTASKS_MAX {
            return Err(PipError::ResourceExhausted(NTASKS_MAX));
        }

        let negotiated = negotiate(
            self.options,
            config.mode.as_deref(),
            config.opts.as_deref(),
            self.probe.as_ref(),
        )?;
        let root = RuntimeRoot::create(RootParams {
            ntasks: self.ntasks,
            options: negotiated.options,
            mode: negotiated.mode,
            cloneinfo: negotiated.cloneinfo,
            clone_fn: negotiated.clone_fn,
            free_fn: self.probe.free_fn(),
        })?;
        if !self.export.is_null() {
            // SAFETY: freshly created, not yet shared.
            unsafe { root.as_ref() }.root_block().set_export(self.export);
        }

        debug!(
            "<PIP_ROOT> initialized: {} slots, mode {}",
            self.ntasks, negotiated.mode
        );
        Ok(Runtime {
            root,
            role: Role::Root,
            config,
            loader: self.loader,
            finalized: false,
        })
    }

    fn attach_with(
        self,
        addr: &str,
        config: RuntimeConfig,
    ) -> Result<Runtime> {
        let trimmed = addr.trim();
        let hex = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        let raw = usize::from_str_radix(hex, 16)
            .map_err(|_| AttachError::BadAddress(addr.to_string()))?;

        // SAFETY: PIP_ROOT is only ever set by a root for its own tasks.
        let root = unsafe { RuntimeRoot::validate(raw) }?;
        // SAFETY: validated above.
        let shared = unsafe { root.as_ref() };
        // SAFETY: pthread_self has no preconditions.
        let me = unsafe { libc::pthread_self() };
        let slot = shared.find_by_thread(me).ok_or(AttachError::SlotNotFound)?;

        debug!("<PIPID:{}({})> attached to {:#x}", slot, std::process::id(), raw);
        Ok(Runtime {
            root,
            role: Role::Task(slot),
            config,
            loader: self.loader,
            finalized: false,
        })
    }
}

/// Whether the calling program was started as a task.
pub fn is_pip_task() -> bool {
    std::env::var_os(ENV_ROOT).is_some()
}

impl Runtime {
    pub(crate) fn shared(&self) -> Result<&RuntimeRoot> {
        if self.finalized {
            return Err(PipError::NotPermitted("runtime is finalized"));
        }
        // SAFETY: the region outlives every handle that is not finalized.
        Ok(unsafe { self.root.as_ref() })
    }

    pub(crate) fn require_root(&self) -> Result<&RuntimeRoot> {
        let root = self.shared()?;
        match self.role {
            Role::Root => Ok(root),
            Role::Task(_) => Err(PipError::NotPermitted("only the root may do this")),
        }
    }

    /// Slot named by `id`; `None` stands for the root block.
    pub(crate) fn resolve(
        &self,
        id: PipId,
    ) -> Result<Option<usize>> {
        let root = self.shared()?;
        match id {
            PipId::Root => Ok(None),
            PipId::Myself => Ok(match self.role {
                Role::Root => None,
                Role::Task(slot) => Some(slot),
            }),
            PipId::Any => Err(PipError::InvalidArgument("ANY does not name a single task")),
            PipId::Task(n) if n >= root.capacity() => {
                Err(PipError::InvalidArgument("task id out of range"))
            }
            PipId::Task(n) if !root.tasks()[n].is_occupied() => {
                Err(PipError::NoSuchEntity(n.to_string()))
            }
            PipId::Task(n) => Ok(Some(n)),
        }
    }

    pub(crate) fn block(
        &self,
        slot: Option<usize>,
    ) -> Result<&TaskControlBlock> {
        let root = self.shared()?;
        Ok(match slot {
            None => root.root_block(),
            Some(n) => &root.tasks()[n],
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_root(&self) -> bool {
        self.role == Role::Root
    }

    /// The caller's own identifier.
    pub fn id(&self) -> PipId {
        match self.role {
            Role::Root => PipId::Root,
            Role::Task(slot) => PipId::Task(slot),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Address of the shared region, as handed to tasks in `PIP_ROOT`.
    pub fn region_addr(&self) -> usize {
        self.root.as_ptr() as usize
    }

    /// Number of live tasks.
    pub fn ntasks(&self) -> Result<usize> {
        Ok(self.shared()?.ntasks_curr())
    }

    /// Task capacity.
    pub fn capacity(&self) -> Result<usize> {
        Ok(self.shared()?.capacity())
    }

    pub fn mode(&self) -> Result<ExecMode> {
        Ok(self.shared()?.mode())
    }

    pub fn mode_str(&self) -> Result<&'static str> {
        Ok(self.mode()?.as_str())
    }

    pub fn is_threaded(&self) -> Result<bool> {
        Ok(self.mode()?.is_threaded())
    }

    /// Whether tasks share the root's descriptor table.
    pub fn shares_fd(&self) -> Result<bool> {
        Ok(mode::shared_clone_flags(self.shared()?) & libc::CLONE_FILES != 0)
    }

    /// Whether tasks share the root's signal handlers.
    pub fn shares_sighand(&self) -> Result<bool> {
        Ok(mode::shared_clone_flags(self.shared()?) & libc::CLONE_SIGHAND != 0)
    }

    /// Thread handle in thread mode, process id in process mode.
    pub fn os_id(
        &self,
        id: PipId,
    ) -> Result<u64> {
        let threaded = self.is_threaded()?;
        let block = self.block(self.resolve(id)?)?;
        Ok(if threaded {
            block.thread() as u64
        } else {
            block.pid() as u64
        })
    }

    /// Process id of a task; process modes only.
    pub fn pid(
        &self,
        id: PipId,
    ) -> Result<libc::pid_t> {
        if self.is_threaded()? {
            return Err(PipError::NotPermitted("tasks have no own pid in thread mode"));
        }
        Ok(self.block(self.resolve(id)?)?.pid())
    }

    /// Caller identity as used in log lines.
    pub fn idstr(&self) -> String {
        let pid = std::process::id();
        if self.finalized {
            return format!("(PID:{})", pid);
        }
        match self.role {
            Role::Root => "<PIP_ROOT>".to_string(),
            Role::Task(slot) => format!("<PIPID:{}({})>", slot, pid),
        }
    }

    /// Publish `value` for other tasks; only once per task.
    pub fn export(
        &self,
        value: *mut c_void,
    ) -> Result<()> {
        if value.is_null() {
            return Err(PipError::InvalidArgument("cannot export a null pointer"));
        }
        let block = self.block(self.resolve(PipId::Myself)?)?;
        if !block.export().is_null() {
            return Err(PipError::Busy("a pointer is already exported"));
        }
        block.set_export(value);
        fence(Ordering::SeqCst);
        Ok(())
    }

    /// Pointer published by `id`, null when nothing was exported yet.
    pub fn import(
        &self,
        id: PipId,
    ) -> Result<*mut c_void> {
        let block = self.block(self.resolve(id)?)?;
        fence(Ordering::SeqCst);
        Ok(block.export())
    }

    /// Pointer the root published at initialization.
    pub fn root_export(&self) -> Result<*mut c_void> {
        self.import(PipId::Root)
    }

    /// Allocate memory that any task may release with [`Runtime::free`].
    pub fn malloc(
        &self,
        size: usize,
    ) -> Result<NonNull<u8>> {
        self.shared()?;
        let total = size.checked_add(ALLOC_TAG).ok_or(PipError::OutOfMemory)?;
        // SAFETY: plain allocation.
        let base = NonNull::new(unsafe { libc::malloc(total) }.cast::<u8>())
            .ok_or(PipError::OutOfMemory)?;
        // SAFETY: the block is at least ALLOC_TAG bytes and malloc-aligned.
        unsafe {
            base.as_ptr().cast::<i32>().write(self.id().as_raw());
            Ok(NonNull::new_unchecked(base.as_ptr().add(ALLOC_TAG)))
        }
    }

    /// Release memory from [`Runtime::malloc`] through the allocating
    /// task's own allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `malloc` on a handle of the same region and must
    /// not be used afterwards.
    pub unsafe fn free(
        &self,
        ptr: NonNull<u8>,
    ) -> Result<()> {
        let root = self.shared()?;
        let base = ptr.as_ptr().sub(ALLOC_TAG);
        let owner = base.cast::<i32>().read();
        let free_fn = match PipId::from_raw(owner) {
            Some(PipId::Task(n)) => root.task(n).and_then(|t| t.hooks().free),
            _ => None,
        }
        .or_else(|| root.free_fn());
        match free_fn {
            Some(free) => free(base.cast()),
            None => libc::free(base.cast()),
        }
        Ok(())
    }

    /// Objects loaded into the namespace of `id`.
    pub fn loaded_objects(
        &self,
        id: PipId,
    ) -> Result<Vec<LoadedObject>> {
        let root = self.shared()?;
        let block = self.block(self.resolve(id)?)?;
        let Some(ns) = block.namespace() else {
            return Ok(Vec::new());
        };
        let guard = root.lock_ldlinux.lock_with(gettid());
        Ok(self.loader.loaded_objects(ns, &guard))
    }

    /// Tear the runtime down. Fails with `Busy` while any task is still
    /// occupying a slot; a task handle just detaches.
    pub fn fin(&mut self) -> Result<()> {
        let root = self.shared()?;
        if self.role == Role::Root {
            if let Some(slot) = root.tasks().iter().position(|t| t.is_occupied()) {
                debug!("<PIP_ROOT> fin: task {} is still alive", slot);
                return Err(PipError::Busy("tasks are still running"));
            }
            let _ = std::io::stdout().flush();
            // SAFETY: no task is alive and this handle owns the region.
            unsafe {
                libc::fflush(ptr::null_mut());
                RuntimeRoot::destroy(self.root);
            }
        }
        debug!("{} finalized", self.idstr());
        self.finalized = true;
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}

impl fmt::Debug for Runtime {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("region", &self.root)
            .field("role", &self.role)
            .field("finalized", &self.finalized)
            .finish()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.finalized || self.role != Role::Root {
            return;
        }
        if let Err(e) = self.fin() {
            warn!("<PIP_ROOT> shared region leaked: {}", e);
        }
    }
}

#[cfg(test)]
mod tests;
