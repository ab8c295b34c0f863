//! Shared control block store
//!
//! The root allocates one page-aligned region holding a [`RuntimeRoot`]
//! header followed by `ntasks + 1` [`TaskControlBlock`]s; the last block
//! describes the root itself. Every task reaches the region through the
//! address handed to it in `PIP_ROOT`, so everything in here is `repr(C)`
//! and free of process-local heap handles.
//!
//! Fields that change after initialization are atomics. The two fields that
//! need more than a single atomic word (hooks and the ULP host context) are
//! written by exactly one party at a time, as described on each accessor.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::fmt;
use std::mem::{align_of, size_of};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicU8, AtomicUsize, Ordering};

use tracing::debug;

use crate::runtime::context::{Context, ExitFrame};
use crate::runtime::error::{AttachError, PipError, Result};
use crate::runtime::loader::{FreeFn, Namespace, TargetHooks};
use crate::runtime::mode::{CloneFn, CloneInfo, ExecMode, Options};
use crate::runtime::sync::SpinLock;

/// Identity tag at the start of every region
pub const MAGIC: [u8; 8] = *b"PiPRoot\0";
/// Layout version; bumped whenever a shared structure changes
pub const VERSION: u32 = 2;
/// Largest task capacity and largest number of spawns per runtime
pub const NTASKS_MAX: usize = 300;

/// Raw values of the identifier sentinels
pub mod raw_id {
    pub const ROOT: i32 = -1;
    pub const MYSELF: i32 = -2;
    pub const ANY: i32 = -3;
    pub const NONE: i32 = -4;
}

/// Task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipId {
    /// The originating program
    Root,
    /// The caller
    Myself,
    /// Any free slot (spawn) or any running task (wait)
    Any,
    /// A concrete slot
    Task(usize),
}

impl PipId {
    /// Decode a raw C-style identifier.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            raw_id::ROOT => Some(PipId::Root),
            raw_id::MYSELF => Some(PipId::Myself),
            raw_id::ANY => Some(PipId::Any),
            n if n >= 0 => Some(PipId::Task(n as usize)),
            _ => None,
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            PipId::Root => raw_id::ROOT,
            PipId::Myself => raw_id::MYSELF,
            PipId::Any => raw_id::ANY,
            PipId::Task(n) => n as i32,
        }
    }
}

impl From<usize> for PipId {
    fn from(slot: usize) -> Self {
        PipId::Task(slot)
    }
}

impl fmt::Display for PipId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            PipId::Root => write!(f, "ROOT"),
            PipId::Myself => write!(f, "MYSELF"),
            PipId::Any => write!(f, "ANY"),
            PipId::Task(n) => write!(f, "{}", n),
        }
    }
}

/// Occupancy state of a slot
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Empty = 0,
    Claimed = 1,
    Running = 2,
    Exited = 3,
    Reaping = 4,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TaskState::Claimed,
            2 => TaskState::Running,
            3 => TaskState::Exited,
            4 => TaskState::Reaping,
            _ => TaskState::Empty,
        }
    }
}

/// One task slot
#[repr(C)]
pub struct TaskControlBlock {
    pipid: AtomicI32,
    state: AtomicU8,
    thread: AtomicUsize,
    pid: AtomicI32,
    retval: AtomicI32,
    namespace: AtomicPtr<c_void>,
    export: AtomicPtr<c_void>,
    exit_frame: AtomicPtr<ExitFrame>,
    args: AtomicPtr<c_void>,
    ulp_curr: AtomicPtr<c_void>,
    ulp_stacks: AtomicPtr<u8>,
    hooks: UnsafeCell<TargetHooks>,
    ulp_host: UnsafeCell<Context>,
}

// SAFETY: the two cells follow the single-writer rules documented on their
// accessors; everything else is atomic.
unsafe impl Sync for TaskControlBlock {}

impl TaskControlBlock {
    /// Put the slot back into its pristine empty state.
    pub(crate) fn reset(&self) {
        self.thread.store(0, Ordering::SeqCst);
        self.pid.store(0, Ordering::SeqCst);
        self.retval.store(0, Ordering::SeqCst);
        self.namespace.store(ptr::null_mut(), Ordering::SeqCst);
        self.export.store(ptr::null_mut(), Ordering::SeqCst);
        self.exit_frame.store(ptr::null_mut(), Ordering::SeqCst);
        self.args.store(ptr::null_mut(), Ordering::SeqCst);
        self.ulp_curr.store(ptr::null_mut(), Ordering::SeqCst);
        self.ulp_stacks.store(ptr::null_mut(), Ordering::SeqCst);
        // SAFETY: an unoccupied slot has no other reader or writer.
        unsafe {
            *self.hooks.get() = TargetHooks::default();
            *self.ulp_host.get() = Context::current();
        }
        self.state.store(TaskState::Empty as u8, Ordering::SeqCst);
        self.pipid.store(raw_id::NONE, Ordering::SeqCst);
    }

    pub fn raw_pipid(&self) -> i32 {
        self.pipid.load(Ordering::SeqCst)
    }

    pub fn is_occupied(&self) -> bool {
        self.raw_pipid() != raw_id::NONE
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(
        &self,
        state: TaskState,
    ) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Move from `from` to `to`; returns the observed state on failure.
    pub(crate) fn transition(
        &self,
        from: TaskState,
        to: TaskState,
    ) -> std::result::Result<(), TaskState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(TaskState::from_u8)
    }

    pub fn thread(&self) -> libc::pthread_t {
        self.thread.load(Ordering::SeqCst) as libc::pthread_t
    }

    pub(crate) fn set_thread(
        &self,
        thread: libc::pthread_t,
    ) {
        self.thread.store(thread as usize, Ordering::SeqCst);
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid.load(Ordering::SeqCst)
    }

    pub(crate) fn set_pid(
        &self,
        pid: libc::pid_t,
    ) {
        self.pid.store(pid, Ordering::SeqCst);
    }

    pub fn retval(&self) -> i32 {
        self.retval.load(Ordering::SeqCst)
    }

    pub(crate) fn set_retval(
        &self,
        value: i32,
    ) {
        self.retval.store(value, Ordering::SeqCst);
    }

    pub fn namespace(&self) -> Option<Namespace> {
        Namespace::from_ptr(self.namespace.load(Ordering::SeqCst))
    }

    pub(crate) fn set_namespace(
        &self,
        ns: Option<Namespace>,
    ) {
        let raw = ns.map_or(ptr::null_mut(), Namespace::as_ptr);
        self.namespace.store(raw, Ordering::SeqCst);
    }

    pub fn export(&self) -> *mut c_void {
        self.export.load(Ordering::SeqCst)
    }

    pub(crate) fn set_export(
        &self,
        value: *mut c_void,
    ) {
        self.export.store(value, Ordering::SeqCst);
    }

    pub(crate) fn exit_frame(&self) -> *mut ExitFrame {
        self.exit_frame.load(Ordering::SeqCst)
    }

    pub(crate) fn set_exit_frame(
        &self,
        frame: *mut ExitFrame,
    ) {
        self.exit_frame.store(frame, Ordering::SeqCst);
    }

    pub(crate) fn args(&self) -> *mut c_void {
        self.args.load(Ordering::SeqCst)
    }

    pub(crate) fn set_args(
        &self,
        args: *mut c_void,
    ) {
        self.args.store(args, Ordering::SeqCst);
    }

    pub(crate) fn ulp_curr(&self) -> *mut c_void {
        self.ulp_curr.load(Ordering::SeqCst)
    }

    pub(crate) fn set_ulp_curr(
        &self,
        ulp: *mut c_void,
    ) {
        self.ulp_curr.store(ulp, Ordering::SeqCst);
    }

    pub(crate) fn ulp_stacks(&self) -> &AtomicPtr<u8> {
        &self.ulp_stacks
    }

    /// Hooks of the program loaded into this slot.
    ///
    /// Written by whoever performs the load (the root under the loader lock,
    /// or the task itself before it enters `main`); read-only afterwards.
    pub fn hooks(&self) -> TargetHooks {
        // SAFETY: see above; `TargetHooks` is `Copy`.
        unsafe { *self.hooks.get() }
    }

    /// # Safety
    ///
    /// The caller must be the single party loading into this slot.
    pub(crate) unsafe fn set_hooks(
        &self,
        hooks: TargetHooks,
    ) {
        *self.hooks.get() = hooks;
    }

    /// Saved context of the task's own thread while one of its ULPs runs.
    /// Only the owning thread touches it.
    pub(crate) fn ulp_host(&self) -> *mut Context {
        self.ulp_host.get()
    }
}

impl fmt::Debug for TaskControlBlock {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("TaskControlBlock")
            .field("pipid", &self.raw_pipid())
            .field("state", &self.state())
            .field("pid", &self.pid())
            .field("retval", &self.retval())
            .finish()
    }
}

/// Header of the shared region
#[repr(C)]
pub struct RuntimeRoot {
    magic: [u8; 8],
    version: u32,
    root_size: u32,
    size: usize,
    page_size: usize,
    ntasks: usize,
    ntasks_curr: AtomicUsize,
    ntasks_accum: AtomicUsize,
    pipid_curr: AtomicUsize,
    opts: u32,
    mode: u32,
    cloneinfo: *mut CloneInfo,
    clone_fn: Option<CloneFn>,
    free_fn: Option<FreeFn>,
    pub(crate) lock_ldlinux: SpinLock,
    pub(crate) lock_ulpstacks: SpinLock,
}

// SAFETY: non-atomic fields are written once before the region is shared.
unsafe impl Sync for RuntimeRoot {}
unsafe impl Send for RuntimeRoot {}

/// Parameters fixed at region creation
#[derive(Debug, Clone, Copy)]
pub struct RootParams {
    pub ntasks: usize,
    pub options: Options,
    pub mode: ExecMode,
    pub cloneinfo: Option<NonNull<CloneInfo>>,
    pub clone_fn: Option<CloneFn>,
    pub free_fn: Option<FreeFn>,
}

impl RuntimeRoot {
    fn tasks_offset() -> usize {
        let align = align_of::<TaskControlBlock>();
        (size_of::<RuntimeRoot>() + align - 1) & !(align - 1)
    }

    fn region_size(ntasks: usize) -> usize {
        Self::tasks_offset() + size_of::<TaskControlBlock>() * (ntasks + 1)
    }

    /// Allocate and initialise a fresh, zeroed, page-aligned region.
    pub(crate) fn create(params: RootParams) -> Result<NonNull<RuntimeRoot>> {
        if params.ntasks == 0 {
            return Err(PipError::InvalidArgument("task capacity must be positive"));
        }
        if params.ntasks > NTASKS_MAX {
            return Err(PipError::ResourceExhausted(NTASKS_MAX));
        }

        let page_size = page_size();
        let size = Self::region_size(params.ntasks);
        let layout =
            Layout::from_size_align(size, page_size).map_err(|_| PipError::OutOfMemory)?;
        // SAFETY: the layout has a non-zero size.
        let raw = unsafe { alloc_zeroed(layout) }.cast::<RuntimeRoot>();
        let root = NonNull::new(raw).ok_or(PipError::OutOfMemory)?;

        // SAFETY: the region is zeroed, correctly aligned and not yet shared.
        unsafe {
            root.as_ptr().write(RuntimeRoot {
                magic: MAGIC,
                version: VERSION,
                root_size: size_of::<RuntimeRoot>() as u32,
                size,
                page_size,
                ntasks: params.ntasks,
                ntasks_curr: AtomicUsize::new(0),
                ntasks_accum: AtomicUsize::new(0),
                pipid_curr: AtomicUsize::new(0),
                opts: params.options.bits(),
                mode: params.mode.options().bits(),
                cloneinfo: params.cloneinfo.map_or(ptr::null_mut(), NonNull::as_ptr),
                clone_fn: params.clone_fn,
                free_fn: params.free_fn,
                lock_ldlinux: SpinLock::new(),
                lock_ulpstacks: SpinLock::new(),
            });
            let root_ref = root.as_ref();
            for tcb in root_ref.all_blocks() {
                tcb.reset();
            }
            let block = root_ref.root_block();
            block.pipid.store(raw_id::ROOT, Ordering::SeqCst);
            block.set_state(TaskState::Running);
            block.set_thread(libc::pthread_self());
            block.set_pid(libc::getpid());
            let mut hooks = TargetHooks::default();
            hooks.free = params.free_fn;
            block.set_hooks(hooks);
        }

        debug!(
            "<PIP_ROOT> shared region at {:p}, {} bytes, {} slots",
            root.as_ptr(),
            size,
            params.ntasks
        );
        Ok(root)
    }

    /// Release a region created by [`RuntimeRoot::create`].
    ///
    /// # Safety
    ///
    /// No task may use the region afterwards.
    pub(crate) unsafe fn destroy(root: NonNull<RuntimeRoot>) {
        let (size, page_size) = {
            let r = root.as_ref();
            (r.size, r.page_size)
        };
        let layout = Layout::from_size_align_unchecked(size, page_size);
        ptr::drop_in_place(root.as_ptr());
        dealloc(root.as_ptr().cast(), layout);
    }

    /// Check the identity tag, version and header size at `addr`.
    ///
    /// A null, misaligned or unreadable address fails with `BadMagic`
    /// before anything is dereferenced.
    ///
    /// # Safety
    ///
    /// If `addr` holds a valid header, the region behind it must stay mapped
    /// for as long as the returned pointer is used.
    pub unsafe fn validate(addr: usize) -> std::result::Result<NonNull<RuntimeRoot>, AttachError> {
        let root = NonNull::new(addr as *mut RuntimeRoot).ok_or(AttachError::BadMagic(addr))?;
        if addr % align_of::<RuntimeRoot>() != 0 || !readable(addr, size_of::<RuntimeRoot>()) {
            return Err(AttachError::BadMagic(addr));
        }
        let r = root.as_ref();
        if r.magic != MAGIC {
            return Err(AttachError::BadMagic(addr));
        }
        let size = size_of::<RuntimeRoot>() as u32;
        if r.version != VERSION || r.root_size != size {
            return Err(AttachError::VersionMismatch {
                root_version: r.version,
                root_size: r.root_size,
                version: VERSION,
                size,
            });
        }
        Ok(root)
    }

    fn all_blocks(&self) -> &[TaskControlBlock] {
        // SAFETY: the region always holds `ntasks + 1` initialised blocks
        // directly after the header.
        unsafe {
            let base = (self as *const Self as *const u8).add(Self::tasks_offset());
            std::slice::from_raw_parts(base.cast::<TaskControlBlock>(), self.ntasks + 1)
        }
    }

    /// Task slots, without the root block.
    pub fn tasks(&self) -> &[TaskControlBlock] {
        &self.all_blocks()[..self.ntasks]
    }

    pub fn task(
        &self,
        slot: usize,
    ) -> Option<&TaskControlBlock> {
        self.tasks().get(slot)
    }

    /// Control block of the root.
    pub fn root_block(&self) -> &TaskControlBlock {
        &self.all_blocks()[self.ntasks]
    }

    pub fn capacity(&self) -> usize {
        self.ntasks
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn ntasks_curr(&self) -> usize {
        self.ntasks_curr.load(Ordering::SeqCst)
    }

    pub fn ntasks_accum(&self) -> usize {
        self.ntasks_accum.load(Ordering::SeqCst)
    }

    pub(crate) fn count_spawn(&self) {
        self.ntasks_accum.fetch_add(1, Ordering::SeqCst);
        self.ntasks_curr.fetch_add(1, Ordering::SeqCst);
    }

    /// Undo [`RuntimeRoot::count_spawn`] for a task that never started.
    pub(crate) fn uncount_spawn(&self) {
        self.ntasks_accum.fetch_sub(1, Ordering::SeqCst);
        self.ntasks_curr.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn count_reap(&self) {
        self.ntasks_curr.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn options(&self) -> Options {
        Options::from_bits_truncate(self.opts)
    }

    pub fn mode(&self) -> ExecMode {
        ExecMode::from_options(Options::from_bits_truncate(self.mode))
    }

    pub(crate) fn cloneinfo(&self) -> Option<&CloneInfo> {
        // SAFETY: the descriptor lives in the preload library for the
        // lifetime of the process.
        unsafe { self.cloneinfo.as_ref() }
    }

    pub(crate) fn clone_fn(&self) -> Option<CloneFn> {
        self.clone_fn
    }

    pub(crate) fn free_fn(&self) -> Option<FreeFn> {
        self.free_fn
    }

    /// Claim a slot for a spawn. Must run under the loader lock.
    ///
    /// `Any` picks the lowest free slot at or after the rotating cursor,
    /// wrapping once.
    pub(crate) fn claim(
        &self,
        wanted: PipId,
    ) -> Result<usize> {
        let slot = match wanted {
            PipId::Task(n) if n >= self.ntasks => {
                return Err(PipError::InvalidArgument("task id out of range"))
            }
            PipId::Task(n) => {
                if self.tasks()[n].is_occupied() {
                    return Err(PipError::TryAgain(n));
                }
                n
            }
            PipId::Any => {
                let start = self.pipid_curr.load(Ordering::SeqCst) % self.ntasks;
                (start..self.ntasks)
                    .chain(0..start)
                    .find(|&n| !self.tasks()[n].is_occupied())
                    .ok_or(PipError::ResourceExhausted(self.ntasks))?
            }
            PipId::Root | PipId::Myself => {
                return Err(PipError::InvalidArgument("cannot spawn into root or self"))
            }
        };

        let tcb = &self.tasks()[slot];
        tcb.reset();
        tcb.pipid.store(slot as i32, Ordering::SeqCst);
        tcb.set_state(TaskState::Claimed);
        if wanted == PipId::Any {
            self.pipid_curr.store(slot + 1, Ordering::SeqCst);
        }
        Ok(slot)
    }

    /// Occupied slot whose thread handle is `thread`.
    pub fn find_by_thread(
        &self,
        thread: libc::pthread_t,
    ) -> Option<usize> {
        self.tasks()
            .iter()
            .position(|tcb| tcb.is_occupied() && tcb.thread() == thread)
    }
}

/// System page size.
/// Whether `len` bytes at `addr` can be read without faulting.
///
/// Copies the range through `process_vm_readv` on ourselves, which reports
/// `EFAULT` instead of raising SIGSEGV. Where that call is filtered out,
/// the range is written into a pipe instead, which fails the same way.
fn readable(
    addr: usize,
    len: usize,
) -> bool {
    let mut copy = vec![0u8; len];
    let local = libc::iovec {
        iov_base: copy.as_mut_ptr().cast(),
        iov_len: len,
    };
    let remote = libc::iovec {
        iov_base: addr as *mut c_void,
        iov_len: len,
    };
    // SAFETY: `local` describes an owned buffer; the kernel checks `remote`.
    let n = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
    if n >= 0 {
        return n as usize == len;
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::EPERM) | Some(libc::ENOSYS) => readable_through_pipe(addr, len),
        _ => false,
    }
}

fn readable_through_pipe(
    addr: usize,
    len: usize,
) -> bool {
    let mut fds = [0; 2];
    // SAFETY: `fds` has room for both ends.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } != 0 {
        return false;
    }
    // SAFETY: the kernel checks the source range; both descriptors are ours.
    let n = unsafe { libc::write(fds[1], addr as *const c_void, len) };
    unsafe {
        libc::close(fds[0]);
        libc::close(fds[1]);
    }
    n >= 0 && n as usize == len
}

pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}
