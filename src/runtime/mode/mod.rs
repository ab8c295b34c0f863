//! Execution-mode negotiation
//!
//! A task runs either as a thread of the root process or as a separate
//! process sharing the root's address space. Process mode needs one of two
//! externally supplied hooks:
//!
//! - `pip_clone_info`: a descriptor exported by an `LD_PRELOAD`ed `clone()`
//!   wrapper that turns `pthread_create` into process creation
//!   ([`ExecMode::ProcessPreload`]);
//! - `pip_clone_mostly_pthread`: a patched libc entry point that creates a
//!   process with a caller-chosen clone flag set ([`ExecMode::ProcessPipClone`]).
//!
//! [`negotiate`] resolves the caller's options, `PIP_MODE` and `PIP_OPTS`
//! against the hooks a [`HookProbe`] can find, exactly once per root.

mod launcher;

pub use launcher::{launcher_for, LaunchRequest, Launched, Launcher, StartRoutine};

use std::ffi::{c_int, c_void, CStr};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::AtomicI32;

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::runtime::error::{PipError, Result};
use crate::runtime::loader::FreeFn;
use crate::runtime::shared::RuntimeRoot;
use crate::runtime::sync::SpinLock;
use crate::util::config::{ConfigError, OPTS_FORCE_EXIT};

bitflags! {
    /// Options accepted at initialization
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Options: u32 {
        /// Terminate the task's thread or process as soon as `main` returns
        const FORCE_EXIT = 0x0001;
        const PTHREAD = 0x0100;
        const PROCESS = 0x0200;
        const PROCESS_PRELOAD = 0x0210;
        const PROCESS_PIPCLONE = 0x0220;
    }
}

impl Options {
    /// Bits that select an execution mode
    pub const MODE_MASK: u32 = 0x0ff0;

    /// The mode-selecting part.
    pub fn mode_bits(self) -> Options {
        Options::from_bits_truncate(self.bits() & Self::MODE_MASK)
    }

    /// Everything except the mode-selecting part.
    pub fn extra_bits(self) -> Options {
        Options::from_bits_truncate(self.bits() & !Self::MODE_MASK)
    }
}

/// The concrete mode a runtime settled on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecMode {
    Thread,
    ProcessPreload,
    ProcessPipClone,
}

impl ExecMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecMode::Thread => "pthread",
            ExecMode::ProcessPreload => "process:preload",
            ExecMode::ProcessPipClone => "process:pipclone",
        }
    }

    pub fn is_threaded(self) -> bool {
        self == ExecMode::Thread
    }

    pub fn options(self) -> Options {
        match self {
            ExecMode::Thread => Options::PTHREAD,
            ExecMode::ProcessPreload => Options::PROCESS_PRELOAD,
            ExecMode::ProcessPipClone => Options::PROCESS_PIPCLONE,
        }
    }

    pub(crate) fn from_options(options: Options) -> Self {
        let mode = options.mode_bits();
        if mode == Options::PROCESS_PIPCLONE {
            ExecMode::ProcessPipClone
        } else if mode == Options::PROCESS_PRELOAD {
            ExecMode::ProcessPreload
        } else {
            ExecMode::Thread
        }
    }
}

impl fmt::Display for ExecMode {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptor exported as `pip_clone_info` by the preloaded clone wrapper
///
/// The wrapper reads `lock` to tell PiP-initiated `clone()` calls from
/// unrelated ones and reports the new process id in `pid_clone`.
#[repr(C)]
#[derive(Debug)]
pub struct CloneInfo {
    pub lock: SpinLock,
    pub flag_wrap: c_int,
    pub flag_clone: c_int,
    pub pid_clone: AtomicI32,
    pub stack: *mut c_void,
}

/// `pip_clone_mostly_pthread` from a patched libc
pub type CloneFn = unsafe extern "C" fn(
    newthread: *mut libc::pthread_t,
    clone_flags: c_int,
    core_no: c_int,
    stack_size: libc::size_t,
    start_routine: StartRoutine,
    arg: *mut c_void,
    pidp: *mut libc::pid_t,
) -> c_int;

/// Clone flags naming what a task shares with the root besides memory.
pub(crate) fn shared_clone_flags(root: &RuntimeRoot) -> c_int {
    match root.cloneinfo() {
        Some(info) => info.flag_clone,
        None if root.mode().is_threaded() => {
            libc::CLONE_FILES | libc::CLONE_SIGHAND | libc::CLONE_THREAD
        }
        None => 0,
    }
}

/// Looks up optional hook symbols in the global symbol space
pub trait HookProbe: Send + Sync {
    fn lookup(
        &self,
        symbol: &CStr,
    ) -> Option<NonNull<c_void>>;

    fn clone_info(&self) -> Option<NonNull<CloneInfo>> {
        self.lookup(c"pip_clone_info").map(NonNull::cast)
    }

    fn clone_fn(&self) -> Option<CloneFn> {
        // SAFETY: the symbol, when present, has the `CloneFn` signature.
        self.lookup(c"pip_clone_mostly_pthread")
            .map(|p| unsafe { std::mem::transmute::<*mut c_void, CloneFn>(p.as_ptr()) })
    }

    fn free_fn(&self) -> Option<FreeFn> {
        // SAFETY: `free` has the `FreeFn` signature.
        self.lookup(c"free")
            .map(|p| unsafe { std::mem::transmute::<*mut c_void, FreeFn>(p.as_ptr()) })
    }
}

/// `dlsym(RTLD_DEFAULT, ..)`
#[derive(Debug, Default, Clone, Copy)]
pub struct DlsymProbe;

impl HookProbe for DlsymProbe {
    fn lookup(
        &self,
        symbol: &CStr,
    ) -> Option<NonNull<c_void>> {
        // SAFETY: `symbol` is NUL terminated.
        NonNull::new(unsafe { libc::dlsym(libc::RTLD_DEFAULT, symbol.as_ptr()) })
    }
}

/// A probe that finds nothing but `free`; always negotiates thread mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl HookProbe for NoHooks {
    fn lookup(
        &self,
        symbol: &CStr,
    ) -> Option<NonNull<c_void>> {
        if symbol == c"free" {
            DlsymProbe.lookup(symbol)
        } else {
            None
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Desired: u8 {
        const THREAD = 1;
        const PRELOAD = 2;
        const PIPCLONE = 4;
    }
}

/// Outcome of [`negotiate`]
#[derive(Debug, Clone, Copy)]
pub struct Negotiated {
    pub mode: ExecMode,
    pub options: Options,
    pub cloneinfo: Option<NonNull<CloneInfo>>,
    pub clone_fn: Option<CloneFn>,
}

impl Negotiated {
    pub fn force_exit(&self) -> bool {
        self.options.contains(Options::FORCE_EXIT)
    }
}

fn parse_env_mode(value: &str) -> Option<Desired> {
    let all_process = Desired::PRELOAD | Desired::PIPCLONE;
    match value.to_ascii_lowercase().as_str() {
        "thread" | "pthread" => Some(Desired::THREAD),
        "process" => Some(all_process),
        "process:preload" => Some(Desired::PRELOAD),
        "process:pipclone" => Some(Desired::PIPCLONE),
        _ => None,
    }
}

/// Choose the execution mode.
///
/// Without an explicit choice the preference is preload, then pipclone,
/// then thread. A strategy that was asked for on its own and whose hook is
/// missing fails with `NotPermitted` instead of falling back.
pub fn negotiate(
    options: Options,
    env_mode: Option<&str>,
    env_opts: Option<&str>,
    probe: &dyn HookProbe,
) -> Result<Negotiated> {
    let mode = options.mode_bits();
    if mode.contains(Options::PTHREAD) && mode.intersects(Options::PROCESS) {
        return Err(PipError::InvalidArgument("thread and process modes are exclusive"));
    }
    if mode.contains(Options::PROCESS_PRELOAD) && mode.contains(Options::PROCESS_PIPCLONE) {
        return Err(PipError::InvalidArgument("preload and pipclone are exclusive"));
    }

    let unknown = |value: &str| {
        warn!("unknown environment setting PIP_MODE='{}'", value);
        PipError::Config(ConfigError::UnknownMode(value.to_string()))
    };

    let desired = if mode.is_empty() {
        match env_mode {
            None => Desired::all(),
            Some(value) => parse_env_mode(value).ok_or_else(|| unknown(value))?,
        }
    } else if mode == Options::PTHREAD {
        Desired::THREAD
    } else if mode == Options::PROCESS_PRELOAD {
        Desired::PRELOAD
    } else if mode == Options::PROCESS_PIPCLONE {
        Desired::PIPCLONE
    } else {
        // plain PROCESS: the environment may narrow it down, "thread" is ignored
        let process = Desired::PRELOAD | Desired::PIPCLONE;
        match env_mode {
            None => process,
            Some(value) => match parse_env_mode(value) {
                Some(d) if d == Desired::THREAD => process,
                Some(d) => d,
                None => return Err(unknown(value)),
            },
        }
    };
    debug!("desired execution modes {:?}", desired);

    let mut chosen = None;
    if desired.contains(Desired::PRELOAD) {
        if let Some(info) = probe.clone_info() {
            chosen = Some((ExecMode::ProcessPreload, Some(info), None));
        }
    }
    if chosen.is_none() && desired.contains(Desired::PIPCLONE) {
        if let Some(clone_fn) = probe.clone_fn() {
            chosen = Some((ExecMode::ProcessPipClone, None, Some(clone_fn)));
        }
    }
    if chosen.is_none() && desired.contains(Desired::THREAD) {
        chosen = Some((ExecMode::Thread, None, None));
    }

    let Some((exec_mode, cloneinfo, clone_fn)) = chosen else {
        if desired == Desired::PRELOAD {
            warn!("process:preload mode is requested but pip_clone_info is not found (check LD_PRELOAD)");
        } else if desired == Desired::PIPCLONE {
            warn!("process:pipclone mode is requested but pip_clone_mostly_pthread() is not found in libc");
        } else {
            warn!("process mode is requested but neither pip_clone_info nor pip_clone_mostly_pthread() is found");
        }
        return Err(PipError::NotPermitted("requested execution mode is unavailable"));
    };

    let mut extra = options.extra_bits();
    if extra.is_empty() {
        if let Some(value) = env_opts {
            if value.eq_ignore_ascii_case(OPTS_FORCE_EXIT) {
                extra |= Options::FORCE_EXIT;
            } else {
                warn!("unknown option PIP_OPTS={}", value);
                return Err(ConfigError::UnknownOption(value.to_string()).into());
            }
        }
    }

    debug!("execution mode: {}", exec_mode);
    Ok(Negotiated {
        mode: exec_mode,
        options: extra | exec_mode.options(),
        cloneinfo,
        clone_fn,
    })
}
