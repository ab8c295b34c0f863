//! Runtime errors
//!
//! Every failure the runtime reports is a [`PipError`]. The variants follow
//! the errno vocabulary of the C-level contract so that callers embedding the
//! runtime behind an FFI boundary can recover the numeric code with
//! [`PipError::errno`].

use thiserror::Error;

use crate::util::config::ConfigError;

/// Runtime result
pub type Result<T> = std::result::Result<T, PipError>;

/// Failures while attaching a task to an existing shared region.
///
/// Attachment never succeeds partially: any of these leaves the caller
/// without a runtime handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttachError {
    #[error("cannot parse shared region address '{0}'")]
    BadAddress(String),

    #[error("shared region at {0:#x} has no runtime magic")]
    BadMagic(usize),

    #[error("version mismatch between root ({root_version}, {root_size} bytes) and task ({version}, {size} bytes)")]
    VersionMismatch {
        root_version: u32,
        root_size: u32,
        version: u32,
        size: u32,
    },

    #[error("no task slot is bound to the calling thread")]
    SlotNotFound,
}

/// Runtime errors
#[derive(Debug, Error)]
pub enum PipError {
    #[error("operation not permitted: {0}")]
    NotPermitted(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("no such task: {0}")]
    NoSuchEntity(String),

    #[error("task capacity exhausted ({0} tasks)")]
    ResourceExhausted(usize),

    #[error("slot {0} is already occupied")]
    TryAgain(usize),

    #[error("task {0} has not terminated yet")]
    WouldBlock(usize),

    #[error("timed out waiting for task {0}")]
    TimedOut(usize),

    #[error("resource busy: {0}")]
    Busy(&'static str),

    #[error("out of memory")]
    OutOfMemory,

    #[error("'{path}' cannot be loaded: {reason}")]
    NotExecutable { path: String, reason: String },

    #[error("'{0}' is not a position-independent executable")]
    NotRelocatable(String),

    #[error("'{0}' is not a readable ELF image")]
    CorruptImage(String),

    #[error("mandatory symbol '{symbol}' is missing in '{path}'")]
    MissingSymbol { path: String, symbol: &'static str },

    #[error("not supported in the current execution mode: {0}")]
    Unsupported(&'static str),

    #[error(transparent)]
    Attach(#[from] AttachError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("system call failed: {0}")]
    Os(#[from] std::io::Error),
}

impl PipError {
    /// Build an error from a raw errno value returned by a pthread-style call.
    pub fn from_errno(errno: i32) -> Self {
        PipError::Os(std::io::Error::from_raw_os_error(errno))
    }

    /// Build an error from the thread's current `errno`.
    pub fn last_os_error() -> Self {
        PipError::Os(std::io::Error::last_os_error())
    }

    /// The errno value equivalent to this error.
    pub fn errno(&self) -> i32 {
        match self {
            PipError::NotPermitted(_) => libc::EPERM,
            PipError::InvalidArgument(_) => libc::EINVAL,
            PipError::NoSuchEntity(_) => libc::ENOENT,
            PipError::ResourceExhausted(_) => libc::EOVERFLOW,
            PipError::TryAgain(_) => libc::EAGAIN,
            PipError::WouldBlock(_) | PipError::Busy(_) => libc::EBUSY,
            PipError::TimedOut(_) => libc::ETIMEDOUT,
            PipError::OutOfMemory => libc::ENOMEM,
            PipError::NotExecutable { .. } | PipError::MissingSymbol { .. } => libc::ENOEXEC,
            PipError::NotRelocatable(_) => libc::ELIBEXEC,
            PipError::CorruptImage(_) => libc::EUNATCH,
            PipError::Unsupported(_) => libc::ENOSYS,
            PipError::Attach(AttachError::SlotNotFound) => libc::ENXIO,
            PipError::Attach(_) => libc::EPERM,
            PipError::Config(_) => libc::EPERM,
            PipError::Os(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Whether retrying the same call later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipError::TryAgain(_)
                | PipError::WouldBlock(_)
                | PipError::TimedOut(_)
                | PipError::ResourceExhausted(_)
        )
    }
}
