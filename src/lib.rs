//! PiP: process-in-process
//!
//! Run many programs as tasks inside one virtual address space. Every task
//! gets its own dynamic-linker namespace, so identically named globals stay
//! private, while any pointer handed from one task to another stays valid
//! everywhere.
//!
//! # Example
//!
//! ```no_run
//! use pip_runtime::runtime::{PipId, RuntimeBuilder};
//! use pip_runtime::runtime::spawn::SpawnRequest;
//!
//! fn main() -> pip_runtime::Result<()> {
//!     let mut rt = RuntimeBuilder::new().ntasks(2).init()?;
//!     let id = rt.spawn(SpawnRequest::new("./hello"))?;
//!     println!("hello exited with {}", rt.wait(PipId::Task(id))?);
//!     rt.fin()?;
//!     Ok(())
//! }
//! ```

#![warn(rust_2018_idioms)]

pub mod runtime;
pub mod util;

pub use runtime::{
    is_pip_task, ExecMode, Options, PipError, PipId, Result, Role, Runtime, RuntimeBuilder,
};

/// Runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Runtime name
pub const NAME: &str = "PiP (process-in-process)";
