//! Runtime configuration
//!
//! All environment inputs are read once into a [`RuntimeConfig`].
//!
//! # Configuration sources
//!
//! ```text
//! Priority (high → low):
//! 1. Options passed to RuntimeBuilder
//! 2. Environment variables
//! 3. Default values
//! ```
//!
//! | Variable                           | Meaning                                   |
//! |------------------------------------|-------------------------------------------|
//! | `PIP_ROOT`                         | shared region address (set for tasks)     |
//! | `PIP_MODE`                         | `thread`, `pthread`, `process`, ...       |
//! | `PIP_OPTS`                         | `forceexit`                               |
//! | `PIP_STACKSZ`, `KMP_STACKSIZE`, `OMP_STACKSIZE` | stack size with `k/m/g` suffix |
//!
//! # Usage
//!
//! ```rust
//! use pip_runtime::util::config::{parse_stack_size, RuntimeConfig};
//!
//! let config = RuntimeConfig::from_env();
//! assert!(config.stack_size >= 64 * 1024);
//! assert_eq!(parse_stack_size("1m").unwrap(), 1024 * 1024);
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Shared region address handed to spawned tasks
pub const ENV_ROOT: &str = "PIP_ROOT";
/// Execution mode request
pub const ENV_MODE: &str = "PIP_MODE";
/// Extra runtime options
pub const ENV_OPTS: &str = "PIP_OPTS";
/// Stack size, preferred name
pub const ENV_STACKSZ: &str = "PIP_STACKSZ";
/// Stack size names used by OpenMP runtimes
pub const ENV_STACKSZ_ALT: [&str; 2] = ["KMP_STACKSIZE", "OMP_STACKSIZE"];

/// `PIP_OPTS` value enabling force-exit on task completion
pub const OPTS_FORCE_EXIT: &str = "forceexit";

/// Default stack size for tasks and ULPs (8 MiB)
pub const DEFAULT_STACK_SIZE: usize = 8 * 1024 * 1024;
/// Smallest stack size ever handed out (64 KiB)
pub const MIN_STACK_SIZE: usize = 64 * 1024;

/// Environment-derived runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Hexadecimal shared region address; present only inside a task
    #[serde(default)]
    pub root_addr: Option<String>,
    /// Raw execution mode request
    #[serde(default)]
    pub mode: Option<String>,
    /// Raw option string
    #[serde(default)]
    pub opts: Option<String>,
    /// Stack size for task threads and ULP contexts
    #[serde(default = "default_stack_size")]
    pub stack_size: usize,
}

fn default_stack_size() -> usize {
    DEFAULT_STACK_SIZE
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            root_addr: None,
            mode: None,
            opts: None,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl RuntimeConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let stack_size = std::iter::once(ENV_STACKSZ)
            .chain(ENV_STACKSZ_ALT)
            .find_map(&lookup)
            .map(|value| match parse_stack_size(&value) {
                Ok(size) => size,
                Err(e) => {
                    warn!("{} and default size is set", e);
                    DEFAULT_STACK_SIZE
                }
            })
            .unwrap_or(DEFAULT_STACK_SIZE);

        Self {
            root_addr: lookup(ENV_ROOT),
            mode: lookup(ENV_MODE),
            opts: lookup(ENV_OPTS),
            stack_size,
        }
    }

    /// Override the mode request.
    pub fn with_mode(
        mut self,
        mode: impl Into<String>,
    ) -> Self {
        self.mode = Some(mode.into());
        self
    }

    /// Override the option string.
    pub fn with_opts(
        mut self,
        opts: impl Into<String>,
    ) -> Self {
        self.opts = Some(opts.into());
        self
    }

    /// Override the stack size; it is rounded like an environment value.
    pub fn with_stack_size(
        mut self,
        size: usize,
    ) -> Self {
        self.stack_size = round_stack_size(size);
        self
    }
}

/// Parse a stack size such as `512k`, `8M` or `1g`.
///
/// A bare number counts kilobytes, `b` counts bytes. An unknown suffix is
/// treated as kilobytes after a warning. The result is rounded up to a
/// power of two and never smaller than [`MIN_STACK_SIZE`].
pub fn parse_stack_size(value: &str) -> Result<usize, ConfigError> {
    let value = value.trim();
    let digits = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(digits);

    let number: usize = match number.parse() {
        Ok(n) if n > 0 => n,
        _ => return Err(ConfigError::IllegalStackSize(value.to_string())),
    };

    let scale: usize = match suffix {
        "g" | "G" => 1024 * 1024 * 1024,
        "m" | "M" => 1024 * 1024,
        "" | "k" | "K" => 1024,
        "b" | "B" => 1,
        _ => {
            warn!("'{}' is illegal and 'K' is assumed", value);
            1024
        }
    };

    let bytes = number
        .checked_mul(scale)
        .ok_or_else(|| ConfigError::IllegalStackSize(value.to_string()))?;
    Ok(round_stack_size(bytes))
}

/// Round a byte count up to a power of two no smaller than the minimum.
pub fn round_stack_size(bytes: usize) -> usize {
    bytes
        .max(MIN_STACK_SIZE)
        .checked_next_power_of_two()
        .unwrap_or(bytes)
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown environment setting {ENV_MODE}='{0}'")]
    UnknownMode(String),

    #[error("unknown option {ENV_OPTS}={0}")]
    UnknownOption(String),

    #[error("'{0}' is illegal as a stack size")]
    IllegalStackSize(String),
}
