//! Saved execution contexts
//!
//! Two primitives, both hand-written per architecture:
//!
//! - [`switch`] saves the callee-saved registers of the running context on
//!   its own stack, stores the stack pointer, and resumes another context.
//!   [`Context::prepare`] lays out a fresh stack so that the first switch into
//!   it calls an entry function.
//! - [`run_with_exit`] calls a function inside a captured continuation.
//!   [`exit_to`] abandons every frame above the continuation and makes
//!   `run_with_exit` return `true`. Both halves live in the same assembly
//!   routine, so Rust code never observes a function returning twice.

use std::ffi::c_void;

#[cfg(target_arch = "x86_64")]
mod x86_64;

#[cfg(target_arch = "aarch64")]
mod aarch64;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("pip-runtime supports x86_64 and aarch64 only");

/// Entry function of a fresh context; it must never return.
pub type ContextEntry = unsafe extern "C" fn(*mut c_void) -> !;

/// Function run inside an exit continuation.
pub type ExitEntry = unsafe extern "C" fn(*mut c_void);

extern "C" {
    fn pip_runtime_ctx_switch(from_sp: *mut usize, to_sp: usize);
    fn pip_runtime_ctx_run_with_exit(
        frame: *mut ExitFrame,
        entry: ExitEntry,
        arg: *mut c_void,
    ) -> u32;
    fn pip_runtime_ctx_exit_to(frame: *const ExitFrame) -> !;
}

/// A suspended execution context, identified by its saved stack pointer.
#[repr(C)]
#[derive(Debug, Default)]
pub struct Context {
    sp: usize,
}

impl Context {
    /// Context of the code that is currently running; filled on first switch.
    pub const fn current() -> Self {
        Self { sp: 0 }
    }

    /// Build a context that runs `entry(arg)` on the stack ending at `stack_top`.
    ///
    /// # Safety
    ///
    /// `stack_top` must be the upper end of a writable region large enough
    /// for the entry function, and the region must outlive the context.
    pub unsafe fn prepare(
        stack_top: *mut u8,
        entry: ContextEntry,
        arg: *mut c_void,
    ) -> Self {
        Self {
            sp: arch::init_stack(stack_top as usize, entry, arg),
        }
    }

    /// Whether the context has a saved stack pointer.
    pub fn is_saved(&self) -> bool {
        self.sp != 0
    }
}

/// Save the running context into `from` and resume `to`.
///
/// Returns when some other context switches back into `from`.
///
/// # Safety
///
/// `to` must hold a context produced by [`Context::prepare`] or by an earlier
/// switch away from it, and its stack must still be mapped.
pub unsafe fn switch(
    from: *mut Context,
    to: *const Context,
) {
    pip_runtime_ctx_switch(&raw mut (*from).sp, (*to).sp);
}

/// Landing point captured by [`run_with_exit`].
#[repr(C)]
#[derive(Debug, Default)]
pub struct ExitFrame {
    sp: usize,
}

/// Run `entry(arg)`; return `false` if it returned, `true` if it left
/// through [`exit_to`] on `frame`.
///
/// # Safety
///
/// `frame` must stay at the same address while `entry` runs.
pub unsafe fn run_with_exit(
    frame: *mut ExitFrame,
    entry: ExitEntry,
    arg: *mut c_void,
) -> bool {
    pip_runtime_ctx_run_with_exit(frame, entry, arg) != 0
}

/// Return from the [`run_with_exit`] call that captured `frame`.
///
/// # Safety
///
/// The capturing call must still be active on the current stack. Frames
/// above it are discarded without running destructors.
pub unsafe fn exit_to(frame: *const ExitFrame) -> ! {
    pip_runtime_ctx_exit_to(frame)
}

#[cfg(target_arch = "x86_64")]
use self::x86_64 as arch;

#[cfg(target_arch = "aarch64")]
use self::aarch64 as arch;

#[cfg(test)]
mod tests;
