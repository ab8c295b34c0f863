//! Task termination and reaping
//!
//! Only the root reaps. A task goes `Running -> Exited -> Reaping -> Empty`
//! (or straight from `Running` to `Reaping` when the reaper blocks on it);
//! the compare-and-swap into `Reaping` picks the single reaper, so a second
//! concurrent or repeated wait on the same task is refused. A reap that
//! would block or times out puts the previous state back.

use std::ffi::c_void;
use std::ptr;
use std::time::Duration;

use tracing::{debug, warn};

use crate::runtime::context::exit_to;
use crate::runtime::error::{PipError, Result};
use crate::runtime::loader::ffi;
use crate::runtime::shared::{PipId, RuntimeRoot, TaskControlBlock, TaskState};
use crate::runtime::spawn::SpawnArgs;
use crate::runtime::sync::gettid;
use crate::runtime::ulp;
use crate::runtime::{Role, Runtime};

#[derive(Clone, Copy)]
enum Join {
    Block,
    Try,
    Until(libc::timespec),
}

fn begin_reap(tcb: &TaskControlBlock) -> Result<TaskState> {
    for from in [TaskState::Exited, TaskState::Running] {
        if tcb.transition(from, TaskState::Reaping).is_ok() {
            return Ok(from);
        }
    }
    Err(PipError::NotPermitted("task is being reaped by someone else"))
}

fn join_thread(
    slot: usize,
    tcb: &TaskControlBlock,
    how: Join,
) -> Result<i32> {
    let thread = tcb.thread();
    let mut ret: *mut c_void = ptr::null_mut();
    // SAFETY: the thread was created joinable and is joined only by the
    // single reaper.
    let rc = unsafe {
        match how {
            Join::Block => libc::pthread_join(thread, &mut ret),
            Join::Try => ffi::pthread_tryjoin_np(thread, &mut ret),
            Join::Until(deadline) => ffi::pthread_timedjoin_np(thread, &mut ret, &deadline),
        }
    };
    match rc {
        0 => Ok(tcb.retval()),
        libc::EBUSY => Err(PipError::WouldBlock(slot)),
        libc::ETIMEDOUT => Err(PipError::TimedOut(slot)),
        errno => Err(PipError::from_errno(errno)),
    }
}

fn wait_process(
    slot: usize,
    tcb: &TaskControlBlock,
    nohang: bool,
) -> Result<i32> {
    let pid = tcb.pid();
    let flags = libc::__WALL | if nohang { libc::WNOHANG } else { 0 };
    let mut status = 0;
    loop {
        // SAFETY: plain system call.
        let rc = unsafe { libc::waitpid(pid, &mut status, flags) };
        if rc == pid {
            break;
        }
        if rc == 0 {
            return Err(PipError::WouldBlock(slot));
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err.into());
        }
    }

    if libc::WIFEXITED(status) {
        Ok(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        let sig = libc::WTERMSIG(status);
        warn!("task {} (pid {}) terminated by signal {}", slot, pid, sig);
        Ok(128 + sig)
    } else {
        Ok(status)
    }
}

fn deadline_after(timeout: Duration) -> Result<libc::timespec> {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `now` is a valid out pointer.
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
        return Err(PipError::last_os_error());
    }
    let nanos = now.tv_nsec as u64 + u64::from(timeout.subsec_nanos());
    Ok(libc::timespec {
        tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t + (nanos / 1_000_000_000) as libc::time_t,
        tv_nsec: (nanos % 1_000_000_000) as _,
    })
}

impl Runtime {
    /// Slot of a reapable task named by `id`.
    ///
    /// A slot that is in range but holds no task (never spawned, or already
    /// reaped) is refused with `NotPermitted`: each task is reaped once.
    fn reap_target(
        &self,
        id: PipId,
    ) -> Result<(&RuntimeRoot, usize)> {
        let root = self.require_root()?;
        match id {
            PipId::Root | PipId::Myself => Err(PipError::InvalidArgument("the root cannot be reaped")),
            PipId::Any => Err(PipError::InvalidArgument("use wait_any to reap any task")),
            PipId::Task(_) => match self.resolve(id) {
                Ok(Some(slot)) => Ok((root, slot)),
                Ok(None) => Err(PipError::InvalidArgument("the root cannot be reaped")),
                Err(PipError::NoSuchEntity(_)) => {
                    Err(PipError::NotPermitted("task is not running or already reaped"))
                }
                Err(e) => Err(e),
            },
        }
    }

    fn reap(
        &self,
        id: PipId,
        join: Join,
    ) -> Result<i32> {
        let (root, slot) = self.reap_target(id)?;
        let tcb = &root.tasks()[slot];
        let previous = begin_reap(tcb)?;

        let outcome = if root.mode().is_threaded() {
            join_thread(slot, tcb, join)
        } else {
            match join {
                Join::Block => wait_process(slot, tcb, false),
                Join::Try => wait_process(slot, tcb, true),
                Join::Until(_) => Err(PipError::Unsupported("timed join needs thread mode")),
            }
        };

        match outcome {
            Ok(status) => {
                self.finalize_slot(root, slot);
                debug!("{} reaped task {} with status {}", self.idstr(), slot, status);
                Ok(status)
            }
            Err(e) => {
                tcb.set_state(previous);
                Err(e)
            }
        }
    }

    /// Release everything a terminated task held and free its slot.
    fn finalize_slot(
        &self,
        root: &RuntimeRoot,
        slot: usize,
    ) {
        let tcb = &root.tasks()[slot];
        ulp::release_stacks(root, tcb);
        if let Some(ns) = tcb.namespace() {
            let guard = root.lock_ldlinux.lock_with(gettid());
            self.loader.close(ns, &guard);
        }
        // SAFETY: the task has terminated; its spawn record has no other user.
        unsafe { SpawnArgs::release(tcb.args()) };
        tcb.reset();
        root.count_reap();
    }

    /// Block until task `id` terminates and return its exit status.
    ///
    /// A task killed by a signal reports `128 + signal`.
    pub fn wait(
        &self,
        id: PipId,
    ) -> Result<i32> {
        self.reap(id, Join::Block)
    }

    /// Like [`Runtime::wait`], but fail with `WouldBlock` if `id` is still running.
    pub fn try_wait(
        &self,
        id: PipId,
    ) -> Result<i32> {
        self.reap(id, Join::Try)
    }

    /// Reap whichever task terminates first; returns its slot and status.
    pub fn wait_any(&self) -> Result<(usize, i32)> {
        loop {
            if let Some(done) = self.try_wait_any()? {
                return Ok(done);
            }
            std::thread::yield_now();
        }
    }

    /// Reap one terminated task if there is any.
    ///
    /// Fails with `NoSuchEntity` when no task is left to reap at all.
    pub fn try_wait_any(&self) -> Result<Option<(usize, i32)>> {
        let root = self.require_root()?;
        let mut alive = false;
        for (slot, tcb) in root.tasks().iter().enumerate() {
            if !matches!(tcb.state(), TaskState::Running | TaskState::Exited) {
                continue;
            }
            alive = true;
            match self.try_wait(PipId::Task(slot)) {
                Ok(status) => return Ok(Some((slot, status))),
                Err(PipError::WouldBlock(_)) | Err(PipError::NotPermitted(_)) => continue,
                Err(PipError::NoSuchEntity(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        if alive {
            Ok(None)
        } else {
            Err(PipError::NoSuchEntity("no task left to wait for".to_string()))
        }
    }

    /// Joins are thread-mode only and must come from the thread that
    /// created the root.
    fn check_join(&self) -> Result<()> {
        let root = self.require_root()?;
        if !root.mode().is_threaded() {
            return Err(PipError::Unsupported("join needs thread mode"));
        }
        // SAFETY: both handles name live threads of this process.
        let same = unsafe { libc::pthread_equal(libc::pthread_self(), root.root_block().thread()) };
        if same == 0 {
            return Err(PipError::NotPermitted("join from a thread other than the root's"));
        }
        Ok(())
    }

    /// Join the thread of task `id` and return its exit value.
    pub fn join(
        &self,
        id: PipId,
    ) -> Result<i32> {
        self.check_join()?;
        self.reap(id, Join::Block)
    }

    pub fn try_join(
        &self,
        id: PipId,
    ) -> Result<i32> {
        self.check_join()?;
        self.reap(id, Join::Try)
    }

    /// Join with a relative timeout; fails with `TimedOut` when it expires.
    pub fn timed_join(
        &self,
        id: PipId,
        timeout: Duration,
    ) -> Result<i32> {
        self.check_join()?;
        self.reap(id, Join::Until(deadline_after(timeout)?))
    }

    /// Deliver `signal` to the thread or process of `id`.
    pub fn kill(
        &self,
        id: PipId,
        signal: i32,
    ) -> Result<()> {
        if !(0..=64).contains(&signal) {
            return Err(PipError::InvalidArgument("signal number out of range"));
        }
        let threaded = self.is_threaded()?;
        let block = self.block(self.resolve(id)?)?;
        if threaded {
            // SAFETY: the thread handle belongs to a live task.
            let rc = unsafe { libc::pthread_kill(block.thread(), signal) };
            if rc != 0 {
                return Err(PipError::from_errno(rc));
            }
        } else if unsafe { libc::kill(block.pid(), signal) } != 0 {
            return Err(PipError::last_os_error());
        }
        debug!("{} sent signal {} to {:?}", self.idstr(), signal, id);
        Ok(())
    }

    /// Terminate the calling task with `status`.
    ///
    /// A thread-mode task unwinds to its start routine, which then runs the
    /// `after` hook and reports `status` to the reaper. A process-mode task
    /// exits its process; the root exits the program.
    pub fn exit(
        &self,
        status: i32,
    ) -> ! {
        if let (Role::Task(slot), Ok(root)) = (self.role, self.shared()) {
            let tcb = &root.tasks()[slot];
            if root.mode().is_threaded() {
                let frame = tcb.exit_frame();
                // SAFETY: pthread_self has no preconditions.
                let own_thread = unsafe { libc::pthread_self() } == tcb.thread();
                if !frame.is_null() && own_thread {
                    debug!("{} exit({})", self.idstr(), status);
                    tcb.set_retval(status);
                    // SAFETY: the frame belongs to this task's running start routine.
                    unsafe { exit_to(frame) }
                }
            } else {
                // SAFETY: terminates only this task's process.
                unsafe { libc::exit(status) }
            }
        }
        std::process::exit(status)
    }
}

#[cfg(test)]
mod tests;
