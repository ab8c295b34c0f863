//! CPU core binding of the calling thread

use std::mem;

use tracing::warn;

use crate::runtime::error::{PipError, Result};

fn get_mask() -> Result<libc::cpu_set_t> {
    // SAFETY: cpu_set_t is plain data and the kernel fills it.
    unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        if libc::sched_getaffinity(0, mem::size_of::<libc::cpu_set_t>(), &mut set) != 0 {
            return Err(PipError::last_os_error());
        }
        Ok(set)
    }
}

fn set_mask(set: &libc::cpu_set_t) -> Result<()> {
    // SAFETY: `set` is a valid mask of the declared size.
    if unsafe { libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), set) } != 0 {
        return Err(PipError::last_os_error());
    }
    Ok(())
}

fn single_core(core: usize) -> Result<libc::cpu_set_t> {
    if core >= libc::CPU_SETSIZE as usize {
        return Err(PipError::InvalidArgument("core number out of range"));
    }
    // SAFETY: zeroed is the empty mask; CPU_SET stays in bounds.
    unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        Ok(set)
    }
}

/// Cores the calling thread may run on.
pub fn current_cores() -> Result<Vec<usize>> {
    let set = get_mask()?;
    Ok((0..libc::CPU_SETSIZE as usize)
        // SAFETY: index within CPU_SETSIZE.
        .filter(|&cpu| unsafe { libc::CPU_ISSET(cpu, &set) })
        .collect())
}

/// Bind the calling thread to `core` for good.
pub fn bind_current(core: usize) -> Result<()> {
    set_mask(&single_core(core)?)
}

/// Temporary binding of the calling thread; the previous mask comes back on drop.
pub struct CoreBinding {
    saved: libc::cpu_set_t,
}

impl CoreBinding {
    pub fn bind(core: usize) -> Result<Self> {
        let saved = get_mask()?;
        set_mask(&single_core(core)?)?;
        Ok(Self { saved })
    }

    /// Bind when a core was requested, do nothing otherwise.
    pub fn bind_opt(core: Option<usize>) -> Result<Option<Self>> {
        core.map(Self::bind).transpose()
    }
}

impl Drop for CoreBinding {
    fn drop(&mut self) {
        if let Err(e) = set_mask(&self.saved) {
            warn!("cannot restore CPU affinity: {}", e);
        }
    }
}
