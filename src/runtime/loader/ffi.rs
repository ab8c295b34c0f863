//! glibc entry points the `libc` crate does not declare

use std::ffi::{c_char, c_int, c_long, c_void};

pub type Lmid = c_long;

/// New, empty link-map namespace
pub const LM_ID_NEWLM: Lmid = -1;

pub const RTLD_DI_LMID: c_int = 1;
pub const RTLD_DI_LINKMAP: c_int = 2;

/// Head of `struct link_map`; only the public fields
#[repr(C)]
pub struct LinkMap {
    pub l_addr: usize,
    pub l_name: *const c_char,
    pub l_ld: *mut c_void,
    pub l_next: *mut LinkMap,
    pub l_prev: *mut LinkMap,
}

extern "C" {
    pub fn dlmopen(
        lmid: Lmid,
        filename: *const c_char,
        flags: c_int,
    ) -> *mut c_void;

    pub fn dlinfo(
        handle: *mut c_void,
        request: c_int,
        info: *mut c_void,
    ) -> c_int;

    pub fn pthread_tryjoin_np(
        thread: libc::pthread_t,
        retval: *mut *mut c_void,
    ) -> c_int;

    pub fn pthread_timedjoin_np(
        thread: libc::pthread_t,
        retval: *mut *mut c_void,
        abstime: *const libc::timespec,
    ) -> c_int;
}
