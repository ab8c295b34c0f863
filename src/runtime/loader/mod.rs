//! Namespace loader
//!
//! Every task gets its program loaded into a private link-map namespace, so
//! independently built programs (each with its own libc state) can share one
//! address space. After loading, a fixed set of well-known symbols is
//! resolved into [`TargetHooks`]; `main` and `environ` are mandatory.
//!
//! All loader calls take a [`SpinGuard`] for the runtime's loader lock. The
//! dynamic linker's bookkeeping is process-wide, so callers lock once and
//! pass the proof down instead of every helper locking on its own.

mod builtin;
mod elf;
pub(crate) mod ffi;

pub use builtin::BuiltinLoader;
pub use elf::check_pie;

use std::ffi::{c_char, c_int, c_void, CStr, OsStr};
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr::{self, NonNull};

use tracing::{debug, warn};

use crate::runtime::error::{PipError, Result};
use crate::runtime::sync::SpinGuard;

pub type MainFn = unsafe extern "C" fn(c_int, *mut *mut c_char, *mut *mut c_char) -> c_int;
pub type CtypeInitFn = unsafe extern "C" fn();
pub type GlibcInitFn = unsafe extern "C" fn(c_int, *mut *mut c_char, *mut *mut c_char);
pub type FflushFn = unsafe extern "C" fn(*mut c_void) -> c_int;
pub type MalloptFn = unsafe extern "C" fn(c_int, c_int) -> c_int;
pub type FreeFn = unsafe extern "C" fn(*mut c_void);

const M_TRIM_THRESHOLD: c_int = -1;
const M_MMAP_THRESHOLD: c_int = -3;

/// Opaque handle of a loaded namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Namespace(NonNull<c_void>);

// SAFETY: the handle is an address-space-wide token, not thread-bound state.
unsafe impl Send for Namespace {}
unsafe impl Sync for Namespace {}

impl Namespace {
    pub fn from_ptr(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(Namespace)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }
}

/// Symbols resolved from a loaded program
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TargetHooks {
    pub main: Option<MainFn>,
    pub ctype_init: Option<CtypeInitFn>,
    pub glibc_init: Option<GlibcInitFn>,
    pub fflush: Option<FflushFn>,
    pub mallopt: Option<MalloptFn>,
    pub free: Option<FreeFn>,
    pub libc_argcp: *mut c_int,
    pub libc_argvp: *mut *mut *mut c_char,
    pub environ: *mut *mut *mut c_char,
}

impl Default for TargetHooks {
    fn default() -> Self {
        Self {
            main: None,
            ctype_init: None,
            glibc_init: None,
            fflush: None,
            mallopt: None,
            free: None,
            libc_argcp: ptr::null_mut(),
            libc_argvp: ptr::null_mut(),
            environ: ptr::null_mut(),
        }
    }
}

impl fmt::Debug for TargetHooks {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("TargetHooks")
            .field("main", &self.main.is_some())
            .field("ctype_init", &self.ctype_init.is_some())
            .field("glibc_init", &self.glibc_init.is_some())
            .field("fflush", &self.fflush.is_some())
            .field("mallopt", &self.mallopt.is_some())
            .field("free", &self.free.is_some())
            .field("libc_argcp", &self.libc_argcp)
            .field("libc_argvp", &self.libc_argvp)
            .field("environ", &self.environ)
            .finish()
    }
}

macro_rules! cast_symbol {
    ($ptr:expr, $ty:ty) => {
        // SAFETY: the symbol name fixes the signature.
        $ptr.map(|p: NonNull<c_void>| unsafe { std::mem::transmute::<*mut c_void, $ty>(p.as_ptr()) })
    };
}

impl TargetHooks {
    /// Resolve every hook through `lookup`; `main` and `environ` must exist.
    pub fn resolve<F>(
        path: &str,
        lookup: F,
    ) -> Result<Self>
    where
        F: Fn(&CStr) -> Option<NonNull<c_void>>,
    {
        let main = cast_symbol!(lookup(c"main"), MainFn).ok_or_else(|| PipError::MissingSymbol {
            path: path.to_string(),
            symbol: "main",
        })?;
        let environ = lookup(c"environ")
            .map(|p| p.as_ptr().cast::<*mut *mut c_char>())
            .ok_or_else(|| PipError::MissingSymbol {
                path: path.to_string(),
                symbol: "environ",
            })?;

        Ok(Self {
            main: Some(main),
            ctype_init: cast_symbol!(lookup(c"__ctype_init"), CtypeInitFn),
            glibc_init: cast_symbol!(lookup(c"glibc_init"), GlibcInitFn),
            fflush: cast_symbol!(lookup(c"fflush"), FflushFn),
            mallopt: cast_symbol!(lookup(c"mallopt"), MalloptFn),
            free: cast_symbol!(lookup(c"free"), FreeFn),
            libc_argcp: lookup(c"__libc_argc").map_or(ptr::null_mut(), |p| p.as_ptr().cast()),
            libc_argvp: lookup(c"__libc_argv").map_or(ptr::null_mut(), |p| p.as_ptr().cast()),
            environ,
        })
    }

    /// Bring the target's own libc into the state its `main` expects.
    ///
    /// # Safety
    ///
    /// The hooks must come from a namespace that is still loaded, and the
    /// vectors must stay alive while the target runs.
    pub unsafe fn install(
        &self,
        argc: c_int,
        argv: *mut *mut c_char,
        envv: *mut *mut c_char,
    ) {
        if !self.libc_argcp.is_null() {
            *self.libc_argcp = argc;
        }
        if !self.libc_argvp.is_null() {
            *self.libc_argvp = argv;
        }
        if !self.environ.is_null() {
            *self.environ = envv;
        }
        if let Some(mallopt) = self.mallopt {
            // keep freed memory in the shared address space
            mallopt(M_MMAP_THRESHOLD, 0);
            mallopt(M_TRIM_THRESHOLD, -1);
        }
        if let Some(init) = self.glibc_init {
            init(argc, argv, envv);
        } else if let Some(ctype_init) = self.ctype_init {
            ctype_init();
        }
    }

    /// Flush the target's stdio buffers through its own libc.
    ///
    /// # Safety
    ///
    /// Same as [`TargetHooks::install`].
    pub unsafe fn flush(&self) {
        if let Some(fflush) = self.fflush {
            fflush(ptr::null_mut());
        }
    }
}

/// One object in a namespace's link map
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedObject {
    pub name: String,
    pub base: usize,
}

/// Loads program images into isolated namespaces
pub trait ImageLoader: Send + Sync {
    /// Load `path` into a new namespace, or into the namespace of `into`.
    fn load(
        &self,
        path: &CStr,
        into: Option<Namespace>,
        guard: &SpinGuard<'_>,
    ) -> Result<Namespace>;

    fn lookup(
        &self,
        ns: Namespace,
        symbol: &CStr,
        guard: &SpinGuard<'_>,
    ) -> Option<NonNull<c_void>>;

    fn close(
        &self,
        ns: Namespace,
        guard: &SpinGuard<'_>,
    );

    fn loaded_objects(
        &self,
        ns: Namespace,
        guard: &SpinGuard<'_>,
    ) -> Vec<LoadedObject>;
}

/// Load a program and resolve its hooks; a missing mandatory symbol closes
/// the freshly opened handle again.
pub fn load_target(
    loader: &dyn ImageLoader,
    path: &CStr,
    into: Option<Namespace>,
    guard: &SpinGuard<'_>,
) -> Result<(Namespace, TargetHooks)> {
    let ns = loader.load(path, into, guard)?;
    let shown = path.to_string_lossy();
    match TargetHooks::resolve(&shown, |name| loader.lookup(ns, name, guard)) {
        Ok(hooks) => {
            debug!("loaded '{}' as {:p}", shown, ns.as_ptr());
            Ok((ns, hooks))
        }
        Err(e) => {
            loader.close(ns, guard);
            Err(e)
        }
    }
}

/// `dlmopen(3)` with `RTLD_NOW | RTLD_LOCAL`
#[derive(Debug, Default, Clone, Copy)]
pub struct DlmopenLoader;

fn dlerror_message() -> String {
    // SAFETY: dlerror returns NULL or a NUL-terminated string.
    unsafe {
        let msg = libc::dlerror();
        if msg.is_null() {
            "unknown dynamic linker error".to_string()
        } else {
            CStr::from_ptr(msg).to_string_lossy().into_owned()
        }
    }
}

impl ImageLoader for DlmopenLoader {
    fn load(
        &self,
        path: &CStr,
        into: Option<Namespace>,
        _guard: &SpinGuard<'_>,
    ) -> Result<Namespace> {
        let mut lmid = ffi::LM_ID_NEWLM;
        if let Some(ns) = into {
            // SAFETY: `ns` is a live dlmopen handle and `lmid` is writable.
            let rc = unsafe {
                ffi::dlinfo(ns.as_ptr(), ffi::RTLD_DI_LMID, (&raw mut lmid).cast())
            };
            if rc != 0 {
                return Err(PipError::NotExecutable {
                    path: path.to_string_lossy().into_owned(),
                    reason: dlerror_message(),
                });
            }
        }

        // SAFETY: `path` is NUL terminated.
        let handle =
            unsafe { ffi::dlmopen(lmid, path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if let Some(ns) = Namespace::from_ptr(handle) {
            return Ok(ns);
        }

        let reason = dlerror_message();
        let shown = path.to_string_lossy().into_owned();
        match check_pie(Path::new(OsStr::from_bytes(path.to_bytes()))) {
            Err(e @ (PipError::CorruptImage(_) | PipError::NotRelocatable(_))) => {
                warn!("dlmopen({}): {}", shown, reason);
                Err(e)
            }
            _ => Err(PipError::NotExecutable {
                path: shown,
                reason,
            }),
        }
    }

    fn lookup(
        &self,
        ns: Namespace,
        symbol: &CStr,
        _guard: &SpinGuard<'_>,
    ) -> Option<NonNull<c_void>> {
        // SAFETY: live handle, NUL-terminated name.
        NonNull::new(unsafe { libc::dlsym(ns.as_ptr(), symbol.as_ptr()) })
    }

    fn close(
        &self,
        ns: Namespace,
        _guard: &SpinGuard<'_>,
    ) {
        // SAFETY: the handle came from dlmopen and is closed once.
        if unsafe { libc::dlclose(ns.as_ptr()) } != 0 {
            warn!("dlclose: {}", dlerror_message());
        }
    }

    fn loaded_objects(
        &self,
        ns: Namespace,
        _guard: &SpinGuard<'_>,
    ) -> Vec<LoadedObject> {
        let mut map: *mut ffi::LinkMap = ptr::null_mut();
        // SAFETY: live handle; `map` receives a pointer into the linker's list.
        let rc = unsafe { ffi::dlinfo(ns.as_ptr(), ffi::RTLD_DI_LINKMAP, (&raw mut map).cast()) };
        if rc != 0 || map.is_null() {
            return Vec::new();
        }

        let mut objects = Vec::new();
        // SAFETY: the list is stable while the loader lock is held.
        unsafe {
            while !(*map).l_prev.is_null() {
                map = (*map).l_prev;
            }
            while !map.is_null() {
                let name = if (*map).l_name.is_null() {
                    String::new()
                } else {
                    CStr::from_ptr((*map).l_name).to_string_lossy().into_owned()
                };
                objects.push(LoadedObject {
                    name,
                    base: (*map).l_addr,
                });
                map = (*map).l_next;
            }
        }
        objects
    }
}
