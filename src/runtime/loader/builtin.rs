//! In-process program registry
//!
//! Programs are plain `extern "C"` functions registered under a name; a
//! "namespace" is a heap cell holding that function plus private
//! `argc`/`argv`/`environ` cells. It drives the full spawn protocol inside
//! one binary, which is how the runtime's own tests and benchmarks run.

use std::collections::HashMap;
use std::ffi::{c_char, c_int, c_void, CStr};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::debug;

use super::{ImageLoader, LoadedObject, MainFn, Namespace};
use crate::runtime::error::{PipError, Result};
use crate::runtime::sync::SpinGuard;

static PROGRAMS: Lazy<RwLock<HashMap<String, MainFn>>> = Lazy::new(|| RwLock::new(HashMap::new()));

static LIVE_IMAGES: AtomicUsize = AtomicUsize::new(0);

struct BuiltinImage {
    name: String,
    main: MainFn,
    argc: c_int,
    argv: *mut *mut c_char,
    environ: *mut *mut c_char,
}

/// Loader over the process-wide builtin program registry
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinLoader;

impl BuiltinLoader {
    /// Register `main` under `name`, replacing an earlier registration.
    pub fn register(
        name: impl Into<String>,
        main: MainFn,
    ) {
        PROGRAMS.write().insert(name.into(), main);
    }

    pub fn unregister(name: &str) -> bool {
        PROGRAMS.write().remove(name).is_some()
    }

    pub fn is_registered(name: &str) -> bool {
        PROGRAMS.read().contains_key(name)
    }

    /// Number of images loaded and not yet closed.
    pub fn live_images() -> usize {
        LIVE_IMAGES.load(Ordering::SeqCst)
    }

    fn image<'a>(ns: Namespace) -> &'a mut BuiltinImage {
        // SAFETY: builtin namespaces are boxed `BuiltinImage`s until closed.
        unsafe { &mut *ns.as_ptr().cast::<BuiltinImage>() }
    }
}

impl ImageLoader for BuiltinLoader {
    fn load(
        &self,
        path: &CStr,
        _into: Option<Namespace>,
        _guard: &SpinGuard<'_>,
    ) -> Result<Namespace> {
        let name = path.to_string_lossy().into_owned();
        let main = PROGRAMS
            .read()
            .get(&name)
            .copied()
            .ok_or_else(|| PipError::NotExecutable {
                path: name.clone(),
                reason: "no builtin program registered under this name".to_string(),
            })?;

        let image = Box::new(BuiltinImage {
            name,
            main,
            argc: 0,
            argv: ptr::null_mut(),
            environ: ptr::null_mut(),
        });
        LIVE_IMAGES.fetch_add(1, Ordering::SeqCst);
        let raw = Box::into_raw(image).cast::<c_void>();
        Namespace::from_ptr(raw).ok_or(PipError::OutOfMemory)
    }

    fn lookup(
        &self,
        ns: Namespace,
        symbol: &CStr,
        _guard: &SpinGuard<'_>,
    ) -> Option<NonNull<c_void>> {
        let image = Self::image(ns);
        let addr: *mut c_void = match symbol.to_bytes() {
            b"main" => image.main as usize as *mut c_void,
            b"__libc_argc" => (&raw mut image.argc).cast(),
            b"__libc_argv" => (&raw mut image.argv).cast(),
            b"environ" => (&raw mut image.environ).cast(),
            _ => ptr::null_mut(),
        };
        NonNull::new(addr)
    }

    fn close(
        &self,
        ns: Namespace,
        _guard: &SpinGuard<'_>,
    ) {
        // SAFETY: created by `load` via Box::into_raw and closed once.
        let image = unsafe { Box::from_raw(ns.as_ptr().cast::<BuiltinImage>()) };
        debug!("closing builtin image '{}'", image.name);
        LIVE_IMAGES.fetch_sub(1, Ordering::SeqCst);
    }

    fn loaded_objects(
        &self,
        ns: Namespace,
        _guard: &SpinGuard<'_>,
    ) -> Vec<LoadedObject> {
        let image = Self::image(ns);
        vec![LoadedObject {
            name: format!("builtin:{}", image.name),
            base: ns.as_ptr() as usize,
        }]
    }
}
