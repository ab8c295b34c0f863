//! ULP 集成测试
//!
//! 一个任务内多个 ULP 轮转执行，并复用回收后的栈

use std::ffi::{c_char, c_int};

use parking_lot::{const_mutex, Mutex};
use pip_runtime::runtime::spawn::SpawnRequest;
use pip_runtime::runtime::ulp::{Ulp, UlpRequest};
use pip_runtime::runtime::{BuiltinLoader, PipId, Result, Runtime};

use crate::common;

static TRACE: Mutex<Vec<String>> = const_mutex(Vec::new());

/// Logs `argv[1]` and the round number, yielding between rounds.
unsafe extern "C" fn worker(
    _argc: c_int,
    argv: *mut *mut c_char,
    envp: *mut *mut c_char,
) -> c_int {
    let Some(rt) = common::attach(envp) else {
        return 99;
    };
    let name = std::ffi::CStr::from_ptr(*argv.add(1)).to_string_lossy().into_owned();
    for round in 0..3 {
        TRACE.lock().push(format!("{name}{round}"));
        if round < 2 && rt.ulp_yield_back().is_err() {
            return 98;
        }
    }
    name.len() as c_int
}

fn round_robin(rt: &Runtime) -> Result<i32> {
    let mut ulps: Vec<Ulp> = ["a", "bb"]
        .into_iter()
        .map(|name| rt.ulp_spawn(UlpRequest::new("it-worker").args(["it-worker", name])))
        .collect::<Result<_>>()?;

    while ulps.iter().any(|u| !u.is_finished()) {
        for ulp in ulps.iter().filter(|u| !u.is_finished()) {
            rt.ulp_yield_to(ulp)?;
        }
    }

    let stacks: Vec<*const u8> = ulps.iter().map(Ulp::stack_addr).collect();
    let mut total = 0;
    for ulp in ulps.iter_mut() {
        total += rt.ulp_recycle(ulp)?;
    }

    // the last recycled stack is handed out first
    let again = rt.ulp_spawn(UlpRequest::new("it-worker").args(["it-worker", "c"]))?;
    if again.stack_addr() != stacks[1] {
        return Ok(-1);
    }
    while !again.is_finished() {
        rt.ulp_yield_to(&again)?;
    }
    Ok(total + again.retval().unwrap_or(-100))
}

unsafe extern "C" fn scheduler(
    _argc: c_int,
    _argv: *mut *mut c_char,
    envp: *mut *mut c_char,
) -> c_int {
    let Some(rt) = common::attach(envp) else {
        return 99;
    };
    match round_robin(&rt) {
        Ok(status) => status,
        Err(e) => 100 + e.errno(),
    }
}

#[test]
fn test_round_robin_ulps() {
    BuiltinLoader::register("it-worker", worker);
    BuiltinLoader::register("it-scheduler", scheduler);
    let rt = common::root(1);
    let id = rt.spawn(SpawnRequest::new("it-scheduler")).unwrap();
    assert_eq!(rt.wait(PipId::Task(id)).unwrap(), 1 + 2 + 1);

    let trace = TRACE.lock().clone();
    assert_eq!(
        trace,
        ["a0", "bb0", "a1", "bb1", "a2", "bb2", "c0", "c1", "c2"]
    );
}
