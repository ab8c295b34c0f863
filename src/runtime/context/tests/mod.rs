//! Context 单元测试
//!
//! 测试上下文切换与退出延续

use std::ffi::c_void;

use crate::runtime::context::{exit_to, run_with_exit, switch, Context, ExitFrame};

#[cfg(test)]
mod switch_tests {
    use super::*;

    struct PingPong {
        host: Context,
        fiber: Context,
        rounds: usize,
    }

    unsafe extern "C" fn ping(arg: *mut c_void) -> ! {
        let state = arg.cast::<PingPong>();
        loop {
            (*state).rounds += 1;
            switch(&raw mut (*state).fiber, &raw const (*state).host);
        }
    }

    #[test]
    fn test_switch_round_trips() {
        let mut stack = vec![0u8; 64 * 1024];
        let mut state = Box::new(PingPong {
            host: Context::current(),
            fiber: Context::current(),
            rounds: 0,
        });
        let arg = (&raw mut *state).cast::<c_void>();
        unsafe {
            let top = stack.as_mut_ptr().add(stack.len());
            state.fiber = Context::prepare(top, ping, arg);
            assert!(state.fiber.is_saved());

            for expected in 1..=3 {
                switch(&raw mut state.host, &raw const state.fiber);
                assert_eq!(state.rounds, expected);
            }
        }
        assert!(state.host.is_saved());
    }

    #[test]
    fn test_current_is_unsaved() {
        assert!(!Context::current().is_saved());
    }
}

#[cfg(test)]
mod exit_tests {
    use super::*;

    struct Probe {
        frame: ExitFrame,
        reached_tail: bool,
        depth: u32,
    }

    unsafe fn descend(probe: *mut Probe) {
        (*probe).depth += 1;
        if (*probe).depth == 4 {
            exit_to(&raw const (*probe).frame);
        }
        if (*probe).depth < 16 {
            descend(probe);
        }
    }

    unsafe extern "C" fn leaves_early(arg: *mut c_void) {
        let probe = arg.cast::<Probe>();
        descend(probe);
        (*probe).reached_tail = true;
    }

    unsafe extern "C" fn returns_normally(arg: *mut c_void) {
        (*arg.cast::<Probe>()).reached_tail = true;
    }

    fn probe() -> Box<Probe> {
        Box::new(Probe {
            frame: ExitFrame::default(),
            reached_tail: false,
            depth: 0,
        })
    }

    #[test]
    fn test_normal_return() {
        let mut p = probe();
        let exited = unsafe {
            run_with_exit(&raw mut p.frame, returns_normally, (&raw mut *p).cast())
        };
        assert!(!exited);
        assert!(p.reached_tail);
    }

    #[test]
    fn test_exit_skips_frames() {
        let mut p = probe();
        let exited =
            unsafe { run_with_exit(&raw mut p.frame, leaves_early, (&raw mut *p).cast()) };
        assert!(exited);
        assert_eq!(p.depth, 4);
        assert!(!p.reached_tail);
    }

    #[test]
    fn test_frame_is_reusable() {
        let mut p = probe();
        for _ in 0..3 {
            p.depth = 0;
            let exited =
                unsafe { run_with_exit(&raw mut p.frame, leaves_early, (&raw mut *p).cast()) };
            assert!(exited);
        }
        assert_eq!(p.depth, 4);
    }
}
