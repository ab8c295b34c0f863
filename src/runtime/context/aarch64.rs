//! aarch64 context primitives (AAPCS64)
//!
//! Saved frame, 176 bytes: x19..x28, x29, x30, d8..d15, padding.

use std::arch::global_asm;
use std::ffi::c_void;

use super::ContextEntry;

const FRAME_SIZE: usize = 176;

global_asm!(
    ".text",
    ".p2align 4",
    ".globl pip_runtime_ctx_switch",
    ".type pip_runtime_ctx_switch,%function",
    "pip_runtime_ctx_switch:",
    "sub sp, sp, #176",
    "stp x19, x20, [sp, #0]",
    "stp x21, x22, [sp, #16]",
    "stp x23, x24, [sp, #32]",
    "stp x25, x26, [sp, #48]",
    "stp x27, x28, [sp, #64]",
    "stp x29, x30, [sp, #80]",
    "stp d8, d9, [sp, #96]",
    "stp d10, d11, [sp, #112]",
    "stp d12, d13, [sp, #128]",
    "stp d14, d15, [sp, #144]",
    "mov x9, sp",
    "str x9, [x0]",
    "mov sp, x1",
    "b .Lpip_runtime_ctx_restore",
    ".size pip_runtime_ctx_switch, .-pip_runtime_ctx_switch",
    "",
    // First switch into a prepared stack lands here: x19 = entry, x20 = arg.
    ".p2align 4",
    ".type pip_runtime_ctx_bootstrap,%function",
    "pip_runtime_ctx_bootstrap:",
    "mov x0, x20",
    "blr x19",
    "brk #0",
    ".size pip_runtime_ctx_bootstrap, .-pip_runtime_ctx_bootstrap",
    "",
    ".p2align 4",
    ".globl pip_runtime_ctx_run_with_exit",
    ".type pip_runtime_ctx_run_with_exit,%function",
    "pip_runtime_ctx_run_with_exit:",
    "sub sp, sp, #176",
    "stp x19, x20, [sp, #0]",
    "stp x21, x22, [sp, #16]",
    "stp x23, x24, [sp, #32]",
    "stp x25, x26, [sp, #48]",
    "stp x27, x28, [sp, #64]",
    "stp x29, x30, [sp, #80]",
    "stp d8, d9, [sp, #96]",
    "stp d10, d11, [sp, #112]",
    "stp d12, d13, [sp, #128]",
    "stp d14, d15, [sp, #144]",
    "mov x9, sp",
    "str x9, [x0]",
    "mov x0, x2",
    "blr x1",
    "mov w0, #0",
    "b .Lpip_runtime_ctx_restore",
    ".size pip_runtime_ctx_run_with_exit, .-pip_runtime_ctx_run_with_exit",
    "",
    ".p2align 4",
    ".globl pip_runtime_ctx_exit_to",
    ".type pip_runtime_ctx_exit_to,%function",
    "pip_runtime_ctx_exit_to:",
    "ldr x9, [x0]",
    "mov sp, x9",
    "mov w0, #1",
    ".Lpip_runtime_ctx_restore:",
    "ldp x19, x20, [sp, #0]",
    "ldp x21, x22, [sp, #16]",
    "ldp x23, x24, [sp, #32]",
    "ldp x25, x26, [sp, #48]",
    "ldp x27, x28, [sp, #64]",
    "ldp x29, x30, [sp, #80]",
    "ldp d8, d9, [sp, #96]",
    "ldp d10, d11, [sp, #112]",
    "ldp d12, d13, [sp, #128]",
    "ldp d14, d15, [sp, #144]",
    "add sp, sp, #176",
    "ret",
    ".size pip_runtime_ctx_exit_to, .-pip_runtime_ctx_exit_to",
);

extern "C" {
    fn pip_runtime_ctx_bootstrap();
}

pub(super) unsafe fn init_stack(
    stack_top: usize,
    entry: ContextEntry,
    arg: *mut c_void,
) -> usize {
    let sp = (stack_top & !15) - FRAME_SIZE;
    let frame = sp as *mut usize;
    for i in 0..FRAME_SIZE / 8 {
        frame.add(i).write(0);
    }
    frame.add(0).write(entry as usize); // x19
    frame.add(1).write(arg as usize); // x20
    frame.add(11).write(pip_runtime_ctx_bootstrap as usize); // x30
    sp
}
