//! x86_64 context primitives (System V ABI)
//!
//! Saved frame, lowest address first: r15 r14 r13 r12 rbx rbp, return address.

use std::arch::global_asm;
use std::ffi::c_void;

use super::ContextEntry;

const SAVED_WORDS: usize = 7;

global_asm!(
    ".text",
    ".p2align 4",
    ".globl pip_runtime_ctx_switch",
    ".type pip_runtime_ctx_switch,@function",
    "pip_runtime_ctx_switch:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
    ".size pip_runtime_ctx_switch, .-pip_runtime_ctx_switch",
    "",
    // First switch into a prepared stack lands here: r12 = entry, r13 = arg.
    ".p2align 4",
    ".type pip_runtime_ctx_bootstrap,@function",
    "pip_runtime_ctx_bootstrap:",
    "mov rdi, r13",
    "call r12",
    "ud2",
    ".size pip_runtime_ctx_bootstrap, .-pip_runtime_ctx_bootstrap",
    "",
    ".p2align 4",
    ".globl pip_runtime_ctx_run_with_exit",
    ".type pip_runtime_ctx_run_with_exit,@function",
    "pip_runtime_ctx_run_with_exit:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "sub rsp, 8",
    "mov rdi, rdx",
    "call rsi",
    "add rsp, 8",
    "xor eax, eax",
    "jmp .Lpip_runtime_ctx_restore",
    ".size pip_runtime_ctx_run_with_exit, .-pip_runtime_ctx_run_with_exit",
    "",
    ".p2align 4",
    ".globl pip_runtime_ctx_exit_to",
    ".type pip_runtime_ctx_exit_to,@function",
    "pip_runtime_ctx_exit_to:",
    "mov rsp, [rdi]",
    "mov eax, 1",
    ".Lpip_runtime_ctx_restore:",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
    ".size pip_runtime_ctx_exit_to, .-pip_runtime_ctx_exit_to",
);

extern "C" {
    fn pip_runtime_ctx_bootstrap();
}

/// Lay out the initial frame and return the saved stack pointer.
///
/// The bootstrap routine must start with `rsp % 16 == 0` so that the entry
/// function sees the usual `rsp % 16 == 8` after the call.
pub(super) unsafe fn init_stack(
    stack_top: usize,
    entry: ContextEntry,
    arg: *mut c_void,
) -> usize {
    let aligned = stack_top & !15;
    let sp = aligned - (SAVED_WORDS + 2) * 8;
    let frame = sp as *mut usize;
    frame.add(0).write(0); // r15
    frame.add(1).write(0); // r14
    frame.add(2).write(arg as usize); // r13
    frame.add(3).write(entry as usize); // r12
    frame.add(4).write(0); // rbx
    frame.add(5).write(0); // rbp
    frame.add(6).write(pip_runtime_ctx_bootstrap as usize);
    sp
}
