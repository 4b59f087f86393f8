//! The symmetric stackful context switch.
//!
//! [`switch`] saves the callee-saved register state of the caller into one
//! [`Context`] and resumes from another, so the loop's scheduler context
//! and a task's context each act as the other's return target. A freshly
//! seeded context "returns" into the task trampoline on its own stack.

use std::arch::naked_asm;
use std::mem::offset_of;
#[cfg(target_arch = "x86_64")]
use std::process;

/// Saved machine context of a suspended task or of the scheduler.
///
/// Only the registers the System V / AAPCS64 ABIs require a callee to
/// preserve are kept; everything else is dead across the `switch` call by
/// the calling convention. The instruction pointer travels as a return
/// address on the saved stack (x86_64) or in the saved link register
/// (aarch64).
#[derive(Debug, Default)]
#[repr(C)]
#[cfg(target_arch = "x86_64")]
pub(crate) struct Context {
    rsp: u64,
    r15: u64,
    r14: u64,
    r13: u64,
    r12: u64,
    rbx: u64,
    rbp: u64,
}

#[derive(Debug, Default)]
#[repr(C)]
#[cfg(target_arch = "aarch64")]
pub(crate) struct Context {
    sp: u64,
    x19: u64,
    x20: u64,
    x21: u64,
    x22: u64,
    x23: u64,
    x24: u64,
    x25: u64,
    x26: u64,
    x27: u64,
    x28: u64,
    x29: u64,
    x30: u64,
    d8: u64,
    d9: u64,
    d10: u64,
    d11: u64,
    d12: u64,
    d13: u64,
    d14: u64,
    d15: u64,
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("threadlet context switching supports x86_64 and aarch64 only");

impl Context {
    /// Seeds a context so its first resumption enters `entry` on `stack`.
    ///
    /// The stack top is aligned down to 16 bytes. On x86_64 the entry
    /// address is planted as a return address (leaving `rsp % 16 == 8` at
    /// entry, exactly as after a `call`), with a guard address beneath it
    /// that aborts the process should the entry ever return. On aarch64
    /// the entry travels in the saved link register.
    pub(crate) fn seed(stack: &mut [u8], entry: extern "C" fn() -> !) -> Context {
        let top = (stack.as_mut_ptr() as usize + stack.len()) & !15;

        #[cfg(target_arch = "x86_64")]
        {
            let mut ctx = Context::default();
            unsafe {
                std::ptr::write((top - 8) as *mut usize, stack_guard as usize);
                std::ptr::write((top - 16) as *mut usize, entry as usize);
            }
            ctx.rsp = (top - 16) as u64;
            ctx
        }

        #[cfg(target_arch = "aarch64")]
        {
            let mut ctx = Context::default();
            ctx.sp = top as u64;
            ctx.x30 = entry as usize as u64;
            ctx
        }
    }
}

/// Lands here if a task entry trampoline ever returns.
#[cfg(target_arch = "x86_64")]
extern "C" fn stack_guard() -> ! {
    process::abort()
}

/// Saves the current execution state into `save` and resumes from `load`.
///
/// # Safety
///
/// `save` must be writable and `load` must hold a context that is either
/// freshly seeded or was written by an earlier `switch`, with its stack
/// still alive. The caller must not hold any `RefCell` borrow of loop
/// state across the call: the code resumed from `load` runs on the same
/// thread and takes its own borrows.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch(save: *mut Context, load: *const Context) {
    naked_asm!(
        // `save` arrives in rdi, `load` in rsi. Scratch registers are dead
        // across a call by the ABI; only the callee-saved set travels.
        "mov [rdi + {off_rsp}], rsp",
        "mov [rdi + {off_r15}], r15",
        "mov [rdi + {off_r14}], r14",
        "mov [rdi + {off_r13}], r13",
        "mov [rdi + {off_r12}], r12",
        "mov [rdi + {off_rbx}], rbx",
        "mov [rdi + {off_rbp}], rbp",
        "mov rsp, [rsi + {off_rsp}]",
        "mov r15, [rsi + {off_r15}]",
        "mov r14, [rsi + {off_r14}]",
        "mov r13, [rsi + {off_r13}]",
        "mov r12, [rsi + {off_r12}]",
        "mov rbx, [rsi + {off_rbx}]",
        "mov rbp, [rsi + {off_rbp}]",
        // Pops the resumed context's return address: either `switch`'s own
        // caller or a freshly seeded trampoline.
        "ret",
        off_rsp = const offset_of!(Context, rsp),
        off_r15 = const offset_of!(Context, r15),
        off_r14 = const offset_of!(Context, r14),
        off_r13 = const offset_of!(Context, r13),
        off_r12 = const offset_of!(Context, r12),
        off_rbx = const offset_of!(Context, rbx),
        off_rbp = const offset_of!(Context, rbp),
    )
}

#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch(save: *mut Context, load: *const Context) {
    naked_asm!(
        // `save` arrives in x0, `load` in x1. x19-x28, the frame and link
        // registers, sp and the low halves of v8-v15 are callee-saved.
        "mov x9, sp",
        "str x9, [x0, {off_sp}]",
        "stp x19, x20, [x0, {off_x19}]",
        "stp x21, x22, [x0, {off_x21}]",
        "stp x23, x24, [x0, {off_x23}]",
        "stp x25, x26, [x0, {off_x25}]",
        "stp x27, x28, [x0, {off_x27}]",
        "stp x29, x30, [x0, {off_x29}]",
        "stp d8, d9, [x0, {off_d8}]",
        "stp d10, d11, [x0, {off_d10}]",
        "stp d12, d13, [x0, {off_d12}]",
        "stp d14, d15, [x0, {off_d14}]",
        "ldr x9, [x1, {off_sp}]",
        "mov sp, x9",
        "ldp x19, x20, [x1, {off_x19}]",
        "ldp x21, x22, [x1, {off_x21}]",
        "ldp x23, x24, [x1, {off_x23}]",
        "ldp x25, x26, [x1, {off_x25}]",
        "ldp x27, x28, [x1, {off_x27}]",
        "ldp x29, x30, [x1, {off_x29}]",
        "ldp d8, d9, [x1, {off_d8}]",
        "ldp d10, d11, [x1, {off_d10}]",
        "ldp d12, d13, [x1, {off_d12}]",
        "ldp d14, d15, [x1, {off_d14}]",
        // Jumps to the restored link register: `switch`'s caller or a
        // freshly seeded trampoline.
        "ret",
        off_sp = const offset_of!(Context, sp),
        off_x19 = const offset_of!(Context, x19),
        off_x21 = const offset_of!(Context, x21),
        off_x23 = const offset_of!(Context, x23),
        off_x25 = const offset_of!(Context, x25),
        off_x27 = const offset_of!(Context, x27),
        off_x29 = const offset_of!(Context, x29),
        off_d8 = const offset_of!(Context, d8),
        off_d10 = const offset_of!(Context, d10),
        off_d12 = const offset_of!(Context, d12),
        off_d14 = const offset_of!(Context, d14),
    )
}
