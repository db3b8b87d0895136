// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv7-M class parts.
//!
//! # Kernel entry and exit
//!
//! Tasks run in thread mode on the process stack (PSP); the kernel runs in
//! handler mode on the main stack. The only way in is the `SVC`
//! instruction: on entry the hardware stacks the caller's volatile frame on
//! its process stack, and the handler below picks the request number out of
//! the `SVC` immediate and forwards to the portable dispatcher. The
//! dispatcher's result is written over the stacked `r0`, which is where the
//! caller finds its return value after exception return.
//!
//! # The switch primitive
//!
//! `skiff_switch` saves the outgoing task's callee-saved registers, its
//! CONTROL word, and its process stack pointer on the outgoing *kernel*
//! stack, then parks that stack pointer in the TCB (whose first field is
//! the kernel SP precisely so this code can use a zero offset). The restore
//! half reloads the incoming task's kernel stack and pops the same frame
//! back off. A task that has never run gets a hand-fabricated frame whose
//! return address is `svc_exit`, so its very first dispatch runs the same
//! restore path as a preempted task and falls out into thread mode through
//! a normal exception return.
//!
//! Frames carry no FPU state; as in the system this kernel descends from,
//! tasks are expected to run with lazy FP stacking disabled.

use core::sync::atomic::{AtomicPtr, Ordering};

use crate::task::Task;

/// Log things from kernel context. Two sinks are available, selected by
/// feature: the ITM ("klog-itm") or semihosting ("klog-semihosting"). With
/// neither feature enabled the macro is stubbed out.
#[cfg(not(any(feature = "klog-semihosting", feature = "klog-itm")))]
macro_rules! klog {
    ($s:expr) => {};
    ($s:expr, $($tt:tt)*) => {};
}

#[cfg(feature = "klog-itm")]
macro_rules! klog {
    ($s:expr) => {
        #[allow(unused_unsafe)]
        unsafe {
            let stim = &mut (*cortex_m::peripheral::ITM::PTR.cast_mut()).stim[0];
            cortex_m::iprintln!(stim, $s);
        }
    };
    ($s:expr, $($tt:tt)*) => {
        #[allow(unused_unsafe)]
        unsafe {
            let stim = &mut (*cortex_m::peripheral::ITM::PTR.cast_mut()).stim[0];
            cortex_m::iprintln!(stim, $s, $($tt)*);
        }
    };
}

#[cfg(feature = "klog-semihosting")]
macro_rules! klog {
    ($s:expr) => { let _ = cortex_m_semihosting::hprintln!($s); };
    ($s:expr, $($tt:tt)*) => { let _ = cortex_m_semihosting::hprintln!($s, $($tt)*); };
}

macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

/// We have to use a global to record the current task pointer, since we
/// don't have a scratch register; the restore half of the switch primitive
/// reads it to find the incoming kernel stack.
#[no_mangle]
static CURRENT_TASK_PTR: AtomicPtr<Task> = AtomicPtr::new(core::ptr::null_mut());

/// Initial xPSR for a fresh task: just the Thumb bit, the minimum required.
pub const INITIAL_PSR: usize = 1 << 24;

/// EXC_RETURN selecting thread mode on the process stack, no FP state.
const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;

/// Reads the process stack pointer, i.e. the stack of the interrupted task.
pub fn read_psp() -> usize {
    cortex_m::register::psp::read() as usize
}

/// Reads the main stack pointer, i.e. the kernel stack currently in use.
pub fn read_msp() -> usize {
    cortex_m::register::msp::read() as usize
}

/// CONTROL word for a task's first entry to thread mode: the nPRIV bit set
/// unless the task is privileged. (SPSEL is immaterial here -- thread-mode
/// stack selection comes from the EXC_RETURN value on exception return.)
pub fn initial_control(privileged: bool) -> usize {
    if privileged {
        0
    } else {
        1
    }
}

/// Address seeded into fresh kernel frames as their return address: the
/// exception-return trampoline at the end of the asm below.
pub fn svc_return_addr() -> usize {
    let f: unsafe extern "C" fn() = svc_exit;
    f as usize
}

/// Entry address for the null task.
pub fn idle_entry() -> usize {
    let f: fn() -> ! = idle_main;
    f as usize
}

fn idle_main() -> ! {
    loop {
        cortex_m::asm::wfi();
    }
}

extern "C" {
    /// Assembly half of the context switch; see the `global_asm!` block.
    fn skiff_switch(old: *mut Task);
    /// Exception-return trampoline; only its address is meaningful here.
    fn svc_exit();
}

/// Switches from `old` to `new`: saves the outgoing context on `old`'s
/// kernel stack and resumes `new` wherever its kernel stack says it left
/// off. Returns (much later) when `old` is next scheduled.
///
/// # Safety
///
/// `old` and `new` must be distinct, valid pointers into the task table,
/// `new`'s kernel stack pointer must address a well-formed switch frame,
/// and this must be called from handler mode with interrupts masked.
pub unsafe fn switch_context(old: *mut Task, new: *mut Task) {
    CURRENT_TASK_PTR.store(new, Ordering::Relaxed);
    // Safety: per this function's contract.
    unsafe {
        skiff_switch(old);
    }
}

/// Launches the first task and never returns.
///
/// Issues an `SVC` from the main stack; the handler recognizes that origin
/// (it can only happen here, once) and vectors straight to the restore
/// path, which unwinds the fabricated frame of `task` into thread mode.
///
/// # Safety
///
/// Call exactly once, after the task table is fully initialized, with
/// `task` naming the task the scheduler selected.
pub unsafe fn start_first_task(task: *mut Task) -> ! {
    CURRENT_TASK_PTR.store(task, Ordering::Relaxed);
    // Safety: inline asm; the SVC never returns here.
    unsafe {
        core::arch::asm!("svc 0", options(noreturn));
    }
}

/// Rust side of the SVC path: reads the caller's stacked frame off the
/// process stack, decodes the request number from the `SVC` immediate, and
/// leaves the dispatcher's result in the stacked `r0`.
///
/// # Safety
///
/// Called only from the `SVCall` asm below, with a valid task frame on the
/// process stack.
#[no_mangle]
unsafe extern "C" fn svc_entry() {
    let frame = read_psp() as *mut u32;
    // Safety: the hardware stacked an 8-word frame at PSP on exception
    // entry; reads within it are valid.
    let (args, nr) = unsafe {
        let args = crate::syscalls::SvcArgs {
            r0: frame.read() as usize,
            r1: frame.add(1).read() as usize,
            r2: frame.add(2).read() as usize,
            r3: frame.add(3).read() as usize,
        };
        // The request number is the immediate of the SVC instruction, the
        // byte below the stacked return address.
        let pc = frame.add(6).read() as *const u8;
        (args, pc.sub(2).read() as u32)
    };

    let ret = crate::startup::with_kernel(|k| {
        // Safety: argument words were captured from the caller's frame; the
        // dispatcher validates them before use.
        unsafe { crate::syscalls::dispatch(k, nr, &args) }
    });

    // Safety: same frame as above; r0 is word 0.
    unsafe {
        frame.write(ret as u32);
    }
}

core::arch::global_asm!(
    "
    .section .text.SVCall
    .globl SVC_Handler
    .type SVC_Handler,function
    .thumb_func
    SVC_Handler:
        @ Inspect LR to find the caller's mode. An SVC from the main stack
        @ only happens once, from start_first_task; vector it straight to
        @ the restore path.
        mov r0, lr
        mov r1, #0xFFFFFFF3
        bic r0, r1
        cmp r0, #0x8
        beq skiff_restore

        push {{r4, lr}}
        bl svc_entry
        pop {{r4, pc}}

    .section .text.skiff_switch
    .globl skiff_switch
    .type skiff_switch,function
    .thumb_func
    skiff_switch:
        @ Save the outgoing task's callee-saved registers and return
        @ address, then its CONTROL and process stack pointer, all on its
        @ kernel stack, and park that stack in the TCB (first field).
        push {{r4-r12, lr}}
        mrs r4, CONTROL
        mrs r5, PSP
        push {{r4-r5}}
        str sp, [r0]

    .globl skiff_restore
    .type skiff_restore,function
    .thumb_func
    skiff_restore:
        @ Adopt the incoming task's kernel stack and pop the same frame
        @ back off. For a task that has never run, the frame was fabricated
        @ at creation and the popped pc lands on svc_exit below.
        movw r1, #:lower16:CURRENT_TASK_PTR
        movt r1, #:upper16:CURRENT_TASK_PTR
        ldr r2, [r1]
        ldr sp, [r2]
        pop {{r4-r5}}
        msr PSP, r5
        msr CONTROL, r4
        isb
        pop {{r4-r12, pc}}

    .section .text.svc_exit
    .globl svc_exit
    .type svc_exit,function
    .thumb_func
    svc_exit:
        @ Return to thread mode on the process stack; the hardware unstacks
        @ the (possibly fabricated) exception frame from PSP.
        ldr lr, ={exc_return}
        bx lr
    ",
    exc_return = const EXC_RETURN_THREAD_PSP,
);
