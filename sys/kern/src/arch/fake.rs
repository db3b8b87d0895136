// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side stand-in for the CPU.
//!
//! Keeps per-thread simulated PSP/MSP values and records context switches
//! instead of performing them, which is exactly enough for the rest of the
//! kernel to run under the ordinary test harness. Each test thread gets its
//! own simulated CPU, so tests can run in parallel.

use std::cell::Cell;

use crate::task::Task;

macro_rules! uassert {
    ($cond:expr) => {
        assert!($cond)
    };
}

macro_rules! klog {
    ($s:expr) => { println!($s) };
    ($s:expr, $($tt:tt)*) => { println!($s, $($tt)*) };
}

/// Initial xPSR for a fresh task: just the Thumb bit, as on the real
/// architecture, so frame-fabrication tests see the genuine value.
pub const INITIAL_PSR: usize = 1 << 24;

thread_local! {
    static PSP: Cell<usize> = const { Cell::new(0) };
    static MSP: Cell<usize> = const { Cell::new(0) };
    static SWITCHES: Cell<usize> = const { Cell::new(0) };
}

/// Reads the simulated process stack pointer.
pub fn read_psp() -> usize {
    PSP.with(|c| c.get())
}

/// Reads the simulated main stack pointer.
pub fn read_msp() -> usize {
    MSP.with(|c| c.get())
}

/// Test hook: plants a value in the simulated process stack pointer, as if
/// the current task had been executing with it.
pub fn set_psp(v: usize) {
    PSP.with(|c| c.set(v));
}

/// Test hook: number of context switches taken on this thread so far.
pub fn context_switches() -> usize {
    SWITCHES.with(|c| c.get())
}

/// CONTROL word for a task's first entry to thread mode: the nPRIV bit set
/// unless the task is privileged.
pub fn initial_control(privileged: bool) -> usize {
    if privileged {
        0
    } else {
        1
    }
}

/// Address seeded into fresh kernel frames as the return-to-thread-mode
/// trampoline. Frames fabricated on the host are never executed, so this is
/// just a recognizable value.
pub fn svc_return_addr() -> usize {
    0x5afe_0000
}

/// Entry address for the null task.
pub fn idle_entry() -> usize {
    let f: fn() -> ! = idle_main;
    f as usize
}

fn idle_main() -> ! {
    loop {
        std::hint::spin_loop();
    }
}

/// Simulated context switch: adopt the incoming task's saved stack
/// pointers and keep going. The outgoing task's kernel frame is left
/// untouched so tests can inspect it.
///
/// # Safety
///
/// `old` and `new` must be distinct, valid pointers into the task table.
pub unsafe fn switch_context(old: *mut Task, new: *mut Task) {
    let _ = old;
    // Safety: per this function's contract, `new` is valid.
    let new = unsafe { &*new };
    PSP.with(|c| c.set(new.user_sp()));
    MSP.with(|c| c.set(new.kernel_sp()));
    SWITCHES.with(|c| c.set(c.get() + 1));
}

/// On hardware this launches the first task and never returns; on the host
/// there is nothing to launch into.
pub unsafe fn start_first_task(task: *mut Task) -> ! {
    let _ = task;
    panic!("entering user mode");
}
