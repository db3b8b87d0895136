// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Last-resort failure reporting.
//!
//! The executive has no one to return an error to when its own invariants
//! break (a corrupt task table, a free list disagreeing with the occupancy
//! bitmap, the scheduler coming up empty-handed). Those conditions funnel
//! into [`die`], which records what happened where a debugger can find it
//! and stops:
//!
//! - `KERNEL_HAS_FAILED` is cleared at boot and set on the way down.
//! - `KERNEL_EPITAPH` receives as much of the failure message (UTF-8,
//!   NUL-padded) as fits.
//!
//! On the host, `die` simply panics so a failing test reports the message.

use core::fmt::Display;

/// One-stop flag for triage tooling: has the kernel failed?
#[used]
static mut KERNEL_HAS_FAILED: bool = false;

const EPITAPH_LEN: usize = 128;

/// Description of the failure, NUL-padded. Valid only once
/// `KERNEL_HAS_FAILED` is set.
#[used]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

/// Records `msg` and halts the kernel.
#[cfg(target_os = "none")]
pub fn die(msg: impl Display) -> ! {
    use core::fmt::Write;

    // Safety: single-core, and we never return; the only hazard is dying
    // inside die, which the flag check below turns into a plain halt.
    let already = unsafe {
        core::ptr::replace(core::ptr::addr_of_mut!(KERNEL_HAS_FAILED), true)
    };
    if !already {
        // Safety: the flag guarantees one writer, ever.
        let buf = unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) };
        let mut w = Epitaph { buf: &mut buf[..] };
        write!(w, "{msg}").ok();
    }
    loop {
        // Platform-independent NOP.
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}

/// Host rendition: let the test harness see the message.
#[cfg(not(target_os = "none"))]
pub fn die(msg: impl Display) -> ! {
    // Quiet the statics on builds that never reach the bare-metal path.
    let _ = (
        core::ptr::addr_of!(KERNEL_HAS_FAILED),
        core::ptr::addr_of!(KERNEL_EPITAPH),
    );
    panic!("kernel failure: {msg}");
}

#[cfg(target_os = "none")]
struct Epitaph {
    buf: &'static mut [u8],
}

#[cfg(target_os = "none")]
impl core::fmt::Write for Epitaph {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.buf.len());
        let taken = core::mem::take(&mut self.buf);
        let (dst, rest) = taken.split_at_mut(n);
        dst.copy_from_slice(&s[..n]);
        self.buf = rest;
        Ok(())
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    die(info)
}
