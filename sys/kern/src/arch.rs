// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture backends.
//!
//! The kernel proper is architecture-independent; everything that touches
//! registers, fabricated frame conventions, or the physical context switch
//! funnels through this module. Two backends exist:
//!
//! - `arm_m`: the real one, for ARMv7-M class parts.
//! - `fake`: a host-side simulation of the handful of CPU interactions the
//!   kernel needs (PSP/MSP, the switch primitive), so the allocator, the
//!   scheduler, and the syscall surface can be driven by ordinary tests.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "arm")] {
        #[macro_use]
        mod arm_m;
        pub use arm_m::*;
    } else {
        #[macro_use]
        mod fake;
        pub use fake::*;
    }
}
