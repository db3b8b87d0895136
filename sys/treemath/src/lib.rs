// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Index arithmetic for a binary buddy tree.
//!
//! A buddy allocator tracks block occupancy in a complete binary tree,
//! numbered breadth-first: level 0 is the single root (the whole pool),
//! level `k` holds `2^k` nodes, and the `i`-th node of level `k` sits at
//! *tree position* `2^k - 1 + i`. This numbering is the load-bearing
//! invariant coupling the occupancy bitmap to the free lists, so it lives
//! here as a standalone module where it can be tested to destruction,
//! independent of any particular allocator.
//!
//! # Invariants
//!
//! For every position `p > 0`: `p` and `buddy(p)` share `parent(p)`, and
//! `children(parent(p))` contains `p`. For every `(k, i)` with
//! `i < 2^k`: `level_of(position(k, i)) == k` and
//! `slot_in_level(position(k, i)) == i`.

// Host tests get std; every other build is no_std. Watch out when editing
// under rust-analyzer, which typically checks with `test` set -- std creep
// in non-test code won't show up until a target build.
#![cfg_attr(not(test), no_std)]

/// Tree position of the first (leftmost) node of `level`.
#[inline]
pub const fn first_position(level: u32) -> usize {
    (1 << level) - 1
}

/// Tree position of the `slot`-th node of `level`.
///
/// `slot` must be less than `2^level`; this is not checked, and a violation
/// yields a position on some deeper level rather than a panic.
#[inline]
pub const fn position(level: u32, slot: usize) -> usize {
    first_position(level) + slot
}

/// Number of nodes in a tree of `levels` levels, which is also the length
/// of an occupancy bitmap indexed by tree position.
#[inline]
pub const fn node_count(levels: u32) -> usize {
    (1 << levels) - 1
}

/// Level that `pos` belongs to: the largest `k` with `2^k <= pos + 1`.
#[inline]
pub const fn level_of(pos: usize) -> u32 {
    (pos + 1).ilog2()
}

/// Index of `pos` within its level, counting from zero at the left edge:
/// `pos + 1 - 2^level_of(pos)`.
#[inline]
pub const fn slot_in_level(pos: usize) -> usize {
    pos - first_position(level_of(pos))
}

/// Position of the block that `pos` was split off from. The root has no
/// parent; calling this with `pos == 0` is a bug in the caller.
///
/// # Panics
///
/// In debug builds, if `pos` is the root.
#[inline]
pub const fn parent(pos: usize) -> usize {
    debug_assert!(pos > 0);
    (pos - 1) / 2
}

/// Positions of the two halves `pos` splits into, lower-address half first.
#[inline]
pub const fn children(pos: usize) -> (usize, usize) {
    (2 * pos + 1, 2 * pos + 2)
}

/// Position of the sibling sharing `pos`'s parent, or `None` for the root.
///
/// Odd positions are left children and buddy with `pos + 1`; even non-root
/// positions are right children and buddy with `pos - 1`.
#[inline]
pub const fn buddy(pos: usize) -> Option<usize> {
    if pos == 0 {
        None
    } else if pos % 2 == 1 {
        Some(pos + 1)
    } else {
        Some(pos - 1)
    }
}
