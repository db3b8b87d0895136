// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executive ABI definitions, shared between the kernel and applications.

#![no_std]

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Maximum number of task slots, including the null task. Task ids are
/// indices into the TCB table, so they live in `[0, MAX_TASKS)`.
pub const MAX_TASKS: usize = 16;

/// Number of scheduling levels: the four user priorities plus the idle level
/// reserved for the null task.
pub const NUM_PRIORITIES: usize = 5;

/// Size of each statically reserved kernel stack, in bytes.
pub const KERN_STACK_SIZE: usize = 512;

/// Minimum user stack size, in bytes. Requests below this are rounded up at
/// task creation.
pub const PROC_STACK_SIZE: usize = 512;

/// log2 of the byte size of each managed memory pool (32 KiB).
pub const POOL_SIZE_LOG2: u32 = 15;

/// Byte size of each managed memory pool.
pub const POOL_SIZE: usize = 1 << POOL_SIZE_LOG2;

/// log2 of the smallest allocatable block (32 B). Every address handed out
/// by the allocator is a multiple of this block size.
pub const MIN_BLOCK_LOG2: u32 = 5;

/// Base address of the first managed RAM region, which backs pool #1 (the
/// pool user allocations are served from).
pub const RAM1_BASE: usize = 0x2001_0000;

/// Base address of the second managed RAM region, which backs pool #2 (the
/// pool the kernel draws task stacks and queue nodes from).
pub const RAM2_BASE: usize = 0x2002_0000;

/// Success status at the supervisor-call boundary.
pub const STATUS_OK: usize = 0;

/// Failure status at the supervisor-call boundary; the all-ones pattern so
/// that it reads as -1 in a register dump.
pub const STATUS_ERR: usize = usize::MAX;

/// Names one slot of the task table.
///
/// Unlike a full-size kernel's task identifiers there is no generation
/// number here: slots are reused by design, and the creation API hands the
/// reused id back to the caller.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Unaligned,
    Serialize,
    Deserialize,
)]
#[repr(transparent)]
pub struct Tid(pub u8);

impl Tid {
    /// The null (idle) task. Always present, always runnable, never exits.
    pub const NULL: Self = Self(0);

    /// This id as a table index.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    /// Checks whether this id can name a table slot at all.
    pub fn is_valid(self) -> bool {
        self.index() < MAX_TASKS
    }
}

impl Default for Tid {
    fn default() -> Self {
        Self::NULL
    }
}

/// Indicates the priority of a task.
///
/// Priorities are small numbers starting from zero, and numerically lower
/// values are more important: P0 outranks P1, and so on down to the idle
/// level that only the null task occupies.
///
/// There is no `PartialOrd`/`Ord` impl on purpose. Because the encoding
/// runs backwards (the biggest number is the idle level), a bare `a < b`
/// at a call site would be ambiguous about which task wins the CPU; every
/// comparison instead goes through [`Priority::is_more_important_than`],
/// which says what it means.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Unaligned,
    Serialize,
    Deserialize,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Highest user priority.
    pub const P0: Self = Self(0);
    pub const P1: Self = Self(1);
    pub const P2: Self = Self(2);
    /// Lowest user priority.
    pub const P3: Self = Self(3);
    /// Idle level, reserved for the null task. Not accepted from user code.
    pub const NULL: Self = Self(4);

    /// Checks whether a task at `self` outranks one at `other`, i.e. would
    /// be chosen over it at a scheduling decision point. Strict: a
    /// priority does not outrank itself, which is what gives tasks of
    /// equal priority their round-robin behavior.
    pub fn is_more_important_than(self, other: Self) -> bool {
        // Backwards encoding: smaller number, higher rank.
        self.0 < other.0
    }

    /// Checks whether this is one of the four priorities user code may
    /// assign (P0 through P3).
    pub fn is_user(self) -> bool {
        self.0 < (NUM_PRIORITIES - 1) as u8
    }

    /// This priority as a ready-queue index.
    pub fn level(self) -> usize {
        usize::from(self.0)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NULL
    }
}

/// Life-cycle state of a task-table slot.
///
/// Legal transitions: `Uninitialized -> Ready` (create), `Ready <-> Running`
/// (scheduling), `Running -> Dormant` (exit), and `Dormant -> Ready` (slot
/// reuse by a later create). Everything else indicates kernel corruption.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum TaskState {
    /// Slot has never held a task. The boot state of every slot.
    #[default]
    Uninitialized,
    /// Task can be scheduled, and is in the ready queue of its priority.
    Ready,
    /// Task is the one currently on the CPU. Exactly one task is in this
    /// state at any quiescent point.
    Running,
    /// Task has exited. Its user stack has been released; the slot can be
    /// reused by a later create.
    Dormant,
}

impl TaskState {
    /// Checks whether a slot in this state is free for a new task.
    pub fn is_available(self) -> bool {
        matches!(self, TaskState::Uninitialized | TaskState::Dormant)
    }
}

bitflags::bitflags! {
    /// Boolean flags controlling task behavior.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    #[repr(transparent)]
    pub struct TaskFlags: u32 {
        /// Task runs privileged in thread mode; its fabricated CONTROL word
        /// keeps the nPRIV bit clear.
        const PRIVILEGED = 1 << 0;
    }
}

/// Errors surfaced to callers of supervisor operations.
///
/// The discriminants are the classic errno values the original interface
/// exposed, so user code linking against a C runtime sees familiar numbers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum Error {
    /// Operation not permitted for this caller or target.
    NotPermitted = 1,
    /// A table is full; retry after some task exits.
    TryAgain = 11,
    /// No block of sufficient size is available.
    NoMemory = 12,
    /// Address lies outside the managed region.
    BadAddress = 14,
    /// An argument failed validation.
    InvalidArg = 22,
}

/// Memory-management algorithm selector carried in the boot record. Only
/// the buddy system is recognized.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum MemAlgo {
    Buddy = 0,
}

impl core::convert::TryFrom<u32> for MemAlgo {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Buddy),
            _ => Err(()),
        }
    }
}

/// System boot record handed to RTX_INIT.
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct SysInfo {
    /// Requested memory-management algorithm, checked against [`MemAlgo`].
    pub mem_algo: u32,
}

/// Record describing one task to be created, either at boot (RTX_INIT) or
/// through TSK_CREATE.
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct TaskInit {
    /// Address of the task's entry point.
    pub entry: usize,
    /// Initial priority.
    pub prio: Priority,
    /// Behavior flags.
    pub flags: TaskFlags,
    /// Requested user stack size in bytes. Rounded up to a power of two no
    /// smaller than [`PROC_STACK_SIZE`].
    pub stack_size: usize,
}

/// Task snapshot returned by TSK_GET. Read-only to callers.
///
/// For the calling task, `u_sp` and `k_sp` are read from the live stack
/// pointer registers; for any other task they are the values captured in
/// its TCB at its last suspension.
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct TaskInfo {
    pub tid: Tid,
    pub prio: Priority,
    pub state: TaskState,
    pub privileged: bool,
    pub entry: usize,
    pub u_sp: usize,
    pub u_sp_base: usize,
    pub u_stack_size: usize,
    pub k_sp: usize,
    pub k_sp_base: usize,
    pub k_stack_size: usize,
}

/// Enumeration of supervisor-call numbers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum SvcNum {
    RtxInit = 1,
    MemAlloc = 2,
    MemDealloc = 3,
    MemDump = 4,
    TskCreate = 5,
    TskExit = 6,
    TskYield = 7,
    TskSetPrio = 8,
    TskGet = 9,
    TskGetTid = 10,
}

/// Explicit `TryFrom` rather than a `FromPrimitive` derive, so the kernel
/// picks up no numeric-traits dependency for one match statement.
impl core::convert::TryFrom<u32> for SvcNum {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            1 => Ok(Self::RtxInit),
            2 => Ok(Self::MemAlloc),
            3 => Ok(Self::MemDealloc),
            4 => Ok(Self::MemDump),
            5 => Ok(Self::TskCreate),
            6 => Ok(Self::TskExit),
            7 => Ok(Self::TskYield),
            8 => Ok(Self::TskSetPrio),
            9 => Ok(Self::TskGet),
            10 => Ok(Self::TskGetTid),
            _ => Err(()),
        }
    }
}
