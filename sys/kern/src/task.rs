// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tasks: the TCB table and bring-up.
//!
//! Every task is a slot in a fixed table indexed by its id. The executive
//! owns the records outright; the ready queues refer to tasks by id only,
//! which keeps ownership a straight line (table owns task, queue borrows
//! nothing).
//!
//! A task that has never run must be enterable by the exact same restore
//! path as a task that was preempted, so creation fabricates two frames:
//! an exception frame at the top of the fresh user stack (unstacked by the
//! hardware on the task's first exception return), and a switch frame on
//! the task's kernel stack (popped by the restore half of the context
//! switch). User stacks come from pool #2; kernel stacks are statically
//! reserved, one per slot.

use skiff_abi::{
    Error, Priority, TaskFlags, TaskInfo, TaskInit, TaskState, Tid, KERN_STACK_SIZE, MAX_TASKS,
    PROC_STACK_SIZE,
};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::fail;
use crate::mpool::{self, PoolId};
use crate::sched;
use crate::startup::Kernel;

/// Task control block.
///
/// Fields are private to this module so that state transitions and stack
/// accounting stay consistent; the rest of the kernel goes through the
/// accessors.
#[repr(C)]
#[derive(Debug)]
pub struct Task {
    /// Saved kernel stack pointer.
    ///
    /// NOTE: must stay the first field. The switch primitive's assembly
    /// stores and reloads it through offset 0 of the TCB.
    kernel_sp: usize,
    /// Life-cycle state; see [`TaskState`] for the legal transitions.
    state: TaskState,
    /// Current priority.
    prio: Priority,
    /// Behavior flags.
    flags: TaskFlags,
    /// Entry point address, kept for TSK_GET.
    entry: usize,
    /// User stack pointer as of the task's last suspension.
    user_sp: usize,
    /// High end of the user stack allocation (stacks grow downward).
    user_sp_base: usize,
    /// Size of the user stack allocation in bytes; zero once dormant.
    user_stack_size: usize,
    /// Per-task error indicator: set when a supervisor operation fails,
    /// untouched on success.
    errno: Option<Error>,
}

impl Task {
    /// An empty slot, as the whole table looks at boot.
    pub(crate) const INIT: Self = Task {
        kernel_sp: 0,
        state: TaskState::Uninitialized,
        prio: Priority::NULL,
        flags: TaskFlags::empty(),
        entry: 0,
        user_sp: 0,
        user_sp_base: 0,
        user_stack_size: 0,
        errno: None,
    };

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Moves this task to `new`, enforcing the state machine. An illegal
    /// transition means the kernel has corrupted its own bookkeeping, and
    /// is fatal.
    pub(crate) fn set_state(&mut self, new: TaskState) {
        use TaskState::*;
        let legal = matches!(
            (self.state, new),
            (Uninitialized, Ready)
                | (Dormant, Ready)
                | (Ready, Running)
                | (Running, Ready)
                | (Running, Dormant)
        );
        if !legal {
            fail::die("illegal task state transition");
        }
        self.state = new;
    }

    pub fn priority(&self) -> Priority {
        self.prio
    }

    pub(crate) fn set_priority(&mut self, prio: Priority) {
        self.prio = prio;
    }

    pub fn privileged(&self) -> bool {
        self.flags.contains(TaskFlags::PRIVILEGED)
    }

    pub fn user_sp(&self) -> usize {
        self.user_sp
    }

    pub(crate) fn set_user_sp(&mut self, sp: usize) {
        self.user_sp = sp;
    }

    pub fn kernel_sp(&self) -> usize {
        self.kernel_sp
    }

    /// Last recorded error for this task, if any.
    pub fn errno(&self) -> Option<Error> {
        self.errno
    }

    pub(crate) fn set_errno(&mut self, e: Error) {
        self.errno = Some(e);
    }
}

/// Number of `usize` words in one kernel stack.
const KERN_STACK_WORDS: usize = KERN_STACK_SIZE / core::mem::size_of::<usize>();

/// Words in a fabricated switch frame: CONTROL, the saved user SP, r4-r12
/// cleared, and the return address -- matching, in memory order, what the
/// switch primitive pushes and pops.
const SWITCH_FRAME_WORDS: usize = 12;

/// Statically reserved kernel stacks, one per slot. The alignment keeps
/// every stack top 8-byte aligned, which the frame convention requires.
#[repr(C, align(8))]
pub struct KernelStacks([[usize; KERN_STACK_WORDS]; MAX_TASKS]);

impl KernelStacks {
    pub(crate) const fn new() -> Self {
        Self([[0; KERN_STACK_WORDS]; MAX_TASKS])
    }

    /// High end (the initial top) of `tid`'s kernel stack.
    pub fn top_of(&self, tid: Tid) -> usize {
        self.0[tid.index()].as_ptr() as usize + KERN_STACK_SIZE
    }

    fn stack_mut(&mut self, tid: Tid) -> &mut [usize; KERN_STACK_WORDS] {
        &mut self.0[tid.index()]
    }
}

/// Hardware-order exception frame fabricated at the top of a new task's
/// user stack, so that its first entry to thread mode unstacks exactly
/// like a return to a preempted task.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct UserFrame {
    r0: usize,
    r1: usize,
    r2: usize,
    r3: usize,
    r12: usize,
    lr: usize,
    pc: usize,
    xpsr: usize,
}

/// Writes the initial exception frame below `sp_base` and returns the
/// task's starting user stack pointer.
fn fabricate_user_frame(sp_base: usize, entry: usize) -> usize {
    let sp = sp_base - core::mem::size_of::<UserFrame>();
    let frame = UserFrame {
        r0: 0,
        r1: 0,
        r2: 0,
        r3: 0,
        r12: 0,
        lr: 0,
        pc: entry,
        xpsr: crate::arch::INITIAL_PSR,
    };
    // Safety: the frame lies within the user stack block the caller just
    // allocated, which nothing else references yet.
    unsafe { mpool::write_in_pool(sp, frame) };
    sp
}

/// Writes the initial switch frame at the top of `stack` and returns the
/// task's starting kernel stack pointer.
fn fabricate_kernel_frame(
    stack: &mut [usize; KERN_STACK_WORDS],
    user_sp: usize,
    privileged: bool,
) -> usize {
    let frame = KERN_STACK_WORDS - SWITCH_FRAME_WORDS;
    stack[frame] = crate::arch::initial_control(privileged);
    stack[frame + 1] = user_sp;
    for word in &mut stack[frame + 2..KERN_STACK_WORDS - 1] {
        *word = 0;
    }
    stack[KERN_STACK_WORDS - 1] = crate::arch::svc_return_addr();
    &stack[frame] as *const usize as usize
}

/// Rounds a requested user stack size up to the power of two the allocator
/// will grant, floored at the minimum user stack.
fn round_stack_size(requested: usize) -> usize {
    requested.max(PROC_STACK_SIZE).next_power_of_two()
}

/// Lowest-numbered slot available for a new task. Slot 0 belongs to the
/// null task and is never handed out.
fn find_free_slot(tasks: &[Task; MAX_TASKS]) -> Option<usize> {
    (1..MAX_TASKS).find(|&i| tasks[i].state.is_available())
}

/// Installs a task into `slot`: allocates its user stack from pool #2,
/// fabricates both initial frames, and fills in the TCB. Does not change
/// the slot's state or touch any queue; the caller finishes the job. On
/// failure nothing remains allocated.
pub(crate) fn initialize_slot(
    k: &mut Kernel,
    slot: usize,
    init: &TaskInit,
) -> Result<(), Error> {
    let size = round_stack_size(init.stack_size);
    let stack = k.pools.alloc(PoolId::Kernel, size)?;
    let sp_base = stack + size;

    let user_sp = fabricate_user_frame(sp_base, init.entry);
    let tid = Tid(slot as u8);
    let kernel_sp = fabricate_kernel_frame(
        k.kstacks.stack_mut(tid),
        user_sp,
        init.flags.contains(TaskFlags::PRIVILEGED),
    );

    let t = &mut k.tasks[slot];
    t.prio = init.prio;
    t.flags = init.flags;
    t.entry = init.entry;
    t.user_sp = user_sp;
    t.user_sp_base = sp_base;
    t.user_stack_size = size;
    t.kernel_sp = kernel_sp;
    // A reused slot must not inherit the previous occupant's error
    // indicator.
    t.errno = None;
    Ok(())
}

/// Returns `slot`'s user stack to pool #2 and clears the stack fields.
fn release_user_stack(k: &mut Kernel, slot: usize) {
    let t = &mut k.tasks[slot];
    let block = t.user_sp_base - t.user_stack_size;
    t.user_sp = 0;
    t.user_sp_base = 0;
    t.user_stack_size = 0;
    if k.pools.dealloc(PoolId::Kernel, block).is_err() {
        fail::die("task stack not from pool #2");
    }
}

/// Creates a task and returns its id.
///
/// Validates everything before changing anything: a null entry or a
/// priority outside P0..P3 is `InvalidArg`; a full table is `TryAgain`.
/// The new task goes to the back of its priority's queue. If it outranks
/// the caller, the caller is re-inserted at the *front* of its own queue
/// (it keeps precedence over its peers) and the processor is handed over
/// before this returns.
pub fn create(k: &mut Kernel, init: &TaskInit) -> Result<Tid, Error> {
    if init.entry == 0 || !init.prio.is_user() {
        return Err(Error::InvalidArg);
    }
    if k.active >= MAX_TASKS {
        return Err(Error::TryAgain);
    }
    let slot = match find_free_slot(&k.tasks) {
        Some(s) => s,
        None => return Err(Error::TryAgain),
    };
    initialize_slot(k, slot, init)?;
    let tid = Tid(slot as u8);

    // Queue first, then mark ready: a failed enqueue must leave the slot
    // exactly as it was found, minus the stack we give back here.
    if let Err(e) =
        k.queues
            .push_back(k.pools.expect_mut(PoolId::Kernel), init.prio.level(), tid)
    {
        release_user_stack(k, slot);
        return Err(e);
    }
    k.tasks[slot].set_state(TaskState::Ready);
    k.active += 1;

    let caller = k.current;
    let caller_prio = k.tasks[caller.index()].prio;
    if init.prio.is_more_important_than(caller_prio) {
        match k.queues.push_front(
            k.pools.expect_mut(PoolId::Kernel),
            caller_prio.level(),
            caller,
        ) {
            Ok(()) => sched::run_new(k),
            Err(_) => {
                // Out of queue nodes. Skip the handover rather than strand
                // the caller outside every queue; the newcomer runs at the
                // next scheduling point.
                klog!("tsk_create: preemption deferred, no queue node");
            }
        }
    }
    Ok(tid)
}

/// Terminates the calling task: its user stack goes back to pool #2, the
/// slot turns dormant (and reusable), and the scheduler picks a successor.
/// The null task may not exit.
pub fn exit_current(k: &mut Kernel) -> Result<(), Error> {
    let cur = k.current;
    if cur == Tid::NULL {
        return Err(Error::NotPermitted);
    }
    k.tasks[cur.index()].set_state(TaskState::Dormant);
    release_user_stack(k, cur.index());
    k.active -= 1;
    sched::run_new(k);
    Ok(())
}

/// Snapshot of a task for TSK_GET. For the calling task the stack pointers
/// are read live off the CPU; for anyone else, from the TCB.
pub fn info(k: &Kernel, tid: Tid) -> Result<TaskInfo, Error> {
    if !tid.is_valid() {
        return Err(Error::InvalidArg);
    }
    let t = &k.tasks[tid.index()];
    if t.state == TaskState::Uninitialized {
        return Err(Error::InvalidArg);
    }
    let (u_sp, k_sp) = if tid == k.current {
        (crate::arch::read_psp(), crate::arch::read_msp())
    } else {
        (t.user_sp, t.kernel_sp)
    };
    Ok(TaskInfo {
        tid,
        prio: t.prio,
        state: t.state,
        privileged: t.flags.contains(TaskFlags::PRIVILEGED),
        entry: t.entry,
        u_sp,
        u_sp_base: t.user_sp_base,
        u_stack_size: t.user_stack_size,
        k_sp,
        k_sp_base: k.kstacks.top_of(tid),
        k_stack_size: KERN_STACK_SIZE,
    })
}
