// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel state and bring-up.
//!
//! All mutable kernel state lives in one [`Kernel`] aggregate: the two
//! memory pools, the task table, the ready queues, the statically reserved
//! kernel stacks, and the running-task bookkeeping. On hardware a single
//! `Kernel` sits in a static provided by the board crate; it is handed to
//! [`start_kernel`] once initialized, after which the supervisor-call path
//! reaches it through [`with_kernel`]. Tests instead construct their own
//! `Kernel` values around arena-backed memory layouts and drive the same
//! entry points directly.

use core::sync::atomic::{AtomicPtr, Ordering};

use skiff_abi::{
    Error, Priority, SysInfo, TaskFlags, TaskInit, TaskState, Tid, MAX_TASKS, PROC_STACK_SIZE,
};

use crate::arch;
use crate::fail;
use crate::mpool::{MemLayout, PoolId, PoolSet};
use crate::sched::{self, ReadyQueueSet};
use crate::task::{self, KernelStacks, Task};

/// The executive's entire mutable state.
pub struct Kernel {
    /// The two buddy pools.
    pub(crate) pools: PoolSet,
    /// TCB table, indexed by task id.
    pub(crate) tasks: [Task; MAX_TASKS],
    /// Per-priority ready queues.
    pub(crate) queues: ReadyQueueSet,
    /// Statically reserved kernel stacks, one per slot.
    pub(crate) kstacks: KernelStacks,
    /// The task currently on the CPU.
    pub(crate) current: Tid,
    /// Number of non-dormant tasks, the null task included.
    pub(crate) active: usize,
}

impl Kernel {
    /// A kernel shaped around `layout`: no pools created yet, every task
    /// slot uninitialized. [`Kernel::init`] brings it to life.
    pub const fn new(layout: MemLayout) -> Self {
        Self {
            pools: PoolSet::new(layout),
            tasks: [Task::INIT; MAX_TASKS],
            queues: ReadyQueueSet::new(),
            kstacks: KernelStacks::new(),
            current: Tid::NULL,
            active: 0,
        }
    }

    /// Id of the task currently on the CPU.
    pub fn current_tid(&self) -> Tid {
        self.current
    }

    /// Read access to a task record.
    pub fn task(&self, tid: Tid) -> &Task {
        &self.tasks[tid.index()]
    }

    /// Number of non-dormant tasks, the null task included.
    pub fn active_tasks(&self) -> usize {
        self.active
    }

    /// RTX_INIT: allocator bring-up followed by boot task creation.
    ///
    /// Creates both pools with the algorithm `sys` selects, installs the
    /// null task (task 0: idle entry, idle priority, minimum stack), then
    /// creates each boot descriptor in order -- without handover checks,
    /// since nothing runs yet -- and finally puts the most important boot
    /// task (or the null task) on the CPU.
    ///
    /// # Safety
    ///
    /// Call once per boot, before anything uses the configured RAM
    /// regions; the pools take exclusive ownership of them.
    pub unsafe fn init(&mut self, sys: &SysInfo, boot: &[TaskInit]) -> Result<(), Error> {
        if boot.len() > MAX_TASKS - 1 {
            return Err(Error::InvalidArg);
        }
        // Safety: forwarded from our caller.
        unsafe { self.pools.init(sys.mem_algo)? };

        let null_init = TaskInit {
            entry: arch::idle_entry(),
            prio: Priority::NULL,
            flags: TaskFlags::PRIVILEGED,
            stack_size: PROC_STACK_SIZE,
        };
        task::initialize_slot(self, 0, &null_init)?;
        self.tasks[0].set_state(TaskState::Ready);
        self.queues.push_back(
            self.pools.expect_mut(PoolId::Kernel),
            Priority::NULL.level(),
            Tid::NULL,
        )?;
        self.active = 1;
        self.current = Tid::NULL;

        for (i, init) in boot.iter().enumerate() {
            if init.entry == 0 || !init.prio.is_user() {
                return Err(Error::InvalidArg);
            }
            let slot = i + 1;
            task::initialize_slot(self, slot, init)?;
            self.tasks[slot].set_state(TaskState::Ready);
            self.queues.push_back(
                self.pools.expect_mut(PoolId::Kernel),
                init.prio.level(),
                Tid(slot as u8),
            )?;
            self.active += 1;
        }

        let first = sched::scheduler(self);
        self.tasks[first.index()].set_state(TaskState::Running);
        self.current = first;
        Ok(())
    }
}

/// Where the supervisor-call path finds the kernel once it is running.
static KERNEL_PTR: AtomicPtr<Kernel> = AtomicPtr::new(core::ptr::null_mut());

/// Publishes the initialized kernel and launches its first task. Never
/// returns.
///
/// # Safety
///
/// Call exactly once per boot, after [`Kernel::init`] has succeeded.
pub unsafe fn start_kernel(kernel: &'static mut Kernel) -> ! {
    let first = kernel.current;
    let task: *mut Task = &mut kernel.tasks[first.index()];
    KERNEL_PTR.store(kernel, Ordering::Relaxed);
    klog!("skiff: starting task {}", first.index());
    // Safety: forwarded from our caller; `task` is the task `init` put on
    // the CPU.
    unsafe { arch::start_first_task(task) }
}

/// Runs `f` against the kernel installed by [`start_kernel`].
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> R) -> R {
    let p = KERNEL_PTR.load(Ordering::Relaxed);
    if p.is_null() {
        fail::die("supervisor call before start");
    }
    // Safety: installed from an exclusive static reference; single core
    // and supervisor-serialized execution mean no aliasing is possible.
    f(unsafe { &mut *p })
}
