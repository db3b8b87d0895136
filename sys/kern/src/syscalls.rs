// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Supervisor-request dispatch.
//!
//! A single entry point decodes the request number and forwards to the
//! right kernel operation. Argument words arrive exactly as the caller
//! left them in r0-r3; each recognized operation names and validates its
//! own tuple before anything mutates. Failures set the caller's error
//! indicator and surface as an error status -- with the one traditional
//! exception of MEM_ALLOC, which surfaces them as a null address.
//!
//! Memory operations at this boundary implicitly target pool #1; pool #2
//! is the kernel's own.

use skiff_abi::{
    Error, Priority, SvcNum, SysInfo, TaskFlags, TaskInit, Tid, STATUS_ERR, STATUS_OK,
};

use crate::mpool::PoolId;
use crate::sched;
use crate::startup::Kernel;
use crate::task;

/// Supervisor-call argument words, i.e. the first four registers of the
/// caller's stacked exception frame.
#[derive(Copy, Clone, Debug, Default)]
pub struct SvcArgs {
    pub r0: usize,
    pub r1: usize,
    pub r2: usize,
    pub r3: usize,
}

/// Decodes and executes one supervisor request, returning the value to
/// store into the caller's stacked r0.
///
/// # Safety
///
/// Some requests carry pointers (RTX_INIT's records, TSK_CREATE's result
/// slot, TSK_GET's info buffer). Beyond null checks they are taken on
/// faith, exactly as the original interface does on a part without memory
/// protection; the caller of this function vouches that the argument
/// words really came from the requesting task's frame.
pub unsafe fn dispatch(k: &mut Kernel, nr: u32, args: &SvcArgs) -> usize {
    let num = match SvcNum::try_from(nr) {
        Ok(n) => n,
        Err(()) => {
            k.tasks[k.current.index()].set_errno(Error::InvalidArg);
            return STATUS_ERR;
        }
    };

    let result: Result<usize, Error> = match num {
        // Safety: forwarded; pointer arguments per this function's
        // contract.
        SvcNum::RtxInit => unsafe { rtx_init(k, args) },
        SvcNum::MemAlloc => {
            // A zero-byte request yields the null address and leaves the
            // error indicator untouched.
            if args.r0 == 0 {
                return 0;
            }
            match k.pools.alloc(PoolId::User, args.r0) {
                Ok(addr) => Ok(addr),
                Err(e) => {
                    // Allocation failures surface as NULL, not as a
                    // status.
                    k.tasks[k.current.index()].set_errno(e);
                    return 0;
                }
            }
        }
        SvcNum::MemDealloc => k.pools.dealloc(PoolId::User, args.r0).map(|()| STATUS_OK),
        SvcNum::MemDump => k.pools.dump(PoolId::User),
        // Safety: forwarded.
        SvcNum::TskCreate => unsafe { tsk_create(k, args) },
        SvcNum::TskExit => task::exit_current(k).map(|()| STATUS_OK),
        SvcNum::TskYield => sched::yield_now(k).map(|()| STATUS_OK),
        SvcNum::TskSetPrio => {
            sched::set_priority(k, Tid(args.r0 as u8), Priority(args.r1 as u8))
                .map(|()| STATUS_OK)
        }
        // Safety: forwarded.
        SvcNum::TskGet => unsafe { tsk_get(k, args) },
        SvcNum::TskGetTid => Ok(k.current.index()),
    };

    match result {
        Ok(v) => v,
        Err(e) => {
            k.tasks[k.current.index()].set_errno(e);
            STATUS_ERR
        }
    }
}

/// RTX_INIT: `(sys_info*, task_init[], count)`.
///
/// # Safety
///
/// See [`dispatch`].
unsafe fn rtx_init(k: &mut Kernel, args: &SvcArgs) -> Result<usize, Error> {
    if args.r0 == 0 || (args.r2 != 0 && args.r1 == 0) {
        return Err(Error::BadAddress);
    }
    // Safety: null-checked above; contents are the boot code's word.
    let (sys, boot) = unsafe {
        let sys = &*(args.r0 as *const SysInfo);
        let boot = if args.r2 == 0 {
            &[][..]
        } else {
            core::slice::from_raw_parts(args.r1 as *const TaskInit, args.r2)
        };
        (sys, boot)
    };
    // Safety: RTX_INIT is the boot call; the managed regions are unused
    // until the pools claim them here.
    unsafe { k.init(sys, boot)? };
    Ok(STATUS_OK)
}

/// TSK_CREATE: `(out_tid*, entry_fn, prio, stack_size)`.
///
/// # Safety
///
/// See [`dispatch`].
unsafe fn tsk_create(k: &mut Kernel, args: &SvcArgs) -> Result<usize, Error> {
    if args.r0 == 0 {
        return Err(Error::BadAddress);
    }
    let init = TaskInit {
        entry: args.r1,
        prio: Priority(args.r2 as u8),
        flags: TaskFlags::empty(),
        stack_size: args.r3,
    };
    let tid = task::create(k, &init)?;
    // Safety: null-checked above.
    unsafe { core::ptr::write(args.r0 as *mut Tid, tid) };
    Ok(STATUS_OK)
}

/// TSK_GET: `(tid, info*)`.
///
/// # Safety
///
/// See [`dispatch`].
unsafe fn tsk_get(k: &mut Kernel, args: &SvcArgs) -> Result<usize, Error> {
    if args.r1 == 0 {
        return Err(Error::BadAddress);
    }
    let info = task::info(k, Tid(args.r0 as u8))?;
    // Safety: null-checked above.
    unsafe { core::ptr::write(args.r1 as *mut skiff_abi::TaskInfo, info) };
    Ok(STATUS_OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch;
    use crate::startup::testing::{boot, task_init, ENTRY};
    use skiff_abi::{TaskInfo, TaskState, POOL_SIZE, PROC_STACK_SIZE};

    fn svc(k: &mut Kernel, nr: u32, args: SvcArgs) -> usize {
        // Safety: any pointers in `args` come from live locals owned by
        // the test.
        unsafe { dispatch(k, nr, &args) }
    }

    fn errno(k: &Kernel) -> Option<Error> {
        k.task(k.current_tid()).errno()
    }

    #[test]
    fn unknown_opcode_is_invalid() {
        let mut t = boot(&[task_init(Priority::P1, 0)]);
        let k = &mut t.k;
        assert_eq!(svc(k, 99, SvcArgs::default()), STATUS_ERR);
        assert_eq!(errno(k), Some(Error::InvalidArg));
    }

    #[test]
    fn mem_opcodes_target_pool_one() {
        let mut t = boot(&[task_init(Priority::P1, 0)]);
        let k = &mut t.k;

        let addr = svc(k, 2, SvcArgs { r0: 100, ..Default::default() });
        assert_ne!(addr, 0);
        // Pool #1 backs the allocation; nothing in pool #2 moved, which we
        // can see from the user-facing dump only counting pool #1 blocks.
        let count = svc(k, 4, SvcArgs::default());
        assert!(count >= 1);

        assert_eq!(svc(k, 3, SvcArgs { r0: addr, ..Default::default() }), STATUS_OK);
        // Full pool back in one piece.
        assert_eq!(svc(k, 4, SvcArgs::default()), 1);
    }

    #[test]
    fn zero_byte_alloc_is_silent_null() {
        let mut t = boot(&[task_init(Priority::P1, 0)]);
        let k = &mut t.k;
        assert_eq!(svc(k, 2, SvcArgs::default()), 0);
        assert_eq!(errno(k), None);
        // An impossible request, by contrast, reports NO_MEMORY.
        assert_eq!(
            svc(k, 2, SvcArgs { r0: POOL_SIZE + 1, ..Default::default() }),
            0
        );
        assert_eq!(errno(k), Some(Error::NoMemory));
    }

    #[test]
    fn dealloc_null_is_ok_and_foreign_pointers_fault() {
        let mut t = boot(&[task_init(Priority::P1, 0)]);
        let k = &mut t.k;
        assert_eq!(svc(k, 3, SvcArgs::default()), STATUS_OK);
        assert_eq!(errno(k), None);

        let outside = 0x4000_0000;
        assert_eq!(
            svc(k, 3, SvcArgs { r0: outside, ..Default::default() }),
            STATUS_ERR
        );
        assert_eq!(errno(k), Some(Error::BadAddress));
    }

    #[test]
    fn equal_priority_tasks_round_robin_on_yield() {
        let mut t = boot(&[task_init(Priority::P1, 0), task_init(Priority::P1, 0)]);
        let k = &mut t.k;
        assert_eq!(k.current_tid(), Tid(1));

        // A yields: B runs, A waits at the back of P1.
        assert_eq!(svc(k, 7, SvcArgs::default()), STATUS_OK);
        assert_eq!(k.current_tid(), Tid(2));
        assert_eq!(k.task(Tid(1)).state(), TaskState::Ready);
        assert_eq!(k.task(Tid(2)).state(), TaskState::Running);

        // B yields: back to A.
        assert_eq!(svc(k, 7, SvcArgs::default()), STATUS_OK);
        assert_eq!(k.current_tid(), Tid(1));
        assert_eq!(k.task(Tid(2)).state(), TaskState::Ready);
    }

    #[test]
    fn yield_without_peers_is_a_no_op() {
        let mut t = boot(&[task_init(Priority::P0, 0)]);
        let k = &mut t.k;
        let before = arch::context_switches();
        assert_eq!(svc(k, 7, SvcArgs::default()), STATUS_OK);
        assert_eq!(k.current_tid(), Tid(1));
        assert_eq!(arch::context_switches(), before);
    }

    #[test]
    fn create_of_higher_priority_task_preempts_caller() {
        let mut t = boot(&[task_init(Priority::P2, 0)]);
        let k = &mut t.k;
        assert_eq!(k.current_tid(), Tid(1));

        let mut out = Tid::NULL;
        let status = svc(
            k,
            5,
            SvcArgs {
                r0: &mut out as *mut Tid as usize,
                r1: ENTRY,
                r2: Priority::P1.0 as usize,
                r3: PROC_STACK_SIZE,
            },
        );
        assert_eq!(status, STATUS_OK);
        assert_eq!(out, Tid(2));

        // The newcomer runs; the caller was re-queued at the front of its
        // own class. GETTID reports the new task.
        assert_eq!(k.current_tid(), Tid(2));
        assert_eq!(k.task(Tid(1)).state(), TaskState::Ready);
        assert_eq!(k.queues.snapshot(Priority::P2.level()), vec![Tid(1)]);
        assert_eq!(svc(k, 10, SvcArgs::default()), 2);
    }

    #[test]
    fn create_of_lower_priority_task_does_not_preempt() {
        let mut t = boot(&[task_init(Priority::P1, 0)]);
        let k = &mut t.k;
        let mut out = Tid::NULL;
        let status = svc(
            k,
            5,
            SvcArgs {
                r0: &mut out as *mut Tid as usize,
                r1: ENTRY,
                r2: Priority::P3.0 as usize,
                r3: 0,
            },
        );
        assert_eq!(status, STATUS_OK);
        assert_eq!(k.current_tid(), Tid(1));
        assert_eq!(k.task(out).state(), TaskState::Ready);
    }

    #[test]
    fn create_validates_before_touching_anything() {
        let mut t = boot(&[task_init(Priority::P1, 0)]);
        let k = &mut t.k;
        let mut out = Tid::NULL;

        // Null entry.
        let status = svc(
            k,
            5,
            SvcArgs { r0: &mut out as *mut Tid as usize, r1: 0, r2: 1, r3: 0 },
        );
        assert_eq!(status, STATUS_ERR);
        assert_eq!(errno(k), Some(Error::InvalidArg));

        // Reserved priority.
        let status = svc(
            k,
            5,
            SvcArgs {
                r0: &mut out as *mut Tid as usize,
                r1: ENTRY,
                r2: Priority::NULL.0 as usize,
                r3: 0,
            },
        );
        assert_eq!(status, STATUS_ERR);
        assert_eq!(errno(k), Some(Error::InvalidArg));

        // Null result pointer.
        let status = svc(k, 5, SvcArgs { r0: 0, r1: ENTRY, r2: 1, r3: 0 });
        assert_eq!(status, STATUS_ERR);
        assert_eq!(errno(k), Some(Error::BadAddress));

        assert_eq!(k.active_tasks(), 2);
    }

    #[test]
    fn task_table_fills_to_capacity_then_try_again() {
        let mut t = boot(&[task_init(Priority::P0, 0)]);
        let k = &mut t.k;

        // Slots 2..16: fourteen more creates at a priority below the
        // caller's, so nothing preempts.
        let mut out = Tid::NULL;
        for _ in 0..14 {
            let status = svc(
                k,
                5,
                SvcArgs {
                    r0: &mut out as *mut Tid as usize,
                    r1: ENTRY,
                    r2: Priority::P2.0 as usize,
                    r3: 0,
                },
            );
            assert_eq!(status, STATUS_OK);
        }
        assert_eq!(k.active_tasks(), 16);

        let status = svc(
            k,
            5,
            SvcArgs {
                r0: &mut out as *mut Tid as usize,
                r1: ENTRY,
                r2: Priority::P2.0 as usize,
                r3: 0,
            },
        );
        assert_eq!(status, STATUS_ERR);
        assert_eq!(errno(k), Some(Error::TryAgain));
    }

    #[test]
    fn raising_a_ready_task_above_the_caller_transfers_control() {
        let mut t = boot(&[task_init(Priority::P2, 0), task_init(Priority::P3, 0)]);
        let k = &mut t.k;
        assert_eq!(k.current_tid(), Tid(1));

        // Promote the P3 task to P0: it outranks the caller and takes the
        // CPU; the caller keeps precedence in its own class.
        let status = svc(
            k,
            8,
            SvcArgs { r0: 2, r1: Priority::P0.0 as usize, ..Default::default() },
        );
        assert_eq!(status, STATUS_OK);
        assert_eq!(k.current_tid(), Tid(2));
        assert_eq!(k.task(Tid(2)).priority(), Priority::P0);
        assert_eq!(k.task(Tid(1)).state(), TaskState::Ready);
        assert_eq!(k.queues.snapshot(Priority::P2.level()), vec![Tid(1)]);
    }

    #[test]
    fn lowering_a_ready_task_changes_no_scheduling() {
        let mut t = boot(&[task_init(Priority::P1, 0), task_init(Priority::P2, 0)]);
        let k = &mut t.k;
        let status = svc(
            k,
            8,
            SvcArgs { r0: 2, r1: Priority::P3.0 as usize, ..Default::default() },
        );
        assert_eq!(status, STATUS_OK);
        assert_eq!(k.current_tid(), Tid(1));
        assert_eq!(k.task(Tid(2)).priority(), Priority::P3);
        assert_eq!(k.queues.snapshot(Priority::P3.level()), vec![Tid(2)]);
    }

    #[test]
    fn self_demotion_below_a_ready_task_switches() {
        let mut t = boot(&[task_init(Priority::P1, 0), task_init(Priority::P2, 0)]);
        let k = &mut t.k;
        // The caller demotes itself below the ready P2 task.
        let status = svc(
            k,
            8,
            SvcArgs { r0: 1, r1: Priority::P3.0 as usize, ..Default::default() },
        );
        assert_eq!(status, STATUS_OK);
        assert_eq!(k.current_tid(), Tid(2));
        assert_eq!(k.task(Tid(1)).state(), TaskState::Ready);
        assert_eq!(k.task(Tid(1)).priority(), Priority::P3);
        assert_eq!(k.queues.snapshot(Priority::P3.level()), vec![Tid(1)]);
    }

    #[test]
    fn self_priority_change_in_place_when_still_on_top() {
        let mut t = boot(&[task_init(Priority::P2, 0), task_init(Priority::P3, 0)]);
        let k = &mut t.k;
        let before = arch::context_switches();
        let status = svc(
            k,
            8,
            SvcArgs { r0: 1, r1: Priority::P0.0 as usize, ..Default::default() },
        );
        assert_eq!(status, STATUS_OK);
        assert_eq!(k.current_tid(), Tid(1));
        assert_eq!(k.task(Tid(1)).priority(), Priority::P0);
        assert_eq!(arch::context_switches(), before);
    }

    #[test]
    fn set_priority_permission_rules() {
        let mut t = boot(&[task_init(Priority::P1, 0), task_init(Priority::P2, 0)]);
        let k = &mut t.k;

        // The null task and the idle priority are untouchable.
        assert_eq!(svc(k, 8, SvcArgs { r0: 0, r1: 1, ..Default::default() }), STATUS_ERR);
        assert_eq!(errno(k), Some(Error::NotPermitted));
        assert_eq!(
            svc(k, 8, SvcArgs { r0: 2, r1: Priority::NULL.0 as usize, ..Default::default() }),
            STATUS_ERR
        );

        // Out-of-range ids and priorities are rejected the same way.
        assert_eq!(svc(k, 8, SvcArgs { r0: 40, r1: 1, ..Default::default() }), STATUS_ERR);
        assert_eq!(svc(k, 8, SvcArgs { r0: 2, r1: 9, ..Default::default() }), STATUS_ERR);

        // A slot that is neither running nor ready cannot be retargeted.
        assert_eq!(svc(k, 8, SvcArgs { r0: 5, r1: 1, ..Default::default() }), STATUS_ERR);
        assert_eq!(errno(k), Some(Error::NotPermitted));
    }

    #[test]
    fn exit_returns_stack_to_pool_two_and_reuses_it() {
        let mut t = boot(&[
            task_init(Priority::P1, 4096),
            task_init(Priority::P2, 0),
        ]);
        let k = &mut t.k;
        assert_eq!(k.current_tid(), Tid(1));

        let mut info = TaskInfo::default();
        assert_eq!(
            svc(k, 9, SvcArgs { r0: 1, r1: &mut info as *mut TaskInfo as usize, ..Default::default() }),
            STATUS_OK
        );
        assert_eq!(info.u_stack_size, 4096);
        let old_base = info.u_sp_base;

        // Task 1 exits; the P2 task takes over and the slot goes dormant.
        svc(k, 6, SvcArgs::default());
        assert_eq!(k.current_tid(), Tid(2));
        assert_eq!(k.task(Tid(1)).state(), TaskState::Dormant);
        assert_eq!(k.task(Tid(1)).user_sp(), 0);
        assert_eq!(k.active_tasks(), 2);

        // A new task with the same stack appetite gets the same block
        // back, and reuses the dormant slot.
        let mut out = Tid::NULL;
        let status = svc(
            k,
            5,
            SvcArgs {
                r0: &mut out as *mut Tid as usize,
                r1: ENTRY,
                r2: Priority::P3.0 as usize,
                r3: 4096,
            },
        );
        assert_eq!(status, STATUS_OK);
        assert_eq!(out, Tid(1));

        assert_eq!(
            svc(k, 9, SvcArgs { r0: 1, r1: &mut info as *mut TaskInfo as usize, ..Default::default() }),
            STATUS_OK
        );
        assert_eq!(info.u_sp_base, old_base);
        assert_eq!(info.u_stack_size, 4096);
    }

    #[test]
    fn null_task_may_not_exit() {
        let mut t = boot(&[]);
        let k = &mut t.k;
        assert_eq!(k.current_tid(), Tid::NULL);
        assert_eq!(svc(k, 6, SvcArgs::default()), STATUS_ERR);
        assert_eq!(errno(k), Some(Error::NotPermitted));
        assert_eq!(k.task(Tid::NULL).state(), TaskState::Running);
    }

    #[test]
    fn last_user_task_exit_falls_back_to_the_null_task() {
        let mut t = boot(&[task_init(Priority::P1, 0)]);
        let k = &mut t.k;
        svc(k, 6, SvcArgs::default());
        assert_eq!(k.current_tid(), Tid::NULL);
        assert_eq!(k.task(Tid::NULL).state(), TaskState::Running);
        assert_eq!(k.active_tasks(), 1);
    }

    #[test]
    fn tsk_get_reads_live_registers_for_the_caller() {
        let mut t = boot(&[task_init(Priority::P1, 0), task_init(Priority::P1, 0)]);
        let k = &mut t.k;

        let mut info = TaskInfo::default();
        let p = &mut info as *mut TaskInfo as usize;

        arch::set_psp(0xBEE0);
        assert_eq!(svc(k, 9, SvcArgs { r0: 1, r1: p, ..Default::default() }), STATUS_OK);
        assert_eq!(info.tid, Tid(1));
        assert_eq!(info.state, TaskState::Running);
        assert_eq!(info.u_sp, 0xBEE0);
        assert_eq!(info.k_stack_size, skiff_abi::KERN_STACK_SIZE);

        // For anyone else, the snapshot comes from the TCB.
        assert_eq!(svc(k, 9, SvcArgs { r0: 2, r1: p, ..Default::default() }), STATUS_OK);
        assert_eq!(info.tid, Tid(2));
        assert_eq!(info.state, TaskState::Ready);
        assert_eq!(info.u_sp, k.task(Tid(2)).user_sp());
        assert_ne!(info.u_sp, 0);

        // Uninitialized slots and wild ids are invalid; a null buffer is
        // a bad address.
        assert_eq!(svc(k, 9, SvcArgs { r0: 9, r1: p, ..Default::default() }), STATUS_ERR);
        assert_eq!(errno(k), Some(Error::InvalidArg));
        assert_eq!(svc(k, 9, SvcArgs { r0: 40, r1: p, ..Default::default() }), STATUS_ERR);
        assert_eq!(svc(k, 9, SvcArgs { r0: 1, r1: 0, ..Default::default() }), STATUS_ERR);
        assert_eq!(errno(k), Some(Error::BadAddress));
    }

    #[test]
    fn rtx_init_boots_through_the_dispatcher() {
        use crate::mpool::testing::Arena;
        use crate::mpool::MemLayout;
        use crate::startup::Kernel as K;

        let pool1 = Arena::new();
        let pool2 = Arena::new();
        let mut k = Box::new(K::new(MemLayout {
            pool1_base: pool1.base(),
            pool2_base: pool2.base(),
        }));

        let sys = SysInfo { mem_algo: 0 };
        let boot_tasks = [task_init(Priority::P1, 0)];
        let status = svc(
            &mut k,
            1,
            SvcArgs {
                r0: &sys as *const SysInfo as usize,
                r1: boot_tasks.as_ptr() as usize,
                r2: boot_tasks.len(),
                r3: 0,
            },
        );
        assert_eq!(status, STATUS_OK);
        assert_eq!(k.current_tid(), Tid(1));
        assert_eq!(k.active_tasks(), 2);

        // A bad algorithm selector never gets as far as the pools.
        let mut k2 = Box::new(K::new(MemLayout {
            pool1_base: pool1.base(),
            pool2_base: pool2.base(),
        }));
        let bad = SysInfo { mem_algo: 3 };
        let status = svc(
            &mut k2,
            1,
            SvcArgs { r0: &bad as *const SysInfo as usize, r1: 0, r2: 0, r3: 0 },
        );
        assert_eq!(status, STATUS_ERR);
    }

    #[test]
    fn ready_queue_membership_matches_task_state() {
        // Global invariant sweep after a pile of operations: every queued
        // tid is READY at the right level, the running task is queued
        // nowhere, and READY tasks are queued exactly once.
        let mut t = boot(&[
            task_init(Priority::P1, 0),
            task_init(Priority::P1, 0),
            task_init(Priority::P3, 0),
        ]);
        let k = &mut t.k;

        svc(k, 7, SvcArgs::default());
        svc(k, 8, SvcArgs { r0: 3, r1: Priority::P2.0 as usize, ..Default::default() });
        svc(k, 7, SvcArgs::default());

        let mut queued: Vec<Tid> = Vec::new();
        for level in 0..skiff_abi::NUM_PRIORITIES {
            for tid in k.queues.snapshot(level) {
                assert_eq!(k.task(tid).state(), TaskState::Ready, "tid {tid:?}");
                assert_eq!(k.task(tid).priority().level(), level, "tid {tid:?}");
                queued.push(tid);
            }
        }
        queued.sort_by_key(|t| t.index());
        let mut expect: Vec<Tid> = Vec::new();
        for i in 0..skiff_abi::MAX_TASKS {
            let tid = Tid(i as u8);
            if k.task(tid).state() == TaskState::Ready {
                expect.push(tid);
            }
        }
        assert_eq!(queued, expect);
        assert!(!queued.contains(&k.current_tid()));
        assert_eq!(k.task(k.current_tid()).state(), TaskState::Running);
    }
}
