// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ready queues and the scheduler.
//!
//! One FIFO per priority level. Queues carry task *ids* only -- the TCB
//! table stays the sole owner of task records -- and their nodes live in
//! pool #2, acquired on enqueue and released on dequeue, so the set of
//! live nodes always equals the set of READY tasks.
//!
//! Scheduling is strict priority with round-robin inside a level: the
//! scheduler pops the head of the most important non-empty queue, and a
//! task that yields goes to the back of its own line. The one wrinkle is
//! `push_front`, used when the running task is preempted through no fault
//! of its own (a higher-priority create, a promotion of someone else): it
//! keeps its precedence over peers by re-entering at the head.

use skiff_abi::{Error, Priority, TaskState, Tid, NUM_PRIORITIES};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::fail;
use crate::mpool::{self, MemPool, PoolId};
use crate::startup::Kernel;
use crate::task::Task;

/// Ready-queue node, allocated from pool #2.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct QueueNode {
    /// Address of the next node, or null.
    next: usize,
    /// The task this node refers to, widened to keep the record padding
    /// free.
    tid: usize,
}

#[derive(Copy, Clone)]
struct ReadyQueue {
    /// Address of the first node, or null when empty.
    head: usize,
    /// Address of the last node; meaningless when empty.
    tail: usize,
    len: usize,
}

const EMPTY: ReadyQueue = ReadyQueue {
    head: 0,
    tail: 0,
    len: 0,
};

/// The per-priority FIFO set.
pub struct ReadyQueueSet {
    queues: [ReadyQueue; NUM_PRIORITIES],
}

impl ReadyQueueSet {
    pub(crate) const fn new() -> Self {
        Self {
            queues: [EMPTY; NUM_PRIORITIES],
        }
    }

    pub fn is_empty(&self, level: usize) -> bool {
        self.queues[level].len == 0
    }

    pub fn len(&self, level: usize) -> usize {
        self.queues[level].len
    }

    /// Most important level with anyone waiting.
    pub fn highest_ready(&self) -> Option<usize> {
        (0..NUM_PRIORITIES).find(|&l| self.queues[l].len != 0)
    }

    fn new_node(pool: &mut MemPool, tid: Tid) -> Result<usize, Error> {
        let addr = pool.alloc(core::mem::size_of::<QueueNode>())?;
        // Safety: node storage freshly allocated above, owned by us.
        unsafe {
            mpool::write_in_pool(
                addr,
                QueueNode {
                    next: 0,
                    tid: tid.index(),
                },
            );
        }
        Ok(addr)
    }

    fn read_node(&self, addr: usize) -> QueueNode {
        // Safety: `addr` was returned by new_node and is still linked into
        // one of our queues, so the storage is live and holds a node.
        unsafe { mpool::read_in_pool(addr) }
    }

    fn write_node(&mut self, addr: usize, node: QueueNode) {
        // Safety: as in read_node.
        unsafe { mpool::write_in_pool(addr, node) }
    }

    /// Appends `tid` at the back of `level`'s queue.
    pub fn push_back(&mut self, pool: &mut MemPool, level: usize, tid: Tid) -> Result<(), Error> {
        let node = Self::new_node(pool, tid)?;
        let q = self.queues[level];
        if q.len == 0 {
            self.queues[level].head = node;
        } else {
            let mut tail = self.read_node(q.tail);
            tail.next = node;
            self.write_node(q.tail, tail);
        }
        self.queues[level].tail = node;
        self.queues[level].len += 1;
        Ok(())
    }

    /// Inserts `tid` at the front of `level`'s queue, ahead of its peers.
    pub fn push_front(&mut self, pool: &mut MemPool, level: usize, tid: Tid) -> Result<(), Error> {
        let node = Self::new_node(pool, tid)?;
        let q = self.queues[level];
        if q.len == 0 {
            self.queues[level].tail = node;
        } else {
            let mut n = self.read_node(node);
            n.next = q.head;
            self.write_node(node, n);
        }
        self.queues[level].head = node;
        self.queues[level].len += 1;
        Ok(())
    }

    /// Removes and returns the task at the front of `level`'s queue.
    pub fn pop(&mut self, pool: &mut MemPool, level: usize) -> Option<Tid> {
        if self.queues[level].len == 0 {
            return None;
        }
        let addr = self.queues[level].head;
        let node = self.read_node(addr);
        self.queues[level].head = node.next;
        self.queues[level].len -= 1;
        if self.queues[level].len == 0 {
            self.queues[level] = EMPTY;
        }
        if pool.dealloc(addr).is_err() {
            fail::die("ready queue node not from pool #2");
        }
        Some(Tid(node.tid as u8))
    }

    /// Finds and deletes `tid` from `level`'s queue. Linear scan; used
    /// only by priority changes. Returns whether it was present.
    pub fn remove(&mut self, pool: &mut MemPool, level: usize, tid: Tid) -> bool {
        let mut prev = 0usize;
        let mut cur = if self.queues[level].len == 0 {
            0
        } else {
            self.queues[level].head
        };
        while cur != 0 {
            let node = self.read_node(cur);
            if node.tid == tid.index() {
                if prev == 0 {
                    self.queues[level].head = node.next;
                } else {
                    let mut p = self.read_node(prev);
                    p.next = node.next;
                    self.write_node(prev, p);
                }
                if self.queues[level].tail == cur {
                    self.queues[level].tail = prev;
                }
                self.queues[level].len -= 1;
                if self.queues[level].len == 0 {
                    self.queues[level] = EMPTY;
                }
                if pool.dealloc(cur).is_err() {
                    fail::die("ready queue node not from pool #2");
                }
                return true;
            }
            prev = cur;
            cur = node.next;
        }
        false
    }

    /// Test view of a queue's contents, front to back.
    #[cfg(test)]
    pub(crate) fn snapshot(&self, level: usize) -> Vec<Tid> {
        let mut out = Vec::new();
        let mut cur = if self.queues[level].len == 0 {
            0
        } else {
            self.queues[level].head
        };
        while cur != 0 {
            let node = self.read_node(cur);
            out.push(Tid(node.tid as u8));
            cur = node.next;
        }
        out
    }
}

/// Pure selection: pops the head of the most important non-empty queue.
/// When every queue is empty the null task is returned -- which can only
/// happen when the null task is the one running.
pub fn scheduler(k: &mut Kernel) -> Tid {
    for level in 0..NUM_PRIORITIES {
        if let Some(tid) = k.queues.pop(k.pools.expect_mut(PoolId::Kernel), level) {
            return tid;
        }
    }
    Tid::NULL
}

/// Transition driver: picks a successor and, if it differs from the
/// caller, performs the switch.
///
/// The outgoing task, unless dormant, is marked ready and has its user
/// stack pointer snapshotted off the CPU. Enqueueing the outgoing task is
/// the *caller's* job (yield pushes to the back, preemption paths push to
/// the front, exit doesn't push at all); this function only drives the
/// state transitions and the primitive.
pub fn run_new(k: &mut Kernel) {
    let old = k.current;
    let new = scheduler(k);
    if new == old {
        return;
    }
    k.tasks[new.index()].set_state(TaskState::Running);
    let old_t = &mut k.tasks[old.index()];
    if old_t.state() != TaskState::Dormant {
        old_t.set_state(TaskState::Ready);
        old_t.set_user_sp(crate::arch::read_psp());
    }
    k.current = new;

    let old_ptr: *mut Task = &mut k.tasks[old.index()];
    let new_ptr: *mut Task = &mut k.tasks[new.index()];
    // Safety: old and new are distinct table entries, and we are at a
    // supervisor-call boundary, which is the context the primitive
    // requires.
    unsafe { crate::arch::switch_context(old_ptr, new_ptr) };
}

/// Voluntary round-robin step: if a peer at the caller's priority is
/// waiting, the caller goes to the back of its own line and the peer gets
/// the CPU; otherwise this does nothing.
pub fn yield_now(k: &mut Kernel) -> Result<(), Error> {
    let cur = k.current;
    let level = k.tasks[cur.index()].priority().level();
    if k.queues.is_empty(level) {
        return Ok(());
    }
    k.queues
        .push_back(k.pools.expect_mut(PoolId::Kernel), level, cur)?;
    run_new(k);
    Ok(())
}

/// Changes `tid`'s priority.
///
/// Rejections are all `NotPermitted`: the null task, the idle priority,
/// ids or priorities outside their sets, an unprivileged caller touching a
/// privileged task, or a target that is neither running nor ready.
pub fn set_priority(k: &mut Kernel, tid: Tid, prio: Priority) -> Result<(), Error> {
    if tid == Tid::NULL || prio == Priority::NULL {
        return Err(Error::NotPermitted);
    }
    if !tid.is_valid() || !prio.is_user() {
        return Err(Error::NotPermitted);
    }
    let caller = k.current;
    if !k.tasks[caller.index()].privileged() && k.tasks[tid.index()].privileged() {
        return Err(Error::NotPermitted);
    }

    match k.tasks[tid.index()].state() {
        TaskState::Running => {
            // Only the caller itself can be running. If some ready task
            // now outranks the new priority this is a demotion, and the
            // caller goes to the back of its new class.
            let outranked = match k.queues.highest_ready() {
                Some(level) => level < prio.level(),
                None => false,
            };
            if outranked {
                k.queues
                    .push_back(k.pools.expect_mut(PoolId::Kernel), prio.level(), tid)?;
                k.tasks[tid.index()].set_priority(prio);
                run_new(k);
            } else {
                k.tasks[tid.index()].set_priority(prio);
            }
            Ok(())
        }
        TaskState::Ready => {
            let old_prio = k.tasks[tid.index()].priority();
            if old_prio == prio {
                return Ok(());
            }
            if !k
                .queues
                .remove(k.pools.expect_mut(PoolId::Kernel), old_prio.level(), tid)
            {
                fail::die("ready task missing from its queue");
            }
            k.tasks[tid.index()].set_priority(prio);
            // The node released by the removal above makes this enqueue
            // infallible in practice; failure means the pool is corrupt.
            if k
                .queues
                .push_back(k.pools.expect_mut(PoolId::Kernel), prio.level(), tid)
                .is_err()
            {
                fail::die("requeue after priority change failed");
            }
            let caller_prio = k.tasks[caller.index()].priority();
            if caller_prio.is_more_important_than(prio) {
                return Ok(());
            }
            match k.queues.push_front(
                k.pools.expect_mut(PoolId::Kernel),
                caller_prio.level(),
                caller,
            ) {
                Ok(()) => run_new(k),
                Err(_) => {
                    // Out of queue nodes: skip the handover rather than
                    // strand the caller; the change itself stands.
                    klog!("tsk_set_prio: handover deferred, no queue node");
                }
            }
            Ok(())
        }
        _ => Err(Error::NotPermitted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpool::testing::Arena;
    use crate::mpool::MemPool;

    fn pool(arena: &mut Arena) -> MemPool {
        // Safety: the arena is exclusively owned test memory.
        unsafe { MemPool::new(arena.0.as_ptr() as usize) }
    }

    #[test]
    fn fifo_order_within_a_level() {
        let mut arena = Arena::new();
        let mut pool = pool(&mut arena);
        let mut queues = ReadyQueueSet::new();

        for t in 1..=3u8 {
            queues.push_back(&mut pool, 2, Tid(t)).unwrap();
        }
        assert_eq!(queues.len(2), 3);
        assert_eq!(queues.snapshot(2), vec![Tid(1), Tid(2), Tid(3)]);

        assert_eq!(queues.pop(&mut pool, 2), Some(Tid(1)));
        assert_eq!(queues.pop(&mut pool, 2), Some(Tid(2)));
        assert_eq!(queues.pop(&mut pool, 2), Some(Tid(3)));
        assert_eq!(queues.pop(&mut pool, 2), None);

        // Every node went back to the pool.
        assert_eq!(pool.visit_free(|_, _| ()), 1);
    }

    #[test]
    fn push_front_takes_precedence() {
        let mut arena = Arena::new();
        let mut pool = pool(&mut arena);
        let mut queues = ReadyQueueSet::new();

        queues.push_back(&mut pool, 1, Tid(4)).unwrap();
        queues.push_front(&mut pool, 1, Tid(9)).unwrap();
        assert_eq!(queues.snapshot(1), vec![Tid(9), Tid(4)]);
        assert_eq!(queues.pop(&mut pool, 1), Some(Tid(9)));
    }

    #[test]
    fn levels_are_independent_and_ranked() {
        let mut arena = Arena::new();
        let mut pool = pool(&mut arena);
        let mut queues = ReadyQueueSet::new();

        assert_eq!(queues.highest_ready(), None);
        queues.push_back(&mut pool, 3, Tid(5)).unwrap();
        queues.push_back(&mut pool, 0, Tid(6)).unwrap();
        queues.push_back(&mut pool, 4, Tid(0)).unwrap();
        assert_eq!(queues.highest_ready(), Some(0));
        assert_eq!(queues.pop(&mut pool, 0), Some(Tid(6)));
        assert_eq!(queues.highest_ready(), Some(3));
    }

    #[test]
    fn remove_handles_head_middle_and_tail() {
        let mut arena = Arena::new();
        let mut pool = pool(&mut arena);
        let mut queues = ReadyQueueSet::new();

        for t in 1..=4u8 {
            queues.push_back(&mut pool, 0, Tid(t)).unwrap();
        }
        assert!(queues.remove(&mut pool, 0, Tid(3)));
        assert_eq!(queues.snapshot(0), vec![Tid(1), Tid(2), Tid(4)]);
        assert!(queues.remove(&mut pool, 0, Tid(1)));
        assert!(queues.remove(&mut pool, 0, Tid(4)));
        assert!(!queues.remove(&mut pool, 0, Tid(7)));

        // Tail is maintained across removals: pushes still append.
        queues.push_back(&mut pool, 0, Tid(8)).unwrap();
        assert_eq!(queues.snapshot(0), vec![Tid(2), Tid(8)]);

        assert!(queues.remove(&mut pool, 0, Tid(2)));
        assert!(queues.remove(&mut pool, 0, Tid(8)));
        assert_eq!(pool.visit_free(|_, _| ()), 1);
    }
}
