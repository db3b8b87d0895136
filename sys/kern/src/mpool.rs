// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Binary-buddy memory pools.
//!
//! The executive manages two fixed-address RAM regions, each as an
//! independent buddy system: pool #1 serves user allocations arriving over
//! the supervisor-call interface, pool #2 backs kernel-internal allocations
//! (task stacks, ready-queue nodes). Both share one geometry: 32 KiB split
//! down to 32 B minimum blocks, eleven levels.
//!
//! Free-space bookkeeping is intrusive. A free block's first words hold a
//! doubly-linked list node (`FreeNode`) threading it onto the free list of
//! its level; the links are *offsets into the pool*, not pointers, so the
//! representation is identical on the 32-bit target and the 64-bit test
//! host. A separate occupancy bitmap, indexed by buddy-tree position (see
//! `skiff_treemath`), records which tree nodes are unavailable -- either
//! handed out, or split into smaller blocks. The coupling invariant: a
//! block is on exactly one free list with its bit clear, or it is
//! unavailable with its bit set, never both.

use skiff_abi::{Error, MemAlgo, MIN_BLOCK_LOG2, POOL_SIZE, POOL_SIZE_LOG2, RAM1_BASE, RAM2_BASE};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::fail;

/// Number of block-size levels: level 0 is the whole pool, the deepest
/// level holds minimum-size blocks.
pub const NUM_LEVELS: usize = (POOL_SIZE_LOG2 - MIN_BLOCK_LOG2 + 1) as usize;

const MIN_BLOCK: usize = 1 << MIN_BLOCK_LOG2;
const TREE_NODES: usize = skiff_treemath::node_count(NUM_LEVELS as u32);
const TREE_WORDS: usize = (TREE_NODES + 31) / 32;

/// Offset sentinel for "no node".
const NIL: u32 = u32::MAX;

/// Intrusive free-list node, stored in the free block's own storage. No
/// metadata is allocated anywhere else; the minimum block size comfortably
/// covers it.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct FreeNode {
    /// Offset of the previous node on this level's list, or `NIL`.
    prev: u32,
    /// Offset of the next node on this level's list, or `NIL`.
    next: u32,
    /// This block's buddy-tree position.
    treepos: u32,
}

/// Reads a `T` out of pool-owned memory.
///
/// The `FromBytes` bound carries the proof obligation that matters here:
/// pool memory holds arbitrary bytes (freed user data, old stack frames),
/// and only types for which every bit pattern is valid may be read back
/// out of it.
///
/// # Safety
///
/// `addr` must lie within a region some live pool owns, be aligned for
/// `T`, and have `size_of::<T>()` bytes of that region after it.
pub(crate) unsafe fn read_in_pool<T: FromBytes>(addr: usize) -> T {
    // Safety: per this function's contract.
    unsafe { core::ptr::read(addr as *const T) }
}

/// Writes a `T` into pool-owned memory.
///
/// # Safety
///
/// Same addressing requirements as [`read_in_pool`], plus: the write must
/// not overlap storage the pool has handed out to someone else.
pub(crate) unsafe fn write_in_pool<T: IntoBytes + Immutable>(addr: usize, value: T) {
    // Safety: per this function's contract.
    unsafe { core::ptr::write(addr as *mut T, value) }
}

/// One buddy-managed pool.
pub struct MemPool {
    /// Address of the first byte of the managed region.
    base: usize,
    /// Head offset of the free list at each level, `NIL` when empty.
    free: [u32; NUM_LEVELS],
    /// Occupancy bitmap, indexed by tree position. A set bit means the
    /// node is unavailable at its level: handed out, or split.
    tree: [u32; TREE_WORDS],
}

impl MemPool {
    /// Takes over the region `[base, base + POOL_SIZE)`, leaving it empty
    /// of allocations: the level-0 free list holds exactly one node, at
    /// `base`.
    ///
    /// # Safety
    ///
    /// The caller grants the pool exclusive ownership of the region for
    /// the pool's lifetime. `base` must be aligned to the minimum block
    /// size.
    pub unsafe fn new(base: usize) -> Self {
        uassert!(base % MIN_BLOCK == 0);
        let mut pool = MemPool {
            base,
            free: [NIL; NUM_LEVELS],
            tree: [0; TREE_WORDS],
        };
        pool.push_head(0, 0, 0);
        pool
    }

    /// Whether `addr` falls inside this pool's managed region.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + POOL_SIZE
    }

    /// Byte size of a block at `level`.
    fn block_size(&self, level: usize) -> usize {
        POOL_SIZE >> level
    }

    /// Level serving a request of `size` bytes: the request is rounded up
    /// to the next power of two, but never below the minimum block.
    ///
    /// `size` must be in `[1, POOL_SIZE]`.
    fn level_for(size: usize) -> usize {
        let block = size.max(MIN_BLOCK).next_power_of_two();
        (POOL_SIZE_LOG2 - block.ilog2()) as usize
    }

    fn occupied(&self, pos: usize) -> bool {
        self.tree[pos / 32] & (1u32 << (pos % 32)) != 0
    }

    fn set_occupied(&mut self, pos: usize) {
        self.tree[pos / 32] |= 1u32 << (pos % 32);
    }

    fn clear_occupied(&mut self, pos: usize) {
        self.tree[pos / 32] &= !(1u32 << (pos % 32));
    }

    fn read_node(&self, off: u32) -> FreeNode {
        // Safety: `off` designates a block this pool owns and has threaded
        // onto a free list; free blocks always hold a valid node, and
        // FreeNode is FromBytes regardless.
        unsafe { read_in_pool(self.base + off as usize) }
    }

    fn set_prev(&mut self, off: u32, prev: u32) {
        let mut node = self.read_node(off);
        node.prev = prev;
        // Safety: rewriting a node that is on a free list, in storage the
        // pool owns.
        unsafe { write_in_pool(self.base + off as usize, node) };
    }

    fn set_next(&mut self, off: u32, next: u32) {
        let mut node = self.read_node(off);
        node.next = next;
        // Safety: as in set_prev.
        unsafe { write_in_pool(self.base + off as usize, node) };
    }

    /// Links the block at `off` (tree position `pos`) in at the head of
    /// `level`'s free list.
    fn push_head(&mut self, level: usize, off: u32, pos: usize) {
        let head = self.free[level];
        // Safety: the caller owns the block it is returning to the free
        // list; its storage is ours to reuse for the node.
        unsafe {
            write_in_pool(
                self.base + off as usize,
                FreeNode {
                    prev: NIL,
                    next: head,
                    treepos: pos as u32,
                },
            );
        }
        if head != NIL {
            self.set_prev(head, off);
        }
        self.free[level] = off;
    }

    /// Unlinks and returns the head of `level`'s free list, which must be
    /// non-empty. Returns the block's offset and tree position.
    fn detach_head(&mut self, level: usize) -> (u32, usize) {
        let off = self.free[level];
        uassert!(off != NIL);
        let node = self.read_node(off);
        self.free[level] = node.next;
        if node.next != NIL {
            self.set_prev(node.next, NIL);
        }
        let pos = node.treepos as usize;
        if skiff_treemath::level_of(pos) as usize != level {
            fail::die("free list node on wrong level");
        }
        (off, pos)
    }

    /// Unlinks the node with tree position `pos` from `level`'s free list,
    /// returning its offset, or `None` if no such node is on the list.
    fn remove_by_treepos(&mut self, level: usize, pos: usize) -> Option<u32> {
        let mut off = self.free[level];
        while off != NIL {
            let node = self.read_node(off);
            if node.treepos as usize == pos {
                if node.prev != NIL {
                    self.set_next(node.prev, node.next);
                } else {
                    self.free[level] = node.next;
                }
                if node.next != NIL {
                    self.set_prev(node.next, node.prev);
                }
                return Some(off);
            }
            off = node.next;
        }
        None
    }

    /// Allocates a block of at least `size` bytes, returning its address.
    ///
    /// The block granted is the request rounded up to a power of two (at
    /// least the minimum block size), and its address is always a multiple
    /// of the minimum block size.
    pub fn alloc(&mut self, size: usize) -> Result<usize, Error> {
        if size == 0 {
            return Err(Error::InvalidArg);
        }
        if size > POOL_SIZE {
            return Err(Error::NoMemory);
        }
        let level = Self::level_for(size);

        // Find the nearest level at or above the target with a block to
        // give. Failing at the root means the pool cannot satisfy this.
        let mut from = level;
        while self.free[from] == NIL {
            if from == 0 {
                return Err(Error::NoMemory);
            }
            from -= 1;
        }

        // Split down to the target level. Each split retires the parent
        // (it is no longer free as an aggregate) and enqueues both halves,
        // lower address at the head.
        while from < level {
            let (off, pos) = self.detach_head(from);
            self.set_occupied(pos);
            let (lo, hi) = skiff_treemath::children(pos);
            let half = (self.block_size(from) >> 1) as u32;
            self.push_head(from + 1, off + half, hi);
            self.push_head(from + 1, off, lo);
            from += 1;
        }

        let (off, pos) = self.detach_head(level);
        self.set_occupied(pos);
        Ok(self.base + off as usize)
    }

    /// Returns the block at `addr` to the pool, coalescing with its buddy
    /// as far as possible.
    ///
    /// `addr` must lie within the pool (the caller checks); it must be the
    /// address of a live allocation. Misuse is detected where cheap:
    /// interior pointers, double frees, and addresses that were never
    /// handed out all fail with `InvalidArg` before any state changes.
    pub fn dealloc(&mut self, addr: usize) -> Result<(), Error> {
        uassert!(self.contains(addr));
        let offset = addr - self.base;

        // Locate the level this block was handed out at: ascend from the
        // deepest position covering `offset` until a marked one. Split
        // ancestors are marked too, but everything strictly below an
        // allocation is clear, so the first mark found from below is the
        // allocation itself.
        let mut slot = offset >> MIN_BLOCK_LOG2;
        let mut level = NUM_LEVELS - 1;
        let mut pos = skiff_treemath::position(level as u32, slot);
        while !self.occupied(pos) && level > 0 {
            level -= 1;
            slot >>= 1;
            pos = skiff_treemath::position(level as u32, slot);
        }

        if !self.occupied(pos) {
            // Clear all the way to the root: nothing live covers `addr`.
            return Err(Error::InvalidArg);
        }
        if level < NUM_LEVELS - 1 {
            // A handed-out block has clear children. A mark with a marked
            // descendant is a split ancestor, which means `addr` is
            // interior to some block or was freed already.
            let (lo, hi) = skiff_treemath::children(pos);
            if self.occupied(lo) || self.occupied(hi) {
                return Err(Error::InvalidArg);
            }
        }
        if offset & (self.block_size(level) - 1) != 0 {
            return Err(Error::InvalidArg);
        }

        self.clear_occupied(pos);
        let mut off = offset as u32;
        loop {
            let buddy_off = if level > 0 {
                match skiff_treemath::buddy(pos) {
                    Some(b) if !self.occupied(b) => {
                        // The buddy's bit being clear is necessary but not
                        // sufficient: if it is absent from this level's
                        // list it is split further down, and coalescing
                        // stops here.
                        self.remove_by_treepos(level, b)
                    }
                    _ => None,
                }
            } else {
                None
            };
            match buddy_off {
                Some(b) => {
                    // Merged block keeps the lower of the two addresses.
                    off = off.min(b);
                    pos = skiff_treemath::parent(pos);
                    level -= 1;
                    self.clear_occupied(pos);
                }
                None => {
                    self.push_head(level, off, pos);
                    return Ok(());
                }
            }
        }
    }

    /// Calls `f(address, size)` for every free block, walking the free
    /// lists level by level. Returns the number of free blocks.
    pub fn visit_free(&self, mut f: impl FnMut(usize, usize)) -> usize {
        let mut count = 0;
        for level in 0..NUM_LEVELS {
            let mut off = self.free[level];
            while off != NIL {
                f(self.base + off as usize, self.block_size(level));
                count += 1;
                off = self.read_node(off).next;
            }
        }
        count
    }

    /// Logs every free block and returns how many there are.
    pub fn dump(&self) -> usize {
        let count = self.visit_free(|addr, size| {
            klog!("{:#010x}: {:#x}", addr, size);
        });
        klog!("{} free memory block(s) found", count);
        count
    }
}

/// Names the two pools.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PoolId {
    /// Pool #1: backs MEM_ALLOC/MEM_DEALLOC requests from tasks.
    User = 0,
    /// Pool #2: backs task user stacks and ready-queue nodes.
    Kernel = 1,
}

impl PoolId {
    fn index(self) -> usize {
        self as usize
    }
}

/// Where the two managed regions live. The board layout is the real one;
/// tests substitute arena-backed layouts.
#[derive(Copy, Clone, Debug)]
pub struct MemLayout {
    pub pool1_base: usize,
    pub pool2_base: usize,
}

impl MemLayout {
    pub const BOARD: Self = Self {
        pool1_base: RAM1_BASE,
        pool2_base: RAM2_BASE,
    };
}

/// The pair of pools, created empty and initialized by `create`/`init`.
pub struct PoolSet {
    layout: MemLayout,
    pools: [Option<MemPool>; 2],
}

impl PoolSet {
    pub const fn new(layout: MemLayout) -> Self {
        Self {
            layout,
            pools: [None, None],
        }
    }

    /// Initializes the pool whose region begins at `start`.
    ///
    /// Only the buddy algorithm is recognized, and `start` must be one of
    /// the two configured region bases; anything else is `InvalidArg`. The
    /// region length is fixed by the pool geometry, so `end` is accepted
    /// for interface compatibility and not consulted.
    ///
    /// # Safety
    ///
    /// The region starting at `start` must be real, unused memory that the
    /// pool may take exclusive ownership of.
    pub unsafe fn create(&mut self, algo: u32, start: usize, end: usize) -> Result<PoolId, Error> {
        let _ = end;
        if MemAlgo::try_from(algo) != Ok(MemAlgo::Buddy) {
            return Err(Error::InvalidArg);
        }
        let id = if start == self.layout.pool1_base {
            PoolId::User
        } else if start == self.layout.pool2_base {
            PoolId::Kernel
        } else {
            return Err(Error::InvalidArg);
        };
        // Safety: forwarded from our caller.
        self.pools[id.index()] = Some(unsafe { MemPool::new(start) });
        Ok(id)
    }

    /// Initializes both pools with the given algorithm selector. Allocator
    /// bring-up: runs before any task exists.
    ///
    /// # Safety
    ///
    /// As for [`PoolSet::create`], for both configured regions.
    pub unsafe fn init(&mut self, algo: u32) -> Result<(), Error> {
        let MemLayout {
            pool1_base,
            pool2_base,
        } = self.layout;
        // Safety: forwarded from our caller.
        unsafe {
            self.create(algo, pool1_base, pool1_base + POOL_SIZE)?;
            self.create(algo, pool2_base, pool2_base + POOL_SIZE)?;
        }
        Ok(())
    }

    fn pool(&self, id: PoolId) -> Result<&MemPool, Error> {
        self.pools[id.index()].as_ref().ok_or(Error::InvalidArg)
    }

    fn pool_mut(&mut self, id: PoolId) -> Result<&mut MemPool, Error> {
        self.pools[id.index()].as_mut().ok_or(Error::InvalidArg)
    }

    /// Kernel-internal accessor for a pool that is required to exist; the
    /// scheduler cannot run without pool #2, so absence is fatal rather
    /// than an error to bubble.
    pub(crate) fn expect_mut(&mut self, id: PoolId) -> &mut MemPool {
        match self.pools[id.index()].as_mut() {
            Some(p) => p,
            None => fail::die("pool used before create"),
        }
    }

    /// Allocates `size` bytes from the named pool.
    pub fn alloc(&mut self, id: PoolId, size: usize) -> Result<usize, Error> {
        self.pool_mut(id)?.alloc(size)
    }

    /// Frees a block previously returned by `alloc` on the named pool.
    /// Deallocating the null address is a no-op; an address outside the
    /// pool's region is `BadAddress`.
    pub fn dealloc(&mut self, id: PoolId, addr: usize) -> Result<(), Error> {
        if addr == 0 {
            return Ok(());
        }
        let pool = self.pool_mut(id)?;
        if !pool.contains(addr) {
            return Err(Error::BadAddress);
        }
        pool.dealloc(addr)
    }

    /// Logs the named pool's free blocks and returns their count.
    pub fn dump(&self, id: PoolId) -> Result<usize, Error> {
        Ok(self.pool(id)?.dump())
    }
}

/// Test backing memory, shared with the scheduler and syscall tests: a
/// pool-sized, pool-aligned chunk of host memory to run a pool in.
#[cfg(test)]
pub(crate) mod testing {
    use super::POOL_SIZE;

    #[repr(C, align(32768))]
    pub(crate) struct Arena(pub [u8; POOL_SIZE]);

    impl Arena {
        pub fn new() -> Box<Self> {
            Box::new(Arena([0; POOL_SIZE]))
        }

        pub fn base(&self) -> usize {
            self.0.as_ptr() as usize
        }
    }
}
