//! IR storage: the pooled dual-arena working store and owned snapshots.
//!
//! A translated region lives in two parallel arenas allocated in lockstep:
//! the node-links arena (`OrderedNode`: prev/next/uses) and the op-payload
//! arena (`OpPayload`). Both are indexed by `NodeId`, so the whole region is
//! position independent and can be snapshotted with two flat copies.
//!
//! The working store (`DualListData`) carves both arenas out of one buffer
//! claimed from the shared pool; it is reowned at the start of a compile and
//! disowned after, so idle threads donate their IR memory back to the
//! process. `OwnedIr` is the plain `Vec`-backed snapshot retained for
//! executing interpreter blocks and for the AOT cache.

use std::sync::Arc;
use std::time::Duration;

use crate::node::{NodeId, OrderedNode};
use crate::ops::{Op, OpPayload, OpSize};
use crate::pool::{FixedSizePooledAllocation, IntrusivePooledAllocator, MemoryBuffer};

/// Read access to an IR region.
pub trait IrStore {
    fn node(&self, id: NodeId) -> &OrderedNode;
    fn op(&self, id: NodeId) -> &OpPayload;
    fn count(&self) -> u32;
    /// First `CodeBlock` node of the region.
    fn block_head(&self) -> NodeId;
    /// Last `CodeBlock` node of the region.
    fn block_tail(&self) -> NodeId;
}

/// Mutable access plus the linked-list primitives shared by the emitter and
/// the text parser.
pub trait IrStoreMut: IrStore {
    fn node_mut(&mut self, id: NodeId) -> &mut OrderedNode;
    fn op_mut(&mut self, id: NodeId) -> &mut OpPayload;
    fn alloc(&mut self, payload: OpPayload) -> NodeId;
    fn set_block_head(&mut self, id: NodeId);
    fn set_block_tail(&mut self, id: NodeId);

    /// Insert `node` directly after `anchor` in whichever chain `anchor`
    /// belongs to.
    fn link_after(&mut self, anchor: NodeId, node: NodeId) {
        debug_assert!(anchor.is_valid() && node.is_valid());
        let anchor_next = self.node(anchor).next;
        {
            let entry = self.node_mut(node);
            entry.prev = anchor;
            entry.next = anchor_next;
        }
        if anchor_next.is_valid() {
            self.node_mut(anchor_next).prev = node;
        }
        self.node_mut(anchor).next = node;
    }

    /// Remove `node` from its chain, orphaning it. The payload stays in the
    /// arena; only the links change.
    fn unlink(&mut self, node: NodeId) {
        let (prev, next) = {
            let entry = self.node(node);
            (entry.prev, entry.next)
        };
        if prev.is_valid() {
            self.node_mut(prev).next = next;
        }
        if next.is_valid() {
            self.node_mut(next).prev = prev;
        }
        let entry = self.node_mut(node);
        entry.prev = NodeId::INVALID;
        entry.next = NodeId::INVALID;
    }
}

/// Iterator over the `CodeBlock` chain of a region.
pub struct BlockIter<'a, S: IrStore + ?Sized> {
    store: &'a S,
    current: NodeId,
}

impl<'a, S: IrStore + ?Sized> Iterator for BlockIter<'a, S> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        if self.current.is_invalid() {
            return None;
        }
        let id = self.current;
        self.current = self.store.node(id).next;
        Some(id)
    }
}

/// Iterator over the ops of one block, `begin..=last`.
pub struct BlockOpIter<'a, S: IrStore + ?Sized> {
    store: &'a S,
    current: NodeId,
    last: NodeId,
    done: bool,
}

impl<'a, S: IrStore + ?Sized> Iterator for BlockOpIter<'a, S> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        if self.done || self.current.is_invalid() {
            return None;
        }
        let id = self.current;
        if id == self.last {
            self.done = true;
        } else {
            self.current = self.store.node(id).next;
        }
        Some(id)
    }
}

pub fn blocks<S: IrStore + ?Sized>(store: &S) -> BlockIter<'_, S> {
    BlockIter { store, current: store.block_head() }
}

pub fn block_ops<S: IrStore + ?Sized>(store: &S, block: NodeId) -> BlockOpIter<'_, S> {
    match store.op(block).op {
        Op::CodeBlock { begin, last } => BlockOpIter {
            store,
            current: begin,
            last,
            done: begin.is_invalid(),
        },
        _ => BlockOpIter { store, current: NodeId::INVALID, last: NodeId::INVALID, done: true },
    }
}

/// Initial working-buffer size. Matches the upstream emitter's reservation;
/// grows by doubling if a region overflows it.
const DEFAULT_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Disown hysteresis: keep the buffer claimable-cheaply unless the emitter
/// went a full period with almost no compiles.
const DISOWN_PERIOD: Duration = Duration::from_millis(5000);
const DISOWN_PERIOD_FREQUENCY: u32 = 5;

const fn per_node_bytes() -> usize {
    core::mem::size_of::<OpPayload>() + core::mem::size_of::<OrderedNode>()
}

/// The pooled working store for one emitter.
pub struct DualListData {
    pool: Arc<IntrusivePooledAllocator>,
    allocation: FixedSizePooledAllocation,
    buffer: Option<Arc<MemoryBuffer>>,
    /// Op arena comes first in the buffer (stricter alignment), node arena
    /// after it.
    ops: *mut OpPayload,
    nodes: *mut OrderedNode,
    capacity: u32,
    count: u32,
    block_head: NodeId,
    block_tail: NodeId,
}

// The raw arena pointers are only dereferenced by the owning thread; the
// store as a whole may migrate between threads with its emitter.
unsafe impl Send for DualListData {}

impl DualListData {
    pub fn new(pool: Arc<IntrusivePooledAllocator>) -> DualListData {
        Self::with_capacity(pool, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(pool: Arc<IntrusivePooledAllocator>, bytes: usize) -> DualListData {
        let allocation = FixedSizePooledAllocation::new(
            Arc::clone(&pool),
            bytes,
            DISOWN_PERIOD,
            DISOWN_PERIOD_FREQUENCY,
        );
        let mut data = DualListData {
            pool,
            allocation,
            buffer: None,
            ops: core::ptr::null_mut(),
            nodes: core::ptr::null_mut(),
            capacity: 0,
            count: 0,
            block_head: NodeId::INVALID,
            block_tail: NodeId::INVALID,
        };
        data.reown_or_claim();
        data
    }

    fn map_buffer(&mut self, buffer: Arc<MemoryBuffer>) {
        let capacity = buffer.len() / per_node_bytes();
        self.ops = buffer.as_ptr().cast::<OpPayload>();
        // `size_of::<OpPayload>()` is a multiple of its alignment, which in
        // turn satisfies `OrderedNode`'s.
        let node_offset = capacity * core::mem::size_of::<OpPayload>();
        self.nodes = unsafe { buffer.as_ptr().add(node_offset) }.cast::<OrderedNode>();
        self.capacity = capacity as u32;
        self.buffer = Some(buffer);
    }

    /// Make the buffer usable again after a `delayed_disown`. If the pool
    /// stole it in the meantime the region content is gone and the store
    /// resets.
    pub fn reown_or_claim(&mut self) {
        let previous = self.buffer.clone();
        let buffer = self.allocation.reown_or_claim();
        let same = previous
            .as_ref()
            .map(|prev| Arc::ptr_eq(prev, &buffer))
            .unwrap_or(false);
        if !same {
            self.map_buffer(buffer);
            self.reset();
        }
    }

    /// Relinquish the working buffer until the next compile.
    pub fn delayed_disown(&mut self) {
        self.allocation.delayed_disown();
    }

    /// Drop all nodes and re-seed the sentinel.
    pub fn reset(&mut self) {
        self.count = 0;
        self.block_head = NodeId::INVALID;
        self.block_tail = NodeId::INVALID;
        let sentinel = self.alloc(OpPayload::scalar(Op::Invalid, OpSize::I8));
        debug_assert!(sentinel.is_invalid());
    }

    fn grow(&mut self) {
        let new_bytes = self
            .buffer
            .as_ref()
            .map(|buffer| buffer.len() * 2)
            .unwrap_or(DEFAULT_BUFFER_SIZE);
        log::debug!("IR buffer overflow, growing to {} bytes", new_bytes);
        let mut replacement = FixedSizePooledAllocation::new(
            Arc::clone(&self.pool),
            new_bytes,
            DISOWN_PERIOD,
            DISOWN_PERIOD_FREQUENCY,
        );
        let buffer = replacement.reown_or_claim();

        let count = self.count as usize;
        let capacity = buffer.len() / per_node_bytes();
        let ops = buffer.as_ptr().cast::<OpPayload>();
        let node_offset = capacity * core::mem::size_of::<OpPayload>();
        let nodes = unsafe { buffer.as_ptr().add(node_offset) }.cast::<OrderedNode>();
        // Both arenas are trivially copyable; ids survive the move untouched.
        unsafe {
            core::ptr::copy_nonoverlapping(self.ops as *const OpPayload, ops, count);
            core::ptr::copy_nonoverlapping(self.nodes as *const OrderedNode, nodes, count);
        }

        self.allocation = replacement;
        self.ops = ops;
        self.nodes = nodes;
        self.capacity = capacity as u32;
        self.buffer = Some(buffer);
    }

    /// Snapshot the live region into plain heap storage.
    pub fn copy_out(&self) -> OwnedIr {
        let count = self.count as usize;
        let nodes = unsafe { core::slice::from_raw_parts(self.nodes, count) }.to_vec();
        let ops = unsafe { core::slice::from_raw_parts(self.ops, count) }.to_vec();
        OwnedIr { nodes, ops, block_head: self.block_head, block_tail: self.block_tail }
    }
}

impl IrStore for DualListData {
    fn node(&self, id: NodeId) -> &OrderedNode {
        debug_assert!(id.as_u32() < self.count);
        unsafe { &*self.nodes.add(id.index()) }
    }

    fn op(&self, id: NodeId) -> &OpPayload {
        debug_assert!(id.as_u32() < self.count);
        unsafe { &*self.ops.add(id.index()) }
    }

    fn count(&self) -> u32 {
        self.count
    }

    fn block_head(&self) -> NodeId {
        self.block_head
    }

    fn block_tail(&self) -> NodeId {
        self.block_tail
    }
}

impl IrStoreMut for DualListData {
    fn node_mut(&mut self, id: NodeId) -> &mut OrderedNode {
        debug_assert!(id.as_u32() < self.count);
        unsafe { &mut *self.nodes.add(id.index()) }
    }

    fn op_mut(&mut self, id: NodeId) -> &mut OpPayload {
        debug_assert!(id.as_u32() < self.count);
        unsafe { &mut *self.ops.add(id.index()) }
    }

    fn alloc(&mut self, payload: OpPayload) -> NodeId {
        debug_assert!(self.allocation.is_owned(), "arena used while disowned");
        if self.count == self.capacity {
            self.grow();
        }
        let id = NodeId::from_u32(self.count);
        unsafe {
            self.nodes.add(id.index()).write(OrderedNode::default());
            self.ops.add(id.index()).write(payload);
        }
        self.count += 1;
        id
    }

    fn set_block_head(&mut self, id: NodeId) {
        self.block_head = id;
    }

    fn set_block_tail(&mut self, id: NodeId) {
        self.block_tail = id;
    }
}

/// A heap-backed snapshot of a region. This is what outlives a compile:
/// interpreter-executed blocks and AOT cache entries both hold one.
#[derive(Clone, Default)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OwnedIr {
    pub nodes: Vec<OrderedNode>,
    pub ops: Vec<OpPayload>,
    pub block_head: NodeId,
    pub block_tail: NodeId,
}

impl OwnedIr {
    /// An empty region with just the sentinel, for the parser to build into.
    pub fn new() -> OwnedIr {
        let mut ir = OwnedIr::default();
        ir.alloc(OpPayload::scalar(Op::Invalid, OpSize::I8));
        ir
    }

    /// Flat copy of any IR store. Ids are preserved, which is the entire
    /// point of offset-addressed arenas.
    pub fn snapshot(store: &(impl IrStore + ?Sized)) -> OwnedIr {
        let count = store.count();
        let mut nodes = Vec::with_capacity(count as usize);
        let mut ops = Vec::with_capacity(count as usize);
        for raw in 0..count {
            let id = NodeId::from_u32(raw);
            nodes.push(*store.node(id));
            ops.push(*store.op(id));
        }
        OwnedIr { nodes, ops, block_head: store.block_head(), block_tail: store.block_tail() }
    }
}

impl IrStore for OwnedIr {
    fn node(&self, id: NodeId) -> &OrderedNode {
        &self.nodes[id.index()]
    }

    fn op(&self, id: NodeId) -> &OpPayload {
        &self.ops[id.index()]
    }

    fn count(&self) -> u32 {
        self.nodes.len() as u32
    }

    fn block_head(&self) -> NodeId {
        self.block_head
    }

    fn block_tail(&self) -> NodeId {
        self.block_tail
    }
}

impl IrStoreMut for OwnedIr {
    fn node_mut(&mut self, id: NodeId) -> &mut OrderedNode {
        &mut self.nodes[id.index()]
    }

    fn op_mut(&mut self, id: NodeId) -> &mut OpPayload {
        &mut self.ops[id.index()]
    }

    fn alloc(&mut self, payload: OpPayload) -> NodeId {
        let id = NodeId::from_u32(self.nodes.len() as u32);
        self.nodes.push(OrderedNode::default());
        self.ops.push(payload);
        id
    }

    fn set_block_head(&mut self, id: NodeId) {
        self.block_head = id;
    }

    fn set_block_tail(&mut self, id: NodeId) {
        self.block_tail = id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_seeds_sentinel() {
        let pool = IntrusivePooledAllocator::new_heap();
        let data = DualListData::with_capacity(pool, 64 * 1024);
        assert_eq!(data.count(), 1);
        assert!(matches!(data.op(NodeId::INVALID).op, Op::Invalid));
    }

    #[test]
    fn link_after_builds_chain() {
        let mut ir = OwnedIr::new();
        let a = ir.alloc(OpPayload::scalar(Op::Constant { value: 1 }, OpSize::I64));
        let b = ir.alloc(OpPayload::scalar(Op::Constant { value: 2 }, OpSize::I64));
        let c = ir.alloc(OpPayload::scalar(Op::Constant { value: 3 }, OpSize::I64));
        ir.link_after(a, b);
        ir.link_after(b, c);
        assert_eq!(ir.node(a).next, b);
        assert_eq!(ir.node(c).prev, b);

        ir.unlink(b);
        assert_eq!(ir.node(a).next, c);
        assert_eq!(ir.node(c).prev, a);
        assert!(ir.node(b).next.is_invalid());
    }

    #[test]
    fn arena_grows_preserving_ids() {
        let pool = IntrusivePooledAllocator::new_heap();
        // Small enough to force at least one growth.
        let mut data = DualListData::with_capacity(pool, 4 * per_node_bytes());
        let mut ids = Vec::new();
        for value in 0..64u64 {
            ids.push(data.alloc(OpPayload::scalar(Op::Constant { value }, OpSize::I64)));
        }
        for (value, id) in ids.iter().enumerate() {
            match data.op(*id).op {
                Op::Constant { value: stored } => assert_eq!(stored, value as u64),
                ref other => panic!("unexpected op {other:?}"),
            }
        }
    }

    #[test]
    fn copy_out_roundtrips() {
        let pool = IntrusivePooledAllocator::new_heap();
        let mut data = DualListData::with_capacity(pool, 64 * 1024);
        let a = data.alloc(OpPayload::scalar(Op::Constant { value: 42 }, OpSize::I32));
        data.set_block_head(a);
        let owned = data.copy_out();
        assert_eq!(owned.count(), data.count());
        assert_eq!(owned.block_head(), a);
        assert!(matches!(owned.op(a).op, Op::Constant { value: 42 }));
    }
}
