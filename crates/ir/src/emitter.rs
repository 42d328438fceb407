//! The IR builder: allocates ops, maintains block structure, and provides
//! the rewrite primitives passes are built from.

use std::sync::Arc;

use crate::data::{blocks, DualListData, IrStore, IrStoreMut};
use crate::node::NodeId;
use crate::ops::{BreakDefinition, CondCode, Op, OpPayload, OpSize, RegClass, ThunkHash};
use crate::pool::IntrusivePooledAllocator;

/// Fluent builder over a pooled dual-arena region.
///
/// The emitter tracks a current block and a write cursor (the node new ops
/// are appended after). Block chain and op chains are disjoint: `CodeBlock`
/// nodes link only to each other, ops link only within their block.
pub struct IrEmitter {
    data: DualListData,
    current_block: NodeId,
    cursor: NodeId,
}

impl IrEmitter {
    pub fn new(pool: Arc<IntrusivePooledAllocator>) -> IrEmitter {
        IrEmitter {
            data: DualListData::new(pool),
            current_block: NodeId::INVALID,
            cursor: NodeId::INVALID,
        }
    }

    pub fn data(&self) -> &DualListData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut DualListData {
        &mut self.data
    }

    pub fn reown_or_claim_buffer(&mut self) {
        self.data.reown_or_claim();
    }

    pub fn delayed_disown_buffer(&mut self) {
        self.data.delayed_disown();
    }

    pub fn reset_working_list(&mut self) {
        self.data.reset();
        self.current_block = NodeId::INVALID;
        self.cursor = NodeId::INVALID;
    }

    pub fn current_code_block(&self) -> NodeId {
        self.current_block
    }

    pub fn write_cursor(&self) -> NodeId {
        self.cursor
    }

    /// Point the append cursor at `node`; new ops are inserted after it.
    pub fn set_write_cursor(&mut self, node: NodeId) {
        self.cursor = node;
    }

    // ------------------------------------------------------------------
    // Allocation and insertion.

    fn bump_arg_uses(&mut self, op: &Op) {
        let mut args = smallvec::SmallVec::<[NodeId; 8]>::new();
        op.visit_args(|arg| args.push(arg));
        for arg in args {
            if arg.is_valid() {
                self.data.node_mut(arg).uses += 1;
            }
        }
    }

    /// Allocate a node and append it after the write cursor.
    pub fn append(&mut self, payload: OpPayload) -> NodeId {
        let id = self.data.alloc(payload);
        self.bump_arg_uses(&payload.op);
        if self.cursor.is_valid() {
            self.data.link_after(self.cursor, id);
        }
        self.cursor = id;
        id
    }

    /// Allocate a node and insert it directly before `anchor`, leaving the
    /// main cursor alone. Used by passes splicing spills and constants into
    /// finished blocks.
    pub fn insert_before(&mut self, anchor: NodeId, payload: OpPayload) -> NodeId {
        let id = self.data.alloc(payload);
        self.bump_arg_uses(&payload.op);
        let prev = self.data.node(anchor).prev;
        if prev.is_valid() {
            self.data.link_after(prev, id);
        } else {
            // Anchor is a chain head; link manually.
            self.data.node_mut(id).next = anchor;
            self.data.node_mut(anchor).prev = id;
        }
        id
    }

    /// Allocate a node and insert it directly after `anchor` without moving
    /// the main cursor.
    pub fn insert_after(&mut self, anchor: NodeId, payload: OpPayload) -> NodeId {
        let id = self.data.alloc(payload);
        self.bump_arg_uses(&payload.op);
        self.data.link_after(anchor, id);
        id
    }

    // ------------------------------------------------------------------
    // Block construction.

    /// Allocate a `CodeBlock` node at the end of the block chain.
    pub fn create_code_node(&mut self) -> NodeId {
        let block = self.data.alloc(OpPayload::scalar(
            Op::CodeBlock { begin: NodeId::INVALID, last: NodeId::INVALID },
            OpSize::I8,
        ));
        let tail = self.data.block_tail();
        if tail.is_valid() {
            self.data.link_after(tail, block);
        } else {
            self.data.set_block_head(block);
        }
        self.data.set_block_tail(block);
        block
    }

    /// Allocate a `CodeBlock` node and splice it into the chain directly
    /// after `after`.
    pub fn create_new_code_block_after(&mut self, after: NodeId) -> NodeId {
        let block = self.data.alloc(OpPayload::scalar(
            Op::CodeBlock { begin: NodeId::INVALID, last: NodeId::INVALID },
            OpSize::I8,
        ));
        self.data.link_after(after, block);
        if self.data.block_tail() == after {
            self.data.set_block_tail(block);
        }
        block
    }

    /// Make `block` current and position the cursor at its last op (or its
    /// start when empty).
    pub fn set_current_code_block(&mut self, block: NodeId) {
        self.current_block = block;
        let payload = self.data.op(block).op;
        if let Op::CodeBlock { begin, last } = payload {
            self.cursor = if last.is_valid() {
                last
            } else if begin.is_valid() {
                // Walk to the chain end.
                let mut node = begin;
                loop {
                    let next = self.data.node(node).next;
                    if next.is_invalid() {
                        break node;
                    }
                    node = next;
                }
            } else {
                NodeId::INVALID
            };
        }
    }

    /// Open `block` for emission: appends its `BeginBlock` op and points the
    /// cursor at it.
    pub fn start_block(&mut self, block: NodeId) {
        self.current_block = block;
        self.cursor = NodeId::INVALID;
        let begin = self.data.alloc(OpPayload::scalar(Op::BeginBlock { block }, OpSize::I8));
        if let Op::CodeBlock { begin: slot, .. } = &mut self.data.op_mut(block).op {
            *slot = begin;
        }
        self.cursor = begin;
    }

    /// Close `block`: appends its `EndBlock` op and records the chain tail.
    pub fn finish_block(&mut self, block: NodeId) {
        debug_assert_eq!(self.current_block, block);
        let end = self.append(OpPayload::scalar(Op::EndBlock { block }, OpSize::I8));
        if let Op::CodeBlock { last, .. } = &mut self.data.op_mut(block).op {
            *last = end;
        }
    }

    /// Update a block's recorded tail after passes appended past it.
    pub fn refresh_block_tail(&mut self, block: NodeId) {
        if let Op::CodeBlock { begin, .. } = self.data.op(block).op {
            if begin.is_invalid() {
                return;
            }
            let mut node = begin;
            loop {
                let next = self.data.node(node).next;
                if next.is_invalid() {
                    break;
                }
                node = next;
            }
            if let Op::CodeBlock { last, .. } = &mut self.data.op_mut(block).op {
                *last = node;
            }
        }
    }

    // ------------------------------------------------------------------
    // Rewrites.

    /// Retarget every use of `old` to `new` across the whole region.
    pub fn replace_all_uses_with(&mut self, old: NodeId, new: NodeId) {
        let block_list: Vec<NodeId> = blocks(&self.data).collect();
        for block in block_list {
            let ops: Vec<NodeId> = crate::data::block_ops(&self.data, block).collect();
            for node in ops {
                self.replace_args_in(node, old, new);
            }
        }
    }

    /// Retarget uses of `old` to `new` in `anchor` and everything after it
    /// in region order.
    pub fn replace_uses_with_after(&mut self, old: NodeId, new: NodeId, anchor: NodeId) {
        let mut reached = false;
        let block_list: Vec<NodeId> = blocks(&self.data).collect();
        for block in block_list {
            let ops: Vec<NodeId> = crate::data::block_ops(&self.data, block).collect();
            for node in ops {
                if node == anchor {
                    reached = true;
                }
                if reached {
                    self.replace_args_in(node, old, new);
                }
            }
        }
    }

    fn replace_args_in(&mut self, node: NodeId, old: NodeId, new: NodeId) {
        let mut replaced = 0u32;
        self.data.op_mut(node).op.visit_args_mut(|arg| {
            if *arg == old {
                *arg = new;
                replaced += 1;
            }
        });
        if replaced != 0 {
            self.data.node_mut(old).uses -= replaced;
            self.data.node_mut(new).uses += replaced;
        }
    }

    /// Replace a single argument slot of `node`.
    pub fn replace_node_argument(&mut self, node: NodeId, slot: usize, new: NodeId) {
        let mut old = NodeId::INVALID;
        {
            let op = &mut self.data.op_mut(node).op;
            let mut index = 0usize;
            op.visit_args_mut(|arg| {
                if index == slot {
                    old = *arg;
                    *arg = new;
                }
                index += 1;
            });
        }
        if old.is_valid() {
            self.data.node_mut(old).uses -= 1;
        }
        if new.is_valid() {
            self.data.node_mut(new).uses += 1;
        }
    }

    /// Overwrite `node`'s payload with a constant, releasing its arguments.
    pub fn replace_with_constant(&mut self, node: NodeId, value: u64) {
        let old_op = self.data.op(node).op;
        let mut args = smallvec::SmallVec::<[NodeId; 8]>::new();
        old_op.visit_args(|arg| args.push(arg));
        for arg in args {
            if arg.is_valid() {
                self.data.node_mut(arg).uses -= 1;
            }
        }
        let size = self.data.op(node).size;
        let masked = value & size.value_mask();
        self.data.op_mut(node).op = Op::Constant { value: masked };
    }

    /// Unlink `node` and release its argument references.
    pub fn remove(&mut self, node: NodeId) {
        let op = self.data.op(node).op;
        let mut args = smallvec::SmallVec::<[NodeId; 8]>::new();
        op.visit_args(|arg| args.push(arg));
        for arg in args {
            if arg.is_valid() {
                self.data.node_mut(arg).uses -= 1;
            }
        }
        self.data.unlink(node);
    }

    // ------------------------------------------------------------------
    // Value builders.

    /// Canonicalized constant: the value is masked to the requested size.
    pub fn constant(&mut self, size: OpSize, value: u64) -> NodeId {
        debug_assert!(size <= OpSize::I64, "scalar constants only");
        let masked = value & size.value_mask();
        self.append(OpPayload::scalar(Op::Constant { value: masked }, size))
    }

    pub fn inline_constant(&mut self, size: OpSize, value: u64) -> NodeId {
        let masked = value & size.value_mask();
        self.append(OpPayload::scalar(Op::InlineConstant { value: masked }, size))
    }

    pub fn load_context(&mut self, size: OpSize, class: RegClass, offset: u32) -> NodeId {
        self.append(OpPayload::scalar(Op::LoadContext { offset, class }, size))
    }

    pub fn store_context(
        &mut self,
        size: OpSize,
        class: RegClass,
        offset: u32,
        value: NodeId,
    ) -> NodeId {
        self.append(OpPayload::scalar(Op::StoreContext { offset, class, value }, size))
    }

    pub fn load_register(&mut self, size: OpSize, class: RegClass, reg: u32) -> NodeId {
        self.append(OpPayload::scalar(Op::LoadRegister { reg, class }, size))
    }

    pub fn store_register(
        &mut self,
        size: OpSize,
        class: RegClass,
        reg: u32,
        value: NodeId,
    ) -> NodeId {
        self.append(OpPayload::scalar(Op::StoreRegister { reg, class, value }, size))
    }

    pub fn load_flag(&mut self, flag: u32) -> NodeId {
        let size = if flag == silex_types::x86::FLAG_NZCV as u32 { OpSize::I32 } else { OpSize::I8 };
        self.append(OpPayload::scalar(Op::LoadFlag { flag }, size))
    }

    pub fn store_flag(&mut self, flag: u32, value: NodeId) -> NodeId {
        let size = if flag == silex_types::x86::FLAG_NZCV as u32 { OpSize::I32 } else { OpSize::I8 };
        self.append(OpPayload::scalar(Op::StoreFlag { flag, value }, size))
    }

    pub fn add(&mut self, size: OpSize, src1: NodeId, src2: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::Add { src1, src2 }, size))
    }

    pub fn sub(&mut self, size: OpSize, src1: NodeId, src2: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::Sub { src1, src2 }, size))
    }

    pub fn mul(&mut self, size: OpSize, src1: NodeId, src2: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::Mul { src1, src2 }, size))
    }

    pub fn umul(&mut self, size: OpSize, src1: NodeId, src2: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::UMul { src1, src2 }, size))
    }

    pub fn mulh(&mut self, size: OpSize, src1: NodeId, src2: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::MulH { src1, src2 }, size))
    }

    pub fn umulh(&mut self, size: OpSize, src1: NodeId, src2: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::UMulH { src1, src2 }, size))
    }

    pub fn div(&mut self, size: OpSize, src1: NodeId, src2: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::Div { src1, src2 }, size))
    }

    pub fn udiv(&mut self, size: OpSize, src1: NodeId, src2: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::UDiv { src1, src2 }, size))
    }

    pub fn rem(&mut self, size: OpSize, src1: NodeId, src2: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::Rem { src1, src2 }, size))
    }

    pub fn urem(&mut self, size: OpSize, src1: NodeId, src2: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::URem { src1, src2 }, size))
    }

    pub fn and(&mut self, size: OpSize, src1: NodeId, src2: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::And { src1, src2 }, size))
    }

    pub fn or(&mut self, size: OpSize, src1: NodeId, src2: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::Or { src1, src2 }, size))
    }

    pub fn xor(&mut self, size: OpSize, src1: NodeId, src2: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::Xor { src1, src2 }, size))
    }

    pub fn lshl(&mut self, size: OpSize, src1: NodeId, src2: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::Lshl { src1, src2 }, size))
    }

    pub fn lshr(&mut self, size: OpSize, src1: NodeId, src2: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::Lshr { src1, src2 }, size))
    }

    pub fn ashr(&mut self, size: OpSize, src1: NodeId, src2: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::Ashr { src1, src2 }, size))
    }

    pub fn ror(&mut self, size: OpSize, src1: NodeId, src2: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::Ror { src1, src2 }, size))
    }

    pub fn not(&mut self, size: OpSize, src: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::Not { src }, size))
    }

    pub fn neg(&mut self, size: OpSize, src: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::Neg { src }, size))
    }

    pub fn popcount(&mut self, size: OpSize, src: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::Popcount { src }, size))
    }

    pub fn clz(&mut self, size: OpSize, src: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::Clz { src }, size))
    }

    pub fn ctz(&mut self, size: OpSize, src: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::Ctz { src }, size))
    }

    pub fn rev(&mut self, size: OpSize, src: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::Rev { src }, size))
    }

    pub fn copy(&mut self, size: OpSize, src: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::Copy { src }, size))
    }

    pub fn bfe(&mut self, size: OpSize, src: NodeId, lsb: u8, width: u8) -> NodeId {
        self.append(OpPayload::scalar(Op::Bfe { src, lsb, width }, size))
    }

    pub fn sbfe(&mut self, size: OpSize, src: NodeId, lsb: u8, width: u8) -> NodeId {
        self.append(OpPayload::scalar(Op::Sbfe { src, lsb, width }, size))
    }

    pub fn bfi(&mut self, size: OpSize, dest: NodeId, src: NodeId, lsb: u8, width: u8) -> NodeId {
        self.append(OpPayload::scalar(Op::Bfi { dest, src, lsb, width }, size))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn select(
        &mut self,
        size: OpSize,
        cond: CondCode,
        compare_size: OpSize,
        cmp1: NodeId,
        cmp2: NodeId,
        true_val: NodeId,
        false_val: NodeId,
    ) -> NodeId {
        self.append(OpPayload::scalar(
            Op::Select { cond, compare_size, cmp1, cmp2, true_val, false_val },
            size,
        ))
    }

    pub fn load_mem(&mut self, class: RegClass, size: OpSize, addr: NodeId, align: u8) -> NodeId {
        self.append(OpPayload::scalar(
            Op::LoadMem { class, addr, offset: NodeId::INVALID, align },
            size,
        ))
    }

    pub fn store_mem(
        &mut self,
        class: RegClass,
        size: OpSize,
        addr: NodeId,
        value: NodeId,
        align: u8,
    ) -> NodeId {
        self.append(OpPayload::scalar(
            Op::StoreMem { class, addr, value, offset: NodeId::INVALID, align },
            size,
        ))
    }

    pub fn load_mem_tso(
        &mut self,
        class: RegClass,
        size: OpSize,
        addr: NodeId,
        align: u8,
    ) -> NodeId {
        self.append(OpPayload::scalar(
            Op::LoadMemTso { class, addr, offset: NodeId::INVALID, align },
            size,
        ))
    }

    pub fn store_mem_tso(
        &mut self,
        class: RegClass,
        size: OpSize,
        addr: NodeId,
        value: NodeId,
        align: u8,
    ) -> NodeId {
        self.append(OpPayload::scalar(
            Op::StoreMemTso { class, addr, value, offset: NodeId::INVALID, align },
            size,
        ))
    }

    pub fn cas(&mut self, size: OpSize, expected: NodeId, desired: NodeId, addr: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::Cas { expected, desired, addr }, size))
    }

    pub fn cas_pair(
        &mut self,
        size: OpSize,
        expected: NodeId,
        desired: NodeId,
        addr: NodeId,
    ) -> NodeId {
        self.append(OpPayload::scalar(Op::CasPair { expected, desired, addr }, size))
    }

    pub fn atomic_add(&mut self, size: OpSize, addr: NodeId, value: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::AtomicAdd { addr, value }, size))
    }

    pub fn atomic_sub(&mut self, size: OpSize, addr: NodeId, value: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::AtomicSub { addr, value }, size))
    }

    pub fn atomic_and(&mut self, size: OpSize, addr: NodeId, value: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::AtomicAnd { addr, value }, size))
    }

    pub fn atomic_or(&mut self, size: OpSize, addr: NodeId, value: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::AtomicOr { addr, value }, size))
    }

    pub fn atomic_xor(&mut self, size: OpSize, addr: NodeId, value: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::AtomicXor { addr, value }, size))
    }

    pub fn atomic_neg(&mut self, size: OpSize, addr: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::AtomicNeg { addr }, size))
    }

    pub fn atomic_swap(&mut self, size: OpSize, addr: NodeId, value: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::AtomicSwap { addr, value }, size))
    }

    pub fn atomic_fetch_add(&mut self, size: OpSize, addr: NodeId, value: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::AtomicFetchAdd { addr, value }, size))
    }

    pub fn atomic_fetch_sub(&mut self, size: OpSize, addr: NodeId, value: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::AtomicFetchSub { addr, value }, size))
    }

    pub fn atomic_fetch_and(&mut self, size: OpSize, addr: NodeId, value: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::AtomicFetchAnd { addr, value }, size))
    }

    pub fn atomic_fetch_or(&mut self, size: OpSize, addr: NodeId, value: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::AtomicFetchOr { addr, value }, size))
    }

    pub fn atomic_fetch_xor(&mut self, size: OpSize, addr: NodeId, value: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::AtomicFetchXor { addr, value }, size))
    }

    pub fn create_element_pair(&mut self, size: OpSize, lo: NodeId, hi: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::CreateElementPair { lo, hi }, size))
    }

    pub fn extract_element_pair(&mut self, size: OpSize, pair: NodeId, index: u8) -> NodeId {
        self.append(OpPayload::scalar(Op::ExtractElementPair { pair, index }, size))
    }

    pub fn vadd(&mut self, size: OpSize, elem: OpSize, src1: NodeId, src2: NodeId) -> NodeId {
        self.append(OpPayload { op: Op::VAdd { src1, src2 }, size, elem_size: elem })
    }

    pub fn vsub(&mut self, size: OpSize, elem: OpSize, src1: NodeId, src2: NodeId) -> NodeId {
        self.append(OpPayload { op: Op::VSub { src1, src2 }, size, elem_size: elem })
    }

    pub fn vand(&mut self, size: OpSize, src1: NodeId, src2: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::VAnd { src1, src2 }, size))
    }

    pub fn vor(&mut self, size: OpSize, src1: NodeId, src2: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::VOr { src1, src2 }, size))
    }

    pub fn vxor(&mut self, size: OpSize, src1: NodeId, src2: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::VXor { src1, src2 }, size))
    }

    pub fn vcast_from_gpr(&mut self, size: OpSize, elem: OpSize, src: NodeId) -> NodeId {
        self.append(OpPayload { op: Op::VCastFromGpr { src }, size, elem_size: elem })
    }

    pub fn vextract_to_gpr(
        &mut self,
        size: OpSize,
        elem: OpSize,
        vector: NodeId,
        index: u8,
    ) -> NodeId {
        self.append(OpPayload { op: Op::VExtractToGpr { vector, index }, size, elem_size: elem })
    }

    pub fn vinsert_gpr(
        &mut self,
        size: OpSize,
        elem: OpSize,
        vector: NodeId,
        src: NodeId,
        index: u8,
    ) -> NodeId {
        self.append(OpPayload { op: Op::VInsertGpr { vector, src, index }, size, elem_size: elem })
    }

    pub fn fadd(&mut self, size: OpSize, src1: NodeId, src2: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::FAdd { src1, src2 }, size))
    }

    pub fn fsub(&mut self, size: OpSize, src1: NodeId, src2: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::FSub { src1, src2 }, size))
    }

    pub fn fmul(&mut self, size: OpSize, src1: NodeId, src2: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::FMul { src1, src2 }, size))
    }

    pub fn fdiv(&mut self, size: OpSize, src1: NodeId, src2: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::FDiv { src1, src2 }, size))
    }

    pub fn fcmp(&mut self, size: OpSize, src1: NodeId, src2: NodeId) -> NodeId {
        // Flag result is a GPR value regardless of source width.
        self.append(OpPayload { op: Op::FCmp { src1, src2 }, size: OpSize::I64, elem_size: size })
    }

    pub fn cvt_f_to_f(&mut self, to: OpSize, from: OpSize, src: NodeId) -> NodeId {
        self.append(OpPayload { op: Op::CvtFToF { src }, size: to, elem_size: from })
    }

    pub fn cvt_sint_to_f(&mut self, to: OpSize, from: OpSize, src: NodeId) -> NodeId {
        self.append(OpPayload { op: Op::CvtSIntToF { src }, size: to, elem_size: from })
    }

    pub fn cvt_f_to_sint(&mut self, to: OpSize, from: OpSize, src: NodeId) -> NodeId {
        self.append(OpPayload { op: Op::CvtFToSInt { src }, size: to, elem_size: from })
    }

    pub fn cpuid(&mut self, function: NodeId, leaf: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::CpuId { function, leaf }, OpSize::I128))
    }

    pub fn xgetbv(&mut self, function: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::XGetBv { function }, OpSize::I64))
    }

    pub fn syscall(&mut self, args: [NodeId; 7]) -> NodeId {
        self.append(OpPayload::scalar(Op::Syscall { args }, OpSize::I64))
    }

    pub fn inline_syscall(&mut self, args: [NodeId; 7]) -> NodeId {
        self.append(OpPayload::scalar(Op::InlineSyscall { args }, OpSize::I64))
    }

    pub fn thunk(&mut self, arg_ptr: NodeId, hash: ThunkHash) -> NodeId {
        self.append(OpPayload::scalar(Op::Thunk { arg_ptr, hash }, OpSize::I64))
    }

    pub fn validate_code(
        &mut self,
        offset: u64,
        original_lo: u64,
        original_hi: u64,
        length: u8,
    ) -> NodeId {
        self.append(OpPayload::scalar(
            Op::ValidateCode { offset, original_lo, original_hi, length },
            OpSize::I32,
        ))
    }

    pub fn remove_code_entry(&mut self, rip: u64) -> NodeId {
        self.append(OpPayload::scalar(Op::RemoveCodeEntry { rip }, OpSize::I8))
    }

    pub fn break_op(&mut self, reason: BreakDefinition) -> NodeId {
        self.append(OpPayload::scalar(Op::Break { reason }, OpSize::I8))
    }

    pub fn jump(&mut self, target: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::Jump { target }, OpSize::I8))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn cond_jump(
        &mut self,
        cond: CondCode,
        compare_size: OpSize,
        cmp1: NodeId,
        cmp2: NodeId,
        true_block: NodeId,
        false_block: NodeId,
    ) -> NodeId {
        self.append(OpPayload::scalar(
            Op::CondJump { cond, compare_size, cmp1, cmp2, true_block, false_block },
            OpSize::I8,
        ))
    }

    pub fn exit_function(&mut self, new_rip: NodeId) -> NodeId {
        self.append(OpPayload::scalar(Op::ExitFunction { new_rip }, OpSize::I8))
    }

    pub fn spill_register(
        &mut self,
        size: OpSize,
        value: NodeId,
        slot: u32,
        anchor: NodeId,
    ) -> NodeId {
        self.insert_before(anchor, OpPayload::scalar(Op::SpillRegister { value, slot }, size))
    }

    pub fn fill_register(
        &mut self,
        size: OpSize,
        orig: NodeId,
        slot: u32,
        anchor: NodeId,
    ) -> NodeId {
        self.insert_before(anchor, OpPayload::scalar(Op::FillRegister { orig, slot }, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{block_ops, blocks};

    fn test_emitter() -> IrEmitter {
        IrEmitter::new(IntrusivePooledAllocator::new_heap())
    }

    #[test]
    fn single_block_construction() {
        let mut emitter = test_emitter();
        let block = emitter.create_code_node();
        emitter.start_block(block);
        let lhs = emitter.constant(OpSize::I32, 5);
        let rhs = emitter.constant(OpSize::I32, 3);
        let sum = emitter.add(OpSize::I32, lhs, rhs);
        emitter.finish_block(block);

        let collected: Vec<NodeId> = blocks(emitter.data()).collect();
        assert_eq!(collected, vec![block]);

        let ops: Vec<NodeId> = block_ops(emitter.data(), block).collect();
        assert_eq!(ops.len(), 5); // Begin, two constants, add, End
        assert_eq!(emitter.data().node(lhs).uses, 1);
        assert_eq!(emitter.data().node(rhs).uses, 1);
        assert_eq!(emitter.data().node(sum).uses, 0);
    }

    #[test]
    fn constants_are_masked() {
        let mut emitter = test_emitter();
        let block = emitter.create_code_node();
        emitter.start_block(block);
        let value = emitter.constant(OpSize::I8, 0x1ff);
        match emitter.data().op(value).op {
            Op::Constant { value } => assert_eq!(value, 0xff),
            ref other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn replace_all_uses_updates_counts() {
        let mut emitter = test_emitter();
        let block = emitter.create_code_node();
        emitter.start_block(block);
        let a = emitter.constant(OpSize::I32, 1);
        let b = emitter.constant(OpSize::I32, 2);
        let sum = emitter.add(OpSize::I32, a, a);
        emitter.finish_block(block);

        emitter.replace_all_uses_with(a, b);
        assert_eq!(emitter.data().node(a).uses, 0);
        assert_eq!(emitter.data().node(b).uses, 2);
        match emitter.data().op(sum).op {
            Op::Add { src1, src2 } => {
                assert_eq!(src1, b);
                assert_eq!(src2, b);
            }
            ref other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn replace_uses_after_anchor_only() {
        let mut emitter = test_emitter();
        let block = emitter.create_code_node();
        emitter.start_block(block);
        let a = emitter.constant(OpSize::I32, 1);
        let b = emitter.constant(OpSize::I32, 2);
        let first = emitter.add(OpSize::I32, a, a);
        let second = emitter.add(OpSize::I32, a, a);
        emitter.finish_block(block);

        emitter.replace_uses_with_after(a, b, second);
        match emitter.data().op(first).op {
            Op::Add { src1, .. } => assert_eq!(src1, a),
            ref other => panic!("unexpected {other:?}"),
        }
        match emitter.data().op(second).op {
            Op::Add { src1, src2 } => {
                assert_eq!(src1, b);
                assert_eq!(src2, b);
            }
            ref other => panic!("unexpected {other:?}"),
        }
        assert_eq!(emitter.data().node(a).uses, 2);
        assert_eq!(emitter.data().node(b).uses, 2);
    }

    #[test]
    fn remove_releases_arguments() {
        let mut emitter = test_emitter();
        let block = emitter.create_code_node();
        emitter.start_block(block);
        let a = emitter.constant(OpSize::I32, 1);
        let sum = emitter.add(OpSize::I32, a, a);
        emitter.finish_block(block);

        emitter.remove(sum);
        assert_eq!(emitter.data().node(a).uses, 0);
        let ops: Vec<NodeId> = block_ops(emitter.data(), block).collect();
        assert!(!ops.contains(&sum));
    }

    #[test]
    fn multiple_blocks_chain() {
        let mut emitter = test_emitter();
        let first = emitter.create_code_node();
        let second = emitter.create_code_node();
        emitter.start_block(first);
        let value = emitter.constant(OpSize::I64, 7);
        let _ = value;
        emitter.jump(second);
        emitter.finish_block(first);
        emitter.start_block(second);
        emitter.finish_block(second);

        let collected: Vec<NodeId> = blocks(emitter.data()).collect();
        assert_eq!(collected, vec![first, second]);
    }
}
