//! Guest-instruction to IR lowering.
//!
//! `OpDispatchBuilder` walks a decoded region and invokes each row's
//! registered handler. Handlers read operands through `load_operand`,
//! compute with IR builder calls, and write through `store_operand`;
//! segment bases, ModRM address arithmetic, GPR/vector classing, and
//! TSO-aware memory selection all live here so handlers stay small.

mod alu;
mod flags;
mod flow;
mod memory;
mod system;
mod vector;

pub use flags::{DeferredFlags, FlagsOp};

use std::collections::HashMap;

use silex_ir::{BreakDefinition, CondCode, IrEmitter, NodeId, OpSize, RegClass};
use silex_types::x86::{traps, Segment};
use silex_types::{offsets, NUM_GPRS};

use crate::decoder::{DecodedBlocks, DecodedInst, DecodedOperand, MemOperand};

/// Handlers referenced by the instruction tables.
pub mod handlers {
    pub use super::alu::*;
    pub use super::flow::*;
    pub use super::memory::*;
    pub use super::system::*;
    pub use super::vector::*;
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("instruction at {rip:#x} is not supported: {detail}")]
    Unsupported { rip: u64, detail: &'static str },
}

/// Self-modifying-code guard emitted at the region head: the first bytes of
/// the entry block, captured at decode time.
#[derive(Clone, Copy, Debug)]
pub struct ValidateEntry {
    pub original: [u8; 16],
    pub length: u8,
}

#[derive(Clone, Copy, Debug)]
pub struct TranslationConfig {
    /// Emit TSO-ordered memory ops so guest threads observe x86 ordering.
    pub tso_enabled: bool,
    /// Upgrade every guest access to fully fenced variants.
    pub paranoid_tso: bool,
    /// Emit a code checksum guard at the entry block.
    pub validate_entry: Option<ValidateEntry>,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        TranslationConfig { tso_enabled: true, paranoid_tso: false, validate_entry: None }
    }
}

/// Number of cached register slots: 16 GPRs plus the PF/AF synthetics.
const CACHE_SLOTS: usize = NUM_GPRS + 2;

pub struct OpDispatchBuilder<'a> {
    pub ir: &'a mut IrEmitter,
    pub(crate) config: TranslationConfig,
    /// Guest RIP -> CodeBlock node for every decoded block entry.
    blocks: HashMap<u64, NodeId>,
    /// Exit stubs for jump targets that fell outside the region.
    exit_stubs: HashMap<u64, NodeId>,
    current_block: NodeId,
    block_terminated: bool,
    pub(crate) current_rip: u64,
    pub(crate) next_rip: u64,
    /// Full-width values known to sit in guest registers right now.
    pub(crate) gpr_cache: [Option<NodeId>; CACHE_SLOTS],
    pub(crate) flags: DeferredFlags,
}

/// Lower a decoded region into IR. The emitter's working list must be fresh.
pub fn translate_region(
    ir: &mut IrEmitter,
    region: &DecodedBlocks,
    config: TranslationConfig,
) -> Result<(), DispatchError> {
    let mut builder = OpDispatchBuilder {
        ir,
        config,
        blocks: HashMap::new(),
        exit_stubs: HashMap::new(),
        current_block: NodeId::INVALID,
        block_terminated: false,
        current_rip: 0,
        next_rip: 0,
        gpr_cache: [None; CACHE_SLOTS],
        flags: DeferredFlags::default(),
    };

    // Allocate every block node up front so branches resolve forward.
    for block in &region.blocks {
        let node = builder.ir.create_code_node();
        builder.blocks.insert(block.entry, node);
    }

    for block in &region.blocks {
        let node = builder.blocks[&block.entry];
        builder.ir.start_block(node);
        builder.current_block = node;
        builder.block_terminated = false;
        builder.gpr_cache = [None; CACHE_SLOTS];
        builder.flags = DeferredFlags::default();

        if block.entry == region.entry {
            if let Some(validate) = config.validate_entry {
                builder.emit_entry_validation(region.entry, validate);
            }
        }

        for inst in &block.instructions {
            builder.current_rip = inst.rip;
            builder.next_rip = inst.next_rip();
            match inst.info.handler {
                Some(handler) => handler(&mut builder, inst)?,
                None => builder.emit_trap(inst.rip, traps::SIGILL, traps::TRAP_UD),
            }
            if builder.block_terminated {
                break;
            }
        }

        if !builder.block_terminated {
            if let Some(bad_rip) = block.invalid_tail {
                builder.emit_trap(bad_rip, traps::SIGILL, traps::TRAP_UD);
            } else {
                builder.exit_to_constant_rip(block.fallthrough_rip());
            }
        }
        let current = builder.current_block;
        builder.ir.finish_block(current);
    }

    // Bodies for exits to RIPs the region never decoded.
    let stubs: Vec<(u64, NodeId)> =
        builder.exit_stubs.iter().map(|(&rip, &node)| (rip, node)).collect();
    for (rip, node) in stubs {
        builder.ir.start_block(node);
        builder.current_block = node;
        let target = builder.ir.constant(OpSize::I64, rip);
        builder.ir.exit_function(target);
        builder.ir.finish_block(node);
    }

    Ok(())
}

impl<'a> OpDispatchBuilder<'a> {
    // ------------------------------------------------------------------
    // Guest register access with a per-block cache.

    pub(crate) fn load_gpr64(&mut self, reg: u32) -> NodeId {
        if let Some(node) = self.gpr_cache[reg as usize] {
            return node;
        }
        let node = self.ir.load_register(OpSize::I64, RegClass::Gpr, reg);
        self.gpr_cache[reg as usize] = Some(node);
        node
    }

    pub(crate) fn store_gpr64(&mut self, reg: u32, value: NodeId) {
        self.ir.store_register(OpSize::I64, RegClass::Gpr, reg, value);
        self.gpr_cache[reg as usize] = Some(value);
    }

    /// Read a guest GPR at `size`, optionally the legacy high byte.
    pub(crate) fn read_gpr(&mut self, reg: u32, size: OpSize, high: bool) -> NodeId {
        let full = self.load_gpr64(reg);
        if high {
            return self.ir.bfe(OpSize::I8, full, 8, 8);
        }
        match size {
            OpSize::I64 => full,
            size => self.ir.bfe(size, full, 0, size.bits() as u8),
        }
    }

    /// Write a guest GPR with x86 merge semantics: 32-bit writes zero the
    /// upper half, narrower writes preserve it.
    pub(crate) fn write_gpr(&mut self, reg: u32, size: OpSize, high: bool, value: NodeId) {
        let merged = if high {
            let full = self.load_gpr64(reg);
            self.ir.bfi(OpSize::I64, full, value, 8, 8)
        } else {
            match size {
                OpSize::I64 => value,
                OpSize::I32 => self.ir.bfe(OpSize::I64, value, 0, 32),
                size => {
                    let full = self.load_gpr64(reg);
                    self.ir.bfi(OpSize::I64, full, value, 0, size.bits() as u8)
                }
            }
        };
        self.store_gpr64(reg, merged);
    }

    pub(crate) fn load_xmm(&mut self, reg: u32) -> NodeId {
        self.ir.load_register(OpSize::I128, RegClass::Fpr, reg)
    }

    pub(crate) fn store_xmm(&mut self, reg: u32, value: NodeId) {
        self.ir.store_register(OpSize::I128, RegClass::Fpr, reg, value);
    }

    // ------------------------------------------------------------------
    // Addressing and memory.

    /// Compute the effective address of a decoded memory operand, segment
    /// base included.
    pub(crate) fn mem_address(&mut self, inst: &DecodedInst, mem: &MemOperand) -> NodeId {
        let mut addr = if mem.rip_relative {
            self.ir
                .constant(OpSize::I64, self.next_rip.wrapping_add(mem.disp as u64))
        } else {
            let mut parts: Option<NodeId> = None;
            if let Some(base) = mem.base {
                parts = Some(self.load_gpr64(base));
            }
            if let Some(index) = mem.index {
                let mut index_value = self.load_gpr64(index);
                if mem.scale > 1 {
                    let amount =
                        self.ir.constant(OpSize::I64, u64::from(mem.scale.trailing_zeros()));
                    index_value = self.ir.lshl(OpSize::I64, index_value, amount);
                }
                parts = Some(match parts {
                    Some(base) => self.ir.add(OpSize::I64, base, index_value),
                    None => index_value,
                });
            }
            let base = match parts {
                Some(node) => node,
                None => self.ir.constant(OpSize::I64, 0),
            };
            if mem.disp != 0 {
                let disp = self.ir.constant(OpSize::I64, mem.disp as u64);
                self.ir.add(OpSize::I64, base, disp)
            } else {
                base
            }
        };

        if inst.address_size == OpSize::I32 {
            addr = self.ir.bfe(OpSize::I64, addr, 0, 32);
        }

        match inst.segment_override {
            Some(Segment::Fs) => {
                let base =
                    self.ir
                        .load_context(OpSize::I64, RegClass::Gpr, offsets::fs_cached());
                self.ir.add(OpSize::I64, addr, base)
            }
            Some(Segment::Gs) => {
                let base =
                    self.ir
                        .load_context(OpSize::I64, RegClass::Gpr, offsets::gs_cached());
                self.ir.add(OpSize::I64, addr, base)
            }
            // ES/CS/SS/DS bases are architecturally zero in long mode.
            _ => addr,
        }
    }

    pub(crate) fn mem_load(&mut self, class: RegClass, size: OpSize, addr: NodeId) -> NodeId {
        if self.config.tso_enabled || self.config.paranoid_tso {
            self.ir.load_mem_tso(class, size, addr, 1)
        } else {
            self.ir.load_mem(class, size, addr, 1)
        }
    }

    pub(crate) fn mem_store(
        &mut self,
        class: RegClass,
        size: OpSize,
        addr: NodeId,
        value: NodeId,
    ) {
        if self.config.tso_enabled || self.config.paranoid_tso {
            self.ir.store_mem_tso(class, size, addr, value, 1);
        } else {
            self.ir.store_mem(class, size, addr, value, 1);
        }
    }

    // ------------------------------------------------------------------
    // Operand plumbing.

    /// Load a source operand as a GPR-class value of `size`.
    pub(crate) fn load_operand(
        &mut self,
        inst: &DecodedInst,
        operand: &DecodedOperand,
        size: OpSize,
    ) -> NodeId {
        match operand {
            DecodedOperand::Reg { num } => self.read_gpr(*num, size, false),
            DecodedOperand::RegHigh { num } => self.read_gpr(*num, size, true),
            DecodedOperand::Mem(mem) => {
                let addr = self.mem_address(inst, mem);
                self.mem_load(RegClass::Gpr, size, addr)
            }
            DecodedOperand::None => unreachable!("load from absent operand"),
        }
    }

    /// Store to a destination operand.
    pub(crate) fn store_operand(
        &mut self,
        inst: &DecodedInst,
        operand: &DecodedOperand,
        size: OpSize,
        value: NodeId,
    ) {
        match operand {
            DecodedOperand::Reg { num } => self.write_gpr(*num, size, false, value),
            DecodedOperand::RegHigh { num } => self.write_gpr(*num, size, true, value),
            DecodedOperand::Mem(mem) => {
                let addr = self.mem_address(inst, mem);
                self.mem_store(RegClass::Gpr, size, addr, value);
            }
            DecodedOperand::None => unreachable!("store to absent operand"),
        }
    }

    /// Reclassify a register operand for a byte-wide access narrower than
    /// the instruction's operand size (movzx/movsx sources): without REX,
    /// encodings 4..=7 are the legacy high bytes.
    pub(crate) fn byte_operand(
        &self,
        inst: &DecodedInst,
        operand: &DecodedOperand,
    ) -> DecodedOperand {
        match operand {
            DecodedOperand::Reg { num } if !inst.has_rex && (4..8).contains(num) => {
                DecodedOperand::RegHigh { num: *num - 4 }
            }
            other => *other,
        }
    }

    /// Load a vector operand (register or 128-bit memory).
    pub(crate) fn load_xmm_operand(
        &mut self,
        inst: &DecodedInst,
        operand: &DecodedOperand,
        size: OpSize,
    ) -> NodeId {
        match operand {
            DecodedOperand::Reg { num } => self.load_xmm(*num),
            DecodedOperand::Mem(mem) => {
                let addr = self.mem_address(inst, mem);
                self.mem_load(RegClass::Fpr, size, addr)
            }
            _ => unreachable!("vector operand"),
        }
    }

    pub(crate) fn store_xmm_operand(
        &mut self,
        inst: &DecodedInst,
        operand: &DecodedOperand,
        size: OpSize,
        value: NodeId,
    ) {
        match operand {
            DecodedOperand::Reg { num } => self.store_xmm(*num, value),
            DecodedOperand::Mem(mem) => {
                let addr = self.mem_address(inst, mem);
                self.mem_store(RegClass::Fpr, size, addr, value);
            }
            _ => unreachable!("vector operand"),
        }
    }

    // ------------------------------------------------------------------
    // Block structure helpers.

    /// CodeBlock node for a guest RIP: the decoded block if the region has
    /// one, otherwise a shared exit stub.
    pub(crate) fn target_block(&mut self, rip: u64) -> NodeId {
        if let Some(&node) = self.blocks.get(&rip) {
            return node;
        }
        if let Some(&node) = self.exit_stubs.get(&rip) {
            return node;
        }
        let node = self.ir.create_code_node();
        self.exit_stubs.insert(rip, node);
        node
    }

    /// Prepare to leave the current block: flush lazy state that must not
    /// cross block boundaries.
    pub(crate) fn flush_block_state(&mut self) {
        self.rectify_cf();
        self.gpr_cache = [None; CACHE_SLOTS];
    }

    /// Unconditional transfer to a guest RIP.
    pub(crate) fn jump_to_rip(&mut self, rip: u64) {
        self.flush_block_state();
        let target = self.target_block(rip);
        self.ir.jump(target);
        self.block_terminated = true;
    }

    /// Conditional transfer: `cond(lhs, rhs)` chooses `true_rip`.
    pub(crate) fn cond_jump_to_rips(
        &mut self,
        cond: CondCode,
        compare_size: OpSize,
        lhs: NodeId,
        rhs: NodeId,
        true_rip: u64,
        false_rip: u64,
    ) {
        self.flush_block_state();
        let true_block = self.target_block(true_rip);
        let false_block = self.target_block(false_rip);
        self.ir
            .cond_jump(cond, compare_size, lhs, rhs, true_block, false_block);
        self.block_terminated = true;
    }

    /// Leave the region for a computed RIP.
    pub(crate) fn exit_to_rip_value(&mut self, rip: NodeId) {
        self.flush_block_state();
        self.ir.exit_function(rip);
        self.block_terminated = true;
    }

    pub(crate) fn exit_to_constant_rip(&mut self, rip: u64) {
        let target = self.ir.constant(OpSize::I64, rip);
        self.exit_to_rip_value(target);
    }

    /// Plant a guest trap at `rip`.
    pub(crate) fn emit_trap(&mut self, rip: u64, signal: u8, trap_number: u8) {
        self.flush_block_state();
        let rip_value = self.ir.constant(OpSize::I64, rip);
        self.ir
            .store_context(OpSize::I64, RegClass::Gpr, offsets::rip(), rip_value);
        self.ir.break_op(BreakDefinition {
            signal,
            trap_number,
            si_code: 0,
            error_register: 0,
        });
        self.block_terminated = true;
    }

    /// Emit the self-modifying-code guard: compare the entry bytes against
    /// their compile-time capture and evict the block on mismatch.
    fn emit_entry_validation(&mut self, entry_rip: u64, validate: ValidateEntry) {
        let lo = u64::from_le_bytes(validate.original[0..8].try_into().expect("lo"));
        let hi = u64::from_le_bytes(validate.original[8..16].try_into().expect("hi"));
        let result = self.ir.validate_code(0, lo, hi, validate.length);
        let zero = self.ir.constant(OpSize::I32, 0);
        let evict = self.new_internal_block();
        let body = self.new_internal_block();
        self.cond_jump_to_blocks(CondCode::Neq, OpSize::I32, result, zero, evict, body);
        self.continue_in_block(evict);
        self.ir.remove_code_entry(entry_rip);
        self.exit_to_constant_rip(entry_rip);
        self.continue_in_block(body);
    }

    /// Split the current guest block for handler-internal control flow
    /// (rep loops, divide checks). Returns a fresh unstarted block chained
    /// after the current one.
    pub(crate) fn new_internal_block(&mut self) -> NodeId {
        let current = self.current_block;
        self.ir.create_new_code_block_after(current)
    }

    /// Terminate the current block with a jump to `target` and continue
    /// emission inside `next` (which must be unstarted).
    pub(crate) fn continue_in_block(&mut self, next: NodeId) {
        debug_assert!(self.block_terminated);
        let current = self.current_block;
        self.ir.finish_block(current);
        self.ir.start_block(next);
        self.current_block = next;
        self.block_terminated = false;
        self.gpr_cache = [None; CACHE_SLOTS];
        self.flags = DeferredFlags::default();
    }

    /// Jump to an internal block node (not a guest RIP).
    pub(crate) fn jump_to_block(&mut self, target: NodeId) {
        self.flush_block_state();
        self.ir.jump(target);
        self.block_terminated = true;
    }

    pub(crate) fn cond_jump_to_blocks(
        &mut self,
        cond: CondCode,
        compare_size: OpSize,
        lhs: NodeId,
        rhs: NodeId,
        true_block: NodeId,
        false_block: NodeId,
    ) {
        self.flush_block_state();
        self.ir
            .cond_jump(cond, compare_size, lhs, rhs, true_block, false_block);
        self.block_terminated = true;
    }

    /// Operand size helper honoring the REX.W distinction for instructions
    /// whose memory width tracks it.
    pub(crate) fn gpr_size(&self, inst: &DecodedInst) -> OpSize {
        inst.operand_size
    }

    pub(crate) fn unsupported(
        &self,
        inst: &DecodedInst,
        detail: &'static str,
    ) -> DispatchError {
        DispatchError::Unsupported { rip: inst.rip, detail }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{Decoder, SliceStream};
    use silex_ir::passes::{IrValidation, Pass};
    use silex_ir::pool::IntrusivePooledAllocator;
    use silex_ir::{IrStore, Op};

    fn translate(bytes: &[u8], base: u64) -> IrEmitter {
        let mut emitter = IrEmitter::new(IntrusivePooledAllocator::new_heap());
        let stream = SliceStream { base, bytes };
        let region = Decoder::new(&stream).decode_region(base, 512);
        translate_region(&mut emitter, &region, TranslationConfig::default())
            .expect("translate");
        emitter
    }

    #[test]
    fn mov_hlt_region_validates() {
        // S1 shape: mov rax, 42; hlt
        let mut emitter = translate(&[0x48, 0xc7, 0xc0, 0x2a, 0x00, 0x00, 0x00, 0xf4], 0x1000);
        IrValidation::new().run(&mut emitter).expect("valid IR");
    }

    #[test]
    fn arithmetic_branch_region_validates() {
        // S2 bytes.
        let bytes = [
            0xbe, 0x05, 0x00, 0x00, 0x00, 0xbf, 0x03, 0x00, 0x00, 0x00, 0x01, 0xfe, 0x39, 0xf7,
            0x74, 0x02, 0xeb, 0xfe, 0xf4,
        ];
        let mut emitter = translate(&bytes, 0x2000);
        IrValidation::new().run(&mut emitter).expect("valid IR");

        // The region must contain a conditional jump and a halting break.
        let mut saw_cond_jump = false;
        let mut saw_break = false;
        for block in silex_ir::blocks(emitter.data()) {
            for node in silex_ir::block_ops(emitter.data(), block) {
                match emitter.data().op(node).op {
                    Op::CondJump { .. } => saw_cond_jump = true,
                    Op::Break { reason } => {
                        saw_break |= reason.trap_number == traps::TRAP_HLT;
                    }
                    _ => {}
                }
            }
        }
        assert!(saw_cond_jump);
        assert!(saw_break);
    }

    #[test]
    fn unknown_opcode_lowers_to_sigill_trap() {
        let emitter = translate(&[0x90, 0x82, 0x00], 0);
        let mut saw_sigill = false;
        for block in silex_ir::blocks(emitter.data()) {
            for node in silex_ir::block_ops(emitter.data(), block) {
                if let Op::Break { reason } = emitter.data().op(node).op {
                    saw_sigill |= reason.signal == traps::SIGILL;
                }
            }
        }
        assert!(saw_sigill);
    }
}
