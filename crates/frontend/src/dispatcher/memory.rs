//! Data movement: moves, LEA, stack traffic, and string operations.

use silex_ir::{CondCode, NodeId, OpSize, RegClass};
use silex_types::x86;

use crate::decoder::{DecodedInst, DecodedOperand};
use crate::dispatcher::{DispatchError, OpDispatchBuilder};
use crate::tables::InstFlags;

pub(crate) fn op_mov(b: &mut OpDispatchBuilder, inst: &DecodedInst) -> Result<(), DispatchError> {
    let size = inst.operand_size;
    let (dest_op, src_op) = if inst.flags.contains(InstFlags::MODRM_DST) {
        (inst.rm, inst.reg_op)
    } else {
        (inst.reg_op, inst.rm)
    };
    let value = b.load_operand(inst, &src_op, size);
    b.store_operand(inst, &dest_op, size, value);
    Ok(())
}

pub(crate) fn op_mov_reg_imm(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    let size = inst.operand_size;
    let value = b.ir.constant(size, inst.imm);
    // B4..B7 without REX name the legacy high bytes.
    if size == OpSize::I8 && !inst.has_rex && (4..8).contains(&inst.opcode_reg) {
        b.write_gpr(inst.opcode_reg - 4, size, true, value);
    } else {
        b.write_gpr(inst.opcode_reg, size, false, value);
    }
    Ok(())
}

pub(crate) fn op_mov_rm_imm(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    let size = inst.operand_size;
    let value = b.ir.constant(size, inst.imm);
    b.store_operand(inst, &inst.rm, size, value);
    Ok(())
}

pub(crate) fn op_lea(b: &mut OpDispatchBuilder, inst: &DecodedInst) -> Result<(), DispatchError> {
    let DecodedOperand::Mem(mem) = inst.rm else {
        return Err(b.unsupported(inst, "LEA with register source"));
    };
    // LEA is pure address arithmetic: no segment base applies.
    let mut stripped = inst.clone();
    stripped.segment_override = None;
    let addr = b.mem_address(&stripped, &mem);
    let size = inst.operand_size;
    let value = if size == OpSize::I64 {
        addr
    } else {
        b.ir.bfe(size, addr, 0, size.bits() as u8)
    };
    b.store_operand(inst, &inst.reg_op, size, value);
    Ok(())
}

impl<'a> OpDispatchBuilder<'a> {
    pub(crate) fn push_value(&mut self, value: NodeId) {
        let rsp = self.load_gpr64(x86::gpr::RSP);
        let amount = self.ir.constant(OpSize::I64, 8);
        let new_rsp = self.ir.sub(OpSize::I64, rsp, amount);
        self.mem_store(RegClass::Gpr, OpSize::I64, new_rsp, value);
        self.store_gpr64(x86::gpr::RSP, new_rsp);
    }

    pub(crate) fn pop_value(&mut self) -> NodeId {
        let rsp = self.load_gpr64(x86::gpr::RSP);
        let value = self.mem_load(RegClass::Gpr, OpSize::I64, rsp);
        let amount = self.ir.constant(OpSize::I64, 8);
        let new_rsp = self.ir.add(OpSize::I64, rsp, amount);
        self.store_gpr64(x86::gpr::RSP, new_rsp);
        value
    }
}

pub(crate) fn op_push_reg(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    let value = b.load_gpr64(inst.opcode_reg);
    b.push_value(value);
    Ok(())
}

pub(crate) fn op_pop_reg(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    let value = b.pop_value();
    b.store_gpr64(inst.opcode_reg, value);
    Ok(())
}

pub(crate) fn op_push_imm(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    let value = b.ir.constant(OpSize::I64, inst.imm);
    b.push_value(value);
    Ok(())
}

pub(crate) fn op_push_rm(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    let value = b.load_operand(inst, &inst.rm, OpSize::I64);
    b.push_value(value);
    Ok(())
}

pub(crate) fn op_pop_rm(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    let value = b.pop_value();
    b.store_operand(inst, &inst.rm, OpSize::I64, value);
    Ok(())
}

pub(crate) fn op_leave(
    b: &mut OpDispatchBuilder,
    _inst: &DecodedInst,
) -> Result<(), DispatchError> {
    let rbp = b.load_gpr64(x86::gpr::RBP);
    b.store_gpr64(x86::gpr::RSP, rbp);
    let value = b.pop_value();
    b.store_gpr64(x86::gpr::RBP, value);
    Ok(())
}

/// Direction-flag step: +size or -size as a 64-bit value. DF is stored
/// internally as 1 (forward) or 0xff (backward).
fn string_step(b: &mut OpDispatchBuilder, size: OpSize) -> NodeId {
    let df = b.ir.load_flag(x86::FLAG_DF_RAW as u32);
    let one = b.ir.constant(OpSize::I8, 1);
    let forward = b.ir.constant(OpSize::I64, size.bytes() as u64);
    let backward = b.ir.constant(OpSize::I64, (size.bytes() as u64).wrapping_neg());
    b.ir
        .select(OpSize::I64, CondCode::Eq, OpSize::I8, df, one, forward, backward)
}

fn movs_once(b: &mut OpDispatchBuilder, size: OpSize) {
    let rsi = b.load_gpr64(x86::gpr::RSI);
    let rdi = b.load_gpr64(x86::gpr::RDI);
    let value = b.mem_load(RegClass::Gpr, size, rsi);
    b.mem_store(RegClass::Gpr, size, rdi, value);
    let step = string_step(b, size);
    let new_rsi = b.ir.add(OpSize::I64, rsi, step);
    let new_rdi = b.ir.add(OpSize::I64, rdi, step);
    b.store_gpr64(x86::gpr::RSI, new_rsi);
    b.store_gpr64(x86::gpr::RDI, new_rdi);
}

fn stos_once(b: &mut OpDispatchBuilder, size: OpSize) {
    let rdi = b.load_gpr64(x86::gpr::RDI);
    let value = b.read_gpr(x86::gpr::RAX, size, false);
    b.mem_store(RegClass::Gpr, size, rdi, value);
    let step = string_step(b, size);
    let new_rdi = b.ir.add(OpSize::I64, rdi, step);
    b.store_gpr64(x86::gpr::RDI, new_rdi);
}

/// Shared REP skeleton: loop on RCX until it reaches zero, running `body`
/// once per iteration, then continue in a fresh block.
fn rep_loop(
    b: &mut OpDispatchBuilder,
    size: OpSize,
    body: fn(&mut OpDispatchBuilder, OpSize),
) {
    let head = b.new_internal_block();
    let loop_body = b.new_internal_block();
    let done = b.new_internal_block();

    b.jump_to_block(head);

    b.continue_in_block(head);
    let rcx = b.load_gpr64(x86::gpr::RCX);
    let zero = b.ir.constant(OpSize::I64, 0);
    b.cond_jump_to_blocks(CondCode::Eq, OpSize::I64, rcx, zero, done, loop_body);

    b.continue_in_block(loop_body);
    body(b, size);
    let rcx = b.load_gpr64(x86::gpr::RCX);
    let one = b.ir.constant(OpSize::I64, 1);
    let next = b.ir.sub(OpSize::I64, rcx, one);
    b.store_gpr64(x86::gpr::RCX, next);
    b.jump_to_block(head);

    b.continue_in_block(done);
}

pub(crate) fn op_movs(b: &mut OpDispatchBuilder, inst: &DecodedInst) -> Result<(), DispatchError> {
    let size = inst.operand_size;
    if inst.rep.is_some() {
        rep_loop(b, size, movs_once);
    } else {
        movs_once(b, size);
    }
    Ok(())
}

pub(crate) fn op_stos(b: &mut OpDispatchBuilder, inst: &DecodedInst) -> Result<(), DispatchError> {
    let size = inst.operand_size;
    if inst.rep.is_some() {
        rep_loop(b, size, stos_once);
    } else {
        stos_once(b, size);
    }
    Ok(())
}

pub(crate) fn op_nop(
    _b: &mut OpDispatchBuilder,
    _inst: &DecodedInst,
) -> Result<(), DispatchError> {
    Ok(())
}
