//! The SSE subset: vector moves, integer lanes, scalar double arithmetic,
//! and int/float conversion.

use silex_ir::OpSize;
use silex_types::x86::traps;

use crate::decoder::{DecodedInst, DecodedOperand};
use crate::dispatcher::{DispatchError, OpDispatchBuilder};
use crate::tables::InstFlags;

pub(crate) fn op_movups(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    if inst.flags.contains(InstFlags::MODRM_DST) {
        let value = b.load_xmm_operand(inst, &inst.reg_op, OpSize::I128);
        b.store_xmm_operand(inst, &inst.rm, OpSize::I128, value);
    } else {
        let value = b.load_xmm_operand(inst, &inst.rm, OpSize::I128);
        b.store_xmm_operand(inst, &inst.reg_op, OpSize::I128, value);
    }
    Ok(())
}

pub(crate) fn op_xorps(b: &mut OpDispatchBuilder, inst: &DecodedInst) -> Result<(), DispatchError> {
    let lhs = b.load_xmm_operand(inst, &inst.reg_op, OpSize::I128);
    let rhs = b.load_xmm_operand(inst, &inst.rm, OpSize::I128);
    let res = b.ir.vxor(OpSize::I128, lhs, rhs);
    b.store_xmm_operand(inst, &inst.reg_op, OpSize::I128, res);
    Ok(())
}

pub(crate) fn op_pxor(b: &mut OpDispatchBuilder, inst: &DecodedInst) -> Result<(), DispatchError> {
    // PXOR requires the 66h SSE2 form; the bare encoding is MMX.
    if inst.operand_size != OpSize::I16 {
        b.emit_trap(inst.rip, traps::SIGILL, traps::TRAP_UD);
        return Ok(());
    }
    op_xorps(b, inst)
}

pub(crate) fn op_paddd(b: &mut OpDispatchBuilder, inst: &DecodedInst) -> Result<(), DispatchError> {
    if inst.operand_size != OpSize::I16 {
        b.emit_trap(inst.rip, traps::SIGILL, traps::TRAP_UD);
        return Ok(());
    }
    let lhs = b.load_xmm_operand(inst, &inst.reg_op, OpSize::I128);
    let rhs = b.load_xmm_operand(inst, &inst.rm, OpSize::I128);
    let res = b.ir.vadd(OpSize::I128, OpSize::I32, lhs, rhs);
    b.store_xmm_operand(inst, &inst.reg_op, OpSize::I128, res);
    Ok(())
}

pub(crate) fn op_movd_to_xmm(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    if inst.operand_size != OpSize::I16 && inst.operand_size != OpSize::I64 {
        // Without 66h this is the MMX form.
        b.emit_trap(inst.rip, traps::SIGILL, traps::TRAP_UD);
        return Ok(());
    }
    let gpr_size = if inst.operand_size == OpSize::I64 { OpSize::I64 } else { OpSize::I32 };
    let value = b.load_operand(inst, &inst.rm, gpr_size);
    let DecodedOperand::Reg { num } = inst.reg_op else { unreachable!() };
    let vec = b.ir.vcast_from_gpr(OpSize::I128, gpr_size, value);
    b.store_xmm(num, vec);
    Ok(())
}

pub(crate) fn op_movd_from_xmm(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    // F3 0F 7E is MOVQ (load 64 bits into the low lane).
    if inst.rep == Some(true) {
        let DecodedOperand::Reg { num } = inst.reg_op else { unreachable!() };
        let value = match inst.rm {
            DecodedOperand::Reg { num: src } => {
                let vec = b.load_xmm(src);
                b.ir.vextract_to_gpr(OpSize::I64, OpSize::I64, vec, 0)
            }
            DecodedOperand::Mem(mem) => {
                let addr = b.mem_address(inst, &mem);
                b.mem_load(silex_ir::RegClass::Gpr, OpSize::I64, addr)
            }
            _ => unreachable!(),
        };
        let vec = b.ir.vcast_from_gpr(OpSize::I128, OpSize::I64, value);
        b.store_xmm(num, vec);
        return Ok(());
    }
    if inst.operand_size != OpSize::I16 && inst.operand_size != OpSize::I64 {
        b.emit_trap(inst.rip, traps::SIGILL, traps::TRAP_UD);
        return Ok(());
    }
    let gpr_size = if inst.operand_size == OpSize::I64 { OpSize::I64 } else { OpSize::I32 };
    let DecodedOperand::Reg { num } = inst.reg_op else { unreachable!() };
    let vec = b.load_xmm(num);
    let value = b.ir.vextract_to_gpr(gpr_size, gpr_size, vec, 0);
    b.store_operand(inst, &inst.rm, gpr_size, value);
    Ok(())
}

/// ADDSD/SUBSD/MULSD/DIVSD: scalar double, upper lane preserved from the
/// destination.
pub(crate) fn op_sse_scalar(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    if inst.rep != Some(false) {
        // Only the F2 (double) forms are implemented.
        b.emit_trap(inst.rip, traps::SIGILL, traps::TRAP_UD);
        return Ok(());
    }
    let lhs = b.load_xmm_operand(inst, &inst.reg_op, OpSize::I128);
    let rhs = match inst.rm {
        DecodedOperand::Mem(mem) => {
            let addr = b.mem_address(inst, &mem);
            let bits = b.mem_load(silex_ir::RegClass::Gpr, OpSize::I64, addr);
            b.ir.vcast_from_gpr(OpSize::I128, OpSize::I64, bits)
        }
        _ => b.load_xmm_operand(inst, &inst.rm, OpSize::I128),
    };
    let res = match inst.opcode & 0xff {
        0x58 => b.ir.fadd(OpSize::I64, lhs, rhs),
        0x59 => b.ir.fmul(OpSize::I64, lhs, rhs),
        0x5c => b.ir.fsub(OpSize::I64, lhs, rhs),
        _ => b.ir.fdiv(OpSize::I64, lhs, rhs),
    };
    b.store_xmm_operand(inst, &inst.reg_op, OpSize::I128, res);
    Ok(())
}

pub(crate) fn op_cvtsi2sd(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    if inst.rep != Some(false) {
        b.emit_trap(inst.rip, traps::SIGILL, traps::TRAP_UD);
        return Ok(());
    }
    let int_size = if inst.operand_size == OpSize::I64 { OpSize::I64 } else { OpSize::I32 };
    let value = b.load_operand(inst, &inst.rm, int_size);
    let converted = b.ir.cvt_sint_to_f(OpSize::I64, int_size, value);
    // Scalar insert: replace the destination's low lane only.
    let bits = b.ir.vextract_to_gpr(OpSize::I64, OpSize::I64, converted, 0);
    let DecodedOperand::Reg { num } = inst.reg_op else { unreachable!() };
    let dest = b.load_xmm(num);
    let res = b.ir.vinsert_gpr(OpSize::I128, OpSize::I64, dest, bits, 0);
    b.store_xmm(num, res);
    Ok(())
}

pub(crate) fn op_cvttsd2si(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    if inst.rep != Some(false) {
        b.emit_trap(inst.rip, traps::SIGILL, traps::TRAP_UD);
        return Ok(());
    }
    let int_size = if inst.operand_size == OpSize::I64 { OpSize::I64 } else { OpSize::I32 };
    let src = match inst.rm {
        DecodedOperand::Mem(mem) => {
            let addr = b.mem_address(inst, &mem);
            let bits = b.mem_load(silex_ir::RegClass::Gpr, OpSize::I64, addr);
            b.ir.vcast_from_gpr(OpSize::I128, OpSize::I64, bits)
        }
        _ => b.load_xmm_operand(inst, &inst.rm, OpSize::I128),
    };
    let res = b.ir.cvt_f_to_sint(int_size, OpSize::I64, src);
    b.store_operand(inst, &inst.reg_op, int_size, res);
    Ok(())
}

/// UCOMISD: ZF/PF/CF from the compare, SF/OF/AF cleared.
pub(crate) fn op_ucomis(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    if inst.operand_size != OpSize::I16 {
        // 66h selects the double form; bare 0F 2E (UCOMISS) is not wired.
        b.emit_trap(inst.rip, traps::SIGILL, traps::TRAP_UD);
        return Ok(());
    }
    let lhs = b.load_xmm_operand(inst, &inst.reg_op, OpSize::I128);
    let rhs = match inst.rm {
        DecodedOperand::Mem(mem) => {
            let addr = b.mem_address(inst, &mem);
            let bits = b.mem_load(silex_ir::RegClass::Gpr, OpSize::I64, addr);
            b.ir.vcast_from_gpr(OpSize::I128, OpSize::I64, bits)
        }
        _ => b.load_xmm_operand(inst, &inst.rm, OpSize::I128),
    };
    // FCmp result: bit 0 unordered, bit 1 equal, bit 2 less-than.
    let cmp = b.ir.fcmp(OpSize::I64, lhs, rhs);
    let unordered = b.ir.bfe(OpSize::I32, cmp, 0, 1);
    let equal = b.ir.bfe(OpSize::I32, cmp, 1, 1);
    let less = b.ir.bfe(OpSize::I32, cmp, 2, 1);

    // ZF = equal | unordered, CF = less | unordered, PF = unordered.
    let zf = b.ir.or(OpSize::I32, equal, unordered);
    let cf = b.ir.or(OpSize::I32, less, unordered);
    let zero = b.ir.constant(OpSize::I32, 0);
    b.set_nzcv_direct(zero, zf, cf, zero);

    // PF raw encodes the desired bit directly: raw = PF ^ 1.
    let one = b.ir.constant(OpSize::I32, 1);
    let pf_raw = b.ir.xor(OpSize::I32, unordered, one);
    b.store_pf_raw(pf_raw);
    // AF = 0: a raw equal to the result byte cancels in the read-side xor.
    b.store_af_raw(pf_raw, zero);
    Ok(())
}
