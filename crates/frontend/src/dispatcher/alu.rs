//! Integer ALU, shift, multiply/divide, and compare-exchange lowering.

use silex_ir::{CondCode, NodeId, OpSize, RegClass};
use silex_types::x86::{self, traps};

use crate::decoder::{DecodedInst, DecodedOperand};
use crate::dispatcher::{DispatchError, OpDispatchBuilder};
use crate::tables::InstFlags;

/// Operation index shared by the 0x00-0x3f block and group 1.
#[derive(Clone, Copy, PartialEq, Eq)]
enum AluKind {
    Add = 0,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluKind {
    fn from_index(index: u8) -> AluKind {
        match index & 7 {
            0 => AluKind::Add,
            1 => AluKind::Or,
            2 => AluKind::Adc,
            3 => AluKind::Sbb,
            4 => AluKind::And,
            5 => AluKind::Sub,
            6 => AluKind::Xor,
            _ => AluKind::Cmp,
        }
    }
}

fn alu_operands(inst: &DecodedInst) -> (DecodedOperand, DecodedOperand) {
    if inst.flags.contains(InstFlags::MODRM_DST) {
        (inst.rm, inst.reg_op)
    } else {
        (inst.reg_op, inst.rm)
    }
}

fn alu_common(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
    kind: AluKind,
    dest_op: &DecodedOperand,
    src: NodeId,
) -> Result<(), DispatchError> {
    let size = inst.operand_size;

    // Locked memory forms go through the fetch atomics.
    if inst.lock && dest_op.is_mem() {
        let DecodedOperand::Mem(mem) = dest_op else { unreachable!() };
        let addr = b.mem_address(inst, mem);
        let old = match kind {
            AluKind::Add => b.ir.atomic_fetch_add(size, addr, src),
            AluKind::Sub => b.ir.atomic_fetch_sub(size, addr, src),
            AluKind::And => b.ir.atomic_fetch_and(size, addr, src),
            AluKind::Or => b.ir.atomic_fetch_or(size, addr, src),
            AluKind::Xor => b.ir.atomic_fetch_xor(size, addr, src),
            // Carry-involved locked forms are not lowered.
            _ => {
                b.emit_trap(inst.rip, traps::SIGILL, traps::TRAP_UD);
                return Ok(());
            }
        };
        match kind {
            AluKind::Add => {
                let res = b.ir.add(size, old, src);
                b.calculate_flags_add(size, res, old, src);
            }
            AluKind::Sub => {
                let res = b.ir.sub(size, old, src);
                b.calculate_flags_sub(size, res, old, src);
            }
            AluKind::And | AluKind::Or | AluKind::Xor => {
                let res = match kind {
                    AluKind::And => b.ir.and(size, old, src),
                    AluKind::Or => b.ir.or(size, old, src),
                    _ => b.ir.xor(size, old, src),
                };
                b.calculate_flags_logical(size, res, old, src);
            }
            _ => unreachable!(),
        }
        return Ok(());
    }

    let dest = b.load_operand(inst, dest_op, size);
    let res = match kind {
        AluKind::Add => {
            let res = b.ir.add(size, dest, src);
            b.calculate_flags_add(size, res, dest, src);
            res
        }
        AluKind::Or => {
            let res = b.ir.or(size, dest, src);
            b.calculate_flags_logical(size, res, dest, src);
            res
        }
        AluKind::And => {
            let res = b.ir.and(size, dest, src);
            b.calculate_flags_logical(size, res, dest, src);
            res
        }
        AluKind::Xor => {
            let res = b.ir.xor(size, dest, src);
            b.calculate_flags_logical(size, res, dest, src);
            res
        }
        AluKind::Sub | AluKind::Cmp => {
            let res = b.ir.sub(size, dest, src);
            b.calculate_flags_sub(size, res, dest, src);
            res
        }
        AluKind::Adc => {
            let cf = b.get_rflag(x86::FLAG_CF_RAW);
            let partial = b.ir.add(size, dest, src);
            let res = b.ir.add(size, partial, cf);
            // Two wrap opportunities; at most one fires.
            let carry1 = b.bit_value(CondCode::Ult, size, partial, dest);
            let carry2 = b.bit_value(CondCode::Ult, size, res, partial);
            let carry = b.ir.or(OpSize::I32, carry1, carry2);
            let zero = b.ir.constant(size, 0);
            let n = b.bit_value(CondCode::Slt, size, res, zero);
            let z = b.bit_value(CondCode::Eq, size, res, zero);
            let sx1 = b.ir.xor(size, dest, res);
            let sx2 = b.ir.xor(size, src, res);
            let both = b.ir.and(size, sx1, sx2);
            let v = b.ir.bfe(OpSize::I32, both, (size.bits() - 1) as u8, 1);
            b.store_pf_raw(res);
            b.store_af_raw(dest, src);
            b.set_nzcv_direct(n, z, carry, v);
            res
        }
        AluKind::Sbb => {
            let cf = b.get_rflag(x86::FLAG_CF_RAW);
            let partial = b.ir.sub(size, dest, src);
            let res = b.ir.sub(size, partial, cf);
            let borrow1 = b.bit_value(CondCode::Ult, size, dest, src);
            let borrow2 = b.bit_value(CondCode::Ult, size, partial, cf);
            let borrow = b.ir.or(OpSize::I32, borrow1, borrow2);
            let zero = b.ir.constant(size, 0);
            let n = b.bit_value(CondCode::Slt, size, res, zero);
            let z = b.bit_value(CondCode::Eq, size, res, zero);
            let sources = b.ir.xor(size, dest, src);
            let result = b.ir.xor(size, dest, res);
            let both = b.ir.and(size, sources, result);
            let v = b.ir.bfe(OpSize::I32, both, (size.bits() - 1) as u8, 1);
            b.store_pf_raw(res);
            b.store_af_raw(dest, src);
            b.set_nzcv_direct(n, z, borrow, v);
            res
        }
    };

    if kind != AluKind::Cmp {
        b.store_operand(inst, dest_op, size, res);
    }
    Ok(())
}

pub(crate) fn op_alu(b: &mut OpDispatchBuilder, inst: &DecodedInst) -> Result<(), DispatchError> {
    let kind = AluKind::from_index((inst.opcode >> 3) as u8);
    let (dest_op, src_op) = alu_operands(inst);
    let src = b.load_operand(inst, &src_op, inst.operand_size);
    alu_common(b, inst, kind, &dest_op, src)
}

pub(crate) fn op_alu_imm(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    let kind = AluKind::from_index(inst.modrm >> 3);
    let src = b.ir.constant(inst.operand_size, inst.imm);
    let dest_op = inst.rm;
    alu_common(b, inst, kind, &dest_op, src)
}

pub(crate) fn op_alu_acc_imm(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    let kind = AluKind::from_index((inst.opcode >> 3) as u8);
    let src = b.ir.constant(inst.operand_size, inst.imm);
    let dest_op = DecodedOperand::Reg { num: x86::gpr::RAX };
    alu_common(b, inst, kind, &dest_op, src)
}

pub(crate) fn op_test(b: &mut OpDispatchBuilder, inst: &DecodedInst) -> Result<(), DispatchError> {
    let size = inst.operand_size;
    let lhs = b.load_operand(inst, &inst.rm, size);
    let rhs = b.load_operand(inst, &inst.reg_op, size);
    let res = b.ir.and(size, lhs, rhs);
    b.calculate_flags_logical(size, res, lhs, rhs);
    Ok(())
}

pub(crate) fn op_test_acc_imm(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    let size = inst.operand_size;
    let lhs = b.read_gpr(x86::gpr::RAX, size, false);
    let rhs = b.ir.constant(size, inst.imm);
    let res = b.ir.and(size, lhs, rhs);
    b.calculate_flags_logical(size, res, lhs, rhs);
    Ok(())
}

pub(crate) fn op_incdec(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    let size = inst.operand_size;
    let decrement = (inst.modrm >> 3) & 7 == 1;
    // INC/DEC leave CF alone.
    let saved_cf = b.get_rflag(x86::FLAG_CF_RAW);
    let one = b.ir.constant(size, 1);

    let (old, res) = if inst.lock && inst.rm.is_mem() {
        let DecodedOperand::Mem(mem) = inst.rm else { unreachable!() };
        let addr = b.mem_address(inst, &mem);
        let old = if decrement {
            b.ir.atomic_fetch_sub(size, addr, one)
        } else {
            b.ir.atomic_fetch_add(size, addr, one)
        };
        let res = if decrement { b.ir.sub(size, old, one) } else { b.ir.add(size, old, one) };
        (old, res)
    } else {
        let old = b.load_operand(inst, &inst.rm, size);
        let res = if decrement { b.ir.sub(size, old, one) } else { b.ir.add(size, old, one) };
        b.store_operand(inst, &inst.rm, size, res);
        (old, res)
    };

    if decrement {
        b.calculate_flags_sub(size, res, old, one);
    } else {
        b.calculate_flags_add(size, res, old, one);
    }
    b.set_rflag(x86::FLAG_CF_RAW, saved_cf);
    Ok(())
}

pub(crate) fn op_shift(b: &mut OpDispatchBuilder, inst: &DecodedInst) -> Result<(), DispatchError> {
    let size = inst.operand_size;
    let bits = size.bits();
    let count_mask = if size == OpSize::I64 { 63 } else { 31 };
    let kind = (inst.modrm >> 3) & 7;

    // C0/C1 take an immediate count, D0/D1 shift by one, D2/D3 by CL.
    let imm_count = match inst.opcode {
        0xc0 | 0xc1 => Some((inst.imm as u8) & count_mask),
        0xd0 | 0xd1 => Some(1),
        _ => None,
    };

    if let Some(count) = imm_count {
        if count == 0 {
            return Ok(());
        }
        let dest = b.load_operand(inst, &inst.rm, size);
        let amount = b.ir.constant(size, u64::from(count));
        let effective = count % bits as u8;
        // The 5/6-bit count mask can exceed a narrow operand's width; the
        // architectural result is then fully shifted out.
        let overshoot = u32::from(count) >= bits;
        let flag_count = count.min((bits - 1) as u8).max(1);
        match kind {
            4 | 6 => {
                let res = if overshoot {
                    b.ir.constant(size, 0)
                } else {
                    b.ir.lshl(size, dest, amount)
                };
                b.calculate_flags_shift_left_immediate(size, res, dest, flag_count);
                b.store_operand(inst, &inst.rm, size, res);
            }
            5 => {
                let res = if overshoot {
                    b.ir.constant(size, 0)
                } else {
                    b.ir.lshr(size, dest, amount)
                };
                b.calculate_flags_shift_right_immediate(size, res, dest, flag_count);
                b.store_operand(inst, &inst.rm, size, res);
            }
            7 => {
                let res = if overshoot {
                    let sign_shift = b.ir.constant(size, u64::from(bits - 1));
                    b.ir.ashr(size, dest, sign_shift)
                } else {
                    b.ir.ashr(size, dest, amount)
                };
                b.calculate_flags_sign_shift_right_immediate(size, res, dest, flag_count);
                b.store_operand(inst, &inst.rm, size, res);
            }
            0 | 1 => {
                let res = if kind == 0 {
                    // rol n == ror (width - n)
                    let reverse =
                        b.ir.constant(size, u64::from(bits) - u64::from(effective));
                    b.ir.ror(size, dest, reverse)
                } else {
                    b.ir.ror(size, dest, amount)
                };
                b.store_operand(inst, &inst.rm, size, res);
                // Rotates only touch CF (and OF for single-bit forms).
                let cf = if kind == 0 {
                    b.ir.bfe(OpSize::I32, res, 0, 1)
                } else {
                    b.ir.bfe(OpSize::I32, res, (bits - 1) as u8, 1)
                };
                b.set_rflag(x86::FLAG_CF_RAW, cf);
                if count == 1 {
                    let msb = b.ir.bfe(OpSize::I32, res, (bits - 1) as u8, 1);
                    let of = if kind == 0 {
                        b.ir.xor(OpSize::I32, msb, cf)
                    } else {
                        let next = b.ir.bfe(OpSize::I32, res, (bits - 2) as u8, 1);
                        b.ir.xor(OpSize::I32, msb, next)
                    };
                    b.set_rflag(x86::FLAG_OF_RAW, of);
                }
            }
            _ => b.emit_trap(inst.rip, traps::SIGILL, traps::TRAP_UD),
        }
        return Ok(());
    }

    // Dynamic CL count: flags only change when the masked count is nonzero,
    // so merge old and new state with selects.
    let cl = b.read_gpr(x86::gpr::RCX, OpSize::I8, false);
    let mask = b.ir.constant(OpSize::I32, u64::from(count_mask));
    let count = b.ir.and(OpSize::I32, cl, mask);

    b.rectify_cf();
    let old_nzcv = b.ir.load_flag(x86::FLAG_NZCV as u32);
    let old_pf = b.load_raw_reg(silex_types::PF_AS_GREG);

    let dest = b.load_operand(inst, &inst.rm, size);
    // Compute in a domain wide enough that x86's 5/6-bit count masking
    // cannot collide with the IR shift's own masking.
    let wide = if size == OpSize::I64 { OpSize::I64 } else { OpSize::I32 };
    let (res_wide, new_cf) = match kind {
        4 | 6 => {
            let res = b.ir.lshl(wide, dest, count);
            // Last bit shifted out: bit (width - count) of the source.
            let width = b.ir.constant(OpSize::I32, u64::from(bits));
            let out_bit = b.ir.sub(OpSize::I32, width, count);
            let shifted = b.ir.lshr(wide, dest, out_bit);
            let one = b.ir.constant(OpSize::I32, 1);
            (res, b.ir.and(OpSize::I32, shifted, one))
        }
        5 | 7 => {
            let source = if kind == 7 {
                b.ir.sbfe(wide, dest, 0, bits as u8)
            } else {
                dest
            };
            let res = if kind == 7 {
                b.ir.ashr(wide, source, count)
            } else {
                b.ir.lshr(wide, source, count)
            };
            let one = b.ir.constant(OpSize::I32, 1);
            let below = b.ir.sub(OpSize::I32, count, one);
            let shifted = b.ir.lshr(wide, source, below);
            (res, b.ir.and(OpSize::I32, shifted, one))
        }
        0 | 1 => {
            let res = if kind == 0 {
                let width = b.ir.constant(OpSize::I32, u64::from(bits));
                let reverse = b.ir.sub(OpSize::I32, width, count);
                b.ir.ror(size, dest, reverse)
            } else {
                b.ir.ror(size, dest, count)
            };
            let cf = if kind == 0 {
                b.ir.bfe(OpSize::I32, res, 0, 1)
            } else {
                b.ir.bfe(OpSize::I32, res, (bits - 1) as u8, 1)
            };
            let zero = b.ir.constant(OpSize::I32, 0);
            let store_value =
                b.ir.select(size, CondCode::Eq, OpSize::I32, count, zero, dest, res);
            b.store_operand(inst, &inst.rm, size, store_value);
            let old_cf = b.get_rflag(x86::FLAG_CF_RAW);
            let merged =
                b.ir.select(OpSize::I32, CondCode::Eq, OpSize::I32, count, zero, old_cf, cf);
            b.set_rflag(x86::FLAG_CF_RAW, merged);
            return Ok(());
        }
        _ => {
            b.emit_trap(inst.rip, traps::SIGILL, traps::TRAP_UD);
            return Ok(());
        }
    };

    let res = b.ir.bfe(size, res_wide, 0, bits as u8);
    let zero32 = b.ir.constant(OpSize::I32, 0);
    let store_value = b.ir.select(size, CondCode::Eq, OpSize::I32, count, zero32, dest, res);
    b.store_operand(inst, &inst.rm, size, store_value);

    let zero = b.ir.constant(size, 0);
    let n = b.bit_value(CondCode::Slt, size, res, zero);
    let z = b.bit_value(CondCode::Eq, size, res, zero);
    let v = zero32;
    // Build the merged NZCV by hand so a zero count keeps every old bit.
    let new_nzcv = {
        let n_shift = b.ir.constant(OpSize::I32, u64::from(x86::NZCV_N_BIT));
        let z_shift = b.ir.constant(OpSize::I32, u64::from(x86::NZCV_Z_BIT));
        let c_shift = b.ir.constant(OpSize::I32, u64::from(x86::NZCV_C_BIT));
        let v_shift = b.ir.constant(OpSize::I32, u64::from(x86::NZCV_V_BIT));
        let n = b.ir.lshl(OpSize::I32, n, n_shift);
        let z = b.ir.lshl(OpSize::I32, z, z_shift);
        let c = b.ir.lshl(OpSize::I32, new_cf, c_shift);
        let v = b.ir.lshl(OpSize::I32, v, v_shift);
        let nz = b.ir.or(OpSize::I32, n, z);
        let cv = b.ir.or(OpSize::I32, c, v);
        b.ir.or(OpSize::I32, nz, cv)
    };
    let merged_nzcv =
        b.ir.select(OpSize::I32, CondCode::Eq, OpSize::I32, count, zero32, old_nzcv, new_nzcv);
    b.ir.store_flag(x86::FLAG_NZCV as u32, merged_nzcv);

    let new_pf = b.ir.bfe(OpSize::I32, res, 0, 8);
    let merged_pf =
        b.ir.select(OpSize::I32, CondCode::Eq, OpSize::I32, count, zero32, old_pf, new_pf);
    b.ir
        .store_register(OpSize::I32, RegClass::Gpr, silex_types::PF_AS_GREG, merged_pf);
    b.gpr_cache[silex_types::PF_AS_GREG as usize] = Some(merged_pf);
    Ok(())
}

pub(crate) fn op_group3(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    let size = inst.operand_size;
    let reg = (inst.modrm >> 3) & 7;
    match reg {
        0 | 1 => {
            let lhs = b.load_operand(inst, &inst.rm, size);
            let rhs = b.ir.constant(size, inst.imm);
            let res = b.ir.and(size, lhs, rhs);
            b.calculate_flags_logical(size, res, lhs, rhs);
        }
        2 => {
            if inst.lock && inst.rm.is_mem() {
                let DecodedOperand::Mem(mem) = inst.rm else { unreachable!() };
                let addr = b.mem_address(inst, &mem);
                let ones = b.ir.constant(size, u64::MAX);
                b.ir.atomic_xor(size, addr, ones);
            } else {
                let value = b.load_operand(inst, &inst.rm, size);
                let res = b.ir.not(size, value);
                b.store_operand(inst, &inst.rm, size, res);
            }
        }
        3 => {
            let zero = b.ir.constant(size, 0);
            if inst.lock && inst.rm.is_mem() {
                let DecodedOperand::Mem(mem) = inst.rm else { unreachable!() };
                let addr = b.mem_address(inst, &mem);
                // Flags derive from the value observed before the swap.
                let value = b.mem_load(RegClass::Gpr, size, addr);
                b.ir.atomic_neg(size, addr);
                let res = b.ir.neg(size, value);
                b.calculate_flags_sub(size, res, zero, value);
            } else {
                let value = b.load_operand(inst, &inst.rm, size);
                let res = b.ir.neg(size, value);
                b.store_operand(inst, &inst.rm, size, res);
                b.calculate_flags_sub(size, res, zero, value);
            }
        }
        4 | 5 => op_mul_common(b, inst, reg == 5)?,
        6 | 7 => op_div_common(b, inst, reg == 7)?,
        _ => unreachable!(),
    }
    Ok(())
}

fn op_mul_common(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
    signed: bool,
) -> Result<(), DispatchError> {
    let size = inst.operand_size;
    let src = b.load_operand(inst, &inst.rm, size);

    if size == OpSize::I8 {
        // AX = AL * r/m8; the high byte rides along in AX.
        let acc = b.read_gpr(x86::gpr::RAX, OpSize::I8, false);
        let (wide_acc, wide_src) = if signed {
            (b.ir.sbfe(OpSize::I16, acc, 0, 8), b.ir.sbfe(OpSize::I16, src, 0, 8))
        } else {
            (b.ir.bfe(OpSize::I16, acc, 0, 8), b.ir.bfe(OpSize::I16, src, 0, 8))
        };
        let full = b.ir.mul(OpSize::I16, wide_acc, wide_src);
        b.write_gpr(x86::gpr::RAX, OpSize::I16, false, full);
        let high = b.ir.bfe(OpSize::I8, full, 8, 8);
        let low = b.ir.bfe(OpSize::I8, full, 0, 8);
        if signed {
            b.calculate_flags_mul(OpSize::I8, low, high);
        } else {
            b.calculate_flags_umul(OpSize::I8, low, high);
        }
        return Ok(());
    }

    let acc = b.read_gpr(x86::gpr::RAX, size, false);
    let (low, high) = if signed {
        (b.ir.mul(size, acc, src), b.ir.mulh(size, acc, src))
    } else {
        (b.ir.umul(size, acc, src), b.ir.umulh(size, acc, src))
    };
    b.write_gpr(x86::gpr::RAX, size, false, low);
    b.write_gpr(x86::gpr::RDX, size, false, high);
    if signed {
        b.calculate_flags_mul(size, low, high);
    } else {
        b.calculate_flags_umul(size, low, high);
    }
    Ok(())
}

fn op_div_common(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
    signed: bool,
) -> Result<(), DispatchError> {
    let size = inst.operand_size;
    let bits = size.bits();

    // Divide-by-zero raises #DE before anything is written.
    let src = b.load_operand(inst, &inst.rm, size);
    let zero = b.ir.constant(size, 0);
    let trap = b.new_internal_block();
    let resume = b.new_internal_block();
    b.cond_jump_to_blocks(CondCode::Eq, size, src, zero, trap, resume);
    b.continue_in_block(trap);
    b.emit_trap(b.current_rip, traps::SIGFPE, traps::TRAP_DE);
    b.continue_in_block(resume);

    // Values do not cross blocks; reload everything on the resume path.
    let src = b.load_operand(inst, &inst.rm, size);

    let (quotient, remainder) = if size == OpSize::I64 {
        // 64-bit dividends only; a full 128/64 divide goes through the
        // runtime's divide helpers.
        let low = b.read_gpr(x86::gpr::RAX, size, false);
        if signed {
            (b.ir.div(OpSize::I64, low, src), b.ir.rem(OpSize::I64, low, src))
        } else {
            (b.ir.udiv(OpSize::I64, low, src), b.ir.urem(OpSize::I64, low, src))
        }
    } else {
        // The dividend is DX:AX / EDX:EAX, except the byte form which
        // divides all of AX.
        let dividend = if size == OpSize::I8 {
            b.read_gpr(x86::gpr::RAX, OpSize::I16, false)
        } else {
            let low = b.read_gpr(x86::gpr::RAX, size, false);
            let high = b.read_gpr(x86::gpr::RDX, size, false);
            let shift = b.ir.constant(OpSize::I64, u64::from(bits));
            let high_wide = b.ir.lshl(OpSize::I64, high, shift);
            b.ir.or(OpSize::I64, high_wide, low)
        };
        let double_bits = (bits * 2) as u8;
        let (dividend, divisor) = if signed {
            let dividend = if double_bits < 64 {
                b.ir.sbfe(OpSize::I64, dividend, 0, double_bits)
            } else {
                dividend
            };
            (dividend, b.ir.sbfe(OpSize::I64, src, 0, bits as u8))
        } else {
            (dividend, src)
        };
        if signed {
            (
                b.ir.div(OpSize::I64, dividend, divisor),
                b.ir.rem(OpSize::I64, dividend, divisor),
            )
        } else {
            (
                b.ir.udiv(OpSize::I64, dividend, divisor),
                b.ir.urem(OpSize::I64, dividend, divisor),
            )
        }
    };

    let quotient = b.ir.bfe(size, quotient, 0, bits as u8);
    let remainder = b.ir.bfe(size, remainder, 0, bits as u8);
    if size == OpSize::I8 {
        // AL = quotient, AH = remainder.
        b.write_gpr(x86::gpr::RAX, OpSize::I8, false, quotient);
        b.write_gpr(x86::gpr::RAX, OpSize::I8, true, remainder);
    } else {
        b.write_gpr(x86::gpr::RAX, size, false, quotient);
        b.write_gpr(x86::gpr::RDX, size, false, remainder);
    }
    Ok(())
}

pub(crate) fn op_imul_rm(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    let size = inst.operand_size;
    let lhs = b.load_operand(inst, &inst.reg_op, size);
    let rhs = b.load_operand(inst, &inst.rm, size);
    let res = b.ir.mul(size, lhs, rhs);
    let high = b.ir.mulh(size, lhs, rhs);
    b.calculate_flags_mul(size, res, high);
    b.store_operand(inst, &inst.reg_op, size, res);
    Ok(())
}

pub(crate) fn op_imul_rmi(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    let size = inst.operand_size;
    let lhs = b.load_operand(inst, &inst.rm, size);
    let rhs = b.ir.constant(size, inst.imm);
    let res = b.ir.mul(size, lhs, rhs);
    let high = b.ir.mulh(size, lhs, rhs);
    b.calculate_flags_mul(size, res, high);
    b.store_operand(inst, &inst.reg_op, size, res);
    Ok(())
}

pub(crate) fn op_movzx(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    let src_size = if inst.opcode & 1 == 0 { OpSize::I8 } else { OpSize::I16 };
    let src_op = if src_size == OpSize::I8 { b.byte_operand(inst, &inst.rm) } else { inst.rm };
    let value = b.load_operand(inst, &src_op, src_size);
    b.store_operand(inst, &inst.reg_op, inst.operand_size, value);
    Ok(())
}

pub(crate) fn op_movsx(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    let src_size = if inst.opcode & 1 == 0 { OpSize::I8 } else { OpSize::I16 };
    let src_op = if src_size == OpSize::I8 { b.byte_operand(inst, &inst.rm) } else { inst.rm };
    let value = b.load_operand(inst, &src_op, src_size);
    let res = b.ir.sbfe(inst.operand_size, value, 0, src_size.bits() as u8);
    b.store_operand(inst, &inst.reg_op, inst.operand_size, res);
    Ok(())
}

pub(crate) fn op_movsxd(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    let value = b.load_operand(inst, &inst.rm, OpSize::I32);
    let res = if inst.operand_size == OpSize::I64 {
        b.ir.sbfe(OpSize::I64, value, 0, 32)
    } else {
        value
    };
    b.store_operand(inst, &inst.reg_op, inst.operand_size, res);
    Ok(())
}

pub(crate) fn op_cmov(b: &mut OpDispatchBuilder, inst: &DecodedInst) -> Result<(), DispatchError> {
    let size = inst.operand_size;
    let cond = b.condition_value((inst.opcode & 0xf) as u8);
    let src = b.load_operand(inst, &inst.rm, size);
    let old = b.load_operand(inst, &inst.reg_op, size);
    let zero = b.ir.constant(OpSize::I32, 0);
    let res = b.ir.select(size, CondCode::Neq, OpSize::I32, cond, zero, src, old);
    b.store_operand(inst, &inst.reg_op, size, res);
    Ok(())
}

pub(crate) fn op_setcc(b: &mut OpDispatchBuilder, inst: &DecodedInst) -> Result<(), DispatchError> {
    let cond = b.condition_value((inst.opcode & 0xf) as u8);
    b.store_operand(inst, &inst.rm, OpSize::I8, cond);
    Ok(())
}

pub(crate) fn op_bsf(b: &mut OpDispatchBuilder, inst: &DecodedInst) -> Result<(), DispatchError> {
    let size = inst.operand_size;
    let src = b.load_operand(inst, &inst.rm, size);
    let old = b.load_operand(inst, &inst.reg_op, size);
    let count = b.ir.ctz(size, src);
    let zero = b.ir.constant(size, 0);
    // Source of zero leaves the destination untouched; ZF reports it.
    let res = b.ir.select(size, CondCode::Eq, size, src, zero, old, count);
    b.store_operand(inst, &inst.reg_op, size, res);
    b.calculate_flags_logical(size, src, src, src);
    Ok(())
}

pub(crate) fn op_bsr(b: &mut OpDispatchBuilder, inst: &DecodedInst) -> Result<(), DispatchError> {
    let size = inst.operand_size;
    let src = b.load_operand(inst, &inst.rm, size);
    let old = b.load_operand(inst, &inst.reg_op, size);
    let leading = b.ir.clz(size, src);
    let top = b.ir.constant(size, u64::from(size.bits() - 1));
    let index = b.ir.sub(size, top, leading);
    let zero = b.ir.constant(size, 0);
    let res = b.ir.select(size, CondCode::Eq, size, src, zero, old, index);
    b.store_operand(inst, &inst.reg_op, size, res);
    b.calculate_flags_logical(size, src, src, src);
    Ok(())
}

pub(crate) fn op_popcnt(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    // POPCNT requires the F3 prefix; bare 0F B8 is not a thing we decode.
    if inst.rep != Some(true) {
        b.emit_trap(inst.rip, traps::SIGILL, traps::TRAP_UD);
        return Ok(());
    }
    let size = inst.operand_size;
    let src = b.load_operand(inst, &inst.rm, size);
    let res = b.ir.popcount(size, src);
    b.store_operand(inst, &inst.reg_op, size, res);
    b.calculate_flags_logical(size, src, src, src);
    // POPCNT defines PF as zero rather than the result parity.
    let raw = b.ir.constant(OpSize::I32, 1);
    b.ir
        .store_register(OpSize::I32, RegClass::Gpr, silex_types::PF_AS_GREG, raw);
    b.gpr_cache[silex_types::PF_AS_GREG as usize] = Some(raw);
    Ok(())
}

pub(crate) fn op_bswap(b: &mut OpDispatchBuilder, inst: &DecodedInst) -> Result<(), DispatchError> {
    let size = inst.operand_size;
    let reg = inst.opcode_reg;
    let value = b.read_gpr(reg, size, false);
    let res = b.ir.rev(size, value);
    b.write_gpr(reg, size, false, res);
    Ok(())
}

pub(crate) fn op_xchg(b: &mut OpDispatchBuilder, inst: &DecodedInst) -> Result<(), DispatchError> {
    let size = inst.operand_size;
    if inst.rm.is_mem() {
        // Memory xchg is implicitly locked.
        let DecodedOperand::Mem(mem) = inst.rm else { unreachable!() };
        let addr = b.mem_address(inst, &mem);
        let value = b.load_operand(inst, &inst.reg_op, size);
        let old = b.ir.atomic_swap(size, addr, value);
        b.store_operand(inst, &inst.reg_op, size, old);
    } else {
        let a = b.load_operand(inst, &inst.rm, size);
        let c = b.load_operand(inst, &inst.reg_op, size);
        b.store_operand(inst, &inst.rm, size, c);
        b.store_operand(inst, &inst.reg_op, size, a);
    }
    Ok(())
}

pub(crate) fn op_xchg_acc(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    let size = inst.operand_size;
    let reg = inst.opcode_reg;
    let a = b.read_gpr(x86::gpr::RAX, size, false);
    let other = b.read_gpr(reg, size, false);
    b.write_gpr(x86::gpr::RAX, size, false, other);
    b.write_gpr(reg, size, false, a);
    Ok(())
}

pub(crate) fn op_cmpxchg(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    let size = inst.operand_size;
    let accumulator = b.read_gpr(x86::gpr::RAX, size, false);
    let desired = b.load_operand(inst, &inst.reg_op, size);

    let old = if inst.rm.is_mem() {
        let DecodedOperand::Mem(mem) = inst.rm else { unreachable!() };
        let addr = b.mem_address(inst, &mem);
        b.ir.cas(size, accumulator, desired, addr)
    } else {
        let old = b.load_operand(inst, &inst.rm, size);
        let replacement =
            b.ir.select(size, CondCode::Eq, size, old, accumulator, desired, old);
        b.store_operand(inst, &inst.rm, size, replacement);
        old
    };

    // Flags are those of `cmp rax, old`; on success the accumulator
    // round-trips through itself.
    let res = b.ir.sub(size, accumulator, old);
    b.calculate_flags_sub(size, res, accumulator, old);
    b.write_gpr(x86::gpr::RAX, size, false, old);
    Ok(())
}

pub(crate) fn op_cmpxchg_pair(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    if !inst.rm.is_mem() {
        b.emit_trap(inst.rip, traps::SIGILL, traps::TRAP_UD);
        return Ok(());
    }
    let half = if inst.operand_size == OpSize::I64 { OpSize::I64 } else { OpSize::I32 };
    let pair_size = if half == OpSize::I64 { OpSize::I128 } else { OpSize::I64 };

    let DecodedOperand::Mem(mem) = inst.rm else { unreachable!() };
    let addr = b.mem_address(inst, &mem);
    let expected_lo = b.read_gpr(x86::gpr::RAX, half, false);
    let expected_hi = b.read_gpr(x86::gpr::RDX, half, false);
    let desired_lo = b.read_gpr(x86::gpr::RBX, half, false);
    let desired_hi = b.read_gpr(x86::gpr::RCX, half, false);
    let expected = b.ir.create_element_pair(pair_size, expected_lo, expected_hi);
    let desired = b.ir.create_element_pair(pair_size, desired_lo, desired_hi);

    let old = b.ir.cas_pair(pair_size, expected, desired, addr);
    let old_lo = b.ir.extract_element_pair(half, old, 0);
    let old_hi = b.ir.extract_element_pair(half, old, 1);

    let lo_eq = b.bit_value(CondCode::Eq, half, old_lo, expected_lo);
    let hi_eq = b.bit_value(CondCode::Eq, half, old_hi, expected_hi);
    let both = b.ir.and(OpSize::I32, lo_eq, hi_eq);
    b.rectify_cf();
    b.set_rflag(x86::FLAG_ZF_RAW, both);

    b.write_gpr(x86::gpr::RAX, half, false, old_lo);
    b.write_gpr(x86::gpr::RDX, half, false, old_hi);
    Ok(())
}

pub(crate) fn op_xadd(b: &mut OpDispatchBuilder, inst: &DecodedInst) -> Result<(), DispatchError> {
    let size = inst.operand_size;
    let src = b.load_operand(inst, &inst.reg_op, size);
    let old = if inst.rm.is_mem() {
        let DecodedOperand::Mem(mem) = inst.rm else { unreachable!() };
        let addr = b.mem_address(inst, &mem);
        b.ir.atomic_fetch_add(size, addr, src)
    } else {
        let old = b.load_operand(inst, &inst.rm, size);
        let sum = b.ir.add(size, old, src);
        b.store_operand(inst, &inst.rm, size, sum);
        old
    };
    let res = b.ir.add(size, old, src);
    b.calculate_flags_add(size, res, old, src);
    b.store_operand(inst, &inst.reg_op, size, old);
    Ok(())
}

pub(crate) fn op_cdqe(b: &mut OpDispatchBuilder, inst: &DecodedInst) -> Result<(), DispatchError> {
    let size = inst.operand_size;
    let half_bits = (size.bits() / 2) as u8;
    let value = b.read_gpr(x86::gpr::RAX, size, false);
    let res = b.ir.sbfe(size, value, 0, half_bits);
    b.write_gpr(x86::gpr::RAX, size, false, res);
    Ok(())
}

pub(crate) fn op_cqo(b: &mut OpDispatchBuilder, inst: &DecodedInst) -> Result<(), DispatchError> {
    let size = inst.operand_size;
    let value = b.read_gpr(x86::gpr::RAX, size, false);
    let amount = b.ir.constant(size, u64::from(size.bits() - 1));
    let res = b.ir.ashr(size, value, amount);
    b.write_gpr(x86::gpr::RDX, size, false, res);
    Ok(())
}
