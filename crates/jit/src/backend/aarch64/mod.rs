//! AArch64 host backend.
//!
//! The primary machine target. Guest GPRs are statically bound to host
//! registers for the lifetime of a block ("static register allocation"):
//! the prologue fills them from guest state, exits spill them back. Ops
//! outside this backend's lowering set fail compilation and the region
//! falls back to the reference interpreter.

pub mod emit;

use std::collections::HashMap;

use silex_ir::{
    block_ops, blocks, CondCode, IrStore, NodeId, Op, OpSize, PhysicalRegister, RegClass,
    RegisterAllocationData, SPILL_SLOT_SIZE,
};
use silex_types::x86::traps;
use silex_types::{offsets, CpuStateFrame, AF_AS_GREG, PF_AS_GREG};

use crate::backend::{BackendError, BlockExit, CpuBackend};
use crate::code_buffer::{CodeBuffer, DEFAULT_CODE_BUFFER_SIZE};
use emit::{Assembler, Cond, Label, Reg, XZR};

/// Guest state pointer, pinned for every block.
const STATE: Reg = 28;
const TMP1: Reg = 16;
const TMP2: Reg = 17;

/// Dynamic pool handed to the register allocator.
const DYNAMIC_GPRS: [Reg; 7] = [0, 1, 2, 3, 23, 24, 25];

/// Host register statically bound to a guest register index (0..=15 the
/// GPRs, 16/17 the PF/AF raws).
fn fixed_gpr_host(reg: u32) -> Reg {
    match reg {
        0..=11 => 4 + reg as u8,
        12..=15 => 19 + (reg as u8 - 12),
        r if r == PF_AS_GREG => 26,
        r if r == AF_AS_GREG => 27,
        _ => unreachable!("fixed register {reg} out of range"),
    }
}

/// Allocator configuration matching this backend's register map.
pub fn ra_config() -> silex_ir::passes::RegAllocConfig {
    silex_ir::passes::RegAllocConfig {
        gpr_count: DYNAMIC_GPRS.len() as u8,
        fpr_count: 8,
        supports_fixed_gpr: true,
        supports_fixed_fpr: false,
    }
}

pub struct Aarch64Backend {
    code: CodeBuffer,
}

impl Aarch64Backend {
    pub fn new() -> Result<Aarch64Backend, BackendError> {
        Ok(Aarch64Backend { code: CodeBuffer::new(DEFAULT_CODE_BUFFER_SIZE)? })
    }
}

/// Exit statuses the generated epilogue returns to the dispatcher.
const STATUS_CONTINUE: u16 = 0;
const STATUS_HALT: u16 = 1;
const STATUS_FAULT: u16 = 2;

struct Lowering<'a> {
    asm: Assembler,
    ir: &'a dyn IrStore,
    ra: &'a RegisterAllocationData,
    block_labels: HashMap<NodeId, Label>,
    epilogue: Label,
    spill_bytes: u32,
}

impl<'a> Lowering<'a> {
    fn host_reg(&self, node: NodeId) -> Result<Reg, BackendError> {
        let phys = self.ra.node_register(node);
        self.map_phys(phys)
    }

    fn map_phys(&self, phys: PhysicalRegister) -> Result<Reg, BackendError> {
        match phys.class() {
            RegClass::Gpr => Ok(DYNAMIC_GPRS[phys.reg() as usize]),
            RegClass::GprFixed => Ok(fixed_gpr_host(u32::from(phys.reg()))),
            _ => Err(BackendError::UnsupportedOp { op: "non-GPR register class" }),
        }
    }

    /// Value of an argument: its register, or a temporary materializing an
    /// inline constant.
    fn arg_reg(&mut self, node: NodeId, tmp: Reg) -> Result<Reg, BackendError> {
        if let Op::InlineConstant { value } = self.ir.op(node).op {
            self.asm.load_constant(tmp, value);
            return Ok(tmp);
        }
        self.host_reg(node)
    }

    fn inline_value(&self, node: NodeId) -> Option<u64> {
        match self.ir.op(node).op {
            Op::InlineConstant { value } => Some(value),
            _ => None,
        }
    }

    fn cond_to_host(cond: CondCode) -> Option<Cond> {
        Some(match cond {
            CondCode::Eq => Cond::Eq,
            CondCode::Neq => Cond::Ne,
            CondCode::Uge => Cond::Cs,
            CondCode::Ult => Cond::Cc,
            CondCode::Ugt => Cond::Hi,
            CondCode::Ule => Cond::Ls,
            CondCode::Sge => Cond::Ge,
            CondCode::Slt => Cond::Lt,
            CondCode::Sgt => Cond::Gt,
            CondCode::Sle => Cond::Le,
            CondCode::TstZ => Cond::Eq,
            CondCode::TstNz => Cond::Ne,
        })
    }

    /// Emit the compare feeding a `cond`-style consumer and return the host
    /// condition to test.
    fn emit_compare(
        &mut self,
        cond: CondCode,
        compare_size: OpSize,
        cmp1: NodeId,
        cmp2: NodeId,
    ) -> Result<Cond, BackendError> {
        let bits = compare_size.bits();
        let signed = matches!(
            cond,
            CondCode::Sge | CondCode::Slt | CondCode::Sgt | CondCode::Sle
        );
        let mut lhs = self.arg_reg(cmp1, TMP1)?;
        let test = matches!(cond, CondCode::TstZ | CondCode::TstNz);

        if test {
            let rhs = self.arg_reg(cmp2, TMP2)?;
            self.asm.tst_reg(bits == 64, lhs, rhs);
            return Ok(Self::cond_to_host(cond).expect("tst cond"));
        }

        // Narrow signed compares need sign-extended operands.
        let mut rhs_pending_inline = self.inline_value(cmp2);
        let is64 = bits == 64;
        if signed && bits < 32 {
            self.asm.sbfx(false, TMP1, lhs, 0, bits as u8);
            lhs = TMP1;
            if rhs_pending_inline.is_none() {
                let rhs = self.host_reg(cmp2)?;
                self.asm.sbfx(false, TMP2, rhs, 0, bits as u8);
                self.asm.subs_reg(false, XZR, lhs, TMP2);
                return Ok(Self::cond_to_host(cond).expect("compare cond"));
            }
            // Sign-extend the constant at compile time.
            let value = rhs_pending_inline.take().expect("inline");
            let shift = 64 - bits;
            let extended = (((value << shift) as i64) >> shift) as u64;
            self.asm.load_constant(TMP2, extended & 0xffff_ffff);
            self.asm.subs_reg(false, XZR, lhs, TMP2);
            return Ok(Self::cond_to_host(cond).expect("compare cond"));
        }

        match rhs_pending_inline {
            Some(value) if value < 4096 => {
                self.asm.subs_imm(is64, XZR, lhs, value as u16);
            }
            Some(value) => {
                self.asm.load_constant(TMP2, value);
                self.asm.subs_reg(is64, XZR, lhs, TMP2);
            }
            None => {
                let rhs = self.host_reg(cmp2)?;
                self.asm.subs_reg(is64, XZR, lhs, rhs);
            }
        }
        Ok(Self::cond_to_host(cond).expect("compare cond"))
    }

    fn state_access_supported(size: OpSize) -> Result<u32, BackendError> {
        match size {
            OpSize::I8 | OpSize::I16 | OpSize::I32 | OpSize::I64 => Ok(size.bytes()),
            _ => Err(BackendError::UnsupportedOp { op: "vector state access" }),
        }
    }

    fn lower_op(&mut self, node: NodeId) -> Result<(), BackendError> {
        let payload = *self.ir.op(node);
        let size = payload.size;
        let is64 = size == OpSize::I64;
        let bits = size.bits();

        match payload.op {
            Op::Invalid | Op::CodeBlock { .. } | Op::BeginBlock { .. } | Op::EndBlock { .. } => {}
            Op::InlineConstant { .. } => {}

            Op::Constant { value } => {
                let rd = self.host_reg(node)?;
                self.asm.load_constant(rd, value);
            }
            Op::Copy { src } => {
                let rd = self.host_reg(node)?;
                let rs = self.arg_reg(src, TMP1)?;
                self.asm.mov_reg(true, rd, rs);
            }

            Op::LoadContext { offset, class } => {
                if class != RegClass::Gpr {
                    return Err(BackendError::UnsupportedOp { op: "FPR context load" });
                }
                let bytes = Self::state_access_supported(size)?;
                let rd = self.host_reg(node)?;
                self.asm.ldr(bytes, rd, STATE, offset);
            }
            Op::StoreContext { offset, class, value } => {
                if class != RegClass::Gpr {
                    return Err(BackendError::UnsupportedOp { op: "FPR context store" });
                }
                let bytes = Self::state_access_supported(size)?;
                let rs = self.arg_reg(value, TMP1)?;
                self.asm.str(bytes, rs, STATE, offset);
            }
            Op::LoadRegister { reg, class } => {
                if class != RegClass::Gpr {
                    return Err(BackendError::UnsupportedOp { op: "vector register load" });
                }
                let phys = self.ra.node_register(node);
                if phys.class() == RegClass::GprFixed {
                    // The value already lives in its static binding.
                } else {
                    let rd = self.map_phys(phys)?;
                    self.asm.mov_reg(true, rd, fixed_gpr_host(reg));
                }
            }
            Op::StoreRegister { reg, class, value } => {
                if class != RegClass::Gpr {
                    return Err(BackendError::UnsupportedOp { op: "vector register store" });
                }
                let rs = self.arg_reg(value, TMP1)?;
                if size == OpSize::I32 {
                    // 32-bit writes zero-extend architecturally; a w-form
                    // move does exactly that.
                    self.asm.mov_reg(false, fixed_gpr_host(reg), rs);
                } else {
                    self.asm.mov_reg(true, fixed_gpr_host(reg), rs);
                }
            }
            Op::LoadFlag { flag } => {
                let rd = self.host_reg(node)?;
                let bytes = if size == OpSize::I32 { 4 } else { 1 };
                self.asm.ldr(bytes, rd, STATE, offsets::flag_byte(flag));
            }
            Op::StoreFlag { flag, value } => {
                let rs = self.arg_reg(value, TMP1)?;
                let bytes = if size == OpSize::I32 { 4 } else { 1 };
                self.asm.str(bytes, rs, STATE, offsets::flag_byte(flag));
            }

            Op::Add { src1, src2 } => {
                let rd = self.host_reg(node)?;
                let rn = self.host_reg(src1)?;
                match self.inline_value(src2) {
                    Some(value) if value < 4096 => {
                        self.asm.add_imm(is64, rd, rn, value as u16)
                    }
                    _ => {
                        let rm = self.arg_reg(src2, TMP1)?;
                        self.asm.add_reg(is64, rd, rn, rm);
                    }
                }
                self.mask_narrow(rd, size);
            }
            Op::Sub { src1, src2 } => {
                let rd = self.host_reg(node)?;
                let rn = self.host_reg(src1)?;
                match self.inline_value(src2) {
                    Some(value) if value < 4096 => {
                        self.asm.sub_imm(is64, rd, rn, value as u16)
                    }
                    _ => {
                        let rm = self.arg_reg(src2, TMP1)?;
                        self.asm.sub_reg(is64, rd, rn, rm);
                    }
                }
                self.mask_narrow(rd, size);
            }
            Op::And { src1, src2 } => {
                let rd = self.host_reg(node)?;
                let rn = self.host_reg(src1)?;
                let rm = self.arg_reg(src2, TMP1)?;
                self.asm.and_reg(is64, rd, rn, rm);
            }
            Op::Or { src1, src2 } => {
                let rd = self.host_reg(node)?;
                let rn = self.host_reg(src1)?;
                let rm = self.arg_reg(src2, TMP1)?;
                self.asm.orr(is64, rd, rn, rm);
                self.mask_narrow(rd, size);
            }
            Op::Xor { src1, src2 } => {
                let rd = self.host_reg(node)?;
                let rn = self.host_reg(src1)?;
                let rm = self.arg_reg(src2, TMP1)?;
                self.asm.eor(is64, rd, rn, rm);
                self.mask_narrow(rd, size);
            }
            Op::Not { src } => {
                let rd = self.host_reg(node)?;
                let rs = self.host_reg(src)?;
                self.asm.mvn(is64, rd, rs);
                self.mask_narrow(rd, size);
            }
            Op::Neg { src } => {
                let rd = self.host_reg(node)?;
                let rs = self.host_reg(src)?;
                self.asm.sub_reg(is64, rd, XZR, rs);
                self.mask_narrow(rd, size);
            }
            Op::Lshl { src1, src2 } => {
                let rd = self.host_reg(node)?;
                let rn = self.host_reg(src1)?;
                let rm = self.arg_reg(src2, TMP1)?;
                self.asm.lslv(is64, rd, rn, rm);
                self.mask_narrow(rd, size);
            }
            Op::Lshr { src1, src2 } => {
                let rd = self.host_reg(node)?;
                let rn = self.host_reg(src1)?;
                let rm = self.arg_reg(src2, TMP1)?;
                self.asm.lsrv(is64, rd, rn, rm);
            }
            Op::Ashr { src1, src2 } => {
                let rd = self.host_reg(node)?;
                let mut rn = self.host_reg(src1)?;
                if bits < 32 {
                    self.asm.sbfx(false, TMP2, rn, 0, bits as u8);
                    rn = TMP2;
                }
                let rm = self.arg_reg(src2, TMP1)?;
                self.asm.asrv(is64, rd, rn, rm);
                self.mask_narrow(rd, size);
            }
            Op::Ror { src1, src2 } => {
                if bits < 32 {
                    return Err(BackendError::UnsupportedOp { op: "narrow rotate" });
                }
                let rd = self.host_reg(node)?;
                let rn = self.host_reg(src1)?;
                let rm = self.arg_reg(src2, TMP1)?;
                self.asm.rorv(is64, rd, rn, rm);
            }
            Op::Mul { src1, src2 } | Op::UMul { src1, src2 } => {
                let rd = self.host_reg(node)?;
                let rn = self.host_reg(src1)?;
                let rm = self.arg_reg(src2, TMP1)?;
                self.asm.mul(is64, rd, rn, rm);
                self.mask_narrow(rd, size);
            }
            Op::MulH { src1, src2 } | Op::UMulH { src1, src2 } => {
                let signed = matches!(payload.op, Op::MulH { .. });
                let rd = self.host_reg(node)?;
                let rn = self.host_reg(src1)?;
                let rm = self.host_reg(src2)?;
                if size == OpSize::I64 {
                    if signed {
                        self.asm.smulh(rd, rn, rm);
                    } else {
                        self.asm.umulh(rd, rn, rm);
                    }
                } else {
                    // Widen, multiply, take the top half.
                    if signed {
                        self.asm.sbfx(true, TMP1, rn, 0, bits as u8);
                        self.asm.sbfx(true, TMP2, rm, 0, bits as u8);
                    } else {
                        self.asm.ubfx(true, TMP1, rn, 0, bits as u8);
                        self.asm.ubfx(true, TMP2, rm, 0, bits as u8);
                    }
                    self.asm.mul(true, rd, TMP1, TMP2);
                    self.asm.load_constant(TMP1, u64::from(bits));
                    self.asm.lsrv(true, rd, rd, TMP1);
                    self.mask_narrow(rd, size);
                }
            }
            Op::Div { src1, src2 } | Op::UDiv { src1, src2 } => {
                let signed = matches!(payload.op, Op::Div { .. });
                let rd = self.host_reg(node)?;
                let rn = self.host_reg(src1)?;
                let rm = self.host_reg(src2)?;
                if signed {
                    self.asm.sdiv(is64, rd, rn, rm);
                } else {
                    self.asm.udiv(is64, rd, rn, rm);
                }
                self.mask_narrow(rd, size);
            }
            Op::Rem { src1, src2 } | Op::URem { src1, src2 } => {
                let signed = matches!(payload.op, Op::Rem { .. });
                let rd = self.host_reg(node)?;
                let rn = self.host_reg(src1)?;
                let rm = self.host_reg(src2)?;
                if signed {
                    self.asm.sdiv(is64, TMP1, rn, rm);
                } else {
                    self.asm.udiv(is64, TMP1, rn, rm);
                }
                self.asm.msub(is64, rd, TMP1, rm, rn);
                self.mask_narrow(rd, size);
            }
            Op::Clz { src } => {
                let rd = self.host_reg(node)?;
                let rs = self.host_reg(src)?;
                match size {
                    OpSize::I64 => self.asm.clz(true, rd, rs),
                    OpSize::I32 => self.asm.clz(false, rd, rs),
                    _ => {
                        self.asm.clz(false, rd, rs);
                        self.asm.sub_imm(false, rd, rd, (32 - bits) as u16);
                    }
                }
            }
            Op::Ctz { src } => {
                if bits < 32 {
                    return Err(BackendError::UnsupportedOp { op: "narrow ctz" });
                }
                let rd = self.host_reg(node)?;
                let rs = self.host_reg(src)?;
                self.asm.rbit(is64, TMP1, rs);
                self.asm.clz(is64, rd, TMP1);
            }
            Op::Rev { src } => {
                if bits < 32 {
                    return Err(BackendError::UnsupportedOp { op: "narrow byte swap" });
                }
                let rd = self.host_reg(node)?;
                let rs = self.host_reg(src)?;
                self.asm.rev(is64, rd, rs);
            }
            Op::Popcount { .. } => {
                return Err(BackendError::UnsupportedOp { op: "Popcount" });
            }
            Op::Bfe { src, lsb, width } => {
                let rd = self.host_reg(node)?;
                let rs = self.host_reg(src)?;
                self.asm.ubfx(true, rd, rs, lsb, width);
            }
            Op::Sbfe { src, lsb, width } => {
                let rd = self.host_reg(node)?;
                let rs = self.host_reg(src)?;
                self.asm.sbfx(true, rd, rs, lsb, width);
                self.mask_narrow(rd, size);
            }
            Op::Bfi { dest, src, lsb, width } => {
                let rd = self.host_reg(node)?;
                let rdest = self.host_reg(dest)?;
                let rsrc = self.host_reg(src)?;
                self.asm.mov_reg(true, TMP1, rdest);
                self.asm.bfi(true, TMP1, rsrc, lsb, width);
                self.asm.mov_reg(true, rd, TMP1);
            }
            Op::Select { cond, compare_size, cmp1, cmp2, true_val, false_val } => {
                let host_cond = self.emit_compare(cond, compare_size, cmp1, cmp2)?;
                let rd = self.host_reg(node)?;
                let rt = self.arg_reg(true_val, TMP1)?;
                let rf = self.arg_reg(false_val, TMP2)?;
                self.asm.csel(true, rd, rt, rf, host_cond);
            }

            Op::LoadMem { addr, offset, .. } | Op::LoadMemTso { addr, offset, .. } => {
                if offset.is_valid() {
                    return Err(BackendError::UnsupportedOp { op: "indexed load" });
                }
                let bytes = Self::state_access_supported(size)?;
                let tso = matches!(payload.op, Op::LoadMemTso { .. });
                let rd = self.host_reg(node)?;
                let ra = self.host_reg(addr)?;
                if tso {
                    self.asm.dmb_ishld();
                }
                self.asm.ldr(bytes, rd, ra, 0);
            }
            Op::StoreMem { addr, value, offset, .. }
            | Op::StoreMemTso { addr, value, offset, .. } => {
                if offset.is_valid() {
                    return Err(BackendError::UnsupportedOp { op: "indexed store" });
                }
                let bytes = Self::state_access_supported(size)?;
                let tso = matches!(payload.op, Op::StoreMemTso { .. });
                let ra = self.host_reg(addr)?;
                let rv = self.arg_reg(value, TMP1)?;
                self.asm.str(bytes, rv, ra, 0);
                if tso {
                    self.asm.dmb_ish();
                }
            }

            Op::Cas { expected, desired, addr } => {
                let bytes = Self::state_access_supported(size)?;
                let rd = self.host_reg(node)?;
                let rexp = self.host_reg(expected)?;
                let rdes = self.host_reg(desired)?;
                let ra = self.host_reg(addr)?;
                // LL/SC loop; no hardware-CAS fast path here.
                let retry = self.asm.create_label();
                let done = self.asm.create_label();
                self.asm.bind_label(retry);
                self.asm.ldaxr(bytes, TMP1, ra);
                self.asm.subs_reg(bytes == 8, XZR, TMP1, rexp);
                self.asm.b_cond(Cond::Ne, done);
                self.asm.stlxr(bytes, TMP2, rdes, ra);
                self.asm.cbnz(false, TMP2, retry);
                self.asm.bind_label(done);
                self.asm.mov_reg(true, rd, TMP1);
            }
            Op::AtomicAdd { addr, value }
            | Op::AtomicSub { addr, value }
            | Op::AtomicAnd { addr, value }
            | Op::AtomicOr { addr, value }
            | Op::AtomicXor { addr, value }
            | Op::AtomicSwap { addr, value }
            | Op::AtomicFetchAdd { addr, value }
            | Op::AtomicFetchSub { addr, value }
            | Op::AtomicFetchAnd { addr, value }
            | Op::AtomicFetchOr { addr, value }
            | Op::AtomicFetchXor { addr, value } => {
                let bytes = Self::state_access_supported(size)?;
                let ra = self.host_reg(addr)?;
                let rv = self.host_reg(value)?;
                let retry = self.asm.create_label();
                self.asm.bind_label(retry);
                self.asm.ldaxr(bytes, TMP1, ra);
                match payload.op {
                    Op::AtomicAdd { .. } | Op::AtomicFetchAdd { .. } => {
                        self.asm.add_reg(is64, TMP2, TMP1, rv)
                    }
                    Op::AtomicSub { .. } | Op::AtomicFetchSub { .. } => {
                        self.asm.sub_reg(is64, TMP2, TMP1, rv)
                    }
                    Op::AtomicAnd { .. } | Op::AtomicFetchAnd { .. } => {
                        self.asm.and_reg(is64, TMP2, TMP1, rv)
                    }
                    Op::AtomicOr { .. } | Op::AtomicFetchOr { .. } => {
                        self.asm.orr(is64, TMP2, TMP1, rv)
                    }
                    Op::AtomicXor { .. } | Op::AtomicFetchXor { .. } => {
                        self.asm.eor(is64, TMP2, TMP1, rv)
                    }
                    Op::AtomicSwap { .. } => self.asm.mov_reg(true, TMP2, rv),
                    _ => unreachable!(),
                }
                // x30 is saved by the prologue; it serves as the
                // store-conditional status register so the old value in
                // TMP1 survives the loop.
                self.asm.stlxr(bytes, 30, TMP2, ra);
                self.asm.cbnz(false, 30, retry);
                if payload.op.has_result() {
                    let rd = self.host_reg(node)?;
                    self.asm.mov_reg(true, rd, TMP1);
                }
            }
            Op::AtomicNeg { addr } => {
                let bytes = Self::state_access_supported(size)?;
                let ra = self.host_reg(addr)?;
                let retry = self.asm.create_label();
                self.asm.bind_label(retry);
                self.asm.ldaxr(bytes, TMP1, ra);
                self.asm.sub_reg(is64, TMP2, XZR, TMP1);
                self.asm.stlxr(bytes, TMP1, TMP2, ra);
                self.asm.cbnz(false, TMP1, retry);
            }

            Op::SpillRegister { value, slot } => {
                let rs = self.host_reg(value)?;
                self.asm.str(8, rs, 31, slot * SPILL_SLOT_SIZE);
            }
            Op::FillRegister { slot, .. } => {
                let rd = self.host_reg(node)?;
                self.asm.ldr(8, rd, 31, slot * SPILL_SLOT_SIZE);
            }

            Op::Jump { target } => {
                let label = self.block_labels[&target];
                self.asm.b(label);
            }
            Op::CondJump { cond, compare_size, cmp1, cmp2, true_block, false_block } => {
                let host_cond = self.emit_compare(cond, compare_size, cmp1, cmp2)?;
                let true_label = self.block_labels[&true_block];
                let false_label = self.block_labels[&false_block];
                self.asm.b_cond(host_cond, true_label);
                self.asm.b(false_label);
            }
            Op::ExitFunction { new_rip } => {
                let rv = self.arg_reg(new_rip, TMP1)?;
                self.asm.str(8, rv, STATE, offsets::rip());
                self.asm.movz(true, 0, STATUS_CONTINUE, 0);
                let label = self.epilogue;
                self.asm.b(label);
            }
            Op::Break { reason } => {
                if reason.trap_number == traps::TRAP_HLT {
                    self.asm.movz(true, 0, STATUS_HALT, 0);
                } else {
                    // Pack the synchronous fault record in one store.
                    let packed = 1u64
                        | (u64::from(reason.signal) << 8)
                        | (u64::from(reason.trap_number) << 16)
                        | (u64::from(reason.si_code) << 24)
                        | (u64::from(reason.error_register) << 32);
                    self.asm.load_constant(TMP1, packed);
                    self.asm
                        .str(8, TMP1, STATE, offsets::frame_synchronous_fault_data());
                    self.asm.movz(true, 0, STATUS_FAULT, 0);
                }
                let label = self.epilogue;
                self.asm.b(label);
            }

            _ => {
                return Err(BackendError::UnsupportedOp { op: payload.op.name() });
            }
        }
        Ok(())
    }

    /// Re-mask a result whose width is narrower than the emitted operation.
    fn mask_narrow(&mut self, rd: Reg, size: OpSize) {
        match size {
            OpSize::I8 => self.asm.ubfx(false, rd, rd, 0, 8),
            OpSize::I16 => self.asm.ubfx(false, rd, rd, 0, 16),
            _ => {}
        }
    }
}

impl CpuBackend for Aarch64Backend {
    fn name(&self) -> &'static str {
        "aarch64"
    }

    fn needs_register_allocation(&self) -> bool {
        true
    }

    fn compile(
        &mut self,
        _entry_rip: u64,
        ir: &dyn IrStore,
        ra: Option<&RegisterAllocationData>,
    ) -> Result<u64, BackendError> {
        let ra = ra.ok_or(BackendError::MissingRaData)?;
        let mut asm = Assembler::new();
        let epilogue = asm.create_label();
        let mut lowering = Lowering {
            asm,
            ir,
            ra,
            block_labels: HashMap::new(),
            epilogue,
            spill_bytes: (ra.spill_slots() * SPILL_SLOT_SIZE + 15) & !15,
        };
        for block in blocks(ir) {
            let label = lowering.asm.create_label();
            lowering.block_labels.insert(block, label);
        }

        // Prologue: callee-saved registers, STATE, spill area, static fill.
        lowering.asm.stp_pre_sp(29, 30);
        lowering.asm.stp_pre_sp(27, 28);
        lowering.asm.stp_pre_sp(25, 26);
        lowering.asm.stp_pre_sp(23, 24);
        lowering.asm.stp_pre_sp(21, 22);
        lowering.asm.stp_pre_sp(19, 20);
        lowering.asm.mov_reg(true, STATE, 0);
        if lowering.spill_bytes != 0 {
            lowering.asm.sub_imm(true, 31, 31, lowering.spill_bytes as u16);
        }
        for guest in 0..16u32 {
            lowering
                .asm
                .ldr(8, fixed_gpr_host(guest), STATE, offsets::greg(guest));
        }
        lowering.asm.ldr(4, fixed_gpr_host(PF_AS_GREG), STATE, offsets::pf_raw());
        lowering.asm.ldr(4, fixed_gpr_host(AF_AS_GREG), STATE, offsets::af_raw());

        for block in blocks(ir) {
            let label = lowering.block_labels[&block];
            lowering.asm.bind_label(label);
            for node in block_ops(ir, block) {
                lowering.lower_op(node)?;
            }
        }

        // Common epilogue: static spill, stack unwind, return status in x0.
        let epilogue = lowering.epilogue;
        lowering.asm.bind_label(epilogue);
        for guest in 0..16u32 {
            lowering
                .asm
                .str(8, fixed_gpr_host(guest), STATE, offsets::greg(guest));
        }
        lowering.asm.str(4, fixed_gpr_host(PF_AS_GREG), STATE, offsets::pf_raw());
        lowering.asm.str(4, fixed_gpr_host(AF_AS_GREG), STATE, offsets::af_raw());
        if lowering.spill_bytes != 0 {
            lowering.asm.add_imm(true, 31, 31, lowering.spill_bytes as u16);
        }
        lowering.asm.ldp_post_sp(19, 20);
        lowering.asm.ldp_post_sp(21, 22);
        lowering.asm.ldp_post_sp(23, 24);
        lowering.asm.ldp_post_sp(25, 26);
        lowering.asm.ldp_post_sp(27, 28);
        lowering.asm.ldp_post_sp(29, 30);
        lowering.asm.ret();

        let code = lowering.asm.finalize();
        Ok(self.code.publish(&code)?)
    }

    unsafe fn invoke(&mut self, entry: u64, frame: *mut CpuStateFrame) -> BlockExit {
        invoke_native(entry, frame)
    }

    fn clear(&mut self) {
        self.code.reset();
    }
}

#[cfg(target_arch = "aarch64")]
unsafe fn invoke_native(entry: u64, frame: *mut CpuStateFrame) -> BlockExit {
    let block: unsafe extern "C" fn(*mut CpuStateFrame) -> u64 = core::mem::transmute(entry);
    match block(frame) {
        0 => BlockExit::Continue,
        1 => BlockExit::Halt,
        _ => BlockExit::Fault,
    }
}

#[cfg(not(target_arch = "aarch64"))]
unsafe fn invoke_native(_entry: u64, _frame: *mut CpuStateFrame) -> BlockExit {
    unreachable!("aarch64 code invoked on a foreign host")
}

#[cfg(test)]
mod tests {
    use super::*;
    use silex_ir::passes::RegisterAllocationPass;
    use silex_ir::pool::IntrusivePooledAllocator;
    use silex_ir::IrEmitter;

    /// Lower a tiny region and sanity-check the published code.
    #[test]
    fn compiles_simple_region() {
        let mut emitter = IrEmitter::new(IntrusivePooledAllocator::new_heap());
        let block = emitter.create_code_node();
        emitter.start_block(block);
        let value = emitter.constant(OpSize::I64, 42);
        emitter.store_register(OpSize::I64, RegClass::Gpr, 0, value);
        let rip = emitter.constant(OpSize::I64, 0x1008);
        emitter.exit_function(rip);
        emitter.finish_block(block);

        let mut ra_pass = RegisterAllocationPass::new(ra_config());
        let ra = ra_pass.run(&mut emitter).expect("alloc");

        let mut backend = Aarch64Backend::new().expect("backend");
        let entry = backend
            .compile(0x1000, emitter.data(), Some(&ra))
            .expect("compile");
        assert_ne!(entry, 0);
        assert_eq!(entry % 16, 0);

        // The block must end in `ret`.
        let code = unsafe {
            core::slice::from_raw_parts(entry as *const u8, 4096)
        };
        let ret = 0xd65f_03c0u32.to_le_bytes();
        assert!(code.windows(4).any(|window| window == ret));
    }

    #[test]
    fn unsupported_ops_are_reported() {
        let mut emitter = IrEmitter::new(IntrusivePooledAllocator::new_heap());
        let block = emitter.create_code_node();
        emitter.start_block(block);
        let value = emitter.constant(OpSize::I64, 42);
        let pop = emitter.popcount(OpSize::I64, value);
        emitter.store_register(OpSize::I64, RegClass::Gpr, 0, pop);
        let rip = emitter.constant(OpSize::I64, 0);
        emitter.exit_function(rip);
        emitter.finish_block(block);

        let mut ra_pass = RegisterAllocationPass::new(ra_config());
        let ra = ra_pass.run(&mut emitter).expect("alloc");
        let mut backend = Aarch64Backend::new().expect("backend");
        assert!(matches!(
            backend.compile(0, emitter.data(), Some(&ra)),
            Err(BackendError::UnsupportedOp { .. })
        ));
    }
}
