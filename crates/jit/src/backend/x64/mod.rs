//! x86-64 host backend: the alternative lowering.
//!
//! Running x86 guests on an x86 host keeps the memory model for free, so
//! TSO ops lower to plain accesses. There is no static guest-register
//! binding (the host doesn't have the registers to spare), so guest
//! register ops become state loads and stores relative to the pinned
//! STATE register (r14).

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
use emit::{Assembler, Cc, Label, Reg, R14};

/// Guest state pointer.
const STATE: Reg = R14;
const TMP1: Reg = 12;
const TMP2: Reg = 13;

/// Dynamic pool handed to the register allocator: rax, rcx, rdx, rbx, rsi,
/// rdi, r8-r11.
const DYNAMIC_GPRS: [Reg; 10] = [0, 1, 2, 3, 6, 7, 8, 9, 10, 11];

pub fn ra_config() -> silex_ir::passes::RegAllocConfig {
    silex_ir::passes::RegAllocConfig {
        gpr_count: DYNAMIC_GPRS.len() as u8,
        fpr_count: 8,
        supports_fixed_gpr: false,
        supports_fixed_fpr: false,
    }
}

/// State offset backing a guest register index.
fn guest_reg_offset(reg: u32) -> u32 {
    if reg == PF_AS_GREG {
        offsets::pf_raw()
    } else if reg == AF_AS_GREG {
        offsets::af_raw()
    } else {
        offsets::greg(reg)
    }
}

const STATUS_CONTINUE: u64 = 0;
const STATUS_HALT: u64 = 1;
const STATUS_FAULT: u64 = 2;

pub struct X64Backend {
    code: CodeBuffer,
}

impl X64Backend {
    pub fn new() -> Result<X64Backend, BackendError> {
        Ok(X64Backend { code: CodeBuffer::new(DEFAULT_CODE_BUFFER_SIZE)? })
    }
}

struct Lowering<'a> {
    asm: Assembler,
    ir: &'a dyn IrStore,
    ra: &'a RegisterAllocationData,
    block_labels: HashMap<NodeId, Label>,
    epilogue: Label,
}

impl<'a> Lowering<'a> {
    fn host_reg(&self, node: NodeId) -> Result<Reg, BackendError> {
        let phys = self.ra.node_register(node);
        self.map_phys(phys)
    }

    fn map_phys(&self, phys: PhysicalRegister) -> Result<Reg, BackendError> {
        match phys.class() {
            RegClass::Gpr => Ok(DYNAMIC_GPRS[phys.reg() as usize]),
            _ => Err(BackendError::UnsupportedOp { op: "non-dynamic register class" }),
        }
    }

    fn arg_reg(&mut self, node: NodeId, tmp: Reg) -> Result<Reg, BackendError> {
        if let Op::InlineConstant { value } = self.ir.op(node).op {
            self.asm.mov_ri64(tmp, value);
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

    fn cond_to_cc(cond: CondCode) -> Cc {
        match cond {
            CondCode::Eq | CondCode::TstZ => Cc::E,
            CondCode::Neq | CondCode::TstNz => Cc::Ne,
            CondCode::Uge => Cc::Ae,
            CondCode::Ult => Cc::B,
            CondCode::Ugt => Cc::A,
            CondCode::Ule => Cc::Be,
            CondCode::Sge => Cc::Ge,
            CondCode::Slt => Cc::L,
            CondCode::Sgt => Cc::G,
            CondCode::Sle => Cc::Le,
        }
    }

    fn emit_compare(
        &mut self,
        cond: CondCode,
        compare_size: OpSize,
        cmp1: NodeId,
        cmp2: NodeId,
    ) -> Result<Cc, BackendError> {
        let bits = compare_size.bits();
        let w = bits == 64;
        let signed = matches!(
            cond,
            CondCode::Sge | CondCode::Slt | CondCode::Sgt | CondCode::Sle
        );

        if matches!(cond, CondCode::TstZ | CondCode::TstNz) {
            let lhs = self.arg_reg(cmp1, TMP1)?;
            let rhs = self.arg_reg(cmp2, TMP2)?;
            self.asm.test_rr(w, lhs, rhs);
            return Ok(Self::cond_to_cc(cond));
        }

        let mut lhs = self.host_reg(cmp1)?;
        if signed && bits < 32 {
            // Sign-extend narrow operands before a 32-bit compare.
            if bits == 8 {
                self.asm.movsx8(false, TMP1, lhs);
            } else {
                self.asm.movsx16(false, TMP1, lhs);
            }
            lhs = TMP1;
            let rhs = match self.inline_value(cmp2) {
                Some(value) => {
                    let shift = 64 - bits;
                    let extended = (((value << shift) as i64) >> shift) as u64;
                    self.asm.mov_ri64(TMP2, extended & 0xffff_ffff);
                    TMP2
                }
                None => {
                    let raw = self.host_reg(cmp2)?;
                    if bits == 8 {
                        self.asm.movsx8(false, TMP2, raw);
                    } else {
                        self.asm.movsx16(false, TMP2, raw);
                    }
                    TMP2
                }
            };
            self.asm.cmp_rr(false, lhs, rhs);
            return Ok(Self::cond_to_cc(cond));
        }

        match self.inline_value(cmp2) {
            Some(value) if i32::try_from(value).is_ok() => {
                self.asm.cmp_ri(w, lhs, value as i32);
            }
            _ => {
                let rhs = self.arg_reg(cmp2, TMP2)?;
                self.asm.cmp_rr(w, lhs, rhs);
            }
        }
        Ok(Self::cond_to_cc(cond))
    }

    fn sized(size: OpSize) -> Result<u32, BackendError> {
        match size {
            OpSize::I8 | OpSize::I16 | OpSize::I32 | OpSize::I64 => Ok(size.bytes()),
            _ => Err(BackendError::UnsupportedOp { op: "vector access" }),
        }
    }

    /// Mask a freshly computed value to its width. 32-bit ops self-truncate
    /// by using the w-form.
    fn mask_narrow(&mut self, rd: Reg, size: OpSize) {
        match size {
            OpSize::I8 => self.asm.movzx8(false, rd, rd),
            OpSize::I16 => self.asm.movzx16(false, rd, rd),
            _ => {}
        }
    }

    fn lower_op(&mut self, node: NodeId) -> Result<(), BackendError> {
        let payload = *self.ir.op(node);
        let size = payload.size;
        let w = size == OpSize::I64;

        match payload.op {
            Op::Invalid
            | Op::CodeBlock { .. }
            | Op::BeginBlock { .. }
            | Op::EndBlock { .. }
            | Op::InlineConstant { .. } => {}

            Op::Constant { value } => {
                let rd = self.host_reg(node)?;
                self.asm.mov_ri64(rd, value);
            }
            Op::Copy { src } => {
                let rd = self.host_reg(node)?;
                let rs = self.arg_reg(src, TMP1)?;
                self.asm.mov_rr(true, rd, rs);
            }

            Op::LoadContext { offset, class } => {
                if class != RegClass::Gpr {
                    return Err(BackendError::UnsupportedOp { op: "FPR context load" });
                }
                let bytes = Self::sized(size)?;
                let rd = self.host_reg(node)?;
                self.asm.mov_load(bytes, rd, STATE, offset as i32);
            }
            Op::StoreContext { offset, class, value } => {
                if class != RegClass::Gpr {
                    return Err(BackendError::UnsupportedOp { op: "FPR context store" });
                }
                let bytes = Self::sized(size)?;
                let rs = self.arg_reg(value, TMP1)?;
                self.asm.mov_store(bytes, STATE, offset as i32, rs);
            }
            Op::LoadRegister { reg, class } => {
                if class != RegClass::Gpr {
                    return Err(BackendError::UnsupportedOp { op: "vector register load" });
                }
                let bytes = Self::sized(size)?;
                let rd = self.host_reg(node)?;
                self.asm
                    .mov_load(bytes, rd, STATE, guest_reg_offset(reg) as i32);
            }
            Op::StoreRegister { reg, class, value } => {
                if class != RegClass::Gpr {
                    return Err(BackendError::UnsupportedOp { op: "vector register store" });
                }
                let bytes = Self::sized(size)?;
                let rs = self.arg_reg(value, TMP1)?;
                self.asm
                    .mov_store(bytes, STATE, guest_reg_offset(reg) as i32, rs);
            }
            Op::LoadFlag { flag } => {
                let rd = self.host_reg(node)?;
                let bytes = if size == OpSize::I32 { 4 } else { 1 };
                self.asm
                    .mov_load(bytes, rd, STATE, offsets::flag_byte(flag) as i32);
            }
            Op::StoreFlag { flag, value } => {
                let rs = self.arg_reg(value, TMP1)?;
                let bytes = if size == OpSize::I32 { 4 } else { 1 };
                self.asm
                    .mov_store(bytes, STATE, offsets::flag_byte(flag) as i32, rs);
            }

            Op::Add { src1, src2 } => {
                self.binary_alu(node, src1, src2, w, size, |asm, w, rd, rs| {
                    asm.add_rr(w, rd, rs)
                }, Some(|asm: &mut Assembler, w: bool, rd: Reg, imm: i32| {
                    asm.add_ri(w, rd, imm)
                }))?;
            }
            Op::Sub { src1, src2 } => {
                self.binary_alu(node, src1, src2, w, size, |asm, w, rd, rs| {
                    asm.sub_rr(w, rd, rs)
                }, Some(|asm: &mut Assembler, w: bool, rd: Reg, imm: i32| {
                    asm.sub_ri(w, rd, imm)
                }))?;
            }
            Op::And { src1, src2 } => {
                self.binary_alu(node, src1, src2, w, size, |asm, w, rd, rs| {
                    asm.and_rr(w, rd, rs)
                }, Some(|asm: &mut Assembler, w: bool, rd: Reg, imm: i32| {
                    asm.and_ri(w, rd, imm)
                }))?;
            }
            Op::Or { src1, src2 } => {
                self.binary_alu(
                    node,
                    src1,
                    src2,
                    w,
                    size,
                    |asm, w, rd, rs| asm.or_rr(w, rd, rs),
                    None::<fn(&mut Assembler, bool, Reg, i32)>,
                )?;
            }
            Op::Xor { src1, src2 } => {
                self.binary_alu(
                    node,
                    src1,
                    src2,
                    w,
                    size,
                    |asm, w, rd, rs| asm.xor_rr(w, rd, rs),
                    None::<fn(&mut Assembler, bool, Reg, i32)>,
                )?;
            }
            Op::Mul { src1, src2 } | Op::UMul { src1, src2 } => {
                let rd = self.host_reg(node)?;
                let rn = self.host_reg(src1)?;
                let mut rm = self.arg_reg(src2, TMP1)?;
                if rd == rm {
                    // The destination move below would clobber the operand.
                    self.asm.mov_rr(true, TMP2, rm);
                    rm = TMP2;
                }
                self.asm.mov_rr(true, rd, rn);
                // The 32-bit form self-truncates; narrower results re-mask.
                self.asm.imul_rr(w, rd, rm);
                self.mask_narrow(rd, size);
            }
            Op::Not { src } => {
                let rd = self.host_reg(node)?;
                let rs = self.host_reg(src)?;
                self.asm.mov_rr(true, rd, rs);
                self.asm.not_r(w, rd);
                self.mask_narrow(rd, size);
            }
            Op::Neg { src } => {
                let rd = self.host_reg(node)?;
                let rs = self.host_reg(src)?;
                self.asm.mov_rr(true, rd, rs);
                self.asm.neg_r(w, rd);
                self.mask_narrow(rd, size);
            }
            Op::Lshl { src1, src2 } => {
                let amount = self
                    .inline_value(src2)
                    .ok_or(BackendError::UnsupportedOp { op: "dynamic shift" })?;
                let rd = self.host_reg(node)?;
                let rn = self.host_reg(src1)?;
                self.asm.mov_rr(true, rd, rn);
                self.asm.shl_ri(w, rd, amount as u8);
                self.mask_narrow(rd, size);
            }
            Op::Lshr { src1, src2 } => {
                let amount = self
                    .inline_value(src2)
                    .ok_or(BackendError::UnsupportedOp { op: "dynamic shift" })?;
                let rd = self.host_reg(node)?;
                let rn = self.host_reg(src1)?;
                self.asm.mov_rr(true, rd, rn);
                self.asm.shr_ri(w, rd, amount as u8);
            }
            Op::Ashr { src1, src2 } => {
                let amount = self
                    .inline_value(src2)
                    .ok_or(BackendError::UnsupportedOp { op: "dynamic shift" })?;
                let rd = self.host_reg(node)?;
                let rn = self.host_reg(src1)?;
                if size.bits() < 32 {
                    if size == OpSize::I8 {
                        self.asm.movsx8(false, rd, rn);
                    } else {
                        self.asm.movsx16(false, rd, rn);
                    }
                } else {
                    self.asm.mov_rr(true, rd, rn);
                }
                self.asm.sar_ri(w, rd, amount as u8);
                self.mask_narrow(rd, size);
            }
            Op::Bfe { src, lsb, width } => {
                let rd = self.host_reg(node)?;
                let rs = self.host_reg(src)?;
                self.asm.mov_rr(true, rd, rs);
                if lsb != 0 {
                    self.asm.shr_ri(true, rd, lsb);
                }
                match width {
                    8 => self.asm.movzx8(false, rd, rd),
                    16 => self.asm.movzx16(false, rd, rd),
                    32 => self.asm.mov_rr(false, rd, rd),
                    64 => {}
                    width if width < 32 => {
                        self.asm.and_ri(true, rd, (1i32 << width) - 1);
                    }
                    width => {
                        self.asm.mov_ri64(TMP1, (1u64 << width) - 1);
                        self.asm.and_rr(true, rd, TMP1);
                    }
                }
            }
            Op::Sbfe { src, lsb, width } => {
                let rd = self.host_reg(node)?;
                let rs = self.host_reg(src)?;
                self.asm.mov_rr(true, rd, rs);
                // Shift the field to the top, then arithmetic shift down.
                let up = 64 - (u32::from(lsb) + u32::from(width));
                if up != 0 {
                    self.asm.shl_ri(true, rd, up as u8);
                }
                self.asm.sar_ri(true, rd, (64 - u32::from(width)) as u8);
                self.mask_narrow(rd, size);
                if size == OpSize::I32 {
                    self.asm.mov_rr(false, rd, rd);
                }
            }
            Op::Rev { src } => {
                if size.bits() < 32 {
                    return Err(BackendError::UnsupportedOp { op: "narrow byte swap" });
                }
                let rd = self.host_reg(node)?;
                let rs = self.host_reg(src)?;
                self.asm.mov_rr(true, rd, rs);
                self.asm.bswap(w, rd);
            }
            Op::Popcount { src } => {
                let rd = self.host_reg(node)?;
                let rs = self.host_reg(src)?;
                self.asm.popcnt(w || size == OpSize::I32, rd, rs);
            }
            Op::Select { cond, compare_size, cmp1, cmp2, true_val, false_val } => {
                let cc = self.emit_compare(cond, compare_size, cmp1, cmp2)?;
                let rd = self.host_reg(node)?;
                let rf = self.arg_reg(false_val, TMP1)?;
                let mut rt = self.arg_reg(true_val, TMP2)?;
                if rd == rt {
                    self.asm.mov_rr(true, TMP2, rt);
                    rt = TMP2;
                }
                self.asm.mov_rr(true, rd, rf);
                self.asm.cmov(cc, true, rd, rt);
            }

            Op::LoadMem { addr, offset, .. } | Op::LoadMemTso { addr, offset, .. } => {
                if offset.is_valid() {
                    return Err(BackendError::UnsupportedOp { op: "indexed load" });
                }
                // The host is TSO; guest TSO loads need no fences.
                let bytes = Self::sized(size)?;
                let rd = self.host_reg(node)?;
                let ra = self.host_reg(addr)?;
                self.asm.mov_load(bytes, rd, ra, 0);
            }
            Op::StoreMem { addr, value, offset, .. }
            | Op::StoreMemTso { addr, value, offset, .. } => {
                if offset.is_valid() {
                    return Err(BackendError::UnsupportedOp { op: "indexed store" });
                }
                let bytes = Self::sized(size)?;
                let ra = self.host_reg(addr)?;
                let rv = self.arg_reg(value, TMP1)?;
                self.asm.mov_store(bytes, ra, 0, rv);
            }

            Op::AtomicFetchAdd { addr, value } => {
                let bytes = Self::sized(size)?;
                let rd = self.host_reg(node)?;
                let ra = self.host_reg(addr)?;
                let rv = self.host_reg(value)?;
                if rd == ra {
                    // Keep the address intact while xadd swaps through a
                    // temp.
                    self.asm.mov_rr(true, TMP2, rv);
                    self.asm.lock_xadd_mem(bytes, ra, 0, TMP2);
                    self.asm.mov_rr(true, rd, TMP2);
                } else {
                    self.asm.mov_rr(true, rd, rv);
                    self.asm.lock_xadd_mem(bytes, ra, 0, rd);
                }
            }
            Op::AtomicAdd { addr, value } => {
                let bytes = Self::sized(size)?;
                let ra = self.host_reg(addr)?;
                let rv = self.host_reg(value)?;
                self.asm.lock_alu_mem(0x01, bytes, ra, 0, rv);
            }
            Op::AtomicSub { addr, value } => {
                let bytes = Self::sized(size)?;
                let ra = self.host_reg(addr)?;
                let rv = self.host_reg(value)?;
                self.asm.lock_alu_mem(0x29, bytes, ra, 0, rv);
            }
            Op::AtomicAnd { addr, value } => {
                let bytes = Self::sized(size)?;
                let ra = self.host_reg(addr)?;
                let rv = self.host_reg(value)?;
                self.asm.lock_alu_mem(0x21, bytes, ra, 0, rv);
            }
            Op::AtomicOr { addr, value } => {
                let bytes = Self::sized(size)?;
                let ra = self.host_reg(addr)?;
                let rv = self.host_reg(value)?;
                self.asm.lock_alu_mem(0x09, bytes, ra, 0, rv);
            }
            Op::AtomicXor { addr, value } => {
                let bytes = Self::sized(size)?;
                let ra = self.host_reg(addr)?;
                let rv = self.host_reg(value)?;
                self.asm.lock_alu_mem(0x31, bytes, ra, 0, rv);
            }

            Op::SpillRegister { value, slot } => {
                let rs = self.host_reg(value)?;
                self.asm
                    .mov_store(8, emit::RSP, (slot * SPILL_SLOT_SIZE) as i32, rs);
            }
            Op::FillRegister { slot, .. } => {
                let rd = self.host_reg(node)?;
                self.asm
                    .mov_load(8, rd, emit::RSP, (slot * SPILL_SLOT_SIZE) as i32);
            }

            Op::Jump { target } => {
                let label = self.block_labels[&target];
                self.asm.jmp(label);
            }
            Op::CondJump { cond, compare_size, cmp1, cmp2, true_block, false_block } => {
                let cc = self.emit_compare(cond, compare_size, cmp1, cmp2)?;
                let true_label = self.block_labels[&true_block];
                let false_label = self.block_labels[&false_block];
                self.asm.jcc(cc, true_label);
                self.asm.jmp(false_label);
            }
            Op::ExitFunction { new_rip } => {
                let rv = self.arg_reg(new_rip, TMP1)?;
                self.asm.mov_store(8, STATE, offsets::rip() as i32, rv);
                self.asm.mov_ri64(emit::RAX, STATUS_CONTINUE);
                let label = self.epilogue;
                self.asm.jmp(label);
            }
            Op::Break { reason } => {
                if reason.trap_number == traps::TRAP_HLT {
                    self.asm.mov_ri64(emit::RAX, STATUS_HALT);
                } else {
                    let packed = 1u64
                        | (u64::from(reason.signal) << 8)
                        | (u64::from(reason.trap_number) << 16)
                        | (u64::from(reason.si_code) << 24)
                        | (u64::from(reason.error_register) << 32);
                    self.asm.mov_ri64(TMP1, packed);
                    self.asm.mov_store(
                        8,
                        STATE,
                        offsets::frame_synchronous_fault_data() as i32,
                        TMP1,
                    );
                    self.asm.mov_ri64(emit::RAX, STATUS_FAULT);
                }
                let label = self.epilogue;
                self.asm.jmp(label);
            }

            _ => return Err(BackendError::UnsupportedOp { op: payload.op.name() }),
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn binary_alu(
        &mut self,
        node: NodeId,
        src1: NodeId,
        src2: NodeId,
        w: bool,
        size: OpSize,
        reg_form: impl Fn(&mut Assembler, bool, Reg, Reg),
        imm_form: Option<impl Fn(&mut Assembler, bool, Reg, i32)>,
    ) -> Result<(), BackendError> {
        let rd = self.host_reg(node)?;
        let rn = self.host_reg(src1)?;
        // Two-address form: move first, operate in place. The temp covers
        // the rd == src2 alias.
        let inline = self.inline_value(src2);
        match (inline, imm_form) {
            (Some(value), Some(imm_form)) if i32::try_from(value).is_ok() => {
                self.asm.mov_rr(true, rd, rn);
                imm_form(&mut self.asm, w, rd, value as i32);
            }
            _ => {
                let rm = self.arg_reg(src2, TMP1)?;
                if rd == rm {
                    self.asm.mov_rr(true, TMP2, rm);
                    self.asm.mov_rr(true, rd, rn);
                    reg_form(&mut self.asm, w, rd, TMP2);
                } else {
                    self.asm.mov_rr(true, rd, rn);
                    reg_form(&mut self.asm, w, rd, rm);
                }
            }
        }
        self.mask_narrow(rd, size);
        Ok(())
    }
}

impl CpuBackend for X64Backend {
    fn name(&self) -> &'static str {
        "x64"
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
        let spill_bytes = ((ra.spill_slots() * SPILL_SLOT_SIZE) + 15) & !15;

        let mut asm = Assembler::new();
        let epilogue = asm.create_label();
        let mut lowering = Lowering {
            asm,
            ir,
            ra,
            block_labels: HashMap::new(),
            epilogue,
        };
        for block in blocks(ir) {
            let label = lowering.asm.create_label();
            lowering.block_labels.insert(block, label);
        }

        // Prologue: save callee-saved registers we repurpose, pin STATE.
        lowering.asm.push_r(3); // rbx
        lowering.asm.push_r(TMP1);
        lowering.asm.push_r(TMP2);
        lowering.asm.push_r(STATE);
        if spill_bytes != 0 {
            lowering.asm.sub_ri(true, emit::RSP, spill_bytes as i32);
        }
        lowering.asm.mov_rr(true, STATE, 7); // rdi carries the frame

        for block in blocks(ir) {
            let label = lowering.block_labels[&block];
            lowering.asm.bind_label(label);
            for node in block_ops(ir, block) {
                lowering.lower_op(node)?;
            }
        }

        let epilogue = lowering.epilogue;
        lowering.asm.bind_label(epilogue);
        if spill_bytes != 0 {
            lowering.asm.add_ri(true, emit::RSP, spill_bytes as i32);
        }
        lowering.asm.pop_r(STATE);
        lowering.asm.pop_r(TMP2);
        lowering.asm.pop_r(TMP1);
        lowering.asm.pop_r(3);
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

#[cfg(target_arch = "x86_64")]
unsafe fn invoke_native(entry: u64, frame: *mut CpuStateFrame) -> BlockExit {
    let block: unsafe extern "C" fn(*mut CpuStateFrame) -> u64 = core::mem::transmute(entry);
    match block(frame) {
        0 => BlockExit::Continue,
        1 => BlockExit::Halt,
        _ => BlockExit::Fault,
    }
}

#[cfg(not(target_arch = "x86_64"))]
unsafe fn invoke_native(_entry: u64, _frame: *mut CpuStateFrame) -> BlockExit {
    unreachable!("x86-64 code invoked on a foreign host")
}

#[cfg(test)]
mod tests {
    use super::*;
    use silex_ir::passes::RegisterAllocationPass;
    use silex_ir::pool::IntrusivePooledAllocator;
    use silex_ir::IrEmitter;

    fn lower(build: impl FnOnce(&mut IrEmitter)) -> Result<u64, BackendError> {
        let mut emitter = IrEmitter::new(IntrusivePooledAllocator::new_heap());
        build(&mut emitter);
        let mut ra_pass = RegisterAllocationPass::new(ra_config());
        let ra = ra_pass.run(&mut emitter).expect("alloc");
        let mut backend = X64Backend::new().expect("backend");
        backend.compile(0x1000, emitter.data(), Some(&ra))
    }

    #[test]
    fn compiles_simple_region() {
        let entry = lower(|e| {
            let block = e.create_code_node();
            e.start_block(block);
            let value = e.constant(OpSize::I64, 42);
            e.store_register(OpSize::I64, RegClass::Gpr, 0, value);
            let rip = e.constant(OpSize::I64, 0x1008);
            e.exit_function(rip);
            e.finish_block(block);
        })
        .expect("compile");
        assert_ne!(entry, 0);
        let code = unsafe { core::slice::from_raw_parts(entry as *const u8, 64) };
        // Prologue starts by saving rbx.
        assert_eq!(code[0], 0x53);
    }

    #[test]
    fn dynamic_shift_falls_back() {
        let result = lower(|e| {
            let block = e.create_code_node();
            e.start_block(block);
            let value = e.load_register(OpSize::I64, RegClass::Gpr, 0);
            let amount = e.load_register(OpSize::I64, RegClass::Gpr, 1);
            let shifted = e.lshl(OpSize::I64, value, amount);
            e.store_register(OpSize::I64, RegClass::Gpr, 0, shifted);
            let rip = e.constant(OpSize::I64, 0);
            e.exit_function(rip);
            e.finish_block(block);
        });
        assert!(matches!(result, Err(BackendError::UnsupportedOp { .. })));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn executes_mov_and_exit_natively() {
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
        let mut backend = X64Backend::new().expect("backend");
        let entry = backend
            .compile(0x1000, emitter.data(), Some(&ra))
            .expect("compile");

        let mut frame = silex_types::CpuStateFrame::new();
        let exit = unsafe { backend.invoke(entry, &mut *frame) };
        assert_eq!(exit, BlockExit::Continue);
        assert_eq!(frame.state.gregs[0], 42);
        assert_eq!(frame.state.rip, 0x1008);
    }
}
