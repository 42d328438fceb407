//! Lazy guest flag tracking.
//!
//! Flag-defining instructions record what happened (operation kind, size,
//! and the 1-2 values involved) instead of computing eflags. The raw parity
//! and auxiliary-carry inputs are stored immediately (they are just the
//! result byte and `src1 ^ src2`) while NZCV materialization is deferred to
//! the first read. Definitions that are never read cost nothing.
//!
//! CF keeps the host convention after subtractions (carry = no borrow) with
//! a compile-time `cf_inverted` bit; readers rectify, and block boundaries
//! force the canonical x86 sense so cross-block state is uniform.

use silex_ir::{CondCode, NodeId, OpSize, RegClass};
use silex_types::x86;
use silex_types::{AF_AS_GREG, PF_AS_GREG};

use crate::dispatcher::OpDispatchBuilder;

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum FlagsOp {
    None,
    Add,
    Sub,
    Logical,
    /// Signed multiply: `src1` holds the high half.
    Mul,
    /// Unsigned multiply: `src1` holds the high half.
    UMul,
    ShlImm(u8),
    ShrImm(u8),
    SarImm(u8),
}

#[derive(Clone, Copy)]
pub struct DeferredFlags {
    pub op: FlagsOp,
    pub size: OpSize,
    pub res: NodeId,
    pub src1: NodeId,
    pub src2: NodeId,
    /// NZCV.C currently holds the inverse of x86 CF.
    pub cf_inverted: bool,
}

impl Default for DeferredFlags {
    fn default() -> Self {
        DeferredFlags {
            op: FlagsOp::None,
            size: OpSize::I64,
            res: NodeId::INVALID,
            src1: NodeId::INVALID,
            src2: NodeId::INVALID,
            cf_inverted: false,
        }
    }
}

const NZCV_FLAG: u32 = x86::FLAG_NZCV as u32;

impl<'a> OpDispatchBuilder<'a> {
    // ------------------------------------------------------------------
    // Raw storage helpers.

    /// Record the parity input: the low byte of the result.
    pub(crate) fn store_pf_raw(&mut self, res: NodeId) {
        let byte = self.ir.bfe(OpSize::I32, res, 0, 8);
        self.store_raw_reg(PF_AS_GREG, byte);
    }

    /// Record the auxiliary-carry input: `src1 ^ src2`.
    pub(crate) fn store_af_raw(&mut self, src1: NodeId, src2: NodeId) {
        let xor = self.ir.xor(OpSize::I32, src1, src2);
        let byte = self.ir.bfe(OpSize::I32, xor, 0, 8);
        self.store_raw_reg(AF_AS_GREG, byte);
    }

    fn store_raw_reg(&mut self, reg: u32, value: NodeId) {
        self.ir.store_register(OpSize::I32, RegClass::Gpr, reg, value);
        self.gpr_cache[reg as usize] = Some(value);
    }

    pub(crate) fn load_raw_reg(&mut self, reg: u32) -> NodeId {
        if let Some(node) = self.gpr_cache[reg as usize] {
            return node;
        }
        let node = self.ir.load_register(OpSize::I32, RegClass::Gpr, reg);
        self.gpr_cache[reg as usize] = Some(node);
        node
    }

    // ------------------------------------------------------------------
    // Definition sites.

    pub fn calculate_flags_add(&mut self, size: OpSize, res: NodeId, src1: NodeId, src2: NodeId) {
        self.store_pf_raw(res);
        self.store_af_raw(src1, src2);
        self.flags = DeferredFlags {
            op: FlagsOp::Add,
            size,
            res,
            src1,
            src2,
            cf_inverted: false,
        };
    }

    pub fn calculate_flags_sub(&mut self, size: OpSize, res: NodeId, src1: NodeId, src2: NodeId) {
        self.store_pf_raw(res);
        self.store_af_raw(src1, src2);
        self.flags = DeferredFlags {
            op: FlagsOp::Sub,
            size,
            res,
            src1,
            src2,
            cf_inverted: false,
        };
    }

    pub fn calculate_flags_logical(
        &mut self,
        size: OpSize,
        res: NodeId,
        src1: NodeId,
        src2: NodeId,
    ) {
        self.store_pf_raw(res);
        self.store_af_raw(src1, src2);
        self.flags = DeferredFlags {
            op: FlagsOp::Logical,
            size,
            res,
            src1,
            src2,
            cf_inverted: false,
        };
    }

    /// `high` is the upper half of the widened product.
    pub fn calculate_flags_mul(&mut self, size: OpSize, low: NodeId, high: NodeId) {
        self.store_pf_raw(low);
        self.flags = DeferredFlags {
            op: FlagsOp::Mul,
            size,
            res: low,
            src1: high,
            src2: NodeId::INVALID,
            cf_inverted: false,
        };
    }

    pub fn calculate_flags_umul(&mut self, size: OpSize, low: NodeId, high: NodeId) {
        self.store_pf_raw(low);
        self.flags = DeferredFlags {
            op: FlagsOp::UMul,
            size,
            res: low,
            src1: high,
            src2: NodeId::INVALID,
            cf_inverted: false,
        };
    }

    pub fn calculate_flags_shift_left_immediate(
        &mut self,
        size: OpSize,
        res: NodeId,
        src: NodeId,
        amount: u8,
    ) {
        if amount == 0 {
            return;
        }
        self.store_pf_raw(res);
        self.flags = DeferredFlags {
            op: FlagsOp::ShlImm(amount),
            size,
            res,
            src1: src,
            src2: NodeId::INVALID,
            cf_inverted: false,
        };
    }

    pub fn calculate_flags_shift_right_immediate(
        &mut self,
        size: OpSize,
        res: NodeId,
        src: NodeId,
        amount: u8,
    ) {
        if amount == 0 {
            return;
        }
        self.store_pf_raw(res);
        self.flags = DeferredFlags {
            op: FlagsOp::ShrImm(amount),
            size,
            res,
            src1: src,
            src2: NodeId::INVALID,
            cf_inverted: false,
        };
    }

    pub fn calculate_flags_sign_shift_right_immediate(
        &mut self,
        size: OpSize,
        res: NodeId,
        src: NodeId,
        amount: u8,
    ) {
        if amount == 0 {
            return;
        }
        self.store_pf_raw(res);
        self.flags = DeferredFlags {
            op: FlagsOp::SarImm(amount),
            size,
            res,
            src1: src,
            src2: NodeId::INVALID,
            cf_inverted: false,
        };
    }

    // ------------------------------------------------------------------
    // Materialization.

    pub(crate) fn bit_value(
        &mut self,
        cond: CondCode,
        size: OpSize,
        lhs: NodeId,
        rhs: NodeId,
    ) -> NodeId {
        let one = self.ir.constant(OpSize::I32, 1);
        let zero = self.ir.constant(OpSize::I32, 0);
        self.ir.select(OpSize::I32, cond, size, lhs, rhs, one, zero)
    }

    /// Compose an NZCV word from four 0/1 values.
    fn pack_nzcv(&mut self, n: NodeId, z: NodeId, c: NodeId, v: NodeId) -> NodeId {
        let n_shifted = {
            let amount = self.ir.constant(OpSize::I32, u64::from(x86::NZCV_N_BIT));
            self.ir.lshl(OpSize::I32, n, amount)
        };
        let z_shifted = {
            let amount = self.ir.constant(OpSize::I32, u64::from(x86::NZCV_Z_BIT));
            self.ir.lshl(OpSize::I32, z, amount)
        };
        let c_shifted = {
            let amount = self.ir.constant(OpSize::I32, u64::from(x86::NZCV_C_BIT));
            self.ir.lshl(OpSize::I32, c, amount)
        };
        let v_shifted = {
            let amount = self.ir.constant(OpSize::I32, u64::from(x86::NZCV_V_BIT));
            self.ir.lshl(OpSize::I32, v, amount)
        };
        let nz = self.ir.or(OpSize::I32, n_shifted, z_shifted);
        let cv = self.ir.or(OpSize::I32, c_shifted, v_shifted);
        self.ir.or(OpSize::I32, nz, cv)
    }

    /// Flush any deferred flag definition into the NZCV slot.
    pub fn calculate_deferred_flags(&mut self) {
        let deferred = self.flags;
        if deferred.op == FlagsOp::None {
            return;
        }
        // Mark resolved before emitting, so nested reads see a clean state.
        self.flags.op = FlagsOp::None;
        self.flags.cf_inverted = false;

        let size = deferred.size;
        let bits = size.bits();
        let zero = self.ir.constant(size, 0);
        let res = deferred.res;

        let n = self.bit_value(CondCode::Slt, size, res, zero);
        let z = self.bit_value(CondCode::Eq, size, res, zero);

        let (c, v, cf_inverted) = match deferred.op {
            FlagsOp::Add => {
                // Carry out iff the result wrapped below a source.
                let c = self.bit_value(CondCode::Ult, size, res, deferred.src1);
                // Overflow iff both sources disagree with the result's sign.
                let sx1 = self.ir.xor(size, deferred.src1, res);
                let sx2 = self.ir.xor(size, deferred.src2, res);
                let both = self.ir.and(size, sx1, sx2);
                let v = self.ir.bfe(OpSize::I32, both, (bits - 1) as u8, 1);
                (c, v, false)
            }
            FlagsOp::Sub => {
                // Host convention: C set iff no borrow.
                let c = self.bit_value(CondCode::Uge, size, deferred.src1, deferred.src2);
                let sources = self.ir.xor(size, deferred.src1, deferred.src2);
                let result = self.ir.xor(size, deferred.src1, res);
                let both = self.ir.and(size, sources, result);
                let v = self.ir.bfe(OpSize::I32, both, (bits - 1) as u8, 1);
                (c, v, true)
            }
            FlagsOp::Logical => {
                let c = self.ir.constant(OpSize::I32, 0);
                let v = self.ir.constant(OpSize::I32, 0);
                (c, v, false)
            }
            FlagsOp::Mul => {
                // CF = OF = high half differs from the low half's sign
                // extension.
                let amount = self.ir.constant(size, u64::from(bits - 1));
                let sign = self.ir.ashr(size, res, amount);
                let differs = self.bit_value(CondCode::Neq, size, deferred.src1, sign);
                (differs, differs, false)
            }
            FlagsOp::UMul => {
                let differs = self.bit_value(CondCode::Neq, size, deferred.src1, zero);
                (differs, differs, false)
            }
            FlagsOp::ShlImm(amount) => {
                let c = self.ir.bfe(OpSize::I32, deferred.src1, (bits - amount as u32) as u8, 1);
                // OF defined for 1-bit shifts: MSB(res) ^ CF.
                let msb = self.ir.bfe(OpSize::I32, res, (bits - 1) as u8, 1);
                let v = self.ir.xor(OpSize::I32, msb, c);
                (c, v, false)
            }
            FlagsOp::ShrImm(amount) => {
                let c = self.ir.bfe(OpSize::I32, deferred.src1, amount - 1, 1);
                // OF defined for 1-bit shifts: the original MSB.
                let v = self.ir.bfe(OpSize::I32, deferred.src1, (bits - 1) as u8, 1);
                (c, v, false)
            }
            FlagsOp::SarImm(amount) => {
                let c = self.ir.bfe(OpSize::I32, deferred.src1, amount - 1, 1);
                let v = self.ir.constant(OpSize::I32, 0);
                (c, v, false)
            }
            FlagsOp::None => unreachable!(),
        };

        let nzcv = self.pack_nzcv(n, z, c, v);
        self.ir.store_flag(NZCV_FLAG, nzcv);
        self.flags.cf_inverted = cf_inverted;
    }

    /// Force the canonical (non-inverted) carry sense. Required before
    /// leaving a block or handing flags to anything that snapshots them.
    pub fn rectify_cf(&mut self) {
        self.calculate_deferred_flags();
        if !self.flags.cf_inverted {
            return;
        }
        self.flags.cf_inverted = false;
        let nzcv = self.ir.load_flag(NZCV_FLAG);
        let mask = self.ir.constant(OpSize::I32, 1 << x86::NZCV_C_BIT);
        let fixed = self.ir.xor(OpSize::I32, nzcv, mask);
        self.ir.store_flag(NZCV_FLAG, fixed);
    }

    /// Write NZCV eagerly from four 0/1 values, clearing any deferral.
    pub fn set_nzcv_direct(&mut self, n: NodeId, z: NodeId, c: NodeId, v: NodeId) {
        self.flags.op = FlagsOp::None;
        self.flags.cf_inverted = false;
        let nzcv = self.pack_nzcv(n, z, c, v);
        self.ir.store_flag(NZCV_FLAG, nzcv);
    }

    // ------------------------------------------------------------------
    // Read sites.

    /// Read one architectural flag as a 0/1 value.
    pub fn get_rflag(&mut self, flag: usize) -> NodeId {
        self.calculate_deferred_flags();
        match flag {
            x86::FLAG_SF_RAW => self.read_nzcv_bit(x86::NZCV_N_BIT, false),
            x86::FLAG_ZF_RAW => self.read_nzcv_bit(x86::NZCV_Z_BIT, false),
            x86::FLAG_CF_RAW => self.read_nzcv_bit(x86::NZCV_C_BIT, self.flags.cf_inverted),
            x86::FLAG_OF_RAW => self.read_nzcv_bit(x86::NZCV_V_BIT, false),
            x86::FLAG_PF_RAW => {
                // PF = popcount(raw_byte ^ 1) & 1.
                let raw = self.load_raw_reg(PF_AS_GREG);
                let byte = self.ir.bfe(OpSize::I32, raw, 0, 8);
                let one = self.ir.constant(OpSize::I32, 1);
                let flipped = self.ir.xor(OpSize::I32, byte, one);
                let count = self.ir.popcount(OpSize::I32, flipped);
                self.ir.and(OpSize::I32, count, one)
            }
            x86::FLAG_AF_RAW => {
                // AF = bit 4 of (af_raw ^ result), and pf_raw *is* the
                // result's low byte.
                let af = self.load_raw_reg(AF_AS_GREG);
                let pf = self.load_raw_reg(PF_AS_GREG);
                let xor = self.ir.xor(OpSize::I32, af, pf);
                self.ir.bfe(OpSize::I32, xor, 4, 1)
            }
            _ => {
                let byte = self.ir.load_flag(flag as u32);
                self.ir.bfe(OpSize::I32, byte, 0, 1)
            }
        }
    }

    fn read_nzcv_bit(&mut self, bit: u32, invert: bool) -> NodeId {
        let nzcv = self.ir.load_flag(NZCV_FLAG);
        let value = self.ir.bfe(OpSize::I32, nzcv, bit as u8, 1);
        if invert {
            let one = self.ir.constant(OpSize::I32, 1);
            self.ir.xor(OpSize::I32, value, one)
        } else {
            value
        }
    }

    /// Write one architectural flag from a 0/1 value.
    pub fn set_rflag(&mut self, flag: usize, value: NodeId) {
        self.rectify_cf();
        match flag {
            x86::FLAG_SF_RAW => self.write_nzcv_bit(x86::NZCV_N_BIT, value),
            x86::FLAG_ZF_RAW => self.write_nzcv_bit(x86::NZCV_Z_BIT, value),
            x86::FLAG_CF_RAW => self.write_nzcv_bit(x86::NZCV_C_BIT, value),
            x86::FLAG_OF_RAW => self.write_nzcv_bit(x86::NZCV_V_BIT, value),
            x86::FLAG_PF_RAW => {
                // Store a byte whose parity reconstructs to `value`:
                // raw = value ^ 1 keeps exactly one bit of entropy.
                let one = self.ir.constant(OpSize::I32, 1);
                let raw = self.ir.xor(OpSize::I32, value, one);
                self.store_raw_reg(PF_AS_GREG, raw);
            }
            x86::FLAG_AF_RAW => {
                // Store `value << 4` xored with the current result byte so
                // the read-side xor recovers it.
                let four = self.ir.constant(OpSize::I32, 4);
                let shifted = self.ir.lshl(OpSize::I32, value, four);
                let pf = self.load_raw_reg(PF_AS_GREG);
                let raw = self.ir.xor(OpSize::I32, shifted, pf);
                self.store_raw_reg(AF_AS_GREG, raw);
            }
            _ => {
                self.ir.store_flag(flag as u32, value);
            }
        }
    }

    fn write_nzcv_bit(&mut self, bit: u32, value: NodeId) {
        let nzcv = self.ir.load_flag(NZCV_FLAG);
        let merged = self.ir.bfi(OpSize::I32, nzcv, value, bit as u8, 1);
        self.ir.store_flag(NZCV_FLAG, merged);
    }

    /// Evaluate one of the sixteen x86 condition codes as a 0/1 value.
    pub fn condition_value(&mut self, cc: u8) -> NodeId {
        let base = match cc & 0xe {
            0x0 => self.get_rflag(x86::FLAG_OF_RAW),
            0x2 => self.get_rflag(x86::FLAG_CF_RAW),
            0x4 => self.get_rflag(x86::FLAG_ZF_RAW),
            0x6 => {
                let cf = self.get_rflag(x86::FLAG_CF_RAW);
                let zf = self.get_rflag(x86::FLAG_ZF_RAW);
                self.ir.or(OpSize::I32, cf, zf)
            }
            0x8 => self.get_rflag(x86::FLAG_SF_RAW),
            0xa => self.get_rflag(x86::FLAG_PF_RAW),
            0xc => {
                let sf = self.get_rflag(x86::FLAG_SF_RAW);
                let of = self.get_rflag(x86::FLAG_OF_RAW);
                self.ir.xor(OpSize::I32, sf, of)
            }
            _ => {
                let sf = self.get_rflag(x86::FLAG_SF_RAW);
                let of = self.get_rflag(x86::FLAG_OF_RAW);
                let zf = self.get_rflag(x86::FLAG_ZF_RAW);
                let lt = self.ir.xor(OpSize::I32, sf, of);
                self.ir.or(OpSize::I32, lt, zf)
            }
        };
        if cc & 1 != 0 {
            let one = self.ir.constant(OpSize::I32, 1);
            self.ir.xor(OpSize::I32, base, one)
        } else {
            base
        }
    }

    /// Assemble the packed RFLAGS image (pushf, syscall's r11).
    pub fn get_packed_rflags(&mut self) -> NodeId {
        self.rectify_cf();
        let mut packed = self.ir.constant(OpSize::I64, 1 << x86::FLAG_RESERVED);
        for flag in [
            x86::FLAG_CF_RAW,
            x86::FLAG_PF_RAW,
            x86::FLAG_AF_RAW,
            x86::FLAG_ZF_RAW,
            x86::FLAG_SF_RAW,
            x86::FLAG_TF,
            x86::FLAG_IF,
            x86::FLAG_OF_RAW,
        ] {
            let value = self.get_rflag(flag);
            let shifted = {
                let amount = self.ir.constant(OpSize::I64, flag as u64);
                self.ir.lshl(OpSize::I64, value, amount)
            };
            packed = self.ir.or(OpSize::I64, packed, shifted);
        }
        // DF is stored 1/-1 internally; expose the architectural bit.
        let df = self.ir.load_flag(x86::FLAG_DF_RAW as u32);
        let df_bit = self.ir.bfe(OpSize::I32, df, 7, 1); // sign bit of the byte
        let df_shifted = {
            let amount = self.ir.constant(OpSize::I64, x86::FLAG_DF_RAW as u64);
            self.ir.lshl(OpSize::I64, df_bit, amount)
        };
        self.ir.or(OpSize::I64, packed, df_shifted)
    }

    /// Scatter a packed RFLAGS image back into flag storage.
    pub fn set_packed_rflags(&mut self, packed: NodeId) {
        self.flags.op = FlagsOp::None;
        self.flags.cf_inverted = false;
        for flag in [
            x86::FLAG_CF_RAW,
            x86::FLAG_PF_RAW,
            x86::FLAG_AF_RAW,
            x86::FLAG_ZF_RAW,
            x86::FLAG_SF_RAW,
            x86::FLAG_TF,
            x86::FLAG_OF_RAW,
        ] {
            let bit = self.ir.bfe(OpSize::I32, packed, flag as u8, 1);
            self.set_rflag(flag, bit);
        }
        // DF bit -> internal 1/-1 byte.
        let df_bit = self.ir.bfe(OpSize::I32, packed, x86::FLAG_DF_RAW as u8, 1);
        let one = self.ir.constant(OpSize::I8, 1);
        let minus_one = self.ir.constant(OpSize::I8, 0xff);
        let zero = self.ir.constant(OpSize::I32, 0);
        let df = self.ir.select(OpSize::I8, CondCode::Eq, OpSize::I32, df_bit, zero, one, minus_one);
        self.ir.store_flag(x86::FLAG_DF_RAW as u32, df);
    }
}
