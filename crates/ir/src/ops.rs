//! IR operation payloads.
//!
//! Each op is a variant of the `Op` enum carrying its arguments as `NodeId`s
//! plus whatever immediates the operation needs. The common header (result
//! size and element size) lives alongside the tag in `OpPayload`.
//!
//! Ops are plain data: `Copy`, no heap, so a whole op arena can be cloned
//! with a memcpy and serialized as-is.

use core::fmt;

use crate::node::NodeId;

/// Operand or result width in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum OpSize {
    I8 = 1,
    I16 = 2,
    I32 = 4,
    I64 = 8,
    I128 = 16,
    I256 = 32,
}

impl OpSize {
    pub fn bytes(self) -> u32 {
        self as u32
    }

    pub fn bits(self) -> u32 {
        self.bytes() * 8
    }

    pub fn from_bytes(bytes: u32) -> Option<OpSize> {
        match bytes {
            1 => Some(OpSize::I8),
            2 => Some(OpSize::I16),
            4 => Some(OpSize::I32),
            8 => Some(OpSize::I64),
            16 => Some(OpSize::I128),
            32 => Some(OpSize::I256),
            _ => None,
        }
    }

    /// Mask covering this width. Saturates at 64 bits; vector widths have no
    /// scalar mask.
    pub fn value_mask(self) -> u64 {
        match self {
            OpSize::I64 | OpSize::I128 | OpSize::I256 => u64::MAX,
            size => (1u64 << size.bits()) - 1,
        }
    }
}

impl fmt::Display for OpSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "i{}", self.bits())
    }
}

/// Register class of a value, also the packed class field of
/// `PhysicalRegister`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum RegClass {
    Gpr = 0,
    GprFixed = 1,
    Fpr = 2,
    FprFixed = 3,
    GprPair = 4,
    /// Not register allocated (inline constants, control flow).
    Complex = 5,
    Invalid = 7,
}

impl RegClass {
    pub fn from_bits(bits: u8) -> RegClass {
        match bits {
            0 => RegClass::Gpr,
            1 => RegClass::GprFixed,
            2 => RegClass::Fpr,
            3 => RegClass::FprFixed,
            4 => RegClass::GprPair,
            5 => RegClass::Complex,
            _ => RegClass::Invalid,
        }
    }
}

impl fmt::Display for RegClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            RegClass::Gpr => "GPR",
            RegClass::GprFixed => "GPRFixed",
            RegClass::Fpr => "FPR",
            RegClass::FprFixed => "FPRFixed",
            RegClass::GprPair => "GPRPair",
            RegClass::Complex => "Complex",
            RegClass::Invalid => "Invalid",
        };
        f.write_str(name)
    }
}

/// Comparison condition for `CondJump` and `Select`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum CondCode {
    Eq = 0,
    Neq,
    /// Unsigned >=
    Uge,
    /// Unsigned <
    Ult,
    /// Unsigned >
    Ugt,
    /// Unsigned <=
    Ule,
    /// Signed >=
    Sge,
    /// Signed <
    Slt,
    /// Signed >
    Sgt,
    /// Signed <=
    Sle,
    /// (lhs & rhs) == 0
    TstZ,
    /// (lhs & rhs) != 0
    TstNz,
}

impl CondCode {
    /// The condition that is true exactly when `self` is false.
    pub fn invert(self) -> CondCode {
        match self {
            CondCode::Eq => CondCode::Neq,
            CondCode::Neq => CondCode::Eq,
            CondCode::Uge => CondCode::Ult,
            CondCode::Ult => CondCode::Uge,
            CondCode::Ugt => CondCode::Ule,
            CondCode::Ule => CondCode::Ugt,
            CondCode::Sge => CondCode::Slt,
            CondCode::Slt => CondCode::Sge,
            CondCode::Sgt => CondCode::Sle,
            CondCode::Sle => CondCode::Sgt,
            CondCode::TstZ => CondCode::TstNz,
            CondCode::TstNz => CondCode::TstZ,
        }
    }

    pub fn evaluate(self, size: OpSize, lhs: u64, rhs: u64) -> bool {
        let mask = size.value_mask();
        let lhs_masked = lhs & mask;
        let rhs_masked = rhs & mask;
        let sign_extend = |value: u64| -> i64 {
            let bits = size.bits().min(64);
            let shift = 64 - bits;
            ((value << shift) as i64) >> shift
        };
        match self {
            CondCode::Eq => lhs_masked == rhs_masked,
            CondCode::Neq => lhs_masked != rhs_masked,
            CondCode::Uge => lhs_masked >= rhs_masked,
            CondCode::Ult => lhs_masked < rhs_masked,
            CondCode::Ugt => lhs_masked > rhs_masked,
            CondCode::Ule => lhs_masked <= rhs_masked,
            CondCode::Sge => sign_extend(lhs_masked) >= sign_extend(rhs_masked),
            CondCode::Slt => sign_extend(lhs_masked) < sign_extend(rhs_masked),
            CondCode::Sgt => sign_extend(lhs_masked) > sign_extend(rhs_masked),
            CondCode::Sle => sign_extend(lhs_masked) <= sign_extend(rhs_masked),
            CondCode::TstZ => lhs_masked & rhs_masked == 0,
            CondCode::TstNz => lhs_masked & rhs_masked != 0,
        }
    }
}

impl fmt::Display for CondCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            CondCode::Eq => "eq",
            CondCode::Neq => "neq",
            CondCode::Uge => "uge",
            CondCode::Ult => "ult",
            CondCode::Ugt => "ugt",
            CondCode::Ule => "ule",
            CondCode::Sge => "sge",
            CondCode::Slt => "slt",
            CondCode::Sgt => "sgt",
            CondCode::Sle => "sle",
            CondCode::TstZ => "tstz",
            CondCode::TstNz => "tstnz",
        };
        f.write_str(name)
    }
}

/// Trap reasons carried by `Break`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BreakDefinition {
    pub signal: u8,
    pub trap_number: u8,
    pub si_code: u8,
    pub error_register: u16,
}

/// 256-bit identifier of a thunk target.
pub type ThunkHash = [u8; 32];

/// The op kinds. Argument slots are `NodeId`s; the count per kind is fixed.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Op {
    /// The sentinel payload of node 0.
    Invalid,

    // Block structure.
    CodeBlock { begin: NodeId, last: NodeId },
    BeginBlock { block: NodeId },
    EndBlock { block: NodeId },

    // Constants.
    Constant { value: u64 },
    /// A constant a later backend is expected to fold into its user's
    /// immediate field. Produced by the constant inlining pass.
    InlineConstant { value: u64 },

    // Guest state access.
    LoadContext { offset: u32, class: RegClass },
    StoreContext { offset: u32, class: RegClass, value: NodeId },
    /// Read of a statically mapped guest register (0..=15 the GPRs, 16/17
    /// the raw PF/AF values).
    LoadRegister { reg: u32, class: RegClass },
    StoreRegister { reg: u32, class: RegClass, value: NodeId },
    /// Flag byte access; `flag` is the architectural bit position. The NZCV
    /// slot is accessed 32 bits wide.
    LoadFlag { flag: u32 },
    StoreFlag { flag: u32, value: NodeId },

    // Integer ALU.
    Add { src1: NodeId, src2: NodeId },
    Sub { src1: NodeId, src2: NodeId },
    Mul { src1: NodeId, src2: NodeId },
    UMul { src1: NodeId, src2: NodeId },
    MulH { src1: NodeId, src2: NodeId },
    UMulH { src1: NodeId, src2: NodeId },
    Div { src1: NodeId, src2: NodeId },
    UDiv { src1: NodeId, src2: NodeId },
    Rem { src1: NodeId, src2: NodeId },
    URem { src1: NodeId, src2: NodeId },
    And { src1: NodeId, src2: NodeId },
    Or { src1: NodeId, src2: NodeId },
    Xor { src1: NodeId, src2: NodeId },
    Lshl { src1: NodeId, src2: NodeId },
    Lshr { src1: NodeId, src2: NodeId },
    Ashr { src1: NodeId, src2: NodeId },
    Ror { src1: NodeId, src2: NodeId },
    Not { src: NodeId },
    Neg { src: NodeId },
    Popcount { src: NodeId },
    /// Count leading zeros; the full width when the source is zero.
    Clz { src: NodeId },
    /// Count trailing zeros; the full width when the source is zero.
    Ctz { src: NodeId },
    /// Byte swap.
    Rev { src: NodeId },
    Copy { src: NodeId },

    // Bitfield.
    Bfe { src: NodeId, lsb: u8, width: u8 },
    Sbfe { src: NodeId, lsb: u8, width: u8 },
    Bfi { dest: NodeId, src: NodeId, lsb: u8, width: u8 },

    Select {
        cond: CondCode,
        compare_size: OpSize,
        cmp1: NodeId,
        cmp2: NodeId,
        true_val: NodeId,
        false_val: NodeId,
    },

    // Memory. `offset` may be the invalid node for plain addressing.
    LoadMem { class: RegClass, addr: NodeId, offset: NodeId, align: u8 },
    StoreMem { class: RegClass, addr: NodeId, value: NodeId, offset: NodeId, align: u8 },
    LoadMemTso { class: RegClass, addr: NodeId, offset: NodeId, align: u8 },
    StoreMemTso { class: RegClass, addr: NodeId, value: NodeId, offset: NodeId, align: u8 },

    // Atomics. All sequentially consistent with respect to guest threads.
    Cas { expected: NodeId, desired: NodeId, addr: NodeId },
    CasPair { expected: NodeId, desired: NodeId, addr: NodeId },
    AtomicAdd { addr: NodeId, value: NodeId },
    AtomicSub { addr: NodeId, value: NodeId },
    AtomicAnd { addr: NodeId, value: NodeId },
    AtomicOr { addr: NodeId, value: NodeId },
    AtomicXor { addr: NodeId, value: NodeId },
    AtomicNeg { addr: NodeId },
    AtomicSwap { addr: NodeId, value: NodeId },
    AtomicFetchAdd { addr: NodeId, value: NodeId },
    AtomicFetchSub { addr: NodeId, value: NodeId },
    AtomicFetchAnd { addr: NodeId, value: NodeId },
    AtomicFetchOr { addr: NodeId, value: NodeId },
    AtomicFetchXor { addr: NodeId, value: NodeId },

    // Register pairs.
    CreateElementPair { lo: NodeId, hi: NodeId },
    ExtractElementPair { pair: NodeId, index: u8 },

    // Vector (128-bit lanes, element width in the header).
    VAdd { src1: NodeId, src2: NodeId },
    VSub { src1: NodeId, src2: NodeId },
    VAnd { src1: NodeId, src2: NodeId },
    VOr { src1: NodeId, src2: NodeId },
    VXor { src1: NodeId, src2: NodeId },
    /// Zero-extend a GPR value into the low lane of a vector.
    VCastFromGpr { src: NodeId },
    VExtractToGpr { vector: NodeId, index: u8 },
    /// Overwrite lane `index` of `vector` with a GPR value, preserving the
    /// other lanes.
    VInsertGpr { vector: NodeId, src: NodeId, index: u8 },

    // Scalar float.
    FAdd { src1: NodeId, src2: NodeId },
    FSub { src1: NodeId, src2: NodeId },
    FMul { src1: NodeId, src2: NodeId },
    FDiv { src1: NodeId, src2: NodeId },
    /// Result bit 0: unordered, bit 1: equal, bit 2: less-than.
    FCmp { src1: NodeId, src2: NodeId },
    /// Float to float; source width in the element size field.
    CvtFToF { src: NodeId },
    /// Signed integer (element size) to float (result size).
    CvtSIntToF { src: NodeId },
    /// Float (element size) to signed integer (result size), truncating.
    CvtFToSInt { src: NodeId },

    // System.
    CpuId { function: NodeId, leaf: NodeId },
    XGetBv { function: NodeId },
    Syscall { args: [NodeId; 7] },
    InlineSyscall { args: [NodeId; 7] },
    Thunk { arg_ptr: NodeId, hash: ThunkHash },
    /// Compare `length` bytes of guest code at `rip + offset` against the
    /// bytes captured at compile time. Non-zero result means mismatch.
    ValidateCode { offset: u64, original_lo: u64, original_hi: u64, length: u8 },
    RemoveCodeEntry { rip: u64 },
    Break { reason: BreakDefinition },

    // Control flow.
    Jump { target: NodeId },
    CondJump {
        cond: CondCode,
        compare_size: OpSize,
        cmp1: NodeId,
        cmp2: NodeId,
        true_block: NodeId,
        false_block: NodeId,
    },
    ExitFunction { new_rip: NodeId },

    // Register allocation artifacts.
    SpillRegister { value: NodeId, slot: u32 },
    FillRegister { orig: NodeId, slot: u32 },
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Invalid => "Invalid",
            Op::CodeBlock { .. } => "CodeBlock",
            Op::BeginBlock { .. } => "BeginBlock",
            Op::EndBlock { .. } => "EndBlock",
            Op::Constant { .. } => "Constant",
            Op::InlineConstant { .. } => "InlineConstant",
            Op::LoadContext { .. } => "LoadContext",
            Op::StoreContext { .. } => "StoreContext",
            Op::LoadRegister { .. } => "LoadRegister",
            Op::StoreRegister { .. } => "StoreRegister",
            Op::LoadFlag { .. } => "LoadFlag",
            Op::StoreFlag { .. } => "StoreFlag",
            Op::Add { .. } => "Add",
            Op::Sub { .. } => "Sub",
            Op::Mul { .. } => "Mul",
            Op::UMul { .. } => "UMul",
            Op::MulH { .. } => "MulH",
            Op::UMulH { .. } => "UMulH",
            Op::Div { .. } => "Div",
            Op::UDiv { .. } => "UDiv",
            Op::Rem { .. } => "Rem",
            Op::URem { .. } => "URem",
            Op::And { .. } => "And",
            Op::Or { .. } => "Or",
            Op::Xor { .. } => "Xor",
            Op::Lshl { .. } => "Lshl",
            Op::Lshr { .. } => "Lshr",
            Op::Ashr { .. } => "Ashr",
            Op::Ror { .. } => "Ror",
            Op::Not { .. } => "Not",
            Op::Neg { .. } => "Neg",
            Op::Popcount { .. } => "Popcount",
            Op::Clz { .. } => "Clz",
            Op::Ctz { .. } => "Ctz",
            Op::Rev { .. } => "Rev",
            Op::Copy { .. } => "Copy",
            Op::Bfe { .. } => "Bfe",
            Op::Sbfe { .. } => "Sbfe",
            Op::Bfi { .. } => "Bfi",
            Op::Select { .. } => "Select",
            Op::LoadMem { .. } => "LoadMem",
            Op::StoreMem { .. } => "StoreMem",
            Op::LoadMemTso { .. } => "LoadMemTSO",
            Op::StoreMemTso { .. } => "StoreMemTSO",
            Op::Cas { .. } => "CAS",
            Op::CasPair { .. } => "CASPair",
            Op::AtomicAdd { .. } => "AtomicAdd",
            Op::AtomicSub { .. } => "AtomicSub",
            Op::AtomicAnd { .. } => "AtomicAnd",
            Op::AtomicOr { .. } => "AtomicOr",
            Op::AtomicXor { .. } => "AtomicXor",
            Op::AtomicNeg { .. } => "AtomicNeg",
            Op::AtomicSwap { .. } => "AtomicSwap",
            Op::AtomicFetchAdd { .. } => "AtomicFetchAdd",
            Op::AtomicFetchSub { .. } => "AtomicFetchSub",
            Op::AtomicFetchAnd { .. } => "AtomicFetchAnd",
            Op::AtomicFetchOr { .. } => "AtomicFetchOr",
            Op::AtomicFetchXor { .. } => "AtomicFetchXor",
            Op::CreateElementPair { .. } => "CreateElementPair",
            Op::ExtractElementPair { .. } => "ExtractElementPair",
            Op::VAdd { .. } => "VAdd",
            Op::VSub { .. } => "VSub",
            Op::VAnd { .. } => "VAnd",
            Op::VOr { .. } => "VOr",
            Op::VXor { .. } => "VXor",
            Op::VCastFromGpr { .. } => "VCastFromGPR",
            Op::VExtractToGpr { .. } => "VExtractToGPR",
            Op::VInsertGpr { .. } => "VInsertGPR",
            Op::FAdd { .. } => "FAdd",
            Op::FSub { .. } => "FSub",
            Op::FMul { .. } => "FMul",
            Op::FDiv { .. } => "FDiv",
            Op::FCmp { .. } => "FCmp",
            Op::CvtFToF { .. } => "CvtFToF",
            Op::CvtSIntToF { .. } => "CvtSIntToF",
            Op::CvtFToSInt { .. } => "CvtFToSInt",
            Op::CpuId { .. } => "CPUID",
            Op::XGetBv { .. } => "XGETBV",
            Op::Syscall { .. } => "Syscall",
            Op::InlineSyscall { .. } => "InlineSyscall",
            Op::Thunk { .. } => "Thunk",
            Op::ValidateCode { .. } => "ValidateCode",
            Op::RemoveCodeEntry { .. } => "RemoveCodeEntry",
            Op::Break { .. } => "Break",
            Op::Jump { .. } => "Jump",
            Op::CondJump { .. } => "CondJump",
            Op::ExitFunction { .. } => "ExitFunction",
            Op::SpillRegister { .. } => "SpillRegister",
            Op::FillRegister { .. } => "FillRegister",
        }
    }

    /// Invoke `visit` for every value argument, in slot order.
    pub fn visit_args(&self, mut visit: impl FnMut(NodeId)) {
        let mut copy = *self;
        copy.visit_args_mut(|arg| visit(*arg));
    }

    /// Invoke `visit` with a mutable reference to every value argument.
    pub fn visit_args_mut(&mut self, mut visit: impl FnMut(&mut NodeId)) {
        match self {
            Op::Invalid
            | Op::Constant { .. }
            | Op::InlineConstant { .. }
            | Op::LoadContext { .. }
            | Op::LoadRegister { .. }
            | Op::LoadFlag { .. }
            | Op::ValidateCode { .. }
            | Op::RemoveCodeEntry { .. }
            | Op::Break { .. } => {}

            // Block references are structural, not value uses.
            Op::CodeBlock { .. } | Op::BeginBlock { .. } | Op::EndBlock { .. } => {}
            Op::Jump { .. } => {}

            Op::StoreContext { value, .. }
            | Op::StoreRegister { value, .. }
            | Op::StoreFlag { value, .. } => visit(value),

            Op::Add { src1, src2 }
            | Op::Sub { src1, src2 }
            | Op::Mul { src1, src2 }
            | Op::UMul { src1, src2 }
            | Op::MulH { src1, src2 }
            | Op::UMulH { src1, src2 }
            | Op::Div { src1, src2 }
            | Op::UDiv { src1, src2 }
            | Op::Rem { src1, src2 }
            | Op::URem { src1, src2 }
            | Op::And { src1, src2 }
            | Op::Or { src1, src2 }
            | Op::Xor { src1, src2 }
            | Op::Lshl { src1, src2 }
            | Op::Lshr { src1, src2 }
            | Op::Ashr { src1, src2 }
            | Op::Ror { src1, src2 }
            | Op::VAdd { src1, src2 }
            | Op::VSub { src1, src2 }
            | Op::VAnd { src1, src2 }
            | Op::VOr { src1, src2 }
            | Op::VXor { src1, src2 }
            | Op::FAdd { src1, src2 }
            | Op::FSub { src1, src2 }
            | Op::FMul { src1, src2 }
            | Op::FDiv { src1, src2 }
            | Op::FCmp { src1, src2 } => {
                visit(src1);
                visit(src2);
            }

            Op::Not { src }
            | Op::Neg { src }
            | Op::Popcount { src }
            | Op::Clz { src }
            | Op::Ctz { src }
            | Op::Rev { src }
            | Op::Copy { src }
            | Op::VCastFromGpr { src }
            | Op::CvtFToF { src }
            | Op::CvtSIntToF { src }
            | Op::CvtFToSInt { src }
            | Op::Bfe { src, .. }
            | Op::Sbfe { src, .. } => visit(src),

            Op::Bfi { dest, src, .. } => {
                visit(dest);
                visit(src);
            }

            Op::Select { cmp1, cmp2, true_val, false_val, .. } => {
                visit(cmp1);
                visit(cmp2);
                visit(true_val);
                visit(false_val);
            }

            Op::LoadMem { addr, offset, .. } | Op::LoadMemTso { addr, offset, .. } => {
                visit(addr);
                visit(offset);
            }
            Op::StoreMem { addr, value, offset, .. }
            | Op::StoreMemTso { addr, value, offset, .. } => {
                visit(addr);
                visit(value);
                visit(offset);
            }

            Op::Cas { expected, desired, addr } | Op::CasPair { expected, desired, addr } => {
                visit(expected);
                visit(desired);
                visit(addr);
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
                visit(addr);
                visit(value);
            }
            Op::AtomicNeg { addr } => visit(addr),

            Op::CreateElementPair { lo, hi } => {
                visit(lo);
                visit(hi);
            }
            Op::ExtractElementPair { pair, .. } => visit(pair),
            Op::VExtractToGpr { vector, .. } => visit(vector),
            Op::VInsertGpr { vector, src, .. } => {
                visit(vector);
                visit(src);
            }

            Op::CpuId { function, leaf } => {
                visit(function);
                visit(leaf);
            }
            Op::XGetBv { function } => visit(function),
            Op::Syscall { args } | Op::InlineSyscall { args } => {
                for arg in args.iter_mut() {
                    visit(arg);
                }
            }
            Op::Thunk { arg_ptr, .. } => visit(arg_ptr),

            Op::CondJump { cmp1, cmp2, .. } => {
                visit(cmp1);
                visit(cmp2);
            }
            Op::ExitFunction { new_rip } => visit(new_rip),

            Op::SpillRegister { value, .. } => visit(value),
            Op::FillRegister { orig, .. } => visit(orig),
        }
    }

    /// Replace argument slot `index` (in `visit_args` order). Returns false
    /// when the op has fewer slots.
    pub fn set_arg(&mut self, index: usize, new: NodeId) -> bool {
        let mut current = 0usize;
        let mut replaced = false;
        self.visit_args_mut(|arg| {
            if current == index {
                *arg = new;
                replaced = true;
            }
            current += 1;
        });
        replaced
    }

    pub fn arg_count(&self) -> usize {
        let mut count = 0usize;
        self.visit_args(|_| count += 1);
        count
    }

    /// Does this op produce a value?
    pub fn has_result(&self) -> bool {
        !matches!(
            self,
            Op::Invalid
                | Op::CodeBlock { .. }
                | Op::BeginBlock { .. }
                | Op::EndBlock { .. }
                | Op::StoreContext { .. }
                | Op::StoreRegister { .. }
                | Op::StoreFlag { .. }
                | Op::StoreMem { .. }
                | Op::StoreMemTso { .. }
                | Op::AtomicAdd { .. }
                | Op::AtomicSub { .. }
                | Op::AtomicAnd { .. }
                | Op::AtomicOr { .. }
                | Op::AtomicXor { .. }
                | Op::AtomicNeg { .. }
                | Op::RemoveCodeEntry { .. }
                | Op::Break { .. }
                | Op::Jump { .. }
                | Op::CondJump { .. }
                | Op::ExitFunction { .. }
                | Op::SpillRegister { .. }
        )
    }

    /// Register class of the result, when there is one.
    pub fn result_class(&self) -> RegClass {
        match self {
            Op::Constant { .. } => RegClass::Gpr,
            // Inline constants are folded into their user's immediate field
            // and never occupy a register.
            Op::InlineConstant { .. } => RegClass::Complex,
            Op::LoadContext { class, .. }
            | Op::LoadRegister { class, .. }
            | Op::LoadMem { class, .. }
            | Op::LoadMemTso { class, .. } => *class,
            Op::LoadFlag { .. } => RegClass::Gpr,
            Op::CasPair { .. } | Op::CreateElementPair { .. } | Op::CpuId { .. } => {
                RegClass::GprPair
            }
            Op::VAdd { .. }
            | Op::VSub { .. }
            | Op::VAnd { .. }
            | Op::VOr { .. }
            | Op::VXor { .. }
            | Op::VCastFromGpr { .. }
            | Op::VInsertGpr { .. }
            | Op::FAdd { .. }
            | Op::FSub { .. }
            | Op::FMul { .. }
            | Op::FDiv { .. }
            | Op::CvtFToF { .. }
            | Op::CvtSIntToF { .. } => RegClass::Fpr,
            Op::FillRegister { .. } => RegClass::Invalid, // refined from the spilled value
            op if op.has_result() => RegClass::Gpr,
            _ => RegClass::Invalid,
        }
    }

    /// Ops that must never be removed even when their result is unused.
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self,
            Op::CodeBlock { .. }
                | Op::BeginBlock { .. }
                | Op::EndBlock { .. }
                | Op::StoreContext { .. }
                | Op::StoreRegister { .. }
                | Op::StoreFlag { .. }
                | Op::StoreMem { .. }
                | Op::StoreMemTso { .. }
                | Op::Cas { .. }
                | Op::CasPair { .. }
                | Op::AtomicAdd { .. }
                | Op::AtomicSub { .. }
                | Op::AtomicAnd { .. }
                | Op::AtomicOr { .. }
                | Op::AtomicXor { .. }
                | Op::AtomicNeg { .. }
                | Op::AtomicSwap { .. }
                | Op::AtomicFetchAdd { .. }
                | Op::AtomicFetchSub { .. }
                | Op::AtomicFetchAnd { .. }
                | Op::AtomicFetchOr { .. }
                | Op::AtomicFetchXor { .. }
                | Op::CpuId { .. }
                | Op::XGetBv { .. }
                | Op::Syscall { .. }
                | Op::InlineSyscall { .. }
                | Op::Thunk { .. }
                | Op::ValidateCode { .. }
                | Op::RemoveCodeEntry { .. }
                | Op::Break { .. }
                | Op::Jump { .. }
                | Op::CondJump { .. }
                | Op::ExitFunction { .. }
                | Op::SpillRegister { .. }
                | Op::FillRegister { .. }
        )
    }

    /// Ops that terminate a block.
    pub fn is_block_exit(&self) -> bool {
        matches!(
            self,
            Op::Jump { .. } | Op::CondJump { .. } | Op::ExitFunction { .. } | Op::Break { .. }
        )
    }
}

/// An op plus its header: result byte width and vector element width.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OpPayload {
    pub op: Op,
    pub size: OpSize,
    pub elem_size: OpSize,
}

impl OpPayload {
    pub fn scalar(op: Op, size: OpSize) -> OpPayload {
        OpPayload { op, size, elem_size: size }
    }

    pub fn element_count(&self) -> u32 {
        self.size.bytes() / self.elem_size.bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arg_visits_match_counts() {
        let op = Op::Select {
            cond: CondCode::Eq,
            compare_size: OpSize::I32,
            cmp1: NodeId::from_u32(1),
            cmp2: NodeId::from_u32(2),
            true_val: NodeId::from_u32(3),
            false_val: NodeId::from_u32(4),
        };
        assert_eq!(op.arg_count(), 4);

        let mut seen = Vec::new();
        op.visit_args(|arg| seen.push(arg.as_u32()));
        assert_eq!(seen, vec![1, 2, 3, 4]);
    }

    #[test]
    fn set_arg_replaces_by_slot() {
        let mut op = Op::Add { src1: NodeId::from_u32(1), src2: NodeId::from_u32(2) };
        assert!(op.set_arg(1, NodeId::from_u32(9)));
        assert_eq!(op, Op::Add { src1: NodeId::from_u32(1), src2: NodeId::from_u32(9) });
        assert!(!op.set_arg(2, NodeId::from_u32(9)));
    }

    #[test]
    fn stores_have_no_result() {
        let store = Op::StoreMem {
            class: RegClass::Gpr,
            addr: NodeId::from_u32(1),
            value: NodeId::from_u32(2),
            offset: NodeId::INVALID,
            align: 1,
        };
        assert!(!store.has_result());
        assert!(store.has_side_effects());
        assert!(Op::Add { src1: NodeId::INVALID, src2: NodeId::INVALID }.has_result());
    }

    #[test]
    fn cond_code_inversion_is_involutive() {
        for cond in [
            CondCode::Eq,
            CondCode::Neq,
            CondCode::Uge,
            CondCode::Ult,
            CondCode::Ugt,
            CondCode::Ule,
            CondCode::Sge,
            CondCode::Slt,
            CondCode::Sgt,
            CondCode::Sle,
            CondCode::TstZ,
            CondCode::TstNz,
        ] {
            assert_eq!(cond.invert().invert(), cond);
            // The inverse evaluates to the opposite on a sample.
            let lhs = 0x80u64;
            let rhs = 0x7fu64;
            assert_ne!(
                cond.evaluate(OpSize::I8, lhs, rhs),
                cond.invert().evaluate(OpSize::I8, lhs, rhs)
            );
        }
    }

    #[test]
    fn signed_compare_honors_operand_size() {
        // 0x80 is -128 at byte width but +128 at dword width.
        assert!(CondCode::Slt.evaluate(OpSize::I8, 0x80, 0));
        assert!(!CondCode::Slt.evaluate(OpSize::I32, 0x80, 0));
    }
}
