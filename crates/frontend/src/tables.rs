//! Data-driven x86 instruction tables.
//!
//! Every decodable opcode is one row: mnemonic, type, decode flags,
//! immediate shape, and the dispatcher that lowers it. The primary and
//! secondary (0F) maps are flat 256-entry tables; ModRM-reg-disambiguated
//! opcodes live in group tables flattened as
//! `(group << 6) | (variant << 3) | reg`.
//!
//! The tables are finalized once per process on first use. Rows cover the
//! implemented subset; everything else decodes as `Invalid` and surfaces as
//! a guest `SIGILL`, which is also how unimplemented-but-valid encodings are
//! reported.

use std::sync::OnceLock;

use crate::decoder::DecodedInst;
use crate::dispatcher::{DispatchError, OpDispatchBuilder};

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct InstFlags: u32 {
        /// Instruction carries a ModRM byte.
        const MODRM = 1 << 0;
        /// Decoding stops here; the instruction ends its basic block.
        const BLOCK_END = 1 << 1;
        /// Writes RIP (branches, calls, returns).
        const SETS_RIP = 1 << 2;
        /// Operand size is 8-bit regardless of prefixes.
        const SIZE_8BIT = 1 << 3;
        /// Operand size defaults to 64-bit in long mode (pushes, branches).
        const SIZE_64BIT = 1 << 4;
        /// ModRM r/m field is the destination.
        const MODRM_DST = 1 << 5;
        /// Implicit AL/AX/EAX/RAX operand.
        const IMPLICIT_ACC = 1 << 6;
        /// `lock` prefix is architecturally valid here.
        const LOCKABLE = 1 << 7;
        /// `rep`/`repne` prefixes are meaningful here.
        const REPEATABLE = 1 << 8;
        /// ModRM reg field selects a vector register.
        const REG_IS_XMM = 1 << 9;
        /// ModRM r/m field selects a vector register when mod == 11.
        const RM_IS_XMM = 1 << 10;
    }
}

/// Immediate operand shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImmKind {
    None,
    /// One byte, zero-extended.
    Imm8,
    /// One byte, sign-extended to 64 bits.
    Imm8Sext,
    /// Two bytes, zero-extended.
    Imm16,
    /// Four bytes, sign-extended (branch displacements).
    Imm32Sext,
    /// Operand-size immediate capped at four bytes, zero-extended.
    ImmOp,
    /// Operand-size immediate capped at four bytes, sign-extended to the
    /// operand size.
    ImmOpSext,
    /// Full operand-size immediate, including eight bytes (`mov r64, imm64`).
    ImmOpFull,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstType {
    Invalid,
    Inst,
    /// Legacy prefix byte, consumed before table dispatch.
    Prefix,
    /// REX prefix (64-bit mode only).
    Rex,
    /// 0F escape into the secondary table.
    SecondaryEscape,
    /// Row is resolved through a group table using ModRM.reg.
    Group(Group, u8),
    /// x87 escape; resolved through the x87 table using ModRM.
    X87,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Group {
    Group1 = 0,
    Group2,
    Group3,
    Group4,
    Group5,
    Group9,
    Group11,
}

const GROUP_COUNT: usize = 7;

pub type OpDispatchFn = fn(&mut OpDispatchBuilder, &DecodedInst) -> Result<(), DispatchError>;

#[derive(Clone, Copy)]
pub struct X86InstInfo {
    pub name: &'static str,
    pub kind: InstType,
    pub flags: InstFlags,
    pub imm: ImmKind,
    pub handler: Option<OpDispatchFn>,
}

impl X86InstInfo {
    pub fn is_valid(&self) -> bool {
        !matches!(self.kind, InstType::Invalid)
    }
}

const INVALID: X86InstInfo = X86InstInfo {
    name: "",
    kind: InstType::Invalid,
    flags: InstFlags::empty(),
    imm: ImmKind::None,
    handler: None,
};

fn inst(
    name: &'static str,
    flags: InstFlags,
    imm: ImmKind,
    handler: OpDispatchFn,
) -> X86InstInfo {
    X86InstInfo { name, kind: InstType::Inst, flags, imm, handler: Some(handler) }
}

fn prefix(name: &'static str) -> X86InstInfo {
    X86InstInfo {
        name,
        kind: InstType::Prefix,
        flags: InstFlags::empty(),
        imm: ImmKind::None,
        handler: None,
    }
}

pub struct X86Tables {
    pub primary: [X86InstInfo; 256],
    pub secondary: [X86InstInfo; 256],
    pub groups: [X86InstInfo; GROUP_COUNT << 6],
}

impl X86Tables {
    pub fn group_entry(&self, group: Group, variant: u8, reg: u8) -> &X86InstInfo {
        let index = ((group as usize) << 6) | ((variant as usize) << 3) | reg as usize;
        &self.groups[index]
    }
}

/// Process-wide finalized tables.
pub fn tables() -> &'static X86Tables {
    static TABLES: OnceLock<X86Tables> = OnceLock::new();
    TABLES.get_or_init(build_tables)
}

fn build_tables() -> X86Tables {
    use crate::dispatcher::handlers as h;
    use ImmKind::{Imm16, Imm32Sext, Imm8, Imm8Sext, ImmOpFull, ImmOpSext};
    use InstFlags as F;

    let mut primary = [INVALID; 256];
    let mut secondary = [INVALID; 256];
    let mut groups = [INVALID; GROUP_COUNT << 6];

    // Legacy prefixes.
    for byte in [0x26u8, 0x2e, 0x36, 0x3e, 0x64, 0x65, 0x66, 0x67, 0xf0, 0xf2, 0xf3] {
        primary[byte as usize] = prefix("prefix");
    }
    // REX.
    for byte in 0x40u8..=0x4f {
        primary[byte as usize] = X86InstInfo {
            name: "REX",
            kind: InstType::Rex,
            flags: InstFlags::empty(),
            imm: ImmKind::None,
            handler: None,
        };
    }
    primary[0x0f] = X86InstInfo {
        name: "ESCAPE",
        kind: InstType::SecondaryEscape,
        flags: InstFlags::empty(),
        imm: ImmKind::None,
        handler: None,
    };

    // 0x00..0x3f: the classic ALU block. Each operation gets four encodings:
    // r/m8,r8 / r/m,r / r8,r/m8 / r,r/m plus the accumulator-immediate pair.
    let alu_block: [(u8, &'static str); 8] = [
        (0x00, "ADD"),
        (0x08, "OR"),
        (0x10, "ADC"),
        (0x18, "SBB"),
        (0x20, "AND"),
        (0x28, "SUB"),
        (0x30, "XOR"),
        (0x38, "CMP"),
    ];
    for (base, name) in alu_block {
        let lockable = if name == "CMP" { InstFlags::empty() } else { F::LOCKABLE };
        primary[base as usize] = inst(
            name,
            F::MODRM | F::MODRM_DST | F::SIZE_8BIT | lockable,
            ImmKind::None,
            h::op_alu,
        );
        primary[base as usize + 1] =
            inst(name, F::MODRM | F::MODRM_DST | lockable, ImmKind::None, h::op_alu);
        primary[base as usize + 2] = inst(name, F::MODRM | F::SIZE_8BIT, ImmKind::None, h::op_alu);
        primary[base as usize + 3] = inst(name, F::MODRM, ImmKind::None, h::op_alu);
        primary[base as usize + 4] =
            inst(name, F::IMPLICIT_ACC | F::SIZE_8BIT, Imm8, h::op_alu_acc_imm);
        primary[base as usize + 5] = inst(name, F::IMPLICIT_ACC, ImmOpSext, h::op_alu_acc_imm);
    }

    // Pushes/pops of the embedded register.
    for reg in 0u8..8 {
        primary[0x50 + reg as usize] =
            inst("PUSH", F::SIZE_64BIT, ImmKind::None, h::op_push_reg);
        primary[0x58 + reg as usize] = inst("POP", F::SIZE_64BIT, ImmKind::None, h::op_pop_reg);
    }

    primary[0x63] = inst("MOVSXD", F::MODRM, ImmKind::None, h::op_movsxd);
    primary[0x68] = inst("PUSH", F::SIZE_64BIT, Imm32Sext, h::op_push_imm);
    primary[0x69] = inst("IMUL", F::MODRM, ImmOpSext, h::op_imul_rmi);
    primary[0x6a] = inst("PUSH", F::SIZE_64BIT, Imm8Sext, h::op_push_imm);
    primary[0x6b] = inst("IMUL", F::MODRM, Imm8Sext, h::op_imul_rmi);

    // Jcc rel8.
    for cc in 0u8..16 {
        primary[0x70 + cc as usize] = inst(
            "Jcc",
            F::BLOCK_END | F::SETS_RIP | F::SIZE_64BIT,
            Imm8Sext,
            h::op_jcc,
        );
    }

    primary[0x80] = X86InstInfo {
        name: "GRP1",
        kind: InstType::Group(Group::Group1, 0),
        flags: F::MODRM | F::MODRM_DST | F::SIZE_8BIT,
        imm: Imm8,
        handler: None,
    };
    primary[0x81] = X86InstInfo {
        name: "GRP1",
        kind: InstType::Group(Group::Group1, 1),
        flags: F::MODRM | F::MODRM_DST,
        imm: ImmOpSext,
        handler: None,
    };
    primary[0x83] = X86InstInfo {
        name: "GRP1",
        kind: InstType::Group(Group::Group1, 3),
        flags: F::MODRM | F::MODRM_DST,
        imm: Imm8Sext,
        handler: None,
    };

    primary[0x84] = inst("TEST", F::MODRM | F::MODRM_DST | F::SIZE_8BIT, ImmKind::None, h::op_test);
    primary[0x85] = inst("TEST", F::MODRM | F::MODRM_DST, ImmKind::None, h::op_test);
    primary[0x86] =
        inst("XCHG", F::MODRM | F::MODRM_DST | F::SIZE_8BIT | F::LOCKABLE, ImmKind::None, h::op_xchg);
    primary[0x87] = inst("XCHG", F::MODRM | F::MODRM_DST | F::LOCKABLE, ImmKind::None, h::op_xchg);
    primary[0x88] = inst("MOV", F::MODRM | F::MODRM_DST | F::SIZE_8BIT, ImmKind::None, h::op_mov);
    primary[0x89] = inst("MOV", F::MODRM | F::MODRM_DST, ImmKind::None, h::op_mov);
    primary[0x8a] = inst("MOV", F::MODRM | F::SIZE_8BIT, ImmKind::None, h::op_mov);
    primary[0x8b] = inst("MOV", F::MODRM, ImmKind::None, h::op_mov);
    primary[0x8d] = inst("LEA", F::MODRM, ImmKind::None, h::op_lea);
    primary[0x8f] = inst("POP", F::MODRM | F::MODRM_DST | F::SIZE_64BIT, ImmKind::None, h::op_pop_rm);

    primary[0x90] = inst("NOP", InstFlags::empty(), ImmKind::None, h::op_nop);
    for reg in 1u8..8 {
        primary[0x90 + reg as usize] = inst("XCHG", F::IMPLICIT_ACC, ImmKind::None, h::op_xchg_acc);
    }
    primary[0x98] = inst("CDQE", InstFlags::empty(), ImmKind::None, h::op_cdqe);
    primary[0x99] = inst("CQO", InstFlags::empty(), ImmKind::None, h::op_cqo);

    primary[0xa4] = inst("MOVS", F::SIZE_8BIT | F::REPEATABLE, ImmKind::None, h::op_movs);
    primary[0xa5] = inst("MOVS", F::REPEATABLE, ImmKind::None, h::op_movs);
    primary[0xa8] = inst("TEST", F::IMPLICIT_ACC | F::SIZE_8BIT, Imm8, h::op_test_acc_imm);
    primary[0xa9] = inst("TEST", F::IMPLICIT_ACC, ImmOpSext, h::op_test_acc_imm);
    primary[0xaa] = inst("STOS", F::SIZE_8BIT | F::REPEATABLE, ImmKind::None, h::op_stos);
    primary[0xab] = inst("STOS", F::REPEATABLE, ImmKind::None, h::op_stos);

    for reg in 0u8..8 {
        primary[0xb0 + reg as usize] = inst("MOV", F::SIZE_8BIT, Imm8, h::op_mov_reg_imm);
        primary[0xb8 + reg as usize] = inst("MOV", InstFlags::empty(), ImmOpFull, h::op_mov_reg_imm);
    }

    primary[0xc0] = X86InstInfo {
        name: "GRP2",
        kind: InstType::Group(Group::Group2, 0),
        flags: F::MODRM | F::MODRM_DST | F::SIZE_8BIT,
        imm: Imm8,
        handler: None,
    };
    primary[0xc1] = X86InstInfo {
        name: "GRP2",
        kind: InstType::Group(Group::Group2, 1),
        flags: F::MODRM | F::MODRM_DST,
        imm: Imm8,
        handler: None,
    };
    primary[0xc2] = inst(
        "RET",
        F::BLOCK_END | F::SETS_RIP | F::SIZE_64BIT,
        Imm16,
        h::op_ret,
    );
    primary[0xc3] = inst("RET", F::BLOCK_END | F::SETS_RIP | F::SIZE_64BIT, ImmKind::None, h::op_ret);
    primary[0xc6] = X86InstInfo {
        name: "GRP11",
        kind: InstType::Group(Group::Group11, 0),
        flags: F::MODRM | F::MODRM_DST | F::SIZE_8BIT,
        imm: Imm8,
        handler: None,
    };
    primary[0xc7] = X86InstInfo {
        name: "GRP11",
        kind: InstType::Group(Group::Group11, 1),
        flags: F::MODRM | F::MODRM_DST,
        imm: ImmOpSext,
        handler: None,
    };
    primary[0xc9] = inst("LEAVE", F::SIZE_64BIT, ImmKind::None, h::op_leave);
    primary[0xcc] = inst("INT3", F::BLOCK_END | F::SETS_RIP, ImmKind::None, h::op_int3);
    primary[0xcd] = inst("INT", F::BLOCK_END | F::SETS_RIP, Imm8, h::op_int_imm);

    for variant in 0u8..4 {
        // D0/D1 shift by one, D2/D3 shift by CL.
        let eight_bit = variant & 1 == 0;
        let flags = if eight_bit { F::MODRM | F::MODRM_DST | F::SIZE_8BIT } else { F::MODRM | F::MODRM_DST };
        primary[0xd0 + variant as usize] = X86InstInfo {
            name: "GRP2",
            kind: InstType::Group(Group::Group2, 2 + variant),
            flags,
            imm: ImmKind::None,
            handler: None,
        };
    }

    // x87 escape range: decoded, routed to the stub handler.
    for byte in 0xd8u8..=0xdf {
        primary[byte as usize] = X86InstInfo {
            name: "X87",
            kind: InstType::X87,
            flags: F::MODRM,
            imm: ImmKind::None,
            handler: Some(h::op_x87),
        };
    }

    primary[0xe8] = inst(
        "CALL",
        F::BLOCK_END | F::SETS_RIP | F::SIZE_64BIT,
        Imm32Sext,
        h::op_call_rel,
    );
    primary[0xe9] = inst(
        "JMP",
        F::BLOCK_END | F::SETS_RIP | F::SIZE_64BIT,
        Imm32Sext,
        h::op_jmp_rel,
    );
    primary[0xeb] = inst(
        "JMP",
        F::BLOCK_END | F::SETS_RIP | F::SIZE_64BIT,
        Imm8Sext,
        h::op_jmp_rel,
    );
    primary[0xf4] = inst("HLT", F::BLOCK_END | F::SETS_RIP, ImmKind::None, h::op_hlt);

    primary[0xf6] = X86InstInfo {
        name: "GRP3",
        kind: InstType::Group(Group::Group3, 0),
        flags: F::MODRM | F::MODRM_DST | F::SIZE_8BIT,
        imm: ImmKind::None,
        handler: None,
    };
    primary[0xf7] = X86InstInfo {
        name: "GRP3",
        kind: InstType::Group(Group::Group3, 1),
        flags: F::MODRM | F::MODRM_DST,
        imm: ImmKind::None,
        handler: None,
    };
    primary[0xfe] = X86InstInfo {
        name: "GRP4",
        kind: InstType::Group(Group::Group4, 0),
        flags: F::MODRM | F::MODRM_DST | F::SIZE_8BIT,
        imm: ImmKind::None,
        handler: None,
    };
    primary[0xff] = X86InstInfo {
        name: "GRP5",
        kind: InstType::Group(Group::Group5, 0),
        flags: F::MODRM | F::MODRM_DST,
        imm: ImmKind::None,
        handler: None,
    };

    // Secondary (0F) map.
    secondary[0x05] = inst("SYSCALL", F::BLOCK_END | F::SETS_RIP, ImmKind::None, h::op_syscall);
    secondary[0x0b] = inst("UD2", F::BLOCK_END | F::SETS_RIP, ImmKind::None, h::op_ud2);
    secondary[0x01] = inst("GRP7", F::MODRM, ImmKind::None, h::op_group7);
    secondary[0x10] = inst("MOVUPS", F::MODRM | F::REG_IS_XMM | F::RM_IS_XMM, ImmKind::None, h::op_movups);
    secondary[0x11] = inst(
        "MOVUPS",
        F::MODRM | F::MODRM_DST | F::REG_IS_XMM | F::RM_IS_XMM,
        ImmKind::None,
        h::op_movups,
    );
    secondary[0x1f] = inst("NOP", F::MODRM | F::MODRM_DST, ImmKind::None, h::op_nop);
    secondary[0x28] = inst("MOVAPS", F::MODRM | F::REG_IS_XMM | F::RM_IS_XMM, ImmKind::None, h::op_movups);
    secondary[0x29] = inst(
        "MOVAPS",
        F::MODRM | F::MODRM_DST | F::REG_IS_XMM | F::RM_IS_XMM,
        ImmKind::None,
        h::op_movups,
    );
    secondary[0x2a] = inst("CVTSI2SD", F::MODRM | F::REG_IS_XMM, ImmKind::None, h::op_cvtsi2sd);
    secondary[0x2c] = inst("CVTTSD2SI", F::MODRM | F::RM_IS_XMM, ImmKind::None, h::op_cvttsd2si);
    secondary[0x2e] = inst("UCOMISD", F::MODRM | F::REG_IS_XMM | F::RM_IS_XMM, ImmKind::None, h::op_ucomis);

    for cc in 0u8..16 {
        secondary[0x40 + cc as usize] = inst("CMOVcc", F::MODRM, ImmKind::None, h::op_cmov);
        secondary[0x80 + cc as usize] = inst(
            "Jcc",
            F::BLOCK_END | F::SETS_RIP | F::SIZE_64BIT,
            Imm32Sext,
            h::op_jcc,
        );
        secondary[0x90 + cc as usize] = inst(
            "SETcc",
            F::MODRM | F::MODRM_DST | F::SIZE_8BIT,
            ImmKind::None,
            h::op_setcc,
        );
    }

    secondary[0x57] = inst("XORPS", F::MODRM | F::REG_IS_XMM | F::RM_IS_XMM, ImmKind::None, h::op_xorps);
    secondary[0x58] = inst("ADDSD", F::MODRM | F::REG_IS_XMM | F::RM_IS_XMM, ImmKind::None, h::op_sse_scalar);
    secondary[0x59] = inst("MULSD", F::MODRM | F::REG_IS_XMM | F::RM_IS_XMM, ImmKind::None, h::op_sse_scalar);
    secondary[0x5c] = inst("SUBSD", F::MODRM | F::REG_IS_XMM | F::RM_IS_XMM, ImmKind::None, h::op_sse_scalar);
    secondary[0x5e] = inst("DIVSD", F::MODRM | F::REG_IS_XMM | F::RM_IS_XMM, ImmKind::None, h::op_sse_scalar);
    secondary[0x6e] = inst("MOVD", F::MODRM | F::REG_IS_XMM, ImmKind::None, h::op_movd_to_xmm);
    secondary[0x7e] = inst(
        "MOVD",
        F::MODRM | F::MODRM_DST | F::REG_IS_XMM,
        ImmKind::None,
        h::op_movd_from_xmm,
    );
    secondary[0xa2] = inst("CPUID", InstFlags::empty(), ImmKind::None, h::op_cpuid);
    secondary[0xaf] = inst("IMUL", F::MODRM, ImmKind::None, h::op_imul_rm);
    secondary[0xb0] = inst(
        "CMPXCHG",
        F::MODRM | F::MODRM_DST | F::SIZE_8BIT | F::LOCKABLE,
        ImmKind::None,
        h::op_cmpxchg,
    );
    secondary[0xb1] =
        inst("CMPXCHG", F::MODRM | F::MODRM_DST | F::LOCKABLE, ImmKind::None, h::op_cmpxchg);
    secondary[0xb6] = inst("MOVZX", F::MODRM, ImmKind::None, h::op_movzx);
    secondary[0xb7] = inst("MOVZX", F::MODRM, ImmKind::None, h::op_movzx);
    secondary[0xb8] = inst("POPCNT", F::MODRM, ImmKind::None, h::op_popcnt);
    secondary[0xbc] = inst("BSF", F::MODRM, ImmKind::None, h::op_bsf);
    secondary[0xbd] = inst("BSR", F::MODRM, ImmKind::None, h::op_bsr);
    secondary[0xbe] = inst("MOVSX", F::MODRM, ImmKind::None, h::op_movsx);
    secondary[0xbf] = inst("MOVSX", F::MODRM, ImmKind::None, h::op_movsx);
    secondary[0xc0] = inst(
        "XADD",
        F::MODRM | F::MODRM_DST | F::SIZE_8BIT | F::LOCKABLE,
        ImmKind::None,
        h::op_xadd,
    );
    secondary[0xc1] = inst("XADD", F::MODRM | F::MODRM_DST | F::LOCKABLE, ImmKind::None, h::op_xadd);
    secondary[0xc7] = X86InstInfo {
        name: "GRP9",
        kind: InstType::Group(Group::Group9, 0),
        flags: F::MODRM | F::MODRM_DST | F::LOCKABLE,
        imm: ImmKind::None,
        handler: None,
    };
    for reg in 0u8..8 {
        secondary[0xc8 + reg as usize] = inst("BSWAP", InstFlags::empty(), ImmKind::None, h::op_bswap);
    }
    secondary[0xef] = inst("PXOR", F::MODRM | F::REG_IS_XMM | F::RM_IS_XMM, ImmKind::None, h::op_pxor);
    secondary[0xfe] = inst("PADDD", F::MODRM | F::REG_IS_XMM | F::RM_IS_XMM, ImmKind::None, h::op_paddd);

    // Group tables. Variant indexes mirror the primary rows that reference
    // them.
    {
        let alu_names = ["ADD", "OR", "ADC", "SBB", "AND", "SUB", "XOR", "CMP"];
        for variant in [0u8, 1, 3] {
            for (reg, name) in alu_names.iter().enumerate() {
                let index = ((Group::Group1 as usize) << 6) | ((variant as usize) << 3) | reg;
                groups[index] = inst(name, InstFlags::empty(), ImmKind::None, h::op_alu_imm);
            }
        }

        let shift_names = ["ROL", "ROR", "RCL", "RCR", "SHL", "SHR", "SHL", "SAR"];
        for variant in 0u8..6 {
            for (reg, name) in shift_names.iter().enumerate() {
                let index = ((Group::Group2 as usize) << 6) | ((variant as usize) << 3) | reg;
                // RCL/RCR are not implemented; leave the rows invalid so
                // they trap precisely.
                if reg == 2 || reg == 3 {
                    continue;
                }
                groups[index] = inst(name, InstFlags::empty(), ImmKind::None, h::op_shift);
            }
        }

        let group3_names =
            ["TEST", "TEST", "NOT", "NEG", "MUL", "IMUL", "DIV", "IDIV"];
        for variant in 0u8..2 {
            for (reg, name) in group3_names.iter().enumerate() {
                let index = ((Group::Group3 as usize) << 6) | ((variant as usize) << 3) | reg;
                // Only the TEST rows carry an immediate.
                let imm = match (reg, variant) {
                    (0 | 1, 0) => Imm8,
                    (0 | 1, _) => ImmOpSext,
                    _ => ImmKind::None,
                };
                groups[index] = inst(name, InstFlags::empty(), imm, h::op_group3);
            }
        }

        for (reg, name) in ["INC", "DEC"].iter().enumerate() {
            let index = (Group::Group4 as usize) << 6 | reg;
            groups[index] = inst(name, InstFlags::empty(), ImmKind::None, h::op_incdec);
        }

        let group5: [(usize, &'static str, OpDispatchFn); 5] = [
            (0, "INC", h::op_incdec),
            (1, "DEC", h::op_incdec),
            (2, "CALL", h::op_call_rm),
            (4, "JMP", h::op_jmp_rm),
            (6, "PUSH", h::op_push_rm),
        ];
        for (reg, name, handler) in group5 {
            let index = (Group::Group5 as usize) << 6 | reg;
            let flags = match reg {
                2 | 4 => InstFlags::BLOCK_END | InstFlags::SETS_RIP | InstFlags::SIZE_64BIT,
                6 => InstFlags::SIZE_64BIT,
                _ => InstFlags::empty(),
            };
            groups[index] = inst(name, flags, ImmKind::None, handler);
        }

        // Group 9: CMPXCHG8B/16B at reg 1.
        let index = (Group::Group9 as usize) << 6 | 1;
        groups[index] = inst("CMPXCHG16B", InstFlags::LOCKABLE, ImmKind::None, h::op_cmpxchg_pair);

        // Group 11: MOV r/m, imm.
        for variant in 0u8..2 {
            let index = ((Group::Group11 as usize) << 6) | ((variant as usize) << 3);
            groups[index] = inst("MOV", InstFlags::empty(), ImmKind::None, h::op_mov_rm_imm);
        }
    }

    X86Tables { primary, secondary, groups }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_finalize_once() {
        let first = tables() as *const X86Tables;
        let second = tables() as *const X86Tables;
        assert_eq!(first, second);
    }

    #[test]
    fn alu_block_rows_are_populated() {
        let t = tables();
        assert_eq!(t.primary[0x01].name, "ADD");
        assert!(t.primary[0x01].flags.contains(InstFlags::MODRM));
        assert!(t.primary[0x01].flags.contains(InstFlags::MODRM_DST));
        assert_eq!(t.primary[0x3d].name, "CMP");
        assert!(!t.primary[0x02].flags.contains(InstFlags::MODRM_DST));
    }

    #[test]
    fn block_enders_are_flagged() {
        let t = tables();
        for opcode in [0x70usize, 0x7f, 0xc3, 0xe8, 0xe9, 0xeb, 0xf4, 0xcc] {
            assert!(
                t.primary[opcode].flags.contains(InstFlags::BLOCK_END),
                "opcode {opcode:#x} must end its block"
            );
        }
        assert!(t.secondary[0x85].flags.contains(InstFlags::BLOCK_END));
        assert!(t.secondary[0x05].flags.contains(InstFlags::BLOCK_END));
    }

    #[test]
    fn group_flattening_reaches_rows() {
        let t = tables();
        assert_eq!(t.group_entry(Group::Group1, 0, 7).name, "CMP");
        assert_eq!(t.group_entry(Group::Group3, 1, 3).name, "NEG");
        assert_eq!(t.group_entry(Group::Group5, 0, 4).name, "JMP");
        assert_eq!(t.group_entry(Group::Group9, 0, 1).name, "CMPXCHG16B");
        // RCL stays invalid on purpose.
        assert!(!t.group_entry(Group::Group2, 0, 2).is_valid());
    }

    #[test]
    fn invalid_rows_stay_invalid() {
        let t = tables();
        assert!(!t.primary[0x82].is_valid());
        assert!(!t.secondary[0xff].is_valid());
    }
}
