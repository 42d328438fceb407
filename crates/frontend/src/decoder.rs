//! x86 instruction decoding and basic-block discovery.
//!
//! The decoder consumes raw guest bytes: prefixes, REX, the opcode maps from
//! [`crate::tables`], ModRM/SIB, displacement, and immediate, producing
//! `DecodedInst` records. Region decoding walks breadth-first from an entry
//! RIP, queueing both successors of conditional branches, until the
//! configured instruction budget is spent.

use std::collections::{HashSet, VecDeque};

use silex_ir::OpSize;
use silex_types::x86::Segment;

use crate::tables::{tables, ImmKind, InstFlags, InstType, X86InstInfo};

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid opcode {byte:#04x} at {rip:#x}")]
    InvalidOpcode { rip: u64, byte: u16 },
    #[error("instruction at {rip:#x} exceeds 15 bytes")]
    TooLong { rip: u64 },
    #[error("fault reading guest code at {addr:#x}")]
    ReadFault { addr: u64 },
}

/// Source of guest instruction bytes.
pub trait InstStream {
    fn read_u8(&self, addr: u64) -> Option<u8>;
}

/// Stream over a borrowed byte slice mapped at `base`. The test harness's
/// stream of choice.
pub struct SliceStream<'a> {
    pub base: u64,
    pub bytes: &'a [u8],
}

impl<'a> InstStream for SliceStream<'a> {
    fn read_u8(&self, addr: u64) -> Option<u8> {
        let offset = addr.checked_sub(self.base)? as usize;
        self.bytes.get(offset).copied()
    }
}

/// Stream reading directly from host memory: guest addresses are host
/// addresses in a userspace emulator.
pub struct RawMemoryStream;

impl InstStream for RawMemoryStream {
    fn read_u8(&self, addr: u64) -> Option<u8> {
        if addr == 0 {
            return None;
        }
        // Guest code pages are mapped into this process; a bad RIP faults
        // the same way it would fault the guest.
        Some(unsafe { core::ptr::read(addr as *const u8) })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemOperand {
    pub base: Option<u32>,
    pub index: Option<u32>,
    pub scale: u8,
    pub disp: i64,
    pub rip_relative: bool,
}

/// A decoded operand location. Register numbers are raw encodings; whether
/// they name a GPR or a vector register is decided by the instruction row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodedOperand {
    None,
    Reg { num: u32 },
    /// Legacy high-byte register (AH/CH/DH/BH).
    RegHigh { num: u32 },
    Mem(MemOperand),
}

impl DecodedOperand {
    pub fn is_mem(&self) -> bool {
        matches!(self, DecodedOperand::Mem(_))
    }
}

#[derive(Clone)]
pub struct DecodedInst {
    pub rip: u64,
    pub length: u8,
    pub info: &'static X86InstInfo,
    /// Primary opcode byte, or `0x0f00 | byte` for the secondary map.
    pub opcode: u16,
    /// Effective flags: the table row's plus, for group rows, the escape
    /// row's.
    pub flags: InstFlags,
    pub operand_size: OpSize,
    pub address_size: OpSize,
    pub rm: DecodedOperand,
    pub reg_op: DecodedOperand,
    /// Register embedded in the opcode's low bits (push/pop/mov-imm forms).
    pub opcode_reg: u32,
    /// A REX prefix was present; byte-register encodings 4..=7 then name
    /// SPL/BPL/SIL/DIL rather than the legacy high bytes.
    pub has_rex: bool,
    pub imm: u64,
    pub has_imm: bool,
    pub lock: bool,
    /// `Some(true)` for REP/REPE, `Some(false)` for REPNE.
    pub rep: Option<bool>,
    pub segment_override: Option<Segment>,
    /// ModRM byte when present (x87 and group-7 handlers re-inspect it).
    pub modrm: u8,
}

impl DecodedInst {
    pub fn next_rip(&self) -> u64 {
        self.rip + u64::from(self.length)
    }

    /// Branch displacement target for rel-immediate control flow.
    pub fn branch_target(&self) -> u64 {
        self.next_rip().wrapping_add(self.imm)
    }
}

pub struct DecodedBlock {
    pub entry: u64,
    pub instructions: Vec<DecodedInst>,
    /// RIP of an undecodable instruction this block ran into, if any.
    pub invalid_tail: Option<u64>,
    /// True when the block ends without a block-ending instruction (budget
    /// exhaustion); execution falls through to `fallthrough_rip`.
    pub falls_through: bool,
}

impl DecodedBlock {
    pub fn fallthrough_rip(&self) -> u64 {
        self.instructions
            .last()
            .map(|inst| inst.next_rip())
            .unwrap_or(self.entry)
    }
}

pub struct DecodedBlocks {
    pub entry: u64,
    pub blocks: Vec<DecodedBlock>,
    pub entries: HashSet<u64>,
}

pub struct Decoder<'a, S: InstStream> {
    stream: &'a S,
}

struct Prefixes {
    operand_size_override: bool,
    address_size_override: bool,
    lock: bool,
    rep: Option<bool>,
    segment: Option<Segment>,
    rex: Option<u8>,
}

const MAX_INST_LENGTH: u64 = 15;

impl<'a, S: InstStream> Decoder<'a, S> {
    pub fn new(stream: &'a S) -> Decoder<'a, S> {
        Decoder { stream }
    }

    fn read(&self, addr: u64) -> Result<u8, DecodeError> {
        self.stream
            .read_u8(addr)
            .ok_or(DecodeError::ReadFault { addr })
    }

    pub fn decode_instruction(&self, rip: u64) -> Result<DecodedInst, DecodeError> {
        let t = tables();
        let mut cursor = rip;
        let mut prefixes = Prefixes {
            operand_size_override: false,
            address_size_override: false,
            lock: false,
            rep: None,
            segment: None,
            rex: None,
        };

        // Prefixes and REX. A legacy prefix after REX cancels the REX.
        let opcode_byte = loop {
            if cursor - rip >= MAX_INST_LENGTH {
                return Err(DecodeError::TooLong { rip });
            }
            let byte = self.read(cursor)?;
            cursor += 1;
            match byte {
                0x66 => prefixes.operand_size_override = true,
                0x67 => prefixes.address_size_override = true,
                0xf0 => prefixes.lock = true,
                0xf2 => prefixes.rep = Some(false),
                0xf3 => prefixes.rep = Some(true),
                0x26 => prefixes.segment = Some(Segment::Es),
                0x2e => prefixes.segment = Some(Segment::Cs),
                0x36 => prefixes.segment = Some(Segment::Ss),
                0x3e => prefixes.segment = Some(Segment::Ds),
                0x64 => prefixes.segment = Some(Segment::Fs),
                0x65 => prefixes.segment = Some(Segment::Gs),
                0x40..=0x4f => {
                    prefixes.rex = Some(byte);
                    continue;
                }
                _ => break byte,
            }
            prefixes.rex = None;
        };

        let (info, opcode) = if opcode_byte == 0x0f {
            let second = self.read(cursor)?;
            cursor += 1;
            (&t.secondary[second as usize], 0x0f00 | u16::from(second))
        } else {
            (&t.primary[opcode_byte as usize], u16::from(opcode_byte))
        };

        let mut info: &'static X86InstInfo = info;
        let mut flags = info.flags;
        let mut imm_kind = info.imm;

        let rex = prefixes.rex;
        let rex_w = rex.map_or(false, |r| r & 0x8 != 0);
        let rex_r = rex.map_or(false, |r| r & 0x4 != 0);
        let rex_x = rex.map_or(false, |r| r & 0x2 != 0);
        let rex_b = rex.map_or(false, |r| r & 0x1 != 0);

        // ModRM (and group resolution) before immediates.
        let mut modrm_byte = 0u8;
        let mut rm = DecodedOperand::None;
        let mut reg_op = DecodedOperand::None;
        let needs_modrm = flags.contains(InstFlags::MODRM)
            || matches!(info.kind, InstType::Group(..) | InstType::X87);
        if needs_modrm {
            modrm_byte = self.read(cursor)?;
            cursor += 1;
        }

        if let InstType::Group(group, variant) = info.kind {
            let reg = (modrm_byte >> 3) & 7;
            let row = t.group_entry(group, variant, reg);
            if !row.is_valid() {
                return Err(DecodeError::InvalidOpcode { rip, byte: opcode });
            }
            flags |= row.flags;
            if row.imm != ImmKind::None {
                imm_kind = row.imm;
            }
            info = row;
        } else if !info.is_valid() {
            return Err(DecodeError::InvalidOpcode { rip, byte: opcode });
        }

        // Operand and address sizes. Pushes and branches ignore 66h rather
        // than truncating RIP, so SIZE_64BIT wins over the override.
        let operand_size = if flags.contains(InstFlags::SIZE_8BIT) {
            OpSize::I8
        } else if flags.contains(InstFlags::SIZE_64BIT) || rex_w {
            OpSize::I64
        } else if prefixes.operand_size_override {
            OpSize::I16
        } else {
            OpSize::I32
        };
        let address_size = if prefixes.address_size_override { OpSize::I32 } else { OpSize::I64 };

        if needs_modrm {
            let parsed = self.parse_modrm(
                modrm_byte,
                &mut cursor,
                rip,
                rex.is_some(),
                rex_r,
                rex_x,
                rex_b,
                operand_size,
                flags,
            )?;
            rm = parsed.0;
            reg_op = parsed.1;
        }

        // Immediate.
        let mut imm = 0u64;
        let mut has_imm = true;
        let imm_bytes: u8 = match imm_kind {
            ImmKind::None => {
                has_imm = false;
                0
            }
            ImmKind::Imm8 | ImmKind::Imm8Sext => 1,
            ImmKind::Imm16 => 2,
            ImmKind::Imm32Sext => 4,
            ImmKind::ImmOp | ImmKind::ImmOpSext => match operand_size {
                OpSize::I16 => 2,
                OpSize::I8 => 1,
                _ => 4,
            },
            ImmKind::ImmOpFull => operand_size.bytes() as u8,
        };
        if imm_bytes != 0 {
            let mut raw = 0u64;
            for index in 0..imm_bytes {
                raw |= u64::from(self.read(cursor)?) << (8 * index);
                cursor += 1;
            }
            imm = match imm_kind {
                ImmKind::Imm8Sext => raw as u8 as i8 as i64 as u64,
                ImmKind::Imm32Sext => raw as u32 as i32 as i64 as u64,
                ImmKind::ImmOpSext => match imm_bytes {
                    1 => raw as u8 as i8 as i64 as u64,
                    2 => raw as u16 as i16 as i64 as u64,
                    _ => raw as u32 as i32 as i64 as u64,
                },
                _ => raw,
            };
            // Immediates never exceed the operand width.
            if operand_size < OpSize::I64 {
                imm &= operand_size.value_mask();
            }
        }

        let length = cursor - rip;
        if length > MAX_INST_LENGTH {
            return Err(DecodeError::TooLong { rip });
        }

        // Low bits of the (final) opcode byte; BSWAP lives in the secondary
        // map, so take them from the map-local byte.
        let opcode_reg = u32::from(opcode as u8 & 7) | (u32::from(rex_b) << 3);

        Ok(DecodedInst {
            rip,
            length: length as u8,
            info,
            opcode,
            flags,
            operand_size,
            address_size,
            rm,
            reg_op,
            opcode_reg,
            has_rex: rex.is_some(),
            imm,
            has_imm,
            lock: prefixes.lock,
            rep: prefixes.rep,
            segment_override: prefixes.segment,
            modrm: modrm_byte,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn parse_modrm(
        &self,
        modrm: u8,
        cursor: &mut u64,
        rip: u64,
        has_rex: bool,
        rex_r: bool,
        rex_x: bool,
        rex_b: bool,
        operand_size: OpSize,
        flags: InstFlags,
    ) -> Result<(DecodedOperand, DecodedOperand), DecodeError> {
        let mode = modrm >> 6;
        let reg_field = (modrm >> 3) & 7;
        let rm_field = modrm & 7;

        let make_reg = |num: u32, is_xmm: bool| -> DecodedOperand {
            // AH..BH only exist for byte ops without REX.
            if !is_xmm
                && operand_size == OpSize::I8
                && !has_rex
                && (4..8).contains(&num)
            {
                DecodedOperand::RegHigh { num: num - 4 }
            } else {
                DecodedOperand::Reg { num }
            }
        };

        let reg_num = u32::from(reg_field) | (u32::from(rex_r) << 3);
        let reg_op = make_reg(reg_num, flags.contains(InstFlags::REG_IS_XMM));

        if mode == 3 {
            let num = u32::from(rm_field) | (u32::from(rex_b) << 3);
            return Ok((make_reg(num, flags.contains(InstFlags::RM_IS_XMM)), reg_op));
        }

        let mut base = None;
        let mut index = None;
        let mut scale = 1u8;
        let mut disp = 0i64;
        let mut rip_relative = false;
        let mut disp_bytes = match mode {
            1 => 1u8,
            2 => 4u8,
            _ => 0u8,
        };

        if rm_field == 4 {
            // SIB byte.
            let sib = self.read(*cursor)?;
            *cursor += 1;
            let sib_scale = sib >> 6;
            let sib_index = (sib >> 3) & 7;
            let sib_base = sib & 7;

            scale = 1 << sib_scale;
            let index_num = u32::from(sib_index) | (u32::from(rex_x) << 3);
            // Index 4 without REX.X means "no index".
            if index_num != 4 {
                index = Some(index_num);
            }
            if sib_base == 5 && mode == 0 {
                disp_bytes = 4;
            } else {
                base = Some(u32::from(sib_base) | (u32::from(rex_b) << 3));
            }
        } else if rm_field == 5 && mode == 0 {
            rip_relative = true;
            disp_bytes = 4;
        } else {
            base = Some(u32::from(rm_field) | (u32::from(rex_b) << 3));
        }

        if disp_bytes != 0 {
            let mut raw = 0u64;
            for byte_index in 0..disp_bytes {
                raw |= u64::from(self.read(*cursor)?) << (8 * byte_index);
                *cursor += 1;
            }
            disp = if disp_bytes == 1 { raw as u8 as i8 as i64 } else { raw as u32 as i32 as i64 };
        }
        if *cursor - rip > MAX_INST_LENGTH {
            return Err(DecodeError::TooLong { rip });
        }

        Ok((
            DecodedOperand::Mem(MemOperand { base, index, scale, disp, rip_relative }),
            reg_op,
        ))
    }

    /// Discover and decode a multi-block region starting at `entry`.
    ///
    /// Conditional branches queue both successors; decoding stops when the
    /// instruction budget is spent. A decode failure truncates its block and
    /// records the faulting RIP so the lowering can plant a precise trap.
    pub fn decode_region(&self, entry: u64, max_instructions: usize) -> DecodedBlocks {
        let mut queue: VecDeque<u64> = VecDeque::new();
        let mut entries: HashSet<u64> = HashSet::new();
        let mut blocks: Vec<DecodedBlock> = Vec::new();
        let mut budget = max_instructions;

        queue.push_back(entry);
        entries.insert(entry);

        while let Some(start) = queue.pop_front() {
            if blocks.iter().any(|block| block.entry == start) {
                continue;
            }

            let mut block = DecodedBlock {
                entry: start,
                instructions: Vec::new(),
                invalid_tail: None,
                falls_through: false,
            };
            let mut rip = start;

            loop {
                if budget == 0 {
                    block.falls_through = true;
                    break;
                }
                let inst = match self.decode_instruction(rip) {
                    Ok(inst) => inst,
                    Err(error) => {
                        log::debug!("decode failure: {error}");
                        block.invalid_tail = Some(rip);
                        break;
                    }
                };
                budget -= 1;
                let next = inst.next_rip();
                let ends_block = inst.flags.contains(InstFlags::BLOCK_END);

                // Queue branch successors while the budget allows growing
                // the region.
                if ends_block && budget > 0 {
                    match inst.info.name {
                        "Jcc" => {
                            for target in [inst.branch_target(), next] {
                                if entries.insert(target) {
                                    queue.push_back(target);
                                }
                            }
                        }
                        "JMP" if inst.has_imm => {
                            let target = inst.branch_target();
                            if entries.insert(target) {
                                queue.push_back(target);
                            }
                        }
                        _ => {}
                    }
                }

                block.instructions.push(inst);
                rip = next;
                if ends_block {
                    break;
                }
            }

            blocks.push(block);
        }

        DecodedBlocks { entry, blocks, entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(bytes: &[u8]) -> DecodedInst {
        let stream = SliceStream { base: 0x1000, bytes };
        Decoder::new(&stream).decode_instruction(0x1000).expect("decode")
    }

    #[test]
    fn mov_rax_imm32() {
        // mov rax, 42
        let inst = decode_one(&[0x48, 0xc7, 0xc0, 0x2a, 0x00, 0x00, 0x00]);
        assert_eq!(inst.length, 7);
        assert_eq!(inst.info.name, "MOV");
        assert_eq!(inst.operand_size, OpSize::I64);
        assert_eq!(inst.imm, 42);
        assert_eq!(inst.rm, DecodedOperand::Reg { num: 0 });
    }

    #[test]
    fn add_esi_edi_modrm() {
        // add esi, edi (01 FE: rm=esi dest, reg=edi)
        let inst = decode_one(&[0x01, 0xfe]);
        assert_eq!(inst.info.name, "ADD");
        assert!(inst.flags.contains(InstFlags::MODRM_DST));
        assert_eq!(inst.rm, DecodedOperand::Reg { num: 6 });
        assert_eq!(inst.reg_op, DecodedOperand::Reg { num: 7 });
        assert_eq!(inst.operand_size, OpSize::I32);
    }

    #[test]
    fn rex_extends_registers() {
        // add r8, r9
        let inst = decode_one(&[0x4d, 0x01, 0xc8]);
        assert_eq!(inst.rm, DecodedOperand::Reg { num: 8 });
        assert_eq!(inst.reg_op, DecodedOperand::Reg { num: 9 });
        assert_eq!(inst.operand_size, OpSize::I64);
    }

    #[test]
    fn sib_with_displacement() {
        // mov rax, [rbx + rcx*4 + 0x10]
        let inst = decode_one(&[0x48, 0x8b, 0x44, 0x8b, 0x10]);
        match inst.rm {
            DecodedOperand::Mem(mem) => {
                assert_eq!(mem.base, Some(3));
                assert_eq!(mem.index, Some(1));
                assert_eq!(mem.scale, 4);
                assert_eq!(mem.disp, 0x10);
                assert!(!mem.rip_relative);
            }
            ref other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rip_relative_addressing() {
        // mov rax, [rip + 0x100]
        let inst = decode_one(&[0x48, 0x8b, 0x05, 0x00, 0x01, 0x00, 0x00]);
        match inst.rm {
            DecodedOperand::Mem(mem) => {
                assert!(mem.rip_relative);
                assert_eq!(mem.disp, 0x100);
            }
            ref other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn high_byte_registers_without_rex() {
        // mov ah, al (88 C4: rm=ah, reg=al)
        let inst = decode_one(&[0x88, 0xc4]);
        assert_eq!(inst.rm, DecodedOperand::RegHigh { num: 0 });
        assert_eq!(inst.reg_op, DecodedOperand::Reg { num: 0 });
    }

    #[test]
    fn spl_with_rex() {
        // mov spl, al needs REX to reach spl instead of ah.
        let inst = decode_one(&[0x40, 0x88, 0xc4]);
        assert_eq!(inst.rm, DecodedOperand::Reg { num: 4 });
    }

    #[test]
    fn lock_and_segment_prefixes() {
        // lock add [fs:rax], ebx
        let inst = decode_one(&[0xf0, 0x64, 0x01, 0x18]);
        assert!(inst.lock);
        assert_eq!(inst.segment_override, Some(Segment::Fs));
        assert!(inst.rm.is_mem());
    }

    #[test]
    fn group_resolution_picks_sub_row() {
        // sub rax, 8 (83 /5 ib)
        let inst = decode_one(&[0x48, 0x83, 0xe8, 0x08]);
        assert_eq!(inst.info.name, "SUB");
        assert_eq!(inst.imm, 8);
    }

    #[test]
    fn jcc_rel8_targets() {
        // je +2
        let inst = decode_one(&[0x74, 0x02]);
        assert_eq!(inst.branch_target(), 0x1000 + 2 + 2);
        assert!(inst.flags.contains(InstFlags::BLOCK_END));
    }

    #[test]
    fn negative_branch_displacement() {
        // jmp -2 (eb fe: infinite loop onto itself)
        let inst = decode_one(&[0xeb, 0xfe]);
        assert_eq!(inst.branch_target(), 0x1000);
    }

    #[test]
    fn invalid_opcode_is_an_error() {
        let stream = SliceStream { base: 0, bytes: &[0x82, 0x00] };
        assert!(matches!(
            Decoder::new(&stream).decode_instruction(0),
            Err(DecodeError::InvalidOpcode { .. })
        ));
    }

    #[test]
    fn region_discovery_follows_both_jcc_arms() {
        // S2 shape: two ALU ops, a compare, a forward branch over a
        // self-loop, and a halt.
        let bytes = [
            0xbe, 0x05, 0x00, 0x00, 0x00, // mov esi, 5
            0xbf, 0x03, 0x00, 0x00, 0x00, // mov edi, 3
            0x01, 0xfe, // add esi, edi
            0x39, 0xf7, // cmp edi, esi
            0x74, 0x02, // je +2
            0xeb, 0xfe, // jmp self
            0xf4, // hlt
        ];
        let stream = SliceStream { base: 0x2000, bytes: &bytes };
        let region = Decoder::new(&stream).decode_region(0x2000, 128);

        assert_eq!(region.entry, 0x2000);
        // Entry block plus the branch target, fallthrough, and the loop's
        // self-target (already queued as the fallthrough).
        assert!(region.entries.contains(&0x2012)); // hlt
        assert!(region.entries.contains(&0x2010)); // jmp self
        let entry_block = &region.blocks[0];
        assert_eq!(entry_block.instructions.len(), 5);
        assert_eq!(entry_block.instructions.last().unwrap().info.name, "Jcc");
    }

    #[test]
    fn region_budget_truncates() {
        let bytes = [0x90u8; 32]; // nops
        let stream = SliceStream { base: 0, bytes: &bytes };
        let region = Decoder::new(&stream).decode_region(0, 4);
        assert_eq!(region.blocks.len(), 1);
        let block = &region.blocks[0];
        assert_eq!(block.instructions.len(), 4);
        assert!(block.falls_through);
        assert_eq!(block.fallthrough_rip(), 4);
    }

    #[test]
    fn decode_failure_truncates_block() {
        let bytes = [0x90, 0x82, 0x00]; // nop; invalid
        let stream = SliceStream { base: 0, bytes: &bytes };
        let region = Decoder::new(&stream).decode_region(0, 16);
        let block = &region.blocks[0];
        assert_eq!(block.instructions.len(), 1);
        assert_eq!(block.invalid_tail, Some(1));
    }
}
