//! Textual IR emission.
//!
//! The text format exists for debugging dumps and for the serialization
//! round-trip guarantee: printing, parsing, and printing again yields
//! byte-identical output. To make that hold regardless of how passes have
//! interleaved arena ids, the printer renumbers nodes in traversal order:
//! all `CodeBlock` nodes first, then each block's ops top to bottom. The
//! parser allocates in reading order, so its ids match the display ids.

use std::collections::HashMap;
use std::fmt::Write;

use crate::data::{block_ops, blocks, IrStore};
use crate::node::NodeId;
use crate::ops::{Op, OpPayload};

fn display_id(names: &HashMap<NodeId, u32>, id: NodeId) -> u32 {
    if id.is_invalid() {
        0
    } else {
        *names.get(&id).expect("reference to unnumbered node")
    }
}

fn write_size(out: &mut String, payload: &OpPayload) {
    if payload.size == payload.elem_size {
        let _ = write!(out, "i{}", payload.size.bits());
    } else {
        let _ = write!(
            out,
            "i{}v{}",
            payload.elem_size.bits(),
            payload.element_count()
        );
    }
}

fn hash_hex(hash: &[u8; 32]) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Render a region to its canonical text form.
pub fn write_ir<S: IrStore + ?Sized>(store: &S) -> String {
    let mut names: HashMap<NodeId, u32> = HashMap::new();
    let mut next = 1u32;
    let mut number = |names: &mut HashMap<NodeId, u32>, id: NodeId| {
        names.insert(id, next);
        next += 1;
    };

    // Number blocks first, then ops in block order.
    let block_list: Vec<NodeId> = blocks(store).collect();
    for &block in &block_list {
        number(&mut names, block);
    }
    for &block in &block_list {
        for node in block_ops(store, block) {
            number(&mut names, node);
        }
    }

    let mut out = String::new();
    for &block in &block_list {
        let _ = writeln!(out, "%{} = CodeBlock", display_id(&names, block));
    }
    for &block in &block_list {
        let _ = writeln!(out, "Block %{}:", display_id(&names, block));
        for node in block_ops(store, block) {
            let payload = store.op(node);
            out.push_str("  ");
            if payload.op.has_result() {
                let _ = write!(out, "%{} ", display_id(&names, node));
                write_size(&mut out, payload);
                out.push_str(" = ");
            } else {
                // Void ops still carry a node id and an operation width
                // (stores in particular), parenthesized so readers can tell
                // nothing consumes them.
                let _ = write!(out, "(%{} ", display_id(&names, node));
                write_size(&mut out, payload);
                out.push_str(") ");
            }
            write_body(&mut out, payload, &names);
            out.push('\n');
        }
    }
    out
}

fn arg(names: &HashMap<NodeId, u32>, id: NodeId) -> String {
    format!("%{}", display_id(names, id))
}

fn write_body(out: &mut String, payload: &OpPayload, names: &HashMap<NodeId, u32>) {
    let name = payload.op.name();
    match &payload.op {
        Op::Invalid => {
            let _ = write!(out, "{name}");
        }
        Op::CodeBlock { .. } => {
            // Never reached: CodeBlock lines are printed by `write_ir`.
            let _ = write!(out, "{name}");
        }
        Op::BeginBlock { block } | Op::EndBlock { block } => {
            let _ = write!(out, "{name} {}", arg(names, *block));
        }
        Op::Constant { value } | Op::InlineConstant { value } => {
            let _ = write!(out, "{name} #{value:#x}");
        }
        Op::LoadContext { offset, class } => {
            let _ = write!(out, "{name} {class}, #{offset:#x}");
        }
        Op::StoreContext { offset, class, value } => {
            let _ = write!(out, "{name} {class}, #{offset:#x}, {}", arg(names, *value));
        }
        Op::LoadRegister { reg, class } => {
            let _ = write!(out, "{name} {class}, #{reg}");
        }
        Op::StoreRegister { reg, class, value } => {
            let _ = write!(out, "{name} {class}, #{reg}, {}", arg(names, *value));
        }
        Op::LoadFlag { flag } => {
            let _ = write!(out, "{name} #{flag}");
        }
        Op::StoreFlag { flag, value } => {
            let _ = write!(out, "{name} #{flag}, {}", arg(names, *value));
        }
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
            let _ = write!(out, "{name} {}, {}", arg(names, *src1), arg(names, *src2));
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
        | Op::CvtFToSInt { src } => {
            let _ = write!(out, "{name} {}", arg(names, *src));
        }
        Op::Bfe { src, lsb, width } | Op::Sbfe { src, lsb, width } => {
            let _ = write!(out, "{name} {}, #{lsb}, #{width}", arg(names, *src));
        }
        Op::Bfi { dest, src, lsb, width } => {
            let _ = write!(
                out,
                "{name} {}, {}, #{lsb}, #{width}",
                arg(names, *dest),
                arg(names, *src)
            );
        }
        Op::Select { cond, compare_size, cmp1, cmp2, true_val, false_val } => {
            let _ = write!(
                out,
                "{name} {cond}, i{}, {}, {}, {}, {}",
                compare_size.bits(),
                arg(names, *cmp1),
                arg(names, *cmp2),
                arg(names, *true_val),
                arg(names, *false_val)
            );
        }
        Op::LoadMem { class, addr, offset, align }
        | Op::LoadMemTso { class, addr, offset, align } => {
            let _ = write!(
                out,
                "{name} {class}, {}, {}, align {align}",
                arg(names, *addr),
                arg(names, *offset)
            );
        }
        Op::StoreMem { class, addr, value, offset, align }
        | Op::StoreMemTso { class, addr, value, offset, align } => {
            let _ = write!(
                out,
                "{name} {class}, {}, {}, {}, align {align}",
                arg(names, *addr),
                arg(names, *value),
                arg(names, *offset)
            );
        }
        Op::Cas { expected, desired, addr } | Op::CasPair { expected, desired, addr } => {
            let _ = write!(
                out,
                "{name} {}, {}, {}",
                arg(names, *expected),
                arg(names, *desired),
                arg(names, *addr)
            );
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
            let _ = write!(out, "{name} {}, {}", arg(names, *addr), arg(names, *value));
        }
        Op::AtomicNeg { addr } => {
            let _ = write!(out, "{name} {}", arg(names, *addr));
        }
        Op::CreateElementPair { lo, hi } => {
            let _ = write!(out, "{name} {}, {}", arg(names, *lo), arg(names, *hi));
        }
        Op::ExtractElementPair { pair, index } => {
            let _ = write!(out, "{name} {}, #{index}", arg(names, *pair));
        }
        Op::VExtractToGpr { vector, index } => {
            let _ = write!(out, "{name} {}, #{index}", arg(names, *vector));
        }
        Op::VInsertGpr { vector, src, index } => {
            let _ = write!(
                out,
                "{name} {}, {}, #{index}",
                arg(names, *vector),
                arg(names, *src)
            );
        }
        Op::CpuId { function, leaf } => {
            let _ = write!(out, "{name} {}, {}", arg(names, *function), arg(names, *leaf));
        }
        Op::XGetBv { function } => {
            let _ = write!(out, "{name} {}", arg(names, *function));
        }
        Op::Syscall { args } | Op::InlineSyscall { args } => {
            let _ = write!(out, "{name}");
            for (index, node) in args.iter().enumerate() {
                let sep = if index == 0 { ' ' } else { ',' };
                if index == 0 {
                    let _ = write!(out, "{sep}{}", arg(names, *node));
                } else {
                    let _ = write!(out, "{sep} {}", arg(names, *node));
                }
            }
        }
        Op::Thunk { arg_ptr, hash } => {
            let _ = write!(out, "{name} {}, #{}", arg(names, *arg_ptr), hash_hex(hash));
        }
        Op::ValidateCode { offset, original_lo, original_hi, length } => {
            let _ = write!(
                out,
                "{name} #{offset:#x}, #{original_lo:#x}, #{original_hi:#x}, #{length}"
            );
        }
        Op::RemoveCodeEntry { rip } => {
            let _ = write!(out, "{name} #{rip:#x}");
        }
        Op::Break { reason } => {
            let _ = write!(
                out,
                "{name} #{}, #{}, #{}, #{}",
                reason.signal, reason.trap_number, reason.si_code, reason.error_register
            );
        }
        Op::Jump { target } => {
            let _ = write!(out, "{name} {}", arg(names, *target));
        }
        Op::CondJump { cond, compare_size, cmp1, cmp2, true_block, false_block } => {
            let _ = write!(
                out,
                "{name} {cond}, i{}, {}, {}, {}, {}",
                compare_size.bits(),
                arg(names, *cmp1),
                arg(names, *cmp2),
                arg(names, *true_block),
                arg(names, *false_block)
            );
        }
        Op::ExitFunction { new_rip } => {
            let _ = write!(out, "{name} {}", arg(names, *new_rip));
        }
        Op::SpillRegister { value, slot } => {
            let _ = write!(out, "{name} {}, #{slot}", arg(names, *value));
        }
        Op::FillRegister { orig, slot } => {
            let _ = write!(out, "{name} {}, #{slot}", arg(names, *orig));
        }
    }
}
