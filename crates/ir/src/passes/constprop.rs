//! Constant folding and inline-constant formation.
//!
//! Two jobs: fold ops whose operands are all constants, and rewrite
//! immediate-capable ops so their second operand is an `InlineConstant` the
//! backends can encode directly instead of materializing.

use crate::data::{block_ops, blocks, IrStore};
use crate::emitter::IrEmitter;
use crate::node::NodeId;
use crate::ops::{Op, OpPayload, OpSize};
use crate::passes::{Pass, PassError};

/// Largest value the inliner will hand to a backend immediate field. Both
/// backends can encode more in places, but this bound is valid everywhere.
const INLINE_LIMIT: u64 = 0xfff;

pub struct ConstProp;

impl ConstProp {
    pub fn new() -> ConstProp {
        ConstProp
    }
}

pub(crate) fn eval_unary(op: &Op, size: OpSize, src: u64) -> Option<u64> {
    let mask = size.value_mask();
    let src = src & mask;
    let bits = size.bits();
    let result = match op {
        Op::Not { .. } => !src,
        Op::Neg { .. } => src.wrapping_neg(),
        Op::Popcount { .. } => u64::from(src.count_ones()),
        Op::Clz { .. } => u64::from((src << (64 - bits)).leading_zeros().min(bits)),
        Op::Ctz { .. } => {
            if src == 0 {
                u64::from(bits)
            } else {
                u64::from(src.trailing_zeros())
            }
        }
        Op::Rev { .. } => src.swap_bytes() >> (64 - bits),
        Op::Copy { .. } => src,
        Op::Bfe { lsb, width, .. } => {
            let width_mask = if *width >= 64 { u64::MAX } else { (1u64 << width) - 1 };
            (src >> lsb) & width_mask
        }
        Op::Sbfe { lsb, width, .. } => {
            let shifted = src >> lsb;
            let shift = 64 - u32::from(*width);
            (((shifted << shift) as i64) >> shift) as u64
        }
        _ => return None,
    };
    Some(result & mask)
}

pub(crate) fn eval_binary(op: &Op, size: OpSize, lhs: u64, rhs: u64) -> Option<u64> {
    let mask = size.value_mask();
    let bits = size.bits();
    let lhs_masked = lhs & mask;
    let rhs_masked = rhs & mask;
    let shift_amount = (rhs_masked as u32) & (bits - 1);
    let result = match op {
        Op::Add { .. } => lhs_masked.wrapping_add(rhs_masked),
        Op::Sub { .. } => lhs_masked.wrapping_sub(rhs_masked),
        Op::And { .. } => lhs_masked & rhs_masked,
        Op::Or { .. } => lhs_masked | rhs_masked,
        Op::Xor { .. } => lhs_masked ^ rhs_masked,
        Op::UMul { .. } | Op::Mul { .. } => lhs_masked.wrapping_mul(rhs_masked),
        Op::Lshl { .. } => lhs_masked.wrapping_shl(shift_amount),
        Op::Lshr { .. } => lhs_masked.wrapping_shr(shift_amount),
        Op::Ashr { .. } => {
            let shift = 64 - bits;
            let extended = ((lhs_masked << shift) as i64) >> shift;
            (extended >> shift_amount) as u64
        }
        Op::Ror { .. } => {
            if shift_amount == 0 {
                lhs_masked
            } else {
                (lhs_masked >> shift_amount) | (lhs_masked << (bits - shift_amount))
            }
        }
        // Division by a constant zero must still trap at runtime.
        _ => return None,
    };
    Some(result & mask)
}

fn constant_value(emitter: &IrEmitter, node: NodeId) -> Option<u64> {
    match emitter.data().op(node).op {
        Op::Constant { value } | Op::InlineConstant { value } => Some(value),
        _ => None,
    }
}

/// Is this op allowed to take an `InlineConstant` in its final operand slot?
fn inlines_second_operand(op: &Op) -> bool {
    matches!(
        op,
        Op::Add { .. }
            | Op::Sub { .. }
            | Op::And { .. }
            | Op::Or { .. }
            | Op::Xor { .. }
            | Op::Lshl { .. }
            | Op::Lshr { .. }
            | Op::Ashr { .. }
            | Op::Ror { .. }
            | Op::CondJump { .. }
    )
}

impl Pass for ConstProp {
    fn name(&self) -> &'static str {
        "ConstProp"
    }

    fn run(&mut self, emitter: &mut IrEmitter) -> Result<bool, PassError> {
        let mut changed = false;

        let block_list: Vec<NodeId> = blocks(emitter.data()).collect();
        for block in block_list {
            let ops: Vec<NodeId> = block_ops(emitter.data(), block).collect();
            for node in ops {
                let payload = *emitter.data().op(node);
                match payload.op {
                    // Binary fold.
                    Op::Add { src1, src2 }
                    | Op::Sub { src1, src2 }
                    | Op::And { src1, src2 }
                    | Op::Or { src1, src2 }
                    | Op::Xor { src1, src2 }
                    | Op::Mul { src1, src2 }
                    | Op::UMul { src1, src2 }
                    | Op::Lshl { src1, src2 }
                    | Op::Lshr { src1, src2 }
                    | Op::Ashr { src1, src2 }
                    | Op::Ror { src1, src2 } => {
                        let lhs = constant_value(emitter, src1);
                        let rhs = constant_value(emitter, src2);
                        if let (Some(lhs), Some(rhs)) = (lhs, rhs) {
                            if let Some(result) =
                                eval_binary(&payload.op, payload.size, lhs, rhs)
                            {
                                emitter.replace_with_constant(node, result);
                                changed = true;
                                continue;
                            }
                        }
                        // Inline-constant formation on the second operand.
                        if let Some(value) = rhs {
                            if value <= INLINE_LIMIT
                                && inlines_second_operand(&payload.op)
                                && !matches!(
                                    emitter.data().op(src2).op,
                                    Op::InlineConstant { .. }
                                )
                            {
                                let inline = emitter.insert_before(
                                    node,
                                    OpPayload::scalar(
                                        Op::InlineConstant { value },
                                        payload.size,
                                    ),
                                );
                                // Second operand is visit slot 1.
                                emitter.replace_node_argument(node, 1, inline);
                                changed = true;
                            }
                        }
                    }

                    // Unary fold.
                    Op::Not { src }
                    | Op::Neg { src }
                    | Op::Popcount { src }
                    | Op::Clz { src }
                    | Op::Ctz { src }
                    | Op::Rev { src }
                    | Op::Copy { src }
                    | Op::Bfe { src, .. }
                    | Op::Sbfe { src, .. } => {
                        if let Some(value) = constant_value(emitter, src) {
                            if let Some(result) = eval_unary(&payload.op, payload.size, value) {
                                emitter.replace_with_constant(node, result);
                                changed = true;
                            }
                        }
                    }

                    Op::CondJump { cmp2, compare_size, .. } => {
                        if let Some(value) = constant_value(emitter, cmp2) {
                            if value <= INLINE_LIMIT
                                && !matches!(
                                    emitter.data().op(cmp2).op,
                                    Op::InlineConstant { .. }
                                )
                            {
                                let inline = emitter.insert_before(
                                    node,
                                    OpPayload::scalar(
                                        Op::InlineConstant { value },
                                        compare_size,
                                    ),
                                );
                                emitter.replace_node_argument(node, 1, inline);
                                changed = true;
                            }
                        }
                    }

                    _ => {}
                }
            }
        }

        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::RegClass;
    use crate::pool::IntrusivePooledAllocator;

    fn emitter() -> IrEmitter {
        IrEmitter::new(IntrusivePooledAllocator::new_heap())
    }

    #[test]
    fn folds_constant_addition() {
        let mut e = emitter();
        let block = e.create_code_node();
        e.start_block(block);
        let lhs = e.constant(OpSize::I32, 5);
        let rhs = e.constant(OpSize::I32, 3);
        let sum = e.add(OpSize::I32, lhs, rhs);
        e.store_register(OpSize::I64, RegClass::Gpr, 0, sum);
        let rip = e.constant(OpSize::I64, 0);
        e.exit_function(rip);
        e.finish_block(block);

        ConstProp::new().run(&mut e).expect("pass");
        assert!(matches!(e.data().op(sum).op, Op::Constant { value: 8 }));
        assert_eq!(e.data().node(lhs).uses, 0);
    }

    #[test]
    fn fold_masks_to_size() {
        let mut e = emitter();
        let block = e.create_code_node();
        e.start_block(block);
        let lhs = e.constant(OpSize::I8, 0xff);
        let rhs = e.constant(OpSize::I8, 1);
        let sum = e.add(OpSize::I8, lhs, rhs);
        e.store_register(OpSize::I64, RegClass::Gpr, 0, sum);
        let rip = e.constant(OpSize::I64, 0);
        e.exit_function(rip);
        e.finish_block(block);

        ConstProp::new().run(&mut e).expect("pass");
        assert!(matches!(e.data().op(sum).op, Op::Constant { value: 0 }));
    }

    #[test]
    fn inlines_small_second_operand() {
        let mut e = emitter();
        let block = e.create_code_node();
        e.start_block(block);
        let value = e.load_register(OpSize::I64, RegClass::Gpr, 0);
        let amount = e.constant(OpSize::I64, 16);
        let sum = e.add(OpSize::I64, value, amount);
        e.store_register(OpSize::I64, RegClass::Gpr, 0, sum);
        let rip = e.constant(OpSize::I64, 0);
        e.exit_function(rip);
        e.finish_block(block);

        ConstProp::new().run(&mut e).expect("pass");
        match e.data().op(sum).op {
            Op::Add { src2, .. } => {
                assert!(matches!(e.data().op(src2).op, Op::InlineConstant { value: 16 }));
            }
            ref other => panic!("unexpected {other:?}"),
        }
        // The original constant lost its use and is left for DCE.
        assert_eq!(e.data().node(amount).uses, 0);
    }

    #[test]
    fn sbfe_sign_extends() {
        assert_eq!(
            eval_unary(
                &Op::Sbfe { src: NodeId::INVALID, lsb: 0, width: 8 },
                OpSize::I64,
                0x80
            ),
            Some(0xffff_ffff_ffff_ff80)
        );
    }

    proptest::proptest! {
        /// Folded results always stay within their declared width, the
        /// invariant the canonicalized `Constant` op relies on.
        #[test]
        fn folds_stay_masked(lhs: u64, rhs: u64) {
            for size in [OpSize::I8, OpSize::I16, OpSize::I32, OpSize::I64] {
                for op in [
                    Op::Add { src1: NodeId::INVALID, src2: NodeId::INVALID },
                    Op::Sub { src1: NodeId::INVALID, src2: NodeId::INVALID },
                    Op::Mul { src1: NodeId::INVALID, src2: NodeId::INVALID },
                    Op::Lshl { src1: NodeId::INVALID, src2: NodeId::INVALID },
                    Op::Ashr { src1: NodeId::INVALID, src2: NodeId::INVALID },
                    Op::Ror { src1: NodeId::INVALID, src2: NodeId::INVALID },
                ] {
                    if let Some(result) = eval_binary(&op, size, lhs, rhs) {
                        proptest::prop_assert_eq!(result & size.value_mask(), result);
                    }
                }
            }
        }
    }

    #[test]
    fn clz_of_zero_is_width() {
        assert_eq!(
            eval_unary(&Op::Clz { src: NodeId::INVALID }, OpSize::I32, 0),
            Some(32)
        );
        assert_eq!(
            eval_unary(&Op::Clz { src: NodeId::INVALID }, OpSize::I32, 1),
            Some(31)
        );
    }
}
