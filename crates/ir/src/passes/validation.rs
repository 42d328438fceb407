//! IR validation and control-flow discovery.
//!
//! Validation is a meta-pass: besides checking structural invariants it
//! computes the predecessor/successor sets and the entry block, which the
//! RA validation pass reuses.

use std::collections::HashMap;

use crate::data::{block_ops, blocks, DualListData, IrStore};
use crate::emitter::IrEmitter;
use crate::node::NodeId;
use crate::ops::{Op, RegClass};
use crate::passes::{Pass, PassError};

/// Register-file kind a value belongs to, resolving fills to their origin.
fn value_kind(data: &DualListData, id: NodeId) -> RegClass {
    match data.op(id).op {
        Op::FillRegister { orig, .. } => value_kind(data, orig),
        ref op => op.result_class(),
    }
}

fn is_vector(class: RegClass) -> bool {
    matches!(class, RegClass::Fpr | RegClass::FprFixed)
}

#[derive(Default, Clone)]
pub struct CfgBlock {
    pub predecessors: Vec<NodeId>,
    pub successors: Vec<NodeId>,
}

pub struct Cfg {
    pub entry: NodeId,
    pub order: Vec<NodeId>,
    pub blocks: HashMap<NodeId, CfgBlock>,
}

/// Walk the region and record the block graph. Successors come from the
/// terminator preceding each `EndBlock`.
pub fn compute_cfg(data: &DualListData) -> Cfg {
    let order: Vec<NodeId> = blocks(data).collect();
    let mut info: HashMap<NodeId, CfgBlock> = HashMap::new();
    for &block in &order {
        info.entry(block).or_default();
    }

    for &block in &order {
        let mut successors: Vec<NodeId> = Vec::new();
        for node in block_ops(data, block) {
            match data.op(node).op {
                Op::Jump { target } => successors.push(target),
                Op::CondJump { true_block, false_block, .. } => {
                    successors.push(true_block);
                    successors.push(false_block);
                }
                _ => {}
            }
        }
        for &succ in &successors {
            if let Some(entry) = info.get_mut(&succ) {
                entry.predecessors.push(block);
            }
        }
        info.get_mut(&block).expect("block registered").successors = successors;
    }

    Cfg {
        entry: order.first().copied().unwrap_or(NodeId::INVALID),
        order,
        blocks: info,
    }
}

pub struct IrValidation;

impl IrValidation {
    pub fn new() -> IrValidation {
        IrValidation
    }

    fn check(&self, data: &DualListData) -> Result<(), PassError> {
        let err = |message: String| Err(PassError::Validation(message));

        // Recounted uses must match the stored counts.
        let mut uses: HashMap<NodeId, u32> = HashMap::new();
        // Defs seen so far in program order; args must be behind us.
        let mut defined: std::collections::HashSet<NodeId> = std::collections::HashSet::new();
        let block_list: Vec<NodeId> = blocks(data).collect();
        if block_list.is_empty() {
            return err("region has no blocks".to_string());
        }

        for &block in &block_list {
            if !matches!(data.op(block).op, Op::CodeBlock { .. }) {
                return err(format!("{block} in block chain is not a CodeBlock"));
            }

            let ops: Vec<NodeId> = block_ops(data, block).collect();
            if ops.len() < 2 {
                return err(format!("block {block} has no begin/end bracket"));
            }
            match data.op(ops[0]).op {
                Op::BeginBlock { block: owner } if owner == block => {}
                _ => return err(format!("block {block} does not start with BeginBlock")),
            }
            match data.op(*ops.last().expect("nonempty")).op {
                Op::EndBlock { block: owner } if owner == block => {}
                _ => return err(format!("block {block} does not end with EndBlock")),
            }

            // Exactly one terminator, sitting directly before EndBlock.
            for (index, &node) in ops.iter().enumerate() {
                let payload = data.op(node);
                let is_exit = payload.op.is_block_exit();
                let is_last_real = index + 2 == ops.len();
                if is_exit && !is_last_real {
                    return err(format!("{node} terminates block {block} early"));
                }
                if is_last_real && !is_exit {
                    return err(format!(
                        "block {block} falls off its end without a terminator"
                    ));
                }

                payload.op.visit_args(|arg| {
                    if arg.is_valid() {
                        *uses.entry(arg).or_insert(0) += 1;
                    }
                });

                // Straight-line SSA: every argument's definition precedes
                // the user in program order. Block ordering supplies
                // dominance for the (rare) cross-block reference.
                let mut bad_arg = None;
                payload.op.visit_args(|arg| {
                    if arg.is_valid() && !defined.contains(&arg) && bad_arg.is_none() {
                        bad_arg = Some(arg);
                    }
                });
                if let Some(arg) = bad_arg {
                    return err(format!("{node} consumes {arg} before its definition"));
                }
                defined.insert(node);

                // Argument register-file kinds must match the op's shape.
                if let Some(message) = check_arg_kinds(data, node, &payload.op) {
                    return err(message);
                }
            }
        }

        for &block in &block_list {
            for node in block_ops(data, block) {
                let counted = uses.get(&node).copied().unwrap_or(0);
                let stored = data.node(node).uses;
                if counted != stored {
                    return err(format!(
                        "{node} has {stored} recorded uses but {counted} real ones"
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Property check: GPR-shaped ops must not consume vector values and vice
/// versa, and pair consumers need pair producers.
fn check_arg_kinds(data: &DualListData, node: NodeId, op: &Op) -> Option<String> {
    let vector_args: &[NodeId] = match op {
        Op::VAdd { src1, src2 }
        | Op::VSub { src1, src2 }
        | Op::VAnd { src1, src2 }
        | Op::VOr { src1, src2 }
        | Op::VXor { src1, src2 }
        | Op::FAdd { src1, src2 }
        | Op::FSub { src1, src2 }
        | Op::FMul { src1, src2 }
        | Op::FDiv { src1, src2 }
        | Op::FCmp { src1, src2 } => &[*src1, *src2],
        Op::VExtractToGpr { vector, .. } => &[*vector],
        Op::VInsertGpr { vector, .. } => &[*vector],
        Op::CvtFToF { src } | Op::CvtFToSInt { src } => &[*src],
        _ => &[],
    };
    for &arg in vector_args {
        if arg.is_valid() && !is_vector(value_kind(data, arg)) {
            return Some(format!(
                "{node} needs a vector operand but {arg} is {}",
                value_kind(data, arg)
            ));
        }
    }

    // Integer ALU must not eat vector values.
    let scalar_args: &[NodeId] = match op {
        Op::Add { src1, src2 }
        | Op::Sub { src1, src2 }
        | Op::Mul { src1, src2 }
        | Op::UMul { src1, src2 }
        | Op::And { src1, src2 }
        | Op::Or { src1, src2 }
        | Op::Xor { src1, src2 }
        | Op::Lshl { src1, src2 }
        | Op::Lshr { src1, src2 }
        | Op::Ashr { src1, src2 } => &[*src1, *src2],
        Op::Not { src } | Op::Neg { src } | Op::Popcount { src } => &[*src],
        _ => &[],
    };
    for &arg in scalar_args {
        if arg.is_valid() && is_vector(value_kind(data, arg)) {
            return Some(format!("{node} needs a GPR operand but {arg} is a vector"));
        }
    }

    if let Op::ExtractElementPair { pair, .. } = op {
        if value_kind(data, *pair) != RegClass::GprPair {
            return Some(format!("{node} expects a register pair from {pair}"));
        }
    }
    None
}

impl Pass for IrValidation {
    fn name(&self) -> &'static str {
        "IRValidation"
    }

    fn run(&mut self, emitter: &mut IrEmitter) -> Result<bool, PassError> {
        self.check(emitter.data())?;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{CondCode, OpSize, RegClass};
    use crate::pool::IntrusivePooledAllocator;

    fn emitter() -> IrEmitter {
        IrEmitter::new(IntrusivePooledAllocator::new_heap())
    }

    #[test]
    fn accepts_well_formed_region() {
        let mut e = emitter();
        let head = e.create_code_node();
        let tail = e.create_code_node();
        e.start_block(head);
        let value = e.constant(OpSize::I64, 3);
        e.store_register(OpSize::I64, RegClass::Gpr, 0, value);
        e.jump(tail);
        e.finish_block(head);
        e.start_block(tail);
        let rip = e.constant(OpSize::I64, 0x100);
        e.exit_function(rip);
        e.finish_block(tail);

        IrValidation::new().run(&mut e).expect("valid");

        let cfg = compute_cfg(e.data());
        assert_eq!(cfg.entry, head);
        assert_eq!(cfg.blocks[&head].successors, vec![tail]);
        assert_eq!(cfg.blocks[&tail].predecessors, vec![head]);
    }

    #[test]
    fn rejects_missing_terminator() {
        let mut e = emitter();
        let block = e.create_code_node();
        e.start_block(block);
        let _ = e.constant(OpSize::I64, 3);
        e.finish_block(block);
        assert!(IrValidation::new().run(&mut e).is_err());
    }

    #[test]
    fn rejects_corrupted_use_counts() {
        let mut e = emitter();
        let block = e.create_code_node();
        e.start_block(block);
        let value = e.constant(OpSize::I64, 3);
        let rip = e.constant(OpSize::I64, 0x100);
        e.exit_function(rip);
        e.finish_block(block);

        use crate::data::IrStoreMut;
        e.data_mut().node_mut(value).uses = 7;
        assert!(IrValidation::new().run(&mut e).is_err());
    }

    #[test]
    fn rejects_vector_value_in_integer_alu() {
        let mut e = emitter();
        let block = e.create_code_node();
        e.start_block(block);
        let vector = e.load_register(crate::ops::OpSize::I128, RegClass::Fpr, 0);
        let scalar = e.constant(OpSize::I64, 1);
        let bad = e.add(OpSize::I64, vector, scalar);
        e.store_register(OpSize::I64, RegClass::Gpr, 0, bad);
        let rip = e.constant(OpSize::I64, 0);
        e.exit_function(rip);
        e.finish_block(block);
        assert!(IrValidation::new().run(&mut e).is_err());
    }

    #[test]
    fn rejects_scalar_value_in_vector_op() {
        let mut e = emitter();
        let block = e.create_code_node();
        e.start_block(block);
        let a = e.constant(OpSize::I64, 1);
        let b = e.load_register(OpSize::I128, RegClass::Fpr, 1);
        let bad = e.vadd(OpSize::I128, OpSize::I32, a, b);
        e.store_register(OpSize::I128, RegClass::Fpr, 0, bad);
        let rip = e.constant(OpSize::I64, 0);
        e.exit_function(rip);
        e.finish_block(block);
        assert!(IrValidation::new().run(&mut e).is_err());
    }

    #[test]
    fn cond_jump_records_both_successors() {
        let mut e = emitter();
        let head = e.create_code_node();
        let yes = e.create_code_node();
        let no = e.create_code_node();
        e.start_block(head);
        let value = e.constant(OpSize::I32, 1);
        let zero = e.constant(OpSize::I32, 0);
        e.cond_jump(CondCode::Neq, OpSize::I32, value, zero, yes, no);
        e.finish_block(head);
        for block in [yes, no] {
            e.start_block(block);
            let rip = e.constant(OpSize::I64, 0);
            e.exit_function(rip);
            e.finish_block(block);
        }

        let cfg = compute_cfg(e.data());
        assert_eq!(cfg.blocks[&head].successors, vec![yes, no]);
        assert_eq!(cfg.blocks[&yes].predecessors, vec![head]);
        assert_eq!(cfg.blocks[&no].predecessors, vec![head]);
    }
}
