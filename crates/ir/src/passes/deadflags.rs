//! Dead flag-store elimination.
//!
//! Lazy flag generation leaves a trail of `StoreFlag` ops, many of which are
//! overwritten before anything reads them. Within a block, a store to a flag
//! slot is dead if the same slot is stored again with no intervening read
//! and no op that can observe guest flags.

use std::collections::HashMap;

use crate::data::{block_ops, blocks, IrStore};
use crate::emitter::IrEmitter;
use crate::node::NodeId;
use crate::ops::Op;
use crate::passes::{Pass, PassError};

pub struct DeadFlagStoreElimination;

impl DeadFlagStoreElimination {
    pub fn new() -> DeadFlagStoreElimination {
        DeadFlagStoreElimination
    }
}

/// Ops that may observe the flag bytes outside of `LoadFlag`: anything that
/// leaves the block, enters the runtime, or reads guest state wholesale.
fn observes_flags(op: &Op) -> bool {
    matches!(
        op,
        Op::Syscall { .. }
            | Op::InlineSyscall { .. }
            | Op::Thunk { .. }
            | Op::Break { .. }
            | Op::Jump { .. }
            | Op::CondJump { .. }
            | Op::ExitFunction { .. }
            | Op::LoadContext { .. }
    )
}

impl Pass for DeadFlagStoreElimination {
    fn name(&self) -> &'static str {
        "DeadFlagStoreElimination"
    }

    fn run(&mut self, emitter: &mut IrEmitter) -> Result<bool, PassError> {
        let mut changed = false;
        let block_list: Vec<NodeId> = blocks(emitter.data()).collect();
        for block in block_list {
            // flag -> pending unread store
            let mut pending: HashMap<u32, NodeId> = HashMap::new();
            let ops: Vec<NodeId> = block_ops(emitter.data(), block).collect();
            for node in ops {
                let op = emitter.data().op(node).op;
                match op {
                    Op::StoreFlag { flag, .. } => {
                        if let Some(previous) = pending.insert(flag, node) {
                            emitter.remove(previous);
                            changed = true;
                        }
                    }
                    Op::LoadFlag { flag } => {
                        pending.remove(&flag);
                    }
                    ref other if observes_flags(other) => pending.clear(),
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
    use crate::ops::{OpSize, RegClass};
    use crate::pool::IntrusivePooledAllocator;
    use silex_types::x86;

    #[test]
    fn overwritten_store_is_removed() {
        let mut e = IrEmitter::new(IntrusivePooledAllocator::new_heap());
        let block = e.create_code_node();
        e.start_block(block);
        let a = e.constant(OpSize::I8, 1);
        let b = e.constant(OpSize::I8, 0);
        let first = e.store_flag(x86::FLAG_DF_RAW as u32, a);
        let second = e.store_flag(x86::FLAG_DF_RAW as u32, b);
        let rip = e.constant(OpSize::I64, 0);
        e.exit_function(rip);
        e.finish_block(block);

        let changed = DeadFlagStoreElimination::new().run(&mut e).expect("pass");
        assert!(changed);
        let remaining: Vec<NodeId> = block_ops(e.data(), block).collect();
        assert!(!remaining.contains(&first));
        assert!(remaining.contains(&second));
        // The first store's value reference was released.
        assert_eq!(e.data().node(a).uses, 0);
    }

    #[test]
    fn read_blocks_elimination() {
        let mut e = IrEmitter::new(IntrusivePooledAllocator::new_heap());
        let block = e.create_code_node();
        e.start_block(block);
        let a = e.constant(OpSize::I8, 1);
        let first = e.store_flag(x86::FLAG_DF_RAW as u32, a);
        let loaded = e.load_flag(x86::FLAG_DF_RAW as u32);
        e.store_register(OpSize::I64, RegClass::Gpr, 0, loaded);
        let b = e.constant(OpSize::I8, 0);
        let _second = e.store_flag(x86::FLAG_DF_RAW as u32, b);
        let rip = e.constant(OpSize::I64, 0);
        e.exit_function(rip);
        e.finish_block(block);

        DeadFlagStoreElimination::new().run(&mut e).expect("pass");
        let remaining: Vec<NodeId> = block_ops(e.data(), block).collect();
        assert!(remaining.contains(&first));
    }

    #[test]
    fn different_flags_do_not_conflict() {
        let mut e = IrEmitter::new(IntrusivePooledAllocator::new_heap());
        let block = e.create_code_node();
        e.start_block(block);
        let a = e.constant(OpSize::I8, 1);
        let df = e.store_flag(x86::FLAG_DF_RAW as u32, a);
        let tf = e.store_flag(x86::FLAG_TF as u32, a);
        let rip = e.constant(OpSize::I64, 0);
        e.exit_function(rip);
        e.finish_block(block);

        assert!(!DeadFlagStoreElimination::new().run(&mut e).expect("pass"));
        let remaining: Vec<NodeId> = block_ops(e.data(), block).collect();
        assert!(remaining.contains(&df));
        assert!(remaining.contains(&tf));
    }
}
