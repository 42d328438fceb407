//! Dead code elimination.
//!
//! A node with no uses and no side effects is unlinked; removing it drops
//! its arguments' use counts, so a single backward sweep per block catches
//! whole dead chains.

use crate::data::{block_ops, blocks, IrStore};
use crate::emitter::IrEmitter;
use crate::node::NodeId;
use crate::passes::{Pass, PassError};

pub struct DeadCodeElimination;

impl DeadCodeElimination {
    pub fn new() -> DeadCodeElimination {
        DeadCodeElimination
    }
}

impl Pass for DeadCodeElimination {
    fn name(&self) -> &'static str {
        "DCE"
    }

    fn run(&mut self, emitter: &mut IrEmitter) -> Result<bool, PassError> {
        let mut changed = false;
        let block_list: Vec<NodeId> = blocks(emitter.data()).collect();
        for block in block_list {
            let ops: Vec<NodeId> = block_ops(emitter.data(), block).collect();
            for &node in ops.iter().rev() {
                let payload = emitter.data().op(node);
                if payload.op.has_side_effects() {
                    continue;
                }
                if emitter.data().node(node).uses == 0 {
                    emitter.remove(node);
                    changed = true;
                }
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{Op, OpSize, RegClass};
    use crate::pool::IntrusivePooledAllocator;

    #[test]
    fn removes_dead_chains() {
        let mut e = IrEmitter::new(IntrusivePooledAllocator::new_heap());
        let block = e.create_code_node();
        e.start_block(block);
        let used = e.constant(OpSize::I64, 1);
        let dead_a = e.constant(OpSize::I64, 2);
        let dead_b = e.add(OpSize::I64, dead_a, dead_a);
        e.store_register(OpSize::I64, RegClass::Gpr, 0, used);
        let rip = e.constant(OpSize::I64, 0);
        e.exit_function(rip);
        e.finish_block(block);

        let changed = DeadCodeElimination::new().run(&mut e).expect("pass");
        assert!(changed);

        let remaining: Vec<NodeId> = block_ops(e.data(), block).collect();
        assert!(!remaining.contains(&dead_a));
        assert!(!remaining.contains(&dead_b));
        assert!(remaining.contains(&used));

        // Second run is a no-op.
        assert!(!DeadCodeElimination::new().run(&mut e).expect("pass"));
    }

    #[test]
    fn keeps_side_effecting_ops() {
        let mut e = IrEmitter::new(IntrusivePooledAllocator::new_heap());
        let block = e.create_code_node();
        e.start_block(block);
        let addr = e.constant(OpSize::I64, 0x1000);
        let value = e.constant(OpSize::I64, 9);
        let store = e.store_mem(RegClass::Gpr, OpSize::I64, addr, value, 1);
        let rip = e.constant(OpSize::I64, 0);
        e.exit_function(rip);
        e.finish_block(block);

        DeadCodeElimination::new().run(&mut e).expect("pass");
        let remaining: Vec<NodeId> = block_ops(e.data(), block).collect();
        assert!(remaining.contains(&store));
        assert!(matches!(e.data().op(store).op, Op::StoreMem { .. }));
    }
}
