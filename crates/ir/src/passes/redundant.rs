//! Redundant context-load elimination.
//!
//! Guest state lives at fixed offsets, so within a block a load from an
//! offset whose value is already known (from an earlier load or store of
//! the same width) can reuse that value. Register ops alias the same bytes
//! as context ops and are canonicalized onto offsets before lookup.

use std::collections::HashMap;

use crate::data::{block_ops, blocks, IrStore};
use crate::emitter::IrEmitter;
use crate::node::NodeId;
use crate::ops::{Op, RegClass};
use crate::passes::{Pass, PassError};
use silex_types::offsets;
use silex_types::{AF_AS_GREG, PF_AS_GREG};

pub struct RedundantContextLoadElimination;

impl RedundantContextLoadElimination {
    pub fn new() -> RedundantContextLoadElimination {
        RedundantContextLoadElimination
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct Slot {
    offset: u32,
    size_bytes: u32,
    class_is_fpr: bool,
}

/// Canonical byte offset of a register op.
fn register_offset(reg: u32, class: RegClass) -> u32 {
    match class {
        RegClass::Fpr | RegClass::FprFixed => offsets::xmm(reg),
        _ => {
            if reg == PF_AS_GREG {
                offsets::pf_raw()
            } else if reg == AF_AS_GREG {
                offsets::af_raw()
            } else {
                offsets::greg(reg)
            }
        }
    }
}

fn overlaps(a: Slot, b: Slot) -> bool {
    let a_end = a.offset + a.size_bytes;
    let b_end = b.offset + b.size_bytes;
    a.offset < b_end && b.offset < a_end
}

impl Pass for RedundantContextLoadElimination {
    fn name(&self) -> &'static str {
        "RedundantContextLoadElimination"
    }

    fn run(&mut self, emitter: &mut IrEmitter) -> Result<bool, PassError> {
        let mut changed = false;
        let block_list: Vec<NodeId> = blocks(emitter.data()).collect();
        for block in block_list {
            // Slot -> node currently known to hold that state value.
            let mut known: HashMap<Slot, NodeId> = HashMap::new();
            let ops: Vec<NodeId> = block_ops(emitter.data(), block).collect();
            for node in ops {
                let payload = *emitter.data().op(node);
                let load_slot = match payload.op {
                    Op::LoadContext { offset, class } => Some((offset, class)),
                    Op::LoadRegister { reg, class } => Some((register_offset(reg, class), class)),
                    _ => None,
                };
                let store_slot = match payload.op {
                    Op::StoreContext { offset, class, value } => Some((offset, class, value)),
                    Op::StoreRegister { reg, class, value } => {
                        Some((register_offset(reg, class), class, value))
                    }
                    _ => None,
                };

                if let Some((offset, class)) = load_slot {
                    if class == RegClass::GprPair {
                        continue;
                    }
                    let slot = Slot {
                        offset,
                        size_bytes: payload.size.bytes(),
                        class_is_fpr: matches!(class, RegClass::Fpr | RegClass::FprFixed),
                    };
                    if let Some(&existing) = known.get(&slot) {
                        emitter.replace_uses_with_after(node, existing, node);
                        emitter.remove(node);
                        changed = true;
                    } else {
                        known.insert(slot, node);
                    }
                } else if let Some((offset, class, value)) = store_slot {
                    if class == RegClass::GprPair {
                        known.clear();
                        continue;
                    }
                    let slot = Slot {
                        offset,
                        size_bytes: payload.size.bytes(),
                        class_is_fpr: matches!(class, RegClass::Fpr | RegClass::FprFixed),
                    };
                    known.retain(|existing, _| !overlaps(*existing, slot));
                    known.insert(slot, value);
                } else if matches!(
                    payload.op,
                    // The runtime may rewrite guest state wholesale.
                    Op::Syscall { .. } | Op::InlineSyscall { .. } | Op::Thunk { .. }
                ) {
                    known.clear();
                }
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::OpSize;
    use crate::pool::IntrusivePooledAllocator;

    #[test]
    fn second_load_reuses_first() {
        let mut e = IrEmitter::new(IntrusivePooledAllocator::new_heap());
        let block = e.create_code_node();
        e.start_block(block);
        let first = e.load_register(OpSize::I64, RegClass::Gpr, 3);
        let second = e.load_register(OpSize::I64, RegClass::Gpr, 3);
        let sum = e.add(OpSize::I64, first, second);
        e.store_register(OpSize::I64, RegClass::Gpr, 0, sum);
        let rip = e.constant(OpSize::I64, 0);
        e.exit_function(rip);
        e.finish_block(block);

        let changed = RedundantContextLoadElimination::new().run(&mut e).expect("pass");
        assert!(changed);
        match e.data().op(sum).op {
            Op::Add { src1, src2 } => {
                assert_eq!(src1, first);
                assert_eq!(src2, first);
            }
            ref other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn store_forwards_value_to_load() {
        let mut e = IrEmitter::new(IntrusivePooledAllocator::new_heap());
        let block = e.create_code_node();
        e.start_block(block);
        let value = e.constant(OpSize::I64, 5);
        e.store_register(OpSize::I64, RegClass::Gpr, 2, value);
        let reloaded = e.load_register(OpSize::I64, RegClass::Gpr, 2);
        e.store_register(OpSize::I64, RegClass::Gpr, 0, reloaded);
        let rip = e.constant(OpSize::I64, 0);
        e.exit_function(rip);
        e.finish_block(block);

        RedundantContextLoadElimination::new().run(&mut e).expect("pass");
        // The reload was replaced by the stored value.
        let remaining: Vec<NodeId> = block_ops(e.data(), block).collect();
        assert!(!remaining.contains(&reloaded));
    }

    #[test]
    fn intervening_store_blocks_reuse() {
        let mut e = IrEmitter::new(IntrusivePooledAllocator::new_heap());
        let block = e.create_code_node();
        e.start_block(block);
        let first = e.load_register(OpSize::I64, RegClass::Gpr, 3);
        let other = e.constant(OpSize::I64, 1);
        e.store_register(OpSize::I64, RegClass::Gpr, 3, other);
        let second = e.load_register(OpSize::I64, RegClass::Gpr, 3);
        let sum = e.add(OpSize::I64, first, second);
        e.store_register(OpSize::I64, RegClass::Gpr, 0, sum);
        let rip = e.constant(OpSize::I64, 0);
        e.exit_function(rip);
        e.finish_block(block);

        RedundantContextLoadElimination::new().run(&mut e).expect("pass");
        // The reload after the store must resolve to the stored value, not
        // the stale load.
        match e.data().op(sum).op {
            Op::Add { src1, src2 } => {
                assert_eq!(src1, first);
                assert_eq!(src2, other);
            }
            ref other => panic!("unexpected {other:?}"),
        }
    }
}
