//! Register allocation validation.
//!
//! Simulates the allocation over every control-flow path: each physical
//! register tracks the SSA id it holds, block entry states are the
//! intersection of predecessor exits, and every consumed argument must find
//! its own id in the register the allocator claims it lives in. Backward
//! edges re-merge with a filter that clobbers bindings to values defined
//! after the destination block starts.
//!
//! This never affects runtime behavior; it exists to catch allocator bugs
//! the instant they are introduced.

use std::collections::HashMap;

use crate::data::{block_ops, DualListData, IrStore};
use crate::node::NodeId;
use crate::ops::{Op, RegClass};
use crate::passes::validation::compute_cfg;
use crate::passes::PassError;
use crate::regdata::{PhysicalRegister, RegisterAllocationData};

const UNINITIALIZED: NodeId = NodeId::INVALID;

fn sentinel(raw: u32) -> NodeId {
    NodeId::from_u32(raw)
}

// Values that can never be real node ids (the arena would have to hold four
// billion nodes first).
fn invalid_reg() -> NodeId {
    sentinel(0xffff_ffff)
}

fn corrupted_pair() -> NodeId {
    sentinel(0xffff_fffe)
}

fn clobbered() -> NodeId {
    sentinel(0xffff_fffd)
}

/// Physical register file contents at one program point.
///
/// Assumes at most 32 registers per class, and that pair register N aliases
/// registers N and N+1; both hold for every backend register map.
#[derive(Clone, PartialEq)]
struct RegState {
    gprs: [NodeId; 32],
    gprs_fixed: [NodeId; 32],
    fprs: [NodeId; 32],
    fprs_fixed: [NodeId; 32],
    spills: HashMap<u32, NodeId>,
}

impl Default for RegState {
    fn default() -> Self {
        RegState {
            gprs: [UNINITIALIZED; 32],
            gprs_fixed: [UNINITIALIZED; 32],
            fprs: [UNINITIALIZED; 32],
            fprs_fixed: [UNINITIALIZED; 32],
            spills: HashMap::new(),
        }
    }
}

impl RegState {
    fn set(&mut self, reg: PhysicalRegister, ssa: NodeId) -> bool {
        let index = reg.reg() as usize;
        match reg.class() {
            RegClass::Gpr => self.gprs[index] = ssa,
            RegClass::GprFixed => self.gprs_fixed[index] = ssa,
            RegClass::Fpr => self.fprs[index] = ssa,
            RegClass::FprFixed => self.fprs_fixed[index] = ssa,
            RegClass::GprPair => {
                self.gprs[index] = ssa;
                self.gprs[index + 1] = ssa;
            }
            _ => return false,
        }
        true
    }

    fn get(&self, reg: PhysicalRegister) -> NodeId {
        let index = reg.reg() as usize;
        match reg.class() {
            RegClass::Gpr => self.gprs[index],
            RegClass::GprFixed => self.gprs_fixed[index],
            RegClass::Fpr => self.fprs[index],
            RegClass::FprFixed => self.fprs_fixed[index],
            RegClass::GprPair => {
                if self.gprs[index] == self.gprs[index + 1] {
                    self.gprs[index]
                } else {
                    corrupted_pair()
                }
            }
            _ => invalid_reg(),
        }
    }

    /// Merge another state in; registers and slots that disagree are
    /// clobbered so nothing downstream can consume them.
    fn intersect(&mut self, other: &RegState) {
        for (mine, theirs) in self.gprs.iter_mut().zip(other.gprs.iter()) {
            if mine != theirs {
                *mine = clobbered();
            }
        }
        for (mine, theirs) in self.gprs_fixed.iter_mut().zip(other.gprs_fixed.iter()) {
            if mine != theirs {
                *mine = clobbered();
            }
        }
        for (mine, theirs) in self.fprs.iter_mut().zip(other.fprs.iter()) {
            if mine != theirs {
                *mine = clobbered();
            }
        }
        for (mine, theirs) in self.fprs_fixed.iter_mut().zip(other.fprs_fixed.iter()) {
            if mine != theirs {
                *mine = clobbered();
            }
        }
        self.spills.retain(|slot, value| other.spills.get(slot) == Some(value));
    }

    /// Backward-edge merge: bindings to values defined at or after the
    /// destination's first node cannot be trusted around the loop.
    fn filter(&mut self, cutoff: NodeId) {
        let clobber = |slot: &mut NodeId| {
            if slot.is_valid() && slot.as_u32() < 0xffff_fff0 && *slot >= cutoff {
                *slot = clobbered();
            }
        };
        self.gprs.iter_mut().for_each(clobber);
        self.gprs_fixed.iter_mut().for_each(clobber);
        self.fprs.iter_mut().for_each(clobber);
        self.fprs_fixed.iter_mut().for_each(clobber);
        self.spills.retain(|_, value| *value < cutoff);
    }
}

/// Verify `ra` against the region in `data`.
pub fn validate_register_allocation(
    data: &DualListData,
    ra: &RegisterAllocationData,
) -> Result<(), PassError> {
    let cfg = compute_cfg(data);
    let mut exit_states: HashMap<NodeId, RegState> = HashMap::new();
    let order_index: HashMap<NodeId, usize> = cfg
        .order
        .iter()
        .enumerate()
        .map(|(index, &block)| (block, index))
        .collect();

    // Two sweeps: the first settles forward edges, the second folds the
    // backward-edge filter in. Block-local value lifetimes make this
    // converge immediately; the machinery stays general.
    for _sweep in 0..2 {
        for (index, &block) in cfg.order.iter().enumerate() {
            let mut state = RegState::default();
            let mut merged = false;
            let info = &cfg.blocks[&block];
            for &pred in &info.predecessors {
                let Some(pred_exit) = exit_states.get(&pred) else {
                    continue;
                };
                let backward = order_index[&pred] >= index;
                let mut incoming = pred_exit.clone();
                if backward {
                    let cutoff = first_node_of(data, block);
                    incoming.filter(cutoff);
                }
                if merged {
                    state.intersect(&incoming);
                } else {
                    state = incoming;
                    merged = true;
                }
            }

            simulate_block(data, ra, block, &mut state)?;
            exit_states.insert(block, state);
        }
    }

    Ok(())
}

fn first_node_of(data: &DualListData, block: NodeId) -> NodeId {
    match data.op(block).op {
        Op::CodeBlock { begin, .. } => begin,
        _ => NodeId::INVALID,
    }
}

fn simulate_block(
    data: &DualListData,
    ra: &RegisterAllocationData,
    block: NodeId,
    state: &mut RegState,
) -> Result<(), PassError> {
    for node in block_ops(data, block) {
        let payload = data.op(node);

        match payload.op {
            Op::SpillRegister { value, slot } => {
                check_arg(ra, state, node, value)?;
                state.spills.insert(slot, value);
                continue;
            }
            Op::FillRegister { orig, slot } => {
                match state.spills.get(&slot) {
                    Some(&stored) if stored == orig => {}
                    Some(&stored) => {
                        return Err(PassError::RaValidation(format!(
                            "{node} fills slot {slot} expecting {orig} but it holds {stored}"
                        )))
                    }
                    None => {
                        return Err(PassError::RaValidation(format!(
                            "{node} fills slot {slot} which holds nothing"
                        )))
                    }
                }
                let reg = ra.node_register(node);
                if !reg.is_invalid() {
                    state.set(reg, node);
                }
                continue;
            }
            _ => {}
        }

        let mut args = Vec::new();
        payload.op.visit_args(|value| args.push(value));
        for value in args {
            if value.is_valid() {
                check_arg(ra, state, node, value)?;
            }
        }

        // A store to a statically bound guest register changes what that
        // host register holds.
        if let Op::StoreRegister { reg, class, value } = payload.op {
            if reg < 32 {
                let fixed_class = match class {
                    RegClass::Fpr | RegClass::FprFixed => RegClass::FprFixed,
                    _ => RegClass::GprFixed,
                };
                state.set(PhysicalRegister::new(fixed_class, reg as u8), value);
            }
        }

        if payload.op.has_result() {
            let reg = ra.node_register(node);
            if !reg.is_invalid() {
                state.set(reg, node);
            }
        }
    }
    Ok(())
}

fn check_arg(
    ra: &RegisterAllocationData,
    state: &RegState,
    user: NodeId,
    value: NodeId,
) -> Result<(), PassError> {
    let reg = ra.node_register(value);
    if reg.is_invalid() {
        // Not register allocated (inline constants and friends).
        return Ok(());
    }
    let held = state.get(reg);
    if held != value {
        return Err(PassError::RaValidation(format!(
            "{user} consumes {value} from {reg:?}, but that register holds {held}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::IrEmitter;
    use crate::ops::OpSize;
    use crate::passes::{RegAllocConfig, RegisterAllocationPass};
    use crate::pool::IntrusivePooledAllocator;

    #[test]
    fn detects_corrupted_assignment() {
        let mut e = IrEmitter::new(IntrusivePooledAllocator::new_heap());
        let block = e.create_code_node();
        e.start_block(block);
        let a = e.constant(OpSize::I64, 1);
        let b = e.constant(OpSize::I64, 2);
        let sum = e.add(OpSize::I64, a, b);
        e.store_register(OpSize::I64, RegClass::Gpr, 0, sum);
        let rip = e.constant(OpSize::I64, 0);
        e.exit_function(rip);
        e.finish_block(block);

        let mut pass = RegisterAllocationPass::new(RegAllocConfig::default());
        let mut ra = pass.run(&mut e).expect("alloc");
        validate_register_allocation(e.data(), &ra).expect("clean allocation validates");

        // Corrupt it: claim `a` lives where `b` does.
        ra.set_node_register(a, ra.node_register(b));
        assert!(validate_register_allocation(e.data(), &ra).is_err());
    }

    #[test]
    fn merge_clobbers_disagreeing_registers() {
        let mut a = RegState::default();
        let mut b = RegState::default();
        a.set(PhysicalRegister::new(RegClass::Gpr, 0), NodeId::from_u32(5));
        b.set(PhysicalRegister::new(RegClass::Gpr, 0), NodeId::from_u32(6));
        a.set(PhysicalRegister::new(RegClass::Gpr, 1), NodeId::from_u32(7));
        b.set(PhysicalRegister::new(RegClass::Gpr, 1), NodeId::from_u32(7));

        a.intersect(&b);
        assert_eq!(a.get(PhysicalRegister::new(RegClass::Gpr, 0)), clobbered());
        assert_eq!(
            a.get(PhysicalRegister::new(RegClass::Gpr, 1)),
            NodeId::from_u32(7)
        );
    }

    #[test]
    fn pair_mismatch_reads_as_corrupted() {
        let mut state = RegState::default();
        state.set(PhysicalRegister::new(RegClass::Gpr, 2), NodeId::from_u32(5));
        state.set(PhysicalRegister::new(RegClass::Gpr, 3), NodeId::from_u32(6));
        assert_eq!(
            state.get(PhysicalRegister::new(RegClass::GprPair, 2)),
            corrupted_pair()
        );

        state.set(PhysicalRegister::new(RegClass::GprPair, 2), NodeId::from_u32(9));
        assert_eq!(
            state.get(PhysicalRegister::new(RegClass::GprPair, 2)),
            NodeId::from_u32(9)
        );
    }

    #[test]
    fn filter_clobbers_later_definitions() {
        let mut state = RegState::default();
        state.set(PhysicalRegister::new(RegClass::Gpr, 0), NodeId::from_u32(10));
        state.set(PhysicalRegister::new(RegClass::Gpr, 1), NodeId::from_u32(3));
        state.filter(NodeId::from_u32(5));
        assert_eq!(state.get(PhysicalRegister::new(RegClass::Gpr, 0)), clobbered());
        assert_eq!(
            state.get(PhysicalRegister::new(RegClass::Gpr, 1)),
            NodeId::from_u32(3)
        );
    }
}
