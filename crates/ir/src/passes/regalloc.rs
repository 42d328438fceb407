//! Register allocation.
//!
//! A per-class forward-scan allocator over block-local SSA values. Host
//! registers come in two flavors per class: a dynamic pool the allocator
//! hands out freely, and the statically bound set (`GprFixed`/`FprFixed`)
//! that mirrors guest registers ("static register allocation"). A guest
//! register load whose live range contains no store to the same guest
//! register is served directly from its static binding, costing no dynamic
//! register at all.
//!
//! When the dynamic pool runs dry the value with the farthest next use is
//! spilled; spills and fills are materialized as `SpillRegister` /
//! `FillRegister` ops spliced in front of the op that forced them, and all
//! later uses are rewritten onto the fill.

use std::collections::{HashMap, VecDeque};

use crate::data::{block_ops, blocks, IrStore};
use crate::emitter::IrEmitter;
use crate::node::NodeId;
use crate::ops::{Op, OpSize, RegClass};
use crate::passes::PassError;
use crate::regdata::{PhysicalRegister, RegisterAllocationData};

#[derive(Clone, Copy, Debug)]
pub struct RegAllocConfig {
    /// Dynamic registers available per class.
    pub gpr_count: u8,
    pub fpr_count: u8,
    /// Whether the backend statically binds guest GPRs (and the PF/AF
    /// synthetic registers) to host registers.
    pub supports_fixed_gpr: bool,
    /// Same for the guest vector file.
    pub supports_fixed_fpr: bool,
}

impl Default for RegAllocConfig {
    fn default() -> Self {
        RegAllocConfig {
            gpr_count: 16,
            fpr_count: 16,
            supports_fixed_gpr: true,
            supports_fixed_fpr: true,
        }
    }
}

pub struct RegisterAllocationPass {
    config: RegAllocConfig,
}

#[derive(Clone, Copy, PartialEq)]
enum Loc {
    Reg(PhysicalRegister),
    Spilled(u32),
}

struct BlockState {
    gpr_free: Vec<bool>,
    fpr_free: Vec<bool>,
    gpr_live: Vec<Option<NodeId>>,
    fpr_live: Vec<Option<NodeId>>,
    location: HashMap<NodeId, Loc>,
    remaining: HashMap<NodeId, u32>,
    use_positions: HashMap<NodeId, VecDeque<usize>>,
    free_slots: Vec<u32>,
    next_slot: u32,
}

impl BlockState {
    fn new(config: &RegAllocConfig, next_slot: u32) -> BlockState {
        BlockState {
            gpr_free: vec![true; config.gpr_count as usize],
            fpr_free: vec![true; config.fpr_count as usize],
            gpr_live: vec![None; config.gpr_count as usize],
            fpr_live: vec![None; config.fpr_count as usize],
            location: HashMap::new(),
            remaining: HashMap::new(),
            use_positions: HashMap::new(),
            free_slots: Vec::new(),
            next_slot,
        }
    }

    fn free_register(&mut self, phys: PhysicalRegister) {
        match phys.class() {
            RegClass::Gpr => {
                self.gpr_free[phys.reg() as usize] = true;
                self.gpr_live[phys.reg() as usize] = None;
            }
            RegClass::Fpr => {
                self.fpr_free[phys.reg() as usize] = true;
                self.fpr_live[phys.reg() as usize] = None;
            }
            RegClass::GprPair => {
                for reg in [phys.reg(), phys.reg() + 1] {
                    self.gpr_free[reg as usize] = true;
                    self.gpr_live[reg as usize] = None;
                }
            }
            // Fixed bindings are not pool resources.
            _ => {}
        }
    }

    fn next_use(&self, node: NodeId) -> usize {
        self.use_positions
            .get(&node)
            .and_then(|queue| queue.front().copied())
            .unwrap_or(usize::MAX)
    }
}

/// Register class a value occupies, resolving fills to their origin.
fn value_class<S: IrStore + ?Sized>(store: &S, id: NodeId) -> RegClass {
    match store.op(id).op {
        Op::FillRegister { orig, .. } => value_class(store, orig),
        ref op => op.result_class(),
    }
}

impl RegisterAllocationPass {
    pub fn new(config: RegAllocConfig) -> RegisterAllocationPass {
        RegisterAllocationPass { config }
    }

    pub fn run(&mut self, emitter: &mut IrEmitter) -> Result<RegisterAllocationData, PassError> {
        let mut ra = RegisterAllocationData::new(emitter.data().count());
        let mut max_slots = 0u32;

        let block_list: Vec<NodeId> = blocks(emitter.data()).collect();
        for block in block_list {
            self.alloc_block(emitter, block, &mut ra, &mut max_slots)?;
        }

        ra.set_spill_slots(max_slots);
        Ok(ra)
    }

    fn alloc_block(
        &mut self,
        emitter: &mut IrEmitter,
        block: NodeId,
        ra: &mut RegisterAllocationData,
        max_slots: &mut u32,
    ) -> Result<(), PassError> {
        let ops: Vec<NodeId> = block_ops(emitter.data(), block).collect();
        let mut state = BlockState::new(&self.config, 0);

        // Pre-pass: use positions per value and store positions per guest
        // register (for the static-binding conflict scan).
        let mut gpr_stores: HashMap<u32, Vec<usize>> = HashMap::new();
        let mut fpr_stores: HashMap<u32, Vec<usize>> = HashMap::new();
        for (pos, &node) in ops.iter().enumerate() {
            let payload = emitter.data().op(node);
            payload.op.visit_args(|arg| {
                if arg.is_valid() {
                    state.use_positions.entry(arg).or_default().push_back(pos);
                }
            });
            if payload.op.has_result() {
                state
                    .remaining
                    .insert(node, emitter.data().node(node).uses);
            }
            if let Op::StoreRegister { reg, class, .. } = payload.op {
                match class {
                    RegClass::Fpr | RegClass::FprFixed => {
                        fpr_stores.entry(reg).or_default().push(pos)
                    }
                    _ => gpr_stores.entry(reg).or_default().push(pos),
                }
            }
        }

        for (pos, &node) in ops.iter().enumerate() {
            let payload = *emitter.data().op(node);

            // Current operands, updated as fills replace them. Nothing in
            // this list may be spilled to satisfy another fill.
            let mut needed: Vec<NodeId> = Vec::new();
            payload.op.visit_args(|arg| {
                if arg.is_valid() {
                    needed.push(arg);
                }
            });

            for index in 0..needed.len() {
                let arg = needed[index];
                if matches!(value_class(emitter.data(), arg), RegClass::Complex | RegClass::Invalid)
                {
                    continue;
                }
                let loc = match state.location.get(&arg) {
                    Some(loc) => *loc,
                    None => {
                        return Err(PassError::RegAlloc(format!(
                            "{arg} consumed in a block it is not defined in"
                        )))
                    }
                };

                let current = match loc {
                    Loc::Reg(_) => arg,
                    Loc::Spilled(slot) => {
                        let class = value_class(emitter.data(), arg);
                        let size = emitter.data().op(arg).size;
                        let phys =
                            self.alloc_reg(emitter, &mut state, class, &needed, node, max_slots)?;
                        let fill = emitter.fill_register(size, arg, slot, node);
                        ra.set_node_register(fill, phys);
                        self.mark_live(&mut state, phys, fill);
                        state.location.insert(fill, Loc::Reg(phys));
                        state.free_slots.push(slot);

                        // Everything from this op onward reads the fill.
                        emitter.replace_uses_with_after(arg, fill, node);
                        let queue = state.use_positions.remove(&arg).unwrap_or_default();
                        state.use_positions.insert(fill, queue);
                        let left = state.remaining.remove(&arg).unwrap_or(0);
                        state.remaining.insert(fill, left);
                        state.location.remove(&arg);

                        // Later operand slots of this op may also have held
                        // `arg`.
                        for slot_ref in needed.iter_mut().skip(index) {
                            if *slot_ref == arg {
                                *slot_ref = fill;
                            }
                        }
                        fill
                    }
                };

                // Consume this use.
                if let Some(queue) = state.use_positions.get_mut(&current) {
                    queue.pop_front();
                }
                let dead = {
                    let left = state.remaining.entry(current).or_insert(1);
                    *left = left.saturating_sub(1);
                    *left == 0
                };
                if dead {
                    if let Some(Loc::Reg(phys)) = state.location.get(&current).copied() {
                        state.free_register(phys);
                    }
                    state.location.remove(&current);
                    state.remaining.remove(&current);
                    state.use_positions.remove(&current);
                }
            }

            if !payload.op.has_result() {
                continue;
            }
            let class = payload.op.result_class();
            if matches!(class, RegClass::Complex | RegClass::Invalid) {
                continue;
            }

            // Static binding for conflict-free guest register loads.
            if let Op::LoadRegister { reg, class: load_class } = payload.op {
                let fixed = match load_class {
                    RegClass::Gpr if self.config.supports_fixed_gpr => {
                        let last_use = state
                            .use_positions
                            .get(&node)
                            .and_then(|queue| queue.back().copied())
                            .unwrap_or(pos);
                        let conflict = gpr_stores.get(&reg).map_or(false, |stores| {
                            stores.iter().any(|&store| pos < store && store < last_use)
                        });
                        (!conflict).then(|| PhysicalRegister::new(RegClass::GprFixed, reg as u8))
                    }
                    RegClass::Fpr if self.config.supports_fixed_fpr => {
                        let last_use = state
                            .use_positions
                            .get(&node)
                            .and_then(|queue| queue.back().copied())
                            .unwrap_or(pos);
                        let conflict = fpr_stores.get(&reg).map_or(false, |stores| {
                            stores.iter().any(|&store| pos < store && store < last_use)
                        });
                        (!conflict).then(|| PhysicalRegister::new(RegClass::FprFixed, reg as u8))
                    }
                    _ => None,
                };
                if let Some(phys) = fixed {
                    ra.set_node_register(node, phys);
                    state.location.insert(node, Loc::Reg(phys));
                    continue;
                }
            }

            let phys = self.alloc_reg(emitter, &mut state, class, &needed, node, max_slots)?;
            ra.set_node_register(node, phys);
            self.mark_live(&mut state, phys, node);
            state.location.insert(node, Loc::Reg(phys));

            // A result nothing consumes frees its register immediately.
            if state.remaining.get(&node).copied().unwrap_or(0) == 0 {
                state.free_register(phys);
                state.location.remove(&node);
            }
        }

        *max_slots = (*max_slots).max(state.next_slot);
        Ok(())
    }

    fn mark_live(&self, state: &mut BlockState, phys: PhysicalRegister, node: NodeId) {
        match phys.class() {
            RegClass::Gpr => {
                state.gpr_free[phys.reg() as usize] = false;
                state.gpr_live[phys.reg() as usize] = Some(node);
            }
            RegClass::Fpr => {
                state.fpr_free[phys.reg() as usize] = false;
                state.fpr_live[phys.reg() as usize] = Some(node);
            }
            RegClass::GprPair => {
                for reg in [phys.reg(), phys.reg() + 1] {
                    state.gpr_free[reg as usize] = false;
                    state.gpr_live[reg as usize] = Some(node);
                }
            }
            _ => {}
        }
    }

    fn alloc_reg(
        &self,
        emitter: &mut IrEmitter,
        state: &mut BlockState,
        class: RegClass,
        needed: &[NodeId],
        anchor: NodeId,
        max_slots: &mut u32,
    ) -> Result<PhysicalRegister, PassError> {
        let pair = class == RegClass::GprPair;
        let use_fpr = class == RegClass::Fpr;

        for _attempt in 0..=self.config.gpr_count.max(self.config.fpr_count) {
            let found = if pair {
                let free = &state.gpr_free;
                (0..free.len().saturating_sub(1))
                    .find(|&index| free[index] && free[index + 1])
                    .map(|index| PhysicalRegister::new(RegClass::GprPair, index as u8))
            } else {
                let free = if use_fpr { &state.fpr_free } else { &state.gpr_free };
                free.iter()
                    .position(|&is_free| is_free)
                    .map(|index| {
                        PhysicalRegister::new(
                            if use_fpr { RegClass::Fpr } else { RegClass::Gpr },
                            index as u8,
                        )
                    })
            };

            if let Some(phys) = found {
                match phys.class() {
                    RegClass::Gpr => state.gpr_free[phys.reg() as usize] = false,
                    RegClass::Fpr => state.fpr_free[phys.reg() as usize] = false,
                    RegClass::GprPair => {
                        state.gpr_free[phys.reg() as usize] = false;
                        state.gpr_free[phys.reg() as usize + 1] = false;
                    }
                    _ => {}
                }
                return Ok(phys);
            }

            // Pool dry: spill the live value with the farthest next use.
            let live = if use_fpr { &state.fpr_live } else { &state.gpr_live };
            let victim = live
                .iter()
                .flatten()
                .copied()
                .filter(|node| !needed.contains(node))
                .max_by_key(|node| state.next_use(*node));
            let Some(victim) = victim else {
                return Err(PassError::RegAlloc(format!(
                    "no spillable {class} register at {anchor}"
                )));
            };

            let slot = state.free_slots.pop().unwrap_or_else(|| {
                let slot = state.next_slot;
                state.next_slot += 1;
                slot
            });
            *max_slots = (*max_slots).max(state.next_slot);

            let size = emitter.data().op(victim).size;
            emitter.spill_register(size, victim, slot, anchor);
            let Some(Loc::Reg(victim_reg)) = state.location.get(&victim).copied() else {
                return Err(PassError::RegAlloc(format!("spill victim {victim} has no register")));
            };
            state.free_register(victim_reg);
            state.location.insert(victim, Loc::Spilled(slot));
        }

        Err(PassError::RegAlloc(format!("unable to free a {class} register at {anchor}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::validate_register_allocation;
    use crate::pool::IntrusivePooledAllocator;

    fn emitter() -> IrEmitter {
        IrEmitter::new(IntrusivePooledAllocator::new_heap())
    }

    fn finish(e: &mut IrEmitter, block: NodeId) {
        let rip = e.constant(OpSize::I64, 0);
        e.exit_function(rip);
        e.finish_block(block);
    }

    #[test]
    fn straight_line_allocation_validates() {
        let mut e = emitter();
        let block = e.create_code_node();
        e.start_block(block);
        let a = e.load_register(OpSize::I64, RegClass::Gpr, 0);
        let b = e.load_register(OpSize::I64, RegClass::Gpr, 1);
        let sum = e.add(OpSize::I64, a, b);
        e.store_register(OpSize::I64, RegClass::Gpr, 0, sum);
        finish(&mut e, block);

        let mut pass = RegisterAllocationPass::new(RegAllocConfig::default());
        let ra = pass.run(&mut e).expect("alloc");
        validate_register_allocation(e.data(), &ra).expect("validate");

        // Conflict-free guest loads ride their static bindings.
        assert_eq!(ra.node_register(a).class(), RegClass::GprFixed);
        assert_eq!(ra.node_register(a).reg(), 0);
        assert_eq!(ra.node_register(b).reg(), 1);
        assert_eq!(ra.node_register(sum).class(), RegClass::Gpr);
        assert_eq!(ra.spill_slots(), 0);
    }

    #[test]
    fn store_conflict_forces_dynamic_register() {
        // xchg-style: the load of r0 stays live across a store to r0.
        let mut e = emitter();
        let block = e.create_code_node();
        e.start_block(block);
        let a = e.load_register(OpSize::I64, RegClass::Gpr, 0);
        let b = e.load_register(OpSize::I64, RegClass::Gpr, 1);
        e.store_register(OpSize::I64, RegClass::Gpr, 0, b);
        e.store_register(OpSize::I64, RegClass::Gpr, 1, a);
        finish(&mut e, block);

        let mut pass = RegisterAllocationPass::new(RegAllocConfig::default());
        let ra = pass.run(&mut e).expect("alloc");
        validate_register_allocation(e.data(), &ra).expect("validate");

        assert_eq!(ra.node_register(a).class(), RegClass::Gpr);
        // b's last use precedes the store to r1, so it keeps the binding.
        assert_eq!(ra.node_register(b).class(), RegClass::GprFixed);
    }

    #[test]
    fn exhaustion_spills_and_fills() {
        let mut e = emitter();
        let block = e.create_code_node();
        e.start_block(block);
        // More live constants than dynamic registers.
        let mut values = Vec::new();
        for index in 0..6u64 {
            values.push(e.constant(OpSize::I64, index));
        }
        // Consume them in creation order so every value stays live across
        // the allocation of the others.
        let mut accum = e.add(OpSize::I64, values[0], values[1]);
        for &value in &values[2..] {
            accum = e.add(OpSize::I64, accum, value);
        }
        e.store_register(OpSize::I64, RegClass::Gpr, 0, accum);
        finish(&mut e, block);

        let config = RegAllocConfig { gpr_count: 3, ..RegAllocConfig::default() };
        let mut pass = RegisterAllocationPass::new(config);
        let ra = pass.run(&mut e).expect("alloc");
        assert!(ra.spill_slots() > 0);
        validate_register_allocation(e.data(), &ra).expect("validate");
    }

    #[test]
    fn pair_allocation_takes_adjacent_registers() {
        let mut e = emitter();
        let block = e.create_code_node();
        e.start_block(block);
        let lo = e.constant(OpSize::I64, 1);
        let hi = e.constant(OpSize::I64, 2);
        let pair = e.create_element_pair(OpSize::I128, lo, hi);
        let first = e.extract_element_pair(OpSize::I64, pair, 0);
        e.store_register(OpSize::I64, RegClass::Gpr, 0, first);
        finish(&mut e, block);

        let mut pass = RegisterAllocationPass::new(RegAllocConfig::default());
        let ra = pass.run(&mut e).expect("alloc");
        validate_register_allocation(e.data(), &ra).expect("validate");
        assert_eq!(ra.node_register(pair).class(), RegClass::GprPair);
    }
}
