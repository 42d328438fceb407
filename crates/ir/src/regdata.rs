//! Register allocation results: one packed physical register per node.

use crate::node::NodeId;
use crate::ops::RegClass;

/// A physical register assignment packed into one byte: the low five bits
/// are the register number, the high three the class.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PhysicalRegister {
    raw: u8,
}

impl PhysicalRegister {
    pub const INVALID: PhysicalRegister = PhysicalRegister { raw: 0xff };

    pub fn new(class: RegClass, reg: u8) -> PhysicalRegister {
        debug_assert!(reg < 32);
        PhysicalRegister { raw: ((class as u8) << 5) | (reg & 0x1f) }
    }

    pub fn class(self) -> RegClass {
        RegClass::from_bits(self.raw >> 5)
    }

    pub fn reg(self) -> u8 {
        self.raw & 0x1f
    }

    pub fn raw(self) -> u8 {
        self.raw
    }

    pub fn is_invalid(self) -> bool {
        self == Self::INVALID
    }
}

impl core::fmt::Debug for PhysicalRegister {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        if self.is_invalid() {
            write!(f, "r?")
        } else {
            write!(f, "{}:{}", self.class(), self.reg())
        }
    }
}

/// Flat node-id-indexed map of assignments plus the spill slot high-water
/// mark. Spill slots are 16 bytes each so vector values fit.
#[derive(Clone)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegisterAllocationData {
    spill_slot_count: u32,
    map: Vec<PhysicalRegister>,
}

pub const SPILL_SLOT_SIZE: u32 = 16;

impl RegisterAllocationData {
    pub fn new(node_count: u32) -> RegisterAllocationData {
        RegisterAllocationData {
            spill_slot_count: 0,
            map: vec![PhysicalRegister::INVALID; node_count as usize],
        }
    }

    pub fn node_register(&self, node: NodeId) -> PhysicalRegister {
        self.map
            .get(node.index())
            .copied()
            .unwrap_or(PhysicalRegister::INVALID)
    }

    pub fn set_node_register(&mut self, node: NodeId, reg: PhysicalRegister) {
        if node.index() >= self.map.len() {
            self.map.resize(node.index() + 1, PhysicalRegister::INVALID);
        }
        self.map[node.index()] = reg;
    }

    pub fn spill_slots(&self) -> u32 {
        self.spill_slot_count
    }

    pub fn set_spill_slots(&mut self, count: u32) {
        self.spill_slot_count = count;
    }

    pub fn map_count(&self) -> u32 {
        self.map.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn physical_register_packs() {
        let reg = PhysicalRegister::new(RegClass::Fpr, 17);
        assert_eq!(reg.class(), RegClass::Fpr);
        assert_eq!(reg.reg(), 17);
        assert_eq!(core::mem::size_of::<PhysicalRegister>(), 1);
        assert!(PhysicalRegister::INVALID.is_invalid());
        assert_eq!(PhysicalRegister::INVALID.class(), RegClass::Invalid);
    }

    #[test]
    fn map_grows_on_demand() {
        let mut data = RegisterAllocationData::new(2);
        data.set_node_register(NodeId::from_u32(5), PhysicalRegister::new(RegClass::Gpr, 3));
        assert_eq!(data.node_register(NodeId::from_u32(5)).reg(), 3);
        assert!(data.node_register(NodeId::from_u32(4)).is_invalid());
    }
}
