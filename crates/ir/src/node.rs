//! SSA node references and the node-links arena entry.
//!
//! Nodes in the IR reference each other through 32-bit ids rather than
//! pointers: ids halve the footprint on 64-bit hosts and keep a whole IR
//! region relocatable with a flat copy. Id 0 is the invalid sentinel; it is
//! materialized as a real (inert) node so link updates never need a null
//! check.

use core::fmt;

/// A reference to an IR node. Doubles as the index into both the node-links
/// arena and the op-payload arena, which are allocated in lockstep.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeId(u32);

impl NodeId {
    /// The sentinel node. Allocated first in every region.
    pub const INVALID: NodeId = NodeId(0);

    pub fn from_u32(raw: u32) -> NodeId {
        NodeId(raw)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn is_invalid(self) -> bool {
        self.0 == 0
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// The link half of a node: its position in the doubly-linked op list and
/// its use count. The op payload lives at the same index in the op arena.
///
/// Code blocks chain among themselves through these same links; the ops
/// within a block form a second, disjoint chain.
#[derive(Clone, Copy, Default)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OrderedNode {
    pub next: NodeId,
    pub prev: NodeId,
    pub uses: u32,
}

const _: () = assert!(core::mem::size_of::<OrderedNode>() == 12);
