//! The silex intermediate representation.
//!
//! Guest instructions are lowered into a small SSA IR stored in two parallel
//! arenas (node links and op payloads) indexed by 32-bit `NodeId`s. The IR
//! for one translated region is a chain of `CodeBlock`s, each bracketing a
//! doubly-linked list of ops between `BeginBlock` and `EndBlock`.
//!
//! This crate owns the whole IR lifecycle:
//!
//! - the pooled buffer allocator the arenas draw from ([`pool`]),
//! - the storage itself and owned snapshots ([`data`]),
//! - the builder ([`emitter::IrEmitter`]),
//! - the pass pipeline, register allocator, and validators ([`passes`]),
//! - the canonical text form ([`print`], [`parse`]).

mod data;
mod emitter;
mod node;
mod ops;
pub mod parse;
pub mod passes;
pub mod pool;
pub mod print;
mod regdata;

pub use data::{block_ops, blocks, DualListData, IrStore, IrStoreMut, OwnedIr};
pub use emitter::IrEmitter;
pub use node::{NodeId, OrderedNode};
pub use ops::{BreakDefinition, CondCode, Op, OpPayload, OpSize, RegClass, ThunkHash};
pub use regdata::{PhysicalRegister, RegisterAllocationData, SPILL_SLOT_SIZE};
