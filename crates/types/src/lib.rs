//! Shared type definitions for the silex translation engine.
//!
//! This crate defines the guest-visible machine state (`CpuState`), the
//! per-thread frame wrapping it (`CpuStateFrame`), and the handful of enums
//! shared between the frontend, the IR, the host backends, and the runtime.
//!
//! Everything in here is deliberately `repr(C)` with a frozen layout: offsets
//! of these fields are baked into generated host code, so the layout is part
//! of the engine's internal ABI. The layout tests at the bottom of each
//! module are not optional hygiene, they are the contract.

mod cpu;
mod exit;
mod features;
mod frame;

pub mod offsets;
pub mod x86;

pub use cpu::{CpuState, GdtSegment, NonAtomicRefCounter, XmmRegs};
pub use exit::{ExitReason, SignalEvent};
pub use features::HostFeatures;
pub use frame::{
    CpuIdDispatchFn, CpuIdResult, CpuStateFrame, FallbackHandler, JitPointers,
    NamedVectorConstant, RemoveCodeEntryFn, SyscallArguments, SyscallDispatchFn,
    SynchronousFaultData, ThunkDispatchFn, XcrDispatchFn, IN_SYSCALL_BIT,
    NAMED_VECTOR_CONST_COUNT,
};

/// Number of architectural general purpose registers.
pub const NUM_GPRS: usize = 16;

/// Synthetic register index holding the raw parity-flag byte.
///
/// PF and AF are statically mapped as-if they were r16/r17 (which do not
/// exist in x86 otherwise) so that the register allocator and the static
/// register bindings can treat them uniformly with real GPRs.
pub const PF_AS_GREG: u32 = 16;

/// Synthetic register index holding the raw auxiliary-carry value.
pub const AF_AS_GREG: u32 = 17;

/// Number of vector registers in the guest register file.
pub const NUM_XMMS: usize = 16;

/// Number of 64-bit MMX/x87 registers.
pub const NUM_MMS: usize = 8;
