//! Host execution backends.
//!
//! Every backend materializes a compiled region behind a `u64` entry token
//! the block cache can store, and knows how to enter one with a frame. The
//! reference backend interprets the IR directly; the machine backends lower
//! it to host code in a per-thread executable buffer.

pub mod aarch64;
pub mod interp;
pub mod x64;

use silex_ir::{IrStore, RegisterAllocationData};
use silex_types::CpuStateFrame;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("op {op} has no lowering in this backend")]
    UnsupportedOp { op: &'static str },
    #[error("code buffer error: {0}")]
    CodeBuffer(#[from] crate::code_buffer::CodeBufferError),
    #[error("register allocation data missing")]
    MissingRaData,
}

/// How a block handed control back to the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockExit {
    /// Next RIP is in guest state; keep dispatching.
    Continue,
    /// Clean shutdown request (hlt, exit syscalls).
    Halt,
    /// Synchronous guest fault; details are in the frame's fault record.
    Fault,
}

/// A per-thread execution backend.
pub trait CpuBackend: Send {
    fn name(&self) -> &'static str;

    /// Whether compiled IR must be register allocated first.
    fn needs_register_allocation(&self) -> bool;

    /// Materialize a region. `entry_rip` is the guest address of the first
    /// block. Returns the entry token to store in the block cache.
    fn compile(
        &mut self,
        entry_rip: u64,
        ir: &dyn IrStore,
        ra: Option<&RegisterAllocationData>,
    ) -> Result<u64, BackendError>;

    /// Enter a compiled region.
    ///
    /// # Safety
    ///
    /// `entry` must be a token this backend returned from `compile` and the
    /// frame must be the owning thread's.
    unsafe fn invoke(&mut self, entry: u64, frame: *mut CpuStateFrame) -> BlockExit;

    /// Drop all compiled code (cache flush, self-modifying code storms).
    fn clear(&mut self);
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "aarch64")] {
        /// Name of the machine backend matching the host ISA.
        pub fn default_backend_name() -> &'static str {
            "aarch64"
        }
    } else if #[cfg(target_arch = "x86_64")] {
        /// Name of the machine backend matching the host ISA.
        pub fn default_backend_name() -> &'static str {
            "x64"
        }
    } else {
        /// No machine backend for this host; only the interpreter runs.
        pub fn default_backend_name() -> &'static str {
            "interpreter"
        }
    }
}
