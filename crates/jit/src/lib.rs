//! Host-side execution machinery for silex: the two-level block cache,
//! executable code buffers, the CPU backends (reference interpreter,
//! AArch64, x86-64), and the dispatch loop that ties them together.

pub mod backend;
pub mod block_cache;
pub mod code_buffer;
pub mod dispatcher;

pub use backend::interp::InterpreterBackend;
pub use backend::{default_backend_name, BackendError, BlockExit, CpuBackend};
pub use block_cache::{BlockCacheEntry, LookupCache, L1_ENTRIES, L1_ENTRIES_MASK};
pub use code_buffer::{CodeBuffer, CodeBufferError};
pub use dispatcher::{dispatch_loop, DispatcherHooks, ExitFunctionLinker, ThreadControl};
