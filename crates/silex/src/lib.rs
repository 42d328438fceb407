//! silex: a userspace x86/x86-64 dynamic translation engine.
//!
//! Guest instructions are decoded ([`silex_frontend`]), lowered into an SSA
//! IR ([`silex_ir`]), optimized and register allocated, and executed by a
//! host backend ([`silex_jit`]) through a two-level block cache and a
//! dispatch loop. This crate is the runtime that ties those layers into an
//! engine: contexts, guest threads, syscall and signal delegation, thunks,
//! configuration, and the AOT IR cache.
//!
//! ```no_run
//! use silex::Context;
//!
//! let mut ctx = Context::create_new_context();
//! ctx.initialize_context();
//! ctx.init_core(0x40_0000, 0x7fff_0000);
//! let reason = ctx.run_until_exit();
//! println!("guest exited: {reason:?}");
//! ```

pub mod aot;
pub mod config;
pub mod context;
pub mod cpuid;
pub mod signals;
pub mod syscalls;
pub mod thread;
pub mod thunks;

pub use aot::{load_aot_stream, AotEntry, AotError, AotIrWriter};
pub use config::{options, Config};
pub use context::Context;
pub use cpuid::CpuIdEmu;
pub use signals::{GuestAltStack, GuestSigAction, SignalDelegator};
pub use syscalls::{LinuxSyscallHandler, SyscallHandler};
pub use thread::{EngineBackend, InternalThreadState, ThreadServices, ThreadShared};
pub use thunks::{ThunkFn, ThunkRegistry};

pub use silex_types::{CpuState, ExitReason, HostFeatures, SyscallArguments};
