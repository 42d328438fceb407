//! The dispatch loop: the runtime core every guest thread spins in.
//!
//! Loop top is the only place a thread observes stop/pause requests and
//! deferred signals; compiled code never suspends cooperatively. A block
//! lookup miss calls back into the compiler, and every compiled block
//! returns here, the always-valid slow path that block linking merely
//! short-circuits.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};

use silex_types::{CpuStateFrame, ExitReason, SignalEvent};

use crate::backend::BlockExit;
use crate::block_cache::LookupCache;

/// Per-thread control plumbing shared with the runtime: written from other
/// threads (and signal handlers), read at loop top.
pub struct ThreadControl {
    pub should_stop: AtomicBool,
    pub signal_event: AtomicU32,
    /// Deferred guest signals pending delivery at loop top.
    pub pending_guest_signals: AtomicU32,
    /// Guest RIPs whose blocks must be dropped before the next lookup
    /// (self-modifying code detection runs inside generated code).
    pending_code_invalidations: Mutex<Vec<u64>>,
    pause_lock: Mutex<bool>,
    pause_cv: Condvar,
}

impl ThreadControl {
    pub fn new() -> ThreadControl {
        ThreadControl {
            should_stop: AtomicBool::new(false),
            signal_event: AtomicU32::new(SignalEvent::Nothing as u32),
            pending_guest_signals: AtomicU32::new(0),
            pending_code_invalidations: Mutex::new(Vec::new()),
            pause_lock: Mutex::new(false),
            pause_cv: Condvar::new(),
        }
    }

    pub fn queue_code_invalidation(&self, rip: u64) {
        self.pending_code_invalidations.lock().unwrap().push(rip);
    }

    pub fn take_code_invalidations(&self) -> Vec<u64> {
        core::mem::take(&mut *self.pending_code_invalidations.lock().unwrap())
    }

    pub fn request_stop(&self) {
        self.should_stop.store(true, Ordering::SeqCst);
        self.signal_event
            .store(SignalEvent::Stop as u32, Ordering::SeqCst);
        self.resume();
    }

    pub fn request_pause(&self) {
        self.signal_event
            .store(SignalEvent::Pause as u32, Ordering::SeqCst);
    }

    /// Park the calling thread until `resume` is invoked.
    pub fn wait_paused(&self) {
        let mut paused = self.pause_lock.lock().unwrap();
        *paused = true;
        while *paused {
            paused = self.pause_cv.wait(paused).unwrap();
        }
    }

    pub fn resume(&self) {
        let mut paused = self.pause_lock.lock().unwrap();
        *paused = false;
        self.pause_cv.notify_all();
    }

    pub fn queue_guest_signal(&self, signal: u8) {
        self.pending_guest_signals
            .fetch_or(1 << (signal as u32 % 32), Ordering::SeqCst);
    }

    pub fn take_guest_signals(&self) -> u32 {
        self.pending_guest_signals.swap(0, Ordering::SeqCst)
    }
}

impl Default for ThreadControl {
    fn default() -> Self {
        ThreadControl::new()
    }
}

/// Callbacks the loop needs from the runtime. The hooks own the execution
/// backend: compiling and entering blocks go through the same object.
pub trait DispatcherHooks {
    /// Inspect (and possibly rewrite) guest state before the block lookup.
    /// Sigreturn and callback-return trampolines hook in here.
    fn pre_dispatch(&mut self, _frame: &mut CpuStateFrame) {}

    /// Compile the region at `rip`, returning a backend entry token.
    fn compile_block(&mut self, rip: u64) -> Option<u64>;

    /// Enter a compiled block.
    fn invoke_block(&mut self, entry: u64, frame: &mut CpuStateFrame) -> BlockExit;

    /// Deliver pending guest signals (called at loop top when the pending
    /// mask is nonzero and signals are not deferred).
    fn deliver_guest_signals(&mut self, frame: &mut CpuStateFrame, pending: u32);

    /// A block reported a synchronous guest fault. Return `Some` to unwind
    /// with that exit reason, `None` to continue dispatching (the fault was
    /// converted into a guest signal frame).
    fn handle_fault(&mut self, frame: &mut CpuStateFrame) -> Option<ExitReason>;
}

/// Run guest code until the thread stops. This is `AsmDispatch` plus
/// `LoopTop` in one: the caller's stack frame is the
/// `ReturningStackLocation` every exit unwinds to.
pub fn dispatch_loop(
    frame: &mut CpuStateFrame,
    cache: &mut LookupCache,
    control: &ThreadControl,
    hooks: &mut dyn DispatcherHooks,
) -> ExitReason {
    // Publish the lookup fast-path tables for generated code.
    frame.state.l1_pointer = cache.l1_pointer();
    frame.state.l1_mask = cache.l1_mask();

    loop {
        // Loop top: the only suspension point.
        match SignalEvent::from_u32(control.signal_event.swap(
            SignalEvent::Nothing as u32,
            Ordering::SeqCst,
        )) {
            SignalEvent::Stop => return ExitReason::Shutdown,
            SignalEvent::Pause => {
                control.wait_paused();
                if control.should_stop.load(Ordering::SeqCst) {
                    return ExitReason::Shutdown;
                }
            }
            SignalEvent::Return | SignalEvent::Nothing => {}
        }
        if control.should_stop.load(Ordering::SeqCst) {
            return ExitReason::Shutdown;
        }

        // Deferred guest signal delivery, gated on the critical-section
        // counter.
        if frame.state.deferred_signal_ref_count.load() == 0 {
            let pending = control.take_guest_signals();
            if pending != 0 {
                hooks.deliver_guest_signals(frame, pending);
            }
        }

        // Blocks evicted from inside generated code (failed ValidateCode).
        for rip in control.take_code_invalidations() {
            cache.remove(rip);
        }

        hooks.pre_dispatch(frame);

        let rip = frame.state.rip;
        let entry = match cache.lookup(rip) {
            Some(entry) => entry,
            None => match hooks.compile_block(rip) {
                Some(entry) => {
                    cache.insert(rip, entry);
                    entry
                }
                None => {
                    // Compilation failure is not survivable.
                    log::error!("no block could be compiled for RIP {rip:#x}");
                    control.should_stop.store(true, Ordering::SeqCst);
                    return ExitReason::UnknownError;
                }
            },
        };

        let exit = hooks.invoke_block(entry, frame);
        match exit {
            BlockExit::Continue => {}
            BlockExit::Halt => return ExitReason::Shutdown,
            BlockExit::Fault => {
                if let Some(reason) = hooks.handle_fault(frame) {
                    return reason;
                }
            }
        }
    }
}

/// Record of a cross-region exit site that can be back-patched once its
/// target exists ("exit function linker").
///
/// Every `ExitFunction` site initially routes through the dispatcher, the
/// always-valid path. When the destination is later compiled into the same
/// code buffer, the site's branch word can be rewritten to jump directly;
/// the write is a single aligned store followed by an icache flush, so a
/// racing thread executes either the old dispatcher path or the new direct
/// branch, both correct.
#[derive(Default)]
pub struct ExitFunctionLinker {
    /// guest RIP -> patchable site addresses waiting on it.
    pending: std::collections::HashMap<u64, Vec<u64>>,
}

impl ExitFunctionLinker {
    pub fn new() -> ExitFunctionLinker {
        ExitFunctionLinker::default()
    }

    pub fn record_site(&mut self, target_rip: u64, site_address: u64) {
        self.pending.entry(target_rip).or_default().push(site_address);
    }

    /// Sites waiting for `target_rip`, drained for patching.
    pub fn take_sites(&mut self, target_rip: u64) -> Vec<u64> {
        self.pending.remove(&target_rip).unwrap_or_default()
    }

    /// Forget all sites inside an invalidated code range.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::interp::InterpreterBackend;
    use silex_ir::pool::IntrusivePooledAllocator;
    use silex_ir::{IrEmitter, OpSize, RegClass};

    /// Hooks owning an interpreter backend; every miss compiles a fixed
    /// mov-then-halt block.
    struct TestHooks {
        pool: std::sync::Arc<IntrusivePooledAllocator>,
        backend: InterpreterBackend,
        compiles: usize,
    }

    impl DispatcherHooks for TestHooks {
        fn compile_block(&mut self, rip: u64) -> Option<u64> {
            self.compiles += 1;
            let mut emitter = IrEmitter::new(std::sync::Arc::clone(&self.pool));
            let block = emitter.create_code_node();
            emitter.start_block(block);
            let value = emitter.constant(OpSize::I64, 42);
            emitter.store_register(OpSize::I64, RegClass::Gpr, 0, value);
            emitter.break_op(silex_ir::BreakDefinition {
                signal: 0,
                trap_number: silex_types::x86::traps::TRAP_HLT,
                si_code: 0,
                error_register: 0,
            });
            emitter.finish_block(block);
            use crate::backend::CpuBackend;
            self.backend.compile(rip, emitter.data(), None).ok()
        }

        fn invoke_block(&mut self, entry: u64, frame: &mut CpuStateFrame) -> BlockExit {
            use crate::backend::CpuBackend;
            unsafe { self.backend.invoke(entry, frame) }
        }

        fn deliver_guest_signals(&mut self, _frame: &mut CpuStateFrame, _pending: u32) {}

        fn handle_fault(&mut self, _frame: &mut CpuStateFrame) -> Option<ExitReason> {
            Some(ExitReason::UnknownError)
        }
    }

    #[test]
    fn loop_compiles_on_miss_and_halts() {
        let mut hooks = TestHooks {
            pool: IntrusivePooledAllocator::new_heap(),
            backend: InterpreterBackend::new(),
            compiles: 0,
        };
        let mut frame = CpuStateFrame::new();
        frame.state.rip = 0x1000;
        let mut cache = LookupCache::new();
        let control = ThreadControl::new();

        let reason = dispatch_loop(&mut frame, &mut cache, &control, &mut hooks);
        assert_eq!(reason, ExitReason::Shutdown);
        assert_eq!(frame.state.gregs[0], 42);
        assert_eq!(hooks.compiles, 1);
        // Entry is now cached.
        assert!(cache.lookup(0x1000).is_some());
    }

    #[test]
    fn stop_request_wins_over_execution() {
        struct NoHooks;
        impl DispatcherHooks for NoHooks {
            fn compile_block(&mut self, _rip: u64) -> Option<u64> {
                panic!("must not compile after stop");
            }
            fn invoke_block(&mut self, _entry: u64, _frame: &mut CpuStateFrame) -> BlockExit {
                panic!("must not execute after stop");
            }
            fn deliver_guest_signals(&mut self, _frame: &mut CpuStateFrame, _pending: u32) {}
            fn handle_fault(&mut self, _frame: &mut CpuStateFrame) -> Option<ExitReason> {
                None
            }
        }
        let mut frame = CpuStateFrame::new();
        let mut cache = LookupCache::new();
        let control = ThreadControl::new();
        control.request_stop();
        let reason = dispatch_loop(&mut frame, &mut cache, &control, &mut NoHooks);
        assert_eq!(reason, ExitReason::Shutdown);
    }

    #[test]
    fn linker_tracks_sites_per_target() {
        let mut linker = ExitFunctionLinker::new();
        linker.record_site(0x1000, 0xa000);
        linker.record_site(0x1000, 0xb000);
        linker.record_site(0x2000, 0xc000);
        assert_eq!(linker.take_sites(0x1000), vec![0xa000, 0xb000]);
        assert!(linker.take_sites(0x1000).is_empty());
        assert_eq!(linker.take_sites(0x2000), vec![0xc000]);
    }
}
