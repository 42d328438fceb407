//! Per-guest-thread runtime state and the compile service.
//!
//! Each guest thread owns its frame, block caches, IR emitter, and backend.
//! The small `ThreadShared` block is the only part other threads (and
//! C-callable trampolines) touch; it lives behind a stable `Arc` whose
//! address rides in `CpuStateFrame::thread`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use silex_frontend::dispatcher::ValidateEntry;
use silex_frontend::{translate_region, Decoder, RawMemoryStream, TranslationConfig};
use silex_ir::passes::PassManager;
use silex_ir::pool::IntrusivePooledAllocator;
use silex_ir::{IrEmitter, IrStore, OwnedIr, RegisterAllocationData};
use silex_jit::backend::interp::InterpreterBackend;
use silex_jit::backend::{BackendError, BlockExit, CpuBackend};
use silex_jit::{dispatch_loop, DispatcherHooks, LookupCache, ThreadControl};
use silex_types::{CpuState, CpuStateFrame, ExitReason};

use crate::aot::{hash_guest_code, AotEntry, AotIrWriter};
use crate::signals::{
    setup_guest_frame, GuestAltStack, SignalDelegator, GUEST_CALLBACK_RETURN_RIP,
    GUEST_SIGRETURN_RIP,
};

/// Thread state visible to other threads and to C-callable trampolines.
pub struct ThreadShared {
    pub control: ThreadControl,
    pub exit_code: AtomicU32,
    pub altstack: Mutex<GuestAltStack>,
}

impl ThreadShared {
    pub fn new() -> Arc<ThreadShared> {
        Arc::new(ThreadShared {
            control: ThreadControl::new(),
            exit_code: AtomicU32::new(0),
            altstack: Mutex::new(GuestAltStack::default()),
        })
    }

    /// Recover the shared block from a frame's opaque thread field.
    ///
    /// # Safety
    ///
    /// The frame must belong to a live thread whose `Arc<ThreadShared>` is
    /// still held.
    pub unsafe fn from_frame(frame: &CpuStateFrame) -> Option<&ThreadShared> {
        let raw = frame.thread as *const ThreadShared;
        if raw.is_null() {
            None
        } else {
            Some(&*raw)
        }
    }
}

/// Engine execution backend: the reference interpreter, or the host machine
/// backend with per-region interpreter fallback for ops it cannot lower.
pub enum EngineBackend {
    Interpreter(InterpreterBackend),
    Jit {
        machine: Box<dyn CpuBackend>,
        interp: InterpreterBackend,
        interp_tokens: HashSet<u64>,
    },
}

impl EngineBackend {
    pub fn interpreter() -> EngineBackend {
        EngineBackend::Interpreter(InterpreterBackend::new())
    }

    /// The host machine backend, when one exists for this architecture.
    pub fn jit() -> Option<EngineBackend> {
        host_backend::jit_backend()
    }

    fn needs_register_allocation(&self) -> bool {
        matches!(self, EngineBackend::Jit { .. })
    }

    fn compile(
        &mut self,
        rip: u64,
        ir: &dyn IrStore,
        ra: Option<&RegisterAllocationData>,
    ) -> Result<u64, BackendError> {
        match self {
            EngineBackend::Interpreter(backend) => backend.compile(rip, ir, None),
            EngineBackend::Jit { machine, interp, interp_tokens } => {
                match machine.compile(rip, ir, ra) {
                    Ok(entry) => Ok(entry),
                    Err(BackendError::UnsupportedOp { op }) => {
                        log::debug!(
                            "region at {rip:#x} uses {op}; falling back to the interpreter"
                        );
                        let entry = interp.compile(rip, ir, None)?;
                        interp_tokens.insert(entry);
                        Ok(entry)
                    }
                    Err(error) => Err(error),
                }
            }
        }
    }

    fn invoke(&mut self, entry: u64, frame: &mut CpuStateFrame) -> BlockExit {
        unsafe {
            match self {
                EngineBackend::Interpreter(backend) => backend.invoke(entry, frame),
                EngineBackend::Jit { machine, interp, interp_tokens } => {
                    if interp_tokens.contains(&entry) {
                        interp.invoke(entry, frame)
                    } else {
                        machine.invoke(entry, frame)
                    }
                }
            }
        }
    }
}

/// Host-specific machine backend construction, isolated for cfg hygiene.
mod host_backend {
    use super::*;

    cfg_if::cfg_if! {
        if #[cfg(target_arch = "aarch64")] {
            pub fn jit_backend() -> Option<EngineBackend> {
                let machine = silex_jit::backend::aarch64::Aarch64Backend::new().ok()?;
                Some(EngineBackend::Jit {
                    machine: Box::new(machine),
                    interp: InterpreterBackend::new(),
                    interp_tokens: HashSet::new(),
                })
            }

            pub fn jit_ra_config() -> silex_ir::passes::RegAllocConfig {
                silex_jit::backend::aarch64::ra_config()
            }
        } else if #[cfg(target_arch = "x86_64")] {
            pub fn jit_backend() -> Option<EngineBackend> {
                let machine = silex_jit::backend::x64::X64Backend::new().ok()?;
                Some(EngineBackend::Jit {
                    machine: Box::new(machine),
                    interp: InterpreterBackend::new(),
                    interp_tokens: HashSet::new(),
                })
            }

            pub fn jit_ra_config() -> silex_ir::passes::RegAllocConfig {
                silex_jit::backend::x64::ra_config()
            }
        } else {
            pub fn jit_backend() -> Option<EngineBackend> {
                None
            }

            pub fn jit_ra_config() -> silex_ir::passes::RegAllocConfig {
                silex_ir::passes::RegAllocConfig::default()
            }
        }
    }
}

/// Compile-side services plus the hook state the dispatcher calls into.
pub struct ThreadServices {
    emitter: IrEmitter,
    passes: PassManager,
    backend: EngineBackend,
    translation: TranslationConfig,
    max_inst: usize,
    smc_checks: bool,
    delegator: Arc<SignalDelegator>,
    shared: Arc<ThreadShared>,
    /// Stacked guest states for reentrant signal frames.
    saved_states: Vec<Box<CpuState>>,
    /// Saved states for native-to-guest callback nesting.
    callback_states: Vec<Box<CpuState>>,
    aot_cache: Option<Arc<std::collections::HashMap<u64, AotEntry>>>,
    aot_writer: Option<Arc<Mutex<AotIrWriter>>>,
}

pub struct ThreadServicesConfig {
    pub use_jit: bool,
    pub tso_enabled: bool,
    pub paranoid_tso: bool,
    pub max_inst: usize,
    pub smc_checks: bool,
}

impl ThreadServices {
    pub fn new(
        pool: Arc<IntrusivePooledAllocator>,
        delegator: Arc<SignalDelegator>,
        shared: Arc<ThreadShared>,
        config: ThreadServicesConfig,
    ) -> ThreadServices {
        let backend = if config.use_jit {
            EngineBackend::jit().unwrap_or_else(|| {
                log::warn!("no machine backend for this host; using the interpreter");
                EngineBackend::interpreter()
            })
        } else {
            EngineBackend::interpreter()
        };

        let mut passes = PassManager::with_default_passes();
        if backend.needs_register_allocation() {
            passes.insert_register_allocation_pass(host_backend::jit_ra_config());
        }

        ThreadServices {
            emitter: IrEmitter::new(pool),
            passes,
            backend,
            translation: TranslationConfig {
                tso_enabled: config.tso_enabled,
                paranoid_tso: config.paranoid_tso,
                validate_entry: None,
            },
            max_inst: config.max_inst,
            smc_checks: config.smc_checks,
            delegator,
            shared,
            saved_states: Vec::new(),
            callback_states: Vec::new(),
            aot_cache: None,
            aot_writer: None,
        }
    }

    pub fn set_aot_cache(&mut self, cache: Arc<std::collections::HashMap<u64, AotEntry>>) {
        self.aot_cache = Some(cache);
    }

    pub fn set_aot_writer(&mut self, writer: Arc<Mutex<AotIrWriter>>) {
        self.aot_writer = Some(writer);
    }

    pub fn backend_name(&self) -> &'static str {
        match &self.backend {
            EngineBackend::Interpreter(_) => "interpreter",
            EngineBackend::Jit { machine, .. } => machine.name(),
        }
    }

    /// Capture the entry bytes for the self-modifying-code guard.
    fn capture_validate_entry(&self, rip: u64, region_bytes: u64) -> Option<ValidateEntry> {
        if !self.smc_checks || region_bytes == 0 {
            return None;
        }
        let length = region_bytes.min(16) as u8;
        let mut original = [0u8; 16];
        unsafe {
            core::ptr::copy_nonoverlapping(
                rip as *const u8,
                original.as_mut_ptr(),
                usize::from(length),
            );
        }
        Some(ValidateEntry { original, length })
    }

    /// The full translation pipeline for one region.
    pub fn compile(&mut self, rip: u64) -> Option<u64> {
        self.compile_with_budget(rip, self.max_inst)
    }

    /// Translate with an explicit instruction budget (external AOT-style
    /// triggers).
    pub fn compile_with_budget(&mut self, rip: u64, max_inst: usize) -> Option<u64> {
        // AOT hit: reuse the stored IR when the guest bytes still match.
        if let Some(cache) = self.aot_cache.clone() {
            if let Some(entry) = cache.get(&rip) {
                if hash_guest_code(rip, entry.guest_length) == entry.code_hash {
                    log::trace!("AOT hit for {rip:#x}");
                    return self
                        .backend
                        .compile(rip, &entry.ir, entry.ra.as_ref())
                        .map_err(|error| log::error!("AOT compile failed: {error}"))
                        .ok();
                }
            }
        }

        self.emitter.reown_or_claim_buffer();
        self.emitter.reset_working_list();

        let stream = RawMemoryStream;
        let decoder = Decoder::new(&stream);
        let region = decoder.decode_region(rip, max_inst);

        // Region byte span, for SMC capture and AOT hashing.
        let region_bytes = region
            .blocks
            .iter()
            .flat_map(|block| block.instructions.iter())
            .map(|inst| inst.next_rip())
            .max()
            .map(|end| end.saturating_sub(rip))
            .unwrap_or(0);

        let mut translation = self.translation;
        translation.validate_entry = self.capture_validate_entry(rip, region_bytes);
        if let Err(error) = translate_region(&mut self.emitter, &region, translation) {
            log::error!("translation failed at {rip:#x}: {error}");
            self.emitter.delayed_disown_buffer();
            return None;
        }

        if let Err(error) = self.passes.run(&mut self.emitter) {
            debug_assert!(false, "pass pipeline failed: {error}");
            log::error!("pass pipeline failed at {rip:#x}: {error}");
            self.emitter.delayed_disown_buffer();
            return None;
        }

        let ra = self.passes.ra_data();
        let entry = match self.backend.compile(rip, self.emitter.data(), ra) {
            Ok(entry) => entry,
            Err(error) => {
                log::error!("backend compile failed at {rip:#x}: {error}");
                self.emitter.delayed_disown_buffer();
                return None;
            }
        };

        if let Some(writer) = &self.aot_writer {
            writer.lock().unwrap().append(AotEntry {
                guest_rip: rip,
                guest_length: region_bytes,
                code_hash: hash_guest_code(rip, region_bytes),
                ir: OwnedIr::snapshot(self.emitter.data()),
                ra: self.passes.ra_data().cloned(),
            });
        }

        self.emitter.delayed_disown_buffer();
        Some(entry)
    }

    fn deliver_one_signal(&mut self, frame: &mut CpuStateFrame, signal: usize) {
        let action = self.delegator.guest_action(signal);
        let altstack = *self.shared.altstack.lock().unwrap();
        if action.handler == 0 {
            // Default disposition for everything we deliver is termination.
            log::debug!("guest signal {signal} with default disposition; stopping");
            self.shared.control.request_stop();
            return;
        }
        // StoreThreadState: stack the complete guest state for sigreturn.
        self.saved_states.push(Box::new(frame.state.clone_state()));
        if !setup_guest_frame(&mut frame.state, signal, &action, &altstack) {
            self.saved_states.pop();
        }
    }
}

/// `CpuState` is plain data but deliberately not `Clone` in the public API;
/// the runtime owns the only copies.
trait CloneState {
    fn clone_state(&self) -> CpuState;
}

impl CloneState for CpuState {
    fn clone_state(&self) -> CpuState {
        unsafe { core::ptr::read(self as *const CpuState) }
    }
}

impl DispatcherHooks for ThreadServices {
    fn pre_dispatch(&mut self, frame: &mut CpuStateFrame) {
        if frame.state.rip == GUEST_SIGRETURN_RIP {
            // RestoreThreadState: unwind the most recent signal frame.
            match self.saved_states.pop() {
                Some(saved) => frame.state = *saved,
                None => {
                    log::error!("sigreturn with no saved state");
                    self.shared.control.request_stop();
                }
            }
        }
    }

    fn compile_block(&mut self, rip: u64) -> Option<u64> {
        ThreadServices::compile(self, rip)
    }

    fn invoke_block(&mut self, entry: u64, frame: &mut CpuStateFrame) -> BlockExit {
        self.backend.invoke(entry, frame)
    }

    fn deliver_guest_signals(&mut self, frame: &mut CpuStateFrame, pending: u32) {
        for signal in 1..32usize {
            if pending & (1 << signal) != 0 {
                self.deliver_one_signal(frame, signal);
            }
        }
    }

    fn handle_fault(&mut self, frame: &mut CpuStateFrame) -> Option<ExitReason> {
        let fault = frame.synchronous_fault_data;
        frame.synchronous_fault_data = Default::default();
        let signal = usize::from(fault.signal);
        let action = self.delegator.guest_action(signal);
        if action.handler != 0 {
            log::debug!(
                "synchronous fault signal {signal} trap {} -> guest handler",
                fault.trap_no
            );
            self.deliver_one_signal(frame, signal);
            return None;
        }
        log::warn!(
            "unhandled guest fault: signal {signal} trap {} at {:#x}",
            fault.trap_no,
            frame.state.rip
        );
        Some(ExitReason::Shutdown)
    }
}

/// One guest thread: frame, lookup cache, and services.
pub struct InternalThreadState {
    pub frame: Box<CpuStateFrame>,
    pub cache: LookupCache,
    pub shared: Arc<ThreadShared>,
    pub services: ThreadServices,
}

impl InternalThreadState {
    /// Run the dispatch loop until the thread exits.
    pub fn run(&mut self) -> ExitReason {
        let InternalThreadState { frame, cache, shared, services } = self;
        dispatch_loop(&mut **frame, cache, &shared.control, services)
    }

    /// Invoke guest code at `rip` from a native context and return once it
    /// does ("HandleCallback"): a synthetic return address is pushed, and
    /// reaching it restores the pre-call state.
    pub fn run_guest_function(&mut self, rip: u64) -> Result<(), ExitReason> {
        let saved = Box::new(self.frame.state.clone_state());
        self.services.callback_states.push(saved);

        // Push the callback-return trampoline onto the guest stack.
        let mut rsp = self.frame.state.gregs[silex_types::x86::gpr::RSP as usize];
        rsp &= !0xf;
        rsp -= 8;
        unsafe {
            core::ptr::write(rsp as *mut u64, GUEST_CALLBACK_RETURN_RIP);
        }
        self.frame.state.gregs[silex_types::x86::gpr::RSP as usize] = rsp;
        self.frame.state.rip = rip;

        // A nested mini-dispatch that unwinds at the trampoline.
        loop {
            if self.shared.control.should_stop.load(Ordering::SeqCst) {
                self.services.callback_states.pop();
                return Err(ExitReason::Shutdown);
            }
            if self.frame.state.rip == GUEST_CALLBACK_RETURN_RIP {
                let saved = self
                    .services
                    .callback_states
                    .pop()
                    .expect("callback state underflow");
                self.frame.state = *saved;
                return Ok(());
            }
            for evicted in self.shared.control.take_code_invalidations() {
                self.cache.remove(evicted);
            }
            let rip = self.frame.state.rip;
            let entry = match self.cache.lookup(rip) {
                Some(entry) => entry,
                None => match self.services.compile(rip) {
                    Some(entry) => {
                        self.cache.insert(rip, entry);
                        entry
                    }
                    None => {
                        self.services.callback_states.pop();
                        return Err(ExitReason::UnknownError);
                    }
                },
            };
            match self.services.backend.invoke(entry, &mut *self.frame) {
                BlockExit::Continue => {}
                BlockExit::Halt => {
                    self.services.callback_states.pop();
                    return Err(ExitReason::Shutdown);
                }
                BlockExit::Fault => {
                    if let Some(reason) = self.services.handle_fault(&mut *self.frame) {
                        self.services.callback_states.pop();
                        return Err(reason);
                    }
                }
            }
        }
    }
}
