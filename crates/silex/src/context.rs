//! The engine context: the public face of silex.
//!
//! Lifecycle: `Context::create_new_context()` → configure →
//! `initialize_context()` → `init_core(rip, rsp)` → `run_until_exit()`.
//! Syscall and signal delegation, thunks, AOT, and code invalidation all
//! hang off the context.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use silex_ir::pool::IntrusivePooledAllocator;
use silex_ir::ThunkHash;
use silex_types::{
    CpuIdDispatchFn, CpuState, CpuStateFrame, ExitReason, HostFeatures, RemoveCodeEntryFn,
    SyscallArguments, SyscallDispatchFn, ThunkDispatchFn, XcrDispatchFn, IN_SYSCALL_BIT,
};

use crate::aot::{load_aot_stream, AotEntry, AotError, AotIrWriter};
use crate::config::{options, Config};
use crate::cpuid::{cpuid_dispatch, xgetbv_dispatch, CpuIdEmu};
use crate::signals::SignalDelegator;
use crate::syscalls::{LinuxSyscallHandler, SyscallHandler};
use crate::thread::{
    InternalThreadState, ThreadServices, ThreadServicesConfig, ThreadShared,
};
use crate::thunks::{thunk_dispatch, ThunkFn, ThunkRegistry};

/// Stable heap slot for the installed syscall handler; generated code and
/// the interpreter reach it through a raw pointer in `JitPointers`.
struct SyscallHolder {
    handler: Box<dyn SyscallHandler>,
}

unsafe extern "C" fn syscall_trampoline(
    frame: *mut CpuStateFrame,
    args: *const SyscallArguments,
) -> i64 {
    let frame_ref = &mut *frame;
    frame_ref.in_syscall_info |= IN_SYSCALL_BIT;
    let holder = frame_ref.pointers.syscall_handler_obj as *mut SyscallHolder;
    let result = if holder.is_null() {
        -i64::from(libc::ENOSYS)
    } else {
        (*holder).handler.handle_syscall(frame_ref, &*args)
    };
    (*frame).in_syscall_info &= !IN_SYSCALL_BIT;
    result
}

unsafe extern "C" fn remove_code_entry_trampoline(thread: u64, rip: u64) {
    if thread == 0 {
        return;
    }
    let shared = &*(thread as *const ThreadShared);
    shared.control.queue_code_invalidation(rip);
}

pub struct Context {
    pub config: Config,
    pool: Arc<IntrusivePooledAllocator>,
    delegator: Arc<SignalDelegator>,
    features: HostFeatures,
    cpuid: *mut CpuIdEmu,
    thunks: *mut ThunkRegistry,
    syscall_holder: *mut SyscallHolder,
    main_thread: Option<InternalThreadState>,
    aot_writer: Option<Arc<Mutex<AotIrWriter>>>,
    aot_cache: Option<Arc<HashMap<u64, AotEntry>>>,
    initialized: bool,
}

// The raw boxes are owned by the context and freed in Drop; trampolines
// only dereference them while a run is in flight.
unsafe impl Send for Context {}

impl Context {
    /// Allocate a fresh engine context.
    pub fn create_new_context() -> Box<Context> {
        let features = HostFeatures::detect();
        Box::new(Context {
            config: Config::new(),
            pool: IntrusivePooledAllocator::new_mmap(),
            delegator: Arc::new(SignalDelegator::new()),
            features,
            cpuid: Box::into_raw(Box::new(CpuIdEmu::new(features))),
            thunks: Box::into_raw(Box::new(ThunkRegistry::new())),
            syscall_holder: core::ptr::null_mut(),
            main_thread: None,
            aot_writer: None,
            aot_cache: None,
            initialized: false,
        })
    }

    /// Finalize tables after configuration registration.
    pub fn initialize_context(&mut self) {
        silex_frontend::tables();
        if self.syscall_holder.is_null() {
            // Default syscall surface.
            let handler = LinuxSyscallHandler::new(Arc::clone(&self.delegator));
            self.syscall_holder =
                Box::into_raw(Box::new(SyscallHolder { handler: Box::new(handler) }));
        }
        self.initialized = true;
        log::info!("context initialized; host features: {:?}", self.features);
    }

    /// Install a custom syscall handler (replacing the built-in one).
    pub fn set_syscall_handler(&mut self, handler: Box<dyn SyscallHandler>) {
        if !self.syscall_holder.is_null() {
            drop(unsafe { Box::from_raw(self.syscall_holder) });
        }
        self.syscall_holder = Box::into_raw(Box::new(SyscallHolder { handler }));
        // A live thread needs its frame repointed.
        if let Some(thread) = &mut self.main_thread {
            thread.frame.pointers.syscall_handler_obj = self.syscall_holder as u64;
        }
    }

    pub fn signal_delegator(&self) -> Arc<SignalDelegator> {
        Arc::clone(&self.delegator)
    }

    /// Register thunk libraries: `{hash, handler}` pairs.
    pub fn append_thunk_definitions(&mut self, definitions: &[(ThunkHash, ThunkFn)]) {
        unsafe { (*self.thunks).append_thunk_definitions(definitions) };
    }

    /// Provide a previously serialized AOT IR stream for this guest image.
    pub fn load_aot_ir(&mut self, stream: &[u8]) -> Result<usize, AotError> {
        let entries = load_aot_stream(stream)?;
        let count = entries.len();
        self.aot_cache = Some(Arc::new(entries));
        if let Some(thread) = &mut self.main_thread {
            thread
                .services
                .set_aot_cache(Arc::clone(self.aot_cache.as_ref().expect("just set")));
        }
        Ok(count)
    }

    /// Start collecting AOT IR for later serialization.
    pub fn enable_aot_writer(&mut self) -> Arc<Mutex<AotIrWriter>> {
        let writer = self
            .aot_writer
            .get_or_insert_with(|| Arc::new(Mutex::new(AotIrWriter::new())))
            .clone();
        if let Some(thread) = &mut self.main_thread {
            thread.services.set_aot_writer(Arc::clone(&writer));
        }
        writer
    }

    fn services_config(&self) -> ThreadServicesConfig {
        let core = self.config.get_string(options::CORE, "interp");
        ThreadServicesConfig {
            use_jit: core == "jit",
            tso_enabled: self.config.get_bool(options::TSO_ENABLED, true),
            paranoid_tso: self.config.get_bool(options::PARANOID_TSO, false),
            max_inst: if self.config.get_bool(options::MULTIBLOCK, true) {
                self.config.get_or(options::MAX_INST, 5000usize)
            } else {
                1
            },
            smc_checks: self.config.get_bool(options::SMC_CHECKS, true),
        }
    }

    /// Create the main guest thread with an initial RIP and stack pointer.
    pub fn init_core(&mut self, initial_rip: u64, stack_pointer: u64) -> &mut InternalThreadState {
        assert!(self.initialized, "initialize_context must run first");
        let shared = ThreadShared::new();
        let mut services = ThreadServices::new(
            Arc::clone(&self.pool),
            Arc::clone(&self.delegator),
            Arc::clone(&shared),
            self.services_config(),
        );
        if let Some(cache) = &self.aot_cache {
            services.set_aot_cache(Arc::clone(cache));
        }
        if let Some(writer) = &self.aot_writer {
            services.set_aot_writer(Arc::clone(writer));
        }

        let mut frame = CpuStateFrame::new();
        frame.state.rip = initial_rip;
        frame.state.gregs[silex_types::x86::gpr::RSP as usize] = stack_pointer;
        frame.thread = Arc::as_ptr(&shared) as u64;

        // Publish the helper surface for generated code and the interpreter.
        let syscall_fn: SyscallDispatchFn = syscall_trampoline;
        let cpuid_fn: CpuIdDispatchFn = cpuid_dispatch;
        let xcr_fn: XcrDispatchFn = xgetbv_dispatch;
        let thunk_fn: ThunkDispatchFn = thunk_dispatch;
        let remove_fn: RemoveCodeEntryFn = remove_code_entry_trampoline;
        frame.pointers.syscall_handler_obj = self.syscall_holder as u64;
        frame.pointers.syscall_handler_func = syscall_fn as usize as u64;
        frame.pointers.cpuid_obj = self.cpuid as u64;
        frame.pointers.cpuid_function = cpuid_fn as usize as u64;
        frame.pointers.xcr_function = xcr_fn as usize as u64;
        frame.pointers.thunk_handler_obj = self.thunks as u64;
        frame.pointers.thunk_handler_func = thunk_fn as usize as u64;
        frame.pointers.remove_code_entry = remove_fn as usize as u64;

        log::info!(
            "main thread created at rip {initial_rip:#x}, backend {}",
            services.backend_name()
        );

        self.main_thread = Some(InternalThreadState {
            frame,
            cache: silex_jit::LookupCache::new(),
            shared,
            services,
        });
        self.main_thread.as_mut().expect("just created")
    }

    fn main_thread_mut(&mut self) -> &mut InternalThreadState {
        self.main_thread.as_mut().expect("init_core must run first")
    }

    /// Run the main thread to completion on the calling thread.
    pub fn run_until_exit(&mut self) -> ExitReason {
        let thread = self.main_thread.as_mut().expect("init_core must run first");
        let reason = thread.run();
        log::info!(
            "main thread exited: {reason:?} (guest code {})",
            thread.shared.exit_code.load(Ordering::SeqCst)
        );
        reason
    }

    /// Guest exit status from `exit`/`exit_group`.
    pub fn exit_code(&self) -> u32 {
        self.main_thread
            .as_ref()
            .map(|thread| thread.shared.exit_code.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Snapshot the guest CPU state.
    pub fn get_cpu_state(&self) -> CpuState {
        let thread = self.main_thread.as_ref().expect("init_core must run first");
        unsafe { core::ptr::read(&thread.frame.state as *const CpuState) }
    }

    /// Overwrite the guest CPU state.
    pub fn set_cpu_state(&mut self, state: &CpuState) {
        let thread = self.main_thread_mut();
        unsafe {
            core::ptr::copy_nonoverlapping(
                state as *const CpuState,
                &mut thread.frame.state as *mut CpuState,
                1,
            );
        }
    }

    /// AOT-style external compile trigger.
    pub fn compile_rip(&mut self, rip: u64) -> bool {
        let thread = self.main_thread_mut();
        match thread.services.compile(rip) {
            Some(entry) => {
                thread.cache.insert(rip, entry);
                true
            }
            None => false,
        }
    }

    /// Compile with an explicit instruction budget.
    pub fn compile_rip_count(&mut self, rip: u64, max_instructions: usize) -> bool {
        let thread = self.main_thread_mut();
        match thread.services.compile_with_budget(rip, max_instructions) {
            Some(entry) => {
                thread.cache.insert(rip, entry);
                true
            }
            None => false,
        }
    }

    /// Flush translated blocks covering a guest range; the callback sees
    /// each invalidated entry RIP.
    pub fn invalidate_guest_code_range(
        &mut self,
        start: u64,
        length: u64,
        callback: Option<&mut dyn FnMut(u64)>,
    ) {
        let thread = self.main_thread_mut();
        thread.cache.invalidate_range(start, length, callback);
    }

    /// Invoke guest code at `rip` from a native context (thunk callbacks).
    pub fn handle_callback(&mut self, rip: u64) -> Result<(), ExitReason> {
        self.main_thread_mut().run_guest_function(rip)
    }

    /// Shared handle to the main thread's control block, for cooperating
    /// threads that pause, stop, or signal it.
    pub fn main_thread_shared(&self) -> Option<Arc<ThreadShared>> {
        self.main_thread.as_ref().map(|thread| Arc::clone(&thread.shared))
    }

    /// Queue a guest-directed signal on the main thread; it is delivered at
    /// the dispatcher's next loop top.
    pub fn queue_guest_signal(&self, signal: u8) {
        if let Some(thread) = &self.main_thread {
            thread.shared.control.queue_guest_signal(signal);
        }
    }

    /// Ask the main thread to stop cooperatively.
    pub fn request_stop(&self) {
        if let Some(thread) = &self.main_thread {
            thread.shared.control.request_stop();
        }
    }

    /// Ask the main thread to park at its next loop top.
    pub fn request_pause(&self) {
        if let Some(thread) = &self.main_thread {
            thread.shared.control.request_pause();
        }
    }

    /// Release a paused main thread.
    pub fn resume(&self) {
        if let Some(thread) = &self.main_thread {
            thread.shared.control.resume();
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Threads reference the raw helper boxes; drop them first.
        self.main_thread = None;
        unsafe {
            drop(Box::from_raw(self.cpuid));
            drop(Box::from_raw(self.thunks));
            if !self.syscall_holder.is_null() {
                drop(Box::from_raw(self.syscall_holder));
            }
        }
    }
}
