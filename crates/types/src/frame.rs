//! The per-thread frame wrapping `CpuState`, plus the pointer block shared
//! with generated code.

use crate::cpu::CpuState;

/// Result registers of a CPUID leaf.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuIdResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// Guest syscall arguments in register order (number + six arguments).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SyscallArguments {
    pub argument: [u64; 7],
}

/// Signature of the runtime's syscall entry as called from generated code
/// and the interpreter.
pub type SyscallDispatchFn =
    unsafe extern "C" fn(*mut CpuStateFrame, *const SyscallArguments) -> i64;

/// Signature of the CPUID helper: opaque object, function, leaf.
pub type CpuIdDispatchFn = unsafe extern "C" fn(u64, u32, u32) -> CpuIdResult;

/// Signature of the XGETBV helper: opaque object, xcr number.
pub type XcrDispatchFn = unsafe extern "C" fn(u64, u32) -> u64;

/// Signature of the thunk dispatcher: opaque registry, pointer to the
/// 256-bit thunk hash, guest argument pointer.
pub type ThunkDispatchFn = unsafe extern "C" fn(u64, *const u8, u64);

/// Signature of the self-modifying-code eviction helper: opaque thread,
/// guest RIP whose block must be dropped.
pub type RemoveCodeEntryFn = unsafe extern "C" fn(u64, u64);

/// Host helpers with slow-path implementations the backends call out to.
/// Indexes into `JitPointers::fallback_handlers`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum FallbackHandler {
    F80CvtTo32 = 0,
    F80CvtTo64,
    F80CvtFrom32,
    F80CvtFrom64,
    F80Cmp,
    Count,
}

/// Named vector constants materialized once per process and referenced by
/// address from generated code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum NamedVectorConstant {
    Zero = 0,
    AllOnes,
    SignMaskF32,
    SignMaskF64,
    Count,
}

pub const NAMED_VECTOR_CONST_COUNT: usize = NamedVectorConstant::Count as usize;

/// Addresses of runtime helpers and constants, laid out for constant-offset
/// access from generated code. All entries are raw addresses; the typed
/// signatures above document what lives behind them.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct JitPointers {
    // Process specific.
    pub print_value: u64,
    pub remove_code_entry: u64,
    pub cpuid_obj: u64,
    pub cpuid_function: u64,
    pub xcr_function: u64,
    pub syscall_handler_obj: u64,
    pub syscall_handler_func: u64,
    pub thunk_handler_obj: u64,
    pub thunk_handler_func: u64,
    pub exit_function_link: u64,
    pub unsigned_div_helper: u64,
    pub signed_div_helper: u64,
    pub thunk_callback_ret: u64,

    pub fallback_handlers: [u64; FallbackHandler::Count as usize],
    pub named_vector_constants: [u64; NAMED_VECTOR_CONST_COUNT],

    // Dispatcher entry points, filled in once the dispatcher exists.
    pub dispatcher_loop_top: u64,
    pub dispatcher_loop_top_fill_sra: u64,
    pub exit_function_linker: u64,
    pub threadstop_handler: u64,
    pub threadpause_handler: u64,
    pub guest_signal_return: u64,
}

impl Default for JitPointers {
    fn default() -> Self {
        // Zero is an intentionally invalid address for every entry.
        JitPointers {
            print_value: 0,
            remove_code_entry: 0,
            cpuid_obj: 0,
            cpuid_function: 0,
            xcr_function: 0,
            syscall_handler_obj: 0,
            syscall_handler_func: 0,
            thunk_handler_obj: 0,
            thunk_handler_func: 0,
            exit_function_link: 0,
            unsigned_div_helper: 0,
            signed_div_helper: 0,
            thunk_callback_ret: 0,
            fallback_handlers: [0; FallbackHandler::Count as usize],
            named_vector_constants: [0; NAMED_VECTOR_CONST_COUNT],
            dispatcher_loop_top: 0,
            dispatcher_loop_top_fill_sra: 0,
            exit_function_linker: 0,
            threadstop_handler: 0,
            threadpause_handler: 0,
            guest_signal_return: 0,
        }
    }
}

/// Scratch record describing a synchronous fault taken inside generated
/// code, consumed by the signal path when it reconstructs a guest signal.
/// Eight-byte aligned so generated code can write the whole record with one
/// store.
#[repr(C, align(8))]
#[derive(Clone, Copy, Debug, Default)]
pub struct SynchronousFaultData {
    pub fault_to_top_and_generated_exception: u8,
    pub signal: u8,
    pub trap_no: u8,
    pub si_code: u8,
    pub err_code: u16,
    _pad: u16,
}

/// Per-thread frame. The guest state comes first so generated code can use
/// the same base register for both.
///
/// Field offsets are engine ABI: the dispatcher and both machine backends
/// reference them as constants.
#[repr(C)]
pub struct CpuStateFrame {
    pub state: CpuState,

    /// Host stack pointer captured at dispatcher entry. Restoring it is how
    /// a thread long-jumps out of generated code for a clean shutdown.
    pub returning_stack_location: u64,

    /// Bit 15: currently inside a syscall. Bits 14..0: number of statically
    /// allocated registers spilled around that syscall.
    pub in_syscall_info: u64,

    /// Depth of nested host signal frames stacked on this thread.
    pub signal_handler_ref_counter: u32,

    pub synchronous_fault_data: SynchronousFaultData,

    /// Owning internal thread, stored as an opaque address for generated
    /// code's benefit.
    pub thread: u64,

    pub pointers: JitPointers,
}

impl CpuStateFrame {
    pub fn new() -> Box<CpuStateFrame> {
        Box::new(CpuStateFrame {
            state: CpuState::default(),
            returning_stack_location: 0,
            in_syscall_info: 0,
            signal_handler_ref_counter: 0,
            synchronous_fault_data: SynchronousFaultData::default(),
            thread: 0,
            pointers: JitPointers::default(),
        })
    }
}

pub const IN_SYSCALL_BIT: u64 = 1 << 15;

#[cfg(test)]
mod tests {
    use super::*;
    use memoffset::offset_of;

    #[test]
    fn state_is_first() {
        assert_eq!(offset_of!(CpuStateFrame, state), 0);
    }

    #[test]
    fn frame_tail_fields_are_close() {
        // The return-stack slot and syscall word are referenced together by
        // the syscall spill sequence; keep them adjacent.
        assert_eq!(
            offset_of!(CpuStateFrame, in_syscall_info),
            offset_of!(CpuStateFrame, returning_stack_location) + 8
        );
    }

    #[test]
    fn fault_data_is_packed() {
        assert_eq!(core::mem::size_of::<SynchronousFaultData>(), 8);
    }
}
