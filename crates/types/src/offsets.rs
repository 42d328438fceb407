//! Byte offsets of guest state fields, as referenced by IR context ops and
//! baked into generated host code.
//!
//! These go through `memoffset` rather than hand-maintained constants so a
//! layout change cannot silently diverge from the code that addresses it.

use memoffset::offset_of;

use crate::cpu::CpuState;
use crate::frame::{CpuStateFrame, JitPointers};

pub fn greg(reg: u32) -> u32 {
    (offset_of!(CpuState, gregs) + reg as usize * 8) as u32
}

pub fn rip() -> u32 {
    offset_of!(CpuState, rip) as u32
}

pub fn pf_raw() -> u32 {
    offset_of!(CpuState, pf_raw) as u32
}

pub fn af_raw() -> u32 {
    offset_of!(CpuState, af_raw) as u32
}

/// Offset of the raw byte slot for an eflags bit position. The NZCV slot is
/// the 32-bit word at `flag_byte(x86::FLAG_NZCV)`.
pub fn flag_byte(flag: u32) -> u32 {
    (offset_of!(CpuState, flags) + flag as usize) as u32
}

/// Low 128 bits of vector register `idx`.
pub fn xmm(idx: u32) -> u32 {
    (offset_of!(CpuState, xmm) + idx as usize * 32) as u32
}

/// Upper 128 bits of vector register `idx` in the fall-back layout.
pub fn avx_high(idx: u32) -> u32 {
    (offset_of!(CpuState, avx_high) + idx as usize * 16) as u32
}

pub fn mm(idx: u32) -> u32 {
    (offset_of!(CpuState, mm) + idx as usize * 16) as u32
}

pub fn mxcsr() -> u32 {
    offset_of!(CpuState, mxcsr) as u32
}

pub fn fcw() -> u32 {
    offset_of!(CpuState, fcw) as u32
}

pub fn fs_cached() -> u32 {
    offset_of!(CpuState, fs_cached) as u32
}

pub fn gs_cached() -> u32 {
    offset_of!(CpuState, gs_cached) as u32
}

pub fn es_cached() -> u32 {
    offset_of!(CpuState, es_cached) as u32
}

pub fn cs_cached() -> u32 {
    offset_of!(CpuState, cs_cached) as u32
}

pub fn ss_cached() -> u32 {
    offset_of!(CpuState, ss_cached) as u32
}

pub fn ds_cached() -> u32 {
    offset_of!(CpuState, ds_cached) as u32
}

pub fn l1_pointer() -> u32 {
    offset_of!(CpuState, l1_pointer) as u32
}

pub fn deferred_signal_ref_count() -> u32 {
    offset_of!(CpuState, deferred_signal_ref_count) as u32
}

// Frame-relative offsets (the state sits at frame offset 0, so these are
// usable from the same base register).

pub fn frame_returning_stack_location() -> u32 {
    offset_of!(CpuStateFrame, returning_stack_location) as u32
}

pub fn frame_in_syscall_info() -> u32 {
    offset_of!(CpuStateFrame, in_syscall_info) as u32
}

pub fn frame_synchronous_fault_data() -> u32 {
    offset_of!(CpuStateFrame, synchronous_fault_data) as u32
}

pub fn frame_pointers() -> u32 {
    offset_of!(CpuStateFrame, pointers) as u32
}

pub fn jit_pointer(field: JitPointerField) -> u32 {
    let inner = match field {
        JitPointerField::SyscallHandlerObj => offset_of!(JitPointers, syscall_handler_obj),
        JitPointerField::SyscallHandlerFunc => offset_of!(JitPointers, syscall_handler_func),
        JitPointerField::CpuIdObj => offset_of!(JitPointers, cpuid_obj),
        JitPointerField::CpuIdFunction => offset_of!(JitPointers, cpuid_function),
        JitPointerField::XcrFunction => offset_of!(JitPointers, xcr_function),
        JitPointerField::ExitFunctionLink => offset_of!(JitPointers, exit_function_link),
        JitPointerField::RemoveCodeEntry => offset_of!(JitPointers, remove_code_entry),
    };
    frame_pointers() + inner as u32
}

#[derive(Clone, Copy, Debug)]
pub enum JitPointerField {
    SyscallHandlerObj,
    SyscallHandlerFunc,
    CpuIdObj,
    CpuIdFunction,
    XcrFunction,
    ExitFunctionLink,
    RemoveCodeEntry,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gregs_are_contiguous() {
        assert_eq!(greg(1), greg(0) + 8);
        assert_eq!(greg(15), greg(0) + 120);
    }

    #[test]
    fn pf_af_adjacent() {
        assert_eq!(af_raw(), pf_raw() + 4);
    }

    #[test]
    fn frame_offsets_follow_state() {
        assert!(frame_returning_stack_location() >= core::mem::size_of::<CpuState>() as u32);
    }
}
