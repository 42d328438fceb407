//! The guest CPU register file and its frozen in-memory layout.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::x86;

/// Wrapper around an atomic using relaxed loads and stores for increments.
///
/// This intentionally avoids `fetch_add`: on AArch64 that lowers to
/// ldxr/stxr (or ldadd), and on x86-64 to `lock xadd`. The deferred signal
/// counter is only ever touched by its owning thread, and the one concurrent
/// reader (the signal handler) runs *on* that thread, so plain load/store
/// pairs preserve program order where it matters. Increments may visibly
/// tear if a signal lands half-way through, which the signal handler
/// tolerates by re-queueing.
#[repr(transparent)]
#[derive(Default)]
pub struct NonAtomicRefCounter {
    value: AtomicU64,
}

impl NonAtomicRefCounter {
    pub fn increment(&self, amount: u64) {
        let current = self.value.load(Ordering::Relaxed);
        self.value.store(current.wrapping_add(amount), Ordering::Relaxed);
    }

    /// Returns the value prior to the decrement.
    pub fn decrement(&self, amount: u64) -> u64 {
        let current = self.value.load(Ordering::Relaxed);
        self.value.store(current.wrapping_sub(amount), Ordering::Relaxed);
        current
    }

    pub fn load(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn store(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }
}

/// The 256-bit vector register file.
///
/// Hosts with only 128-bit SIMD keep the low lanes in `xmm` and the upper
/// halves in `CpuState::avx_high`; the two views never overlap.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct XmmRegs {
    pub avx: [[u64; 4]; crate::NUM_XMMS],
}

impl Default for XmmRegs {
    fn default() -> Self {
        XmmRegs { avx: [[0; 4]; crate::NUM_XMMS] }
    }
}

impl XmmRegs {
    /// Low 128 bits of register `idx`.
    pub fn sse(&self, idx: usize) -> [u64; 2] {
        [self.avx[idx][0], self.avx[idx][1]]
    }

    pub fn set_sse(&mut self, idx: usize, value: [u64; 2]) {
        self.avx[idx][0] = value[0];
        self.avx[idx][1] = value[1];
    }
}

/// One GDT/LDT descriptor. Eight bytes, matching the hardware format.
///
/// The bitfield split (base spread over three fields, limit over two) is the
/// architectural encoding; accessors below reassemble the values.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct GdtSegment {
    pub limit0: u16,
    pub base0: u16,
    /// base1:8 | type:4 | s:1 | dpl:2 | p:1
    pub raw1: u16,
    /// limit1:4 | avl:1 | l:1 | d:1 | g:1 | base2:8
    pub raw2: u16,
}

impl GdtSegment {
    pub fn base(&self) -> u32 {
        u32::from(self.base0)
            | (u32::from(self.raw1 & 0xff) << 16)
            | (u32::from(self.raw2 >> 8) << 24)
    }

    pub fn set_base(&mut self, base: u32) {
        self.base0 = base as u16;
        self.raw1 = (self.raw1 & !0xff) | ((base >> 16) & 0xff) as u16;
        self.raw2 = (self.raw2 & 0xff) | (((base >> 24) & 0xff) as u16) << 8;
    }

    pub fn limit(&self) -> u32 {
        u32::from(self.limit0) | (u32::from(self.raw2 & 0xf) << 16)
    }

    pub fn set_limit(&mut self, limit: u32) {
        self.limit0 = limit as u16;
        self.raw2 = (self.raw2 & !0xf) | ((limit >> 16) & 0xf) as u16;
    }
}

/// The complete guest register file.
///
/// Layout rules, load-bearing for generated code:
///
/// - Hot fields live in the first cacheline: the deferred-signal counter,
///   the raw PF/AF values, and RIP.
/// - `pf_raw`/`af_raw` are adjacent 32-bit fields in the first 256 bytes so
///   a single paired load/store can spill and fill them together.
/// - `l1_pointer`/`l1_mask` are adjacent and below offset 504 so the block
///   lookup fast path can fetch both with one paired load.
/// - `gregs[15]` must stay at or below offset 504 for the same reason.
#[repr(C, align(64))]
pub struct CpuState {
    /// Reserved slot read by JIT block prologues.
    pub inline_jit_block_header: u64,
    /// Nesting depth of sections that must not observe signal delivery.
    pub deferred_signal_ref_count: NonAtomicRefCounter,

    /// Raw parity input: the low byte of the last flag-setting result.
    /// Initialized to 1 so the reconstructed PF is 0, matching reset state
    /// (PF = popcount(pf_raw ^ 1) & 1).
    pub pf_raw: u32,
    /// Raw auxiliary-carry input: `src1 ^ src2` of the last arithmetic op.
    pub af_raw: u32,

    /// May lag the true value while a JIT block is executing.
    pub rip: u64,

    pub gregs: [u64; crate::NUM_GPRS],

    /// Base pointer of the thread's L1 block-lookup table.
    pub l1_pointer: u64,
    /// Mask applied to RIP when indexing the L1 table. Paired with
    /// `l1_pointer`.
    pub l1_mask: u64,
    /// Stack used by the call-return optimization in generated code.
    pub callret_sp: u64,
    _pad1: u64,

    /// Upper 128 bits of each vector register when the host runs the
    /// 128-bit fall-back layout.
    pub avx_high: [[u64; 2]; crate::NUM_XMMS],

    pub xmm: XmmRegs,

    pub es_idx: u16,
    pub cs_idx: u16,
    pub ss_idx: u16,
    pub ds_idx: u16,
    pub gs_idx: u16,
    pub fs_idx: u16,
    pub mxcsr: u32,

    pub es_cached: u32,
    pub cs_cached: u32,
    pub ss_cached: u32,
    pub ds_cached: u32,
    pub gs_cached: u64,
    pub fs_cached: u64,

    /// One byte per architectural eflags bit. SF/ZF/CF/OF live in NZCV form
    /// in the four bytes at `x86::FLAG_NZCV`; PF/AF live in the raw fields
    /// above; the rest use their architectural bit position as the index.
    pub flags: [u8; 48],

    pub mm: [[u64; 2]; crate::NUM_MMS],

    /// Descriptor table base addresses, indexed by the selector TI bit:
    /// 0 = GDT, 1 = LDT. Stored as raw addresses since generated code
    /// consumes them untyped. Tables are process-global.
    pub segment_arrays: [u64; 2],

    pub fcw: u16,
    pub abridged_ftw: u8,
    _pad2: [u8; 5],

    /// Process-private GDT backing store; the kernel-visible subset.
    pub private_gdt: [GdtSegment; 32],
}

impl Default for CpuState {
    fn default() -> Self {
        let mut state = CpuState {
            inline_jit_block_header: 0,
            deferred_signal_ref_count: NonAtomicRefCounter::default(),
            pf_raw: 1,
            af_raw: 0,
            rip: 0,
            gregs: [0; crate::NUM_GPRS],
            l1_pointer: 0,
            l1_mask: 0,
            callret_sp: 0,
            _pad1: 0,
            avx_high: [[0; 2]; crate::NUM_XMMS],
            xmm: XmmRegs::default(),
            es_idx: 0,
            cs_idx: 0,
            ss_idx: 0,
            ds_idx: 0,
            gs_idx: 0,
            fs_idx: 0,
            mxcsr: 0x1F80,
            es_cached: 0,
            cs_cached: 0,
            ss_cached: 0,
            ds_cached: 0,
            gs_cached: 0,
            fs_cached: 0,
            flags: [0; 48],
            mm: [[0; 2]; crate::NUM_MMS],
            segment_arrays: [0; 2],
            fcw: 0x37F,
            abridged_ftw: 0,
            _pad2: [0; 5],
            private_gdt: [GdtSegment::default(); 32],
        };

        state.flags[x86::FLAG_RESERVED] = 1;
        state.flags[x86::FLAG_IF] = 1;
        // DF is encoded as 1/-1 internally; 1 means "forward", the ABI
        // mandated reset value.
        state.flags[x86::FLAG_DF_RAW] = 1;
        state
    }
}

impl CpuState {
    /// Resolve a selector to its descriptor following the TI bit.
    ///
    /// # Safety
    ///
    /// `segment_arrays` must point at live descriptor tables large enough
    /// for the selector index.
    pub unsafe fn segment_from_selector(&self, selector: u16) -> *mut GdtSegment {
        let base = self.segment_arrays[usize::from((selector >> 2) & 1)] as *mut GdtSegment;
        base.add(usize::from(selector >> 3))
    }
}

// Size stability: generated code addresses fields by constant offset, so
// accidental growth of the leading fields must fail the build loudly.
const _: () = assert!(core::mem::size_of::<NonAtomicRefCounter>() == 8);
const _: () = assert!(core::mem::size_of::<GdtSegment>() == 8);
const _: () = assert!(core::mem::size_of::<XmmRegs>() == 512);
const _: () = assert!(core::mem::align_of::<CpuState>() == 64);

#[cfg(test)]
mod tests {
    use super::*;
    use memoffset::offset_of;

    #[test]
    fn hot_fields_in_first_cacheline() {
        assert!(offset_of!(CpuState, rip) < 64);
        assert!(offset_of!(CpuState, deferred_signal_ref_count) < 64);
        assert_eq!(offset_of!(CpuState, deferred_signal_ref_count) % 8, 0);
    }

    #[test]
    fn paired_fields_within_paired_load_range() {
        // ldp/stp unsigned immediates reach 504 for 8-byte elements and 252
        // for 4-byte elements.
        assert!(offset_of!(CpuState, gregs) + 15 * 8 <= 504);
        assert!(offset_of!(CpuState, l1_pointer) <= 504);
        assert_eq!(
            offset_of!(CpuState, l1_mask),
            offset_of!(CpuState, l1_pointer) + 8
        );
        assert!(offset_of!(CpuState, pf_raw) <= 252);
        assert_eq!(offset_of!(CpuState, af_raw), offset_of!(CpuState, pf_raw) + 4);
        assert_eq!(offset_of!(CpuState, pf_raw) % 8, 0);
    }

    #[test]
    fn simd_alignment() {
        assert_eq!(offset_of!(CpuState, avx_high) % 64, 0);
        assert_eq!(offset_of!(CpuState, xmm) % 32, 0);
        assert_eq!(offset_of!(CpuState, mm) % 16, 0);
        assert_eq!(offset_of!(CpuState, gregs) % 16, 0);
    }

    #[test]
    fn reset_state() {
        let state = CpuState::default();
        assert_eq!(state.pf_raw, 1);
        assert_eq!(state.mxcsr, 0x1F80);
        assert_eq!(state.fcw, 0x37F);
        assert_eq!(state.flags[x86::FLAG_RESERVED], 1);
        assert_eq!(state.flags[x86::FLAG_DF_RAW], 1);
    }

    #[test]
    fn gdt_base_limit_roundtrip() {
        let mut seg = GdtSegment::default();
        seg.set_base(0xDEAD_BEEF);
        seg.set_limit(0xF_FFFF);
        assert_eq!(seg.base(), 0xDEAD_BEEF);
        assert_eq!(seg.limit(), 0xF_FFFF);
        seg.set_base(0);
        assert_eq!(seg.base(), 0);
        assert_eq!(seg.limit(), 0xF_FFFF);
    }

    #[test]
    fn refcounter_tears_but_counts() {
        let counter = NonAtomicRefCounter::default();
        counter.increment(1);
        counter.increment(1);
        assert_eq!(counter.decrement(1), 2);
        assert_eq!(counter.load(), 1);
    }
}
