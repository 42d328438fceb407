//! The reference backend: direct IR interpretation.
//!
//! Every op is executed against the guest frame exactly as the IR defines
//! it, with no register allocation involved. The machine backends are
//! validated against this one; the end-to-end suite runs on it on any host.

use std::sync::atomic::{
    fence, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering,
};
use std::sync::Mutex;

use silex_ir::{block_ops, IrStore, NodeId, Op, OpSize, OwnedIr, RegisterAllocationData};
use silex_types::x86::traps;
use silex_types::{
    offsets, CpuIdDispatchFn, CpuStateFrame, RemoveCodeEntryFn, SyscallArguments,
    SyscallDispatchFn, ThunkDispatchFn, XcrDispatchFn, AF_AS_GREG, PF_AS_GREG,
};

use crate::backend::{BackendError, BlockExit, CpuBackend};

/// One compiled-for-interpretation region: the owned IR snapshot plus the
/// entry RIP (needed by `ValidateCode`).
pub struct InterpBlock {
    pub entry_rip: u64,
    pub ir: OwnedIr,
}

pub struct InterpreterBackend {
    // Entry tokens point into these boxes; keep them alive for the thread's
    // lifetime.
    regions: Vec<Box<InterpBlock>>,
}

impl InterpreterBackend {
    pub fn new() -> InterpreterBackend {
        InterpreterBackend { regions: Vec::new() }
    }
}

impl Default for InterpreterBackend {
    fn default() -> Self {
        InterpreterBackend::new()
    }
}

impl CpuBackend for InterpreterBackend {
    fn name(&self) -> &'static str {
        "interpreter"
    }

    fn needs_register_allocation(&self) -> bool {
        false
    }

    fn compile(
        &mut self,
        entry_rip: u64,
        ir: &dyn IrStore,
        _ra: Option<&RegisterAllocationData>,
    ) -> Result<u64, BackendError> {
        let region = Box::new(InterpBlock { entry_rip, ir: OwnedIr::snapshot(ir) });
        let token = &*region as *const InterpBlock as u64;
        self.regions.push(region);
        Ok(token)
    }

    unsafe fn invoke(&mut self, entry: u64, frame: *mut CpuStateFrame) -> BlockExit {
        let region = &*(entry as *const InterpBlock);
        run_region(region, frame)
    }

    fn clear(&mut self) {
        self.regions.clear();
    }
}

/// 128-bit value slot; scalars live in lane 0.
type Value = [u64; 2];

fn state_ptr(frame: *mut CpuStateFrame, offset: u32) -> *mut u8 {
    unsafe { (frame as *mut u8).add(offset as usize) }
}

unsafe fn read_sized(ptr: *const u8, size: OpSize) -> Value {
    match size {
        OpSize::I8 => [u64::from(core::ptr::read(ptr)), 0],
        OpSize::I16 => [u64::from(core::ptr::read_unaligned(ptr as *const u16)), 0],
        OpSize::I32 => [u64::from(core::ptr::read_unaligned(ptr as *const u32)), 0],
        OpSize::I64 => [core::ptr::read_unaligned(ptr as *const u64), 0],
        _ => {
            let lo = core::ptr::read_unaligned(ptr as *const u64);
            let hi = core::ptr::read_unaligned((ptr as *const u64).add(1));
            [lo, hi]
        }
    }
}

unsafe fn write_sized(ptr: *mut u8, size: OpSize, value: Value) {
    match size {
        OpSize::I8 => core::ptr::write(ptr, value[0] as u8),
        OpSize::I16 => core::ptr::write_unaligned(ptr as *mut u16, value[0] as u16),
        OpSize::I32 => core::ptr::write_unaligned(ptr as *mut u32, value[0] as u32),
        OpSize::I64 => core::ptr::write_unaligned(ptr as *mut u64, value[0]),
        _ => {
            core::ptr::write_unaligned(ptr as *mut u64, value[0]);
            core::ptr::write_unaligned((ptr as *mut u64).add(1), value[1]);
        }
    }
}

fn sext(value: u64, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

/// Guest atomics assume natural alignment, as hardware does.
static CAS_PAIR_LOCK: Mutex<()> = Mutex::new(());

unsafe fn run_region(region: &InterpBlock, frame: *mut CpuStateFrame) -> BlockExit {
    let ir = &region.ir;
    let mut values: Vec<Value> = vec![[0, 0]; ir.nodes.len()];

    let mut current = ir.block_head;
    'blocks: loop {
        let mut next_block = NodeId::INVALID;
        for node in block_ops(ir, current) {
            let payload = ir.op(node);
            let size = payload.size;
            let elem = payload.elem_size;
            let mask = size.value_mask();
            let value = |values: &Vec<Value>, id: NodeId| -> Value { values[id.index()] };
            let scalar = |values: &Vec<Value>, id: NodeId| -> u64 { values[id.index()][0] };

            let result: Option<Value> = match payload.op {
                Op::Invalid | Op::CodeBlock { .. } | Op::BeginBlock { .. } => None,
                Op::EndBlock { .. } => None,

                Op::Constant { value } | Op::InlineConstant { value } => Some([value, 0]),

                Op::LoadContext { offset, .. } => {
                    Some(read_sized(state_ptr(frame, offset), size))
                }
                Op::StoreContext { offset, value: src, .. } => {
                    write_sized(state_ptr(frame, offset), size, value(&values, src));
                    None
                }
                Op::LoadRegister { reg, class } => {
                    let offset = register_offset(reg, class);
                    Some(read_sized(state_ptr(frame, offset), size))
                }
                Op::StoreRegister { reg, class, value: src } => {
                    let offset = register_offset(reg, class);
                    write_sized(state_ptr(frame, offset), size, value(&values, src));
                    None
                }
                Op::LoadFlag { flag } => {
                    let offset = offsets::flag_byte(flag);
                    Some(read_sized(state_ptr(frame, offset), size))
                }
                Op::StoreFlag { flag, value: src } => {
                    let offset = offsets::flag_byte(flag);
                    write_sized(state_ptr(frame, offset), size, value(&values, src));
                    None
                }

                Op::Add { src1, src2 } => {
                    Some([scalar(&values, src1).wrapping_add(scalar(&values, src2)) & mask, 0])
                }
                Op::Sub { src1, src2 } => {
                    Some([scalar(&values, src1).wrapping_sub(scalar(&values, src2)) & mask, 0])
                }
                Op::Mul { src1, src2 } | Op::UMul { src1, src2 } => {
                    Some([scalar(&values, src1).wrapping_mul(scalar(&values, src2)) & mask, 0])
                }
                Op::MulH { src1, src2 } => {
                    let lhs = sext(scalar(&values, src1) & mask, size.bits()) as i128;
                    let rhs = sext(scalar(&values, src2) & mask, size.bits()) as i128;
                    let wide = lhs.wrapping_mul(rhs);
                    Some([((wide >> size.bits()) as u64) & mask, 0])
                }
                Op::UMulH { src1, src2 } => {
                    let lhs = (scalar(&values, src1) & mask) as u128;
                    let rhs = (scalar(&values, src2) & mask) as u128;
                    let wide = lhs.wrapping_mul(rhs);
                    Some([((wide >> size.bits()) as u64) & mask, 0])
                }
                Op::Div { src1, src2 } => {
                    let rhs = sext(scalar(&values, src2) & mask, size.bits());
                    if rhs == 0 {
                        return fault(frame, traps::SIGFPE, traps::TRAP_DE);
                    }
                    let lhs = sext(scalar(&values, src1) & mask, size.bits());
                    Some([(lhs.wrapping_div(rhs) as u64) & mask, 0])
                }
                Op::UDiv { src1, src2 } => {
                    let rhs = scalar(&values, src2) & mask;
                    if rhs == 0 {
                        return fault(frame, traps::SIGFPE, traps::TRAP_DE);
                    }
                    Some([((scalar(&values, src1) & mask) / rhs) & mask, 0])
                }
                Op::Rem { src1, src2 } => {
                    let rhs = sext(scalar(&values, src2) & mask, size.bits());
                    if rhs == 0 {
                        return fault(frame, traps::SIGFPE, traps::TRAP_DE);
                    }
                    let lhs = sext(scalar(&values, src1) & mask, size.bits());
                    Some([(lhs.wrapping_rem(rhs) as u64) & mask, 0])
                }
                Op::URem { src1, src2 } => {
                    let rhs = scalar(&values, src2) & mask;
                    if rhs == 0 {
                        return fault(frame, traps::SIGFPE, traps::TRAP_DE);
                    }
                    Some([((scalar(&values, src1) & mask) % rhs) & mask, 0])
                }
                Op::And { src1, src2 } => {
                    Some([scalar(&values, src1) & scalar(&values, src2) & mask, 0])
                }
                Op::Or { src1, src2 } => {
                    Some([(scalar(&values, src1) | scalar(&values, src2)) & mask, 0])
                }
                Op::Xor { src1, src2 } => {
                    Some([(scalar(&values, src1) ^ scalar(&values, src2)) & mask, 0])
                }
                Op::Lshl { src1, src2 } => {
                    let amount = (scalar(&values, src2) as u32) & (size.bits() - 1);
                    Some([(scalar(&values, src1) & mask).wrapping_shl(amount) & mask, 0])
                }
                Op::Lshr { src1, src2 } => {
                    let amount = (scalar(&values, src2) as u32) & (size.bits() - 1);
                    Some([((scalar(&values, src1) & mask) >> amount) & mask, 0])
                }
                Op::Ashr { src1, src2 } => {
                    let amount = (scalar(&values, src2) as u32) & (size.bits() - 1);
                    let lhs = sext(scalar(&values, src1) & mask, size.bits());
                    Some([((lhs >> amount) as u64) & mask, 0])
                }
                Op::Ror { src1, src2 } => {
                    let bits = size.bits();
                    let amount = (scalar(&values, src2) as u32) & (bits - 1);
                    let lhs = scalar(&values, src1) & mask;
                    let rotated = if amount == 0 {
                        lhs
                    } else {
                        ((lhs >> amount) | (lhs << (bits - amount))) & mask
                    };
                    Some([rotated, 0])
                }
                Op::Not { src } => Some([!scalar(&values, src) & mask, 0]),
                Op::Neg { src } => Some([scalar(&values, src).wrapping_neg() & mask, 0]),
                Op::Popcount { src } => {
                    Some([u64::from((scalar(&values, src) & mask).count_ones()), 0])
                }
                Op::Clz { src } => {
                    let bits = size.bits();
                    let shifted = (scalar(&values, src) & mask) << (64 - bits);
                    Some([u64::from(shifted.leading_zeros().min(bits)), 0])
                }
                Op::Ctz { src } => {
                    let masked = scalar(&values, src) & mask;
                    let count = if masked == 0 {
                        size.bits()
                    } else {
                        masked.trailing_zeros()
                    };
                    Some([u64::from(count), 0])
                }
                Op::Rev { src } => {
                    let bits = size.bits();
                    Some([(scalar(&values, src) & mask).swap_bytes() >> (64 - bits), 0])
                }
                Op::Copy { src } => Some(value(&values, src)),

                Op::Bfe { src, lsb, width } => {
                    let width_mask =
                        if width >= 64 { u64::MAX } else { (1u64 << width) - 1 };
                    Some([((scalar(&values, src) >> lsb) & width_mask) & mask, 0])
                }
                Op::Sbfe { src, lsb, width } => {
                    let extracted = scalar(&values, src) >> lsb;
                    Some([(sext(extracted, u32::from(width)) as u64) & mask, 0])
                }
                Op::Bfi { dest, src, lsb, width } => {
                    let width_mask =
                        if width >= 64 { u64::MAX } else { (1u64 << width) - 1 };
                    let cleared = scalar(&values, dest) & !(width_mask << lsb);
                    let inserted = (scalar(&values, src) & width_mask) << lsb;
                    Some([(cleared | inserted) & mask, 0])
                }
                Op::Select { cond, compare_size, cmp1, cmp2, true_val, false_val } => {
                    let taken = cond.evaluate(
                        compare_size,
                        scalar(&values, cmp1),
                        scalar(&values, cmp2),
                    );
                    Some(value(&values, if taken { true_val } else { false_val }))
                }

                Op::LoadMem { addr, offset, .. } => {
                    let mut address = scalar(&values, addr);
                    if offset.is_valid() {
                        address = address.wrapping_add(scalar(&values, offset));
                    }
                    Some(read_sized(address as *const u8, size))
                }
                Op::LoadMemTso { addr, offset, .. } => {
                    let mut address = scalar(&values, addr);
                    if offset.is_valid() {
                        address = address.wrapping_add(scalar(&values, offset));
                    }
                    let loaded = read_sized(address as *const u8, size);
                    fence(Ordering::Acquire);
                    Some(loaded)
                }
                Op::StoreMem { addr, value: src, offset, .. } => {
                    let mut address = scalar(&values, addr);
                    if offset.is_valid() {
                        address = address.wrapping_add(scalar(&values, offset));
                    }
                    write_sized(address as *mut u8, size, value(&values, src));
                    None
                }
                Op::StoreMemTso { addr, value: src, offset, .. } => {
                    let mut address = scalar(&values, addr);
                    if offset.is_valid() {
                        address = address.wrapping_add(scalar(&values, offset));
                    }
                    fence(Ordering::Release);
                    write_sized(address as *mut u8, size, value(&values, src));
                    fence(Ordering::SeqCst);
                    None
                }

                Op::Cas { expected, desired, addr } => {
                    let address = scalar(&values, addr);
                    let expected = scalar(&values, expected) & mask;
                    let desired = scalar(&values, desired) & mask;
                    let old = atomic_cas(address, size, expected, desired);
                    Some([old, 0])
                }
                Op::CasPair { expected, desired, addr } => {
                    let address = scalar(&values, addr) as *mut u64;
                    let expected = value(&values, expected);
                    let desired = value(&values, desired);
                    let half_mask = elem_pair_mask(size);
                    let _guard = CAS_PAIR_LOCK.lock().unwrap();
                    fence(Ordering::SeqCst);
                    let old = match size {
                        OpSize::I128 => {
                            let lo = core::ptr::read(address);
                            let hi = core::ptr::read(address.add(1));
                            if lo == expected[0] && hi == expected[1] {
                                core::ptr::write(address, desired[0]);
                                core::ptr::write(address.add(1), desired[1]);
                            }
                            [lo, hi]
                        }
                        _ => {
                            // 64-bit pair: two 32-bit halves.
                            let raw = core::ptr::read(address as *const u64);
                            let lo = raw & half_mask;
                            let hi = raw >> 32;
                            if lo == expected[0] & half_mask && hi == expected[1] & half_mask {
                                let merged = (desired[0] & half_mask)
                                    | ((desired[1] & half_mask) << 32);
                                core::ptr::write(address as *mut u64, merged);
                            }
                            [lo, hi]
                        }
                    };
                    fence(Ordering::SeqCst);
                    Some(old)
                }

                Op::AtomicAdd { addr, value: src }
                | Op::AtomicFetchAdd { addr, value: src } => Some([
                    atomic_rmw(scalar(&values, addr), size, scalar(&values, src), AtomicKind::Add),
                    0,
                ]),
                Op::AtomicSub { addr, value: src }
                | Op::AtomicFetchSub { addr, value: src } => Some([
                    atomic_rmw(scalar(&values, addr), size, scalar(&values, src), AtomicKind::Sub),
                    0,
                ]),
                Op::AtomicAnd { addr, value: src }
                | Op::AtomicFetchAnd { addr, value: src } => Some([
                    atomic_rmw(scalar(&values, addr), size, scalar(&values, src), AtomicKind::And),
                    0,
                ]),
                Op::AtomicOr { addr, value: src }
                | Op::AtomicFetchOr { addr, value: src } => Some([
                    atomic_rmw(scalar(&values, addr), size, scalar(&values, src), AtomicKind::Or),
                    0,
                ]),
                Op::AtomicXor { addr, value: src }
                | Op::AtomicFetchXor { addr, value: src } => Some([
                    atomic_rmw(scalar(&values, addr), size, scalar(&values, src), AtomicKind::Xor),
                    0,
                ]),
                Op::AtomicSwap { addr, value: src } => Some([
                    atomic_rmw(scalar(&values, addr), size, scalar(&values, src), AtomicKind::Swap),
                    0,
                ]),
                Op::AtomicNeg { addr } => {
                    // CAS loop; no fetch variant required by users.
                    let address = scalar(&values, addr);
                    loop {
                        let old = atomic_load(address, size);
                        let new = old.wrapping_neg() & mask;
                        if atomic_cas(address, size, old, new) == old {
                            break;
                        }
                    }
                    None
                }

                Op::CreateElementPair { lo, hi } => {
                    Some([scalar(&values, lo), scalar(&values, hi)])
                }
                Op::ExtractElementPair { pair, index } => {
                    Some([value(&values, pair)[usize::from(index)], 0])
                }

                Op::VAdd { src1, src2 } => {
                    Some(vector_lanewise(value(&values, src1), value(&values, src2), elem, |a, b, m| {
                        a.wrapping_add(b) & m
                    }))
                }
                Op::VSub { src1, src2 } => {
                    Some(vector_lanewise(value(&values, src1), value(&values, src2), elem, |a, b, m| {
                        a.wrapping_sub(b) & m
                    }))
                }
                Op::VAnd { src1, src2 } => {
                    let a = value(&values, src1);
                    let b = value(&values, src2);
                    Some([a[0] & b[0], a[1] & b[1]])
                }
                Op::VOr { src1, src2 } => {
                    let a = value(&values, src1);
                    let b = value(&values, src2);
                    Some([a[0] | b[0], a[1] | b[1]])
                }
                Op::VXor { src1, src2 } => {
                    let a = value(&values, src1);
                    let b = value(&values, src2);
                    Some([a[0] ^ b[0], a[1] ^ b[1]])
                }
                Op::VCastFromGpr { src } => Some([scalar(&values, src) & elem.value_mask(), 0]),
                Op::VExtractToGpr { vector, index } => {
                    let lanes_per_word = (64 / elem.bits()).max(1) as usize;
                    let word = usize::from(index) / lanes_per_word;
                    let lane = usize::from(index) % lanes_per_word;
                    let shifted = value(&values, vector)[word] >> (lane as u32 * elem.bits());
                    Some([shifted & elem.value_mask(), 0])
                }
                Op::VInsertGpr { vector, src, index } => {
                    let mut out = value(&values, vector);
                    let lanes_per_word = (64 / elem.bits()).max(1) as usize;
                    let word = usize::from(index) / lanes_per_word;
                    let lane = usize::from(index) % lanes_per_word;
                    let shift = lane as u32 * elem.bits();
                    let lane_mask = elem.value_mask() << shift;
                    out[word] = (out[word] & !lane_mask)
                        | ((scalar(&values, src) & elem.value_mask()) << shift);
                    Some(out)
                }

                Op::FAdd { src1, src2 }
                | Op::FSub { src1, src2 }
                | Op::FMul { src1, src2 }
                | Op::FDiv { src1, src2 } => {
                    let a = value(&values, src1);
                    let b = value(&values, src2);
                    let computed = scalar_float_op(&payload.op, size, a[0], b[0]);
                    // Scalar SSE semantics: upper lane rides along from the
                    // destination source.
                    Some([computed, a[1]])
                }
                Op::FCmp { src1, src2 } => {
                    let a = value(&values, src1)[0];
                    let b = value(&values, src2)[0];
                    let (unordered, equal, less) = match elem {
                        OpSize::I32 => {
                            let a = f32::from_bits(a as u32);
                            let b = f32::from_bits(b as u32);
                            (a.is_nan() || b.is_nan(), a == b, a < b)
                        }
                        _ => {
                            let a = f64::from_bits(a);
                            let b = f64::from_bits(b);
                            (a.is_nan() || b.is_nan(), a == b, a < b)
                        }
                    };
                    Some([
                        u64::from(unordered)
                            | (u64::from(equal) << 1)
                            | (u64::from(less) << 2),
                        0,
                    ])
                }
                Op::CvtFToF { src } => {
                    let raw = value(&values, src)[0];
                    let out = match (size, elem) {
                        (OpSize::I64, OpSize::I32) => {
                            f64::from(f32::from_bits(raw as u32)).to_bits()
                        }
                        (OpSize::I32, OpSize::I64) => {
                            u64::from((f64::from_bits(raw) as f32).to_bits())
                        }
                        _ => raw,
                    };
                    Some([out, 0])
                }
                Op::CvtSIntToF { src } => {
                    let raw = sext(scalar(&values, src) & elem.value_mask(), elem.bits());
                    let out = match size {
                        OpSize::I32 => u64::from((raw as f32).to_bits()),
                        _ => (raw as f64).to_bits(),
                    };
                    Some([out, 0])
                }
                Op::CvtFToSInt { src } => {
                    let raw = value(&values, src)[0];
                    let float = match elem {
                        OpSize::I32 => f64::from(f32::from_bits(raw as u32)),
                        _ => f64::from_bits(raw),
                    };
                    // Truncating conversion, saturating at the type edges
                    // the way Rust casts do.
                    let out = match size {
                        OpSize::I32 => (float as i32) as u64 & mask,
                        _ => (float as i64) as u64,
                    };
                    Some([out, 0])
                }

                Op::CpuId { function, leaf } => {
                    let frame_ref = &*frame;
                    let func_ptr = frame_ref.pointers.cpuid_function;
                    let result = if func_ptr != 0 {
                        let cpuid: CpuIdDispatchFn = core::mem::transmute(func_ptr);
                        cpuid(
                            frame_ref.pointers.cpuid_obj,
                            scalar(&values, function) as u32,
                            scalar(&values, leaf) as u32,
                        )
                    } else {
                        Default::default()
                    };
                    Some([
                        u64::from(result.eax) | (u64::from(result.ebx) << 32),
                        u64::from(result.ecx) | (u64::from(result.edx) << 32),
                    ])
                }
                Op::XGetBv { function } => {
                    let frame_ref = &*frame;
                    let func_ptr = frame_ref.pointers.xcr_function;
                    let out = if func_ptr != 0 {
                        let xcr: XcrDispatchFn = core::mem::transmute(func_ptr);
                        xcr(frame_ref.pointers.cpuid_obj, scalar(&values, function) as u32)
                    } else {
                        0
                    };
                    Some([out, 0])
                }
                Op::Syscall { args } | Op::InlineSyscall { args } => {
                    let mut packed = SyscallArguments::default();
                    for (slot, node) in packed.argument.iter_mut().zip(args.iter()) {
                        *slot = scalar(&values, *node);
                    }
                    let func_ptr = (*frame).pointers.syscall_handler_func;
                    let ret = if func_ptr != 0 {
                        let dispatch: SyscallDispatchFn = core::mem::transmute(func_ptr);
                        dispatch(frame, &packed)
                    } else {
                        -(libc::ENOSYS as i64)
                    };
                    Some([ret as u64, 0])
                }
                Op::Thunk { arg_ptr, hash } => {
                    let frame_ref = &*frame;
                    let func_ptr = frame_ref.pointers.thunk_handler_func;
                    if func_ptr != 0 {
                        let dispatch: ThunkDispatchFn = core::mem::transmute(func_ptr);
                        dispatch(
                            frame_ref.pointers.thunk_handler_obj,
                            hash.as_ptr(),
                            scalar(&values, arg_ptr),
                        );
                    }
                    Some([0, 0])
                }
                Op::ValidateCode { offset, original_lo, original_hi, length } => {
                    let mut mismatch = 0u64;
                    let base = region.entry_rip.wrapping_add(offset) as *const u8;
                    for index in 0..usize::from(length) {
                        let expected = if index < 8 {
                            (original_lo >> (index * 8)) as u8
                        } else {
                            (original_hi >> ((index - 8) * 8)) as u8
                        };
                        if core::ptr::read(base.add(index)) != expected {
                            mismatch = 1;
                            break;
                        }
                    }
                    Some([mismatch, 0])
                }
                Op::RemoveCodeEntry { rip } => {
                    let frame_ref = &*frame;
                    let func_ptr = frame_ref.pointers.remove_code_entry;
                    if func_ptr != 0 {
                        let remove: RemoveCodeEntryFn = core::mem::transmute(func_ptr);
                        remove(frame_ref.thread, rip);
                    }
                    None
                }
                Op::Break { reason } => {
                    if reason.trap_number == traps::TRAP_HLT {
                        return BlockExit::Halt;
                    }
                    let frame_ref = &mut *frame;
                    frame_ref.synchronous_fault_data.signal = reason.signal;
                    frame_ref.synchronous_fault_data.trap_no = reason.trap_number;
                    frame_ref.synchronous_fault_data.si_code = reason.si_code;
                    frame_ref.synchronous_fault_data.err_code = reason.error_register;
                    frame_ref.synchronous_fault_data.fault_to_top_and_generated_exception = 1;
                    return BlockExit::Fault;
                }

                Op::Jump { target } => {
                    next_block = target;
                    None
                }
                Op::CondJump { cond, compare_size, cmp1, cmp2, true_block, false_block } => {
                    let taken = cond.evaluate(
                        compare_size,
                        scalar(&values, cmp1),
                        scalar(&values, cmp2),
                    );
                    next_block = if taken { true_block } else { false_block };
                    None
                }
                Op::ExitFunction { new_rip } => {
                    (*frame).state.rip = scalar(&values, new_rip);
                    return BlockExit::Continue;
                }

                // RA artifacts are inert under interpretation.
                Op::SpillRegister { .. } => None,
                Op::FillRegister { orig, .. } => Some(value(&values, orig)),
            };

            if let Some(result) = result {
                values[node.index()] = result;
            }
            if next_block.is_valid() {
                current = next_block;
                continue 'blocks;
            }
        }

        // A block fell off its end without a terminator: malformed region.
        log::error!("interpreter ran off the end of a block");
        return fault(frame, traps::SIGILL, traps::TRAP_UD);
    }
}

unsafe fn fault(frame: *mut CpuStateFrame, signal: u8, trap: u8) -> BlockExit {
    let frame_ref = &mut *frame;
    frame_ref.synchronous_fault_data.signal = signal;
    frame_ref.synchronous_fault_data.trap_no = trap;
    frame_ref.synchronous_fault_data.fault_to_top_and_generated_exception = 1;
    BlockExit::Fault
}

fn register_offset(reg: u32, class: silex_ir::RegClass) -> u32 {
    use silex_ir::RegClass;
    match class {
        RegClass::Fpr | RegClass::FprFixed => offsets::xmm(reg),
        _ => {
            if reg == PF_AS_GREG {
                offsets::pf_raw()
            } else if reg == AF_AS_GREG {
                offsets::af_raw()
            } else {
                offsets::greg(reg)
            }
        }
    }
}

fn elem_pair_mask(size: OpSize) -> u64 {
    match size {
        OpSize::I128 => u64::MAX,
        _ => 0xffff_ffff,
    }
}

#[derive(Clone, Copy)]
enum AtomicKind {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Swap,
}

unsafe fn atomic_load(addr: u64, size: OpSize) -> u64 {
    match size {
        OpSize::I8 => (*(addr as *const AtomicU8)).load(Ordering::SeqCst) as u64,
        OpSize::I16 => (*(addr as *const AtomicU16)).load(Ordering::SeqCst) as u64,
        OpSize::I32 => (*(addr as *const AtomicU32)).load(Ordering::SeqCst) as u64,
        _ => (*(addr as *const AtomicU64)).load(Ordering::SeqCst),
    }
}

unsafe fn atomic_cas(addr: u64, size: OpSize, expected: u64, desired: u64) -> u64 {
    match size {
        OpSize::I8 => {
            match (*(addr as *const AtomicU8)).compare_exchange(
                expected as u8,
                desired as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(old) | Err(old) => u64::from(old),
            }
        }
        OpSize::I16 => {
            match (*(addr as *const AtomicU16)).compare_exchange(
                expected as u16,
                desired as u16,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(old) | Err(old) => u64::from(old),
            }
        }
        OpSize::I32 => {
            match (*(addr as *const AtomicU32)).compare_exchange(
                expected as u32,
                desired as u32,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(old) | Err(old) => u64::from(old),
            }
        }
        _ => {
            match (*(addr as *const AtomicU64)).compare_exchange(
                expected,
                desired,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(old) | Err(old) => old,
            }
        }
    }
}

unsafe fn atomic_rmw(addr: u64, size: OpSize, operand: u64, kind: AtomicKind) -> u64 {
    macro_rules! rmw {
        ($atomic:ty, $value:expr) => {{
            let target = &*(addr as *const $atomic);
            let operand = $value;
            let old = match kind {
                AtomicKind::Add => target.fetch_add(operand, Ordering::SeqCst),
                AtomicKind::Sub => target.fetch_sub(operand, Ordering::SeqCst),
                AtomicKind::And => target.fetch_and(operand, Ordering::SeqCst),
                AtomicKind::Or => target.fetch_or(operand, Ordering::SeqCst),
                AtomicKind::Xor => target.fetch_xor(operand, Ordering::SeqCst),
                AtomicKind::Swap => target.swap(operand, Ordering::SeqCst),
            };
            old as u64
        }};
    }
    match size {
        OpSize::I8 => rmw!(AtomicU8, operand as u8),
        OpSize::I16 => rmw!(AtomicU16, operand as u16),
        OpSize::I32 => rmw!(AtomicU32, operand as u32),
        _ => rmw!(AtomicU64, operand),
    }
}

fn vector_lanewise(a: Value, b: Value, elem: OpSize, op: impl Fn(u64, u64, u64) -> u64) -> Value {
    let lane_bits = elem.bits();
    let lane_mask = elem.value_mask();
    let mut out = [0u64; 2];
    for word in 0..2 {
        if lane_bits >= 64 {
            out[word] = op(a[word], b[word], u64::MAX);
            continue;
        }
        let lanes = 64 / lane_bits;
        for lane in 0..lanes {
            let shift = lane * lane_bits;
            let lane_a = (a[word] >> shift) & lane_mask;
            let lane_b = (b[word] >> shift) & lane_mask;
            out[word] |= (op(lane_a, lane_b, lane_mask) & lane_mask) << shift;
        }
    }
    out
}

fn scalar_float_op(op: &Op, size: OpSize, a: u64, b: u64) -> u64 {
    match size {
        OpSize::I32 => {
            let a = f32::from_bits(a as u32);
            let b = f32::from_bits(b as u32);
            let out = match op {
                Op::FAdd { .. } => a + b,
                Op::FSub { .. } => a - b,
                Op::FMul { .. } => a * b,
                _ => a / b,
            };
            u64::from(out.to_bits())
        }
        _ => {
            let a = f64::from_bits(a);
            let b = f64::from_bits(b);
            let out = match op {
                Op::FAdd { .. } => a + b,
                Op::FSub { .. } => a - b,
                Op::FMul { .. } => a * b,
                _ => a / b,
            };
            out.to_bits()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silex_ir::pool::IntrusivePooledAllocator;
    use silex_ir::{CondCode, IrEmitter, RegClass};

    fn run(build: impl FnOnce(&mut IrEmitter)) -> (Box<CpuStateFrame>, BlockExit) {
        let mut emitter = IrEmitter::new(IntrusivePooledAllocator::new_heap());
        build(&mut emitter);
        let mut backend = InterpreterBackend::new();
        let entry = backend.compile(0x1000, emitter.data(), None).expect("compile");
        let mut frame = CpuStateFrame::new();
        let exit = unsafe { backend.invoke(entry, &mut *frame) };
        (frame, exit)
    }

    #[test]
    fn constant_store_and_exit() {
        let (frame, exit) = run(|e| {
            let block = e.create_code_node();
            e.start_block(block);
            let value = e.constant(OpSize::I64, 42);
            e.store_register(OpSize::I64, RegClass::Gpr, 0, value);
            let rip = e.constant(OpSize::I64, 0x2000);
            e.exit_function(rip);
            e.finish_block(block);
        });
        assert_eq!(exit, BlockExit::Continue);
        assert_eq!(frame.state.gregs[0], 42);
        assert_eq!(frame.state.rip, 0x2000);
    }

    #[test]
    fn cond_jump_picks_true_block() {
        let (frame, exit) = run(|e| {
            let head = e.create_code_node();
            let yes = e.create_code_node();
            let no = e.create_code_node();
            e.start_block(head);
            let five = e.constant(OpSize::I32, 5);
            let three = e.constant(OpSize::I32, 3);
            e.cond_jump(CondCode::Ugt, OpSize::I32, five, three, yes, no);
            e.finish_block(head);

            e.start_block(yes);
            let one = e.constant(OpSize::I64, 1);
            e.store_register(OpSize::I64, RegClass::Gpr, 0, one);
            let rip = e.constant(OpSize::I64, 0);
            e.exit_function(rip);
            e.finish_block(yes);

            e.start_block(no);
            let two = e.constant(OpSize::I64, 2);
            e.store_register(OpSize::I64, RegClass::Gpr, 0, two);
            let rip = e.constant(OpSize::I64, 0);
            e.exit_function(rip);
            e.finish_block(no);
        });
        assert_eq!(exit, BlockExit::Continue);
        assert_eq!(frame.state.gregs[0], 1);
    }

    #[test]
    fn memory_roundtrip() {
        let mut cell = 0u64;
        let addr = &mut cell as *mut u64 as u64;
        let (_frame, exit) = run(|e| {
            let block = e.create_code_node();
            e.start_block(block);
            let address = e.constant(OpSize::I64, addr);
            let value = e.constant(OpSize::I64, 0xdead_beef);
            e.store_mem_tso(RegClass::Gpr, OpSize::I64, address, value, 1);
            let rip = e.constant(OpSize::I64, 0);
            e.exit_function(rip);
            e.finish_block(block);
        });
        assert_eq!(exit, BlockExit::Continue);
        assert_eq!(cell, 0xdead_beef);
    }

    #[test]
    fn cas_success_and_failure() {
        let mut cell = 5u64;
        let addr = &mut cell as *mut u64 as u64;
        let (frame, _) = run(|e| {
            let block = e.create_code_node();
            e.start_block(block);
            let address = e.constant(OpSize::I64, addr);
            let expected = e.constant(OpSize::I64, 5);
            let desired = e.constant(OpSize::I64, 9);
            let old = e.cas(OpSize::I64, expected, desired, address);
            e.store_register(OpSize::I64, RegClass::Gpr, 0, old);
            // Second CAS fails: expects 5 again but the cell now holds 9.
            let desired2 = e.constant(OpSize::I64, 11);
            let old2 = e.cas(OpSize::I64, expected, desired2, address);
            e.store_register(OpSize::I64, RegClass::Gpr, 1, old2);
            let rip = e.constant(OpSize::I64, 0);
            e.exit_function(rip);
            e.finish_block(block);
        });
        assert_eq!(cell, 9);
        assert_eq!(frame.state.gregs[0], 5);
        assert_eq!(frame.state.gregs[1], 9);
    }

    #[test]
    fn break_reports_fault() {
        let (frame, exit) = run(|e| {
            let block = e.create_code_node();
            e.start_block(block);
            e.break_op(silex_ir::BreakDefinition {
                signal: traps::SIGILL,
                trap_number: traps::TRAP_UD,
                si_code: 0,
                error_register: 0,
            });
            e.finish_block(block);
        });
        assert_eq!(exit, BlockExit::Fault);
        assert_eq!(frame.synchronous_fault_data.signal, traps::SIGILL);
    }

    #[test]
    fn inline_syscall_without_handler_is_enosys() {
        let (frame, exit) = run(|e| {
            let block = e.create_code_node();
            e.start_block(block);
            let number = e.constant(OpSize::I64, 39);
            let zero = e.constant(OpSize::I64, 0);
            let result =
                e.inline_syscall([number, zero, zero, zero, zero, zero, zero]);
            e.store_register(OpSize::I64, RegClass::Gpr, 0, result);
            let rip = e.constant(OpSize::I64, 0);
            e.exit_function(rip);
            e.finish_block(block);
        });
        assert_eq!(exit, BlockExit::Continue);
        assert_eq!(frame.state.gregs[0] as i64, -i64::from(libc::ENOSYS));
    }

    #[test]
    fn vector_lanes_add_independently() {
        let out = vector_lanewise(
            [0x0000_0001_ffff_ffff, 7],
            [0x0000_0001_0000_0001, 1],
            OpSize::I32,
            |a, b, m| a.wrapping_add(b) & m,
        );
        // Low lane wraps without carrying into the high lane.
        assert_eq!(out[0], 0x0000_0002_0000_0000);
        assert_eq!(out[1], 8);
    }
}
