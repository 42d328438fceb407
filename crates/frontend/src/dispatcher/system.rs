//! System instructions: CPUID, XGETBV, syscall entry, and the x87 stubs.

use silex_ir::{NodeId, OpSize, RegClass};
use silex_types::offsets;
use silex_types::x86::{self, traps};

use crate::decoder::{DecodedInst, DecodedOperand};
use crate::dispatcher::{DispatchError, OpDispatchBuilder};

pub(crate) fn op_cpuid(b: &mut OpDispatchBuilder, _inst: &DecodedInst) -> Result<(), DispatchError> {
    let function = b.read_gpr(x86::gpr::RAX, OpSize::I32, false);
    let leaf = b.read_gpr(x86::gpr::RCX, OpSize::I32, false);
    // Result pair: lo = eax | ebx << 32, hi = ecx | edx << 32.
    let pair = b.ir.cpuid(function, leaf);
    let lo = b.ir.extract_element_pair(OpSize::I64, pair, 0);
    let hi = b.ir.extract_element_pair(OpSize::I64, pair, 1);

    let eax = b.ir.bfe(OpSize::I32, lo, 0, 32);
    let ebx = b.ir.bfe(OpSize::I32, lo, 32, 32);
    let ecx = b.ir.bfe(OpSize::I32, hi, 0, 32);
    let edx = b.ir.bfe(OpSize::I32, hi, 32, 32);
    b.write_gpr(x86::gpr::RAX, OpSize::I32, false, eax);
    b.write_gpr(x86::gpr::RBX, OpSize::I32, false, ebx);
    b.write_gpr(x86::gpr::RCX, OpSize::I32, false, ecx);
    b.write_gpr(x86::gpr::RDX, OpSize::I32, false, edx);
    Ok(())
}

pub(crate) fn op_syscall(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    // The kernel ABI: RCX takes the return RIP, R11 the flags image.
    let return_rip = b.ir.constant(OpSize::I64, inst.next_rip());
    b.store_gpr64(x86::gpr::RCX, return_rip);
    let rflags = b.get_packed_rflags();
    b.store_gpr64(x86::gpr::R11, rflags);

    let args: [NodeId; 7] = [
        b.load_gpr64(x86::gpr::RAX),
        b.load_gpr64(x86::gpr::RDI),
        b.load_gpr64(x86::gpr::RSI),
        b.load_gpr64(x86::gpr::RDX),
        b.load_gpr64(x86::gpr::R10),
        b.load_gpr64(x86::gpr::R8),
        b.load_gpr64(x86::gpr::R9),
    ];
    // RIP must be architectural before the handler can observe state.
    let rip_value = b.ir.constant(OpSize::I64, inst.next_rip());
    b.ir
        .store_context(OpSize::I64, RegClass::Gpr, offsets::rip(), rip_value);

    let result = b.ir.syscall(args);
    b.store_gpr64(x86::gpr::RAX, result);

    // The handler may have rewritten state (sigreturn, exit); always
    // re-enter through the dispatcher.
    b.exit_to_constant_rip(inst.next_rip());
    Ok(())
}

/// 0F 01: only XGETBV (modrm 0xD0) is meaningful in userspace.
pub(crate) fn op_group7(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    if inst.modrm != 0xd0 {
        b.emit_trap(inst.rip, traps::SIGILL, traps::TRAP_UD);
        return Ok(());
    }
    let function = b.read_gpr(x86::gpr::RCX, OpSize::I32, false);
    let value = b.ir.xgetbv(function);
    let eax = b.ir.bfe(OpSize::I32, value, 0, 32);
    let edx = b.ir.bfe(OpSize::I32, value, 32, 32);
    b.write_gpr(x86::gpr::RAX, OpSize::I32, false, eax);
    b.write_gpr(x86::gpr::RDX, OpSize::I32, false, edx);
    Ok(())
}

/// Minimal x87 surface: control-word bookkeeping so runtimes that probe
/// FNINIT/FNSTCW/FLDCW make progress. Everything else traps.
pub(crate) fn op_x87(b: &mut OpDispatchBuilder, inst: &DecodedInst) -> Result<(), DispatchError> {
    let escape = (inst.opcode & 0xff) as u8;
    let reg = (inst.modrm >> 3) & 7;
    let is_mem = inst.rm.is_mem();

    match (escape, reg, inst.modrm) {
        // FNINIT.
        (0xdb, _, 0xe3) => {
            let fcw = b.ir.constant(OpSize::I16, 0x37f);
            b.ir
                .store_context(OpSize::I16, RegClass::Gpr, offsets::fcw(), fcw);
            Ok(())
        }
        // FNSTCW m16.
        (0xd9, 7, _) if is_mem => {
            let DecodedOperand::Mem(mem) = inst.rm else { unreachable!() };
            let addr = b.mem_address(inst, &mem);
            let fcw = b.ir.load_context(OpSize::I16, RegClass::Gpr, offsets::fcw());
            b.mem_store(RegClass::Gpr, OpSize::I16, addr, fcw);
            Ok(())
        }
        // FLDCW m16.
        (0xd9, 5, _) if is_mem => {
            let DecodedOperand::Mem(mem) = inst.rm else { unreachable!() };
            let addr = b.mem_address(inst, &mem);
            let fcw = b.mem_load(RegClass::Gpr, OpSize::I16, addr);
            b.ir
                .store_context(OpSize::I16, RegClass::Gpr, offsets::fcw(), fcw);
            Ok(())
        }
        _ => {
            b.emit_trap(inst.rip, traps::SIGILL, traps::TRAP_UD);
            Ok(())
        }
    }
}
