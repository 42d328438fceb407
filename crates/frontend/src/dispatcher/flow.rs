//! Control flow: branches, calls, returns, traps.

use silex_ir::{CondCode, OpSize};
use silex_types::x86::traps;

use crate::decoder::DecodedInst;
use crate::dispatcher::{DispatchError, OpDispatchBuilder};

pub(crate) fn op_jcc(b: &mut OpDispatchBuilder, inst: &DecodedInst) -> Result<(), DispatchError> {
    let cond = b.condition_value((inst.opcode & 0xf) as u8);
    let zero = b.ir.constant(OpSize::I32, 0);
    b.cond_jump_to_rips(
        CondCode::Neq,
        OpSize::I32,
        cond,
        zero,
        inst.branch_target(),
        inst.next_rip(),
    );
    Ok(())
}

pub(crate) fn op_jmp_rel(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    b.jump_to_rip(inst.branch_target());
    Ok(())
}

pub(crate) fn op_jmp_rm(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    let target = b.load_operand(inst, &inst.rm, OpSize::I64);
    b.exit_to_rip_value(target);
    Ok(())
}

pub(crate) fn op_call_rel(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    let return_rip = b.ir.constant(OpSize::I64, inst.next_rip());
    b.push_value(return_rip);
    // Call targets leave the region; the dispatcher links the edge.
    b.exit_to_constant_rip(inst.branch_target());
    Ok(())
}

pub(crate) fn op_call_rm(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    let target = b.load_operand(inst, &inst.rm, OpSize::I64);
    let return_rip = b.ir.constant(OpSize::I64, inst.next_rip());
    b.push_value(return_rip);
    b.exit_to_rip_value(target);
    Ok(())
}

pub(crate) fn op_ret(b: &mut OpDispatchBuilder, inst: &DecodedInst) -> Result<(), DispatchError> {
    let target = b.pop_value();
    if inst.has_imm && inst.imm != 0 {
        let rsp = b.load_gpr64(silex_types::x86::gpr::RSP);
        let extra = b.ir.constant(OpSize::I64, inst.imm);
        let adjusted = b.ir.add(OpSize::I64, rsp, extra);
        b.store_gpr64(silex_types::x86::gpr::RSP, adjusted);
    }
    b.exit_to_rip_value(target);
    Ok(())
}

pub(crate) fn op_hlt(b: &mut OpDispatchBuilder, inst: &DecodedInst) -> Result<(), DispatchError> {
    // A userspace halt is a clean shutdown request, not a fault.
    b.emit_trap(inst.next_rip(), 0, traps::TRAP_HLT);
    Ok(())
}

pub(crate) fn op_int3(b: &mut OpDispatchBuilder, inst: &DecodedInst) -> Result<(), DispatchError> {
    b.emit_trap(inst.next_rip(), traps::SIGTRAP, traps::TRAP_BP);
    Ok(())
}

pub(crate) fn op_int_imm(
    b: &mut OpDispatchBuilder,
    inst: &DecodedInst,
) -> Result<(), DispatchError> {
    // Software interrupts other than int3 surface as #GP in userspace.
    b.emit_trap(inst.rip, traps::SIGSEGV, traps::TRAP_GP);
    Ok(())
}

pub(crate) fn op_ud2(b: &mut OpDispatchBuilder, inst: &DecodedInst) -> Result<(), DispatchError> {
    b.emit_trap(inst.rip, traps::SIGILL, traps::TRAP_UD);
    Ok(())
}
