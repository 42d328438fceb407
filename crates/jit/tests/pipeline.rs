//! Decode -> translate -> optimize -> interpret, without the runtime layer:
//! the compile pipeline the engine drives, exercised directly.

use silex_frontend::{translate_region, Decoder, SliceStream, TranslationConfig};
use silex_ir::passes::PassManager;
use silex_ir::pool::IntrusivePooledAllocator;
use silex_ir::IrEmitter;
use silex_jit::backend::interp::InterpreterBackend;
use silex_jit::{BlockExit, CpuBackend};
use silex_types::{x86, CpuStateFrame};

fn compile_and_run(code: &[u8], base: u64, frame: &mut CpuStateFrame) -> BlockExit {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut emitter = IrEmitter::new(IntrusivePooledAllocator::new_heap());
    let stream = SliceStream { base, bytes: code };
    let region = Decoder::new(&stream).decode_region(base, 256);
    translate_region(&mut emitter, &region, TranslationConfig::default()).expect("translate");

    let mut passes = PassManager::with_default_passes();
    passes.run(&mut emitter).expect("passes");

    let mut backend = InterpreterBackend::new();
    let entry = backend.compile(base, emitter.data(), None).expect("compile");
    unsafe { backend.invoke(entry, frame) }
}

#[test]
fn mov_imm_lands_in_state() {
    let mut frame = CpuStateFrame::new();
    // mov rax, 42; hlt
    let exit = compile_and_run(
        &[0x48, 0xc7, 0xc0, 0x2a, 0x00, 0x00, 0x00, 0xf4],
        0x1000,
        &mut frame,
    );
    assert_eq!(exit, BlockExit::Halt);
    assert_eq!(frame.state.gregs[0], 42);
}

#[test]
fn flags_materialize_across_branches() {
    // mov esi,5; mov edi,3; add esi,edi; cmp edi,esi; jne +2; jmp $; hlt
    let code = [
        0xbe, 0x05, 0x00, 0x00, 0x00, 0xbf, 0x03, 0x00, 0x00, 0x00, 0x01, 0xfe, 0x39, 0xf7,
        0x75, 0x02, 0xeb, 0xfe, 0xf4,
    ];
    let mut frame = CpuStateFrame::new();
    let exit = compile_and_run(&code, 0x4000, &mut frame);
    assert_eq!(exit, BlockExit::Halt);
    assert_eq!(frame.state.gregs[x86::gpr::RSI as usize], 8);
    assert_eq!(frame.state.gregs[x86::gpr::RDI as usize], 3);

    let nzcv = u32::from_le_bytes(
        frame.state.flags[x86::FLAG_NZCV..x86::FLAG_NZCV + 4]
            .try_into()
            .unwrap(),
    );
    // 3 - 8: negative, nonzero, borrow (canonical x86 carry), no overflow.
    assert_eq!(nzcv & (1 << x86::NZCV_Z_BIT), 0);
    assert_ne!(nzcv & (1 << x86::NZCV_N_BIT), 0);
    assert_ne!(nzcv & (1 << x86::NZCV_C_BIT), 0);
    assert_eq!(nzcv & (1 << x86::NZCV_V_BIT), 0);
}

#[test]
fn push_pop_roundtrip_through_stack() {
    // push rax; pop rbx; hlt
    let stack = vec![0u64; 64];
    let mut frame = CpuStateFrame::new();
    frame.state.gregs[x86::gpr::RSP as usize] =
        stack.as_ptr() as u64 + (stack.len() as u64 - 2) * 8;
    frame.state.gregs[x86::gpr::RAX as usize] = 0x1234_5678;

    let exit = compile_and_run(&[0x50, 0x5b, 0xf4], 0x5000, &mut frame);
    assert_eq!(exit, BlockExit::Halt);
    assert_eq!(frame.state.gregs[x86::gpr::RBX as usize], 0x1234_5678);
}

#[test]
fn shifts_update_carry() {
    // mov al, 0x81; shl al, 1; hlt  -> CF = old MSB
    let mut frame = CpuStateFrame::new();
    let exit = compile_and_run(&[0xb0, 0x81, 0xc0, 0xe0, 0x01, 0xf4], 0x6000, &mut frame);
    assert_eq!(exit, BlockExit::Halt);
    assert_eq!(frame.state.gregs[0] & 0xff, 0x02);
    let nzcv = u32::from_le_bytes(
        frame.state.flags[x86::FLAG_NZCV..x86::FLAG_NZCV + 4]
            .try_into()
            .unwrap(),
    );
    assert_ne!(nzcv & (1 << x86::NZCV_C_BIT), 0, "bit shifted out was set");
}

#[test]
fn movzx_and_high_byte_registers() {
    // mov ah, 0x7f; movzx ecx, ah; hlt
    let mut frame = CpuStateFrame::new();
    let exit = compile_and_run(&[0xb4, 0x7f, 0x0f, 0xb6, 0xcc, 0xf4], 0x7000, &mut frame);
    assert_eq!(exit, BlockExit::Halt);
    assert_eq!(frame.state.gregs[x86::gpr::RCX as usize], 0x7f);
    assert_eq!(frame.state.gregs[0] & 0xff00, 0x7f00);
}

#[test]
fn imul_and_division() {
    // mov eax, 100; mov ecx, 7; cdq; idiv ecx; hlt
    // -> eax = 14, edx = 2
    let code = [
        0xb8, 0x64, 0x00, 0x00, 0x00, // mov eax, 100
        0xb9, 0x07, 0x00, 0x00, 0x00, // mov ecx, 7
        0x99, // cdq
        0xf7, 0xf9, // idiv ecx
        0xf4,
    ];
    let mut frame = CpuStateFrame::new();
    let exit = compile_and_run(&code, 0x8000, &mut frame);
    assert_eq!(exit, BlockExit::Halt);
    assert_eq!(frame.state.gregs[0], 14);
    assert_eq!(frame.state.gregs[x86::gpr::RDX as usize], 2);
}

#[test]
fn divide_by_zero_faults() {
    // xor ecx, ecx; mov eax, 1; div ecx
    let code = [0x31, 0xc9, 0xb8, 0x01, 0x00, 0x00, 0x00, 0xf7, 0xf1];
    let mut frame = CpuStateFrame::new();
    let exit = compile_and_run(&code, 0x9000, &mut frame);
    assert_eq!(exit, BlockExit::Fault);
    assert_eq!(frame.synchronous_fault_data.signal, x86::traps::SIGFPE);
    assert_eq!(frame.synchronous_fault_data.trap_no, x86::traps::TRAP_DE);
}

#[test]
fn cmov_takes_and_skips() {
    // cmp rdi, 5; cmovae rax, rdi; hlt
    let code = [0x48, 0x83, 0xff, 0x05, 0x48, 0x0f, 0x43, 0xc7, 0xf4];

    let mut frame = CpuStateFrame::new();
    frame.state.gregs[x86::gpr::RDI as usize] = 9;
    frame.state.gregs[0] = 111;
    assert_eq!(compile_and_run(&code, 0xa000, &mut frame), BlockExit::Halt);
    assert_eq!(frame.state.gregs[0], 9, "9 >= 5 moves");

    let mut frame = CpuStateFrame::new();
    frame.state.gregs[x86::gpr::RDI as usize] = 3;
    frame.state.gregs[0] = 111;
    assert_eq!(compile_and_run(&code, 0xa000, &mut frame), BlockExit::Halt);
    assert_eq!(frame.state.gregs[0], 111, "3 < 5 keeps the old value");
}

#[test]
fn adc_chains_the_carry() {
    // mov rax, -1; add rax, 1 (carry out); mov rbx, 0; adc rbx, 0; hlt
    let code = [
        0x48, 0xc7, 0xc0, 0xff, 0xff, 0xff, 0xff, // mov rax, -1
        0x48, 0x83, 0xc0, 0x01, // add rax, 1
        0x48, 0xc7, 0xc3, 0x00, 0x00, 0x00, 0x00, // mov rbx, 0
        0x48, 0x83, 0xd3, 0x00, // adc rbx, 0
        0xf4,
    ];
    let mut frame = CpuStateFrame::new();
    assert_eq!(compile_and_run(&code, 0xb000, &mut frame), BlockExit::Halt);
    assert_eq!(frame.state.gregs[0], 0);
    assert_eq!(frame.state.gregs[x86::gpr::RBX as usize], 1, "ADC consumed the carry");
}
