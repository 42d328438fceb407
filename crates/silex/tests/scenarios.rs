//! End-to-end scenarios: inline guest code run through the full pipeline
//! (decode -> IR -> passes -> backend -> block cache -> dispatcher) with
//! the reference backend.

use std::sync::atomic::Ordering;

use silex::{Context, ExitReason, GuestSigAction};
use silex_types::x86;

/// A guest program: executable bytes plus a stack, both owned so addresses
/// stay valid for the run.
struct Guest {
    code: Vec<u8>,
    #[allow(dead_code)]
    stack: Vec<u64>,
    ctx: Box<Context>,
}

impl Guest {
    fn new(code: Vec<u8>) -> Guest {
        let _ = env_logger::builder().is_test(true).try_init();
        let stack = vec![0u64; 16 * 1024];
        let mut ctx = Context::create_new_context();
        ctx.initialize_context();
        let rip = code.as_ptr() as u64;
        let stack_top = (stack.as_ptr() as u64 + (stack.len() as u64 - 16) * 8) & !0xf;
        ctx.init_core(rip, stack_top);
        Guest { code, stack, ctx }
    }

    fn rip(&self, offset: usize) -> u64 {
        self.code.as_ptr() as u64 + offset as u64
    }

    fn run(&mut self) -> ExitReason {
        self.ctx.run_until_exit()
    }

    fn greg(&self, reg: u32) -> u64 {
        self.ctx.get_cpu_state().gregs[reg as usize]
    }

    fn zf(&self) -> bool {
        let state = self.ctx.get_cpu_state();
        let nzcv = u32::from_le_bytes(
            state.flags[x86::FLAG_NZCV..x86::FLAG_NZCV + 4]
                .try_into()
                .expect("nzcv"),
        );
        nzcv & (1 << x86::NZCV_Z_BIT) != 0
    }
}

/// S1: `mov rax, 42; hlt`.
#[test]
fn s1_mov_then_halt() {
    let mut guest = Guest::new(vec![0x48, 0xc7, 0xc0, 0x2a, 0x00, 0x00, 0x00, 0xf4]);
    assert_eq!(guest.run(), ExitReason::Shutdown);
    assert_eq!(guest.greg(x86::gpr::RAX), 42);
}

/// S2: arithmetic plus a conditional branch over a trap-loop.
/// `mov esi,5; mov edi,3; add esi,edi; cmp edi,esi; jne +2; jmp $; hlt`
#[test]
fn s2_arithmetic_and_branch() {
    let mut guest = Guest::new(vec![
        0xbe, 0x05, 0x00, 0x00, 0x00, // mov esi, 5
        0xbf, 0x03, 0x00, 0x00, 0x00, // mov edi, 3
        0x01, 0xfe, // add esi, edi
        0x39, 0xf7, // cmp edi, esi
        0x75, 0x02, // jne +2 (taken: 3 != 8)
        0xeb, 0xfe, // jmp $ (never reached)
        0xf4, // hlt
    ]);
    assert_eq!(guest.run(), ExitReason::Shutdown);
    assert_eq!(guest.greg(x86::gpr::RSI), 8);
    assert_eq!(guest.greg(x86::gpr::RDI), 3);
    assert!(!guest.zf(), "3 != 8 must leave ZF clear");
}

/// S3: `lock cmpxchg` success and failure against known memory.
#[test]
fn s3_atomic_cas() {
    // lock cmpxchg [rdi], rsi ; hlt
    let code = vec![0xf0, 0x48, 0x0f, 0xb1, 0x37, 0xf4];

    // Success: memory holds the expected value.
    {
        let cell = Box::new(5u64);
        let cell_addr = &*cell as *const u64 as u64;
        let mut guest = Guest::new(code.clone());
        let mut state = guest.ctx.get_cpu_state();
        state.gregs[x86::gpr::RDI as usize] = cell_addr;
        state.gregs[x86::gpr::RAX as usize] = 5; // expected
        state.gregs[x86::gpr::RSI as usize] = 9; // desired
        guest.ctx.set_cpu_state(&state);

        assert_eq!(guest.run(), ExitReason::Shutdown);
        assert_eq!(*cell, 9, "successful CAS stores the new value");
        assert!(guest.zf(), "successful CAS sets ZF");
        assert_eq!(guest.greg(x86::gpr::RAX), 5);
    }

    // Failure: memory differs; RAX observes the live value.
    {
        let cell = Box::new(7u64);
        let cell_addr = &*cell as *const u64 as u64;
        let mut guest = Guest::new(code.clone());
        let mut state = guest.ctx.get_cpu_state();
        state.gregs[x86::gpr::RDI as usize] = cell_addr;
        state.gregs[x86::gpr::RAX as usize] = 5;
        state.gregs[x86::gpr::RSI as usize] = 9;
        guest.ctx.set_cpu_state(&state);

        assert_eq!(guest.run(), ExitReason::Shutdown);
        assert_eq!(*cell, 7, "failed CAS leaves memory unchanged");
        assert!(!guest.zf(), "failed CAS clears ZF");
        assert_eq!(guest.greg(x86::gpr::RAX), 7);
    }
}

/// S4: self-modifying code. The entry block patches its own immediate and
/// re-enters itself through the dispatcher; the stale block must be
/// invalidated and the modified path must run.
#[test]
fn s4_self_modifying_code() {
    let mut code = vec![0u8; 36];
    code[0..5].copy_from_slice(&[0xb8, 0x01, 0x00, 0x00, 0x00]); // mov eax, 1
    code[5..7].copy_from_slice(&[0x48, 0xbb]); // mov rbx, imm64
    // imm filled below (address of the patchable byte at offset 1)
    code[15..18].copy_from_slice(&[0xc6, 0x03, 0x02]); // mov byte [rbx], 2
    code[18..21].copy_from_slice(&[0x83, 0xf8, 0x02]); // cmp eax, 2
    code[21..23].copy_from_slice(&[0x74, 0x0c]); // je +12 -> hlt
    code[23..25].copy_from_slice(&[0x48, 0xb9]); // mov rcx, imm64
    code[33..35].copy_from_slice(&[0xff, 0xe1]); // jmp rcx
    code[35] = 0xf4; // hlt

    let patch_addr = code.as_ptr() as u64 + 1;
    let entry_addr = code.as_ptr() as u64;
    code[7..15].copy_from_slice(&patch_addr.to_le_bytes());
    code[25..33].copy_from_slice(&entry_addr.to_le_bytes());

    let mut guest = Guest::new(code);
    assert_eq!(guest.run(), ExitReason::Shutdown);
    // Second pass ran the patched immediate.
    assert_eq!(guest.greg(x86::gpr::RAX), 2);
    assert_eq!(guest.code[1], 2, "the guest patched its own code");
}

/// S5: guest signal delivery from a cooperating thread. The handler flips
/// the flag the main loop spins on, then sigreturns.
#[test]
fn s5_signal_delivery() {
    let flag = Box::new(0u8);
    let flag_addr = &*flag as *const u8 as u64;

    // Main loop at 0, handler at 32.
    let mut code = vec![0u8; 40];
    code[0..3].copy_from_slice(&[0x80, 0x3b, 0x00]); // cmp byte [rbx], 0
    code[3..5].copy_from_slice(&[0x75, 0x0c]); // jne +12 -> hlt at 17
    code[5..7].copy_from_slice(&[0x48, 0xb8]); // mov rax, imm64 (loop top)
    code[15..17].copy_from_slice(&[0xff, 0xe0]); // jmp rax
    code[17] = 0xf4; // hlt
    // Handler: set the flag, return (into the sigreturn trampoline).
    code[32..35].copy_from_slice(&[0xc6, 0x03, 0x01]); // mov byte [rbx], 1
    code[35] = 0xc3; // ret

    let entry = code.as_ptr() as u64;
    code[7..15].copy_from_slice(&entry.to_le_bytes());

    let mut guest = Guest::new(code);
    let handler_rip = guest.rip(32);
    let mut state = guest.ctx.get_cpu_state();
    state.gregs[x86::gpr::RBX as usize] = flag_addr;
    guest.ctx.set_cpu_state(&state);

    guest.ctx.signal_delegator().register_guest_sigaction(
        10,
        Some(GuestSigAction { handler: handler_rip, ..Default::default() }),
    );

    let shared = guest.ctx.main_thread_shared().expect("thread exists");
    let raiser = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(30));
        shared.control.queue_guest_signal(10);
    });

    assert_eq!(guest.run(), ExitReason::Shutdown);
    raiser.join().expect("raiser");
    assert_eq!(*flag, 1, "guest handler ran");
    // The spin loop resumed after sigreturn and observed the flag.
    assert_eq!(guest.greg(x86::gpr::RAX), entry);
}

/// S6: lazy PF round trip: `test al, al; setp dl; hlt` across several AL
/// values.
#[test]
fn s6_lazy_parity_flag() {
    for (al, expected_pf) in
        [(0u8, 1u64), (1, 0), (2, 0), (3, 1), (0xff, 1)]
    {
        let mut guest = Guest::new(vec![
            0x84, 0xc0, // test al, al
            0x0f, 0x9a, 0xc2, // setp dl
            0xf4, // hlt
        ]);
        let mut state = guest.ctx.get_cpu_state();
        state.gregs[x86::gpr::RAX as usize] = u64::from(al);
        guest.ctx.set_cpu_state(&state);

        assert_eq!(guest.run(), ExitReason::Shutdown);
        assert_eq!(
            guest.greg(x86::gpr::RDX) & 0xff,
            expected_pf,
            "PF for al={al:#x}"
        );
    }
}

/// Guest exit syscall reports its status through the context.
#[test]
fn exit_syscall_stops_the_thread() {
    // mov eax, 60 (exit); mov edi, 7; syscall
    let mut guest = Guest::new(vec![
        0xb8, 0x3c, 0x00, 0x00, 0x00, // mov eax, 60
        0xbf, 0x07, 0x00, 0x00, 0x00, // mov edi, 7
        0x0f, 0x05, // syscall
        0xf4, // hlt (not reached)
    ]);
    assert_eq!(guest.run(), ExitReason::Shutdown);
    assert_eq!(guest.ctx.exit_code(), 7);
}

/// Unknown opcodes surface as a guest SIGILL; with no handler registered
/// the thread shuts down.
#[test]
fn invalid_opcode_terminates() {
    let mut guest = Guest::new(vec![0x90, 0x82, 0x00]);
    assert_eq!(guest.run(), ExitReason::Shutdown);
}

/// Loops, calls, and returns: a small function called twice.
#[test]
fn call_ret_roundtrip() {
    // main: call f; call f; hlt    f: inc rax; ret
    let mut code = vec![0u8; 32];
    code[0..5].copy_from_slice(&[0xe8, 0x06, 0x00, 0x00, 0x00]); // call +6 -> f at 11
    code[5..10].copy_from_slice(&[0xe8, 0x01, 0x00, 0x00, 0x00]); // call +1 -> f
    code[10] = 0xf4; // hlt
    code[11..14].copy_from_slice(&[0x48, 0xff, 0xc0]); // inc rax
    code[14] = 0xc3; // ret

    let mut guest = Guest::new(code);
    assert_eq!(guest.run(), ExitReason::Shutdown);
    assert_eq!(guest.greg(x86::gpr::RAX), 2);
}

/// REP STOSB fills memory with the direction flag honored.
#[test]
fn rep_stos_fills_buffer() {
    let buffer = vec![0u8; 64];
    let buffer_addr = buffer.as_ptr() as u64;

    // rep stosb; hlt
    let mut guest = Guest::new(vec![0xf3, 0xaa, 0xf4]);
    let mut state = guest.ctx.get_cpu_state();
    state.gregs[x86::gpr::RDI as usize] = buffer_addr;
    state.gregs[x86::gpr::RAX as usize] = 0xab;
    state.gregs[x86::gpr::RCX as usize] = 64;
    guest.ctx.set_cpu_state(&state);

    assert_eq!(guest.run(), ExitReason::Shutdown);
    assert!(buffer.iter().all(|&byte| byte == 0xab));
    assert_eq!(guest.greg(x86::gpr::RCX), 0);
    assert_eq!(guest.greg(x86::gpr::RDI), buffer_addr + 64);
}

/// CPUID leaf 0 returns the engine's vendor string.
#[test]
fn cpuid_vendor_string() {
    // xor eax, eax; cpuid; hlt
    let mut guest = Guest::new(vec![0x31, 0xc0, 0x0f, 0xa2, 0xf4]);
    assert_eq!(guest.run(), ExitReason::Shutdown);
    let mut vendor = Vec::new();
    vendor.extend_from_slice(&(guest.greg(x86::gpr::RBX) as u32).to_le_bytes());
    vendor.extend_from_slice(&(guest.greg(x86::gpr::RDX) as u32).to_le_bytes());
    vendor.extend_from_slice(&(guest.greg(x86::gpr::RCX) as u32).to_le_bytes());
    assert_eq!(&vendor, b"SilexVirtCPU");
}

/// Invalidation flushes cached blocks and reports them to the callback.
#[test]
fn invalidate_range_reports_blocks() {
    let mut guest = Guest::new(vec![0x48, 0xc7, 0xc0, 0x2a, 0x00, 0x00, 0x00, 0xf4]);
    let entry = guest.rip(0);
    assert!(guest.ctx.compile_rip(entry));

    let mut seen = Vec::new();
    guest
        .ctx
        .invalidate_guest_code_range(entry, 16, Some(&mut |rip| seen.push(rip)));
    assert_eq!(seen, vec![entry]);
}

/// The write syscall reaches the host: used as the standard-library probe.
#[test]
fn write_syscall_passthrough() {
    // mov eax,1; mov edi,1? write to /dev/null instead: fd from host open.
    let devnull = unsafe {
        libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_WRONLY)
    };
    assert!(devnull >= 0);

    let payload = b"hello from the guest";
    let payload_addr = payload.as_ptr() as u64;

    let mut guest = Guest::new(vec![
        0xb8, 0x01, 0x00, 0x00, 0x00, // mov eax, 1 (write)
        0x0f, 0x05, // syscall
        0xf4, // hlt
    ]);
    let mut state = guest.ctx.get_cpu_state();
    state.gregs[x86::gpr::RDI as usize] = devnull as u64;
    state.gregs[x86::gpr::RSI as usize] = payload_addr;
    state.gregs[x86::gpr::RDX as usize] = payload.len() as u64;
    guest.ctx.set_cpu_state(&state);

    assert_eq!(guest.run(), ExitReason::Shutdown);
    assert_eq!(guest.greg(x86::gpr::RAX), payload.len() as u64);
    unsafe { libc::close(devnull) };
}

/// Ensure exit codes propagate through shared state even when observed from
/// another thread.
#[test]
fn shared_control_observes_exit() {
    let mut guest = Guest::new(vec![
        0xb8, 0x3c, 0x00, 0x00, 0x00, // mov eax, 60
        0xbf, 0x2a, 0x00, 0x00, 0x00, // mov edi, 42
        0x0f, 0x05, // syscall
    ]);
    let shared = guest.ctx.main_thread_shared().expect("thread");
    assert_eq!(guest.run(), ExitReason::Shutdown);
    assert_eq!(shared.exit_code.load(Ordering::SeqCst), 42);
}
