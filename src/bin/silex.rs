//! The silex runner: execute a flat x86-64 guest image to completion.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use silex_cli::{build_context, load_flat_image, process_exit_code};

#[derive(Parser)]
#[command(name = "silex", about = "Run a flat x86-64 guest image", version)]
struct Args {
    /// Guest image: raw x86-64 machine code.
    image: PathBuf,

    /// Byte offset of the entry point within the image.
    #[arg(long, default_value_t = 0)]
    entry_offset: u64,

    /// Guest stack size in bytes.
    #[arg(long, default_value_t = 8 * 1024 * 1024)]
    stack_size: usize,

    /// Execution core: `interp` (reference) or `jit`.
    #[arg(long, default_value = "interp")]
    core: String,

    /// Disable TSO-ordered guest memory accesses.
    #[arg(long)]
    no_tso: bool,

    /// Translate one instruction per region (debugging aid).
    #[arg(long)]
    no_multiblock: bool,

    /// Dump guest registers after the run.
    #[arg(long)]
    dump_state: bool,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    match run(Args::parse()) {
        Ok(code) => ExitCode::from(code.rem_euclid(256) as u8),
        Err(error) => {
            eprintln!("silex: {error:#}");
            ExitCode::from(124)
        }
    }
}

fn run(args: Args) -> Result<i32> {
    let guest = load_flat_image(&args.image, args.entry_offset, args.stack_size)?;
    let mut ctx = build_context(&args.core, args.no_tso, args.no_multiblock);
    ctx.init_core(guest.entry, guest.stack_pointer);

    let reason = ctx.run_until_exit();
    let guest_code = ctx.exit_code();
    log::info!("guest finished: {reason:?}, status {guest_code}");

    if args.dump_state {
        let state = ctx.get_cpu_state();
        let names = [
            "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11",
            "r12", "r13", "r14", "r15",
        ];
        for (name, value) in names.iter().zip(state.gregs.iter()) {
            println!("{name:>4} = {value:#018x}");
        }
        println!(" rip = {:#018x}", state.rip);
    }

    Ok(process_exit_code(reason, guest_code))
}
