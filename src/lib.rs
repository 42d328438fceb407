//! Support library for the `silex` command-line runner: flat-image loading
//! and engine setup shared with the binary's tests.

use anyhow::{Context as _, Result};
use silex::{options, Context, ExitReason};

/// A loaded flat guest image plus its stack. Addresses stay stable for the
/// lifetime of the run.
pub struct LoadedGuest {
    #[allow(dead_code)]
    image: Vec<u8>,
    #[allow(dead_code)]
    stack: Vec<u64>,
    pub entry: u64,
    pub stack_pointer: u64,
}

/// Read a flat binary image. No ELF parsing here: images are raw x86-64
/// code executed from offset `entry_offset`.
pub fn load_flat_image(path: &std::path::Path, entry_offset: u64, stack_bytes: usize) -> Result<LoadedGuest> {
    let image = std::fs::read(path)
        .with_context(|| format!("reading guest image {}", path.display()))?;
    anyhow::ensure!(!image.is_empty(), "guest image is empty");
    anyhow::ensure!(
        entry_offset < image.len() as u64,
        "entry offset {entry_offset:#x} outside the image"
    );

    let stack = vec![0u64; stack_bytes.div_ceil(8)];
    let entry = image.as_ptr() as u64 + entry_offset;
    let stack_pointer =
        (stack.as_ptr() as u64 + (stack.len() as u64).saturating_sub(16) * 8) & !0xf;
    Ok(LoadedGuest { image, stack, entry, stack_pointer })
}

/// Build a configured engine context for a run.
pub fn build_context(core: &str, disable_tso: bool, disable_multiblock: bool) -> Box<Context> {
    let mut ctx = Context::create_new_context();
    ctx.config.set(options::CORE, core);
    if disable_tso {
        ctx.config.set(options::TSO_ENABLED, "0");
    }
    if disable_multiblock {
        ctx.config.set(options::MULTIBLOCK, "0");
    }
    ctx.initialize_context();
    ctx
}

/// Map an engine exit reason to a process exit code.
pub fn process_exit_code(reason: ExitReason, guest_code: u32) -> i32 {
    match reason {
        ExitReason::Shutdown => guest_code as i32,
        ExitReason::None | ExitReason::Waiting | ExitReason::AsyncRun | ExitReason::Debug => 0,
        ExitReason::UnknownError => 125,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_mapping() {
        assert_eq!(process_exit_code(ExitReason::Shutdown, 3), 3);
        assert_eq!(process_exit_code(ExitReason::UnknownError, 0), 125);
    }

    #[test]
    fn flat_image_rejects_bad_entry() {
        let dir = std::env::temp_dir().join("silex-cli-test-image");
        std::fs::write(&dir, [0xf4u8]).expect("write");
        assert!(load_flat_image(&dir, 4, 4096).is_err());
        assert!(load_flat_image(&dir, 0, 4096).is_ok());
        let _ = std::fs::remove_file(&dir);
    }
}
