//! Per-thread executable code buffers.
//!
//! Each machine backend owns one buffer mapped read-write-execute (with a
//! W^X fallback that flips protections around emission). Emission is a bump
//! pointer; nothing is ever freed individually. A full buffer flushes the
//! thread's block cache and starts over.

use rustix::mm::{self, MprotectFlags, ProtFlags};

#[derive(Debug, thiserror::Error)]
pub enum CodeBufferError {
    #[error("unable to map executable memory: {0}")]
    Map(rustix::io::Errno),
    #[error("code buffer exhausted")]
    Full,
}

pub struct CodeBuffer {
    base: *mut u8,
    size: usize,
    cursor: usize,
    /// Host refused a writable+executable mapping; toggle around writes.
    wx_exclusive: bool,
}

// Only the owning thread emits; executing other threads' buffers never
// happens.
unsafe impl Send for CodeBuffer {}

pub const DEFAULT_CODE_BUFFER_SIZE: usize = 64 * 1024 * 1024;

impl CodeBuffer {
    pub fn new(size: usize) -> Result<CodeBuffer, CodeBufferError> {
        // Try the classic RWX mapping first.
        let rwx = unsafe {
            mm::mmap_anonymous(
                core::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE | ProtFlags::EXEC,
                mm::MapFlags::PRIVATE,
            )
        };
        match rwx {
            Ok(ptr) => Ok(CodeBuffer {
                base: ptr.cast(),
                size,
                cursor: 0,
                wx_exclusive: false,
            }),
            Err(_) => {
                // W^X host: map writable, flip to executable per publish.
                let ptr = unsafe {
                    mm::mmap_anonymous(
                        core::ptr::null_mut(),
                        size,
                        ProtFlags::READ | ProtFlags::WRITE,
                        mm::MapFlags::PRIVATE,
                    )
                }
                .map_err(CodeBufferError::Map)?;
                Ok(CodeBuffer { base: ptr.cast(), size, cursor: 0, wx_exclusive: true })
            }
        }
    }

    pub fn remaining(&self) -> usize {
        self.size - self.cursor
    }

    /// Current emission address.
    pub fn cursor_address(&self) -> u64 {
        self.base as u64 + self.cursor as u64
    }

    fn make_writable(&self) {
        if self.wx_exclusive {
            unsafe {
                let _ = mm::mprotect(
                    self.base.cast(),
                    self.size,
                    MprotectFlags::READ | MprotectFlags::WRITE,
                );
            }
        }
    }

    fn make_executable(&self) {
        if self.wx_exclusive {
            unsafe {
                let _ = mm::mprotect(
                    self.base.cast(),
                    self.size,
                    MprotectFlags::READ | MprotectFlags::EXEC,
                );
            }
        }
    }

    /// Copy `code` into the buffer and return its entry address. The
    /// instruction cache is synchronized before the address is handed out.
    pub fn publish(&mut self, code: &[u8]) -> Result<u64, CodeBufferError> {
        // Keep entries aligned for the benefit of both ISAs' fetch units.
        let aligned = (self.cursor + 15) & !15;
        if aligned + code.len() > self.size {
            return Err(CodeBufferError::Full);
        }
        self.cursor = aligned;
        let entry = self.cursor_address();

        self.make_writable();
        unsafe {
            core::ptr::copy_nonoverlapping(code.as_ptr(), self.base.add(self.cursor), code.len());
        }
        self.make_executable();
        self.cursor += code.len();

        icache::clear(entry as *const u8, code.len());
        Ok(entry)
    }

    /// Patch a previously published site (block linking). The write must be
    /// within the buffer, naturally aligned, and at most 8 bytes so a racing
    /// reader observes either the old or the new word.
    pub fn patch(&mut self, address: u64, bytes: &[u8]) {
        debug_assert!(bytes.len() <= 8);
        debug_assert!(address >= self.base as u64);
        debug_assert!(address + bytes.len() as u64 <= self.base as u64 + self.size as u64);
        self.make_writable();
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
        }
        self.make_executable();
        icache::clear(address as *const u8, bytes.len());
    }

    /// Drop all emitted code. Callers must flush their block caches first.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        unsafe {
            let _ = mm::munmap(self.base.cast(), self.size);
        }
    }
}

/// Instruction/data cache synchronization after writing executable bytes.
pub mod icache {
    #[cfg(target_arch = "aarch64")]
    pub fn clear(start: *const u8, len: usize) {
        // Clean the D-cache to the point of unification, invalidate the
        // I-cache, then barrier. Line size is conservatively 64 bytes.
        const LINE: usize = 64;
        unsafe {
            let begin = start as usize & !(LINE - 1);
            let end = start as usize + len;
            let mut addr = begin;
            while addr < end {
                core::arch::asm!("dc cvau, {addr}", addr = in(reg) addr);
                addr += LINE;
            }
            core::arch::asm!("dsb ish");
            let mut addr = begin;
            while addr < end {
                core::arch::asm!("ic ivau, {addr}", addr = in(reg) addr);
                addr += LINE;
            }
            core::arch::asm!("dsb ish", "isb");
        }
    }

    #[cfg(not(target_arch = "aarch64"))]
    pub fn clear(_start: *const u8, _len: usize) {
        // x86 keeps instruction fetch coherent with stores.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_returns_aligned_addresses() {
        let mut buffer = CodeBuffer::new(64 * 1024).expect("map");
        let first = buffer.publish(&[0xc3]).expect("publish");
        let second = buffer.publish(&[0xc3]).expect("publish");
        assert_eq!(first % 16, 0);
        assert_eq!(second % 16, 0);
        assert_ne!(first, second);
    }

    #[test]
    fn publish_copies_bytes() {
        let mut buffer = CodeBuffer::new(64 * 1024).expect("map");
        let code = [0x48u8, 0xc7, 0xc0, 0x2a, 0x00, 0x00, 0x00, 0xc3];
        let entry = buffer.publish(&code).expect("publish");
        let written = unsafe { core::slice::from_raw_parts(entry as *const u8, code.len()) };
        assert_eq!(written, &code);
    }

    #[test]
    fn exhaustion_reports_full() {
        let mut buffer = CodeBuffer::new(4096).expect("map");
        let blob = [0u8; 1024];
        while buffer.publish(&blob).is_ok() {}
        assert!(matches!(buffer.publish(&blob), Err(CodeBufferError::Full)));
        buffer.reset();
        assert!(buffer.publish(&blob).is_ok());
    }

    #[test]
    fn patch_rewrites_published_code() {
        let mut buffer = CodeBuffer::new(4096).expect("map");
        let entry = buffer.publish(&[0x90, 0x90, 0x90, 0x90]).expect("publish");
        buffer.patch(entry, &[0xcc, 0xcc]);
        let written = unsafe { core::slice::from_raw_parts(entry as *const u8, 4) };
        assert_eq!(written, &[0xcc, 0xcc, 0x90, 0x90]);
    }
}
