//! Guest syscall marshaling.
//!
//! The call boundary is `SyscallHandler::handle_syscall(frame, args)`.
//! Embedders may install their own handler; the built-in one serves the
//! numbers a small static guest needs: passthrough where host and guest
//! agree, emulation where the engine owns the semantics (signals, exits),
//! and `-ENOSYS` with a log line for the long tail.

use std::collections::HashMap;
use std::sync::Arc;

use silex_types::{CpuStateFrame, SyscallArguments};

use crate::signals::{GuestAltStack, GuestSigAction, SignalDelegator, SS_DISABLE};
use crate::thread::ThreadShared;

/// Guest (x86-64 Linux) syscall numbers. These are the guest ABI's numbers
/// regardless of host architecture.
pub mod nr {
    pub const WRITE: u64 = 1;
    pub const MMAP: u64 = 9;
    pub const MUNMAP: u64 = 11;
    pub const RT_SIGACTION: u64 = 13;
    pub const RT_SIGPROCMASK: u64 = 14;
    pub const GETPID: u64 = 39;
    pub const EXIT: u64 = 60;
    pub const UNAME: u64 = 63;
    pub const SIGALTSTACK: u64 = 131;
    pub const GETTID: u64 = 186;
    pub const CLOCK_GETTIME: u64 = 228;
    pub const EXIT_GROUP: u64 = 231;
}

/// The external syscall interface: one call per guest `syscall`.
pub trait SyscallHandler: Send {
    fn handle_syscall(&mut self, frame: &mut CpuStateFrame, args: &SyscallArguments) -> i64;
}

type SyscallFn =
    fn(&mut LinuxSyscallHandler, &mut CpuStateFrame, &SyscallArguments) -> i64;

/// Built-in handler with a per-number dispatch table.
pub struct LinuxSyscallHandler {
    table: HashMap<u64, SyscallFn>,
    delegator: Arc<SignalDelegator>,
}

fn errno_result(ret: i64) -> i64 {
    if ret == -1 {
        -i64::from(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL))
    } else {
        ret
    }
}

impl LinuxSyscallHandler {
    pub fn new(delegator: Arc<SignalDelegator>) -> LinuxSyscallHandler {
        let mut table: HashMap<u64, SyscallFn> = HashMap::new();
        table.insert(nr::WRITE, Self::sys_write);
        table.insert(nr::MMAP, Self::sys_mmap);
        table.insert(nr::MUNMAP, Self::sys_munmap);
        table.insert(nr::RT_SIGACTION, Self::sys_rt_sigaction);
        table.insert(nr::RT_SIGPROCMASK, Self::sys_rt_sigprocmask);
        table.insert(nr::GETPID, Self::sys_getpid);
        table.insert(nr::EXIT, Self::sys_exit);
        table.insert(nr::EXIT_GROUP, Self::sys_exit);
        table.insert(nr::SIGALTSTACK, Self::sys_sigaltstack);
        table.insert(nr::GETTID, Self::sys_gettid);
        table.insert(nr::CLOCK_GETTIME, Self::sys_clock_gettime);
        LinuxSyscallHandler { table, delegator }
    }

    fn sys_write(&mut self, _frame: &mut CpuStateFrame, args: &SyscallArguments) -> i64 {
        let [_, fd, buf, len, ..] = args.argument;
        errno_result(unsafe {
            libc::write(fd as i32, buf as *const libc::c_void, len as usize) as i64
        })
    }

    fn sys_mmap(&mut self, _frame: &mut CpuStateFrame, args: &SyscallArguments) -> i64 {
        let [_, addr, length, prot, flags, fd, offset] = args.argument;
        let ret = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                length as usize,
                prot as i32,
                flags as i32,
                fd as i32,
                offset as libc::off_t,
            )
        };
        if ret == libc::MAP_FAILED {
            errno_result(-1)
        } else {
            ret as i64
        }
    }

    fn sys_munmap(&mut self, _frame: &mut CpuStateFrame, args: &SyscallArguments) -> i64 {
        let [_, addr, length, ..] = args.argument;
        errno_result(unsafe {
            i64::from(libc::munmap(addr as *mut libc::c_void, length as usize))
        })
    }

    fn sys_rt_sigaction(&mut self, _frame: &mut CpuStateFrame, args: &SyscallArguments) -> i64 {
        let [_, signal, act, oldact, ..] = args.argument;
        if signal as usize >= 64 {
            return -i64::from(libc::EINVAL);
        }
        let new_action = if act != 0 {
            Some(unsafe { core::ptr::read(act as *const GuestSigAction) })
        } else {
            None
        };
        let previous = self
            .delegator
            .register_guest_sigaction(signal as usize, new_action);
        if oldact != 0 {
            unsafe { core::ptr::write(oldact as *mut GuestSigAction, previous) };
        }
        0
    }

    fn sys_rt_sigprocmask(
        &mut self,
        _frame: &mut CpuStateFrame,
        _args: &SyscallArguments,
    ) -> i64 {
        // The cooperative delivery model keeps all signals unblocked.
        0
    }

    fn sys_sigaltstack(&mut self, frame: &mut CpuStateFrame, args: &SyscallArguments) -> i64 {
        let [_, ss, old_ss, ..] = args.argument;
        let Some(shared) = (unsafe { ThreadShared::from_frame(frame) }) else {
            return -i64::from(libc::EINVAL);
        };
        let mut altstack = shared.altstack.lock().unwrap();
        if old_ss != 0 {
            unsafe {
                core::ptr::write(old_ss as *mut u64, altstack.sp);
                core::ptr::write((old_ss + 8) as *mut i32, altstack.flags);
                core::ptr::write((old_ss + 16) as *mut u64, altstack.size);
            }
        }
        if ss != 0 {
            let sp = unsafe { core::ptr::read(ss as *const u64) };
            let flags = unsafe { core::ptr::read((ss + 8) as *const i32) };
            let size = unsafe { core::ptr::read((ss + 16) as *const u64) };
            *altstack = GuestAltStack { sp, flags, size };
            if flags & SS_DISABLE != 0 {
                *altstack = GuestAltStack::default();
            }
        }
        0
    }

    fn sys_getpid(&mut self, _frame: &mut CpuStateFrame, _args: &SyscallArguments) -> i64 {
        i64::from(unsafe { libc::getpid() })
    }

    fn sys_gettid(&mut self, _frame: &mut CpuStateFrame, _args: &SyscallArguments) -> i64 {
        // Close enough for single-guest-thread processes.
        i64::from(unsafe { libc::getpid() })
    }

    fn sys_clock_gettime(&mut self, _frame: &mut CpuStateFrame, args: &SyscallArguments) -> i64 {
        let [_, clock, timespec, ..] = args.argument;
        errno_result(unsafe {
            i64::from(libc::clock_gettime(clock as libc::clockid_t, timespec as *mut libc::timespec))
        })
    }

    fn sys_exit(&mut self, frame: &mut CpuStateFrame, args: &SyscallArguments) -> i64 {
        if let Some(shared) = unsafe { ThreadShared::from_frame(frame) } {
            shared
                .exit_code
                .store(args.argument[1] as u32, std::sync::atomic::Ordering::SeqCst);
            shared.control.request_stop();
        }
        0
    }
}

impl SyscallHandler for LinuxSyscallHandler {
    fn handle_syscall(&mut self, frame: &mut CpuStateFrame, args: &SyscallArguments) -> i64 {
        let number = args.argument[0];
        match self.table.get(&number) {
            Some(handler) => handler(self, frame, args),
            None => {
                log::warn!("unimplemented guest syscall {number}");
                -i64::from(libc::ENOSYS)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_syscall_returns_enosys() {
        let delegator = Arc::new(SignalDelegator::new());
        let mut handler = LinuxSyscallHandler::new(delegator);
        let mut frame = CpuStateFrame::new();
        let mut args = SyscallArguments::default();
        args.argument[0] = 9999;
        assert_eq!(
            handler.handle_syscall(&mut frame, &args),
            -i64::from(libc::ENOSYS)
        );
    }

    #[test]
    fn write_to_devnull_passes_through() {
        let devnull = unsafe {
            libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_WRONLY)
        };
        assert!(devnull >= 0);
        let delegator = Arc::new(SignalDelegator::new());
        let mut handler = LinuxSyscallHandler::new(delegator);
        let mut frame = CpuStateFrame::new();
        let payload = b"silex";
        let mut args = SyscallArguments::default();
        args.argument[0] = nr::WRITE;
        args.argument[1] = devnull as u64;
        args.argument[2] = payload.as_ptr() as u64;
        args.argument[3] = payload.len() as u64;
        assert_eq!(handler.handle_syscall(&mut frame, &args), payload.len() as i64);
        unsafe { libc::close(devnull) };
    }

    #[test]
    fn sigaction_registers_with_delegator() {
        let delegator = Arc::new(SignalDelegator::new());
        let mut handler = LinuxSyscallHandler::new(Arc::clone(&delegator));
        let mut frame = CpuStateFrame::new();
        let action = GuestSigAction { handler: 0xabcd, ..Default::default() };
        let mut args = SyscallArguments::default();
        args.argument[0] = nr::RT_SIGACTION;
        args.argument[1] = 10;
        args.argument[2] = &action as *const GuestSigAction as u64;
        assert_eq!(handler.handle_syscall(&mut frame, &args), 0);
        assert_eq!(delegator.guest_action(10).handler, 0xabcd);
    }
}
