//! Guest signal delegation.
//!
//! Signals destined for the guest are queued (from host signal handlers or
//! cooperating threads) and delivered at the dispatcher's loop top, the
//! only point where guest state is coherent. Delivery saves the complete
//! guest state, builds a handler frame on the guest stack (honoring the
//! alternate stack and the x86-64 red zone), and points RIP at the guest
//! handler with a return trampoline the dispatcher traps on. Sigreturn
//! pops the saved state.

use std::sync::Mutex;

use silex_types::x86::{self, RED_ZONE_SIZE};
use silex_types::CpuState;

/// Guest-visible `sigaction` record, matching the x86-64 kernel layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct GuestSigAction {
    pub handler: u64,
    pub flags: u64,
    pub restorer: u64,
    pub mask: u64,
}

pub const SA_ONSTACK: u64 = 0x0800_0000;
pub const SA_SIGINFO: u64 = 0x4;

/// Guest `sigaltstack` registration.
#[derive(Clone, Copy, Debug, Default)]
pub struct GuestAltStack {
    pub sp: u64,
    pub flags: i32,
    pub size: u64,
}

pub const SS_DISABLE: i32 = 2;

/// The synthetic RIP a guest signal handler returns to; the dispatcher
/// recognizes it and unwinds to the saved state. Sits in the kernel-reserved
/// hole so no real guest code can collide with it.
pub const GUEST_SIGRETURN_RIP: u64 = 0xffff_ffff_ff60_0000;

/// Same trick for native-to-guest callbacks.
pub const GUEST_CALLBACK_RETURN_RIP: u64 = 0xffff_ffff_ff60_1000;

const MAX_SIGNALS: usize = 64;

/// Process-wide guest signal dispositions.
pub struct SignalDelegator {
    actions: Mutex<[GuestSigAction; MAX_SIGNALS]>,
}

impl SignalDelegator {
    pub fn new() -> SignalDelegator {
        SignalDelegator { actions: Mutex::new([GuestSigAction::default(); MAX_SIGNALS]) }
    }

    /// Guest `rt_sigaction`: install a new action, returning the previous
    /// one.
    pub fn register_guest_sigaction(
        &self,
        signal: usize,
        action: Option<GuestSigAction>,
    ) -> GuestSigAction {
        let mut actions = self.actions.lock().unwrap();
        let previous = actions[signal % MAX_SIGNALS];
        if let Some(action) = action {
            actions[signal % MAX_SIGNALS] = action;
            log::debug!(
                "guest sigaction: signal {signal} handler {:#x} flags {:#x}",
                action.handler,
                action.flags
            );
        }
        previous
    }

    pub fn guest_action(&self, signal: usize) -> GuestSigAction {
        self.actions.lock().unwrap()[signal % MAX_SIGNALS]
    }
}

impl Default for SignalDelegator {
    fn default() -> Self {
        SignalDelegator::new()
    }
}

/// Snapshot of guest state pushed when a signal frame is built; popped on
/// sigreturn. Reentrant delivery stacks these.
pub struct SavedGuestState {
    pub state: Box<CpuState>,
}

/// Build a guest signal frame in `state` for `signal` using `action`.
///
/// Returns false (leaving state untouched) when the action has no handler.
pub fn setup_guest_frame(
    state: &mut CpuState,
    signal: usize,
    action: &GuestSigAction,
    altstack: &GuestAltStack,
) -> bool {
    if action.handler == 0 {
        return false;
    }

    // Pick the stack: alternate when requested and usable.
    let use_altstack = action.flags & SA_ONSTACK != 0
        && altstack.flags & SS_DISABLE == 0
        && altstack.sp != 0;
    let mut rsp = if use_altstack {
        altstack.sp + altstack.size
    } else {
        // Skip the red zone the interrupted code may still be using.
        state.gregs[x86::gpr::RSP as usize] - RED_ZONE_SIZE
    };

    // Return address slot: the sigreturn trampoline RIP we trap on.
    rsp &= !0xf;
    rsp -= 8;
    unsafe {
        core::ptr::write(rsp as *mut u64, GUEST_SIGRETURN_RIP);
    }

    state.gregs[x86::gpr::RSP as usize] = rsp;
    state.gregs[x86::gpr::RDI as usize] = signal as u64;
    // Handlers expecting siginfo get null pointers; the cooperative model
    // carries no sibling context.
    state.gregs[x86::gpr::RSI as usize] = 0;
    state.gregs[x86::gpr::RDX as usize] = 0;
    state.rip = action.handler;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_action_is_empty() {
        let delegator = SignalDelegator::new();
        assert_eq!(delegator.guest_action(10).handler, 0);
    }

    #[test]
    fn register_returns_previous() {
        let delegator = SignalDelegator::new();
        let first = GuestSigAction { handler: 0x1000, ..Default::default() };
        let previous = delegator.register_guest_sigaction(10, Some(first));
        assert_eq!(previous.handler, 0);
        let previous = delegator.register_guest_sigaction(10, None);
        assert_eq!(previous.handler, 0x1000);
    }

    #[test]
    fn frame_setup_honors_red_zone() {
        let mut stack = vec![0u8; 4096];
        let stack_top = stack.as_mut_ptr() as u64 + 4096;

        let mut state = CpuState::default();
        state.gregs[x86::gpr::RSP as usize] = stack_top;
        let action = GuestSigAction { handler: 0x5000, ..Default::default() };
        assert!(setup_guest_frame(&mut state, 12, &action, &GuestAltStack::default()));

        let rsp = state.gregs[x86::gpr::RSP as usize];
        assert!(rsp <= stack_top - RED_ZONE_SIZE - 8);
        assert_eq!(state.rip, 0x5000);
        assert_eq!(state.gregs[x86::gpr::RDI as usize], 12);
        let return_slot = unsafe { core::ptr::read(rsp as *const u64) };
        assert_eq!(return_slot, GUEST_SIGRETURN_RIP);
    }

    #[test]
    fn altstack_used_when_requested() {
        let mut alt = vec![0u8; 8192];
        let alt_base = alt.as_mut_ptr() as u64;

        let mut state = CpuState::default();
        state.gregs[x86::gpr::RSP as usize] = 0xdead_0000;
        let action = GuestSigAction {
            handler: 0x5000,
            flags: SA_ONSTACK,
            ..Default::default()
        };
        let altstack = GuestAltStack { sp: alt_base, flags: 0, size: 8192 };
        assert!(setup_guest_frame(&mut state, 7, &action, &altstack));
        let rsp = state.gregs[x86::gpr::RSP as usize];
        assert!(rsp >= alt_base && rsp < alt_base + 8192);
    }

    #[test]
    fn no_handler_means_no_frame() {
        let mut state = CpuState::default();
        state.gregs[x86::gpr::RSP as usize] = 0x1000;
        assert!(!setup_guest_frame(
            &mut state,
            9,
            &GuestSigAction::default(),
            &GuestAltStack::default()
        ));
        assert_eq!(state.gregs[x86::gpr::RSP as usize], 0x1000);
    }
}
