//! Exit and signal-event reasons shared between the dispatcher and runtime.

/// Why a guest thread (or the whole context) stopped running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ExitReason {
    None = 0,
    /// Thread is parked waiting to be started or resumed.
    Waiting,
    /// Threads were started asynchronously; the caller did not block.
    AsyncRun,
    /// The guest executed a halting instruction or exit syscall.
    Shutdown,
    /// Stopped under a debugger's request.
    Debug,
    /// Compilation or an internal invariant failed.
    UnknownError,
}

/// Reason latched on a thread before its internal signal is raised.
///
/// The dispatcher inspects this at its loop top (the only suspension point)
/// and transitions to the matching handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum SignalEvent {
    Nothing = 0,
    Pause,
    Stop,
    /// Return into the dispatcher after a guest signal frame was unwound.
    Return,
}

impl SignalEvent {
    pub fn from_u32(value: u32) -> SignalEvent {
        match value {
            1 => SignalEvent::Pause,
            2 => SignalEvent::Stop,
            3 => SignalEvent::Return,
            _ => SignalEvent::Nothing,
        }
    }
}
