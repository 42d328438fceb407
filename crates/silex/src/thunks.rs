//! Thunks: redirecting guest calls into native implementations.
//!
//! A thunk library identifies each exported function with a 256-bit hash;
//! the IR `Thunk` op carries that hash and an argument pointer in guest
//! memory. Dispatch is a registry lookup plus an indirect call.

use std::collections::HashMap;

use silex_ir::ThunkHash;

/// A native thunk entry point. The single argument is the guest argument
/// pack pointer (guest memory is host memory).
pub type ThunkFn = unsafe extern "C" fn(*mut core::ffi::c_void);

#[derive(Default)]
pub struct ThunkRegistry {
    handlers: HashMap<ThunkHash, ThunkFn>,
}

impl ThunkRegistry {
    pub fn new() -> ThunkRegistry {
        ThunkRegistry::default()
    }

    /// Register a batch of `{hash, handler}` pairs (one thunk library).
    pub fn append_thunk_definitions(&mut self, definitions: &[(ThunkHash, ThunkFn)]) {
        for (hash, handler) in definitions {
            if self.handlers.insert(*hash, *handler).is_some() {
                log::warn!("thunk {:02x?} registered twice", &hash[..4]);
            }
        }
    }

    pub fn lookup(&self, hash: &ThunkHash) -> Option<ThunkFn> {
        self.handlers.get(hash).copied()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// C-callable dispatch published through `JitPointers`: `obj` is the
/// registry, `hash_ptr` points at the 32-byte identifier.
pub unsafe extern "C" fn thunk_dispatch(obj: u64, hash_ptr: *const u8, arg: u64) {
    let registry = &*(obj as *const ThunkRegistry);
    let mut hash = [0u8; 32];
    core::ptr::copy_nonoverlapping(hash_ptr, hash.as_mut_ptr(), 32);
    match registry.lookup(&hash) {
        Some(handler) => handler(arg as *mut core::ffi::c_void),
        None => log::error!("guest invoked unregistered thunk {:02x?}", &hash[..8]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static LAST_ARG: AtomicU64 = AtomicU64::new(0);

    unsafe extern "C" fn probe(arg: *mut core::ffi::c_void) {
        LAST_ARG.store(arg as u64, Ordering::SeqCst);
    }

    #[test]
    fn registered_thunk_dispatches() {
        let mut registry = ThunkRegistry::new();
        let hash = [7u8; 32];
        registry.append_thunk_definitions(&[(hash, probe as ThunkFn)]);
        assert_eq!(registry.len(), 1);

        unsafe {
            thunk_dispatch(
                &registry as *const ThunkRegistry as u64,
                hash.as_ptr(),
                0x1234,
            );
        }
        assert_eq!(LAST_ARG.load(Ordering::SeqCst), 0x1234);
    }

    #[test]
    fn unknown_hash_is_tolerated() {
        let registry = ThunkRegistry::new();
        let hash = [9u8; 32];
        unsafe {
            thunk_dispatch(&registry as *const ThunkRegistry as u64, hash.as_ptr(), 0);
        }
    }
}
