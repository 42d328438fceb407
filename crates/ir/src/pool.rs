//! An intrusive thread pool allocator for coarse-grained buffers.
//!
//! The IR arenas are backed by large buffers that individual threads claim,
//! use for a compilation, and then hand back. Claiming and unclaiming are
//! mutex-protected; the fast path, a thread briefly relinquishing a buffer
//! it expects to use again soon, is a single atomic store (`disown`) and a
//! single compare-and-swap (`reown`).
//!
//! Ownership is a three-state machine per buffer:
//!
//! - `FREE`: the pool owns the buffer outright.
//! - `OWNED`: a client owns the buffer; the pool will not touch it.
//! - `DISOWNED`: the client has relinquished the buffer but retains a handle
//!   for cheap re-claim. The pool may steal it for another claimant once it
//!   has sat idle longer than `RECLAIM_DURATION`.
//!
//! The only transitions requiring a CAS are DISOWNED→OWNED (client re-claim)
//! and DISOWNED→FREE (pool reclaim); they race against each other and the
//! CAS decides the winner. Reclamation never touches an OWNED buffer.
//!
//! Pool housekeeping is amortized into claims: each claim sweeps expired
//! disowned buffers back to the free list and frees at most one expired free
//! buffer.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Client-visible ownership flag values.
pub const FLAG_FREE: u32 = 0;
pub const FLAG_OWNED: u32 = 1;
pub const FLAG_DISOWNED: u32 = 3;

/// How long a disowned or free buffer must sit idle before the pool will
/// steal or free it.
const RECLAIM_DURATION: Duration = Duration::from_secs(5);

/// Buffer backing storage. The IR uses anonymous mappings; small consumers
/// can ask for plain heap memory instead.
enum Backing {
    Mmap { ptr: NonNull<u8>, len: usize },
    /// Stored as u64s so consumers can carve 8-byte-aligned structures out
    /// of the buffer, same as the page-aligned mapping path.
    Heap(Box<[u64]>),
}

// The raw mapping is only dereferenced by the owning client.
unsafe impl Send for Backing {}
unsafe impl Sync for Backing {}

impl Backing {
    fn allocate(kind: BackingKind, size: usize) -> Backing {
        match kind {
            BackingKind::Mmap => {
                // Anonymous, private, read-write. Page-size rounding is left
                // to the kernel.
                let ptr = unsafe {
                    rustix::mm::mmap_anonymous(
                        core::ptr::null_mut(),
                        size,
                        rustix::mm::ProtFlags::READ | rustix::mm::ProtFlags::WRITE,
                        rustix::mm::MapFlags::PRIVATE,
                    )
                }
                .expect("anonymous mapping for pool buffer");
                Backing::Mmap {
                    ptr: NonNull::new(ptr.cast::<u8>()).expect("mmap returned null"),
                    len: size,
                }
            }
            BackingKind::Heap => {
                Backing::Heap(vec![0u64; size.div_ceil(8)].into_boxed_slice())
            }
        }
    }

    fn as_ptr(&self) -> *mut u8 {
        match self {
            Backing::Mmap { ptr, .. } => ptr.as_ptr(),
            Backing::Heap(data) => data.as_ptr() as *mut u8,
        }
    }

    fn len(&self) -> usize {
        match self {
            Backing::Mmap { len, .. } => *len,
            Backing::Heap(data) => data.len() * 8,
        }
    }
}

impl Drop for Backing {
    fn drop(&mut self) {
        if let Backing::Mmap { ptr, len } = self {
            // Dropped only once all handles are gone; the region can no
            // longer be referenced.
            unsafe {
                let _ = rustix::mm::munmap(ptr.as_ptr().cast(), *len);
            }
        }
    }
}

/// Which allocation primitive backs buffers from this pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackingKind {
    Mmap,
    Heap,
}

/// One pooled buffer. Shared between the pool's bookkeeping lists and the
/// claiming client's handle.
pub struct MemoryBuffer {
    backing: Backing,
    /// Millisecond timestamp (relative to pool epoch) of the last disown.
    last_used: AtomicU32,
    /// The client's ownership flag, installed at claim time under the pool
    /// mutex. The pool CASes this during reclamation.
    client_flag: Mutex<Option<Arc<AtomicU32>>>,
}

impl MemoryBuffer {
    pub fn as_ptr(&self) -> *mut u8 {
        self.backing.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.backing.len()
    }
}

struct PoolState {
    /// Buffers handed to clients (OWNED or DISOWNED).
    claimed: Vec<Arc<MemoryBuffer>>,
    /// Buffers the pool owns outright (FREE).
    unclaimed: Vec<Arc<MemoryBuffer>>,
}

/// The pool itself. One instance is shared by every thread of a context.
pub struct IntrusivePooledAllocator {
    state: Mutex<PoolState>,
    backing: BackingKind,
    epoch: Instant,
}

impl IntrusivePooledAllocator {
    pub fn new_mmap() -> Arc<IntrusivePooledAllocator> {
        Self::new(BackingKind::Mmap)
    }

    pub fn new_heap() -> Arc<IntrusivePooledAllocator> {
        Self::new(BackingKind::Heap)
    }

    fn new(backing: BackingKind) -> Arc<IntrusivePooledAllocator> {
        Arc::new(IntrusivePooledAllocator {
            state: Mutex::new(PoolState { claimed: Vec::new(), unclaimed: Vec::new() }),
            backing,
            epoch: Instant::now(),
        })
    }

    fn now_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    fn expired(&self, buffer: &MemoryBuffer) -> bool {
        let last = buffer.last_used.load(Ordering::Relaxed);
        let now = self.now_ms();
        now.wrapping_sub(last) as u128 >= RECLAIM_DURATION.as_millis()
    }

    /// Allocate (or reuse) a buffer of at least `size` bytes and mark it
    /// owned by `client_flag`.
    pub fn claim_buffer(&self, size: usize, client_flag: &Arc<AtomicU32>) -> Arc<MemoryBuffer> {
        let mut state = self.state.lock().unwrap();

        self.reclaim_locked(&mut state);

        // Prefer an existing free buffer that is large enough.
        let found = state
            .unclaimed
            .iter()
            .position(|buffer| buffer.len() >= size);
        let buffer = match found {
            Some(idx) => state.unclaimed.swap_remove(idx),
            None => Arc::new(MemoryBuffer {
                backing: Backing::allocate(self.backing, size),
                last_used: AtomicU32::new(self.now_ms()),
                client_flag: Mutex::new(None),
            }),
        };

        *buffer.client_flag.lock().unwrap() = Some(Arc::clone(client_flag));
        client_flag.store(FLAG_OWNED, Ordering::SeqCst);
        state.claimed.push(Arc::clone(&buffer));
        buffer
    }

    /// Return a buffer to the pool outright. The client handle must not be
    /// used again.
    pub fn unclaim_buffer(&self, buffer: &Arc<MemoryBuffer>) {
        let mut state = self.state.lock().unwrap();
        if let Some(flag) = buffer.client_flag.lock().unwrap().take() {
            flag.store(FLAG_FREE, Ordering::SeqCst);
        }
        buffer.last_used.store(self.now_ms(), Ordering::Relaxed);
        if let Some(idx) = state.claimed.iter().position(|b| Arc::ptr_eq(b, buffer)) {
            let buffer = state.claimed.swap_remove(idx);
            state.unclaimed.push(buffer);
        }
    }

    /// Relinquish a buffer while keeping the handle for cheap re-claim.
    /// Mutex-free.
    pub fn disown_buffer(&self, buffer: &Arc<MemoryBuffer>, client_flag: &Arc<AtomicU32>) {
        buffer.last_used.store(self.now_ms(), Ordering::Relaxed);
        client_flag.store(FLAG_DISOWNED, Ordering::SeqCst);
    }

    /// Try to re-own a previously disowned buffer; fall back to a fresh
    /// claim if the pool already stole it.
    pub fn reown_or_claim_buffer(
        &self,
        buffer: &Arc<MemoryBuffer>,
        size: usize,
        client_flag: &Arc<AtomicU32>,
    ) -> Arc<MemoryBuffer> {
        if client_flag
            .compare_exchange(FLAG_DISOWNED, FLAG_OWNED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return Arc::clone(buffer);
        }
        self.claim_buffer(size, client_flag)
    }

    /// Sweep expired disowned buffers back to the free list and free at most
    /// one expired free buffer. Called with the pool mutex held.
    fn reclaim_locked(&self, state: &mut PoolState) {
        let mut idx = 0;
        while idx < state.claimed.len() {
            let steal = {
                let buffer = &state.claimed[idx];
                if !self.expired(buffer) {
                    false
                } else {
                    let flag = buffer.client_flag.lock().unwrap();
                    match flag.as_ref() {
                        Some(flag) => flag
                            .compare_exchange(
                                FLAG_DISOWNED,
                                FLAG_FREE,
                                Ordering::SeqCst,
                                Ordering::SeqCst,
                            )
                            .is_ok(),
                        None => true,
                    }
                }
            };
            if steal {
                let buffer = state.claimed.swap_remove(idx);
                *buffer.client_flag.lock().unwrap() = None;
                state.unclaimed.push(buffer);
            } else {
                idx += 1;
            }
        }

        // Amortized trim: drop at most one expired free buffer per claim so
        // idle threads' memory drains without a dedicated sweeper.
        if let Some(idx) = state
            .unclaimed
            .iter()
            .position(|buffer| self.expired(buffer))
        {
            let buffer = state.unclaimed.swap_remove(idx);
            log::trace!("pool: freeing idle buffer of {} bytes", buffer.len());
            drop(buffer);
        }
    }

    #[cfg(test)]
    fn counts(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap();
        (state.claimed.len(), state.unclaimed.len())
    }
}

/// A fixed-size allocation that rides the pool with disown hysteresis.
///
/// `delayed_disown` only escalates to a full unclaim when the allocation saw
/// fewer than `period_frequency` uses in the last `period`. Hot paths stay
/// on the cheap disown/reown pair; paths that go idle release their memory.
pub struct FixedSizePooledAllocation {
    pool: Arc<IntrusivePooledAllocator>,
    buffer: Option<Arc<MemoryBuffer>>,
    flag: Arc<AtomicU32>,
    size: usize,
    period: Duration,
    period_frequency: u32,
    uses_this_period: u32,
    period_start: Instant,
}

impl FixedSizePooledAllocation {
    pub fn new(
        pool: Arc<IntrusivePooledAllocator>,
        size: usize,
        period: Duration,
        period_frequency: u32,
    ) -> FixedSizePooledAllocation {
        FixedSizePooledAllocation {
            pool,
            buffer: None,
            flag: Arc::new(AtomicU32::new(FLAG_FREE)),
            size,
            period,
            period_frequency,
            uses_this_period: 0,
            period_start: Instant::now(),
        }
    }

    /// Ensure the buffer is owned and return it. Claims on first use and
    /// whenever the pool stole the disowned buffer.
    pub fn reown_or_claim(&mut self) -> Arc<MemoryBuffer> {
        self.uses_this_period = self.uses_this_period.saturating_add(1);
        let buffer = match self.buffer.take() {
            Some(buffer) => self.pool.reown_or_claim_buffer(&buffer, self.size, &self.flag),
            None => self.pool.claim_buffer(self.size, &self.flag),
        };
        self.buffer = Some(Arc::clone(&buffer));
        buffer
    }

    /// True if the current buffer is owned by this client right now.
    pub fn is_owned(&self) -> bool {
        self.flag.load(Ordering::SeqCst) == FLAG_OWNED
    }

    /// Relinquish the buffer, escalating to a full unclaim when the recent
    /// usage frequency has dropped below the configured threshold.
    pub fn delayed_disown(&mut self) {
        let Some(buffer) = self.buffer.as_ref() else {
            return;
        };
        if self.period_start.elapsed() >= self.period {
            if self.uses_this_period < self.period_frequency {
                self.pool.unclaim_buffer(buffer);
                self.buffer = None;
            } else {
                self.pool.disown_buffer(buffer, &self.flag);
            }
            self.uses_this_period = 0;
            self.period_start = Instant::now();
        } else {
            self.pool.disown_buffer(buffer, &self.flag);
        }
    }
}

impl Drop for FixedSizePooledAllocation {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.unclaim_buffer(&buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_marks_owned() {
        let pool = IntrusivePooledAllocator::new_heap();
        let flag = Arc::new(AtomicU32::new(FLAG_FREE));
        let buffer = pool.claim_buffer(4096, &flag);
        assert_eq!(flag.load(Ordering::SeqCst), FLAG_OWNED);
        assert!(buffer.len() >= 4096);
        assert_eq!(pool.counts(), (1, 0));
    }

    #[test]
    fn unclaim_returns_to_pool() {
        let pool = IntrusivePooledAllocator::new_heap();
        let flag = Arc::new(AtomicU32::new(FLAG_FREE));
        let buffer = pool.claim_buffer(4096, &flag);
        pool.unclaim_buffer(&buffer);
        assert_eq!(flag.load(Ordering::SeqCst), FLAG_FREE);
        assert_eq!(pool.counts(), (0, 1));

        // A fresh claim of the same size reuses the free buffer.
        let flag2 = Arc::new(AtomicU32::new(FLAG_FREE));
        let buffer2 = pool.claim_buffer(4096, &flag2);
        assert!(Arc::ptr_eq(&buffer, &buffer2));
    }

    #[test]
    fn reown_after_disown_returns_same_buffer() {
        let pool = IntrusivePooledAllocator::new_heap();
        let flag = Arc::new(AtomicU32::new(FLAG_FREE));
        let buffer = pool.claim_buffer(4096, &flag);
        pool.disown_buffer(&buffer, &flag);
        assert_eq!(flag.load(Ordering::SeqCst), FLAG_DISOWNED);

        let reowned = pool.reown_or_claim_buffer(&buffer, 4096, &flag);
        assert!(Arc::ptr_eq(&buffer, &reowned));
        assert_eq!(flag.load(Ordering::SeqCst), FLAG_OWNED);
    }

    #[test]
    fn reclamation_never_touches_owned() {
        let pool = IntrusivePooledAllocator::new_heap();
        let flag = Arc::new(AtomicU32::new(FLAG_FREE));
        let buffer = pool.claim_buffer(4096, &flag);
        // Backdate the timestamp past the reclaim window.
        buffer
            .last_used
            .store(pool.now_ms().wrapping_sub(60_000), Ordering::Relaxed);

        let flag2 = Arc::new(AtomicU32::new(FLAG_FREE));
        let _other = pool.claim_buffer(4096, &flag2);
        // Still owned: the sweep skipped it despite its age.
        assert_eq!(flag.load(Ordering::SeqCst), FLAG_OWNED);
    }

    #[test]
    fn expired_disowned_buffer_is_stolen() {
        let pool = IntrusivePooledAllocator::new_heap();
        let flag = Arc::new(AtomicU32::new(FLAG_FREE));
        let buffer = pool.claim_buffer(4096, &flag);
        pool.disown_buffer(&buffer, &flag);
        buffer
            .last_used
            .store(pool.now_ms().wrapping_sub(60_000), Ordering::Relaxed);
        assert!(pool.expired(&buffer));

        let flag2 = Arc::new(AtomicU32::new(FLAG_FREE));
        let second = pool.claim_buffer(4096, &flag2);
        assert_eq!(flag.load(Ordering::SeqCst), FLAG_FREE);
        assert!(Arc::ptr_eq(&buffer, &second));
        // The handle holder lost the race and must fall back to a fresh
        // claim.
        let reclaimed = pool.reown_or_claim_buffer(&buffer, 4096, &flag);
        assert!(!Arc::ptr_eq(&buffer, &reclaimed));
    }

    #[test]
    fn fixed_size_wrapper_reuses_buffer_on_hot_path() {
        let pool = IntrusivePooledAllocator::new_heap();
        let mut alloc =
            FixedSizePooledAllocation::new(pool, 4096, Duration::from_secs(3600), 1);
        let first = alloc.reown_or_claim();
        alloc.delayed_disown();
        let second = alloc.reown_or_claim();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(alloc.is_owned());
    }
}
