//! The two-level block lookup cache.
//!
//! L1 is a per-thread direct-mapped table indexed by masked RIP: one paired
//! load, one compare, and the hot path is done. On a miss the shared L2 is
//! consulted: a page-indexed map (`rip >> 12`) of 4096-entry arrays covering
//! every byte offset in the page. Aliasing at either level is detected by
//! comparing the stored guest RIP against the one being looked up.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// One lookup entry, shared between both levels. The layout is load-bearing:
/// generated code fetches the pair with a single 16-byte load.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct BlockCacheEntry {
    pub guest_code: u64,
    pub host_code: u64,
}

/// L1 entry count; power of two so the index mask is cheap.
pub const L1_ENTRIES: usize = 1 << 16;
pub const L1_ENTRIES_MASK: u64 = (L1_ENTRIES as u64) - 1;

const PAGE_SHIFT: u64 = 12;
const PAGE_MASK: u64 = (1 << PAGE_SHIFT) - 1;

/// Shared second level. Cloned wholesale for a forked child.
#[derive(Default)]
pub struct L2Table {
    pages: HashMap<u64, Box<[BlockCacheEntry]>>,
}

impl L2Table {
    fn page_mut(&mut self, page: u64) -> &mut [BlockCacheEntry] {
        self.pages
            .entry(page)
            .or_insert_with(|| vec![BlockCacheEntry::default(); 1 << PAGE_SHIFT].into_boxed_slice())
    }

    fn lookup(&self, rip: u64) -> Option<u64> {
        let page = self.pages.get(&(rip >> PAGE_SHIFT))?;
        let entry = &page[(rip & PAGE_MASK) as usize];
        (entry.guest_code == rip && entry.host_code != 0).then_some(entry.host_code)
    }
}

/// Per-thread lookup front end over the shared L2.
pub struct LookupCache {
    l1: Box<[BlockCacheEntry]>,
    l2: Arc<RwLock<L2Table>>,
}

impl LookupCache {
    pub fn new() -> LookupCache {
        LookupCache {
            l1: vec![BlockCacheEntry::default(); L1_ENTRIES].into_boxed_slice(),
            l2: Arc::new(RwLock::new(L2Table::default())),
        }
    }

    /// A cache sharing another thread's L2 (same address space).
    pub fn with_shared_l2(other: &LookupCache) -> LookupCache {
        LookupCache {
            l1: vec![BlockCacheEntry::default(); L1_ENTRIES].into_boxed_slice(),
            l2: Arc::clone(&other.l2),
        }
    }

    /// Base address and mask of the L1 table, published into `CpuState` so
    /// generated code can probe without calling back into Rust.
    pub fn l1_pointer(&self) -> u64 {
        self.l1.as_ptr() as u64
    }

    pub fn l1_mask(&self) -> u64 {
        L1_ENTRIES_MASK
    }

    pub fn lookup(&mut self, rip: u64) -> Option<u64> {
        let entry = &self.l1[(rip & L1_ENTRIES_MASK) as usize];
        if entry.guest_code == rip && entry.host_code != 0 {
            return Some(entry.host_code);
        }
        // L1 miss: consult the shared table and refill.
        let host = self.l2.read().unwrap().lookup(rip)?;
        self.l1[(rip & L1_ENTRIES_MASK) as usize] =
            BlockCacheEntry { guest_code: rip, host_code: host };
        Some(host)
    }

    pub fn insert(&mut self, rip: u64, host_code: u64) {
        {
            let mut l2 = self.l2.write().unwrap();
            let page = l2.page_mut(rip >> PAGE_SHIFT);
            page[(rip & PAGE_MASK) as usize] = BlockCacheEntry { guest_code: rip, host_code };
        }
        self.l1[(rip & L1_ENTRIES_MASK) as usize] =
            BlockCacheEntry { guest_code: rip, host_code };
    }

    /// Drop one guest RIP from both levels.
    pub fn remove(&mut self, rip: u64) {
        let mut l2 = self.l2.write().unwrap();
        if let Some(page) = l2.pages.get_mut(&(rip >> PAGE_SHIFT)) {
            let entry = &mut page[(rip & PAGE_MASK) as usize];
            if entry.guest_code == rip {
                *entry = BlockCacheEntry::default();
            }
        }
        let l1_entry = &mut self.l1[(rip & L1_ENTRIES_MASK) as usize];
        if l1_entry.guest_code == rip {
            *l1_entry = BlockCacheEntry::default();
        }
    }

    /// Invalidate every entry covering `[start, start + length)`. The
    /// callback sees each evicted guest RIP (AOT bookkeeping, debuggers).
    pub fn invalidate_range(
        &mut self,
        start: u64,
        length: u64,
        mut callback: Option<&mut dyn FnMut(u64)>,
    ) {
        let end = start.saturating_add(length);
        let mut l2 = self.l2.write().unwrap();
        for page_base in (start >> PAGE_SHIFT)..=(end.saturating_sub(1) >> PAGE_SHIFT) {
            let Some(page) = l2.pages.get_mut(&page_base) else {
                continue;
            };
            for entry in page.iter_mut() {
                if entry.host_code == 0 {
                    continue;
                }
                if entry.guest_code >= start && entry.guest_code < end {
                    if let Some(callback) = callback.as_deref_mut() {
                        callback(entry.guest_code);
                    }
                    let l1_entry = &mut self.l1[(entry.guest_code & L1_ENTRIES_MASK) as usize];
                    if l1_entry.guest_code == entry.guest_code {
                        *l1_entry = BlockCacheEntry::default();
                    }
                    *entry = BlockCacheEntry::default();
                }
            }
        }
    }

    /// Wipe everything (full flush; e.g. code-buffer exhaustion).
    pub fn clear(&mut self) {
        self.l1.fill(BlockCacheEntry::default());
        self.l2.write().unwrap().pages.clear();
    }
}

impl Default for LookupCache {
    fn default() -> Self {
        LookupCache::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_lookup() {
        let mut cache = LookupCache::new();
        assert_eq!(cache.lookup(0x1000), None);
        cache.insert(0x1000, 0xdead);
        assert_eq!(cache.lookup(0x1000), Some(0xdead));
    }

    #[test]
    fn l1_alias_falls_back_to_l2() {
        let mut cache = LookupCache::new();
        let a = 0x1000u64;
        let b = a + (L1_ENTRIES as u64); // same L1 slot, different RIP
        cache.insert(a, 1);
        cache.insert(b, 2);
        // b evicted a from L1; both still resolve through L2.
        assert_eq!(cache.lookup(a), Some(1));
        assert_eq!(cache.lookup(b), Some(2));
    }

    #[test]
    fn shared_l2_visible_across_threads_caches() {
        let mut parent = LookupCache::new();
        parent.insert(0x4000, 7);
        let mut child = LookupCache::with_shared_l2(&parent);
        assert_eq!(child.lookup(0x4000), Some(7));
    }

    #[test]
    fn range_invalidation_clears_both_levels() {
        let mut cache = LookupCache::new();
        cache.insert(0x1000, 1);
        cache.insert(0x1008, 2);
        cache.insert(0x3000, 3);
        let mut evicted = Vec::new();
        cache.invalidate_range(0x1000, 0x10, Some(&mut |rip| evicted.push(rip)));
        evicted.sort_unstable();
        assert_eq!(evicted, vec![0x1000, 0x1008]);
        assert_eq!(cache.lookup(0x1000), None);
        assert_eq!(cache.lookup(0x1008), None);
        assert_eq!(cache.lookup(0x3000), Some(3));
    }

    #[test]
    fn remove_single_entry() {
        let mut cache = LookupCache::new();
        cache.insert(0x2000, 9);
        cache.remove(0x2000);
        assert_eq!(cache.lookup(0x2000), None);
    }
}
