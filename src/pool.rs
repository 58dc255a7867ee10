//! The page pool: threadsafe, bias-free random retrieval of pages matching
//! a predicate (empty/valid) and a tag mask, with per-page exclusive
//! ownership between `get` and `put`.
//!
//! The pool is an array of slots, each a try-lock plus a descriptor. `get`
//! walks the array on a linear congruential cycle so that a full traversal
//! visits every slot exactly once from any starting point; a plain linear
//! scan would heavily bias pages at the front of same-state clusters.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crossbeam_utils::CachePadded;
use spin::Mutex as SpinMutex;

use crate::report::TestStep;
use crate::util::{time_us, WyRand};

/// Tag mask indicating no preference.
pub const DONT_CARE_TAG: u32 = u32::MAX;

const STATE_EMPTY: u8 = 0;
const STATE_VALID: u8 = 1;

/// Descriptor of one unit of testable memory.
///
/// The stable identity of a page is `offset / page_length`, its slot index;
/// virtual addresses are recomputed from the region base on each
/// acquisition and never stored here.
#[derive(Debug, Clone)]
pub struct PageDesc {
    /// Byte offset into the test region; multiple of the page length.
    pub offset: usize,
    /// Physical address observed at fill time (for DIMM localization).
    pub paddr: u64,
    /// Index into the pattern catalog; `None` means the page is empty.
    pub pattern: Option<usize>,
    /// NUMA region bitmask (bit i set ⇒ page lies in region i).
    pub tag: u32,
    /// CPU id of the last thread that wrote this page's contents.
    pub last_cpu: u32,
    /// Pattern at the previous acquisition (forensic only).
    pub last_pattern: Option<usize>,
    /// Timestamp of the previous acquisition (forensic only).
    pub ts: u64,
}

impl PageDesc {
    fn new(offset: usize) -> Self {
        Self {
            offset,
            paddr: 0,
            pattern: None,
            tag: DONT_CARE_TAG,
            last_cpu: 0,
            last_pattern: None,
            ts: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.pattern.is_some()
    }
}

/// An exclusively owned page, checked out of the pool.
///
/// The holder owns the page's memory until the matching `put_*` writes the
/// descriptor back and releases the slot.
#[derive(Debug)]
pub struct Page {
    pub slot: usize,
    pub desc: PageDesc,
}

/// Threadsafe random-access page container.
pub trait Pool: Send + Sync {
    /// Locked empty page whose `tag & mask != 0` (or mask is don't-care).
    fn get_empty(&self, tag_mask: u32) -> Option<Page>;
    /// Locked valid page whose `tag & mask != 0` (or mask is don't-care).
    fn get_valid(&self, tag_mask: u32) -> Option<Page>;
    /// Write the descriptor back as empty and release the slot.
    fn put_empty(&self, page: Page);
    /// Write the descriptor back as valid and release the slot.
    fn put_valid(&self, page: Page);

    /// Number of slots.
    fn slots(&self) -> usize;
    fn page_length(&self) -> usize;

    /// Try-lock one specific slot regardless of state (setup/teardown use).
    fn acquire_slot(&self, index: usize) -> Option<Page>;

    /// Slot index of the page containing `paddr`, if any. Does not lock.
    fn find_by_physical(&self, paddr: u64) -> Option<usize>;

    /// Log2-bucketed per-page touch counts (queue-fairness telemetry).
    fn touch_histogram(&self) -> [u64; 32];

    /// Report the touch histogram into the results sink.
    fn analyze(&self, step: &TestStep) {
        let buckets = self.touch_histogram();
        let series = step.series("Queue Analysis: Reads per page", "pages", None);
        for &count in buckets.iter() {
            if count > 0 {
                series.add(count as f64);
            }
        }
    }
}

struct Slot {
    locked: AtomicBool,
    state: AtomicU8,
    tag: AtomicU32,
    paddr: AtomicU64,
    touch: AtomicU32,
    /// Owned by the thread holding `locked`.
    desc: UnsafeCell<PageDesc>,
}

// Access to `desc` is guarded by the `locked` flag.
unsafe impl Sync for Slot {}

impl Slot {
    fn new(offset: usize) -> Self {
        Self {
            locked: AtomicBool::new(false),
            state: AtomicU8::new(STATE_EMPTY),
            tag: AtomicU32::new(DONT_CARE_TAG),
            paddr: AtomicU64::new(0),
            touch: AtomicU32::new(0),
            desc: UnsafeCell::new(PageDesc::new(offset)),
        }
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn unlock(&self) {
        debug_assert!(self.locked.load(Ordering::Relaxed));
        self.locked.store(false, Ordering::Release);
    }
}

/// The default fine-grained pool: one try-lock per slot.
pub struct FineLockPool {
    slots: Box<[Slot]>,
    page_length: usize,
    lcg_a: u64,
    lcg_c: u64,
    lcg_m: u64,
    /// Four generators behind four locks; `get` try-locks across all of
    /// them before falling back to blocking on generator 0, so no single
    /// hot RNG mutex serializes the workers.
    rand: [CachePadded<SpinMutex<u64>>; 4],
}

impl FineLockPool {
    pub fn new(slots: usize, page_length: usize) -> Self {
        assert!(slots > 0);
        let (lcg_a, lcg_c, lcg_m) = lcg_params(slots as u64);
        let slots = (0..slots)
            .map(|i| Slot::new(i * page_length))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            page_length,
            lcg_a,
            lcg_c,
            lcg_m,
            rand: core::array::from_fn(|i| CachePadded::new(SpinMutex::new(i as u64 + 0xbeef))),
        }
    }

    fn random64(&self) -> u64 {
        fn step(seed: &mut u64) -> u64 {
            *seed = seed
                .wrapping_mul(2862933555777941757)
                .wrapping_add(3037000493);
            *seed
        }
        for slot in &self.rand {
            if let Some(mut seed) = slot.try_lock() {
                return step(&mut *seed);
            }
        }
        // All four contended, just wait on the first.
        step(&mut *self.rand[0].lock())
    }

    fn get_with_predicate(&self, want_valid: bool, tag_mask: u32) -> Option<Page> {
        let n = self.slots.len() as u64;
        let want_state = if want_valid { STATE_VALID } else { STATE_EMPTY };

        let first_try = self.random64() % n;
        let mut next_try: u64 = 1;

        for _ in 0..n {
            let index = ((next_try + first_try) % n) as usize;
            // Out-of-bounds values of the (possibly larger) LCG cycle are
            // discarded; each in-range value comes up exactly once.
            next_try = (self.lcg_a.wrapping_mul(next_try) + self.lcg_c) % self.lcg_m;
            while next_try >= n {
                next_try = (self.lcg_a.wrapping_mul(next_try) + self.lcg_c) % self.lcg_m;
            }

            let slot = &self.slots[index];
            // Cheap lock-free pre-checks before the expensive try-lock.
            if slot.state.load(Ordering::Relaxed) != want_state {
                continue;
            }
            if tag_mask != DONT_CARE_TAG && slot.tag.load(Ordering::Relaxed) & tag_mask == 0 {
                continue;
            }
            if !slot.try_lock() {
                continue;
            }
            // The state may have changed before we got the lock.
            let desc = unsafe { &mut *slot.desc.get() };
            let matches = desc.is_valid() == want_valid
                && (tag_mask == DONT_CARE_TAG || desc.tag & tag_mask != 0);
            if !matches {
                slot.unlock();
                continue;
            }
            if want_valid {
                slot.touch.fetch_add(1, Ordering::Relaxed);
                desc.last_pattern = desc.pattern;
                desc.ts = time_us();
            }
            return Some(Page {
                slot: index,
                desc: desc.clone(),
            });
        }
        None
    }

    fn put(&self, page: Page, valid: bool) {
        let slot = &self.slots[page.slot];
        debug_assert!(slot.locked.load(Ordering::Relaxed), "put without get");
        let desc = unsafe { &mut *slot.desc.get() };
        *desc = page.desc;
        if valid {
            debug_assert!(desc.is_valid(), "put_valid of an unpatterned page");
        } else {
            desc.pattern = None;
        }
        slot.tag.store(desc.tag, Ordering::Relaxed);
        slot.paddr.store(desc.paddr, Ordering::Relaxed);
        slot.state.store(
            if valid { STATE_VALID } else { STATE_EMPTY },
            Ordering::Relaxed,
        );
        slot.unlock();
    }
}

impl Pool for FineLockPool {
    fn get_empty(&self, tag_mask: u32) -> Option<Page> {
        self.get_with_predicate(false, tag_mask)
    }

    fn get_valid(&self, tag_mask: u32) -> Option<Page> {
        self.get_with_predicate(true, tag_mask)
    }

    fn put_empty(&self, page: Page) {
        self.put(page, false);
    }

    fn put_valid(&self, page: Page) {
        self.put(page, true);
    }

    fn slots(&self) -> usize {
        self.slots.len()
    }

    fn page_length(&self) -> usize {
        self.page_length
    }

    fn acquire_slot(&self, index: usize) -> Option<Page> {
        let slot = &self.slots[index];
        if !slot.try_lock() {
            return None;
        }
        let desc = unsafe { &*slot.desc.get() };
        Some(Page {
            slot: index,
            desc: desc.clone(),
        })
    }

    fn find_by_physical(&self, paddr: u64) -> Option<usize> {
        let len = self.page_length as u64;
        self.slots.iter().position(|s| {
            let base = s.paddr.load(Ordering::Relaxed);
            base != 0 && base <= paddr && paddr < base + len
        })
    }

    fn touch_histogram(&self) -> [u64; 32] {
        let mut buckets = [0u64; 32];
        for slot in self.slots.iter() {
            let count = slot.touch.load(Ordering::Relaxed);
            let mut b = 0;
            while b < 31 && count >= (1 << b) {
                b += 1;
            }
            buckets[b] += 1;
        }
        buckets
    }
}

/// Single-lock fallback pool for lock-contention benchmarking
/// (`--coarse_grain_lock`). Two lists behind one mutex, random pop.
pub struct CoarsePool {
    inner: std::sync::Mutex<CoarseInner>,
    page_length: usize,
    total: usize,
}

struct CoarseInner {
    empty: Vec<PageDesc>,
    valid: Vec<PageDesc>,
    /// Slots currently checked out (by slot index).
    held: Vec<bool>,
    touch: Vec<u32>,
    rng: WyRand,
}

impl CoarsePool {
    pub fn new(slots: usize, page_length: usize) -> Self {
        assert!(slots > 0);
        Self {
            inner: std::sync::Mutex::new(CoarseInner {
                empty: (0..slots).map(|i| PageDesc::new(i * page_length)).collect(),
                valid: Vec::with_capacity(slots),
                held: vec![false; slots],
                touch: vec![0; slots],
                rng: WyRand::new(0xbeef),
            }),
            page_length,
            total: slots,
        }
    }

    fn pop_matching(list: &mut Vec<PageDesc>, rng: &mut WyRand, tag_mask: u32) -> Option<PageDesc> {
        if list.is_empty() {
            return None;
        }
        let start = rng.range(0..list.len() as u64) as usize;
        for i in 0..list.len() {
            let at = (start + i) % list.len();
            if tag_mask == DONT_CARE_TAG || list[at].tag & tag_mask != 0 {
                return Some(list.swap_remove(at));
            }
        }
        None
    }
}

impl Pool for CoarsePool {
    fn get_empty(&self, tag_mask: u32) -> Option<Page> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        let desc = Self::pop_matching(&mut inner.empty, &mut inner.rng, tag_mask)?;
        let slot = desc.offset / self.page_length;
        inner.held[slot] = true;
        Some(Page { slot, desc })
    }

    fn get_valid(&self, tag_mask: u32) -> Option<Page> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        let mut desc = Self::pop_matching(&mut inner.valid, &mut inner.rng, tag_mask)?;
        let slot = desc.offset / self.page_length;
        inner.held[slot] = true;
        inner.touch[slot] += 1;
        desc.last_pattern = desc.pattern;
        desc.ts = time_us();
        Some(Page { slot, desc })
    }

    fn put_empty(&self, mut page: Page) {
        page.desc.pattern = None;
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.held[page.slot], "put without get");
        inner.held[page.slot] = false;
        inner.empty.push(page.desc);
    }

    fn put_valid(&self, page: Page) {
        debug_assert!(page.desc.is_valid(), "put_valid of an unpatterned page");
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.held[page.slot], "put without get");
        inner.held[page.slot] = false;
        inner.valid.push(page.desc);
    }

    fn slots(&self) -> usize {
        self.total
    }

    fn page_length(&self) -> usize {
        self.page_length
    }

    fn acquire_slot(&self, index: usize) -> Option<Page> {
        let mut inner = self.inner.lock().unwrap();
        if inner.held[index] {
            return None;
        }
        let offset = index * self.page_length;
        let desc = if let Some(at) = inner.empty.iter().position(|d| d.offset == offset) {
            Some(inner.empty.swap_remove(at))
        } else if let Some(at) = inner.valid.iter().position(|d| d.offset == offset) {
            Some(inner.valid.swap_remove(at))
        } else {
            None
        };
        if let Some(desc) = desc {
            inner.held[index] = true;
            return Some(Page { slot: index, desc });
        }
        None
    }

    fn find_by_physical(&self, paddr: u64) -> Option<usize> {
        let len = self.page_length as u64;
        let inner = self.inner.lock().unwrap();
        for list in [&inner.empty, &inner.valid] {
            for d in list.iter() {
                if d.paddr != 0 && d.paddr <= paddr && paddr < d.paddr + len {
                    return Some(d.offset / self.page_length);
                }
            }
        }
        None
    }

    fn touch_histogram(&self) -> [u64; 32] {
        let inner = self.inner.lock().unwrap();
        let mut buckets = [0u64; 32];
        for &count in &inner.touch {
            let mut b = 0;
            while b < 31 && count >= (1 << b) {
                b += 1;
            }
            buckets[b] += 1;
        }
        buckets
    }
}

/// Find `(a, c, m)` for a full-cycle generator `next = (a·next + c) mod m`
/// with `m >= slots` minimal such that the multiplier is nontrivial.
fn lcg_params(slots: u64) -> (u64, u64, u64) {
    if slots < 3 {
        return (1, 1, slots.max(1));
    }
    let mut m = slots;
    let mut a = lcg_a(m);
    // Queue sizes without a nontrivial generator get a larger cycle;
    // out-of-bounds values are discarded during traversal.
    while a == 1 {
        m += 1;
        a = lcg_a(m);
    }
    (a, lcg_c(m), m)
}

/// `a - 1` must be divisible by all prime factors of `m` (and by 4 if 4
/// divides `m`) per Hull–Dobell.
fn lcg_a(m: u64) -> u64 {
    let mut remaining = m;
    let mut a: u64 = if m % 4 == 0 { 2 } else { 1 };
    let mut i = 2;
    while i <= remaining {
        if remaining % i == 0 {
            while remaining % i == 0 {
                remaining /= i;
            }
            a *= i;
        }
        i += 1;
    }
    (a + 1) % m
}

/// The largest prime at most `3m/4`, as a well-mixing increment.
fn lcg_c(m: u64) -> u64 {
    let start = (3 * m) / 4;
    let mut candidate = start;
    while candidate > 1 {
        let mut prime = true;
        let mut i = 2;
        while i * i <= candidate {
            if candidate % i == 0 {
                prime = false;
                break;
            }
            i += 1;
        }
        if prime {
            return candidate;
        }
        candidate -= 1;
    }
    1
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};

    const PAGE: usize = 1024;

    #[test]
    fn lcg_traversal_visits_every_slot_once() {
        for n in (1..48).chain([64, 100, 331, 1000]) {
            let (a, c, m) = lcg_params(n);
            for first in [0u64, 1, n / 2, n - 1] {
                let mut seen = vec![false; n as usize];
                let mut next: u64 = 1;
                for _ in 0..n {
                    let index = ((next + first) % n) as usize;
                    next = (a * next + c) % m;
                    while next >= n {
                        next = (a * next + c) % m;
                    }
                    assert!(!seen[index], "n={n} revisited {index}");
                    seen[index] = true;
                }
                assert!(seen.iter().all(|&s| s), "n={n} start={first}");
            }
        }
    }

    #[test]
    fn get_put_preserves_page_count() {
        let pool = FineLockPool::new(64, PAGE);
        let mut pages = Vec::new();
        while let Some(page) = pool.get_empty(DONT_CARE_TAG) {
            pages.push(page);
        }
        assert_eq!(pages.len(), 64);
        // All slots are owned now; nothing left of either state.
        assert!(pool.get_empty(DONT_CARE_TAG).is_none());
        assert!(pool.get_valid(DONT_CARE_TAG).is_none());
        for mut page in pages.drain(..) {
            page.desc.pattern = Some(0);
            pool.put_valid(page);
        }
        let mut count = 0;
        while pool.get_valid(DONT_CARE_TAG).is_some() {
            // Pages stay checked out, so this drains exactly once.
            count += 1;
            if count > 64 {
                break;
            }
        }
        assert_eq!(count, 64);
    }

    #[test]
    fn state_is_rechecked_under_lock() {
        let pool = FineLockPool::new(8, PAGE);
        let mut page = pool.get_empty(DONT_CARE_TAG).unwrap();
        page.desc.pattern = Some(3);
        pool.put_valid(page);
        let page = pool.get_valid(DONT_CARE_TAG).unwrap();
        assert_eq!(page.desc.pattern, Some(3));
        pool.put_empty(page);
        assert!(pool.get_valid(DONT_CARE_TAG).is_none());
    }

    #[test]
    fn tag_mask_filters_pages() {
        let pool = FineLockPool::new(16, PAGE);
        for i in 0..16 {
            let mut page = pool.acquire_slot(i).unwrap();
            page.desc.tag = if i < 8 { 0b01 } else { 0b10 };
            page.desc.pattern = Some(0);
            pool.put_valid(page);
        }
        let mut held = Vec::new();
        for _ in 0..8 {
            let page = pool.get_valid(0b01).unwrap();
            assert_eq!(page.desc.tag, 0b01);
            // Keep them out so the next get finds another one.
            held.push(page);
        }
        assert!(pool.get_valid(0b01).is_none());
        assert!(pool.get_valid(0b10).is_some());
    }

    #[test]
    fn exclusive_ownership_across_threads() {
        let pool = Arc::new(FineLockPool::new(32, PAGE));
        let barrier = Arc::new(Barrier::new(4));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                let barrier = barrier.clone();
                let in_flight = in_flight.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..2000 {
                        if let Some(page) = pool.get_empty(DONT_CARE_TAG) {
                            let holders = in_flight.fetch_add(1, Ordering::SeqCst);
                            assert!(holders < 32);
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                            pool.put_empty(page);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        // Conservation: every slot is back and unowned.
        let mut count = 0;
        while pool.get_empty(DONT_CARE_TAG).is_some() {
            count += 1;
            if count > 32 {
                break;
            }
        }
        assert_eq!(count, 32);
    }

    #[test]
    fn fair_traversal_touches_all_slots() {
        let pool = FineLockPool::new(64, PAGE);
        for i in 0..64 {
            let mut page = pool.acquire_slot(i).unwrap();
            page.desc.pattern = Some(0);
            pool.put_valid(page);
        }
        for _ in 0..64 * 64 {
            let page = pool.get_valid(DONT_CARE_TAG).unwrap();
            pool.put_valid(page);
        }
        let hist = pool.touch_histogram();
        // Mean is 64 touches; within a factor of two means bucket 6..=8.
        let outliers: u64 = hist[..5].iter().chain(&hist[9..]).sum();
        assert_eq!(outliers, 0, "histogram {hist:?}");
    }

    #[test]
    fn find_by_physical_locates_slot() {
        let pool = FineLockPool::new(4, PAGE);
        let mut page = pool.acquire_slot(2).unwrap();
        page.desc.paddr = 0x4000_0000;
        page.desc.pattern = Some(0);
        pool.put_valid(page);
        assert_eq!(pool.find_by_physical(0x4000_0000 + 17), Some(2));
        assert_eq!(pool.find_by_physical(0x5000_0000), None);
    }

    #[test]
    fn coarse_pool_behaves_like_fine_pool() {
        let pool = CoarsePool::new(16, PAGE);
        let mut pages = Vec::new();
        while let Some(page) = pool.get_empty(DONT_CARE_TAG) {
            pages.push(page);
        }
        assert_eq!(pages.len(), 16);
        for (i, mut page) in pages.drain(..).enumerate() {
            page.desc.pattern = Some(i % 3);
            pool.put_valid(page);
        }
        let page = pool.get_valid(DONT_CARE_TAG).unwrap();
        assert!(page.desc.is_valid());
        pool.put_empty(page);
        assert_eq!(pool.slots(), 16);
    }
}
