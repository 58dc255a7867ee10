//! Cache coherency workers: N threads share an array of cache-line-sized
//! records, each record holding one byte counter slot per thread. Every
//! thread hammers its own slot in randomly chosen records and verifies
//! that the sum of its slots matches what it wrote. A drift means the
//! coherency protocol lost an increment.

use core::sync::atomic::{AtomicU8, Ordering};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::Arc;

use crate::report::verdict;
use crate::util::time_us;
use crate::worker::{WorkerBase, WorkerKind, WorkerOutcome, WorkerTask};

/// x^64 + x^63 + x^61 + x^60 + 1; a maximal-period shift feedback, cheap
/// enough to stay in registers and keep the increment loop tight.
const RANDOM_POLYNOMIAL: u64 = 0xD800000000000000;

#[inline(always)]
fn simple_random(seed: u64) -> u64 {
    (seed >> 1) ^ ((seed & 1).wrapping_neg() & RANDOM_POLYNOMIAL)
}

/// The shared record array. Each record spans enough cache lines to give
/// every thread its own byte slot; slots are only ever written by their
/// owning thread, so plain (relaxed) loads and stores suffice and the
/// cache coherency protocol itself is what carries the values between
/// cores.
pub struct CcData {
    buf: *mut u8,
    layout: Layout,
    record_stride: usize,
    line_count: usize,
    slots: usize,
}

unsafe impl Send for CcData {}
unsafe impl Sync for CcData {}

impl CcData {
    pub fn new(line_count: usize, line_size: usize, slots: usize) -> Arc<Self> {
        assert!(line_count > 0 && line_size > 0 && slots > 0);
        // Records hold one byte per thread; spill over into further lines
        // on large-core-count machines.
        let lines_needed = slots.div_ceil(line_size);
        let record_stride = lines_needed * line_size;
        let layout = Layout::from_size_align(record_stride * line_count, line_size)
            .expect("cacheline layout");
        let buf = unsafe { alloc_zeroed(layout) };
        assert!(!buf.is_null());
        Arc::new(Self {
            buf,
            layout,
            record_stride,
            line_count,
            slots,
        })
    }

    pub fn line_count(&self) -> usize {
        self.line_count
    }

    #[inline(always)]
    fn slot(&self, record: usize, offset: usize) -> &AtomicU8 {
        debug_assert!(record < self.line_count && offset < self.slots);
        unsafe { &*(self.buf.add(record * self.record_stride + offset) as *const AtomicU8) }
    }
}

impl Drop for CcData {
    fn drop(&mut self) {
        unsafe { dealloc(self.buf, self.layout) };
    }
}

pub struct CacheCoherencyThread {
    base: WorkerBase,
    data: Arc<CcData>,
    /// Index of this thread within the coherency group (its slot).
    cc_thread_num: usize,
    cc_thread_count: usize,
    inc_count: usize,
}

impl CacheCoherencyThread {
    pub fn new(
        base: WorkerBase,
        data: Arc<CcData>,
        cc_thread_num: usize,
        cc_thread_count: usize,
        inc_count: usize,
    ) -> Self {
        Self {
            base,
            data,
            cc_thread_num,
            cc_thread_count,
            inc_count,
        }
    }

    /// Slot of this thread within `record`. For odd records on odd
    /// threads the index is mirrored, maximizing the physical distance
    /// between a thread's slots on large-core-count systems.
    #[inline(always)]
    fn offset_for(&self, record: usize) -> usize {
        if record & self.cc_thread_num & 1 != 0 {
            (self.cc_thread_count & !1) - self.cc_thread_num
        } else {
            self.cc_thread_num
        }
    }
}

impl WorkerTask for CacheCoherencyThread {
    fn kind(&self) -> WorkerKind {
        WorkerKind::CacheCoherency
    }

    fn work(&mut self) -> WorkerOutcome {
        self.base.pin();
        self.base.start_timer();
        self.base.step.log_debug("starting cache coherency thread");

        let mut r = self.base.rng.gen() | 1;
        let line_count = self.data.line_count();
        let time_start = time_us();
        let mut total_inc: u64 = 0;

        while self.base.is_ready_to_run() {
            for _ in 0..self.inc_count {
                r = simple_random(r);
                let record = (r % line_count as u64) as usize;
                let slot = self.data.slot(record, self.offset_for(record));
                // Owned exclusively by this thread; a plain byte
                // read-modify-write is the point of the test.
                slot.store(slot.load(Ordering::Relaxed).wrapping_add(1), Ordering::Relaxed);
            }
            total_inc += self.inc_count as u64;

            // Read back and reset this thread's slot in every record; the
            // low 8 bits of the sum must equal the increment count.
            let mut sum: u64 = 0;
            for record in 0..line_count {
                let slot = self.data.slot(record, self.offset_for(record));
                sum += slot.load(Ordering::Relaxed) as u64;
                slot.store(0, Ordering::Relaxed);
            }
            if self.base.env.error_injection {
                sum = sum.wrapping_sub(1);
            }

            if sum & 0xff != self.inc_count as u64 & 0xff {
                self.base.error_count += 1;
                self.base.step.add_diagnosis(
                    verdict::CACHE_COHERENCY_FAIL,
                    &format!(
                        "global ({}) and local ({}) cacheline counters do not match",
                        sum, self.inc_count
                    ),
                );
            }
        }

        let elapsed_us = (time_us() - time_start).max(1);
        let inc_rate = total_inc as f64 * 1e6 / elapsed_us as f64;
        let id = self.cc_thread_num;
        self.base.step.add_measurement(
            &format!("Cache Coherency Thread {id} Runtime"),
            "us",
            elapsed_us as f64,
        );
        self.base.step.add_measurement(
            &format!("Cache Coherency Thread {id} Total Increments"),
            "increments",
            total_inc as f64,
        );
        self.base.step.add_measurement(
            &format!("Cache Coherency Thread {id} Increment Rate"),
            "increments/s",
            inc_rate,
        );

        self.base.stop_timer();
        self.base.step.log_debug("finished cache coherency thread");
        self.base.outcome(WorkerKind::CacheCoherency, 0, 0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lfsr_has_long_period_and_no_fixpoint() {
        let mut r = 1u64;
        for _ in 0..10_000 {
            let next = simple_random(r);
            assert_ne!(next, r);
            r = next;
        }
    }

    #[test]
    fn slots_are_per_thread_disjoint() {
        let data = CcData::new(4, 64, 8);
        for record in 0..4 {
            for slot in 0..8 {
                data.slot(record, slot).store(slot as u8, Ordering::Relaxed);
            }
        }
        for record in 0..4 {
            for slot in 0..8 {
                assert_eq!(data.slot(record, slot).load(Ordering::Relaxed), slot as u8);
            }
        }
    }

    #[test]
    fn mirrored_offsets_stay_in_bounds() {
        for count in [2usize, 6, 7, 32] {
            for thread in 0..count {
                for record in 0..5 {
                    let offset = if record & thread & 1 != 0 {
                        (count & !1) - thread
                    } else {
                        thread
                    };
                    assert!(offset < count, "count={count} thread={thread}");
                }
            }
        }
    }
}
