//! Copy worker: the main memory mover. Takes a valid page and an empty
//! page, copies with verification, and returns them with swapped states.

use crate::worker::{WorkerBase, WorkerKind, WorkerOutcome, WorkerTask};

pub struct CopyThread {
    base: WorkerBase,
}

impl CopyThread {
    pub fn new(base: WorkerBase) -> Self {
        Self { base }
    }
}

impl WorkerTask for CopyThread {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Copy
    }

    fn work(&mut self) -> WorkerOutcome {
        self.base.pin();
        self.base.start_timer();
        self.base.step.log_debug(&format!(
            "starting memory copy thread, cpus {:?}, tag 0x{:x}",
            self.base.cpu_mask, self.base.tag
        ));

        let pool = self.base.env.pool.clone();
        let tag = self.base.tag;
        let mut loops = 0u64;
        while self.base.is_ready_to_run() {
            let Some(mut src) = pool.get_valid(tag) else {
                continue;
            };
            let Some(mut dst) = pool.get_empty(tag) else {
                pool.put_valid(src);
                continue;
            };

            // Force errors for unittests.
            if self.base.env.error_injection && self.base.rng.range(0..50000) == 8 {
                let words = self.base.words_of(&src);
                let at = self.base.rng.range(0..words.len() as u64) as usize;
                words[at] ^= 0xba;
            }

            self.base.crc_copy_page(&mut dst, &mut src);

            pool.put_valid(dst);
            pool.put_empty(src);

            // Yield at the end of each copy so copy threads interleave
            // instead of preempting each other mid-kernel and thrashing
            // the caches.
            crate::util::yield_self();
            loops += 1;
        }

        self.base.pages_copied = loops;
        self.base.stop_timer();
        self.base.step.log_debug(&format!(
            "copy thread completed, status {}, {loops} pages copied",
            self.base.ok
        ));
        // Each loop reads one page and writes another.
        let memory_bytes = loops * 2 * self.base.env.page_length as u64;
        self.base.outcome(WorkerKind::Copy, memory_bytes, 0)
    }
}
