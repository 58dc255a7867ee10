//! Fill worker: populates empty pages with random patterns at startup.

use crate::pool::DONT_CARE_TAG;
use crate::worker::{WorkerBase, WorkerKind, WorkerOutcome, WorkerTask};

/// Fills a fixed quota of pages, then exits.
pub struct FillThread {
    base: WorkerBase,
    pages_to_fill: u64,
}

impl FillThread {
    pub fn new(base: WorkerBase, pages_to_fill: u64) -> Self {
        Self {
            base,
            pages_to_fill,
        }
    }
}

impl WorkerTask for FillThread {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Fill
    }

    fn work(&mut self) -> WorkerOutcome {
        self.base.pin();
        self.base.start_timer();
        self.base.step.log_debug("starting memory page fill thread");

        let pool = self.base.env.pool.clone();
        let mut loops = 0;
        while self.base.is_ready_to_run() && loops < self.pages_to_fill {
            let Some(mut page) = pool.get_empty(DONT_CARE_TAG) else {
                self.base
                    .step
                    .add_process_error("fill thread failed to pop pages, exiting");
                self.base.ok = false;
                break;
            };
            if !self.base.fill_page_random(&mut page) {
                pool.put_empty(page);
                self.base.ok = false;
                break;
            }
            pool.put_valid(page);
            loops += 1;
        }

        self.base.pages_copied = loops;
        self.base.stop_timer();
        self.base.step.log_debug(&format!(
            "fill thread completed, status {}, filled {loops} pages",
            self.base.ok
        ));
        let memory_bytes = loops * self.base.env.page_length as u64;
        self.base.outcome(WorkerKind::Fill, memory_bytes, 0)
    }
}
