//! Check worker: CRC-verifies valid pages. While the run is on, checked
//! pages go back as valid; during teardown they are dropped to empty so
//! the pool drains and every page gets a final verification.

use crate::pool::DONT_CARE_TAG;
use crate::worker::{WorkerBase, WorkerKind, WorkerOutcome, WorkerTask};

pub struct CheckThread {
    base: WorkerBase,
}

impl CheckThread {
    pub fn new(base: WorkerBase) -> Self {
        Self { base }
    }
}

impl WorkerTask for CheckThread {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Check
    }

    fn work(&mut self) -> WorkerOutcome {
        self.base.pin();
        self.base.start_timer();
        self.base.step.log_debug("starting check thread");

        let pool = self.base.env.pool.clone();
        let mut loops = 0u64;
        loop {
            let running = self.base.is_ready_to_run_no_pause();
            let Some(page) = pool.get_valid(DONT_CARE_TAG) else {
                if running {
                    // Nothing suitable right now; try again.
                    continue;
                }
                // Stopped and the pool is drained of valid pages.
                break;
            };

            self.base.crc_check_page(&page);

            if self.base.is_ready_to_run_no_pause() {
                pool.put_valid(page);
            } else {
                pool.put_empty(page);
            }
            loops += 1;
        }

        self.base.pages_copied = loops;
        self.base.stop_timer();
        self.base.step.log_debug(&format!(
            "check thread completed, status {}, {loops} pages checked",
            self.base.ok
        ));
        let memory_bytes = loops * self.base.env.page_length as u64;
        self.base.outcome(WorkerKind::Check, memory_bytes, 0)
    }
}
