//! CPU stress worker: a floating-point moving-average workload over a
//! fixed array. Touches no pool pages and does no I/O; the whole point is
//! heat and power draw.

use crate::util::{black_box, yield_self, WyRand};
use crate::worker::{WorkerBase, WorkerKind, WorkerOutcome, WorkerTask};

const ARRAY: usize = 100;
const ROUNDS: usize = 1 << 21;

pub struct CpuStressThread {
    base: WorkerBase,
}

impl CpuStressThread {
    pub fn new(base: WorkerBase) -> Self {
        Self { base }
    }

    fn workload(rng: &mut WyRand) -> f64 {
        let mut arr = [0f64; ARRAY];
        for v in arr.iter_mut() {
            *v = rng.gen() as f64;
            if rng.gen() % 2 == 1 {
                *v = -*v;
            }
        }
        let mut sum = 0f64;
        for i in 0..ROUNDS {
            arr[i % ARRAY] = (arr[i % ARRAY] + arr[(i + 1) % ARRAY] + arr[(i + 99) % ARRAY]) / 3.0;
            sum += arr[i % ARRAY];
        }
        black_box(sum)
    }
}

impl WorkerTask for CpuStressThread {
    fn kind(&self) -> WorkerKind {
        WorkerKind::CpuStress
    }

    fn work(&mut self) -> WorkerOutcome {
        self.base.pin();
        self.base.start_timer();
        self.base.step.log_debug("starting cpu stress thread");

        loop {
            Self::workload(&mut self.base.rng);
            yield_self();
            if !self.base.is_ready_to_run() {
                break;
            }
        }

        self.base.stop_timer();
        self.base.step.log_debug("finished cpu stress thread");
        self.base.outcome(WorkerKind::CpuStress, 0, 0)
    }
}
