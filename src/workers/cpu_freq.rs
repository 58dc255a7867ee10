//! CPU frequency worker: samples the TSC/APERF/MPERF MSRs of every core
//! and reports cores running below the configured frequency threshold.

use std::time::Duration;

use crate::report::{verdict, Validator};
use crate::util::time_us;
use crate::worker::{WorkerBase, WorkerKind, WorkerOutcome, WorkerTask};

const MSR_TSC: u32 = 0x10;
const MSR_APERF: u32 = 0xE8;
const MSR_MPERF: u32 = 0xE7;

/// Seconds between MSR samples.
const INTERVAL_PAUSE: u64 = 10;
/// Seconds to wait before the first sample.
const STARTUP_DELAY: u64 = 5;

#[derive(Clone, Copy, Default)]
struct CpuSample {
    tsc: u64,
    aperf: u64,
    mperf: u64,
    at_us: u64,
}

pub struct CpuFreqThread {
    base: WorkerBase,
    num_cpus: usize,
    /// Minimum frequency every core must sustain, in MHz.
    threshold_mhz: u32,
    /// Rounding granularity for the computed frequency, in MHz.
    round_mhz: u32,
}

impl CpuFreqThread {
    pub fn new(base: WorkerBase, num_cpus: usize, threshold_mhz: u32, round_mhz: u32) -> Self {
        Self {
            base,
            num_cpus,
            threshold_mhz,
            round_mhz: round_mhz.max(1),
        }
    }

    fn sample(&self, cpu: usize) -> Option<CpuSample> {
        let os = &self.base.env.os;
        Some(CpuSample {
            tsc: os.read_msr(cpu, MSR_TSC)?,
            aperf: os.read_msr(cpu, MSR_APERF)?,
            mperf: os.read_msr(cpu, MSR_MPERF)?,
            at_us: time_us(),
        })
    }

    /// MHz over the interval, or None when a counter went backwards or
    /// the interval is degenerate.
    fn frequency(&self, current: &CpuSample, previous: &CpuSample) -> Option<u32> {
        let tsc = current.tsc.checked_sub(previous.tsc)?;
        let aperf = current.aperf.checked_sub(previous.aperf)?;
        let mperf = current.mperf.checked_sub(previous.mperf)?;
        if tsc < 1_000_000 || mperf == 0 {
            return None;
        }
        let interval = current.at_us.checked_sub(previous.at_us)? as f64 / 1e6;
        if interval <= 0.0 {
            return None;
        }
        let mhz = tsc as f64 / 1e6 * aperf as f64 / mperf as f64 / interval;
        let round = self.round_mhz;
        let computed = (mhz + round as f64 / 2.0) as u32;
        Some(computed - computed % round)
    }

    /// Sleep in small increments so a stop is observed promptly.
    fn sleep_checked(&self, seconds: u64) -> bool {
        for _ in 0..seconds * 4 {
            if !self.base.is_ready_to_run_no_pause() {
                return false;
            }
            std::thread::sleep(Duration::from_millis(250));
        }
        true
    }
}

impl WorkerTask for CpuFreqThread {
    fn kind(&self) -> WorkerKind {
        WorkerKind::CpuFreq
    }

    fn work(&mut self) -> WorkerOutcome {
        self.base.start_timer();
        self.base.step.log_debug("starting cpu frequency thread");

        if self.sample(0).is_none() {
            self.base
                .step
                .add_process_error("cannot read MSRs; is the msr module loaded and are we root?");
            self.base.ok = false;
            self.base.finish_early_if_running();
            self.base.stop_timer();
            return self.base.outcome(WorkerKind::CpuFreq, 0, 0);
        }

        let series: Vec<_> = (0..self.num_cpus)
            .map(|cpu| {
                self.base.step.series(
                    &format!("CPU Core {cpu} Frequency"),
                    "MHz",
                    Some(Validator::GreaterThanOrEqual(self.threshold_mhz as f64)),
                )
            })
            .collect();

        let mut samples = vec![[CpuSample::default(); 2]; self.num_cpus];
        let mut current = 0;
        let mut intervals: u32 = 0;
        let mut paused = false;

        while self.base.is_ready_to_run_paused(&mut paused) {
            if paused {
                // Counters drifted during the pause; restart the logic.
                intervals = 0;
            }
            if intervals == 0 && !self.sleep_checked(STARTUP_DELAY) {
                break;
            }

            let mut valid = true;
            for cpu in 0..self.num_cpus {
                match self.sample(cpu) {
                    Some(s) => samples[cpu][current] = s,
                    None => {
                        self.base
                            .step
                            .log_warn(&format!("failed to read MSRs of cpu {cpu}"));
                        valid = false;
                        break;
                    }
                }
            }
            if !valid {
                intervals = 0;
                continue;
            }
            intervals += 1;

            if intervals > 2 {
                for cpu in 0..self.num_cpus {
                    let cur = samples[cpu][current];
                    let prev = samples[cpu][current ^ 1];
                    match self.frequency(&cur, &prev) {
                        Some(mhz) => {
                            series[cpu].add(mhz as f64);
                            if mhz < self.threshold_mhz {
                                self.base.error_count += 1;
                                self.base.step.add_diagnosis(
                                    verdict::CPU_FREQUENCY_TOO_LOW_FAIL,
                                    &format!(
                                        "CPU frequency for core {cpu} is too low: \
                                         {mhz} MHz < {} MHz",
                                        self.threshold_mhz
                                    ),
                                );
                            }
                        }
                        None => {
                            self.base
                                .step
                                .log_warn(&format!("cannot compute frequency of cpu {cpu}"));
                            intervals = 0;
                            break;
                        }
                    }
                }
            }

            if !self.sleep_checked(INTERVAL_PAUSE) {
                break;
            }
            current ^= 1;
        }

        self.base.finish_early_if_running();

        self.base.stop_timer();
        self.base.step.log_debug("finished cpu frequency thread");
        self.base.outcome(WorkerKind::CpuFreq, 0, 0)
    }
}
