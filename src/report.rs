//! The structured results sink.
//!
//! Runtime observations flow through named test steps: diagnoses carry a
//! verdict string from a fixed vocabulary, process errors carry the
//! `sat-process-error` symptom, and timing/bandwidth numbers are
//! measurements with optional validators. Everything is emitted through
//! the `log` facade; the process-wide counters decide the exit code.

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};

/// Symptom attached to setup or invariant failures.
pub const PROCESS_ERROR_SYMPTOM: &str = "sat-process-error";

/// The fixed verdict vocabulary for hardware diagnoses.
pub mod verdict {
    pub const MEMORY_COPY_FAIL: &str = "memory-copy-fail";
    pub const FILE_WRITE_FAIL: &str = "file-write-fail";
    pub const FILE_READ_FAIL: &str = "file-read-fail";
    pub const HDD_SECTOR_TAG_FAIL: &str = "hdd-sector-tag-fail";
    pub const HDD_MISCOMPARE_FAIL: &str = "hdd-miscompare-fail";
    pub const GENERAL_MISCOMPARE_FAIL: &str = "general-miscompare-fail";
    pub const DISK_PATTERN_MISMATCH_FAIL: &str = "disk-pattern-mismatch-fail";
    pub const DISK_ASYNC_OPERATION_TIMEOUT_FAIL: &str = "disk-async-operation-timeout-fail";
    pub const DISK_LOW_LEVEL_IO_FAIL: &str = "disk-low-level-io-fail";
    pub const DISK_UNKNOWN_FAIL: &str = "disk-unknown-fail";
    pub const DEVICE_SIZE_ZERO_FAIL: &str = "device-size-zero-fail";
    pub const CACHE_COHERENCY_FAIL: &str = "cache-coherency-fail";
    pub const CPU_FREQUENCY_TOO_LOW_FAIL: &str = "cpu-frequency-too-low-fail";
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Validator {
    Equal(f64),
    LessThanOrEqual(f64),
    GreaterThanOrEqual(f64),
    WithinInclusive(f64, f64),
}

impl Validator {
    pub fn check(&self, value: f64) -> bool {
        match *self {
            Validator::Equal(expected) => value == expected,
            Validator::LessThanOrEqual(limit) => value <= limit,
            Validator::GreaterThanOrEqual(limit) => value >= limit,
            Validator::WithinInclusive(lo, hi) => lo <= value && value <= hi,
        }
    }
}

/// Process-wide failure accounting.
#[derive(Default)]
pub struct Report {
    diagnoses: AtomicU64,
    process_errors: AtomicU64,
}

impl Report {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn diagnosis_count(&self) -> u64 {
        self.diagnoses.load(Ordering::Relaxed)
    }

    pub fn process_error_count(&self) -> u64 {
        self.process_errors.load(Ordering::Relaxed)
    }

    /// 0 on a clean run, 1 on any diagnosis or process error.
    pub fn exit_code(&self) -> i32 {
        if self.diagnosis_count() > 0 || self.process_error_count() > 0 {
            1
        } else {
            0
        }
    }
}

/// One named phase of the run. Cheap to clone around worker threads.
#[derive(Clone)]
pub struct TestStep {
    name: Arc<str>,
    report: Arc<Report>,
}

impl TestStep {
    pub fn new(name: &str, report: &Arc<Report>) -> Self {
        debug!("[{name}] step start");
        Self {
            name: name.into(),
            report: report.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn log_debug(&self, message: &str) {
        debug!("[{}] {message}", self.name);
    }

    pub fn log_info(&self, message: &str) {
        info!("[{}] {message}", self.name);
    }

    pub fn log_warn(&self, message: &str) {
        warn!("[{}] {message}", self.name);
    }

    /// A setup or invariant failure; aborts the run outside the main loop.
    pub fn add_process_error(&self, message: &str) {
        self.report.process_errors.fetch_add(1, Ordering::Relaxed);
        error!("[{}] {PROCESS_ERROR_SYMPTOM}: {message}", self.name);
    }

    /// A hardware diagnosis with one of the fixed verdicts.
    pub fn add_diagnosis(&self, verdict: &str, message: &str) {
        self.report.diagnoses.fetch_add(1, Ordering::Relaxed);
        error!("[{}] {verdict}: {message}", self.name);
    }

    pub fn add_measurement(&self, name: &str, unit: &str, value: f64) {
        info!("[{}] measurement {name}: {value:.2} {unit}", self.name);
    }

    pub fn add_validated_measurement(
        &self,
        name: &str,
        unit: &str,
        value: f64,
        validator: Validator,
    ) {
        if !validator.check(value) {
            warn!(
                "[{}] measurement {name}: {value:.2} {unit} violates {validator:?}",
                self.name
            );
        } else {
            info!("[{}] measurement {name}: {value:.2} {unit}", self.name);
        }
    }

    /// Start a measurement series; elements are validated one by one and
    /// a summary is logged when the series is dropped.
    pub fn series(&self, name: &str, unit: &str, validator: Option<Validator>) -> Series {
        Series {
            step: self.clone(),
            name: name.into(),
            unit: unit.into(),
            validator,
            stats: Mutex::new(SeriesStats::default()),
        }
    }
}

#[derive(Default)]
struct SeriesStats {
    count: u64,
    min: f64,
    max: f64,
    sum: f64,
    violations: u64,
}

/// A measurement series with an optional threshold validator. Exceeding
/// the threshold is a warning, not an error.
pub struct Series {
    step: TestStep,
    name: String,
    unit: String,
    validator: Option<Validator>,
    stats: Mutex<SeriesStats>,
}

impl Series {
    pub fn add(&self, value: f64) {
        let mut stats = self.stats.lock().unwrap();
        if stats.count == 0 {
            stats.min = value;
            stats.max = value;
        } else {
            stats.min = stats.min.min(value);
            stats.max = stats.max.max(value);
        }
        stats.count += 1;
        stats.sum += value;
        if let Some(v) = &self.validator {
            if !v.check(value) {
                stats.violations += 1;
                warn!(
                    "[{}] series {}: {value:.2} {} violates {v:?}",
                    self.step.name, self.name, self.unit
                );
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.stats.lock().unwrap().count
    }

    pub fn violations(&self) -> u64 {
        self.stats.lock().unwrap().violations
    }
}

impl Drop for Series {
    fn drop(&mut self) {
        let stats = self.stats.lock().unwrap();
        if stats.count > 0 {
            info!(
                "[{}] series {}: n={} min={:.2} avg={:.2} max={:.2} {}",
                self.step.name,
                self.name,
                stats.count,
                stats.min,
                stats.sum / stats.count as f64,
                stats.max,
                self.unit
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counters_drive_exit_code() {
        let report = Report::new();
        assert_eq!(report.exit_code(), 0);
        let step = TestStep::new("Test", &report);
        step.add_diagnosis(verdict::MEMORY_COPY_FAIL, "synthetic");
        assert_eq!(report.diagnosis_count(), 1);
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn process_errors_fail_the_run() {
        let report = Report::new();
        let step = TestStep::new("Setup", &report);
        step.add_process_error("allocation failed");
        assert_eq!(report.process_error_count(), 1);
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn validators() {
        assert!(Validator::LessThanOrEqual(100.0).check(100.0));
        assert!(!Validator::LessThanOrEqual(100.0).check(100.1));
        assert!(Validator::GreaterThanOrEqual(2.0).check(2.5));
        assert!(Validator::Equal(0.0).check(0.0));
        assert!(Validator::WithinInclusive(1.0, 3.0).check(2.0));
        assert!(!Validator::WithinInclusive(1.0, 3.0).check(4.0));
    }

    #[test]
    fn series_tracks_violations_without_failing() {
        let report = Report::new();
        let step = TestStep::new("Disk", &report);
        let series = step.series("read times", "us", Some(Validator::LessThanOrEqual(100.0)));
        series.add(50.0);
        series.add(150.0);
        assert_eq!(series.count(), 2);
        assert_eq!(series.violations(), 1);
        // Threshold violations are warnings, never diagnoses.
        assert_eq!(report.exit_code(), 0);
    }
}
