//! Worker thread foundation: the shared environment, per-thread state and
//! the verification kernels every worker kind builds on (whole-page CRC
//! check, copy-with-verify, miscompare localization and repair).

use std::sync::Arc;

use log::error;

use crate::adler::{self, AdlerChecksum, TagFault, TAG_INTERVAL};
use crate::coordinator::WorkerStatus;
use crate::mmap::TestRegion;
use crate::os::OsLayer;
use crate::pattern::{Pattern, PatternList};
use crate::pool::{Page, Pool};
use crate::report::{verdict, TestStep};
use crate::util::{current_cpu, flush_cache_line, flush_fence, time_us, WyRand};
use crate::{BLOCK_SIZE, WORD_SIZE};

/// Bound on queued error records per region before the miscompare is
/// escalated to a page error.
const ERROR_LIMIT: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    Fill,
    Copy,
    Invert,
    Check,
    CpuStress,
    CacheCoherency,
    CpuFreq,
    Disk,
    File,
    Net,
    NetSlave,
    NetListen,
}

impl WorkerKind {
    pub fn name(self) -> &'static str {
        match self {
            WorkerKind::Fill => "Memory Page Fill Thread",
            WorkerKind::Copy => "Memory Copy Thread",
            WorkerKind::Invert => "Memory Page Invert Thread",
            WorkerKind::Check => "Memory Page Check Thread",
            WorkerKind::CpuStress => "CPU Stress Thread",
            WorkerKind::CacheCoherency => "CPU Cache Coherency Thread",
            WorkerKind::CpuFreq => "CPU Frequency Thread",
            WorkerKind::Disk => "Disk Test Thread",
            WorkerKind::File => "File IO Thread",
            WorkerKind::Net => "Network IO Thread",
            WorkerKind::NetSlave => "Network Reflector Thread",
            WorkerKind::NetListen => "Network Listen Thread",
        }
    }
}

/// What a worker thread reports back when joined.
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    pub kind: WorkerKind,
    pub thread_num: usize,
    pub ok: bool,
    pub pages_copied: u64,
    pub error_count: u64,
    pub duration_us: u64,
    /// Bytes moved through the memory subsystem (bandwidth accounting).
    pub memory_bytes: u64,
    /// Bytes moved through an external device (disk, file, network).
    pub device_bytes: u64,
}

/// A spawnable worker. `work` runs on a dedicated thread for the whole run.
pub trait WorkerTask: Send {
    fn kind(&self) -> WorkerKind;
    fn work(&mut self) -> WorkerOutcome;
}

/// Immutable state shared by all workers of a run.
pub struct WorkerEnv {
    pub pool: Arc<dyn Pool>,
    pub patterns: Arc<PatternList>,
    pub region: Arc<TestRegion>,
    pub os: Arc<OsLayer>,
    pub page_length: usize,
    pub tag_mode: bool,
    pub error_injection: bool,
}

/// One data miscompare, queued for later printing.
pub struct ErrorRecord {
    pub actual: u64,
    pub expected: u64,
    pub reread: u64,
    pub vaddr: *mut u64,
    pub paddr: u64,
    /// Address reconstructed from the tag value, for tag miscompares.
    pub tag_vaddr: u64,
    pub tag_paddr: u64,
    pub last_cpu: u32,
    pub pattern_name: &'static str,
}

impl ErrorRecord {
    fn new(actual: u64, expected: u64, vaddr: *mut u64) -> Self {
        Self {
            actual,
            expected,
            reread: 0,
            vaddr,
            paddr: 0,
            tag_vaddr: 0,
            tag_paddr: 0,
            last_cpu: 0,
            pattern_name: "None",
        }
    }
}

/// Per-thread state and the common verification kernels.
pub struct WorkerBase {
    pub thread_num: usize,
    pub env: Arc<WorkerEnv>,
    pub status: Arc<WorkerStatus>,
    pub step: TestStep,
    /// Tag hint for memory this thread should prefer.
    pub tag: u32,
    /// Cores this thread is allowed to run on; `None` leaves it unpinned.
    pub cpu_mask: Option<Vec<usize>>,
    /// Verdict attached to data miscompares found by this worker.
    pub miscompare_verdict: &'static str,
    pub pages_copied: u64,
    pub error_count: u64,
    pub ok: bool,
    pub rng: WyRand,
    start_time: u64,
    pub duration_us: u64,
}

impl WorkerBase {
    pub fn new(
        thread_num: usize,
        env: Arc<WorkerEnv>,
        status: Arc<WorkerStatus>,
        step: TestStep,
    ) -> Self {
        Self {
            thread_num,
            env,
            status,
            step,
            tag: crate::pool::DONT_CARE_TAG,
            cpu_mask: None,
            miscompare_verdict: verdict::MEMORY_COPY_FAIL,
            pages_copied: 0,
            error_count: 0,
            ok: true,
            rng: WyRand::new(thread_num as u64 + 0x5a7),
            start_time: 0,
            duration_us: 0,
        }
    }

    /// Pin to the configured core mask; call once at thread start.
    pub fn pin(&self) {
        if let Some(mask) = &self.cpu_mask {
            crate::util::pin_mask(mask);
        }
    }

    pub fn start_timer(&mut self) {
        self.start_time = time_us();
    }

    pub fn stop_timer(&mut self) {
        self.duration_us += time_us().saturating_sub(self.start_time).max(1);
    }

    pub fn is_ready_to_run(&self) -> bool {
        self.status.should_continue().0
    }

    pub fn is_ready_to_run_paused(&self, paused: &mut bool) -> bool {
        let (run, was_paused) = self.status.should_continue();
        *paused = was_paused;
        run
    }

    pub fn is_ready_to_run_no_pause(&self) -> bool {
        self.status.should_continue_no_pause()
    }

    /// Deregister from the coordinator when leaving the work loop while
    /// the run is still on; otherwise a later pause would wait forever
    /// for this worker's rendezvous.
    pub fn finish_early_if_running(&self) {
        if self.status.should_continue_no_pause() {
            self.status.remove_self();
        }
    }

    pub fn outcome(&self, kind: WorkerKind, memory_bytes: u64, device_bytes: u64) -> WorkerOutcome {
        WorkerOutcome {
            kind,
            thread_num: self.thread_num,
            ok: self.ok,
            pages_copied: self.pages_copied,
            error_count: self.error_count,
            duration_us: self.duration_us.max(1),
            memory_bytes,
            device_bytes,
        }
    }

    /// The words of an owned page.
    pub fn words_of(&self, page: &Page) -> &'static mut [u64] {
        // Exclusive ownership between get and put is the slot lock's
        // guarantee; see the pool invariants.
        unsafe {
            self.env
                .region
                .page_words(page.desc.offset, self.env.page_length)
        }
    }

    /// Fill an owned page with its assigned pattern (plus tags when
    /// address tagging is enabled).
    pub fn fill_page(&mut self, page: &mut Page) -> bool {
        let Some(pattern_idx) = page.desc.pattern else {
            self.step
                .add_process_error("attempted to fill a memory page without a pattern");
            return false;
        };
        let words = self.words_of(page);
        let pattern = self.env.patterns.get(pattern_idx);
        for (i, w) in words.iter_mut().enumerate() {
            *w = pattern.word64(i);
        }
        if self.env.tag_mode {
            adler::tag_words(words);
        }
        page.desc.last_cpu = current_cpu();
        true
    }

    /// Assign a random pattern to an empty page and fill it.
    pub fn fill_page_random(&mut self, page: &mut Page) -> bool {
        let patterns = self.env.patterns.clone();
        page.desc.pattern = Some(patterns.random_index(&mut self.rng));
        self.fill_page(page)
    }

    /// Whole-page CRC check; falls into the slow compare per block on
    /// mismatch. Returns the number of miscompared words.
    pub fn crc_check_page(&mut self, page: &Page) -> usize {
        let Some(pattern_idx) = page.desc.pattern else {
            self.step
                .add_process_error("attempted to check a memory page without a pattern");
            return 0;
        };
        let words = self.words_of(page);
        let patterns = self.env.patterns.clone();
        let block_words = BLOCK_SIZE / WORD_SIZE;
        let blocks = self.env.page_length / BLOCK_SIZE;
        let mut errors = 0;

        for block in 0..blocks {
            let slice = &mut words[block * block_words..(block + 1) * block_words];
            let pattern = patterns.get(pattern_idx);
            let expected = *pattern.crc();
            let crc = self.block_crc(slice, pattern);
            if crc != expected {
                self.step.log_debug(&format!(
                    "falling through to slow compare, CRC mismatch {crc} != {expected}"
                ));
                let count = self.check_region(
                    slice,
                    pattern_idx,
                    page.desc.last_cpu,
                    block * BLOCK_SIZE,
                    0,
                );
                if count == 0 {
                    self.step.log_warn(&format!(
                        "CRC mismatch {crc} != {expected}, but no miscompares found"
                    ));
                }
                errors += count;
            }
        }

        // Short pages are checked wordwise; the per-block fast path only
        // applies to whole checksum blocks.
        let leftover = self.env.page_length % BLOCK_SIZE;
        if leftover > 0 {
            let slice = &mut words[blocks * block_words..];
            errors += self.check_region(
                slice,
                pattern_idx,
                page.desc.last_cpu,
                blocks * BLOCK_SIZE,
                0,
            );
        }
        errors
    }

    fn block_crc(&mut self, slice: &mut [u64], pattern: &Pattern) -> AdlerChecksum {
        if self.env.tag_mode {
            let mut faults = Vec::new();
            let crc = adler::adler_addr_crc(slice, pattern, &mut faults);
            self.report_tag_faults(slice, &faults);
            crc
        } else {
            adler::calculate_checksum(slice)
        }
    }

    /// Copy a page while verifying it, block by block. The destination
    /// inherits the source's pattern; on unrepairable miscompares it is
    /// refilled from the pattern so corruption cannot propagate.
    pub fn crc_copy_page(&mut self, dst: &mut Page, src: &mut Page) -> usize {
        let Some(pattern_idx) = src.desc.pattern else {
            self.step
                .add_process_error("attempted to copy a memory page without a pattern");
            return 0;
        };
        let src_words = self.words_of(src);
        let dst_words = self.words_of(dst);
        let patterns = self.env.patterns.clone();
        let block_words = BLOCK_SIZE / WORD_SIZE;
        let blocks = self.env.page_length / BLOCK_SIZE;
        let mut errors = 0;

        for block in 0..blocks {
            let range = block * block_words..(block + 1) * block_words;
            let src_slice = &mut src_words[range.clone()];
            let dst_slice = &mut dst_words[range];
            let pattern = patterns.get(pattern_idx);
            let expected = *pattern.crc();

            let crc = if self.env.tag_mode {
                let mut src_faults = Vec::new();
                let mut dst_faults = Vec::new();
                let crc =
                    adler::adler_addr_memcpy(dst_slice, src_slice, pattern, &mut src_faults, &mut dst_faults);
                self.report_tag_faults(src_slice, &src_faults);
                self.report_tag_faults(dst_slice, &dst_faults);
                crc
            } else {
                adler::adler_memcpy(dst_slice, src_slice)
            };

            if crc != expected {
                self.step.log_debug(&format!(
                    "copy falling through to slow compare, CRC mismatch {crc} != {expected}"
                ));
                let mut count = self.check_region(
                    src_slice,
                    pattern_idx,
                    src.desc.last_cpu,
                    block * BLOCK_SIZE,
                    0,
                );
                if count == 0 {
                    self.step.log_warn(&format!(
                        "copy CRC mismatch {crc} != {expected}, but no miscompares \
                         found, retrying with fresh data"
                    ));
                    if !self.env.tag_mode {
                        // Copy back what was read while checksumming; it
                        // holds whatever corruption was seen originally.
                        src_slice.copy_from_slice(dst_slice);
                        count = self.check_region(
                            src_slice,
                            pattern_idx,
                            src.desc.last_cpu,
                            block * BLOCK_SIZE,
                            0,
                        );
                        if count == 0 {
                            let core_id = current_cpu();
                            error!(
                                "CPU {core_id} copy CRC mismatch {crc} != {expected}, \
                                 but no miscompares found on second pass"
                            );
                            let mut record = ErrorRecord::new(
                                src_slice[0],
                                0xbad00000u64 << 32,
                                src_slice.as_mut_ptr(),
                            );
                            record.last_cpu = src.desc.last_cpu;
                            record.pattern_name = patterns.get(pattern_idx).name();
                            self.process_error(&mut record, "Hardware Error");
                            self.error_count += 1;
                            errors += 1;
                        }
                    }
                }
                errors += count;
            }
        }

        let leftover = self.env.page_length % BLOCK_SIZE;
        if leftover > 0 {
            let range = blocks * block_words..;
            let src_slice = &mut src_words[range.clone()];
            let dst_slice = &mut dst_words[range];
            errors += self.check_region(
                src_slice,
                pattern_idx,
                src.desc.last_cpu,
                blocks * BLOCK_SIZE,
                0,
            );
            dst_slice.copy_from_slice(src_slice);
        }

        dst.desc.pattern = src.desc.pattern;
        dst.desc.last_cpu = current_cpu();

        if errors > 0 {
            // The destination holds a partial copy of corrupted data;
            // refill it so downstream verifications don't cascade.
            self.fill_page(dst);
        }
        errors
    }

    /// Word-by-word check of a region against its expected pattern, with
    /// miscompare classification.
    ///
    /// Classification: up to [`ERROR_LIMIT`] individual word errors;
    /// beyond that the region is a *page error*, and the catalog is
    /// scanned for a *block error*: a contiguous substring that exactly
    /// matches a different pattern ("good → bad → good again"), the
    /// forensic signature of DIMM-level corruption.
    ///
    /// `pattern_offset` is the 32-bit-word offset into the pattern the
    /// region starts at (nonzero for mid-block device reads).
    pub fn check_region(
        &mut self,
        words: &mut [u64],
        pattern_idx: usize,
        last_cpu: u32,
        byte_offset: usize,
        pattern_offset: usize,
    ) -> usize {
        let patterns = self.env.patterns.clone();
        let pattern = patterns.get(pattern_idx);
        let mut recorded: Vec<ErrorRecord> = Vec::new();
        let mut page_error = false;
        let mut message = "Hardware Error";

        for i in 0..words.len() {
            let actual = words[i];
            let expected = self.expected_word(pattern, i, pattern_offset, words);
            if actual != expected {
                if recorded.len() < ERROR_LIMIT {
                    let mut record =
                        ErrorRecord::new(actual, expected, unsafe { words.as_mut_ptr().add(i) });
                    record.pattern_name = pattern.name();
                    record.last_cpu = last_cpu;
                    recorded.push(record);
                } else {
                    self.step
                        .log_debug("error record overflow, too many miscompares");
                    message = "Page Error";
                    page_error = true;
                    break;
                }
            }
        }

        // A whole-block corruption matching another catalog pattern is the
        // most valuable forensic signature; look for it before flooding
        // the log with word errors.
        if page_error && !self.env.tag_mode {
            for alt_idx in 0..patterns.size() {
                if alt_idx == pattern_idx {
                    continue;
                }
                let alt = patterns.get(alt_idx);
                if let Some((bad_start, bad_end)) =
                    block_error_bounds(words, pattern, alt, pattern_offset)
                {
                    message = "Block Error";
                    // The first record doubles as the block's sample; it
                    // is reported here and again from the queue below.
                    if let Some(first) = recorded.first_mut() {
                        let mut sample = ErrorRecord::new(first.actual, first.expected, first.vaddr);
                        sample.pattern_name = first.pattern_name;
                        sample.last_cpu = first.last_cpu;
                        self.process_error(&mut sample, message);
                    }
                    error!(
                        "Block Error: ({:p}) pattern {} instead of {}, {} bytes \
                         from offset 0x{:x} to 0x{:x}",
                        &words[bad_start],
                        alt.name(),
                        pattern.name(),
                        (bad_end - bad_start + 1) * WORD_SIZE,
                        byte_offset + bad_start * WORD_SIZE,
                        byte_offset + bad_end * WORD_SIZE,
                    );
                }
            }
        }

        let errors = recorded.len();
        for record in recorded.iter_mut() {
            self.process_error(record, message);
        }

        // With an overflowed queue, sweep again and report everything the
        // queue missed (already-processed words were repaired above).
        let mut overflow_errors = 0;
        if page_error {
            for i in 0..words.len() {
                let actual = words[i];
                let expected = self.expected_word(pattern, i, pattern_offset, words);
                if actual != expected {
                    let mut record =
                        ErrorRecord::new(actual, expected, unsafe { words.as_mut_ptr().add(i) });
                    record.pattern_name = pattern.name();
                    record.last_cpu = last_cpu;
                    self.process_error(&mut record, message);
                    overflow_errors += 1;
                }
            }
        }

        self.error_count += (errors + overflow_errors) as u64;
        errors + overflow_errors
    }

    #[inline]
    fn expected_word(&self, pattern: &Pattern, i: usize, pattern_offset: usize, words: &[u64]) -> u64 {
        if self.env.tag_mode && i % TAG_INTERVAL == 0 {
            unsafe { words.as_ptr().add(i) as u64 }
        } else {
            expected_pattern_word(pattern, i, pattern_offset)
        }
    }

    /// Pretty print, report and repair a data miscompare.
    pub fn process_error(&mut self, error: &mut ErrorRecord, message: &str) {
        let core_id = current_cpu();

        // Distinguish read errors from write errors by rereading after a
        // cache flush.
        unsafe { flush_cache_line(error.vaddr) };
        flush_fence();
        error.reread = unsafe { core::ptr::read_volatile(error.vaddr) };

        let good = error.expected.to_ne_bytes();
        let bad = error.actual.to_ne_bytes();
        // A difference confined to the last byte lands on the loop bound.
        let byte = (0..good.len() - 1)
            .find(|&i| good[i] != bad[i])
            .unwrap_or(good.len() - 1);
        let vbyte = unsafe { (error.vaddr as *const u8).add(byte) };

        error.paddr = self.env.os.virtual_to_physical(vbyte);
        let dimm = self.env.os.find_dimm(error.paddr);

        let read_error = if error.reread == error.expected {
            " read error"
        } else {
            ""
        };
        self.step.add_diagnosis(
            self.miscompare_verdict,
            &format!(
                "{message}: miscompare on CPU {core_id}(<-{}) at {:p}(0x{:x}:{dimm}): \
                 read:0x{:016x}, reread:0x{:016x} expected:0x{:016x}. '{}'{read_error}",
                error.last_cpu,
                error.vaddr,
                error.paddr,
                error.actual,
                error.reread,
                error.expected,
                error.pattern_name,
            ),
        );

        // Overwrite the incorrect data so downstream verifications don't
        // cascade on the same fault.
        unsafe {
            core::ptr::write_volatile(error.vaddr, error.expected);
            flush_cache_line(error.vaddr);
        }
        flush_fence();
    }

    /// Report a mistagged word: an address/decoder fault, not a data one.
    pub fn report_tag_faults(&mut self, words: &mut [u64], faults: &[TagFault]) {
        for fault in faults {
            let mut record = ErrorRecord::new(fault.actual, fault.expected, unsafe {
                words.as_mut_ptr().add(fault.word_index)
            });
            // The tag value itself names the address the data claims to
            // come from.
            record.tag_vaddr = fault.actual;
            self.process_tag_error(&mut record, "Hardware Error");
        }
    }

    fn process_tag_error(&mut self, error: &mut ErrorRecord, message: &str) {
        let core_id = current_cpu();

        unsafe { flush_cache_line(error.vaddr) };
        flush_fence();
        error.reread = unsafe { core::ptr::read_volatile(error.vaddr) };
        let read_error = error.actual != error.reread;

        error.paddr = self.env.os.virtual_to_physical(error.vaddr as *const u8);
        error.tag_paddr = self
            .env
            .os
            .virtual_to_physical(error.tag_vaddr as *const u8);
        let dimm = self.env.os.find_dimm(error.paddr);
        let tag_dimm = self.env.os.find_dimm(error.tag_paddr);

        self.step.add_diagnosis(
            verdict::MEMORY_COPY_FAIL,
            &format!(
                "{message}: Tag from 0x{:x}(0x{:x}:{tag_dimm}) ({}) miscompare on \
                 CPU {core_id} at {:p}(0x{:x}:{dimm}): read:0x{:016x}, \
                 reread:0x{:016x} expected:0x{:016x}",
                error.tag_vaddr,
                error.tag_paddr,
                if read_error { "read error" } else { "write error" },
                error.vaddr,
                error.paddr,
                error.actual,
                error.reread,
                error.expected,
            ),
        );
        self.error_count += 1;

        unsafe {
            core::ptr::write_volatile(error.vaddr, error.expected);
            flush_cache_line(error.vaddr);
        }
        flush_fence();
    }
}

#[inline(always)]
fn expected_pattern_word(pattern: &Pattern, i: usize, pattern_offset: usize) -> u64 {
    let index = 2 * i + pattern_offset;
    pattern.word(index) as u64 | (pattern.word(index + 1) as u64) << 32
}

/// The "good → bad → good again" scan: bounds of a contiguous substring
/// of `words` that exactly matches `alt` while everything else matches
/// `pattern`, if the region has that shape.
fn block_error_bounds(
    words: &[u64],
    pattern: &Pattern,
    alt: &Pattern,
    pattern_offset: usize,
) -> Option<(usize, usize)> {
    #[derive(PartialEq, Clone, Copy)]
    enum State {
        Good,
        Bad,
        GoodAgain,
    }

    let mut state = State::Good;
    let mut bad_start = 0;
    let mut bad_end = 0;

    for (i, &actual) in words.iter().enumerate() {
        let expected = expected_pattern_word(pattern, i, pattern_offset);
        let possible = expected_pattern_word(alt, i, pattern_offset);
        match state {
            State::Good => {
                if actual == expected {
                } else if actual == possible {
                    bad_start = i;
                    bad_end = i;
                    state = State::Bad;
                } else {
                    return None;
                }
            }
            State::Bad => {
                if actual == possible {
                    bad_end = i;
                } else if actual == expected {
                    state = State::GoodAgain;
                } else {
                    return None;
                }
            }
            State::GoodAgain => {
                if actual != expected {
                    return None;
                }
            }
        }
    }

    if state == State::Bad || state == State::GoodAgain {
        Some((bad_start, bad_end))
    } else {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pool::{FineLockPool, DONT_CARE_TAG};
    use crate::report::Report;

    fn test_env(pages: usize, page_length: usize, tag_mode: bool) -> Arc<WorkerEnv> {
        Arc::new(WorkerEnv {
            pool: Arc::new(FineLockPool::new(pages, page_length)),
            patterns: Arc::new(PatternList::new()),
            region: Arc::new(TestRegion::new(pages * page_length, false).unwrap()),
            os: Arc::new(OsLayer::new(None)),
            page_length,
            tag_mode,
            error_injection: false,
        })
    }

    fn test_base(env: &Arc<WorkerEnv>) -> (WorkerBase, Arc<Report>) {
        let report = Report::new();
        let status = Arc::new(WorkerStatus::new());
        let step = TestStep::new("Test", &report);
        (WorkerBase::new(0, env.clone(), status, step), report)
    }

    fn checked_out_page(base: &mut WorkerBase, pattern: usize) -> Page {
        let mut page = base.env.pool.clone().get_empty(DONT_CARE_TAG).unwrap();
        page.desc.pattern = Some(pattern);
        assert!(base.fill_page(&mut page));
        page
    }

    #[test]
    fn filled_page_passes_crc_check() {
        let env = test_env(4, 16 * 1024, false);
        let (mut base, report) = test_base(&env);
        for pattern in 0..env.patterns.size() {
            let page = checked_out_page(&mut base, pattern);
            assert_eq!(base.crc_check_page(&page), 0);
            // Recycle the slot so every pattern fits in the small pool.
            base.env.pool.clone().put_empty(page);
        }
        assert_eq!(report.diagnosis_count(), 0);
    }

    #[test]
    fn single_flip_is_found_and_repaired() {
        let env = test_env(2, 8 * 1024, false);
        let (mut base, report) = test_base(&env);
        let page = checked_out_page(&mut base, 4);

        let words = base.words_of(&page);
        words[100] ^= 0x10;
        assert_eq!(base.crc_check_page(&page), 1);
        assert_eq!(report.diagnosis_count(), 1);
        assert_eq!(base.error_count, 1);

        // The repair path wrote the expected value back.
        assert_eq!(base.crc_check_page(&page), 0);
    }

    #[test]
    fn block_error_names_the_competing_pattern() {
        let env = test_env(2, 8 * 1024, false);
        let (mut base, report) = test_base(&env);
        let pattern_a = env.patterns.find("five_a").unwrap();
        let pattern_b = env.patterns.find("checker8").unwrap();
        let page = checked_out_page(&mut base, pattern_a);

        // Overwrite a contiguous range of one block with pattern B.
        let words = base.words_of(&page);
        let alt = env.patterns.get(pattern_b);
        for i in 140..400 {
            words[i] = alt.word64(i);
        }
        let errors = base.crc_check_page(&page);
        assert!(errors > ERROR_LIMIT, "expected overflow, got {errors}");
        assert!(report.diagnosis_count() > 0);
        // Every word was repaired afterwards.
        assert_eq!(base.crc_check_page(&page), 0);
    }

    #[test]
    fn block_error_bounds_detects_exact_range() {
        let patterns = PatternList::new();
        let a = patterns.get(patterns.find("just_five").unwrap());
        let b = patterns.get(patterns.find("just_a").unwrap());
        let mut words: Vec<u64> = (0..512).map(|i| a.word64(i)).collect();
        for (i, w) in words.iter_mut().enumerate().take(200).skip(64) {
            *w = b.word64(i);
        }
        assert_eq!(block_error_bounds(&words, a, b, 0), Some((64, 199)));
        // A random scribble is not a block error.
        words[300] = 0xdead_beef;
        assert_eq!(block_error_bounds(&words, a, b, 0), None);
    }

    #[test]
    fn crc_copy_propagates_pattern_and_data() {
        let env = test_env(4, 8 * 1024, false);
        let (mut base, report) = test_base(&env);
        let mut src = checked_out_page(&mut base, 6);
        let mut dst = base.env.pool.clone().get_empty(DONT_CARE_TAG).unwrap();

        assert_eq!(base.crc_copy_page(&mut dst, &mut src), 0);
        assert_eq!(dst.desc.pattern, src.desc.pattern);
        assert_eq!(base.crc_check_page(&dst), 0);
        assert_eq!(report.diagnosis_count(), 0);
    }

    #[test]
    fn corrupted_copy_source_is_diagnosed_and_dst_refilled() {
        let env = test_env(4, 8 * 1024, false);
        let (mut base, report) = test_base(&env);
        let mut src = checked_out_page(&mut base, 2);
        let mut dst = base.env.pool.clone().get_empty(DONT_CARE_TAG).unwrap();

        base.words_of(&src)[17] = !0;
        let errors = base.crc_copy_page(&mut dst, &mut src);
        assert!(errors >= 1);
        assert!(report.diagnosis_count() >= 1);
        // Destination was refilled with clean pattern data.
        assert_eq!(base.crc_check_page(&dst), 0);
    }

    #[test]
    fn tag_mode_reports_tag_miscompares_separately() {
        let env = test_env(2, 8 * 1024, true);
        let (mut base, report) = test_base(&env);
        let page = checked_out_page(&mut base, 3);

        assert_eq!(base.crc_check_page(&page), 0);
        assert_eq!(report.diagnosis_count(), 0);

        // Flip one tag-bearing word; it must surface as a tag error.
        let words = base.words_of(&page);
        words[TAG_INTERVAL * 3] ^= 1 << 33;
        base.crc_check_page(&page);
        assert_eq!(report.diagnosis_count(), 1);
        assert_eq!(base.error_count, 1);
        // Patched back.
        base.error_count = 0;
        assert_eq!(base.crc_check_page(&page), 0);
        assert_eq!(base.error_count, 0);
    }
}
