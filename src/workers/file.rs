//! File I/O worker: writes a batch of pattern pages through a file,
//! reads them back and verifies both the per-sector tags and the data.
//!
//! Every 512-byte sector is stamped with a (magic, block, sector, pass)
//! tag before writing, so a corrupted read can be localized to the exact
//! sector and pass even when the data pattern still matches.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use crate::pool::{Page, DONT_CARE_TAG};
use crate::report::verdict;
use crate::util::current_cpu;
use crate::worker::{WorkerBase, WorkerKind, WorkerOutcome, WorkerTask};
use crate::SECTOR_SIZE;

pub struct FileThread {
    base: WorkerBase,
    filename: String,
    /// Pages written per pass.
    disk_pages: usize,
    /// Number of complete write/read passes so far.
    pass: u64,
    /// Diagnostic call counter driving deterministic error injection.
    validate_calls: u64,
}

impl FileThread {
    pub fn new(base: WorkerBase, filename: String, disk_pages: usize) -> Self {
        Self {
            base,
            filename,
            disk_pages,
            pass: 0,
            validate_calls: 0,
        }
    }

    fn magic(&self) -> u8 {
        (0xbau64 + self.base.thread_num as u64) as u8
    }

    fn open_file(&mut self) -> Option<File> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true);
        #[cfg(target_family = "unix")]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.custom_flags(libc::O_SYNC);
        }
        match options.open(&self.filename) {
            Ok(f) => Some(f),
            Err(e) => {
                self.base
                    .step
                    .add_process_error(&format!("cannot open file {}: {e}", self.filename));
                self.base.ok = false;
                None
            }
        }
    }

    // The status check comes first so a mid-pass pause still rendezvouses
    // here instead of starving the pause barrier.
    fn get_valid_blocking(&mut self) -> Option<Page> {
        loop {
            if !self.base.is_ready_to_run() {
                return None;
            }
            if let Some(page) = self.base.env.pool.get_valid(DONT_CARE_TAG) {
                return Some(page);
            }
        }
    }

    fn get_empty_blocking(&mut self) -> Option<Page> {
        loop {
            if !self.base.is_ready_to_run() {
                return None;
            }
            if let Some(page) = self.base.env.pool.get_empty(DONT_CARE_TAG) {
                return Some(page);
            }
        }
    }

    /// Stamp each sector of the page with this thread's tag.
    fn sector_tag_page(&self, bytes: &mut [u8], block: usize) {
        let magic = self.magic();
        for sec in 0..bytes.len() / SECTOR_SIZE {
            let tag = &mut bytes[sec * SECTOR_SIZE..];
            tag[0] = magic;
            tag[1] = block as u8;
            tag[2] = sec as u8;
            tag[3] = self.pass as u8;
        }
    }

    /// Check each sector for the tag added before the write, then revert
    /// the tags back to pattern data so the CRC check can run.
    fn sector_validate_page(&mut self, page: &Page, block: usize) {
        let bytes = unsafe {
            self.base
                .env
                .region
                .page_bytes(page.desc.offset, self.base.env.page_length)
        };
        self.validate_calls += 1;

        if self.base.env.error_injection {
            if self.validate_calls == 2 {
                for sec in 8..17.min(bytes.len() / SECTOR_SIZE) {
                    bytes[sec * SECTOR_SIZE + 3] = 27;
                }
            }
            if self.validate_calls == 18 {
                bytes[108..112].copy_from_slice(&0x0bad_da7au32.to_ne_bytes());
            }
        }

        let Some(pattern_idx) = page.desc.pattern else {
            return;
        };
        let patterns = self.base.env.patterns.clone();
        let pattern = patterns.get(pattern_idx);
        let magic = self.magic();
        let mut first_bad = None;
        let mut last_bad = None;

        for sec in 0..bytes.len() / SECTOR_SIZE {
            let tag = &bytes[sec * SECTOR_SIZE..];
            let (t_magic, t_block, t_sector, t_pass) = (tag[0], tag[1], tag[2], tag[3]);
            if t_magic != magic
                || t_block != block as u8
                || t_sector != sec as u8
                || t_pass != self.pass as u8
            {
                self.base.error_count += 1;
                self.base.step.add_diagnosis(
                    verdict::HDD_SECTOR_TAG_FAIL,
                    &format!(
                        "Sector Error: sector tag @ 0x{:x}, pass {}/{}, sector {:x}/{:x}, \
                         block {}/{}, magic {:x}/{:x}, file: {}",
                        block * bytes.len() + sec * SECTOR_SIZE,
                        self.pass as u8,
                        t_pass,
                        sec as u8,
                        t_sector,
                        block as u8,
                        t_block,
                        magic,
                        t_magic,
                        self.filename,
                    ),
                );
                first_bad.get_or_insert(sec);
                last_bad = Some(sec);
            }
            // Patch the tag back to the proper pattern data.
            let word = pattern.word(sec * SECTOR_SIZE / 4);
            bytes[sec * SECTOR_SIZE..sec * SECTOR_SIZE + 4].copy_from_slice(&word.to_ne_bytes());
        }

        if let (Some(first), Some(last)) = (first_bad, last_bad) {
            self.base.step.log_warn(&format!(
                "file sector miscompare at offset {:x}-{:x}, file: {}",
                first * SECTOR_SIZE,
                (last + 1) * SECTOR_SIZE - 1,
                self.filename,
            ));
        }
    }

    /// One whole-file write pass. Returns false when the thread should
    /// wind down.
    fn write_pages(&mut self, file: &mut File, recs: &mut [Option<usize>]) -> bool {
        if file.seek(SeekFrom::Start(0)).is_err() {
            self.base.step.add_process_error("cannot seek file");
            self.base.ok = false;
            return false;
        }
        for block in 0..self.disk_pages {
            let Some(mut src) = self.get_valid_blocking() else {
                return false;
            };
            recs[block] = src.desc.pattern;

            // Check data correctness before it leaves memory.
            self.base.miscompare_verdict = verdict::GENERAL_MISCOMPARE_FAIL;
            self.base.crc_check_page(&src);
            self.base.miscompare_verdict = verdict::MEMORY_COPY_FAIL;

            let bytes = unsafe {
                self.base
                    .env
                    .region
                    .page_bytes(src.desc.offset, self.base.env.page_length)
            };
            self.sector_tag_page(bytes, block);
            src.desc.last_cpu = current_cpu();

            let result = file.write_all(bytes);
            // The page now carries sector tags, not pure pattern data.
            self.base.env.pool.put_empty(src);

            if let Err(e) = result {
                self.base.error_count += 1;
                self.base.step.add_diagnosis(
                    verdict::FILE_WRITE_FAIL,
                    &format!("failed to write page to file {}: {e}", self.filename),
                );
                return false;
            }
        }
        self.base.env.os.flush_page_cache(&self.base.step);
        true
    }

    /// One whole-file read-back pass with tag and data verification.
    fn read_pages(&mut self, file: &mut File, recs: &[Option<usize>]) -> bool {
        if file.seek(SeekFrom::Start(0)).is_err() {
            self.base.step.add_process_error("cannot seek file");
            self.base.ok = false;
            return false;
        }
        for block in 0..self.disk_pages {
            let Some(mut dst) = self.get_empty_blocking() else {
                return false;
            };
            dst.desc.pattern = recs[block];
            dst.desc.last_cpu = current_cpu();

            let bytes = unsafe {
                self.base
                    .env
                    .region
                    .page_bytes(dst.desc.offset, self.base.env.page_length)
            };
            if let Err(e) = file.read_exact(bytes) {
                self.base.error_count += 1;
                self.base.step.add_diagnosis(
                    verdict::FILE_READ_FAIL,
                    &format!("failed to read page from file {}: {e}", self.filename),
                );
                self.base.env.pool.put_empty(dst);
                return false;
            }

            self.sector_validate_page(&dst, block);

            // Miscompares on the read-back path are disk-attributable.
            self.base.miscompare_verdict = verdict::HDD_MISCOMPARE_FAIL;
            let errors = self.base.crc_check_page(&dst);
            self.base.miscompare_verdict = verdict::MEMORY_COPY_FAIL;
            if errors > 0 {
                self.base.step.log_warn(&format!(
                    "file miscompare at block {block}, offset {:x}-{:x}, file: {}",
                    block * self.base.env.page_length,
                    (block + 1) * self.base.env.page_length - 1,
                    self.filename,
                ));
            }

            self.base.env.pool.put_valid(dst);
        }
        true
    }
}

impl WorkerTask for FileThread {
    fn kind(&self) -> WorkerKind {
        WorkerKind::File
    }

    fn work(&mut self) -> WorkerOutcome {
        self.base.pin();
        self.base.start_timer();
        self.base
            .step
            .log_debug(&format!("starting file thread on {}", self.filename));

        let Some(mut file) = self.open_file() else {
            self.base.finish_early_if_running();
            self.base.stop_timer();
            return self.base.outcome(WorkerKind::File, 0, 0);
        };

        let mut recs: Vec<Option<usize>> = vec![None; self.disk_pages];
        let mut loops = 0u64;
        while self.base.is_ready_to_run() {
            if !self.write_pages(&mut file, &mut recs) {
                break;
            }
            if !self.read_pages(&mut file, &recs) {
                break;
            }
            loops += 1;
            self.pass = loops;
        }

        self.base.pages_copied = loops * self.disk_pages as u64;
        self.base.finish_early_if_running();
        self.base.stop_timer();
        self.base.step.log_debug(&format!(
            "file thread completed, status {}, {} pages copied",
            self.base.ok, self.base.pages_copied
        ));
        // Each page makes a device round trip (written and read back).
        let device_bytes = self.base.pages_copied * 2 * self.base.env.page_length as u64;
        self.base.outcome(WorkerKind::File, 0, device_bytes)
    }
}
