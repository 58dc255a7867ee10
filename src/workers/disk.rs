//! Disk stress worker: writes tagged pattern blocks to a device through
//! async I/O and reads them back for verification once enough unrelated
//! writes have pushed them out of the device cache.
//!
//! The in-flight queue is sized to 3/2 of the device cache so that by the
//! time a block is read back it is no longer cached and the read
//! genuinely exercises the medium. This requires the device to be at
//! least 3x the cache size.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::VecDeque;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use crate::aio::{AsyncIoContext, IoOp, IoOutcome};
use crate::disk_blocks::{BlockData, DiskBlockTable};
use crate::pool::DONT_CARE_TAG;
use crate::report::{verdict, Series, Validator};
use crate::util::time_us;
use crate::worker::{WorkerBase, WorkerKind, WorkerOutcome, WorkerTask};
use crate::SECTOR_SIZE;

/// Buffer alignment required by the kernel for direct I/O.
const BUFFER_ALIGNMENT: usize = 512;

#[derive(Debug, Clone)]
pub struct DiskParams {
    pub read_block_size: usize,
    pub write_block_size: usize,
    /// Segment length in sectors; `None` treats the whole disk as one.
    pub segment_sectors: Option<u64>,
    pub cache_size: usize,
    pub blocks_per_segment: u64,
    /// Read/write times above these (µs) are warnings.
    pub read_threshold_us: u64,
    pub write_threshold_us: u64,
    /// I/O slower than this is aborted and diagnosed.
    pub timeout: Duration,
    pub non_destructive: bool,
}

impl Default for DiskParams {
    fn default() -> Self {
        Self {
            read_block_size: SECTOR_SIZE,
            write_block_size: SECTOR_SIZE,
            segment_sectors: None,
            cache_size: 16 * 1024 * 1024,
            blocks_per_segment: 32,
            read_threshold_us: 100_000,
            write_threshold_us: 100_000,
            timeout: Duration::from_secs(5),
            non_destructive: false,
        }
    }
}

impl DiskParams {
    /// Writes in flight before reading starts: ⌈1.5 × cache⌉ worth of
    /// blocks, so reads miss the device cache.
    pub fn queue_size(&self) -> usize {
        (3 * self.cache_size as u64).div_ceil(2 * self.write_block_size as u64) as usize
    }
}

/// 512-byte-aligned buffer for direct I/O.
struct AlignedBuf {
    ptr: *mut u8,
    layout: Layout,
}

impl AlignedBuf {
    fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, BUFFER_ALIGNMENT).expect("io buffer layout");
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Self { ptr, layout }
    }

    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    fn bytes_mut(&mut self, len: usize) -> &mut [u8] {
        debug_assert!(len <= self.layout.size());
        unsafe { core::slice::from_raw_parts_mut(self.ptr, len) }
    }

    fn words_mut(&mut self, len: usize) -> &mut [u64] {
        debug_assert!(len <= self.layout.size());
        unsafe { core::slice::from_raw_parts_mut(self.ptr.cast(), len / crate::WORD_SIZE) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

pub struct DiskThread {
    base: WorkerBase,
    device_name: String,
    params: DiskParams,
    table: Arc<DiskBlockTable>,
    device_sectors: u64,
    blocks_written: u64,
    blocks_read: u64,
}

impl DiskThread {
    pub fn new(
        base: WorkerBase,
        device_name: String,
        params: DiskParams,
        table: Arc<DiskBlockTable>,
    ) -> Self {
        Self {
            base,
            device_name,
            params,
            table,
            device_sectors: 0,
            blocks_written: 0,
            blocks_read: 0,
        }
    }

    fn open_device(&mut self) -> Option<File> {
        use std::os::unix::fs::OpenOptionsExt;

        let open = |direct: bool| {
            let mut options = std::fs::OpenOptions::new();
            options.read(true).write(!self.params.non_destructive);
            let mut flags = libc::O_SYNC;
            if direct {
                flags |= libc::O_DIRECT;
            }
            options.custom_flags(flags);
            options.open(&self.device_name)
        };

        match open(true).or_else(|_| {
            self.base
                .step
                .log_warn(&format!("O_DIRECT unavailable on {}", self.device_name));
            open(false)
        }) {
            Ok(f) => Some(f),
            Err(e) => {
                self.base
                    .step
                    .add_process_error(&format!("unable to open disk {}: {e}", self.device_name));
                self.base.ok = false;
                None
            }
        }
    }

    /// Size the device; zero-size block devices are a hardware verdict.
    fn probe_device_size(&mut self, file: &File) -> bool {
        let metadata = match file.metadata() {
            Ok(m) => m,
            Err(e) => {
                self.base
                    .step
                    .add_process_error(&format!("unable to stat disk {}: {e}", self.device_name));
                return false;
            }
        };
        use std::os::unix::fs::FileTypeExt;
        let bytes = if metadata.file_type().is_block_device() {
            const BLKGETSIZE64: libc::c_ulong = 0x80081272;
            let mut size: u64 = 0;
            let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
            if ret != 0 {
                self.base
                    .step
                    .add_process_error(&format!("unable to ioctl disk {}", self.device_name));
                return false;
            }
            size
        } else {
            metadata.len()
        };

        if bytes == 0 {
            self.base.error_count += 1;
            self.base.step.add_diagnosis(
                verdict::DEVICE_SIZE_ZERO_FAIL,
                &format!(
                    "{} has a size of zero, which indicates a non working device",
                    self.device_name
                ),
            );
            return false;
        }
        self.device_sectors = bytes / SECTOR_SIZE as u64;
        self.base.step.log_debug(&format!(
            "device sectors: {} on disk {}",
            self.device_sectors, self.device_name
        ));

        self.table.set_parameters(
            SECTOR_SIZE as u64,
            self.params.write_block_size as u64,
            self.device_sectors,
            self.params.segment_sectors,
        );
        true
    }

    /// Fill the I/O buffer from a pooled page (or straight from a random
    /// pattern when none is available) and remember the block's pattern.
    fn prepare_write_buffer(&mut self, buf: &mut AlignedBuf, block: &mut BlockData) {
        let pool = self.base.env.pool.clone();
        let patterns = self.base.env.patterns.clone();
        if let Some(page) = pool.get_valid(DONT_CARE_TAG) {
            let page_bytes = unsafe {
                self.base
                    .env
                    .region
                    .page_bytes(page.desc.offset, self.base.env.page_length)
            };
            let len = block.size.min(page_bytes.len());
            buf.bytes_mut(block.size)[..len].copy_from_slice(&page_bytes[..len]);
            block.pattern = page.desc.pattern;
            pool.put_valid(page);
        } else {
            let index = patterns.random_index(&mut self.base.rng);
            let pattern = patterns.get(index);
            for (i, w) in buf.words_mut(block.size).iter_mut().enumerate() {
                *w = pattern.word64(i);
            }
            block.pattern = Some(index);
            self.base.step.log_warn(&format!(
                "using pattern fill fallback for disk {}",
                self.device_name
            ));
        }
    }

    /// Stamp a (magic, block, sector, pass) tag at the head of each
    /// sector in the buffer.
    fn sector_tag_buffer(&self, bytes: &mut [u8], block: &BlockData, pass: u64) {
        let magic = (0xbau64 + self.base.thread_num as u64) as u8;
        for sec in 0..bytes.len() / SECTOR_SIZE {
            let tag = &mut bytes[sec * SECTOR_SIZE..];
            tag[0] = magic;
            tag[1] = block.block_id as u8;
            tag[2] = sec as u8;
            tag[3] = pass as u8;
        }
    }

    /// Verify and revert the sector tags of a chunk read back from disk.
    /// `sector_base` is the index of the chunk's first sector within the
    /// block.
    fn sector_validate_buffer(
        &mut self,
        bytes: &mut [u8],
        block: &BlockData,
        pass: u64,
        sector_base: usize,
    ) {
        let Some(pattern_idx) = block.pattern else {
            return;
        };
        let patterns = self.base.env.patterns.clone();
        let pattern = patterns.get(pattern_idx);
        let magic = (0xbau64 + self.base.thread_num as u64) as u8;

        for sec in 0..bytes.len() / SECTOR_SIZE {
            let tag = &bytes[sec * SECTOR_SIZE..];
            let absolute = sector_base + sec;
            if tag[0] != magic
                || tag[1] != block.block_id as u8
                || tag[2] != absolute as u8
                || tag[3] != pass as u8
            {
                self.base.error_count += 1;
                self.base.step.add_diagnosis(
                    verdict::HDD_SECTOR_TAG_FAIL,
                    &format!(
                        "Sector Error: sector tag on disk {} block {} sector {}: \
                         pass {}/{}, sector {:x}/{:x}, block {}/{}, magic {:x}/{:x}",
                        self.device_name,
                        block.address,
                        absolute,
                        pass as u8,
                        tag[3],
                        absolute as u8,
                        tag[2],
                        block.block_id as u8,
                        tag[1],
                        magic,
                        tag[0],
                    ),
                );
            }
            // Patch the tag back so the pattern check below sees clean
            // data and subsequent reads do not cascade.
            let word_index = (absolute * SECTOR_SIZE) / 4;
            let word = pattern.word(word_index);
            bytes[sec * SECTOR_SIZE..sec * SECTOR_SIZE + 4].copy_from_slice(&word.to_ne_bytes());
        }
    }

    fn diagnose_io(&mut self, op: IoOp, outcome: IoOutcome, first_sector: u64) {
        match outcome {
            IoOutcome::Done => {}
            IoOutcome::TimedOut => {
                self.base.error_count += 1;
                self.base.step.add_diagnosis(
                    verdict::DISK_ASYNC_OPERATION_TIMEOUT_FAIL,
                    &format!(
                        "timeout doing async {} to sectors starting at {} on disk {}",
                        op.name(),
                        first_sector,
                        self.device_name
                    ),
                );
            }
            IoOutcome::Failed(code) => {
                self.base.error_count += 1;
                let (v, what) = if code == -libc::EIO {
                    (verdict::DISK_LOW_LEVEL_IO_FAIL, "low-level I/O error")
                } else {
                    (verdict::DISK_UNKNOWN_FAIL, "unknown error")
                };
                self.base.step.add_diagnosis(
                    v,
                    &format!(
                        "{what} ({code}) while doing {} to sectors starting at {} on disk {}",
                        op.name(),
                        first_sector,
                        self.device_name
                    ),
                );
            }
            IoOutcome::Short(bytes) => {
                self.base.error_count += 1;
                self.base.step.add_diagnosis(
                    verdict::DISK_UNKNOWN_FAIL,
                    &format!(
                        "short {} of {bytes} bytes at sector {} on disk {}",
                        op.name(),
                        first_sector,
                        self.device_name
                    ),
                );
            }
        }
    }

    /// Read a block back in randomly sized chunks and verify tags and
    /// pattern data.
    #[allow(clippy::too_many_arguments)]
    fn validate_block(
        &mut self,
        fd: i32,
        aio: &mut AsyncIoContext,
        buf: &mut AlignedBuf,
        block: &BlockData,
        pass: u64,
        read_times: &Series,
    ) -> bool {
        let read_block_size = self.params.read_block_size;
        let mut blocks_left = block.size / read_block_size;
        let mut bytes_read = 0usize;

        while blocks_left != 0 {
            if !self.base.is_ready_to_run_no_pause() {
                return true;
            }
            // Random multiples of the read block size exercise the medium
            // with a read pattern unrelated to the write pattern.
            let current_blocks = self.base.rng.range(0..blocks_left as u64) as usize + 1;
            let current_bytes = current_blocks * read_block_size;
            let offset = block.address * SECTOR_SIZE as u64 + bytes_read as u64;

            let start = time_us();
            let outcome = unsafe {
                aio.run(
                    IoOp::Read,
                    fd,
                    buf.as_mut_ptr(),
                    current_bytes,
                    offset,
                    self.params.timeout,
                )
            };
            let outcome = match outcome {
                Ok(o) => o,
                Err(e) => {
                    self.base
                        .step
                        .add_process_error(&format!("async read setup failed: {e}"));
                    self.base.ok = false;
                    return false;
                }
            };
            read_times.add((time_us() - start) as f64);
            if outcome != IoOutcome::Done {
                self.diagnose_io(IoOp::Read, outcome, offset / SECTOR_SIZE as u64);
                return true;
            }

            if !self.params.non_destructive {
                let sector_base = bytes_read / SECTOR_SIZE;
                let bytes = buf.bytes_mut(current_bytes);
                self.sector_validate_buffer(bytes, block, pass, sector_base);

                if let Some(pattern_idx) = block.pattern {
                    let words = buf.words_mut(current_bytes);
                    let miscompares =
                        self.base
                            .check_region(words, pattern_idx, 0, bytes_read, bytes_read / 4);
                    if miscompares > 0 {
                        self.base.step.add_diagnosis(
                            verdict::DISK_PATTERN_MISMATCH_FAIL,
                            &format!(
                                "pattern mismatch in block starting at sector {} on disk {}",
                                block.address, self.device_name
                            ),
                        );
                    }
                }
            }

            bytes_read += current_bytes;
            blocks_left -= current_blocks;
        }
        true
    }

    fn do_work(&mut self, file: &File) -> bool {
        let fd = file.as_raw_fd();
        let queue_size = self.params.queue_size();
        let num_segments = self.table.num_segments();

        // The queue-length formula only flushes the device cache if the
        // disk holds at least three times the cache.
        if self.device_sectors * SECTOR_SIZE as u64 <= 3 * self.params.cache_size as u64 {
            self.base.step.add_process_error(&format!(
                "disk {} is smaller than 3x the configured device cache",
                self.device_name
            ));
            self.base.ok = false;
            return false;
        }

        let mut aio = match AsyncIoContext::new() {
            Ok(ctx) => ctx,
            Err(e) => {
                self.base
                    .step
                    .add_process_error(&format!("unable to create aio context: {e}"));
                self.base.ok = false;
                return false;
            }
        };
        let mut buf = AlignedBuf::new(
            self.params
                .write_block_size
                .max(self.params.read_block_size * 256)
                .max(self.base.env.page_length),
        );

        let read_times = self.base.step.series(
            &format!("{} read times", self.device_name),
            "us",
            Some(Validator::LessThanOrEqual(
                self.params.read_threshold_us as f64,
            )),
        );
        let write_times = self.base.step.series(
            &format!("{} write times", self.device_name),
            "us",
            Some(Validator::LessThanOrEqual(
                self.params.write_threshold_us as f64,
            )),
        );

        let mut in_flight: VecDeque<BlockData> = VecDeque::new();
        let mut block_num: u64 = 0;
        let mut pass: u64 = 0;

        while self.base.is_ready_to_run() {
            // Write phase.
            while self.base.is_ready_to_run_no_pause() && in_flight.len() < queue_size {
                let segment = (block_num / self.params.blocks_per_segment) % num_segments;
                block_num += 1;

                let Some(mut block) = self.table.get_unused_block(segment, block_num) else {
                    // Saturated segment; the next rotation frees blocks.
                    continue;
                };

                if !self.params.non_destructive {
                    self.prepare_write_buffer(&mut buf, &mut block);
                    let size = block.size;
                    self.sector_tag_buffer(buf.bytes_mut(size), &block, pass);

                    let offset = block.address * SECTOR_SIZE as u64;
                    let start = time_us();
                    let outcome = unsafe {
                        aio.run(
                            IoOp::Write,
                            fd,
                            buf.as_mut_ptr(),
                            block.size,
                            offset,
                            self.params.timeout,
                        )
                    };
                    let outcome = match outcome {
                        Ok(o) => o,
                        Err(e) => {
                            self.base
                                .step
                                .add_process_error(&format!("async write setup failed: {e}"));
                            self.base.ok = false;
                            self.table.remove_block(&block);
                            return false;
                        }
                    };
                    write_times.add((time_us() - start) as f64);
                    if outcome != IoOutcome::Done {
                        self.diagnose_io(IoOp::Write, outcome, block.address);
                        self.table.remove_block(&block);
                        continue;
                    }
                    self.blocks_written += 1;
                }

                block.initialized = true;
                in_flight.push_back(block);
            }
            self.base.env.os.flush_page_cache(&self.base.step);

            // Read phase: verify the oldest writes first.
            while self.base.is_ready_to_run_no_pause() {
                let Some(block) = in_flight.pop_front() else {
                    break;
                };
                if !self.validate_block(fd, &mut aio, &mut buf, &block, pass, &read_times) {
                    self.table.remove_block(&block);
                    return false;
                }
                self.table.remove_block(&block);
                self.blocks_read += 1;
            }
            pass += 1;
        }

        // Release anything still queued.
        for block in in_flight.drain(..) {
            self.table.remove_block(&block);
        }
        self.base.pages_copied = self.blocks_written + self.blocks_read;
        true
    }
}

impl WorkerTask for DiskThread {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Disk
    }

    fn work(&mut self) -> WorkerOutcome {
        self.base.pin();
        self.base.start_timer();
        self.base
            .step
            .log_debug(&format!("starting disk thread on {}", self.device_name));

        if let Some(file) = self.open_device() {
            if self.probe_device_size(&file) {
                self.do_work(&file);
            }
        }

        self.base.finish_early_if_running();

        self.base.stop_timer();
        self.base.step.log_debug(&format!(
            "disk thread for {} completed, status {}, {} blocks written, {} read",
            self.device_name, self.base.ok, self.blocks_written, self.blocks_read
        ));
        let device_bytes = self.blocks_written * self.params.write_block_size as u64
            + self.blocks_read * self.params.write_block_size as u64;
        self.base.outcome(WorkerKind::Disk, 0, device_bytes)
    }
}
