//! Invert worker: repeatedly complements a page in place with periodic
//! cache-line flushes. Two full up/down round trips leave the page at its
//! original bit pattern, so downstream CRC checks still pass; the
//! invert/flush cadence is what stresses the caches and memory.

use crate::pool::DONT_CARE_TAG;
use crate::util::{flush_cache_line, flush_fence, yield_self};
use crate::worker::{WorkerBase, WorkerKind, WorkerOutcome, WorkerTask};
use crate::CACHE_LINE_SIZE;

const FLUSH_INTERVAL: usize = CACHE_LINE_SIZE / crate::WORD_SIZE;

pub struct InvertThread {
    base: WorkerBase,
}

impl InvertThread {
    pub fn new(base: WorkerBase) -> Self {
        Self { base }
    }

    fn invert_down(words: &mut [u64]) {
        flush_fence();
        let mut i = words.len();
        while i > 0 {
            let line = i - FLUSH_INTERVAL;
            for w in words[line..i].iter_mut().rev() {
                *w = !*w;
            }
            unsafe { flush_cache_line(&words[line]) };
            i = line;
        }
        flush_fence();
    }

    fn invert_up(words: &mut [u64]) {
        flush_fence();
        let mut i = 0;
        while i < words.len() {
            let end = i + FLUSH_INTERVAL;
            for w in words[i..end].iter_mut() {
                *w = !*w;
            }
            unsafe { flush_cache_line(&words[i]) };
            i = end;
        }
        flush_fence();
    }
}

impl WorkerTask for InvertThread {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Invert
    }

    fn work(&mut self) -> WorkerOutcome {
        self.base.pin();
        self.base.start_timer();
        self.base.step.log_debug("starting memory invert thread");

        let pool = self.base.env.pool.clone();
        let mut loops = 0u64;
        while self.base.is_ready_to_run() {
            let Some(mut src) = pool.get_valid(DONT_CARE_TAG) else {
                continue;
            };

            self.base.crc_check_page(&src);

            let words = self.base.words_of(&src);
            Self::invert_down(words);
            yield_self();
            Self::invert_up(words);
            yield_self();
            Self::invert_down(words);
            yield_self();
            Self::invert_up(words);
            yield_self();
            src.desc.last_cpu = crate::util::current_cpu();

            self.base.crc_check_page(&src);

            pool.put_valid(src);
            loops += 1;
        }

        self.base.pages_copied = loops * 2;
        self.base.stop_timer();
        self.base.step.log_debug(&format!(
            "invert thread completed, status {}, {loops} pages inverted",
            self.base.ok
        ));
        // Four full passes over the page per loop.
        let memory_bytes = loops * 4 * self.base.env.page_length as u64;
        self.base.outcome(WorkerKind::Invert, memory_bytes, 0)
    }
}

#[cfg(test)]
mod test {
    use super::InvertThread;

    #[test]
    fn double_invert_restores_content() {
        let mut words: Vec<u64> = (0..1024u64).map(|i| i.wrapping_mul(0x0101_0101)).collect();
        let reference = words.clone();
        InvertThread::invert_down(&mut words);
        assert_ne!(words, reference);
        InvertThread::invert_up(&mut words);
        assert_eq!(words, reference);
    }
}
