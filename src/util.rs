//! Shared helpers: logging, timing, randomness, cache maintenance,
//! thread pinning.

use core::ops::Range;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use log::LevelFilter;

thread_local! {
    /// Core this thread was last pinned to, for the log format.
    pub static PINNED: AtomicUsize = const { AtomicUsize::new(usize::MAX) };
}

fn pinned_core() -> usize {
    PINNED.with(|p| p.load(Ordering::Relaxed))
}

/// Initialize env_logger with our single-line format.
///
/// `verbosity` maps onto the level filter (0 = warn .. 3+ = trace); a
/// `logfile` redirects everything into an append-only file.
pub fn logging(verbosity: u8, logfile: Option<&str>) {
    use std::io::Write;

    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    builder.filter_level(level).format(move |buf, record| {
        let color = match record.level() {
            log::Level::Error => "\x1b[91m",
            log::Level::Warn => "\x1b[93m",
            _ => "\x1b[90m",
        };
        let core = pinned_core();
        writeln!(
            buf,
            "{}[{:5} @{:02} {}:{}] {}\x1b[0m",
            color,
            record.level(),
            if core == usize::MAX { 99 } else { core },
            record.file().unwrap_or_default(),
            record.line().unwrap_or_default(),
            record.args()
        )
    });
    if let Some(path) = logfile {
        if let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
            builder.target(env_logger::Target::Pipe(Box::new(file)));
        }
    }
    let _ = builder.try_init();
}

/// Initialize plain warn-level logging for tests.
pub fn test_logging() {
    logging(0, None);
}

/// Microseconds since the epoch, the timestamp unit of all measurements.
pub fn time_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Simple bare bones random number generator based on wyhash.
///
/// @see https://github.com/wangyi-fudan/wyhash
pub struct WyRand {
    pub seed: u64,
}

impl WyRand {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
    pub fn gen(&mut self) -> u64 {
        self.seed = self.seed.wrapping_add(0xa076_1d64_78bd_642f);
        let t: u128 = (self.seed as u128).wrapping_mul((self.seed ^ 0xe703_7ed1_a0b4_28db) as u128);
        (t.wrapping_shr(64) ^ t) as u64
    }
    pub fn range(&mut self, range: Range<u64>) -> u64 {
        let mut val = self.gen();
        val %= range.end - range.start;
        val + range.start
    }
    pub fn shuffle<T>(&mut self, target: &mut [T]) {
        for i in 0..target.len() {
            target.swap(i, self.range(0..target.len() as u64) as usize);
        }
    }
}

/// Flushes the cache line holding `addr` out to memory.
///
/// # Safety
/// Directly executes an asm instruction; `addr` must be a mapped address.
#[inline(always)]
pub unsafe fn flush_cache_line<T>(addr: *const T) {
    #[cfg(target_arch = "x86_64")]
    core::arch::asm!("clflush [{0}]", in(reg) addr, options(nostack));
    #[cfg(target_arch = "aarch64")]
    core::arch::asm!("dc civac, {0}", in(reg) addr, options(nostack));
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    let _ = addr;
}

/// Orders all preceding flushes/stores before subsequent memory operations.
#[inline(always)]
pub fn flush_fence() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_mm_mfence()
    };
    #[cfg(not(target_arch = "x86_64"))]
    core::sync::atomic::fence(Ordering::SeqCst);
}

/// Prevents the compiler from optimizing `dummy` away.
#[inline(always)]
pub fn black_box<T>(dummy: T) -> T {
    std::hint::black_box(dummy)
}

/// Pin the calling thread to a single core.
#[cfg(target_os = "linux")]
pub fn pin(core: usize) {
    let mut set = unsafe { std::mem::zeroed::<libc::cpu_set_t>() };
    unsafe { libc::CPU_SET(core, &mut set) };
    let ret = unsafe { libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) };
    if ret != 0 {
        log::warn!("sched_setaffinity({core}) failed");
        return;
    }
    PINNED.with(|p| p.store(core, Ordering::Relaxed));
}

/// Pin the calling thread to a set of cores.
#[cfg(target_os = "linux")]
pub fn pin_mask(cores: &[usize]) {
    let mut set = unsafe { std::mem::zeroed::<libc::cpu_set_t>() };
    for &core in cores {
        unsafe { libc::CPU_SET(core, &mut set) };
    }
    let ret = unsafe { libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) };
    if ret != 0 {
        log::warn!("sched_setaffinity({cores:?}) failed");
        return;
    }
    if cores.len() == 1 {
        PINNED.with(|p| p.store(cores[0], Ordering::Relaxed));
    }
}

#[cfg(not(target_os = "linux"))]
pub fn pin(_core: usize) {}
#[cfg(not(target_os = "linux"))]
pub fn pin_mask(_cores: &[usize]) {}

/// Core the calling thread currently executes on.
pub fn current_cpu() -> u32 {
    #[cfg(target_os = "linux")]
    {
        let cpu = unsafe { libc::sched_getcpu() };
        if cpu >= 0 {
            return cpu as u32;
        }
    }
    0
}

/// Give up the CPU until scheduled again.
pub fn yield_self() {
    std::thread::yield_now();
}

#[cfg(test)]
mod test {
    use super::WyRand;

    #[test]
    fn wy_rand() {
        let mut rng = WyRand::new(0);
        let mut buckets = [0usize; 512];
        for _ in 0..512 * buckets.len() {
            buckets[rng.range(0..buckets.len() as _) as usize] += 1;
        }
        let mut min = usize::MAX;
        let mut max = 0;
        for v in buckets {
            min = min.min(v);
            max = max.max(v);
        }
        // Uniform enough for starting-slot selection.
        assert!(min > 512 / 4 && max < 512 * 4, "min={min} max={max}");
    }

    #[test]
    fn shuffle_preserves_elements() {
        let mut rng = WyRand::new(42);
        let mut v: Vec<usize> = (0..100).collect();
        rng.shuffle(&mut v);
        let mut sorted = v.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn flush_does_not_fault() {
        let data = Box::new(43_u64);
        unsafe { super::flush_cache_line(data.as_ref() as *const u64) };
        super::flush_fence();
        assert_eq!(*data, 43);
    }
}
