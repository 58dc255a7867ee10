//! Command line surface and run configuration.

use clap::Parser;

use crate::os::DramDecode;
use crate::{Error, Result, MEGABYTE};

/// Hardware stress and validation engine.
///
/// Exercises memory, CPU cores, caches, storage and the local network to
/// surface latent hardware defects, reporting per-subsystem verdicts with
/// forensic detail.
#[derive(Parser, Debug, Clone)]
#[command(about, version, author)]
pub struct Args {
    /// Megabytes of memory to test (default: most of the machine).
    #[arg(short = 'M', long = "memory")]
    pub memory_mb: Option<usize>,

    /// Megabytes to leave for the OS when auto-sizing memory.
    #[arg(long = "reserve-memory")]
    pub reserve_memory_mb: Option<usize>,

    /// Minimum megabytes of hugepages to use for the test region.
    #[arg(short = 'H', long = "hugepages")]
    pub hugepages_mb: Option<usize>,

    /// Runtime in seconds.
    #[arg(short = 's', long = "seconds", default_value_t = 20)]
    pub runtime_seconds: u64,

    /// Number of memory copy threads (default: one per core).
    #[arg(short = 'm', long = "copy_threads")]
    pub copy_threads: Option<usize>,

    /// Number of memory invert threads.
    #[arg(short = 'i', long = "invert_threads", default_value_t = 0)]
    pub invert_threads: usize,

    /// Number of check threads.
    #[arg(short = 'c', long = "check_threads", default_value_t = 0)]
    pub check_threads: usize,

    /// Number of CPU stress threads.
    #[arg(short = 'C', long = "cpu_stress_threads", default_value_t = 0)]
    pub cpu_stress_threads: usize,

    /// Add a disk stress thread for a raw device (repeatable).
    #[arg(short = 'd', long = "device")]
    pub disk_devices: Vec<String>,

    /// Add a file IO thread for a data file (repeatable).
    #[arg(short = 'f', long = "file")]
    pub files: Vec<String>,

    /// Add a network IO thread targeting a remote reflector (repeatable).
    #[arg(short = 'n', long = "network")]
    pub net_targets: Vec<String>,

    /// Spawn a network reflector for remote testers.
    #[arg(long)]
    pub listen: bool,

    /// Page length in bytes (power of two, at least 1024).
    #[arg(short = 'p', long = "page_length", default_value_t = MEGABYTE)]
    pub page_length: usize,

    /// Bytes written per file IO pass.
    #[arg(long, default_value_t = 8 * MEGABYTE as u64)]
    pub filesize: u64,

    /// Exit early after this many hardware incidents (0 = no cap).
    #[arg(long = "max_errors", default_value_t = 0)]
    pub max_errors: u64,

    /// Verbosity (0 = warnings, 3 = trace).
    #[arg(short = 'v', long = "verbosity", default_value_t = 0)]
    pub verbosity: u8,

    /// Append all output to this log file.
    #[arg(short = 'l', long = "logfile")]
    pub logfile: Option<String>,

    /// Inject errors from the workers to validate the reporting path.
    #[arg(long = "force_errors")]
    pub force_errors: bool,

    /// Additionally corrupt a page's bookkeeping every few seconds.
    #[arg(long = "force_errors_like_crazy")]
    pub force_errors_like_crazy: bool,

    /// Exit at the first diagnosis.
    #[arg(long = "stop_on_errors")]
    pub stop_on_errors: bool,

    /// Tag every cache line with its own address to catch decoder faults
    /// (incompatible with disk, file and network threads).
    #[arg(long = "tag_mode")]
    pub tag_mode: bool,

    /// Dump the physical ranges covered by the test region.
    #[arg(long = "do_page_map")]
    pub do_page_map: bool,

    /// Run the cache coherency test (one thread per core).
    #[arg(long = "cc_test")]
    pub cc_test: bool,

    /// Increments per cache coherency verification round.
    #[arg(long = "cc_inc_count", default_value_t = 1000)]
    pub cc_inc_count: usize,

    /// Number of shared cache-line records.
    #[arg(long = "cc_line_count", default_value_t = 2)]
    pub cc_line_count: usize,

    /// Cache line size in bytes (0 = probe the kernel).
    #[arg(long = "cc_line_size", default_value_t = 0)]
    pub cc_line_size: usize,

    /// Run the CPU frequency test.
    #[arg(long = "cpu_freq_test")]
    pub cpu_freq_test: bool,

    /// Minimum acceptable per-core frequency in MHz.
    #[arg(long = "cpu_freq_threshold", default_value_t = 0)]
    pub cpu_freq_threshold: u32,

    /// Round computed frequencies to this many MHz.
    #[arg(long = "cpu_freq_round", default_value_t = 10)]
    pub cpu_freq_round: u32,

    /// Pin workers near their pages' NUMA region.
    #[arg(long = "local_numa")]
    pub local_numa: bool,

    /// Pin workers away from their pages' NUMA region.
    #[arg(long = "remote_numa")]
    pub remote_numa: bool,

    /// Do not pin worker threads at all.
    #[arg(long = "no_affinity")]
    pub no_affinity: bool,

    /// Seconds into the run of the first power-spike pause cycle.
    #[arg(long = "pause_delay", default_value_t = 600)]
    pub pause_delay: u64,

    /// Length of each power-spike pause in seconds.
    #[arg(long = "pause_duration", default_value_t = 15)]
    pub pause_duration: u64,

    /// Use the single-lock pool implementation (contention benchmarking).
    #[arg(long = "coarse_grain_lock")]
    pub coarse_grain_lock: bool,

    /// Do not stress anything; only watch for errors.
    #[arg(long = "monitor_mode")]
    pub monitor_mode: bool,

    /// Address bits XORed to select the DRAM channel.
    #[arg(long = "channel_hash", default_value_t = 0)]
    pub channel_hash: u64,

    /// DRAM channel width in bits.
    #[arg(long = "channel_width", default_value_t = 64)]
    pub channel_width: u32,

    /// Comma separated DRAM chip names of one channel (give twice).
    #[arg(long = "memory_channel")]
    pub memory_channels: Vec<String>,

    /// Seconds between "seconds remaining" updates.
    #[arg(long = "print_delay", default_value_t = 10)]
    pub print_delay: u64,
}

impl Args {
    /// Reject configurations the engine cannot honor.
    pub fn validate(&self) -> Result<()> {
        if !self.page_length.is_power_of_two() || self.page_length < 1024 {
            return Err(Error::Config(format!(
                "page length must be a power of two of at least 1024 bytes, got {}",
                self.page_length
            )));
        }
        if self.tag_mode
            && (!self.disk_devices.is_empty() || !self.files.is_empty()
                || !self.net_targets.is_empty()
                || self.listen)
        {
            return Err(Error::Config(
                "tag mode is incompatible with disk, file and network threads".into(),
            ));
        }
        if self.local_numa && self.remote_numa {
            return Err(Error::Config(
                "--local_numa and --remote_numa are mutually exclusive".into(),
            ));
        }
        if self.cpu_freq_test && self.cpu_freq_threshold == 0 {
            return Err(Error::Config(
                "--cpu_freq_test requires a --cpu_freq_threshold".into(),
            ));
        }
        if !self.memory_channels.is_empty() && self.memory_channels.len() != 2 {
            return Err(Error::Config(
                "--memory_channel must be given exactly twice".into(),
            ));
        }
        if self.cc_test && self.cc_line_count == 0 {
            return Err(Error::Config("--cc_line_count must be nonzero".into()));
        }
        if let Some(mb) = self.memory_mb {
            if mb == 0 {
                return Err(Error::Config("memory size must be nonzero".into()));
            }
        }
        if self.filesize < self.page_length as u64 {
            return Err(Error::Config(
                "--filesize must hold at least one page".into(),
            ));
        }
        Ok(())
    }

    /// Bytes of memory to test, auto-sized from the machine when not
    /// given explicitly.
    pub fn resolve_memory_bytes(&self, total_memory: usize) -> usize {
        if let Some(mb) = self.memory_mb {
            return mb * MEGABYTE;
        }
        // Leave the OS a slice: the configured reserve, or 10%.
        let reserve = self
            .reserve_memory_mb
            .map(|mb| mb * MEGABYTE)
            .unwrap_or(total_memory / 10);
        total_memory.saturating_sub(reserve).max(self.page_length)
    }

    pub fn resolve_copy_threads(&self, cpus: usize) -> usize {
        self.copy_threads.unwrap_or(cpus)
    }

    /// DRAM decode parameters, when a channel layout was configured.
    pub fn dram_decode(&self) -> Option<DramDecode> {
        if self.memory_channels.len() != 2 {
            return None;
        }
        let split = |s: &String| -> Vec<String> {
            s.split(',').map(|p| p.trim().to_string()).collect()
        };
        Some(DramDecode {
            channel_hash: self.channel_hash,
            channel_width: self.channel_width,
            channels: [split(&self.memory_channels[0]), split(&self.memory_channels[1])],
        })
    }

    pub fn error_injection(&self) -> bool {
        self.force_errors || self.force_errors_like_crazy
    }
}

#[cfg(test)]
mod test {
    use super::Args;
    use clap::Parser;

    fn parse(argv: &[&str]) -> Args {
        let mut full = vec!["hwstress"];
        full.extend_from_slice(argv);
        Args::parse_from(full)
    }

    #[test]
    fn defaults_match_documentation() {
        let args = parse(&[]);
        assert_eq!(args.runtime_seconds, 20);
        assert_eq!(args.page_length, 1024 * 1024);
        assert_eq!(args.pause_delay, 600);
        assert_eq!(args.pause_duration, 15);
        assert_eq!(args.max_errors, 0);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn short_flags_parse() {
        let args = parse(&["-M", "64", "-m", "2", "-s", "3", "-i", "1", "-c", "1", "-C", "2"]);
        assert_eq!(args.memory_mb, Some(64));
        assert_eq!(args.copy_threads, Some(2));
        assert_eq!(args.runtime_seconds, 3);
        assert_eq!(args.invert_threads, 1);
        assert_eq!(args.check_threads, 1);
        assert_eq!(args.cpu_stress_threads, 2);
    }

    #[test]
    fn tag_mode_rejects_device_workers() {
        let args = parse(&["--tag_mode", "-f", "/tmp/x"]);
        assert!(args.validate().is_err());
        let args = parse(&["--tag_mode"]);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn page_length_must_be_pow2() {
        let args = parse(&["-p", "3000"]);
        assert!(args.validate().is_err());
        let args = parse(&["-p", "4096"]);
        assert!(args.validate().is_ok());
        let args = parse(&["-p", "512"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn numa_modes_are_exclusive() {
        let args = parse(&["--local_numa", "--remote_numa"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn memory_autosize_leaves_a_reserve() {
        let args = parse(&[]);
        let total = 1024 * 1024 * 1024;
        let resolved = args.resolve_memory_bytes(total);
        assert!(resolved < total);
        assert!(resolved >= total * 85 / 100);
    }

    #[test]
    fn repeatable_device_flags_accumulate() {
        let args = parse(&["-f", "/tmp/a", "-f", "/tmp/b", "-d", "/dev/sdx"]);
        assert_eq!(args.files.len(), 2);
        assert_eq!(args.disk_devices.len(), 1);
    }

    #[test]
    fn dram_decode_requires_two_channels() {
        let args = parse(&["--memory_channel", "U1,U2", "--memory_channel", "U3,U4"]);
        assert!(args.validate().is_ok());
        let decode = args.dram_decode().unwrap();
        assert_eq!(decode.channels[0], vec!["U1", "U2"]);
        let args = parse(&["--memory_channel", "U1,U2"]);
        assert!(args.validate().is_err());
    }
}
