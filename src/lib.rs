//! # Hardware stress and validation engine
//!
//! Deliberately exercises the memory subsystem, CPU cores, caches, storage
//! devices and (optionally) the local network interface of a single machine
//! to surface latent hardware defects: bit flips, silent data corruption,
//! stuck cache lines, under-frequency cores, bad disk sectors.
//!
//! This is a diagnostic, not a benchmark. The output of interest is a list
//! of per-subsystem failure verdicts with enough forensic detail (virtual
//! and physical address, writing CPU, expected and observed bit patterns,
//! DIMM label) to localize the fault.
//!
//! The crate is built from three tightly coupled subsystems:
//! - [`pool`]: a preallocated set of pattern-tagged memory pages circulating
//!   between worker threads under per-slot try-locks,
//! - [`coordinator`] + [`workers`]: long-lived worker threads of several
//!   kinds driven by a tri-state run/pause/stop coordinator,
//! - [`adler`] + the slow-compare path in [`worker`]: the per-page checksum
//!   and miscompare-classification machinery.

use core::fmt;

pub mod adler;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod mmap;
pub mod os;
pub mod pattern;
pub mod pool;
pub mod report;
pub mod util;
pub mod worker;
pub mod workers;

#[cfg(target_os = "linux")]
pub mod aio;
pub mod disk_blocks;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Not enough memory, or the test region could not be mapped.
    Memory,
    /// Invalid configuration or command line.
    Config(String),
    /// A file, device or socket could not be opened or probed.
    Io(String),
    /// Corrupted internal state (invariant violation).
    Corruption,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Memory => write!(f, "out of memory"),
            Error::Config(msg) => write!(f, "invalid configuration: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::Corruption => write!(f, "corrupted internal state"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

/// Word size all verification kernels operate on.
pub const WORD_SIZE: usize = core::mem::size_of::<u64>();

/// Block granularity of the checksum kernels. Patterns repeat within this.
pub const BLOCK_SIZE: usize = 4096;

/// Default cache line, used when the kernel does not report one.
pub const CACHE_LINE_SIZE: usize = 64;

/// Disk sector size; sector tags are laid out on this granularity.
pub const SECTOR_SIZE: usize = 512;

pub(crate) const MEGABYTE: usize = 1024 * 1024;
