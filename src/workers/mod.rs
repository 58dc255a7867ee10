//! The worker thread kinds.
//!
//! Each kind owns a loop of the shape
//! `while coordinator.should_continue(): acquire inputs → work → release`.
//! Workers hold at most two page locks at a time (one source, one
//! destination) and retry immediately when no suitable page is available;
//! the pool's traversal bounds the resulting starvation.

pub mod cache_coherency;
pub mod check;
pub mod copy;
pub mod cpu_freq;
pub mod cpu_stress;
pub mod fill;
pub mod file;
pub mod invert;
pub mod net;

#[cfg(target_os = "linux")]
pub mod disk;

pub use cache_coherency::{CacheCoherencyThread, CcData};
pub use check::CheckThread;
pub use copy::CopyThread;
pub use cpu_freq::CpuFreqThread;
pub use cpu_stress::CpuStressThread;
pub use fill::FillThread;
pub use file::FileThread;
pub use invert::InvertThread;
pub use net::{NetworkListenThread, NetworkThread};

#[cfg(target_os = "linux")]
pub use disk::DiskThread;
