//! The disk block ledger: tracks which sector ranges are currently owned
//! by an in-flight block and hands out unused blocks within a segment.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::util::WyRand;

/// Attempts to find an unused block before giving up; the next segment
/// rotation will likely free some.
const BLOCK_RETRIES: usize = 100;

/// An address/size pair describing one in-flight disk block.
#[derive(Debug, Clone)]
pub struct BlockData {
    /// First sector of the block.
    pub address: u64,
    /// Size in bytes.
    pub size: usize,
    /// Pattern stamped into the block when it was written.
    pub pattern: Option<usize>,
    /// Monotonic id used for the sector tags.
    pub block_id: u64,
    pub initialized: bool,
}

struct Inner {
    sector_size: u64,
    block_sectors: u64,
    device_sectors: u64,
    segment_sectors: Option<u64>,
    in_use: HashSet<u64>,
    rng: WyRand,
}

/// Shared between all disk threads targeting the same device.
pub struct DiskBlockTable {
    inner: Mutex<Inner>,
}

impl DiskBlockTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                sector_size: crate::SECTOR_SIZE as u64,
                block_sectors: 1,
                device_sectors: 0,
                segment_sectors: None,
                in_use: HashSet::new(),
                rng: WyRand::new(0xd15c),
            }),
        }
    }

    /// Configure the geometry; called by the thread that owns the device.
    pub fn set_parameters(
        &self,
        sector_size: u64,
        write_block_size: u64,
        device_sectors: u64,
        segment_sectors: Option<u64>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.sector_size = sector_size;
        inner.block_sectors = (write_block_size / sector_size).max(1);
        inner.device_sectors = device_sectors;
        inner.segment_sectors = segment_sectors;
    }

    /// Number of segments the device is divided into.
    pub fn num_segments(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        match inner.segment_sectors {
            Some(seg) if seg > 0 => inner.device_sectors.div_ceil(seg),
            _ => 1,
        }
    }

    /// Hand out an unused, block-aligned sector range within `segment`.
    /// `None` means the segment is saturated right now.
    pub fn get_unused_block(&self, segment: u64, block_id: u64) -> Option<BlockData> {
        let mut inner = self.inner.lock().unwrap();
        let (start, len) = match inner.segment_sectors {
            Some(seg) if seg > 0 => {
                let start = segment * seg;
                (start, seg.min(inner.device_sectors.saturating_sub(start)))
            }
            _ => (0, inner.device_sectors),
        };
        let blocks_in_segment = len / inner.block_sectors;
        if blocks_in_segment == 0 {
            return None;
        }

        for _ in 0..BLOCK_RETRIES {
            let index = inner.rng.range(0..blocks_in_segment);
            let address = start + index * inner.block_sectors;
            if inner.in_use.insert(address) {
                return Some(BlockData {
                    address,
                    size: (inner.block_sectors * inner.sector_size) as usize,
                    pattern: None,
                    block_id,
                    initialized: false,
                });
            }
        }
        None
    }

    /// Return a block's sectors to the free set.
    pub fn remove_block(&self, block: &BlockData) {
        let mut inner = self.inner.lock().unwrap();
        inner.in_use.remove(&block.address);
    }

    pub fn in_use_count(&self) -> usize {
        self.inner.lock().unwrap().in_use.len()
    }
}

impl Default for DiskBlockTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::DiskBlockTable;

    #[test]
    fn blocks_do_not_overlap() {
        let table = DiskBlockTable::new();
        // 1 MiB device, 4 KiB blocks.
        table.set_parameters(512, 4096, 2048, None);
        let mut blocks = Vec::new();
        while let Some(block) = table.get_unused_block(0, blocks.len() as u64) {
            blocks.push(block);
            if blocks.len() > 256 {
                break;
            }
        }
        assert!(!blocks.is_empty());
        let mut addresses: Vec<u64> = blocks.iter().map(|b| b.address).collect();
        addresses.sort_unstable();
        addresses.dedup();
        assert_eq!(addresses.len(), blocks.len());
        for b in &blocks {
            assert_eq!(b.address % 8, 0);
            assert_eq!(b.size, 4096);
        }
    }

    #[test]
    fn released_blocks_become_available_again() {
        let table = DiskBlockTable::new();
        // Tiny device: exactly two blocks.
        table.set_parameters(512, 512, 2, None);
        let a = table.get_unused_block(0, 0).unwrap();
        let b = table.get_unused_block(0, 1).unwrap();
        assert!(table.get_unused_block(0, 2).is_none());
        table.remove_block(&a);
        assert!(table.get_unused_block(0, 3).is_some());
        table.remove_block(&b);
        assert_eq!(table.in_use_count(), 1);
    }

    #[test]
    fn segments_partition_the_device() {
        let table = DiskBlockTable::new();
        table.set_parameters(512, 512, 1000, Some(100));
        assert_eq!(table.num_segments(), 10);
        for _ in 0..20 {
            if let Some(block) = table.get_unused_block(3, 0) {
                assert!((300..400).contains(&block.address));
                table.remove_block(&block);
            }
        }
    }
}
