//! The process-shared LBA→checksum table.
//!
//! One 32-bit word per logical block. Two values are reserved as sentinels,
//! so the checksum function remaps them:
//!
//! * [`CSUM_UNMAPPED`]: the block was trimmed or never written; reads skip
//!   verification entirely.
//! * [`CSUM_UNCORRECTABLE`]: a Write Uncorrectable covered the block; reads
//!   must surface an Unrecovered Read Error.
//!
//! Anything else is the checksum of the last successful 512-byte write.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use nvt_shm::ShmRegion;
use tracing::debug;

/// The block has no recorded contents; nothing to verify.
pub const CSUM_UNMAPPED: u32 = 0;
/// The block was made uncorrectable on purpose.
pub const CSUM_UNCORRECTABLE: u32 = 0xffff_ffff;

/// CRC-32C of a block, remapped off the sentinel values. The
/// one-in-two-billion bias is irrelevant for test purposes.
pub fn csum(data: &[u8]) -> u32 {
    match crc32c::crc32c(data) {
        0 => 1,
        0xffff_ffff => 0xffff_fffe,
        crc => crc,
    }
}

/// Handle to the shared checksum table.
///
/// The table may be absent when the host could not back one word per sector
/// of the namespace; every lookup then reports "no table" and verification
/// degrades to a no-op. Writes are lock-free: the test author guarantees one
/// outstanding write per LBA, and a violated guarantee means last completed
/// write wins the slot.
#[derive(Clone)]
pub struct CsumTable {
    region: Option<Arc<ShmRegion>>,
    sectors: u64,
}

impl CsumTable {
    pub(crate) fn new(region: Option<Arc<ShmRegion>>, sectors: u64) -> Self {
        Self { region, sectors }
    }

    /// Whether a backing table exists at all.
    pub fn is_active(&self) -> bool {
        self.region.is_some()
    }

    pub fn sectors(&self) -> u64 {
        self.sectors
    }

    /// The recorded word for `lba`, or `None` when the table is absent.
    pub fn get(&self, lba: u64) -> Option<u32> {
        let region = self.region.as_ref()?;
        debug_assert!(lba < self.sectors);
        Some(region.atomic_u32_slice(0, self.sectors as usize)[lba as usize].load(Ordering::Relaxed))
    }

    pub fn set(&self, lba: u64, value: u32) {
        if let Some(region) = &self.region {
            debug_assert!(lba < self.sectors);
            region.atomic_u32_slice(0, self.sectors as usize)[lba as usize]
                .store(value, Ordering::Relaxed);
        }
    }

    /// Clears a range to unmapped, or to uncorrectable when `uncorr` is set.
    /// `sanitize` wipes the whole table; the caller passes `lba == 0`.
    pub fn clear(&self, lba: u64, lba_count: u64, sanitize: bool, uncorr: bool) {
        let Some(region) = &self.region else {
            return;
        };
        let value = if uncorr { CSUM_UNCORRECTABLE } else { CSUM_UNMAPPED };
        let (first, count) = if sanitize {
            debug_assert_eq!(lba, 0, "sanitize clears from lba 0");
            (0, self.sectors)
        } else {
            let first = lba.min(self.sectors);
            (first, lba_count.min(self.sectors - first))
        };
        debug!(lba = first, count, value, "clear checksum table range");
        let words = region.atomic_u32_slice(0, self.sectors as usize);
        for word in &words[first as usize..(first + count) as usize] {
            word.store(value, Ordering::Relaxed);
        }
    }
}
