//! Write-buffer painting and read verification.
//!
//! Every written block carries its own LBA in the first 8 bytes and a
//! globally unique token in the last 8, so a stale read is caught even when
//! checksums alone would collide. The middle of the block is whatever the
//! caller put there.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use nvt_shm::ShmRegion;
use thiserror::Error;

use crate::csum::{csum, CsumTable, CSUM_UNCORRECTABLE, CSUM_UNMAPPED};

/// The shared write token, bumped by `lba_count` on every write so payload
/// content is distinct across the whole process group.
#[derive(Clone)]
pub struct IoToken {
    region: Arc<ShmRegion>,
}

impl IoToken {
    pub(crate) fn new(region: Arc<ShmRegion>) -> Self {
        Self { region }
    }

    /// Atomically claims `count` token values, returning the first.
    pub fn fetch_add(&self, count: u64) -> u64 {
        self.region.atomic_u64(0).fetch_add(count, Ordering::SeqCst)
    }

    pub fn current(&self) -> u64 {
        self.region.atomic_u64(0).load(Ordering::SeqCst)
    }
}

/// Why a read failed verification.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("lba {lba:#x} is marked uncorrectable")]
    Uncorrectable { lba: u64 },
    #[error("lba mismatch at {lba:#x}: buffer carries {found:#x}")]
    LbaMismatch { lba: u64, found: u64 },
    #[error("crc mismatch at lba {lba:#x}: expected {expected:#x}, computed {computed:#x}")]
    CrcMismatch {
        lba: u64,
        expected: u32,
        computed: u32,
    },
}

/// Stamps each block of a write buffer and records its checksum.
///
/// Block `i` gets `lba_first + i` in its first 64-bit word and `token + i`
/// in its last; the checksum of the stamped block lands in the shared table
/// before submission. A failed write therefore leaves the table stale, which
/// the test run must treat as the end of valid state for those LBAs.
pub fn paint(
    buf: &mut [u8],
    lba_first: u64,
    lba_count: u32,
    sector_size: u32,
    token: &IoToken,
    table: &CsumTable,
) {
    let ss = sector_size as usize;
    assert!(buf.len() >= lba_count as usize * ss);

    let token_base = token.fetch_add(lba_count as u64);
    for i in 0..lba_count as usize {
        let slot = &mut buf[i * ss..(i + 1) * ss];
        let lba = lba_first + i as u64;
        slot[..8].copy_from_slice(&lba.to_le_bytes());
        slot[ss - 8..].copy_from_slice(&(token_base + i as u64).to_le_bytes());
        table.set(lba, csum(slot));
    }
}

/// Checks each block of a read buffer against the shared table.
///
/// Per block: an absent table accepts everything; an unmapped entry is
/// skipped; an uncorrectable entry fails; then the embedded LBA and the
/// checksum must both match.
pub fn verify(
    buf: &[u8],
    lba_first: u64,
    lba_count: u32,
    sector_size: u32,
    table: &CsumTable,
) -> Result<(), VerifyError> {
    let ss = sector_size as usize;
    assert!(buf.len() >= lba_count as usize * ss);

    for i in 0..lba_count as usize {
        let slot = &buf[i * ss..(i + 1) * ss];
        let lba = lba_first + i as u64;
        let computed = csum(slot);
        let Some(expected) = table.get(lba) else {
            continue;
        };
        if expected == CSUM_UNMAPPED {
            continue;
        }
        if expected == CSUM_UNCORRECTABLE {
            return Err(VerifyError::Uncorrectable { lba });
        }
        let found = u64::from_le_bytes(slot[..8].try_into().expect("8-byte prefix"));
        if found != lba {
            return Err(VerifyError::LbaMismatch { lba, found });
        }
        if computed != expected {
            return Err(VerifyError::CrcMismatch {
                lba,
                expected,
                computed,
            });
        }
    }
    Ok(())
}
