use std::fs::File;
use std::sync::atomic::{AtomicU32, AtomicU64};

use memmap2::MmapMut;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use tracing::debug;

use crate::{Result, ShmError};

/// A single named shared-memory region, mapped read/write.
///
/// The creator owns the name and unlinks it on drop; attachers only unmap.
/// The mapping is zero-filled by the kernel on creation.
pub struct ShmRegion {
    name: String,
    ptr: *mut u8,
    len: usize,
    owner: bool,
    // Held for the lifetime of `ptr`; never accessed directly after setup.
    _map: MmapMut,
}

// The region is plain process-shared memory. Concurrent access is governed
// by the atomic accessors below; the raw pointer never outlives the mapping.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Creates the region, failing if a live region of that name exists.
    pub(crate) fn create_excl(name: &str, len: u64) -> Result<Self> {
        Self::create_inner(name, len, false)
    }

    /// Creates the region, unlinking any stale leftover of the name first.
    /// Only safe once the caller holds the primary role.
    pub(crate) fn create(name: &str, len: u64) -> Result<Self> {
        Self::create_inner(name, len, true)
    }

    fn create_inner(name: &str, len: u64, unlink_stale: bool) -> Result<Self> {
        if unlink_stale {
            let _ = shm_unlink(name);
        }
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::from_bits_truncate(0o600),
        )
        .map_err(|source| ShmError::Open {
            name: name.to_string(),
            source,
        })?;
        let file = File::from(fd);
        ftruncate(&file, len as i64).map_err(|source| {
            let _ = shm_unlink(name);
            ShmError::Truncate {
                name: name.to_string(),
                len,
                source,
            }
        })?;
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|source| {
            let _ = shm_unlink(name);
            ShmError::Map {
                name: name.to_string(),
                source,
            }
        })?;
        debug!(name, len, "created shared-memory region");
        Ok(Self::from_map(name, map, true))
    }

    /// Attaches to an existing region and checks it is large enough.
    pub(crate) fn attach(name: &str, expected_len: u64) -> Result<Self> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty()).map_err(|source| ShmError::Open {
            name: name.to_string(),
            source,
        })?;
        let file = File::from(fd);
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|source| ShmError::Map {
            name: name.to_string(),
            source,
        })?;
        if (map.len() as u64) < expected_len {
            return Err(ShmError::SizeMismatch {
                name: name.to_string(),
                expected: expected_len,
                actual: map.len() as u64,
            });
        }
        debug!(name, len = map.len(), "attached shared-memory region");
        Ok(Self::from_map(name, map, false))
    }

    fn from_map(name: &str, mut map: MmapMut, owner: bool) -> Self {
        let ptr = map.as_mut_ptr();
        let len = map.len();
        Self {
            name: name.to_string(),
            ptr,
            len,
            owner,
            _map: map,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether this handle created (and will unlink) the region.
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Raw base pointer of the mapping. Valid for `len()` bytes while this
    /// handle is alive.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// A shared `AtomicU64` at `offset` bytes into the region.
    ///
    /// # Panics
    /// Panics if the offset is out of bounds or not 8-byte aligned.
    pub fn atomic_u64(&self, offset: usize) -> &AtomicU64 {
        assert!(offset + 8 <= self.len, "atomic_u64 offset out of bounds");
        assert_eq!(offset % 8, 0, "atomic_u64 offset misaligned");
        unsafe { &*(self.ptr.add(offset) as *const AtomicU64) }
    }

    /// A shared `[AtomicU32]` slice of `count` words at `offset`.
    ///
    /// # Panics
    /// Panics if the range is out of bounds or not 4-byte aligned.
    pub fn atomic_u32_slice(&self, offset: usize, count: usize) -> &[AtomicU32] {
        assert!(
            offset + count * 4 <= self.len,
            "atomic_u32 slice out of bounds"
        );
        assert_eq!(offset % 4, 0, "atomic_u32 slice misaligned");
        unsafe { std::slice::from_raw_parts(self.ptr.add(offset) as *const AtomicU32, count) }
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        if self.owner {
            debug!(name = %self.name, "unlinking shared-memory region");
            let _ = shm_unlink(self.name.as_str());
        }
    }
}
