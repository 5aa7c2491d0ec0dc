//! Core of a user-space NVMe test driver.
//!
//! Sits between a scripting layer and an NVMe transport and provides the
//! three subsystems test authors lean on:
//!
//! * a process-shared LBA→checksum table consulted on every completed read
//!   and updated on every write ([`csum`], [`verify`]);
//! * a per-queue ring of submitted commands and their completions with
//!   timestamps ([`cmdlog`]);
//! * a workload generator with bounded queue depth, IOPS and duration
//!   ([`worker`]).
//!
//! The hot path is single-threaded and cooperative: polling completions on a
//! queue pair runs the command-log completion hook, the read verifier and
//! the user callback on the calling thread. The only other thread is the
//! RPC acceptor in the primary process.

pub mod cmdlog;
pub mod csum;
pub mod dma;
pub mod driver;
pub mod logdump;
pub mod ns;
pub mod qpair;
pub mod rpc;
pub mod verify;
pub mod worker;

pub use cmdlog::{CmdLog, EntryRef, CMD_LOG_DEPTH, CMD_LOG_MAX_Q};
pub use csum::{csum, CsumTable, CSUM_UNCORRECTABLE, CSUM_UNMAPPED};
pub use dma::DmaBuf;
pub use driver::{ConfigWord, Controller, Driver, DriverOpts, DCFG_VERIFY_READ};
pub use logdump::log_buf_dump;
pub use ns::Namespace;
pub use qpair::QueuePair;
pub use verify::{paint, verify, IoToken, VerifyError};
pub use worker::{WorkerArgs, WorkerError, WorkerRets};

use thiserror::Error;

/// Microseconds per second; also the length of the per-latency histogram.
pub const US_PER_S: u64 = 1_000_000;

/// The validation engine assumes 512-byte sectors throughout.
pub const SECTOR_SIZE: u32 = 512;

/// Errors surfaced by driver-level entry points.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("shared memory: {0}")]
    Shm(#[from] nvt_shm::ShmError),
    #[error("transport: {0}")]
    Transport(#[from] nvt_nvme::TransportError),
    #[error("queue id {qid} exceeds the {max} command-log slots")]
    TooManyQueues { qid: u16, max: u16 },
    #[error("unsupported sector size {sector_size} (only 512-byte sectors are validated)")]
    UnsupportedSectorSize { sector_size: u32 },
    #[error("namespace {nsid} is not the single supported namespace")]
    UnsupportedNamespace { nsid: u32 },
    #[error("buffer of {len} bytes is too small for {needed} bytes of I/O")]
    BufferTooSmall { len: usize, needed: usize },
    #[error("io_flags {io_flags:#x} collide with the block-count field of cdw12")]
    InvalidIoFlags { io_flags: u32 },
    #[error("rpc server: {0}")]
    Rpc(#[source] std::io::Error),
}

/// Wall-clock microseconds since the Unix epoch, the timestamp unit of the
/// command log.
pub(crate) fn now_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
