//! Named POSIX shared memory for cooperating test-driver processes.
//!
//! One process in a group becomes the *primary* and creates the shared
//! tables; every other process attaches to them by name. The election is
//! first-come-first-served: whoever manages to create the namespace guard
//! region exclusively owns the primary role until it exits and the guard is
//! unlinked. A crashed primary leaves the guard behind; pick a fresh
//! namespace (or `shm_unlink` by hand) to recover.

mod region;
mod registry;

pub use region::ShmRegion;
pub use registry::{Registry, Role};

use thiserror::Error;

/// Errors surfaced by shared-memory setup and attachment.
#[derive(Debug, Error)]
pub enum ShmError {
    #[error("shm_open({name}) failed: {source}")]
    Open { name: String, source: nix::Error },
    #[error("ftruncate({name}, {len}) failed: {source}")]
    Truncate {
        name: String,
        len: u64,
        source: nix::Error,
    },
    #[error("mmap({name}) failed: {source}")]
    Map {
        name: String,
        source: std::io::Error,
    },
    #[error("region {name} is {actual} bytes, expected at least {expected}")]
    SizeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },
    #[error("invalid shared-memory namespace {namespace:?}")]
    BadNamespace { namespace: String },
}

pub type Result<T> = std::result::Result<T, ShmError>;
