//! NVMe wire types and the transport seam of the test driver.
//!
//! The driver core never talks to hardware directly; it submits raw
//! [`Command`]s through a [`Transport`] and consumes [`Completion`]s from
//! completion polling. [`MemTransport`] is a RAM-backed controller model
//! implementing the same contract, used by the test suite and as a stand-in
//! where no device is available.

mod cmd;
mod mem;
mod names;
mod transport;

pub use cmd::{opc, Command, Completion, DsmRange};
pub use cmd::{SCT_MEDIA_ERROR, SC_UNRECOVERED_READ_ERROR, STATUS_INVALID_FIELD};
pub use mem::{MemConfig, MemTransport};
pub use names::{cmd_name, format_command, format_completion};
pub use transport::{
    AerCallback, ControllerInfo, IoCallback, NamespaceInfo, QpairOpts, TimeoutCallback, Transport,
    TransportId, DISCOVERY_NQN,
};

use thiserror::Error;

/// Errors surfaced by a transport implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no NVMe device at {traddr}")]
    NoDevice { traddr: String },
    #[error("invalid namespace id {nsid}")]
    InvalidNamespace { nsid: u32 },
    #[error("no such queue pair {qid}")]
    NoSuchQueue { qid: u16 },
    #[error("queue pair limit reached ({max})")]
    QueueLimit { max: u16 },
    #[error("register offset {offset:#x} out of range")]
    BadRegister { offset: u32 },
    #[error("controller still has {count} live I/O queue pairs")]
    QueuesStillLive { count: usize },
    #[error("submission rejected: {reason}")]
    Rejected { reason: String },
}

pub type Result<T> = std::result::Result<T, TransportError>;
