use crate::{Command, Completion, Result};

/// Subsystem NQN used when probing a fabrics controller for discovery.
pub const DISCOVERY_NQN: &str = "nqn.2014-08.org.nvmexpress.discovery";

/// Callback invoked once with the completion of a submitted command.
pub type IoCallback = Box<dyn FnOnce(&Completion)>;
/// Callback invoked for asynchronous event notifications.
pub type AerCallback = Box<dyn Fn(&Completion)>;
/// Callback invoked when a command exceeds the registered timeout;
/// arguments are the queue id and command id.
pub type TimeoutCallback = Box<dyn Fn(u16, u16)>;

/// Parsed transport address.
///
/// A PCIe bus/device/function string contains ':' separators; anything else
/// is treated as an IPv4 fabrics target on the well-known port 4420 with the
/// discovery NQN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportId {
    Pcie {
        bdf: String,
    },
    Tcp {
        addr: String,
        svcid: String,
        subnqn: String,
    },
}

impl TransportId {
    pub fn parse(traddr: &str) -> Self {
        if traddr.contains(':') {
            TransportId::Pcie {
                bdf: traddr.to_string(),
            }
        } else {
            TransportId::Tcp {
                addr: traddr.to_string(),
                svcid: "4420".to_string(),
                subnqn: DISCOVERY_NQN.to_string(),
            }
        }
    }
}

/// Static controller properties the core consults.
#[derive(Debug, Clone, Copy)]
pub struct ControllerInfo {
    /// Maximum data transfer size per command, in bytes.
    pub max_xfer_size: u32,
    pub num_namespaces: u32,
}

/// Static namespace geometry.
#[derive(Debug, Clone, Copy)]
pub struct NamespaceInfo {
    pub sector_size: u32,
    pub num_sectors: u64,
}

/// Options for allocating an I/O queue pair.
#[derive(Debug, Clone, Copy)]
pub struct QpairOpts {
    pub qprio: u8,
    pub io_queue_size: u16,
    pub io_queue_requests: u32,
}

/// The contract the driver core consumes from an NVMe transport.
///
/// Queue id 0 always addresses the admin queue. Completion callbacks run on
/// the thread that polls completions; a transport must not invoke them from
/// anywhere else, and must not hold internal locks while doing so (callbacks
/// are allowed to submit follow-up commands).
pub trait Transport {
    fn controller_info(&self) -> ControllerInfo;

    fn namespace_info(&self, nsid: u32) -> Result<NamespaceInfo>;

    /// Allocates an I/O queue pair and returns its queue id (>= 1).
    fn alloc_io_qpair(&self, opts: QpairOpts) -> Result<u16>;

    fn free_io_qpair(&self, qid: u16) -> Result<()>;

    /// Number of currently live I/O queue pairs.
    fn active_io_qpairs(&self) -> usize;

    /// Submits a raw command on the given queue (`qid == 0` for admin).
    ///
    /// `buf` may be null for commands without a data transfer; otherwise it
    /// must stay valid until the completion callback has run.
    fn submit_raw(
        &self,
        qid: u16,
        cmd: &Command,
        buf: *mut u8,
        len: usize,
        cb: IoCallback,
    ) -> Result<()>;

    /// Delivers up to `max` pending completions on the queue (0 means no
    /// bound for this call) and returns how many were delivered.
    fn process_completions(&self, qid: u16, max: u32) -> u32;

    fn process_admin_completions(&self) -> u32 {
        self.process_completions(0, 0)
    }

    fn cfg_read8(&self, offset: u32) -> Result<u8>;
    fn cfg_write8(&self, offset: u32, value: u8) -> Result<()>;

    fn get_reg32(&self, offset: u32) -> Result<u32>;
    fn set_reg32(&self, offset: u32, value: u32) -> Result<()>;

    fn register_timeout_cb(&self, timeout_s: u32, cb: TimeoutCallback);
    fn register_aer_cb(&self, cb: AerCallback);
}
