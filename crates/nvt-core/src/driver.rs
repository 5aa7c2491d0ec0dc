//! Driver bootstrap: shared-memory wiring, controller probe, raw command
//! submission, and global configuration.

use std::cell::{RefCell, RefMut};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use nvt_nvme::{opc, Command, DsmRange, IoCallback, Transport, TransportError, TransportId};
use nvt_shm::{Registry, ShmRegion};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

use crate::cmdlog::{dump_table, CmdLog, CMD_LOG_BYTES};
use crate::csum::CsumTable;
use crate::dma::DmaBuf;
use crate::qpair::QueuePair;
use crate::rpc::RpcServer;
use crate::DriverError;

/// Bit 0 of the global configuration word: verify data on every read
/// completion.
pub const DCFG_VERIFY_READ: u64 = 1 << 0;

/// The process-shared 64-bit feature-flag word. Mutated only by the primary;
/// readable by every cooperating process.
pub struct ConfigWord {
    region: Arc<ShmRegion>,
}

impl ConfigWord {
    pub(crate) fn new(region: Arc<ShmRegion>) -> Self {
        Self { region }
    }

    pub fn set(&self, word: u64) {
        self.region.atomic_u64(0).store(word, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.region.atomic_u64(0).load(Ordering::Relaxed)
    }

    pub fn verify_read(&self) -> bool {
        self.get() & DCFG_VERIFY_READ != 0
    }
}

/// Driver initialization options.
#[derive(Debug, Clone)]
pub struct DriverOpts {
    /// Shared-memory group id; processes with the same id cooperate.
    pub shm_id: u32,
    /// Memory reservation hint handed to transports that need one, in MiB.
    pub mem_size_mb: u32,
    /// Where the primary process serves RPC; `None` disables the server.
    pub rpc_socket: Option<PathBuf>,
    /// PRNG seed; the default keeps workloads reproducible.
    pub seed: u64,
    /// Spread cooperating processes across cores by pid.
    pub core_affinity: bool,
    /// Overrides the shared-memory namespace derived from `shm_id`.
    pub shm_namespace: Option<String>,
}

impl Default for DriverOpts {
    fn default() -> Self {
        Self {
            shm_id: 0,
            mem_size_mb: 2048,
            rpc_socket: Some(PathBuf::from(crate::rpc::DEFAULT_SOCKET)),
            seed: 1,
            core_affinity: true,
            shm_namespace: None,
        }
    }
}

impl DriverOpts {
    fn namespace(&self) -> String {
        self.shm_namespace
            .clone()
            .unwrap_or_else(|| format!("nvt-shm{}", self.shm_id))
    }
}

/// The per-process driver instance: owns the shared tables (as primary) or
/// attachments to them, the RPC thread, and the deterministic PRNG.
pub struct Driver {
    registry: Registry,
    cmdlog: Arc<CmdLog>,
    config: Arc<ConfigWord>,
    rng: RefCell<ChaCha8Rng>,
    _rpc: Option<RpcServer>,
}

impl Driver {
    pub fn init(opts: DriverOpts) -> Result<Self, DriverError> {
        // Best-effort: a host application may already have a subscriber.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();

        if opts.core_affinity {
            set_core_affinity();
        }

        let namespace = opts.namespace();
        let registry = Registry::open(&namespace)?;

        let cmdlog_region = Arc::new(registry.create_or_attach("cmdlog-table", CMD_LOG_BYTES)?);
        let cmdlog = Arc::new(CmdLog::new(cmdlog_region.clone(), registry.is_primary()));
        let config_region = Arc::new(registry.create_or_attach("global-config", 8)?);
        let config = Arc::new(ConfigWord::new(config_region));
        if registry.is_primary() {
            config.set(0);
        }
        // The admin queue is always live.
        cmdlog.qpair_init(0);

        let rpc = match (&opts.rpc_socket, registry.is_primary()) {
            (Some(path), true) => Some(
                RpcServer::start(path.clone(), cmdlog_region).map_err(DriverError::Rpc)?,
            ),
            _ => None,
        };

        info!(
            namespace = %namespace,
            primary = registry.is_primary(),
            mem_size_mb = opts.mem_size_mb,
            "driver initialized"
        );

        Ok(Self {
            registry,
            cmdlog,
            config,
            rng: RefCell::new(ChaCha8Rng::seed_from_u64(opts.seed)),
            _rpc: rpc,
        })
    }

    pub fn is_primary(&self) -> bool {
        self.registry.is_primary()
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn cmdlog(&self) -> Arc<CmdLog> {
        self.cmdlog.clone()
    }

    pub(crate) fn config_handle(&self) -> Arc<ConfigWord> {
        self.config.clone()
    }

    /// Overwrites the global configuration word.
    pub fn config(&self, word: u64) {
        self.config.set(word);
    }

    pub fn config_word(&self) -> u64 {
        self.config.get()
    }

    /// The driver-wide PRNG, seeded deterministically at init.
    pub fn rng(&self) -> RefMut<'_, ChaCha8Rng> {
        self.rng.borrow_mut()
    }

    /// Binds a connected transport to a controller handle.
    ///
    /// The address decides the flavor: a string with ':' separators is a
    /// PCIe BDF, anything else a fabrics target on port 4420.
    pub fn probe(
        &self,
        transport: Rc<dyn Transport>,
        traddr: &str,
    ) -> Result<Controller, DriverError> {
        let trid = TransportId::parse(traddr);
        let ctrlr_info = transport.controller_info();
        info!(?trid, max_xfer_size = ctrlr_info.max_xfer_size, "attached NVMe controller");
        Ok(Controller {
            transport,
            cmdlog: self.cmdlog.clone(),
            config: self.config.clone(),
            csum: RefCell::new(None),
            traddr: traddr.to_string(),
            max_xfer_size: ctrlr_info.max_xfer_size,
        })
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        if self.registry.is_primary() {
            self.cmdlog.qpair_clear(0);
            debug!("driver unloaded");
        }
        // The RPC thread stops via its own drop; the primary's regions are
        // unlinked when their handles fall.
    }
}

/// `1 << (pid % nproc)`: spread cooperating processes across cores.
fn set_core_affinity() {
    let nproc = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let cpu = std::process::id() as usize % nproc;
    let mut cpuset = CpuSet::new();
    if cpuset.set(cpu).is_ok() {
        match sched_setaffinity(Pid::from_raw(0), &cpuset) {
            Ok(()) => debug!(cpu, "pinned process to core"),
            Err(err) => warn!(%err, cpu, "failed to set core affinity"),
        }
    }
}

/// A probed controller: the transport plus the shared state raw submissions
/// need.
pub struct Controller {
    transport: Rc<dyn Transport>,
    cmdlog: Arc<CmdLog>,
    config: Arc<ConfigWord>,
    // Filled in once a namespace is opened; raw trim-like commands consult
    // it to keep the checksum table honest.
    csum: RefCell<Option<CsumTable>>,
    traddr: String,
    max_xfer_size: u32,
}

impl Controller {
    pub fn traddr(&self) -> &str {
        &self.traddr
    }

    pub fn max_xfer_size(&self) -> u32 {
        self.max_xfer_size
    }

    pub(crate) fn transport(&self) -> &Rc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn cmdlog(&self) -> &Arc<CmdLog> {
        &self.cmdlog
    }

    pub(crate) fn attach_csum(&self, table: CsumTable) {
        *self.csum.borrow_mut() = Some(table);
    }

    /// Drains pending admin completions, running their hooks and callbacks.
    pub fn process_admin_completions(&self) -> u32 {
        self.transport.process_admin_completions()
    }

    pub fn get_reg32(&self, offset: u32) -> Result<u32, DriverError> {
        Ok(self.transport.get_reg32(offset)?)
    }

    pub fn set_reg32(&self, offset: u32, value: u32) -> Result<(), DriverError> {
        Ok(self.transport.set_reg32(offset, value)?)
    }

    pub fn cfg_read8(&self, offset: u32) -> Result<u8, DriverError> {
        Ok(self.transport.cfg_read8(offset)?)
    }

    pub fn cfg_write8(&self, offset: u32, value: u8) -> Result<(), DriverError> {
        Ok(self.transport.cfg_write8(offset, value)?)
    }

    pub fn register_aer_cb(&self, cb: nvt_nvme::AerCallback) {
        self.transport.register_aer_cb(cb);
    }

    pub fn register_timeout_cb(&self, timeout_s: u32, cb: nvt_nvme::TimeoutCallback) {
        self.transport.register_timeout_cb(timeout_s, cb);
    }

    /// Renders the admin queue's command log, newest first.
    pub fn dump_admin_cmdlog(&self, count: usize) -> String {
        dump_table(self.cmdlog.region(), 0, count)
    }

    /// Submits an arbitrary command, admin when `qpair` is `None`.
    ///
    /// Raw submissions are logged without a verification context, so raw
    /// reads are never checksum-verified. Data-destroying opcodes update the
    /// checksum table before submission: Dataset Management and Write Zeroes
    /// unmap their ranges, Write Uncorrectable poisons its range, Format and
    /// Sanitize wipe the whole table.
    #[allow(clippy::too_many_arguments)]
    pub fn send_cmd_raw(
        &self,
        qpair: Option<&QueuePair>,
        opcode: u8,
        nsid: u32,
        buf: Option<&mut DmaBuf>,
        len: usize,
        cdw10: u32,
        cdw11: u32,
        cdw12: u32,
        cdw13: u32,
        cdw14: u32,
        cdw15: u32,
        cb: Option<IoCallback>,
    ) -> Result<(), DriverError> {
        let cmd = Command {
            opc: opcode,
            nsid,
            cdw10,
            cdw11,
            cdw12,
            cdw13,
            cdw14,
            cdw15,
            ..Command::default()
        };

        let qid = qpair.map_or(0, |q| q.id());
        let (ptr, data): (*mut u8, Option<&[u8]>) = match buf {
            Some(b) => {
                if len > b.len() {
                    return Err(DriverError::BufferTooSmall {
                        len: b.len(),
                        needed: len,
                    });
                }
                (b.as_ptr(), Some(&b.as_slice()[..len]))
            }
            None => (std::ptr::null_mut(), None),
        };

        if let Some(table) = &*self.csum.borrow() {
            let slba = cmd.slba();
            let nlb = cmd.nlb() as u64;
            match (qid, opcode) {
                (q, opc::DATASET_MANAGEMENT) if q != 0 => {
                    if let Some(data) = data {
                        deallocate_ranges(table, data, (cdw10 & 0xff) as usize + 1);
                    }
                }
                (q, opc::WRITE_UNCORRECTABLE) if q != 0 => table.clear(slba, nlb, false, true),
                (q, opc::WRITE_ZEROES) if q != 0 => table.clear(slba, nlb, false, false),
                (0, opc::ADMIN_FORMAT_NVM) | (0, opc::ADMIN_SANITIZE) => {
                    table.clear(0, 0, true, false)
                }
                _ => {}
            }
        }

        let entry = self.cmdlog.add_cmd(qid, 0, 0, 0, 0, &cmd);
        let cmdlog = self.cmdlog.clone();
        let config = self.config.clone();
        self.transport.submit_raw(
            qid,
            &cmd,
            ptr,
            len,
            Box::new(move |cpl| cmdlog.complete(entry, cpl, &config, None, cb)),
        )?;
        Ok(())
    }

    /// Detaches from the controller; every I/O queue pair must already be
    /// freed.
    pub fn close(self) -> Result<(), DriverError> {
        let live = self.transport.active_io_qpairs();
        if live > 0 {
            return Err(TransportError::QueuesStillLive { count: live }.into());
        }
        debug!(traddr = %self.traddr, "controller closed");
        Ok(())
    }
}

/// Marks every Dataset Management range unmapped in the checksum table
/// before the trim reaches the device.
fn deallocate_ranges(table: &CsumTable, data: &[u8], nr: usize) {
    for chunk in data.chunks_exact(std::mem::size_of::<DsmRange>()).take(nr) {
        let range: DsmRange = bytemuck::pod_read_unaligned(chunk);
        debug!(
            lba = range.starting_lba,
            count = range.length,
            "deallocate range"
        );
        table.clear(range.starting_lba, range.length as u64, false, false);
    }
}
