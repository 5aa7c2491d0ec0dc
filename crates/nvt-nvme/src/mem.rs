use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};

use bytemuck::Zeroable;
use tracing::{debug, trace};

use crate::cmd::{opc, SCT_MEDIA_ERROR, SC_UNRECOVERED_READ_ERROR};
use crate::transport::{
    AerCallback, ControllerInfo, IoCallback, NamespaceInfo, QpairOpts, TimeoutCallback, Transport,
};
use crate::{Command, Completion, DsmRange, Result, TransportError};

/// Geometry and limits of the RAM-backed controller model.
#[derive(Debug, Clone, Copy)]
pub struct MemConfig {
    pub num_sectors: u64,
    pub sector_size: u32,
    /// Maximum data transfer size per command, in bytes.
    pub max_xfer_size: u32,
    /// Highest queue id the model will hand out.
    pub max_qpairs: u16,
}

impl Default for MemConfig {
    fn default() -> Self {
        Self {
            num_sectors: 4096,
            sector_size: 512,
            max_xfer_size: 128 * 1024,
            max_qpairs: 64,
        }
    }
}

struct PendingCpl {
    cpl: Completion,
    cb: IoCallback,
}

struct State {
    disk: Vec<u8>,
    uncorr: HashSet<u64>,
    live: Vec<bool>,
    pending: Vec<VecDeque<PendingCpl>>,
    inject: VecDeque<u16>,
    cfg_space: [u8; 256],
    regs: Vec<u32>,
    timeout_cb: Option<(u32, TimeoutCallback)>,
    aer_cb: Option<AerCallback>,
}

/// An in-memory NVMe controller with one namespace.
///
/// Commands execute synchronously against the RAM disk at submission, but
/// their completions are only delivered when the queue is polled, matching
/// the polled-mode contract real transports have. Completion callbacks run
/// with no internal borrow held, so they may submit follow-up commands.
pub struct MemTransport {
    cfg: MemConfig,
    state: RefCell<State>,
}

impl MemTransport {
    pub fn new(cfg: MemConfig) -> Self {
        let nqueues = cfg.max_qpairs as usize + 1;
        let state = State {
            disk: vec![0u8; (cfg.num_sectors * cfg.sector_size as u64) as usize],
            uncorr: HashSet::new(),
            live: {
                let mut v = vec![false; nqueues];
                v[0] = true; // admin queue always exists
                v
            },
            pending: (0..nqueues).map(|_| VecDeque::new()).collect(),
            inject: VecDeque::new(),
            cfg_space: [0u8; 256],
            regs: vec![0u32; 1024],
            timeout_cb: None,
            aer_cb: None,
        };
        Self {
            cfg,
            state: RefCell::new(state),
        }
    }

    /// Queues an 11-bit completion status to be reported by the next
    /// submitted command instead of executing it.
    pub fn inject_status(&self, status: u16) {
        self.state.borrow_mut().inject.push_back(status & 0x7ff);
    }

    /// Overwrites the whole backing disk with `byte`.
    pub fn fill_disk(&self, byte: u8) {
        self.state.borrow_mut().disk.fill(byte);
    }

    /// Raw bytes of one sector, straight from the backing store.
    pub fn sector_bytes(&self, lba: u64) -> Vec<u8> {
        let ss = self.cfg.sector_size as usize;
        let start = lba as usize * ss;
        self.state.borrow().disk[start..start + ss].to_vec()
    }

    /// Completions currently waiting to be polled on a queue.
    pub fn pending_completions(&self, qid: u16) -> usize {
        self.state.borrow().pending[qid as usize].len()
    }

    fn execute(&self, state: &mut State, cmd: &Command, buf: *mut u8, len: usize) -> Completion {
        let ss = self.cfg.sector_size as usize;
        let nsze = self.cfg.num_sectors;

        let lba = cmd.slba();
        let nlb = cmd.nlb() as u64;
        let in_range = lba.checked_add(nlb).map_or(false, |end| end <= nsze);

        match cmd.opc {
            opc::FLUSH => Completion::zeroed(),
            opc::WRITE => {
                let xfer = nlb as usize * ss;
                if !in_range {
                    return Completion::with_status(0, 0x80); // LBA Out of Range
                }
                if buf.is_null() || len < xfer {
                    return Completion::with_status(0, 0x02); // Invalid Field
                }
                let src = unsafe { std::slice::from_raw_parts(buf as *const u8, xfer) };
                let start = lba as usize * ss;
                state.disk[start..start + xfer].copy_from_slice(src);
                for l in lba..lba + nlb {
                    state.uncorr.remove(&l);
                }
                Completion::zeroed()
            }
            opc::READ => {
                let xfer = nlb as usize * ss;
                if !in_range {
                    return Completion::with_status(0, 0x80);
                }
                if buf.is_null() || len < xfer {
                    return Completion::with_status(0, 0x02);
                }
                if (lba..lba + nlb).any(|l| state.uncorr.contains(&l)) {
                    return Completion::with_status(SCT_MEDIA_ERROR, SC_UNRECOVERED_READ_ERROR);
                }
                let dst = unsafe { std::slice::from_raw_parts_mut(buf, xfer) };
                let start = lba as usize * ss;
                dst.copy_from_slice(&state.disk[start..start + xfer]);
                Completion::zeroed()
            }
            opc::WRITE_UNCORRECTABLE => {
                if !in_range {
                    return Completion::with_status(0, 0x80);
                }
                for l in lba..lba + nlb {
                    state.uncorr.insert(l);
                }
                Completion::zeroed()
            }
            opc::WRITE_ZEROES => {
                if !in_range {
                    return Completion::with_status(0, 0x80);
                }
                let start = lba as usize * ss;
                state.disk[start..start + nlb as usize * ss].fill(0);
                for l in lba..lba + nlb {
                    state.uncorr.remove(&l);
                }
                Completion::zeroed()
            }
            opc::COMPARE => {
                let xfer = nlb as usize * ss;
                if !in_range {
                    return Completion::with_status(0, 0x80);
                }
                if buf.is_null() || len < xfer {
                    return Completion::with_status(0, 0x02);
                }
                let expect = unsafe { std::slice::from_raw_parts(buf as *const u8, xfer) };
                let start = lba as usize * ss;
                if expect == &state.disk[start..start + xfer] {
                    Completion::zeroed()
                } else {
                    Completion::with_status(SCT_MEDIA_ERROR, 0x85) // Compare Failure
                }
            }
            opc::DATASET_MANAGEMENT => {
                let nr = (cmd.cdw10 & 0xff) as usize + 1;
                if buf.is_null() || len < nr * std::mem::size_of::<DsmRange>() {
                    return Completion::with_status(0, 0x02);
                }
                let bytes = unsafe {
                    std::slice::from_raw_parts(
                        buf as *const u8,
                        nr * std::mem::size_of::<DsmRange>(),
                    )
                };
                // The range list need not be 8-byte aligned.
                let ranges: Vec<DsmRange> = bytes
                    .chunks_exact(std::mem::size_of::<DsmRange>())
                    .map(bytemuck::pod_read_unaligned)
                    .collect();
                for r in ranges {
                    let end = r.starting_lba.saturating_add(r.length as u64).min(nsze);
                    let start = (r.starting_lba.min(nsze) as usize) * ss;
                    state.disk[start..end as usize * ss].fill(0);
                    for l in r.starting_lba..end {
                        state.uncorr.remove(&l);
                    }
                }
                Completion::zeroed()
            }
            _ => Completion::with_status(0, 0x01), // Invalid Command Opcode
        }
    }
}

impl Transport for MemTransport {
    fn controller_info(&self) -> ControllerInfo {
        ControllerInfo {
            max_xfer_size: self.cfg.max_xfer_size,
            num_namespaces: 1,
        }
    }

    fn namespace_info(&self, nsid: u32) -> Result<NamespaceInfo> {
        if nsid != 1 {
            return Err(TransportError::InvalidNamespace { nsid });
        }
        Ok(NamespaceInfo {
            sector_size: self.cfg.sector_size,
            num_sectors: self.cfg.num_sectors,
        })
    }

    fn alloc_io_qpair(&self, opts: QpairOpts) -> Result<u16> {
        let mut state = self.state.borrow_mut();
        let qid = state.live[1..]
            .iter()
            .position(|live| !live)
            .map(|i| i as u16 + 1)
            .ok_or(TransportError::QueueLimit {
                max: self.cfg.max_qpairs,
            })?;
        state.live[qid as usize] = true;
        debug!(
            qid,
            qprio = opts.qprio,
            io_queue_size = opts.io_queue_size,
            "allocated I/O queue pair"
        );
        Ok(qid)
    }

    fn free_io_qpair(&self, qid: u16) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if qid == 0 || state.live.get(qid as usize).copied() != Some(true) {
            return Err(TransportError::NoSuchQueue { qid });
        }
        state.live[qid as usize] = false;
        // Unpolled completions die with the queue.
        state.pending[qid as usize].clear();
        Ok(())
    }

    fn active_io_qpairs(&self) -> usize {
        self.state.borrow().live[1..].iter().filter(|l| **l).count()
    }

    fn submit_raw(
        &self,
        qid: u16,
        cmd: &Command,
        buf: *mut u8,
        len: usize,
        cb: IoCallback,
    ) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.live.get(qid as usize).copied() != Some(true) {
            return Err(TransportError::NoSuchQueue { qid });
        }
        trace!(qid, opc = cmd.opc, cid = cmd.cid, "submit");
        let mut cpl = match state.inject.pop_front() {
            Some(code) => {
                let mut c = Completion::zeroed();
                c.status = code << 1;
                c
            }
            // Admin commands are accepted wholesale; the core reads geometry
            // through `namespace_info`, not Identify payloads.
            None if qid == 0 => Completion::zeroed(),
            None => self.execute(&mut state, cmd, buf, len),
        };
        cpl.cid = cmd.cid;
        cpl.sqid = qid;
        state.pending[qid as usize].push_back(PendingCpl { cpl, cb });
        Ok(())
    }

    fn process_completions(&self, qid: u16, max: u32) -> u32 {
        let mut delivered = 0u32;
        loop {
            // Take one completion per iteration so callbacks run without the
            // state borrowed; they are allowed to submit more commands.
            let next = self.state.borrow_mut().pending[qid as usize].pop_front();
            match next {
                Some(p) => {
                    (p.cb)(&p.cpl);
                    delivered += 1;
                    if max != 0 && delivered == max {
                        break;
                    }
                }
                None => break,
            }
        }
        delivered
    }

    fn cfg_read8(&self, offset: u32) -> Result<u8> {
        self.state
            .borrow()
            .cfg_space
            .get(offset as usize)
            .copied()
            .ok_or(TransportError::BadRegister { offset })
    }

    fn cfg_write8(&self, offset: u32, value: u8) -> Result<()> {
        let mut state = self.state.borrow_mut();
        match state.cfg_space.get_mut(offset as usize) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(TransportError::BadRegister { offset }),
        }
    }

    fn get_reg32(&self, offset: u32) -> Result<u32> {
        if offset % 4 != 0 {
            return Err(TransportError::BadRegister { offset });
        }
        self.state
            .borrow()
            .regs
            .get(offset as usize / 4)
            .copied()
            .ok_or(TransportError::BadRegister { offset })
    }

    fn set_reg32(&self, offset: u32, value: u32) -> Result<()> {
        if offset % 4 != 0 {
            return Err(TransportError::BadRegister { offset });
        }
        let mut state = self.state.borrow_mut();
        match state.regs.get_mut(offset as usize / 4) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(TransportError::BadRegister { offset }),
        }
    }

    fn register_timeout_cb(&self, timeout_s: u32, cb: TimeoutCallback) {
        self.state.borrow_mut().timeout_cb = Some((timeout_s, cb));
    }

    fn register_aer_cb(&self, cb: AerCallback) {
        self.state.borrow_mut().aer_cb = Some(cb);
    }
}
