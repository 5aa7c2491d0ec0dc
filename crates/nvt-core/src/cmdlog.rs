//! Per-queue command log: a ring of the most recent submissions and their
//! completions.
//!
//! This is not the SQ/CQ. It exists so a test author can dump what was on
//! the wire after the fact. Entries live in shared memory so any cooperating
//! process can dump any queue. The tail is only ever advanced by the
//! submitter; readers (dump, RPC) take non-synchronized snapshots and may be
//! stale by a few entries, which is fine for diagnostics.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use nvt_nvme::{
    format_command, format_completion, opc, Command, Completion, IoCallback, SCT_MEDIA_ERROR,
    SC_UNRECOVERED_READ_ERROR,
};
use nvt_shm::ShmRegion;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::warn;

use crate::csum::CsumTable;
use crate::driver::ConfigWord;
use crate::now_us;
use crate::verify::verify;

/// Entries per queue. One slot of the 2048-entry footprint is reserved for
/// the tail word, and the depth stays strictly above any NVMe queue depth so
/// every outstanding command is recoverable from the log.
pub const CMD_LOG_DEPTH: usize = 2048 - 1;
/// Queue slots: admin queue 0 plus I/O queues 1..=15.
pub const CMD_LOG_MAX_Q: u16 = 16;

/// Tail value marking a queue slot as not live.
const TAIL_CLEARED: u32 = CMD_LOG_DEPTH as u32;

/// One logged command: the submission, its completion, wall-clock
/// timestamps, and the context needed to verify read data after the fact.
/// Fixed at three cache lines for ABI stability across processes.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct CmdLogEntry {
    pub cmd: Command,
    pub cpl: Completion,
    pub time_cmd_us: u64,
    pub time_cpl_us: u64,
    /// Data buffer address, 0 when the command carried no verifiable data.
    pub buf: u64,
    pub lba: u64,
    pub lba_count: u32,
    pub lba_size: u32,
    reserved: [u64; 9],
}

const _: () = assert!(std::mem::size_of::<CmdLogEntry>() == 192);

/// One queue's ring plus its tail word, padded back to a whole number of
/// entries.
#[repr(C)]
struct CmdLogTable {
    entries: [CmdLogEntry; CMD_LOG_DEPTH],
    tail: AtomicU32,
    _pad: [u32; 47],
}

const _: () = assert!(std::mem::size_of::<CmdLogTable>() == 192 * 2048);

/// Shared-memory footprint of all queue slots.
pub(crate) const CMD_LOG_BYTES: u64 =
    (std::mem::size_of::<CmdLogTable>() * CMD_LOG_MAX_Q as usize) as u64;

/// Locates a logged command so the completion hook can find it without a
/// search.
#[derive(Debug, Clone, Copy)]
pub struct EntryRef {
    qid: u16,
    slot: u32,
}

/// Handle to the shared command-log tables.
pub struct CmdLog {
    region: Arc<ShmRegion>,
}

impl CmdLog {
    pub(crate) fn new(region: Arc<ShmRegion>, primary: bool) -> Self {
        let log = Self { region };
        if primary {
            for qid in 0..CMD_LOG_MAX_Q {
                log.qpair_clear(qid);
            }
        }
        log
    }

    pub(crate) fn region(&self) -> &Arc<ShmRegion> {
        &self.region
    }

    fn table_ptr(&self, qid: u16) -> *mut CmdLogTable {
        assert!(qid < CMD_LOG_MAX_Q);
        unsafe { (self.region.as_ptr() as *mut CmdLogTable).add(qid as usize) }
    }

    // Only the tail word is ever referenced; entries go through raw pointers
    // so concurrent writers never sit behind a shared reference.
    fn tail_atomic(&self, qid: u16) -> &AtomicU32 {
        unsafe { &*std::ptr::addr_of!((*self.table_ptr(qid)).tail) }
    }

    fn entry_ptr(&self, entry: EntryRef) -> *mut CmdLogEntry {
        assert!((entry.slot as usize) < CMD_LOG_DEPTH);
        unsafe {
            std::ptr::addr_of_mut!((*self.table_ptr(entry.qid)).entries[0])
                .add(entry.slot as usize)
        }
    }

    /// Marks a queue live with an empty log.
    pub fn qpair_init(&self, qid: u16) {
        self.tail_atomic(qid).store(0, Ordering::Relaxed);
    }

    /// Marks a queue not live.
    pub fn qpair_clear(&self, qid: u16) {
        self.tail_atomic(qid).store(TAIL_CLEARED, Ordering::Relaxed);
    }

    /// Snapshot of the next-write slot; equals [`CMD_LOG_DEPTH`] when the
    /// queue is cleared.
    pub fn tail(&self, qid: u16) -> u32 {
        self.tail_atomic(qid).load(Ordering::Relaxed)
    }

    pub fn is_live(&self, qid: u16) -> bool {
        self.tail(qid) < TAIL_CLEARED
    }

    /// Logs a submission at the tail and advances it, returning where the
    /// completion hook will find the entry.
    pub fn add_cmd(
        &self,
        qid: u16,
        buf: u64,
        lba: u64,
        lba_count: u32,
        lba_size: u32,
        cmd: &Command,
    ) -> EntryRef {
        let tail = self.tail_atomic(qid).load(Ordering::Relaxed);
        assert!(tail < TAIL_CLEARED, "command log of queue {qid} not live");

        let entry = EntryRef { qid, slot: tail };
        unsafe {
            self.entry_ptr(entry).write(CmdLogEntry {
                cmd: *cmd,
                cpl: Completion::zeroed(),
                time_cmd_us: now_us(),
                time_cpl_us: 0,
                buf,
                lba,
                lba_count,
                lba_size,
                reserved: [0; 9],
            });
        }

        let next = if tail + 1 == TAIL_CLEARED { 0 } else { tail + 1 };
        self.tail_atomic(qid).store(next, Ordering::Relaxed);
        entry
    }

    /// The completion hook: records the completion and its latency, verifies
    /// read data when enabled, and hands the (possibly rewritten) completion
    /// to the user callback.
    ///
    /// A failed verification rewrites the status to Unrecovered Read Error
    /// (SCT 0x02, SC 0x81) before the callback sees it.
    pub fn complete(
        &self,
        entry: EntryRef,
        cpl: &Completion,
        config: &ConfigWord,
        table: Option<&CsumTable>,
        user_cb: Option<IoCallback>,
    ) {
        let e = unsafe { &mut *self.entry_ptr(entry) };
        e.time_cpl_us = now_us();
        e.cpl = *cpl;
        let latency_us = e.time_cpl_us.saturating_sub(e.time_cmd_us);
        // The reserved completion dword doubles as the latency slot the dump
        // formatter reads.
        e.cpl.rsvd1 = latency_us.min(u32::MAX as u64) as u32;

        if e.cmd.opc == opc::READ && e.buf != 0 && config.verify_read() {
            if let Some(table) = table {
                debug_assert!(e.lba_count != 0);
                debug_assert_eq!(e.lba_size, crate::SECTOR_SIZE);
                let data = unsafe {
                    std::slice::from_raw_parts(
                        e.buf as *const u8,
                        e.lba_count as usize * e.lba_size as usize,
                    )
                };
                if let Err(err) = verify(data, e.lba, e.lba_count, e.lba_size, table) {
                    warn!(qid = entry.qid, %err, "read verification failed");
                    e.cpl.set_status(SCT_MEDIA_ERROR, SC_UNRECOVERED_READ_ERROR);
                }
            }
        }

        if let Some(cb) = user_cb {
            let done = e.cpl;
            cb(&done);
        }
    }

    /// Renders the newest `count` entries (0 or oversized meaning the whole
    /// ring), newest first, submission and completion sides with wall-clock
    /// timestamps.
    pub fn dump(&self, qid: u16, count: usize) -> String {
        dump_table(&self.region, qid, count)
    }
}

fn format_wallclock(us: u64) -> String {
    let fmt =
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:6]");
    OffsetDateTime::from_unix_timestamp_nanos(us as i128 * 1000)
        .ok()
        .and_then(|t| t.format(&fmt).ok())
        .unwrap_or_else(|| format!("@{us}us"))
}

/// Dump implementation over the raw region, shared with consumers that only
/// hold the mapping.
pub(crate) fn dump_table(region: &ShmRegion, qid: u16, count: usize) -> String {
    assert!(qid < CMD_LOG_MAX_Q);
    let table = unsafe { (region.as_ptr() as *const CmdLogTable).add(qid as usize) };
    let tail = unsafe { &*std::ptr::addr_of!((*table).tail) }.load(Ordering::Relaxed);
    let entries = unsafe { std::ptr::addr_of!((*table).entries[0]) };
    let n = if count == 0 || count > CMD_LOG_DEPTH {
        CMD_LOG_DEPTH
    } else {
        count
    };

    let mut out = format!("dump qpair {qid}, latest tail in cmdlog: {tail}\n");
    let admin = qid == 0;
    for newest in 0..n {
        let idx = (tail as usize + CMD_LOG_DEPTH - 1 - newest) % CMD_LOG_DEPTH;
        // Non-synchronized snapshot; a torn entry only garbles diagnostics.
        let e = unsafe { entries.add(idx).read() };
        out.push_str(&format!(
            "index {idx}, {}\n  {}\n",
            format_wallclock(e.time_cmd_us),
            format_command(&e.cmd, admin),
        ));
        out.push_str(&format!(
            "index {idx}, {}\n  {}\n",
            format_wallclock(e.time_cpl_us),
            format_completion(&e.cpl),
        ));
    }
    out
}

/// Per-live-queue summary for the RPC surface: the tail snapshot plus the
/// opcodes of the four newest entries, most recent first.
pub(crate) fn queue_summaries(region: &ShmRegion) -> Vec<(u32, [u8; 4])> {
    let mut out = Vec::new();
    for qid in 0..CMD_LOG_MAX_Q {
        let table = unsafe { (region.as_ptr() as *const CmdLogTable).add(qid as usize) };
        let tail = unsafe { &*std::ptr::addr_of!((*table).tail) }.load(Ordering::Relaxed);
        if tail >= TAIL_CLEARED {
            continue;
        }
        let entries = unsafe { std::ptr::addr_of!((*table).entries[0]) };
        let mut opcodes = [0u8; 4];
        for (j, slot) in opcodes.iter_mut().enumerate() {
            let idx = (tail as usize + CMD_LOG_DEPTH - 1 - j) % CMD_LOG_DEPTH;
            *slot = unsafe { (*entries.add(idx)).cmd.opc };
        }
        out.push((tail, opcodes));
    }
    out
}
