use std::rc::Rc;

use nvt_nvme::{QpairOpts, Transport};
use tracing::debug;

use crate::cmdlog::{dump_table, CmdLog, CMD_LOG_MAX_Q};
use crate::driver::Controller;
use crate::DriverError;

/// An I/O queue pair bound to one host context, with its command-log slot.
///
/// Clones share the same queue; the transport resource and the log slot are
/// released when the last clone drops.
#[derive(Clone)]
pub struct QueuePair {
    inner: Rc<Inner>,
}

struct Inner {
    qid: u16,
    transport: Rc<dyn Transport>,
    cmdlog: std::sync::Arc<CmdLog>,
}

impl QueuePair {
    /// Allocates an I/O queue pair with twice the request slots of its depth
    /// and wires up its command log. Queue ids beyond the log's capacity are
    /// handed back immediately.
    pub fn create(ctrlr: &Controller, qprio: u8, depth: u16) -> Result<Self, DriverError> {
        let transport = ctrlr.transport().clone();
        let qid = transport.alloc_io_qpair(QpairOpts {
            qprio,
            io_queue_size: depth,
            io_queue_requests: depth as u32 * 2,
        })?;
        if qid >= CMD_LOG_MAX_Q {
            let _ = transport.free_io_qpair(qid);
            return Err(DriverError::TooManyQueues {
                qid,
                max: CMD_LOG_MAX_Q,
            });
        }
        ctrlr.cmdlog().qpair_init(qid);
        debug!(qid, depth, "queue pair created");
        Ok(Self {
            inner: Rc::new(Inner {
                qid,
                transport,
                cmdlog: ctrlr.cmdlog().clone(),
            }),
        })
    }

    pub fn id(&self) -> u16 {
        self.inner.qid
    }

    /// Drains up to `max` completions (0 means everything pending), running
    /// the command-log hook, the verifier and user callbacks on this thread.
    pub fn process_completions(&self, max: u32) -> u32 {
        self.inner.transport.process_completions(self.inner.qid, max)
    }

    /// Renders this queue's command log, newest first.
    pub fn dump_cmdlog(&self, count: usize) -> String {
        dump_table(self.inner.cmdlog.region(), self.inner.qid, count)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        debug!(qid = self.qid, "queue pair freed");
        self.cmdlog.qpair_clear(self.qid);
        let _ = self.transport.free_io_qpair(self.qid);
    }
}
