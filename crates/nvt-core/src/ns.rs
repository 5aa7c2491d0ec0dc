use std::rc::Rc;
use std::sync::Arc;

use nvt_nvme::{opc, Command, IoCallback, Transport};
use tracing::warn;

use crate::cmdlog::CmdLog;
use crate::csum::CsumTable;
use crate::dma::DmaBuf;
use crate::driver::{ConfigWord, Controller, Driver};
use crate::qpair::QueuePair;
use crate::verify::{paint, IoToken};
use crate::{DriverError, SECTOR_SIZE};

/// The single validated namespace: geometry plus the shared token and
/// checksum table backing the painter and verifier.
///
/// Cheap to clone; the worker clones one per run.
#[derive(Clone)]
pub struct Namespace {
    transport: Rc<dyn Transport>,
    cmdlog: Arc<CmdLog>,
    config: Arc<ConfigWord>,
    csum: CsumTable,
    token: IoToken,
    nsid: u32,
    sector_size: u32,
    num_sectors: u64,
    max_xfer_size: u32,
}

impl Namespace {
    /// Opens namespace `nsid` and wires up the shared validation state.
    ///
    /// The write token is mandatory; the checksum table is best-effort: if
    /// the host cannot back one word per sector, verification silently
    /// degrades to a no-op.
    pub fn open(driver: &Driver, ctrlr: &Controller, nsid: u32) -> Result<Self, DriverError> {
        let info = ctrlr.transport().namespace_info(nsid)?;

        let token_region = Arc::new(driver.registry().create_or_attach("io-token", 8)?);
        let token = IoToken::new(token_region);

        let table_len = info
            .num_sectors
            .saturating_mul(std::mem::size_of::<u32>() as u64);
        let csum = match driver.registry().create_or_attach("crc32-table", table_len) {
            Ok(region) => CsumTable::new(Some(Arc::new(region)), info.num_sectors),
            Err(err) => {
                warn!(
                    %err,
                    "memory is not large enough to keep checksums of the whole drive; \
                     data verification is disabled"
                );
                CsumTable::new(None, info.num_sectors)
            }
        };
        ctrlr.attach_csum(csum.clone());

        Ok(Self {
            transport: ctrlr.transport().clone(),
            cmdlog: ctrlr.cmdlog().clone(),
            config: driver.config_handle(),
            csum,
            token,
            nsid,
            sector_size: info.sector_size,
            num_sectors: info.num_sectors,
            max_xfer_size: ctrlr.max_xfer_size(),
        })
    }

    pub fn nsid(&self) -> u32 {
        self.nsid
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    pub fn num_sectors(&self) -> u64 {
        self.num_sectors
    }

    pub(crate) fn max_xfer_size(&self) -> u32 {
        self.max_xfer_size
    }

    pub fn csum_table(&self) -> &CsumTable {
        &self.csum
    }

    pub fn token(&self) -> &IoToken {
        &self.token
    }

    /// Submits one read or write.
    ///
    /// Writes are painted (LBA stamp, token stamp, checksum recorded) before
    /// submission; reads are verified inside the completion hook when the
    /// global verify bit is set. `io_flags` occupies the upper bits of
    /// cdw12, so its low 16 bits must be clear. The buffer must stay alive
    /// until the completion has been polled.
    #[allow(clippy::too_many_arguments)]
    pub fn read_write(
        &self,
        is_read: bool,
        qpair: &QueuePair,
        buf: &mut DmaBuf,
        len: usize,
        lba: u64,
        lba_count: u32,
        io_flags: u32,
        cb: Option<IoCallback>,
    ) -> Result<(), DriverError> {
        if self.sector_size != SECTOR_SIZE {
            return Err(DriverError::UnsupportedSectorSize {
                sector_size: self.sector_size,
            });
        }
        if self.nsid != 1 {
            return Err(DriverError::UnsupportedNamespace { nsid: self.nsid });
        }
        // The block count lives in the low 16 bits of cdw12, zero-based.
        if lba_count == 0 || lba_count > 0x1_0000 || io_flags & 0xffff != 0 {
            return Err(DriverError::InvalidIoFlags { io_flags });
        }
        let needed = lba_count as usize * self.sector_size as usize;
        if len < needed || len > buf.len() {
            return Err(DriverError::BufferTooSmall {
                len: buf.len().min(len),
                needed,
            });
        }

        let cmd = Command {
            opc: if is_read { opc::READ } else { opc::WRITE },
            nsid: self.nsid,
            cdw10: lba as u32,
            cdw11: (lba >> 32) as u32,
            cdw12: io_flags | (lba_count - 1),
            ..Command::default()
        };

        if !is_read {
            paint(
                &mut buf.as_mut_slice()[..needed],
                lba,
                lba_count,
                self.sector_size,
                &self.token,
                &self.csum,
            );
        }

        let entry = self.cmdlog.add_cmd(
            qpair.id(),
            buf.as_ptr() as u64,
            lba,
            lba_count,
            self.sector_size,
            &cmd,
        );

        let cmdlog = self.cmdlog.clone();
        let config = self.config.clone();
        let table = self.csum.clone();
        self.transport.submit_raw(
            qpair.id(),
            &cmd,
            buf.as_ptr(),
            len,
            Box::new(move |cpl| cmdlog.complete(entry, cpl, &config, Some(&table), cb)),
        )?;
        Ok(())
    }
}
