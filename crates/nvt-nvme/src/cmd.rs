use bytemuck::{Pod, Zeroable};

/// NVM command set opcodes the driver core cares about.
pub mod opc {
    pub const FLUSH: u8 = 0x00;
    pub const WRITE: u8 = 0x01;
    pub const READ: u8 = 0x02;
    pub const WRITE_UNCORRECTABLE: u8 = 0x04;
    pub const COMPARE: u8 = 0x05;
    pub const WRITE_ZEROES: u8 = 0x08;
    pub const DATASET_MANAGEMENT: u8 = 0x09;

    /// Admin command set.
    pub const ADMIN_FORMAT_NVM: u8 = 0x80;
    pub const ADMIN_SANITIZE: u8 = 0x84;
}

/// Status Code Type for media and data-integrity errors.
pub const SCT_MEDIA_ERROR: u8 = 0x02;
/// Unrecovered Read Error: the read data could not be recovered from the
/// media.
pub const SC_UNRECOVERED_READ_ERROR: u8 = 0x81;
/// Generic-status "Invalid Field in Command" in 11-bit completion-status
/// form.
pub const STATUS_INVALID_FIELD: u16 = 0x0002;

/// A submission-queue entry, laid out exactly as it crosses the wire.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Command {
    pub opc: u8,
    /// FUSE and PSDT bits.
    pub flags: u8,
    pub cid: u16,
    pub nsid: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    pub mptr: u64,
    pub prp1: u64,
    pub prp2: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

const _: () = assert!(std::mem::size_of::<Command>() == 64);

impl Command {
    /// Starting LBA of an NVM read/write-style command (cdw10/cdw11).
    pub fn slba(&self) -> u64 {
        (self.cdw11 as u64) << 32 | self.cdw10 as u64
    }

    /// Number of logical blocks of an NVM read/write-style command
    /// (zero-based cdw12 field).
    pub fn nlb(&self) -> u32 {
        (self.cdw12 & 0xffff) + 1
    }
}

/// A completion-queue entry.
///
/// `status` carries the phase tag in bit 0, the status code in bits 1..=8
/// and the status code type in bits 9..=11. The command log reuses `rsvd1`
/// to stash the measured latency of the completed command.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Completion {
    pub cdw0: u32,
    pub rsvd1: u32,
    pub sqhd: u16,
    pub sqid: u16,
    pub cid: u16,
    pub status: u16,
}

const _: () = assert!(std::mem::size_of::<Completion>() == 16);

impl Completion {
    /// The 11-bit status code (SCT and SC combined, phase stripped).
    pub fn status_code(&self) -> u16 {
        (self.status >> 1) & 0x7ff
    }

    pub fn sc(&self) -> u8 {
        ((self.status >> 1) & 0xff) as u8
    }

    pub fn sct(&self) -> u8 {
        ((self.status >> 9) & 0x7) as u8
    }

    pub fn is_error(&self) -> bool {
        self.status_code() != 0
    }

    /// Rewrites the status field, preserving the phase tag.
    pub fn set_status(&mut self, sct: u8, sc: u8) {
        self.status = (self.status & 0x1) | ((sc as u16) << 1) | (((sct as u16) & 0x7) << 9);
    }

    /// A completion carrying the given status, everything else zero.
    pub fn with_status(sct: u8, sc: u8) -> Self {
        let mut cpl = Self::zeroed();
        cpl.set_status(sct, sc);
        cpl
    }
}

/// One Dataset Management range descriptor (16 bytes on the wire).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DsmRange {
    pub cattr: u32,
    /// Length in logical blocks.
    pub length: u32,
    pub starting_lba: u64,
}

const _: () = assert!(std::mem::size_of::<DsmRange>() == 16);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_field_round_trips() {
        let mut cpl = Completion::zeroed();
        cpl.status = 0x1; // phase set
        cpl.set_status(SCT_MEDIA_ERROR, SC_UNRECOVERED_READ_ERROR);
        assert_eq!(cpl.sct(), 0x02);
        assert_eq!(cpl.sc(), 0x81);
        assert_eq!(cpl.status & 0x1, 0x1, "phase tag must survive rewrite");
        assert_eq!(cpl.status_code(), (0x02 << 8) | 0x81);
        assert!(cpl.is_error());
    }

    #[test]
    fn slba_spans_both_dwords() {
        let cmd = Command {
            cdw10: 0x9abc_def0,
            cdw11: 0x1234_5678,
            cdw12: 7, // 8 blocks
            ..Command::zeroed()
        };
        assert_eq!(cmd.slba(), 0x1234_5678_9abc_def0);
        assert_eq!(cmd.nlb(), 8);
    }
}
