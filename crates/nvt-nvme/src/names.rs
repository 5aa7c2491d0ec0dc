use crate::{Command, Completion};

fn admin_opc_name(opc: u8) -> &'static str {
    match opc {
        0x00 => "Delete I/O Submission Queue",
        0x01 => "Create I/O Submission Queue",
        0x02 => "Get Log Page",
        0x04 => "Delete I/O Completion Queue",
        0x05 => "Create I/O Completion Queue",
        0x06 => "Identify",
        0x08 => "Abort",
        0x09 => "Set Features",
        0x0a => "Get Features",
        0x0c => "Asynchronous Event Request",
        0x0d => "Namespace Management",
        0x10 => "Firmware Commit",
        0x11 => "Firmware Image Download",
        0x14 => "Device Self-test",
        0x15 => "Namespace Attachment",
        0x18 => "Keep Alive",
        0x19 => "Directive Send",
        0x1a => "Directive Receive",
        0x1c => "Virtualization Management",
        0x1d => "NVMe-MI Send",
        0x1e => "NVMe-MI Receive",
        0x7c => "Doorbell Buffer Config",
        0x80 => "Format NVM",
        0x81 => "Security Send",
        0x82 => "Security Receive",
        0x84 => "Sanitize",
        _ if opc >= 0xc0 => "Vendor specific",
        _ => "Unknown",
    }
}

fn io_opc_name(opc: u8) -> &'static str {
    match opc {
        0x00 => "Flush",
        0x01 => "Write",
        0x02 => "Read",
        0x04 => "Write Uncorrectable",
        0x05 => "Compare",
        0x08 => "Write Zeroes",
        0x09 => "Dataset Management",
        0x0d => "Reservation Register",
        0x0e => "Reservation Report",
        0x11 => "Reservation Acquire",
        0x15 => "Reservation Release",
        _ if opc >= 0x80 => "Vendor specific",
        _ => "Unknown command",
    }
}

/// Human-readable name of an opcode. `set` 0 is the admin command set,
/// `set` 1 the I/O command set.
pub fn cmd_name(opc: u8, set: u8) -> &'static str {
    match set {
        0 => admin_opc_name(opc),
        1 => io_opc_name(opc),
        _ => "Unknown command set",
    }
}

/// One-line rendering of a submitted command for the dump path.
pub fn format_command(cmd: &Command, admin: bool) -> String {
    let set = if admin { 0 } else { 1 };
    format!(
        "{} (opc {:#04x}) cid {} nsid {} cdw10 {:#010x} cdw11 {:#010x} cdw12 {:#010x} \
         cdw13 {:#010x} cdw14 {:#010x} cdw15 {:#010x}",
        cmd_name(cmd.opc, set),
        cmd.opc,
        cmd.cid,
        cmd.nsid,
        cmd.cdw10,
        cmd.cdw11,
        cmd.cdw12,
        cmd.cdw13,
        cmd.cdw14,
        cmd.cdw15,
    )
}

/// One-line rendering of a completion for the dump path. The reserved dword
/// holds the latency the command log recorded.
pub fn format_completion(cpl: &Completion) -> String {
    format!(
        "cid {} sqid {} sqhd {} sct {:#03x} sc {:#04x} cdw0 {:#010x} latency {} us",
        cpl.cid,
        cpl.sqid,
        cpl.sqhd,
        cpl.sct(),
        cpl.sc(),
        cpl.cdw0,
        cpl.rsvd1,
    )
}
