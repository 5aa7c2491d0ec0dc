use nvt_nvme::{cmd_name, format_command, format_completion, opc, Command, Completion};

#[test]
fn io_opcode_names() {
    assert_eq!(cmd_name(opc::WRITE, 1), "Write");
    assert_eq!(cmd_name(opc::READ, 1), "Read");
    assert_eq!(cmd_name(opc::WRITE_UNCORRECTABLE, 1), "Write Uncorrectable");
    assert_eq!(cmd_name(opc::DATASET_MANAGEMENT, 1), "Dataset Management");
    assert_eq!(cmd_name(0x90, 1), "Vendor specific");
    assert_eq!(cmd_name(0x7f, 1), "Unknown command");
}

#[test]
fn admin_opcode_names() {
    assert_eq!(cmd_name(0x06, 0), "Identify");
    assert_eq!(cmd_name(0x80, 0), "Format NVM");
    assert_eq!(cmd_name(0x84, 0), "Sanitize");
    assert_eq!(cmd_name(0xc0, 0), "Vendor specific");
    assert_eq!(cmd_name(0x7f, 0), "Unknown");
}

#[test]
fn unknown_set_is_reported() {
    assert_eq!(cmd_name(0x02, 7), "Unknown command set");
}

#[test]
fn command_rendering_names_the_opcode() {
    let cmd = Command {
        opc: opc::READ,
        nsid: 1,
        cdw10: 0x10,
        ..Default::default()
    };
    let line = format_command(&cmd, false);
    assert!(line.starts_with("Read"), "got: {line}");
    assert!(line.contains("cdw10 0x00000010"), "got: {line}");

    let admin = Command {
        opc: 0x06,
        ..Default::default()
    };
    assert!(format_command(&admin, true).starts_with("Identify"));
}

#[test]
fn completion_rendering_includes_latency_slot() {
    let cpl = Completion {
        cid: 9,
        rsvd1: 1234,
        ..Default::default()
    };
    let line = format_completion(&cpl);
    assert!(line.contains("cid 9"), "got: {line}");
    assert!(line.contains("latency 1234 us"), "got: {line}");
}
