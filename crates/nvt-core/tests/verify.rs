mod common;

use common::rig;
use nvt_core::{csum, paint, verify, VerifyError, CSUM_UNCORRECTABLE, SECTOR_SIZE};

const SS: usize = SECTOR_SIZE as usize;

#[test]
fn paint_then_verify_round_trips() {
    let r = rig("paint-roundtrip", 128);
    let mut buf = vec![0u8; 4 * SS];
    paint(&mut buf, 10, 4, SECTOR_SIZE, r.ns.token(), r.ns.csum_table());

    verify(&buf, 10, 4, SECTOR_SIZE, r.ns.csum_table()).unwrap();

    // Every painted block leads with its own LBA.
    for i in 0..4u64 {
        let slot = &buf[i as usize * SS..];
        assert_eq!(u64::from_le_bytes(slot[..8].try_into().unwrap()), 10 + i);
    }
}

#[test]
fn corrupt_lba_prefix_is_reported_as_lba_mismatch() {
    let r = rig("lba-mismatch", 128);
    let mut buf = vec![0u8; 2 * SS];
    paint(&mut buf, 5, 2, SECTOR_SIZE, r.ns.token(), r.ns.csum_table());

    // Corrupt the embedded LBA of the second block only.
    buf[SS] ^= 0xff;
    match verify(&buf, 5, 2, SECTOR_SIZE, r.ns.csum_table()) {
        Err(VerifyError::LbaMismatch { lba, .. }) => assert_eq!(lba, 6),
        other => panic!("expected LbaMismatch, got {other:?}"),
    }
}

#[test]
fn corrupt_payload_is_reported_as_crc_mismatch() {
    let r = rig("crc-mismatch", 128);
    let mut buf = vec![0u8; SS];
    paint(&mut buf, 9, 1, SECTOR_SIZE, r.ns.token(), r.ns.csum_table());

    // A middle byte: the LBA stamp stays intact, only the CRC trips.
    buf[SS / 2] ^= 0x01;
    match verify(&buf, 9, 1, SECTOR_SIZE, r.ns.csum_table()) {
        Err(VerifyError::CrcMismatch { lba, .. }) => assert_eq!(lba, 9),
        other => panic!("expected CrcMismatch, got {other:?}"),
    }
}

#[test]
fn cleared_range_skips_verification() {
    let r = rig("clear-skip", 128);
    let mut buf = vec![0u8; SS];
    paint(&mut buf, 3, 1, SECTOR_SIZE, r.ns.token(), r.ns.csum_table());
    buf[SS / 2] ^= 0x01; // would fail CRC if verified

    r.ns.csum_table().clear(3, 1, false, false);
    verify(&buf, 3, 1, SECTOR_SIZE, r.ns.csum_table()).unwrap();
}

#[test]
fn uncorrectable_range_fails_any_read() {
    let r = rig("uncorr", 128);
    let mut buf = vec![0u8; SS];
    paint(&mut buf, 7, 1, SECTOR_SIZE, r.ns.token(), r.ns.csum_table());

    r.ns.csum_table().clear(7, 1, false, true);
    assert_eq!(r.ns.csum_table().get(7), Some(CSUM_UNCORRECTABLE));
    match verify(&buf, 7, 1, SECTOR_SIZE, r.ns.csum_table()) {
        Err(VerifyError::Uncorrectable { lba }) => assert_eq!(lba, 7),
        other => panic!("expected Uncorrectable, got {other:?}"),
    }
}

#[test]
fn sanitize_unmaps_the_whole_table() {
    let r = rig("sanitize", 64);
    let mut buf = vec![0u8; SS];
    for lba in 0..64 {
        paint(&mut buf, lba, 1, SECTOR_SIZE, r.ns.token(), r.ns.csum_table());
    }

    r.ns.csum_table().clear(0, 0, true, false);
    for lba in 0..64 {
        assert_eq!(r.ns.csum_table().get(lba), Some(0), "lba {lba} not unmapped");
    }
}

#[test]
fn token_stamps_make_identical_writes_distinct() {
    let r = rig("token", 128);
    let mut first = vec![0u8; SS];
    let mut second = vec![0u8; SS];
    paint(&mut first, 0, 1, SECTOR_SIZE, r.ns.token(), r.ns.csum_table());
    paint(&mut second, 0, 1, SECTOR_SIZE, r.ns.token(), r.ns.csum_table());

    assert_ne!(first, second, "token must differ between writes");
    assert_ne!(csum(&first), csum(&second));
}

#[test]
fn token_increases_by_block_count() {
    let r = rig("token-count", 128);
    let before = r.ns.token().current();
    let mut buf = vec![0u8; 8 * SS];
    paint(&mut buf, 0, 8, SECTOR_SIZE, r.ns.token(), r.ns.csum_table());
    assert_eq!(r.ns.token().current(), before + 8);
}
