use std::process;
use std::sync::atomic::{AtomicU32, Ordering};

use nvt_shm::{Registry, Role};

static NEXT_NS: AtomicU32 = AtomicU32::new(0);

// Namespaces must be unique per test (and per run) so parallel tests and
// leftovers from aborted runs cannot collide.
fn unique_ns(tag: &str) -> String {
    let n = NEXT_NS.fetch_add(1, Ordering::Relaxed);
    format!("nvt-test-{tag}-{}-{n}", process::id())
}

#[test]
fn first_open_wins_primary_election() {
    let ns = unique_ns("election");
    let first = Registry::open(&ns).unwrap();
    let second = Registry::open(&ns).unwrap();

    assert_eq!(first.role(), Role::Primary);
    assert!(first.is_primary());
    assert_eq!(second.role(), Role::Secondary);
    assert!(!second.is_primary());
}

#[test]
fn primary_claim_is_released_on_drop() {
    let ns = unique_ns("release");
    {
        let first = Registry::open(&ns).unwrap();
        assert!(first.is_primary());
    }
    // Guard unlinked: a fresh open wins the election again.
    let next = Registry::open(&ns).unwrap();
    assert!(next.is_primary());
}

#[test]
fn attached_region_sees_creator_writes() {
    let ns = unique_ns("share");
    let primary = Registry::open(&ns).unwrap();
    let secondary = Registry::open(&ns).unwrap();

    let created = primary.create_or_attach("table", 4096).unwrap();
    let attached = secondary.create_or_attach("table", 4096).unwrap();

    created.atomic_u64(0).store(0xdead_beef, Ordering::SeqCst);
    created.atomic_u32_slice(8, 4)[2].store(77, Ordering::SeqCst);

    assert_eq!(attached.atomic_u64(0).load(Ordering::SeqCst), 0xdead_beef);
    assert_eq!(attached.atomic_u32_slice(8, 4)[2].load(Ordering::SeqCst), 77);
}

#[test]
fn regions_are_zeroed_on_creation() {
    let ns = unique_ns("zero");
    let primary = Registry::open(&ns).unwrap();
    let region = primary.create_or_attach("zeroed", 1 << 16).unwrap();

    assert_eq!(region.len(), 1 << 16);
    for word in region.atomic_u32_slice(0, (1 << 16) / 4) {
        assert_eq!(word.load(Ordering::Relaxed), 0);
    }
}

#[test]
fn secondary_cannot_attach_missing_region() {
    let ns = unique_ns("missing");
    let _primary = Registry::open(&ns).unwrap();
    let secondary = Registry::open(&ns).unwrap();

    assert!(secondary.create_or_attach("never-created", 64).is_err());
}

#[test]
fn namespace_with_slash_is_rejected() {
    assert!(Registry::open("bad/ns").is_err());
    assert!(Registry::open("").is_err());
}
