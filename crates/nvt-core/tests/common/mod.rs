// Not every test file uses every helper.
#![allow(dead_code)]

use std::process;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

use nvt_core::{Controller, Driver, DriverOpts, Namespace};
use nvt_nvme::{MemConfig, MemTransport};

static NEXT_NS: AtomicU32 = AtomicU32::new(0);

/// Shared-memory namespaces must be unique per test and per run.
pub fn unique_ns(tag: &str) -> String {
    let n = NEXT_NS.fetch_add(1, Ordering::Relaxed);
    format!("nvt-test-{tag}-{}-{n}", process::id())
}

pub fn test_driver(tag: &str) -> Driver {
    Driver::init(DriverOpts {
        rpc_socket: None,
        core_affinity: false,
        shm_namespace: Some(unique_ns(tag)),
        ..DriverOpts::default()
    })
    .unwrap()
}

pub struct Rig {
    pub driver: Driver,
    pub ctrlr: Controller,
    pub ns: Namespace,
    pub transport: Rc<MemTransport>,
}

/// Driver + RAM controller + namespace, isolated from every other test.
pub fn rig(tag: &str, sectors: u64) -> Rig {
    let driver = test_driver(tag);
    let transport = Rc::new(MemTransport::new(MemConfig {
        num_sectors: sectors,
        ..MemConfig::default()
    }));
    let ctrlr = driver.probe(transport.clone(), "0000:01:00.0").unwrap();
    let ns = Namespace::open(&driver, &ctrlr, 1).unwrap();
    Rig {
        driver,
        ctrlr,
        ns,
        transport,
    }
}
