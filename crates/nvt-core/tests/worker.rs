mod common;

use common::{rig, Rig};
use nvt_core::{worker, QueuePair, WorkerArgs, WorkerError, DCFG_VERIFY_READ, US_PER_S};

fn qpair(r: &Rig) -> QueuePair {
    QueuePair::create(&r.ctrlr, 0, 128).unwrap()
}

fn run(r: &Rig, qp: &QueuePair, args: &mut WorkerArgs) -> Result<nvt_core::WorkerRets, WorkerError> {
    worker::run(&r.ns, qp, args, &mut *r.driver.rng())
}

#[test]
fn single_io_single_depth_runs_exactly_once() {
    let r = rig("one-io", 4096);
    let qp = qpair(&r);

    let mut args = WorkerArgs {
        io_count: 1,
        qdepth: 1,
        seconds: 5,
        region_end: 4096,
        ..WorkerArgs::default()
    };
    let rets = run(&r, &qp, &mut args).unwrap();
    assert_eq!(rets.io_count_read + rets.io_count_write, 1);
    assert_eq!(rets.error, 0);
}

#[test]
fn pure_write_and_pure_read_mixes() {
    let r = rig("mix", 4096);
    let qp = qpair(&r);

    let mut args = WorkerArgs {
        io_count: 100,
        qdepth: 8,
        seconds: 30,
        region_end: 4096,
        read_percentage: 0,
        ..WorkerArgs::default()
    };
    let rets = run(&r, &qp, &mut args).unwrap();
    assert_eq!(rets.io_count_write, 100);
    assert_eq!(rets.io_count_read, 0);

    args.read_percentage = 100;
    let rets = run(&r, &qp, &mut args).unwrap();
    assert_eq!(rets.io_count_read, 100);
    assert_eq!(rets.io_count_write, 0);
}

#[test]
fn sequential_region_wraps_and_stays_aligned() {
    let r = rig("wrap", 4096);
    let qp = qpair(&r);

    // region [0, 10) holds nine single-block slots; twenty I/Os must wrap.
    let mut args = WorkerArgs {
        io_count: 20,
        qdepth: 2,
        seconds: 30,
        region_start: 0,
        region_end: 10,
        ..WorkerArgs::default()
    };
    let rets = run(&r, &qp, &mut args).unwrap();
    assert_eq!(rets.io_count_write, 20);
    assert_eq!(rets.error, 0);

    // Nothing may land beyond the normalized region.
    for lba in 10..20 {
        assert_eq!(r.ns.csum_table().get(lba), Some(0), "lba {lba} was written");
    }
}

#[test]
fn sequential_start_lba_is_not_realigned() {
    let r = rig("unaligned-start", 4096);
    let qp = qpair(&r);

    // lba_start 5 is not a multiple of the 4-block alignment: the first
    // write must land at 5 exactly, only the stride snaps to the grid.
    let mut args = WorkerArgs {
        io_count: 4,
        qdepth: 1,
        seconds: 30,
        lba_start: 5,
        lba_align: 4,
        region_end: 64,
        ..WorkerArgs::default()
    };
    let rets = run(&r, &qp, &mut args).unwrap();
    assert_eq!(rets.io_count_write, 4);

    assert_ne!(r.ns.csum_table().get(5), Some(0), "first write must hit lba 5");
    assert_eq!(r.ns.csum_table().get(4), Some(0), "lba_start must not be realigned");
    // Following picks advance by the alignment and snap down: 5+4 -> 8, 12, 16.
    for lba in [8, 12, 16] {
        assert_ne!(r.ns.csum_table().get(lba), Some(0), "lba {lba} not written");
    }
    assert_eq!(r.ns.csum_table().get(9), Some(0));
}

#[test]
fn random_ios_respect_region_bounds() {
    let r = rig("random", 4096);
    let qp = qpair(&r);

    let mut args = WorkerArgs {
        io_count: 200,
        qdepth: 16,
        seconds: 30,
        lba_random: true,
        region_start: 100,
        region_end: 200,
        ..WorkerArgs::default()
    };
    let rets = run(&r, &qp, &mut args).unwrap();
    assert_eq!(rets.io_count_write, 200);

    for lba in 0..100 {
        assert_eq!(r.ns.csum_table().get(lba), Some(0), "lba {lba} outside region");
    }
    for lba in 199..300 {
        assert_eq!(r.ns.csum_table().get(lba), Some(0), "lba {lba} outside region");
    }
    let written = (100..199)
        .filter(|lba| r.ns.csum_table().get(*lba) != Some(0))
        .count();
    assert!(written > 0, "no block of the region was touched");
}

#[test]
fn full_region_write_then_verified_reads_stay_clean() {
    let r = rig("verified-reads", 4096);
    r.driver.config(DCFG_VERIFY_READ);
    let qp = qpair(&r);

    // region [0, 64) normalizes to 63 sequential single-block slots.
    let mut args = WorkerArgs {
        io_count: 63,
        qdepth: 4,
        seconds: 30,
        region_end: 64,
        ..WorkerArgs::default()
    };
    let rets = run(&r, &qp, &mut args).unwrap();
    assert_eq!(rets.io_count_write, 63);
    assert_eq!(rets.error, 0);

    args.read_percentage = 100;
    let rets = run(&r, &qp, &mut args).unwrap();
    assert_eq!(rets.io_count_read, 63);
    assert_eq!(rets.error, 0, "a verified read failed");
}

#[test]
fn first_error_stops_the_worker() {
    let r = rig("first-error", 4096);
    let qp = qpair(&r);
    r.transport.inject_status(0x0004); // Data Transfer Error

    let mut args = WorkerArgs {
        io_count: 10,
        qdepth: 1,
        seconds: 30,
        region_end: 4096,
        ..WorkerArgs::default()
    };
    let rets = run(&r, &qp, &mut args).unwrap();
    assert_eq!(rets.error, 0x0004);
    assert_eq!(rets.io_count_read + rets.io_count_write, 1);
}

#[test]
fn oversized_transfer_is_rejected_without_logging() {
    let r = rig("oversized", 4096);
    let qp = qpair(&r);
    let tail_before = r.driver.cmdlog().tail(qp.id());

    // 512 blocks of 512 bytes beat the model's 128 KiB transfer limit.
    let mut args = WorkerArgs {
        io_count: 1,
        qdepth: 1,
        seconds: 5,
        lba_size: 512,
        region_end: 4096,
        ..WorkerArgs::default()
    };
    match run(&r, &qp, &mut args) {
        Err(err @ WorkerError::OversizedTransfer { .. }) => {
            assert_eq!(err.nvme_status(), 0x0002);
        }
        other => panic!("expected OversizedTransfer, got {other:?}"),
    }
    assert_eq!(r.driver.cmdlog().tail(qp.id()), tail_before);
}

#[test]
fn bad_arguments_are_rejected() {
    let r = rig("bad-args", 4096);
    let qp = qpair(&r);

    let reject = |args: &mut WorkerArgs| {
        assert!(matches!(
            run(&r, &qp, args),
            Err(WorkerError::InvalidArgs { .. })
        ));
    };

    reject(&mut WorkerArgs {
        qdepth: 0,
        ..WorkerArgs::default()
    });
    reject(&mut WorkerArgs {
        read_percentage: 101,
        ..WorkerArgs::default()
    });
    reject(&mut WorkerArgs {
        io_count: 0,
        seconds: 0,
        ..WorkerArgs::default()
    });
    reject(&mut WorkerArgs {
        region_start: 50,
        region_end: 50,
        ..WorkerArgs::default()
    });
    reject(&mut WorkerArgs {
        qdepth: 1024,
        io_count: 100_000,
        ..WorkerArgs::default()
    });
}

#[test]
fn duration_bound_stops_the_run_on_time() {
    let r = rig("duration", 4096);
    let qp = qpair(&r);

    let mut args = WorkerArgs {
        io_count: 0, // unbounded; the clock stops the run
        qdepth: 32,
        seconds: 1,
        lba_random: true,
        region_end: 1024,
        ..WorkerArgs::default()
    };
    let rets = run(&r, &qp, &mut args).unwrap();
    assert_eq!(rets.error, 0);
    assert!(
        (900..=2000).contains(&rets.mseconds),
        "mseconds {} out of bounds",
        rets.mseconds
    );
    assert!(rets.io_count_write > 0);
}

#[test]
fn iops_throttle_paces_the_run_and_fills_counters() {
    let r = rig("throttle", 4096);
    let qp = qpair(&r);

    let mut args = WorkerArgs {
        io_count: 0,
        qdepth: 1,
        seconds: 2,
        iops: 1000,
        region_end: 4096,
        io_counter_per_second: Some(vec![0u64; 4].into_boxed_slice()),
        io_counter_per_latency: Some(vec![0u32; US_PER_S as usize].into_boxed_slice()),
        ..WorkerArgs::default()
    };
    let rets = run(&r, &qp, &mut args).unwrap();
    assert_eq!(rets.error, 0);
    assert!(
        (1900..=3000).contains(&rets.mseconds),
        "mseconds {} out of bounds",
        rets.mseconds
    );

    let total = rets.io_count_read + rets.io_count_write;
    // 1000 IOPS for two seconds, with generous allowance for sleep jitter.
    assert!(
        (1200..=2400).contains(&total),
        "throttled run produced {total} I/Os"
    );

    let per_second = args.io_counter_per_second.as_ref().unwrap();
    assert!(per_second[0] > 0, "first second never rolled");
    assert!(per_second.iter().sum::<u64>() <= total);

    let histogram = args.io_counter_per_latency.as_ref().unwrap();
    assert_eq!(histogram.iter().map(|c| *c as u64).sum::<u64>(), total);
}
