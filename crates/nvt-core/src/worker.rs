//! The ioworker: a single-threaded workload generator driving one queue
//! pair.
//!
//! The concurrency discipline is completion-driven submission: the first
//! `qdepth` I/Os go out back-to-back, and from then on every polled
//! completion updates statistics and immediately reuses its context for the
//! next I/O, keeping the in-flight count at `qdepth` until a finish
//! condition (count reached, deadline passed, or first error) starts the
//! drain.

use std::cell::RefCell;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use nvt_nvme::{Completion, IoCallback, STATUS_INVALID_FIELD};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cmdlog::CMD_LOG_DEPTH;
use crate::dma::DmaBuf;
use crate::ns::Namespace;
use crate::qpair::QueuePair;
use crate::US_PER_S;

/// Longest admissible run; `seconds == 0` selects it.
pub const MAX_SECONDS: u32 = 24 * 3600;

/// Workload description. Counter buffers, when provided, are filled in
/// place and handed back through the same fields after the run.
///
/// The default is a single sequential one-block write over the whole
/// namespace.
#[derive(Debug)]
pub struct WorkerArgs {
    pub lba_start: u64,
    /// Blocks per I/O.
    pub lba_size: u32,
    pub lba_align: u64,
    pub lba_random: bool,
    pub region_start: u64,
    pub region_end: u64,
    pub read_percentage: u32,
    /// Target rate; 0 leaves the rate uncapped.
    pub iops: u32,
    /// Total I/Os; 0 means unbounded (the duration limits the run).
    pub io_count: u64,
    /// Duration; 0 selects the 24-hour cap.
    pub seconds: u32,
    pub qdepth: u32,
    /// One slot per elapsed second of the run.
    pub io_counter_per_second: Option<Box<[u64]>>,
    /// One slot per microsecond of latency, up to a second.
    pub io_counter_per_latency: Option<Box<[u32]>>,
}

impl Default for WorkerArgs {
    fn default() -> Self {
        Self {
            lba_start: 0,
            lba_size: 1,
            lba_align: 1,
            lba_random: false,
            region_start: 0,
            region_end: u64::MAX,
            read_percentage: 0,
            iops: 0,
            io_count: 1,
            seconds: 0,
            qdepth: 1,
            io_counter_per_second: None,
            io_counter_per_latency: None,
        }
    }
}

/// Aggregated results of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerRets {
    pub io_count_read: u64,
    pub io_count_write: u64,
    pub latency_max_us: u32,
    pub mseconds: u32,
    /// First observed 11-bit completion status; 0 when the run was clean.
    pub error: u16,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("I/O size {bytes} exceeds the controller's max transfer of {max} bytes")]
    OversizedTransfer { bytes: u64, max: u32 },
    #[error("invalid worker arguments: {reason}")]
    InvalidArgs { reason: &'static str },
    #[error("worker ran past its hard deadline after {ms} ms")]
    Watchdog { ms: u32, rets: WorkerRets },
}

impl WorkerError {
    /// NVMe-style status code mirrored to the scripting layer.
    pub fn nvme_status(&self) -> u16 {
        match self {
            WorkerError::OversizedTransfer { .. } | WorkerError::InvalidArgs { .. } => {
                STATUS_INVALID_FIELD
            }
            WorkerError::Watchdog { .. } => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    Warming,
    Running,
    Draining,
    Done,
}

/// Arguments after clamping and alignment, all in blocks.
#[derive(Debug, Clone, Copy)]
struct Norm {
    lba_start: u64,
    lba_size: u32,
    lba_align: u64,
    lba_random: bool,
    region_start: u64,
    region_end: u64,
    read_percentage: u32,
    io_count: u64,
    seconds: u32,
    qdepth: u32,
    io_delay_us: u64,
}

struct IoCtx {
    buf: DmaBuf,
    is_read: bool,
    sent_at: Instant,
}

struct WorkerState {
    norm: Norm,
    rets: WorkerRets,
    per_sec: Option<Box<[u64]>>,
    per_lat: Option<Box<[u32]>>,
    rng: ChaCha8Rng,
    ctxs: Vec<IoCtx>,
    due_time: Instant,
    io_due: Instant,
    time_next_sec: Instant,
    last_sec: usize,
    io_count_till_last_sec: u64,
    sequential_lba: u64,
    issued_any: bool,
    io_count_sent: u64,
    io_count_cplt: u64,
    finish: bool,
    phase: Phase,
}

struct WorkerShared {
    ns: Namespace,
    qpair: QueuePair,
    state: RefCell<WorkerState>,
}

fn align_up(n: u64, align: u64) -> u64 {
    match n % align {
        0 => n,
        rem => n + align - rem,
    }
}

fn align_down(n: u64, align: u64) -> u64 {
    n - n % align
}

fn normalize(args: &WorkerArgs, ns: &Namespace) -> Result<Norm, WorkerError> {
    if args.read_percentage > 100 {
        return Err(WorkerError::InvalidArgs {
            reason: "read_percentage over 100",
        });
    }
    if args.io_count == 0 && args.seconds == 0 {
        return Err(WorkerError::InvalidArgs {
            reason: "neither io_count nor seconds bounds the run",
        });
    }
    if args.lba_size == 0 {
        return Err(WorkerError::InvalidArgs {
            reason: "lba_size must be at least one block",
        });
    }
    if args.lba_align == 0 {
        return Err(WorkerError::InvalidArgs {
            reason: "lba_align must be at least one block",
        });
    }
    if args.region_start >= args.region_end {
        return Err(WorkerError::InvalidArgs {
            reason: "region_start must be below region_end",
        });
    }

    let bytes = args.lba_size as u64 * ns.sector_size() as u64;
    if bytes > ns.max_xfer_size() as u64 {
        return Err(WorkerError::OversizedTransfer {
            bytes,
            max: ns.max_xfer_size(),
        });
    }

    let io_count = if args.io_count == 0 {
        u64::MAX
    } else {
        args.io_count
    };
    let seconds = if args.seconds == 0 || args.seconds > MAX_SECONDS {
        MAX_SECONDS
    } else {
        args.seconds
    };

    // Trim the region to the namespace, then shrink it so that any aligned
    // starting LBA in it fits a whole I/O.
    let region_end = args.region_end.min(ns.num_sectors());
    let region_start = align_up(args.region_start, args.lba_align);
    let region_end = region_end
        .checked_sub(args.lba_size as u64 + 1)
        .map(|end| align_down(end, args.lba_align))
        .filter(|end| *end >= region_start)
        .ok_or(WorkerError::InvalidArgs {
            reason: "region cannot fit a single aligned I/O",
        })?;

    let lba_start = args.lba_start.clamp(region_start, region_end);

    let qdepth = (args.qdepth as u64).min(io_count) as u32;
    if qdepth == 0 {
        return Err(WorkerError::InvalidArgs {
            reason: "qdepth must be at least 1",
        });
    }
    if qdepth as usize > CMD_LOG_DEPTH / 2 {
        return Err(WorkerError::InvalidArgs {
            reason: "qdepth exceeds half the command log depth",
        });
    }

    Ok(Norm {
        lba_start,
        lba_size: args.lba_size,
        lba_align: args.lba_align,
        lba_random: args.lba_random,
        region_start,
        region_end,
        read_percentage: args.read_percentage,
        io_count,
        seconds,
        qdepth,
        io_delay_us: if args.iops > 0 {
            US_PER_S / args.iops as u64
        } else {
            0
        },
    })
}

fn pick_lba(st: &mut WorkerState) -> u64 {
    let n = st.norm;
    if n.lba_random {
        let span = n.region_end - n.region_start;
        let lba = if span == 0 {
            n.region_start
        } else {
            n.region_start + st.rng.gen_range(0..span)
        };
        return align_down(lba, n.lba_align);
    }
    // The first sequential I/O issues at lba_start verbatim; alignment only
    // governs the stride from then on.
    let lba = if !st.issued_any {
        st.issued_any = true;
        st.sequential_lba
    } else {
        let next = st.sequential_lba + n.lba_align;
        let next = if next > n.region_end {
            n.region_start
        } else {
            next
        };
        align_down(next, n.lba_align)
    };
    st.sequential_lba = lba;
    lba
}

fn send_one(shared: &Rc<WorkerShared>, st: &mut WorkerState, idx: usize) {
    let is_read = st.rng.gen_range(0u32..100) < st.norm.read_percentage;
    let lba = pick_lba(st);
    let lba_count = st.norm.lba_size;

    let cb: IoCallback = {
        let shared = shared.clone();
        Box::new(move |cpl| on_complete(&shared, idx, cpl))
    };

    let ctx = &mut st.ctxs[idx];
    let len = ctx.buf.len();
    match shared.ns.read_write(
        is_read,
        &shared.qpair,
        &mut ctx.buf,
        len,
        lba,
        lba_count,
        0, // the worker never sets extra I/O flags
        Some(cb),
    ) {
        Ok(()) => {
            ctx.is_read = is_read;
            ctx.sent_at = Instant::now();
            st.io_count_sent += 1;
        }
        Err(err) => {
            warn!(%err, "ioworker submission failed");
            st.finish = true;
        }
    }
}

fn roll_second(st: &mut WorkerState) {
    let current = st.rets.io_count_read + st.rets.io_count_write;
    st.time_next_sec += Duration::from_secs(1);
    let last_sec = st.last_sec;
    let delta = current - st.io_count_till_last_sec;
    if let Some(counters) = &mut st.per_sec {
        if last_sec < counters.len() {
            counters[last_sec] = delta;
        }
    }
    st.last_sec += 1;
    st.io_count_till_last_sec = current;
}

fn on_complete(shared: &Rc<WorkerShared>, idx: usize, cpl: &Completion) {
    let mut st = shared.state.borrow_mut();
    st.io_count_cplt += 1;

    let now = Instant::now();
    let latency = now.duration_since(st.ctxs[idx].sent_at).as_micros() as u64;
    let latency_us = latency.min(u32::MAX as u64) as u32;
    if latency_us > st.rets.latency_max_us {
        st.rets.latency_max_us = latency_us;
    }
    if st.ctxs[idx].is_read {
        st.rets.io_count_read += 1;
    } else {
        st.rets.io_count_write += 1;
    }
    let bucket = latency.min(US_PER_S - 1) as usize;
    if let Some(hist) = &mut st.per_lat {
        if let Some(slot) = hist.get_mut(bucket.min(hist.len().saturating_sub(1))) {
            *slot += 1;
        }
    }

    // Throttle by per-I/O delay accounting: each completion pushes the next
    // due time forward and sleeps off any surplus.
    if st.norm.io_delay_us != 0 {
        if st.io_due > now {
            thread::sleep(st.io_due - now);
        }
        let io_delay_us = st.norm.io_delay_us;
        st.io_due += Duration::from_micros(io_delay_us);
    }

    if cpl.is_error() {
        st.finish = true;
        if st.rets.error == 0 {
            st.rets.error = cpl.status_code();
        }
    }

    if st.per_sec.is_some() && now > st.time_next_sec {
        roll_second(&mut st);
    }

    if !st.finish {
        st.finish = st.io_count_sent == st.norm.io_count || now > st.due_time;
        if st.finish {
            debug!(sent = st.io_count_sent, "ioworker finishing");
        }
    }

    if st.finish {
        if st.phase == Phase::Running {
            st.phase = Phase::Draining;
        }
    } else {
        send_one(shared, &mut st, idx);
    }
}

fn elapsed_ms(start: Instant) -> u32 {
    let d = start.elapsed();
    (d.as_secs() * 1000 + (d.subsec_micros() as u64 + 500) / 1000) as u32
}

/// Runs one workload to completion on the calling thread.
///
/// On success the results carry the first error status observed, if any; an
/// argument failure or a blown hard deadline (ten seconds past the soft
/// one) surfaces as an error instead. The PRNG advances across calls so
/// back-to-back workloads stay reproducible as a sequence.
pub fn run(
    ns: &Namespace,
    qpair: &QueuePair,
    args: &mut WorkerArgs,
    rng: &mut ChaCha8Rng,
) -> Result<WorkerRets, WorkerError> {
    let norm = normalize(args, ns)?;
    debug!(?norm, "ioworker start");

    let start = Instant::now();
    let bytes = norm.lba_size as usize * ns.sector_size() as usize;
    let state = WorkerState {
        norm,
        rets: WorkerRets::default(),
        per_sec: args.io_counter_per_second.take(),
        per_lat: args.io_counter_per_latency.take(),
        rng: rng.clone(),
        ctxs: (0..norm.qdepth)
            .map(|_| IoCtx {
                buf: DmaBuf::alloc(bytes),
                is_read: false,
                sent_at: start,
            })
            .collect(),
        due_time: start + Duration::from_secs(norm.seconds as u64),
        io_due: start + Duration::from_micros(norm.io_delay_us),
        time_next_sec: start + Duration::from_secs(1),
        last_sec: 0,
        io_count_till_last_sec: 0,
        sequential_lba: norm.lba_start,
        issued_any: false,
        io_count_sent: 0,
        io_count_cplt: 0,
        finish: false,
        phase: Phase::Init,
    };
    let shared = Rc::new(WorkerShared {
        ns: ns.clone(),
        qpair: qpair.clone(),
        state: RefCell::new(state),
    });

    // Warm-up: the first qdepth submissions go out back-to-back; everything
    // after rides on completions.
    {
        let mut st = shared.state.borrow_mut();
        st.phase = Phase::Warming;
        for idx in 0..norm.qdepth as usize {
            if st.finish {
                break;
            }
            send_one(&shared, &mut st, idx);
        }
        st.phase = Phase::Running;
    }

    let hard_deadline = start + Duration::from_secs(norm.seconds as u64 + 10);
    loop {
        {
            let st = shared.state.borrow();
            if st.io_count_sent == st.io_count_cplt && st.finish {
                break;
            }
        }
        if Instant::now() > hard_deadline {
            let mut st = shared.state.borrow_mut();
            st.phase = Phase::Done;
            let mut rets = std::mem::take(&mut st.rets);
            rets.mseconds = elapsed_ms(start);
            args.io_counter_per_second = st.per_sec.take();
            args.io_counter_per_latency = st.per_lat.take();
            *rng = st.rng.clone();
            warn!(outstanding = st.io_count_sent - st.io_count_cplt, "ioworker watchdog expired");
            return Err(WorkerError::Watchdog {
                ms: rets.mseconds,
                rets,
            });
        }
        shared.qpair.process_completions(0);
    }

    let mut st = shared.state.borrow_mut();
    st.phase = Phase::Done;
    st.rets.mseconds = elapsed_ms(start);
    args.io_counter_per_second = st.per_sec.take();
    args.io_counter_per_latency = st.per_lat.take();
    *rng = st.rng.clone();
    debug!(
        reads = st.rets.io_count_read,
        writes = st.rets.io_count_write,
        mseconds = st.rets.mseconds,
        error = st.rets.error,
        "ioworker done"
    );
    Ok(std::mem::take(&mut st.rets))
}
