//! Lifecycle Controller
//!
//! The master thread: allocates everything, spawns the I/O plane and the
//! four worker pools, nudges the RRU until the first frame arrives,
//! watches the frame-count termination condition, then drains and joins
//! every thread and emits the run statistics.
//!
//! States: Init → WaitingForRRU → Running → Draining → Stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;
use tracing::{info, warn};

use common::utils::timing::measure_rdtsc_freq_ghz;
use common::SystemConfig;
use transport::{PacketHeader, PacketKind, UdpEndpoint, HEADER_LEN};

use crate::buffers::Buffers;
use crate::state::{FrameTracker, RunFlags};
use crate::stages::{decode_worker, demul_worker, fft_worker, zf_worker};
use crate::txrx::{rx_thread, tx_thread, RxStats, TxJob, TxStats};
use crate::worker::{pin_to_core, Ctx, WorkerStats};
use crate::PipelineError;

/// Depth of each worker→TX descriptor channel.
const TX_CHANNEL_DEPTH: usize = 4096;

static EXIT_SIGNAL: AtomicBool = AtomicBool::new(false);

extern "C" fn on_exit_signal(_sig: libc::c_int) {
    EXIT_SIGNAL.store(true, Ordering::Relaxed);
}

/// Install the SIGINT/SIGTERM handler that flips the process-wide exit
/// flag. Workers observe it within one polling iteration.
pub fn install_signal_handler() {
    let handler = on_exit_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: the handler only stores to an atomic.
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

#[inline]
pub fn signal_received() -> bool {
    EXIT_SIGNAL.load(Ordering::Relaxed)
}

/// End-of-run summary assembled by the controller.
#[derive(Debug)]
pub struct RunReport {
    pub frames_completed: usize,
    pub wall_time: Duration,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub duplicates: u64,
    pub dropped: u64,
}

impl RunReport {
    /// Human-readable run summary on stdout.
    pub fn print(&self) {
        let secs = self.wall_time.as_secs_f64().max(1e-9);
        println!(
            "run summary: {} frames in {:.2} s, rx {:.3} Gbit/s ({} pkts, {} dup, {} dropped), \
             tx {:.3} Gbit/s ({} pkts)",
            self.frames_completed,
            secs,
            self.rx_bytes as f64 * 8.0 / secs / 1e9,
            self.rx_packets,
            self.duplicates,
            self.dropped,
            self.tx_bytes as f64 * 8.0 / secs / 1e9,
            self.tx_packets,
        );
    }
}

/// The master object owning the tracker, buffers and run flags.
pub struct Controller {
    ctx: Ctx,
}

impl Controller {
    /// Validate the configuration and allocate every shared structure.
    pub fn new(cfg: SystemConfig) -> Result<Self, PipelineError> {
        cfg.validate()?;
        let freq_ghz = measure_rdtsc_freq_ghz();
        info!("timestamp counter calibrated at {freq_ghz:.2} GHz");
        let cfg = Arc::new(cfg);
        let ctx = Ctx {
            map: Arc::new(cfg.shard_map()),
            tracker: Arc::new(FrameTracker::new(&cfg)),
            buffers: Arc::new(Buffers::new(&cfg)),
            flags: Arc::new(RunFlags::new()),
            freq_ghz,
            cfg,
        };
        Ok(Self { ctx })
    }

    pub fn tracker(&self) -> Arc<FrameTracker> {
        self.ctx.tracker.clone()
    }

    pub fn buffers(&self) -> Arc<Buffers> {
        self.ctx.buffers.clone()
    }

    pub fn flags(&self) -> Arc<RunFlags> {
        self.ctx.flags.clone()
    }

    /// Run the pipeline to completion (or fatal error) and emit
    /// statistics. Blocks the calling thread as the master.
    pub fn run(&self) -> Result<RunReport, PipelineError> {
        let cfg = self.ctx.cfg.clone();
        let start = Instant::now();
        pin_to_core(&cfg, 0);

        // Init: bind the RX queues before any thread spawns so port
        // conflicts abort cleanly.
        let rx_port_base = cfg.servers[cfg.server_idx].rx_port_base;
        let mut rx_handles: Vec<JoinHandle<RxStats>> = Vec::new();
        for queue in 0..cfg.rx_thread_num {
            let addr = format!("0.0.0.0:{}", rx_port_base + queue as u16);
            let endpoint = UdpEndpoint::bind(addr.parse().expect("static addr"))
                .map_err(|e| PipelineError::RxNicError {
                    detail: format!("bind {addr}: {e}"),
                })?;
            let ctx = self.ctx.clone();
            let seq = 1 + queue;
            rx_handles.push(
                thread::Builder::new()
                    .name(format!("rx-{queue}"))
                    .spawn(move || {
                        pin_to_core(&ctx.cfg, seq);
                        rx_thread(ctx, endpoint, queue)
                    })
                    .expect("spawn rx thread"),
            );
        }

        let mut tx_senders = Vec::new();
        let mut tx_handles: Vec<JoinHandle<TxStats>> = Vec::new();
        for t in 0..cfg.tx_thread_num {
            let (sender, receiver) = bounded::<TxJob>(TX_CHANNEL_DEPTH);
            tx_senders.push(sender);
            let endpoint =
                UdpEndpoint::bind("0.0.0.0:0".parse().expect("static addr")).map_err(|e| {
                    PipelineError::TxFailed {
                        dest: "bind".into(),
                        detail: e.to_string(),
                    }
                })?;
            let ctx = self.ctx.clone();
            let seq = 1 + cfg.rx_thread_num + t;
            tx_handles.push(
                thread::Builder::new()
                    .name(format!("tx-{t}"))
                    .spawn(move || {
                        pin_to_core(&ctx.cfg, seq);
                        tx_thread(ctx, endpoint, receiver, t)
                    })
                    .expect("spawn tx thread"),
            );
        }

        let worker_base = 1 + cfg.rx_thread_num + cfg.tx_thread_num;
        let mut worker_handles: Vec<JoinHandle<WorkerStats>> = Vec::new();
        let mut seq = worker_base;
        {
            let mut spawn_pool =
                |count: usize,
                 pool: &'static str,
                 f: Arc<dyn Fn(Ctx, usize, usize) -> WorkerStats + Send + Sync>| {
                    for i in 0..count {
                        let ctx = self.ctx.clone();
                        let core_seq = seq;
                        let f = f.clone();
                        worker_handles.push(
                            thread::Builder::new()
                                .name(format!("{pool}-{i}"))
                                .spawn(move || {
                                    pin_to_core(&ctx.cfg, core_seq);
                                    f(ctx, i, core_seq)
                                })
                                .expect("spawn worker thread"),
                        );
                        seq += 1;
                    }
                };

            let senders = tx_senders.clone();
            spawn_pool(
                cfg.local_fft_workers(),
                "fft",
                Arc::new(move |ctx: Ctx, i, core_seq: usize| {
                    let tx = senders[core_seq % ctx.cfg.tx_thread_num].clone();
                    fft_worker(ctx, i, tx)
                }),
            );
            let senders = tx_senders.clone();
            spawn_pool(
                cfg.local_zf_workers(),
                "zf",
                Arc::new(move |ctx: Ctx, i, core_seq: usize| {
                    let tx = senders[core_seq % ctx.cfg.tx_thread_num].clone();
                    zf_worker(ctx, i, tx)
                }),
            );
            let senders = tx_senders.clone();
            spawn_pool(
                cfg.local_demul_workers(),
                "demul",
                Arc::new(move |ctx: Ctx, i, core_seq: usize| {
                    let tx = senders[core_seq % ctx.cfg.tx_thread_num].clone();
                    demul_worker(ctx, i, tx)
                }),
            );
            spawn_pool(
                cfg.local_decode_workers(),
                "decode",
                Arc::new(|ctx: Ctx, i, _| decode_worker(ctx, i)),
            );
        }
        // Drop the master's sender copies so TX threads disconnect once
        // every worker has exited.
        drop(tx_senders);

        let total_workers = seq - worker_base;
        info!(
            "core map: master {}, rx {}..{}, tx {}..{}, workers {}..{}",
            cfg.core_offset,
            cfg.core_offset + 1,
            cfg.core_offset + cfg.rx_thread_num,
            cfg.core_offset + 1 + cfg.rx_thread_num,
            cfg.core_offset + cfg.rx_thread_num + cfg.tx_thread_num,
            cfg.core_offset + worker_base,
            cfg.core_offset + worker_base + total_workers - 1,
        );

        // WaitingForRRU: nudge the sender until the first time-IQ packet.
        info!("waiting for RRU at {}", cfg.rru_addr);
        let ping = UdpEndpoint::bind("0.0.0.0:0".parse().expect("static addr")).map_err(|e| {
            PipelineError::TxFailed {
                dest: cfg.rru_addr.to_string(),
                detail: e.to_string(),
            }
        })?;
        let mut ping_buf = [0u8; HEADER_LEN];
        PacketHeader {
            kind: PacketKind::Ping,
            frame: 0,
            symbol: 0,
            antenna_or_ue: 0,
            sc_start: 0,
            sc_len: 0,
            source_server: cfg.server_idx as u16,
        }
        .encode(&mut ping_buf);
        while !self.ctx.tracker.rru_started()
            && self.ctx.flags.is_running()
            && !signal_received()
        {
            if let Err(e) = ping.send_to(&ping_buf, cfg.rru_addr) {
                warn!("RRU liveness ping failed: {e}");
            }
            thread::sleep(Duration::from_millis(100));
        }

        // Running: watch the frame counter once per second.
        info!("running until frame {}", cfg.frames_to_test);
        while self.ctx.flags.is_running() && !signal_received() {
            if self.ctx.tracker.current_frame() >= cfg.frames_to_test {
                break;
            }
            thread::sleep(Duration::from_secs(1));
        }

        // Draining: stop the loops, then join in spawn order.
        info!("draining at frame {}", self.ctx.tracker.current_frame());
        self.ctx.flags.stop();
        let worker_stats: Vec<WorkerStats> = worker_handles
            .into_iter()
            .map(|h| h.join().expect("worker thread panicked"))
            .collect();
        let tx_stats: Vec<TxStats> = tx_handles
            .into_iter()
            .map(|h| h.join().expect("tx thread panicked"))
            .collect();
        let rx_stats: Vec<RxStats> = rx_handles
            .into_iter()
            .map(|h| h.join().expect("rx thread panicked"))
            .collect();

        // Stopped: per-thread statistics, then the run summary.
        for stats in &worker_stats {
            stats.print(self.ctx.freq_ghz);
        }
        let report = RunReport {
            frames_completed: self.ctx.tracker.current_frame().min(cfg.frames_to_test),
            wall_time: start.elapsed(),
            rx_packets: rx_stats.iter().map(|s| s.packets).sum(),
            rx_bytes: rx_stats.iter().map(|s| s.bytes).sum(),
            tx_packets: tx_stats.iter().map(|s| s.packets).sum(),
            tx_bytes: tx_stats.iter().map(|s| s.bytes).sum(),
            duplicates: rx_stats.iter().map(|s| s.duplicates).sum(),
            dropped: rx_stats
                .iter()
                .map(|s| s.malformed + s.unknown_shard + s.stale)
                .sum(),
        };
        info!("stopped");

        match self.ctx.flags.fatal_error() {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }
}
