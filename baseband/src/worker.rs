//! Worker Shell
//!
//! The pieces every pinned thread shares: the process context handed out
//! by the controller, core pinning, the cooperative backoff policy and
//! cycle accounting for the exit statistics.

use std::sync::Arc;

use common::config::ShardMap;
use common::types::ThreadRole;
use common::utils::timing::{cycles_to_ms, ms_to_cycles, rdtsc};
use common::SystemConfig;
use tracing::warn;

use crate::buffers::Buffers;
use crate::state::{FrameTracker, RunFlags};

/// Shared read-only context cloned into every worker and I/O thread.
#[derive(Clone)]
pub struct Ctx {
    pub cfg: Arc<SystemConfig>,
    pub map: Arc<ShardMap>,
    pub tracker: Arc<FrameTracker>,
    pub buffers: Arc<Buffers>,
    pub flags: Arc<RunFlags>,
    /// Calibrated timestamp-counter frequency.
    pub freq_ghz: f64,
}

/// Pin the calling thread to its assigned core. `seq` is the thread's
/// position in the process-wide core layout starting at `core_offset`.
pub fn pin_to_core(cfg: &SystemConfig, seq: usize) {
    let mut core = cfg.core_offset + seq;
    if !cfg.use_hyperthreading && core >= cfg.phy_core_num {
        warn!(
            "core {core} exceeds the {} physical cores with hyperthreading disabled; wrapping",
            cfg.phy_core_num
        );
        core %= cfg.phy_core_num;
    }
    let Some(ids) = core_affinity::get_core_ids() else {
        warn!("core enumeration unavailable; thread left unpinned");
        return;
    };
    match ids.get(core) {
        Some(&id) => {
            if !core_affinity::set_for_current(id) {
                warn!("failed to pin thread to core {core}");
            }
        }
        None => warn!("core {core} does not exist on this host; thread left unpinned"),
    }
}

/// Hand a descriptor to the TX plane without risking a shutdown
/// deadlock: a full channel is retried while the run is live and
/// abandoned once it is not. Returns false when the worker should exit.
pub fn send_job(
    tx: &crossbeam_channel::Sender<crate::txrx::TxJob>,
    job: crate::txrx::TxJob,
    flags: &RunFlags,
) -> bool {
    let mut pending = job;
    loop {
        match tx.send_timeout(pending, std::time::Duration::from_millis(10)) {
            Ok(()) => return true,
            Err(crossbeam_channel::SendTimeoutError::Timeout(job)) => {
                if !flags.is_running() {
                    return false;
                }
                pending = job;
            }
            Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

/// Per-thread statistics reported on stdout at exit.
pub struct WorkerStats {
    pub role: ThreadRole,
    pub tid: usize,
    pub units: u64,
    pub total_cycles: u64,
    pub kernel_cycles: u64,
    pub state_cycles: u64,
}

impl WorkerStats {
    pub fn print(&self, freq_ghz: f64) {
        let total = self.total_cycles.max(1);
        let work = self.kernel_cycles + self.state_cycles;
        let idle = total.saturating_sub(work);
        let pct = |c: u64| c as f64 * 100.0 / total as f64;
        println!(
            "{} thread {} duration stats: total {:.2} ms, kernel {:.2} ms ({} units, {:.2}%), \
             stating {:.2} ms ({:.2}%), idle {:.2} ms ({:.2}%)",
            self.role.label(),
            self.tid,
            cycles_to_ms(total, freq_ghz),
            cycles_to_ms(self.kernel_cycles, freq_ghz),
            self.units,
            pct(self.kernel_cycles),
            cycles_to_ms(self.state_cycles, freq_ghz),
            pct(self.state_cycles),
            cycles_to_ms(idle, freq_ghz),
            pct(idle),
        );
    }
}

/// Poll-loop bookkeeping: warm-up-gated cycle accounting plus the
/// cooperative backoff (1 µs yield after 1 ms of fruitless polling).
pub struct PollLoop {
    role: ThreadRole,
    tid: usize,
    warmup_frame: usize,
    started: bool,
    start_tsc: u64,
    end_tsc: u64,
    kernel_cycles: u64,
    state_cycles: u64,
    units: u64,
    idle_anchor: u64,
    backoff_cycles: u64,
}

impl PollLoop {
    pub fn new(role: ThreadRole, tid: usize, cfg: &SystemConfig, freq_ghz: f64) -> Self {
        Self {
            role,
            tid,
            warmup_frame: cfg.stats_warmup_frames,
            started: false,
            start_tsc: 0,
            end_tsc: 0,
            kernel_cycles: 0,
            state_cycles: 0,
            units: 0,
            idle_anchor: rdtsc(),
            backoff_cycles: ms_to_cycles(1.0, freq_ghz).max(1),
        }
    }

    /// Start the statistics clock once the thread first works on a frame
    /// past the warm-up threshold, excluding startup transients.
    #[inline]
    pub fn observe_frame(&mut self, frame: usize) {
        if !self.started && frame >= self.warmup_frame {
            self.started = true;
            self.start_tsc = rdtsc();
        }
    }

    /// Account `units` completed units: `t0` before the kernel, `t1`
    /// between kernel and tracker ops, `t2` after the tracker ops. Resets
    /// the backoff window.
    #[inline]
    pub fn on_work(&mut self, t0: u64, t1: u64, t2: u64, units: u64) {
        if self.started {
            self.kernel_cycles += t1 - t0;
            self.state_cycles += t2 - t1;
            self.units += units;
            self.end_tsc = t2;
        }
        self.idle_anchor = t2;
    }

    /// Nothing to do this iteration: after 1 ms of continuous fruitless
    /// polling, yield for 1 µs so startup and gap-fill do not burn the
    /// core, without adding syscall latency to the loaded path.
    #[inline]
    pub fn on_idle(&mut self) {
        let now = rdtsc();
        if now - self.idle_anchor > self.backoff_cycles {
            std::thread::sleep(std::time::Duration::from_micros(1));
            self.idle_anchor = rdtsc();
        }
    }

    pub fn finish(self) -> WorkerStats {
        let total = if self.started {
            self.end_tsc.saturating_sub(self.start_tsc)
        } else {
            0
        };
        WorkerStats {
            role: self.role,
            tid: self.tid,
            units: self.units,
            total_cycles: total,
            kernel_cycles: self.kernel_cycles,
            state_cycles: self.state_cycles,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::PeerConfig;

    fn cfg() -> SystemConfig {
        SystemConfig {
            bs_ant_num: 4,
            ue_num: 2,
            ofdm_ca_num: 64,
            ofdm_data_num: 48,
            ofdm_data_start: 8,
            symbol_num_perframe: 4,
            ul_pilot_syms: 2,
            mod_order_bits: 2,
            frames_to_test: 8,
            frame_window: 4,
            demul_block_size: 16,
            stats_warmup_frames: 2,
            num_fft_workers: vec![1],
            num_zf_workers: vec![1],
            num_demul_workers: vec![1],
            num_decode_workers: vec![1],
            fft_thread_offset: 0,
            zf_thread_offset: 0,
            demul_thread_offset: 0,
            decode_thread_offset: 0,
            core_offset: 0,
            use_hyperthreading: true,
            phy_core_num: 4,
            server_idx: 0,
            rru_addr: "127.0.0.1:7891".parse().unwrap(),
            rx_thread_num: 1,
            tx_thread_num: 1,
            servers: vec![PeerConfig {
                addr: "127.0.0.1".parse().unwrap(),
                rx_port_base: 8100,
            }],
        }
    }

    #[test]
    fn test_warmup_gates_accounting() {
        let cfg = cfg();
        let mut pl = PollLoop::new(ThreadRole::WorkerFft, 0, &cfg, 1.0);
        // Frame 0 is below the warm-up threshold: nothing accounted.
        pl.observe_frame(0);
        let t = rdtsc();
        pl.on_work(t, t + 10, t + 12, 1);
        assert_eq!(pl.units, 0);
        // Frame 2 starts the clock.
        pl.observe_frame(2);
        let t = rdtsc();
        pl.on_work(t, t + 10, t + 12, 1);
        let stats = pl.finish();
        assert_eq!(stats.units, 1);
        assert_eq!(stats.kernel_cycles, 10);
        assert_eq!(stats.state_cycles, 2);
    }
}
