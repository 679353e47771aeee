//! FFT Stage
//!
//! Transforms raw time-domain antenna samples into frequency-domain IQ
//! and extracts the usable band. Workers partition the antenna axis;
//! each call handles one (frame, symbol, antenna) coordinate and
//! publishes it for fan-out to the subcarrier owners.

use crossbeam_channel::Sender;
use num_complex::Complex32;
use rustfft::FftPlanner;
use tracing::{debug, error};

use common::types::ThreadRole;
use common::utils::timing::rdtsc;
use common::utils::worker_shard;

use crate::controller::signal_received;
use crate::txrx::TxJob;
use crate::worker::{send_job, Ctx, PollLoop, WorkerStats};

pub fn fft_worker(ctx: Ctx, local_idx: usize, tx: Sender<TxJob>) -> WorkerStats {
    let cfg = &ctx.cfg;
    let tid = cfg.fft_thread_offset + local_idx;
    let shard = worker_shard(cfg.bs_ant_num, cfg.total_fft_workers(), tid);
    let ant_base = ctx.map.servers[cfg.server_idx].ant.start;
    debug!("FFT worker {tid} owns antennas [{}, {})", shard.start, shard.end);

    let fft = FftPlanner::<f32>::new().plan_fft_forward(cfg.ofdm_ca_num);
    let mut bins: Vec<Complex32> = vec![Complex32::new(0.0, 0.0); cfg.ofdm_ca_num];
    let mut scratch: Vec<Complex32> =
        vec![Complex32::new(0.0, 0.0); fft.get_inplace_scratch_len()];

    let mut pl = PollLoop::new(ThreadRole::WorkerFft, tid, cfg, ctx.freq_ghz);
    let mut frame = 0usize;
    let mut symbol = 0usize;
    let mut ant = shard.start;

    while ctx.flags.is_running() && !signal_received() {
        if ctx.tracker.received_all_time_iq_pkts(frame, symbol) {
            pl.observe_frame(frame);
            let t0 = rdtsc();

            let slot = frame % cfg.frame_window;
            let time = ctx.buffers.time_iq.view(slot, symbol, ant - ant_base);
            for (bin, sample) in bins.iter_mut().zip(time.iter()) {
                *bin = Complex32::new(sample.re as f32, sample.im as f32);
            }
            fft.process_with_scratch(&mut bins, &mut scratch);
            // Extract the usable band; downstream consumes subcarriers in
            // the transposed (subcarrier-major) local buffers after TX.
            let band = &bins[cfg.ofdm_data_start..cfg.ofdm_data_start + cfg.ofdm_data_num];
            // SAFETY: this worker is the unique producer for its antenna
            // shard, and TX reads the coordinate only after the job below.
            let out = unsafe {
                ctx.buffers
                    .freq_iq_to_send
                    .view_mut(slot, symbol, ant - ant_base)
            };
            for (dst, bin) in out.iter_mut().zip(band.iter()) {
                dst.re = bin.re.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                dst.im = bin.im.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            }

            let t1 = rdtsc();
            if let Err(e) = ctx.tracker.record_fft_production(frame, symbol) {
                ctx.flags.fail(e);
                break;
            }
            if !send_job(&tx, TxJob::FreqIq { frame, symbol, ant }, &ctx.flags) {
                break;
            }
            pl.on_work(t0, t1, rdtsc(), 1);

            ant += 1;
            if ant == shard.end {
                ant = shard.start;
                symbol += 1;
                if symbol == cfg.symbol_num_perframe {
                    symbol = 0;
                    frame += 1;
                    if frame == cfg.frames_to_test {
                        break;
                    }
                }
            }
        } else {
            pl.on_idle();
        }
    }

    if ctx.flags.fatal_error().is_some() {
        error!("FFT worker {tid} stalled at (frame {frame}, symbol {symbol}, antenna {ant})");
    }
    pl.finish()
}
