//! Demodulation Stage
//!
//! Applies the per-group zero-forcing matrices to the received data
//! symbols and emits soft bits for every UE. Workers partition the
//! subcarrier axis and walk it in `demul_block_size` blocks clipped to
//! their shard.

use crossbeam_channel::Sender;
use num_complex::Complex32;
use tracing::{debug, error};

use common::types::ThreadRole;
use common::utils::timing::rdtsc;
use common::utils::{align_down, worker_shard};

use crate::controller::signal_received;
use crate::stages::qam_llrs;
use crate::txrx::TxJob;
use crate::worker::{send_job, Ctx, PollLoop, WorkerStats};

pub fn demul_worker(ctx: Ctx, local_idx: usize, tx: Sender<TxJob>) -> WorkerStats {
    let cfg = &ctx.cfg;
    let tid = cfg.demul_thread_offset + local_idx;
    let shard = worker_shard(cfg.ofdm_data_num, cfg.total_demul_workers(), tid);
    debug!(
        "Demul worker {tid} owns subcarriers [{}, {})",
        shard.start, shard.end
    );

    let ants = cfg.bs_ant_num;
    let ues = cfg.ue_num;
    let mod_bits = cfg.mod_order_bits;
    let data_base = ctx.buffers.sc_data.start;

    let mut pl = PollLoop::new(ThreadRole::WorkerDemul, tid, cfg, ctx.freq_ghz);
    let mut frame = 0usize;
    let mut data_sym = 0usize;

    while ctx.flags.is_running() && !signal_received() {
        if ctx.tracker.received_all_zf_pkts(frame)
            && ctx.tracker.received_all_ul_data_pkts(frame, data_sym)
        {
            pl.observe_frame(frame);
            let t0 = rdtsc();
            let slot = frame % cfg.frame_window;
            let symbol = cfg.ul_pilot_syms + data_sym;

            let mut block = align_down(shard.start, cfg.demul_block_size);
            while block < shard.end {
                let cur_start = shard.start.max(block);
                let cur_end = shard.end.min(block + cfg.demul_block_size);
                for sc in cur_start..cur_end {
                    let w = ctx
                        .buffers
                        .post_zf
                        .view(slot, ctx.buffers.zf_local_group(sc), 0);
                    let y = ctx.buffers.freq_iq.view(slot, symbol, sc - data_base);
                    // SAFETY: subcarrier rows are partitioned by worker
                    // shard; this worker is the row's unique writer and TX
                    // reads only after the job below.
                    let out = unsafe {
                        ctx.buffers
                            .post_demul_to_send
                            .view_mut(slot, data_sym, sc - data_base)
                    };
                    for ue in 0..ues {
                        let row = &w[ue * ants..(ue + 1) * ants];
                        let mut xhat = Complex32::new(0.0, 0.0);
                        for (coeff, sample) in row.iter().zip(y.iter()) {
                            xhat += coeff * Complex32::new(sample.re as f32, sample.im as f32);
                        }
                        qam_llrs(xhat, mod_bits, &mut out[ue * mod_bits..(ue + 1) * mod_bits]);
                    }
                }
                block += cfg.demul_block_size;
            }

            let t1 = rdtsc();
            if let Err(e) = ctx
                .tracker
                .record_demul_production(frame, data_sym, shard.len() as u64)
            {
                ctx.flags.fail(e);
                break;
            }
            if !send_job(
                &tx,
                TxJob::Demod {
                    frame,
                    data_sym,
                    sc_start: shard.start,
                    sc_len: shard.len(),
                },
                &ctx.flags,
            ) {
                break;
            }
            pl.on_work(t0, t1, rdtsc(), shard.len() as u64);

            data_sym += 1;
            if data_sym == cfg.ul_data_symbol_num() {
                data_sym = 0;
                frame += 1;
            }
        } else {
            pl.on_idle();
        }
    }

    if ctx.flags.fatal_error().is_some() {
        error!("Demul worker {tid} stalled at (frame {frame}, data symbol {data_sym})");
    }
    pl.finish()
}
