//! Channel Estimation and Zero-Forcing Stage
//!
//! Once every pilot packet of a frame has arrived, each ZF worker walks
//! the subcarrier groups whose representative falls in its shard,
//! estimates the channel from the frequency-orthogonal pilots and
//! computes the zero-forcing receiver matrix for the group. The
//! representative offset rotates per frame so boundary groups spread
//! across peers over time.

use crossbeam_channel::Sender;
use num_complex::Complex32;
use tracing::{debug, error, warn};

use common::types::ThreadRole;
use common::utils::timing::rdtsc;
use common::utils::{align_down, simple_hash, worker_shard};

use crate::controller::signal_received;
use crate::stages::{pilot_sequence, zero_forcing};
use crate::txrx::TxJob;
use crate::worker::{send_job, Ctx, PollLoop, WorkerStats};

pub fn zf_worker(ctx: Ctx, local_idx: usize, tx: Sender<TxJob>) -> WorkerStats {
    let cfg = &ctx.cfg;
    let tid = cfg.zf_thread_offset + local_idx;
    let shard = worker_shard(cfg.ofdm_data_num, cfg.total_zf_workers(), tid);
    debug!("ZF worker {tid} owns subcarriers [{}, {})", shard.start, shard.end);

    let ants = cfg.bs_ant_num;
    let ues = cfg.ue_num;
    let pilots = pilot_sequence(cfg.ofdm_data_num);
    let pilot_base = ctx.buffers.sc_pilot.start;
    // Channel estimate, column-major by UE: g[u * A + a].
    let mut g: Vec<Complex32> = vec![Complex32::new(0.0, 0.0); ants * ues];
    let mut w: Vec<Complex32> = vec![Complex32::new(0.0, 0.0); ues * ants];

    let mut pl = PollLoop::new(ThreadRole::WorkerZf, tid, cfg, ctx.freq_ghz);
    let mut frame = 0usize;

    while ctx.flags.is_running() && !signal_received() {
        if ctx.tracker.received_all_pilot_pkts(frame) {
            pl.observe_frame(frame);
            let t0 = rdtsc();
            let slot = frame % cfg.frame_window;

            // Representative subcarriers: one per group, shifted by the
            // per-frame hash offset, clamped to this worker's shard. A
            // frame whose representatives all fall outside the shard
            // yields zero units and still advances.
            let offset = (simple_hash(frame) % ues as u64) as usize;
            let mut first = shard.start - shard.start % ues + offset;
            if first < shard.start {
                first += ues;
            }
            let mut last = (shard.end - shard.end % ues + offset) as isize;
            if last >= shard.end as isize {
                last -= ues as isize;
            }

            let mut covered = 0u64;
            let mut groups = 0u64;
            if last >= first as isize {
                let mut rep = first;
                while rep as isize <= last {
                    let base = align_down(rep, ues);
                    let len = ues.min(cfg.ofdm_data_num - base);
                    estimate_group(&ctx, slot, base, len, &pilots, pilot_base, &mut g);
                    if !zero_forcing(&g, ants, ues, &mut w) {
                        warn!("singular channel for frame {frame} group {base}; matrices zeroed");
                    }
                    // SAFETY: each group's representative belongs to
                    // exactly one ZF worker cluster-wide, making this the
                    // coordinate's unique writer; TX reads only after the
                    // job below.
                    unsafe {
                        ctx.buffers
                            .post_zf_to_send
                            .view_mut(slot, ctx.buffers.zf_out_group(base), 0)
                    }
                    .copy_from_slice(&w);
                    if !send_job(
                        &tx,
                        TxJob::Zf {
                            frame,
                            group_base: base,
                            group_len: len,
                        },
                        &ctx.flags,
                    ) {
                        return pl.finish();
                    }
                    covered += len as u64;
                    groups += 1;
                    rep += ues;
                }
            }

            let t1 = rdtsc();
            if let Err(e) = ctx.tracker.record_zf_production(frame, covered) {
                ctx.flags.fail(e);
                break;
            }
            pl.on_work(t0, t1, rdtsc(), groups);
            frame += 1;
        } else {
            pl.on_idle();
        }
    }

    if ctx.flags.fatal_error().is_some() {
        error!("ZF worker {tid} stalled at frame {frame}");
    }
    pl.finish()
}

/// Estimate the `A × U` channel of one subcarrier group from the
/// frequency-orthogonal pilots: UE `u` owns subcarrier `base + u`, and
/// its per-antenna coefficient is the received pilot sample multiplied by
/// the conjugate of the known pilot, averaged over the pilot symbols.
fn estimate_group(
    ctx: &Ctx,
    slot: usize,
    base: usize,
    len: usize,
    pilots: &[Complex32],
    pilot_base: usize,
    g: &mut [Complex32],
) {
    let cfg = &ctx.cfg;
    let ants = cfg.bs_ant_num;
    let scale = 1.0 / cfg.ul_pilot_syms as f32;
    for u in 0..cfg.ue_num {
        let col = &mut g[u * ants..(u + 1) * ants];
        if u >= len {
            // Group clipped at the band edge: no pilot comb for this UE.
            // A unit column keeps the Gram matrix invertible.
            for (a, coeff) in col.iter_mut().enumerate() {
                *coeff = if a == u % ants {
                    Complex32::new(1.0, 0.0)
                } else {
                    Complex32::new(0.0, 0.0)
                };
            }
            continue;
        }
        let sc = base + u;
        let ref_conj = pilots[sc].conj() * scale;
        col.fill(Complex32::new(0.0, 0.0));
        for p in 0..cfg.ul_pilot_syms {
            let row = ctx.buffers.freq_iq.view(slot, p, sc - pilot_base);
            for (coeff, sample) in col.iter_mut().zip(row.iter()) {
                *coeff += Complex32::new(sample.re as f32, sample.im as f32) * ref_conj;
            }
        }
    }
}
