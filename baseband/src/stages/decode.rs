//! Decode Stage
//!
//! Consumes the fanned-in soft bits for the server's UEs and produces
//! hard user bits, one call per (data symbol, UE) pair. Workers stride
//! the pair index by the local demul worker count so each server's demul
//! output feeds its own decoders without extra shuffling; the worker
//! finishing a frame's last pair advances the frame window.

use tracing::{debug, error};

use common::types::ThreadRole;
use common::utils::pack_bits;
use common::utils::timing::rdtsc;

use crate::controller::signal_received;
use crate::stages::hard_decision;
use crate::worker::{Ctx, PollLoop, WorkerStats};

pub fn decode_worker(ctx: Ctx, local_idx: usize) -> WorkerStats {
    let cfg = &ctx.cfg;
    let tid = cfg.decode_thread_offset + local_idx;
    let ues_local = ctx.map.servers[cfg.server_idx].ue.len();
    let pairs_per_frame = cfg.ul_data_symbol_num() * ues_local;
    let stride = cfg.local_demul_workers();
    debug!(
        "Decode worker {tid} strides {pairs_per_frame} (symbol, UE) pairs by {stride}"
    );

    let nbits = cfg.ofdm_data_num * cfg.mod_order_bits;
    let mut bits = vec![0u8; nbits];

    let mut pl = PollLoop::new(ThreadRole::WorkerDecode, tid, cfg, ctx.freq_ghz);
    let mut frame = 0usize;
    let mut idx = local_idx;

    while ctx.flags.is_running() && !signal_received() {
        let data_sym = idx / ues_local;
        let ue_rel = idx % ues_local;
        if ctx.tracker.received_all_demod_pkts(frame, data_sym) {
            pl.observe_frame(frame);
            let t0 = rdtsc();
            let slot = frame % cfg.frame_window;

            let llrs = ctx.buffers.post_demul.view(slot, data_sym, ue_rel);
            for (bit, &llr) in bits.iter_mut().zip(llrs.iter()) {
                *bit = hard_decision(llr);
            }
            // SAFETY: (symbol, UE) pairs are partitioned by the stride;
            // this worker is the pair's unique writer.
            let out = unsafe { ctx.buffers.post_decode.view_mut(slot, data_sym, ue_rel) };
            pack_bits(&bits, out);

            let t1 = rdtsc();
            if let Err(e) = ctx.tracker.record_decode_production(frame) {
                ctx.flags.fail(e);
                break;
            }

            idx += stride;
            let mut finished_frame = false;
            if idx >= pairs_per_frame {
                idx = local_idx;
                match ctx.tracker.advance_frame_complete(frame) {
                    Ok(_last) => {}
                    Err(e) => {
                        ctx.flags.fail(e);
                        break;
                    }
                }
                frame += 1;
                finished_frame = true;
            }
            pl.on_work(t0, t1, rdtsc(), 1);
            if finished_frame && frame == cfg.frames_to_test {
                break;
            }
        } else {
            pl.on_idle();
        }
    }

    if ctx.flags.fatal_error().is_some() {
        error!("Decode worker {tid} stalled at (frame {frame}, pair index {idx})");
    }
    pl.finish()
}
