//! Packet I/O Plane
//!
//! RX threads busy-poll their sockets, demultiplex inbound artifacts by
//! (kind, frame, symbol, shard) into the arenas and notify the tracker.
//! TX threads drain descriptor channels fed by the workers, frame the
//! payloads from the to-send mirrors and fan them out to the peers the
//! shard map designates. Self-destined artifacts short-circuit into the
//! local arenas without touching the socket.
//!
//! Queue discipline: a coordinate always hashes to the same RX queue
//! (antenna for IQ kinds, group for ZF, UE for demod), so each arena
//! region keeps a single writer.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, warn};

use common::types::{Cf32, IqSample, Shard};
use transport::packet::{cf32_to_payload, iq_to_payload, payload_to_cf32, payload_to_iq};
use transport::{PacketHeader, PacketKind, UdpEndpoint, HEADER_LEN, MAX_PACKET_LEN};

use crate::controller::signal_received;
use crate::state::Arrival;
use crate::worker::Ctx;
use crate::PipelineError;

/// Descriptor of a freshly produced artifact, handed from a worker to its
/// TX thread over a bounded SPSC channel.
#[derive(Debug, Clone, Copy)]
pub enum TxJob {
    /// One (frame, symbol, antenna) of FFT output to split across the
    /// subcarrier owners.
    FreqIq {
        frame: usize,
        symbol: usize,
        ant: usize,
    },
    /// One ZF group's matrix for the demodulation owners of its columns.
    Zf {
        frame: usize,
        group_base: usize,
        group_len: usize,
    },
    /// One worker shard of soft bits for a data symbol, split by UE owner.
    Demod {
        frame: usize,
        data_sym: usize,
        sc_start: usize,
        sc_len: usize,
    },
}

/// Per-RX-thread counters, aggregated by the controller at exit.
#[derive(Debug, Default, Clone)]
pub struct RxStats {
    pub packets: u64,
    pub bytes: u64,
    pub duplicates: u64,
    pub stale: u64,
    pub malformed: u64,
    pub unknown_shard: u64,
}

/// Per-TX-thread counters.
#[derive(Debug, Default, Clone)]
pub struct TxStats {
    pub packets: u64,
    pub bytes: u64,
}

/// RX thread body: busy-poll one queue's socket until shutdown.
pub fn rx_thread(ctx: Ctx, endpoint: UdpEndpoint, queue: usize) -> RxStats {
    let mut stats = RxStats::default();
    let mut buf = [0u8; MAX_PACKET_LEN];
    let mut scratch: Vec<IqSample> = vec![IqSample::new(0, 0); ctx.cfg.ofdm_ca_num];
    let mut zf_scratch: Vec<Cf32> =
        vec![Cf32::new(0.0, 0.0); ctx.cfg.ue_num * ctx.cfg.bs_ant_num];
    debug!("RX thread {queue} polling");

    while ctx.flags.is_running() && !signal_received() {
        match endpoint.try_recv(&mut buf) {
            Ok(Some((len, _from))) => {
                stats.packets += 1;
                stats.bytes += len as u64;
                handle_packet(&ctx, &buf[..len], &mut scratch, &mut zf_scratch, &mut stats);
            }
            Ok(None) => std::hint::spin_loop(),
            Err(e) => {
                ctx.flags.fail(PipelineError::RxNicError {
                    detail: e.to_string(),
                });
                break;
            }
        }
    }
    stats
}

fn handle_packet(
    ctx: &Ctx,
    datagram: &[u8],
    scratch: &mut [IqSample],
    zf_scratch: &mut [Cf32],
    stats: &mut RxStats,
) {
    let cfg = &ctx.cfg;
    let (header, payload) = match PacketHeader::decode(datagram) {
        Ok(parsed) => parsed,
        Err(e) => {
            stats.malformed += 1;
            warn!("dropping inbound packet: {e}");
            return;
        }
    };
    let frame = header.frame as usize;
    let symbol = header.symbol as usize;

    // Stale and lapping packets are sorted out before any copy so a
    // recycled slot is never touched.
    let slot = match ctx.tracker.admit(frame) {
        Ok(Some(slot)) => slot,
        Ok(None) => {
            stats.stale += 1;
            return;
        }
        Err(e) => {
            ctx.flags.fail(e);
            return;
        }
    };

    match header.kind {
        PacketKind::TimeIq => {
            let ant = header.antenna_or_ue as usize;
            let ant_range = ctx.map.servers[cfg.server_idx].ant;
            if symbol >= cfg.symbol_num_perframe || !ant_range.contains(ant) {
                stats.unknown_shard += 1;
                return;
            }
            if ctx.tracker.received_all_time_iq_pkts(frame, symbol) {
                stats.duplicates += 1;
                return;
            }
            let dst = &mut scratch[..cfg.ofdm_ca_num];
            if payload_to_iq(payload, dst).is_err() {
                stats.malformed += 1;
                return;
            }
            // SAFETY: the RRU keys the RX queue by antenna, so this thread
            // is the coordinate's unique writer.
            unsafe {
                ctx.buffers
                    .time_iq
                    .view_mut(slot, symbol, ant - ant_range.start)
            }
            .copy_from_slice(dst);
            match ctx.tracker.record_time_iq_arrival(frame, symbol) {
                Ok(Arrival::Fresh(_)) => {}
                Ok(_) => stats.duplicates += 1,
                Err(e) => ctx.flags.fail(e),
            }
        }
        PacketKind::FreqIq => {
            let ant = header.antenna_or_ue as usize;
            let shard = if symbol >= cfg.symbol_num_perframe || ant >= cfg.bs_ant_num {
                None
            } else {
                Some(ctx.buffers.freq_shard(symbol))
            };
            let Some(shard) = shard else {
                stats.unknown_shard += 1;
                return;
            };
            if header.sc_start as usize != shard.start || header.sc_len as usize != shard.len() {
                stats.unknown_shard += 1;
                return;
            }
            let freq_done = if symbol < cfg.ul_pilot_syms {
                ctx.tracker.received_all_pilot_pkts(frame)
            } else {
                ctx.tracker
                    .received_all_ul_data_pkts(frame, symbol - cfg.ul_pilot_syms)
            };
            if freq_done {
                stats.duplicates += 1;
                return;
            }
            let dst = &mut scratch[..shard.len()];
            if payload_to_iq(payload, dst).is_err() {
                stats.malformed += 1;
                return;
            }
            scatter_freq_column(ctx, slot, symbol, ant, dst);
            match ctx.tracker.record_freq_iq_arrival(frame, symbol) {
                Ok(Arrival::Fresh(_)) => {}
                Ok(_) => stats.duplicates += 1,
                Err(e) => ctx.flags.fail(e),
            }
        }
        PacketKind::Zf => {
            let group_base = header.sc_start as usize;
            let group = Shard::new(
                group_base,
                (group_base + header.sc_len as usize).min(cfg.ofdm_data_num),
            );
            let span = ctx.buffers.zf_local_span;
            if group_base % cfg.ue_num != 0 || !span.contains(group_base) {
                stats.unknown_shard += 1;
                return;
            }
            if ctx.tracker.received_all_zf_pkts(frame) {
                stats.duplicates += 1;
                return;
            }
            if payload_to_cf32(payload, zf_scratch).is_err() {
                stats.malformed += 1;
                return;
            }
            // SAFETY: ZF packets key the RX queue by group, making this
            // thread the group row's unique writer.
            unsafe {
                ctx.buffers
                    .post_zf
                    .view_mut(slot, ctx.buffers.zf_local_group(group_base), 0)
            }
            .copy_from_slice(zf_scratch);
            let cols = group
                .intersect(&ctx.map.servers[cfg.server_idx].sc_demul)
                .len() as u64;
            match ctx.tracker.record_zf_arrival(frame, cols) {
                Ok(Arrival::Fresh(_)) => {}
                Ok(_) => stats.duplicates += 1,
                Err(e) => ctx.flags.fail(e),
            }
        }
        PacketKind::Demod => {
            let ue = header.antenna_or_ue as usize;
            let ue_range = ctx.map.servers[cfg.server_idx].ue;
            let sc_start = header.sc_start as usize;
            let sc_len = header.sc_len as usize;
            if symbol < cfg.ul_pilot_syms
                || symbol >= cfg.symbol_num_perframe
                || !ue_range.contains(ue)
                || sc_start + sc_len > cfg.ofdm_data_num
            {
                stats.unknown_shard += 1;
                return;
            }
            let data_sym = symbol - cfg.ul_pilot_syms;
            if ctx.tracker.received_all_demod_pkts(frame, data_sym) {
                stats.duplicates += 1;
                return;
            }
            let mod_bits = cfg.mod_order_bits;
            if payload.len() != sc_len * mod_bits {
                stats.malformed += 1;
                return;
            }
            // SAFETY: demod packets key the RX queue by UE; peers cover
            // disjoint subcarrier regions of the row.
            unsafe {
                ctx.buffers.post_demul.write_region(
                    slot,
                    data_sym,
                    ue - ue_range.start,
                    sc_start * mod_bits,
                    llr_bytes(payload),
                );
            }
            match ctx
                .tracker
                .record_demod_arrival(frame, data_sym, sc_len as u64)
            {
                Ok(Arrival::Fresh(_)) => {}
                Ok(_) => stats.duplicates += 1,
                Err(e) => ctx.flags.fail(e),
            }
        }
        PacketKind::Ping => {
            // Liveness nudges are for the RRU; one landing here is noise.
        }
    }
}

/// Scatter one antenna's subcarrier run into the subcarrier-major local
/// freq-IQ rows (the transpose step of the fan-in).
fn scatter_freq_column(ctx: &Ctx, slot: usize, symbol: usize, ant: usize, samples: &[IqSample]) {
    for (i, &sample) in samples.iter().enumerate() {
        // SAFETY: per-antenna elements of a row are written by exactly one
        // thread (queue keyed by antenna / TX loopback for local ones).
        unsafe {
            ctx.buffers.freq_iq.write_elem(slot, symbol, i, ant, sample);
        }
    }
}

#[inline]
fn llr_bytes(payload: &[u8]) -> &[i8] {
    // SAFETY: i8 and u8 share layout.
    unsafe { std::slice::from_raw_parts(payload.as_ptr() as *const i8, payload.len()) }
}

/// TX thread body: drain the worker hand-off, frame and fan out.
pub fn tx_thread(ctx: Ctx, endpoint: UdpEndpoint, jobs: Receiver<TxJob>, idx: usize) -> TxStats {
    let mut stats = TxStats::default();
    let mut frame_buf = vec![0u8; MAX_PACKET_LEN];
    let mut gather: Vec<i8> = vec![0; ctx.cfg.ofdm_data_num * ctx.cfg.mod_order_bits];
    debug!("TX thread {idx} draining");

    loop {
        match jobs.recv_timeout(Duration::from_millis(1)) {
            Ok(job) => {
                if let Err(e) = dispatch(&ctx, &endpoint, job, &mut frame_buf, &mut gather, &mut stats)
                {
                    ctx.flags.fail(e);
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if !ctx.flags.is_running() || signal_received() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    stats
}

fn dispatch(
    ctx: &Ctx,
    endpoint: &UdpEndpoint,
    job: TxJob,
    frame_buf: &mut [u8],
    gather: &mut [i8],
    stats: &mut TxStats,
) -> Result<(), PipelineError> {
    let cfg = &ctx.cfg;
    let self_idx = cfg.server_idx;
    match job {
        TxJob::FreqIq { frame, symbol, ant } => {
            let slot = frame % cfg.frame_window;
            let ant_base = ctx.map.servers[self_idx].ant.start;
            let src = ctx.buffers.freq_iq_to_send.view(slot, symbol, ant - ant_base);
            for (dest, shards) in ctx.map.servers.iter().enumerate() {
                let shard = if symbol < cfg.ul_pilot_syms {
                    shards.sc_pilot
                } else {
                    shards.sc_demul
                };
                if shard.is_empty() {
                    continue;
                }
                let chunk = &src[shard.start..shard.end];
                if dest == self_idx {
                    deliver_freq_local(ctx, frame, slot, symbol, ant, chunk, stats);
                    continue;
                }
                let header = PacketHeader {
                    kind: PacketKind::FreqIq,
                    frame: frame as u32,
                    symbol: symbol as u16,
                    antenna_or_ue: ant as u16,
                    sc_start: shard.start as u16,
                    sc_len: shard.len() as u16,
                    source_server: self_idx as u16,
                };
                let len = HEADER_LEN + chunk.len() * 4;
                header.encode(frame_buf);
                iq_to_payload(chunk, &mut frame_buf[HEADER_LEN..len]);
                send(ctx, endpoint, &frame_buf[..len], dest, ant, stats)?;
            }
        }
        TxJob::Zf {
            frame,
            group_base,
            group_len,
        } => {
            let slot = frame % cfg.frame_window;
            let group = Shard::new(group_base, group_base + group_len);
            let src = ctx
                .buffers
                .post_zf_to_send
                .view(slot, ctx.buffers.zf_out_group(group_base), 0);
            for (dest, shards) in ctx.map.servers.iter().enumerate() {
                let cols = group.intersect(&shards.sc_demul);
                if cols.is_empty() {
                    continue;
                }
                if dest == self_idx {
                    deliver_zf_local(ctx, frame, slot, group_base, cols.len(), src, stats);
                    continue;
                }
                let header = PacketHeader {
                    kind: PacketKind::Zf,
                    frame: frame as u32,
                    symbol: 0,
                    antenna_or_ue: 0,
                    sc_start: group_base as u16,
                    sc_len: group_len as u16,
                    source_server: self_idx as u16,
                };
                let len = HEADER_LEN + src.len() * 8;
                header.encode(frame_buf);
                cf32_to_payload(src, &mut frame_buf[HEADER_LEN..len]);
                send(
                    ctx,
                    endpoint,
                    &frame_buf[..len],
                    dest,
                    group_base / cfg.ue_num,
                    stats,
                )?;
            }
        }
        TxJob::Demod {
            frame,
            data_sym,
            sc_start,
            sc_len,
        } => {
            let slot = frame % cfg.frame_window;
            let mod_bits = cfg.mod_order_bits;
            let data_base = ctx.buffers.sc_data.start;
            for (dest, shards) in ctx.map.servers.iter().enumerate() {
                for ue in shards.ue.start..shards.ue.end {
                    // Gather this UE's soft bits from the subcarrier-major
                    // to-send rows.
                    let out = &mut gather[..sc_len * mod_bits];
                    for sc in sc_start..sc_start + sc_len {
                        let row = ctx
                            .buffers
                            .post_demul_to_send
                            .view(slot, data_sym, sc - data_base);
                        out[(sc - sc_start) * mod_bits..(sc - sc_start + 1) * mod_bits]
                            .copy_from_slice(&row[ue * mod_bits..(ue + 1) * mod_bits]);
                    }
                    if dest == self_idx {
                        deliver_demod_local(ctx, frame, slot, data_sym, ue, sc_start, out, stats);
                        continue;
                    }
                    let header = PacketHeader {
                        kind: PacketKind::Demod,
                        frame: frame as u32,
                        symbol: (cfg.ul_pilot_syms + data_sym) as u16,
                        antenna_or_ue: ue as u16,
                        sc_start: sc_start as u16,
                        sc_len: sc_len as u16,
                        source_server: self_idx as u16,
                    };
                    let len = HEADER_LEN + out.len();
                    header.encode(frame_buf);
                    for (dst, &llr) in frame_buf[HEADER_LEN..len].iter_mut().zip(out.iter()) {
                        *dst = llr as u8;
                    }
                    send(ctx, endpoint, &frame_buf[..len], dest, ue, stats)?;
                }
            }
        }
    }
    Ok(())
}

/// Send to a peer; the RX queue is picked by the coordinate key so a
/// coordinate always lands on the same peer thread.
fn send(
    ctx: &Ctx,
    endpoint: &UdpEndpoint,
    datagram: &[u8],
    dest: usize,
    queue_key: usize,
    stats: &mut TxStats,
) -> Result<(), PipelineError> {
    let peer = &ctx.cfg.servers[dest];
    let port = peer.rx_port_base + (queue_key % ctx.cfg.rx_thread_num) as u16;
    let addr = std::net::SocketAddr::new(peer.addr, port);
    endpoint
        .send_to(datagram, addr)
        .map_err(|e| PipelineError::TxFailed {
            dest: addr.to_string(),
            detail: e.to_string(),
        })?;
    stats.packets += 1;
    stats.bytes += datagram.len() as u64;
    Ok(())
}

fn deliver_freq_local(
    ctx: &Ctx,
    frame: usize,
    slot: usize,
    symbol: usize,
    ant: usize,
    chunk: &[IqSample],
    _stats: &mut TxStats,
) {
    scatter_freq_column(ctx, slot, symbol, ant, chunk);
    match ctx.tracker.record_freq_iq_arrival(frame, symbol) {
        Ok(Arrival::Fresh(_)) => {}
        Ok(other) => warn!("local freq-IQ delivery classified {other:?}"),
        Err(e) => ctx.flags.fail(e),
    }
}

fn deliver_zf_local(
    ctx: &Ctx,
    frame: usize,
    slot: usize,
    group_base: usize,
    cols: usize,
    matrix: &[Cf32],
    _stats: &mut TxStats,
) {
    // SAFETY: a group has a unique producing worker, whose jobs all land
    // on this TX thread.
    unsafe {
        ctx.buffers
            .post_zf
            .view_mut(slot, ctx.buffers.zf_local_group(group_base), 0)
    }
    .copy_from_slice(matrix);
    match ctx.tracker.record_zf_arrival(frame, cols as u64) {
        Ok(Arrival::Fresh(_)) => {}
        Ok(other) => warn!("local ZF delivery classified {other:?}"),
        Err(e) => ctx.flags.fail(e),
    }
}

fn deliver_demod_local(
    ctx: &Ctx,
    frame: usize,
    slot: usize,
    data_sym: usize,
    ue: usize,
    sc_start: usize,
    llrs: &[i8],
    _stats: &mut TxStats,
) {
    let ue_base = ctx.map.servers[ctx.cfg.server_idx].ue.start;
    // SAFETY: this TX thread is the unique writer for the producing
    // worker's subcarrier region of the row.
    unsafe {
        ctx.buffers.post_demul.write_region(
            slot,
            data_sym,
            ue - ue_base,
            sc_start * ctx.cfg.mod_order_bits,
            llrs,
        );
    }
    let sc_len = (llrs.len() / ctx.cfg.mod_order_bits) as u64;
    match ctx.tracker.record_demod_arrival(frame, data_sym, sc_len) {
        Ok(Arrival::Fresh(_)) => {}
        Ok(other) => warn!("local demod delivery classified {other:?}"),
        Err(e) => ctx.flags.fail(e),
    }
}
