//! Shared Artifact Buffers
//!
//! Every inter-stage edge is a fixed arena sized once at startup:
//! `(slot, symbol-or-UE, antenna-or-subcarrier) × payload`, addressed by
//! pure index arithmetic with strides padded to cache-line multiples.
//! There is no allocation, locking or bounds growth on the hot path.
//!
//! Write exclusivity is a protocol property, not a borrow-checker one:
//! each coordinate has exactly one writer (derived from the worker or RX
//! queue partition), and readers touch a coordinate only after the frame
//! tracker reports the producing stage complete, which orders the writes
//! before the reads.

use std::cell::UnsafeCell;

use common::types::{Cf32, IqSample, Shard};
use common::SystemConfig;
use tracing::info;

const CACHE_LINE: usize = 64;

/// A fixed three-axis arena of payload slices.
pub struct Arena<T> {
    cells: Box<[UnsafeCell<T>]>,
    dim1: usize,
    dim2: usize,
    dim3: usize,
    payload: usize,
    stride: usize,
}

// SAFETY: concurrent access follows the single-writer-per-coordinate
// protocol documented on the module; the arena itself adds no aliasing.
unsafe impl<T: Send + Sync> Sync for Arena<T> {}
unsafe impl<T: Send> Send for Arena<T> {}

impl<T: Copy + Default> Arena<T> {
    pub fn new(dim1: usize, dim2: usize, dim3: usize, payload: usize) -> Self {
        let elems_per_line = (CACHE_LINE / std::mem::size_of::<T>()).max(1);
        let stride = payload.div_ceil(elems_per_line) * elems_per_line;
        let cells = (0..dim1 * dim2 * dim3 * stride)
            .map(|_| UnsafeCell::new(T::default()))
            .collect();
        Self {
            cells,
            dim1,
            dim2,
            dim3,
            payload,
            stride,
        }
    }

    #[inline]
    fn offset(&self, a: usize, b: usize, c: usize) -> usize {
        debug_assert!(a < self.dim1 && b < self.dim2 && c < self.dim3);
        ((a * self.dim2 + b) * self.dim3 + c) * self.stride
    }

    /// Read view of one coordinate's payload. Callers must have observed
    /// the producing stage's completion through the tracker.
    #[inline]
    pub fn view(&self, a: usize, b: usize, c: usize) -> &[T] {
        let off = self.offset(a, b, c);
        // SAFETY: no writer touches this coordinate after its production
        // was published (write-once per slot occupancy).
        unsafe { std::slice::from_raw_parts(self.cells[off].get() as *const T, self.payload) }
    }

    /// Mutable view of one coordinate's payload.
    ///
    /// # Safety
    /// The caller must be the coordinate's unique writer under the stage
    /// partition, and the slot must not be concurrently read (the tracker
    /// has not yet published this production).
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn view_mut(&self, a: usize, b: usize, c: usize) -> &mut [T] {
        let off = self.offset(a, b, c);
        std::slice::from_raw_parts_mut(self.cells[off].get(), self.payload)
    }

    /// Write a run of elements inside one coordinate's payload without
    /// forming a `&mut` over the whole row, so two threads may fill
    /// disjoint regions of the same payload concurrently (the transpose
    /// path: RX threads scatter per-antenna columns into
    /// subcarrier-major rows).
    ///
    /// # Safety
    /// `[elem_start, elem_start + src.len())` must be written by this
    /// caller only for the slot's occupancy, and not read until the
    /// production covering it is published.
    #[inline]
    pub unsafe fn write_region(&self, a: usize, b: usize, c: usize, elem_start: usize, src: &[T]) {
        debug_assert!(elem_start + src.len() <= self.payload);
        let base = self.cells[self.offset(a, b, c) + elem_start].get();
        std::ptr::copy_nonoverlapping(src.as_ptr(), base, src.len());
    }

    /// Write a single element. Same contract as [`Arena::write_region`].
    ///
    /// # Safety
    /// See [`Arena::write_region`].
    #[inline]
    pub unsafe fn write_elem(&self, a: usize, b: usize, c: usize, elem: usize, value: T) {
        debug_assert!(elem < self.payload);
        *self.cells[self.offset(a, b, c) + elem].get() = value;
    }

    pub fn payload_len(&self) -> usize {
        self.payload
    }

    pub fn size_bytes(&self) -> usize {
        self.cells.len() * std::mem::size_of::<T>()
    }
}

/// All inter-stage arenas of one server, allocated together at `Init`.
pub struct Buffers {
    /// Raw RRU samples: `(slot, symbol, local antenna) × ofdm_ca_num`.
    pub time_iq: Arena<IqSample>,
    /// FFT output awaiting fan-out: `(slot, symbol, local antenna) × C`.
    pub freq_iq_to_send: Arena<IqSample>,
    /// Fanned-in FFT output, subcarrier-major:
    /// `(slot, symbol, local subcarrier) × A`, so channel estimation and
    /// equalization stream one subcarrier across all antennas
    /// contiguously. Pilot symbols hold the group-aligned ZF shard, data
    /// symbols the demul shard; `freq_shard(symbol)` says which.
    pub freq_iq: Arena<IqSample>,
    /// ZF matrices for local demodulation: `(slot, group) × (U × A)`.
    pub post_zf: Arena<Cf32>,
    /// ZF matrices awaiting fan-out: `(slot, group) × (U × A)`, indexed by
    /// this server's ZF group span. Distinct storage from `post_zf`.
    pub post_zf_to_send: Arena<Cf32>,
    /// Demodulated soft bits awaiting fan-out, subcarrier-major:
    /// `(slot, data symbol, local demul subcarrier) × (U × mod bits)`.
    pub post_demul_to_send: Arena<i8>,
    /// Fanned-in soft bits for local decoding:
    /// `(slot, data symbol, local UE) × (C × mod bits)`.
    pub post_demul: Arena<i8>,
    /// Decoded bits: `(slot, data symbol, local UE) × decoded bytes`.
    pub post_decode: Arena<u8>,

    ue_num: usize,
    pilot_syms: usize,
    /// Subcarriers carried by local pilot freq-IQ coordinates.
    pub sc_pilot: Shard,
    /// Subcarriers carried by local data freq-IQ coordinates.
    pub sc_data: Shard,
    /// Group span of `post_zf` rows (demul range, group aligned).
    pub zf_local_span: Shard,
    /// Group span of `post_zf_to_send` rows (ZF range, group aligned).
    pub zf_out_span: Shard,
}

impl Buffers {
    pub fn new(cfg: &SystemConfig) -> Self {
        let shards = cfg.local_shards();
        let w = cfg.frame_window;
        let s = cfg.symbol_num_perframe;
        let data_syms = cfg.ul_data_symbol_num();
        let a = cfg.bs_ant_num;
        let u = cfg.ue_num;
        let c = cfg.ofdm_data_num;
        let ant_local = shards.ant.len();
        let sc_pilot = cfg.pilot_sc_shard(cfg.server_idx);
        let sc_data = shards.sc_demul;
        let zf_local_span = cfg.demul_group_span(cfg.server_idx);
        let zf_out_span = cfg.group_aligned(shards.sc_zf);
        let local_groups = zf_local_span.len().div_ceil(u);
        let out_groups = zf_out_span.len().div_ceil(u);

        let buffers = Self {
            time_iq: Arena::new(w, s, ant_local, cfg.ofdm_ca_num),
            freq_iq_to_send: Arena::new(w, s, ant_local, c),
            freq_iq: Arena::new(w, s, sc_pilot.len().max(sc_data.len()), a),
            post_zf: Arena::new(w, local_groups, 1, u * a),
            post_zf_to_send: Arena::new(w, out_groups, 1, u * a),
            post_demul_to_send: Arena::new(w, data_syms, sc_data.len(), u * cfg.mod_order_bits),
            post_demul: Arena::new(w, data_syms, shards.ue.len(), c * cfg.mod_order_bits),
            post_decode: Arena::new(
                w,
                data_syms,
                shards.ue.len(),
                cfg.decoded_bytes_per_symbol(),
            ),
            ue_num: u,
            pilot_syms: cfg.ul_pilot_syms,
            sc_pilot,
            sc_data,
            zf_local_span,
            zf_out_span,
        };
        info!(
            "allocated artifact buffers: {:.1} MiB across 8 arenas",
            buffers.total_bytes() as f64 / (1024.0 * 1024.0)
        );
        buffers
    }

    /// Which subcarrier shard local freq-IQ coordinates carry for a given
    /// symbol.
    #[inline]
    pub fn freq_shard(&self, symbol: usize) -> Shard {
        if symbol < self.pilot_syms {
            self.sc_pilot
        } else {
            self.sc_data
        }
    }

    /// Row index into `post_zf` for the group containing `sc`.
    #[inline]
    pub fn zf_local_group(&self, sc: usize) -> usize {
        debug_assert!(sc >= self.zf_local_span.start);
        (sc - self.zf_local_span.start) / self.ue_num
    }

    /// Row index into `post_zf_to_send` for a group base subcarrier.
    #[inline]
    pub fn zf_out_group(&self, group_base: usize) -> usize {
        debug_assert!(group_base >= self.zf_out_span.start);
        (group_base - self.zf_out_span.start) / self.ue_num
    }

    pub fn total_bytes(&self) -> usize {
        self.time_iq.size_bytes()
            + self.freq_iq_to_send.size_bytes()
            + self.freq_iq.size_bytes()
            + self.post_zf.size_bytes()
            + self.post_zf_to_send.size_bytes()
            + self.post_demul_to_send.size_bytes()
            + self.post_demul.size_bytes()
            + self.post_decode.size_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_addressing_is_disjoint() {
        let arena: Arena<u32> = Arena::new(2, 3, 4, 5);
        // Distinct coordinates never overlap: write a tag through every
        // coordinate, then verify each reads back its own.
        for a in 0..2 {
            for b in 0..3 {
                for c in 0..4 {
                    let tag = (a * 100 + b * 10 + c) as u32;
                    // SAFETY: test is single-threaded.
                    let view = unsafe { arena.view_mut(a, b, c) };
                    view.fill(tag);
                }
            }
        }
        for a in 0..2 {
            for b in 0..3 {
                for c in 0..4 {
                    let tag = (a * 100 + b * 10 + c) as u32;
                    assert!(arena.view(a, b, c).iter().all(|&v| v == tag));
                }
            }
        }
    }

    #[test]
    fn test_arena_stride_is_cache_line_padded() {
        let arena: Arena<u8> = Arena::new(1, 1, 2, 10);
        assert_eq!(arena.payload_len(), 10);
        // 10-byte payload pads to one 64-byte line per coordinate.
        assert_eq!(arena.size_bytes(), 2 * 64);
    }

    #[test]
    fn test_view_after_write_roundtrip() {
        let arena: Arena<IqSample> = Arena::new(4, 2, 2, 8);
        let samples: Vec<IqSample> = (0..8).map(|i| IqSample::new(i, -i)).collect();
        // SAFETY: single-threaded test.
        unsafe { arena.view_mut(3, 1, 0) }.copy_from_slice(&samples);
        assert_eq!(arena.view(3, 1, 0), &samples[..]);
        assert!(arena.view(3, 1, 1).iter().all(|s| s.re == 0 && s.im == 0));
    }
}
