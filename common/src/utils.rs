//! Common Utilities
//!
//! Shard arithmetic, frame hashing, bit packing and the cycle-accurate
//! timing helpers used by the worker statistics.

/// Deterministic work partition: worker `tid` out of `total` owns
/// `[tid*dim/total, (tid+1)*dim/total)`. The last shard absorbs any
/// remainder.
pub fn worker_shard(dim: usize, total: usize, tid: usize) -> crate::Shard {
    debug_assert!(total > 0 && tid < total);
    crate::Shard::new(tid * dim / total, (tid + 1) * dim / total)
}

/// Round down to a multiple of `unit`.
pub fn align_down(x: usize, unit: usize) -> usize {
    x - x % unit
}

/// Round up to a multiple of `unit`.
pub fn align_up(x: usize, unit: usize) -> usize {
    x.div_ceil(unit) * unit
}

/// Cheap deterministic frame hash used to rotate the ZF subcarrier-group
/// representative across frames. SplitMix64 finalizer.
pub fn simple_hash(frame: usize) -> u64 {
    let mut z = (frame as u64).wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Pack hard bits into bytes, MSB first. The tail byte is zero-padded.
pub fn pack_bits(bits: &[u8], out: &mut [u8]) {
    debug_assert!(out.len() >= bits.len().div_ceil(8));
    for byte in out.iter_mut() {
        *byte = 0;
    }
    for (i, &bit) in bits.iter().enumerate() {
        if bit != 0 {
            out[i / 8] |= 1 << (7 - (i % 8));
        }
    }
}

/// Unpack bytes into bits, MSB first.
pub fn unpack_bits(bytes: &[u8], nbits: usize) -> Vec<u8> {
    let mut bits = Vec::with_capacity(nbits);
    for i in 0..nbits {
        bits.push((bytes[i / 8] >> (7 - (i % 8))) & 1);
    }
    bits
}

/// Timestamp-counter helpers. Worker statistics and the cooperative
/// backoff are measured in raw cycles and converted with a frequency
/// calibrated once at startup.
pub mod timing {
    use std::time::{Duration, Instant};

    /// Read the CPU timestamp counter. Falls back to a monotonic
    /// nanosecond clock on non-x86 targets.
    #[inline]
    pub fn rdtsc() -> u64 {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            core::arch::x86_64::_rdtsc()
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            use std::sync::OnceLock;
            static EPOCH: OnceLock<Instant> = OnceLock::new();
            EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
        }
    }

    /// Measure the timestamp-counter frequency in GHz against the OS
    /// clock. One 10 ms sleep at startup, never on the hot path.
    pub fn measure_rdtsc_freq_ghz() -> f64 {
        let start_cycles = rdtsc();
        let start = Instant::now();
        std::thread::sleep(Duration::from_millis(10));
        let cycles = rdtsc() - start_cycles;
        let nanos = start.elapsed().as_nanos() as f64;
        (cycles as f64 / nanos).max(1e-9)
    }

    #[inline]
    pub fn cycles_to_ms(cycles: u64, freq_ghz: f64) -> f64 {
        cycles as f64 / (freq_ghz * 1e6)
    }

    #[inline]
    pub fn ms_to_cycles(ms: f64, freq_ghz: f64) -> u64 {
        (ms * freq_ghz * 1e6) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_shard_even() {
        let shards: Vec<_> = (0..4).map(|t| worker_shard(1200, 4, t)).collect();
        assert!(shards.iter().all(|s| s.len() == 300));
        assert_eq!(shards[0].start, 0);
        assert_eq!(shards[3].end, 1200);
    }

    #[test]
    fn test_worker_shard_remainder() {
        // 1201 subcarriers over 4 workers: last shard absorbs the extra.
        let shards: Vec<_> = (0..4).map(|t| worker_shard(1201, 4, t)).collect();
        let lens: Vec<_> = shards.iter().map(|s| s.len()).collect();
        assert_eq!(lens, vec![300, 300, 300, 301]);
        assert_eq!(lens.iter().sum::<usize>(), 1201);
        // Tiling: no gaps, no overlaps.
        for w in shards.windows(2) {
            assert_eq!(w[0].end, w[1].start);
        }
    }

    #[test]
    fn test_alignment() {
        assert_eq!(align_down(600, 16), 592);
        assert_eq!(align_up(600, 16), 608);
        assert_eq!(align_down(608, 16), 608);
        assert_eq!(align_up(608, 16), 608);
    }

    #[test]
    fn test_simple_hash_deterministic() {
        assert_eq!(simple_hash(42), simple_hash(42));
        assert_ne!(simple_hash(1), simple_hash(2));
    }

    #[test]
    fn test_bit_roundtrip() {
        let bits = vec![1, 0, 1, 0, 1, 0, 1, 0, 1, 1, 0];
        let mut packed = vec![0u8; 2];
        pack_bits(&bits, &mut packed);
        assert_eq!(packed[0], 0xAA);
        assert_eq!(unpack_bits(&packed, bits.len()), bits);
    }

    #[test]
    fn test_rdtsc_monotonic() {
        let a = timing::rdtsc();
        let b = timing::rdtsc();
        assert!(b >= a);
    }
}
