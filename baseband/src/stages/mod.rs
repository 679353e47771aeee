//! Stage Kernels
//!
//! The four computational stages of the uplink pipeline plus the DSP
//! primitives they share: constellation mapping, soft-bit computation,
//! the known pilot sequence and the small complex linear algebra behind
//! zero-forcing. Kernels are pure functions over buffer views; all
//! scheduling lives in the worker loops.

pub mod decode;
pub mod demul;
pub mod fft;
pub mod zf;

use common::types::Cf32;
use common::utils::simple_hash;

pub use decode::decode_worker;
pub use demul::demul_worker;
pub use fft::fft_worker;
pub use zf::zf_worker;

const FRAC_1_SQRT_2: f32 = std::f32::consts::FRAC_1_SQRT_2;
const FRAC_1_SQRT_10: f32 = 0.316_227_77;

/// LLR quantization: unit constellation distance maps to this many
/// soft-bit steps before saturation.
const LLR_SCALE: f32 = 64.0;

/// Map `order_bits` hard bits to one constellation point (Gray-coded,
/// unit average power). Shared by the demodulator tables and the test
/// vector generators.
pub fn qam_modulate(bits: &[u8], order_bits: usize) -> Cf32 {
    match order_bits {
        2 => Cf32::new(
            (1.0 - 2.0 * bits[0] as f32) * FRAC_1_SQRT_2,
            (1.0 - 2.0 * bits[1] as f32) * FRAC_1_SQRT_2,
        ),
        4 => {
            // 16-QAM: I from (b0, b2), Q from (b1, b3).
            let i = (1.0 - 2.0 * bits[0] as f32) * (1.0 + 2.0 * bits[2] as f32);
            let q = (1.0 - 2.0 * bits[1] as f32) * (1.0 + 2.0 * bits[3] as f32);
            Cf32::new(i * FRAC_1_SQRT_10, q * FRAC_1_SQRT_10)
        }
        _ => unreachable!("modulation order validated at startup"),
    }
}

/// Max-log LLRs for one equalized symbol. Positive LLR means bit 0.
pub fn qam_llrs(x: Cf32, order_bits: usize, out: &mut [i8]) {
    #[inline]
    fn quant(v: f32) -> i8 {
        (v * LLR_SCALE).clamp(-127.0, 127.0) as i8
    }
    match order_bits {
        2 => {
            out[0] = quant(x.re);
            out[1] = quant(x.im);
        }
        4 => {
            out[0] = quant(x.re);
            out[1] = quant(x.im);
            out[2] = quant(2.0 * FRAC_1_SQRT_10 - x.re.abs());
            out[3] = quant(2.0 * FRAC_1_SQRT_10 - x.im.abs());
        }
        _ => unreachable!("modulation order validated at startup"),
    }
}

/// Hard decision on one soft bit.
#[inline]
pub fn hard_decision(llr: i8) -> u8 {
    (llr < 0) as u8
}

/// The known uplink pilot, one unit-power QPSK point per usable
/// subcarrier, derived deterministically so every server and the RRU
/// agree without exchanging it.
pub fn pilot_sequence(ofdm_data_num: usize) -> Vec<Cf32> {
    (0..ofdm_data_num)
        .map(|sc| {
            let h = simple_hash(sc.wrapping_add(0x5049_4c4f)); // "PILO"
            let re = if h & 1 == 0 { FRAC_1_SQRT_2 } else { -FRAC_1_SQRT_2 };
            let im = if h & 2 == 0 { FRAC_1_SQRT_2 } else { -FRAC_1_SQRT_2 };
            Cf32::new(re, im)
        })
        .collect()
}

/// In-place Gauss-Jordan inversion of an `n × n` complex matrix stored
/// row-major. Returns false if the matrix is numerically singular.
pub fn invert_in_place(m: &mut [Cf32], n: usize) -> bool {
    debug_assert_eq!(m.len(), n * n);
    let mut inv: Vec<Cf32> = vec![Cf32::new(0.0, 0.0); n * n];
    for i in 0..n {
        inv[i * n + i] = Cf32::new(1.0, 0.0);
    }
    for col in 0..n {
        // Partial pivot on the largest remaining magnitude.
        let pivot_row = (col..n)
            .max_by(|&a, &b| {
                m[a * n + col]
                    .norm_sqr()
                    .partial_cmp(&m[b * n + col].norm_sqr())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(col);
        if m[pivot_row * n + col].norm_sqr() < 1e-12 {
            return false;
        }
        if pivot_row != col {
            for k in 0..n {
                m.swap(col * n + k, pivot_row * n + k);
                inv.swap(col * n + k, pivot_row * n + k);
            }
        }
        let pivot = m[col * n + col];
        let pivot_inv = pivot.inv();
        for k in 0..n {
            m[col * n + k] *= pivot_inv;
            inv[col * n + k] *= pivot_inv;
        }
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = m[row * n + col];
            if factor.norm_sqr() == 0.0 {
                continue;
            }
            for k in 0..n {
                let sub_m = factor * m[col * n + k];
                let sub_i = factor * inv[col * n + k];
                m[row * n + k] -= sub_m;
                inv[row * n + k] -= sub_i;
            }
        }
    }
    m.copy_from_slice(&inv);
    true
}

/// Zero-forcing receiver for one subcarrier group: given the estimated
/// channel `G` (`A × U`, column-major by UE), compute the pseudo-inverse
/// `W = (GᴴG)⁻¹Gᴴ` (`U × A`, row-major by UE). Returns false and zeroes
/// `w` when the Gram matrix is singular.
pub fn zero_forcing(g: &[Cf32], ants: usize, ues: usize, w: &mut [Cf32]) -> bool {
    debug_assert_eq!(g.len(), ants * ues);
    debug_assert_eq!(w.len(), ues * ants);
    // Gram matrix GᴴG, row-major U × U.
    let mut gram = vec![Cf32::new(0.0, 0.0); ues * ues];
    for i in 0..ues {
        for j in 0..ues {
            let mut acc = Cf32::new(0.0, 0.0);
            for a in 0..ants {
                acc += g[i * ants + a].conj() * g[j * ants + a];
            }
            gram[i * ues + j] = acc;
        }
    }
    if !invert_in_place(&mut gram, ues) {
        w.fill(Cf32::new(0.0, 0.0));
        return false;
    }
    // W = gram⁻¹ Gᴴ.
    for u in 0..ues {
        for a in 0..ants {
            let mut acc = Cf32::new(0.0, 0.0);
            for k in 0..ues {
                acc += gram[u * ues + k] * g[k * ants + a].conj();
            }
            w[u * ants + a] = acc;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qpsk_roundtrip() {
        for b0 in 0..2u8 {
            for b1 in 0..2u8 {
                let x = qam_modulate(&[b0, b1], 2);
                let mut llrs = [0i8; 2];
                qam_llrs(x, 2, &mut llrs);
                assert_eq!(hard_decision(llrs[0]), b0);
                assert_eq!(hard_decision(llrs[1]), b1);
            }
        }
    }

    #[test]
    fn test_16qam_sign_bits_roundtrip() {
        for bits in 0..16u8 {
            let b = [bits >> 3 & 1, bits >> 2 & 1, bits >> 1 & 1, bits & 1];
            let x = qam_modulate(&b, 4);
            let mut llrs = [0i8; 4];
            qam_llrs(x, 4, &mut llrs);
            for (i, &bit) in b.iter().enumerate() {
                assert_eq!(hard_decision(llrs[i]), bit, "bit {i} of pattern {bits:04b}");
            }
        }
    }

    #[test]
    fn test_constellation_unit_power() {
        let pts: Vec<Cf32> = (0..16u8)
            .map(|bits| qam_modulate(&[bits >> 3 & 1, bits >> 2 & 1, bits >> 1 & 1, bits & 1], 4))
            .collect();
        let avg: f32 = pts.iter().map(|p| p.norm_sqr()).sum::<f32>() / pts.len() as f32;
        assert!((avg - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_pilot_sequence_deterministic_and_unit_power() {
        let a = pilot_sequence(48);
        let b = pilot_sequence(48);
        assert_eq!(a, b);
        for p in &a {
            assert!((p.norm_sqr() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_invert_identity_scaled() {
        let n = 3;
        let mut m = vec![Cf32::new(0.0, 0.0); n * n];
        for i in 0..n {
            m[i * n + i] = Cf32::new(2.0, 0.0);
        }
        assert!(invert_in_place(&mut m, n));
        for i in 0..n {
            for j in 0..n {
                let expected = if i == j { 0.5 } else { 0.0 };
                assert!((m[i * n + j].re - expected).abs() < 1e-6);
                assert!(m[i * n + j].im.abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_singular_matrix_rejected() {
        let mut m = vec![Cf32::new(0.0, 0.0); 4];
        m[0] = Cf32::new(1.0, 0.0);
        m[1] = Cf32::new(2.0, 0.0);
        m[2] = Cf32::new(2.0, 0.0);
        m[3] = Cf32::new(4.0, 0.0);
        assert!(!invert_in_place(&mut m, 2));
    }

    #[test]
    fn test_zero_forcing_inverts_channel() {
        // A=4, U=2, complex off-diagonal channel.
        let ants = 4;
        let ues = 2;
        let mut g = vec![Cf32::new(0.0, 0.0); ants * ues];
        g[0] = Cf32::new(1.0, 0.2);
        g[1] = Cf32::new(0.1, -0.3);
        g[2] = Cf32::new(-0.4, 0.9);
        g[3] = Cf32::new(0.5, 0.0);
        g[ants] = Cf32::new(0.3, -0.1);
        g[ants + 1] = Cf32::new(1.1, 0.4);
        g[ants + 2] = Cf32::new(0.0, -0.8);
        g[ants + 3] = Cf32::new(-0.2, 0.6);
        let mut w = vec![Cf32::new(0.0, 0.0); ues * ants];
        assert!(zero_forcing(&g, ants, ues, &mut w));
        // W · G must be (numerically) the identity.
        for i in 0..ues {
            for j in 0..ues {
                let mut acc = Cf32::new(0.0, 0.0);
                for a in 0..ants {
                    acc += w[i * ants + a] * g[j * ants + a];
                }
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!(
                    (acc.re - expected).abs() < 1e-4 && acc.im.abs() < 1e-4,
                    "W·G[{i}][{j}] = {acc}"
                );
            }
        }
    }
}
