//! Fundamental value types
//!
//! Small copyable types used throughout the pipeline: axis shards, thread
//! roles and IQ sample aliases.

use num_complex::Complex;
use serde::{Deserialize, Serialize};

/// A complex time- or frequency-domain sample as carried on the wire.
pub type IqSample = Complex<i16>;

/// A complex baseband coefficient used by the DSP kernels.
pub type Cf32 = Complex<f32>;

/// Half-open index range `[start, end)` over one axis (antennas,
/// subcarriers or UEs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub start: usize,
    pub end: usize,
}

impl Shard {
    pub fn new(start: usize, end: usize) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, idx: usize) -> bool {
        idx >= self.start && idx < self.end
    }

    /// Intersection with another shard; disjoint shards collapse to an
    /// empty range.
    pub fn intersect(&self, other: &Shard) -> Shard {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end).max(start);
        Shard { start, end }
    }
}

/// Role of a pinned thread, used for core assignment and statistics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadRole {
    Master,
    Rx,
    Tx,
    WorkerFft,
    WorkerZf,
    WorkerDemul,
    WorkerDecode,
}

impl ThreadRole {
    pub fn label(&self) -> &'static str {
        match self {
            ThreadRole::Master => "Master",
            ThreadRole::Rx => "RX",
            ThreadRole::Tx => "TX",
            ThreadRole::WorkerFft => "FFT",
            ThreadRole::WorkerZf => "ZF",
            ThreadRole::WorkerDemul => "Demul",
            ThreadRole::WorkerDecode => "Decode",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_basics() {
        let s = Shard::new(3, 7);
        assert_eq!(s.len(), 4);
        assert!(s.contains(3));
        assert!(!s.contains(7));
        assert!(!s.is_empty());
        assert!(Shard::new(5, 5).is_empty());
    }

    #[test]
    fn test_shard_intersect() {
        let a = Shard::new(0, 10);
        let b = Shard::new(6, 14);
        assert_eq!(a.intersect(&b), Shard::new(6, 10));
        let c = Shard::new(12, 20);
        assert!(a.intersect(&c).is_empty());
    }
}
