//! Uplink Baseband Pipeline Engine
//!
//! The staged, shard-parallel pipeline of one baseband server: frame state
//! tracking, shared artifact buffers, the four stage worker pools, the
//! packet I/O plane and the lifecycle controller. DSP kernels are pure
//! functions over buffer views; everything else is atomics and pinned
//! polling threads.

pub mod buffers;
pub mod controller;
pub mod stages;
pub mod state;
pub mod txrx;
pub mod worker;

use thiserror::Error;

pub use controller::{Controller, RunReport};
pub use state::{FrameTracker, RunFlags};

/// Fatal pipeline errors. Anything that could corrupt the tracker
/// invariants stops the run; parse-level issues are dropped and counted
/// instead.
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    #[error("slot overrun: frame {frame} laps the {window}-frame window at frame {oldest}")]
    SlotOverrun {
        frame: usize,
        oldest: usize,
        window: usize,
    },

    #[error("counter overflow on {counter} for frame {frame}")]
    CounterOverflow { counter: &'static str, frame: usize },

    #[error("tx failed to {dest}: {detail}")]
    TxFailed { dest: String, detail: String },

    #[error("rx nic error: {detail}")]
    RxNicError { detail: String },

    #[error(transparent)]
    Config(#[from] common::ConfigError),
}

impl PipelineError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            PipelineError::Config(_) => 2,
            PipelineError::SlotOverrun { .. } => 3,
            PipelineError::TxFailed { .. } | PipelineError::RxNicError { .. } => 4,
            PipelineError::CounterOverflow { .. } => 5,
        }
    }
}
