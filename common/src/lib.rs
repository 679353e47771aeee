//! Common Types for the Uplink Baseband Cluster
//!
//! Defines the value types, shard arithmetic and timing utilities shared by
//! every crate in the workspace.

pub mod config;
pub mod types;
pub mod utils;

pub use config::{ConfigError, ServerShards, ShardMap, SystemConfig};
pub use types::Shard;
