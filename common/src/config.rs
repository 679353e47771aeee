//! System Configuration
//!
//! The validated, plain configuration object handed to every thread in the
//! process, plus the static cluster shard map derived from it. YAML parsing
//! lives in the server binary; by the time a `SystemConfig` exists here it
//! is structurally sound.

use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

use crate::types::Shard;
use crate::utils::worker_shard;

/// Configuration and shard-map errors raised before any thread is spawned.
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("shard map invalid: {0}")]
    ShardMapInvalid(String),

    #[error("invalid option {option}: {reason}")]
    InvalidOption {
        option: &'static str,
        reason: String,
    },
}

/// One peer server in the cluster.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub addr: IpAddr,
    /// RX sockets bind `rx_port_base .. rx_port_base + rx_thread_num`.
    pub rx_port_base: u16,
}

/// Per-server axis ownership derived from the worker-count prefix sums.
#[derive(Debug, Clone)]
pub struct ServerShards {
    /// Antennas this server receives from the RRU (FFT input).
    pub ant: Shard,
    /// Subcarriers this server's ZF workers compute.
    pub sc_zf: Shard,
    /// Subcarriers this server's demul workers equalize.
    pub sc_demul: Shard,
    /// Subcarriers this server receives in pilot freq-IQ packets: the ZF
    /// range expanded to whole UE-groups.
    pub sc_pilot: Shard,
    /// UEs this server decodes.
    pub ue: Shard,
}

/// The static cluster shard map. Tiles every axis without gaps or
/// overlaps; validated at startup.
#[derive(Debug, Clone)]
pub struct ShardMap {
    pub servers: Vec<ServerShards>,
}

impl ShardMap {
    /// Server owning a given subcarrier for demodulation.
    pub fn demul_owner(&self, sc: usize) -> Option<usize> {
        self.servers.iter().position(|s| s.sc_demul.contains(sc))
    }

    /// Server decoding a given UE.
    pub fn ue_owner(&self, ue: usize) -> Option<usize> {
        self.servers.iter().position(|s| s.ue.contains(ue))
    }
}

/// Process-wide run configuration. All dimensions are fixed for the run;
/// buffers and counters are sized from this once at startup.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    // Radio dimensions.
    pub bs_ant_num: usize,
    pub ue_num: usize,
    /// FFT size: samples per time-domain symbol.
    pub ofdm_ca_num: usize,
    /// Usable data subcarriers per symbol.
    pub ofdm_data_num: usize,
    /// First usable subcarrier within the FFT output.
    pub ofdm_data_start: usize,
    pub symbol_num_perframe: usize,
    /// Prefix count of pilot symbols; the rest carry uplink data.
    pub ul_pilot_syms: usize,
    /// Soft bits per subcarrier per UE (2 = QPSK, 4 = 16-QAM).
    pub mod_order_bits: usize,

    // Run control.
    pub frames_to_test: usize,
    /// Sliding frame window depth (slot count).
    pub frame_window: usize,
    /// Subcarrier block granularity for the demul workers.
    pub demul_block_size: usize,
    /// Statistics clocks start at this frame to skip startup transients.
    pub stats_warmup_frames: usize,

    // Worker topology: one entry per server.
    pub num_fft_workers: Vec<usize>,
    pub num_zf_workers: Vec<usize>,
    pub num_demul_workers: Vec<usize>,
    pub num_decode_workers: Vec<usize>,
    /// Base global worker id per stage on this server.
    pub fft_thread_offset: usize,
    pub zf_thread_offset: usize,
    pub demul_thread_offset: usize,
    pub decode_thread_offset: usize,

    // Core pinning.
    pub core_offset: usize,
    pub use_hyperthreading: bool,
    pub phy_core_num: usize,

    // Cluster networking.
    pub server_idx: usize,
    pub rru_addr: SocketAddr,
    pub rx_thread_num: usize,
    pub tx_thread_num: usize,
    pub servers: Vec<PeerConfig>,
}

impl SystemConfig {
    pub fn ul_data_symbol_num(&self) -> usize {
        self.symbol_num_perframe - self.ul_pilot_syms
    }

    pub fn total_fft_workers(&self) -> usize {
        self.num_fft_workers.iter().sum()
    }

    pub fn total_zf_workers(&self) -> usize {
        self.num_zf_workers.iter().sum()
    }

    pub fn total_demul_workers(&self) -> usize {
        self.num_demul_workers.iter().sum()
    }

    pub fn local_fft_workers(&self) -> usize {
        self.num_fft_workers[self.server_idx]
    }

    pub fn local_zf_workers(&self) -> usize {
        self.num_zf_workers[self.server_idx]
    }

    pub fn local_demul_workers(&self) -> usize {
        self.num_demul_workers[self.server_idx]
    }

    pub fn local_decode_workers(&self) -> usize {
        self.num_decode_workers[self.server_idx]
    }

    /// Decoded payload bytes per (symbol, UE) after hard decision.
    pub fn decoded_bytes_per_symbol(&self) -> usize {
        (self.ofdm_data_num * self.mod_order_bits).div_ceil(8)
    }

    /// Derive the cluster shard map from the worker-count prefix sums.
    pub fn shard_map(&self) -> ShardMap {
        let n = self.servers.len();
        let mut servers = Vec::with_capacity(n);
        let mut fft_off = 0;
        let mut zf_off = 0;
        let mut demul_off = 0;
        for i in 0..n {
            let ant = span(
                self.bs_ant_num,
                self.total_fft_workers(),
                fft_off,
                self.num_fft_workers[i],
            );
            let sc_zf = span(
                self.ofdm_data_num,
                self.total_zf_workers(),
                zf_off,
                self.num_zf_workers[i],
            );
            let sc_demul = span(
                self.ofdm_data_num,
                self.total_demul_workers(),
                demul_off,
                self.num_demul_workers[i],
            );
            let ue = worker_shard(self.ue_num, n, i);
            servers.push(ServerShards {
                ant,
                sc_zf,
                sc_demul,
                sc_pilot: self.group_aligned(sc_zf),
                ue,
            });
            fft_off += self.num_fft_workers[i];
            zf_off += self.num_zf_workers[i];
            demul_off += self.num_demul_workers[i];
        }
        ShardMap { servers }
    }

    /// This server's shard on every axis.
    pub fn local_shards(&self) -> ServerShards {
        self.shard_map().servers[self.server_idx].clone()
    }

    /// Expand a subcarrier shard to whole UE-groups, clamped to the usable
    /// band. Channel estimation works on groups of `ue_num` subcarriers, so
    /// pilot data and ZF matrices are exchanged at group granularity even
    /// when a server boundary cuts through a group.
    pub fn group_aligned(&self, shard: Shard) -> Shard {
        Shard::new(
            crate::utils::align_down(shard.start, self.ue_num),
            crate::utils::align_up(shard.end, self.ue_num).min(self.ofdm_data_num),
        )
    }

    /// Subcarriers a server receives in pilot freq-IQ packets: its ZF
    /// range expanded to whole groups.
    pub fn pilot_sc_shard(&self, server: usize) -> Shard {
        self.shard_map().servers[server].sc_pilot
    }

    /// Group span a server needs ZF matrices for: its demul range expanded
    /// to whole groups.
    pub fn demul_group_span(&self, server: usize) -> Shard {
        self.group_aligned(self.shard_map().servers[server].sc_demul)
    }

    /// Validate dimensions, worker topology and the derived shard map.
    /// Rejecting here aborts the process before any thread is spawned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |option: &'static str, reason: String| {
            Err(ConfigError::InvalidOption { option, reason })
        };
        if self.bs_ant_num == 0 || self.ue_num == 0 {
            return invalid("bs_ant_num/ue_num", "must be non-zero".into());
        }
        if self.ue_num > self.bs_ant_num {
            return invalid(
                "ue_num",
                format!(
                    "{} users exceed {} antennas; zero-forcing needs ue_num <= bs_ant_num",
                    self.ue_num, self.bs_ant_num
                ),
            );
        }
        if self.ofdm_data_start + self.ofdm_data_num > self.ofdm_ca_num {
            return invalid(
                "ofdm_data_num",
                format!(
                    "data region [{}, {}) exceeds FFT size {}",
                    self.ofdm_data_start,
                    self.ofdm_data_start + self.ofdm_data_num,
                    self.ofdm_ca_num
                ),
            );
        }
        if self.ul_pilot_syms == 0 || self.ul_pilot_syms >= self.symbol_num_perframe {
            return invalid(
                "ul_pilot_syms",
                "need at least one pilot and one data symbol per frame".into(),
            );
        }
        if !matches!(self.mod_order_bits, 2 | 4) {
            return invalid("mod_order_bits", "supported orders are 2 (QPSK) and 4 (16-QAM)".into());
        }
        if self.frame_window == 0 || self.frames_to_test == 0 {
            return invalid("frame_window/frames_to_test", "must be non-zero".into());
        }
        if self.demul_block_size == 0 {
            return invalid("demul_block_size", "must be non-zero".into());
        }
        if self.rx_thread_num == 0 || self.tx_thread_num == 0 {
            return invalid("rx_thread_num/tx_thread_num", "must be non-zero".into());
        }

        let n = self.servers.len();
        if n == 0 {
            return Err(ConfigError::ShardMapInvalid("no servers configured".into()));
        }
        if self.server_idx >= n {
            return Err(ConfigError::ShardMapInvalid(format!(
                "server_idx {} out of range for {} servers",
                self.server_idx, n
            )));
        }
        for (name, counts) in [
            ("num_fft_workers", &self.num_fft_workers),
            ("num_zf_workers", &self.num_zf_workers),
            ("num_demul_workers", &self.num_demul_workers),
            ("num_decode_workers", &self.num_decode_workers),
        ] {
            if counts.len() != n {
                return Err(ConfigError::ShardMapInvalid(format!(
                    "{name} has {} entries for {} servers",
                    counts.len(),
                    n
                )));
            }
            if counts.iter().any(|&c| c == 0) {
                return Err(ConfigError::ShardMapInvalid(format!(
                    "{name} contains a zero worker count"
                )));
            }
        }
        // Declared thread offsets must agree with the per-server prefix sums.
        for (name, declared, counts) in [
            ("fft_thread_offset", self.fft_thread_offset, &self.num_fft_workers),
            ("zf_thread_offset", self.zf_thread_offset, &self.num_zf_workers),
            (
                "demul_thread_offset",
                self.demul_thread_offset,
                &self.num_demul_workers,
            ),
            (
                "decode_thread_offset",
                self.decode_thread_offset,
                &self.num_decode_workers,
            ),
        ] {
            let expected: usize = counts[..self.server_idx].iter().sum();
            if declared != expected {
                return Err(ConfigError::ShardMapInvalid(format!(
                    "{name} is {declared}, prefix sum of worker counts is {expected}"
                )));
            }
        }
        // Decode strides its (symbol, UE) pairs by the demul worker count
        // on the same server; the pairs tile exactly only when the two
        // pools are the same size.
        for i in 0..n {
            if self.num_decode_workers[i] != self.num_demul_workers[i] {
                return Err(ConfigError::ShardMapInvalid(format!(
                    "server {i} has {} decode workers but {} demul workers; the decode stride \
                     couples the two pools",
                    self.num_decode_workers[i], self.num_demul_workers[i]
                )));
            }
        }
        if self.ue_num < n {
            return Err(ConfigError::ShardMapInvalid(format!(
                "{} servers cannot each own a UE range out of {} users",
                n, self.ue_num
            )));
        }
        for (name, total, dim) in [
            ("FFT", self.total_fft_workers(), self.bs_ant_num),
            ("ZF", self.total_zf_workers(), self.ofdm_data_num),
            ("demul", self.total_demul_workers(), self.ofdm_data_num),
        ] {
            if total > dim {
                return Err(ConfigError::ShardMapInvalid(format!(
                    "{total} {name} workers over a dimension of {dim} leaves empty server shards"
                )));
            }
        }

        // The derived map must tile each axis exactly.
        let map = self.shard_map();
        for (i, s) in map.servers.iter().enumerate() {
            let pairs = self.ul_data_symbol_num() * s.ue.len();
            if self.num_decode_workers[i] > pairs {
                return Err(ConfigError::ShardMapInvalid(format!(
                    "server {i} has {} decode workers for {} (symbol, UE) pairs per frame",
                    self.num_decode_workers[i], pairs
                )));
            }
        }
        for (axis, dim, get) in [
            ("antenna", self.bs_ant_num, 0usize),
            ("zf subcarrier", self.ofdm_data_num, 1),
            ("demul subcarrier", self.ofdm_data_num, 2),
            ("ue", self.ue_num, 3),
        ] {
            let mut cursor = 0;
            for s in &map.servers {
                let shard = match get {
                    0 => s.ant,
                    1 => s.sc_zf,
                    2 => s.sc_demul,
                    _ => s.ue,
                };
                if shard.start != cursor {
                    return Err(ConfigError::ShardMapInvalid(format!(
                        "{axis} axis has a gap or overlap at {cursor}"
                    )));
                }
                cursor = shard.end;
            }
            if cursor != dim {
                return Err(ConfigError::ShardMapInvalid(format!(
                    "{axis} axis tiles {cursor} of {dim}"
                )));
            }
        }
        Ok(())
    }
}

/// Union of the worker shards `[offset, offset + count)` over a dimension
/// partitioned across `total` workers.
fn span(dim: usize, total: usize, offset: usize, count: usize) -> Shard {
    Shard::new(offset * dim / total, (offset + count) * dim / total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_server_config() -> SystemConfig {
        SystemConfig {
            bs_ant_num: 64,
            ue_num: 16,
            ofdm_ca_num: 2048,
            ofdm_data_num: 1200,
            ofdm_data_start: 424,
            symbol_num_perframe: 10,
            ul_pilot_syms: 2,
            mod_order_bits: 2,
            frames_to_test: 1000,
            frame_window: 40,
            demul_block_size: 48,
            stats_warmup_frames: 200,
            num_fft_workers: vec![2, 2],
            num_zf_workers: vec![2, 2],
            num_demul_workers: vec![2, 2],
            num_decode_workers: vec![2, 2],
            fft_thread_offset: 0,
            zf_thread_offset: 0,
            demul_thread_offset: 0,
            decode_thread_offset: 0,
            core_offset: 0,
            use_hyperthreading: true,
            phy_core_num: 16,
            server_idx: 0,
            rru_addr: "127.0.0.1:7891".parse().unwrap(),
            rx_thread_num: 1,
            tx_thread_num: 1,
            servers: vec![
                PeerConfig {
                    addr: "127.0.0.1".parse().unwrap(),
                    rx_port_base: 8100,
                },
                PeerConfig {
                    addr: "127.0.0.1".parse().unwrap(),
                    rx_port_base: 8200,
                },
            ],
        }
    }

    #[test]
    fn test_valid_config() {
        two_server_config().validate().unwrap();
    }

    #[test]
    fn test_shard_map_tiles() {
        let cfg = two_server_config();
        let map = cfg.shard_map();
        assert_eq!(map.servers[0].ant, Shard::new(0, 32));
        assert_eq!(map.servers[1].ant, Shard::new(32, 64));
        assert_eq!(map.servers[0].sc_demul, Shard::new(0, 600));
        assert_eq!(map.servers[1].sc_demul, Shard::new(600, 1200));
        assert_eq!(map.servers[0].ue, Shard::new(0, 8));
        assert_eq!(map.servers[1].ue, Shard::new(8, 16));
        assert_eq!(map.demul_owner(599), Some(0));
        assert_eq!(map.demul_owner(600), Some(1));
        assert_eq!(map.ue_owner(15), Some(1));
    }

    #[test]
    fn test_pilot_shards_cover_boundary_groups() {
        // The server boundary at subcarrier 600 cuts through a 16-wide
        // group; both neighbors receive the whole group in pilots.
        let cfg = two_server_config();
        let map = cfg.shard_map();
        assert_eq!(map.servers[0].sc_pilot, Shard::new(0, 608));
        assert_eq!(map.servers[1].sc_pilot, Shard::new(592, 1200));
    }

    #[test]
    fn test_offset_mismatch_rejected() {
        let mut cfg = two_server_config();
        cfg.server_idx = 1;
        cfg.fft_thread_offset = 0; // prefix sum for server 1 is 2
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, ConfigError::ShardMapInvalid(_)));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut cfg = two_server_config();
        cfg.num_zf_workers = vec![2, 0];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_data_region_bounds() {
        let mut cfg = two_server_config();
        cfg.ofdm_data_start = 1000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_decoded_bytes_rounds_up() {
        let mut cfg = two_server_config();
        cfg.ofdm_data_num = 1201;
        assert_eq!(cfg.decoded_bytes_per_symbol(), (1201 * 2 + 7) / 8);
    }
}
