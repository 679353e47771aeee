//! YAML Configuration
//!
//! The on-disk configuration format of a baseband server, parsed with
//! serde and converted into the validated `SystemConfig` the engine runs
//! on.

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use common::config::PeerConfig;
use common::SystemConfig;

/// Top-level YAML document.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BbuConfig {
    pub radio: RadioConfig,
    pub run: RunConfig,
    pub workers: WorkerConfig,
    #[serde(default)]
    pub cores: CoreConfig,
    pub net: NetConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Radio dimensions of the cell.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RadioConfig {
    pub bs_ant_num: usize,
    pub ue_num: usize,
    pub ofdm_ca_num: usize,
    pub ofdm_data_num: usize,
    pub ofdm_data_start: usize,
    pub symbol_num_perframe: usize,
    pub ul_pilot_syms: usize,
    #[serde(default = "default_mod_order_bits")]
    pub mod_order_bits: usize,
}

fn default_mod_order_bits() -> usize {
    2
}

/// Run control.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    pub frames_to_test: usize,
    pub frame_window: usize,
    #[serde(default = "default_demul_block_size")]
    pub demul_block_size: usize,
    #[serde(default = "default_stats_warmup_frames")]
    pub stats_warmup_frames: usize,
}

fn default_demul_block_size() -> usize {
    48
}

fn default_stats_warmup_frames() -> usize {
    200
}

/// Worker pool sizes, one entry per server, plus this server's global
/// thread id offsets.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    pub num_fft_workers: Vec<usize>,
    pub num_zf_workers: Vec<usize>,
    pub num_demul_workers: Vec<usize>,
    pub num_decode_workers: Vec<usize>,
    pub fft_thread_offset: usize,
    pub zf_thread_offset: usize,
    pub demul_thread_offset: usize,
    pub decode_thread_offset: usize,
}

/// Core pinning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub core_offset: usize,
    #[serde(default = "default_true")]
    pub use_hyperthreading: bool,
    #[serde(default = "default_phy_core_num")]
    pub phy_core_num: usize,
}

fn default_true() -> bool {
    true
}

fn default_phy_core_num() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            core_offset: 0,
            use_hyperthreading: true,
            phy_core_num: default_phy_core_num(),
        }
    }
}

/// Cluster networking.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetConfig {
    pub server_idx: usize,
    pub rru_addr: String,
    #[serde(default = "default_io_threads")]
    pub rx_thread_num: usize,
    #[serde(default = "default_io_threads")]
    pub tx_thread_num: usize,
    pub servers: Vec<ServerEntry>,
}

fn default_io_threads() -> usize {
    1
}

/// One server of the cluster.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerEntry {
    pub addr: String,
    pub rx_port_base: u16,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct LogConfig {
    /// Default tracing filter, overridable with `--log-level`.
    pub level: Option<String>,
}

impl BbuConfig {
    /// Load the configuration from a YAML file.
    pub fn from_yaml_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: BbuConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Convert into the engine's plain configuration. Address parsing
    /// happens here; structural validation happens in
    /// `SystemConfig::validate`.
    pub fn to_system_config(&self) -> anyhow::Result<SystemConfig> {
        let rru_addr: SocketAddr = self
            .net
            .rru_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid rru_addr {}: {e}", self.net.rru_addr))?;
        let mut servers = Vec::with_capacity(self.net.servers.len());
        for entry in &self.net.servers {
            let addr: IpAddr = entry
                .addr
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid server addr {}: {e}", entry.addr))?;
            servers.push(PeerConfig {
                addr,
                rx_port_base: entry.rx_port_base,
            });
        }
        Ok(SystemConfig {
            bs_ant_num: self.radio.bs_ant_num,
            ue_num: self.radio.ue_num,
            ofdm_ca_num: self.radio.ofdm_ca_num,
            ofdm_data_num: self.radio.ofdm_data_num,
            ofdm_data_start: self.radio.ofdm_data_start,
            symbol_num_perframe: self.radio.symbol_num_perframe,
            ul_pilot_syms: self.radio.ul_pilot_syms,
            mod_order_bits: self.radio.mod_order_bits,
            frames_to_test: self.run.frames_to_test,
            frame_window: self.run.frame_window,
            demul_block_size: self.run.demul_block_size,
            stats_warmup_frames: self.run.stats_warmup_frames,
            num_fft_workers: self.workers.num_fft_workers.clone(),
            num_zf_workers: self.workers.num_zf_workers.clone(),
            num_demul_workers: self.workers.num_demul_workers.clone(),
            num_decode_workers: self.workers.num_decode_workers.clone(),
            fft_thread_offset: self.workers.fft_thread_offset,
            zf_thread_offset: self.workers.zf_thread_offset,
            demul_thread_offset: self.workers.demul_thread_offset,
            decode_thread_offset: self.workers.decode_thread_offset,
            core_offset: self.cores.core_offset,
            use_hyperthreading: self.cores.use_hyperthreading,
            phy_core_num: self.cores.phy_core_num,
            server_idx: self.net.server_idx,
            rru_addr,
            rx_thread_num: self.net.rx_thread_num,
            tx_thread_num: self.net.tx_thread_num,
            servers,
        })
    }
}
