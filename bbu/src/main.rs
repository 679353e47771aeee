//! Baseband Unit Server
//!
//! Entry point of one server of the distributed uplink baseband cluster:
//! loads the YAML configuration, wires up the pipeline engine and maps
//! the outcome onto the process exit code.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use baseband::controller::install_signal_handler;
use baseband::Controller;

mod config;
use config::BbuConfig;

/// Massive-MIMO uplink baseband server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to YAML configuration file
    #[arg(short, long)]
    config: String,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match BbuConfig::from_yaml_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load {}: {e}", args.config);
            return ExitCode::from(2);
        }
    };

    let level = args
        .log_level
        .clone()
        .or_else(|| config.log.level.clone())
        .unwrap_or_else(|| "info".to_string());
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    match run(&args, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunFailure::Config(e)) => {
            error!("configuration rejected: {e}");
            ExitCode::from(2)
        }
        Err(RunFailure::Pipeline(e)) => {
            error!("run failed: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

enum RunFailure {
    Config(anyhow::Error),
    Pipeline(baseband::PipelineError),
}

fn run(args: &Args, config: BbuConfig) -> Result<(), RunFailure> {
    info!("configuration loaded from {}", args.config);
    let sys = config.to_system_config().map_err(RunFailure::Config)?;
    info!(
        "server {} of {}: {} antennas, {} UEs, {} subcarriers, {} symbols ({} pilot), window {}",
        sys.server_idx,
        sys.servers.len(),
        sys.bs_ant_num,
        sys.ue_num,
        sys.ofdm_data_num,
        sys.symbol_num_perframe,
        sys.ul_pilot_syms,
        sys.frame_window,
    );

    install_signal_handler();
    let controller = Controller::new(sys).map_err(RunFailure::Pipeline)?;
    let report = controller.run().map_err(RunFailure::Pipeline)?;
    report.print();
    Ok(())
}
