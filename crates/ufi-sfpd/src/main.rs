//! Transceiver hot-plug monitor daemon
//!
//! Loads the board configuration, seeds the port registry from hardware and
//! then services the transceiver interrupt line until the process is killed.

use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use ufi_i2c_common::{LockBroker, SharedBus, SmbusProvider};
use ufi_sfpd::{
    Board, DEFAULT_CONFIG_PATH, HotplugMonitor, InterruptLine, LogSupervisor, PollWaitSet,
    PortController, SfpdConfig,
};

/// UFI transceiver hot-plug monitor
#[derive(Parser, Debug)]
#[command(name = "sfpd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error), overrides the config file
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("sfpd: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    if args.print_config {
        return match config.to_toml() {
            Ok(toml) => {
                print!("{}", toml);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("sfpd: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    init_logging(args.log_level.as_deref().unwrap_or(&config.logging.level));
    info!(config = %args.config.display(), "sfpd: Starting transceiver hot-plug monitor");

    match run(&config) {
        Ok(never) => match never {},
        Err(e) => {
            error!(error = %format!("{:#}", e), "sfpd: Monitor exiting with error");
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: &Path) -> Result<SfpdConfig> {
    let config = SfpdConfig::load_or_default(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// RUST_LOG takes precedence over `level`.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).compact())
        .init();
}

fn run(config: &SfpdConfig) -> Result<Infallible> {
    let board =
        Board::from_config(config.bus.id, &config.topology).context("Invalid board topology")?;
    let provider = SmbusProvider::new(config.bus.device_dir.clone()).with_force(config.bus.force);
    let lock = LockBroker::new(config.lock.path.clone()).with_policy(config.lock_policy());
    let bus = SharedBus::new(provider, board.tree().clone(), lock);
    info!(
        bus = config.bus.id,
        lock = %config.lock.path.display(),
        ports = board.ports().len(),
        "sfpd: Board initialized"
    );

    let line = InterruptLine::open(
        &config.interrupt.path,
        config.interrupt.rearm_token.as_bytes(),
    )
    .context("Failed to open interrupt line")?;
    let mut waits = PollWaitSet::new(&line);

    let mut monitor = HotplugMonitor::new(PortController::new(bus, board), LogSupervisor);
    let never = monitor.run(&mut waits).context("Hot-plug monitor stopped")?;
    Ok(never)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["sfpd"]).unwrap();
        assert_eq!(args.config, PathBuf::from("/etc/ufi/sfpd.conf"));
        assert_eq!(args.log_level, None);
        assert!(!args.print_config);
    }

    #[test]
    fn test_args_overrides() {
        let args =
            Args::try_parse_from(["sfpd", "-c", "/tmp/sfpd.conf", "-l", "debug", "--print-config"])
                .unwrap();
        assert_eq!(args.config, PathBuf::from("/tmp/sfpd.conf"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.print_config);
    }

    #[test]
    fn test_load_config_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sfpd.conf");
        std::fs::write(&path, "[lock]\nretry_interval_ms = 0\n").unwrap();
        assert!(load_config(&path).is_err());
    }
}
