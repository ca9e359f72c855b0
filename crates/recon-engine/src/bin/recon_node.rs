//! CLI entry point: loads configuration, installs the Ctrl-C cancellation
//! token, wires up production collaborators, runs the engine, and maps the
//! outcome to an exit code (spec §6, §7).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use recon_engine::config::ConfigOverrides;
use recon_engine::runner::RunnerError;
use recon_engine::{runner, ReconConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod wiring;

#[derive(Parser, Debug)]
#[command(name = "recon-node", about = "Re-executes historical chain state over a block range")]
struct Cli {
    /// Path to a TOML configuration file. Defaults are used for anything
    /// the file omits.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: ConfigOverrides,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(c) => c,
        Err(err) => {
            error!(%err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_for_handler = Arc::clone(&cancel);
    if let Err(err) = ctrlc::set_handler(move || {
        info!("interrupt received, shutting down at the next block boundary");
        cancel_for_handler.store(true, Ordering::Release);
    }) {
        error!(%err, "failed to install signal handler");
        return ExitCode::FAILURE;
    }

    recon_engine::metrics::describe();

    let collaborators = wiring::build(&config);
    let expected_root = wiring::expected_root(&config);

    match runner::run(&config, collaborators, cancel, expected_root) {
        Ok(outcome) => {
            info!(
                output_tx_num = outcome.output_tx_num,
                output_block_num = outcome.output_block_num,
                repeat_count = outcome.repeat_count,
                root_matches = ?outcome.root_matches,
                "run complete"
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(%err, "run failed");
            match err {
                RunnerError::Recon(e) => exit_code_for(&e),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

fn load_config(cli: &Cli) -> Result<ReconConfig, recon_engine::config::ConfigError> {
    let base = match &cli.config {
        Some(path) => ReconConfig::from_file(path)?,
        None => ReconConfig::default(),
    };
    base.apply_overrides(&cli.overrides).validated()
}

/// Exit codes per spec §6/§7: 0 on success or clean interrupt, nonzero on
/// unrecoverable I/O or invariant violation. A [`RunnerError::Recon`]
/// carrying [`recon_types::ReconError::Interrupted`] is not actually
/// reachable from `runner::run` today (shutdown is signalled out-of-band via
/// the cancellation flag, not as an error return), but is handled here so
/// the mapping stays correct if that changes.
fn exit_code_for(err: &recon_types::ReconError) -> ExitCode {
    match err {
        recon_types::ReconError::Interrupted => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    }
}
