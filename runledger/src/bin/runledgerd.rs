//! `runledgerd`: runs the liveness supervisor and the interrupt drain for a
//! ledger, or performs one maintenance pass and exits.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use runledger::logging::init_logging;
use runledger::{LedgerConfig, LedgerRuntimeBuilder};

/// Exit status after a confirmed drain, as for a shell interrupted by SIGINT.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "runledgerd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run one liveness sweep, print the report and exit.
    #[arg(long)]
    sweep_once: bool,

    /// Delete terminal jobs past the retention age and exit.
    #[arg(long)]
    purge: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %err, "runledgerd failed");
            eprintln!("runledgerd: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let mut config = match &args.config {
        Some(path) => LedgerConfig::from_file(path)?,
        None => LedgerConfig::default(),
    };
    config.apply_env_overrides();
    init_logging(&config.logging)?;

    let runtime = LedgerRuntimeBuilder::new(config).build().await?;

    if args.sweep_once || args.purge {
        if args.sweep_once {
            let report = runtime.sweep_once().await?;
            println!(
                "watched={} alive={} stale={} reaped={} skipped={} errors={}",
                report.watched,
                report.alive,
                report.stale.len(),
                report.reaped.len(),
                report.skipped,
                report.errors
            );
        }
        if args.purge {
            let purged = runtime.purge_expired().await?;
            println!("purged={purged}");
        }
        runtime.stop().await;
        return Ok(ExitCode::SUCCESS);
    }

    runtime.start();
    tracing::info!("runledgerd running; press Ctrl-C to drain");
    runtime.wait_for_shutdown().await;
    runtime.stop().await;
    Ok(ExitCode::from(EXIT_INTERRUPTED))
}
