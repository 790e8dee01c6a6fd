use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use lfs_bridge::cli::Cli;
use lfs_bridge::engine::Engine;
use lfs_bridge::telemetry::logging;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("lfs-bridge: failed to start runtime: {err}");
            return ExitCode::FAILURE;
        }
    };
    let result = runtime.block_on(run(cli));
    // A blocking stdin read cannot be cancelled, so do not wait for it.
    runtime.shutdown_background();
    logging::shutdown();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("lfs-bridge: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.to_config().context("invalid configuration")?;
    logging::init(&config.logging).context("failed to initialize logging")?;
    tracing::debug!(
        target: "lfs_bridge::main",
        backend = ?config.backend,
        download_dir = %config.engine.download_dir.display(),
        "starting transfer agent"
    );

    let backend = config.backend.build();
    let status = Arc::new(config.status_publisher());
    let mut engine = Engine::new(backend, status, config.engine.clone());
    engine
        .run(tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("transfer session failed")?;
    Ok(())
}
