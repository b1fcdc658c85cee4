//! Snowdrift CLI: run configured pipelines over object-storage exports.

use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use snowdrift::{CliArgs, Config, cancel_on_signal, init_metrics, init_tracing, run_pipelines};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let args = CliArgs::parse();

    let paths = args.config_paths();
    if paths.is_empty() {
        eprintln!("Error: no config files or directories specified");
        return ExitCode::FAILURE;
    }

    info!("Loading config from {} source(s)", paths.len());

    let config = match Config::from_paths(&paths) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    for (name, pipeline) in &config.pipelines {
        if args.selects(name) {
            info!(
                "  Pipeline: {} ({} sources from {} -> {} sinks)",
                name,
                pipeline.input.sources.len(),
                pipeline.input.url,
                pipeline.output.sinks.len()
            );
        }
    }

    if let Err(e) = init_metrics(&config.metrics.address) {
        eprintln!("Failed to start metrics server: {e}");
        return ExitCode::FAILURE;
    }

    let shutdown = CancellationToken::new();
    let watcher = cancel_on_signal(shutdown.clone());

    let failed = run_pipelines(&config, |name| args.selects(name), shutdown.clone()).await;
    shutdown.cancel();
    let _ = watcher.await;

    if failed == 0 {
        info!("All pipelines complete");
        ExitCode::SUCCESS
    } else {
        eprintln!("{failed} pipeline(s) failed");
        ExitCode::FAILURE
    }
}
