use prometheus::Registry;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rust_loadgen::config::{ConfigError, LoadgenConfig};
use rust_loadgen::lifecycle::LifecycleCoordinator;
use rust_loadgen::metrics::{gather_metrics_string, register_metrics, start_metrics_server};
use rust_loadgen::report::{JsonFileSink, LogSink};

const DEFAULT_CONFIG_PATH: &str = "loadgen.json";

/// `RUST_LOG` filters (default `info`); `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// First argument, then `LOADGEN_CONFIG`, then `loadgen.json`.
fn config_path() -> PathBuf {
    env::args()
        .nth(1)
        .or_else(|| env::var("LOADGEN_CONFIG").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

fn load_config(path: &Path) -> Result<LoadgenConfig, ConfigError> {
    if !path.exists() {
        LoadgenConfig::default_template().write_to(path)?;
        eprintln!(
            "No configuration found. A default adaptive profile was written to {}.",
            path.display()
        );
        eprintln!("Edit the target endpoints, then run again.");
        std::process::exit(1);
    }
    LoadgenConfig::from_file(path)
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, stopping"),
        _ = terminate => info!("Received SIGTERM, stopping"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let path = config_path();
    let run_config = match load_config(&path).and_then(|c| c.resolve()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error in {}: {}", path.display(), e);
            std::process::exit(1);
        }
    };

    info!(
        config = %path.display(),
        mode = ?run_config.schedule.mode(),
        endpoints = run_config.selector.endpoints().len(),
        workers = run_config.pool.workers,
        queue_capacity = run_config.pool.queue_capacity,
        "Configuration loaded"
    );
    for (name, probability) in run_config.selector.probabilities() {
        info!(
            endpoint = %name,
            share = %format_args!("{:.1}%", probability * 100.0),
            "Endpoint weight"
        );
    }

    let registry = Registry::new();
    register_metrics(&registry)?;
    let registry_arc = Arc::new(Mutex::new(registry));

    if let Some(port) = run_config.metrics_port {
        let registry = registry_arc.clone();
        tokio::spawn(async move {
            start_metrics_server(port, registry).await;
        });
    }

    let results_file = run_config.results_file.clone();
    let mut coordinator = LifecycleCoordinator::new(run_config).with_sink(LogSink);
    if let Some(results_file) = results_file {
        coordinator = coordinator.with_sink(JsonFileSink::new(results_file));
    }

    // First signal drains, a second one abandons the drain.
    let stop = coordinator.stop_handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        stop.stop();
        shutdown_signal().await;
        stop.stop_now();
    });

    let report = coordinator.run().await?;
    info!(
        end_reason = ?report.end_reason,
        total = report.metrics.total_requests,
        "Run complete"
    );

    println!("\n--- FINAL METRICS ---\n{}", gather_metrics_string(&registry_arc));
    println!("--- END OF FINAL METRICS ---\n");

    Ok(())
}
