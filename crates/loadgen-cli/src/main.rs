mod server;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use loadgen_core::config::LoadgenConfig;
use loadgen_core::generator::{Generator, RunParams};
use tokio_util::sync::CancellationToken;
use tracing::info;

use server::ControlPlane;

/// Load generator for the chat application's four backend services.
#[derive(Debug, Parser)]
#[command(name = "loadgen-cli", version, about)]
struct Cli {
    /// Path to a YAML config file; missing or malformed is silently skipped.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Start the control plane and metrics server and block forever.
    #[arg(long)]
    web: bool,

    /// Number of virtual users for a headless run.
    #[arg(long)]
    users: Option<u64>,

    /// Duration of a headless run, e.g. `30s`, `5m`.
    #[arg(long)]
    duration: Option<String>,

    /// Ramp-up rate for a headless run, e.g. `5/s`.
    #[arg(long, default_value = "0/s")]
    ramp: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = LoadgenConfig::load(cli.config.as_deref());

    if cli.web {
        run_web(config).await;
        return;
    }

    let (Some(users), Some(duration)) = (cli.users, cli.duration.clone()) else {
        eprintln!("--users and --duration are required without --web");
        std::process::exit(2);
    };

    run_headless(config, users, duration, cli.ramp).await;
}

async fn run_web(config: LoadgenConfig) {
    let metrics = Arc::new(loadgen_core::metrics::MetricsRegistry::new());
    let root_cancel = CancellationToken::new();
    let plane = ControlPlane::new(
        config.services.clone(),
        metrics,
        config.metrics_port,
        root_cancel.clone(),
    );

    let control_addr = format!("0.0.0.0:{}", config.control_port);
    let metrics_addr = format!("0.0.0.0:{}", config.metrics_port);

    let control_listener = tokio::net::TcpListener::bind(&control_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind control plane on {control_addr}: {e}"));
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind metrics server on {metrics_addr}: {e}"));

    info!(%control_addr, %metrics_addr, "loadgen control plane starting");

    let control_router = plane.router();
    let metrics_router = plane.metrics_router();

    let control_server = tokio::spawn(async move {
        axum::serve(control_listener, control_router).await
    });
    let metrics_server = tokio::spawn(async move {
        axum::serve(metrics_listener, metrics_router).await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
        res = control_server => {
            if let Ok(Err(e)) = res {
                tracing::error!("control plane server error: {e}");
            }
        }
        res = metrics_server => {
            if let Ok(Err(e)) = res {
                tracing::error!("metrics server error: {e}");
            }
        }
    }

    root_cancel.cancel();
}

async fn run_headless(config: LoadgenConfig, users: u64, duration: String, ramp: String) {
    let metrics = Arc::new(loadgen_core::metrics::MetricsRegistry::new());
    let tracker = Arc::new(loadgen_core::cleanup::CleanupTracker::new(
        config.services.user.url.clone(),
        config.services.chat.url.clone(),
        config.services.posts.url.clone(),
    ));
    let generator = Generator::new(config.services.clone(), metrics);
    let root_cancel = CancellationToken::new();

    let ctrl_c_cancel = root_cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        ctrl_c_cancel.cancel();
    });

    let params = RunParams {
        users,
        duration,
        ramp,
    };

    if loadgen_core::generator::parse_duration(&params.duration).is_none() {
        eprintln!("invalid duration: {}", params.duration);
        std::process::exit(2);
    }

    let handle = generator.run(1, params, tracker, &root_cancel);
    let report = handle.await_completion().await;

    println!(
        "{}",
        serde_json::to_string_pretty(&report).expect("TestReport is always serializable")
    );
}
