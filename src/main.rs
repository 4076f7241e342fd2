//! abuse-guard service.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ──────────────▶ http server ──▶ admission middleware (policy per route)
//!                                          │
//!                                          ▼
//!                                     RateLimiter ──────────┐
//!                                          │                │
//!                         allowed ◀────────┤                ▼
//!                         handler          │          shared store
//!                                          ▼          (Redis / memory)
//!                                  429 / 503 response       ▲
//!                                          │                │
//!                                 (detached) SecurityEventStore
//!                                          │                │
//!                                          ▼                │
//!                                   AnomalyDetector ────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use abuse_guard::admin::run_admin;
use abuse_guard::clock::SystemClock;
use abuse_guard::config::{load_config, GuardConfig};
use abuse_guard::http::{AppState, HttpServer};
use abuse_guard::lifecycle::{connect_store, wait_for_signal, Shutdown};
use abuse_guard::observability::{logging, metrics};
use abuse_guard::store::AtomicStore;

#[derive(Parser)]
#[command(name = "abuse-guard", version, about = "Distributed rate limiter and abuse detector")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "GUARD_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => GuardConfig::default(),
    };

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "abuse-guard starting");

    tracing::info!(
        bind_address = %config.listener.bind_address,
        store = ?config.store.backend,
        request_timeout_secs = config.timeouts.request_secs,
        alerts = config.alerts.len(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let clock = Arc::new(SystemClock);
    let store = connect_store(&config.store, clock.clone()).await?;

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    let admin_listener = if config.admin.enabled {
        Some(TcpListener::bind(&config.admin.bind_address).await?)
    } else {
        None
    };

    let state = AppState::new(config, store.clone(), clock)?;
    for policy in state.policies.iter() {
        tracing::info!(
            scope = %policy.scope(),
            window_ms = policy.window_ms(),
            max_requests = policy.max_requests(),
            failure_mode = %policy.failure_mode(),
            "Policy registered"
        );
    }

    let shutdown = Shutdown::new();

    let admin_task = admin_listener.map(|listener| {
        let state = state.clone();
        let rx = shutdown.subscribe();
        tokio::spawn(async move {
            if let Err(e) = run_admin(state, listener, rx).await {
                tracing::error!(error = %e, "Admin API failed");
            }
        })
    });

    let server = HttpServer::new(state);
    let server_task = tokio::spawn(server.run(listener, shutdown.subscribe()));

    wait_for_signal().await;
    shutdown.trigger();

    server_task.await??;
    if let Some(task) = admin_task {
        task.await?;
    }

    // Every listener has stopped; nothing else holds the store.
    if let Err(e) = store.close().await {
        tracing::warn!(error = %e, "Failed to close store");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
