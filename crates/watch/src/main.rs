//! `flowsync-watch` -- runs the sync engine against a live backend.
//!
//! Connects to the configured event stream, tracks the given workflow
//! ids and logs every connection status change and cache invalidation.
//! Useful for checking a deployment's push channel end to end.
//!
//! # Environment variables
//!
//! Everything read by `SyncConfig::from_env`, plus:
//!
//! | Variable             | Required | Default | Description                               |
//! |----------------------|----------|---------|-------------------------------------------|
//! | `WATCH_WORKFLOW_IDS` | no       | empty   | Comma-separated workflow ids to track     |
//! | `LOG_FORMAT`         | no       | `text`  | `json` for one JSON object per log line   |

use std::sync::Arc;

use flowsync_core::topics::Topic;
use flowsync_engine::client;
use flowsync_engine::{ConnectionStatus, SyncConfig, SyncEngine};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = SyncConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    });

    let tracked = parse_ids(&std::env::var("WATCH_WORKFLOW_IDS").unwrap_or_default());

    tracing::info!(
        endpoint = %config.endpoint,
        transport = ?config.transport,
        tracked = tracked.len(),
        "Starting flowsync-watch",
    );

    let source = client::from_config(&config);
    let cache = Arc::new(|topic: Topic| {
        tracing::info!(topic = %topic, "Cache topic invalidated");
    });

    let handle = SyncEngine::start(config, source, cache);
    let state = handle.track(tracked);
    tracing::debug!(state = %state, "Interest set installed");

    let mut status = handle.watch_status();
    let status_task = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let ConnectionStatus { state, retries } = *status.borrow_and_update();
            tracing::info!(state = %state, retries, "Connection status");
        }
    });

    shutdown_signal().await;

    handle.shutdown().await;
    let _ = status_task.await;
    tracing::info!("flowsync-watch stopped");
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "flowsync_watch=info,flowsync_engine=info".into());

    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Split a comma-separated id list, skipping blanks.
fn parse_ids(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(String::from)
        .collect()
}

/// Wait for SIGINT (Ctrl-C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), shutting down");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ids_skips_blanks() {
        assert_eq!(parse_ids(" 5, 7 ,,9,"), vec!["5", "7", "9"]);
        assert!(parse_ids("").is_empty());
    }
}
