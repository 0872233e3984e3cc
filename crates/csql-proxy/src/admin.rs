//! Loopback admin server (`/quitquitquit`, `/debug/*`) and the client
//! side of the `wait` and `shutdown` subcommands.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;

use broker::Broker;

#[derive(Clone)]
struct AdminState {
    quit: CancellationToken,
    broker: Arc<tokio::sync::OnceCell<Arc<Broker>>>,
    quitquitquit: bool,
    debug: bool,
}

/// Router for the admin server. Routes are mounted only for the features
/// the operator enabled.
pub fn router(
    quit: CancellationToken,
    broker: Arc<tokio::sync::OnceCell<Arc<Broker>>>,
    quitquitquit: bool,
    debug: bool,
) -> Router {
    let state = AdminState {
        quit,
        broker,
        quitquitquit,
        debug,
    };
    Router::new()
        .route("/quitquitquit", get(quit_handler).post(quit_handler))
        .route("/debug/status", get(debug_status))
        .with_state(state)
}

async fn quit_handler(State(state): State<AdminState>) -> (StatusCode, &'static str) {
    if !state.quitquitquit {
        return (StatusCode::NOT_FOUND, "");
    }
    tracing::info!("received shutdown request");
    state.quit.cancel();
    (StatusCode::OK, "shutting down")
}

async fn debug_status(State(state): State<AdminState>) -> (StatusCode, String) {
    if !state.debug {
        return (StatusCode::NOT_FOUND, String::new());
    }
    let Some(broker) = state.broker.get() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "starting up".to_string(),
        );
    };
    let (open, max) = broker.connection_count();
    let body = serde_json::json!({
        "open_connections": open,
        "max_connections": max,
        "instances": broker.instance_count(),
    });
    (StatusCode::OK, body.to_string())
}

/// Poll the liveness endpoint until it answers 200 or the deadline
/// passes.
pub async fn wait_for_ready(
    http_address: std::net::IpAddr,
    http_port: u16,
    max: Duration,
) -> anyhow::Result<()> {
    let url = format!("http://{http_address}:{http_port}/liveness");
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .context("building http client")?;

    let deadline = tokio::time::Instant::now() + max;
    loop {
        match client.get(&url).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => return Ok(()),
            Ok(response) => {
                tracing::debug!(status = %response.status(), "proxy is not live yet");
            }
            Err(err) => {
                tracing::debug!(%err, "proxy is not reachable yet");
            }
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("proxy did not become live within {max:?}");
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Ask a running proxy to shut down, then wait for it to go away.
pub async fn request_shutdown(admin_port: u16, wait: Duration) -> anyhow::Result<()> {
    let url = format!("http://127.0.0.1:{admin_port}/quitquitquit");
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .context("building http client")?;

    client
        .post(&url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .context("requesting shutdown")?;

    let deadline = tokio::time::Instant::now() + wait;
    while tokio::time::Instant::now() < deadline {
        // The proxy has exited once its admin server stops answering.
        if client.get(&url).send().await.is_err() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Ok(())
}
