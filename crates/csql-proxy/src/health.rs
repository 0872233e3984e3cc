//! Health probe: startup, readiness, and liveness state for the
//! orchestrator-facing HTTP endpoints.
//!
//! `started` and `stopped` are one-way latches. Readiness additionally
//! consults the connection counter and, when the caller asks for a
//! minimum ready quorum, live dial checks against every instance.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::{RawQuery, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;

use broker::Broker;

pub struct Probe {
    started: AtomicBool,
    stopped: AtomicBool,
    broker: tokio::sync::OnceCell<Arc<Broker>>,
}

impl Probe {
    pub fn new() -> Arc<Probe> {
        Arc::new(Probe {
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            broker: tokio::sync::OnceCell::new(),
        })
    }

    /// Latch `started`. One-way; the broker reference backs readiness
    /// checks from here on.
    pub fn set_started(&self, broker: Arc<Broker>) {
        let _ = self.broker.set(broker);
        self.started.store(true, Ordering::Release);
    }

    /// Latch `stopped`. One-way.
    pub fn set_stopped(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn startup_status(&self) -> (StatusCode, String) {
        if self.started.load(Ordering::Acquire) {
            (StatusCode::OK, "ok".to_string())
        } else {
            (StatusCode::SERVICE_UNAVAILABLE, "not started".to_string())
        }
    }

    pub async fn readiness_status(&self, query: Option<&str>) -> (StatusCode, String) {
        if !self.started.load(Ordering::Acquire) {
            return (StatusCode::SERVICE_UNAVAILABLE, "not started".to_string());
        }
        if self.stopped.load(Ordering::Acquire) {
            return (StatusCode::SERVICE_UNAVAILABLE, "stopped".to_string());
        }
        let Some(broker) = self.broker.get() else {
            return (StatusCode::SERVICE_UNAVAILABLE, "not started".to_string());
        };

        let (open, max) = broker.connection_count();
        if max > 0 && open >= max {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                "max connections reached".to_string(),
            );
        }

        let min_ready = match parse_min_ready(query, broker.instance_count()) {
            Ok(min_ready) => min_ready,
            Err(reason) => return (StatusCode::BAD_REQUEST, reason),
        };
        let Some(min_ready) = min_ready else {
            return (StatusCode::OK, "ok".to_string());
        };

        let (total, result) = broker.check_connections().await;
        let failures = match &result {
            Ok(()) => 0,
            Err(errs) => errs.0.len(),
        };
        if total - failures >= min_ready {
            (StatusCode::OK, "ok".to_string())
        } else {
            let detail = result
                .err()
                .map(|errs| errs.to_string())
                .unwrap_or_default();
            (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("{} of {total} instances ready: {detail}", total - failures),
            )
        }
    }
}

/// Parse the optional `min-ready` query parameter. `Ok(None)` means the
/// caller did not ask for a quorum.
fn parse_min_ready(query: Option<&str>, instances: usize) -> Result<Option<usize>, String> {
    let Some(query) = query else {
        return Ok(None);
    };
    let raw = url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "min-ready")
        .map(|(_, value)| value.into_owned());
    let Some(raw) = raw else {
        return Ok(None);
    };

    let min_ready: i64 = raw
        .parse()
        .map_err(|_| format!("invalid min-ready value: '{raw}'"))?;
    if min_ready <= 0 || min_ready as usize > instances {
        return Err(format!(
            "min-ready must be between 1 and the instance count ({instances}), got {min_ready}"
        ));
    }
    Ok(Some(min_ready as usize))
}

#[derive(Clone)]
struct HealthState {
    probe: Arc<Probe>,
    metrics: Option<PrometheusHandle>,
}

/// Router for the health and metrics server. The `/metrics` route is
/// present only when a Prometheus recorder is installed.
pub fn router(probe: Arc<Probe>, metrics: Option<PrometheusHandle>) -> Router {
    let mut router = Router::new()
        .route("/startup", get(startup))
        .route("/readiness", get(readiness))
        .route("/liveness", get(liveness));
    if metrics.is_some() {
        router = router.route("/metrics", get(prometheus_metrics));
    }
    router.with_state(HealthState { probe, metrics })
}

async fn startup(State(state): State<HealthState>) -> (StatusCode, String) {
    state.probe.startup_status()
}

async fn readiness(
    State(state): State<HealthState>,
    RawQuery(query): RawQuery,
) -> (StatusCode, String) {
    state.probe.readiness_status(query.as_deref()).await
}

async fn liveness() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn prometheus_metrics(State(state): State<HealthState>) -> (StatusCode, String) {
    match state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, String::new()),
    }
}
