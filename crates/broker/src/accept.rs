use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::counter::ConnCount;
use crate::dial::{BoxedStream, Dialer};
use crate::errors::Error;
use crate::mount::{AcceptError, Mount};
use crate::splice;

/// Hard per-client budget for establishing the remote connection. The
/// dialer retries refreshes internally; this bound is what the client
/// experiences.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

const TRANSIENT_BACKOFF: Duration = Duration::from_millis(10);

/// Invoked whenever a connection is refused at the admission cap.
pub type RefuseNotify = Arc<dyn Fn() + Send + Sync>;

/// Accept clients on `mount` until the listener fails terminally or the
/// mount is closed. Each accepted client is served on its own task:
/// admission against the counter, a bounded dial, then the splice.
pub(crate) async fn accept_loop(
    mount: Arc<Mount>,
    dialer: Arc<dyn Dialer>,
    count: Arc<ConnCount>,
    on_refuse: Option<RefuseNotify>,
) -> Error {
    loop {
        match mount.accept().await {
            Ok(client) => {
                let mount = Arc::clone(&mount);
                let dialer = Arc::clone(&dialer);
                let count = Arc::clone(&count);
                let on_refuse = on_refuse.clone();
                tokio::spawn(async move {
                    handle_connection(&mount, dialer, count, on_refuse, client).await;
                });
            }
            Err(AcceptError::Transient(err)) => {
                tracing::debug!(
                    instance = %mount.instance(),
                    %err,
                    "transient accept failure, retrying",
                );
                tokio::time::sleep(TRANSIENT_BACKOFF).await;
            }
            Err(AcceptError::Closed) => return Error::ListenerClosed,
            Err(AcceptError::Terminal(err)) => {
                tracing::error!(instance = %mount.instance(), %err, "accept failed");
                return Error::Accept(err);
            }
        }
    }
}

#[tracing::instrument(level = "debug", skip_all, fields(instance = %mount.instance()))]
async fn handle_connection(
    mount: &Mount,
    dialer: Arc<dyn Dialer>,
    count: Arc<ConnCount>,
    on_refuse: Option<RefuseNotify>,
    client: BoxedStream,
) {
    let instance = mount.instance();

    // Refused clients are closed without ever dialing the remote side.
    let Some(guard) = ConnCount::try_acquire(&count) else {
        let (open, max) = count.snapshot();
        tracing::warn!(instance = %instance, open, max, "max connections exceeded");
        metrics::counter!(
            "csql_proxy_refused_connections_total",
            "instance" => instance.to_string()
        )
        .increment(1);
        if let Some(notify) = &on_refuse {
            notify();
        }
        return;
    };

    metrics::counter!(
        "csql_proxy_accepted_connections_total",
        "instance" => instance.to_string()
    )
    .increment(1);

    let started = Instant::now();
    let dial = tokio::time::timeout(DIAL_TIMEOUT, dialer.dial(instance, mount.dial_opts()));
    let remote = match dial.await {
        Ok(Ok(remote)) => remote,
        Ok(Err(err)) => {
            tracing::error!(instance = %instance, %err, "failed to connect to instance");
            return;
        }
        Err(_) => {
            tracing::error!(
                instance = %instance,
                timeout = ?DIAL_TIMEOUT,
                "timed out connecting to instance",
            );
            return;
        }
    };
    metrics::histogram!(
        "csql_proxy_dial_seconds",
        "instance" => instance.to_string()
    )
    .record(started.elapsed().as_secs_f64());

    splice::splice(instance, client, remote).await;
    drop(guard);
}
