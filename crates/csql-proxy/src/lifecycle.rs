//! Process lifecycle: telemetry and admin servers, signal handling,
//! interruptible startup, and the ordered shutdown sequence.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use broker::{Broker, Dialer};
use dialer::admin::{AdminClientConfig, HttpAdminClient};
use dialer::auth::{GcloudCli, Impersonated, ServiceAccountKey, StaticToken, TokenSource};
use dialer::CloudDialer;

use crate::admin;
use crate::cli::Cli;
use crate::health::{self, Probe};

pub const EXIT_INTERRUPT: i32 = 130;
pub const EXIT_TERMINATE: i32 = 137;

const ADMIN_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Interrupt,
    Terminate,
}

enum Outcome {
    Serve(Result<(), broker::Error>),
    Signal(Signal),
    Quit,
}

/// A signal observed while the broker was still being constructed. Kept
/// distinct from an ordinary in-flight signal so callers can tell that
/// the proxy never finished starting; the exit code still follows the
/// signal.
#[derive(Debug, thiserror::Error)]
#[error("startup interrupted by {signal}")]
pub struct StartupInterrupted {
    pub signal: &'static str,
    pub exit_code: i32,
}

/// Run the proxy until it stops, returning the process exit code.
pub async fn run(cli: Cli) -> anyhow::Result<i32> {
    let dialer = build_dialer(&cli).context("failed to initialize dialer")?;
    run_with_dialer(cli, dialer).await
}

/// [`run`] with the dialer injected, the seam tests drive the whole
/// lifecycle through.
pub async fn run_with_dialer(cli: Cli, dialer: Arc<dyn Dialer>) -> anyhow::Result<i32> {
    // Configuration errors surface before anything binds.
    let conf = cli.global_config()?;

    let metrics_handle = install_metrics(&cli)?;
    if let Some(project) = &cli.telemetry_project {
        // The cloud exporter is an external integration; sampling and
        // metric names are wired for it, but export here is Prometheus.
        tracing::info!(
            project,
            sample_rate = cli.telemetry_sample_rate,
            "cloud telemetry export is not bundled; serving /metrics instead",
        );
    }

    let quit = CancellationToken::new();
    let probe = Probe::new();
    let broker_cell: Arc<tokio::sync::OnceCell<Arc<Broker>>> =
        Arc::new(tokio::sync::OnceCell::new());
    let mut server_handles = Vec::new();

    if cli.health_check || cli.prometheus {
        let addr = SocketAddr::new(cli.http_address, cli.http_port);
        let router = health::router(Arc::clone(&probe), metrics_handle.clone());
        server_handles.push(serve_http(addr, router, "health server")?);
    }
    if cli.quitquitquit || cli.debug {
        let addr = SocketAddr::new([127, 0, 0, 1].into(), cli.admin_port);
        let router = admin::router(
            quit.clone(),
            Arc::clone(&broker_cell),
            cli.quitquitquit,
            cli.debug,
        );
        server_handles.push(serve_http(addr, router, "admin server")?);
    }

    let (sig_tx, mut sig_rx) = tokio::sync::mpsc::unbounded_channel();
    {
        let sig_tx = sig_tx.clone();
        let mut interrupt = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
        let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::spawn(async move {
            loop {
                let sig = tokio::select! {
                    _ = interrupt.recv() => Signal::Interrupt,
                    _ = terminate.recv() => Signal::Terminate,
                };
                if sig_tx.send(sig).is_err() {
                    return;
                }
            }
        });
    }

    // Construct the broker concurrently with signal delivery, so an early
    // signal exits fast instead of waiting out a slow control plane.
    let startup = async {
        let broker = Broker::new(dialer, conf, None)
            .await
            .context("failed to start listeners")?;
        Ok::<_, anyhow::Error>(Arc::new(broker))
    };
    tokio::pin!(startup);

    let broker = tokio::select! {
        res = &mut startup => res?,
        sig = sig_rx.recv() => {
            let sig = sig.unwrap_or(Signal::Interrupt);
            let interrupted = StartupInterrupted {
                signal: match sig {
                    Signal::Interrupt => "interrupt",
                    Signal::Terminate => "terminate",
                },
                exit_code: signal_exit_code(&cli, sig),
            };
            tracing::error!(error = %interrupted, "exiting before startup completed");
            return Err(interrupted.into());
        }
    };
    let _ = broker_cell.set(Arc::clone(&broker));

    let serve_task = {
        let broker = Arc::clone(&broker);
        let probe = Arc::clone(&probe);
        tokio::spawn(async move {
            let on_started = {
                let broker = Arc::clone(&broker);
                let probe = Arc::clone(&probe);
                move || {
                    probe.set_started(broker);
                    tracing::info!("ready for new connections");
                }
            };
            broker.serve(on_started).await
        })
    };

    let outcome = tokio::select! {
        res = serve_task => Outcome::Serve(res.context("serve task panicked")?),
        sig = sig_rx.recv() => Outcome::Signal(sig.unwrap_or(Signal::Interrupt)),
        _ = quit.cancelled() => Outcome::Quit,
    };

    match &outcome {
        Outcome::Serve(Err(err)) => tracing::error!(error = %err, "serving failed"),
        Outcome::Serve(Ok(())) => tracing::info!("serving finished"),
        Outcome::Signal(sig) => tracing::info!(?sig, "signal received, shutting down"),
        Outcome::Quit => tracing::info!("shutdown requested, shutting down"),
    }

    probe.set_stopped();

    // A second signal during the close sequence skips the drain.
    tokio::select! {
        res = broker.close() => {
            if let Err(errs) = res {
                tracing::error!(error = %errs, "errors during shutdown");
            }
        }
        _ = sig_rx.recv() => {
            tracing::warn!("second signal received, exiting without draining");
        }
    }

    for handle in server_handles {
        handle.graceful_shutdown(Some(ADMIN_SHUTDOWN_GRACE));
    }

    match outcome {
        Outcome::Quit => Ok(0),
        Outcome::Serve(Ok(())) => Ok(0),
        Outcome::Serve(Err(err)) => Err(anyhow::Error::new(err).context("terminal serve error")),
        Outcome::Signal(sig) => Ok(signal_exit_code(&cli, sig)),
    }
}

fn signal_exit_code(cli: &Cli, sig: Signal) -> i32 {
    match sig {
        Signal::Interrupt => EXIT_INTERRUPT,
        Signal::Terminate if cli.exit_zero_on_sigterm => 0,
        Signal::Terminate => EXIT_TERMINATE,
    }
}

fn install_metrics(cli: &Cli) -> anyhow::Result<Option<PrometheusHandle>> {
    if !cli.prometheus || cli.disable_metrics {
        return Ok(None);
    }
    let mut builder = PrometheusBuilder::new().set_buckets(
        &prometheus::exponential_buckets(0.001, 2.0, 14)
            .context("calculating histogram buckets")?,
    )?;
    if let Some(namespace) = &cli.prometheus_namespace {
        builder = builder.add_global_label("namespace", namespace);
    }
    let handle = builder
        .install_recorder()
        .context("failed to install prometheus recorder")?;
    Ok(Some(handle))
}

/// Bind eagerly so a taken port fails startup instead of logging from a
/// background task later.
fn serve_http(
    addr: SocketAddr,
    router: axum::Router,
    name: &'static str,
) -> anyhow::Result<axum_server::Handle> {
    let listener = std::net::TcpListener::bind(addr)
        .with_context(|| format!("failed to bind {name} on {addr}"))?;
    listener
        .set_nonblocking(true)
        .with_context(|| format!("failed to configure {name} listener"))?;
    let handle = axum_server::Handle::new();
    let server = axum_server::from_tcp(listener)
        .handle(handle.clone())
        .serve(router.into_make_service());
    tokio::spawn(async move {
        if let Err(err) = server.await {
            tracing::error!(%err, "{name} failed");
        }
    });
    tracing::info!(%addr, "{name} listening");
    Ok(handle)
}

/// Select the token source from the credential flags and wrap the
/// control-plane adapter around it.
fn build_dialer(cli: &Cli) -> anyhow::Result<Arc<dyn Dialer>> {
    let mut token_source: Arc<dyn TokenSource> = if let Some(token) = &cli.token {
        Arc::new(StaticToken(token.clone()))
    } else if let Some(path) = &cli.credentials_file {
        Arc::new(ServiceAccountKey::from_file(path)?)
    } else if let Some(json) = &cli.credentials_json {
        Arc::new(ServiceAccountKey::from_json(json)?)
    } else if cli.gcloud_auth {
        Arc::new(GcloudCli)
    } else if let Ok(path) = std::env::var("GOOGLE_APPLICATION_CREDENTIALS") {
        Arc::new(ServiceAccountKey::from_file(std::path::Path::new(&path))?)
    } else {
        // Without explicit credentials, defer to the CLI helper.
        Arc::new(GcloudCli)
    };

    if let Some(chain) = &cli.impersonate_service_account {
        let mut accounts: Vec<String> = chain.split(',').map(|s| s.trim().to_string()).collect();
        if accounts.is_empty() || accounts.iter().any(String::is_empty) {
            anyhow::bail!("invalid --impersonate-service-account chain: '{chain}'");
        }
        let target = accounts.remove(0);
        // Delegates are given in reverse of the order the API expects.
        accounts.reverse();
        token_source = Arc::new(Impersonated {
            base: token_source,
            target,
            delegates: accounts,
            http: reqwest::Client::new(),
        });
    }

    let admin = HttpAdminClient::new(AdminClientConfig {
        token_source,
        api_endpoint: cli.api_endpoint.clone(),
        universe_domain: cli.universe_domain.clone(),
        quota_project: cli.quota_project.clone(),
        user_agent: cli.resolved_user_agent(),
    })?;

    Ok(CloudDialer::new(Arc::new(admin), cli.lazy_refresh))
}
