//! Production [`Dialer`]: resolves an instance name through the
//! connection-info cache and opens a mutually-authenticated TLS stream to
//! the remote instance's proxy port.

pub mod admin;
pub mod auth;
pub mod conninfo;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use broker::{BoxedStream, DialError, DialOpts, Dialer, InstanceName};
use socket2::{SockRef, TcpKeepalive};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::admin::AdminApi;
use crate::conninfo::{InstanceEntry, REFRESH_MARGIN};

/// Port the remote side terminates proxied TLS connections on.
const SERVER_PROXY_PORT: u16 = 3307;

const KEEPALIVE: Duration = Duration::from_secs(30);

/// Floor between refresh attempts, so a clock surprise cannot produce a
/// hot refresh loop.
const MIN_REFRESH_DELAY: Duration = Duration::from_secs(10);

/// Wait after a failed background refresh before trying again.
const REFRESH_RETRY_DELAY: Duration = Duration::from_secs(30);

pub struct CloudDialer {
    admin: Arc<dyn AdminApi>,
    lazy_refresh: bool,
    entries: std::sync::Mutex<HashMap<InstanceName, Arc<InstanceEntry>>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl CloudDialer {
    pub fn new(admin: Arc<dyn AdminApi>, lazy_refresh: bool) -> Arc<Self> {
        Arc::new(CloudDialer {
            admin,
            lazy_refresh,
            entries: std::sync::Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// The cache slot for `instance`, created on first use. Unless the
    /// dialer is lazy, a new slot gets a background task keeping its
    /// credential fresh ahead of expiry.
    fn entry(&self, instance: &InstanceName) -> Arc<InstanceEntry> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get(instance) {
            return Arc::clone(entry);
        }

        let entry = Arc::new(InstanceEntry::new(instance.clone()));
        entries.insert(instance.clone(), Arc::clone(&entry));

        if !self.lazy_refresh {
            tokio::spawn(refresh_ahead(
                Arc::clone(&self.admin),
                Arc::clone(&entry),
                self.shutdown.clone(),
            ));
        }
        entry
    }
}

/// Keep one cache entry fresh: sleep until shortly before the current
/// credential goes stale, then force a refresh, backing off on failure.
async fn refresh_ahead(
    admin: Arc<dyn AdminApi>,
    entry: Arc<InstanceEntry>,
    shutdown: CancellationToken,
) {
    let mut force = false;
    loop {
        let delay = match entry.get(&admin, force).await {
            Ok(info) => {
                let until_stale = info.expiration() - REFRESH_MARGIN - OffsetDateTime::now_utc();
                Duration::try_from(until_stale)
                    .unwrap_or(Duration::ZERO)
                    .max(MIN_REFRESH_DELAY)
            }
            Err(err) => {
                tracing::error!(
                    instance = %entry.instance(),
                    %err,
                    "background refresh failed, will retry",
                );
                REFRESH_RETRY_DELAY
            }
        };
        force = true;

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[async_trait]
impl Dialer for CloudDialer {
    async fn dial(
        &self,
        instance: &InstanceName,
        opts: &DialOpts,
    ) -> Result<BoxedStream, DialError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DialError::Closed);
        }

        let entry = self.entry(instance);
        let info = entry.get(&self.admin, false).await?;
        let host = info.address(opts)?.to_string();

        let stream = tokio::net::TcpStream::connect((host.as_str(), SERVER_PROXY_PORT))
            .await
            .map_err(DialError::Connect)?;
        let sock = SockRef::from(&stream);
        let ka = TcpKeepalive::new().with_time(KEEPALIVE);
        if let Err(err) = sock.set_tcp_keepalive(&ka) {
            tracing::debug!(instance = %instance, %err, "failed to set keepalive");
        }
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(instance = %instance, %err, "failed to set nodelay");
        }

        let server_name = rustls::pki_types::ServerName::try_from(host.clone())
            .map_err(|err| DialError::Refresh(format!("bad server name {host}: {err}")))?;
        let connector = tokio_rustls::TlsConnector::from(info.tls_config().await?);
        let tls = connector
            .connect(server_name, stream)
            .await
            .map_err(DialError::Tls)?;

        Ok(Box::new(tls))
    }

    async fn engine_version(&self, instance: &InstanceName) -> Result<String, DialError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DialError::Closed);
        }
        let entry = self.entry(instance);
        let info = entry.get(&self.admin, false).await?;
        Ok(info.flavor().to_string())
    }

    async fn close(&self) -> Result<(), DialError> {
        self.closed.store(true, Ordering::Release);
        self.shutdown.cancel();
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::admin::{AdminError, EphemeralCert, InstanceMetadata};
    use std::sync::atomic::AtomicUsize;

    pub struct FakeAdmin {
        pub lookups: AtomicUsize,
        pub certs: AtomicUsize,
        pub cert_lifetime: time::Duration,
        pub fail: bool,
    }

    impl FakeAdmin {
        pub fn new() -> Arc<Self> {
            Arc::new(FakeAdmin {
                lookups: AtomicUsize::new(0),
                certs: AtomicUsize::new(0),
                cert_lifetime: time::Duration::hours(1),
                fail: false,
            })
        }
    }

    #[async_trait]
    impl AdminApi for FakeAdmin {
        async fn lookup_instance(
            &self,
            instance: &InstanceName,
        ) -> Result<InstanceMetadata, AdminError> {
            if self.fail {
                return Err(AdminError::NotFound(instance.clone()));
            }
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(InstanceMetadata {
                ip_addrs: [
                    ("PRIMARY".to_string(), "10.0.0.1".to_string()),
                    ("PRIVATE".to_string(), "10.1.0.1".to_string()),
                ]
                .into_iter()
                .collect(),
                server_ca_pem: "unused".to_string(),
                flavor: "POSTGRES_16".to_string(),
            })
        }

        async fn ephemeral_cert(
            &self,
            instance: &InstanceName,
        ) -> Result<EphemeralCert, AdminError> {
            if self.fail {
                return Err(AdminError::NotFound(instance.clone()));
            }
            self.certs.fetch_add(1, Ordering::SeqCst);
            Ok(EphemeralCert {
                cert_pem: "unused".to_string(),
                key_pem: "unused".to_string(),
                expiration: OffsetDateTime::now_utc() + self.cert_lifetime,
            })
        }
    }
}
