//! Per-instance connect-info cache. Each entry carries the instance's
//! addresses, engine flavor, and the rotating short-lived TLS credential,
//! and refreshes itself ahead of certificate expiry.

use std::collections::HashMap;
use std::sync::Arc;

use broker::{DialError, DialOpts, InstanceName};
use time::OffsetDateTime;

use crate::admin::AdminApi;

/// An entry is treated as stale this long before its certificate expires,
/// leaving room for the refresh to complete under load.
pub(crate) const REFRESH_MARGIN: time::Duration = time::Duration::minutes(4);

/// Immutable snapshot of everything needed to dial one instance.
pub struct ConnectInfo {
    addrs: HashMap<String, String>,
    flavor: String,
    expiration: OffsetDateTime,
    server_ca_pem: String,
    cert_pem: String,
    key_pem: String,
    // TLS config assembly is deferred to the first dial; lookups that only
    // need the flavor never touch the credential.
    tls: tokio::sync::OnceCell<Arc<rustls::ClientConfig>>,
}

impl ConnectInfo {
    pub fn flavor(&self) -> &str {
        &self.flavor
    }

    pub fn expiration(&self) -> OffsetDateTime {
        self.expiration
    }

    pub fn valid(&self) -> bool {
        self.expiration - REFRESH_MARGIN > OffsetDateTime::now_utc()
    }

    /// The address to dial, honoring the caller's preference for the
    /// private or service-connect path.
    pub fn address(&self, opts: &DialOpts) -> Result<&str, DialError> {
        let kind = if opts.psc {
            "PSC"
        } else if opts.private_ip {
            "PRIVATE"
        } else {
            "PRIMARY"
        };
        self.addrs
            .get(kind)
            .map(String::as_str)
            .ok_or(DialError::NoAddress { kind })
    }

    /// The client TLS configuration for this credential, built on first
    /// use and shared by subsequent dials.
    pub async fn tls_config(&self) -> Result<Arc<rustls::ClientConfig>, DialError> {
        self.tls
            .get_or_try_init(|| async {
                client_tls_config(&self.server_ca_pem, &self.cert_pem, &self.key_pem)
                    .map(Arc::new)
            })
            .await
            .map(Arc::clone)
    }
}

/// One instance's cache slot. The async-aware lock both serializes
/// refreshes and lets concurrent dials share an in-flight one.
pub(crate) struct InstanceEntry {
    instance: InstanceName,
    state: tokio::sync::Mutex<Option<Arc<ConnectInfo>>>,
}

impl InstanceEntry {
    pub fn new(instance: InstanceName) -> Self {
        InstanceEntry {
            instance,
            state: tokio::sync::Mutex::new(None),
        }
    }

    pub fn instance(&self) -> &InstanceName {
        &self.instance
    }

    /// The current connect info, refreshed first if absent, stale, or
    /// `force` is set.
    pub async fn get(
        &self,
        admin: &Arc<dyn AdminApi>,
        force: bool,
    ) -> Result<Arc<ConnectInfo>, DialError> {
        let mut state = self.state.lock().await;
        if !force {
            if let Some(info) = &*state {
                if info.valid() {
                    return Ok(Arc::clone(info));
                }
            }
        }

        let result = self.fetch(admin).await;
        let outcome = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(
            "csql_proxy_refresh_total",
            "instance" => self.instance.to_string(),
            "result" => outcome
        )
        .increment(1);

        let info = result?;
        *state = Some(Arc::clone(&info));
        Ok(info)
    }

    async fn fetch(&self, admin: &Arc<dyn AdminApi>) -> Result<Arc<ConnectInfo>, DialError> {
        let metadata = admin
            .lookup_instance(&self.instance)
            .await
            .map_err(|err| self.refresh_error(err))?;
        let cert = admin
            .ephemeral_cert(&self.instance)
            .await
            .map_err(|err| self.refresh_error(err))?;

        tracing::debug!(
            instance = %self.instance,
            flavor = %metadata.flavor,
            expiration = %cert.expiration,
            "refreshed connect info",
        );

        Ok(Arc::new(ConnectInfo {
            addrs: metadata.ip_addrs,
            flavor: metadata.flavor,
            expiration: cert.expiration,
            server_ca_pem: metadata.server_ca_pem,
            cert_pem: cert.cert_pem,
            key_pem: cert.key_pem,
            tls: tokio::sync::OnceCell::new(),
        }))
    }

    fn refresh_error(&self, err: crate::admin::AdminError) -> DialError {
        match err {
            crate::admin::AdminError::NotFound(instance) => DialError::NotFound(instance),
            other => DialError::Refresh(other.to_string()),
        }
    }
}

/// Mutually-authenticated client config: the instance's CA as the only
/// root, and the ephemeral cert presented as the client identity.
fn client_tls_config(
    server_ca_pem: &str,
    cert_pem: &str,
    key_pem: &str,
) -> Result<rustls::ClientConfig, DialError> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut server_ca_pem.as_bytes()) {
        let cert = cert.map_err(DialError::Tls)?;
        roots
            .add(cert)
            .map_err(|err| DialError::Refresh(format!("server CA rejected: {err}")))?;
    }

    let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(DialError::Tls)?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(DialError::Tls)?
        .ok_or_else(|| DialError::Refresh("ephemeral key is not valid PEM".to_string()))?;

    rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|err| DialError::Refresh(format!("client credential rejected: {err}")))
}
