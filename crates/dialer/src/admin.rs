//! Thin adapter over the cloud control plane: instance metadata lookup
//! and ephemeral certificate signing. The connection-info cache consumes
//! this only through the [`AdminApi`] trait; tests substitute fakes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use broker::InstanceName;
use time::OffsetDateTime;
use url::Url;

use crate::auth::{AuthError, TokenSource};

const DEFAULT_UNIVERSE_DOMAIN: &str = "googleapis.com";

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("instance not found: {0}")]
    NotFound(InstanceName),

    #[error("auth token unavailable")]
    Token(#[from] AuthError),

    #[error("control plane request failed")]
    Http(#[source] reqwest::Error),

    #[error("malformed control plane response: {0}")]
    Malformed(String),
}

/// Connect metadata for one instance.
#[derive(Debug, Clone)]
pub struct InstanceMetadata {
    /// IP addresses keyed by kind: `PRIMARY`, `PRIVATE`, `PSC`.
    pub ip_addrs: HashMap<String, String>,
    pub server_ca_pem: String,
    pub flavor: String,
}

/// A short-lived client certificate signed by the control plane.
#[derive(Debug, Clone)]
pub struct EphemeralCert {
    pub cert_pem: String,
    pub key_pem: String,
    pub expiration: OffsetDateTime,
}

#[async_trait]
pub trait AdminApi: Send + Sync {
    async fn lookup_instance(&self, instance: &InstanceName)
        -> Result<InstanceMetadata, AdminError>;

    async fn ephemeral_cert(&self, instance: &InstanceName) -> Result<EphemeralCert, AdminError>;
}

/// Options for the HTTP control-plane client, resolved by the CLI layer.
pub struct AdminClientConfig {
    pub token_source: Arc<dyn TokenSource>,
    pub api_endpoint: Option<Url>,
    pub universe_domain: Option<String>,
    pub quota_project: Option<String>,
    pub user_agent: String,
}

pub struct HttpAdminClient {
    http: reqwest::Client,
    base: Url,
    token_source: Arc<dyn TokenSource>,
    quota_project: Option<String>,
}

impl HttpAdminClient {
    pub fn new(conf: AdminClientConfig) -> Result<Self, AdminError> {
        let base = match conf.api_endpoint {
            Some(endpoint) => endpoint,
            None => {
                let domain = conf
                    .universe_domain
                    .as_deref()
                    .unwrap_or(DEFAULT_UNIVERSE_DOMAIN);
                format!("https://sqladmin.{domain}/")
                    .parse()
                    .map_err(|err| AdminError::Malformed(format!("api endpoint: {err}")))?
            }
        };
        let http = reqwest::Client::builder()
            .user_agent(conf.user_agent)
            .build()
            .map_err(AdminError::Http)?;
        Ok(HttpAdminClient {
            http,
            base,
            token_source: conf.token_source,
            quota_project: conf.quota_project,
        })
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        instance: &InstanceName,
    ) -> Result<reqwest::Response, AdminError> {
        let url = self
            .base
            .join(path)
            .map_err(|err| AdminError::Malformed(format!("request url: {err}")))?;
        let token = self.token_source.token().await?;
        let mut req = self.http.request(method, url).bearer_auth(token);
        if let Some(project) = &self.quota_project {
            req = req.header("X-Goog-User-Project", project);
        }
        let response = req.send().await.map_err(AdminError::Http)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AdminError::NotFound(instance.clone()));
        }
        response.error_for_status().map_err(AdminError::Http)
    }
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectSettings {
    #[serde(default)]
    ip_addresses: Vec<IpMapping>,
    server_ca_cert: Option<SslCert>,
    database_version: String,
    region: String,
    dns_name: Option<String>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpMapping {
    #[serde(rename = "type")]
    kind: String,
    ip_address: String,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct SslCert {
    cert: String,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateCertResponse {
    ephemeral_cert: Option<EphemeralCertBody>,
    private_key: Option<String>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct EphemeralCertBody {
    cert: String,
    expiration_time: Option<String>,
}

impl ConnectSettings {
    fn into_metadata(self, instance: &InstanceName) -> Result<InstanceMetadata, AdminError> {
        // A name with the wrong region resolves to a different instance
        // than the caller asked for; refuse it outright.
        if self.region != instance.region() {
            return Err(AdminError::Malformed(format!(
                "region mismatch for {instance}: got {}",
                self.region,
            )));
        }

        let mut ip_addrs: HashMap<String, String> = self
            .ip_addresses
            .into_iter()
            .map(|m| (m.kind, m.ip_address))
            .collect();
        if let Some(dns) = self.dns_name {
            ip_addrs.entry("PSC".to_string()).or_insert(dns);
        }

        let server_ca_pem = self
            .server_ca_cert
            .map(|c| c.cert)
            .ok_or_else(|| AdminError::Malformed("missing server CA certificate".to_string()))?;

        Ok(InstanceMetadata {
            ip_addrs,
            server_ca_pem,
            flavor: self.database_version,
        })
    }
}

impl GenerateCertResponse {
    fn into_cert(self) -> Result<EphemeralCert, AdminError> {
        let body = self
            .ephemeral_cert
            .ok_or_else(|| AdminError::Malformed("missing ephemeral certificate".to_string()))?;
        let key_pem = self
            .private_key
            .ok_or_else(|| AdminError::Malformed("missing certificate key".to_string()))?;

        let expiration = match body.expiration_time {
            Some(raw) => OffsetDateTime::parse(&raw, &time::format_description::well_known::Rfc3339)
                .map_err(|err| AdminError::Malformed(format!("expiration time: {err}")))?,
            // Certificates last an hour; leave margin handling to the cache.
            None => OffsetDateTime::now_utc() + time::Duration::hours(1),
        };

        Ok(EphemeralCert {
            cert_pem: body.cert,
            key_pem,
            expiration,
        })
    }
}

#[async_trait]
impl AdminApi for HttpAdminClient {
    async fn lookup_instance(
        &self,
        instance: &InstanceName,
    ) -> Result<InstanceMetadata, AdminError> {
        let path = format!(
            "v1/projects/{}/instances/{}/connectSettings",
            instance.project(),
            instance.name(),
        );
        let settings: ConnectSettings = self
            .request(reqwest::Method::GET, &path, instance)
            .await?
            .json()
            .await
            .map_err(AdminError::Http)?;
        settings.into_metadata(instance)
    }

    async fn ephemeral_cert(&self, instance: &InstanceName) -> Result<EphemeralCert, AdminError> {
        let path = format!(
            "v1/projects/{}/instances/{}:generateEphemeralCert",
            instance.project(),
            instance.name(),
        );
        let response: GenerateCertResponse = self
            .request(reqwest::Method::POST, &path, instance)
            .await?
            .json()
            .await
            .map_err(AdminError::Http)?;
        response.into_cert()
    }
}
