//! Token sources used to authenticate control-plane requests.
//!
//! Each backend is a thin adapter behind [`TokenSource`]: a fixed token
//! handed in on the command line, a service-account key exchanged for an
//! access token, the `gcloud` CLI helper, or an impersonation wrapper
//! layered over any of the others.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;

/// Scope requested for control-plane access tokens.
const ADMIN_SCOPE: &str = "https://www.googleapis.com/auth/sqlservice.admin";

/// Tokens within this window of expiry are replaced early.
const TOKEN_SLACK: time::Duration = time::Duration::seconds(30);

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("failed to read credentials file")]
    ReadKey(#[source] std::io::Error),

    #[error("failed to parse service account key")]
    ParseKey(#[source] serde_json::Error),

    #[error("failed to sign token assertion")]
    Sign(#[source] jsonwebtoken::errors::Error),

    #[error("token exchange failed")]
    Exchange(#[source] reqwest::Error),

    #[error("token helper failed: {0}")]
    Helper(String),
}

/// Yields a bearer token for control-plane requests. Implementations cache
/// and rotate internally as needed.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<String, AuthError>;
}

/// A fixed OAuth2 access token, e.g. from `--token`.
pub struct StaticToken(pub String);

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<String, AuthError> {
        Ok(self.0.clone())
    }
}

#[derive(serde::Deserialize)]
struct KeyFile {
    client_email: String,
    private_key: String,
    token_uri: String,
}

#[derive(serde::Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(serde::Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

struct CachedToken {
    token: String,
    expires_at: OffsetDateTime,
}

/// Exchanges a service-account key for short-lived access tokens, caching
/// each until shortly before it expires. Backs both `--credentials-file`
/// and `--credentials-json`.
pub struct ServiceAccountKey {
    key: KeyFile,
    http: reqwest::Client,
    cached: tokio::sync::Mutex<Option<CachedToken>>,
}

impl ServiceAccountKey {
    pub fn from_file(path: &Path) -> Result<Self, AuthError> {
        let raw = std::fs::read_to_string(path).map_err(AuthError::ReadKey)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, AuthError> {
        let key: KeyFile = serde_json::from_str(raw).map_err(AuthError::ParseKey)?;
        Ok(ServiceAccountKey {
            key,
            http: reqwest::Client::new(),
            cached: tokio::sync::Mutex::new(None),
        })
    }

    fn assertion(&self, now: OffsetDateTime) -> Result<String, AuthError> {
        let claims = AssertionClaims {
            iss: &self.key.client_email,
            scope: ADMIN_SCOPE,
            aud: &self.key.token_uri,
            iat: now.unix_timestamp(),
            exp: (now + time::Duration::hours(1)).unix_timestamp(),
        };
        let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256);
        let key = jsonwebtoken::EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .map_err(AuthError::Sign)?;
        jsonwebtoken::encode(&header, &claims, &key).map_err(AuthError::Sign)
    }
}

#[async_trait]
impl TokenSource for ServiceAccountKey {
    async fn token(&self) -> Result<String, AuthError> {
        let mut cached = self.cached.lock().await;
        let now = OffsetDateTime::now_utc();
        if let Some(entry) = &*cached {
            if entry.expires_at - TOKEN_SLACK > now {
                return Ok(entry.token.clone());
            }
        }

        let assertion = self.assertion(now)?;
        let response: TokenResponse = self
            .http
            .post(&self.key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(AuthError::Exchange)?
            .json()
            .await
            .map_err(AuthError::Exchange)?;

        let token = response.access_token.clone();
        *cached = Some(CachedToken {
            token: response.access_token,
            expires_at: now + time::Duration::seconds(response.expires_in),
        });
        Ok(token)
    }
}

/// Shells out to the `gcloud` CLI for the active user's token.
pub struct GcloudCli;

#[async_trait]
impl TokenSource for GcloudCli {
    async fn token(&self) -> Result<String, AuthError> {
        let output = tokio::process::Command::new("gcloud")
            .args(["auth", "print-access-token", "--quiet"])
            .output()
            .await
            .map_err(|err| AuthError::Helper(err.to_string()))?;
        if !output.status.success() {
            return Err(AuthError::Helper(format!(
                "gcloud exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim(),
            )));
        }
        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(AuthError::Helper("gcloud printed no token".to_string()));
        }
        Ok(token)
    }
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct ImpersonateRequest<'a> {
    scope: [&'a str; 1],
    delegates: &'a [String],
    lifetime: &'a str,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImpersonateResponse {
    access_token: String,
}

/// Trades the base source's token for one belonging to a target service
/// account, optionally through a delegation chain.
pub struct Impersonated {
    pub base: Arc<dyn TokenSource>,
    pub target: String,
    pub delegates: Vec<String>,
    pub http: reqwest::Client,
}

#[async_trait]
impl TokenSource for Impersonated {
    async fn token(&self) -> Result<String, AuthError> {
        let base = self.base.token().await?;
        let url = format!(
            "https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/{}:generateAccessToken",
            self.target,
        );
        let response: ImpersonateResponse = self
            .http
            .post(&url)
            .bearer_auth(base)
            .json(&ImpersonateRequest {
                scope: [ADMIN_SCOPE],
                delegates: &self.delegates,
                lifetime: "3600s",
            })
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(AuthError::Exchange)?
            .json()
            .await
            .map_err(AuthError::Exchange)?;
        Ok(response.access_token)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn static_token_returns_verbatim() {
        let source = StaticToken("ya29.token".to_string());
        assert_eq!(source.token().await.unwrap(), "ya29.token");
    }

    #[test]
    fn key_file_parse_errors_are_typed() {
        let err = ServiceAccountKey::from_json("not json").unwrap_err();
        assert!(matches!(err, AuthError::ParseKey(_)), "{err}");

        let err = ServiceAccountKey::from_file(Path::new("/no/such/key.json")).unwrap_err();
        assert!(matches!(err, AuthError::ReadKey(_)), "{err}");
    }

    #[test]
    fn key_file_requires_the_signing_fields() {
        // A key without token_uri is rejected up front rather than at
        // first use.
        let err = ServiceAccountKey::from_json(
            r#"{"client_email": "sa@example.iam.gserviceaccount.com"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, AuthError::ParseKey(_)), "{err}");
    }
}
