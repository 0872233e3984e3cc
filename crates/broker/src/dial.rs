use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::instance::InstanceName;

/// A connected, authenticated stream to a remote instance.
pub type BoxedStream = Box<dyn AsyncStream>;

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Per-instance options applied when dialing the remote side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DialOpts {
    /// Authenticate to the database with the IAM principal instead of a
    /// database password.
    pub auto_iam_authn: bool,
    /// Prefer the instance's private IP address.
    pub private_ip: bool,
    /// Prefer the instance's service-connect attachment.
    pub psc: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("instance not found: {0}")]
    NotFound(InstanceName),

    #[error("refreshing connect info failed: {0}")]
    Refresh(String),

    #[error("instance has no {kind} address")]
    NoAddress { kind: &'static str },

    #[error("TLS handshake failed")]
    Tls(#[source] std::io::Error),

    #[error("connecting to instance failed")]
    Connect(#[source] std::io::Error),

    #[error("dial timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("dialer is closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

/// Resolves an instance name into a connected, authenticated stream, and
/// reports the instance's engine flavor. The production implementation
/// maintains a connection-info cache with rotating short-lived credentials;
/// tests substitute fakes.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open an authenticated stream to the named instance.
    async fn dial(
        &self,
        instance: &InstanceName,
        opts: &DialOpts,
    ) -> Result<BoxedStream, DialError>;

    /// The engine flavor string for the named instance, e.g. `POSTGRES_16`.
    async fn engine_version(&self, instance: &InstanceName) -> Result<String, DialError>;

    /// Stop background refreshes and release held resources.
    async fn close(&self) -> Result<(), DialError>;
}
