use std::net::IpAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, UnixListener};
use tokio_util::sync::CancellationToken;

use crate::dial::{BoxedStream, DialOpts};
use crate::errors::Error;
use crate::instance::InstanceName;

/// Keepalive applied to accepted client sockets, matching what the remote
/// side applies to the dialed connection.
pub const DEFAULT_TCP_KEEPALIVE: Duration = Duration::from_secs(30);

/// Socket filename expected by Postgres clients inside a socket directory.
pub const PG_SOCKET_NAME: &str = ".s.PGSQL.5432";

/// The address a mount is bound to, stable across its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Tcp(std::net::SocketAddr),
    Unix(PathBuf),
}

impl std::fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenAddr::Tcp(addr) => write!(f, "{addr}"),
            ListenAddr::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    #[error("transient accept failure")]
    Transient(#[source] std::io::Error),

    #[error("accept failed")]
    Terminal(#[source] std::io::Error),

    #[error("listener closed")]
    Closed,
}

#[derive(Debug)]
enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// One bound listening endpoint for one instance, together with the dial
/// options its connections carry. Owned by the broker (or by the on-demand
/// directory's map) and closed exactly once during shutdown.
#[derive(Debug)]
pub struct Mount {
    instance: InstanceName,
    dial_opts: DialOpts,
    /// Taken on close to unbind; in-flight accepts hold their own
    /// reference and release it as they observe the shutdown.
    listener: std::sync::Mutex<Option<Arc<Listener>>>,
    addr: ListenAddr,
    keepalive: Duration,
    /// Filesystem artifacts this mount created, unlinked on close in
    /// reverse creation order.
    artifacts: Vec<PathBuf>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Mount {
    /// Bind a TCP listener for `instance` at `addr:port`.
    pub async fn bind_tcp(
        instance: InstanceName,
        dial_opts: DialOpts,
        addr: IpAddr,
        port: u16,
        keepalive: Duration,
    ) -> Result<Mount, Error> {
        let listener = TcpListener::bind((addr, port)).await.map_err(|source| {
            Error::Bind {
                addr: format!("{addr}:{port}"),
                source,
            }
        })?;
        let local = listener.local_addr().map_err(|source| Error::Bind {
            addr: format!("{addr}:{port}"),
            source,
        })?;

        Ok(Mount {
            instance,
            dial_opts,
            listener: std::sync::Mutex::new(Some(Arc::new(Listener::Tcp(listener)))),
            addr: ListenAddr::Tcp(local),
            keepalive,
            artifacts: Vec::new(),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Bind a unix listener for `instance` at `base`. The parent directory
    /// of `base` must already exist. For Postgres flavors `base` becomes a
    /// directory holding the protocol's expected socket filename.
    pub async fn bind_unix(
        instance: InstanceName,
        dial_opts: DialOpts,
        base: &Path,
        postgres: bool,
    ) -> Result<Mount, Error> {
        match base.parent() {
            Some(parent) if parent.as_os_str().is_empty() || parent.is_dir() => {}
            Some(parent) => return Err(Error::MissingDir(parent.to_path_buf())),
            None => return Err(Error::MissingDir(base.to_path_buf())),
        }

        let mut artifacts = Vec::new();
        let socket_path = if postgres {
            match std::fs::create_dir(base) {
                Ok(()) => {
                    set_world_writable(base);
                    artifacts.push(base.to_path_buf());
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(source) => {
                    return Err(Error::Bind {
                        addr: base.display().to_string(),
                        source,
                    })
                }
            }
            base.join(PG_SOCKET_NAME)
        } else {
            base.to_path_buf()
        };

        let listener = UnixListener::bind(&socket_path).map_err(|source| Error::Bind {
            addr: socket_path.display().to_string(),
            source,
        })?;
        // Listed before the directory so unlinking runs inside-out.
        artifacts.insert(0, socket_path.clone());

        set_world_writable(&socket_path);

        Ok(Mount {
            instance,
            dial_opts,
            listener: std::sync::Mutex::new(Some(Arc::new(Listener::Unix(listener)))),
            addr: ListenAddr::Unix(socket_path),
            keepalive: DEFAULT_TCP_KEEPALIVE,
            artifacts,
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn instance(&self) -> &InstanceName {
        &self.instance
    }

    pub fn dial_opts(&self) -> &DialOpts {
        &self.dial_opts
    }

    pub fn addr(&self) -> &ListenAddr {
        &self.addr
    }

    /// Wait for the next client stream. Returns `Closed` once the mount
    /// has been closed, and classifies I/O failures as transient (retry)
    /// or terminal (stop the accept loop).
    pub async fn accept(&self) -> Result<BoxedStream, AcceptError> {
        let listener = self.listener.lock().unwrap().as_ref().map(Arc::clone);
        let Some(listener) = listener else {
            return Err(AcceptError::Closed);
        };
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(AcceptError::Closed),
            res = self.accept_inner(&listener) => res,
        }
    }

    async fn accept_inner(&self, listener: &Listener) -> Result<BoxedStream, AcceptError> {
        match listener {
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await.map_err(classify)?;
                let sock = SockRef::from(&stream);
                let ka = TcpKeepalive::new().with_time(self.keepalive);
                if let Err(err) = sock.set_tcp_keepalive(&ka) {
                    tracing::debug!(instance = %self.instance, %err, "failed to set keepalive");
                }
                if let Err(err) = stream.set_nodelay(true) {
                    tracing::debug!(instance = %self.instance, %err, "failed to set nodelay");
                }
                Ok(Box::new(stream))
            }
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await.map_err(classify)?;
                Ok(Box::new(stream))
            }
        }
    }

    /// Close the mount: unbind, unblock pending accepts, and unlink any
    /// filesystem artifacts it created. Safe to call more than once.
    pub fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.cancel();
        self.listener.lock().unwrap().take();

        let mut first_err = None;
        for artifact in &self.artifacts {
            let res = if artifact.is_dir() {
                std::fs::remove_dir(artifact)
            } else {
                std::fs::remove_file(artifact)
            };
            if let Err(source) = res {
                tracing::error!(
                    instance = %self.instance,
                    path = %artifact.display(),
                    %source,
                    "failed to remove socket artifact",
                );
                first_err.get_or_insert(Error::Close {
                    addr: artifact.display().to_string(),
                    source,
                });
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        // Close is idempotent; a mount dropped without an explicit close
        // still removes its artifacts.
        let _ = self.close();
    }
}

/// Best-effort 0777, so clients running as any user can connect. Failure
/// is logged and tolerated.
fn set_world_writable(path: &Path) {
    if let Err(err) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777)) {
        tracing::warn!(path = %path.display(), %err, "failed to chmod socket path");
    }
}

fn classify(err: std::io::Error) -> AcceptError {
    use std::io::ErrorKind;
    match err.kind() {
        // Pending network errors on the accepted socket surface from
        // accept() itself and do not poison the listener.
        ErrorKind::ConnectionAborted
        | ErrorKind::ConnectionReset
        | ErrorKind::Interrupted
        | ErrorKind::TimedOut
        | ErrorKind::WouldBlock => AcceptError::Transient(err),
        _ => AcceptError::Terminal(err),
    }
}
