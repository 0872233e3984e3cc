use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::accept::{accept_loop, RefuseNotify, DIAL_TIMEOUT};
use crate::config::{GlobalConfig, InstanceConfig, ListenTarget};
use crate::counter::ConnCount;
use crate::dial::{DialError, Dialer};
use crate::errors::{Error, MultiError};
use crate::fuse::FuseDir;
use crate::instance::InstanceName;
use crate::mount::{Mount, DEFAULT_TCP_KEEPALIVE};
use crate::ports::PortAllocator;

const DRAIN_TICK: Duration = Duration::from_millis(100);

/// Owns every listener mount, the connection counter, and the dialer
/// handle; orchestrates serve and the ordered shutdown sequence.
pub struct Broker {
    dialer: Arc<dyn Dialer>,
    conf: Arc<GlobalConfig>,
    mounts: Vec<Arc<Mount>>,
    count: Arc<ConnCount>,
    on_refuse: Option<RefuseNotify>,
    fuse: Option<FuseDir>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("conf", &self.conf)
            .field("mounts", &self.mounts)
            .field("count", &self.count)
            .field("on_refuse", &self.on_refuse.is_some())
            .field("fuse", &self.fuse.is_some())
            .finish()
    }
}

impl Broker {
    /// Bind a mount for every configured instance. A failing instance
    /// aborts construction (closing everything bound so far) unless
    /// `skip_failed_instance_config` is set, in which case it is dropped
    /// with an error log.
    pub async fn new(
        dialer: Arc<dyn Dialer>,
        conf: GlobalConfig,
        on_refuse: Option<RefuseNotify>,
    ) -> Result<Broker, Error> {
        let conf = Arc::new(conf);

        // Prewarm connect info so the first client does not pay for the
        // initial refresh. Failures surface later, on dial.
        if !conf.lazy_refresh {
            for inst in &conf.instances {
                let dialer = Arc::clone(&dialer);
                let name = inst.name.clone();
                tokio::spawn(async move {
                    let _ = dialer.engine_version(&name).await;
                });
            }
        }

        let count = ConnCount::new(conf.max_connections);
        let mut ports = PortAllocator::new(conf.port);
        let mut mounts: Vec<Arc<Mount>> = Vec::new();

        for inst_conf in &conf.instances {
            match Self::bind_mount(&dialer, &conf, &mut ports, inst_conf).await {
                Ok(mount) => {
                    tracing::info!(
                        instance = %mount.instance(),
                        address = %mount.addr(),
                        "listening",
                    );
                    mounts.push(Arc::new(mount));
                }
                Err(err) if conf.skip_failed_instance_config => {
                    tracing::error!(
                        instance = %inst_conf.name,
                        error = %err,
                        "skipping instance, listener setup failed",
                    );
                }
                Err(err) => {
                    for mount in &mounts {
                        let _ = mount.close();
                    }
                    return Err(err.for_instance(inst_conf.name.clone()));
                }
            }
        }

        let fuse = match &conf.fuse_dir {
            Some(dir) => Some(FuseDir::new(
                dir.clone(),
                conf.fuse_tmp_dir.clone(),
                Arc::clone(&dialer),
                Arc::clone(&count),
                crate::dial::DialOpts {
                    auto_iam_authn: conf.auto_iam_authn,
                    private_ip: conf.private_ip,
                    psc: conf.psc,
                },
                on_refuse.clone(),
            )?),
            None => None,
        };

        Ok(Broker {
            dialer,
            conf,
            mounts,
            count,
            on_refuse,
            fuse,
        })
    }

    async fn bind_mount(
        dialer: &Arc<dyn Dialer>,
        conf: &GlobalConfig,
        ports: &mut PortAllocator,
        inst_conf: &InstanceConfig,
    ) -> Result<Mount, Error> {
        let name = &inst_conf.name;
        let dial_opts = inst_conf.dial_opts(conf);

        match inst_conf.listen_target(conf) {
            ListenTarget::Unix { base } => {
                let flavor = Self::flavor(dialer, name).await?;
                Mount::bind_unix(
                    name.clone(),
                    dial_opts,
                    &base,
                    flavor.starts_with("POSTGRES"),
                )
                .await
            }
            ListenTarget::Tcp { addr, port } => {
                // Flavor-default ports only matter when neither the
                // instance nor the global config pins one.
                let port = match (port, conf.port) {
                    (Some(port), _) => ports.assign(Some(port), ""),
                    (None, base) if base != 0 => ports.assign(None, ""),
                    (None, _) => {
                        let flavor = Self::flavor(dialer, name).await?;
                        ports.assign(None, &flavor)
                    }
                };
                Mount::bind_tcp(name.clone(), dial_opts, addr, port, DEFAULT_TCP_KEEPALIVE).await
            }
        }
    }

    async fn flavor(dialer: &Arc<dyn Dialer>, name: &InstanceName) -> Result<String, Error> {
        dialer
            .engine_version(name)
            .await
            .map_err(|err| Error::Lookup(name.clone(), err))
    }

    /// Serve accepted clients until any accept loop fails terminally.
    /// `on_started` fires once: after every mount is bound and its loop
    /// scheduled, before any accept is processed.
    pub async fn serve(&self, on_started: impl FnOnce() + Send) -> Result<(), Error> {
        if let Some(fuse) = &self.fuse {
            return fuse.serve(on_started).await;
        }

        if self.conf.run_connection_test {
            self.connection_test().await?;
        }

        let gate = CancellationToken::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for mount in &self.mounts {
            let mount = Arc::clone(mount);
            let dialer = Arc::clone(&self.dialer);
            let count = Arc::clone(&self.count);
            let on_refuse = self.on_refuse.clone();
            let gate = gate.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                gate.cancelled().await;
                let _ = tx.send(accept_loop(mount, dialer, count, on_refuse).await);
            });
        }
        drop(tx);

        on_started();
        gate.cancel();

        match rx.recv().await {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Dial every mount once, failing fast on the first instance that
    /// cannot be reached.
    async fn connection_test(&self) -> Result<(), Error> {
        for mount in &self.mounts {
            Self::dial_check(&self.dialer, mount).await?;
            tracing::info!(instance = %mount.instance(), "connection test passed");
        }
        Ok(())
    }

    async fn dial_check(dialer: &Arc<dyn Dialer>, mount: &Mount) -> Result<(), Error> {
        let instance = mount.instance();
        let attempt = tokio::time::timeout(DIAL_TIMEOUT, dialer.dial(instance, mount.dial_opts()));
        match attempt.await {
            Ok(Ok(stream)) => {
                drop(stream);
                Ok(())
            }
            Ok(Err(source)) => Err(Error::ConnectionTest {
                instance: instance.clone(),
                source,
            }),
            Err(_) => Err(Error::ConnectionTest {
                instance: instance.clone(),
                source: DialError::Timeout(DIAL_TIMEOUT),
            }),
        }
    }

    /// Ordered shutdown: optional grace sleep, unmount the on-demand
    /// directory, stop the dialer, drain open connections, close mounts,
    /// and report everything that went wrong along the way.
    pub async fn close(&self) -> Result<(), MultiError> {
        let mut errs = MultiError::default();

        // Lets orchestrators observe the impending stop through the admin
        // endpoints before listeners go away. A repeated signal is handled
        // by the lifecycle layer, not here.
        if !self.conf.wait_before_close.is_zero() {
            tracing::info!(
                wait = ?self.conf.wait_before_close,
                "waiting before starting shutdown",
            );
            tokio::time::sleep(self.conf.wait_before_close).await;
        }

        if let Some(fuse) = &self.fuse {
            fuse.unmount();
        }

        if let Err(err) = self.dialer.close().await {
            errs.push(Error::DialerClose(err));
        }

        // Drain window: listeners stay open and keep accepting while
        // in-flight connections finish.
        if !self.conf.wait_on_close.is_zero() {
            let deadline = Instant::now() + self.conf.wait_on_close;
            while self.count.snapshot().0 > 0 && Instant::now() < deadline {
                tokio::time::sleep(DRAIN_TICK).await;
            }
        }

        for mount in &self.mounts {
            if let Err(err) = mount.close() {
                errs.push(err.for_instance(mount.instance().clone()));
            }
        }

        if let Some(fuse) = &self.fuse {
            fuse.shutdown(&mut errs).await;
        }

        let (open, _) = self.count.snapshot();
        if open > 0 && !self.conf.wait_on_close.is_zero() {
            errs.push(Error::ConnectionsStillOpen(open));
        }

        errs.into_result()
    }

    /// Atomic snapshot of `(open, max)` client connections.
    pub fn connection_count(&self) -> (u64, u64) {
        self.count.snapshot()
    }

    /// Number of configured (non on-demand) instances being served.
    pub fn instance_count(&self) -> usize {
        self.mounts.len()
    }

    /// The bound address of every mount, in configuration order.
    pub fn mount_addrs(&self) -> Vec<(InstanceName, crate::mount::ListenAddr)> {
        self.mounts
            .iter()
            .map(|m| (m.instance().clone(), m.addr().clone()))
            .collect()
    }

    /// Dial every mount in parallel, closing each stream immediately.
    /// Returns how many instances were checked and the aggregated
    /// failures, if any.
    pub async fn check_connections(&self) -> (usize, Result<(), MultiError>) {
        let checks = self.mounts.iter().map(|mount| {
            let dialer = Arc::clone(&self.dialer);
            let mount = Arc::clone(mount);
            async move { Self::dial_check(&dialer, &mount).await }
        });

        let mut errs = MultiError::default();
        for result in futures::future::join_all(checks).await {
            if let Err(err) = result {
                errs.push(err);
            }
        }
        (self.mounts.len(), errs.into_result())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dial::{BoxedStream, DialOpts};
    use crate::mount::ListenAddr;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct FakeDialer {
        flavors: HashMap<String, String>,
        fail_dial: HashSet<String>,
        dials: AtomicUsize,
        closed: AtomicUsize,
    }

    impl FakeDialer {
        fn new(flavors: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(FakeDialer {
                flavors: flavors
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                fail_dial: HashSet::new(),
                dials: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Dialer for FakeDialer {
        async fn dial(
            &self,
            instance: &InstanceName,
            _opts: &DialOpts,
        ) -> Result<BoxedStream, DialError> {
            if self.fail_dial.contains(&instance.to_string()) {
                return Err(DialError::NotFound(instance.clone()));
            }
            self.dials.fetch_add(1, Ordering::SeqCst);
            let (near, mut far) = tokio::io::duplex(1024);
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = far.read(&mut buf).await {
                    if n == 0 || far.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
            Ok(Box::new(near))
        }

        async fn engine_version(&self, instance: &InstanceName) -> Result<String, DialError> {
            self.flavors
                .get(&instance.to_string())
                .cloned()
                .ok_or_else(|| DialError::NotFound(instance.clone()))
        }

        async fn close(&self) -> Result<(), DialError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn conf_for(instances: &[&str], f: impl FnOnce(&mut GlobalConfig)) -> GlobalConfig {
        let mut conf = GlobalConfig {
            instances: instances
                .iter()
                .map(|raw| InstanceConfig::new(raw.parse().unwrap()))
                .collect(),
            ..Default::default()
        };
        f(&mut conf);
        conf
    }

    fn tcp_port(mount: &Mount) -> u16 {
        match mount.addr() {
            ListenAddr::Tcp(addr) => addr.port(),
            ListenAddr::Unix(_) => panic!("expected tcp"),
        }
    }

    #[tokio::test]
    async fn smoke_accept_dial_splice() {
        let dialer = FakeDialer::new(&[("p:r:pg", "POSTGRES_16")]);
        // An explicit zero port gets an ephemeral port, keeping the test
        // off the flavor-default ports.
        let mut conf = conf_for(&["p:r:pg"], |_| {});
        conf.instances[0].port = Some(0);

        let broker = Arc::new(Broker::new(dialer.clone(), conf, None).await.unwrap());
        let port = tcp_port(&broker.mounts[0]);

        let started = Arc::new(AtomicUsize::new(0));
        let started_hook = Arc::clone(&started);
        let serving = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                broker
                    .serve(move || {
                        started_hook.fetch_add(1, Ordering::SeqCst);
                    })
                    .await
            })
        };

        let mut client = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        client.write_all(b"select 1").await.unwrap();
        let mut buf = [0u8; 8];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"select 1");

        assert_eq!(broker.connection_count().0, 1);
        drop(client);

        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.connection_count().0 != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(started.load(Ordering::SeqCst), 1);
        broker.close().await.unwrap();
        assert_eq!(dialer.closed.load(Ordering::SeqCst), 1);

        // The accept loop reports the closed listener once shut down.
        let err = serving.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ListenerClosed), "{err}");
    }

    #[tokio::test]
    async fn flavor_default_ports_bump_in_config_order() {
        let dialer = FakeDialer::new(&[
            ("p:r:pg", "POSTGRES_16"),
            ("p:r:pg2", "POSTGRES_14"),
            ("p:r:my", "MYSQL_8_0"),
        ]);
        let conf = conf_for(&["p:r:pg", "p:r:pg2", "p:r:my"], |_| {});

        let broker = match Broker::new(dialer, conf, None).await {
            Ok(broker) => broker,
            // The conventional ports may be taken on a developer machine;
            // the allocator policy itself is covered in ports.rs.
            Err(Error::Instance { source, .. }) if matches!(source.as_ref(), Error::Bind { .. }) => {
                return;
            }
            Err(err) => panic!("{err}"),
        };

        let ports: Vec<u16> = broker.mounts.iter().map(|m| tcp_port(m)).collect();
        assert_eq!(ports, vec![5432, 5433, 3306]);
        broker.close().await.unwrap();
    }

    #[tokio::test]
    async fn failed_instance_aborts_and_closes_earlier_mounts() {
        let dialer = FakeDialer::new(&[("p:r:a", "POSTGRES_16"), ("p:r:b", "POSTGRES_16")]);
        let dir = tempfile::tempdir().unwrap();

        let mut conf = conf_for(&["p:r:a", "p:r:b"], |_| {});
        conf.instances[0].unix_socket_dir = Some(dir.path().to_path_buf());
        conf.instances[1].unix_socket_dir = Some(PathBuf::from("/does-not-exist"));

        let err = Broker::new(dialer.clone(), conf.clone(), None)
            .await
            .unwrap_err();
        assert!(
            matches!(&err, Error::Instance { instance, .. } if instance.to_string() == "p:r:b"),
            "{err}"
        );
        // The first instance's socket directory was cleaned up again.
        assert!(!dir.path().join("p:r:a").exists());

        conf.skip_failed_instance_config = true;
        let broker = Broker::new(dialer, conf, None).await.unwrap();
        assert_eq!(broker.instance_count(), 1);
        broker.close().await.unwrap();
    }

    #[tokio::test]
    async fn check_connections_counts_failures() {
        let mut dialer = FakeDialer {
            flavors: [
                ("p:r:ok".to_string(), "POSTGRES_16".to_string()),
                ("p:r:bad".to_string(), "POSTGRES_16".to_string()),
            ]
            .into_iter()
            .collect(),
            fail_dial: HashSet::new(),
            dials: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        };
        dialer.fail_dial.insert("p:r:bad".to_string());
        let dialer = Arc::new(dialer);

        let mut conf = conf_for(&["p:r:ok", "p:r:bad"], |_| {});
        conf.instances[0].port = Some(0);
        conf.instances[1].port = Some(0);

        let broker = Broker::new(dialer, conf, None).await.unwrap();
        let (total, result) = broker.check_connections().await;
        assert_eq!(total, 2);
        let errs = result.unwrap_err();
        assert_eq!(errs.0.len(), 1);
        broker.close().await.unwrap();
    }

    #[tokio::test]
    async fn run_connection_test_fails_fast() {
        let mut dialer = FakeDialer {
            flavors: [("p:r:bad".to_string(), "POSTGRES_16".to_string())]
                .into_iter()
                .collect(),
            fail_dial: HashSet::new(),
            dials: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        };
        dialer.fail_dial.insert("p:r:bad".to_string());
        let dialer = Arc::new(dialer);

        let mut conf = conf_for(&["p:r:bad"], |c| c.run_connection_test = true);
        conf.instances[0].port = Some(0);

        let broker = Broker::new(dialer, conf, None).await.unwrap();
        let err = broker.serve(|| {}).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionTest { .. }), "{err}");
        broker.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_reports_connections_still_open() {
        let dialer = FakeDialer::new(&[("p:r:pg", "POSTGRES_16")]);
        let mut conf = conf_for(&["p:r:pg"], |c| {
            c.wait_on_close = Duration::from_millis(300);
        });
        conf.instances[0].port = Some(0);

        let broker = Arc::new(Broker::new(dialer, conf, None).await.unwrap());
        let port = tcp_port(&broker.mounts[0]);

        let serving = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.serve(|| {}).await })
        };

        let mut client = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        client.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        client.read_exact(&mut buf).await.unwrap();

        let errs = broker.close().await.unwrap_err();
        assert!(
            errs.0
                .iter()
                .any(|e| matches!(e, Error::ConnectionsStillOpen(1))),
            "{errs}"
        );

        drop(client);
        serving.abort();
    }

    #[tokio::test]
    async fn graceful_drain_completes_in_flight_splice() {
        let dialer = FakeDialer::new(&[("p:r:pg", "POSTGRES_16")]);
        let mut conf = conf_for(&["p:r:pg"], |c| {
            c.wait_on_close = Duration::from_secs(5);
        });
        conf.instances[0].port = Some(0);

        let broker = Arc::new(Broker::new(dialer, conf, None).await.unwrap());
        let port = tcp_port(&broker.mounts[0]);

        let serving = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.serve(|| {}).await })
        };

        let mut client = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        client.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        client.read_exact(&mut buf).await.unwrap();

        // Close in the background while the client is still connected.
        let closing = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.close().await })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(client);

        closing.await.unwrap().unwrap();
        let _ = serving.await;
    }
}
