use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::dial::DialOpts;
use crate::instance::InstanceName;

/// Where a mount listens, resolved from instance and global config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenTarget {
    Tcp {
        addr: IpAddr,
        /// Pinned at the instance level, or left to the port allocator.
        port: Option<u16>,
    },
    Unix {
        base: PathBuf,
    },
}

/// Per-instance listener and dial configuration. Immutable after
/// construction; the CLI layer resolves flags, environment, and the config
/// file into these before the broker starts.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub name: InstanceName,
    pub addr: Option<IpAddr>,
    pub port: Option<u16>,
    pub unix_socket_dir: Option<PathBuf>,
    pub unix_socket_path: Option<PathBuf>,
    pub auto_iam_authn: Option<bool>,
    pub private_ip: Option<bool>,
    pub psc: Option<bool>,
}

impl InstanceConfig {
    pub fn new(name: InstanceName) -> Self {
        InstanceConfig {
            name,
            addr: None,
            port: None,
            unix_socket_dir: None,
            unix_socket_path: None,
            auto_iam_authn: None,
            private_ip: None,
            psc: None,
        }
    }

    /// Where this instance listens. A unix socket wins whenever one is
    /// configured, unless the instance itself pins an address or port at
    /// the instance level.
    pub fn listen_target(&self, global: &GlobalConfig) -> ListenTarget {
        let unix_base = self.unix_socket_base(global);
        let instance_tcp = self.addr.is_some() || self.port.is_some();
        let instance_unix = self.unix_socket_path.is_some() || self.unix_socket_dir.is_some();

        match unix_base {
            Some(base) if instance_unix || !instance_tcp => ListenTarget::Unix { base },
            _ => ListenTarget::Tcp {
                addr: self.addr.unwrap_or(global.addr),
                port: self.port,
            },
        }
    }

    /// The base unix socket address for this instance: an explicit path if
    /// set, otherwise `<dir>/<project:region:name>`.
    pub fn unix_socket_base(&self, global: &GlobalConfig) -> Option<PathBuf> {
        if let Some(path) = &self.unix_socket_path {
            return Some(path.clone());
        }
        let dir = self
            .unix_socket_dir
            .as_ref()
            .or(global.unix_socket_dir.as_ref())?;
        Some(dir.join(self.name.to_string()))
    }

    /// Dial options with unset tri-states resolved against the globals.
    pub fn dial_opts(&self, global: &GlobalConfig) -> DialOpts {
        DialOpts {
            auto_iam_authn: self.auto_iam_authn.unwrap_or(global.auto_iam_authn),
            private_ip: self.private_ip.unwrap_or(global.private_ip),
            psc: self.psc.unwrap_or(global.psc),
        }
    }
}

/// Process-wide configuration, resolved once at startup. Immutable.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    /// Default bind address for TCP listeners.
    pub addr: IpAddr,
    /// Global port base; zero selects flavor-default ports.
    pub port: u16,
    /// Default directory for unix socket listeners.
    pub unix_socket_dir: Option<PathBuf>,

    pub auto_iam_authn: bool,
    pub private_ip: bool,
    pub psc: bool,

    /// Maximum concurrently open client connections; zero is unlimited.
    pub max_connections: u64,
    /// Grace period before shutdown begins, letting orchestrators observe
    /// the impending stop through the admin endpoints.
    pub wait_before_close: Duration,
    /// How long shutdown waits for open connections to drain.
    pub wait_on_close: Duration,

    /// Refresh connect info only when a connection needs it, instead of in
    /// background tasks ahead of expiry.
    pub lazy_refresh: bool,
    /// Dial every configured instance before reporting ready.
    pub run_connection_test: bool,
    /// Drop instances whose listener setup fails instead of aborting
    /// startup.
    pub skip_failed_instance_config: bool,

    /// Mount point of the on-demand socket directory, if enabled.
    pub fuse_dir: Option<PathBuf>,
    /// Where the on-demand directory keeps its real unix sockets.
    pub fuse_tmp_dir: PathBuf,

    pub user_agent: String,

    pub instances: Vec<InstanceConfig>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            addr: IpAddr::from([127, 0, 0, 1]),
            port: 0,
            unix_socket_dir: None,
            auto_iam_authn: false,
            private_ip: false,
            psc: false,
            max_connections: 0,
            wait_before_close: Duration::ZERO,
            wait_on_close: Duration::ZERO,
            lazy_refresh: false,
            run_connection_test: false,
            skip_failed_instance_config: false,
            fuse_dir: None,
            fuse_tmp_dir: std::env::temp_dir().join("csql-tmp"),
            user_agent: concat!("csql-proxy/", env!("CARGO_PKG_VERSION")).to_string(),
            instances: Vec::new(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn named(raw: &str) -> InstanceConfig {
        InstanceConfig::new(raw.parse().unwrap())
    }

    #[test]
    fn unix_path_wins_unless_instance_sets_tcp() {
        let global = GlobalConfig {
            unix_socket_dir: Some(PathBuf::from("/sockets")),
            ..Default::default()
        };

        let plain = named("p:r:i");
        assert_eq!(
            plain.listen_target(&global),
            ListenTarget::Unix {
                base: PathBuf::from("/sockets/p:r:i")
            }
        );

        let pinned = InstanceConfig {
            port: Some(5000),
            ..named("p:r:i")
        };
        assert_eq!(
            pinned.listen_target(&global),
            ListenTarget::Tcp {
                addr: global.addr,
                port: Some(5000),
            }
        );

        let explicit_unix = InstanceConfig {
            port: Some(5000),
            unix_socket_dir: Some(PathBuf::from("/other")),
            ..named("p:r:i")
        };
        assert_eq!(
            explicit_unix.listen_target(&global),
            ListenTarget::Unix {
                base: PathBuf::from("/other/p:r:i")
            }
        );
    }

    #[test]
    fn tcp_is_the_default_without_any_unix_config() {
        let global = GlobalConfig::default();
        assert_eq!(
            named("p:r:i").listen_target(&global),
            ListenTarget::Tcp {
                addr: global.addr,
                port: None,
            }
        );
    }

    #[test]
    fn unix_socket_base_joins_instance_name() {
        let global = GlobalConfig {
            unix_socket_dir: Some(PathBuf::from("/sockets")),
            ..Default::default()
        };
        let cfg = named("p:r:i");
        assert_eq!(
            cfg.unix_socket_base(&global).unwrap(),
            PathBuf::from("/sockets/p:r:i")
        );

        let explicit = InstanceConfig {
            unix_socket_path: Some(PathBuf::from("/tmp/my.sock")),
            ..named("p:r:i")
        };
        assert_eq!(
            explicit.unix_socket_base(&global).unwrap(),
            PathBuf::from("/tmp/my.sock")
        );
    }

    #[test]
    fn tri_states_fall_back_to_globals() {
        let global = GlobalConfig {
            private_ip: true,
            ..Default::default()
        };

        let inherit = named("p:r:i");
        assert_eq!(
            inherit.dial_opts(&global),
            DialOpts {
                private_ip: true,
                ..Default::default()
            }
        );

        let overridden = InstanceConfig {
            private_ip: Some(false),
            psc: Some(true),
            ..named("p:r:i")
        };
        assert_eq!(
            overridden.dial_opts(&global),
            DialOpts {
                private_ip: false,
                psc: true,
                auto_iam_authn: false,
            }
        );
    }
}
