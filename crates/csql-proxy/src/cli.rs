//! Command-line surface. Every global flag has a matching
//! `CSQL_PROXY_`-prefixed environment variable; precedence is flag, then
//! environment, then config file, then built-in default.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgGroup, Args, Parser, Subcommand};
use url::Url;

use broker::{GlobalConfig, InstanceConfig, InstanceName};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid command: {0}")]
    BadCommand(String),

    #[error("invalid instance name: '{0}'")]
    InvalidName(String),

    #[error("invalid query for '{instance}': {reason}")]
    InvalidQuery { instance: String, reason: String },

    #[error(
        "only one of --token, --credentials-file, --credentials-json, or \
         --gcloud-auth may be set"
    )]
    MutuallyExclusive,
}

/// A local proxy that authenticates and brokers connections to managed
/// cloud database instances.
#[derive(Debug, Parser)]
#[command(name = "csql-proxy", version)]
#[command(group(
    ArgGroup::new("credentials")
        .args(["token", "credentials_file", "credentials_json", "gcloud_auth"])
        .multiple(false)
))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Instance connection names, each of the form
    /// 'project:region:name[?key=value&...]'.
    #[arg(value_name = "INSTANCE")]
    pub instances: Vec<String>,

    /// Address to bind TCP listeners on.
    #[arg(long, env = "CSQL_PROXY_ADDRESS", default_value = "127.0.0.1")]
    pub address: IpAddr,

    /// Initial port for TCP listeners; 0 picks database defaults
    /// (MySQL 3306, Postgres 5432, SQL Server 1433).
    #[arg(long, short = 'p', env = "CSQL_PROXY_PORT", default_value_t = 0)]
    pub port: u16,

    /// Create unix sockets in this directory, named after each instance.
    #[arg(long, env = "CSQL_PROXY_UNIX_SOCKET")]
    pub unix_socket: Option<PathBuf>,

    /// Authenticate to instances with the IAM principal's identity
    /// instead of a database password.
    #[arg(long, short = 'i', env = "CSQL_PROXY_AUTO_IAM_AUTHN",
          num_args = 0..=1, require_equals = true, default_missing_value = "true", default_value_t = false,
          action = clap::ArgAction::Set)]
    pub auto_iam_authn: bool,

    /// Connect to the private IP address of instances.
    #[arg(long, env = "CSQL_PROXY_PRIVATE_IP",
          num_args = 0..=1, require_equals = true, default_missing_value = "true", default_value_t = false,
          action = clap::ArgAction::Set)]
    pub private_ip: bool,

    /// Connect over each instance's service-connect attachment.
    #[arg(long, env = "CSQL_PROXY_PSC",
          num_args = 0..=1, require_equals = true, default_missing_value = "true", default_value_t = false,
          action = clap::ArgAction::Set)]
    pub psc: bool,

    /// Use this OAuth2 token for all API requests.
    #[arg(long, short = 't', env = "CSQL_PROXY_TOKEN")]
    pub token: Option<String>,

    /// Path to a service account key to use for authentication.
    #[arg(long, short = 'c', env = "CSQL_PROXY_CREDENTIALS_FILE")]
    pub credentials_file: Option<PathBuf>,

    /// Service account key as a JSON object.
    #[arg(long, short = 'j', env = "CSQL_PROXY_CREDENTIALS_JSON")]
    pub credentials_json: Option<String>,

    /// Use the gcloud CLI's active credentials.
    #[arg(long, short = 'g', env = "CSQL_PROXY_GCLOUD_AUTH",
          num_args = 0..=1, require_equals = true, default_missing_value = "true", default_value_t = false,
          action = clap::ArgAction::Set)]
    pub gcloud_auth: bool,

    /// Comma-separated impersonation chain: the first account is the
    /// target, the rest are delegates in reverse order.
    #[arg(long, env = "CSQL_PROXY_IMPERSONATE_SERVICE_ACCOUNT")]
    pub impersonate_service_account: Option<String>,

    /// Limit on concurrently open connections; 0 is unlimited.
    #[arg(long, env = "CSQL_PROXY_MAX_CONNECTIONS", default_value_t = 0)]
    pub max_connections: u64,

    /// Maximum time to wait for connections to close after shutdown
    /// starts.
    #[arg(long, env = "CSQL_PROXY_MAX_SIGTERM_DELAY",
          value_parser = humantime::parse_duration, default_value = "0s")]
    pub max_sigterm_delay: Duration,

    /// Time to wait before starting shutdown, so orchestrators can
    /// observe the stop through the health endpoints.
    #[arg(long, env = "CSQL_PROXY_MIN_SIGTERM_DELAY",
          value_parser = humantime::parse_duration, default_value = "0s")]
    pub min_sigterm_delay: Duration,

    /// Mount an on-demand socket directory at this path.
    #[arg(long, env = "CSQL_PROXY_FUSE")]
    pub fuse: Option<PathBuf>,

    /// Where the on-demand directory keeps its real unix sockets.
    #[arg(long, env = "CSQL_PROXY_FUSE_TMP_DIR", default_value = "/tmp/csql-tmp")]
    pub fuse_tmp_dir: PathBuf,

    /// Serve startup, liveness, and readiness probes on the HTTP port.
    #[arg(long, env = "CSQL_PROXY_HEALTH_CHECK",
          num_args = 0..=1, require_equals = true, default_missing_value = "true", default_value_t = false,
          action = clap::ArgAction::Set)]
    pub health_check: bool,

    /// Serve Prometheus metrics on the HTTP port.
    #[arg(long, env = "CSQL_PROXY_PROMETHEUS",
          num_args = 0..=1, require_equals = true, default_missing_value = "true", default_value_t = false,
          action = clap::ArgAction::Set)]
    pub prometheus: bool,

    /// Label applied to all exported metrics.
    #[arg(long, env = "CSQL_PROXY_PROMETHEUS_NAMESPACE")]
    pub prometheus_namespace: Option<String>,

    /// Address for the health and metrics server.
    #[arg(long, env = "CSQL_PROXY_HTTP_ADDRESS", default_value = "127.0.0.1")]
    pub http_address: IpAddr,

    /// Port for the health and metrics server.
    #[arg(long, env = "CSQL_PROXY_HTTP_PORT", default_value_t = 9090)]
    pub http_port: u16,

    /// Port for the loopback admin server.
    #[arg(long, env = "CSQL_PROXY_ADMIN_PORT", default_value_t = 9091)]
    pub admin_port: u16,

    /// Expose debug endpoints on the admin server.
    #[arg(long, env = "CSQL_PROXY_DEBUG",
          num_args = 0..=1, require_equals = true, default_missing_value = "true", default_value_t = false,
          action = clap::ArgAction::Set)]
    pub debug: bool,

    /// Expose a /quitquitquit endpoint that triggers graceful shutdown.
    #[arg(long, env = "CSQL_PROXY_QUITQUITQUIT",
          num_args = 0..=1, require_equals = true, default_missing_value = "true", default_value_t = false,
          action = clap::ArgAction::Set)]
    pub quitquitquit: bool,

    /// Dial every configured instance before reporting ready.
    #[arg(long, env = "CSQL_PROXY_RUN_CONNECTION_TEST",
          num_args = 0..=1, require_equals = true, default_missing_value = "true", default_value_t = false,
          action = clap::ArgAction::Set)]
    pub run_connection_test: bool,

    /// Refresh connect info only when a connection needs it.
    #[arg(long, env = "CSQL_PROXY_LAZY_REFRESH",
          num_args = 0..=1, require_equals = true, default_missing_value = "true", default_value_t = false,
          action = clap::ArgAction::Set)]
    pub lazy_refresh: bool,

    /// Drop instances whose listener setup fails instead of exiting.
    #[arg(long, env = "CSQL_PROXY_SKIP_FAILED_INSTANCE_CONFIG",
          num_args = 0..=1, require_equals = true, default_missing_value = "true", default_value_t = false,
          action = clap::ArgAction::Set)]
    pub skip_failed_instance_config: bool,

    /// Write logs as JSON lines.
    #[arg(long, env = "CSQL_PROXY_STRUCTURED_LOGS",
          num_args = 0..=1, require_equals = true, default_missing_value = "true", default_value_t = false,
          action = clap::ArgAction::Set)]
    pub structured_logs: bool,

    /// Log errors only.
    #[arg(long, short = 'q', env = "CSQL_PROXY_QUIET",
          num_args = 0..=1, require_equals = true, default_missing_value = "true", default_value_t = false,
          action = clap::ArgAction::Set)]
    pub quiet: bool,

    /// Enable debug logging.
    #[arg(long, env = "CSQL_PROXY_DEBUG_LOGS",
          num_args = 0..=1, require_equals = true, default_missing_value = "true", default_value_t = false,
          action = clap::ArgAction::Set)]
    pub debug_logs: bool,

    /// Project to send metrics and traces to, when an exporter is
    /// configured.
    #[arg(long, env = "CSQL_PROXY_TELEMETRY_PROJECT")]
    pub telemetry_project: Option<String>,

    /// Prefix for exported telemetry metric names.
    #[arg(long, env = "CSQL_PROXY_TELEMETRY_PREFIX")]
    pub telemetry_prefix: Option<String>,

    /// Sample one of every N traces.
    #[arg(long, env = "CSQL_PROXY_TELEMETRY_SAMPLE_RATE", default_value_t = 10_000)]
    pub telemetry_sample_rate: u64,

    /// Disable trace export.
    #[arg(long, env = "CSQL_PROXY_DISABLE_TRACES",
          num_args = 0..=1, require_equals = true, default_missing_value = "true", default_value_t = false,
          action = clap::ArgAction::Set)]
    pub disable_traces: bool,

    /// Disable metric export.
    #[arg(long, env = "CSQL_PROXY_DISABLE_METRICS",
          num_args = 0..=1, require_equals = true, default_missing_value = "true", default_value_t = false,
          action = clap::ArgAction::Set)]
    pub disable_metrics: bool,

    /// User-Agent reported to the control plane.
    #[arg(long, env = "CSQL_PROXY_USER_AGENT")]
    pub user_agent: Option<String>,

    /// Override the control-plane API endpoint.
    #[arg(long, env = "CSQL_PROXY_API_ENDPOINT")]
    pub api_endpoint: Option<Url>,

    /// Universe domain for the control-plane API.
    #[arg(long, env = "CSQL_PROXY_UNIVERSE_DOMAIN")]
    pub universe_domain: Option<String>,

    /// Project billed for API request quota.
    #[arg(long, env = "CSQL_PROXY_QUOTA_PROJECT")]
    pub quota_project: Option<String>,

    /// Exit with code 0 when stopped by SIGTERM.
    #[arg(long, env = "CSQL_PROXY_EXIT_ZERO_ON_SIGTERM",
          num_args = 0..=1, require_equals = true, default_missing_value = "true", default_value_t = false,
          action = clap::ArgAction::Set)]
    pub exit_zero_on_sigterm: bool,

    /// Path to a TOML, YAML, or JSON config file mirroring these flags.
    #[arg(long, env = "CSQL_PROXY_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Block until a running proxy reports liveness, or the deadline
    /// passes.
    Wait(WaitArgs),
    /// Ask a running proxy to shut down gracefully.
    Shutdown(ShutdownArgs),
}

#[derive(Debug, Args)]
pub struct WaitArgs {
    /// Give up after this long.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
    pub max: Duration,
}

#[derive(Debug, Args)]
pub struct ShutdownArgs {
    /// How long to wait for the proxy to finish shutting down.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
    pub wait: Duration,
}

impl Cli {
    /// Checks that clap alone cannot express, re-applied after the config
    /// file merge.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let credential_sources = [
            self.token.is_some(),
            self.credentials_file.is_some(),
            self.credentials_json.is_some(),
            self.gcloud_auth,
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if credential_sources > 1 {
            return Err(ConfigError::MutuallyExclusive);
        }

        if self.command.is_none() && self.instances.is_empty() && self.fuse.is_none() {
            return Err(ConfigError::BadCommand(
                "missing instance name (or --fuse)".to_string(),
            ));
        }
        // The on-demand directory owns all mounts; instance arguments
        // would never be served alongside it.
        if self.fuse.is_some() && !self.instances.is_empty() {
            return Err(ConfigError::BadCommand(
                "instance names may not be specified with --fuse".to_string(),
            ));
        }

        Ok(())
    }

    /// Resolve the merged flags into the broker's immutable config.
    pub fn global_config(&self) -> Result<GlobalConfig, ConfigError> {
        let instances = self
            .instances
            .iter()
            .map(|raw| parse_instance_token(raw))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(GlobalConfig {
            addr: self.address,
            port: self.port,
            unix_socket_dir: self.unix_socket.clone(),
            auto_iam_authn: self.auto_iam_authn,
            private_ip: self.private_ip,
            psc: self.psc,
            max_connections: self.max_connections,
            wait_before_close: self.min_sigterm_delay,
            wait_on_close: self.max_sigterm_delay,
            lazy_refresh: self.lazy_refresh,
            run_connection_test: self.run_connection_test,
            skip_failed_instance_config: self.skip_failed_instance_config,
            fuse_dir: self.fuse.clone(),
            fuse_tmp_dir: self.fuse_tmp_dir.clone(),
            user_agent: self.resolved_user_agent(),
            instances,
        })
    }

    pub fn resolved_user_agent(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(|| concat!("csql-proxy/", env!("CARGO_PKG_VERSION")).to_string())
    }
}

/// Parse one positional instance token:
/// `project:region:name[?key=value&...]`.
pub fn parse_instance_token(raw: &str) -> Result<InstanceConfig, ConfigError> {
    let (name_part, query) = match raw.split_once('?') {
        Some((name, query)) => (name, Some(query)),
        None => (raw, None),
    };

    let name: InstanceName = name_part
        .parse()
        .map_err(|_| ConfigError::InvalidName(name_part.to_string()))?;
    let mut config = InstanceConfig::new(name);

    let Some(query) = query else {
        return Ok(config);
    };

    let invalid = |reason: String| ConfigError::InvalidQuery {
        instance: raw.to_string(),
        reason,
    };

    let mut seen = std::collections::HashSet::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        let key = key.to_ascii_lowercase();
        if !seen.insert(key.clone()) {
            return Err(invalid(format!("duplicate key '{key}'")));
        }
        match key.as_str() {
            "address" => {
                let addr: Ipv4Addr = value
                    .parse()
                    .map_err(|_| invalid(format!("'{value}' is not an IPv4 address")))?;
                config.addr = Some(IpAddr::V4(addr));
            }
            "port" => {
                config.port = Some(
                    value
                        .parse()
                        .map_err(|_| invalid(format!("'{value}' is not a port")))?,
                );
            }
            "unix-socket" => {
                config.unix_socket_dir = Some(PathBuf::from(value.as_ref()));
            }
            "auto-iam-authn" => {
                config.auto_iam_authn = Some(parse_bool_param(&value).map_err(&invalid)?);
            }
            "private-ip" => {
                config.private_ip = Some(parse_bool_param(&value).map_err(&invalid)?);
            }
            "psc" => {
                config.psc = Some(parse_bool_param(&value).map_err(&invalid)?);
            }
            other => return Err(invalid(format!("unknown key '{other}'"))),
        }
    }

    Ok(config)
}

fn parse_bool_param(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "t" | "true" => Ok(true),
        "f" | "false" => Ok(false),
        other => Err(format!("'{other}' is not a boolean")),
    }
}
