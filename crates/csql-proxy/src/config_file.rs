//! Optional config file, merged beneath flags and environment variables.
//! Keys mirror flag names; the format follows the file extension.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::parser::ValueSource;
use clap::ArgMatches;
use url::Url;

use crate::cli::Cli;

#[derive(Debug, Default, serde::Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileConfig {
    pub instances: Option<Vec<String>>,

    pub address: Option<IpAddr>,
    pub port: Option<u16>,
    pub unix_socket: Option<PathBuf>,
    pub auto_iam_authn: Option<bool>,
    pub private_ip: Option<bool>,
    pub psc: Option<bool>,

    pub token: Option<String>,
    pub credentials_file: Option<PathBuf>,
    pub credentials_json: Option<String>,
    pub gcloud_auth: Option<bool>,
    pub impersonate_service_account: Option<String>,

    pub max_connections: Option<u64>,
    #[serde(default, with = "humantime_serde::option")]
    pub max_sigterm_delay: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    pub min_sigterm_delay: Option<Duration>,

    pub fuse: Option<PathBuf>,
    pub fuse_tmp_dir: Option<PathBuf>,

    pub health_check: Option<bool>,
    pub prometheus: Option<bool>,
    pub prometheus_namespace: Option<String>,
    pub http_address: Option<IpAddr>,
    pub http_port: Option<u16>,
    pub admin_port: Option<u16>,
    pub debug: Option<bool>,
    pub quitquitquit: Option<bool>,

    pub run_connection_test: Option<bool>,
    pub lazy_refresh: Option<bool>,
    pub skip_failed_instance_config: Option<bool>,

    pub structured_logs: Option<bool>,
    pub quiet: Option<bool>,
    pub debug_logs: Option<bool>,

    pub telemetry_project: Option<String>,
    pub telemetry_prefix: Option<String>,
    pub telemetry_sample_rate: Option<u64>,
    pub disable_traces: Option<bool>,
    pub disable_metrics: Option<bool>,

    pub user_agent: Option<String>,
    pub api_endpoint: Option<Url>,
    pub universe_domain: Option<String>,
    pub quota_project: Option<String>,
    pub exit_zero_on_sigterm: Option<bool>,
}

pub fn load(path: &Path) -> anyhow::Result<FileConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let parsed = match ext.as_str() {
        "toml" => toml::from_str(&raw).map_err(anyhow::Error::from),
        "yaml" | "yml" => serde_yaml::from_str(&raw).map_err(anyhow::Error::from),
        "json" => serde_json::from_str(&raw).map_err(anyhow::Error::from),
        other => anyhow::bail!("unsupported config file extension '{other}'"),
    };
    parsed.with_context(|| format!("failed to parse config file {}", path.display()))
}

/// True when neither a flag nor an environment variable set this arg, so
/// a config-file value may apply.
fn flag_unset(matches: &ArgMatches, id: &str) -> bool {
    !matches!(
        matches.value_source(id),
        Some(ValueSource::CommandLine | ValueSource::EnvVariable)
    )
}

/// Apply file values beneath whatever flags and environment already set.
pub fn merge(cli: &mut Cli, matches: &ArgMatches, file: FileConfig) {
    macro_rules! merge_field {
        ($field:ident) => {
            if flag_unset(matches, stringify!($field)) {
                if let Some(value) = file.$field {
                    cli.$field = value;
                }
            }
        };
        (option $field:ident) => {
            if flag_unset(matches, stringify!($field)) {
                if file.$field.is_some() {
                    cli.$field = file.$field;
                }
            }
        };
    }

    if cli.instances.is_empty() {
        if let Some(instances) = file.instances {
            cli.instances = instances;
        }
    }

    merge_field!(address);
    merge_field!(port);
    merge_field!(option unix_socket);
    merge_field!(auto_iam_authn);
    merge_field!(private_ip);
    merge_field!(psc);

    merge_field!(option token);
    merge_field!(option credentials_file);
    merge_field!(option credentials_json);
    merge_field!(gcloud_auth);
    merge_field!(option impersonate_service_account);

    merge_field!(max_connections);
    merge_field!(max_sigterm_delay);
    merge_field!(min_sigterm_delay);

    merge_field!(option fuse);
    merge_field!(fuse_tmp_dir);

    merge_field!(health_check);
    merge_field!(prometheus);
    merge_field!(option prometheus_namespace);
    merge_field!(http_address);
    merge_field!(http_port);
    merge_field!(admin_port);
    merge_field!(debug);
    merge_field!(quitquitquit);

    merge_field!(run_connection_test);
    merge_field!(lazy_refresh);
    merge_field!(skip_failed_instance_config);

    merge_field!(structured_logs);
    merge_field!(quiet);
    merge_field!(debug_logs);

    merge_field!(option telemetry_project);
    merge_field!(option telemetry_prefix);
    merge_field!(telemetry_sample_rate);
    merge_field!(disable_traces);
    merge_field!(disable_metrics);

    merge_field!(option user_agent);
    merge_field!(option api_endpoint);
    merge_field!(option universe_domain);
    merge_field!(option quota_project);
    merge_field!(exit_zero_on_sigterm);
}

#[cfg(test)]
mod test {
    use super::*;
    use clap::{CommandFactory, FromArgMatches};
    use pretty_assertions::assert_eq;

    fn parse_with(args: &[&str]) -> (Cli, ArgMatches) {
        let matches = Cli::command()
            .try_get_matches_from(std::iter::once("csql-proxy").chain(args.iter().copied()))
            .unwrap();
        let cli = Cli::from_arg_matches(&matches).unwrap();
        (cli, matches)
    }

    fn write_config(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn toml_yaml_and_json_files_load() {
        let dir = tempfile::tempdir().unwrap();

        let toml = write_config(&dir, "c.toml", "debug = true\nport = 6000\n");
        assert_eq!(load(&toml).unwrap().port, Some(6000));

        let yaml = write_config(&dir, "c.yaml", "debug: true\nport: 6000\n");
        assert_eq!(load(&yaml).unwrap().debug, Some(true));

        let json = write_config(&dir, "c.json", r#"{"debug": true, "port": 6000}"#);
        assert_eq!(load(&json).unwrap().port, Some(6000));

        let err = load(&write_config(&dir, "c.ini", "debug=true")).unwrap_err();
        assert!(err.to_string().contains("unsupported"), "{err}");
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "c.toml", "no-such-flag = 1\n");
        assert!(load(&path).is_err());
    }

    #[test]
    fn file_fills_in_unset_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "c.toml",
            "debug = true\nmax-connections = 7\nmax-sigterm-delay = \"30s\"\n",
        );

        let (mut cli, matches) = parse_with(&["p:r:i"]);
        merge(&mut cli, &matches, load(&path).unwrap());

        assert!(cli.debug);
        assert_eq!(cli.max_connections, 7);
        assert_eq!(cli.max_sigterm_delay, Duration::from_secs(30));
    }

    #[test]
    fn flags_beat_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "c.toml", "debug = true\nport = 6000\n");

        let (mut cli, matches) = parse_with(&["--debug=false", "--port", "7000", "p:r:i"]);
        merge(&mut cli, &matches, load(&path).unwrap());

        assert!(!cli.debug);
        assert_eq!(cli.port, 7000);
    }

    #[test]
    #[serial_test::serial]
    fn environment_beats_the_file_and_flags_beat_both() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "c.toml", "debug = true\n");

        std::env::set_var("CSQL_PROXY_DEBUG", "false");

        let (mut cli, matches) = parse_with(&["p:r:i"]);
        merge(&mut cli, &matches, load(&path).unwrap());
        assert!(!cli.debug, "env should override the file");

        let (mut cli, matches) = parse_with(&["--debug", "p:r:i"]);
        merge(&mut cli, &matches, load(&path).unwrap());
        assert!(cli.debug, "an explicit flag should override the env");

        std::env::remove_var("CSQL_PROXY_DEBUG");
    }

    #[test]
    fn file_instances_apply_only_without_positionals() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "c.toml", "instances = [\"a:b:c\"]\n");

        let (mut cli, matches) = parse_with(&[]);
        merge(&mut cli, &matches, load(&path).unwrap());
        assert_eq!(cli.instances, vec!["a:b:c"]);

        let (mut cli, matches) = parse_with(&["x:y:z"]);
        merge(&mut cli, &matches, load(&path).unwrap());
        assert_eq!(cli.instances, vec!["x:y:z"]);
    }
}
