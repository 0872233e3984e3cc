use std::process::ExitCode;

use clap::{CommandFactory, FromArgMatches};

use csql_proxy::cli::{Cli, Command};
use csql_proxy::logging::{init_logging, LogArgs};
use csql_proxy::{admin, config_file, lifecycle};

#[tokio::main]
async fn main() -> ExitCode {
    let matches = Cli::command().get_matches();
    let mut cli = match Cli::from_arg_matches(&matches) {
        Ok(cli) => cli,
        Err(err) => err.exit(),
    };

    if let Some(path) = cli.config_file.clone() {
        match config_file::load(&path) {
            Ok(file) => config_file::merge(&mut cli, &matches, file),
            Err(err) => {
                eprintln!("{err:#}");
                return ExitCode::FAILURE;
            }
        }
    }

    init_logging(&LogArgs {
        structured: cli.structured_logs,
        quiet: cli.quiet,
        debug: cli.debug_logs,
    });

    let result = match cli.command.take() {
        Some(Command::Wait(args)) => {
            admin::wait_for_ready(cli.http_address, cli.http_port, args.max)
                .await
                .map(|()| 0)
        }
        Some(Command::Shutdown(args)) => admin::request_shutdown(cli.admin_port, args.wait)
            .await
            .map(|()| 0),
        None => match cli.validate() {
            Ok(()) => lifecycle::run(cli).await,
            Err(err) => {
                eprintln!("{err}");
                return ExitCode::FAILURE;
            }
        },
    };

    match result {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            // A signal during startup is not a failure of the proxy
            // itself; it exits with the signal's code.
            if let Some(interrupted) = err.downcast_ref::<lifecycle::StartupInterrupted>() {
                return ExitCode::from(interrupted.exit_code as u8);
            }
            tracing::error!(error = ?err, "exiting with an error");
            ExitCode::FAILURE
        }
    }
}
