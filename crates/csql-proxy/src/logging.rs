//! Logging setup shared by the proxy and its subcommands.

#[derive(Debug, Clone, Copy)]
pub struct LogArgs {
    /// Emit JSON lines instead of text.
    pub structured: bool,
    /// Log errors only.
    pub quiet: bool,
    /// Lower the floor to debug.
    pub debug: bool,
}

/// Initializes logging on stderr. Panics if called twice.
pub fn init_logging(args: &LogArgs) {
    let level = if args.quiet {
        "error"
    } else if args.debug {
        "debug"
    } else {
        "info"
    };

    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(level)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_target(false);

    if args.structured {
        builder.json().flatten_event(true).init();
    } else {
        // Colors only when a person is watching.
        builder.compact().with_ansi(atty::is(atty::Stream::Stderr)).init();
    }
}
