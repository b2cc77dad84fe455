use llama_cpp_2::{LogOptions, send_logs_to_tracing};
use tracing_subscriber::EnvFilter;

/// Map the `-v` count to a default filter directive.
pub fn level_for(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Install the global tracing subscriber. `RUST_LOG` wins over `-v`.
///
/// llama.cpp is chatty on load, its own log lines are only forwarded from `-vv` on.
pub fn setup_logging(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_for(verbosity)));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbosity >= 2)
        .try_init()
        .is_ok();

    send_logs_to_tracing(LogOptions::default().with_logs_enabled(verbosity >= 2));

    if installed {
        tracing::debug!(verbosity, "logging initialised");
    }
}
