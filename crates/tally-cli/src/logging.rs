//! Tracing subscriber setup.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `LOG_FORMAT` | `text` | `json` or `text` |
//! | `LOG_FILE` | unset | Log file path; enables daily rotation |
//! | `LOG_ANSI` | auto | `true`/`false` override for ANSI colors |
//! | `RUST_LOG` | `tally=info` | Standard env filter |
//!
//! Logs go to stderr (or the file) so stdout carries only command output.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Prefix match: covers every tally_* crate
const DEFAULT_FILTER: &str = "tally=info";

/// Install the global subscriber. Keep the guard alive to flush file output.
pub fn init() -> Option<WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok().filter(|p| !p.trim().is_empty());
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_FILTER.into());
    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let path = Path::new(path);
        let file_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("tally.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            // No ANSI in files unless asked for
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    tracing::debug!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stderr)"),
        "Logging initialized"
    );
    guard
}
