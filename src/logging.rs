//! Tracing subscriber setup.
//!
//! The filter is taken from `SLOTWARDEN_LOG`, then `RUST_LOG`, then `info`
//! (`debug` with `--verbose`). Console output goes to stderr so a worker's
//! logs land in the slot log the supervisor hands it. The supervisor also
//! writes a daily-rolling file through a non-blocking appender; keep the
//! returned guard alive for as long as logs should be flushed.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

pub const LOG_ENV: &str = "SLOTWARDEN_LOG";

#[derive(Debug, Clone, Copy, Default)]
pub struct LogOptions<'a> {
    pub verbose: bool,
    pub json: bool,
    /// Colour console output. Off for workers, whose stderr is a file.
    pub ansi: bool,
    /// Directory for a rolling `<prefix>.<date>` file, if any.
    pub file_dir: Option<&'a Path>,
    pub file_prefix: &'a str,
}

fn env_filter(verbose: bool) -> EnvFilter {
    if verbose {
        return EnvFilter::new("debug");
    }
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Calling it twice is harmless; the second
/// call is ignored.
pub fn init(opts: LogOptions<'_>) -> Option<WorkerGuard> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> =
        vec![env_filter(opts.verbose).boxed()];

    let console = fmt::layer().with_writer(std::io::stderr);
    if opts.json {
        layers.push(console.json().boxed());
    } else {
        layers.push(console.with_ansi(opts.ansi).boxed());
    }

    let mut guard = None;
    if let Some(dir) = opts.file_dir {
        match std::fs::create_dir_all(dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(dir, opts.file_prefix);
                let (writer, g) = tracing_appender::non_blocking(appender);
                guard = Some(g);
                let file = fmt::layer().with_ansi(false).with_writer(writer);
                if opts.json {
                    layers.push(file.json().boxed());
                } else {
                    layers.push(file.boxed());
                }
            }
            Err(e) => eprintln!(
                "warning: cannot create log directory {}: {}",
                dir.display(),
                e
            ),
        }
    }

    let _ = tracing_subscriber::registry().with(layers).try_init();
    guard
}
