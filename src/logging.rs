//! Tracing initialisation for the debris binary.
//!
//! Logs go to stderr so that stdout stays reserved for command output. With a
//! log directory, events are also written to a daily rolling file.

use std::path::Path;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Prefix of the rolling log files, e.g. `debris.log.2024-01-01`.
pub const LOG_FILE_PREFIX: &str = "debris.log";

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` wins over `verbose`. The returned guard flushes the file
/// writer and must be held until the program exits.
///
/// Only the first call in a process takes effect.
pub fn init_tracing(verbose: bool, json: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let default_level = if verbose { Level::DEBUG } else { Level::INFO };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.as_str()));

    let mut layers: Vec<BoxedLayer> = vec![if json {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .json()
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed()
    }];

    let guard = log_dir.map(|dir| {
        let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(if json {
            fmt::layer().with_writer(writer).with_ansi(false).json().boxed()
        } else {
            fmt::layer().with_writer(writer).with_ansi(false).boxed()
        });
        guard
    });

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .ok();

    guard
}
