//! Tracing subscriber setup for the `etude` binary.
//!
//! `RUST_LOG` always wins over the configured level:
//!
//! ```bash
//! RUST_LOG=etude_core=debug etude serve --root ./www
//! ```

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber: stdout when `verbose`, plus an appending,
/// non-ANSI file layer when `log_file` is set.
pub fn init(level: &str, verbose: bool, log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stdout = verbose.then(|| fmt::layer().with_target(true));
    let file = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout)
        .with(file)
        .try_init()
        .context("logging already initialized")?;
    Ok(())
}
