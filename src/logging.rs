//! Log sink setup.
//!
//! Server code logs through `tracing` macros; this module installs the
//! subscriber that turns those events into console and file output.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter directive for the given level
pub fn filter_directive(level: &str) -> String {
    format!("kvfront={},kvfront_server={},feoxdb=info", level, level)
}

/// Install the global subscriber.
///
/// When `log_file` is given, events are appended to it without ANSI colouring
/// in addition to the console output.
pub fn init(level: &str, log_file: Option<&Path>) -> anyhow::Result<()> {
    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(filter_directive(level))?)
        .with(fmt::layer())
        .with(file_layer)
        .try_init()?;

    Ok(())
}
