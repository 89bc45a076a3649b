//! Tracing set-up for screen and log-file output.
//!
//! Screen verbosity and log-file verbosity are chosen independently with the
//! same five levels. `RUST_LOG`, when set, overrides the screen level.

use std::fs::File;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::ValueEnum;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// How much the run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum InfoLevel {
    /// Nothing.
    None,
    /// Warnings and failures only.
    Critical,
    /// Progress messages such as "Iteration 3...".
    Progress,
    /// Also every external command line (`>>>`) and its output.
    Atask,
    /// Everything.
    Debug,
}

impl InfoLevel {
    pub fn directive(self) -> &'static str {
        match self {
            InfoLevel::None => "off",
            InfoLevel::Critical => "warn",
            InfoLevel::Progress => "info",
            InfoLevel::Atask => "debug",
            InfoLevel::Debug => "trace",
        }
    }
}

/// Initialize the global subscriber.
///
/// The log file, if any, is truncated and written without ANSI colours.
/// When `file` is given with [`InfoLevel::None`] no file is created.
pub fn init(screen: InfoLevel, file: Option<(&Path, InfoLevel)>) -> Result<()> {
    let screen_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(screen.directive()));
    let screen_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .compact()
        .with_target(false)
        .with_filter(screen_filter);

    let file_layer = match file {
        Some((path, level)) if level != InfoLevel::None => {
            let handle =
                File::create(path).with_context(|| format!("create log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_writer(Mutex::new(handle))
                    .with_ansi(false)
                    .with_filter(EnvFilter::new(level.directive())),
            )
        }
        _ => None,
    };

    tracing_subscriber::registry()
        .with(screen_layer)
        .with(file_layer)
        .try_init()
        .context("install tracing subscriber")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_map_to_filter_directives() {
        assert_eq!(InfoLevel::None.directive(), "off");
        assert_eq!(InfoLevel::Progress.directive(), "info");
        assert_eq!(InfoLevel::Atask.directive(), "debug");
    }

    #[test]
    fn levels_parse_case_insensitively() {
        assert_eq!(
            InfoLevel::from_str("atask", true).expect("parse"),
            InfoLevel::Atask
        );
        assert_eq!(
            InfoLevel::from_str("CRITICAL", true).expect("parse"),
            InfoLevel::Critical
        );
    }
}
