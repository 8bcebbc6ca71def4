// src/logging.rs
//! Tracing subscriber setup
//!
//! Full-screen sessions log to a file so output never lands on the
//! display; plain sessions log to stderr. `RUST_LOG` overrides the
//! default filter.

use crate::error::{Result, TrackerError};
use std::{
    fs::OpenOptions,
    path::{Path, PathBuf},
    sync::Mutex,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const DEFAULT_FILTER: &str = "fleet_tracker=info";

/// Where log lines go
#[derive(Debug, Clone, PartialEq)]
pub enum LogTarget {
    Stderr,
    File(PathBuf),
}

pub fn default_log_file(config_dir: &Path) -> PathBuf {
    config_dir.join("logs").join("fleet-tracker.log")
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

pub fn init_logging(target: &LogTarget) -> Result<()> {
    let result = match target {
        LogTarget::Stderr => tracing_subscriber::registry()
            .with(env_filter())
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        LogTarget::File(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;

            tracing_subscriber::registry()
                .with(env_filter())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .try_init()
        }
    };
    result.map_err(|e| TrackerError::Other(format!("Failed to initialize logging: {}", e)))
}
