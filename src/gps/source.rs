// src/gps/source.rs
//! Continuous position observation: the seam between devices and the sampler

use super::sample::PositionFix;
use crate::error::TrackerError;
use std::{fmt, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};

/// Capacity of the channel between a source's reader task and its consumer
pub const WATCH_CHANNEL_CAPACITY: usize = 64;

/// Options passed to a source when observation starts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchOptions {
    pub high_accuracy: bool,
    /// Report `PositionError::Timeout` when no fix arrives within this window
    pub timeout: Duration,
    /// Fixes older than this are treated as cached and skipped; zero disables the check
    pub maximum_age: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            timeout: Duration::from_secs(10),
            maximum_age: Duration::ZERO,
        }
    }
}

impl WatchOptions {
    /// Whether a fix is too old to be used as a live reading
    pub fn is_stale(&self, fix: &PositionFix) -> bool {
        !self.maximum_age.is_zero() && fix.age_ms() > self.maximum_age.as_millis() as i64
    }
}

/// Errors reported on a source's error channel
#[derive(Debug, Clone, PartialEq)]
pub enum PositionError {
    UnsupportedCapability(String),
    PermissionDenied(String),
    TemporarilyUnavailable(String),
    Timeout,
}

impl PositionError {
    /// Fatal errors end the tracking session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PositionError::UnsupportedCapability(_) | PositionError::PermissionDenied(_)
        )
    }

    /// Map an OS error from opening a device into the capability taxonomy
    pub fn from_open_error(what: &str, error: &std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::PermissionDenied => {
                PositionError::PermissionDenied(format!("{}: {}", what, error))
            }
            _ => PositionError::UnsupportedCapability(format!("{}: {}", what, error)),
        }
    }
}

impl fmt::Display for PositionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionError::UnsupportedCapability(msg) => write!(f, "Positioning not supported: {}", msg),
            PositionError::PermissionDenied(msg) => write!(f, "Location permission denied: {}", msg),
            PositionError::TemporarilyUnavailable(msg) => write!(f, "Position unavailable: {}", msg),
            PositionError::Timeout => write!(f, "Timed out waiting for a position"),
        }
    }
}

impl std::error::Error for PositionError {}

impl From<PositionError> for TrackerError {
    fn from(error: PositionError) -> Self {
        if error.is_fatal() {
            TrackerError::Capability(error.to_string())
        } else {
            TrackerError::TransientPositioning(error.to_string())
        }
    }
}

pub type PositionEvent = Result<PositionFix, PositionError>;

/// An active observation. Events arrive in device order; dropping the
/// watch (or calling `detach`) stops the reader task immediately.
pub struct PositionWatch {
    events: mpsc::Receiver<PositionEvent>,
    reader: Option<JoinHandle<()>>,
}

impl PositionWatch {
    pub fn new(events: mpsc::Receiver<PositionEvent>, reader: JoinHandle<()>) -> Self {
        Self {
            events,
            reader: Some(reader),
        }
    }

    /// Wait for the next fix or error; `None` once the source has ended
    pub async fn next(&mut self) -> Option<PositionEvent> {
        self.events.recv().await
    }

    /// Split into the event receiver and a handle that stops the reader
    pub fn into_parts(mut self) -> (mpsc::Receiver<PositionEvent>, WatchHandle) {
        let reader = self.reader.take();
        let (_tx, placeholder) = mpsc::channel(1);
        let events = std::mem::replace(&mut self.events, placeholder);
        (events, WatchHandle { reader })
    }

    pub fn detach(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.events.close();
    }
}

impl Drop for PositionWatch {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Stops a source's reader task when detached or dropped
pub struct WatchHandle {
    reader: Option<JoinHandle<()>>,
}

impl WatchHandle {
    pub fn detach(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.detach();
    }
}

/// A device capability that can be observed continuously
pub trait PositionSource: Send + 'static {
    /// Human readable name used in status lines
    fn name(&self) -> String;

    /// Begin observation. Fails up front when the device cannot be used at all.
    fn watch(self, options: &WatchOptions) -> Result<PositionWatch, PositionError>;
}
