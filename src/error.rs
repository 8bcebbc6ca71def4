// src/error.rs
//! Error types for the fleet tracker

use std::fmt;

pub type Result<T> = std::result::Result<T, TrackerError>;

#[derive(Debug)]
pub enum TrackerError {
    /// Bad entity identifier, out-of-range coordinates, invalid request
    Validation(String),
    /// No positioning support or permission denied; fatal to the session
    Capability(String),
    /// Timeout or temporarily unavailable position; the session continues
    TransientPositioning(String),
    /// A location update could not be delivered
    Transport(String),
    /// Map library failed to load or a map object failed to construct
    Render(String),
    Config(String),
    Io(std::io::Error),
    Serial(tokio_serial::Error),
    Json(serde_json::Error),
    Http(reqwest::Error),
    Other(String),
}

impl TrackerError {
    /// Whether the error ends a tracking session
    pub fn is_fatal(&self) -> bool {
        matches!(self, TrackerError::Capability(_))
    }
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerError::Validation(msg) => write!(f, "Validation error: {}", msg),
            TrackerError::Capability(msg) => write!(f, "Positioning unavailable: {}", msg),
            TrackerError::TransientPositioning(msg) => write!(f, "Positioning problem: {}", msg),
            TrackerError::Transport(msg) => write!(f, "Transport error: {}", msg),
            TrackerError::Render(msg) => write!(f, "Map error: {}", msg),
            TrackerError::Config(msg) => write!(f, "Config error: {}", msg),
            TrackerError::Io(e) => write!(f, "IO error: {}", e),
            TrackerError::Serial(e) => write!(f, "Serial error: {}", e),
            TrackerError::Json(e) => write!(f, "JSON error: {}", e),
            TrackerError::Http(e) => write!(f, "HTTP error: {}", e),
            TrackerError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for TrackerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrackerError::Io(e) => Some(e),
            TrackerError::Serial(e) => Some(e),
            TrackerError::Json(e) => Some(e),
            TrackerError::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TrackerError {
    fn from(error: std::io::Error) -> Self {
        TrackerError::Io(error)
    }
}

impl From<tokio_serial::Error> for TrackerError {
    fn from(error: tokio_serial::Error) -> Self {
        TrackerError::Serial(error)
    }
}

impl From<serde_json::Error> for TrackerError {
    fn from(error: serde_json::Error) -> Self {
        TrackerError::Json(error)
    }
}

impl From<reqwest::Error> for TrackerError {
    fn from(error: reqwest::Error) -> Self {
        TrackerError::Http(error)
    }
}

impl From<anyhow::Error> for TrackerError {
    fn from(error: anyhow::Error) -> Self {
        TrackerError::Other(error.to_string())
    }
}
