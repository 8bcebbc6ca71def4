// src/sampler/status.rs
//! User-facing state of a tracking session

use crate::gps::PositionFix;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Warning,
    Error,
}

/// The latest line shown to the user
#[derive(Debug, Clone, PartialEq)]
pub struct StatusMessage {
    pub level: StatusLevel,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// Shared between the sampler and whatever displays it
#[derive(Debug, Clone, Default)]
pub struct TrackingStatus {
    pub entity_id: Option<String>,
    pub source: Option<String>,
    pub active: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub updates_sent: u64,
    pub samples_seen: u64,
    pub samples_dropped: u64,
    pub samples_rejected: u64,
    pub transport_failures: u64,
    pub last_sent: Option<PositionFix>,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub message: Option<StatusMessage>,
}

impl TrackingStatus {
    /// Fresh counters for a new session
    pub fn started(entity_id: &str, source: String) -> Self {
        Self {
            entity_id: Some(entity_id.to_string()),
            source: Some(source),
            active: true,
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn set_message(&mut self, level: StatusLevel, text: impl Into<String>) {
        self.message = Some(StatusMessage {
            level,
            text: text.into(),
            at: Utc::now(),
        });
    }

    /// Session duration formatted for display
    pub fn format_duration(&self) -> String {
        let Some(start) = self.started_at else {
            return "-".to_string();
        };
        let total_seconds = Utc::now().signed_duration_since(start).num_seconds().max(0);
        let hours = total_seconds / 3600;
        let minutes = (total_seconds % 3600) / 60;
        let seconds = total_seconds % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, seconds)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else {
            format!("{}s", seconds)
        }
    }
}
