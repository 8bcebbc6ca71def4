// src/display/mod.rs
//! Display modules for different interfaces

pub mod plain;
pub mod terminal;

use chrono::{DateTime, Utc};
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use std::io::IsTerminal;

/// Keyboard actions on the live screens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FleetCommand {
    FitAll,
    /// Zero-based row in the vehicle table
    Focus(usize),
    ToggleAutoCenter,
    Quit,
}

impl FleetCommand {
    pub fn from_key(key: &KeyEvent) -> Option<Self> {
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            return Some(FleetCommand::Quit);
        }
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => Some(FleetCommand::Quit),
            KeyCode::Char('f') => Some(FleetCommand::FitAll),
            KeyCode::Char('a') => Some(FleetCommand::ToggleAutoCenter),
            KeyCode::Char(c @ '1'..='9') => Some(FleetCommand::Focus(c as usize - '1' as usize)),
            _ => None,
        }
    }
}

/// Use the full-screen display only when stdout is an interactive terminal
pub fn should_use_fullscreen() -> bool {
    std::io::stdout().is_terminal()
}

pub fn format_coordinate(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:>12.6}", v),
        None => format!("{:>12}", "N/A"),
    }
}

pub fn format_value<T: std::fmt::Display>(value: Option<T>, unit: &str) -> String {
    match value {
        Some(v) => format!("{:.1} {}", v, unit).trim_end().to_string(),
        None => "N/A".to_string(),
    }
}

/// "12s ago", "3m ago", "2h ago"
pub fn format_age(at: DateTime<Utc>) -> String {
    let seconds = Utc::now().signed_duration_since(at).num_seconds().max(0);
    if seconds < 60 {
        format!("{}s ago", seconds)
    } else if seconds < 3600 {
        format!("{}m ago", seconds / 60)
    } else {
        format!("{}h ago", seconds / 3600)
    }
}
