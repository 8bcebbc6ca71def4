// src/display/plain.rs
//! Line-oriented output for pipes and non-interactive terminals

use crate::{
    fleet::FleetView,
    map::MapBackend,
    sampler::{StatusMessage, TrackingStatus},
    sync::read,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};
use tokio::time::sleep;

const POLL: Duration = Duration::from_millis(250);

/// Print each new status message until `running` is cleared
pub async fn run_tracking(status: Arc<RwLock<TrackingStatus>>, running: Arc<AtomicBool>) {
    let mut last: Option<StatusMessage> = None;

    while running.load(Ordering::Relaxed) {
        let snapshot = read(&status).clone();
        if snapshot.message != last {
            if let Some(message) = &snapshot.message {
                println!(
                    "[{}] {:?}: {} (sent {}, dropped {})",
                    message.at.format("%H:%M:%S"),
                    message.level,
                    message.text,
                    snapshot.updates_sent,
                    snapshot.samples_dropped
                );
            }
            last = snapshot.message;
        }
        sleep(POLL).await;
    }
}

pub async fn run_fleet<B: MapBackend>(view: &FleetView<B>, running: Arc<AtomicBool>) {
    let mut last: Option<StatusMessage> = None;

    while running.load(Ordering::Relaxed) {
        let status = view.status();
        if status.message != last {
            if let Some(message) = &status.message {
                println!(
                    "[{}] {:?}: {} ({} vehicle(s), {} live)",
                    message.at.format("%H:%M:%S"),
                    message.level,
                    message.text,
                    view.map().entities().len(),
                    status.connected_count()
                );
            }
            last = status.message;
        }
        sleep(POLL).await;
    }
}
