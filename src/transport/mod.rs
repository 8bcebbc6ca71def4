// src/transport/mod.rs
//! Delivery of location updates to the fleet API and live update streams

pub mod http;

use crate::{error::Result, gps::LocationUpdate};
use std::future::Future;
use tokio::{sync::mpsc, task::JoinHandle};

pub use http::HttpTransport;

/// Accepts location updates from the sampler
pub trait LocationSink: Send + Sync + 'static {
    fn send(&self, update: &LocationUpdate) -> impl Future<Output = Result<()>> + Send;
}

/// Events on one entity's live stream
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Connected(bool),
    Update(LocationUpdate),
    Error(String),
}

/// An open subscription; dropping it cancels the stream
pub struct FeedSubscription {
    events: mpsc::Receiver<FeedEvent>,
    task: Option<JoinHandle<()>>,
}

impl FeedSubscription {
    pub fn new(events: mpsc::Receiver<FeedEvent>, task: Option<JoinHandle<()>>) -> Self {
        Self { events, task }
    }

    pub async fn next(&mut self) -> Option<FeedEvent> {
        self.events.recv().await
    }

    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.events.close();
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Produces live location streams per entity
pub trait LocationFeed: Send + Sync + 'static {
    fn subscribe(&self, entity_id: &str) -> FeedSubscription;
}
