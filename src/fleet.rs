// src/fleet.rs
//! Live view of several vehicles: feed subscriptions funnelled into one map

use crate::{
    gps::EntityId,
    map::{ApplyOutcome, LiveMap, MapBackend},
    sampler::{StatusLevel, StatusMessage},
    sync::{lock, read, write},
    transport::{FeedEvent, LocationFeed},
};
use chrono::{DateTime, Utc};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

/// Capacity of the merged event channel
const FLEET_CHANNEL_CAPACITY: usize = 256;

/// Connection state of one vehicle's stream
#[derive(Debug, Clone, Default)]
pub struct FeedStatus {
    pub connected: bool,
    pub updates_received: u64,
    pub last_update_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FleetStatus {
    pub feeds: BTreeMap<String, FeedStatus>,
    pub message: Option<StatusMessage>,
}

impl FleetStatus {
    pub fn connected_count(&self) -> usize {
        self.feeds.values().filter(|f| f.connected).count()
    }

    fn set_message(&mut self, level: StatusLevel, text: impl Into<String>) {
        self.message = Some(StatusMessage {
            level,
            text: text.into(),
            at: Utc::now(),
        });
    }
}

/// Coordinates live streams and the map they are drawn on
pub struct FleetView<B: MapBackend> {
    map: LiveMap<B>,
    status: Arc<RwLock<FleetStatus>>,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: MapBackend> FleetView<B> {
    pub fn new(map: LiveMap<B>) -> Self {
        Self {
            map,
            status: Arc::new(RwLock::new(FleetStatus::default())),
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn map(&self) -> &LiveMap<B> {
        &self.map
    }

    pub fn status_board(&self) -> Arc<RwLock<FleetStatus>> {
        Arc::clone(&self.status)
    }

    pub fn status(&self) -> FleetStatus {
        read(&self.status).clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Subscribe to every entity and apply their events in arrival order
    pub fn start<F: LocationFeed>(&self, feed: &F, entity_ids: &[EntityId]) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("fleet view already running");
            return;
        }

        let (tx, mut rx) = mpsc::channel::<(String, FeedEvent)>(FLEET_CHANNEL_CAPACITY);
        let mut tasks = lock(&self.tasks);

        {
            let mut status = write(&self.status);
            for id in entity_ids {
                status.feeds.entry(id.to_string()).or_default();
            }
            status.set_message(StatusLevel::Info, format!("Connecting to {} vehicle(s)...", entity_ids.len()));
        }

        for id in entity_ids {
            let mut subscription = feed.subscribe(id.as_str());
            let tx = tx.clone();
            let entity_id = id.to_string();
            tasks.push(tokio::spawn(async move {
                while let Some(event) = subscription.next().await {
                    if tx.send((entity_id.clone(), event)).await.is_err() {
                        break;
                    }
                }
                debug!(entity_id = %entity_id, "feed ended");
            }));
        }
        drop(tx);

        let map = self.map.clone();
        let status = Arc::clone(&self.status);
        let running = Arc::clone(&self.running);
        tasks.push(tokio::spawn(async move {
            while let Some((entity_id, event)) = rx.recv().await {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                apply_event(&map, &status, &entity_id, event).await;
            }
        }));

        info!(vehicles = entity_ids.len(), "fleet view started");
    }

    /// Apply one event directly, bypassing the subscriptions
    pub async fn handle_event(&self, entity_id: &str, event: FeedEvent) {
        apply_event(&self.map, &self.status, entity_id, event).await;
    }

    /// Cancel all subscriptions; the map keeps its last drawn state
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        let mut status = write(&self.status);
        for feed in status.feeds.values_mut() {
            feed.connected = false;
        }
    }
}

impl<B: MapBackend> Drop for FleetView<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn apply_event<B: MapBackend>(
    map: &LiveMap<B>,
    status: &RwLock<FleetStatus>,
    entity_id: &str,
    event: FeedEvent,
) {
    match event {
        FeedEvent::Connected(connected) => {
            map.set_live(entity_id, connected).await;
            let mut status = write(status);
            status.feeds.entry(entity_id.to_string()).or_default().connected = connected;
            let text = if connected {
                format!("{} is live", display_name(map, entity_id))
            } else {
                format!("{} disconnected", display_name(map, entity_id))
            };
            status.set_message(StatusLevel::Info, text);
        }
        FeedEvent::Update(update) => {
            let outcome = map.apply_update(entity_id, &update).await;
            let mut status = write(status);
            match &outcome {
                ApplyOutcome::Rejected => {
                    status.set_message(StatusLevel::Warning, format!("Ignored invalid position for {}", display_name(map, entity_id)));
                }
                ApplyOutcome::MarkerFailed(e) => {
                    status.set_message(StatusLevel::Warning, format!("Could not draw {}: {}", display_name(map, entity_id), e));
                }
                _ => {}
            }
            if outcome != ApplyOutcome::Rejected {
                let feed = status.feeds.entry(entity_id.to_string()).or_default();
                feed.updates_received += 1;
                feed.last_update_at = Some(update.timestamp);
            }
        }
        FeedEvent::Error(message) => {
            warn!(entity_id, error = %message, "live stream error");
            let mut status = write(status);
            status.feeds.entry(entity_id.to_string()).or_default().last_error = Some(message.clone());
            status.set_message(StatusLevel::Warning, message);
        }
    }
}

fn display_name<B: MapBackend>(map: &LiveMap<B>, entity_id: &str) -> String {
    map.entity(entity_id)
        .map(|e| e.name)
        .unwrap_or_else(|| entity_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        gps::{CoordinateSample, LocationUpdate, PositionFix},
        map::{MapOptions, SceneBackend},
        transport::testing::ChannelFeed,
    };
    use std::time::Duration;

    const A: &str = "3fa85f64-5717-4562-b3fc-2c963f66afa6";
    const B: &str = "9b2d7c1e-0f4a-4e8b-a6d3-5c1b2e3f4a5b";

    fn update(entity: &EntityId, lat: f64, lng: f64) -> LocationUpdate {
        LocationUpdate::new(entity, &PositionFix::new(CoordinateSample::new(lat, lng), Utc::now()))
    }

    async fn fleet() -> FleetView<SceneBackend> {
        let map = LiveMap::new(Arc::new(SceneBackend::default()), MapOptions::default());
        map.initialize_surface("fleet").await.unwrap();
        FleetView::new(map)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_events_reach_the_map() {
        let view = fleet().await;
        let feed = ChannelFeed::default();
        let a = EntityId::parse(A).unwrap();
        let b = EntityId::parse(B).unwrap();
        view.start(&feed, &[a.clone(), b.clone()]);

        let tx_a = feed.sender(A).unwrap();
        let tx_b = feed.sender(B).unwrap();
        tx_a.send(FeedEvent::Connected(true)).await.unwrap();
        tx_a.send(FeedEvent::Update(update(&a, 1.0, 1.0))).await.unwrap();
        tx_a.send(FeedEvent::Update(update(&a, 1.1, 1.0))).await.unwrap();
        tx_b.send(FeedEvent::Update(update(&b, 2.0, 2.0))).await.unwrap();

        wait_until(|| view.map().marker_count() == 2).await;
        wait_until(|| view.map().entity(A).map_or(false, |e| e.trail.len() == 2)).await;

        let status = view.status();
        assert!(status.feeds[A].connected);
        assert!(!status.feeds[B].connected);
        assert_eq!(status.connected_count(), 1);
        assert!(view.map().entity(A).unwrap().live);
    }

    #[tokio::test]
    async fn test_feed_errors_become_status() {
        let view = fleet().await;
        view.handle_event(A, FeedEvent::Error("vehicle offline".to_string())).await;

        let status = view.status();
        assert_eq!(status.feeds[A].last_error.as_deref(), Some("vehicle offline"));
        let message = status.message.unwrap();
        assert_eq!(message.level, StatusLevel::Warning);
        assert_eq!(message.text, "vehicle offline");
    }

    #[tokio::test]
    async fn test_disconnect_restyles_as_last_known() {
        let view = fleet().await;
        let a = EntityId::parse(A).unwrap();
        view.handle_event(A, FeedEvent::Connected(true)).await;
        view.handle_event(A, FeedEvent::Update(update(&a, 1.0, 1.0))).await;
        view.handle_event(A, FeedEvent::Connected(false)).await;

        assert!(!view.map().entity(A).unwrap().live);
        assert!(view.status().message.unwrap().text.contains("disconnected"));
    }

    #[tokio::test]
    async fn test_invalid_update_not_counted() {
        let view = fleet().await;
        let a = EntityId::parse(A).unwrap();
        let mut bad = update(&a, 1.0, 1.0);
        bad.coords.longitude = -181.0;
        view.handle_event(A, FeedEvent::Update(bad)).await;

        let status = view.status();
        assert_eq!(status.feeds.get(A).map_or(0, |f| f.updates_received), 0);
        assert_eq!(status.message.unwrap().level, StatusLevel::Warning);
    }

    #[tokio::test]
    async fn test_drawn_updates_are_counted() {
        let view = fleet().await;
        let a = EntityId::parse(A).unwrap();
        let first = update(&a, 1.0, 1.0);
        let stamp = first.timestamp;
        view.handle_event(A, FeedEvent::Update(first)).await;
        view.handle_event(A, FeedEvent::Update(update(&a, 1.1, 1.0))).await;

        let status = view.status();
        assert_eq!(status.feeds[A].updates_received, 2);
        assert!(status.feeds[A].last_update_at.unwrap() >= stamp);
        assert!(status.message.is_none());
    }

    #[tokio::test]
    async fn test_stop_cancels_subscriptions() {
        let view = fleet().await;
        let feed = ChannelFeed::default();
        view.start(&feed, &[EntityId::parse(A).unwrap()]);
        let tx = feed.sender(A).unwrap();

        view.stop();
        assert!(!view.is_running());
        wait_until(|| tx.is_closed()).await;
    }
}
