// src/sampler/mod.rs
//! Location sampler: validates and throttles device fixes, forwards the
//! significant ones to a location sink

pub mod status;
pub mod throttle;

use crate::{
    error::{Result, TrackerError},
    gps::{EntityId, LocationUpdate, PositionError, PositionFix, PositionSource, WatchOptions},
    gps::source::WatchHandle,
    sync::{lock, read, write},
    transport::LocationSink,
};
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub use status::{StatusLevel, StatusMessage, TrackingStatus};
pub use throttle::{Significance, ThrottleState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerOptions {
    /// Minimum great-circle distance between sent fixes, meters
    pub min_distance_m: f64,
    /// Minimum time between sent fixes, milliseconds
    pub min_interval_ms: u64,
    pub high_accuracy: bool,
    pub timeout_ms: u64,
    pub maximum_age_ms: u64,
    /// Delay before a timeout turns into a "retrying" notice
    pub retry_notice_delay_ms: u64,
}

impl Default for SamplerOptions {
    fn default() -> Self {
        Self {
            min_distance_m: 5.0,
            min_interval_ms: 5000,
            high_accuracy: true,
            timeout_ms: 10_000,
            maximum_age_ms: 0,
            retry_notice_delay_ms: 2000,
        }
    }
}

impl SamplerOptions {
    pub fn watch_options(&self) -> WatchOptions {
        WatchOptions {
            high_accuracy: self.high_accuracy,
            timeout: Duration::from_millis(self.timeout_ms),
            maximum_age: Duration::from_millis(self.maximum_age_ms),
        }
    }
}

/// What happened to one fix
#[derive(Debug, Clone, PartialEq)]
pub enum SampleOutcome {
    /// Delivered to the sink
    Forwarded,
    /// Coordinates out of range
    Rejected,
    /// Not significant against the last accepted fix
    Dropped(Significance),
    /// Significant, but the sink failed; the fix still counts as accepted
    TransportFailed(String),
    /// The session ended before the sink answered
    Stale,
    /// No tracking session is active
    Inactive,
}

/// Turns a continuous position feed into a rate and distance limited
/// sequence of location updates.
///
/// Cloning yields another handle to the same sampler.
pub struct LocationSampler<S: LocationSink> {
    sink: Arc<S>,
    options: SamplerOptions,
    status: Arc<RwLock<TrackingStatus>>,
    throttle: Arc<Mutex<ThrottleState>>,
    entity: Arc<RwLock<Option<EntityId>>>,
    watch: Arc<Mutex<Option<WatchHandle>>>,
    active: Arc<AtomicBool>,
    session: Arc<AtomicU64>,
}

impl<S: LocationSink> Clone for LocationSampler<S> {
    fn clone(&self) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            options: self.options.clone(),
            status: Arc::clone(&self.status),
            throttle: Arc::clone(&self.throttle),
            entity: Arc::clone(&self.entity),
            watch: Arc::clone(&self.watch),
            active: Arc::clone(&self.active),
            session: Arc::clone(&self.session),
        }
    }
}

impl<S: LocationSink> LocationSampler<S> {
    pub fn new(sink: Arc<S>, options: SamplerOptions) -> Self {
        Self {
            sink,
            options,
            status: Arc::new(RwLock::new(TrackingStatus::default())),
            throttle: Arc::new(Mutex::new(ThrottleState::new())),
            entity: Arc::new(RwLock::new(None)),
            watch: Arc::new(Mutex::new(None)),
            active: Arc::new(AtomicBool::new(false)),
            session: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn options(&self) -> &SamplerOptions {
        &self.options
    }

    /// Shared status board for displays
    pub fn status_board(&self) -> Arc<RwLock<TrackingStatus>> {
        Arc::clone(&self.status)
    }

    pub fn status(&self) -> TrackingStatus {
        read(&self.status).clone()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn updates_sent(&self) -> u64 {
        read(&self.status).updates_sent
    }

    pub fn last_accepted(&self) -> Option<PositionFix> {
        lock(&self.throttle).last_accepted().copied()
    }

    /// Begin observing `source` on behalf of `entity_id`.
    ///
    /// Fails without observing anything when the id is malformed, a
    /// session is already running, or the device cannot be used.
    pub fn start<P: PositionSource>(&self, entity_id: &str, source: P) -> Result<()> {
        let entity = EntityId::parse(entity_id).map_err(|e| self.report_error(e))?;

        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(self.report_error(TrackerError::Validation(
                "tracking is already active; stop it first".to_string(),
            )));
        }

        let source_name = source.name();
        let watch = match source.watch(&self.options.watch_options()) {
            Ok(watch) => watch,
            Err(e) => {
                self.active.store(false, Ordering::SeqCst);
                error!(source = %source_name, error = %e, "cannot observe position");
                return Err(self.report_error(e.into()));
            }
        };

        *write(&self.entity) = Some(entity.clone());
        // Fixes still in flight from an older session check the session
        // number under this lock, so they never land in the fresh state
        let session = {
            let mut throttle = lock(&self.throttle);
            throttle.reset();
            self.session.fetch_add(1, Ordering::SeqCst) + 1
        };
        {
            let mut status = write(&self.status);
            *status = TrackingStatus::started(entity.as_str(), source_name.clone());
            status.set_message(StatusLevel::Info, format!("Waiting for a position from {}", source_name));
        }

        let (mut events, handle) = watch.into_parts();
        *lock(&self.watch) = Some(handle);

        info!(entity_id = %entity, source = %source_name, session, "tracking started");

        let sampler = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if !sampler.is_current(session) {
                    break;
                }
                match event {
                    Ok(fix) => {
                        sampler.sample_in_session(session, fix).await;
                    }
                    Err(e) => sampler.on_position_error(e),
                }
            }
            debug!(session, "position pump finished");
        });

        Ok(())
    }

    /// End observation. Counters and the last accepted fix stay readable.
    pub fn stop(&self) {
        let was_active = self.active.swap(false, Ordering::SeqCst);
        if let Some(mut handle) = lock(&self.watch).take() {
            handle.detach();
        }

        if was_active {
            let mut status = write(&self.status);
            status.active = false;
            status.set_message(StatusLevel::Info, "Tracking stopped");
            info!(updates_sent = status.updates_sent, "tracking stopped");
        }
    }

    /// Handle one fix from the device
    pub async fn on_position_received(&self, fix: PositionFix) -> SampleOutcome {
        let session = self.session.load(Ordering::SeqCst);
        self.sample_in_session(session, fix).await
    }

    async fn sample_in_session(&self, session: u64, fix: PositionFix) -> SampleOutcome {
        if !self.is_current(session) {
            return SampleOutcome::Inactive;
        }
        write(&self.status).samples_seen += 1;

        if !fix.coords.is_valid() {
            warn!(
                latitude = fix.coords.latitude,
                longitude = fix.coords.longitude,
                "dropping fix with out of range coordinates"
            );
            let mut status = write(&self.status);
            status.samples_rejected += 1;
            status.set_message(
                StatusLevel::Warning,
                format!(
                    "Ignored invalid position {:.6}, {:.6}",
                    fix.coords.latitude, fix.coords.longitude
                ),
            );
            return SampleOutcome::Rejected;
        }

        let significance = {
            let mut throttle = lock(&self.throttle);
            if !self.is_current(session) {
                return SampleOutcome::Stale;
            }
            let now = Instant::now();
            let significance = throttle.check(&fix, now, &self.options);
            if significance.is_significant() {
                throttle.accept(fix, now);
            }
            significance
        };

        if !significance.is_significant() {
            debug!(?significance, "fix below thresholds");
            write(&self.status).samples_dropped += 1;
            return SampleOutcome::Dropped(significance);
        }

        let Some(entity) = read(&self.entity).clone() else {
            return SampleOutcome::Inactive;
        };
        let update = LocationUpdate::new(&entity, &fix);
        let result = self.sink.send(&update).await;

        if !self.is_current(session) {
            debug!(entity_id = %entity, "ignoring transport result for a stopped session");
            return SampleOutcome::Stale;
        }

        let mut status = write(&self.status);
        match result {
            Ok(()) => {
                status.updates_sent += 1;
                status.last_sent = Some(fix);
                status.last_sent_at = Some(chrono::Utc::now());
                let text = format!("Location sent ({} so far)", status.updates_sent);
                status.set_message(StatusLevel::Info, text);
                debug!(entity_id = %entity, ?significance, "location forwarded");
                SampleOutcome::Forwarded
            }
            Err(e) => {
                warn!(entity_id = %entity, error = %e, "failed to send location");
                status.transport_failures += 1;
                status.set_message(StatusLevel::Warning, e.to_string());
                SampleOutcome::TransportFailed(e.to_string())
            }
        }
    }

    /// Handle one report from the device's error channel
    pub fn on_position_error(&self, error: PositionError) {
        if error.is_fatal() {
            error!(error = %error, "positioning failed, stopping");
            self.stop();
            write(&self.status).set_message(StatusLevel::Error, error.to_string());
            return;
        }

        warn!(error = %error, "positioning problem");
        write(&self.status).set_message(StatusLevel::Warning, error.to_string());

        if error == PositionError::Timeout {
            let sampler = self.clone();
            let session = self.session.load(Ordering::SeqCst);
            let delay = Duration::from_millis(self.options.retry_notice_delay_ms);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if sampler.is_current(session) {
                    write(&sampler.status)
                        .set_message(StatusLevel::Info, "Still waiting for a position, retrying...");
                }
            });
        }
    }

    fn is_current(&self, session: u64) -> bool {
        self.is_active() && self.session.load(Ordering::SeqCst) == session
    }

    fn report_error(&self, error: TrackerError) -> TrackerError {
        write(&self.status).set_message(StatusLevel::Error, error.to_string());
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        geo::EARTH_RADIUS_M,
        gps::{
            source::testing::{ChannelSource, FailingSource},
            CoordinateSample,
        },
        transport::testing::RecordingSink,
    };
    use chrono::{DateTime, Utc};
    use tokio::sync::{mpsc, Notify};

    const ID: &str = "3fa85f64-5717-4562-b3fc-2c963f66afa6";

    fn north(meters: f64) -> f64 {
        (meters / EARTH_RADIUS_M).to_degrees()
    }

    fn fix_at(t0: DateTime<Utc>, ms: i64, lat: f64, lng: f64) -> PositionFix {
        PositionFix::new(
            CoordinateSample::new(lat, lng),
            t0 + chrono::Duration::milliseconds(ms),
        )
    }

    fn started() -> (LocationSampler<RecordingSink>, Arc<RecordingSink>, mpsc::Sender<crate::gps::PositionEvent>) {
        let sink = Arc::new(RecordingSink::default());
        let sampler = LocationSampler::new(Arc::clone(&sink), SamplerOptions::default());
        let (tx, source) = ChannelSource::new();
        sampler.start(ID, source).unwrap();
        (sampler, sink, tx)
    }

    async fn advance_ms(ms: u64) {
        tokio::time::advance(Duration::from_millis(ms)).await;
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

    #[tokio::test(start_paused = true)]
    async fn test_time_gate_enforced() {
        let (sampler, sink, _tx) = started();
        let t0 = Utc::now();
        assert_eq!(sampler.on_position_received(fix_at(t0, 0, 0.0, 0.0)).await, SampleOutcome::Forwarded);

        advance_ms(4999).await;
        let early = sampler.on_position_received(fix_at(t0, 4999, north(1000.0), 0.0)).await;
        assert!(matches!(early, SampleOutcome::Dropped(Significance::TooSoon { .. })));

        advance_ms(1).await;
        let late = sampler.on_position_received(fix_at(t0, 5000, north(1000.0), 0.0)).await;
        assert_eq!(late, SampleOutcome::Forwarded);
        assert_eq!(sink.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffered_backlog_is_rate_limited() {
        let (sampler, sink, _tx) = started();
        let t0 = Utc::now();

        // Fixes stamped 6 s and 1 km apart, delivered back to back
        for i in 0..5 {
            let fix = fix_at(t0, i * 6000, north(1000.0 * i as f64), 0.0);
            sampler.on_position_received(fix).await;
        }
        assert_eq!(sink.sent().len(), 1);
        assert_eq!(sampler.status().samples_dropped, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_clock_jump_back_does_not_stall() {
        let (sampler, sink, _tx) = started();
        let t0 = Utc::now();
        sampler.on_position_received(fix_at(t0, 0, 0.0, 0.0)).await;

        advance_ms(5200).await;
        let skewed = fix_at(t0, -3_600_000, north(1000.0), 0.0);
        assert_eq!(sampler.on_position_received(skewed).await, SampleOutcome::Forwarded);
        assert_eq!(sink.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distance_gate_enforced() {
        let (sampler, sink, _tx) = started();
        let t0 = Utc::now();
        sampler.on_position_received(fix_at(t0, 0, 0.0, 0.0)).await;
        advance_ms(10_000).await;

        let jitter = sampler.on_position_received(fix_at(t0, 10_000, north(2.0), 0.0)).await;
        assert!(matches!(jitter, SampleOutcome::Dropped(Significance::TooClose { .. })));

        let moved = sampler.on_position_received(fix_at(t0, 10_000, north(6.0), 0.0)).await;
        assert_eq!(moved, SampleOutcome::Forwarded);
        assert_eq!(sink.sent().len(), 2);
        assert_eq!(sampler.status().samples_dropped, 1);
    }

    #[tokio::test]
    async fn test_first_sample_always_accepted() {
        let sink = Arc::new(RecordingSink::default());
        let sampler = LocationSampler::new(Arc::clone(&sink), SamplerOptions::default());
        let t0 = Utc::now();

        for lat in [-90.0, -45.5, 0.0, 12.34, 89.999] {
            for lng in [-180.0, -0.001, 0.0, 77.7, 180.0] {
                let (_tx, source) = ChannelSource::new();
                sampler.start(ID, source).unwrap();
                let outcome = sampler.on_position_received(fix_at(t0, 0, lat, lng)).await;
                assert_eq!(outcome, SampleOutcome::Forwarded, "first fix at {}, {}", lat, lng);
                sampler.stop();
            }
        }
        assert_eq!(sink.sent().len(), 25);
    }

    #[tokio::test]
    async fn test_out_of_range_rejected_before_throttle() {
        let (sampler, sink, _tx) = started();
        let t0 = Utc::now();

        for (lat, lng) in [(91.0, 0.0), (-90.5, 10.0), (0.0, -181.0), (45.0, 180.01)] {
            let outcome = sampler.on_position_received(fix_at(t0, 0, lat, lng)).await;
            assert_eq!(outcome, SampleOutcome::Rejected);
        }
        assert!(sampler.last_accepted().is_none());
        assert!(sink.sent().is_empty());

        // The next valid fix still gets the first-sample bypass
        let outcome = sampler.on_position_received(fix_at(t0, 1, 10.0, 10.0)).await;
        assert_eq!(outcome, SampleOutcome::Forwarded);
        assert_eq!(sampler.status().samples_rejected, 4);
        assert!(sampler.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_three_fixes_two_forwarded() {
        let (sampler, sink, _tx) = started();
        let t0 = Utc::now();

        sampler.on_position_received(fix_at(t0, 0, 0.0, 0.0)).await;
        advance_ms(2000).await;
        sampler.on_position_received(fix_at(t0, 2000, 0.00005, 0.0)).await;
        advance_ms(4000).await;
        sampler.on_position_received(fix_at(t0, 6000, 0.0005, 0.0)).await;

        assert_eq!(sampler.updates_sent(), 2);
        let sent = sink.sent();
        assert_eq!(sent[0].coords.latitude, 0.0);
        assert_eq!(sent[1].coords.latitude, 0.0005);
        assert!(sent.iter().all(|u| u.entity_id == ID));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixes_from_source_are_pumped() {
        let (sampler, sink, tx) = started();
        let t0 = Utc::now();

        tx.send(Ok(fix_at(t0, 0, 1.0, 1.0))).await.unwrap();
        tx.send(Ok(fix_at(t0, 100, 1.0, 1.0))).await.unwrap();
        wait_until(|| sampler.status().samples_seen == 2).await;

        advance_ms(6000).await;
        tx.send(Ok(fix_at(t0, 6000, 1.001, 1.0))).await.unwrap();

        wait_until(|| sampler.status().samples_seen == 3).await;
        wait_until(|| sink.sent().len() == 2).await;
    }

    #[tokio::test]
    async fn test_invalid_entity_id_is_rejected() {
        let sampler = LocationSampler::new(Arc::new(RecordingSink::default()), SamplerOptions::default());
        let (_tx, source) = ChannelSource::new();

        let result = sampler.start("truck-7", source);
        assert!(matches!(result, Err(TrackerError::Validation(_))));
        assert!(!sampler.is_active());
        assert_eq!(sampler.status().message.unwrap().level, StatusLevel::Error);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let (sampler, _sink, _tx) = started();
        let (_tx2, source) = ChannelSource::new();
        assert!(matches!(sampler.start(ID, source), Err(TrackerError::Validation(_))));
        assert!(sampler.is_active());
    }

    #[tokio::test]
    async fn test_permission_denied_does_not_start() {
        let sampler = LocationSampler::new(Arc::new(RecordingSink::default()), SamplerOptions::default());
        let source = FailingSource(PositionError::PermissionDenied("user declined".to_string()));

        let result = sampler.start(ID, source);
        assert!(matches!(result, Err(TrackerError::Capability(_))));
        assert!(!sampler.is_active());
    }

    #[tokio::test]
    async fn test_transport_failure_keeps_throttle_state() {
        let (sampler, sink, _tx) = started();
        sink.set_failing(true);
        let t0 = Utc::now();

        let outcome = sampler.on_position_received(fix_at(t0, 0, 0.0, 0.0)).await;
        assert!(matches!(outcome, SampleOutcome::TransportFailed(_)));
        assert!(sampler.last_accepted().is_some());
        assert!(sampler.is_active());

        // Still gated against the consumed fix
        sink.set_failing(false);
        let outcome = sampler.on_position_received(fix_at(t0, 1000, 0.1, 0.0)).await;
        assert!(matches!(outcome, SampleOutcome::Dropped(_)));

        let status = sampler.status();
        assert_eq!(status.updates_sent, 0);
        assert_eq!(status.transport_failures, 1);
    }

    #[tokio::test]
    async fn test_fix_from_previous_session_is_not_accepted() {
        let (sampler, sink, _tx) = started();
        let old_session = sampler.session.load(Ordering::SeqCst);

        sampler.stop();
        let (_tx2, source) = ChannelSource::new();
        sampler.start(ID, source).unwrap();

        let outcome = sampler.sample_in_session(old_session, fix_at(Utc::now(), 0, 1.0, 1.0)).await;
        assert_eq!(outcome, SampleOutcome::Inactive);
        assert!(sampler.last_accepted().is_none());
        assert_eq!(sampler.status().samples_seen, 0);
        assert!(sink.sent().is_empty());

        // The new session still gets its first-sample bypass
        let outcome = sampler.on_position_received(fix_at(Utc::now(), 0, 2.0, 2.0)).await;
        assert_eq!(outcome, SampleOutcome::Forwarded);
    }

    #[tokio::test]
    async fn test_stop_prevents_further_forwards() {
        let (sampler, sink, tx) = started();
        let t0 = Utc::now();
        sampler.on_position_received(fix_at(t0, 0, 0.0, 0.0)).await;

        sampler.stop();
        assert!(!sampler.is_active());
        assert_eq!(
            sampler.on_position_received(fix_at(t0, 60_000, 1.0, 0.0)).await,
            SampleOutcome::Inactive
        );
        // Device callback is detached
        wait_until(|| tx.is_closed()).await;

        let status = sampler.status();
        assert_eq!(status.updates_sent, 1);
        assert!(status.last_sent.is_some());
        assert_eq!(sink.sent().len(), 1);

        // Stopping twice is harmless
        sampler.stop();
    }

    /// Sink that blocks until released, to stop a session mid-flight
    #[derive(Default)]
    struct GatedSink {
        entered: Notify,
        release: Notify,
        delivered: AtomicU64,
    }

    impl LocationSink for GatedSink {
        async fn send(&self, _update: &LocationUpdate) -> Result<()> {
            self.entered.notify_one();
            self.release.notified().await;
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_in_flight_result_ignored_after_stop() {
        let sink = Arc::new(GatedSink::default());
        let sampler = LocationSampler::new(Arc::clone(&sink), SamplerOptions::default());
        let (_tx, source) = ChannelSource::new();
        sampler.start(ID, source).unwrap();

        let worker = sampler.clone();
        let pending = tokio::spawn(async move {
            worker.on_position_received(fix_at(Utc::now(), 0, 0.0, 0.0)).await
        });

        sink.entered.notified().await;
        sampler.stop();
        sink.release.notify_one();

        assert_eq!(pending.await.unwrap(), SampleOutcome::Stale);
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 1);
        assert_eq!(sampler.updates_sent(), 0);
    }

    #[tokio::test]
    async fn test_fatal_device_error_stops_session() {
        let (sampler, _sink, tx) = started();
        tx.send(Err(PositionError::PermissionDenied("revoked".to_string())))
            .await
            .unwrap();

        wait_until(|| !sampler.is_active()).await;
        let message = sampler.status().message.unwrap();
        assert_eq!(message.level, StatusLevel::Error);
        assert!(message.text.contains("revoked"));
    }

    #[tokio::test]
    async fn test_timeout_keeps_observing() {
        let sink = Arc::new(RecordingSink::default());
        let options = SamplerOptions {
            retry_notice_delay_ms: 10,
            ..Default::default()
        };
        let sampler = LocationSampler::new(Arc::clone(&sink), options);
        let (tx, source) = ChannelSource::new();
        sampler.start(ID, source).unwrap();

        tx.send(Err(PositionError::Timeout)).await.unwrap();
        wait_until(|| {
            sampler
                .status()
                .message
                .map_or(false, |m| m.text.contains("retrying"))
        })
        .await;
        assert!(sampler.is_active());

        tx.send(Err(PositionError::TemporarilyUnavailable("no fix".to_string())))
            .await
            .unwrap();
        tx.send(Ok(fix_at(Utc::now(), 0, 5.0, 5.0))).await.unwrap();
        wait_until(|| sink.sent().len() == 1).await;
        assert!(sampler.is_active());
    }
}
