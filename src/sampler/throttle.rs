// src/sampler/throttle.rs
//! Time and distance gate deciding which fixes are worth sending

use super::SamplerOptions;
use crate::gps::PositionFix;
use tokio::time::Instant;

/// Verdict of the significance check for one fix
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Significance {
    /// Nothing accepted since the session started
    First,
    /// Both gates open
    Moved { distance_m: f64, elapsed_ms: u64 },
    /// Time gate still closed
    TooSoon { elapsed_ms: u64 },
    /// Time gate open but the vehicle has not moved far enough
    TooClose { distance_m: f64, elapsed_ms: u64 },
}

impl Significance {
    pub fn is_significant(&self) -> bool {
        matches!(self, Significance::First | Significance::Moved { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct Accepted {
    fix: PositionFix,
    at: Instant,
}

/// Last accepted fix of the current tracking session and when it was
/// accepted.
///
/// Elapsed time is local time since acceptance, not the difference of
/// device timestamps, so a backlog of buffered fixes cannot pass the time
/// gate faster than the configured interval.
#[derive(Debug, Clone, Default)]
pub struct ThrottleState {
    last: Option<Accepted>,
}

impl ThrottleState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.last = None;
    }

    pub fn last_accepted(&self) -> Option<&PositionFix> {
        self.last.as_ref().map(|last| &last.fix)
    }

    /// Apply the time gate AND the distance gate against the last accepted fix
    pub fn check(&self, fix: &PositionFix, now: Instant, options: &SamplerOptions) -> Significance {
        let Some(last) = &self.last else {
            return Significance::First;
        };

        let elapsed_ms = now.saturating_duration_since(last.at).as_millis() as u64;
        if elapsed_ms < options.min_interval_ms {
            return Significance::TooSoon { elapsed_ms };
        }

        let distance_m = last.fix.coords.position().distance_to(&fix.coords.position());
        if distance_m < options.min_distance_m {
            return Significance::TooClose { distance_m, elapsed_ms };
        }

        Significance::Moved { distance_m, elapsed_ms }
    }

    pub fn accept(&mut self, fix: PositionFix, now: Instant) {
        self.last = Some(Accepted { fix, at: now });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{geo::EARTH_RADIUS_M, gps::CoordinateSample};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;

    /// Latitude offset that is `meters` north of the equator
    fn north(meters: f64) -> f64 {
        (meters / EARTH_RADIUS_M).to_degrees()
    }

    fn fix(lat: f64, lng: f64) -> PositionFix {
        PositionFix::new(CoordinateSample::new(lat, lng), Utc::now())
    }

    fn after(t0: Instant, ms: u64) -> Instant {
        t0 + Duration::from_millis(ms)
    }

    fn state_with_origin(t0: Instant) -> ThrottleState {
        let mut state = ThrottleState::new();
        state.accept(fix(0.0, 0.0), t0);
        state
    }

    #[test]
    fn test_first_fix_is_significant() {
        let state = ThrottleState::new();
        assert_eq!(
            state.check(&fix(12.0, 34.0), Instant::now(), &SamplerOptions::default()),
            Significance::First
        );
    }

    #[test]
    fn test_time_gate() {
        let t0 = Instant::now();
        let state = state_with_origin(t0);
        let options = SamplerOptions::default();

        let early = state.check(&fix(north(1000.0), 0.0), after(t0, 4999), &options);
        assert_eq!(early, Significance::TooSoon { elapsed_ms: 4999 });

        let late = state.check(&fix(north(1000.0), 0.0), after(t0, 5000), &options);
        assert!(late.is_significant());
    }

    #[test]
    fn test_time_gate_ignores_device_timestamps() {
        let t0 = Instant::now();
        let state = state_with_origin(t0);
        let options = SamplerOptions::default();

        // Stamped a minute later on the device but arriving right away
        let mut buffered = fix(north(1000.0), 0.0);
        buffered.timestamp = buffered.timestamp + ChronoDuration::minutes(1);
        assert!(!state.check(&buffered, after(t0, 10), &options).is_significant());

        // Stamped an hour earlier but arriving after the interval
        let mut skewed = fix(north(1000.0), 0.0);
        skewed.timestamp = skewed.timestamp - ChronoDuration::hours(1);
        assert!(state.check(&skewed, after(t0, 5200), &options).is_significant());
    }

    #[test]
    fn test_distance_gate() {
        let t0 = Instant::now();
        let state = state_with_origin(t0);
        let options = SamplerOptions::default();

        let jitter = state.check(&fix(north(2.0), 0.0), after(t0, 10_000), &options);
        assert!(matches!(jitter, Significance::TooClose { .. }));

        let moved = state.check(&fix(north(6.0), 0.0), after(t0, 10_000), &options);
        let Significance::Moved { distance_m, .. } = moved else {
            panic!("expected movement, got {:?}", moved);
        };
        assert!((distance_m - 6.0).abs() < 0.01);
    }

    #[test]
    fn test_custom_thresholds() {
        let t0 = Instant::now();
        let state = state_with_origin(t0);
        let options = SamplerOptions {
            min_distance_m: 100.0,
            min_interval_ms: 1000,
            ..Default::default()
        };
        assert!(!state.check(&fix(north(50.0), 0.0), after(t0, 2000), &options).is_significant());
        assert!(state.check(&fix(north(150.0), 0.0), after(t0, 2000), &options).is_significant());
    }

    #[test]
    fn test_reset_reopens_first_sample_bypass() {
        let t0 = Instant::now();
        let mut state = state_with_origin(t0);
        state.reset();
        assert!(state.last_accepted().is_none());
        assert_eq!(
            state.check(&fix(0.0, 0.0), after(t0, 1), &SamplerOptions::default()),
            Significance::First
        );
    }
}
