// src/lib.rs
//! Fleet Tracker Library
//!
//! Samples a vehicle's position from gpsd or a serial NMEA receiver,
//! forwards significant movements to the fleet API, and keeps a live map
//! of vehicle markers and trails in step with their location streams.

pub mod config;
pub mod display;
pub mod error;
pub mod export;
pub mod fleet;
pub mod geo;
pub mod gps;
pub mod logging;
pub mod map;
pub mod sampler;
pub mod transport;

mod sync;

// Re-export main types for convenience
pub use config::TrackerConfig;
pub use error::{Result, TrackerError};
pub use fleet::FleetView;
pub use geo::{haversine_distance, Bounds, LatLng};
pub use gps::{EntityId, LocationUpdate, PositionFix, PositionSource};
pub use map::{LiveMap, MapOptions, SceneBackend};
pub use sampler::{LocationSampler, SampleOutcome, SamplerOptions};
pub use transport::{HttpTransport, LocationFeed, LocationSink};
