// src/gps/mod.rs
//! Position sources and sample types

pub mod gpsd;
pub mod nmea;
pub mod sample;
pub mod source;

pub use gpsd::GpsdSource;
pub use nmea::SerialNmeaSource;
pub use sample::{CoordinateSample, EntityId, LocationUpdate, PositionFix};
pub use source::{PositionError, PositionEvent, PositionSource, PositionWatch, WatchOptions};
