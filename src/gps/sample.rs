// src/gps/sample.rs
//! Position samples, tracked entity identifiers and location updates

use crate::error::{Result, TrackerError};
use crate::geo::{self, LatLng};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One raw reading from a positioning device
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinateSample {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,   // meters
    #[serde(default)]
    pub accuracy: f64,           // meters, horizontal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude_accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,    // degrees, absent when not moving
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,      // m/s
}

impl CoordinateSample {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            ..Default::default()
        }
    }

    pub fn position(&self) -> LatLng {
        LatLng::new(self.latitude, self.longitude)
    }

    pub fn is_valid(&self) -> bool {
        geo::is_valid_coordinate(self.latitude, self.longitude)
    }

    /// Speed converted to km/h for display
    pub fn speed_kmh(&self) -> Option<f64> {
        self.speed.map(|s| s * 3.6)
    }
}

/// A sample together with the time the device captured it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionFix {
    pub coords: CoordinateSample,
    pub timestamp: DateTime<Utc>,
}

impl PositionFix {
    pub fn new(coords: CoordinateSample, timestamp: DateTime<Utc>) -> Self {
        Self { coords, timestamp }
    }

    /// Age of the fix relative to now, in milliseconds
    pub fn age_ms(&self) -> i64 {
        Utc::now().signed_duration_since(self.timestamp).num_milliseconds()
    }
}

/// Identifier of a tracked vehicle (hyphenated UUID)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.len() != 36 || uuid::Uuid::try_parse(value).is_err() {
            return Err(TrackerError::Validation(format!(
                "'{}' is not a valid vehicle id (expected a UUID like 3fa85f64-5717-4562-b3fc-2c963f66afa6)",
                value
            )));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A sample owned by an entity, as exchanged with the fleet API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    #[serde(default)]
    pub entity_id: String,
    pub coords: CoordinateSample,
    #[serde(with = "flexible_timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl LocationUpdate {
    pub fn new(entity_id: &EntityId, fix: &PositionFix) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            coords: fix.coords,
            timestamp: fix.timestamp,
        }
    }

    /// Reject coordinates outside the valid latitude/longitude range
    pub fn validate(&self) -> Result<()> {
        if self.coords.is_valid() {
            Ok(())
        } else {
            Err(TrackerError::Validation(format!(
                "coordinates out of range: {}, {}",
                self.coords.latitude, self.coords.longitude
            )))
        }
    }

    pub fn position(&self) -> LatLng {
        self.coords.position()
    }
}

/// Timestamps arrive either as epoch milliseconds or as RFC 3339 strings.
/// They are always written back as RFC 3339.
mod flexible_timestamp {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(i64),
        Float(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Millis(ms) => DateTime::from_timestamp_millis(ms)
                .ok_or_else(|| de::Error::custom(format!("timestamp out of range: {}", ms))),
            Raw::Float(ms) => DateTime::from_timestamp_millis(ms as i64)
                .ok_or_else(|| de::Error::custom(format!("timestamp out of range: {}", ms))),
            Raw::Text(text) => DateTime::parse_from_rfc3339(&text)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| de::Error::custom(format!("invalid timestamp '{}': {}", text, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "3fa85f64-5717-4562-b3fc-2c963f66afa6";

    #[test]
    fn test_entity_id_accepts_uuid() {
        let id = EntityId::parse(ID).unwrap();
        assert_eq!(id.as_str(), ID);
    }

    #[test]
    fn test_entity_id_rejects_other_shapes() {
        assert!(EntityId::parse("vehicle-12").is_err());
        assert!(EntityId::parse("").is_err());
        // Simple (unhyphenated) form is not accepted
        assert!(EntityId::parse("3fa85f6457174562b3fc2c963f66afa6").is_err());
    }

    #[test]
    fn test_update_timestamp_from_millis() {
        let json = format!(
            r#"{{"entityId":"{}","coords":{{"latitude":1.5,"longitude":2.5,"accuracy":4.0}},"timestamp":1700000000000}}"#,
            ID
        );
        let update: LocationUpdate = serde_json::from_str(&json).unwrap();
        assert_eq!(update.timestamp.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(update.coords.latitude, 1.5);
        assert_eq!(update.coords.heading, None);
    }

    #[test]
    fn test_update_timestamp_from_iso_string() {
        let json = r#"{"coords":{"latitude":1.0,"longitude":2.0,"speed":3.0,"heading":90.0},"timestamp":"2024-05-01T12:00:00Z"}"#;
        let update: LocationUpdate = serde_json::from_str(json).unwrap();
        assert_eq!(update.entity_id, "");
        assert_eq!(update.coords.speed, Some(3.0));
        assert_eq!(update.timestamp.to_rfc3339(), "2024-05-01T12:00:00+00:00");
    }

    #[test]
    fn test_update_serializes_camel_case() {
        let mut coords = CoordinateSample::new(10.0, 20.0);
        coords.altitude_accuracy = Some(3.0);
        let update = LocationUpdate {
            entity_id: ID.to_string(),
            coords,
            timestamp: DateTime::from_timestamp_millis(0).unwrap(),
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["entityId"], ID);
        assert_eq!(json["coords"]["altitudeAccuracy"], 3.0);
        assert_eq!(json["timestamp"], "1970-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let fix = PositionFix::new(CoordinateSample::new(91.0, 0.0), Utc::now());
        let id = EntityId::parse(ID).unwrap();
        assert!(LocationUpdate::new(&id, &fix).validate().is_err());
    }
}
