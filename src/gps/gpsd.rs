// src/gps/gpsd.rs
//! GPSD client implementation

use super::{
    sample::{CoordinateSample, PositionFix},
    source::{PositionError, PositionEvent, PositionSource, PositionWatch, WatchOptions, WATCH_CHANNEL_CAPACITY},
};
use crate::error::{Result, TrackerError};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::{collections::HashMap, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::mpsc,
};
use tracing::{debug, info, warn};

/// Delay before reconnecting after gpsd closed the connection
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Below this speed (m/s) the reported track is noise and is dropped
const MIN_HEADING_SPEED: f64 = 0.5;

#[derive(Debug, Deserialize)]
struct GpsdMessage {
    class: String,
    #[serde(flatten)]
    data: HashMap<String, serde_json::Value>,
}

/// What a single gpsd line told us
#[derive(Debug, Clone, PartialEq)]
pub enum GpsdReport {
    Fix(PositionFix),
    /// TPV without a usable fix (mode < 2, or 2D while high accuracy is required)
    NoFix,
    /// VERSION, DEVICES, SKY and other classes
    Other,
}

/// Connect to a gpsd daemon and return a stream reader
pub async fn connect_gpsd(host: &str, port: u16) -> std::io::Result<BufReader<TcpStream>> {
    let mut stream = TcpStream::connect(format!("{}:{}", host, port)).await?;

    // Send WATCH command to start receiving JSON data
    stream
        .write_all(b"?WATCH={\"enable\":true,\"json\":true}\n")
        .await?;

    Ok(BufReader::new(stream))
}

/// Parse a single line of gpsd JSON data
pub fn parse_gpsd_json(line: &str, high_accuracy: bool) -> Result<GpsdReport> {
    let msg: GpsdMessage = serde_json::from_str(line)
        .map_err(|e| TrackerError::Other(format!("Failed to parse gpsd JSON: {}", e)))?;

    Ok(match msg.class.as_str() {
        "TPV" => parse_tpv_message(&msg.data, high_accuracy),
        "VERSION" => {
            if let Some(version) = msg.data.get("release").and_then(|v| v.as_str()) {
                info!(version, "connected to gpsd");
            }
            GpsdReport::Other
        }
        "DEVICES" => {
            if let Some(devices) = msg.data.get("devices").and_then(|v| v.as_array()) {
                debug!(count = devices.len(), "gpsd devices");
            }
            GpsdReport::Other
        }
        _ => GpsdReport::Other,
    })
}

/// Parse TPV (Time Position Velocity) message
fn parse_tpv_message(msg_data: &HashMap<String, serde_json::Value>, high_accuracy: bool) -> GpsdReport {
    let number = |key: &str| msg_data.get(key).and_then(|v| v.as_f64());

    let mode = msg_data.get("mode").and_then(|v| v.as_u64()).unwrap_or(0);
    if mode < 2 || (high_accuracy && mode < 3) {
        return GpsdReport::NoFix;
    }

    let (Some(lat), Some(lon)) = (number("lat"), number("lon")) else {
        return GpsdReport::NoFix;
    };

    let mut coords = CoordinateSample::new(lat, lon);
    coords.altitude = number("altHAE").or_else(|| number("alt"));
    coords.accuracy = number("eph")
        .or_else(|| match (number("epx"), number("epy")) {
            (Some(x), Some(y)) => Some(x.max(y)),
            (x, y) => x.or(y),
        })
        .unwrap_or(0.0);
    coords.altitude_accuracy = number("epv");
    coords.speed = number("speed");
    coords.heading = match (number("track"), coords.speed) {
        (Some(track), Some(speed)) if speed >= MIN_HEADING_SPEED => Some(track.rem_euclid(360.0)),
        _ => None,
    };

    let timestamp = msg_data
        .get("time")
        .and_then(|v| v.as_str())
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    GpsdReport::Fix(PositionFix::new(coords, timestamp))
}

/// Position source backed by a gpsd daemon
#[derive(Debug, Clone)]
pub struct GpsdSource {
    pub host: String,
    pub port: u16,
}

impl GpsdSource {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl PositionSource for GpsdSource {
    fn name(&self) -> String {
        format!("gpsd at {}:{}", self.host, self.port)
    }

    fn watch(self, options: &WatchOptions) -> std::result::Result<PositionWatch, PositionError> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let options = *options;
        let reader = tokio::spawn(async move {
            run_gpsd_reader(self, options, tx).await;
        });
        Ok(PositionWatch::new(rx, reader))
    }
}

async fn run_gpsd_reader(source: GpsdSource, options: WatchOptions, tx: mpsc::Sender<PositionEvent>) {
    let mut connected_once = false;

    loop {
        let mut reader = match connect_gpsd(&source.host, source.port).await {
            Ok(reader) => reader,
            Err(e) => {
                let what = format!("gpsd at {}:{}", source.host, source.port);
                let error = PositionError::from_open_error(&what, &e);
                // A daemon that was reachable before is only temporarily gone
                let error = if connected_once && !matches!(error, PositionError::PermissionDenied(_)) {
                    PositionError::TemporarilyUnavailable(error.to_string())
                } else {
                    error
                };
                let fatal = error.is_fatal();
                if tx.send(Err(error)).await.is_err() || fatal {
                    return;
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        connected_once = true;
        info!(host = %source.host, port = source.port, "watching gpsd");

        let mut line = String::new();
        loop {
            // A timed out read keeps its partial line for the next attempt
            let event = match tokio::time::timeout(options.timeout, reader.read_line(&mut line)).await {
                Err(_) => Some(Err(PositionError::Timeout)),
                Ok(Ok(0)) => {
                    warn!("gpsd closed the connection");
                    let _ = tx
                        .send(Err(PositionError::TemporarilyUnavailable(
                            "gpsd closed the connection".to_string(),
                        )))
                        .await;
                    break;
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "error reading from gpsd");
                    let _ = tx
                        .send(Err(PositionError::TemporarilyUnavailable(e.to_string())))
                        .await;
                    break;
                }
                Ok(Ok(_)) => match parse_gpsd_json(std::mem::take(&mut line).trim(), options.high_accuracy) {
                    Ok(GpsdReport::Fix(fix)) if options.is_stale(&fix) => {
                        debug!(age_ms = fix.age_ms(), "skipping cached gpsd fix");
                        None
                    }
                    Ok(GpsdReport::Fix(fix)) => Some(Ok(fix)),
                    Ok(_) => None,
                    Err(e) => {
                        debug!(error = %e, "ignoring unparsable gpsd line");
                        None
                    }
                },
            };

            if let Some(event) = event {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }

        if tx.is_closed() {
            return;
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TPV: &str = r#"{"class":"TPV","device":"/dev/ttyUSB0","mode":3,"time":"2023-01-01T12:00:00.000Z","ept":0.005,"lat":48.117,"lon":11.517,"alt":545.4,"epx":15.319,"epy":17.054,"epv":124.484,"track":10.3797,"speed":0.091,"climb":10.7,"eps":34.11,"epc":248.97}"#;

    #[test]
    fn test_tpv_parsing() {
        let report = parse_gpsd_json(TPV, true).unwrap();
        let GpsdReport::Fix(fix) = report else {
            panic!("expected a fix, got {:?}", report);
        };

        assert_eq!(fix.coords.latitude, 48.117);
        assert_eq!(fix.coords.longitude, 11.517);
        assert_eq!(fix.coords.altitude, Some(545.4));
        assert_eq!(fix.coords.accuracy, 17.054);
        assert_eq!(fix.coords.altitude_accuracy, Some(124.484));
        assert_eq!(fix.coords.speed, Some(0.091));
        // Too slow for the track to mean anything
        assert_eq!(fix.coords.heading, None);
        assert_eq!(fix.timestamp.to_rfc3339(), "2023-01-01T12:00:00+00:00");
    }

    #[test]
    fn test_heading_kept_when_moving() {
        let json = r#"{"class":"TPV","mode":3,"lat":1.0,"lon":2.0,"track":370.0,"speed":12.0,"eph":4.5}"#;
        let GpsdReport::Fix(fix) = parse_gpsd_json(json, true).unwrap() else {
            panic!("expected a fix");
        };
        assert_eq!(fix.coords.heading, Some(10.0));
        assert_eq!(fix.coords.accuracy, 4.5);
    }

    #[test]
    fn test_2d_fix_requires_low_accuracy_mode() {
        let json = r#"{"class":"TPV","mode":2,"lat":1.0,"lon":2.0}"#;
        assert_eq!(parse_gpsd_json(json, true).unwrap(), GpsdReport::NoFix);
        assert!(matches!(parse_gpsd_json(json, false).unwrap(), GpsdReport::Fix(_)));
    }

    #[test]
    fn test_no_fix_and_other_classes() {
        let json = r#"{"class":"TPV","mode":1}"#;
        assert_eq!(parse_gpsd_json(json, false).unwrap(), GpsdReport::NoFix);

        let sky = r#"{"class":"SKY","hdop":1.2,"satellites":[{"PRN":1,"ss":42,"used":true}]}"#;
        assert_eq!(parse_gpsd_json(sky, false).unwrap(), GpsdReport::Other);
    }

    #[test]
    fn test_invalid_json() {
        assert!(parse_gpsd_json(r#"{"invalid": json"#, false).is_err());
    }

    #[tokio::test]
    async fn test_refused_connection_is_unsupported() {
        // Bind then drop a listener to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut watch = GpsdSource::new("127.0.0.1", port)
            .watch(&WatchOptions::default())
            .unwrap();
        let event = watch.next().await.unwrap();
        assert!(matches!(event, Err(PositionError::UnsupportedCapability(_))));
        assert!(watch.next().await.is_none());
    }
}
