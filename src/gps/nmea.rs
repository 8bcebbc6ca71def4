// src/gps/nmea.rs
//! NMEA sentence parsing and the serial receiver source

use super::{
    sample::{CoordinateSample, PositionFix},
    source::{PositionError, PositionSource, PositionWatch, WatchOptions, WATCH_CHANNEL_CAPACITY},
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use std::time::Duration;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

const KNOTS_TO_MPS: f64 = 0.514_444;

/// Rough user equivalent range error used to turn HDOP into meters
const UERE_M: f64 = 5.0;

/// Highest HDOP accepted when high accuracy is requested
const HIGH_ACCURACY_MAX_HDOP: f64 = 2.0;

/// Combines GGA and RMC sentences into position fixes.
///
/// GGA carries altitude, HDOP and fix quality; RMC carries position,
/// velocity and the UTC date. A fix is produced for every valid RMC.
#[derive(Debug, Default)]
pub struct NmeaAssembler {
    altitude: Option<f64>,
    hdop: Option<f64>,
    fix_quality: Option<u8>,
}

impl NmeaAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one sentence; returns a fix when the sentence completes one
    pub fn push(&mut self, line: &str, high_accuracy: bool) -> Option<PositionFix> {
        let line = line.trim();
        let parts: Vec<&str> = line.split('*').next().unwrap_or(line).split(',').collect();

        if line.starts_with("$GPGGA") || line.starts_with("$GNGGA") {
            self.parse_gga(&parts);
            None
        } else if line.starts_with("$GPRMC") || line.starts_with("$GNRMC") {
            let fix = self.parse_rmc(&parts)?;
            if high_accuracy && self.hdop.map_or(false, |h| h > HIGH_ACCURACY_MAX_HDOP) {
                debug!(hdop = ?self.hdop, "skipping low accuracy NMEA fix");
                return None;
            }
            Some(fix)
        } else {
            None
        }
    }

    /// Parse GGA (Global Positioning System Fix Data) sentence
    fn parse_gga(&mut self, parts: &[&str]) {
        if parts.len() < 10 {
            return;
        }

        self.fix_quality = parts[6].parse::<u8>().ok();
        self.hdop = parts[8].parse::<f64>().ok();
        self.altitude = parts[9].parse::<f64>().ok();
    }

    /// Parse RMC (Recommended Minimum Course) sentence
    fn parse_rmc(&mut self, parts: &[&str]) -> Option<PositionFix> {
        if parts.len() < 10 || parts[2] != "A" {
            return None;
        }
        if self.fix_quality == Some(0) {
            return None;
        }

        let latitude = parse_coordinate(parts[3], parts[4], "S")?;
        let longitude = parse_coordinate(parts[5], parts[6], "W")?;

        let mut coords = CoordinateSample::new(latitude, longitude);
        coords.altitude = self.altitude;
        coords.accuracy = self.hdop.map_or(0.0, |h| h * UERE_M);
        coords.speed = parts[7].parse::<f64>().ok().map(|knots| knots * KNOTS_TO_MPS);
        coords.heading = match (parts[8].parse::<f64>().ok(), coords.speed) {
            (Some(course), Some(speed)) if speed > 0.0 => Some(course),
            _ => None,
        };

        let timestamp = parse_timestamp(parts[1], parts[9]).unwrap_or_else(Utc::now);
        Some(PositionFix::new(coords, timestamp))
    }
}

/// ddmm.mmmm plus hemisphere into signed decimal degrees
fn parse_coordinate(value: &str, hemisphere: &str, negative: &str) -> Option<f64> {
    if value.is_empty() || hemisphere.is_empty() {
        return None;
    }
    let raw = value.parse::<f64>().ok()?;
    let degrees = (raw / 100.0).trunc();
    let minutes = raw - degrees * 100.0;
    let decimal = degrees + minutes / 60.0;
    Some(if hemisphere == negative { -decimal } else { decimal })
}

/// hhmmss(.sss) and ddmmyy into a UTC timestamp
fn parse_timestamp(time: &str, date: &str) -> Option<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(date, "%d%m%y").ok()?;
    let time = NaiveTime::parse_from_str(time, "%H%M%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(time, "%H%M%S"))
        .ok()?;
    Some(date.and_time(time).and_utc())
}

/// Position source reading NMEA 0183 from a serial receiver
#[derive(Debug, Clone)]
pub struct SerialNmeaSource {
    pub port: String,
    pub baudrate: u32,
}

impl SerialNmeaSource {
    pub fn new(port: impl Into<String>, baudrate: u32) -> Self {
        Self {
            port: port.into(),
            baudrate,
        }
    }
}

impl PositionSource for SerialNmeaSource {
    fn name(&self) -> String {
        format!("serial {} at {} baud", self.port, self.baudrate)
    }

    fn watch(self, options: &WatchOptions) -> Result<PositionWatch, PositionError> {
        let serial = tokio_serial::new(&self.port, self.baudrate)
            .timeout(Duration::from_millis(1000))
            .open_native_async()
            .map_err(|e| {
                let io: std::io::Error = e.into();
                PositionError::from_open_error(&self.port, &io)
            })?;
        info!(port = %self.port, baudrate = self.baudrate, "serial receiver opened");

        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let options = *options;
        let reader = tokio::spawn(async move {
            let mut reader = BufReader::new(serial);
            let mut assembler = NmeaAssembler::new();
            let mut line = String::new();

            loop {
                let event = match tokio::time::timeout(options.timeout, reader.read_line(&mut line)).await {
                    Err(_) => Some(Err(PositionError::Timeout)),
                    Ok(Ok(0)) => {
                        let _ = tx
                            .send(Err(PositionError::TemporarilyUnavailable(
                                "serial receiver closed".to_string(),
                            )))
                            .await;
                        return;
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "error reading from serial port");
                        Some(Err(PositionError::TemporarilyUnavailable(e.to_string())))
                    }
                    Ok(Ok(_)) => match assembler.push(&std::mem::take(&mut line), options.high_accuracy) {
                        Some(fix) if options.is_stale(&fix) => None,
                        Some(fix) => Some(Ok(fix)),
                        None => None,
                    },
                };

                if let Some(event) = event {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(PositionWatch::new(rx, reader))
    }
}

/// List available serial ports
pub fn list_serial_ports() -> crate::error::Result<Vec<String>> {
    let ports = tokio_serial::available_ports()?;
    Ok(ports
        .into_iter()
        .map(|port| format!("{} - {:?}", port.port_name, port.port_type))
        .collect())
}
