// src/export.rs
//! Trail export to GPX, GeoJSON and CSV

use crate::{
    error::{Result, TrackerError},
    map::TrackedEntity,
};
use std::{fs::File, io::Write, path::Path};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrailFormat {
    Gpx,
    GeoJson,
    Csv,
}

impl TrailFormat {
    pub fn extension(&self) -> &str {
        match self {
            TrailFormat::Gpx => "gpx",
            TrailFormat::GeoJson => "geojson",
            TrailFormat::Csv => "csv",
        }
    }

    /// Pick the format from a file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "gpx" => Some(TrailFormat::Gpx),
            "geojson" | "json" => Some(TrailFormat::GeoJson),
            "csv" => Some(TrailFormat::Csv),
            _ => None,
        }
    }
}

pub struct TrailExporter {
    entities: Vec<TrackedEntity>,
}

impl TrailExporter {
    pub fn new(entities: Vec<TrackedEntity>) -> Self {
        Self { entities }
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn export_to_file(&self, path: &Path, format: TrailFormat) -> Result<()> {
        if self.entities.is_empty() {
            return Err(TrackerError::Other("No trails to export".to_string()));
        }

        let content = match format {
            TrailFormat::Gpx => self.to_gpx(),
            TrailFormat::GeoJson => self.to_geojson()?,
            TrailFormat::Csv => self.to_csv(),
        };

        let mut file = File::create(path)?;
        file.write_all(content.as_bytes())?;
        Ok(())
    }

    /// One `trk` per vehicle
    pub fn to_gpx(&self) -> String {
        let mut gpx = String::from(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="Fleet Tracker" xmlns="http://www.topografix.com/GPX/1/1">
"#,
        );

        for entity in &self.entities {
            gpx.push_str("  <trk>\n");
            gpx.push_str(&format!("    <name>{}</name>\n", escape_xml(&entity.name)));
            gpx.push_str(&format!("    <desc>{}</desc>\n", escape_xml(&entity.id)));
            gpx.push_str("    <trkseg>\n");

            let last = entity.trail.len().saturating_sub(1);
            for (i, point) in entity.trail.iter().enumerate() {
                if i == last {
                    gpx.push_str(&format!(
                        "      <trkpt lat=\"{}\" lon=\"{}\"><time>{}</time></trkpt>\n",
                        point.lat,
                        point.lng,
                        entity.last_update.to_rfc3339()
                    ));
                } else {
                    gpx.push_str(&format!("      <trkpt lat=\"{}\" lon=\"{}\"/>\n", point.lat, point.lng));
                }
            }

            gpx.push_str("    </trkseg>\n  </trk>\n");
        }

        gpx.push_str("</gpx>\n");
        gpx
    }

    /// A LineString for each trail plus a Point for the last known position
    pub fn to_geojson(&self) -> Result<String> {
        let mut features = Vec::new();

        for entity in &self.entities {
            if entity.trail.len() >= 2 {
                let coordinates: Vec<[f64; 2]> = entity.trail.iter().map(|p| [p.lng, p.lat]).collect();
                features.push(serde_json::json!({
                    "type": "Feature",
                    "geometry": { "type": "LineString", "coordinates": coordinates },
                    "properties": {
                        "entityId": entity.id,
                        "name": entity.name,
                        "kind": "trail",
                    }
                }));
            }

            let mut properties = serde_json::json!({
                "entityId": entity.id,
                "name": entity.name,
                "kind": "lastPosition",
                "live": entity.live,
                "timestamp": entity.last_update.to_rfc3339(),
            });
            if let Some(speed) = entity.last.speed {
                properties["speed"] = serde_json::json!(speed);
            }
            if let Some(heading) = entity.last.heading {
                properties["heading"] = serde_json::json!(heading);
            }

            let position = entity.position();
            features.push(serde_json::json!({
                "type": "Feature",
                "geometry": { "type": "Point", "coordinates": [position.lng, position.lat] },
                "properties": properties
            }));
        }

        let collection = serde_json::json!({
            "type": "FeatureCollection",
            "features": features
        });

        Ok(serde_json::to_string_pretty(&collection)?)
    }

    pub fn to_csv(&self) -> String {
        let mut csv = String::from("entity_id,name,sequence,latitude,longitude\n");

        for entity in &self.entities {
            for (i, point) in entity.trail.iter().enumerate() {
                csv.push_str(&format!(
                    "{},{},{},{},{}\n",
                    entity.id,
                    escape_csv(&entity.name),
                    i,
                    point.lat,
                    point.lng
                ));
            }
        }

        csv
    }
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn escape_csv(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{geo::LatLng, gps::CoordinateSample};
    use chrono::Utc;
    use std::collections::VecDeque;

    fn entity(name: &str, points: &[(f64, f64)]) -> TrackedEntity {
        let trail: VecDeque<LatLng> = points.iter().map(|&(lat, lng)| LatLng::new(lat, lng)).collect();
        let (lat, lng) = points[points.len() - 1];
        TrackedEntity {
            id: "3fa85f64-5717-4562-b3fc-2c963f66afa6".to_string(),
            name: name.to_string(),
            last: CoordinateSample::new(lat, lng),
            trail,
            live: true,
            last_update: Utc::now(),
            revision: 1,
        }
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(TrailFormat::from_path(Path::new("out.GPX")), Some(TrailFormat::Gpx));
        assert_eq!(TrailFormat::from_path(Path::new("out.json")), Some(TrailFormat::GeoJson));
        assert_eq!(TrailFormat::from_path(Path::new("out.csv")), Some(TrailFormat::Csv));
        assert_eq!(TrailFormat::from_path(Path::new("out.kml")), None);
        assert_eq!(TrailFormat::from_path(Path::new("out")), None);
    }

    #[test]
    fn test_gpx_export() {
        let exporter = TrailExporter::new(vec![entity("Truck & Co", &[(42.0, -71.0), (42.001, -71.0)])]);
        let gpx = exporter.to_gpx();
        assert!(gpx.contains("<trk>"));
        assert!(gpx.contains("Truck &amp; Co"));
        assert!(gpx.contains("lat=\"42\""));
        assert_eq!(gpx.matches("<trkpt").count(), 2);
        assert_eq!(gpx.matches("<time>").count(), 1);
    }

    #[test]
    fn test_geojson_export() {
        let exporter = TrailExporter::new(vec![
            entity("A", &[(1.0, 2.0), (1.5, 2.5)]),
            entity("B", &[(3.0, 4.0)]),
        ]);
        let value: serde_json::Value = serde_json::from_str(&exporter.to_geojson().unwrap()).unwrap();
        let features = value["features"].as_array().unwrap();
        // Trail and point for A, point only for B
        assert_eq!(features.len(), 3);
        assert_eq!(features[0]["geometry"]["type"], "LineString");
        assert_eq!(features[1]["geometry"]["coordinates"][0], 2.5);
    }

    #[test]
    fn test_csv_export() {
        let exporter = TrailExporter::new(vec![entity("Van, blue", &[(1.0, 2.0), (1.5, 2.5)])]);
        let csv = exporter.to_csv();
        assert!(csv.starts_with("entity_id,name,sequence,latitude,longitude\n"));
        assert!(csv.contains("\"Van, blue\",1,1.5,2.5"));
    }

    #[test]
    fn test_empty_export_fails() {
        let exporter = TrailExporter::new(Vec::new());
        let path = std::env::temp_dir().join("fleet-tracker-empty.gpx");
        assert!(exporter.export_to_file(&path, TrailFormat::Gpx).is_err());
    }
}
