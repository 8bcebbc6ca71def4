// src/map/style.rs
//! Marker icons, popups and trail styles

use super::{
    backend::{IconSpec, MarkerSpec, PolylineSpec},
    live_map::TrackedEntity,
};

const LIVE_COLOR: &str = "#22c55e";
const STATIC_COLOR: &str = "#6b7280";
const LIVE_TRAIL_COLOR: &str = "#3b82f6";

/// Heading arrow, green and pulsing while live
pub fn marker_icon(entity: &TrackedEntity) -> IconSpec {
    let rotation = entity.last.heading.unwrap_or(0.0);
    let color = if entity.live { LIVE_COLOR } else { STATIC_COLOR };
    let class_name = if entity.live {
        "vehicle-marker vehicle-marker--live pulse"
    } else {
        "vehicle-marker vehicle-marker--static"
    };

    IconSpec {
        html: format!(
            concat!(
                r#"<div style="transform: rotate({:.0}deg); width: 32px; height: 32px;">"#,
                r#"<svg viewBox="0 0 24 24" width="32" height="32">"#,
                r#"<path d="M12 2 L20 21 L12 17 L4 21 Z" fill="{}" stroke="white" stroke-width="1.5"/>"#,
                r#"</svg></div>"#
            ),
            rotation, color
        ),
        class_name: class_name.to_string(),
        size: (32, 32),
        anchor: (16, 16),
    }
}

pub fn popup_html(entity: &TrackedEntity) -> String {
    let speed = entity
        .last
        .speed_kmh()
        .map(|kmh| format!("{:.1} km/h", kmh))
        .unwrap_or_else(|| "-".to_string());
    let heading = entity
        .last
        .heading
        .map(|h| format!("{:.0}°", h))
        .unwrap_or_else(|| "-".to_string());
    let status = if entity.live { "Live" } else { "Last known" };

    format!(
        "<strong>{}</strong><br/>Speed: {}<br/>Heading: {}<br/>Updated: {}<br/>Status: {}",
        escape_html(&entity.name),
        speed,
        heading,
        entity.last_update.format("%Y-%m-%d %H:%M:%S UTC"),
        status
    )
}

pub fn marker_spec(entity: &TrackedEntity) -> MarkerSpec {
    MarkerSpec {
        position: entity.last.position(),
        icon: marker_icon(entity),
        popup: Some(popup_html(entity)),
    }
}

/// Solid blue while live, grey dashed otherwise
pub fn trail_spec(entity: &TrackedEntity) -> PolylineSpec {
    let points = entity.trail.iter().copied().collect();
    if entity.live {
        PolylineSpec {
            points,
            color: LIVE_TRAIL_COLOR.to_string(),
            weight: 3.0,
            opacity: 0.8,
            dash_array: None,
        }
    } else {
        PolylineSpec {
            points,
            color: STATIC_COLOR.to_string(),
            weight: 3.0,
            opacity: 0.5,
            dash_array: Some("6, 8".to_string()),
        }
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
