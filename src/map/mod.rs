// src/map/mod.rs
//! Live map: per-vehicle markers and trails on a map surface

pub mod backend;
mod live_map;
pub mod scene;
mod style;

use crate::geo::LatLng;
use serde::{Deserialize, Serialize};

pub use backend::{LayerId, MapBackend, MapHandle, MapView};
pub use live_map::{ApplyOutcome, LiveMap, SurfaceGuard, SurfaceState, TrackedEntity};
pub use scene::SceneBackend;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapOptions {
    /// Oldest trail points are evicted beyond this length
    pub max_trail_points: usize,
    pub show_trail: bool,
    /// Recenter on every update, not only when a single vehicle is live
    pub auto_center: bool,
    pub initial_center: LatLng,
    pub initial_zoom: u8,
    pub focus_zoom: u8,
    /// Pixels kept free around the fitted bounds
    pub fit_padding: u32,
    pub tile_url: String,
    pub attribution: String,
    pub tile_max_zoom: u8,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            max_trail_points: 50,
            show_trail: true,
            auto_center: false,
            initial_center: LatLng::new(42.438878, -71.119277),
            initial_zoom: 13,
            focus_zoom: 16,
            fit_padding: 50,
            tile_url: "https://tile.openstreetmap.org/{z}/{x}/{y}.png".to_string(),
            attribution: "&copy; OpenStreetMap contributors".to_string(),
            tile_max_zoom: 19,
        }
    }
}
