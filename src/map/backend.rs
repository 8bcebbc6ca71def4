// src/map/backend.rs
//! Interface to the map rendering library

use crate::{error::Result, geo::{Bounds, LatLng}};
use serde::{Deserialize, Serialize};
use std::{fmt, future::Future};

/// One map instance owned by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapHandle(pub u64);

/// A tile layer, marker or polyline. Ids are unique across all maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerId(pub u64);

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "layer#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapView {
    pub center: LatLng,
    pub zoom: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileLayerSpec {
    pub url_template: String,
    pub attribution: String,
    pub max_zoom: u8,
}

/// Custom HTML icon, sizes in pixels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IconSpec {
    pub html: String,
    pub class_name: String,
    pub size: (u32, u32),
    pub anchor: (u32, u32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerSpec {
    pub position: LatLng,
    pub icon: IconSpec,
    pub popup: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolylineSpec {
    pub points: Vec<LatLng>,
    pub color: String,
    pub weight: f32,
    pub opacity: f32,
    pub dash_array: Option<String>,
}

/// Operations the live map needs from a rendering library.
///
/// `load` and `create_marker` may suspend; everything else is immediate.
/// A marker comes back detached and only shows up once added to a map.
pub trait MapBackend: Send + Sync + 'static {
    fn load(&self) -> impl Future<Output = Result<()>> + Send;

    fn create_map(&self, container: &str, view: MapView) -> Result<MapHandle>;

    fn add_tile_layer(&self, map: MapHandle, tiles: &TileLayerSpec) -> Result<LayerId>;

    fn create_marker(&self, spec: MarkerSpec) -> impl Future<Output = Result<LayerId>> + Send;

    fn add_layer(&self, map: MapHandle, layer: LayerId) -> Result<()>;

    /// Remove a layer from its map, or discard it if it was never added
    fn remove_layer(&self, layer: LayerId);

    /// Create a polyline already attached to `map`
    fn create_polyline(&self, map: MapHandle, spec: PolylineSpec) -> Result<LayerId>;

    fn set_view(&self, map: MapHandle, center: LatLng, zoom: u8);

    fn zoom(&self, map: MapHandle) -> Option<u8>;

    fn center(&self, map: MapHandle) -> Option<LatLng>;

    fn fit_bounds(&self, map: MapHandle, bounds: Bounds, padding: u32);

    fn open_popup(&self, map: MapHandle, marker: LayerId) -> Result<()>;

    /// Destroy the instance and every layer still on it
    fn destroy_map(&self, map: MapHandle);
}
