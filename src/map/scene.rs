// src/map/scene.rs
//! In-process map backend that records the drawn scene

use super::backend::{
    LayerId, MapBackend, MapHandle, MapView, MarkerSpec, PolylineSpec, TileLayerSpec,
};
use crate::{
    error::{Result, TrackerError},
    geo::{Bounds, LatLng},
    sync::lock,
};
use serde_json::{json, Value};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};
use tracing::debug;

const TILE_SIZE: f64 = 256.0;
const MAX_ZOOM: u8 = 19;
/// Web Mercator cannot represent the poles
const MAX_LATITUDE: f64 = 85.051_128_78;

/// Position of a coordinate in world pixels at `zoom`
pub fn project(point: &LatLng, zoom: u8) -> (f64, f64) {
    let scale = TILE_SIZE * 2_f64.powi(zoom as i32);
    let lat_rad = point.lat.clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians();
    let x = (point.lng + 180.0) / 360.0 * scale;
    let y = (1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / std::f64::consts::PI) / 2.0 * scale;
    (x, y)
}

/// Highest zoom at which `bounds` plus padding fits the viewport
pub fn zoom_to_fit(bounds: &Bounds, viewport: (u32, u32), padding: u32, max_zoom: u8) -> u8 {
    let usable_w = viewport.0.saturating_sub(2 * padding).max(1) as f64;
    let usable_h = viewport.1.saturating_sub(2 * padding).max(1) as f64;

    for zoom in (0..=max_zoom).rev() {
        let (x1, y1) = project(&bounds.south_west, zoom);
        let (x2, y2) = project(&bounds.north_east, zoom);
        if (x2 - x1).abs() <= usable_w && (y2 - y1).abs() <= usable_h {
            return zoom;
        }
    }
    0
}

#[derive(Debug, Clone, PartialEq)]
pub enum SceneLayer {
    Tiles(TileLayerSpec),
    Marker(MarkerSpec),
    Polyline(PolylineSpec),
}

/// Everything drawn on one map instance
#[derive(Debug, Clone, PartialEq)]
pub struct SceneMap {
    pub container: String,
    pub center: LatLng,
    pub zoom: u8,
    pub layers: BTreeMap<LayerId, SceneLayer>,
    pub open_popup: Option<LayerId>,
}

impl SceneMap {
    pub fn markers(&self) -> impl Iterator<Item = (&LayerId, &MarkerSpec)> {
        self.layers.iter().filter_map(|(id, layer)| match layer {
            SceneLayer::Marker(marker) => Some((id, marker)),
            _ => None,
        })
    }

    pub fn polylines(&self) -> impl Iterator<Item = (&LayerId, &PolylineSpec)> {
        self.layers.iter().filter_map(|(id, layer)| match layer {
            SceneLayer::Polyline(line) => Some((id, line)),
            _ => None,
        })
    }

    pub fn tile_layers(&self) -> usize {
        self.layers
            .values()
            .filter(|layer| matches!(layer, SceneLayer::Tiles(_)))
            .count()
    }

    /// Markers and polylines as a GeoJSON FeatureCollection
    pub fn to_geojson(&self) -> Value {
        let mut features = Vec::new();

        for (id, line) in self.polylines() {
            let coordinates: Vec<[f64; 2]> = line.points.iter().map(|p| [p.lng, p.lat]).collect();
            features.push(json!({
                "type": "Feature",
                "id": id.0,
                "geometry": { "type": "LineString", "coordinates": coordinates },
                "properties": {
                    "kind": "trail",
                    "color": line.color,
                    "opacity": line.opacity,
                    "dashArray": line.dash_array,
                }
            }));
        }

        for (id, marker) in self.markers() {
            features.push(json!({
                "type": "Feature",
                "id": id.0,
                "geometry": {
                    "type": "Point",
                    "coordinates": [marker.position.lng, marker.position.lat]
                },
                "properties": {
                    "kind": "marker",
                    "className": marker.icon.class_name,
                    "popup": marker.popup,
                    "popupOpen": self.open_popup == Some(*id),
                }
            }));
        }

        json!({ "type": "FeatureCollection", "features": features })
    }
}

#[derive(Debug, Default)]
struct SceneState {
    loaded: bool,
    maps: HashMap<MapHandle, SceneMap>,
    /// Markers created but not yet added to a map
    detached: HashMap<LayerId, MarkerSpec>,
}

/// Map backend that keeps the scene in memory.
///
/// Used for headless runs and for exercising the live map.
pub struct SceneBackend {
    state: Mutex<SceneState>,
    next_id: AtomicU64,
    viewport: (u32, u32),
}

impl Default for SceneBackend {
    fn default() -> Self {
        Self::new((1024, 768))
    }
}

impl SceneBackend {
    pub fn new(viewport: (u32, u32)) -> Self {
        Self {
            state: Mutex::new(SceneState::default()),
            next_id: AtomicU64::new(1),
            viewport,
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn snapshot(&self, map: MapHandle) -> Option<SceneMap> {
        lock(&self.state).maps.get(&map).cloned()
    }

    pub fn map_count(&self) -> usize {
        lock(&self.state).maps.len()
    }

    pub fn detached_count(&self) -> usize {
        lock(&self.state).detached.len()
    }

    fn with_map<T>(&self, map: MapHandle, f: impl FnOnce(&mut SceneMap) -> T) -> Result<T> {
        let mut state = lock(&self.state);
        let scene = state
            .maps
            .get_mut(&map)
            .ok_or_else(|| TrackerError::Render(format!("map {} does not exist", map.0)))?;
        Ok(f(scene))
    }
}

impl MapBackend for SceneBackend {
    async fn load(&self) -> Result<()> {
        lock(&self.state).loaded = true;
        Ok(())
    }

    fn create_map(&self, container: &str, view: MapView) -> Result<MapHandle> {
        if container.trim().is_empty() {
            return Err(TrackerError::Render("map container is not attached".to_string()));
        }
        let mut state = lock(&self.state);
        if !state.loaded {
            return Err(TrackerError::Render("map library not loaded".to_string()));
        }

        let handle = MapHandle(self.next_id());
        state.maps.insert(
            handle,
            SceneMap {
                container: container.to_string(),
                center: view.center,
                zoom: view.zoom.min(MAX_ZOOM),
                layers: BTreeMap::new(),
                open_popup: None,
            },
        );
        debug!(map = handle.0, container, "map created");
        Ok(handle)
    }

    fn add_tile_layer(&self, map: MapHandle, tiles: &TileLayerSpec) -> Result<LayerId> {
        let id = LayerId(self.next_id());
        self.with_map(map, |scene| {
            scene.layers.insert(id, SceneLayer::Tiles(tiles.clone()));
        })?;
        Ok(id)
    }

    async fn create_marker(&self, spec: MarkerSpec) -> Result<LayerId> {
        if !spec.position.is_valid() {
            return Err(TrackerError::Render(format!(
                "marker position out of range: {:.6}, {:.6}",
                spec.position.lat, spec.position.lng
            )));
        }
        let id = LayerId(self.next_id());
        lock(&self.state).detached.insert(id, spec);
        Ok(id)
    }

    fn add_layer(&self, map: MapHandle, layer: LayerId) -> Result<()> {
        let mut state = lock(&self.state);
        let spec = state
            .detached
            .remove(&layer)
            .ok_or_else(|| TrackerError::Render(format!("{} is not a detached marker", layer)))?;
        match state.maps.get_mut(&map) {
            Some(scene) => {
                scene.layers.insert(layer, SceneLayer::Marker(spec));
                Ok(())
            }
            None => Err(TrackerError::Render(format!("map {} does not exist", map.0))),
        }
    }

    fn remove_layer(&self, layer: LayerId) {
        let mut state = lock(&self.state);
        if state.detached.remove(&layer).is_some() {
            return;
        }
        for scene in state.maps.values_mut() {
            if scene.layers.remove(&layer).is_some() {
                if scene.open_popup == Some(layer) {
                    scene.open_popup = None;
                }
                return;
            }
        }
    }

    fn create_polyline(&self, map: MapHandle, spec: PolylineSpec) -> Result<LayerId> {
        if spec.points.len() < 2 {
            return Err(TrackerError::Render("a polyline needs at least two points".to_string()));
        }
        let id = LayerId(self.next_id());
        self.with_map(map, |scene| {
            scene.layers.insert(id, SceneLayer::Polyline(spec));
        })?;
        Ok(id)
    }

    fn set_view(&self, map: MapHandle, center: LatLng, zoom: u8) {
        let _ = self.with_map(map, |scene| {
            scene.center = center;
            scene.zoom = zoom.min(MAX_ZOOM);
        });
    }

    fn zoom(&self, map: MapHandle) -> Option<u8> {
        lock(&self.state).maps.get(&map).map(|scene| scene.zoom)
    }

    fn center(&self, map: MapHandle) -> Option<LatLng> {
        lock(&self.state).maps.get(&map).map(|scene| scene.center)
    }

    fn fit_bounds(&self, map: MapHandle, bounds: Bounds, padding: u32) {
        let zoom = zoom_to_fit(&bounds, self.viewport, padding, MAX_ZOOM);
        self.set_view(map, bounds.center(), zoom);
    }

    fn open_popup(&self, map: MapHandle, marker: LayerId) -> Result<()> {
        self.with_map(map, |scene| match scene.layers.get(&marker) {
            Some(SceneLayer::Marker(spec)) if spec.popup.is_some() => {
                scene.open_popup = Some(marker);
                Ok(())
            }
            _ => Err(TrackerError::Render(format!("{} has no popup", marker))),
        })?
    }

    fn destroy_map(&self, map: MapHandle) {
        if lock(&self.state).maps.remove(&map).is_some() {
            debug!(map = map.0, "map destroyed");
        }
    }
}
