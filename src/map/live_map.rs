// src/map/live_map.rs
//! Keeps one marker and one trail per vehicle in step with incoming updates

use super::{
    backend::{LayerId, MapBackend, MapHandle, MapView, TileLayerSpec},
    style, MapOptions,
};
use crate::{
    error::{Result, TrackerError},
    geo::{Bounds, LatLng},
    gps::{CoordinateSample, LocationUpdate},
    sync::lock,
};
use chrono::{DateTime, Utc};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceState {
    Uninitialized,
    Initializing,
    Ready,
    Destroyed,
}

/// What `apply_update` did with one update
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Marker (and trail) redrawn
    Drawn,
    /// Entity state updated; drawn once the surface is ready
    Queued,
    /// Coordinates out of range, nothing changed
    Rejected,
    /// Marker construction failed; the previous marker stays
    MarkerFailed(String),
    /// A newer update for the same entity won the race
    Superseded,
    /// The surface was torn down
    Ignored,
}

/// Everything known about one vehicle
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedEntity {
    pub id: String,
    pub name: String,
    pub last: CoordinateSample,
    /// Oldest first
    pub trail: VecDeque<LatLng>,
    pub live: bool,
    pub last_update: DateTime<Utc>,
    pub(crate) revision: u64,
}

impl TrackedEntity {
    fn new(id: &str, name: String, live: bool, update: &LocationUpdate) -> Self {
        Self {
            id: id.to_string(),
            name,
            last: update.coords,
            trail: VecDeque::new(),
            live,
            last_update: update.timestamp,
            revision: 0,
        }
    }

    fn record(&mut self, update: &LocationUpdate, max_trail_points: usize) {
        self.last = update.coords;
        self.last_update = update.timestamp;
        self.trail.push_back(update.position());
        while self.trail.len() > max_trail_points.max(1) {
            self.trail.pop_front();
        }
        self.revision += 1;
    }

    pub fn position(&self) -> LatLng {
        self.last.position()
    }
}

struct SurfaceInner {
    state: SurfaceState,
    /// Bumped on every initialization and teardown; stale continuations compare it
    epoch: u64,
    container: Option<String>,
    map: Option<MapHandle>,
    tiles: Option<LayerId>,
    options: MapOptions,
    /// Arrival order of entities
    order: Vec<String>,
    entities: HashMap<String, TrackedEntity>,
    names: HashMap<String, String>,
    live: HashSet<String>,
    markers: HashMap<String, LayerId>,
    trails: HashMap<String, LayerId>,
}

impl SurfaceInner {
    fn live_count(&self) -> usize {
        self.entities.values().filter(|e| e.live).count()
    }

    /// Drop every graphical object and the map instance itself
    fn release<B: MapBackend>(&mut self, backend: &B) {
        for (_, layer) in self.markers.drain() {
            backend.remove_layer(layer);
        }
        for (_, layer) in self.trails.drain() {
            backend.remove_layer(layer);
        }
        if let Some(tiles) = self.tiles.take() {
            backend.remove_layer(tiles);
        }
        if let Some(map) = self.map.take() {
            backend.destroy_map(map);
        }
        self.container = None;
    }
}

/// Owns the map surface and the per-vehicle marker and trail state.
///
/// Cheap to clone; all clones drive the same surface. Every continuation
/// after an await re-checks the surface epoch, so work finishing after a
/// teardown never touches the map.
pub struct LiveMap<B: MapBackend> {
    backend: Arc<B>,
    inner: Arc<Mutex<SurfaceInner>>,
}

impl<B: MapBackend> Clone for LiveMap<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: MapBackend> LiveMap<B> {
    pub fn new(backend: Arc<B>, options: MapOptions) -> Self {
        Self {
            backend,
            inner: Arc::new(Mutex::new(SurfaceInner {
                state: SurfaceState::Uninitialized,
                epoch: 0,
                container: None,
                map: None,
                tiles: None,
                options,
                order: Vec::new(),
                entities: HashMap::new(),
                names: HashMap::new(),
                live: HashSet::new(),
                markers: HashMap::new(),
                trails: HashMap::new(),
            })),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Initialize on `container` and tear down when the guard is dropped
    pub async fn mount(&self, container: &str) -> Result<SurfaceGuard<B>> {
        self.initialize_surface(container).await?;
        Ok(SurfaceGuard { map: self.clone() })
    }

    /// Create the map instance with its tile layer.
    ///
    /// No-op while initializing or already ready on the same container. A
    /// different container releases the current instance first. On failure
    /// the surface returns to `Uninitialized` so the call can be retried.
    pub async fn initialize_surface(&self, container: &str) -> Result<()> {
        let (epoch, view, tiles) = {
            let mut inner = lock(&self.inner);
            match inner.state {
                SurfaceState::Initializing => {
                    debug!(container, "map initialization already in progress");
                    return Ok(());
                }
                SurfaceState::Ready if inner.container.as_deref() == Some(container) => {
                    return Ok(());
                }
                SurfaceState::Ready => {
                    info!(container, "map container changed, releasing previous instance");
                    inner.release(self.backend.as_ref());
                }
                SurfaceState::Uninitialized | SurfaceState::Destroyed => {}
            }

            inner.state = SurfaceState::Initializing;
            inner.epoch += 1;
            inner.container = Some(container.to_string());
            let view = MapView {
                center: inner.options.initial_center,
                zoom: inner.options.initial_zoom,
            };
            let tiles = TileLayerSpec {
                url_template: inner.options.tile_url.clone(),
                attribution: inner.options.attribution.clone(),
                max_zoom: inner.options.tile_max_zoom,
            };
            (inner.epoch, view, tiles)
        };

        if let Err(e) = self.backend.load().await {
            warn!(container, error = %e, "map library failed to load");
            self.abandon_initialization(epoch);
            return Err(TrackerError::Render(format!("Map failed to load: {}", e)));
        }

        {
            let mut inner = lock(&self.inner);
            if inner.epoch != epoch {
                debug!(container, "surface torn down while loading");
                return Ok(());
            }

            let map = match self.backend.create_map(container, view) {
                Ok(map) => map,
                Err(e) => {
                    drop(inner);
                    warn!(container, error = %e, "failed to create map");
                    self.abandon_initialization(epoch);
                    return Err(TrackerError::Render(format!("Map could not be created: {}", e)));
                }
            };
            match self.backend.add_tile_layer(map, &tiles) {
                Ok(layer) => inner.tiles = Some(layer),
                Err(e) => {
                    self.backend.destroy_map(map);
                    drop(inner);
                    warn!(container, error = %e, "failed to add tile layer");
                    self.abandon_initialization(epoch);
                    return Err(TrackerError::Render(format!("Map tiles unavailable: {}", e)));
                }
            }

            inner.map = Some(map);
            inner.state = SurfaceState::Ready;
            info!(container, map = map.0, entities = inner.order.len(), "map ready");
        }

        self.redraw_all(epoch).await;
        Ok(())
    }

    fn abandon_initialization(&self, epoch: u64) {
        let mut inner = lock(&self.inner);
        if inner.epoch == epoch && inner.state == SurfaceState::Initializing {
            inner.state = SurfaceState::Uninitialized;
            inner.container = None;
        }
    }

    /// Remove the map instance and every marker and trail; safe to repeat
    pub fn teardown_surface(&self) {
        let mut inner = lock(&self.inner);
        let had_map = inner.map.is_some();
        inner.release(self.backend.as_ref());
        inner.order.clear();
        inner.entities.clear();
        inner.epoch += 1;
        inner.state = SurfaceState::Destroyed;
        if had_map {
            info!("map surface torn down");
        }
    }

    /// Record `update` for `entity_id` and redraw its marker and trail
    pub async fn apply_update(&self, entity_id: &str, update: &LocationUpdate) -> ApplyOutcome {
        if let Err(e) = update.validate() {
            warn!(entity_id, error = %e, "rejecting location update");
            return ApplyOutcome::Rejected;
        }

        let epoch = {
            let mut inner = lock(&self.inner);
            if inner.state == SurfaceState::Destroyed {
                debug!(entity_id, "update after teardown ignored");
                return ApplyOutcome::Ignored;
            }

            let max_trail_points = inner.options.max_trail_points;
            if !inner.entities.contains_key(entity_id) {
                let name = inner
                    .names
                    .get(entity_id)
                    .cloned()
                    .unwrap_or_else(|| short_name(entity_id));
                let live = inner.live.contains(entity_id);
                inner
                    .entities
                    .insert(entity_id.to_string(), TrackedEntity::new(entity_id, name, live, update));
                inner.order.push(entity_id.to_string());
                debug!(entity_id, "tracking new entity");
            }
            if let Some(entity) = inner.entities.get_mut(entity_id) {
                entity.record(update, max_trail_points);
            }

            if inner.state != SurfaceState::Ready {
                return ApplyOutcome::Queued;
            }
            inner.epoch
        };

        self.draw_entity(entity_id, epoch, true).await
    }

    /// Mark the entity's stream as connected or not and restyle it
    pub async fn set_live(&self, entity_id: &str, connected: bool) {
        let epoch = {
            let mut inner = lock(&self.inner);
            if connected {
                inner.live.insert(entity_id.to_string());
            } else {
                inner.live.remove(entity_id);
            }
            let changed = match inner.entities.get_mut(entity_id) {
                Some(entity) if entity.live != connected => {
                    entity.live = connected;
                    entity.revision += 1;
                    true
                }
                _ => false,
            };
            if !changed || inner.state != SurfaceState::Ready {
                return;
            }
            inner.epoch
        };

        self.draw_entity(entity_id, epoch, false).await;
    }

    pub async fn set_display_name(&self, entity_id: &str, name: &str) {
        let epoch = {
            let mut inner = lock(&self.inner);
            inner.names.insert(entity_id.to_string(), name.to_string());
            let Some(entity) = inner.entities.get_mut(entity_id) else {
                return;
            };
            entity.name = name.to_string();
            entity.revision += 1;
            if inner.state != SurfaceState::Ready {
                return;
            }
            inner.epoch
        };

        self.draw_entity(entity_id, epoch, false).await;
    }

    async fn redraw_all(&self, epoch: u64) {
        let ids = lock(&self.inner).order.clone();
        for id in ids {
            self.draw_entity(&id, epoch, false).await;
        }
    }

    /// Replace the entity's marker and trail with ones built from its current state
    async fn draw_entity(&self, entity_id: &str, epoch: u64, may_recenter: bool) -> ApplyOutcome {
        let (spec, revision) = {
            let inner = lock(&self.inner);
            match inner.entities.get(entity_id) {
                Some(entity) if inner.epoch == epoch => (style::marker_spec(entity), entity.revision),
                _ => return ApplyOutcome::Ignored,
            }
        };

        let created = self.backend.create_marker(spec).await;

        let mut inner = lock(&self.inner);
        let map = match inner.map {
            Some(map) if inner.epoch == epoch && inner.state == SurfaceState::Ready => map,
            _ => {
                if let Ok(layer) = created {
                    self.backend.remove_layer(layer);
                }
                debug!(entity_id, "marker finished after teardown, discarded");
                return ApplyOutcome::Ignored;
            }
        };

        let layer = match created {
            Ok(layer) => layer,
            Err(e) => {
                warn!(entity_id, error = %e, "failed to build marker, keeping the previous one");
                return ApplyOutcome::MarkerFailed(e.to_string());
            }
        };

        let Some(entity) = inner.entities.get(entity_id).cloned() else {
            self.backend.remove_layer(layer);
            return ApplyOutcome::Ignored;
        };
        if entity.revision != revision {
            self.backend.remove_layer(layer);
            debug!(entity_id, "marker superseded by a newer update");
            return ApplyOutcome::Superseded;
        }

        if let Some(previous) = inner.markers.remove(entity_id) {
            self.backend.remove_layer(previous);
        }
        if let Err(e) = self.backend.add_layer(map, layer) {
            self.backend.remove_layer(layer);
            warn!(entity_id, error = %e, "failed to place marker");
            return ApplyOutcome::MarkerFailed(e.to_string());
        }
        inner.markers.insert(entity_id.to_string(), layer);

        if let Some(previous) = inner.trails.remove(entity_id) {
            self.backend.remove_layer(previous);
        }
        if inner.options.show_trail && entity.trail.len() >= 2 {
            match self.backend.create_polyline(map, style::trail_spec(&entity)) {
                Ok(line) => {
                    inner.trails.insert(entity_id.to_string(), line);
                }
                Err(e) => warn!(entity_id, error = %e, "failed to draw trail"),
            }
        }

        let only_live = entity.live && inner.live_count() == 1;
        if may_recenter && (inner.options.auto_center || only_live) {
            let zoom = self.backend.zoom(map).unwrap_or(inner.options.initial_zoom);
            self.backend.set_view(map, entity.position(), zoom);
        }

        ApplyOutcome::Drawn
    }

    /// Center on the entity at the focus zoom and open its popup.
    /// Returns false when there is nothing to focus.
    pub fn focus_entity(&self, entity_id: &str) -> bool {
        let inner = lock(&self.inner);
        let (Some(map), SurfaceState::Ready) = (inner.map, inner.state) else {
            return false;
        };
        let Some(entity) = inner.entities.get(entity_id) else {
            return false;
        };

        self.backend.set_view(map, entity.position(), inner.options.focus_zoom);
        if let Some(marker) = inner.markers.get(entity_id) {
            if let Err(e) = self.backend.open_popup(map, *marker) {
                warn!(entity_id, error = %e, "failed to open popup");
            }
        }
        true
    }

    /// Fit the viewport to every known entity. Returns false with no entities.
    pub fn fit_all(&self) -> bool {
        let inner = lock(&self.inner);
        let (Some(map), SurfaceState::Ready) = (inner.map, inner.state) else {
            return false;
        };
        let positions: Vec<LatLng> = inner
            .order
            .iter()
            .filter_map(|id| inner.entities.get(id))
            .map(TrackedEntity::position)
            .collect();
        let Some(bounds) = Bounds::from_points(&positions) else {
            return false;
        };

        self.backend.fit_bounds(map, bounds, inner.options.fit_padding);
        true
    }

    pub fn set_auto_center(&self, enabled: bool) {
        lock(&self.inner).options.auto_center = enabled;
    }

    pub fn options(&self) -> MapOptions {
        lock(&self.inner).options.clone()
    }

    pub fn state(&self) -> SurfaceState {
        lock(&self.inner).state
    }

    pub fn map_handle(&self) -> Option<MapHandle> {
        lock(&self.inner).map
    }

    /// Current center and zoom, while a map instance exists
    pub fn view(&self) -> Option<MapView> {
        let map = self.map_handle()?;
        Some(MapView {
            center: self.backend.center(map)?,
            zoom: self.backend.zoom(map)?,
        })
    }

    pub fn entity(&self, entity_id: &str) -> Option<TrackedEntity> {
        lock(&self.inner).entities.get(entity_id).cloned()
    }

    /// All entities in the order they first appeared
    pub fn entities(&self) -> Vec<TrackedEntity> {
        let inner = lock(&self.inner);
        inner
            .order
            .iter()
            .filter_map(|id| inner.entities.get(id).cloned())
            .collect()
    }

    pub fn marker_count(&self) -> usize {
        lock(&self.inner).markers.len()
    }

    pub fn polyline_count(&self) -> usize {
        lock(&self.inner).trails.len()
    }

    pub fn marker_layer(&self, entity_id: &str) -> Option<LayerId> {
        lock(&self.inner).markers.get(entity_id).copied()
    }
}

/// Tears the surface down when dropped
pub struct SurfaceGuard<B: MapBackend> {
    map: LiveMap<B>,
}

impl<B: MapBackend> SurfaceGuard<B> {
    pub fn map(&self) -> &LiveMap<B> {
        &self.map
    }
}

impl<B: MapBackend> Drop for SurfaceGuard<B> {
    fn drop(&mut self) {
        self.map.teardown_surface();
    }
}

/// First block of a UUID, used until a display name is known
fn short_name(entity_id: &str) -> String {
    let head = entity_id.split('-').next().unwrap_or(entity_id);
    format!("Vehicle {}", head)
}
