use std::collections::{BTreeMap, HashMap};

use glam::DVec3;
use worldspace_common::distance_2d_to_box;
use worldspace_tiles::{Tile, TileHandle, TileRegistry};

use crate::volume::{VolumeHandle, VolumeSet, VolumeSettings};

/// What the streaming rules want for one tile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DesiredState {
    pub loaded: bool,
    pub visible: bool,
    /// Load on the calling thread instead of in the background.
    pub block_on_load: bool,
    pub always_loaded: bool,
}

impl DesiredState {
    pub const UNLOADED: Self = Self {
        loaded: false,
        visible: false,
        block_on_load: false,
        always_loaded: false,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditorOverride {
    ForceVisible,
    ForceHidden,
}

/// A change in desired state for one tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredChange {
    pub tile: TileHandle,
    pub package: String,
    pub desired: DesiredState,
}

/// Everything one evaluation looks at.
#[derive(Debug, Clone, Copy)]
pub struct DecisionInputs<'a> {
    pub registry: &'a TileRegistry,
    pub volumes: &'a VolumeSet,
    /// Viewer positions in absolute world space.
    pub viewers: &'a [DVec3],
    /// Seconds since the world started.
    pub now: f64,
}

#[derive(Debug, Clone)]
struct Settled {
    package: String,
    desired: DesiredState,
    changed_at: f64,
}

/// Per-tick desired-state computation.
///
/// Rules, in order of increasing precedence: distance to the nearest viewer,
/// always-loaded layers, streaming volumes, editor overrides. A tile that just
/// changed is held for `dwell_secs` before it may change again; editor
/// overrides skip the hold. The engine never mutates level state itself.
#[derive(Debug)]
pub struct StreamingDecisionEngine {
    dwell_secs: f64,
    overrides: HashMap<TileHandle, EditorOverride>,
    settled: BTreeMap<TileHandle, Settled>,
}

impl StreamingDecisionEngine {
    pub fn new(dwell_secs: f64) -> Self {
        Self {
            dwell_secs: dwell_secs.max(0.0),
            overrides: HashMap::new(),
            settled: BTreeMap::new(),
        }
    }

    pub fn dwell_secs(&self) -> f64 {
        self.dwell_secs
    }

    pub fn set_override(&mut self, tile: TileHandle, value: Option<EditorOverride>) {
        match value {
            Some(v) => {
                self.overrides.insert(tile, v);
            }
            None => {
                self.overrides.remove(&tile);
            }
        }
    }

    pub fn override_for(&self, tile: TileHandle) -> Option<EditorOverride> {
        self.overrides.get(&tile).copied()
    }

    /// Last desired state handed out for `tile`.
    pub fn settled(&self, tile: TileHandle) -> Option<DesiredState> {
        self.settled.get(&tile).map(|s| s.desired)
    }

    /// Forget what was handed out for `tile`; the next evaluation reports it afresh.
    pub fn forget(&mut self, tile: TileHandle) {
        self.settled.remove(&tile);
    }

    /// Drop every dwell hold, e.g. after a teleport.
    pub fn clear_dwell(&mut self) {
        for s in self.settled.values_mut() {
            s.changed_at = f64::NEG_INFINITY;
        }
    }

    /// Desired state of one tile, ignoring the dwell hold.
    pub fn desired_for(
        &self,
        handle: TileHandle,
        tile: &Tile,
        inputs: &DecisionInputs<'_>,
        inside: &HashMap<VolumeHandle, bool>,
    ) -> DesiredState {
        let layer = inputs.registry.layer_of(tile);
        let mut desired = DesiredState::default();

        if layer.always_loaded {
            desired.loaded = true;
            desired.visible = true;
            desired.always_loaded = true;
        } else {
            let reach = layer.streaming_distance as f64;
            let in_range = inputs
                .viewers
                .iter()
                .any(|v| distance_to_tile(*v, tile) <= reach);
            desired.loaded = in_range;
            desired.visible = in_range;
        }

        let mut linked = false;
        let mut triggered: Option<VolumeSettings> = None;
        for (vh, _) in inputs.volumes.volumes_for(handle) {
            linked = true;
            if inside.get(&vh).copied().unwrap_or(false) {
                if let Some(volume) = inputs.volumes.get(vh) {
                    let s = VolumeSettings::for_usage(volume.usage);
                    triggered = Some(triggered.map_or(s, |t| t.combine(s)));
                }
            }
        }
        if linked {
            match triggered {
                Some(s) => {
                    desired.loaded = true;
                    if s.change_visibility {
                        desired.visible = s.visible || desired.always_loaded;
                    }
                    desired.block_on_load |= s.block_on_load;
                }
                None if !desired.always_loaded => {
                    desired.loaded = false;
                    desired.visible = false;
                }
                None => {}
            }
        }

        match self.overrides.get(&handle) {
            Some(EditorOverride::ForceVisible) => {
                desired.loaded = true;
                desired.visible = true;
            }
            Some(EditorOverride::ForceHidden) => desired.visible = false,
            None => {}
        }
        desired
    }

    /// Compute desired state for every tile and return what changed since the
    /// last evaluation. Tiles that left the registry are reported as unloaded.
    pub fn evaluate(&mut self, inputs: &DecisionInputs<'_>) -> Vec<DesiredChange> {
        let _span = tracing::debug_span!("streaming_decision", viewers = inputs.viewers.len()).entered();

        let inside: HashMap<VolumeHandle, bool> = inputs
            .volumes
            .iter()
            .map(|(h, v)| (h, inputs.viewers.iter().any(|p| v.contains(*p))))
            .collect();

        // Handles that left the registry. A package re-added under a new handle
        // is reported once, under the new handle.
        let gone: Vec<TileHandle> = self
            .settled
            .keys()
            .copied()
            .filter(|h| !inputs.registry.contains(*h))
            .collect();
        let mut released: BTreeMap<String, TileHandle> = BTreeMap::new();
        for handle in gone {
            self.overrides.remove(&handle);
            if let Some(s) = self.settled.remove(&handle) {
                if s.desired != DesiredState::UNLOADED {
                    released.insert(s.package, handle);
                }
            }
        }

        let mut changes = Vec::new();
        for (handle, tile) in inputs.registry.iter() {
            let desired = self.desired_for(handle, tile, inputs, &inside);
            let overridden = self.overrides.contains_key(&handle);
            match self.settled.get_mut(&handle) {
                Some(s) if s.desired == desired => {}
                Some(s) => {
                    if !overridden && inputs.now - s.changed_at < self.dwell_secs {
                        tracing::trace!(tile = %tile.package(), "streaming change held by dwell");
                        continue;
                    }
                    s.desired = desired;
                    s.changed_at = inputs.now;
                    changes.push(DesiredChange {
                        tile: handle,
                        package: tile.package().to_string(),
                        desired,
                    });
                }
                None => {
                    self.settled.insert(
                        handle,
                        Settled {
                            package: tile.package().to_string(),
                            desired,
                            changed_at: inputs.now,
                        },
                    );
                    let readded = released.remove(tile.package()).is_some();
                    if readded || desired != DesiredState::UNLOADED {
                        changes.push(DesiredChange {
                            tile: handle,
                            package: tile.package().to_string(),
                            desired,
                        });
                    }
                }
            }
        }

        for (package, handle) in released {
            changes.push(DesiredChange {
                tile: handle,
                package,
                desired: DesiredState::UNLOADED,
            });
        }

        if !changes.is_empty() {
            tracing::debug!(changes = changes.len(), "streaming changes");
        }
        changes
    }
}

/// 2D distance from a viewer to a tile's absolute bounds, or to its position
/// while the bounds are not known yet.
pub fn distance_to_tile(viewer: DVec3, tile: &Tile) -> f64 {
    match tile.bounds().placed_at(tile.absolute_position()) {
        Some((min, max)) => distance_2d_to_box(viewer, min, max),
        None => {
            let p = tile.absolute_position().as_dvec3();
            distance_2d_to_box(viewer, p, p)
        }
    }
}
