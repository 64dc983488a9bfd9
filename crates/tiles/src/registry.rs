use std::collections::{BTreeMap, HashMap, HashSet};

use worldspace_common::{Arena, Bounds, Handle, IntVector};

use crate::layer::{DEFAULT_LAYER_NAME, StreamingLayer};
use crate::manifest::{Manifest, ManifestEntryError, TileRecord};

pub type TileHandle = Handle<Tile>;

/// Errors from tile catalog mutations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("tile '{0}' not found")]
    UnknownTile(String),
    #[error("'{parent}' cannot become the parent of '{tile}': it would create a cycle")]
    InvalidParent { tile: String, parent: String },
}

/// One sub-level package participating in world composition.
#[derive(Debug, Clone)]
pub struct Tile {
    package: String,
    relative_position: IntVector,
    absolute_position: IntVector,
    bounds: Bounds,
    layer: String,
    parent: Option<TileHandle>,
    children: Vec<TileHandle>,
    landscape: bool,
}

impl Tile {
    fn from_record(record: &TileRecord, layer: String) -> Self {
        Self {
            package: record.package_name.clone(),
            relative_position: record.relative_position(),
            absolute_position: record.relative_position(),
            bounds: record.bounds.to_bounds(),
            layer,
            parent: None,
            children: Vec::new(),
            landscape: record.landscape,
        }
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn relative_position(&self) -> IntVector {
        self.relative_position
    }

    /// Parent's absolute position plus this tile's relative position.
    pub fn absolute_position(&self) -> IntVector {
        self.absolute_position
    }

    /// Package-local bounds; invalid until the level has been loaded once.
    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    pub fn layer(&self) -> &str {
        &self.layer
    }

    pub fn parent(&self) -> Option<TileHandle> {
        self.parent
    }

    pub fn children(&self) -> &[TileHandle] {
        &self.children
    }

    pub fn is_landscape(&self) -> bool {
        self.landscape
    }
}

/// Outcome of a [`TileRegistry::rescan`].
#[derive(Debug, Default)]
pub struct RescanReport {
    pub accepted: usize,
    pub removed: usize,
    pub skipped: Vec<ManifestEntryError>,
    /// Tiles whose parent was missing or would have closed a cycle; they became roots.
    pub orphaned: Vec<String>,
}

/// Single source of truth mapping package name to [`Tile`].
///
/// Parenting is a forest hanging off the persistent level: tiles without a
/// parent are placed relative to the world's zero. Cycles are rejected when a
/// parent is assigned, never discovered during traversal.
///
/// Each world owns its own registry; registries are never shared across worlds.
#[derive(Debug)]
pub struct TileRegistry {
    tiles: Arena<Tile>,
    by_name: HashMap<String, TileHandle>,
    layers: BTreeMap<String, StreamingLayer>,
}

impl Default for TileRegistry {
    fn default() -> Self {
        let mut layers = BTreeMap::new();
        layers.insert(DEFAULT_LAYER_NAME.to_string(), StreamingLayer::default());
        Self {
            tiles: Arena::new(),
            by_name: HashMap::new(),
            layers,
        }
    }
}

impl TileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry straight from a manifest.
    pub fn from_manifest(manifest: &Manifest) -> (Self, RescanReport) {
        let mut registry = Self::new();
        let report = registry.rescan(manifest);
        (registry, report)
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn get(&self, handle: TileHandle) -> Option<&Tile> {
        self.tiles.get(handle)
    }

    pub fn get_tile(&self, name: &str) -> Option<&Tile> {
        self.by_name.get(name).and_then(|h| self.tiles.get(*h))
    }

    pub fn handle_of(&self, name: &str) -> Option<TileHandle> {
        self.by_name.get(name).copied()
    }

    pub fn contains(&self, handle: TileHandle) -> bool {
        self.tiles.contains(handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = (TileHandle, &Tile)> {
        self.tiles.iter()
    }

    pub fn layers(&self) -> impl Iterator<Item = &StreamingLayer> {
        self.layers.values()
    }

    /// Streaming layer of a tile, falling back to the default layer.
    pub fn layer_of(&self, tile: &Tile) -> &StreamingLayer {
        self.layers
            .get(&tile.layer)
            .or_else(|| self.layers.get(DEFAULT_LAYER_NAME))
            .unwrap_or(&FALLBACK_LAYER)
    }

    /// Add or replace a streaming layer.
    pub fn set_layer(&mut self, layer: StreamingLayer) {
        self.layers.insert(layer.name.clone(), layer);
    }

    /// Move a tile into another layer. Unknown layers resolve to the default one.
    pub fn assign_layer(&mut self, name: &str, layer: &str) -> Result<(), RegistryError> {
        let handle = self.require(name)?;
        if let Some(tile) = self.tiles.get_mut(handle) {
            tile.layer = layer.to_string();
        }
        Ok(())
    }

    /// Re-derive the catalog from a manifest.
    ///
    /// Tiles that survive keep their handles. Malformed entries are logged and
    /// skipped; a missing parent turns the entry into a root.
    pub fn rescan(&mut self, manifest: &Manifest) -> RescanReport {
        let _span = tracing::info_span!("tile_rescan", entries = manifest.tiles.len()).entered();
        let mut report = RescanReport::default();

        self.layers.clear();
        self.layers
            .insert(DEFAULT_LAYER_NAME.to_string(), StreamingLayer::default());
        for layer in &manifest.layers {
            self.layers.insert(layer.name.clone(), layer.clone());
        }

        let mut records: Vec<TileRecord> = Vec::with_capacity(manifest.tiles.len());
        let mut seen = HashSet::new();
        for (index, value) in manifest.tiles.iter().enumerate() {
            let record = match Manifest::decode_entry(index, value) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed manifest entry");
                    report.skipped.push(e);
                    continue;
                }
            };
            if !seen.insert(record.package_name.clone()) {
                let e = ManifestEntryError::DuplicateName {
                    index,
                    name: record.package_name,
                };
                tracing::warn!(error = %e, "skipping malformed manifest entry");
                report.skipped.push(e);
                continue;
            }
            records.push(record);
        }

        // Drop tiles that left the catalog.
        let stale: Vec<String> = self
            .by_name
            .keys()
            .filter(|name| !seen.contains(*name))
            .cloned()
            .collect();
        for name in stale {
            if let Some(handle) = self.by_name.remove(&name) {
                self.tiles.remove(handle);
                report.removed += 1;
                tracing::debug!(tile = %name, "tile removed from catalog");
            }
        }

        // Insert or refresh every accepted tile, unlinked.
        for record in &records {
            let layer = if record.layer.is_empty() {
                DEFAULT_LAYER_NAME.to_string()
            } else if self.layers.contains_key(&record.layer) {
                record.layer.clone()
            } else {
                tracing::warn!(
                    tile = %record.package_name,
                    layer = %record.layer,
                    "unknown streaming layer, using default"
                );
                DEFAULT_LAYER_NAME.to_string()
            };
            let tile = Tile::from_record(record, layer);
            match self.by_name.get(&record.package_name) {
                Some(handle) => {
                    if let Some(existing) = self.tiles.get_mut(*handle) {
                        *existing = tile;
                    }
                }
                None => {
                    let handle = self.tiles.insert(tile);
                    self.by_name.insert(record.package_name.clone(), handle);
                }
            }
        }
        report.accepted = records.len();

        // Link parents one at a time so every link can be checked against the forest built so far.
        for record in &records {
            if record.parent.is_empty() {
                continue;
            }
            let Some(child) = self.handle_of(&record.package_name) else {
                continue;
            };
            let parent = match self.handle_of(&record.parent) {
                Some(p) if p != child && !self.is_ancestor_or_self(child, p) => p,
                Some(_) => {
                    tracing::warn!(
                        tile = %record.package_name,
                        parent = %record.parent,
                        "parent would create a cycle, treating tile as root"
                    );
                    report.orphaned.push(record.package_name.clone());
                    continue;
                }
                None => {
                    tracing::warn!(
                        tile = %record.package_name,
                        parent = %record.parent,
                        "parent tile not in catalog, treating tile as root"
                    );
                    report.orphaned.push(record.package_name.clone());
                    continue;
                }
            };
            self.link(child, Some(parent));
        }

        let roots: Vec<TileHandle> = self
            .tiles
            .iter()
            .filter(|(_, t)| t.parent.is_none())
            .map(|(h, _)| h)
            .collect();
        for root in roots {
            self.recompute_absolute(root);
        }

        tracing::info!(
            accepted = report.accepted,
            skipped = report.skipped.len(),
            removed = report.removed,
            orphaned = report.orphaned.len(),
            "tile rescan complete"
        );
        report
    }

    /// Set a tile's offset from its parent and re-place it and all descendants.
    pub fn update_tile_position(
        &mut self,
        name: &str,
        relative_position: IntVector,
    ) -> Result<(), RegistryError> {
        let handle = self.require(name)?;
        if let Some(tile) = self.tiles.get_mut(handle) {
            tile.relative_position = relative_position;
        }
        self.recompute_absolute(handle);
        tracing::debug!(tile = %name, ?relative_position, "tile moved");
        Ok(())
    }

    /// Hang `name` under `new_parent` (or under the persistent level when `None`).
    ///
    /// Relative position is kept, so the tile and its subtree move with the new parent.
    pub fn reparent(&mut self, name: &str, new_parent: Option<&str>) -> Result<(), RegistryError> {
        let handle = self.require(name)?;
        let parent = match new_parent {
            Some(parent_name) => {
                let parent = self.require(parent_name)?;
                if parent == handle || self.is_ancestor_or_self(handle, parent) {
                    return Err(RegistryError::InvalidParent {
                        tile: name.to_string(),
                        parent: parent_name.to_string(),
                    });
                }
                Some(parent)
            }
            None => None,
        };
        self.link(handle, parent);
        self.recompute_absolute(handle);
        tracing::debug!(tile = %name, parent = ?new_parent, "tile reparented");
        Ok(())
    }

    /// Record bounds computed from the loaded level.
    pub fn update_tile_bounds(&mut self, handle: TileHandle, bounds: Bounds) -> bool {
        match self.tiles.get_mut(handle) {
            Some(tile) => {
                tile.bounds = bounds;
                true
            }
            None => false,
        }
    }

    /// Drop a tile. Its children move to its parent with their relative positions intact.
    pub fn remove_tile(&mut self, name: &str) -> Result<Tile, RegistryError> {
        let handle = self.require(name)?;
        let (parent, children) = match self.tiles.get(handle) {
            Some(t) => (t.parent, t.children.clone()),
            None => return Err(RegistryError::UnknownTile(name.to_string())),
        };
        for child in children {
            self.link(child, parent);
            self.recompute_absolute(child);
        }
        self.link(handle, None);
        self.by_name.remove(name);
        self.tiles
            .remove(handle)
            .ok_or_else(|| RegistryError::UnknownTile(name.to_string()))
    }

    /// All tiles below `handle`, depth-first.
    pub fn descendants(&self, handle: TileHandle) -> Vec<TileHandle> {
        let mut out = Vec::new();
        let mut stack: Vec<TileHandle> = self
            .tiles
            .get(handle)
            .map(|t| t.children.clone())
            .unwrap_or_default();
        while let Some(h) = stack.pop() {
            if let Some(t) = self.tiles.get(h) {
                out.push(h);
                stack.extend(t.children.iter().copied());
            }
        }
        out
    }

    fn require(&self, name: &str) -> Result<TileHandle, RegistryError> {
        self.handle_of(name)
            .ok_or_else(|| RegistryError::UnknownTile(name.to_string()))
    }

    /// Whether `ancestor` is `node` or lies on the parent chain of `node`.
    fn is_ancestor_or_self(&self, ancestor: TileHandle, node: TileHandle) -> bool {
        let mut cursor = Some(node);
        while let Some(h) = cursor {
            if h == ancestor {
                return true;
            }
            cursor = self.tiles.get(h).and_then(|t| t.parent);
        }
        false
    }

    fn link(&mut self, child: TileHandle, parent: Option<TileHandle>) {
        let old = self.tiles.get(child).and_then(|t| t.parent);
        if let Some(old) = old {
            if let Some(p) = self.tiles.get_mut(old) {
                p.children.retain(|c| *c != child);
            }
        }
        if let Some(new) = parent {
            if let Some(p) = self.tiles.get_mut(new) {
                p.children.push(child);
            }
        }
        if let Some(c) = self.tiles.get_mut(child) {
            c.parent = parent;
        }
    }

    /// Recompute absolute positions top-down from `start`.
    fn recompute_absolute(&mut self, start: TileHandle) {
        let base = self
            .tiles
            .get(start)
            .and_then(|t| t.parent)
            .and_then(|p| self.tiles.get(p))
            .map(|p| p.absolute_position)
            .unwrap_or(IntVector::ZERO);
        let mut stack = vec![(start, base)];
        while let Some((handle, parent_absolute)) = stack.pop() {
            let Some(tile) = self.tiles.get_mut(handle) else {
                continue;
            };
            tile.absolute_position = parent_absolute + tile.relative_position;
            let absolute = tile.absolute_position;
            stack.extend(tile.children.iter().map(|c| (*c, absolute)));
        }
    }
}

static FALLBACK_LAYER: StreamingLayer = StreamingLayer {
    name: String::new(),
    streaming_distance: crate::layer::DEFAULT_STREAMING_DISTANCE,
    always_loaded: false,
};

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(records: Vec<TileRecord>) -> Manifest {
        let mut m = Manifest::new();
        for r in records {
            m.push_tile(r);
        }
        m
    }

    fn abs(registry: &TileRegistry, name: &str) -> IntVector {
        registry.get_tile(name).unwrap().absolute_position()
    }

    fn chain() -> TileRegistry {
        let m = manifest(vec![
            TileRecord::new("A", IntVector::new(100, 0, 0)),
            TileRecord::new("B", IntVector::new(10, 0, 0)).with_parent("A"),
            TileRecord::new("C", IntVector::new(1, 0, 0)).with_parent("B"),
            TileRecord::new("D", IntVector::new(0, 5, 0)),
        ]);
        TileRegistry::from_manifest(&m).0
    }

    #[test]
    fn rescan_places_root_tile() {
        let m = manifest(vec![TileRecord::new("Sub1", IntVector::new(1000, 0, 0))]);
        let (registry, report) = TileRegistry::from_manifest(&m);
        assert_eq!(report.accepted, 1);
        assert_eq!(abs(&registry, "Sub1"), IntVector::new(1000, 0, 0));
    }

    #[test]
    fn rescan_treats_missing_parent_as_root() {
        let m = manifest(vec![
            TileRecord::new("Orphan", IntVector::new(7, 0, 0)).with_parent("DoesNotExist"),
            TileRecord::new("Other", IntVector::new(1, 1, 1)),
        ]);
        let (registry, report) = TileRegistry::from_manifest(&m);
        assert_eq!(report.accepted, 2);
        assert_eq!(report.orphaned, vec!["Orphan".to_string()]);
        let tile = registry.get_tile("Orphan").unwrap();
        assert!(tile.parent().is_none());
        assert_eq!(tile.absolute_position(), IntVector::new(7, 0, 0));
    }

    #[test]
    fn rescan_skips_malformed_and_duplicate_entries() {
        let mut m = manifest(vec![
            TileRecord::new("A", IntVector::ZERO),
            TileRecord::new("A", IntVector::new(1, 0, 0)),
        ]);
        m.tiles.push(serde_json::json!({ "position": [0, 0, 0] }));
        m.tiles.push(serde_json::json!(42));
        m.push_tile(TileRecord::new("B", IntVector::new(2, 0, 0)));

        let (registry, report) = TileRegistry::from_manifest(&m);
        assert_eq!(report.accepted, 2);
        assert_eq!(report.skipped.len(), 3);
        assert_eq!(registry.len(), 2);
        assert_eq!(abs(&registry, "A"), IntVector::ZERO);
    }

    #[test]
    fn rescan_breaks_cycles_in_manifest() {
        let m = manifest(vec![
            TileRecord::new("A", IntVector::new(1, 0, 0)).with_parent("B"),
            TileRecord::new("B", IntVector::new(2, 0, 0)).with_parent("A"),
        ]);
        let (registry, report) = TileRegistry::from_manifest(&m);
        assert_eq!(report.orphaned.len(), 1);
        // A linked under B first; B's link back to A was refused.
        assert_eq!(abs(&registry, "B"), IntVector::new(2, 0, 0));
        assert_eq!(abs(&registry, "A"), IntVector::new(3, 0, 0));
    }

    #[test]
    fn rescan_keeps_handles_and_drops_missing_tiles() {
        let mut registry = chain();
        let a = registry.handle_of("A").unwrap();
        let d = registry.handle_of("D").unwrap();
        let m = manifest(vec![TileRecord::new("A", IntVector::new(5, 0, 0))]);
        let report = registry.rescan(&m);
        assert_eq!(report.removed, 3);
        assert_eq!(registry.handle_of("A"), Some(a));
        assert!(!registry.contains(d));
        assert_eq!(abs(&registry, "A"), IntVector::new(5, 0, 0));
    }

    #[test]
    fn absolute_positions_follow_ancestor_chain() {
        let registry = chain();
        assert_eq!(abs(&registry, "B"), IntVector::new(110, 0, 0));
        assert_eq!(abs(&registry, "C"), IntVector::new(111, 0, 0));
    }

    #[test]
    fn moving_a_tile_moves_descendants() {
        let mut registry = chain();
        registry
            .update_tile_position("A", IntVector::new(-100, 0, 50))
            .unwrap();
        assert_eq!(abs(&registry, "A"), IntVector::new(-100, 0, 50));
        assert_eq!(abs(&registry, "B"), IntVector::new(-90, 0, 50));
        assert_eq!(abs(&registry, "C"), IntVector::new(-89, 0, 50));
        assert_eq!(abs(&registry, "D"), IntVector::new(0, 5, 0));
    }

    #[test]
    fn reparent_rejects_self_and_descendants() {
        let mut registry = chain();
        for bad in ["A", "B", "C"] {
            let err = registry.reparent("A", Some(bad)).unwrap_err();
            assert!(matches!(err, RegistryError::InvalidParent { .. }), "{bad}");
        }
        // Registry unchanged.
        assert!(registry.get_tile("A").unwrap().parent().is_none());
        assert_eq!(abs(&registry, "C"), IntVector::new(111, 0, 0));
    }

    #[test]
    fn reparent_recomputes_subtree() {
        let mut registry = chain();
        registry.reparent("B", Some("D")).unwrap();
        assert_eq!(abs(&registry, "B"), IntVector::new(10, 5, 0));
        assert_eq!(abs(&registry, "C"), IntVector::new(11, 5, 0));
        assert!(registry.get_tile("A").unwrap().children().is_empty());

        registry.reparent("B", None).unwrap();
        assert_eq!(abs(&registry, "C"), IntVector::new(11, 0, 0));
    }

    #[test]
    fn reparent_unknown_tile_is_an_error() {
        let mut registry = chain();
        assert!(matches!(
            registry.reparent("A", Some("Nope")),
            Err(RegistryError::UnknownTile(_))
        ));
        assert!(matches!(
            registry.update_tile_position("Nope", IntVector::ZERO),
            Err(RegistryError::UnknownTile(_))
        ));
    }

    #[test]
    fn remove_tile_hands_children_to_grandparent() {
        let mut registry = chain();
        let b = registry.handle_of("B").unwrap();
        registry.remove_tile("B").unwrap();
        assert!(!registry.contains(b));
        assert!(registry.get_tile("B").is_none());
        let c = registry.get_tile("C").unwrap();
        assert_eq!(c.parent(), registry.handle_of("A"));
        assert_eq!(c.absolute_position(), IntVector::new(101, 0, 0));
    }

    #[test]
    fn descendants_cover_whole_subtree() {
        let registry = chain();
        let a = registry.handle_of("A").unwrap();
        let names: HashSet<&str> = registry
            .descendants(a)
            .into_iter()
            .map(|h| registry.get(h).unwrap().package())
            .collect();
        assert_eq!(names, HashSet::from(["B", "C"]));
    }

    #[test]
    fn unknown_layer_falls_back_to_default() {
        let mut m = manifest(vec![
            TileRecord::new("A", IntVector::ZERO).with_layer("Far"),
            TileRecord::new("B", IntVector::ZERO).with_layer("Missing"),
        ]);
        m.push_layer(StreamingLayer::new("Far", 200_000));
        let (registry, _) = TileRegistry::from_manifest(&m);
        let a = registry.get_tile("A").unwrap();
        let b = registry.get_tile("B").unwrap();
        assert_eq!(registry.layer_of(a).streaming_distance, 200_000);
        assert_eq!(registry.layer_of(b).name, DEFAULT_LAYER_NAME);
    }

    #[test]
    fn bounds_start_invalid_and_can_be_discovered() {
        let mut registry = chain();
        let a = registry.handle_of("A").unwrap();
        assert!(!registry.get(a).unwrap().bounds().is_valid());
        let b = Bounds::new(glam::Vec3::ZERO, glam::Vec3::splat(10.0));
        assert!(registry.update_tile_bounds(a, b));
        assert_eq!(registry.get(a).unwrap().bounds(), b);
    }
}
