use std::collections::BTreeSet;

use glam::DVec3;
use worldspace_common::{Arena, Handle};
use worldspace_tiles::{TileHandle, TileRegistry};

pub type VolumeHandle = Handle<StreamingVolume>;

/// What a streaming volume does to the tiles linked to it while a viewer is inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingVolumeUsage {
    /// Load, leave visibility to other rules.
    Loading,
    /// Load and keep hidden.
    LoadingNotVisible,
    LoadingAndVisibility,
    /// Load synchronously and make visible.
    VisibilityBlockingOnLoad,
    /// Load synchronously, leave visibility to other rules.
    BlockingOnLoad,
}

/// Combined effect of every volume a viewer is inside.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VolumeSettings {
    pub visible: bool,
    pub block_on_load: bool,
    /// Whether `visible` should override the visibility other rules picked.
    pub change_visibility: bool,
}

impl VolumeSettings {
    pub fn for_usage(usage: StreamingVolumeUsage) -> Self {
        use StreamingVolumeUsage::*;
        let (visible, block_on_load, change_visibility) = match usage {
            Loading => (false, false, false),
            LoadingNotVisible => (false, false, true),
            LoadingAndVisibility => (true, false, true),
            VisibilityBlockingOnLoad => (true, true, true),
            BlockingOnLoad => (false, true, false),
        };
        Self {
            visible,
            block_on_load,
            change_visibility,
        }
    }

    pub fn combine(self, other: Self) -> Self {
        Self {
            visible: self.visible || other.visible,
            block_on_load: self.block_on_load || other.block_on_load,
            change_visibility: self.change_visibility || other.change_visibility,
        }
    }
}

/// Axis-aligned trigger region in absolute world space.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingVolume {
    pub name: String,
    pub min: DVec3,
    pub max: DVec3,
    pub usage: StreamingVolumeUsage,
    pub disabled: bool,
}

impl StreamingVolume {
    pub fn new(name: impl Into<String>, a: DVec3, b: DVec3, usage: StreamingVolumeUsage) -> Self {
        Self {
            name: name.into(),
            min: a.min(b),
            max: a.max(b),
            usage,
            disabled: false,
        }
    }

    pub fn contains(&self, point: DVec3) -> bool {
        point.cmpge(self.min).all() && point.cmple(self.max).all()
    }
}

/// Streaming volumes and their many-to-many links to tiles.
///
/// Either side can go away on its own; links to it are pruned.
#[derive(Debug, Default)]
pub struct VolumeSet {
    volumes: Arena<StreamingVolume>,
    links: BTreeSet<(VolumeHandle, TileHandle)>,
}

impl VolumeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_volume(&mut self, volume: StreamingVolume) -> VolumeHandle {
        self.volumes.insert(volume)
    }

    pub fn get(&self, handle: VolumeHandle) -> Option<&StreamingVolume> {
        self.volumes.get(handle)
    }

    pub fn get_mut(&mut self, handle: VolumeHandle) -> Option<&mut StreamingVolume> {
        self.volumes.get_mut(handle)
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (VolumeHandle, &StreamingVolume)> {
        self.volumes.iter()
    }

    pub fn remove_volume(&mut self, handle: VolumeHandle) -> Option<StreamingVolume> {
        self.links.retain(|(v, _)| *v != handle);
        self.volumes.remove(handle)
    }

    /// Link a volume to a tile. Returns `false` for a stale volume handle.
    pub fn associate(&mut self, volume: VolumeHandle, tile: TileHandle) -> bool {
        if !self.volumes.contains(volume) {
            return false;
        }
        self.links.insert((volume, tile));
        true
    }

    pub fn dissociate(&mut self, volume: VolumeHandle, tile: TileHandle) -> bool {
        self.links.remove(&(volume, tile))
    }

    /// Enabled volumes linked to `tile`.
    pub fn volumes_for(&self, tile: TileHandle) -> impl Iterator<Item = (VolumeHandle, &StreamingVolume)> {
        self.links
            .iter()
            .filter(move |(_, t)| *t == tile)
            .filter_map(|(v, _)| self.volumes.get(*v).map(|vol| (*v, vol)))
            .filter(|(_, vol)| !vol.disabled)
    }

    pub fn remove_tile_links(&mut self, tile: TileHandle) -> usize {
        let before = self.links.len();
        self.links.retain(|(_, t)| *t != tile);
        before - self.links.len()
    }

    /// Drop links whose tile is no longer in `registry`.
    pub fn prune(&mut self, registry: &TileRegistry) -> usize {
        let before = self.links.len();
        self.links.retain(|(_, t)| registry.contains(*t));
        let pruned = before - self.links.len();
        if pruned > 0 {
            tracing::debug!(pruned, "pruned streaming volume links to removed tiles");
        }
        pruned
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use worldspace_common::IntVector;
    use worldspace_tiles::{Manifest, TileRecord};

    #[test]
    fn settings_combine_with_or() {
        let a = VolumeSettings::for_usage(StreamingVolumeUsage::Loading);
        let b = VolumeSettings::for_usage(StreamingVolumeUsage::BlockingOnLoad);
        let c = VolumeSettings::for_usage(StreamingVolumeUsage::LoadingAndVisibility);
        let combined = a.combine(b).combine(c);
        assert!(combined.visible);
        assert!(combined.block_on_load);
        assert!(combined.change_visibility);
        assert_eq!(a.combine(b), VolumeSettings {
            visible: false,
            block_on_load: true,
            change_visibility: false,
        });
    }

    #[test]
    fn contains_is_inclusive() {
        let v = StreamingVolume::new(
            "v",
            DVec3::new(10.0, 10.0, 10.0),
            DVec3::ZERO,
            StreamingVolumeUsage::Loading,
        );
        assert!(v.contains(DVec3::ZERO));
        assert!(v.contains(DVec3::splat(10.0)));
        assert!(!v.contains(DVec3::new(10.1, 5.0, 5.0)));
    }

    #[test]
    fn links_are_pruned_from_either_side() {
        let mut manifest = Manifest::new();
        manifest.push_tile(TileRecord::new("/Game/A", IntVector::ZERO));
        manifest.push_tile(TileRecord::new("/Game/B", IntVector::ZERO));
        let (mut registry, _) = TileRegistry::from_manifest(&manifest);
        let a = registry.handle_of("/Game/A").unwrap();
        let b = registry.handle_of("/Game/B").unwrap();

        let mut set = VolumeSet::new();
        let v1 = set.add_volume(StreamingVolume::new(
            "v1",
            DVec3::ZERO,
            DVec3::ONE,
            StreamingVolumeUsage::Loading,
        ));
        let v2 = set.add_volume(StreamingVolume::new(
            "v2",
            DVec3::ZERO,
            DVec3::ONE,
            StreamingVolumeUsage::Loading,
        ));
        assert!(set.associate(v1, a));
        assert!(set.associate(v1, b));
        assert!(set.associate(v2, a));
        assert_eq!(set.volumes_for(a).count(), 2);

        set.remove_volume(v2);
        assert!(!set.associate(v2, b));
        assert_eq!(set.volumes_for(a).count(), 1);

        registry.remove_tile("/Game/A").unwrap();
        assert_eq!(set.prune(&registry), 1);
        assert_eq!(set.link_count(), 1);
    }

    #[test]
    fn disabled_volumes_are_ignored() {
        let mut set = VolumeSet::new();
        let mut registry = TileRegistry::new();
        let mut manifest = Manifest::new();
        manifest.push_tile(TileRecord::new("/Game/A", IntVector::ZERO));
        registry.rescan(&manifest);
        let a = registry.handle_of("/Game/A").unwrap();
        let v = set.add_volume(StreamingVolume::new(
            "v",
            DVec3::ZERO,
            DVec3::ONE,
            StreamingVolumeUsage::Loading,
        ));
        set.associate(v, a);
        set.get_mut(v).unwrap().disabled = true;
        assert_eq!(set.volumes_for(a).count(), 0);
    }
}
