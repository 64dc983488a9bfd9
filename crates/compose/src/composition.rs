use std::path::Path;
use std::time::Instant;

use glam::{DVec3, Vec3};
use worldspace_common::IntVector;
use worldspace_kernel::{
    CompositionEvent, CompositionObserver, Notifier, OriginError, OriginTracker, RebaseOutcome,
    WorldServices,
};
use worldspace_stream::{
    DecisionInputs, EditorOverride, GcCoordinator, LevelTable, LifecycleSettings, LoadQueue,
    PackageLoader, StreamStats, StreamingContext, StreamingDecisionEngine, StreamingVolume,
    TickBudget, TickTimer, VolumeHandle, VolumeSet, distance_to_tile,
};
use worldspace_tiles::{Manifest, ManifestError, RegistryError, RescanReport, Tile, TileRegistry};

use crate::config::{CompositionConfig, ConfigError};

/// Rounds of load/update a flush runs before it gives up.
const MAX_FLUSH_ROUNDS: usize = 64;

const TICK_HISTORY: usize = 120;

#[derive(Debug, thiserror::Error)]
pub enum CompositionError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Origin(#[from] OriginError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("streaming made no progress after {0} flush rounds")]
    FlushStalled(usize),
}

/// A composed world: the one handle a host holds.
///
/// Owns the tile catalog, the origin, the level table and every collaborator.
/// Nothing here is shared with another world.
pub struct WorldComposition {
    config: CompositionConfig,
    settings: LifecycleSettings,
    registry: TileRegistry,
    origin: OriginTracker,
    table: LevelTable,
    decision: StreamingDecisionEngine,
    volumes: VolumeSet,
    gc: GcCoordinator,
    services: WorldServices,
    loader: Box<dyn PackageLoader>,
    queue: LoadQueue,
    notifier: Notifier,
    /// Viewer positions in absolute space.
    viewers: Vec<DVec3>,
    time: f64,
    stats: StreamStats,
    timer: TickTimer,
}

impl WorldComposition {
    pub fn new(
        config: CompositionConfig,
        registry: TileRegistry,
        mut services: WorldServices,
        loader: Box<dyn PackageLoader>,
    ) -> Self {
        if !config.networked && services.network.take().is_some() {
            tracing::debug!("network layer dropped: world is not networked");
        } else if config.networked && !services.is_networked() {
            tracing::warn!("networked world created without a network layer");
        }
        tracing::info!(
            tiles = registry.len(),
            world_kind = ?config.world_kind,
            budget = ?config.activation_budget,
            "world composition created"
        );
        Self {
            settings: config.lifecycle_settings(),
            decision: StreamingDecisionEngine::new(config.decision.dwell_secs),
            config,
            registry,
            origin: OriginTracker::new(),
            table: LevelTable::new(),
            volumes: VolumeSet::new(),
            gc: GcCoordinator::new(),
            services,
            loader,
            queue: LoadQueue::new(),
            notifier: Notifier::new(),
            viewers: Vec::new(),
            time: 0.0,
            stats: StreamStats::default(),
            timer: TickTimer::new(TICK_HISTORY),
        }
    }

    pub fn from_manifest(
        config: CompositionConfig,
        manifest: &Manifest,
        services: WorldServices,
        loader: Box<dyn PackageLoader>,
    ) -> (Self, RescanReport) {
        let (registry, report) = TileRegistry::from_manifest(manifest);
        (Self::new(config, registry, services, loader), report)
    }

    /// Build a world from a manifest file on disk.
    pub fn open(
        config: CompositionConfig,
        manifest_path: impl AsRef<Path>,
        services: WorldServices,
        loader: Box<dyn PackageLoader>,
    ) -> Result<(Self, RescanReport), CompositionError> {
        let manifest = Manifest::load(manifest_path)?;
        Ok(Self::from_manifest(config, &manifest, services, loader))
    }

    pub fn config(&self) -> &CompositionConfig {
        &self.config
    }

    pub fn registry(&self) -> &TileRegistry {
        &self.registry
    }

    pub fn origin(&self) -> &OriginTracker {
        &self.origin
    }

    pub fn table(&self) -> &LevelTable {
        &self.table
    }

    pub fn volumes(&self) -> &VolumeSet {
        &self.volumes
    }

    pub fn volumes_mut(&mut self) -> &mut VolumeSet {
        &mut self.volumes
    }

    pub fn viewers(&self) -> &[DVec3] {
        &self.viewers
    }

    /// Seconds of simulated time since the world was created.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Statistics of the last tick.
    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    pub fn timer(&self) -> &TickTimer {
        &self.timer
    }

    pub fn subscribe(&mut self, observer: Box<dyn CompositionObserver>) {
        self.notifier.subscribe(observer);
    }

    pub fn events(&self) -> &[CompositionEvent] {
        self.notifier.events()
    }

    pub fn drain_events(&mut self) -> Vec<CompositionEvent> {
        self.notifier.drain_events()
    }

    /// Replace the viewer set. Positions are in render space.
    pub fn set_viewers(&mut self, local: &[Vec3]) {
        self.viewers = local
            .iter()
            .map(|p| self.origin.local_point_to_world(*p))
            .collect();
    }

    /// Add a streaming volume and link it to the named tiles.
    pub fn add_volume(
        &mut self,
        volume: StreamingVolume,
        tiles: &[&str],
    ) -> Result<VolumeHandle, CompositionError> {
        let handles = tiles
            .iter()
            .map(|name| {
                self.registry
                    .handle_of(name)
                    .ok_or_else(|| RegistryError::UnknownTile(name.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let volume = self.volumes.add_volume(volume);
        for tile in handles {
            self.volumes.associate(volume, tile);
        }
        Ok(volume)
    }

    fn with_ctx<R>(&mut self, f: impl FnOnce(&mut LevelTable, &mut StreamingContext<'_>) -> R) -> R {
        let Self {
            settings,
            registry,
            origin,
            table,
            gc,
            services,
            loader,
            queue,
            notifier,
            stats,
            ..
        } = self;
        let mut ctx = StreamingContext {
            registry,
            origin,
            services,
            loader: &mut **loader,
            queue,
            gc,
            notifier,
            stats,
            settings,
        };
        f(table, &mut ctx)
    }

    fn drain_completions(&mut self) {
        let completions = self.queue.drain();
        if completions.is_empty() {
            return;
        }
        self.with_ctx(|table, ctx| {
            for completion in completions {
                table.complete_load(ctx, completion);
            }
        });
    }

    fn evaluate(&mut self) {
        let inputs = DecisionInputs {
            registry: &self.registry,
            volumes: &self.volumes,
            viewers: &self.viewers,
            now: self.time,
        };
        let changes = self.decision.evaluate(&inputs);
        self.table.apply_desired(changes);
    }

    fn update(&mut self, mut budget: TickBudget) {
        self.with_ctx(|table, ctx| table.update(ctx, &mut budget));
    }

    /// Advance the world by `dt` seconds.
    ///
    /// Applies a pending rebase if nothing is mid-transition, takes load
    /// completions, re-evaluates streaming, then advances the level table
    /// within the activation budget.
    pub fn tick(&mut self, dt: f64) -> StreamStats {
        let start = Instant::now();
        self.time += dt.max(0.0);
        let _span = tracing::info_span!("composition_tick", time = self.time).entered();
        self.stats = StreamStats::default();

        if self.config.rebase.enabled {
            if let Some(viewer) = self.viewers.first().copied() {
                let local = (viewer - self.origin.current().as_dvec3()).as_vec3();
                self.request_origin_rebase(local);
            }
        }
        if self.origin.has_pending_rebase() {
            if let Err(e) = self.apply_pending_rebase() {
                tracing::debug!(error = %e, "rebase retried next tick");
            }
        }

        self.drain_completions();
        self.evaluate();
        self.update(self.config.tick_budget());

        if self.config.auto_collect_garbage
            && self.gc.num_pending_purge() > 0
            && !self.table.is_transition_in_progress()
        {
            self.collect_garbage();
        }

        let elapsed = start.elapsed();
        self.stats.tick_time = elapsed;
        self.timer.record(elapsed);
        self.stats.clone()
    }

    /// Request a rebase when the viewer has drifted farther than the configured
    /// distance from the origin. Returns whether a rebase was requested.
    ///
    /// The new origin moves by the viewer's rounded offset; Z is kept unless
    /// rebasing in 3D.
    pub fn request_origin_rebase(&mut self, viewer_local: Vec3) -> bool {
        let rebase = &self.config.rebase;
        let local = viewer_local.as_dvec3();
        let drift = if rebase.in_3d {
            local.length()
        } else {
            local.truncate().length()
        };
        if drift <= rebase.distance {
            return false;
        }
        let mut shift = IntVector::new(
            local.x.round() as i64,
            local.y.round() as i64,
            local.z.round() as i64,
        );
        if !rebase.in_3d {
            shift.z = 0;
        }
        tracing::debug!(drift, ?shift, "viewer drifted from origin");
        self.origin.request_rebase(self.origin.current() + shift);
        true
    }

    pub fn request_rebase_to(&mut self, origin: IntVector) {
        self.origin.request_rebase(origin);
    }

    /// Apply the requested origin now. Fails with [`OriginError::RebaseDeferred`]
    /// while a level is being added to or removed from the world.
    pub fn apply_pending_rebase(&mut self) -> Result<RebaseOutcome, OriginError> {
        let busy = self.table.is_transition_in_progress();
        let outcome = self.origin.apply_pending_rebase(
            busy,
            self.table.levels_mut().values_mut(),
            &mut self.services,
            &mut self.notifier,
        )?;
        if outcome.shifted() {
            self.update_shelving();
        }
        Ok(outcome)
    }

    /// Shelve loaded levels that ended up too far from the origin; unshelve the rest.
    fn update_shelving(&mut self) {
        let Some(limit) = self.config.shelve_distance else {
            return;
        };
        let center = self.origin.current().as_dvec3();
        let decisions: Vec<(String, bool)> = self
            .table
            .records()
            .filter(|r| r.level().is_some())
            .filter_map(|r| {
                self.registry
                    .get(r.tile())
                    .map(|t| (r.package().to_string(), distance_to_tile(center, t) > limit))
            })
            .collect();
        for (package, shelve) in decisions {
            self.table.set_shelved(&package, shelve, &mut self.notifier);
        }
    }

    /// Run streaming to completion with no budget.
    ///
    /// Returns the number of rounds it took. A round that changes nothing while
    /// work is still outstanding means the loader cannot finish; that is
    /// reported as [`CompositionError::FlushStalled`].
    pub fn flush_all_pending(&mut self) -> Result<usize, CompositionError> {
        let _span = tracing::info_span!("flush_all_pending").entered();
        self.drain_completions();
        self.evaluate();

        let mut rounds = 0;
        while self.table.has_pending_work() {
            if rounds == MAX_FLUSH_ROUNDS {
                return Err(CompositionError::FlushStalled(rounds));
            }
            rounds += 1;
            let before = self.table.snapshot();
            self.loader.flush();
            self.drain_completions();
            self.update(TickBudget::unlimited());
            if self.table.has_pending_work() && self.table.snapshot() == before {
                tracing::warn!(rounds, "flush made no progress");
                return Err(CompositionError::FlushStalled(rounds));
            }
        }

        if self.origin.has_pending_rebase() {
            self.apply_pending_rebase()?;
        }
        if self.config.auto_collect_garbage && self.gc.num_pending_purge() > 0 {
            self.collect_garbage();
        }
        tracing::debug!(rounds, "flush complete");
        Ok(rounds)
    }

    /// Collection safe point. Returns the packages whose levels were freed.
    pub fn collect_garbage(&mut self) -> Vec<String> {
        self.table.collect_garbage(
            &mut self.gc,
            &mut self.services,
            &mut self.notifier,
            &mut self.stats,
            self.config.verify_collection,
        )
    }

    pub fn num_pending_purge(&self) -> usize {
        self.gc.num_pending_purge()
    }

    /// Move the origin to `location`, put the viewer there and stream in
    /// everything it needs before returning.
    pub fn navigate_to(&mut self, location: IntVector) -> Result<usize, CompositionError> {
        tracing::info!(?location, "navigating");
        self.origin.request_rebase(location);
        if let Err(OriginError::RebaseDeferred) = self.apply_pending_rebase() {
            self.flush_all_pending()?;
            self.apply_pending_rebase()?;
        }
        self.viewers = vec![location.as_dvec3()];
        self.decision.clear_dwell();
        self.flush_all_pending()
    }

    pub fn set_editor_override(
        &mut self,
        tile: &str,
        value: Option<EditorOverride>,
    ) -> Result<(), CompositionError> {
        let handle = self
            .registry
            .handle_of(tile)
            .ok_or_else(|| RegistryError::UnknownTile(tile.to_string()))?;
        self.decision.set_override(handle, value);
        Ok(())
    }

    /// Move a tile relative to its parent. Shown levels of the tile and its
    /// subtree move with it.
    pub fn update_tile_position(
        &mut self,
        tile: &str,
        relative_position: IntVector,
    ) -> Result<(), CompositionError> {
        self.registry.update_tile_position(tile, relative_position)?;
        self.table.replace_moved_levels(&self.registry, &self.origin);
        Ok(())
    }

    pub fn reparent(&mut self, tile: &str, new_parent: Option<&str>) -> Result<(), CompositionError> {
        self.registry.reparent(tile, new_parent)?;
        self.table.replace_moved_levels(&self.registry, &self.origin);
        Ok(())
    }

    /// Rebuild the catalog from `manifest`. Links to tiles that disappeared are
    /// dropped; shown levels follow tiles whose position changed.
    pub fn rescan(&mut self, manifest: &Manifest) -> RescanReport {
        let report = self.registry.rescan(manifest);
        let pruned = self.volumes.prune(&self.registry);
        if pruned > 0 {
            tracing::debug!(pruned, "volume links pruned after rescan");
        }
        self.table.replace_moved_levels(&self.registry, &self.origin);
        report
    }

    /// Drop a tile from the catalog. Its level is unloaded on the next tick;
    /// its children keep their place relative to the new parent.
    pub fn remove_tile(&mut self, tile: &str) -> Result<Tile, CompositionError> {
        let handle = self.registry.handle_of(tile);
        let removed = self.registry.remove_tile(tile)?;
        if let Some(handle) = handle {
            self.volumes.remove_tile_links(handle);
        }
        self.table.replace_moved_levels(&self.registry, &self.origin);
        Ok(removed)
    }

    /// Load a fresh instance of a loaded tile.
    pub fn reload_tile(&mut self, tile: &str) -> bool {
        self.with_ctx(|table, ctx| table.reload(tile, ctx))
    }

    /// Drop a tile's level immediately, whatever state it is in.
    pub fn force_unload(&mut self, tile: &str) -> bool {
        let unloaded = self.with_ctx(|table, ctx| table.force_unload(tile, ctx));
        if unloaded {
            if let Some(handle) = self.registry.handle_of(tile) {
                self.decision.forget(handle);
            }
        }
        unloaded
    }

    /// Unload and free every level. The catalog and origin stay as they are.
    pub fn shutdown(&mut self) -> usize {
        let _span = tracing::info_span!("composition_shutdown").entered();
        let unloaded = self.with_ctx(|table, ctx| table.force_unload_all(ctx));
        self.collect_garbage();
        self.decision = StreamingDecisionEngine::new(self.config.decision.dwell_secs);
        self.viewers.clear();
        tracing::info!(unloaded, "world composition shut down");
        unloaded
    }
}

impl std::fmt::Debug for WorldComposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldComposition")
            .field("tiles", &self.registry.len())
            .field("records", &self.table.len())
            .field("origin", &self.origin.current())
            .field("viewers", &self.viewers.len())
            .field("time", &self.time)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ActivationBudget;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::cell::RefCell;
    use std::rc::Rc;
    use worldspace_common::Transform;
    use worldspace_kernel::recording::{CallLog, SceneCall, recording_services};
    use worldspace_kernel::{Actor, PackageContents};
    use worldspace_stream::{
        ActivationStep, InMemoryLoader, LevelState, LoadError, LoadReply, StreamingVolumeUsage,
        WorldKind,
    };
    use worldspace_tiles::TileRecord;

    fn contents() -> PackageContents {
        PackageContents {
            actors: vec![
                Actor::new(Transform::from_position(Vec3::new(5.0, 0.0, 0.0))),
                Actor::new(Transform::default()).with_net_relevance(true),
            ],
            is_landscape: false,
        }
    }

    fn world(
        config: CompositionConfig,
        tiles: &[(&str, IntVector)],
        loader: InMemoryLoader,
    ) -> (WorldComposition, CallLog) {
        let mut manifest = Manifest::new();
        for (name, position) in tiles {
            manifest.push_tile(TileRecord::new(*name, *position));
            loader.insert(*name, contents());
        }
        let (services, log) = recording_services(config.networked);
        let (world, report) =
            WorldComposition::from_manifest(config, &manifest, services, Box::new(loader));
        assert!(report.skipped.is_empty());
        (world, log)
    }

    fn stepped(steps: u32) -> CompositionConfig {
        CompositionConfig {
            activation_budget: ActivationBudget::Steps { steps },
            use_background_streaming: false,
            networked: true,
            ..CompositionConfig::default()
        }
    }

    fn unlimited() -> CompositionConfig {
        CompositionConfig {
            activation_budget: ActivationBudget::Unlimited,
            use_background_streaming: false,
            ..CompositionConfig::default()
        }
    }

    const DT: f64 = 1.0 / 60.0;

    #[test]
    fn activation_finishes_after_six_single_step_ticks() {
        let (mut w, log) = world(
            stepped(1),
            &[("/Game/Sub1", IntVector::new(1000, 0, 0))],
            InMemoryLoader::new(),
        );
        w.set_viewers(&[Vec3::new(1000.0, 0.0, 0.0)]);

        for tick in 1..=5 {
            w.tick(DT);
            assert_eq!(log.count(|c| matches!(c, SceneCall::AddLevel(_))), 0, "tick {tick}");
            assert!(matches!(
                w.table().state_of("/Game/Sub1"),
                Some(LevelState::ActivationInProgress(_))
            ));
        }
        w.tick(DT);
        assert_eq!(
            w.table().state_of("/Game/Sub1"),
            Some(LevelState::Loaded { visible: true })
        );
        assert_eq!(log.count(|c| matches!(c, SceneCall::AddLevel(_))), 1);
        assert_eq!(log.count(|c| matches!(c, SceneCall::LevelVisible(_))), 1);
    }

    #[test]
    fn rebase_waits_for_activation_in_progress() {
        let absolute = IntVector::new(1000, 0, 0);
        let (mut w, _log) = world(stepped(1), &[("/Game/Sub1", absolute)], InMemoryLoader::new());
        w.set_viewers(&[Vec3::new(1000.0, 0.0, 0.0)]);
        for _ in 0..3 {
            w.tick(DT);
        }
        assert_eq!(
            w.table().state_of("/Game/Sub1"),
            Some(LevelState::ActivationInProgress(ActivationStep::InitializeNetworkActors))
        );

        let target = IntVector::new(5000, 0, 0);
        w.request_rebase_to(target);
        assert_eq!(w.apply_pending_rebase(), Err(OriginError::RebaseDeferred));

        for _ in 0..3 {
            w.tick(DT);
        }
        assert_eq!(
            w.table().state_of("/Game/Sub1"),
            Some(LevelState::Loaded { visible: true })
        );
        assert_eq!(w.origin().current(), IntVector::ZERO);

        let outcome = w.apply_pending_rebase().unwrap();
        assert_eq!(outcome.levels_shifted, 1);
        assert_eq!(w.origin().current(), target);
        let level = w.table().level_of("/Game/Sub1").unwrap();
        assert_eq!(level.offset(), IntVector::new(-4000, 0, 0));
        assert_eq!(w.origin().world_to_local(absolute) + w.origin().current(), absolute);
        assert!(matches!(
            w.events().last(),
            Some(CompositionEvent::OriginShifted { to, .. }) if *to == target
        ));
    }

    #[test]
    fn flush_completes_deferred_loads() {
        let loader = InMemoryLoader::deferred();
        let (mut w, log) = world(
            CompositionConfig::default(),
            &[("/Game/A", IntVector::ZERO), ("/Game/B", IntVector::new(2000, 0, 0))],
            loader.clone(),
        );
        w.set_viewers(&[Vec3::ZERO]);

        w.tick(DT);
        assert_eq!(loader.pending(), 2);

        let rounds = w.flush_all_pending().unwrap();
        assert!(rounds >= 1);
        assert_eq!(loader.pending(), 0);
        for name in ["/Game/A", "/Game/B"] {
            assert_eq!(w.table().state_of(name), Some(LevelState::Loaded { visible: true }));
        }
        assert_eq!(log.count(|c| matches!(c, SceneCall::AddLevel(_))), 2);
        assert!(!w.table().has_pending_work());
    }

    struct Unresponsive;

    impl PackageLoader for Unresponsive {
        fn load_async(&mut self, _package: &str, _reply: LoadReply) {}

        fn load_sync(&mut self, package: &str) -> Result<PackageContents, LoadError> {
            Err(LoadError::Missing(package.to_string()))
        }
    }

    #[test]
    fn flush_reports_a_loader_that_never_answers() {
        let mut manifest = Manifest::new();
        manifest.push_tile(TileRecord::new("/Game/A", IntVector::ZERO));
        let (mut w, _) = WorldComposition::from_manifest(
            CompositionConfig::default(),
            &manifest,
            WorldServices::headless(),
            Box::new(Unresponsive),
        );
        w.set_viewers(&[Vec3::ZERO]);
        assert!(matches!(
            w.flush_all_pending(),
            Err(CompositionError::FlushStalled(_))
        ));
        assert_eq!(w.table().state_of("/Game/A"), Some(LevelState::LoadRequested));
    }

    #[test]
    fn rebase_is_requested_past_the_drift_distance() {
        let config = CompositionConfig {
            rebase: crate::config::RebaseConfig {
                enabled: true,
                distance: 10_000.0,
                in_3d: false,
            },
            ..unlimited()
        };
        let (mut w, _) = world(config, &[], InMemoryLoader::new());

        assert!(!w.request_origin_rebase(Vec3::new(5000.0, 5000.0, 90_000.0)));
        assert!(!w.origin().has_pending_rebase());

        assert!(w.request_origin_rebase(Vec3::new(12_000.4, -3.0, 900.0)));
        assert_eq!(w.origin().requested(), IntVector::new(12_000, -3, 0));
        w.apply_pending_rebase().unwrap();
        assert_eq!(w.origin().current(), IntVector::new(12_000, -3, 0));
    }

    #[test]
    fn tick_rebases_toward_a_distant_viewer() {
        let config = CompositionConfig {
            rebase: crate::config::RebaseConfig {
                enabled: true,
                distance: 10_000.0,
                in_3d: false,
            },
            ..unlimited()
        };
        let far = IntVector::new(20_000, 0, 0);
        let (mut w, log) = world(config, &[("/Game/Far", far)], InMemoryLoader::new());
        w.set_viewers(&[Vec3::new(20_000.0, 0.0, 0.0)]);

        w.tick(DT);
        assert_eq!(w.origin().current(), far);
        assert_eq!(w.viewers(), &[far.as_dvec3()]);
        let level = w.table().level_of("/Game/Far").unwrap();
        assert!(level.is_visible());
        assert_eq!(level.offset(), IntVector::ZERO);
        assert_eq!(
            log.count(|c| matches!(c, SceneCall::RenderOffset(o) if *o == Vec3::new(-20_000.0, 0.0, 0.0))),
            1
        );

        w.tick(DT);
        assert_eq!(w.origin().current(), far);
    }

    #[test]
    fn levels_far_from_the_new_origin_are_shelved() {
        let config = CompositionConfig {
            shelve_distance: Some(45_000.0),
            ..unlimited()
        };
        let (mut w, _) = world(
            config,
            &[("/Game/Near", IntVector::ZERO), ("/Game/Far", IntVector::new(40_000, 0, 0))],
            InMemoryLoader::new(),
        );
        w.set_viewers(&[Vec3::ZERO]);
        w.tick(DT);
        assert!(w.table().record("/Game/Far").unwrap().is_visible());

        w.request_rebase_to(IntVector::new(-20_000, 0, 0));
        w.apply_pending_rebase().unwrap();
        assert!(w.table().record("/Game/Far").unwrap().is_shelved());
        assert!(!w.table().record("/Game/Near").unwrap().is_shelved());
        w.tick(DT);
        assert_eq!(
            w.table().state_of("/Game/Far"),
            Some(LevelState::Loaded { visible: false })
        );
        assert!(w.table().record("/Game/Near").unwrap().is_visible());

        w.request_rebase_to(IntVector::ZERO);
        w.apply_pending_rebase().unwrap();
        w.tick(DT);
        let far = w.table().level_of("/Game/Far").unwrap();
        assert!(far.is_visible());
        assert_eq!(far.offset(), IntVector::new(40_000, 0, 0));
        let shelving: Vec<&CompositionEvent> = w
            .events()
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    CompositionEvent::LevelShelved { .. } | CompositionEvent::LevelUnshelved { .. }
                )
            })
            .collect();
        assert_eq!(
            shelving,
            vec![
                &CompositionEvent::LevelShelved { package: "/Game/Far".into() },
                &CompositionEvent::LevelUnshelved { package: "/Game/Far".into() },
            ]
        );
    }

    #[test]
    fn navigate_to_streams_the_destination_in() {
        let loader = InMemoryLoader::deferred();
        let destination = IntVector::new(200_000, 0, 0);
        let (mut w, _) = world(
            CompositionConfig::default(),
            &[("/Game/A", IntVector::ZERO), ("/Game/B", destination)],
            loader,
        );
        w.set_viewers(&[Vec3::ZERO]);
        w.flush_all_pending().unwrap();
        assert!(w.table().record("/Game/A").unwrap().is_visible());

        w.navigate_to(destination).unwrap();
        assert_eq!(w.origin().current(), destination);
        let b = w.table().level_of("/Game/B").unwrap();
        assert!(b.is_visible());
        assert_eq!(b.offset(), IntVector::ZERO);
        assert!(w.table().record("/Game/A").is_none());
        assert_eq!(w.num_pending_purge(), 0);
        assert!(w.events().contains(&CompositionEvent::LevelCollected {
            package: "/Game/A".into()
        }));
    }

    #[test]
    fn reload_swaps_in_a_fresh_instance() {
        let loader = InMemoryLoader::new();
        let (mut w, log) = world(unlimited(), &[("/Game/A", IntVector::ZERO)], loader.clone());
        w.set_viewers(&[Vec3::ZERO]);
        w.tick(DT);
        let old = w.table().record("/Game/A").unwrap().level().unwrap();

        assert!(w.reload_tile("/Game/A"));
        assert!(!w.reload_tile("/Game/Missing"));
        w.tick(DT);

        let record = w.table().record("/Game/A").unwrap();
        assert!(record.is_visible());
        assert_ne!(record.level(), Some(old));
        assert_eq!(loader.requests().len(), 2);
        assert_eq!(log.count(|c| matches!(c, SceneCall::ReleaseLevel(_))), 1);
        assert!(!w.table().levels().contains(old));
    }

    #[test]
    fn shutdown_frees_everything() {
        let (mut w, _) = world(
            unlimited(),
            &[("/Game/A", IntVector::ZERO), ("/Game/B", IntVector::new(100, 0, 0))],
            InMemoryLoader::new(),
        );
        w.set_viewers(&[Vec3::ZERO]);
        w.tick(DT);
        assert_eq!(w.table().levels().len(), 2);

        assert_eq!(w.shutdown(), 2);
        assert!(w.table().is_empty());
        assert!(w.table().levels().is_empty());
        assert!(w.viewers().is_empty());
        let collected = w
            .events()
            .iter()
            .filter(|e| matches!(e, CompositionEvent::LevelCollected { .. }))
            .count();
        assert_eq!(collected, 2);

        w.tick(DT);
        assert!(w.table().is_empty());
    }

    #[test]
    fn removed_tile_is_unloaded_and_unlinked() {
        let (mut w, _) = world(unlimited(), &[("/Game/A", IntVector::ZERO)], InMemoryLoader::new());
        w.add_volume(
            StreamingVolume::new(
                "Hall",
                DVec3::splat(-10.0),
                DVec3::splat(10.0),
                StreamingVolumeUsage::LoadingAndVisibility,
            ),
            &["/Game/A"],
        )
        .unwrap();
        w.set_viewers(&[Vec3::ZERO]);
        w.tick(DT);
        assert!(w.table().record("/Game/A").unwrap().is_visible());

        let removed = w.remove_tile("/Game/A").unwrap();
        assert_eq!(removed.package(), "/Game/A");
        assert_eq!(w.volumes().link_count(), 0);
        w.tick(DT);
        assert!(w.table().record("/Game/A").is_none());
        assert!(w.table().levels().is_empty());
        assert!(matches!(
            w.remove_tile("/Game/A"),
            Err(CompositionError::Registry(RegistryError::UnknownTile(_)))
        ));
    }

    #[test]
    fn volume_outside_the_viewer_unloads_linked_tile() {
        let (mut w, _) = world(unlimited(), &[("/Game/A", IntVector::ZERO)], InMemoryLoader::new());
        assert!(w
            .add_volume(
                StreamingVolume::new("X", DVec3::ZERO, DVec3::ONE, StreamingVolumeUsage::Loading),
                &["/Game/Nope"],
            )
            .is_err());
        assert!(w.volumes().is_empty());

        w.add_volume(
            StreamingVolume::new(
                "Far",
                DVec3::splat(5000.0),
                DVec3::splat(6000.0),
                StreamingVolumeUsage::LoadingAndVisibility,
            ),
            &["/Game/A"],
        )
        .unwrap();
        w.set_viewers(&[Vec3::ZERO]);
        w.tick(DT);
        assert!(w.table().record("/Game/A").is_none());
    }

    #[test]
    fn editor_world_activates_in_one_tick() {
        let config = CompositionConfig {
            world_kind: WorldKind::Editor,
            activation_budget: ActivationBudget::Steps { steps: 1 },
            ..CompositionConfig::default()
        };
        let (mut w, _) = world(config, &[("/Game/A", IntVector::ZERO)], InMemoryLoader::deferred());
        w.set_viewers(&[Vec3::ZERO]);
        w.tick(DT);
        assert_eq!(w.table().state_of("/Game/A"), Some(LevelState::Loaded { visible: true }));
    }

    #[test]
    fn editor_override_hides_a_wanted_tile() {
        let (mut w, _) = world(unlimited(), &[("/Game/A", IntVector::ZERO)], InMemoryLoader::new());
        w.set_viewers(&[Vec3::ZERO]);
        w.set_editor_override("/Game/A", Some(EditorOverride::ForceHidden))
            .unwrap();
        w.tick(DT);
        assert_eq!(
            w.table().state_of("/Game/A"),
            Some(LevelState::Loaded { visible: false })
        );

        w.set_editor_override("/Game/A", None).unwrap();
        w.tick(DT + 5.0);
        assert_eq!(w.table().state_of("/Game/A"), Some(LevelState::Loaded { visible: true }));

        assert!(matches!(
            w.set_editor_override("/Game/Nope", Some(EditorOverride::ForceVisible)),
            Err(CompositionError::Registry(_))
        ));
    }

    #[test]
    fn reparent_moves_the_subtree() {
        let (mut w, _) = world(
            unlimited(),
            &[("/Game/P", IntVector::new(100, 0, 0)), ("/Game/C", IntVector::new(10, 0, 0))],
            InMemoryLoader::new(),
        );
        w.reparent("/Game/C", Some("/Game/P")).unwrap();
        assert_eq!(
            w.registry().get_tile("/Game/C").unwrap().absolute_position(),
            IntVector::new(110, 0, 0)
        );
        w.update_tile_position("/Game/P", IntVector::new(500, 0, 0)).unwrap();
        assert_eq!(
            w.registry().get_tile("/Game/C").unwrap().absolute_position(),
            IntVector::new(510, 0, 0)
        );
        assert!(matches!(
            w.reparent("/Game/P", Some("/Game/C")),
            Err(CompositionError::Registry(RegistryError::InvalidParent { .. }))
        ));
    }

    fn assert_shown_levels_placed(w: &WorldComposition, context: &str) {
        for record in w.table().records() {
            if !record.is_visible() {
                continue;
            }
            let Some(tile) = w.registry().get_tile(record.package()) else {
                continue;
            };
            let level = w.table().levels().get(record.level().unwrap()).unwrap();
            assert_eq!(
                level.offset(),
                w.origin().world_to_local(tile.absolute_position()),
                "{} {context}",
                record.package()
            );
        }
    }

    #[test]
    fn moving_a_shown_parent_moves_its_children_levels() {
        let (mut w, _) = world(
            unlimited(),
            &[
                ("/Game/P", IntVector::ZERO),
                ("/Game/C1", IntVector::new(100, 0, 0)),
                ("/Game/C2", IntVector::new(0, 100, 0)),
            ],
            InMemoryLoader::new(),
        );
        w.reparent("/Game/C1", Some("/Game/P")).unwrap();
        w.reparent("/Game/C2", Some("/Game/C1")).unwrap();
        w.request_rebase_to(IntVector::new(50, 0, 0));
        w.set_viewers(&[Vec3::ZERO]);
        w.tick(DT);
        for name in ["/Game/P", "/Game/C1", "/Game/C2"] {
            assert!(w.table().record(name).unwrap().is_visible(), "{name}");
        }

        w.update_tile_position("/Game/P", IntVector::new(500, 0, 0)).unwrap();
        assert_eq!(
            w.table().level_of("/Game/P").unwrap().offset(),
            IntVector::new(450, 0, 0)
        );
        assert_eq!(
            w.table().level_of("/Game/C2").unwrap().offset(),
            IntVector::new(550, 100, 0)
        );
        assert_shown_levels_placed(&w, "after move");

        w.reparent("/Game/C2", None).unwrap();
        assert_eq!(
            w.table().level_of("/Game/C2").unwrap().offset(),
            IntVector::new(-50, 100, 0)
        );
        w.remove_tile("/Game/P").unwrap();
        assert_eq!(
            w.table().level_of("/Game/C1").unwrap().offset(),
            IntVector::new(50, 0, 0)
        );
        assert_shown_levels_placed(&w, "after removal");
    }

    #[test]
    fn readded_tile_streams_in_again() {
        let mut manifest = Manifest::new();
        manifest.push_tile(TileRecord::new("/Game/A", IntVector::new(300, 0, 0)));
        let (mut w, _) = world(unlimited(), &[("/Game/A", IntVector::ZERO)], InMemoryLoader::new());
        w.set_viewers(&[Vec3::ZERO]);
        w.tick(DT);
        assert!(w.table().record("/Game/A").unwrap().is_visible());

        w.remove_tile("/Game/A").unwrap();
        w.rescan(&manifest);
        assert_eq!(
            w.table().level_of("/Game/A").unwrap().offset(),
            IntVector::new(300, 0, 0)
        );
        for _ in 0..20 {
            w.tick(DT);
        }
        let record = w.table().record("/Game/A").unwrap();
        assert_eq!(record.state(), LevelState::Loaded { visible: true });
        assert_eq!(Some(record.tile()), w.registry().handle_of("/Game/A"));
        assert_shown_levels_placed(&w, "after re-add");
    }

    #[test]
    fn opens_a_manifest_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("world.json");
        let mut manifest = Manifest::new();
        manifest.push_tile(TileRecord::new("/Game/Sub1", IntVector::new(1000, 0, 0)));
        manifest.save(&path).unwrap();

        let (w, report) = WorldComposition::open(
            CompositionConfig::default(),
            &path,
            WorldServices::headless(),
            Box::new(InMemoryLoader::new()),
        )
        .unwrap();
        assert_eq!(report.accepted, 1);
        assert_eq!(
            w.registry().get_tile("/Game/Sub1").unwrap().absolute_position(),
            IntVector::new(1000, 0, 0)
        );

        let missing = WorldComposition::open(
            CompositionConfig::default(),
            dir.path().join("absent.json"),
            WorldServices::headless(),
            Box::new(InMemoryLoader::new()),
        );
        assert!(matches!(missing, Err(CompositionError::Manifest(_))));
    }

    struct Record(Rc<RefCell<Vec<String>>>);

    impl CompositionObserver for Record {
        fn on_event(&mut self, event: &CompositionEvent) {
            let name = match event {
                CompositionEvent::LevelLoaded { .. } => "loaded",
                CompositionEvent::LevelAdded { .. } => "added",
                CompositionEvent::OriginShifting { .. } => "shifting",
                CompositionEvent::OriginShifted { .. } => "shifted",
                _ => "other",
            };
            self.0.borrow_mut().push(name.to_string());
        }
    }

    #[test]
    fn observers_see_lifecycle_and_origin_events_in_order() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let (mut w, _) = world(unlimited(), &[("/Game/A", IntVector::ZERO)], InMemoryLoader::new());
        w.subscribe(Box::new(Record(seen.clone())));
        w.set_viewers(&[Vec3::ZERO]);
        w.tick(DT);
        w.request_rebase_to(IntVector::new(100, 0, 0));
        w.tick(DT);
        assert_eq!(*seen.borrow(), vec!["loaded", "added", "shifting", "shifted"]);
        assert_eq!(w.drain_events().len(), 4);
        assert!(w.events().is_empty());
    }

    #[test]
    fn non_networked_world_never_calls_the_network() {
        let config = CompositionConfig {
            networked: false,
            ..unlimited()
        };
        let mut manifest = Manifest::new();
        manifest.push_tile(TileRecord::new("/Game/A", IntVector::ZERO));
        let loader = InMemoryLoader::new();
        loader.insert("/Game/A", contents());
        let (services, log) = recording_services(true);
        let (mut w, _) = WorldComposition::from_manifest(config, &manifest, services, Box::new(loader));
        w.set_viewers(&[Vec3::ZERO]);
        w.tick(DT);
        assert!(w.table().record("/Game/A").unwrap().is_visible());
        assert_eq!(log.count(|c| matches!(c, SceneCall::LevelVisible(_))), 0);
    }

    #[test]
    fn randomized_ticks_keep_placement_and_single_activation() {
        let names = ["/Game/A", "/Game/B", "/Game/C", "/Game/D", "/Game/E"];
        for seed in 0..12u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let tiles: Vec<(&str, IntVector)> = names
                .iter()
                .map(|n| (*n, IntVector::new(rng.gen_range(-80..80) * 1000, rng.gen_range(-80..80) * 1000, 0)))
                .collect();
            let config = CompositionConfig {
                activation_budget: ActivationBudget::Steps {
                    steps: rng.gen_range(1..4),
                },
                component_registration_granularity: rng.gen_range(0..2),
                networked: true,
                decision: crate::config::DecisionConfig { dwell_secs: 0.25 },
                ..CompositionConfig::default()
            };
            let loader = InMemoryLoader::deferred();
            let (mut w, _) = world(config, &tiles, loader.clone());
            let mut manifest = Manifest::new();
            for (name, position) in &tiles {
                manifest.push_tile(TileRecord::new(*name, *position));
            }

            for _ in 0..150 {
                let pick = |rng: &mut StdRng| names[rng.gen_range(0..names.len())];
                match rng.gen_range(0..14) {
                    0..=2 => {
                        let viewer = Vec3::new(
                            rng.gen_range(-100_000.0..100_000.0),
                            rng.gen_range(-100_000.0..100_000.0),
                            0.0,
                        );
                        w.set_viewers(&[viewer]);
                    }
                    3 => w.request_rebase_to(IntVector::new(
                        rng.gen_range(-50..50) * 1000,
                        rng.gen_range(-50..50) * 1000,
                        0,
                    )),
                    4 => {
                        loader.deliver_pending();
                    }
                    5 => {
                        w.reload_tile(names[rng.gen_range(0..names.len())]);
                    }
                    6 if rng.gen_bool(0.3) => {
                        w.force_unload(names[rng.gen_range(0..names.len())]);
                    }
                    7 | 8 => {
                        let position = IntVector::new(
                            rng.gen_range(-80..80) * 1000,
                            rng.gen_range(-80..80) * 1000,
                            0,
                        );
                        let _ = w.update_tile_position(pick(&mut rng), position);
                    }
                    9 => {
                        let tile = pick(&mut rng);
                        let parent = rng.gen_bool(0.7).then(|| pick(&mut rng));
                        let _ = w.reparent(tile, parent);
                    }
                    10 if rng.gen_bool(0.3) => {
                        let _ = w.remove_tile(pick(&mut rng));
                    }
                    11 => {
                        w.rescan(&manifest);
                    }
                    _ => {}
                }
                assert_shown_levels_placed(&w, &format!("seed {seed} before tick"));
                w.tick(rng.gen_range(0.0..0.2));

                assert!(w.table().count_activating() <= 1, "seed {seed}");
                assert_shown_levels_placed(&w, &format!("seed {seed}"));
            }
            w.shutdown();
            assert!(w.table().levels().is_empty(), "seed {seed}");
        }
    }
}
