use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use worldspace_common::Arena;
use worldspace_kernel::{
    CompositionEvent, Level, LevelHandle, Notifier, OriginTracker, PackageContents, WorldServices,
};
use worldspace_tiles::{TileHandle, TileRegistry};

use crate::budget::{StreamStats, TickBudget};
use crate::decision::{DesiredChange, DesiredState};
use crate::gc::GcCoordinator;
use crate::loader::{LoadCompletion, LoadError, LoadQueue, PackageLoader};

/// Upper bound on transitions a single record may take in one update.
const MAX_TRANSITIONS_PER_UPDATE: usize = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorldKind {
    #[default]
    Game,
    /// Never time-slices activation and always loads synchronously.
    Editor,
}

/// Tunables of the level lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleSettings {
    pub world_kind: WorldKind,
    /// Components registered per budget unit; `0` registers all at once.
    pub component_registration_granularity: usize,
    pub use_background_streaming: bool,
    /// Defer a removal to the next tick once the budget is spent.
    pub time_sliced_removal: bool,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            world_kind: WorldKind::Game,
            component_registration_granularity: 50,
            use_background_streaming: true,
            time_sliced_removal: false,
        }
    }
}

/// Ordered sub-steps of adding a level to the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ActivationStep {
    PlaceLevel,
    ApplyOriginShift,
    RegisterComponents,
    InitializeNetworkActors,
    RouteActorInitialize,
    SortActorList,
}

impl ActivationStep {
    pub const ALL: [Self; 6] = [
        Self::PlaceLevel,
        Self::ApplyOriginShift,
        Self::RegisterComponents,
        Self::InitializeNetworkActors,
        Self::RouteActorInitialize,
        Self::SortActorList,
    ];

    /// One-based position in the sequence.
    pub fn number(self) -> usize {
        self as usize + 1
    }

    pub fn next(self) -> Option<Self> {
        Self::ALL.get(self as usize + 1).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelState {
    Unloaded,
    LoadRequested,
    Loaded { visible: bool },
    /// Paused before the given step.
    ActivationInProgress(ActivationStep),
    DeactivationInProgress,
    UnloadRequested,
    PendingGc,
}

impl LevelState {
    pub fn is_transition(&self) -> bool {
        matches!(
            self,
            Self::ActivationInProgress(_) | Self::DeactivationInProgress
        )
    }
}

/// Runtime state of one tile that has been loaded, or asked to load, this session.
#[derive(Debug, Clone)]
pub struct LevelRecord {
    package: String,
    tile: TileHandle,
    state: LevelState,
    level: Option<LevelHandle>,
    /// Previous instance kept on screen while a replacement loads.
    superseded: Option<LevelHandle>,
    desired: DesiredState,
    shelved: bool,
    cancel_pending_load: bool,
    load_failed: bool,
    load_ticket: u64,
}

impl LevelRecord {
    fn new(change: &DesiredChange) -> Self {
        Self {
            package: change.package.clone(),
            tile: change.tile,
            state: LevelState::Unloaded,
            level: None,
            superseded: None,
            desired: change.desired,
            shelved: false,
            cancel_pending_load: false,
            load_failed: false,
            load_ticket: 0,
        }
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn tile(&self) -> TileHandle {
        self.tile
    }

    pub fn state(&self) -> LevelState {
        self.state
    }

    pub fn level(&self) -> Option<LevelHandle> {
        self.level
    }

    pub fn superseded(&self) -> Option<LevelHandle> {
        self.superseded
    }

    pub fn desired(&self) -> DesiredState {
        self.desired
    }

    pub fn is_always_loaded(&self) -> bool {
        self.desired.always_loaded
    }

    pub fn is_shelved(&self) -> bool {
        self.shelved
    }

    pub fn load_failed(&self) -> bool {
        self.load_failed
    }

    pub fn is_visible(&self) -> bool {
        self.state == LevelState::Loaded { visible: true }
    }

    fn is_idle(&self) -> bool {
        self.state == LevelState::Unloaded
            && self.level.is_none()
            && self.superseded.is_none()
            && !self.desired.loaded
    }
}

/// Everything a lifecycle update touches besides the table itself.
pub struct StreamingContext<'a> {
    pub registry: &'a mut TileRegistry,
    pub origin: &'a OriginTracker,
    pub services: &'a mut WorldServices,
    pub loader: &'a mut dyn PackageLoader,
    pub queue: &'a LoadQueue,
    pub gc: &'a mut GcCoordinator,
    pub notifier: &'a mut Notifier,
    pub stats: &'a mut StreamStats,
    pub settings: &'a LifecycleSettings,
}

enum Activation {
    Yielded,
    Complete,
    Aborted,
}

/// Abort under `debug_assertions`; otherwise log and carry on.
pub(crate) fn invariant_violation(message: &str) {
    if cfg!(debug_assertions) {
        panic!("streaming invariant violated: {message}");
    }
    tracing::error!(detail = message, "streaming invariant violated");
}

/// Lifecycle records plus every level instance they own.
///
/// At most one record is ever in [`LevelState::ActivationInProgress`]; it is
/// the pending-visibility level. While it is set no other level is removed
/// from the world or unloaded.
#[derive(Debug, Default)]
pub struct LevelTable {
    records: BTreeMap<String, LevelRecord>,
    levels: Arena<Level>,
    activating: Option<String>,
    next_ticket: u64,
}

impl LevelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record(&self, package: &str) -> Option<&LevelRecord> {
        self.records.get(package)
    }

    pub fn records(&self) -> impl Iterator<Item = &LevelRecord> {
        self.records.values()
    }

    pub fn state_of(&self, package: &str) -> Option<LevelState> {
        self.records.get(package).map(|r| r.state)
    }

    pub fn levels(&self) -> &Arena<Level> {
        &self.levels
    }

    pub fn levels_mut(&mut self) -> &mut Arena<Level> {
        &mut self.levels
    }

    pub fn level_of(&self, package: &str) -> Option<&Level> {
        self.records
            .get(package)
            .and_then(|r| r.level)
            .and_then(|h| self.levels.get(h))
    }

    /// Package of the level currently being added to the world.
    pub fn activating(&self) -> Option<&str> {
        self.activating.as_deref()
    }

    pub fn count_activating(&self) -> usize {
        self.records
            .values()
            .filter(|r| matches!(r.state, LevelState::ActivationInProgress(_)))
            .count()
    }

    pub fn is_transition_in_progress(&self) -> bool {
        self.activating.is_some() || self.records.values().any(|r| r.state.is_transition())
    }

    /// Whether anything still points at `level`.
    pub fn references(&self, level: LevelHandle) -> bool {
        self.records
            .values()
            .any(|r| r.level == Some(level) || r.superseded == Some(level))
    }

    /// States of every record, for progress checks.
    pub fn snapshot(&self) -> Vec<(String, LevelState)> {
        self.records
            .iter()
            .map(|(name, r)| (name.clone(), r.state))
            .collect()
    }

    /// Whether some record still wants to move.
    pub fn has_pending_work(&self) -> bool {
        self.records.values().any(|r| {
            let (load, visible) = wants(r, &self.activating);
            match r.state {
                LevelState::Unloaded => load && !r.load_failed,
                LevelState::LoadRequested
                | LevelState::ActivationInProgress(_)
                | LevelState::DeactivationInProgress
                | LevelState::UnloadRequested => true,
                LevelState::Loaded { visible: shown } => {
                    shown != visible || !load || (r.superseded.is_some() && !visible)
                }
                LevelState::PendingGc => load,
            }
        })
    }

    /// Record new desired states. Records are created on the first request to load.
    pub fn apply_desired(&mut self, changes: impl IntoIterator<Item = DesiredChange>) {
        for change in changes {
            match self.records.get_mut(&change.package) {
                Some(record) => {
                    if change.desired.loaded && !record.desired.loaded {
                        record.load_failed = false;
                    }
                    record.tile = change.tile;
                    record.desired = change.desired;
                    if record.state == LevelState::LoadRequested {
                        record.cancel_pending_load = !change.desired.loaded;
                    }
                }
                None if change.desired.loaded => {
                    self.records
                        .insert(change.package.clone(), LevelRecord::new(&change));
                }
                None => {}
            }
        }
    }

    /// Hide or show a loaded level without unloading it.
    pub fn set_shelved(&mut self, package: &str, shelved: bool, notifier: &mut Notifier) -> bool {
        let Some(record) = self.records.get_mut(package) else {
            return false;
        };
        if record.shelved == shelved {
            return false;
        }
        record.shelved = shelved;
        let package = package.to_string();
        notifier.emit(if shelved {
            CompositionEvent::LevelShelved { package }
        } else {
            CompositionEvent::LevelUnshelved { package }
        });
        true
    }

    /// Move placed levels to where their tiles are now. Call after the catalog
    /// changed positions. Returns how many level instances moved.
    ///
    /// Shown instances and activations past placement follow the tile; a level
    /// hidden in memory is placed again when it next activates.
    pub fn replace_moved_levels(&mut self, registry: &TileRegistry, origin: &OriginTracker) -> usize {
        let mut moved = 0;
        for record in self.records.values() {
            let Some(tile) = registry
                .get(record.tile)
                .or_else(|| registry.get_tile(&record.package))
            else {
                continue;
            };
            let absolute = tile.absolute_position();
            let local = origin.world_to_local(absolute);
            let activating = match record.state {
                LevelState::ActivationInProgress(ActivationStep::PlaceLevel) => None,
                // Placed in absolute space; the origin shift has not run yet.
                LevelState::ActivationInProgress(ActivationStep::ApplyOriginShift) => Some(absolute),
                LevelState::ActivationInProgress(_) => Some(local),
                _ => None,
            };
            let instances = record.level.into_iter().chain(record.superseded);
            for handle in instances {
                let Some(level) = self.levels.get_mut(handle) else {
                    continue;
                };
                let target = match activating {
                    _ if level.is_visible() => local,
                    Some(target) if record.level == Some(handle) => target,
                    _ => continue,
                };
                if level.offset() != target {
                    level.set_offset(target);
                    moved += 1;
                }
            }
        }
        if moved > 0 {
            tracing::debug!(moved, "levels moved with their tiles");
        }
        moved
    }

    /// Handle an async load completion. Stale completions are dropped.
    pub fn complete_load(&mut self, ctx: &mut StreamingContext<'_>, completion: LoadCompletion) {
        let Self {
            records, levels, ..
        } = self;
        let Some(record) = records.get_mut(&completion.package) else {
            tracing::debug!(package = %completion.package, "load completion for unknown level dropped");
            return;
        };
        if record.state != LevelState::LoadRequested || record.load_ticket != completion.ticket {
            tracing::debug!(package = %completion.package, "stale load completion dropped");
            return;
        }
        finish_load(record, levels, completion.result, ctx);
    }

    /// Drive every record toward its desired state within `budget`.
    ///
    /// The pending-visibility level is advanced first.
    pub fn update(&mut self, ctx: &mut StreamingContext<'_>, budget: &mut TickBudget) {
        let _span =
            tracing::info_span!("level_streaming_update", records = self.records.len()).entered();
        if ctx.settings.world_kind == WorldKind::Editor {
            *budget = TickBudget::Unlimited;
        }

        let mut order: Vec<String> = Vec::with_capacity(self.records.len());
        if let Some(name) = &self.activating {
            order.push(name.clone());
        }
        order.extend(
            self.records
                .keys()
                .filter(|k| self.activating.as_deref() != Some(k.as_str()))
                .cloned(),
        );
        for name in &order {
            self.update_record(name, ctx, budget);
        }

        if self.count_activating() > 1 {
            invariant_violation("more than one level is being added to the world");
        }
        self.records.retain(|_, r| !r.is_idle());
        ctx.stats.total_records = self.records.len();
    }

    fn update_record(&mut self, name: &str, ctx: &mut StreamingContext<'_>, budget: &mut TickBudget) {
        let Self {
            records,
            levels,
            activating,
            next_ticket,
        } = self;
        let Some(record) = records.get_mut(name) else {
            return;
        };

        for _ in 0..MAX_TRANSITIONS_PER_UPDATE {
            let (should_load, should_visible) = wants(record, activating);
            if record.superseded.is_some() && !should_visible {
                discard_superseded(record, levels, ctx);
            }
            let before = record.state;
            let moved = match record.state {
                LevelState::Unloaded => {
                    if should_load && !record.load_failed {
                        request_load(record, levels, next_ticket, ctx);
                        true
                    } else {
                        false
                    }
                }
                LevelState::LoadRequested => {
                    record.cancel_pending_load = !should_load;
                    false
                }
                LevelState::Loaded { visible: false } => {
                    if should_visible {
                        let blocking = record.desired.block_on_load;
                        if activating.is_some() || (budget.is_exhausted() && !blocking) {
                            false
                        } else {
                            record.state =
                                LevelState::ActivationInProgress(ActivationStep::PlaceLevel);
                            *activating = Some(record.package.clone());
                            true
                        }
                    } else if !should_load && activating.is_none() {
                        record.state = LevelState::UnloadRequested;
                        true
                    } else {
                        false
                    }
                }
                LevelState::ActivationInProgress(step) => {
                    if activating.as_deref() != Some(record.package.as_str()) {
                        invariant_violation("activation running for a level that is not pending visibility");
                        *activating = Some(record.package.clone());
                    }
                    // Blocking levels finish in one call and leave the tick budget alone.
                    let mut unbounded = TickBudget::Unlimited;
                    let step_budget = if record.desired.block_on_load {
                        &mut unbounded
                    } else {
                        &mut *budget
                    };
                    match continue_activation(record, levels, step, ctx, step_budget) {
                        Activation::Yielded => false,
                        Activation::Complete | Activation::Aborted => {
                            *activating = None;
                            true
                        }
                    }
                }
                LevelState::Loaded { visible: true } => {
                    let deferred = activating.is_some()
                        || (ctx.settings.time_sliced_removal && budget.is_exhausted());
                    if should_visible || deferred {
                        false
                    } else {
                        deactivate(record, levels, ctx);
                        if ctx.settings.time_sliced_removal {
                            budget.spend();
                        }
                        true
                    }
                }
                LevelState::DeactivationInProgress => false,
                LevelState::UnloadRequested => {
                    request_unload(record, ctx);
                    true
                }
                LevelState::PendingGc => {
                    if should_load {
                        if let Some(handle) = record.level {
                            ctx.gc.cancel_teardown(handle);
                        }
                        record.state = LevelState::Loaded { visible: false };
                        true
                    } else {
                        false
                    }
                }
            };
            if record.state != before {
                tracing::trace!(package = %record.package, from = ?before, to = ?record.state, "level state changed");
            }
            if !moved {
                break;
            }
        }
    }

    /// Put a fresh instance of `package` in place of the loaded one.
    ///
    /// A visible instance stays on screen until the new one is visible.
    pub fn reload(&mut self, package: &str, ctx: &mut StreamingContext<'_>) -> bool {
        let Self {
            records,
            levels,
            next_ticket,
            ..
        } = self;
        let Some(record) = records.get_mut(package) else {
            return false;
        };
        match record.state {
            LevelState::Loaded { visible: true } if record.superseded.is_none() => {
                record.superseded = record.level.take();
            }
            LevelState::Loaded { visible: false } => {
                if let Some(old) = record.level.take() {
                    ctx.gc.enqueue_for_teardown(old, &record.package);
                }
            }
            _ => return false,
        }
        tracing::debug!(package = %record.package, "reloading level");
        record.load_failed = false;
        request_load(record, levels, next_ticket, ctx);
        true
    }

    /// Drop a record straight to unloaded, freeing its levels now.
    pub fn force_unload(&mut self, package: &str, ctx: &mut StreamingContext<'_>) -> bool {
        let Some(mut record) = self.records.remove(package) else {
            return false;
        };
        if self.activating.as_deref() == Some(package) {
            self.activating = None;
        }
        for handle in [record.superseded.take(), record.level.take()].into_iter().flatten() {
            free_now(handle, &record.package, &mut self.levels, ctx);
        }
        tracing::debug!(package = %package, from = ?record.state, "level force-unloaded");
        true
    }

    pub fn force_unload_all(&mut self, ctx: &mut StreamingContext<'_>) -> usize {
        let names: Vec<String> = self.records.keys().cloned().collect();
        let mut unloaded = 0;
        for name in &names {
            if self.force_unload(name, ctx) {
                unloaded += 1;
            }
        }
        unloaded
    }

    /// Collection safe point: free every level queued for teardown.
    ///
    /// Returns the packages whose levels were freed.
    pub fn collect_garbage(
        &mut self,
        gc: &mut GcCoordinator,
        services: &mut WorldServices,
        notifier: &mut Notifier,
        stats: &mut StreamStats,
        verify: bool,
    ) -> Vec<String> {
        let collected = gc.prepare_collection(&mut self.levels, services);
        let mut packages = Vec::with_capacity(collected.len());
        for (handle, package) in &collected {
            if let Some(record) = self.records.get_mut(package) {
                if record.level == Some(*handle) && record.state == LevelState::PendingGc {
                    record.level = None;
                    record.state = LevelState::Unloaded;
                }
            }
            stats.levels_collected += 1;
            notifier.emit(CompositionEvent::LevelCollected {
                package: package.clone(),
            });
            packages.push(package.clone());
        }
        if verify {
            gc.verify_collection(&collected, |h| self.references(h) || self.levels.contains(h));
        }
        self.records.retain(|_, r| !r.is_idle());
        packages
    }
}

/// What a record should be right now: `(loaded, visible)`.
///
/// The pending-visibility level is kept wanted until its activation is done.
fn wants(record: &LevelRecord, activating: &Option<String>) -> (bool, bool) {
    let in_flight = activating.as_deref() == Some(record.package.as_str());
    let load = record.desired.loaded || in_flight;
    let visible = (record.desired.visible && load && !record.shelved) || in_flight;
    (load, visible)
}

fn request_load(
    record: &mut LevelRecord,
    levels: &mut Arena<Level>,
    next_ticket: &mut u64,
    ctx: &mut StreamingContext<'_>,
) {
    *next_ticket += 1;
    record.load_ticket = *next_ticket;
    record.state = LevelState::LoadRequested;
    record.cancel_pending_load = false;
    ctx.stats.loads_issued += 1;

    let blocking = ctx.settings.world_kind == WorldKind::Editor
        || !ctx.settings.use_background_streaming
        || record.desired.block_on_load
        || record.desired.always_loaded;
    if blocking {
        tracing::debug!(package = %record.package, "loading level synchronously");
        let result = ctx.loader.load_sync(&record.package);
        finish_load(record, levels, result, ctx);
    } else {
        tracing::debug!(package = %record.package, ticket = record.load_ticket, "loading level");
        let reply = ctx.queue.reply(&record.package, record.load_ticket);
        ctx.loader.load_async(&record.package, reply);
    }
}

fn finish_load(
    record: &mut LevelRecord,
    levels: &mut Arena<Level>,
    result: Result<PackageContents, LoadError>,
    ctx: &mut StreamingContext<'_>,
) {
    let contents = match result {
        Ok(contents) => contents,
        Err(e) => {
            tracing::warn!(package = %record.package, error = %e, "level failed to load");
            ctx.stats.loads_failed += 1;
            record.load_failed = true;
            record.cancel_pending_load = false;
            record.state = match record.superseded.take() {
                Some(old) => {
                    record.level = Some(old);
                    LevelState::Loaded { visible: true }
                }
                None => LevelState::Unloaded,
            };
            ctx.notifier.emit(CompositionEvent::LoadFailed {
                package: record.package.clone(),
                reason: e.to_string(),
            });
            return;
        }
    };

    let level = Level::from_package(record.package.clone(), contents);
    let bounds = level.compute_bounds();
    let unknown_bounds = ctx
        .registry
        .get(record.tile)
        .is_some_and(|t| !t.bounds().is_valid());
    if unknown_bounds && bounds.is_valid() {
        ctx.registry.update_tile_bounds(record.tile, bounds);
        tracing::debug!(package = %record.package, ?bounds, "tile bounds discovered");
    }
    record.level = Some(levels.insert(level));
    ctx.notifier.emit(CompositionEvent::LevelLoaded {
        package: record.package.clone(),
    });

    if record.cancel_pending_load {
        tracing::debug!(package = %record.package, "load finished after it was cancelled");
        record.cancel_pending_load = false;
        record.state = LevelState::UnloadRequested;
    } else {
        record.state = LevelState::Loaded { visible: false };
    }
}

fn continue_activation(
    record: &mut LevelRecord,
    levels: &mut Arena<Level>,
    from: ActivationStep,
    ctx: &mut StreamingContext<'_>,
    budget: &mut TickBudget,
) -> Activation {
    let _span = tracing::debug_span!("add_to_world", package = %record.package).entered();
    let Some(handle) = record.level.filter(|h| levels.contains(*h)) else {
        tracing::error!(package = %record.package, "activating a level that is not loaded");
        record.state = LevelState::Unloaded;
        record.level = None;
        return Activation::Aborted;
    };
    let tile_position = ctx.registry.get(record.tile).map(|t| t.absolute_position());

    let outcome = {
        let Some(level) = levels.get_mut(handle) else {
            return Activation::Aborted;
        };
        let mut step = from;
        loop {
            match step {
                ActivationStep::PlaceLevel => match tile_position {
                    Some(position) => level.set_offset(position),
                    None => {
                        tracing::warn!(package = %record.package, "tile left the catalog; keeping level placement")
                    }
                },
                ActivationStep::ApplyOriginShift => {
                    level.set_offset(ctx.origin.world_to_local(level.offset()));
                }
                ActivationStep::RegisterComponents => {
                    let registered =
                        level.register_components(ctx.settings.component_registration_granularity);
                    if registered > 0 {
                        ctx.services.render.register_components(handle, registered);
                    }
                    if !level.components_registered() {
                        if budget.spend() {
                            record.state = LevelState::ActivationInProgress(step);
                            break Activation::Yielded;
                        }
                        continue;
                    }
                    ctx.services.physics.add_level(handle, &record.package);
                }
                ActivationStep::InitializeNetworkActors => {
                    if let Some(network) = ctx.services.network.as_mut() {
                        network.initialize_network_actors(&record.package, &level.net_relevant_actors());
                    }
                }
                ActivationStep::RouteActorInitialize => level.route_actor_initialize(),
                ActivationStep::SortActorList => level.sort_actor_list(),
            }
            ctx.stats.activation_steps += 1;
            tracing::trace!(package = %record.package, step = step.number(), "activation step done");

            match step.next() {
                None => break Activation::Complete,
                Some(next) => {
                    step = next;
                    if budget.spend() {
                        record.state = LevelState::ActivationInProgress(next);
                        break Activation::Yielded;
                    }
                }
            }
        }
    };

    if let Activation::Complete = outcome {
        finish_activation(record, handle, levels, ctx);
    }
    outcome
}

/// Last part of activation: swap out any superseded instance, then announce.
fn finish_activation(
    record: &mut LevelRecord,
    handle: LevelHandle,
    levels: &mut Arena<Level>,
    ctx: &mut StreamingContext<'_>,
) {
    discard_superseded(record, levels, ctx);
    if let Some(level) = levels.get_mut(handle) {
        level.set_visible(true);
    }
    ctx.services.render.add_level(handle, &record.package);
    if let Some(network) = ctx.services.network.as_mut() {
        network.notify_level_visible(&record.package);
    }
    record.state = LevelState::Loaded { visible: true };
    ctx.stats.levels_shown += 1;
    tracing::debug!(package = %record.package, "level added to world");
    ctx.notifier.emit(CompositionEvent::LevelAdded {
        package: record.package.clone(),
    });
}

fn deactivate(record: &mut LevelRecord, levels: &mut Arena<Level>, ctx: &mut StreamingContext<'_>) {
    record.state = LevelState::DeactivationInProgress;
    if let Some(handle) = record.level {
        if let Some(level) = levels.get_mut(handle) {
            remove_from_world(handle, level, ctx);
        }
    }
    record.state = LevelState::Loaded { visible: false };
}

/// Take a visible level out of every scene. Runs in one go.
fn remove_from_world(handle: LevelHandle, level: &mut Level, ctx: &mut StreamingContext<'_>) {
    let _span = tracing::debug_span!("remove_from_world", package = %level.package()).entered();
    if let Some(network) = ctx.services.network.as_mut() {
        for actor in level.actors() {
            network.notify_actor_unloaded(actor.id);
        }
    }
    ctx.services.render.unregister_components(handle);
    ctx.services.render.remove_level(handle, level.package());
    ctx.services.physics.remove_level(handle, level.package());
    level.clear_components();
    if let Some(network) = ctx.services.network.as_mut() {
        network.notify_level_hidden(level.package());
    }
    level.reset_placement();
    level.set_visible(false);
    ctx.stats.levels_hidden += 1;
    tracing::debug!(package = %level.package(), "level removed from world");
    ctx.notifier.emit(CompositionEvent::LevelRemoved {
        package: level.package().to_string(),
    });
}

fn discard_superseded(record: &mut LevelRecord, levels: &mut Arena<Level>, ctx: &mut StreamingContext<'_>) {
    let Some(old) = record.superseded.take() else {
        return;
    };
    if let Some(level) = levels.get_mut(old) {
        if level.is_visible() {
            remove_from_world(old, level, ctx);
        }
    }
    ctx.gc.enqueue_for_teardown(old, &record.package);
}

fn request_unload(record: &mut LevelRecord, ctx: &mut StreamingContext<'_>) {
    let Some(handle) = record.level else {
        record.state = LevelState::Unloaded;
        return;
    };
    ctx.gc.enqueue_for_teardown(handle, &record.package);
    record.state = LevelState::PendingGc;
    ctx.stats.unloads_requested += 1;
    ctx.notifier.emit(CompositionEvent::UnloadRequested {
        package: record.package.clone(),
    });
}

/// Detach a level from every collaborator and free it immediately.
fn free_now(
    handle: LevelHandle,
    package: &str,
    levels: &mut Arena<Level>,
    ctx: &mut StreamingContext<'_>,
) {
    ctx.gc.cancel_teardown(handle);
    if let Some(level) = levels.get_mut(handle) {
        if level.is_visible() {
            remove_from_world(handle, level, ctx);
        } else if level.registered_components() > 0 {
            ctx.services.render.unregister_components(handle);
            if level.components_registered() {
                ctx.services.physics.remove_level(handle, package);
            }
            level.clear_components();
        }
    }
    if let Some(network) = ctx.services.network.as_mut() {
        network.notify_streaming_level_unload(package);
    }
    ctx.services.render.release_level(handle, package);
    if levels.remove(handle).is_some() {
        ctx.notifier.emit(CompositionEvent::LevelCollected {
            package: package.to_string(),
        });
    }
}
