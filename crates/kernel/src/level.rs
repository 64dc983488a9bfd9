use worldspace_common::{ActorId, Bounds, Handle, IntVector, Transform};

pub type LevelHandle = Handle<Level>;

/// Whether an actor can move after the level has been made visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mobility {
    Static,
    Movable,
}

/// An actor as stored in a level package.
///
/// `local` is the package-local transform and never changes while the level is
/// streamed. `transform` is the render-space placement derived from it.
#[derive(Debug, Clone)]
pub struct Actor {
    pub id: ActorId,
    pub local: Transform,
    pub transform: Transform,
    pub mobility: Mobility,
    pub net_relevant: bool,
    pub component_count: usize,
    /// Package-local bounds of this actor.
    pub bounds: Bounds,
    pub contributes_to_bounds: bool,
    pub landscape: bool,
    initialized: bool,
}

impl Actor {
    pub fn new(local: Transform) -> Self {
        Self {
            id: ActorId::new(),
            local,
            transform: local,
            mobility: Mobility::Static,
            net_relevant: false,
            component_count: 1,
            bounds: Bounds::INVALID,
            contributes_to_bounds: true,
            landscape: false,
            initialized: false,
        }
    }

    pub fn with_mobility(mut self, mobility: Mobility) -> Self {
        self.mobility = mobility;
        self
    }

    pub fn with_net_relevance(mut self, relevant: bool) -> Self {
        self.net_relevant = relevant;
        self
    }

    pub fn with_components(mut self, count: usize) -> Self {
        self.component_count = count;
        self
    }

    pub fn with_bounds(mut self, bounds: Bounds) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn as_landscape(mut self) -> Self {
        self.landscape = true;
        self
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Ordering bucket used by [`Level::sort_actor_list`].
    fn sort_rank(&self) -> u8 {
        match (self.mobility, self.net_relevant) {
            (Mobility::Static, false) => 0,
            (Mobility::Static, true) => 1,
            (Mobility::Movable, _) => 2,
        }
    }
}

/// What a package loader hands back for a level package.
#[derive(Debug, Clone, Default)]
pub struct PackageContents {
    pub actors: Vec<Actor>,
    pub is_landscape: bool,
}

/// A loaded level instance.
///
/// Placement is kept as an integer offset; float actor transforms are rebuilt
/// from the package-local ones every time the offset changes.
#[derive(Debug)]
pub struct Level {
    package: String,
    actors: Vec<Actor>,
    is_landscape: bool,
    offset: IntVector,
    registered_components: usize,
    total_components: usize,
    visible: bool,
}

impl Level {
    pub fn from_package(package: impl Into<String>, contents: PackageContents) -> Self {
        let total_components = contents.actors.iter().map(|a| a.component_count).sum();
        Self {
            package: package.into(),
            actors: contents.actors,
            is_landscape: contents.is_landscape,
            offset: IntVector::ZERO,
            registered_components: 0,
            total_components,
            visible: false,
        }
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn actors(&self) -> &[Actor] {
        &self.actors
    }

    pub fn is_landscape(&self) -> bool {
        self.is_landscape
    }

    /// Current render-space offset of the package origin.
    pub fn offset(&self) -> IntVector {
        self.offset
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    /// Place the package origin at `offset` in render space.
    pub fn set_offset(&mut self, offset: IntVector) {
        self.offset = offset;
        let shift = offset.as_vec3();
        for actor in &mut self.actors {
            actor.transform = Transform {
                position: actor.local.position + shift,
                ..actor.local
            };
        }
    }

    /// Shift the level by `delta`.
    pub fn apply_world_offset(&mut self, delta: IntVector) {
        self.set_offset(self.offset + delta);
    }

    /// Put the level back at its package-local position.
    pub fn reset_placement(&mut self) {
        self.set_offset(IntVector::ZERO);
    }

    /// Package-local bounds of everything that contributes to level bounds.
    pub fn compute_bounds(&self) -> Bounds {
        self.actors
            .iter()
            .filter(|a| a.contributes_to_bounds || a.landscape)
            .fold(Bounds::INVALID, |acc, a| acc.union(a.bounds))
    }

    pub fn total_components(&self) -> usize {
        self.total_components
    }

    pub fn registered_components(&self) -> usize {
        self.registered_components
    }

    pub fn components_registered(&self) -> bool {
        self.registered_components >= self.total_components
    }

    /// Register up to `batch` more components; `0` registers everything left.
    /// Returns how many were registered by this call.
    pub fn register_components(&mut self, batch: usize) -> usize {
        let remaining = self.total_components - self.registered_components;
        let count = if batch == 0 { remaining } else { batch.min(remaining) };
        self.registered_components += count;
        count
    }

    pub fn clear_components(&mut self) {
        self.registered_components = 0;
    }

    pub fn route_actor_initialize(&mut self) {
        for actor in &mut self.actors {
            actor.initialized = true;
        }
    }

    /// Stable sort: static non-relevant actors, then static relevant ones, then movable ones.
    pub fn sort_actor_list(&mut self) {
        self.actors.sort_by_key(Actor::sort_rank);
    }

    pub fn net_relevant_actors(&self) -> Vec<ActorId> {
        self.actors
            .iter()
            .filter(|a| a.net_relevant)
            .map(|a| a.id)
            .collect()
    }
}
