//! Collaborators the composition core calls into. Implementations live with
//! the renderer, physics and networking code of the host.

use glam::Vec3;
use worldspace_common::ActorId;

use crate::level::LevelHandle;

/// Render scene boundary.
pub trait RenderScene {
    fn add_level(&mut self, level: LevelHandle, package: &str);
    fn remove_level(&mut self, level: LevelHandle, package: &str);
    fn apply_world_offset(&mut self, offset: Vec3);

    /// A batch of `count` components was registered for `level`.
    fn register_components(&mut self, _level: LevelHandle, _count: usize) {}
    fn unregister_components(&mut self, _level: LevelHandle) {}
    /// Forget every resource tied to a level that is about to be freed.
    fn release_level(&mut self, _level: LevelHandle, _package: &str) {}
}

/// Physics scene boundary.
pub trait PhysicsScene {
    fn add_level(&mut self, level: LevelHandle, package: &str);
    fn remove_level(&mut self, level: LevelHandle, package: &str);
    fn apply_world_offset(&mut self, offset: Vec3);
}

/// Network layer boundary, present only in networked game worlds.
pub trait NetworkLayer {
    fn notify_level_visible(&mut self, package: &str);
    fn notify_level_hidden(&mut self, package: &str);
    fn notify_actor_unloaded(&mut self, actor: ActorId);

    fn initialize_network_actors(&mut self, _package: &str, _actors: &[ActorId]) {}
    /// Drop every package-map reference to a level before it is freed.
    fn notify_streaming_level_unload(&mut self, _package: &str) {}
}

/// Scene that ignores every call. Used for headless worlds.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullScene;

impl RenderScene for NullScene {
    fn add_level(&mut self, _level: LevelHandle, _package: &str) {}
    fn remove_level(&mut self, _level: LevelHandle, _package: &str) {}
    fn apply_world_offset(&mut self, _offset: Vec3) {}
}

impl PhysicsScene for NullScene {
    fn add_level(&mut self, _level: LevelHandle, _package: &str) {}
    fn remove_level(&mut self, _level: LevelHandle, _package: &str) {}
    fn apply_world_offset(&mut self, _offset: Vec3) {}
}

/// The per-world set of collaborators.
pub struct WorldServices {
    pub render: Box<dyn RenderScene>,
    pub physics: Box<dyn PhysicsScene>,
    pub network: Option<Box<dyn NetworkLayer>>,
}

impl WorldServices {
    pub fn new(render: Box<dyn RenderScene>, physics: Box<dyn PhysicsScene>) -> Self {
        Self {
            render,
            physics,
            network: None,
        }
    }

    pub fn headless() -> Self {
        Self::new(Box::new(NullScene), Box::new(NullScene))
    }

    pub fn with_network(mut self, network: Box<dyn NetworkLayer>) -> Self {
        self.network = Some(network);
        self
    }

    pub fn is_networked(&self) -> bool {
        self.network.is_some()
    }
}

impl std::fmt::Debug for WorldServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldServices")
            .field("networked", &self.is_networked())
            .finish_non_exhaustive()
    }
}
