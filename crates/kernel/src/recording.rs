//! Scene collaborators that record every call into a shared log.
//!
//! Handy for tests and for the `simulate` command, which prints the log.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use glam::Vec3;
use worldspace_common::ActorId;

use crate::level::LevelHandle;
use crate::scene::{NetworkLayer, PhysicsScene, RenderScene, WorldServices};

#[derive(Debug, Clone, PartialEq)]
pub enum SceneCall {
    AddLevel(String),
    RemoveLevel(String),
    RegisterComponents(String, usize),
    UnregisterComponents(String),
    ReleaseLevel(String),
    RenderOffset(Vec3),
    PhysicsAddLevel(String),
    PhysicsRemoveLevel(String),
    PhysicsOffset(Vec3),
    LevelVisible(String),
    LevelHidden(String),
    ActorUnloaded(ActorId),
    NetworkActorsInitialized(String, usize),
    StreamingLevelUnload(String),
}

/// Shared, cloneable call log.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Rc<RefCell<Vec<SceneCall>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, call: SceneCall) {
        self.0.borrow_mut().push(call);
    }

    pub fn calls(&self) -> Vec<SceneCall> {
        self.0.borrow().clone()
    }

    pub fn count(&self, pred: impl Fn(&SceneCall) -> bool) -> usize {
        self.0.borrow().iter().filter(|c| pred(c)).count()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }
}

/// Render scene that logs. Package names are remembered per handle because
/// component registration only carries the handle.
#[derive(Debug, Default)]
pub struct RecordingRender {
    log: CallLog,
    names: HashMap<LevelHandle, String>,
}

impl RecordingRender {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            names: HashMap::new(),
        }
    }

    fn name(&self, level: LevelHandle) -> String {
        self.names
            .get(&level)
            .cloned()
            .unwrap_or_else(|| format!("#{}", level.index()))
    }
}

impl RenderScene for RecordingRender {
    fn add_level(&mut self, level: LevelHandle, package: &str) {
        self.names.insert(level, package.to_string());
        self.log.push(SceneCall::AddLevel(package.to_string()));
    }

    fn remove_level(&mut self, _level: LevelHandle, package: &str) {
        self.log.push(SceneCall::RemoveLevel(package.to_string()));
    }

    fn apply_world_offset(&mut self, offset: Vec3) {
        self.log.push(SceneCall::RenderOffset(offset));
    }

    fn register_components(&mut self, level: LevelHandle, count: usize) {
        let name = self.name(level);
        self.log.push(SceneCall::RegisterComponents(name, count));
    }

    fn unregister_components(&mut self, level: LevelHandle) {
        let name = self.name(level);
        self.log.push(SceneCall::UnregisterComponents(name));
    }

    fn release_level(&mut self, level: LevelHandle, package: &str) {
        self.names.remove(&level);
        self.log.push(SceneCall::ReleaseLevel(package.to_string()));
    }
}

#[derive(Debug, Default)]
pub struct RecordingPhysics {
    log: CallLog,
}

impl RecordingPhysics {
    pub fn new(log: CallLog) -> Self {
        Self { log }
    }
}

impl PhysicsScene for RecordingPhysics {
    fn add_level(&mut self, _level: LevelHandle, package: &str) {
        self.log.push(SceneCall::PhysicsAddLevel(package.to_string()));
    }

    fn remove_level(&mut self, _level: LevelHandle, package: &str) {
        self.log.push(SceneCall::PhysicsRemoveLevel(package.to_string()));
    }

    fn apply_world_offset(&mut self, offset: Vec3) {
        self.log.push(SceneCall::PhysicsOffset(offset));
    }
}

#[derive(Debug, Default)]
pub struct RecordingNetwork {
    log: CallLog,
}

impl RecordingNetwork {
    pub fn new(log: CallLog) -> Self {
        Self { log }
    }
}

impl NetworkLayer for RecordingNetwork {
    fn notify_level_visible(&mut self, package: &str) {
        self.log.push(SceneCall::LevelVisible(package.to_string()));
    }

    fn notify_level_hidden(&mut self, package: &str) {
        self.log.push(SceneCall::LevelHidden(package.to_string()));
    }

    fn notify_actor_unloaded(&mut self, actor: ActorId) {
        self.log.push(SceneCall::ActorUnloaded(actor));
    }

    fn initialize_network_actors(&mut self, package: &str, actors: &[ActorId]) {
        self.log
            .push(SceneCall::NetworkActorsInitialized(package.to_string(), actors.len()));
    }

    fn notify_streaming_level_unload(&mut self, package: &str) {
        self.log
            .push(SceneCall::StreamingLevelUnload(package.to_string()));
    }
}

/// Services wired to one shared log; with a network layer when `networked`.
pub fn recording_services(networked: bool) -> (WorldServices, CallLog) {
    let log = CallLog::new();
    let mut services = WorldServices::new(
        Box::new(RecordingRender::new(log.clone())),
        Box::new(RecordingPhysics::new(log.clone())),
    );
    if networked {
        services = services.with_network(Box::new(RecordingNetwork::new(log.clone())));
    }
    (services, log)
}
