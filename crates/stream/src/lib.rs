//! Streaming: which tiles should be loaded and visible, and the budgeted
//! pipeline that gets their levels there.
//!
//! # Invariants
//! - At most one level is being added to the world at any instant.
//! - A level is never visible before all of its components are registered.
//! - Unloaded levels are freed only at a collection safe point.
//! - A failed load never stops streaming for other tiles.

mod budget;
mod decision;
mod gc;
mod lifecycle;
mod loader;
mod volume;

pub use budget::{StreamStats, TickBudget, TickTimer};
pub use decision::{
    DecisionInputs, DesiredChange, DesiredState, EditorOverride, StreamingDecisionEngine,
    distance_to_tile,
};
pub use gc::GcCoordinator;
pub use lifecycle::{
    ActivationStep, LevelRecord, LevelState, LevelTable, LifecycleSettings, StreamingContext,
    WorldKind,
};
pub use loader::{InMemoryLoader, LoadCompletion, LoadError, LoadQueue, LoadReply, PackageLoader};
pub use volume::{StreamingVolume, StreamingVolumeUsage, VolumeHandle, VolumeSet, VolumeSettings};
