use serde::{Deserialize, Serialize};
use worldspace_common::IntVector;

/// A notification produced by the composition core.
///
/// Events are emitted at fixed points of the level lifecycle and the origin
/// rebase, in the order those points are reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompositionEvent {
    /// Package finished loading; the level is loaded but hidden.
    LevelLoaded { package: String },
    /// Package failed to load; the record went back to unloaded.
    LoadFailed { package: String, reason: String },
    /// Level finished activation and is visible.
    LevelAdded { package: String },
    /// Level was removed from the world and is hidden again.
    LevelRemoved { package: String },
    /// Level was handed over for teardown.
    UnloadRequested { package: String },
    /// Level memory was reclaimed at a collection safe point.
    LevelCollected { package: String },
    LevelShelved { package: String },
    LevelUnshelved { package: String },
    /// About to shift the world; no offsets applied yet.
    OriginShifting { from: IntVector, to: IntVector },
    /// World shift finished and the origin was swapped.
    OriginShifted { from: IntVector, to: IntVector },
}

impl CompositionEvent {
    pub fn package(&self) -> Option<&str> {
        match self {
            Self::LevelLoaded { package }
            | Self::LoadFailed { package, .. }
            | Self::LevelAdded { package }
            | Self::LevelRemoved { package }
            | Self::UnloadRequested { package }
            | Self::LevelCollected { package }
            | Self::LevelShelved { package }
            | Self::LevelUnshelved { package } => Some(package),
            Self::OriginShifting { .. } | Self::OriginShifted { .. } => None,
        }
    }
}

/// Receives composition events as they are emitted.
///
/// Navigation, audio and other origin-dependent systems subscribe here.
pub trait CompositionObserver {
    fn on_event(&mut self, event: &CompositionEvent);
}

/// Observer list plus an append-only log of everything emitted since the last drain.
#[derive(Default)]
pub struct Notifier {
    log: Vec<CompositionEvent>,
    observers: Vec<Box<dyn CompositionObserver>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, observer: Box<dyn CompositionObserver>) {
        self.observers.push(observer);
    }

    /// Deliver to every observer in subscription order, then log.
    pub fn emit(&mut self, event: CompositionEvent) {
        for observer in &mut self.observers {
            observer.on_event(&event);
        }
        self.log.push(event);
    }

    pub fn events(&self) -> &[CompositionEvent] {
        &self.log
    }

    pub fn drain_events(&mut self) -> Vec<CompositionEvent> {
        std::mem::take(&mut self.log)
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("pending", &self.log.len())
            .field("observers", &self.observers.len())
            .finish()
    }
}
