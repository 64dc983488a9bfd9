use std::time::Instant;

use glam::{DVec3, Vec3};
use worldspace_common::IntVector;

use crate::events::{CompositionEvent, Notifier};
use crate::level::Level;
use crate::scene::WorldServices;

/// Errors from world origin operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OriginError {
    /// A level is being added to or removed from the world; retry next tick.
    #[error("world origin rebase deferred: a level transition is in progress")]
    RebaseDeferred,
}

/// Result of a successful rebase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebaseOutcome {
    pub from: IntVector,
    pub to: IntVector,
    pub levels_shifted: usize,
}

impl RebaseOutcome {
    pub fn shifted(&self) -> bool {
        self.from != self.to
    }
}

/// Owns the integer world origin and converts between absolute and local space.
///
/// Local (render) space is absolute space minus the current origin.
#[derive(Debug, Clone, Default)]
pub struct OriginTracker {
    current: IntVector,
    requested: IntVector,
}

impl OriginTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> IntVector {
        self.current
    }

    pub fn requested(&self) -> IntVector {
        self.requested
    }

    pub fn has_pending_rebase(&self) -> bool {
        self.current != self.requested
    }

    pub fn world_to_local(&self, absolute: IntVector) -> IntVector {
        absolute - self.current
    }

    pub fn local_to_world(&self, local: IntVector) -> IntVector {
        local + self.current
    }

    /// Absolute double-precision position of a render-space point.
    pub fn local_point_to_world(&self, local: Vec3) -> DVec3 {
        self.current.as_dvec3() + local.as_dvec3()
    }

    /// Record the origin to move to at the next safe point.
    pub fn request_rebase(&mut self, new_origin: IntVector) {
        if new_origin != self.requested {
            tracing::debug!(from = ?self.current, to = ?new_origin, "world origin rebase requested");
        }
        self.requested = new_origin;
    }

    /// Apply the requested origin.
    ///
    /// Refused while any level transition is in progress. Once offsets start
    /// being applied the call runs to completion for every visible level; unlike
    /// level activation it is never split across ticks. Hidden levels are left
    /// alone and get placed against the new origin when next activated.
    pub fn apply_pending_rebase<'a, I>(
        &mut self,
        transition_in_progress: bool,
        levels: I,
        services: &mut WorldServices,
        notifier: &mut Notifier,
    ) -> Result<RebaseOutcome, OriginError>
    where
        I: IntoIterator<Item = &'a mut Level>,
    {
        let from = self.current;
        let to = self.requested;
        if from == to {
            return Ok(RebaseOutcome {
                from,
                to,
                levels_shifted: 0,
            });
        }
        if transition_in_progress {
            tracing::debug!(?from, ?to, "world origin rebase deferred");
            return Err(OriginError::RebaseDeferred);
        }

        let _span = tracing::info_span!("world_origin_rebase").entered();
        tracing::info!(?from, ?to, "world translation begin");
        let start = Instant::now();

        notifier.emit(CompositionEvent::OriginShifting { from, to });

        let delta = from - to;
        let offset = delta.as_vec3();
        services.render.apply_world_offset(offset);
        services.physics.apply_world_offset(offset);

        let mut levels_shifted = 0;
        for level in levels {
            if level.is_visible() {
                level.apply_world_offset(delta);
                levels_shifted += 1;
            }
        }

        self.current = to;

        notifier.emit(CompositionEvent::OriginShifted { from, to });
        tracing::info!(
            origin = ?to,
            levels_shifted,
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            "world translation end"
        );

        Ok(RebaseOutcome {
            from,
            to,
            levels_shifted,
        })
    }
}
