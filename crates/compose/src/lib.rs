//! World composition facade: owns one composed world and drives it every tick.
//!
//! # Invariants
//! - A world's registry, level table and collaborators are never shared with another world.
//! - A tick never fails; recoverable problems are logged and retried or skipped.
//! - [`WorldComposition::flush_all_pending`] returns only once nothing is left to stream,
//!   or reports that it cannot get there.

mod composition;
mod config;

pub use composition::{CompositionError, WorldComposition};
pub use config::{ActivationBudget, CompositionConfig, ConfigError, DecisionConfig, RebaseConfig};
