//! Shared types for the worldspace composition crates.

mod handle;
mod types;

pub use handle::{Arena, Handle};
pub use types::{ActorId, Bounds, IntVector, Transform, distance_2d_to_box};
