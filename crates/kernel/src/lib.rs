//! World Kernel: loaded level instances, the world origin, and the
//! collaborators a composition world talks to.
//!
//! # Invariants
//! - Render-space placement of a level is always `absolute tile position - current origin`
//!   while it is visible.
//! - The origin only changes through [`OriginTracker::apply_pending_rebase`], and never
//!   while a level transition is in progress.
//! - Events are delivered to observers in emission order.

pub mod events;
pub mod level;
pub mod origin;
pub mod recording;
pub mod scene;

pub use events::{CompositionEvent, CompositionObserver, Notifier};
pub use level::{Actor, Level, LevelHandle, Mobility, PackageContents};
pub use origin::{OriginError, OriginTracker, RebaseOutcome};
pub use scene::{NetworkLayer, NullScene, PhysicsScene, RenderScene, WorldServices};
