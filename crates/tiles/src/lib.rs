//! Tile catalog: the full set of sub-level tiles known to a composed world.
//!
//! # Invariants
//! - A tile's absolute position is its parent's absolute position plus its relative position.
//! - Parenting is acyclic; cycles are rejected when a parent is assigned.
//! - One malformed manifest entry never aborts a rescan.

mod layer;
mod manifest;
mod registry;

pub use layer::{DEFAULT_LAYER_NAME, DEFAULT_STREAMING_DISTANCE, StreamingLayer};
pub use manifest::{BoundsRecord, Manifest, ManifestEntryError, ManifestError, TileRecord};
pub use registry::{RegistryError, RescanReport, Tile, TileHandle, TileRegistry};
