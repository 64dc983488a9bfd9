//! Persisted world-composition manifest.
//!
//! One record per tile. The document is JSON:
//! ```text
//! {
//!   "layers": [ { "name": "Far", "streaming_distance": 200000 } ],
//!   "tiles": [
//!     { "package_name": "/Game/Sub1", "position": [1000, 0, 0],
//!       "bounds": { "min": [0,0,0], "max": [512,512,64], "valid": true },
//!       "parent": "", "layer": "Far", "landscape": false }
//!   ]
//! }
//! ```
//! Tile entries are kept as raw JSON values so a single bad entry can be
//! rejected without failing the whole document.

use glam::Vec3;
use serde::{Deserialize, Serialize};
use std::path::Path;
use worldspace_common::{Bounds, IntVector};

use crate::layer::StreamingLayer;

/// Errors that reject a whole manifest document.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that reject a single tile entry during a rescan.
#[derive(Debug, thiserror::Error)]
pub enum ManifestEntryError {
    #[error("entry {index}: {source}")]
    Decode {
        index: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("entry {index}: empty package name")]
    EmptyName { index: usize },
    #[error("entry {index}: duplicate package name '{name}'")]
    DuplicateName { index: usize, name: String },
    #[error("entry {index}: bounds of '{name}' are inverted")]
    MalformedBounds { index: usize, name: String },
}

/// Bounding box as persisted: six floats plus a validity mark.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundsRecord {
    #[serde(default)]
    pub min: [f32; 3],
    #[serde(default)]
    pub max: [f32; 3],
    /// `false` means "not computed yet, don't trust".
    #[serde(default)]
    pub valid: bool,
}

impl BoundsRecord {
    pub fn to_bounds(&self) -> Bounds {
        if self.valid {
            Bounds::new(Vec3::from_array(self.min), Vec3::from_array(self.max))
        } else {
            Bounds::INVALID
        }
    }

    fn is_ordered(&self) -> bool {
        self.min.iter().zip(self.max.iter()).all(|(lo, hi)| lo <= hi)
    }
}

impl From<Bounds> for BoundsRecord {
    fn from(b: Bounds) -> Self {
        Self {
            min: b.min.to_array(),
            max: b.max.to_array(),
            valid: b.valid,
        }
    }
}

/// One tile entry of the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileRecord {
    pub package_name: String,
    /// Offset from the parent tile.
    #[serde(default)]
    pub position: [i64; 3],
    #[serde(default)]
    pub bounds: BoundsRecord,
    /// Parent package name; empty means the tile hangs off the persistent level.
    #[serde(default)]
    pub parent: String,
    #[serde(default)]
    pub layer: String,
    #[serde(default)]
    pub landscape: bool,
}

impl TileRecord {
    pub fn new(package_name: impl Into<String>, position: IntVector) -> Self {
        Self {
            package_name: package_name.into(),
            position: position.to_array(),
            bounds: BoundsRecord::default(),
            parent: String::new(),
            layer: String::new(),
            landscape: false,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = parent.into();
        self
    }

    pub fn with_layer(mut self, layer: impl Into<String>) -> Self {
        self.layer = layer.into();
        self
    }

    pub fn with_bounds(mut self, bounds: Bounds) -> Self {
        self.bounds = bounds.into();
        self
    }

    pub fn relative_position(&self) -> IntVector {
        IntVector::from_array(self.position)
    }
}

/// The manifest document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub layers: Vec<StreamingLayer>,
    #[serde(default)]
    pub tiles: Vec<serde_json::Value>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(s: &str) -> Result<Self, ManifestError> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let data = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&data)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ManifestError> {
        serde_json::to_writer_pretty(std::fs::File::create(path.as_ref())?, self)?;
        Ok(())
    }

    pub fn push_layer(&mut self, layer: StreamingLayer) -> &mut Self {
        self.layers.push(layer);
        self
    }

    pub fn push_tile(&mut self, record: TileRecord) -> &mut Self {
        // A TileRecord only holds plain data; conversion cannot fail.
        if let Ok(value) = serde_json::to_value(record) {
            self.tiles.push(value);
        }
        self
    }

    /// Decode and validate one entry. Duplicate detection is left to the scan.
    pub fn decode_entry(index: usize, value: &serde_json::Value) -> Result<TileRecord, ManifestEntryError> {
        let record = TileRecord::deserialize(value)
            .map_err(|source| ManifestEntryError::Decode { index, source })?;
        if record.package_name.trim().is_empty() {
            return Err(ManifestEntryError::EmptyName { index });
        }
        if record.bounds.valid && !record.bounds.is_ordered() {
            return Err(ManifestEntryError::MalformedBounds {
                index,
                name: record.package_name,
            });
        }
        Ok(record)
    }
}
