use serde::{Deserialize, Serialize};

/// Name of the layer every tile falls back to.
pub const DEFAULT_LAYER_NAME: &str = "Uncategorized";

/// Streaming distance used by the default layer, in world units.
pub const DEFAULT_STREAMING_DISTANCE: i64 = 50_000;

fn default_streaming_distance() -> i64 {
    DEFAULT_STREAMING_DISTANCE
}

/// A named streaming-distance layer shared by a group of tiles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingLayer {
    pub name: String,
    /// 2D distance from any viewer within which member tiles are streamed in.
    #[serde(default = "default_streaming_distance")]
    pub streaming_distance: i64,
    /// Member tiles are exempt from distance-based unloading.
    #[serde(default)]
    pub always_loaded: bool,
}

impl StreamingLayer {
    pub fn new(name: impl Into<String>, streaming_distance: i64) -> Self {
        Self {
            name: name.into(),
            streaming_distance,
            always_loaded: false,
        }
    }

    pub fn always_loaded(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            streaming_distance: 0,
            always_loaded: true,
        }
    }
}

impl Default for StreamingLayer {
    fn default() -> Self {
        Self::new(DEFAULT_LAYER_NAME, DEFAULT_STREAMING_DISTANCE)
    }
}
