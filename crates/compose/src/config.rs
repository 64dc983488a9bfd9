use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use worldspace_stream::{LifecycleSettings, TickBudget, WorldKind};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// How much activation work one tick may do.
///
/// ```yaml
/// activation_budget: { kind: time_limit, time_limit_ms: 5.0 }
/// activation_budget: { kind: steps, steps: 1 }
/// activation_budget: { kind: unlimited }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivationBudget {
    Unlimited,
    TimeLimit { time_limit_ms: f32 },
    Steps { steps: u32 },
}

impl Default for ActivationBudget {
    fn default() -> Self {
        Self::TimeLimit { time_limit_ms: 5.0 }
    }
}

impl ActivationBudget {
    /// A fresh budget starting now.
    pub fn start(&self) -> TickBudget {
        match *self {
            Self::Unlimited => TickBudget::unlimited(),
            Self::TimeLimit { time_limit_ms } => {
                let limit = Duration::try_from_secs_f32(time_limit_ms.max(0.0) / 1000.0)
                    .unwrap_or(Duration::MAX);
                TickBudget::time_limit(limit)
            }
            Self::Steps { steps } => TickBudget::steps(steps),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    /// Minimum time a tile keeps its streaming state before it may change again.
    pub dwell_secs: f64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self { dwell_secs: 2.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebaseConfig {
    pub enabled: bool,
    /// Viewer distance from the origin that triggers a rebase.
    pub distance: f64,
    /// Also move the origin along Z.
    pub in_3d: bool,
}

impl Default for RebaseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            distance: 100_000.0,
            in_3d: false,
        }
    }
}

/// World composition configuration, loadable from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositionConfig {
    pub world_kind: WorldKind,
    pub activation_budget: ActivationBudget,
    pub component_registration_granularity: usize,
    pub use_background_streaming: bool,
    pub time_sliced_removal: bool,
    pub decision: DecisionConfig,
    pub rebase: RebaseConfig,
    /// Loaded levels farther than this from the origin after a rebase are shelved.
    pub shelve_distance: Option<f64>,
    pub auto_collect_garbage: bool,
    pub verify_collection: bool,
    pub networked: bool,
}

impl Default for CompositionConfig {
    fn default() -> Self {
        Self {
            world_kind: WorldKind::Game,
            activation_budget: ActivationBudget::default(),
            component_registration_granularity: 50,
            use_background_streaming: true,
            time_sliced_removal: false,
            decision: DecisionConfig::default(),
            rebase: RebaseConfig::default(),
            shelve_distance: None,
            auto_collect_garbage: true,
            verify_collection: cfg!(debug_assertions),
            networked: false,
        }
    }
}

impl CompositionConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            world_kind: self.world_kind,
            component_registration_granularity: self.component_registration_granularity,
            use_background_streaming: self.use_background_streaming,
            time_sliced_removal: self.time_sliced_removal,
        }
    }

    /// Budget for one tick. Editor worlds are never time-sliced.
    pub fn tick_budget(&self) -> TickBudget {
        match self.world_kind {
            WorldKind::Editor => TickBudget::unlimited(),
            WorldKind::Game => self.activation_budget.start(),
        }
    }
}
