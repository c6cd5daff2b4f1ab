//! Engine configuration with environment overrides.
//!
//! [`EngineConfig`] carries the tunables the engine needs at construction
//! time: the projection snapshot interval, model-resolution defaults, and
//! streaming buffer capacity. Values can be overridden through the
//! environment (`.env` files are honored via `dotenvy`).

use rustc_hash::FxHashMap;

use crate::collaborators::ModelConfig;
use crate::steps::StepCategory;

/// Environment variable controlling the projection snapshot interval.
pub const ENV_SNAPSHOT_INTERVAL: &str = "BRANCHLOOM_SNAPSHOT_INTERVAL";
/// Environment variable naming the engine-wide default model.
pub const ENV_DEFAULT_MODEL: &str = "BRANCHLOOM_DEFAULT_MODEL";
/// Environment variable controlling the run-snapshot stream buffer.
pub const ENV_STREAM_BUFFER: &str = "BRANCHLOOM_STREAM_BUFFER";

/// Configuration for an [`Engine`](crate::engine::Engine) instance.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Projection memoizes the projected map every this-many events so a
    /// re-projection replays a bounded suffix instead of the whole chain.
    pub snapshot_interval: usize,
    /// Engine-wide default model, the last resort of the resolution cascade.
    pub default_model: ModelConfig,
    /// Per-category model defaults, consulted before `default_model`.
    pub category_models: FxHashMap<StepCategory, ModelConfig>,
    /// Buffer capacity for the run-snapshot stream channel.
    pub stream_buffer: usize,
}

impl EngineConfig {
    pub const DEFAULT_SNAPSHOT_INTERVAL: usize = 64;
    pub const DEFAULT_STREAM_BUFFER: usize = 1024;

    /// Build a config from defaults plus environment overrides.
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut cfg = Self::default();
        if let Ok(raw) = std::env::var(ENV_SNAPSHOT_INTERVAL)
            && let Ok(n) = raw.parse::<usize>()
            && n > 0
        {
            cfg.snapshot_interval = n;
        }
        if let Ok(name) = std::env::var(ENV_DEFAULT_MODEL) {
            cfg.default_model = ModelConfig::named(name);
        }
        if let Ok(raw) = std::env::var(ENV_STREAM_BUFFER)
            && let Ok(n) = raw.parse::<usize>()
            && n > 0
        {
            cfg.stream_buffer = n;
        }
        cfg
    }

    #[must_use]
    pub fn with_snapshot_interval(mut self, interval: usize) -> Self {
        self.snapshot_interval = if interval == 0 {
            Self::DEFAULT_SNAPSHOT_INTERVAL
        } else {
            interval
        };
        self
    }

    #[must_use]
    pub fn with_default_model(mut self, model: ModelConfig) -> Self {
        self.default_model = model;
        self
    }

    /// Set the default model for one step category.
    #[must_use]
    pub fn with_category_model(mut self, category: StepCategory, model: ModelConfig) -> Self {
        self.category_models.insert(category, model);
        self
    }

    /// Set the run-snapshot stream buffer; a subscriber falling this far
    /// behind is disconnected.
    #[must_use]
    pub fn with_stream_buffer(mut self, buffer: usize) -> Self {
        self.stream_buffer = if buffer == 0 {
            Self::DEFAULT_STREAM_BUFFER
        } else {
            buffer
        };
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: Self::DEFAULT_SNAPSHOT_INTERVAL,
            default_model: ModelConfig::named("default"),
            category_models: FxHashMap::default(),
            stream_buffer: Self::DEFAULT_STREAM_BUFFER,
        }
    }
}
