use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory for the redb database and checkpoint blobs.
    pub data_dir: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: "./contextd-data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderConfig {
    pub base_url: String,
    pub max_embed_attempts: u32,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8081/embed".to_string(),
            max_embed_attempts: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorIndexConfig {
    /// `"qdrant"` or `"memory"`. Falls back to the in-process index if the
    /// `qdrant` feature isn't compiled in, regardless of this value.
    pub backend: String,
    pub qdrant_url: String,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            backend: "qdrant".to_string(),
            qdrant_url: "http://localhost:6334".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8082/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistillerConfig {
    pub threshold: f32,
    pub window_seconds: u64,
    pub force_all: bool,
    pub dry_run: bool,
    pub max_clusters_per_run: usize,
}

impl Default for DistillerConfig {
    fn default() -> Self {
        Self {
            threshold: 0.8,
            window_seconds: 24 * 3600,
            force_all: false,
            dry_run: false,
            max_clusters_per_run: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfigSection {
    pub interval_seconds: u64,
    pub per_run_timeout_seconds: u64,
}

impl Default for SchedulerConfigSection {
    fn default() -> Self {
        Self {
            interval_seconds: 24 * 3600,
            per_run_timeout_seconds: 10 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Relative to `store.data_dir` unless absolute.
    pub blob_dir: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            blob_dir: "checkpoints".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    pub auto_checkpoint_on_clear: bool,
    pub auto_resume_on_start: bool,
    pub checkpoint_threshold_percent: u8,
    pub verify_before_clear: bool,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            auto_checkpoint_on_clear: true,
            auto_resume_on_start: true,
            checkpoint_threshold_percent: 70,
            verify_before_clear: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ContextdConfig {
    pub store: StoreConfig,
    pub vector_index: VectorIndexConfig,
    pub embedder: EmbedderConfig,
    pub llm: LlmConfig,
    pub distiller: DistillerConfig,
    pub scheduler: SchedulerConfigSection,
    pub checkpoint: CheckpointConfig,
    pub hooks: HooksConfig,
    pub telemetry: TelemetryConfig,
}

impl ContextdConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("CONTEXTD_EMBEDDER_BASE_URL") {
            if !value.is_empty() {
                config.embedder.base_url = value;
            }
        }
        if let Ok(value) = env::var("CONTEXTD_LLM_BASE_URL") {
            if !value.is_empty() {
                config.llm.base_url = value;
            }
        }
        if let Ok(value) = env::var("CONTEXTD_QDRANT_URL") {
            if !value.is_empty() {
                config.vector_index.qdrant_url = value;
            }
        }

        config.hooks.checkpoint_threshold_percent = config.hooks.checkpoint_threshold_percent.clamp(1, 99);

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}
