use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Directory holding the database file.
    pub data_dir: String,
    pub db_file: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: ".".to_string(),
            db_file: "lore.redb".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// Chat endpoint base URL; empty means the offline lexical analyzer.
    /// Overridden at runtime by the `LORE_LLM_ENDPOINT` environment
    /// variable when set.
    pub endpoint: String,
    pub model: String,
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            model: "llama3.1:8b".to_string(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSection {
    /// Messages per topic between background analysis triggers.
    pub trigger_every: usize,
    /// Pending-topic queue bound.
    pub queue_cap: usize,
}

impl Default for AnalysisSection {
    fn default() -> Self {
        Self {
            trigger_every: 5,
            queue_cap: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProposalsSection {
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
}

impl Default for ProposalsSection {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 60,
            cache_capacity: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceSection {
    pub interval_minutes: u64,
    pub orphan_age_days: i64,
}

impl Default for MaintenanceSection {
    fn default() -> Self {
        Self {
            interval_minutes: 60,
            orphan_age_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    pub log_level: String,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Email of the local user; scopes per-user settings and proposals.
    pub user_email: String,
    pub storage: StorageSection,
    pub llm: LlmSection,
    pub analysis: AnalysisSection,
    pub proposals: ProposalsSection,
    pub maintenance: MaintenanceSection,
    pub telemetry: TelemetrySection,
}

impl EngineConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("LORE_LLM_ENDPOINT") {
            if !value.is_empty() {
                config.llm.endpoint = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn db_path(&self) -> std::path::PathBuf {
        Path::new(&self.storage.data_dir).join(&self.storage.db_file)
    }

    pub fn offline(&self) -> bool {
        self.llm.endpoint.is_empty()
    }
}
