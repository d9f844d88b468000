//! Engine configuration.
//!
//! Two layers live here: the host-level TOML file ([`EngineConfig`]) that
//! wires paths, endpoints, and tunables at startup, and the per-user
//! [`SecretStore`] that keeps recipe-validated settings — including sealed
//! API tokens — in the versioned object store.

mod engine_config;
mod secrets;

pub use engine_config::{
    AnalysisSection, EngineConfig, LlmSection, MaintenanceSection, ProposalsSection,
    StorageSection, TelemetrySection,
};
pub use secrets::{SecretSealer, SecretStore, SettingsView};

use lore_object::ObjectError;
use lore_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    /// The platform key-wrapping function is absent; sealed fields cannot
    /// be written or read.
    #[error("secret unavailable: no sealing key configured")]
    SecretUnavailable,

    #[error("config file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config render error: {0}")]
    Render(#[from] toml::ser::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Object(#[from] ObjectError),
}
