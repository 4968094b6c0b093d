use crate::core::error::HostError;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// The data shape a config-file-replay collaborator would hand the
/// engine: where to load a memory image, where to start execution,
/// and a handful of simulator-kind breakpoints to seed up front. The
/// interactive replay/tab-completion machinery itself is not part of
/// this crate.
#[derive(Debug, Clone, Deserialize)]
pub struct SimConfig {
    pub image_path: String,
    #[serde(default)]
    pub load_address: u32,
    pub initial_pc: Option<u32>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub step_limit: Option<u64>,
    #[serde(default)]
    pub breakpoints: Vec<u32>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl SimConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, HostError> {
        let text = fs::read_to_string(path)?;
        let config: SimConfig = serde_yaml::from_str(&text)?;
        Ok(config)
    }
}
