use crate::errors::{ConfigError, ConfigResult};
use serde::Deserialize;
use std::fs;

/// Root configuration struct expecting `[[bus]]` TOML array format
#[derive(Debug, Deserialize)]
pub struct BusConfig {
    #[serde(rename = "bus")]
    pub buses: Vec<BusEntry>,
}

/// One bus entry, matching each `[[bus]]` section
#[derive(Debug, Deserialize)]
pub struct BusEntry {
    pub id: String,
    pub r#type: String,
    pub path: String,
}

/// Loads bus config from TOML file
pub fn load_bus_config(path: &str) -> ConfigResult<BusConfig> {
    let content = fs::read_to_string(path).map_err(|e| ConfigError::LoadError {
        path: path.to_string(),
        source: e,
    })?;
    let parsed: BusConfig = toml::from_str(&content)?;
    Ok(parsed)
}
