//! Layered runner configuration: JSON file, then environment, then flags.

use anyhow::{Context, Result, anyhow};
use cellsim_core::SimulationConfig;
use std::fs;
use std::path::Path;

/// Prefix of environment variables that override configuration keys.
pub const ENV_PREFIX: &str = "CELLSIM_";

/// Split a `key=value` override.
pub fn parse_override(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("override `{raw}` must look like key=value"))?;
    Ok((key.trim().to_owned(), value.trim().to_owned()))
}

/// Pick `CELLSIM_<KEY>` variables matching configuration keys.
pub fn env_overrides(vars: impl IntoIterator<Item = (String, String)>) -> Vec<(String, String)> {
    let mut overrides: Vec<(String, String)> = vars
        .into_iter()
        .filter_map(|(name, value)| {
            let key = name.strip_prefix(ENV_PREFIX)?.to_ascii_lowercase();
            SimulationConfig::KEYS
                .contains(&key.as_str())
                .then_some((key, value))
        })
        .collect();
    overrides.sort();
    overrides
}

/// Build the configuration from an optional JSON file plus overrides, applied
/// in order, and validate the result.
pub fn load_config(path: Option<&Path>, overrides: &[(String, String)]) -> Result<SimulationConfig> {
    let mut config = match path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse config {}", path.display()))?
        }
        None => SimulationConfig::default(),
    };
    for (key, value) in overrides {
        config
            .set(key, value)
            .with_context(|| format!("invalid override {key}={value}"))?;
    }
    config.validate().context("configuration rejected")?;
    Ok(config)
}
