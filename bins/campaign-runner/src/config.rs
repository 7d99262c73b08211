// Campaign configuration loading for the runner
use anyhow::{bail, Context, Result};
use campaign_common::config::CampaignConfig;
use std::fs;
use std::path::Path;
use tracing::info;

pub const DEFAULT_CONFIG_PATH: &str = "config/campaign.json";

/// Load and validate a configuration file
pub fn load(config_path: &Path) -> Result<CampaignConfig> {
    if !config_path.exists() {
        bail!("Campaign config file not found: {}", config_path.display());
    }

    let content = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read {}", config_path.display()))?;

    let config: CampaignConfig = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", config_path.display()))?;

    config.validate()?;
    Ok(config)
}

/// Load with default path (config/campaign.json), falling back to
/// built-in defaults when that file does not exist
pub fn load_default() -> Result<CampaignConfig> {
    let default_path = Path::new(DEFAULT_CONFIG_PATH);
    if !default_path.exists() {
        info!("No {} found, using built-in defaults", DEFAULT_CONFIG_PATH);
        return Ok(CampaignConfig::default());
    }
    load(default_path)
}
