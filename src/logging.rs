use anyhow::Context;
use log4rs::config::{Deserializers, RawConfig};
use log4rs::{init_file, init_raw_config};
use std::path::Path;

const DEFAULT_CONFIG: &str = include_str!("default_logging.yml");

/// Installs log4rs from `log_config`, or from the built-in console config when absent.
pub fn init_logging(log_config: Option<&Path>) -> anyhow::Result<()> {
    if let Some(config_path) = log_config {
        init_file(config_path, Deserializers::default())
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;
    } else {
        let config = serde_yaml::from_str::<RawConfig>(DEFAULT_CONFIG)?;
        init_raw_config(config)?;
    }
    Ok(())
}
