//! Configuration loading

use anyhow::{bail, Context, Result};

use crate::Config;

/// Load configuration from config file or environment variables
///
/// Config file search order:
/// 1. `PODROUTE_CONFIG_PATH` environment variable (explicit path)
/// 2. ./config.yaml (current working directory)
/// 3. /config/config.yaml (Kubernetes mount path)
/// 4. Fall back to environment variables only
///
/// Logging is not initialized yet when this runs, so diagnostics go to stderr.
pub fn load_config() -> Result<Config> {
    let config_path = std::env::var("PODROUTE_CONFIG_PATH")
        .ok()
        .filter(|p| std::path::Path::new(p).exists())
        .or_else(|| {
            ["config.yaml", "/config/config.yaml"]
                .into_iter()
                .find(|p| std::path::Path::new(p).exists())
                .map(ToString::to_string)
        });

    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        Config::from_file(&path).with_context(|| format!("Failed to load {path}"))?
    } else {
        eprintln!("No config file found, using environment variables");
        Config::from_env().context("Failed to load config from environment")?
    };

    if let Err(errors) = config.validate() {
        bail!("Invalid configuration: {}", errors.join("; "));
    }

    Ok(config)
}
