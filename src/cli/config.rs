//! Command-line interface configuration
//!
//! The configuration file supplies defaults for settings that rarely change
//! between invocations, such as the gateway address. Command-line flags
//! still take precedence over the file.

use std::{fs::read_to_string, path::PathBuf};

use directories::ProjectDirs;
use log::debug;
use miette::{IntoDiagnostic, Result, WrapErr};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "uf2batch.toml";

/// Gateway connection defaults
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct GatewayConfig {
    /// Host name or address of the gateway
    #[serde(default)]
    pub host: Option<String>,
    /// TCP port the gateway listens on
    #[serde(default)]
    pub port: Option<u16>,
}

/// Configuration loaded from `uf2batch.toml`
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Config {
    /// Gateway connection defaults
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl Config {
    /// Load configuration from the configuration file, if one exists
    pub fn load() -> Result<Self> {
        let Some(path) = Self::config_path().filter(|path| path.exists()) else {
            return Ok(Config::default());
        };

        let raw = read_to_string(&path).into_diagnostic()?;
        let config: Config = toml::from_str(&raw)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to parse {}", path.display()))?;
        debug!("Config: {config:#?}");

        Ok(config)
    }

    /// A configuration file in the working directory wins over the global one
    fn config_path() -> Option<PathBuf> {
        if let Ok(current_dir) = std::env::current_dir() {
            let local_config = current_dir.join(CONFIG_FILE);
            if local_config.exists() {
                return Some(local_config);
            }
        }

        let project_dirs = ProjectDirs::from("", "", "uf2batch")?;
        Some(project_dirs.config_dir().join(CONFIG_FILE))
    }
}
