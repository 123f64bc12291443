//! Config file location and loading

use std::path::{Path, PathBuf};

use breakguard_core::BreakGuardConfig;
use tracing::info;

use crate::error::{DaemonError, Result};

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "BREAKGUARD_CONFIG";

/// `$BREAKGUARD_CONFIG`, else `<config dir>/breakguard/config.json`
pub fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            #[cfg(unix)]
            let fallback = PathBuf::from("/etc");
            #[cfg(not(unix))]
            let fallback = PathBuf::from(r"C:\ProgramData");

            dirs::config_dir()
                .unwrap_or(fallback)
                .join("breakguard")
                .join("config.json")
        })
}

/// Load the config, writing the defaults on first run
///
/// The loaded config is validated; an invalid file is an error, never
/// silently replaced.
pub fn load_or_create(path: &Path) -> Result<BreakGuardConfig> {
    let config = if path.exists() {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)?
    } else {
        let config = BreakGuardConfig::default();
        save(&config, path)?;
        info!("Created default config at {:?}", path);
        config
    };

    config.validate()?;
    Ok(config)
}

/// Write the config as pretty JSON
pub fn save(config: &BreakGuardConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Where state and sealed secrets live: `data_dir` from the config, else
/// `<local data dir>/breakguard`
pub fn data_dir(config: &BreakGuardConfig) -> Result<PathBuf> {
    if let Some(dir) = &config.data_dir {
        return Ok(dir.clone());
    }
    dirs::data_local_dir()
        .map(|dir| dir.join("breakguard"))
        .ok_or(DaemonError::NoDataDir)
}
