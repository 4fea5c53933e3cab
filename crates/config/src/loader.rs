use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::EngineConfig};

/// Config file name checked in the working directory.
const CONFIG_FILENAME: &str = "switchboard.toml";

/// Environment variable overriding the config path.
const CONFIG_PATH_ENV: &str = "SWITCHBOARD_CONFIG";

/// Load config from an explicit path.
pub fn load_config(path: &Path) -> anyhow::Result<EngineConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", path.display()))?;
    Ok(cfg)
}

/// Discover and load config, falling back to defaults.
///
/// Search order:
/// 1. `$SWITCHBOARD_CONFIG` if set
/// 2. `./switchboard.toml`
pub fn discover_and_load() -> EngineConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading engine config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "bad config file, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    EngineConfig::default()
}

fn find_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
    }
    let local = PathBuf::from(CONFIG_FILENAME);
    local.exists().then_some(local)
}
