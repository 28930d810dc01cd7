use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::{debug, info};

use crate::{env_subst::substitute_env, error::ConfigError, schema::NaclgateConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "naclgate.toml",
    "naclgate.yaml",
    "naclgate.yml",
    "naclgate.json",
    "config.json",
];

/// Override for the config directory, set via `set_config_dir()`.
static CONFIG_DIR_OVERRIDE: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Set a custom config directory. When set, discovery only looks in this
/// directory. Each call replaces the previous override.
pub fn set_config_dir(path: PathBuf) {
    *CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(|e| e.into_inner()) = Some(path);
}

/// Clear the config directory override, restoring default discovery.
pub fn clear_config_dir() {
    *CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(|e| e.into_inner()) = None;
}

fn config_dir_override() -> Option<PathBuf> {
    CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
}

/// Load and validate config from the given path (any supported format).
pub fn load_config(path: &Path) -> Result<NaclgateConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let raw = substitute_env(&raw);
    let config = parse_config(&raw, path)?;
    config.validate()?;
    debug!(path = %path.display(), "loaded config");
    Ok(config)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./naclgate.{toml,yaml,yml,json}`, then `./config.json`
/// 2. `~/.config/naclgate/` with the same names
///
/// Returns the validated default config if no file is found. A file that
/// exists but cannot be loaded is an error.
pub fn discover_and_load() -> Result<NaclgateConfig, ConfigError> {
    match find_config_file() {
        Some(path) => load_config(&path),
        None => {
            info!("no config file found, using defaults");
            let config = NaclgateConfig::default();
            config.validate()?;
            Ok(config)
        },
    }
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    if let Some(dir) = config_dir_override() {
        // Override is set, don't fall through to other locations.
        return first_existing(&dir);
    }

    first_existing(Path::new(".")).or_else(|| config_dir().and_then(|d| first_existing(&d)))
}

fn first_existing(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Returns the config directory: override, or `~/.config/naclgate/`.
pub fn config_dir() -> Option<PathBuf> {
    if let Some(dir) = config_dir_override() {
        return Some(dir);
    }
    directories::BaseDirs::new().map(|d| d.home_dir().join(".config").join("naclgate"))
}

/// Serialize `config` to `path`, picking the format from the extension.
///
/// Creates parent directories if needed.
pub fn save_config(config: &NaclgateConfig, path: &Path) -> Result<(), ConfigError> {
    let rendered = match extension(path) {
        "toml" => toml::to_string_pretty(config).map_err(|e| ConfigError::Serialize(e.to_string()))?,
        "yaml" | "yml" => {
            serde_yaml::to_string(config).map_err(|e| ConfigError::Serialize(e.to_string()))?
        },
        "json" => serde_json::to_string_pretty(config)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?,
        other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
    };

    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }
    std::fs::write(path, rendered).map_err(write_err)?;
    debug!(path = %path.display(), "saved config");
    Ok(())
}

fn extension(path: &Path) -> &str {
    path.extension().and_then(|e| e.to_str()).unwrap_or("toml")
}

fn parse_config(raw: &str, path: &Path) -> Result<NaclgateConfig, ConfigError> {
    let parse_err = |message: String| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    };

    match extension(path) {
        "toml" => toml::from_str(raw).map_err(|e| parse_err(e.to_string())),
        "yaml" | "yml" => serde_yaml::from_str(raw).map_err(|e| parse_err(e.to_string())),
        "json" => serde_json::from_str(raw).map_err(|e| parse_err(e.to_string())),
        other => Err(ConfigError::UnsupportedFormat(other.to_string())),
    }
}
