//! Configuration loading helper functions
//!
//! Layered loading with figment. Priority (highest to lowest):
//! 1. Environment variables (`<PREFIX>` + `__` as nesting separator)
//! 2. Config file (YAML, TOML or JSON by extension)
//! 3. `T::default()`

use std::path::{Path, PathBuf};

use errors::{VoltageError, VoltageResult};
use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

/// Resolve the config file path
///
/// Priority: explicit CLI path > `env_var` > `default` (only if it exists).
pub fn resolve_config_path(
    cli_path: Option<PathBuf>,
    env_var: &str,
    default: &str,
) -> Option<PathBuf> {
    if let Some(path) = cli_path {
        info!("Using config file from command line: {}", path.display());
        return Some(path);
    }

    if let Ok(env_path) = std::env::var(env_var) {
        if !env_path.is_empty() {
            info!("Using config file from {}: {}", env_var, env_path);
            return Some(PathBuf::from(env_path));
        }
    }

    let default_path = PathBuf::from(default);
    if default_path.exists() {
        info!("Using default config file: {}", default);
        Some(default_path)
    } else {
        debug!("No config file found, using built-in defaults");
        None
    }
}

/// Build the figment for `T` without extracting it
pub fn build_figment<T>(path: Option<&Path>, env_prefix: &str) -> VoltageResult<Figment>
where
    T: Serialize + Default,
{
    let mut figment = Figment::from(Serialized::defaults(T::default()));

    if let Some(path) = path {
        if !path.exists() {
            return Err(VoltageError::FileNotFound(path.display().to_string()));
        }

        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| VoltageError::Configuration("Config file must have an extension".to_string()))?;

        figment = match extension {
            "yaml" | "yml" => figment.merge(Yaml::file(path)),
            "toml" => figment.merge(Toml::file(path)),
            "json" => figment.merge(Json::file(path)),
            _ => {
                return Err(VoltageError::Configuration(format!(
                    "Unsupported config file format: {}",
                    extension
                )))
            },
        };
    }

    Ok(figment.merge(Env::prefixed(env_prefix).split("__")))
}

/// Load configuration from defaults, an optional file and the environment
pub fn load_config<T>(path: Option<&Path>, env_prefix: &str) -> VoltageResult<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    build_figment::<T>(path, env_prefix)?
        .extract()
        .map_err(|e| VoltageError::Configuration(format!("Failed to load configuration: {}", e)))
}
