//! Service bootstrap: command line, configuration loading and logger setup

use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use common::config_loader::{build_figment, resolve_config_path};
use common::logging::LogConfig;
use figment::providers::Serialized;
use tracing::Level;

use super::config::{BmsConfig, ServiceConfig, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH, ENV_PREFIX};
use crate::error::{BmsError, Result};

#[derive(Parser, Debug, Default)]
#[command(author, version, about = "BmsSrv - battery management service")]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Load and validate the configuration, then exit
    #[arg(long)]
    pub validate: bool,

    /// Disable colored console output
    #[arg(long)]
    pub no_color: bool,
}

/// Load the configuration for `args` and validate it
///
/// Sources, lowest priority first: built-in defaults, the YAML file, `BMSSRV_*`
/// environment variables, then command line overrides.
pub fn load_config(args: &Args) -> Result<BmsConfig> {
    let path = resolve_config_path(args.config.clone(), CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH);

    let mut figment = build_figment::<BmsConfig>(path.as_deref(), ENV_PREFIX)
        .map_err(|e| BmsError::config(e.to_string()))?;
    if let Some(level) = &args.log_level {
        figment = figment.merge(Serialized::default("service.log_level", level));
    }

    let config: BmsConfig = figment
        .extract()
        .map_err(|e| BmsError::config(format!("Failed to load configuration: {}", e)))?;
    config.validate()?;
    Ok(config)
}

/// Logger settings for the service section
pub fn log_config(service: &ServiceConfig, ansi: bool) -> LogConfig {
    LogConfig {
        service_name: service.name.clone(),
        log_dir: service.log_dir.clone(),
        level: Level::from_str(&service.log_level).unwrap_or(Level::INFO),
        enable_json: service.log_json,
        ansi,
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::io::Write;

    const YAML: &str = r#"
service:
  log_level: warn
bridges:
  - id: bus0
    transport:
      type: rtu
      port: /dev/ttyS1
      baud_rate: 19200
devices:
  - id: battery0
    bridge: bus0
    kind: single_rack
"#;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_from_file_with_cli_override() {
        let file = write_config(YAML);
        let args = Args {
            config: Some(file.path().to_path_buf()),
            log_level: Some("debug".to_string()),
            ..Args::default()
        };

        let config = load_config(&args).unwrap();
        assert_eq!(config.service.log_level, "debug");
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.bridges[0].cycle_time_ms, 1000);

        let log = log_config(&config.service, false);
        assert_eq!(log.level, Level::DEBUG);
        assert_eq!(log.service_name, "bmssrv");
        assert!(log.log_dir.is_none());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let file = write_config("bridges: []\ndevices: []\n");
        let args = Args {
            config: Some(file.path().to_path_buf()),
            ..Args::default()
        };
        assert!(load_config(&args).is_err());
    }

    #[test]
    fn test_missing_file_rejected() {
        let args = Args {
            config: Some(PathBuf::from("/nonexistent/bmssrv.yaml")),
            ..Args::default()
        };
        assert!(load_config(&args).is_err());
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let args = Args {
            config: Some(PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/config/bmssrv.yaml"))),
            ..Args::default()
        };
        let config = load_config(&args).unwrap();
        assert_eq!(config.bridges.len(), 2);
        assert_eq!(config.devices[1].racks, vec![1, 2, 3]);
    }

    #[test]
    fn test_unknown_level_falls_back_to_info() {
        let service = ServiceConfig {
            log_level: "loud".to_string(),
            ..ServiceConfig::default()
        };
        assert_eq!(log_config(&service, true).level, Level::INFO);
    }
}
