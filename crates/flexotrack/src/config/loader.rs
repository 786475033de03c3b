use std::path::Path;

use crate::config::schema::Config;
use crate::error::ConfigError;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "FLEXOTRACK_CONFIG";

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

/// Loads the file named by `FLEXOTRACK_CONFIG`, or defaults when unset or missing.
pub fn load_config_from_env() -> Result<Config, ConfigError> {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) if Path::new(&path).exists() => load_config(path),
        Some(path) => {
            log::warn!(
                "Config file {} not found, using defaults",
                Path::new(&path).display()
            );
            Ok(Config::default())
        }
        None => Ok(Config::default()),
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.machines.is_empty() {
        return Err(ConfigError::Validation {
            message: format!(
                "Machine range {}..={} is empty",
                config.machines.first, config.machines.last
            ),
        });
    }

    if config.notifier.capacity == 0 {
        return Err(ConfigError::Validation {
            message: "notifier.capacity must be greater than zero".to_string(),
        });
    }

    if config.scheduler.interval_secs == 0 {
        return Err(ConfigError::Validation {
            message: "scheduler.interval_secs must be greater than zero".to_string(),
        });
    }

    if config.scheduler.retention_days == 0 {
        return Err(ConfigError::Validation {
            message: "scheduler.retention_days must be greater than zero".to_string(),
        });
    }

    Ok(())
}
