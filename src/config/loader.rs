// src/config/loader.rs

use crate::config::{AppConfig, ConfigValidator};
use crate::error::{AppError, Result};
use std::path::Path;
use tracing::{debug, info, warn};

/// Load configuration from file and environment variables
pub fn load_config(config_path: &Path) -> Result<AppConfig> {
    let mut config = if config_path.exists() {
        info!("Loading configuration from file: {}", config_path.display());
        load_from_file(config_path)?
    } else {
        info!("Configuration file not found, using defaults");
        AppConfig::default()
    };

    override_with_env(&mut config);

    ConfigValidator::validate(&config)?;

    debug!("Configuration loaded and validated successfully");
    Ok(config)
}

fn load_from_file(config_path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(config_path).map_err(|_| AppError::ConfigNotFound {
        path: config_path.display().to_string(),
    })?;

    serde_yaml::from_str(&content).map_err(|e| AppError::ConfigParse {
        message: format!("Failed to parse config file: {e}"),
        line: e.location().map(|loc| loc.line()),
    })
}

fn override_with_env(config: &mut AppConfig) {
    if let Ok(redis_url) = std::env::var("REDIS_URL") {
        info!("Overriding Redis URL from environment variable");
        config.redis_url = Some(redis_url);
    }

    if let Ok(database_url) = std::env::var("DATABASE_URL") {
        info!("Overriding database URL from environment variable");
        config.database_url = Some(database_url);
    }

    if let Ok(port_str) = std::env::var("PORT") {
        if let Ok(port) = port_str.parse::<u16>() {
            info!("Overriding server port from environment variable: {}", port);
            config.server.port = port;
        } else {
            warn!("Invalid PORT environment variable: {}", port_str);
        }
    }

    if let Ok(secs_str) = std::env::var("KEYPOOL_COOLDOWN_SECONDS") {
        if let Ok(secs) = secs_str.parse::<u64>() {
            info!("Overriding cooldown duration from environment: {}s", secs);
            config.pool.cooldown_seconds = secs;
        } else {
            warn!("Invalid KEYPOOL_COOLDOWN_SECONDS environment variable: {}", secs_str);
        }
    }

    if let Ok(strategy_str) = std::env::var("KEYPOOL_STRATEGY") {
        match strategy_str.parse() {
            Ok(strategy) => {
                info!("Overriding selection strategy from environment: {}", strategy);
                config.pool.strategy = strategy;
            }
            Err(e) => warn!("Invalid KEYPOOL_STRATEGY environment variable: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SelectionStrategy;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    #[serial]
    fn missing_file_yields_defaults() {
        let config = load_config(Path::new("/definitely/not/here.yaml")).unwrap();
        assert_eq!(config.pool.cooldown_seconds, 300);
        assert_eq!(config.pool.strategy, SelectionStrategy::Sticky);
        assert_eq!(config.pool.disable_codes, vec![401, 403]);
    }

    #[test]
    #[serial]
    fn parses_partial_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "pool:\n  cooldown_seconds: 60\n  strategy: round_robin\ngroups:\n  - name: eastus\n    api_keys: [\"k1\", \"k2\"]"
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.pool.cooldown_seconds, 60);
        assert_eq!(config.pool.strategy, SelectionStrategy::RoundRobin);
        assert_eq!(config.groups.len(), 1);
        assert_eq!(config.groups[0].api_keys.len(), 2);
        // untouched fields keep their defaults
        assert_eq!(config.pool.cooldown_codes, vec![429]);
    }

    #[test]
    #[serial]
    fn env_overrides_apply() {
        std::env::set_var("PORT", "4321");
        std::env::set_var("KEYPOOL_STRATEGY", "round_robin");

        let config = load_config(Path::new("/definitely/not/here.yaml")).unwrap();
        assert_eq!(config.server.port, 4321);
        assert_eq!(config.pool.strategy, SelectionStrategy::RoundRobin);

        std::env::remove_var("PORT");
        std::env::remove_var("KEYPOOL_STRATEGY");
    }
}
