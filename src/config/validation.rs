// src/config/validation.rs

use crate::config::AppConfig;
use crate::error::{AppError, Result};
use std::collections::HashSet;
use tracing::{debug, warn};

pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &AppConfig) -> Result<()> {
        debug!("Starting configuration validation");

        if let Err(e) = Self::validate_groups(config) {
            warn!("Group validation failed: {}", e);
            return Err(e);
        }

        if let Err(e) = Self::validate_pool(config) {
            warn!("Pool config validation failed: {}", e);
            return Err(e);
        }

        if let Err(e) = Self::validate_redis_config(config) {
            warn!("Redis config validation failed: {}", e);
            return Err(e);
        }

        debug!("Configuration validation completed successfully");
        Ok(())
    }

    fn validate_groups(config: &AppConfig) -> Result<()> {
        debug!("Validating {} seed groups", config.groups.len());

        let mut group_names = HashSet::new();
        let mut all_keys = HashSet::new();

        for group in &config.groups {
            if group.name.trim().is_empty() {
                return Err(AppError::config_validation(
                    "Group name must not be empty",
                    Some("group.name"),
                ));
            }

            if !group_names.insert(&group.name) {
                return Err(AppError::config_validation(
                    format!("Duplicate group name: {}", group.name),
                    Some("group.name"),
                ));
            }

            if group.api_keys.is_empty() {
                warn!("Group '{}' has no API keys configured", group.name);
            }

            for key in &group.api_keys {
                if key.trim().is_empty() {
                    return Err(AppError::config_validation(
                        format!("Empty API key in group '{}'", group.name),
                        Some("group.api_keys"),
                    ));
                }
                if !all_keys.insert(key) {
                    return Err(AppError::config_validation(
                        format!(
                            "Duplicate API key found across groups: {}",
                            Self::preview_key(key)
                        ),
                        Some("group.api_keys"),
                    ));
                }
            }
        }

        Ok(())
    }

    fn validate_pool(config: &AppConfig) -> Result<()> {
        let pool = &config.pool;

        if pool.cooldown_seconds == 0 {
            return Err(AppError::config_validation(
                "cooldown_seconds must be greater than zero",
                Some("pool.cooldown_seconds"),
            ));
        }

        if pool.lock_ttl_secs == 0 {
            return Err(AppError::config_validation(
                "lock_ttl_secs must be greater than zero",
                Some("pool.lock_ttl_secs"),
            ));
        }

        if pool.max_concurrent == 0 {
            return Err(AppError::config_validation(
                "max_concurrent must be greater than zero",
                Some("pool.max_concurrent"),
            ));
        }

        if pool.lease_timeout_secs == 0 {
            return Err(AppError::config_validation(
                "lease_timeout_secs must be greater than zero",
                Some("pool.lease_timeout_secs"),
            ));
        }

        // Overlapping code sets would make transition order load-bearing in a
        // way operators rarely intend.
        let disable: HashSet<u16> = pool.disable_codes.iter().copied().collect();
        if let Some(code) = pool.cooldown_codes.iter().find(|c| disable.contains(*c)) {
            return Err(AppError::config_validation(
                format!("Code {code} appears in both disable_codes and cooldown_codes"),
                Some("pool.cooldown_codes"),
            ));
        }

        Ok(())
    }

    fn validate_redis_config(config: &AppConfig) -> Result<()> {
        if let Some(url) = &config.redis_url {
            if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                return Err(AppError::config_validation(
                    format!("Invalid Redis URL scheme: {url}"),
                    Some("redis_url"),
                ));
            }
        }
        Ok(())
    }

    fn preview_key(key: &str) -> String {
        if key.len() > 8 {
            format!("{}...{}", &key[..4], &key[key.len() - 4..])
        } else {
            key.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyGroup;

    #[test]
    fn default_config_is_valid() {
        assert!(ConfigValidator::validate(&AppConfig::default()).is_ok());
    }

    #[test]
    fn rejects_duplicate_keys_across_groups() {
        let config = AppConfig {
            groups: vec![
                KeyGroup {
                    name: "eastus".into(),
                    api_keys: vec!["secret1".into()],
                    weight: 1,
                },
                KeyGroup {
                    name: "westus".into(),
                    api_keys: vec!["secret1".into()],
                    weight: 1,
                },
            ],
            ..AppConfig::default()
        };
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn rejects_overlapping_code_sets() {
        let mut config = AppConfig::default();
        config.pool.disable_codes = vec![401, 429];
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn rejects_bad_redis_scheme() {
        let config = AppConfig {
            redis_url: Some("http://localhost:6379".into()),
            ..AppConfig::default()
        };
        assert!(ConfigValidator::validate(&config).is_err());
    }
}
