// ABOUTME: Process-level configuration for the corral binary read from the environment
// ABOUTME: Selects the database URL, cluster gateway backend and log output format

use corral_config::{CORRAL_DATABASE_URL, CORRAL_GATEWAY, CORRAL_LOG_FORMAT};
use std::env;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://corral.db";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid gateway backend: {0} (expected docker or memory)")]
    InvalidGateway(String),
    #[error("Invalid log format: {0} (expected compact or json)")]
    InvalidLogFormat(String),
    #[error("Database URL must not be empty")]
    EmptyDatabaseUrl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayKind {
    Docker,
    Memory,
}

impl FromStr for GatewayKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "docker" => Ok(GatewayKind::Docker),
            "memory" => Ok(GatewayKind::Memory),
            _ => Err(ConfigError::InvalidGateway(s.to_string())),
        }
    }
}

impl GatewayKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayKind::Docker => "docker",
            GatewayKind::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "compact" | "text" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            _ => Err(ConfigError::InvalidLogFormat(s.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub gateway: GatewayKind,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup so tests never touch the process environment
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url =
            lookup(CORRAL_DATABASE_URL).unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
        if database_url.trim().is_empty() {
            return Err(ConfigError::EmptyDatabaseUrl);
        }

        let gateway = match lookup(CORRAL_GATEWAY) {
            Some(raw) => raw.parse()?,
            None => GatewayKind::Docker,
        };

        let log_format = match lookup(CORRAL_LOG_FORMAT) {
            Some(raw) => raw.parse()?,
            None => LogFormat::Compact,
        };

        Ok(Config {
            database_url,
            gateway,
            log_format,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.gateway, GatewayKind::Docker);
        assert_eq!(config.log_format, LogFormat::Compact);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            (CORRAL_DATABASE_URL, "sqlite:///tmp/corral-test.db"),
            (CORRAL_GATEWAY, "Memory"),
            (CORRAL_LOG_FORMAT, "json"),
        ]))
        .unwrap();
        assert_eq!(config.database_url, "sqlite:///tmp/corral-test.db");
        assert_eq!(config.gateway, GatewayKind::Memory);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[rstest]
    #[case(CORRAL_GATEWAY, "kubernetes")]
    #[case(CORRAL_LOG_FORMAT, "xml")]
    #[case(CORRAL_DATABASE_URL, "  ")]
    fn test_invalid_values(#[case] key: &str, #[case] value: &str) {
        assert!(Config::from_lookup(lookup(&[(key, value)])).is_err());
    }
}
