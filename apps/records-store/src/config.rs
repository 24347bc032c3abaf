use std::env;

use thiserror::Error;

use crate::records::compare::MAX_SAMPLE_IDS;
use crate::records::router::MigrationPhase;
use crate::records::types::RecordsLimits;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub db_url: Option<String>,
    pub state_id: String,
    pub migration_phase: MigrationPhase,
    pub dual_read_compare: bool,
    pub compare_sample_limit: usize,
    pub limits: RecordsLimits,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "records".to_string(),
            db_url: None,
            state_id: "records".to_string(),
            migration_phase: MigrationPhase::LegacyOnly,
            dual_read_compare: true,
            compare_sample_limit: MAX_SAMPLE_IDS,
            limits: RecordsLimits::default(),
            log_format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid RECORDS_MIGRATION_PHASE: {0}")]
    InvalidMigrationPhase(String),
    #[error("invalid RECORDS_DUAL_READ_COMPARE: {0}")]
    InvalidDualReadCompare(String),
    #[error("invalid RECORDS_COMPARE_SAMPLE_LIMIT: {0}")]
    InvalidCompareSampleLimit(String),
    #[error("invalid RECORDS_STATE_ID: {0}")]
    InvalidStateId(String),
    #[error("invalid RECORDS_MAX_RECORDS: {0}")]
    InvalidMaxRecords(String),
    #[error("invalid RECORDS_MAX_PATCH_OPERATIONS: {0}")]
    InvalidMaxPatchOperations(String),
    #[error("invalid RECORDS_LOG_FORMAT: {0}")]
    InvalidLogFormat(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let service_name = lookup("RECORDS_SERVICE_NAME")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or(defaults.service_name);
        let db_url = lookup("DB_URL")
            .or_else(|| lookup("DATABASE_URL"))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let state_id = match lookup("RECORDS_STATE_ID") {
            Some(raw) => {
                let trimmed = raw.trim();
                if trimmed.is_empty() || trimmed.len() > 128 {
                    return Err(ConfigError::InvalidStateId(format!(
                        "expected 1..=128 characters, got {:?}",
                        raw
                    )));
                }
                trimmed.to_string()
            }
            None => defaults.state_id,
        };
        let migration_phase = match lookup("RECORDS_MIGRATION_PHASE") {
            Some(raw) => raw
                .parse::<MigrationPhase>()
                .map_err(ConfigError::InvalidMigrationPhase)?,
            None => defaults.migration_phase,
        };
        let dual_read_compare = match lookup("RECORDS_DUAL_READ_COMPARE") {
            Some(raw) => parse_bool(&raw).map_err(ConfigError::InvalidDualReadCompare)?,
            None => defaults.dual_read_compare,
        };
        let compare_sample_limit = match lookup("RECORDS_COMPARE_SAMPLE_LIMIT") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .map_err(|error| ConfigError::InvalidCompareSampleLimit(error.to_string()))?
                .clamp(1, MAX_SAMPLE_IDS),
            None => defaults.compare_sample_limit,
        };
        let max_records = parse_positive(&lookup, "RECORDS_MAX_RECORDS", defaults.limits.max_records)
            .map_err(ConfigError::InvalidMaxRecords)?;
        let max_patch_operations = parse_positive(
            &lookup,
            "RECORDS_MAX_PATCH_OPERATIONS",
            defaults.limits.max_patch_operations,
        )
        .map_err(ConfigError::InvalidMaxPatchOperations)?;
        let log_format = match lookup("RECORDS_LOG_FORMAT") {
            Some(raw) => parse_log_format(&raw)?,
            None => defaults.log_format,
        };

        Ok(Self {
            service_name,
            db_url,
            state_id,
            migration_phase,
            dual_read_compare,
            compare_sample_limit,
            limits: RecordsLimits {
                max_records,
                max_patch_operations,
            },
            log_format,
        })
    }
}

fn parse_positive(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: usize,
) -> Result<usize, String> {
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    match raw.trim().parse::<usize>() {
        Ok(0) => Err("must be greater than zero".to_string()),
        Ok(value) => Ok(value),
        Err(error) => Err(error.to_string()),
    }
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(other.to_string()),
    }
}

fn parse_log_format(raw: &str) -> Result<LogFormat, ConfigError> {
    match raw.trim().to_lowercase().as_str() {
        "text" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        other => Err(ConfigError::InvalidLogFormat(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{Config, ConfigError, LogFormat};
    use crate::records::router::MigrationPhase;

    fn config_from(values: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let values = values.iter().copied().collect::<HashMap<_, _>>();
        Config::from_lookup(|key| values.get(key).map(ToString::to_string))
    }

    #[test]
    fn defaults_apply_without_env() {
        let config = config_from(&[]).expect("default config");
        assert_eq!(config.service_name, "records");
        assert_eq!(config.db_url, None);
        assert_eq!(config.state_id, "records");
        assert_eq!(config.migration_phase, MigrationPhase::LegacyOnly);
        assert!(config.dual_read_compare);
        assert_eq!(config.compare_sample_limit, 20);
        assert_eq!(config.limits.max_records, 5000);
        assert_eq!(config.limits.max_patch_operations, 500);
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn env_overrides_are_parsed() {
        let config = config_from(&[
            ("DATABASE_URL", " postgres://localhost/records "),
            ("RECORDS_MIGRATION_PHASE", "cutover-read"),
            ("RECORDS_DUAL_READ_COMPARE", "off"),
            ("RECORDS_COMPARE_SAMPLE_LIMIT", "500"),
            ("RECORDS_STATE_ID", "crm"),
            ("RECORDS_MAX_RECORDS", "10"),
            ("RECORDS_MAX_PATCH_OPERATIONS", "3"),
            ("RECORDS_LOG_FORMAT", "JSON"),
        ])
        .expect("config");
        assert_eq!(config.db_url.as_deref(), Some("postgres://localhost/records"));
        assert_eq!(config.migration_phase, MigrationPhase::CutoverRead);
        assert!(!config.dual_read_compare);
        assert_eq!(config.compare_sample_limit, 20);
        assert_eq!(config.state_id, "crm");
        assert_eq!(config.limits.max_records, 10);
        assert_eq!(config.limits.max_patch_operations, 3);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn db_url_takes_precedence_over_database_url() {
        let config = config_from(&[("DB_URL", "postgres://a"), ("DATABASE_URL", "postgres://b")])
            .expect("config");
        assert_eq!(config.db_url.as_deref(), Some("postgres://a"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        match config_from(&[("RECORDS_MIGRATION_PHASE", "shadow")]) {
            Err(ConfigError::InvalidMigrationPhase(value)) => assert_eq!(value, "shadow"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(matches!(
            config_from(&[("RECORDS_DUAL_READ_COMPARE", "maybe")]),
            Err(ConfigError::InvalidDualReadCompare(_))
        ));
        assert!(matches!(
            config_from(&[("RECORDS_MAX_RECORDS", "0")]),
            Err(ConfigError::InvalidMaxRecords(_))
        ));
        assert!(matches!(
            config_from(&[("RECORDS_STATE_ID", "  ")]),
            Err(ConfigError::InvalidStateId(_))
        ));
        assert!(matches!(
            config_from(&[("RECORDS_LOG_FORMAT", "xml")]),
            Err(ConfigError::InvalidLogFormat(_))
        ));
    }
}
