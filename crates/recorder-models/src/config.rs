use std::env;

use thiserror::Error;

use crate::domain::EntityIdPolicy;

#[derive(Clone, Debug)]
pub struct RecorderConfig {
    pub db_url: Option<String>,
    pub entity_id_policy: EntityIdPolicy,
    pub ensure_schema: bool,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            db_url: None,
            entity_id_policy: EntityIdPolicy::LegacyBypass,
            ensure_schema: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid RECORDER_ENTITY_ID_POLICY: {0}")]
    InvalidEntityIdPolicy(String),
    #[error("invalid RECORDER_ENSURE_SCHEMA: {0}")]
    InvalidEnsureSchema(String),
}

impl RecorderConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let db_url = lookup("DB_URL")
            .or_else(|| lookup("DATABASE_URL"))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let entity_id_policy = match lookup("RECORDER_ENTITY_ID_POLICY") {
            Some(raw) => parse_entity_id_policy(&raw)?,
            None => defaults.entity_id_policy,
        };
        let ensure_schema = match lookup("RECORDER_ENSURE_SCHEMA") {
            Some(raw) => parse_bool(&raw).map_err(ConfigError::InvalidEnsureSchema)?,
            None => defaults.ensure_schema,
        };

        Ok(Self {
            db_url,
            entity_id_policy,
            ensure_schema,
        })
    }
}

fn parse_entity_id_policy(raw: &str) -> Result<EntityIdPolicy, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "legacy_bypass" | "legacy" => Ok(EntityIdPolicy::LegacyBypass),
        "strict" => Ok(EntityIdPolicy::Strict),
        other => Err(ConfigError::InvalidEntityIdPolicy(other.to_string())),
    }
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(other.to_string()),
    }
}
