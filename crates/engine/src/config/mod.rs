//! Ambient runtime configuration (§9): which store backend to run against,
//! pool sizing, and the poller/backpressure knobs, loaded from environment
//! variables with a `.env` file as an optional local override.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::delay::DelayPollerConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {var}: {reason}")]
    InvalidVar { var: &'static str, reason: String },
}

/// Which `ExecutionStore` implementation to construct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Postgres,
}

/// Top-level engine configuration, assembled once at process start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub store: StoreBackend,
    /// Required when `store` is `postgres`.
    pub database_url: Option<String>,
    #[serde(with = "humantime_secs")]
    pub database_connect_timeout: Duration,
    pub database_max_connections: u32,
    pub delay_poller: DelayPollerConfig,
    pub project_id: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store: StoreBackend::Memory,
            database_url: None,
            database_connect_timeout: Duration::from_secs(5),
            database_max_connections: 10,
            delay_poller: DelayPollerConfig::default(),
            project_id: "default".to_string(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from environment variables, first merging in a
    /// `.env` file from the current directory if one is present.
    ///
    /// Recognized variables: `WORKFLOW_STORE` (`memory` | `postgres`,
    /// default `memory`), `DATABASE_URL` (required for `postgres`),
    /// `DATABASE_MAX_CONNECTIONS`, `WORKFLOW_PROJECT_ID`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let mut config = Self::default();

        if let Ok(store) = std::env::var("WORKFLOW_STORE") {
            config.store = match store.as_str() {
                "memory" => StoreBackend::Memory,
                "postgres" => StoreBackend::Postgres,
                other => {
                    return Err(ConfigError::InvalidVar {
                        var: "WORKFLOW_STORE",
                        reason: format!("unknown backend '{other}'"),
                    })
                }
            };
        }

        config.database_url = std::env::var("DATABASE_URL").ok();
        if config.store == StoreBackend::Postgres && config.database_url.is_none() {
            return Err(ConfigError::MissingVar("DATABASE_URL"));
        }

        if let Ok(max_conn) = std::env::var("DATABASE_MAX_CONNECTIONS") {
            config.database_max_connections =
                max_conn.parse().map_err(|_| ConfigError::InvalidVar {
                    var: "DATABASE_MAX_CONNECTIONS",
                    reason: "must be a positive integer".to_string(),
                })?;
        }

        if let Ok(project_id) = std::env::var("WORKFLOW_PROJECT_ID") {
            config.project_id = project_id;
        }

        Ok(config)
    }
}

mod humantime_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_in_memory_store() {
        let config = EngineConfig::default();
        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.project_id, "default");
    }
}
