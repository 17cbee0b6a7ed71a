//! Transaction manager configuration

use serde::{Deserialize, Serialize};
use service_builder::builder;
use std::time::Duration;

use crate::error::{TxError, TxResult};
use crate::isolation::IsolationLevel;
use crate::options::{Propagation, RunOptions};

pub const PROPAGATION_ENV: &str = "ELIF_TX_PROPAGATION";
pub const ISOLATION_LEVEL_ENV: &str = "ELIF_TX_ISOLATION_LEVEL";
pub const BEGIN_TIMEOUT_ENV: &str = "ELIF_TX_BEGIN_TIMEOUT_MS";
pub const ID_LENGTH_ENV: &str = "ELIF_TX_ID_LENGTH";

const MIN_ID_LENGTH: usize = 4;
const MAX_ID_LENGTH: usize = 64;

/// Configuration for [`TxManager`](crate::TxManager)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[builder]
pub struct TxConfig {
    /// Propagation used by `run` when none is given
    #[builder(default = "Propagation::Required", getter)]
    pub default_propagation: Propagation,

    /// Isolation level requested when a new physical transaction begins
    #[builder(default = "IsolationLevel::RepeatableRead", getter)]
    pub default_isolation_level: IsolationLevel,

    /// Upper bound on waiting for the pool when the context has no deadline
    /// (None = wait forever)
    #[builder(default = "Some(Duration::from_secs(30))", getter)]
    pub begin_timeout: Option<Duration>,

    /// Length of generated transaction ids
    #[builder(default = "10", getter)]
    pub id_length: usize,

    /// Log the source location of every `run` call
    #[builder(default = "true", getter)]
    pub log_callers: bool,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            default_propagation: Propagation::Required,
            default_isolation_level: IsolationLevel::RepeatableRead,
            begin_timeout: Some(Duration::from_secs(30)),
            id_length: 10,
            log_callers: true,
        }
    }
}

impl TxConfig {
    /// Options `run` uses when the caller does not pass any
    pub fn default_options(&self) -> RunOptions {
        RunOptions::new()
            .propagation(self.default_propagation)
            .isolation_level(self.default_isolation_level)
    }

    /// Load configuration from `ELIF_TX_*` environment variables, falling
    /// back to the defaults for anything unset
    pub fn from_env() -> TxResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source
    pub fn from_lookup<F>(lookup: F) -> TxResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(PROPAGATION_ENV) {
            config.default_propagation = value.parse()?;
        }
        if let Some(value) = lookup(ISOLATION_LEVEL_ENV) {
            config.default_isolation_level = value.parse()?;
        }
        if let Some(value) = lookup(BEGIN_TIMEOUT_ENV) {
            let millis: u64 = value.trim().parse().map_err(|_| {
                TxError::Configuration(format!("{} must be a number of milliseconds, got '{}'", BEGIN_TIMEOUT_ENV, value))
            })?;
            config.begin_timeout = (millis > 0).then(|| Duration::from_millis(millis));
        }
        if let Some(value) = lookup(ID_LENGTH_ENV) {
            config.id_length = value.trim().parse().map_err(|_| {
                TxError::Configuration(format!("{} must be a positive integer, got '{}'", ID_LENGTH_ENV, value))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TxResult<()> {
        if !(MIN_ID_LENGTH..=MAX_ID_LENGTH).contains(&self.id_length) {
            return Err(TxError::Configuration(format!(
                "id_length must be between {} and {}, got {}",
                MIN_ID_LENGTH, MAX_ID_LENGTH, self.id_length
            )));
        }
        if self.begin_timeout == Some(Duration::ZERO) {
            return Err(TxError::Configuration(
                "begin_timeout must be positive; use None to disable it".to_string(),
            ));
        }
        Ok(())
    }
}

impl TxConfigBuilder {
    /// Development configuration: generous timeouts, caller logging on
    pub fn development() -> Self {
        TxConfigBuilder::new()
            .begin_timeout(Some(Duration::from_secs(60)))
            .log_callers(true)
    }

    /// Production configuration: bounded waits, quieter logs
    pub fn production() -> Self {
        TxConfigBuilder::new()
            .begin_timeout(Some(Duration::from_secs(10)))
            .id_length(16)
            .log_callers(false)
    }

    /// Testing configuration: short timeouts, short ids
    pub fn testing() -> Self {
        TxConfigBuilder::new()
            .begin_timeout(Some(Duration::from_secs(1)))
            .id_length(6)
            .log_callers(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_tx_config() {
        let config = TxConfig::default();
        assert_eq!(config.default_propagation, Propagation::Required);
        assert_eq!(config.default_isolation_level, IsolationLevel::RepeatableRead);
        assert_eq!(config.begin_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.id_length, 10);
        assert!(config.log_callers);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tx_config_builder() {
        let config = TxConfigBuilder::new()
            .default_propagation(Propagation::RequiresNew)
            .default_isolation_level(IsolationLevel::Serializable)
            .build()
            .expect("Failed to build config");

        assert_eq!(*config.get_default_propagation(), Propagation::RequiresNew);
        assert_eq!(*config.get_default_isolation_level(), IsolationLevel::Serializable);
        assert_eq!(*config.get_id_length(), 10); // Default

        let options = config.default_options();
        assert_eq!(options.propagation, Propagation::RequiresNew);
        assert_eq!(options.isolation_level, IsolationLevel::Serializable);
        assert!(!options.read_only);
    }

    #[test]
    fn test_presets() {
        let config = TxConfigBuilder::production().build().expect("Failed to build config");
        assert_eq!(*config.get_begin_timeout(), Some(Duration::from_secs(10)));
        assert!(!*config.get_log_callers());

        let config = TxConfigBuilder::testing().build().expect("Failed to build config");
        assert_eq!(*config.get_id_length(), 6);
        assert!(config.validate().is_ok());

        let config = TxConfigBuilder::development().build().expect("Failed to build config");
        assert!(*config.get_log_callers());
    }

    #[test]
    fn test_from_lookup() {
        let config = TxConfig::from_lookup(lookup(&[
            (PROPAGATION_ENV, "requires_new"),
            (ISOLATION_LEVEL_ENV, "read committed"),
            (BEGIN_TIMEOUT_ENV, "0"),
            (ID_LENGTH_ENV, "12"),
        ]))
        .unwrap();

        assert_eq!(config.default_propagation, Propagation::RequiresNew);
        assert_eq!(config.default_isolation_level, IsolationLevel::ReadCommitted);
        assert_eq!(config.begin_timeout, None);
        assert_eq!(config.id_length, 12);

        let config = TxConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.begin_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_from_lookup_rejects_bad_values() {
        let err = TxConfig::from_lookup(lookup(&[(PROPAGATION_ENV, "mandatory")])).unwrap_err();
        assert!(matches!(err, TxError::PropagationConfig(_)));

        let err = TxConfig::from_lookup(lookup(&[(BEGIN_TIMEOUT_ENV, "soon")])).unwrap_err();
        assert!(matches!(err, TxError::Configuration(_)));

        let err = TxConfig::from_lookup(lookup(&[(ID_LENGTH_ENV, "2")])).unwrap_err();
        assert!(matches!(err, TxError::Configuration(_)));
    }

    #[test]
    fn test_config_serde() {
        let config = TxConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["default_propagation"], "required");
        assert_eq!(json["default_isolation_level"], "repeatable_read");

        let back: TxConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.id_length, config.id_length);
    }
}
