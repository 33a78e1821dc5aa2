use crate::domain::entities::balance::UNCATEGORIZED;
use crate::domain::entities::broker::BrokerKind;
use crate::domain::entities::order::ExecutionStyle;
use crate::domain::services::order_reconciliation::OrderReconcilerConfig;
use crate::domain::services::position_reconciliation::PositionReconcilerConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// One configured brokerage account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerSettings {
    pub name: String,
    pub kind: BrokerKind,
    /// Applies the day-trading rule to every strategy on this broker
    #[serde(default)]
    pub prevent_day_trading: bool,
    /// Opening cash of a paper account
    #[serde(default = "default_paper_cash")]
    pub paper_cash: f64,
}

fn default_paper_cash() -> f64 {
    100_000.0
}

/// One strategy trading on one broker account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySettings {
    pub name: String,
    pub broker: String,
    pub starting_capital: f64,
    #[serde(default)]
    pub prevent_day_trading: bool,
    #[serde(default)]
    pub execution_style: ExecutionStyle,
}

/// Engine configuration: loop periods, thresholds, and the broker/strategy layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub order_reconciliation_interval_seconds: u64,
    pub position_reconciliation_interval_seconds: u64,
    pub stale_threshold_seconds: u64,
    pub pegged_cancel_seconds: u64,
    pub pegged_max_reprices: u32,
    pub adapter_timeout_milliseconds: u64,
    pub broker_requests_per_minute: u32,
    pub max_concurrent_brokers: usize,
    pub volatility_lookback_days: u32,
    pub circuit_failure_threshold: u32,
    pub circuit_cooldown_seconds: u64,
    pub brokers: Vec<BrokerSettings>,
    pub strategies: Vec<StrategySettings>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            order_reconciliation_interval_seconds: 60,
            position_reconciliation_interval_seconds: 300,
            stale_threshold_seconds: 2 * 24 * 60 * 60,
            pegged_cancel_seconds: 15,
            pegged_max_reprices: 20,
            adapter_timeout_milliseconds: 10_000,
            broker_requests_per_minute: 120,
            max_concurrent_brokers: 4,
            volatility_lookback_days: 365,
            circuit_failure_threshold: 5,
            circuit_cooldown_seconds: 300,
            brokers: vec![BrokerSettings {
                name: "paper".to_string(),
                kind: BrokerKind::Paper,
                prevent_day_trading: false,
                paper_cash: default_paper_cash(),
            }],
            strategies: Vec::new(),
        }
    }
}

/// Override `target` from env var `name` when it parses and passes `valid`
fn env_override<T>(name: &str, target: &mut T, valid: impl Fn(&T) -> bool, expected: &str)
where
    T: FromStr + Display,
    T::Err: Display,
{
    let Ok(raw) = std::env::var(name) else {
        return;
    };
    match raw.parse::<T>() {
        Ok(value) if valid(&value) => *target = value,
        Ok(value) => {
            tracing::warn!(
                "Invalid {} value: {} ({}), using default: {}",
                name,
                value,
                expected,
                target
            );
        }
        Err(e) => {
            tracing::warn!(
                "Failed to parse {} '{}': {}, using default: {}",
                name,
                raw,
                e,
                target
            );
        }
    }
}

impl EngineConfig {
    /// Read a JSON config file; missing fields keep their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }

    /// Load configuration: the `TRADELEDGER_CONFIG` file if set, then environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("TRADELEDGER_CONFIG") {
            Ok(path) => {
                tracing::info!("Loading engine configuration from {}", path);
                Self::from_file(path)?
            }
            Err(_) => EngineConfig::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env(&mut self) {
        env_override(
            "ORDER_RECONCILIATION_INTERVAL_SECONDS",
            &mut self.order_reconciliation_interval_seconds,
            |v| (1..=3600).contains(v),
            "must be between 1 and 3600",
        );
        env_override(
            "POSITION_RECONCILIATION_INTERVAL_SECONDS",
            &mut self.position_reconciliation_interval_seconds,
            |v| (10..=86_400).contains(v),
            "must be between 10 and 86400",
        );
        env_override(
            "STALE_THRESHOLD_SECONDS",
            &mut self.stale_threshold_seconds,
            |v| *v >= 60,
            "must be at least 60",
        );
        env_override(
            "PEGGED_CANCEL_SECONDS",
            &mut self.pegged_cancel_seconds,
            |v| (1..=3600).contains(v),
            "must be between 1 and 3600",
        );
        env_override(
            "PEGGED_MAX_REPRICES",
            &mut self.pegged_max_reprices,
            |v| *v <= 1000,
            "must be at most 1000",
        );
        env_override(
            "ADAPTER_TIMEOUT_MILLISECONDS",
            &mut self.adapter_timeout_milliseconds,
            |v| (100..=120_000).contains(v),
            "must be between 100 and 120000",
        );
        env_override(
            "BROKER_REQUESTS_PER_MINUTE",
            &mut self.broker_requests_per_minute,
            |v| *v > 0,
            "must be positive",
        );
        env_override(
            "MAX_CONCURRENT_BROKERS",
            &mut self.max_concurrent_brokers,
            |v| (1..=64).contains(v),
            "must be between 1 and 64",
        );
        env_override(
            "VOLATILITY_LOOKBACK_DAYS",
            &mut self.volatility_lookback_days,
            |v| (5..=3650).contains(v),
            "must be between 5 and 3650",
        );
        env_override(
            "CIRCUIT_FAILURE_THRESHOLD",
            &mut self.circuit_failure_threshold,
            |v| *v > 0,
            "must be positive",
        );
        env_override(
            "CIRCUIT_COOLDOWN_SECONDS",
            &mut self.circuit_cooldown_seconds,
            |v| *v > 0,
            "must be positive",
        );
    }

    /// Check cross-field consistency of brokers and strategies
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.order_reconciliation_interval_seconds == 0
            || self.position_reconciliation_interval_seconds == 0
        {
            return Err(ConfigError::Invalid(
                "reconciliation intervals must be positive".to_string(),
            ));
        }
        if self.max_concurrent_brokers == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_brokers must be positive".to_string(),
            ));
        }

        let mut brokers = HashSet::new();
        for broker in &self.brokers {
            if broker.name.trim().is_empty() {
                return Err(ConfigError::Invalid("broker name must not be empty".into()));
            }
            if !brokers.insert(broker.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate broker name: {}",
                    broker.name
                )));
            }
        }

        let mut strategies = HashSet::new();
        for strategy in &self.strategies {
            if strategy.name.trim().is_empty() || strategy.name == UNCATEGORIZED {
                return Err(ConfigError::Invalid(format!(
                    "invalid strategy name: '{}'",
                    strategy.name
                )));
            }
            if !brokers.contains(strategy.broker.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "strategy {} references unknown broker {}",
                    strategy.name, strategy.broker
                )));
            }
            if !strategy.starting_capital.is_finite() || strategy.starting_capital < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "strategy {} has invalid starting capital {}",
                    strategy.name, strategy.starting_capital
                )));
            }
            if !strategies.insert((strategy.broker.as_str(), strategy.name.as_str())) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate strategy {} on broker {}",
                    strategy.name, strategy.broker
                )));
            }
        }
        Ok(())
    }

    /// (broker, strategy) pairs the day-trading rule applies to
    pub fn day_trading_restricted(&self) -> HashSet<(String, String)> {
        self.strategies
            .iter()
            .filter(|s| {
                s.prevent_day_trading
                    || self
                        .brokers
                        .iter()
                        .any(|b| b.name == s.broker && b.prevent_day_trading)
            })
            .map(|s| (s.broker.clone(), s.name.clone()))
            .collect()
    }

    pub fn order_interval(&self) -> Duration {
        Duration::from_secs(self.order_reconciliation_interval_seconds)
    }

    pub fn position_interval(&self) -> Duration {
        Duration::from_secs(self.position_reconciliation_interval_seconds)
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_millis(self.adapter_timeout_milliseconds)
    }

    pub fn circuit_cooldown(&self) -> Duration {
        Duration::from_secs(self.circuit_cooldown_seconds)
    }

    pub fn order_reconciler_config(&self) -> OrderReconcilerConfig {
        OrderReconcilerConfig {
            stale_threshold: chrono_seconds(self.stale_threshold_seconds),
            pegged_cancel_after: chrono_seconds(self.pegged_cancel_seconds),
            max_reprices: self.pegged_max_reprices,
        }
    }

    pub fn position_reconciler_config(&self) -> PositionReconcilerConfig {
        PositionReconcilerConfig {
            volatility_lookback_days: self.volatility_lookback_days,
        }
    }
}

fn chrono_seconds(seconds: u64) -> chrono::Duration {
    let capped = i64::try_from(seconds).unwrap_or(i64::MAX).min(i64::MAX / 1000);
    chrono::Duration::seconds(capped)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy(name: &str, broker: &str) -> StrategySettings {
        StrategySettings {
            name: name.to_string(),
            broker: broker.to_string(),
            starting_capital: 10_000.0,
            prevent_day_trading: false,
            execution_style: ExecutionStyle::Plain,
        }
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.order_reconciliation_interval_seconds, 60);
        assert_eq!(config.position_reconciliation_interval_seconds, 300);
        assert_eq!(config.stale_threshold_seconds, 172_800);
        assert_eq!(config.pegged_cancel_seconds, 15);
        assert_eq!(config.pegged_max_reprices, 20);
        assert_eq!(config.brokers.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_json() {
        let config: EngineConfig = serde_json::from_str(
            r#"{
                "pegged_cancel_seconds": 30,
                "brokers": [{"name": "main", "kind": "paper", "prevent_day_trading": true}],
                "strategies": [
                    {"name": "momentum", "broker": "main", "starting_capital": 5000.0,
                     "execution_style": "pegged"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.pegged_cancel_seconds, 30);
        assert_eq!(config.order_reconciliation_interval_seconds, 60);
        assert_eq!(config.brokers[0].paper_cash, 100_000.0);
        assert_eq!(config.strategies[0].execution_style, ExecutionStyle::Pegged);
        assert!(config.validate().is_ok());
        assert!(config
            .day_trading_restricted()
            .contains(&("main".to_string(), "momentum".to_string())));
    }

    #[test]
    fn test_strategy_on_unknown_broker_is_invalid() {
        let mut config = EngineConfig::default();
        config.strategies.push(strategy("momentum", "nowhere"));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_uncategorized_strategy_name_is_reserved() {
        let mut config = EngineConfig::default();
        config.strategies.push(strategy(UNCATEGORIZED, "paper"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_strategy_is_invalid() {
        let mut config = EngineConfig::default();
        config.strategies.push(strategy("momentum", "paper"));
        config.strategies.push(strategy("momentum", "paper"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reconciler_configs() {
        let config = EngineConfig::default();
        let orders = config.order_reconciler_config();
        assert_eq!(orders.stale_threshold, chrono::Duration::days(2));
        assert_eq!(orders.pegged_cancel_after, chrono::Duration::seconds(15));
        assert_eq!(config.position_reconciler_config().volatility_lookback_days, 365);
    }
}
