//! Broker Registry
//!
//! Maps configured broker names to adapter instances. Adapters are created
//! once, wrapped with the per-call timeout and rate limiter, and shared by
//! the accounting engine and both reconciliation loops.

use crate::config::{BrokerSettings, EngineConfig};
use crate::domain::entities::broker::BrokerKind;
use crate::domain::errors::EngineError;
use crate::domain::repositories::broker_adapter::BrokerAdapter;
use crate::infrastructure::guarded_broker::GuardedBroker;
use crate::infrastructure::paper_broker::PaperBroker;
use crate::rate_limit::{create_rate_limiter, RateLimiterConfig};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Clone, Default)]
pub struct BrokerRegistry {
    brokers: BTreeMap<String, Arc<dyn BrokerAdapter>>,
}

impl BrokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an adapter for every configured broker that has an implementation
    pub fn from_settings(config: &EngineConfig) -> Self {
        let mut registry = Self::new();
        for settings in &config.brokers {
            if let Some(adapter) = Self::create(settings) {
                registry.register(
                    adapter,
                    config.adapter_timeout(),
                    config.broker_requests_per_minute,
                );
            }
        }

        info!("BrokerRegistry created {} broker adapters", registry.len());
        registry
    }

    /// Create the raw adapter for one configured broker
    ///
    /// # Returns
    /// `None` when no adapter exists for the broker kind
    pub fn create(settings: &BrokerSettings) -> Option<Arc<dyn BrokerAdapter>> {
        match settings.kind {
            BrokerKind::Paper => {
                info!(
                    "✓ Paper broker {} created with {:.2} cash",
                    settings.name, settings.paper_cash
                );
                Some(Arc::new(PaperBroker::new(&settings.name, settings.paper_cash))
                    as Arc<dyn BrokerAdapter>)
            }
            BrokerKind::Tradier | BrokerKind::Tastytrade | BrokerKind::Alpaca | BrokerKind::Kraken => {
                warn!(
                    "{} adapter not yet implemented, broker {} not created",
                    settings.kind.name(),
                    settings.name
                );
                None
            }
        }
    }

    /// Add an adapter behind the timeout and rate-limit guard
    pub fn register(
        &mut self,
        adapter: Arc<dyn BrokerAdapter>,
        call_timeout: Duration,
        requests_per_minute: u32,
    ) {
        let limiter = create_rate_limiter(RateLimiterConfig {
            requests_per_minute,
        });
        let name = adapter.name().to_string();
        let guarded = GuardedBroker::new(adapter, call_timeout, limiter);
        if self.brokers.insert(name.clone(), Arc::new(guarded)).is_some() {
            warn!("Broker {} registered twice, keeping the latest adapter", name);
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn BrokerAdapter>, EngineError> {
        self.brokers
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownBroker(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.brokers.contains_key(name)
    }

    /// Registered broker names in sorted order
    pub fn names(&self) -> Vec<String> {
        self.brokers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.brokers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.brokers.is_empty()
    }

    /// Connect every adapter; brokers that fail to connect are dropped.
    ///
    /// # Returns
    /// Names of the brokers that connected
    pub async fn connect_all(&mut self) -> Vec<String> {
        let mut failed = Vec::new();
        for (name, adapter) in &self.brokers {
            match adapter.connect().await {
                Ok(()) => info!("✓ Connected to broker {}", name),
                Err(e) => {
                    error!("✗ Failed to connect to broker {}: {}", name, e);
                    failed.push(name.clone());
                }
            }
        }
        for name in failed {
            self.brokers.remove(&name);
        }
        self.names()
    }
}
