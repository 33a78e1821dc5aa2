//! Guarded Broker
//!
//! Wraps any `BrokerAdapter` so that every call first waits for the broker's
//! rate limiter and then runs under a per-call timeout. A timed-out call
//! surfaces as `BrokerError::Timeout`, which is transient: the caller leaves
//! the affected trade or position for the next pass.

use crate::domain::entities::order::OrderRequest;
use crate::domain::repositories::broker_adapter::{
    AccountInfo, BrokerAdapter, BrokerError, BrokerPosition, BrokerResult, OrderAck,
};
use crate::rate_limit::BrokerRateLimiter;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::warn;

pub struct GuardedBroker {
    inner: Arc<dyn BrokerAdapter>,
    call_timeout: Duration,
    limiter: BrokerRateLimiter,
}

impl GuardedBroker {
    pub fn new(
        inner: Arc<dyn BrokerAdapter>,
        call_timeout: Duration,
        limiter: BrokerRateLimiter,
    ) -> Self {
        Self {
            inner,
            call_timeout,
            limiter,
        }
    }

    async fn guarded<T, F>(&self, operation: &'static str, call: F) -> BrokerResult<T>
    where
        F: Future<Output = BrokerResult<T>> + Send,
        T: Send,
    {
        self.limiter.until_ready().await;

        match timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                let after_ms = u64::try_from(self.call_timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(
                    "Broker {} call {} timed out after {}ms",
                    self.inner.name(),
                    operation,
                    after_ms
                );
                Err(BrokerError::Timeout {
                    operation: operation.to_string(),
                    after_ms,
                })
            }
        }
    }
}

#[async_trait]
impl BrokerAdapter for GuardedBroker {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn connect(&self) -> BrokerResult<()> {
        self.guarded("connect", self.inner.connect()).await
    }

    async fn fetch_account_info(&self) -> BrokerResult<AccountInfo> {
        self.guarded("fetch_account_info", self.inner.fetch_account_info())
            .await
    }

    async fn place_order(&self, order: &OrderRequest) -> BrokerResult<OrderAck> {
        self.guarded("place_order", self.inner.place_order(order)).await
    }

    async fn is_order_filled(&self, broker_order_id: &str) -> BrokerResult<bool> {
        self.guarded("is_order_filled", self.inner.is_order_filled(broker_order_id))
            .await
    }

    async fn fill_price(&self, broker_order_id: &str) -> BrokerResult<Option<f64>> {
        self.guarded("fill_price", self.inner.fill_price(broker_order_id))
            .await
    }

    async fn cancel_order(&self, broker_order_id: &str) -> BrokerResult<()> {
        self.guarded("cancel_order", self.inner.cancel_order(broker_order_id))
            .await
    }

    async fn fetch_positions(&self) -> BrokerResult<HashMap<String, BrokerPosition>> {
        self.guarded("fetch_positions", self.inner.fetch_positions())
            .await
    }

    async fn current_price(&self, symbol: &str) -> BrokerResult<f64> {
        self.guarded("current_price", self.inner.current_price(symbol))
            .await
    }

    async fn mid_price(&self, symbol: &str) -> BrokerResult<f64> {
        self.guarded("mid_price", self.inner.mid_price(symbol)).await
    }
}
