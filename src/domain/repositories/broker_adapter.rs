//! Broker Adapter Trait
//!
//! This module defines the `BrokerAdapter` trait, the single interface the
//! ledger uses to talk to a brokerage. Concrete adapters hide the REST or
//! websocket details, authentication and symbol formats of their broker.
//!
//! Every operation may fail with a transient error (network, timeout) or a
//! permanent rejection; adapters must report which one so a rejected order is
//! never retried forever.

use crate::domain::entities::order::OrderRequest;
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

/// Common result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    /// Network failure or broker-side hiccup; retryable
    #[error("Transient broker error: {0}")]
    Transient(String),

    /// Explicit refusal by the broker; not retryable
    #[error("Rejected by broker: {0}")]
    Rejected(String),

    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    #[error("Adapter is not connected")]
    NotConnected,

    #[error("Unsupported symbol: {0}")]
    UnsupportedSymbol(String),
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Transient(_) | BrokerError::Timeout { .. } | BrokerError::NotConnected
        )
    }
}

/// Broker-reported account summary
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccountInfo {
    pub buying_power: f64,
    pub cash: f64,
    pub total_value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    /// Order is working at the broker
    Accepted,
    /// Order executed on submission
    Filled,
}

/// Broker acknowledgement of a submitted order
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub broker_order_id: String,
    pub executed_price: Option<f64>,
    pub status: AckStatus,
}

/// One holding as reported by the broker
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrokerPosition {
    pub quantity: f64,
    pub cost_basis: Option<f64>,
}

/// Broker adapter trait providing the capability set every brokerage exposes
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Get the configured name of this broker
    fn name(&self) -> &str;

    /// Establish the session (authentication, token refresh)
    async fn connect(&self) -> BrokerResult<()>;

    async fn fetch_account_info(&self) -> BrokerResult<AccountInfo>;

    /// Submit an order
    ///
    /// # Arguments
    /// * `order` - The validated order request
    ///
    /// # Returns
    /// The broker-assigned order id and, for immediate executions, the fill price
    async fn place_order(&self, order: &OrderRequest) -> BrokerResult<OrderAck>;

    /// Check whether an order has been completely filled
    ///
    /// # Arguments
    /// * `broker_order_id` - The broker-assigned order id
    async fn is_order_filled(&self, broker_order_id: &str) -> BrokerResult<bool>;

    /// Price the order actually filled at, when the broker exposes it
    async fn fill_price(&self, _broker_order_id: &str) -> BrokerResult<Option<f64>> {
        Ok(None)
    }

    /// Cancel a working order. `Ok` means the broker confirmed the cancellation.
    async fn cancel_order(&self, broker_order_id: &str) -> BrokerResult<()>;

    /// Get all holdings keyed by symbol
    async fn fetch_positions(&self) -> BrokerResult<HashMap<String, BrokerPosition>>;

    async fn current_price(&self, symbol: &str) -> BrokerResult<f64>;

    async fn mid_price(&self, symbol: &str) -> BrokerResult<f64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(BrokerError::Transient("503".into()).is_transient());
        assert!(BrokerError::NotConnected.is_transient());
        assert!(BrokerError::Timeout {
            operation: "place_order".into(),
            after_ms: 5
        }
        .is_transient());
        assert!(!BrokerError::Rejected("bad symbol".into()).is_transient());
        assert!(!BrokerError::UnsupportedSymbol("XYZ".into()).is_transient());
    }

    #[test]
    fn test_timeout_message() {
        let err = BrokerError::Timeout {
            operation: "cancel_order".into(),
            after_ms: 250,
        };
        assert_eq!(err.to_string(), "cancel_order timed out after 250ms");
    }
}
