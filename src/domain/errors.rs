use thiserror::Error;

use crate::domain::entities::trade::TradeStatus;
use crate::domain::repositories::broker_adapter::BrokerError;
use crate::persistence::DatabaseError;

/// Errors raised by the accounting engine and the reconciliation loops
#[derive(Debug, Error)]
pub enum EngineError {
    /// Day-trading or other strategy rule breach, raised before broker contact
    #[error("Policy violation for strategy {strategy}: {reason}")]
    PolicyViolation { strategy: String, reason: String },

    #[error("Insufficient position in {symbol} for {strategy}: held {held}, requested {requested}")]
    InsufficientPosition {
        strategy: String,
        symbol: String,
        held: f64,
        requested: f64,
    },

    /// Network failure or timeout; safe to retry on a later pass
    #[error("Transient broker failure: {0}")]
    AdapterTransient(String),

    /// Broker explicitly refused; never retried
    #[error("Broker rejected request: {0}")]
    AdapterPermanent(String),

    #[error("Trade {trade_id} has no execution price")]
    MissingExecutionPrice { trade_id: i64 },

    #[error("Consistency drift on {broker}/{symbol}: {detail}")]
    ConsistencyDrift {
        broker: String,
        symbol: String,
        detail: String,
    },

    #[error("Trade {trade_id} cannot move from {from} to {to}")]
    InvalidTransition {
        trade_id: i64,
        from: TradeStatus,
        to: TradeStatus,
    },

    #[error("Unknown broker: {0}")]
    UnknownBroker(String),

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("A reconciliation pass is already running for {broker}")]
    PassInProgress { broker: String },

    #[error("Reconciliation actor is not running")]
    ActorStopped,

    #[error("Ledger error: {0}")]
    Ledger(#[from] DatabaseError),
}

impl EngineError {
    /// Whether the failed operation may succeed if attempted again later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::AdapterTransient(_) | EngineError::PassInProgress { .. }
        )
    }
}

impl From<BrokerError> for EngineError {
    fn from(err: BrokerError) -> Self {
        if err.is_transient() {
            EngineError::AdapterTransient(err.to_string())
        } else {
            EngineError::AdapterPermanent(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_errors_keep_their_kind() {
        let transient: EngineError = BrokerError::Transient("connection reset".into()).into();
        assert!(matches!(transient, EngineError::AdapterTransient(_)));
        assert!(transient.is_retryable());

        let timeout: EngineError = BrokerError::Timeout {
            operation: "is_order_filled".into(),
            after_ms: 10_000,
        }
        .into();
        assert!(matches!(timeout, EngineError::AdapterTransient(_)));

        let rejected: EngineError = BrokerError::Rejected("insufficient buying power".into()).into();
        assert!(matches!(rejected, EngineError::AdapterPermanent(_)));
        assert!(!rejected.is_retryable());
    }

    #[test]
    fn test_missing_execution_price_is_not_retryable() {
        let err = EngineError::MissingExecutionPrice { trade_id: 7 };
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Trade 7 has no execution price");
    }
}
