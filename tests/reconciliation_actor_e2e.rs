//! Reconciliation Actor End-to-End Tests
//!
//! Re-entry protection, on-demand passes, circuit breaking and shutdown of
//! the actor that drives both reconciliation loops.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tradeledger::application::actors::{
    ActorConfig, CircuitBreakerConfig, PassKind, PassReport, ReconciliationActor,
    ReconciliationHandle,
};
use tradeledger::domain::entities::order::OrderRequest;
use tradeledger::domain::errors::EngineError;
use tradeledger::domain::repositories::broker_adapter::{
    AccountInfo, BrokerAdapter, BrokerError, BrokerPosition, BrokerResult, OrderAck,
};
use tradeledger::domain::services::accounting::{AccountingEngine, DayTradingPolicy};
use tradeledger::domain::services::order_reconciliation::{OrderReconciler, OrderReconcilerConfig};
use tradeledger::domain::services::position_reconciliation::{
    PositionReconciler, PositionReconcilerConfig,
};
use tradeledger::infrastructure::broker_registry::BrokerRegistry;
use tradeledger::infrastructure::paper_broker::PaperBroker;
use tradeledger::persistence::{init_database, LedgerStore};

/// Broker whose holdings endpoint is always down
struct UnreachableBroker {
    name: String,
    fetches: AtomicU32,
}

impl UnreachableBroker {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fetches: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl BrokerAdapter for UnreachableBroker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> BrokerResult<()> {
        Ok(())
    }

    async fn fetch_account_info(&self) -> BrokerResult<AccountInfo> {
        Err(BrokerError::Transient("gateway timeout".into()))
    }

    async fn place_order(&self, _order: &OrderRequest) -> BrokerResult<OrderAck> {
        Err(BrokerError::Transient("gateway timeout".into()))
    }

    async fn is_order_filled(&self, _broker_order_id: &str) -> BrokerResult<bool> {
        Err(BrokerError::Transient("gateway timeout".into()))
    }

    async fn cancel_order(&self, _broker_order_id: &str) -> BrokerResult<()> {
        Err(BrokerError::Transient("gateway timeout".into()))
    }

    async fn fetch_positions(&self) -> BrokerResult<HashMap<String, BrokerPosition>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Err(BrokerError::Transient("gateway timeout".into()))
    }

    async fn current_price(&self, symbol: &str) -> BrokerResult<f64> {
        Err(BrokerError::UnsupportedSymbol(symbol.to_string()))
    }

    async fn mid_price(&self, symbol: &str) -> BrokerResult<f64> {
        Err(BrokerError::UnsupportedSymbol(symbol.to_string()))
    }
}

async fn spawn_actor(adapters: Vec<Arc<dyn BrokerAdapter>>, config: ActorConfig) -> ReconciliationHandle {
    let store = LedgerStore::new(init_database("sqlite::memory:").await.unwrap());
    let mut registry = BrokerRegistry::new();
    for adapter in adapters {
        registry.register(adapter, Duration::from_secs(5), 6_000);
    }
    let accounting = Arc::new(AccountingEngine::new(
        store.clone(),
        registry.clone(),
        DayTradingPolicy::default(),
    ));
    let orders = Arc::new(OrderReconciler::new(
        accounting,
        OrderReconcilerConfig::default(),
    ));
    let positions = Arc::new(PositionReconciler::new(
        store,
        registry.clone(),
        PositionReconcilerConfig::default(),
    ));
    ReconciliationActor::spawn(registry, orders, positions, config)
}

#[tokio::test]
async fn test_run_now_returns_report() {
    let paper = Arc::new(PaperBroker::new("paper", 10_000.0));
    paper.set_price("AAPL", 100.0);
    paper.set_position("AAPL", 5.0);
    let actor = spawn_actor(vec![paper as Arc<dyn BrokerAdapter>], ActorConfig::default()).await;

    let report = actor.run_now(PassKind::Positions, "paper").await.unwrap();
    let PassReport::Positions(report) = report else {
        panic!("expected a position report");
    };
    assert_eq!(report.inserted, 1);

    let report = actor.run_now(PassKind::Orders, "paper").await.unwrap();
    assert!(matches!(report, PassReport::Orders(r) if r.examined() == 0));

    let status = actor.status().await.unwrap();
    assert_eq!(status.positions.succeeded, 1);
    assert_eq!(status.orders.succeeded, 1);
    assert!(status.last_position_reports.contains_key("paper"));
}

#[tokio::test]
async fn test_unknown_broker_is_rejected() {
    let paper = Arc::new(PaperBroker::new("paper", 10_000.0));
    let actor = spawn_actor(vec![paper as Arc<dyn BrokerAdapter>], ActorConfig::default()).await;
    let err = actor.run_now(PassKind::Orders, "nowhere").await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownBroker(_)));
}

#[tokio::test]
async fn test_tick_skips_broker_with_pass_in_flight() {
    let paper = Arc::new(PaperBroker::new("paper", 10_000.0));
    paper.set_latency(Duration::from_millis(300));
    let actor = spawn_actor(vec![paper.clone() as Arc<dyn BrokerAdapter>], ActorConfig::default()).await;

    actor.tick(PassKind::Positions).await.unwrap();
    actor.tick(PassKind::Positions).await.unwrap();
    let err = actor
        .run_now(PassKind::Positions, "paper")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PassInProgress { .. }));

    let status = actor.status().await.unwrap();
    assert_eq!(status.positions.ticks, 2);
    assert_eq!(status.positions.started, 1);
    assert_eq!(status.positions.skipped_busy, 1);

    // shutdown waits for the running pass
    actor.shutdown().await;
    assert_eq!(paper.call_count("fetch_positions"), 1);
}

#[tokio::test]
async fn test_loops_do_not_block_each_other() {
    let paper = Arc::new(PaperBroker::new("paper", 10_000.0));
    paper.set_latency(Duration::from_millis(200));
    let actor = spawn_actor(vec![paper as Arc<dyn BrokerAdapter>], ActorConfig::default()).await;

    actor.tick(PassKind::Positions).await.unwrap();
    let report = actor.run_now(PassKind::Orders, "paper").await.unwrap();
    assert!(matches!(report, PassReport::Orders(_)));
}

#[tokio::test]
async fn test_circuit_opens_after_repeated_failures() {
    let flaky = Arc::new(UnreachableBroker::new("flaky"));
    let config = ActorConfig {
        max_concurrent_brokers: 2,
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            timeout_duration: Duration::from_secs(3600),
        },
    };
    let actor = spawn_actor(vec![flaky.clone() as Arc<dyn BrokerAdapter>], config).await;

    for _ in 0..2 {
        let err = actor
            .run_now(PassKind::Positions, "flaky")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    actor.tick(PassKind::Positions).await.unwrap();
    let status = actor.status().await.unwrap();
    assert_eq!(status.positions.failed, 2);
    assert_eq!(status.positions.skipped_circuit_open, 1);
    assert_eq!(status.open_circuits, vec!["flaky".to_string()]);
    assert_eq!(flaky.fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_shutdown_stops_actor() {
    let paper = Arc::new(PaperBroker::new("paper", 10_000.0));
    let actor = spawn_actor(vec![paper as Arc<dyn BrokerAdapter>], ActorConfig::default()).await;

    actor.shutdown().await;
    assert!(matches!(
        actor.status().await,
        Err(EngineError::ActorStopped)
    ));
    assert!(matches!(
        actor.tick(PassKind::Orders).await,
        Err(EngineError::ActorStopped)
    ));
}
