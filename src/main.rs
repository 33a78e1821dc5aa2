use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tradeledger::application::actors::{
    ActorConfig, PassKind, ReconciliationActor, ReconciliationHandle,
};
use tradeledger::config::EngineConfig;
use tradeledger::domain::services::accounting::{AccountingEngine, DayTradingPolicy};
use tradeledger::domain::services::order_reconciliation::OrderReconciler;
use tradeledger::domain::services::position_reconciliation::PositionReconciler;
use tradeledger::infrastructure::broker_registry::BrokerRegistry;
use tradeledger::persistence::{init_database_with, DatabaseConfig, LedgerStore};
use tradeledger::task_runner::{run_periodic, PeriodicConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Failed to read .env: {}", e);
        }
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradeledger=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Trade ledger starting...");

    let config = EngineConfig::load()?;
    let database = DatabaseConfig::from_env();
    let store = LedgerStore::new(init_database_with(&database).await?);

    let mut brokers = BrokerRegistry::from_settings(&config);
    let connected = brokers.connect_all().await;
    if connected.is_empty() {
        warn!("No broker connected; reconciliation loops will idle");
    } else {
        info!("Connected brokers: {}", connected.join(", "));
    }

    let accounting = Arc::new(AccountingEngine::new(
        store.clone(),
        brokers.clone(),
        DayTradingPolicy::new(config.day_trading_restricted()),
    ));

    for strategy in &config.strategies {
        if !brokers.contains(&strategy.broker) {
            warn!(
                "Strategy {} skipped: broker {} is not connected",
                strategy.name, strategy.broker
            );
            continue;
        }
        match accounting
            .initialize_strategy(&strategy.broker, &strategy.name, strategy.starting_capital)
            .await
        {
            Ok(true) => info!("✓ Strategy {} seeded on {}", strategy.name, strategy.broker),
            Ok(false) => {}
            Err(e) => error!(
                "✗ Strategy {} could not be initialized on {}: {}",
                strategy.name, strategy.broker, e
            ),
        }
    }

    let orders = Arc::new(OrderReconciler::new(
        accounting.clone(),
        config.order_reconciler_config(),
    ));
    let positions = Arc::new(PositionReconciler::new(
        store,
        brokers.clone(),
        config.position_reconciler_config(),
    ));
    let actor = ReconciliationActor::spawn(
        brokers,
        orders,
        positions,
        ActorConfig::from_engine(&config),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let order_loop = spawn_ticker(
        "order_reconciliation",
        PassKind::Orders,
        PeriodicConfig::every(config.order_interval()),
        actor.clone(),
        shutdown_rx.clone(),
    );
    let position_loop = spawn_ticker(
        "position_reconciliation",
        PassKind::Positions,
        PeriodicConfig::every(config.position_interval()),
        actor.clone(),
        shutdown_rx,
    );

    let shutdown_signal = async {
        let ctrl_c = async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C signal"),
                Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                    info!("Received SIGTERM signal");
                }
                Err(e) => error!("Failed to install SIGTERM handler: {}", e),
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    };

    info!("Trade ledger running. Press Ctrl+C to stop.");
    shutdown_signal.await;

    info!("Shutting down gracefully...");
    let _ = shutdown_tx.send(true);
    for handle in [order_loop, position_loop] {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{}", e),
            Err(e) => error!("Reconciliation ticker aborted: {}", e),
        }
    }
    actor.shutdown().await;

    info!("Trade ledger stopped");
    Ok(())
}

fn spawn_ticker(
    name: &'static str,
    kind: PassKind,
    config: PeriodicConfig,
    actor: ReconciliationHandle,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<Result<(), tradeledger::task_runner::TaskError>> {
    tokio::spawn(async move {
        run_periodic(name, config, shutdown, || {
            let actor = actor.clone();
            async move { actor.tick(kind).await.map_err(|e| e.to_string()) }
        })
        .await
    })
}
