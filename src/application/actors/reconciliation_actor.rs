//! Reconciliation Actor
//!
//! This actor owns the two reconciliation loops. Each tick fans out one pass
//! per broker onto a bounded worker pool; a broker whose previous pass of the
//! same kind is still running is skipped for that tick, and a broker whose
//! circuit is open is skipped until its cooldown elapses.

use crate::application::actors::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::config::EngineConfig;
use crate::domain::errors::EngineError;
use crate::domain::services::order_reconciliation::{OrderPassReport, OrderReconciler};
use crate::domain::services::position_reconciliation::{PositionPassReport, PositionReconciler};
use crate::infrastructure::broker_registry::BrokerRegistry;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// Channel capacity for reconciliation actor messages
const RECONCILIATION_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassKind {
    Orders,
    Positions,
}

impl fmt::Display for PassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PassKind::Orders => write!(f, "order"),
            PassKind::Positions => write!(f, "position"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PassReport {
    Orders(OrderPassReport),
    Positions(PositionPassReport),
}

/// Messages that can be sent to the reconciliation actor
#[derive(Debug)]
pub enum ReconciliationMessage {
    /// Start a pass of `kind` on every broker that is idle
    Tick(PassKind),

    /// Run one pass on one broker and reply with its report
    RunNow {
        kind: PassKind,
        broker: String,
        reply: oneshot::Sender<Result<PassReport, EngineError>>,
    },

    GetStatus {
        reply: oneshot::Sender<ActorStatus>,
    },

    /// Stop accepting work; the reply fires once running passes have finished
    Shutdown {
        reply: Option<oneshot::Sender<()>>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActorConfig {
    pub max_concurrent_brokers: usize,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl ActorConfig {
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            max_concurrent_brokers: config.max_concurrent_brokers,
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: config.circuit_failure_threshold,
                success_threshold: 1,
                timeout_duration: config.circuit_cooldown(),
            },
        }
    }
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self::from_engine(&EngineConfig::default())
    }
}

/// Counters for one loop
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopStats {
    pub ticks: u64,
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped_busy: u64,
    pub skipped_circuit_open: u64,
    pub last_pass_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActorStatus {
    pub orders: LoopStats,
    pub positions: LoopStats,
    pub last_order_reports: BTreeMap<String, OrderPassReport>,
    pub last_position_reports: BTreeMap<String, PositionPassReport>,
    /// Brokers currently skipped by their circuit breaker
    pub open_circuits: Vec<String>,
}

type InFlightSet = Arc<Mutex<HashSet<(PassKind, String)>>>;

/// Marks a (kind, broker) pass as running until dropped
struct InFlightClaim {
    set: InFlightSet,
    key: (PassKind, String),
}

impl InFlightClaim {
    fn try_claim(set: &InFlightSet, kind: PassKind, broker: &str) -> Option<Self> {
        let key = (kind, broker.to_string());
        let inserted = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());
        inserted.then(|| InFlightClaim {
            set: set.clone(),
            key,
        })
    }
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

struct WorkerOutcome {
    kind: PassKind,
    broker: String,
    result: Result<PassReport, EngineError>,
    reply: Option<oneshot::Sender<Result<PassReport, EngineError>>>,
}

/// Reconciliation Actor
pub struct ReconciliationActor {
    brokers: BrokerRegistry,
    orders: Arc<OrderReconciler>,
    positions: Arc<PositionReconciler>,
    config: ActorConfig,
    permits: Arc<Semaphore>,
    in_flight: InFlightSet,
    workers: JoinSet<WorkerOutcome>,
    breakers: HashMap<String, CircuitBreaker>,
    status: ActorStatus,
}

impl ReconciliationActor {
    pub fn new(
        brokers: BrokerRegistry,
        orders: Arc<OrderReconciler>,
        positions: Arc<PositionReconciler>,
        config: ActorConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_brokers.max(1)));
        Self {
            brokers,
            orders,
            positions,
            config,
            permits,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            workers: JoinSet::new(),
            breakers: HashMap::new(),
            status: ActorStatus::default(),
        }
    }

    /// Spawn a new reconciliation actor
    pub fn spawn(
        brokers: BrokerRegistry,
        orders: Arc<OrderReconciler>,
        positions: Arc<PositionReconciler>,
        config: ActorConfig,
    ) -> ReconciliationHandle {
        let (tx, rx) = mpsc::channel(RECONCILIATION_CHANNEL_CAPACITY);
        let actor = Self::new(brokers, orders, positions, config);

        tokio::spawn(async move {
            actor.run(rx).await;
        });

        info!("ReconciliationActor spawned");
        ReconciliationHandle { sender: tx }
    }

    /// Main actor loop
    async fn run(mut self, mut rx: mpsc::Receiver<ReconciliationMessage>) {
        info!("ReconciliationActor started");
        let mut shutdown_reply = None;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    if let ReconciliationMessage::Shutdown { reply } = msg {
                        info!("ReconciliationActor received shutdown signal");
                        shutdown_reply = reply;
                        break;
                    }
                    self.handle(msg);
                }
                Some(joined) = self.workers.join_next(), if !self.workers.is_empty() => {
                    self.finish(joined);
                }
            }
        }

        rx.close();
        while let Some(joined) = self.workers.join_next().await {
            self.finish(joined);
        }
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
        info!("ReconciliationActor stopped");
    }

    fn handle(&mut self, msg: ReconciliationMessage) {
        match msg {
            ReconciliationMessage::Tick(kind) => self.tick(kind),
            ReconciliationMessage::RunNow {
                kind,
                broker,
                reply,
            } => {
                debug!("ReconciliationActor received RunNow {} for {}", kind, broker);
                if !self.brokers.contains(&broker) {
                    let _ = reply.send(Err(EngineError::UnknownBroker(broker)));
                    return;
                }
                match InFlightClaim::try_claim(&self.in_flight, kind, &broker) {
                    Some(claim) => self.start(kind, broker, claim, Some(reply)),
                    None => {
                        let _ = reply.send(Err(EngineError::PassInProgress { broker }));
                    }
                }
            }
            ReconciliationMessage::GetStatus { reply } => {
                let mut status = self.status.clone();
                status.open_circuits = self
                    .breakers
                    .iter()
                    .filter(|(_, b)| b.is_open())
                    .map(|(name, _)| name.clone())
                    .collect();
                status.open_circuits.sort();
                if reply.send(status).is_err() {
                    error!("Failed to send GetStatus reply");
                }
            }
            ReconciliationMessage::Shutdown { .. } => {}
        }
    }

    fn tick(&mut self, kind: PassKind) {
        self.stats_mut(kind).ticks += 1;

        for broker in self.brokers.names() {
            let Some(claim) = InFlightClaim::try_claim(&self.in_flight, kind, &broker) else {
                debug!("Skipping {} pass on {}: previous pass still running", kind, broker);
                self.stats_mut(kind).skipped_busy += 1;
                continue;
            };

            let breaker_config = self.config.circuit_breaker.clone();
            let breaker = self
                .breakers
                .entry(broker.clone())
                .or_insert_with(|| CircuitBreaker::new(&broker, breaker_config));
            if !breaker.should_attempt() {
                debug!("Skipping {} pass on {}: circuit open", kind, broker);
                self.stats_mut(kind).skipped_circuit_open += 1;
                continue;
            }

            self.start(kind, broker, claim, None);
        }
    }

    fn start(
        &mut self,
        kind: PassKind,
        broker: String,
        claim: InFlightClaim,
        reply: Option<oneshot::Sender<Result<PassReport, EngineError>>>,
    ) {
        self.stats_mut(kind).started += 1;
        let permits = self.permits.clone();
        let orders = self.orders.clone();
        let positions = self.positions.clone();

        self.workers.spawn(async move {
            let _claim = claim;
            let result = match permits.acquire_owned().await {
                Ok(_permit) => match kind {
                    PassKind::Orders => orders.run_pass(&broker).await.map(PassReport::Orders),
                    PassKind::Positions => {
                        positions.run_pass(&broker).await.map(PassReport::Positions)
                    }
                },
                Err(_) => Err(EngineError::ActorStopped),
            };
            WorkerOutcome {
                kind,
                broker,
                result,
                reply,
            }
        });
    }

    fn finish(&mut self, joined: Result<WorkerOutcome, JoinError>) {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Reconciliation worker aborted: {}", e);
                return;
            }
        };
        let WorkerOutcome {
            kind,
            broker,
            result,
            reply,
        } = outcome;

        let breaker_config = self.config.circuit_breaker.clone();
        let breaker = self
            .breakers
            .entry(broker.clone())
            .or_insert_with(|| CircuitBreaker::new(&broker, breaker_config));

        match &result {
            Ok(report) => {
                breaker.record_success();
                self.stats_mut(kind).succeeded += 1;
                match report {
                    PassReport::Orders(r) => {
                        self.status.last_order_reports.insert(broker.clone(), r.clone());
                    }
                    PassReport::Positions(r) => {
                        self.status
                            .last_position_reports
                            .insert(broker.clone(), r.clone());
                    }
                }
            }
            Err(e) => {
                breaker.record_failure();
                self.stats_mut(kind).failed += 1;
                warn!("{} pass failed for {}: {}", kind, broker, e);
            }
        }
        self.stats_mut(kind).last_pass_at = Some(Utc::now());

        if let Some(reply) = reply {
            if reply.send(result).is_err() {
                debug!("RunNow caller for {} went away", broker);
            }
        }
    }

    fn stats_mut(&mut self, kind: PassKind) -> &mut LoopStats {
        match kind {
            PassKind::Orders => &mut self.status.orders,
            PassKind::Positions => &mut self.status.positions,
        }
    }
}

/// Cloneable handle used to drive the actor
#[derive(Debug, Clone)]
pub struct ReconciliationHandle {
    sender: mpsc::Sender<ReconciliationMessage>,
}

impl ReconciliationHandle {
    pub async fn tick(&self, kind: PassKind) -> Result<(), EngineError> {
        self.sender
            .send(ReconciliationMessage::Tick(kind))
            .await
            .map_err(|_| EngineError::ActorStopped)
    }

    /// Run one pass now and wait for its report
    pub async fn run_now(&self, kind: PassKind, broker: &str) -> Result<PassReport, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(ReconciliationMessage::RunNow {
                kind,
                broker: broker.to_string(),
                reply,
            })
            .await
            .map_err(|_| EngineError::ActorStopped)?;
        rx.await.map_err(|_| EngineError::ActorStopped)?
    }

    pub async fn status(&self) -> Result<ActorStatus, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(ReconciliationMessage::GetStatus { reply })
            .await
            .map_err(|_| EngineError::ActorStopped)?;
        rx.await.map_err(|_| EngineError::ActorStopped)
    }

    /// Stop the actor and wait for running passes to finish
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .sender
            .send(ReconciliationMessage::Shutdown { reply: Some(reply) })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_released_on_drop() {
        let set: InFlightSet = Arc::new(Mutex::new(HashSet::new()));
        let claim = InFlightClaim::try_claim(&set, PassKind::Orders, "paper");
        assert!(claim.is_some());
        assert!(InFlightClaim::try_claim(&set, PassKind::Orders, "paper").is_none());
        // the other loop is independent
        assert!(InFlightClaim::try_claim(&set, PassKind::Positions, "paper").is_some());

        drop(claim);
        assert!(InFlightClaim::try_claim(&set, PassKind::Orders, "paper").is_some());
    }

    #[test]
    fn test_actor_config_from_engine() {
        let mut engine = EngineConfig::default();
        engine.max_concurrent_brokers = 2;
        engine.circuit_failure_threshold = 3;
        let config = ActorConfig::from_engine(&engine);
        assert_eq!(config.max_concurrent_brokers, 2);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
    }
}
