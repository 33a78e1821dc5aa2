//! Order Reconciliation
//!
//! Walks every `open` trade of one broker and resolves it against the broker:
//! expired and unacknowledged orders become `stale`, filled orders are booked
//! through the accounting engine, and pegged orders that sat too long are
//! cancelled and resubmitted at the current mid price.
//!
//! A failure on one trade leaves it `open` for the next pass and the walk
//! moves on. Only loading the open trades can fail the whole pass.

use crate::domain::entities::trade::{Trade, TradeStatus};
use crate::domain::errors::EngineError;
use crate::domain::repositories::broker_adapter::BrokerAdapter;
use crate::domain::services::accounting::AccountingEngine;
use crate::infrastructure::broker_registry::BrokerRegistry;
use crate::persistence::LedgerStore;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct OrderReconcilerConfig {
    /// Open trades older than this are marked stale
    pub stale_threshold: Duration,
    /// Pegged orders older than this are cancelled and repriced
    pub pegged_cancel_after: Duration,
    /// Length of a repricing chain before it is cancelled without replacement
    pub max_reprices: u32,
}

impl Default for OrderReconcilerConfig {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::days(2),
            pegged_cancel_after: Duration::seconds(15),
            max_reprices: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    Expired,
    Unacknowledged,
    Rejected,
}

/// What a pass did with one open trade
#[derive(Debug, Clone, PartialEq)]
pub enum TradeOutcome {
    Stale(StaleReason),
    Filled { price: f64 },
    Repriced { replacement_id: i64, mid: f64 },
    RepriceLimitReached,
    RepriceFailed { error: String },
    StillOpen,
    /// Broker call failed transiently, retried next pass
    Deferred { error: String },
    /// Trade was resolved elsewhere while the pass ran
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderPassReport {
    pub broker: String,
    pub at: DateTime<Utc>,
    pub outcomes: Vec<(i64, TradeOutcome)>,
}

impl OrderPassReport {
    fn count(&self, matches: impl Fn(&TradeOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| matches(o)).count()
    }

    pub fn examined(&self) -> usize {
        self.outcomes.len()
    }

    pub fn filled(&self) -> usize {
        self.count(|o| matches!(o, TradeOutcome::Filled { .. }))
    }

    pub fn stale(&self) -> usize {
        self.count(|o| matches!(o, TradeOutcome::Stale(_)))
    }

    pub fn repriced(&self) -> usize {
        self.count(|o| matches!(o, TradeOutcome::Repriced { .. }))
    }

    pub fn cancelled(&self) -> usize {
        self.count(|o| {
            matches!(
                o,
                TradeOutcome::RepriceLimitReached | TradeOutcome::RepriceFailed { .. }
            )
        })
    }

    pub fn deferred(&self) -> usize {
        self.count(|o| matches!(o, TradeOutcome::Deferred { .. }))
    }

    pub fn outcome(&self, trade_id: i64) -> Option<&TradeOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| *id == trade_id)
            .map(|(_, o)| o)
    }
}

pub struct OrderReconciler {
    store: LedgerStore,
    brokers: BrokerRegistry,
    accounting: Arc<AccountingEngine>,
    config: OrderReconcilerConfig,
}

impl OrderReconciler {
    pub fn new(accounting: Arc<AccountingEngine>, config: OrderReconcilerConfig) -> Self {
        Self {
            store: accounting.store().clone(),
            brokers: accounting.brokers().clone(),
            accounting,
            config,
        }
    }

    pub fn config(&self) -> &OrderReconcilerConfig {
        &self.config
    }

    pub async fn run_pass(&self, broker: &str) -> Result<OrderPassReport, EngineError> {
        self.run_pass_at(broker, Utc::now()).await
    }

    /// Reconcile every open trade of `broker` as of `now`
    pub async fn run_pass_at(
        &self,
        broker: &str,
        now: DateTime<Utc>,
    ) -> Result<OrderPassReport, EngineError> {
        let adapter = self.brokers.get(broker)?;
        let open = self.store.open_trades(broker).await?;
        debug!("Order pass on {}: {} open trades", broker, open.len());

        let mut outcomes = Vec::with_capacity(open.len());
        for trade in open {
            let id = trade.id;
            let outcome = match self.reconcile_trade(&*adapter, trade, now).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Trade {} on {} left open after ledger error: {}", id, broker, e);
                    TradeOutcome::Deferred {
                        error: e.to_string(),
                    }
                }
            };
            outcomes.push((id, outcome));
        }

        let report = OrderPassReport {
            broker: broker.to_string(),
            at: now,
            outcomes,
        };
        if report.examined() > 0 {
            info!(
                "Order pass on {}: {} examined, {} filled, {} stale, {} repriced, {} cancelled, {} deferred",
                broker,
                report.examined(),
                report.filled(),
                report.stale(),
                report.repriced(),
                report.cancelled(),
                report.deferred()
            );
        }
        Ok(report)
    }

    async fn reconcile_trade(
        &self,
        adapter: &dyn BrokerAdapter,
        trade: Trade,
        now: DateTime<Utc>,
    ) -> Result<TradeOutcome, EngineError> {
        if trade.age(now) > self.config.stale_threshold {
            return self.mark_stale(&trade, StaleReason::Expired).await;
        }

        let Some(broker_order_id) = trade.broker_order_id.clone() else {
            return self.mark_stale(&trade, StaleReason::Unacknowledged).await;
        };

        match adapter.is_order_filled(&broker_order_id).await {
            Ok(true) => return self.book_fill(adapter, trade, &broker_order_id, now).await,
            Ok(false) => {}
            Err(e) if e.is_transient() => {
                warn!("Fill check for trade {} deferred: {}", trade.id, e);
                return Ok(TradeOutcome::Deferred {
                    error: e.to_string(),
                });
            }
            Err(e) => {
                warn!(
                    "Broker {} rejected order {} of trade {}: {}",
                    trade.broker, broker_order_id, trade.id, e
                );
                return self.mark_stale(&trade, StaleReason::Rejected).await;
            }
        }

        if trade.is_pegged() && trade.age(now) > self.config.pegged_cancel_after {
            return self.reprice(adapter, trade, &broker_order_id, now).await;
        }

        Ok(TradeOutcome::StillOpen)
    }

    async fn mark_stale(
        &self,
        trade: &Trade,
        reason: StaleReason,
    ) -> Result<TradeOutcome, EngineError> {
        let mut tx = self.store.begin().await?;
        let closed = tx.close_trade(trade.id, TradeStatus::Stale).await?;
        tx.commit().await?;

        if !closed {
            return Ok(TradeOutcome::Skipped);
        }
        info!(
            "Trade {} ({} {} {}) marked stale: {:?}",
            trade.id, trade.side, trade.quantity, trade.symbol, reason
        );
        Ok(TradeOutcome::Stale(reason))
    }

    async fn book_fill(
        &self,
        adapter: &dyn BrokerAdapter,
        trade: Trade,
        broker_order_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TradeOutcome, EngineError> {
        let price = match adapter.fill_price(broker_order_id).await {
            Ok(Some(price)) => price,
            Ok(None) => trade.requested_price,
            Err(e) => {
                warn!("Fill price for trade {} deferred: {}", trade.id, e);
                return Ok(TradeOutcome::Deferred {
                    error: e.to_string(),
                });
            }
        };

        let mut tx = self.store.begin().await?;
        let filled = self.accounting.record_fill(&mut tx, trade, price, now).await?;
        tx.commit().await?;

        Ok(match filled {
            Some(_) => TradeOutcome::Filled { price },
            None => TradeOutcome::Skipped,
        })
    }

    async fn reprice(
        &self,
        adapter: &dyn BrokerAdapter,
        trade: Trade,
        broker_order_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TradeOutcome, EngineError> {
        let mid = match adapter.mid_price(&trade.symbol).await {
            Ok(mid) => round_cents(mid),
            Err(e) => {
                warn!("No mid price for {}, trade {} left open: {}", trade.symbol, trade.id, e);
                return Ok(TradeOutcome::Deferred {
                    error: e.to_string(),
                });
            }
        };

        // An unconfirmed cancel leaves the order working at the broker.
        if let Err(e) = adapter.cancel_order(broker_order_id).await {
            warn!(
                "Cancel of order {} (trade {}) not confirmed: {}",
                broker_order_id, trade.id, e
            );
            return Ok(TradeOutcome::Deferred {
                error: e.to_string(),
            });
        }

        if trade.reprice_count >= self.config.max_reprices {
            warn!(
                "Pegged trade {} reached {} reprices, cancelled without replacement",
                trade.id, trade.reprice_count
            );
            return self
                .mark_cancelled(&trade, TradeOutcome::RepriceLimitReached)
                .await;
        }

        let pending = match self
            .accounting
            .submit_replacement(adapter, &trade, mid, now)
            .await
        {
            Ok(pending) => pending,
            Err(e) => {
                error!("Replacement for pegged trade {} failed: {}", trade.id, e);
                return self
                    .mark_cancelled(
                        &trade,
                        TradeOutcome::RepriceFailed {
                            error: e.to_string(),
                        },
                    )
                    .await;
            }
        };

        let mut tx = self.store.begin().await?;
        if !tx.close_trade(trade.id, TradeStatus::Cancelled).await? {
            tx.rollback().await?;
            let replacement_order = &pending.ack.broker_order_id;
            warn!(
                "Trade {} resolved while being repriced, withdrawing order {}",
                trade.id, replacement_order
            );
            if let Err(e) = adapter.cancel_order(replacement_order).await {
                error!(
                    "Replacement order {} for trade {} is unrecorded and could not be cancelled: {}",
                    replacement_order, trade.id, e
                );
            }
            return Ok(TradeOutcome::Skipped);
        }
        let replacement = self.accounting.record_submission(&mut tx, &pending).await?;
        tx.commit().await?;

        info!(
            "Pegged trade {} repriced at {} as trade {} (reprice {})",
            trade.id, mid, replacement.id, replacement.reprice_count
        );
        Ok(TradeOutcome::Repriced {
            replacement_id: replacement.id,
            mid,
        })
    }

    async fn mark_cancelled(
        &self,
        trade: &Trade,
        outcome: TradeOutcome,
    ) -> Result<TradeOutcome, EngineError> {
        let mut tx = self.store.begin().await?;
        let closed = tx.close_trade(trade.id, TradeStatus::Cancelled).await?;
        tx.commit().await?;
        Ok(if closed { outcome } else { TradeOutcome::Skipped })
    }
}

fn round_cents(price: f64) -> f64 {
    (price * 100.0).round() / 100.0
}
