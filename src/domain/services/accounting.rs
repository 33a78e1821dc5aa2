//! Accounting Engine
//!
//! Strategy-facing entry point of the ledger. Enforces the per-strategy
//! day-trading and inventory rules before any broker contact, submits orders
//! through the broker registry, and records each trade together with its
//! position and balance effects in one unit of work.

use crate::domain::entities::balance::{BalanceType, StrategyBalance, UNCATEGORIZED};
use crate::domain::entities::order::{OrderRequest, OrderSide, OrderType};
use crate::domain::entities::position::{Position, QUANTITY_EPSILON};
use crate::domain::entities::trade::Trade;
use crate::domain::errors::EngineError;
use crate::domain::repositories::broker_adapter::{AckStatus, BrokerAdapter, OrderAck};
use crate::infrastructure::broker_registry::BrokerRegistry;
use crate::persistence::models::NewTrade;
use crate::persistence::{LedgerStore, LedgerTx};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::RwLock;
use tracing::{debug, error, info, warn};

/// (broker, strategy) pairs barred from buying a symbol twice on one day
#[derive(Debug, Default)]
pub struct DayTradingPolicy {
    restricted: RwLock<HashSet<(String, String)>>,
}

impl DayTradingPolicy {
    pub fn new(restricted: HashSet<(String, String)>) -> Self {
        Self {
            restricted: RwLock::new(restricted),
        }
    }

    pub fn applies(&self, broker: &str, strategy: &str) -> bool {
        self.restricted
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(&(broker.to_string(), strategy.to_string()))
    }

    pub fn restrict(&self, broker: &str, strategy: &str) {
        self.restricted
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert((broker.to_string(), strategy.to_string()));
    }

    fn rename(&self, broker: &str, old: &str, new: &str) {
        let mut restricted = self
            .restricted
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if restricted.remove(&(broker.to_string(), old.to_string())) {
            restricted.insert((broker.to_string(), new.to_string()));
        }
    }
}

/// An order acknowledged by the broker but not yet written to the ledger
#[derive(Debug, Clone)]
pub struct PendingSubmission {
    pub broker: String,
    pub strategy: String,
    pub request: OrderRequest,
    pub requested_price: f64,
    pub ack: OrderAck,
    pub replaces_trade_id: Option<i64>,
    pub reprice_count: u32,
    pub submitted_at: DateTime<Utc>,
}

pub struct AccountingEngine {
    store: LedgerStore,
    brokers: BrokerRegistry,
    day_trading: DayTradingPolicy,
}

impl AccountingEngine {
    pub fn new(store: LedgerStore, brokers: BrokerRegistry, day_trading: DayTradingPolicy) -> Self {
        Self {
            store,
            brokers,
            day_trading,
        }
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    pub fn brokers(&self) -> &BrokerRegistry {
        &self.brokers
    }

    pub fn day_trading(&self) -> &DayTradingPolicy {
        &self.day_trading
    }

    /// Place an order for a strategy
    ///
    /// # Arguments
    /// * `broker` - Configured broker name
    /// * `strategy` - Strategy the order and its fills are attributed to
    /// * `order` - Symbol, quantity, side and optional limit price
    ///
    /// # Returns
    /// The ledger trade, `open` or already `filled`
    ///
    /// # Errors
    /// `PolicyViolation` and `InsufficientPosition` are raised before the
    /// broker is contacted. Broker failures keep their transient/permanent
    /// kind and leave no trade row behind.
    pub async fn place_order(
        &self,
        broker: &str,
        strategy: &str,
        order: OrderRequest,
    ) -> Result<Trade, EngineError> {
        self.place_order_at(broker, strategy, order, Utc::now()).await
    }

    pub async fn place_order_at(
        &self,
        broker: &str,
        strategy: &str,
        order: OrderRequest,
        now: DateTime<Utc>,
    ) -> Result<Trade, EngineError> {
        order.validate().map_err(EngineError::InvalidOrder)?;
        if strategy == UNCATEGORIZED || strategy.trim().is_empty() {
            return Err(EngineError::PolicyViolation {
                strategy: strategy.to_string(),
                reason: "orders must be placed by a named strategy".to_string(),
            });
        }
        let adapter = self.brokers.get(broker)?;

        match order.side {
            OrderSide::Buy => self.check_day_trading(broker, strategy, &order.symbol, now).await?,
            OrderSide::Sell => self.check_inventory(broker, strategy, &order).await?,
        }

        let requested_price = match (order.order_type, order.price) {
            (OrderType::Limit, Some(price)) => price,
            _ => adapter.current_price(&order.symbol).await.map_err(|e| {
                warn!("No quote for {} on {}: {}", order.symbol, broker, e);
                EngineError::from(e)
            })?,
        };

        let pending = self
            .send(&*adapter, broker, strategy, order, requested_price, None, 0, now)
            .await?;

        let trade = match self.write_submission(&pending).await {
            Ok(trade) => trade,
            Err(e) => {
                error!(
                    "Broker {} accepted order {} but the ledger write failed: {}",
                    broker, pending.ack.broker_order_id, e
                );
                return Err(e);
            }
        };

        info!(
            "Placed {} {} {} @ {} for {}/{} (trade {}, {})",
            trade.side, trade.quantity, trade.symbol, requested_price, broker, strategy, trade.id,
            trade.status
        );
        Ok(trade)
    }

    async fn write_submission(&self, pending: &PendingSubmission) -> Result<Trade, EngineError> {
        let mut tx = self.store.begin().await?;
        let trade = self.record_submission(&mut tx, pending).await?;
        tx.commit().await?;
        Ok(trade)
    }

    async fn check_day_trading(
        &self,
        broker: &str,
        strategy: &str,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        if !self.day_trading.applies(broker, strategy) {
            return Ok(());
        }
        let today = now.date_naive();
        let bought_today = self
            .store
            .live_buys(broker, strategy, symbol)
            .await?
            .iter()
            .any(|t| t.timestamp.date_naive() == today);

        if bought_today {
            warn!(
                "Day-trading rule blocks second buy of {} for {}/{}",
                symbol, broker, strategy
            );
            return Err(EngineError::PolicyViolation {
                strategy: strategy.to_string(),
                reason: format!("{} was already bought today", symbol),
            });
        }
        Ok(())
    }

    async fn check_inventory(
        &self,
        broker: &str,
        strategy: &str,
        order: &OrderRequest,
    ) -> Result<(), EngineError> {
        let held = self
            .store
            .position(broker, strategy, &order.symbol)
            .await?
            .map_or(0.0, |p| p.quantity);

        if held + QUANTITY_EPSILON < order.quantity {
            return Err(EngineError::InsufficientPosition {
                strategy: strategy.to_string(),
                symbol: order.symbol.clone(),
                held,
                requested: order.quantity,
            });
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn send(
        &self,
        adapter: &dyn BrokerAdapter,
        broker: &str,
        strategy: &str,
        request: OrderRequest,
        requested_price: f64,
        replaces_trade_id: Option<i64>,
        reprice_count: u32,
        now: DateTime<Utc>,
    ) -> Result<PendingSubmission, EngineError> {
        let ack = adapter.place_order(&request).await.map_err(|e| {
            warn!(
                "Broker {} refused {} {} {} for {}: {}",
                broker, request.side, request.quantity, request.symbol, strategy, e
            );
            EngineError::from(e)
        })?;

        Ok(PendingSubmission {
            broker: broker.to_string(),
            strategy: strategy.to_string(),
            request,
            requested_price,
            ack,
            replaces_trade_id,
            reprice_count,
            submitted_at: now,
        })
    }

    /// Submit the next order of a pegged chain at `mid`, skipping the
    /// day-trading rule. Nothing is written to the ledger.
    pub(crate) async fn submit_replacement(
        &self,
        adapter: &dyn BrokerAdapter,
        original: &Trade,
        mid: f64,
        now: DateTime<Utc>,
    ) -> Result<PendingSubmission, EngineError> {
        let request =
            OrderRequest::limit(&original.symbol, original.quantity, original.side, mid).pegged();
        request.validate().map_err(EngineError::InvalidOrder)?;

        self.send(
            adapter,
            &original.broker,
            &original.strategy,
            request,
            mid,
            Some(original.id),
            original.reprice_count + 1,
            now,
        )
        .await
    }

    /// Write an acknowledged order as a trade; immediate executions are
    /// filled in the same unit of work.
    pub(crate) async fn record_submission(
        &self,
        tx: &mut LedgerTx,
        pending: &PendingSubmission,
    ) -> Result<Trade, EngineError> {
        let trade = tx
            .insert_trade(&NewTrade {
                symbol: pending.request.symbol.clone(),
                quantity: pending.request.quantity,
                side: pending.request.side,
                requested_price: pending.requested_price,
                order_type: pending.request.order_type,
                execution_style: pending.request.execution_style,
                broker: pending.broker.clone(),
                broker_order_id: Some(pending.ack.broker_order_id.clone()),
                strategy: pending.strategy.clone(),
                timestamp: pending.submitted_at,
                replaces_trade_id: pending.replaces_trade_id,
                reprice_count: pending.reprice_count,
            })
            .await?;

        if pending.ack.status != AckStatus::Filled {
            return Ok(trade);
        }

        let price = pending.ack.executed_price.unwrap_or(pending.requested_price);
        let id = trade.id;
        match self.record_fill(tx, trade, price, pending.submitted_at).await? {
            Some(filled) => Ok(filled),
            None => Err(EngineError::Ledger(
                crate::persistence::DatabaseError::QueryError(format!(
                    "trade {} was resolved while being inserted",
                    id
                )),
            )),
        }
    }

    /// Resolve an open trade as filled at `price` and apply its effects:
    /// position quantity and price, then fresh cash/positions/total rows.
    ///
    /// Returns `None` when the trade was no longer open. A sell that would
    /// leave the position negative still fills the trade, but the position is
    /// left as is and the drift is logged.
    pub(crate) async fn record_fill(
        &self,
        tx: &mut LedgerTx,
        mut trade: Trade,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<Option<Trade>, EngineError> {
        trade.fill(price)?;
        if !tx.fill_trade(&trade).await? {
            debug!("Trade {} already resolved, fill not applied", trade.id);
            return Ok(None);
        }

        let mut position = tx
            .position(&trade.broker, &trade.strategy, &trade.symbol)
            .await?
            .unwrap_or_else(|| Position::new(&trade.broker, &trade.strategy, &trade.symbol, now));

        match position.apply_fill(trade.signed_quantity(), price, now) {
            Ok(()) => {
                tx.upsert_position(&position).await?;
            }
            Err(drift) => {
                error!("Trade {} filled without position update: {}", trade.id, drift);
            }
        }

        let previous_cash = tx
            .latest_balance(&trade.broker, &trade.strategy, BalanceType::Cash)
            .await?
            .map_or(0.0, |b| b.amount);
        let cash = previous_cash - trade.signed_quantity() * price;
        let positions_value = strategy_positions_value(tx, &trade.broker, &trade.strategy).await?;
        append_strategy_balances(
            tx,
            &trade.broker,
            &trade.strategy,
            StrategyBalance::new(cash, positions_value),
            now,
        )
        .await?;

        info!(
            "Trade {} filled: {} {} {} @ {} (pnl {:.2})",
            trade.id,
            trade.side,
            trade.quantity,
            trade.symbol,
            price,
            trade.profit_loss.unwrap_or(0.0)
        );
        Ok(Some(trade))
    }

    /// Realized profit/loss of a filled trade
    pub fn calculate_profit_loss(&self, trade: &Trade) -> Result<f64, EngineError> {
        trade.calculate_profit_loss().map_err(|e| {
            error!("Cannot compute profit/loss: {}", e);
            e
        })
    }

    /// Seed a strategy's cash with `starting_capital` out of the account's
    /// unallocated cash. Returns false when the strategy already has balances.
    pub async fn initialize_strategy(
        &self,
        broker: &str,
        strategy: &str,
        starting_capital: f64,
    ) -> Result<bool, EngineError> {
        if strategy == UNCATEGORIZED || strategy.trim().is_empty() {
            return Err(EngineError::PolicyViolation {
                strategy: strategy.to_string(),
                reason: "reserved or empty strategy name".to_string(),
            });
        }
        if self
            .store
            .latest_balance(broker, strategy, BalanceType::Cash)
            .await?
            .is_some()
        {
            debug!("Strategy {}/{} already initialized", broker, strategy);
            return Ok(false);
        }

        let adapter = self.brokers.get(broker)?;
        let account = adapter.fetch_account_info().await?;

        let mut allocated = 0.0;
        for other in self.store.strategies(broker).await? {
            if let Some(cash) = self
                .store
                .latest_balance(broker, &other, BalanceType::Cash)
                .await?
            {
                allocated += cash.amount.max(0.0);
            }
        }
        let available = account.cash - allocated;
        if available + QUANTITY_EPSILON < starting_capital {
            return Err(EngineError::PolicyViolation {
                strategy: strategy.to_string(),
                reason: format!(
                    "starting capital {:.2} exceeds unallocated cash {:.2}",
                    starting_capital, available
                ),
            });
        }

        let mut tx = self.store.begin().await?;
        append_strategy_balances(
            &mut tx,
            broker,
            strategy,
            StrategyBalance::new(starting_capital, 0.0),
            Utc::now(),
        )
        .await?;
        tx.commit().await?;

        info!(
            "Initialized strategy {}/{} with {:.2}",
            broker, strategy, starting_capital
        );
        Ok(true)
    }

    /// Move every trade, position and balance of `old` to `new` on one broker
    pub async fn rename_strategy(
        &self,
        broker: &str,
        old: &str,
        new: &str,
    ) -> Result<u64, EngineError> {
        let reserved = |name: &str| name == UNCATEGORIZED || name.trim().is_empty();
        if reserved(old) || reserved(new) {
            return Err(EngineError::PolicyViolation {
                strategy: old.to_string(),
                reason: format!("cannot rename {} to {}", old, new),
            });
        }
        let existing = self.store.strategies(broker).await?;
        if existing.iter().any(|s| s == new) {
            return Err(EngineError::PolicyViolation {
                strategy: old.to_string(),
                reason: format!("strategy {} already exists on {}", new, broker),
            });
        }

        let mut tx = self.store.begin().await?;
        let touched = tx.rename_strategy(broker, old, new).await?;
        tx.commit().await?;
        self.day_trading.rename(broker, old, new);

        info!(
            "Renamed strategy {} to {} on {} ({} rows)",
            old, new, broker, touched
        );
        Ok(touched)
    }

    /// Current positions of a strategy
    pub async fn positions_for(
        &self,
        broker: &str,
        strategy: &str,
    ) -> Result<Vec<Position>, EngineError> {
        Ok(self.store.positions_for(broker, strategy).await?)
    }

    /// Most recent cash and positions balances of a strategy
    pub async fn latest_balances(
        &self,
        broker: &str,
        strategy: &str,
    ) -> Result<Option<StrategyBalance>, EngineError> {
        let Some(cash) = self
            .store
            .latest_balance(broker, strategy, BalanceType::Cash)
            .await?
        else {
            return Ok(None);
        };
        let positions = self
            .store
            .latest_balance(broker, strategy, BalanceType::Positions)
            .await?
            .map_or(0.0, |b| b.amount);
        Ok(Some(StrategyBalance::new(cash.amount, positions)))
    }
}

/// Σ quantity × latest price over a strategy's positions, read inside `tx`
pub(crate) async fn strategy_positions_value(
    tx: &mut LedgerTx,
    broker: &str,
    strategy: &str,
) -> Result<f64, EngineError> {
    Ok(tx
        .positions_for_broker(broker)
        .await?
        .iter()
        .filter(|p| p.strategy == strategy)
        .map(Position::market_value)
        .sum())
}

/// Append `cash`, `positions` and `total` rows sharing one timestamp
pub(crate) async fn append_strategy_balances(
    tx: &mut LedgerTx,
    broker: &str,
    strategy: &str,
    balance: StrategyBalance,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    tx.insert_balance(broker, strategy, BalanceType::Cash, balance.cash, now)
        .await?;
    tx.insert_balance(broker, strategy, BalanceType::Positions, balance.positions, now)
        .await?;
    tx.insert_balance(broker, strategy, BalanceType::Total, balance.total(), now)
        .await?;
    Ok(())
}
