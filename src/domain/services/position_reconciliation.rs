//! Position & Balance Reconciliation
//!
//! The broker is the source of truth for which symbols are held and how many.
//! A pass diffs the broker's holdings against the ledger positions of one
//! broker, refreshes prices (and underlying price and volatility for
//! derivatives), then appends new cash/positions/total rows per strategy and
//! the uncategorized remainder of the account.
//!
//! Broker and market-data calls happen before the ledger transaction opens;
//! every write of a pass commits together.

use crate::domain::entities::account::AccountSnapshot;
use crate::domain::entities::balance::{
    split_uncategorized, BalanceType, StrategyBalance, UNCATEGORIZED,
};
use crate::domain::entities::position::{Position, QUANTITY_EPSILON};
use crate::domain::errors::EngineError;
use crate::domain::repositories::broker_adapter::{AccountInfo, BrokerAdapter, BrokerPosition};
use crate::domain::repositories::price_history::HistoricalPriceSource;
use crate::domain::services::accounting::{append_strategy_balances, strategy_positions_value};
use crate::domain::services::symbols::underlying_symbol;
use crate::domain::services::volatility::{HistoricalVolatility, VolatilityEstimator};
use crate::infrastructure::broker_registry::BrokerRegistry;
use crate::persistence::LedgerStore;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct PositionReconcilerConfig {
    pub volatility_lookback_days: u32,
}

impl Default for PositionReconcilerConfig {
    fn default() -> Self {
        Self {
            volatility_lookback_days: 365,
        }
    }
}

/// One ledger edit needed to match the broker
#[derive(Debug, Clone, PartialEq)]
pub enum PositionChange {
    Remove { id: i64, symbol: String },
    Update { id: i64, symbol: String, from: f64, to: f64 },
    Touch { id: i64 },
    /// New `uncategorized` holding
    Insert { symbol: String, quantity: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DriftFinding {
    pub symbol: String,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionDiff {
    pub changes: Vec<PositionChange>,
    pub drift: Vec<DriftFinding>,
}

/// Work out the ledger edits that make `ledger` (one broker's positions)
/// agree with the broker-reported holdings.
///
/// When several strategies hold a symbol, the difference is absorbed by the
/// `uncategorized` row. Anything that would need a negative quantity is
/// reported as drift and its rows are left alone.
pub fn diff_positions(
    ledger: &[Position],
    reported: &HashMap<String, BrokerPosition>,
) -> PositionDiff {
    let mut diff = PositionDiff::default();

    let mut by_symbol: BTreeMap<&str, Vec<&Position>> = BTreeMap::new();
    for position in ledger {
        by_symbol.entry(&position.symbol).or_default().push(position);
    }

    for (symbol, rows) in &by_symbol {
        let reported_qty = reported
            .get(*symbol)
            .map(|p| p.quantity)
            .filter(|q| q.abs() > QUANTITY_EPSILON);

        let Some(target) = reported_qty else {
            for row in rows {
                diff.changes.push(PositionChange::Remove {
                    id: row.id,
                    symbol: row.symbol.clone(),
                });
            }
            continue;
        };

        if target < 0.0 {
            diff.drift.push(DriftFinding {
                symbol: symbol.to_string(),
                detail: format!("broker reports negative quantity {}", target),
            });
            continue;
        }

        if let [row] = rows.as_slice() {
            if (row.quantity - target).abs() <= QUANTITY_EPSILON {
                diff.changes.push(PositionChange::Touch { id: row.id });
            } else {
                diff.changes.push(PositionChange::Update {
                    id: row.id,
                    symbol: row.symbol.clone(),
                    from: row.quantity,
                    to: target,
                });
            }
            continue;
        }

        let held: f64 = rows.iter().map(|p| p.quantity).sum();
        let delta = target - held;
        if delta.abs() <= QUANTITY_EPSILON {
            diff.changes
                .extend(rows.iter().map(|p| PositionChange::Touch { id: p.id }));
            continue;
        }

        let uncategorized = rows.iter().find(|p| p.strategy == UNCATEGORIZED);
        let others = rows
            .iter()
            .filter(|p| p.strategy != UNCATEGORIZED)
            .map(|p| PositionChange::Touch { id: p.id });

        match uncategorized {
            Some(row) => {
                let adjusted = row.quantity + delta;
                if adjusted < -QUANTITY_EPSILON {
                    diff.drift.push(DriftFinding {
                        symbol: symbol.to_string(),
                        detail: format!(
                            "broker holds {} but strategies hold {}",
                            target,
                            held - row.quantity
                        ),
                    });
                    continue;
                }
                diff.changes.extend(others);
                diff.changes.push(if adjusted <= QUANTITY_EPSILON {
                    PositionChange::Remove {
                        id: row.id,
                        symbol: row.symbol.clone(),
                    }
                } else {
                    PositionChange::Update {
                        id: row.id,
                        symbol: row.symbol.clone(),
                        from: row.quantity,
                        to: adjusted,
                    }
                });
            }
            None if delta > 0.0 => {
                diff.changes.extend(others);
                diff.changes.push(PositionChange::Insert {
                    symbol: symbol.to_string(),
                    quantity: delta,
                });
            }
            None => {
                diff.drift.push(DriftFinding {
                    symbol: symbol.to_string(),
                    detail: format!("broker holds {} but strategies hold {}", target, held),
                });
            }
        }
    }

    let mut new_symbols: Vec<(&String, &BrokerPosition)> = reported
        .iter()
        .filter(|(symbol, _)| !by_symbol.contains_key(symbol.as_str()))
        .collect();
    new_symbols.sort_by(|a, b| a.0.cmp(b.0));
    for (symbol, holding) in new_symbols {
        if holding.quantity < -QUANTITY_EPSILON {
            diff.drift.push(DriftFinding {
                symbol: symbol.clone(),
                detail: format!("broker reports negative quantity {}", holding.quantity),
            });
        } else if holding.quantity > QUANTITY_EPSILON {
            diff.changes.push(PositionChange::Insert {
                symbol: symbol.clone(),
                quantity: holding.quantity,
            });
        }
    }

    diff
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionPassReport {
    pub broker: String,
    pub at: DateTime<Utc>,
    pub removed: usize,
    pub updated: usize,
    pub inserted: usize,
    pub unchanged: usize,
    pub drift: Vec<DriftFinding>,
    /// Symbols whose price could not be refreshed
    pub price_failures: Vec<String>,
    /// Underlyings whose volatility could not be computed
    pub volatility_failures: Vec<String>,
    pub strategy_balances: BTreeMap<String, StrategyBalance>,
    /// `None` when the account summary was unavailable
    pub uncategorized: Option<f64>,
    pub over_attributed: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct UnderlyingMarket {
    price: Option<f64>,
    volatility: Option<f64>,
}

pub struct PositionReconciler {
    store: LedgerStore,
    brokers: BrokerRegistry,
    config: PositionReconcilerConfig,
    price_history: Option<Arc<dyn HistoricalPriceSource>>,
    estimator: HistoricalVolatility,
}

impl PositionReconciler {
    pub fn new(store: LedgerStore, brokers: BrokerRegistry, config: PositionReconcilerConfig) -> Self {
        Self {
            store,
            brokers,
            config,
            price_history: None,
            estimator: HistoricalVolatility::default(),
        }
    }

    pub fn with_price_history(mut self, source: Arc<dyn HistoricalPriceSource>) -> Self {
        self.price_history = Some(source);
        self
    }

    pub async fn run_pass(&self, broker: &str) -> Result<PositionPassReport, EngineError> {
        self.run_pass_at(broker, Utc::now()).await
    }

    /// Reconcile positions and balances of `broker` as of `now`
    ///
    /// # Errors
    /// A failed holdings fetch or any ledger failure aborts the pass; nothing
    /// is written in that case.
    pub async fn run_pass_at(
        &self,
        broker: &str,
        now: DateTime<Utc>,
    ) -> Result<PositionPassReport, EngineError> {
        let adapter = self.brokers.get(broker)?;
        let reported = adapter.fetch_positions().await.map_err(|e| {
            warn!("Position pass on {} aborted, holdings unavailable: {}", broker, e);
            EngineError::from(e)
        })?;

        let mut report = PositionPassReport {
            broker: broker.to_string(),
            at: now,
            ..PositionPassReport::default()
        };

        let prices = self
            .fetch_prices(&*adapter, reported.keys(), &mut report)
            .await;
        let underlyings = self
            .fetch_underlyings(&*adapter, reported.keys(), &mut report)
            .await;
        let account = match adapter.fetch_account_info().await {
            Ok(info) => Some(info),
            Err(e) => {
                warn!("Account summary for {} unavailable: {}", broker, e);
                None
            }
        };

        let mut tx = self.store.begin().await?;

        let ledger = tx.positions_for_broker(broker).await?;
        let diff = diff_positions(&ledger, &reported);
        for finding in &diff.drift {
            error!(
                "Consistency drift on {}/{}: {}",
                broker, finding.symbol, finding.detail
            );
        }

        for change in &diff.changes {
            match change {
                PositionChange::Remove { id, symbol } => {
                    debug!("Removing {} position {} on {}", symbol, id, broker);
                    tx.delete_position(*id).await?;
                    report.removed += 1;
                }
                PositionChange::Update { id, symbol, from, to } => {
                    info!("{} on {}: ledger {} -> broker {}", symbol, broker, from, to);
                    tx.update_position_quantity(*id, *to, now).await?;
                    report.updated += 1;
                }
                PositionChange::Touch { .. } => report.unchanged += 1,
                PositionChange::Insert { symbol, quantity } => {
                    info!(
                        "New {} holding of {} on {} booked as {}",
                        symbol, quantity, broker, UNCATEGORIZED
                    );
                    let mut position = Position::new(broker, UNCATEGORIZED, symbol, now);
                    position.quantity = *quantity;
                    position.latest_price = prices
                        .get(symbol)
                        .copied()
                        .or_else(|| cost_basis_price(reported.get(symbol)))
                        .unwrap_or(0.0);
                    tx.upsert_position(&position).await?;
                    report.inserted += 1;
                }
            }
        }

        let drifted: BTreeSet<&str> = diff.drift.iter().map(|d| d.symbol.as_str()).collect();
        for mut position in tx.positions_for_broker(broker).await? {
            if drifted.contains(position.symbol.as_str()) {
                continue;
            }
            if let Some(price) = prices.get(&position.symbol) {
                position.latest_price = *price;
            }
            if let Some(underlying) = underlying_symbol(&position.symbol) {
                let market = underlyings.get(&underlying).copied().unwrap_or_default();
                position.underlying_symbol = Some(underlying);
                position.underlying_latest_price = market.price;
                position.underlying_volatility = market.volatility;
            }
            tx.update_position_market(&position, now).await?;
        }

        let mut categorized_total = 0.0;
        for strategy in tx.strategies(broker).await? {
            let cash = tx
                .latest_balance(broker, &strategy, BalanceType::Cash)
                .await?
                .map_or(0.0, |b| b.amount);
            let positions_value = strategy_positions_value(&mut tx, broker, &strategy).await?;
            let balance = StrategyBalance::new(cash, positions_value);
            append_strategy_balances(&mut tx, broker, &strategy, balance, now).await?;
            categorized_total += balance.total();
            report.strategy_balances.insert(strategy, balance);
        }

        if let Some(info) = account {
            self.write_uncategorized(&mut tx, broker, &info, categorized_total, now, &mut report)
                .await?;
        }

        tx.commit().await?;
        report.drift = diff.drift;

        info!(
            "Position pass on {}: {} removed, {} updated, {} inserted, {} unchanged, {} drift",
            broker,
            report.removed,
            report.updated,
            report.inserted,
            report.unchanged,
            report.drift.len()
        );
        Ok(report)
    }

    async fn write_uncategorized(
        &self,
        tx: &mut crate::persistence::LedgerTx,
        broker: &str,
        info: &AccountInfo,
        categorized_total: f64,
        now: DateTime<Utc>,
        report: &mut PositionPassReport,
    ) -> Result<(), EngineError> {
        let split = split_uncategorized(info.total_value, categorized_total);
        if split.over_attributed > 0.0 {
            warn!(
                "Strategies on {} account for {:.2} more than the account value {:.2}",
                broker, split.over_attributed, info.total_value
            );
        }
        tx.insert_balance(broker, UNCATEGORIZED, BalanceType::Cash, split.uncategorized, now)
            .await?;
        tx.upsert_account_snapshot(&AccountSnapshot::from_info(broker, info, now))
            .await?;

        report.uncategorized = Some(split.uncategorized);
        report.over_attributed = split.over_attributed;
        Ok(())
    }

    async fn fetch_prices<'a>(
        &self,
        adapter: &dyn BrokerAdapter,
        symbols: impl Iterator<Item = &'a String>,
        report: &mut PositionPassReport,
    ) -> HashMap<String, f64> {
        let mut prices = HashMap::new();
        for symbol in symbols {
            match adapter.current_price(symbol).await {
                Ok(price) => {
                    prices.insert(symbol.clone(), price);
                }
                Err(e) => {
                    warn!("Price refresh for {} failed, keeping last price: {}", symbol, e);
                    report.price_failures.push(symbol.clone());
                }
            }
        }
        report.price_failures.sort();
        prices
    }

    async fn fetch_underlyings<'a>(
        &self,
        adapter: &dyn BrokerAdapter,
        symbols: impl Iterator<Item = &'a String>,
        report: &mut PositionPassReport,
    ) -> HashMap<String, UnderlyingMarket> {
        let wanted: BTreeSet<String> = symbols.filter_map(|s| underlying_symbol(s)).collect();

        let mut markets = HashMap::new();
        for underlying in wanted {
            let price = match adapter.current_price(&underlying).await {
                Ok(price) => Some(price),
                Err(e) => {
                    warn!("Underlying price for {} unavailable: {}", underlying, e);
                    report.price_failures.push(underlying.clone());
                    None
                }
            };
            let volatility = self.volatility(&underlying).await;
            if volatility.is_none() && self.price_history.is_some() {
                report.volatility_failures.push(underlying.clone());
            }
            markets.insert(underlying, UnderlyingMarket { price, volatility });
        }
        markets
    }

    async fn volatility(&self, symbol: &str) -> Option<f64> {
        let source = self.price_history.as_ref()?;
        let closes = match source
            .daily_closes(symbol, self.config.volatility_lookback_days)
            .await
        {
            Ok(closes) => closes,
            Err(e) => {
                warn!("Volatility for {} not computed: {}", symbol, e);
                return None;
            }
        };
        let volatility = self.estimator.annualized(&closes);
        if volatility.is_none() {
            warn!(
                "Volatility for {} not computed from {} closes",
                symbol,
                closes.len()
            );
        }
        volatility
    }
}

fn cost_basis_price(holding: Option<&BrokerPosition>) -> Option<f64> {
    let holding = holding?;
    let basis = holding.cost_basis?;
    (holding.quantity.abs() > QUANTITY_EPSILON).then(|| basis / holding.quantity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::paper_broker::PaperBroker;
    use crate::infrastructure::price_history::InMemoryPriceHistory;
    use crate::persistence::init_database;
    use std::time::Duration;

    fn position(id: i64, strategy: &str, symbol: &str, quantity: f64) -> Position {
        let mut p = Position::new("paper", strategy, symbol, Utc::now());
        p.id = id;
        p.quantity = quantity;
        p
    }

    fn holdings(entries: &[(&str, f64)]) -> HashMap<String, BrokerPosition> {
        entries
            .iter()
            .map(|(s, q)| {
                (
                    s.to_string(),
                    BrokerPosition {
                        quantity: *q,
                        cost_basis: None,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_missing_symbol_is_removed() {
        let ledger = vec![position(1, "a", "AAPL", 10.0), position(2, "a", "MSFT", 5.0)];
        let diff = diff_positions(&ledger, &holdings(&[("AAPL", 10.0)]));
        assert_eq!(
            diff.changes,
            vec![
                PositionChange::Touch { id: 1 },
                PositionChange::Remove {
                    id: 2,
                    symbol: "MSFT".into()
                },
            ]
        );
        assert!(diff.drift.is_empty());
    }

    #[test]
    fn test_single_row_takes_broker_quantity() {
        let ledger = vec![position(1, "a", "AAPL", 10.0)];
        let diff = diff_positions(&ledger, &holdings(&[("AAPL", 12.0)]));
        assert_eq!(
            diff.changes,
            vec![PositionChange::Update {
                id: 1,
                symbol: "AAPL".into(),
                from: 10.0,
                to: 12.0
            }]
        );
    }

    #[test]
    fn test_unknown_holding_is_inserted() {
        let diff = diff_positions(&[], &holdings(&[("NVDA", 3.0), ("AMD", 0.0)]));
        assert_eq!(
            diff.changes,
            vec![PositionChange::Insert {
                symbol: "NVDA".into(),
                quantity: 3.0
            }]
        );
    }

    #[test]
    fn test_shared_symbol_difference_goes_to_uncategorized() {
        let ledger = vec![
            position(1, "a", "AAPL", 10.0),
            position(2, "b", "AAPL", 5.0),
            position(3, UNCATEGORIZED, "AAPL", 2.0),
        ];
        let diff = diff_positions(&ledger, &holdings(&[("AAPL", 16.0)]));
        assert!(diff.changes.contains(&PositionChange::Update {
            id: 3,
            symbol: "AAPL".into(),
            from: 2.0,
            to: 1.0
        }));

        let diff = diff_positions(&ledger, &holdings(&[("AAPL", 15.0)]));
        assert!(diff.changes.contains(&PositionChange::Remove {
            id: 3,
            symbol: "AAPL".into()
        }));

        let ledger = vec![position(1, "a", "AAPL", 10.0), position(2, "b", "AAPL", 5.0)];
        let diff = diff_positions(&ledger, &holdings(&[("AAPL", 18.0)]));
        assert!(diff.changes.contains(&PositionChange::Insert {
            symbol: "AAPL".into(),
            quantity: 3.0
        }));
    }

    #[test]
    fn test_shortfall_across_strategies_is_drift() {
        let ledger = vec![position(1, "a", "AAPL", 10.0), position(2, "b", "AAPL", 5.0)];
        let diff = diff_positions(&ledger, &holdings(&[("AAPL", 12.0)]));
        assert!(diff.changes.is_empty());
        assert_eq!(diff.drift.len(), 1);
        assert_eq!(diff.drift[0].symbol, "AAPL");
    }

    #[test]
    fn test_negative_broker_quantity_is_drift() {
        let ledger = vec![position(1, "a", "AAPL", 10.0)];
        let diff = diff_positions(&ledger, &holdings(&[("AAPL", -1.0), ("TSLA", -2.0)]));
        assert!(diff.changes.is_empty());
        assert_eq!(diff.drift.len(), 2);
    }

    #[tokio::test]
    async fn test_option_position_gets_underlying_market_data() {
        let paper = Arc::new(PaperBroker::new("paper", 10_000.0));
        let option = "AAPL240119C00150000";
        paper.set_price(option, 5.0);
        paper.set_price("AAPL", 150.0);
        paper.set_position(option, 2.0);

        let history = Arc::new(InMemoryPriceHistory::new());
        history.load("AAPL", vec![100.0, 102.0, 101.0, 103.0]);

        let store = LedgerStore::new(init_database("sqlite::memory:").await.unwrap());
        let mut registry = BrokerRegistry::new();
        registry.register(paper, Duration::from_secs(5), 6_000);
        let reconciler =
            PositionReconciler::new(store.clone(), registry, PositionReconcilerConfig::default())
                .with_price_history(history);

        let report = reconciler.run_pass("paper").await.unwrap();
        assert_eq!(report.inserted, 1);
        assert!(report.volatility_failures.is_empty());

        let stored = store.positions_for_broker("paper").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].strategy, UNCATEGORIZED);
        assert_eq!(stored[0].latest_price, 5.0);
        assert_eq!(stored[0].underlying_symbol.as_deref(), Some("AAPL"));
        assert_eq!(stored[0].underlying_latest_price, Some(150.0));
        assert!(stored[0].underlying_volatility.unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_futures_position_tracks_contract_root() {
        let paper = Arc::new(PaperBroker::new("paper", 50_000.0));
        paper.set_price("/ESZ4", 5_000.0);
        paper.set_price("ES", 4_990.0);
        paper.set_position("/ESZ4", 1.0);

        let history = Arc::new(InMemoryPriceHistory::new());
        history.load("ES", vec![4_900.0, 4_950.0, 4_925.0, 4_990.0]);

        let store = LedgerStore::new(init_database("sqlite::memory:").await.unwrap());
        let mut registry = BrokerRegistry::new();
        registry.register(paper, Duration::from_secs(5), 6_000);
        let reconciler =
            PositionReconciler::new(store.clone(), registry, PositionReconcilerConfig::default())
                .with_price_history(history);

        let report = reconciler.run_pass("paper").await.unwrap();
        assert!(report.volatility_failures.is_empty());

        let stored = store.positions_for_broker("paper").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].symbol, "/ESZ4");
        assert_eq!(stored[0].underlying_symbol.as_deref(), Some("ES"));
        assert_eq!(stored[0].underlying_latest_price, Some(4_990.0));
        assert!(stored[0].underlying_volatility.unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_volatility_failure_keeps_previous_value() {
        let paper = Arc::new(PaperBroker::new("paper", 10_000.0));
        let option = "AAPL240119C00150000";
        paper.set_price(option, 5.0);
        paper.set_price("AAPL", 150.0);
        paper.set_position(option, 2.0);

        let history = Arc::new(InMemoryPriceHistory::new());
        history.load("AAPL", vec![100.0, 102.0, 101.0, 103.0]);

        let store = LedgerStore::new(init_database("sqlite::memory:").await.unwrap());
        let mut registry = BrokerRegistry::new();
        registry.register(paper, Duration::from_secs(5), 6_000);
        let reconciler =
            PositionReconciler::new(store.clone(), registry, PositionReconcilerConfig::default())
                .with_price_history(history.clone());

        reconciler.run_pass("paper").await.unwrap();
        let before = store.positions_for_broker("paper").await.unwrap()[0].underlying_volatility;

        history.load("AAPL", vec![]);
        let report = reconciler.run_pass("paper").await.unwrap();
        assert_eq!(report.volatility_failures, vec!["AAPL".to_string()]);
        let after = store.positions_for_broker("paper").await.unwrap()[0].underlying_volatility;
        assert_eq!(before, after);
    }
}
