//! Ledger Repository
//!
//! `LedgerStore` serves committed reads and opens `LedgerTx` units of work.
//! Every mutation of the ledger goes through a `LedgerTx`, so readers never
//! observe a trade without its position and balance effects.

use super::models::*;
use super::{DatabaseError, DbPool};
use crate::domain::entities::account::AccountSnapshot;
use crate::domain::entities::balance::{BalanceSnapshot, BalanceType, UNCATEGORIZED};
use crate::domain::entities::position::Position;
use crate::domain::entities::trade::{Trade, TradeStatus};
use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite, Transaction};
use tracing::{debug, error};

fn query_failed(action: &'static str) -> impl FnOnce(sqlx::Error) -> DatabaseError {
    move |e| {
        error!("Failed to {}: {}", action, e);
        DatabaseError::QueryError(format!("Failed to {}: {}", action, e))
    }
}

fn into_trades(records: Vec<TradeRecord>) -> Result<Vec<Trade>, DatabaseError> {
    records.into_iter().map(Trade::try_from).collect()
}

async fn select_trade<'e, E>(executor: E, id: i64) -> Result<Option<Trade>, DatabaseError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let record = sqlx::query_as::<_, TradeRecord>("SELECT * FROM trades WHERE id = ?1")
        .bind(id)
        .fetch_optional(executor)
        .await
        .map_err(query_failed("get trade"))?;

    record.map(Trade::try_from).transpose()
}

async fn select_position<'e, E>(
    executor: E,
    broker: &str,
    strategy: &str,
    symbol: &str,
) -> Result<Option<Position>, DatabaseError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let record = sqlx::query_as::<_, PositionRecord>(
        "SELECT * FROM positions WHERE broker = ?1 AND strategy = ?2 AND symbol = ?3",
    )
    .bind(broker)
    .bind(strategy)
    .bind(symbol)
    .fetch_optional(executor)
    .await
    .map_err(query_failed("get position"))?;

    Ok(record.map(Position::from))
}

async fn select_broker_positions<'e, E>(
    executor: E,
    broker: &str,
) -> Result<Vec<Position>, DatabaseError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let records = sqlx::query_as::<_, PositionRecord>(
        "SELECT * FROM positions WHERE broker = ?1 ORDER BY symbol, strategy",
    )
    .bind(broker)
    .fetch_all(executor)
    .await
    .map_err(query_failed("list broker positions"))?;

    Ok(records.into_iter().map(Position::from).collect())
}

async fn select_latest_balance<'e, E>(
    executor: E,
    broker: &str,
    strategy: &str,
    balance_type: BalanceType,
) -> Result<Option<BalanceSnapshot>, DatabaseError>
where
    E: Executor<'e, Database = Sqlite>,
{
    // Rows are append-only, so the highest id is the most recent snapshot
    let record = sqlx::query_as::<_, BalanceRecord>(
        r#"
        SELECT * FROM balances
        WHERE broker = ?1 AND strategy = ?2 AND balance_type = ?3
        ORDER BY id DESC
        LIMIT 1
        "#,
    )
    .bind(broker)
    .bind(strategy)
    .bind(balance_type.as_str())
    .fetch_optional(executor)
    .await
    .map_err(query_failed("get latest balance"))?;

    record.map(BalanceSnapshot::try_from).transpose()
}

async fn select_strategies<'e, E>(executor: E, broker: &str) -> Result<Vec<String>, DatabaseError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT strategy FROM balances WHERE broker = ?1 AND strategy != ?2
        UNION
        SELECT strategy FROM positions WHERE broker = ?1 AND strategy != ?2
        ORDER BY strategy
        "#,
    )
    .bind(broker)
    .bind(UNCATEGORIZED)
    .fetch_all(executor)
    .await
    .map_err(query_failed("list strategies"))?;

    Ok(rows.into_iter().map(|(s,)| s).collect())
}

/// Read access to the ledger and the entry point for units of work
#[derive(Clone)]
pub struct LedgerStore {
    pool: DbPool,
}

impl LedgerStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Start a unit of work; nothing it writes is visible until `commit`
    pub async fn begin(&self) -> Result<LedgerTx, DatabaseError> {
        let tx = self.pool.begin().await.map_err(query_failed("begin transaction"))?;
        Ok(LedgerTx { tx })
    }

    pub async fn trade(&self, id: i64) -> Result<Option<Trade>, DatabaseError> {
        select_trade(&self.pool, id).await
    }

    /// Open trades for a broker, oldest first
    pub async fn open_trades(&self, broker: &str) -> Result<Vec<Trade>, DatabaseError> {
        let records = sqlx::query_as::<_, TradeRecord>(
            "SELECT * FROM trades WHERE broker = ?1 AND status = 'open' ORDER BY id",
        )
        .bind(broker)
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("list open trades"))?;

        into_trades(records)
    }

    /// Most recent trades for a broker, newest first
    pub async fn recent_trades(&self, broker: &str, limit: i64) -> Result<Vec<Trade>, DatabaseError> {
        let records = sqlx::query_as::<_, TradeRecord>(
            "SELECT * FROM trades WHERE broker = ?1 ORDER BY id DESC LIMIT ?2",
        )
        .bind(broker)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("list recent trades"))?;

        into_trades(records)
    }

    /// Open or filled buys of `symbol` by one strategy
    pub async fn live_buys(
        &self,
        broker: &str,
        strategy: &str,
        symbol: &str,
    ) -> Result<Vec<Trade>, DatabaseError> {
        let records = sqlx::query_as::<_, TradeRecord>(
            r#"
            SELECT * FROM trades
            WHERE broker = ?1 AND strategy = ?2 AND symbol = ?3
              AND side = 'buy' AND status IN ('open', 'filled')
            ORDER BY id DESC
            "#,
        )
        .bind(broker)
        .bind(strategy)
        .bind(symbol)
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("list buys"))?;

        into_trades(records)
    }

    pub async fn position(
        &self,
        broker: &str,
        strategy: &str,
        symbol: &str,
    ) -> Result<Option<Position>, DatabaseError> {
        select_position(&self.pool, broker, strategy, symbol).await
    }

    pub async fn positions_for_broker(&self, broker: &str) -> Result<Vec<Position>, DatabaseError> {
        select_broker_positions(&self.pool, broker).await
    }

    pub async fn positions_for(
        &self,
        broker: &str,
        strategy: &str,
    ) -> Result<Vec<Position>, DatabaseError> {
        let records = sqlx::query_as::<_, PositionRecord>(
            "SELECT * FROM positions WHERE broker = ?1 AND strategy = ?2 ORDER BY symbol",
        )
        .bind(broker)
        .bind(strategy)
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("list strategy positions"))?;

        Ok(records.into_iter().map(Position::from).collect())
    }

    pub async fn latest_balance(
        &self,
        broker: &str,
        strategy: &str,
        balance_type: BalanceType,
    ) -> Result<Option<BalanceSnapshot>, DatabaseError> {
        select_latest_balance(&self.pool, broker, strategy, balance_type).await
    }

    /// Full balance history for a strategy, oldest first
    pub async fn balance_history(
        &self,
        broker: &str,
        strategy: &str,
    ) -> Result<Vec<BalanceSnapshot>, DatabaseError> {
        let records = sqlx::query_as::<_, BalanceRecord>(
            "SELECT * FROM balances WHERE broker = ?1 AND strategy = ?2 ORDER BY id",
        )
        .bind(broker)
        .bind(strategy)
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("list balance history"))?;

        records.into_iter().map(BalanceSnapshot::try_from).collect()
    }

    /// Tracked strategies for a broker, excluding `uncategorized`
    pub async fn strategies(&self, broker: &str) -> Result<Vec<String>, DatabaseError> {
        select_strategies(&self.pool, broker).await
    }

    pub async fn account_snapshot(
        &self,
        broker: &str,
    ) -> Result<Option<AccountSnapshot>, DatabaseError> {
        let record = sqlx::query_as::<_, AccountSnapshotRecord>(
            "SELECT * FROM account_snapshots WHERE broker = ?1",
        )
        .bind(broker)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_failed("get account snapshot"))?;

        Ok(record.map(AccountSnapshot::from))
    }
}

/// One atomic unit of work against the ledger.
///
/// Dropping a `LedgerTx` without calling `commit` rolls it back.
pub struct LedgerTx {
    tx: Transaction<'static, Sqlite>,
}

impl LedgerTx {
    pub async fn commit(self) -> Result<(), DatabaseError> {
        self.tx.commit().await.map_err(query_failed("commit transaction"))
    }

    pub async fn rollback(self) -> Result<(), DatabaseError> {
        self.tx.rollback().await.map_err(query_failed("roll back transaction"))
    }

    pub async fn trade(&mut self, id: i64) -> Result<Option<Trade>, DatabaseError> {
        select_trade(&mut *self.tx, id).await
    }

    pub async fn position(
        &mut self,
        broker: &str,
        strategy: &str,
        symbol: &str,
    ) -> Result<Option<Position>, DatabaseError> {
        select_position(&mut *self.tx, broker, strategy, symbol).await
    }

    pub async fn positions_for_broker(&mut self, broker: &str) -> Result<Vec<Position>, DatabaseError> {
        select_broker_positions(&mut *self.tx, broker).await
    }

    pub async fn latest_balance(
        &mut self,
        broker: &str,
        strategy: &str,
        balance_type: BalanceType,
    ) -> Result<Option<BalanceSnapshot>, DatabaseError> {
        select_latest_balance(&mut *self.tx, broker, strategy, balance_type).await
    }

    pub async fn strategies(&mut self, broker: &str) -> Result<Vec<String>, DatabaseError> {
        select_strategies(&mut *self.tx, broker).await
    }

    /// Insert a new trade in status `open`
    pub async fn insert_trade(&mut self, trade: &NewTrade) -> Result<Trade, DatabaseError> {
        let record = sqlx::query_as::<_, TradeRecord>(
            r#"
            INSERT INTO trades (
                symbol, quantity, side, requested_price, executed_price, order_type,
                execution_style, status, broker, broker_order_id, strategy, timestamp,
                profit_loss, success, replaces_trade_id, reprice_count
            )
            VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6, 'open', ?7, ?8, ?9, ?10, NULL, NULL, ?11, ?12)
            RETURNING *
            "#,
        )
        .bind(&trade.symbol)
        .bind(trade.quantity)
        .bind(trade.side.as_str())
        .bind(trade.requested_price)
        .bind(trade.order_type.as_str())
        .bind(trade.execution_style.as_str())
        .bind(&trade.broker)
        .bind(trade.broker_order_id.as_deref())
        .bind(&trade.strategy)
        .bind(trade.timestamp)
        .bind(trade.replaces_trade_id)
        .bind(i64::from(trade.reprice_count))
        .fetch_one(&mut *self.tx)
        .await
        .map_err(query_failed("insert trade"))?;

        debug!(
            "Inserted trade {} ({} {} {}) for {}/{}",
            record.id, record.side, record.quantity, record.symbol, record.broker, record.strategy
        );
        Trade::try_from(record)
    }

    /// Resolve an open trade as filled. Returns false if it was no longer open.
    pub async fn fill_trade(&mut self, trade: &Trade) -> Result<bool, DatabaseError> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE trades
            SET status = 'filled', executed_price = ?1, profit_loss = ?2, success = ?3
            WHERE id = ?4 AND status = 'open'
            "#,
        )
        .bind(trade.executed_price)
        .bind(trade.profit_loss)
        .bind(trade.success)
        .bind(trade.id)
        .execute(&mut *self.tx)
        .await
        .map_err(query_failed("fill trade"))?
        .rows_affected();

        debug!("Filled trade {}: {} row(s)", trade.id, rows_affected);
        Ok(rows_affected == 1)
    }

    /// Move an open trade to `cancelled` or `stale`. Returns false if it was no longer open.
    pub async fn close_trade(&mut self, id: i64, status: TradeStatus) -> Result<bool, DatabaseError> {
        if !matches!(status, TradeStatus::Cancelled | TradeStatus::Stale) {
            return Err(DatabaseError::QueryError(format!(
                "Cannot close trade {} as {}",
                id, status
            )));
        }

        let rows_affected = sqlx::query("UPDATE trades SET status = ?1 WHERE id = ?2 AND status = 'open'")
            .bind(status.as_str())
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(query_failed("close trade"))?
            .rows_affected();

        debug!("Marked trade {} {}: {} row(s)", id, status, rows_affected);
        Ok(rows_affected == 1)
    }

    /// Insert or replace the position keyed by (broker, strategy, symbol)
    pub async fn upsert_position(&mut self, position: &Position) -> Result<Position, DatabaseError> {
        let record = sqlx::query_as::<_, PositionRecord>(
            r#"
            INSERT INTO positions (
                broker, strategy, symbol, quantity, latest_price, last_updated,
                underlying_symbol, underlying_latest_price, underlying_volatility
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(broker, strategy, symbol) DO UPDATE SET
                quantity = excluded.quantity,
                latest_price = excluded.latest_price,
                last_updated = excluded.last_updated,
                underlying_symbol = excluded.underlying_symbol,
                underlying_latest_price = excluded.underlying_latest_price,
                underlying_volatility = excluded.underlying_volatility
            RETURNING *
            "#,
        )
        .bind(&position.broker)
        .bind(&position.strategy)
        .bind(&position.symbol)
        .bind(position.quantity)
        .bind(position.latest_price)
        .bind(position.last_updated)
        .bind(position.underlying_symbol.as_deref())
        .bind(position.underlying_latest_price)
        .bind(position.underlying_volatility)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(query_failed("upsert position"))?;

        debug!(
            "Stored position {}/{}/{} qty={}",
            record.broker, record.strategy, record.symbol, record.quantity
        );
        Ok(Position::from(record))
    }

    pub async fn update_position_quantity(
        &mut self,
        id: i64,
        quantity: f64,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let rows_affected =
            sqlx::query("UPDATE positions SET quantity = ?1, last_updated = ?2 WHERE id = ?3")
                .bind(quantity)
                .bind(now)
                .bind(id)
                .execute(&mut *self.tx)
                .await
                .map_err(query_failed("update position quantity"))?
                .rows_affected();

        if rows_affected == 0 {
            return Err(DatabaseError::QueryError(format!(
                "Position not found: {}",
                id
            )));
        }
        Ok(())
    }

    /// Write refreshed market fields; `None` underlying values keep the stored ones
    pub async fn update_position_market(
        &mut self,
        position: &Position,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            UPDATE positions
            SET latest_price = ?1,
                underlying_symbol = COALESCE(?2, underlying_symbol),
                underlying_latest_price = COALESCE(?3, underlying_latest_price),
                underlying_volatility = COALESCE(?4, underlying_volatility),
                last_updated = ?5
            WHERE id = ?6
            "#,
        )
        .bind(position.latest_price)
        .bind(position.underlying_symbol.as_deref())
        .bind(position.underlying_latest_price)
        .bind(position.underlying_volatility)
        .bind(now)
        .bind(position.id)
        .execute(&mut *self.tx)
        .await
        .map_err(query_failed("update position prices"))?;

        Ok(())
    }

    pub async fn delete_position(&mut self, id: i64) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM positions WHERE id = ?1")
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(query_failed("delete position"))?;

        debug!("Deleted position {}", id);
        Ok(())
    }

    /// Append one balance row
    pub async fn insert_balance(
        &mut self,
        broker: &str,
        strategy: &str,
        balance_type: BalanceType,
        amount: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<BalanceSnapshot, DatabaseError> {
        let record = sqlx::query_as::<_, BalanceRecord>(
            r#"
            INSERT INTO balances (broker, strategy, balance_type, amount, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5)
            RETURNING *
            "#,
        )
        .bind(broker)
        .bind(strategy)
        .bind(balance_type.as_str())
        .bind(amount)
        .bind(timestamp)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(query_failed("insert balance"))?;

        BalanceSnapshot::try_from(record)
    }

    pub async fn upsert_account_snapshot(
        &mut self,
        snapshot: &AccountSnapshot,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO account_snapshots (broker, buying_power, cash, total_value, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(broker) DO UPDATE SET
                buying_power = excluded.buying_power,
                cash = excluded.cash,
                total_value = excluded.total_value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&snapshot.broker)
        .bind(snapshot.buying_power)
        .bind(snapshot.cash)
        .bind(snapshot.total_value)
        .bind(snapshot.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(query_failed("upsert account snapshot"))?;

        Ok(())
    }

    /// Rewrite the strategy name on every trade, position and balance row of a broker.
    /// Returns the number of rows touched.
    pub async fn rename_strategy(
        &mut self,
        broker: &str,
        old: &str,
        new: &str,
    ) -> Result<u64, DatabaseError> {
        let mut touched = 0;
        for table in ["trades", "positions", "balances"] {
            let sql = format!(
                "UPDATE {} SET strategy = ?1 WHERE broker = ?2 AND strategy = ?3",
                table
            );
            touched += sqlx::query(&sql)
                .bind(new)
                .bind(broker)
                .bind(old)
                .execute(&mut *self.tx)
                .await
                .map_err(query_failed("rename strategy"))?
                .rows_affected();
        }
        debug!("Renamed strategy {} -> {} on {}: {} row(s)", old, new, broker, touched);
        Ok(touched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::order::{ExecutionStyle, OrderSide, OrderType};
    use crate::persistence::init_database;

    async fn store() -> LedgerStore {
        LedgerStore::new(init_database("sqlite::memory:").await.unwrap())
    }

    fn new_trade(symbol: &str) -> NewTrade {
        NewTrade {
            symbol: symbol.to_string(),
            quantity: 10.0,
            side: OrderSide::Buy,
            requested_price: 100.0,
            order_type: OrderType::Limit,
            execution_style: ExecutionStyle::Plain,
            broker: "paper".to_string(),
            broker_order_id: Some("p-1".to_string()),
            strategy: "momentum".to_string(),
            timestamp: Utc::now(),
            replaces_trade_id: None,
            reprice_count: 0,
        }
    }

    #[tokio::test]
    async fn test_insert_and_fill_trade() {
        let store = store().await;
        let mut tx = store.begin().await.unwrap();
        let mut trade = tx.insert_trade(&new_trade("AAPL")).await.unwrap();
        assert_eq!(trade.status, TradeStatus::Open);

        trade.fill(101.0).unwrap();
        assert!(tx.fill_trade(&trade).await.unwrap());
        // a second resolution finds nothing open
        assert!(!tx.close_trade(trade.id, TradeStatus::Stale).await.unwrap());
        tx.commit().await.unwrap();

        let stored = store.trade(trade.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TradeStatus::Filled);
        assert_eq!(stored.executed_price, Some(101.0));
        assert_eq!(stored.success, Some(true));
        assert!(store.open_trades("paper").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let store = store().await;
        let mut tx = store.begin().await.unwrap();
        tx.insert_trade(&new_trade("AAPL")).await.unwrap();
        tx.insert_balance("paper", "momentum", BalanceType::Cash, 10.0, Utc::now())
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        assert!(store.recent_trades("paper", 10).await.unwrap().is_empty());
        assert!(store
            .latest_balance("paper", "momentum", BalanceType::Cash)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_latest_balance_is_last_appended() {
        let store = store().await;
        let now = Utc::now();
        let mut tx = store.begin().await.unwrap();
        tx.insert_balance("paper", "momentum", BalanceType::Cash, 100.0, now)
            .await
            .unwrap();
        tx.insert_balance("paper", "momentum", BalanceType::Cash, 80.0, now)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let latest = store
            .latest_balance("paper", "momentum", BalanceType::Cash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.amount, 80.0);
        assert_eq!(store.balance_history("paper", "momentum").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_upsert_position_updates_in_place() {
        let store = store().await;
        let now = Utc::now();
        let mut position = Position::new("paper", "momentum", "AAPL", now);
        position.quantity = 5.0;

        let mut tx = store.begin().await.unwrap();
        let first = tx.upsert_position(&position).await.unwrap();
        position.quantity = 8.0;
        let second = tx.upsert_position(&position).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(first.id, second.id);
        let stored = store.position("paper", "momentum", "AAPL").await.unwrap().unwrap();
        assert_eq!(stored.quantity, 8.0);
    }

    #[tokio::test]
    async fn test_negative_position_is_refused_by_schema() {
        let store = store().await;
        let mut position = Position::new("paper", "momentum", "AAPL", Utc::now());
        position.quantity = -1.0;

        let mut tx = store.begin().await.unwrap();
        assert!(tx.upsert_position(&position).await.is_err());
    }

    #[tokio::test]
    async fn test_strategies_exclude_uncategorized() {
        let store = store().await;
        let now = Utc::now();
        let mut tx = store.begin().await.unwrap();
        tx.insert_balance("paper", "momentum", BalanceType::Cash, 1.0, now)
            .await
            .unwrap();
        tx.insert_balance("paper", UNCATEGORIZED, BalanceType::Cash, 1.0, now)
            .await
            .unwrap();
        let mut position = Position::new("paper", "income", "MSFT", now);
        position.quantity = 1.0;
        tx.upsert_position(&position).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(
            store.strategies("paper").await.unwrap(),
            vec!["income".to_string(), "momentum".to_string()]
        );
    }

    #[tokio::test]
    async fn test_account_snapshot_has_one_row_per_broker() {
        let store = store().await;
        let mut snapshot = AccountSnapshot {
            broker: "paper".into(),
            buying_power: 10.0,
            cash: 10.0,
            total_value: 20.0,
            updated_at: Utc::now(),
        };
        let mut tx = store.begin().await.unwrap();
        tx.upsert_account_snapshot(&snapshot).await.unwrap();
        snapshot.total_value = 30.0;
        tx.upsert_account_snapshot(&snapshot).await.unwrap();
        tx.commit().await.unwrap();

        let stored = store.account_snapshot("paper").await.unwrap().unwrap();
        assert_eq!(stored.total_value, 30.0);
    }
}
