//! Paper Broker
//!
//! In-process simulated brokerage. Orders fill against quotes set with
//! `set_price`/`set_quote`: marketable orders fill on submission, other limit
//! orders rest until a later quote crosses them. Holdings and cash are kept
//! in memory, so the broker's view can be pushed out of line with the ledger
//! (`set_position`) to exercise reconciliation.

use crate::domain::entities::order::{OrderRequest, OrderSide, OrderType};
use crate::domain::repositories::broker_adapter::{
    AccountInfo, AckStatus, BrokerAdapter, BrokerError, BrokerPosition, BrokerResult, OrderAck,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
enum PaperOrderStatus {
    Working,
    Filled(f64),
    Cancelled,
}

#[derive(Debug, Clone)]
struct PaperOrder {
    request: OrderRequest,
    status: PaperOrderStatus,
}

#[derive(Debug, Clone, Copy)]
struct Quote {
    last: f64,
    bid: f64,
    ask: f64,
}

#[derive(Debug, Default)]
struct PaperState {
    connected: bool,
    cash: f64,
    quotes: HashMap<String, Quote>,
    holdings: HashMap<String, BrokerPosition>,
    orders: HashMap<String, PaperOrder>,
    next_order_id: u64,
    failures: HashMap<String, VecDeque<BrokerError>>,
    latency: Duration,
    calls: HashMap<String, u32>,
}

impl PaperState {
    fn execute(&mut self, request: &OrderRequest, price: f64) -> BrokerResult<()> {
        let signed = request.side.sign() * request.quantity;
        let cost = signed * price;
        let held = self.holdings.get(&request.symbol).map_or(0.0, |h| h.quantity);

        if request.side == OrderSide::Buy && cost > self.cash {
            return Err(BrokerError::Rejected(format!(
                "insufficient cash: need {:.2}, have {:.2}",
                cost, self.cash
            )));
        }
        if request.side == OrderSide::Sell && request.quantity > held {
            return Err(BrokerError::Rejected(format!(
                "insufficient shares of {}: hold {}, selling {}",
                request.symbol, held, request.quantity
            )));
        }

        self.cash -= cost;
        let remaining = held + signed;
        if remaining.abs() < 1e-9 {
            self.holdings.remove(&request.symbol);
        } else {
            let entry = self
                .holdings
                .entry(request.symbol.clone())
                .or_insert(BrokerPosition {
                    quantity: 0.0,
                    cost_basis: Some(0.0),
                });
            if request.side == OrderSide::Buy {
                entry.cost_basis = Some(entry.cost_basis.unwrap_or(0.0) + cost);
            }
            entry.quantity = remaining;
        }
        Ok(())
    }

    /// Price an order would fill at right now, or `None` if it must rest
    fn marketable_price(&self, request: &OrderRequest) -> Option<f64> {
        let quote = self.quotes.get(&request.symbol)?;
        match (request.order_type, request.price) {
            (OrderType::Market, _) => Some(quote.last),
            (OrderType::Limit, Some(limit)) => {
                let crosses = match request.side {
                    OrderSide::Buy => quote.ask <= limit,
                    OrderSide::Sell => quote.bid >= limit,
                };
                crosses.then_some(limit)
            }
            (OrderType::Limit, None) => None,
        }
    }

    fn sweep_working_orders(&mut self, symbol: &str) {
        let candidates: Vec<(String, OrderRequest)> = self
            .orders
            .iter()
            .filter(|(_, o)| o.status == PaperOrderStatus::Working && o.request.symbol == symbol)
            .map(|(id, o)| (id.clone(), o.request.clone()))
            .collect();

        for (id, request) in candidates {
            let Some(price) = self.marketable_price(&request) else {
                continue;
            };
            if self.execute(&request, price).is_ok() {
                if let Some(order) = self.orders.get_mut(&id) {
                    order.status = PaperOrderStatus::Filled(price);
                }
                debug!("Paper order {} filled at {}", id, price);
            }
        }
    }
}

pub struct PaperBroker {
    name: String,
    state: Mutex<PaperState>,
}

impl PaperBroker {
    /// A connected paper account holding `cash`
    pub fn new(name: &str, cash: f64) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(PaperState {
                connected: true,
                cash,
                ..PaperState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the last trade price with a zero-width spread
    pub fn set_price(&self, symbol: &str, price: f64) {
        self.set_quote(symbol, price, price, price);
    }

    pub fn set_quote(&self, symbol: &str, last: f64, bid: f64, ask: f64) {
        let mut state = self.state();
        state
            .quotes
            .insert(symbol.to_string(), Quote { last, bid, ask });
        state.sweep_working_orders(symbol);
    }

    /// Overwrite the broker-side holding, as if traded outside the ledger
    pub fn set_position(&self, symbol: &str, quantity: f64) {
        let mut state = self.state();
        if quantity == 0.0 {
            state.holdings.remove(symbol);
        } else {
            state.holdings.insert(
                symbol.to_string(),
                BrokerPosition {
                    quantity,
                    cost_basis: None,
                },
            );
        }
    }

    pub fn set_cash(&self, cash: f64) {
        self.state().cash = cash;
    }

    /// Make the next call to `operation` fail with `error`
    pub fn inject_failure(&self, operation: &str, error: BrokerError) {
        self.state()
            .failures
            .entry(operation.to_string())
            .or_default()
            .push_back(error);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    pub fn disconnect(&self) {
        self.state().connected = false;
    }

    /// Fill a resting order at `price` regardless of quotes
    pub fn force_fill(&self, broker_order_id: &str, price: f64) -> BrokerResult<()> {
        let mut state = self.state();
        let request = match state.orders.get(broker_order_id) {
            Some(order) if order.status == PaperOrderStatus::Working => order.request.clone(),
            _ => {
                return Err(BrokerError::Rejected(format!(
                    "order {} is not working",
                    broker_order_id
                )))
            }
        };
        state.execute(&request, price)?;
        if let Some(order) = state.orders.get_mut(broker_order_id) {
            order.status = PaperOrderStatus::Filled(price);
        }
        Ok(())
    }

    pub fn cash(&self) -> f64 {
        self.state().cash
    }

    /// Ids of orders still working, in submission order
    pub fn working_orders(&self) -> Vec<String> {
        let state = self.state();
        let mut ids: Vec<(u64, String)> = state
            .orders
            .iter()
            .filter(|(_, o)| o.status == PaperOrderStatus::Working)
            .filter_map(|(id, _)| {
                id.trim_start_matches("paper-")
                    .parse::<u64>()
                    .ok()
                    .map(|n| (n, id.clone()))
            })
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Limit price of an order as submitted
    pub fn order_price(&self, broker_order_id: &str) -> Option<f64> {
        self.state()
            .orders
            .get(broker_order_id)
            .and_then(|o| o.request.price)
    }

    /// Number of calls made to `operation`
    pub fn call_count(&self, operation: &str) -> u32 {
        self.state().calls.get(operation).copied().unwrap_or(0)
    }

    async fn enter(&self, operation: &str) -> BrokerResult<()> {
        let latency = {
            let mut state = self.state();
            *state.calls.entry(operation.to_string()).or_insert(0) += 1;
            state.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        if let Some(error) = state
            .failures
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        if !state.connected && operation != "connect" {
            return Err(BrokerError::NotConnected);
        }
        Ok(())
    }

    fn quote(&self, symbol: &str) -> BrokerResult<Quote> {
        self.state()
            .quotes
            .get(symbol)
            .copied()
            .ok_or_else(|| BrokerError::UnsupportedSymbol(symbol.to_string()))
    }
}

#[async_trait]
impl BrokerAdapter for PaperBroker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> BrokerResult<()> {
        self.enter("connect").await?;
        self.state().connected = true;
        Ok(())
    }

    async fn fetch_account_info(&self) -> BrokerResult<AccountInfo> {
        self.enter("fetch_account_info").await?;
        let state = self.state();
        let holdings_value: f64 = state
            .holdings
            .iter()
            .map(|(symbol, h)| {
                h.quantity * state.quotes.get(symbol).map_or(0.0, |q| q.last)
            })
            .sum();
        Ok(AccountInfo {
            buying_power: state.cash,
            cash: state.cash,
            total_value: state.cash + holdings_value,
        })
    }

    async fn place_order(&self, order: &OrderRequest) -> BrokerResult<OrderAck> {
        self.enter("place_order").await?;
        order.validate().map_err(BrokerError::Rejected)?;

        let mut state = self.state();
        if !state.quotes.contains_key(&order.symbol) {
            return Err(BrokerError::UnsupportedSymbol(order.symbol.clone()));
        }

        state.next_order_id += 1;
        let broker_order_id = format!("paper-{}", state.next_order_id);

        let ack = match state.marketable_price(order) {
            Some(price) => {
                state.execute(order, price)?;
                state.orders.insert(
                    broker_order_id.clone(),
                    PaperOrder {
                        request: order.clone(),
                        status: PaperOrderStatus::Filled(price),
                    },
                );
                OrderAck {
                    broker_order_id,
                    executed_price: Some(price),
                    status: AckStatus::Filled,
                }
            }
            None => {
                state.orders.insert(
                    broker_order_id.clone(),
                    PaperOrder {
                        request: order.clone(),
                        status: PaperOrderStatus::Working,
                    },
                );
                OrderAck {
                    broker_order_id,
                    executed_price: None,
                    status: AckStatus::Accepted,
                }
            }
        };

        debug!(
            "Paper {} {} {} {} -> {} ({:?})",
            self.name, order.side, order.quantity, order.symbol, ack.broker_order_id, ack.status
        );
        Ok(ack)
    }

    async fn is_order_filled(&self, broker_order_id: &str) -> BrokerResult<bool> {
        self.enter("is_order_filled").await?;
        match self.state().orders.get(broker_order_id) {
            Some(order) => Ok(matches!(order.status, PaperOrderStatus::Filled(_))),
            None => Err(BrokerError::Rejected(format!(
                "unknown order {}",
                broker_order_id
            ))),
        }
    }

    async fn fill_price(&self, broker_order_id: &str) -> BrokerResult<Option<f64>> {
        self.enter("fill_price").await?;
        Ok(match self.state().orders.get(broker_order_id) {
            Some(PaperOrder {
                status: PaperOrderStatus::Filled(price),
                ..
            }) => Some(*price),
            _ => None,
        })
    }

    async fn cancel_order(&self, broker_order_id: &str) -> BrokerResult<()> {
        self.enter("cancel_order").await?;
        let mut state = self.state();
        match state.orders.get_mut(broker_order_id) {
            Some(order) => match order.status {
                PaperOrderStatus::Working => {
                    order.status = PaperOrderStatus::Cancelled;
                    Ok(())
                }
                PaperOrderStatus::Cancelled => Ok(()),
                PaperOrderStatus::Filled(_) => Err(BrokerError::Rejected(format!(
                    "order {} already filled",
                    broker_order_id
                ))),
            },
            None => Err(BrokerError::Rejected(format!(
                "unknown order {}",
                broker_order_id
            ))),
        }
    }

    async fn fetch_positions(&self) -> BrokerResult<HashMap<String, BrokerPosition>> {
        self.enter("fetch_positions").await?;
        Ok(self.state().holdings.clone())
    }

    async fn current_price(&self, symbol: &str) -> BrokerResult<f64> {
        self.enter("current_price").await?;
        Ok(self.quote(symbol)?.last)
    }

    async fn mid_price(&self, symbol: &str) -> BrokerResult<f64> {
        self.enter("mid_price").await?;
        let quote = self.quote(symbol)?;
        Ok((quote.bid + quote.ask) / 2.0)
    }
}
