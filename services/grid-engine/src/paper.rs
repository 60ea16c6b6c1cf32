//! Paper exchange
//!
//! Deterministic in-process venue. Prices only move when a caller sets them,
//! fills are all-or-nothing, and every fill gets the next sequential trade id.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::executor::{
    AssetBalance, ExchangeError, ExchangeOrder, ExchangeResult, Fill, OrderRequest,
    TradingExecutor,
};
use crate::market::{split_symbol, MarketData, MarketError, MarketInfo, Ticker};
use crate::models::{OrderSide, OrderStatus, OrderType};

/// Operations a test can make fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperOp {
    Place,
    Cancel,
    FetchOrder,
    FetchOpenOrders,
    FetchBalance,
    Ticker,
}

#[derive(Debug, Clone)]
struct Injected {
    error: ExchangeError,
    /// Apply the operation, then report the error (a lost acknowledgement)
    after_accept: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct Holding {
    free: Decimal,
    locked: Decimal,
}

#[derive(Debug, Default)]
struct PaperState {
    prices: HashMap<String, Decimal>,
    markets: HashMap<String, MarketInfo>,
    balances: HashMap<Uuid, HashMap<String, Holding>>,
    orders: HashMap<Uuid, Vec<ExchangeOrder>>,
    failures: HashMap<PaperOp, VecDeque<Injected>>,
    calls: HashMap<PaperOp, usize>,
    fee_rate: Decimal,
    next_order_id: u64,
    next_trade_id: u64,
}

/// Simulated venue shared by every paper account
#[derive(Debug, Default)]
pub struct PaperExchange {
    state: Mutex<PaperState>,
}

impl PaperExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fee charged in the quote asset on every fill
    pub fn with_fee_rate(fee_rate: Decimal) -> Self {
        Self {
            state: Mutex::new(PaperState {
                fee_rate,
                ..PaperState::default()
            }),
        }
    }

    /// Executor view scoped to one exchange account
    pub fn account(self: &Arc<Self>, account_id: Uuid) -> PaperAccount {
        PaperAccount {
            exchange: Arc::clone(self),
            account_id,
        }
    }

    /// Move the market. Resting limit orders that become marketable fill at
    /// their limit price.
    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        let mut state = self.state.lock().await;
        state.prices.insert(symbol.to_string(), price);

        let PaperState {
            orders,
            balances,
            fee_rate,
            next_trade_id,
            ..
        } = &mut *state;
        for (account_id, book) in orders.iter_mut() {
            let holdings = balances.entry(*account_id).or_default();
            for order in book.iter_mut() {
                if order.symbol != symbol || order.status.is_terminal() {
                    continue;
                }
                if let Some(limit) = order.price {
                    if !is_marketable(order.side, limit, price) {
                        continue;
                    }
                    // sized at placement, so the reservation is in range
                    if let Ok(reserve) = reservation(order.side, limit, order.amount, *fee_rate) {
                        settle(holdings, order, limit, reserve, *fee_rate, next_trade_id);
                        info!(
                            account_id = %account_id,
                            client_order_id = %order.client_order_id,
                            price = %limit,
                            "Paper limit order filled"
                        );
                    }
                }
            }
        }
    }

    pub async fn set_market(&self, info: MarketInfo) {
        let mut state = self.state.lock().await;
        state.markets.insert(info.symbol.clone(), info);
    }

    pub async fn set_balance(&self, account_id: Uuid, asset: &str, free: Decimal) {
        let mut state = self.state.lock().await;
        state
            .balances
            .entry(account_id)
            .or_default()
            .entry(asset.to_string())
            .or_default()
            .free = free;
    }

    pub async fn balance(&self, account_id: Uuid, asset: &str) -> AssetBalance {
        let state = self.state.lock().await;
        let holding = state
            .balances
            .get(&account_id)
            .and_then(|h| h.get(asset))
            .copied()
            .unwrap_or_default();
        AssetBalance {
            asset: asset.to_string(),
            free: holding.free,
            locked: holding.locked,
        }
    }

    /// Fail the next call of `op` with `error`
    pub async fn fail_next(&self, op: PaperOp, error: ExchangeError) {
        self.inject(op, error, false).await;
    }

    /// Accept the next order but answer with `error`, as when a response is
    /// lost after the venue acted on the request
    pub async fn fail_next_after_accept(&self, error: ExchangeError) {
        self.inject(PaperOp::Place, error, true).await;
    }

    async fn inject(&self, op: PaperOp, error: ExchangeError, after_accept: bool) {
        let mut state = self.state.lock().await;
        state
            .failures
            .entry(op)
            .or_default()
            .push_back(Injected { error, after_accept });
    }

    /// Times `op` was invoked, failures included
    pub async fn call_count(&self, op: PaperOp) -> usize {
        let state = self.state.lock().await;
        state.calls.get(&op).copied().unwrap_or(0)
    }

    /// Every order the account ever placed, in placement order
    pub async fn orders(&self, account_id: Uuid) -> Vec<ExchangeOrder> {
        let state = self.state.lock().await;
        state.orders.get(&account_id).cloned().unwrap_or_default()
    }

    /// Place an order directly, bypassing failure injection
    pub async fn place_external(
        &self,
        account_id: Uuid,
        request: OrderRequest,
    ) -> ExchangeResult<ExchangeOrder> {
        let mut state = self.state.lock().await;
        state.place(account_id, request)
    }
}

impl PaperState {
    fn record(&mut self, op: PaperOp) -> Option<Injected> {
        *self.calls.entry(op).or_default() += 1;
        self.failures.get_mut(&op).and_then(VecDeque::pop_front)
    }

    fn find(&self, account_id: Uuid, client_order_id: &str) -> Option<&ExchangeOrder> {
        self.orders
            .get(&account_id)?
            .iter()
            .find(|o| o.client_order_id == client_order_id)
    }

    fn place(&mut self, account_id: Uuid, req: OrderRequest) -> ExchangeResult<ExchangeOrder> {
        if let Some(existing) = self.find(account_id, &req.client_order_id) {
            debug!(client_order_id = %req.client_order_id, "Duplicate client order id, returning existing order");
            return Ok(existing.clone());
        }

        if req.amount <= Decimal::ZERO {
            return Err(ExchangeError::BadRequest("amount must be positive".into()));
        }
        if let Some(market) = self.markets.get(&req.symbol) {
            if req.amount.normalize().scale() > market.amount_precision {
                return Err(ExchangeError::BadRequest(format!(
                    "invalid quantity precision for {}",
                    req.symbol
                )));
            }
            if req.amount < market.min_amount {
                return Err(ExchangeError::BadRequest(format!(
                    "amount {} below minimum {}",
                    req.amount, market.min_amount
                )));
            }
        }

        let last = self.prices.get(&req.symbol).copied();
        let (exec_price, marketable) = match (req.order_type, req.price, last) {
            (OrderType::Market, _, Some(last)) => (last, true),
            (OrderType::Market, _, None) => {
                return Err(ExchangeError::BadRequest(format!(
                    "no market for {}",
                    req.symbol
                )))
            }
            (OrderType::Limit, Some(limit), last) if limit > Decimal::ZERO => {
                let marketable = last.map_or(false, |l| is_marketable(req.side, limit, l));
                (limit, marketable)
            }
            (OrderType::Limit, _, _) => {
                return Err(ExchangeError::BadRequest("limit order needs a positive price".into()))
            }
        };

        let (base, quote) = split_symbol(&req.symbol);
        let holdings = self.balances.entry(account_id).or_default();
        let reserve = reservation(req.side, exec_price, req.amount, self.fee_rate)?;
        let asset = match req.side {
            OrderSide::Buy => &quote,
            OrderSide::Sell => &base,
        };
        let holding = holdings.entry(asset.clone()).or_default();
        if holding.free < reserve {
            return Err(ExchangeError::InsufficientFunds(format!(
                "need {} {}, have {}",
                reserve, asset, holding.free
            )));
        }
        holding.free -= reserve;
        holding.locked += reserve;

        self.next_order_id += 1;
        let mut order = ExchangeOrder {
            client_order_id: req.client_order_id,
            exchange_order_id: format!("paper-{}", self.next_order_id),
            symbol: req.symbol,
            side: req.side,
            order_type: req.order_type,
            price: match req.order_type {
                OrderType::Limit => Some(exec_price),
                OrderType::Market => None,
            },
            amount: req.amount,
            status: OrderStatus::New,
            filled_amount: Decimal::ZERO,
            avg_fill_price: None,
            fills: Vec::new(),
            updated_at: Utc::now(),
        };
        if marketable {
            settle(
                holdings,
                &mut order,
                exec_price,
                reserve,
                self.fee_rate,
                &mut self.next_trade_id,
            );
        }

        info!(
            account_id = %account_id,
            client_order_id = %order.client_order_id,
            side = %order.side,
            amount = %order.amount,
            status = ?order.status,
            "Paper order accepted"
        );
        self.orders.entry(account_id).or_default().push(order.clone());
        Ok(order)
    }

    fn cancel(
        &mut self,
        account_id: Uuid,
        symbol: &str,
        client_order_id: &str,
    ) -> ExchangeResult<ExchangeOrder> {
        let fee_rate = self.fee_rate;
        let order = self
            .orders
            .get_mut(&account_id)
            .and_then(|book| {
                book.iter_mut()
                    .find(|o| o.client_order_id == client_order_id && o.symbol == symbol)
            })
            .ok_or_else(|| ExchangeError::OrderNotFound(client_order_id.to_string()))?;
        if order.status.is_terminal() {
            return Ok(order.clone());
        }

        let (base, quote) = split_symbol(symbol);
        let price = order.price.unwrap_or_default();
        let reserve = reservation(order.side, price, order.amount, fee_rate)?;
        let asset = match order.side {
            OrderSide::Buy => quote,
            OrderSide::Sell => base,
        };
        let holding = self
            .balances
            .entry(account_id)
            .or_default()
            .entry(asset)
            .or_default();
        holding.locked -= reserve;
        holding.free += reserve;

        order.status = OrderStatus::Canceled;
        order.updated_at = Utc::now();
        Ok(order.clone())
    }
}

fn is_marketable(side: OrderSide, limit: Decimal, last: Decimal) -> bool {
    match side {
        OrderSide::Buy => last <= limit,
        OrderSide::Sell => last >= limit,
    }
}

/// Funds held while an order is open: quote plus fee for buys, base for sells
fn reservation(
    side: OrderSide,
    price: Decimal,
    amount: Decimal,
    fee_rate: Decimal,
) -> ExchangeResult<Decimal> {
    match side {
        OrderSide::Buy => price
            .checked_mul(amount)
            .and_then(|notional| {
                notional
                    .checked_mul(fee_rate)
                    .and_then(|fee| notional.checked_add(fee))
            })
            .ok_or_else(|| {
                ExchangeError::BadRequest(format!("notional {} x {} out of range", price, amount))
            }),
        OrderSide::Sell => Ok(amount),
    }
}

/// Fill the whole order at `price` and move the balances. `reserve` is what
/// placement locked for it.
fn settle(
    holdings: &mut HashMap<String, Holding>,
    order: &mut ExchangeOrder,
    price: Decimal,
    reserve: Decimal,
    fee_rate: Decimal,
    next_trade_id: &mut u64,
) {
    let (base, quote) = split_symbol(&order.symbol);
    let notional = price * order.amount;
    let fee = notional * fee_rate;

    match order.side {
        OrderSide::Buy => {
            let q = holdings.entry(quote.clone()).or_default();
            q.locked -= reserve;
            q.free += reserve - notional - fee;
            holdings.entry(base).or_default().free += order.amount;
        }
        OrderSide::Sell => {
            holdings.entry(base).or_default().locked -= reserve;
            holdings.entry(quote.clone()).or_default().free += notional - fee;
        }
    }

    *next_trade_id += 1;
    let now = Utc::now();
    order.fills.push(Fill {
        trade_id: format!("paper-t-{}", next_trade_id),
        price,
        amount: order.amount,
        fee,
        fee_asset: Some(quote),
        timestamp: now,
    });
    order.status = OrderStatus::Filled;
    order.filled_amount = order.amount;
    order.avg_fill_price = Some(price);
    order.updated_at = now;
}

/// `PaperExchange` scoped to one account
#[derive(Debug, Clone)]
pub struct PaperAccount {
    exchange: Arc<PaperExchange>,
    account_id: Uuid,
}

impl PaperAccount {
    pub fn account_id(&self) -> Uuid {
        self.account_id
    }
}

#[async_trait]
impl TradingExecutor for PaperAccount {
    fn name(&self) -> &str {
        "paper"
    }

    async fn place_order(&self, request: OrderRequest) -> ExchangeResult<ExchangeOrder> {
        let mut state = self.exchange.state.lock().await;
        match state.record(PaperOp::Place) {
            Some(Injected { error, after_accept: true }) => {
                state.place(self.account_id, request)?;
                Err(error)
            }
            Some(Injected { error, .. }) => Err(error),
            None => state.place(self.account_id, request),
        }
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> ExchangeResult<ExchangeOrder> {
        let mut state = self.exchange.state.lock().await;
        if let Some(injected) = state.record(PaperOp::Cancel) {
            return Err(injected.error);
        }
        state.cancel(self.account_id, symbol, client_order_id)
    }

    async fn fetch_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> ExchangeResult<Option<ExchangeOrder>> {
        let mut state = self.exchange.state.lock().await;
        if let Some(injected) = state.record(PaperOp::FetchOrder) {
            return Err(injected.error);
        }
        Ok(state
            .find(self.account_id, client_order_id)
            .filter(|o| o.symbol == symbol)
            .cloned())
    }

    async fn fetch_open_orders(&self, symbol: &str) -> ExchangeResult<Vec<ExchangeOrder>> {
        let mut state = self.exchange.state.lock().await;
        if let Some(injected) = state.record(PaperOp::FetchOpenOrders) {
            return Err(injected.error);
        }
        Ok(state
            .orders
            .get(&self.account_id)
            .map(|book| {
                book.iter()
                    .filter(|o| o.symbol == symbol && !o.status.is_terminal())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_balance(&self) -> ExchangeResult<Vec<AssetBalance>> {
        let mut state = self.exchange.state.lock().await;
        if let Some(injected) = state.record(PaperOp::FetchBalance) {
            return Err(injected.error);
        }
        let mut balances: Vec<AssetBalance> = state
            .balances
            .get(&self.account_id)
            .map(|h| {
                h.iter()
                    .map(|(asset, holding)| AssetBalance {
                        asset: asset.clone(),
                        free: holding.free,
                        locked: holding.locked,
                    })
                    .collect()
            })
            .unwrap_or_default();
        balances.sort_by(|a, b| a.asset.cmp(&b.asset));
        Ok(balances)
    }
}

#[async_trait]
impl MarketData for PaperExchange {
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, MarketError> {
        let mut state = self.state.lock().await;
        if let Some(injected) = state.record(PaperOp::Ticker) {
            return Err(injected.error.into());
        }
        let last_price = state
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| MarketError::Unavailable(symbol.to_string()))?;
        Ok(Ticker {
            symbol: symbol.to_string(),
            last_price,
            timestamp: Utc::now(),
        })
    }

    async fn get_market_info(&self, symbol: &str) -> Result<MarketInfo, MarketError> {
        let state = self.state.lock().await;
        state
            .markets
            .get(symbol)
            .cloned()
            .ok_or_else(|| MarketError::Unavailable(symbol.to_string()))
    }
}
