//! Trading executor port
//!
//! One capability interface for every venue. The paper simulator and the live
//! REST adapter both implement it and both report failures through the same
//! tagged `ExchangeError`, so the retry classifier never has to probe
//! untyped payloads.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Order, OrderSide, OrderStatus, OrderType, Trade};

/// Errors surfaced at the executor boundary
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExchangeError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_ms: Option<u64>,
    },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("order not found: {0}")]
    OrderNotFound(String),
    /// Venue-reported error that did not map onto a typed variant
    #[error("venue error{}: {message}", code_suffix(.code))]
    Venue {
        code: Option<String>,
        message: String,
        retryable: Option<bool>,
        retry_after_ms: Option<u64>,
    },
}

impl ExchangeError {
    pub fn venue(code: Option<&str>, message: impl Into<String>) -> Self {
        ExchangeError::Venue {
            code: code.map(str::to_string),
            message: message.into(),
            retryable: None,
            retry_after_ms: None,
        }
    }
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_deref().map(|c| format!(" {}", c)).unwrap_or_default()
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Order to submit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub symbol: String,
    pub client_order_id: String,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub amount: Decimal,
}

/// A fill reported by the venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fill {
    pub trade_id: String,
    pub price: Decimal,
    pub amount: Decimal,
    pub fee: Decimal,
    pub fee_asset: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Venue view of an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeOrder {
    pub client_order_id: String,
    pub exchange_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub amount: Decimal,
    pub status: OrderStatus,
    pub filled_amount: Decimal,
    pub avg_fill_price: Option<Decimal>,
    #[serde(default)]
    pub fills: Vec<Fill>,
    pub updated_at: DateTime<Utc>,
}

impl ExchangeOrder {
    /// Local order record, preserving `created_at` from an earlier copy
    pub fn to_order(&self, bot_id: Uuid, created_at: Option<DateTime<Utc>>) -> Order {
        Order {
            client_order_id: self.client_order_id.clone(),
            exchange_order_id: Some(self.exchange_order_id.clone()),
            bot_id,
            symbol: self.symbol.clone(),
            side: self.side,
            order_type: self.order_type,
            price: self.price,
            amount: self.amount,
            status: self.status,
            filled_amount: self.filled_amount,
            avg_fill_price: self.avg_fill_price,
            created_at: created_at.unwrap_or(self.updated_at),
            updated_at: self.updated_at,
        }
    }

    pub fn trades(&self, bot_id: Uuid) -> Vec<Trade> {
        self.fills
            .iter()
            .map(|fill| Trade {
                trade_id: fill.trade_id.clone(),
                bot_id: Some(bot_id),
                order_id: Some(self.exchange_order_id.clone()),
                client_order_id: Some(self.client_order_id.clone()),
                symbol: self.symbol.clone(),
                side: self.side,
                price: fill.price,
                amount: fill.amount,
                fee: fill.fee,
                fee_asset: fill.fee_asset.clone(),
                timestamp: fill.timestamp,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

impl AssetBalance {
    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }
}

/// Capability interface every venue adapter implements
#[async_trait]
pub trait TradingExecutor: Send + Sync {
    /// Adapter name for logs
    fn name(&self) -> &str;

    /// Submit an order. Idempotent on `client_order_id`.
    async fn place_order(&self, request: OrderRequest) -> ExchangeResult<ExchangeOrder>;

    async fn cancel_order(&self, symbol: &str, client_order_id: &str)
        -> ExchangeResult<ExchangeOrder>;

    /// `Ok(None)` when the venue has no order with this id
    async fn fetch_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> ExchangeResult<Option<ExchangeOrder>>;

    async fn fetch_open_orders(&self, symbol: &str) -> ExchangeResult<Vec<ExchangeOrder>>;

    async fn fetch_balance(&self) -> ExchangeResult<Vec<AssetBalance>>;
}

/// Bound an exchange call; expiry surfaces as a transient `Timeout`
pub async fn with_timeout<T, F>(limit: Duration, what: &str, fut: F) -> ExchangeResult<T>
where
    F: Future<Output = ExchangeResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ExchangeError::Timeout(format!(
            "{} exceeded {}ms",
            what,
            limit.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_maps_elapsed() {
        let result: ExchangeResult<()> =
            with_timeout(Duration::from_millis(5), "place_order", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ExchangeError::Timeout(_))));
    }

    #[test]
    fn test_venue_error_display() {
        let err = ExchangeError::venue(Some("-1021"), "timestamp outside recvWindow");
        assert_eq!(err.to_string(), "venue error -1021: timestamp outside recvWindow");
        let err = ExchangeError::venue(None, "boom");
        assert_eq!(err.to_string(), "venue error: boom");
    }

    #[test]
    fn test_order_conversion_keeps_fills() {
        let now = Utc::now();
        let bot_id = Uuid::new_v4();
        let order = ExchangeOrder {
            client_order_id: "gbot-12345678-1".into(),
            exchange_order_id: "42".into(),
            symbol: "BTC/USDT".into(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            price: Some(Decimal::from(100)),
            amount: Decimal::ONE,
            status: OrderStatus::Filled,
            filled_amount: Decimal::ONE,
            avg_fill_price: Some(Decimal::from(100)),
            fills: vec![Fill {
                trade_id: "t-1".into(),
                price: Decimal::from(100),
                amount: Decimal::ONE,
                fee: Decimal::ZERO,
                fee_asset: None,
                timestamp: now,
            }],
            updated_at: now,
        };
        let local = order.to_order(bot_id, None);
        assert_eq!(local.exchange_order_id.as_deref(), Some("42"));
        let trades = order.trades(bot_id);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].client_order_id.as_deref(), Some("gbot-12345678-1"));
    }
}
