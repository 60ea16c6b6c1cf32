//! Market data port and the REST price client

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode, Url};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::decimal::{self, DecimalError};
use crate::executor::ExchangeError;

#[derive(Debug, thiserror::Error)]
pub enum MarketError {
    #[error("no market data for {0}")]
    Unavailable(String),

    #[error("market data request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("market data request returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("bad market data url: {0}")]
    Url(String),

    #[error(transparent)]
    Price(#[from] DecimalError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last_price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Trading rules for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketInfo {
    pub symbol: String,
    pub base: String,
    pub quote: String,
    pub price_precision: u32,
    pub amount_precision: u32,
    #[serde(default)]
    pub min_amount: Decimal,
    #[serde(default)]
    pub min_notional: Option<Decimal>,
}

impl MarketInfo {
    /// Market with no size minimums
    pub fn spot(symbol: &str, price_precision: u32, amount_precision: u32) -> Self {
        let (base, quote) = split_symbol(symbol);
        Self {
            symbol: symbol.to_string(),
            base,
            quote,
            price_precision,
            amount_precision,
            min_amount: Decimal::ZERO,
            min_notional: None,
        }
    }
}

/// "BTC/USDT" -> ("BTC", "USDT"). A symbol without a separator is all base.
pub fn split_symbol(symbol: &str) -> (String, String) {
    match symbol.split_once('/') {
        Some((b, q)) => (b.to_string(), q.to_string()),
        None => (symbol.to_string(), String::new()),
    }
}

#[async_trait]
pub trait MarketData: Send + Sync {
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, MarketError>;
    async fn get_market_info(&self, symbol: &str) -> Result<MarketInfo, MarketError>;
}

/// Price feed over HTTP (`GET /prices/{symbol}`, `GET /markets/{symbol}`)
pub struct PriceClient {
    client: Client,
    base_url: Url,
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    symbol: String,
    price: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

impl PriceClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, MarketError> {
        let client = Client::builder().timeout(timeout).build()?;
        let base_url = Url::parse(base_url).map_err(|e| MarketError::Url(e.to_string()))?;
        Ok(Self { client, base_url })
    }

    fn url(&self, collection: &str, symbol: &str) -> Result<Url, MarketError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| MarketError::Url(self.base_url.to_string()))?
            .pop_if_empty()
            .push(collection)
            .push(symbol);
        Ok(url)
    }

    async fn get(&self, url: Url, symbol: &str) -> Result<reqwest::Response, MarketError> {
        debug!(%url, "Fetching market data");
        let response = self.client.get(url).send().await?;
        match response.status() {
            s if s.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(MarketError::Unavailable(symbol.to_string())),
            s => Err(MarketError::Status {
                status: s.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

#[async_trait]
impl MarketData for PriceClient {
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, MarketError> {
        let url = self.url("prices", symbol)?;
        let data: PriceResponse = self.get(url, symbol).await?.json().await?;
        let last_price = decimal::parse_positive("price", &data.price)?;
        Ok(Ticker {
            symbol: data.symbol,
            last_price,
            timestamp: data.timestamp.unwrap_or_else(Utc::now),
        })
    }

    async fn get_market_info(&self, symbol: &str) -> Result<MarketInfo, MarketError> {
        let url = self.url("markets", symbol)?;
        Ok(self.get(url, symbol).await?.json().await?)
    }
}
