//! Live REST executor
//!
//! Talks to an exchange gateway that exposes every venue through one JSON
//! protocol:
//!
//! | call | route |
//! |---|---|
//! | place | `POST /orders` |
//! | cancel | `DELETE /orders/{clientOrderId}?symbol=` |
//! | fetch | `GET /orders/{clientOrderId}?symbol=` |
//! | open orders | `GET /orders?symbol=` |
//! | balances | `GET /balances` |
//!
//! Requests are signed with HMAC-SHA256 over
//! `timestamp + METHOD + path?query + body`.

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::executor::{
    AssetBalance, ExchangeError, ExchangeOrder, ExchangeResult, OrderRequest, TradingExecutor,
};
use crate::factory::{Connector, FactoryError};
use crate::models::ExchangeAccount;
use crate::secrets::Credentials;

type HmacSha256 = Hmac<Sha256>;

pub const API_KEY_HEADER: &str = "X-API-KEY";
pub const TIMESTAMP_HEADER: &str = "X-TIMESTAMP";
pub const SIGNATURE_HEADER: &str = "X-SIGNATURE";
pub const EXCHANGE_HEADER: &str = "X-EXCHANGE";

/// Error body the gateway returns on non-2xx responses
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GatewayError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    retryable: Option<bool>,
}

pub struct RestExecutor {
    http: Client,
    base_url: Url,
    exchange: String,
    credentials: Credentials,
}

impl RestExecutor {
    pub fn new(
        base_url: &str,
        exchange: &str,
        credentials: Credentials,
        timeout: Duration,
    ) -> ExchangeResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExchangeError::Network(e.to_string()))?;
        let base_url = Url::parse(base_url)
            .map_err(|e| ExchangeError::BadRequest(format!("gateway url: {}", e)))?;
        Ok(Self {
            http,
            base_url,
            exchange: exchange.to_string(),
            credentials,
        })
    }

    fn url(&self, segments: &[&str], query: &[(&str, &str)]) -> ExchangeResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ExchangeError::BadRequest("gateway url cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    fn sign(&self, payload: &str) -> ExchangeResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.credentials.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Auth(format!("signing key: {}", e)))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<String>,
    ) -> ExchangeResult<Response> {
        let timestamp = Utc::now().timestamp_millis();
        let target = match url.query() {
            Some(q) => format!("{}?{}", url.path(), q),
            None => url.path().to_string(),
        };
        let body = body.unwrap_or_default();
        let signature = self.sign(&format!("{}{}{}{}", timestamp, method, target, body))?;

        debug!(method = %method, target = %target, exchange = %self.exchange, "Gateway request");
        let mut request = self
            .http
            .request(method, url)
            .header(API_KEY_HEADER, &self.credentials.api_key)
            .header(TIMESTAMP_HEADER, timestamp.to_string())
            .header(SIGNATURE_HEADER, signature)
            .header(EXCHANGE_HEADER, &self.exchange);
        if !body.is_empty() {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }
        request.send().await.map_err(transport_error)
    }

    async fn read<T: DeserializeOwned>(response: Response) -> ExchangeResult<T> {
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ExchangeError::venue(None, format!("invalid gateway response: {}", e)))
    }
}

fn transport_error(err: reqwest::Error) -> ExchangeError {
    if err.is_timeout() {
        ExchangeError::Timeout(err.to_string())
    } else {
        ExchangeError::Network(err.to_string())
    }
}

/// `Retry-After` in whole or fractional seconds
fn retry_after_ms(response: &Response) -> Option<u64> {
    let raw = response.headers().get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    let secs: f64 = raw.trim().parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| (secs * 1000.0).round() as u64)
}

async fn status_error(response: Response) -> ExchangeError {
    let status = response.status();
    let retry_after = retry_after_ms(&response);
    let text = response.text().await.unwrap_or_default();
    let body: GatewayError = serde_json::from_str(&text).unwrap_or_default();
    let message = body.message.clone().unwrap_or_else(|| {
        if text.is_empty() {
            status.to_string()
        } else {
            text.clone()
        }
    });

    match status {
        StatusCode::TOO_MANY_REQUESTS => ExchangeError::RateLimited {
            message,
            retry_after_ms: retry_after,
        },
        s if s.is_server_error() => ExchangeError::Server {
            status: s.as_u16(),
            message,
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ExchangeError::Auth(message),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            let code = body.code.as_deref().unwrap_or_default().to_lowercase();
            if code.contains("insufficient") || message.to_lowercase().contains("insufficient") {
                ExchangeError::InsufficientFunds(message)
            } else {
                ExchangeError::BadRequest(message)
            }
        }
        StatusCode::NOT_FOUND => ExchangeError::OrderNotFound(message),
        _ => ExchangeError::Venue {
            code: body.code,
            message,
            retryable: body.retryable,
            retry_after_ms: retry_after,
        },
    }
}

#[async_trait]
impl TradingExecutor for RestExecutor {
    fn name(&self) -> &str {
        &self.exchange
    }

    async fn place_order(&self, request: OrderRequest) -> ExchangeResult<ExchangeOrder> {
        let body = serde_json::to_string(&request)
            .map_err(|e| ExchangeError::BadRequest(e.to_string()))?;
        let url = self.url(&["orders"], &[])?;
        Self::read(self.send(Method::POST, url, Some(body)).await?).await
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> ExchangeResult<ExchangeOrder> {
        let url = self.url(&["orders", client_order_id], &[("symbol", symbol)])?;
        Self::read(self.send(Method::DELETE, url, None).await?).await
    }

    async fn fetch_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> ExchangeResult<Option<ExchangeOrder>> {
        let url = self.url(&["orders", client_order_id], &[("symbol", symbol)])?;
        let response = self.send(Method::GET, url, None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::read(response).await.map(Some)
    }

    async fn fetch_open_orders(&self, symbol: &str) -> ExchangeResult<Vec<ExchangeOrder>> {
        let url = self.url(&["orders"], &[("symbol", symbol)])?;
        Self::read(self.send(Method::GET, url, None).await?).await
    }

    async fn fetch_balance(&self) -> ExchangeResult<Vec<AssetBalance>> {
        let url = self.url(&["balances"], &[])?;
        Self::read(self.send(Method::GET, url, None).await?).await
    }
}

/// Builds a [`RestExecutor`] for live accounts
pub struct RestConnector {
    base_url: String,
    timeout: Duration,
}

impl RestConnector {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Connector for RestConnector {
    async fn connect(
        &self,
        account: &ExchangeAccount,
        credentials: Option<Credentials>,
    ) -> Result<Arc<dyn TradingExecutor>, FactoryError> {
        let credentials = credentials.ok_or(FactoryError::MissingCredentials(account.id))?;
        let executor =
            RestExecutor::new(&self.base_url, &account.exchange, credentials, self.timeout)
                .map_err(|e| {
                    warn!(account_id = %account.id, error = %e, "Gateway executor construction failed");
                    FactoryError::Connect(e.to_string())
                })?;
        Ok(Arc::new(executor))
    }
}
