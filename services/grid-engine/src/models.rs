//! Persisted records: bots, orders, trades, exchange accounts

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bot lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BotStatus {
    Draft,
    WaitingTrigger,
    Running,
    Paused,
    Stopping,
    Stopped,
    Error,
}

impl BotStatus {
    pub const ALL: [BotStatus; 7] = [
        BotStatus::Draft,
        BotStatus::WaitingTrigger,
        BotStatus::Running,
        BotStatus::Paused,
        BotStatus::Stopping,
        BotStatus::Stopped,
        BotStatus::Error,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, BotStatus::Stopped | BotStatus::Error)
    }

    /// States in which a tick may evaluate triggers and place orders
    pub fn is_actionable(self) -> bool {
        matches!(self, BotStatus::WaitingTrigger | BotStatus::Running)
    }
}

impl std::fmt::Display for BotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BotStatus::Draft => "DRAFT",
            BotStatus::WaitingTrigger => "WAITING_TRIGGER",
            BotStatus::Running => "RUNNING",
            BotStatus::Paused => "PAUSED",
            BotStatus::Stopping => "STOPPING",
            BotStatus::Stopped => "STOPPED",
            BotStatus::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

/// Machine-readable code plus message, stored as `"<CODE>: <message>"`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub code: String,
    pub message: String,
}

impl LastError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for LastError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Bot entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bot {
    pub id: Uuid,
    pub user_id: Uuid,
    pub exchange_account_id: Uuid,
    pub symbol: String,
    pub config: serde_json::Value,
    pub config_revision: i64,
    pub status: BotStatus,
    pub status_version: i64,
    pub run_id: Option<Uuid>,
    pub last_error: Option<String>,
    #[serde(flatten)]
    pub runtime: BotRuntime,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Engine-owned runtime fields persisted alongside the bot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BotRuntime {
    /// Last intent sequence the venue acknowledged; the next intent is +1
    pub last_intent_seq: i64,
    /// Price the next grid crossing is measured against
    pub anchor_price: Option<Decimal>,
    /// Ticker price captured when the current base was established
    pub reference_price: Option<Decimal>,
    /// Set once the auto-close detector fired for the current run
    pub auto_close_triggered_at: Option<DateTime<Utc>>,
}

/// Input for creating a bot (the API collaborator's side of the contract)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBot {
    pub user_id: Uuid,
    pub exchange_account_id: Uuid,
    pub symbol: String,
    pub config: serde_json::Value,
}

impl Bot {
    /// A fresh bot in DRAFT
    pub fn draft(input: NewBot) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: input.user_id,
            exchange_account_id: input.exchange_account_id,
            symbol: input.symbol,
            config: input.config,
            config_revision: 1,
            status: BotStatus::Draft,
            status_version: 0,
            run_id: None,
            last_error: None,
            runtime: BotRuntime::default(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    #[default]
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }
}

/// Exchange order owned by a bot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub bot_id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub amount: Decimal,
    pub status: OrderStatus,
    pub filled_amount: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fill event, append-only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub bot_id: Option<Uuid>,
    pub order_id: Option<String>,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub amount: Decimal,
    pub fee: Decimal,
    pub fee_asset: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    #[default]
    Paper,
    Live,
}

/// Exchange account a bot trades through
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeAccount {
    pub id: Uuid,
    pub user_id: Uuid,
    pub exchange: String,
    pub mode: TradingMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serde_names() {
        let json = serde_json::to_string(&BotStatus::WaitingTrigger).unwrap();
        assert_eq!(json, "\"WAITING_TRIGGER\"");
        assert_eq!(BotStatus::WaitingTrigger.to_string(), "WAITING_TRIGGER");
        let back: OrderStatus = serde_json::from_str("\"PARTIALLY_FILLED\"").unwrap();
        assert_eq!(back, OrderStatus::PartiallyFilled);
    }

    #[test]
    fn test_decimals_serialize_as_strings() {
        let rt = BotRuntime {
            last_intent_seq: 3,
            anchor_price: Some(Decimal::new(10001, 2)),
            ..Default::default()
        };
        let v = serde_json::to_value(&rt).unwrap();
        assert_eq!(v["anchor_price"], serde_json::json!("100.01"));
    }

    #[test]
    fn test_draft_defaults() {
        let bot = Bot::draft(NewBot {
            user_id: Uuid::new_v4(),
            exchange_account_id: Uuid::new_v4(),
            symbol: "BTC/USDT".into(),
            config: serde_json::json!({}),
        });
        assert_eq!(bot.status, BotStatus::Draft);
        assert_eq!(bot.status_version, 0);
        assert!(bot.run_id.is_none());
        assert_eq!(bot.runtime.last_intent_seq, 0);
    }

    #[test]
    fn test_last_error_display() {
        let e = LastError::new("AUTO_CLOSE_TRIGGERED", "drawdown 5.00%");
        assert_eq!(e.to_string(), "AUTO_CLOSE_TRIGGERED: drawdown 5.00%");
    }
}
