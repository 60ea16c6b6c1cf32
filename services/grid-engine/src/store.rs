//! Storage port and the in-memory store

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::lifecycle::{self, BotTransition};
use crate::models::{Bot, BotRuntime, BotStatus, ExchangeAccount, Order, Trade};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("a bot for account {exchange_account_id} on {symbol} already exists")]
    Conflict {
        exchange_account_id: Uuid,
        symbol: String,
    },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("stale status version for bot {bot_id}: expected {expected}, found {actual}")]
    StaleVersion {
        bot_id: Uuid,
        expected: i64,
        actual: i64,
    },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    fn bot_not_found(id: Uuid) -> Self {
        StoreError::NotFound {
            entity: "bot",
            id: id.to_string(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait BotStore: Send + Sync {
    /// Fails with `Conflict` when a live bot already trades the same
    /// (exchange account, symbol) pair
    async fn insert_bot(&self, bot: Bot) -> StoreResult<Bot>;

    /// Soft-deleted bots are not returned
    async fn get_bot(&self, id: Uuid) -> StoreResult<Option<Bot>>;

    /// Live bots in any of `statuses`, ordered by id, strictly after `after`
    async fn list_bots(
        &self,
        statuses: &[BotStatus],
        after: Option<Uuid>,
        limit: usize,
    ) -> StoreResult<Vec<Bot>>;

    /// Compare-and-set on `status_version`
    async fn apply_transition(
        &self,
        bot_id: Uuid,
        expected_version: i64,
        transition: &BotTransition,
    ) -> StoreResult<Bot>;

    async fn update_runtime(&self, bot_id: Uuid, runtime: &BotRuntime) -> StoreResult<Bot>;

    /// Replace the strategy blob and bump `config_revision`
    async fn update_config(&self, bot_id: Uuid, config: serde_json::Value) -> StoreResult<Bot>;

    async fn soft_delete_bot(&self, bot_id: Uuid) -> StoreResult<()>;

    /// Insert or replace by (bot, client order id), keeping the first `created_at`
    async fn upsert_order(&self, order: Order) -> StoreResult<()>;

    async fn get_order(&self, bot_id: Uuid, client_order_id: &str) -> StoreResult<Option<Order>>;

    async fn list_orders(&self, bot_id: Uuid, open_only: bool) -> StoreResult<Vec<Order>>;

    /// Append a trade. Returns false when the trade id was already recorded.
    async fn insert_trade(&self, trade: Trade) -> StoreResult<bool>;

    async fn list_trades(&self, bot_id: Uuid) -> StoreResult<Vec<Trade>>;
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get_account(&self, id: Uuid) -> StoreResult<Option<ExchangeAccount>>;

    /// Encrypted credential blob, if the account has one
    async fn load_credential_blob(&self, id: Uuid) -> StoreResult<Option<String>>;
}

#[derive(Debug, Default)]
struct Tables {
    bots: BTreeMap<Uuid, Bot>,
    orders: HashMap<(Uuid, String), Order>,
    trades: Vec<Trade>,
    trade_ids: HashSet<String>,
    accounts: HashMap<Uuid, ExchangeAccount>,
    credential_blobs: HashMap<Uuid, String>,
}

impl Tables {
    fn live_bot_mut(&mut self, id: Uuid) -> StoreResult<&mut Bot> {
        self.bots
            .get_mut(&id)
            .filter(|b| !b.is_deleted())
            .ok_or_else(|| StoreError::bot_not_found(id))
    }
}

/// Process-local store backing the paper binary and the test harness
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_account(&self, account: ExchangeAccount, credential_blob: Option<String>) {
        let mut tables = self.tables.write().await;
        match credential_blob {
            Some(blob) => {
                tables.credential_blobs.insert(account.id, blob);
            }
            None => {
                tables.credential_blobs.remove(&account.id);
            }
        }
        tables.accounts.insert(account.id, account);
    }
}

#[async_trait]
impl BotStore for InMemoryStore {
    async fn insert_bot(&self, bot: Bot) -> StoreResult<Bot> {
        let mut tables = self.tables.write().await;
        let taken = tables.bots.values().any(|b| {
            !b.is_deleted()
                && b.exchange_account_id == bot.exchange_account_id
                && b.symbol == bot.symbol
        });
        if taken {
            return Err(StoreError::Conflict {
                exchange_account_id: bot.exchange_account_id,
                symbol: bot.symbol,
            });
        }
        debug!(bot_id = %bot.id, symbol = %bot.symbol, "Bot inserted");
        tables.bots.insert(bot.id, bot.clone());
        Ok(bot)
    }

    async fn get_bot(&self, id: Uuid) -> StoreResult<Option<Bot>> {
        let tables = self.tables.read().await;
        Ok(tables.bots.get(&id).filter(|b| !b.is_deleted()).cloned())
    }

    async fn list_bots(
        &self,
        statuses: &[BotStatus],
        after: Option<Uuid>,
        limit: usize,
    ) -> StoreResult<Vec<Bot>> {
        let tables = self.tables.read().await;
        let range = match after {
            Some(cursor) => tables
                .bots
                .range((std::ops::Bound::Excluded(cursor), std::ops::Bound::Unbounded)),
            None => tables.bots.range(..),
        };
        Ok(range
            .map(|(_, b)| b)
            .filter(|b| !b.is_deleted() && statuses.contains(&b.status))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn apply_transition(
        &self,
        bot_id: Uuid,
        expected_version: i64,
        transition: &BotTransition,
    ) -> StoreResult<Bot> {
        let mut tables = self.tables.write().await;
        let bot = tables.live_bot_mut(bot_id)?;
        if bot.status_version != expected_version || bot.status != transition.from {
            return Err(StoreError::StaleVersion {
                bot_id,
                expected: expected_version,
                actual: bot.status_version,
            });
        }
        lifecycle::apply(bot, transition);
        Ok(bot.clone())
    }

    async fn update_runtime(&self, bot_id: Uuid, runtime: &BotRuntime) -> StoreResult<Bot> {
        let mut tables = self.tables.write().await;
        let bot = tables.live_bot_mut(bot_id)?;
        bot.runtime = runtime.clone();
        bot.updated_at = Utc::now();
        Ok(bot.clone())
    }

    async fn update_config(&self, bot_id: Uuid, config: serde_json::Value) -> StoreResult<Bot> {
        let mut tables = self.tables.write().await;
        let bot = tables.live_bot_mut(bot_id)?;
        bot.config = config;
        bot.config_revision += 1;
        bot.updated_at = Utc::now();
        Ok(bot.clone())
    }

    async fn soft_delete_bot(&self, bot_id: Uuid) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let bot = tables.live_bot_mut(bot_id)?;
        let now = Utc::now();
        bot.deleted_at = Some(now);
        bot.updated_at = now;
        Ok(())
    }

    async fn upsert_order(&self, mut order: Order) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let key = (order.bot_id, order.client_order_id.clone());
        if let Some(existing) = tables.orders.get(&key) {
            order.created_at = existing.created_at;
        }
        tables.orders.insert(key, order);
        Ok(())
    }

    async fn get_order(&self, bot_id: Uuid, client_order_id: &str) -> StoreResult<Option<Order>> {
        let tables = self.tables.read().await;
        Ok(tables
            .orders
            .get(&(bot_id, client_order_id.to_string()))
            .cloned())
    }

    async fn list_orders(&self, bot_id: Uuid, open_only: bool) -> StoreResult<Vec<Order>> {
        let tables = self.tables.read().await;
        let mut orders: Vec<Order> = tables
            .orders
            .values()
            .filter(|o| o.bot_id == bot_id && (!open_only || !o.status.is_terminal()))
            .cloned()
            .collect();
        orders.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.client_order_id.cmp(&b.client_order_id))
        });
        Ok(orders)
    }

    async fn insert_trade(&self, trade: Trade) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        if !tables.trade_ids.insert(trade.trade_id.clone()) {
            return Ok(false);
        }
        tables.trades.push(trade);
        Ok(true)
    }

    async fn list_trades(&self, bot_id: Uuid) -> StoreResult<Vec<Trade>> {
        let tables = self.tables.read().await;
        Ok(tables
            .trades
            .iter()
            .filter(|t| t.bot_id == Some(bot_id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AccountStore for InMemoryStore {
    async fn get_account(&self, id: Uuid) -> StoreResult<Option<ExchangeAccount>> {
        Ok(self.tables.read().await.accounts.get(&id).cloned())
    }

    async fn load_credential_blob(&self, id: Uuid) -> StoreResult<Option<String>> {
        Ok(self.tables.read().await.credential_blobs.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{plan, BotEvent};
    use crate::models::{LastError, NewBot, OrderSide, OrderStatus, OrderType};
    use rust_decimal::Decimal;

    fn new_bot(account: Uuid, symbol: &str) -> Bot {
        Bot::draft(NewBot {
            user_id: Uuid::new_v4(),
            exchange_account_id: account,
            symbol: symbol.into(),
            config: serde_json::json!({}),
        })
    }

    #[tokio::test]
    async fn test_pair_uniqueness() {
        let store = InMemoryStore::new();
        let account = Uuid::new_v4();
        let first = store.insert_bot(new_bot(account, "BTC/USDT")).await.unwrap();

        let dup = store.insert_bot(new_bot(account, "BTC/USDT")).await.unwrap_err();
        assert!(matches!(dup, StoreError::Conflict { .. }));

        store.insert_bot(new_bot(account, "ETH/USDT")).await.unwrap();
        store.insert_bot(new_bot(Uuid::new_v4(), "BTC/USDT")).await.unwrap();

        store.soft_delete_bot(first.id).await.unwrap();
        assert!(store.get_bot(first.id).await.unwrap().is_none());
        store.insert_bot(new_bot(account, "BTC/USDT")).await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_version_rejected() {
        let store = InMemoryStore::new();
        let bot = store.insert_bot(new_bot(Uuid::new_v4(), "BTC/USDT")).await.unwrap();
        let t = plan(&bot, BotEvent::Start, None).unwrap();

        let updated = store.apply_transition(bot.id, 0, &t).await.unwrap();
        assert_eq!(updated.status, BotStatus::WaitingTrigger);
        assert_eq!(updated.status_version, 1);

        let err = store.apply_transition(bot.id, 0, &t).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::StaleVersion {
                bot_id: bot.id,
                expected: 0,
                actual: 1
            }
        );
    }

    #[tokio::test]
    async fn test_stale_auto_close_leaves_runtime_untouched() {
        let store = InMemoryStore::new();
        let mut bot = new_bot(Uuid::new_v4(), "BTC/USDT");
        bot.status = BotStatus::Running;
        let bot = store.insert_bot(bot).await.unwrap();

        let reason = LastError::new("AUTO_CLOSE_TRIGGERED", "drawdown 6.00% >= 5%");
        let mut t = plan(&bot, BotEvent::RiskTriggered, Some(&reason)).unwrap();
        t.auto_close_triggered = true;

        let err = store.apply_transition(bot.id, 7, &t).await.unwrap_err();
        assert!(matches!(err, StoreError::StaleVersion { .. }));
        let unchanged = store.get_bot(bot.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, BotStatus::Running);
        assert!(unchanged.runtime.auto_close_triggered_at.is_none());

        let stopping = store
            .apply_transition(bot.id, bot.status_version, &t)
            .await
            .unwrap();
        assert_eq!(stopping.status, BotStatus::Stopping);
        assert_eq!(stopping.runtime.auto_close_triggered_at, Some(t.at));
    }

    #[tokio::test]
    async fn test_list_bots_pages_by_id() {
        let store = InMemoryStore::new();
        let account = Uuid::new_v4();
        for i in 0..5 {
            let mut bot = new_bot(account, &format!("T{}/USDT", i));
            bot.status = BotStatus::Running;
            store.insert_bot(bot).await.unwrap();
        }
        store.insert_bot(new_bot(account, "DRAFT/USDT")).await.unwrap();

        let first = store.list_bots(&[BotStatus::Running], None, 3).await.unwrap();
        assert_eq!(first.len(), 3);
        let rest = store
            .list_bots(&[BotStatus::Running], first.last().map(|b| b.id), 3)
            .await
            .unwrap();
        assert_eq!(rest.len(), 2);
        assert!(first.iter().all(|a| rest.iter().all(|b| a.id < b.id)));
    }

    #[tokio::test]
    async fn test_trades_are_append_only() {
        let store = InMemoryStore::new();
        let bot_id = Uuid::new_v4();
        let trade = Trade {
            trade_id: "t-1".into(),
            bot_id: Some(bot_id),
            order_id: None,
            client_order_id: None,
            symbol: "BTC/USDT".into(),
            side: OrderSide::Buy,
            price: Decimal::from(100),
            amount: Decimal::ONE,
            fee: Decimal::ZERO,
            fee_asset: None,
            timestamp: Utc::now(),
        };
        assert!(store.insert_trade(trade.clone()).await.unwrap());
        assert!(!store.insert_trade(trade).await.unwrap());
        assert_eq!(store.list_trades(bot_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_order_upsert_keeps_created_at() {
        let store = InMemoryStore::new();
        let bot_id = Uuid::new_v4();
        let created = Utc::now() - chrono::Duration::minutes(5);
        let mut order = Order {
            client_order_id: "gbot-abcdefgh-1".into(),
            exchange_order_id: None,
            bot_id,
            symbol: "BTC/USDT".into(),
            side: OrderSide::Sell,
            order_type: OrderType::Limit,
            price: Some(Decimal::from(110)),
            amount: Decimal::ONE,
            status: OrderStatus::New,
            filled_amount: Decimal::ZERO,
            avg_fill_price: None,
            created_at: created,
            updated_at: created,
        };
        store.upsert_order(order.clone()).await.unwrap();
        order.status = OrderStatus::Filled;
        order.created_at = Utc::now();
        store.upsert_order(order).await.unwrap();

        let stored = store.get_order(bot_id, "gbot-abcdefgh-1").await.unwrap().unwrap();
        assert_eq!(stored.created_at, created);
        assert!(store.list_orders(bot_id, true).await.unwrap().is_empty());
        assert_eq!(store.list_orders(bot_id, false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_config_update_bumps_revision() {
        let store = InMemoryStore::new();
        let bot = store.insert_bot(new_bot(Uuid::new_v4(), "BTC/USDT")).await.unwrap();
        let updated = store
            .update_config(bot.id, serde_json::json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(updated.config_revision, 2);
    }
}
