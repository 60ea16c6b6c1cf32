//! Grid Engine
//!
//! Tick-driven execution engine for unattended grid-trading bots: bot
//! lifecycle, risk gates, idempotent order placement, and classified retry
//! against a paper or live exchange.

pub mod auto_close;
pub mod config;
pub mod decimal;
pub mod executor;
pub mod factory;
pub mod gates;
pub mod idempotency;
pub mod lifecycle;
pub mod live;
pub mod market;
pub mod models;
pub mod paper;
pub mod retry;
pub mod runner;
pub mod secrets;
pub mod store;
pub mod strategy;

// Re-export main types for convenience
pub use config::{GatewayConfig, SecretsConfig, Settings, WorkerConfig};
pub use executor::{
    AssetBalance, ExchangeError, ExchangeOrder, ExchangeResult, Fill, OrderRequest,
    TradingExecutor,
};
pub use factory::{Connector, ExecutorFactory, FactoryError, PaperConnector};
pub use gates::{GateCode, GateContext, GateResult};
pub use lifecycle::{BotEvent, BotTransition, TransitionError};
pub use live::{RestConnector, RestExecutor};
pub use market::{MarketData, MarketInfo, PriceClient, Ticker};
pub use models::{
    Bot, BotRuntime, BotStatus, ExchangeAccount, LastError, NewBot, Order, OrderSide,
    OrderStatus, OrderType, Trade, TradingMode,
};
pub use paper::{PaperAccount, PaperExchange, PaperOp};
pub use retry::{BackoffPolicy, ErrorClass};
pub use runner::{Engine, EngineError, Outcome, TickReport};
pub use secrets::{CredentialDecryptor, CredentialError, Credentials, SecretsManager};
pub use store::{AccountStore, BotStore, InMemoryStore, StoreError};
pub use strategy::StrategyConfig;
