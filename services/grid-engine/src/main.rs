//! Grid Engine worker
//!
//! Runs the reconciliation loop in a single process:
//! 1. Loads settings (file + `GRID_ENGINE__*` environment)
//! 2. Seeds accounts, markets and bots from a YAML file
//! 3. Ticks every bot until Ctrl-C
//!
//! Paper accounts trade against the in-process simulator; live accounts go
//! through the exchange gateway when `gateway.base_url` is configured.

use anyhow::Context;
use rand::Rng;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use grid_engine::{
    Bot, BotEvent, BotStore, Engine, ExchangeAccount, ExecutorFactory, InMemoryStore, MarketData,
    MarketInfo, NewBot, PaperConnector, PaperExchange, PriceClient, RestConnector,
    SecretsManager, Settings, TradingMode,
};

pub const SEED_PATH_ENV: &str = "GRID_ENGINE_SEED";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Grid Engine...");

    let settings = Settings::load().context("loading settings")?;
    info!(
        interval_ms = settings.worker.interval_ms,
        max_bots_per_tick = settings.worker.max_bots_per_tick,
        live_gateway = settings.gateway.base_url.is_some(),
        "Settings loaded"
    );

    let secrets = match &settings.secrets.encryption_key {
        Some(key) => SecretsManager::from_hex(key)?,
        None => SecretsManager::from_env()?,
    };
    if !secrets.is_encryption_active() {
        warn!("No encryption key configured; live accounts cannot decrypt credentials");
    }

    let store = Arc::new(InMemoryStore::new());
    let paper = Arc::new(PaperExchange::new());

    let mut factory = ExecutorFactory::new(
        store.clone(),
        Arc::new(secrets),
        Arc::new(PaperConnector::new(paper.clone())),
        settings.worker.provider_cache_max_size,
    );
    if let Some(url) = &settings.gateway.base_url {
        factory = factory.with_live(Arc::new(RestConnector::new(
            url.clone(),
            settings.gateway.timeout(),
        )));
    }

    let market: Arc<dyn MarketData> = match &settings.gateway.price_url {
        Some(url) => Arc::new(PriceClient::new(url, settings.gateway.timeout())?),
        None => paper.clone(),
    };

    let engine = Engine::new(
        store.clone(),
        market,
        Arc::new(factory),
        settings.worker,
        settings.retry,
    );

    let seed_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(SEED_PATH_ENV).ok())
        .map(PathBuf::from);
    let walk = match seed_path {
        Some(path) => {
            let seed = Seed::load(&path)?;
            let walk = seed.price_walk_bps;
            let markets = seed.apply(&store, &paper, &engine).await?;
            walk.map(|bps| (bps, markets))
        }
        None => {
            warn!("No seed file given; the engine will only tick existing bots");
            None
        }
    };

    if let Some((bps, symbols)) = walk {
        let paper = paper.clone();
        let every = settings.worker.interval();
        tokio::spawn(async move { walk_prices(paper, symbols, bps, every).await });
    }

    engine
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await;

    info!("Grid Engine stopped");
    Ok(())
}

/// Bootstrap data for a paper run
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Seed {
    #[serde(default)]
    accounts: Vec<SeedAccount>,
    #[serde(default)]
    markets: Vec<SeedMarket>,
    #[serde(default)]
    bots: Vec<SeedBot>,
    /// Random-walk paper prices by up to this many basis points per tick
    #[serde(default)]
    price_walk_bps: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeedAccount {
    name: String,
    #[serde(default = "default_exchange")]
    exchange: String,
    #[serde(default)]
    mode: TradingMode,
    #[serde(default)]
    credential_blob: Option<String>,
    #[serde(default)]
    balances: HashMap<String, Decimal>,
}

fn default_exchange() -> String {
    "paper".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeedMarket {
    #[serde(flatten)]
    info: MarketInfo,
    price: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeedBot {
    account: String,
    symbol: String,
    config: serde_json::Value,
    #[serde(default)]
    start: bool,
}

impl Seed {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading seed file {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parsing seed file {}", path.display()))
    }

    /// Returns the seeded market symbols
    async fn apply(
        self,
        store: &InMemoryStore,
        paper: &PaperExchange,
        engine: &Engine,
    ) -> anyhow::Result<Vec<String>> {
        let mut accounts = HashMap::new();
        for seed in self.accounts {
            let account = ExchangeAccount {
                id: Uuid::new_v4(),
                user_id: Uuid::nil(),
                exchange: seed.exchange,
                mode: seed.mode,
            };
            for (asset, free) in &seed.balances {
                paper.set_balance(account.id, asset, *free).await;
            }
            info!(account = %seed.name, account_id = %account.id, mode = ?account.mode, "Seeded account");
            accounts.insert(seed.name, account.clone());
            store.put_account(account, seed.credential_blob).await;
        }

        let mut symbols = Vec::new();
        for market in self.markets {
            paper.set_price(&market.info.symbol, market.price).await;
            symbols.push(market.info.symbol.clone());
            paper.set_market(market.info).await;
        }

        for seed in self.bots {
            let account = accounts
                .get(&seed.account)
                .with_context(|| format!("bot references unknown account {}", seed.account))?;
            let bot = store
                .insert_bot(Bot::draft(NewBot {
                    user_id: account.user_id,
                    exchange_account_id: account.id,
                    symbol: seed.symbol,
                    config: seed.config,
                }))
                .await?;
            info!(bot_id = %bot.id, symbol = %bot.symbol, "Seeded bot");
            if seed.start {
                engine.dispatch(bot.id, BotEvent::Start, bot.status_version).await?;
            }
        }
        Ok(symbols)
    }
}

/// Keep paper prices moving so grids have something to trade
async fn walk_prices(paper: Arc<PaperExchange>, symbols: Vec<String>, bps: u32, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    let mut last: HashMap<String, Decimal> = HashMap::new();
    loop {
        ticker.tick().await;
        for symbol in &symbols {
            let current = match last.get(symbol) {
                Some(p) => *p,
                None => match paper.get_ticker(symbol).await {
                    Ok(t) => t.last_price,
                    Err(_) => continue,
                },
            };
            let step = rand::thread_rng().gen_range(-(bps as i64)..=bps as i64);
            let next = current + current * Decimal::new(step, 4);
            if next > Decimal::ZERO {
                paper.set_price(symbol, next).await;
                last.insert(symbol.clone(), next);
            }
        }
    }
}
