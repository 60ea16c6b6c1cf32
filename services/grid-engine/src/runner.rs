//! Reconciliation loop
//!
//! Every tick picks up to `max_bots_per_tick` bots that may need work and
//! evaluates them concurrently. Each bot is processed under its own async
//! lock, so a tick and an operator command never interleave on one bot, and
//! each bot's failure stays with that bot.

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auto_close::{evaluate_auto_close, AutoCloseDecision, AutoCloseError, AutoCloseInput};
use crate::config::WorkerConfig;
use crate::decimal::{
    checked_product, checked_sum, ratio_percent, round_price, shift_down, shift_up, DecimalError,
};
use crate::executor::{with_timeout, ExchangeError, ExchangeOrder, OrderRequest, TradingExecutor};
use crate::factory::{ExecutorFactory, FactoryError};
use crate::gates::{evaluate_gates, GateCode, GateContext, GateResult};
use crate::idempotency::{generate_client_order_id, is_bot_order, is_our_order, IdempotencyError};
use crate::lifecycle::{plan, BotEvent, BotTransition, TransitionError};
use crate::market::{split_symbol, MarketData, MarketError, MarketInfo, Ticker};
use crate::models::{Bot, BotStatus, LastError, OrderSide, OrderType};
use crate::retry::{classify, compute_backoff, BackoffPolicy, PendingIntent, RetryBook};
use crate::store::{BotStore, StoreError};
use crate::strategy::{
    BasePriceType, ConfigError, SizingError, StrategyConfig, TriggerConfig,
};

/// Statuses a tick looks at
pub const TICK_STATUSES: [BotStatus; 3] = [
    BotStatus::WaitingTrigger,
    BotStatus::Running,
    BotStatus::Stopping,
];

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("bot {0} not found")]
    BotNotFound(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Market(#[from] MarketError),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error(transparent)]
    Factory(#[from] FactoryError),
    #[error(transparent)]
    Sizing(#[from] SizingError),
    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),
    #[error(transparent)]
    AutoClose(#[from] AutoCloseError),
    #[error(transparent)]
    Price(#[from] DecimalError),
}

/// What a tick did with one bot
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Not in a state that needs work
    Skipped,
    /// Price inside the band
    Idle,
    /// First observation of a run; the grid anchor was set
    Anchored { price: Decimal },
    Placed {
        client_order_id: String,
        side: OrderSide,
        amount: Decimal,
    },
    Blocked { code: GateCode, reason: String },
    RetryScheduled {
        client_order_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    /// A pending retry is not due yet
    RetryPending { client_order_id: String },
    Transitioned { event: BotEvent, to: BotStatus },
    /// Non-fatal failure; the bot is evaluated again next tick
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BotOutcome {
    pub bot_id: Uuid,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub outcomes: Vec<BotOutcome>,
}

impl TickReport {
    pub fn evaluated(&self) -> usize {
        self.outcomes.len()
    }

    pub fn outcome(&self, bot_id: Uuid) -> Option<&Outcome> {
        self.outcomes
            .iter()
            .find(|o| o.bot_id == bot_id)
            .map(|o| &o.outcome)
    }

    pub fn placed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.outcome, Outcome::Placed { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.outcome, Outcome::Failed { .. }))
            .count()
    }
}

/// Parsed strategy for one config revision
struct CachedConfig {
    revision: i64,
    config: Arc<StrategyConfig>,
}

pub struct Engine {
    store: Arc<dyn BotStore>,
    market: Arc<dyn MarketData>,
    factory: Arc<ExecutorFactory>,
    worker: WorkerConfig,
    retry_policy: BackoffPolicy,
    retries: Mutex<RetryBook>,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    configs: RwLock<HashMap<Uuid, CachedConfig>>,
    cursor: Mutex<Option<Uuid>>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn BotStore>,
        market: Arc<dyn MarketData>,
        factory: Arc<ExecutorFactory>,
        worker: WorkerConfig,
        retry_policy: BackoffPolicy,
    ) -> Self {
        Self {
            store,
            market,
            factory,
            worker,
            retry_policy,
            retries: Mutex::new(RetryBook::new()),
            locks: Mutex::new(HashMap::new()),
            configs: RwLock::new(HashMap::new()),
            cursor: Mutex::new(None),
        }
    }

    /// Tick on `interval_ms` until `shutdown` resolves
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(
            interval_ms = self.worker.interval_ms,
            max_bots_per_tick = self.worker.max_bots_per_tick,
            concurrency = self.worker.concurrency,
            "Engine starting"
        );
        let mut ticker = interval(self.worker.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let started = Instant::now();
                    let report = self.tick().await;
                    debug!(
                        evaluated = report.evaluated(),
                        placed = report.placed(),
                        failed = report.failed(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Tick complete"
                    );
                }
                _ = &mut shutdown => {
                    info!("Engine stopping");
                    break;
                }
            }
        }
    }

    /// One pass over the eligible bots
    pub async fn tick(&self) -> TickReport {
        let batch = match self.next_batch().await {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, "Failed to list bots");
                return TickReport::default();
            }
        };

        let outcomes = stream::iter(batch)
            .map(|bot_id| async move {
                // a panicking bot must not take the rest of the batch with it
                let outcome = match AssertUnwindSafe(self.process(bot_id)).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        error!(bot_id = %bot_id, "Bot evaluation panicked");
                        Outcome::Failed {
                            error: "evaluation panicked".to_string(),
                        }
                    }
                };
                BotOutcome { bot_id, outcome }
            })
            .buffer_unordered(self.worker.concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        TickReport { outcomes }
    }

    /// Apply a user or operator command
    pub async fn dispatch(
        &self,
        bot_id: Uuid,
        event: BotEvent,
        expected_version: i64,
    ) -> Result<Bot, EngineError> {
        let lock = self.bot_lock(bot_id).await;
        let _guard = lock.lock().await;

        let bot = self
            .store
            .get_bot(bot_id)
            .await?
            .ok_or(EngineError::BotNotFound(bot_id))?;
        if bot.status_version != expected_version {
            return Err(StoreError::StaleVersion {
                bot_id,
                expected: expected_version,
                actual: bot.status_version,
            }
            .into());
        }
        let reason = match event {
            BotEvent::KillSwitch => Some(LastError::new("KILL_SWITCH", "operator kill switch")),
            _ => None,
        };
        self.apply_event(&bot, event, reason.as_ref()).await
    }

    /// Round-robin window over the eligible bots
    async fn next_batch(&self) -> Result<Vec<Uuid>, StoreError> {
        let limit = self.worker.max_bots_per_tick.max(1);
        let mut cursor = self.cursor.lock().await;

        let mut batch = self.store.list_bots(&TICK_STATUSES, *cursor, limit).await?;
        if batch.len() < limit && cursor.is_some() {
            let wrapped = self
                .store
                .list_bots(&TICK_STATUSES, None, limit - batch.len())
                .await?;
            for bot in wrapped {
                if !batch.iter().any(|b| b.id == bot.id) {
                    batch.push(bot);
                }
            }
        }
        *cursor = batch.last().map(|b| b.id);
        Ok(batch.into_iter().map(|b| b.id).collect())
    }

    async fn bot_lock(&self, bot_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(bot_id).or_default())
    }

    async fn process(&self, bot_id: Uuid) -> Outcome {
        let lock = self.bot_lock(bot_id).await;
        let _guard = lock.lock().await;

        match self.evaluate(bot_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(bot_id = %bot_id, error = %e, "Bot evaluation failed");
                Outcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn evaluate(&self, bot_id: Uuid) -> Result<Outcome, EngineError> {
        // Re-read under the lock: a command may have landed since listing
        let Some(bot) = self.store.get_bot(bot_id).await? else {
            return Ok(Outcome::Skipped);
        };
        if bot.status == BotStatus::Stopping {
            return self.drain(&bot).await;
        }
        if !bot.status.is_actionable() {
            self.retries.lock().await.clear(&bot.id);
            return Ok(Outcome::Skipped);
        }

        let config = match self.strategy(&bot).await {
            Ok(config) => config,
            Err(e) => return self.fatal(&bot, e.code(), &e.to_string()).await,
        };
        let executor = match self.factory.get(bot.exchange_account_id).await {
            Ok(executor) => executor,
            Err(e) if e.is_fatal() => return self.fatal(&bot, e.code(), &e.to_string()).await,
            Err(e) => return Err(e.into()),
        };

        if bot.status == BotStatus::Running {
            if let Err(e) = self.reconcile(&bot, executor.as_ref()).await {
                warn!(bot_id = %bot.id, error = %e, "Order reconciliation failed");
            }
        }

        let ticker = self.ticker(&bot.symbol).await?;

        // drawdown protection still runs while an order waits out its backoff
        if bot.status == BotStatus::Running {
            if let Some(outcome) = self.check_auto_close(&bot, &config, &ticker).await? {
                return Ok(outcome);
            }
        }

        let pending = {
            let mut retries = self.retries.lock().await;
            match retries.take_due(&bot.id, Instant::now()) {
                Some(due) => Some(due),
                None => {
                    if let Some(waiting) = retries.get(&bot.id) {
                        return Ok(Outcome::RetryPending {
                            client_order_id: waiting.request.client_order_id.clone(),
                        });
                    }
                    None
                }
            }
        };
        if let Some(pending) = pending {
            return self.resume(&bot, executor.as_ref(), pending).await;
        }

        self.trade(bot, &config, executor.as_ref(), &ticker).await
    }

    async fn strategy(&self, bot: &Bot) -> Result<Arc<StrategyConfig>, ConfigError> {
        if let Some(cached) = self.configs.read().await.get(&bot.id) {
            if cached.revision == bot.config_revision {
                return Ok(Arc::clone(&cached.config));
            }
        }
        let config = Arc::new(StrategyConfig::from_value(&bot.config)?);
        debug!(bot_id = %bot.id, revision = bot.config_revision, "Parsed strategy config");
        self.configs.write().await.insert(
            bot.id,
            CachedConfig {
                revision: bot.config_revision,
                config: Arc::clone(&config),
            },
        );
        Ok(config)
    }

    fn call_timeout(&self) -> Duration {
        self.worker.exchange_call_timeout()
    }

    async fn ticker(&self, symbol: &str) -> Result<Ticker, MarketError> {
        let limit = self.call_timeout();
        match tokio::time::timeout(limit, self.market.get_ticker(symbol)).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Timeout(format!(
                "ticker exceeded {}ms",
                limit.as_millis()
            ))
            .into()),
        }
    }

    async fn market_info(&self, symbol: &str) -> Result<MarketInfo, MarketError> {
        let limit = self.call_timeout();
        match tokio::time::timeout(limit, self.market.get_market_info(symbol)).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Timeout(format!(
                "market info exceeded {}ms",
                limit.as_millis()
            ))
            .into()),
        }
    }

    /// Refresh stored open orders from the venue and append new fills
    async fn reconcile(
        &self,
        bot: &Bot,
        executor: &dyn TradingExecutor,
    ) -> Result<(), EngineError> {
        let bot_key = bot.id.to_string();
        for order in self.store.list_orders(bot.id, true).await? {
            let fetched = with_timeout(
                self.call_timeout(),
                "fetch_order",
                executor.fetch_order(&order.symbol, &order.client_order_id),
            )
            .await?;
            if let Some(remote) = fetched {
                self.record_order(bot, &remote).await?;
            }
        }

        let open = with_timeout(
            self.call_timeout(),
            "fetch_open_orders",
            executor.fetch_open_orders(&bot.symbol),
        )
        .await?;
        for remote in open {
            if !is_our_order(&remote.client_order_id) {
                debug!(
                    bot_id = %bot.id,
                    client_order_id = %remote.client_order_id,
                    "Ignoring order placed outside the engine"
                );
                continue;
            }
            if is_bot_order(&remote.client_order_id, &bot_key)
                && self
                    .store
                    .get_order(bot.id, &remote.client_order_id)
                    .await?
                    .is_none()
            {
                info!(bot_id = %bot.id, client_order_id = %remote.client_order_id, "Adopting untracked order");
                self.record_order(bot, &remote).await?;
            }
        }
        Ok(())
    }

    async fn record_order(&self, bot: &Bot, remote: &ExchangeOrder) -> Result<(), EngineError> {
        let created_at = self
            .store
            .get_order(bot.id, &remote.client_order_id)
            .await?
            .map(|o| o.created_at);
        self.store
            .upsert_order(remote.to_order(bot.id, created_at))
            .await?;
        for trade in remote.trades(bot.id) {
            let trade_id = trade.trade_id.clone();
            if self.store.insert_trade(trade).await? {
                debug!(bot_id = %bot.id, trade_id = %trade_id, "Trade recorded");
            }
        }
        Ok(())
    }

    async fn check_auto_close(
        &self,
        bot: &Bot,
        config: &StrategyConfig,
        ticker: &Ticker,
    ) -> Result<Option<Outcome>, EngineError> {
        let reference = bot.runtime.reference_price.map(|p| p.to_string());
        let last = ticker.last_price.to_string();
        let decision = match evaluate_auto_close(
            &config.trigger,
            &config.risk,
            &AutoCloseInput {
                ticker_reference: reference.as_deref(),
                last_price: Some(&last),
                triggered_at: bot.runtime.auto_close_triggered_at,
            },
        ) {
            Ok(decision) => decision,
            Err(AutoCloseError::Price(e @ DecimalError::Overflow { .. })) => {
                return self.fatal(bot, "INVALID_CONFIG", &e.to_string()).await.map(Some);
            }
            Err(e) => return Err(e.into()),
        };

        let AutoCloseDecision::Trigger {
            reference_price,
            last_price,
            drawdown_percent,
        } = decision
        else {
            return Ok(None);
        };

        warn!(
            bot_id = %bot.id,
            reference = %reference_price,
            last = %last_price,
            drawdown_percent = %drawdown_percent,
            "Auto-close triggered"
        );
        let reason = LastError::new(
            "AUTO_CLOSE_TRIGGERED",
            format!(
                "drawdown {}% from {} to {}",
                drawdown_percent, reference_price, last_price
            ),
        );
        let mut transition = plan(bot, BotEvent::RiskTriggered, Some(&reason))?;
        transition.auto_close_triggered = true;
        let updated = self.commit(bot, transition).await?;
        Ok(Some(Outcome::Transitioned {
            event: BotEvent::RiskTriggered,
            to: updated.status,
        }))
    }

    /// Grid trigger, gates, sizing and placement
    async fn trade(
        &self,
        mut bot: Bot,
        config: &StrategyConfig,
        executor: &dyn TradingExecutor,
        ticker: &Ticker,
    ) -> Result<Outcome, EngineError> {
        let last = ticker.last_price;

        let stored_anchor = bot.runtime.anchor_price;
        let anchor = match stored_anchor {
            Some(anchor) => anchor,
            None => {
                let base = match config.trigger.base_price_type {
                    BasePriceType::Manual => config.trigger.base_price.unwrap_or(last),
                    BasePriceType::Current => last,
                };
                let mut runtime = bot.runtime.clone();
                runtime.anchor_price = Some(base);
                runtime.reference_price = Some(last);
                bot = self.store.update_runtime(bot.id, &runtime).await?;
                info!(bot_id = %bot.id, anchor = %base, last = %last, "Grid anchored");
                if config.trigger.base_price_type == BasePriceType::Current {
                    return Ok(Outcome::Anchored { price: base });
                }
                base
            }
        };

        let (buy_at, sell_at) = match grid_band(anchor, &config.trigger) {
            Ok(band) => band,
            Err(e) => return self.fatal(&bot, "INVALID_CONFIG", &e.to_string()).await,
        };
        let side = if last <= buy_at {
            OrderSide::Buy
        } else if last >= sell_at {
            OrderSide::Sell
        } else {
            return Ok(Outcome::Idle);
        };

        if bot.status == BotStatus::WaitingTrigger {
            bot = self.apply_event(&bot, BotEvent::TriggerHit, None).await?;
        }

        let position_percent = if config.risk.tracks_position() {
            self.position_percent(&bot.symbol, executor, last).await?
        } else {
            None
        };
        let gate = evaluate_gates(
            &config.risk,
            &GateContext {
                side,
                current_price: last,
                position_percent,
            },
        );
        if let GateResult::Blocked { code, reason } = gate {
            info!(bot_id = %bot.id, side = %side, code = %code, reason = %reason, "Order blocked by gate");
            return Ok(Outcome::Blocked { code, reason });
        }

        let market = self.market_info(&bot.symbol).await?;
        let price = round_price(last, market.price_precision);
        let amount = match config.order.quantity_at(price, &market) {
            Ok(amount) => amount,
            Err(e) => return self.fatal(&bot, e.code(), &e.to_string()).await,
        };

        let intent_seq = bot.runtime.last_intent_seq + 1;
        let client_order_id = generate_client_order_id(&bot.id.to_string(), intent_seq)?;
        let request = OrderRequest {
            symbol: bot.symbol.clone(),
            client_order_id,
            side,
            order_type: config.order.order_type,
            price: match config.order.order_type {
                OrderType::Limit => Some(price),
                OrderType::Market => None,
            },
            amount,
        };
        info!(
            bot_id = %bot.id,
            client_order_id = %request.client_order_id,
            side = %side,
            amount = %amount,
            price = %price,
            anchor = %anchor,
            "Placing grid order"
        );

        let intent = PendingIntent {
            intent_seq,
            request,
            anchor_price: price,
            attempts: 0,
            ready_at: Instant::now(),
            last_error: String::new(),
        };
        self.submit(&bot, executor, intent).await
    }

    /// Base-asset share of the account's value in this market, in percent
    async fn position_percent(
        &self,
        symbol: &str,
        executor: &dyn TradingExecutor,
        price: Decimal,
    ) -> Result<Option<Decimal>, EngineError> {
        let (base, quote) = split_symbol(symbol);
        let balances =
            with_timeout(self.call_timeout(), "fetch_balance", executor.fetch_balance()).await?;
        let total = |asset: &str| {
            let held = balances
                .iter()
                .filter(|b| b.asset == asset)
                .flat_map(|b| [b.free, b.locked]);
            checked_sum("balance total", held)
        };
        let base_value = checked_product("position value", total(base.as_str())?, price)?;
        let account_value = checked_sum("account value", [base_value, total(quote.as_str())?])?;
        Ok(ratio_percent(base_value, account_value))
    }

    async fn submit(
        &self,
        bot: &Bot,
        executor: &dyn TradingExecutor,
        intent: PendingIntent,
    ) -> Result<Outcome, EngineError> {
        let placed = with_timeout(
            self.call_timeout(),
            "place_order",
            executor.place_order(intent.request.clone()),
        )
        .await;
        match placed {
            Ok(order) => self.acknowledge(bot, intent, order).await,
            Err(e) => self.fail_intent(bot, intent, e).await,
        }
    }

    /// Retry a failed intent with the same client order id, unless the
    /// venue already has it
    async fn resume(
        &self,
        bot: &Bot,
        executor: &dyn TradingExecutor,
        intent: PendingIntent,
    ) -> Result<Outcome, EngineError> {
        let existing = with_timeout(
            self.call_timeout(),
            "fetch_order",
            executor.fetch_order(&intent.request.symbol, &intent.request.client_order_id),
        )
        .await;
        match existing {
            Ok(Some(order)) => {
                info!(
                    bot_id = %bot.id,
                    client_order_id = %order.client_order_id,
                    "Pending intent already reached the venue"
                );
                self.acknowledge(bot, intent, order).await
            }
            Ok(None) => {
                info!(
                    bot_id = %bot.id,
                    client_order_id = %intent.request.client_order_id,
                    attempt = intent.attempts + 1,
                    "Retrying order"
                );
                self.submit(bot, executor, intent).await
            }
            Err(e) => self.fail_intent(bot, intent, e).await,
        }
    }

    async fn acknowledge(
        &self,
        bot: &Bot,
        intent: PendingIntent,
        order: ExchangeOrder,
    ) -> Result<Outcome, EngineError> {
        self.retries.lock().await.clear(&bot.id);
        self.record_order(bot, &order).await?;

        let mut runtime = bot.runtime.clone();
        runtime.last_intent_seq = runtime.last_intent_seq.max(intent.intent_seq);
        runtime.anchor_price = Some(order.avg_fill_price.unwrap_or(intent.anchor_price));
        self.store.update_runtime(bot.id, &runtime).await?;

        info!(
            bot_id = %bot.id,
            client_order_id = %order.client_order_id,
            exchange_order_id = %order.exchange_order_id,
            status = ?order.status,
            "Order acknowledged"
        );
        Ok(Outcome::Placed {
            client_order_id: order.client_order_id,
            side: order.side,
            amount: order.amount,
        })
    }

    async fn fail_intent(
        &self,
        bot: &Bot,
        mut intent: PendingIntent,
        err: ExchangeError,
    ) -> Result<Outcome, EngineError> {
        let classification = classify(&err);
        intent.attempts += 1;
        intent.last_error = err.to_string();

        if classification.class.is_retryable() && intent.attempts < self.retry_policy.max_attempts {
            let delay = compute_backoff(
                &self.retry_policy,
                intent.attempts,
                classification.retry_after_ms,
                &mut rand::thread_rng(),
            );
            intent.ready_at = Instant::now() + delay;
            warn!(
                bot_id = %bot.id,
                client_order_id = %intent.request.client_order_id,
                class = ?classification.class,
                attempt = intent.attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Order failed, retry scheduled"
            );
            let outcome = Outcome::RetryScheduled {
                client_order_id: intent.request.client_order_id.clone(),
                attempt: intent.attempts,
                delay_ms: delay.as_millis() as u64,
            };
            self.retries.lock().await.schedule(bot.id, intent);
            return Ok(outcome);
        }

        let code = if classification.class.is_retryable() {
            "RETRIES_EXHAUSTED"
        } else {
            classification.class.code()
        };
        error!(
            bot_id = %bot.id,
            client_order_id = %intent.request.client_order_id,
            class = ?classification.class,
            attempts = intent.attempts,
            error = %err,
            "Order failed permanently"
        );
        self.fatal(bot, code, &err.to_string()).await
    }

    /// Cancel this bot's open orders, then complete the stop
    async fn drain(&self, bot: &Bot) -> Result<Outcome, EngineError> {
        self.retries.lock().await.clear(&bot.id);
        let executor = match self.factory.get(bot.exchange_account_id).await {
            Ok(executor) => executor,
            Err(e) if e.is_fatal() => return self.fatal(bot, e.code(), &e.to_string()).await,
            Err(e) => return Err(e.into()),
        };

        let bot_key = bot.id.to_string();
        let open = with_timeout(
            self.call_timeout(),
            "fetch_open_orders",
            executor.fetch_open_orders(&bot.symbol),
        )
        .await?;
        for order in open.iter().filter(|o| is_bot_order(&o.client_order_id, &bot_key)) {
            let canceled = with_timeout(
                self.call_timeout(),
                "cancel_order",
                executor.cancel_order(&order.symbol, &order.client_order_id),
            )
            .await;
            match canceled {
                Ok(remote) => self.record_order(bot, &remote).await?,
                Err(ExchangeError::OrderNotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            info!(bot_id = %bot.id, client_order_id = %order.client_order_id, "Order canceled during stop");
        }

        let updated = self.apply_event(bot, BotEvent::StoppedComplete, None).await?;
        Ok(Outcome::Transitioned {
            event: BotEvent::StoppedComplete,
            to: updated.status,
        })
    }

    async fn fatal(&self, bot: &Bot, code: &str, message: &str) -> Result<Outcome, EngineError> {
        let reason = LastError::new(code, message);
        let updated = self
            .apply_event(bot, BotEvent::FatalError, Some(&reason))
            .await?;
        Ok(Outcome::Transitioned {
            event: BotEvent::FatalError,
            to: updated.status,
        })
    }

    async fn apply_event(
        &self,
        bot: &Bot,
        event: BotEvent,
        reason: Option<&LastError>,
    ) -> Result<Bot, EngineError> {
        let transition = plan(bot, event, reason)?;
        self.commit(bot, transition).await
    }

    /// Write a planned transition against the version it was planned from
    async fn commit(&self, bot: &Bot, transition: BotTransition) -> Result<Bot, EngineError> {
        let updated = self
            .store
            .apply_transition(bot.id, bot.status_version, &transition)
            .await?;
        if !updated.status.is_actionable() {
            self.retries.lock().await.clear(&bot.id);
        }
        info!(
            bot_id = %bot.id,
            event = %transition.event,
            from = %transition.from,
            to = %transition.to,
            version = updated.status_version,
            run_id = ?updated.run_id,
            "Bot transitioned"
        );
        Ok(updated)
    }
}

/// Buy and sell trigger prices around `anchor`
fn grid_band(anchor: Decimal, trigger: &TriggerConfig) -> Result<(Decimal, Decimal), DecimalError> {
    Ok((
        shift_down(anchor, trigger.fall_buy_percent)?,
        shift_up(anchor, trigger.rise_sell_percent)?,
    ))
}
