//! Executor factory
//!
//! One executor per exchange account, built on first use and cached for the
//! life of the process. Construction for an account runs at most once at a
//! time; concurrent callers wait on the same `OnceCell`. When the cache is
//! full the least recently used account is dropped.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::executor::TradingExecutor;
use crate::models::{ExchangeAccount, TradingMode};
use crate::paper::PaperExchange;
use crate::secrets::{CredentialDecryptor, CredentialError, Credentials};
use crate::store::{AccountStore, StoreError};

#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("exchange account {0} not found")]
    AccountNotFound(Uuid),
    #[error("exchange account {0} has no stored credentials")]
    MissingCredentials(Uuid),
    #[error(transparent)]
    Credentials(#[from] CredentialError),
    #[error("no connector configured for {0} accounts")]
    NoConnector(&'static str),
    #[error("executor construction failed: {0}")]
    Connect(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl FactoryError {
    pub fn code(&self) -> &'static str {
        match self {
            FactoryError::AccountNotFound(_) => "EXCHANGE_ACCOUNT_NOT_FOUND",
            FactoryError::MissingCredentials(_) | FactoryError::Credentials(_) => {
                "CREDENTIALS_DECRYPT_FAILED"
            }
            FactoryError::NoConnector(_) | FactoryError::Connect(_) => "EXECUTOR_UNAVAILABLE",
            FactoryError::Store(_) => "STORE_UNAVAILABLE",
        }
    }

    /// Storage hiccups are retried next tick; everything else stops the bot
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FactoryError::Store(_))
    }
}

/// Builds an executor for one account
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        account: &ExchangeAccount,
        credentials: Option<Credentials>,
    ) -> Result<Arc<dyn TradingExecutor>, FactoryError>;
}

/// Routes every paper account to a shared [`PaperExchange`]
pub struct PaperConnector {
    exchange: Arc<PaperExchange>,
}

impl PaperConnector {
    pub fn new(exchange: Arc<PaperExchange>) -> Self {
        Self { exchange }
    }
}

#[async_trait]
impl Connector for PaperConnector {
    async fn connect(
        &self,
        account: &ExchangeAccount,
        _credentials: Option<Credentials>,
    ) -> Result<Arc<dyn TradingExecutor>, FactoryError> {
        Ok(Arc::new(self.exchange.account(account.id)))
    }
}

type Slot = Arc<OnceCell<Arc<dyn TradingExecutor>>>;

struct CacheEntry {
    slot: Slot,
    last_used: u64,
}

#[derive(Default)]
struct Cache {
    entries: HashMap<Uuid, CacheEntry>,
    clock: u64,
}

pub struct ExecutorFactory {
    accounts: Arc<dyn AccountStore>,
    decryptor: Arc<dyn CredentialDecryptor>,
    paper: Arc<dyn Connector>,
    live: Option<Arc<dyn Connector>>,
    max_size: usize,
    cache: Mutex<Cache>,
}

impl ExecutorFactory {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        decryptor: Arc<dyn CredentialDecryptor>,
        paper: Arc<dyn Connector>,
        max_size: usize,
    ) -> Self {
        Self {
            accounts,
            decryptor,
            paper,
            live: None,
            max_size: max_size.max(1),
            cache: Mutex::new(Cache::default()),
        }
    }

    pub fn with_live(mut self, live: Arc<dyn Connector>) -> Self {
        self.live = Some(live);
        self
    }

    /// Cached executor for the account, building it on first use
    pub async fn get(&self, account_id: Uuid) -> Result<Arc<dyn TradingExecutor>, FactoryError> {
        let slot = self.slot(account_id).await;
        let executor = slot.get_or_try_init(|| self.build(account_id)).await?;
        Ok(Arc::clone(executor))
    }

    async fn slot(&self, account_id: Uuid) -> Slot {
        let mut cache = self.cache.lock().await;
        cache.clock += 1;
        let now = cache.clock;

        if let Some(entry) = cache.entries.get_mut(&account_id) {
            entry.last_used = now;
            return Arc::clone(&entry.slot);
        }

        while cache.entries.len() >= self.max_size {
            let oldest = cache
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(id, _)| *id);
            match oldest {
                Some(id) => {
                    cache.entries.remove(&id);
                    debug!(account_id = %id, "Evicted executor from cache");
                }
                None => break,
            }
        }

        let slot: Slot = Arc::new(OnceCell::new());
        cache.entries.insert(
            account_id,
            CacheEntry {
                slot: Arc::clone(&slot),
                last_used: now,
            },
        );
        slot
    }

    async fn build(&self, account_id: Uuid) -> Result<Arc<dyn TradingExecutor>, FactoryError> {
        let account = self
            .accounts
            .get_account(account_id)
            .await?
            .ok_or(FactoryError::AccountNotFound(account_id))?;

        let executor = match account.mode {
            TradingMode::Paper => self.paper.connect(&account, None).await?,
            TradingMode::Live => {
                let connector = self.live.as_ref().ok_or(FactoryError::NoConnector("live"))?;
                let blob = self
                    .accounts
                    .load_credential_blob(account_id)
                    .await?
                    .ok_or(FactoryError::MissingCredentials(account_id))?;
                let credentials = self.decryptor.decrypt(&blob).map_err(|e| {
                    warn!(account_id = %account_id, error = %e, "Credential decryption failed");
                    e
                })?;
                connector.connect(&account, Some(credentials)).await?
            }
        };

        info!(
            account_id = %account_id,
            exchange = %account.exchange,
            executor = executor.name(),
            "Executor ready"
        );
        Ok(executor)
    }

    /// Number of cached accounts
    pub async fn cached(&self) -> usize {
        self.cache.lock().await.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::SecretsManager;
    use crate::store::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingConnector {
        inner: PaperConnector,
        built: AtomicUsize,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn connect(
            &self,
            account: &ExchangeAccount,
            credentials: Option<Credentials>,
        ) -> Result<Arc<dyn TradingExecutor>, FactoryError> {
            self.built.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.inner.connect(account, credentials).await
        }
    }

    fn account(mode: TradingMode) -> ExchangeAccount {
        ExchangeAccount {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            exchange: "binance".into(),
            mode,
        }
    }

    fn secrets() -> SecretsManager {
        SecretsManager::from_bytes(vec![9u8; 32]).unwrap()
    }

    fn setup(max_size: usize) -> (Arc<InMemoryStore>, Arc<CountingConnector>, ExecutorFactory) {
        let store = Arc::new(InMemoryStore::new());
        let connector = Arc::new(CountingConnector {
            inner: PaperConnector::new(Arc::new(PaperExchange::new())),
            built: AtomicUsize::new(0),
        });
        let factory = ExecutorFactory::new(
            store.clone(),
            Arc::new(secrets()),
            connector.clone(),
            max_size,
        );
        (store, connector, factory)
    }

    #[tokio::test]
    async fn test_one_executor_per_account() {
        let (store, connector, factory) = setup(8);
        let acct = account(TradingMode::Paper);
        store.put_account(acct.clone(), None).await;

        let a = factory.get(acct.id).await.unwrap();
        let b = factory.get(acct.id).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(connector.built.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_use_builds_once() {
        let (store, connector, factory) = setup(8);
        let factory = Arc::new(factory);
        let acct = account(TradingMode::Paper);
        store.put_account(acct.clone(), None).await;
        let id = acct.id;

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let factory = factory.clone();
                tokio::spawn(async move { factory.get(id).await.map(|_| ()) })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(connector.built.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let (store, connector, factory) = setup(2);
        let accts: Vec<_> = (0..3).map(|_| account(TradingMode::Paper)).collect();
        for a in &accts {
            store.put_account(a.clone(), None).await;
        }

        factory.get(accts[0].id).await.unwrap();
        factory.get(accts[1].id).await.unwrap();
        factory.get(accts[0].id).await.unwrap();
        factory.get(accts[2].id).await.unwrap();
        assert_eq!(factory.cached().await, 2);
        assert_eq!(connector.built.load(Ordering::SeqCst), 3);

        // accts[1] was least recently used and must be rebuilt
        factory.get(accts[0].id).await.unwrap();
        assert_eq!(connector.built.load(Ordering::SeqCst), 3);
        factory.get(accts[1].id).await.unwrap();
        assert_eq!(connector.built.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_credential_failure_is_per_account() {
        let (store, connector, factory) = setup(8);
        let factory = factory.with_live(connector.clone());

        let broken = account(TradingMode::Live);
        store.put_account(broken.clone(), Some("not-a-valid-blob".into())).await;

        let good = account(TradingMode::Live);
        let blob = secrets()
            .encrypt_credentials(&Credentials {
                api_key: "k".into(),
                api_secret: "s".into(),
                passphrase: None,
            })
            .unwrap();
        store.put_account(good.clone(), Some(blob)).await;

        let err = factory.get(broken.id).await.err().unwrap();
        assert_eq!(err.code(), "CREDENTIALS_DECRYPT_FAILED");
        assert!(err.is_fatal());
        assert!(factory.get(good.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_account_and_connector() {
        let (store, _connector, factory) = setup(8);
        let err = factory.get(Uuid::new_v4()).await.err().unwrap();
        assert!(matches!(err, FactoryError::AccountNotFound(_)));

        let live = account(TradingMode::Live);
        store.put_account(live.clone(), Some("x".into())).await;
        let err = factory.get(live.id).await.err().unwrap();
        assert!(matches!(err, FactoryError::NoConnector("live")));
    }
}
