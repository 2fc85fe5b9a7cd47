//! Root composition: one `Engine` value owns every port implementation, the
//! strategy registry and the long-running services, wired by explicit
//! constructor injection.

use crate::application::backtest::BacktestEngine;
use crate::application::backtest::tasks::SimulationTaskManager;
use crate::application::execution::ExecutionService;
use crate::application::lifecycle::PositionLifecycle;
use crate::application::market_selector::MarketSelector;
use crate::application::risk_manager::RiskManager;
use crate::application::scheduler::TradingScheduler;
use crate::application::strategies::default_registry;
use crate::config::Config;
use crate::domain::ports::{Clock, SystemClock};
use crate::infrastructure::crypto::CredentialVault;
use crate::infrastructure::http_client::build_client;
use crate::infrastructure::persistence::{
    CachedParameterStore, Database, SqliteCandleStore, SqliteParameterStore,
    SqlitePositionStore, SqliteSimulationTaskStore, SqliteTradeJournal, SqliteUserRegistry,
};
use crate::infrastructure::upbit::{DEFAULT_BASE_URL, UpbitMarketData, UpbitOrderGateway};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

pub struct Engine {
    scheduler: Arc<TradingScheduler>,
    pub backtest: Arc<BacktestEngine>,
    pub tasks: Arc<SimulationTaskManager>,
    trading_enabled: bool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Engine {
    pub async fn build(config: &Config) -> Result<Self> {
        let database = Database::new(&config.security.database_url)
            .await
            .context("database startup failed")?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let vault = Arc::new(CredentialVault::new(
            config
                .security
                .encryption_secret_key
                .as_deref()
                .unwrap_or_default(),
        ));

        let journal = Arc::new(SqliteTradeJournal::new(database.pool.clone()));
        let positions = Arc::new(SqlitePositionStore::new(database.pool.clone()));
        let params = Arc::new(CachedParameterStore::new(Arc::new(
            SqliteParameterStore::new(database.pool.clone()),
        )));
        let candle_store = Arc::new(SqliteCandleStore::new(database.pool.clone()));
        let task_store = Arc::new(SqliteSimulationTaskStore::new(database.pool.clone()));
        let users = Arc::new(SqliteUserRegistry::new(database.pool.clone(), vault));

        let client = build_client()?;
        let market_data = Arc::new(UpbitMarketData::new(client.clone(), DEFAULT_BASE_URL));
        let gateway = Arc::new(UpbitOrderGateway::new(client, DEFAULT_BASE_URL));

        let registry = Arc::new(default_registry());
        let selector = Arc::new(MarketSelector::new(market_data.clone()));

        let execution = Arc::new(ExecutionService::new(
            gateway.clone(),
            journal.clone(),
            positions.clone(),
            clock.clone(),
            config.to_execution_config(),
        ));
        let risk = Arc::new(RiskManager::new(
            config.to_risk_config(),
            positions.clone(),
            clock.clone(),
        ));
        let lifecycle = Arc::new(PositionLifecycle::new(
            execution,
            risk,
            positions.clone(),
            clock.clone(),
            config.to_lifecycle_config(),
        ));

        let scheduler = Arc::new(TradingScheduler::new(
            registry.clone(),
            selector,
            lifecycle,
            gateway,
            positions,
            params.clone(),
            users,
            journal,
            candle_store.clone(),
            task_store.clone(),
            clock.clone(),
            config.to_scheduler_config()?,
        ));

        let backtest = Arc::new(BacktestEngine::new(
            registry,
            params,
            market_data,
            candle_store,
        ));
        let tasks = Arc::new(SimulationTaskManager::new(
            backtest.clone(),
            task_store,
            clock,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            scheduler,
            backtest,
            tasks,
            trading_enabled: config.trading.enabled,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Launch the trading scheduler; a no-op handle when trading is disabled.
    pub fn start(&self) -> JoinHandle<()> {
        if !self.trading_enabled {
            info!("trading disabled; scheduler not started");
            return tokio::spawn(async {});
        }
        let scheduler = self.scheduler.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            scheduler.run(shutdown_rx).await;
        })
    }

    /// Signal shutdown; the scheduler drains in-flight ticks and stops.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
