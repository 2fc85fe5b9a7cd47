//! Ports the engine core consumes. Infrastructure provides the exchange and
//! SQLite implementations; `infrastructure::memory` provides in-memory ones
//! for tests and backtests.

use crate::domain::errors::{ExchangeError, StoreError};
use crate::domain::position::Position;
use crate::domain::types::{
    Account, Candle, MarketInfo, Order, OrderRequest, SimulationTask, Ticker, TradeRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

/// Decrypted exchange API credentials for one user.
#[derive(Debug, Clone)]
pub struct ExchangeCredentials {
    pub access_key: String,
    pub secret_key: String,
}

/// Per-user trading configuration as resolved from the registry.
#[derive(Debug, Clone)]
pub struct TradingUser {
    pub id: i64,
    pub name: String,
    pub credentials: Option<ExchangeCredentials>,
    pub auto_trading_enabled: bool,
    /// Explicit market working set; empty means rely on auto-selection.
    pub target_markets: Vec<String>,
    pub excluded_markets: Vec<String>,
    /// Top-N markets by 24h trade value to merge into the working set.
    pub auto_select_top: usize,
    /// Strategy names this user enabled; empty means the system default bundle.
    pub enabled_strategies: Vec<String>,
}

/// All "now" reads go through this so time is controllable in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Public (unauthenticated) market data, polled per tick.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn markets(&self) -> Result<Vec<MarketInfo>, ExchangeError>;

    async fn tickers(&self, markets: &[String]) -> Result<Vec<Ticker>, ExchangeError>;

    /// Newest-first minute candles; unit in {1,3,5,15,30,60,240}, count <= 200.
    async fn minute_candles(
        &self,
        market: &str,
        unit: u32,
        count: usize,
    ) -> Result<Vec<Candle>, ExchangeError>;

    /// Newest-first day candles, count <= 200.
    async fn day_candles(&self, market: &str, count: usize) -> Result<Vec<Candle>, ExchangeError>;
}

/// Authenticated order surface. All calls pass through the per-credential
/// rate limiter inside the implementation.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn accounts(
        &self,
        credentials: &ExchangeCredentials,
    ) -> Result<Vec<Account>, ExchangeError>;

    async fn submit(
        &self,
        credentials: &ExchangeCredentials,
        request: &OrderRequest,
    ) -> Result<Order, ExchangeError>;

    async fn get_order(
        &self,
        credentials: &ExchangeCredentials,
        uuid: Uuid,
    ) -> Result<Order, ExchangeError>;

    async fn cancel_order(
        &self,
        credentials: &ExchangeCredentials,
        uuid: Uuid,
    ) -> Result<Order, ExchangeError>;

    async fn open_orders(
        &self,
        credentials: &ExchangeCredentials,
        market: &str,
    ) -> Result<Vec<Order>, ExchangeError>;
}

/// Append-only trade history.
#[async_trait]
pub trait TradeJournal: Send + Sync {
    async fn append(&self, record: &TradeRecord) -> Result<i64, StoreError>;

    /// Most recent record for (user, market). Always user-scoped.
    async fn latest(&self, user_id: i64, market: &str)
    -> Result<Option<TradeRecord>, StoreError>;

    async fn for_user_since(
        &self,
        user_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<TradeRecord>, StoreError>;
}

/// Position snapshots keyed by (user, market). Mutation happens only under
/// the caller's per-(user, market) lease.
#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn get(&self, user_id: i64, market: &str) -> Result<Option<Position>, StoreError>;

    async fn put(&self, position: &Position) -> Result<(), StoreError>;

    /// Open (not Pending, not Closed) positions for a user.
    async fn open_for_user(&self, user_id: i64) -> Result<Vec<Position>, StoreError>;

    /// Positions closed at or after `since`, for daily-loss accounting.
    async fn closed_since(
        &self,
        user_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<Position>, StoreError>;

    /// Most recently closed position for (user, market), for loss cooldowns.
    async fn last_closed(
        &self,
        user_id: i64,
        market: &str,
    ) -> Result<Option<Position>, StoreError>;
}

/// Typed tunable value for a strategy parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Flag(bool),
    Text(String),
}

/// (strategy, user-or-global, key) -> typed value. User-specific overrides
/// global; strategy hard-coded defaults sit below both.
#[async_trait]
pub trait ParameterStore: Send + Sync {
    async fn get(
        &self,
        strategy: &str,
        user_id: Option<i64>,
        key: &str,
    ) -> Result<Option<ParamValue>, StoreError>;

    async fn set(
        &self,
        strategy: &str,
        user_id: Option<i64>,
        key: &str,
        value: ParamValue,
    ) -> Result<(), StoreError>;

    /// Global values overlaid with the user's overrides.
    async fn resolve(
        &self,
        strategy: &str,
        user_id: Option<i64>,
    ) -> Result<HashMap<String, ParamValue>, StoreError>;
}

#[async_trait]
pub trait UserRegistry: Send + Sync {
    /// Users with auto-trading enabled and usable credentials.
    async fn active_users(&self) -> Result<Vec<TradingUser>, StoreError>;

    /// Flip auto-trading off, e.g. after a credential decryption failure.
    async fn disable_auto_trading(&self, user_id: i64, reason: &str) -> Result<(), StoreError>;
}

/// Locally persisted candles, used by backtests and the cleanup job.
#[async_trait]
pub trait CandleStore: Send + Sync {
    async fn save_batch(&self, candles: &[Candle]) -> Result<(), StoreError>;

    /// Newest-first, up to `limit`.
    async fn load(&self, market: &str, unit: u32, limit: usize)
    -> Result<Vec<Candle>, StoreError>;

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait SimulationTaskStore: Send + Sync {
    async fn create(&self, task: &SimulationTask) -> Result<(), StoreError>;

    async fn update(&self, task: &SimulationTask) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<SimulationTask>, StoreError>;

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}
