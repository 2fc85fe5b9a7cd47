//! Thread-safe in-memory implementations of every port, used by tests and
//! backtests. Shapes mirror the SQLite implementations.

use crate::domain::errors::{ExchangeError, StoreError};
use crate::domain::ports::{
    CandleStore, Clock, ExchangeCredentials, OrderGateway, ParamValue, ParameterStore,
    PositionStore, SimulationTaskStore, TradeJournal, TradingUser, UserRegistry,
};
use crate::domain::position::{Position, PositionStatus};
use crate::domain::types::{
    Account, Candle, MarketInfo, Order, OrderRequest, OrderSide, OrderState, SimulationTask,
    Ticker, TradeRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Controllable clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    now: StdMutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: StdMutex::new(now),
        }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut guard = self.now.lock().expect("clock lock poisoned");
        *guard += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock poisoned")
    }
}

#[derive(Default)]
pub struct InMemoryPositionStore {
    active: RwLock<HashMap<(i64, String), Position>>,
    closed: RwLock<Vec<Position>>,
}

impl InMemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PositionStore for InMemoryPositionStore {
    async fn get(&self, user_id: i64, market: &str) -> Result<Option<Position>, StoreError> {
        let active = self.active.read().await;
        Ok(active.get(&(user_id, market.to_string())).cloned())
    }

    async fn put(&self, position: &Position) -> Result<(), StoreError> {
        let key = (position.user_id, position.market.clone());
        if position.status == PositionStatus::Closed {
            self.active.write().await.remove(&key);
            self.closed.write().await.push(position.clone());
        } else {
            self.active.write().await.insert(key, position.clone());
        }
        Ok(())
    }

    async fn open_for_user(&self, user_id: i64) -> Result<Vec<Position>, StoreError> {
        let active = self.active.read().await;
        Ok(active
            .values()
            .filter(|p| p.user_id == user_id && p.is_open())
            .cloned()
            .collect())
    }

    async fn closed_since(
        &self,
        user_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<Position>, StoreError> {
        let closed = self.closed.read().await;
        Ok(closed
            .iter()
            .filter(|p| p.user_id == user_id && p.updated_at >= since)
            .cloned()
            .collect())
    }

    async fn last_closed(
        &self,
        user_id: i64,
        market: &str,
    ) -> Result<Option<Position>, StoreError> {
        let closed = self.closed.read().await;
        Ok(closed
            .iter()
            .filter(|p| p.user_id == user_id && p.market == market)
            .max_by_key(|p| p.updated_at)
            .cloned())
    }
}

#[derive(Default)]
pub struct InMemoryTradeJournal {
    records: RwLock<Vec<TradeRecord>>,
}

impl InMemoryTradeJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<TradeRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl TradeJournal for InMemoryTradeJournal {
    async fn append(&self, record: &TradeRecord) -> Result<i64, StoreError> {
        let mut records = self.records.write().await;
        let id = records.len() as i64 + 1;
        let mut stored = record.clone();
        stored.id = Some(id);
        records.push(stored);
        Ok(id)
    }

    async fn latest(
        &self,
        user_id: i64,
        market: &str,
    ) -> Result<Option<TradeRecord>, StoreError> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|r| r.user_id == user_id && r.market == market)
            .max_by_key(|r| (r.executed_at, r.id))
            .cloned())
    }

    async fn for_user_since(
        &self,
        user_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<TradeRecord>, StoreError> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|r| r.user_id == user_id && r.executed_at >= since)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryParameterStore {
    values: RwLock<HashMap<(String, Option<i64>, String), ParamValue>>,
}

impl InMemoryParameterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ParameterStore for InMemoryParameterStore {
    async fn get(
        &self,
        strategy: &str,
        user_id: Option<i64>,
        key: &str,
    ) -> Result<Option<ParamValue>, StoreError> {
        let values = self.values.read().await;
        if let Some(v) = values.get(&(strategy.to_string(), user_id, key.to_string())) {
            return Ok(Some(v.clone()));
        }
        if user_id.is_some() {
            return Ok(values
                .get(&(strategy.to_string(), None, key.to_string()))
                .cloned());
        }
        Ok(None)
    }

    async fn set(
        &self,
        strategy: &str,
        user_id: Option<i64>,
        key: &str,
        value: ParamValue,
    ) -> Result<(), StoreError> {
        self.values
            .write()
            .await
            .insert((strategy.to_string(), user_id, key.to_string()), value);
        Ok(())
    }

    async fn resolve(
        &self,
        strategy: &str,
        user_id: Option<i64>,
    ) -> Result<HashMap<String, ParamValue>, StoreError> {
        let values = self.values.read().await;
        let mut resolved = HashMap::new();
        for ((s, scope, key), value) in values.iter() {
            if s == strategy && scope.is_none() {
                resolved.insert(key.clone(), value.clone());
            }
        }
        if let Some(user) = user_id {
            for ((s, scope, key), value) in values.iter() {
                if s == strategy && *scope == Some(user) {
                    resolved.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(resolved)
    }
}

#[derive(Default)]
pub struct InMemoryCandleStore {
    candles: RwLock<HashMap<(String, u32), Vec<Candle>>>,
}

impl InMemoryCandleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CandleStore for InMemoryCandleStore {
    async fn save_batch(&self, candles: &[Candle]) -> Result<(), StoreError> {
        let mut map = self.candles.write().await;
        for candle in candles {
            let series = map
                .entry((candle.market.clone(), candle.unit))
                .or_default();
            match series.binary_search_by(|c| {
                candle.timestamp_utc.cmp(&c.timestamp_utc) // newest-first order
            }) {
                Ok(i) => series[i] = candle.clone(),
                Err(i) => series.insert(i, candle.clone()),
            }
        }
        Ok(())
    }

    async fn load(
        &self,
        market: &str,
        unit: u32,
        limit: usize,
    ) -> Result<Vec<Candle>, StoreError> {
        let map = self.candles.read().await;
        Ok(map
            .get(&(market.to_string(), unit))
            .map(|series| series.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut map = self.candles.write().await;
        let mut pruned = 0;
        for series in map.values_mut() {
            let before = series.len();
            series.retain(|c| c.timestamp_utc >= cutoff);
            pruned += (before - series.len()) as u64;
        }
        Ok(pruned)
    }
}

pub struct InMemoryUserRegistry {
    users: RwLock<Vec<TradingUser>>,
}

impl InMemoryUserRegistry {
    pub fn new(users: Vec<TradingUser>) -> Self {
        Self {
            users: RwLock::new(users),
        }
    }
}

#[async_trait]
impl UserRegistry for InMemoryUserRegistry {
    async fn active_users(&self) -> Result<Vec<TradingUser>, StoreError> {
        let users = self.users.read().await;
        Ok(users
            .iter()
            .filter(|u| u.auto_trading_enabled && u.credentials.is_some())
            .cloned()
            .collect())
    }

    async fn disable_auto_trading(&self, user_id: i64, _reason: &str) -> Result<(), StoreError> {
        let mut users = self.users.write().await;
        match users.iter_mut().find(|u| u.id == user_id) {
            Some(user) => {
                user.auto_trading_enabled = false;
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "user",
                key: user_id.to_string(),
            }),
        }
    }
}

#[derive(Default)]
pub struct InMemorySimulationTaskStore {
    tasks: RwLock<HashMap<Uuid, SimulationTask>>,
}

impl InMemorySimulationTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SimulationTaskStore for InMemorySimulationTaskStore {
    async fn create(&self, task: &SimulationTask) -> Result<(), StoreError> {
        self.tasks.write().await.insert(task.id, task.clone());
        Ok(())
    }

    async fn update(&self, task: &SimulationTask) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        match tasks.get(&task.id) {
            Some(existing) if existing.status.is_terminal() => Err(StoreError::Conflict {
                entity: "simulation_task",
                key: task.id.to_string(),
            }),
            Some(_) => {
                tasks.insert(task.id, task.clone());
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "simulation_task",
                key: task.id.to_string(),
            }),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<SimulationTask>, StoreError> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, t| t.updated_at >= cutoff || !t.status.is_terminal());
        Ok((before - tasks.len()) as u64)
    }
}

enum GatewayMode {
    Fill { price: Decimal },
    Reject { reason: String },
    NeverConfirm,
}

/// Scriptable gateway for execution tests: fills market orders at a fixed
/// price on the first status poll, rejects, or leaves orders unconfirmed.
pub struct MockOrderGateway {
    mode: GatewayMode,
    fee_rate: Decimal,
    submitted: RwLock<HashMap<Uuid, Order>>,
    submission_count: AtomicUsize,
    accounts: RwLock<Vec<Account>>,
}

impl MockOrderGateway {
    pub fn filling_at(price: Decimal) -> Self {
        Self::with_mode(GatewayMode::Fill { price })
    }

    pub fn rejecting(reason: &str) -> Self {
        Self::with_mode(GatewayMode::Reject {
            reason: reason.to_string(),
        })
    }

    pub fn never_confirming() -> Self {
        Self::with_mode(GatewayMode::NeverConfirm)
    }

    fn with_mode(mode: GatewayMode) -> Self {
        Self {
            mode,
            fee_rate: Decimal::new(5, 4),
            submitted: RwLock::new(HashMap::new()),
            submission_count: AtomicUsize::new(0),
            accounts: RwLock::new(Vec::new()),
        }
    }

    pub fn submissions(&self) -> usize {
        self.submission_count.load(Ordering::SeqCst)
    }

    pub async fn set_accounts(&self, accounts: Vec<Account>) {
        *self.accounts.write().await = accounts;
    }

    fn filled(&self, order: &Order, price: Decimal) -> Order {
        let mut filled = order.clone();
        match order.side {
            OrderSide::Bid => {
                let funds = order.funds.unwrap_or(Decimal::ZERO);
                filled.paid_fee = funds * self.fee_rate;
                filled.executed_funds = funds - filled.paid_fee;
                filled.executed_volume = if price.is_zero() {
                    Decimal::ZERO
                } else {
                    filled.executed_funds / price
                };
            }
            OrderSide::Ask => {
                let volume = order.volume.unwrap_or(Decimal::ZERO);
                filled.executed_volume = volume;
                filled.executed_funds = volume * price;
                filled.paid_fee = filled.executed_funds * self.fee_rate;
            }
        }
        filled.state = OrderState::Done;
        filled
    }
}

#[async_trait]
impl OrderGateway for MockOrderGateway {
    async fn accounts(
        &self,
        _credentials: &ExchangeCredentials,
    ) -> Result<Vec<Account>, ExchangeError> {
        Ok(self.accounts.read().await.clone())
    }

    async fn submit(
        &self,
        _credentials: &ExchangeCredentials,
        request: &OrderRequest,
    ) -> Result<Order, ExchangeError> {
        if let GatewayMode::Reject { reason } = &self.mode {
            return Err(ExchangeError::Transient {
                reason: reason.clone(),
            });
        }
        self.submission_count.fetch_add(1, Ordering::SeqCst);
        let order = Order {
            uuid: Uuid::new_v4(),
            market: request.market.clone(),
            side: request.side,
            kind: request.kind,
            price: request.price,
            funds: request.funds,
            volume: request.volume,
            executed_volume: Decimal::ZERO,
            executed_funds: Decimal::ZERO,
            paid_fee: Decimal::ZERO,
            state: OrderState::Wait,
            created_at: Utc::now(),
        };
        self.submitted.write().await.insert(order.uuid, order.clone());
        Ok(order)
    }

    async fn get_order(
        &self,
        _credentials: &ExchangeCredentials,
        uuid: Uuid,
    ) -> Result<Order, ExchangeError> {
        let submitted = self.submitted.read().await;
        let order = submitted.get(&uuid).ok_or(ExchangeError::OrderNotFound {
            uuid: uuid.to_string(),
        })?;
        match &self.mode {
            GatewayMode::Fill { price } => Ok(self.filled(order, *price)),
            GatewayMode::NeverConfirm => Ok(order.clone()),
            GatewayMode::Reject { reason } => Err(ExchangeError::Transient {
                reason: reason.clone(),
            }),
        }
    }

    async fn cancel_order(
        &self,
        _credentials: &ExchangeCredentials,
        uuid: Uuid,
    ) -> Result<Order, ExchangeError> {
        let mut submitted = self.submitted.write().await;
        let order = submitted.get_mut(&uuid).ok_or(ExchangeError::OrderNotFound {
            uuid: uuid.to_string(),
        })?;
        order.state = OrderState::Cancel;
        Ok(order.clone())
    }

    async fn open_orders(
        &self,
        _credentials: &ExchangeCredentials,
        market: &str,
    ) -> Result<Vec<Order>, ExchangeError> {
        let submitted = self.submitted.read().await;
        Ok(submitted
            .values()
            .filter(|o| o.market == market && !o.state.is_terminal())
            .cloned()
            .collect())
    }
}

/// Canned market data for tests: fixed candle series per (market, unit).
#[derive(Default)]
pub struct StaticMarketData {
    markets: Vec<MarketInfo>,
    tickers: HashMap<String, Ticker>,
    candles: HashMap<(String, u32), Vec<Candle>>,
}

impl StaticMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_market(mut self, info: MarketInfo) -> Self {
        self.markets.push(info);
        self
    }

    pub fn with_ticker(mut self, ticker: Ticker) -> Self {
        self.tickers.insert(ticker.market.clone(), ticker);
        self
    }

    pub fn with_candles(mut self, market: &str, unit: u32, candles: Vec<Candle>) -> Self {
        self.candles.insert((market.to_string(), unit), candles);
        self
    }
}

#[async_trait]
impl crate::domain::ports::MarketDataSource for StaticMarketData {
    async fn markets(&self) -> Result<Vec<MarketInfo>, ExchangeError> {
        Ok(self.markets.clone())
    }

    async fn tickers(&self, markets: &[String]) -> Result<Vec<Ticker>, ExchangeError> {
        Ok(markets
            .iter()
            .filter_map(|m| self.tickers.get(m).cloned())
            .collect())
    }

    async fn minute_candles(
        &self,
        market: &str,
        unit: u32,
        count: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        Ok(self
            .candles
            .get(&(market.to_string(), unit))
            .map(|c| c.iter().take(count).cloned().collect())
            .unwrap_or_default())
    }

    async fn day_candles(&self, market: &str, count: usize) -> Result<Vec<Candle>, ExchangeError> {
        self.minute_candles(market, 1440, count).await
    }
}
