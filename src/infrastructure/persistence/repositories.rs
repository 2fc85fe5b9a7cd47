//! SQLite implementations of the engine's stores. Money columns are TEXT
//! (exact decimal round trip); timestamps are unix seconds.

use crate::domain::errors::StoreError;
use crate::domain::ports::{
    CandleStore, ExchangeCredentials, ParamValue, ParameterStore, PositionStore,
    SimulationTaskStore, TradeJournal, TradingUser, UserRegistry,
};
use crate::domain::position::{Position, PositionStatus};
use crate::domain::types::{
    Candle, OrderSide, SimulationTask, SimulationTaskStatus, TradeRecord,
};
use crate::infrastructure::crypto::CredentialVault;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, warn};
use uuid::Uuid;

fn db_err(err: sqlx::Error) -> StoreError {
    StoreError::Database {
        reason: err.to_string(),
    }
}

fn parse_decimal(raw: &str, field: &'static str) -> Result<Decimal, StoreError> {
    Decimal::from_str(raw).map_err(|e| StoreError::Database {
        reason: format!("bad decimal in {field}: {raw:?}: {e}"),
    })
}

fn ts(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0).single().unwrap_or_default()
}

// ---------------------------------------------------------------- trades

pub struct SqliteTradeJournal {
    pool: SqlitePool,
}

impl SqliteTradeJournal {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &SqliteRow) -> Result<TradeRecord, StoreError> {
        let side: String = row.get("side");
        let uuid: String = row.get("order_uuid");
        Ok(TradeRecord {
            id: Some(row.get::<i64, _>("id")),
            user_id: row.get("user_id"),
            market: row.get("market"),
            side: if side == "bid" {
                OrderSide::Bid
            } else {
                OrderSide::Ask
            },
            executed_at: ts(row.get("executed_at")),
            amount: parse_decimal(row.get("amount"), "amount")?,
            volume: parse_decimal(row.get("volume"), "volume")?,
            price: parse_decimal(row.get("price"), "price")?,
            fee: parse_decimal(row.get("fee"), "fee")?,
            order_uuid: Uuid::from_str(&uuid).map_err(|e| StoreError::Database {
                reason: format!("bad order uuid {uuid:?}: {e}"),
            })?,
            strategy: row.get("strategy"),
            target_price: row
                .get::<Option<String>, _>("target_price")
                .map(|v| parse_decimal(&v, "target_price"))
                .transpose()?,
            highest_price: row
                .get::<Option<String>, _>("highest_price")
                .map(|v| parse_decimal(&v, "highest_price"))
                .transpose()?,
            half_sold: row.get::<i64, _>("half_sold") != 0,
            stop_loss: row.get::<i64, _>("stop_loss") != 0,
        })
    }
}

#[async_trait]
impl TradeJournal for SqliteTradeJournal {
    async fn append(&self, record: &TradeRecord) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO trade_history
              (user_id, market, side, executed_at, amount, volume, price, fee,
               order_uuid, strategy, target_price, highest_price, half_sold, stop_loss)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.user_id)
        .bind(&record.market)
        .bind(record.side.to_string())
        .bind(record.executed_at.timestamp())
        .bind(record.amount.to_string())
        .bind(record.volume.to_string())
        .bind(record.price.to_string())
        .bind(record.fee.to_string())
        .bind(record.order_uuid.to_string())
        .bind(&record.strategy)
        .bind(record.target_price.map(|v| v.to_string()))
        .bind(record.highest_price.map(|v| v.to_string()))
        .bind(record.half_sold as i64)
        .bind(record.stop_loss as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.last_insert_rowid())
    }

    async fn latest(
        &self,
        user_id: i64,
        market: &str,
    ) -> Result<Option<TradeRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM trade_history
            WHERE user_id = ? AND market = ?
            ORDER BY executed_at DESC, id DESC LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(market)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn for_user_since(
        &self,
        user_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<TradeRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM trade_history
            WHERE user_id = ? AND executed_at >= ?
            ORDER BY executed_at ASC, id ASC
            "#,
        )
        .bind(user_id)
        .bind(since.timestamp())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(Self::row_to_record).collect()
    }
}

// -------------------------------------------------------------- positions

pub struct SqlitePositionStore {
    pool: SqlitePool,
}

impl SqlitePositionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn decode(payload: &str) -> Result<Position, StoreError> {
        serde_json::from_str(payload).map_err(|e| StoreError::Database {
            reason: format!("bad position payload: {e}"),
        })
    }

    fn encode(position: &Position) -> Result<String, StoreError> {
        serde_json::to_string(position).map_err(|e| StoreError::Database {
            reason: format!("position encode: {e}"),
        })
    }
}

#[async_trait]
impl PositionStore for SqlitePositionStore {
    async fn get(&self, user_id: i64, market: &str) -> Result<Option<Position>, StoreError> {
        let row = sqlx::query(
            "SELECT payload FROM positions WHERE user_id = ? AND market = ? AND open = 1",
        )
        .bind(user_id)
        .bind(market)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| Self::decode(r.get("payload"))).transpose()
    }

    async fn put(&self, position: &Position) -> Result<(), StoreError> {
        let open = position.status != PositionStatus::Closed;
        let payload = Self::encode(position)?;

        let updated = sqlx::query(
            r#"
            UPDATE positions
            SET status = ?, realized_pnl = ?, updated_at = ?, open = ?, payload = ?
            WHERE user_id = ? AND market = ? AND open = 1
            "#,
        )
        .bind(position.status.as_str())
        .bind(position.realized_pnl.to_string())
        .bind(position.updated_at.timestamp())
        .bind(open as i64)
        .bind(&payload)
        .bind(position.user_id)
        .bind(&position.market)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() == 0 {
            sqlx::query(
                r#"
                INSERT INTO positions
                  (user_id, market, status, realized_pnl, updated_at, open, payload)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(position.user_id)
            .bind(&position.market)
            .bind(position.status.as_str())
            .bind(position.realized_pnl.to_string())
            .bind(position.updated_at.timestamp())
            .bind(open as i64)
            .bind(&payload)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    async fn open_for_user(&self, user_id: i64) -> Result<Vec<Position>, StoreError> {
        let rows = sqlx::query(
            "SELECT payload FROM positions WHERE user_id = ? AND open = 1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|r| Self::decode(r.get("payload")))
            .filter(|p| p.as_ref().map(|p| p.is_open()).unwrap_or(true))
            .collect()
    }

    async fn closed_since(
        &self,
        user_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<Position>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT payload FROM positions
            WHERE user_id = ? AND open = 0 AND updated_at >= ?
            "#,
        )
        .bind(user_id)
        .bind(since.timestamp())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(|r| Self::decode(r.get("payload"))).collect()
    }

    async fn last_closed(
        &self,
        user_id: i64,
        market: &str,
    ) -> Result<Option<Position>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT payload FROM positions
            WHERE user_id = ? AND market = ? AND open = 0
            ORDER BY updated_at DESC, id DESC LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(market)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| Self::decode(r.get("payload"))).transpose()
    }
}

// ------------------------------------------------------------- parameters

pub struct SqliteParameterStore {
    pool: SqlitePool,
}

impl SqliteParameterStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn scope(user_id: Option<i64>) -> i64 {
        user_id.unwrap_or(0)
    }

    fn decode_value(value: &str, value_type: &str) -> Result<ParamValue, StoreError> {
        match value_type {
            "INT" => value
                .parse()
                .map(ParamValue::Int)
                .map_err(|e| StoreError::Database {
                    reason: format!("bad INT param {value:?}: {e}"),
                }),
            "DOUBLE" => value
                .parse()
                .map(ParamValue::Float)
                .map_err(|e| StoreError::Database {
                    reason: format!("bad DOUBLE param {value:?}: {e}"),
                }),
            "BOOL" => Ok(ParamValue::Flag(value == "true" || value == "1")),
            "STRING" => Ok(ParamValue::Text(value.to_string())),
            other => Err(StoreError::Database {
                reason: format!("unknown param type {other:?}"),
            }),
        }
    }

    fn encode_value(value: &ParamValue) -> (String, &'static str) {
        match value {
            ParamValue::Int(v) => (v.to_string(), "INT"),
            ParamValue::Float(v) => (v.to_string(), "DOUBLE"),
            ParamValue::Flag(v) => (v.to_string(), "BOOL"),
            ParamValue::Text(v) => (v.clone(), "STRING"),
        }
    }
}

#[async_trait]
impl ParameterStore for SqliteParameterStore {
    async fn get(
        &self,
        strategy: &str,
        user_id: Option<i64>,
        key: &str,
    ) -> Result<Option<ParamValue>, StoreError> {
        // user scope first, then global
        for scope in [Self::scope(user_id), 0] {
            let row = sqlx::query(
                r#"
                SELECT value, value_type FROM strategy_parameters
                WHERE strategy_name = ? AND user_id = ? AND param_key = ?
                "#,
            )
            .bind(strategy)
            .bind(scope)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
            if let Some(row) = row {
                return Ok(Some(Self::decode_value(
                    row.get("value"),
                    row.get("value_type"),
                )?));
            }
            if scope == 0 {
                break;
            }
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
        let (encoded, value_type) = Self::encode_value(&value);
        sqlx::query(
            r#"
            INSERT INTO strategy_parameters (strategy_name, user_id, param_key, value, value_type)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (strategy_name, user_id, param_key)
            DO UPDATE SET value = excluded.value, value_type = excluded.value_type
            "#,
        )
        .bind(strategy)
        .bind(Self::scope(user_id))
        .bind(key)
        .bind(encoded)
        .bind(value_type)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn resolve(
        &self,
        strategy: &str,
        user_id: Option<i64>,
    ) -> Result<HashMap<String, ParamValue>, StoreError> {
        let mut resolved = HashMap::new();
        let mut scopes = vec![0i64];
        if let Some(user) = user_id
            && user != 0
        {
            scopes.push(user);
        }
        // global first so user rows overwrite
        for scope in scopes {
            let rows = sqlx::query(
                r#"
                SELECT param_key, value, value_type FROM strategy_parameters
                WHERE strategy_name = ? AND user_id = ?
                "#,
            )
            .bind(strategy)
            .bind(scope)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
            for row in rows {
                resolved.insert(
                    row.get::<String, _>("param_key"),
                    Self::decode_value(row.get("value"), row.get("value_type"))?,
                );
            }
        }
        Ok(resolved)
    }
}

/// Read-through cache over any parameter store. Parameter reads happen per
/// strategy per tick; writes invalidate the whole cache.
pub struct CachedParameterStore {
    inner: Arc<dyn ParameterStore>,
    cache: RwLock<HashMap<(String, Option<i64>), HashMap<String, ParamValue>>>,
}

impl CachedParameterStore {
    pub fn new(inner: Arc<dyn ParameterStore>) -> Self {
        Self {
            inner,
            cache: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ParameterStore for CachedParameterStore {
    async fn get(
        &self,
        strategy: &str,
        user_id: Option<i64>,
        key: &str,
    ) -> Result<Option<ParamValue>, StoreError> {
        Ok(self.resolve(strategy, user_id).await?.get(key).cloned())
    }

    async fn set(
        &self,
        strategy: &str,
        user_id: Option<i64>,
        key: &str,
        value: ParamValue,
    ) -> Result<(), StoreError> {
        self.inner.set(strategy, user_id, key, value).await?;
        self.cache.write().await.clear();
        Ok(())
    }

    async fn resolve(
        &self,
        strategy: &str,
        user_id: Option<i64>,
    ) -> Result<HashMap<String, ParamValue>, StoreError> {
        let cache_key = (strategy.to_string(), user_id);
        if let Some(hit) = self.cache.read().await.get(&cache_key) {
            return Ok(hit.clone());
        }
        let resolved = self.inner.resolve(strategy, user_id).await?;
        self.cache
            .write()
            .await
            .insert(cache_key, resolved.clone());
        Ok(resolved)
    }
}

// ---------------------------------------------------------------- candles

pub struct SqliteCandleStore {
    pool: SqlitePool,
}

impl SqliteCandleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_candle(row: &SqliteRow) -> Result<Candle, StoreError> {
        Ok(Candle {
            market: row.get("market"),
            timestamp_utc: ts(row.get("timestamp_utc")),
            open: parse_decimal(row.get("open"), "open")?,
            high: parse_decimal(row.get("high"), "high")?,
            low: parse_decimal(row.get("low"), "low")?,
            close: parse_decimal(row.get("close"), "close")?,
            volume: parse_decimal(row.get("volume"), "volume")?,
            value: parse_decimal(row.get("value"), "value")?,
            unit: row.get::<i64, _>("unit") as u32,
        })
    }
}

#[async_trait]
impl CandleStore for SqliteCandleStore {
    async fn save_batch(&self, candles: &[Candle]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for candle in candles {
            sqlx::query(
                r#"
                INSERT INTO candle_data
                  (market, candle_date_time_kst, unit, timestamp_utc,
                   open, high, low, close, volume, value)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (market, candle_date_time_kst, unit) DO UPDATE SET
                  open = excluded.open, high = excluded.high, low = excluded.low,
                  close = excluded.close, volume = excluded.volume, value = excluded.value
                "#,
            )
            .bind(&candle.market)
            .bind(candle.timestamp_kst().format("%Y-%m-%dT%H:%M:%S").to_string())
            .bind(candle.unit as i64)
            .bind(candle.timestamp_utc.timestamp())
            .bind(candle.open.to_string())
            .bind(candle.high.to_string())
            .bind(candle.low.to_string())
            .bind(candle.close.to_string())
            .bind(candle.volume.to_string())
            .bind(candle.value.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)
    }

    async fn load(
        &self,
        market: &str,
        unit: u32,
        limit: usize,
    ) -> Result<Vec<Candle>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM candle_data
            WHERE market = ? AND unit = ?
            ORDER BY timestamp_utc DESC LIMIT ?
            "#,
        )
        .bind(market)
        .bind(unit as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(Self::row_to_candle).collect()
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM candle_data WHERE timestamp_utc < ?")
            .bind(cutoff.timestamp())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}

// -------------------------------------------------------- simulation tasks

pub struct SqliteSimulationTaskStore {
    pool: SqlitePool,
}

impl SqliteSimulationTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn status_from_str(raw: &str) -> Result<SimulationTaskStatus, StoreError> {
        match raw {
            "PENDING" => Ok(SimulationTaskStatus::Pending),
            "RUNNING" => Ok(SimulationTaskStatus::Running),
            "COMPLETED" => Ok(SimulationTaskStatus::Completed),
            "FAILED" => Ok(SimulationTaskStatus::Failed),
            "CANCELLED" => Ok(SimulationTaskStatus::Cancelled),
            other => Err(StoreError::Database {
                reason: format!("unknown task status {other:?}"),
            }),
        }
    }

    fn row_to_task(row: &SqliteRow) -> Result<SimulationTask, StoreError> {
        let id: String = row.get("id");
        Ok(SimulationTask {
            id: Uuid::from_str(&id).map_err(|e| StoreError::Database {
                reason: format!("bad task id {id:?}: {e}"),
            })?,
            kind: row.get("kind"),
            status: Self::status_from_str(row.get("status"))?,
            progress: row.get::<i64, _>("progress").clamp(0, 100) as u8,
            step: row.get("step"),
            created_at: ts(row.get("created_at")),
            updated_at: ts(row.get("updated_at")),
            result: row
                .get::<Option<String>, _>("result")
                .and_then(|raw| serde_json::from_str(&raw).ok()),
            error: row.get("error"),
        })
    }
}

#[async_trait]
impl SimulationTaskStore for SqliteSimulationTaskStore {
    async fn create(&self, task: &SimulationTask) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO simulation_tasks
              (id, kind, status, progress, step, created_at, updated_at, result, error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(task.id.to_string())
        .bind(&task.kind)
        .bind(task.status.as_str())
        .bind(task.progress as i64)
        .bind(&task.step)
        .bind(task.created_at.timestamp())
        .bind(task.updated_at.timestamp())
        .bind(task.result.as_ref().map(|v| v.to_string()))
        .bind(&task.error)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update(&self, task: &SimulationTask) -> Result<(), StoreError> {
        // Terminal tasks are frozen; the WHERE clause enforces it.
        let result = sqlx::query(
            r#"
            UPDATE simulation_tasks
            SET status = ?, progress = ?, step = ?, updated_at = ?, result = ?, error = ?
            WHERE id = ? AND status IN ('PENDING', 'RUNNING')
            "#,
        )
        .bind(task.status.as_str())
        .bind(task.progress as i64)
        .bind(&task.step)
        .bind(task.updated_at.timestamp())
        .bind(task.result.as_ref().map(|v| v.to_string()))
        .bind(&task.error)
        .bind(task.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict {
                entity: "simulation_task",
                key: task.id.to_string(),
            });
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<SimulationTask>, StoreError> {
        let row = sqlx::query("SELECT * FROM simulation_tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM simulation_tasks
            WHERE updated_at < ? AND status IN ('COMPLETED', 'FAILED', 'CANCELLED')
            "#,
        )
        .bind(cutoff.timestamp())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}

// ------------------------------------------------------------------ users

/// User registry over the `users` table. API keys are ciphertext only; a row
/// that fails to decrypt surfaces as an unusable credential and flips that
/// user's auto-trading off rather than falling back silently.
pub struct SqliteUserRegistry {
    pool: SqlitePool,
    vault: Arc<CredentialVault>,
}

impl SqliteUserRegistry {
    pub fn new(pool: SqlitePool, vault: Arc<CredentialVault>) -> Self {
        Self { pool, vault }
    }

    fn split_list(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    async fn enabled_strategies(&self, user_id: i64) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT strategy_name FROM user_strategies WHERE user_id = ? ORDER BY strategy_name",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.iter().map(|r| r.get("strategy_name")).collect())
    }
}

#[async_trait]
impl UserRegistry for SqliteUserRegistry {
    async fn active_users(&self) -> Result<Vec<TradingUser>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, access_key_enc, secret_key_enc, target_markets,
                   excluded_markets, auto_select_top
            FROM users WHERE auto_trading_enabled = 1
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut users = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.get("id");
            let name: String = row.get("name");
            let access_enc: Option<String> = row.get("access_key_enc");
            let secret_enc: Option<String> = row.get("secret_key_enc");

            let credentials = match (access_enc, secret_enc) {
                (Some(access), Some(secret)) => {
                    match (self.vault.decrypt(&access), self.vault.decrypt(&secret)) {
                        (Ok(access_key), Ok(secret_key)) => Some(ExchangeCredentials {
                            access_key,
                            secret_key,
                        }),
                        _ => {
                            error!(
                                user = id,
                                "stored credential failed to decrypt; disabling auto-trading"
                            );
                            self.disable_auto_trading(id, "credential decryption failed")
                                .await?;
                            continue;
                        }
                    }
                }
                _ => {
                    warn!(user = id, "no exchange credentials registered");
                    None
                }
            };

            users.push(TradingUser {
                id,
                name,
                credentials,
                auto_trading_enabled: true,
                target_markets: Self::split_list(row.get("target_markets")),
                excluded_markets: Self::split_list(row.get("excluded_markets")),
                auto_select_top: row.get::<i64, _>("auto_select_top").max(0) as usize,
                enabled_strategies: self.enabled_strategies(id).await?,
            });
        }
        Ok(users)
    }

    async fn disable_auto_trading(&self, user_id: i64, reason: &str) -> Result<(), StoreError> {
        warn!(user = user_id, reason, "disabling auto-trading");
        let result = sqlx::query("UPDATE users SET auto_trading_enabled = 0 WHERE id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "user",
                key: user_id.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::persistence::Database;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    async fn db() -> Database {
        Database::new("sqlite::memory:").await.unwrap()
    }

    fn record(user_id: i64, market: &str) -> TradeRecord {
        TradeRecord {
            id: None,
            user_id,
            market: market.to_string(),
            side: OrderSide::Bid,
            executed_at: Utc::now(),
            amount: dec!(99950),
            volume: dec!(0.001),
            price: dec!(99950000),
            fee: dec!(50),
            order_uuid: Uuid::new_v4(),
            strategy: "RSI".to_string(),
            target_price: Some(dec!(102000000)),
            highest_price: None,
            half_sold: false,
            stop_loss: false,
        }
    }

    #[tokio::test]
    async fn test_trade_journal_round_trip() {
        let db = db().await;
        let journal = SqliteTradeJournal::new(db.pool.clone());
        let id = journal.append(&record(1, "KRW-BTC")).await.unwrap();
        assert!(id > 0);

        let latest = journal.latest(1, "KRW-BTC").await.unwrap().unwrap();
        assert_eq!(latest.amount, dec!(99950));
        assert_eq!(latest.target_price, Some(dec!(102000000)));

        // other users never see it
        assert!(journal.latest(2, "KRW-BTC").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_position_store_round_trip_and_history() {
        let db = db().await;
        let store = SqlitePositionStore::new(db.pool.clone());
        let now = Utc::now();

        let mut position = Position::new_pending(1, "KRW-BTC", "ScaledTrading", 80.0, now);
        position
            .apply_entry_fill(1, dec!(100), dec!(10), Decimal::ZERO, now)
            .unwrap();
        store.put(&position).await.unwrap();

        let loaded = store.get(1, "KRW-BTC").await.unwrap().unwrap();
        assert_eq!(loaded.entry_phase, 1);
        assert_eq!(loaded.avg_entry_price, dec!(100));

        position.mark_active(now).unwrap();
        position
            .apply_final_exit(
                dec!(95),
                dec!(10),
                Decimal::ZERO,
                crate::domain::types::ExitReason::StopLossFixed,
                now,
            )
            .unwrap();
        store.put(&position).await.unwrap();

        assert!(store.get(1, "KRW-BTC").await.unwrap().is_none());
        let last = store.last_closed(1, "KRW-BTC").await.unwrap().unwrap();
        assert_eq!(last.realized_pnl, dec!(-50));
        assert_eq!(
            store
                .closed_since(1, now - chrono::Duration::minutes(1))
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_parameter_store_resolution() {
        let db = db().await;
        let store = SqliteParameterStore::new(db.pool.clone());
        store
            .set("RSI", None, "period", ParamValue::Int(14))
            .await
            .unwrap();
        store
            .set("RSI", Some(7), "period", ParamValue::Int(21))
            .await
            .unwrap();

        assert_eq!(
            store.get("RSI", Some(7), "period").await.unwrap(),
            Some(ParamValue::Int(21))
        );
        assert_eq!(
            store.get("RSI", Some(8), "period").await.unwrap(),
            Some(ParamValue::Int(14))
        );
        let resolved = store.resolve("RSI", Some(7)).await.unwrap();
        assert_eq!(resolved.get("period"), Some(&ParamValue::Int(21)));
    }

    #[tokio::test]
    async fn test_cached_parameter_store_invalidates_on_write() {
        let db = db().await;
        let inner = Arc::new(SqliteParameterStore::new(db.pool.clone()));
        let cached = CachedParameterStore::new(inner);

        cached
            .set("RSI", None, "period", ParamValue::Int(14))
            .await
            .unwrap();
        assert_eq!(
            cached.get("RSI", None, "period").await.unwrap(),
            Some(ParamValue::Int(14))
        );
        cached
            .set("RSI", None, "period", ParamValue::Int(9))
            .await
            .unwrap();
        assert_eq!(
            cached.get("RSI", None, "period").await.unwrap(),
            Some(ParamValue::Int(9))
        );
    }

    #[tokio::test]
    async fn test_candle_store_upsert_and_prune() {
        let db = db().await;
        let store = SqliteCandleStore::new(db.pool.clone());
        let mk = |offset: i64, close: Decimal| Candle {
            market: "KRW-BTC".to_string(),
            timestamp_utc: Utc.timestamp_opt(1_700_000_000 + offset * 60, 0).unwrap(),
            open: close,
            high: close + dec!(1),
            low: close - dec!(1),
            close,
            volume: Decimal::ONE,
            value: close,
            unit: 1,
        };
        store
            .save_batch(&[mk(0, dec!(1)), mk(1, dec!(2)), mk(2, dec!(3))])
            .await
            .unwrap();
        store.save_batch(&[mk(1, dec!(9))]).await.unwrap();

        let loaded = store.load("KRW-BTC", 1, 10).await.unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[0].close, dec!(3)); // newest-first
        assert_eq!(loaded[1].close, dec!(9)); // upserted

        let pruned = store
            .prune_older_than(Utc.timestamp_opt(1_700_000_000 + 60, 0).unwrap())
            .await
            .unwrap();
        assert_eq!(pruned, 1);
    }

    #[tokio::test]
    async fn test_user_registry_decrypt_failure_disables_user() {
        let db = db().await;
        let vault = Arc::new(CredentialVault::new("registry-secret"));
        let other_vault = CredentialVault::new("different-secret");

        let good_access = vault.encrypt("good-access").unwrap();
        let good_secret = vault.encrypt("good-secret").unwrap();
        let bad_access = other_vault.encrypt("bad-access").unwrap();
        let bad_secret = other_vault.encrypt("bad-secret").unwrap();

        for (name, access, secret) in [
            ("good", &good_access, &good_secret),
            ("bad", &bad_access, &bad_secret),
        ] {
            sqlx::query(
                r#"
                INSERT INTO users
                  (name, access_key_enc, secret_key_enc, auto_trading_enabled,
                   target_markets, excluded_markets, auto_select_top)
                VALUES (?, ?, ?, 1, 'KRW-BTC', '', 0)
                "#,
            )
            .bind(name)
            .bind(access)
            .bind(secret)
            .execute(&db.pool)
            .await
            .unwrap();
        }

        let registry = SqliteUserRegistry::new(db.pool.clone(), vault);
        let users = registry.active_users().await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].name, "good");
        assert_eq!(
            users[0].credentials.as_ref().unwrap().access_key,
            "good-access"
        );

        // the bad user's auto-trading was flipped off
        let users = registry.active_users().await.unwrap();
        assert_eq!(users.len(), 1);
        let row = sqlx::query("SELECT auto_trading_enabled FROM users WHERE name = 'bad'")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(row.get::<i64, _>("auto_trading_enabled"), 0);
    }

    #[tokio::test]
    async fn test_simulation_task_terminal_frozen() {
        let db = db().await;
        let store = SqliteSimulationTaskStore::new(db.pool.clone());
        let now = Utc::now();
        let mut task = SimulationTask {
            id: Uuid::new_v4(),
            kind: "backtest".to_string(),
            status: SimulationTaskStatus::Pending,
            progress: 0,
            step: "queued".to_string(),
            created_at: now,
            updated_at: now,
            result: None,
            error: None,
        };
        store.create(&task).await.unwrap();

        task.status = SimulationTaskStatus::Completed;
        task.progress = 100;
        store.update(&task).await.unwrap();

        task.status = SimulationTaskStatus::Running;
        assert!(store.update(&task).await.is_err());
    }
}
