use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::info;

/// Shared SQLite handle. WAL mode keeps the scheduler's concurrent readers
/// off the single writer's back.
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str) -> Result<Self> {
        if let Some(path_part) = db_url.strip_prefix("sqlite://") {
            let path = Path::new(path_part);
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
                && !parent.exists()
            {
                fs::create_dir_all(parent)
                    .await
                    .context("failed to create database directory")?;
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("failed to connect to SQLite database")?;

        info!("connected to database: {db_url}");
        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                access_key_enc TEXT,
                secret_key_enc TEXT,
                auto_trading_enabled INTEGER NOT NULL DEFAULT 0,
                target_markets TEXT NOT NULL DEFAULT '',
                excluded_markets TEXT NOT NULL DEFAULT '',
                auto_select_top INTEGER NOT NULL DEFAULT 0
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS trade_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                market TEXT NOT NULL,
                side TEXT NOT NULL,
                executed_at INTEGER NOT NULL,
                amount TEXT NOT NULL,
                volume TEXT NOT NULL,
                price TEXT NOT NULL,
                fee TEXT NOT NULL,
                order_uuid TEXT NOT NULL,
                strategy TEXT NOT NULL,
                target_price TEXT,
                highest_price TEXT,
                half_sold INTEGER NOT NULL DEFAULT 0,
                stop_loss INTEGER NOT NULL DEFAULT 0
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_trade_history_user_market
            ON trade_history (user_id, market, executed_at)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS candle_data (
                market TEXT NOT NULL,
                candle_date_time_kst TEXT NOT NULL,
                unit INTEGER NOT NULL,
                timestamp_utc INTEGER NOT NULL,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                close TEXT NOT NULL,
                volume TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (market, candle_date_time_kst, unit)
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_candle_data_market_kst
            ON candle_data (market, candle_date_time_kst)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                market TEXT NOT NULL,
                status TEXT NOT NULL,
                realized_pnl TEXT NOT NULL DEFAULT '0',
                updated_at INTEGER NOT NULL,
                open INTEGER NOT NULL DEFAULT 1,
                payload TEXT NOT NULL
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_positions_open_slot
            ON positions (user_id, market) WHERE open = 1
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_positions_user_updated
            ON positions (user_id, updated_at)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS user_strategies (
                user_id INTEGER NOT NULL,
                strategy_name TEXT NOT NULL,
                PRIMARY KEY (user_id, strategy_name)
            )
            "#,
            // user_id 0 holds the global scope
            r#"
            CREATE TABLE IF NOT EXISTS strategy_parameters (
                strategy_name TEXT NOT NULL,
                user_id INTEGER NOT NULL DEFAULT 0,
                param_key TEXT NOT NULL,
                value TEXT NOT NULL,
                value_type TEXT NOT NULL,
                PRIMARY KEY (strategy_name, user_id, param_key)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS simulation_tasks (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                progress INTEGER NOT NULL DEFAULT 0,
                step TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                result TEXT,
                error TEXT
            )
            "#,
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&mut *conn)
                .await
                .with_context(|| format!("schema statement failed: {statement}"))?;
        }

        info!("database schema initialized");
        Ok(())
    }
}
