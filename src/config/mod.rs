//! Environment-driven configuration, split by domain: trading loop, position
//! lifecycle, and security/persistence. Dotted keys from the documentation
//! map to env vars by upper-casing and replacing dots with underscores
//! (`trading.investment_ratio` -> `TRADING_INVESTMENT_RATIO`).

mod lifecycle_config;
mod security_config;
mod trading_config;

pub use lifecycle_config::LifecycleEnvConfig;
pub use security_config::SecurityEnvConfig;
pub use trading_config::{StrategyMode, TradingEnvConfig};

use crate::application::execution::ExecutionConfig;
use crate::application::lifecycle::LifecycleConfig;
use crate::application::risk_manager::RiskConfig;
use crate::application::scheduler::{SchedulerConfig, parse_cron_interval};
use crate::application::voting::VoteMode;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;

pub(crate) fn env_or<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw:?}: {e}")),
        Err(_) => Ok(default),
    }
}

pub(crate) fn env_list(key: &str) -> Vec<String> {
    env::var(key)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct Config {
    pub trading: TradingEnvConfig,
    pub lifecycle: LifecycleEnvConfig,
    pub security: SecurityEnvConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let trading = TradingEnvConfig::from_env().context("failed to load trading config")?;
        let lifecycle =
            LifecycleEnvConfig::from_env().context("failed to load lifecycle config")?;
        let security = SecurityEnvConfig::from_env(trading.enabled)
            .context("failed to load security config")?;
        Ok(Self {
            trading,
            lifecycle,
            security,
        })
    }

    pub fn to_scheduler_config(&self) -> Result<SchedulerConfig> {
        Ok(SchedulerConfig {
            tick_interval: parse_cron_interval(&self.trading.schedule_cron)
                .context("invalid trading.schedule.cron")?,
            candle_unit: self.trading.candle_unit,
            candle_count: self.trading.candle_count,
            tick_deadline: std::time::Duration::from_secs(self.trading.tick_deadline_secs),
            markets_pool: self.trading.markets_pool,
            users_pool: self.trading.users_pool,
            mode: match self.trading.strategy_mode {
                StrategyMode::Default => VoteMode::Default,
                StrategyMode::ScaledTrading => VoteMode::ScaledTrading,
            },
        })
    }

    pub fn to_risk_config(&self) -> RiskConfig {
        RiskConfig {
            max_concurrent_positions: self.trading.max_positions,
            daily_loss_limit: Decimal::from(self.trading.daily_loss_limit),
            signal_strength_floor: 50.0,
            min_order_amount: Decimal::from(self.trading.min_order_amount),
            investment_ratio: self.trading.investment_ratio,
            stop_loss_cooldown_candles: self.trading.stop_loss_cooldown_candles,
            max_slippage_pct: self.trading.max_slippage_pct,
        }
    }

    pub fn to_lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            entry_ratio1: self.lifecycle.entry_ratio1,
            entry_ratio2: self.lifecycle.entry_ratio2,
            entry_ratio3: self.lifecycle.entry_ratio3,
            entry2_drop_threshold: self.lifecycle.entry2_drop_threshold,
            entry3_drop_threshold: self.lifecycle.entry3_drop_threshold,
            partial_take_profit_rate: self.lifecycle.partial_take_profit_rate,
            partial_exit_ratio: self.lifecycle.partial_exit_ratio,
            take_profit_atr_multiplier: self.lifecycle.take_profit_atr_multiplier,
            stop_loss_atr_multiplier: self.lifecycle.stop_loss_atr_multiplier,
            max_stop_loss_rate: self.lifecycle.max_stop_loss_rate,
            min_stop_loss_rate: self.lifecycle.min_stop_loss_rate,
            trailing_activation_threshold: self.lifecycle.trailing_activation_threshold,
            trailing_atr_multiplier: self.lifecycle.trailing_atr_multiplier,
            trailing_stop_rate: self.lifecycle.trailing_stop_rate,
            min_hold_candles: self.lifecycle.min_hold_candles,
            atr_period: 14,
        }
    }

    pub fn to_execution_config(&self) -> ExecutionConfig {
        ExecutionConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_list_parsing() {
        // unset key
        assert!(env_list("AUTOCOIN_TEST_UNSET_LIST").is_empty());
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::from_env().expect("defaults should parse");
        assert!(!config.trading.enabled);
        assert_eq!(config.trading.min_order_amount, 6_000);
        assert!((config.lifecycle.entry_ratio1 - 0.30).abs() < f64::EPSILON);
        assert_eq!(config.trading.schedule_cron, "* * * * *");
    }

    #[test]
    fn test_scheduler_config_from_cron() {
        let config = Config::from_env().unwrap();
        let sched = config.to_scheduler_config().unwrap();
        assert_eq!(sched.tick_interval, std::time::Duration::from_secs(60));
        assert_eq!(sched.markets_pool, 8);
    }
}
