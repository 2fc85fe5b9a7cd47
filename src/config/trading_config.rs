use super::{env_list, env_or};
use anyhow::Result;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyMode {
    Default,
    ScaledTrading,
}

impl FromStr for StrategyMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "DEFAULT" => Ok(StrategyMode::Default),
            "SCALED_TRADING" => Ok(StrategyMode::ScaledTrading),
            other => anyhow::bail!(
                "invalid strategy mode {other:?}; must be DEFAULT or SCALED_TRADING"
            ),
        }
    }
}

/// `trading.*` keys: loop enablement, market selection, sizing and schedule.
#[derive(Debug, Clone)]
pub struct TradingEnvConfig {
    pub enabled: bool,
    pub target_market: Option<String>,
    pub target_markets: Vec<String>,
    pub excluded_markets: Vec<String>,
    pub auto_select_top: usize,
    pub investment_ratio: f64,
    pub min_order_amount: i64,
    pub strategy_mode: StrategyMode,
    pub schedule_cron: String,
    pub candle_unit: u32,
    pub candle_count: usize,
    pub tick_deadline_secs: u64,
    pub markets_pool: usize,
    pub users_pool: usize,
    pub max_positions: usize,
    pub daily_loss_limit: i64,
    pub stop_loss_cooldown_candles: u32,
    pub max_slippage_pct: f64,
}

impl TradingEnvConfig {
    pub fn from_env() -> Result<Self> {
        let mut target_markets = env_list("TRADING_TARGET_MARKETS");
        // `trading.target_market` is the single-market shorthand.
        let target_market = std::env::var("TRADING_TARGET_MARKET").ok();
        if let Some(market) = &target_market
            && !target_markets.contains(market)
        {
            target_markets.insert(0, market.clone());
        }

        let config = Self {
            enabled: env_or("TRADING_ENABLED", false)?,
            target_market,
            target_markets,
            excluded_markets: env_list("TRADING_EXCLUDED_MARKETS"),
            auto_select_top: env_or("TRADING_AUTO_SELECT_TOP", 0usize)?,
            investment_ratio: env_or("TRADING_INVESTMENT_RATIO", 0.3f64)?,
            min_order_amount: env_or("TRADING_MIN_ORDER_AMOUNT", 6_000i64)?,
            strategy_mode: env_or("TRADING_STRATEGY_MODE", StrategyMode::Default)?,
            schedule_cron: env_or("TRADING_SCHEDULE_CRON", "* * * * *".to_string())?,
            candle_unit: env_or("TRADING_CANDLE_UNIT", 1u32)?,
            candle_count: env_or("TRADING_CANDLE_COUNT", 100usize)?,
            tick_deadline_secs: env_or("TRADING_TICK_DEADLINE_SECS", 30u64)?,
            markets_pool: env_or("TRADING_MARKETS_POOL", 8usize)?,
            users_pool: env_or("TRADING_USERS_POOL", 4usize)?,
            max_positions: env_or("TRADING_MAX_POSITIONS", 5usize)?,
            daily_loss_limit: env_or("TRADING_DAILY_LOSS_LIMIT", 50_000i64)?,
            stop_loss_cooldown_candles: env_or("TRADING_STOP_LOSS_COOLDOWN_CANDLES", 30u32)?,
            max_slippage_pct: env_or("TRADING_MAX_SLIPPAGE_PCT", 0.3f64)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.investment_ratio) {
            anyhow::bail!(
                "trading.investment_ratio must be in 0..=1, got {}",
                self.investment_ratio
            );
        }
        if self.min_order_amount <= 0 {
            anyhow::bail!("trading.min_order_amount must be positive");
        }
        if !matches!(self.candle_unit, 1 | 3 | 5 | 15 | 30 | 60 | 240) {
            anyhow::bail!(
                "trading.candle_unit must be one of 1,3,5,15,30,60,240, got {}",
                self.candle_unit
            );
        }
        if self.candle_count < 30 || self.candle_count > 200 {
            anyhow::bail!(
                "trading.candle_count must be in 30..=200, got {}",
                self.candle_count
            );
        }
        Ok(())
    }
}
