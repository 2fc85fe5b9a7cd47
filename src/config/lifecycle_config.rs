use super::env_or;
use anyhow::Result;

/// `realtrading.*` keys: scaled entry split, take-profit, stops and trailing.
#[derive(Debug, Clone)]
pub struct LifecycleEnvConfig {
    pub entry_ratio1: f64,
    pub entry_ratio2: f64,
    pub entry_ratio3: f64,
    pub entry2_drop_threshold: f64,
    pub entry3_drop_threshold: f64,
    pub partial_take_profit_rate: f64,
    pub partial_exit_ratio: f64,
    pub take_profit_atr_multiplier: f64,
    pub stop_loss_atr_multiplier: f64,
    pub max_stop_loss_rate: f64,
    pub min_stop_loss_rate: f64,
    pub trailing_activation_threshold: f64,
    pub trailing_atr_multiplier: f64,
    pub trailing_stop_rate: f64,
    pub min_hold_candles: u32,
}

impl LifecycleEnvConfig {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            entry_ratio1: env_or("REALTRADING_ENTRY_RATIO1", 0.30f64)?,
            entry_ratio2: env_or("REALTRADING_ENTRY_RATIO2", 0.30f64)?,
            entry_ratio3: env_or("REALTRADING_ENTRY_RATIO3", 0.40f64)?,
            entry2_drop_threshold: env_or("REALTRADING_ENTRY2_DROP_THRESHOLD", 0.015f64)?,
            entry3_drop_threshold: env_or("REALTRADING_ENTRY3_DROP_THRESHOLD", 0.025f64)?,
            partial_take_profit_rate: env_or("REALTRADING_PARTIAL_TAKE_PROFIT_RATE", 0.025f64)?,
            partial_exit_ratio: env_or("REALTRADING_PARTIAL_EXIT_RATIO", 0.50f64)?,
            take_profit_atr_multiplier: env_or("REALTRADING_TAKE_PROFIT_ATR_MULTIPLIER", 3.0f64)?,
            stop_loss_atr_multiplier: env_or("REALTRADING_STOP_LOSS_ATR_MULTIPLIER", 2.0f64)?,
            max_stop_loss_rate: env_or("REALTRADING_MAX_STOP_LOSS_RATE", 0.03f64)?,
            min_stop_loss_rate: env_or("REALTRADING_MIN_STOP_LOSS_RATE", 0.005f64)?,
            trailing_activation_threshold: env_or(
                "REALTRADING_TRAILING_ACTIVATION_THRESHOLD",
                0.03f64,
            )?,
            trailing_atr_multiplier: env_or("REALTRADING_TRAILING_ATR_MULTIPLIER", 0.0f64)?,
            trailing_stop_rate: env_or("REALTRADING_TRAILING_STOP_RATE", 0.015f64)?,
            min_hold_candles: env_or("REALTRADING_MIN_HOLD_CANDLES", 3u32)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let ratio_sum = self.entry_ratio1 + self.entry_ratio2 + self.entry_ratio3;
        if (ratio_sum - 1.0).abs() > 1e-9 {
            anyhow::bail!("realtrading entry ratios must sum to 1.0, got {ratio_sum}");
        }
        if self.entry2_drop_threshold >= self.entry3_drop_threshold {
            anyhow::bail!(
                "entry3 drop threshold must exceed entry2 ({} vs {})",
                self.entry3_drop_threshold,
                self.entry2_drop_threshold
            );
        }
        if !(0.0..1.0).contains(&self.partial_exit_ratio) || self.partial_exit_ratio == 0.0 {
            anyhow::bail!(
                "partial_exit_ratio must be in (0, 1), got {}",
                self.partial_exit_ratio
            );
        }
        if self.min_stop_loss_rate >= self.max_stop_loss_rate {
            anyhow::bail!(
                "min_stop_loss_rate {} must be below max_stop_loss_rate {}",
                self.min_stop_loss_rate,
                self.max_stop_loss_rate
            );
        }
        Ok(())
    }
}
