//! Pre-trade gate and position sizing.
//!
//! Every BUY passes through `assess_entry` before the execution service sees
//! it. A rejection carries the violated rule; nothing is mutated on the way
//! out. Sizing scales the configured investment ratio by signal strength.

use crate::domain::errors::{RiskViolation, StoreError};
use crate::domain::ports::{Clock, PositionStore, TradingUser};
use crate::domain::types::kst_offset;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub max_concurrent_positions: usize,
    /// KRW of realized losses per KST day before trading halts for the day.
    pub daily_loss_limit: Decimal,
    pub signal_strength_floor: f64,
    pub min_order_amount: Decimal,
    /// Fraction of the KRW balance one position may commit (0..1).
    pub investment_ratio: f64,
    pub stop_loss_cooldown_candles: u32,
    pub max_slippage_pct: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_concurrent_positions: 5,
            daily_loss_limit: Decimal::from(50_000),
            signal_strength_floor: 50.0,
            min_order_amount: Decimal::from(6_000),
            investment_ratio: 0.3,
            stop_loss_cooldown_candles: 30,
            max_slippage_pct: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Approved,
    Rejected(RiskViolation),
}

pub struct RiskManager {
    config: RiskConfig,
    positions: Arc<dyn PositionStore>,
    clock: Arc<dyn Clock>,
}

impl RiskManager {
    pub fn new(config: RiskConfig, positions: Arc<dyn PositionStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            positions,
            clock,
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Gate one BUY. Checks run cheapest-first; the first violated rule wins.
    #[allow(clippy::too_many_arguments)]
    pub async fn assess_entry(
        &self,
        user: &TradingUser,
        market: &str,
        signal_strength: f64,
        order_funds: Decimal,
        krw_balance: Decimal,
        candle_unit: u32,
        estimated_slippage_pct: f64,
    ) -> Result<GateDecision, StoreError> {
        if signal_strength < self.config.signal_strength_floor {
            return Ok(GateDecision::Rejected(RiskViolation::SignalTooWeak {
                strength: signal_strength,
                floor: self.config.signal_strength_floor,
            }));
        }

        if order_funds < self.config.min_order_amount {
            return Ok(GateDecision::Rejected(RiskViolation::BelowMinOrder {
                funds: order_funds,
                min: self.config.min_order_amount,
            }));
        }

        if krw_balance < order_funds {
            return Ok(GateDecision::Rejected(RiskViolation::InsufficientBalance {
                need: order_funds,
                available: krw_balance,
            }));
        }

        if estimated_slippage_pct > self.config.max_slippage_pct {
            return Ok(GateDecision::Rejected(RiskViolation::SlippageTooHigh {
                estimated_pct: estimated_slippage_pct,
                max_pct: self.config.max_slippage_pct,
            }));
        }

        let open = self.positions.open_for_user(user.id).await?;
        if open.len() >= self.config.max_concurrent_positions {
            return Ok(GateDecision::Rejected(RiskViolation::MaxPositions {
                open: open.len(),
                limit: self.config.max_concurrent_positions,
            }));
        }

        let day_start = self.start_of_kst_day();
        let closed_today = self.positions.closed_since(user.id, day_start).await?;
        let lost_today: Decimal = closed_today
            .iter()
            .filter(|p| p.realized_pnl < Decimal::ZERO)
            .map(|p| -p.realized_pnl)
            .sum();
        if lost_today >= self.config.daily_loss_limit {
            return Ok(GateDecision::Rejected(RiskViolation::DailyLossLimit {
                lost: lost_today,
                limit: self.config.daily_loss_limit,
            }));
        }

        if let Some(last) = self.positions.last_closed(user.id, market).await?
            && last.realized_pnl < Decimal::ZERO
        {
            let cooldown = Duration::minutes(
                candle_unit as i64 * self.config.stop_loss_cooldown_candles as i64,
            );
            let elapsed = self.clock.now() - last.updated_at;
            if elapsed < cooldown {
                let remaining = (cooldown - elapsed).num_minutes().max(0) as u32
                    / candle_unit.max(1)
                    + 1;
                debug!(market, "entry suppressed by loss cooldown");
                return Ok(GateDecision::Rejected(RiskViolation::LossCooldown {
                    market: market.to_string(),
                    remaining_candles: remaining,
                }));
            }
        }

        Ok(GateDecision::Approved)
    }

    /// Funds for one entry: investment ratio of the balance scaled by signal
    /// strength (half size at the floor, full size at unanimity).
    pub fn position_size(&self, krw_balance: Decimal, signal_strength: f64) -> Decimal {
        let scale = (0.5 + signal_strength / 200.0).clamp(0.5, 1.0);
        let ratio = Decimal::from_f64(self.config.investment_ratio * scale)
            .unwrap_or(Decimal::ZERO);
        (krw_balance * ratio).round_dp(0)
    }

    fn start_of_kst_day(&self) -> DateTime<Utc> {
        let now_kst = self.clock.now().with_timezone(&kst_offset());
        now_kst
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight is valid")
            .and_local_timezone(kst_offset())
            .single()
            .expect("KST has no DST gaps")
            .with_timezone(&Utc)
    }
}
