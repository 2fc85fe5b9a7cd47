use crate::application::strategies::params::StrategyParams;
use crate::domain::position::{Position, PositionStatus};
use crate::domain::types::{Candle, ExitReason, Signal, TradeRecord};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

/// Read-only position snapshot as strategies see it. Live trading builds it
/// from the stored `Position`; backtests build a synthetic one from the
/// simulated holding state, so the same strategy code serves both paths.
#[derive(Debug, Clone)]
pub struct PositionView {
    pub status: PositionStatus,
    pub entry_phase: u8,
    pub exit_phase: u8,
    pub avg_entry_price: Decimal,
    pub first_leg_price: Option<Decimal>,
    pub remaining_quantity: Decimal,
    pub highest_price: Option<Decimal>,
    pub target_price: Option<Decimal>,
    pub stop_loss_price: Option<Decimal>,
    pub trailing_stop_price: Option<Decimal>,
    pub opened_at: Option<DateTime<Utc>>,
    /// Candle units elapsed since the first entry leg.
    pub hold_candles: u32,
}

impl PositionView {
    pub fn from_position(position: &Position, hold_candles: u32) -> Self {
        Self {
            status: position.status,
            entry_phase: position.entry_phase,
            exit_phase: position.exit_phase,
            avg_entry_price: position.avg_entry_price,
            first_leg_price: position.first_leg_price(),
            remaining_quantity: position.remaining_quantity(),
            highest_price: position.trailing_high_price,
            target_price: position.target_price,
            stop_loss_price: position.stop_loss_price,
            trailing_stop_price: position.trailing_stop_price,
            opened_at: position.time_of_first_leg(),
            hold_candles,
        }
    }

    /// Synthetic single-leg holding for backtests.
    pub fn synthetic(
        buy_price: Decimal,
        quantity: Decimal,
        highest_price: Decimal,
        target_price: Option<Decimal>,
        opened_at: DateTime<Utc>,
        hold_candles: u32,
    ) -> Self {
        Self {
            status: PositionStatus::Active,
            entry_phase: 1,
            exit_phase: 0,
            avg_entry_price: buy_price,
            first_leg_price: Some(buy_price),
            remaining_quantity: quantity,
            highest_price: Some(highest_price),
            target_price,
            stop_loss_price: None,
            trailing_stop_price: None,
            opened_at: Some(opened_at),
            hold_candles,
        }
    }

    pub fn is_open(&self) -> bool {
        !matches!(self.status, PositionStatus::Pending | PositionStatus::Closed)
    }

    pub fn unrealized_return(&self, price: Decimal) -> Decimal {
        if self.avg_entry_price.is_zero() {
            return Decimal::ZERO;
        }
        (price - self.avg_entry_price) / self.avg_entry_price
    }
}

/// Everything a strategy may read for one analysis call. The candle window is
/// newest-first. Evaluation is CPU-bound; the whole window is passed in and
/// nothing here suspends.
pub struct AnalysisContext<'a> {
    pub market: &'a str,
    pub candles: &'a [Candle],
    pub current_price: Decimal,
    /// f64 view of the current price for indicator comparisons.
    pub price_f64: f64,
    pub position: Option<&'a PositionView>,
    pub last_trade: Option<&'a TradeRecord>,
    pub params: &'a StrategyParams,
    pub now: DateTime<Utc>,
}

impl<'a> AnalysisContext<'a> {
    pub fn new(
        market: &'a str,
        candles: &'a [Candle],
        position: Option<&'a PositionView>,
        last_trade: Option<&'a TradeRecord>,
        params: &'a StrategyParams,
        now: DateTime<Utc>,
    ) -> Self {
        let current_price = candles
            .first()
            .map(|c| c.close)
            .unwrap_or(Decimal::ZERO);
        Self {
            market,
            candles,
            current_price,
            price_f64: current_price.to_f64().unwrap_or(0.0),
            position,
            last_trade,
            params,
            now,
        }
    }

    pub fn has_open_position(&self) -> bool {
        self.position.map(|p| p.is_open()).unwrap_or(false)
    }
}

/// Strategy output. Replaces the scratch channel the decision layer would
/// otherwise share: hints and exit reasons travel with the signal.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub signal: Signal,
    pub reason: String,
    pub target_price: Option<Decimal>,
    pub stop_loss_price: Option<Decimal>,
    pub exit_reason: Option<ExitReason>,
}

impl Analysis {
    pub fn hold(reason: impl Into<String>) -> Self {
        Self {
            signal: Signal::Hold,
            reason: reason.into(),
            target_price: None,
            stop_loss_price: None,
            exit_reason: None,
        }
    }

    pub fn buy(reason: impl Into<String>) -> Self {
        Self {
            signal: Signal::Buy,
            reason: reason.into(),
            target_price: None,
            stop_loss_price: None,
            exit_reason: None,
        }
    }

    pub fn sell(reason: impl Into<String>, exit_reason: ExitReason) -> Self {
        Self {
            signal: Signal::Sell,
            reason: reason.into(),
            target_price: None,
            stop_loss_price: None,
            exit_reason: Some(exit_reason),
        }
    }

    pub fn with_target(mut self, price: Decimal) -> Self {
        self.target_price = Some(price);
        self
    }

    pub fn with_stop(mut self, price: Decimal) -> Self {
        self.stop_loss_price = Some(price);
        self
    }
}
