use crate::domain::types::{ExitReason, TradeRecord};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;

/// Summary of one backtest run. `final_total_asset` always equals
/// `final_balance + final_coin_balance * last price` by construction.
#[derive(Debug, Clone, Serialize)]
pub struct BacktestReport {
    pub market: String,
    pub strategy: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub initial_balance: Decimal,
    /// KRW left at the end of the walk.
    pub final_balance: Decimal,
    pub final_coin_balance: Decimal,
    pub final_coin_value: Decimal,
    pub final_total_asset: Decimal,
    /// Percent.
    pub total_profit_rate: f64,
    pub max_profit_rate: f64,
    pub max_loss_rate: f64,
    pub buy_and_hold_rate: f64,
    pub total_trades: u32,
    pub buy_count: u32,
    pub sell_count: u32,
    pub win_count: u32,
    pub loss_count: u32,
    /// Percent of closed round trips that won.
    pub win_rate: f64,
    pub exit_reason_counts: HashMap<ExitReason, u32>,
    pub trades: Vec<TradeRecord>,
}

impl BacktestReport {
    /// Whether the strategy beat simply holding over the same period.
    pub fn beat_buy_and_hold(&self) -> bool {
        self.total_profit_rate > self.buy_and_hold_rate
    }
}
