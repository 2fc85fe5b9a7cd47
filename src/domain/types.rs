use chrono::{DateTime, FixedOffset, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Korea Standard Time offset (+09:00). The exchange reports candle times in
/// both UTC and KST; all internal arithmetic stays in UTC.
pub fn kst_offset() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).expect("fixed +09:00 offset is valid")
}

/// OHLCV aggregate for one time bucket of one market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub market: String,
    pub timestamp_utc: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    /// Accumulated trade volume (coin units).
    pub volume: Decimal,
    /// Accumulated trade value (KRW).
    pub value: Decimal,
    /// Candle granularity in minutes.
    pub unit: u32,
}

impl Candle {
    pub fn timestamp_kst(&self) -> DateTime<FixedOffset> {
        self.timestamp_utc.with_timezone(&kst_offset())
    }

    /// low <= min(open, close) <= max(open, close) <= high, volume >= 0.
    pub fn is_well_formed(&self) -> bool {
        let body_low = self.open.min(self.close);
        let body_high = self.open.max(self.close);
        self.low <= body_low && body_high <= self.high && self.volume >= Decimal::ZERO
    }
}

/// Listing entry for one tradable market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketInfo {
    pub market: String,
    pub korean_name: String,
    pub english_name: String,
    /// Exchange-flagged (e.g. CAUTION); flagged markets never enter a working set.
    pub warning: bool,
}

/// Ephemeral 24h snapshot for a market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub market: String,
    pub trade_price: Decimal,
    pub change_rate_24h: f64,
    pub acc_trade_value_24h: Decimal,
}

/// One exchange balance entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub currency: String,
    pub balance: Decimal,
    pub locked: Decimal,
    pub avg_buy_price: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Bid,
    Ask,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Bid => write!(f, "bid"),
            OrderSide::Ask => write!(f, "ask"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Wait,
    Watch,
    Done,
    Cancel,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderState::Done | OrderState::Cancel)
    }
}

impl FromStr for OrderState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wait" => Ok(OrderState::Wait),
            "watch" => Ok(OrderState::Watch),
            "done" => Ok(OrderState::Done),
            "cancel" => Ok(OrderState::Cancel),
            other => Err(format!("unknown order state: {other}")),
        }
    }
}

/// Exchange order. Created by the execution service, mutated only by gateway
/// confirmation, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub uuid: Uuid,
    pub market: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    /// Submitted limit price (limit orders only).
    pub price: Option<Decimal>,
    /// KRW funds to spend (market bid only).
    pub funds: Option<Decimal>,
    /// Coin volume to trade (market ask / limit).
    pub volume: Option<Decimal>,
    pub executed_volume: Decimal,
    pub executed_funds: Decimal,
    pub paid_fee: Decimal,
    pub state: OrderState,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// Effective fill price, once something has executed.
    pub fn fill_price(&self) -> Option<Decimal> {
        if self.executed_volume > Decimal::ZERO {
            Some(self.executed_funds / self.executed_volume)
        } else {
            None
        }
    }
}

/// Request shape handed to the order gateway.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub market: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub price: Option<Decimal>,
    pub funds: Option<Decimal>,
    pub volume: Option<Decimal>,
    /// Client-generated idempotency token; retries after a timeout reuse it so
    /// the gateway can suppress duplicates.
    pub identifier: String,
}

/// Closed set of labels attached to every position close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitReason {
    StopLossFixed,
    StopLossAtr,
    TakeProfit,
    TrailingStop,
    SignalInvalid,
    Overheated,
    VolumeDrop,
    Timeout,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLossFixed => "STOP_LOSS_FIXED",
            ExitReason::StopLossAtr => "STOP_LOSS_ATR",
            ExitReason::TakeProfit => "TAKE_PROFIT",
            ExitReason::TrailingStop => "TRAILING_STOP",
            ExitReason::SignalInvalid => "SIGNAL_INVALID",
            ExitReason::Overheated => "OVERHEATED",
            ExitReason::VolumeDrop => "VOLUME_DROP",
            ExitReason::Timeout => "TIMEOUT",
        }
    }

    pub const ALL: [ExitReason; 8] = [
        ExitReason::StopLossFixed,
        ExitReason::StopLossAtr,
        ExitReason::TakeProfit,
        ExitReason::TrailingStop,
        ExitReason::SignalInvalid,
        ExitReason::Overheated,
        ExitReason::VolumeDrop,
        ExitReason::Timeout,
    ];
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExitReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExitReason::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| format!("unknown exit reason: {s}"))
    }
}

/// One filled side of a trade, append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Option<i64>,
    pub user_id: i64,
    pub market: String,
    pub side: OrderSide,
    pub executed_at: DateTime<Utc>,
    /// KRW amount (cost for bids, proceeds for asks).
    pub amount: Decimal,
    pub volume: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub order_uuid: Uuid,
    pub strategy: String,
    pub target_price: Option<Decimal>,
    /// Highest price observed since the position opened.
    pub highest_price: Option<Decimal>,
    pub half_sold: bool,
    pub stop_loss: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimulationTaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SimulationTaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SimulationTaskStatus::Completed
                | SimulationTaskStatus::Failed
                | SimulationTaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SimulationTaskStatus::Pending => "PENDING",
            SimulationTaskStatus::Running => "RUNNING",
            SimulationTaskStatus::Completed => "COMPLETED",
            SimulationTaskStatus::Failed => "FAILED",
            SimulationTaskStatus::Cancelled => "CANCELLED",
        }
    }
}

/// Async backtest task. Pending -> Running -> (Completed | Failed |
/// Cancelled); never revived after a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationTask {
    pub id: Uuid,
    pub kind: String,
    pub status: SimulationTaskStatus,
    /// 0..=100.
    pub progress: u8,
    pub step: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// Ternary strategy verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    Buy,
    Hold,
    Sell,
}

impl Signal {
    pub fn value(&self) -> i8 {
        match self {
            Signal::Buy => 1,
            Signal::Hold => 0,
            Signal::Sell => -1,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Buy => write!(f, "BUY"),
            Signal::Hold => write!(f, "HOLD"),
            Signal::Sell => write!(f, "SELL"),
        }
    }
}
