//! Wire DTOs and their conversions into domain types. Numeric fields arrive
//! as strings or JSON floats; conversion rejects NaN and malformed values as
//! exchange-contract violations instead of letting them reach a position.

use crate::domain::errors::ExchangeError;
use crate::domain::types::{
    Account, Candle, MarketInfo, Order, OrderKind, OrderSide, OrderState, Ticker,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde::Deserialize;
use std::str::FromStr;
use uuid::Uuid;

fn contract_violation(market: &str, reason: impl Into<String>) -> ExchangeError {
    ExchangeError::ContractViolation {
        market: market.to_string(),
        reason: reason.into(),
    }
}

fn decimal_from_str(market: &str, field: &str, raw: &str) -> Result<Decimal, ExchangeError> {
    Decimal::from_str(raw)
        .map_err(|e| contract_violation(market, format!("{field}={raw:?}: {e}")))
}

fn decimal_from_f64(market: &str, field: &str, raw: f64) -> Result<Decimal, ExchangeError> {
    if !raw.is_finite() {
        return Err(contract_violation(market, format!("{field} is not finite: {raw}")));
    }
    Decimal::from_f64(raw)
        .ok_or_else(|| contract_violation(market, format!("{field}={raw} not representable")))
}

#[derive(Debug, Deserialize)]
pub struct MarketDto {
    pub market: String,
    pub korean_name: String,
    pub english_name: String,
    pub market_warning: Option<String>,
}

impl From<MarketDto> for MarketInfo {
    fn from(dto: MarketDto) -> Self {
        let warning = dto
            .market_warning
            .as_deref()
            .map(|w| !w.eq_ignore_ascii_case("NONE"))
            .unwrap_or(false);
        MarketInfo {
            market: dto.market,
            korean_name: dto.korean_name,
            english_name: dto.english_name,
            warning,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TickerDto {
    pub market: String,
    pub trade_price: f64,
    pub signed_change_rate: f64,
    pub acc_trade_price_24h: f64,
}

impl TickerDto {
    pub fn into_domain(self) -> Result<Ticker, ExchangeError> {
        Ok(Ticker {
            trade_price: decimal_from_f64(&self.market, "trade_price", self.trade_price)?,
            change_rate_24h: self.signed_change_rate,
            acc_trade_value_24h: decimal_from_f64(
                &self.market,
                "acc_trade_price_24h",
                self.acc_trade_price_24h,
            )?,
            market: self.market,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct CandleDto {
    pub market: String,
    pub candle_date_time_utc: String,
    pub opening_price: f64,
    pub high_price: f64,
    pub low_price: f64,
    pub trade_price: f64,
    pub candle_acc_trade_volume: f64,
    pub candle_acc_trade_price: f64,
    #[serde(default)]
    pub unit: Option<u32>,
}

impl CandleDto {
    pub fn into_domain(self, fallback_unit: u32) -> Result<Candle, ExchangeError> {
        let naive = NaiveDateTime::parse_from_str(&self.candle_date_time_utc, "%Y-%m-%dT%H:%M:%S")
            .map_err(|e| {
                contract_violation(
                    &self.market,
                    format!("candle_date_time_utc={:?}: {e}", self.candle_date_time_utc),
                )
            })?;
        let candle = Candle {
            timestamp_utc: DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc),
            open: decimal_from_f64(&self.market, "opening_price", self.opening_price)?,
            high: decimal_from_f64(&self.market, "high_price", self.high_price)?,
            low: decimal_from_f64(&self.market, "low_price", self.low_price)?,
            close: decimal_from_f64(&self.market, "trade_price", self.trade_price)?,
            volume: decimal_from_f64(
                &self.market,
                "candle_acc_trade_volume",
                self.candle_acc_trade_volume,
            )?,
            value: decimal_from_f64(
                &self.market,
                "candle_acc_trade_price",
                self.candle_acc_trade_price,
            )?,
            unit: self.unit.unwrap_or(fallback_unit),
            market: self.market,
        };
        if !candle.is_well_formed() {
            return Err(contract_violation(&candle.market, "malformed OHLCV candle"));
        }
        Ok(candle)
    }
}

#[derive(Debug, Deserialize)]
pub struct AccountDto {
    pub currency: String,
    pub balance: String,
    pub locked: String,
    pub avg_buy_price: String,
}

impl AccountDto {
    pub fn into_domain(self) -> Result<Account, ExchangeError> {
        Ok(Account {
            balance: decimal_from_str(&self.currency, "balance", &self.balance)?,
            locked: decimal_from_str(&self.currency, "locked", &self.locked)?,
            avg_buy_price: decimal_from_str(&self.currency, "avg_buy_price", &self.avg_buy_price)?,
            currency: self.currency,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct OrderTradeDto {
    pub funds: String,
}

#[derive(Debug, Deserialize)]
pub struct OrderDto {
    pub uuid: String,
    pub side: String,
    pub ord_type: String,
    pub state: String,
    pub market: String,
    pub created_at: String,
    pub price: Option<String>,
    pub volume: Option<String>,
    pub executed_volume: String,
    pub paid_fee: String,
    #[serde(default)]
    pub trades: Vec<OrderTradeDto>,
}

impl OrderDto {
    pub fn into_domain(self) -> Result<Order, ExchangeError> {
        let uuid = Uuid::from_str(&self.uuid)
            .map_err(|e| contract_violation(&self.market, format!("uuid={:?}: {e}", self.uuid)))?;
        let side = match self.side.as_str() {
            "bid" => OrderSide::Bid,
            "ask" => OrderSide::Ask,
            other => return Err(contract_violation(&self.market, format!("side={other:?}"))),
        };
        // ord_type "price" is a market bid by funds, "market" a market ask.
        let kind = match self.ord_type.as_str() {
            "limit" => OrderKind::Limit,
            "price" | "market" => OrderKind::Market,
            other => {
                return Err(contract_violation(&self.market, format!("ord_type={other:?}")));
            }
        };
        let state = OrderState::from_str(&self.state)
            .map_err(|e| contract_violation(&self.market, e))?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                contract_violation(&self.market, format!("created_at={:?}: {e}", self.created_at))
            })?;

        let mut executed_funds = Decimal::ZERO;
        for trade in &self.trades {
            executed_funds += decimal_from_str(&self.market, "trades.funds", &trade.funds)?;
        }

        let price = self
            .price
            .as_deref()
            .map(|p| decimal_from_str(&self.market, "price", p))
            .transpose()?;
        let (funds, submitted_price) = match (kind, side) {
            // market bid: the "price" field carries the KRW funds
            (OrderKind::Market, OrderSide::Bid) => (price, None),
            _ => (None, price),
        };

        Ok(Order {
            uuid,
            side,
            kind,
            price: submitted_price,
            funds,
            volume: self
                .volume
                .as_deref()
                .map(|v| decimal_from_str(&self.market, "volume", v))
                .transpose()?,
            executed_volume: decimal_from_str(
                &self.market,
                "executed_volume",
                &self.executed_volume,
            )?,
            executed_funds,
            paid_fee: decimal_from_str(&self.market, "paid_fee", &self.paid_fee)?,
            state,
            created_at,
            market: self.market,
        })
    }
}
