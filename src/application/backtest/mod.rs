//! Historical replay through the live decision code.
//!
//! Candles arrive newest-first from either the exchange or the local candle
//! store; that vector already is the reversed chronological series, so the
//! as-of window at chronological step i is the subslice starting at index
//! n-1-i. One allocation, O(1) per step, O(N) for the walk.

pub mod report;
pub mod tasks;

pub use report::BacktestReport;

use crate::application::strategies::{
    Analysis, AnalysisContext, PositionView, StrategyParams, StrategyRegistry,
};
use crate::application::voting::{self, Action};
use crate::domain::errors::{ExchangeError, StoreError};
use crate::domain::ports::{CandleStore, MarketDataSource, ParameterStore};
use crate::domain::types::{Candle, ExitReason, OrderSide, Signal, TradeRecord};
use futures::StreamExt;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Candles before this index are warm-up history only.
const WARMUP: usize = 30;
/// Fraction of the simulated KRW balance a buy commits.
const BUY_RATIO: Decimal = Decimal::from_parts(99, 0, 0, false, 2);
/// Simulated trading fee per side (0.05%).
const FEE_RATE: Decimal = Decimal::from_parts(5, 0, 0, false, 4);

#[derive(Debug, Error)]
pub enum BacktestError {
    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("not enough candles for {market}: got {got}, need more than {warmup}")]
    InsufficientCandles {
        market: String,
        got: usize,
        warmup: usize,
    },

    #[error("backtest cancelled")]
    Cancelled,

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategySelection {
    /// One strategy by name.
    Single(String),
    /// Majority voting over the default bundle.
    Combined,
}

impl StrategySelection {
    pub fn label(&self) -> String {
        match self {
            StrategySelection::Single(name) => name.clone(),
            StrategySelection::Combined => "COMBINED".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandleSource {
    /// Exchange REST, capped at 200 candles per market.
    Exchange,
    /// Local candle store, unlimited.
    LocalStore,
}

#[derive(Debug, Clone)]
pub struct BacktestRequest {
    pub market: String,
    pub selection: StrategySelection,
    pub initial_balance: Decimal,
    pub unit: u32,
    pub count: usize,
    pub source: CandleSource,
    /// Optional inclusive date window applied after loading.
    pub from: Option<chrono::DateTime<chrono::Utc>>,
    pub to: Option<chrono::DateTime<chrono::Utc>>,
    /// Per-user parameter overrides to apply; None runs on globals.
    pub user_id: Option<i64>,
}

pub struct BacktestEngine {
    registry: Arc<StrategyRegistry>,
    params: Arc<dyn ParameterStore>,
    market_data: Arc<dyn MarketDataSource>,
    candle_store: Arc<dyn CandleStore>,
}

impl BacktestEngine {
    pub fn new(
        registry: Arc<StrategyRegistry>,
        params: Arc<dyn ParameterStore>,
        market_data: Arc<dyn MarketDataSource>,
        candle_store: Arc<dyn CandleStore>,
    ) -> Self {
        Self {
            registry,
            params,
            market_data,
            candle_store,
        }
    }

    pub async fn run(&self, request: &BacktestRequest) -> Result<BacktestReport, BacktestError> {
        let never = AtomicBool::new(false);
        self.run_cancellable(request, &never, |_, _| {}).await
    }

    /// Run with a cancel flag (checked at every per-candle step) and a
    /// progress callback (percent, step label).
    pub async fn run_cancellable(
        &self,
        request: &BacktestRequest,
        cancel: &AtomicBool,
        mut on_progress: impl FnMut(u8, &str),
    ) -> Result<BacktestReport, BacktestError> {
        on_progress(5, "loading candles");
        let newest_first = self.load_candles(request).await?;
        let n = newest_first.len();
        if n <= WARMUP {
            return Err(BacktestError::InsufficientCandles {
                market: request.market.clone(),
                got: n,
                warmup: WARMUP,
            });
        }

        let strategies = self.resolve_strategies(&request.selection)?;
        let mut params = HashMap::new();
        for strategy in &strategies {
            params.insert(
                strategy.name(),
                StrategyParams::resolve(self.params.as_ref(), strategy.name(), request.user_id)
                    .await?,
            );
        }

        on_progress(10, "replaying");
        let mut walk = Walk::new(request, &newest_first);
        for i in WARMUP..n {
            if cancel.load(Ordering::Relaxed) {
                return Err(BacktestError::Cancelled);
            }
            // The as-of window: newest-first, index 0 is chronological candle i.
            let window = &newest_first[n - 1 - i..];
            walk.step(i, window, &strategies, &params, &self.registry, &request.selection);

            if i % 64 == 0 {
                let pct = 10 + (i * 85 / n) as u8;
                on_progress(pct, "replaying");
            }
        }

        on_progress(98, "summarizing");
        let report = walk.finish();
        info!(
            market = request.market.as_str(),
            strategy = request.selection.label(),
            trades = report.total_trades,
            profit_rate = report.total_profit_rate,
            "backtest complete"
        );
        Ok(report)
    }

    /// Independent per-market runs on a bounded worker pool.
    pub async fn run_many(
        &self,
        markets: &[String],
        template: &BacktestRequest,
        pool: usize,
    ) -> Vec<Result<BacktestReport, BacktestError>> {
        futures::stream::iter(markets.iter().cloned())
            .map(|market| {
                let request = BacktestRequest {
                    market,
                    ..template.clone()
                };
                async move { self.run(&request).await }
            })
            .buffered(pool.max(1))
            .collect()
            .await
    }

    async fn load_candles(
        &self,
        request: &BacktestRequest,
    ) -> Result<Vec<Candle>, BacktestError> {
        let mut candles = match request.source {
            CandleSource::Exchange => {
                let count = request.count.min(200);
                self.market_data
                    .minute_candles(&request.market, request.unit, count)
                    .await?
            }
            CandleSource::LocalStore => {
                self.candle_store
                    .load(&request.market, request.unit, request.count)
                    .await?
            }
        };
        if request.from.is_some() || request.to.is_some() {
            candles.retain(|c| {
                request.from.is_none_or(|from| c.timestamp_utc >= from)
                    && request.to.is_none_or(|to| c.timestamp_utc <= to)
            });
        }
        Ok(candles)
    }

    fn resolve_strategies(
        &self,
        selection: &StrategySelection,
    ) -> Result<Vec<Arc<dyn crate::application::strategies::Strategy>>, BacktestError> {
        match selection {
            StrategySelection::Single(name) => self
                .registry
                .get(name)
                .map(|s| vec![s])
                .ok_or_else(|| BacktestError::UnknownStrategy(name.clone())),
            StrategySelection::Combined => Ok(self.registry.select(&[])),
        }
    }
}

/// Mutable walk state: the simulated wallet and the accumulating report.
struct Walk<'a> {
    request: &'a BacktestRequest,
    krw: Decimal,
    coin: Decimal,
    buy_price: Decimal,
    highest_since_buy: Decimal,
    target_hint: Option<Decimal>,
    buy_index: usize,
    buy_time: chrono::DateTime<chrono::Utc>,
    first_analyzed_price: Decimal,
    last_price: Decimal,
    max_asset: Decimal,
    min_asset: Decimal,
    trades: Vec<TradeRecord>,
    wins: u32,
    losses: u32,
    exit_reasons: HashMap<ExitReason, u32>,
    period_start: chrono::DateTime<chrono::Utc>,
    period_end: chrono::DateTime<chrono::Utc>,
}

impl<'a> Walk<'a> {
    fn new(request: &'a BacktestRequest, newest_first: &[Candle]) -> Self {
        let n = newest_first.len();
        let first_analyzed = &newest_first[n - 1 - WARMUP];
        Self {
            request,
            krw: request.initial_balance,
            coin: Decimal::ZERO,
            buy_price: Decimal::ZERO,
            highest_since_buy: Decimal::ZERO,
            target_hint: None,
            buy_index: 0,
            buy_time: first_analyzed.timestamp_utc,
            first_analyzed_price: first_analyzed.close,
            last_price: newest_first[0].close,
            max_asset: request.initial_balance,
            min_asset: request.initial_balance,
            trades: Vec::new(),
            wins: 0,
            losses: 0,
            exit_reasons: HashMap::new(),
            period_start: first_analyzed.timestamp_utc,
            period_end: newest_first[0].timestamp_utc,
        }
    }

    fn step(
        &mut self,
        i: usize,
        window: &[Candle],
        strategies: &[Arc<dyn crate::application::strategies::Strategy>],
        params: &HashMap<&'static str, StrategyParams>,
        registry: &StrategyRegistry,
        selection: &StrategySelection,
    ) {
        let price = window[0].close;
        let now = window[0].timestamp_utc;

        let holding = self.coin > Decimal::ZERO;
        if holding && price > self.highest_since_buy {
            self.highest_since_buy = price;
        }

        let view = holding.then(|| {
            PositionView::synthetic(
                self.buy_price,
                self.coin,
                self.highest_since_buy,
                self.target_hint,
                self.buy_time,
                (i - self.buy_index) as u32,
            )
        });

        let analysis = self.evaluate(window, view.as_ref(), strategies, params, registry, selection);

        match analysis.signal {
            Signal::Buy if !holding => self.buy(i, price, now, &analysis),
            Signal::Sell if holding => self.sell(price, now, &analysis),
            _ => {}
        }

        let asset = self.krw + self.coin * price;
        if asset > self.max_asset {
            self.max_asset = asset;
        }
        if asset < self.min_asset {
            self.min_asset = asset;
        }
        self.last_price = price;
    }

    fn evaluate(
        &self,
        window: &[Candle],
        view: Option<&PositionView>,
        strategies: &[Arc<dyn crate::application::strategies::Strategy>],
        params: &HashMap<&'static str, StrategyParams>,
        registry: &StrategyRegistry,
        selection: &StrategySelection,
    ) -> Analysis {
        let now = window[0].timestamp_utc;
        match selection {
            StrategySelection::Single(_) => {
                let strategy = &strategies[0];
                let p = &params[strategy.name()];
                let ctx =
                    AnalysisContext::new(&self.request.market, window, view, None, p, now);
                registry.evaluate_for_backtest(strategy.as_ref(), &ctx)
            }
            StrategySelection::Combined => {
                let outcomes: Vec<(String, Analysis)> = strategies
                    .iter()
                    .map(|strategy| {
                        let p = &params[strategy.name()];
                        let ctx = AnalysisContext::new(
                            &self.request.market,
                            window,
                            view,
                            None,
                            p,
                            now,
                        );
                        (
                            strategy.name().to_string(),
                            registry.evaluate_for_backtest(strategy.as_ref(), &ctx),
                        )
                    })
                    .collect();
                let decision = voting::decide(&outcomes, view.is_some());
                match decision.action {
                    Action::Buy => {
                        let mut analysis = Analysis::buy(decision.reason);
                        analysis.target_price = decision.target_price;
                        analysis.stop_loss_price = decision.stop_loss_price;
                        analysis
                    }
                    Action::Sell => Analysis::sell(
                        decision.reason,
                        decision.exit_reason.unwrap_or(ExitReason::SignalInvalid),
                    ),
                    Action::Hold => Analysis::hold(decision.reason),
                }
            }
        }
    }

    fn buy(
        &mut self,
        i: usize,
        price: Decimal,
        now: chrono::DateTime<chrono::Utc>,
        analysis: &Analysis,
    ) {
        let spend = self.krw * BUY_RATIO;
        if spend <= Decimal::ZERO || price <= Decimal::ZERO {
            return;
        }
        let fee = spend * FEE_RATE;
        let volume = (spend - fee) / price;
        self.krw -= spend;
        self.coin += volume;
        self.buy_price = price;
        self.highest_since_buy = price;
        self.target_hint = analysis.target_price;
        self.buy_time = now;
        self.buy_index = i;

        self.trades.push(TradeRecord {
            id: None,
            user_id: self.request.user_id.unwrap_or(0),
            market: self.request.market.clone(),
            side: OrderSide::Bid,
            executed_at: now,
            amount: spend - fee,
            volume,
            price,
            fee,
            order_uuid: Uuid::new_v4(),
            strategy: self.request.selection.label(),
            target_price: analysis.target_price,
            highest_price: Some(price),
            half_sold: false,
            stop_loss: false,
        });
    }

    fn sell(&mut self, price: Decimal, now: chrono::DateTime<chrono::Utc>, analysis: &Analysis) {
        let proceeds = self.coin * price;
        let fee = proceeds * FEE_RATE;
        let pnl_positive = price >= self.buy_price;

        // Every backtest sell carries a reason; infer from PnL when the
        // strategy left it unset.
        let reason = analysis.exit_reason.unwrap_or(if pnl_positive {
            ExitReason::TakeProfit
        } else {
            ExitReason::SignalInvalid
        });
        *self.exit_reasons.entry(reason).or_insert(0) += 1;
        if pnl_positive {
            self.wins += 1;
        } else {
            self.losses += 1;
        }

        self.trades.push(TradeRecord {
            id: None,
            user_id: self.request.user_id.unwrap_or(0),
            market: self.request.market.clone(),
            side: OrderSide::Ask,
            executed_at: now,
            amount: proceeds - fee,
            volume: self.coin,
            price,
            fee,
            order_uuid: Uuid::new_v4(),
            strategy: self.request.selection.label(),
            target_price: self.target_hint,
            highest_price: Some(self.highest_since_buy),
            half_sold: false,
            stop_loss: matches!(
                reason,
                ExitReason::StopLossFixed | ExitReason::StopLossAtr
            ),
        });

        self.krw += proceeds - fee;
        self.coin = Decimal::ZERO;
        self.buy_price = Decimal::ZERO;
        self.highest_since_buy = Decimal::ZERO;
        self.target_hint = None;
    }

    fn finish(self) -> BacktestReport {
        let final_coin_value = self.coin * self.last_price;
        let final_total = self.krw + final_coin_value;
        let initial = self.request.initial_balance;
        let rate = |value: Decimal| -> f64 {
            if initial.is_zero() {
                0.0
            } else {
                ((value - initial) / initial * Decimal::ONE_HUNDRED)
                    .to_f64()
                    .unwrap_or(0.0)
            }
        };
        let buy_count = self
            .trades
            .iter()
            .filter(|t| t.side == OrderSide::Bid)
            .count() as u32;
        let sell_count = self.trades.len() as u32 - buy_count;
        let closed = self.wins + self.losses;

        BacktestReport {
            market: self.request.market.clone(),
            strategy: self.request.selection.label(),
            period_start: self.period_start,
            period_end: self.period_end,
            initial_balance: initial,
            final_balance: self.krw,
            final_coin_balance: self.coin,
            final_coin_value,
            final_total_asset: final_total,
            total_profit_rate: rate(final_total),
            max_profit_rate: rate(self.max_asset),
            max_loss_rate: rate(self.min_asset),
            buy_and_hold_rate: if self.first_analyzed_price.is_zero() {
                0.0
            } else {
                ((self.last_price - self.first_analyzed_price) / self.first_analyzed_price
                    * Decimal::ONE_HUNDRED)
                    .to_f64()
                    .unwrap_or(0.0)
            },
            total_trades: self.trades.len() as u32,
            buy_count,
            sell_count,
            win_count: self.wins,
            loss_count: self.losses,
            win_rate: if closed == 0 {
                0.0
            } else {
                self.wins as f64 / closed as f64 * 100.0
            },
            exit_reason_counts: self.exit_reasons,
            trades: self.trades,
        }
    }
}
