use crate::application::strategies::{Analysis, AnalysisContext, PositionView, Strategy};
use crate::domain::indicators;
use crate::domain::position::PositionStatus;
use crate::domain::types::ExitReason;
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};

pub(super) const NAME: &str = "ScaledTrading";

/// The designated scaled strategy. In SCALED_TRADING mode its signal alone
/// drives entry-leg advancement and exit-phase advancement: a Buy opens leg 1
/// on a dip inside an uptrend, or adds legs 2 and 3 on configured drawdowns
/// from the first leg; a Sell carries the exit reason the lifecycle layer
/// acts on (partial take-profit while exit phase 0, final exit otherwise).
pub struct ScaledTradingStrategy;

struct ExitChecks {
    max_stop_loss: f64,
    min_hold_candles: u32,
    max_hold_candles: u32,
    trailing_activation: f64,
    trailing_stop_rate: f64,
    partial_take_profit: f64,
}

impl ScaledTradingStrategy {
    fn exit_signal(
        view: &PositionView,
        price: Decimal,
        checks: &ExitChecks,
    ) -> Option<Analysis> {
        let pnl = view.unrealized_return(price).to_f64().unwrap_or(0.0);

        // Hard stop, armed only after the minimum hold.
        if pnl <= -checks.max_stop_loss && view.hold_candles >= checks.min_hold_candles {
            return Some(Analysis::sell(
                format!("hard stop at {:.2}%", pnl * 100.0),
                ExitReason::StopLossFixed,
            ));
        }

        // Explicit stop from the position, same min-hold guard.
        if let Some(stop) = view.stop_loss_price
            && price <= stop
            && view.hold_candles >= checks.min_hold_candles
        {
            return Some(Analysis::sell(
                format!("stop loss {stop} touched"),
                ExitReason::StopLossAtr,
            ));
        }

        // Trailing: armed once the observed high clears the activation
        // threshold over the average entry; fires on the retrace.
        if let Some(high) = view.highest_price {
            let armed = !view.avg_entry_price.is_zero()
                && ((high - view.avg_entry_price) / view.avg_entry_price)
                    .to_f64()
                    .unwrap_or(0.0)
                    >= checks.trailing_activation;
            if armed {
                let rate = Decimal::from_f64(checks.trailing_stop_rate).unwrap_or_default();
                let trailing_stop = view
                    .trailing_stop_price
                    .unwrap_or_else(|| high * (Decimal::ONE - rate));
                if price <= trailing_stop {
                    return Some(Analysis::sell(
                        format!("trailing stop {trailing_stop} touched from high {high}"),
                        ExitReason::TrailingStop,
                    ));
                }
            }
        }

        if view.hold_candles >= checks.max_hold_candles {
            return Some(Analysis::sell(
                format!("held for {} candles", view.hold_candles),
                ExitReason::Timeout,
            ));
        }

        // Partial take-profit only while nothing has been sold yet.
        if view.status == PositionStatus::Active
            && view.exit_phase == 0
            && pnl >= checks.partial_take_profit
        {
            return Some(Analysis::sell(
                format!("partial take-profit at {:.2}%", pnl * 100.0),
                ExitReason::TakeProfit,
            ));
        }

        None
    }
}

impl Strategy for ScaledTradingStrategy {
    fn name(&self) -> &'static str {
        NAME
    }

    fn min_candles(&self) -> usize {
        62
    }

    fn analyze(&self, ctx: &AnalysisContext<'_>) -> Analysis {
        let entry_rsi = ctx.params.float("entry_rsi", 35.0);
        let rsi_period = ctx.params.period("rsi_period", 14);
        let trend_period = ctx.params.period("trend_period", 60);
        let entry2_drop = ctx.params.float("entry2_drop_threshold", 0.015);
        let entry3_drop = ctx.params.float("entry3_drop_threshold", 0.025);
        let checks = ExitChecks {
            max_stop_loss: ctx.params.float("max_stop_loss_rate", 0.03),
            min_hold_candles: ctx.params.int("min_hold_candles", 3) as u32,
            max_hold_candles: ctx.params.int("max_hold_candles", 1440) as u32,
            trailing_activation: ctx.params.float("trailing_activation_threshold", 0.03),
            trailing_stop_rate: ctx.params.float("trailing_stop_rate", 0.015),
            partial_take_profit: ctx.params.float("partial_take_profit_rate", 0.025),
        };

        let view = match ctx.position {
            Some(view) if view.is_open() => view,
            _ => {
                // No holding: look for a dip inside an uptrend for leg 1.
                let (rsi, trend) = match (
                    indicators::rsi(ctx.candles, rsi_period),
                    indicators::sma(ctx.candles, trend_period),
                ) {
                    (Ok(r), Ok(t)) => (r, t),
                    _ => return Analysis::hold("insufficient candles for entry check"),
                };
                if rsi < entry_rsi && ctx.price_f64 > trend {
                    let stop = ctx.current_price
                        * (Decimal::ONE
                            - Decimal::from_f64(checks.max_stop_loss).unwrap_or_default());
                    return Analysis::buy(format!(
                        "scale-in leg 1 (RSI {rsi:.1} dip above trend {trend:.2})"
                    ))
                    .with_stop(stop);
                }
                return Analysis::hold(format!("RSI {rsi:.1}, waiting for a dip"));
            }
        };

        // Exits take precedence over adding legs.
        if let Some(exit) = Self::exit_signal(view, ctx.current_price, &checks) {
            return exit;
        }

        // Scale in on drawdowns from the first leg, only while still entering.
        if view.status == PositionStatus::Entering && view.entry_phase < 3 {
            if let Some(first) = view.first_leg_price {
                let drawdown = ((first - ctx.current_price) / first).to_f64().unwrap_or(0.0);
                let threshold = if view.entry_phase == 1 {
                    entry2_drop
                } else {
                    entry3_drop
                };
                if drawdown >= threshold {
                    return Analysis::buy(format!(
                        "scale-in leg {} ({:.2}% below leg 1)",
                        view.entry_phase + 1,
                        drawdown * 100.0
                    ));
                }
            }
        }

        Analysis::hold("riding position")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::strategies::StrategyParams;
    use crate::domain::types::{Candle, Signal};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn candles(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle {
                market: "KRW-BTC".to_string(),
                timestamp_utc: Utc.timestamp_opt(1_700_000_000 - 60 * i as i64, 0).unwrap(),
                open: Decimal::from_f64(c).unwrap(),
                high: Decimal::from_f64(c + 0.5).unwrap(),
                low: Decimal::from_f64(c - 0.5).unwrap(),
                close: Decimal::from_f64(c).unwrap(),
                volume: Decimal::ONE,
                value: Decimal::from_f64(c).unwrap(),
                unit: 1,
            })
            .collect()
    }

    /// Uptrend with a short dip at the newest end: RSI under 35 while price
    /// stays above the long mean.
    fn dip_in_uptrend() -> Vec<Candle> {
        let mut chronological: Vec<f64> = (0..70).map(|i| 100.0 + i as f64 * 0.8).collect();
        for i in 0..14 {
            chronological.push(156.0 - i as f64 * 0.4);
        }
        chronological.reverse();
        candles(&chronological)
    }

    fn view(status: PositionStatus, entry_phase: u8, exit_phase: u8) -> PositionView {
        PositionView {
            status,
            entry_phase,
            exit_phase,
            avg_entry_price: dec!(100),
            first_leg_price: Some(dec!(100)),
            remaining_quantity: dec!(10),
            highest_price: None,
            target_price: None,
            stop_loss_price: None,
            trailing_stop_price: None,
            opened_at: Some(Utc::now()),
            hold_candles: 10,
        }
    }

    #[test]
    fn test_dip_in_uptrend_opens_leg_one() {
        let series = dip_in_uptrend();
        let params = StrategyParams::empty();
        let ctx = AnalysisContext::new("KRW-BTC", &series, None, None, &params, Utc::now());
        let analysis = ScaledTradingStrategy.analyze(&ctx);
        assert_eq!(analysis.signal, Signal::Buy);
        assert!(analysis.stop_loss_price.is_some());
    }

    #[test]
    fn test_drawdown_advances_to_leg_two() {
        // Price 98.5 = 1.5% below the first leg at 100.
        let series = candles(&[98.5; 70]);
        let params = StrategyParams::empty();
        let v = view(PositionStatus::Entering, 1, 0);
        let ctx = AnalysisContext::new("KRW-BTC", &series, Some(&v), None, &params, Utc::now());
        let analysis = ScaledTradingStrategy.analyze(&ctx);
        assert_eq!(analysis.signal, Signal::Buy);
        assert!(analysis.reason.contains("leg 2"));
    }

    #[test]
    fn test_leg_three_needs_deeper_drawdown() {
        let params = StrategyParams::empty();
        let v = view(PositionStatus::Entering, 2, 0);

        // 1.5% down is not enough for leg 3
        let series = candles(&[98.5; 70]);
        let ctx = AnalysisContext::new("KRW-BTC", &series, Some(&v), None, &params, Utc::now());
        assert_eq!(ScaledTradingStrategy.analyze(&ctx).signal, Signal::Hold);

        // 2.5% down is
        let series = candles(&[97.5; 70]);
        let ctx = AnalysisContext::new("KRW-BTC", &series, Some(&v), None, &params, Utc::now());
        let analysis = ScaledTradingStrategy.analyze(&ctx);
        assert_eq!(analysis.signal, Signal::Buy);
        assert!(analysis.reason.contains("leg 3"));
    }

    #[test]
    fn test_partial_take_profit_at_threshold() {
        let series = candles(&[102.5; 70]);
        let params = StrategyParams::empty();
        let v = view(PositionStatus::Active, 1, 0);
        let ctx = AnalysisContext::new("KRW-BTC", &series, Some(&v), None, &params, Utc::now());
        let analysis = ScaledTradingStrategy.analyze(&ctx);
        assert_eq!(analysis.signal, Signal::Sell);
        assert_eq!(analysis.exit_reason, Some(ExitReason::TakeProfit));
    }

    #[test]
    fn test_trailing_stop_fires_after_arming() {
        let series = candles(&[102.46; 70]);
        let params = StrategyParams::empty();
        let mut v = view(PositionStatus::Exiting, 1, 1);
        v.highest_price = Some(dec!(104));
        v.trailing_stop_price = Some(dec!(102.46));
        let ctx = AnalysisContext::new("KRW-BTC", &series, Some(&v), None, &params, Utc::now());
        let analysis = ScaledTradingStrategy.analyze(&ctx);
        assert_eq!(analysis.signal, Signal::Sell);
        assert_eq!(analysis.exit_reason, Some(ExitReason::TrailingStop));
    }

    #[test]
    fn test_trailing_not_armed_below_activation() {
        // High of 102 is only +2% over entry; the retrace must not fire.
        let series = candles(&[100.4; 70]);
        let params = StrategyParams::empty();
        let mut v = view(PositionStatus::Active, 1, 0);
        v.highest_price = Some(dec!(102));
        let ctx = AnalysisContext::new("KRW-BTC", &series, Some(&v), None, &params, Utc::now());
        assert_eq!(ScaledTradingStrategy.analyze(&ctx).signal, Signal::Hold);
    }

    #[test]
    fn test_stop_loss_respects_min_hold() {
        let series = candles(&[96.0; 70]);
        let params = StrategyParams::empty();
        let mut v = view(PositionStatus::Active, 1, 0);
        v.hold_candles = 1;
        let ctx = AnalysisContext::new("KRW-BTC", &series, Some(&v), None, &params, Utc::now());
        assert_eq!(ScaledTradingStrategy.analyze(&ctx).signal, Signal::Hold);

        let mut v = view(PositionStatus::Active, 1, 0);
        v.hold_candles = 3;
        let ctx = AnalysisContext::new("KRW-BTC", &series, Some(&v), None, &params, Utc::now());
        let analysis = ScaledTradingStrategy.analyze(&ctx);
        assert_eq!(analysis.signal, Signal::Sell);
        assert_eq!(analysis.exit_reason, Some(ExitReason::StopLossFixed));
    }
}
