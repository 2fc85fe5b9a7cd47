use crate::application::strategies::{Analysis, AnalysisContext, Strategy};
use crate::domain::indicators;
use crate::domain::types::ExitReason;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;

/// EMA trend rider with ATR-sized stop and target hints.
///
/// Enters when the fast EMA sits above the slow EMA and price trades above
/// the fast EMA; exits when price falls back through the slow EMA.
pub struct TrendFollowingStrategy;

impl Strategy for TrendFollowingStrategy {
    fn name(&self) -> &'static str {
        "TrendFollowing"
    }

    fn min_candles(&self) -> usize {
        32
    }

    fn analyze(&self, ctx: &AnalysisContext<'_>) -> Analysis {
        let fast = ctx.params.period("ema_fast", 10);
        let slow = ctx.params.period("ema_slow", 30);
        let atr_period = ctx.params.period("atr_period", 14);
        let stop_mult = ctx.params.float("stop_atr_multiplier", 2.0);
        let target_mult = ctx.params.float("target_atr_multiplier", 3.0);

        let values = (
            indicators::ema(ctx.candles, fast),
            indicators::ema(ctx.candles, slow),
            indicators::ema(&ctx.candles[1..], fast),
            indicators::ema(&ctx.candles[1..], slow),
            indicators::atr(ctx.candles, atr_period),
        );
        let (fast_now, slow_now, fast_prev, slow_prev, atr) = match values {
            (Ok(a), Ok(b), Ok(c), Ok(d), Ok(e)) => (a, b, c, d, e),
            _ => return Analysis::hold("insufficient candles for EMA/ATR"),
        };

        let price = ctx.price_f64;
        let trend_up = fast_now > slow_now && price > fast_now;
        let fresh_cross = fast_prev <= slow_prev;

        if !ctx.has_open_position() && trend_up && fresh_cross {
            let mut analysis = Analysis::buy(format!(
                "uptrend established (fast {fast_now:.2} > slow {slow_now:.2})"
            ));
            if let Some(stop) = Decimal::from_f64(price - atr * stop_mult) {
                analysis = analysis.with_stop(stop);
            }
            if let Some(target) = Decimal::from_f64(price + atr * target_mult) {
                analysis = analysis.with_target(target);
            }
            return analysis;
        }

        if ctx.has_open_position() && price < slow_now {
            return Analysis::sell(
                format!("price {price:.2} broke slow EMA {slow_now:.2}"),
                ExitReason::SignalInvalid,
            );
        }

        Analysis::hold("trend unchanged")
    }
}
