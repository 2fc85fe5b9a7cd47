use crate::application::strategies::{Analysis, AnalysisContext, Strategy};
use crate::domain::types::ExitReason;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

/// Volatility breakout in the Larry Williams style: the breakout level is the
/// current candle's open plus k times the previous candle's range. Price
/// clearing that level opens a position; falling back through the open closes
/// it.
pub struct VolatilityBreakoutStrategy;

impl Strategy for VolatilityBreakoutStrategy {
    fn name(&self) -> &'static str {
        "VolatilityBreakout"
    }

    fn min_candles(&self) -> usize {
        2
    }

    fn analyze(&self, ctx: &AnalysisContext<'_>) -> Analysis {
        let k = ctx.params.float("k", 0.5);

        if ctx.candles.len() < 2 {
            return Analysis::hold("insufficient candles for breakout range");
        }
        let current = &ctx.candles[0];
        let previous = &ctx.candles[1];

        let prev_range = (previous.high - previous.low).to_f64().unwrap_or(0.0);
        let open = current.open.to_f64().unwrap_or(0.0);
        let breakout_level = open + prev_range * k;
        let price = ctx.price_f64;

        if !ctx.has_open_position() && prev_range > 0.0 && price >= breakout_level {
            let target_rate = ctx.params.float("target_rate", 0.02);
            let mut analysis = Analysis::buy(format!(
                "breakout {price:.2} >= level {breakout_level:.2} (k={k})"
            ));
            analysis = analysis.with_stop(current.open);
            if let Some(level) = Decimal::from_f64_retain(breakout_level * (1.0 + target_rate)) {
                analysis = analysis.with_target(level);
            }
            return analysis;
        }

        if ctx.has_open_position() && current.close < current.open {
            let fell_through_open = price < open;
            if fell_through_open {
                return Analysis::sell(
                    format!("breakout failed, price {price:.2} back under open {open:.2}"),
                    ExitReason::SignalInvalid,
                );
            }
        }

        Analysis::hold("no breakout")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::strategies::{PositionView, StrategyParams};
    use crate::domain::types::{Candle, Signal};
    use chrono::{TimeZone, Utc};
    use rust_decimal::prelude::FromPrimitive;
    use rust_decimal_macros::dec;

    fn candle(open: f64, high: f64, low: f64, close: f64, age: i64) -> Candle {
        Candle {
            market: "KRW-AVAX".to_string(),
            timestamp_utc: Utc.timestamp_opt(1_700_000_000 - 60 * age, 0).unwrap(),
            open: Decimal::from_f64(open).unwrap(),
            high: Decimal::from_f64(high).unwrap(),
            low: Decimal::from_f64(low).unwrap(),
            close: Decimal::from_f64(close).unwrap(),
            volume: Decimal::ONE,
            value: Decimal::ONE,
            unit: 60,
        }
    }

    #[test]
    fn test_breakout_above_level_buys() {
        // Previous range 10, k=0.5 -> level = open 100 + 5 = 105.
        let series = vec![
            candle(100.0, 106.5, 99.5, 106.0, 0),
            candle(98.0, 105.0, 95.0, 100.0, 1),
        ];
        let params = StrategyParams::empty();
        let ctx = AnalysisContext::new("KRW-AVAX", &series, None, None, &params, Utc::now());
        let analysis = VolatilityBreakoutStrategy.analyze(&ctx);
        assert_eq!(analysis.signal, Signal::Buy);
        assert_eq!(analysis.stop_loss_price, Some(dec!(100)));
    }

    #[test]
    fn test_below_level_holds() {
        let series = vec![
            candle(100.0, 104.0, 99.5, 103.0, 0),
            candle(98.0, 105.0, 95.0, 100.0, 1),
        ];
        let params = StrategyParams::empty();
        let ctx = AnalysisContext::new("KRW-AVAX", &series, None, None, &params, Utc::now());
        assert_eq!(VolatilityBreakoutStrategy.analyze(&ctx).signal, Signal::Hold);
    }

    #[test]
    fn test_fall_back_under_open_sells() {
        let series = vec![
            candle(100.0, 101.0, 97.0, 98.0, 0),
            candle(98.0, 105.0, 95.0, 100.0, 1),
        ];
        let params = StrategyParams::empty();
        let view = PositionView::synthetic(dec!(105), dec!(1), dec!(106), None, Utc::now(), 4);
        let ctx =
            AnalysisContext::new("KRW-AVAX", &series, Some(&view), None, &params, Utc::now());
        let analysis = VolatilityBreakoutStrategy.analyze(&ctx);
        assert_eq!(analysis.signal, Signal::Sell);
        assert_eq!(analysis.exit_reason, Some(ExitReason::SignalInvalid));
    }
}
