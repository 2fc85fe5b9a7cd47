use crate::application::strategies::{Analysis, AnalysisContext, Strategy};
use crate::domain::indicators;
use crate::domain::types::ExitReason;

/// MACD histogram crossover: buy when the histogram turns positive, sell an
/// open position when it turns negative.
pub struct MacdStrategy;

impl Strategy for MacdStrategy {
    fn name(&self) -> &'static str {
        "MACD"
    }

    fn min_candles(&self) -> usize {
        // slow(26) + 2*signal(9) history, plus the previous as-of point
        45
    }

    fn analyze(&self, ctx: &AnalysisContext<'_>) -> Analysis {
        let fast = ctx.params.period("fast_period", 12);
        let slow = ctx.params.period("slow_period", 26);
        let signal = ctx.params.period("signal_period", 9);

        let (now, prev) = match (
            indicators::macd(ctx.candles, fast, slow, signal),
            indicators::macd(&ctx.candles[1..], fast, slow, signal),
        ) {
            (Ok(now), Ok(prev)) => (now, prev),
            _ => return Analysis::hold("insufficient candles for MACD"),
        };

        if !ctx.has_open_position() && now.histogram > 0.0 && prev.histogram <= 0.0 {
            return Analysis::buy(format!(
                "MACD histogram crossed positive ({:.4} -> {:.4})",
                prev.histogram, now.histogram
            ));
        }

        if ctx.has_open_position() && now.histogram < 0.0 && prev.histogram >= 0.0 {
            return Analysis::sell(
                format!(
                    "MACD histogram crossed negative ({:.4} -> {:.4})",
                    prev.histogram, now.histogram
                ),
                ExitReason::SignalInvalid,
            );
        }

        Analysis::hold(format!("histogram {:.4}", now.histogram))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::strategies::{PositionView, StrategyParams};
    use crate::domain::types::{Candle, Signal};
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use rust_decimal::prelude::FromPrimitive;
    use rust_decimal_macros::dec;

    fn candles(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle {
                market: "KRW-SOL".to_string(),
                timestamp_utc: Utc.timestamp_opt(1_700_000_000 - 60 * i as i64, 0).unwrap(),
                open: Decimal::from_f64(c).unwrap(),
                high: Decimal::from_f64(c + 1.0).unwrap(),
                low: Decimal::from_f64(c - 1.0).unwrap(),
                close: Decimal::from_f64(c).unwrap(),
                volume: Decimal::ONE,
                value: Decimal::from_f64(c).unwrap(),
                unit: 1,
            })
            .collect()
    }

    /// Long decline, then a turn upward in the newest candles. The histogram
    /// goes from negative to positive across the last step.
    fn reversal_series() -> Vec<f64> {
        let mut chronological: Vec<f64> = Vec::new();
        for i in 0..60 {
            chronological.push(200.0 - i as f64); // decline 200 -> 141
        }
        for i in 0..12 {
            chronological.push(141.0 + i as f64 * 4.0); // sharp recovery
        }
        chronological.reverse();
        chronological
    }

    #[test]
    fn test_histogram_turn_buys_once() {
        let series = candles(&reversal_series());
        let params = StrategyParams::empty();

        // Find at least one as-of point where a fresh cross produces a Buy.
        let mut bought = false;
        for start in 0..10 {
            let window = &series[start..];
            let ctx = AnalysisContext::new("KRW-SOL", window, None, None, &params, Utc::now());
            if MacdStrategy.analyze(&ctx).signal == Signal::Buy {
                bought = true;
                break;
            }
        }
        assert!(bought, "expected a histogram cross somewhere in the recovery");
    }

    #[test]
    fn test_decline_does_not_buy() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect(); // falling market
        let series = candles(&closes);
        let params = StrategyParams::empty();
        let ctx = AnalysisContext::new("KRW-SOL", &series, None, None, &params, Utc::now());
        assert_eq!(MacdStrategy.analyze(&ctx).signal, Signal::Hold);
    }

    #[test]
    fn test_negative_turn_sells() {
        // Mirror image: rally then a sharp drop.
        let mut chronological: Vec<f64> = Vec::new();
        for i in 0..60 {
            chronological.push(100.0 + i as f64);
        }
        for i in 0..12 {
            chronological.push(159.0 - i as f64 * 4.0);
        }
        chronological.reverse();
        let series = candles(&chronological);
        let params = StrategyParams::empty();
        let view = PositionView::synthetic(dec!(150), dec!(1), dec!(160), None, Utc::now(), 20);

        let mut sold = false;
        for start in 0..10 {
            let window = &series[start..];
            let ctx =
                AnalysisContext::new("KRW-SOL", window, Some(&view), None, &params, Utc::now());
            let analysis = MacdStrategy.analyze(&ctx);
            if analysis.signal == Signal::Sell {
                assert_eq!(analysis.exit_reason, Some(ExitReason::SignalInvalid));
                sold = true;
                break;
            }
        }
        assert!(sold, "expected a negative histogram cross in the drop");
    }
}
