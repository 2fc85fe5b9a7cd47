use crate::application::strategies::{Analysis, AnalysisContext, Strategy};
use crate::domain::indicators;
use crate::domain::types::ExitReason;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;

/// Mean-reversion on Bollinger bands: buy a close under the lower band with
/// the middle band as the target, sell an open position on a close over the
/// upper band.
pub struct BollingerBandStrategy;

impl Strategy for BollingerBandStrategy {
    fn name(&self) -> &'static str {
        "BollingerBand"
    }

    fn analyze(&self, ctx: &AnalysisContext<'_>) -> Analysis {
        let period = ctx.params.period("period", 20);
        let k = ctx.params.float("band_width", 2.0);

        let bands = match indicators::bollinger(ctx.candles, period, k) {
            Ok(bands) => bands,
            Err(_) => return Analysis::hold("insufficient candles for bands"),
        };

        let price = ctx.price_f64;

        if !ctx.has_open_position() && price < bands.lower {
            let mut analysis = Analysis::buy(format!(
                "close {price:.2} under lower band {:.2}",
                bands.lower
            ));
            if let Some(target) = Decimal::from_f64(bands.middle) {
                analysis = analysis.with_target(target);
            }
            return analysis;
        }

        if ctx.has_open_position() && price > bands.upper {
            return Analysis::sell(
                format!("close {price:.2} over upper band {:.2}", bands.upper),
                ExitReason::TakeProfit,
            );
        }

        Analysis::hold("inside bands")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::strategies::{PositionView, StrategyParams};
    use crate::domain::types::{Candle, Signal};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn candles(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle {
                market: "KRW-XRP".to_string(),
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

    #[test]
    fn test_break_below_lower_band_buys() {
        // Tight range around 100 with a sharp drop on the newest candle.
        let mut closes = vec![90.0];
        for i in 0..25 {
            closes.push(if i % 2 == 0 { 100.5 } else { 99.5 });
        }
        let series = candles(&closes);
        let params = StrategyParams::empty();
        let ctx = AnalysisContext::new("KRW-XRP", &series, None, None, &params, Utc::now());
        let analysis = BollingerBandStrategy.analyze(&ctx);
        assert_eq!(analysis.signal, Signal::Buy);
        assert!(analysis.target_price.is_some());
    }

    #[test]
    fn test_break_above_upper_band_sells() {
        let mut closes = vec![110.0];
        for i in 0..25 {
            closes.push(if i % 2 == 0 { 100.5 } else { 99.5 });
        }
        let series = candles(&closes);
        let params = StrategyParams::empty();
        let view = PositionView::synthetic(dec!(100), dec!(5), dec!(110), None, Utc::now(), 3);
        let ctx =
            AnalysisContext::new("KRW-XRP", &series, Some(&view), None, &params, Utc::now());
        let analysis = BollingerBandStrategy.analyze(&ctx);
        assert_eq!(analysis.signal, Signal::Sell);
        assert_eq!(analysis.exit_reason, Some(ExitReason::TakeProfit));
    }

    #[test]
    fn test_inside_bands_holds() {
        let closes: Vec<f64> = (0..30)
            .map(|i| if i % 2 == 0 { 100.5 } else { 99.5 })
            .collect();
        let series = candles(&closes);
        let params = StrategyParams::empty();
        let ctx = AnalysisContext::new("KRW-XRP", &series, None, None, &params, Utc::now());
        assert_eq!(BollingerBandStrategy.analyze(&ctx).signal, Signal::Hold);
    }
}
