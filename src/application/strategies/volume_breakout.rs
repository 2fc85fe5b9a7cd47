use crate::application::strategies::{Analysis, AnalysisContext, Strategy};
use crate::domain::indicators;
use crate::domain::types::ExitReason;
use rust_decimal::prelude::ToPrimitive;

/// Range breakout confirmed by volume: a close above the recent high on at
/// least `volume_multiplier` times the average volume opens; fading volume
/// with price under the short mean closes.
pub struct VolumeBreakoutStrategy;

impl Strategy for VolumeBreakoutStrategy {
    fn name(&self) -> &'static str {
        "VolumeBreakout"
    }

    fn min_candles(&self) -> usize {
        25
    }

    fn analyze(&self, ctx: &AnalysisContext<'_>) -> Analysis {
        let lookback = ctx.params.period("lookback", 20);
        let volume_mult = ctx.params.float("volume_multiplier", 2.0);
        let exit_volume_ratio = ctx.params.float("exit_volume_ratio", 0.5);
        let exit_sma_period = ctx.params.period("exit_sma_period", 5);

        if ctx.candles.len() <= lookback {
            return Analysis::hold("insufficient candles for breakout window");
        }

        let window = &ctx.candles[1..=lookback];
        let recent_high = window
            .iter()
            .map(|c| c.high.to_f64().unwrap_or(0.0))
            .fold(f64::MIN, f64::max);
        let avg_volume = window
            .iter()
            .map(|c| c.volume.to_f64().unwrap_or(0.0))
            .sum::<f64>()
            / lookback as f64;

        let price = ctx.price_f64;
        let volume_now = ctx.candles[0].volume.to_f64().unwrap_or(0.0);

        if !ctx.has_open_position() && price > recent_high && volume_now > avg_volume * volume_mult
        {
            return Analysis::buy(format!(
                "close {price:.2} above {lookback}-candle high {recent_high:.2} on volume"
            ));
        }

        if ctx.has_open_position() {
            let short_mean = match indicators::sma(ctx.candles, exit_sma_period) {
                Ok(v) => v,
                Err(_) => return Analysis::hold("insufficient candles for exit mean"),
            };
            if volume_now < avg_volume * exit_volume_ratio && price < short_mean {
                return Analysis::sell(
                    format!(
                        "volume faded to {:.0}% of average under the short mean",
                        if avg_volume > 0.0 { volume_now / avg_volume * 100.0 } else { 0.0 }
                    ),
                    ExitReason::VolumeDrop,
                );
            }
        }

        Analysis::hold("no confirmed breakout")
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

    fn candles(closes: &[f64], volumes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .zip(volumes)
            .enumerate()
            .map(|(i, (&c, &v))| Candle {
                market: "KRW-LINK".to_string(),
                timestamp_utc: Utc.timestamp_opt(1_700_000_000 - 60 * i as i64, 0).unwrap(),
                open: Decimal::from_f64(c).unwrap(),
                high: Decimal::from_f64(c + 0.5).unwrap(),
                low: Decimal::from_f64(c - 0.5).unwrap(),
                close: Decimal::from_f64(c).unwrap(),
                volume: Decimal::from_f64(v).unwrap(),
                value: Decimal::from_f64(c * v).unwrap(),
                unit: 1,
            })
            .collect()
    }

    #[test]
    fn test_breakout_on_volume_buys() {
        let mut closes = vec![105.0];
        closes.extend(vec![100.0; 25]);
        let mut volumes = vec![50.0];
        volumes.extend(vec![10.0; 25]);
        let series = candles(&closes, &volumes);
        let params = StrategyParams::empty();
        let ctx = AnalysisContext::new("KRW-LINK", &series, None, None, &params, Utc::now());
        assert_eq!(VolumeBreakoutStrategy.analyze(&ctx).signal, Signal::Buy);
    }

    #[test]
    fn test_breakout_without_volume_holds() {
        let mut closes = vec![105.0];
        closes.extend(vec![100.0; 25]);
        let volumes = vec![10.0; 26];
        let series = candles(&closes, &volumes);
        let params = StrategyParams::empty();
        let ctx = AnalysisContext::new("KRW-LINK", &series, None, None, &params, Utc::now());
        assert_eq!(VolumeBreakoutStrategy.analyze(&ctx).signal, Signal::Hold);
    }

    #[test]
    fn test_volume_fade_sells() {
        // Price drifting down under the short mean with volume drying up.
        let mut closes = vec![98.0, 99.0, 100.0, 101.0, 102.0];
        closes.extend(vec![100.0; 25]);
        let mut volumes = vec![2.0];
        volumes.extend(vec![10.0; 29]);
        let series = candles(&closes, &volumes);
        let params = StrategyParams::empty();
        let view = PositionView::synthetic(dec!(100), dec!(1), dec!(103), None, Utc::now(), 8);
        let ctx =
            AnalysisContext::new("KRW-LINK", &series, Some(&view), None, &params, Utc::now());
        let analysis = VolumeBreakoutStrategy.analyze(&ctx);
        assert_eq!(analysis.signal, Signal::Sell);
        assert_eq!(analysis.exit_reason, Some(ExitReason::VolumeDrop));
    }
}
