use crate::application::strategies::{Analysis, AnalysisContext, Strategy};
use crate::domain::types::ExitReason;
use rust_decimal::prelude::ToPrimitive;

/// Added before dividing by the volume deviation.
const EPSILON: f64 = 1e-9;

/// Volume impulse: a volume spike far outside its recent distribution,
/// paired with a directional close. An upward impulse opens, a downward
/// impulse on an open position closes it.
pub struct VolumeImpulseStrategy;

impl VolumeImpulseStrategy {
    fn volume_zscore(candles: &[crate::domain::types::Candle], window: usize) -> Option<f64> {
        if candles.len() <= window {
            return None;
        }
        let volumes: Vec<f64> = candles[1..=window]
            .iter()
            .map(|c| c.volume.to_f64().unwrap_or(0.0))
            .collect();
        let mean = volumes.iter().sum::<f64>() / window as f64;
        let variance =
            volumes.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / window as f64;
        let now = candles[0].volume.to_f64()?;
        Some((now - mean) / (variance.sqrt() + EPSILON))
    }
}

impl Strategy for VolumeImpulseStrategy {
    fn name(&self) -> &'static str {
        "VolumeImpulse"
    }

    fn min_candles(&self) -> usize {
        25
    }

    fn analyze(&self, ctx: &AnalysisContext<'_>) -> Analysis {
        let window = ctx.params.period("window", 20);
        let impulse_z = ctx.params.float("impulse_zscore", 2.0);
        let min_change = ctx.params.float("min_price_change", 0.005);

        let z = match Self::volume_zscore(ctx.candles, window) {
            Some(z) => z,
            None => return Analysis::hold("insufficient candles for volume window"),
        };
        if ctx.candles.len() < 2 {
            return Analysis::hold("insufficient candles for price change");
        }

        let close_now = ctx.candles[0].close.to_f64().unwrap_or(0.0);
        let close_prev = ctx.candles[1].close.to_f64().unwrap_or(0.0);
        if close_prev == 0.0 {
            return Analysis::hold("degenerate previous close");
        }
        let change = (close_now - close_prev) / close_prev;

        if !ctx.has_open_position() && z > impulse_z && change > min_change {
            return Analysis::buy(format!(
                "volume impulse z={z:.1} with +{:.2}% move",
                change * 100.0
            ));
        }

        if ctx.has_open_position() && z > impulse_z && change < -min_change {
            return Analysis::sell(
                format!("distribution impulse z={z:.1}, {:.2}% move", change * 100.0),
                ExitReason::VolumeDrop,
            );
        }

        Analysis::hold(format!("volume z={z:.1}"))
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
                market: "KRW-DOT".to_string(),
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

    fn base(volume_now: f64, close_now: f64) -> (Vec<f64>, Vec<f64>) {
        let mut closes = vec![close_now];
        closes.extend(vec![100.0; 25]);
        let mut volumes = vec![volume_now];
        // mild noise so the deviation is non-zero
        for i in 0..25 {
            volumes.push(if i % 2 == 0 { 9.0 } else { 11.0 });
        }
        (closes, volumes)
    }

    #[test]
    fn test_upward_impulse_buys() {
        let (closes, volumes) = base(40.0, 101.0);
        let series = candles(&closes, &volumes);
        let params = StrategyParams::empty();
        let ctx = AnalysisContext::new("KRW-DOT", &series, None, None, &params, Utc::now());
        assert_eq!(VolumeImpulseStrategy.analyze(&ctx).signal, Signal::Buy);
    }

    #[test]
    fn test_impulse_without_price_move_holds() {
        let (closes, volumes) = base(40.0, 100.1);
        let series = candles(&closes, &volumes);
        let params = StrategyParams::empty();
        let ctx = AnalysisContext::new("KRW-DOT", &series, None, None, &params, Utc::now());
        assert_eq!(VolumeImpulseStrategy.analyze(&ctx).signal, Signal::Hold);
    }

    #[test]
    fn test_downward_impulse_sells_position() {
        let (closes, volumes) = base(40.0, 98.0);
        let series = candles(&closes, &volumes);
        let params = StrategyParams::empty();
        let view = PositionView::synthetic(dec!(100), dec!(1), dec!(102), None, Utc::now(), 6);
        let ctx =
            AnalysisContext::new("KRW-DOT", &series, Some(&view), None, &params, Utc::now());
        let analysis = VolumeImpulseStrategy.analyze(&ctx);
        assert_eq!(analysis.signal, Signal::Sell);
        assert_eq!(analysis.exit_reason, Some(ExitReason::VolumeDrop));
    }
}
