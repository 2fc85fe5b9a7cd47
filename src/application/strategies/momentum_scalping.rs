use crate::application::strategies::{Analysis, AnalysisContext, Strategy};
use crate::domain::types::ExitReason;
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};

/// Short-horizon momentum with a volume confirmation. Tight target and stop
/// hints make the round trip fast; a momentum flip closes what is open.
pub struct MomentumScalpingStrategy;

impl MomentumScalpingStrategy {
    fn momentum(candles: &[crate::domain::types::Candle], lookback: usize) -> Option<f64> {
        if candles.len() <= lookback {
            return None;
        }
        let now = candles[0].close.to_f64()?;
        let then = candles[lookback].close.to_f64()?;
        if then == 0.0 {
            return None;
        }
        Some((now - then) / then)
    }
}

impl Strategy for MomentumScalpingStrategy {
    fn name(&self) -> &'static str {
        "MomentumScalping"
    }

    fn min_candles(&self) -> usize {
        10
    }

    fn analyze(&self, ctx: &AnalysisContext<'_>) -> Analysis {
        let lookback = ctx.params.period("lookback", 5);
        let threshold = ctx.params.float("momentum_threshold", 0.01);
        let volume_mult = ctx.params.float("volume_multiplier", 1.5);
        let target_rate = ctx.params.float("target_rate", 0.008);
        let stop_rate = ctx.params.float("stop_rate", 0.004);

        let momentum = match Self::momentum(ctx.candles, lookback) {
            Some(m) => m,
            None => return Analysis::hold("insufficient candles for momentum"),
        };

        let volume_now = ctx.candles[0].volume.to_f64().unwrap_or(0.0);
        let avg_volume: f64 = ctx.candles[1..=lookback]
            .iter()
            .map(|c| c.volume.to_f64().unwrap_or(0.0))
            .sum::<f64>()
            / lookback as f64;
        let volume_surge = volume_now > avg_volume * volume_mult;

        if !ctx.has_open_position() && momentum > threshold && volume_surge {
            let price = ctx.price_f64;
            let mut analysis = Analysis::buy(format!(
                "momentum {:.2}% with {:.1}x volume",
                momentum * 100.0,
                if avg_volume > 0.0 { volume_now / avg_volume } else { 0.0 }
            ));
            if let Some(target) = Decimal::from_f64(price * (1.0 + target_rate)) {
                analysis = analysis.with_target(target);
            }
            if let Some(stop) = Decimal::from_f64(price * (1.0 - stop_rate)) {
                analysis = analysis.with_stop(stop);
            }
            return analysis;
        }

        if ctx.has_open_position() && momentum < -threshold {
            return Analysis::sell(
                format!("momentum flipped to {:.2}%", momentum * 100.0),
                ExitReason::SignalInvalid,
            );
        }

        Analysis::hold(format!("momentum {:.2}%", momentum * 100.0))
    }
}
