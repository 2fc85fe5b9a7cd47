use crate::application::strategies::{Analysis, AnalysisContext, Strategy};
use crate::domain::indicators;
use crate::domain::types::ExitReason;

/// Classic SMA crossover.
///
/// Golden cross (fast SMA crossing above slow) opens, death cross closes.
/// The cross is detected against the previous candle's pair so a sustained
/// trend does not keep re-signalling.
pub struct GoldenCrossStrategy;

impl Strategy for GoldenCrossStrategy {
    fn name(&self) -> &'static str {
        "GoldenCross"
    }

    fn min_candles(&self) -> usize {
        // slow SMA plus one candle for the previous pair
        30
    }

    fn analyze(&self, ctx: &AnalysisContext<'_>) -> Analysis {
        let fast = ctx.params.period("fast_period", 5);
        let slow = ctx.params.period("slow_period", 20);

        let pairs = (
            indicators::sma(ctx.candles, fast),
            indicators::sma(ctx.candles, slow),
            indicators::sma(&ctx.candles[1..], fast),
            indicators::sma(&ctx.candles[1..], slow),
        );
        let (fast_now, slow_now, fast_prev, slow_prev) = match pairs {
            (Ok(a), Ok(b), Ok(c), Ok(d)) => (a, b, c, d),
            _ => return Analysis::hold("insufficient candles for SMA pair"),
        };

        if !ctx.has_open_position() && fast_now > slow_now && fast_prev <= slow_prev {
            return Analysis::buy(format!(
                "golden cross (fast {fast_now:.2} > slow {slow_now:.2})"
            ));
        }

        if ctx.has_open_position() && fast_now < slow_now && fast_prev >= slow_prev {
            return Analysis::sell(
                format!("death cross (fast {fast_now:.2} < slow {slow_now:.2})"),
                ExitReason::SignalInvalid,
            );
        }

        Analysis::hold("no crossover")
    }
}
