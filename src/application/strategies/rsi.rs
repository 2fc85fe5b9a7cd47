use crate::application::strategies::{Analysis, AnalysisContext, Strategy};
use crate::domain::indicators;
use crate::domain::types::ExitReason;

/// RSI reversal strategy.
///
/// Buys when the RSI turns up out of the oversold zone on a bullish candle,
/// sells an open position once the RSI runs into the overbought zone.
pub struct RsiStrategy;

impl Strategy for RsiStrategy {
    fn name(&self) -> &'static str {
        "RSI"
    }

    fn min_candles(&self) -> usize {
        30
    }

    fn analyze(&self, ctx: &AnalysisContext<'_>) -> Analysis {
        let period = ctx.params.period("period", 14);
        let oversold = ctx.params.float("oversold", 30.0);
        let overbought = ctx.params.float("overbought", 70.0);

        let (now, prev) = match (
            indicators::rsi(ctx.candles, period),
            indicators::rsi(&ctx.candles[1..], period),
        ) {
            (Ok(now), Ok(prev)) => (now, prev),
            _ => return Analysis::hold("insufficient candles for RSI"),
        };

        let latest = &ctx.candles[0];
        let bullish_candle = latest.close > latest.open;

        if !ctx.has_open_position() && prev < oversold && now > prev && bullish_candle {
            return Analysis::buy(format!(
                "RSI recovering from oversold ({prev:.1} -> {now:.1})"
            ));
        }

        if ctx.has_open_position() && now > overbought {
            return Analysis::sell(
                format!("RSI overbought ({now:.1} > {overbought:.1})"),
                ExitReason::Overheated,
            );
        }

        Analysis::hold(format!("RSI {now:.1}"))
    }
}
