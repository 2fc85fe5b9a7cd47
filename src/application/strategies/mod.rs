mod bollinger;
mod context;
mod golden_cross;
mod macd;
mod momentum_scalping;
mod params;
mod rsi;
mod scaled;
mod trend_following;
mod volatility_breakout;
mod volume_breakout;
mod volume_impulse;

pub use bollinger::BollingerBandStrategy;
pub use context::{Analysis, AnalysisContext, PositionView};
pub use golden_cross::GoldenCrossStrategy;
pub use macd::MacdStrategy;
pub use momentum_scalping::MomentumScalpingStrategy;
pub use params::StrategyParams;
pub use rsi::RsiStrategy;
pub use scaled::ScaledTradingStrategy;
pub use trend_following::TrendFollowingStrategy;
pub use volatility_breakout::VolatilityBreakoutStrategy;
pub use volume_breakout::VolumeBreakoutStrategy;
pub use volume_impulse::VolumeImpulseStrategy;

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::warn;

/// Capability set every strategy implements.
///
/// `analyze` is the live path; `analyze_for_backtest` receives its position
/// through the context's synthetic `PositionView` instead of a store lookup
/// and must tag every Sell with an exit reason. Both are pure CPU work.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn analyze(&self, ctx: &AnalysisContext<'_>) -> Analysis;

    fn analyze_for_backtest(&self, ctx: &AnalysisContext<'_>) -> Analysis {
        self.analyze(ctx)
    }

    /// Smallest candle window that gives this strategy enough history.
    fn min_candles(&self) -> usize {
        30
    }
}

/// Name-keyed registry populated once at startup. Analysis never throws out
/// of the registry: a panicking strategy is logged and demoted to Hold.
pub struct StrategyRegistry {
    by_name: HashMap<&'static str, Arc<dyn Strategy>>,
    order: Vec<&'static str>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            by_name: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn register(&mut self, strategy: Arc<dyn Strategy>) {
        let name = strategy.name();
        if self.by_name.insert(name, strategy).is_none() {
            self.order.push(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Strategy>> {
        self.by_name.get(name).cloned()
    }

    /// Registration-ordered names.
    pub fn names(&self) -> &[&'static str] {
        &self.order
    }

    pub fn all(&self) -> Vec<Arc<dyn Strategy>> {
        self.order
            .iter()
            .filter_map(|name| self.by_name.get(name).cloned())
            .collect()
    }

    /// Resolve a user's enabled set; an empty selection means the system
    /// default bundle (every registered strategy except the scaled one).
    pub fn select(&self, enabled: &[String]) -> Vec<Arc<dyn Strategy>> {
        if enabled.is_empty() {
            return self
                .all()
                .into_iter()
                .filter(|s| s.name() != scaled::NAME)
                .collect();
        }
        enabled.iter().filter_map(|name| self.get(name)).collect()
    }

    pub fn evaluate(&self, strategy: &dyn Strategy, ctx: &AnalysisContext<'_>) -> Analysis {
        Self::shielded(strategy.name(), || strategy.analyze(ctx))
    }

    pub fn evaluate_for_backtest(
        &self,
        strategy: &dyn Strategy,
        ctx: &AnalysisContext<'_>,
    ) -> Analysis {
        Self::shielded(strategy.name(), || strategy.analyze_for_backtest(ctx))
    }

    fn shielded(name: &str, run: impl FnOnce() -> Analysis) -> Analysis {
        match catch_unwind(AssertUnwindSafe(run)) {
            Ok(analysis) => analysis,
            Err(_) => {
                warn!(strategy = name, "strategy panicked during analysis; holding");
                Analysis::hold("analysis failure")
            }
        }
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry with the full shipped strategy set.
pub fn default_registry() -> StrategyRegistry {
    let mut registry = StrategyRegistry::new();
    registry.register(Arc::new(RsiStrategy));
    registry.register(Arc::new(GoldenCrossStrategy));
    registry.register(Arc::new(BollingerBandStrategy));
    registry.register(Arc::new(MacdStrategy));
    registry.register(Arc::new(TrendFollowingStrategy));
    registry.register(Arc::new(MomentumScalpingStrategy));
    registry.register(Arc::new(VolatilityBreakoutStrategy));
    registry.register(Arc::new(VolumeBreakoutStrategy));
    registry.register(Arc::new(VolumeImpulseStrategy));
    registry.register(Arc::new(ScaledTradingStrategy));
    registry
}

/// Name of the designated scaled strategy, used by SCALED_TRADING mode.
pub const SCALED_STRATEGY: &str = scaled::NAME;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Signal;
    use chrono::Utc;

    struct PanickingStrategy;

    impl Strategy for PanickingStrategy {
        fn name(&self) -> &'static str {
            "Panicking"
        }

        fn analyze(&self, _ctx: &AnalysisContext<'_>) -> Analysis {
            panic!("boom");
        }
    }

    #[test]
    fn test_default_registry_has_all_strategies() {
        let registry = default_registry();
        assert_eq!(registry.names().len(), 10);
        assert!(registry.get("RSI").is_some());
        assert!(registry.get("ScaledTrading").is_some());
        assert!(registry.get("Unknown").is_none());
    }

    #[test]
    fn test_default_bundle_excludes_scaled() {
        let registry = default_registry();
        let bundle = registry.select(&[]);
        assert_eq!(bundle.len(), 9);
        assert!(bundle.iter().all(|s| s.name() != SCALED_STRATEGY));
    }

    #[test]
    fn test_select_resolves_names() {
        let registry = default_registry();
        let picked = registry.select(&["RSI".to_string(), "MACD".to_string()]);
        assert_eq!(picked.len(), 2);
        // unknown names are dropped, not errors
        let picked = registry.select(&["RSI".to_string(), "Nope".to_string()]);
        assert_eq!(picked.len(), 1);
    }

    #[test]
    fn test_panicking_strategy_becomes_hold() {
        let registry = default_registry();
        let params = StrategyParams::empty();
        let candles = vec![];
        let ctx = AnalysisContext::new("KRW-BTC", &candles, None, None, &params, Utc::now());
        let analysis = registry.evaluate(&PanickingStrategy, &ctx);
        assert_eq!(analysis.signal, Signal::Hold);
    }
}
