//! Cron-driven evaluation loop.
//!
//! One ticker task per schedule entry. Per tick: every enabled user's
//! working set is evaluated market by market, bounded by a per-user pool and
//! a global user pool. A per-(user, market) try-lock lease serializes
//! mutation; a tick that finds the lease held is dropped rather than queued,
//! so a slow exchange cannot pile up laggard work. Each market tick runs
//! under a deadline; expiry abandons that market until the next fire.

use crate::application::lifecycle::PositionLifecycle;
use crate::application::market_selector::MarketSelector;
use crate::application::strategies::{
    Analysis, AnalysisContext, PositionView, SCALED_STRATEGY, StrategyParams, StrategyRegistry,
};
use crate::application::voting::{self, Decision, VoteMode};
use crate::domain::ports::{
    CandleStore, Clock, OrderGateway, ParameterStore, PositionStore, SimulationTaskStore,
    TradeJournal, TradingUser, UserRegistry,
};
use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use futures::StreamExt;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub candle_unit: u32,
    pub candle_count: usize,
    pub tick_deadline: Duration,
    pub markets_pool: usize,
    pub users_pool: usize,
    pub mode: VoteMode,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            candle_unit: 1,
            candle_count: 100,
            tick_deadline: Duration::from_secs(30),
            markets_pool: 8,
            users_pool: 4,
            mode: VoteMode::Default,
        }
    }
}

/// Interval from the minute field of a 5-field cron spec. The system only
/// schedules minute-grained work (`*`, `*/n`, or a fixed minute for hourly
/// jobs); anything else is a configuration error.
pub fn parse_cron_interval(spec: &str) -> Result<Duration> {
    let fields: Vec<&str> = spec.split_whitespace().collect();
    if fields.len() != 5 {
        anyhow::bail!("cron spec must have 5 fields, got {}: {spec:?}", fields.len());
    }
    let minute = fields[0];
    if minute == "*" {
        return Ok(Duration::from_secs(60));
    }
    if let Some(step) = minute.strip_prefix("*/") {
        let n: u64 = step
            .parse()
            .with_context(|| format!("invalid cron step: {minute:?}"))?;
        if n == 0 || n > 59 {
            anyhow::bail!("cron minute step out of range: {n}");
        }
        return Ok(Duration::from_secs(n * 60));
    }
    if minute.parse::<u8>().map(|m| m < 60).unwrap_or(false) {
        // A fixed minute means once per hour.
        return Ok(Duration::from_secs(3600));
    }
    anyhow::bail!("unsupported cron minute field: {minute:?}")
}

type LeaseKey = (i64, String);

pub struct TradingScheduler {
    registry: Arc<StrategyRegistry>,
    selector: Arc<MarketSelector>,
    lifecycle: Arc<PositionLifecycle>,
    gateway: Arc<dyn OrderGateway>,
    positions: Arc<dyn PositionStore>,
    params: Arc<dyn ParameterStore>,
    users: Arc<dyn UserRegistry>,
    journal: Arc<dyn TradeJournal>,
    candle_store: Arc<dyn CandleStore>,
    task_store: Arc<dyn SimulationTaskStore>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    leases: Mutex<HashMap<LeaseKey, Arc<Mutex<()>>>>,
}

impl TradingScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<StrategyRegistry>,
        selector: Arc<MarketSelector>,
        lifecycle: Arc<PositionLifecycle>,
        gateway: Arc<dyn OrderGateway>,
        positions: Arc<dyn PositionStore>,
        params: Arc<dyn ParameterStore>,
        users: Arc<dyn UserRegistry>,
        journal: Arc<dyn TradeJournal>,
        candle_store: Arc<dyn CandleStore>,
        task_store: Arc<dyn SimulationTaskStore>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            selector,
            lifecycle,
            gateway,
            positions,
            params,
            users,
            journal,
            candle_store,
            task_store,
            clock,
            config,
            leases: Mutex::new(HashMap::new()),
        }
    }

    /// Main ticker plus the hourly report and daily cleanup tickers. Runs
    /// until `shutdown` flips true; in-flight ticks drain before return.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut report_ticker = tokio::time::interval(Duration::from_secs(3600));
        report_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cleanup_ticker = tokio::time::interval(Duration::from_secs(86_400));
        cleanup_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_secs = self.config.tick_interval.as_secs(),
            "trading scheduler started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = report_ticker.tick() => self.status_report().await,
                _ = cleanup_ticker.tick() => self.cleanup().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("trading scheduler draining and stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One evaluation pass over every enabled user.
    pub async fn tick(&self) {
        let users = match self.users.active_users().await {
            Ok(users) => users,
            Err(err) => {
                error!(%err, "failed to load active users; skipping tick");
                return;
            }
        };
        futures::stream::iter(users)
            .for_each_concurrent(self.config.users_pool.max(1), |user| async move {
                self.tick_user(&user).await;
            })
            .await;
    }

    async fn tick_user(&self, user: &TradingUser) {
        let Some(credentials) = user.credentials.clone() else {
            warn!(user = user.id, "user has no usable credentials; skipping");
            return;
        };

        let markets = match self.selector.working_set(user).await {
            Ok(markets) => markets,
            Err(err) => {
                warn!(user = user.id, %err, "failed to resolve working set");
                return;
            }
        };
        if markets.is_empty() {
            return;
        }

        // One balance read per user per tick; every market shares it.
        let krw_balance = match self.gateway.accounts(&credentials).await {
            Ok(accounts) => accounts
                .iter()
                .find(|a| a.currency == "KRW")
                .map(|a| a.balance)
                .unwrap_or(Decimal::ZERO),
            Err(err) => {
                warn!(user = user.id, %err, "failed to read accounts; skipping user tick");
                return;
            }
        };

        futures::stream::iter(markets)
            .for_each_concurrent(self.config.markets_pool.max(1), |market| {
                let credentials = credentials.clone();
                async move {
                    let deadline = self.config.tick_deadline;
                    let result = tokio::time::timeout(
                        deadline,
                        self.tick_market(user, &credentials, &market, krw_balance),
                    )
                    .await;
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            warn!(user = user.id, market, %err, "market tick failed");
                        }
                        Err(_) => {
                            warn!(user = user.id, market, "market tick hit the deadline");
                        }
                    }
                }
            })
            .await;
    }

    async fn tick_market(
        &self,
        user: &TradingUser,
        credentials: &crate::domain::ports::ExchangeCredentials,
        market: &str,
        krw_balance: Decimal,
    ) -> Result<()> {
        let lease = self.lease(user.id, market).await;
        let Ok(_guard) = lease.try_lock() else {
            // A prior tick still owns this (user, market); drop, don't queue.
            debug!(user = user.id, market, "lease held; dropping tick");
            return Ok(());
        };

        let candles = self
            .selector
            .candles(market, self.config.candle_unit, self.config.candle_count)
            .await
            .context("candle fetch failed")?;
        if candles.len() < 30 {
            debug!(market, got = candles.len(), "window too small; skipping market");
            return Ok(());
        }

        let position = self
            .positions
            .get(user.id, market)
            .await
            .context("position read failed")?;
        let has_open = position.as_ref().map(|p| p.is_open()).unwrap_or(false);
        let view = position.as_ref().map(|p| {
            let held = p
                .time_of_first_leg()
                .map(|start| {
                    let minutes = (self.clock.now() - start).num_minutes().max(0) as u32;
                    minutes / self.config.candle_unit.max(1)
                })
                .unwrap_or(0);
            PositionView::from_position(p, held)
        });

        // "Last trade" context for strategies that look at their own history;
        // always scoped to this user.
        let last_trade = self
            .journal
            .latest(user.id, market)
            .await
            .context("trade history read failed")?;

        let decision = self
            .decide(user, market, &candles, view.as_ref(), last_trade.as_ref(), has_open)
            .await?;

        self.lifecycle
            .apply(
                user,
                credentials,
                market,
                &decision,
                position,
                &candles,
                krw_balance,
            )
            .await
            .context("lifecycle apply failed")?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn decide(
        &self,
        user: &TradingUser,
        market: &str,
        candles: &[crate::domain::types::Candle],
        view: Option<&PositionView>,
        last_trade: Option<&crate::domain::types::TradeRecord>,
        has_open: bool,
    ) -> Result<Decision> {
        let now = self.clock.now();
        match self.config.mode {
            VoteMode::ScaledTrading => {
                let strategy = self
                    .registry
                    .get(SCALED_STRATEGY)
                    .context("scaled strategy not registered")?;
                let params = StrategyParams::resolve(
                    self.params.as_ref(),
                    strategy.name(),
                    Some(user.id),
                )
                .await?;
                let ctx =
                    AnalysisContext::new(market, candles, view, last_trade, &params, now);
                let analysis = self.registry.evaluate(strategy.as_ref(), &ctx);
                Ok(voting::decide_scaled(strategy.name(), &analysis))
            }
            VoteMode::Default => {
                let strategies = self.registry.select(&user.enabled_strategies);
                let mut outcomes: Vec<(String, Analysis)> =
                    Vec::with_capacity(strategies.len());
                for strategy in &strategies {
                    if candles.len() < strategy.min_candles() {
                        continue;
                    }
                    let params = StrategyParams::resolve(
                        self.params.as_ref(),
                        strategy.name(),
                        Some(user.id),
                    )
                    .await?;
                    let ctx =
                        AnalysisContext::new(market, candles, view, last_trade, &params, now);
                    let analysis = self.registry.evaluate(strategy.as_ref(), &ctx);
                    outcomes.push((strategy.name().to_string(), analysis));
                }
                Ok(voting::decide(&outcomes, has_open))
            }
        }
    }

    /// Hourly summary to the log channel.
    async fn status_report(&self) {
        let users = match self.users.active_users().await {
            Ok(users) => users,
            Err(err) => {
                warn!(%err, "status report skipped");
                return;
            }
        };
        for user in users {
            match self.positions.open_for_user(user.id).await {
                Ok(open) => {
                    let markets: Vec<String> =
                        open.iter().map(|p| p.market.clone()).collect();
                    info!(
                        user = user.id,
                        open_positions = open.len(),
                        markets = markets.join(","),
                        "hourly status"
                    );
                }
                Err(err) => warn!(user = user.id, %err, "status report read failed"),
            }
        }
    }

    /// Daily cleanup: candle cache beyond 7 days, simulation tasks beyond 30.
    async fn cleanup(&self) {
        let now = self.clock.now();
        match self
            .candle_store
            .prune_older_than(now - ChronoDuration::days(7))
            .await
        {
            Ok(pruned) => info!(pruned, "candle cache pruned"),
            Err(err) => warn!(%err, "candle prune failed"),
        }
        match self
            .task_store
            .prune_older_than(now - ChronoDuration::days(30))
            .await
        {
            Ok(pruned) => info!(pruned, "simulation task history trimmed"),
            Err(err) => warn!(%err, "task prune failed"),
        }
    }

    async fn lease(&self, user_id: i64, market: &str) -> Arc<Mutex<()>> {
        let mut leases = self.leases.lock().await;
        leases
            .entry((user_id, market.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cron_every_minute() {
        assert_eq!(
            parse_cron_interval("* * * * *").unwrap(),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_cron_step() {
        assert_eq!(
            parse_cron_interval("*/5 * * * *").unwrap(),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn test_cron_fixed_minute_is_hourly() {
        assert_eq!(
            parse_cron_interval("0 * * * *").unwrap(),
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn test_cron_rejects_bad_specs() {
        assert!(parse_cron_interval("* * *").is_err());
        assert!(parse_cron_interval("*/0 * * * *").is_err());
        assert!(parse_cron_interval("61 * * * *").is_err());
        assert!(parse_cron_interval("a * * * *").is_err());
    }
}
