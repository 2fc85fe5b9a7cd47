//! Working-set resolution and short-lived market data caches.
//!
//! The working set per user is the explicit list plus the top-N KRW markets
//! by 24h trade value, minus user-blocked and exchange-flagged entries.
//! Tickers cache for 10 s; candles for half the candle granularity with a
//! 15 s floor. Caches are shared-read with a single writer per key.

use crate::domain::errors::ExchangeError;
use crate::domain::ports::{MarketDataSource, TradingUser};
use crate::domain::types::{Candle, MarketInfo, Ticker};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

const TICKER_TTL: Duration = Duration::from_secs(10);
const CANDLE_TTL_FLOOR: Duration = Duration::from_secs(15);
const MARKET_LIST_TTL: Duration = Duration::from_secs(600);

pub struct MarketSelector {
    source: Arc<dyn MarketDataSource>,
    markets: RwLock<Option<(Instant, Vec<MarketInfo>)>>,
    tickers: RwLock<HashMap<String, (Instant, Ticker)>>,
    candles: RwLock<HashMap<(String, u32), (Instant, Vec<Candle>)>>,
}

impl MarketSelector {
    pub fn new(source: Arc<dyn MarketDataSource>) -> Self {
        Self {
            source,
            markets: RwLock::new(None),
            tickers: RwLock::new(HashMap::new()),
            candles: RwLock::new(HashMap::new()),
        }
    }

    /// Drop every cached entry; called when a user's configuration changes.
    pub async fn invalidate(&self) {
        *self.markets.write().await = None;
        self.tickers.write().await.clear();
        self.candles.write().await.clear();
    }

    /// Ordered market working set for one user: explicit targets first, then
    /// top-N by 24h accumulated trade value.
    pub async fn working_set(&self, user: &TradingUser) -> Result<Vec<String>, ExchangeError> {
        let listed = self.listed_krw_markets().await?;
        let tradable: HashSet<&str> = listed.iter().map(|m| m.market.as_str()).collect();
        let excluded: HashSet<&str> = user.excluded_markets.iter().map(String::as_str).collect();

        let mut selected = Vec::new();
        let mut seen = HashSet::new();
        for market in &user.target_markets {
            if tradable.contains(market.as_str())
                && !excluded.contains(market.as_str())
                && seen.insert(market.clone())
            {
                selected.push(market.clone());
            }
        }

        if user.auto_select_top > 0 {
            let names: Vec<String> = listed.iter().map(|m| m.market.clone()).collect();
            let mut tickers = self.tickers_for(&names).await?;
            tickers.sort_by(|a, b| {
                b.acc_trade_value_24h
                    .cmp(&a.acc_trade_value_24h)
                    .then_with(|| a.market.cmp(&b.market))
            });
            for ticker in tickers.into_iter().take(user.auto_select_top) {
                if !excluded.contains(ticker.market.as_str()) && seen.insert(ticker.market.clone())
                {
                    selected.push(ticker.market);
                }
            }
        }

        debug!(user = user.id, count = selected.len(), "resolved working set");
        Ok(selected)
    }

    /// Newest-first candle window, cached for half the granularity.
    pub async fn candles(
        &self,
        market: &str,
        unit: u32,
        count: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let key = (market.to_string(), unit);
        let ttl = candle_ttl(unit);
        {
            let cache = self.candles.read().await;
            if let Some((at, cached)) = cache.get(&key)
                && at.elapsed() < ttl
                && cached.len() >= count
            {
                return Ok(cached.iter().take(count).cloned().collect());
            }
        }

        let fresh = self.source.minute_candles(market, unit, count).await?;
        let mut cache = self.candles.write().await;
        cache.insert(key, (Instant::now(), fresh.clone()));
        Ok(fresh)
    }

    pub async fn ticker(&self, market: &str) -> Result<Option<Ticker>, ExchangeError> {
        let found = self.tickers_for(&[market.to_string()]).await?;
        Ok(found.into_iter().next())
    }

    async fn tickers_for(&self, markets: &[String]) -> Result<Vec<Ticker>, ExchangeError> {
        let mut fresh_needed = Vec::new();
        let mut result = Vec::new();
        {
            let cache = self.tickers.read().await;
            for market in markets {
                match cache.get(market) {
                    Some((at, ticker)) if at.elapsed() < TICKER_TTL => {
                        result.push(ticker.clone());
                    }
                    _ => fresh_needed.push(market.clone()),
                }
            }
        }
        if !fresh_needed.is_empty() {
            let fetched = self.source.tickers(&fresh_needed).await?;
            let mut cache = self.tickers.write().await;
            let now = Instant::now();
            for ticker in fetched {
                cache.insert(ticker.market.clone(), (now, ticker.clone()));
                result.push(ticker);
            }
        }
        Ok(result)
    }

    /// KRW-quoted markets without an exchange warning flag.
    async fn listed_krw_markets(&self) -> Result<Vec<MarketInfo>, ExchangeError> {
        {
            let cache = self.markets.read().await;
            if let Some((at, cached)) = cache.as_ref()
                && at.elapsed() < MARKET_LIST_TTL
            {
                return Ok(cached.clone());
            }
        }
        let all = self.source.markets().await?;
        let listed: Vec<MarketInfo> = all
            .into_iter()
            .filter(|m| m.market.starts_with("KRW-") && !m.warning)
            .collect();
        *self.markets.write().await = Some((Instant::now(), listed.clone()));
        Ok(listed)
    }
}

fn candle_ttl(unit: u32) -> Duration {
    let half = Duration::from_secs(unit as u64 * 60 / 2);
    half.max(CANDLE_TTL_FLOOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::memory::StaticMarketData;
    use rust_decimal_macros::dec;

    fn info(market: &str, warning: bool) -> MarketInfo {
        MarketInfo {
            market: market.to_string(),
            korean_name: market.to_string(),
            english_name: market.to_string(),
            warning,
        }
    }

    fn ticker(market: &str, value: i64) -> Ticker {
        Ticker {
            market: market.to_string(),
            trade_price: dec!(100),
            change_rate_24h: 0.0,
            acc_trade_value_24h: value.into(),
        }
    }

    fn user(targets: &[&str], excluded: &[&str], top: usize) -> TradingUser {
        TradingUser {
            id: 1,
            name: "tester".to_string(),
            credentials: None,
            auto_trading_enabled: true,
            target_markets: targets.iter().map(|s| s.to_string()).collect(),
            excluded_markets: excluded.iter().map(|s| s.to_string()).collect(),
            auto_select_top: top,
            enabled_strategies: vec![],
        }
    }

    fn source() -> Arc<StaticMarketData> {
        Arc::new(
            StaticMarketData::new()
                .with_market(info("KRW-BTC", false))
                .with_market(info("KRW-ETH", false))
                .with_market(info("KRW-XRP", false))
                .with_market(info("KRW-FLAG", true))
                .with_market(info("BTC-ETH", false))
                .with_ticker(ticker("KRW-BTC", 900))
                .with_ticker(ticker("KRW-ETH", 500))
                .with_ticker(ticker("KRW-XRP", 100)),
        )
    }

    #[tokio::test]
    async fn test_explicit_targets_come_first() {
        let selector = MarketSelector::new(source());
        let set = selector
            .working_set(&user(&["KRW-XRP"], &[], 2))
            .await
            .unwrap();
        assert_eq!(set, vec!["KRW-XRP", "KRW-BTC", "KRW-ETH"]);
    }

    #[tokio::test]
    async fn test_exclusions_and_warnings_filtered() {
        let selector = MarketSelector::new(source());
        let set = selector
            .working_set(&user(&["KRW-FLAG", "BTC-ETH"], &["KRW-ETH"], 3))
            .await
            .unwrap();
        // flagged and non-KRW targets dropped, excluded market skipped in top-N
        assert_eq!(set, vec!["KRW-BTC", "KRW-XRP"]);
    }

    #[tokio::test]
    async fn test_top_n_ranked_by_trade_value() {
        let selector = MarketSelector::new(source());
        let set = selector.working_set(&user(&[], &[], 2)).await.unwrap();
        assert_eq!(set, vec!["KRW-BTC", "KRW-ETH"]);
    }

    #[tokio::test]
    async fn test_candle_ttl_scaling() {
        assert_eq!(candle_ttl(1), Duration::from_secs(30));
        assert_eq!(candle_ttl(5), Duration::from_secs(150));
        // floor applies below 30s halves; unit is minutes so 1 is already 30s
        assert!(candle_ttl(1) >= CANDLE_TTL_FLOOR);
    }
}
