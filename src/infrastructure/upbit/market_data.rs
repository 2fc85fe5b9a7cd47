use super::models::{CandleDto, MarketDto, TickerDto};
use crate::domain::errors::ExchangeError;
use crate::domain::ports::MarketDataSource;
use crate::domain::types::{Candle, MarketInfo, Ticker};
use async_trait::async_trait;
use reqwest_middleware::ClientWithMiddleware;
use serde::de::DeserializeOwned;
use tracing::debug;

const MAX_CANDLE_COUNT: usize = 200;
const MINUTE_UNITS: [u32; 7] = [1, 3, 5, 15, 30, 60, 240];

pub struct UpbitMarketData {
    client: ClientWithMiddleware,
    base_url: String,
}

impl UpbitMarketData {
    pub fn new(client: ClientWithMiddleware, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient {
                reason: format!("GET {path}: {e}"),
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ExchangeError::RateLimited { retry_after_ms: 1_000 });
        }
        if !status.is_success() {
            return Err(ExchangeError::Transient {
                reason: format!("GET {path}: status {status}"),
            });
        }
        response.json().await.map_err(|e| ExchangeError::Transient {
            reason: format!("GET {path}: body decode: {e}"),
        })
    }
}

#[async_trait]
impl MarketDataSource for UpbitMarketData {
    async fn markets(&self) -> Result<Vec<MarketInfo>, ExchangeError> {
        let dtos: Vec<MarketDto> = self
            .get_json("/v1/market/all", &[("isDetails", "true".to_string())])
            .await?;
        Ok(dtos.into_iter().map(MarketInfo::from).collect())
    }

    async fn tickers(&self, markets: &[String]) -> Result<Vec<Ticker>, ExchangeError> {
        if markets.is_empty() {
            return Ok(Vec::new());
        }
        let dtos: Vec<TickerDto> = self
            .get_json("/v1/ticker", &[("markets", markets.join(","))])
            .await?;
        dtos.into_iter().map(TickerDto::into_domain).collect()
    }

    async fn minute_candles(
        &self,
        market: &str,
        unit: u32,
        count: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        if !MINUTE_UNITS.contains(&unit) {
            return Err(ExchangeError::ContractViolation {
                market: market.to_string(),
                reason: format!("unsupported candle unit {unit}"),
            });
        }
        let count = count.min(MAX_CANDLE_COUNT);
        debug!(market, unit, count, "fetching minute candles");
        let dtos: Vec<CandleDto> = self
            .get_json(
                &format!("/v1/candles/minutes/{unit}"),
                &[
                    ("market", market.to_string()),
                    ("count", count.to_string()),
                ],
            )
            .await?;
        dtos.into_iter().map(|dto| dto.into_domain(unit)).collect()
    }

    async fn day_candles(&self, market: &str, count: usize) -> Result<Vec<Candle>, ExchangeError> {
        let count = count.min(MAX_CANDLE_COUNT);
        let dtos: Vec<CandleDto> = self
            .get_json(
                "/v1/candles/days",
                &[
                    ("market", market.to_string()),
                    ("count", count.to_string()),
                ],
            )
            .await?;
        dtos.into_iter().map(|dto| dto.into_domain(1440)).collect()
    }
}
