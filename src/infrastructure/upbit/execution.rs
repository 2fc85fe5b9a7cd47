use super::auth::bearer_token;
use super::models::{AccountDto, OrderDto};
use crate::domain::errors::ExchangeError;
use crate::domain::ports::{ExchangeCredentials, OrderGateway};
use crate::domain::types::{Account, Order, OrderKind, OrderRequest, OrderSide};
use crate::infrastructure::rate_limit::TokenBucket;
use async_trait::async_trait;
use reqwest_middleware::ClientWithMiddleware;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub struct UpbitOrderGateway {
    client: ClientWithMiddleware,
    base_url: String,
    /// One token bucket per credential set; the exchange limit is per key.
    limiters: Mutex<HashMap<String, Arc<TokenBucket>>>,
}

impl UpbitOrderGateway {
    pub fn new(client: ClientWithMiddleware, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            limiters: Mutex::new(HashMap::new()),
        }
    }

    async fn limiter(&self, access_key: &str) -> Arc<TokenBucket> {
        let mut limiters = self.limiters.lock().await;
        limiters
            .entry(access_key.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::per_credential()))
            .clone()
    }

    /// Sorted key=value query string; the same string is hashed into the JWT
    /// and sent on the wire.
    fn query_string(params: &[(&str, String)]) -> String {
        let mut sorted: Vec<&(&str, String)> = params.iter().collect();
        sorted.sort_by_key(|(k, _)| *k);
        sorted
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    async fn send<T: DeserializeOwned>(
        &self,
        credentials: &ExchangeCredentials,
        method: reqwest::Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        self.limiter(&credentials.access_key).await.acquire().await;

        let query = if params.is_empty() {
            None
        } else {
            Some(Self::query_string(params))
        };
        let token = bearer_token(credentials, query.as_deref())?;

        let mut url = format!("{}{path}", self.base_url);
        if let Some(q) = &query {
            url.push('?');
            url.push_str(q);
        }

        let response = self
            .client
            .request(method.clone(), &url)
            .header("Authorization", token)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient {
                reason: format!("{method} {path}: {e}"),
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ExchangeError::RateLimited { retry_after_ms: 1_000 });
        }
        if status.as_u16() == 404 {
            return Err(ExchangeError::OrderNotFound {
                uuid: params
                    .iter()
                    .find(|(k, _)| *k == "uuid")
                    .map(|(_, v)| v.clone())
                    .unwrap_or_default(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExchangeError::Transient {
                reason: format!("{method} {path}: status {status}: {body}"),
            });
        }
        response.json().await.map_err(|e| ExchangeError::Transient {
            reason: format!("{method} {path}: body decode: {e}"),
        })
    }
}

#[async_trait]
impl OrderGateway for UpbitOrderGateway {
    async fn accounts(
        &self,
        credentials: &ExchangeCredentials,
    ) -> Result<Vec<Account>, ExchangeError> {
        let dtos: Vec<AccountDto> = self
            .send(credentials, reqwest::Method::GET, "/v1/accounts", &[])
            .await?;
        dtos.into_iter().map(AccountDto::into_domain).collect()
    }

    async fn submit(
        &self,
        credentials: &ExchangeCredentials,
        request: &OrderRequest,
    ) -> Result<Order, ExchangeError> {
        let mut params: Vec<(&str, String)> = vec![
            ("market", request.market.clone()),
            ("side", request.side.to_string()),
            ("identifier", request.identifier.clone()),
        ];
        match (request.kind, request.side) {
            (OrderKind::Market, OrderSide::Bid) => {
                let funds = request.funds.ok_or_else(|| ExchangeError::ContractViolation {
                    market: request.market.clone(),
                    reason: "market bid without funds".to_string(),
                })?;
                params.push(("ord_type", "price".to_string()));
                params.push(("price", funds.to_string()));
            }
            (OrderKind::Market, OrderSide::Ask) => {
                let volume =
                    request.volume.ok_or_else(|| ExchangeError::ContractViolation {
                        market: request.market.clone(),
                        reason: "market ask without volume".to_string(),
                    })?;
                params.push(("ord_type", "market".to_string()));
                params.push(("volume", volume.to_string()));
            }
            (OrderKind::Limit, _) => {
                let price = request.price.ok_or_else(|| ExchangeError::ContractViolation {
                    market: request.market.clone(),
                    reason: "limit order without price".to_string(),
                })?;
                let volume =
                    request.volume.ok_or_else(|| ExchangeError::ContractViolation {
                        market: request.market.clone(),
                        reason: "limit order without volume".to_string(),
                    })?;
                params.push(("ord_type", "limit".to_string()));
                params.push(("price", price.to_string()));
                params.push(("volume", volume.to_string()));
            }
        }

        debug!(market = request.market.as_str(), side = %request.side, "submitting order");
        let dto: OrderDto = self
            .send(credentials, reqwest::Method::POST, "/v1/orders", &params)
            .await?;
        dto.into_domain()
    }

    async fn get_order(
        &self,
        credentials: &ExchangeCredentials,
        uuid: Uuid,
    ) -> Result<Order, ExchangeError> {
        let dto: OrderDto = self
            .send(
                credentials,
                reqwest::Method::GET,
                "/v1/order",
                &[("uuid", uuid.to_string())],
            )
            .await?;
        dto.into_domain()
    }

    async fn cancel_order(
        &self,
        credentials: &ExchangeCredentials,
        uuid: Uuid,
    ) -> Result<Order, ExchangeError> {
        let dto: OrderDto = self
            .send(
                credentials,
                reqwest::Method::DELETE,
                "/v1/order",
                &[("uuid", uuid.to_string())],
            )
            .await?;
        dto.into_domain()
    }

    async fn open_orders(
        &self,
        credentials: &ExchangeCredentials,
        market: &str,
    ) -> Result<Vec<Order>, ExchangeError> {
        let dtos: Vec<OrderDto> = self
            .send(
                credentials,
                reqwest::Method::GET,
                "/v1/orders",
                &[("market", market.to_string()), ("state", "wait".to_string())],
            )
            .await?;
        dtos.into_iter().map(OrderDto::into_domain).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_string_is_sorted_and_stable() {
        let params = vec![
            ("side", "bid".to_string()),
            ("market", "KRW-BTC".to_string()),
            ("ord_type", "price".to_string()),
        ];
        assert_eq!(
            UpbitOrderGateway::query_string(&params),
            "market=KRW-BTC&ord_type=price&side=bid"
        );
    }
}
