//! Turns lifecycle commands into exchange orders.
//!
//! Ordering discipline per command: idempotency check, submit, confirm,
//! journal write, position mutation, position write. The trade record always
//! lands before the position does, and a confirmation timeout leaves the
//! pending token in place for the next tick instead of re-ordering.

use crate::domain::errors::{ExchangeError, ExecutionError};
use crate::domain::ports::{Clock, ExchangeCredentials, OrderGateway, PositionStore, TradeJournal};
use crate::domain::position::{PendingOrder, Position};
use crate::domain::types::{
    ExitReason, Order, OrderKind, OrderRequest, OrderSide, TradeRecord,
};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal::prelude::FromPrimitive;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Exchange volume precision for ASK submissions.
const VOLUME_SCALE: u32 = 8;

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Exchange trading fee per side (0.0005 = 0.05%).
    pub fee_rate: Decimal,
    /// Round-trip cost assumed when estimating profits (0.002 = 0.2%).
    pub total_cost_rate: Decimal,
    /// Exits tagged take-profit are suppressed under this net rate (0.006 = 0.6%).
    pub min_profit_rate: Decimal,
    pub confirm_timeout: Duration,
    pub confirm_poll_interval: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            fee_rate: Decimal::new(5, 4),
            total_cost_rate: Decimal::new(2, 3),
            min_profit_rate: Decimal::new(6, 3),
            confirm_timeout: Duration::from_secs(10),
            confirm_poll_interval: Duration::from_millis(300),
        }
    }
}

impl ExecutionConfig {
    /// Net profit estimate after the assumed round-trip cost.
    pub fn estimated_net_rate(&self, avg_entry: Decimal, price: Decimal) -> Decimal {
        if avg_entry.is_zero() {
            return Decimal::ZERO;
        }
        (price * (Decimal::ONE - self.total_cost_rate) - avg_entry) / avg_entry
    }

    /// Whether a take-profit at `price` clears the minimum net profit.
    pub fn clears_min_profit(&self, avg_entry: Decimal, price: Decimal) -> bool {
        self.estimated_net_rate(avg_entry, price) >= self.min_profit_rate
    }
}

/// One mutation the lifecycle layer wants executed.
#[derive(Debug, Clone)]
pub enum TradeCommand {
    EnterLeg { phase: u8, funds: Decimal },
    PartialExit { volume: Decimal },
    FinalExit { volume: Decimal, reason: ExitReason },
}

#[derive(Debug)]
pub enum ExecutionOutcome {
    Filled(Order),
    Partial(Order),
    Failed(String),
    /// A prior order for this (user, market) is still unresolved.
    PendingPrior,
}

pub struct ExecutionService {
    gateway: Arc<dyn OrderGateway>,
    journal: Arc<dyn TradeJournal>,
    positions: Arc<dyn PositionStore>,
    clock: Arc<dyn Clock>,
    config: ExecutionConfig,
}

impl ExecutionService {
    pub fn new(
        gateway: Arc<dyn OrderGateway>,
        journal: Arc<dyn TradeJournal>,
        positions: Arc<dyn PositionStore>,
        clock: Arc<dyn Clock>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            gateway,
            journal,
            positions,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Execute one command for (user, market). The caller holds the
    /// per-(user, market) lease for the whole call.
    pub async fn execute(
        &self,
        credentials: &ExchangeCredentials,
        position: &mut Position,
        command: TradeCommand,
        current_price: Decimal,
        strategy: &str,
        target_price: Option<Decimal>,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        // 1. Idempotency: resolve or respect a prior unconfirmed order. The
        // command for this tick is dropped either way; the next tick sees
        // reconciled state.
        if let Some(pending) = position.pending_order.clone() {
            match pending.uuid {
                Some(uuid) => {
                    let order = self.gateway.get_order(credentials, uuid).await?;
                    if !order.state.is_terminal() {
                        return Ok(ExecutionOutcome::PendingPrior);
                    }
                    self.reconcile_prior(position, &pending.token, &order, current_price)
                        .await?;
                    return Ok(ExecutionOutcome::PendingPrior);
                }
                None => {
                    // A token with no uuid means the submit never happened (or
                    // never came back). After a grace window the token is
                    // stale and cleared so the market does not wedge.
                    let age = self.clock.now() - pending.submitted_at;
                    if age > chrono::Duration::from_std(self.config.confirm_timeout * 4)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60))
                    {
                        warn!(
                            market = position.market.as_str(),
                            token = pending.token.as_str(),
                            "clearing stale idempotency token with no order uuid"
                        );
                        position.pending_order = None;
                        self.positions.put(position).await?;
                    }
                    return Ok(ExecutionOutcome::PendingPrior);
                }
            }
        }

        let request = self.build_request(position, &command)?;

        // 2. Stake the idempotency token before the wire call.
        position.pending_order = Some(PendingOrder {
            token: request.identifier.clone(),
            uuid: None,
            submitted_at: self.clock.now(),
        });
        self.positions.put(position).await?;

        let submitted = match self.gateway.submit(credentials, &request).await {
            Ok(order) => order,
            Err(err) => {
                position.pending_order = None;
                self.positions.put(position).await?;
                return Err(err.into());
            }
        };

        if let Some(pending) = position.pending_order.as_mut() {
            pending.uuid = Some(submitted.uuid);
        }
        self.positions.put(position).await?;

        // 3. Poll to a terminal state within the confirmation budget.
        let confirmed = match self.confirm(credentials, &submitted).await {
            Ok(order) => order,
            Err(ExecutionError::ConfirmationTimeout { market, uuid }) => {
                warn!(market = market.as_str(), uuid = uuid.as_str(), "confirmation timed out");
                return Ok(ExecutionOutcome::PendingPrior);
            }
            Err(err) => return Err(err),
        };

        if confirmed.state == crate::domain::types::OrderState::Cancel
            && confirmed.executed_volume.is_zero()
        {
            position.pending_order = None;
            self.positions.put(position).await?;
            return Ok(ExecutionOutcome::Failed("order cancelled unfilled".to_string()));
        }

        // 4-6. Fill accounting, journal write, position mutation.
        self.apply_fill(position, &command, &confirmed, current_price, strategy, target_price)
            .await?;

        let fully_filled = match &command {
            TradeCommand::EnterLeg { funds, .. } => {
                // Market bids fill by funds; treat > 99% consumed as full.
                confirmed.executed_funds + confirmed.paid_fee
                    >= *funds * Decimal::from_f64(0.99).unwrap_or(Decimal::ONE)
            }
            TradeCommand::PartialExit { volume } | TradeCommand::FinalExit { volume, .. } => {
                confirmed.executed_volume >= *volume
            }
        };
        if fully_filled {
            Ok(ExecutionOutcome::Filled(confirmed))
        } else {
            Ok(ExecutionOutcome::Partial(confirmed))
        }
    }

    /// Fill accounting in the required order: validate the fill, journal the
    /// trade, then mutate and persist the position.
    async fn apply_fill(
        &self,
        position: &mut Position,
        command: &TradeCommand,
        confirmed: &Order,
        current_price: Decimal,
        strategy: &str,
        target_price: Option<Decimal>,
    ) -> Result<(), ExecutionError> {
        let fill_price = confirmed.fill_price().ok_or_else(|| {
            ExchangeError::ContractViolation {
                market: position.market.clone(),
                reason: "terminal order with zero executed volume".to_string(),
            }
        })?;
        if fill_price <= Decimal::ZERO {
            return Err(ExchangeError::ContractViolation {
                market: position.market.clone(),
                reason: format!("non-positive fill price {fill_price}"),
            }
            .into());
        }

        let slippage = match confirmed.side {
            OrderSide::Bid => (fill_price - current_price) * confirmed.executed_volume,
            OrderSide::Ask => (current_price - fill_price) * confirmed.executed_volume,
        };

        let now = self.clock.now();
        let record = TradeRecord {
            id: None,
            user_id: position.user_id,
            market: position.market.clone(),
            side: confirmed.side,
            executed_at: now,
            amount: confirmed.executed_funds,
            volume: confirmed.executed_volume,
            price: fill_price,
            fee: confirmed.paid_fee,
            order_uuid: confirmed.uuid,
            strategy: strategy.to_string(),
            target_price,
            highest_price: position.trailing_high_price,
            half_sold: matches!(command, TradeCommand::PartialExit { .. }),
            stop_loss: matches!(
                command,
                TradeCommand::FinalExit {
                    reason: ExitReason::StopLossFixed | ExitReason::StopLossAtr,
                    ..
                }
            ),
        };
        self.journal.append(&record).await?;

        match command {
            TradeCommand::EnterLeg { phase, .. } => {
                position.apply_entry_fill(
                    *phase,
                    fill_price,
                    confirmed.executed_volume,
                    confirmed.paid_fee,
                    now,
                )?;
            }
            TradeCommand::PartialExit { .. } => {
                position.apply_partial_exit(
                    fill_price,
                    confirmed.executed_volume,
                    confirmed.paid_fee,
                    now,
                )?;
            }
            TradeCommand::FinalExit { reason, .. } => {
                position.apply_final_exit(
                    fill_price,
                    confirmed.executed_volume,
                    confirmed.paid_fee,
                    *reason,
                    now,
                )?;
            }
        }
        position.total_slippage += slippage;
        position.pending_order = None;
        self.positions.put(position).await?;

        info!(
            market = position.market.as_str(),
            side = %confirmed.side,
            price = %fill_price,
            volume = %confirmed.executed_volume,
            "order filled"
        );
        Ok(())
    }

    /// Apply a late-confirmed prior order. The leg is recovered from the
    /// idempotency token (`user:market:tag:minute`).
    async fn reconcile_prior(
        &self,
        position: &mut Position,
        token: &str,
        order: &Order,
        current_price: Decimal,
    ) -> Result<(), ExecutionError> {
        if order.executed_volume.is_zero() {
            warn!(
                market = position.market.as_str(),
                uuid = %order.uuid,
                "prior order terminal with no fill; clearing token"
            );
            position.pending_order = None;
            self.positions.put(position).await?;
            return Ok(());
        }

        let tag = token.rsplit(':').nth(1).unwrap_or("");
        let command = match tag {
            "e1" => TradeCommand::EnterLeg { phase: 1, funds: order.funds.unwrap_or_default() },
            "e2" => TradeCommand::EnterLeg { phase: 2, funds: order.funds.unwrap_or_default() },
            "e3" => TradeCommand::EnterLeg { phase: 3, funds: order.funds.unwrap_or_default() },
            "px" => TradeCommand::PartialExit { volume: order.executed_volume },
            "fx" => TradeCommand::FinalExit {
                volume: order.executed_volume,
                reason: ExitReason::SignalInvalid,
            },
            other => {
                return Err(ExecutionError::Rejected {
                    reason: format!("unrecognized idempotency token tag: {other}"),
                });
            }
        };
        warn!(
            market = position.market.as_str(),
            uuid = %order.uuid,
            tag,
            "applying late-confirmed prior order"
        );
        let strategy = position.strategy.clone();
        self.apply_fill(position, &command, order, current_price, &strategy, None)
            .await
    }

    fn build_request(
        &self,
        position: &Position,
        command: &TradeCommand,
    ) -> Result<OrderRequest, ExecutionError> {
        let minute = self.clock.now().timestamp() / 60;
        let (side, funds, volume, leg_tag) = match command {
            TradeCommand::EnterLeg { phase, funds } => {
                (OrderSide::Bid, Some(*funds), None, format!("e{phase}"))
            }
            TradeCommand::PartialExit { volume } => {
                let rounded =
                    volume.round_dp_with_strategy(VOLUME_SCALE, RoundingStrategy::ToZero);
                (OrderSide::Ask, None, Some(rounded), "px".to_string())
            }
            TradeCommand::FinalExit { volume, .. } => {
                let rounded =
                    volume.round_dp_with_strategy(VOLUME_SCALE, RoundingStrategy::ToZero);
                (OrderSide::Ask, None, Some(rounded), "fx".to_string())
            }
        };

        if let Some(volume) = volume
            && volume <= Decimal::ZERO
        {
            return Err(ExecutionError::Rejected {
                reason: format!("non-positive ask volume {volume}"),
            });
        }

        Ok(OrderRequest {
            market: position.market.clone(),
            side,
            kind: OrderKind::Market,
            price: None,
            funds,
            volume,
            identifier: format!(
                "{}:{}:{}:{}",
                position.user_id, position.market, leg_tag, minute
            ),
        })
    }

    async fn confirm(
        &self,
        credentials: &ExchangeCredentials,
        submitted: &Order,
    ) -> Result<Order, ExecutionError> {
        if submitted.state.is_terminal() {
            return Ok(submitted.clone());
        }
        let deadline = tokio::time::Instant::now() + self.config.confirm_timeout;
        loop {
            tokio::time::sleep(self.config.confirm_poll_interval).await;
            let order = self.gateway.get_order(credentials, submitted.uuid).await?;
            if order.state.is_terminal() {
                return Ok(order);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ExecutionError::ConfirmationTimeout {
                    market: submitted.market.clone(),
                    uuid: submitted.uuid.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::SystemClock;
    use crate::infrastructure::memory::{InMemoryPositionStore, InMemoryTradeJournal, MockOrderGateway};
    use rust_decimal_macros::dec;

    fn credentials() -> ExchangeCredentials {
        ExchangeCredentials {
            access_key: "ak".to_string(),
            secret_key: "sk".to_string(),
        }
    }

    fn service(
        gateway: Arc<MockOrderGateway>,
    ) -> (ExecutionService, Arc<InMemoryTradeJournal>, Arc<InMemoryPositionStore>) {
        let journal = Arc::new(InMemoryTradeJournal::new());
        let positions = Arc::new(InMemoryPositionStore::new());
        let service = ExecutionService::new(
            gateway,
            journal.clone(),
            positions.clone(),
            Arc::new(SystemClock),
            ExecutionConfig::default(),
        );
        (service, journal, positions)
    }

    #[tokio::test]
    async fn test_entry_leg_fills_and_journals() {
        let gateway = Arc::new(MockOrderGateway::filling_at(dec!(100)));
        let (service, journal, _) = service(gateway);
        let mut position =
            Position::new_pending(1, "KRW-BTC", "RSI", 80.0, chrono::Utc::now());

        let outcome = service
            .execute(
                &credentials(),
                &mut position,
                TradeCommand::EnterLeg {
                    phase: 1,
                    funds: dec!(100000),
                },
                dec!(100),
                "RSI",
                None,
            )
            .await
            .unwrap();

        assert!(matches!(outcome, ExecutionOutcome::Filled(_)));
        assert_eq!(position.entry_phase, 1);
        assert!(position.total_quantity > Decimal::ZERO);
        assert!(position.pending_order.is_none());

        let latest = journal.latest(1, "KRW-BTC").await.unwrap().unwrap();
        assert_eq!(latest.side, OrderSide::Bid);
        assert_eq!(latest.strategy, "RSI");
    }

    #[tokio::test]
    async fn test_pending_order_short_circuits() {
        let gateway = Arc::new(MockOrderGateway::filling_at(dec!(100)));
        let (service, journal, _) = service(gateway.clone());
        let now = chrono::Utc::now();
        let mut position = Position::new_pending(1, "KRW-BTC", "RSI", 80.0, now);
        position.pending_order = Some(PendingOrder {
            token: "1:KRW-BTC:e1:0".to_string(),
            uuid: None,
            submitted_at: now,
        });

        let outcome = service
            .execute(
                &credentials(),
                &mut position,
                TradeCommand::EnterLeg {
                    phase: 1,
                    funds: dec!(100000),
                },
                dec!(100),
                "RSI",
                None,
            )
            .await
            .unwrap();

        assert!(matches!(outcome, ExecutionOutcome::PendingPrior));
        assert_eq!(gateway.submissions(), 0);
        assert!(journal.latest(1, "KRW-BTC").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_final_exit_records_stop_loss_flag() {
        let gateway = Arc::new(MockOrderGateway::filling_at(dec!(97)));
        let (service, journal, _) = service(gateway);
        let now = chrono::Utc::now();
        let mut position = Position::new_pending(1, "KRW-BTC", "ScaledTrading", 90.0, now);
        position
            .apply_entry_fill(1, dec!(100), dec!(5), Decimal::ZERO, now)
            .unwrap();
        position.mark_active(now).unwrap();

        let outcome = service
            .execute(
                &credentials(),
                &mut position,
                TradeCommand::FinalExit {
                    volume: dec!(5),
                    reason: ExitReason::StopLossFixed,
                },
                dec!(97),
                "ScaledTrading",
                None,
            )
            .await
            .unwrap();

        assert!(matches!(outcome, ExecutionOutcome::Filled(_)));
        assert_eq!(position.status, crate::domain::position::PositionStatus::Closed);
        let latest = journal.latest(1, "KRW-BTC").await.unwrap().unwrap();
        assert!(latest.stop_loss);
        assert!(!latest.half_sold);
    }

    #[tokio::test]
    async fn test_gateway_error_clears_token_and_surfaces() {
        let gateway = Arc::new(MockOrderGateway::rejecting("maintenance"));
        let (service, _, positions) = service(gateway);
        let mut position =
            Position::new_pending(1, "KRW-BTC", "RSI", 80.0, chrono::Utc::now());

        let result = service
            .execute(
                &credentials(),
                &mut position,
                TradeCommand::EnterLeg {
                    phase: 1,
                    funds: dec!(100000),
                },
                dec!(100),
                "RSI",
                None,
            )
            .await;

        assert!(result.is_err());
        assert!(position.pending_order.is_none());
        let stored = positions.get(1, "KRW-BTC").await.unwrap().unwrap();
        assert!(stored.pending_order.is_none());
    }

    #[test]
    fn test_min_profit_suppression() {
        let config = ExecutionConfig::default();
        // +0.5% gross is under the 0.6% net floor once 0.2% costs apply.
        assert!(!config.clears_min_profit(dec!(100), dec!(100.5)));
        // +1.0% gross clears it.
        assert!(config.clears_min_profit(dec!(100), dec!(101)));
    }
}
