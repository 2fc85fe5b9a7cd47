//! Realtime scaled-position workflow.
//!
//! One call per (user, market) tick, under the caller's exclusive lease:
//! ratchets the trailing stop, fires stop/trailing exits, advances entry
//! legs on configured drawdowns, and applies the voted decision through the
//! execution service. Entry legs follow the 30/30/40 split computed off the
//! first leg's funds.

use crate::application::execution::{ExecutionOutcome, ExecutionService, TradeCommand};
use crate::application::risk_manager::{GateDecision, RiskManager};
use crate::application::voting::{Action, Decision};
use crate::domain::errors::ExecutionError;
use crate::domain::ports::{Clock, ExchangeCredentials, PositionStore, TradingUser};
use crate::domain::position::{Position, PositionStatus};
use crate::domain::types::{Candle, ExitReason};
use crate::domain::indicators;
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub entry_ratio1: f64,
    pub entry_ratio2: f64,
    pub entry_ratio3: f64,
    pub entry2_drop_threshold: f64,
    pub entry3_drop_threshold: f64,
    pub partial_take_profit_rate: f64,
    pub partial_exit_ratio: f64,
    pub take_profit_atr_multiplier: f64,
    pub stop_loss_atr_multiplier: f64,
    /// Hard clamp: the fixed stop is never further than this below entry.
    pub max_stop_loss_rate: f64,
    /// Noise floor: the fixed stop is never closer than this below entry.
    pub min_stop_loss_rate: f64,
    pub trailing_activation_threshold: f64,
    pub trailing_atr_multiplier: f64,
    pub trailing_stop_rate: f64,
    pub min_hold_candles: u32,
    pub atr_period: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            entry_ratio1: 0.30,
            entry_ratio2: 0.30,
            entry_ratio3: 0.40,
            entry2_drop_threshold: 0.015,
            entry3_drop_threshold: 0.025,
            partial_take_profit_rate: 0.025,
            partial_exit_ratio: 0.50,
            take_profit_atr_multiplier: 3.0,
            stop_loss_atr_multiplier: 2.0,
            max_stop_loss_rate: 0.03,
            min_stop_loss_rate: 0.005,
            trailing_activation_threshold: 0.03,
            trailing_atr_multiplier: 0.0,
            trailing_stop_rate: 0.015,
            min_hold_candles: 3,
            atr_period: 14,
        }
    }
}

/// What the lifecycle did this tick, for the log channel.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    EnteredLeg(u8),
    Activated,
    PartialExit,
    FinalExit(ExitReason),
    TrailingRatcheted,
    EntryRejected(String),
    ExitSuppressed(String),
    OrderPending,
    Idle,
}

pub struct PositionLifecycle {
    execution: Arc<ExecutionService>,
    risk: Arc<RiskManager>,
    positions: Arc<dyn PositionStore>,
    clock: Arc<dyn Clock>,
    config: LifecycleConfig,
}

impl PositionLifecycle {
    pub fn new(
        execution: Arc<ExecutionService>,
        risk: Arc<RiskManager>,
        positions: Arc<dyn PositionStore>,
        clock: Arc<dyn Clock>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            execution,
            risk,
            positions,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Drive one (user, market) through one tick. `position` is the snapshot
    /// read under the lease; `candles` is the newest-first analysis window.
    #[allow(clippy::too_many_arguments)]
    pub async fn apply(
        &self,
        user: &TradingUser,
        credentials: &ExchangeCredentials,
        market: &str,
        decision: &Decision,
        position: Option<Position>,
        candles: &[Candle],
        krw_balance: Decimal,
    ) -> Result<Vec<LifecycleEvent>, ExecutionError> {
        let current_price = match candles.first() {
            Some(c) => c.close,
            None => return Ok(vec![LifecycleEvent::Idle]),
        };
        let unit = candles.first().map(|c| c.unit).unwrap_or(1).max(1);
        let mut events = Vec::new();

        let mut position = match position {
            Some(p) if p.is_open() || p.status == PositionStatus::Pending => Some(p),
            _ => None,
        };

        // Maintenance on the open position before the decision is applied.
        if let Some(p) = position.as_mut()
            && p.is_open()
        {
            self.maintain(p, current_price, candles).await?;

            if let Some(reason) = self.protective_exit(p, current_price, unit) {
                let outcome = self
                    .execution
                    .execute(
                        credentials,
                        p,
                        TradeCommand::FinalExit {
                            volume: p.remaining_quantity(),
                            reason,
                        },
                        current_price,
                        &decision_strategy(decision, p),
                        decision.target_price,
                    )
                    .await?;
                return Ok(match outcome {
                    ExecutionOutcome::Filled(_) | ExecutionOutcome::Partial(_) => {
                        info!(market, ?reason, "protective exit filled");
                        vec![LifecycleEvent::FinalExit(reason)]
                    }
                    ExecutionOutcome::PendingPrior => vec![LifecycleEvent::OrderPending],
                    ExecutionOutcome::Failed(msg) => {
                        vec![LifecycleEvent::ExitSuppressed(msg)]
                    }
                });
            }

            // Autonomous partial take-profit, the same way the stop checks
            // run: price alone moves Active -> Exiting at the threshold.
            if let Some(event) = self
                .partial_take_profit(credentials, p, current_price)
                .await?
            {
                events.push(event);
            }

            // Autonomous scale-in on drawdown while still entering.
            if p.status == PositionStatus::Entering {
                if let Some(event) = self
                    .advance_entry(credentials, p, current_price, krw_balance)
                    .await?
                {
                    events.push(event);
                }
                self.maybe_activate(p, current_price).await?;
            }
        }

        match decision.action {
            Action::Buy => {
                let retryable = position
                    .as_ref()
                    .map(|p| p.status == PositionStatus::Pending)
                    .unwrap_or(true);
                if retryable {
                    // No position, or a Pending one retrying leg 1 behind the
                    // idempotency check (an unconfirmed first order resolves
                    // there).
                    let event = self
                        .open_position(
                            user,
                            credentials,
                            market,
                            decision,
                            position.clone(),
                            current_price,
                            candles,
                            krw_balance,
                            unit,
                        )
                        .await?;
                    events.push(event);
                } else if let Some(p) = position.as_ref()
                    && p.status != PositionStatus::Entering
                {
                    // A BUY against an Active/Exiting position is ignored;
                    // entry phases never advance after the partial exit. An
                    // Entering position was already handled by the autonomous
                    // drawdown check.
                    debug!(
                        market,
                        status = p.status.as_str(),
                        "ignoring BUY on non-entering position"
                    );
                }
            }
            Action::Sell => {
                if let Some(p) = position.as_mut()
                    && p.is_open()
                {
                    if let Some(event) = self
                        .apply_sell(credentials, p, decision, current_price)
                        .await?
                    {
                        events.push(event);
                    }
                }
            }
            Action::Hold => {}
        }

        if events.is_empty() {
            events.push(LifecycleEvent::Idle);
        }
        Ok(events)
    }

    /// Trailing arm/ratchet; persists when anything moved.
    async fn maintain(
        &self,
        position: &mut Position,
        price: Decimal,
        candles: &[Candle],
    ) -> Result<(), ExecutionError> {
        let armed_at = Decimal::from_f64(self.config.trailing_activation_threshold)
            .unwrap_or_default();
        let already_armed = position.trailing_stop_price.is_some();
        let arming_now = !position.avg_entry_price.is_zero()
            && position.unrealized_return(price) >= armed_at;
        if !(already_armed || arming_now) {
            return Ok(());
        }

        let high = position.trailing_high_price.unwrap_or(price).max(price);
        let distance = self.trailing_distance(high, candles);
        let before = (position.trailing_high_price, position.trailing_stop_price);
        position
            .ratchet_trailing(price, distance, self.clock.now())
            .map_err(ExecutionError::from)?;
        if before != (position.trailing_high_price, position.trailing_stop_price) {
            self.positions.put(position).await?;
            debug!(
                market = position.market.as_str(),
                high = %position.trailing_high_price.unwrap_or_default(),
                stop = %position.trailing_stop_price.unwrap_or_default(),
                "trailing stop ratcheted"
            );
        }
        Ok(())
    }

    /// ATR-scaled trailing distance when configured, rate-of-high otherwise.
    fn trailing_distance(&self, high: Decimal, candles: &[Candle]) -> Decimal {
        if self.config.trailing_atr_multiplier > 0.0
            && let Ok(atr) = indicators::atr(candles, self.config.atr_period)
            && let Some(distance) =
                Decimal::from_f64(atr * self.config.trailing_atr_multiplier)
        {
            return distance;
        }
        high * Decimal::from_f64(self.config.trailing_stop_rate).unwrap_or_default()
    }

    /// Stop-loss / trailing-stop triggers, honoring the minimum hold.
    fn protective_exit(
        &self,
        position: &Position,
        price: Decimal,
        unit: u32,
    ) -> Option<ExitReason> {
        let held = self.hold_candles(position, unit);

        if let Some(stop) = position.trailing_stop_price
            && price <= stop
        {
            return Some(ExitReason::TrailingStop);
        }

        if held >= self.config.min_hold_candles
            && let Some(stop) = position.stop_loss_price
            && price <= stop
        {
            return Some(ExitReason::StopLossFixed);
        }

        None
    }

    /// First profit-taking at the configured threshold, checked every tick
    /// like the stop triggers: an Active position whose unrealized return
    /// reaches the partial-tp rate sells the configured fraction without
    /// waiting for a vote.
    async fn partial_take_profit(
        &self,
        credentials: &ExchangeCredentials,
        position: &mut Position,
        current_price: Decimal,
    ) -> Result<Option<LifecycleEvent>, ExecutionError> {
        if position.status != PositionStatus::Active || position.exit_phase != 0 {
            return Ok(None);
        }
        let threshold =
            Decimal::from_f64(self.config.partial_take_profit_rate).unwrap_or_default();
        if position.unrealized_return(current_price) < threshold {
            return Ok(None);
        }

        // Tiny-profit round trips are suppressed.
        if !self
            .execution
            .config()
            .clears_min_profit(position.avg_entry_price, current_price)
        {
            return Ok(Some(LifecycleEvent::ExitSuppressed(
                "below minimum net profit".to_string(),
            )));
        }

        let volume = position.total_quantity
            * Decimal::from_f64(self.config.partial_exit_ratio).unwrap_or_default();
        let strategy = position.strategy.clone();
        let outcome = self
            .execution
            .execute(
                credentials,
                position,
                TradeCommand::PartialExit { volume },
                current_price,
                &strategy,
                position.target_price,
            )
            .await?;
        Ok(Some(match outcome {
            ExecutionOutcome::Filled(_) | ExecutionOutcome::Partial(_) => {
                info!(
                    market = position.market.as_str(),
                    price = %current_price,
                    "partial take-profit filled"
                );
                LifecycleEvent::PartialExit
            }
            ExecutionOutcome::PendingPrior => LifecycleEvent::OrderPending,
            ExecutionOutcome::Failed(msg) => LifecycleEvent::ExitSuppressed(msg),
        }))
    }

    #[allow(clippy::too_many_arguments)]
    async fn open_position(
        &self,
        user: &TradingUser,
        credentials: &ExchangeCredentials,
        market: &str,
        decision: &Decision,
        existing: Option<Position>,
        current_price: Decimal,
        candles: &[Candle],
        krw_balance: Decimal,
        unit: u32,
    ) -> Result<LifecycleEvent, ExecutionError> {
        let base_funds = self.risk.position_size(krw_balance, decision.signal_strength);
        let leg_funds = (base_funds
            * Decimal::from_f64(self.config.entry_ratio1).unwrap_or_default())
        .round_dp(0);

        let gate = self
            .risk
            .assess_entry(
                user,
                market,
                decision.signal_strength,
                leg_funds,
                krw_balance,
                unit,
                0.0,
            )
            .await
            .map_err(ExecutionError::from)?;
        if let GateDecision::Rejected(violation) = gate {
            info!(market, %violation, "entry rejected by risk gate");
            return Ok(LifecycleEvent::EntryRejected(violation.to_string()));
        }

        let strategy = decision
            .backers
            .first()
            .cloned()
            .unwrap_or_else(|| "COMBINED".to_string());
        let mut position = existing.unwrap_or_else(|| {
            Position::new_pending(
                user.id,
                market,
                &strategy,
                decision.signal_strength,
                self.clock.now(),
            )
        });
        position.target_price = decision.target_price.or_else(|| {
            indicators::atr(candles, self.config.atr_period)
                .ok()
                .and_then(|atr| {
                    Decimal::from_f64(atr * self.config.take_profit_atr_multiplier)
                })
                .map(|d| current_price + d)
        });
        position.stop_loss_price = Some(self.clamp_stop(
            decision.stop_loss_price,
            current_price,
            candles,
        ));

        let outcome = self
            .execution
            .execute(
                credentials,
                &mut position,
                TradeCommand::EnterLeg {
                    phase: 1,
                    funds: leg_funds,
                },
                current_price,
                &strategy,
                decision.target_price,
            )
            .await?;

        Ok(match outcome {
            ExecutionOutcome::Filled(_) | ExecutionOutcome::Partial(_) => {
                info!(market, funds = %leg_funds, "entered leg 1");
                LifecycleEvent::EnteredLeg(1)
            }
            ExecutionOutcome::PendingPrior => LifecycleEvent::OrderPending,
            ExecutionOutcome::Failed(msg) => LifecycleEvent::EntryRejected(msg),
        })
    }

    /// Legs 2 and 3 on configured drawdowns from the first leg. Later legs
    /// skip the concurrency/cooldown gates; they only need funds coverage.
    async fn advance_entry(
        &self,
        credentials: &ExchangeCredentials,
        position: &mut Position,
        current_price: Decimal,
        krw_balance: Decimal,
    ) -> Result<Option<LifecycleEvent>, ExecutionError> {
        let first = match position.first_leg_price() {
            Some(price) if !price.is_zero() => price,
            _ => return Ok(None),
        };
        let drawdown = ((first - current_price) / first).to_f64().unwrap_or(0.0);

        let (next_phase, threshold, ratio) = match position.entry_phase {
            1 => (2, self.config.entry2_drop_threshold, self.config.entry_ratio2),
            2 => (3, self.config.entry3_drop_threshold, self.config.entry_ratio3),
            _ => return Ok(None),
        };
        if drawdown < threshold {
            return Ok(None);
        }

        let leg1_invested = position.entry_legs[0]
            .as_ref()
            .map(|l| l.price * l.quantity)
            .unwrap_or(Decimal::ZERO);
        let base = leg1_invested / Decimal::from_f64(self.config.entry_ratio1).unwrap_or(Decimal::ONE);
        let funds = (base * Decimal::from_f64(ratio).unwrap_or_default()).round_dp(0);

        let min_order = self.risk.config().min_order_amount;
        if funds < min_order || krw_balance < funds {
            return Ok(Some(LifecycleEvent::EntryRejected(format!(
                "leg {next_phase} funds {funds} unavailable"
            ))));
        }

        let strategy = position.strategy.clone();
        let outcome = self
            .execution
            .execute(
                credentials,
                position,
                TradeCommand::EnterLeg {
                    phase: next_phase,
                    funds,
                },
                current_price,
                &strategy,
                position.target_price,
            )
            .await?;

        Ok(match outcome {
            ExecutionOutcome::Filled(_) | ExecutionOutcome::Partial(_) => {
                info!(
                    market = position.market.as_str(),
                    phase = next_phase,
                    "scale-in leg filled"
                );
                Some(LifecycleEvent::EnteredLeg(next_phase))
            }
            ExecutionOutcome::PendingPrior => Some(LifecycleEvent::OrderPending),
            ExecutionOutcome::Failed(msg) => Some(LifecycleEvent::EntryRejected(msg)),
        })
    }

    /// Entering -> Active when no further leg is queued: all three legs are
    /// in, or price has recovered above the first leg so dip legs no longer
    /// apply.
    async fn maybe_activate(
        &self,
        position: &mut Position,
        price: Decimal,
    ) -> Result<(), ExecutionError> {
        if position.status != PositionStatus::Entering {
            return Ok(());
        }
        let recovered = position
            .first_leg_price()
            .map(|first| price >= first)
            .unwrap_or(false);
        if position.entry_phase == 3 || recovered {
            position.mark_active(self.clock.now())?;
            self.positions.put(position).await?;
        }
        Ok(())
    }

    async fn apply_sell(
        &self,
        credentials: &ExchangeCredentials,
        position: &mut Position,
        decision: &Decision,
        current_price: Decimal,
    ) -> Result<Option<LifecycleEvent>, ExecutionError> {
        let reason = decision.exit_reason.unwrap_or(ExitReason::SignalInvalid);

        // Entering positions activate on an exit signal so the sell can apply.
        if position.status == PositionStatus::Entering {
            position.mark_active(self.clock.now())?;
            self.positions.put(position).await?;
        }

        // A take-profit sell goes through the same threshold check the
        // autonomous pass runs each tick; anything it would do has either
        // been done already (exit phase 1) or sits below the threshold. It
        // never force-closes the remainder.
        if reason == ExitReason::TakeProfit {
            return self
                .partial_take_profit(credentials, position, current_price)
                .await;
        }

        let strategy = position.strategy.clone();
        let outcome = self
            .execution
            .execute(
                credentials,
                position,
                TradeCommand::FinalExit {
                    volume: position.remaining_quantity(),
                    reason,
                },
                current_price,
                &strategy,
                decision.target_price,
            )
            .await?;
        Ok(Some(match outcome {
            ExecutionOutcome::Filled(_) | ExecutionOutcome::Partial(_) => {
                info!(market = position.market.as_str(), ?reason, "final exit filled");
                LifecycleEvent::FinalExit(reason)
            }
            ExecutionOutcome::PendingPrior => LifecycleEvent::OrderPending,
            ExecutionOutcome::Failed(msg) => LifecycleEvent::ExitSuppressed(msg),
        }))
    }

    /// Stop price from the strategy hint, clamped into the configured band
    /// below the entry price.
    fn clamp_stop(
        &self,
        hint: Option<Decimal>,
        price: Decimal,
        candles: &[Candle],
    ) -> Decimal {
        let widest =
            price * (Decimal::ONE - Decimal::from_f64(self.config.max_stop_loss_rate).unwrap_or_default());
        let tightest =
            price * (Decimal::ONE - Decimal::from_f64(self.config.min_stop_loss_rate).unwrap_or_default());
        let atr_stop = indicators::atr(candles, self.config.atr_period)
            .ok()
            .and_then(|atr| Decimal::from_f64(atr * self.config.stop_loss_atr_multiplier))
            .map(|d| price - d);
        let candidate = hint.or(atr_stop).unwrap_or(widest);
        candidate.clamp(widest, tightest)
    }

    fn hold_candles(&self, position: &Position, unit: u32) -> u32 {
        position
            .time_of_first_leg()
            .map(|start| {
                let minutes = (self.clock.now() - start).num_minutes().max(0) as u32;
                minutes / unit.max(1)
            })
            .unwrap_or(0)
    }
}

fn decision_strategy(decision: &Decision, position: &Position) -> String {
    decision
        .backers
        .first()
        .cloned()
        .unwrap_or_else(|| position.strategy.clone())
}
