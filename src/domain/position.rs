//! Scaled-position state machine.
//!
//! One `Position` exists per (user, market). It moves through
//! Pending -> Entering -> Active -> Exiting -> Closed, accumulating up to
//! three entry legs, one partial exit and one final exit. All mutation goes
//! through the methods here so the transition guards and the accounting
//! identity (entry funds - exit proceeds == realized pnl + fees) hold by
//! construction. Callers serialize access per (user, market); this type does
//! no locking of its own.

use crate::domain::errors::InvariantViolation;
use crate::domain::types::ExitReason;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Pending,
    Entering,
    Active,
    Exiting,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Pending => "PENDING",
            PositionStatus::Entering => "ENTERING",
            PositionStatus::Active => "ACTIVE",
            PositionStatus::Exiting => "EXITING",
            PositionStatus::Closed => "CLOSED",
        }
    }
}

/// One (price, quantity, time) fill that is part of a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leg {
    pub price: Decimal,
    pub quantity: Decimal,
    pub time: DateTime<Utc>,
}

/// An order submitted but not yet confirmed. Its token makes retries after a
/// confirmation timeout idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOrder {
    pub token: String,
    pub uuid: Option<Uuid>,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub user_id: i64,
    pub market: String,
    pub status: PositionStatus,
    /// 0 before the first leg, then 1..3.
    pub entry_phase: u8,
    /// 0 before the partial exit, 1 after it, 2 once fully exited.
    pub exit_phase: u8,
    pub entry_legs: [Option<Leg>; 3],
    pub partial_exit: Option<Leg>,
    pub final_exit: Option<Leg>,
    pub total_quantity: Decimal,
    pub total_invested: Decimal,
    pub avg_entry_price: Decimal,
    pub stop_loss_price: Option<Decimal>,
    pub target_price: Option<Decimal>,
    pub trailing_high_price: Option<Decimal>,
    pub trailing_stop_price: Option<Decimal>,
    pub realized_pnl: Decimal,
    pub total_fees: Decimal,
    pub total_slippage: Decimal,
    pub strategy: String,
    pub signal_strength: f64,
    pub exit_reason: Option<ExitReason>,
    pub pending_order: Option<PendingOrder>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn new_pending(
        user_id: i64,
        market: &str,
        strategy: &str,
        signal_strength: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            market: market.to_string(),
            status: PositionStatus::Pending,
            entry_phase: 0,
            exit_phase: 0,
            entry_legs: [None, None, None],
            partial_exit: None,
            final_exit: None,
            total_quantity: Decimal::ZERO,
            total_invested: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
            stop_loss_price: None,
            target_price: None,
            trailing_high_price: None,
            trailing_stop_price: None,
            realized_pnl: Decimal::ZERO,
            total_fees: Decimal::ZERO,
            total_slippage: Decimal::ZERO,
            strategy: strategy.to_string(),
            signal_strength,
            exit_reason: None,
            pending_order: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_open(&self) -> bool {
        !matches!(self.status, PositionStatus::Pending | PositionStatus::Closed)
    }

    pub fn remaining_quantity(&self) -> Decimal {
        let sold = self
            .partial_exit
            .as_ref()
            .map(|leg| leg.quantity)
            .unwrap_or(Decimal::ZERO)
            + self
                .final_exit
                .as_ref()
                .map(|leg| leg.quantity)
                .unwrap_or(Decimal::ZERO);
        self.total_quantity - sold
    }

    /// Unrealized return of the remaining quantity vs the average entry, as a
    /// fraction (0.025 = +2.5%).
    pub fn unrealized_return(&self, price: Decimal) -> Decimal {
        if self.avg_entry_price.is_zero() {
            return Decimal::ZERO;
        }
        (price - self.avg_entry_price) / self.avg_entry_price
    }

    /// Price of the first entry leg, the reference for scale-in drawdowns.
    pub fn first_leg_price(&self) -> Option<Decimal> {
        self.entry_legs[0].as_ref().map(|leg| leg.price)
    }

    pub fn time_of_first_leg(&self) -> Option<DateTime<Utc>> {
        self.entry_legs[0].as_ref().map(|leg| leg.time)
    }

    fn guard_not_closed(&self) -> Result<(), InvariantViolation> {
        if self.status == PositionStatus::Closed {
            return Err(InvariantViolation::ClosedPositionWrite {
                market: self.market.clone(),
            });
        }
        Ok(())
    }

    /// Record a filled entry leg. Legs fill strictly in order 1 -> 2 -> 3;
    /// leg 1 moves Pending to Entering.
    pub fn apply_entry_fill(
        &mut self,
        phase: u8,
        price: Decimal,
        quantity: Decimal,
        fee: Decimal,
        now: DateTime<Utc>,
    ) -> Result<(), InvariantViolation> {
        self.guard_not_closed()?;
        if !(1..=3).contains(&phase) || phase != self.entry_phase + 1 {
            return Err(InvariantViolation::BadEntryPhase {
                market: self.market.clone(),
                phase,
            });
        }
        if !matches!(
            self.status,
            PositionStatus::Pending | PositionStatus::Entering
        ) {
            return Err(InvariantViolation::BadTransition {
                market: self.market.clone(),
                from: self.status.as_str(),
                to: "ENTERING",
            });
        }
        if quantity <= Decimal::ZERO {
            return Err(InvariantViolation::NonPositive {
                what: "entry quantity",
                value: quantity,
            });
        }
        if price <= Decimal::ZERO {
            return Err(InvariantViolation::NonPositive {
                what: "entry price",
                value: price,
            });
        }

        self.entry_legs[(phase - 1) as usize] = Some(Leg {
            price,
            quantity,
            time: now,
        });
        self.entry_phase = phase;
        self.status = PositionStatus::Entering;
        self.total_quantity += quantity;
        self.total_invested += price * quantity;
        self.total_fees += fee;
        self.realized_pnl -= fee;
        self.avg_entry_price = self.total_invested / self.total_quantity;
        self.pending_order = None;
        self.updated_at = now;
        Ok(())
    }

    /// Entering -> Active once no further legs are queued.
    pub fn mark_active(&mut self, now: DateTime<Utc>) -> Result<(), InvariantViolation> {
        self.guard_not_closed()?;
        if self.status != PositionStatus::Entering || self.entry_phase == 0 {
            return Err(InvariantViolation::BadTransition {
                market: self.market.clone(),
                from: self.status.as_str(),
                to: "ACTIVE",
            });
        }
        self.status = PositionStatus::Active;
        self.updated_at = now;
        Ok(())
    }

    /// First profit-taking: sell part of the holding, Active -> Exiting.
    pub fn apply_partial_exit(
        &mut self,
        price: Decimal,
        quantity: Decimal,
        fee: Decimal,
        now: DateTime<Utc>,
    ) -> Result<(), InvariantViolation> {
        self.guard_not_closed()?;
        if self.status != PositionStatus::Active || self.exit_phase != 0 {
            return Err(InvariantViolation::BadTransition {
                market: self.market.clone(),
                from: self.status.as_str(),
                to: "EXITING",
            });
        }
        if quantity <= Decimal::ZERO || quantity >= self.total_quantity {
            return Err(InvariantViolation::NonPositive {
                what: "partial exit quantity",
                value: quantity,
            });
        }

        self.partial_exit = Some(Leg {
            price,
            quantity,
            time: now,
        });
        self.exit_phase = 1;
        self.status = PositionStatus::Exiting;
        self.realized_pnl += (price - self.avg_entry_price) * quantity - fee;
        self.total_fees += fee;
        self.pending_order = None;
        self.updated_at = now;
        Ok(())
    }

    /// Sell the remainder and close. The quantity must match what is left.
    pub fn apply_final_exit(
        &mut self,
        price: Decimal,
        quantity: Decimal,
        fee: Decimal,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> Result<(), InvariantViolation> {
        self.guard_not_closed()?;
        if !matches!(
            self.status,
            PositionStatus::Active | PositionStatus::Exiting
        ) {
            return Err(InvariantViolation::BadTransition {
                market: self.market.clone(),
                from: self.status.as_str(),
                to: "CLOSED",
            });
        }
        if quantity != self.remaining_quantity() || quantity <= Decimal::ZERO {
            return Err(InvariantViolation::NonPositive {
                what: "final exit quantity",
                value: quantity,
            });
        }

        self.final_exit = Some(Leg {
            price,
            quantity,
            time: now,
        });
        self.exit_phase = 2;
        self.status = PositionStatus::Closed;
        self.realized_pnl += (price - self.avg_entry_price) * quantity - fee;
        self.total_fees += fee;
        self.exit_reason = Some(reason);
        self.pending_order = None;
        self.updated_at = now;
        Ok(())
    }

    /// Ratchet the trailing stop. The observed high never decreases and the
    /// stop never loosens against the holder.
    pub fn ratchet_trailing(
        &mut self,
        price: Decimal,
        stop_distance: Decimal,
        now: DateTime<Utc>,
    ) -> Result<(), InvariantViolation> {
        self.guard_not_closed()?;
        if !matches!(
            self.status,
            PositionStatus::Active | PositionStatus::Exiting
        ) {
            return Err(InvariantViolation::BadTransition {
                market: self.market.clone(),
                from: self.status.as_str(),
                to: self.status.as_str(),
            });
        }
        let high = match self.trailing_high_price {
            Some(existing) if existing >= price => existing,
            _ => price,
        };
        self.trailing_high_price = Some(high);
        let candidate = high - stop_distance;
        let stop = match self.trailing_stop_price {
            Some(existing) if existing >= candidate => existing,
            _ => candidate,
        };
        self.trailing_stop_price = Some(stop);
        self.updated_at = now;
        Ok(())
    }

    /// Raise the fixed stop. A stop may only move toward the current price.
    pub fn tighten_stop(&mut self, new_stop: Decimal, now: DateTime<Utc>) {
        match self.stop_loss_price {
            Some(existing) if existing >= new_stop => {}
            _ => {
                self.stop_loss_price = Some(new_stop);
                self.updated_at = now;
            }
        }
    }

    /// Structural invariants of the state machine (spec properties P1-P3).
    /// Used by tests and debug assertions.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let ok = match self.status {
            PositionStatus::Pending => self.entry_phase == 0 && self.total_quantity.is_zero(),
            PositionStatus::Entering => {
                (1..=3).contains(&self.entry_phase) && self.total_quantity > Decimal::ZERO
            }
            PositionStatus::Active => {
                (1..=3).contains(&self.entry_phase) && self.exit_phase == 0
            }
            PositionStatus::Exiting => {
                self.exit_phase == 1 && self.remaining_quantity() > Decimal::ZERO
            }
            PositionStatus::Closed => {
                self.remaining_quantity().is_zero() && self.exit_reason.is_some()
            }
        };
        if !ok {
            return Err(InvariantViolation::BadTransition {
                market: self.market.clone(),
                from: self.status.as_str(),
                to: self.status.as_str(),
            });
        }
        if self.status == PositionStatus::Entering || self.status == PositionStatus::Active {
            // avg entry must reconcile with invested/quantity within rounding
            let implied = self.total_invested / self.total_quantity;
            if (implied - self.avg_entry_price).abs() > Decimal::new(1, 6) {
                return Err(InvariantViolation::NonPositive {
                    what: "avg entry reconciliation",
                    value: implied - self.avg_entry_price,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::prelude::ToPrimitive;
    use rust_decimal_macros::dec;

    fn pos() -> Position {
        Position::new_pending(1, "KRW-BTC", "ScaledTrading", 75.0, Utc::now())
    }

    #[test]
    fn test_scaled_entry_averaging() {
        let now = Utc::now();
        let mut p = pos();
        // 30,000 KRW at 100, 30,000 at 98.5, 40,000 at 97.5
        p.apply_entry_fill(1, dec!(100), dec!(30000) / dec!(100), Decimal::ZERO, now)
            .unwrap();
        p.apply_entry_fill(2, dec!(98.5), dec!(30000) / dec!(98.5), Decimal::ZERO, now)
            .unwrap();
        p.apply_entry_fill(3, dec!(97.5), dec!(40000) / dec!(97.5), Decimal::ZERO, now)
            .unwrap();

        assert_eq!(p.entry_phase, 3);
        assert_eq!(p.status, PositionStatus::Entering);
        let avg = p.avg_entry_price.to_f64().unwrap();
        assert!((avg - 98.54).abs() < 0.01, "avg entry was {avg}");
        p.check_invariants().unwrap();
    }

    #[test]
    fn test_legs_fill_in_order() {
        let now = Utc::now();
        let mut p = pos();
        assert!(p.apply_entry_fill(2, dec!(100), dec!(1), Decimal::ZERO, now).is_err());
        p.apply_entry_fill(1, dec!(100), dec!(1), Decimal::ZERO, now).unwrap();
        assert!(p.apply_entry_fill(1, dec!(100), dec!(1), Decimal::ZERO, now).is_err());
        assert!(p.apply_entry_fill(3, dec!(100), dec!(1), Decimal::ZERO, now).is_err());
    }

    #[test]
    fn test_partial_then_final_exit() {
        let now = Utc::now();
        let mut p = pos();
        p.apply_entry_fill(1, dec!(100), dec!(1000), Decimal::ZERO, now).unwrap();
        p.mark_active(now).unwrap();

        p.apply_partial_exit(dec!(102.5), dec!(500), Decimal::ZERO, now).unwrap();
        assert_eq!(p.status, PositionStatus::Exiting);
        assert_eq!(p.exit_phase, 1);
        assert_eq!(p.remaining_quantity(), dec!(500));
        p.check_invariants().unwrap();

        p.apply_final_exit(dec!(101), dec!(500), Decimal::ZERO, ExitReason::TrailingStop, now)
            .unwrap();
        assert_eq!(p.status, PositionStatus::Closed);
        assert_eq!(p.remaining_quantity(), Decimal::ZERO);
        assert_eq!(p.exit_reason, Some(ExitReason::TrailingStop));
        // pnl: 500*(102.5-100) + 500*(101-100) = 1250 + 500
        assert_eq!(p.realized_pnl, dec!(1750));
        p.check_invariants().unwrap();
    }

    #[test]
    fn test_cash_conservation_with_fees() {
        let now = Utc::now();
        let mut p = pos();
        p.apply_entry_fill(1, dec!(100), dec!(300), dec!(15), now).unwrap();
        p.apply_entry_fill(2, dec!(98.5), dec!(300), dec!(15), now).unwrap();
        p.mark_active(now).unwrap();
        p.apply_partial_exit(dec!(103), dec!(300), dec!(15), now).unwrap();
        p.apply_final_exit(dec!(101), dec!(300), dec!(15), ExitReason::TakeProfit, now)
            .unwrap();

        // Signed cash flow: -invested + proceeds == realized_pnl (fees are
        // already inside realized_pnl), i.e. gross flow == pnl + fees.
        let invested = dec!(100) * dec!(300) + dec!(98.5) * dec!(300);
        let proceeds = dec!(103) * dec!(300) + dec!(101) * dec!(300);
        assert_eq!(proceeds - invested, p.realized_pnl + p.total_fees);
    }

    #[test]
    fn test_closed_is_immutable() {
        let now = Utc::now();
        let mut p = pos();
        p.apply_entry_fill(1, dec!(100), dec!(10), Decimal::ZERO, now).unwrap();
        p.mark_active(now).unwrap();
        p.apply_final_exit(dec!(99), dec!(10), Decimal::ZERO, ExitReason::StopLossFixed, now)
            .unwrap();

        assert!(matches!(
            p.apply_entry_fill(1, dec!(1), dec!(1), Decimal::ZERO, now),
            Err(InvariantViolation::ClosedPositionWrite { .. })
        ));
        assert!(p.apply_partial_exit(dec!(1), dec!(1), Decimal::ZERO, now).is_err());
        assert!(p.ratchet_trailing(dec!(1), dec!(1), now).is_err());
    }

    #[test]
    fn test_trailing_high_monotone() {
        let now = Utc::now();
        let mut p = pos();
        p.apply_entry_fill(1, dec!(100), dec!(10), Decimal::ZERO, now).unwrap();
        p.mark_active(now).unwrap();

        let distance = dec!(103) * dec!(0.015);
        p.ratchet_trailing(dec!(103), distance, now).unwrap();
        assert_eq!(p.trailing_high_price, Some(dec!(103)));
        let first_stop = p.trailing_stop_price.unwrap();

        // Lower price must not lower the high or the stop.
        p.ratchet_trailing(dec!(101), dec!(101) * dec!(0.015), now).unwrap();
        assert_eq!(p.trailing_high_price, Some(dec!(103)));
        assert_eq!(p.trailing_stop_price, Some(first_stop));

        p.ratchet_trailing(dec!(104), dec!(104) * dec!(0.015), now).unwrap();
        assert_eq!(p.trailing_high_price, Some(dec!(104)));
        assert!(p.trailing_stop_price.unwrap() > first_stop);
    }

    #[test]
    fn test_stop_only_tightens() {
        let now = Utc::now();
        let mut p = pos();
        p.tighten_stop(dec!(97), now);
        assert_eq!(p.stop_loss_price, Some(dec!(97)));
        p.tighten_stop(dec!(95), now);
        assert_eq!(p.stop_loss_price, Some(dec!(97)));
        p.tighten_stop(dec!(98), now);
        assert_eq!(p.stop_loss_price, Some(dec!(98)));
    }

    #[test]
    fn test_final_exit_requires_exact_remainder() {
        let now = Utc::now();
        let mut p = pos();
        p.apply_entry_fill(1, dec!(100), dec!(10), Decimal::ZERO, now).unwrap();
        p.mark_active(now).unwrap();
        assert!(p
            .apply_final_exit(dec!(100), dec!(9), Decimal::ZERO, ExitReason::Timeout, now)
            .is_err());
    }
}
