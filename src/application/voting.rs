//! Combines per-strategy analyses for one market into a single decision.
//!
//! DEFAULT mode is strict majority voting over the consulted set; the
//! threshold counts the strategies actually consulted (the user's enabled
//! set), not everything registered. SCALED_TRADING mode delegates to the
//! designated scaled strategy alone. Deterministic for identical inputs.

use crate::application::strategies::Analysis;
use crate::domain::types::{ExitReason, Signal};
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteMode {
    Default,
    ScaledTrading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

/// Outcome of the voting layer, with the audit trail the journal records.
#[derive(Debug, Clone)]
pub struct Decision {
    pub action: Action,
    /// Share of agreeing strategies, 0..100.
    pub signal_strength: f64,
    /// Names of the strategies that backed the winning side.
    pub backers: Vec<String>,
    pub target_price: Option<Decimal>,
    pub stop_loss_price: Option<Decimal>,
    pub exit_reason: Option<ExitReason>,
    pub reason: String,
}

impl Decision {
    fn hold(strength: f64, reason: impl Into<String>) -> Self {
        Self {
            action: Action::Hold,
            signal_strength: strength,
            backers: Vec::new(),
            target_price: None,
            stop_loss_price: None,
            exit_reason: None,
            reason: reason.into(),
        }
    }
}

/// Majority threshold: floor(N/2) + 1.
pub fn majority_threshold(consulted: usize) -> usize {
    consulted / 2 + 1
}

/// DEFAULT-mode vote over named analyses.
pub fn decide(outcomes: &[(String, Analysis)], has_open_position: bool) -> Decision {
    let total = outcomes.len();
    if total == 0 {
        return Decision::hold(0.0, "no strategies consulted");
    }

    let buyers: Vec<&(String, Analysis)> = outcomes
        .iter()
        .filter(|(_, a)| a.signal == Signal::Buy)
        .collect();
    let sellers: Vec<&(String, Analysis)> = outcomes
        .iter()
        .filter(|(_, a)| a.signal == Signal::Sell)
        .collect();

    let threshold = majority_threshold(total);
    let strength = buyers.len().max(sellers.len()) as f64 / total as f64 * 100.0;

    // Exit votes take precedence over entry votes on a tie.
    if sellers.len() >= threshold && has_open_position {
        return Decision {
            action: Action::Sell,
            signal_strength: strength,
            backers: sellers.iter().map(|(name, _)| name.clone()).collect(),
            target_price: None,
            stop_loss_price: first_hint(&sellers, |a| a.stop_loss_price),
            exit_reason: sellers
                .iter()
                .find_map(|(_, a)| a.exit_reason)
                .or(Some(ExitReason::SignalInvalid)),
            reason: format!("{}/{total} strategies voted SELL", sellers.len()),
        };
    }

    if buyers.len() >= threshold && !has_open_position {
        return Decision {
            action: Action::Buy,
            signal_strength: strength,
            backers: buyers.iter().map(|(name, _)| name.clone()).collect(),
            target_price: first_hint(&buyers, |a| a.target_price),
            stop_loss_price: first_hint(&buyers, |a| a.stop_loss_price),
            exit_reason: None,
            reason: format!("{}/{total} strategies voted BUY", buyers.len()),
        };
    }

    Decision::hold(
        strength,
        format!(
            "no majority ({} buy, {} sell of {total}, need {threshold})",
            buyers.len(),
            sellers.len()
        ),
    )
}

/// SCALED_TRADING mode: the scaled strategy's analysis carries the decision
/// on its own.
pub fn decide_scaled(name: &str, analysis: &Analysis) -> Decision {
    let action = match analysis.signal {
        Signal::Buy => Action::Buy,
        Signal::Sell => Action::Sell,
        Signal::Hold => Action::Hold,
    };
    Decision {
        action,
        signal_strength: if action == Action::Hold { 0.0 } else { 100.0 },
        backers: vec![name.to_string()],
        target_price: analysis.target_price,
        stop_loss_price: analysis.stop_loss_price,
        exit_reason: analysis.exit_reason,
        reason: analysis.reason.clone(),
    }
}

fn first_hint<F>(votes: &[&(String, Analysis)], pick: F) -> Option<Decimal>
where
    F: Fn(&Analysis) -> Option<Decimal>,
{
    votes.iter().find_map(|(_, a)| pick(a))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn outcomes(buys: usize, sells: usize, holds: usize) -> Vec<(String, Analysis)> {
        let mut list = Vec::new();
        for i in 0..buys {
            list.push((format!("buy{i}"), Analysis::buy("up")));
        }
        for i in 0..sells {
            list.push((
                format!("sell{i}"),
                Analysis::sell("down", ExitReason::SignalInvalid),
            ));
        }
        for i in 0..holds {
            list.push((format!("hold{i}"), Analysis::hold("flat")));
        }
        list
    }

    #[test]
    fn test_majority_buy() {
        let decision = decide(&outcomes(6, 1, 3), false);
        assert_eq!(decision.action, Action::Buy);
        assert_eq!(decision.signal_strength, 60.0);
        assert_eq!(decision.backers.len(), 6);
    }

    #[test]
    fn test_five_of_ten_abstains() {
        // threshold is floor(10/2)+1 = 6
        let decision = decide(&outcomes(5, 3, 2), false);
        assert_eq!(decision.action, Action::Hold);
        assert_eq!(decision.signal_strength, 50.0);
    }

    #[test]
    fn test_buy_suppressed_when_position_open() {
        let decision = decide(&outcomes(6, 1, 3), true);
        assert_eq!(decision.action, Action::Hold);
    }

    #[test]
    fn test_sell_requires_open_position() {
        let decision = decide(&outcomes(1, 6, 3), false);
        assert_eq!(decision.action, Action::Hold);
        let decision = decide(&outcomes(1, 6, 3), true);
        assert_eq!(decision.action, Action::Sell);
        assert_eq!(decision.exit_reason, Some(ExitReason::SignalInvalid));
    }

    #[test]
    fn test_threshold_uses_consulted_count() {
        // 2 of 3 consulted is a majority even though ten are registered.
        let decision = decide(&outcomes(2, 0, 1), false);
        assert_eq!(decision.action, Action::Buy);
    }

    #[test]
    fn test_buy_hints_propagate() {
        let mut list = outcomes(1, 0, 1);
        list.push((
            "hinted".to_string(),
            Analysis::buy("up").with_target(dec!(110)).with_stop(dec!(95)),
        ));
        let decision = decide(&list, false);
        assert_eq!(decision.action, Action::Buy);
        assert_eq!(decision.target_price, Some(dec!(110)));
        assert_eq!(decision.stop_loss_price, Some(dec!(95)));
    }

    #[test]
    fn test_scaled_mode_delegates() {
        let analysis = Analysis::sell("trail", ExitReason::TrailingStop);
        let decision = decide_scaled("ScaledTrading", &analysis);
        assert_eq!(decision.action, Action::Sell);
        assert_eq!(decision.exit_reason, Some(ExitReason::TrailingStop));
        assert_eq!(decision.backers, vec!["ScaledTrading".to_string()]);
    }

    #[test]
    fn test_deterministic() {
        let list = outcomes(4, 3, 3);
        let a = decide(&list, true);
        let b = decide(&list, true);
        assert_eq!(a.action, b.action);
        assert_eq!(a.signal_strength, b.signal_strength);
        assert_eq!(a.backers, b.backers);
    }
}
