//! Back-to-back executions for the same (user, market) leg must not place a
//! second order while the first is unresolved.

use autocoin::application::execution::{
    ExecutionConfig, ExecutionOutcome, ExecutionService, TradeCommand,
};
use autocoin::domain::ports::{Clock, ExchangeCredentials, SystemClock, TradeJournal};
use autocoin::domain::position::Position;
use autocoin::infrastructure::memory::{
    InMemoryPositionStore, InMemoryTradeJournal, MockOrderGateway,
};
use chrono::Utc;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

fn credentials() -> ExchangeCredentials {
    ExchangeCredentials {
        access_key: "ak".to_string(),
        secret_key: "sk".to_string(),
    }
}

fn fast_config() -> ExecutionConfig {
    ExecutionConfig {
        confirm_timeout: Duration::from_millis(150),
        confirm_poll_interval: Duration::from_millis(30),
        ..ExecutionConfig::default()
    }
}

#[tokio::test]
async fn unconfirmed_order_blocks_duplicate_submission() {
    let gateway = Arc::new(MockOrderGateway::never_confirming());
    let journal = Arc::new(InMemoryTradeJournal::new());
    let positions = Arc::new(InMemoryPositionStore::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let service = ExecutionService::new(
        gateway.clone(),
        journal.clone(),
        positions.clone(),
        clock,
        fast_config(),
    );

    let mut position = Position::new_pending(1, "KRW-BTC", "RSI", 80.0, Utc::now());
    let command = TradeCommand::EnterLeg {
        phase: 1,
        funds: dec!(100000),
    };

    // First call submits, then times out waiting for confirmation.
    let outcome = service
        .execute(&credentials(), &mut position, command.clone(), dec!(100), "RSI", None)
        .await
        .unwrap();
    assert!(matches!(outcome, ExecutionOutcome::PendingPrior));
    assert_eq!(gateway.submissions(), 1);
    assert!(position.pending_order.is_some());
    assert!(position.pending_order.as_ref().unwrap().uuid.is_some());

    // Second call sees the pending token and never reaches the gateway.
    let outcome = service
        .execute(&credentials(), &mut position, command.clone(), dec!(100), "RSI", None)
        .await
        .unwrap();
    assert!(matches!(outcome, ExecutionOutcome::PendingPrior));
    assert_eq!(gateway.submissions(), 1, "no duplicate order was placed");

    // Nothing was journaled and the position never advanced.
    assert!(journal.latest(1, "KRW-BTC").await.unwrap().is_none());
    assert_eq!(position.entry_phase, 0);

    // The stored snapshot carries the token for the next tick too.
    let stored = autocoin::domain::ports::PositionStore::get(positions.as_ref(), 1, "KRW-BTC")
        .await
        .unwrap()
        .unwrap();
    assert!(stored.pending_order.is_some());
}

#[tokio::test]
async fn identical_commands_reuse_the_idempotency_token() {
    // Same (user, market, phase, minute) must produce the same identifier, so
    // gateway-side dedup can suppress the retry after a crash.
    let gateway = Arc::new(MockOrderGateway::never_confirming());
    let positions = Arc::new(InMemoryPositionStore::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let service = ExecutionService::new(
        gateway.clone(),
        Arc::new(InMemoryTradeJournal::new()),
        positions.clone(),
        clock,
        fast_config(),
    );

    let mut first = Position::new_pending(1, "KRW-BTC", "RSI", 80.0, Utc::now());
    service
        .execute(
            &credentials(),
            &mut first,
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
    let token = first.pending_order.unwrap().token;
    assert!(token.starts_with("1:KRW-BTC:e1:"));
}
