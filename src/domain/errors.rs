use rust_decimal::Decimal;
use thiserror::Error;

/// Errors from the exchange boundary.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("exchange request failed: {reason}")]
    Transient { reason: String },

    #[error("rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("exchange contract violation for {market}: {reason}")]
    ContractViolation { market: String, reason: String },

    #[error("order {uuid} not found")]
    OrderNotFound { uuid: String },
}

/// Pre-trade gate rejections. No state is mutated when one of these fires.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RiskViolation {
    #[error("max concurrent positions reached: {open} >= {limit}")]
    MaxPositions { open: usize, limit: usize },

    #[error("daily loss limit breached: lost {lost} KRW >= limit {limit} KRW")]
    DailyLossLimit { lost: Decimal, limit: Decimal },

    #[error("signal strength {strength:.1} below floor {floor:.1}")]
    SignalTooWeak { strength: f64, floor: f64 },

    #[error("order funds {funds} KRW below minimum {min} KRW")]
    BelowMinOrder { funds: Decimal, min: Decimal },

    #[error("insufficient balance: need {need} KRW, available {available} KRW")]
    InsufficientBalance { need: Decimal, available: Decimal },

    #[error("cooldown after loss on {market}: {remaining_candles} candle(s) remaining")]
    LossCooldown {
        market: String,
        remaining_candles: u32,
    },

    #[error("estimated slippage {estimated_pct:.3}% exceeds max {max_pct:.3}%")]
    SlippageTooHigh { estimated_pct: f64, max_pct: f64 },
}

/// Failures inside the execution service.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("order confirmation timed out for {market} (uuid {uuid})")]
    ConfirmationTimeout { market: String, uuid: String },

    #[error("order rejected by gateway: {reason}")]
    Rejected { reason: String },

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}

/// A stored exchange credential that cannot be used.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("stored credential for user {user_id} failed to decrypt")]
    Unusable { user_id: i64 },

    #[error("malformed ciphertext: {reason}")]
    Malformed { reason: String },
}

/// Persistence-layer failures. A failed store call aborts the current tick;
/// the order effect is never acknowledged to the position.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {reason}")]
    Database { reason: String },

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("conflicting write for {entity} {key}")]
    Conflict { entity: &'static str, key: String },
}

/// Position state machine misuse. Fail-stop for the current tick.
#[derive(Debug, Error, PartialEq)]
pub enum InvariantViolation {
    #[error("invalid transition for {market}: {from} -> {to}")]
    BadTransition {
        market: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("closed position for {market} must not be mutated")]
    ClosedPositionWrite { market: String },

    #[error("entry phase {phase} out of range for {market}")]
    BadEntryPhase { market: String, phase: u8 },

    #[error("{what} must be positive, got {value}")]
    NonPositive { what: &'static str, value: Decimal },
}
