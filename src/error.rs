use rust_decimal::Decimal;
use thiserror::Error;
use ulid::Ulid;

use crate::model::{Ms, VehicleClass};

#[derive(Debug, Error)]
pub enum ParkError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("ticket {0} is already closed")]
    AlreadyClosed(Ulid),
    #[error("capacity {capacity} for class {class} exceeded: all slots occupied")]
    CapacityExceeded { class: VehicleClass, capacity: u32 },
    #[error("invalid time range: end {end} is before start {start}")]
    InvalidTimeRange { start: Ms, end: Ms },
    #[error("business rule violated: {0}")]
    BusinessRule(#[from] BusinessRule),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("counter store unavailable: {0}")]
    CounterUnavailable(#[from] CounterError),
    #[error("record store error: {0}")]
    Store(#[from] StoreError),
}

/// Recoverable conditions the caller is expected to handle, never masked as a generic failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusinessRule {
    #[error("nothing to settle: no unsettled grants in period")]
    NothingToSettle,
    #[error("amount must not be negative")]
    NegativeAmount,
    #[error("amount must be greater than zero")]
    NonPositiveAmount,
    #[error("percentage {0} outside 0..=100")]
    PercentageOutOfRange(Decimal),
    #[error("business {0} has no affiliation")]
    UnknownAffiliation(Ulid),
    #[error("grant {0} was already settled")]
    GrantAlreadySettled(Ulid),
    #[error("ticket {0} is billed against a subscription; free hours do not apply")]
    SubscriptionTicket(Ulid),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CounterError {
    #[error("{0}")]
    Unavailable(String),
    #[error("call timed out")]
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("WAL error: {0}")]
    Wal(String),
    #[error("unknown grant: {0}")]
    UnknownGrant(Ulid),
    #[error("grant {0} already settled")]
    AlreadySettled(Ulid),
}
