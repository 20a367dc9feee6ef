//! Duration and money primitives.
//!
//! All rounding in the crate happens here. Higher layers compose these
//! functions and never round on their own.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

use crate::error::{BusinessRule, ParkError};
use crate::model::{MINUTE_MS, Ms};

const MONEY_DP: u32 = 2;
const INTERMEDIATE_DP: u32 = 4;

/// Billable hours between two instants: whole elapsed minutes / 60, truncated to 2 decimals.
/// Truncation never charges for time that was not used.
pub fn duration_hours(start: Ms, end: Ms) -> Result<Decimal, ParkError> {
    if end < start {
        return Err(ParkError::InvalidTimeRange { start, end });
    }
    let minutes = (end - start) / MINUTE_MS;
    let hours = Decimal::from(minutes) / dec!(60);
    Ok(hours.round_dp_with_strategy(MONEY_DP, RoundingStrategy::ToZero))
}

/// Round to cents, half-up.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_DP, RoundingStrategy::MidpointAwayFromZero)
}

fn round_intermediate(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(INTERMEDIATE_DP, RoundingStrategy::MidpointAwayFromZero)
}

pub fn cost(hours: Decimal, rate: Decimal) -> Result<Decimal, ParkError> {
    if hours < Decimal::ZERO || rate < Decimal::ZERO {
        return Err(BusinessRule::NegativeAmount.into());
    }
    Ok(round_money(hours * rate))
}

/// `part` as a percentage of `total`; zero when `total` is zero.
pub fn percentage_of(part: Decimal, total: Decimal) -> Decimal {
    if total.is_zero() {
        return Decimal::ZERO;
    }
    round_money(part / total * dec!(100))
}

fn validate_percentage(pct: Decimal) -> Result<(), ParkError> {
    if pct < Decimal::ZERO || pct > dec!(100) {
        return Err(BusinessRule::PercentageOutOfRange(pct).into());
    }
    Ok(())
}

fn portion(amount: Decimal, pct: Decimal) -> Decimal {
    round_intermediate(amount * round_intermediate(pct / dec!(100)))
}

/// Price after taking `pct` percent off. Discounting a non-positive amount is a caller bug.
pub fn apply_discount(amount: Decimal, pct: Decimal) -> Result<Decimal, ParkError> {
    if amount <= Decimal::ZERO {
        return Err(BusinessRule::NonPositiveAmount.into());
    }
    decrease_by(amount, pct)
}

pub fn increase_by(amount: Decimal, pct: Decimal) -> Result<Decimal, ParkError> {
    validate_percentage(pct)?;
    if amount < Decimal::ZERO {
        return Err(BusinessRule::NegativeAmount.into());
    }
    Ok(round_money(amount + portion(amount, pct)))
}

pub fn decrease_by(amount: Decimal, pct: Decimal) -> Result<Decimal, ParkError> {
    validate_percentage(pct)?;
    if amount < Decimal::ZERO {
        return Err(BusinessRule::NegativeAmount.into());
    }
    Ok(round_money(amount - portion(amount, pct)))
}
