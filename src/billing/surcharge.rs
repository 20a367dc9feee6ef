use std::collections::HashMap;

use chrono::{DateTime, Months, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ParkError;
use crate::model::{HOUR_MS, Ms};

use super::charge::{Charge, ChargeCode};

/// Plate changes at least this many months after the previous one are surcharged...
const PLATE_CHANGE_WINDOW_START_MONTHS: u32 = 6;
/// ...until this many months have passed.
const PLATE_CHANGE_WINDOW_END_MONTHS: u32 = 12;
/// Rejected requests tolerated inside the lookback window before a surcharge applies.
const MAX_FREE_REJECTIONS: usize = 2;

/// One row of the administrative charge table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeRule {
    pub code: ChargeCode,
    pub amount: Decimal,
    pub active: bool,
    pub reason: String,
}

/// Administrative charge table keyed by reason code.
#[derive(Debug, Clone, Default)]
pub struct ChargeRules {
    rules: HashMap<ChargeCode, ChargeRule>,
}

impl ChargeRules {
    pub fn new(rules: impl IntoIterator<Item = ChargeRule>) -> Self {
        Self {
            rules: rules.into_iter().map(|r| (r.code, r)).collect(),
        }
    }

    pub fn get(&self, code: ChargeCode) -> Option<&ChargeRule> {
        self.rules.get(&code)
    }

    /// The configured charge for `code`; `Charge::None` when missing or inactive.
    pub fn charge_for(&self, code: ChargeCode) -> Result<Charge, ParkError> {
        match self.rules.get(&code) {
            Some(rule) if rule.active => Charge::new(rule.amount, rule.reason.clone(), code),
            _ => Ok(Charge::None),
        }
    }
}

/// An administrative plate-change request, with the history needed to price it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlateChangeRequest {
    pub requested_at: Ms,
    pub previous_change_at: Option<Ms>,
    /// When earlier requests from the same customer were rejected.
    pub rejected_at: Vec<Ms>,
}

fn add_months(at: Ms, months: u32) -> Result<Ms, ParkError> {
    DateTime::<Utc>::from_timestamp_millis(at)
        .and_then(|dt| dt.checked_add_months(Months::new(months)))
        .map(|dt| dt.timestamp_millis())
        .ok_or(ParkError::LimitExceeded("timestamp out of range"))
}

/// Surcharge for a plate change made between 6 and 12 calendar months after the previous one.
pub fn plate_change_window_charge(
    rules: &ChargeRules,
    requested_at: Ms,
    previous_change_at: Option<Ms>,
) -> Result<Charge, ParkError> {
    let Some(previous) = previous_change_at else {
        return Ok(Charge::None);
    };
    if requested_at < previous {
        return Err(ParkError::InvalidTimeRange { start: previous, end: requested_at });
    }
    let window_start = add_months(previous, PLATE_CHANGE_WINDOW_START_MONTHS)?;
    let window_end = add_months(previous, PLATE_CHANGE_WINDOW_END_MONTHS)?;
    if (window_start..window_end).contains(&requested_at) {
        rules.charge_for(ChargeCode::PlateChange)
    } else {
        Ok(Charge::None)
    }
}

/// Surcharge when more than two requests were rejected within `lookback_days` before `requested_at`.
pub fn repeated_rejection_charge(
    rules: &ChargeRules,
    requested_at: Ms,
    rejected_at: &[Ms],
    lookback_days: u32,
) -> Result<Charge, ParkError> {
    let lookback_start = requested_at - i64::from(lookback_days) * 24 * HOUR_MS;
    let recent = rejected_at
        .iter()
        .filter(|&&t| lookback_start <= t && t < requested_at)
        .count();
    if recent > MAX_FREE_REJECTIONS {
        rules.charge_for(ChargeCode::RepeatedRejections)
    } else {
        Ok(Charge::None)
    }
}

/// Every administrative surcharge that applies to a plate-change request, combined.
pub fn plate_change_surcharge(
    rules: &ChargeRules,
    request: &PlateChangeRequest,
    lookback_days: u32,
) -> Result<Charge, ParkError> {
    let window = plate_change_window_charge(rules, request.requested_at, request.previous_change_at)?;
    let rejections =
        repeated_rejection_charge(rules, request.requested_at, &request.rejected_at, lookback_days)?;
    Ok(window.combine(rejections))
}
