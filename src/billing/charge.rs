use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{BusinessRule, ParkError};

const REASON_SEPARATOR: &str = "; ";

/// Why a charge exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChargeCode {
    ParkingFee,
    Overage,
    PlateChange,
    RepeatedRejections,
    Incident,
    /// Result of combining two or more charges.
    Composite,
}

impl ChargeCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ChargeCode::ParkingFee => "PARKING_FEE",
            ChargeCode::Overage => "OVERAGE",
            ChargeCode::PlateChange => "PLATE_CHANGE",
            ChargeCode::RepeatedRejections => "REPEATED_REJECTIONS",
            ChargeCode::Incident => "INCIDENT",
            ChargeCode::Composite => "COMPOSITE",
        }
    }
}

impl fmt::Display for ChargeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A monetary charge, or the explicit absence of one.
///
/// `combine` forms a commutative monoid with `Charge::None` as identity. Reasons
/// are kept sorted so the joined text does not depend on combination order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Charge {
    None,
    Amount {
        amount: Decimal,
        reasons: Vec<String>,
        code: ChargeCode,
    },
}

impl Charge {
    /// A zero amount yields `Charge::None`.
    pub fn new(amount: Decimal, reason: impl Into<String>, code: ChargeCode) -> Result<Self, ParkError> {
        if amount < Decimal::ZERO {
            return Err(BusinessRule::NegativeAmount.into());
        }
        if amount.is_zero() {
            return Ok(Charge::None);
        }
        Ok(Charge::Amount {
            amount,
            reasons: vec![reason.into()],
            code,
        })
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Charge::None)
    }

    pub fn amount(&self) -> Decimal {
        match self {
            Charge::None => Decimal::ZERO,
            Charge::Amount { amount, .. } => *amount,
        }
    }

    pub fn code(&self) -> Option<ChargeCode> {
        match self {
            Charge::None => None,
            Charge::Amount { code, .. } => Some(*code),
        }
    }

    /// Human-readable reason; empty for `Charge::None`.
    pub fn reason(&self) -> String {
        match self {
            Charge::None => String::new(),
            Charge::Amount { reasons, .. } => reasons.join(REASON_SEPARATOR),
        }
    }

    pub fn combine(self, other: Charge) -> Charge {
        match (self, other) {
            (Charge::None, c) | (c, Charge::None) => c,
            (
                Charge::Amount { amount: a, reasons: mut ra, .. },
                Charge::Amount { amount: b, reasons: rb, .. },
            ) => {
                ra.extend(rb);
                ra.sort();
                Charge::Amount {
                    amount: a + b,
                    reasons: ra,
                    code: ChargeCode::Composite,
                }
            }
        }
    }
}

pub fn combine_charges(a: Charge, b: Charge) -> Charge {
    a.combine(b)
}

impl FromIterator<Charge> for Charge {
    fn from_iter<I: IntoIterator<Item = Charge>>(iter: I) -> Self {
        iter.into_iter().fold(Charge::None, Charge::combine)
    }
}
