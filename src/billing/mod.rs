//! Billing & overage calculation and administrative charges.

mod calculator;
mod charge;
mod surcharge;

pub use calculator::{Bill, BillingInput, compute_bill};
pub use charge::{Charge, ChargeCode, combine_charges};
pub use surcharge::{
    ChargeRule, ChargeRules, PlateChangeRequest, plate_change_surcharge, plate_change_window_charge,
    repeated_rejection_charge,
};
