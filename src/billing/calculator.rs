use rust_decimal::Decimal;

use crate::error::ParkError;
use crate::model::{FreeHourGrant, Ms, SubscriptionSnapshot, Ticket};
use crate::money::{cost, duration_hours};

use super::charge::{Charge, ChargeCode};
use super::surcharge::ChargeRules;

/// Everything needed to price one stay.
#[derive(Debug, Clone, Copy)]
pub struct BillingInput<'a> {
    pub ticket: &'a Ticket,
    pub exit_at: Ms,
    pub subscription: Option<&'a SubscriptionSnapshot>,
    pub grants: &'a [FreeHourGrant],
    /// The facility's rate now, not the subscription's frozen rate.
    pub current_rate: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bill {
    pub total_hours: Decimal,
    /// Hours drawn from the subscription allowance. The caller debits the balance.
    pub subscription_hours: Decimal,
    /// Free hours from affiliated businesses applied to this stay.
    pub free_hours: Decimal,
    /// Hours charged at `rate`: overage with a subscription, the remainder otherwise.
    pub billable_hours: Decimal,
    pub rate: Decimal,
    pub charge: Charge,
}

impl Bill {
    pub fn amount(&self) -> Decimal {
        self.charge.amount()
    }
}

pub fn compute_bill(input: &BillingInput<'_>, rules: &ChargeRules) -> Result<Bill, ParkError> {
    let total_hours = duration_hours(input.ticket.entry_at, input.exit_at)?;
    let rate = input.current_rate;

    let (subscription_hours, free_hours, billable_hours, time_charge) = match input.subscription {
        Some(sub) => {
            let consumed = total_hours.min(sub.remaining_hours.max(Decimal::ZERO));
            let overage = total_hours - consumed;
            let charge = Charge::new(
                cost(overage, rate)?,
                format!("overage {overage}h at {rate}/h"),
                ChargeCode::Overage,
            )?;
            (consumed, Decimal::ZERO, overage, charge)
        }
        None => {
            let granted: Decimal = input.grants.iter().map(|g| g.hours).sum();
            let applied = granted.min(total_hours);
            let billable = (total_hours - granted).max(Decimal::ZERO);
            let charge = Charge::new(
                cost(billable, rate)?,
                format!("parking {billable}h at {rate}/h"),
                ChargeCode::ParkingFee,
            )?;
            (Decimal::ZERO, applied, billable, charge)
        }
    };

    let incident = if input.ticket.incident {
        rules.charge_for(ChargeCode::Incident)?
    } else {
        Charge::None
    };

    Ok(Bill {
        total_hours,
        subscription_hours,
        free_hours,
        billable_hours,
        rate,
        charge: time_charge.combine(incident),
    })
}
