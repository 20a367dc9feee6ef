use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::billing::{self, BillingInput, Charge, PlateChangeRequest, compute_bill};
use crate::error::{BusinessRule, ParkError};
use crate::limits::*;
use crate::model::*;
use crate::notify::OccupancyEvent;
use crate::observability::{EXIT_CHARGE_AMOUNT, EXITS_TOTAL};

use super::{Engine, EntryRequest, ExitReceipt, ExitRequest, FacilityState, validate_timestamp};

fn validate_capacity(capacity: &FacilityCapacity) -> Result<(), ParkError> {
    if VehicleClass::ALL
        .iter()
        .any(|&c| capacity.for_class(c) > MAX_CLASS_CAPACITY)
    {
        return Err(ParkError::LimitExceeded("class capacity too large"));
    }
    Ok(())
}

fn validate_rate(rate: Decimal) -> Result<(), ParkError> {
    if rate < Decimal::ZERO {
        return Err(BusinessRule::NegativeAmount.into());
    }
    Ok(())
}

fn validate_plate(plate: &str) -> Result<(), ParkError> {
    if plate.trim().is_empty() {
        return Err(ParkError::LimitExceeded("plate is empty"));
    }
    if plate.len() > MAX_PLATE_LEN {
        return Err(ParkError::LimitExceeded("plate too long"));
    }
    Ok(())
}

impl Engine {
    // ── Administration ─────────────────────────────────────────

    pub fn register_facility(
        &self,
        id: Ulid,
        name: impl Into<String>,
        capacity: FacilityCapacity,
        hourly_rate: Decimal,
    ) -> Result<(), ParkError> {
        let name = name.into();
        if self.facilities.len() >= MAX_FACILITIES {
            return Err(ParkError::LimitExceeded("too many facilities"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(ParkError::LimitExceeded("facility name too long"));
        }
        validate_capacity(&capacity)?;
        validate_rate(hourly_rate)?;

        match self.facilities.entry(id) {
            Entry::Occupied(_) => return Err(ParkError::AlreadyExists(id)),
            Entry::Vacant(v) => {
                v.insert(FacilityState {
                    id,
                    name: name.clone(),
                    capacity,
                    hourly_rate,
                });
            }
        }
        info!(facility_id = %id, %name, ?capacity, %hourly_rate, "facility registered");
        Ok(())
    }

    /// Lowering capacity below current occupancy evicts nobody; new entries
    /// are rejected until enough vehicles leave.
    pub fn update_capacity(&self, id: Ulid, capacity: FacilityCapacity) -> Result<(), ParkError> {
        validate_capacity(&capacity)?;
        let mut facility = self.facilities.get_mut(&id).ok_or(ParkError::NotFound(id))?;
        facility.capacity = capacity;
        info!(facility_id = %id, ?capacity, "capacity updated");
        Ok(())
    }

    /// Applies to every exit from now on, including tickets already inside.
    pub fn update_hourly_rate(&self, id: Ulid, hourly_rate: Decimal) -> Result<(), ParkError> {
        validate_rate(hourly_rate)?;
        let mut facility = self.facilities.get_mut(&id).ok_or(ParkError::NotFound(id))?;
        facility.hourly_rate = hourly_rate;
        info!(facility_id = %id, %hourly_rate, "hourly rate updated");
        Ok(())
    }

    pub fn register_affiliation(&self, affiliation: Affiliation) -> Result<(), ParkError> {
        if affiliation.name.len() > MAX_NAME_LEN {
            return Err(ParkError::LimitExceeded("business name too long"));
        }
        validate_rate(affiliation.hourly_rate)?;
        match self.affiliations.entry(affiliation.business_id) {
            Entry::Occupied(_) => Err(ParkError::AlreadyExists(affiliation.business_id)),
            Entry::Vacant(v) => {
                info!(business_id = %affiliation.business_id, name = %affiliation.name, "affiliation registered");
                v.insert(affiliation);
                Ok(())
            }
        }
    }

    pub async fn save_subscription(&self, snapshot: &SubscriptionSnapshot) -> Result<(), ParkError> {
        if snapshot.remaining_hours < Decimal::ZERO || snapshot.frozen_rate < Decimal::ZERO {
            return Err(BusinessRule::NegativeAmount.into());
        }
        self.store.save_subscription_snapshot(snapshot).await?;
        Ok(())
    }

    // ── Gate operations ────────────────────────────────────────

    pub async fn register_entry(&self, req: EntryRequest) -> Result<Ticket, ParkError> {
        validate_timestamp(req.at)?;
        validate_plate(&req.plate)?;
        let facility = self.facility(req.facility_id)?;
        if let Some(sub_id) = req.subscription_id
            && self.store.find_subscription_snapshot(sub_id).await?.is_none()
        {
            return Err(ParkError::NotFound(sub_id));
        }

        let class = req.class;
        let capacity = facility.capacity.for_class(class);
        if !self.admission.try_reserve(facility.id, class, capacity).await {
            self.notify.send(
                facility.id,
                OccupancyEvent::Rejected {
                    class,
                    plate: req.plate,
                },
            );
            return Err(ParkError::CapacityExceeded { class, capacity });
        }

        let ticket = Ticket {
            id: Ulid::new(),
            facility_id: facility.id,
            class,
            plate: req.plate,
            entry_at: req.at,
            exit_at: None,
            subscription_id: req.subscription_id,
            incident: false,
        };
        if let Err(e) = self.store.save_ticket(&ticket).await {
            error!(ticket_id = %ticket.id, "ticket save failed, releasing reserved slot: {e}");
            self.admission.release(facility.id, class).await;
            return Err(e.into());
        }

        info!(ticket_id = %ticket.id, facility_id = %facility.id, %class, "entry registered");
        self.notify.send(
            facility.id,
            OccupancyEvent::Admitted {
                ticket_id: ticket.id,
                class,
            },
        );
        Ok(ticket)
    }

    /// Close a ticket, price the stay and free the slot. The slot is released
    /// even when the counter store is down; the receipt says what happened.
    pub async fn register_exit(&self, ticket_id: Ulid, req: ExitRequest) -> Result<ExitReceipt, ParkError> {
        validate_timestamp(req.at)?;
        let _ticket_lock = self.tickets.lock(ticket_id).await;

        let ticket = self
            .store
            .find_ticket(ticket_id)
            .await?
            .ok_or(ParkError::NotFound(ticket_id))?;
        if !ticket.is_open() {
            return Err(ParkError::AlreadyClosed(ticket_id));
        }
        if req.at < ticket.entry_at {
            return Err(ParkError::InvalidTimeRange {
                start: ticket.entry_at,
                end: req.at,
            });
        }
        let facility = self.facility(ticket.facility_id)?;

        // Held until the debit is written so two stays cannot spend the same hours.
        let _subscription_lock = match ticket.subscription_id {
            Some(sub_id) => Some(self.subscriptions.lock(sub_id).await),
            None => None,
        };
        let subscription = match ticket.subscription_id {
            Some(sub_id) => {
                let found = self.store.find_subscription_snapshot(sub_id).await?;
                if found.is_none() {
                    warn!(%ticket_id, subscription_id = %sub_id, "subscription vanished, billing as a plain stay");
                }
                found
            }
            None => None,
        };
        let grants = self.store.find_grants_for_ticket(ticket_id).await?;

        let closed = Ticket {
            exit_at: Some(req.at),
            incident: ticket.incident || req.incident,
            ..ticket
        };
        let bill = compute_bill(
            &BillingInput {
                ticket: &closed,
                exit_at: req.at,
                subscription: subscription.as_ref(),
                grants: &grants,
                current_rate: facility.hourly_rate,
            },
            &self.rules,
        )?;
        self.store.save_ticket(&closed).await?;

        let release = self.admission.release(closed.facility_id, closed.class).await;

        if let Some(sub) = subscription
            && bill.subscription_hours > Decimal::ZERO
        {
            let debited = SubscriptionSnapshot {
                remaining_hours: sub.remaining_hours - bill.subscription_hours,
                ..sub
            };
            if let Err(e) = self.store.save_subscription_snapshot(&debited).await {
                error!(%ticket_id, subscription_id = %debited.id, "subscription debit not saved: {e}");
            }
        }

        let amount = bill.amount();
        metrics::counter!(EXITS_TOTAL, "class" => closed.class.code()).increment(1);
        metrics::histogram!(EXIT_CHARGE_AMOUNT).record(amount.to_f64().unwrap_or_default());
        info!(
            %ticket_id,
            facility_id = %closed.facility_id,
            hours = %bill.total_hours,
            %amount,
            ?release,
            "exit registered"
        );
        self.notify.send(
            closed.facility_id,
            OccupancyEvent::Released {
                ticket_id,
                class: closed.class,
                amount,
            },
        );
        Ok(ExitReceipt {
            ticket: closed,
            bill,
            release,
        })
    }

    /// Record free hours an affiliated business grants to an open ticket.
    /// Waits for an exit in progress; once the ticket is closed the grant is refused.
    pub async fn record_free_hours(
        &self,
        ticket_id: Ulid,
        business_id: Ulid,
        hours: Decimal,
        at: Ms,
    ) -> Result<FreeHourGrant, ParkError> {
        validate_timestamp(at)?;
        if !self.affiliations.contains_key(&business_id) {
            return Err(BusinessRule::UnknownAffiliation(business_id).into());
        }
        if hours <= Decimal::ZERO {
            return Err(BusinessRule::NonPositiveAmount.into());
        }
        if hours > MAX_GRANT_HOURS {
            return Err(ParkError::LimitExceeded("too many free hours in one grant"));
        }
        let _ticket_lock = self.tickets.lock(ticket_id).await;
        let ticket = self
            .store
            .find_ticket(ticket_id)
            .await?
            .ok_or(ParkError::NotFound(ticket_id))?;
        if !ticket.is_open() {
            return Err(ParkError::AlreadyClosed(ticket_id));
        }
        if ticket.subscription_id.is_some() {
            return Err(BusinessRule::SubscriptionTicket(ticket_id).into());
        }
        if at < ticket.entry_at {
            return Err(ParkError::InvalidTimeRange {
                start: ticket.entry_at,
                end: at,
            });
        }

        let grant = FreeHourGrant {
            id: Ulid::new(),
            ticket_id,
            business_id,
            facility_id: ticket.facility_id,
            hours,
            granted_at: at,
            settled: false,
        };
        self.store.save_grant(&grant).await?;
        info!(grant_id = %grant.id, %ticket_id, %business_id, %hours, "free hours granted");
        Ok(grant)
    }

    // ── Back office ────────────────────────────────────────────

    pub async fn settle(
        &self,
        business_id: Ulid,
        facility_id: Ulid,
        period: Span,
        now: Ms,
    ) -> Result<Settlement, ParkError> {
        let affiliation = self
            .affiliation(business_id)
            .ok_or(BusinessRule::UnknownAffiliation(business_id))?;
        self.facility(facility_id)?;
        self.settlements
            .settle(&affiliation, facility_id, period, now)
            .await
    }

    pub fn plate_change_surcharge(&self, request: &PlateChangeRequest) -> Result<Charge, ParkError> {
        validate_timestamp(request.requested_at)?;
        billing::plate_change_surcharge(&self.rules, request, self.rejection_lookback_days)
    }
}
