//! Settlement of free-hour grants owed by affiliated businesses.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::info;
use ulid::Ulid;

use crate::error::{BusinessRule, ParkError, StoreError};
use crate::limits::MAX_SETTLEMENT_GRANTS;
use crate::locks::KeyedLocks;
use crate::model::*;
use crate::money::cost;
use crate::observability::SETTLEMENTS_TOTAL;
use crate::store::RecordStore;

pub struct SettlementAggregator {
    store: Arc<dyn RecordStore>,
    /// One lock per (business, facility) so concurrent runs cannot pick up the same grants.
    locks: KeyedLocks<(Ulid, Ulid)>,
}

impl SettlementAggregator {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
        }
    }

    /// Aggregate every unsettled grant of `affiliation` at `facility_id` within `period`
    /// into one settlement. The settlement is written before the grants are marked, so a
    /// failure part-way never leaves grants settled without a settlement record.
    pub async fn settle(
        &self,
        affiliation: &Affiliation,
        facility_id: Ulid,
        period: Span,
        now: Ms,
    ) -> Result<Settlement, ParkError> {
        if period.end < period.start {
            return Err(ParkError::InvalidTimeRange { start: period.start, end: period.end });
        }
        let business_id = affiliation.business_id;
        let _guard = self.locks.lock((business_id, facility_id)).await;

        let grants = self
            .store
            .find_unsettled_grants(business_id, facility_id, period)
            .await?;
        if grants.is_empty() {
            return Err(BusinessRule::NothingToSettle.into());
        }
        if grants.len() > MAX_SETTLEMENT_GRANTS {
            return Err(ParkError::LimitExceeded("too many grants in one settlement"));
        }

        let total_hours: Decimal = grants.iter().map(|g| g.hours).sum();
        let amount = cost(total_hours, affiliation.hourly_rate)?;
        let settlement = Settlement {
            id: Ulid::new(),
            business_id,
            facility_id,
            period,
            total_hours,
            rate: affiliation.hourly_rate,
            amount,
            created_at: now,
            lines: grants
                .iter()
                .map(|g| SettlementLine {
                    grant_id: g.id,
                    ticket_id: g.ticket_id,
                    hours: g.hours,
                })
                .collect(),
        };
        self.store.save_settlement(&settlement).await?;

        let ids: Vec<Ulid> = grants.iter().map(|g| g.id).collect();
        self.store
            .mark_grants_settled(&ids)
            .await
            .map_err(|e| match e {
                StoreError::AlreadySettled(id) => ParkError::from(BusinessRule::GrantAlreadySettled(id)),
                other => ParkError::from(other),
            })?;

        info!(
            settlement_id = %settlement.id,
            %business_id,
            %facility_id,
            grants = ids.len(),
            %total_hours,
            %amount,
            "settlement created"
        );
        metrics::counter!(SETTLEMENTS_TOTAL).increment(1);
        Ok(settlement)
    }
}
