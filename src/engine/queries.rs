use futures::future::try_join_all;
use rust_decimal::Decimal;
use tracing::error;
use ulid::Ulid;

use crate::error::ParkError;
use crate::model::*;
use crate::money::percentage_of;

use super::{Engine, FacilityState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassOccupancy {
    pub class: VehicleClass,
    pub occupied: u32,
    pub capacity: u32,
    pub free: u32,
    /// Occupied share of capacity, 0..=100 (above 100 only after a capacity cut).
    pub occupancy_pct: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OccupancySnapshot {
    pub facility_id: Ulid,
    pub classes: Vec<ClassOccupancy>,
}

impl OccupancySnapshot {
    pub fn class(&self, class: VehicleClass) -> Option<&ClassOccupancy> {
        self.classes.iter().find(|c| c.class == class)
    }
}

impl Engine {
    pub fn facility(&self, id: Ulid) -> Result<FacilityState, ParkError> {
        self.facilities
            .get(&id)
            .map(|f| f.value().clone())
            .ok_or(ParkError::NotFound(id))
    }

    pub fn facility_ids(&self) -> Vec<Ulid> {
        self.facilities.iter().map(|f| *f.key()).collect()
    }

    pub fn affiliation(&self, business_id: Ulid) -> Option<Affiliation> {
        self.affiliations.get(&business_id).map(|a| a.value().clone())
    }

    pub async fn ticket(&self, id: Ulid) -> Result<Ticket, ParkError> {
        self.store
            .find_ticket(id)
            .await?
            .ok_or(ParkError::NotFound(id))
    }

    /// Counter-backed occupancy per class. Fails when the counter store is unreachable.
    pub async fn occupancy(&self, facility_id: Ulid) -> Result<OccupancySnapshot, ParkError> {
        let facility = self.facility(facility_id)?;
        let mut classes = Vec::with_capacity(VehicleClass::ALL.len());
        for class in VehicleClass::ALL {
            let occupied = self.admission.current_occupancy(facility_id, class).await?;
            let capacity = facility.capacity.for_class(class);
            classes.push(ClassOccupancy {
                class,
                occupied,
                capacity,
                free: capacity.saturating_sub(occupied),
                occupancy_pct: percentage_of(Decimal::from(occupied), Decimal::from(capacity)),
            });
        }
        Ok(OccupancySnapshot {
            facility_id,
            classes,
        })
    }

    /// Rebuild every facility's counters from open tickets, all facilities at once.
    pub async fn reconcile_all(&self) -> Result<(), ParkError> {
        let store = self.store.as_ref();
        try_join_all(self.facility_ids().into_iter().map(|facility_id| async move {
            self.admission
                .reconcile_from_source(facility_id, store)
                .await
                .inspect_err(|e| error!(%facility_id, "reconciliation failed: {e}"))
        }))
        .await?;
        Ok(())
    }
}
