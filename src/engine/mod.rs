mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use queries::{ClassOccupancy, OccupancySnapshot};

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rust_decimal::Decimal;
use ulid::Ulid;

use crate::admission::{AdmissionControl, ReleaseOutcome};
use crate::billing::{Bill, ChargeRules};
use crate::counter::CounterStore;
use crate::error::ParkError;
use crate::limits::{MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS};
use crate::locks::KeyedLocks;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::settlement::SettlementAggregator;
use crate::store::RecordStore;

const DEFAULT_COUNTER_TIMEOUT: Duration = Duration::from_millis(500);
const DEFAULT_REJECTION_LOOKBACK_DAYS: u32 = 365;

/// A facility as the engine sees it. Capacity and rate are administrative
/// settings, replaced in place by the update operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacilityState {
    pub id: Ulid,
    pub name: String,
    pub capacity: FacilityCapacity,
    pub hourly_rate: Decimal,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub counter_timeout: Duration,
    pub charge_rules: ChargeRules,
    pub rejection_lookback_days: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            counter_timeout: DEFAULT_COUNTER_TIMEOUT,
            charge_rules: ChargeRules::default(),
            rejection_lookback_days: DEFAULT_REJECTION_LOOKBACK_DAYS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRequest {
    pub facility_id: Ulid,
    pub class: VehicleClass,
    pub plate: String,
    pub subscription_id: Option<Ulid>,
    pub at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitRequest {
    pub at: Ms,
    /// Lost ticket or damage reported at the gate.
    pub incident: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReceipt {
    pub ticket: Ticket,
    pub bill: Bill,
    pub release: ReleaseOutcome,
}

pub struct Engine {
    facilities: DashMap<Ulid, FacilityState>,
    affiliations: DashMap<Ulid, Affiliation>,
    store: Arc<dyn RecordStore>,
    admission: AdmissionControl,
    settlements: SettlementAggregator,
    rules: ChargeRules,
    rejection_lookback_days: u32,
    /// Held while a ticket is closed or given free hours.
    tickets: KeyedLocks<Ulid>,
    /// Held from reading a subscription balance until its debit is written.
    subscriptions: KeyedLocks<Ulid>,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        counters: Arc<dyn CounterStore>,
        notify: Arc<NotifyHub>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            facilities: DashMap::new(),
            affiliations: DashMap::new(),
            admission: AdmissionControl::new(counters, settings.counter_timeout),
            settlements: SettlementAggregator::new(store.clone()),
            store,
            rules: settings.charge_rules,
            rejection_lookback_days: settings.rejection_lookback_days,
            tickets: KeyedLocks::new(),
            subscriptions: KeyedLocks::new(),
            notify,
        }
    }

    pub fn admission(&self) -> &AdmissionControl {
        &self.admission
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }
}

pub(crate) fn validate_timestamp(at: Ms) -> Result<(), ParkError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&at) {
        return Err(ParkError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}
