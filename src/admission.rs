//! Occupancy admission control.
//!
//! The counter store only offers atomic increment/decrement, so a reservation
//! increments first and compensates with a decrement when the new value
//! overshoots capacity. The overshoot lives only between those two calls, and
//! `try_reserve` does not return until it is undone.
//!
//! Ticket records are authoritative; counters are a cache rebuilt by
//! [`AdmissionControl::reconcile_from_source`] before traffic is accepted.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::counter::CounterStore;
use crate::error::{CounterError, ParkError};
use crate::model::{CounterKey, VehicleClass};
use crate::observability::{
    ADMISSIONS_TOTAL, COUNTER_DRIFT_TOTAL, OCCUPANCY, RELEASES_TOTAL,
};
use crate::store::RecordStore;

/// What `release` did to the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Decremented; carries the new occupancy.
    Released(u32),
    /// The decrement went negative and the counter was reset to zero.
    Clamped,
    /// The counter store could not be reached. The missed decrement is left
    /// for the next reconciliation.
    Deferred,
}

impl ReleaseOutcome {
    /// Occupancy known after the release, `None` when the counter was not reached.
    pub fn occupancy(self) -> Option<u32> {
        match self {
            ReleaseOutcome::Released(v) => Some(v),
            ReleaseOutcome::Clamped => Some(0),
            ReleaseOutcome::Deferred => None,
        }
    }
}

pub struct AdmissionControl {
    counters: Arc<dyn CounterStore>,
    call_timeout: Duration,
    /// Counter keys whose value may be off because a call failed part-way,
    /// with the number of such failures since the last reconciliation.
    drift: DashMap<CounterKey, u64>,
}

impl AdmissionControl {
    pub fn new(counters: Arc<dyn CounterStore>, call_timeout: Duration) -> Self {
        Self {
            counters,
            call_timeout,
            drift: DashMap::new(),
        }
    }

    /// Bound a counter-store call by the configured timeout.
    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, CounterError>>,
    ) -> Result<T, CounterError> {
        tokio::time::timeout(self.call_timeout, fut)
            .await
            .unwrap_or(Err(CounterError::Timeout))
    }

    fn record_drift(&self, key: CounterKey) {
        *self.drift.entry(key).or_insert(0) += 1;
        metrics::counter!(COUNTER_DRIFT_TOTAL, "class" => key.class.code()).increment(1);
    }

    /// Reserve one slot. `false` means the facility is full for this class or the
    /// counter store could not be trusted (fail closed).
    pub async fn try_reserve(&self, facility_id: Ulid, class: VehicleClass, capacity: u32) -> bool {
        let key = CounterKey::new(facility_id, class);
        let value = match self.call(self.counters.increment(&key)).await {
            Ok(v) => v,
            Err(e) => {
                warn!(%key, "counter store unavailable during reservation, rejecting: {e}");
                if e == CounterError::Timeout {
                    // The increment may still have landed.
                    self.record_drift(key);
                }
                metrics::counter!(ADMISSIONS_TOTAL, "class" => class.code(), "outcome" => "unavailable")
                    .increment(1);
                return false;
            }
        };

        if value > i64::from(capacity) {
            if let Err(e) = self.call(self.counters.decrement(&key)).await {
                error!(%key, value, "compensating decrement failed, counter left above capacity: {e}");
                self.record_drift(key);
            }
            debug!(%key, capacity, "reservation rejected, facility full");
            metrics::counter!(ADMISSIONS_TOTAL, "class" => class.code(), "outcome" => "full")
                .increment(1);
            return false;
        }

        metrics::counter!(ADMISSIONS_TOTAL, "class" => class.code(), "outcome" => "admitted")
            .increment(1);
        metrics::gauge!(OCCUPANCY, "facility" => facility_id.to_string(), "class" => class.code())
            .set(value as f64);
        true
    }

    /// Free one slot. Never fails: the physical exit must not be blocked by the counter store.
    pub async fn release(&self, facility_id: Ulid, class: VehicleClass) -> ReleaseOutcome {
        let key = CounterKey::new(facility_id, class);
        let outcome = match self.call(self.counters.decrement(&key)).await {
            Ok(v) if v >= 0 => ReleaseOutcome::Released(v as u32),
            Ok(v) => {
                warn!(%key, value = v, "occupancy counter drifted below zero, clamping");
                metrics::counter!(COUNTER_DRIFT_TOTAL, "class" => class.code()).increment(1);
                match self.call(self.counters.set(&key, 0)).await {
                    Ok(()) => ReleaseOutcome::Clamped,
                    Err(e) => {
                        error!(%key, "failed to clamp negative counter: {e}");
                        self.record_drift(key);
                        ReleaseOutcome::Deferred
                    }
                }
            }
            Err(e) => {
                warn!(%key, "counter store unavailable during release, deferring to reconciliation: {e}");
                self.record_drift(key);
                ReleaseOutcome::Deferred
            }
        };

        let label = match outcome {
            ReleaseOutcome::Released(_) => "released",
            ReleaseOutcome::Clamped => "clamped",
            ReleaseOutcome::Deferred => "deferred",
        };
        metrics::counter!(RELEASES_TOTAL, "class" => class.code(), "outcome" => label).increment(1);
        if let Some(occupied) = outcome.occupancy() {
            metrics::gauge!(OCCUPANCY, "facility" => facility_id.to_string(), "class" => class.code())
                .set(f64::from(occupied));
        }
        outcome
    }

    /// Occupied slots. A missing key reads as zero; a negative value is never reported.
    pub async fn current_occupancy(
        &self,
        facility_id: Ulid,
        class: VehicleClass,
    ) -> Result<u32, CounterError> {
        let key = CounterKey::new(facility_id, class);
        let value = self.call(self.counters.get(&key)).await?;
        Ok(value.unwrap_or(0).max(0) as u32)
    }

    /// Overwrite every class counter of `facility_id` with its open-ticket count.
    /// Run before the facility accepts admissions.
    pub async fn reconcile_from_source(
        &self,
        facility_id: Ulid,
        store: &dyn RecordStore,
    ) -> Result<Vec<(VehicleClass, u32)>, ParkError> {
        let mut counts = Vec::with_capacity(VehicleClass::ALL.len());
        for class in VehicleClass::ALL {
            let key = CounterKey::new(facility_id, class);
            let open = store.find_open_ticket_count(facility_id, class).await?;
            let previous = self.call(self.counters.get(&key)).await?;
            self.call(self.counters.set(&key, i64::from(open))).await?;
            self.drift.remove(&key);

            if previous.unwrap_or(0) != i64::from(open) {
                warn!(%key, previous = previous.unwrap_or(0), open, "occupancy counter corrected from tickets");
            }
            metrics::gauge!(OCCUPANCY, "facility" => facility_id.to_string(), "class" => class.code())
                .set(f64::from(open));
            counts.push((class, open));
        }
        info!(%facility_id, ?counts, "occupancy reconciled");
        Ok(counts)
    }

    /// Missed or uncertain counter updates for one key since its last reconciliation.
    pub fn pending_drift(&self, facility_id: Ulid, class: VehicleClass) -> u64 {
        self.drift
            .get(&CounterKey::new(facility_id, class))
            .map(|e| *e.value())
            .unwrap_or(0)
    }

    pub fn total_pending_drift(&self) -> u64 {
        self.drift.iter().map(|e| *e.value()).sum()
    }
}
