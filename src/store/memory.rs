use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::error::StoreError;
use crate::model::*;

use super::RecordStore;

pub struct InMemoryRecordStore {
    tickets: DashMap<Ulid, Ticket>,
    subscriptions: DashMap<Ulid, SubscriptionSnapshot>,
    grants: DashMap<Ulid, FreeHourGrant>,
    /// Ticket → grant ids, for exit-time billing lookups.
    grants_by_ticket: DashMap<Ulid, Vec<Ulid>>,
    settlements: DashMap<Ulid, Settlement>,
    /// Serializes the check-then-mark of `mark_grants_settled`.
    settle_guard: Mutex<()>,
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self {
            tickets: DashMap::new(),
            subscriptions: DashMap::new(),
            grants: DashMap::new(),
            grants_by_ticket: DashMap::new(),
            settlements: DashMap::new(),
            settle_guard: Mutex::new(()),
        }
    }

    pub fn ticket_count(&self) -> usize {
        self.tickets.len()
    }

    pub fn settlement_count(&self) -> usize {
        self.settlements.len()
    }

    // ── Event application ────────────────────────────────────

    pub(crate) fn apply_event(&self, event: &Event) {
        match event {
            Event::TicketSaved { ticket } => {
                self.tickets.insert(ticket.id, ticket.clone());
            }
            Event::SubscriptionSaved { snapshot } => {
                self.subscriptions.insert(snapshot.id, snapshot.clone());
            }
            Event::GrantRecorded { grant } => {
                if self.grants.insert(grant.id, grant.clone()).is_none() {
                    self.grants_by_ticket
                        .entry(grant.ticket_id)
                        .or_default()
                        .push(grant.id);
                }
            }
            Event::GrantsSettled { ids } => {
                for id in ids {
                    if let Some(mut grant) = self.grants.get_mut(id) {
                        grant.settled = true;
                    }
                }
            }
            Event::SettlementSaved { settlement } => {
                self.settlements.insert(settlement.id, settlement.clone());
            }
        }
    }

    /// Fails if any grant is unknown or already settled.
    pub(crate) fn check_settleable(&self, ids: &[Ulid]) -> Result<(), StoreError> {
        for id in ids {
            let grant = self.grants.get(id).ok_or(StoreError::UnknownGrant(*id))?;
            if grant.settled {
                return Err(StoreError::AlreadySettled(*id));
            }
        }
        Ok(())
    }

    /// Minimal event list that recreates the current state. Used for WAL compaction.
    pub(crate) fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::with_capacity(
            self.subscriptions.len() + self.tickets.len() + self.grants.len() + self.settlements.len(),
        );
        for e in self.subscriptions.iter() {
            events.push(Event::SubscriptionSaved { snapshot: e.value().clone() });
        }
        for e in self.tickets.iter() {
            events.push(Event::TicketSaved { ticket: e.value().clone() });
        }
        for e in self.grants.iter() {
            events.push(Event::GrantRecorded { grant: e.value().clone() });
        }
        for e in self.settlements.iter() {
            events.push(Event::SettlementSaved { settlement: e.value().clone() });
        }
        events
    }

    // ── Queries ──────────────────────────────────────────────

    pub(crate) fn open_ticket_count(&self, facility_id: Ulid, class: VehicleClass) -> u32 {
        self.tickets
            .iter()
            .filter(|e| {
                let t = e.value();
                t.facility_id == facility_id && t.class == class && t.is_open()
            })
            .count() as u32
    }

    pub(crate) fn ticket(&self, id: &Ulid) -> Option<Ticket> {
        self.tickets.get(id).map(|e| e.value().clone())
    }

    pub(crate) fn subscription(&self, id: &Ulid) -> Option<SubscriptionSnapshot> {
        self.subscriptions.get(id).map(|e| e.value().clone())
    }

    pub(crate) fn grants_for_ticket(&self, ticket_id: &Ulid) -> Vec<FreeHourGrant> {
        let Some(ids) = self.grants_by_ticket.get(ticket_id).map(|e| e.value().clone()) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.grants.get(id).map(|g| g.value().clone()))
            .collect()
    }

    pub(crate) fn unsettled_grants(
        &self,
        business_id: Ulid,
        facility_id: Ulid,
        period: Span,
    ) -> Vec<FreeHourGrant> {
        let mut found: Vec<FreeHourGrant> = self
            .grants
            .iter()
            .filter(|e| {
                let g = e.value();
                !g.settled
                    && g.business_id == business_id
                    && g.facility_id == facility_id
                    && period.contains_instant(g.granted_at)
            })
            .map(|e| e.value().clone())
            .collect();
        found.sort_by_key(|g| (g.granted_at, g.id));
        found
    }

    pub(crate) fn settlement(&self, id: &Ulid) -> Option<Settlement> {
        self.settlements.get(id).map(|e| e.value().clone())
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn find_open_ticket_count(
        &self,
        facility_id: Ulid,
        class: VehicleClass,
    ) -> Result<u32, StoreError> {
        Ok(self.open_ticket_count(facility_id, class))
    }

    async fn find_ticket(&self, id: Ulid) -> Result<Option<Ticket>, StoreError> {
        Ok(self.ticket(&id))
    }

    async fn save_ticket(&self, ticket: &Ticket) -> Result<(), StoreError> {
        self.apply_event(&Event::TicketSaved { ticket: ticket.clone() });
        Ok(())
    }

    async fn find_subscription_snapshot(
        &self,
        id: Ulid,
    ) -> Result<Option<SubscriptionSnapshot>, StoreError> {
        Ok(self.subscription(&id))
    }

    async fn save_subscription_snapshot(
        &self,
        snapshot: &SubscriptionSnapshot,
    ) -> Result<(), StoreError> {
        self.apply_event(&Event::SubscriptionSaved { snapshot: snapshot.clone() });
        Ok(())
    }

    async fn save_grant(&self, grant: &FreeHourGrant) -> Result<(), StoreError> {
        self.apply_event(&Event::GrantRecorded { grant: grant.clone() });
        Ok(())
    }

    async fn find_grants_for_ticket(&self, ticket_id: Ulid) -> Result<Vec<FreeHourGrant>, StoreError> {
        Ok(self.grants_for_ticket(&ticket_id))
    }

    async fn find_unsettled_grants(
        &self,
        business_id: Ulid,
        facility_id: Ulid,
        period: Span,
    ) -> Result<Vec<FreeHourGrant>, StoreError> {
        Ok(self.unsettled_grants(business_id, facility_id, period))
    }

    async fn mark_grants_settled(&self, ids: &[Ulid]) -> Result<(), StoreError> {
        let _guard = self
            .settle_guard
            .lock()
            .map_err(|_| StoreError::Wal("settle guard poisoned".into()))?;
        self.check_settleable(ids)?;
        self.apply_event(&Event::GrantsSettled { ids: ids.to_vec() });
        Ok(())
    }

    async fn save_settlement(&self, settlement: &Settlement) -> Result<(), StoreError> {
        self.apply_event(&Event::SettlementSaved { settlement: settlement.clone() });
        Ok(())
    }

    async fn find_settlement(&self, id: Ulid) -> Result<Option<Settlement>, StoreError> {
        Ok(self.settlement(&id))
    }
}
