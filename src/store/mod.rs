//! Durable record store the core reads tickets, subscriptions, grants and
//! settlements from. The surrounding application owns the real schema; this
//! crate ships an in-memory store and a WAL-backed one.

mod durable;
mod memory;

pub use durable::WalRecordStore;
pub use memory::InMemoryRecordStore;

use async_trait::async_trait;
use ulid::Ulid;

use crate::error::StoreError;
use crate::model::*;

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Number of tickets without an exit timestamp. Only used by reconciliation.
    async fn find_open_ticket_count(
        &self,
        facility_id: Ulid,
        class: VehicleClass,
    ) -> Result<u32, StoreError>;

    async fn find_ticket(&self, id: Ulid) -> Result<Option<Ticket>, StoreError>;

    /// Insert or replace a ticket.
    async fn save_ticket(&self, ticket: &Ticket) -> Result<(), StoreError>;

    async fn find_subscription_snapshot(
        &self,
        id: Ulid,
    ) -> Result<Option<SubscriptionSnapshot>, StoreError>;

    async fn save_subscription_snapshot(
        &self,
        snapshot: &SubscriptionSnapshot,
    ) -> Result<(), StoreError>;

    async fn save_grant(&self, grant: &FreeHourGrant) -> Result<(), StoreError>;

    async fn find_grants_for_ticket(&self, ticket_id: Ulid) -> Result<Vec<FreeHourGrant>, StoreError>;

    /// Unsettled grants of `business_id` at `facility_id` granted inside `period`,
    /// oldest first.
    async fn find_unsettled_grants(
        &self,
        business_id: Ulid,
        facility_id: Ulid,
        period: Span,
    ) -> Result<Vec<FreeHourGrant>, StoreError>;

    /// Mark grants settled. All-or-nothing: fails without changes if any id is
    /// unknown or already settled.
    async fn mark_grants_settled(&self, ids: &[Ulid]) -> Result<(), StoreError>;

    async fn save_settlement(&self, settlement: &Settlement) -> Result<(), StoreError>;

    async fn find_settlement(&self, id: Ulid) -> Result<Option<Settlement>, StoreError>;
}
