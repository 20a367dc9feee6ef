use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::VehicleClass;

const CHANNEL_CAPACITY: usize = 256;

/// Occupancy changes published per facility (gate displays, notification senders).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OccupancyEvent {
    Admitted {
        ticket_id: Ulid,
        class: VehicleClass,
    },
    Rejected {
        class: VehicleClass,
        plate: String,
    },
    Released {
        ticket_id: Ulid,
        class: VehicleClass,
        amount: Decimal,
    },
}

/// Broadcast hub, one channel per facility.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<OccupancyEvent>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a facility's events. Creates the channel if needed.
    pub fn subscribe(&self, facility_id: Ulid) -> broadcast::Receiver<OccupancyEvent> {
        let sender = self
            .channels
            .entry(facility_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, facility_id: Ulid, event: OccupancyEvent) {
        if let Some(sender) = self.channels.get(&facility_id) {
            let _ = sender.send(event);
        }
    }
}
