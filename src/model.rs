use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 3_600_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start <= end, "Span start must not be after end");
        Self { start, end }
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Vehicle class a slot is reserved for. Each class has its own capacity and counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VehicleClass {
    /// Motorcycles and scooters, `2R`.
    TwoWheeler,
    /// Cars and vans, `4R`.
    FourWheeler,
}

impl VehicleClass {
    pub const ALL: [VehicleClass; 2] = [VehicleClass::TwoWheeler, VehicleClass::FourWheeler];

    pub fn code(self) -> &'static str {
        match self {
            VehicleClass::TwoWheeler => "2R",
            VehicleClass::FourWheeler => "4R",
        }
    }
}

impl fmt::Display for VehicleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Maximum slot count per vehicle class for one facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FacilityCapacity {
    pub two_wheeler: u32,
    pub four_wheeler: u32,
}

impl FacilityCapacity {
    pub fn new(two_wheeler: u32, four_wheeler: u32) -> Self {
        Self { two_wheeler, four_wheeler }
    }

    pub fn for_class(&self, class: VehicleClass) -> u32 {
        match class {
            VehicleClass::TwoWheeler => self.two_wheeler,
            VehicleClass::FourWheeler => self.four_wheeler,
        }
    }
}

/// Key of one occupancy counter in the counter store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub facility_id: Ulid,
    pub class: VehicleClass,
}

impl CounterKey {
    pub fn new(facility_id: Ulid, class: VehicleClass) -> Self {
        Self { facility_id, class }
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "occupancy:{}:{}", self.facility_id, self.class)
    }
}

/// One parking stay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Ulid,
    pub facility_id: Ulid,
    pub class: VehicleClass,
    pub plate: String,
    pub entry_at: Ms,
    pub exit_at: Option<Ms>,
    pub subscription_id: Option<Ulid>,
    /// Set when the stay ended with an incident (lost ticket, damage report).
    pub incident: bool,
}

impl Ticket {
    pub fn is_open(&self) -> bool {
        self.exit_at.is_none()
    }
}

/// Subscription state as seen by billing. Balance changes happen elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSnapshot {
    pub id: Ulid,
    pub remaining_hours: Decimal,
    /// Hourly rate at purchase time.
    pub frozen_rate: Decimal,
}

/// Free hours an affiliated business granted on a ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeHourGrant {
    pub id: Ulid,
    pub ticket_id: Ulid,
    pub business_id: Ulid,
    pub facility_id: Ulid,
    pub hours: Decimal,
    pub granted_at: Ms,
    pub settled: bool,
}

/// An affiliated business and the rate it pays per granted hour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Affiliation {
    pub business_id: Ulid,
    pub name: String,
    pub hourly_rate: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementLine {
    pub grant_id: Ulid,
    pub ticket_id: Ulid,
    pub hours: Decimal,
}

/// Payable aggregation of free-hour grants for one business and branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub id: Ulid,
    pub business_id: Ulid,
    pub facility_id: Ulid,
    pub period: Span,
    pub total_hours: Decimal,
    pub rate: Decimal,
    pub amount: Decimal,
    pub created_at: Ms,
    pub lines: Vec<SettlementLine>,
}

/// WAL record format. Each variant carries the full record it saves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    TicketSaved { ticket: Ticket },
    SubscriptionSaved { snapshot: SubscriptionSnapshot },
    GrantRecorded { grant: FreeHourGrant },
    GrantsSettled { ids: Vec<Ulid> },
    SettlementSaved { settlement: Settlement },
}
