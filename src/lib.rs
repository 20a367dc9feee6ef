//! Parking facility core: occupancy admission against an atomic counter store,
//! stay billing in exact decimals, and settlement of free hours owed by
//! affiliated businesses.

pub mod admission;
pub mod billing;
pub mod config;
pub mod counter;
pub mod engine;
pub mod error;
pub mod limits;
pub mod locks;
pub mod model;
pub mod money;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod service;
pub mod settlement;
pub mod store;
pub mod wal;

pub use engine::{Engine, EngineSettings, EntryRequest, ExitReceipt, ExitRequest};
pub use error::{BusinessRule, CounterError, ParkError, StoreError};
pub use service::ParkingService;
