use super::*;
use crate::billing::{ChargeCode, ChargeRule, PlateChangeRequest};
use crate::counter::InMemoryCounterStore;
use crate::error::{BusinessRule, CounterError, StoreError};
use crate::notify::OccupancyEvent;
use crate::store::InMemoryRecordStore;

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use rust_decimal_macros::dec;
use tokio_test::{assert_err, assert_ok};

const T0: Ms = 1_700_000_000_000;
const H: Ms = HOUR_MS;
const M: Ms = MINUTE_MS;

fn rules() -> ChargeRules {
    ChargeRules::new([
        ChargeRule {
            code: ChargeCode::Incident,
            amount: dec!(50.00),
            active: true,
            reason: "lost ticket".into(),
        },
        ChargeRule {
            code: ChargeCode::PlateChange,
            amount: dec!(25.00),
            active: true,
            reason: "plate change within a year".into(),
        },
    ])
}

fn settings() -> EngineSettings {
    EngineSettings {
        charge_rules: rules(),
        ..EngineSettings::default()
    }
}

struct Fixture {
    engine: Arc<Engine>,
    store: Arc<InMemoryRecordStore>,
    facility_id: Ulid,
}

fn fixture(capacity: FacilityCapacity, rate: Decimal) -> Fixture {
    let store = Arc::new(InMemoryRecordStore::new());
    let engine = Engine::new(
        store.clone(),
        Arc::new(InMemoryCounterStore::new()),
        Arc::new(NotifyHub::new()),
        settings(),
    );
    let facility_id = Ulid::new();
    engine
        .register_facility(facility_id, "Central Plaza", capacity, rate)
        .unwrap();
    Fixture {
        engine: Arc::new(engine),
        store,
        facility_id,
    }
}

fn entry(facility_id: Ulid, class: VehicleClass, plate: &str, at: Ms) -> EntryRequest {
    EntryRequest {
        facility_id,
        class,
        plate: plate.into(),
        subscription_id: None,
        at,
    }
}

fn exit(at: Ms) -> ExitRequest {
    ExitRequest { at, incident: false }
}

async fn occupied(engine: &Engine, facility_id: Ulid, class: VehicleClass) -> u32 {
    engine
        .occupancy(facility_id)
        .await
        .unwrap()
        .class(class)
        .unwrap()
        .occupied
}

/// Counter store that can be switched off.
#[derive(Default)]
struct SwitchableCounterStore {
    inner: InMemoryCounterStore,
    down: AtomicBool,
}

impl SwitchableCounterStore {
    fn check(&self) -> Result<(), CounterError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(CounterError::Unavailable("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for SwitchableCounterStore {
    async fn increment(&self, key: &CounterKey) -> Result<i64, CounterError> {
        self.check()?;
        self.inner.increment(key).await
    }
    async fn decrement(&self, key: &CounterKey) -> Result<i64, CounterError> {
        self.check()?;
        self.inner.decrement(key).await
    }
    async fn get(&self, key: &CounterKey) -> Result<Option<i64>, CounterError> {
        self.check()?;
        self.inner.get(key).await
    }
    async fn set(&self, key: &CounterKey, value: i64) -> Result<(), CounterError> {
        self.check()?;
        self.inner.set(key, value).await
    }
}

/// Record store whose ticket writes can be made to fail.
#[derive(Default)]
struct TicketWriteFailingStore {
    inner: InMemoryRecordStore,
    fail_ticket_writes: AtomicBool,
}

#[async_trait]
impl RecordStore for TicketWriteFailingStore {
    async fn find_open_ticket_count(&self, f: Ulid, c: VehicleClass) -> Result<u32, StoreError> {
        self.inner.find_open_ticket_count(f, c).await
    }
    async fn find_ticket(&self, id: Ulid) -> Result<Option<Ticket>, StoreError> {
        self.inner.find_ticket(id).await
    }
    async fn save_ticket(&self, t: &Ticket) -> Result<(), StoreError> {
        if self.fail_ticket_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Wal("disk full".into()));
        }
        self.inner.save_ticket(t).await
    }
    async fn find_subscription_snapshot(&self, id: Ulid) -> Result<Option<SubscriptionSnapshot>, StoreError> {
        self.inner.find_subscription_snapshot(id).await
    }
    async fn save_subscription_snapshot(&self, s: &SubscriptionSnapshot) -> Result<(), StoreError> {
        self.inner.save_subscription_snapshot(s).await
    }
    async fn save_grant(&self, g: &FreeHourGrant) -> Result<(), StoreError> {
        self.inner.save_grant(g).await
    }
    async fn find_grants_for_ticket(&self, id: Ulid) -> Result<Vec<FreeHourGrant>, StoreError> {
        self.inner.find_grants_for_ticket(id).await
    }
    async fn find_unsettled_grants(&self, b: Ulid, f: Ulid, p: Span) -> Result<Vec<FreeHourGrant>, StoreError> {
        self.inner.find_unsettled_grants(b, f, p).await
    }
    async fn mark_grants_settled(&self, ids: &[Ulid]) -> Result<(), StoreError> {
        self.inner.mark_grants_settled(ids).await
    }
    async fn save_settlement(&self, s: &Settlement) -> Result<(), StoreError> {
        self.inner.save_settlement(s).await
    }
    async fn find_settlement(&self, id: Ulid) -> Result<Option<Settlement>, StoreError> {
        self.inner.find_settlement(id).await
    }
}

/// Record store that hands control back to the scheduler on the reads an exit
/// depends on, so concurrent gate calls interleave there.
#[derive(Default)]
struct YieldingStore {
    inner: InMemoryRecordStore,
}

async fn yield_a_few() {
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
}

#[async_trait]
impl RecordStore for YieldingStore {
    async fn find_open_ticket_count(&self, f: Ulid, c: VehicleClass) -> Result<u32, StoreError> {
        self.inner.find_open_ticket_count(f, c).await
    }
    async fn find_ticket(&self, id: Ulid) -> Result<Option<Ticket>, StoreError> {
        self.inner.find_ticket(id).await
    }
    async fn save_ticket(&self, t: &Ticket) -> Result<(), StoreError> {
        self.inner.save_ticket(t).await
    }
    async fn find_subscription_snapshot(&self, id: Ulid) -> Result<Option<SubscriptionSnapshot>, StoreError> {
        let found = self.inner.find_subscription_snapshot(id).await;
        yield_a_few().await;
        found
    }
    async fn save_subscription_snapshot(&self, s: &SubscriptionSnapshot) -> Result<(), StoreError> {
        self.inner.save_subscription_snapshot(s).await
    }
    async fn save_grant(&self, g: &FreeHourGrant) -> Result<(), StoreError> {
        self.inner.save_grant(g).await
    }
    async fn find_grants_for_ticket(&self, id: Ulid) -> Result<Vec<FreeHourGrant>, StoreError> {
        let found = self.inner.find_grants_for_ticket(id).await;
        yield_a_few().await;
        found
    }
    async fn find_unsettled_grants(&self, b: Ulid, f: Ulid, p: Span) -> Result<Vec<FreeHourGrant>, StoreError> {
        self.inner.find_unsettled_grants(b, f, p).await
    }
    async fn mark_grants_settled(&self, ids: &[Ulid]) -> Result<(), StoreError> {
        self.inner.mark_grants_settled(ids).await
    }
    async fn save_settlement(&self, s: &Settlement) -> Result<(), StoreError> {
        self.inner.save_settlement(s).await
    }
    async fn find_settlement(&self, id: Ulid) -> Result<Option<Settlement>, StoreError> {
        self.inner.find_settlement(id).await
    }
}

fn yielding_fixture(capacity: FacilityCapacity, rate: Decimal) -> (Engine, Arc<YieldingStore>, Ulid) {
    let store = Arc::new(YieldingStore::default());
    let engine = Engine::new(
        store.clone(),
        Arc::new(InMemoryCounterStore::new()),
        Arc::new(NotifyHub::new()),
        settings(),
    );
    let facility_id = Ulid::new();
    engine
        .register_facility(facility_id, "Station Road", capacity, rate)
        .unwrap();
    (engine, store, facility_id)
}

// ── Facility administration ──────────────────────────────────

#[tokio::test]
async fn register_facility_rejects_duplicates_and_bad_settings() {
    let f = fixture(FacilityCapacity::new(1, 1), dec!(2.00));
    let dup = f
        .engine
        .register_facility(f.facility_id, "Again", FacilityCapacity::new(1, 1), dec!(2.00));
    assert!(matches!(dup, Err(ParkError::AlreadyExists(id)) if id == f.facility_id));

    let too_big = f.engine.register_facility(
        Ulid::new(),
        "Stadium",
        FacilityCapacity::new(crate::limits::MAX_CLASS_CAPACITY + 1, 0),
        dec!(2.00),
    );
    assert!(matches!(too_big, Err(ParkError::LimitExceeded(_))));

    let negative = f
        .engine
        .register_facility(Ulid::new(), "Discount", FacilityCapacity::new(1, 1), dec!(-1));
    assert!(matches!(
        negative,
        Err(ParkError::BusinessRule(BusinessRule::NegativeAmount))
    ));

    let long_name = "x".repeat(crate::limits::MAX_NAME_LEN + 1);
    assert_err!(f.engine.register_facility(
        Ulid::new(),
        long_name,
        FacilityCapacity::new(1, 1),
        dec!(1)
    ));
}

#[tokio::test]
async fn updates_to_unknown_facility_are_not_found() {
    let f = fixture(FacilityCapacity::new(1, 1), dec!(2.00));
    let ghost = Ulid::new();
    assert!(matches!(
        f.engine.update_capacity(ghost, FacilityCapacity::new(2, 2)),
        Err(ParkError::NotFound(id)) if id == ghost
    ));
    assert!(matches!(
        f.engine.update_hourly_rate(ghost, dec!(3)),
        Err(ParkError::NotFound(_))
    ));
}

// ── Entry ────────────────────────────────────────────────────

#[tokio::test]
async fn entry_opens_ticket_and_occupies_slot() {
    let f = fixture(FacilityCapacity::new(2, 5), dec!(2.00));
    let ticket = f
        .engine
        .register_entry(entry(f.facility_id, VehicleClass::FourWheeler, "KA01AB1234", T0))
        .await
        .unwrap();

    assert!(ticket.is_open());
    assert_eq!(ticket.entry_at, T0);
    assert_eq!(f.engine.ticket(ticket.id).await.unwrap(), ticket);
    assert_eq!(occupied(&f.engine, f.facility_id, VehicleClass::FourWheeler).await, 1);
    assert_eq!(occupied(&f.engine, f.facility_id, VehicleClass::TwoWheeler).await, 0);

    let snapshot = f.engine.occupancy(f.facility_id).await.unwrap();
    let four = snapshot.class(VehicleClass::FourWheeler).unwrap();
    assert_eq!(four.free, 4);
    assert_eq!(four.occupancy_pct, dec!(20.00));
}

#[tokio::test]
async fn entry_validation() {
    let f = fixture(FacilityCapacity::new(2, 2), dec!(2.00));
    let ghost = Ulid::new();
    assert!(matches!(
        f.engine
            .register_entry(entry(ghost, VehicleClass::TwoWheeler, "A1", T0))
            .await,
        Err(ParkError::NotFound(id)) if id == ghost
    ));
    assert!(matches!(
        f.engine
            .register_entry(entry(f.facility_id, VehicleClass::TwoWheeler, "  ", T0))
            .await,
        Err(ParkError::LimitExceeded(_))
    ));
    assert!(matches!(
        f.engine
            .register_entry(entry(f.facility_id, VehicleClass::TwoWheeler, "A1", -1))
            .await,
        Err(ParkError::LimitExceeded(_))
    ));

    let sub_id = Ulid::new();
    let mut req = entry(f.facility_id, VehicleClass::TwoWheeler, "A1", T0);
    req.subscription_id = Some(sub_id);
    assert!(matches!(
        f.engine.register_entry(req).await,
        Err(ParkError::NotFound(id)) if id == sub_id
    ));

    // Nothing above may leak a reservation.
    assert_eq!(occupied(&f.engine, f.facility_id, VehicleClass::TwoWheeler).await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_two_wheeler_slot_admits_exactly_one() {
    let f = fixture(FacilityCapacity::new(1, 0), dec!(2.00));

    let a = {
        let engine = f.engine.clone();
        let fac = f.facility_id;
        tokio::spawn(async move {
            engine
                .register_entry(entry(fac, VehicleClass::TwoWheeler, "MH12AA0001", T0))
                .await
        })
    };
    let b = {
        let engine = f.engine.clone();
        let fac = f.facility_id;
        tokio::spawn(async move {
            engine
                .register_entry(entry(fac, VehicleClass::TwoWheeler, "MH12AA0002", T0))
                .await
        })
    };
    let results = [a.await.unwrap(), b.await.unwrap()];

    let admitted: Vec<&Ticket> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(admitted.len(), 1);
    assert!(results.iter().any(|r| matches!(
        r,
        Err(ParkError::CapacityExceeded { class: VehicleClass::TwoWheeler, capacity: 1 })
    )));
    assert_eq!(occupied(&f.engine, f.facility_id, VehicleClass::TwoWheeler).await, 1);
    assert_eq!(f.store.ticket_count(), 1);

    let winner = admitted[0].id;
    f.engine.register_exit(winner, exit(T0 + H)).await.unwrap();
    assert_eq!(occupied(&f.engine, f.facility_id, VehicleClass::TwoWheeler).await, 0);

    assert_ok!(
        f.engine
            .register_entry(entry(f.facility_id, VehicleClass::TwoWheeler, "MH12AA0002", T0 + H))
            .await
    );
    assert_eq!(occupied(&f.engine, f.facility_id, VehicleClass::TwoWheeler).await, 1);
}

#[tokio::test]
async fn failed_ticket_save_gives_the_slot_back() {
    let store = Arc::new(TicketWriteFailingStore::default());
    store.fail_ticket_writes.store(true, Ordering::SeqCst);
    let engine = Engine::new(
        store.clone(),
        Arc::new(InMemoryCounterStore::new()),
        Arc::new(NotifyHub::new()),
        settings(),
    );
    let fac = Ulid::new();
    engine
        .register_facility(fac, "Annex", FacilityCapacity::new(1, 1), dec!(1))
        .unwrap();

    let result = engine
        .register_entry(entry(fac, VehicleClass::FourWheeler, "TN09XY0001", T0))
        .await;
    assert!(matches!(result, Err(ParkError::Store(StoreError::Wal(_)))));
    assert_eq!(occupied(&engine, fac, VehicleClass::FourWheeler).await, 0);

    store.fail_ticket_writes.store(false, Ordering::SeqCst);
    assert_ok!(
        engine
            .register_entry(entry(fac, VehicleClass::FourWheeler, "TN09XY0001", T0))
            .await
    );
}

#[tokio::test]
async fn counter_outage_rejects_entries_but_not_exits() {
    let counters = Arc::new(SwitchableCounterStore::default());
    let store = Arc::new(InMemoryRecordStore::new());
    let engine = Engine::new(
        store.clone(),
        counters.clone(),
        Arc::new(NotifyHub::new()),
        settings(),
    );
    let fac = Ulid::new();
    engine
        .register_facility(fac, "Depot", FacilityCapacity::new(0, 3), dec!(2.00))
        .unwrap();
    let inside = engine
        .register_entry(entry(fac, VehicleClass::FourWheeler, "GJ01ZZ0001", T0))
        .await
        .unwrap();

    counters.down.store(true, Ordering::SeqCst);
    assert!(matches!(
        engine
            .register_entry(entry(fac, VehicleClass::FourWheeler, "GJ01ZZ0002", T0))
            .await,
        Err(ParkError::CapacityExceeded { .. })
    ));
    assert!(matches!(
        engine.occupancy(fac).await,
        Err(ParkError::CounterUnavailable(_))
    ));

    let receipt = engine.register_exit(inside.id, exit(T0 + 2 * H)).await.unwrap();
    assert_eq!(receipt.release, ReleaseOutcome::Deferred);
    assert_eq!(receipt.bill.amount(), dec!(4.00));
    assert!(engine.admission().total_pending_drift() > 0);

    // Counter still says 1; the open-ticket count says 0.
    counters.down.store(false, Ordering::SeqCst);
    assert_eq!(occupied(&engine, fac, VehicleClass::FourWheeler).await, 1);
    engine.reconcile_all().await.unwrap();
    assert_eq!(occupied(&engine, fac, VehicleClass::FourWheeler).await, 0);
    assert_eq!(engine.admission().total_pending_drift(), 0);
}

// ── Exit ─────────────────────────────────────────────────────

#[tokio::test]
async fn exit_bills_at_current_rate_and_closes_ticket() {
    let f = fixture(FacilityCapacity::new(1, 1), dec!(2.00));
    let t = f
        .engine
        .register_entry(entry(f.facility_id, VehicleClass::FourWheeler, "DL3CAB1234", T0))
        .await
        .unwrap();

    f.engine.update_hourly_rate(f.facility_id, dec!(3.00)).unwrap();
    let receipt = f.engine.register_exit(t.id, exit(T0 + 125 * M)).await.unwrap();

    assert_eq!(receipt.ticket.exit_at, Some(T0 + 125 * M));
    assert_eq!(receipt.bill.total_hours, dec!(2.08));
    assert_eq!(receipt.bill.rate, dec!(3.00));
    assert_eq!(receipt.bill.amount(), dec!(6.24));
    assert_eq!(receipt.release, ReleaseOutcome::Released(0));
    assert!(!f.engine.ticket(t.id).await.unwrap().is_open());

    assert!(matches!(
        f.engine.register_exit(t.id, exit(T0 + 3 * H)).await,
        Err(ParkError::AlreadyClosed(id)) if id == t.id
    ));
    assert_eq!(occupied(&f.engine, f.facility_id, VehicleClass::FourWheeler).await, 0);
}

#[tokio::test]
async fn exit_validation() {
    let f = fixture(FacilityCapacity::new(1, 1), dec!(2.00));
    let ghost = Ulid::new();
    assert!(matches!(
        f.engine.register_exit(ghost, exit(T0)).await,
        Err(ParkError::NotFound(id)) if id == ghost
    ));

    let t = f
        .engine
        .register_entry(entry(f.facility_id, VehicleClass::TwoWheeler, "KL07C0001", T0))
        .await
        .unwrap();
    assert!(matches!(
        f.engine.register_exit(t.id, exit(T0 - M)).await,
        Err(ParkError::InvalidTimeRange { start: T0, end }) if end == T0 - M
    ));
    assert!(f.engine.ticket(t.id).await.unwrap().is_open());
    assert_eq!(occupied(&f.engine, f.facility_id, VehicleClass::TwoWheeler).await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_exits_release_once() {
    let f = fixture(FacilityCapacity::new(0, 3), dec!(2.00));
    let t = f
        .engine
        .register_entry(entry(f.facility_id, VehicleClass::FourWheeler, "RJ14CC0001", T0))
        .await
        .unwrap();
    f.engine
        .register_entry(entry(f.facility_id, VehicleClass::FourWheeler, "RJ14CC0002", T0))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = f.engine.clone();
        let id = t.id;
        handles.push(tokio::spawn(async move { engine.register_exit(id, exit(T0 + H)).await }));
    }
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(ParkError::AlreadyClosed(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(occupied(&f.engine, f.facility_id, VehicleClass::FourWheeler).await, 1);
}

#[tokio::test]
async fn subscription_covers_allowance_and_is_debited() {
    let f = fixture(FacilityCapacity::new(1, 1), dec!(4.00));
    let sub = SubscriptionSnapshot {
        id: Ulid::new(),
        remaining_hours: dec!(1.5),
        frozen_rate: dec!(1.00),
    };
    f.engine.save_subscription(&sub).await.unwrap();

    let mut req = entry(f.facility_id, VehicleClass::FourWheeler, "UP16SUB001", T0);
    req.subscription_id = Some(sub.id);
    let t = f.engine.register_entry(req).await.unwrap();
    let receipt = f.engine.register_exit(t.id, exit(T0 + 3 * H)).await.unwrap();

    assert_eq!(receipt.bill.subscription_hours, dec!(1.5));
    assert_eq!(receipt.bill.billable_hours, dec!(1.5));
    assert_eq!(receipt.bill.amount(), dec!(6.00));
    assert_eq!(receipt.bill.charge.code(), Some(ChargeCode::Overage));

    let after = f.store.find_subscription_snapshot(sub.id).await.unwrap().unwrap();
    assert_eq!(after.remaining_hours, Decimal::ZERO);
    assert_eq!(after.frozen_rate, dec!(1.00));
}

#[tokio::test]
async fn overlapping_exits_on_one_subscription_spend_the_allowance_once() {
    let (engine, store, fac) = yielding_fixture(FacilityCapacity::new(0, 2), dec!(4.00));
    let sub = SubscriptionSnapshot {
        id: Ulid::new(),
        remaining_hours: dec!(2),
        frozen_rate: dec!(1.00),
    };
    engine.save_subscription(&sub).await.unwrap();

    let mut tickets = Vec::new();
    for plate in ["KA01SH0001", "KA01SH0002"] {
        let mut req = entry(fac, VehicleClass::FourWheeler, plate, T0);
        req.subscription_id = Some(sub.id);
        tickets.push(engine.register_entry(req).await.unwrap());
    }

    let (a, b) = tokio::join!(
        engine.register_exit(tickets[0].id, exit(T0 + 2 * H)),
        engine.register_exit(tickets[1].id, exit(T0 + 2 * H)),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    // One stay is covered, the other is 2h of overage at 4.00.
    assert_eq!(a.bill.subscription_hours + b.bill.subscription_hours, dec!(2));
    assert_eq!(a.bill.amount() + b.bill.amount(), dec!(8.00));
    let after = store.find_subscription_snapshot(sub.id).await.unwrap().unwrap();
    assert_eq!(after.remaining_hours, Decimal::ZERO);
    assert!(engine.subscriptions.is_empty());
}

#[tokio::test]
async fn negative_subscription_balance_is_rejected() {
    let f = fixture(FacilityCapacity::new(1, 1), dec!(4.00));
    let sub = SubscriptionSnapshot {
        id: Ulid::new(),
        remaining_hours: dec!(-1),
        frozen_rate: dec!(1.00),
    };
    assert!(matches!(
        f.engine.save_subscription(&sub).await,
        Err(ParkError::BusinessRule(BusinessRule::NegativeAmount))
    ));
}

#[tokio::test]
async fn incident_reported_at_exit_adds_surcharge() {
    let f = fixture(FacilityCapacity::new(1, 1), dec!(2.00));
    let t = f
        .engine
        .register_entry(entry(f.facility_id, VehicleClass::FourWheeler, "WB02LOST01", T0))
        .await
        .unwrap();
    let receipt = f
        .engine
        .register_exit(t.id, ExitRequest { at: T0 + H, incident: true })
        .await
        .unwrap();
    assert!(receipt.ticket.incident);
    assert_eq!(receipt.bill.amount(), dec!(52.00));
    assert_eq!(receipt.bill.charge.code(), Some(ChargeCode::Composite));
}

// ── Free hours and settlement ───────────────────────────────

fn bakery() -> Affiliation {
    Affiliation {
        business_id: Ulid::new(),
        name: "Corner Bakery".into(),
        hourly_rate: dec!(1.75),
    }
}

#[tokio::test]
async fn free_hours_validation() {
    let f = fixture(FacilityCapacity::new(1, 1), dec!(2.00));
    let aff = bakery();
    f.engine.register_affiliation(aff.clone()).unwrap();
    assert!(matches!(
        f.engine.register_affiliation(aff.clone()),
        Err(ParkError::AlreadyExists(_))
    ));
    let t = f
        .engine
        .register_entry(entry(f.facility_id, VehicleClass::FourWheeler, "AP09FH0001", T0))
        .await
        .unwrap();

    let stranger = Ulid::new();
    assert!(matches!(
        f.engine.record_free_hours(t.id, stranger, dec!(1), T0 + M).await,
        Err(ParkError::BusinessRule(BusinessRule::UnknownAffiliation(id))) if id == stranger
    ));
    assert!(matches!(
        f.engine.record_free_hours(t.id, aff.business_id, dec!(0), T0 + M).await,
        Err(ParkError::BusinessRule(BusinessRule::NonPositiveAmount))
    ));
    assert!(matches!(
        f.engine.record_free_hours(t.id, aff.business_id, dec!(25), T0 + M).await,
        Err(ParkError::LimitExceeded(_))
    ));
    assert!(matches!(
        f.engine.record_free_hours(Ulid::new(), aff.business_id, dec!(1), T0 + M).await,
        Err(ParkError::NotFound(_))
    ));

    f.engine.register_exit(t.id, exit(T0 + H)).await.unwrap();
    assert!(matches!(
        f.engine.record_free_hours(t.id, aff.business_id, dec!(1), T0 + 2 * H).await,
        Err(ParkError::AlreadyClosed(_))
    ));
}

#[tokio::test]
async fn free_hours_are_refused_for_subscription_tickets() {
    let f = fixture(FacilityCapacity::new(1, 1), dec!(2.00));
    let aff = bakery();
    f.engine.register_affiliation(aff.clone()).unwrap();
    let sub = SubscriptionSnapshot {
        id: Ulid::new(),
        remaining_hours: dec!(10),
        frozen_rate: dec!(1.00),
    };
    f.engine.save_subscription(&sub).await.unwrap();

    let mut req = entry(f.facility_id, VehicleClass::FourWheeler, "TN09SUB002", T0);
    req.subscription_id = Some(sub.id);
    let t = f.engine.register_entry(req).await.unwrap();

    assert!(matches!(
        f.engine.record_free_hours(t.id, aff.business_id, dec!(1), T0 + M).await,
        Err(ParkError::BusinessRule(BusinessRule::SubscriptionTicket(id))) if id == t.id
    ));
    assert_ok!(f.engine.register_exit(t.id, exit(T0 + H)).await);
    assert!(matches!(
        f.engine
            .settle(aff.business_id, f.facility_id, Span::new(T0, T0 + 24 * H), T0 + 25 * H)
            .await,
        Err(ParkError::BusinessRule(BusinessRule::NothingToSettle))
    ));
}

#[tokio::test]
async fn grant_during_exit_is_either_billed_or_refused() {
    let (engine, _store, fac) = yielding_fixture(FacilityCapacity::new(1, 1), dec!(2.00));
    let aff = bakery();
    engine.register_affiliation(aff.clone()).unwrap();
    let t = engine
        .register_entry(entry(fac, VehicleClass::FourWheeler, "GJ05RC0001", T0))
        .await
        .unwrap();

    let (receipt, grant) = tokio::join!(
        engine.register_exit(t.id, exit(T0 + 4 * H)),
        engine.record_free_hours(t.id, aff.business_id, dec!(2), T0 + H),
    );
    let receipt = receipt.unwrap();
    let settled = engine
        .settle(aff.business_id, fac, Span::new(T0, T0 + 24 * H), T0 + 25 * H)
        .await;

    match grant {
        Ok(_) => {
            assert_eq!(receipt.bill.free_hours, dec!(2));
            assert_eq!(receipt.bill.amount(), dec!(4.00));
            assert_eq!(settled.unwrap().total_hours, dec!(2));
        }
        Err(ParkError::AlreadyClosed(id)) => {
            assert_eq!(id, t.id);
            assert_eq!(receipt.bill.free_hours, Decimal::ZERO);
            assert_eq!(receipt.bill.amount(), dec!(8.00));
            assert!(matches!(
                settled,
                Err(ParkError::BusinessRule(BusinessRule::NothingToSettle))
            ));
        }
        Err(e) => panic!("unexpected error: {e}"),
    }
    assert!(engine.tickets.is_empty());
}

#[tokio::test]
async fn free_hours_reduce_bill_and_are_settled_with_business() {
    let f = fixture(FacilityCapacity::new(1, 1), dec!(2.00));
    let aff = bakery();
    f.engine.register_affiliation(aff.clone()).unwrap();

    let t = f
        .engine
        .register_entry(entry(f.facility_id, VehicleClass::FourWheeler, "HR26FH0001", T0))
        .await
        .unwrap();
    f.engine
        .record_free_hours(t.id, aff.business_id, dec!(1.5), T0 + 10 * M)
        .await
        .unwrap();
    let receipt = f.engine.register_exit(t.id, exit(T0 + 2 * H)).await.unwrap();
    assert_eq!(receipt.bill.free_hours, dec!(1.5));
    assert_eq!(receipt.bill.amount(), dec!(1.00));

    let settlement = f
        .engine
        .settle(aff.business_id, f.facility_id, Span::new(T0, T0 + 24 * H), T0 + 25 * H)
        .await
        .unwrap();
    assert_eq!(settlement.total_hours, dec!(1.5));
    assert_eq!(settlement.amount, dec!(2.63));

    assert!(matches!(
        f.engine
            .settle(aff.business_id, f.facility_id, Span::new(T0, T0 + 24 * H), T0 + 26 * H)
            .await,
        Err(ParkError::BusinessRule(BusinessRule::NothingToSettle))
    ));
    assert!(matches!(
        f.engine
            .settle(Ulid::new(), f.facility_id, Span::new(T0, T0 + H), T0 + 26 * H)
            .await,
        Err(ParkError::BusinessRule(BusinessRule::UnknownAffiliation(_)))
    ));
}

// ── Notifications ───────────────────────────────────────────

#[tokio::test]
async fn gate_events_are_broadcast() {
    let f = fixture(FacilityCapacity::new(1, 0), dec!(2.00));
    let mut rx = f.engine.notify.subscribe(f.facility_id);

    let t = f
        .engine
        .register_entry(entry(f.facility_id, VehicleClass::TwoWheeler, "BR01N0001", T0))
        .await
        .unwrap();
    assert_eq!(
        rx.recv().await.unwrap(),
        OccupancyEvent::Admitted {
            ticket_id: t.id,
            class: VehicleClass::TwoWheeler
        }
    );

    assert_err!(
        f.engine
            .register_entry(entry(f.facility_id, VehicleClass::TwoWheeler, "BR01N0002", T0))
            .await
    );
    assert_eq!(
        rx.recv().await.unwrap(),
        OccupancyEvent::Rejected {
            class: VehicleClass::TwoWheeler,
            plate: "BR01N0002".into()
        }
    );

    f.engine.register_exit(t.id, exit(T0 + 30 * M)).await.unwrap();
    assert_eq!(
        rx.recv().await.unwrap(),
        OccupancyEvent::Released {
            ticket_id: t.id,
            class: VehicleClass::TwoWheeler,
            amount: dec!(1.00)
        }
    );
}

// ── Capacity changes and surcharges ─────────────────────────

#[tokio::test]
async fn capacity_cut_blocks_new_entries_until_vehicles_leave() {
    let f = fixture(FacilityCapacity::new(0, 2), dec!(2.00));
    let a = f
        .engine
        .register_entry(entry(f.facility_id, VehicleClass::FourWheeler, "CAP0001", T0))
        .await
        .unwrap();
    f.engine
        .register_entry(entry(f.facility_id, VehicleClass::FourWheeler, "CAP0002", T0))
        .await
        .unwrap();

    f.engine
        .update_capacity(f.facility_id, FacilityCapacity::new(0, 1))
        .unwrap();
    let snapshot = f.engine.occupancy(f.facility_id).await.unwrap();
    let four = snapshot.class(VehicleClass::FourWheeler).unwrap();
    assert_eq!(four.free, 0);
    assert_eq!(four.occupancy_pct, dec!(200.00));

    f.engine.register_exit(a.id, exit(T0 + H)).await.unwrap();
    assert_err!(
        f.engine
            .register_entry(entry(f.facility_id, VehicleClass::FourWheeler, "CAP0003", T0 + H))
            .await
    );
}

#[tokio::test]
async fn plate_change_surcharge_uses_configured_rules() {
    let f = fixture(FacilityCapacity::new(1, 1), dec!(2.00));
    // 2024-01-15 then 2024-07-15: inside the 6..12 month window.
    let request = PlateChangeRequest {
        requested_at: 1_721_001_600_000,
        previous_change_at: Some(1_705_276_800_000),
        rejected_at: Vec::new(),
    };
    let charge = f.engine.plate_change_surcharge(&request).unwrap();
    assert_eq!(charge.amount(), dec!(25.00));
    assert_eq!(charge.code(), Some(ChargeCode::PlateChange));

    let first_change = PlateChangeRequest {
        previous_change_at: None,
        ..request
    };
    assert!(f.engine.plate_change_surcharge(&first_change).unwrap().is_none());
}
