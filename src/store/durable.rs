use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{info, warn};
use ulid::Ulid;

use crate::error::StoreError;
use crate::model::*;
use crate::wal::Wal;

use super::{InMemoryRecordStore, RecordStore};

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued (the batch window).
/// 3. One flush_sync for the whole batch.
/// 4. Apply the batch to the index, then answer every sender.
///
/// Applying inside the writer keeps the index in log order, so a compaction
/// snapshot taken here never misses a durable event.
async fn wal_writer_loop(
    mut wal: Wal,
    index: Arc<InMemoryRecordStore>,
    mut rx: mpsc::Receiver<WalCommand>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, &index, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, &index, other);
                }
            }
            other => handle_non_append(&mut wal, &index, other),
        }
    }
}

fn commit_batch(
    wal: &mut Wal,
    index: &InMemoryRecordStore,
    batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>,
) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (event, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => {
                index.apply_event(&event);
                Ok(())
            }
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even after an append error, so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, index: &InMemoryRecordStore, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { response } => {
            let events = index.snapshot_events();
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Record store persisted to a write-ahead log and served from an in-memory index.
pub struct WalRecordStore {
    index: Arc<InMemoryRecordStore>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Held across check + append in `mark_grants_settled`.
    settle_lock: Mutex<()>,
}

impl WalRecordStore {
    /// Replay the log at `path` and start its writer task. Must run inside a Tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let replay = Wal::replay(path)?;
        if replay.discarded > 0 {
            warn!(
                path = %path.display(),
                discarded = replay.discarded,
                "WAL tail was torn or corrupt, truncating"
            );
        }
        let wal = Wal::open(path, replay.valid_len)?;

        let index = Arc::new(InMemoryRecordStore::new());
        for event in &replay.events {
            index.apply_event(event);
        }
        info!(
            path = %path.display(),
            events = replay.events.len(),
            tickets = index.ticket_count(),
            "record store opened"
        );

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, index.clone(), wal_rx));

        Ok(Self {
            index,
            wal_tx,
            settle_lock: Mutex::new(()),
        })
    }

    /// Append through the group-commit writer. Returns once the event is durable and applied.
    async fn persist(&self, event: Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    /// Rewrite the log with only the events needed to recreate the current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl RecordStore for WalRecordStore {
    async fn find_open_ticket_count(
        &self,
        facility_id: Ulid,
        class: VehicleClass,
    ) -> Result<u32, StoreError> {
        Ok(self.index.open_ticket_count(facility_id, class))
    }

    async fn find_ticket(&self, id: Ulid) -> Result<Option<Ticket>, StoreError> {
        Ok(self.index.ticket(&id))
    }

    async fn save_ticket(&self, ticket: &Ticket) -> Result<(), StoreError> {
        self.persist(Event::TicketSaved { ticket: ticket.clone() }).await
    }

    async fn find_subscription_snapshot(
        &self,
        id: Ulid,
    ) -> Result<Option<SubscriptionSnapshot>, StoreError> {
        Ok(self.index.subscription(&id))
    }

    async fn save_subscription_snapshot(
        &self,
        snapshot: &SubscriptionSnapshot,
    ) -> Result<(), StoreError> {
        self.persist(Event::SubscriptionSaved { snapshot: snapshot.clone() }).await
    }

    async fn save_grant(&self, grant: &FreeHourGrant) -> Result<(), StoreError> {
        self.persist(Event::GrantRecorded { grant: grant.clone() }).await
    }

    async fn find_grants_for_ticket(&self, ticket_id: Ulid) -> Result<Vec<FreeHourGrant>, StoreError> {
        Ok(self.index.grants_for_ticket(&ticket_id))
    }

    async fn find_unsettled_grants(
        &self,
        business_id: Ulid,
        facility_id: Ulid,
        period: Span,
    ) -> Result<Vec<FreeHourGrant>, StoreError> {
        Ok(self.index.unsettled_grants(business_id, facility_id, period))
    }

    async fn mark_grants_settled(&self, ids: &[Ulid]) -> Result<(), StoreError> {
        let _guard = self.settle_lock.lock().await;
        self.index.check_settleable(ids)?;
        self.persist(Event::GrantsSettled { ids: ids.to_vec() }).await
    }

    async fn save_settlement(&self, settlement: &Settlement) -> Result<(), StoreError> {
        self.persist(Event::SettlementSaved { settlement: settlement.clone() }).await
    }

    async fn find_settlement(&self, id: Ulid) -> Result<Option<Settlement>, StoreError> {
        Ok(self.index.settlement(&id))
    }
}
