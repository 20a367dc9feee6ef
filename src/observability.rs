use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

// ── Admission ───────────────────────────────────────────────────

/// Counter: reservation attempts. Labels: class, outcome (admitted | full | unavailable).
pub const ADMISSIONS_TOTAL: &str = "parkd_admissions_total";

/// Counter: slot releases. Labels: class, outcome (released | clamped | deferred).
pub const RELEASES_TOTAL: &str = "parkd_releases_total";

/// Counter: counter updates that failed part-way or found a negative value. Labels: class.
pub const COUNTER_DRIFT_TOTAL: &str = "parkd_counter_drift_total";

/// Gauge: occupied slots as last seen by this process. Labels: facility, class.
pub const OCCUPANCY: &str = "parkd_occupancy";

// ── Billing ─────────────────────────────────────────────────────

/// Counter: completed exits. Labels: class.
pub const EXITS_TOTAL: &str = "parkd_exits_total";

/// Histogram: amount charged per exit.
pub const EXIT_CHARGE_AMOUNT: &str = "parkd_exit_charge_amount";

/// Counter: settlements created.
pub const SETTLEMENTS_TOTAL: &str = "parkd_settlements_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "parkd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "parkd_wal_flush_batch_size";

/// Counter: WAL compactions. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "parkd_wal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Install the fmt subscriber. Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().try_init();
}
