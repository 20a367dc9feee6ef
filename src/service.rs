//! Startup wiring: open the record store, build the engine from the facility
//! file, reconcile counters and start background tasks.

use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::BuildError;
use thiserror::Error;
use tracing::info;

use crate::billing::ChargeRules;
use crate::config::{Config, ConfigError, FacilityFile};
use crate::counter::CounterStore;
use crate::engine::{Engine, EngineSettings};
use crate::error::ParkError;
use crate::notify::NotifyHub;
use crate::observability;
use crate::reaper;
use crate::store::WalRecordStore;

const COMPACTION_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Park(#[from] ParkError),
    #[error("metrics exporter: {0}")]
    Metrics(#[from] BuildError),
}

/// A running engine together with the durable store behind it.
pub struct ParkingService {
    pub engine: Arc<Engine>,
    pub store: Arc<WalRecordStore>,
}

impl ParkingService {
    /// Install logging and, when a port is configured, the Prometheus endpoint;
    /// then load the facility file named by the config (an empty one if unset) and start.
    pub async fn start_from_config(
        config: &Config,
        counters: Arc<dyn CounterStore>,
    ) -> Result<Self, StartupError> {
        observability::init_tracing();
        observability::init(config.metrics_port)?;
        let facilities = match &config.facilities_file {
            Some(path) => FacilityFile::load(path)?,
            None => FacilityFile::default(),
        };
        Self::start(config, facilities, counters).await
    }

    /// Counters are reconciled from the open tickets before this returns, so
    /// the engine is safe to admit traffic immediately.
    pub async fn start(
        config: &Config,
        facilities: FacilityFile,
        counters: Arc<dyn CounterStore>,
    ) -> Result<Self, StartupError> {
        std::fs::create_dir_all(&config.data_dir)?;
        let store = Arc::new(WalRecordStore::open(&config.wal_path())?);

        let settings = EngineSettings {
            counter_timeout: config.counter_timeout,
            charge_rules: ChargeRules::new(facilities.charge_rules),
            rejection_lookback_days: config.rejection_lookback_days,
        };
        let engine = Engine::new(store.clone(), counters, Arc::new(NotifyHub::new()), settings);
        for facility in facilities.facilities {
            engine.register_facility(facility.id, facility.name, facility.capacity, facility.hourly_rate)?;
        }
        for affiliation in facilities.affiliations {
            engine.register_affiliation(affiliation)?;
        }
        engine.reconcile_all().await?;

        let compactor_store = store.clone();
        let threshold = config.compact_threshold;
        tokio::spawn(async move {
            reaper::run_compactor(compactor_store, threshold, COMPACTION_CHECK_INTERVAL).await;
        });

        info!(
            data_dir = %config.data_dir.display(),
            facilities = engine.facility_ids().len(),
            "parking service started"
        );
        Ok(Self {
            engine: Arc::new(engine),
            store,
        })
    }
}
