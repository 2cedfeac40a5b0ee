//! `canopy-ingest` binary.
//!
//! Reads `CANOPY_*` environment variables (e.g. `CANOPY_RELAY_URL`,
//! `CANOPY_COLLECTIONS`, `CANOPY_CHECKPOINT_PATH`), mirrors every routed
//! collection into an in-memory record store, and runs until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use canopy_connectors::ConnectorConfig;
use canopy_ingest::{IngestConfig, Orchestrator, StoreHandler};
use canopy_storage::{FileCheckpointStore, MemoryRecordStore};
use tracing::{info, warn};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let properties = ConnectorConfig::from_env_vars("firehose", "CANOPY_", std::env::vars());
    info!(
        connector = properties.connector_type(),
        keys = properties.properties().len(),
        "loaded configuration from environment"
    );
    let config = IngestConfig::from_config(&properties)?;

    let checkpoints = Arc::new(FileCheckpointStore::new(config.checkpoint_path.clone()));
    let records = Arc::new(MemoryRecordStore::new());
    let collections = config.collections.clone();

    let mut orchestrator = Orchestrator::new(config, checkpoints);
    for collection in collections {
        orchestrator
            .register_handler(collection, Arc::new(StoreHandler::new(Arc::clone(&records))))?;
    }

    let stats = orchestrator.stats();
    let reporter = tokio::spawn({
        let records = Arc::clone(&records);
        async move {
            let mut ticker = tokio::time::interval(STATS_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let snapshot = stats.stats();
                info!(
                    state = %snapshot.state,
                    cursor = ?snapshot.cursor,
                    commits = snapshot.counters.commits,
                    events = snapshot.counters.events,
                    errors = snapshot.counters.errors,
                    decode_errors = snapshot.counters.decode_errors,
                    lag_ms = ?snapshot.last_processed.map(|last| last.lag_ms),
                    records = records.len(),
                    "ingest stats"
                );
            }
        }
    });

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    let result = orchestrator.run(shutdown).await;
    reporter.abort();
    info!(records = records.len(), "exiting");
    result?;
    Ok(())
}
