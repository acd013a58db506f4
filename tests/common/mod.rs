//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use querydeps::{
    clock::ManualClock,
    config::DependencyConfig,
    db::{db_init, DbConnection, DEPENDENCY_DB},
    event::InvalidationEvent,
    updater::DependencyUpdater,
};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

/// Start of the manual clock used by integration tests (unix millis).
#[allow(dead_code)]
pub const T0: i64 = 1_700_000_000_000;

/// Initialize tracing for tests, respecting RUST_LOG env var.
///
/// Safe to call multiple times, subsequent calls are no-ops.
#[allow(dead_code)]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// Everything an integration test needs: a file backed database in a temp dir, an updater running
/// its worker, the invalidation event stream and the clock driving it.
#[allow(dead_code)]
pub struct Harness {
    pub temp_dir: TempDir,
    pub db: DbConnection,
    pub clock: Arc<ManualClock>,
    pub updater: DependencyUpdater<DbConnection>,
    pub events: UnboundedReceiver<InvalidationEvent>,
}

#[allow(dead_code)]
pub async fn harness(config: DependencyConfig) -> Harness {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    let db = DbConnection(db_init(temp_dir.path().join(DEPENDENCY_DB)).await.unwrap());
    let clock = Arc::new(ManualClock::new(T0));
    let (updater, events) = DependencyUpdater::new(config, db.clone(), db.clone(), clock.clone());
    Harness {
        temp_dir,
        db,
        clock,
        updater,
        events,
    }
}

/// Drain every event currently queued.
#[allow(dead_code)]
pub fn drain_events(events: &mut UnboundedReceiver<InvalidationEvent>) -> Vec<InvalidationEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}
