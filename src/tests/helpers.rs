//! Shared test utilities for dependency tracking tests

use crate::{
    db::{db_init_memory, DbConnection},
    properties::EntityRef,
    query::{Description, LateRetrievalSink, QueryDescriptor, QueryResult, ResultRow},
    registry::MemoryRegistry,
};
use std::sync::Arc;

/// Initialize logging for tests
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// Fresh single connection in-memory database
pub async fn memory_db() -> DbConnection {
    init_logging();
    DbConnection(
        db_init_memory()
            .await
            .expect("in-memory database to initialize"),
    )
}

/// Wrap a query and its rows into an answered result with its own late retrieval sink
pub fn answered(query: QueryDescriptor, subjects: &[&str]) -> QueryResult {
    let rows = subjects
        .iter()
        .map(|subject| ResultRow::new(EntityRef::page(subject)))
        .collect();
    QueryResult::new(query, rows, Arc::new(LateRetrievalSink::default()))
}

/// `[[LocatedIn::<place>]]` embedded in `owner`
pub fn located_in(owner: &str, place: &str) -> QueryDescriptor {
    QueryDescriptor::new(
        Some(EntityRef::page(owner)),
        Description::some_property("LocatedIn", Description::Value(EntityRef::page(place))),
    )
}

/// A registry holding a small place hierarchy:
///
/// ```text
/// Category:Places
///   └── Category:Towns
///         └── Category:Villages
/// Property:LocatedIn
///   └── Property:TownOf
/// ```
pub fn places_registry() -> MemoryRegistry {
    init_logging();
    let registry = MemoryRegistry::new();
    let places = EntityRef::category("Places");
    let towns = EntityRef::category("Towns");
    let villages = EntityRef::category("Villages");
    registry.add_subcategory(&places, &towns);
    registry.add_subcategory(&towns, &villages);
    registry.add_subproperty(
        &EntityRef::property("LocatedIn"),
        &EntityRef::property("TownOf"),
    );
    for page in ["Wonderland", "Alice", "Hatter"] {
        registry.insert(&EntityRef::page(page));
    }
    registry
}
