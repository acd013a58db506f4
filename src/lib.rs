//! # querydeps
//!
//! Query dependency tracking and cache invalidation for graph-structured knowledge bases.
//!
//! ## Overview
//!
//! Pages of a knowledge base embed queries whose rendered answers are cached with the page. When
//! the data those answers were computed from changes, the cached rendering goes stale. querydeps
//! records, for each embedded query, which entities its answer depends on, and turns store-wide
//! change diffs into the set of entities whose change should evict dependent renderings.
//!
//! ### Key Features
//!
//! - **Dependency resolution**: category and property hierarchies expanded to their closure,
//!   concepts expanded to their stored conditions, result rows and lazily rendered values included
//! - **Replace-on-flush edge store**: each query instance owns a complete snapshot of its edges,
//!   written in one SQLite transaction, so retries and races converge
//! - **Relevance filtering**: bookkeeping properties never trigger invalidation, affiliate
//!   properties still flag their subject
//! - **Staleness heuristics**: a page is archaic once a dependency was touched after its queries
//!   were evaluated
//! - **Garbage collection** of edges whose query instance or target is gone
//! - **Backlinks**: the queries that reference an entity, attached to its data
//!
//! ## Architecture
//!
//! - **[`resolver`]**: [`resolver::DependencyResolver`], description walk and closures
//! - **[`links`]**: [`links::DependencyLinkStore`], staged and flushed dependency edges
//! - **[`relevance`]**: [`relevance::RelevanceFilter`], change diffs to trigger ids
//! - **[`staleness`]**: [`staleness::StalenessValidator`]
//! - **[`disposer`]**: [`disposer::DependencyLinksDisposer`]
//! - **[`journal`]**: [`journal::UpdateJournal`], damping of repeated broadcasts
//! - **[`backlinks`]**: [`backlinks::BacklinksPresenter`]
//! - **[`updater`]**: [`updater::DependencyUpdater`], the entry point tying it together with a
//!   deferred worker
//! - **[`registry`]** and **[`db`]**: the entity registry collaborator, in memory and SQLite
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use querydeps::{
//!     clock::SystemClock,
//!     config::DependencyConfig,
//!     db::{db_init_memory, DbConnection},
//!     properties::EntityRef,
//!     query::{Description, LateRetrievalSink, QueryDescriptor, QueryResult, ResultRow},
//!     updater::DependencyUpdater,
//! };
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = DbConnection(db_init_memory().await?);
//!     let (updater, mut events) = DependencyUpdater::new(
//!         DependencyConfig::default(),
//!         db.clone(),
//!         db.clone(),
//!         Arc::new(SystemClock),
//!     );
//!
//!     // The query engine answered `[[LocatedIn::Wonderland]]` embedded in page "P"
//!     let query = QueryDescriptor::new(
//!         Some(EntityRef::page("P")),
//!         Description::some_property("LocatedIn", Description::Value(EntityRef::page("Wonderland"))),
//!     );
//!     let rows = vec![ResultRow::new(EntityRef::page("Alice"))];
//!     let result = QueryResult::new(query, rows, Arc::new(LateRetrievalSink::default()));
//!     updater.on_query_answered(result).await?;
//!     updater.wait_idle().await?;
//!
//!     // Later, a store update produces a change diff:
//!     // updater.on_entity_updated(&diff).await?;
//!     while let Ok(event) = events.try_recv() {
//!         println!("evict: {event}");
//!     }
//!     updater.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! [`config::DependencyConfig`] is read from the `[dependencies]` table of a TOML file through
//! [`config::TomlConfigProvider`]; every field has a default.

pub mod backlinks;
pub mod clock;
pub mod config;
pub mod db;
pub mod disposer;
pub mod error;
pub mod event;
pub mod journal;
pub mod links;
pub mod properties;
pub mod query;
pub mod registry;
pub mod relevance;
pub mod resolver;
pub mod staleness;
#[cfg(test)]
mod tests;
pub mod updater;

pub use error::*;
