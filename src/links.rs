//! Persistence of dependency edges `(query instance id, dependency id)`.
//!
//! Writes are buffered in a [PendingLinks] accumulator and applied by [DependencyLinkStore::flush],
//! which replaces the full edge set of each staged instance inside one transaction. Replacing
//! rather than patching keeps a flush idempotent: running it twice with the same pending set
//! yields the same rows. An instance leaves the pending set only once its transaction committed.

use std::collections::{BTreeMap, BTreeSet};

use sqlx::{QueryBuilder, Sqlite};

use crate::{
    db::{push_id_list, DbConnection, ID_CHUNK_SIZE},
    error::QueryDepsError,
    properties::{EntityId, EntityRef},
    query::{Paging, ResultsPage},
    registry::EntityRegistry,
};

/// Staged dependency sets, keyed by query instance id. Owned by whoever performs the flush, so
/// nothing leaks between independent requests or workers.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PendingLinks(BTreeMap<EntityId, BTreeSet<EntityId>>);

impl PendingLinks {
    pub fn new() -> PendingLinks {
        PendingLinks::default()
    }

    /// Union `deps` into the pending set of `instance`. Staging an empty set still marks the
    /// instance, so the next flush clears its edges.
    pub fn stage(&mut self, instance: EntityId, deps: impl IntoIterator<Item = EntityId>) {
        self.0.entry(instance).or_default().extend(deps);
    }

    pub fn get(&self, instance: &EntityId) -> Option<&BTreeSet<EntityId>> {
        self.0.get(instance)
    }

    pub fn remove(&mut self, instance: &EntityId) -> Option<BTreeSet<EntityId>> {
        self.0.remove(instance)
    }

    /// Staged instance ids, ascending.
    pub fn instances(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.0.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct DependencyLinkStore {
    db: DbConnection,
    pending: PendingLinks,
}

impl DependencyLinkStore {
    pub fn new(db: DbConnection) -> DependencyLinkStore {
        DependencyLinkStore {
            db,
            pending: PendingLinks::new(),
        }
    }

    pub fn db(&self) -> &DbConnection {
        &self.db
    }

    pub fn pending(&self) -> &PendingLinks {
        &self.pending
    }

    pub fn stage(&mut self, instance: EntityId, deps: impl IntoIterator<Item = EntityId>) {
        self.pending.stage(instance, deps);
    }

    /// Resolve `deps` through `registry` and stage the resulting ids. Entities without an id are
    /// dropped unless their namespace is auto-creatable.
    pub async fn stage_refs<R: EntityRegistry>(
        &mut self,
        instance: EntityId,
        deps: &BTreeSet<EntityRef>,
        registry: &R,
    ) -> Result<usize, QueryDepsError> {
        let mut ids = BTreeSet::new();
        for entity in deps.iter() {
            match registry
                .resolve_id(entity, entity.is_auto_creatable())
                .await?
            {
                Some(id) if id.is_valid() => {
                    ids.insert(id);
                }
                _ => {
                    tracing::debug!(
                        "[DependencyLinkStore.stage_refs] dropping unresolved dependency {}",
                        entity
                    );
                }
            }
        }
        let staged = ids.len();
        self.pending.stage(instance, ids);
        Ok(staged)
    }

    /// Replace the stored edges of every staged instance with its pending set. Returns the number
    /// of instances written.
    ///
    /// A failed instance stays pending and the remaining instances are still written. The first
    /// error is returned once every instance was attempted.
    #[tracing::instrument(skip(self))]
    pub async fn flush(&mut self) -> Result<usize, QueryDepsError> {
        let instances: Vec<EntityId> = self.pending.instances().collect();
        let mut flushed = 0;
        let mut first_error = None;
        for instance in instances.into_iter() {
            if !instance.is_valid() {
                tracing::warn!(
                    "[DependencyLinkStore.flush] skipping invalid instance id {}",
                    instance
                );
                self.pending.remove(&instance);
                continue;
            }
            let deps: Vec<EntityId> = self
                .pending
                .get(&instance)
                .map(|deps| deps.iter().copied().filter(|id| id.is_valid()).collect())
                .unwrap_or_default();

            match self.write_snapshot(instance, &deps).await {
                Ok(()) => {
                    self.pending.remove(&instance);
                    tracing::debug!(
                        "[DependencyLinkStore.flush] {} now depends on {} entities",
                        instance,
                        deps.len()
                    );
                    flushed += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        "[DependencyLinkStore.flush] keeping {} pending, write failed: {}",
                        instance,
                        e
                    );
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        if flushed > 0 {
            tracing::info!("[DependencyLinkStore.flush] flushed {} query instances", flushed);
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(flushed),
        }
    }

    /// Replace the edges of `instance` with `deps` in one transaction. Dropping the transaction
    /// on error rolls it back.
    async fn write_snapshot(
        &self,
        instance: EntityId,
        deps: &[EntityId],
    ) -> Result<(), QueryDepsError> {
        let mut tx = self.db.0.begin().await?;
        sqlx::query("DELETE FROM query_links WHERE s_id = ?")
            .bind(instance.0)
            .execute(&mut *tx)
            .await?;
        for chunk in deps.chunks(ID_CHUNK_SIZE) {
            let mut qb = QueryBuilder::<Sqlite>::new("INSERT INTO query_links (s_id, o_id) ");
            qb.push_values(chunk.iter(), |mut b, dep| {
                b.push_bind(instance.0).push_bind(dep.0);
            });
            qb.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Delete every edge owned by `instances`. Returns the number of deleted rows.
    pub async fn remove(&self, instances: &[EntityId]) -> Result<u64, QueryDepsError> {
        let mut removed = 0;
        for chunk in instances.chunks(ID_CHUNK_SIZE) {
            let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM query_links WHERE ");
            push_id_list(&mut qb, "s_id", chunk);
            removed += qb.build().execute(&self.db.0).await?.rows_affected();
        }
        Ok(removed)
    }

    pub async fn has_links(&self, instance: EntityId) -> Result<bool, QueryDepsError> {
        let found = sqlx::query_scalar::<_, i64>("SELECT 1 FROM query_links WHERE s_id = ? LIMIT 1")
            .bind(instance.0)
            .fetch_optional(&self.db.0)
            .await?;
        Ok(found.is_some())
    }

    /// Stored dependency ids of `instance`, ascending.
    pub async fn links_of(&self, instance: EntityId) -> Result<Vec<EntityId>, QueryDepsError> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT o_id FROM query_links WHERE s_id = ? ORDER BY o_id",
        )
        .bind(instance.0)
        .fetch_all(&self.db.0)
        .await?;
        Ok(ids.into_iter().map(EntityId).collect())
    }

    /// Distinct dependency ids of any of `instances`.
    pub async fn targets_of(
        &self,
        instances: &[EntityId],
    ) -> Result<BTreeSet<EntityId>, QueryDepsError> {
        let mut targets = BTreeSet::new();
        for chunk in instances.chunks(ID_CHUNK_SIZE) {
            let mut qb = QueryBuilder::<Sqlite>::new("SELECT DISTINCT o_id FROM query_links WHERE ");
            push_id_list(&mut qb, "s_id", chunk);
            let ids: Vec<i64> = qb.build_query_scalar().fetch_all(&self.db.0).await?;
            targets.extend(ids.into_iter().map(EntityId));
        }
        Ok(targets)
    }

    /// Up to `limit` distinct edge owners with an id above `after`, ascending.
    pub async fn instances_after(
        &self,
        after: EntityId,
        limit: usize,
    ) -> Result<Vec<EntityId>, QueryDepsError> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT DISTINCT s_id FROM query_links WHERE s_id > ? ORDER BY s_id LIMIT ?",
        )
        .bind(after.0)
        .bind(limit as i64)
        .fetch_all(&self.db.0)
        .await?;
        Ok(ids.into_iter().map(EntityId).collect())
    }

    /// Up to `limit` distinct ids above `after` that own an edge or are the target of one,
    /// ascending.
    pub async fn linked_ids_after(
        &self,
        after: EntityId,
        limit: usize,
    ) -> Result<Vec<EntityId>, QueryDepsError> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM ( \
               SELECT s_id AS id FROM query_links WHERE s_id > ? \
               UNION \
               SELECT o_id AS id FROM query_links WHERE o_id > ? \
             ) ORDER BY id LIMIT ?",
        )
        .bind(after.0)
        .bind(after.0)
        .bind(limit as i64)
        .fetch_all(&self.db.0)
        .await?;
        Ok(ids.into_iter().map(EntityId).collect())
    }

    /// Paged reverse lookup: distinct query instances depending on any of `targets`. `count` is
    /// the total number of such instances.
    #[tracing::instrument(skip(self))]
    pub async fn backlinks_for(
        &self,
        targets: &[EntityId],
        paging: Paging,
    ) -> Result<ResultsPage<Vec<EntityId>>, QueryDepsError> {
        if targets.is_empty() || targets.len() > ID_CHUNK_SIZE {
            if !targets.is_empty() {
                tracing::warn!(
                    "[DependencyLinkStore.backlinks_for] {} targets exceed the lookup bound of {}",
                    targets.len(),
                    ID_CHUNK_SIZE
                );
            }
            return Ok(ResultsPage {
                count: 0,
                start: paging.offset,
                results: Vec::new(),
            });
        }

        let mut count_qb =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(DISTINCT s_id) FROM query_links WHERE ");
        push_id_list(&mut count_qb, "o_id", targets);
        let count: i64 = count_qb
            .build_query_scalar()
            .fetch_one(&self.db.0)
            .await?;

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT DISTINCT s_id FROM query_links WHERE ");
        push_id_list(&mut qb, "o_id", targets);
        qb.push(" ORDER BY s_id LIMIT ");
        qb.push_bind(paging.limit as i64);
        qb.push(" OFFSET ");
        qb.push_bind(paging.offset as i64);
        let ids: Vec<i64> = qb.build_query_scalar().fetch_all(&self.db.0).await?;

        Ok(ResultsPage {
            count: count as usize,
            start: paging.offset,
            results: ids.into_iter().map(EntityId).collect(),
        })
    }
}
