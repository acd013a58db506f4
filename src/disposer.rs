//! Garbage collection of dependency edges that outlived their query instance or target.
//!
//! Edge ids are read from the link store in ascending batches and checked against the entity
//! registry, so the registry may live outside the edge database.

use std::collections::BTreeSet;

use sqlx::{QueryBuilder, Sqlite};

use crate::{
    db::{push_id_list, ID_CHUNK_SIZE},
    error::QueryDepsError,
    links::DependencyLinkStore,
    properties::EntityId,
    registry::EntityRegistry,
};

#[derive(Debug, Clone)]
pub struct DependencyLinksDisposer<R: EntityRegistry> {
    links: DependencyLinkStore,
    registry: R,
}

impl<R: EntityRegistry> DependencyLinksDisposer<R> {
    pub fn new(links: DependencyLinkStore, registry: R) -> DependencyLinksDisposer<R> {
        DependencyLinksDisposer { links, registry }
    }

    /// Edge owners that are no longer annotated as an embedded query of any entity.
    pub async fn find_orphaned_by_missing_instance(
        &self,
        limit: usize,
    ) -> Result<Vec<EntityId>, QueryDepsError> {
        let mut orphans = Vec::new();
        let mut after = EntityId(0);
        while orphans.len() < limit {
            let batch = self.links.instances_after(after, ID_CHUNK_SIZE).await?;
            let Some(last) = batch.last().copied() else {
                break;
            };
            let annotated = self.registry.annotated_instances(&batch).await?;
            orphans.extend(batch.into_iter().filter(|id| !annotated.contains(id)));
            after = last;
        }
        orphans.truncate(limit);
        Ok(orphans)
    }

    /// Edge owners or targets whose id is gone from the entity registry.
    pub async fn find_orphaned_by_missing_entity(
        &self,
        limit: usize,
    ) -> Result<Vec<EntityId>, QueryDepsError> {
        let mut orphans = Vec::new();
        let mut after = EntityId(0);
        while orphans.len() < limit {
            let batch = self.links.linked_ids_after(after, ID_CHUNK_SIZE).await?;
            let Some(last) = batch.last().copied() else {
                break;
            };
            let known = self.registry.entities_by_id(&batch).await?;
            orphans.extend(batch.into_iter().filter(|id| !known.contains_key(id)));
            after = last;
        }
        orphans.truncate(limit);
        Ok(orphans)
    }

    /// Both orphan kinds, deduplicated.
    pub async fn find_orphans(&self, limit: usize) -> Result<BTreeSet<EntityId>, QueryDepsError> {
        let mut orphans: BTreeSet<EntityId> = self
            .find_orphaned_by_missing_instance(limit)
            .await?
            .into_iter()
            .collect();
        orphans.extend(self.find_orphaned_by_missing_entity(limit).await?);
        Ok(orphans)
    }

    /// Delete every edge owned by or pointing at one of `ids`.
    #[tracing::instrument(skip(self))]
    pub async fn dispose(&self, ids: &[EntityId]) -> Result<u64, QueryDepsError> {
        let mut removed = 0;
        for chunk in ids.chunks(ID_CHUNK_SIZE / 2) {
            let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM query_links WHERE ");
            push_id_list(&mut qb, "s_id", chunk);
            qb.push(" OR ");
            push_id_list(&mut qb, "o_id", chunk);
            removed += qb.build().execute(&self.links.db().0).await?.rows_affected();
        }
        if removed > 0 {
            tracing::info!(
                "[DependencyLinksDisposer.dispose] removed {} edges of {} orphaned ids",
                removed,
                ids.len()
            );
        }
        Ok(removed)
    }
}
