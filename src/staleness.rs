use crate::{
    error::QueryDepsError,
    links::DependencyLinkStore,
    properties::{EntityId, EntityRef},
    registry::EntityRegistry,
};

/// Heuristic staleness check for the cached rendering of a page.
///
/// A page is archaic when any dependency of one of its embedded queries was touched after the
/// latest of those queries was evaluated. This over-approximates: a dependency change does not
/// mean the query answer changed.
#[derive(Debug, Clone)]
pub struct StalenessValidator<R: EntityRegistry> {
    links: DependencyLinkStore,
    registry: R,
    enabled: bool,
}

impl<R: EntityRegistry> StalenessValidator<R> {
    pub fn new(links: DependencyLinkStore, registry: R, enabled: bool) -> StalenessValidator<R> {
        StalenessValidator {
            links,
            registry,
            enabled,
        }
    }

    /// Three batched lookups: the embedded queries of `subject` and their evaluation times, the
    /// dependencies of those queries, and the touched times of the dependencies.
    #[tracing::instrument(skip(self))]
    pub async fn is_archaic(&self, subject: &EntityRef) -> Result<bool, QueryDepsError> {
        if !self.enabled {
            return Ok(false);
        }

        let instances = self.registry.query_instances_of(subject).await?;
        if instances.is_empty() {
            return Ok(false);
        }
        // A query never evaluated counts as evaluated at the epoch.
        let evaluated = self
            .registry
            .touched_by_id(&instances)
            .await?
            .into_values()
            .max()
            .unwrap_or(0);

        let targets: Vec<EntityId> = self.links.targets_of(&instances).await?.into_iter().collect();
        let touched = self.registry.touched_by_id(&targets).await?;
        if let Some((id, at)) = touched.iter().find(|(_, at)| **at > evaluated) {
            tracing::debug!(
                "[StalenessValidator.is_archaic] {} depends on {}, touched at {} after {}",
                subject,
                id,
                at,
                evaluated
            );
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{db_init_memory, DbConnection},
        registry::MemoryRegistry,
    };
    use test_log::test;

    #[test(tokio::test)]
    async fn test_newer_dependency_is_archaic() {
        let db = DbConnection(db_init_memory().await.unwrap());
        let page = EntityRef::page("P");
        let instance = page.with_subobject("_QUERY0123");
        let wonderland = EntityRef::page("Wonderland");
        let page_id = db.resolve_id(&page, true).await.unwrap().unwrap();
        let instance_id = db.resolve_id(&instance, true).await.unwrap().unwrap();
        let wonderland_id = db.resolve_id(&wonderland, true).await.unwrap().unwrap();
        db.annotate_query(page_id, instance_id).await.unwrap();

        let mut links = DependencyLinkStore::new(db.clone());
        links.stage(instance_id, [page_id, wonderland_id]);
        links.flush().await.unwrap();
        db.touch(&[page_id, wonderland_id], 100).await.unwrap();
        db.touch(&[instance_id], 200).await.unwrap();

        let validator = StalenessValidator::new(links.clone(), db.clone(), true);
        assert!(!validator.is_archaic(&page).await.unwrap());

        db.touch(&[wonderland_id], 300).await.unwrap();
        assert!(validator.is_archaic(&page).await.unwrap());
        assert!(!StalenessValidator::new(links, db.clone(), false)
            .is_archaic(&page)
            .await
            .unwrap());
    }

    #[test(tokio::test)]
    async fn test_page_without_queries_is_not_archaic() {
        let db = DbConnection(db_init_memory().await.unwrap());
        let validator = StalenessValidator::new(DependencyLinkStore::new(db.clone()), db, true);
        assert!(!validator
            .is_archaic(&EntityRef::page("Nothing"))
            .await
            .unwrap());
    }

    #[test(tokio::test)]
    async fn test_timestamps_come_from_the_registry() {
        // the edge table lives in SQLite, every entity fact in the registry
        let links = DependencyLinkStore::new(DbConnection(db_init_memory().await.unwrap()));
        let registry = MemoryRegistry::new();
        let page = EntityRef::page("P");
        let page_id = registry.insert(&page);
        let instance = page.with_subobject("_QUERY0123");
        let wonderland = EntityRef::page("Wonderland");
        let instance_id = registry.insert(&instance);
        let wonderland_id = registry.insert(&wonderland);
        registry.annotate_query(page_id, instance_id);

        let mut writer = links.clone();
        writer.stage(instance_id, [page_id, wonderland_id]);
        writer.flush().await.unwrap();
        registry.set_touched(&wonderland, 100);
        registry.set_touched(&instance, 200);

        let validator = StalenessValidator::new(links, registry.clone(), true);
        assert!(!validator.is_archaic(&page).await.unwrap());
        registry.set_touched(&wonderland, 300);
        assert!(validator.is_archaic(&page).await.unwrap());
    }
}
