use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    error::QueryDepsError,
    links::DependencyLinkStore,
    properties::{EntityId, EntityRef, PropertyKey, PROP_QUERY_REFERENCE},
    query::Paging,
    registry::EntityRegistry,
};

/// Outward facing property values of one entity, as handed to a renderer or export.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityData {
    pub subject: EntityRef,
    pub subject_id: EntityId,
    pub values: BTreeMap<PropertyKey, Vec<EntityRef>>,
}

impl EntityData {
    pub fn new(subject: EntityRef, subject_id: EntityId) -> EntityData {
        EntityData {
            subject,
            subject_id,
            values: BTreeMap::new(),
        }
    }

    pub fn values_of(&self, key: &str) -> &[EntityRef] {
        self.values
            .get(&PropertyKey::new(key))
            .map(|v| v.as_slice())
            .unwrap_or_default()
    }
}

/// Adds "referenced by query" values to an entity: the query instances whose edges point at it.
pub struct BacklinksPresenter<'a, R: EntityRegistry> {
    links: &'a DependencyLinkStore,
    registry: &'a R,
}

impl<'a, R: EntityRegistry> BacklinksPresenter<'a, R> {
    pub fn new(links: &'a DependencyLinkStore, registry: &'a R) -> Self {
        BacklinksPresenter { links, registry }
    }

    /// Inject the backlinks of `data` under [PROP_QUERY_REFERENCE]. Query instances embedded in
    /// the subject's own page are skipped. Returns the number of injected values.
    pub async fn attach_backlinks_to(
        &self,
        data: &mut EntityData,
        paging: Paging,
    ) -> Result<usize, QueryDepsError> {
        let page = self.links.backlinks_for(&[data.subject_id], paging).await?;
        if page.results.is_empty() {
            return Ok(0);
        }

        let own_page = data.subject.page_ref();
        let instances = self.registry.entities_by_id(&page.results).await?;
        let referencing: Vec<EntityRef> = page
            .results
            .iter()
            .filter_map(|id| instances.get(id))
            .filter(|instance| instance.page_ref() != own_page)
            .cloned()
            .collect();

        let injected = referencing.len();
        if injected > 0 {
            data.values
                .entry(PropertyKey::new(PROP_QUERY_REFERENCE))
                .or_default()
                .extend(referencing);
        }
        tracing::debug!(
            "[BacklinksPresenter.attach_backlinks_to] {} of {} backlinks attached to {}",
            injected,
            page.results.len(),
            data.subject
        );
        Ok(injected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{db_init_memory, DbConnection};
    use test_log::test;

    #[test(tokio::test)]
    async fn test_own_queries_are_excluded() {
        let db = DbConnection(db_init_memory().await.unwrap());
        let x = EntityRef::page("X");
        let other = EntityRef::page("Y");
        let x_id = db.resolve_id(&x, true).await.unwrap().unwrap();
        let own_query = db
            .resolve_id(&x.with_subobject("_QUERYself"), true)
            .await
            .unwrap()
            .unwrap();
        let other_query = db
            .resolve_id(&other.with_subobject("_QUERYother"), true)
            .await
            .unwrap()
            .unwrap();

        let mut links = DependencyLinkStore::new(db.clone());
        links.stage(own_query, [x_id]);
        links.stage(other_query, [x_id]);
        links.flush().await.unwrap();

        let mut data = EntityData::new(x.clone(), x_id);
        let presenter = BacklinksPresenter::new(&links, &db);
        let injected = presenter
            .attach_backlinks_to(&mut data, Paging::default())
            .await
            .unwrap();
        assert_eq!(injected, 1);
        assert_eq!(
            data.values_of(PROP_QUERY_REFERENCE),
            &[other.with_subobject("_QUERYother")]
        );
        assert!(data
            .values_of(PROP_QUERY_REFERENCE)
            .iter()
            .all(|q| q.page_ref() != x));
    }

    #[test(tokio::test)]
    async fn test_no_backlinks_leaves_data_untouched() {
        let db = DbConnection(db_init_memory().await.unwrap());
        let links = DependencyLinkStore::new(db.clone());
        let mut data = EntityData::new(EntityRef::page("Lonely"), EntityId(1));
        let presenter = BacklinksPresenter::new(&links, &db);
        assert_eq!(
            presenter
                .attach_backlinks_to(&mut data, Paging::default())
                .await
                .unwrap(),
            0
        );
        assert!(data.values.is_empty());
    }
}
