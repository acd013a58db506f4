//! The storage side collaborator of the dependency engine.
//!
//! [EntityRegistry] is everything the engine needs from the store that answers queries: stable
//! ids, category/property hierarchies, stored concept queries, "touched" timestamps and which
//! query instances are annotated on which owner.
//! [MemoryRegistry] is a complete in-memory implementation; [crate::db::DbConnection] is the
//! SQLite backed one.

use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    sync::Arc,
};

use parking_lot::RwLock;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};

use crate::{
    error::QueryDepsError,
    properties::{EntityId, EntityRef},
};

/// Kind of a registered hierarchy edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HierarchyKind {
    Subcategory,
    Subproperty,
}

impl HierarchyKind {
    pub fn as_i64(&self) -> i64 {
        match self {
            HierarchyKind::Subcategory => 0,
            HierarchyKind::Subproperty => 1,
        }
    }
}

pub trait EntityRegistry: Sync {
    /// Map an entity to its id. With `auto_create` an unknown entity is assigned a fresh id,
    /// otherwise `None` is returned.
    fn resolve_id(
        &self,
        entity: &EntityRef,
        auto_create: bool,
    ) -> impl Future<Output = Result<Option<EntityId>, QueryDepsError>> + Send;

    /// Batched reverse lookup. Unknown ids are absent from the returned map.
    fn entities_by_id(
        &self,
        ids: &[EntityId],
    ) -> impl Future<Output = Result<BTreeMap<EntityId, EntityRef>, QueryDepsError>> + Send;

    /// Direct subcategories of `category`.
    fn subcategories_of(
        &self,
        category: &EntityRef,
    ) -> impl Future<Output = Result<Vec<EntityRef>, QueryDepsError>> + Send;

    /// Direct subproperties of `property`.
    fn subproperties_of(
        &self,
        property: &EntityRef,
    ) -> impl Future<Output = Result<Vec<EntityRef>, QueryDepsError>> + Send;

    /// The stored condition string of a concept, if any.
    fn concept_query_of(
        &self,
        concept: &EntityRef,
    ) -> impl Future<Output = Result<Option<String>, QueryDepsError>> + Send;

    /// Unix millis of the last change to `id`.
    fn touched_of(
        &self,
        id: EntityId,
    ) -> impl Future<Output = Result<Option<i64>, QueryDepsError>> + Send;

    /// Batched [EntityRegistry::touched_of]. Unknown ids are absent from the returned map.
    fn touched_by_id(
        &self,
        ids: &[EntityId],
    ) -> impl Future<Output = Result<BTreeMap<EntityId, i64>, QueryDepsError>> + Send;

    /// Query instances annotated on `page` or one of its subobjects.
    fn query_instances_of(
        &self,
        page: &EntityRef,
    ) -> impl Future<Output = Result<Vec<EntityId>, QueryDepsError>> + Send;

    /// The subset of `ids` still annotated as an embedded query of some owner.
    fn annotated_instances(
        &self,
        ids: &[EntityId],
    ) -> impl Future<Output = Result<BTreeSet<EntityId>, QueryDepsError>> + Send;

    fn touch(
        &self,
        ids: &[EntityId],
        at: i64,
    ) -> impl Future<Output = Result<(), QueryDepsError>> + Send;
}

#[derive(Debug, Default)]
struct RegistryState {
    ids: BTreeMap<EntityRef, EntityId>,
    refs: BTreeMap<EntityId, EntityRef>,
    last_id: i64,
    touched: BTreeMap<EntityId, i64>,
    hierarchy: DiGraphMap<EntityId, HierarchyKind>,
    concepts: BTreeMap<EntityId, String>,
    /// `(owner, query instance)` pairs.
    annotations: BTreeSet<(EntityId, EntityId)>,
}

impl RegistryState {
    fn get_or_insert(&mut self, entity: &EntityRef) -> EntityId {
        if let Some(id) = self.ids.get(entity) {
            return *id;
        }
        self.last_id += 1;
        let id = EntityId(self.last_id);
        self.ids.insert(entity.clone(), id);
        self.refs.insert(id, entity.clone());
        id
    }

    fn children_of(&self, parent: &EntityRef, kind: HierarchyKind) -> Vec<EntityRef> {
        let Some(parent_id) = self.ids.get(parent) else {
            return Vec::new();
        };
        if !self.hierarchy.contains_node(*parent_id) {
            return Vec::new();
        }
        self.hierarchy
            .edges(*parent_id)
            .filter(|(_, _, k)| **k == kind)
            .filter_map(|(_, child, _)| self.refs.get(&child).cloned())
            .collect()
    }
}

/// In-memory [EntityRegistry]. Clones share state.
#[derive(Debug, Default, Clone)]
pub struct MemoryRegistry(Arc<RwLock<RegistryState>>);

impl MemoryRegistry {
    pub fn new() -> MemoryRegistry {
        MemoryRegistry::default()
    }

    /// Register an entity (idempotent) and return its id.
    pub fn insert(&self, entity: &EntityRef) -> EntityId {
        self.0.write().get_or_insert(entity)
    }

    pub fn id_of(&self, entity: &EntityRef) -> Option<EntityId> {
        self.0.read().ids.get(entity).copied()
    }

    /// Dispose of an entity. Its id is never reused.
    pub fn remove(&self, entity: &EntityRef) -> Option<EntityId> {
        let mut state = self.0.write();
        let id = state.ids.remove(entity)?;
        state.refs.remove(&id);
        state.touched.remove(&id);
        state.concepts.remove(&id);
        state.hierarchy.remove_node(id);
        state
            .annotations
            .retain(|(owner, query)| *owner != id && *query != id);
        Some(id)
    }

    /// Record that `owner` embeds the query instance `query`.
    pub fn annotate_query(&self, owner: EntityId, query: EntityId) {
        self.0.write().annotations.insert((owner, query));
    }

    pub fn remove_annotation(&self, owner: EntityId, query: EntityId) {
        self.0.write().annotations.remove(&(owner, query));
    }

    pub fn add_hierarchy(&self, parent: &EntityRef, child: &EntityRef, kind: HierarchyKind) {
        let mut state = self.0.write();
        let parent_id = state.get_or_insert(parent);
        let child_id = state.get_or_insert(child);
        state.hierarchy.add_edge(parent_id, child_id, kind);
    }

    pub fn add_subcategory(&self, parent: &EntityRef, child: &EntityRef) {
        self.add_hierarchy(parent, child, HierarchyKind::Subcategory)
    }

    pub fn add_subproperty(&self, parent: &EntityRef, child: &EntityRef) {
        self.add_hierarchy(parent, child, HierarchyKind::Subproperty)
    }

    pub fn set_concept(&self, concept: &EntityRef, query: &str) {
        let mut state = self.0.write();
        let id = state.get_or_insert(concept);
        state.concepts.insert(id, query.to_string());
    }

    pub fn set_touched(&self, entity: &EntityRef, at: i64) -> EntityId {
        let mut state = self.0.write();
        let id = state.get_or_insert(entity);
        state.touched.insert(id, at);
        id
    }

    pub fn len(&self) -> usize {
        self.0.read().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EntityRegistry for MemoryRegistry {
    async fn resolve_id(
        &self,
        entity: &EntityRef,
        auto_create: bool,
    ) -> Result<Option<EntityId>, QueryDepsError> {
        if auto_create {
            return Ok(Some(self.insert(entity)));
        }
        Ok(self.id_of(entity))
    }

    async fn entities_by_id(
        &self,
        ids: &[EntityId],
    ) -> Result<BTreeMap<EntityId, EntityRef>, QueryDepsError> {
        let state = self.0.read();
        Ok(ids
            .iter()
            .filter_map(|id| state.refs.get(id).map(|entity| (*id, entity.clone())))
            .collect())
    }

    async fn subcategories_of(
        &self,
        category: &EntityRef,
    ) -> Result<Vec<EntityRef>, QueryDepsError> {
        Ok(self
            .0
            .read()
            .children_of(category, HierarchyKind::Subcategory))
    }

    async fn subproperties_of(
        &self,
        property: &EntityRef,
    ) -> Result<Vec<EntityRef>, QueryDepsError> {
        Ok(self
            .0
            .read()
            .children_of(property, HierarchyKind::Subproperty))
    }

    async fn concept_query_of(
        &self,
        concept: &EntityRef,
    ) -> Result<Option<String>, QueryDepsError> {
        let state = self.0.read();
        Ok(state
            .ids
            .get(concept)
            .and_then(|id| state.concepts.get(id))
            .cloned())
    }

    async fn touched_of(&self, id: EntityId) -> Result<Option<i64>, QueryDepsError> {
        Ok(self.0.read().touched.get(&id).copied())
    }

    async fn touched_by_id(
        &self,
        ids: &[EntityId],
    ) -> Result<BTreeMap<EntityId, i64>, QueryDepsError> {
        let state = self.0.read();
        Ok(ids
            .iter()
            .filter_map(|id| state.touched.get(id).map(|at| (*id, *at)))
            .collect())
    }

    async fn query_instances_of(&self, page: &EntityRef) -> Result<Vec<EntityId>, QueryDepsError> {
        let page = page.page_ref();
        let state = self.0.read();
        let instances: BTreeSet<EntityId> = state
            .annotations
            .iter()
            .filter(|(owner, _)| {
                state
                    .refs
                    .get(owner)
                    .is_some_and(|entity| entity.page_ref() == page)
            })
            .map(|(_, query)| *query)
            .collect();
        Ok(instances.into_iter().collect())
    }

    async fn annotated_instances(
        &self,
        ids: &[EntityId],
    ) -> Result<BTreeSet<EntityId>, QueryDepsError> {
        let state = self.0.read();
        Ok(state
            .annotations
            .iter()
            .map(|(_, query)| *query)
            .filter(|query| ids.contains(query))
            .collect())
    }

    async fn touch(&self, ids: &[EntityId], at: i64) -> Result<(), QueryDepsError> {
        let mut state = self.0.write();
        let known: Vec<EntityId> = ids
            .iter()
            .filter(|id| state.refs.contains_key(*id))
            .copied()
            .collect();
        for id in known {
            state.touched.insert(id, at);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test(tokio::test)]
    async fn test_resolve_without_auto_create() {
        let registry = MemoryRegistry::new();
        let page = EntityRef::page("Wonderland");
        assert_eq!(registry.resolve_id(&page, false).await.unwrap(), None);

        let id = registry.resolve_id(&page, true).await.unwrap();
        assert!(id.is_some_and(|id| id.is_valid()));
        assert_eq!(registry.resolve_id(&page, false).await.unwrap(), id);
        assert_eq!(registry.len(), 1);
    }

    #[test(tokio::test)]
    async fn test_hierarchy_kinds_are_separate() {
        let registry = MemoryRegistry::new();
        let places = EntityRef::category("Places");
        let towns = EntityRef::category("Towns");
        registry.add_subcategory(&places, &towns);

        let located = EntityRef::property("LocatedIn");
        let city_of = EntityRef::property("CityOf");
        registry.add_subproperty(&located, &city_of);

        assert_eq!(registry.subcategories_of(&places).await.unwrap(), vec![towns]);
        assert!(registry.subproperties_of(&places).await.unwrap().is_empty());
        assert_eq!(
            registry.subproperties_of(&located).await.unwrap(),
            vec![city_of]
        );
        assert!(registry
            .subcategories_of(&EntityRef::category("Unknown"))
            .await
            .unwrap()
            .is_empty());
    }

    #[test(tokio::test)]
    async fn test_remove_and_touch() {
        let registry = MemoryRegistry::new();
        let page = EntityRef::page("Alice");
        let id = registry.set_touched(&page, 10);
        assert_eq!(registry.touched_of(id).await.unwrap(), Some(10));

        registry.touch(&[id, EntityId(999)], 20).await.unwrap();
        assert_eq!(registry.touched_of(id).await.unwrap(), Some(20));
        assert_eq!(registry.touched_of(EntityId(999)).await.unwrap(), None);

        assert_eq!(
            registry.touched_by_id(&[id, EntityId(999)]).await.unwrap(),
            BTreeMap::from([(id, 20)])
        );

        assert_eq!(registry.remove(&page), Some(id));
        assert!(registry.entities_by_id(&[id]).await.unwrap().is_empty());
        // ids are not reused
        assert_ne!(registry.insert(&page), id);
    }

    #[test(tokio::test)]
    async fn test_annotations_follow_owner_page() {
        let registry = MemoryRegistry::new();
        let owner = EntityRef::page("P");
        let section = owner.with_subobject("intro");
        let owner_id = registry.insert(&owner);
        let section_id = registry.insert(&section);
        let q1 = registry.insert(&owner.with_subobject("_QUERYa"));
        let q2 = registry.insert(&owner.with_subobject("_QUERYb"));
        registry.annotate_query(owner_id, q1);
        registry.annotate_query(section_id, q2);

        assert_eq!(registry.query_instances_of(&owner).await.unwrap(), vec![q1, q2]);
        assert_eq!(
            registry.query_instances_of(&section).await.unwrap(),
            vec![q1, q2]
        );
        assert!(registry
            .query_instances_of(&EntityRef::page("Other"))
            .await
            .unwrap()
            .is_empty());

        registry.remove_annotation(owner_id, q1);
        assert_eq!(
            registry.annotated_instances(&[q1, q2]).await.unwrap(),
            BTreeSet::from([q2])
        );
        registry.remove(&section);
        assert!(registry.annotated_instances(&[q2]).await.unwrap().is_empty());
    }
}
