//! Computes the set of entities an embedded query depends on.
//!
//! The dependency set of a query is the union of:
//! - the owner entity,
//! - every entity named by its description, with category and property hierarchies expanded to
//!   their full closure and concepts expanded to their stored conditions,
//! - every entity named by a print request,
//! - every subject of a realized result row,
//! - every entity the presentation layer recorded in the late retrieval sink while rendering.

use std::collections::{BTreeSet, HashSet};

use crate::{
    error::QueryDepsError,
    properties::{EntityRef, PropertyKey},
    query::{ConditionParser, Description, PrintRequest, QueryResult},
    registry::{EntityRegistry, HierarchyKind},
};

#[derive(Debug, Default)]
struct DependencyWalk {
    deps: BTreeSet<EntityRef>,
    /// Hash keys of hierarchy nodes already expanded.
    visited: HashSet<String>,
    /// Hash keys of concepts already expanded.
    concepts: HashSet<String>,
}

pub struct DependencyResolver<'a, R: EntityRegistry> {
    registry: &'a R,
    exemptions: &'a BTreeSet<PropertyKey>,
    parser: ConditionParser,
}

impl<'a, R: EntityRegistry> DependencyResolver<'a, R> {
    pub fn new(registry: &'a R, exemptions: &'a BTreeSet<PropertyKey>) -> Self {
        DependencyResolver {
            registry,
            exemptions,
            parser: ConditionParser,
        }
    }

    /// Dependencies of an answered query. Untracked queries (no owner, or a zero limit) have
    /// none. Drains the late retrieval sink for this query in either case.
    #[tracing::instrument(skip_all, fields(fingerprint = %result.fingerprint()))]
    pub async fn resolve(&self, result: &QueryResult) -> Result<BTreeSet<EntityRef>, QueryDepsError> {
        let late = result.drain_late_retrievals();
        let query = result.query();
        let Some(owner) = query.owner.as_ref().filter(|_| query.limit > 0) else {
            return Ok(BTreeSet::new());
        };

        let mut walk = DependencyWalk::default();
        walk.deps.insert(owner.clone());
        self.walk_description(&query.description, &mut walk).await?;

        for printout in query.printouts.iter() {
            match printout {
                PrintRequest::This => {}
                PrintRequest::Property(key) => {
                    walk.deps.insert(key.to_entity());
                }
                PrintRequest::Page(entity) => {
                    walk.deps.insert(entity.clone());
                }
            }
        }

        walk.deps
            .extend(result.rows().map(|row| row.subject.clone()));

        if !late.is_empty() {
            tracing::debug!(
                "[DependencyResolver.resolve] {} late retrieved entities",
                late.len()
            );
        }
        walk.deps.extend(late);

        Ok(walk.deps)
    }

    /// Dependencies named by a description alone.
    pub async fn resolve_description(
        &self,
        description: &Description,
    ) -> Result<BTreeSet<EntityRef>, QueryDepsError> {
        let mut walk = DependencyWalk::default();
        self.walk_description(description, &mut walk).await?;
        Ok(walk.deps)
    }

    async fn walk_description(
        &self,
        description: &Description,
        walk: &mut DependencyWalk,
    ) -> Result<(), QueryDepsError> {
        let mut stack = vec![description.clone()];
        while let Some(desc) = stack.pop() {
            match desc {
                Description::Thing => {}
                Description::Value(entity) => {
                    walk.deps.insert(entity);
                }
                Description::Class(categories) => {
                    for category in categories {
                        self.expand_hierarchy(category, HierarchyKind::Subcategory, walk)
                            .await?;
                    }
                }
                Description::SomeProperty { property, inner } => {
                    stack.push(*inner);
                    self.expand_hierarchy(property.to_entity(), HierarchyKind::Subproperty, walk)
                        .await?;
                }
                Description::Conjunction(parts) | Description::Disjunction(parts) => {
                    stack.extend(parts);
                }
                Description::Concept(concept) => {
                    walk.deps.insert(concept.clone());
                    if !walk.concepts.insert(concept.hash_key()) {
                        continue;
                    }
                    if let Some(expanded) = self.concept_description(&concept).await? {
                        stack.push(expanded);
                    }
                }
            }
        }
        Ok(())
    }

    /// A missing or unparsable concept expands to nothing.
    async fn concept_description(
        &self,
        concept: &EntityRef,
    ) -> Result<Option<Description>, QueryDepsError> {
        let Some(text) = self.registry.concept_query_of(concept).await? else {
            tracing::debug!(
                "[DependencyResolver.concept_description] {} has no stored query",
                concept
            );
            return Ok(None);
        };
        match self.parser.parse(&text) {
            Ok(description) => Ok(Some(description)),
            Err(e) => {
                tracing::warn!(
                    "[DependencyResolver.concept_description] ignoring query of {}: {}",
                    concept,
                    e
                );
                Ok(None)
            }
        }
    }

    /// Add `root` and everything below it in the `kind` hierarchy. Each node is expanded once, so
    /// cyclic hierarchies terminate.
    async fn expand_hierarchy(
        &self,
        root: EntityRef,
        kind: HierarchyKind,
        walk: &mut DependencyWalk,
    ) -> Result<(), QueryDepsError> {
        let mut queue = vec![root];
        while let Some(entity) = queue.pop() {
            if !walk.visited.insert(entity.hash_key()) {
                continue;
            }
            let children = match kind {
                HierarchyKind::Subcategory => self.registry.subcategories_of(&entity).await?,
                HierarchyKind::Subproperty => self.registry.subproperties_of(&entity).await?,
            };
            walk.deps.insert(entity);
            for child in children {
                if kind == HierarchyKind::Subproperty
                    && self.exemptions.contains(&PropertyKey::new(&child.key))
                {
                    continue;
                }
                queue.push(child);
            }
        }
        Ok(())
    }
}
