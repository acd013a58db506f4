use super::helpers::*;
use crate::{
    config::DependencyConfig,
    event::{ChangeDiff, FieldChange, TableChange},
    links::DependencyLinkStore,
    properties::{EntityRef, PropertyRef, PROP_MODIFICATION_DATE},
    query::{ConditionParser, Paging, QueryDescriptor},
    registry::EntityRegistry,
    relevance::RelevanceFilter,
    resolver::DependencyResolver,
};
use std::collections::BTreeSet;
use test_log::test;

#[test(tokio::test)]
async fn test_hierarchy_closure_through_parsed_conditions() {
    let registry = places_registry();
    let config = DependencyConfig::default();
    let resolver = DependencyResolver::new(&registry, &config.exemptions);

    let description = ConditionParser
        .parse("[[Category:Places]] [[LocatedIn::Wonderland]]")
        .unwrap();
    let deps = resolver.resolve_description(&description).await.unwrap();
    assert_eq!(
        deps,
        BTreeSet::from([
            EntityRef::category("Places"),
            EntityRef::category("Towns"),
            EntityRef::category("Villages"),
            EntityRef::property("LocatedIn"),
            EntityRef::property("TownOf"),
            EntityRef::page("Wonderland"),
        ])
    );
}

#[test(tokio::test)]
async fn test_resolved_edges_answer_backlinks() {
    let registry = places_registry();
    let config = DependencyConfig::default();
    let resolver = DependencyResolver::new(&registry, &config.exemptions);
    let mut links = DependencyLinkStore::new(memory_db().await);

    let query = located_in("P", "Wonderland");
    let instance = registry
        .resolve_id(&query.instance().unwrap().entity_ref(), true)
        .await
        .unwrap()
        .unwrap();
    let result = answered(query, &["Alice", "Hatter", "Unknown"]);
    let deps = resolver.resolve(&result).await.unwrap();
    assert!(deps.contains(&EntityRef::page("Unknown")));

    // the owner "P" and "Unknown" have no id and are not auto-creatable
    assert_eq!(links.stage_refs(instance, &deps, &registry).await.unwrap(), 5);
    links.flush().await.unwrap();

    let wonderland = registry.id_of(&EntityRef::page("Wonderland")).unwrap();
    let page = links
        .backlinks_for(&[wonderland], Paging::default())
        .await
        .unwrap();
    assert_eq!(page.results, vec![instance]);
    assert_eq!(
        registry
            .entities_by_id(&page.results)
            .await
            .unwrap()
            .get(&instance)
            .map(|e| e.page_ref()),
        Some(EntityRef::page("P"))
    );
}

#[test(tokio::test)]
async fn test_bookkeeping_edit_does_not_reach_dependents() {
    let registry = places_registry();
    let filter = RelevanceFilter::from_config(&DependencyConfig::default());
    let wonderland = registry.id_of(&EntityRef::page("Wonderland")).unwrap();
    let mdat = registry.insert(&EntityRef::property(PROP_MODIFICATION_DATE));

    let diff = ChangeDiff::new(wonderland).with_table(
        TableChange::fixed("time_table", PropertyRef::new(PROP_MODIFICATION_DATE, mdat))
            .insert(FieldChange::new(wonderland, None, None)),
    );
    assert!(filter.filter(&diff).is_empty());

    let untracked = QueryDescriptor::new(None, ConditionParser.parse("[[Wonderland]]").unwrap());
    assert!(!untracked.is_tracked());
}
