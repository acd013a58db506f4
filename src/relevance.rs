use std::collections::BTreeSet;

use crate::{config::DependencyConfig, event::ChangeDiff, properties::{EntityId, PropertyKey}};

/// Reduces a [ChangeDiff] to the ids whose change should invalidate dependent query results.
///
/// Changes to exempted (bookkeeping) properties are dropped along with their subject. Affiliate
/// properties are applied afterwards and re-add their subject, so a property can be exempted as a
/// target while still flagging the entity it describes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelevanceFilter {
    exemptions: BTreeSet<PropertyKey>,
    affiliates: BTreeSet<PropertyKey>,
}

impl RelevanceFilter {
    pub fn new(exemptions: BTreeSet<PropertyKey>, affiliates: BTreeSet<PropertyKey>) -> Self {
        RelevanceFilter {
            exemptions,
            affiliates,
        }
    }

    pub fn from_config(config: &DependencyConfig) -> Self {
        RelevanceFilter::new(config.exemptions.clone(), config.affiliates.clone())
    }

    pub fn filter(&self, diff: &ChangeDiff) -> BTreeSet<EntityId> {
        let mut triggers = diff.touched_ids();
        let mut affiliated = BTreeSet::new();

        for table in diff.tables.iter() {
            for change in table.changes() {
                let Some(property) = table.property_of(change) else {
                    continue;
                };
                if self.exemptions.contains(&property.key) {
                    triggers.remove(&property.id);
                    triggers.remove(&change.subject);
                }
                if self.affiliates.contains(&property.key) && change.subject.is_valid() {
                    affiliated.insert(change.subject);
                }
            }
        }

        triggers.extend(affiliated);
        tracing::debug!(
            "[RelevanceFilter.filter] {} of {} touched ids are triggers",
            triggers.len(),
            diff.touched_ids().len()
        );
        triggers
    }
}
