use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fmt::{Display, Formatter},
};

use crate::properties::{EntityId, PropertyKey, PropertyRef};

/// One row-level insert or delete within a property table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub subject: EntityId,
    /// Property of the row. `None` in dedicated per-property tables, see
    /// [TableChange::fixed_property].
    pub property: Option<PropertyRef>,
    /// Object id for entity valued rows.
    pub object: Option<EntityId>,
}

impl FieldChange {
    pub fn new(subject: EntityId, property: Option<PropertyRef>, object: Option<EntityId>) -> Self {
        FieldChange {
            subject,
            property,
            object,
        }
    }
}

/// Changes to one property table produced by a full entity update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableChange {
    pub table: String,
    /// Set when the table stores a single property, in which case its rows carry no key.
    pub fixed_property: Option<PropertyRef>,
    pub inserts: Vec<FieldChange>,
    pub deletes: Vec<FieldChange>,
}

impl TableChange {
    pub fn new(table: &str) -> TableChange {
        TableChange {
            table: table.to_string(),
            ..Default::default()
        }
    }

    pub fn fixed(table: &str, property: PropertyRef) -> TableChange {
        TableChange {
            table: table.to_string(),
            fixed_property: Some(property),
            ..Default::default()
        }
    }

    pub fn insert(mut self, change: FieldChange) -> TableChange {
        self.inserts.push(change);
        self
    }

    pub fn delete(mut self, change: FieldChange) -> TableChange {
        self.deletes.push(change);
        self
    }

    /// Property of a row, falling back to the table's fixed property.
    pub fn property_of<'a>(&'a self, change: &'a FieldChange) -> Option<&'a PropertyRef> {
        change.property.as_ref().or(self.fixed_property.as_ref())
    }

    pub fn changes(&self) -> impl Iterator<Item = &FieldChange> + '_ {
        self.inserts.iter().chain(self.deletes.iter())
    }
}

/// All table level changes caused by updating one entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeDiff {
    pub subject: EntityId,
    pub tables: Vec<TableChange>,
}

impl ChangeDiff {
    pub fn new(subject: EntityId) -> ChangeDiff {
        ChangeDiff {
            subject,
            tables: Vec::default(),
        }
    }

    pub fn with_table(mut self, table: TableChange) -> ChangeDiff {
        self.tables.push(table);
        self
    }

    /// Every subject and object id touched by an insert or delete.
    pub fn touched_ids(&self) -> BTreeSet<EntityId> {
        let mut ids = BTreeSet::new();
        for change in self.tables.iter().flat_map(|t| t.changes()) {
            ids.insert(change.subject);
            if let Some(object) = change.object {
                ids.insert(object);
            }
        }
        ids
    }

    /// Object ids of deleted rows of `property`.
    pub fn deleted_objects(&self, property: &PropertyKey) -> BTreeSet<EntityId> {
        self.tables
            .iter()
            .flat_map(|table| {
                table
                    .deletes
                    .iter()
                    .filter(move |change| {
                        table
                            .property_of(change)
                            .is_some_and(|p| &p.key == property)
                    })
                    .filter_map(|change| change.object)
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tables
            .iter()
            .all(|t| t.inserts.is_empty() && t.deletes.is_empty())
    }
}

/// Output of the engine towards the cache eviction collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvalidationEvent {
    /// Entities whose change must evict every cached rendering depending on them.
    Triggers(BTreeSet<EntityId>),
    /// Query instances whose dependency edges were removed.
    InstancesRemoved(BTreeSet<EntityId>),
}

impl Display for InvalidationEvent {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            InvalidationEvent::Triggers(ids) => write!(f, "Triggers({})", ids.len()),
            InvalidationEvent::InstancesRemoved(ids) => {
                write!(f, "InstancesRemoved({})", ids.len())
            }
        }
    }
}
