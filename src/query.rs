use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    error::QueryDepsError,
    properties::{EntityRef, Namespace, PropertyKey, QueryFingerprint, QueryInstance},
};

pub const DEFAULT_LIMIT: usize = 50;
pub const DEFAULT_OFFSET: usize = 0;

/// Condition tree of a query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Description {
    /// Matches everything, carries no dependency.
    Thing,
    /// A concrete entity value, e.g. the `Wonderland` in `[[LocatedIn::Wonderland]]`.
    Value(EntityRef),
    /// Membership in any of the listed categories.
    Class(Vec<EntityRef>),
    /// Membership in a stored concept.
    Concept(EntityRef),
    /// Entities with a value for `property` that matches `inner`.
    SomeProperty {
        property: PropertyKey,
        inner: Box<Description>,
    },
    Conjunction(Vec<Description>),
    Disjunction(Vec<Description>),
}

impl Description {
    pub fn some_property(property: &str, inner: Description) -> Description {
        Description::SomeProperty {
            property: PropertyKey::new(property),
            inner: Box::new(inner),
        }
    }
}

/// Additional values requested for each result row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrintRequest {
    /// The row subject itself (`?`).
    This,
    /// Values of a property (`?LocatedIn`).
    Property(PropertyKey),
    /// A fixed page value displayed with every row.
    Page(EntityRef),
}

/// The parsed form of one embedded query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    /// Page the query is embedded in. Pure lookups (API, special pages) have none.
    pub owner: Option<EntityRef>,
    pub description: Description,
    pub printouts: Vec<PrintRequest>,
    pub limit: usize,
    pub offset: usize,
}

impl QueryDescriptor {
    pub fn new(owner: Option<EntityRef>, description: Description) -> QueryDescriptor {
        QueryDescriptor {
            owner,
            description,
            printouts: Vec::default(),
            limit: DEFAULT_LIMIT,
            offset: DEFAULT_OFFSET,
        }
    }

    pub fn with_printouts(mut self, printouts: Vec<PrintRequest>) -> QueryDescriptor {
        self.printouts = printouts;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> QueryDescriptor {
        self.limit = limit;
        self
    }

    pub fn fingerprint(&self) -> QueryFingerprint {
        let bytes = serde_json::to_vec(&(
            &self.description,
            &self.printouts,
            self.limit,
            self.offset,
        ))
        .unwrap_or_default();
        QueryFingerprint::from_bytes(&bytes)
    }

    /// Only embedded queries that return rows are dependency tracked.
    pub fn is_tracked(&self) -> bool {
        self.owner.is_some() && self.limit > 0
    }

    pub fn instance(&self) -> Option<QueryInstance> {
        self.owner
            .as_ref()
            .map(|owner| QueryInstance::new(owner.clone(), self.fingerprint()))
    }
}

/// One realized result row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRow {
    pub subject: EntityRef,
    /// Entities shown in this row's printouts, resolved while the row is rendered.
    pub printouts: Vec<EntityRef>,
}

impl ResultRow {
    pub fn new(subject: EntityRef) -> ResultRow {
        ResultRow {
            subject,
            printouts: Vec::default(),
        }
    }
}

/// Entities touched while rendering result rows, keyed by the query that produced them. Shared by
/// the presentation layer (which collects) and the dependency resolver (which drains).
#[derive(Debug, Default)]
pub struct LateRetrievalSink {
    pending: Mutex<HashMap<QueryFingerprint, BTreeSet<EntityRef>>>,
}

impl LateRetrievalSink {
    pub fn collect(&self, fingerprint: &QueryFingerprint, entity: EntityRef) {
        self.pending
            .lock()
            .entry(fingerprint.clone())
            .or_default()
            .insert(entity);
    }

    /// Remove and return everything collected for `fingerprint`.
    pub fn drain(&self, fingerprint: &QueryFingerprint) -> BTreeSet<EntityRef> {
        self.pending.lock().remove(fingerprint).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

/// Answer of the query engine for one [QueryDescriptor].
#[derive(Debug, Clone)]
pub struct QueryResult {
    query: QueryDescriptor,
    fingerprint: QueryFingerprint,
    rows: Vec<ResultRow>,
    sink: Arc<LateRetrievalSink>,
}

impl QueryResult {
    pub fn new(
        query: QueryDescriptor,
        rows: Vec<ResultRow>,
        sink: Arc<LateRetrievalSink>,
    ) -> QueryResult {
        let fingerprint = query.fingerprint();
        QueryResult {
            query,
            fingerprint,
            rows,
            sink,
        }
    }

    pub fn query(&self) -> &QueryDescriptor {
        &self.query
    }

    pub fn fingerprint(&self) -> &QueryFingerprint {
        &self.fingerprint
    }

    pub fn rows(&self) -> impl Iterator<Item = &ResultRow> + '_ {
        self.rows.iter()
    }

    /// Iterate rows the way a result printer does, recording each row's printout entities in the
    /// late retrieval sink as the row is yielded.
    pub fn materialize(&self) -> impl Iterator<Item = &ResultRow> + '_ {
        self.rows.iter().inspect(move |row| {
            for entity in row.printouts.iter() {
                self.sink.collect(&self.fingerprint, entity.clone());
            }
        })
    }

    pub fn drain_late_retrievals(&self) -> BTreeSet<EntityRef> {
        self.sink.drain(&self.fingerprint)
    }
}

/// Window into a paged lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paging {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Paging {
    fn default() -> Self {
        Paging {
            limit: DEFAULT_LIMIT,
            offset: DEFAULT_OFFSET,
        }
    }
}

/// A page of results from a paged lookup.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultsPage<B> {
    pub count: usize,
    pub start: usize,
    pub results: B,
}

static CONDITION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[\[([^\[\]]*)\]\]").expect("condition pattern to be a valid regex")
});

static DISJUNCTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\]\]\s*(?:OR|\|\|)\s*\[\[").expect("disjunction pattern to be a valid regex")
});

/// Parser for the condition strings stored with concepts, e.g.
/// `[[Category:Towns]] [[LocatedIn::Wonderland]] OR [[Concept:Cities]]`.
///
/// Only the subset of the condition syntax that can name entities is understood; comparator
/// values (`[[Population::>1000]]`) degrade to [Description::Thing].
#[derive(Debug, Default, Clone, Copy)]
pub struct ConditionParser;

impl ConditionParser {
    pub fn parse(&self, text: &str) -> Result<Description, QueryDepsError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(QueryDepsError::InvalidQuery("empty condition".to_string()));
        }
        // Split top level disjunctions while keeping the brackets intact on each side.
        let marked = DISJUNCTION_RE.replace_all(text, "]]\u{1}[[");
        let mut branches = Vec::new();
        for branch in marked.split('\u{1}') {
            branches.push(self.parse_conjunction(branch)?);
        }
        Ok(match branches.len() {
            1 => branches.remove(0),
            _ => Description::Disjunction(branches),
        })
    }

    fn parse_conjunction(&self, text: &str) -> Result<Description, QueryDepsError> {
        let leftover = CONDITION_RE.replace_all(text, "");
        if !leftover.trim().is_empty() {
            return Err(QueryDepsError::InvalidQuery(format!(
                "unexpected text outside of conditions: '{}'",
                leftover.trim()
            )));
        }
        let mut parts = CONDITION_RE
            .captures_iter(text)
            .map(|cap| self.parse_condition(&cap[1]))
            .collect::<Result<Vec<_>, _>>()?;
        match parts.len() {
            0 => Err(QueryDepsError::InvalidQuery(format!(
                "no conditions found in '{text}'"
            ))),
            1 => Ok(parts.remove(0)),
            _ => Ok(Description::Conjunction(parts)),
        }
    }

    fn parse_condition(&self, inner: &str) -> Result<Description, QueryDepsError> {
        if let Some((property, value)) = inner.split_once("::") {
            let property = property.trim();
            if property.is_empty() {
                return Err(QueryDepsError::InvalidQuery(format!(
                    "missing property in '[[{inner}]]'"
                )));
            }
            let values = value
                .split("||")
                .map(|v| self.parse_value(v))
                .collect::<Vec<_>>();
            let inner = match values.len() {
                1 => values.into_iter().next().unwrap_or(Description::Thing),
                _ => Description::Disjunction(values),
            };
            return Ok(Description::some_property(property, inner));
        }

        // `[[Category:A||B]]` lists B in the namespace of A.
        let mut entities = inner.split("||").map(parse_entity).collect::<Vec<_>>();
        if let Some(ns) = entities.first().map(|e| e.namespace) {
            for entity in entities.iter_mut().skip(1) {
                if entity.namespace == Namespace::Main {
                    entity.namespace = ns;
                }
            }
        }
        match entities.first().map(|e| e.namespace) {
            None => Err(QueryDepsError::InvalidQuery("empty condition".to_string())),
            Some(Namespace::Category) => Ok(Description::Class(entities)),
            Some(Namespace::Concept) if entities.len() == 1 => {
                Ok(Description::Concept(entities[0].clone()))
            }
            Some(Namespace::Concept) => Ok(Description::Disjunction(
                entities.into_iter().map(Description::Concept).collect(),
            )),
            Some(_) if entities.len() == 1 => Ok(Description::Value(entities[0].clone())),
            Some(_) => Ok(Description::Disjunction(
                entities.into_iter().map(Description::Value).collect(),
            )),
        }
    }

    fn parse_value(&self, value: &str) -> Description {
        let value = value.trim();
        if value.is_empty() || value == "+" {
            return Description::Thing;
        }
        if value.starts_with(['<', '>', '!', '~', '≤', '≥']) {
            return Description::Thing;
        }
        Description::Value(parse_entity(value))
    }
}

fn parse_entity(text: &str) -> EntityRef {
    let text = text.trim().trim_start_matches(':');
    match text.split_once(':') {
        Some((prefix, key)) => match Namespace::from_prefix(prefix) {
            Some(ns) => EntityRef::new(ns, key),
            None => EntityRef::page(text),
        },
        None => EntityRef::page(text),
    }
}
