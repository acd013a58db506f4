//! Identity types shared by every component: entity references, registry ids, property keys and
//! query fingerprints.
pub use enumset::EnumSet;
use enumset::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{sqlite::SqliteRow, FromRow, Row};
use std::{
    fmt::{Display, Formatter},
    ops::Deref,
};
use unicode_normalization::UnicodeNormalization;

use crate::error::QueryDepsError;

/// Marks an owner entity as containing an embedded (#ask/#show) query. The value is the query
/// instance subobject.
pub const PROP_EMBEDDED_QUERY: &str = "_ASK";
/// Last modification date of a page. Changes on every edit.
pub const PROP_MODIFICATION_DATE: &str = "_MDAT";
/// Display title of a page, rendered lazily by result printers.
pub const PROP_DISPLAY_TITLE: &str = "_DTITLE";
/// Sort key bookkeeping.
pub const PROP_SORT_KEY: &str = "_SKEY";
/// Last editor.
pub const PROP_LAST_EDITOR: &str = "_LEDT";
/// Redirect target.
pub const PROP_REDIRECT: &str = "_REDI";
/// Processing error container.
pub const PROP_ERROR: &str = "_ERRC";
/// Embedded query metadata: duration, size, depth, format, source, status, parameters.
pub const PROP_QUERY_DURATION: &str = "_ASKDU";
pub const PROP_QUERY_SIZE: &str = "_ASKSI";
pub const PROP_QUERY_DEPTH: &str = "_ASKDE";
pub const PROP_QUERY_FORMAT: &str = "_ASKFO";
pub const PROP_QUERY_SOURCE: &str = "_ASKSC";
pub const PROP_QUERY_STATUS: &str = "_ASKST";
pub const PROP_QUERY_PARAMETERS: &str = "_ASKPA";
/// Synthetic relation injected into entity data for every query instance that depends on it.
pub const PROP_QUERY_REFERENCE: &str = "_QREF";

/// Prefix of the subobject name synthesized for a query instance.
pub const QUERY_SUBOBJECT_PREFIX: &str = "_QUERY";

/// Namespaces an entity can live in. Only the namespaces the dependency engine distinguishes are
/// modelled, everything else is a page in [Namespace::Main].
#[derive(Debug, Default, Serialize, Deserialize, PartialOrd, Ord, Hash, EnumSetType)]
#[enumset(repr = "u32")]
pub enum Namespace {
    #[default]
    Main,
    Property,
    Category,
    Concept,
}

/// Namespaces whose entities the id registry may create on first reference.
pub const AUTO_CREATE_NAMESPACES: EnumSet<Namespace> =
    enum_set!(Namespace::Property | Namespace::Category);

impl Namespace {
    /// Numeric namespace id used in persisted rows.
    pub fn as_i64(&self) -> i64 {
        match self {
            Namespace::Main => 0,
            Namespace::Category => 14,
            Namespace::Property => 102,
            Namespace::Concept => 108,
        }
    }

    pub fn from_i64(value: i64) -> Option<Namespace> {
        match value {
            0 => Some(Namespace::Main),
            14 => Some(Namespace::Category),
            102 => Some(Namespace::Property),
            108 => Some(Namespace::Concept),
            _ => None,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Namespace::Main => "",
            Namespace::Category => "Category",
            Namespace::Property => "Property",
            Namespace::Concept => "Concept",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Namespace> {
        match prefix.trim().to_lowercase().as_str() {
            "category" => Some(Namespace::Category),
            "property" => Some(Namespace::Property),
            "concept" => Some(Namespace::Concept),
            _ => None,
        }
    }
}

/// Normalize a user facing title into its stored key form (NFC, underscores for spaces).
pub fn normalize_key(key: &str) -> String {
    key.trim()
        .nfc()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect()
}

/// Any addressable entity: a page, one of its subobjects, a property, category or concept.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub namespace: Namespace,
    pub key: String,
    pub interwiki: String,
    pub subobject: String,
}

impl EntityRef {
    pub fn new(namespace: Namespace, key: &str) -> EntityRef {
        EntityRef {
            namespace,
            key: normalize_key(key),
            interwiki: String::new(),
            subobject: String::new(),
        }
    }

    pub fn page(key: &str) -> EntityRef {
        EntityRef::new(Namespace::Main, key)
    }

    pub fn category(key: &str) -> EntityRef {
        EntityRef::new(Namespace::Category, key)
    }

    pub fn property(key: &str) -> EntityRef {
        EntityRef::new(Namespace::Property, key)
    }

    pub fn concept(key: &str) -> EntityRef {
        EntityRef::new(Namespace::Concept, key)
    }

    pub fn with_subobject(&self, subobject: &str) -> EntityRef {
        EntityRef {
            subobject: subobject.to_string(),
            ..self.clone()
        }
    }

    /// The page this entity belongs to (itself, when not a subobject).
    pub fn page_ref(&self) -> EntityRef {
        EntityRef {
            subobject: String::new(),
            ..self.clone()
        }
    }

    pub fn is_subobject(&self) -> bool {
        !self.subobject.is_empty()
    }

    pub fn is_auto_creatable(&self) -> bool {
        AUTO_CREATE_NAMESPACES.contains(self.namespace) && !self.is_subobject()
    }

    /// Whether this entity is the synthesized subobject of a query instance.
    pub fn is_query_instance(&self) -> bool {
        self.subobject.starts_with(QUERY_SUBOBJECT_PREFIX)
    }

    /// Stable string identity, used to guard hierarchy walks against cycles.
    pub fn hash_key(&self) -> String {
        format!(
            "{}#{}#{}#{}",
            self.key,
            self.namespace.as_i64(),
            self.interwiki,
            self.subobject
        )
    }
}

impl Display for EntityRef {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        if !self.interwiki.is_empty() {
            write!(f, "{}:", self.interwiki)?;
        }
        match self.namespace {
            Namespace::Main => write!(f, "{}", self.key)?,
            ns => write!(f, "{}:{}", ns.prefix(), self.key)?,
        }
        if self.is_subobject() {
            write!(f, "#{}", self.subobject)?;
        }
        Ok(())
    }
}

impl FromRow<'_, SqliteRow> for EntityRef {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let ns: i64 = row.try_get("namespace")?;
        let namespace = Namespace::from_i64(ns).ok_or_else(|| {
            sqlx::Error::Decode(Box::new(QueryDepsError::Serialization(format!(
                "unknown namespace id {ns}"
            ))))
        })?;
        Ok(EntityRef {
            namespace,
            key: row.try_get("key")?,
            interwiki: row.try_get("interwiki")?,
            subobject: row.try_get("subobject")?,
        })
    }
}

/// Registry assigned integer id of an [EntityRef].
#[derive(
    Clone, Copy, Debug, Default, Serialize, Deserialize, Hash, PartialEq, Eq, PartialOrd, Ord,
)]
pub struct EntityId(pub i64);

impl EntityId {
    /// Ids below one are never handed out by a registry.
    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }
}

impl From<i64> for EntityId {
    fn from(id: i64) -> EntityId {
        EntityId(id)
    }
}

impl From<EntityId> for i64 {
    fn from(id: EntityId) -> i64 {
        id.0
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A property key: the page key of a user defined property (`LocatedIn`) or a predefined
/// property identifier (`_MDAT`).
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyKey(String);

impl PropertyKey {
    pub fn new(key: &str) -> PropertyKey {
        PropertyKey(normalize_key(key))
    }

    /// The canonical entity representing this property.
    pub fn to_entity(&self) -> EntityRef {
        EntityRef::property(&self.0)
    }
}

impl Deref for PropertyKey {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PropertyKey {
    fn from(key: &str) -> PropertyKey {
        PropertyKey::new(key)
    }
}

impl Display for PropertyKey {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A property key paired with its registry id, as carried by change diffs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PropertyRef {
    pub key: PropertyKey,
    pub id: EntityId,
}

impl PropertyRef {
    pub fn new(key: &str, id: EntityId) -> PropertyRef {
        PropertyRef {
            key: PropertyKey::new(key),
            id,
        }
    }
}

/// Hex encoded SHA-256 digest identifying one query (description, printouts and limit).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryFingerprint(String);

impl QueryFingerprint {
    pub fn from_bytes(bytes: &[u8]) -> QueryFingerprint {
        let digest = Sha256::digest(bytes);
        QueryFingerprint(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Subobject name of the query instance this fingerprint identifies within its owner.
    pub fn subobject_name(&self) -> String {
        let short = self.0.get(..32).unwrap_or(&self.0);
        format!("{QUERY_SUBOBJECT_PREFIX}{short}")
    }
}

impl Display for QueryFingerprint {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One embedded query occurrence: owner page plus query fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QueryInstance {
    pub owner: EntityRef,
    pub fingerprint: QueryFingerprint,
}

impl QueryInstance {
    pub fn new(owner: EntityRef, fingerprint: QueryFingerprint) -> QueryInstance {
        QueryInstance { owner, fingerprint }
    }

    /// The entity used as subject of this instance's dependency edges.
    pub fn entity_ref(&self) -> EntityRef {
        self.owner
            .page_ref()
            .with_subobject(&self.fingerprint.subobject_name())
    }
}
