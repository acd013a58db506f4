use crate::{
    error::QueryDepsError,
    properties::{EntityId, EntityRef},
    registry::{EntityRegistry, HierarchyKind},
};
use futures_core::future::BoxFuture;
use sqlx::{
    error::BoxDynError,
    migrate::{Migration as SqlxMigration, MigrationSource, MigrationType, Migrator},
    sqlite::{Sqlite, SqliteConnectOptions, SqlitePoolOptions},
    ConnectOptions, FromRow, Pool, QueryBuilder, Row,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    result::Result,
    str::FromStr,
};

pub const DEPENDENCY_DB: &str = "query_deps.db";

/// <https://www.sqlite.org/limits.html#max_variable_number>
pub const SQLITE_LIMIT_VARIABLE_NUMBER: usize = 32766;

/// Upper bound of ids bound into a single `IN (...)` list. Leaves room for the other binds of a
/// statement.
pub const ID_CHUNK_SIZE: usize = 1000;

/// Push `column IN (?, ?, ...)` binding every id.
pub(crate) fn push_id_list(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, ids: &[EntityId]) {
    qb.push(column);
    qb.push(" IN (");
    let mut separated = qb.separated(", ");
    for id in ids.iter() {
        separated.push_bind(id.0);
    }
    separated.push_unseparated(")");
}

#[derive(Debug, Clone)]
pub struct DbConnection(pub Pool<Sqlite>);

impl DbConnection {
    /// Record that `owner_id` embeds the query instance `query_id`.
    pub async fn annotate_query(
        &self,
        owner_id: EntityId,
        query_id: EntityId,
    ) -> Result<(), QueryDepsError> {
        sqlx::query("INSERT OR IGNORE INTO embedded_queries (owner_id, query_id) VALUES (?, ?)")
            .bind(owner_id.0)
            .bind(query_id.0)
            .execute(&self.0)
            .await?;
        Ok(())
    }

    pub async fn remove_annotation(
        &self,
        owner_id: EntityId,
        query_id: EntityId,
    ) -> Result<(), QueryDepsError> {
        sqlx::query("DELETE FROM embedded_queries WHERE owner_id = ? AND query_id = ?")
            .bind(owner_id.0)
            .bind(query_id.0)
            .execute(&self.0)
            .await?;
        Ok(())
    }

    pub async fn add_hierarchy(
        &self,
        parent: &EntityRef,
        child: &EntityRef,
        kind: HierarchyKind,
    ) -> Result<(), QueryDepsError> {
        let (Some(parent_id), Some(child_id)) = (
            self.resolve_id(parent, true).await?,
            self.resolve_id(child, true).await?,
        ) else {
            return Err(QueryDepsError::NotFound(format!(
                "could not register {parent} -> {child}"
            )));
        };
        sqlx::query("INSERT OR IGNORE INTO hierarchy (parent, child, kind) VALUES (?, ?, ?)")
            .bind(parent_id.0)
            .bind(child_id.0)
            .bind(kind.as_i64())
            .execute(&self.0)
            .await?;
        Ok(())
    }

    pub async fn set_concept(&self, concept: &EntityRef, query: &str) -> Result<(), QueryDepsError> {
        let Some(id) = self.resolve_id(concept, true).await? else {
            return Err(QueryDepsError::NotFound(format!("could not register {concept}")));
        };
        sqlx::query("INSERT OR REPLACE INTO concepts (id, query) VALUES (?, ?)")
            .bind(id.0)
            .bind(query)
            .execute(&self.0)
            .await?;
        Ok(())
    }

    /// Remove an entity from the registry. Dependency edges pointing at it are left for the
    /// [crate::disposer::DependencyLinksDisposer].
    pub async fn dispose_entity(&self, id: EntityId) -> Result<(), QueryDepsError> {
        let mut tx = self.0.begin().await?;
        sqlx::query("DELETE FROM entities WHERE id = ?")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM hierarchy WHERE parent = ? OR child = ?")
            .bind(id.0)
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM concepts WHERE id = ?")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM embedded_queries WHERE owner_id = ? OR query_id = ?")
            .bind(id.0)
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn children_of(
        &self,
        parent: &EntityRef,
        kind: HierarchyKind,
    ) -> Result<Vec<EntityRef>, QueryDepsError> {
        let children = sqlx::query_as::<_, EntityRef>(
            "SELECT c.namespace, c.key, c.interwiki, c.subobject FROM hierarchy h \
             JOIN entities p ON p.id = h.parent \
             JOIN entities c ON c.id = h.child \
             WHERE h.kind = ? AND p.namespace = ? AND p.key = ? AND p.interwiki = ? \
             AND p.subobject = ? \
             ORDER BY c.id",
        )
        .bind(kind.as_i64())
        .bind(parent.namespace.as_i64())
        .bind(&parent.key)
        .bind(&parent.interwiki)
        .bind(&parent.subobject)
        .fetch_all(&self.0)
        .await
        .map_err(|e| {
            tracing::error!(
                "[DbConnection.children_of] SQL error looking up {:?} of {}\n\terror: {}",
                kind,
                parent,
                e
            );
            e
        })?;
        Ok(children)
    }

    pub async fn entity_count(&self) -> Result<i64, QueryDepsError> {
        Ok(sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM entities")
            .fetch_one(&self.0)
            .await?)
    }
}

impl EntityRegistry for DbConnection {
    async fn resolve_id(
        &self,
        entity: &EntityRef,
        auto_create: bool,
    ) -> Result<Option<EntityId>, QueryDepsError> {
        let select = || {
            sqlx::query_scalar::<_, i64>(
                "SELECT id FROM entities \
                 WHERE namespace = ? AND key = ? AND interwiki = ? AND subobject = ?",
            )
            .bind(entity.namespace.as_i64())
            .bind(&entity.key)
            .bind(&entity.interwiki)
            .bind(&entity.subobject)
        };
        if let Some(id) = select().fetch_optional(&self.0).await? {
            return Ok(Some(EntityId(id)));
        }
        if !auto_create {
            return Ok(None);
        }
        sqlx::query(
            "INSERT OR IGNORE INTO entities (namespace, key, interwiki, subobject) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(entity.namespace.as_i64())
        .bind(&entity.key)
        .bind(&entity.interwiki)
        .bind(&entity.subobject)
        .execute(&self.0)
        .await?;
        // Re-read so a concurrent insert of the same entity yields the same id.
        Ok(select().fetch_optional(&self.0).await?.map(EntityId))
    }

    #[tracing::instrument(skip(self))]
    async fn entities_by_id(
        &self,
        ids: &[EntityId],
    ) -> Result<BTreeMap<EntityId, EntityRef>, QueryDepsError> {
        let mut entities = BTreeMap::new();
        for chunk in ids.chunks(ID_CHUNK_SIZE) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "SELECT id, namespace, key, interwiki, subobject FROM entities WHERE ",
            );
            push_id_list(&mut qb, "id", chunk);
            let rows = qb.build().fetch_all(&self.0).await?;
            for row in rows.iter() {
                let id: i64 = row.try_get("id")?;
                entities.insert(EntityId(id), EntityRef::from_row(row)?);
            }
        }
        Ok(entities)
    }

    async fn subcategories_of(
        &self,
        category: &EntityRef,
    ) -> Result<Vec<EntityRef>, QueryDepsError> {
        self.children_of(category, HierarchyKind::Subcategory).await
    }

    async fn subproperties_of(
        &self,
        property: &EntityRef,
    ) -> Result<Vec<EntityRef>, QueryDepsError> {
        self.children_of(property, HierarchyKind::Subproperty).await
    }

    async fn concept_query_of(
        &self,
        concept: &EntityRef,
    ) -> Result<Option<String>, QueryDepsError> {
        Ok(sqlx::query_scalar::<_, String>(
            "SELECT c.query FROM concepts c JOIN entities e ON e.id = c.id \
             WHERE e.namespace = ? AND e.key = ? AND e.interwiki = ? AND e.subobject = ?",
        )
        .bind(concept.namespace.as_i64())
        .bind(&concept.key)
        .bind(&concept.interwiki)
        .bind(&concept.subobject)
        .fetch_optional(&self.0)
        .await?)
    }

    async fn touched_of(&self, id: EntityId) -> Result<Option<i64>, QueryDepsError> {
        Ok(
            sqlx::query_scalar::<_, i64>("SELECT touched FROM entities WHERE id = ?")
                .bind(id.0)
                .fetch_optional(&self.0)
                .await?,
        )
    }

    async fn touched_by_id(
        &self,
        ids: &[EntityId],
    ) -> Result<BTreeMap<EntityId, i64>, QueryDepsError> {
        let mut touched = BTreeMap::new();
        for chunk in ids.chunks(ID_CHUNK_SIZE) {
            let mut qb = QueryBuilder::<Sqlite>::new("SELECT id, touched FROM entities WHERE ");
            push_id_list(&mut qb, "id", chunk);
            let rows = qb.build().fetch_all(&self.0).await?;
            for row in rows.iter() {
                touched.insert(EntityId(row.try_get("id")?), row.try_get("touched")?);
            }
        }
        Ok(touched)
    }

    async fn query_instances_of(&self, page: &EntityRef) -> Result<Vec<EntityId>, QueryDepsError> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT DISTINCT q.query_id FROM embedded_queries q \
             JOIN entities o ON o.id = q.owner_id \
             WHERE o.namespace = ? AND o.key = ? AND o.interwiki = ? \
             ORDER BY q.query_id",
        )
        .bind(page.namespace.as_i64())
        .bind(&page.key)
        .bind(&page.interwiki)
        .fetch_all(&self.0)
        .await?;
        Ok(ids.into_iter().map(EntityId).collect())
    }

    async fn annotated_instances(
        &self,
        ids: &[EntityId],
    ) -> Result<BTreeSet<EntityId>, QueryDepsError> {
        let mut annotated = BTreeSet::new();
        for chunk in ids.chunks(ID_CHUNK_SIZE) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "SELECT DISTINCT query_id FROM embedded_queries WHERE ",
            );
            push_id_list(&mut qb, "query_id", chunk);
            let found = qb.build_query_scalar::<i64>().fetch_all(&self.0).await?;
            annotated.extend(found.into_iter().map(EntityId));
        }
        Ok(annotated)
    }

    async fn touch(&self, ids: &[EntityId], at: i64) -> Result<(), QueryDepsError> {
        for chunk in ids.chunks(ID_CHUNK_SIZE) {
            let mut qb = QueryBuilder::<Sqlite>::new("UPDATE entities SET touched = ");
            qb.push_bind(at);
            qb.push(" WHERE ");
            push_id_list(&mut qb, "id", chunk);
            qb.build().execute(&self.0).await?;
        }
        Ok(())
    }
}

/// A migration definition.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
    pub kind: MigrationType,
}

#[derive(Debug, Clone)]
struct MigrationList(Vec<Migration>);

impl MigrationSource<'static> for MigrationList {
    fn resolve(self) -> BoxFuture<'static, Result<Vec<SqlxMigration>, BoxDynError>> {
        Box::pin(async move {
            let mut migrations = Vec::new();
            for migration in self.0 {
                if matches!(migration.kind, MigrationType::ReversibleUp) {
                    migrations.push(SqlxMigration::new(
                        migration.version,
                        migration.description.into(),
                        migration.kind,
                        migration.sql.into(),
                        false,
                    ));
                }
            }
            Ok(migrations)
        })
    }
}

fn migrations() -> MigrationList {
    MigrationList(vec![Migration {
        version: 1,
        description: "create_dependency_tables",
        sql: "\
        CREATE TABLE entities (id INTEGER PRIMARY KEY AUTOINCREMENT, namespace INTEGER NOT NULL, key TEXT NOT NULL, interwiki TEXT NOT NULL DEFAULT '', subobject TEXT NOT NULL DEFAULT '', touched INTEGER NOT NULL DEFAULT 0, UNIQUE(namespace, key, interwiki, subobject)); \
        CREATE TABLE hierarchy (parent INTEGER NOT NULL, child INTEGER NOT NULL, kind INTEGER NOT NULL, UNIQUE(parent, child, kind)); \
        CREATE TABLE concepts (id INTEGER PRIMARY KEY, query TEXT NOT NULL); \
        CREATE TABLE embedded_queries (owner_id INTEGER NOT NULL, query_id INTEGER NOT NULL, UNIQUE(owner_id, query_id)); \
        CREATE INDEX embedded_queries_query ON embedded_queries (query_id); \
        CREATE TABLE query_links (s_id INTEGER NOT NULL, o_id INTEGER NOT NULL); \
        CREATE INDEX query_links_s_id ON query_links (s_id); \
        CREATE INDEX query_links_o_id ON query_links (o_id);",
        kind: MigrationType::ReversibleUp,
    }])
}

async fn migrate(pool: &Pool<Sqlite>) -> Result<(), QueryDepsError> {
    let migrator = Migrator::new(migrations()).await?;
    migrator.run(pool).await?;

    let entity_count = sqlx::query("SELECT COUNT(*) FROM entities;")
        .fetch_one(pool)
        .await?;
    let link_count = sqlx::query("SELECT COUNT(*) FROM query_links;")
        .fetch_one(pool)
        .await?;
    tracing::info!(
        "Dependency DB initialized.\n \
         \tEntity count:\t{:?} \n \
         \tDependency edge count:\t{:?}",
        entity_count.get::<i64, usize>(0),
        link_count.get::<i64, usize>(0)
    );
    Ok(())
}

/// Open (creating if needed) a file backed dependency database.
pub async fn db_init(db_path: PathBuf) -> Result<Pool<Sqlite>, QueryDepsError> {
    tracing::debug!("Initializing dependency db from file: {:?}", db_path);
    let options = SqliteConnectOptions::new()
        .filename(&db_path)
        .read_only(false)
        .disable_statement_logging()
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// An in-memory dependency database. Kept on a single connection, as every SQLite memory
/// connection is its own database.
pub async fn db_init_memory() -> Result<Pool<Sqlite>, QueryDepsError> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.disable_statement_logging();
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    migrate(&pool).await?;
    Ok(pool)
}
