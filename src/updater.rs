//! Orchestration of the dependency engine.
//!
//! [DependencyUpdater] is the entry point the query engine and the store call into:
//! - [DependencyUpdater::on_query_answered] after a tracked query was answered. The expensive
//!   resolve and flush is queued for a background worker; the caller never waits on it.
//! - [DependencyUpdater::on_entity_updated] after an entity update produced a [ChangeDiff].
//!   Removed query annotations lose their edges, relevant ids are touched and broadcast as
//!   [InvalidationEvent::Triggers].
//! - [DependencyUpdater::dispose_orphans] to reconcile edges against the entity registry.
//!
//! A failed deferred task is logged and dropped. The edge table keeps its last flushed state until
//! the next successful evaluation of the same query replaces it.

use std::{collections::BTreeSet, sync::Arc};

use tokio::{
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task::JoinHandle,
};

use crate::{
    backlinks::{BacklinksPresenter, EntityData},
    clock::Clock,
    config::DependencyConfig,
    db::DbConnection,
    disposer::DependencyLinksDisposer,
    error::QueryDepsError,
    event::{ChangeDiff, InvalidationEvent},
    journal::UpdateJournal,
    links::DependencyLinkStore,
    properties::{EntityId, EntityRef, PropertyKey, PROP_EMBEDDED_QUERY},
    query::{Paging, QueryResult},
    registry::EntityRegistry,
    relevance::RelevanceFilter,
    resolver::DependencyResolver,
    staleness::StalenessValidator,
};

/// Unit of work for the deferred worker.
#[derive(Debug)]
pub enum DeferredTask {
    /// Resolve the dependencies of an answered query and replace the edges of `instance`.
    UpdateLinks {
        instance: EntityId,
        result: QueryResult,
    },
    /// Delete every edge owned by or pointing at these ids.
    DisposeLinks(Vec<EntityId>),
    /// Completes once every task queued before it has run.
    Barrier(oneshot::Sender<()>),
}

impl std::fmt::Display for DeferredTask {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DeferredTask::UpdateLinks { instance, .. } => write!(f, "UpdateLinks({instance})"),
            DeferredTask::DisposeLinks(ids) => write!(f, "DisposeLinks({})", ids.len()),
            DeferredTask::Barrier(_) => write!(f, "Barrier"),
        }
    }
}

struct LinksWorker<R: EntityRegistry> {
    store: DependencyLinkStore,
    registry: R,
    disposer: DependencyLinksDisposer<R>,
    clock: Arc<dyn Clock>,
    exemptions: BTreeSet<PropertyKey>,
    events: UnboundedSender<InvalidationEvent>,
}

impl<R: EntityRegistry> LinksWorker<R> {
    async fn run(mut self, mut tasks: UnboundedReceiver<DeferredTask>) {
        tracing::debug!("[LinksWorker.run] started");
        while let Some(task) = tasks.recv().await {
            let label = task.to_string();
            if let Err(e) = self.handle(task).await {
                tracing::warn!("[LinksWorker.run] dropping task {}: {}", label, e);
            }
        }
        tracing::debug!("[LinksWorker.run] task queue closed, exiting");
    }

    async fn handle(&mut self, task: DeferredTask) -> Result<(), QueryDepsError> {
        match task {
            DeferredTask::UpdateLinks { instance, result } => {
                let deps = DependencyResolver::new(&self.registry, &self.exemptions)
                    .resolve(&result)
                    .await?;
                self.store
                    .stage_refs(instance, &deps, &self.registry)
                    .await?;
                self.store.flush().await?;
                self.registry
                    .touch(&[instance], self.clock.now_millis())
                    .await?;
            }
            DeferredTask::DisposeLinks(ids) => {
                self.disposer.dispose(&ids).await?;
                self.events
                    .send(InvalidationEvent::InstancesRemoved(ids.into_iter().collect()))?;
            }
            DeferredTask::Barrier(done) => {
                // The waiting side may have given up already.
                let _ = done.send(());
            }
        }
        Ok(())
    }
}

/// Release what the presentation layer recorded for a result nothing will resolve.
fn discard(result: &QueryResult) {
    let late = result.drain_late_retrievals();
    if !late.is_empty() {
        tracing::trace!("[DependencyUpdater] released {} late retrieved entities", late.len());
    }
}

pub struct DependencyUpdater<R: EntityRegistry> {
    config: DependencyConfig,
    clock: Arc<dyn Clock>,
    registry: R,
    links: DependencyLinkStore,
    filter: RelevanceFilter,
    journal: UpdateJournal,
    staleness: StalenessValidator<R>,
    disposer: DependencyLinksDisposer<R>,
    events: UnboundedSender<InvalidationEvent>,
    tasks: UnboundedSender<DeferredTask>,
    worker: JoinHandle<()>,
}

impl<R> DependencyUpdater<R>
where
    R: EntityRegistry + Clone + Send + 'static,
{
    /// Build the updater and spawn its worker on the current tokio runtime. The returned receiver
    /// yields every [InvalidationEvent] for the cache eviction side.
    pub fn new(
        config: DependencyConfig,
        db: DbConnection,
        registry: R,
        clock: Arc<dyn Clock>,
    ) -> (DependencyUpdater<R>, UnboundedReceiver<InvalidationEvent>) {
        let (events, events_rx) = unbounded_channel();
        let (tasks, tasks_rx) = unbounded_channel();

        let links = DependencyLinkStore::new(db);
        let worker = LinksWorker {
            store: links.clone(),
            registry: registry.clone(),
            disposer: DependencyLinksDisposer::new(links.clone(), registry.clone()),
            clock: clock.clone(),
            exemptions: config.exemptions.clone(),
            events: events.clone(),
        };
        let worker = tokio::spawn(worker.run(tasks_rx));

        let updater = DependencyUpdater {
            filter: RelevanceFilter::from_config(&config),
            journal: UpdateJournal::new(clock.clone(), config.journal_ttl()),
            staleness: StalenessValidator::new(
                links.clone(),
                registry.clone(),
                config.check_archaic,
            ),
            disposer: DependencyLinksDisposer::new(links.clone(), registry.clone()),
            links,
            config,
            clock,
            registry,
            events,
            tasks,
            worker,
        };
        (updater, events_rx)
    }

    pub fn config(&self) -> &DependencyConfig {
        &self.config
    }

    pub fn links(&self) -> &DependencyLinkStore {
        &self.links
    }

    pub fn journal(&self) -> &UpdateJournal {
        &self.journal
    }

    fn enqueue(&self, task: DeferredTask) -> Result<(), QueryDepsError> {
        self.tasks.send(task).map_err(|e| {
            if let DeferredTask::UpdateLinks { result, .. } = &e.0 {
                discard(result);
            }
            QueryDepsError::Queue(format!("deferred worker is gone, could not queue {}", e.0))
        })
    }

    /// Queue a dependency update for an answered query. Returns whether a task was queued. A
    /// result that is not queued has its late retrieval values released here.
    #[tracing::instrument(skip_all, fields(fingerprint = %result.fingerprint()))]
    pub async fn on_query_answered(&self, result: QueryResult) -> Result<bool, QueryDepsError> {
        let instance_id = match self.admit(&result).await {
            Ok(Some(instance_id)) => instance_id,
            Ok(None) => {
                discard(&result);
                return Ok(false);
            }
            Err(e) => {
                discard(&result);
                return Err(e);
            }
        };
        self.enqueue(DeferredTask::UpdateLinks {
            instance: instance_id,
            result,
        })?;
        Ok(true)
    }

    /// Id of the query instance `result` should update the edges of, if any.
    async fn admit(&self, result: &QueryResult) -> Result<Option<EntityId>, QueryDepsError> {
        if !self.config.enabled || !result.query().is_tracked() {
            return Ok(None);
        }
        let Some(instance) = result.query().instance() else {
            return Ok(None);
        };
        let Some(instance_id) = self
            .registry
            .resolve_id(&instance.entity_ref(), true)
            .await?
        else {
            tracing::debug!(
                "[DependencyUpdater.admit] no id for query instance {}",
                instance.entity_ref()
            );
            return Ok(None);
        };

        if self.within_skew(&instance.owner, instance_id).await? {
            tracing::debug!(
                "[DependencyUpdater.admit] {} registered within the skew window, skipping",
                instance.entity_ref()
            );
            return Ok(None);
        }
        Ok(Some(instance_id))
    }

    /// Whether `instance` already has edges and was registered (or its owner changed) less than
    /// the skew window ago. This throttle is local and lossy; it only saves redundant writes.
    async fn within_skew(
        &self,
        owner: &EntityRef,
        instance: EntityId,
    ) -> Result<bool, QueryDepsError> {
        if !self.links.has_links(instance).await? {
            return Ok(false);
        }
        let owner_touched = match self.registry.resolve_id(owner, false).await? {
            Some(owner_id) => self.registry.touched_of(owner_id).await?,
            None => None,
        };
        let instance_touched = self.registry.touched_of(instance).await?;
        let Some(last) = owner_touched.max(instance_touched) else {
            return Ok(false);
        };
        let window = self.config.skew_window().as_millis() as i64;
        Ok(last + window > self.clock.now_millis())
    }

    /// Apply an entity update. Returns the trigger ids of the diff, including those the journal
    /// kept from being broadcast again.
    #[tracing::instrument(skip_all, fields(subject = %diff.subject))]
    pub async fn on_entity_updated(
        &self,
        diff: &ChangeDiff,
    ) -> Result<BTreeSet<EntityId>, QueryDepsError> {
        let removed = diff.deleted_objects(&PropertyKey::new(PROP_EMBEDDED_QUERY));
        if !removed.is_empty() {
            let ids: Vec<EntityId> = removed.iter().copied().collect();
            let rows = self.links.remove(&ids).await?;
            tracing::debug!(
                "[DependencyUpdater.on_entity_updated] pruned {} edges of {} removed queries",
                rows,
                ids.len()
            );
            self.events
                .send(InvalidationEvent::InstancesRemoved(removed))?;
        }

        let triggers = self.filter.filter(diff);
        if triggers.is_empty() {
            return Ok(triggers);
        }
        let ids: Vec<EntityId> = triggers.iter().copied().collect();
        self.registry.touch(&ids, self.clock.now_millis()).await?;

        let fresh = self.journal.filter_unrecorded(&triggers);
        if !fresh.is_empty() {
            tracing::debug!(
                "[DependencyUpdater.on_entity_updated] broadcasting {} of {} triggers",
                fresh.len(),
                triggers.len()
            );
            self.events.send(InvalidationEvent::Triggers(fresh))?;
        }
        Ok(triggers)
    }

    pub async fn is_archaic(&self, subject: &EntityRef) -> Result<bool, QueryDepsError> {
        self.staleness.is_archaic(subject).await
    }

    pub async fn attach_backlinks_to(&self, data: &mut EntityData) -> Result<usize, QueryDepsError> {
        let paging = Paging {
            limit: self.config.backlinks_limit,
            offset: 0,
        };
        BacklinksPresenter::new(&self.links, &self.registry)
            .attach_backlinks_to(data, paging)
            .await
    }

    /// Find orphaned edges (at most `limit` ids of each kind) and delete them, through the worker
    /// when disposal is deferred. Returns the number of orphaned ids found.
    pub async fn dispose_orphans(&self, limit: usize) -> Result<usize, QueryDepsError> {
        let orphans: Vec<EntityId> = self.disposer.find_orphans(limit).await?.into_iter().collect();
        if orphans.is_empty() {
            return Ok(0);
        }
        let found = orphans.len();
        if self.config.dispose_deferred {
            self.enqueue(DeferredTask::DisposeLinks(orphans))?;
        } else {
            self.disposer.dispose(&orphans).await?;
            self.events.send(InvalidationEvent::InstancesRemoved(
                orphans.into_iter().collect(),
            ))?;
        }
        Ok(found)
    }

    /// Wait until every task queued so far has been handled.
    pub async fn wait_idle(&self) -> Result<(), QueryDepsError> {
        let (done, wait) = oneshot::channel();
        self.enqueue(DeferredTask::Barrier(done))?;
        wait.await
            .map_err(|e| QueryDepsError::Queue(format!("deferred worker stopped: {e}")))
    }

    /// Close the task queue and wait for the worker to finish what was already queued.
    pub async fn shutdown(self) -> Result<(), QueryDepsError> {
        let DependencyUpdater { tasks, worker, .. } = self;
        drop(tasks);
        worker
            .await
            .map_err(|e| QueryDepsError::Queue(format!("deferred worker failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        db::db_init_memory,
        event::{FieldChange, TableChange},
        properties::PropertyRef,
        query::{Description, LateRetrievalSink, QueryDescriptor, ResultRow},
        registry::MemoryRegistry,
    };
    use std::time::Duration;
    use test_log::test;

    const T0: i64 = 1_700_000_000_000;

    async fn updater() -> (
        DependencyUpdater<DbConnection>,
        UnboundedReceiver<InvalidationEvent>,
        DbConnection,
        Arc<ManualClock>,
    ) {
        let db = DbConnection(db_init_memory().await.unwrap());
        let clock = Arc::new(ManualClock::new(T0));
        let (updater, events) = DependencyUpdater::new(
            DependencyConfig::default(),
            db.clone(),
            db.clone(),
            clock.clone(),
        );
        (updater, events, db, clock)
    }

    fn located_in_wonderland(owner: &EntityRef) -> QueryResult {
        let query = QueryDescriptor::new(
            Some(owner.clone()),
            Description::some_property(
                "LocatedIn",
                Description::Value(EntityRef::page("Wonderland")),
            ),
        );
        QueryResult::new(
            query,
            vec![ResultRow::new(EntityRef::page("Alice"))],
            Arc::new(LateRetrievalSink::default()),
        )
    }

    /// An answer for `owner` whose rendering recorded a late retrieved entity in `sink`.
    fn rendered(owner: Option<&EntityRef>, sink: &Arc<LateRetrievalSink>) -> QueryResult {
        let query = QueryDescriptor::new(
            owner.cloned(),
            Description::some_property(
                "LocatedIn",
                Description::Value(EntityRef::page("Wonderland")),
            ),
        );
        let mut row = ResultRow::new(EntityRef::page("Alice"));
        row.printouts.push(EntityRef::page("Alice_Display"));
        let result = QueryResult::new(query, vec![row], sink.clone());
        assert_eq!(result.materialize().count(), 1);
        result
    }

    fn population_edit(subject: EntityId) -> ChangeDiff {
        ChangeDiff::new(subject).with_table(TableChange::new("page_table").insert(
            FieldChange::new(
                subject,
                Some(PropertyRef::new("Population", EntityId(99))),
                None,
            ),
        ))
    }

    #[test(tokio::test)]
    async fn test_untracked_query_is_ignored() {
        let (updater, _events, _db, _clock) = updater().await;
        let query = QueryDescriptor::new(None, Description::Thing);
        let result = QueryResult::new(query, vec![], Arc::new(LateRetrievalSink::default()));
        assert!(!updater.on_query_answered(result).await.unwrap());

        let sink = Arc::new(LateRetrievalSink::default());
        assert!(!updater
            .on_query_answered(rendered(None, &sink))
            .await
            .unwrap());
        assert!(sink.is_empty());
        updater.shutdown().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_skipped_answer_releases_late_values() {
        let (updater, _events, _db, clock) = updater().await;
        let owner = EntityRef::page("P");
        assert!(updater
            .on_query_answered(located_in_wonderland(&owner))
            .await
            .unwrap());
        updater.wait_idle().await.unwrap();

        clock.advance(Duration::from_secs(5));
        let sink = Arc::new(LateRetrievalSink::default());
        assert!(!updater
            .on_query_answered(rendered(Some(&owner), &sink))
            .await
            .unwrap());
        assert!(sink.is_empty());
        updater.shutdown().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_memory_registry_drives_staleness_and_collection() {
        let db = DbConnection(db_init_memory().await.unwrap());
        let registry = MemoryRegistry::new();
        let clock = Arc::new(ManualClock::new(T0));
        let (updater, _events) = DependencyUpdater::new(
            DependencyConfig::default(),
            db.clone(),
            registry.clone(),
            clock.clone(),
        );

        let owner = EntityRef::page("P");
        let owner_id = registry.insert(&owner);
        let wonderland_id = registry.insert(&EntityRef::page("Wonderland"));
        registry.insert(&EntityRef::page("Alice"));
        let instance = located_in_wonderland(&owner)
            .query()
            .instance()
            .unwrap()
            .entity_ref();
        let instance_id = registry.insert(&instance);
        registry.annotate_query(owner_id, instance_id);

        assert!(updater
            .on_query_answered(located_in_wonderland(&owner))
            .await
            .unwrap());
        updater.wait_idle().await.unwrap();
        let edges = updater.links().links_of(instance_id).await.unwrap();
        assert!(edges.contains(&owner_id));
        assert!(edges.contains(&wonderland_id));
        assert_eq!(registry.touched_of(instance_id).await.unwrap(), Some(T0));
        assert!(!updater.is_archaic(&owner).await.unwrap());

        clock.advance(Duration::from_secs(1));
        updater
            .on_entity_updated(&population_edit(wonderland_id))
            .await
            .unwrap();
        assert!(updater.is_archaic(&owner).await.unwrap());

        // the instance is annotated and every target is registered
        assert_eq!(updater.dispose_orphans(100).await.unwrap(), 0);
        updater.wait_idle().await.unwrap();
        assert_eq!(updater.links().links_of(instance_id).await.unwrap(), edges);
        assert_eq!(db.entity_count().await.unwrap(), 0);
        updater.shutdown().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_skew_window_suppresses_rewrites() {
        let (updater, _events, db, clock) = updater().await;
        let owner = EntityRef::page("P");
        db.resolve_id(&EntityRef::page("Wonderland"), true)
            .await
            .unwrap();

        assert!(updater
            .on_query_answered(located_in_wonderland(&owner))
            .await
            .unwrap());
        updater.wait_idle().await.unwrap();

        let instance = located_in_wonderland(&owner)
            .query()
            .instance()
            .unwrap()
            .entity_ref();
        let instance_id = db.resolve_id(&instance, false).await.unwrap().unwrap();
        assert!(updater.links().has_links(instance_id).await.unwrap());
        assert_eq!(db.touched_of(instance_id).await.unwrap(), Some(T0));

        clock.advance(Duration::from_secs(5));
        assert!(!updater
            .on_query_answered(located_in_wonderland(&owner))
            .await
            .unwrap());

        clock.advance(Duration::from_secs(10));
        assert!(updater
            .on_query_answered(located_in_wonderland(&owner))
            .await
            .unwrap());
        updater.wait_idle().await.unwrap();
        assert_eq!(
            db.touched_of(instance_id).await.unwrap(),
            Some(T0 + 15_000)
        );
        updater.shutdown().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_disabled_engine_writes_nothing() {
        let db = DbConnection(db_init_memory().await.unwrap());
        let config = DependencyConfig {
            enabled: false,
            ..Default::default()
        };
        let (updater, _events) =
            DependencyUpdater::new(config, db.clone(), db.clone(), Arc::new(ManualClock::new(T0)));
        assert!(!updater
            .on_query_answered(located_in_wonderland(&EntityRef::page("P")))
            .await
            .unwrap());
        assert_eq!(db.entity_count().await.unwrap(), 0);
        updater.shutdown().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_removed_annotation_prunes_edges() {
        let (updater, mut events, db, _clock) = updater().await;
        let owner = EntityRef::page("P");
        let owner_id = db.resolve_id(&owner, true).await.unwrap().unwrap();
        updater
            .on_query_answered(located_in_wonderland(&owner))
            .await
            .unwrap();
        updater.wait_idle().await.unwrap();

        let instance = located_in_wonderland(&owner)
            .query()
            .instance()
            .unwrap()
            .entity_ref();
        let instance_id = db.resolve_id(&instance, false).await.unwrap().unwrap();
        assert!(updater.links().has_links(instance_id).await.unwrap());

        let ask = db
            .resolve_id(&EntityRef::property(PROP_EMBEDDED_QUERY), true)
            .await
            .unwrap()
            .unwrap();
        let diff = ChangeDiff::new(owner_id).with_table(
            TableChange::fixed("query_table", PropertyRef::new(PROP_EMBEDDED_QUERY, ask))
                .delete(FieldChange::new(owner_id, None, Some(instance_id))),
        );
        updater.on_entity_updated(&diff).await.unwrap();
        assert!(!updater.links().has_links(instance_id).await.unwrap());
        assert_eq!(
            events.recv().await,
            Some(InvalidationEvent::InstancesRemoved(BTreeSet::from([
                instance_id
            ])))
        );
        updater.shutdown().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_repeated_triggers_are_damped() {
        let (updater, mut events, db, clock) = updater().await;
        let wonderland = db
            .resolve_id(&EntityRef::page("Wonderland"), true)
            .await
            .unwrap()
            .unwrap();
        let hatter = db
            .resolve_id(&EntityRef::page("Hatter"), true)
            .await
            .unwrap()
            .unwrap();
        let diff = population_edit(wonderland);

        let expected = BTreeSet::from([wonderland]);
        assert_eq!(updater.on_entity_updated(&diff).await.unwrap(), expected);
        assert_eq!(updater.on_entity_updated(&diff).await.unwrap(), expected);
        assert_eq!(db.touched_of(wonderland).await.unwrap(), Some(T0));
        assert_eq!(
            events.try_recv().ok(),
            Some(InvalidationEvent::Triggers(expected.clone()))
        );
        assert!(events.try_recv().is_err());
        updater.on_entity_updated(&population_edit(hatter)).await.unwrap();
        assert_eq!(updater.journal().len(), 2);

        clock.advance(updater.config().journal_ttl() + Duration::from_secs(1));
        updater.on_entity_updated(&diff).await.unwrap();
        assert_eq!(
            events.try_recv().ok(),
            Some(InvalidationEvent::Triggers(BTreeSet::from([hatter])))
        );
        assert_eq!(
            events.try_recv().ok(),
            Some(InvalidationEvent::Triggers(expected))
        );
        // the expired marker of Hatter is gone
        assert_eq!(updater.journal().len(), 1);
        updater.shutdown().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_deferred_disposal() {
        let (updater, mut events, db, _clock) = updater().await;
        let owner = EntityRef::page("P");
        updater
            .on_query_answered(located_in_wonderland(&owner))
            .await
            .unwrap();
        updater.wait_idle().await.unwrap();

        // never annotated, so every edge of the instance is an orphan
        assert_eq!(updater.dispose_orphans(100).await.unwrap(), 1);
        updater.wait_idle().await.unwrap();
        assert!(matches!(
            events.recv().await,
            Some(InvalidationEvent::InstancesRemoved(ids)) if ids.len() == 1
        ));
        assert_eq!(updater.dispose_orphans(100).await.unwrap(), 0);
        assert!(db.entity_count().await.unwrap() > 0);
        updater.shutdown().await.unwrap();
    }
}
