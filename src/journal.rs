use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;

use crate::{clock::Clock, properties::EntityId};

/// Short lived markers for entities whose invalidation was already broadcast. Lets repeated
/// updates of the same entity within the marker lifetime skip a redundant broadcast.
///
/// Markers are best effort: racing writers may both broadcast, which only costs a duplicate
/// eviction.
pub struct UpdateJournal {
    clock: Arc<dyn Clock>,
    ttl: Duration,
    markers: Mutex<HashMap<EntityId, i64>>,
}

impl UpdateJournal {
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> UpdateJournal {
        UpdateJournal {
            clock,
            ttl,
            markers: Mutex::new(HashMap::new()),
        }
    }

    fn expiry(&self) -> i64 {
        self.clock.now_millis() + self.ttl.as_millis() as i64
    }

    pub fn record(&self, ids: impl IntoIterator<Item = EntityId>) {
        let expires = self.expiry();
        let mut markers = self.markers.lock();
        for id in ids {
            markers.insert(id, expires);
        }
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        let now = self.clock.now_millis();
        self.markers
            .lock()
            .get(id)
            .is_some_and(|expires| *expires > now)
    }

    pub fn delete(&self, ids: impl IntoIterator<Item = EntityId>) {
        let mut markers = self.markers.lock();
        for id in ids {
            markers.remove(&id);
        }
    }

    /// Record `ids` and return those that carried no live marker. Expired markers are dropped on
    /// the way, so the journal only holds ids seen within the last marker lifetime.
    pub fn filter_unrecorded(&self, ids: &BTreeSet<EntityId>) -> BTreeSet<EntityId> {
        let now = self.clock.now_millis();
        let expires = self.expiry();
        let mut markers = self.markers.lock();
        markers.retain(|_, e| *e > now);
        let mut fresh = BTreeSet::new();
        for id in ids.iter() {
            if !markers.contains_key(id) {
                fresh.insert(*id);
            }
            markers.insert(*id, expires);
        }
        fresh
    }

    /// Drop expired markers, returning how many were removed.
    pub fn prune(&self) -> usize {
        let now = self.clock.now_millis();
        let mut markers = self.markers.lock();
        let before = markers.len();
        markers.retain(|_, expires| *expires > now);
        before - markers.len()
    }

    pub fn len(&self) -> usize {
        self.markers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
