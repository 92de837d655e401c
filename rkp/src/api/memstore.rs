use async_trait::async_trait;
use futures::{StreamExt, stream};
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::{Mutex, broadcast};

use crate::api::store::{ObjectStore, RawObject, StoreError, StoreEvent, StoreEventStream};

const WATCH_CHANNEL_CAPACITY: usize = 1024;
/// Events kept for watchers that start in the past.
pub const DEFAULT_HISTORY_LIMIT: usize = 10_000;

struct MemoryState {
    revision: i64,
    /// (kind, name) -> (value, mod revision)
    objects: BTreeMap<(&'static str, String), (String, i64)>,
    history: VecDeque<StoreEvent>,
    history_limit: usize,
    /// Watches may not start at or below this revision.
    compacted: i64,
}

impl MemoryState {
    fn record(&mut self, event: StoreEvent, tx: &broadcast::Sender<StoreEvent>) {
        self.history.push_back(event.clone());
        // no live watchers is fine
        let _ = tx.send(event);
        while self.history.len() > self.history_limit {
            if let Some(dropped) = self.history.pop_front() {
                self.compacted = self.compacted.max(dropped.revision);
            }
        }
    }
}

/// In-process [`ObjectStore`] with the same revision and compare-and-swap
/// semantics as Xline. Instances sharing one `Arc<MemoryStore>` behave like
/// processes sharing one cluster store.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Keeps at most `limit` events; older ones are compacted away.
    pub fn with_history_limit(limit: usize) -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(MemoryState {
                revision: 0,
                objects: BTreeMap::new(),
                history: VecDeque::new(),
                history_limit: limit.max(1),
                compacted: 0,
            }),
            events,
        }
    }

    /// Current store revision.
    pub async fn revision(&self) -> i64 {
        self.state.lock().await.revision
    }

    /// Drops history up to and including `revision`, like an etcd compaction.
    pub async fn compact(&self, revision: i64) {
        let mut state = self.state.lock().await;
        state.history.retain(|e| e.revision > revision);
        state.compacted = state.compacted.max(revision);
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, kind: &'static str, name: &str) -> Result<Option<RawObject>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .objects
            .get(&(kind, name.to_string()))
            .map(|(value, revision)| RawObject {
                name: name.to_string(),
                value: value.clone(),
                revision: *revision,
            }))
    }

    async fn list(&self, kind: &'static str) -> Result<(Vec<RawObject>, i64), StoreError> {
        let state = self.state.lock().await;
        let items = state
            .objects
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|((_, name), (value, revision))| RawObject {
                name: name.clone(),
                value: value.clone(),
                revision: *revision,
            })
            .collect();
        Ok((items, state.revision))
    }

    async fn create(
        &self,
        kind: &'static str,
        name: &str,
        value: String,
    ) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        let key = (kind, name.to_string());
        if state.objects.contains_key(&key) {
            return Err(StoreError::conflict(kind, name));
        }
        state.revision += 1;
        let revision = state.revision;
        state.objects.insert(key, (value.clone(), revision));
        state.record(
            StoreEvent {
                kind,
                name: name.to_string(),
                revision,
                value: Some(value),
            },
            &self.events,
        );
        Ok(revision)
    }

    async fn update(
        &self,
        kind: &'static str,
        name: &str,
        value: String,
        expected_revision: i64,
    ) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        let key = (kind, name.to_string());
        match state.objects.get(&key) {
            None => return Err(StoreError::not_found(kind, name)),
            Some((_, current)) if *current != expected_revision => {
                return Err(StoreError::conflict(kind, name));
            }
            Some(_) => {}
        }
        state.revision += 1;
        let revision = state.revision;
        state.objects.insert(key, (value.clone(), revision));
        state.record(
            StoreEvent {
                kind,
                name: name.to_string(),
                revision,
                value: Some(value),
            },
            &self.events,
        );
        Ok(revision)
    }

    async fn delete(
        &self,
        kind: &'static str,
        name: &str,
        expected_revision: Option<i64>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let key = (kind, name.to_string());
        match (state.objects.get(&key), expected_revision) {
            (None, _) => return Err(StoreError::not_found(kind, name)),
            (Some((_, current)), Some(expected)) if *current != expected => {
                return Err(StoreError::conflict(kind, name));
            }
            _ => {}
        }
        state.objects.remove(&key);
        state.revision += 1;
        let revision = state.revision;
        state.record(
            StoreEvent {
                kind,
                name: name.to_string(),
                revision,
                value: None,
            },
            &self.events,
        );
        Ok(())
    }

    async fn watch(&self, kind: &'static str, since: i64) -> Result<StoreEventStream, StoreError> {
        let state = self.state.lock().await;
        if state.compacted > 0 && since <= state.compacted {
            return Err(StoreError::Compacted(state.compacted));
        }
        let backlog: Vec<_> = state
            .history
            .iter()
            .filter(|e| e.kind == kind && e.revision >= since)
            .cloned()
            .map(Ok)
            .collect();
        // subscribing under the lock keeps backlog and live events gap free
        let rx = self.events.subscribe();
        drop(state);

        let live = stream::unfold(Some(rx), move |rx| async move {
            let mut rx = rx?;
            loop {
                match rx.recv().await {
                    Ok(event) if event.kind == kind => return Some((Ok(event), Some(rx))),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        return Some((Err(StoreError::WatchClosed), None));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream::iter(backlog).chain(live).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{Duration, timeout};

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = MemoryStore::new();
        let rev = store.create("leases", "a", "v1".into()).await.unwrap();
        assert!(
            store
                .create("leases", "a", "again".into())
                .await
                .unwrap_err()
                .is_conflict()
        );

        let rev2 = store.update("leases", "a", "v2".into(), rev).await.unwrap();
        assert!(rev2 > rev);
        assert!(
            store
                .update("leases", "a", "stale".into(), rev)
                .await
                .unwrap_err()
                .is_conflict()
        );
        assert!(
            store
                .update("leases", "b", "x".into(), rev)
                .await
                .unwrap_err()
                .is_not_found()
        );

        assert!(
            store
                .delete("leases", "a", Some(rev))
                .await
                .unwrap_err()
                .is_conflict()
        );
        store.delete("leases", "a", Some(rev2)).await.unwrap();
        assert!(store.get("leases", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_watch_replays_backlog_then_live() {
        let store = MemoryStore::new();
        store.create("storageclasses", "fast", "a".into()).await.unwrap();
        store.create("leases", "other-kind", "b".into()).await.unwrap();

        let mut events = store.watch("storageclasses", 1).await.unwrap();
        let first = events.next().await.unwrap().unwrap();
        assert_eq!(first.name, "fast");
        assert_eq!(first.revision, 1);

        store.delete("storageclasses", "fast", None).await.unwrap();
        let second = timeout(Duration::from_secs(1), events.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second.name, "fast");
        assert!(second.value.is_none());
    }

    #[tokio::test]
    async fn test_watch_from_compacted_revision_fails() {
        let store = MemoryStore::new();
        for i in 0..3 {
            store
                .create("persistentvolumes", &format!("pv-{i}"), "x".into())
                .await
                .unwrap();
        }
        store.compact(2).await;
        assert!(matches!(
            store.watch("persistentvolumes", 1).await,
            Err(StoreError::Compacted(2))
        ));
        let mut events = store.watch("persistentvolumes", 3).await.unwrap();
        assert_eq!(events.next().await.unwrap().unwrap().name, "pv-2");
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let store = MemoryStore::with_history_limit(16);
        let mut rev = store.create("leases", "a", "0".into()).await.unwrap();
        for i in 1..=100 {
            rev = store
                .update("leases", "a", i.to_string(), rev)
                .await
                .unwrap();
        }
        assert_eq!(store.state.lock().await.history.len(), 16);

        assert!(matches!(
            store.watch("leases", 1).await,
            Err(StoreError::Compacted(85))
        ));
        let mut events = store.watch("leases", rev - 15).await.unwrap();
        let oldest = events.next().await.unwrap().unwrap();
        assert_eq!(oldest.revision, rev - 15);
        assert_eq!(oldest.value.as_deref(), Some("85"));
    }
}
