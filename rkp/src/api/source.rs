use common::{Object, PersistentVolumeClaim, StorageClass};
use futures::stream::{self, BoxStream, SelectAll};
use futures::StreamExt;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::time::{Duration, sleep};

use crate::api::store::{ObjectStore, StoreError, StoreEvent, StoreEventStream};

const WATCHED_KINDS: [&str; 2] = [PersistentVolumeClaim::KIND, StorageClass::KIND];
const RELIST_BACKOFF_MIN: Duration = Duration::from_millis(100);
const RELIST_BACKOFF_MAX: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchedObject {
    Claim(PersistentVolumeClaim),
    StorageClass(StorageClass),
}

/// Typed notification for a claim or storage class.
///
/// `object` is `None` for deletions, and also when a stored value could not
/// be decoded; consumers only rely on `kind` and `name` and re-read the store.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectEvent {
    pub event_type: EventType,
    pub kind: &'static str,
    pub name: String,
    pub revision: i64,
    pub object: Option<WatchedObject>,
}

/// Typed access to the cluster store: reads, compare-and-swap writes and the
/// claim/storage class event stream.
#[derive(Clone)]
pub struct EventSource {
    store: Arc<dyn ObjectStore>,
}

impl EventSource {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub async fn get<T: Object>(&self, name: &str) -> Result<Option<T>, StoreError> {
        match self.store.get(T::KIND, name).await? {
            Some(raw) => Ok(Some(T::from_yaml(&raw.value, raw.revision)?)),
            None => Ok(None),
        }
    }

    /// Lists a kind, skipping values that fail to decode.
    pub async fn list<T: Object>(&self) -> Result<Vec<T>, StoreError> {
        let (items, _) = self.store.list(T::KIND).await?;
        Ok(items
            .into_iter()
            .filter_map(|raw| match T::from_yaml(&raw.value, raw.revision) {
                Ok(obj) => Some(obj),
                Err(e) => {
                    warn!("Ignoring undecodable {}/{}: {e}", T::KIND, raw.name);
                    None
                }
            })
            .collect())
    }

    /// Creates `obj`; fails with `Conflict` if the name is taken.
    pub async fn create<T: Object>(&self, obj: &T) -> Result<T, StoreError> {
        let revision = self
            .store
            .create(T::KIND, obj.name(), obj.to_yaml()?)
            .await?;
        let mut stored = obj.clone();
        stored.metadata_mut().resource_version = revision;
        Ok(stored)
    }

    /// Writes `obj` if the stored copy is still at `obj`'s resource version.
    pub async fn update<T: Object>(&self, obj: &T) -> Result<T, StoreError> {
        let revision = self
            .store
            .update(
                T::KIND,
                obj.name(),
                obj.to_yaml()?,
                obj.metadata().resource_version,
            )
            .await?;
        let mut stored = obj.clone();
        stored.metadata_mut().resource_version = revision;
        Ok(stored)
    }

    /// Deletes `obj` if the stored copy is still at `obj`'s resource version.
    pub async fn delete<T: Object>(&self, obj: &T) -> Result<(), StoreError> {
        self.store
            .delete(T::KIND, obj.name(), Some(obj.metadata().resource_version))
            .await
    }

    /// Endless stream of claim and storage class events.
    ///
    /// Starts with a listing, then follows the store watch. Whenever the
    /// watch breaks the stream re-lists, reporting objects that changed or
    /// vanished in the meantime, and resumes. Events may repeat; they are
    /// never lost. Nothing happens until the stream is polled.
    pub fn watch(&self) -> BoxStream<'static, ObjectEvent> {
        let state = WatchState {
            store: self.store.clone(),
            known: HashMap::new(),
            pending: VecDeque::new(),
            inner: None,
            backoff: RELIST_BACKOFF_MIN,
        };
        stream::unfold(state, |mut state| async move {
            let event = state.next_event().await;
            Some((event, state))
        })
        .boxed()
    }
}

struct WatchState {
    store: Arc<dyn ObjectStore>,
    /// Last revision seen per (kind, name).
    known: HashMap<(&'static str, String), i64>,
    pending: VecDeque<ObjectEvent>,
    inner: Option<SelectAll<StoreEventStream>>,
    backoff: Duration,
}

impl WatchState {
    async fn next_event(&mut self) -> ObjectEvent {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return event;
            }
            if self.inner.is_none() {
                if let Err(e) = self.relist().await {
                    warn!("Failed to list objects, retrying in {:?}: {e}", self.backoff);
                    sleep(self.backoff).await;
                    self.backoff = std::cmp::min(self.backoff * 2, RELIST_BACKOFF_MAX);
                }
                continue;
            }
            let Some(inner) = self.inner.as_mut() else {
                continue;
            };
            match inner.next().await {
                Some(Ok(event)) => self.apply(event),
                Some(Err(StoreError::Compacted(rev))) => {
                    info!("Watch revision compacted at {rev}, relisting");
                    self.inner = None;
                }
                Some(Err(e)) => {
                    warn!("Watch stream error, reconnecting: {e}");
                    self.inner = None;
                    sleep(self.backoff).await;
                }
                None => {
                    warn!("Watch channel closed, reconnecting...");
                    self.inner = None;
                    sleep(self.backoff).await;
                }
            }
        }
    }

    async fn relist(&mut self) -> Result<(), StoreError> {
        let mut since = i64::MAX;
        let mut seen = HashSet::new();
        for kind in WATCHED_KINDS {
            let (items, revision) = self.store.list(kind).await?;
            since = since.min(revision);
            for raw in items {
                let key = (kind, raw.name.clone());
                seen.insert(key.clone());
                let previous = self.known.insert(key, raw.revision);
                if previous == Some(raw.revision) {
                    continue;
                }
                let event_type = if previous.is_some() {
                    EventType::Modified
                } else {
                    EventType::Added
                };
                self.pending.push_back(ObjectEvent {
                    event_type,
                    kind,
                    object: decode(kind, &raw.name, &raw.value, raw.revision),
                    name: raw.name,
                    revision: raw.revision,
                });
            }
        }

        let vanished: Vec<_> = self
            .known
            .keys()
            .filter(|k| !seen.contains(*k))
            .cloned()
            .collect();
        for (kind, name) in vanished {
            self.known.remove(&(kind, name.clone()));
            self.pending.push_back(ObjectEvent {
                event_type: EventType::Deleted,
                kind,
                name,
                revision: since,
                object: None,
            });
        }

        let mut streams = SelectAll::new();
        for kind in WATCHED_KINDS {
            streams.push(self.store.watch(kind, since + 1).await?);
        }
        debug!("Relisted {} objects, watching from revision {}", seen.len(), since + 1);
        self.inner = Some(streams);
        self.backoff = RELIST_BACKOFF_MIN;
        Ok(())
    }

    fn apply(&mut self, event: StoreEvent) {
        let key = (event.kind, event.name.clone());
        let (event_type, object) = match &event.value {
            Some(value) => {
                let previous = self.known.get(&key).copied();
                if previous.is_some_and(|rev| rev >= event.revision) {
                    // already reported by the listing
                    return;
                }
                self.known.insert(key, event.revision);
                let event_type = if previous.is_some() {
                    EventType::Modified
                } else {
                    EventType::Added
                };
                (
                    event_type,
                    decode(event.kind, &event.name, value, event.revision),
                )
            }
            None => {
                self.known.remove(&key);
                (EventType::Deleted, None)
            }
        };
        self.pending.push_back(ObjectEvent {
            event_type,
            kind: event.kind,
            name: event.name,
            revision: event.revision,
            object,
        });
    }
}

fn decode(kind: &str, name: &str, value: &str, revision: i64) -> Option<WatchedObject> {
    let decoded = match kind {
        PersistentVolumeClaim::KIND => {
            PersistentVolumeClaim::from_yaml(value, revision).map(WatchedObject::Claim)
        }
        StorageClass::KIND => StorageClass::from_yaml(value, revision).map(WatchedObject::StorageClass),
        _ => return None,
    };
    match decoded {
        Ok(obj) => Some(obj),
        Err(e) => {
            warn!("Failed to decode {kind}/{name}: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::memstore::MemoryStore;
    use common::{ObjectMeta, PersistentVolumeClaimSpec, ReclaimPolicy};
    use tokio::time::timeout;

    fn claim(name: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim::new(ObjectMeta::named(name), PersistentVolumeClaimSpec::default())
    }

    async fn next(events: &mut BoxStream<'static, ObjectEvent>) -> ObjectEvent {
        timeout(Duration::from_secs(2), events.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
    }

    #[tokio::test]
    async fn test_list_then_watch() {
        let store = Arc::new(MemoryStore::new());
        let source = EventSource::new(store.clone());
        source.create(&claim("pvc-1")).await.unwrap();

        let mut events = source.watch();
        let first = next(&mut events).await;
        assert_eq!(first.event_type, EventType::Added);
        assert_eq!(first.kind, PersistentVolumeClaim::KIND);
        assert_eq!(first.name, "pvc-1");
        assert!(matches!(first.object, Some(WatchedObject::Claim(_))));

        source
            .create(&StorageClass::new("standard", "rk8s.io/nfs", ReclaimPolicy::Delete))
            .await
            .unwrap();
        let second = next(&mut events).await;
        assert_eq!(second.kind, StorageClass::KIND);
        assert_eq!(second.event_type, EventType::Added);

        let stored: PersistentVolumeClaim = source.get("pvc-1").await.unwrap().unwrap();
        source.delete(&stored).await.unwrap();
        let third = next(&mut events).await;
        assert_eq!(third.event_type, EventType::Deleted);
        assert_eq!(third.name, "pvc-1");
        assert!(third.object.is_none());
    }

    #[tokio::test]
    async fn test_update_is_compare_and_swap() {
        let store = Arc::new(MemoryStore::new());
        let source = EventSource::new(store);
        let stored = source.create(&claim("pvc-1")).await.unwrap();

        let mut first = stored.clone();
        first.metadata.labels.insert("a".into(), "1".into());
        let first = source.update(&first).await.unwrap();
        assert!(first.metadata.resource_version > stored.metadata.resource_version);

        let mut stale = stored.clone();
        stale.metadata.labels.insert("b".into(), "2".into());
        assert!(source.update(&stale).await.unwrap_err().is_conflict());

        let current: PersistentVolumeClaim = source.get("pvc-1").await.unwrap().unwrap();
        assert_eq!(current.metadata.labels.get("a").map(String::as_str), Some("1"));
        assert!(!current.metadata.labels.contains_key("b"));
    }

    #[tokio::test]
    async fn test_relist_after_compaction_reports_missed_changes() {
        let store = Arc::new(MemoryStore::new());
        let source = EventSource::new(store.clone());
        source.create(&claim("pvc-1")).await.unwrap();
        source.create(&claim("pvc-2")).await.unwrap();

        let mut events = source.watch();
        let mut names = vec![next(&mut events).await.name, next(&mut events).await.name];
        names.sort();
        assert_eq!(names, vec!["pvc-1", "pvc-2"]);

        // the open watch keeps working; a fresh one from an old revision
        // must relist instead
        let gone: PersistentVolumeClaim = source.get("pvc-2").await.unwrap().unwrap();
        source.delete(&gone).await.unwrap();
        let deleted = next(&mut events).await;
        assert_eq!(deleted.event_type, EventType::Deleted);

        store.compact(store.revision().await).await;
        let mut fresh = source.watch();
        let listed = next(&mut fresh).await;
        assert_eq!(listed.name, "pvc-1");
        assert_eq!(listed.event_type, EventType::Added);
    }

    #[tokio::test]
    async fn test_undecodable_value_still_notifies() {
        let store = Arc::new(MemoryStore::new());
        store
            .create(PersistentVolumeClaim::KIND, "broken", ": : not yaml".into())
            .await
            .unwrap();
        let source = EventSource::new(store);
        let mut events = source.watch();
        let event = next(&mut events).await;
        assert_eq!(event.name, "broken");
        assert!(event.object.is_none());
        assert!(source.list::<PersistentVolumeClaim>().await.unwrap().is_empty());
    }
}
