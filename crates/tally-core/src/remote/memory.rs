//! In-process remote store.
//!
//! Backs tests and single-host setups. Engines sharing one `MemoryRemote`
//! behave like devices sharing one backend.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc, watch};

use super::{
    RangeFilter, RemoteError, RemoteEvent, RemotePath, RemoteResult, RemoteStore, Subscription,
};

const EVENT_BUFFER: usize = 1024;

/// Failure a test can inject for a path or a whole collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    PermissionDenied,
    Throttled,
    Api,
}

impl Rejection {
    fn to_error(self, path: &RemotePath) -> RemoteError {
        match self {
            Self::PermissionDenied => RemoteError::PermissionDenied(path.to_string()),
            Self::Throttled => RemoteError::Throttled(path.to_string()),
            Self::Api => RemoteError::Api(format!("write to {path} rejected")),
        }
    }
}

type Tree = BTreeMap<String, BTreeMap<String, Value>>;

struct Inner {
    tree: Mutex<Tree>,
    events: broadcast::Sender<(String, RemoteEvent)>,
    epoch: watch::Sender<u64>,
    reachable: AtomicBool,
    rejections: Mutex<HashMap<String, Rejection>>,
    latency: Mutex<Option<Duration>>,
    writes: AtomicUsize,
}

/// Shared in-memory JSON tree
#[derive(Clone)]
pub struct MemoryRemote {
    inner: Arc<Inner>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::with_event_buffer(EVENT_BUFFER)
    }

    /// Remote whose live event fan-out holds `capacity` events per subscriber
    pub fn with_event_buffer(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        let (epoch, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                tree: Mutex::new(Tree::new()),
                events,
                epoch,
                reachable: AtomicBool::new(true),
                rejections: Mutex::new(HashMap::new()),
                latency: Mutex::new(None),
                writes: AtomicUsize::new(0),
            }),
        }
    }

    /// Simulate the network going up or down
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.inner.reachable.load(Ordering::SeqCst)
    }

    /// Reject writes to `path` (a record path or a collection name)
    pub fn reject(&self, path: &str, rejection: Rejection) {
        lock(&self.inner.rejections).insert(path.trim_matches('/').to_string(), rejection);
    }

    pub fn clear_rejections(&self) {
        lock(&self.inner.rejections).clear();
    }

    /// Delay every operation by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        *lock(&self.inner.latency) = latency;
    }

    /// Number of successful `set`/`remove` calls
    pub fn write_count(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// End every open subscription stream, as a dropped connection would
    pub fn disconnect_subscribers(&self) {
        self.inner.epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Snapshot of one collection
    pub fn collection(&self, collection: &str) -> BTreeMap<String, Value> {
        lock(&self.inner.tree)
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Children passing `filter` as added events, oldest first
    fn snapshot(&self, collection: &str, filter: &RangeFilter) -> Vec<RemoteEvent> {
        filter
            .select(self.collection(collection))
            .into_iter()
            .map(|(key, value)| RemoteEvent::Added { key, value })
            .collect()
    }

    async fn before_op(&self) -> RemoteResult<()> {
        let latency = *lock(&self.inner.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.is_reachable() {
            Ok(())
        } else {
            Err(RemoteError::Connectivity("memory remote is offline".to_string()))
        }
    }

    fn check_rejection(&self, path: &RemotePath) -> RemoteResult<()> {
        let rejections = lock(&self.inner.rejections);
        let collection = path.segments().next().unwrap_or_default();
        match rejections
            .get(path.as_str())
            .or_else(|| rejections.get(collection))
        {
            Some(rejection) => Err(rejection.to_error(path)),
            None => Ok(()),
        }
    }

    fn split(path: &RemotePath) -> RemoteResult<(&str, Option<&str>)> {
        let mut segments = path.segments();
        let collection = segments.next().unwrap_or_default();
        let key = segments.next();
        if segments.next().is_some() {
            return Err(RemoteError::InvalidPath(format!(
                "{path} is deeper than collection/id"
            )));
        }
        Ok((collection, key))
    }

    fn publish(&self, collection: &str, event: RemoteEvent) {
        // No receivers is fine
        let _ = self.inner.events.send((collection.to_string(), event));
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn set(&self, path: &RemotePath, value: &Value) -> RemoteResult<()> {
        self.before_op().await?;
        self.check_rejection(path)?;

        let (collection, Some(key)) = Self::split(path)? else {
            return Err(RemoteError::InvalidPath(format!(
                "{path} does not address a record"
            )));
        };

        let existed = lock(&self.inner.tree)
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), value.clone())
            .is_some();
        self.inner.writes.fetch_add(1, Ordering::SeqCst);

        let key = key.to_string();
        let value = value.clone();
        let event = if existed {
            RemoteEvent::Changed { key, value }
        } else {
            RemoteEvent::Added { key, value }
        };
        self.publish(collection, event);
        Ok(())
    }

    async fn remove(&self, path: &RemotePath) -> RemoteResult<()> {
        self.before_op().await?;
        self.check_rejection(path)?;

        let (collection, key) = Self::split(path)?;
        let removed: Vec<String> = {
            let mut tree = lock(&self.inner.tree);
            match key {
                Some(key) => tree
                    .get_mut(collection)
                    .and_then(|children| children.remove(key))
                    .map(|_| vec![key.to_string()])
                    .unwrap_or_default(),
                None => tree
                    .remove(collection)
                    .map(|children| children.into_keys().collect())
                    .unwrap_or_default(),
            }
        };
        self.inner.writes.fetch_add(1, Ordering::SeqCst);

        for key in removed {
            self.publish(collection, RemoteEvent::Removed { key });
        }
        Ok(())
    }

    async fn get(&self, path: &RemotePath) -> RemoteResult<Option<Value>> {
        self.before_op().await?;

        let (collection, key) = Self::split(path)?;
        let tree = lock(&self.inner.tree);
        let Some(children) = tree.get(collection) else {
            return Ok(None);
        };

        Ok(match key {
            Some(key) => children.get(key).cloned(),
            None if children.is_empty() => None,
            None => Some(Value::Object(
                children
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect::<Map<_, _>>(),
            )),
        })
    }

    async fn subscribe(
        &self,
        collection: &str,
        filter: RangeFilter,
    ) -> RemoteResult<Subscription> {
        self.before_op().await?;

        // Subscribe before taking the snapshot so nothing falls between them
        let mut live = self.inner.events.subscribe();
        let mut epoch = self.inner.epoch.subscribe();
        let snapshot = self.snapshot(collection, &filter);
        let mut present: HashSet<String> = self.collection(collection).into_keys().collect();

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let source = Arc::downgrade(&self.inner);
        let collection = collection.to_string();
        let task = tokio::spawn(async move {
            let mut high_water = filter.start_at;
            for event in snapshot {
                high_water = high_water.max(event_position(&event));
                if tx.send(event).await.is_err() {
                    return;
                }
            }

            loop {
                tokio::select! {
                    _ = epoch.changed() => {
                        tracing::debug!("Memory remote dropped subscription on {collection}");
                        return;
                    }
                    received = live.recv() => match received {
                        Ok((event_collection, event)) => {
                            if event_collection != collection {
                                continue;
                            }
                            let passes = match &event {
                                RemoteEvent::Added { key, value }
                                | RemoteEvent::Changed { key, value } => {
                                    present.insert(key.clone());
                                    filter.matches(value)
                                }
                                RemoteEvent::Removed { key } => {
                                    present.remove(key);
                                    true
                                }
                            };
                            if !passes {
                                continue;
                            }
                            high_water = high_water.max(event_position(&event));
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(
                                "Memory remote subscription on {collection} lagged by {skipped} events, replaying"
                            );
                            let Some(inner) = source.upgrade() else {
                                return;
                            };
                            let tree = Self { inner }.collection(&collection);
                            let mut gone: Vec<String> = present
                                .iter()
                                .filter(|key| !tree.contains_key(*key))
                                .cloned()
                                .collect();
                            gone.sort();
                            present = tree.keys().cloned().collect();

                            let since = RangeFilter {
                                field: filter.field.clone(),
                                start_at: high_water,
                            };
                            let replay = gone
                                .into_iter()
                                .map(|key| RemoteEvent::Removed { key })
                                .chain(since.select(tree).into_iter().map(|(key, value)| {
                                    RemoteEvent::Changed { key, value }
                                }));
                            for event in replay {
                                high_water = high_water.max(event_position(&event));
                                if tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        });

        Ok(Subscription::with_task(rx, task))
    }
}

fn event_position(event: &RemoteEvent) -> i64 {
    match event {
        RemoteEvent::Added { value, .. } | RemoteEvent::Changed { value, .. } => value
            .get(crate::models::UPDATED_AT_FIELD)
            .and_then(Value::as_i64)
            .unwrap_or(i64::MIN),
        RemoteEvent::Removed { .. } => i64::MIN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(raw: &str) -> RemotePath {
        RemotePath::new(raw).unwrap()
    }

    #[tokio::test]
    async fn set_get_remove_roundtrip() {
        let remote = MemoryRemote::new();
        let value = json!({"id": "p1", "name": "Widget"});

        remote.set(&path("products/p1"), &value).await.unwrap();
        assert_eq!(remote.get(&path("products/p1")).await.unwrap(), Some(value));
        assert_eq!(
            remote.child_keys(&path("products")).await.unwrap().len(),
            1
        );

        remote.remove(&path("products/p1")).await.unwrap();
        assert_eq!(remote.get(&path("products/p1")).await.unwrap(), None);
        assert_eq!(remote.get(&path("products")).await.unwrap(), None);
        assert_eq!(remote.write_count(), 2);
    }

    #[tokio::test]
    async fn offline_remote_reports_connectivity() {
        let remote = MemoryRemote::new();
        remote.set_reachable(false);

        let err = remote
            .set(&path("products/p1"), &json!({"id": "p1"}))
            .await
            .unwrap_err();
        assert!(err.is_connectivity());
        assert_eq!(remote.write_count(), 0);
    }

    #[tokio::test]
    async fn rejections_apply_to_path_or_collection() {
        let remote = MemoryRemote::new();
        remote.reject("sales", Rejection::PermissionDenied);
        remote.reject("products/p9", Rejection::Throttled);

        assert!(matches!(
            remote.set(&path("sales/s1"), &json!({"id": "s1"})).await,
            Err(RemoteError::PermissionDenied(_))
        ));
        assert!(matches!(
            remote.remove(&path("products/p9")).await,
            Err(RemoteError::Throttled(_))
        ));
        assert!(remote
            .set(&path("products/p1"), &json!({"id": "p1"}))
            .await
            .is_ok());

        remote.clear_rejections();
        assert!(remote.set(&path("sales/s1"), &json!({"id": "s1"})).await.is_ok());
    }

    #[tokio::test]
    async fn subscription_replays_snapshot_then_streams_live_events() {
        let remote = MemoryRemote::new();
        remote
            .set(&path("products/old"), &json!({"id": "old", "updatedAt": 1000}))
            .await
            .unwrap();
        remote
            .set(&path("products/p1"), &json!({"id": "p1", "updatedAt": 2000}))
            .await
            .unwrap();

        let mut sub = remote
            .subscribe("products", RangeFilter::updated_since(1500))
            .await
            .unwrap();

        assert_eq!(
            sub.next().await.unwrap(),
            RemoteEvent::Added {
                key: "p1".to_string(),
                value: json!({"id": "p1", "updatedAt": 2000}),
            }
        );

        remote
            .set(&path("sales/s1"), &json!({"id": "s1", "updatedAt": 9000}))
            .await
            .unwrap();
        remote
            .set(&path("products/p1"), &json!({"id": "p1", "updatedAt": 3000}))
            .await
            .unwrap();
        remote.remove(&path("products/old")).await.unwrap();

        assert!(matches!(sub.next().await, Some(RemoteEvent::Changed { key, .. }) if key == "p1"));
        assert_eq!(
            sub.next().await.unwrap(),
            RemoteEvent::Removed {
                key: "old".to_string()
            }
        );
    }

    #[tokio::test]
    async fn snapshot_is_sent_oldest_first() {
        let remote = MemoryRemote::new();
        for (id, at) in [("a", 900), ("b", 600), ("c", 100)] {
            remote
                .set(&path(&format!("products/{id}")), &json!({"id": id, "updatedAt": at}))
                .await
                .unwrap();
        }

        let mut sub = remote
            .subscribe("products", RangeFilter::updated_since(0))
            .await
            .unwrap();
        let mut keys = Vec::new();
        for _ in 0..3 {
            keys.push(sub.next().await.unwrap().key().to_string());
        }
        assert_eq!(keys, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn lagged_subscription_replays_from_high_water_mark() {
        let remote = MemoryRemote::with_event_buffer(2);
        remote
            .set(&path("products/gone"), &json!({"id": "gone", "updatedAt": 1}))
            .await
            .unwrap();
        let mut sub = remote
            .subscribe("products", RangeFilter::updated_since(0))
            .await
            .unwrap();

        // Nothing yields here, so the forwarding task falls behind
        remote.remove(&path("products/gone")).await.unwrap();
        for (id, at) in [("p1", 10), ("p2", 20), ("p3", 30)] {
            remote
                .set(&path(&format!("products/{id}")), &json!({"id": id, "updatedAt": at}))
                .await
                .unwrap();
        }

        assert!(matches!(sub.next().await, Some(RemoteEvent::Added { key, .. }) if key == "gone"));
        assert_eq!(
            sub.next().await.unwrap(),
            RemoteEvent::Removed {
                key: "gone".to_string()
            }
        );
        let mut replayed = Vec::new();
        for _ in 0..3 {
            match sub.next().await.unwrap() {
                RemoteEvent::Changed { key, .. } => replayed.push(key),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(replayed, vec!["p1", "p2", "p3"]);
    }

    #[tokio::test]
    async fn disconnect_ends_subscription_streams() {
        let remote = MemoryRemote::new();
        let mut sub = remote
            .subscribe("products", RangeFilter::updated_since(0))
            .await
            .unwrap();

        remote.disconnect_subscribers();
        assert!(sub.next().await.is_none());
    }
}
