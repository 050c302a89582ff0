//! Inbound remote delta listener.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::config::{CheckpointMode, EngineConfig};
use crate::error::Result;
use crate::models::{Origin, Record, Write, WriteOutcome};
use crate::remote::{RangeFilter, RemoteEvent, RemotePath, RemoteStore, Subscription};
use crate::services::LocalStore;
use crate::sync::debounce::RefreshScheduler;
use crate::sync::SyncEvent;
use crate::util::now_millis;

/// Applies remote child events of each collection to the local store
pub struct Listener {
    store: LocalStore,
    remote: Arc<dyn RemoteStore>,
    scheduler: Arc<RefreshScheduler>,
    events: broadcast::Sender<SyncEvent>,
    checkpoint_mode: CheckpointMode,
    resubscribe_delay: Duration,
    prune_on_attach: bool,
}

impl Listener {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteStore>,
        scheduler: Arc<RefreshScheduler>,
        events: broadcast::Sender<SyncEvent>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            remote,
            scheduler,
            events,
            checkpoint_mode: config.checkpoint_mode,
            resubscribe_delay: config.resubscribe_delay(),
            prune_on_attach: config.prune_on_attach,
        }
    }

    /// Listen to one collection until the task is aborted.
    ///
    /// A failed or ended subscription is re-established after the
    /// resubscribe delay, starting from the then-current checkpoint.
    pub async fn run(self: Arc<Self>, collection: String) {
        loop {
            match self.attach(&collection).await {
                Ok(mut subscription) => {
                    while let Some(event) = subscription.next().await {
                        if let Err(error) = self.apply(&collection, event).await {
                            tracing::warn!("Failed to apply remote delta on {collection}: {error}");
                        }
                    }
                    tracing::info!("Remote stream on {collection} ended");
                }
                Err(error) => {
                    tracing::warn!("Failed to attach listener on {collection}: {error}");
                    let _ = self.events.send(SyncEvent::ListenerError {
                        collection: collection.clone(),
                        message: error.to_string(),
                    });
                }
            }
            tokio::time::sleep(self.resubscribe_delay).await;
        }
    }

    /// Subscribe from the stored checkpoint, pruning first when enabled
    pub async fn attach(&self, collection: &str) -> Result<Subscription> {
        if self.prune_on_attach {
            self.prune(collection).await?;
        }

        let checkpoint = self.store.checkpoint(collection).await?;
        let subscription = self
            .remote
            .subscribe(collection, RangeFilter::updated_since(checkpoint))
            .await?;
        tracing::debug!("Listening on {collection} from updatedAt >= {checkpoint}");
        Ok(subscription)
    }

    /// One-shot catch-up: apply every remote child at or past the checkpoint.
    ///
    /// Returns how many children were applied.
    pub async fn catch_up(&self, collection: &str) -> Result<usize> {
        if self.prune_on_attach {
            self.prune(collection).await?;
        }

        let filter = RangeFilter::updated_since(self.store.checkpoint(collection).await?);
        let Some(Value::Object(children)) = self
            .remote
            .get(&RemotePath::collection(collection)?)
            .await?
        else {
            return Ok(0);
        };

        let mut applied = 0;
        for (key, value) in filter.select(children) {
            self.apply(collection, RemoteEvent::Added { key, value })
                .await?;
            applied += 1;
        }
        tracing::debug!("Caught up {applied} remote children of {collection}");
        Ok(applied)
    }

    async fn prune(&self, collection: &str) -> Result<()> {
        let remote_ids = self
            .remote
            .child_keys(&RemotePath::collection(collection)?)
            .await?;
        let pruned = self.store.prune_absent(collection, &remote_ids).await?;
        if pruned.is_empty() {
            return Ok(());
        }

        tracing::info!(
            "Pruned {} records of {collection} missing remotely",
            pruned.len()
        );
        for id in pruned {
            let _ = self.events.send(SyncEvent::RemoteRemoved {
                collection: collection.to_string(),
                id,
            });
        }
        self.scheduler.schedule(collection);
        Ok(())
    }

    /// Apply one remote child event
    pub async fn apply(&self, collection: &str, event: RemoteEvent) -> Result<()> {
        match event {
            RemoteEvent::Added { key, value } | RemoteEvent::Changed { key, value } => {
                let record = match Record::from_value(value) {
                    Ok(record) if record.id() == key => record,
                    Ok(record) => {
                        tracing::warn!(
                            "Skipping remote child {collection}/{key} whose id is {}",
                            record.id()
                        );
                        return Ok(());
                    }
                    Err(error) => {
                        tracing::warn!("Skipping malformed remote child {collection}/{key}: {error}");
                        return Ok(());
                    }
                };

                let candidate = match self.checkpoint_mode {
                    CheckpointMode::RecordTimestamp => record.updated_at().unwrap_or_else(now_millis),
                    CheckpointMode::WallClock => now_millis(),
                };
                let committed = self
                    .store
                    .commit(collection, Write::Put(record), Origin::Remote)
                    .await?;
                self.store.advance_checkpoint(collection, candidate).await?;

                if committed.outcome == WriteOutcome::Stale {
                    tracing::debug!("Ignored stale remote version of {collection}/{key}");
                } else {
                    let _ = self.events.send(SyncEvent::RemoteApplied {
                        collection: collection.to_string(),
                        id: key,
                    });
                }
            }
            RemoteEvent::Removed { key } => {
                let committed = self
                    .store
                    .commit(collection, Write::Remove(key.clone()), Origin::Remote)
                    .await?;
                if committed.outcome == WriteOutcome::Removed {
                    let _ = self.events.send(SyncEvent::RemoteRemoved {
                        collection: collection.to_string(),
                        id: key,
                    });
                }
            }
        }

        self.scheduler.schedule(collection);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        store: LocalStore,
        remote: MemoryRemote,
        listener: Arc<Listener>,
        refreshes: Arc<AtomicUsize>,
    }

    fn fixture(config: &EngineConfig) -> Fixture {
        let store = LocalStore::open_in_memory(&config.collections).unwrap();
        let remote = MemoryRemote::new();
        let refreshes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&refreshes);
        let scheduler = Arc::new(RefreshScheduler::new(config.debounce(), move |_collection| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));
        let (events, _) = broadcast::channel(64);
        let listener = Arc::new(Listener::new(
            store.clone(),
            Arc::new(remote.clone()),
            scheduler,
            events,
            config,
        ));
        Fixture {
            store,
            remote,
            listener,
            refreshes,
        }
    }

    fn config() -> EngineConfig {
        EngineConfig::new(vec!["products".to_string()])
    }

    fn added(value: serde_json::Value) -> RemoteEvent {
        RemoteEvent::Added {
            key: value["id"].as_str().unwrap_or("bad").to_string(),
            value,
        }
    }

    #[tokio::test]
    async fn applies_remote_record_without_queueing() {
        let f = fixture(&config());

        f.listener
            .apply("products", added(json!({"id": "p1", "qty": 3, "updatedAt": 1_000})))
            .await
            .unwrap();

        let stored = f.store.get("products", "p1").await.unwrap().unwrap();
        assert_eq!(stored.get("qty"), Some(&json!(3)));
        assert_eq!(stored.updated_at(), Some(1_000));
        assert_eq!(f.store.pending_count().await.unwrap(), 0);
        assert_eq!(f.store.checkpoint("products").await.unwrap(), 1_000);
    }

    #[tokio::test]
    async fn checkpoint_never_moves_backwards() {
        let f = fixture(&config());

        f.listener
            .apply("products", added(json!({"id": "p1", "updatedAt": 5_000})))
            .await
            .unwrap();
        f.listener
            .apply("products", added(json!({"id": "p2", "updatedAt": 2_000})))
            .await
            .unwrap();

        assert_eq!(f.store.checkpoint("products").await.unwrap(), 5_000);
        assert!(f.store.get("products", "p2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn wall_clock_mode_advances_to_now() {
        let mut config = config();
        config.checkpoint_mode = CheckpointMode::WallClock;
        let f = fixture(&config);
        let before = now_millis();

        f.listener
            .apply("products", added(json!({"id": "p1", "updatedAt": 10})))
            .await
            .unwrap();

        assert!(f.store.checkpoint("products").await.unwrap() >= before);
    }

    #[tokio::test]
    async fn malformed_children_are_skipped() {
        let f = fixture(&config());

        let events = [
            RemoteEvent::Added {
                key: "x1".to_string(),
                value: json!("not an object"),
            },
            RemoteEvent::Changed {
                key: "x2".to_string(),
                value: json!({"name": "no id"}),
            },
            RemoteEvent::Added {
                key: "x3".to_string(),
                value: json!({"id": "other"}),
            },
        ];
        for event in events {
            f.listener.apply("products", event).await.unwrap();
        }

        assert!(f.store.list("products").await.unwrap().is_empty());
        assert_eq!(f.store.checkpoint("products").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn removal_deletes_local_record() {
        let f = fixture(&config());
        f.listener
            .apply("products", added(json!({"id": "p1", "updatedAt": 1})))
            .await
            .unwrap();

        f.listener
            .apply(
                "products",
                RemoteEvent::Removed {
                    key: "p1".to_string(),
                },
            )
            .await
            .unwrap();

        assert!(f.store.get("products", "p1").await.unwrap().is_none());
        assert_eq!(f.store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn older_remote_version_loses_to_newer_local_one() {
        let f = fixture(&config());
        let record = Record::from_value(json!({"id": "p1", "qty": 9})).unwrap();
        let local = f
            .store
            .commit("products", Write::Put(record), Origin::Local)
            .await
            .unwrap()
            .record
            .unwrap();
        let local_at = local.updated_at().unwrap();

        f.listener
            .apply(
                "products",
                added(json!({"id": "p1", "qty": 1, "updatedAt": local_at - 10})),
            )
            .await
            .unwrap();

        let stored = f.store.get("products", "p1").await.unwrap().unwrap();
        assert_eq!(stored.get("qty"), Some(&json!(9)));
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_deltas_coalesces_into_one_refresh() {
        let f = fixture(&config());

        for (id, at) in [("p1", 1), ("p2", 2), ("p3", 3)] {
            f.listener
                .apply("products", added(json!({"id": id, "updatedAt": at})))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(f.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(f.store.list("products").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn attach_subscribes_from_checkpoint() {
        let f = fixture(&config());
        let old = RemotePath::record("products", "old").unwrap();
        let new = RemotePath::record("products", "new").unwrap();
        f.remote
            .set(&old, &json!({"id": "old", "updatedAt": 100}))
            .await
            .unwrap();
        f.remote
            .set(&new, &json!({"id": "new", "updatedAt": 900}))
            .await
            .unwrap();
        f.store.set_checkpoint("products", 500).await.unwrap();

        let mut subscription = f.listener.attach("products").await.unwrap();
        let first = subscription.next().await.unwrap();

        assert_eq!(first.key(), "new");
    }

    #[tokio::test]
    async fn catch_up_applies_children_past_checkpoint() {
        let f = fixture(&config());
        for (id, at) in [("a", 100), ("b", 600), ("c", 900)] {
            let path = RemotePath::record("products", id).unwrap();
            f.remote
                .set(&path, &json!({"id": id, "updatedAt": at}))
                .await
                .unwrap();
        }
        f.store.set_checkpoint("products", 500).await.unwrap();

        assert_eq!(f.listener.catch_up("products").await.unwrap(), 2);

        let ids: Vec<_> = f
            .store
            .list("products")
            .await
            .unwrap()
            .iter()
            .map(|record| record.id().to_string())
            .collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(f.store.checkpoint("products").await.unwrap(), 900);
        assert_eq!(f.listener.catch_up("empty").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn interrupted_replay_resumes_without_skipping_older_children() {
        let f = fixture(&config());
        for (id, at) in [("a", 900), ("b", 600)] {
            let path = RemotePath::record("products", id).unwrap();
            f.remote
                .set(&path, &json!({"id": id, "updatedAt": at}))
                .await
                .unwrap();
        }

        {
            // The stream drops after a single applied child
            let mut subscription = f.listener.attach("products").await.unwrap();
            let first = subscription.next().await.unwrap();
            assert_eq!(first.key(), "b");
            f.listener.apply("products", first).await.unwrap();
        }
        assert_eq!(f.store.checkpoint("products").await.unwrap(), 600);

        let mut subscription = f.listener.attach("products").await.unwrap();
        for _ in 0..2 {
            let event = subscription.next().await.unwrap();
            f.listener.apply("products", event).await.unwrap();
        }

        let ids: Vec<_> = f
            .store
            .list("products")
            .await
            .unwrap()
            .iter()
            .map(|record| record.id().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(f.store.checkpoint("products").await.unwrap(), 900);
    }

    #[tokio::test]
    async fn prune_on_attach_removes_only_clean_records() {
        let mut config = config();
        config.prune_on_attach = true;
        let f = fixture(&config);

        f.listener
            .apply("products", added(json!({"id": "gone", "updatedAt": 1})))
            .await
            .unwrap();
        let dirty = Record::from_value(json!({"id": "dirty"})).unwrap();
        f.store
            .commit("products", Write::Put(dirty), Origin::Local)
            .await
            .unwrap();
        let kept = RemotePath::record("products", "kept").unwrap();
        f.remote
            .set(&kept, &json!({"id": "kept", "updatedAt": 2}))
            .await
            .unwrap();

        let _subscription = f.listener.attach("products").await.unwrap();

        assert!(f.store.get("products", "gone").await.unwrap().is_none());
        assert!(f.store.get("products", "dirty").await.unwrap().is_some());
    }
}
