//! Engine instance tying the local store, the drainer and the listeners together.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::models::{DeadLetter, MutationId, Origin, PendingMutation, Record, Write};
use crate::remote::{MemoryRemote, RemoteStore};
use crate::services::{Committed, LocalStore};
use crate::state::EngineStatus;
use crate::sync::connectivity::{Connectivity, OnlineFlag};
use crate::sync::debounce::RefreshScheduler;
use crate::sync::drainer::{DrainOutcome, Drainer};
use crate::sync::listener::Listener;
use crate::sync::notifier::{ChangeBus, ChangeMessage, ContextId};
use crate::sync::SyncEvent;

const EVENT_CAPACITY: usize = 256;

type View = watch::Sender<Arc<Vec<Record>>>;

/// Assembles an [`Engine`]. Unset parts fall back to an in-memory store,
/// an in-memory remote, an always-online flag and a private change bus.
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<LocalStore>,
    remote: Option<Arc<dyn RemoteStore>>,
    connectivity: Option<Arc<dyn Connectivity>>,
    bus: Option<ChangeBus>,
}

impl EngineBuilder {
    #[must_use]
    pub fn store(mut self, store: LocalStore) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    #[must_use]
    pub fn connectivity(mut self, connectivity: Arc<dyn Connectivity>) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Share a change bus with sibling engines over the same store
    #[must_use]
    pub fn bus(mut self, bus: ChangeBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Validate the config, register collections and load initial views
    pub async fn build(self) -> Result<Engine> {
        let Self {
            config,
            store,
            remote,
            connectivity,
            bus,
        } = self;
        config.validate()?;

        let store = match store {
            Some(store) => {
                store.ensure_collections(&config.collections).await?;
                store
            }
            None => LocalStore::open_in_memory(&config.collections)?,
        };
        let remote = remote.unwrap_or_else(|| Arc::new(MemoryRemote::new()));
        let connectivity = connectivity.unwrap_or_else(|| Arc::new(OnlineFlag::default()));
        let bus = bus.unwrap_or_default();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let views: HashMap<String, View> = config
            .collections
            .iter()
            .map(|name| (name.clone(), watch::channel(Arc::new(Vec::new())).0))
            .collect();

        let inner = Arc::new_cyclic(|engine: &Weak<EngineInner>| {
            let engine = engine.clone();
            let scheduler = Arc::new(RefreshScheduler::new(
                config.debounce(),
                move |collection: String| {
                    let engine = engine.clone();
                    async move {
                        let Some(inner) = engine.upgrade() else {
                            return;
                        };
                        if let Err(error) = inner.refresh(&collection).await {
                            tracing::warn!("Debounced refresh of {collection} failed: {error}");
                        }
                    }
                },
            ));
            let drainer = Arc::new(Drainer::new(
                store.clone(),
                Arc::clone(&remote),
                Arc::clone(&connectivity),
                config.clone(),
                events.clone(),
            ));
            let listener = Arc::new(Listener::new(
                store.clone(),
                Arc::clone(&remote),
                Arc::clone(&scheduler),
                events.clone(),
                &config,
            ));

            EngineInner {
                config,
                store,
                connectivity,
                bus,
                context: ContextId::new(),
                drainer,
                listener,
                scheduler,
                views,
                events,
                tasks: Mutex::new(None),
            }
        });

        for collection in &inner.config.collections {
            inner.refresh(collection).await?;
        }
        tracing::debug!("Engine {} ready", inner.context);

        Ok(Engine { inner })
    }
}

struct EngineInner {
    config: EngineConfig,
    store: LocalStore,
    connectivity: Arc<dyn Connectivity>,
    bus: ChangeBus,
    context: ContextId,
    drainer: Arc<Drainer>,
    listener: Arc<Listener>,
    scheduler: Arc<RefreshScheduler>,
    views: HashMap<String, View>,
    events: broadcast::Sender<SyncEvent>,
    tasks: Mutex<Option<JoinSet<()>>>,
}

impl EngineInner {
    fn ensure_managed(&self, collection: &str) -> Result<()> {
        if self.config.manages(collection) {
            Ok(())
        } else {
            Err(Error::UnknownCollection(collection.to_string()))
        }
    }

    async fn refresh(&self, collection: &str) -> Result<Arc<Vec<Record>>> {
        let view = self
            .views
            .get(collection)
            .ok_or_else(|| Error::UnknownCollection(collection.to_string()))?;
        let records = Arc::new(self.store.list(collection).await?);
        view.send_replace(Arc::clone(&records));
        let _ = self.events.send(SyncEvent::Refreshed {
            collection: collection.to_string(),
            records: records.len(),
        });
        Ok(records)
    }
}

/// Offline-first sync engine.
///
/// Cloning is cheap; clones drive the same instance.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            store: None,
            remote: None,
            connectivity: None,
            bus: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &LocalStore {
        &self.inner.store
    }

    /// Identity of this engine on the change bus
    pub fn context_id(&self) -> ContextId {
        self.inner.context
    }

    /// Spawn the drain loop, the listeners and the change-bus receivers.
    ///
    /// Returns `false` when the engine was already running.
    pub async fn start(&self) -> bool {
        let mut tasks = self.inner.tasks.lock().await;
        if tasks.is_some() {
            tracing::debug!("Engine {} already running", self.inner.context);
            return false;
        }

        let mut set = JoinSet::new();
        set.spawn(drain_loop(
            Arc::clone(&self.inner.drainer),
            self.inner.config.drain_interval(),
        ));
        for collection in &self.inner.config.collections {
            set.spawn(Arc::clone(&self.inner.listener).run(collection.clone()));
            set.spawn(watch_bus(
                Arc::downgrade(&self.inner),
                self.inner.bus.subscribe(collection),
                collection.clone(),
            ));
        }
        *tasks = Some(set);

        tracing::info!(
            "Sync engine started for {} collections",
            self.inner.config.collections.len()
        );
        true
    }

    /// Abort every task. Returns `false` when the engine was not running.
    pub async fn stop(&self) -> bool {
        let Some(mut set) = self.inner.tasks.lock().await.take() else {
            return false;
        };
        set.shutdown().await;
        self.inner.scheduler.shutdown();
        tracing::info!("Sync engine stopped");
        true
    }

    pub async fn is_running(&self) -> bool {
        self.inner.tasks.lock().await.is_some()
    }

    async fn local_write(&self, collection: &str, write: Write) -> Result<Committed> {
        self.inner.ensure_managed(collection)?;
        let committed = self
            .inner
            .store
            .commit(collection, write, Origin::Local)
            .await?;
        self.inner.bus.post_update(collection, self.inner.context);
        self.inner.refresh(collection).await?;
        Ok(committed)
    }

    /// Insert or replace a record. Returns it as stored, with `updatedAt`.
    pub async fn add(&self, collection: &str, record: Record) -> Result<Record> {
        let id = record.id().to_string();
        self.local_write(collection, Write::Put(record))
            .await?
            .record
            .ok_or_else(|| Error::not_found(collection, &id))
    }

    /// Shallow-merge `patch` into an existing record
    pub async fn edit(
        &self,
        collection: &str,
        id: &str,
        patch: Map<String, Value>,
    ) -> Result<Record> {
        let write = Write::Patch {
            id: id.to_string(),
            fields: patch,
        };
        self.local_write(collection, write)
            .await?
            .record
            .ok_or_else(|| Error::not_found(collection, id))
    }

    pub async fn remove(&self, collection: &str, id: &str) -> Result<()> {
        self.local_write(collection, Write::Remove(id.to_string()))
            .await?;
        Ok(())
    }

    /// Re-read a collection and publish the snapshot to its watchers
    pub async fn refresh(&self, collection: &str) -> Result<Arc<Vec<Record>>> {
        self.inner.refresh(collection).await
    }

    pub async fn get(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        self.inner.ensure_managed(collection)?;
        self.inner.store.get(collection, id).await
    }

    pub async fn list(&self, collection: &str) -> Result<Vec<Record>> {
        self.inner.ensure_managed(collection)?;
        self.inner.store.list(collection).await
    }

    /// Latest snapshot of a collection, ordered by id
    pub fn watch(&self, collection: &str) -> Result<watch::Receiver<Arc<Vec<Record>>>> {
        self.inner
            .views
            .get(collection)
            .map(watch::Sender::subscribe)
            .ok_or_else(|| Error::UnknownCollection(collection.to_string()))
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub async fn status(&self) -> Result<EngineStatus> {
        let pending = self.inner.store.pending_count().await?;
        let dead_letters = self.inner.store.dead_letter_count().await?;
        let online = self.inner.connectivity.is_online();
        Ok(EngineStatus {
            state: EngineStatus::derive(online, pending, dead_letters),
            running: self.is_running().await,
            pending,
            dead_letters,
            last_drained_at: self.inner.drainer.last_drained_at(),
        })
    }

    /// Run a drain cycle now, subject to the same single-flight guard
    pub async fn drain_now(&self) -> Result<DrainOutcome> {
        self.inner.drainer.drain().await
    }

    /// Apply remote changes since each checkpoint without subscribing.
    ///
    /// Returns the number of remote records applied.
    pub async fn pull(&self) -> Result<usize> {
        let mut applied = 0;
        for collection in &self.inner.config.collections {
            applied += self.inner.listener.catch_up(collection).await?;
            self.inner.refresh(collection).await?;
        }
        Ok(applied)
    }

    /// Highest number of drain cycles observed running at once
    pub fn max_concurrent_drains(&self) -> usize {
        self.inner.drainer.peak_concurrency()
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.inner.store.dead_letters().await
    }

    pub async fn requeue_dead_letter(&self, id: &MutationId) -> Result<PendingMutation> {
        let mutation = self.inner.store.requeue_dead_letter(id).await?;
        tracing::info!("Requeued {} for {}", mutation.id, mutation.collection);
        Ok(mutation)
    }

    pub async fn discard_dead_letter(&self, id: &MutationId) -> Result<bool> {
        self.inner.store.discard_dead_letter(id).await
    }

    /// Wipe local data (logout) and publish empty views
    pub async fn clear_all(&self) -> Result<()> {
        self.inner.store.clear_all().await?;
        for collection in &self.inner.config.collections {
            self.inner.bus.post_update(collection, self.inner.context);
            self.inner.refresh(collection).await?;
        }
        tracing::info!("Cleared local data");
        Ok(())
    }
}

async fn drain_loop(drainer: Arc<Drainer>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Dropped with the loop, aborting any cycle still running
    let mut cycles = JoinSet::new();

    loop {
        ticker.tick().await;
        while cycles.try_join_next().is_some() {}

        let drainer = Arc::clone(&drainer);
        cycles.spawn(async move {
            match drainer.drain().await {
                Ok(DrainOutcome::Completed(report))
                    if report.pushed + report.failed + report.quarantined > 0 =>
                {
                    tracing::info!(
                        "Drained {} mutations ({} failed, {} quarantined, {} remaining)",
                        report.pushed,
                        report.failed,
                        report.quarantined,
                        report.remaining
                    );
                }
                Ok(outcome) => tracing::trace!("Drain tick: {outcome:?}"),
                Err(error) => tracing::warn!("Drain cycle failed: {error}"),
            }
        });
    }
}

async fn watch_bus(
    engine: Weak<EngineInner>,
    mut messages: broadcast::Receiver<ChangeMessage>,
    collection: String,
) {
    loop {
        let sender = match messages.recv().await {
            Ok(message) => Some(message.sender),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!("Change bus for {collection} lagged by {skipped} messages");
                None
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        let Some(inner) = engine.upgrade() else {
            return;
        };
        if sender == Some(inner.context) {
            continue;
        }
        if let Err(error) = inner.refresh(&collection).await {
            tracing::warn!("Refresh of {collection} after change message failed: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn record(value: Value) -> Record {
        Record::from_value(value).unwrap()
    }

    async fn engine() -> Engine {
        Engine::builder(EngineConfig::new(vec!["products".to_string()]))
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let engine = engine().await;

        assert!(engine.start().await);
        assert!(!engine.start().await);
        assert!(engine.is_running().await);

        assert!(engine.stop().await);
        assert!(!engine.stop().await);
        assert!(!engine.is_running().await);

        assert!(engine.start().await);
        assert!(engine.stop().await);
    }

    #[tokio::test]
    async fn crud_updates_view_and_queue() {
        let engine = engine().await;
        let mut view = engine.watch("products").unwrap();
        assert!(view.borrow_and_update().is_empty());

        let stored = engine
            .add("products", record(json!({"id": "p1", "name": "Widget"})))
            .await
            .unwrap();
        assert!(stored.updated_at().is_some());
        assert!(view.has_changed().unwrap());
        assert_eq!(view.borrow_and_update().len(), 1);

        let mut patch = Map::new();
        patch.insert("name".to_string(), json!("Gadget"));
        let edited = engine.edit("products", "p1", patch).await.unwrap();
        assert_eq!(edited.get("name"), Some(&json!("Gadget")));
        assert!(edited.updated_at() > stored.updated_at());

        engine.remove("products", "p1").await.unwrap();
        assert!(engine.list("products").await.unwrap().is_empty());

        let queue = engine.store().pending_mutations().await.unwrap();
        let actions: Vec<_> = queue.iter().map(|m| m.action.as_str()).collect();
        assert_eq!(actions, vec!["add", "update", "delete"]);
    }

    #[tokio::test]
    async fn unknown_collection_is_rejected() {
        let engine = engine().await;

        let error = engine
            .add("reports", record(json!({"id": "r1"})))
            .await
            .unwrap_err();
        assert!(matches!(error, Error::UnknownCollection(name) if name == "reports"));
        assert!(engine.watch("reports").is_err());
    }

    #[tokio::test]
    async fn editing_missing_record_fails_without_queueing() {
        let engine = engine().await;

        let error = engine.edit("products", "nope", Map::new()).await.unwrap_err();
        assert!(matches!(error, Error::NotFound { .. }));
        assert!(matches!(
            engine.remove("products", "nope").await,
            Err(Error::NotFound { .. })
        ));
        assert_eq!(engine.store().pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn status_reflects_connectivity_and_queue() {
        let online = OnlineFlag::new(false);
        let engine = Engine::builder(EngineConfig::new(vec!["products".to_string()]))
            .connectivity(Arc::new(online.clone()))
            .build()
            .await
            .unwrap();
        engine
            .add("products", record(json!({"id": "p1"})))
            .await
            .unwrap();

        let status = engine.status().await.unwrap();
        assert_eq!(status.state.label(), "offline");
        assert_eq!(status.pending, 1);
        assert_eq!(status.summary(), "1 item pending sync");

        online.set_online(true);
        assert_eq!(engine.status().await.unwrap().state.label(), "syncing");
        assert!(matches!(engine.drain_now().await.unwrap(), DrainOutcome::Completed(_)));
        let status = engine.status().await.unwrap();
        assert_eq!(status.state.label(), "synced");
        assert!(status.last_drained_at.is_some());
    }

    #[tokio::test]
    async fn clear_all_empties_views() {
        let engine = engine().await;
        engine
            .add("products", record(json!({"id": "p1"})))
            .await
            .unwrap();
        let view = engine.watch("products").unwrap();

        engine.clear_all().await.unwrap();

        assert!(view.borrow().is_empty());
        assert_eq!(engine.status().await.unwrap().pending, 0);
    }
}
