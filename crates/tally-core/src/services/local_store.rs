//! Shared local store service used by the engine and clients.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::db::{
    CheckpointRepository, Database, MutationQueue, RecordRepository, SqliteCheckpointRepository,
    SqliteMutationQueue, SqliteRecordRepository,
};
use crate::error::{Error, Result};
use crate::models::{
    next_local_timestamp, payload_for, DeadLetter, MutationAction, MutationId, Origin,
    PendingMutation, Record, SyncCheckpoint, SyncConflict, Write, WriteOutcome,
};
use rusqlite::Connection;

/// Result of committing a write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub outcome: WriteOutcome,
    /// Record as stored, for puts and patches
    pub record: Option<Record>,
    /// Mutation queued alongside a local write
    pub mutation: Option<PendingMutation>,
}

/// Thread-safe service over the local database.
///
/// Every operation takes the connection lock for its whole duration, so
/// concurrent readers never observe a half-applied write.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
    path: Option<PathBuf>,
}

impl LocalStore {
    /// Open a store at the given filesystem path and register `collections`.
    pub fn open_path<S: AsRef<str>>(
        path: impl Into<PathBuf>,
        collections: &[S],
    ) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Database::open(&path)?;
        db.ensure_collections(collections)?;
        tracing::debug!("Opened local store at {}", path.display());

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            path: Some(path),
        })
    }

    /// Open an in-memory store (primarily for tests).
    pub fn open_in_memory<S: AsRef<str>>(collections: &[S]) -> Result<Self> {
        let db = Database::open_in_memory()?;
        db.ensure_collections(collections)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            path: None,
        })
    }

    /// Filesystem location, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Register additional collections. Idempotent.
    pub async fn ensure_collections<S: AsRef<str>>(&self, collections: &[S]) -> Result<()> {
        let db = self.db.lock().await;
        db.ensure_collections(collections)
    }

    /// Registered collection names
    pub async fn collections(&self) -> Result<Vec<String>> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).list_collections()
    }

    /// Fetch a record by id.
    pub async fn get(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).get(collection, id)
    }

    /// Every record of a collection ordered by id.
    pub async fn list(&self, collection: &str) -> Result<Vec<Record>> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).list(collection)
    }

    /// Delete every record of one collection without queueing anything.
    pub async fn clear(&self, collection: &str) -> Result<usize> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).clear(collection)
    }

    /// Commit a write tagged with its origin.
    ///
    /// Local writes are stamped, stored and queued in one transaction.
    /// Remote writes go through [`Self::apply_remote`], which never touches
    /// the mutation queue.
    pub async fn commit(&self, collection: &str, write: Write, origin: Origin) -> Result<Committed> {
        match origin {
            Origin::Local => self.commit_local(collection, write).await,
            Origin::Remote => self.apply_remote(collection, write).await,
        }
    }

    async fn commit_local(&self, collection: &str, write: Write) -> Result<Committed> {
        let db = self.db.lock().await;
        let tx = db.connection().unchecked_transaction()?;
        let committed = Self::write_local(&tx, collection, write)?;
        tx.commit()?;

        if let Some(mutation) = &committed.mutation {
            tracing::debug!(
                "Queued {} for {collection}/{} (seq {})",
                mutation.action,
                mutation.record_id().unwrap_or_default(),
                mutation.seq
            );
        }
        Ok(committed)
    }

    fn write_local(conn: &Connection, collection: &str, write: Write) -> Result<Committed> {
        let records = SqliteRecordRepository::new(conn);
        let queue = SqliteMutationQueue::new(conn);
        let now = crate::util::now_millis();

        let (action, outcome, record) = match write {
            Write::Put(mut record) => {
                let existing = records.get(collection, record.id())?;
                record.stamp(next_local_timestamp(existing.as_ref(), now));
                let outcome = records.put(collection, &record)?;
                let action = if existing.is_some() {
                    MutationAction::Update
                } else {
                    MutationAction::Add
                };
                (action, outcome, record)
            }
            Write::Patch { id, fields } => {
                let mut record = records
                    .get(collection, &id)?
                    .ok_or_else(|| Error::not_found(collection, &id))?;
                let stamp = next_local_timestamp(Some(&record), now);
                record.merge(fields)?;
                record.stamp(stamp);
                let outcome = records.put(collection, &record)?;
                (MutationAction::Update, outcome, record)
            }
            Write::Remove(id) => {
                let record = records
                    .get(collection, &id)?
                    .ok_or_else(|| Error::not_found(collection, &id))?;
                records.remove(collection, &id)?;
                (MutationAction::Delete, WriteOutcome::Removed, record)
            }
        };

        if outcome == WriteOutcome::Stale {
            tracing::warn!(
                "Ignored stale local write to {collection}/{}",
                record.id()
            );
            return Ok(Committed {
                outcome,
                record: None,
                mutation: None,
            });
        }

        match (action, record.updated_at()) {
            (MutationAction::Delete, _) => {
                records.forget_local_versions(collection, record.id(), None)?;
            }
            (_, Some(stamp)) => records.remember_local_version(collection, record.id(), stamp)?,
            (_, None) => {}
        }

        let mutation = queue.enqueue(collection, action, &payload_for(action, &record))?;
        let record = (action != MutationAction::Delete).then_some(record);

        Ok(Committed {
            outcome,
            record,
            mutation: Some(mutation),
        })
    }

    /// Apply a remote-origin write.
    ///
    /// Only the record repository is reachable from here; remote deltas can
    /// never produce a pending mutation. An older copy of a version this
    /// client wrote itself is dropped without logging a conflict.
    pub async fn apply_remote(&self, collection: &str, write: Write) -> Result<Committed> {
        let db = self.db.lock().await;
        let tx = db.connection().unchecked_transaction()?;
        let committed = Self::write_remote(&tx, collection, write)?;
        tx.commit()?;
        Ok(committed)
    }

    fn write_remote(conn: &Connection, collection: &str, write: Write) -> Result<Committed> {
        let records = SqliteRecordRepository::new(conn);

        let (outcome, record) = match write {
            Write::Put(record) => {
                let stamp = record.updated_at();
                if let Some(stamp) = stamp {
                    if records.is_superseded_local_version(collection, record.id(), stamp)? {
                        tracing::debug!(
                            "Ignored echo of {collection}/{} at {stamp}",
                            record.id()
                        );
                        return Ok(Committed {
                            outcome: WriteOutcome::Stale,
                            record: None,
                            mutation: None,
                        });
                    }
                }

                let outcome = records.put(collection, &record)?;
                if outcome == WriteOutcome::Stored {
                    records.forget_local_versions(collection, record.id(), stamp)?;
                }
                (outcome, Some(record))
            }
            Write::Patch { id, fields } => {
                let mut record = records
                    .get(collection, &id)?
                    .ok_or_else(|| Error::not_found(collection, &id))?;
                record.merge(fields)?;
                (records.put(collection, &record)?, Some(record))
            }
            Write::Remove(id) => {
                records.forget_local_versions(collection, &id, None)?;
                if records.remove(collection, &id)? {
                    (WriteOutcome::Removed, None)
                } else {
                    (WriteOutcome::Missing, None)
                }
            }
        };

        let record = if outcome == WriteOutcome::Stale {
            None
        } else {
            record
        };

        Ok(Committed {
            outcome,
            record,
            mutation: None,
        })
    }

    /// Delete local records whose ids are absent remotely and have no queued mutation.
    ///
    /// Returns the pruned ids.
    pub async fn prune_absent(
        &self,
        collection: &str,
        remote_ids: &HashSet<String>,
    ) -> Result<Vec<String>> {
        let db = self.db.lock().await;
        let tx = db.connection().unchecked_transaction()?;
        let records = SqliteRecordRepository::new(&tx);
        let queue = SqliteMutationQueue::new(&tx);

        let mut pruned = Vec::new();
        for id in records.list_ids(collection)? {
            if remote_ids.contains(&id) || queue.has_pending_for(collection, &id)? {
                continue;
            }
            records.remove(collection, &id)?;
            pruned.push(id);
        }
        tx.commit()?;

        Ok(pruned)
    }

    /// Queued mutations in insertion order.
    pub async fn pending_mutations(&self) -> Result<Vec<PendingMutation>> {
        let db = self.db.lock().await;
        SqliteMutationQueue::new(db.connection()).peek_all()
    }

    /// Remove a mutation confirmed by the remote store.
    pub async fn confirm_mutation(&self, id: &MutationId) -> Result<bool> {
        let db = self.db.lock().await;
        SqliteMutationQueue::new(db.connection()).remove(id)
    }

    /// Charge a failed push attempt.
    pub async fn record_failure(
        &self,
        id: &MutationId,
        error: &str,
        next_attempt_at: i64,
    ) -> Result<PendingMutation> {
        let db = self.db.lock().await;
        SqliteMutationQueue::new(db.connection()).record_failure(id, error, next_attempt_at)
    }

    /// Move a mutation to dead letters.
    pub async fn quarantine(&self, id: &MutationId, reason: &str) -> Result<DeadLetter> {
        let db = self.db.lock().await;
        let tx = db.connection().unchecked_transaction()?;
        let letter = SqliteMutationQueue::new(&tx).quarantine(id, reason)?;
        tx.commit()?;
        Ok(letter)
    }

    /// Number of queued mutations.
    pub async fn pending_count(&self) -> Result<usize> {
        let db = self.db.lock().await;
        SqliteMutationQueue::new(db.connection()).pending_count()
    }

    /// Quarantined mutations, oldest first.
    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let db = self.db.lock().await;
        SqliteMutationQueue::new(db.connection()).list_dead_letters()
    }

    /// Number of quarantined mutations.
    pub async fn dead_letter_count(&self) -> Result<usize> {
        let db = self.db.lock().await;
        SqliteMutationQueue::new(db.connection()).dead_letter_count()
    }

    /// Put a dead letter back at the tail of the queue.
    ///
    /// The new entry carries the record as it is stored now, or a delete when
    /// it is gone, so a requeue never pushes a version older than the local one.
    pub async fn requeue_dead_letter(&self, id: &MutationId) -> Result<PendingMutation> {
        let db = self.db.lock().await;
        let tx = db.connection().unchecked_transaction()?;
        let queue = SqliteMutationQueue::new(&tx);
        let letter = queue
            .get_dead_letter(id)?
            .ok_or_else(|| Error::not_found("dead_letters", &id.as_str()))?;

        let mutation = &letter.mutation;
        let (action, payload) = match mutation.record_id() {
            Ok(record_id) => {
                match SqliteRecordRepository::new(&tx).get(&mutation.collection, record_id)? {
                    Some(current) => {
                        let action = match mutation.action {
                            MutationAction::Delete => MutationAction::Update,
                            action => action,
                        };
                        (action, payload_for(action, &current))
                    }
                    None => (
                        MutationAction::Delete,
                        serde_json::Value::String(record_id.to_string()),
                    ),
                }
            }
            // Malformed entries go back as they were and get quarantined again
            Err(_) => (mutation.action, mutation.payload.clone()),
        };

        let requeued = queue.requeue_dead_letter(id, action, &payload)?;
        tx.commit()?;
        Ok(requeued)
    }

    /// Drop a dead letter.
    pub async fn discard_dead_letter(&self, id: &MutationId) -> Result<bool> {
        let db = self.db.lock().await;
        SqliteMutationQueue::new(db.connection()).discard_dead_letter(id)
    }

    /// Checkpoint of a collection, 0 when never set.
    pub async fn checkpoint(&self, collection: &str) -> Result<i64> {
        let db = self.db.lock().await;
        SqliteCheckpointRepository::new(db.connection()).get(collection)
    }

    /// Overwrite a checkpoint.
    pub async fn set_checkpoint(&self, collection: &str, last_synced_at: i64) -> Result<()> {
        let db = self.db.lock().await;
        SqliteCheckpointRepository::new(db.connection()).set(collection, last_synced_at)
    }

    /// Move a checkpoint forward, never backwards. Returns the stored value.
    pub async fn advance_checkpoint(&self, collection: &str, candidate: i64) -> Result<i64> {
        let db = self.db.lock().await;
        SqliteCheckpointRepository::new(db.connection()).advance(collection, candidate)
    }

    /// Every stored checkpoint.
    pub async fn checkpoints(&self) -> Result<Vec<SyncCheckpoint>> {
        let db = self.db.lock().await;
        SqliteCheckpointRepository::new(db.connection()).list()
    }

    /// List recently recorded LWW conflicts.
    pub async fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).list_conflicts(limit)
    }

    /// Wipe records, queue, dead letters, checkpoints and conflicts (logout).
    ///
    /// Registered collections survive so the store stays usable.
    pub async fn clear_all(&self) -> Result<()> {
        let db = self.db.lock().await;
        let tx = db.connection().unchecked_transaction()?;
        {
            let records = SqliteRecordRepository::new(&tx);
            for collection in records.list_collections()? {
                records.clear(&collection)?;
            }
        }
        SqliteMutationQueue::new(&tx).clear()?;
        SqliteCheckpointRepository::new(&tx).clear()?;
        tx.execute("DELETE FROM sync_conflicts", [])?;
        tx.execute("DELETE FROM local_versions", [])?;
        tx.commit()?;

        tracing::info!("Cleared local store");
        Ok(())
    }
}
