//! Outbound drain of the mutation queue.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::models::{MutationAction, PendingMutation};
use crate::remote::{RemoteError, RemotePath, RemoteStore};
use crate::services::LocalStore;
use crate::sync::connectivity::Connectivity;
use crate::sync::SyncEvent;
use crate::util::now_millis;

/// Counts of one completed drain cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries confirmed by the remote and removed from the queue
    pub pushed: usize,
    /// Entries charged an attempt and rescheduled
    pub failed: usize,
    /// Entries moved to dead letters
    pub quarantined: usize,
    /// Entries left untouched (backing off or behind a held entry)
    pub held: usize,
    /// Cycle stopped early because the remote became unreachable
    pub interrupted: bool,
    /// Queue depth after the cycle
    pub remaining: usize,
}

/// What a drain request did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Another cycle was already running
    Skipped,
    /// Connectivity reported offline; nothing was attempted
    Offline,
    /// Cycle ran past the drain timeout and was cancelled
    TimedOut,
    Completed(DrainReport),
}

/// Releases the single-flight flag however the cycle ends
struct FlightGuard<'a> {
    flag: &'a AtomicBool,
    active: &'a AtomicUsize,
}

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool, active: &'a AtomicUsize, peak: &AtomicUsize) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now_active, Ordering::SeqCst);
        Some(Self { flag, active })
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.flag.store(false, Ordering::Release);
    }
}

enum Failure {
    Invalid(String),
    Offline(RemoteError),
    Rejected(RemoteError),
}

/// Pushes queued local mutations to the remote store
pub struct Drainer {
    store: LocalStore,
    remote: Arc<dyn RemoteStore>,
    connectivity: Arc<dyn Connectivity>,
    config: EngineConfig,
    events: broadcast::Sender<SyncEvent>,
    in_flight: AtomicBool,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    last_drained_at: AtomicI64,
}

impl Drainer {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteStore>,
        connectivity: Arc<dyn Connectivity>,
        config: EngineConfig,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        Self {
            store,
            remote,
            connectivity,
            config,
            events,
            in_flight: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
            last_drained_at: AtomicI64::new(0),
        }
    }

    /// Whether a cycle is running right now
    pub fn is_draining(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Highest number of cycles ever observed running at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    /// Unix ms of the last cycle that was not interrupted
    pub fn last_drained_at(&self) -> Option<i64> {
        match self.last_drained_at.load(Ordering::SeqCst) {
            0 => None,
            at => Some(at),
        }
    }

    /// Run one drain cycle unless one is already in flight
    pub async fn drain(&self) -> Result<DrainOutcome> {
        let Some(_guard) = FlightGuard::acquire(&self.in_flight, &self.active, &self.peak_active)
        else {
            tracing::trace!("Drain already in flight, skipping");
            return Ok(DrainOutcome::Skipped);
        };

        if !self.connectivity.is_online() {
            tracing::trace!("Offline, leaving queue untouched");
            return Ok(DrainOutcome::Offline);
        }

        match tokio::time::timeout(self.config.drain_timeout(), self.run_cycle()).await {
            Ok(report) => report.map(DrainOutcome::Completed),
            Err(_) => {
                tracing::warn!(
                    "Drain cycle exceeded {}ms and was cancelled",
                    self.config.drain_timeout_ms
                );
                Ok(DrainOutcome::TimedOut)
            }
        }
    }

    async fn run_cycle(&self) -> Result<DrainReport> {
        let queue = self.store.pending_mutations().await?;
        let mut report = DrainReport::default();
        if queue.is_empty() {
            self.last_drained_at.store(now_millis(), Ordering::SeqCst);
            return Ok(report);
        }

        let now = now_millis();
        let mut held: HashSet<String> = HashSet::new();

        for mutation in queue {
            if held.contains(&mutation.collection) || !mutation.is_due(now) {
                held.insert(mutation.collection.clone());
                report.held += 1;
                continue;
            }

            match self.push(&mutation).await {
                Ok(()) => {
                    self.store.confirm_mutation(&mutation.id).await?;
                    report.pushed += 1;
                    tracing::debug!(
                        "Pushed {} {}/{}",
                        mutation.action,
                        mutation.collection,
                        mutation.record_id().unwrap_or_default()
                    );
                }
                Err(Failure::Invalid(reason)) => {
                    self.quarantine(&mutation, &reason).await?;
                    report.quarantined += 1;
                }
                Err(Failure::Offline(error)) => {
                    tracing::info!("Remote unreachable mid-drain, stopping cycle: {error}");
                    report.interrupted = true;
                    break;
                }
                Err(Failure::Rejected(error)) => {
                    held.insert(mutation.collection.clone());
                    let attempts = mutation.attempts.saturating_add(1);
                    if attempts >= self.config.max_attempts {
                        let reason = format!("gave up after {attempts} attempts: {error}");
                        self.quarantine(&mutation, &reason).await?;
                        report.quarantined += 1;
                    } else {
                        let delay = self.config.backoff_after(attempts);
                        let next_attempt_at = now_millis()
                            .saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX));
                        self.store
                            .record_failure(&mutation.id, &error.to_string(), next_attempt_at)
                            .await?;
                        report.failed += 1;
                        tracing::warn!(
                            "Push of {} {} failed (attempt {attempts}), retrying in {}ms: {error}",
                            mutation.action,
                            mutation.collection,
                            delay.as_millis()
                        );
                    }
                }
            }
        }

        report.remaining = self.store.pending_count().await?;
        if !report.interrupted {
            self.last_drained_at.store(now_millis(), Ordering::SeqCst);
        }

        let _ = self.events.send(SyncEvent::DrainCompleted {
            pushed: report.pushed,
            failed: report.failed,
            quarantined: report.quarantined,
            remaining: report.remaining,
        });
        Ok(report)
    }

    async fn push(&self, mutation: &PendingMutation) -> std::result::Result<(), Failure> {
        let id = mutation
            .record_id()
            .map_err(|error| Failure::Invalid(error.to_string()))?;
        let path = RemotePath::record(&mutation.collection, id)
            .map_err(|error| Failure::Invalid(error.to_string()))?;

        let result = match mutation.action {
            MutationAction::Add | MutationAction::Update => {
                self.remote.set(&path, &mutation.payload).await
            }
            MutationAction::Delete => self.remote.remove(&path).await,
        };

        result.map_err(|error| match error {
            RemoteError::Connectivity(_) => Failure::Offline(error),
            RemoteError::InvalidPath(reason) => Failure::Invalid(reason),
            other => Failure::Rejected(other),
        })
    }

    async fn quarantine(&self, mutation: &PendingMutation, reason: &str) -> Result<()> {
        let dead = self.store.quarantine(&mutation.id, reason).await?;
        tracing::error!(
            "Quarantined {} {} ({}): {reason}",
            mutation.action,
            mutation.collection,
            mutation.id
        );
        let _ = self.events.send(SyncEvent::MutationQuarantined {
            id: dead.mutation.id,
            collection: dead.mutation.collection,
            reason: dead.reason,
        });
        Ok(())
    }
}
