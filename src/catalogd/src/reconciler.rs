//! Per-catalog reconciliation.
//!
//! A keyed work queue provides the concurrency contract: reconciles for
//! different catalogs run in parallel up to the worker count, while at most
//! one reconcile is ever in flight per catalog. Re-adds of an active key
//! are coalesced and replayed when the active reconcile finishes. Failed
//! keys come back with exponential backoff; polled catalogs come back on
//! their poll interval.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Notify};

use crate::cache::UnpackCache;
use crate::config::exponential_backoff;
use crate::error::{Error, Result};
use crate::image::ImagePuller;
use crate::record::{
    find_condition, set_condition, CatalogRecord, CatalogStatus, Condition, ConditionStatus,
    RecordStore, ResolvedImageSource, ResolvedSource, REASON_STORAGE_DELETE_FAILED,
    REASON_STORAGE_FAILED, REASON_UNPACKING, REASON_UNPACK_FAILED, REASON_UNPACK_PENDING,
    REASON_UNPACK_SUCCESSFUL, TYPE_DELETE, TYPE_UNPACKED,
};
use crate::storage::LocalDirStorage;

/// What to do with a key after its reconcile returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    No,
    After(Duration),
    Backoff,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<String>,
    queued: HashSet<String>,
    active: HashSet<String>,
    /// Keys re-added while active; replayed on completion.
    dirty: HashSet<String>,
    failures: HashMap<String, u32>,
}

/// Work queue with per-key serialization: a key is never handed to two
/// workers at once, and duplicate adds collapse. Cloning yields another
/// handle onto the same queue.
#[derive(Clone)]
pub struct WorkQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
}

impl WorkQueue {
    pub fn new() -> Self {
        WorkQueue {
            state: Arc::new(Mutex::new(QueueState::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn add(&self, key: &str) {
        {
            let mut state = self.state.lock().unwrap();
            if state.active.contains(key) {
                state.dirty.insert(key.to_string());
                return;
            }
            if !state.queued.insert(key.to_string()) {
                return;
            }
            state.pending.push_back(key.to_string());
        }
        self.notify.notify_one();
    }

    pub fn add_after(&self, key: &str, delay: Duration) {
        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Wait for the next key and mark it active.
    pub async fn get(&self) -> String {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(key) = state.pending.pop_front() {
                    state.queued.remove(&key);
                    state.active.insert(key.clone());
                    return key;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Release a key and apply its requeue decision.
    pub fn done(&self, key: &str, requeue: Requeue) {
        let (replay, failures) = {
            let mut state = self.state.lock().unwrap();
            state.active.remove(key);
            let failures = match requeue {
                Requeue::No | Requeue::After(_) => {
                    state.failures.remove(key);
                    0
                }
                Requeue::Backoff => {
                    let count = state.failures.entry(key.to_string()).or_insert(0);
                    *count += 1;
                    *count
                }
            };
            (state.dirty.remove(key), failures)
        };

        match requeue {
            Requeue::No => {}
            Requeue::After(delay) => self.add_after(key, delay),
            Requeue::Backoff => self.add_after(key, exponential_backoff(failures)),
        }
        if replay {
            self.add(key);
        }
    }

    /// True while any reconcile is running or queued; used by tests.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.pending.is_empty() && state.active.is_empty()
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Reconciler {
    store: Arc<dyn RecordStore>,
    puller: Arc<ImagePuller>,
    storage: Arc<LocalDirStorage>,
    cache: UnpackCache,
    queue: WorkQueue,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        puller: Arc<ImagePuller>,
        storage: Arc<LocalDirStorage>,
        cache: UnpackCache,
    ) -> Arc<Self> {
        Arc::new(Reconciler {
            store,
            puller,
            storage,
            cache,
            queue: WorkQueue::new(),
        })
    }

    pub fn queue(&self) -> WorkQueue {
        self.queue.clone()
    }

    /// Queue every known record, used at startup and when the watched
    /// credential secret changes (all catalogs revalidate).
    pub async fn enqueue_all(&self) -> Result<()> {
        for record in self.store.list().await? {
            self.queue.add(record.name());
        }
        Ok(())
    }

    /// Run the reconciler until shutdown. Spawns the event pump and
    /// `workers` parallel workers; in-flight reconciles drain before this
    /// returns.
    pub async fn run(self: Arc<Self>, workers: usize, shutdown: watch::Receiver<bool>) {
        let mut events = self.store.watch();
        let event_queue = self.queue.clone();
        let event_reconciler = self.clone();
        let mut event_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => event_queue.add(&event.name),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                            // Missed events; resync everything.
                            let _ = event_reconciler.enqueue_all().await;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = async {
                        let _ = event_shutdown.wait_for(|stop| *stop).await;
                    } => break,
                }
            }
        });

        if let Err(e) = self.enqueue_all().await {
            tracing::error!(error = %e, "failed to list records for initial sync");
        }

        let mut handles = Vec::new();
        for worker in 0..workers.max(1) {
            let reconciler = self.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    // Once shutdown flips, finish the in-flight reconcile
                    // but take no new work.
                    let key = tokio::select! {
                        biased;
                        _ = shutdown.wait_for(|stop| *stop) => break,
                        key = reconciler.queue.get() => key,
                    };
                    tracing::debug!(worker = worker, catalog = %key, "reconciling");
                    let requeue = reconciler.process(&key).await;
                    reconciler.queue.done(&key, requeue);
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// One reconcile pass for a key. Errors never propagate past here;
    /// they become conditions plus a requeue decision.
    pub async fn process(&self, name: &str) -> Requeue {
        let record = match self.store.get(name).await {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(catalog = %name, error = %e, "failed to read record");
                return Requeue::Backoff;
            }
        };

        match record {
            None => self.cleanup(name).await,
            Some(record) if record.being_deleted() => self.finalize(&record).await,
            Some(record) => self.reconcile(&record).await,
        }
    }

    /// The record is gone; drop whatever we still hold for it.
    async fn cleanup(&self, name: &str) -> Requeue {
        if let Err(e) = self.storage.delete(name).await {
            tracing::error!(catalog = %name, error = %e, "failed to delete served content");
            return Requeue::Backoff;
        }
        if let Err(e) = self.cache.remove(name).await {
            tracing::error!(catalog = %name, error = %e, "failed to remove unpack cache");
            return Requeue::Backoff;
        }
        Requeue::No
    }

    /// Deletion in progress: clear served content and cache, then release
    /// the finalizer. Failure flips the Delete condition and retries.
    async fn finalize(&self, record: &CatalogRecord) -> Requeue {
        let name = record.name();
        let cleanup = async {
            self.storage.delete(name).await?;
            self.cache.remove(name).await
        };
        if let Err(e) = cleanup.await {
            tracing::error!(catalog = %name, error = %e, "failed to clean up deleted catalog");
            let mut status = record.status.clone();
            set_condition(
                &mut status.conditions,
                Condition {
                    condition_type: TYPE_DELETE.to_string(),
                    status: ConditionStatus::False,
                    reason: REASON_STORAGE_DELETE_FAILED.to_string(),
                    message: e.to_string(),
                    last_transition_time: Utc::now(),
                    observed_generation: record.metadata.generation,
                },
            );
            self.write_status(record, status).await;
            return Requeue::Backoff;
        }

        if let Err(e) = self.store.remove_finalizer(name).await {
            tracing::error!(catalog = %name, error = %e, "failed to remove finalizer");
            return Requeue::Backoff;
        }
        tracing::info!(catalog = %name, "deleted catalog content");
        Requeue::No
    }

    async fn reconcile(&self, record: &CatalogRecord) -> Requeue {
        let name = record.name();
        let image = record.image_source();
        let generation = record.metadata.generation;

        // Admission forbids polling a pinned digest, but tolerate records
        // that slipped through: the pin wins and the interval is ignored.
        let mut poll_interval = image.poll_interval;
        if poll_interval.is_some() && image.reference.contains("@sha256:") {
            tracing::warn!(
                catalog = %name,
                "ignoring pollInterval on digest-pinned catalog"
            );
            poll_interval = None;
        }

        // Surface progress on records we have not processed at this
        // generation yet; steady-state reconciles (and failure retries of
        // an already-reported generation) stay silent so repeated runs
        // leave the status byte-identical.
        let existing = find_condition(&record.status.conditions, TYPE_UNPACKED);
        let fresh = existing.is_none();
        let seen_generation = existing
            .map(|c| c.observed_generation == generation)
            .unwrap_or(false);
        if fresh || !seen_generation {
            let mut status = record.status.clone();
            let reason = if fresh {
                REASON_UNPACK_PENDING
            } else {
                REASON_UNPACKING
            };
            set_condition(
                &mut status.conditions,
                Condition {
                    condition_type: TYPE_UNPACKED.to_string(),
                    status: ConditionStatus::False,
                    reason: reason.to_string(),
                    message: format!("unpacking catalog image {:?}", image.reference),
                    last_transition_time: Utc::now(),
                    observed_generation: generation,
                },
            );
            self.write_status(record, status).await;
        }

        let pull = match self.puller.pull(name, &image.reference).await {
            Ok(pull) => pull,
            Err(e) => return self.record_pull_failure(record, &e, poll_interval).await,
        };

        // Same digest already published means nothing to serialize again.
        let published = self.storage.current_digest(name);
        if published.as_deref() != Some(pull.digest_hex.as_str()) || !self.storage.exists(name) {
            if let Err(e) = self
                .storage
                .store(name, &pull.digest_hex, &pull.unpack_dir)
                .await
            {
                // The unpack directory is retained; the next attempt can
                // skip the pull and go straight to storing.
                tracing::error!(catalog = %name, error = %e, "failed to store catalog content");
                let mut status = record.status.clone();
                set_condition(
                    &mut status.conditions,
                    Condition {
                        condition_type: TYPE_UNPACKED.to_string(),
                        status: ConditionStatus::False,
                        reason: REASON_STORAGE_FAILED.to_string(),
                        message: e.to_string(),
                        last_transition_time: Utc::now(),
                        observed_generation: generation,
                    },
                );
                self.write_status(record, status).await;
                return Requeue::Backoff;
            }
        }

        let now = Utc::now();
        let prior = record.status.resolved_source.as_ref().map(|resolved| {
            let ResolvedSource::Image { image } = resolved;
            image
        });
        let last_poll_attempt = if pull.polled {
            now
        } else {
            prior.map(|p| p.last_poll_attempt).unwrap_or(now)
        };
        let last_unpacked = if pull.unpacked {
            now
        } else {
            prior.map(|p| p.last_unpacked).unwrap_or(now)
        };

        let mut status = record.status.clone();
        set_condition(
            &mut status.conditions,
            Condition {
                condition_type: TYPE_UNPACKED.to_string(),
                status: ConditionStatus::True,
                reason: REASON_UNPACK_SUCCESSFUL.to_string(),
                message: format!("unpacked {:?} successfully", pull.resolved_reference),
                last_transition_time: now,
                observed_generation: generation,
            },
        );
        status.resolved_source = Some(ResolvedSource::Image {
            image: ResolvedImageSource {
                reference: image.reference.clone(),
                resolved_reference: pull.resolved_reference.clone(),
                last_poll_attempt,
                last_unpacked,
            },
        });
        status.content_url = Some(self.storage.url(name));
        status.observed_generation = generation;
        status.last_unpacked = Some(last_unpacked);

        // Status subresource first, main object second: if deletion races
        // us and prunes the finalizer, the condition write must not be the
        // casualty.
        self.write_status(record, status).await;
        if let Err(e) = self.store.ensure_finalizer(name).await {
            tracing::error!(catalog = %name, error = %e, "failed to ensure finalizer");
            return Requeue::Backoff;
        }

        match poll_interval {
            // Digest-pinned catalogs are immutable; no timer for them.
            Some(interval) => Requeue::After(interval),
            None => Requeue::No,
        }
    }

    async fn record_pull_failure(
        &self,
        record: &CatalogRecord,
        error: &Error,
        poll_interval: Option<Duration>,
    ) -> Requeue {
        let name = record.name();
        tracing::error!(catalog = %name, error = %error, "failed to unpack catalog image");

        let mut status = record.status.clone();
        // The prior resolvedSource stays: it still reflects what is served.
        // Only the poll attempt timestamp moves, because the attempt was real.
        if let Some(ResolvedSource::Image { image }) = &mut status.resolved_source {
            image.last_poll_attempt = Utc::now();
        }
        set_condition(
            &mut status.conditions,
            Condition {
                condition_type: TYPE_UNPACKED.to_string(),
                status: ConditionStatus::False,
                reason: REASON_UNPACK_FAILED.to_string(),
                message: error.to_string(),
                last_transition_time: Utc::now(),
                observed_generation: record.metadata.generation,
            },
        );
        self.write_status(record, status).await;

        if error.is_unrecoverable() {
            // Retrying cannot help; stay down until the record changes or
            // the normal poll cadence comes around.
            match poll_interval {
                Some(interval) => Requeue::After(interval),
                None => Requeue::No,
            }
        } else {
            Requeue::Backoff
        }
    }

    /// Write the status subresource when it changed. A failed write is
    /// logged and left for the next reconcile to converge.
    async fn write_status(&self, record: &CatalogRecord, status: CatalogStatus) {
        if record.status == status {
            return;
        }
        if let Err(e) = self.store.update_status(record.name(), status).await {
            tracing::error!(catalog = %record.name(), error = %e, "failed to update status");
        }
    }
}
