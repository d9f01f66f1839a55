//! Persistence provider: binds one yrs document to one named update log.
//!
//! Lifecycle:
//! 1. `new` registers an edit observer and spawns the worker task
//! 2. The worker loads the stored log into the document, or seeds an
//!    empty log with a full-state snapshot, then reports `Synced`.
//!    Content the document held before attaching is appended as well
//! 3. Local edits are buffered and flushed after `flush_delay`; a flush
//!    that pushes the log past `trim_size` collapses the covered prefix
//! 4. `destroy` stops all scheduling; buffered edits are dropped
//!
//! Sessions sharing one `DocumentStore` see each other's fragments
//! through `fetch_updates`, driven by the per-session `SyncCursor`.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;
use yrs::{Doc, Origin, Subscription};

use crate::cursor::SyncCursor;
use crate::engine;
use crate::error::{PersistenceError, Result};
use crate::policy::{CompactionPolicy, PREFERRED_TRIM_SIZE};
use crate::storage::{AppendOutcome, DocumentHandle, DocumentStore, MetaKey};

/// Floor for rescheduling a failed flush.
const MIN_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Provider configuration.
#[derive(Debug, Clone)]
pub struct ProviderOptions {
    /// Debounce window between a local edit and its flush (default: 1s)
    pub flush_delay: Duration,
    /// Entry count above which a flush compacts the log (default: 500)
    pub trim_size: u64,
    /// Capacity of the event broadcast channel (default: 64)
    pub event_capacity: usize,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            flush_delay: Duration::from_millis(1000),
            trim_size: PREFERRED_TRIM_SIZE,
            event_capacity: 64,
        }
    }
}

impl ProviderOptions {
    /// Create options for testing (flush immediately).
    pub fn for_testing() -> Self {
        Self {
            flush_delay: Duration::ZERO,
            trim_size: PREFERRED_TRIM_SIZE,
            event_capacity: 1024,
        }
    }

    pub fn with_trim_size(mut self, trim_size: u64) -> Self {
        self.trim_size = trim_size;
        self
    }

    pub fn with_flush_delay(mut self, flush_delay: Duration) -> Self {
        self.flush_delay = flush_delay;
        self
    }
}

/// Provider lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Loading,
    Synced,
    Destroyed,
}

/// Events emitted by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    /// Stored log applied to the document
    Synced,
    /// Buffered edits appended at `key`
    Flushed { key: u64, dbsize: u64 },
    /// Entries through `upto` collapsed into one
    Compacted { upto: u64, dbsize: u64 },
    /// Provider torn down
    Destroyed,
}

#[derive(Debug, Clone)]
enum SyncStatus {
    Pending,
    Synced,
    Failed(PersistenceError),
}

/// Mutated only with the state lock held.
#[derive(Debug, Default)]
struct ProviderState {
    /// Live entry count as of this session's last store transaction
    dbsize: u64,
    cursor: SyncCursor,
}

/// State shared between the provider and its worker task.
struct Shared {
    name: String,
    doc: Doc,
    origin: Origin,
    store: Arc<DocumentStore>,
    handle: Result<DocumentHandle>,
    policy: CompactionPolicy,
    /// Phase transitions are linearized here; never held across an await
    phase: Mutex<Phase>,
    state: tokio::sync::Mutex<ProviderState>,
    status: watch::Sender<SyncStatus>,
    events: broadcast::Sender<ProviderEvent>,
}

/// Keeps one document durable in a `DocumentStore`.
///
/// Must be created inside a tokio runtime.
pub struct PersistenceProvider {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    subscription: Mutex<Option<Subscription>>,
}

impl PersistenceProvider {
    /// Start persisting `doc` under `name`.
    ///
    /// Setup failures (store or observer) surface through `when_synced`.
    pub fn new(
        store: Arc<DocumentStore>,
        name: impl Into<String>,
        doc: &Doc,
        options: ProviderOptions,
    ) -> Self {
        let name = name.into();
        let origin = Origin::from(format!("logos-persistence:{}", Uuid::new_v4()).as_str());
        let handle = store.open_document(&name).map_err(PersistenceError::from);

        let (edit_tx, edit_rx) = mpsc::unbounded_channel();
        let (subscription, observer_error) =
            match engine::observe_local_edits(doc, &origin, edit_tx) {
                Ok(sub) => (Some(sub), None),
                Err(e) => (None, Some(e)),
            };

        let initial = match (&handle, observer_error) {
            (Err(e), _) => SyncStatus::Failed(e.clone()),
            (_, Some(e)) => SyncStatus::Failed(e),
            _ => SyncStatus::Pending,
        };
        if let SyncStatus::Failed(e) = &initial {
            log::warn!("Persistence for '{name}' failed to start: {e}");
        }

        let (status, _) = watch::channel(initial);
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            name,
            doc: doc.clone(),
            origin,
            store,
            handle,
            policy: CompactionPolicy::new(options.trim_size),
            phase: Mutex::new(Phase::Loading),
            state: tokio::sync::Mutex::new(ProviderState::default()),
            status,
            events,
        });

        tokio::spawn(run_worker(
            shared.clone(),
            edit_rx,
            shutdown_rx,
            options.flush_delay,
        ));

        Self {
            shared,
            shutdown,
            subscription: Mutex::new(subscription),
        }
    }

    /// Resolves once the stored log has been applied.
    ///
    /// Fails with the load error, or with `UseAfterDestroy` if the
    /// provider was destroyed first.
    pub async fn when_synced(&self) -> Result<()> {
        let mut rx = self.shared.status.subscribe();
        loop {
            self.shared.ensure_live()?;
            let status = rx.borrow_and_update().clone();
            match status {
                SyncStatus::Synced => return Ok(()),
                SyncStatus::Failed(e) => return Err(e),
                SyncStatus::Pending => {}
            }
            if rx.changed().await.is_err() {
                return Err(self.shared.destroyed_error());
            }
        }
    }

    /// Receive provider events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.shared.events.subscribe()
    }

    /// Pull fragments appended by other sessions since the cursor.
    ///
    /// Returns the number of fragments applied.
    pub async fn fetch_updates(&self) -> Result<usize> {
        self.shared.ensure_live()?;
        let mut state = self.shared.state.lock().await;
        self.shared.ensure_live()?;
        let handle = self.shared.handle()?;
        self.shared.fetch_locked(&mut state, handle)
    }

    /// Tear the provider down. Idempotent.
    ///
    /// Edits still waiting for their flush are dropped. A store
    /// transaction already running completes first.
    pub async fn destroy(&self) {
        {
            let mut phase = self.shared.lock_phase();
            if *phase == Phase::Destroyed {
                return;
            }
            *phase = Phase::Destroyed;
            let err = self.shared.destroyed_error();
            self.shared.status.send_if_modified(|status| {
                if matches!(status, SyncStatus::Pending) {
                    *status = SyncStatus::Failed(err);
                    true
                } else {
                    false
                }
            });
        }

        let _ = self.shutdown.send(true);
        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(subscription);

        // Wait out any in-flight store transaction
        let _state = self.shared.state.lock().await;
        if let Ok(handle) = &self.shared.handle {
            self.shared.store.close(handle);
        }

        log::info!("Destroyed persistence provider for '{}'", self.shared.name);
        let _ = self.shared.events.send(ProviderEvent::Destroyed);
    }

    /// Destroy the provider and delete everything stored under its name.
    pub async fn clear_data(&self) -> Result<()> {
        self.destroy().await;
        clear_document(&self.shared.store, &self.shared.name)
    }

    // ─── Meta ─────────────────────────────────────────────────────────

    /// Read a meta value. `Ok(None)` if it was never set.
    pub fn get<V: DeserializeOwned>(&self, key: impl Into<MetaKey>) -> Result<Option<V>> {
        self.shared.ensure_live()?;
        let handle = self.shared.handle()?;
        Ok(self.shared.store.get_meta(handle, &key.into())?)
    }

    /// Write a meta value. Not debounced.
    pub fn set<V: Serialize + ?Sized>(&self, key: impl Into<MetaKey>, value: &V) -> Result<()> {
        self.shared.ensure_live()?;
        let handle = self.shared.handle()?;
        Ok(self.shared.store.put_meta(handle, &key.into(), value)?)
    }

    /// Remove a meta value.
    pub fn del(&self, key: impl Into<MetaKey>) -> Result<()> {
        self.shared.ensure_live()?;
        let handle = self.shared.handle()?;
        Ok(self.shared.store.delete_meta(handle, &key.into())?)
    }

    // ─── Introspection ────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn phase(&self) -> Phase {
        *self.shared.lock_phase()
    }

    pub fn is_synced(&self) -> bool {
        self.phase() == Phase::Synced
    }

    /// Origin tag carried by every transaction this provider applies.
    pub fn origin(&self) -> &Origin {
        &self.shared.origin
    }

    /// Live entry count as of this session's last store transaction.
    pub async fn dbsize(&self) -> u64 {
        self.shared.state.lock().await.dbsize
    }

    /// Highest store key applied to the document.
    pub async fn cursor(&self) -> u64 {
        self.shared.state.lock().await.cursor.position()
    }
}

impl Drop for PersistenceProvider {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Pull fragments appended by other sessions into `provider`'s document.
pub async fn fetch_updates(provider: &PersistenceProvider) -> Result<usize> {
    provider.fetch_updates().await
}

/// Delete every stored update and meta value of `name`.
pub fn clear_document(store: &DocumentStore, name: &str) -> Result<()> {
    Ok(store.clear_document(name)?)
}

// ─── Worker ───────────────────────────────────────────────────────────

async fn run_worker(
    shared: Arc<Shared>,
    mut edits: mpsc::UnboundedReceiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
    flush_delay: Duration,
) {
    if !matches!(*shared.status.borrow(), SyncStatus::Pending) {
        return;
    }

    tokio::select! {
        biased;
        _ = shutdown.changed() => {
            log::debug!("Load of '{}' cancelled", shared.name);
            return;
        }
        result = shared.load() => match result {
            Ok(()) => shared.mark_synced(),
            Err(e) => {
                log::warn!("Failed to load '{}': {e}", shared.name);
                shared.status.send_if_modified(|status| {
                    if matches!(status, SyncStatus::Pending) {
                        *status = SyncStatus::Failed(e);
                        true
                    } else {
                        false
                    }
                });
                return;
            }
        },
    }

    let mut pending: Vec<Vec<u8>> = Vec::new();
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            edit = edits.recv() => match edit {
                Some(fragment) => {
                    pending.push(fragment);
                    deadline = Some(Instant::now() + flush_delay);
                }
                None => break,
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                shared.flush(&mut pending).await;
                deadline = if pending.is_empty() {
                    None
                } else {
                    Some(Instant::now() + flush_delay.max(MIN_RETRY_DELAY))
                };
            }
        }
    }

    if !pending.is_empty() {
        log::warn!(
            "Dropping {} buffered edits of '{}' on shutdown",
            pending.len(),
            shared.name
        );
    }
}

impl Shared {
    fn lock_phase(&self) -> std::sync::MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn destroyed_error(&self) -> PersistenceError {
        PersistenceError::UseAfterDestroy {
            name: self.name.clone(),
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if *self.lock_phase() == Phase::Destroyed {
            Err(self.destroyed_error())
        } else {
            Ok(())
        }
    }

    fn handle(&self) -> Result<&DocumentHandle> {
        self.handle.as_ref().map_err(|e| e.clone())
    }

    async fn load(&self) -> Result<()> {
        let handle = self.handle()?;
        let mut state = self.state.lock().await;
        self.ensure_live()?;

        let entries = self.store.read_all(handle)?;
        // Content the document already had before attaching
        let unstored = if entries.is_empty() {
            None
        } else {
            engine::encode_unstored(&self.doc, &entries)?
        };
        engine::apply_fragments(&self.doc, &entries, &self.origin)?;
        state.cursor.observe(&entries);

        if entries.is_empty() {
            let snapshot = engine::encode_full_state(&self.doc);
            self.append_locked(&mut state, handle, &snapshot)?;
        } else if let Some(fragment) = unstored {
            let outcome = self.append_locked(&mut state, handle, &fragment)?;
            log::debug!("Stored pre-existing content of '{}' at key {}", self.name, outcome.key);
        } else {
            state.dbsize = self.store.count(handle)?;
        }

        log::info!(
            "Loaded '{}': {} entries applied, {} live",
            self.name,
            entries.len(),
            state.dbsize
        );
        Ok(())
    }

    /// Loading -> Synced, unless destroy got there first.
    fn mark_synced(&self) {
        let mut phase = self.lock_phase();
        if *phase != Phase::Loading {
            return;
        }
        *phase = Phase::Synced;
        self.status.send_replace(SyncStatus::Synced);
        let _ = self.events.send(ProviderEvent::Synced);
    }

    /// Append one fragment and account for it.
    fn append_locked(
        &self,
        state: &mut ProviderState,
        handle: &DocumentHandle,
        fragment: &[u8],
    ) -> Result<AppendOutcome> {
        let outcome = self.store.append(handle, fragment)?;
        state.dbsize = outcome.count;
        // A sibling entry below ours has not been applied yet
        if outcome
            .previous_last
            .map_or(true, |last| state.cursor.covers(last))
        {
            state.cursor.advance(outcome.key);
        }
        Ok(outcome)
    }

    /// Persist `pending`. Edits stay buffered when the flush fails.
    async fn flush(&self, pending: &mut Vec<Vec<u8>>) {
        if pending.is_empty() {
            return;
        }

        let mut state = self.state.lock().await;
        if self.ensure_live().is_err() {
            return;
        }
        let handle = match self.handle() {
            Ok(handle) => handle,
            Err(e) => {
                log::warn!("Flush of '{}' skipped: {e}", self.name);
                return;
            }
        };

        let merged = match engine::merge_fragments(pending.as_slice()) {
            Ok(merged) => merged,
            Err(e) => {
                log::warn!("Could not merge {} edits of '{}': {e}", pending.len(), self.name);
                return;
            }
        };

        let outcome = match self.append_locked(&mut state, handle, &merged) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!(
                    "Flush of '{}' failed, keeping {} edits buffered: {e}",
                    self.name,
                    pending.len()
                );
                return;
            }
        };

        let flushed = pending.len();
        pending.clear();
        log::debug!(
            "Flushed {flushed} edits of '{}' at key {} ({} live)",
            self.name,
            outcome.key,
            state.dbsize
        );
        let _ = self.events.send(ProviderEvent::Flushed {
            key: outcome.key,
            dbsize: state.dbsize,
        });

        if self.policy.should_compact(state.dbsize) {
            if let Err(e) = self.compact_locked(&mut state, handle) {
                log::warn!("Compaction of '{}' failed: {e}", self.name);
            }
        }
    }

    fn compact_locked(&self, state: &mut ProviderState, handle: &DocumentHandle) -> Result<()> {
        self.fetch_locked(state, handle)?;

        let plan = match self.policy.plan(state.dbsize, state.cursor.position()) {
            Some(plan) => plan,
            None => return Ok(()),
        };

        let entries = self.store.read_through(handle, plan.upto)?;
        if entries.len() < 2 {
            return Ok(());
        }
        let payloads: Vec<&[u8]> = entries.iter().map(|e| e.payload.as_slice()).collect();
        let merged = engine::merge_fragments(&payloads)?;

        state.dbsize = self.store.replace_prefix(handle, plan.upto, &merged)?;
        log::info!(
            "Compacted '{}': {} of {} entries through key {} merged, {} live",
            self.name,
            entries.len(),
            plan.entries,
            plan.upto,
            state.dbsize
        );
        let _ = self.events.send(ProviderEvent::Compacted {
            upto: plan.upto,
            dbsize: state.dbsize,
        });
        Ok(())
    }

    fn fetch_locked(&self, state: &mut ProviderState, handle: &DocumentHandle) -> Result<usize> {
        let entries = self.store.read_since(handle, state.cursor.position())?;
        engine::apply_fragments(&self.doc, &entries, &self.origin)?;
        state.cursor.observe(&entries);
        state.dbsize = self.store.count(handle)?;
        if !entries.is_empty() {
            log::debug!(
                "Fetched {} entries of '{}' (cursor {})",
                entries.len(),
                self.name,
                state.cursor.position()
            );
        }
        Ok(entries.len())
    }
}
