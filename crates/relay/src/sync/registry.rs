// Document id -> live session.
//
// Each document id owns a slot guarded by an async mutex. Creation, joining
// and teardown all happen under that slot, so concurrent first joiners share
// one session and a rejoin racing a teardown reloads what was just flushed.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use tandem_common::types::DocumentId;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::{
    replica::ReplicaDoc,
    session::{DocumentSession, Member, PersistOutcome},
};
use crate::metrics;
use crate::storage::{StorageAdapter, StorageError};

pub const DEFAULT_PERSIST_INTERVAL: Duration = Duration::from_secs(2);

type Slot = Mutex<Option<Arc<DocumentSession>>>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("relay is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub persisted: usize,
    pub rejected_too_small: usize,
    pub failed: usize,
}

pub struct SessionRegistry {
    storage: StorageAdapter,
    slots: StdMutex<HashMap<DocumentId, Arc<Slot>>>,
    sessions: StdMutex<HashMap<DocumentId, Arc<DocumentSession>>>,
    closed: AtomicBool,
}

impl SessionRegistry {
    pub fn new(storage: StorageAdapter) -> Self {
        Self {
            storage,
            slots: StdMutex::new(HashMap::new()),
            sessions: StdMutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Finds or creates the session for `doc_id` and adds `member` to its
    /// room. The member's `sync_full` is queued before this returns.
    pub async fn acquire(
        &self,
        doc_id: &DocumentId,
        member: Member,
        state_vector: Option<&[u8]>,
    ) -> Result<Arc<DocumentSession>, RegistryError> {
        let connection_id = member.connection_id;
        async move {
            loop {
                let slot = self.slot_for(doc_id);
                let mut guard = slot.lock().await;
                if !self.is_current_slot(doc_id, &slot) {
                    // Torn down while we waited; the replacement slot wins.
                    continue;
                }
                if self.closed.load(Ordering::SeqCst) {
                    return Err(RegistryError::ShuttingDown);
                }

                let session = match guard.as_ref() {
                    Some(session) => Arc::clone(session),
                    None => {
                        let session = Arc::new(self.load_session(doc_id).await);
                        *guard = Some(Arc::clone(&session));
                        let active = {
                            let mut sessions = lock(&self.sessions);
                            sessions.insert(doc_id.clone(), Arc::clone(&session));
                            sessions.len()
                        };
                        metrics::set_active_sessions(active);
                        info!(doc_id = %doc_id, "document session created");
                        session
                    }
                };

                session.add_connection(member, state_vector).await;
                return Ok(session);
            }
        }
        .instrument(info_span!(
            "relay.registry.acquire",
            doc_id = %doc_id,
            connection_id = %connection_id
        ))
        .await
    }

    /// Removes the connection; the last one out flushes and discards the
    /// session. A session whose final flush fails stays registered with no
    /// members until a later flush succeeds, and a rejoin reuses it.
    pub async fn release(&self, doc_id: &DocumentId, connection_id: Uuid) {
        let Some(slot) = lock(&self.slots).get(doc_id).cloned() else {
            return;
        };

        let mut guard = slot.lock().await;
        let Some(session) = guard.clone() else {
            return;
        };

        match session.remove_connection(connection_id).await {
            Some(0) => {}
            Some(_) | None => return,
        }

        self.teardown(doc_id, &session, &mut guard).await;
    }

    /// Persists every session that changed since its last save. Failures stay
    /// dirty and are retried on the next call.
    pub async fn flush_dirty(&self) -> FlushReport {
        let dirty = self.live_sessions().into_iter().filter(|session| session.is_dirty()).collect();
        self.flush(dirty).await
    }

    /// Persists every live session regardless of the dirty hint.
    pub async fn flush_all(&self) -> FlushReport {
        self.flush(self.live_sessions()).await
    }

    /// Drives [`flush_dirty`](Self::flush_dirty) every `interval` until
    /// `shutdown` flips, then refuses new joins and flushes everything once
    /// more.
    pub async fn run_persistence_loop(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.reset();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.flush_dirty().await;
                    if report.failed > 0 {
                        warn!(failed = report.failed, "snapshot saves failed; retrying next tick");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.close();
        let report = self.flush_all().await;
        info!(
            persisted = report.persisted,
            failed = report.failed,
            "final snapshot flush complete"
        );
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub async fn connection_count(&self, doc_id: &DocumentId) -> usize {
        let session = lock(&self.sessions).get(doc_id).cloned();
        match session {
            Some(session) => session.connection_count().await,
            None => 0,
        }
    }

    pub fn session(&self, doc_id: &DocumentId) -> Option<Arc<DocumentSession>> {
        lock(&self.sessions).get(doc_id).cloned()
    }

    async fn flush(&self, sessions: Vec<Arc<DocumentSession>>) -> FlushReport {
        let mut report = FlushReport::default();
        for session in sessions {
            match session.persist(&self.storage).await {
                Ok(PersistOutcome::Persisted { .. }) => {
                    report.persisted += 1;
                    metrics::record_snapshot_save("persisted");
                }
                Ok(PersistOutcome::RejectedTooSmall { .. }) => {
                    report.rejected_too_small += 1;
                    metrics::record_snapshot_save("rejected_too_small");
                }
                Ok(PersistOutcome::Clean) => {}
                Err(error) => {
                    report.failed += 1;
                    metrics::record_snapshot_save("failed");
                    warn!(doc_id = %session.doc_id(), error = %error, "snapshot save failed");
                    continue;
                }
            }

            if session.connection_count().await == 0 {
                self.retire_idle(&session).await;
            }
        }
        report
    }

    /// Tears down a member-less session left behind by a failed final flush.
    async fn retire_idle(&self, session: &Arc<DocumentSession>) {
        let doc_id = session.doc_id();
        let Some(slot) = lock(&self.slots).get(doc_id).cloned() else {
            return;
        };

        let mut guard = slot.lock().await;
        let is_same = guard.as_ref().is_some_and(|current| Arc::ptr_eq(current, session));
        if !is_same || session.connection_count().await > 0 {
            return;
        }

        self.teardown(doc_id, session, &mut guard).await;
    }

    /// Final flush of an empty session, then discard. Runs under the slot
    /// lock. On a failed save the session is kept and stays dirty.
    async fn teardown(
        &self,
        doc_id: &DocumentId,
        session: &Arc<DocumentSession>,
        guard: &mut Option<Arc<DocumentSession>>,
    ) {
        let flushed = async {
            match session.persist(&self.storage).await {
                Ok(PersistOutcome::Persisted { bytes }) => {
                    metrics::record_snapshot_save("persisted");
                    info!(doc_id = %doc_id, payload_bytes = bytes, "final snapshot flushed");
                    true
                }
                Ok(PersistOutcome::RejectedTooSmall { .. }) => {
                    metrics::record_snapshot_save("rejected_too_small");
                    true
                }
                Ok(PersistOutcome::Clean) => true,
                Err(error) => {
                    metrics::record_snapshot_save("failed");
                    error!(
                        doc_id = %doc_id,
                        error = %error,
                        "final snapshot flush failed; keeping session for retry"
                    );
                    false
                }
            }
        }
        .instrument(info_span!("relay.registry.teardown", doc_id = %doc_id))
        .await;

        if !flushed {
            return;
        }

        *guard = None;
        lock(&self.slots).remove(doc_id);
        let active = {
            let mut sessions = lock(&self.sessions);
            sessions.remove(doc_id);
            sessions.len()
        };
        metrics::set_active_sessions(active);
        info!(doc_id = %doc_id, "document session closed");
    }

    async fn load_session(&self, doc_id: &DocumentId) -> DocumentSession {
        let empty = || DocumentSession::new(doc_id.clone(), ReplicaDoc::new(), None);

        match self.storage.load(doc_id).await {
            Ok(Some(snapshot)) => match ReplicaDoc::from_snapshot(&snapshot.payload) {
                Ok(replica) => DocumentSession::new(doc_id.clone(), replica, Some(snapshot.payload)),
                Err(error) => {
                    warn!(doc_id = %doc_id, error = %error, "stored snapshot is undecodable; starting empty");
                    empty()
                }
            },
            Ok(None) => empty(),
            Err(StorageError::Corrupt { .. }) => {
                warn!(doc_id = %doc_id, "stored snapshot is corrupt; starting empty");
                empty()
            }
            Err(error) => {
                warn!(doc_id = %doc_id, error = %error, "snapshot load failed; starting empty");
                empty()
            }
        }
    }

    fn slot_for(&self, doc_id: &DocumentId) -> Arc<Slot> {
        let mut slots = lock(&self.slots);
        Arc::clone(slots.entry(doc_id.clone()).or_insert_with(|| Arc::new(Mutex::new(None))))
    }

    fn is_current_slot(&self, doc_id: &DocumentId, slot: &Arc<Slot>) -> bool {
        lock(&self.slots).get(doc_id).is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    fn live_sessions(&self) -> Vec<Arc<DocumentSession>> {
        lock(&self.sessions).values().cloned().collect()
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
