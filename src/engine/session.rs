//! Session isolation
//!
//! The [`SessionManager`] owns one [`SessionSlice`] per logical session and is
//! the only way to reach them. Event routing is decided when a stream binds,
//! not when an event arrives: a [`StreamBinding`] holds the slice it was bound
//! to, so switching the active session never redirects events already in
//! flight. Binding a session again supersedes its previous stream.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

use super::error::StorageResult;
use super::event::StreamEvent;
use super::reducer::{Reduction, TranscriptReducer};
use super::slice::{SessionId, SessionSlice};
use super::storage::SliceStore;
use super::transport::HistoryMessage;

/// When slices are written to the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistPolicy {
    /// After every change
    #[default]
    EveryMutation,
    /// When a turn starts or ends
    TurnBoundaries,
}

/// Change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SliceChange {
    /// A session became active
    Activated {
        /// Newly active session
        session_id: SessionId,
        /// Session that was active before
        previous: Option<SessionId>,
    },
    /// A slice changed
    Mutated {
        /// Changed session
        session_id: SessionId,
        /// Whether it is the active session
        active: bool,
    },
    /// A session was deleted
    Evicted {
        /// Deleted session
        session_id: SessionId,
    },
}

/// Receives slice change notifications
pub trait SliceObserver: Send + Sync {
    /// Called after the change, with no engine lock held
    fn on_change(&self, change: &SliceChange);
}

impl<F> SliceObserver for F
where
    F: Fn(&SliceChange) + Send + Sync,
{
    fn on_change(&self, change: &SliceChange) {
        self(change)
    }
}

/// Registration handle of an observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type SliceCell = Arc<Mutex<SessionSlice>>;

struct StreamSlot {
    generation: u64,
    token: CancellationToken,
}

struct ManagerInner {
    slices: RwLock<HashMap<SessionId, SliceCell>>,
    active: Mutex<Option<SessionId>>,
    streams: Mutex<HashMap<SessionId, StreamSlot>>,
    observers: RwLock<Vec<(ObserverId, Arc<dyn SliceObserver>)>>,
    store: Arc<dyn SliceStore>,
    reducer: TranscriptReducer,
    persist: PersistPolicy,
    next_generation: AtomicU64,
    next_observer: AtomicU64,
}

/// Owner of every session slice
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.inner.slices.read().len())
            .field("active", &*self.inner.active.lock())
            .field("persist", &self.inner.persist)
            .finish()
    }
}

impl SessionManager {
    /// Create a manager persisting through `store`
    pub fn new(store: Arc<dyn SliceStore>, reducer: TranscriptReducer, persist: PersistPolicy) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                slices: RwLock::new(HashMap::new()),
                active: Mutex::new(None),
                streams: Mutex::new(HashMap::new()),
                observers: RwLock::new(Vec::new()),
                store,
                reducer,
                persist,
                next_generation: AtomicU64::new(1),
                next_observer: AtomicU64::new(1),
            }),
        }
    }

    /// Reducer shared by every binding
    pub fn reducer(&self) -> &TranscriptReducer {
        &self.inner.reducer
    }

    /// Make `id` the active session.
    ///
    /// A slice already in memory is used untouched; otherwise it is restored
    /// from the store or created empty. The previously active slice is not
    /// modified.
    pub fn activate(&self, id: &SessionId) -> SliceHandle {
        let cell = self.cell(id);
        let previous = self.inner.active.lock().replace(id.clone());

        if let Err(err) = self.inner.store.save_active(Some(id)) {
            tracing::warn!(session = %id, error = %err, "Failed to record active session");
        }
        self.persist(id, &cell);

        tracing::debug!(session = %id, previous = ?previous, "Session activated");
        self.notify(&SliceChange::Activated {
            session_id: id.clone(),
            previous,
        });

        SliceHandle {
            id: id.clone(),
            cell,
            manager: self.clone(),
        }
    }

    /// Reactivate the session that was active when the process last ran.
    pub fn restore_active(&self) -> Option<SliceHandle> {
        match self.inner.store.load_active() {
            Ok(Some(id)) => Some(self.activate(&id)),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to read active session marker");
                None
            }
        }
    }

    /// Id of the active session
    pub fn active_id(&self) -> Option<SessionId> {
        self.inner.active.lock().clone()
    }

    /// Handle to the active slice
    pub fn current_slice(&self) -> Option<SliceHandle> {
        let id = self.active_id()?;
        self.slice(&id)
    }

    /// Handle to a slice already in memory
    pub fn slice(&self, id: &SessionId) -> Option<SliceHandle> {
        let cell = self.inner.slices.read().get(id).cloned()?;
        Some(SliceHandle {
            id: id.clone(),
            cell,
            manager: self.clone(),
        })
    }

    /// Handle to `id`, restoring or creating its slice without activating it
    pub fn open(&self, id: &SessionId) -> SliceHandle {
        SliceHandle {
            id: id.clone(),
            cell: self.cell(id),
            manager: self.clone(),
        }
    }

    /// Ids of every session in the store
    pub fn stored_sessions(&self) -> StorageResult<Vec<SessionId>> {
        self.inner.store.list()
    }

    /// Session recorded as active in the store
    pub fn stored_active(&self) -> StorageResult<Option<SessionId>> {
        self.inner.store.load_active()
    }

    /// Ids of the slices in memory
    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.inner.slices.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Bind a new stream to `id`, superseding any stream already bound.
    pub fn bind(&self, id: &SessionId) -> StreamBinding {
        let cell = self.cell(id);
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();

        let previous = self.inner.streams.lock().insert(
            id.clone(),
            StreamSlot {
                generation,
                token: token.clone(),
            },
        );
        if let Some(previous) = previous {
            tracing::debug!(session = %id, generation = previous.generation, "Superseding stream");
            previous.token.cancel();
        }

        StreamBinding {
            manager: self.clone(),
            session_id: id.clone(),
            cell,
            generation,
            token,
        }
    }

    /// Cancel the stream bound to `id`. Returns whether one was bound.
    pub fn cancel_stream(&self, id: &SessionId) -> bool {
        let streams = self.inner.streams.lock();
        match streams.get(id) {
            Some(slot) => {
                slot.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Delete a session: its slice, its stored copy and its stream.
    pub fn evict(&self, id: &SessionId) -> bool {
        let removed = self.inner.slices.write().remove(id).is_some();
        if let Some(slot) = self.inner.streams.lock().remove(id) {
            slot.token.cancel();
        }

        if let Err(err) = self.inner.store.remove(id) {
            tracing::warn!(session = %id, error = %err, "Failed to remove stored session");
        }

        let was_active = {
            let mut active = self.inner.active.lock();
            if active.as_ref() == Some(id) {
                *active = None;
                true
            } else {
                false
            }
        };
        if was_active {
            if let Err(err) = self.inner.store.save_active(None) {
                tracing::warn!(error = %err, "Failed to clear active session marker");
            }
        }

        tracing::debug!(session = %id, removed, "Session evicted");
        self.notify(&SliceChange::Evicted {
            session_id: id.clone(),
        });
        removed
    }

    /// Replace a slice's transcript with server history.
    ///
    /// Refused while a stream is live on the slice.
    pub fn hydrate(&self, id: &SessionId, history: Vec<HistoryMessage>) -> bool {
        let cell = self.cell(id);
        {
            let mut slice = cell.lock();
            if slice.is_streaming {
                tracing::warn!(session = %id, "Not hydrating a streaming session");
                return false;
            }

            let now = chrono::Utc::now();
            slice.messages = history
                .into_iter()
                .map(|message| message.into_message(now))
                .collect();
            slice.tool_call_history = slice
                .messages
                .iter()
                .flat_map(|message| message.tool_calls.iter().cloned())
                .collect();
            self.inner.reducer.refresh_todos(&mut slice);
        }

        self.persist(id, &cell);
        self.notify_mutated(id);
        true
    }

    /// Register an observer
    pub fn subscribe(&self, observer: Arc<dyn SliceObserver>) -> ObserverId {
        let id = ObserverId(self.inner.next_observer.fetch_add(1, Ordering::Relaxed));
        self.inner.observers.write().push((id, observer));
        id
    }

    /// Remove an observer. Returns whether it was registered.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut observers = self.inner.observers.write();
        let before = observers.len();
        observers.retain(|(registered, _)| *registered != id);
        observers.len() != before
    }

    /// Cell of `id`, restoring or creating it on first reference.
    fn cell(&self, id: &SessionId) -> SliceCell {
        if let Some(cell) = self.inner.slices.read().get(id) {
            return cell.clone();
        }

        let slice = match self.inner.store.load(id) {
            Ok(Some(slice)) => slice,
            Ok(None) => SessionSlice::new(id.clone()),
            Err(err) => {
                tracing::warn!(session = %id, error = %err, "Discarding unreadable stored session");
                SessionSlice::new(id.clone())
            }
        };

        self.inner
            .slices
            .write()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(slice)))
            .clone()
    }

    fn is_registered(&self, id: &SessionId, cell: &SliceCell) -> bool {
        self.inner
            .slices
            .read()
            .get(id)
            .is_some_and(|registered| Arc::ptr_eq(registered, cell))
    }

    /// Save the slice unless it has been evicted.
    fn persist(&self, id: &SessionId, cell: &SliceCell) {
        if !self.is_registered(id, cell) {
            return;
        }
        let snapshot = cell.lock().clone();
        if let Err(err) = self.inner.store.save(&snapshot) {
            tracing::warn!(session = %id, error = %err, "Failed to persist session");
        }
    }

    fn notify_mutated(&self, id: &SessionId) {
        let active = self.inner.active.lock().as_ref() == Some(id);
        self.notify(&SliceChange::Mutated {
            session_id: id.clone(),
            active,
        });
    }

    fn notify(&self, change: &SliceChange) {
        let observers: Vec<Arc<dyn SliceObserver>> = self
            .inner
            .observers
            .read()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for observer in observers {
            observer.on_change(change);
        }
    }
}

/// Shared handle to one slice
#[derive(Clone)]
pub struct SliceHandle {
    id: SessionId,
    cell: SliceCell,
    manager: SessionManager,
}

impl fmt::Debug for SliceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SliceHandle").field("id", &self.id).finish()
    }
}

impl SliceHandle {
    /// Session id
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Run `f` against the slice
    pub fn read<R>(&self, f: impl FnOnce(&SessionSlice) -> R) -> R {
        f(&self.cell.lock())
    }

    /// Copy of the slice
    pub fn snapshot(&self) -> SessionSlice {
        self.cell.lock().clone()
    }

    /// Bind a new stream to this slice
    pub fn bind(&self) -> StreamBinding {
        self.manager.bind(&self.id)
    }
}

/// A stream's exclusive write path into one slice.
///
/// Events are applied only while the binding is the session's current
/// stream; once superseded, cancelled or evicted its calls are dropped or,
/// for an evicted slice, land on the orphaned slice without being persisted.
pub struct StreamBinding {
    manager: SessionManager,
    session_id: SessionId,
    cell: SliceCell,
    generation: u64,
    token: CancellationToken,
}

impl fmt::Debug for StreamBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamBinding")
            .field("session_id", &self.session_id)
            .field("generation", &self.generation)
            .finish()
    }
}

impl StreamBinding {
    /// Bound session
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Stream generation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Token cancelled when the stream is cancelled or superseded
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether this binding is still the session's stream
    pub fn is_current(&self) -> bool {
        let slot_generation = self
            .manager
            .inner
            .streams
            .lock()
            .get(&self.session_id)
            .map(|slot| slot.generation);
        match slot_generation {
            Some(generation) => generation == self.generation,
            // Evicted while draining: keep writing to the orphaned slice
            None => !self.manager.is_registered(&self.session_id, &self.cell),
        }
    }

    /// Start the turn, recording the user's message.
    pub fn begin(&self, user_text: Option<&str>) -> Option<Reduction> {
        self.mutate(|reducer, slice| reducer.begin_turn(slice, user_text))
    }

    /// Fold one event into the bound slice.
    ///
    /// Returns `None` when the binding is stale and the event was dropped.
    pub fn apply(&self, event: &StreamEvent) -> Option<Reduction> {
        self.mutate(|reducer, slice| reducer.apply(slice, event))
    }

    /// End the turn as cancelled.
    pub fn cancel(&self) -> Option<Reduction> {
        self.token.cancel();
        self.mutate(|reducer, slice| reducer.cancel(slice))
    }

    /// End the turn as interrupted.
    pub fn interrupt(&self, reason: &str) -> Option<Reduction> {
        self.mutate(|reducer, slice| reducer.interrupt(slice, reason))
    }

    /// Copy of the bound slice
    pub fn snapshot(&self) -> SessionSlice {
        self.cell.lock().clone()
    }

    fn mutate(
        &self,
        step: impl FnOnce(&TranscriptReducer, &mut SessionSlice) -> Reduction,
    ) -> Option<Reduction> {
        if !self.is_current() {
            tracing::trace!(
                session = %self.session_id,
                generation = self.generation,
                "Dropping update from stale stream"
            );
            return None;
        }

        let reduction = {
            let mut slice = self.cell.lock();
            step(&self.manager.inner.reducer, &mut slice)
        };

        if reduction.changed && self.manager.is_registered(&self.session_id, &self.cell) {
            let boundary = reduction.ended.is_some() || self.is_turn_start();
            if self.manager.inner.persist == PersistPolicy::EveryMutation || boundary {
                self.manager.persist(&self.session_id, &self.cell);
            }
            self.manager.notify_mutated(&self.session_id);
        }
        Some(reduction)
    }

    fn is_turn_start(&self) -> bool {
        let slice = self.cell.lock();
        slice.turn.live && slice.turn.text.is_empty() && slice.turn.tool_calls.is_empty()
    }
}

impl Drop for StreamBinding {
    fn drop(&mut self) {
        let mut streams = self.manager.inner.streams.lock();
        if streams
            .get(&self.session_id)
            .is_some_and(|slot| slot.generation == self.generation)
        {
            streams.remove(&self.session_id);
        }
    }
}
