//! Live task synchronization for the signed-in principal.
//!
//! # Responsibility
//! - Hold exactly one filtered task-store subscription for the current
//!   principal and mirror its deliveries into a local snapshot.
//! - Forward add/toggle/delete to the task store.
//!
//! # Invariants
//! - The snapshot is written only by subscription deliveries and cleared on
//!   principal changes; mutation paths never touch it.
//! - At most one subscription is active. A principal change cancels the old
//!   one before opening the next.
//! - A delivery is applied only when it belongs to the current subscription
//!   generation and carries a newer revision than the last applied one.
//! - Nothing reaches the store without a present principal.

use crate::model::principal::Principal;
use crate::model::task::{NewTask, Task, TaskId, TaskPatch};
use crate::service::session_service::SessionManager;
use crate::store::subscription::{lock_or_recover, ListenerSet, Observer, Subscription};
use crate::store::task::{SnapshotDelivery, SnapshotListener, StoreError, TaskFilter, TaskStore};
use log::{debug, error, info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, Weak};

/// Subscription lifecycle of the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncState {
    /// No principal; snapshot empty, no store resources held.
    #[default]
    Unsubscribed,
    /// Principal present, first delivery not yet applied.
    Subscribing,
    /// At least one delivery applied for the current principal.
    Subscribed,
}

/// Renderable task state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskView {
    pub state: SyncState,
    pub owner_uid: Option<String>,
    pub tasks: Vec<Task>,
    /// Last failed mutation, cleared by the next successful one.
    pub mutation_error: Option<String>,
}

impl TaskView {
    pub fn remaining_count(&self) -> usize {
        self.tasks.iter().filter(|task| !task.completed).count()
    }

    pub fn completed_count(&self) -> usize {
        self.tasks.len() - self.remaining_count()
    }
}

/// Task operation failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Operation attempted without a signed-in principal.
    NotSignedIn,
    /// Task text is empty or whitespace only.
    EmptyText,
    /// Target task no longer exists.
    NotFound(TaskId),
    PermissionDenied(String),
    /// Transient failure; re-invoking the same operation may succeed.
    Network(String),
    InvalidData(String),
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::NotSignedIn => "not_signed_in",
            Self::EmptyText => "empty_text",
            Self::NotFound(_) => "not_found",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Network(_) => "network_error",
            Self::InvalidData(_) => "invalid_data",
        }
    }
}

impl Display for SyncError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotSignedIn => write!(f, "Sign in to manage tasks."),
            Self::EmptyText => write!(f, "Task text cannot be empty."),
            Self::NotFound(_) => write!(f, "That task no longer exists."),
            Self::PermissionDenied(details) => write!(f, "Not allowed: {details}"),
            Self::Network(details) => write!(f, "Could not reach the task service: {details}"),
            Self::InvalidData(details) => write!(f, "Invalid task data: {details}"),
        }
    }
}

impl Error for SyncError {}

impl From<StoreError> for SyncError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::PermissionDenied(details) => Self::PermissionDenied(details),
            StoreError::Network(details) => Self::Network(details),
            StoreError::InvalidData(details) => Self::InvalidData(details),
        }
    }
}

#[derive(Default)]
struct EngineState {
    principal: Option<Principal>,
    generation: u64,
    last_revision: Option<u64>,
    sync_state: SyncState,
    tasks: Vec<Task>,
    mutation_error: Option<String>,
    subscription: Option<Subscription>,
}

impl EngineState {
    fn view(&self) -> TaskView {
        TaskView {
            state: self.sync_state,
            owner_uid: self.principal.as_ref().map(|principal| principal.uid.clone()),
            tasks: self.tasks.clone(),
            mutation_error: self.mutation_error.clone(),
        }
    }
}

struct EngineShared {
    state: Mutex<EngineState>,
    observers: Arc<ListenerSet<Observer<TaskView>>>,
}

impl EngineShared {
    fn notify(&self) {
        let view = lock_or_recover(&self.state).view();
        self.observers.emit(&view);
    }

    fn apply_delivery(&self, generation: u64, delivery: &SnapshotDelivery) {
        {
            let mut state = lock_or_recover(&self.state);
            if state.generation != generation {
                debug!(
                    "event=snapshot_apply module=sync status=skipped reason=stale_generation revision={}",
                    delivery.revision
                );
                return;
            }
            if state
                .last_revision
                .is_some_and(|last| delivery.revision <= last)
            {
                debug!(
                    "event=snapshot_apply module=sync status=skipped reason=stale_revision revision={}",
                    delivery.revision
                );
                return;
            }
            let Some(filter) = state.principal.as_ref().map(TaskFilter::owned_by) else {
                return;
            };
            if !delivery.tasks.iter().all(|task| filter.matches(task)) {
                error!(
                    "event=snapshot_apply module=sync status=error error_code=foreign_task revision={}",
                    delivery.revision
                );
                return;
            }

            state.tasks = delivery.tasks.clone();
            state.last_revision = Some(delivery.revision);
            state.sync_state = SyncState::Subscribed;
            debug!(
                "event=snapshot_apply module=sync status=ok revision={} count={}",
                delivery.revision,
                state.tasks.len()
            );
        }
        self.notify();
    }

    /// Stores the outcome of a mutation as the displayable mutation error.
    fn record_outcome<T>(&self, action: &str, result: &Result<T, SyncError>) {
        let next = match result {
            Ok(_) => None,
            Err(err) => {
                warn!(
                    "event=task_{action} module=sync status=error error_code={}",
                    err.code()
                );
                Some(err.to_string())
            }
        };
        let changed = {
            let mut state = lock_or_recover(&self.state);
            let changed = state.mutation_error != next;
            state.mutation_error = next;
            changed
        };
        if changed {
            self.notify();
        }
    }
}

/// Keeps a live, principal-scoped task snapshot.
pub struct TaskSyncEngine {
    store: Arc<dyn TaskStore>,
    shared: Arc<EngineShared>,
}

impl TaskSyncEngine {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            shared: Arc::new(EngineShared {
                state: Mutex::new(EngineState::default()),
                observers: ListenerSet::new(),
            }),
        }
    }

    /// Follows session changes of `session` until the returned handle is
    /// cancelled. The current principal is applied immediately.
    pub fn attach_to(self: &Arc<Self>, session: &SessionManager) -> Subscription {
        let engine: Weak<Self> = Arc::downgrade(self);
        session.on_session_change(Arc::new(move |principal: &Option<Principal>| {
            if let Some(engine) = engine.upgrade() {
                engine.handle_session_change(principal.as_ref());
            }
        }))
    }

    /// Moves the engine to the given principal.
    ///
    /// A different uid (or sign-out) cancels the current subscription and
    /// clears the snapshot before observers are notified; a new principal then
    /// gets a fresh subscription. The same uid again is a no-op.
    pub fn handle_session_change(&self, principal: Option<&Principal>) {
        let next_uid = principal.map(|principal| principal.uid.as_str());
        let (previous, generation) = {
            let mut state = lock_or_recover(&self.shared.state);
            let same_uid = state.principal.as_ref().map(|p| p.uid.as_str()) == next_uid;
            if same_uid {
                state.principal = principal.cloned();
                return;
            }

            state.generation += 1;
            state.principal = principal.cloned();
            state.tasks.clear();
            state.last_revision = None;
            state.mutation_error = None;
            state.sync_state = if principal.is_some() {
                SyncState::Subscribing
            } else {
                SyncState::Unsubscribed
            };
            (state.subscription.take(), state.generation)
        };

        if let Some(previous) = previous {
            previous.cancel();
        }
        self.shared.notify();

        match principal {
            // A failed subscribe is recorded as the mutation error; `resubscribe` retries.
            Some(principal) => {
                let _ = self.open_subscription(principal, generation);
            }
            None => info!("event=sync_unsubscribe module=sync status=ok generation={generation}"),
        }
    }

    /// Re-opens the subscription after a failed subscribe.
    ///
    /// No-op when already subscribed; `NotSignedIn` without a principal.
    pub fn resubscribe(&self) -> Result<(), SyncError> {
        let (principal, generation) = {
            let state = lock_or_recover(&self.shared.state);
            let Some(principal) = state.principal.clone() else {
                return Err(SyncError::NotSignedIn);
            };
            if state.subscription.is_some() {
                return Ok(());
            }
            (principal, state.generation)
        };
        let result = self.open_subscription(&principal, generation);
        if result.is_ok() {
            self.shared.record_outcome("resubscribe", &result);
        }
        result
    }

    /// Creates a task owned by the current principal.
    ///
    /// The snapshot is not touched; the task appears with the next delivery.
    pub fn add_task(&self, text: &str) -> Result<TaskId, SyncError> {
        let principal = self.require_principal("add")?;
        let task = NewTask::new(principal.uid.clone(), text).map_err(|_| SyncError::EmptyText)?;

        let result = self
            .store
            .create(&principal, &task)
            .map_err(SyncError::from);
        self.shared.record_outcome("add", &result);
        if let Ok(id) = &result {
            info!("event=task_add module=sync status=ok task_id={id}");
        }
        result
    }

    /// Flips `completed` of one task, based on the current snapshot value.
    ///
    /// Returns the requested new value.
    pub fn toggle_complete(&self, task_id: TaskId) -> Result<bool, SyncError> {
        let principal = self.require_principal("toggle")?;
        let current = lock_or_recover(&self.shared.state)
            .tasks
            .iter()
            .find(|task| task.id == task_id)
            .map(|task| task.completed);

        let result = match current {
            Some(completed) => self
                .store
                .update(&principal, task_id, &TaskPatch::set_completed(!completed))
                .map(|()| !completed)
                .map_err(SyncError::from),
            None => Err(SyncError::NotFound(task_id)),
        };
        self.shared.record_outcome("toggle", &result);
        if let Ok(completed) = &result {
            info!("event=task_toggle module=sync status=ok task_id={task_id} completed={completed}");
        }
        result
    }

    /// Removes one task. Removing a task that is already gone succeeds.
    pub fn delete_task(&self, task_id: TaskId) -> Result<(), SyncError> {
        let principal = self.require_principal("delete")?;
        let result = match self.store.remove(&principal, task_id) {
            Ok(()) => Ok(()),
            Err(StoreError::NotFound(_)) => {
                debug!("event=task_delete module=sync status=ok task_id={task_id} already_gone=true");
                Ok(())
            }
            Err(err) => Err(SyncError::from(err)),
        };
        self.shared.record_outcome("delete", &result);
        if result.is_ok() {
            info!("event=task_delete module=sync status=ok task_id={task_id}");
        }
        result
    }

    /// Current snapshot in store order.
    pub fn tasks(&self) -> Vec<Task> {
        lock_or_recover(&self.shared.state).tasks.clone()
    }

    pub fn state(&self) -> SyncState {
        lock_or_recover(&self.shared.state).sync_state
    }

    pub fn principal_uid(&self) -> Option<String> {
        lock_or_recover(&self.shared.state)
            .principal
            .as_ref()
            .map(|principal| principal.uid.clone())
    }

    pub fn mutation_error(&self) -> Option<String> {
        lock_or_recover(&self.shared.state).mutation_error.clone()
    }

    pub fn view(&self) -> TaskView {
        lock_or_recover(&self.shared.state).view()
    }

    pub fn has_subscription(&self) -> bool {
        lock_or_recover(&self.shared.state).subscription.is_some()
    }

    /// Registers a view observer, called after every task view change.
    pub fn observe(&self, observer: Observer<TaskView>) -> Subscription {
        self.shared.observers.register(observer)
    }

    /// Cancels the subscription and forgets the principal.
    pub fn shutdown(&self) {
        self.handle_session_change(None);
    }

    fn require_principal(&self, action: &str) -> Result<Principal, SyncError> {
        lock_or_recover(&self.shared.state)
            .principal
            .clone()
            .ok_or_else(|| {
                warn!("event=task_{action} module=sync status=rejected error_code=not_signed_in");
                SyncError::NotSignedIn
            })
    }

    fn open_subscription(&self, principal: &Principal, generation: u64) -> Result<(), SyncError> {
        let shared = Arc::downgrade(&self.shared);
        let listener: SnapshotListener = Arc::new(move |delivery: &SnapshotDelivery| {
            if let Some(shared) = shared.upgrade() {
                shared.apply_delivery(generation, delivery);
            }
        });

        match self
            .store
            .subscribe(principal, TaskFilter::owned_by(principal), listener)
        {
            Ok(subscription) => {
                let stale = {
                    let mut state = lock_or_recover(&self.shared.state);
                    if state.generation == generation {
                        state.subscription = Some(subscription);
                        None
                    } else {
                        Some(subscription)
                    }
                };
                match stale {
                    Some(stale) => stale.cancel(),
                    None => info!(
                        "event=sync_subscribe module=sync status=ok generation={generation}"
                    ),
                }
                Ok(())
            }
            Err(err) => {
                error!(
                    "event=sync_subscribe module=sync status=error generation={generation} error_code={}",
                    err.code()
                );
                let err = SyncError::from(err);
                let current = {
                    let mut state = lock_or_recover(&self.shared.state);
                    let current = state.generation == generation;
                    if current {
                        state.mutation_error = Some(err.to_string());
                    }
                    current
                };
                if current {
                    self.shared.notify();
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SyncError, SyncState, TaskSyncEngine, TaskView};
    use crate::model::principal::Principal;
    use crate::repo::task_repo::SqliteTaskStore;
    use crate::store::task::TaskStore;
    use std::sync::{Arc, Mutex};

    fn engine() -> (Arc<SqliteTaskStore>, TaskSyncEngine) {
        let store = Arc::new(SqliteTaskStore::open_in_memory().expect("store"));
        let engine = TaskSyncEngine::new(Arc::clone(&store) as Arc<dyn TaskStore>);
        (store, engine)
    }

    #[test]
    fn starts_unsubscribed_and_rejects_operations_without_principal() {
        let (store, engine) = engine();
        assert_eq!(engine.state(), SyncState::Unsubscribed);
        assert!(engine.tasks().is_empty());

        assert_eq!(engine.add_task("x"), Err(SyncError::NotSignedIn));
        assert_eq!(
            engine.delete_task(uuid::Uuid::new_v4()),
            Err(SyncError::NotSignedIn)
        );
        assert_eq!(store.revision(), 0);
        assert_eq!(store.subscriber_count(), 0);
    }

    #[test]
    fn add_task_appears_through_subscription() {
        let (store, engine) = engine();
        let alice = Principal::new("alice", "alice@example.com");
        engine.handle_session_change(Some(&alice));
        assert_eq!(engine.state(), SyncState::Subscribed);
        assert_eq!(store.subscriber_count(), 1);

        let id = engine.add_task("  Buy milk ").expect("add");
        let tasks = engine.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, id);
        assert_eq!(tasks[0].text, "  Buy milk ", "text is stored as typed");
        assert_eq!(tasks[0].owner_uid, "alice");
    }

    #[test]
    fn whitespace_text_is_rejected_without_store_call() {
        let (store, engine) = engine();
        let alice = Principal::new("alice", "alice@example.com");
        engine.handle_session_change(Some(&alice));
        let revision_before = store.revision();

        assert_eq!(engine.add_task(" \n\t "), Err(SyncError::EmptyText));
        assert_eq!(store.revision(), revision_before);
        assert!(engine.tasks().is_empty());
        assert_eq!(engine.mutation_error(), None);
    }

    #[test]
    fn same_uid_notification_keeps_subscription() {
        let (store, engine) = engine();
        let alice = Principal::new("alice", "alice@example.com");
        engine.handle_session_change(Some(&alice));
        engine.add_task("keep me").expect("add");

        engine.handle_session_change(Some(&alice));
        assert_eq!(store.subscriber_count(), 1);
        assert_eq!(engine.tasks().len(), 1);
    }

    #[test]
    fn toggle_of_unknown_task_is_not_found_and_recorded() {
        let (_store, engine) = engine();
        let alice = Principal::new("alice", "alice@example.com");
        engine.handle_session_change(Some(&alice));

        let missing = uuid::Uuid::new_v4();
        assert_eq!(
            engine.toggle_complete(missing),
            Err(SyncError::NotFound(missing))
        );
        assert_eq!(
            engine.mutation_error().as_deref(),
            Some("That task no longer exists.")
        );

        engine.add_task("next").expect("add");
        assert_eq!(engine.mutation_error(), None);
    }

    #[test]
    fn observers_see_counts_and_clear_on_shutdown() {
        let (store, engine) = engine();
        let views: Arc<Mutex<Vec<TaskView>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&views);
        let _subscription = engine.observe(Arc::new(move |view: &TaskView| {
            sink.lock().expect("sink lock").push(view.clone());
        }));

        let alice = Principal::new("alice", "alice@example.com");
        engine.handle_session_change(Some(&alice));
        let first = engine.add_task("one").expect("add");
        engine.add_task("two").expect("add");
        engine.toggle_complete(first).expect("toggle");

        let view = engine.view();
        assert_eq!(view.remaining_count(), 1);
        assert_eq!(view.completed_count(), 1);

        engine.shutdown();
        assert_eq!(store.subscriber_count(), 0);
        let last = views.lock().expect("sink lock").last().cloned().expect("views");
        assert_eq!(last.state, SyncState::Unsubscribed);
        assert!(last.tasks.is_empty());
        assert_eq!(last.owner_uid, None);
    }
}
