//! Task store contract.
//!
//! # Responsibility
//! - Define create/update/remove and filtered live subscriptions over the
//!   `tasks` collection.
//! - Carry the caller principal so stores can enforce ownership rules.
//!
//! # Invariants
//! - Subscription filters are evaluated by the store, never by the caller.
//! - Every delivery is a complete ordered state, never a delta.
//! - Delivery revisions for one store are strictly increasing per write.
//! - Writes or subscriptions whose owner differs from `caller.uid` fail with
//!   `PermissionDenied`.

use crate::db::DbError;
use crate::model::principal::Principal;
use crate::model::task::{NewTask, Task, TaskId, TaskPatch, TaskValidationError};
use crate::store::subscription::{Observer, Subscription};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Collection name holding task documents.
pub const TASKS_COLLECTION: &str = "tasks";

pub type StoreResult<T> = Result<T, StoreError>;

/// Listener receiving full-state deliveries for one subscription.
pub type SnapshotListener = Observer<SnapshotDelivery>;

/// Server-side filter for a task subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFilter {
    pub owner_uid: String,
}

impl TaskFilter {
    pub fn owned_by(principal: &Principal) -> Self {
        Self {
            owner_uid: principal.uid.clone(),
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        task.owner_uid == self.owner_uid
    }
}

/// One full-state delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotDelivery {
    /// Store write counter observed when `tasks` was read.
    pub revision: u64,
    /// Every task matching the filter, in store order.
    pub tasks: Vec<Task>,
}

/// Task store failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Target document does not exist.
    NotFound(TaskId),
    /// Caller is not allowed to touch the target document or filter.
    PermissionDenied(String),
    /// Transient transport failure; the same call may be retried.
    Network(String),
    /// Payload rejected or persisted data unreadable.
    InvalidData(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Stable machine-readable code for logs and callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Network(_) => "network_error",
            Self::InvalidData(_) => "invalid_data",
        }
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "task not found: {id}"),
            Self::PermissionDenied(details) => write!(f, "permission denied: {details}"),
            Self::Network(details) => write!(f, "task store unavailable: {details}"),
            Self::InvalidData(details) => write!(f, "invalid task data: {details}"),
        }
    }
}

impl Error for StoreError {}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        if value.is_transient() {
            Self::Network(value.to_string())
        } else {
            Self::InvalidData(value.to_string())
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::from(DbError::from(value))
    }
}

impl From<TaskValidationError> for StoreError {
    fn from(value: TaskValidationError) -> Self {
        Self::InvalidData(value.to_string())
    }
}

/// Remote multi-tenant task collection.
pub trait TaskStore: Send + Sync {
    /// Creates a task owned by `task.owner_uid` and returns the assigned id.
    fn create(&self, caller: &Principal, task: &NewTask) -> StoreResult<TaskId>;

    /// Applies a partial update to one task.
    fn update(&self, caller: &Principal, id: TaskId, patch: &TaskPatch) -> StoreResult<()>;

    /// Removes one task. Missing ids fail with `NotFound`.
    fn remove(&self, caller: &Principal, id: TaskId) -> StoreResult<()>;

    /// Opens a live subscription.
    ///
    /// The current matching state is delivered before this returns.
    fn subscribe(
        &self,
        caller: &Principal,
        filter: TaskFilter,
        listener: SnapshotListener,
    ) -> StoreResult<Subscription>;
}
