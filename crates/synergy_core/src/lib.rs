//! Core domain logic for SynergySphere.
//! This crate is the single source of truth for session and task sync
//! invariants; view layers only render its state and forward intents.

pub mod app;
pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;
pub mod store;

pub use app::{AppError, SynergyApp};
pub use config::{ConfigError, CoreConfig};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::principal::Principal;
pub use model::task::{NewTask, Task, TaskId, TaskPatch, TaskValidationError};
pub use repo::account_repo::SqliteCredentialStore;
pub use repo::task_repo::SqliteTaskStore;
pub use service::session_service::{AuthMode, SessionError, SessionManager, SessionView};
pub use service::task_sync::{SyncError, SyncState, TaskSyncEngine, TaskView};
pub use store::credential::{CredentialError, CredentialResult, CredentialStore, SessionListener};
pub use store::subscription::{ListenerSet, Observer, OrderedDelivery, Subscription};
pub use store::task::{
    SnapshotDelivery, SnapshotListener, StoreError, StoreResult, TaskFilter, TaskStore,
    TASKS_COLLECTION,
};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
