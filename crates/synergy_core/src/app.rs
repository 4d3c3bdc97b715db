//! Process-wide application context.
//!
//! # Responsibility
//! - Build the credential and task stores once per process.
//! - Wire the session manager to the task sync engine.
//! - Tear both down in dependency order.
//!
//! # Invariants
//! - Exactly one engine link to the session manager exists while running.
//! - The view layer only reaches stores through `session()` and `tasks()`.

use crate::config::CoreConfig;
use crate::db::DbError;
use crate::logging::{init_logging, LoggingError};
use crate::repo::account_repo::SqliteCredentialStore;
use crate::repo::task_repo::SqliteTaskStore;
use crate::service::session_service::SessionManager;
use crate::service::task_sync::TaskSyncEngine;
use crate::store::credential::CredentialStore;
use crate::store::subscription::{lock_or_recover, Subscription};
use crate::store::task::TaskStore;
use log::info;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex};

/// Startup failures.
#[derive(Debug)]
pub enum AppError {
    Db(DbError),
    Logging(LoggingError),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "failed to open store: {err}"),
            Self::Logging(err) => write!(f, "failed to initialize logging: {err}"),
        }
    }
}

impl Error for AppError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Logging(err) => Some(err),
        }
    }
}

impl From<DbError> for AppError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<LoggingError> for AppError {
    fn from(value: LoggingError) -> Self {
        Self::Logging(value)
    }
}

/// Shared client handles plus the two core components.
pub struct SynergyApp {
    config: CoreConfig,
    session: SessionManager,
    tasks: Arc<TaskSyncEngine>,
    engine_link: Mutex<Option<Subscription>>,
}

impl SynergyApp {
    /// Initializes logging (when configured) and opens SQLite-backed stores.
    pub fn open(config: CoreConfig) -> Result<Self, AppError> {
        if let Some(log_dir) = &config.log_dir {
            init_logging(&config.log_level, log_dir)?;
        }

        let (credentials, store) = match &config.db_path {
            Some(path) => (
                SqliteCredentialStore::open(path)?,
                SqliteTaskStore::open(path)?,
            ),
            None => (
                SqliteCredentialStore::open_in_memory()?,
                SqliteTaskStore::open_in_memory()?,
            ),
        };
        info!(
            "event=app_open module=app status=ok persistent={}",
            config.db_path.is_some()
        );

        Ok(Self::with_stores(
            config,
            Arc::new(credentials),
            Arc::new(store),
        ))
    }

    /// Opens with default configuration and in-memory stores.
    pub fn open_in_memory() -> Result<Self, AppError> {
        Self::open(CoreConfig::default())
    }

    /// Wires components over caller-provided stores.
    pub fn with_stores(
        config: CoreConfig,
        credentials: Arc<dyn CredentialStore>,
        store: Arc<dyn TaskStore>,
    ) -> Self {
        let session = SessionManager::new(credentials);
        let tasks = Arc::new(TaskSyncEngine::new(store));
        let engine_link = tasks.attach_to(&session);

        Self {
            config,
            session,
            tasks,
            engine_link: Mutex::new(Some(engine_link)),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn tasks(&self) -> &TaskSyncEngine {
        &self.tasks
    }

    /// Detaches the engine, releases its subscription, then stops the
    /// session manager. Safe to call more than once.
    pub fn shutdown(&self) {
        let link = lock_or_recover(&self.engine_link).take();
        if let Some(link) = link {
            link.cancel();
            self.tasks.shutdown();
            self.session.shutdown();
            info!("event=app_shutdown module=app status=ok");
        }
    }
}

impl Drop for SynergyApp {
    fn drop(&mut self) {
        self.shutdown();
    }
}
