//! SQLite-backed task store with live filtered subscriptions.
//!
//! # Responsibility
//! - Persist task documents in the `tasks` table.
//! - Enforce ownership rules against the calling principal.
//! - Fan out full-state deliveries to subscribers after every committed write.
//!
//! # Invariants
//! - `id` and `created_at` are assigned here, never taken from callers.
//! - `created_at` is strictly increasing within one store instance.
//! - Only subscribers whose filter matches the written owner are notified.
//! - No store lock is held while subscriber callbacks run.

use crate::db::{open_db, open_db_in_memory, DbResult};
use crate::model::principal::Principal;
use crate::model::task::{is_blank_task_text, NewTask, Task, TaskId, TaskPatch};
use crate::store::subscription::{lock_or_recover, ListenerSet, Subscription};
use crate::store::task::{
    SnapshotDelivery, SnapshotListener, StoreError, StoreResult, TaskFilter, TaskStore,
    TASKS_COLLECTION,
};
use log::{debug, error, info, warn};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

const TASK_SELECT_SQL: &str = "SELECT id, uid, text, completed, created_at FROM tasks";

#[derive(Clone)]
struct TaskListener {
    filter: TaskFilter,
    callback: SnapshotListener,
}

struct StoreState {
    conn: Connection,
    revision: u64,
    last_created_at_ms: i64,
}

type PendingDelivery = (u64, SnapshotListener, SnapshotDelivery);

/// Task store over one SQLite connection.
pub struct SqliteTaskStore {
    state: Mutex<StoreState>,
    listeners: Arc<ListenerSet<TaskListener>>,
}

impl SqliteTaskStore {
    /// Opens (or creates) a file-backed store.
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        Ok(Self::from_connection(open_db(path)?))
    }

    /// Opens a private in-memory store.
    pub fn open_in_memory() -> DbResult<Self> {
        Ok(Self::from_connection(open_db_in_memory()?))
    }

    /// Wraps a connection that already has migrations applied.
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            state: Mutex::new(StoreState {
                conn,
                revision: 0,
                last_created_at_ms: 0,
            }),
            listeners: ListenerSet::new(),
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.listeners.len()
    }

    /// Current write revision.
    pub fn revision(&self) -> u64 {
        lock_or_recover(&self.state).revision
    }

    /// Reads one task regardless of owner.
    ///
    /// Intended for administrative inspection of final store state.
    pub fn get(&self, id: TaskId) -> StoreResult<Option<Task>> {
        let state = lock_or_recover(&self.state);
        let mut stmt = state
            .conn
            .prepare(&format!("{TASK_SELECT_SQL} WHERE id = ?1;"))?;
        let mut rows = stmt.query([id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_task_row(row)?));
        }

        Ok(None)
    }

    /// Runs one write under the store lock and notifies affected subscribers.
    ///
    /// Once `write` succeeds the call succeeds; a subscriber whose snapshot
    /// cannot be read is skipped for this revision.
    fn write_and_notify<T>(
        &self,
        owner_uid: &str,
        write: impl FnOnce(&mut StoreState) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let (value, pending) = {
            let mut state = lock_or_recover(&self.state);
            let value = write(&mut state)?;
            state.revision += 1;
            let pending = self.collect_deliveries(&state, owner_uid);
            (value, pending)
        };
        self.deliver(pending);
        Ok(value)
    }

    fn collect_deliveries(&self, state: &StoreState, owner_uid: &str) -> Vec<PendingDelivery> {
        let mut pending = Vec::new();
        for (id, listener) in self.listeners.entries() {
            if listener.filter.owner_uid != owner_uid {
                continue;
            }
            match query_filtered(&state.conn, &listener.filter) {
                Ok(tasks) => pending.push((
                    id,
                    listener.callback,
                    SnapshotDelivery {
                        revision: state.revision,
                        tasks,
                    },
                )),
                Err(err) => error!(
                    "event=task_deliver module=task_store status=error subscription_id={id} revision={} error_code={}",
                    state.revision,
                    err.code()
                ),
            }
        }
        pending
    }

    fn deliver(&self, pending: Vec<PendingDelivery>) {
        for (id, callback, delivery) in pending {
            if !self.listeners.contains(id) {
                continue;
            }
            debug!(
                "event=task_deliver module=task_store subscription_id={id} revision={} count={}",
                delivery.revision,
                delivery.tasks.len()
            );
            callback(&delivery);
        }
    }
}

impl TaskStore for SqliteTaskStore {
    fn create(&self, caller: &Principal, task: &NewTask) -> StoreResult<TaskId> {
        ensure_owner(caller, &task.owner_uid, "create")?;
        if is_blank_task_text(&task.text) {
            return Err(StoreError::InvalidData(
                "task text cannot be empty".to_string(),
            ));
        }

        let id = self.write_and_notify(&task.owner_uid, |state| {
            let id = Uuid::new_v4();
            let created_at_ms = now_epoch_ms().max(state.last_created_at_ms + 1);
            state.conn.execute(
                "INSERT INTO tasks (id, uid, text, completed, created_at)
                 VALUES (?1, ?2, ?3, 0, ?4);",
                params![
                    id.to_string(),
                    task.owner_uid.as_str(),
                    task.text.as_str(),
                    created_at_ms
                ],
            )?;
            state.last_created_at_ms = created_at_ms;
            Ok(id)
        })?;

        info!("event=task_create module=task_store status=ok task_id={id}");
        Ok(id)
    }

    fn update(&self, caller: &Principal, id: TaskId, patch: &TaskPatch) -> StoreResult<()> {
        self.write_and_notify(&caller.uid, |state| {
            let mut task = load_owned_task(&state.conn, caller, id, "update")?;
            patch.apply_to(&mut task);
            state.conn.execute(
                "UPDATE tasks SET completed = ?1 WHERE id = ?2;",
                params![bool_to_int(task.completed), id.to_string()],
            )?;
            Ok(())
        })?;

        info!("event=task_update module=task_store status=ok task_id={id}");
        Ok(())
    }

    fn remove(&self, caller: &Principal, id: TaskId) -> StoreResult<()> {
        self.write_and_notify(&caller.uid, |state| {
            load_owned_task(&state.conn, caller, id, "remove")?;
            state
                .conn
                .execute("DELETE FROM tasks WHERE id = ?1;", [id.to_string()])?;
            Ok(())
        })?;

        info!("event=task_remove module=task_store status=ok task_id={id}");
        Ok(())
    }

    fn subscribe(
        &self,
        caller: &Principal,
        filter: TaskFilter,
        listener: SnapshotListener,
    ) -> StoreResult<Subscription> {
        ensure_owner(caller, &filter.owner_uid, "subscribe")?;

        let (subscription, initial) = {
            let state = lock_or_recover(&self.state);
            let tasks = query_filtered(&state.conn, &filter)?;
            let subscription = self.listeners.register(TaskListener {
                filter,
                callback: Arc::clone(&listener),
            });
            let initial = SnapshotDelivery {
                revision: state.revision,
                tasks,
            };
            (subscription, initial)
        };

        info!(
            "event=task_subscribe module=task_store status=ok collection={} subscription_id={} revision={}",
            TASKS_COLLECTION,
            subscription.id(),
            initial.revision
        );
        self.deliver(vec![(subscription.id(), listener, initial)]);
        Ok(subscription)
    }
}

fn ensure_owner(caller: &Principal, owner_uid: &str, action: &str) -> StoreResult<()> {
    if caller.uid == owner_uid {
        return Ok(());
    }
    warn!("event=task_{action} module=task_store status=denied error_code=owner_mismatch");
    Err(StoreError::PermissionDenied(format!(
        "{action} is not allowed for another user's tasks"
    )))
}

/// Reads one task and checks that `caller` owns it.
fn load_owned_task(
    conn: &Connection,
    caller: &Principal,
    id: TaskId,
    action: &str,
) -> StoreResult<Task> {
    let mut stmt = conn.prepare(&format!("{TASK_SELECT_SQL} WHERE id = ?1;"))?;
    let mut rows = stmt.query([id.to_string()])?;
    let Some(row) = rows.next()? else {
        return Err(StoreError::NotFound(id));
    };
    let task = parse_task_row(row)?;
    ensure_owner(caller, &task.owner_uid, action)?;
    Ok(task)
}

fn query_filtered(conn: &Connection, filter: &TaskFilter) -> StoreResult<Vec<Task>> {
    let mut stmt = conn.prepare(&format!(
        "{TASK_SELECT_SQL} WHERE uid = ?1 ORDER BY created_at ASC, id ASC;"
    ))?;
    let mut rows = stmt.query([filter.owner_uid.as_str()])?;
    let mut tasks = Vec::new();
    while let Some(row) = rows.next()? {
        tasks.push(parse_task_row(row)?);
    }
    Ok(tasks)
}

fn parse_task_row(row: &Row<'_>) -> StoreResult<Task> {
    let id_text: String = row.get("id")?;
    let id = Uuid::parse_str(&id_text).map_err(|_| {
        StoreError::InvalidData(format!("invalid uuid value `{id_text}` in tasks.id"))
    })?;

    let completed = match row.get::<_, i64>("completed")? {
        0 => false,
        1 => true,
        other => {
            return Err(StoreError::InvalidData(format!(
                "invalid completed value `{other}` in tasks.completed"
            )));
        }
    };

    Ok(Task {
        id,
        owner_uid: row.get("uid")?,
        text: row.get("text")?,
        completed,
        created_at_ms: row.get("created_at")?,
    })
}

fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

fn bool_to_int(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::SqliteTaskStore;
    use crate::model::principal::Principal;
    use crate::model::task::{NewTask, TaskPatch};
    use crate::store::task::{SnapshotDelivery, StoreError, TaskFilter, TaskStore};
    use std::sync::{Arc, Mutex};

    fn recorder() -> (
        Arc<Mutex<Vec<SnapshotDelivery>>>,
        Arc<dyn Fn(&SnapshotDelivery) + Send + Sync>,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: Arc<dyn Fn(&SnapshotDelivery) + Send + Sync> =
            Arc::new(move |delivery: &SnapshotDelivery| {
                sink.lock().expect("recorder lock").push(delivery.clone());
            });
        (seen, listener)
    }

    #[test]
    fn subscribe_delivers_initial_state_immediately() {
        let store = SqliteTaskStore::open_in_memory().expect("store");
        let alice = Principal::new("alice", "alice@example.com");
        store
            .create(&alice, &NewTask::new("alice", "first").expect("task"))
            .expect("create");

        let (seen, listener) = recorder();
        let _subscription = store
            .subscribe(&alice, TaskFilter::owned_by(&alice), listener)
            .expect("subscribe");

        let seen = seen.lock().expect("recorder lock");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].tasks.len(), 1);
        assert_eq!(seen[0].tasks[0].text, "first");
        assert!(!seen[0].tasks[0].completed);
    }

    #[test]
    fn writes_deliver_increasing_revisions_in_creation_order() {
        let store = SqliteTaskStore::open_in_memory().expect("store");
        let alice = Principal::new("alice", "alice@example.com");
        let (seen, listener) = recorder();
        let _subscription = store
            .subscribe(&alice, TaskFilter::owned_by(&alice), listener)
            .expect("subscribe");

        for text in ["one", "two", "three"] {
            store
                .create(&alice, &NewTask::new("alice", text).expect("task"))
                .expect("create");
        }

        let seen = seen.lock().expect("recorder lock");
        assert_eq!(seen.len(), 4);
        assert!(seen.windows(2).all(|pair| pair[0].revision < pair[1].revision));
        let texts: Vec<&str> = seen[3].tasks.iter().map(|task| task.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
        assert!(seen[3]
            .tasks
            .windows(2)
            .all(|pair| pair[0].created_at_ms < pair[1].created_at_ms));
    }

    #[test]
    fn other_owners_subscribers_are_not_notified() {
        let store = SqliteTaskStore::open_in_memory().expect("store");
        let alice = Principal::new("alice", "alice@example.com");
        let bob = Principal::new("bob", "bob@example.com");
        let (seen, listener) = recorder();
        let _subscription = store
            .subscribe(&bob, TaskFilter::owned_by(&bob), listener)
            .expect("subscribe");

        store
            .create(&alice, &NewTask::new("alice", "private").expect("task"))
            .expect("create");

        let seen = seen.lock().expect("recorder lock");
        assert_eq!(seen.len(), 1);
        assert!(seen[0].tasks.is_empty());
    }

    #[test]
    fn ownership_rules_reject_foreign_writes_and_filters() {
        let store = SqliteTaskStore::open_in_memory().expect("store");
        let alice = Principal::new("alice", "alice@example.com");
        let bob = Principal::new("bob", "bob@example.com");
        let id = store
            .create(&alice, &NewTask::new("alice", "mine").expect("task"))
            .expect("create");

        let spoofed = store.create(&bob, &NewTask::new("alice", "spoof").expect("task"));
        assert!(matches!(spoofed, Err(StoreError::PermissionDenied(_))));

        let toggled = store.update(&bob, id, &TaskPatch::set_completed(true));
        assert!(matches!(toggled, Err(StoreError::PermissionDenied(_))));

        let removed = store.remove(&bob, id);
        assert!(matches!(removed, Err(StoreError::PermissionDenied(_))));

        let (_seen, listener) = recorder();
        let peek = store.subscribe(&bob, TaskFilter::owned_by(&alice), listener);
        assert!(matches!(peek, Err(StoreError::PermissionDenied(_))));

        let stored = store.get(id).expect("get").expect("still present");
        assert!(!stored.completed);
    }

    #[test]
    fn update_and_remove_missing_return_not_found() {
        let store = SqliteTaskStore::open_in_memory().expect("store");
        let alice = Principal::new("alice", "alice@example.com");
        let missing = uuid::Uuid::new_v4();

        let updated = store.update(&alice, missing, &TaskPatch::set_completed(true));
        assert_eq!(updated, Err(StoreError::NotFound(missing)));
        let removed = store.remove(&alice, missing);
        assert_eq!(removed, Err(StoreError::NotFound(missing)));
        assert_eq!(store.revision(), 0);
    }

    #[test]
    fn cancelled_subscription_receives_nothing_more() {
        let store = SqliteTaskStore::open_in_memory().expect("store");
        let alice = Principal::new("alice", "alice@example.com");
        let (seen, listener) = recorder();
        let subscription = store
            .subscribe(&alice, TaskFilter::owned_by(&alice), listener)
            .expect("subscribe");
        assert_eq!(store.subscriber_count(), 1);

        subscription.cancel();
        assert_eq!(store.subscriber_count(), 0);
        store
            .create(&alice, &NewTask::new("alice", "after cancel").expect("task"))
            .expect("create");

        assert_eq!(seen.lock().expect("recorder lock").len(), 1);
    }

    #[test]
    fn committed_write_succeeds_even_when_a_snapshot_read_fails() {
        let store = SqliteTaskStore::open_in_memory().expect("store");
        let alice = Principal::new("alice", "alice@example.com");
        let (seen, listener) = recorder();
        let _subscription = store
            .subscribe(&alice, TaskFilter::owned_by(&alice), listener)
            .expect("subscribe");

        let written = store.write_and_notify("alice", |state| {
            state
                .conn
                .execute_batch("ALTER TABLE tasks RENAME TO archived_tasks;")?;
            Ok(7)
        });

        assert_eq!(written, Ok(7));
        assert_eq!(store.revision(), 1);
        assert_eq!(seen.lock().expect("recorder lock").len(), 1, "initial only");
    }

    #[test]
    fn update_applies_patch_to_the_stored_row() {
        let store = SqliteTaskStore::open_in_memory().expect("store");
        let alice = Principal::new("alice", "alice@example.com");
        let id = store
            .create(&alice, &NewTask::new("alice", " padded text ").expect("task"))
            .expect("create");

        store
            .update(&alice, id, &TaskPatch::default())
            .expect("empty patch");
        let unchanged = store.get(id).expect("get").expect("present");
        assert!(!unchanged.completed);
        assert_eq!(unchanged.text, " padded text ");

        store
            .update(&alice, id, &TaskPatch::set_completed(true))
            .expect("update");
        let updated = store.get(id).expect("get").expect("present");
        assert!(updated.completed);
        assert_eq!(updated.text, unchanged.text);
        assert_eq!(updated.created_at_ms, unchanged.created_at_ms);
    }
}
