#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use synergy_core::{
    NewTask, Principal, SnapshotDelivery, SnapshotListener, SqliteTaskStore, StoreError,
    StoreResult, Subscription, Task, TaskFilter, TaskId, TaskPatch, TaskStore, TaskView,
};
use uuid::Uuid;

/// Real SQLite store with injectable failures and call counters.
pub struct FlakyTaskStore {
    inner: SqliteTaskStore,
    failures: Mutex<VecDeque<StoreError>>,
    write_calls: AtomicUsize,
    subscribe_calls: AtomicUsize,
}

impl FlakyTaskStore {
    pub fn new() -> Self {
        Self {
            inner: SqliteTaskStore::open_in_memory().expect("in-memory store"),
            failures: Mutex::new(VecDeque::new()),
            write_calls: AtomicUsize::new(0),
            subscribe_calls: AtomicUsize::new(0),
        }
    }

    /// Makes the next store call (of any kind) fail with `err`.
    pub fn fail_next(&self, err: StoreError) {
        self.failures.lock().expect("failures lock").push_back(err);
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &SqliteTaskStore {
        &self.inner
    }

    fn injected(&self) -> StoreResult<()> {
        match self.failures.lock().expect("failures lock").pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl TaskStore for FlakyTaskStore {
    fn create(&self, caller: &Principal, task: &NewTask) -> StoreResult<TaskId> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.injected()?;
        self.inner.create(caller, task)
    }

    fn update(&self, caller: &Principal, id: TaskId, patch: &TaskPatch) -> StoreResult<()> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.injected()?;
        self.inner.update(caller, id, patch)
    }

    fn remove(&self, caller: &Principal, id: TaskId) -> StoreResult<()> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.injected()?;
        self.inner.remove(caller, id)
    }

    fn subscribe(
        &self,
        caller: &Principal,
        filter: TaskFilter,
        listener: SnapshotListener,
    ) -> StoreResult<Subscription> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.injected()?;
        self.inner.subscribe(caller, filter, listener)
    }
}

/// Store whose deliveries are pushed by the test.
///
/// Listeners are kept even after cancellation so tests can simulate a
/// misbehaving store that keeps calling old listeners. Updates and removals
/// always report `NotFound`.
#[derive(Default)]
pub struct ManualTaskStore {
    listeners: Mutex<Vec<(TaskFilter, SnapshotListener)>>,
    cancelled: Arc<AtomicUsize>,
}

impl ManualTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscription_count(&self) -> usize {
        self.listeners.lock().expect("listeners lock").len()
    }

    pub fn cancelled_count(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn filter_at(&self, index: usize) -> TaskFilter {
        self.listeners.lock().expect("listeners lock")[index].0.clone()
    }

    /// Delivers to the listener registered `index`-th, cancelled or not.
    pub fn push_to(&self, index: usize, revision: u64, tasks: Vec<Task>) {
        let listener = Arc::clone(&self.listeners.lock().expect("listeners lock")[index].1);
        listener(&SnapshotDelivery { revision, tasks });
    }
}

impl TaskStore for ManualTaskStore {
    fn create(&self, _caller: &Principal, _task: &NewTask) -> StoreResult<TaskId> {
        Ok(Uuid::new_v4())
    }

    fn update(&self, _caller: &Principal, id: TaskId, _patch: &TaskPatch) -> StoreResult<()> {
        Err(StoreError::NotFound(id))
    }

    fn remove(&self, _caller: &Principal, id: TaskId) -> StoreResult<()> {
        Err(StoreError::NotFound(id))
    }

    fn subscribe(
        &self,
        _caller: &Principal,
        filter: TaskFilter,
        listener: SnapshotListener,
    ) -> StoreResult<Subscription> {
        let mut listeners = self.listeners.lock().expect("listeners lock");
        listeners.push((filter, listener));
        let cancelled = Arc::clone(&self.cancelled);
        Ok(Subscription::new(listeners.len() as u64, move || {
            cancelled.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

pub fn task(owner_uid: &str, text: &str, completed: bool) -> Task {
    Task {
        id: Uuid::new_v4(),
        owner_uid: owner_uid.to_string(),
        text: text.to_string(),
        completed,
        created_at_ms: 1,
    }
}

/// Collects every view an observer sees.
pub fn record_views() -> (Arc<Mutex<Vec<TaskView>>>, Arc<dyn Fn(&TaskView) + Send + Sync>) {
    let views = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&views);
    let observer: Arc<dyn Fn(&TaskView) + Send + Sync> = Arc::new(move |view: &TaskView| {
        sink.lock().expect("views lock").push(view.clone());
    });
    (views, observer)
}
