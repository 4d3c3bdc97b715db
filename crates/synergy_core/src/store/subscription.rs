//! Cancellable subscription handles and listener registries.
//!
//! # Responsibility
//! - Provide the explicit handle returned by every `subscribe`/`observe` call.
//! - Provide a thread-safe registry that stores and fans out to listeners.
//!
//! # Invariants
//! - `Subscription::cancel` (or drop) runs its cancel action exactly once.
//! - A listener removed from a `ListenerSet` is skipped by every fan-out that
//!   reaches it afterwards, including one already in progress.
//! - `OrderedDelivery` hands items to listeners one at a time, in push order,
//!   across threads and across re-entrant pushes.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

/// Shared callback type used for state observers and store listeners.
pub type Observer<T> = Arc<dyn Fn(&T) + Send + Sync>;

type CancelFn = Box<dyn FnOnce() + Send>;

/// Handle for one live subscription.
///
/// Dropping the handle cancels the subscription.
pub struct Subscription {
    id: u64,
    cancel: Option<CancelFn>,
}

impl Subscription {
    pub fn new(id: u64, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Returns a handle with nothing to cancel.
    pub fn detached() -> Self {
        Self { id: 0, cancel: None }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns whether cancellation has not happened yet.
    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }

    /// Cancels the subscription.
    ///
    /// After this returns no new delivery reaches the callback.
    pub fn cancel(mut self) {
        self.cancel_in_place();
    }

    fn cancel_in_place(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_in_place();
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Registry of listener entries keyed by subscription id.
pub struct ListenerSet<E> {
    next_id: AtomicU64,
    entries: Mutex<BTreeMap<u64, E>>,
}

impl<E> Default for ListenerSet<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            entries: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<E: Clone + Send + 'static> ListenerSet<E> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds one entry and returns the handle that removes it.
    ///
    /// The handle holds a weak reference, so it never keeps the registry alive.
    pub fn register(self: &Arc<Self>, entry: E) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        lock_or_recover(&self.entries).insert(id, entry);

        let registry = Arc::downgrade(self);
        Subscription::new(id, move || {
            if let Some(registry) = registry.upgrade() {
                registry.remove(id);
            }
        })
    }

    /// Removes one entry. Returns `false` when it was already gone.
    pub fn remove(&self, id: u64) -> bool {
        lock_or_recover(&self.entries).remove(&id).is_some()
    }

    pub fn contains(&self, id: u64) -> bool {
        lock_or_recover(&self.entries).contains_key(&id)
    }

    /// Returns a copy of current entries in registration order.
    pub fn entries(&self) -> Vec<(u64, E)> {
        lock_or_recover(&self.entries)
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> ListenerSet<Observer<T>> {
    /// Calls every registered observer with `value`.
    ///
    /// No lock is held while observers run, so an observer may register,
    /// cancel, or call back into its owner.
    pub fn emit(&self, value: &T) {
        for (id, observer) in self.entries() {
            if self.contains(id) {
                observer(value);
            }
        }
    }
}

struct DeliveryQueue<T> {
    pending: VecDeque<(u64, T)>,
    last_pushed: u64,
    last_delivered: u64,
    dispatcher: Option<ThreadId>,
}

/// Serializes notifications so listeners observe them in occurrence order.
///
/// A state owner pushes each change while still holding the lock that
/// orders its state, then calls `deliver_until` after releasing it. Exactly
/// one thread dispatches at a time. A push made from inside a listener on the
/// dispatching thread is delivered after the current item; a push from any
/// other thread waits until its item has been delivered.
pub struct OrderedDelivery<T> {
    queue: Mutex<DeliveryQueue<T>>,
    delivered: Condvar,
}

impl<T> Default for OrderedDelivery<T> {
    fn default() -> Self {
        Self {
            queue: Mutex::new(DeliveryQueue {
                pending: VecDeque::new(),
                last_pushed: 0,
                last_delivered: 0,
                dispatcher: None,
            }),
            delivered: Condvar::new(),
        }
    }
}

impl<T> OrderedDelivery<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one item and returns its sequence number.
    pub fn push(&self, item: T) -> u64 {
        let mut queue = lock_or_recover(&self.queue);
        queue.last_pushed += 1;
        let seq = queue.last_pushed;
        queue.pending.push_back((seq, item));
        seq
    }

    /// Returns once item `seq` has been handed to `deliver`, or is queued
    /// behind a delivery running on this thread.
    ///
    /// `deliver` runs with no queue lock held.
    pub fn deliver_until(&self, seq: u64, deliver: impl Fn(&T)) {
        let me = thread::current().id();
        {
            let mut queue = lock_or_recover(&self.queue);
            loop {
                if queue.last_delivered >= seq {
                    return;
                }
                match queue.dispatcher {
                    None => {
                        queue.dispatcher = Some(me);
                        break;
                    }
                    Some(current) if current == me => return,
                    Some(_) => {
                        queue = self
                            .delivered
                            .wait(queue)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                }
            }
        }

        let _dispatching = DispatchGuard { owner: self };
        loop {
            let next = lock_or_recover(&self.queue).pending.pop_front();
            let Some((item_seq, item)) = next else {
                break;
            };
            deliver(&item);
            lock_or_recover(&self.queue).last_delivered = item_seq;
            self.delivered.notify_all();
        }
    }
}

/// Releases the dispatcher role, also when a listener panics.
struct DispatchGuard<'a, T> {
    owner: &'a OrderedDelivery<T>,
}

impl<T> Drop for DispatchGuard<'_, T> {
    fn drop(&mut self) {
        lock_or_recover(&self.owner.queue).dispatcher = None;
        self.owner.delivered.notify_all();
    }
}

/// Locks a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::{ListenerSet, Observer, OrderedDelivery, Subscription};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc, Mutex};
    use std::thread;

    fn counting_observer(counter: &Arc<AtomicUsize>) -> Observer<u32> {
        let counter = Arc::clone(counter);
        Arc::new(move |_value: &u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn cancel_removes_listener() {
        let set = ListenerSet::<Observer<u32>>::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = set.register(counting_observer(&counter));

        set.emit(&1);
        handle.cancel();
        set.emit(&2);

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn drop_cancels_and_detached_handle_is_inert() {
        let set = ListenerSet::<Observer<u32>>::new();
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let _handle = set.register(counting_observer(&counter));
            assert_eq!(set.len(), 1);
        }
        assert!(set.is_empty());

        let detached = Subscription::detached();
        assert!(!detached.is_active());
        detached.cancel();
    }

    #[test]
    fn listener_cancelled_during_fan_out_is_skipped() {
        let set = ListenerSet::<Observer<u32>>::new();
        let later_calls = Arc::new(AtomicUsize::new(0));
        let second_handle: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&second_handle);
        let _first = set.register(Arc::new(move |_value: &u32| {
            if let Some(handle) = slot.lock().expect("slot lock").take() {
                handle.cancel();
            }
        }));
        let second = set.register(counting_observer(&later_calls));
        *second_handle.lock().expect("slot lock") = Some(second);

        set.emit(&7);
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        let set = ListenerSet::<Observer<u32>>::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let first = set.register(counting_observer(&counter));
        let second = set.register(counting_observer(&counter));
        assert!(second.id() > first.id());
    }

    #[test]
    fn push_from_inside_delivery_runs_after_current_item() {
        let queue = OrderedDelivery::<u32>::new();
        let seen = Mutex::new(Vec::new());

        let first = queue.push(1);
        queue.deliver_until(first, |item| {
            seen.lock().expect("seen lock").push(*item);
            if *item == 1 {
                let nested = queue.push(2);
                queue.deliver_until(nested, |_| panic!("nested dispatch must not run"));
                seen.lock().expect("seen lock").push(10);
            }
        });

        assert_eq!(*seen.lock().expect("seen lock"), vec![1, 10, 2]);
    }

    #[test]
    fn items_pushed_while_another_thread_dispatches_keep_push_order() {
        let queue = Arc::new(OrderedDelivery::<u32>::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (entered_tx, entered_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);

        let first = queue.push(1);
        let dispatcher = {
            let queue = Arc::clone(&queue);
            let seen = Arc::clone(&seen);
            thread::spawn(move || {
                queue.deliver_until(first, |item| {
                    if *item == 1 {
                        entered_tx.send(()).expect("entered");
                        release_rx.lock().expect("release lock").recv().expect("release");
                    }
                    seen.lock().expect("seen lock").push(*item);
                });
            })
        };

        entered_rx.recv().expect("dispatcher entered");
        let second = queue.push(2);
        release_tx.send(()).expect("release");
        dispatcher.join().expect("dispatcher thread");

        queue.deliver_until(second, |_| panic!("already delivered"));
        assert_eq!(*seen.lock().expect("seen lock"), vec![1, 2]);
    }
}
