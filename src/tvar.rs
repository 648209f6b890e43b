// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Transactional variables.
//!
//! A [`TVar`] owns a multi-versioned history of committed values. Readers
//! resolve the newest entry at or below their read stamp, so a running
//! transaction always observes the snapshot it started from, even while a
//! committer holds the variable's write lock.

use crate::{error::TxError, stm, watch::Watcher};
use std::{
    any::Any,
    fmt,
    hash::{Hash, Hasher},
    marker::PhantomData,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    time::Duration,
};

/// Committed values are shared type-erased, so the thread-local transaction
/// context can carry variables of mixed types in one log.
pub(crate) type Value = Arc<dyn Any + Send + Sync>;

pub(crate) struct Entry {
    pub(crate) stamp: usize,
    pub(crate) value: Value,
}

/// The untyped core of a variable. Identity is the allocation address.
pub(crate) struct TVarInner {
    /// Committed entries, newest first. Never empty; stamps strictly decrease.
    history: Mutex<Vec<Entry>>,

    /// Id of the transaction holding the write lock, 0 when free.
    owner: AtomicUsize,

    /// Watchers whose predicate touched this variable on its last evaluation.
    watchers: Mutex<Vec<Weak<Watcher>>>,
}

impl TVarInner {
    pub(crate) fn new(value: Value) -> Arc<Self> {
        Arc::new(Self {
            history: Mutex::new(vec![Entry { stamp: 0, value }]),
            owner: AtomicUsize::new(0),
            watchers: Mutex::new(Vec::new()),
        })
    }

    fn lock_history(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.history.lock().expect("TVar history poisoned")
    }

    /// Newest committed entry at or below `stamp`. Fails when the snapshot
    /// has already been pruned, which forces the caller to retry on a
    /// fresh one.
    pub(crate) fn read_at(&self, stamp: usize) -> Result<Value, TxError> {
        let history = self.lock_history();
        history
            .iter()
            .find(|entry| entry.stamp <= stamp)
            .map(|entry| entry.value.clone())
            .ok_or(TxError::VersionMismatch)
    }

    pub(crate) fn newest_stamp(&self) -> usize {
        self.lock_history()[0].stamp
    }

    pub(crate) fn newest_value(&self) -> Value {
        self.lock_history()[0].value.clone()
    }

    /// Single attempt at the write lock. Commit aborts on contention
    /// instead of waiting, so lock order cannot form a cycle.
    pub(crate) fn try_lock_write(&self, tx_id: usize) -> Result<(), TxError> {
        self.owner
            .compare_exchange(0, tx_id, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| TxError::LockPresent)
    }

    /// Waiting variant used for commute-only publication. Commuters hold
    /// the lock only for the in-place update, so a short bounded spin
    /// serializes them without forcing anyone to retry.
    pub(crate) fn bounded_lock_write(&self, tx_id: usize) -> Result<(), TxError> {
        let bound = 1000;
        for _ in 0..bound {
            if self.try_lock_write(tx_id).is_ok() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(1));
            std::hint::spin_loop();
        }
        Err(TxError::LockPresent)
    }

    pub(crate) fn unlock_write(&self, tx_id: usize) {
        let _ = self
            .owner
            .compare_exchange(tx_id, 0, Ordering::AcqRel, Ordering::Acquire);
    }

    pub(crate) fn locked_by_other(&self, tx_id: usize) -> bool {
        let owner = self.owner.load(Ordering::Acquire);
        owner != 0 && owner != tx_id
    }

    /// Prepends a committed entry, then prunes everything older than the
    /// newest entry still visible at `floor`, the oldest live read stamp.
    pub(crate) fn publish(&self, stamp: usize, value: Value, floor: usize) {
        let mut history = self.lock_history();
        assert!(
            history[0].stamp < stamp,
            "history stamps out of order on publish"
        );
        history.insert(0, Entry { stamp, value });

        if let Some(idx) = history.iter().position(|entry| entry.stamp <= floor) {
            history.truncate(idx + 1);
        }
    }

    /// Applies queued commute functions against the live head under the
    /// write lock and publishes the result.
    pub(crate) fn publish_commuted(
        &self,
        stamp: usize,
        fns: &[crate::transaction::CommuteFn],
        floor: usize,
    ) {
        let base = self.newest_value();
        let value = fns.iter().fold(base, |value, apply| apply(&value));
        self.publish(stamp, value, floor);
    }

    pub(crate) fn attach_watcher(&self, watcher: &Arc<Watcher>) {
        let mut watchers = self.watchers.lock().expect("watcher list poisoned");
        let present = watchers
            .iter()
            .any(|weak| weak.upgrade().map_or(false, |w| Arc::ptr_eq(&w, watcher)));
        if !present {
            watchers.push(Arc::downgrade(watcher));
        }
    }

    pub(crate) fn detach_watcher(&self, watcher: &Arc<Watcher>) {
        let mut watchers = self.watchers.lock().expect("watcher list poisoned");
        watchers.retain(|weak| weak.upgrade().map_or(false, |w| !Arc::ptr_eq(&w, watcher)));
    }

    /// Live watchers registered on this variable; dead weak refs are
    /// pruned on the way.
    pub(crate) fn watchers(&self) -> Vec<Arc<Watcher>> {
        let mut watchers = self.watchers.lock().expect("watcher list poisoned");
        watchers.retain(|weak| weak.upgrade().is_some());
        watchers.iter().filter_map(Weak::upgrade).collect()
    }

    #[cfg(test)]
    pub(crate) fn history_len(&self) -> usize {
        self.lock_history().len()
    }
}

pub(crate) fn addr(inner: &Arc<TVarInner>) -> usize {
    Arc::as_ptr(inner) as *const () as usize
}

pub(crate) fn downcast<T>(value: &Value) -> T
where
    T: Clone + 'static,
{
    value
        .downcast_ref::<T>()
        .expect("shared value casted as the wrong type")
        .clone()
}

/// A transactional variable holding values of type `T`.
///
/// Cloning shares the same underlying variable; equality and hashing follow
/// the allocation address, never the content.
pub struct TVar<T> {
    pub(crate) inner: Arc<TVarInner>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TVar<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(value: T) -> Self {
        Self {
            inner: TVarInner::new(Arc::new(value)),
            _marker: PhantomData,
        }
    }

    /// Reads the variable inside the current transaction.
    ///
    /// Tentative writes of the same transaction are visible. Pending
    /// commutes on this variable are materialized first, which degrades
    /// them to ordinary read-modify-writes.
    pub fn read(&self) -> Result<T, TxError> {
        stm::with_current(|tx| tx.load(&self.inner)).map(|value| downcast(&value))
    }

    /// Stores a tentative value in the current transaction. A previously
    /// read variable is promoted to the write set.
    pub fn write(&self, value: T) -> Result<(), TxError> {
        stm::with_current(|tx| {
            tx.store(&self.inner, Arc::new(value));
            Ok(())
        })
    }

    /// Read-modify-write. Conflicts on commit with every other writer of
    /// this variable.
    pub fn modify<F>(&self, f: F) -> Result<(), TxError>
    where
        F: FnOnce(&mut T),
    {
        let mut value = self.read()?;
        f(&mut value);
        self.write(value)
    }

    /// Queues a commutative update, applied against the live value at
    /// commit time. Concurrent commuters of the same variable do not
    /// force each other to retry.
    ///
    /// The function must depend on nothing transactional besides the value
    /// it is given; it runs outside any transaction context, so reading
    /// another `TVar` from inside it fails with [`TxError::NoTransaction`].
    pub fn commute<F>(&self, f: F) -> Result<(), TxError>
    where
        F: Fn(&mut T) + Send + 'static,
    {
        let apply = move |value: &Value| -> Value {
            let mut inner: T = downcast(value);
            f(&mut inner);
            Arc::new(inner) as Value
        };
        stm::with_current(|tx| {
            tx.queue_commute(&self.inner, Box::new(apply));
            Ok(())
        })
    }

    /// Unsynchronized snapshot of the newest committed value, readable
    /// outside a transaction. Does not register a read.
    pub fn read_atomic(&self) -> T {
        downcast(&self.inner.newest_value())
    }
}

impl<T> fmt::Debug for TVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TVar").field("addr", &addr(&self.inner)).finish()
    }
}

impl<T> Clone for TVar<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> Hash for TVar<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        addr(&self.inner).hash(state);
    }
}

impl<T> PartialEq for TVar<T> {
    fn eq(&self, other: &Self) -> bool {
        addr(&self.inner) == addr(&other.inner)
    }
}

impl<T> Eq for TVar<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn calculate_hash<T: Hash>(t: &T) -> u64 {
        let mut s = DefaultHasher::new();
        t.hash(&mut s);
        s.finish()
    }

    #[test]
    fn test_tvar_clone_equality() {
        let a = TVar::new(10usize);
        let b = a.clone();

        assert_eq!(a, b);
        assert_eq!(calculate_hash(&a), calculate_hash(&b));

        let c = TVar::new(10usize);
        assert_ne!(a, c);
    }

    #[test]
    fn test_read_at_resolves_snapshot() {
        let var = TVar::new(0usize);
        var.inner.publish(3, Arc::new(1usize), 0);
        var.inner.publish(7, Arc::new(2usize), 0);

        assert_eq!(downcast::<usize>(&var.inner.read_at(0).unwrap()), 0);
        assert_eq!(downcast::<usize>(&var.inner.read_at(5).unwrap()), 1);
        assert_eq!(downcast::<usize>(&var.inner.read_at(usize::MAX).unwrap()), 2);
    }

    #[test]
    fn test_write_lock_is_exclusive() {
        let var = TVar::new(0usize);
        assert!(var.inner.try_lock_write(1).is_ok());
        assert_eq!(var.inner.try_lock_write(2), Err(TxError::LockPresent));
        assert!(var.inner.locked_by_other(2));
        assert!(!var.inner.locked_by_other(1));
        var.inner.unlock_write(1);
        assert!(var.inner.try_lock_write(2).is_ok());
        var.inner.unlock_write(2);
    }

    #[test]
    fn test_history_is_pruned_to_live_floor() {
        let var = TVar::new(0usize);

        // a snapshot pinned at 5 keeps the initial entry alive
        var.inner.publish(10, Arc::new(10usize), 5);
        var.inner.publish(20, Arc::new(20usize), 5);
        assert_eq!(var.inner.history_len(), 3);
        assert_eq!(downcast::<usize>(&var.inner.read_at(5).unwrap()), 0);

        // once the floor catches up only the head remains
        var.inner.publish(30, Arc::new(30usize), 30);
        assert_eq!(var.inner.history_len(), 1);
        assert_eq!(downcast::<usize>(&var.inner.read_at(30).unwrap()), 30);
    }
}
