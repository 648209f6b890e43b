// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Global version clock and the registry of live snapshots.
//!
//! Every commit draws a fresh stamp from the clock with [`tick`]. The
//! snapshot registry tracks the read stamp of every running transaction so
//! that variable histories can be pruned down to the oldest entry any live
//! transaction could still observe.

use lazy_static::lazy_static;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

lazy_static! {
    pub(crate) static ref CLOCK: AtomicUsize = AtomicUsize::new(0);
    static ref TX_IDS: AtomicUsize = AtomicUsize::new(0);

    /// read stamp -> number of live transactions pinned to it
    static ref SNAPSHOTS: Mutex<BTreeMap<usize, usize>> = Mutex::new(BTreeMap::new());
}

/// Returns the current value of the global version clock.
pub fn read_stamp() -> usize {
    CLOCK.load(Ordering::SeqCst)
}

/// Atomically increments the clock and returns the new commit stamp.
pub(crate) fn tick() -> usize {
    CLOCK.fetch_add(1, Ordering::SeqCst) + 1
}

/// Allocates a unique transaction id. Ids start at 1; 0 marks a free
/// write lock on a variable.
pub(crate) fn next_tx_id() -> usize {
    TX_IDS.fetch_add(1, Ordering::SeqCst) + 1
}

/// Registers a live snapshot. Must be paired with [`unpin`].
pub(crate) fn pin(stamp: usize) {
    let mut snapshots = SNAPSHOTS.lock().expect("snapshot registry poisoned");
    *snapshots.entry(stamp).or_insert(0) += 1;
}

pub(crate) fn unpin(stamp: usize) {
    let mut snapshots = SNAPSHOTS.lock().expect("snapshot registry poisoned");
    if let Some(count) = snapshots.get_mut(&stamp) {
        *count -= 1;
        if *count == 0 {
            snapshots.remove(&stamp);
        }
    }
}

/// The oldest read stamp any live transaction is pinned to. History entries
/// at or below this floor are safe to prune, except the newest one among
/// them, which is still the visible value for that snapshot.
pub(crate) fn gc_floor() -> usize {
    let snapshots = SNAPSHOTS.lock().expect("snapshot registry poisoned");
    snapshots.keys().next().copied().unwrap_or_else(read_stamp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_is_monotonic() {
        let a = tick();
        let b = tick();
        assert!(b > a);
        assert!(read_stamp() >= b);
    }

    #[test]
    fn test_pin_tracks_floor() {
        // pin something far in the past; the floor must not exceed it
        pin(0);
        assert_eq!(gc_floor(), 0);
        unpin(0);
    }
}
