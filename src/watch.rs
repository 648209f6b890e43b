// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Conditional watchers.
//!
//! A watcher couples a transactional predicate with a reactor. The
//! predicate's read set becomes the watcher's dependency set; whenever a
//! committed transaction writes one of those variables the watcher is
//! re-evaluated in a fresh transaction, and the reactor fires in the same
//! transaction once the predicate holds. A reactor returning `false`
//! retires the watcher.

use crate::{
    error::TxError,
    stm::{self, atomically},
    tvar::TVarInner,
};
use lazy_static::lazy_static;
use log::*;
use std::{
    cell::RefCell,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

type Predicate = Box<dyn Fn() -> Result<bool, TxError> + Send + Sync>;
type Reactor = Box<dyn Fn() -> Result<bool, TxError> + Send + Sync>;

lazy_static! {
    /// Keeps registered watchers alive; variables only hold weak refs.
    static ref REGISTRY: Mutex<Vec<Arc<Watcher>>> = Mutex::new(Vec::new());
}

pub(crate) struct Watcher {
    predicate: Predicate,
    reactor: Reactor,

    /// Variables the last predicate evaluation touched.
    deps: Mutex<Vec<Arc<TVarInner>>>,

    active: AtomicBool,

    /// Trigger bookkeeping: `pending` counts commits that demanded a
    /// look, `done` the demand level the last evaluation covered. One
    /// thread drains at a time; everyone else piggybacks on it.
    gate: Mutex<()>,
    pending: AtomicUsize,
    done: AtomicUsize,
}

impl Watcher {
    fn new(predicate: Predicate, reactor: Reactor) -> Self {
        Self {
            predicate,
            reactor,
            deps: Mutex::new(Vec::new()),
            active: AtomicBool::new(true),
            gate: Mutex::new(()),
            pending: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
        }
    }

    /// Moves the registration from the previous dependency set to the
    /// one the latest evaluation produced.
    fn rewire(self: &Arc<Self>, new_deps: Vec<Arc<TVarInner>>) {
        let mut deps = self.deps.lock().expect("watcher deps poisoned");
        for old in deps.iter() {
            if !new_deps.iter().any(|new| Arc::ptr_eq(new, old)) {
                old.detach_watcher(self);
            }
        }
        for new in new_deps.iter() {
            new.attach_watcher(self);
        }
        *deps = new_deps;
    }
}

/// Registers a watcher over `predicate` and `reactor`.
///
/// The predicate is evaluated right away in a fresh transaction (or, when
/// called inside one, right after that transaction commits) and from then
/// on after every commit that touches one of its dependencies. Both
/// closures run transactionally; an error or panic in either retires the
/// watcher with a log entry and never disturbs the committing transaction.
pub fn conditional<P, R>(predicate: P, reactor: R)
where
    P: Fn() -> Result<bool, TxError> + Send + Sync + 'static,
    R: Fn() -> Result<bool, TxError> + Send + Sync + 'static,
{
    let watcher = Arc::new(Watcher::new(Box::new(predicate), Box::new(reactor)));
    let deferred = watcher.clone();
    if stm::on_commit(move || register(&deferred)).is_err() {
        register(&watcher);
    }
}

fn register(watcher: &Arc<Watcher>) {
    REGISTRY
        .lock()
        .expect("watcher registry poisoned")
        .push(watcher.clone());
    schedule(watcher);
}

fn deregister(watcher: &Arc<Watcher>) {
    watcher.active.store(false, Ordering::Release);
    let deps = std::mem::take(&mut *watcher.deps.lock().expect("watcher deps poisoned"));
    for var in deps {
        var.detach_watcher(watcher);
    }
    REGISTRY
        .lock()
        .expect("watcher registry poisoned")
        .retain(|registered| !Arc::ptr_eq(registered, watcher));
}

/// Called by the driver after a successful commit with every variable
/// that received a new version.
pub(crate) fn notify(written: &[Arc<TVarInner>]) {
    let mut due: Vec<Arc<Watcher>> = Vec::new();
    for var in written {
        for watcher in var.watchers() {
            if !due.iter().any(|seen| Arc::ptr_eq(seen, &watcher)) {
                due.push(watcher);
            }
        }
    }
    for watcher in due {
        schedule(&watcher);
    }
}

fn schedule(watcher: &Arc<Watcher>) {
    watcher.pending.fetch_add(1, Ordering::SeqCst);
    drain(watcher);
}

/// Runs evaluations until the demand recorded in `pending` is covered.
/// A busy gate means another thread (or this one, reentrantly through a
/// reactor commit) is draining already and will pick the demand up;
/// commits coalesce into one evaluation that way.
fn drain(watcher: &Arc<Watcher>) {
    loop {
        if !watcher.active.load(Ordering::Acquire) {
            return;
        }
        let gate = match watcher.gate.try_lock() {
            Ok(gate) => gate,
            Err(_) => return,
        };
        let target = watcher.pending.load(Ordering::SeqCst);
        if watcher.done.load(Ordering::SeqCst) >= target {
            return;
        }
        evaluate(watcher);
        watcher.done.store(target, Ordering::SeqCst);
        drop(gate);
    }
}

fn evaluate(watcher: &Arc<Watcher>) {
    match catch_unwind(AssertUnwindSafe(|| run_once(watcher))) {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            warn!("watcher failed ({}), deregistering", error);
            deregister(watcher);
        }
        Err(_) => {
            warn!("watcher panicked, deregistering");
            deregister(watcher);
        }
    }
}

fn run_once(watcher: &Arc<Watcher>) -> Result<(), TxError> {
    let deps: RefCell<Vec<Arc<TVarInner>>> = RefCell::new(Vec::new());
    let keep = atomically(|| {
        let hit = (watcher.predicate)()?;
        *deps.borrow_mut() = stm::with_current(|tx| Ok(tx.footprint()))?;
        if hit {
            (watcher.reactor)()
        } else {
            Ok(true)
        }
    })?;

    watcher.rewire(deps.into_inner());
    if !keep {
        deregister(watcher);
    }
    Ok(())
}
