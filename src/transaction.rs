// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The per-thread transaction context.
//!
//! A [`Transaction`] records every variable touched during speculative
//! execution: plain reads, tentative writes, queued commutes and the
//! deferred side effects. Committing walks the classic phases of the
//! protocol: materialize commutes, lock the write set in address order,
//! validate the used set against the read stamp, tick the clock, publish,
//! release.

use crate::{
    clock,
    error::TxError,
    tvar::{addr, TVarInner, Value},
};
use log::*;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

pub(crate) type CommuteFn = Box<dyn Fn(&Value) -> Value + Send>;
pub(crate) type Effect = Box<dyn FnOnce() + Send>;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TxState {
    Active,
    Committed,
    Aborted,
}

/// Everything the driver still has to run once a commit went through:
/// the deferred commit effects and the variables whose watchers need a
/// fresh look.
pub(crate) struct CommitReceipt {
    pub(crate) on_commit: VecDeque<Effect>,
    pub(crate) written: Vec<Arc<TVarInner>>,
}

pub(crate) struct Transaction {
    pub(crate) id: usize,
    pub(crate) read_stamp: usize,

    /// Variables read but never written. Keyed by identity address.
    reads: HashMap<usize, Arc<TVarInner>>,

    /// Variables with a tentative value, keyed by identity address.
    writes: HashMap<usize, (Arc<TVarInner>, Value)>,

    /// Queued commute operations in application order.
    commutes: Vec<(Arc<TVarInner>, CommuteFn)>,

    on_commit: VecDeque<Effect>,
    on_rollback: VecDeque<Effect>,

    pub(crate) state: TxState,
}

impl Transaction {
    pub(crate) fn new(read_stamp: usize, id: usize) -> Self {
        Self {
            id,
            read_stamp,
            reads: HashMap::new(),
            writes: HashMap::new(),
            commutes: Vec::new(),
            on_commit: VecDeque::new(),
            on_rollback: VecDeque::new(),
            state: TxState::Active,
        }
    }

    /// Loads a variable. Tentative writes win over committed history;
    /// pending commutes on the variable are materialized first, so the
    /// caller observes its own queued updates.
    pub(crate) fn load(&mut self, var: &Arc<TVarInner>) -> Result<Value, TxError> {
        let key = addr(var);

        if self.commutes.iter().any(|(v, _)| addr(v) == key) {
            self.materialize(key, var)?;
        }

        if let Some((_, value)) = self.writes.get(&key) {
            return Ok(value.clone());
        }

        let value = var.read_at(self.read_stamp)?;
        self.reads.entry(key).or_insert_with(|| var.clone());
        Ok(value)
    }

    /// Stores a tentative value. A previously read variable is promoted
    /// into the write set.
    pub(crate) fn store(&mut self, var: &Arc<TVarInner>, value: Value) {
        let key = addr(var);
        self.reads.remove(&key);
        self.writes.insert(key, (var.clone(), value));
    }

    pub(crate) fn queue_commute(&mut self, var: &Arc<TVarInner>, f: CommuteFn) {
        self.commutes.push((var.clone(), f));
    }

    pub(crate) fn push_on_commit(&mut self, effect: Effect) {
        self.on_commit.push_back(effect);
    }

    pub(crate) fn push_on_rollback(&mut self, effect: Effect) {
        self.on_rollback.push_back(effect);
    }

    /// Variables this transaction has touched so far. Watcher predicates
    /// are fingerprinted with this after evaluation.
    pub(crate) fn footprint(&self) -> Vec<Arc<TVarInner>> {
        self.reads
            .values()
            .cloned()
            .chain(self.writes.values().map(|(var, _)| var.clone()))
            .collect()
    }

    pub(crate) fn is_read_only(&self) -> bool {
        self.writes.is_empty() && self.commutes.is_empty()
    }

    /// Turns the queued commutes on an already-read or already-written
    /// variable into an ordinary read-modify-write. The no-conflict
    /// property is lost for this variable: it joins the write set and is
    /// validated like any other write.
    fn materialize(&mut self, key: usize, var: &Arc<TVarInner>) -> Result<(), TxError> {
        let mut queued = Vec::new();
        let mut rest = Vec::with_capacity(self.commutes.len());
        for (v, f) in self.commutes.drain(..) {
            if addr(&v) == key {
                queued.push(f);
            } else {
                rest.push((v, f));
            }
        }
        self.commutes = rest;

        let base = match self.writes.get(&key) {
            Some((_, value)) => value.clone(),
            None => var.read_at(self.read_stamp)?,
        };
        let value = queued.iter().fold(base, |value, apply| apply(&value));
        self.store(var, value);
        Ok(())
    }

    /// Commits the transaction. On success the caller receives the
    /// receipt; on failure the rollback queue, with every lock released
    /// and the state marked aborted.
    pub(crate) fn commit(mut self) -> Result<CommitReceipt, (TxError, VecDeque<Effect>)> {
        debug_assert_eq!(self.state, TxState::Active);

        if self.is_read_only() {
            // A read-only context observed one consistent snapshot by
            // construction; nothing to validate, the clock stays put.
            self.state = TxState::Committed;
            return Ok(CommitReceipt {
                on_commit: std::mem::take(&mut self.on_commit),
                written: Vec::new(),
            });
        }

        if let Err(error) = self.materialize_tracked_commutes() {
            return Err(self.abort(error));
        }

        let commute_only = self.group_commute_only();

        let locked = match self.lock_used(&commute_only) {
            Ok(locked) => locked,
            Err(error) => return Err(self.abort(error)),
        };

        if let Err(error) = self.validate() {
            self.unlock(&locked);
            return Err(self.abort(error));
        }

        let wv = clock::tick();
        info!("TX({}): COMMIT STAMP ({})", self.id, wv);

        let floor = clock::gc_floor();
        let mut written: Vec<Arc<TVarInner>> = Vec::with_capacity(locked.len());
        for (var, value) in self.writes.values() {
            var.publish(wv, value.clone(), floor);
            written.push(var.clone());
        }
        for (var, fns) in commute_only.iter() {
            var.publish_commuted(wv, fns, floor);
            written.push(var.clone());
        }

        self.unlock(&locked);
        self.state = TxState::Committed;

        Ok(CommitReceipt {
            on_commit: std::mem::take(&mut self.on_commit),
            written,
        })
    }

    /// Abandons the attempt and hands the rollback queue to the driver.
    pub(crate) fn abort(&mut self, error: TxError) -> (TxError, VecDeque<Effect>) {
        self.state = TxState::Aborted;
        (error, std::mem::take(&mut self.on_rollback))
    }

    /// Phase A for commutes on variables that were also read or written:
    /// they degrade to plain writes before any lock is taken.
    fn materialize_tracked_commutes(&mut self) -> Result<(), TxError> {
        let tracked: Vec<(usize, Arc<TVarInner>)> = self
            .commutes
            .iter()
            .map(|(var, _)| (addr(var), var.clone()))
            .filter(|(key, _)| self.reads.contains_key(key) || self.writes.contains_key(key))
            .collect();
        for (key, var) in tracked {
            self.materialize(key, &var)?;
        }
        Ok(())
    }

    /// Remaining commutes grouped per variable, application order kept.
    fn group_commute_only(&mut self) -> Vec<(Arc<TVarInner>, Vec<CommuteFn>)> {
        let mut grouped: Vec<(Arc<TVarInner>, Vec<CommuteFn>)> = Vec::new();
        for (var, f) in self.commutes.drain(..) {
            match grouped.iter_mut().find(|(v, _)| addr(v) == addr(&var)) {
                Some((_, fns)) => fns.push(f),
                None => grouped.push((var, vec![f])),
            }
        }
        grouped
    }

    /// Phase B: take every write lock in identity-address order so two
    /// committers can never hold-and-wait in a cycle. Plain writes give
    /// up on a busy lock; commute-only variables wait, their holders
    /// only pin the lock for the in-place update.
    fn lock_used(
        &self,
        commute_only: &[(Arc<TVarInner>, Vec<CommuteFn>)],
    ) -> Result<Vec<Arc<TVarInner>>, TxError> {
        let mut order: Vec<(Arc<TVarInner>, bool)> = self
            .writes
            .values()
            .map(|(var, _)| (var.clone(), false))
            .chain(commute_only.iter().map(|(var, _)| (var.clone(), true)))
            .collect();
        order.sort_by_key(|(var, _)| addr(var));

        let mut locked: Vec<Arc<TVarInner>> = Vec::with_capacity(order.len());
        for (var, is_commute) in order {
            let result = if is_commute {
                var.bounded_lock_write(self.id)
            } else {
                var.try_lock_write(self.id)
            };
            if let Err(error) = result {
                info!("TX({}): LOCKING USED TVARS FAILED", self.id);
                self.unlock(&locked);
                return Err(error);
            }
            locked.push(var);
        }
        Ok(locked)
    }

    /// Phase C: every variable that was read or written must still be at
    /// a version this transaction could have observed, and must not be
    /// locked by anyone else. Commute-only variables are exempt; that is
    /// what makes commutes conflict-free.
    fn validate(&self) -> Result<(), TxError> {
        for var in self.reads.values() {
            self.check_var(var)?;
        }
        for (var, _) in self.writes.values() {
            self.check_var(var)?;
        }
        Ok(())
    }

    fn check_var(&self, var: &Arc<TVarInner>) -> Result<(), TxError> {
        if var.locked_by_other(self.id) {
            return Err(TxError::LockPresent);
        }
        if var.newest_stamp() > self.read_stamp {
            return Err(TxError::VersionMismatch);
        }
        Ok(())
    }

    fn unlock(&self, locked: &[Arc<TVarInner>]) {
        for var in locked {
            var.unlock_write(self.id);
        }
    }
}
