// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The transaction driver.
//!
//! [`atomically`] runs a block of speculative code against a fresh
//! per-thread context and commits it, retrying from scratch whenever the
//! commit protocol reports a stale read or a busy lock. User errors are
//! never retried: the attempt rolls back and the error surfaces.

use crate::{
    clock,
    error::TxError,
    transaction::Transaction,
    watch,
};
use log::*;
use std::{cell::RefCell, time::Duration};

thread_local! {
    static CURRENT: RefCell<Option<Transaction>> = RefCell::new(None);
}

/// Runs `f` against the transaction bound to this thread, or fails with
/// [`TxError::NoTransaction`]. Crossing a thread boundary does not carry
/// the transaction along; a spawned thread sees committed state only.
///
/// A commute function re-entering transactional reads while the context
/// is busy materializing it lands in the `Err` branch of the borrow:
/// commutes are variable-local by contract and get `NoTransaction`.
pub(crate) fn with_current<R>(
    f: impl FnOnce(&mut Transaction) -> Result<R, TxError>,
) -> Result<R, TxError> {
    CURRENT.with(|cell| match cell.try_borrow_mut() {
        Ok(mut slot) => match &mut *slot {
            Some(tx) => f(tx),
            None => Err(TxError::NoTransaction),
        },
        Err(_) => Err(TxError::NoTransaction),
    })
}

/// True while the calling thread is inside [`atomically`]. A busy
/// context (the engine is mid-operation on it) counts as inside.
pub fn is_in_transaction() -> bool {
    CURRENT.with(|cell| cell.try_borrow().map(|slot| slot.is_some()).unwrap_or(true))
}

/// Keeps the context registered for the lifetime of one attempt, so a
/// panicking block neither leaks its snapshot pin nor leaves a stale
/// context behind on the thread.
struct ContextGuard {
    read_stamp: usize,
    taken: bool,
}

impl ContextGuard {
    fn install(tx: Transaction) -> Self {
        let read_stamp = tx.read_stamp;
        clock::pin(read_stamp);
        CURRENT.with(|cell| *cell.borrow_mut() = Some(tx));
        Self {
            read_stamp,
            taken: false,
        }
    }

    fn take_tx(&mut self) -> Transaction {
        self.taken = true;
        CURRENT
            .with(|cell| cell.borrow_mut().take())
            .expect("transaction context lost")
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if !self.taken {
            CURRENT.with(|cell| {
                cell.borrow_mut().take();
            });
        }
        clock::unpin(self.read_stamp);
    }
}

/// Exponential backoff between attempts: spin with a growing number of
/// iterations first, yield the time slice once tripped.
struct Breaker {
    unit: usize,
    max: usize,
}

impl Default for Breaker {
    fn default() -> Self {
        // 7 shifts may be a sensible default
        Self { unit: 0, max: 7 }
    }
}

impl Breaker {
    fn wait(&mut self) {
        if self.unit <= self.max {
            for _ in 0..(1usize << self.unit) {
                core::hint::spin_loop();
            }
            self.unit += 1;
        } else {
            std::thread::yield_now();
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

/// Runs `block` as a transaction and returns its result once a commit
/// succeeds.
///
/// Calls nested inside a running transaction join it: the block is
/// invoked directly and its writes commit with the outer context.
///
/// The block may run many times, so it must be free of side effects
/// other than transactional ones; actions that belong to a successful
/// (or failed) outcome go through [`side_effect`].
pub fn atomically<R, F>(block: F) -> Result<R, TxError>
where
    F: Fn() -> Result<R, TxError>,
{
    if is_in_transaction() {
        return block();
    }

    let mut breaker = Breaker::default();
    loop {
        let id = clock::next_tx_id();
        let read_stamp = clock::read_stamp();
        let mut guard = ContextGuard::install(Transaction::new(read_stamp, id));
        info!("TX({}): START. GLOBAL VERSION ({})", id, read_stamp);

        let speculative = block();
        let mut tx = guard.take_tx();

        match speculative {
            Ok(value) => match tx.commit() {
                Ok(receipt) => {
                    drop(guard);
                    for effect in receipt.on_commit {
                        effect();
                    }
                    watch::notify(&receipt.written);
                    return Ok(value);
                }
                Err((error, rollbacks)) => {
                    drop(guard);
                    info!("TX({}): COMMIT FAILED ({}), RETRYING", id, error);
                    for effect in rollbacks {
                        effect();
                    }
                    debug_assert!(error.is_retryable());
                    breaker.wait();
                }
            },
            Err(error) => {
                let (error, rollbacks) = tx.abort(error);
                drop(guard);
                for effect in rollbacks {
                    effect();
                }
                if error.is_retryable() {
                    info!("TX({}): SPECULATIVE EXECUTION FAILED, RETRYING", id);
                    breaker.wait();
                    continue;
                }
                return Err(error);
            }
        }
    }
}

/// Registers a pair of deferred effects on the current transaction.
///
/// The commit effect runs after every lock is released and before
/// [`atomically`] returns; the rollback effect runs when the attempt is
/// abandoned, whether by a user error or by a failed validation. Both
/// queues are FIFO within one transaction.
pub fn side_effect<C, B>(commit: C, rollback: B) -> Result<(), TxError>
where
    C: FnOnce() + Send + 'static,
    B: FnOnce() + Send + 'static,
{
    with_current(|tx| {
        tx.push_on_commit(Box::new(commit));
        tx.push_on_rollback(Box::new(rollback));
        Ok(())
    })
}

/// Registers a commit-time effect only.
pub fn on_commit<F>(effect: F) -> Result<(), TxError>
where
    F: FnOnce() + Send + 'static,
{
    with_current(|tx| {
        tx.push_on_commit(Box::new(effect));
        Ok(())
    })
}

/// Registers a rollback-time effect only.
pub fn on_rollback<F>(effect: F) -> Result<(), TxError>
where
    F: FnOnce() + Send + 'static,
{
    with_current(|tx| {
        tx.push_on_rollback(Box::new(effect));
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tvar::TVar;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn test_read_only_commits_without_tick() {
        let var = TVar::new(7usize);

        let before = clock::read_stamp();
        for _ in 0..1000 {
            let var = var.clone();
            assert_eq!(atomically(move || var.read()), Ok(7));
        }

        // concurrently running tests commit a handful of times at most
        assert!(clock::read_stamp() - before < 1000);
    }

    #[test]
    fn test_stale_attempt_is_retried() {
        let var = TVar::new(0usize);
        let attempts = Arc::new(AtomicUsize::new(0));

        let vc = var.clone();
        let ac = attempts.clone();
        let result = atomically(move || {
            let attempt = ac.fetch_add(1, Ordering::SeqCst);
            let value = vc.read()?;
            if attempt == 0 {
                // invalidate the snapshot this attempt is based on
                let interfering = vc.clone();
                std::thread::spawn(move || {
                    let interfering = interfering.clone();
                    atomically(move || interfering.modify(|v| *v += 10))
                })
                .join()
                .expect("failed to join")
                .expect("interfering transaction failed");
            }
            vc.write(value + 1)
        });

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(var.read_atomic(), 11);
    }
}
