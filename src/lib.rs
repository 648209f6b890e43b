// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Stronghold Multi-Versioned Software Transactional Memory
//!
//! Shared in-memory state is held in transactional variables ([`TVar`])
//! and accessed through atomic, isolated, optimistically concurrent
//! transactions. A transaction observes one consistent snapshot of every
//! variable it touches and either commits all of its writes at a single
//! commit stamp or aborts without a visible trace.
//!
//! Variables keep a short multi-versioned history of committed values, so
//! readers never block writers: a running transaction keeps resolving the
//! snapshot it started from while committers publish newer versions next
//! to it. Conflicts are detected at commit time; the losing transaction is
//! rolled back and transparently re-executed.
//!
//! Commutative updates ([`TVar::commute`]) are applied against the live
//! value at commit time and do not conflict with one another, and
//! [`conditional`] registers a predicate that re-evaluates whenever one of
//! the variables it reads changes, firing a reactor transaction once it
//! holds. Actions with effects outside transactional state belong in
//! [`side_effect`], deferred until the outcome of the transaction is
//! known.
//!
//! ```
//! use stronghold_mvstm::{atomically, TVar};
//!
//! let balance: TVar<usize> = TVar::new(10);
//!
//! let var = balance.clone();
//! atomically(move || {
//!     let value = var.read()?;
//!     var.write(value + 32)?;
//!     Ok(())
//! })
//! .expect("transaction failed");
//!
//! assert_eq!(balance.read_atomic(), 42);
//! ```

mod clock;
mod error;
mod stm;
mod transaction;
mod tvar;
mod watch;

pub use clock::read_stamp;
pub use error::TxError;
pub use stm::{atomically, is_in_transaction, on_commit, on_rollback, side_effect};
pub use tvar::TVar;
pub use watch::conditional;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_transaction() {
        let var: TVar<usize> = TVar::new(0);

        let var_clone = var.clone();
        let result = atomically(move || {
            let mut inner = var_clone.read()?;
            inner += 10;
            var_clone.write(inner)?;
            Ok(inner)
        });

        assert_eq!(result, Ok(10));
        assert_eq!(var.read_atomic(), 10);
    }

    #[test]
    fn test_outside_transaction_fails() {
        let var: TVar<usize> = TVar::new(0);

        assert_eq!(var.read(), Err(TxError::NoTransaction));
        assert_eq!(var.write(1), Err(TxError::NoTransaction));
        assert_eq!(var.modify(|v| *v += 1), Err(TxError::NoTransaction));
        assert_eq!(var.commute(|v| *v += 1), Err(TxError::NoTransaction));

        // the unsynchronized snapshot stays available
        assert_eq!(var.read_atomic(), 0);
        assert!(!is_in_transaction());
    }

    #[test]
    fn test_read_your_own_writes() {
        let var: TVar<usize> = TVar::new(1);

        let var_clone = var.clone();
        let observed = atomically(move || {
            var_clone.write(7)?;
            var_clone.read()
        });

        assert_eq!(observed, Ok(7));
    }

    #[test]
    fn test_user_error_aborts_without_trace() {
        let var: TVar<usize> = TVar::new(3);

        let var_clone = var.clone();
        let result: Result<(), TxError> = atomically(move || {
            var_clone.write(99)?;
            Err(TxError::Aborted("user gave up".into()))
        });

        assert_eq!(result, Err(TxError::Aborted("user gave up".into())));
        assert_eq!(var.read_atomic(), 3);
    }
}
