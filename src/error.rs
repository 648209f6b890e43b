// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::error::Error;

use thiserror::Error as DeriveError;

#[derive(Debug, DeriveError, PartialEq, Eq)]
pub enum TxError {
    #[error("no transaction is active on this thread")]
    NoTransaction,

    #[error("transactional variable is locked")]
    LockPresent,

    #[error("transactional variable has wrong version")]
    VersionMismatch,

    #[error("transaction aborted ({0})")]
    Aborted(String),

    #[error("inner error occured ({0})")]
    Inner(String),
}

impl TxError {
    pub fn to_inner<E>(error: E) -> Self
    where
        E: Error + ToString,
    {
        TxError::Inner(error.to_string())
    }

    /// Errors raised by the commit protocol itself. These never escape
    /// [`crate::atomically`]; the driver rolls back and starts a new attempt.
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(self, TxError::LockPresent | TxError::VersionMismatch)
    }
}
