//! Read-write transactions with automatic retry.
//!
//! A transaction function is run against a [`Transaction`] and its buffered
//! mutations are committed when it returns. When the server aborts the attempt
//! the function runs again from scratch, on the same session, after a backoff.
//! Only the outcome of the last attempt is reported.
//!
//! The first read, query or DML statement of an attempt begins the transaction
//! inline. Concurrent first statements are serialized so that exactly one of
//! them carries the begin. If that statement fails before the server returns a
//! transaction id, the attempt falls back to an explicit `BeginTransaction`.
mod attempt;
mod runner;

use std::time::Duration;

use crate::{
    backoff::Backoff,
    protocol::{IsolationLevel, ReadLockMode},
};

pub use attempt::Transaction;
pub(crate) use runner::TransactionRunner;

/// Per-transaction settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionOptions {
    pub read_lock_mode: ReadLockMode,
    pub isolation_level: IsolationLevel,
    pub exclude_txn_from_change_streams: bool,
    pub transaction_tag: Option<String>,
    pub return_commit_stats: bool,
    pub max_commit_delay: Option<Duration>,
    /// Budget for all attempts together.
    pub timeout: Duration,
    /// Pacing between aborted attempts when the server sends no retry hint.
    pub backoff: Backoff,
}

impl TransactionOptions {
    pub fn with_read_lock_mode(mut self, mode: ReadLockMode) -> Self {
        self.read_lock_mode = mode;
        self
    }

    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    pub fn exclude_from_change_streams(mut self) -> Self {
        self.exclude_txn_from_change_streams = true;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.transaction_tag = Some(tag.into());
        self
    }

    pub fn with_commit_stats(mut self) -> Self {
        self.return_commit_stats = true;
        self
    }

    pub fn with_max_commit_delay(mut self, delay: Duration) -> Self {
        self.max_commit_delay = Some(delay);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            read_lock_mode: ReadLockMode::Unspecified,
            isolation_level: IsolationLevel::Unspecified,
            exclude_txn_from_change_streams: false,
            transaction_tag: None,
            return_commit_stats: false,
            max_commit_delay: None,
            timeout: Duration::from_secs(60 * 60),
            backoff: Backoff::default(),
        }
    }
}
