use std::time::SystemTime;

use crate::{
    error::Status,
    session::SessionName,
    value::{Field, Value},
};

use super::request::TransactionId;

/// Token a multiplexed-session transaction must present at commit.
///
/// Only the token with the highest sequence number seen by an attempt is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecommitToken {
    pub token: Vec<u8>,
    pub seq_num: i32,
}

impl PrecommitToken {
    /// Keeps whichever of `current` and `incoming` is newer.
    pub fn newest(
        current: Option<PrecommitToken>,
        incoming: Option<&PrecommitToken>,
    ) -> Option<PrecommitToken> {
        match (current, incoming) {
            (Some(current), Some(incoming)) if incoming.seq_num > current.seq_num => {
                Some(incoming.clone())
            }
            (None, Some(incoming)) => Some(incoming.clone()),
            (current, _) => current,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub name: SessionName,
    pub multiplexed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionMeta {
    pub id: TransactionId,
    pub read_timestamp: Option<SystemTime>,
    pub precommit_token: Option<PrecommitToken>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSetMetadata {
    pub row_type: Vec<Field>,
    /// Present when the request began a transaction inline.
    pub transaction: Option<TransactionMeta>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSetStats {
    pub row_count_exact: Option<i64>,
    pub row_count_lower_bound: Option<i64>,
}

/// One message of a streamed read or query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialResultSet {
    pub metadata: Option<ResultSetMetadata>,
    /// Row values, row-major; rows may span messages.
    pub values: Vec<Value>,
    /// The last value is incomplete and continues in the next message.
    pub chunked_value: bool,
    /// Position the call may be re-issued from.
    pub resume_token: Option<Vec<u8>>,
    pub stats: Option<ResultSetStats>,
    pub precommit_token: Option<PrecommitToken>,
    pub last: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchDmlResult {
    pub metadata: Option<ResultSetMetadata>,
    pub row_count: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteBatchDmlResponse {
    /// One entry per statement that succeeded, in order.
    pub result_sets: Vec<BatchDmlResult>,
    /// Failure of the first statement that did not succeed, if any.
    pub status: Option<Status>,
    pub precommit_token: Option<PrecommitToken>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitStats {
    pub mutation_count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitResponse {
    pub commit_timestamp: Option<SystemTime>,
    pub commit_stats: Option<CommitStats>,
    /// Set when the commit must be sent once more with this token.
    pub precommit_retry: Option<PrecommitToken>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchWriteResponse {
    /// Indexes of the mutation groups this response covers.
    pub indexes: Vec<usize>,
    pub status: Option<Status>,
    pub commit_timestamp: Option<SystemTime>,
}
