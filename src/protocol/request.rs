use std::time::Duration;

use crate::{
    mutation::{KeySet, Mutation},
    session::SessionName,
    statement::Statement,
};

use super::response::PrecommitToken;

/// Opaque server-assigned transaction identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId(pub Vec<u8>);

impl From<&str> for TransactionId {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadLockMode {
    #[default]
    Unspecified,
    Pessimistic,
    Optimistic,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IsolationLevel {
    #[default]
    Unspecified,
    Serializable,
    RepeatableRead,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionMode {
    ReadWrite {
        read_lock_mode: ReadLockMode,
        /// Id of the aborted attempt this one replaces, for lock ordering on
        /// multiplexed sessions.
        previous_transaction_id: Option<TransactionId>,
    },
    ReadOnly {
        strong: bool,
        return_read_timestamp: bool,
    },
    PartitionedDml,
}

/// Options sent when a transaction begins, inline or explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeginOptions {
    pub mode: TransactionMode,
    pub isolation_level: IsolationLevel,
    pub exclude_txn_from_change_streams: bool,
}

impl BeginOptions {
    pub fn read_only() -> Self {
        Self {
            mode: TransactionMode::ReadOnly {
                strong: true,
                return_read_timestamp: false,
            },
            isolation_level: IsolationLevel::Unspecified,
            exclude_txn_from_change_streams: false,
        }
    }

    pub fn partitioned_dml() -> Self {
        Self {
            mode: TransactionMode::PartitionedDml,
            isolation_level: IsolationLevel::Unspecified,
            exclude_txn_from_change_streams: false,
        }
    }
}

/// How a read, query or DML statement attaches to a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionSelector {
    /// Strong single-use read-only transaction.
    SingleUse(BeginOptions),
    /// Begin a transaction inline and return its id with the first response.
    Begin(BeginOptions),
    Id(TransactionId),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    pub transaction_tag: Option<String>,
    pub request_tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchCreateSessionsRequest {
    pub session_count: usize,
    pub database_role: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateSessionRequest {
    pub multiplexed: bool,
    pub database_role: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BeginTransactionRequest {
    pub session: SessionName,
    pub options: BeginOptions,
    pub request_options: RequestOptions,
    /// Routing hint for mutation-only transactions on multiplexed sessions.
    pub mutation_key: Option<Mutation>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteSqlRequest {
    pub session: SessionName,
    pub transaction: TransactionSelector,
    pub statement: Statement,
    pub resume_token: Option<Vec<u8>>,
    /// Orders DML within a transaction; replays with the same seqno are idempotent.
    pub seqno: Option<i64>,
    pub request_options: RequestOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadRequest {
    pub session: SessionName,
    pub transaction: TransactionSelector,
    pub table: String,
    pub index: Option<String>,
    pub columns: Vec<String>,
    pub key_set: KeySet,
    pub limit: Option<u64>,
    pub resume_token: Option<Vec<u8>>,
    pub request_options: RequestOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteBatchDmlRequest {
    pub session: SessionName,
    pub transaction: TransactionSelector,
    pub statements: Vec<Statement>,
    pub seqno: i64,
    pub request_options: RequestOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitRequest {
    pub session: SessionName,
    pub transaction_id: TransactionId,
    pub mutations: Vec<Mutation>,
    pub precommit_token: Option<PrecommitToken>,
    pub return_commit_stats: bool,
    pub max_commit_delay: Option<Duration>,
    pub request_options: RequestOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RollbackRequest {
    pub session: SessionName,
    pub transaction_id: TransactionId,
}

/// Mutations applied atomically together within a non-atomic batch write.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationGroup(pub Vec<Mutation>);

#[derive(Debug, Clone, PartialEq)]
pub struct BatchWriteRequest {
    pub session: SessionName,
    pub mutation_groups: Vec<MutationGroup>,
    pub exclude_txn_from_change_streams: bool,
    pub request_options: RequestOptions,
}
