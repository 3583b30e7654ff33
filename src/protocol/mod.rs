//! Remote procedure boundary.
//!
//! This module defines the calls the runtime makes against the database service
//! and the messages exchanged through them. The transport itself (channels,
//! authentication, TLS, framing) lives behind the [`Rpc`] trait and is supplied by
//! the embedding application.
//!
//! # Overview
//!
//! The runtime only ever needs a handful of calls:
//!
//! - session lifecycle: `BatchCreateSessions`, `CreateSession`, `DeleteSession`;
//! - transaction lifecycle: `BeginTransaction`, `Commit`, `Rollback`;
//! - data access: `ExecuteStreamingSql`, `StreamingRead`, `ExecuteBatchDml`,
//!   `BatchWrite`.
//!
//! Streaming calls return a [`ResultStream`]: an iterator of
//! [`PartialResultSet`] messages that is only advanced when the consumer asks for
//! more rows, which is how flow control reaches the transport.
//!
//! # Request identity
//!
//! Every call receives a [`CallContext`] carrying the [`RequestId`] that the
//! transport must send in the [`REQUEST_ID_HEADER`](crate::request_id::REQUEST_ID_HEADER)
//! metadata entry, and the deadline of the logical operation it belongs to.
//!
//! # See Also
//!
//! - [`stream`](crate::stream): turns a [`ResultStream`] into rows.
//! - [`session`](crate::session): owns the session names every call is made on.
mod request;
mod response;

use std::time::Instant;

use crate::{error::Status, request_id::RequestId, session::SessionName};

pub use request::{
    BatchCreateSessionsRequest, BatchWriteRequest, BeginOptions, BeginTransactionRequest,
    CommitRequest, CreateSessionRequest, ExecuteBatchDmlRequest, ExecuteSqlRequest,
    IsolationLevel, MutationGroup, ReadLockMode, ReadRequest, RequestOptions, RollbackRequest,
    TransactionId, TransactionMode, TransactionSelector,
};
pub use response::{
    BatchDmlResult, BatchWriteResponse, CommitResponse, CommitStats, ExecuteBatchDmlResponse,
    PartialResultSet, PrecommitToken, ResultSetMetadata, ResultSetStats, SessionInfo,
    TransactionMeta,
};

/// Messages of one streaming call, pulled on demand.
pub type ResultStream = Box<dyn Iterator<Item = Result<PartialResultSet, Status>> + Send>;

/// Per-call metadata.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub request_id: RequestId,
    pub deadline: Option<Instant>,
}

impl CallContext {
    pub fn new(request_id: RequestId, deadline: Option<Instant>) -> Self {
        Self {
            request_id,
            deadline,
        }
    }

    /// The same call, re-sent.
    pub fn retry(&self) -> Self {
        Self {
            request_id: self.request_id.next_attempt(),
            deadline: self.deadline,
        }
    }

    /// Context for the next send of a streaming call: a new call the first
    /// time, then the previous one re-sent. Remembers what it returns.
    pub(crate) fn reopen(last: &mut Option<CallContext>, first: impl FnOnce() -> Self) -> Self {
        let call = match last.as_ref() {
            Some(previous) => previous.retry(),
            None => first(),
        };
        *last = Some(call.clone());
        call
    }
}

/// The database service as seen by the client runtime.
pub trait Rpc: Send + Sync {
    fn batch_create_sessions(
        &self,
        call: &CallContext,
        request: BatchCreateSessionsRequest,
    ) -> Result<Vec<SessionInfo>, Status>;

    fn create_session(
        &self,
        call: &CallContext,
        request: CreateSessionRequest,
    ) -> Result<SessionInfo, Status>;

    fn delete_session(&self, call: &CallContext, session: &SessionName) -> Result<(), Status>;

    fn begin_transaction(
        &self,
        call: &CallContext,
        request: BeginTransactionRequest,
    ) -> Result<TransactionMeta, Status>;

    fn execute_streaming_sql(
        &self,
        call: &CallContext,
        request: ExecuteSqlRequest,
    ) -> Result<ResultStream, Status>;

    fn streaming_read(
        &self,
        call: &CallContext,
        request: ReadRequest,
    ) -> Result<ResultStream, Status>;

    fn execute_batch_dml(
        &self,
        call: &CallContext,
        request: ExecuteBatchDmlRequest,
    ) -> Result<ExecuteBatchDmlResponse, Status>;

    fn commit(&self, call: &CallContext, request: CommitRequest) -> Result<CommitResponse, Status>;

    fn rollback(&self, call: &CallContext, request: RollbackRequest) -> Result<(), Status>;

    fn batch_write(
        &self,
        call: &CallContext,
        request: BatchWriteRequest,
    ) -> Result<Vec<BatchWriteResponse>, Status>;
}

/// Attaches `id` to failures the server reports after the stream opened.
pub(crate) fn tag_failures(stream: ResultStream, id: RequestId) -> ResultStream {
    Box::new(stream.map(move |item| item.map_err(|status| status.with_request_id(&id))))
}
