//! The client handle applications hold.
//!
//! A [`Database`] owns the session pool, the multiplexed session and the
//! request identity space of one client. Every public operation is a logical
//! call: it gets its own request generation and deadline, and whatever retries
//! it needs stay inside it.
use std::{
    fmt,
    panic::Location,
    sync::Arc,
    time::Instant,
};

use log::{debug, info, warn};

use crate::{
    backoff::{Backoff, RetryBudget, deadline_after},
    config::ClientConfig,
    error::{Error, ProtocolError, Result},
    mutation::{KeySet, Mutation},
    protocol::{
        self, BatchWriteRequest, BatchWriteResponse, BeginOptions, BeginTransactionRequest,
        CallContext, CommitResponse, ExecuteSqlRequest, MutationGroup, ReadRequest,
        RequestOptions, ResultStream, Rpc, TransactionId, TransactionSelector,
    },
    request_id::{ClientContext, RequestIdGenerator, RequestScope},
    session::{
        MultiplexedSession, OperationKind, PoolStatus, SessionFactory, SessionHandle,
        SessionName, SessionPool,
    },
    statement::Statement,
    stream::{RowStream, StreamSource},
    transaction::{Transaction, TransactionOptions, TransactionRunner},
};

/// What a streaming call outside a read-write transaction asks for.
enum Request {
    Query(Statement),
    Read {
        table: String,
        columns: Vec<String>,
        key_set: KeySet,
    },
}

impl Request {
    fn send(
        &self,
        rpc: &dyn Rpc,
        call: &CallContext,
        session: &SessionName,
        transaction: TransactionSelector,
        resume_token: Option<&[u8]>,
    ) -> Result<ResultStream> {
        let opened = match self {
            Request::Query(statement) => rpc.execute_streaming_sql(
                call,
                ExecuteSqlRequest {
                    session: session.clone(),
                    transaction,
                    statement: statement.clone(),
                    resume_token: resume_token.map(<[u8]>::to_vec),
                    seqno: None,
                    request_options: RequestOptions::default(),
                },
            ),
            Request::Read {
                table,
                columns,
                key_set,
            } => rpc.streaming_read(
                call,
                ReadRequest {
                    session: session.clone(),
                    transaction,
                    table: table.clone(),
                    index: None,
                    columns: columns.clone(),
                    key_set: key_set.clone(),
                    limit: None,
                    resume_token: resume_token.map(<[u8]>::to_vec),
                    request_options: RequestOptions::default(),
                },
            ),
        };
        match opened {
            Ok(stream) => Ok(protocol::tag_failures(stream, call.request_id.clone())),
            Err(status) => Err(status.with_request_id(&call.request_id).into()),
        }
    }
}

/// A strong single-use read or query. Holds its session until the stream is
/// dropped or exhausted.
struct SingleUseSource {
    rpc: Arc<dyn Rpc>,
    factory: SessionFactory,
    scope: RequestScope,
    /// Empty only after a failed replacement, which ends the stream.
    session: Option<SessionHandle>,
    request: Request,
    deadline: Instant,
    /// Last send, re-sent with the next attempt number on resume.
    call: Option<CallContext>,
    /// Where the application asked for the rows; replacement sessions are
    /// held on its behalf.
    caller: &'static Location<'static>,
}

impl StreamSource for SingleUseSource {
    fn open(&mut self, resume_token: Option<&[u8]>) -> Result<ResultStream> {
        let session = self.session.as_ref().ok_or(Error::PoolClosed)?;
        let call = CallContext::reopen(&mut self.call, || {
            CallContext::new(self.scope.next_rpc(), Some(self.deadline))
        });
        self.request.send(
            self.rpc.as_ref(),
            &call,
            session.name(),
            TransactionSelector::SingleUse(BeginOptions::read_only()),
            resume_token,
        )
    }

    fn replace_session(&mut self) -> Result<bool> {
        // The stale session goes back first so that a full pool has room.
        if let Some(mut stale) = self.session.take() {
            warn!("{} was not found; moving the read to a new session", stale.name());
            stale.mark_invalid();
        }
        self.session = Some(self.factory.session_for(
            OperationKind::Read,
            Some(self.deadline),
            self.caller,
        )?);
        Ok(true)
    }
}

/// The streaming half of a partitioned update.
struct PartitionedSource {
    rpc: Arc<dyn Rpc>,
    scope: Arc<RequestScope>,
    session: SessionName,
    transaction_id: TransactionId,
    statement: Request,
    deadline: Instant,
    call: Option<CallContext>,
}

impl StreamSource for PartitionedSource {
    fn open(&mut self, resume_token: Option<&[u8]>) -> Result<ResultStream> {
        let call = CallContext::reopen(&mut self.call, || {
            CallContext::new(self.scope.next_rpc(), Some(self.deadline))
        });
        self.statement.send(
            self.rpc.as_ref(),
            &call,
            &self.session,
            TransactionSelector::Id(self.transaction_id.clone()),
            resume_token,
        )
    }
}

/// A client of one database.
pub struct Database {
    rpc: Arc<dyn Rpc>,
    config: ClientConfig,
    ids: Arc<RequestIdGenerator>,
    factory: SessionFactory,
}

impl Database {
    /// Opens a client and fills its session pool to the configured minimum.
    pub fn open(rpc: Arc<dyn Rpc>, config: ClientConfig, context: &ClientContext) -> Result<Self> {
        config.validate()?;
        let ids = Arc::new(context.new_client(config.channel_id));
        let pool = SessionPool::open(Arc::clone(&rpc), Arc::clone(&ids), config.pool.clone())?;
        let multiplexed = MultiplexedSession::new(
            Arc::clone(&rpc),
            Arc::clone(&ids),
            config.pool.database_role.clone(),
        );
        let factory = SessionFactory::new(pool, multiplexed, config.multiplexed.clone());
        info!(
            "client {} opened on channel {}",
            ids.client_id(),
            config.channel_id
        );
        Ok(Self {
            rpc,
            config,
            ids,
            factory,
        })
    }

    pub fn client_id(&self) -> u32 {
        self.ids.client_id()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Runs a query in a strong single-use read-only transaction.
    #[track_caller]
    pub fn execute_query(&self, statement: impl Into<Statement>) -> Result<RowStream> {
        self.single_use(Request::Query(statement.into()))
    }

    /// Reads rows by key in a strong single-use read-only transaction.
    #[track_caller]
    pub fn read(&self, table: &str, key_set: KeySet, columns: &[&str]) -> Result<RowStream> {
        self.single_use(Request::Read {
            table: table.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            key_set,
        })
    }

    #[track_caller]
    fn single_use(&self, request: Request) -> Result<RowStream> {
        let caller = Location::caller();
        let deadline = deadline_after(self.config.query_timeout());
        let session = self
            .factory
            .session_for(OperationKind::Read, Some(deadline), caller)?;
        let source = SingleUseSource {
            rpc: Arc::clone(&self.rpc),
            factory: self.factory.clone(),
            scope: self.ids.next_request(),
            session: Some(session),
            request,
            deadline,
            call: None,
            caller,
        };
        Ok(RowStream::new(Box::new(source), Some(deadline)))
    }

    /// Runs `work` in a read-write transaction and commits it, re-running it
    /// for as long as the server aborts it and the timeout allows.
    ///
    /// `work` may run several times; side effects outside the transaction
    /// should be idempotent.
    #[track_caller]
    pub fn run_transaction<T, F>(&self, work: F) -> Result<(T, CommitResponse)>
    where
        F: FnMut(&Transaction) -> Result<T>,
    {
        self.run_transaction_with_options(TransactionOptions::default(), work)
    }

    #[track_caller]
    pub fn run_transaction_with_options<T, F>(
        &self,
        options: TransactionOptions,
        work: F,
    ) -> Result<(T, CommitResponse)>
    where
        F: FnMut(&Transaction) -> Result<T>,
    {
        TransactionRunner {
            rpc: &self.rpc,
            ids: &self.ids,
            factory: &self.factory,
            options,
        }
        .run(work)
    }

    /// Applies mutations atomically. They are replayed unchanged if the
    /// transaction has to be retried.
    #[track_caller]
    pub fn write(&self, mutations: impl IntoIterator<Item = Mutation>) -> Result<CommitResponse> {
        let mutations = mutations.into_iter().collect::<Vec<_>>();
        let (_, response) = self.run_transaction(|txn| {
            txn.buffer(mutations.iter().cloned());
            Ok(())
        })?;
        Ok(response)
    }

    /// Runs a DML statement as partitioned DML and returns the lower bound of
    /// the rows it modified.
    ///
    /// An interrupted update restarts with a new transaction; the statement
    /// must be idempotent.
    #[track_caller]
    pub fn run_partitioned_update(&self, statement: impl Into<Statement>) -> Result<i64> {
        let statement = statement.into();
        let deadline = deadline_after(self.config.query_timeout());
        let scope = Arc::new(self.ids.next_request());
        let mut retry = RetryBudget::new(Backoff::default(), Some(deadline));
        let mut session = self
            .factory
            .session(OperationKind::Partitioned, Some(deadline))?;

        loop {
            let err = match self.partitioned_attempt(&scope, &session, &statement, deadline) {
                Ok(count) => return Ok(count),
                Err(err) => err,
            };

            if err.is_aborted() || err.is_transient() {
                debug!("partitioned update interrupted: {err}");
                retry.pause(err)?;
                continue;
            }
            if err.is_session_not_found() {
                if Instant::now() >= deadline {
                    return Err(Error::DeadlineExceeded {
                        attempts: retry.retries() + 1,
                        last: Some(Box::new(err)),
                    });
                }
                warn!("{} was not found; restarting the partitioned update", session.name());
                session.mark_invalid();
                drop(session);
                session = self
                    .factory
                    .session(OperationKind::Partitioned, Some(deadline))?;
                continue;
            }
            return Err(err);
        }
    }

    fn partitioned_attempt(
        &self,
        scope: &Arc<RequestScope>,
        session: &SessionHandle,
        statement: &Statement,
        deadline: Instant,
    ) -> Result<i64> {
        let call = CallContext::new(scope.next_rpc(), Some(deadline));
        let request = BeginTransactionRequest {
            session: session.name().clone(),
            options: BeginOptions::partitioned_dml(),
            request_options: RequestOptions::default(),
            mutation_key: None,
        };
        let meta = self
            .rpc
            .begin_transaction(&call, request)
            .map_err(|status| status.with_request_id(&call.request_id))?;
        debug!("began partitioned update on {}", session.name());

        let source = PartitionedSource {
            rpc: Arc::clone(&self.rpc),
            scope: Arc::clone(scope),
            session: session.name().clone(),
            transaction_id: meta.id,
            statement: Request::Query(statement.clone()),
            deadline,
            call: None,
        };
        let mut rows = RowStream::new(Box::new(source), Some(deadline));
        for row in rows.by_ref() {
            row?;
        }
        rows.stats()
            .and_then(|stats| stats.row_count_lower_bound)
            .ok_or_else(|| ProtocolError::MissingRowCount.into())
    }

    /// Applies groups of mutations without a transaction spanning them.
    ///
    /// Each group is applied atomically; groups are independent and may succeed
    /// or fail individually, as reported per response. The call is not re-sent
    /// on failure since groups may already have been applied.
    #[track_caller]
    pub fn batch_write(
        &self,
        groups: impl IntoIterator<Item = MutationGroup>,
    ) -> Result<Vec<BatchWriteResponse>> {
        let deadline = deadline_after(self.config.query_timeout());
        let mut session = self
            .factory
            .session(OperationKind::BatchWrite, Some(deadline))?;
        let call = CallContext::new(self.ids.next_request().next_rpc(), Some(deadline));
        let request = BatchWriteRequest {
            session: session.name().clone(),
            mutation_groups: groups.into_iter().collect(),
            exclude_txn_from_change_streams: false,
            request_options: RequestOptions::default(),
        };
        let groups = request.mutation_groups.len();

        match self.rpc.batch_write(&call, request) {
            Ok(responses) => {
                debug!("batch write of {groups} group(s) on {}", session.name());
                Ok(responses)
            }
            Err(status) => {
                if status.is_session_not_found() {
                    session.mark_invalid();
                }
                Err(status.with_request_id(&call.request_id).into())
            }
        }
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.factory.pool().status()
    }

    /// Evicts idle sessions and keeps the rest alive. Call periodically.
    pub fn maintain(&self) -> usize {
        self.factory.pool().maintain()
    }

    /// Deletes pooled sessions. Sessions still borrowed are reported as leaks
    /// and deleted when they come back.
    pub fn close(&self) -> Result<()> {
        info!("closing client {}", self.client_id());
        self.factory.pool().close()
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("client_id", &self.client_id())
            .field("factory", &self.factory)
            .finish()
    }
}
