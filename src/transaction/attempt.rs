use std::{
    fmt, iter,
    sync::{
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
    time::Instant,
};

use log::{debug, trace, warn};

use crate::{
    backoff::RetryBudget,
    error::{Error, ProtocolError, Result, Status},
    mutation::{KeySet, Mutation, Write, select_mutation_key},
    protocol::{
        self, BeginOptions, BeginTransactionRequest, CallContext, CommitRequest, CommitResponse,
        ExecuteBatchDmlRequest, ExecuteSqlRequest, PrecommitToken, ReadRequest, RequestOptions,
        ResultStream, RollbackRequest, Rpc, TransactionId, TransactionMode, TransactionSelector,
    },
    request_id::RequestScope,
    session::SessionName,
    statement::Statement,
    stream::{RowStream, StreamSource},
};

use super::TransactionOptions;

/// Where the attempt stands on obtaining its transaction id.
#[derive(Debug, Clone, PartialEq, Eq)]
enum IdSlot {
    /// Nothing sent yet; the next statement begins inline.
    Unstarted,
    /// A statement carrying the begin is in flight.
    Pending,
    Ready(TransactionId),
    /// The inline begin failed; the next statement begins explicitly first.
    ExplicitNeeded,
}

/// How a statement attaches to the attempt's transaction.
enum Claim {
    Inline(BeginOptions),
    Id(TransactionId),
}

impl Claim {
    fn selector(self) -> TransactionSelector {
        match self {
            Claim::Inline(options) => TransactionSelector::Begin(options),
            Claim::Id(id) => TransactionSelector::Id(id),
        }
    }
}

/// Everything an attempt needs from the runner.
pub(crate) struct Attempt {
    pub rpc: Arc<dyn Rpc>,
    pub scope: Arc<RequestScope>,
    pub session: SessionName,
    pub multiplexed: bool,
    pub options: TransactionOptions,
    /// Id of the aborted attempt this one replaces.
    pub previous_id: Option<TransactionId>,
    /// Skip the inline begin because it failed on the previous attempt.
    pub explicit_begin: bool,
    pub deadline: Instant,
}

struct Shared {
    rpc: Arc<dyn Rpc>,
    scope: Arc<RequestScope>,
    session: SessionName,
    multiplexed: bool,
    options: TransactionOptions,
    previous_id: Option<TransactionId>,
    deadline: Instant,
    slot: Mutex<IdSlot>,
    slot_changed: Condvar,
    inline_failed: AtomicBool,
    precommit: Mutex<Option<PrecommitToken>>,
    seqno: AtomicI64,
    mutations: Mutex<Vec<Mutation>>,
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, IdSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn call(&self) -> CallContext {
        CallContext::new(self.scope.next_rpc(), Some(self.deadline))
    }

    fn begin_options(&self) -> BeginOptions {
        BeginOptions {
            mode: TransactionMode::ReadWrite {
                read_lock_mode: self.options.read_lock_mode,
                previous_transaction_id: self.previous_id.clone(),
            },
            isolation_level: self.options.isolation_level,
            exclude_txn_from_change_streams: self.options.exclude_txn_from_change_streams,
        }
    }

    fn request_options(&self) -> RequestOptions {
        RequestOptions {
            transaction_tag: self.options.transaction_tag.clone(),
            request_tag: None,
        }
    }

    /// Sends a unary call, re-sending it with the next attempt number while it
    /// fails transiently.
    fn unary<T>(
        &self,
        mut send: impl FnMut(&CallContext) -> std::result::Result<T, Status>,
    ) -> Result<T> {
        let mut call = self.call();
        let mut retry = RetryBudget::new(self.options.backoff.clone(), Some(self.deadline));
        loop {
            let status = match send(&call) {
                Ok(value) => return Ok(value),
                Err(status) => status.with_request_id(&call.request_id),
            };
            if !status.is_transient() {
                return Err(status.into());
            }
            retry.pause(status.into())?;
            call = call.retry();
        }
    }

    /// Decides how the next statement attaches to the transaction, blocking
    /// while another statement's inline begin is in flight.
    fn claim(&self) -> Result<Claim> {
        let mut slot = self.slot();
        loop {
            let current = (*slot).clone();
            match current {
                IdSlot::Ready(id) => return Ok(Claim::Id(id)),
                IdSlot::Unstarted => {
                    *slot = IdSlot::Pending;
                    return Ok(Claim::Inline(self.begin_options()));
                }
                IdSlot::ExplicitNeeded => {
                    *slot = IdSlot::Pending;
                    drop(slot);
                    let begun = self.begin(None);
                    self.settle(begun.as_ref().ok().cloned(), false);
                    return begun.map(Claim::Id);
                }
                IdSlot::Pending => {
                    let now = Instant::now();
                    if now >= self.deadline {
                        return Err(Error::DeadlineExceeded {
                            attempts: 1,
                            last: None,
                        });
                    }
                    trace!("waiting for the inline begin on {}", self.session);
                    slot = self
                        .slot_changed
                        .wait_timeout(slot, self.deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }

    /// Publishes the outcome of a begin to statements waiting in [`claim`].
    ///
    /// [`claim`]: Shared::claim
    fn settle(&self, id: Option<TransactionId>, inline: bool) {
        let mut slot = self.slot();
        *slot = match id {
            Some(id) => IdSlot::Ready(id),
            None => {
                if inline {
                    self.inline_failed.store(true, Ordering::SeqCst);
                }
                IdSlot::ExplicitNeeded
            }
        };
        drop(slot);
        self.slot_changed.notify_all();
    }

    fn begin(&self, mutation_key: Option<Mutation>) -> Result<TransactionId> {
        let request = BeginTransactionRequest {
            session: self.session.clone(),
            options: self.begin_options(),
            request_options: self.request_options(),
            mutation_key,
        };
        let meta = self.unary(|call| self.rpc.begin_transaction(call, request.clone()))?;
        debug!("began transaction explicitly on {}", self.session);
        self.observe(meta.precommit_token.as_ref());
        Ok(meta.id)
    }

    fn observe(&self, token: Option<&PrecommitToken>) {
        if token.is_none() {
            return;
        }
        let mut latest = self.precommit.lock().unwrap_or_else(PoisonError::into_inner);
        *latest = PrecommitToken::newest(latest.take(), token);
    }

    fn latest_precommit(&self) -> Option<PrecommitToken> {
        self.precommit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn transaction_id(&self) -> Option<TransactionId> {
        match &*self.slot() {
            IdSlot::Ready(id) => Some(id.clone()),
            _ => None,
        }
    }

    fn send_commit(&self, request: CommitRequest) -> Result<CommitResponse> {
        let call = self.call();
        self.rpc
            .commit(&call, request)
            .map_err(|status| status.with_request_id(&call.request_id).into())
    }
}

enum Request {
    Query {
        statement: Statement,
        seqno: Option<i64>,
    },
    Read {
        table: String,
        columns: Vec<String>,
        key_set: KeySet,
    },
}

/// Streaming call inside a read-write transaction.
///
/// When the call begins the transaction inline, the first message is read
/// eagerly so that its transaction id is published before any other statement
/// of the attempt proceeds.
struct TransactionSource {
    shared: Arc<Shared>,
    request: Request,
    /// Last send; a resumed stream re-sends it with the next attempt number.
    call: Option<CallContext>,
}

impl TransactionSource {
    fn send(
        &self,
        call: &CallContext,
        transaction: TransactionSelector,
        resume_token: Option<&[u8]>,
    ) -> std::result::Result<ResultStream, Status> {
        let shared = &self.shared;
        match &self.request {
            Request::Query { statement, seqno } => shared.rpc.execute_streaming_sql(
                call,
                ExecuteSqlRequest {
                    session: shared.session.clone(),
                    transaction,
                    statement: statement.clone(),
                    resume_token: resume_token.map(<[u8]>::to_vec),
                    seqno: *seqno,
                    request_options: shared.request_options(),
                },
            ),
            Request::Read {
                table,
                columns,
                key_set,
            } => shared.rpc.streaming_read(
                call,
                ReadRequest {
                    session: shared.session.clone(),
                    transaction,
                    table: table.clone(),
                    index: None,
                    columns: columns.clone(),
                    key_set: key_set.clone(),
                    limit: None,
                    resume_token: resume_token.map(<[u8]>::to_vec),
                    request_options: shared.request_options(),
                },
            ),
        }
    }

    /// Keeps the attempt's precommit token current as messages pass by.
    fn tracked(&self, stream: ResultStream) -> ResultStream {
        let shared = Arc::clone(&self.shared);
        Box::new(stream.inspect(move |item| {
            if let Ok(message) = item {
                shared.observe(message.precommit_token.as_ref());
            }
        }))
    }

    fn prime(&self, mut stream: ResultStream) -> Result<ResultStream> {
        let first = match stream.next() {
            Some(Ok(first)) => first,
            Some(Err(status)) => {
                self.shared.settle(None, true);
                return Err(status.into());
            }
            None => {
                self.shared.settle(None, true);
                return Err(ProtocolError::MissingTransactionId.into());
            }
        };

        let id = first
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.transaction.as_ref())
            .map(|meta| meta.id.clone());
        let Some(id) = id else {
            self.shared.settle(None, true);
            return Err(ProtocolError::MissingTransactionId.into());
        };
        debug!("transaction began inline on {}", self.shared.session);
        self.shared.settle(Some(id), true);
        Ok(self.tracked(Box::new(iter::once(Ok(first)).chain(stream))))
    }
}

impl StreamSource for TransactionSource {
    fn open(&mut self, resume_token: Option<&[u8]>) -> Result<ResultStream> {
        let claim = self.shared.claim()?;
        let inline = matches!(claim, Claim::Inline(_));
        let call = CallContext::reopen(&mut self.call, || self.shared.call());

        match self.send(&call, claim.selector(), resume_token) {
            Ok(stream) => {
                let stream = protocol::tag_failures(stream, call.request_id.clone());
                if inline {
                    self.prime(stream)
                } else {
                    Ok(self.tracked(stream))
                }
            }
            Err(status) => {
                if inline {
                    self.shared.settle(None, true);
                }
                Err(status.with_request_id(&call.request_id).into())
            }
        }
    }
}

/// One attempt of a read-write transaction.
///
/// Statements may be issued from several threads at once; the transaction id
/// returned by the first of them is shared with the rest. Mutations are
/// buffered and sent with the commit.
pub struct Transaction {
    shared: Arc<Shared>,
}

impl Transaction {
    pub(crate) fn new(attempt: Attempt) -> Self {
        let slot = if attempt.explicit_begin {
            IdSlot::ExplicitNeeded
        } else {
            IdSlot::Unstarted
        };
        Self {
            shared: Arc::new(Shared {
                rpc: attempt.rpc,
                scope: attempt.scope,
                session: attempt.session,
                multiplexed: attempt.multiplexed,
                options: attempt.options,
                previous_id: attempt.previous_id,
                deadline: attempt.deadline,
                slot: Mutex::new(slot),
                slot_changed: Condvar::new(),
                inline_failed: AtomicBool::new(false),
                precommit: Mutex::new(None),
                seqno: AtomicI64::new(1),
                mutations: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The transaction id, once a statement or an explicit begin returned it.
    pub fn id(&self) -> Option<TransactionId> {
        self.shared.transaction_id()
    }

    pub fn session(&self) -> &SessionName {
        &self.shared.session
    }

    fn stream(&self, request: Request) -> RowStream {
        let source = TransactionSource {
            shared: Arc::clone(&self.shared),
            request,
            call: None,
        };
        RowStream::with_backoff(
            Box::new(source),
            Some(self.shared.deadline),
            self.shared.options.backoff.clone(),
        )
    }

    pub fn execute_query(&self, statement: impl Into<Statement>) -> RowStream {
        self.stream(Request::Query {
            statement: statement.into(),
            seqno: None,
        })
    }

    pub fn read(&self, table: &str, key_set: KeySet, columns: &[&str]) -> RowStream {
        self.stream(Request::Read {
            table: table.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            key_set,
        })
    }

    /// Runs one DML statement and returns the number of rows it modified.
    pub fn run_update(&self, statement: impl Into<Statement>) -> Result<i64> {
        let seqno = self.shared.seqno.fetch_add(1, Ordering::SeqCst);
        let mut rows = self.stream(Request::Query {
            statement: statement.into(),
            seqno: Some(seqno),
        });
        for row in rows.by_ref() {
            row?;
        }
        rows.stats()
            .and_then(|stats| stats.row_count_exact)
            .ok_or_else(|| ProtocolError::MissingRowCount.into())
    }

    /// Runs DML statements in one round trip.
    ///
    /// Statements run in order and stop at the first failure, which is reported
    /// as [`Error::BatchUpdate`] with the row counts of the statements before it.
    pub fn batch_update<I, S>(&self, statements: I) -> Result<Vec<i64>>
    where
        I: IntoIterator<Item = S>,
        S: Into<Statement>,
    {
        let shared = &self.shared;
        let statements = statements.into_iter().map(Into::into).collect::<Vec<_>>();
        let seqno = shared.seqno.fetch_add(1, Ordering::SeqCst);
        let mut retry = RetryBudget::new(shared.options.backoff.clone(), Some(shared.deadline));
        let mut call = shared.call();

        let response = loop {
            let claim = shared.claim()?;
            let inline = matches!(claim, Claim::Inline(_));
            let request = ExecuteBatchDmlRequest {
                session: shared.session.clone(),
                transaction: claim.selector(),
                statements: statements.clone(),
                seqno,
                request_options: shared.request_options(),
            };

            let status = match shared.rpc.execute_batch_dml(&call, request) {
                Ok(response) => {
                    if inline {
                        let id = response
                            .result_sets
                            .first()
                            .and_then(|result| result.metadata.as_ref())
                            .and_then(|metadata| metadata.transaction.as_ref())
                            .map(|meta| meta.id.clone());
                        let begun = id.is_some();
                        shared.settle(id, true);
                        if !begun && response.status.is_none() {
                            return Err(ProtocolError::MissingTransactionId.into());
                        }
                    }
                    break response;
                }
                Err(status) => status.with_request_id(&call.request_id),
            };

            if inline {
                shared.settle(None, true);
            }
            if !status.is_transient() {
                return Err(status.into());
            }
            retry.pause(status.into())?;
            call = call.retry();
        };

        shared.observe(response.precommit_token.as_ref());
        let row_counts = response
            .result_sets
            .iter()
            .map(|result| result.row_count)
            .collect::<Vec<_>>();
        match response.status {
            Some(status) => Err(Error::BatchUpdate {
                index: row_counts.len(),
                row_counts,
                status: status.with_request_id(&call.request_id),
            }),
            None => Ok(row_counts),
        }
    }

    /// Buffers mutations to be applied at commit.
    pub fn buffer(&self, mutations: impl IntoIterator<Item = Mutation>) {
        self.shared
            .mutations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(mutations);
    }

    pub fn insert(&self, write: Write) {
        self.buffer([Mutation::Insert(write)]);
    }

    pub fn update(&self, write: Write) {
        self.buffer([Mutation::Update(write)]);
    }

    pub fn insert_or_update(&self, write: Write) {
        self.buffer([Mutation::InsertOrUpdate(write)]);
    }

    pub fn replace(&self, write: Write) {
        self.buffer([Mutation::Replace(write)]);
    }

    pub fn delete(&self, table: &str, key_set: KeySet) {
        self.buffer([Mutation::Delete {
            table: table.to_string(),
            key_set,
        }]);
    }

    pub(crate) fn inline_begin_failed(&self) -> bool {
        self.shared.inline_failed.load(Ordering::SeqCst)
    }

    /// Leaves the attempt as if another statement's inline begin never
    /// returned.
    #[cfg(test)]
    pub(crate) fn stall_inline_begin(&self) {
        *self.shared.slot() = IdSlot::Pending;
    }

    /// Commits the attempt, beginning it first when no statement did.
    pub(crate) fn commit(&self) -> Result<CommitResponse> {
        let shared = &self.shared;
        let mutations = shared
            .mutations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let id = match self.id() {
            Some(id) => id,
            None => {
                let mutation_key = if shared.multiplexed {
                    select_mutation_key(&mutations).cloned()
                } else {
                    None
                };
                let id = shared.begin(mutation_key)?;
                shared.settle(Some(id.clone()), false);
                id
            }
        };

        let mut request = CommitRequest {
            session: shared.session.clone(),
            transaction_id: id,
            mutations,
            precommit_token: shared.latest_precommit(),
            return_commit_stats: shared.options.return_commit_stats,
            max_commit_delay: shared.options.max_commit_delay,
            request_options: shared.request_options(),
        };

        let mut response = shared.send_commit(request.clone())?;
        let Some(token) = response.precommit_retry.take() else {
            return Ok(response);
        };
        debug!("commit returned precommit token {}; retrying once", token.seq_num);
        request.precommit_token = Some(token);

        let response = shared.send_commit(request)?;
        if response.precommit_retry.is_some() {
            return Err(ProtocolError::RepeatedCommitRetry.into());
        }
        Ok(response)
    }

    /// Rolls back a begun attempt. Failures are logged, never returned.
    pub(crate) fn rollback(&self) {
        let shared = &self.shared;
        let Some(transaction_id) = self.id() else {
            return;
        };
        let request = RollbackRequest {
            session: shared.session.clone(),
            transaction_id,
        };
        match shared.unary(|call| shared.rpc.rollback(call, request.clone())) {
            Ok(()) => debug!("rolled back transaction on {}", shared.session),
            Err(err) => warn!("rollback on {} failed: {err}", shared.session),
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("session", &self.shared.session)
            .field("slot", &*self.shared.slot())
            .finish()
    }
}
