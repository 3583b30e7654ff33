//! Scriptable in-memory [`Rpc`] for tests.
use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::{Duration, SystemTime},
};

use crate::{
    error::Status,
    mutation::Mutation,
    protocol::{
        BatchCreateSessionsRequest, BatchDmlResult, BatchWriteRequest, BatchWriteResponse,
        BeginTransactionRequest, CallContext, CommitRequest, CommitResponse, CommitStats,
        CreateSessionRequest, ExecuteBatchDmlRequest, ExecuteBatchDmlResponse, ExecuteSqlRequest,
        PartialResultSet, PrecommitToken, ReadRequest, ResultSetMetadata, ResultSetStats,
        ResultStream, RollbackRequest, Rpc, SessionInfo, TransactionId, TransactionMeta,
        TransactionSelector,
    },
    request_id::RequestId,
    session::SessionName,
    value::{Field, TypeCode, Value},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Method {
    BatchCreateSessions,
    CreateSession,
    DeleteSession,
    BeginTransaction,
    ExecuteStreamingSql,
    StreamingRead,
    ExecuteBatchDml,
    Commit,
    Rollback,
    BatchWrite,
}

#[derive(Default)]
struct MockState {
    next_session: usize,
    next_transaction: usize,
    next_precommit: i32,
    created: usize,
    live: BTreeSet<SessionName>,
    multiplexed: BTreeSet<SessionName>,
    batch_limit: Option<usize>,
    failures: HashMap<Method, VecDeque<Status>>,
    results: HashMap<String, Vec<PartialResultSet>>,
    stream_faults: HashMap<String, VecDeque<(usize, Status)>>,
    update_counts: HashMap<String, i64>,
    batch_failure: Option<(usize, Status)>,
    precommit_retries: usize,
    log: Vec<(Method, RequestId)>,
    begins: Vec<BeginTransactionRequest>,
    sql: Vec<ExecuteSqlRequest>,
    reads: Vec<ReadRequest>,
    batch_dml: Vec<ExecuteBatchDmlRequest>,
    commits: Vec<CommitRequest>,
    committed: Vec<Vec<Mutation>>,
    rollbacks: Vec<RollbackRequest>,
    batch_writes: Vec<BatchWriteRequest>,
}

pub(crate) struct MockRpc {
    state: Mutex<MockState>,
    create_delay: Mutex<Duration>,
}

/// Metadata for string columns named `columns`.
pub(crate) fn columns(columns: &[&str]) -> ResultSetMetadata {
    ResultSetMetadata {
        row_type: columns
            .iter()
            .map(|name| Field::new(*name, TypeCode::String))
            .collect(),
        transaction: None,
    }
}

/// One message per row, each with a resume token; the first carries metadata.
pub(crate) fn row_messages(names: &[&str], rows: Vec<Vec<Value>>) -> Vec<PartialResultSet> {
    let mut messages = rows
        .into_iter()
        .enumerate()
        .map(|(i, values)| PartialResultSet {
            values,
            resume_token: Some(format!("token-{i}").into_bytes()),
            ..PartialResultSet::default()
        })
        .collect::<Vec<_>>();
    match messages.first_mut() {
        Some(first) => first.metadata = Some(columns(names)),
        None => messages.push(PartialResultSet {
            metadata: Some(columns(names)),
            ..PartialResultSet::default()
        }),
    }
    messages
}

impl MockRpc {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
            create_delay: Mutex::new(Duration::ZERO),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    // Scripting.

    pub fn fail_next(&self, method: Method, status: Status) {
        self.lock()
            .failures
            .entry(method)
            .or_default()
            .push_back(status);
    }

    /// Serves `messages` for the SQL text or read table `key`.
    pub fn script(&self, key: &str, messages: Vec<PartialResultSet>) {
        self.lock().results.insert(key.to_string(), messages);
    }

    /// Breaks the next stream for `key` after `after` messages.
    pub fn fail_stream(&self, key: &str, after: usize, status: Status) {
        self.lock()
            .stream_faults
            .entry(key.to_string())
            .or_default()
            .push_back((after, status));
    }

    pub fn set_update_count(&self, sql: &str, count: i64) {
        self.lock().update_counts.insert(sql.to_string(), count);
    }

    /// Fails the next batch DML at statement `index`.
    pub fn fail_batch_at(&self, index: usize, status: Status) {
        self.lock().batch_failure = Some((index, status));
    }

    pub fn limit_batch(&self, limit: usize) {
        self.lock().batch_limit = Some(limit);
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = delay;
    }

    pub fn expire_session(&self, name: &SessionName) {
        self.lock().live.remove(name);
    }

    /// The next `count` commits ask for a retry with a precommit token.
    pub fn request_precommit_retries(&self, count: usize) {
        self.lock().precommit_retries = count;
    }

    // Inspection.

    pub fn calls(&self, method: Method) -> usize {
        self.lock().log.iter().filter(|(m, _)| *m == method).count()
    }

    pub fn request_ids(&self) -> Vec<(Method, RequestId)> {
        self.lock().log.clone()
    }

    pub fn created_sessions(&self) -> usize {
        self.lock().created
    }

    pub fn live_sessions(&self) -> usize {
        self.lock().live.len()
    }

    pub fn executed_sql(&self, sql: &str) -> usize {
        self.lock()
            .sql
            .iter()
            .filter(|r| r.statement.sql == sql)
            .count()
    }

    pub fn begins(&self) -> Vec<BeginTransactionRequest> {
        self.lock().begins.clone()
    }

    pub fn sql_requests(&self) -> Vec<ExecuteSqlRequest> {
        self.lock().sql.clone()
    }

    pub fn reads(&self) -> Vec<ReadRequest> {
        self.lock().reads.clone()
    }

    pub fn batch_dml_requests(&self) -> Vec<ExecuteBatchDmlRequest> {
        self.lock().batch_dml.clone()
    }

    pub fn commits(&self) -> Vec<CommitRequest> {
        self.lock().commits.clone()
    }

    pub fn committed(&self) -> Vec<Vec<Mutation>> {
        self.lock().committed.clone()
    }

    pub fn rollbacks(&self) -> Vec<RollbackRequest> {
        self.lock().rollbacks.clone()
    }

    pub fn batch_writes(&self) -> Vec<BatchWriteRequest> {
        self.lock().batch_writes.clone()
    }

    // Helpers.

    fn enter(
        &self,
        method: Method,
        call: &CallContext,
        session: Option<&SessionName>,
    ) -> Result<MutexGuard<'_, MockState>, Status> {
        let mut state = self.lock();
        state.log.push((method, call.request_id.clone()));
        if let Some(status) = state.failures.get_mut(&method).and_then(VecDeque::pop_front) {
            return Err(status);
        }
        if let Some(session) = session {
            if !state.live.contains(session) {
                return Err(Status::session_not_found(session));
            }
        }
        Ok(state)
    }

    fn create(state: &mut MockState, multiplexed: bool) -> SessionInfo {
        state.next_session += 1;
        state.created += 1;
        let prefix = if multiplexed { "multiplexed" } else { "sessions" };
        let name = SessionName::from(format!("{prefix}/{}", state.next_session));
        state.live.insert(name.clone());
        if multiplexed {
            state.multiplexed.insert(name.clone());
        }
        SessionInfo { name, multiplexed }
    }

    fn transaction(state: &mut MockState, session: &SessionName) -> TransactionMeta {
        state.next_transaction += 1;
        TransactionMeta {
            id: TransactionId::from(format!("txn-{}", state.next_transaction).as_str()),
            read_timestamp: None,
            precommit_token: Self::precommit(state, session),
        }
    }

    fn precommit(state: &mut MockState, session: &SessionName) -> Option<PrecommitToken> {
        if !state.multiplexed.contains(session) {
            return None;
        }
        state.next_precommit += 1;
        Some(PrecommitToken {
            token: format!("pc-{}", state.next_precommit).into_bytes(),
            seq_num: state.next_precommit,
        })
    }

    fn dml(count: i64) -> Vec<PartialResultSet> {
        vec![PartialResultSet {
            metadata: Some(ResultSetMetadata::default()),
            stats: Some(ResultSetStats {
                row_count_exact: Some(count),
                row_count_lower_bound: Some(count),
            }),
            last: true,
            ..PartialResultSet::default()
        }]
    }

    fn serve(
        state: &mut MockState,
        key: &str,
        session: &SessionName,
        selector: &TransactionSelector,
        resume_token: Option<&[u8]>,
    ) -> Result<ResultStream, Status> {
        let messages = if let Some(messages) = state.results.get(key) {
            messages.clone()
        } else if key == "SELECT 1" {
            row_messages(&["one"], vec![vec![Value::from(1i64)]])
        } else if let Some(count) = state.update_counts.get(key) {
            Self::dml(*count)
        } else if ["INSERT", "UPDATE", "DELETE"]
            .iter()
            .any(|verb| key.starts_with(verb))
        {
            Self::dml(1)
        } else {
            return Err(Status::invalid_argument(format!("unknown statement: {key}")));
        };

        let start = match resume_token {
            Some(token) => messages
                .iter()
                .position(|m| m.resume_token.as_deref() == Some(token))
                .map(|i| i + 1)
                .ok_or_else(|| Status::invalid_argument("unknown resume token"))?,
            None => 0,
        };
        let mut messages = messages[start..].to_vec();

        if let TransactionSelector::Begin(_) = selector {
            let meta = Self::transaction(state, session);
            if let Some(first) = messages.first_mut() {
                first
                    .metadata
                    .get_or_insert_with(ResultSetMetadata::default)
                    .transaction = Some(TransactionMeta {
                    precommit_token: None,
                    ..meta
                });
            }
        }
        if !matches!(selector, TransactionSelector::SingleUse(_)) {
            let token = Self::precommit(state, session);
            if let Some(last) = messages.last_mut() {
                last.precommit_token = token;
            }
        }

        let mut items = messages.into_iter().map(Ok).collect::<Vec<_>>();
        if let Some((after, status)) = state
            .stream_faults
            .get_mut(key)
            .and_then(VecDeque::pop_front)
        {
            items.truncate(after);
            items.push(Err(status));
        }
        Ok(Box::new(items.into_iter()))
    }
}

impl Rpc for MockRpc {
    fn batch_create_sessions(
        &self,
        call: &CallContext,
        request: BatchCreateSessionsRequest,
    ) -> Result<Vec<SessionInfo>, Status> {
        let delay = *self.create_delay.lock().unwrap();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        let mut state = self.enter(Method::BatchCreateSessions, call, None)?;
        let count = state
            .batch_limit
            .map_or(request.session_count, |limit| limit.min(request.session_count));
        Ok((0..count).map(|_| Self::create(&mut state, false)).collect())
    }

    fn create_session(
        &self,
        call: &CallContext,
        request: CreateSessionRequest,
    ) -> Result<SessionInfo, Status> {
        let mut state = self.enter(Method::CreateSession, call, None)?;
        Ok(Self::create(&mut state, request.multiplexed))
    }

    fn delete_session(&self, call: &CallContext, session: &SessionName) -> Result<(), Status> {
        let mut state = self.enter(Method::DeleteSession, call, None)?;
        state.live.remove(session);
        Ok(())
    }

    fn begin_transaction(
        &self,
        call: &CallContext,
        request: BeginTransactionRequest,
    ) -> Result<TransactionMeta, Status> {
        let mut state = self.enter(Method::BeginTransaction, call, Some(&request.session))?;
        let meta = Self::transaction(&mut state, &request.session);
        state.begins.push(request);
        Ok(meta)
    }

    fn execute_streaming_sql(
        &self,
        call: &CallContext,
        request: ExecuteSqlRequest,
    ) -> Result<ResultStream, Status> {
        let mut state = self.enter(Method::ExecuteStreamingSql, call, Some(&request.session))?;
        state.sql.push(request.clone());
        Self::serve(
            &mut state,
            &request.statement.sql,
            &request.session,
            &request.transaction,
            request.resume_token.as_deref(),
        )
    }

    fn streaming_read(
        &self,
        call: &CallContext,
        request: ReadRequest,
    ) -> Result<ResultStream, Status> {
        let mut state = self.enter(Method::StreamingRead, call, Some(&request.session))?;
        state.reads.push(request.clone());
        Self::serve(
            &mut state,
            &request.table,
            &request.session,
            &request.transaction,
            request.resume_token.as_deref(),
        )
    }

    fn execute_batch_dml(
        &self,
        call: &CallContext,
        request: ExecuteBatchDmlRequest,
    ) -> Result<ExecuteBatchDmlResponse, Status> {
        let mut state = self.enter(Method::ExecuteBatchDml, call, Some(&request.session))?;
        state.batch_dml.push(request.clone());

        let failure = state.batch_failure.take();
        let mut result_sets = Vec::new();
        let mut status = None;
        for (index, statement) in request.statements.iter().enumerate() {
            if let Some((at, failed)) = &failure {
                if *at == index {
                    status = Some(failed.clone());
                    break;
                }
            }
            result_sets.push(BatchDmlResult {
                metadata: None,
                row_count: state
                    .update_counts
                    .get(&statement.sql)
                    .copied()
                    .unwrap_or(1),
            });
        }

        if let TransactionSelector::Begin(_) = request.transaction {
            let meta = Self::transaction(&mut state, &request.session);
            if let Some(first) = result_sets.first_mut() {
                first.metadata = Some(ResultSetMetadata {
                    row_type: Vec::new(),
                    transaction: Some(meta),
                });
            }
        }

        Ok(ExecuteBatchDmlResponse {
            result_sets,
            status,
            precommit_token: Self::precommit(&mut state, &request.session),
        })
    }

    fn commit(&self, call: &CallContext, request: CommitRequest) -> Result<CommitResponse, Status> {
        let mut state = self.enter(Method::Commit, call, Some(&request.session))?;
        state.commits.push(request.clone());

        if state.precommit_retries > 0 {
            state.precommit_retries -= 1;
            state.next_precommit += 100;
            return Ok(CommitResponse {
                precommit_retry: Some(PrecommitToken {
                    token: b"commit-retry".to_vec(),
                    seq_num: state.next_precommit,
                }),
                ..CommitResponse::default()
            });
        }

        let mutation_count = request.mutations.len() as i64;
        state.committed.push(request.mutations);
        Ok(CommitResponse {
            commit_timestamp: Some(SystemTime::now()),
            commit_stats: request
                .return_commit_stats
                .then_some(CommitStats { mutation_count }),
            precommit_retry: None,
        })
    }

    fn rollback(&self, call: &CallContext, request: RollbackRequest) -> Result<(), Status> {
        let mut state = self.enter(Method::Rollback, call, Some(&request.session))?;
        state.rollbacks.push(request);
        Ok(())
    }

    fn batch_write(
        &self,
        call: &CallContext,
        request: BatchWriteRequest,
    ) -> Result<Vec<BatchWriteResponse>, Status> {
        let mut state = self.enter(Method::BatchWrite, call, Some(&request.session))?;
        let responses = (0..request.mutation_groups.len())
            .map(|index| BatchWriteResponse {
                indexes: vec![index],
                status: None,
                commit_timestamp: Some(SystemTime::now()),
            })
            .collect();
        for group in &request.mutation_groups {
            state.committed.push(group.0.clone());
        }
        state.batch_writes.push(request);
        Ok(responses)
    }
}
