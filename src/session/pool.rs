use std::{
    collections::{HashMap, VecDeque},
    fmt,
    panic::Location,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use log::{debug, info, trace, warn};

use crate::{
    config::PoolConfig,
    error::{Code, Error, Holders, Result, SessionHolder, Status},
    protocol::{
        BatchCreateSessionsRequest, BeginOptions, CallContext, ExecuteSqlRequest, RequestOptions,
        Rpc, TransactionSelector,
    },
    request_id::RequestIdGenerator,
    statement::Statement,
};

use super::{Session, SessionKind, SessionName, SessionState};

const KEEP_ALIVE_SQL: &str = "SELECT 1";

/// Point-in-time view of the pool's inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub available: usize,
    pub borrowed: usize,
    pub creating: usize,
    pub waiters: usize,
    /// Sessions owned by the pool, including those being created or pinged.
    pub size: usize,
    pub max: usize,
}

struct IdleSession {
    session: Session,
    /// Kind of the last borrow, `None` while fresh.
    kind: Option<SessionKind>,
}

struct Borrowed {
    session: Session,
    location: &'static Location<'static>,
    since: Instant,
}

#[derive(Default)]
struct PoolState {
    available: VecDeque<IdleSession>,
    borrowed: HashMap<SessionName, Borrowed>,
    creating: usize,
    pinging: usize,
    /// Callers inside `acquire` that do not hold a session yet.
    pending: usize,
    waiters: usize,
    closed: bool,
}

impl PoolState {
    fn size(&self) -> usize {
        self.available.len() + self.borrowed.len() + self.creating + self.pinging
    }

    /// Most recently released session last used for `kind`, else the most recent one.
    fn take(&mut self, kind: SessionKind) -> Option<Session> {
        let idle = match self
            .available
            .iter()
            .rposition(|idle| idle.kind == Some(kind))
        {
            Some(index) => self.available.remove(index),
            None => self.available.pop_back(),
        };
        idle.map(|idle| idle.session)
    }

    fn holders(&self) -> Holders {
        let now = Instant::now();
        let mut holders = self
            .borrowed
            .values()
            .map(|borrowed| SessionHolder {
                session: borrowed.session.name().clone(),
                acquired_at: borrowed.location,
                held_for: now.saturating_duration_since(borrowed.since),
            })
            .collect::<Vec<_>>();
        holders.sort_by(|a, b| b.held_for.cmp(&a.held_for));
        Holders(holders)
    }
}

struct PoolInner {
    rpc: Arc<dyn Rpc>,
    ids: Arc<RequestIdGenerator>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    released: Condvar,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn call(&self) -> CallContext {
        CallContext::new(self.ids.next_request().next_rpc(), None)
    }

    fn create_batch(&self, count: usize) -> Result<Vec<Session>> {
        let call = self.call();
        let request = BatchCreateSessionsRequest {
            session_count: count,
            database_role: self.config.database_role.clone(),
        };
        let created = self
            .rpc
            .batch_create_sessions(&call, request)
            .map_err(|status| status.with_request_id(&call.request_id))?;

        if created.is_empty() {
            let status = Status::new(Code::ResourceExhausted, "session batch returned no sessions")
                .with_request_id(&call.request_id);
            return Err(status.into());
        }

        info!("created {} of {count} requested session(s)", created.len());
        Ok(created
            .into_iter()
            .map(|info| Session::new(info.name, false))
            .collect())
    }

    fn delete(&self, name: &SessionName) {
        let call = self.call();
        match self.rpc.delete_session(&call, name) {
            Ok(()) => debug!("deleted session {name}"),
            Err(status) => warn!("failed to delete session {name}: {status}"),
        }
    }

    fn release(&self, name: &SessionName, kind: SessionKind, invalid: bool) {
        let mut state = self.lock();
        let Some(borrowed) = state.borrowed.remove(name) else {
            warn!("session {name} was released but is not borrowed from this pool");
            return;
        };

        if invalid {
            drop(state);
            warn!("evicted session {name}");
            // Frees capacity for a waiter to create a replacement.
            self.released.notify_one();
            return;
        }

        if state.closed {
            drop(state);
            self.delete(name);
            return;
        }

        let mut session = borrowed.session;
        session.mark(SessionState::Released);
        state.available.push_back(IdleSession {
            session,
            kind: Some(kind),
        });
        drop(state);
        trace!("session {name} released");
        self.released.notify_one();
    }

    /// Returns false only when the server reports the session gone.
    fn ping(&self, name: &SessionName) -> bool {
        let call = self.call();
        let request = ExecuteSqlRequest {
            session: name.clone(),
            transaction: TransactionSelector::SingleUse(BeginOptions::read_only()),
            statement: Statement::new(KEEP_ALIVE_SQL),
            resume_token: None,
            seqno: None,
            request_options: RequestOptions::default(),
        };
        let result = self
            .rpc
            .execute_streaming_sql(&call, request)
            .and_then(|stream| stream.collect::<std::result::Result<Vec<_>, Status>>())
            .map(|_| ());

        match result {
            Ok(()) => {
                trace!("session {name} kept alive");
                true
            }
            Err(status) if status.is_session_not_found() => {
                warn!("session {name} expired while idle");
                false
            }
            Err(status) => {
                warn!("keep-alive for session {name} failed: {status}");
                true
            }
        }
    }
}

/// Bounded pool of exclusive sessions.
///
/// Sessions are created in batches of `inc_step` as demand requires, up to
/// `max`. When every session is borrowed, [`acquire`](SessionPool::acquire)
/// either waits for one to be released or, with `fail_fast`, fails at once.
///
/// Cloning is cheap; clones share the same inventory.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    /// Creates the pool and its first `min` sessions.
    pub fn open(
        rpc: Arc<dyn Rpc>,
        ids: Arc<RequestIdGenerator>,
        config: PoolConfig,
    ) -> Result<Self> {
        config.validate()?;
        let pool = Self {
            inner: Arc::new(PoolInner {
                rpc,
                ids,
                config,
                state: Mutex::new(PoolState::default()),
                released: Condvar::new(),
            }),
        };

        let (min, step) = (pool.inner.config.min, pool.inner.config.inc_step);
        let mut created = 0;
        while created < min {
            let sessions = match pool.inner.create_batch(step.min(min - created)) {
                Ok(sessions) => sessions,
                Err(err) => {
                    // Nothing is borrowed yet, so closing cannot report a leak.
                    let _ = pool.close();
                    return Err(err);
                }
            };
            created += sessions.len();
            pool.inner.lock().available.extend(
                sessions
                    .into_iter()
                    .map(|session| IdleSession { session, kind: None }),
            );
        }

        info!(
            "session pool opened with {created} session(s) (min={min}, max={})",
            pool.inner.config.max
        );
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Borrows a session, waiting at most `acquire_timeout` when the pool is at
    /// capacity.
    #[track_caller]
    pub fn acquire(&self, kind: SessionKind) -> Result<PooledSession> {
        self.acquire_until(kind, None)
    }

    /// Like [`acquire`](SessionPool::acquire), but never waits past `deadline`.
    #[track_caller]
    pub fn acquire_until(
        &self,
        kind: SessionKind,
        deadline: Option<Instant>,
    ) -> Result<PooledSession> {
        self.acquire_for(kind, deadline, Location::caller())
    }

    /// Borrows a session on behalf of the code at `location`, which is what
    /// leak and exhaustion reports name as its holder.
    pub(crate) fn acquire_for(
        &self,
        kind: SessionKind,
        deadline: Option<Instant>,
        location: &'static Location<'static>,
    ) -> Result<PooledSession> {
        let started = Instant::now();
        let limit = match (
            self.inner
                .config
                .acquire_timeout()
                .and_then(|t| started.checked_add(t)),
            deadline,
        ) {
            (Some(timeout), Some(deadline)) => Some(timeout.min(deadline)),
            (timeout, deadline) => timeout.or(deadline),
        };

        let mut state = self.inner.lock();
        state.pending += 1;
        let (mut state, acquired) = self.wait_for_session(state, kind, started, limit, location);
        state.pending -= 1;
        acquired
    }

    fn wait_for_session<'a>(
        &'a self,
        mut state: MutexGuard<'a, PoolState>,
        kind: SessionKind,
        started: Instant,
        limit: Option<Instant>,
        location: &'static Location<'static>,
    ) -> (MutexGuard<'a, PoolState>, Result<PooledSession>) {
        let inner = &self.inner;
        let max = inner.config.max;

        loop {
            if state.closed {
                return (state, Err(Error::PoolClosed));
            }

            if let Some(mut session) = state.take(kind) {
                session.mark(SessionState::InUse);
                let name = session.name().clone();
                state.borrowed.insert(
                    name.clone(),
                    Borrowed {
                        session,
                        location,
                        since: Instant::now(),
                    },
                );
                trace!("session {name} acquired at {location}");
                let session = PooledSession {
                    name,
                    kind,
                    invalid: false,
                    pool: Arc::clone(inner),
                };
                return (state, Ok(session));
            }

            // Callers without a session, creators included, outnumber the
            // sessions on their way.
            let size = state.size();
            if size < max && state.pending > state.creating {
                let count = inner.config.inc_step.min(max - size);
                state.creating += count;
                drop(state);

                let created = inner.create_batch(count);

                state = inner.lock();
                state.creating -= count;
                let sessions = match created {
                    Ok(sessions) => sessions,
                    Err(err) => {
                        inner.released.notify_all();
                        return (state, Err(err));
                    }
                };
                if state.closed {
                    drop(state);
                    sessions.iter().for_each(|s| inner.delete(s.name()));
                    return (inner.lock(), Err(Error::PoolClosed));
                }
                state.available.extend(
                    sessions
                        .into_iter()
                        .map(|session| IdleSession { session, kind: None }),
                );
                inner.released.notify_all();
                continue;
            }

            // Nothing is on its way, so every session is borrowed.
            if state.creating == 0 && inner.config.fail_fast {
                let holders = state.holders();
                return (state, Err(Error::PoolExhausted { max, holders }));
            }

            let now = Instant::now();
            if limit.is_some_and(|limit| now >= limit) {
                let holders = state.holders();
                let err = Error::AcquireTimeout {
                    waited: now - started,
                    max,
                    holders,
                };
                return (state, Err(err));
            }

            state.waiters += 1;
            state = match limit {
                Some(limit) => {
                    inner
                        .released
                        .wait_timeout(state, limit - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => inner
                    .released
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
            state.waiters -= 1;
        }
    }

    /// Every session currently borrowed, longest held first.
    pub fn holders(&self) -> Holders {
        self.inner.lock().holders()
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.lock();
        PoolStatus {
            available: state.available.len(),
            borrowed: state.borrowed.len(),
            creating: state.creating,
            waiters: state.waiters,
            size: state.size(),
            max: self.inner.config.max,
        }
    }

    /// Deletes sessions idle longer than `idle_timeout` while keeping `min`, and
    /// pings the ones idle longer than `keep_alive`. Returns the number of
    /// sessions that left the pool.
    pub fn maintain(&self) -> usize {
        let config = &self.inner.config;
        let now = Instant::now();

        let (expired, stale) = {
            let mut state = self.inner.lock();
            if state.closed {
                return 0;
            }

            let mut size = state.size();
            let mut expired = Vec::new();
            let mut stale = Vec::new();
            let mut kept = VecDeque::with_capacity(state.available.len());
            while let Some(idle) = state.available.pop_front() {
                let idle_for = now.saturating_duration_since(idle.session.last_used());
                if idle_for >= config.idle_timeout() && size > config.min {
                    size -= 1;
                    expired.push(idle);
                } else if idle_for >= config.keep_alive() {
                    stale.push(idle);
                } else {
                    kept.push_back(idle);
                }
            }
            state.available = kept;
            state.pinging += stale.len();
            (expired, stale)
        };

        for idle in &expired {
            self.inner.delete(idle.session.name());
        }

        let mut lost = 0;
        for mut idle in stale {
            let alive = self.inner.ping(idle.session.name());
            let mut state = self.inner.lock();
            state.pinging -= 1;
            if !alive {
                lost += 1;
                drop(state);
                self.inner.released.notify_one();
            } else if state.closed {
                drop(state);
                self.inner.delete(idle.session.name());
            } else {
                idle.session.mark(SessionState::Released);
                state.available.push_back(idle);
                drop(state);
                self.inner.released.notify_one();
            }
        }

        if !expired.is_empty() || lost > 0 {
            debug!(
                "maintenance removed {} idle and {lost} expired session(s)",
                expired.len()
            );
        }
        expired.len() + lost
    }

    /// Stops handing out sessions and deletes the idle ones.
    ///
    /// Waiters fail with [`Error::PoolClosed`]. Sessions still borrowed are
    /// reported as a [`Error::SessionLeak`] and deleted when they come back.
    pub fn close(&self) -> Result<()> {
        let (available, holders) = {
            let mut state = self.inner.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            let available = state.available.drain(..).collect::<Vec<_>>();
            (available, state.holders())
        };
        self.inner.released.notify_all();

        for idle in &available {
            self.inner.delete(idle.session.name());
        }
        info!("session pool closed; deleted {} idle session(s)", available.len());

        if holders.is_empty() {
            return Ok(());
        }
        warn!("{} session(s) still borrowed at close: {holders}", holders.len());
        Err(Error::SessionLeak { holders })
    }
}

impl fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPool")
            .field("status", &self.status())
            .finish()
    }
}

/// A borrowed session, returned to its pool on drop.
pub struct PooledSession {
    name: SessionName,
    kind: SessionKind,
    invalid: bool,
    pool: Arc<PoolInner>,
}

impl PooledSession {
    pub fn name(&self) -> &SessionName {
        &self.name
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    /// Evicts the session instead of returning it to the pool.
    pub fn mark_invalid(&mut self) {
        self.invalid = true;
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        self.pool.release(&self.name, self.kind, self.invalid);
    }
}

impl fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledSession")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("invalid", &self.invalid)
            .finish_non_exhaustive()
    }
}
