use std::{
    fmt,
    panic::Location,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use log::{debug, info, warn};

use crate::{
    config::MultiplexedConfig,
    error::Result,
    protocol::{CallContext, CreateSessionRequest, Rpc},
    request_id::RequestIdGenerator,
};

use super::{Session, SessionHandle, SessionKind, SessionName, SessionPool, SessionState};

/// Classification of an operation for session routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Read,
    ReadWrite,
    Partitioned,
    BatchWrite,
}

impl OperationKind {
    fn session_kind(self) -> SessionKind {
        match self {
            OperationKind::Read => SessionKind::Read,
            _ => SessionKind::ReadWrite,
        }
    }
}

struct MultiplexedInner {
    rpc: Arc<dyn Rpc>,
    ids: Arc<RequestIdGenerator>,
    database_role: Option<String>,
    slot: Mutex<Option<Arc<Session>>>,
}

/// The client's shared multiplexed session, created on first use.
#[derive(Clone)]
pub struct MultiplexedSession {
    inner: Arc<MultiplexedInner>,
}

impl MultiplexedSession {
    pub fn new(
        rpc: Arc<dyn Rpc>,
        ids: Arc<RequestIdGenerator>,
        database_role: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(MultiplexedInner {
                rpc,
                ids,
                database_role,
                slot: Mutex::new(None),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<Session>>> {
        self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the session, creating it if there is none yet.
    ///
    /// Creation happens under the slot lock, so concurrent first callers wait for
    /// a single `CreateSession`. A failed creation leaves the slot empty and the
    /// next call tries again.
    pub fn get(&self) -> Result<Arc<Session>> {
        let mut slot = self.lock();
        if let Some(session) = slot.as_ref() {
            return Ok(Arc::clone(session));
        }

        let call = CallContext::new(self.inner.ids.next_request().next_rpc(), None);
        let request = CreateSessionRequest {
            multiplexed: true,
            database_role: self.inner.database_role.clone(),
        };
        let info = self
            .inner
            .rpc
            .create_session(&call, request)
            .map_err(|status| status.with_request_id(&call.request_id))?;

        info!("created multiplexed session {}", info.name);
        let mut session = Session::new(info.name, true);
        session.mark(SessionState::InUse);
        let session = Arc::new(session);
        *slot = Some(Arc::clone(&session));
        Ok(session)
    }

    pub fn current(&self) -> Option<Arc<Session>> {
        self.lock().clone()
    }

    /// Drops the session if it is still the current one.
    pub fn invalidate(&self, name: &SessionName) {
        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|session| session.name() == name) {
            warn!("multiplexed session {name} no longer exists; recreating on next use");
            *slot = None;
        }
    }
}

impl fmt::Debug for MultiplexedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let current = self.current();
        f.debug_struct("MultiplexedSession")
            .field("session", &current.as_ref().map(|s| s.name()))
            .finish()
    }
}

/// Routes each operation to the pool or to the multiplexed session.
#[derive(Debug, Clone)]
pub struct SessionFactory {
    pool: SessionPool,
    multiplexed: MultiplexedSession,
    toggles: MultiplexedConfig,
}

impl SessionFactory {
    pub fn new(pool: SessionPool, multiplexed: MultiplexedSession, toggles: MultiplexedConfig) -> Self {
        Self {
            pool,
            multiplexed,
            toggles,
        }
    }

    pub fn uses_multiplexed(&self, op: OperationKind) -> bool {
        match op {
            OperationKind::Read => self.toggles.reads,
            OperationKind::ReadWrite | OperationKind::BatchWrite => self.toggles.read_write,
            OperationKind::Partitioned => self.toggles.partitioned,
        }
    }

    /// A session for `op`. Pool waits are bounded by `deadline`.
    #[track_caller]
    pub fn session(&self, op: OperationKind, deadline: Option<Instant>) -> Result<SessionHandle> {
        self.session_for(op, deadline, Location::caller())
    }

    /// Like [`session`](SessionFactory::session), with the holder site given
    /// explicitly for sessions taken after the caller's frame has returned.
    pub(crate) fn session_for(
        &self,
        op: OperationKind,
        deadline: Option<Instant>,
        location: &'static Location<'static>,
    ) -> Result<SessionHandle> {
        if self.uses_multiplexed(op) {
            let session = self.multiplexed.get()?;
            debug!("{op:?} operation on multiplexed session {}", session.name());
            return Ok(SessionHandle::Multiplexed {
                session,
                owner: self.multiplexed.clone(),
            });
        }
        self.pool
            .acquire_for(op.session_kind(), deadline, location)
            .map(SessionHandle::Pooled)
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub fn multiplexed(&self) -> &MultiplexedSession {
        &self.multiplexed
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Barrier, thread};

    use super::*;
    use crate::{
        config::PoolConfig,
        error::Status,
        mock::{Method, MockRpc},
        request_id::ClientContext,
    };

    fn factory(mock: &Arc<MockRpc>, toggles: MultiplexedConfig) -> SessionFactory {
        let ids = Arc::new(ClientContext::new().new_client(1));
        let config = PoolConfig {
            min: 0,
            max: 2,
            inc_step: 1,
            ..PoolConfig::default()
        };
        let pool = SessionPool::open(mock.clone(), Arc::clone(&ids), config).unwrap();
        let multiplexed = MultiplexedSession::new(mock.clone(), ids, None);
        SessionFactory::new(pool, multiplexed, toggles)
    }

    #[test]
    fn toggles_route_each_operation_class() {
        let mock = MockRpc::new();
        let factory = factory(
            &mock,
            MultiplexedConfig {
                reads: false,
                read_write: true,
                partitioned: false,
            },
        );

        assert!(!factory.uses_multiplexed(OperationKind::Read));
        assert!(factory.uses_multiplexed(OperationKind::ReadWrite));
        assert!(factory.uses_multiplexed(OperationKind::BatchWrite));
        assert!(!factory.uses_multiplexed(OperationKind::Partitioned));

        let read = factory.session(OperationKind::Read, None).unwrap();
        assert!(!read.is_multiplexed());
        let write = factory.session(OperationKind::ReadWrite, None).unwrap();
        assert!(write.is_multiplexed());
        assert_eq!(factory.pool().status().borrowed, 1);
    }

    #[test]
    fn concurrent_first_users_share_one_creation() {
        let mock = MockRpc::new();
        let factory = factory(
            &mock,
            MultiplexedConfig {
                reads: true,
                ..MultiplexedConfig::default()
            },
        );

        let barrier = Arc::new(Barrier::new(8));
        let names = (0..8)
            .map(|_| {
                let factory = factory.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    factory
                        .session(OperationKind::Read, None)
                        .map(|handle| handle.name().clone())
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|t| t.join().unwrap().unwrap())
            .collect::<Vec<_>>();

        assert_eq!(mock.calls(Method::CreateSession), 1);
        assert!(names.iter().all(|name| name == &names[0]));
    }

    #[test]
    fn failed_creation_is_retried_on_next_use() {
        let mock = MockRpc::new();
        let factory = factory(
            &mock,
            MultiplexedConfig {
                partitioned: true,
                ..MultiplexedConfig::default()
            },
        );
        mock.fail_next(Method::CreateSession, Status::unavailable("try later"));

        let err = factory.session(OperationKind::Partitioned, None).unwrap_err();
        assert!(err.is_transient());
        assert!(factory.multiplexed().current().is_none());

        assert!(factory.session(OperationKind::Partitioned, None).is_ok());
        assert_eq!(mock.calls(Method::CreateSession), 2);
        assert_eq!(factory.pool().status().size, 0);
    }

    #[test]
    fn invalidated_multiplexed_session_is_recreated() {
        let mock = MockRpc::new();
        let factory = factory(
            &mock,
            MultiplexedConfig {
                read_write: true,
                ..MultiplexedConfig::default()
            },
        );

        let mut handle = factory.session(OperationKind::ReadWrite, None).unwrap();
        let first = handle.name().clone();
        handle.mark_invalid();
        drop(handle);

        let second = factory.session(OperationKind::ReadWrite, None).unwrap();
        assert_ne!(second.name(), &first);
        assert!(second.is_multiplexed());
    }
}
