//! Server-side session handles.
//!
//! Every data call is made on a session. Regular sessions are exclusive: they
//! are borrowed from the [`SessionPool`] by one operation at a time and handed
//! back when the [`PooledSession`] guard is dropped. A multiplexed session is
//! shared by every operation of a client and is never pooled.
//!
//! [`SessionFactory`] decides, per [`OperationKind`], which of the two an
//! operation runs on.
mod factory;
mod pool;

use std::{
    fmt,
    sync::Arc,
    time::Instant,
};

pub use factory::{MultiplexedSession, OperationKind, SessionFactory};
pub use pool::{PoolStatus, PooledSession, SessionPool};

/// Server-assigned session resource name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionName(String);

impl SessionName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for SessionName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// What a pooled session is borrowed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Read,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created and never borrowed.
    Fresh,
    InUse,
    /// Back in the pool after use.
    Released,
    /// Reported missing by the server.
    Invalid,
}

#[derive(Debug, Clone)]
pub struct Session {
    name: SessionName,
    multiplexed: bool,
    created_at: Instant,
    last_used: Instant,
    state: SessionState,
}

impl Session {
    pub(crate) fn new(name: SessionName, multiplexed: bool) -> Self {
        let now = Instant::now();
        Self {
            name,
            multiplexed,
            created_at: now,
            last_used: now,
            state: SessionState::Fresh,
        }
    }

    pub fn name(&self) -> &SessionName {
        &self.name
    }

    pub fn is_multiplexed(&self) -> bool {
        self.multiplexed
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn mark(&mut self, state: SessionState) {
        self.state = state;
        self.last_used = Instant::now();
    }
}

/// The session an operation runs on, as handed out by [`SessionFactory`].
#[derive(Debug)]
pub enum SessionHandle {
    Pooled(PooledSession),
    Multiplexed {
        session: Arc<Session>,
        owner: MultiplexedSession,
    },
}

impl SessionHandle {
    pub fn name(&self) -> &SessionName {
        match self {
            SessionHandle::Pooled(pooled) => pooled.name(),
            SessionHandle::Multiplexed { session, .. } => session.name(),
        }
    }

    pub fn is_multiplexed(&self) -> bool {
        matches!(self, SessionHandle::Multiplexed { .. })
    }

    /// Records that the server no longer knows this session.
    ///
    /// A pooled session is evicted when the handle is dropped; the multiplexed
    /// session is discarded immediately and recreated on next use.
    pub fn mark_invalid(&mut self) {
        match self {
            SessionHandle::Pooled(pooled) => pooled.mark_invalid(),
            SessionHandle::Multiplexed { session, owner } => owner.invalidate(session.name()),
        }
    }
}
