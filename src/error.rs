//! Error types surfaced by the client runtime.
//!
//! Every remote call fails with a [`Status`]: a [`Code`], a message, an optional
//! server retry-delay hint and the request identity of the call that failed.
//! Everything above the RPC boundary is expressed as [`Error`], which wraps the
//! final [`Status`] together with client-side failures (pool exhaustion, leaks,
//! deadlines, protocol violations).
//!
//! Retries are internal: only the outcome of the last attempt crosses the public
//! boundary, so callers usually only need [`Error::code`] or one of the
//! classification helpers ([`Error::is_aborted`], [`Error::is_session_not_found`]).
use std::{fmt, panic::Location, time::Duration};

use thiserror::Error;

use crate::{config::ConfigError, request_id::RequestId, session::SessionName};

/// Message prefix the server uses when a session handle no longer exists.
pub(crate) const SESSION_NOT_FOUND: &str = "Session not found";

/// INTERNAL statuses that are really transport resets and safe to retry.
const RETRYABLE_INTERNAL: [&str; 3] = [
    "Received unexpected EOS on DATA frame from server",
    "RST_STREAM",
    "Received RST_STREAM",
];

pub type Result<T> = std::result::Result<T, Error>;

/// Canonical status codes reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
            Code::Unauthenticated => "UNAUTHENTICATED",
        };
        f.write_str(name)
    }
}

/// Failure reported by a remote call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}{}", request_suffix(.request_id))]
pub struct Status {
    pub code: Code,
    pub message: String,
    /// Server hint for how long to wait before retrying.
    pub retry_delay: Option<Duration>,
    /// Identity of the call that failed.
    pub request_id: Option<RequestId>,
}

fn request_suffix(request_id: &Option<RequestId>) -> String {
    match request_id {
        Some(id) => format!(" (request {id})"),
        None => String::new(),
    }
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_delay: None,
            request_id: None,
        }
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(Code::Aborted, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    /// The status the server returns for a session it no longer knows about.
    pub fn session_not_found(session: &SessionName) -> Self {
        Self::new(
            Code::NotFound,
            format!("{SESSION_NOT_FOUND}: {session}"),
        )
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Attaches the identity of the failing call unless the transport already did.
    pub fn with_request_id(mut self, id: &RequestId) -> Self {
        if self.request_id.is_none() {
            self.request_id = Some(id.clone());
        }
        self
    }

    pub fn is_session_not_found(&self) -> bool {
        self.code == Code::NotFound && self.message.starts_with(SESSION_NOT_FOUND)
    }

    /// Transport-level failures that can be retried on the same session.
    pub fn is_transient(&self) -> bool {
        match self.code {
            Code::Unavailable => true,
            Code::Internal => RETRYABLE_INTERNAL
                .iter()
                .any(|needle| self.message.contains(needle)),
            _ => false,
        }
    }
}

/// A borrowed session that had not been returned when a diagnosis was taken.
#[derive(Debug, Clone)]
pub struct SessionHolder {
    pub session: SessionName,
    pub acquired_at: &'static Location<'static>,
    pub held_for: Duration,
}

impl fmt::Display for SessionHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} acquired at {}:{} (held {:?})",
            self.session,
            self.acquired_at.file(),
            self.acquired_at.line(),
            self.held_for
        )
    }
}

/// Outstanding holders attached to exhaustion, timeout and leak errors.
#[derive(Debug, Clone, Default)]
pub struct Holders(pub Vec<SessionHolder>);

impl Holders {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SessionHolder> {
        self.0.iter()
    }
}

impl fmt::Display for Holders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("none");
        }
        for (i, holder) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{holder}")?;
        }
        Ok(())
    }
}

/// Violations of the wire contract. These are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("cannot merge chunked {left} value with {right} value")]
    IncompatibleChunks {
        left: &'static str,
        right: &'static str,
    },

    #[error("first result message carried no row metadata")]
    MissingMetadata,

    #[error("stream ended with {0} value(s) of an incomplete row")]
    IncompleteRow(usize),

    #[error("stream ended inside a chunked value")]
    DanglingChunk,

    #[error("commit requested a second precommit-token retry")]
    RepeatedCommitRetry,

    #[error("inline begin returned no transaction id")]
    MissingTransactionId,

    #[error("DML statement returned no exact row count")]
    MissingRowCount,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("rpc failed: {0}")]
    Status(#[from] Status),

    #[error("session pool exhausted (max={max}); outstanding: {holders}")]
    PoolExhausted { max: usize, holders: Holders },

    #[error("timed out after {waited:?} waiting for a session (max={max}); outstanding: {holders}")]
    AcquireTimeout {
        waited: Duration,
        max: usize,
        holders: Holders,
    },

    #[error("{} session(s) leaked: {holders}", .holders.len())]
    SessionLeak { holders: Holders },

    #[error("session pool is closed")]
    PoolClosed,

    #[error("deadline exceeded after {attempts} attempt(s){}", last_failure(.last))]
    DeadlineExceeded {
        attempts: u32,
        last: Option<Box<Error>>,
    },

    #[error("batch update failed at statement {index}: {status}")]
    BatchUpdate {
        index: usize,
        row_counts: Vec<i64>,
        status: Status,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("application error: {0}")]
    Application(Box<dyn std::error::Error + Send + Sync>),
}

fn last_failure(last: &Option<Box<Error>>) -> String {
    match last {
        Some(err) => format!("; last failure: {err}"),
        None => String::new(),
    }
}

impl Error {
    /// Wraps an error raised by caller code inside a transaction function.
    pub fn application<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Application(Box::new(err))
    }

    /// Server status behind this error, if it came from a remote call.
    pub fn status(&self) -> Option<&Status> {
        match self {
            Error::Status(status) | Error::BatchUpdate { status, .. } => Some(status),
            _ => None,
        }
    }

    pub fn code(&self) -> Option<Code> {
        match self {
            Error::DeadlineExceeded { .. } => Some(Code::DeadlineExceeded),
            Error::PoolExhausted { .. } => Some(Code::ResourceExhausted),
            _ => self.status().map(|status| status.code),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.status().is_some_and(|s| s.code == Code::Aborted)
    }

    pub fn is_session_not_found(&self) -> bool {
        self.status().is_some_and(Status::is_session_not_found)
    }

    pub fn is_transient(&self) -> bool {
        self.status().is_some_and(Status::is_transient)
    }

    pub fn retry_delay(&self) -> Option<Duration> {
        self.status().and_then(|s| s.retry_delay)
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Error::DeadlineExceeded { last: Some(last), .. } => last.request_id(),
            _ => self.status().and_then(|s| s.request_id.as_ref()),
        }
    }
}
