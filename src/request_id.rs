//! Structured request identities.
//!
//! Every outbound call carries an identifier of the form
//! `<clientId>.<processRandom>.<channelId>.<requestGeneration>.<rpcOrdinal>.<attempt>`
//! so that the server can deduplicate retried calls and operators can correlate a
//! failure with the exact call that produced it.
//!
//! - `processRandom` is drawn once per process and lives in [`ClientContext`].
//! - `clientId` numbers the clients created from that context.
//! - `requestGeneration` increments for every logical call a client makes.
//! - `rpcOrdinal` increments for every RPC issued within a logical call.
//! - `attempt` increments when the same RPC is re-sent.
use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

use rand::Rng;

/// Metadata key the identity is sent under.
pub const REQUEST_ID_HEADER: &str = "x-keel-request-id";

/// Random identifier for the current process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(u64);

impl ProcessId {
    pub fn random() -> Self {
        Self(rand::rng().random())
    }

    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Process-wide state shared by every client.
///
/// Create one at startup and hand it to each [`Database`](crate::Database) that is
/// opened, rather than reading a global from call sites.
#[derive(Debug)]
pub struct ClientContext {
    process: ProcessId,
    next_client: AtomicU32,
}

impl ClientContext {
    pub fn new() -> Self {
        Self::with_process_id(ProcessId::random())
    }

    pub fn with_process_id(process: ProcessId) -> Self {
        Self {
            process,
            next_client: AtomicU32::new(1),
        }
    }

    pub fn process_id(&self) -> ProcessId {
        self.process
    }

    /// Reserves the identity space for a new client on `channel_id`.
    pub fn new_client(&self, channel_id: u32) -> RequestIdGenerator {
        let client_id = self.next_client.fetch_add(1, Ordering::SeqCst);
        RequestIdGenerator {
            client_id,
            process: self.process,
            channel_id,
            next_request: AtomicU64::new(1),
        }
    }
}

impl Default for ClientContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-client source of [`RequestScope`]s.
#[derive(Debug)]
pub struct RequestIdGenerator {
    client_id: u32,
    process: ProcessId,
    channel_id: u32,
    next_request: AtomicU64,
}

impl RequestIdGenerator {
    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    /// Starts a new logical call.
    pub fn next_request(&self) -> RequestScope {
        let generation = self.next_request.fetch_add(1, Ordering::SeqCst);
        RequestScope {
            client_id: self.client_id,
            process: self.process,
            channel_id: self.channel_id,
            generation,
            next_rpc: AtomicU32::new(1),
        }
    }
}

/// Identities for the RPCs of one logical call.
#[derive(Debug)]
pub struct RequestScope {
    client_id: u32,
    process: ProcessId,
    channel_id: u32,
    generation: u64,
    next_rpc: AtomicU32,
}

impl RequestScope {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Identity for the next RPC of this call, first attempt.
    pub fn next_rpc(&self) -> RequestId {
        let rpc = self.next_rpc.fetch_add(1, Ordering::SeqCst);
        RequestId {
            client_id: self.client_id,
            process: self.process,
            channel_id: self.channel_id,
            generation: self.generation,
            rpc,
            attempt: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId {
    pub client_id: u32,
    pub process: ProcessId,
    pub channel_id: u32,
    pub generation: u64,
    pub rpc: u32,
    pub attempt: u32,
}

impl RequestId {
    /// The same RPC, sent again.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}.{}.{}",
            self.client_id, self.process, self.channel_id, self.generation, self.rpc, self.attempt
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed request id '{0}'")]
pub struct ParseRequestIdError(String);

impl FromStr for RequestId {
    type Err = ParseRequestIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ParseRequestIdError(s.to_string());
        let parts = s.split('.').collect::<Vec<&str>>();
        if parts.len() != 6 {
            return Err(malformed());
        }

        Ok(RequestId {
            client_id: parts[0].parse().map_err(|_| malformed())?,
            process: ProcessId(u64::from_str_radix(parts[1], 16).map_err(|_| malformed())?),
            channel_id: parts[2].parse().map_err(|_| malformed())?,
            generation: parts[3].parse().map_err(|_| malformed())?,
            rpc: parts[4].parse().map_err(|_| malformed())?,
            attempt: parts[5].parse().map_err(|_| malformed())?,
        })
    }
}
