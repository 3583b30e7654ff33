//! Client configuration.
//!
//! Configuration is read once, when a client is constructed. Each setting can be
//! given as a long flag or through its `KEEL_*` environment variable, so an
//! embedding binary can flatten [`ClientConfig`] into its own command line or
//! call [`ClientConfig::from_env`].
use std::time::Duration;

use clap::{Args, Parser};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("max_sessions must be greater than 0")]
    ZeroMax,

    #[error("min_sessions ({min}) exceeds max_sessions ({max})")]
    MinExceedsMax { min: usize, max: usize },

    #[error("inc_step must be greater than 0")]
    ZeroIncStep,

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// Sizing and behaviour of the session pool.
#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct PoolConfig {
    /// Sessions created when the pool opens and kept through idle eviction.
    #[arg(long = "min-sessions", env = "KEEL_MIN_SESSIONS", default_value_t = 25)]
    pub min: usize,

    /// Upper bound on sessions owned by the pool.
    #[arg(long = "max-sessions", env = "KEEL_MAX_SESSIONS", default_value_t = 100)]
    pub max: usize,

    /// Sessions requested per creation batch.
    #[arg(long = "inc-step", env = "KEEL_INC_STEP", default_value_t = 25)]
    pub inc_step: usize,

    /// Fail immediately instead of waiting when every session is borrowed.
    #[arg(long = "fail-fast", env = "KEEL_FAIL_FAST")]
    pub fail_fast: bool,

    /// Longest wait for a session; waits forever when unset.
    #[arg(long = "acquire-timeout-ms", env = "KEEL_ACQUIRE_TIMEOUT_MS")]
    pub acquire_timeout_ms: Option<u64>,

    /// Idle time after which sessions above `min` are deleted.
    #[arg(long = "idle-timeout-ms", env = "KEEL_IDLE_TIMEOUT_MS", default_value_t = 600_000)]
    pub idle_timeout_ms: u64,

    /// Idle time after which a session is pinged to keep it alive.
    #[arg(long = "keep-alive-ms", env = "KEEL_KEEP_ALIVE_MS", default_value_t = 1_800_000)]
    pub keep_alive_ms: u64,

    /// Database role the pooled sessions are created with.
    #[arg(long = "database-role", env = "KEEL_DATABASE_ROLE")]
    pub database_role: Option<String>,
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max == 0 {
            return Err(ConfigError::ZeroMax);
        }
        if self.min > self.max {
            return Err(ConfigError::MinExceedsMax {
                min: self.min,
                max: self.max,
            });
        }
        if self.inc_step == 0 {
            return Err(ConfigError::ZeroIncStep);
        }
        Ok(())
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 25,
            max: 100,
            inc_step: 25,
            fail_fast: false,
            acquire_timeout_ms: None,
            idle_timeout_ms: 600_000,
            keep_alive_ms: 1_800_000,
            database_role: None,
        }
    }
}

/// Which operation classes run on the shared multiplexed session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Args)]
pub struct MultiplexedConfig {
    /// Single-use reads and queries.
    #[arg(long = "multiplexed-reads", env = "KEEL_MULTIPLEXED_SESSIONS")]
    pub reads: bool,

    /// Read-write transactions and blind writes.
    #[arg(long = "multiplexed-read-write", env = "KEEL_MULTIPLEXED_SESSIONS_FOR_RW")]
    pub read_write: bool,

    /// Partitioned DML.
    #[arg(
        long = "multiplexed-partitioned",
        env = "KEEL_MULTIPLEXED_SESSIONS_PARTITIONED_OPS"
    )]
    pub partitioned: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Parser)]
#[command(name = "keel", about = "keel client settings")]
pub struct ClientConfig {
    #[command(flatten)]
    pub pool: PoolConfig,

    #[command(flatten)]
    pub multiplexed: MultiplexedConfig,

    /// Channel the client's requests are attributed to.
    #[arg(long = "channel-id", env = "KEEL_CHANNEL_ID", default_value_t = 1)]
    pub channel_id: u32,

    /// Budget for a single-use query, including transparent retries.
    #[arg(long = "query-timeout-ms", env = "KEEL_QUERY_TIMEOUT_MS", default_value_t = 3_600_000)]
    pub query_timeout_ms: u64,
}

impl ClientConfig {
    /// Reads the configuration from `KEEL_*` environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_args(["keel"])
    }

    /// Parses flags (first item is the program name), falling back to the environment.
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let config =
            Self::try_parse_from(args).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            multiplexed: MultiplexedConfig::default(),
            channel_id: 1,
            query_timeout_ms: 3_600_000,
        }
    }
}
