pub mod backoff;
pub mod config;
pub mod database;
pub mod error;
pub mod mutation;
pub mod protocol;
pub mod request_id;
pub mod session;
pub mod statement;
pub mod stream;
pub mod transaction;
pub mod value;

#[cfg(test)]
pub(crate) mod mock;

pub use backoff::Backoff;
pub use config::{ClientConfig, MultiplexedConfig, PoolConfig};
pub use database::Database;
pub use error::{Code, Error, ProtocolError, Result, Status};
pub use mutation::{KeySet, Mutation, Write};
pub use request_id::{ClientContext, RequestId};
pub use statement::Statement;
pub use stream::{Row, RowStream};
pub use transaction::{Transaction, TransactionOptions};
pub use value::Value;
