//! Streamed result decoding.
//!
//! Reads and queries return their rows as a sequence of [`PartialResultSet`]
//! messages. Message boundaries are unrelated to row boundaries: a row may span
//! several messages and a single string or list value may be split between
//! two of them. This module turns such a sequence back into [`Row`]s.
//!
//! # Resumption
//!
//! Some messages carry a resume token. When the stream breaks with a transient
//! error, [`RowStream`] re-opens the call from the last token and rewinds its
//! decoder to the state it had at that token. Rows completed after the last
//! token are held back until the next token arrives, so a caller never sees a
//! row twice. Holding back is bounded by [`MAX_BUFFERED_MESSAGES`]; past that
//! the held rows are released and the stream cannot be resumed until the next
//! token.
//!
//! # Backpressure
//!
//! [`RowStream`] is a pull-based [`Iterator`]: the underlying call is only read
//! when the caller asks for another row. [`RowStream::into_channel`] moves the
//! stream onto a producer thread feeding a bounded channel.
//!
//! [`PartialResultSet`]: crate::protocol::PartialResultSet
mod chunk;
mod decoder;
mod resume;

use std::sync::Arc;

use crate::value::{Field, Value};

pub use resume::{MAX_BUFFERED_MESSAGES, RowStream, StreamSource};

/// One decoded row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    fields: Arc<[Field]>,
    values: Vec<Value>,
}

impl Row {
    pub(crate) fn new(fields: Arc<[Field]>, values: Vec<Value>) -> Self {
        Self { fields, values }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Value of the first column named `name`.
    pub fn column(&self, name: &str) -> Option<&Value> {
        let index = self.fields.iter().position(|field| field.name == name)?;
        self.values.get(index)
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}
