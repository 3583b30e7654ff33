use std::{mem, sync::Arc};

use log::trace;

use crate::{
    error::ProtocolError,
    protocol::PartialResultSet,
    value::{Field, Value},
};

use super::{Row, chunk};

/// Values gathered toward the next row.
#[derive(Debug, Clone, Default)]
struct Accumulator {
    settled: Vec<Value>,
    /// Incomplete last value, continued by the next message.
    pending: Option<Value>,
}

/// Reassembles rows from partial result messages.
///
/// The decoder keeps a checkpoint of its accumulator at the last resume token
/// so that a resumed stream can continue from exactly that position.
#[derive(Debug, Default)]
pub(crate) struct Decoder {
    fields: Option<Arc<[Field]>>,
    current: Accumulator,
    checkpoint: Accumulator,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> Option<&Arc<[Field]>> {
        self.fields.as_ref()
    }

    /// Consumes one message and returns the rows it completed.
    pub fn push(&mut self, message: PartialResultSet) -> Result<Vec<Row>, ProtocolError> {
        if self.fields.is_none() {
            let metadata = message.metadata.ok_or(ProtocolError::MissingMetadata)?;
            self.fields = Some(metadata.row_type.into());
        }
        let Some(fields) = self.fields.clone() else {
            return Err(ProtocolError::MissingMetadata);
        };
        let width = fields.len();

        let count = message.values.len();
        let mut rows = Vec::new();
        for (i, value) in message.values.into_iter().enumerate() {
            let value = match self.current.pending.take() {
                Some(tail) => chunk::merge(tail, value)?,
                None => value,
            };
            if message.chunked_value && i + 1 == count {
                self.current.pending = Some(value);
                break;
            }

            self.current.settled.push(value);
            if width > 0 && self.current.settled.len() == width {
                let values = mem::take(&mut self.current.settled);
                rows.push(Row::new(Arc::clone(&fields), values));
            }
        }

        trace!(
            "decoded {} row(s) from {count} value(s); {} settled, pending={}",
            rows.len(),
            self.current.settled.len(),
            self.current.pending.is_some()
        );
        Ok(rows)
    }

    /// Records the current position as the one a resumed stream starts from.
    pub fn checkpoint(&mut self) {
        self.checkpoint = self.current.clone();
    }

    /// Rewinds to the last checkpoint.
    pub fn restore(&mut self) {
        self.current = self.checkpoint.clone();
    }

    /// Checks that the stream did not end inside a row or a value.
    pub fn finish(&self) -> Result<(), ProtocolError> {
        if self.current.pending.is_some() {
            return Err(ProtocolError::DanglingChunk);
        }
        if !self.current.settled.is_empty() {
            return Err(ProtocolError::IncompleteRow(self.current.settled.len()));
        }
        Ok(())
    }
}
