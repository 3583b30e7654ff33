use crate::{error::ProtocolError, value::Value};

/// Joins a value split across two messages.
///
/// Strings concatenate. Lists concatenate, except that the left list's last
/// element and the right list's first element are themselves merged when both
/// are strings or both are lists, since that element is the one that was split.
pub(crate) fn merge(left: Value, right: Value) -> Result<Value, ProtocolError> {
    match (left, right) {
        (Value::String(mut left), Value::String(right)) => {
            left.push_str(&right);
            Ok(Value::String(left))
        }
        (Value::List(mut left), Value::List(right)) => {
            let mut right = right.into_iter();
            let Some(head) = right.next() else {
                return Ok(Value::List(left));
            };
            match left.pop() {
                Some(tail) if splittable_pair(&tail, &head) => left.push(merge(tail, head)?),
                Some(tail) => {
                    left.push(tail);
                    left.push(head);
                }
                None => left.push(head),
            }
            left.extend(right);
            Ok(Value::List(left))
        }
        (left, right) => Err(ProtocolError::IncompatibleChunks {
            left: left.kind(),
            right: right.kind(),
        }),
    }
}

fn splittable_pair(tail: &Value, head: &Value) -> bool {
    matches!(
        (tail, head),
        (Value::String(_), Value::String(_)) | (Value::List(_), Value::List(_))
    )
}
