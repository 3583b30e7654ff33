use std::collections::BTreeMap;

use crate::value::{TypeCode, Value};

/// SQL text plus named parameters. The text is passed to the server untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: BTreeMap<String, Value>,
    pub param_types: BTreeMap<String, TypeCode>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            ..Self::default()
        }
    }

    /// Binds `@name` to a value whose type the server infers.
    pub fn bind(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Binds `@name` with an explicit type, needed for NULLs and ambiguous strings.
    pub fn bind_typed(
        mut self,
        name: impl Into<String>,
        value: impl Into<Value>,
        type_code: TypeCode,
    ) -> Self {
        let name = name.into();
        self.param_types.insert(name.clone(), type_code);
        self.params.insert(name, value.into());
        self
    }
}

impl From<&str> for Statement {
    fn from(value: &str) -> Self {
        Statement::new(value)
    }
}

impl From<String> for Statement {
    fn from(value: String) -> Self {
        Statement::new(value)
    }
}
