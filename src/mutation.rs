//! Blind writes buffered by a transaction and sent with its commit.
use crate::value::Value;

/// Rows to write into one table.
#[derive(Debug, Clone, PartialEq)]
pub struct Write {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Write {
    pub fn new<C, S>(table: impl Into<String>, columns: C) -> Self
    where
        C: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            table: table.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn row(mut self, values: Vec<Value>) -> Self {
        self.rows.push(values);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyRange {
    pub start: Vec<Value>,
    pub start_closed: bool,
    pub end: Vec<Value>,
    pub end_closed: bool,
}

/// Rows addressed by primary key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeySet {
    pub keys: Vec<Vec<Value>>,
    pub ranges: Vec<KeyRange>,
    pub all: bool,
}

impl KeySet {
    pub fn all() -> Self {
        Self {
            all: true,
            ..Self::default()
        }
    }

    pub fn keys<I>(keys: I) -> Self
    where
        I: IntoIterator<Item = Vec<Value>>,
    {
        Self {
            keys: keys.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn range(mut self, range: KeyRange) -> Self {
        self.ranges.push(range);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Insert(Write),
    Update(Write),
    InsertOrUpdate(Write),
    Replace(Write),
    Delete { table: String, key_set: KeySet },
}

impl Mutation {
    pub fn table(&self) -> &str {
        match self {
            Mutation::Insert(w)
            | Mutation::Update(w)
            | Mutation::InsertOrUpdate(w)
            | Mutation::Replace(w) => &w.table,
            Mutation::Delete { table, .. } => table,
        }
    }

    /// Number of rows the mutation touches; an "all" key set counts as one.
    pub fn row_count(&self) -> usize {
        match self {
            Mutation::Insert(w)
            | Mutation::Update(w)
            | Mutation::InsertOrUpdate(w)
            | Mutation::Replace(w) => w.rows.len(),
            Mutation::Delete { key_set, .. } => {
                key_set.keys.len() + key_set.ranges.len() + usize::from(key_set.all)
            }
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Mutation::Insert(_))
    }
}

/// Picks the mutation that routes the begin of a mutation-only transaction.
///
/// Non-insert mutations are preferred over inserts; within the preferred group
/// the mutation touching the most rows wins, and ties go to the earliest one.
pub fn select_mutation_key(mutations: &[Mutation]) -> Option<&Mutation> {
    let preferred = mutations.iter().filter(|m| !m.is_insert());
    let candidates: Vec<&Mutation> = if mutations.iter().any(|m| !m.is_insert()) {
        preferred.collect()
    } else {
        mutations.iter().collect()
    };

    candidates
        .into_iter()
        .enumerate()
        .max_by(|(ia, a), (ib, b)| a.row_count().cmp(&b.row_count()).then(ib.cmp(ia)))
        .map(|(_, m)| m)
}
