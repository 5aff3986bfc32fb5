use super::{PersistError, Result, Value};
use std::fmt;
use std::sync::Arc;

/// One result row: column names shared across the row set, values by position.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        let (columns, values): (Vec<String>, Vec<Value>) =
            pairs.into_iter().map(|(c, v)| (c.into(), v)).unzip();
        Self {
            columns: columns.into(),
            values,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .and_then(|idx| self.values.get(idx))
    }

    /// Like [`Row::get`] but reports a missing column as a mapping error.
    pub fn require(&self, column: &str) -> Result<&Value> {
        self.get(column).ok_or_else(|| {
            PersistError::MappingConfiguration(format!(
                "Column '{}' missing from row ({})",
                column,
                self.columns.join(", ")
            ))
        })
    }
}

/// Identity of one row: entity name plus identifier value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    entity: Arc<str>,
    id: Value,
}

impl EntityKey {
    pub fn new(entity: impl Into<Arc<str>>, id: Value) -> Self {
        Self {
            entity: entity.into(),
            id,
        }
    }

    pub fn entity_name(&self) -> &str {
        &self.entity
    }

    pub fn id(&self) -> &Value {
        &self.id
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.id)
    }
}
