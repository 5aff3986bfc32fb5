//! Logical statements and the compiler seam that turns them into SQL.

pub mod compiler;

pub use compiler::{PgStatementCompiler, PlaceholderStyle};

use crate::core::{Result, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Optimistic lock condition added to updates and deletes.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionCheck {
    pub column: String,
    pub expected: i64,
}

/// Database-independent description of one statement.
#[derive(Debug, Clone, PartialEq)]
pub enum LogicalStatement {
    /// NULL values are left out of the column list.
    Insert {
        table: String,
        columns: Vec<String>,
        values: Vec<Value>,
        returning: Option<String>,
    },
    Update {
        table: String,
        assignments: Vec<(String, Value)>,
        key_column: String,
        key: Value,
        version: Option<VersionCheck>,
    },
    Delete {
        table: String,
        key_column: String,
        key: Value,
        version: Option<VersionCheck>,
    },
    Select {
        table: String,
        columns: Vec<String>,
        key_column: String,
        key: Value,
    },
}

impl LogicalStatement {
    pub fn table(&self) -> &str {
        match self {
            Self::Insert { table, .. }
            | Self::Update { table, .. }
            | Self::Delete { table, .. }
            | Self::Select { table, .. } => table,
        }
    }

    pub fn is_query(&self) -> bool {
        matches!(self, Self::Select { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledStatement {
    pub sql: String,
    pub parameters: Vec<Value>,
    pub affected_tables: BTreeSet<String>,
}

/// Turns logical statements into SQL text plus ordered bind parameters.
pub trait StatementCompiler: Send + Sync {
    fn compile(&self, statement: &LogicalStatement) -> Result<CompiledStatement>;
}
