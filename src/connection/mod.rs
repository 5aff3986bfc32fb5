pub mod config;
pub mod pool;

pub use config::ConnectionConfig;
pub use pool::{ConnectionPool, PoolStats};

use crate::core::{Result, Row, Value};
use async_trait::async_trait;

/// Result of one executed statement.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecuteResult {
    Rows(Vec<Row>),
    Count(u64),
}

impl ExecuteResult {
    /// Affected rows for writes, returned rows for queries.
    pub fn row_count(&self) -> u64 {
        match self {
            Self::Rows(rows) => rows.len() as u64,
            Self::Count(count) => *count,
        }
    }

    pub fn into_rows(self) -> Vec<Row> {
        match self {
            Self::Rows(rows) => rows,
            Self::Count(_) => Vec::new(),
        }
    }
}

/// Non-blocking database connection.
#[async_trait]
pub trait Connection: Send {
    /// Connection ID
    fn id(&self) -> u64;

    /// Execute one statement with positional bind parameters
    async fn execute(&mut self, sql: &str, parameters: &[Value]) -> Result<ExecuteResult>;

    /// Hand the connection back to whoever provided it
    async fn release(self: Box<Self>);
}

/// Source of connections for the mutation executor.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn Connection>>;
}

/// Opens physical connections for a [`ConnectionPool`].
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>>;
}
