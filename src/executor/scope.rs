use crate::connection::{Connection, ExecuteResult};
use crate::core::{PersistError, Result, Value};
use log::warn;
use tokio::runtime::Handle;

/// Holds one acquired connection for a single round trip.
///
/// `release` hands the connection back. If the scope is dropped without it
/// (the future was cancelled or a step panicked) the release is spawned on
/// the current runtime instead.
pub struct ConnectionScope {
    connection: Option<Box<dyn Connection>>,
}

impl ConnectionScope {
    pub fn new(connection: Box<dyn Connection>) -> Self {
        Self {
            connection: Some(connection),
        }
    }

    pub async fn execute(&mut self, sql: &str, parameters: &[Value]) -> Result<ExecuteResult> {
        match self.connection.as_mut() {
            Some(connection) => connection.execute(sql, parameters).await,
            None => Err(PersistError::IllegalState(
                "Connection scope already released".to_string(),
            )),
        }
    }

    pub async fn release(mut self) {
        if let Some(connection) = self.connection.take() {
            connection.release().await;
        }
    }
}

impl Drop for ConnectionScope {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            match Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(connection.release());
                }
                Err(_) => warn!(
                    "Connection {} dropped outside a runtime and was not released",
                    connection.id()
                ),
            }
        }
    }
}
