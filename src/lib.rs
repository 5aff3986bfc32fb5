// ============================================================================
// rxorm
// ============================================================================

//! Asynchronous entity lifecycle over non-blocking connections.
//!
//! A [`Session`] turns `persist`, `find`, `remove`, `merge` and `flush` into
//! queued SQL actions and returns a [`CompletionHandle`] immediately. Actions
//! run in order on pooled connections; inserts whose rows reference each
//! other run parents first, deletes run children first.
//!
//! ```
//! use rxorm::prelude::*;
//! use std::sync::Arc;
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Pig {
//!     id: Option<i64>,
//!     name: String,
//! }
//!
//! impl Entity for Pig {
//!     fn descriptor() -> EntityDescriptor {
//!         EntityDescriptor::builder("Pig", "pig")
//!             .id("id", DataType::Integer)
//!             .column("name", DataType::Text)
//!             .build()
//!             .expect("valid mapping")
//!     }
//!     fn identifier(&self) -> Option<Value> {
//!         self.id.map(Value::Integer)
//!     }
//!     fn set_identifier(&mut self, id: Value) {
//!         self.id = id.as_i64();
//!     }
//!     fn columns(&self) -> Vec<(&'static str, Value)> {
//!         vec![("name", Value::Text(self.name.clone()))]
//!     }
//!     fn from_row(row: &Row) -> Result<Self> {
//!         Ok(Pig {
//!             id: row.require("id")?.as_i64(),
//!             name: row.require("name")?.as_str().unwrap_or_default().to_string(),
//!         })
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<()> {
//! let database = MemoryDatabase::new();
//! let factory = SessionFactory::builder()
//!     .register::<Pig>()
//!     .provider(Arc::new(database.clone()))
//!     .build()?;
//! database.create_schema(factory.metamodel())?;
//!
//! let session = factory.open_session()?;
//! session.persist(Pig { id: Some(22), name: "Mibbles".into() }).await?;
//!
//! let other = factory.open_session()?;
//! let pig = other.find::<Pig>(22).await?;
//! assert_eq!(pig.map(|p| p.name), Some("Mibbles".to_string()));
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod completion;
pub mod connection;
pub mod context;
pub mod core;
pub mod event;
pub mod executor;
pub mod memory;
pub mod metamodel;
pub mod prelude;
pub mod session;
pub mod sql;

// Re-export main types for convenience
pub use completion::{Completer, CompletionHandle};
pub use core::{DataType, EntityKey, ErrorKind, PersistError, Result, Row, Value};
pub use session::{Session, SessionFactory, Settings, StatisticsSnapshot};

// Re-export connection API
pub use connection::{
    Connection, ConnectionConfig, ConnectionManager, ConnectionPool, ConnectionProvider,
    ExecuteResult, PoolStats,
};
