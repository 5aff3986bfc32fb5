//! Common imports grouped by abstraction level.
//!
//! `use rxorm::prelude::*` covers mapping entities and driving sessions.
//! `advanced` holds the pieces needed to write listeners or connection
//! providers.

pub use crate::completion::CompletionHandle;
pub use crate::context::EntityStatus;
pub use crate::core::{DataType, ErrorKind, PersistError, Result, Row, Value};
pub use crate::memory::MemoryDatabase;
pub use crate::metamodel::{
    AssociationMapping, CascadeStyle, Entity, EntityDescriptor, EntityRef, IdentifierStrategy,
};
pub use crate::session::{Session, SessionFactory, Settings, StatisticsSnapshot};

pub mod advanced {
    //! Listener and connection plumbing.
    pub use crate::action::{Action, ActionId, ActionKind, ActionQueue};
    pub use crate::connection::{
        Connection, ConnectionConfig, ConnectionManager, ConnectionPool, ConnectionProvider,
        ExecuteResult,
    };
    pub use crate::event::{
        DeleteEvent, DeleteEventListener, FlushEvent, FlushEventListener, LoadEvent,
        LoadEventListener, MergeEvent, MergeEventListener, PersistEvent, PersistEventListener,
    };
    pub use crate::executor::MutationExecutor;
    pub use crate::session::SessionCore;
    pub use crate::sql::{PgStatementCompiler, StatementCompiler};
}
