use thiserror::Error;

/// Every failure a session operation can report through its completion handle.
///
/// Errors are `Clone` because one database failure may have to reach several
/// observers: the action's own handle, the event that scheduled it and the
/// flush that executed it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PersistError {
    #[error("Identifier generation failed for '{entity}': {message}")]
    IdentifierGeneration { entity: String, message: String },

    #[error("Entity '{entity}' with id {id} is already managed by this session")]
    DuplicateEntity { entity: String, id: String },

    #[error("Transient object of type '{entity}': {message}")]
    TransientObject { entity: String, message: String },

    #[error("No row of '{entity}' with id {id}")]
    EntityNotFound { entity: String, id: String },

    #[error("Mapping error: {0}")]
    MappingConfiguration(String),

    #[error("Database execution error: {message}")]
    DatabaseExecution {
        message: String,
        sql: Option<String>,
    },

    #[error("Connection unavailable: {0}")]
    ConnectionUnavailable(String),

    #[error("Row of '{entity}' with id {id} was updated or deleted by another transaction")]
    OptimisticLock { entity: String, id: String },

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Flush failed: {failed} of {total} actions failed, first: {first}")]
    FlushFailed {
        failed: usize,
        total: usize,
        first: Box<PersistError>,
    },

    #[error("Session is closed")]
    SessionClosed,

    #[error("Completion abandoned before it was settled: {0}")]
    Abandoned(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Coarse classification of [`PersistError`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    IdentifierGeneration,
    DuplicateEntity,
    TransientObject,
    EntityNotFound,
    MappingConfiguration,
    DatabaseExecution,
    IllegalState,
    Lifecycle,
    Configuration,
}

impl PersistError {
    pub fn database(message: impl Into<String>) -> Self {
        Self::DatabaseExecution {
            message: message.into(),
            sql: None,
        }
    }

    pub fn database_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::DatabaseExecution {
            message: message.into(),
            sql: Some(sql.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IdentifierGeneration { .. } => ErrorKind::IdentifierGeneration,
            Self::DuplicateEntity { .. } => ErrorKind::DuplicateEntity,
            Self::TransientObject { .. } => ErrorKind::TransientObject,
            Self::EntityNotFound { .. } => ErrorKind::EntityNotFound,
            Self::MappingConfiguration(_) => ErrorKind::MappingConfiguration,
            Self::DatabaseExecution { .. }
            | Self::ConnectionUnavailable(_)
            | Self::OptimisticLock { .. } => ErrorKind::DatabaseExecution,
            Self::FlushFailed { first, .. } => first.kind(),
            Self::IllegalState(_) => ErrorKind::IllegalState,
            Self::SessionClosed | Self::Abandoned(_) => ErrorKind::Lifecycle,
            Self::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// True for failures reported by the connection provider or the database.
    pub fn is_database_error(&self) -> bool {
        self.kind() == ErrorKind::DatabaseExecution
    }
}

pub type Result<T> = std::result::Result<T, PersistError>;

impl<T> From<std::sync::PoisonError<T>> for PersistError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::IllegalState(err.to_string())
    }
}
