//! Lifecycle events and the listeners that handle them.
//!
//! Events are plain data. A listener runs synchronously on the session
//! sequencer with exclusive access to the [`SessionCore`] and returns the
//! completion of its work; it never blocks on I/O.
//!
//! Listener lists are fixed when the session factory is built: the default
//! listeners come first, user listeners are appended after them.

pub mod delete;
pub mod flush;
pub mod load;
pub mod merge;
pub mod persist;

pub use delete::DefaultDeleteEventListener;
pub use flush::DefaultFlushEventListener;
pub use load::DefaultLoadEventListener;
pub use merge::DefaultMergeEventListener;
pub use persist::DefaultPersistEventListener;

use crate::action::ActionId;
use crate::completion::CompletionHandle;
use crate::core::{EntityKey, Row, Value};
use crate::metamodel::{EntityDescriptor, EntityRef};
use crate::session::SessionCore;
use std::sync::Arc;

/// Request to make a transient entity persistent.
#[derive(Debug)]
pub struct PersistEvent {
    pub entity: EntityRef,
    /// Keys already visited by the request that led here.
    pub ancestors: Vec<EntityKey>,
    pub cascading: bool,
    /// Set by the listener once the insert is queued.
    pub insert_action: Option<ActionId>,
    /// Set by the listener when the database generates the identifier.
    pub generated_identifier: Option<CompletionHandle<Value>>,
}

impl PersistEvent {
    pub fn new(entity: EntityRef) -> Self {
        Self {
            entity,
            ancestors: Vec::new(),
            cascading: false,
            insert_action: None,
            generated_identifier: None,
        }
    }

    pub fn cascaded(entity: EntityRef, ancestors: Vec<EntityKey>) -> Self {
        Self {
            ancestors,
            cascading: true,
            ..Self::new(entity)
        }
    }
}

#[derive(Debug)]
pub struct DeleteEvent {
    pub entity: EntityRef,
    pub ancestors: Vec<EntityKey>,
    pub cascading: bool,
    /// Set by the listener once the delete is queued in this dispatch.
    pub scheduled_action: Option<ActionId>,
    /// True when the delete waits for a database round trip before it is queued.
    pub deferred: bool,
}

impl DeleteEvent {
    pub fn new(entity: EntityRef) -> Self {
        Self {
            entity,
            ancestors: Vec::new(),
            cascading: false,
            scheduled_action: None,
            deferred: false,
        }
    }

    pub fn cascaded(entity: EntityRef, ancestors: Vec<EntityKey>) -> Self {
        Self {
            ancestors,
            cascading: true,
            ..Self::new(entity)
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadEvent {
    pub descriptor: Arc<EntityDescriptor>,
    pub id: Value,
}

impl LoadEvent {
    pub fn new(descriptor: Arc<EntityDescriptor>, id: Value) -> Self {
        Self { descriptor, id }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FlushEvent {
    /// True when the flush was triggered by persist/remove rather than by the caller.
    pub auto: bool,
    /// Number of updates the dirty check scheduled.
    pub scheduled_updates: usize,
}

impl FlushEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auto() -> Self {
        Self {
            auto: true,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub struct MergeEvent {
    pub entity: EntityRef,
}

impl MergeEvent {
    pub fn new(entity: EntityRef) -> Self {
        Self { entity }
    }
}

pub trait PersistEventListener: Send + Sync {
    fn on_persist(&self, core: &mut SessionCore, event: &mut PersistEvent) -> CompletionHandle<()>;
}

pub trait DeleteEventListener: Send + Sync {
    fn on_delete(&self, core: &mut SessionCore, event: &mut DeleteEvent) -> CompletionHandle<()>;
}

/// Load listeners form a chain: the first one returning `Some` answers the load.
pub trait LoadEventListener: Send + Sync {
    fn on_load(
        &self,
        core: &mut SessionCore,
        event: &mut LoadEvent,
    ) -> Option<CompletionHandle<Option<EntityRef>>>;
}

pub trait FlushEventListener: Send + Sync {
    fn on_flush(&self, core: &mut SessionCore, event: &mut FlushEvent) -> CompletionHandle<()>;
}

/// Merge listeners form a chain like load listeners.
pub trait MergeEventListener: Send + Sync {
    fn on_merge(
        &self,
        core: &mut SessionCore,
        event: &mut MergeEvent,
    ) -> Option<CompletionHandle<EntityRef>>;
}

/// Listener lists per event kind.
#[derive(Clone)]
pub struct EventListeners {
    pub(crate) persist: Vec<Arc<dyn PersistEventListener>>,
    pub(crate) delete: Vec<Arc<dyn DeleteEventListener>>,
    pub(crate) load: Vec<Arc<dyn LoadEventListener>>,
    pub(crate) flush: Vec<Arc<dyn FlushEventListener>>,
    pub(crate) merge: Vec<Arc<dyn MergeEventListener>>,
}

impl EventListeners {
    /// The default listener of every event kind.
    pub fn with_defaults() -> Self {
        Self {
            persist: vec![Arc::new(DefaultPersistEventListener)],
            delete: vec![Arc::new(DefaultDeleteEventListener)],
            load: vec![Arc::new(DefaultLoadEventListener)],
            flush: vec![Arc::new(DefaultFlushEventListener)],
            merge: vec![Arc::new(DefaultMergeEventListener)],
        }
    }

    pub fn append_persist(&mut self, listener: Arc<dyn PersistEventListener>) {
        self.persist.push(listener);
    }

    pub fn append_delete(&mut self, listener: Arc<dyn DeleteEventListener>) {
        self.delete.push(listener);
    }

    pub fn append_load(&mut self, listener: Arc<dyn LoadEventListener>) {
        self.load.push(listener);
    }

    pub fn append_flush(&mut self, listener: Arc<dyn FlushEventListener>) {
        self.flush.push(listener);
    }

    pub fn append_merge(&mut self, listener: Arc<dyn MergeEventListener>) {
        self.merge.push(listener);
    }
}

impl Default for EventListeners {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Mapped column values and version of a row read for `descriptor`.
pub(crate) fn snapshot_of_row(descriptor: &EntityDescriptor, row: &Row) -> (Vec<Value>, Option<i64>) {
    let values = descriptor
        .columns()
        .iter()
        .map(|column| row.get(&column.name).cloned().unwrap_or(Value::Null))
        .collect();
    let version = descriptor
        .version_column()
        .and_then(|column| row.get(column))
        .and_then(Value::as_i64);
    (values, version)
}
