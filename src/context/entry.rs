use crate::action::ActionId;
use crate::core::{EntityKey, Value};
use crate::metamodel::{AnyEntity, EntityDescriptor};
use std::fmt;
use std::sync::Arc;

/// Lifecycle status of a key inside one session.
///
/// A key with no entry is transient (or gone once its delete completed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityStatus {
    /// Insert scheduled or in flight.
    Saving,
    Managed,
    /// Delete scheduled or in flight.
    Deleted,
}

/// Per-key record of a managed entity.
pub struct EntityEntry {
    pub descriptor: Arc<EntityDescriptor>,
    /// `None` only while a database-generated identifier is outstanding.
    pub id: Option<Value>,
    pub status: EntityStatus,
    pub instance: Box<dyn AnyEntity>,
    /// Column values as last written to or read from the database.
    pub loaded_state: Vec<Value>,
    /// Set only while a delete is scheduled or in flight.
    pub deleted_state: Option<Vec<Value>>,
    pub version: Option<i64>,
    pub update_in_flight: bool,
    /// The queued insert of a `Saving` entry.
    pub insert_action: Option<ActionId>,
    pub(crate) generation: u64,
}

impl EntityEntry {
    pub fn new(
        descriptor: Arc<EntityDescriptor>,
        id: Option<Value>,
        status: EntityStatus,
        instance: Box<dyn AnyEntity>,
        loaded_state: Vec<Value>,
        version: Option<i64>,
    ) -> Self {
        Self {
            descriptor,
            id,
            status,
            instance,
            loaded_state,
            deleted_state: None,
            version,
            update_in_flight: false,
            insert_action: None,
            generation: 0,
        }
    }

    pub fn key(&self) -> Option<EntityKey> {
        self.id.clone().map(|id| self.descriptor.key(id))
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_deleted(&self) -> bool {
        self.status == EntityStatus::Deleted
    }
}

impl fmt::Debug for EntityEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityEntry")
            .field("entity", &self.descriptor.entity_name())
            .field("id", &self.id)
            .field("status", &self.status)
            .field("version", &self.version)
            .field("generation", &self.generation)
            .finish()
    }
}
