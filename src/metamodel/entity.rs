use super::EntityDescriptor;
use crate::core::{PersistError, Result, Row, Value};
use std::any::{Any, TypeId};
use std::fmt;

/// Core trait for types the session can persist.
///
/// The identifier and the version column are not part of [`Entity::columns`];
/// the session tracks versions itself.
pub trait Entity: Clone + Send + Sync + 'static {
    /// Returns the static mapping of this type. Called once at registration.
    fn descriptor() -> EntityDescriptor
    where
        Self: Sized;
    /// Returns the identifier, or `None` while the entity has none.
    fn identifier(&self) -> Option<Value>;
    /// Stores an identifier produced by the identifier strategy.
    fn set_identifier(&mut self, id: Value);
    /// Returns the mapped column values in descriptor order.
    fn columns(&self) -> Vec<(&'static str, Value)>;
    /// Reconstructs an instance from a row holding the identifier and all columns.
    fn from_row(row: &Row) -> Result<Self>
    where
        Self: Sized;
    /// Assigns one mapped column. Needed for foreign keys filled in by cascades.
    fn set_column(&mut self, column: &str, value: Value) -> Result<()> {
        let _ = value;
        Err(PersistError::MappingConfiguration(format!(
            "Column '{}' cannot be assigned on this entity",
            column
        )))
    }
    /// Returns the entities reachable through the named association.
    fn associated(&self, association: &str) -> Vec<EntityRef> {
        let _ = association;
        Vec::new()
    }
}

/// Object-safe view of an [`Entity`] used inside the persistence context.
pub trait AnyEntity: Send + Sync + 'static {
    fn entity_type(&self) -> TypeId;
    fn identifier_value(&self) -> Option<Value>;
    fn assign_identifier(&mut self, id: Value);
    fn column_pairs(&self) -> Vec<(&'static str, Value)>;
    fn assign_column(&mut self, column: &str, value: Value) -> Result<()>;
    fn related(&self, association: &str) -> Vec<EntityRef>;
    fn clone_boxed(&self) -> Box<dyn AnyEntity>;
    fn as_any(&self) -> &dyn Any;
}

impl<E: Entity> AnyEntity for E {
    fn entity_type(&self) -> TypeId {
        TypeId::of::<E>()
    }

    fn identifier_value(&self) -> Option<Value> {
        self.identifier()
    }

    fn assign_identifier(&mut self, id: Value) {
        self.set_identifier(id)
    }

    fn column_pairs(&self) -> Vec<(&'static str, Value)> {
        self.columns()
    }

    fn assign_column(&mut self, column: &str, value: Value) -> Result<()> {
        self.set_column(column, value)
    }

    fn related(&self, association: &str) -> Vec<EntityRef> {
        self.associated(association)
    }

    fn clone_boxed(&self) -> Box<dyn AnyEntity> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Owned, type-erased entity instance.
pub struct EntityRef(Box<dyn AnyEntity>);

impl EntityRef {
    pub fn new<E: Entity>(entity: E) -> Self {
        Self(Box::new(entity))
    }

    pub fn from_boxed(entity: Box<dyn AnyEntity>) -> Self {
        Self(entity)
    }

    pub fn as_entity(&self) -> &dyn AnyEntity {
        self.0.as_ref()
    }

    pub fn as_entity_mut(&mut self) -> &mut dyn AnyEntity {
        self.0.as_mut()
    }

    pub fn into_boxed(self) -> Box<dyn AnyEntity> {
        self.0
    }

    pub fn entity_type(&self) -> TypeId {
        self.0.entity_type()
    }

    pub fn identifier(&self) -> Option<Value> {
        self.0.identifier_value()
    }

    pub fn set_identifier(&mut self, id: Value) {
        self.0.assign_identifier(id)
    }

    pub fn downcast_ref<E: Entity>(&self) -> Option<&E> {
        self.0.as_any().downcast_ref::<E>()
    }

    /// Clones the instance out as `E`, or reports a mapping error naming the
    /// entity that was actually found.
    pub fn to_typed<E: Entity>(&self, descriptor: &EntityDescriptor) -> Result<E> {
        self.downcast_ref::<E>().cloned().ok_or_else(|| {
            PersistError::MappingConfiguration(format!(
                "Instance of '{}' is not of the requested type",
                descriptor.entity_name()
            ))
        })
    }
}

impl Clone for EntityRef {
    fn clone(&self) -> Self {
        Self(self.0.clone_boxed())
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRef")
            .field("identifier", &self.0.identifier_value())
            .finish()
    }
}

/// Row mapper stored in the descriptor at registration time.
pub(crate) fn map_row<E: Entity>(row: &Row) -> Result<Box<dyn AnyEntity>> {
    E::from_row(row).map(|entity| Box::new(entity) as Box<dyn AnyEntity>)
}
