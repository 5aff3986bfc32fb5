//! Static entity metadata: descriptors, identifier strategies and the
//! association graph used by cascades.

pub mod association;
pub mod descriptor;
pub mod entity;
pub mod identifier;

pub use association::{AssociationKind, AssociationMapping, CascadeStyle};
pub use descriptor::{ColumnMapping, EntityDescriptor, EntityDescriptorBuilder};
pub use entity::{AnyEntity, Entity, EntityRef};
pub use identifier::{GeneratedId, IdentifierGenerator, IdentifierStrategy, SequenceGenerator};

use crate::core::{PersistError, Result};
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of every mapped entity type, fixed once the session factory is built.
#[derive(Debug, Clone, Default)]
pub struct Metamodel {
    by_type: HashMap<TypeId, Arc<EntityDescriptor>>,
    by_name: HashMap<String, Arc<EntityDescriptor>>,
}

impl Metamodel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<E: Entity>(&mut self) -> Result<Arc<EntityDescriptor>> {
        let mut descriptor = E::descriptor();
        descriptor.entity_type = Some(TypeId::of::<E>());
        descriptor.row_mapper = Some(entity::map_row::<E>);

        let name = descriptor.entity_name().to_string();
        if self.by_name.contains_key(&name) || self.by_type.contains_key(&TypeId::of::<E>()) {
            return Err(PersistError::Configuration(format!(
                "Entity '{}' is registered twice",
                name
            )));
        }

        let descriptor = Arc::new(descriptor);
        self.by_type.insert(TypeId::of::<E>(), Arc::clone(&descriptor));
        self.by_name.insert(name, Arc::clone(&descriptor));
        Ok(descriptor)
    }

    /// Checks that every association points at a registered entity.
    pub fn validate(&self) -> Result<()> {
        for descriptor in self.by_name.values() {
            for association in descriptor.associations() {
                let target = self.by_name.get(&association.target).ok_or_else(|| {
                    PersistError::Configuration(format!(
                        "Association '{}.{}' targets unknown entity '{}'",
                        descriptor.entity_name(),
                        association.name,
                        association.target
                    ))
                })?;
                if let AssociationKind::OneToMany { mapped_by } = &association.kind {
                    if target.column_index(mapped_by).is_none() {
                        return Err(PersistError::Configuration(format!(
                            "Association '{}.{}' is mapped by unknown column '{}.{}'",
                            descriptor.entity_name(),
                            association.name,
                            target.entity_name(),
                            mapped_by
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn descriptor<E: Entity>(&self) -> Result<Arc<EntityDescriptor>> {
        self.descriptor_for_type(TypeId::of::<E>())
    }

    pub fn descriptor_for_type(&self, type_id: TypeId) -> Result<Arc<EntityDescriptor>> {
        self.by_type.get(&type_id).cloned().ok_or_else(|| {
            PersistError::MappingConfiguration("Unknown entity type: not mapped".to_string())
        })
    }

    pub fn descriptor_of(&self, entity: &dyn AnyEntity) -> Result<Arc<EntityDescriptor>> {
        self.descriptor_for_type(entity.entity_type())
    }

    pub fn descriptor_by_name(&self, name: &str) -> Result<Arc<EntityDescriptor>> {
        self.by_name.get(name).cloned().ok_or_else(|| {
            PersistError::MappingConfiguration(format!("Unknown entity '{}'", name))
        })
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &Arc<EntityDescriptor>> {
        self.by_name.values()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
