use super::{AnyEntity, AssociationKind, AssociationMapping, IdentifierStrategy};
use crate::core::{DataType, EntityKey, PersistError, Result, Row, Value};
use std::any::TypeId;
use std::collections::HashSet;
use std::fmt;

pub(crate) type RowMapper = fn(&Row) -> Result<Box<dyn AnyEntity>>;

/// One mapped, non-identifier column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

/// Read-only mapping of one entity type: table, identifier, columns, version
/// column and cascade graph.
#[derive(Clone)]
pub struct EntityDescriptor {
    entity_name: String,
    table: String,
    id_column: String,
    id_type: DataType,
    id_strategy: IdentifierStrategy,
    columns: Vec<ColumnMapping>,
    version_column: Option<String>,
    dynamic_update: bool,
    associations: Vec<AssociationMapping>,
    pub(crate) entity_type: Option<TypeId>,
    pub(crate) row_mapper: Option<RowMapper>,
}

impl EntityDescriptor {
    pub fn builder(
        entity_name: impl Into<String>,
        table: impl Into<String>,
    ) -> EntityDescriptorBuilder {
        EntityDescriptorBuilder {
            entity_name: entity_name.into(),
            table: table.into(),
            id_column: "id".to_string(),
            id_type: DataType::Integer,
            id_strategy: IdentifierStrategy::Assigned,
            columns: Vec::new(),
            version_column: None,
            dynamic_update: false,
            associations: Vec::new(),
        }
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn id_column(&self) -> &str {
        &self.id_column
    }

    pub fn id_type(&self) -> DataType {
        self.id_type
    }

    pub fn id_strategy(&self) -> &IdentifierStrategy {
        &self.id_strategy
    }

    pub fn columns(&self) -> &[ColumnMapping] {
        &self.columns
    }

    pub fn version_column(&self) -> Option<&str> {
        self.version_column.as_deref()
    }

    pub fn is_versioned(&self) -> bool {
        self.version_column.is_some()
    }

    pub fn dynamic_update(&self) -> bool {
        self.dynamic_update
    }

    pub fn associations(&self) -> &[AssociationMapping] {
        &self.associations
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(column))
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Identifier, mapped columns, then the version column.
    pub fn select_columns(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.columns.len() + 2);
        names.push(self.id_column.clone());
        names.extend(self.column_names());
        if let Some(version) = &self.version_column {
            names.push(version.clone());
        }
        names
    }

    pub fn key(&self, id: Value) -> EntityKey {
        EntityKey::new(self.entity_name.as_str(), id)
    }

    /// Rejects NULL identifiers and identifiers of the wrong type.
    pub fn check_identifier(&self, id: &Value) -> Result<()> {
        match id.data_type() {
            Some(actual) if actual == self.id_type => Ok(()),
            Some(actual) => Err(PersistError::MappingConfiguration(format!(
                "Identifier of wrong type for '{}': expected {}, got {}",
                self.entity_name, self.id_type, actual
            ))),
            None => Err(PersistError::MappingConfiguration(format!(
                "NULL identifier for '{}'",
                self.entity_name
            ))),
        }
    }

    /// Column values of `entity` in mapping order, checked against the mapping.
    pub fn column_values(&self, entity: &dyn AnyEntity) -> Result<Vec<Value>> {
        let pairs = entity.column_pairs();
        if pairs.len() != self.columns.len() {
            return Err(PersistError::MappingConfiguration(format!(
                "'{}' reported {} columns, mapping has {}",
                self.entity_name,
                pairs.len(),
                self.columns.len()
            )));
        }
        let mut values = Vec::with_capacity(pairs.len());
        for ((name, value), mapping) in pairs.into_iter().zip(&self.columns) {
            if !mapping.name.eq_ignore_ascii_case(name) {
                return Err(PersistError::MappingConfiguration(format!(
                    "'{}' reported column '{}' where the mapping expects '{}'",
                    self.entity_name, name, mapping.name
                )));
            }
            if !mapping.data_type.is_compatible(&value) {
                return Err(PersistError::MappingConfiguration(format!(
                    "Column '{}.{}' expects {}, got {}",
                    self.entity_name,
                    mapping.name,
                    mapping.data_type,
                    value.type_name()
                )));
            }
            values.push(value);
        }
        Ok(values)
    }

    /// Indexes of columns whose current value differs from the loaded snapshot.
    pub fn dirty_columns(&self, loaded: &[Value], current: &[Value]) -> Vec<usize> {
        current
            .iter()
            .enumerate()
            .filter(|(idx, value)| loaded.get(*idx) != Some(*value))
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn instantiate(&self, row: &Row) -> Result<Box<dyn AnyEntity>> {
        let mapper = self.row_mapper.ok_or_else(|| {
            PersistError::MappingConfiguration(format!(
                "'{}' is not registered with a metamodel",
                self.entity_name
            ))
        })?;
        mapper(row)
    }

    /// Foreign key column index for a many-to-one association.
    pub fn foreign_key_index(&self, association: &AssociationMapping) -> Option<usize> {
        match &association.kind {
            AssociationKind::ManyToOne { fk_column } => self.column_index(fk_column),
            AssociationKind::OneToMany { .. } => None,
        }
    }
}

impl fmt::Debug for EntityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityDescriptor")
            .field("entity_name", &self.entity_name)
            .field("table", &self.table)
            .field("id_column", &self.id_column)
            .field("id_strategy", &self.id_strategy)
            .field("columns", &self.columns)
            .field("version_column", &self.version_column)
            .finish()
    }
}

pub struct EntityDescriptorBuilder {
    entity_name: String,
    table: String,
    id_column: String,
    id_type: DataType,
    id_strategy: IdentifierStrategy,
    columns: Vec<ColumnMapping>,
    version_column: Option<String>,
    dynamic_update: bool,
    associations: Vec<AssociationMapping>,
}

impl EntityDescriptorBuilder {
    pub fn id(mut self, column: impl Into<String>, data_type: DataType) -> Self {
        self.id_column = column.into();
        self.id_type = data_type;
        self
    }

    pub fn strategy(mut self, strategy: IdentifierStrategy) -> Self {
        self.id_strategy = strategy;
        self
    }

    /// Adds a NOT NULL column.
    pub fn column(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        self.columns.push(ColumnMapping {
            name: name.into(),
            data_type,
            nullable: false,
        });
        self
    }

    pub fn nullable_column(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        self.columns.push(ColumnMapping {
            name: name.into(),
            data_type,
            nullable: true,
        });
        self
    }

    pub fn version(mut self, column: impl Into<String>) -> Self {
        self.version_column = Some(column.into());
        self
    }

    /// Only changed columns are written by updates.
    pub fn dynamic_update(mut self, enabled: bool) -> Self {
        self.dynamic_update = enabled;
        self
    }

    pub fn association(mut self, association: AssociationMapping) -> Self {
        self.associations.push(association);
        self
    }

    pub fn build(self) -> Result<EntityDescriptor> {
        if self.entity_name.is_empty() || self.table.is_empty() || self.id_column.is_empty() {
            return Err(PersistError::MappingConfiguration(
                "Entity name, table and identifier column must not be empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        seen.insert(self.id_column.to_ascii_lowercase());
        for column in &self.columns {
            if !seen.insert(column.name.to_ascii_lowercase()) {
                return Err(PersistError::MappingConfiguration(format!(
                    "Column '{}' is mapped twice in '{}'",
                    column.name, self.entity_name
                )));
            }
        }
        if let Some(version) = &self.version_column {
            if !seen.insert(version.to_ascii_lowercase()) {
                return Err(PersistError::MappingConfiguration(format!(
                    "Version column '{}' of '{}' is also mapped as a column",
                    version, self.entity_name
                )));
            }
        }

        let strategy_type = match &self.id_strategy {
            IdentifierStrategy::Sequence(_) | IdentifierStrategy::Identity => {
                Some(DataType::Integer)
            }
            IdentifierStrategy::Uuid => Some(DataType::Text),
            IdentifierStrategy::Assigned | IdentifierStrategy::Custom(_) => None,
        };
        if let Some(expected) = strategy_type {
            if expected != self.id_type {
                return Err(PersistError::MappingConfiguration(format!(
                    "Identifier strategy {:?} of '{}' needs a {} identifier, mapped as {}",
                    self.id_strategy, self.entity_name, expected, self.id_type
                )));
            }
        }

        for association in &self.associations {
            if let AssociationKind::ManyToOne { fk_column } = &association.kind {
                if !self
                    .columns
                    .iter()
                    .any(|c| c.name.eq_ignore_ascii_case(fk_column))
                {
                    return Err(PersistError::MappingConfiguration(format!(
                        "Association '{}.{}' uses unmapped foreign key column '{}'",
                        self.entity_name, association.name, fk_column
                    )));
                }
            }
        }

        Ok(EntityDescriptor {
            entity_name: self.entity_name,
            table: self.table,
            id_column: self.id_column,
            id_type: self.id_type,
            id_strategy: self.id_strategy,
            columns: self.columns,
            version_column: self.version_column,
            dynamic_update: self.dynamic_update,
            associations: self.associations,
            entity_type: None,
            row_mapper: None,
        })
    }
}
