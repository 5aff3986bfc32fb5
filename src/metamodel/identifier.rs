use super::AnyEntity;
use crate::core::{PersistError, Result, Value};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Outcome of identifier generation for one insert.
#[derive(Debug, Clone, PartialEq)]
pub enum GeneratedId {
    /// The identifier is known before the insert.
    Value(Value),
    /// The database assigns the identifier during the insert.
    Pending,
    /// The generator decided the entity must not be inserted; persist succeeds.
    ShortCircuit,
}

/// User-supplied identifier generator.
pub trait IdentifierGenerator: Send + Sync {
    fn generate(&self, entity_name: &str, entity: &dyn AnyEntity) -> Result<GeneratedId>;
}

/// In-process sequence shared by every session of one factory.
#[derive(Debug)]
pub struct SequenceGenerator {
    next: AtomicI64,
    increment: i64,
}

impl SequenceGenerator {
    pub fn new(initial_value: i64, increment: i64) -> Self {
        Self {
            next: AtomicI64::new(initial_value),
            increment,
        }
    }

    pub fn next_value(&self) -> i64 {
        self.next.fetch_add(self.increment, Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub enum IdentifierStrategy {
    /// The application sets the identifier before persisting.
    Assigned,
    Sequence(Arc<SequenceGenerator>),
    /// Database identity column; the identifier is read back with `RETURNING`.
    Identity,
    /// Random v4 UUID stored as text.
    Uuid,
    Custom(Arc<dyn IdentifierGenerator>),
}

impl IdentifierStrategy {
    pub fn sequence(initial_value: i64, increment: i64) -> Self {
        Self::Sequence(Arc::new(SequenceGenerator::new(initial_value, increment)))
    }

    pub fn custom(generator: impl IdentifierGenerator + 'static) -> Self {
        Self::Custom(Arc::new(generator))
    }

    pub fn generate(&self, entity_name: &str, entity: &dyn AnyEntity) -> Result<GeneratedId> {
        match self {
            Self::Assigned => match entity.identifier_value() {
                Some(Value::Null) | None => Err(PersistError::IdentifierGeneration {
                    entity: entity_name.to_string(),
                    message: "identifier must be assigned before persist".to_string(),
                }),
                Some(id) => Ok(GeneratedId::Value(id)),
            },
            Self::Sequence(sequence) => Ok(GeneratedId::Value(Value::Integer(
                sequence.next_value(),
            ))),
            Self::Identity => Ok(GeneratedId::Pending),
            Self::Uuid => Ok(GeneratedId::Value(Value::Text(
                uuid::Uuid::new_v4().to_string(),
            ))),
            Self::Custom(generator) => match generator.generate(entity_name, entity)? {
                GeneratedId::Value(Value::Null) => Err(PersistError::IdentifierGeneration {
                    entity: entity_name.to_string(),
                    message: "generator returned NULL".to_string(),
                }),
                other => Ok(other),
            },
        }
    }
}

impl fmt::Debug for IdentifierStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Assigned => write!(f, "Assigned"),
            Self::Sequence(sequence) => write!(f, "Sequence(increment={})", sequence.increment),
            Self::Identity => write!(f, "Identity"),
            Self::Uuid => write!(f, "Uuid"),
            Self::Custom(_) => write!(f, "Custom"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Row;
    use crate::metamodel::{Entity, EntityDescriptor};
    use crate::core::DataType;

    #[derive(Clone)]
    struct Tag {
        id: Option<i64>,
    }

    impl Entity for Tag {
        fn descriptor() -> EntityDescriptor {
            EntityDescriptor::builder("Tag", "tag")
                .id("id", DataType::Integer)
                .build()
                .unwrap()
        }
        fn identifier(&self) -> Option<Value> {
            self.id.map(Value::Integer)
        }
        fn set_identifier(&mut self, id: Value) {
            self.id = id.as_i64();
        }
        fn columns(&self) -> Vec<(&'static str, Value)> {
            Vec::new()
        }
        fn from_row(row: &Row) -> Result<Self> {
            Ok(Tag {
                id: row.require("id")?.as_i64(),
            })
        }
    }

    struct Skipper;

    impl IdentifierGenerator for Skipper {
        fn generate(&self, _entity_name: &str, _entity: &dyn AnyEntity) -> Result<GeneratedId> {
            Ok(GeneratedId::ShortCircuit)
        }
    }

    #[test]
    fn test_assigned_requires_identifier() {
        let strategy = IdentifierStrategy::Assigned;
        let err = strategy.generate("Tag", &Tag { id: None }).unwrap_err();
        assert!(matches!(err, PersistError::IdentifierGeneration { .. }));
        assert_eq!(
            strategy.generate("Tag", &Tag { id: Some(4) }).unwrap(),
            GeneratedId::Value(Value::Integer(4))
        );
    }

    #[test]
    fn test_sequence_is_shared_across_clones() {
        let strategy = IdentifierStrategy::sequence(100, 5);
        let copy = strategy.clone();
        let tag = Tag { id: None };
        assert_eq!(
            strategy.generate("Tag", &tag).unwrap(),
            GeneratedId::Value(Value::Integer(100))
        );
        assert_eq!(
            copy.generate("Tag", &tag).unwrap(),
            GeneratedId::Value(Value::Integer(105))
        );
    }

    #[test]
    fn test_identity_and_custom() {
        let tag = Tag { id: None };
        assert_eq!(
            IdentifierStrategy::Identity.generate("Tag", &tag).unwrap(),
            GeneratedId::Pending
        );
        assert_eq!(
            IdentifierStrategy::custom(Skipper).generate("Tag", &tag).unwrap(),
            GeneratedId::ShortCircuit
        );
        match IdentifierStrategy::Uuid.generate("Tag", &tag).unwrap() {
            GeneratedId::Value(Value::Text(text)) => assert_eq!(text.len(), 36),
            other => panic!("unexpected {:?}", other),
        }
    }
}
