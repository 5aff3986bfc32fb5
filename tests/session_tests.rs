/// Session lifecycle tests
///
/// persist / find / remove / merge through the public session API against
/// the in-memory database.
/// Run with: cargo test --test session_tests

mod common;

use common::{Farm, Pig, fixture, fixture_with, manual_flush};
use rxorm::prelude::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test]
async fn test_persist_then_find_in_another_session() {
    let fx = fixture();

    let session = fx.factory.open_session().unwrap();
    session.persist(Pig::new(22, "Mibbles")).await.unwrap();

    let row = fx.db.row("pig", &Value::Integer(22)).unwrap();
    assert_eq!(row.get("name"), Some(&Value::Text("Mibbles".into())));
    assert_eq!(row.get("version"), Some(&Value::Integer(0)));

    let other = fx.factory.open_session().unwrap();
    let pig = other.find::<Pig>(22).await.unwrap();
    assert_eq!(pig, Some(Pig::new(22, "Mibbles")));
    assert_eq!(
        other.entity_status::<Pig>(22).await.unwrap(),
        Some(EntityStatus::Managed)
    );
}

#[tokio::test]
async fn test_find_missing_row_resolves_empty() {
    let fx = fixture();
    let session = fx.factory.open_session().unwrap();

    assert_eq!(session.find::<Pig>(404).await.unwrap(), None);
    assert_eq!(session.entity_status::<Pig>(404).await.unwrap(), None);
}

#[tokio::test]
async fn test_get_reference_fails_for_missing_row() {
    let fx = fixture();
    let session = fx.factory.open_session().unwrap();

    match session.get_reference::<Pig>(404).await {
        Err(PersistError::EntityNotFound { entity, id }) => {
            assert_eq!(entity, "Pig");
            assert_eq!(id, "404");
        }
        other => panic!("expected EntityNotFound, got {:?}", other),
    }
}

#[tokio::test]
async fn test_find_answers_from_context_without_round_trip() {
    let fx = fixture();
    let session = fx.factory.open_session().unwrap();
    session.persist(Pig::new(1, "Babe")).await.unwrap();
    fx.db.clear_statements().unwrap();

    let pig = session.find::<Pig>(1).await.unwrap();
    assert_eq!(pig.map(|p| p.name), Some("Babe".to_string()));
    assert_eq!(fx.db.count_statements("select"), 0);
    assert_eq!(session.statistics().cache_hits, 1);
}

#[tokio::test]
async fn test_remove_is_idempotent() {
    let fx = fixture();
    let session = fx.factory.open_session().unwrap();
    let pig = Pig::new(3, "Wilbur");
    session.persist(pig.clone()).await.unwrap();

    session.remove(&pig).await.unwrap();
    assert_eq!(fx.db.row_count("pig"), 0);
    assert_eq!(session.entity_status::<Pig>(3).await.unwrap(), None);

    session.remove(&pig).await.unwrap();
    assert_eq!(fx.db.count_statements("delete"), 1);
}

#[tokio::test]
async fn test_second_remove_while_delete_in_flight_is_a_no_op() {
    let fx = fixture();
    let session = fx.factory.open_session().unwrap();
    let pig = Pig::new(15, "Old Major");
    session.persist(pig.clone()).await.unwrap();
    fx.db.set_latency(Some(Duration::from_millis(5))).unwrap();

    let first = session.remove(&pig);
    let second = session.remove(&pig);
    second.await.unwrap();
    first.await.unwrap();

    assert_eq!(fx.db.count_statements("delete"), 1);
    assert_eq!(fx.db.row_count("pig"), 0);
    assert_eq!(session.entity_status::<Pig>(15).await.unwrap(), None);
}

#[tokio::test]
async fn test_remove_detached_instance_loads_then_deletes() {
    let fx = fixture();
    fx.factory
        .open_session()
        .unwrap()
        .persist(Pig::new(4, "Napoleon"))
        .await
        .unwrap();

    let session = fx.factory.open_session().unwrap();
    session.remove(&Pig::new(4, "Napoleon")).await.unwrap();

    assert_eq!(fx.db.row_count("pig"), 0);
    assert_eq!(fx.db.count_statements("select"), 1);
    assert_eq!(fx.db.count_statements("delete"), 1);
}

/// Rust type and mapped entity name differ.
#[derive(Debug, Clone)]
struct WildPig {
    id: i64,
}

impl Entity for WildPig {
    fn descriptor() -> EntityDescriptor {
        EntityDescriptor::builder("Boar", "boar").build().unwrap()
    }
    fn identifier(&self) -> Option<Value> {
        Some(Value::Integer(self.id))
    }
    fn set_identifier(&mut self, _id: Value) {}
    fn columns(&self) -> Vec<(&'static str, Value)> {
        Vec::new()
    }
    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.require("id")?.as_i64().unwrap_or_default(),
        })
    }
}

#[tokio::test]
async fn test_get_reference_reports_mapped_entity_name() {
    let db = MemoryDatabase::new();
    let factory = SessionFactory::builder()
        .register::<WildPig>()
        .provider(Arc::new(db.clone()))
        .build()
        .unwrap();
    db.create_schema(factory.metamodel()).unwrap();
    let session = factory.open_session().unwrap();

    match session.get_reference::<WildPig>(3).await {
        Err(PersistError::EntityNotFound { entity, id }) => {
            assert_eq!(entity, "Boar");
            assert_eq!(id, "3");
        }
        other => panic!("expected EntityNotFound, got {:?}", other),
    }
}

#[tokio::test]
async fn test_remove_missing_row_succeeds_without_delete() {
    let fx = fixture();
    let session = fx.factory.open_session().unwrap();

    session.remove(&Pig::new(99, "Nobody")).await.unwrap();
    assert_eq!(fx.db.count_statements("delete"), 0);
}

#[tokio::test]
async fn test_remove_without_identifier_is_transient() {
    let fx = fixture();
    let session = fx.factory.open_session().unwrap();
    let pig = Pig {
        id: None,
        name: "Ghost".into(),
    };

    let err = session.remove(&pig).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransientObject);
    assert!(fx.db.statements().is_empty());
}

#[tokio::test]
async fn test_persist_twice_in_one_session_is_rejected() {
    let fx = fixture();
    let session = fx.factory.open_session().unwrap();
    session.persist(Pig::new(5, "Snowball")).await.unwrap();

    let err = session.persist(Pig::new(5, "Snowball")).await.unwrap_err();
    assert!(matches!(err, PersistError::DuplicateEntity { .. }));
    assert_eq!(fx.db.count_statements("insert"), 1);
}

#[tokio::test]
async fn test_persist_without_assigned_identifier_fails() {
    let fx = fixture();
    let session = fx.factory.open_session().unwrap();

    let err = session
        .persist(Pig {
            id: None,
            name: "Nameless".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IdentifierGeneration);
}

#[tokio::test]
async fn test_save_resolves_with_generated_identifier() {
    let fx = fixture();
    let session = fx.factory.open_session().unwrap();

    let first = session.save(Farm::new("Manor", Vec::new())).await.unwrap();
    let second = session.save(Farm::new("Zuckerman", Vec::new())).await.unwrap();
    assert_eq!(first, Value::Integer(1));
    assert_eq!(second, Value::Integer(2));

    let farm = session.find::<Farm>(2).await.unwrap().unwrap();
    assert_eq!(farm.id, Some(2));
    assert_eq!(farm.name, "Zuckerman");
}

#[tokio::test]
async fn test_save_with_assigned_identifier() {
    let fx = fixture();
    let session = fx.factory.open_session().unwrap();

    let id = session.save(Pig::new(8, "Hen Wen")).await.unwrap();
    assert_eq!(id, Value::Integer(8));
}

#[tokio::test]
async fn test_find_flushes_pending_identity_insert() {
    let fx = fixture_with(manual_flush());
    let session = fx.factory.open_session().unwrap();

    let saved = session.save(Farm::new("Animal Farm", Vec::new()));
    let found = session.find::<Farm>(1).await.unwrap();

    assert_eq!(found.map(|farm| farm.name), Some("Animal Farm".to_string()));
    assert_eq!(saved.await.unwrap(), Value::Integer(1));
    assert_eq!(fx.db.count_statements("insert"), 1);
}

#[tokio::test]
async fn test_merge_updates_managed_instance() {
    let fx = fixture();
    let session = fx.factory.open_session().unwrap();
    session.persist(Pig::new(6, "Old Major")).await.unwrap();

    let mut pig = session.find::<Pig>(6).await.unwrap().unwrap();
    pig.name = "Major".into();
    let merged = session.merge(&pig).await.unwrap();
    assert_eq!(merged.name, "Major");
    session.flush().await.unwrap();

    let row = fx.db.row("pig", &Value::Integer(6)).unwrap();
    assert_eq!(row.get("name"), Some(&Value::Text("Major".into())));
    assert_eq!(row.get("version"), Some(&Value::Integer(1)));
    assert_eq!(session.statistics().updates, 1);
}

#[tokio::test]
async fn test_merge_detached_instance_loads_row() {
    let fx = fixture();
    fx.factory
        .open_session()
        .unwrap()
        .persist(Pig::new(9, "Pinky"))
        .await
        .unwrap();

    let session = fx.factory.open_session().unwrap();
    session.merge(&Pig::new(9, "Perky")).await.unwrap();
    session.flush().await.unwrap();

    let row = fx.db.row("pig", &Value::Integer(9)).unwrap();
    assert_eq!(row.get("name"), Some(&Value::Text("Perky".into())));
    assert_eq!(fx.db.count_statements("update"), 1);
}

#[tokio::test]
async fn test_merge_unknown_instance_persists_a_copy() {
    let fx = fixture();
    let session = fx.factory.open_session().unwrap();

    let merged = session.merge(&Pig::new(10, "Peppa")).await.unwrap();
    assert_eq!(merged, Pig::new(10, "Peppa"));
    assert_eq!(fx.db.row_count("pig"), 1);
}

#[tokio::test]
async fn test_merge_without_identifier_resolves_with_generated_one() {
    let fx = fixture();
    let session = fx.factory.open_session().unwrap();

    let merged = session.merge(&Farm::new("Cold Comfort", Vec::new())).await.unwrap();
    assert_eq!(merged.id, Some(1));
}

#[tokio::test]
async fn test_unchanged_entity_is_not_updated() {
    let fx = fixture();
    let session = fx.factory.open_session().unwrap();
    session.persist(Pig::new(11, "Gub-Gub")).await.unwrap();

    session.flush().await.unwrap();
    session.flush().await.unwrap();
    assert_eq!(fx.db.count_statements("update"), 0);
}

#[tokio::test]
async fn test_contains_and_evict() {
    let fx = fixture();
    let session = fx.factory.open_session().unwrap();
    let pig = Pig::new(12, "Piglet");
    session.persist(pig.clone()).await.unwrap();

    assert!(session.contains(&pig).await.unwrap());
    session.evict(&pig).await.unwrap();
    assert!(!session.contains(&pig).await.unwrap());

    // Evicted entities are read again.
    fx.db.clear_statements().unwrap();
    session.find::<Pig>(12).await.unwrap();
    assert_eq!(fx.db.count_statements("select"), 1);
}

#[tokio::test]
async fn test_contains_is_false_once_removal_is_scheduled() {
    let fx = fixture_with(manual_flush());
    let session = fx.factory.open_session().unwrap();
    let pig = Pig::new(13, "Pumbaa");
    let persisted = session.persist(pig.clone());
    session.flush().await.unwrap();
    persisted.await.unwrap();

    let removed = session.remove(&pig);
    assert!(!session.contains(&pig).await.unwrap());
    assert_eq!(
        session.entity_status::<Pig>(13).await.unwrap(),
        Some(EntityStatus::Deleted)
    );
    assert_eq!(session.find::<Pig>(13).await.unwrap(), None);

    session.flush().await.unwrap();
    removed.await.unwrap();
    assert_eq!(fx.db.row_count("pig"), 0);
}

#[tokio::test]
async fn test_persist_after_remove_reinserts() {
    let fx = fixture();
    let session = fx.factory.open_session().unwrap();
    let pig = Pig::new(14, "Hamm");
    session.persist(pig.clone()).await.unwrap();

    let removed = session.remove(&pig);
    let persisted = session.persist(Pig::new(14, "Hamm II"));
    removed.await.unwrap();
    persisted.await.unwrap();

    let row = fx.db.row("pig", &Value::Integer(14)).unwrap();
    assert_eq!(row.get("name"), Some(&Value::Text("Hamm II".into())));
    assert_eq!(fx.db.count_statements("delete"), 1);
    assert_eq!(fx.db.count_statements("insert"), 2);
}

#[tokio::test]
async fn test_unmapped_entity_is_rejected() {
    #[derive(Debug, Clone)]
    struct Goat;

    impl Entity for Goat {
        fn descriptor() -> EntityDescriptor {
            EntityDescriptor::builder("Goat", "goat").build().unwrap()
        }
        fn identifier(&self) -> Option<Value> {
            Some(Value::Integer(1))
        }
        fn set_identifier(&mut self, _id: Value) {}
        fn columns(&self) -> Vec<(&'static str, Value)> {
            Vec::new()
        }
        fn from_row(_row: &Row) -> Result<Self> {
            Ok(Goat)
        }
    }

    let fx = fixture();
    let session = fx.factory.open_session().unwrap();
    let err = session.persist(Goat).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MappingConfiguration);
}

#[tokio::test]
async fn test_transaction_flushes_once_on_success() {
    let fx = fixture();
    let session = fx.factory.open_session().unwrap();

    let status = session
        .in_transaction(|tx| {
            tx.persist(Pig::new(1, "Babe"));
            tx.persist(Pig::new(2, "Wilbur"));
            tx.entity_status::<Pig>(1)
        })
        .await
        .unwrap();

    // Nothing was flushed while the work ran.
    assert_eq!(status, Some(EntityStatus::Saving));
    assert_eq!(fx.db.row_count("pig"), 2);
    assert_eq!(session.statistics().flushes, 1);
    assert_eq!(
        session.entity_status::<Pig>(2).await.unwrap(),
        Some(EntityStatus::Managed)
    );
}

#[tokio::test]
async fn test_failed_transaction_drops_its_queued_actions() {
    let fx = fixture();
    let session = fx.factory.open_session().unwrap();
    let slot = Arc::new(Mutex::new(None));
    let captured = Arc::clone(&slot);

    let err = session
        .in_transaction(move |tx| {
            *captured.lock().unwrap() = Some(tx.persist(Pig::new(1, "Babe")));
            tx.entity_status::<Pig>(1).and_then(|_| {
                CompletionHandle::<()>::failed(PersistError::IllegalState(
                    "changed my mind".to_string(),
                ))
            })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, PersistError::IllegalState(_)));

    let persisted = slot.lock().unwrap().take().unwrap();
    assert!(matches!(persisted.await, Err(PersistError::Abandoned(_))));
    assert!(fx.db.statements().is_empty());
    assert_eq!(session.entity_status::<Pig>(1).await.unwrap(), None);

    // Auto-flush is back once the transaction ended.
    session.persist(Pig::new(2, "Wilbur")).await.unwrap();
    assert_eq!(fx.db.row_count("pig"), 1);
}

#[tokio::test]
async fn test_nested_transaction_is_rejected() {
    let fx = fixture();
    let session = fx.factory.open_session().unwrap();

    let err = session
        .in_transaction(|tx| tx.in_transaction(|_| CompletionHandle::completed(())))
        .await
        .unwrap_err();
    assert!(matches!(err, PersistError::IllegalState(_)));

    // The rejected attempt left no transaction behind.
    session
        .in_transaction(|tx| {
            tx.persist(Pig::new(3, "Hen Wen"));
            CompletionHandle::completed(())
        })
        .await
        .unwrap();
    assert_eq!(fx.db.row_count("pig"), 1);
}
