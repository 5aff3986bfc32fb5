/// Flush and batch execution tests
///
/// Ordering, failure isolation, optimistic locking and connection handling.
/// Run with: cargo test --test flush_tests

mod common;

use common::{Pig, fixture, fixture_with, manual_flush};
use rxorm::prelude::*;
use rxorm::{ConnectionConfig, ConnectionPool};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_manual_flush_defers_statements() {
    let fx = fixture_with(manual_flush());
    let session = fx.factory.open_session().unwrap();

    let persisted = session.persist(Pig::new(1, "Babe"));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(fx.db.statements().is_empty());
    assert_eq!(
        session.entity_status::<Pig>(1).await.unwrap(),
        Some(EntityStatus::Saving)
    );

    session.flush().await.unwrap();
    persisted.await.unwrap();
    assert_eq!(fx.db.row_count("pig"), 1);
    assert_eq!(
        session.entity_status::<Pig>(1).await.unwrap(),
        Some(EntityStatus::Managed)
    );
}

#[tokio::test]
async fn test_overlapping_flushes_execute_each_action_once() {
    let fx = fixture_with(manual_flush());
    fx.db.set_latency(Some(Duration::from_millis(5))).unwrap();
    let session = fx.factory.open_session().unwrap();

    let persisted = session.persist(Pig::new(1, "Babe"));
    let first = session.flush();
    let second = session.flush();

    second.await.unwrap();
    first.await.unwrap();
    persisted.await.unwrap();
    assert_eq!(fx.db.count_statements("insert"), 1);
}

#[tokio::test]
async fn test_failed_action_does_not_stop_the_batch() {
    let fx = fixture_with(manual_flush());
    fx.db
        .fail_next("insert into pig", "disk full")
        .unwrap();
    let session = fx.factory.open_session().unwrap();

    let first = session.persist(Pig::new(1, "Babe"));
    let second = session.persist(Pig::new(2, "Wilbur"));

    match session.flush().await {
        Err(PersistError::FlushFailed {
            failed,
            total,
            first,
        }) => {
            assert_eq!((failed, total), (1, 2));
            assert!(first.is_database_error());
        }
        other => panic!("expected FlushFailed, got {:?}", other),
    }

    match first.await {
        Err(PersistError::DatabaseExecution { message, sql }) => {
            assert_eq!(message, "disk full");
            assert!(sql.unwrap().starts_with("insert into pig"));
        }
        other => panic!("expected DatabaseExecution, got {:?}", other),
    }
    second.await.unwrap();

    assert_eq!(fx.db.row("pig", &Value::Integer(1)), None);
    assert!(fx.db.row("pig", &Value::Integer(2)).is_some());
    assert_eq!(session.entity_status::<Pig>(1).await.unwrap(), None);
    assert_eq!(
        session.entity_status::<Pig>(2).await.unwrap(),
        Some(EntityStatus::Managed)
    );
}

#[tokio::test]
async fn test_failed_delete_keeps_entity_managed() {
    let fx = fixture();
    let session = fx.factory.open_session().unwrap();
    let pig = Pig::new(3, "Napoleon");
    session.persist(pig.clone()).await.unwrap();

    fx.db.fail_next("delete from pig", "lock timeout").unwrap();
    let err = session.remove(&pig).await.unwrap_err();
    assert!(err.is_database_error());

    assert_eq!(
        session.entity_status::<Pig>(3).await.unwrap(),
        Some(EntityStatus::Managed)
    );
    session.remove(&pig).await.unwrap();
    assert_eq!(fx.db.row_count("pig"), 0);
}

#[tokio::test]
async fn test_concurrent_update_is_an_optimistic_lock_failure() {
    let fx = fixture();
    let first = fx.factory.open_session().unwrap();
    first.persist(Pig::new(7, "Boxer")).await.unwrap();

    let second = fx.factory.open_session().unwrap();
    let mut stale = second.find::<Pig>(7).await.unwrap().unwrap();

    let mut fresh = first.find::<Pig>(7).await.unwrap().unwrap();
    fresh.name = "Boxer the Strong".into();
    first.merge(&fresh).await.unwrap();
    first.flush().await.unwrap();

    stale.name = "Boxer the Weak".into();
    second.merge(&stale).await.unwrap();
    match second.flush().await {
        Err(PersistError::FlushFailed { first, .. }) => {
            assert!(matches!(*first, PersistError::OptimisticLock { .. }));
        }
        other => panic!("expected FlushFailed, got {:?}", other),
    }

    let row = fx.db.row("pig", &Value::Integer(7)).unwrap();
    assert_eq!(row.get("name"), Some(&Value::Text("Boxer the Strong".into())));
    // The stale instance was evicted; the next read sees the winner.
    let reread = second.find::<Pig>(7).await.unwrap().unwrap();
    assert_eq!(reread.name, "Boxer the Strong");
}

#[tokio::test]
async fn test_clear_abandons_pending_actions() {
    let fx = fixture_with(manual_flush());
    let session = fx.factory.open_session().unwrap();

    let persisted = session.persist(Pig::new(1, "Babe"));
    session.clear().await.unwrap();

    assert!(matches!(persisted.await, Err(PersistError::Abandoned(_))));
    session.flush().await.unwrap();
    assert!(fx.db.statements().is_empty());
    assert_eq!(session.entity_status::<Pig>(1).await.unwrap(), None);
}

#[tokio::test]
async fn test_closed_session_rejects_calls() {
    let fx = fixture();
    let session = fx.factory.open_session().unwrap();
    session.persist(Pig::new(1, "Babe")).await.unwrap();

    session.close().await.unwrap();
    assert!(matches!(
        session.persist(Pig::new(2, "Wilbur")).await,
        Err(PersistError::SessionClosed)
    ));
    assert!(matches!(
        session.find::<Pig>(1).await,
        Err(PersistError::SessionClosed)
    ));
    assert_eq!(fx.db.row_count("pig"), 1);
}

#[tokio::test]
async fn test_close_waits_for_in_flight_batch() {
    let fx = fixture_with(manual_flush());
    fx.db.set_latency(Some(Duration::from_millis(20))).unwrap();
    let session = fx.factory.open_session().unwrap();

    let persisted = session.persist(Pig::new(1, "Babe"));
    let flushed = session.flush();
    session.close().await.unwrap();

    assert_eq!(fx.db.row_count("pig"), 1);
    flushed.await.unwrap();
    persisted.await.unwrap();
}

#[tokio::test]
async fn test_pool_connections_are_returned_after_failures() {
    let db = MemoryDatabase::new();
    let pool = ConnectionPool::new(
        ConnectionConfig::new("rxorm", "").max_connections(2),
        db.clone(),
    )
    .await
    .unwrap();
    let pool = Arc::new(pool);
    let factory = SessionFactory::builder()
        .register::<Pig>()
        .provider(pool.clone())
        .build()
        .unwrap();
    db.create_schema(factory.metamodel()).unwrap();
    db.fail_always("insert into pig", "read-only transaction").unwrap();

    let session = factory.open_session().unwrap();
    for id in 0..5 {
        assert!(session.persist(Pig::new(id, "Doomed")).await.is_err());
    }

    let stats = pool.stats().await;
    assert_eq!(stats.active_connections, 0);
    assert!(stats.total_connections <= 2);

    db.clear_failures().unwrap();
    session.persist(Pig::new(10, "Survivor")).await.unwrap();
    assert_eq!(db.row_count("pig"), 1);
}

#[tokio::test]
async fn test_statistics_roll_up_to_factory() {
    let fx = fixture();
    let writer = fx.factory.open_session().unwrap();
    writer.persist(Pig::new(1, "Babe")).await.unwrap();
    writer.persist(Pig::new(2, "Wilbur")).await.unwrap();

    let reader = fx.factory.open_session().unwrap();
    reader.find::<Pig>(1).await.unwrap();
    reader.find::<Pig>(1).await.unwrap();

    let written = writer.statistics();
    assert_eq!(written.inserts, 2);
    assert_eq!(written.flushes, 2);

    let read = reader.statistics();
    assert_eq!(read.loads, 1);
    assert_eq!(read.cache_hits, 1);

    let total = fx.factory.statistics();
    assert_eq!(total.inserts, 2);
    assert_eq!(total.loads, 1);
}
