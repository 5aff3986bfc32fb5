//! Mutation executor: turns actions into statements and runs them.
//!
//! Every statement acquires its own connection and releases it when the
//! round trip ends, whatever the outcome.

mod scope;

pub use scope::ConnectionScope;

use crate::action::{ActionData, ActionExecutor, ActionOutcome, ActionRequest};
use crate::connection::{ConnectionProvider, ExecuteResult};
use crate::core::{PersistError, Result, Row, Value};
use crate::metamodel::EntityDescriptor;
use crate::sql::{LogicalStatement, StatementCompiler, VersionCheck};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

pub struct MutationExecutor {
    compiler: Arc<dyn StatementCompiler>,
    provider: Arc<dyn ConnectionProvider>,
}

impl MutationExecutor {
    pub fn new(compiler: Arc<dyn StatementCompiler>, provider: Arc<dyn ConnectionProvider>) -> Self {
        Self { compiler, provider }
    }

    pub fn compiler(&self) -> &Arc<dyn StatementCompiler> {
        &self.compiler
    }

    /// Reads the row of `descriptor` with identifier `id`, if any.
    pub async fn load(&self, descriptor: &EntityDescriptor, id: &Value) -> Result<Option<Row>> {
        let statement = LogicalStatement::Select {
            table: descriptor.table().to_string(),
            columns: descriptor.select_columns(),
            key_column: descriptor.id_column().to_string(),
            key: id.clone(),
        };
        let span = info_span!(
            "rxorm.load",
            entity = %descriptor.entity_name(),
            id = %id
        );
        let result = self.run(&statement).instrument(span).await?;
        Ok(result.into_rows().into_iter().next())
    }

    /// Compiles and runs one statement on a freshly acquired connection.
    pub async fn run(&self, statement: &LogicalStatement) -> Result<ExecuteResult> {
        let compiled = self.compiler.compile(statement)?;
        let connection = self.provider.acquire().await?;
        let mut scope = ConnectionScope::new(connection);

        event!(Level::DEBUG, sql = %compiled.sql, parameters = compiled.parameters.len(), "executing statement");
        let result = scope.execute(&compiled.sql, &compiled.parameters).await;
        scope.release().await;

        result.map_err(|err| match err {
            PersistError::DatabaseExecution { message, sql: None } => {
                PersistError::database_with_sql(message, compiled.sql.clone())
            }
            other => other,
        })
    }

    async fn insert(&self, request: &ActionRequest) -> Result<ActionOutcome> {
        let ActionData::Insert {
            id,
            values,
            version,
        } = &request.data
        else {
            return Err(wrong_data(request));
        };
        let descriptor = &request.descriptor;

        let mut columns = Vec::with_capacity(values.len() + 2);
        let mut bound = Vec::with_capacity(values.len() + 2);
        if let Some(id) = id {
            columns.push(descriptor.id_column().to_string());
            bound.push(id.clone());
        }
        columns.extend(descriptor.column_names());
        bound.extend(values.iter().cloned());
        if let (Some(column), Some(version)) = (descriptor.version_column(), version) {
            columns.push(column.to_string());
            bound.push(Value::Integer(*version));
        }

        let returning = id.is_none().then(|| descriptor.id_column().to_string());
        let statement = LogicalStatement::Insert {
            table: descriptor.table().to_string(),
            columns,
            values: bound,
            returning,
        };

        let result = self.run(&statement).await?;
        let generated_id = match id {
            Some(_) => None,
            None => {
                let rows = result.into_rows();
                let generated = rows
                    .first()
                    .and_then(|row| row.get(descriptor.id_column()))
                    .filter(|value| !value.is_null())
                    .cloned()
                    .ok_or_else(|| PersistError::IdentifierGeneration {
                        entity: descriptor.entity_name().to_string(),
                        message: "database returned no generated identifier".to_string(),
                    })?;
                Some(generated)
            }
        };

        Ok(ActionOutcome {
            generated_id,
            rows: 1,
            patched: Vec::new(),
        })
    }

    async fn update(&self, request: &ActionRequest) -> Result<ActionOutcome> {
        let ActionData::Update {
            id,
            values,
            dirty,
            version,
        } = &request.data
        else {
            return Err(wrong_data(request));
        };
        let descriptor = &request.descriptor;
        let mapped = descriptor.columns();

        let mut assignments: Vec<(String, Value)> = if descriptor.dynamic_update() {
            dirty
                .iter()
                .filter_map(|idx| Some((mapped.get(*idx)?.name.clone(), values.get(*idx)?.clone())))
                .collect()
        } else {
            mapped
                .iter()
                .map(|c| c.name.clone())
                .zip(values.iter().cloned())
                .collect()
        };

        let check = match (descriptor.version_column(), version) {
            (Some(column), Some((expected, next))) => {
                assignments.push((column.to_string(), Value::Integer(*next)));
                Some(VersionCheck {
                    column: column.to_string(),
                    expected: *expected,
                })
            }
            _ => None,
        };

        let statement = LogicalStatement::Update {
            table: descriptor.table().to_string(),
            assignments,
            key_column: descriptor.id_column().to_string(),
            key: id.clone(),
            version: check,
        };
        let rows = self.run(&statement).await?.row_count();
        expect_one_row(descriptor, id, rows)
    }

    async fn delete(&self, request: &ActionRequest) -> Result<ActionOutcome> {
        let ActionData::Delete { id, version, .. } = &request.data else {
            return Err(wrong_data(request));
        };
        let descriptor = &request.descriptor;

        let check = match (descriptor.version_column(), version) {
            (Some(column), Some(expected)) => Some(VersionCheck {
                column: column.to_string(),
                expected: *expected,
            }),
            _ => None,
        };
        let statement = LogicalStatement::Delete {
            table: descriptor.table().to_string(),
            key_column: descriptor.id_column().to_string(),
            key: id.clone(),
            version: check,
        };
        let rows = self.run(&statement).await?.row_count();
        expect_one_row(descriptor, id, rows)
    }
}

fn expect_one_row(descriptor: &EntityDescriptor, id: &Value, rows: u64) -> Result<ActionOutcome> {
    if rows != 1 {
        return Err(PersistError::OptimisticLock {
            entity: descriptor.entity_name().to_string(),
            id: id.to_string(),
        });
    }
    Ok(ActionOutcome {
        generated_id: None,
        rows,
        patched: Vec::new(),
    })
}

fn wrong_data(request: &ActionRequest) -> PersistError {
    PersistError::IllegalState(format!(
        "{} carries data of the wrong kind",
        request.id
    ))
}

#[async_trait]
impl ActionExecutor for MutationExecutor {
    async fn execute(&self, request: &ActionRequest) -> Result<ActionOutcome> {
        let span = info_span!(
            "rxorm.action",
            action = %request.id,
            kind = %request.kind(),
            entity = %request.descriptor.entity_name()
        );
        async {
            let result = match request.kind() {
                crate::action::ActionKind::Insert => self.insert(request).await,
                crate::action::ActionKind::Update => self.update(request).await,
                crate::action::ActionKind::Delete => self.delete(request).await,
            };
            if let Err(err) = &result {
                event!(Level::DEBUG, error = %err, "action round trip failed");
            }
            result
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionId};
    use crate::core::DataType;
    use crate::memory::{MemoryDatabase, TableDef};
    use crate::metamodel::IdentifierStrategy;
    use crate::sql::PgStatementCompiler;

    fn pig_descriptor() -> Arc<EntityDescriptor> {
        Arc::new(
            EntityDescriptor::builder("Pig", "pig")
                .column("name", DataType::Text)
                .version("version")
                .build()
                .unwrap(),
        )
    }

    fn farm_descriptor() -> Arc<EntityDescriptor> {
        Arc::new(
            EntityDescriptor::builder("Farm", "farm")
                .strategy(IdentifierStrategy::Identity)
                .column("name", DataType::Text)
                .build()
                .unwrap(),
        )
    }

    fn setup() -> (MemoryDatabase, MutationExecutor) {
        let db = MemoryDatabase::new();
        db.create_table(
            TableDef::new("pig", "id", DataType::Integer)
                .column("name", DataType::Text)
                .column("version", DataType::Integer),
        )
        .unwrap();
        db.create_table(
            TableDef::new("farm", "id", DataType::Integer)
                .identity()
                .column("name", DataType::Text),
        )
        .unwrap();
        let executor = MutationExecutor::new(
            Arc::new(PgStatementCompiler::default()),
            Arc::new(db.clone()),
        );
        (db, executor)
    }

    fn request(descriptor: Arc<EntityDescriptor>, data: ActionData) -> ActionRequest {
        let (action, _handle) = Action::new(ActionId::new(1), descriptor, data);
        action.request().clone()
    }

    #[tokio::test]
    async fn test_insert_then_load() {
        let (db, executor) = setup();
        let insert = request(
            pig_descriptor(),
            ActionData::Insert {
                id: Some(Value::Integer(22)),
                values: vec![Value::from("Mibbles")],
                version: Some(0),
            },
        );
        let outcome = executor.execute(&insert).await.unwrap();
        assert_eq!(outcome.rows, 1);
        assert_eq!(outcome.generated_id, None);
        assert_eq!(
            db.statements(),
            vec!["insert into pig (id, name, version) values ($1, $2, $3)".to_string()]
        );

        let row = executor
            .load(&pig_descriptor(), &Value::Integer(22))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.get("name"), Some(&Value::from("Mibbles")));
        assert_eq!(row.get("version"), Some(&Value::Integer(0)));
        assert_eq!(db.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_identity_insert_returns_generated_id() {
        let (_db, executor) = setup();
        let insert = request(
            farm_descriptor(),
            ActionData::Insert {
                id: None,
                values: vec![Value::from("Oak")],
                version: None,
            },
        );
        let outcome = executor.execute(&insert).await.unwrap();
        assert_eq!(outcome.generated_id, Some(Value::Integer(1)));
    }

    #[tokio::test]
    async fn test_stale_version_is_optimistic_lock() {
        let (db, executor) = setup();
        db.insert_row(
            "pig",
            vec![
                ("id", Value::Integer(22)),
                ("name", Value::from("Mibbles")),
                ("version", Value::Integer(3)),
            ],
        )
        .unwrap();

        let update = request(
            pig_descriptor(),
            ActionData::Update {
                id: Value::Integer(22),
                values: vec![Value::from("Babe")],
                dirty: vec![0],
                version: Some((2, 3)),
            },
        );
        let err = executor.execute(&update).await.unwrap_err();
        assert!(matches!(err, PersistError::OptimisticLock { .. }));

        let delete = request(
            pig_descriptor(),
            ActionData::Delete {
                id: Value::Integer(22),
                deleted_state: vec![Value::from("Mibbles")],
                version: Some(3),
            },
        );
        executor.execute(&delete).await.unwrap();
        assert_eq!(db.row_count("pig"), 0);
    }

    #[tokio::test]
    async fn test_failure_releases_connection_and_carries_sql() {
        let (db, executor) = setup();
        db.fail_next("insert into pig", "constraint violated").unwrap();
        let insert = request(
            pig_descriptor(),
            ActionData::Insert {
                id: Some(Value::Integer(1)),
                values: vec![Value::from("Babe")],
                version: Some(0),
            },
        );
        match executor.execute(&insert).await {
            Err(PersistError::DatabaseExecution { sql, .. }) => {
                assert!(sql.unwrap().starts_with("insert into pig"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(db.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_load_missing_row() {
        let (_db, executor) = setup();
        let row = executor
            .load(&pig_descriptor(), &Value::Integer(404))
            .await
            .unwrap();
        assert!(row.is_none());
    }
}
