//! In-memory loopback database.
//!
//! Understands exactly the statement shapes [`PgStatementCompiler`] emits and
//! enforces primary keys, NOT NULL, column types, identity columns and
//! foreign keys (restrict on delete). Statements are logged and failures can
//! be injected, which is what the session tests rely on.
//!
//! [`PgStatementCompiler`]: crate::sql::PgStatementCompiler

pub mod parser;

use crate::connection::{
    Connection, ConnectionConfig, ConnectionManager, ConnectionProvider, ExecuteResult,
};
use crate::core::{DataType, PersistError, Result, Row, Value};
use crate::metamodel::{AssociationKind, EntityDescriptor, IdentifierStrategy, Metamodel};
use async_trait::async_trait;
use parser::{Binding, ParsedStatement};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub column: String,
    pub references: String,
}

/// Table definition. The primary key is always the first column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: String,
    pub primary_key: ColumnDef,
    pub columns: Vec<ColumnDef>,
    pub identity: bool,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableDef {
    pub fn new(name: impl Into<String>, primary_key: impl Into<String>, key_type: DataType) -> Self {
        Self {
            name: name.into(),
            primary_key: ColumnDef {
                name: primary_key.into(),
                data_type: key_type,
                nullable: false,
            },
            columns: Vec::new(),
            identity: false,
            foreign_keys: Vec::new(),
        }
    }

    /// The key is assigned by the database when an insert leaves it out.
    pub fn identity(mut self) -> Self {
        self.identity = true;
        self
    }

    pub fn column(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            data_type,
            nullable: false,
        });
        self
    }

    pub fn nullable_column(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            data_type,
            nullable: true,
        });
        self
    }

    pub fn foreign_key(mut self, column: impl Into<String>, references: impl Into<String>) -> Self {
        self.foreign_keys.push(ForeignKey {
            column: column.into(),
            references: references.into(),
        });
        self
    }

    /// Derives the table of a mapped entity, foreign keys included.
    pub fn for_entity(descriptor: &EntityDescriptor, metamodel: &Metamodel) -> Result<Self> {
        let mut table = Self::new(descriptor.table(), descriptor.id_column(), descriptor.id_type());
        if matches!(descriptor.id_strategy(), IdentifierStrategy::Identity) {
            table = table.identity();
        }
        for column in descriptor.columns() {
            table = if column.nullable {
                table.nullable_column(&column.name, column.data_type)
            } else {
                table.column(&column.name, column.data_type)
            };
        }
        if let Some(version) = descriptor.version_column() {
            table = table.column(version, DataType::Integer);
        }
        for association in descriptor.associations() {
            if let AssociationKind::ManyToOne { fk_column } = &association.kind {
                let target = metamodel.descriptor_by_name(&association.target)?;
                table = table.foreign_key(fk_column, target.table());
            }
        }
        Ok(table)
    }

    fn all_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        std::iter::once(&self.primary_key).chain(&self.columns)
    }

    fn position(&self, column: &str) -> Option<usize> {
        self.all_columns()
            .position(|c| c.name.eq_ignore_ascii_case(column))
    }
}

struct Table {
    def: TableDef,
    /// Full rows in column order, keyed by primary key.
    rows: HashMap<Value, Vec<Value>>,
    next_identity: i64,
}

#[derive(Debug, Clone)]
struct FailureRule {
    sql_contains: String,
    message: String,
    remaining: Option<usize>,
}

#[derive(Default)]
struct State {
    tables: HashMap<String, Table>,
    statements: Vec<String>,
    failures: Vec<FailureRule>,
    open_connections: usize,
    next_connection_id: u64,
    latency: Option<Duration>,
}

/// Shared handle to one in-memory database. Clones see the same data.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<State>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_table(&self, def: TableDef) -> Result<()> {
        let mut state = self.state.lock()?;
        let name = def.name.to_ascii_lowercase();
        if state.tables.contains_key(&name) {
            return Err(PersistError::database(format!(
                "relation \"{}\" already exists",
                def.name
            )));
        }
        state.tables.insert(
            name,
            Table {
                def,
                rows: HashMap::new(),
                next_identity: 1,
            },
        );
        Ok(())
    }

    /// Creates a table for every entity of `metamodel`.
    pub fn create_schema(&self, metamodel: &Metamodel) -> Result<()> {
        for descriptor in metamodel.descriptors() {
            self.create_table(TableDef::for_entity(descriptor, metamodel)?)?;
        }
        Ok(())
    }

    /// Fails the next statement containing `sql_contains`.
    pub fn fail_next(&self, sql_contains: &str, message: &str) -> Result<()> {
        self.add_failure(sql_contains, message, Some(1))
    }

    /// Fails every statement containing `sql_contains`.
    pub fn fail_always(&self, sql_contains: &str, message: &str) -> Result<()> {
        self.add_failure(sql_contains, message, None)
    }

    fn add_failure(&self, sql_contains: &str, message: &str, remaining: Option<usize>) -> Result<()> {
        self.state.lock()?.failures.push(FailureRule {
            sql_contains: sql_contains.to_string(),
            message: message.to_string(),
            remaining,
        });
        Ok(())
    }

    pub fn clear_failures(&self) -> Result<()> {
        self.state.lock()?.failures.clear();
        Ok(())
    }

    /// Delay applied before every statement.
    pub fn set_latency(&self, latency: Option<Duration>) -> Result<()> {
        self.state.lock()?.latency = latency;
        Ok(())
    }

    /// Every statement received so far, in order.
    pub fn statements(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|state| state.statements.clone())
            .unwrap_or_default()
    }

    /// Number of logged statements starting with `prefix` (case-insensitive).
    pub fn count_statements(&self, prefix: &str) -> usize {
        let prefix = prefix.to_ascii_lowercase();
        self.statements()
            .iter()
            .filter(|sql| sql.to_ascii_lowercase().starts_with(&prefix))
            .count()
    }

    pub fn clear_statements(&self) -> Result<()> {
        self.state.lock()?.statements.clear();
        Ok(())
    }

    pub fn open_connections(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.open_connections)
            .unwrap_or(0)
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.state
            .lock()
            .ok()
            .and_then(|state| {
                state
                    .tables
                    .get(&table.to_ascii_lowercase())
                    .map(|t| t.rows.len())
            })
            .unwrap_or(0)
    }

    /// Reads one row directly, bypassing the statement log.
    pub fn row(&self, table: &str, key: &Value) -> Option<Row> {
        let state = self.state.lock().ok()?;
        let table = state.tables.get(&table.to_ascii_lowercase())?;
        let values = table.rows.get(key)?;
        Some(Row::from_pairs(
            table
                .def
                .all_columns()
                .map(|c| c.name.clone())
                .zip(values.iter().cloned()),
        ))
    }

    /// Seeds a row directly, bypassing the statement log and failure rules.
    pub fn insert_row(&self, table: &str, pairs: Vec<(&str, Value)>) -> Result<()> {
        let mut state = self.state.lock()?;
        let parameters: Vec<Value> = pairs.iter().map(|(_, v)| v.clone()).collect();
        let columns: Vec<Binding> = pairs
            .iter()
            .enumerate()
            .map(|(idx, (c, _))| (c.to_string(), idx))
            .collect();
        state.insert(table, &columns, None, &parameters).map(|_| ())
    }

    pub async fn open_connection(&self) -> MemoryConnection {
        let id = match self.state.lock() {
            Ok(mut state) => {
                state.open_connections += 1;
                state.next_connection_id += 1;
                state.next_connection_id
            }
            Err(_) => 0,
        };
        MemoryConnection {
            id,
            db: self.clone(),
        }
    }

    fn execute(&self, sql: &str, parameters: &[Value]) -> Result<ExecuteResult> {
        let mut state = self.state.lock()?;
        state.statements.push(sql.to_string());

        if let Some(message) = state.take_failure(sql) {
            return Err(PersistError::database_with_sql(message, sql));
        }

        let result = match parser::parse(sql)? {
            ParsedStatement::Insert {
                table,
                columns,
                returning,
            } => state.insert(&table, &columns, returning.as_deref(), parameters),
            ParsedStatement::Update {
                table,
                assignments,
                key,
                version,
            } => state.update(&table, &assignments, &key, version.as_ref(), parameters),
            ParsedStatement::Delete {
                table,
                key,
                version,
            } => state.delete(&table, &key, version.as_ref(), parameters),
            ParsedStatement::Select {
                table,
                columns,
                key,
            } => state.select(&table, &columns, &key, parameters),
        };
        result.map_err(|err| match err {
            PersistError::DatabaseExecution { message, sql: None } => {
                PersistError::database_with_sql(message, sql)
            }
            other => other,
        })
    }

    fn latency(&self) -> Option<Duration> {
        self.state.lock().ok().and_then(|state| state.latency)
    }
}

fn parameter(parameters: &[Value], index: usize) -> Result<Value> {
    parameters.get(index).cloned().ok_or_else(|| {
        PersistError::database(format!(
            "bind message supplies {} parameters, statement needs ${}",
            parameters.len(),
            index + 1
        ))
    })
}

fn check_value(table: &TableDef, column: &ColumnDef, value: &Value) -> Result<()> {
    if value.is_null() && !column.nullable {
        return Err(PersistError::database(format!(
            "null value in column \"{}\" of relation \"{}\" violates not-null constraint",
            column.name, table.name
        )));
    }
    if !column.data_type.is_compatible(value) {
        return Err(PersistError::database(format!(
            "column \"{}\" is of type {} but expression is of type {}",
            column.name,
            column.data_type,
            value.type_name()
        )));
    }
    Ok(())
}

impl State {
    fn take_failure(&mut self, sql: &str) -> Option<String> {
        let position = self
            .failures
            .iter()
            .position(|rule| sql.contains(&rule.sql_contains))?;
        let rule = &mut self.failures[position];
        let message = rule.message.clone();
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                self.failures.remove(position);
            }
        }
        Some(message)
    }

    fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| PersistError::database(format!("relation \"{}\" does not exist", name)))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(&name.to_ascii_lowercase())
            .ok_or_else(|| PersistError::database(format!("relation \"{}\" does not exist", name)))
    }

    fn column_position(def: &TableDef, column: &str) -> Result<usize> {
        def.position(column).ok_or_else(|| {
            PersistError::database(format!(
                "column \"{}\" of relation \"{}\" does not exist",
                column, def.name
            ))
        })
    }

    fn check_foreign_keys(&self, def: &TableDef, row: &[Value]) -> Result<()> {
        for fk in &def.foreign_keys {
            let position = Self::column_position(def, &fk.column)?;
            let value = &row[position];
            if value.is_null() {
                continue;
            }
            let referenced = self.table(&fk.references)?;
            if !referenced.rows.contains_key(value) {
                return Err(PersistError::database(format!(
                    "insert or update on table \"{}\" violates foreign key constraint on \"{}\": key {} is not present in table \"{}\"",
                    def.name, fk.column, value, fk.references
                )));
            }
        }
        Ok(())
    }

    fn insert(
        &mut self,
        table: &str,
        columns: &[Binding],
        returning: Option<&str>,
        parameters: &[Value],
    ) -> Result<ExecuteResult> {
        let def = self.table(table)?.def.clone();
        let mut row = vec![Value::Null; def.columns.len() + 1];
        for (column, index) in columns {
            let position = Self::column_position(&def, column)?;
            row[position] = parameter(parameters, *index)?;
        }

        if row[0].is_null() && def.identity {
            let target = self.table_mut(table)?;
            row[0] = Value::Integer(target.next_identity);
        }
        for (column, value) in def.all_columns().zip(&row) {
            check_value(&def, column, value)?;
        }
        self.check_foreign_keys(&def, &row)?;

        let target = self.table_mut(table)?;
        if target.rows.contains_key(&row[0]) {
            return Err(PersistError::database(format!(
                "duplicate key value violates unique constraint \"{}_pkey\": key {} already exists",
                def.name, row[0]
            )));
        }
        if let Some(id) = row[0].as_i64() {
            target.next_identity = target.next_identity.max(id + 1);
        }

        let result = match returning {
            Some(column) => {
                let position = Self::column_position(&def, column)?;
                ExecuteResult::Rows(vec![Row::from_pairs([(
                    column.to_string(),
                    row[position].clone(),
                )])])
            }
            None => ExecuteResult::Count(1),
        };
        target.rows.insert(row[0].clone(), row);
        Ok(result)
    }

    fn matches_version(def: &TableDef, row: &[Value], version: Option<&Binding>, parameters: &[Value]) -> Result<bool> {
        match version {
            Some((column, index)) => {
                let position = Self::column_position(def, column)?;
                Ok(row[position] == parameter(parameters, *index)?)
            }
            None => Ok(true),
        }
    }

    fn update(
        &mut self,
        table: &str,
        assignments: &[Binding],
        key: &Binding,
        version: Option<&Binding>,
        parameters: &[Value],
    ) -> Result<ExecuteResult> {
        let def = self.table(table)?.def.clone();
        let key_value = parameter(parameters, key.1)?;
        let Some(current) = self.table(table)?.rows.get(&key_value).cloned() else {
            return Ok(ExecuteResult::Count(0));
        };
        if !Self::matches_version(&def, &current, version, parameters)? {
            return Ok(ExecuteResult::Count(0));
        }

        let mut row = current;
        for (column, index) in assignments {
            let position = Self::column_position(&def, column)?;
            if position == 0 {
                return Err(PersistError::database(format!(
                    "updating primary key \"{}\" is not supported",
                    column
                )));
            }
            let value = parameter(parameters, *index)?;
            check_value(&def, &def.columns[position - 1], &value)?;
            row[position] = value;
        }
        self.check_foreign_keys(&def, &row)?;
        self.table_mut(table)?.rows.insert(key_value, row);
        Ok(ExecuteResult::Count(1))
    }

    fn delete(
        &mut self,
        table: &str,
        key: &Binding,
        version: Option<&Binding>,
        parameters: &[Value],
    ) -> Result<ExecuteResult> {
        let def = self.table(table)?.def.clone();
        let key_value = parameter(parameters, key.1)?;
        let Some(current) = self.table(table)?.rows.get(&key_value) else {
            return Ok(ExecuteResult::Count(0));
        };
        if !Self::matches_version(&def, current, version, parameters)? {
            return Ok(ExecuteResult::Count(0));
        }

        for other in self.tables.values() {
            for fk in &other.def.foreign_keys {
                if !fk.references.eq_ignore_ascii_case(&def.name) {
                    continue;
                }
                let position = Self::column_position(&other.def, &fk.column)?;
                if other.rows.values().any(|row| row[position] == key_value) {
                    return Err(PersistError::database(format!(
                        "update or delete on table \"{}\" violates foreign key constraint on table \"{}\": key {} is still referenced",
                        def.name, other.def.name, key_value
                    )));
                }
            }
        }

        self.table_mut(table)?.rows.remove(&key_value);
        Ok(ExecuteResult::Count(1))
    }

    fn select(
        &self,
        table: &str,
        columns: &[String],
        key: &Binding,
        parameters: &[Value],
    ) -> Result<ExecuteResult> {
        let target = self.table(table)?;
        let positions = columns
            .iter()
            .map(|c| Self::column_position(&target.def, c))
            .collect::<Result<Vec<_>>>()?;
        let key_value = parameter(parameters, key.1)?;
        if Self::column_position(&target.def, &key.0)? != 0 {
            return Err(PersistError::database(
                "only primary key lookups are supported",
            ));
        }

        let rows = match target.rows.get(&key_value) {
            Some(values) => {
                let header: Arc<[String]> = columns.to_vec().into();
                vec![Row::new(
                    header,
                    positions.iter().map(|p| values[*p].clone()).collect(),
                )]
            }
            None => Vec::new(),
        };
        Ok(ExecuteResult::Rows(rows))
    }
}

/// One logical connection to a [`MemoryDatabase`].
pub struct MemoryConnection {
    id: u64,
    db: MemoryDatabase,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn id(&self) -> u64 {
        self.id
    }

    async fn execute(&mut self, sql: &str, parameters: &[Value]) -> Result<ExecuteResult> {
        if let Some(latency) = self.db.latency() {
            tokio::time::sleep(latency).await;
        }
        self.db.execute(sql, parameters)
    }

    async fn release(self: Box<Self>) {
        if let Ok(mut state) = self.db.state.lock() {
            state.open_connections = state.open_connections.saturating_sub(1);
        }
    }
}

#[async_trait]
impl ConnectionManager for MemoryDatabase {
    async fn connect(&self, _config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        Ok(Box::new(self.open_connection().await))
    }
}

/// Unpooled provider: every acquire opens a new logical connection.
#[async_trait]
impl ConnectionProvider for MemoryDatabase {
    async fn acquire(&self) -> Result<Box<dyn Connection>> {
        Ok(Box::new(self.open_connection().await))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn farm_db() -> MemoryDatabase {
        let db = MemoryDatabase::new();
        db.create_table(
            TableDef::new("farm", "id", DataType::Integer)
                .identity()
                .column("name", DataType::Text),
        )
        .unwrap();
        db.create_table(
            TableDef::new("pig", "id", DataType::Integer)
                .column("name", DataType::Text)
                .nullable_column("farm_id", DataType::Integer)
                .column("version", DataType::Integer)
                .foreign_key("farm_id", "farm"),
        )
        .unwrap();
        db
    }

    async fn run(db: &MemoryDatabase, sql: &str, parameters: Vec<Value>) -> Result<ExecuteResult> {
        let mut connection = db.open_connection().await;
        let result = connection.execute(sql, &parameters).await;
        Box::new(connection).release().await;
        result
    }

    #[tokio::test]
    async fn test_identity_insert_returns_generated_key() {
        let db = farm_db();
        let first = run(
            &db,
            "insert into farm (name) values ($1) returning id",
            vec![Value::from("Oak")],
        )
        .await
        .unwrap();
        let rows = first.into_rows();
        assert_eq!(rows[0].get("id"), Some(&Value::Integer(1)));

        let second = run(&db, "insert into farm default values returning id", vec![]).await;
        // name is NOT NULL
        assert!(second.unwrap_err().is_database_error());
        assert_eq!(db.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_foreign_keys_are_enforced() {
        let db = farm_db();
        let orphan = run(
            &db,
            "insert into pig (id, name, farm_id, version) values ($1, $2, $3, $4)",
            vec![Value::Integer(1), Value::from("Babe"), Value::Integer(7), Value::Integer(0)],
        )
        .await;
        assert!(orphan.is_err());

        db.insert_row("farm", vec![("id", Value::Integer(7)), ("name", Value::from("Elm"))])
            .unwrap();
        run(
            &db,
            "insert into pig (id, name, farm_id, version) values ($1, $2, $3, $4)",
            vec![Value::Integer(1), Value::from("Babe"), Value::Integer(7), Value::Integer(0)],
        )
        .await
        .unwrap();

        let restricted = run(&db, "delete from farm where id = $1", vec![Value::Integer(7)]).await;
        assert!(restricted.is_err());
    }

    #[tokio::test]
    async fn test_versioned_update_counts_rows() {
        let db = farm_db();
        db.insert_row(
            "pig",
            vec![
                ("id", Value::Integer(22)),
                ("name", Value::from("Mibbles")),
                ("version", Value::Integer(0)),
            ],
        )
        .unwrap();

        let sql = "update pig set name = $1, version = $2 where id = $3 and version = $4";
        let params = vec![
            Value::from("Babe"),
            Value::Integer(1),
            Value::Integer(22),
            Value::Integer(0),
        ];
        assert_eq!(run(&db, sql, params.clone()).await.unwrap(), ExecuteResult::Count(1));
        // Same expected version again: stale
        assert_eq!(run(&db, sql, params).await.unwrap(), ExecuteResult::Count(0));

        let row = db.row("pig", &Value::Integer(22)).unwrap();
        assert_eq!(row.get("name"), Some(&Value::from("Babe")));
        assert_eq!(row.get("version"), Some(&Value::Integer(1)));
    }

    #[tokio::test]
    async fn test_failure_injection_and_log() {
        let db = farm_db();
        db.fail_next("into farm", "disk full").unwrap();
        let failed = run(
            &db,
            "insert into farm (name) values ($1) returning id",
            vec![Value::from("Oak")],
        )
        .await;
        match failed {
            Err(PersistError::DatabaseExecution { message, sql }) => {
                assert_eq!(message, "disk full");
                assert!(sql.unwrap().contains("farm"));
            }
            other => panic!("unexpected {:?}", other),
        }
        run(
            &db,
            "insert into farm (name) values ($1) returning id",
            vec![Value::from("Oak")],
        )
        .await
        .unwrap();

        assert_eq!(db.count_statements("insert into farm"), 2);
        assert_eq!(db.row_count("farm"), 1);
    }

    #[tokio::test]
    async fn test_select_missing_row_is_empty() {
        let db = farm_db();
        let result = run(&db, "select id, name from farm where id = $1", vec![Value::Integer(5)])
            .await
            .unwrap();
        assert_eq!(result, ExecuteResult::Rows(Vec::new()));
    }
}
