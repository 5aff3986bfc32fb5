use super::{CompiledStatement, LogicalStatement, StatementCompiler, VersionCheck};
use crate::core::{PersistError, Result, Value};
use lazy_static::lazy_static;
use lru::LruCache;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

lazy_static! {
    static ref IDENTIFIER: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceholderStyle {
    /// `$1, $2, ...`
    #[default]
    Dollar,
    /// `?, ?, ...`
    Question,
}

/// Cache key: everything that determines the SQL text, nothing that is bound.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Shape {
    Insert {
        table: String,
        columns: Vec<String>,
        returning: Option<String>,
    },
    Update {
        table: String,
        columns: Vec<String>,
        key_column: String,
        version_column: Option<String>,
    },
    Delete {
        table: String,
        key_column: String,
        version_column: Option<String>,
    },
    Select {
        table: String,
        columns: Vec<String>,
        key_column: String,
    },
}

/// PostgreSQL-flavoured compiler for the statement shapes the session emits.
pub struct PgStatementCompiler {
    style: PlaceholderStyle,
    cache: Mutex<LruCache<Shape, Arc<str>>>,
}

impl PgStatementCompiler {
    pub fn new(style: PlaceholderStyle, cache_size: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            style,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn style(&self) -> PlaceholderStyle {
        self.style
    }

    pub fn cached_shapes(&self) -> usize {
        self.cache.lock().map(|cache| cache.len()).unwrap_or(0)
    }

    fn placeholder(&self, position: usize) -> String {
        match self.style {
            PlaceholderStyle::Dollar => format!("${}", position),
            PlaceholderStyle::Question => "?".to_string(),
        }
    }

    fn placeholders(&self, from: usize, count: usize) -> Vec<String> {
        (from..from + count).map(|p| self.placeholder(p)).collect()
    }

    fn sql_for(&self, shape: &Shape) -> Result<Arc<str>> {
        if let Some(sql) = self.cache.lock()?.get(shape) {
            return Ok(Arc::clone(sql));
        }
        let sql: Arc<str> = self.render(shape)?.into();
        self.cache.lock()?.put(shape.clone(), Arc::clone(&sql));
        Ok(sql)
    }

    fn render(&self, shape: &Shape) -> Result<String> {
        match shape {
            Shape::Insert {
                table,
                columns,
                returning,
            } => {
                check_identifiers(std::iter::once(table).chain(columns).chain(returning))?;
                let mut sql = if columns.is_empty() {
                    format!("insert into {} default values", table)
                } else {
                    format!(
                        "insert into {} ({}) values ({})",
                        table,
                        columns.join(", "),
                        self.placeholders(1, columns.len()).join(", ")
                    )
                };
                if let Some(column) = returning {
                    sql.push_str(" returning ");
                    sql.push_str(column);
                }
                Ok(sql)
            }
            Shape::Update {
                table,
                columns,
                key_column,
                version_column,
            } => {
                check_identifiers(
                    std::iter::once(table)
                        .chain(columns)
                        .chain(std::iter::once(key_column))
                        .chain(version_column),
                )?;
                if columns.is_empty() {
                    return Err(PersistError::MappingConfiguration(format!(
                        "Update of '{}' without assignments",
                        table
                    )));
                }
                let assignments = columns
                    .iter()
                    .zip(self.placeholders(1, columns.len()))
                    .map(|(column, p)| format!("{} = {}", column, p))
                    .collect::<Vec<_>>()
                    .join(", ");
                let mut sql = format!(
                    "update {} set {} where {} = {}",
                    table,
                    assignments,
                    key_column,
                    self.placeholder(columns.len() + 1)
                );
                if let Some(version) = version_column {
                    sql.push_str(&format!(
                        " and {} = {}",
                        version,
                        self.placeholder(columns.len() + 2)
                    ));
                }
                Ok(sql)
            }
            Shape::Delete {
                table,
                key_column,
                version_column,
            } => {
                check_identifiers(
                    [table, key_column]
                        .into_iter()
                        .chain(version_column),
                )?;
                let mut sql = format!(
                    "delete from {} where {} = {}",
                    table,
                    key_column,
                    self.placeholder(1)
                );
                if let Some(version) = version_column {
                    sql.push_str(&format!(" and {} = {}", version, self.placeholder(2)));
                }
                Ok(sql)
            }
            Shape::Select {
                table,
                columns,
                key_column,
            } => {
                check_identifiers(
                    std::iter::once(table)
                        .chain(columns)
                        .chain(std::iter::once(key_column)),
                )?;
                Ok(format!(
                    "select {} from {} where {} = {}",
                    columns.join(", "),
                    table,
                    key_column,
                    self.placeholder(1)
                ))
            }
        }
    }
}

impl Default for PgStatementCompiler {
    fn default() -> Self {
        Self::new(PlaceholderStyle::Dollar, 128)
    }
}

fn check_identifiers<'a>(names: impl IntoIterator<Item = &'a String>) -> Result<()> {
    for name in names {
        if !IDENTIFIER.is_match(name) {
            return Err(PersistError::MappingConfiguration(format!(
                "'{}' is not a valid SQL identifier",
                name
            )));
        }
    }
    Ok(())
}

fn version_column(version: &Option<VersionCheck>) -> Option<String> {
    version.as_ref().map(|check| check.column.clone())
}

impl StatementCompiler for PgStatementCompiler {
    fn compile(&self, statement: &LogicalStatement) -> Result<CompiledStatement> {
        let (shape, parameters) = match statement {
            LogicalStatement::Insert {
                table,
                columns,
                values,
                returning,
            } => {
                if columns.len() != values.len() {
                    return Err(PersistError::MappingConfiguration(format!(
                        "Insert into '{}' has {} columns and {} values",
                        table,
                        columns.len(),
                        values.len()
                    )));
                }
                let (columns, parameters): (Vec<String>, Vec<Value>) = columns
                    .iter()
                    .zip(values)
                    .filter(|(_, value)| !value.is_null())
                    .map(|(column, value)| (column.clone(), value.clone()))
                    .unzip();
                (
                    Shape::Insert {
                        table: table.clone(),
                        columns,
                        returning: returning.clone(),
                    },
                    parameters,
                )
            }
            LogicalStatement::Update {
                table,
                assignments,
                key_column,
                key,
                version,
            } => {
                let mut parameters: Vec<Value> =
                    assignments.iter().map(|(_, value)| value.clone()).collect();
                parameters.push(key.clone());
                if let Some(check) = version {
                    parameters.push(Value::Integer(check.expected));
                }
                (
                    Shape::Update {
                        table: table.clone(),
                        columns: assignments.iter().map(|(c, _)| c.clone()).collect(),
                        key_column: key_column.clone(),
                        version_column: version_column(version),
                    },
                    parameters,
                )
            }
            LogicalStatement::Delete {
                table,
                key_column,
                key,
                version,
            } => {
                let mut parameters = vec![key.clone()];
                if let Some(check) = version {
                    parameters.push(Value::Integer(check.expected));
                }
                (
                    Shape::Delete {
                        table: table.clone(),
                        key_column: key_column.clone(),
                        version_column: version_column(version),
                    },
                    parameters,
                )
            }
            LogicalStatement::Select {
                table,
                columns,
                key_column,
                key,
            } => (
                Shape::Select {
                    table: table.clone(),
                    columns: columns.clone(),
                    key_column: key_column.clone(),
                },
                vec![key.clone()],
            ),
        };

        let sql = self.sql_for(&shape)?;
        Ok(CompiledStatement {
            sql: sql.to_string(),
            parameters,
            affected_tables: BTreeSet::from([statement.table().to_string()]),
        })
    }
}
