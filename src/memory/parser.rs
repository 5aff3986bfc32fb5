use crate::core::{PersistError, Result};
use lazy_static::lazy_static;
use regex::{Captures, Regex};

lazy_static! {
    static ref INSERT: Regex = Regex::new(
        r"(?i)^insert into (\w+) \(([^)]*)\) values \(([^)]*)\)(?: returning (\w+))?$"
    )
    .unwrap();
    static ref INSERT_DEFAULT: Regex =
        Regex::new(r"(?i)^insert into (\w+) default values(?: returning (\w+))?$").unwrap();
    static ref UPDATE: Regex = Regex::new(
        r"(?i)^update (\w+) set (.+?) where (\w+) = (\$\d+|\?)(?: and (\w+) = (\$\d+|\?))?$"
    )
    .unwrap();
    static ref DELETE: Regex = Regex::new(
        r"(?i)^delete from (\w+) where (\w+) = (\$\d+|\?)(?: and (\w+) = (\$\d+|\?))?$"
    )
    .unwrap();
    static ref SELECT: Regex =
        Regex::new(r"(?i)^select (.+?) from (\w+) where (\w+) = (\$\d+|\?)$").unwrap();
    static ref ASSIGNMENT: Regex = Regex::new(r"^(\w+) = (\$\d+|\?)$").unwrap();
}

/// `(column, parameter index)`
pub type Binding = (String, usize);

/// Statement shapes understood by the in-memory database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedStatement {
    Insert {
        table: String,
        columns: Vec<Binding>,
        returning: Option<String>,
    },
    Update {
        table: String,
        assignments: Vec<Binding>,
        key: Binding,
        version: Option<Binding>,
    },
    Delete {
        table: String,
        key: Binding,
        version: Option<Binding>,
    },
    Select {
        table: String,
        columns: Vec<String>,
        key: Binding,
    },
}

/// Maps `$n` and `?` placeholders to parameter indexes in textual order.
struct Placeholders {
    next: usize,
}

impl Placeholders {
    fn new() -> Self {
        Self { next: 0 }
    }

    fn resolve(&mut self, token: &str) -> Result<usize> {
        let token = token.trim();
        if token == "?" {
            self.next += 1;
            return Ok(self.next - 1);
        }
        token
            .strip_prefix('$')
            .and_then(|n| n.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .map(|n| n - 1)
            .ok_or_else(|| syntax_error(&format!("invalid placeholder '{}'", token)))
    }
}

fn syntax_error(message: &str) -> PersistError {
    PersistError::database(format!("syntax error: {}", message))
}

fn group(captures: &Captures<'_>, index: usize) -> Option<String> {
    captures.get(index).map(|m| m.as_str().to_string())
}

fn list(text: &str) -> Vec<&str> {
    text.split(',').map(str::trim).filter(|s| !s.is_empty()).collect()
}

pub fn parse(sql: &str) -> Result<ParsedStatement> {
    let sql = sql.trim().trim_end_matches(';');
    let mut placeholders = Placeholders::new();

    if let Some(c) = INSERT.captures(sql) {
        let names = list(&c[2]);
        let tokens = list(&c[3]);
        if names.len() != tokens.len() {
            return Err(syntax_error("INSERT has more target columns than expressions"));
        }
        let mut columns = Vec::with_capacity(names.len());
        for (name, token) in names.into_iter().zip(tokens) {
            columns.push((name.to_string(), placeholders.resolve(token)?));
        }
        return Ok(ParsedStatement::Insert {
            table: c[1].to_string(),
            columns,
            returning: group(&c, 4),
        });
    }

    if let Some(c) = INSERT_DEFAULT.captures(sql) {
        return Ok(ParsedStatement::Insert {
            table: c[1].to_string(),
            columns: Vec::new(),
            returning: group(&c, 2),
        });
    }

    if let Some(c) = UPDATE.captures(sql) {
        let mut assignments = Vec::new();
        for assignment in list(&c[2]) {
            let a = ASSIGNMENT
                .captures(assignment)
                .ok_or_else(|| syntax_error(&format!("invalid assignment '{}'", assignment)))?;
            assignments.push((a[1].to_string(), placeholders.resolve(&a[2])?));
        }
        let key = (c[3].to_string(), placeholders.resolve(&c[4])?);
        let version = match (c.get(5), c.get(6)) {
            (Some(column), Some(token)) => Some((
                column.as_str().to_string(),
                placeholders.resolve(token.as_str())?,
            )),
            _ => None,
        };
        return Ok(ParsedStatement::Update {
            table: c[1].to_string(),
            assignments,
            key,
            version,
        });
    }

    if let Some(c) = DELETE.captures(sql) {
        let key = (c[2].to_string(), placeholders.resolve(&c[3])?);
        let version = match (c.get(4), c.get(5)) {
            (Some(column), Some(token)) => Some((
                column.as_str().to_string(),
                placeholders.resolve(token.as_str())?,
            )),
            _ => None,
        };
        return Ok(ParsedStatement::Delete {
            table: c[1].to_string(),
            key,
            version,
        });
    }

    if let Some(c) = SELECT.captures(sql) {
        return Ok(ParsedStatement::Select {
            columns: list(&c[1]).into_iter().map(str::to_string).collect(),
            table: c[2].to_string(),
            key: (c[3].to_string(), placeholders.resolve(&c[4])?),
        });
    }

    Err(syntax_error(&format!("unsupported statement: {}", sql)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_insert_with_returning() {
        let parsed = parse("insert into farm (name, size) values ($1, $2) returning id").unwrap();
        assert_eq!(
            parsed,
            ParsedStatement::Insert {
                table: "farm".into(),
                columns: vec![("name".into(), 0), ("size".into(), 1)],
                returning: Some("id".into()),
            }
        );
    }

    #[test]
    fn test_parse_update_with_question_marks() {
        let parsed = parse("update pig set name = ?, version = ? where id = ? and version = ?").unwrap();
        assert_eq!(
            parsed,
            ParsedStatement::Update {
                table: "pig".into(),
                assignments: vec![("name".into(), 0), ("version".into(), 1)],
                key: ("id".into(), 2),
                version: Some(("version".into(), 3)),
            }
        );
    }

    #[test]
    fn test_parse_delete_and_select() {
        assert_eq!(
            parse("delete from pig where id = $1").unwrap(),
            ParsedStatement::Delete {
                table: "pig".into(),
                key: ("id".into(), 0),
                version: None,
            }
        );
        assert_eq!(
            parse("select id, name from pig where id = $1").unwrap(),
            ParsedStatement::Select {
                table: "pig".into(),
                columns: vec!["id".into(), "name".into()],
                key: ("id".into(), 0),
            }
        );
    }

    #[test]
    fn test_unsupported_statement() {
        assert!(parse("drop table pig").unwrap_err().is_database_error());
        assert!(parse("insert into pig (id, name) values ($1)").is_err());
    }
}
