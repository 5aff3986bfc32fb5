#![allow(dead_code)]

use rxorm::prelude::*;
use std::sync::Arc;

/// Assigned identifier, versioned.
#[derive(Debug, Clone, PartialEq)]
pub struct Pig {
    pub id: Option<i64>,
    pub name: String,
}

impl Pig {
    pub fn new(id: i64, name: &str) -> Self {
        Self {
            id: Some(id),
            name: name.to_string(),
        }
    }
}

impl Entity for Pig {
    fn descriptor() -> EntityDescriptor {
        EntityDescriptor::builder("Pig", "pig")
            .id("id", DataType::Integer)
            .column("name", DataType::Text)
            .version("version")
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
        vec![("name", Value::Text(self.name.clone()))]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.require("id")?.as_i64(),
            name: text(row, "name")?,
        })
    }
}

/// Identity identifier; owns its piglets.
#[derive(Debug, Clone, PartialEq)]
pub struct Farm {
    pub id: Option<i64>,
    pub name: String,
    pub piglets: Vec<Piglet>,
}

impl Farm {
    pub fn new(name: &str, piglets: Vec<Piglet>) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            piglets,
        }
    }
}

impl Entity for Farm {
    fn descriptor() -> EntityDescriptor {
        EntityDescriptor::builder("Farm", "farm")
            .id("id", DataType::Integer)
            .strategy(IdentifierStrategy::Identity)
            .column("name", DataType::Text)
            .association(
                AssociationMapping::one_to_many("piglets", "Piglet", "farm_id")
                    .cascade(CascadeStyle::All),
            )
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
        vec![("name", Value::Text(self.name.clone()))]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.require("id")?.as_i64(),
            name: text(row, "name")?,
            piglets: Vec::new(),
        })
    }

    fn associated(&self, association: &str) -> Vec<EntityRef> {
        match association {
            "piglets" => self.piglets.iter().cloned().map(EntityRef::new).collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Piglet {
    pub id: Option<i64>,
    pub name: String,
    pub farm_id: Option<i64>,
}

impl Piglet {
    pub fn new(id: i64, name: &str) -> Self {
        Self {
            id: Some(id),
            name: name.to_string(),
            farm_id: None,
        }
    }
}

impl Entity for Piglet {
    fn descriptor() -> EntityDescriptor {
        EntityDescriptor::builder("Piglet", "piglet")
            .id("id", DataType::Integer)
            .column("name", DataType::Text)
            .nullable_column("farm_id", DataType::Integer)
            .association(AssociationMapping::many_to_one("farm", "Farm", "farm_id"))
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
        vec![
            ("name", Value::Text(self.name.clone())),
            ("farm_id", self.farm_id.into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.require("id")?.as_i64(),
            name: text(row, "name")?,
            farm_id: row.require("farm_id")?.as_i64(),
        })
    }

    fn set_column(&mut self, column: &str, value: Value) -> Result<()> {
        match column {
            "farm_id" => {
                self.farm_id = value.as_i64();
                Ok(())
            }
            other => Err(PersistError::MappingConfiguration(format!(
                "Piglet has no assignable column '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sty {
    pub id: Option<i64>,
    pub name: String,
}

impl Entity for Sty {
    fn descriptor() -> EntityDescriptor {
        EntityDescriptor::builder("Sty", "sty")
            .id("id", DataType::Integer)
            .column("name", DataType::Text)
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
        vec![("name", Value::Text(self.name.clone()))]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.require("id")?.as_i64(),
            name: text(row, "name")?,
        })
    }
}

/// Holds its sty; persist and remove cascade to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Hog {
    pub id: Option<i64>,
    pub name: String,
    pub sty_id: Option<i64>,
    pub sty: Option<Sty>,
}

impl Entity for Hog {
    fn descriptor() -> EntityDescriptor {
        EntityDescriptor::builder("Hog", "hog")
            .id("id", DataType::Integer)
            .column("name", DataType::Text)
            .nullable_column("sty_id", DataType::Integer)
            .association(
                AssociationMapping::many_to_one("sty", "Sty", "sty_id").cascade(CascadeStyle::All),
            )
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
        vec![
            ("name", Value::Text(self.name.clone())),
            ("sty_id", self.sty_id.into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.require("id")?.as_i64(),
            name: text(row, "name")?,
            sty_id: row.require("sty_id")?.as_i64(),
            sty: None,
        })
    }

    fn set_column(&mut self, column: &str, value: Value) -> Result<()> {
        match column {
            "sty_id" => {
                self.sty_id = value.as_i64();
                Ok(())
            }
            other => Err(PersistError::MappingConfiguration(format!(
                "Hog has no assignable column '{}'",
                other
            ))),
        }
    }

    fn associated(&self, association: &str) -> Vec<EntityRef> {
        match (association, &self.sty) {
            ("sty", Some(sty)) => vec![EntityRef::new(sty.clone())],
            _ => Vec::new(),
        }
    }
}

fn text(row: &Row, column: &str) -> Result<String> {
    row.require(column)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| PersistError::MappingConfiguration(format!("'{}' is not text", column)))
}

pub struct Fixture {
    pub db: MemoryDatabase,
    pub factory: SessionFactory,
}

pub fn fixture() -> Fixture {
    fixture_with(Settings::default())
}

pub fn fixture_with(settings: Settings) -> Fixture {
    let db = MemoryDatabase::new();
    let factory = SessionFactory::builder()
        .register::<Pig>()
        .register::<Farm>()
        .register::<Piglet>()
        .register::<Sty>()
        .register::<Hog>()
        .provider(Arc::new(db.clone()))
        .settings(settings)
        .build()
        .unwrap();
    db.create_schema(factory.metamodel()).unwrap();
    Fixture { db, factory }
}

pub fn manual_flush() -> Settings {
    Settings::default().auto_flush(false)
}
