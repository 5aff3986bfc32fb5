pub mod error;
pub mod types;
pub mod value;

pub use error::{ErrorKind, PersistError, Result};
pub use types::{EntityKey, Row};
pub use value::{DataType, Value};
