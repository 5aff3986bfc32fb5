use crate::core::{PersistError, Result};
use crate::sql::PlaceholderStyle;
use serde::{Deserialize, Serialize};

/// Session factory settings.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```
/// use rxorm::session::Settings;
///
/// let settings = Settings::from_json(r#"{ "auto_flush": false }"#).unwrap();
/// assert!(!settings.auto_flush);
/// assert_eq!(settings.statement_cache_size, 128);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Flush right after persist and remove.
    pub auto_flush: bool,
    /// Statement shapes kept by the default compiler.
    pub statement_cache_size: usize,
    /// Placeholder style of the default compiler.
    pub placeholder_style: PlaceholderStyle,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_flush: true,
            statement_cache_size: 128,
            placeholder_style: PlaceholderStyle::Dollar,
        }
    }
}

impl Settings {
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Settings = serde_json::from_str(json)
            .map_err(|err| PersistError::Configuration(format!("invalid settings: {}", err)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn auto_flush(mut self, enabled: bool) -> Self {
        self.auto_flush = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.statement_cache_size == 0 {
            return Err(PersistError::Configuration(
                "statement_cache_size must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert!(settings.auto_flush);
        assert_eq!(settings.placeholder_style, PlaceholderStyle::Dollar);
    }

    #[test]
    fn test_from_json() {
        let settings =
            Settings::from_json(r#"{ "placeholder_style": "question", "statement_cache_size": 8 }"#)
                .unwrap();
        assert!(settings.auto_flush);
        assert_eq!(settings.placeholder_style, PlaceholderStyle::Question);
        assert_eq!(settings.statement_cache_size, 8);
    }

    #[test]
    fn test_invalid_json_is_configuration_error() {
        assert!(matches!(
            Settings::from_json("{ auto_flush: yes }"),
            Err(PersistError::Configuration(_))
        ));
        assert!(matches!(
            Settings::from_json(r#"{ "statement_cache_size": 0 }"#),
            Err(PersistError::Configuration(_))
        ));
    }
}
