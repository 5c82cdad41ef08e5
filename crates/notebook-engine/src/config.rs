use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Page-supplied settings. Every field has a default, so `{}` is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotebookConfig {
    pub canvas_width: u32,
    pub canvas_height: u32,
    /// localStorage key the notebook is persisted under.
    pub storage_key: String,
    /// Ceiling on the compressed payload, in characters.
    pub storage_limit: usize,
    pub autosave_debounce_ms: u32,
    pub default_turtle_speed: u8,
    /// Module name the turtle bridge is written to in the runtime filesystem.
    pub turtle_module: String,
}

impl Default for NotebookConfig {
    fn default() -> Self {
        Self {
            canvas_width: 600,
            canvas_height: 400,
            storage_key: "pynotebook-content".into(),
            storage_limit: 950_000,
            autosave_debounce_ms: 2000,
            default_turtle_speed: 6,
            turtle_module: "pynotebook_turtle".into(),
        }
    }
}

impl NotebookConfig {
    /// Parse a JSON config; an empty string yields the defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        if json.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_default() {
        let config = NotebookConfig::from_json(r#"{"canvasWidth": 800}"#).unwrap();
        assert_eq!(config.canvas_width, 800);
        assert_eq!(config.canvas_height, 400);
        assert_eq!(config.storage_limit, 950_000);
        assert_eq!(config.turtle_module, "pynotebook_turtle");
    }

    #[test]
    fn test_empty_is_default() {
        assert_eq!(NotebookConfig::from_json("").unwrap(), NotebookConfig::default());
    }

    #[test]
    fn test_invalid_json_rejected() {
        assert!(NotebookConfig::from_json("{not json").is_err());
        assert!(NotebookConfig::from_json(r#"{"canvasWidth": "wide"}"#).is_err());
    }
}
