use std::path::Path;

use serde::Deserialize;

/// `glide.json`: the interpreter's only configuration file. It selects the
/// built-ins bootstrap path and nothing else.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub builtins_path: String,
}

impl Config {
    /// Loads `glide.json` from `dir`. A missing or empty file yields the
    /// default configuration; a malformed one is an error.
    pub fn load(dir: &Path) -> Result<Self, serde_json::Error> {
        let path = dir.join("glide.json");
        let text = std::fs::read_to_string(path).unwrap_or_default();
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(&text)
    }

    /// The configured bootstrap path, or the default when unset.
    #[must_use]
    pub fn builtins_path(&self) -> &str {
        if self.settings.builtins_path.is_empty() {
            crate::run::DEFAULT_BUILTINS_NAME
        } else {
            &self.settings.builtins_path
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.builtins_path(), "builtins/builtins.gl");
    }

    #[test]
    fn configured_path_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("glide.json"),
            r#"{"settings": {"builtins_path": "custom/prelude.gl"}}"#,
        )
        .unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.builtins_path(), "custom/prelude.gl");
    }

    #[test]
    fn malformed_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("glide.json"), "{oops").unwrap();
        assert!(Config::load(dir.path()).is_err());
    }
}
