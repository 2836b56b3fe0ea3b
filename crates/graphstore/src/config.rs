//! Storage configuration.
//!
//! A [`Mall`](crate::Mall) is configured with a graph root directory and a
//! graph driver. Front ends typically read the settings from a TOML file:
//!
//! ```toml
//! root = "/var/lib/graphstore"
//! driver = "vfs"
//! driver_options = []
//! ```

use std::path::PathBuf;

use serde::Deserialize;

fn default_driver() -> String {
    "vfs".to_string()
}

/// Settings for opening a [`Mall`](crate::Mall).
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the registries and the driver's private tree.
    pub root: PathBuf,

    /// Graph driver name.
    #[serde(default = "default_driver")]
    pub driver: String,

    /// Driver-specific options.
    #[serde(default)]
    pub driver_options: Vec<String>,
}

impl StorageConfig {
    /// Settings for a graph root with the default driver.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            driver: default_driver(),
            driver_options: Vec::new(),
        }
    }

    /// Parse settings from TOML content.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config = StorageConfig::from_toml(r#"root = "/srv/graph""#).unwrap();
        assert_eq!(config.root, PathBuf::from("/srv/graph"));
        assert_eq!(config.driver, "vfs");
        assert!(config.driver_options.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let config = StorageConfig::from_toml(
            r#"
root = "/srv/graph"
driver = "vfs"
driver_options = ["opt=1"]
"#,
        )
        .unwrap();
        assert_eq!(config.driver, "vfs");
        assert_eq!(config.driver_options, vec!["opt=1".to_string()]);
    }

    #[test]
    fn test_missing_root_is_an_error() {
        assert!(StorageConfig::from_toml(r#"driver = "vfs""#).is_err());
    }
}
