//! Configuration file loading and parsing
//!
//! Loads sandbox configuration from RON files, looking in the standard
//! locations when no path is given.

use super::Config;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Standard config file names to search for
const CONFIG_FILENAMES: &[&str] = &["sandbox.ron", ".sandbox/config.ron"];

pub const CONFIG_PATH_ENV: &str = "SANDBOX_CONFIG_PATH";

/// Load and validate configuration from a specific file path
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = parse_ron(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid config file {}: {}", path.display(), e))?;
    Ok(config)
}

/// Load configuration with automatic file discovery
///
/// Searches for config files in the following locations (in order):
/// 1. Path specified in SANDBOX_CONFIG_PATH environment variable
/// 2. sandbox.ron in current directory
/// 3. .sandbox/config.ron relative to current directory
///
/// If no config file is found, returns a default configuration.
pub fn load_with_discovery() -> Result<Config> {
    if let Ok(env_path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            tracing::info!("Loading config from {}: {}", CONFIG_PATH_ENV, path.display());
            return load_from_file(&path);
        } else {
            tracing::warn!(
                "{} specified but file not found: {}",
                CONFIG_PATH_ENV,
                path.display()
            );
        }
    }

    for filename in CONFIG_FILENAMES {
        let path = PathBuf::from(filename);
        if path.exists() {
            tracing::info!("Loading config from: {}", path.display());
            return load_from_file(&path);
        }
    }

    tracing::info!("No config file found, using defaults");
    Ok(Config::default())
}

/// Parse RON configuration string
fn parse_ron(content: &str) -> Result<Config> {
    ron::from_str(content).context("Failed to parse RON configuration")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_empty_config_uses_defaults() {
        let config = parse_ron("Config()").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_parse_full_config() {
        let ron = r#"
Config(
    metadata_url: "https://sandbox.example.com/client-metadata.json",
    handle_resolver: "https://resolver.example.com",
    scope: "atproto transition:generic",
    ui_locale: "de",
    search: SearchSettings(
        query: "rust",
        limit: 20,
    ),
    record: RecordSettings(
        collection: "com.example.sandbox.note",
        rkey: "latest",
    ),
    store_path: "/var/lib/sandbox/auth.db",
    listen: "0.0.0.0:9000",
)
        "#;

        let config = parse_ron(ron).unwrap();

        assert_eq!(config.metadata_url, "https://sandbox.example.com/client-metadata.json");
        assert_eq!(config.handle_resolver, "https://resolver.example.com");
        assert_eq!(config.ui_locale, "de");
        assert_eq!(config.search.query, "rust");
        assert_eq!(config.search.limit, 20);
        assert_eq!(config.record.collection, "com.example.sandbox.note");
        assert_eq!(config.record.rkey, "latest");
        assert_eq!(config.store_path, PathBuf::from("/var/lib/sandbox/auth.db"));
        assert_eq!(config.listen.port(), 9000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("sandbox.ron");

        std::fs::write(&config_path, r#"Config(search: SearchSettings(query: "cats", limit: 3))"#)
            .unwrap();

        let config = load_from_file(&config_path).unwrap();
        assert_eq!(config.search.query, "cats");
        assert_eq!(config.search.limit, 3);
        assert_eq!(config.scope, "atproto");
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("sandbox.ron");

        std::fs::write(&config_path, r#"Config(search: SearchSettings(query: "cats", limit: 0))"#)
            .unwrap();

        let err = load_from_file(&config_path).unwrap_err();
        assert!(err.to_string().contains("search limit"));
    }

    #[test]
    fn test_load_from_nonexistent_file() {
        let result = load_from_file("/nonexistent/path/config.ron");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_with_discovery_defaults() {
        // Make sure no env var is set
        unsafe {
            std::env::remove_var(CONFIG_PATH_ENV);
        }

        // Test binaries run from the crate directory, which has no config file
        let config = load_with_discovery().unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_parse_invalid_ron() {
        let result = parse_ron("This is not valid RON");
        assert!(result.is_err());
    }
}
