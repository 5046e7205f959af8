//! Configuration for the sandbox CLI
//!
//! Configuration is stored in RON format. Every field has a default, so an
//! empty `Config()` (or no file at all) runs against the public sandbox
//! client metadata and bsky.social.

pub mod loader;

use anyhow::{Context, Result};
use sandbox_session::SignInOptions;
use sandbox_session::controller::{
    ControllerSettings, DEFAULT_HANDLE_RESOLVER, DEFAULT_METADATA_URL, DEFAULT_SEARCH_LIMIT,
    DEFAULT_SEARCH_QUERY,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use url::Url;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Config {
    /// Where the OAuth client metadata document is published
    #[serde(default = "default_metadata_url")]
    pub metadata_url: String,

    /// Service used to resolve handles to DIDs
    #[serde(default = "default_handle_resolver")]
    pub handle_resolver: String,

    /// OAuth scope requested at sign-in
    #[serde(default = "default_scope")]
    pub scope: String,

    #[serde(default = "default_ui_locale")]
    pub ui_locale: String,

    #[serde(default)]
    pub search: SearchSettings,

    #[serde(default)]
    pub record: RecordSettings,

    /// SQLite file holding pending sign-ins and sessions
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// Address `sandbox serve` binds to
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

/// The search issued after a session is resumed
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SearchSettings {
    pub query: String,
    pub limit: u32,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            query: DEFAULT_SEARCH_QUERY.to_string(),
            limit: DEFAULT_SEARCH_LIMIT,
        }
    }
}

/// Where `sandbox record` reads and writes
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RecordSettings {
    /// Record collection NSID (e.g., "xyz.sandbox.note")
    pub collection: String,

    /// Record key; a fixed key makes every save an overwrite
    pub rkey: String,
}

impl Default for RecordSettings {
    fn default() -> Self {
        Self {
            collection: "xyz.sandbox.note".to_string(),
            rkey: "self".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            metadata_url: default_metadata_url(),
            handle_resolver: default_handle_resolver(),
            scope: default_scope(),
            ui_locale: default_ui_locale(),
            search: SearchSettings::default(),
            record: RecordSettings::default(),
            store_path: default_store_path(),
            listen: default_listen(),
        }
    }
}

fn default_metadata_url() -> String {
    DEFAULT_METADATA_URL.to_string()
}

fn default_handle_resolver() -> String {
    DEFAULT_HANDLE_RESOLVER.to_string()
}

fn default_scope() -> String {
    "atproto".to_string()
}

fn default_ui_locale() -> String {
    "en".to_string()
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".sandbox/auth.db")
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        validate_http_url("metadata_url", &self.metadata_url)?;
        validate_http_url("handle_resolver", &self.handle_resolver)?;

        if !self.scope.split_whitespace().any(|s| s == "atproto") {
            return Err(format!("scope '{}' must include 'atproto'", self.scope));
        }

        if self.search.limit == 0 {
            return Err("search limit must be greater than zero".to_string());
        }

        if self.record.collection.split('.').filter(|s| !s.is_empty()).count() < 3 {
            return Err(format!(
                "record collection '{}' must be an NSID like 'xyz.sandbox.note'",
                self.record.collection
            ));
        }

        if self.record.rkey.is_empty() {
            return Err("record rkey cannot be empty".to_string());
        }

        Ok(())
    }

    pub fn controller_settings(&self) -> Result<ControllerSettings> {
        Ok(ControllerSettings {
            metadata_url: Url::parse(&self.metadata_url)
                .with_context(|| format!("Invalid metadata_url: {}", self.metadata_url))?,
            handle_resolver: Url::parse(&self.handle_resolver)
                .with_context(|| format!("Invalid handle_resolver: {}", self.handle_resolver))?,
            sign_in: SignInOptions {
                scope: self.scope.clone(),
                ui_locales: self.ui_locale.clone(),
            },
            search_query: self.search.query.clone(),
            search_limit: self.search.limit,
        })
    }

    /// The page URL the terminal and web surfaces load.
    pub fn page_url(&self) -> Result<Url> {
        Url::parse(&format!("http://{}/", self.listen)).context("Invalid listen address")
    }
}

fn validate_http_url(field: &str, value: &str) -> Result<(), String> {
    let url = Url::parse(value).map_err(|e| format!("{} '{}' is not a URL: {}", field, value, e))?;
    match url.scheme() {
        "https" | "http" => Ok(()),
        other => Err(format!("{} must be http(s), got '{}'", field, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.search.limit, 5);
        assert_eq!(config.record.rkey, "self");
        assert_eq!(config.page_url().unwrap().as_str(), "http://127.0.0.1:8080/");
    }

    #[test]
    fn test_controller_settings_carry_sign_in_options() {
        let config = Config {
            scope: "atproto transition:generic".to_string(),
            ui_locale: "fr".to_string(),
            ..Config::default()
        };

        let settings = config.controller_settings().unwrap();
        assert_eq!(settings.sign_in.scope, "atproto transition:generic");
        assert_eq!(settings.sign_in.ui_locales, "fr");
        assert_eq!(settings.handle_resolver.as_str(), "https://bsky.social/");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero_limit = Config {
            search: SearchSettings {
                query: "q".to_string(),
                limit: 0,
            },
            ..Config::default()
        };
        assert!(zero_limit.validate().is_err());

        let no_atproto = Config {
            scope: "openid".to_string(),
            ..Config::default()
        };
        assert!(no_atproto.validate().is_err());

        let bad_url = Config {
            metadata_url: "ftp://example.com/meta.json".to_string(),
            ..Config::default()
        };
        assert!(bad_url.validate().unwrap_err().contains("metadata_url"));

        let bad_collection = Config {
            record: RecordSettings {
                collection: "notes".to_string(),
                rkey: "self".to_string(),
            },
            ..Config::default()
        };
        assert!(bad_collection.validate().is_err());
    }
}
