//! OAuth client metadata
//!
//! The client describes itself with a JSON document published at a fixed
//! URL. It is fetched once per page load and never changes afterwards.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

/// Published ATProto OAuth client metadata.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ClientConfiguration {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tos_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_uri: Option<String>,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub scope: String,
    #[serde(default = "default_grant_types")]
    pub grant_types: Vec<String>,
    #[serde(default = "default_response_types")]
    pub response_types: Vec<String>,
    #[serde(default = "default_auth_method")]
    pub token_endpoint_auth_method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_type: Option<String>,
    #[serde(default)]
    pub dpop_bound_access_tokens: bool,
}

fn default_grant_types() -> Vec<String> {
    vec!["authorization_code".to_string()]
}

fn default_response_types() -> Vec<String> {
    vec!["code".to_string()]
}

fn default_auth_method() -> String {
    "none".to_string()
}

impl ClientConfiguration {
    /// Check the metadata is usable by a public browser-style client.
    pub fn validate(&self) -> Result<(), String> {
        if self.client_id.trim().is_empty() {
            return Err("client metadata is missing client_id".to_string());
        }

        if self.redirect_uris.is_empty() {
            return Err("client metadata must list at least one redirect URI".to_string());
        }

        for uri in &self.redirect_uris {
            Url::parse(uri).map_err(|e| format!("invalid redirect URI '{}': {}", uri, e))?;
        }

        if !self.scope.split_whitespace().any(|s| s == "atproto") {
            return Err(format!(
                "client scope '{}' must include 'atproto'",
                self.scope
            ));
        }

        if !self.grant_types.iter().any(|g| g == "authorization_code") {
            return Err("client must support the authorization_code grant".to_string());
        }

        if !self.response_types.iter().any(|r| r == "code") {
            return Err("client must support the 'code' response type".to_string());
        }

        if !self.dpop_bound_access_tokens {
            return Err("client metadata must set dpop_bound_access_tokens".to_string());
        }

        Ok(())
    }

    /// The redirect URI used for authorization requests.
    pub fn primary_redirect_uri(&self) -> Option<&str> {
        self.redirect_uris.first().map(String::as_str)
    }
}

/// Where client metadata comes from.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<ClientConfiguration>;
}

/// Fetches client metadata over HTTPS.
#[derive(Clone, Default)]
pub struct HttpMetadataSource {
    http_client: reqwest::Client,
}

impl HttpMetadataSource {
    pub fn new(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }
}

#[async_trait]
impl MetadataSource for HttpMetadataSource {
    async fn fetch(&self, url: &Url) -> Result<ClientConfiguration> {
        let response = self
            .http_client
            .get(url.clone())
            .header("Accept", "application/json")
            .send()
            .await
            .context("Failed to fetch client metadata")?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "Client metadata request failed with status: {}",
                response.status()
            ));
        }

        let metadata: ClientConfiguration = response
            .json()
            .await
            .context("Failed to parse client metadata")?;

        metadata.validate().map_err(|e| anyhow!(e))?;

        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_metadata() -> ClientConfiguration {
        serde_json::from_value(serde_json::json!({
            "client_id": "https://zomega.github.io/atproto-sandbox/client-metadata.json",
            "client_name": "ATProto Sandbox",
            "redirect_uris": ["https://zomega.github.io/atproto-sandbox/"],
            "scope": "atproto transition:generic",
            "grant_types": ["authorization_code", "refresh_token"],
            "response_types": ["code"],
            "token_endpoint_auth_method": "none",
            "application_type": "web",
            "dpop_bound_access_tokens": true
        }))
        .unwrap()
    }

    #[test]
    fn test_valid_metadata() {
        let metadata = valid_metadata();
        assert!(metadata.validate().is_ok());
        assert_eq!(
            metadata.primary_redirect_uri(),
            Some("https://zomega.github.io/atproto-sandbox/")
        );
    }

    #[test]
    fn test_defaults_for_optional_fields() {
        let metadata: ClientConfiguration = serde_json::from_value(serde_json::json!({
            "client_id": "https://example.com/client.json",
            "redirect_uris": ["https://example.com/"],
            "scope": "atproto",
            "dpop_bound_access_tokens": true
        }))
        .unwrap();

        assert_eq!(metadata.grant_types, vec!["authorization_code"]);
        assert_eq!(metadata.response_types, vec!["code"]);
        assert_eq!(metadata.token_endpoint_auth_method, "none");
        assert!(metadata.validate().is_ok());
    }

    #[test]
    fn test_invalid_metadata() {
        let mut missing_id = valid_metadata();
        missing_id.client_id = " ".to_string();
        assert!(missing_id.validate().is_err());

        let mut no_redirects = valid_metadata();
        no_redirects.redirect_uris.clear();
        assert!(no_redirects.validate().is_err());

        let mut bad_redirect = valid_metadata();
        bad_redirect.redirect_uris = vec!["not a url".to_string()];
        assert!(bad_redirect.validate().is_err());

        let mut wrong_scope = valid_metadata();
        wrong_scope.scope = "openid profile".to_string();
        assert!(wrong_scope.validate().is_err());

        let mut no_dpop = valid_metadata();
        no_dpop.dpop_bound_access_tokens = false;
        assert!(no_dpop.validate().is_err());
    }
}
