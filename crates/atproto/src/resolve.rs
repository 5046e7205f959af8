//! Identity and authorization server discovery
//!
//! A login identifier (handle, DID or server URL) is turned into the
//! authorization server that can issue tokens for it:
//! - handle → DID through the configured handle resolver
//! - DID → DID document → PDS endpoint
//! - PDS → protected resource metadata → authorization server metadata

use sandbox_session::OAuthError;
use serde::Deserialize;
use url::Url;

pub const DEFAULT_PLC_DIRECTORY: &str = "https://plc.directory";

/// OAuth server metadata from .well-known discovery
#[derive(Debug, Clone, Deserialize)]
pub struct ServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub pushed_authorization_request_endpoint: Option<String>,
    #[serde(default)]
    pub require_pushed_authorization_requests: bool,
    #[serde(default)]
    pub revocation_endpoint: Option<String>,
    #[serde(default)]
    pub dpop_signing_alg_values_supported: Vec<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ProtectedResourceMetadata {
    #[serde(default)]
    authorization_servers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DidService {
    pub id: String,
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(rename = "serviceEndpoint")]
    pub service_endpoint: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DidDocument {
    pub id: String,
    #[serde(rename = "alsoKnownAs", default)]
    pub also_known_as: Vec<String>,
    #[serde(default)]
    pub service: Vec<DidService>,
}

impl DidDocument {
    /// Endpoint of the `#atproto_pds` service.
    pub fn pds_endpoint(&self) -> Option<&str> {
        self.service
            .iter()
            .find(|svc| {
                svc.id == "#atproto_pds" || svc.id == format!("{}#atproto_pds", self.id)
            })
            .filter(|svc| svc.service_type == "AtprotoPersonalDataServer")
            .and_then(|svc| svc.service_endpoint.as_str())
    }

    /// The handle this document claims, if any.
    pub fn handle(&self) -> Option<&str> {
        self.also_known_as
            .iter()
            .find_map(|aka| aka.strip_prefix("at://"))
    }
}

/// What the user typed into the login box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginIdentifier {
    Handle(String),
    Did(String),
    Server(Url),
}

impl LoginIdentifier {
    pub fn parse(input: &str) -> Result<Self, OAuthError> {
        let input = input.trim();
        if input.starts_with("did:") {
            return Ok(LoginIdentifier::Did(input.to_string()));
        }

        if input.starts_with("https://") || input.starts_with("http://") {
            let url = Url::parse(input)
                .map_err(|e| OAuthError::Resolution(format!("invalid server URL: {}", e)))?;
            return Ok(LoginIdentifier::Server(url));
        }

        let handle = input.trim_start_matches('@').to_ascii_lowercase();
        if handle.is_empty() || !handle.contains('.') || handle.starts_with('.') || handle.ends_with('.') {
            return Err(OAuthError::Resolution(format!(
                "'{}' is not a valid handle",
                input
            )));
        }
        Ok(LoginIdentifier::Handle(handle))
    }

    /// Value for the `login_hint` parameter.
    pub fn login_hint(&self) -> Option<&str> {
        match self {
            LoginIdentifier::Handle(handle) => Some(handle),
            LoginIdentifier::Did(did) => Some(did),
            LoginIdentifier::Server(_) => None,
        }
    }
}

/// Resolves identities against the network.
#[derive(Clone)]
pub struct IdentityResolver {
    http_client: reqwest::Client,
    handle_resolver: Url,
    plc_directory: Url,
}

impl IdentityResolver {
    pub fn new(http_client: reqwest::Client, handle_resolver: Url) -> Self {
        Self {
            http_client,
            handle_resolver,
            plc_directory: Url::parse(DEFAULT_PLC_DIRECTORY).expect("valid PLC directory URL"),
        }
    }

    pub fn with_plc_directory(mut self, plc_directory: Url) -> Self {
        self.plc_directory = plc_directory;
        self
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: Url, what: &str) -> Result<T, OAuthError> {
        let response = self
            .http_client
            .get(url.clone())
            .header("Accept", "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(OAuthError::Resolution(format!(
                "{} lookup at {} failed: {}",
                what,
                url,
                response.status()
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| OAuthError::Resolution(format!("invalid {} at {}: {}", what, url, e)))
    }

    /// Resolve a handle to its DID via `com.atproto.identity.resolveHandle`.
    pub async fn resolve_handle(&self, handle: &str) -> Result<String, OAuthError> {
        #[derive(Deserialize)]
        struct ResolveHandleOutput {
            did: String,
        }

        let mut url = self
            .handle_resolver
            .join("/xrpc/com.atproto.identity.resolveHandle")
            .map_err(|e| OAuthError::Resolution(e.to_string()))?;
        url.query_pairs_mut().append_pair("handle", handle);

        let output: ResolveHandleOutput = self.get_json(url, "handle").await?;
        if !output.did.starts_with("did:") {
            return Err(OAuthError::Resolution(format!(
                "handle {} resolved to invalid DID {}",
                handle, output.did
            )));
        }
        Ok(output.did)
    }

    pub async fn resolve_did_document(&self, did: &str) -> Result<DidDocument, OAuthError> {
        let url = if let Some(id) = did.strip_prefix("did:plc:") {
            self.plc_directory
                .join(&format!("/did:plc:{}", id))
                .map_err(|e| OAuthError::Resolution(e.to_string()))?
        } else if let Some(domain) = did.strip_prefix("did:web:") {
            let domain = domain.replace("%3A", ":");
            Url::parse(&format!("https://{}/.well-known/did.json", domain))
                .map_err(|e| OAuthError::Resolution(e.to_string()))?
        } else {
            return Err(OAuthError::Resolution(format!(
                "unsupported DID method: {}",
                did
            )));
        };

        let document: DidDocument = self.get_json(url, "DID document").await?;
        if document.id != did {
            return Err(OAuthError::Resolution(format!(
                "DID document id {} does not match {}",
                document.id, did
            )));
        }
        Ok(document)
    }

    /// PDS serving `did`'s repository.
    pub async fn resolve_pds(&self, did: &str) -> Result<Url, OAuthError> {
        let document = self.resolve_did_document(did).await?;
        let endpoint = document.pds_endpoint().ok_or_else(|| {
            OAuthError::Resolution(format!("DID document for {} has no PDS", did))
        })?;
        Url::parse(endpoint).map_err(|e| OAuthError::Resolution(format!("invalid PDS URL: {}", e)))
    }

    /// Authorization server metadata for the server protecting `pds`.
    pub async fn discover_authorization_server(&self, pds: &Url) -> Result<ServerMetadata, OAuthError> {
        let resource_url = pds
            .join("/.well-known/oauth-protected-resource")
            .map_err(|e| OAuthError::Resolution(e.to_string()))?;
        let resource: ProtectedResourceMetadata =
            self.get_json(resource_url, "protected resource metadata").await?;

        let issuer = resource.authorization_servers.first().ok_or_else(|| {
            OAuthError::Resolution(format!("{} lists no authorization server", pds))
        })?;
        let issuer = Url::parse(issuer)
            .map_err(|e| OAuthError::Resolution(format!("invalid issuer: {}", e)))?;

        self.server_metadata(&issuer).await
    }

    /// Metadata published by the authorization server `issuer`.
    pub async fn server_metadata(&self, issuer: &Url) -> Result<ServerMetadata, OAuthError> {
        let metadata_url = issuer
            .join("/.well-known/oauth-authorization-server")
            .map_err(|e| OAuthError::Resolution(e.to_string()))?;
        let metadata: ServerMetadata = self.get_json(metadata_url, "server metadata").await?;

        if metadata.issuer.trim_end_matches('/') != issuer.as_str().trim_end_matches('/') {
            return Err(OAuthError::Resolution(format!(
                "issuer mismatch: expected {}, got {}",
                issuer, metadata.issuer
            )));
        }
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document(service_id: &str, service_type: &str) -> DidDocument {
        serde_json::from_value(serde_json::json!({
            "id": "did:plc:ewvi7nxzyoun6zhxrhs64oiz",
            "alsoKnownAs": ["at://atproto.com"],
            "service": [{
                "id": service_id,
                "type": service_type,
                "serviceEndpoint": "https://enoki.us-east.host.bsky.network"
            }]
        }))
        .unwrap()
    }

    #[test]
    fn test_pds_endpoint() {
        let doc = document("#atproto_pds", "AtprotoPersonalDataServer");
        assert_eq!(doc.pds_endpoint(), Some("https://enoki.us-east.host.bsky.network"));
        assert_eq!(doc.handle(), Some("atproto.com"));

        let doc = document(
            "did:plc:ewvi7nxzyoun6zhxrhs64oiz#atproto_pds",
            "AtprotoPersonalDataServer",
        );
        assert!(doc.pds_endpoint().is_some());
    }

    #[test]
    fn test_pds_endpoint_requires_matching_service() {
        assert!(document("#bsky_fg", "BskyFeedGenerator").pds_endpoint().is_none());
        assert!(document("#atproto_pds", "Other").pds_endpoint().is_none());
    }

    #[test]
    fn test_parse_login_identifier() {
        assert_eq!(
            LoginIdentifier::parse("@Will.Bsky.Social").unwrap(),
            LoginIdentifier::Handle("will.bsky.social".to_string())
        );
        assert_eq!(
            LoginIdentifier::parse("did:plc:abc").unwrap(),
            LoginIdentifier::Did("did:plc:abc".to_string())
        );
        assert!(matches!(
            LoginIdentifier::parse("https://bsky.social").unwrap(),
            LoginIdentifier::Server(_)
        ));
        assert!(LoginIdentifier::parse("nodots").is_err());
        assert!(LoginIdentifier::parse(".leading.dot").is_err());
        assert!(LoginIdentifier::parse("@").is_err());
    }

    #[test]
    fn test_login_hint() {
        assert_eq!(
            LoginIdentifier::Handle("a.test".into()).login_hint(),
            Some("a.test")
        );
        assert_eq!(
            LoginIdentifier::Server(Url::parse("https://bsky.social").unwrap()).login_hint(),
            None
        );
    }
}
