//! ATProto OAuth client
//!
//! This module implements the ATProto OAuth profile for a public client.
//! See: https://atproto.com/specs/oauth
//!
//! Key features:
//! - Handle resolution to discover the user's PDS and authorization server
//! - Pushed authorization requests when the server offers them
//! - DPoP (Demonstrating Proof-of-Possession) for token binding
//! - PKCE (Proof Key for Code Exchange) for enhanced security
//! - Sessions persisted so a later page load can resume them

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::Rng;
use sandbox_session::{
    ClientConfiguration, OAuthError, OAuthProvider, OAuthSession, OAuthSubsystem, SignInOptions,
    TokenSet, unix_now,
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use url::Url;

use crate::dpop::DpopKey;
use crate::resolve::{IdentityResolver, LoginIdentifier, ServerMetadata};
use crate::store::{AuthFlowRecord, SqliteAuthStore};

/// Pending authorization requests older than this are discarded.
pub const FLOW_MAX_AGE_SECS: i64 = 600;

/// Parameters the authorization server appends to the redirect URI.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub iss: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl CallbackParams {
    /// Extract redirect parameters from the query, or from the fragment
    /// when the query carries none. `None` when `url` is not a redirect.
    pub fn from_url(url: &Url) -> Option<Self> {
        let from_query = Self::from_pairs(url.query_pairs());
        if from_query.is_callback() {
            return Some(from_query);
        }

        let fragment = url.fragment()?;
        let from_fragment = Self::from_pairs(url::form_urlencoded::parse(fragment.as_bytes()));
        from_fragment.is_callback().then_some(from_fragment)
    }

    fn from_pairs<'a>(pairs: impl Iterator<Item = (std::borrow::Cow<'a, str>, std::borrow::Cow<'a, str>)>) -> Self {
        let mut params = CallbackParams::default();
        for (key, value) in pairs {
            let value = Some(value.into_owned());
            match key.as_ref() {
                "code" => params.code = value,
                "state" => params.state = value,
                "iss" => params.iss = value,
                "error" => params.error = value,
                "error_description" => params.error_description = value,
                _ => {}
            }
        }
        params
    }

    fn is_callback(&self) -> bool {
        self.state.is_some() && (self.code.is_some() || self.error.is_some())
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    sub: Option<String>,
}

#[derive(Deserialize)]
struct ParResponse {
    request_uri: String,
}

#[derive(Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

fn storage(err: anyhow::Error) -> OAuthError {
    OAuthError::Storage(format!("{:#}", err))
}

fn parse_url(raw: &str, what: &str) -> Result<Url, OAuthError> {
    Url::parse(raw).map_err(|e| OAuthError::Resolution(format!("invalid {} '{}': {}", what, raw, e)))
}

fn same_issuer(a: &str, b: &str) -> bool {
    a.trim_end_matches('/') == b.trim_end_matches('/')
}

/// ATProto OAuth client for one set of client metadata
pub struct AtProtoOAuthClient {
    metadata: ClientConfiguration,
    resolver: IdentityResolver,
    store: SqliteAuthStore,
    http_client: reqwest::Client,
}

impl AtProtoOAuthClient {
    pub fn new(
        metadata: ClientConfiguration,
        resolver: IdentityResolver,
        store: SqliteAuthStore,
        http_client: reqwest::Client,
    ) -> Self {
        Self {
            metadata,
            resolver,
            store,
            http_client,
        }
    }

    /// POST a form with a DPoP proof and decode the JSON answer.
    ///
    /// A `use_dpop_nonce` challenge is answered once with the nonce the
    /// server supplied. `nonce` is updated with the latest server nonce.
    async fn dpop_post<T: DeserializeOwned>(
        &self,
        url: &Url,
        form: &[(&str, String)],
        key: &DpopKey,
        nonce: &mut Option<String>,
    ) -> Result<T, OAuthError> {
        let mut answered_challenge = false;
        loop {
            let proof = key.proof("POST", url, nonce.as_deref(), None)?;
            let response = self
                .http_client
                .post(url.clone())
                .header("DPoP", proof)
                .form(form)
                .send()
                .await?;

            if let Some(fresh) = response
                .headers()
                .get("DPoP-Nonce")
                .and_then(|v| v.to_str().ok())
            {
                *nonce = Some(fresh.to_string());
            }

            let status = response.status();
            if status.is_success() {
                return response.json::<T>().await.map_err(|e| OAuthError::Protocol {
                    error: "invalid_response".to_string(),
                    description: format!("{} returned an unexpected body: {}", url, e),
                });
            }

            let body = response.text().await.unwrap_or_default();
            match serde_json::from_str::<OAuthErrorBody>(&body) {
                Ok(err) if err.error == "use_dpop_nonce" && !answered_challenge && nonce.is_some() => {
                    tracing::debug!("Authorization server requested a DPoP nonce for {}", url);
                    answered_challenge = true;
                }
                Ok(err) => {
                    return Err(OAuthError::Protocol {
                        error: err.error,
                        description: err.error_description.unwrap_or_default(),
                    });
                }
                Err(_) => {
                    return Err(OAuthError::Http(format!(
                        "{} returned {}: {}",
                        url, status, body
                    )));
                }
            }
        }
    }

    /// Resolve `input` to `(did, pds, authorization server)`.
    async fn discover(
        &self,
        identifier: &LoginIdentifier,
    ) -> Result<(Option<String>, Option<Url>, ServerMetadata), OAuthError> {
        match identifier {
            LoginIdentifier::Handle(handle) => {
                let did = self.resolver.resolve_handle(handle).await?;
                tracing::debug!("Resolved {} to {}", handle, did);
                let pds = self.resolver.resolve_pds(&did).await?;
                let server = self.resolver.discover_authorization_server(&pds).await?;
                Ok((Some(did), Some(pds), server))
            }
            LoginIdentifier::Did(did) => {
                let pds = self.resolver.resolve_pds(did).await?;
                let server = self.resolver.discover_authorization_server(&pds).await?;
                Ok((Some(did.clone()), Some(pds), server))
            }
            LoginIdentifier::Server(url) => {
                let server = match self.resolver.discover_authorization_server(url).await {
                    Ok(server) => server,
                    Err(err) => {
                        tracing::debug!("{} is not a protected resource ({}), trying it as an issuer", url, err);
                        self.resolver.server_metadata(url).await?
                    }
                };
                Ok((None, None, server))
            }
        }
    }

    /// Start authorization for `input` and return the URL to send the user to.
    pub async fn sign_in(&self, input: &str, options: &SignInOptions) -> Result<Url, OAuthError> {
        let identifier = LoginIdentifier::parse(input)?;
        let (did, pds, server) = self.discover(&identifier).await?;

        let redirect_uri = self
            .metadata
            .primary_redirect_uri()
            .ok_or_else(|| OAuthError::Resolution("client has no redirect URI".to_string()))?
            .to_string();

        let code_verifier = generate_code_verifier();
        let code_challenge = generate_code_challenge(&code_verifier);
        let state = generate_state();
        let key = DpopKey::generate();
        let mut nonce = None;

        match self.store.prune_flows_older_than(FLOW_MAX_AGE_SECS).await {
            Ok(0) => {}
            Ok(pruned) => tracing::debug!("Pruned {} stale authorization flows", pruned),
            Err(err) => tracing::warn!("Failed to prune authorization flows: {:#}", err),
        }

        let mut params: Vec<(&str, String)> = vec![
            ("client_id", self.metadata.client_id.clone()),
            ("response_type", "code".to_string()),
            ("redirect_uri", redirect_uri.clone()),
            ("state", state.clone()),
            ("scope", options.scope.clone()),
            ("code_challenge", code_challenge),
            ("code_challenge_method", "S256".to_string()),
            ("ui_locales", options.ui_locales.clone()),
        ];
        if let Some(hint) = identifier.login_hint() {
            params.push(("login_hint", hint.to_string()));
        }

        let mut auth_url = parse_url(&server.authorization_endpoint, "authorization endpoint")?;
        match &server.pushed_authorization_request_endpoint {
            Some(par_endpoint) => {
                let par_url = parse_url(par_endpoint, "PAR endpoint")?;
                let par: ParResponse = self.dpop_post(&par_url, &params, &key, &mut nonce).await?;
                auth_url
                    .query_pairs_mut()
                    .append_pair("client_id", &self.metadata.client_id)
                    .append_pair("request_uri", &par.request_uri);
            }
            None if server.require_pushed_authorization_requests => {
                return Err(OAuthError::Resolution(format!(
                    "{} requires PAR but advertises no PAR endpoint",
                    server.issuer
                )));
            }
            None => {
                let mut query = auth_url.query_pairs_mut();
                for (name, value) in &params {
                    query.append_pair(name, value);
                }
            }
        }

        let binding = key.binding(nonce)?;
        self.store
            .insert_flow(AuthFlowRecord {
                state,
                issuer: server.issuer.clone(),
                pds_url: pds.map(|u| u.to_string()),
                did,
                redirect_uri,
                code_verifier,
                dpop_pkcs8: binding.pkcs8,
                dpop_jwk: binding.jwk,
                dpop_nonce: binding.nonce,
            })
            .await
            .map_err(storage)?;

        tracing::info!("Authorization request created at {}", server.issuer);
        Ok(auth_url)
    }

    /// Exchange the code carried by a redirect for a session.
    pub async fn complete_callback(&self, params: CallbackParams) -> Result<OAuthSession, OAuthError> {
        let state = params
            .state
            .ok_or_else(|| OAuthError::Callback("missing state".to_string()))?;
        let flow = self
            .store
            .take_flow(&state)
            .await
            .map_err(storage)?
            .ok_or_else(|| OAuthError::Callback("unknown or expired state".to_string()))?;

        if let Some(error) = params.error {
            return Err(OAuthError::Callback(match params.error_description {
                Some(description) => format!("{}: {}", error, description),
                None => error,
            }));
        }

        let code = params
            .code
            .ok_or_else(|| OAuthError::Callback("missing authorization code".to_string()))?;

        if let Some(iss) = &params.iss {
            if !same_issuer(iss, &flow.issuer) {
                return Err(OAuthError::Callback(format!(
                    "issuer mismatch: expected {}, got {}",
                    flow.issuer, iss
                )));
            }
        }

        let server = self
            .resolver
            .server_metadata(&parse_url(&flow.issuer, "issuer")?)
            .await?;
        let token_url = parse_url(&server.token_endpoint, "token endpoint")?;
        let key = DpopKey::from_pkcs8_der(&flow.dpop_pkcs8)?;
        let mut nonce = flow.dpop_nonce.clone();

        let form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code),
            ("redirect_uri", flow.redirect_uri.clone()),
            ("client_id", self.metadata.client_id.clone()),
            ("code_verifier", flow.code_verifier.clone()),
        ];
        let token: TokenResponse = self.dpop_post(&token_url, &form, &key, &mut nonce).await?;

        let sub = token.sub.clone().ok_or_else(|| OAuthError::Protocol {
            error: "invalid_token_response".to_string(),
            description: "token response has no sub".to_string(),
        })?;
        if let Some(expected) = &flow.did {
            if &sub != expected {
                return Err(OAuthError::Callback(format!(
                    "token subject {} does not match {}",
                    sub, expected
                )));
            }
        }

        let aud = match &flow.pds_url {
            Some(pds) => pds.clone(),
            None => {
                // Login started from a server URL: make sure the subject's
                // PDS is really protected by this issuer.
                let pds = self.resolver.resolve_pds(&sub).await?;
                let protecting = self.resolver.discover_authorization_server(&pds).await?;
                if !same_issuer(&protecting.issuer, &flow.issuer) {
                    return Err(OAuthError::Callback(format!(
                        "{} is not authorized by {}",
                        sub, flow.issuer
                    )));
                }
                pds.to_string()
            }
        };

        let session = session_from_token(token, sub, aud, flow.issuer, &key, nonce, None)?;
        self.store.save_session(&session).await.map_err(storage)?;
        tracing::info!("Authorized {}", session.sub);
        Ok(session)
    }

    /// Trade the refresh token for a new token set.
    pub async fn refresh(&self, session: &OAuthSession) -> Result<OAuthSession, OAuthError> {
        let refresh_token = session
            .tokens
            .refresh_token
            .clone()
            .ok_or_else(|| OAuthError::Protocol {
                error: "invalid_grant".to_string(),
                description: "session has no refresh token".to_string(),
            })?;

        let server = self
            .resolver
            .server_metadata(&parse_url(&session.iss, "issuer")?)
            .await?;
        let token_url = parse_url(&server.token_endpoint, "token endpoint")?;
        let key = DpopKey::from_binding(&session.dpop)?;
        let mut nonce = session.dpop.nonce.clone();

        let form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.clone()),
            ("client_id", self.metadata.client_id.clone()),
        ];
        let token: TokenResponse = self.dpop_post(&token_url, &form, &key, &mut nonce).await?;

        if let Some(sub) = &token.sub {
            if sub != &session.sub {
                return Err(OAuthError::Protocol {
                    error: "invalid_grant".to_string(),
                    description: format!("refresh returned subject {}", sub),
                });
            }
        }

        let refreshed = session_from_token(
            token,
            session.sub.clone(),
            session.aud.clone(),
            session.iss.clone(),
            &key,
            nonce,
            Some(refresh_token),
        )?;
        self.store.save_session(&refreshed).await.map_err(storage)?;
        tracing::info!("Refreshed session for {}", refreshed.sub);
        Ok(refreshed)
    }

    /// Load the last stored session, refreshing it if it has expired.
    pub async fn restore(&self) -> Result<Option<OAuthSession>, OAuthError> {
        let Some(session) = self.store.current_session().await.map_err(storage)? else {
            return Ok(None);
        };

        if !session.tokens.is_expired() {
            return Ok(Some(session));
        }

        if session.tokens.refresh_token.is_some() {
            return match self.refresh(&session).await {
                Ok(refreshed) => Ok(Some(refreshed)),
                // The server refused the grant; the session is dead.
                Err(err @ OAuthError::Protocol { .. }) => {
                    tracing::warn!("Discarding session for {}: refresh rejected: {}", session.sub, err);
                    self.store.delete_session(&session.sub).await.map_err(storage)?;
                    Ok(None)
                }
                Err(err) => Err(err),
            };
        }

        tracing::info!("Stored session for {} expired", session.sub);
        self.store.delete_session(&session.sub).await.map_err(storage)?;
        Ok(None)
    }

    async fn revoke(&self, session: &OAuthSession) -> Result<(), OAuthError> {
        let server = self
            .resolver
            .server_metadata(&parse_url(&session.iss, "issuer")?)
            .await?;
        let Some(endpoint) = &server.revocation_endpoint else {
            return Ok(());
        };
        let url = parse_url(endpoint, "revocation endpoint")?;
        let key = DpopKey::from_binding(&session.dpop)?;
        let proof = key.proof("POST", &url, session.dpop.nonce.as_deref(), None)?;

        let response = self
            .http_client
            .post(url)
            .header("DPoP", proof)
            .form(&[
                ("token", session.tokens.access_token.as_str()),
                ("client_id", self.metadata.client_id.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(OAuthError::Http(format!(
                "revocation failed: {}",
                response.status()
            )));
        }
        Ok(())
    }
}

fn session_from_token(
    token: TokenResponse,
    sub: String,
    aud: String,
    iss: String,
    key: &DpopKey,
    nonce: Option<String>,
    previous_refresh_token: Option<String>,
) -> Result<OAuthSession, OAuthError> {
    if !token.token_type.eq_ignore_ascii_case("DPoP") {
        return Err(OAuthError::Protocol {
            error: "invalid_token_type".to_string(),
            description: format!("expected a DPoP token, got {}", token.token_type),
        });
    }

    let scope = token.scope.unwrap_or_default();
    if !scope.split_whitespace().any(|s| s == "atproto") {
        return Err(OAuthError::Protocol {
            error: "invalid_scope".to_string(),
            description: format!("granted scope '{}' lacks atproto", scope),
        });
    }

    Ok(OAuthSession {
        sub,
        aud,
        iss,
        scope,
        tokens: TokenSet {
            access_token: token.access_token,
            token_type: "DPoP".to_string(),
            refresh_token: token.refresh_token.or(previous_refresh_token),
            expires_at: token.expires_in.map(|secs| unix_now() + secs),
        },
        dpop: key.binding(nonce)?,
    })
}

#[async_trait]
impl OAuthSubsystem for AtProtoOAuthClient {
    async fn resume_or_initiate(&self, location: &Url) -> Result<Option<OAuthSession>, OAuthError> {
        if let Some(params) = CallbackParams::from_url(location) {
            tracing::info!("Completing OAuth redirect");
            return self.complete_callback(params).await.map(Some);
        }
        self.restore().await
    }

    async fn request_login_redirect(
        &self,
        handle: &str,
        options: &SignInOptions,
    ) -> Result<Url, OAuthError> {
        self.sign_in(handle, options).await
    }

    async fn sign_out(&self, subject: &str) -> Result<(), OAuthError> {
        if let Some(session) = self.store.get_session(subject).await.map_err(storage)? {
            if let Err(err) = self.revoke(&session).await {
                tracing::warn!("Token revocation for {} failed: {}", subject, err);
            }
        }
        self.store.delete_session(subject).await.map_err(storage)
    }
}

/// Builds `AtProtoOAuthClient`s that share one store and HTTP client.
#[derive(Clone)]
pub struct AtProtoOAuthProvider {
    store: SqliteAuthStore,
    http_client: reqwest::Client,
    plc_directory: Option<Url>,
}

impl AtProtoOAuthProvider {
    pub fn new(store: SqliteAuthStore, http_client: reqwest::Client) -> Self {
        Self {
            store,
            http_client,
            plc_directory: None,
        }
    }

    pub fn with_plc_directory(mut self, plc_directory: Url) -> Self {
        self.plc_directory = Some(plc_directory);
        self
    }
}

impl OAuthProvider for AtProtoOAuthProvider {
    fn construct(
        &self,
        config: &ClientConfiguration,
        handle_resolver: &Url,
    ) -> Result<Box<dyn OAuthSubsystem>, OAuthError> {
        config.validate().map_err(OAuthError::Resolution)?;

        let mut resolver = IdentityResolver::new(self.http_client.clone(), handle_resolver.clone());
        if let Some(plc) = &self.plc_directory {
            resolver = resolver.with_plc_directory(plc.clone());
        }

        Ok(Box::new(AtProtoOAuthClient::new(
            config.clone(),
            resolver,
            self.store.clone(),
            self.http_client.clone(),
        )))
    }
}

/// Generate a cryptographically secure code verifier for PKCE
fn generate_code_verifier() -> String {
    let mut rng = rand::thread_rng();
    let random_bytes: Vec<u8> = (0..32).map(|_| rng.r#gen()).collect();
    URL_SAFE_NO_PAD.encode(random_bytes)
}

/// Generate code challenge from verifier using SHA256
fn generate_code_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Generate a cryptographically secure state parameter
fn generate_state() -> String {
    let mut rng = rand::thread_rng();
    let random_bytes: Vec<u8> = (0..32).map(|_| rng.r#gen()).collect();
    URL_SAFE_NO_PAD.encode(random_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_code_verifier() {
        let verifier = generate_code_verifier();
        assert!(verifier.len() >= 43); // Base64 encoded 32 bytes
        assert_ne!(verifier, generate_code_verifier());
    }

    #[test]
    fn test_code_challenge_matches_rfc7636() {
        // RFC 7636 appendix B
        let challenge = generate_code_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk");
        assert_eq!(challenge, "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
    }

    #[test]
    fn test_generate_state() {
        let state = generate_state();
        assert!(state.len() >= 43);
    }

    #[test]
    fn test_callback_from_query() {
        let url = Url::parse("https://sandbox.test/?iss=https%3A%2F%2Fbsky.social&state=abc&code=xyz").unwrap();
        let params = CallbackParams::from_url(&url).unwrap();
        assert_eq!(params.code.as_deref(), Some("xyz"));
        assert_eq!(params.state.as_deref(), Some("abc"));
        assert_eq!(params.iss.as_deref(), Some("https://bsky.social"));
    }

    #[test]
    fn test_callback_from_fragment() {
        let url = Url::parse("https://sandbox.test/#state=abc&error=access_denied&error_description=User%20declined").unwrap();
        let params = CallbackParams::from_url(&url).unwrap();
        assert_eq!(params.error.as_deref(), Some("access_denied"));
        assert_eq!(params.error_description.as_deref(), Some("User declined"));
        assert!(params.code.is_none());
    }

    #[test]
    fn test_plain_page_is_not_a_callback() {
        assert!(CallbackParams::from_url(&Url::parse("https://sandbox.test/").unwrap()).is_none());
        assert!(CallbackParams::from_url(&Url::parse("https://sandbox.test/?code=xyz").unwrap()).is_none());
        assert!(CallbackParams::from_url(&Url::parse("https://sandbox.test/#section").unwrap()).is_none());
    }

    #[test]
    fn test_token_must_be_dpop_bound() {
        let token = TokenResponse {
            access_token: "a".into(),
            token_type: "Bearer".into(),
            expires_in: Some(60),
            refresh_token: None,
            scope: Some("atproto".into()),
            sub: Some("did:plc:x".into()),
        };
        let err = session_from_token(
            token,
            "did:plc:x".into(),
            "https://pds.test".into(),
            "https://auth.test".into(),
            &DpopKey::generate(),
            None,
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid_token_type"));
    }

    #[test]
    fn test_refresh_keeps_previous_refresh_token() {
        let token = TokenResponse {
            access_token: "new".into(),
            token_type: "DPoP".into(),
            expires_in: Some(3600),
            refresh_token: None,
            scope: Some("atproto transition:generic".into()),
            sub: None,
        };
        let session = session_from_token(
            token,
            "did:plc:x".into(),
            "https://pds.test".into(),
            "https://auth.test".into(),
            &DpopKey::generate(),
            Some("n1".into()),
            Some("old-refresh".into()),
        )
        .unwrap();
        assert_eq!(session.tokens.refresh_token.as_deref(), Some("old-refresh"));
        assert_eq!(session.dpop.nonce.as_deref(), Some("n1"));
        assert!(!session.tokens.is_expired());
    }
}
