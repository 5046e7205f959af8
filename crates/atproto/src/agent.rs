//! XRPC agent bound to an OAuth session
//!
//! Requests go to the session's PDS with `Authorization: DPoP <token>` and
//! a fresh proof per request. `app.bsky.*` calls are proxied to the
//! AppView through the `atproto-proxy` header.

use async_trait::async_trait;
use reqwest::Method;
use sandbox_session::{
    AgentFactory, DpopBinding, OAuthSession, PostView, ProfileRecord, RecordRef, ServiceAgent,
    ServiceError, StoredRecord, TokenSet,
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use url::Url;

use crate::dpop::DpopKey;

pub const BSKY_APPVIEW_PROXY: &str = "did:web:api.bsky.app#bsky_appview";

#[derive(Deserialize)]
struct XrpcErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct SearchPostsOutput {
    #[serde(default)]
    posts: Vec<PostView>,
}

pub struct XrpcAgent {
    http_client: reqwest::Client,
    pds: Url,
    access_token: String,
    key: DpopKey,
    nonce: Mutex<Option<String>>,
    appview_proxy: Option<String>,
}

impl XrpcAgent {
    pub fn new(
        http_client: reqwest::Client,
        pds: Url,
        access_token: String,
        key: DpopKey,
        nonce: Option<String>,
        appview_proxy: Option<String>,
    ) -> Self {
        Self {
            http_client,
            pds,
            access_token,
            key,
            nonce: Mutex::new(nonce),
            appview_proxy,
        }
    }

    fn current_nonce(&self) -> Option<String> {
        self.nonce.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn remember_nonce(&self, nonce: String) {
        *self.nonce.lock().unwrap_or_else(|p| p.into_inner()) = Some(nonce);
    }

    fn endpoint(&self, nsid: &str, query: &[(&str, String)]) -> Result<Url, ServiceError> {
        let mut url = self
            .pds
            .join(&format!("/xrpc/{}", nsid))
            .map_err(|e| ServiceError::Http(format!("invalid XRPC URL: {}", e)))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        nsid: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<T, ServiceError> {
        let url = self.endpoint(nsid, query)?;
        let mut answered_challenge = false;

        loop {
            let proof = self
                .key
                .proof(
                    method.as_str(),
                    &url,
                    self.current_nonce().as_deref(),
                    Some(&self.access_token),
                )
                .map_err(|e| ServiceError::Http(format!("could not sign request: {}", e)))?;

            let mut request = self
                .http_client
                .request(method.clone(), url.clone())
                .header("Authorization", format!("DPoP {}", self.access_token))
                .header("DPoP", proof);
            if nsid.starts_with("app.bsky.") {
                if let Some(proxy) = &self.appview_proxy {
                    request = request.header("atproto-proxy", proxy);
                }
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request.send().await?;

            let fresh_nonce = response
                .headers()
                .get("DPoP-Nonce")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            if let Some(nonce) = &fresh_nonce {
                self.remember_nonce(nonce.clone());
            }

            let status = response.status();
            if status.is_success() {
                return response
                    .json::<T>()
                    .await
                    .map_err(|e| ServiceError::Decode(format!("{}: {}", nsid, e)));
            }

            let challenged_by_header = response
                .headers()
                .get("WWW-Authenticate")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.contains("use_dpop_nonce"));
            let text = response.text().await.unwrap_or_default();
            let error_body = serde_json::from_str::<XrpcErrorBody>(&text).ok();
            let challenged = challenged_by_header
                || error_body
                    .as_ref()
                    .and_then(|b| b.error.as_deref())
                    .is_some_and(|e| e == "use_dpop_nonce");

            if challenged && fresh_nonce.is_some() && !answered_challenge {
                tracing::debug!("{} requested a DPoP nonce", self.pds);
                answered_challenge = true;
                continue;
            }

            let (error, message) = match error_body {
                Some(body) => (body.error, body.message),
                None => (None, None),
            };
            tracing::debug!("{} {} failed with {}", method, nsid, status);
            return Err(ServiceError::Xrpc {
                status: status.as_u16(),
                error,
                message,
            });
        }
    }
}

#[async_trait]
impl ServiceAgent for XrpcAgent {
    async fn get_profile(&self, actor: &str) -> Result<ProfileRecord, ServiceError> {
        self.call(
            Method::GET,
            "app.bsky.actor.getProfile",
            &[("actor", actor.to_string())],
            None,
        )
        .await
    }

    async fn search_posts(&self, query: &str, limit: u32) -> Result<Vec<PostView>, ServiceError> {
        let output: SearchPostsOutput = self
            .call(
                Method::GET,
                "app.bsky.feed.searchPosts",
                &[("q", query.to_string()), ("limit", limit.to_string())],
                None,
            )
            .await?;
        Ok(output.posts)
    }

    async fn put_record(
        &self,
        repo: &str,
        collection: &str,
        rkey: &str,
        record: Value,
    ) -> Result<RecordRef, ServiceError> {
        let body = json!({
            "repo": repo,
            "collection": collection,
            "rkey": rkey,
            "record": record,
        });
        self.call(Method::POST, "com.atproto.repo.putRecord", &[], Some(&body))
            .await
    }

    async fn get_record(
        &self,
        repo: &str,
        collection: &str,
        rkey: &str,
    ) -> Result<StoredRecord, ServiceError> {
        self.call(
            Method::GET,
            "com.atproto.repo.getRecord",
            &[
                ("repo", repo.to_string()),
                ("collection", collection.to_string()),
                ("rkey", rkey.to_string()),
            ],
            None,
        )
        .await
    }
}

/// Session material as it may appear in serialized form.
#[derive(Deserialize)]
struct RawSession {
    #[serde(alias = "did")]
    sub: String,
    #[serde(alias = "pds_url", alias = "pdsUrl")]
    aud: String,
    tokens: TokenSet,
    dpop: DpopBinding,
}

/// Builds `XrpcAgent`s that share one HTTP client.
#[derive(Clone)]
pub struct XrpcAgentFactory {
    http_client: reqwest::Client,
    appview_proxy: Option<String>,
}

impl XrpcAgentFactory {
    pub fn new(http_client: reqwest::Client) -> Self {
        Self {
            http_client,
            appview_proxy: Some(BSKY_APPVIEW_PROXY.to_string()),
        }
    }

    /// Override the `atproto-proxy` target; `None` sends `app.bsky.*` calls to the PDS itself.
    pub fn with_appview_proxy(mut self, appview_proxy: Option<String>) -> Self {
        self.appview_proxy = appview_proxy;
        self
    }

    fn build(
        &self,
        aud: &str,
        tokens: &TokenSet,
        key: DpopKey,
        nonce: Option<String>,
    ) -> Result<Arc<dyn ServiceAgent>, ServiceError> {
        let pds = Url::parse(aud)
            .map_err(|e| ServiceError::UnsupportedSession(format!("invalid PDS URL '{}': {}", aud, e)))?;
        Ok(Arc::new(XrpcAgent::new(
            self.http_client.clone(),
            pds,
            tokens.access_token.clone(),
            key,
            nonce,
            self.appview_proxy.clone(),
        )))
    }
}

impl AgentFactory for XrpcAgentFactory {
    fn from_session(&self, session: &OAuthSession) -> Result<Arc<dyn ServiceAgent>, ServiceError> {
        if !session.tokens.token_type.eq_ignore_ascii_case("DPoP") {
            return Err(ServiceError::UnsupportedSession(format!(
                "token type {} is not DPoP",
                session.tokens.token_type
            )));
        }

        let key = DpopKey::from_binding(&session.dpop)
            .map_err(|e| ServiceError::UnsupportedSession(e.to_string()))?;
        let stored: Value = serde_json::from_str(&session.dpop.jwk)
            .map_err(|e| ServiceError::UnsupportedSession(format!("invalid stored JWK: {}", e)))?;
        let derived = key
            .public_jwk()
            .ok()
            .and_then(|jwk| serde_json::to_value(jwk).ok());
        if derived.as_ref() != Some(&stored) {
            return Err(ServiceError::UnsupportedSession(
                "stored JWK does not match the DPoP key".to_string(),
            ));
        }

        self.build(&session.aud, &session.tokens, key, session.dpop.nonce.clone())
    }

    fn from_raw_session(&self, raw: &Value) -> Result<Arc<dyn ServiceAgent>, ServiceError> {
        let raw: RawSession = serde_json::from_value(raw.clone())
            .map_err(|e| ServiceError::UnsupportedSession(format!("unreadable session: {}", e)))?;
        if !raw.sub.starts_with("did:") {
            return Err(ServiceError::UnsupportedSession(format!(
                "session subject is not a DID: {}",
                raw.sub
            )));
        }
        let key = DpopKey::from_binding(&raw.dpop)
            .map_err(|e| ServiceError::UnsupportedSession(e.to_string()))?;
        self.build(&raw.aud, &raw.tokens, key, raw.dpop.nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_session::unix_now;

    fn session() -> OAuthSession {
        let key = DpopKey::generate();
        OAuthSession {
            sub: "did:plc:test".into(),
            aud: "https://pds.sandbox.test".into(),
            iss: "https://auth.sandbox.test".into(),
            scope: "atproto".into(),
            tokens: TokenSet {
                access_token: "token".into(),
                token_type: "DPoP".into(),
                refresh_token: None,
                expires_at: Some(unix_now() + 3600),
            },
            dpop: key.binding(None).unwrap(),
        }
    }

    #[test]
    fn test_from_session_accepts_consistent_binding() {
        let factory = XrpcAgentFactory::new(reqwest::Client::new());
        assert!(factory.from_session(&session()).is_ok());
    }

    #[test]
    fn test_from_session_rejects_foreign_jwk() {
        let factory = XrpcAgentFactory::new(reqwest::Client::new());
        let mut session = session();
        session.dpop.jwk = DpopKey::generate().binding(None).unwrap().jwk;

        let err = factory.from_session(&session).err().unwrap();
        assert!(err.to_string().contains("does not match"));
        // The raw path does not check the stored JWK.
        let raw = serde_json::to_value(&session).unwrap();
        assert!(factory.from_raw_session(&raw).is_ok());
    }

    #[test]
    fn test_raw_session_accepts_aliases() {
        let factory = XrpcAgentFactory::new(reqwest::Client::new());
        let mut raw = serde_json::to_value(session()).unwrap();
        let object = raw.as_object_mut().unwrap();
        let sub = object.remove("sub").unwrap();
        let aud = object.remove("aud").unwrap();
        object.insert("did".into(), sub);
        object.insert("pds_url".into(), aud);

        assert!(factory.from_raw_session(&raw).is_ok());
    }

    #[test]
    fn test_raw_session_rejects_garbage() {
        let factory = XrpcAgentFactory::new(reqwest::Client::new());
        let err = factory.from_raw_session(&json!({ "sub": "did:plc:x" })).err().unwrap();
        assert!(matches!(err, ServiceError::UnsupportedSession(_)));
    }

    #[test]
    fn test_raw_session_rejects_handle_subject() {
        let factory = XrpcAgentFactory::new(reqwest::Client::new());
        let mut raw = serde_json::to_value(session()).unwrap();
        raw["sub"] = json!("alice.sandbox.test");

        let err = factory.from_raw_session(&raw).err().unwrap();
        match err {
            ServiceError::UnsupportedSession(message) => {
                assert!(message.contains("alice.sandbox.test"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
