//! In-memory collaborators for exercising the controller without a network

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use url::Url;

use crate::agent::{
    AgentFactory, PostAuthor, PostView, ProfileRecord, RecordRef, ServiceAgent, StoredRecord,
};
use crate::controller::{Collaborators, ControllerSettings, SessionController};
use crate::error::{OAuthError, ServiceError};
use crate::metadata::{ClientConfiguration, MetadataSource};
use crate::oauth::{OAuthProvider, OAuthSubsystem, SignInOptions};
use crate::session::{DpopBinding, OAuthSession, TokenSet};
use crate::view::{Page, ViewState};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Valid client metadata for tests.
pub fn client_configuration() -> ClientConfiguration {
    ClientConfiguration {
        client_id: "https://sandbox.test/client-metadata.json".to_string(),
        client_name: Some("Sandbox".to_string()),
        client_uri: None,
        logo_uri: None,
        tos_uri: None,
        policy_uri: None,
        redirect_uris: vec!["https://sandbox.test/".to_string()],
        scope: "atproto".to_string(),
        grant_types: vec!["authorization_code".to_string(), "refresh_token".to_string()],
        response_types: vec!["code".to_string()],
        token_endpoint_auth_method: "none".to_string(),
        application_type: Some("web".to_string()),
        dpop_bound_access_tokens: true,
    }
}

/// A session for `sub` with throwaway credentials.
pub fn session_for(sub: &str) -> OAuthSession {
    OAuthSession {
        sub: sub.to_string(),
        aud: "https://pds.sandbox.test".to_string(),
        iss: "https://auth.sandbox.test".to_string(),
        scope: "atproto".to_string(),
        tokens: TokenSet {
            access_token: "access".to_string(),
            token_type: "DPoP".to_string(),
            refresh_token: None,
            expires_at: None,
        },
        dpop: DpopBinding {
            pkcs8: Vec::new(),
            jwk: "{}".to_string(),
            nonce: None,
        },
    }
}

/// Metadata source returning a fixed result and counting calls.
pub struct StaticMetadata {
    result: std::result::Result<ClientConfiguration, String>,
    calls: Mutex<usize>,
}

impl StaticMetadata {
    pub fn ok(config: ClientConfiguration) -> Self {
        Self {
            result: Ok(config),
            calls: Mutex::new(0),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            result: Err(message.to_string()),
            calls: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        *lock(&self.calls)
    }
}

#[async_trait]
impl MetadataSource for StaticMetadata {
    async fn fetch(&self, _url: &Url) -> Result<ClientConfiguration> {
        *lock(&self.calls) += 1;
        self.result.clone().map_err(|e| anyhow!(e))
    }
}

/// Scripted OAuth subsystem. Clones share state.
#[derive(Clone, Default)]
pub struct FakeOAuth {
    inner: Arc<FakeOAuthState>,
}

#[derive(Default)]
struct FakeOAuthState {
    resumed: Mutex<Option<OAuthSession>>,
    resume_error: Mutex<Option<String>>,
    login_error: Mutex<Option<String>>,
    login_requests: Mutex<Vec<(String, SignInOptions)>>,
    resume_calls: Mutex<usize>,
    signed_out: Mutex<Vec<String>>,
    constructed_with: Mutex<Option<Url>>,
}

impl FakeOAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(self, session: OAuthSession) -> Self {
        *lock(&self.inner.resumed) = Some(session);
        self
    }

    pub fn with_resume_error(self, message: &str) -> Self {
        *lock(&self.inner.resume_error) = Some(message.to_string());
        self
    }

    pub fn with_login_error(self, message: &str) -> Self {
        *lock(&self.inner.login_error) = Some(message.to_string());
        self
    }

    pub fn login_requests(&self) -> Vec<(String, SignInOptions)> {
        lock(&self.inner.login_requests).clone()
    }

    pub fn resume_calls(&self) -> usize {
        *lock(&self.inner.resume_calls)
    }

    pub fn signed_out(&self) -> Vec<String> {
        lock(&self.inner.signed_out).clone()
    }

    pub fn constructed_with(&self) -> Option<Url> {
        lock(&self.inner.constructed_with).clone()
    }
}

#[async_trait]
impl OAuthSubsystem for FakeOAuth {
    async fn resume_or_initiate(&self, _location: &Url) -> Result<Option<OAuthSession>, OAuthError> {
        *lock(&self.inner.resume_calls) += 1;
        if let Some(message) = lock(&self.inner.resume_error).clone() {
            return Err(OAuthError::Callback(message));
        }
        Ok(lock(&self.inner.resumed).clone())
    }

    async fn request_login_redirect(
        &self,
        handle: &str,
        options: &SignInOptions,
    ) -> Result<Url, OAuthError> {
        lock(&self.inner.login_requests).push((handle.to_string(), options.clone()));
        if let Some(message) = lock(&self.inner.login_error).clone() {
            return Err(OAuthError::Resolution(message));
        }
        Url::parse(&format!(
            "https://auth.sandbox.test/oauth/authorize?login_hint={}",
            handle
        ))
        .map_err(|e| OAuthError::Resolution(e.to_string()))
    }

    async fn sign_out(&self, subject: &str) -> Result<(), OAuthError> {
        lock(&self.inner.signed_out).push(subject.to_string());
        *lock(&self.inner.resumed) = None;
        Ok(())
    }
}

impl OAuthProvider for FakeOAuth {
    fn construct(
        &self,
        _config: &ClientConfiguration,
        handle_resolver: &Url,
    ) -> Result<Box<dyn OAuthSubsystem>, OAuthError> {
        *lock(&self.inner.constructed_with) = Some(handle_resolver.clone());
        Ok(Box::new(self.clone()))
    }
}

/// In-memory service: profiles by DID, records keyed by
/// `(repo, collection, rkey)`.
#[derive(Clone, Default)]
pub struct FakeService {
    inner: Arc<FakeServiceState>,
}

#[derive(Default)]
struct FakeServiceState {
    profiles: Mutex<HashMap<String, ProfileRecord>>,
    records: Mutex<HashMap<(String, String, String), Value>>,
    posts: Mutex<Vec<PostView>>,
    fail_search: Mutex<bool>,
    profile_requests: Mutex<Vec<String>>,
    search_requests: Mutex<Vec<(String, u32)>>,
    revision: Mutex<u64>,
}

impl FakeService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(self, profile: ProfileRecord) -> Self {
        lock(&self.inner.profiles).insert(profile.did.clone(), profile);
        self
    }

    pub fn with_post(self, author: &str, text: &str) -> Self {
        let mut posts = lock(&self.inner.posts);
        let index = posts.len();
        posts.push(PostView {
            uri: format!("at://{}/app.bsky.feed.post/{}", author, index),
            cid: format!("bafypost{}", index),
            author: PostAuthor {
                did: author.to_string(),
                handle: format!("{}.test", index),
                display_name: None,
            },
            record: serde_json::json!({ "text": text }),
            indexed_at: None,
        });
        drop(posts);
        self
    }

    pub fn with_failing_search(self) -> Self {
        *lock(&self.inner.fail_search) = true;
        self
    }

    pub fn record_count(&self) -> usize {
        lock(&self.inner.records).len()
    }

    pub fn profile_requests(&self) -> Vec<String> {
        lock(&self.inner.profile_requests).clone()
    }

    pub fn search_requests(&self) -> Vec<(String, u32)> {
        lock(&self.inner.search_requests).clone()
    }
}

#[async_trait]
impl ServiceAgent for FakeService {
    async fn get_profile(&self, actor: &str) -> Result<ProfileRecord, ServiceError> {
        lock(&self.inner.profile_requests).push(actor.to_string());
        lock(&self.inner.profiles)
            .get(actor)
            .cloned()
            .ok_or_else(|| ServiceError::Xrpc {
                status: 400,
                error: Some("InvalidRequest".to_string()),
                message: Some("Profile not found".to_string()),
            })
    }

    async fn search_posts(&self, query: &str, limit: u32) -> Result<Vec<PostView>, ServiceError> {
        lock(&self.inner.search_requests).push((query.to_string(), limit));
        if *lock(&self.inner.fail_search) {
            return Err(ServiceError::Http("search unavailable".to_string()));
        }
        Ok(lock(&self.inner.posts)
            .iter()
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn put_record(
        &self,
        repo: &str,
        collection: &str,
        rkey: &str,
        record: Value,
    ) -> Result<RecordRef, ServiceError> {
        lock(&self.inner.records).insert(
            (repo.to_string(), collection.to_string(), rkey.to_string()),
            record,
        );
        let mut revision = lock(&self.inner.revision);
        *revision += 1;
        Ok(RecordRef {
            uri: format!("at://{}/{}/{}", repo, collection, rkey),
            cid: format!("bafyrecord{}", *revision),
        })
    }

    async fn get_record(
        &self,
        repo: &str,
        collection: &str,
        rkey: &str,
    ) -> Result<StoredRecord, ServiceError> {
        let key = (repo.to_string(), collection.to_string(), rkey.to_string());
        match lock(&self.inner.records).get(&key) {
            Some(value) => Ok(StoredRecord {
                uri: format!("at://{}/{}/{}", repo, collection, rkey),
                cid: None,
                value: value.clone(),
            }),
            None => Err(ServiceError::Xrpc {
                status: 400,
                error: Some("RecordNotFound".to_string()),
                message: Some(format!(
                    "Could not locate record: at://{}/{}/{}",
                    repo, collection, rkey
                )),
            }),
        }
    }
}

/// Which construction paths succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactoryMode {
    SessionAware,
    RawOnly,
    Broken,
}

/// Agent factory handing out a shared `FakeService`.
pub struct FakeAgentFactory {
    service: FakeService,
    mode: FactoryMode,
    attempts: Mutex<Vec<&'static str>>,
}

impl FakeAgentFactory {
    pub fn new(service: FakeService, mode: FactoryMode) -> Self {
        Self {
            service,
            mode,
            attempts: Mutex::new(Vec::new()),
        }
    }

    /// Construction paths tried, in order.
    pub fn attempts(&self) -> Vec<&'static str> {
        lock(&self.attempts).clone()
    }
}

impl AgentFactory for FakeAgentFactory {
    fn from_session(&self, _session: &OAuthSession) -> Result<Arc<dyn ServiceAgent>, ServiceError> {
        lock(&self.attempts).push("session");
        match self.mode {
            FactoryMode::SessionAware => Ok(Arc::new(self.service.clone())),
            _ => Err(ServiceError::UnsupportedSession(
                "session-aware construction unavailable".to_string(),
            )),
        }
    }

    fn from_raw_session(&self, raw: &Value) -> Result<Arc<dyn ServiceAgent>, ServiceError> {
        lock(&self.attempts).push("raw");
        match (self.mode, raw.get("sub")) {
            (FactoryMode::RawOnly, Some(_)) => Ok(Arc::new(self.service.clone())),
            _ => Err(ServiceError::UnsupportedSession(
                "raw session rejected".to_string(),
            )),
        }
    }
}

/// Everything a page was asked to do.
#[derive(Debug, Clone, Default)]
pub struct PageLog {
    pub renders: Vec<ViewState>,
    pub alerts: Vec<String>,
    pub navigations: Vec<Url>,
}

/// A page that records instead of drawing. Clones share the log.
#[derive(Clone, Default)]
pub struct RecordingPage {
    log: Arc<Mutex<PageLog>>,
}

impl RecordingPage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> PageLog {
        lock(&self.log).clone()
    }

    pub fn last_view(&self) -> Option<ViewState> {
        lock(&self.log).renders.last().cloned()
    }
}

impl Page for RecordingPage {
    fn render(&mut self, view: &ViewState) {
        lock(&self.log).renders.push(view.clone());
    }

    fn alert(&mut self, message: &str) {
        lock(&self.log).alerts.push(message.to_string());
    }

    fn navigate(&mut self, url: &Url) {
        lock(&self.log).navigations.push(url.clone());
    }
}

/// A controller wired to fakes, plus handles to inspect them.
pub struct Harness {
    pub controller: SessionController,
    pub metadata: Arc<StaticMetadata>,
    pub oauth: FakeOAuth,
    pub service: FakeService,
    pub agents: Arc<FakeAgentFactory>,
    pub page: RecordingPage,
}

impl Harness {
    pub fn new(
        metadata: StaticMetadata,
        oauth: FakeOAuth,
        service: FakeService,
        mode: FactoryMode,
    ) -> Self {
        let metadata = Arc::new(metadata);
        let agents = Arc::new(FakeAgentFactory::new(service.clone(), mode));
        let page = RecordingPage::new();
        let collaborators = Collaborators {
            metadata: metadata.clone(),
            oauth: Arc::new(oauth.clone()),
            agents: agents.clone(),
        };
        let controller = SessionController::new(
            ControllerSettings::default(),
            collaborators,
            Box::new(page.clone()),
        );

        Self {
            controller,
            metadata,
            oauth,
            service,
            agents,
            page,
        }
    }
}

/// The location a freshly loaded page sees.
pub fn page_location() -> Url {
    Url::parse("https://sandbox.test/").expect("static test URL")
}
