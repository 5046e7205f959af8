//! Session bootstrap controller
//!
//! One `SessionController` lives for one page load. It owns the client
//! metadata, the OAuth subsystem, the current session and the authenticated
//! handle, and drives the page from logged out to showing a profile.

use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use url::Url;

use crate::agent::{
    AgentFactory, AuthenticatedHandle, PostView, RecordRef, ServiceAgent, StoredRecord,
    construct_handle,
};
use crate::error::BootstrapError;
use crate::metadata::{ClientConfiguration, MetadataSource};
use crate::oauth::{OAuthProvider, OAuthSubsystem, SignInOptions};
use crate::session::OAuthSession;
use crate::view::{ControllerState, Event, Page, Phase, ProfileView};

pub const DEFAULT_METADATA_URL: &str =
    "https://zomega.github.io/atproto-sandbox/client-metadata.json";
pub const DEFAULT_HANDLE_RESOLVER: &str = "https://bsky.social";
pub const DEFAULT_SEARCH_QUERY: &str = "Wordle 🟩";
pub const DEFAULT_SEARCH_LIMIT: u32 = 5;
pub const LOGIN_PROMPT: &str = "Enter your handle (e.g., will.bsky.social)";

/// Fixed inputs of the bootstrap flow.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub metadata_url: Url,
    pub handle_resolver: Url,
    pub sign_in: SignInOptions,
    pub search_query: String,
    pub search_limit: u32,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            metadata_url: Url::parse(DEFAULT_METADATA_URL).expect("valid default metadata URL"),
            handle_resolver: Url::parse(DEFAULT_HANDLE_RESOLVER)
                .expect("valid default handle resolver"),
            sign_in: SignInOptions::default(),
            search_query: DEFAULT_SEARCH_QUERY.to_string(),
            search_limit: DEFAULT_SEARCH_LIMIT,
        }
    }
}

/// The external subsystems the controller talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub metadata: Arc<dyn MetadataSource>,
    pub oauth: Arc<dyn OAuthProvider>,
    pub agents: Arc<dyn AgentFactory>,
}

pub struct SessionController {
    settings: ControllerSettings,
    collaborators: Collaborators,
    page: Box<dyn Page>,
    state: ControllerState,
    config: Option<ClientConfiguration>,
    oauth: Option<Box<dyn OAuthSubsystem>>,
    session: Option<OAuthSession>,
    handle: Option<AuthenticatedHandle>,
    background: Vec<JoinHandle<()>>,
}

impl SessionController {
    pub fn new(
        settings: ControllerSettings,
        collaborators: Collaborators,
        page: Box<dyn Page>,
    ) -> Self {
        Self {
            settings,
            collaborators,
            page,
            state: ControllerState::default(),
            config: None,
            oauth: None,
            session: None,
            handle: None,
            background: Vec::new(),
        }
    }

    pub fn phase(&self) -> &Phase {
        &self.state.phase
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn client_configuration(&self) -> Option<&ClientConfiguration> {
        self.config.as_ref()
    }

    /// Subject DID of the active session.
    pub fn subject(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.sub.as_str())
    }

    pub fn is_authenticated(&self) -> bool {
        self.handle.is_some()
    }

    fn transition(&mut self, event: Event) {
        self.state = self.state.apply(event);
        self.page.render(&self.state.view);
    }

    fn fail(&mut self, err: BootstrapError) -> BootstrapError {
        tracing::error!("Initialization failed: {}", err);
        self.transition(Event::Failed(err.to_string()));
        err
    }

    /// Load the client, resume any session found at `location`, and if one
    /// is found activate it and load the profile.
    pub async fn bootstrap(&mut self, location: &Url) -> Result<(), BootstrapError> {
        tracing::info!("App initializing...");
        self.transition(Event::ConfigRequested);

        let fetched = self
            .collaborators
            .metadata
            .fetch(&self.settings.metadata_url)
            .await;
        let config = match fetched {
            Ok(config) => config,
            Err(err) => return Err(self.fail(BootstrapError::ConfigFetch(format!("{:#}", err)))),
        };

        let constructed = self
            .collaborators
            .oauth
            .construct(&config, &self.settings.handle_resolver);
        let oauth = match constructed {
            Ok(oauth) => oauth,
            Err(err) => return Err(self.fail(err.into())),
        };
        tracing::debug!("Loaded client metadata for {}", config.client_id);
        self.config = Some(config);
        self.transition(Event::ConfigLoaded);

        let resumed = oauth.resume_or_initiate(location).await;
        self.oauth = Some(oauth);

        match resumed {
            Ok(Some(session)) => {
                tracing::info!("Session resumed for {}", session.sub);
                self.transition(Event::SessionRecovered {
                    subject: session.sub.clone(),
                });
                let subject = session.sub.clone();
                self.activate_session(session).await?;
                let _ = self.fetch_profile(&subject).await;
                let query = self.settings.search_query.clone();
                let limit = self.settings.search_limit;
                if let Some(task) = self.spawn_search(&query, limit) {
                    self.background.push(task);
                }
                Ok(())
            }
            Ok(None) => {
                tracing::info!("No session found, waiting for user login.");
                self.transition(Event::NoSession);
                Ok(())
            }
            Err(err) => Err(self.fail(err.into())),
        }
    }

    /// Start authorization for `handle` and send the page to the server.
    ///
    /// Returns the redirect URL, or `None` when the handle was empty.
    pub async fn login(&mut self, handle: &str) -> Result<Option<Url>, BootstrapError> {
        let handle = handle.trim();
        if handle.is_empty() {
            self.page.alert(LOGIN_PROMPT);
            return Ok(None);
        }

        let result = match self.oauth.as_ref() {
            Some(oauth) => oauth
                .request_login_redirect(handle, &self.settings.sign_in)
                .await
                .map_err(|e| BootstrapError::LoginRequest(e.to_string())),
            None => Err(BootstrapError::LoginRequest(
                "OAuth client is not initialized".to_string(),
            )),
        };

        match result {
            Ok(url) => {
                tracing::info!("Redirecting {} to {}", handle, url);
                self.page.navigate(&url);
                Ok(Some(url))
            }
            Err(err) => {
                tracing::error!("Login failed: {}", err);
                self.page.alert(&format!("Login failed: {}", err));
                Err(err)
            }
        }
    }

    /// Build the authenticated handle for `session` and switch the page to
    /// the authenticated view.
    pub async fn activate_session(&mut self, session: OAuthSession) -> Result<(), BootstrapError> {
        let handle = match construct_handle(self.collaborators.agents.as_ref(), &session) {
            Ok(handle) => handle,
            Err(err) => {
                self.handle = None;
                self.session = None;
                return Err(self.fail(err));
            }
        };

        self.session = Some(session);
        self.handle = Some(handle);
        self.transition(Event::AgentReady);
        Ok(())
    }

    fn agent(&self) -> Result<Arc<dyn ServiceAgent>, BootstrapError> {
        self.handle
            .as_ref()
            .map(|h| Arc::clone(h.agent()))
            .ok_or(BootstrapError::NotAuthenticated)
    }

    fn repo(&self) -> Result<String, BootstrapError> {
        self.subject()
            .map(str::to_string)
            .ok_or(BootstrapError::NotAuthenticated)
    }

    /// Read the profile for `subject` and render it, or render the error.
    pub async fn fetch_profile(&mut self, subject: &str) -> Result<ProfileView, BootstrapError> {
        let result = match self.agent() {
            Ok(agent) => agent
                .get_profile(subject)
                .await
                .map_err(|e| BootstrapError::ProfileFetch(e.to_string())),
            Err(err) => Err(err),
        };

        match result {
            Ok(profile) => {
                tracing::info!("Profile fetched: {:?}", profile);
                let view = ProfileView::from(&profile);
                self.transition(Event::ProfileLoaded(view.clone()));
                Ok(view)
            }
            Err(err) => {
                tracing::error!("Failed to fetch profile: {}", err);
                self.transition(Event::ProfileFailed(err.to_string()));
                Err(err)
            }
        }
    }

    /// Search posts. Failures are logged and yield no posts.
    pub async fn search_recent_posts(&self, query: &str, limit: u32) -> Vec<PostView> {
        match self.agent() {
            Ok(agent) => run_search(agent, query, limit).await,
            Err(err) => {
                tracing::error!("Search failed: {}", err);
                Vec::new()
            }
        }
    }

    /// Fire-and-forget search on the current runtime.
    pub fn spawn_search(&self, query: &str, limit: u32) -> Option<JoinHandle<()>> {
        let agent = self.agent().ok()?;
        let query = query.to_string();
        Some(tokio::spawn(async move {
            run_search(agent, &query, limit).await;
        }))
    }

    /// Wait for background work started by `bootstrap`.
    pub async fn drain_background(&mut self) {
        for task in self.background.drain(..) {
            if let Err(err) = task.await {
                tracing::warn!("Background task ended abnormally: {}", err);
            }
        }
    }

    /// Upsert `value` at `(subject, collection, key)`.
    pub async fn save_record(
        &self,
        collection: &str,
        key: &str,
        value: Value,
    ) -> Result<RecordRef, BootstrapError> {
        let agent = self.agent()?;
        let repo = self.repo()?;

        match agent.put_record(&repo, collection, key, value).await {
            Ok(record) => {
                tracing::info!("Saved record {}", record.uri);
                Ok(record)
            }
            Err(err) => {
                tracing::error!("Failed to save record {}/{}: {}", collection, key, err);
                Err(BootstrapError::RecordWrite(err.to_string()))
            }
        }
    }

    /// Read `(subject, collection, key)`. A missing record is `Ok(None)`.
    pub async fn read_record(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<StoredRecord>, BootstrapError> {
        let agent = self.agent()?;
        let repo = self.repo()?;

        match agent.get_record(&repo, collection, key).await {
            Ok(record) => {
                tracing::info!("Loaded record {}", record.uri);
                Ok(Some(record))
            }
            Err(err) if err.is_not_found() => {
                tracing::info!("No record at {}/{} yet", collection, key);
                Ok(None)
            }
            Err(err) => {
                tracing::error!("Failed to read record {}/{}: {}", collection, key, err);
                Err(BootstrapError::RecordRead(err.to_string()))
            }
        }
    }

    /// Sign the current subject out and return to the login view.
    pub async fn logout(&mut self) -> Result<(), BootstrapError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        self.handle = None;

        if let Some(oauth) = self.oauth.as_ref() {
            if let Err(err) = oauth.sign_out(&session.sub).await {
                tracing::warn!("Sign-out for {} did not complete: {}", session.sub, err);
            }
        }

        tracing::info!("Signed out {}", session.sub);
        self.transition(Event::SignedOut);
        Ok(())
    }
}

async fn run_search(agent: Arc<dyn ServiceAgent>, query: &str, limit: u32) -> Vec<PostView> {
    match agent.search_posts(query, limit).await {
        Ok(posts) => {
            tracing::info!("Recent posts for {:?}: {}", query, posts.len());
            for post in &posts {
                tracing::debug!("{} {}", post.author.handle, post.text().unwrap_or_default());
            }
            posts
        }
        Err(err) => {
            tracing::error!("Search failed: {}", BootstrapError::Search(err.to_string()));
            Vec::new()
        }
    }
}
