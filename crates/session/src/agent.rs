//! Authenticated service agent seam
//!
//! Agents are built from an `OAuthSession` by an `AgentFactory`. The
//! factory has two construction paths; `construct_handle` tries the
//! session-aware one first and the raw-session one second.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::{BootstrapError, ServiceError};
use crate::session::OAuthSession;

/// `app.bsky.actor.defs#profileViewDetailed`, the fields we use.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRecord {
    pub did: String,
    pub handle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostAuthor {
    pub did: String,
    pub handle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// `app.bsky.feed.defs#postView`, the fields we use.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostView {
    pub uri: String,
    pub cid: String,
    pub author: PostAuthor,
    #[serde(default)]
    pub record: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexed_at: Option<String>,
}

impl PostView {
    /// Post text, when the record carries one.
    pub fn text(&self) -> Option<&str> {
        self.record.get("text").and_then(Value::as_str)
    }
}

/// Reference returned by a record write.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RecordRef {
    pub uri: String,
    pub cid: String,
}

/// A record read back from a repository.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StoredRecord {
    pub uri: String,
    #[serde(default)]
    pub cid: Option<String>,
    pub value: Value,
}

/// Signed calls against the remote service.
#[async_trait]
pub trait ServiceAgent: Send + Sync {
    async fn get_profile(&self, actor: &str) -> Result<ProfileRecord, ServiceError>;

    async fn search_posts(&self, query: &str, limit: u32) -> Result<Vec<PostView>, ServiceError>;

    async fn put_record(
        &self,
        repo: &str,
        collection: &str,
        rkey: &str,
        record: Value,
    ) -> Result<RecordRef, ServiceError>;

    async fn get_record(
        &self,
        repo: &str,
        collection: &str,
        rkey: &str,
    ) -> Result<StoredRecord, ServiceError>;
}

/// Builds agents from session material.
pub trait AgentFactory: Send + Sync {
    /// Documented construction from a typed session.
    fn from_session(&self, session: &OAuthSession) -> Result<Arc<dyn ServiceAgent>, ServiceError>;

    /// Construction from the raw serialized session.
    fn from_raw_session(&self, raw: &Value) -> Result<Arc<dyn ServiceAgent>, ServiceError> {
        let _ = raw;
        Err(ServiceError::UnsupportedSession(
            "raw session construction is not available".to_string(),
        ))
    }
}

/// The live capability for issuing signed calls.
///
/// Holds no subject identifier; callers pass the subject explicitly.
#[derive(Clone)]
pub struct AuthenticatedHandle {
    agent: Arc<dyn ServiceAgent>,
}

impl AuthenticatedHandle {
    pub fn agent(&self) -> &Arc<dyn ServiceAgent> {
        &self.agent
    }
}

/// Build a handle for `session`, preferring the session-aware path.
pub fn construct_handle(
    factory: &dyn AgentFactory,
    session: &OAuthSession,
) -> Result<AuthenticatedHandle, BootstrapError> {
    let preferred = match factory.from_session(session) {
        Ok(agent) => return Ok(AuthenticatedHandle { agent }),
        Err(err) => {
            tracing::warn!(
                "Session-aware agent construction failed for {}: {}",
                session.sub,
                err
            );
            err
        }
    };

    let raw = serde_json::to_value(session)
        .map_err(|e| BootstrapError::AgentConstruction(e.to_string()))?;

    match factory.from_raw_session(&raw) {
        Ok(agent) => {
            tracing::info!("Built agent for {} from raw session", session.sub);
            Ok(AuthenticatedHandle { agent })
        }
        Err(fallback) => Err(BootstrapError::AgentConstruction(format!(
            "{}; raw session fallback: {}",
            preferred, fallback
        ))),
    }
}
