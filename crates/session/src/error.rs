//! Error taxonomy for the session bootstrap flow
//!
//! `BootstrapError` is what the controller's operations report. The two
//! collaborator errors (`OAuthError`, `ServiceError`) are produced by the
//! OAuth and service subsystems and are treated as opaque messages, except
//! for the not-found signature on record reads.

use thiserror::Error;

/// Errors reported by the OAuth subsystem.
#[derive(Debug, Error)]
pub enum OAuthError {
    /// Transport-level failure talking to a resolver or authorization server.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Handle, DID or server metadata could not be resolved.
    #[error("resolution failed: {0}")]
    Resolution(String),

    /// The authorization server answered with an OAuth error body.
    #[error("{error}: {description}")]
    Protocol { error: String, description: String },

    /// The redirect carried an error or did not match a pending flow.
    #[error("callback rejected: {0}")]
    Callback(String),

    /// DPoP key handling or proof signing failed.
    #[error("DPoP error: {0}")]
    Dpop(String),

    /// Flow or session storage failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<reqwest::Error> for OAuthError {
    fn from(e: reqwest::Error) -> Self {
        OAuthError::Http(e.to_string())
    }
}

/// Errors reported by the service (XRPC) subsystem.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Transport-level failure.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The service answered with a non-success status.
    #[error("{}", xrpc_message(*status, error.as_deref(), message.as_deref()))]
    Xrpc {
        status: u16,
        error: Option<String>,
        message: Option<String>,
    },

    /// The response body did not have the expected shape.
    #[error("invalid response: {0}")]
    Decode(String),

    /// The agent could not be built from the given session material.
    #[error("unsupported session: {0}")]
    UnsupportedSession(String),
}

fn xrpc_message(status: u16, error: Option<&str>, message: Option<&str>) -> String {
    match (error, message) {
        (_, Some(message)) => message.to_string(),
        (Some(error), None) => error.to_string(),
        (None, None) => format!("request failed with status {status}"),
    }
}

impl ServiceError {
    /// Whether this error means the requested item does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            ServiceError::Xrpc {
                status,
                error,
                message,
            } => {
                *status == 404
                    || error.as_deref() == Some("RecordNotFound")
                    || message
                        .as_deref()
                        .is_some_and(|m| m.contains("Could not locate record"))
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(e: reqwest::Error) -> Self {
        ServiceError::Http(e.to_string())
    }
}

/// Errors surfaced by the controller's operations.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Client metadata could not be fetched, parsed or validated. Fatal.
    #[error("{0}")]
    ConfigFetch(String),

    /// The OAuth subsystem failed while resuming or initiating a session. Fatal.
    #[error("{0}")]
    SessionResume(#[from] OAuthError),

    /// The authorization redirect could not be requested. Recoverable.
    #[error("{0}")]
    LoginRequest(String),

    /// No authenticated handle could be built from the session. Fatal.
    #[error("could not construct an authenticated agent: {0}")]
    AgentConstruction(String),

    /// Profile read failed; shown inline.
    #[error("{0}")]
    ProfileFetch(String),

    /// Search failed; logged only.
    #[error("{0}")]
    Search(String),

    /// The record does not exist.
    ///
    /// `SessionController::read_record` never returns this: a missing
    /// record is `Ok(None)`, shown as an empty state.
    #[error("record not found: {0}")]
    RecordNotFound(String),

    /// Record read failed for a reason other than absence.
    #[error("{0}")]
    RecordRead(String),

    /// Record write failed.
    #[error("{0}")]
    RecordWrite(String),

    /// An authenticated call was attempted before a session was activated.
    #[error("not signed in")]
    NotAuthenticated,
}
