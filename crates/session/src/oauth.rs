//! OAuth subsystem seam
//!
//! The controller only needs three things from an OAuth implementation:
//! resume a session from the current page location, produce an
//! authorization redirect for a handle, and sign a subject out.

use async_trait::async_trait;
use url::Url;

use crate::error::OAuthError;
use crate::metadata::ClientConfiguration;
use crate::session::OAuthSession;

/// Options passed along with a sign-in request.
#[derive(Debug, Clone, PartialEq)]
pub struct SignInOptions {
    pub scope: String,
    pub ui_locales: String,
}

impl Default for SignInOptions {
    fn default() -> Self {
        Self {
            scope: "atproto".to_string(),
            ui_locales: "en".to_string(),
        }
    }
}

/// A constructed OAuth client.
#[async_trait]
pub trait OAuthSubsystem: Send + Sync {
    /// Inspect `location` for a completed redirect and storage for a
    /// previous session. `Ok(None)` means the user is logged out.
    async fn resume_or_initiate(&self, location: &Url) -> Result<Option<OAuthSession>, OAuthError>;

    /// Build the URL the user agent must visit to authorize `handle`.
    async fn request_login_redirect(
        &self,
        handle: &str,
        options: &SignInOptions,
    ) -> Result<Url, OAuthError>;

    /// Forget the subject's session.
    async fn sign_out(&self, subject: &str) -> Result<(), OAuthError>;
}

/// Builds an OAuth client from fetched metadata.
pub trait OAuthProvider: Send + Sync {
    fn construct(
        &self,
        config: &ClientConfiguration,
        handle_resolver: &Url,
    ) -> Result<Box<dyn OAuthSubsystem>, OAuthError>;
}
