//! OAuth session material
//!
//! An `OAuthSession` is everything needed to issue DPoP-bound calls on
//! behalf of one account: the subject DID, where its repository lives, the
//! token set and the key the tokens are bound to.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Tokens issued by the authorization server.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenSet {
    pub access_token: String,
    /// Always `DPoP` for ATProto.
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Expiry as unix seconds.
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl TokenSet {
    /// Whether the access token is expired at `now` (unix seconds), with a
    /// small margin so a token is not used in its final seconds.
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|exp| exp - 30 <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(unix_now())
    }
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"[redacted]")
            .field("token_type", &self.token_type)
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[redacted]"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// DPoP key the tokens are bound to.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct DpopBinding {
    /// P-256 private key, PKCS#8 DER.
    pub pkcs8: Vec<u8>,
    /// Public JWK as JSON.
    pub jwk: String,
    /// Last nonce the resource server handed out.
    #[serde(default)]
    pub nonce: Option<String>,
}

impl fmt::Debug for DpopBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DpopBinding")
            .field("pkcs8", &"[redacted]")
            .field("jwk", &self.jwk)
            .field("nonce", &self.nonce)
            .finish()
    }
}

/// An authorized session for one account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OAuthSession {
    /// Subject DID.
    pub sub: String,
    /// PDS origin serving the subject's repository.
    pub aud: String,
    /// Authorization server issuer.
    pub iss: String,
    pub scope: String,
    pub tokens: TokenSet,
    pub dpop: DpopBinding,
}

/// Current time as unix seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(expires_at: Option<i64>) -> TokenSet {
        TokenSet {
            access_token: "secret-access".to_string(),
            token_type: "DPoP".to_string(),
            refresh_token: Some("secret-refresh".to_string()),
            expires_at,
        }
    }

    #[test]
    fn test_expiry_margin() {
        assert!(!tokens(None).is_expired_at(1_000));
        assert!(!tokens(Some(1_100)).is_expired_at(1_000));
        assert!(tokens(Some(1_020)).is_expired_at(1_000));
        assert!(tokens(Some(900)).is_expired_at(1_000));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let session = OAuthSession {
            sub: "did:plc:abc".to_string(),
            aud: "https://pds.example.com".to_string(),
            iss: "https://bsky.social".to_string(),
            scope: "atproto".to_string(),
            tokens: tokens(None),
            dpop: DpopBinding {
                pkcs8: vec![1, 2, 3],
                jwk: "{}".to_string(),
                nonce: None,
            },
        };

        let debug = format!("{:?}", session);
        assert!(debug.contains("did:plc:abc"));
        assert!(!debug.contains("secret-access"));
        assert!(!debug.contains("secret-refresh"));
        assert!(!debug.contains("[1, 2, 3]"));
    }
}
