//! ATProto implementations of the session bootstrap seams
//!
//! `AtProtoOAuthProvider` builds the OAuth client (identity resolution,
//! PAR, PKCE, DPoP, SQLite-backed flow and session storage) and
//! `XrpcAgentFactory` builds DPoP-signed XRPC agents from its sessions.

pub mod agent;
pub mod client;
pub mod dpop;
pub mod resolve;
pub mod store;

pub use agent::{BSKY_APPVIEW_PROXY, XrpcAgent, XrpcAgentFactory};
pub use client::{AtProtoOAuthClient, AtProtoOAuthProvider, CallbackParams, FLOW_MAX_AGE_SECS};
pub use dpop::DpopKey;
pub use resolve::{IdentityResolver, LoginIdentifier, ServerMetadata};
pub use store::{AuthFlowRecord, SqliteAuthStore};
