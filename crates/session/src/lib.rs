//! Session bootstrap for an ATProto OAuth sandbox page
//!
//! The controller loads the OAuth client metadata, resumes or starts an OAuth
//! session, builds an authenticated agent from it and issues a fixed set of
//! calls. The OAuth and service subsystems, and the page itself, sit behind
//! traits so the flow runs the same in a terminal, a web page or a test.

pub mod agent;
pub mod controller;
pub mod error;
pub mod metadata;
pub mod oauth;
pub mod session;
pub mod view;

pub mod test_helpers;

pub use agent::{
    AgentFactory, AuthenticatedHandle, PostAuthor, PostView, ProfileRecord, RecordRef,
    ServiceAgent, StoredRecord, construct_handle,
};
pub use controller::{Collaborators, ControllerSettings, SessionController};
pub use error::{BootstrapError, OAuthError, ServiceError};
pub use metadata::{ClientConfiguration, HttpMetadataSource, MetadataSource};
pub use oauth::{OAuthProvider, OAuthSubsystem, SignInOptions};
pub use session::{DpopBinding, OAuthSession, TokenSet, unix_now};
pub use view::{ControllerState, Event, Page, Phase, ProfileView, UserInfo, ViewState};
