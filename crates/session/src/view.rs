//! Page state and rendering
//!
//! `ControllerState::apply` is a pure transition from one page state to the
//! next. Rendering is a separate step: the controller hands the resulting
//! `ViewState` to a `Page`.

use url::Url;

use crate::agent::ProfileRecord;

/// Image shown when a profile has no avatar.
pub const PLACEHOLDER_AVATAR_URL: &str = "https://via.placeholder.com/50";

pub const STATUS_INITIALIZING: &str = "Initializing...";
pub const STATUS_LOADING_CONFIG: &str = "Loading client configuration...";
pub const STATUS_AWAITING_SESSION: &str = "Checking for an existing session...";
pub const STATUS_LOGGED_OUT: &str = "Please log in to continue.";
pub const PROFILE_LOADING: &str = "Fetching your profile...";

/// Bootstrap progress.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    LoadingConfig,
    AwaitingSession,
    LoggedOut,
    SessionResumed,
    AgentReady,
    ProfileLoaded,
    Error(String),
}

impl Phase {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Phase::AgentReady | Phase::ProfileLoaded)
    }
}

/// What the profile block shows.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileView {
    pub display_name: String,
    pub handle: String,
    pub avatar_url: String,
}

impl From<&ProfileRecord> for ProfileView {
    fn from(profile: &ProfileRecord) -> Self {
        let display_name = profile
            .display_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(&profile.handle)
            .to_string();

        Self {
            display_name,
            handle: profile.handle.clone(),
            avatar_url: profile
                .avatar
                .clone()
                .filter(|url| !url.is_empty())
                .unwrap_or_else(|| PLACEHOLDER_AVATAR_URL.to_string()),
        }
    }
}

/// Contents of the user-info element.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum UserInfo {
    #[default]
    Empty,
    Loading,
    Profile(ProfileView),
    Failed(String),
}

impl UserInfo {
    /// Markup for the user-info element.
    pub fn to_html(&self) -> String {
        match self {
            UserInfo::Empty => String::new(),
            UserInfo::Loading => escape_html(PROFILE_LOADING),
            UserInfo::Profile(profile) => format!(
                r#"<img src="{}" style="width:50px; border-radius:50%; vertical-align:middle; margin-right:10px;"><strong>{}</strong>"#,
                escape_html(&profile.avatar_url),
                escape_html(&profile.display_name)
            ),
            UserInfo::Failed(message) => escape_html(message),
        }
    }

    /// Plain text for terminal output.
    pub fn to_text(&self) -> String {
        match self {
            UserInfo::Empty => String::new(),
            UserInfo::Loading => PROFILE_LOADING.to_string(),
            UserInfo::Profile(profile) => format!(
                "{} (@{})  avatar: {}",
                profile.display_name, profile.handle, profile.avatar_url
            ),
            UserInfo::Failed(message) => message.clone(),
        }
    }
}

/// Everything the page surface displays.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewState {
    pub status: String,
    pub login_visible: bool,
    pub game_visible: bool,
    pub user_info: UserInfo,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            status: STATUS_INITIALIZING.to_string(),
            login_visible: true,
            game_visible: false,
            user_info: UserInfo::Empty,
        }
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ConfigRequested,
    ConfigLoaded,
    NoSession,
    SessionRecovered { subject: String },
    AgentReady,
    ProfileLoaded(ProfileView),
    ProfileFailed(String),
    SignedOut,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ControllerState {
    pub phase: Phase,
    pub view: ViewState,
}

impl ControllerState {
    /// Next state after `event`. Events that make no sense in the current
    /// phase leave the state unchanged; `Error` absorbs everything.
    pub fn apply(&self, event: Event) -> ControllerState {
        use Phase::*;

        let mut next = self.clone();
        match (&self.phase, event) {
            (Error(_), _) => return next,
            (_, Event::Failed(message)) => {
                next.view.status = format!("Error: {}", message);
                next.phase = Error(message);
            }
            (Idle | LoggedOut, Event::ConfigRequested) => {
                next.phase = LoadingConfig;
                next.view.status = STATUS_LOADING_CONFIG.to_string();
            }
            (LoadingConfig, Event::ConfigLoaded) => {
                next.phase = AwaitingSession;
                next.view.status = STATUS_AWAITING_SESSION.to_string();
            }
            (AwaitingSession, Event::NoSession)
            | (SessionResumed | AgentReady | ProfileLoaded, Event::SignedOut) => {
                next.phase = LoggedOut;
                next.view = ViewState {
                    status: STATUS_LOGGED_OUT.to_string(),
                    login_visible: true,
                    game_visible: false,
                    user_info: UserInfo::Empty,
                };
            }
            (AwaitingSession, Event::SessionRecovered { subject }) => {
                next.phase = SessionResumed;
                next.view.status = format!("Signed in as {}", subject);
            }
            (SessionResumed | AgentReady | ProfileLoaded, Event::AgentReady) => {
                next.phase = AgentReady;
                next.view.login_visible = false;
                next.view.game_visible = true;
                next.view.user_info = UserInfo::Loading;
            }
            (AgentReady | ProfileLoaded, Event::ProfileLoaded(profile)) => {
                next.phase = ProfileLoaded;
                next.view.user_info = UserInfo::Profile(profile);
            }
            (AgentReady | ProfileLoaded, Event::ProfileFailed(message)) => {
                next.view.user_info = UserInfo::Failed(message);
            }
            (phase, event) => {
                tracing::debug!("Ignoring {:?} in phase {:?}", event, phase);
            }
        }
        next
    }
}

/// The surface the controller draws on.
pub trait Page: Send + Sync {
    fn render(&mut self, view: &ViewState);

    fn alert(&mut self, message: &str);

    /// Leave the page for `url`. Ends the current page lifecycle.
    fn navigate(&mut self, url: &Url);
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(display_name: Option<&str>, avatar: Option<&str>) -> ProfileRecord {
        ProfileRecord {
            did: "did:plc:will".to_string(),
            handle: "will.test".to_string(),
            display_name: display_name.map(str::to_string),
            avatar: avatar.map(str::to_string),
            description: None,
        }
    }

    fn drive(events: Vec<Event>) -> ControllerState {
        events
            .into_iter()
            .fold(ControllerState::default(), |state, event| state.apply(event))
    }

    #[test]
    fn test_profile_view_fallbacks() {
        let view = ProfileView::from(&profile(None, None));
        assert_eq!(view.display_name, "will.test");
        assert_eq!(view.avatar_url, PLACEHOLDER_AVATAR_URL);

        let view = ProfileView::from(&profile(Some("  "), Some("")));
        assert_eq!(view.display_name, "will.test");
        assert_eq!(view.avatar_url, PLACEHOLDER_AVATAR_URL);

        let view = ProfileView::from(&profile(Some("Will"), Some("https://cdn.example/a.jpg")));
        assert_eq!(view.display_name, "Will");
        assert_eq!(view.avatar_url, "https://cdn.example/a.jpg");
    }

    #[test]
    fn test_logged_out_flow() {
        let state = drive(vec![
            Event::ConfigRequested,
            Event::ConfigLoaded,
            Event::NoSession,
        ]);
        assert_eq!(state.phase, Phase::LoggedOut);
        assert_eq!(state.view.status, STATUS_LOGGED_OUT);
        assert!(state.view.login_visible);
        assert!(!state.view.game_visible);
    }

    #[test]
    fn test_authenticated_flow() {
        let state = drive(vec![
            Event::ConfigRequested,
            Event::ConfigLoaded,
            Event::SessionRecovered {
                subject: "did:plc:will".to_string(),
            },
            Event::AgentReady,
        ]);
        assert_eq!(state.phase, Phase::AgentReady);
        assert!(!state.view.login_visible);
        assert!(state.view.game_visible);
        assert_eq!(state.view.user_info, UserInfo::Loading);

        let loaded = state.apply(Event::ProfileLoaded(ProfileView::from(&profile(
            Some("Will"),
            None,
        ))));
        assert_eq!(loaded.phase, Phase::ProfileLoaded);
        assert!(loaded.phase.is_authenticated());
    }

    #[test]
    fn test_profile_failure_keeps_game_visible() {
        let state = drive(vec![
            Event::ConfigRequested,
            Event::ConfigLoaded,
            Event::SessionRecovered {
                subject: "did:plc:will".to_string(),
            },
            Event::AgentReady,
            Event::ProfileFailed("Profile not found".to_string()),
        ]);
        assert_eq!(state.phase, Phase::AgentReady);
        assert!(state.view.game_visible);
        assert_eq!(
            state.view.user_info,
            UserInfo::Failed("Profile not found".to_string())
        );
    }

    #[test]
    fn test_error_is_terminal() {
        let state = drive(vec![
            Event::ConfigRequested,
            Event::Failed("HTTP status 500".to_string()),
            Event::ConfigLoaded,
            Event::NoSession,
        ]);
        assert_eq!(state.phase, Phase::Error("HTTP status 500".to_string()));
        assert_eq!(state.view.status, "Error: HTTP status 500");
    }

    #[test]
    fn test_out_of_order_events_are_ignored() {
        let state = ControllerState::default().apply(Event::AgentReady);
        assert_eq!(state, ControllerState::default());

        let state = drive(vec![Event::ConfigRequested, Event::NoSession]);
        assert_eq!(state.phase, Phase::LoadingConfig);
    }

    #[test]
    fn test_sign_out_returns_to_login() {
        let state = drive(vec![
            Event::ConfigRequested,
            Event::ConfigLoaded,
            Event::SessionRecovered {
                subject: "did:plc:will".to_string(),
            },
            Event::AgentReady,
            Event::SignedOut,
        ]);
        assert_eq!(state.phase, Phase::LoggedOut);
        assert!(state.view.login_visible);
        assert_eq!(state.view.user_info, UserInfo::Empty);
    }

    #[test]
    fn test_profile_html_is_escaped() {
        let info = UserInfo::Profile(ProfileView {
            display_name: "<script>alert(1)</script>".to_string(),
            handle: "x.test".to_string(),
            avatar_url: PLACEHOLDER_AVATAR_URL.to_string(),
        });
        let html = info.to_html();
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains(PLACEHOLDER_AVATAR_URL));
        assert!(!html.contains("<script>"));
    }
}
