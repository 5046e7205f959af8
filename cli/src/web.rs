//! `sandbox serve`: the sandbox page over HTTP
//!
//! Every request is a fresh page load: a new controller bootstraps against
//! the request URL and the final view is rendered as HTML.

use axum::{
    Form, Router,
    extract::{OriginalUri, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
};
use sandbox_session::{Collaborators, ControllerSettings, SessionController};
use serde::Deserialize;
use std::sync::Arc;
use url::Url;

use crate::page::{HtmlPage, render_document};

pub struct WebState {
    pub settings: ControllerSettings,
    pub collaborators: Collaborators,
    pub page_url: Url,
}

impl WebState {
    fn page_load(&self) -> (SessionController, HtmlPage) {
        let page = HtmlPage::new();
        let controller = SessionController::new(
            self.settings.clone(),
            self.collaborators.clone(),
            Box::new(page.clone()),
        );
        (controller, page)
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub handle: String,
}

pub fn router(state: Arc<WebState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/login", post(login_handler))
        .route("/logout", post(logout_handler))
        .with_state(state)
}

fn page_response(status: StatusCode, page: &HtmlPage) -> Response {
    (status, Html(render_document(&page.snapshot()))).into_response()
}

/// Handler for the page itself, including the OAuth redirect back to it
pub async fn index_handler(
    State(state): State<Arc<WebState>>,
    OriginalUri(uri): OriginalUri,
) -> Response {
    let location = match state.page_url.join(&uri.to_string()) {
        Ok(location) => location,
        Err(err) => {
            tracing::warn!("Rejected request URI {}: {}", uri, err);
            return (StatusCode::BAD_REQUEST, "Invalid request URI").into_response();
        }
    };

    let (mut controller, page) = state.page_load();
    match controller.bootstrap(&location).await {
        // Drop the code and state from the address bar once they are spent.
        Ok(()) if location.query().is_some() && controller.is_authenticated() => {
            Redirect::to("/").into_response()
        }
        Ok(()) => page_response(StatusCode::OK, &page),
        Err(_) => page_response(StatusCode::INTERNAL_SERVER_ERROR, &page),
    }
}

/// Handler for the login form
pub async fn login_handler(
    State(state): State<Arc<WebState>>,
    Form(form): Form<LoginForm>,
) -> Response {
    let (mut controller, page) = state.page_load();
    if controller.bootstrap(&state.page_url).await.is_err() {
        return page_response(StatusCode::INTERNAL_SERVER_ERROR, &page);
    }

    match controller.login(&form.handle).await {
        Ok(Some(url)) => Redirect::to(url.as_str()).into_response(),
        Ok(None) => page_response(StatusCode::OK, &page),
        Err(_) => page_response(StatusCode::BAD_GATEWAY, &page),
    }
}

/// Handler for logout
pub async fn logout_handler(State(state): State<Arc<WebState>>) -> Response {
    let (mut controller, page) = state.page_load();
    if controller.bootstrap(&state.page_url).await.is_err() {
        return page_response(StatusCode::INTERNAL_SERVER_ERROR, &page);
    }

    match controller.logout().await {
        Ok(()) => Redirect::to("/").into_response(),
        Err(err) => {
            tracing::error!("Failed to logout: {}", err);
            page_response(StatusCode::INTERNAL_SERVER_ERROR, &page)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_session::test_helpers::{
        FactoryMode, FakeAgentFactory, FakeOAuth, FakeService, StaticMetadata,
        client_configuration, session_for,
    };
    use sandbox_session::ProfileRecord;

    const WILL: &str = "did:plc:will";

    async fn serve(oauth: FakeOAuth, service: FakeService) -> String {
        let state = Arc::new(WebState {
            settings: ControllerSettings::default(),
            collaborators: Collaborators {
                metadata: Arc::new(StaticMetadata::ok(client_configuration())),
                oauth: Arc::new(oauth),
                agents: Arc::new(FakeAgentFactory::new(service, FactoryMode::SessionAware)),
            },
            page_url: Url::parse("http://127.0.0.1/").unwrap(),
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_logged_out_page_offers_login() {
        let base = serve(FakeOAuth::new(), FakeService::new()).await;

        let response = client().get(&base).send().await.unwrap();

        assert_eq!(response.status(), 200);
        let body = response.text().await.unwrap();
        assert!(body.contains("Please log in to continue."));
        assert!(body.contains(r#"<form id="login""#));
    }

    #[tokio::test]
    async fn test_resumed_session_renders_profile() {
        let service = FakeService::new().with_profile(ProfileRecord {
            did: WILL.to_string(),
            handle: "will.test".to_string(),
            display_name: Some("Will".to_string()),
            avatar: None,
            description: None,
        });
        let base = serve(FakeOAuth::new().with_session(session_for(WILL)), service).await;

        let body = client().get(&base).send().await.unwrap().text().await.unwrap();

        assert!(body.contains("<strong>Will</strong>"));
        assert!(body.contains("https://via.placeholder.com/50"));
        assert!(body.contains(r#"<div id="game">"#));
    }

    #[tokio::test]
    async fn test_login_redirects_to_authorization() {
        let oauth = FakeOAuth::new();
        let base = serve(oauth.clone(), FakeService::new()).await;

        let response = client()
            .post(format!("{}/login", base))
            .form(&[("handle", "will.test")])
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 303);
        let location = response.headers()["location"].to_str().unwrap().to_string();
        assert!(location.starts_with("https://auth.sandbox.test/oauth/authorize"));
        assert_eq!(oauth.login_requests()[0].0, "will.test");
    }

    #[tokio::test]
    async fn test_blank_login_prompts_for_handle() {
        let base = serve(FakeOAuth::new(), FakeService::new()).await;

        let response = client()
            .post(format!("{}/login", base))
            .form(&[("handle", "  ")])
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        let body = response.text().await.unwrap();
        assert!(body.contains("Enter your handle"));
    }

    #[tokio::test]
    async fn test_logout_signs_out_and_redirects() {
        let oauth = FakeOAuth::new().with_session(session_for(WILL));
        let base = serve(oauth.clone(), FakeService::new()).await;

        let response = client()
            .post(format!("{}/logout", base))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 303);
        assert_eq!(oauth.signed_out(), vec![WILL.to_string()]);
    }
}
