//! Page surfaces for the terminal and the web server

use sandbox_session::view::escape_html;
use sandbox_session::{Page, UserInfo, ViewState};
use std::sync::{Arc, Mutex, MutexGuard};
use url::Url;

/// Prints each view change to stdout.
#[derive(Default)]
pub struct TerminalPage {
    last_status: Option<String>,
}

impl Page for TerminalPage {
    fn render(&mut self, view: &ViewState) {
        if self.last_status.as_deref() != Some(view.status.as_str()) {
            println!("{}", view.status);
            self.last_status = Some(view.status.clone());
        }
        if !matches!(view.user_info, UserInfo::Empty) {
            println!("  {}", view.user_info.to_text());
        }
    }

    fn alert(&mut self, message: &str) {
        eprintln!("! {}", message);
    }

    fn navigate(&mut self, url: &Url) {
        println!("Open this URL to continue:");
        println!("  {}", url);
    }
}

/// What one page load produced.
#[derive(Debug, Clone, Default)]
pub struct PageSnapshot {
    pub view: ViewState,
    pub alerts: Vec<String>,
    pub redirect: Option<Url>,
}

/// Collects view changes so a handler can answer with the final page.
#[derive(Clone, Default)]
pub struct HtmlPage {
    inner: Arc<Mutex<PageSnapshot>>,
}

impl HtmlPage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PageSnapshot> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn snapshot(&self) -> PageSnapshot {
        self.lock().clone()
    }
}

impl Page for HtmlPage {
    fn render(&mut self, view: &ViewState) {
        self.lock().view = view.clone();
    }

    fn alert(&mut self, message: &str) {
        self.lock().alerts.push(message.to_string());
    }

    fn navigate(&mut self, url: &Url) {
        self.lock().redirect = Some(url.clone());
    }
}

/// Full HTML document for `snapshot`.
pub fn render_document(snapshot: &PageSnapshot) -> String {
    let view = &snapshot.view;

    let alerts: String = snapshot
        .alerts
        .iter()
        .map(|a| format!(r#"<p class="alert">{}</p>"#, escape_html(a)))
        .collect();

    let login = if view.login_visible {
        r#"<form id="login" method="post" action="/login">
            <input type="text" name="handle" placeholder="will.bsky.social">
            <button type="submit">Log in</button>
        </form>"#
    } else {
        ""
    };

    let game = if view.game_visible {
        r#"<div id="game">
            <form method="post" action="/logout"><button type="submit">Log out</button></form>
        </div>"#
    } else {
        ""
    };

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>ATProto Sandbox</title>
    <style>
        body {{
            font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Roboto, Helvetica, Arial, sans-serif;
            display: flex;
            justify-content: center;
            margin: 0;
            padding-top: 80px;
            background-color: #f5f5f5;
        }}
        .container {{
            background: white;
            padding: 40px;
            border-radius: 8px;
            box-shadow: 0 2px 10px rgba(0,0,0,0.1);
        }}
        .alert {{
            color: #b91c1c;
        }}
        #user-info img {{
            border-radius: 50%;
            vertical-align: middle;
            margin-right: 8px;
        }}
    </style>
</head>
<body>
    <div class="container">
        <p id="status">{status}</p>
        {alerts}
        <div id="user-info">{user_info}</div>
        {login}
        {game}
    </div>
</body>
</html>"#,
        status = escape_html(&view.status),
        alerts = alerts,
        user_info = view.user_info.to_html(),
        login = login,
        game = game,
    )
}
