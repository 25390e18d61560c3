//! The single-page index served for every non-API path.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::response::{Html, IntoResponse, Redirect, Response};
use serde_json::Value;
use tracing::debug;

use crate::crawler::{is_crawler, serve_crawler, CrawlerOutcome, CRAWLER_TOKEN};
use crate::sessions::RequestMetadata;
use crate::util::{escape_html, token_prefix};
use crate::AppState;

const INDEX_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>{title}</title>
<meta name="{meta}" />
<script>
    globalThis.SESSION_TOKEN = "{session_token}";
    globalThis.PING_PONG_INTERVAL_SECONDS = '{ping_pong_interval}';
    globalThis.RIO_DEBUG_MODE = '{debug_mode}';
    globalThis.RUNNING_IN_WINDOW = '{running_in_window}';
    globalThis.INITIAL_MESSAGES = '{initial_messages}';
</script>
</head>
<body>
<noscript>This app requires JavaScript.</noscript>
</body>
</html>
"#;

/// Values substituted into the index template.
pub struct IndexPage<'a> {
    pub session_token: &'a str,
    pub ping_interval_secs: u64,
    pub debug_mode: bool,
    pub running_in_window: bool,
    pub initial_messages: &'a [Value],
    pub title: &'a str,
    pub description: &'a str,
}

impl IndexPage<'_> {
    pub fn render(&self) -> String {
        // Serialized values can't fail; fall back to an empty list regardless.
        let messages = serde_json::to_string(self.initial_messages)
            .unwrap_or_else(|_| "[]".to_string())
            .replace("</", "<\\/");

        // Escaped text can't contain the quoted placeholders. The messages go in
        // last so nothing rewrites them afterwards.
        INDEX_TEMPLATE
            .replace("{session_token}", self.session_token)
            .replace("'{ping_pong_interval}'", &self.ping_interval_secs.to_string())
            .replace("'{debug_mode}'", bool_literal(self.debug_mode))
            .replace("'{running_in_window}'", bool_literal(self.running_in_window))
            .replace("{title}", &escape_html(self.title))
            .replace(r#"<meta name="{meta}" />"#, &self.meta_tags())
            .replace("'{initial_messages}'", &messages)
    }

    fn meta_tags(&self) -> String {
        [
            ("og:title", self.title),
            ("description", self.description),
            ("og:description", self.description),
            ("viewport", "width=device-width, initial-scale=1"),
        ]
        .iter()
        .map(|(name, content)| {
            format!(
                r#"<meta name="{}" content="{}">"#,
                escape_html(name),
                escape_html(content)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
    }
}

fn bool_literal(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// `GET /` and `GET /{*path}`: serve the index page.
///
/// Regular clients get a fresh latent session token. Crawlers get a page
/// with the session's initial messages already embedded, or a redirect if
/// navigation landed on a different page.
pub async fn index(State(state): State<AppState>, req: Request) -> Response {
    let client_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let meta = RequestMetadata::from_parts(req.uri(), req.headers(), client_addr);
    let server = &state.config.server;

    let (token, messages) = if is_crawler(meta.user_agent()) {
        debug!("Serving crawler {:?} for {}", meta.user_agent(), meta.url);
        match serve_crawler(state.app.clone(), meta).await {
            Ok(CrawlerOutcome::Page(messages)) => (CRAWLER_TOKEN.to_string(), messages),
            Ok(CrawlerOutcome::Redirect(target)) => {
                return Redirect::temporary(&target).into_response();
            }
            Err(e) => return e.into_response(),
        }
    } else {
        let token = state.registry.issue_latent(meta).await;
        debug!(token = token_prefix(&token), "Issued latent session token");
        (token, Vec::new())
    };

    Html(
        IndexPage {
            session_token: &token,
            ping_interval_secs: server.ping_interval_secs,
            debug_mode: server.debug_mode,
            running_in_window: server.running_in_window,
            initial_messages: &messages,
            title: state.app.name(),
            description: state.app.description(),
        }
        .render(),
    )
    .into_response()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{header, Request as HttpRequest, StatusCode};
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::app::StaticPages;
    use crate::config::{AppConfig, Config};

    fn state(not_found: Option<&str>) -> AppState {
        let config = Config {
            app: AppConfig {
                name: "Demo <App>".to_string(),
                pages: vec!["/".to_string(), "/docs".to_string()],
                not_found_page: not_found.map(str::to_string),
                ..AppConfig::default()
            },
            ..Config::default()
        };
        let app = Arc::new(StaticPages::from_config(&config.app));
        AppState::new(config, app)
    }

    async fn body_text(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn render_fills_every_placeholder() {
        let messages = vec![json!({"html": "</script>"})];
        let html = IndexPage {
            session_token: "tok123",
            ping_interval_secs: 50,
            debug_mode: true,
            running_in_window: false,
            initial_messages: &messages,
            title: "{debug_mode} & co",
            description: "Desc",
        }
        .render();
        assert!(html.contains(r#"SESSION_TOKEN = "tok123""#));
        assert!(html.contains("PING_PONG_INTERVAL_SECONDS = 50;"));
        assert!(html.contains("RIO_DEBUG_MODE = true;"));
        assert!(html.contains("RUNNING_IN_WINDOW = false;"));
        assert!(html.contains(r#"<\/script>"#));
        // Escaping keeps the title's braces from matching a quoted placeholder.
        assert!(html.contains("<title>{debug_mode} &amp; co</title>"));
        assert!(html.contains(r#"<meta name="description" content="Desc">"#));
        assert!(!html.contains("{meta}"));
    }

    #[test]
    fn embedded_messages_keep_placeholder_text() {
        let messages = vec![json!({"text": "literal {title} and {meta} in a component"})];
        let html = IndexPage {
            session_token: "tok",
            ping_interval_secs: 50,
            debug_mode: false,
            running_in_window: false,
            initial_messages: &messages,
            title: "MyApp",
            description: "",
        }
        .render();
        assert!(html.contains(
            r#"INITIAL_MESSAGES = [{"text":"literal {title} and {meta} in a component"}];"#
        ));
        assert!(html.contains("<title>MyApp</title>"));
    }

    #[tokio::test]
    async fn browser_request_issues_latent_token() {
        let state = state(None);
        let app = crate::server::router(state.clone());
        let req = HttpRequest::builder()
            .uri("/docs")
            .header(header::USER_AGENT, "Mozilla/5.0 (X11; Linux x86_64) Firefox/128.0")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let html = body_text(resp).await;
        assert!(html.contains("<title>Demo &lt;App&gt;</title>"));
        assert!(html.contains("INITIAL_MESSAGES = [];"));
        assert_eq!(state.registry.latent_count().await, 1);
    }

    #[tokio::test]
    async fn crawler_gets_embedded_state_and_no_token() {
        let state = state(None);
        let app = crate::server::router(state.clone());
        let req = HttpRequest::builder()
            .uri("/docs")
            .header(header::USER_AGENT, "Googlebot/2.1")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let html = body_text(resp).await;
        assert!(html.contains(r#"SESSION_TOKEN = "<crawler>""#));
        assert!(html.contains(r#""type":"fullState""#));
        assert!(html.contains(r#""page":"/docs""#));
        assert_eq!(state.registry.latent_count().await, 0);
        assert_eq!(state.registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn crawler_is_redirected_to_landed_page() {
        let app = crate::server::router(state(Some("/")));
        let req = HttpRequest::builder()
            .uri("/nowhere")
            .header(header::USER_AGENT, "bingbot/2.0")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(resp.headers()[header::LOCATION], "/");
    }

    #[tokio::test]
    async fn crawler_navigation_failure_is_a_server_error() {
        let app = crate::server::router(state(None));
        let req = HttpRequest::builder()
            .uri("/nowhere")
            .header(header::USER_AGENT, "Googlebot/2.1")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
