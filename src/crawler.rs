//! Socket-less rendering for search engine crawlers.
//!
//! Crawlers do not run the client script, so a page load by a crawler builds a
//! throwaway session immediately, captures everything the application would
//! have sent over the websocket and embeds it into the HTML.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::app::Application;
use crate::error::GateError;
use crate::sessions::session::{BootstrapKind, Session};
use crate::sessions::RequestMetadata;

/// Token placed in pages rendered for crawlers. It never matches a real
/// session, so a crawler that does open a socket is rejected.
pub const CRAWLER_TOKEN: &str = "<crawler>";

const CRAWLER_MARKERS: &[&str] = &[
    "bot",
    "crawl",
    "spider",
    "slurp",
    "facebookexternalhit",
    "embedly",
    "bingpreview",
    "mediapartners",
    "lighthouse",
    "headlesschrome",
    "archiver",
    "preview",
];

/// Heuristic user agent check for well-known crawlers and link unfurlers.
pub fn is_crawler(user_agent: &str) -> bool {
    let ua = user_agent.to_ascii_lowercase();
    CRAWLER_MARKERS.iter().any(|marker| ua.contains(marker))
}

/// What the index route should answer to a crawler.
#[derive(Debug, PartialEq)]
pub enum CrawlerOutcome {
    /// Render the page with these messages embedded.
    Page(Vec<Value>),
    /// Navigation landed elsewhere; redirect the crawler there.
    Redirect(String),
}

/// Build a capture-only session for `request`, bootstrap it and close it.
pub async fn serve_crawler(
    app: Arc<dyn Application>,
    request: RequestMetadata,
) -> Result<CrawlerOutcome, GateError> {
    let requested = request.path().to_string();
    let landed = app.navigate(&requested).await?;

    let session = Session::capturing(CRAWLER_TOKEN.to_string(), request, app);
    session.set_active_url(landed.clone()).await;
    session.bootstrap_now(BootstrapKind::Initial).await;
    let messages = session.take_captured().await;

    if let Err(e) = session.close(false).await {
        warn!("Crawler session close failed: {e}");
    }

    if landed != requested {
        debug!("Crawler redirected from {requested} to {landed}");
        return Ok(CrawlerOutcome::Redirect(landed));
    }
    Ok(CrawlerOutcome::Page(messages))
}
