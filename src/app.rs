//! Application seam: the component tree behind every session.
//!
//! The connection layer knows nothing about pages or widgets. It asks the
//! [`Application`] to resolve a navigation target, to produce the full state
//! for a freshly (re)connected client, and to handle inbound messages. The
//! lifecycle hooks run once per process (`on_app_start`, `on_app_close`) or
//! once per session (`on_session_close`).
//!
//! [`StaticPages`] is the built-in implementation driven by the `[app]` config
//! section.

use std::future::Future;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::config::AppConfig;
use crate::error::GateError;
use crate::sessions::session::Session;

#[async_trait]
pub trait Application: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Resolve the page a client asked for. Returns the path the session
    /// actually lands on, which may differ after a redirect.
    async fn navigate(&self, path: &str) -> Result<String, GateError>;

    /// Messages that fully describe the session's current state.
    async fn full_state(&self, session: &Session) -> Vec<Value>;

    async fn on_message(&self, session: &Session, message: Value) -> anyhow::Result<()>;

    async fn on_app_start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_app_close(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_session_close(&self, _session: &Session) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Await a user hook, logging and swallowing its failure.
pub async fn run_hook<F>(name: &str, hook: F) -> bool
where
    F: Future<Output = anyhow::Result<()>>,
{
    match hook.await {
        Ok(()) => true,
        Err(e) => {
            error!("Application hook `{name}` failed: {e:?}");
            false
        }
    }
}

/// Page router over a fixed list of paths.
pub struct StaticPages {
    name: String,
    description: String,
    pages: Vec<String>,
    not_found_page: Option<String>,
}

impl StaticPages {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            name: config.name.clone(),
            description: config.description.clone(),
            pages: config.pages.iter().map(|p| normalize(p)).collect(),
            not_found_page: config.not_found_page.as_deref().map(normalize),
        }
    }

    fn matches(&self, path: &str) -> bool {
        self.pages.iter().any(|page| {
            if page == "/" {
                path == "/"
            } else {
                path == page
                    || path
                        .strip_prefix(page.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            }
        })
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

#[async_trait]
impl Application for StaticPages {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn navigate(&self, path: &str) -> Result<String, GateError> {
        let path = normalize(path);
        if self.matches(&path) {
            return Ok(path);
        }
        match &self.not_found_page {
            Some(fallback) => Ok(fallback.clone()),
            None => Err(GateError::NavigationFailed(path)),
        }
    }

    async fn full_state(&self, session: &Session) -> Vec<Value> {
        vec![json!({
            "type": "fullState",
            "page": session.active_url().await,
            "title": self.name,
        })]
    }

    async fn on_message(&self, session: &Session, message: Value) -> anyhow::Result<()> {
        match message.get("type").and_then(Value::as_str) {
            Some("ping") => {
                session.send(json!({"type": "pong"})).await;
            }
            Some("navigate") => {
                let target = message
                    .get("url")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow::anyhow!("navigate message without url"))?;
                let landed = self.navigate(target).await?;
                session.set_active_url(landed).await;
                for state in self.full_state(session).await {
                    session.send(state).await;
                }
            }
            other => {
                info!("Ignoring client message of type {other:?}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording application used by unit tests across the crate.

    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct RecordingApp {
        received: Mutex<Vec<Value>>,
        closed: AtomicUsize,
        fail_close: bool,
    }

    impl RecordingApp {
        pub fn failing_close() -> Self {
            Self {
                fail_close: true,
                ..Self::default()
            }
        }

        pub async fn received(&self) -> Vec<Value> {
            self.received.lock().await.clone()
        }

        pub fn closed_sessions(&self) -> usize {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Application for RecordingApp {
        fn name(&self) -> &str {
            "recording"
        }

        async fn navigate(&self, path: &str) -> Result<String, GateError> {
            if path == "/broken" {
                Err(GateError::NavigationFailed(path.to_string()))
            } else {
                Ok(path.to_string())
            }
        }

        async fn full_state(&self, session: &Session) -> Vec<Value> {
            vec![json!({"type": "fullState", "page": session.active_url().await})]
        }

        async fn on_message(&self, _session: &Session, message: Value) -> anyhow::Result<()> {
            self.received.lock().await.push(message);
            Ok(())
        }

        async fn on_session_close(&self, _session: &Session) -> anyhow::Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                anyhow::bail!("close hook exploded");
            }
            Ok(())
        }
    }
}
