//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `LIVEGATE_LISTEN`, `LIVEGATE_DEBUG`,
//!    `LIVEGATE_LOG`
//! 2. **Config file**: path via `--config <path>`, or `livegate.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8000"
//! debug_mode = false
//! running_in_window = false
//! ping_interval_secs = 50
//! initial_message_timeout_secs = 60
//! gate_wait_timeout_secs = 30
//! max_upload_bytes = 104857600  # 100 MiB
//!
//! [sessions]
//! reaper_interval_secs = 900     # 15 min
//! session_lifetime_secs = 3600   # idle sessions older than this are closed
//! latent_lifetime_secs = 3600    # issued-but-never-connected tokens
//!
//! [uploads]
//! ttl_secs = 900
//! sweep_interval_secs = 60
//!
//! [app]
//! name = "Livegate"
//! description = "A live web app"
//! pages = ["/", "/about"]
//! not_found_page = "/"           # optional; omit to fail navigation instead
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub uploads: UploadsConfig,
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server and websocket admission settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8000`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Embedded into the index page; enables client-side diagnostics.
    #[serde(default)]
    pub debug_mode: bool,
    /// Local window mode. Disables the expiry reaper.
    #[serde(default)]
    pub running_in_window: bool,
    /// Client ping interval embedded into the index page (default 50 s).
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// How long a new socket may take to send its initial message (default 60 s).
    #[serde(default = "default_initial_message_timeout_secs")]
    pub initial_message_timeout_secs: u64,
    /// How long an upgrade waits on a closed admission gate before it is
    /// turned away with close code 3001 (default 30 s).
    #[serde(default = "default_gate_wait_timeout_secs")]
    pub gate_wait_timeout_secs: u64,
    /// Maximum request body for `PUT /rio/upload/{token}` (default 100 MiB).
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

/// Session lifetime and reaper settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionsConfig {
    /// Interval between reaper passes (default 15 min).
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
    /// Active sessions idle for longer than this are closed (default 60 min).
    #[serde(default = "default_session_lifetime_secs")]
    pub session_lifetime_secs: u64,
    /// Latent tokens never used to connect are dropped after this (default 60 min).
    #[serde(default = "default_latent_lifetime_secs")]
    pub latent_lifetime_secs: u64,
}

/// Pending upload settings.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadsConfig {
    /// Time an upload token stays valid (default 15 min).
    #[serde(default = "default_upload_ttl_secs")]
    pub ttl_secs: u64,
    /// Interval of the expired-upload sweep (default 60 s).
    #[serde(default = "default_upload_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Settings for the built-in page application.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Application name, used as the page title.
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Routable page paths. A request matches a page or any of its children.
    #[serde(default = "default_pages")]
    pub pages: Vec<String>,
    /// Where unmatched URLs are redirected. `None` fails navigation instead.
    pub not_found_page: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8000".to_string()
}
fn default_ping_interval_secs() -> u64 {
    50
}
fn default_initial_message_timeout_secs() -> u64 {
    60
}
fn default_gate_wait_timeout_secs() -> u64 {
    30
}
fn default_max_upload_bytes() -> usize {
    100 * 1024 * 1024
}
fn default_reaper_interval_secs() -> u64 {
    15 * 60
}
fn default_session_lifetime_secs() -> u64 {
    60 * 60
}
fn default_latent_lifetime_secs() -> u64 {
    60 * 60
}
fn default_upload_ttl_secs() -> u64 {
    15 * 60
}
fn default_upload_sweep_interval_secs() -> u64 {
    60
}
fn default_app_name() -> String {
    "Livegate".to_string()
}
fn default_pages() -> Vec<String> {
    vec!["/".to_string()]
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            debug_mode: false,
            running_in_window: false,
            ping_interval_secs: default_ping_interval_secs(),
            initial_message_timeout_secs: default_initial_message_timeout_secs(),
            gate_wait_timeout_secs: default_gate_wait_timeout_secs(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            reaper_interval_secs: default_reaper_interval_secs(),
            session_lifetime_secs: default_session_lifetime_secs(),
            latent_lifetime_secs: default_latent_lifetime_secs(),
        }
    }
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_upload_ttl_secs(),
            sweep_interval_secs: default_upload_sweep_interval_secs(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            description: String::new(),
            pages: default_pages(),
            not_found_page: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ServerConfig {
    pub fn initial_message_timeout(&self) -> Duration {
        Duration::from_secs(self.initial_message_timeout_secs)
    }

    pub fn gate_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.gate_wait_timeout_secs)
    }
}

impl SessionsConfig {
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn session_lifetime(&self) -> Duration {
        Duration::from_secs(self.session_lifetime_secs)
    }

    pub fn latent_lifetime(&self) -> Duration {
        Duration::from_secs(self.latent_lifetime_secs)
    }
}

impl UploadsConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist and parse. Otherwise looks for
    /// `livegate.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let mut config = if let Some(p) = path {
            Self::from_file(Path::new(p))?
        } else if Path::new("livegate.toml").exists() {
            Self::from_file(Path::new("livegate.toml"))?
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("LIVEGATE_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(debug) = std::env::var("LIVEGATE_DEBUG") {
            config.server.debug_mode = matches!(debug.as_str(), "1" | "true" | "yes");
        }
        if let Ok(level) = std::env::var("LIVEGATE_LOG") {
            config.logging.level = level;
        }

        Ok(config)
    }

    fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Parse a TOML document; missing sections fall back to defaults.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:8000");
        assert_eq!(config.server.initial_message_timeout(), Duration::from_secs(60));
        assert_eq!(config.sessions.reaper_interval(), Duration::from_secs(900));
        assert_eq!(config.sessions.session_lifetime(), Duration::from_secs(3600));
        assert_eq!(config.uploads.ttl(), Duration::from_secs(900));
        assert_eq!(config.app.pages, vec!["/".to_string()]);
        assert!(config.app.not_found_page.is_none());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [server]
            debug_mode = true

            [app]
            name = "Demo"
            pages = ["/", "/docs"]
            not_found_page = "/"
            "#,
        )
        .unwrap();
        assert!(config.server.debug_mode);
        assert_eq!(config.server.ping_interval_secs, 50);
        assert_eq!(config.app.name, "Demo");
        assert_eq!(config.app.pages.len(), 2);
        assert_eq!(config.app.not_found_page.as_deref(), Some("/"));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(Config::parse("[server\nlisten = ").is_err());
    }
}
