//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::app::Application;
use crate::assets::AssetHost;
use crate::config::Config;
use crate::gate::ConnectionGate;
use crate::sessions::SessionRegistry;
use crate::uploads::UploadBroker;

/// Shared state of the session server. Cloning shares every component.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Admission gate for new websocket connections.
    pub gate: ConnectionGate,
    /// Latent and active session tokens.
    pub registry: SessionRegistry,
    /// Uploads waiting for their `PUT /rio/upload/{token}` request.
    pub uploads: UploadBroker,
    /// Weakly hosted temporary assets.
    pub assets: AssetHost,
    /// The application every session runs.
    pub app: Arc<dyn Application>,
}

impl AppState {
    pub fn new(config: Config, app: Arc<dyn Application>) -> Self {
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            gate: ConnectionGate::new(),
            registry: SessionRegistry::new(),
            uploads: UploadBroker::new(),
            assets: AssetHost::new(),
            app,
        }
    }
}
