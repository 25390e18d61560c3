//! Router construction and server lifecycle.
//!
//! Startup runs the application's start hook before the listener accepts
//! connections, then spawns the maintenance tasks. Shutdown stops them,
//! closes every session concurrently and only then runs the application's
//! close hook.

use std::future::Future;
use std::net::SocketAddr;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, put};
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::app::run_hook;
use crate::util::token_prefix;
use crate::{reaper, routes, ws, AppState};

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let max_upload = state.config.server.max_upload_bytes;
    Router::new()
        .route("/rio/ws", get(ws::ws_upgrade))
        .route(
            "/rio/upload/{upload_token}",
            put(routes::upload::upload).layer(DefaultBodyLimit::max(max_upload)),
        )
        .route("/rio/asset/temp/{asset_id}", get(routes::assets::temp_asset))
        .route("/rio/health", get(routes::health::health))
        .route("/", get(routes::index::index))
        .route("/{*path}", get(routes::index::index))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Handles of the maintenance tasks started by [`start_background`].
pub struct Background {
    reaper: Option<JoinHandle<()>>,
    housekeeping: JoinHandle<()>,
}

/// Run the application's start hook and spawn the maintenance tasks.
pub async fn start_background(state: &AppState) -> Background {
    run_hook("on_app_start", state.app.on_app_start()).await;

    // A local window has exactly one client; its session never expires.
    let reaper = if state.config.server.running_in_window {
        None
    } else {
        Some(reaper::spawn(
            state.registry.downgrade(),
            state.config.sessions.clone(),
        ))
    };
    let housekeeping = reaper::spawn_housekeeping(
        state.uploads.clone(),
        state.assets.clone(),
        state.config.uploads.clone(),
    );

    Background {
        reaper,
        housekeeping,
    }
}

/// Stop maintenance, close every session and run the application's close hook.
pub async fn shutdown(state: &AppState, background: Background) {
    if let Some(task) = background.reaper {
        task.abort();
    }
    background.housekeeping.abort();

    for (token, e) in state.registry.close_all().await {
        warn!(token = token_prefix(&token), "Error closing session: {e}");
    }

    run_hook("on_app_close", state.app.on_app_close()).await;
}

/// Serve on `listener` until `signal` resolves, then shut down.
pub async fn serve<F>(listener: TcpListener, state: AppState, signal: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let background = start_background(&state).await;
    let app = router(state.clone());

    info!("Listening on {}", listener.local_addr()?);
    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(signal)
    .await;

    info!("Shutting down...");
    shutdown(&state, background).await;
    result?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::app::testing::RecordingApp;
    use crate::config::Config;
    use crate::sessions::session::Session;
    use crate::sessions::RequestMetadata;

    #[tokio::test]
    async fn shutdown_closes_sessions_and_stops_tasks() {
        let app = Arc::new(RecordingApp::default());
        let state = AppState::new(Config::default(), app.clone());
        let background = start_background(&state).await;

        let session = Session::new(
            "tok-s".to_string(),
            RequestMetadata::for_path("/"),
            None,
            app.clone(),
        );
        state.registry.activate(Arc::clone(&session)).await.unwrap();

        shutdown(&state, background).await;
        assert!(session.is_closed());
        assert_eq!(app.closed_sessions(), 1);
        assert_eq!(state.registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn window_mode_runs_without_reaper() {
        let mut config = Config::default();
        config.server.running_in_window = true;
        let state = AppState::new(config, Arc::new(RecordingApp::default()));
        let background = start_background(&state).await;
        assert!(background.reaper.is_none());
        shutdown(&state, background).await;
    }
}
