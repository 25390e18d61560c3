//! Background expiry of idle sessions and stale uploads.
//!
//! The session reaper only holds a [`WeakRegistry`]: once the server drops its
//! registry the task notices on its next pass and exits.

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::assets::AssetHost;
use crate::config::{SessionsConfig, UploadsConfig};
use crate::sessions::WeakRegistry;
use crate::uploads::UploadBroker;

/// Periodically close sessions idle past their lifetime.
pub fn spawn(registry: WeakRegistry, config: SessionsConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = config.reaper_interval();
        loop {
            tokio::time::sleep(interval).await;
            let Some(registry) = registry.upgrade() else {
                debug!("Session registry dropped, reaper exiting");
                return;
            };
            let report = registry
                .reap(
                    Instant::now(),
                    config.session_lifetime(),
                    config.latent_lifetime(),
                )
                .await;
            if report.sessions_closed > 0 || report.latent_dropped > 0 {
                info!(
                    closed = report.sessions_closed,
                    latent = report.latent_dropped,
                    "Reaper pass complete"
                );
            }
        }
    })
}

/// Periodically drop expired uploads and pruned assets.
pub fn spawn_housekeeping(
    uploads: UploadBroker,
    assets: AssetHost,
    config: UploadsConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.sweep_interval());
        ticker.tick().await;
        loop {
            ticker.tick().await;
            uploads.sweep_expired(Instant::now()).await;
            assets.prune().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::app::testing::RecordingApp;
    use crate::sessions::session::Session;
    use crate::sessions::{RequestMetadata, SessionRegistry};

    fn config() -> SessionsConfig {
        SessionsConfig {
            reaper_interval_secs: 60,
            session_lifetime_secs: 300,
            latent_lifetime_secs: 300,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_closes_expired_sessions() {
        let registry = SessionRegistry::new();
        let session = Session::new(
            "tok-r".to_string(),
            RequestMetadata::for_path("/"),
            None,
            Arc::new(RecordingApp::default()),
        );
        registry.activate(Arc::clone(&session)).await.unwrap();
        let task = spawn(registry.downgrade(), config());

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(!session.is_closed());

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(session.is_closed());
        assert_eq!(registry.active_count().await, 0);
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_exits_when_registry_dropped() {
        let registry = SessionRegistry::new();
        let task = spawn(registry.downgrade(), config());
        drop(registry);
        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
        assert!(task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn housekeeping_sweeps_uploads() {
        let uploads = UploadBroker::new();
        let assets = AssetHost::new();
        let (_token, _waiter) = uploads.issue(Duration::from_secs(30)).await;
        let task = spawn_housekeeping(
            uploads.clone(),
            assets,
            UploadsConfig {
                ttl_secs: 30,
                sweep_interval_secs: 60,
            },
        );
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(uploads.is_empty().await);
        task.abort();
    }
}
