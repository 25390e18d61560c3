//! Serving of weakly hosted temporary assets.

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};

use crate::error::GateError;
use crate::AppState;

/// `GET /rio/asset/temp/{asset_id}`: serve a hosted asset.
///
/// Asset ids are never reused, so responses are cacheable forever. A dropped
/// asset is a plain 404.
pub async fn temp_asset(
    State(state): State<AppState>,
    Path(asset_id): Path<String>,
) -> Result<Response, GateError> {
    let asset = state.assets.resolve(&asset_id).await?;
    let data = asset.load().await?;
    Ok((
        [
            (header::CONTENT_TYPE, asset.media_type().to_string()),
            (
                header::CACHE_CONTROL,
                "max-age=31536000, immutable".to_string(),
            ),
        ],
        data,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::app::StaticPages;
    use crate::assets::HostedAsset;
    use crate::config::Config;

    fn state() -> AppState {
        let config = Config::default();
        let app = Arc::new(StaticPages::from_config(&config.app));
        AppState::new(config, app)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn serves_live_asset() {
        let state = state();
        let asset = HostedAsset::from_bytes(&b"{\"a\":1}"[..], "application/json");
        let url = state.assets.host(&asset).await;

        let resp = crate::server::router(state.clone())
            .oneshot(get(&url))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/json");
        assert_eq!(
            resp.headers()[header::CACHE_CONTROL],
            "max-age=31536000, immutable"
        );
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"{\"a\":1}");
    }

    #[tokio::test]
    async fn dropped_asset_is_not_found() {
        let state = state();
        let asset = HostedAsset::from_bytes(&b"gone"[..], "text/plain");
        let url = state.assets.host(&asset).await;
        drop(asset);

        let resp = crate::server::router(state).oneshot(get(&url)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
