//! Upload endpoint completing pending [`UploadBroker`](crate::uploads::UploadBroker) entries.

use axum::extract::{FromRequest, Multipart, Path, Request, State};
use axum::Json;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::GateError;
use crate::uploads::UploadForm;
use crate::util::token_prefix;
use crate::AppState;

/// `PUT /rio/upload/{upload_token}`: receive files for a pending upload.
///
/// The token is consumed before the body is read: unknown or expired tokens
/// fail with 400 and a malformed form (422) still burns the token.
pub async fn upload(
    State(state): State<AppState>,
    Path(upload_token): Path<String>,
    req: Request,
) -> Result<Json<Value>, GateError> {
    let slot = state.uploads.take(&upload_token).await?;

    let form = match read_form(req).await {
        Ok(form) => form,
        Err(e) => {
            warn!(token = token_prefix(&upload_token), "Rejected upload: {e}");
            slot.reject(GateError::MalformedRequest(e.to_string()));
            return Err(e);
        }
    };
    let files = match form.into_files() {
        Ok(files) => files,
        Err(e) => {
            warn!(token = token_prefix(&upload_token), "Rejected upload: {e}");
            slot.reject(GateError::MalformedRequest(e.to_string()));
            return Err(e);
        }
    };

    let count = files.len();
    let total: u64 = files.iter().map(|f| f.size_in_bytes).sum();
    if !slot.resolve(files) {
        warn!(
            token = token_prefix(&upload_token),
            "Upload arrived but its requester is gone"
        );
    }
    info!(
        token = token_prefix(&upload_token),
        count, total, "Upload completed"
    );
    Ok(Json(json!({"ok": true, "files": count})))
}

async fn read_form(req: Request) -> Result<UploadForm, GateError> {
    let mut multipart = Multipart::from_request(req, &())
        .await
        .map_err(|e| GateError::MalformedRequest(e.body_text()))?;

    let mut form = UploadForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| GateError::MalformedRequest(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| GateError::MalformedRequest(e.body_text()))?;
        form.push_field(&name, data);
    }
    Ok(form)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{header, Request as HttpRequest, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::app::StaticPages;
    use crate::config::Config;

    const BOUNDARY: &str = "livegate-test-boundary";

    fn state() -> AppState {
        let config = Config::default();
        let app = Arc::new(StaticPages::from_config(&config.app));
        AppState::new(config, app)
    }

    fn multipart_body(fields: &[(&str, &str)]) -> String {
        let mut body = String::new();
        for (name, value) in fields {
            body.push_str(&format!("--{BOUNDARY}\r\n"));
            if name.starts_with("file_streams") {
                body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"blob\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n"
                ));
            } else {
                body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{name}\"\r\n\r\n"
                ));
            }
            body.push_str(value);
            body.push_str("\r\n");
        }
        body.push_str(&format!("--{BOUNDARY}--\r\n"));
        body
    }

    fn put(token: &str, fields: &[(&str, &str)]) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("PUT")
            .uri(format!("/rio/upload/{token}"))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(multipart_body(fields)))
            .unwrap()
    }

    #[tokio::test]
    async fn upload_resolves_waiter() {
        let state = state();
        let (token, waiter) = state.uploads.issue(Duration::from_secs(60)).await;
        let app = crate::server::router(state.clone());

        let resp = app
            .oneshot(put(
                &token,
                &[
                    ("file_names[]", "notes.txt"),
                    ("file_types[]", "text/plain"),
                    ("file_sizes[]", "5"),
                    ("file_streams[]", "hello"),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let files = waiter.wait().await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "notes.txt");
        assert_eq!(files[0].size_in_bytes, 5);
        assert_eq!(&files[0].contents[..], b"hello");
    }

    #[tokio::test]
    async fn unknown_token_is_bad_request() {
        let app = crate::server::router(state());
        let resp = app
            .oneshot(put("missing", &[("file_names[]", "a")]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn mismatched_arrays_are_unprocessable() {
        let state = state();
        let (token, waiter) = state.uploads.issue(Duration::from_secs(60)).await;
        let app = crate::server::router(state.clone());

        let resp = app
            .oneshot(put(
                &token,
                &[
                    ("file_names[]", "a"),
                    ("file_names[]", "b"),
                    ("file_types[]", "x"),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(matches!(
            waiter.wait().await,
            Err(GateError::MalformedRequest(_))
        ));
        assert!(state.uploads.is_empty().await);
    }

    #[tokio::test]
    async fn bad_sizes_are_unprocessable() {
        for size in ["-1", "abc"] {
            let state = state();
            let (token, _waiter) = state.uploads.issue(Duration::from_secs(60)).await;
            let app = crate::server::router(state);
            let resp = app
                .oneshot(put(
                    &token,
                    &[
                        ("file_names[]", "a"),
                        ("file_types[]", "text/plain"),
                        ("file_sizes[]", size),
                        ("file_streams[]", "x"),
                    ],
                ))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY, "size {size}");
        }
    }

    #[tokio::test]
    async fn token_is_single_use() {
        let state = state();
        let (token, _waiter) = state.uploads.issue(Duration::from_secs(60)).await;
        let fields = [
            ("file_names[]", "a"),
            ("file_types[]", "text/plain"),
            ("file_sizes[]", "1"),
            ("file_streams[]", "x"),
        ];

        let first = crate::server::router(state.clone())
            .oneshot(put(&token, &fields))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = crate::server::router(state)
            .oneshot(put(&token, &fields))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::BAD_REQUEST);
    }
}
