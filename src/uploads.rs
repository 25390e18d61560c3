//! Token-keyed file upload rendezvous.
//!
//! A session that wants files from its client registers an upload token with
//! the [`UploadBroker`] and tells the client to `PUT` the files to
//! `/rio/upload/{token}`. The HTTP handler takes the pending entry, validates
//! the multipart form and resolves the waiter with the parsed files.
//!
//! Tokens are single-use: the entry is removed before the form is validated,
//! so a malformed upload still consumes the token. Entries nobody uploads to
//! expire after their TTL and are removed by [`UploadBroker::sweep_expired`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use serde_json::json;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::GateError;
use crate::sessions::session::Session;
use crate::util::{new_token, token_prefix};

/// A file received through the upload endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    pub name: String,
    pub size_in_bytes: u64,
    pub media_type: String,
    pub contents: Bytes,
}

type UploadResult = Result<Vec<FileInfo>, GateError>;

struct PendingUpload {
    tx: oneshot::Sender<UploadResult>,
    expires_at: Instant,
}

/// Registry of uploads waiting for their HTTP request.
///
/// Cloneable; all clones share the same pending map.
#[derive(Clone, Default)]
pub struct UploadBroker {
    pending: Arc<Mutex<HashMap<String, PendingUpload>>>,
}

/// The session side of a pending upload.
pub struct UploadWaiter {
    token: String,
    rx: oneshot::Receiver<UploadResult>,
    expires_at: Instant,
}

/// The HTTP side of a pending upload, taken out of the broker.
pub struct UploadSlot {
    token: String,
    tx: oneshot::Sender<UploadResult>,
}

impl UploadBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `token` as a pending upload valid for `ttl`.
    pub async fn begin(&self, token: String, ttl: Duration) -> Result<UploadWaiter, GateError> {
        let mut pending = self.pending.lock().await;
        if pending.contains_key(&token) {
            return Err(GateError::TokenInUse);
        }
        let (tx, rx) = oneshot::channel();
        let expires_at = Instant::now() + ttl;
        pending.insert(token.clone(), PendingUpload { tx, expires_at });
        debug!(token = token_prefix(&token), "Upload pending");
        Ok(UploadWaiter {
            token,
            rx,
            expires_at,
        })
    }

    /// Register a pending upload under a freshly generated token.
    pub async fn issue(&self, ttl: Duration) -> (String, UploadWaiter) {
        loop {
            let token = new_token();
            if let Ok(waiter) = self.begin(token.clone(), ttl).await {
                return (token, waiter);
            }
        }
    }

    /// Remove a pending upload so its request can be processed. Unknown and
    /// expired tokens are rejected.
    pub async fn take(&self, token: &str) -> Result<UploadSlot, GateError> {
        let entry = self
            .pending
            .lock()
            .await
            .remove(token)
            .ok_or(GateError::InvalidToken)?;
        if entry.expires_at <= Instant::now() {
            return Err(GateError::InvalidToken);
        }
        Ok(UploadSlot {
            token: token.to_string(),
            tx: entry.tx,
        })
    }

    /// Take the pending entry for `token` and resolve it with `files`.
    pub async fn complete(&self, token: &str, files: Vec<FileInfo>) -> Result<(), GateError> {
        let slot = self.take(token).await?;
        if !slot.resolve(files) {
            debug!(token = token_prefix(token), "Upload completed but nobody is waiting");
        }
        Ok(())
    }

    /// Withdraw a pending upload without resolving it.
    pub async fn cancel(&self, token: &str) -> bool {
        self.pending.lock().await.remove(token).is_some()
    }

    /// Drop every entry whose TTL has passed. Returns how many were removed.
    pub async fn sweep_expired(&self, now: Instant) -> usize {
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|_, entry| entry.expires_at > now);
        let removed = before - pending.len();
        if removed > 0 {
            info!("Swept {removed} expired upload(s), remaining: {}", pending.len());
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }
}

impl UploadWaiter {
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Wait for the files. Fails with [`GateError::UploadExpired`] once the
    /// TTL passes or the entry is swept.
    pub async fn wait(self) -> UploadResult {
        tokio::select! {
            result = self.rx => result.unwrap_or(Err(GateError::UploadExpired)),
            () = tokio::time::sleep_until(self.expires_at) => Err(GateError::UploadExpired),
        }
    }
}

impl UploadSlot {
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Hand the files to the waiter. Returns `false` if nobody is waiting.
    pub fn resolve(self, files: Vec<FileInfo>) -> bool {
        self.tx.send(Ok(files)).is_ok()
    }

    /// Fail the waiter with `error`.
    pub fn reject(self, error: GateError) -> bool {
        self.tx.send(Err(error)).is_ok()
    }
}

/// The parallel arrays of an upload form.
///
/// Field names are accepted with or without a trailing `[]`.
#[derive(Debug, Default)]
pub struct UploadForm {
    pub file_names: Vec<String>,
    pub file_types: Vec<String>,
    pub file_sizes: Vec<String>,
    pub file_streams: Vec<Bytes>,
}

impl UploadForm {
    /// Add one multipart field. Unknown fields are ignored.
    pub fn push_field(&mut self, name: &str, data: Bytes) {
        match name.trim_end_matches("[]") {
            "file_names" => self.file_names.push(text(&data)),
            "file_types" => self.file_types.push(text(&data)),
            "file_sizes" => self.file_sizes.push(text(&data)),
            "file_streams" => self.file_streams.push(data),
            other => debug!("Ignoring upload field `{other}`"),
        }
    }

    /// Validate the arrays and zip them into files.
    pub fn into_files(self) -> Result<Vec<FileInfo>, GateError> {
        let n = self.file_names.len();
        if self.file_types.len() != n || self.file_sizes.len() != n || self.file_streams.len() != n
        {
            return Err(GateError::MalformedRequest(
                "file_names, file_types, file_sizes and file_streams must have the same length"
                    .to_string(),
            ));
        }

        let sizes = self
            .file_sizes
            .iter()
            .map(|raw| {
                raw.trim().parse::<u64>().map_err(|_| {
                    GateError::MalformedRequest(format!("`{raw}` is not a valid file size"))
                })
            })
            .collect::<Result<Vec<u64>, GateError>>()?;

        Ok(self
            .file_names
            .into_iter()
            .zip(self.file_types)
            .zip(sizes)
            .zip(self.file_streams)
            .map(|(((name, media_type), size_in_bytes), contents)| FileInfo {
                name,
                size_in_bytes,
                media_type,
                contents,
            })
            .collect())
    }
}

fn text(data: &Bytes) -> String {
    String::from_utf8_lossy(data).into_owned()
}

fn normalize_extensions(extensions: &[String]) -> Vec<String> {
    extensions
        .iter()
        .map(|ext| {
            if ext.starts_with('.') {
                ext.clone()
            } else {
                format!(".{ext}")
            }
        })
        .collect()
}

/// Ask the session's client to pick files and wait for the upload.
///
/// `extensions` restricts the chooser (`None` allows any file). Without
/// `multiple`, exactly one file must arrive.
pub async fn choose_files(
    session: &Session,
    broker: &UploadBroker,
    ttl: Duration,
    extensions: Option<&[String]>,
    multiple: bool,
) -> Result<Vec<FileInfo>, GateError> {
    if session.is_closed() {
        return Err(GateError::SessionClosed);
    }
    let (token, waiter) = broker.issue(ttl).await;
    let request = json!({
        "type": "requestFileUpload",
        "uploadUrl": format!("/rio/upload/{token}"),
        "fileExtensions": extensions.map(normalize_extensions),
        "multiple": multiple,
    });
    if !session.send(request).await {
        broker.cancel(&token).await;
        return Err(GateError::NoFileSelected);
    }

    let files = tokio::select! {
        result = waiter.wait() => result?,
        () = session.wait_closed() => {
            broker.cancel(&token).await;
            return Err(GateError::SessionClosed);
        }
    };

    if files.is_empty() || (!multiple && files.len() != 1) {
        return Err(GateError::NoFileSelected);
    }
    Ok(files)
}
