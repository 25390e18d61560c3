//! Weakly hosted temporary assets.
//!
//! The host maps a secret id to a [`Weak`] reference. Whoever created the
//! asset keeps the [`Arc`]; once the last strong reference is gone the URL
//! stops resolving and the entry is pruned lazily.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use axum::body::Bytes;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::GateError;
use crate::util::new_token;

/// URL prefix under which hosted assets are served.
pub const ASSET_URL_PREFIX: &str = "/rio/asset/temp/";

#[derive(Debug)]
pub enum AssetPayload {
    Bytes { data: Bytes, media_type: String },
    File { path: PathBuf, media_type: String },
}

/// An asset that can be served under a temporary URL.
#[derive(Debug)]
pub struct HostedAsset {
    secret_id: String,
    payload: AssetPayload,
}

impl HostedAsset {
    pub fn from_bytes(data: impl Into<Bytes>, media_type: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            secret_id: new_token(),
            payload: AssetPayload::Bytes {
                data: data.into(),
                media_type: media_type.into(),
            },
        })
    }

    pub fn from_file(path: impl Into<PathBuf>, media_type: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            secret_id: new_token(),
            payload: AssetPayload::File {
                path: path.into(),
                media_type: media_type.into(),
            },
        })
    }

    pub fn secret_id(&self) -> &str {
        &self.secret_id
    }

    pub fn payload(&self) -> &AssetPayload {
        &self.payload
    }

    pub fn media_type(&self) -> &str {
        match &self.payload {
            AssetPayload::Bytes { media_type, .. } | AssetPayload::File { media_type, .. } => {
                media_type
            }
        }
    }

    /// Read the asset's contents. A file that disappeared counts as vanished.
    pub async fn load(&self) -> Result<Bytes, GateError> {
        match &self.payload {
            AssetPayload::Bytes { data, .. } => Ok(data.clone()),
            AssetPayload::File { path, .. } => match tokio::fs::read(path).await {
                Ok(data) => Ok(Bytes::from(data)),
                Err(e) => {
                    warn!("Hosted asset file {} unreadable: {e}", path.display());
                    Err(GateError::ResourceVanished)
                }
            },
        }
    }
}

/// Table of weakly referenced assets.
///
/// Cloneable; all clones share the same table.
#[derive(Clone, Default)]
pub struct AssetHost {
    assets: Arc<RwLock<HashMap<String, Weak<HostedAsset>>>>,
}

impl AssetHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `asset` and return its URL. Hosting does not extend its life.
    pub async fn host(&self, asset: &Arc<HostedAsset>) -> String {
        self.assets
            .write()
            .await
            .insert(asset.secret_id.clone(), Arc::downgrade(asset));
        format!("{ASSET_URL_PREFIX}{}", asset.secret_id)
    }

    /// Look up a live asset. Dead entries are removed on the way.
    pub async fn resolve(&self, secret_id: &str) -> Result<Arc<HostedAsset>, GateError> {
        let weak = self
            .assets
            .read()
            .await
            .get(secret_id)
            .cloned()
            .ok_or(GateError::ResourceVanished)?;
        match weak.upgrade() {
            Some(asset) => Ok(asset),
            None => {
                self.assets.write().await.remove(secret_id);
                Err(GateError::ResourceVanished)
            }
        }
    }

    /// Remove entries whose asset has been dropped.
    pub async fn prune(&self) -> usize {
        let mut assets = self.assets.write().await;
        let before = assets.len();
        assets.retain(|_, weak| weak.strong_count() > 0);
        let removed = before - assets.len();
        if removed > 0 {
            debug!("Pruned {removed} dropped asset(s)");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.assets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.assets.read().await.is_empty()
    }
}
