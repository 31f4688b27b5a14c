use crate::error::EntitleError;
use crate::types::AssetRecord;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Read-only lookup of purchasable assets. The catalog itself is owned elsewhere.
#[async_trait]
pub trait AssetCatalog: Send + Sync {
    /// Fails with [`EntitleError::AssetNotFound`] for unknown ids.
    async fn resolve(&self, asset_id: &str) -> Result<AssetRecord, EntitleError>;
}

/// In-process catalog for development and tests.
#[derive(Debug, Default)]
pub struct MemoryAssetCatalog {
    assets: RwLock<HashMap<String, AssetRecord>>,
}

impl MemoryAssetCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_assets(assets: impl IntoIterator<Item = AssetRecord>) -> Self {
        Self {
            assets: RwLock::new(
                assets
                    .into_iter()
                    .map(|asset| (asset.asset_id.clone(), asset))
                    .collect(),
            ),
        }
    }

    pub async fn insert(&self, asset: AssetRecord) {
        self.assets
            .write()
            .await
            .insert(asset.asset_id.clone(), asset);
    }
}

#[async_trait]
impl AssetCatalog for MemoryAssetCatalog {
    async fn resolve(&self, asset_id: &str) -> Result<AssetRecord, EntitleError> {
        self.assets
            .read()
            .await
            .get(asset_id)
            .cloned()
            .ok_or_else(|| EntitleError::AssetNotFound(asset_id.to_string()))
    }
}
