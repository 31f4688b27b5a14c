use crate::error::EntitleError;
use crate::types::AssetRecord;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use url::Url;

/// Default lifetime of an issued download URL.
pub const DEFAULT_CREDENTIAL_TTL: Duration = Duration::from_secs(3_600);

/// Which path produced a download URL.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    Signed,
    /// Direct public-bucket URL; may 404 if the object is not actually public.
    PublicFallback,
}

/// Time-limited access to one stored file. Issued fresh per confirmation, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadCredential {
    pub url: String,
    pub expires_at: DateTime<Utc>,
    pub asset_id: String,
    pub filename: Option<String>,
    pub source: CredentialSource,
}

/// Storage provider operation producing a signed, expiring URL.
#[async_trait]
pub trait UrlSigner: Send + Sync {
    async fn sign(&self, bucket: &str, path: &str, ttl: Duration) -> Result<String, EntitleError>;
}

/// Local signer using keyed BLAKE3 tokens.
///
/// The token binds bucket, path and expiry; [`Blake3UrlSigner::verify`] checks it
/// on the serving side.
#[derive(Clone)]
pub struct Blake3UrlSigner {
    base_url: String,
    key: [u8; 32],
}

impl Blake3UrlSigner {
    const KEY_CONTEXT: &'static str = "entitle download credential v1";

    pub fn new(base_url: impl Into<String>, secret: &str) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            key: blake3::derive_key(Self::KEY_CONTEXT, secret.as_bytes()),
        }
    }

    pub fn token(&self, bucket: &str, path: &str, expires_unix: i64) -> String {
        let message = format!("{bucket}\n{path}\n{expires_unix}");
        blake3::keyed_hash(&self.key, message.as_bytes())
            .to_hex()
            .to_string()
    }

    /// Accepts a token only if it matches and has not expired at `now`.
    pub fn verify(
        &self,
        bucket: &str,
        path: &str,
        expires_unix: i64,
        token: &str,
        now: DateTime<Utc>,
    ) -> bool {
        if now.timestamp() > expires_unix {
            return false;
        }
        let Ok(provided) = blake3::Hash::from_hex(token) else {
            return false;
        };
        let message = format!("{bucket}\n{path}\n{expires_unix}");
        // Hash equality is constant time.
        blake3::keyed_hash(&self.key, message.as_bytes()) == provided
    }
}

#[async_trait]
impl UrlSigner for Blake3UrlSigner {
    async fn sign(&self, bucket: &str, path: &str, ttl: Duration) -> Result<String, EntitleError> {
        let expires = expiry_after(Utc::now(), ttl)?.timestamp();
        let token = self.token(bucket, path, expires);
        let mut url = storage_object_url(&self.base_url, "sign", bucket, path)?;
        url.query_pairs_mut()
            .append_pair("token", &token)
            .append_pair("expires", &expires.to_string());
        Ok(url.into())
    }
}

/// `{base}/storage/v1/object/{kind}/{bucket}/{path}` with each segment percent-encoded.
pub fn storage_object_url(
    base_url: &str,
    kind: &str,
    bucket: &str,
    path: &str,
) -> Result<Url, EntitleError> {
    let mut url = Url::parse(base_url).map_err(|e| {
        EntitleError::CredentialIssuanceFailed(format!("invalid storage url '{base_url}': {e}"))
    })?;
    url.path_segments_mut()
        .map_err(|_| {
            EntitleError::CredentialIssuanceFailed(format!(
                "storage url '{base_url}' cannot carry a path"
            ))
        })?
        .pop_if_empty()
        .extend(["storage", "v1", "object", kind, bucket])
        .extend(path.split('/').filter(|segment| !segment.is_empty()));
    Ok(url)
}

/// Issues download credentials, falling back to the public-bucket URL pattern
/// when signing fails.
#[derive(Clone)]
pub struct CredentialIssuer {
    signer: Arc<dyn UrlSigner>,
    bucket: String,
    public_base_url: Option<String>,
    ttl: Duration,
}

impl CredentialIssuer {
    pub fn new(
        signer: Arc<dyn UrlSigner>,
        bucket: impl Into<String>,
        public_base_url: Option<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            signer,
            bucket: bucket.into(),
            public_base_url: public_base_url.map(|url| url.trim_end_matches('/').to_string()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn issue(&self, asset: &AssetRecord) -> Result<DownloadCredential, EntitleError> {
        let path = asset.storage_path.trim_start_matches('/');
        if path.is_empty() {
            return Err(EntitleError::CredentialIssuanceFailed(format!(
                "asset '{}' has no storage location",
                asset.asset_id
            )));
        }

        let issued_at = Utc::now();
        let expires_at = expiry_after(issued_at, self.ttl)?;

        let (url, source) = match self.signer.sign(&self.bucket, path, self.ttl).await {
            Ok(url) => (url, CredentialSource::Signed),
            Err(err) => {
                warn!(
                    asset_id = %asset.asset_id,
                    error = %err,
                    "url signing failed, using public fallback"
                );
                (self.public_url(path, &err)?, CredentialSource::PublicFallback)
            }
        };

        Ok(DownloadCredential {
            url,
            expires_at,
            asset_id: asset.asset_id.clone(),
            filename: asset.filename(),
            source,
        })
    }

    fn public_url(&self, path: &str, sign_error: &EntitleError) -> Result<String, EntitleError> {
        let base = self.public_base_url.as_deref().ok_or_else(|| {
            EntitleError::CredentialIssuanceFailed(format!(
                "signing failed and no public base url configured: {sign_error}"
            ))
        })?;
        Ok(storage_object_url(base, "public", &self.bucket, path)?.into())
    }
}

fn expiry_after(from: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>, EntitleError> {
    ChronoDuration::from_std(ttl)
        .ok()
        .and_then(|ttl| from.checked_add_signed(ttl))
        .ok_or_else(|| EntitleError::CredentialIssuanceFailed("credential ttl out of range".into()))
}
