//! Redeems locally signed download links.

use crate::{ApiError, ServiceState};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use entitle_core::Blake3UrlSigner;
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::{Component, Path as FsPath, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Objects served for links signed by this process, one directory per bucket.
#[derive(Clone)]
pub struct LocalDownloads {
    signer: Arc<Blake3UrlSigner>,
    objects_dir: PathBuf,
}

impl LocalDownloads {
    pub fn new(signer: Arc<Blake3UrlSigner>, objects_dir: impl Into<PathBuf>) -> Self {
        Self {
            signer,
            objects_dir: objects_dir.into(),
        }
    }

    /// File backing `bucket/path`, or `None` when the path leaves the bucket.
    fn object_file(&self, bucket: &str, path: &str) -> Option<PathBuf> {
        let confined = |value: &str| {
            !value.is_empty()
                && FsPath::new(value)
                    .components()
                    .all(|component| matches!(component, Component::Normal(_)))
        };
        (confined(bucket) && confined(path)).then(|| self.objects_dir.join(bucket).join(path))
    }
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub token: String,
    pub expires: i64,
}

pub async fn download_object(
    State(state): State<ServiceState>,
    Path((bucket, path)): Path<(String, String)>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let Some(downloads) = state.downloads.as_ref() else {
        return Err(not_found("local downloads are not enabled"));
    };

    if !downloads
        .signer
        .verify(&bucket, &path, query.expires, &query.token, Utc::now())
    {
        warn!(bucket = %bucket, path = %path, "download link rejected");
        return Err(ApiError::Http {
            status: StatusCode::FORBIDDEN,
            message: "download link is invalid or expired".to_string(),
        });
    }

    let Some(file) = downloads.object_file(&bucket, &path) else {
        return Err(not_found("object not found"));
    };
    let bytes = match tokio::fs::read(&file).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!(bucket = %bucket, path = %path, "signed object missing from disk");
            return Err(not_found("object not found"));
        }
        Err(err) => {
            return Err(ApiError::Http {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: format!("object read failed: {err}"),
            })
        }
    };

    let filename = path
        .rsplit('/')
        .next()
        .unwrap_or(path.as_str())
        .replace(&['"', '\\'][..], "_");
    info!(bucket = %bucket, path = %path, size = bytes.len(), "serving download");
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        bytes,
    )
        .into_response())
}

fn not_found(message: &str) -> ApiError {
    ApiError::Http {
        status: StatusCode::NOT_FOUND,
        message: message.to_string(),
    }
}
