use async_trait::async_trait;
use entitle_core::{storage_object_url, EntitleError, UrlSigner};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct SignResponse {
    #[serde(rename = "signedURL", alias = "signedUrl")]
    signed_url: String,
}

/// Signs object URLs through the storage service's `object/sign` endpoint.
pub struct StorageApiSigner {
    client: Client,
    base_url: String,
    service_key: String,
}

impl StorageApiSigner {
    pub fn new(
        base_url: impl Into<String>,
        service_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, EntitleError> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            EntitleError::CredentialIssuanceFailed(format!("http client build failed: {e}"))
        })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_key: service_key.into(),
        })
    }
}

#[async_trait]
impl UrlSigner for StorageApiSigner {
    async fn sign(&self, bucket: &str, path: &str, ttl: Duration) -> Result<String, EntitleError> {
        let url = storage_object_url(&self.base_url, "sign", bucket, path)?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
            .json(&json!({ "expiresIn": ttl.as_secs() }))
            .send()
            .await
            .map_err(|e| EntitleError::CredentialIssuanceFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(EntitleError::CredentialIssuanceFailed(format!(
                "storage sign returned {}: {}",
                status.as_u16(),
                message
            )));
        }

        let signed: SignResponse = response
            .json()
            .await
            .map_err(|e| EntitleError::CredentialIssuanceFailed(e.to_string()))?;

        // The service answers with a path relative to `/storage/v1`.
        if signed.signed_url.starts_with("http://") || signed.signed_url.starts_with("https://") {
            Ok(signed.signed_url)
        } else {
            Ok(format!("{}/storage/v1{}", self.base_url, signed.signed_url))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn relative_signed_url_is_made_absolute() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/object/sign/models/u1/bracket.stl"))
            .and(header("apikey", "service-key"))
            .and(body_json(json!({ "expiresIn": 3600 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "signedURL": "/object/sign/models/u1/bracket.stl?token=abc"
            })))
            .mount(&server)
            .await;

        let signer = StorageApiSigner::new(server.uri(), "service-key", Duration::from_secs(5)).unwrap();
        let url = signer
            .sign("models", "u1/bracket.stl", Duration::from_secs(3_600))
            .await
            .unwrap();
        assert_eq!(
            url,
            format!(
                "{}/storage/v1/object/sign/models/u1/bracket.stl?token=abc",
                server.uri()
            )
        );
    }

    #[tokio::test]
    async fn object_path_is_encoded_per_segment() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/object/sign/models/u1/my%20part%23v2.stl"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "signedURL": "/object/sign/models/u1/my%20part%23v2.stl?token=abc"
            })))
            .mount(&server)
            .await;

        let signer = StorageApiSigner::new(server.uri(), "service-key", Duration::from_secs(5)).unwrap();
        let url = signer
            .sign("models", "u1/my part#v2.stl", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(url.ends_with("/storage/v1/object/sign/models/u1/my%20part%23v2.stl?token=abc"));
    }

    #[tokio::test]
    async fn missing_object_fails_issuance() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": "not_found"
            })))
            .mount(&server)
            .await;

        let signer = StorageApiSigner::new(server.uri(), "service-key", Duration::from_secs(5)).unwrap();
        let err = signer
            .sign("models", "missing.stl", Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, EntitleError::CredentialIssuanceFailed(_)));
    }
}
