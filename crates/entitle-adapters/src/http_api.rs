use async_trait::async_trait;
use entitle_core::{
    EntitleError, EntitlementCheck, VerificationApi, VerificationOutcome, VerifyRequest,
    VerifyResponse,
};
use reqwest::{Client, StatusCode, Url};
use std::time::Duration;

/// [`VerificationApi`] over the service's REST surface, for out-of-process controllers.
pub struct HttpVerificationApi {
    client: Client,
    base_url: String,
}

impl HttpVerificationApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, EntitleError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EntitleError::GatewayUnavailable(format!("http client build failed: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl VerificationApi for HttpVerificationApi {
    async fn verify(&self, request: &VerifyRequest) -> Result<VerificationOutcome, EntitleError> {
        let response = self
            .client
            .post(format!("{}/api/verify-payment", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(|e| EntitleError::GatewayUnavailable(e.to_string()))?;

        let status = response.status().as_u16();
        let body: serde_json::Value = match response.json().await {
            Ok(body) => body,
            Err(_) if status >= 500 => {
                return Err(EntitleError::GatewayUnavailable(format!(
                    "verification endpoint returned {status}"
                )))
            }
            Err(e) => return Err(EntitleError::Serialization(e.to_string())),
        };

        VerifyResponse::from_http(status, body)?.into_outcome()
    }

    async fn check_entitlement(
        &self,
        buyer_id: &str,
        asset_id: &str,
    ) -> Result<EntitlementCheck, EntitleError> {
        let mut url = Url::parse(&self.base_url).map_err(|e| {
            EntitleError::InvalidRequest(format!("invalid service url '{}': {e}", self.base_url))
        })?;
        url.path_segments_mut()
            .map_err(|_| {
                EntitleError::InvalidRequest(format!(
                    "service url '{}' cannot carry a path",
                    self.base_url
                ))
            })?
            .pop_if_empty()
            .extend(["v1", "entitlements", asset_id]);

        let response = self
            .client
            .get(url)
            .query(&[("buyerId", buyer_id)])
            .send()
            .await
            .map_err(|e| EntitleError::GatewayUnavailable(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(EntitleError::AssetNotFound(asset_id.to_string()));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(EntitleError::GatewayUnavailable(format!(
                "entitlement query returned {}: {}",
                status.as_u16(),
                message
            )));
        }

        response
            .json()
            .await
            .map_err(|e| EntitleError::Serialization(e.to_string()))
    }
}
