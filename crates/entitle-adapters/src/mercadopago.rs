use async_trait::async_trait;
use chrono::{DateTime, Utc};
use entitle_core::{CheckoutRequest, CheckoutSession, EntitleError, PaymentGateway, ProviderPayment};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_API_BASE: &str = "https://api.mercadopago.com";

#[derive(Debug, Deserialize)]
struct PaymentResponse {
    id: Value,
    status: Option<String>,
    status_detail: Option<String>,
    external_reference: Option<String>,
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
    date_last_updated: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderPayment {
    id: Value,
    status: Option<String>,
    status_detail: Option<String>,
    last_modified: Option<String>,
    date_approved: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MerchantOrderResponse {
    external_reference: Option<String>,
    #[serde(default)]
    payments: Vec<OrderPayment>,
}

#[derive(Debug, Deserialize)]
struct PreferenceResponse {
    id: String,
    init_point: Option<String>,
}

/// Mercado Pago REST gateway.
///
/// The buyer id rides in `external_reference` and `metadata.user_id` of the
/// checkout preference, which is where [`ProviderPayment::buyer_reference`] reads it.
pub struct MercadoPagoGateway {
    client: Client,
    base_url: String,
    access_token: String,
}

impl MercadoPagoGateway {
    pub fn new(
        base_url: impl Into<String>,
        access_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, EntitleError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EntitleError::GatewayUnavailable(format!("http client build failed: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<T>, EntitleError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(unavailable)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::BAD_REQUEST {
            debug!(path, status = status.as_u16(), "reference unknown to mercadopago");
            return Ok(None);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(EntitleError::GatewayUnavailable(format!(
                "mercadopago returned {}: {}",
                status.as_u16(),
                message
            )));
        }

        response.json().await.map(Some).map_err(unavailable)
    }
}

#[async_trait]
impl PaymentGateway for MercadoPagoGateway {
    fn name(&self) -> &'static str {
        "mercadopago"
    }

    async fn get_payment(&self, payment_id: &str) -> Result<Option<ProviderPayment>, EntitleError> {
        if !is_safe_reference(payment_id) {
            return Ok(None);
        }
        let payment: Option<PaymentResponse> =
            self.get_json(&format!("/v1/payments/{payment_id}")).await?;

        Ok(payment.map(|p| ProviderPayment {
            payment_id: id_string(&p.id),
            status: p.status.unwrap_or_default(),
            status_detail: p.status_detail,
            external_reference: p.external_reference,
            metadata: p.metadata.map(flatten_metadata).unwrap_or_default(),
            last_updated: p.date_last_updated.as_deref().and_then(parse_timestamp),
        }))
    }

    async fn get_merchant_order_payments(
        &self,
        order_id: &str,
    ) -> Result<Option<Vec<ProviderPayment>>, EntitleError> {
        if !is_safe_reference(order_id) {
            return Ok(None);
        }
        let order: Option<MerchantOrderResponse> =
            self.get_json(&format!("/merchant_orders/{order_id}")).await?;

        Ok(order.map(|order| {
            order
                .payments
                .into_iter()
                .map(|p| ProviderPayment {
                    payment_id: id_string(&p.id),
                    status: p.status.unwrap_or_default(),
                    status_detail: p.status_detail,
                    external_reference: order.external_reference.clone(),
                    metadata: BTreeMap::new(),
                    last_updated: p
                        .last_modified
                        .as_deref()
                        .or(p.date_approved.as_deref())
                        .and_then(parse_timestamp),
                })
                .collect()
        }))
    }

    async fn create_checkout(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, EntitleError> {
        let body = json!({
            "items": [{
                "id": request.asset_id,
                "title": request.title,
                "quantity": request.quantity,
                "unit_price": request.unit_price_minor as f64 / 100.0,
                "currency_id": request.currency,
            }],
            "back_urls": {
                "success": request.return_url("approved")?,
                "failure": request.return_url("failure")?,
                "pending": request.return_url("pending")?,
            },
            "auto_return": "approved",
            "external_reference": request.buyer_id,
            "metadata": {
                "user_id": request.buyer_id,
                "model_id": request.asset_id,
            },
        });

        let response = self
            .client
            .post(format!("{}/checkout/preferences", self.base_url))
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .map_err(unavailable)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(EntitleError::GatewayUnavailable(format!(
                "preference creation returned {}: {}",
                status.as_u16(),
                message
            )));
        }

        let preference: PreferenceResponse = response.json().await.map_err(unavailable)?;
        Ok(CheckoutSession {
            id: preference.id,
            init_point: preference.init_point,
        })
    }
}

fn unavailable(err: reqwest::Error) -> EntitleError {
    EntitleError::GatewayUnavailable(err.to_string())
}

/// Provider ids are numeric; anything else never reaches the URL path.
fn is_safe_reference(reference: &str) -> bool {
    !reference.is_empty()
        && reference
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn id_string(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn flatten_metadata(metadata: Map<String, Value>) -> BTreeMap<String, String> {
    metadata
        .into_iter()
        .filter_map(|(key, value)| match value {
            Value::String(s) => Some((key, s)),
            Value::Number(n) => Some((key, n.to_string())),
            Value::Bool(b) => Some((key, b.to_string())),
            _ => None,
        })
        .collect()
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}
