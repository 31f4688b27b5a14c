//! Payment gateway contract and the timeout-bounded client the orchestrator uses.

use crate::error::EntitleError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use url::Url;

/// Normalized gateway verdict for a payment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GatewayStatus {
    Approved,
    Pending,
    Rejected,
    /// Gateway could not be reached or answered with something unrecognized.
    Unknown,
}

impl GatewayStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Pending => "pending",
            Self::Rejected => "rejected",
            Self::Unknown => "unknown",
        }
    }

    /// Map a provider status token onto the normalized verdict.
    pub fn from_provider(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "approved" | "completed" | "accredited" => Self::Approved,
            "pending" | "in_process" | "in_mediation" | "authorized" => Self::Pending,
            "rejected" | "failure" | "cancelled" | "refunded" | "charged_back" => Self::Rejected,
            _ => Self::Unknown,
        }
    }

    /// Whether a later lookup could still turn into an approval.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Pending | Self::Unknown)
    }
}

/// Raw payment as reported by a provider, before normalization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderPayment {
    pub payment_id: String,
    pub status: String,
    pub status_detail: Option<String>,
    /// Correlation field set at checkout time; carries the buyer id.
    pub external_reference: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl ProviderPayment {
    /// Buyer id from the external reference, falling back to `metadata.user_id`.
    pub fn buyer_reference(&self) -> Option<String> {
        self.external_reference
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .or_else(|| {
                self.metadata
                    .get("user_id")
                    .map(String::as_str)
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
            })
            .map(str::to_string)
    }

    /// Asset the checkout was created for, from `metadata.model_id`.
    pub fn asset_reference(&self) -> Option<String> {
        self.metadata
            .get("model_id")
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }
}

/// Normalized lookup result handed to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GatewayVerdict {
    /// Provider payment id; equals the queried reference unless it was a merchant order.
    pub payment_id: String,
    pub status: GatewayStatus,
    pub buyer_reference: Option<String>,
    /// Asset the provider says was paid for, when the checkout recorded one.
    pub asset_reference: Option<String>,
    pub raw_detail: Option<String>,
}

impl GatewayVerdict {
    pub fn from_payment(payment: &ProviderPayment) -> Self {
        Self {
            payment_id: payment.payment_id.clone(),
            status: GatewayStatus::from_provider(&payment.status),
            buyer_reference: payment.buyer_reference(),
            asset_reference: payment.asset_reference(),
            raw_detail: payment.status_detail.clone(),
        }
    }

    pub fn unknown(reference: &str, detail: impl Into<String>) -> Self {
        Self {
            payment_id: reference.to_string(),
            status: GatewayStatus::Unknown,
            buyer_reference: None,
            asset_reference: None,
            raw_detail: Some(detail.into()),
        }
    }
}

/// Checkout preference request. The buyer id is embedded in the provider payment
/// so it can be recovered on return even if the browser session is gone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub asset_id: String,
    pub title: String,
    pub unit_price_minor: u64,
    pub quantity: u32,
    pub currency: String,
    pub buyer_id: String,
    /// Public origin of the storefront, used to build return URLs.
    pub site_url: String,
}

impl CheckoutRequest {
    pub fn return_url(&self, status: &str) -> Result<String, EntitleError> {
        let mut url = Url::parse(&self.site_url).map_err(|e| {
            EntitleError::InvalidRequest(format!("invalid site url '{}': {e}", self.site_url))
        })?;
        url.path_segments_mut()
            .map_err(|_| {
                EntitleError::InvalidRequest(format!("site url '{}' cannot carry a path", self.site_url))
            })?
            .pop_if_empty()
            .extend(["product", self.asset_id.as_str()]);
        url.query_pairs_mut()
            .append_pair("payment_status", status)
            .append_pair("model_id", &self.asset_id);
        Ok(url.into())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSession {
    pub id: String,
    pub init_point: Option<String>,
}

/// External payment provider.
///
/// `Ok(None)` means the provider answered and does not know the reference;
/// `Err` means the provider could not be consulted.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get_payment(&self, payment_id: &str) -> Result<Option<ProviderPayment>, EntitleError>;

    /// Payments attached to a merchant order; `Ok(None)` when the order is unknown.
    async fn get_merchant_order_payments(
        &self,
        order_id: &str,
    ) -> Result<Option<Vec<ProviderPayment>>, EntitleError>;

    async fn create_checkout(&self, request: &CheckoutRequest)
        -> Result<CheckoutSession, EntitleError>;
}

/// Timeout-bounded gateway client.
///
/// Never fails: outages, timeouts and unknown references all come back as
/// [`GatewayStatus::Unknown`] so callers cannot mistake them for a rejection.
#[derive(Clone)]
pub struct GatewayClient {
    gateway: Arc<dyn PaymentGateway>,
    timeout: Duration,
}

impl GatewayClient {
    pub fn new(gateway: Arc<dyn PaymentGateway>, timeout: Duration) -> Self {
        Self { gateway, timeout }
    }

    pub fn provider(&self) -> &'static str {
        self.gateway.name()
    }

    pub async fn lookup(&self, reference: &str) -> GatewayVerdict {
        match tokio::time::timeout(self.timeout, self.resolve(reference)).await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(err)) => {
                warn!(payment_ref = reference, error = %err, "gateway lookup failed");
                GatewayVerdict::unknown(reference, err.to_string())
            }
            Err(_) => {
                warn!(
                    payment_ref = reference,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "gateway lookup timed out"
                );
                GatewayVerdict::unknown(reference, "gateway lookup timed out")
            }
        }
    }

    pub async fn create_checkout(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, EntitleError> {
        match tokio::time::timeout(self.timeout, self.gateway.create_checkout(request)).await {
            Ok(result) => result,
            Err(_) => Err(EntitleError::GatewayUnavailable(
                "checkout creation timed out".to_string(),
            )),
        }
    }

    async fn resolve(&self, reference: &str) -> Result<GatewayVerdict, EntitleError> {
        if let Some(payment) = self.gateway.get_payment(reference).await? {
            return Ok(GatewayVerdict::from_payment(&payment));
        }

        let payments = self
            .gateway
            .get_merchant_order_payments(reference)
            .await?
            .unwrap_or_default();

        Ok(select_order_payment(&payments)
            .map(GatewayVerdict::from_payment)
            .unwrap_or_else(|| {
                GatewayVerdict::unknown(reference, "reference not known to gateway")
            }))
    }
}

/// An approved payment wins; otherwise the most recently updated one.
fn select_order_payment(payments: &[ProviderPayment]) -> Option<&ProviderPayment> {
    payments
        .iter()
        .find(|payment| GatewayStatus::from_provider(&payment.status) == GatewayStatus::Approved)
        .or_else(|| payments.iter().max_by_key(|payment| payment.last_updated))
}
