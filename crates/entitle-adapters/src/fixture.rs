use async_trait::async_trait;
use chrono::Utc;
use entitle_core::{CheckoutRequest, CheckoutSession, EntitleError, PaymentGateway, ProviderPayment};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default, Deserialize)]
struct FixtureSeed {
    #[serde(default)]
    payments: Vec<ProviderPayment>,
    #[serde(default)]
    merchant_orders: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Default)]
struct FixtureState {
    payments: HashMap<String, ProviderPayment>,
    orders: HashMap<String, Vec<String>>,
    checkouts: HashMap<String, CheckoutRequest>,
}

/// Deterministic in-process gateway for local runs and tests.
///
/// Checkouts are recorded so [`FixtureGateway::settle_checkout`] can turn one into a
/// payment carrying the same buyer correlation the real provider would. There is no
/// hosted payment page, so sessions carry no `init_point`.
#[derive(Debug, Default)]
pub struct FixtureGateway {
    state: RwLock<FixtureState>,
}

impl FixtureGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load payments and merchant orders from a JSON seed file.
    pub fn from_seed_file(path: &Path) -> Result<Self, EntitleError> {
        let bytes = std::fs::read(path)
            .map_err(|e| EntitleError::Storage(format!("read {}: {e}", path.display())))?;
        let seed: FixtureSeed = serde_json::from_slice(&bytes)
            .map_err(|e| EntitleError::Serialization(e.to_string()))?;

        let state = FixtureState {
            payments: seed
                .payments
                .into_iter()
                .map(|payment| (payment.payment_id.clone(), payment))
                .collect(),
            orders: seed.merchant_orders.into_iter().collect(),
            checkouts: HashMap::new(),
        };
        Ok(Self {
            state: RwLock::new(state),
        })
    }

    pub async fn insert_payment(&self, payment: ProviderPayment) {
        self.state
            .write()
            .await
            .payments
            .insert(payment.payment_id.clone(), payment);
    }

    pub async fn insert_order(&self, order_id: impl Into<String>, payment_ids: Vec<String>) {
        self.state
            .write()
            .await
            .orders
            .insert(order_id.into(), payment_ids);
    }

    /// Turn a recorded checkout into a payment with the given provider status.
    pub async fn settle_checkout(
        &self,
        preference_id: &str,
        status: &str,
    ) -> Result<ProviderPayment, EntitleError> {
        let mut state = self.state.write().await;
        let checkout = state.checkouts.get(preference_id).cloned().ok_or_else(|| {
            EntitleError::InvalidRequest(format!("unknown preference '{preference_id}'"))
        })?;

        let mut metadata = BTreeMap::new();
        metadata.insert("user_id".to_string(), checkout.buyer_id.clone());
        metadata.insert("model_id".to_string(), checkout.asset_id.clone());

        let payment = ProviderPayment {
            payment_id: format!("fx-{}", short_id()),
            status: status.to_string(),
            status_detail: None,
            external_reference: Some(checkout.buyer_id),
            metadata,
            last_updated: Some(Utc::now()),
        };
        state
            .payments
            .insert(payment.payment_id.clone(), payment.clone());
        Ok(payment)
    }
}

#[async_trait]
impl PaymentGateway for FixtureGateway {
    fn name(&self) -> &'static str {
        "fixture"
    }

    async fn get_payment(&self, payment_id: &str) -> Result<Option<ProviderPayment>, EntitleError> {
        Ok(self.state.read().await.payments.get(payment_id).cloned())
    }

    async fn get_merchant_order_payments(
        &self,
        order_id: &str,
    ) -> Result<Option<Vec<ProviderPayment>>, EntitleError> {
        let state = self.state.read().await;
        Ok(state.orders.get(order_id).map(|ids| {
            ids.iter()
                .filter_map(|id| state.payments.get(id).cloned())
                .collect()
        }))
    }

    async fn create_checkout(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, EntitleError> {
        let id = format!("fx-pref-{}", short_id());
        self.state
            .write()
            .await
            .checkouts
            .insert(id.clone(), request.clone());
        Ok(CheckoutSession {
            id,
            init_point: None,
        })
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string().chars().take(12).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use entitle_core::{GatewayClient, GatewayStatus};
    use std::sync::Arc;
    use std::time::Duration;

    fn checkout() -> CheckoutRequest {
        CheckoutRequest {
            asset_id: "m1".into(),
            title: "Bracket".into(),
            unit_price_minor: 1_000,
            quantity: 1,
            currency: "ARS".into(),
            buyer_id: "u1".into(),
            site_url: "http://localhost:5173".into(),
        }
    }

    #[tokio::test]
    async fn settled_checkout_carries_buyer() {
        let gateway = Arc::new(FixtureGateway::new());
        let session = gateway.create_checkout(&checkout()).await.unwrap();
        assert_eq!(session.init_point, None);
        let payment = gateway
            .settle_checkout(&session.id, "approved")
            .await
            .unwrap();

        let client = GatewayClient::new(gateway, Duration::from_secs(1));
        let verdict = client.lookup(&payment.payment_id).await;
        assert_eq!(verdict.status, GatewayStatus::Approved);
        assert_eq!(verdict.buyer_reference.as_deref(), Some("u1"));
        assert_eq!(verdict.asset_reference.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn unknown_preference_cannot_settle() {
        let gateway = FixtureGateway::new();
        assert!(gateway.settle_checkout("nope", "approved").await.is_err());
    }

    #[tokio::test]
    async fn seed_file_loads_payments_and_orders() {
        let dir = std::env::temp_dir().join(format!("entitle-fixture-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("seed.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "payments": [{
                    "payment_id": "pay_1",
                    "status": "approved",
                    "status_detail": null,
                    "external_reference": "u1",
                    "metadata": {},
                    "last_updated": null
                }],
                "merchant_orders": { "order-1": ["pay_1"] }
            })
            .to_string(),
        )
        .unwrap();

        let gateway = FixtureGateway::from_seed_file(&path).unwrap();
        let order = gateway
            .get_merchant_order_payments("order-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.len(), 1);
        assert_eq!(order[0].payment_id, "pay_1");

        let _ = std::fs::remove_dir_all(dir);
    }
}
