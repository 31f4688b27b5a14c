//! Verification orchestrator: sequences gateway lookup, ledger write, asset lookup
//! and credential issuance for one payment reference.
//!
//! Failures before the gateway confirms a payment produce rejection-shaped outcomes.
//! Failures after confirmation degrade into an approval with warnings.

use crate::catalog::AssetCatalog;
use crate::credentials::{
    CredentialIssuer, CredentialSource, DownloadCredential, UrlSigner, DEFAULT_CREDENTIAL_TTL,
};
use crate::error::EntitleError;
use crate::flow::VerificationStageMachine;
use crate::gateway::{
    CheckoutRequest, CheckoutSession, GatewayClient, GatewayStatus, GatewayVerdict, PaymentGateway,
};
use crate::ledger::{
    manual_payment_ref, EntitlementCheck, EntitlementLedger, LedgerStats, LedgerStore,
    LedgerSubscription,
};
use crate::types::{
    AssetRecord, AssetSummary, EntitlementRecord, PaymentMethod, DEFAULT_COMMISSION_BPS,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const MISSING_FIELDS_MESSAGE: &str = "Missing paymentReference or assetId";
pub const VERIFIED_MESSAGE: &str = "Payment verified successfully";
pub const SUPPORT_MESSAGE: &str = "Payment confirmed, but the download link could not be generated. \
     Please contact support with your payment reference.";

const LEDGER_WARNING: &str = "Purchase record could not be saved; it will be reconciled by support";
const RECENT_LIMIT_MAX: usize = 200;

#[derive(Debug, Clone)]
pub struct VerificationConfig {
    pub commission_bps: u32,
    pub credential_ttl: Duration,
    pub gateway_timeout: Duration,
    pub bucket: String,
    /// Origin of the storage service, used for the unsigned fallback URL.
    pub public_base_url: Option<String>,
    pub currency: String,
    /// Public storefront origin for checkout return URLs.
    pub site_url: String,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            commission_bps: DEFAULT_COMMISSION_BPS,
            credential_ttl: DEFAULT_CREDENTIAL_TTL,
            gateway_timeout: Duration::from_secs(10),
            bucket: "models".to_string(),
            public_base_url: None,
            currency: "ARS".to_string(),
            site_url: "http://localhost:5173".to_string(),
        }
    }
}

/// One verification attempt as submitted by the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    /// Provider payment id or merchant-order id.
    pub payment_reference: String,
    pub asset_id: String,
}

impl VerifyRequest {
    pub fn new(payment_reference: impl Into<String>, asset_id: impl Into<String>) -> Self {
        Self {
            payment_reference: payment_reference.into(),
            asset_id: asset_id.into(),
        }
    }

    fn validated(&self) -> Result<Self, EntitleError> {
        let payment_reference = self.payment_reference.trim();
        let asset_id = self.asset_id.trim();
        if payment_reference.is_empty() || asset_id.is_empty() {
            return Err(EntitleError::InvalidRequest(MISSING_FIELDS_MESSAGE.to_string()));
        }
        Ok(Self::new(payment_reference, asset_id))
    }
}

/// Approval-shaped result. `download_url` is `None` in degraded mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EntitledReceipt {
    pub payment_id: String,
    pub asset_id: String,
    pub download_url: Option<String>,
    pub filename: Option<String>,
    pub message: String,
    pub asset: Option<AssetSummary>,
    pub credential_source: Option<CredentialSource>,
    pub expires_at: Option<DateTime<Utc>>,
    pub warnings: Vec<String>,
    /// Ledger row backing the entitlement; absent when the write failed.
    pub record: Option<EntitlementRecord>,
}

impl EntitledReceipt {
    pub fn is_degraded(&self) -> bool {
        self.download_url.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    Entitled(EntitledReceipt),
    NotApproved {
        status: GatewayStatus,
        detail: Option<String>,
        retryable: bool,
    },
    /// Approved payment without a buyer correlation; needs support escalation.
    MissingBuyerReference { payment_id: String },
    /// Approved payment whose checkout or ledger row names a different asset.
    AssetMismatch {
        payment_id: String,
        paid_asset: String,
    },
}

impl VerificationOutcome {
    pub fn is_entitled(&self) -> bool {
        matches!(self, Self::Entitled(_))
    }
}

/// Verification surface the client controller talks to, in-process or over HTTP.
#[async_trait]
pub trait VerificationApi: Send + Sync {
    async fn verify(&self, request: &VerifyRequest) -> Result<VerificationOutcome, EntitleError>;

    async fn check_entitlement(
        &self,
        buyer_id: &str,
        asset_id: &str,
    ) -> Result<EntitlementCheck, EntitleError>;
}

pub struct VerificationEngine {
    gateway: GatewayClient,
    ledger: EntitlementLedger,
    catalog: Arc<dyn AssetCatalog>,
    issuer: CredentialIssuer,
    config: VerificationConfig,
}

impl VerificationEngine {
    pub fn new(
        config: VerificationConfig,
        gateway: Arc<dyn PaymentGateway>,
        store: Arc<dyn LedgerStore>,
        catalog: Arc<dyn AssetCatalog>,
        signer: Arc<dyn UrlSigner>,
    ) -> Self {
        let issuer = CredentialIssuer::new(
            signer,
            config.bucket.clone(),
            config.public_base_url.clone(),
            config.credential_ttl,
        );
        Self {
            gateway: GatewayClient::new(gateway, config.gateway_timeout),
            ledger: EntitlementLedger::with_commission(store, config.commission_bps),
            catalog,
            issuer,
            config,
        }
    }

    pub fn config(&self) -> &VerificationConfig {
        &self.config
    }

    pub fn ledger(&self) -> &EntitlementLedger {
        &self.ledger
    }

    pub fn gateway_provider(&self) -> &'static str {
        self.gateway.provider()
    }

    pub async fn verify(&self, request: &VerifyRequest) -> Result<VerificationOutcome, EntitleError> {
        let request = request.validated()?;
        let mut stages = VerificationStageMachine::new(&request.payment_reference);

        let verdict = self.gateway.lookup(&request.payment_reference).await;
        stages.mark_gateway_checked()?;

        if verdict.status != GatewayStatus::Approved {
            stages.mark_rejected()?;
            stages.mark_responded()?;
            let rejection = EntitleError::PaymentNotApproved {
                status: verdict.status.as_str().to_string(),
                detail: verdict.raw_detail.clone(),
            };
            info!(
                payment_id = %request.payment_reference,
                asset_id = %request.asset_id,
                error = %rejection,
                "payment not approved"
            );
            return Ok(VerificationOutcome::NotApproved {
                status: verdict.status,
                detail: verdict.raw_detail,
                retryable: verdict.status.is_retryable(),
            });
        }

        let Some(buyer_id) = verdict.buyer_reference.clone() else {
            stages.mark_rejected()?;
            stages.mark_responded()?;
            let rejection = EntitleError::MissingBuyerReference(verdict.payment_id.clone());
            error!(
                payment_id = %verdict.payment_id,
                asset_id = %request.asset_id,
                error = %rejection,
                "approved payment carries no buyer reference"
            );
            return Ok(VerificationOutcome::MissingBuyerReference {
                payment_id: verdict.payment_id,
            });
        };

        if let Some(paid_asset) = verdict
            .asset_reference
            .as_deref()
            .filter(|paid| *paid != request.asset_id)
        {
            stages.mark_rejected()?;
            stages.mark_responded()?;
            return Ok(asset_mismatch(&verdict.payment_id, &request.asset_id, paid_asset));
        }

        // Past this point the payment is confirmed: every failure degrades.
        let Settlement {
            asset,
            record,
            mut warnings,
        } = match self.spawn_settlement(&verdict, &buyer_id, &request.asset_id).await {
            Ok(settlement) => settlement,
            Err(err) => {
                error!(
                    payment_id = %verdict.payment_id,
                    asset_id = %request.asset_id,
                    buyer_id = %buyer_id,
                    error = %err,
                    "settlement task aborted after approval"
                );
                Settlement {
                    asset: None,
                    record: None,
                    warnings: vec![LEDGER_WARNING.to_string()],
                }
            }
        };
        stages.mark_ledger_written()?;

        if let Some(existing) = record.as_ref().filter(|r| r.asset_id != request.asset_id) {
            stages.mark_rejected()?;
            stages.mark_responded()?;
            return Ok(asset_mismatch(
                &verdict.payment_id,
                &request.asset_id,
                &existing.asset_id,
            ));
        }

        let credential = match &asset {
            Some(asset) => match self.issuer.issue(asset).await {
                Ok(credential) => Some(credential),
                Err(err) => {
                    error!(
                        payment_id = %verdict.payment_id,
                        asset_id = %asset.asset_id,
                        error = %err,
                        "download credential could not be issued"
                    );
                    warnings.push(format!("Download link unavailable: {err}"));
                    None
                }
            },
            None => None,
        };
        stages.mark_credential_issued()?;
        stages.mark_responded()?;

        info!(
            payment_id = %verdict.payment_id,
            asset_id = %request.asset_id,
            buyer_id = %buyer_id,
            degraded = credential.is_none(),
            "payment verified"
        );

        Ok(VerificationOutcome::Entitled(build_receipt(
            verdict.payment_id,
            request.asset_id,
            asset.as_ref(),
            credential,
            record,
            warnings,
        )))
    }

    /// Asset lookup and ledger upsert run together on their own task so a client
    /// abandoning the request cannot cancel them halfway.
    fn spawn_settlement(
        &self,
        verdict: &GatewayVerdict,
        buyer_id: &str,
        asset_id: &str,
    ) -> JoinHandle<Settlement> {
        let catalog = Arc::clone(&self.catalog);
        let ledger = self.ledger.clone();
        let payment_id = verdict.payment_id.clone();
        let buyer_id = buyer_id.to_string();
        let asset_id = asset_id.to_string();

        tokio::spawn(async move { settle(catalog, ledger, payment_id, buyer_id, asset_id).await })
    }

    pub async fn check_entitlement(
        &self,
        buyer_id: &str,
        asset_id: &str,
    ) -> Result<EntitlementCheck, EntitleError> {
        let asset = self.catalog.resolve(asset_id).await?;
        self.ledger.check(buyer_id, &asset).await
    }

    /// Open a pending row for an off-platform payment.
    pub async fn record_manual_purchase(
        &self,
        buyer_id: &str,
        asset_id: &str,
        country: Option<&str>,
    ) -> Result<EntitlementRecord, EntitleError> {
        if buyer_id.trim().is_empty() {
            return Err(EntitleError::InvalidRequest("buyerId is required".to_string()));
        }
        let asset = self.catalog.resolve(asset_id).await?;
        if asset.is_free() {
            return Err(EntitleError::InvalidRequest(format!(
                "asset '{asset_id}' is free and needs no purchase"
            )));
        }
        if self.ledger.has_entitlement(buyer_id, &asset).await? {
            return Err(EntitleError::InvalidRequest(format!(
                "buyer '{buyer_id}' already owns asset '{asset_id}'"
            )));
        }

        self.ledger
            .record_pending_manual(
                buyer_id,
                &asset.asset_id,
                asset.price_minor,
                &manual_payment_ref(),
                PaymentMethod::for_country(country),
            )
            .await
    }

    pub async fn confirm_purchase(&self, record_id: Uuid) -> Result<EntitlementRecord, EntitleError> {
        self.ledger.confirm_pending(record_id).await
    }

    pub async fn reject_purchase(&self, record_id: Uuid) -> Result<EntitlementRecord, EntitleError> {
        self.ledger.reject_pending(record_id).await
    }

    /// Create a provider checkout with the buyer embedded for correlation on return.
    pub async fn create_checkout(
        &self,
        buyer_id: &str,
        asset_id: &str,
    ) -> Result<CheckoutSession, EntitleError> {
        if buyer_id.trim().is_empty() {
            return Err(EntitleError::InvalidRequest("buyerId is required".to_string()));
        }
        let asset = self.catalog.resolve(asset_id).await?;
        if asset.is_free() {
            return Err(EntitleError::InvalidRequest(format!(
                "asset '{asset_id}' is free and cannot be checked out"
            )));
        }

        let request = CheckoutRequest {
            asset_id: asset.asset_id.clone(),
            title: asset.title.clone(),
            unit_price_minor: asset.price_minor,
            quantity: 1,
            currency: self.config.currency.clone(),
            buyer_id: buyer_id.to_string(),
            site_url: self.config.site_url.clone(),
        };
        let session = self.gateway.create_checkout(&request).await?;
        info!(
            asset_id,
            buyer_id,
            preference_id = %session.id,
            "checkout created"
        );
        Ok(session)
    }

    pub async fn recent_transactions(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<EntitlementRecord>, EntitleError> {
        let limit = limit.unwrap_or(20).clamp(1, RECENT_LIMIT_MAX);
        self.ledger.recent(limit).await
    }

    pub async fn stats(&self) -> Result<LedgerStats, EntitleError> {
        self.ledger.stats().await
    }

    pub fn subscribe(&self, buyer_id: impl Into<String>) -> LedgerSubscription {
        self.ledger.subscribe(buyer_id)
    }
}

#[async_trait]
impl VerificationApi for VerificationEngine {
    async fn verify(&self, request: &VerifyRequest) -> Result<VerificationOutcome, EntitleError> {
        VerificationEngine::verify(self, request).await
    }

    async fn check_entitlement(
        &self,
        buyer_id: &str,
        asset_id: &str,
    ) -> Result<EntitlementCheck, EntitleError> {
        VerificationEngine::check_entitlement(self, buyer_id, asset_id).await
    }
}

/// Result of the post-approval asset lookup and ledger write.
struct Settlement {
    asset: Option<AssetRecord>,
    record: Option<EntitlementRecord>,
    warnings: Vec<String>,
}

async fn settle(
    catalog: Arc<dyn AssetCatalog>,
    ledger: EntitlementLedger,
    payment_id: String,
    buyer_id: String,
    asset_id: String,
) -> Settlement {
    let mut warnings = Vec::new();

    let asset = match catalog.resolve(&asset_id).await {
        Ok(asset) => asset,
        Err(err) => {
            error!(
                payment_id = %payment_id,
                asset_id = %asset_id,
                buyer_id = %buyer_id,
                error = %err,
                "asset lookup failed after approval"
            );
            warnings.push(format!("Asset lookup failed: {err}"));
            return Settlement {
                asset: None,
                record: None,
                warnings,
            };
        }
    };

    let record = match ledger
        .upsert_on_approval(
            &payment_id,
            &buyer_id,
            &asset.asset_id,
            asset.price_minor,
            PaymentMethod::Mercadopago,
        )
        .await
    {
        Ok(outcome) => Some(outcome.into_record()),
        Err(err) => {
            warn!(
                payment_id = %payment_id,
                asset_id = %asset.asset_id,
                buyer_id = %buyer_id,
                error = %err,
                "ledger write failed after approval, granting download"
            );
            warnings.push(LEDGER_WARNING.to_string());
            None
        }
    };

    Settlement {
        asset: Some(asset),
        record,
        warnings,
    }
}

fn asset_mismatch(payment_id: &str, requested: &str, paid_asset: &str) -> VerificationOutcome {
    let rejection = EntitleError::AssetMismatch {
        payment_id: payment_id.to_string(),
        paid_asset: paid_asset.to_string(),
    };
    error!(
        payment_id,
        asset_id = requested,
        error = %rejection,
        "approved payment belongs to another asset"
    );
    VerificationOutcome::AssetMismatch {
        payment_id: payment_id.to_string(),
        paid_asset: paid_asset.to_string(),
    }
}

fn build_receipt(
    payment_id: String,
    asset_id: String,
    asset: Option<&AssetRecord>,
    credential: Option<DownloadCredential>,
    record: Option<EntitlementRecord>,
    warnings: Vec<String>,
) -> EntitledReceipt {
    let filename = credential
        .as_ref()
        .and_then(|c| c.filename.clone())
        .or_else(|| asset.and_then(AssetRecord::filename));
    let message = if credential.is_some() {
        VERIFIED_MESSAGE
    } else {
        SUPPORT_MESSAGE
    };

    EntitledReceipt {
        payment_id,
        asset_id,
        download_url: credential.as_ref().map(|c| c.url.clone()),
        filename,
        message: message.to_string(),
        asset: asset.map(AssetRecord::summary),
        credential_source: credential.as_ref().map(|c| c.source),
        expires_at: credential.as_ref().map(|c| c.expires_at),
        warnings,
        record,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryAssetCatalog;
    use crate::credentials::Blake3UrlSigner;
    use crate::gateway::ProviderPayment;
    use crate::ledger::LedgerEvent;
    use crate::storage::MemoryLedgerStore;
    use crate::types::RecordStatus;
    use std::collections::{BTreeMap, HashMap};

    struct ScriptedGateway {
        payments: HashMap<String, ProviderPayment>,
    }

    impl ScriptedGateway {
        fn with(payments: Vec<(&str, &str, Option<&str>)>) -> Self {
            Self {
                payments: payments
                    .into_iter()
                    .map(|(id, status, buyer)| {
                        (
                            id.to_string(),
                            ProviderPayment {
                                payment_id: id.to_string(),
                                status: status.to_string(),
                                status_detail: Some(format!("{status}_detail")),
                                external_reference: buyer.map(str::to_string),
                                metadata: BTreeMap::new(),
                                last_updated: None,
                            },
                        )
                    })
                    .collect(),
            }
        }

        fn paid_for(mut self, payment_id: &str, asset_id: &str) -> Self {
            if let Some(payment) = self.payments.get_mut(payment_id) {
                payment
                    .metadata
                    .insert("model_id".to_string(), asset_id.to_string());
            }
            self
        }
    }

    struct SlowCatalog {
        inner: MemoryAssetCatalog,
        delay: Duration,
    }

    #[async_trait]
    impl AssetCatalog for SlowCatalog {
        async fn resolve(&self, asset_id: &str) -> Result<AssetRecord, EntitleError> {
            tokio::time::sleep(self.delay).await;
            self.inner.resolve(asset_id).await
        }
    }

    #[async_trait]
    impl PaymentGateway for ScriptedGateway {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn get_payment(
            &self,
            payment_id: &str,
        ) -> Result<Option<ProviderPayment>, EntitleError> {
            Ok(self.payments.get(payment_id).cloned())
        }

        async fn get_merchant_order_payments(
            &self,
            _order_id: &str,
        ) -> Result<Option<Vec<ProviderPayment>>, EntitleError> {
            Ok(None)
        }

        async fn create_checkout(
            &self,
            request: &CheckoutRequest,
        ) -> Result<CheckoutSession, EntitleError> {
            Ok(CheckoutSession {
                id: format!("pref-{}-{}", request.asset_id, request.buyer_id),
                init_point: Some(request.return_url("approved")?),
            })
        }
    }

    fn bracket(price_minor: u64) -> AssetRecord {
        AssetRecord {
            asset_id: "m1".into(),
            title: "Bracket".into(),
            price_minor,
            owner_id: "seller".into(),
            storage_path: "seller/bracket.stl".into(),
        }
    }

    fn priced(asset_id: &str, price_minor: u64) -> AssetRecord {
        AssetRecord {
            asset_id: asset_id.into(),
            title: asset_id.into(),
            price_minor,
            owner_id: "seller".into(),
            storage_path: format!("seller/{asset_id}.stl"),
        }
    }

    fn engine(gateway: ScriptedGateway, assets: Vec<AssetRecord>) -> VerificationEngine {
        VerificationEngine::new(
            VerificationConfig::default(),
            Arc::new(gateway),
            Arc::new(MemoryLedgerStore::new()),
            Arc::new(MemoryAssetCatalog::with_assets(assets)),
            Arc::new(Blake3UrlSigner::new("https://files.example", "secret")),
        )
    }

    #[tokio::test]
    async fn approved_payment_is_recorded_and_credentialed() {
        let engine = engine(
            ScriptedGateway::with(vec![("pay_1", "approved", Some("u1"))]),
            vec![bracket(2_000)],
        );

        let outcome = engine.verify(&VerifyRequest::new("pay_1", "m1")).await.unwrap();
        let VerificationOutcome::Entitled(receipt) = outcome else {
            panic!("expected entitlement");
        };
        assert!(receipt.download_url.is_some());
        assert_eq!(receipt.filename.as_deref(), Some("bracket.stl"));
        assert_eq!(receipt.message, VERIFIED_MESSAGE);
        assert!(receipt.warnings.is_empty());

        let record = receipt.record.unwrap();
        assert_eq!(record.buyer_id, "u1");
        assert_eq!(record.status, RecordStatus::Completed);
        assert_eq!(record.platform_fee_minor, 200);
        assert_eq!(record.seller_earnings_minor, 1_800);
    }

    #[tokio::test]
    async fn pending_payment_is_retryable_rejection() {
        let engine = engine(
            ScriptedGateway::with(vec![("pay_p", "in_process", Some("u1"))]),
            vec![bracket(2_000)],
        );
        let outcome = engine.verify(&VerifyRequest::new("pay_p", "m1")).await.unwrap();
        assert_eq!(
            outcome,
            VerificationOutcome::NotApproved {
                status: GatewayStatus::Pending,
                detail: Some("in_process_detail".into()),
                retryable: true,
            }
        );
        assert!(engine.recent_transactions(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_reference_is_not_a_rejection() {
        let engine = engine(ScriptedGateway::with(vec![]), vec![bracket(2_000)]);
        let outcome = engine.verify(&VerifyRequest::new("pay_zz", "m1")).await.unwrap();
        assert!(matches!(
            outcome,
            VerificationOutcome::NotApproved {
                status: GatewayStatus::Unknown,
                retryable: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn approved_without_buyer_is_integrity_failure() {
        let engine = engine(
            ScriptedGateway::with(vec![("pay_nb", "approved", None)]),
            vec![bracket(2_000)],
        );
        let outcome = engine.verify(&VerifyRequest::new("pay_nb", "m1")).await.unwrap();
        assert_eq!(
            outcome,
            VerificationOutcome::MissingBuyerReference {
                payment_id: "pay_nb".into()
            }
        );
        assert!(engine.recent_transactions(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_asset_after_approval_degrades() {
        let engine = engine(
            ScriptedGateway::with(vec![("pay_1", "approved", Some("u1"))]),
            vec![],
        );
        let outcome = engine.verify(&VerifyRequest::new("pay_1", "m404")).await.unwrap();
        let VerificationOutcome::Entitled(receipt) = outcome else {
            panic!("expected degraded entitlement");
        };
        assert!(receipt.is_degraded());
        assert!(receipt.record.is_none());
        assert_eq!(receipt.message, SUPPORT_MESSAGE);
        assert_eq!(receipt.warnings.len(), 1);
    }

    #[tokio::test]
    async fn blank_fields_are_invalid() {
        let engine = engine(ScriptedGateway::with(vec![]), vec![]);
        let err = engine.verify(&VerifyRequest::new(" ", "m1")).await.unwrap_err();
        assert!(matches!(err, EntitleError::InvalidRequest(msg) if msg == MISSING_FIELDS_MESSAGE));
    }

    #[tokio::test]
    async fn manual_purchase_lifecycle() {
        let engine = engine(ScriptedGateway::with(vec![]), vec![bracket(2_000)]);
        let mut live = engine.subscribe("u1");

        let pending = engine
            .record_manual_purchase("u1", "m1", Some("Argentina"))
            .await
            .unwrap();
        assert_eq!(pending.status, RecordStatus::Pending);
        assert_eq!(pending.payment_method, PaymentMethod::Mercadopago);
        assert!(pending.payment_id.starts_with("manual_"));
        assert!(engine.check_entitlement("u1", "m1").await.unwrap().pending);

        engine.confirm_purchase(pending.id).await.unwrap();
        assert!(engine.check_entitlement("u1", "m1").await.unwrap().entitled);

        assert!(matches!(live.next().await, Some(LedgerEvent::Inserted { .. })));
        assert!(matches!(
            live.next().await,
            Some(LedgerEvent::StatusChanged {
                previous: RecordStatus::Pending,
                ..
            })
        ));

        let err = engine
            .record_manual_purchase("u1", "m1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, EntitleError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn free_assets_cannot_be_checked_out() {
        let engine = engine(ScriptedGateway::with(vec![]), vec![bracket(0)]);
        let err = engine.create_checkout("u1", "m1").await.unwrap_err();
        assert!(matches!(err, EntitleError::InvalidRequest(_)));
        assert!(engine.check_entitlement("anyone", "m1").await.unwrap().entitled);
    }

    #[tokio::test]
    async fn checkout_embeds_buyer() {
        let engine = engine(ScriptedGateway::with(vec![]), vec![bracket(2_000)]);
        let session = engine.create_checkout("u1", "m1").await.unwrap();
        assert_eq!(session.id, "pref-m1-u1");
    }

    #[tokio::test]
    async fn recent_limit_is_clamped() {
        let engine = engine(
            ScriptedGateway::with(vec![("pay_1", "approved", Some("u1"))]),
            vec![bracket(2_000)],
        );
        engine.verify(&VerifyRequest::new("pay_1", "m1")).await.unwrap();
        assert_eq!(engine.recent_transactions(Some(0)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn payment_for_another_asset_is_refused() {
        let engine = engine(
            ScriptedGateway::with(vec![("pay_1", "approved", Some("u1"))]).paid_for("pay_1", "cheap"),
            vec![priced("cheap", 100), priced("pricey", 90_000)],
        );

        let outcome = engine
            .verify(&VerifyRequest::new("pay_1", "pricey"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            VerificationOutcome::AssetMismatch {
                payment_id: "pay_1".into(),
                paid_asset: "cheap".into(),
            }
        );
        assert!(engine.recent_transactions(None).await.unwrap().is_empty());
        assert!(!engine.check_entitlement("u1", "pricey").await.unwrap().entitled);

        let outcome = engine.verify(&VerifyRequest::new("pay_1", "cheap")).await.unwrap();
        assert!(outcome.is_entitled());
    }

    #[tokio::test]
    async fn existing_row_for_another_asset_withholds_credential() {
        let engine = engine(
            ScriptedGateway::with(vec![("pay_1", "approved", Some("u1"))]),
            vec![priced("cheap", 100), priced("pricey", 90_000)],
        );
        assert!(engine
            .verify(&VerifyRequest::new("pay_1", "cheap"))
            .await
            .unwrap()
            .is_entitled());

        let outcome = engine
            .verify(&VerifyRequest::new("pay_1", "pricey"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            VerificationOutcome::AssetMismatch {
                payment_id: "pay_1".into(),
                paid_asset: "cheap".into(),
            }
        );
        let rows = engine.recent_transactions(None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].asset_id, "cheap");
    }

    #[tokio::test]
    async fn abandoned_verification_still_records_purchase() {
        let engine = Arc::new(VerificationEngine::new(
            VerificationConfig::default(),
            Arc::new(ScriptedGateway::with(vec![("pay_1", "approved", Some("u1"))])),
            Arc::new(MemoryLedgerStore::new()),
            Arc::new(SlowCatalog {
                inner: MemoryAssetCatalog::with_assets(vec![bracket(2_000)]),
                delay: Duration::from_millis(100),
            }),
            Arc::new(Blake3UrlSigner::new("https://files.example", "secret")),
        ));

        let request = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.verify(&VerifyRequest::new("pay_1", "m1")).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        request.abort();
        assert!(request.await.unwrap_err().is_cancelled());

        tokio::time::sleep(Duration::from_millis(300)).await;
        let rows = engine.recent_transactions(None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].payment_id, "pay_1");
        assert_eq!(rows[0].status, RecordStatus::Completed);
    }
}
