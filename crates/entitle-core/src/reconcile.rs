//! Client-side reconciliation of a payment redirect into `verifying`, `approved` or
//! `rejected`.
//!
//! Two producers feed one reducer: the direct verification call and the live ledger
//! subscription. The local cache only ever produces a provisional approval.

use crate::error::EntitleError;
use crate::gateway::GatewayStatus;
use crate::ledger::{LedgerEvent, LedgerSubscription};
use crate::orchestrator::{VerificationApi, VerificationOutcome, VerifyRequest};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

pub const LAST_ASSET_KEY: &str = "last_attempted_asset";

const REJECTED_MESSAGE: &str = "Payment was not approved. You can try paying again.";
const NO_CONTEXT_MESSAGE: &str =
    "Payment information is missing. If you were charged, please contact support.";
const INTEGRITY_MESSAGE: &str =
    "We could not match this payment to your account. Please contact support.";
const NOT_ENTITLED_MESSAGE: &str = "No completed purchase was found for this item.";
const CONFIRMED_CAPTION: &str =
    "Purchase confirmed. Open the product page to download your file.";

pub fn purchased_key(asset_id: &str) -> String {
    format!("purchased_{asset_id}")
}

/// Query parameters of a gateway return URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedirectParams {
    pub payment_id: Option<String>,
    pub merchant_order_id: Option<String>,
    pub asset_id: Option<String>,
    pub status_token: Option<String>,
}

impl RedirectParams {
    /// Accepts already-decoded query pairs. Empty and `null` values are ignored.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let values: HashMap<String, String> = pairs
            .into_iter()
            .filter_map(|(key, value)| {
                let value: String = value.into();
                let value = value.trim().to_string();
                (!value.is_empty() && value != "null").then(|| (key.into(), value))
            })
            .collect();
        let pick = |keys: &[&str]| keys.iter().find_map(|key| values.get(*key).cloned());

        Self {
            payment_id: pick(&["payment_id", "collection_id"]),
            merchant_order_id: pick(&["merchant_order_id"]),
            asset_id: pick(&["model_id", "asset_id"]),
            status_token: pick(&["payment_status", "status", "collection_status"]),
        }
    }

    /// Payment id if present, otherwise the merchant order id.
    pub fn payment_reference(&self) -> Option<&str> {
        self.payment_id
            .as_deref()
            .or(self.merchant_order_id.as_deref())
    }

    pub fn status_hint(&self) -> Option<GatewayStatus> {
        self.status_token
            .as_deref()
            .map(GatewayStatus::from_provider)
            .filter(|status| *status != GatewayStatus::Unknown)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReconcileState {
    Verifying,
    Approved {
        download_url: Option<String>,
        filename: Option<String>,
        /// Rendered from the local cache; not yet confirmed by the server.
        provisional: bool,
        caption: Option<String>,
    },
    Rejected {
        message: String,
        caption: Option<String>,
    },
}

impl ReconcileState {
    pub fn is_confirmed(&self) -> bool {
        matches!(
            self,
            Self::Approved {
                provisional: false,
                ..
            }
        )
    }

    pub fn is_settled(&self) -> bool {
        self.is_confirmed() || matches!(self, Self::Rejected { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileEvent {
    CachedDownload {
        download_url: String,
    },
    RedirectRejected {
        status: String,
    },
    Verified {
        download_url: Option<String>,
        filename: Option<String>,
        message: String,
        warnings: Vec<String>,
    },
    NotApproved {
        status: GatewayStatus,
        detail: Option<String>,
        retryable: bool,
    },
    /// Approved payment that cannot be tied to this buyer and asset.
    IntegrityFailure,
    LedgerConfirmed {
        payment_id: String,
    },
    EntitlementConfirmed,
    NotEntitled,
    NoContext,
    /// Nothing learned: transport failure, pending row, or retryable gateway answer.
    Inconclusive {
        reason: String,
    },
}

/// Single state-update function for every producer.
///
/// Events for an asset other than the displayed one are ignored. A server-confirmed
/// approval is never downgraded.
pub fn reduce(
    state: &ReconcileState,
    displayed_asset: &str,
    event_asset: &str,
    event: &ReconcileEvent,
) -> ReconcileState {
    if displayed_asset != event_asset {
        return state.clone();
    }

    match event {
        ReconcileEvent::CachedDownload { download_url } => match state {
            ReconcileState::Verifying => ReconcileState::Approved {
                download_url: Some(download_url.clone()),
                filename: None,
                provisional: true,
                caption: None,
            },
            _ => state.clone(),
        },
        ReconcileEvent::Verified {
            download_url,
            filename,
            message,
            warnings,
        } => {
            let caption = if download_url.is_none() {
                Some(message.clone())
            } else if warnings.is_empty() {
                None
            } else {
                Some(warnings.join("; "))
            };
            ReconcileState::Approved {
                download_url: download_url.clone(),
                filename: filename.clone(),
                provisional: false,
                caption,
            }
        }
        ReconcileEvent::LedgerConfirmed { .. } | ReconcileEvent::EntitlementConfirmed => {
            match state {
                ReconcileState::Approved {
                    provisional: false, ..
                } => state.clone(),
                ReconcileState::Approved {
                    download_url,
                    filename,
                    ..
                } => ReconcileState::Approved {
                    download_url: download_url.clone(),
                    filename: filename.clone(),
                    provisional: false,
                    caption: None,
                },
                _ => ReconcileState::Approved {
                    download_url: None,
                    filename: None,
                    provisional: false,
                    caption: Some(CONFIRMED_CAPTION.to_string()),
                },
            }
        }
        ReconcileEvent::NotApproved {
            retryable: true, ..
        }
        | ReconcileEvent::Inconclusive { .. } => state.clone(),
        ReconcileEvent::NotApproved { status, detail, .. } => reject(
            state,
            REJECTED_MESSAGE,
            detail.clone().or_else(|| Some(status.as_str().to_string())),
        ),
        ReconcileEvent::RedirectRejected { status } => {
            reject(state, REJECTED_MESSAGE, Some(status.clone()))
        }
        ReconcileEvent::IntegrityFailure => reject(state, INTEGRITY_MESSAGE, None),
        ReconcileEvent::NotEntitled => reject(state, NOT_ENTITLED_MESSAGE, None),
        ReconcileEvent::NoContext => match state {
            ReconcileState::Approved { .. } => state.clone(),
            _ => reject(state, NO_CONTEXT_MESSAGE, None),
        },
    }
}

fn reject(state: &ReconcileState, message: &str, caption: Option<String>) -> ReconcileState {
    if state.is_confirmed() {
        return state.clone();
    }
    ReconcileState::Rejected {
        message: message.to_string(),
        caption,
    }
}

/// Ledger events that prove a purchase succeeded.
fn confirmation_for(event: &LedgerEvent) -> Option<ReconcileEvent> {
    let record = event.record();
    record
        .status
        .is_success()
        .then(|| ReconcileEvent::LedgerConfirmed {
            payment_id: record.payment_id.clone(),
        })
}

/// String key-value store that survives page reloads. A recovery hint only.
pub trait ClientCache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str) -> Result<(), EntitleError>;
}

#[derive(Debug, Default)]
pub struct MemoryClientCache {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryClientCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClientCache for MemoryClientCache {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), EntitleError> {
        self.entries
            .lock()
            .map_err(|_| EntitleError::Storage("client cache lock poisoned".to_string()))?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// JSON file cache, rewritten through a temp file and rename on every set.
#[derive(Debug)]
pub struct FileClientCache {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileClientCache {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, EntitleError> {
        let path = path.into();
        let entries = if path.exists() {
            let bytes = fs::read(&path).map_err(|e| EntitleError::Storage(e.to_string()))?;
            if bytes.is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_slice(&bytes)
                    .map_err(|e| EntitleError::Serialization(e.to_string()))?
            }
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), EntitleError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| EntitleError::Storage(e.to_string()))?;
        }

        let bytes = serde_json::to_vec_pretty(entries)
            .map_err(|e| EntitleError::Serialization(e.to_string()))?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, bytes).map_err(|e| EntitleError::Storage(e.to_string()))?;
        fs::rename(tmp_path, &self.path).map_err(|e| EntitleError::Storage(e.to_string()))?;
        Ok(())
    }
}

impl ClientCache for FileClientCache {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), EntitleError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| EntitleError::Storage("client cache lock poisoned".to_string()))?;
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries)
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// How long to keep listening for a live confirmation after mount.
    pub listen_window: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen_window: Duration::from_secs(30),
        }
    }
}

pub struct ReconciliationController {
    api: Arc<dyn VerificationApi>,
    cache: Arc<dyn ClientCache>,
    config: ControllerConfig,
    state: watch::Sender<ReconcileState>,
}

impl ReconciliationController {
    pub fn new(
        api: Arc<dyn VerificationApi>,
        cache: Arc<dyn ClientCache>,
        config: ControllerConfig,
    ) -> Self {
        let (state, _) = watch::channel(ReconcileState::Verifying);
        Self {
            api,
            cache,
            config,
            state,
        }
    }

    pub fn watch(&self) -> watch::Receiver<ReconcileState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ReconcileState {
        self.state.borrow().clone()
    }

    /// Drive one mount of the payment-return page.
    ///
    /// Returns when the state is settled and verification has finished, or when the
    /// listen window closes. A retryable outcome leaves the state `Verifying`.
    pub async fn run(
        &self,
        params: RedirectParams,
        buyer_id: Option<&str>,
        live: Option<LedgerSubscription>,
    ) -> ReconcileState {
        self.state.send_replace(ReconcileState::Verifying);

        let Some(asset_id) = params
            .asset_id
            .clone()
            .or_else(|| self.cache.get(LAST_ASSET_KEY))
        else {
            warn!("payment return without asset id or cached context");
            self.apply("", "", &ReconcileEvent::NoContext);
            return self.state();
        };

        if let Err(err) = self.cache.set(LAST_ASSET_KEY, &asset_id) {
            warn!(asset_id = %asset_id, error = %err, "could not cache last attempted asset");
        }
        if let Some(download_url) = self.cache.get(&purchased_key(&asset_id)) {
            self.apply(
                &asset_id,
                &asset_id,
                &ReconcileEvent::CachedDownload { download_url },
            );
        }
        if params.status_hint() == Some(GatewayStatus::Rejected) {
            let status = params.status_token.clone().unwrap_or_default();
            self.apply(&asset_id, &asset_id, &ReconcileEvent::RedirectRejected { status });
        }

        let mut live = live;
        let mut live_open = live.is_some();
        let mut verified = false;
        let verification = self.verify_once(&params, &asset_id, buyer_id);
        let deadline = tokio::time::sleep(self.config.listen_window);
        tokio::pin!(verification);
        tokio::pin!(deadline);

        loop {
            if verified && (self.state.borrow().is_settled() || !live_open) {
                break;
            }

            tokio::select! {
                event = &mut verification, if !verified => {
                    verified = true;
                    self.apply(&asset_id, &asset_id, &event);
                }
                event = next_live(&mut live), if live_open => match event {
                    Some(event) => {
                        if let Some(confirmed) = confirmation_for(&event) {
                            self.apply(&asset_id, &event.record().asset_id, &confirmed);
                        }
                    }
                    None => live_open = false,
                },
                _ = &mut deadline => {
                    debug!(asset_id = %asset_id, "listen window closed");
                    break;
                }
            }
        }

        self.state()
    }

    async fn verify_once(
        &self,
        params: &RedirectParams,
        asset_id: &str,
        buyer_id: Option<&str>,
    ) -> ReconcileEvent {
        if let Some(reference) = params.payment_reference() {
            let request = VerifyRequest::new(reference, asset_id);
            return match self.api.verify(&request).await {
                Ok(VerificationOutcome::Entitled(receipt)) => {
                    if let Some(url) = &receipt.download_url {
                        if let Err(err) = self.cache.set(&purchased_key(asset_id), url) {
                            warn!(asset_id, error = %err, "could not cache download url");
                        }
                    }
                    ReconcileEvent::Verified {
                        download_url: receipt.download_url,
                        filename: receipt.filename,
                        message: receipt.message,
                        warnings: receipt.warnings,
                    }
                }
                Ok(VerificationOutcome::NotApproved {
                    status,
                    detail,
                    retryable,
                }) => ReconcileEvent::NotApproved {
                    status,
                    detail,
                    retryable,
                },
                Ok(
                    VerificationOutcome::MissingBuyerReference { .. }
                    | VerificationOutcome::AssetMismatch { .. },
                ) => ReconcileEvent::IntegrityFailure,
                Err(err) => {
                    warn!(payment_id = reference, asset_id, error = %err, "verification call failed");
                    ReconcileEvent::Inconclusive {
                        reason: err.to_string(),
                    }
                }
            };
        }

        if let Some(buyer_id) = buyer_id {
            return match self.api.check_entitlement(buyer_id, asset_id).await {
                Ok(check) if check.entitled => ReconcileEvent::EntitlementConfirmed,
                Ok(check) if check.pending => ReconcileEvent::Inconclusive {
                    reason: "purchase awaiting confirmation".to_string(),
                },
                Ok(_) => ReconcileEvent::NotEntitled,
                Err(err) => ReconcileEvent::Inconclusive {
                    reason: err.to_string(),
                },
            };
        }

        ReconcileEvent::NoContext
    }

    fn apply(&self, displayed_asset: &str, event_asset: &str, event: &ReconcileEvent) {
        self.state.send_if_modified(|state| {
            let next = reduce(state, displayed_asset, event_asset, event);
            if next == *state {
                return false;
            }
            debug!(asset_id = displayed_asset, ?event, "reconcile state changed");
            *state = next;
            true
        });
    }
}

async fn next_live(live: &mut Option<LedgerSubscription>) -> Option<LedgerEvent> {
    match live {
        Some(subscription) => subscription.next().await,
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{EntitlementCheck, EntitlementLedger};
    use crate::orchestrator::EntitledReceipt;
    use crate::storage::MemoryLedgerStore;
    use crate::types::PaymentMethod;
    use async_trait::async_trait;
    use uuid::Uuid;

    struct StubApi {
        outcome: Result<VerificationOutcome, String>,
        entitlement: EntitlementCheck,
        delay: Duration,
    }

    impl StubApi {
        fn returning(outcome: VerificationOutcome) -> Self {
            Self {
                outcome: Ok(outcome),
                entitlement: EntitlementCheck {
                    entitled: false,
                    reason: None,
                    pending: false,
                },
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl VerificationApi for StubApi {
        async fn verify(
            &self,
            _request: &VerifyRequest,
        ) -> Result<VerificationOutcome, EntitleError> {
            tokio::time::sleep(self.delay).await;
            self.outcome
                .clone()
                .map_err(EntitleError::GatewayUnavailable)
        }

        async fn check_entitlement(
            &self,
            _buyer_id: &str,
            _asset_id: &str,
        ) -> Result<EntitlementCheck, EntitleError> {
            Ok(self.entitlement.clone())
        }
    }

    fn entitled(url: Option<&str>) -> VerificationOutcome {
        VerificationOutcome::Entitled(EntitledReceipt {
            payment_id: "pay_1".into(),
            asset_id: "m1".into(),
            download_url: url.map(str::to_string),
            filename: Some("bracket.stl".into()),
            message: "Payment verified successfully".into(),
            asset: None,
            credential_source: None,
            expires_at: None,
            warnings: vec![],
            record: None,
        })
    }

    fn redirect(pairs: &[(&str, &str)]) -> RedirectParams {
        RedirectParams::from_pairs(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())))
    }

    fn controller(api: StubApi, cache: Arc<dyn ClientCache>) -> ReconciliationController {
        ReconciliationController::new(
            Arc::new(api),
            cache,
            ControllerConfig {
                listen_window: Duration::from_secs(2),
            },
        )
    }

    #[test]
    fn redirect_params_accept_provider_aliases() {
        let params = redirect(&[
            ("collection_id", "123"),
            ("collection_status", "approved"),
            ("merchant_order_id", "null"),
            ("model_id", "m1"),
        ]);
        assert_eq!(params.payment_reference(), Some("123"));
        assert_eq!(params.merchant_order_id, None);
        assert_eq!(params.asset_id.as_deref(), Some("m1"));
        assert_eq!(params.status_hint(), Some(GatewayStatus::Approved));

        let params = redirect(&[("merchant_order_id", "order-9"), ("status", "failure")]);
        assert_eq!(params.payment_reference(), Some("order-9"));
        assert_eq!(params.status_hint(), Some(GatewayStatus::Rejected));
    }

    #[test]
    fn payment_id_wins_over_collection_id() {
        let params = redirect(&[("collection_id", "c"), ("payment_id", "p")]);
        assert_eq!(params.payment_id.as_deref(), Some("p"));
    }

    #[test]
    fn reducer_ignores_other_assets() {
        let state = reduce(
            &ReconcileState::Verifying,
            "m1",
            "m2",
            &ReconcileEvent::EntitlementConfirmed,
        );
        assert_eq!(state, ReconcileState::Verifying);
    }

    #[test]
    fn ledger_confirmation_upgrades_provisional_and_keeps_url() {
        let provisional = ReconcileState::Approved {
            download_url: Some("https://cached".into()),
            filename: None,
            provisional: true,
            caption: None,
        };
        let next = reduce(
            &provisional,
            "m1",
            "m1",
            &ReconcileEvent::LedgerConfirmed {
                payment_id: "pay_1".into(),
            },
        );
        assert!(next.is_confirmed());
        assert!(matches!(
            next,
            ReconcileState::Approved { download_url: Some(url), .. } if url == "https://cached"
        ));
    }

    #[test]
    fn rejection_replaces_provisional_but_not_confirmed() {
        let rejected = ReconcileEvent::NotApproved {
            status: GatewayStatus::Rejected,
            detail: None,
            retryable: false,
        };
        let provisional = reduce(
            &ReconcileState::Verifying,
            "m1",
            "m1",
            &ReconcileEvent::CachedDownload {
                download_url: "https://cached".into(),
            },
        );
        assert!(matches!(
            reduce(&provisional, "m1", "m1", &rejected),
            ReconcileState::Rejected { .. }
        ));

        let confirmed = reduce(&provisional, "m1", "m1", &ReconcileEvent::EntitlementConfirmed);
        assert!(reduce(&confirmed, "m1", "m1", &rejected).is_confirmed());

        let redirect_rejected = ReconcileEvent::RedirectRejected {
            status: "failure".into(),
        };
        assert!(matches!(
            reduce(&provisional, "m1", "m1", &redirect_rejected),
            ReconcileState::Rejected { .. }
        ));
        assert!(reduce(&confirmed, "m1", "m1", &redirect_rejected).is_confirmed());
    }

    #[tokio::test]
    async fn approved_redirect_caches_download_url() {
        let cache: Arc<dyn ClientCache> = Arc::new(MemoryClientCache::new());
        let controller = controller(StubApi::returning(entitled(Some("https://signed"))), cache.clone());

        let state = controller
            .run(
                redirect(&[("payment_id", "pay_1"), ("model_id", "m1")]),
                None,
                None,
            )
            .await;
        assert!(state.is_confirmed());
        assert_eq!(cache.get(&purchased_key("m1")).as_deref(), Some("https://signed"));
        assert_eq!(cache.get(LAST_ASSET_KEY).as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn rejected_redirect_overrides_cached_download() {
        let cache: Arc<dyn ClientCache> = Arc::new(MemoryClientCache::new());
        cache.set(&purchased_key("m1"), "https://cached").unwrap();
        let controller = controller(
            StubApi::returning(VerificationOutcome::NotApproved {
                status: GatewayStatus::Pending,
                detail: None,
                retryable: true,
            }),
            cache,
        );

        let state = controller
            .run(
                redirect(&[("payment_id", "pay_1"), ("model_id", "m1"), ("status", "failure")]),
                None,
                None,
            )
            .await;
        assert_eq!(
            state,
            ReconcileState::Rejected {
                message: REJECTED_MESSAGE.to_string(),
                caption: Some("failure".into()),
            }
        );
    }

    #[tokio::test]
    async fn payment_for_another_asset_is_an_integrity_rejection() {
        let controller = controller(
            StubApi::returning(VerificationOutcome::AssetMismatch {
                payment_id: "pay_1".into(),
                paid_asset: "cheap".into(),
            }),
            Arc::new(MemoryClientCache::new()),
        );
        let state = controller
            .run(
                redirect(&[("payment_id", "pay_1"), ("model_id", "m1")]),
                None,
                None,
            )
            .await;
        assert_eq!(
            state,
            ReconcileState::Rejected {
                message: INTEGRITY_MESSAGE.to_string(),
                caption: None,
            }
        );
    }

    #[tokio::test]
    async fn lost_asset_context_recovers_from_cache() {
        let cache: Arc<dyn ClientCache> = Arc::new(MemoryClientCache::new());
        cache.set(LAST_ASSET_KEY, "m1").unwrap();
        let controller = controller(StubApi::returning(entitled(Some("https://signed"))), cache);

        let state = controller
            .run(redirect(&[("payment_id", "pay_1")]), None, None)
            .await;
        assert!(state.is_confirmed());
    }

    #[tokio::test]
    async fn missing_context_is_rejected() {
        let controller = controller(
            StubApi::returning(entitled(Some("https://signed"))),
            Arc::new(MemoryClientCache::new()),
        );
        let state = controller
            .run(redirect(&[("payment_id", "pay_1")]), None, None)
            .await;
        assert!(matches!(state, ReconcileState::Rejected { .. }));
    }

    #[tokio::test]
    async fn cached_url_renders_provisional_first() {
        let cache: Arc<dyn ClientCache> = Arc::new(MemoryClientCache::new());
        cache.set(&purchased_key("m1"), "https://cached").unwrap();
        let mut api = StubApi::returning(entitled(Some("https://fresh")));
        api.delay = Duration::from_millis(100);
        let controller = Arc::new(controller(api, cache));
        let mut states = controller.watch();

        let runner = {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller
                    .run(
                        redirect(&[("payment_id", "pay_1"), ("model_id", "m1")]),
                        None,
                        None,
                    )
                    .await
            })
        };

        states
            .wait_for(|state| matches!(state, ReconcileState::Approved { provisional: true, .. }))
            .await
            .unwrap();
        let final_state = runner.await.unwrap();
        assert!(matches!(
            final_state,
            ReconcileState::Approved { download_url: Some(url), provisional: false, .. }
                if url == "https://fresh"
        ));
    }

    #[tokio::test]
    async fn live_insert_confirms_when_verification_is_inconclusive() {
        let ledger = EntitlementLedger::new(Arc::new(MemoryLedgerStore::new()));
        let live = ledger.subscribe("u1");
        let controller = controller(
            StubApi::returning(VerificationOutcome::NotApproved {
                status: GatewayStatus::Unknown,
                detail: Some("gateway lookup timed out".into()),
                retryable: true,
            }),
            Arc::new(MemoryClientCache::new()),
        );

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            ledger
                .upsert_on_approval("pay_1", "u1", "m1", 1_000, PaymentMethod::Mercadopago)
                .await
                .unwrap();
            ledger
        });

        let state = controller
            .run(
                redirect(&[("payment_id", "pay_1"), ("model_id", "m1")]),
                Some("u1"),
                Some(live),
            )
            .await;
        writer.await.unwrap();
        assert!(state.is_confirmed());
    }

    #[tokio::test]
    async fn retryable_outcome_without_live_channel_stays_verifying() {
        let controller = controller(
            StubApi::returning(VerificationOutcome::NotApproved {
                status: GatewayStatus::Pending,
                detail: None,
                retryable: true,
            }),
            Arc::new(MemoryClientCache::new()),
        );
        let state = controller
            .run(
                redirect(&[("payment_id", "pay_1"), ("model_id", "m1")]),
                None,
                None,
            )
            .await;
        assert_eq!(state, ReconcileState::Verifying);
    }

    #[tokio::test]
    async fn entitlement_query_used_without_payment_reference() {
        let mut api = StubApi::returning(entitled(None));
        api.entitlement = EntitlementCheck {
            entitled: true,
            reason: None,
            pending: false,
        };
        let controller = controller(api, Arc::new(MemoryClientCache::new()));
        let state = controller
            .run(redirect(&[("model_id", "m1")]), Some("u1"), None)
            .await;
        assert!(state.is_confirmed());
    }

    #[tokio::test]
    async fn transport_failure_keeps_provisional_state() {
        let cache: Arc<dyn ClientCache> = Arc::new(MemoryClientCache::new());
        cache.set(&purchased_key("m1"), "https://cached").unwrap();
        let api = StubApi {
            outcome: Err("connection refused".into()),
            entitlement: EntitlementCheck {
                entitled: false,
                reason: None,
                pending: false,
            },
            delay: Duration::ZERO,
        };
        let controller = controller(api, cache);
        let state = controller
            .run(
                redirect(&[("payment_id", "pay_1"), ("model_id", "m1")]),
                None,
                None,
            )
            .await;
        assert!(matches!(
            state,
            ReconcileState::Approved {
                provisional: true,
                ..
            }
        ));
    }

    #[test]
    fn file_cache_persists_across_reload() {
        let dir = std::env::temp_dir().join(format!("entitle-cache-{}", Uuid::new_v4()));
        let path = dir.join("client.json");

        let cache = FileClientCache::load(&path).unwrap();
        cache.set(LAST_ASSET_KEY, "m7").unwrap();
        cache.set(&purchased_key("m7"), "https://signed").unwrap();

        let reloaded = FileClientCache::load(&path).unwrap();
        assert_eq!(reloaded.get(LAST_ASSET_KEY).as_deref(), Some("m7"));
        assert_eq!(
            reloaded.get(&purchased_key("m7")).as_deref(),
            Some("https://signed")
        );

        let _ = fs::remove_dir_all(dir);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn event() -> impl Strategy<Value = ReconcileEvent> {
            prop_oneof![
                Just(ReconcileEvent::CachedDownload {
                    download_url: "https://cached".into()
                }),
                Just(ReconcileEvent::RedirectRejected {
                    status: "failure".into()
                }),
                Just(ReconcileEvent::NotApproved {
                    status: GatewayStatus::Rejected,
                    detail: None,
                    retryable: false,
                }),
                Just(ReconcileEvent::NotApproved {
                    status: GatewayStatus::Unknown,
                    detail: None,
                    retryable: true,
                }),
                Just(ReconcileEvent::IntegrityFailure),
                Just(ReconcileEvent::NotEntitled),
                Just(ReconcileEvent::NoContext),
                Just(ReconcileEvent::Inconclusive {
                    reason: "timeout".into()
                }),
                Just(ReconcileEvent::EntitlementConfirmed),
            ]
        }

        proptest! {
            #[test]
            fn confirmed_approval_is_never_downgraded(events in prop::collection::vec(event(), 0..16)) {
                let mut state = reduce(
                    &ReconcileState::Verifying,
                    "m1",
                    "m1",
                    &ReconcileEvent::LedgerConfirmed { payment_id: "pay_1".into() },
                );
                for event in &events {
                    state = reduce(&state, "m1", "m1", event);
                    prop_assert!(state.is_confirmed());
                }
            }

            #[test]
            fn rejection_events_never_approve(events in prop::collection::vec(event(), 0..16)) {
                let mut state = ReconcileState::Verifying;
                for event in events.iter().filter(|e| !matches!(
                    e,
                    ReconcileEvent::CachedDownload { .. } | ReconcileEvent::EntitlementConfirmed
                )) {
                    state = reduce(&state, "m1", "m1", event);
                    let approved = matches!(state, ReconcileState::Approved { .. });
                    prop_assert!(!approved);
                }
            }
        }
    }
}
