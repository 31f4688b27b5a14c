//! Payment verification and entitlement reconciliation core.
//!
//! Decides, idempotently, whether a buyer may download a paid asset after a payment
//! gateway redirect. The ledger's unique payment id is the only concurrency primitive;
//! once the gateway confirms a payment, downstream failures degrade instead of deny.

#![deny(unsafe_code)]

pub mod api;
pub mod catalog;
pub mod credentials;
pub mod error;
pub mod flow;
pub mod gateway;
pub mod ledger;
pub mod orchestrator;
pub mod reconcile;
pub mod storage;
pub mod types;

pub use api::{RejectionCode, VerifyRejectionBody, VerifyResponse, VerifySuccessBody};
pub use catalog::{AssetCatalog, MemoryAssetCatalog};
pub use credentials::{
    storage_object_url, Blake3UrlSigner, CredentialIssuer, CredentialSource, DownloadCredential,
    UrlSigner, DEFAULT_CREDENTIAL_TTL,
};
pub use error::EntitleError;
pub use flow::{VerificationStage, VerificationStageMachine};
pub use gateway::{
    CheckoutRequest, CheckoutSession, GatewayClient, GatewayStatus, GatewayVerdict,
    PaymentGateway, ProviderPayment,
};
pub use ledger::{
    manual_payment_ref, EntitlementCheck, EntitlementLedger, EntitlementReason, LedgerEvent,
    LedgerStats, LedgerStore, LedgerSubscription, Transition, UpsertOutcome,
};
pub use orchestrator::{
    EntitledReceipt, VerificationApi, VerificationConfig, VerificationEngine,
    VerificationOutcome, VerifyRequest, MISSING_FIELDS_MESSAGE, SUPPORT_MESSAGE,
    VERIFIED_MESSAGE,
};
pub use reconcile::{
    purchased_key, reduce, ClientCache, ControllerConfig, FileClientCache, MemoryClientCache,
    ReconcileEvent, ReconcileState, ReconciliationController, RedirectParams, LAST_ASSET_KEY,
};
pub use storage::{
    bootstrap_storage, LedgerStorageConfig, MemoryLedgerStore,
    PostgresAssetCatalog, PostgresLedgerStore, StorageHandles,
};
pub use types::{
    AssetRecord, AssetSummary, EntitlementRecord, FeeSplit, NewEntitlement, PaymentMethod,
    RecordStatus, DEFAULT_COMMISSION_BPS,
};
