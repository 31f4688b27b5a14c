#![deny(unsafe_code)]

pub mod download;
pub mod stream;

pub use download::LocalDownloads;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use entitle_adapters::{FixtureGateway, MercadoPagoGateway, StorageApiSigner};
use entitle_core::{
    bootstrap_storage, AssetCatalog, AssetRecord, Blake3UrlSigner, CheckoutSession,
    EntitleError, EntitlementCheck, EntitlementRecord, LedgerStats, LedgerStorageConfig,
    MemoryAssetCatalog, PaymentGateway, PostgresAssetCatalog, UrlSigner, VerificationConfig,
    VerificationEngine, VerifyRequest, VerifyResponse, MISSING_FIELDS_MESSAGE,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Where payment status comes from.
#[derive(Debug, Clone)]
pub enum GatewayConfig {
    MercadoPago {
        base_url: String,
        access_token: String,
    },
    /// In-process gateway, optionally preloaded from a JSON seed file.
    Fixture { seed_file: Option<PathBuf> },
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::Fixture { seed_file: None }
    }
}

/// How download URLs are signed.
///
/// With a storage service key, signing goes through the storage API. Otherwise URLs
/// are signed locally with `signing_secret`, or with a per-process key when unset,
/// and redeemed by this service from `objects_dir`.
#[derive(Debug, Clone)]
pub struct SigningConfig {
    pub storage_base_url: Option<String>,
    pub service_key: Option<String>,
    pub signing_secret: Option<String>,
    /// Public origin of this service; locally signed links point here.
    pub service_url: String,
    /// One directory per bucket holding the objects behind local links.
    pub objects_dir: PathBuf,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            storage_base_url: None,
            service_key: None,
            signing_secret: None,
            service_url: "http://127.0.0.1:8092".to_string(),
            objects_dir: PathBuf::from("data/objects"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub ledger_storage: LedgerStorageConfig,
    pub gateway: GatewayConfig,
    pub signing: SigningConfig,
    /// JSON array of assets served when no database backs the catalog.
    pub catalog_seed: Option<PathBuf>,
    pub verification: VerificationConfig,
}

#[derive(Clone)]
pub struct ServiceState {
    pub engine: Arc<VerificationEngine>,
    /// Present when download links are signed locally.
    pub downloads: Option<LocalDownloads>,
}

impl ServiceState {
    pub fn new(engine: Arc<VerificationEngine>) -> Self {
        Self {
            engine,
            downloads: None,
        }
    }

    pub fn with_local_downloads(mut self, downloads: LocalDownloads) -> Self {
        self.downloads = Some(downloads);
        self
    }

    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let ServiceConfig {
            ledger_storage,
            gateway,
            signing,
            catalog_seed,
            verification,
        } = config;

        let handles = bootstrap_storage(ledger_storage).await?;
        let catalog: Arc<dyn AssetCatalog> = match handles.pool.clone() {
            Some(pool) => Arc::new(PostgresAssetCatalog::new(pool)),
            None => Arc::new(load_catalog(catalog_seed.as_deref())?),
        };

        let gateway: Arc<dyn PaymentGateway> = match gateway {
            GatewayConfig::MercadoPago {
                base_url,
                access_token,
            } => Arc::new(MercadoPagoGateway::new(
                base_url,
                access_token,
                verification.gateway_timeout,
            )?),
            GatewayConfig::Fixture { seed_file } => match seed_file {
                Some(path) => Arc::new(FixtureGateway::from_seed_file(&path)?),
                None => Arc::new(FixtureGateway::new()),
            },
        };

        let (signer, downloads) = build_signer(signing, &verification)?;
        let engine = VerificationEngine::new(verification, gateway, handles.ledger, catalog, signer);
        info!(
            ledger_backend = engine.ledger().backend_label(),
            gateway = engine.gateway_provider(),
            local_downloads = downloads.is_some(),
            "entitlement engine ready"
        );

        let state = Self::new(Arc::new(engine));
        Ok(match downloads {
            Some(downloads) => state.with_local_downloads(downloads),
            None => state,
        })
    }
}

fn load_catalog(seed: Option<&FsPath>) -> Result<MemoryAssetCatalog, ServiceError> {
    let Some(path) = seed else {
        return Ok(MemoryAssetCatalog::new());
    };
    let bytes = std::fs::read(path)
        .map_err(|e| ServiceError::Config(format!("read catalog seed {}: {e}", path.display())))?;
    let assets: Vec<AssetRecord> = serde_json::from_slice(&bytes)
        .map_err(|e| ServiceError::Config(format!("parse catalog seed {}: {e}", path.display())))?;
    info!(count = assets.len(), "catalog seeded from file");
    Ok(MemoryAssetCatalog::with_assets(assets))
}

fn build_signer(
    signing: SigningConfig,
    verification: &VerificationConfig,
) -> Result<(Arc<dyn UrlSigner>, Option<LocalDownloads>), ServiceError> {
    let SigningConfig {
        storage_base_url,
        service_key,
        signing_secret,
        service_url,
        objects_dir,
    } = signing;

    if let Some(service_key) = service_key {
        let base_url = storage_base_url.ok_or_else(|| {
            ServiceError::Config("a storage service key requires a storage base url".to_string())
        })?;
        let signer = StorageApiSigner::new(base_url, service_key, verification.gateway_timeout)?;
        return Ok((Arc::new(signer), None));
    }

    let secret = match signing_secret {
        Some(secret) => secret,
        None => {
            warn!("no signing secret configured; download links will not survive a restart");
            Uuid::new_v4().to_string()
        }
    };
    let local = Arc::new(Blake3UrlSigner::new(service_url, &secret));
    info!(objects_dir = %objects_dir.display(), "serving locally signed downloads");
    let signer: Arc<dyn UrlSigner> = local.clone();
    Ok((signer, Some(LocalDownloads::new(local, objects_dir))))
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/verify-payment", post(verify_payment))
        .route("/api/create-preference", post(create_preference))
        .route("/v1/purchases/manual", post(record_manual_purchase))
        .route("/v1/transactions", get(list_transactions))
        .route("/v1/transactions/:id/confirm", post(confirm_transaction))
        .route("/v1/transactions/:id/reject", post(reject_transaction))
        .route("/v1/entitlements/:asset_id", get(get_entitlement))
        .route("/v1/stats", get(get_stats))
        .route("/v1/ledger/stream", get(stream::ledger_stream))
        .route(
            "/storage/v1/object/sign/:bucket/*path",
            get(download::download_object),
        )
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("core engine error: {0}")]
    Core(#[from] EntitleError),
    #[error("configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Core(#[from] EntitleError),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Http { status, message } => {
                (status, Json(serde_json::json!({ "error": message }))).into_response()
            }
            ApiError::Core(err) => {
                let status = match &err {
                    EntitleError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                    EntitleError::AssetNotFound(_) | EntitleError::RecordNotFound(_) => {
                        StatusCode::NOT_FOUND
                    }
                    EntitleError::InvalidTransition(_) => StatusCode::CONFLICT,
                    EntitleError::GatewayUnavailable(_) => StatusCode::BAD_GATEWAY,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    ledger_backend: &'static str,
    gateway: &'static str,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "entitle-service",
        ledger_backend: state.engine.ledger().backend_label(),
        gateway: state.engine.gateway_provider(),
    })
}

/// Accepts an object body or the same object sent as a JSON string, with the
/// legacy `paymentId`/`modelId` names as aliases.
fn parse_verify_body(body: &str) -> Option<VerifyRequest> {
    let value = match serde_json::from_str::<Value>(body).ok()? {
        Value::String(inner) => serde_json::from_str(&inner).ok()?,
        other => other,
    };
    let payment_reference = text_field(&value, &["paymentReference", "paymentId"])?;
    let asset_id = text_field(&value, &["assetId", "modelId"])?;
    Some(VerifyRequest::new(payment_reference, asset_id))
}

fn text_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match value.get(*key) {
        Some(Value::String(text)) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Some(Value::Number(number)) => Some(number.to_string()),
        _ => None,
    })
}

fn verify_reply(response: VerifyResponse) -> Result<Response, ApiError> {
    let status =
        StatusCode::from_u16(response.status_code()).map_err(|e| ApiError::internal(e.to_string()))?;
    Ok((status, Json(response.to_json()?)).into_response())
}

async fn verify_payment(
    State(state): State<ServiceState>,
    body: String,
) -> Result<Response, ApiError> {
    let Some(request) = parse_verify_body(&body) else {
        return verify_reply(VerifyResponse::invalid_request(MISSING_FIELDS_MESSAGE));
    };

    match state.engine.verify(&request).await {
        Ok(outcome) => verify_reply(VerifyResponse::from(outcome)),
        Err(EntitleError::InvalidRequest(message)) => {
            verify_reply(VerifyResponse::invalid_request(message))
        }
        Err(err) => {
            error!(
                payment_id = %request.payment_reference,
                asset_id = %request.asset_id,
                error = %err,
                "verification failed unexpectedly"
            );
            Err(ApiError::internal(err.to_string()))
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreferenceRequest {
    #[serde(alias = "modelId")]
    asset_id: String,
    #[serde(alias = "userId")]
    buyer_id: String,
}

async fn create_preference(
    State(state): State<ServiceState>,
    Json(request): Json<PreferenceRequest>,
) -> Result<Json<CheckoutSession>, ApiError> {
    Ok(Json(
        state
            .engine
            .create_checkout(&request.buyer_id, &request.asset_id)
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManualPurchaseRequest {
    #[serde(alias = "userId")]
    buyer_id: String,
    #[serde(alias = "modelId")]
    asset_id: String,
    country: Option<String>,
}

async fn record_manual_purchase(
    State(state): State<ServiceState>,
    Json(request): Json<ManualPurchaseRequest>,
) -> Result<(StatusCode, Json<EntitlementRecord>), ApiError> {
    let record = state
        .engine
        .record_manual_purchase(
            &request.buyer_id,
            &request.asset_id,
            request.country.as_deref(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn confirm_transaction(
    Path(record_id): Path<Uuid>,
    State(state): State<ServiceState>,
) -> Result<Json<EntitlementRecord>, ApiError> {
    Ok(Json(state.engine.confirm_purchase(record_id).await?))
}

async fn reject_transaction(
    Path(record_id): Path<Uuid>,
    State(state): State<ServiceState>,
) -> Result<Json<EntitlementRecord>, ApiError> {
    Ok(Json(state.engine.reject_purchase(record_id).await?))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntitlementQuery {
    buyer_id: String,
}

async fn get_entitlement(
    Path(asset_id): Path<String>,
    State(state): State<ServiceState>,
    Query(query): Query<EntitlementQuery>,
) -> Result<Json<EntitlementCheck>, ApiError> {
    if query.buyer_id.trim().is_empty() {
        return Err(ApiError::bad_request("buyerId is required"));
    }
    Ok(Json(
        state
            .engine
            .check_entitlement(&query.buyer_id, &asset_id)
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct TransactionsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
struct TransactionsResponse {
    backend: &'static str,
    returned: usize,
    items: Vec<EntitlementRecord>,
}

async fn list_transactions(
    State(state): State<ServiceState>,
    Query(query): Query<TransactionsQuery>,
) -> Result<Json<TransactionsResponse>, ApiError> {
    let items = state.engine.recent_transactions(query.limit).await?;
    Ok(Json(TransactionsResponse {
        backend: state.engine.ledger().backend_label(),
        returned: items.len(),
        items,
    }))
}

async fn get_stats(State(state): State<ServiceState>) -> Result<Json<LedgerStats>, ApiError> {
    Ok(Json(state.engine.stats().await?))
}
