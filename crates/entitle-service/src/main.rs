use clap::{Parser, ValueEnum};
use entitle_adapters::DEFAULT_API_BASE;
use entitle_core::{LedgerStorageConfig, VerificationConfig, DEFAULT_COMMISSION_BPS};
use entitle_service::{build_router, GatewayConfig, ServiceConfig, ServiceState, SigningConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LedgerStorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum GatewayMode {
    Mercadopago,
    Fixture,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "entitled", version, about = "Payment verification and entitlement service")]
struct Cli {
    /// Socket address to bind, e.g. 127.0.0.1:8092
    #[arg(long, default_value = "127.0.0.1:8092", env = "ENTITLE_LISTEN")]
    listen: SocketAddr,
    /// Ledger persistence backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = LedgerStorageMode::Auto, env = "ENTITLE_LEDGER_STORAGE")]
    ledger_storage: LedgerStorageMode,
    /// PostgreSQL url for the transactions ledger and models catalog.
    #[arg(long, env = "ENTITLE_DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "ENTITLE_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// JSON array of assets served when no database is configured.
    #[arg(long, env = "ENTITLE_CATALOG_SEED")]
    catalog_seed: Option<PathBuf>,
    /// Payment status source.
    #[arg(long, value_enum, default_value_t = GatewayMode::Mercadopago, env = "ENTITLE_GATEWAY")]
    gateway: GatewayMode,
    /// Mercado Pago access token. Required in mercadopago mode.
    #[arg(long, env = "MP_ACCESS_TOKEN", hide_env_values = true)]
    mp_access_token: Option<String>,
    #[arg(long, default_value = DEFAULT_API_BASE, env = "ENTITLE_GATEWAY_BASE_URL")]
    gateway_base_url: String,
    /// Upper bound on one gateway call, in milliseconds.
    #[arg(long, default_value_t = 10_000, env = "ENTITLE_GATEWAY_TIMEOUT_MS")]
    gateway_timeout_ms: u64,
    /// Payments and orders preloaded into the fixture gateway.
    #[arg(long, env = "ENTITLE_FIXTURE_SEED")]
    fixture_seed: Option<PathBuf>,
    /// Storage service origin for signed and public download URLs.
    #[arg(long, env = "ENTITLE_STORAGE_URL")]
    storage_url: Option<String>,
    #[arg(long, default_value = "models", env = "ENTITLE_STORAGE_BUCKET")]
    storage_bucket: String,
    /// Storage service key; when set, URLs are signed by the storage service.
    #[arg(long, env = "ENTITLE_STORAGE_SERVICE_KEY", hide_env_values = true)]
    storage_service_key: Option<String>,
    /// Local URL signing secret, used when no storage service key is set.
    #[arg(long, env = "ENTITLE_SIGNING_SECRET", hide_env_values = true)]
    signing_secret: Option<String>,
    /// Public origin of this service for locally signed links. Defaults to http://<listen>.
    #[arg(long, env = "ENTITLE_PUBLIC_URL")]
    public_url: Option<String>,
    /// Per-bucket object directories served by locally signed links.
    #[arg(long, default_value = "data/objects", env = "ENTITLE_OBJECTS_DIR")]
    objects_dir: PathBuf,
    /// Download link lifetime in seconds.
    #[arg(long, default_value_t = 3_600, env = "ENTITLE_CREDENTIAL_TTL_SECS")]
    credential_ttl_secs: u64,
    /// Platform commission in basis points (1000 = 10%).
    #[arg(long, default_value_t = DEFAULT_COMMISSION_BPS, env = "ENTITLE_COMMISSION_BPS")]
    commission_bps: u32,
    #[arg(long, default_value = "ARS", env = "ENTITLE_CURRENCY")]
    currency: String,
    /// Public storefront origin used for checkout return URLs.
    #[arg(long, default_value = "http://localhost:5173", env = "ENTITLE_SITE_URL")]
    site_url: String,
    #[arg(long, value_enum, default_value_t = LogFormat::Text, env = "ENTITLE_LOG_FORMAT")]
    log_format: LogFormat,
}

fn resolve_ledger_storage(cli: &Cli) -> anyhow::Result<LedgerStorageConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.ledger_storage {
        LedgerStorageMode::Memory => LedgerStorageConfig::Memory,
        LedgerStorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("ledger_storage=postgres requires --database-url or DATABASE_URL")
            })?;
            LedgerStorageConfig::postgres(database_url, cli.pg_max_connections)
        }
        LedgerStorageMode::Auto => match resolved_url {
            Some(database_url) => LedgerStorageConfig::postgres(database_url, cli.pg_max_connections),
            None => LedgerStorageConfig::Memory,
        },
    };

    Ok(storage)
}

fn resolve_gateway(cli: &Cli) -> anyhow::Result<GatewayConfig> {
    match cli.gateway {
        GatewayMode::Mercadopago => {
            let access_token = cli.mp_access_token.clone().ok_or_else(|| {
                anyhow::anyhow!("gateway=mercadopago requires --mp-access-token or MP_ACCESS_TOKEN")
            })?;
            Ok(GatewayConfig::MercadoPago {
                base_url: cli.gateway_base_url.clone(),
                access_token,
            })
        }
        GatewayMode::Fixture => Ok(GatewayConfig::Fixture {
            seed_file: cli.fixture_seed.clone(),
        }),
    }
}

fn init_tracing(format: LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "entitle_service=info,entitle_core=info,info".into());

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = ServiceConfig {
        ledger_storage: resolve_ledger_storage(&cli)?,
        gateway: resolve_gateway(&cli)?,
        signing: SigningConfig {
            storage_base_url: cli.storage_url.clone(),
            service_key: cli.storage_service_key.clone(),
            signing_secret: cli.signing_secret.clone(),
            service_url: cli
                .public_url
                .clone()
                .unwrap_or_else(|| format!("http://{}", cli.listen)),
            objects_dir: cli.objects_dir.clone(),
        },
        catalog_seed: cli.catalog_seed.clone(),
        verification: VerificationConfig {
            commission_bps: cli.commission_bps,
            credential_ttl: Duration::from_secs(cli.credential_ttl_secs),
            gateway_timeout: Duration::from_millis(cli.gateway_timeout_ms),
            bucket: cli.storage_bucket.clone(),
            public_base_url: cli.storage_url.clone(),
            currency: cli.currency.clone(),
            site_url: cli.site_url.clone(),
        },
    };
    let state = ServiceState::bootstrap(config).await?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("entitle-service listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
