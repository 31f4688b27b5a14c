use crate::catalog::AssetCatalog;
use crate::error::EntitleError;
use crate::ledger::{LedgerStats, LedgerStore, Transition, UpsertOutcome};
use crate::types::{AssetRecord, EntitlementRecord, NewEntitlement, PaymentMethod, RecordStatus};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Ledger persistence backend configuration.
#[derive(Debug, Clone, Default)]
pub enum LedgerStorageConfig {
    /// Keep ledger rows in process memory only.
    #[default]
    Memory,
    /// Persist ledger rows in PostgreSQL.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl LedgerStorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

/// Ledger store plus, for PostgreSQL, the pool so the catalog can share it.
pub struct StorageHandles {
    pub ledger: Arc<dyn LedgerStore>,
    pub pool: Option<PgPool>,
}

pub async fn bootstrap_storage(config: LedgerStorageConfig) -> Result<StorageHandles, EntitleError> {
    match config {
        LedgerStorageConfig::Memory => Ok(StorageHandles {
            ledger: Arc::new(MemoryLedgerStore::new()),
            pool: None,
        }),
        LedgerStorageConfig::Postgres {
            database_url,
            max_connections,
        } => {
            let store = PostgresLedgerStore::connect(&database_url, max_connections).await?;
            store.ensure_schema().await?;
            let pool = store.pool.clone();
            Ok(StorageHandles {
                ledger: Arc::new(store),
                pool: Some(pool),
            })
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    records: Vec<EntitlementRecord>,
    by_payment_id: HashMap<String, usize>,
}

/// In-memory ledger. The unique payment-id index is checked and updated under
/// one lock, which is what makes duplicate verifications converge.
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    state: Mutex<MemoryState>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    fn backend_label(&self) -> &'static str {
        "memory"
    }

    async fn insert_if_absent(&self, entry: NewEntitlement) -> Result<UpsertOutcome, EntitleError> {
        let mut state = self.state.lock().await;
        if let Some(&idx) = state.by_payment_id.get(&entry.payment_id) {
            return Ok(UpsertOutcome::Existing(state.records[idx].clone()));
        }

        let record = entry.into_record(Utc::now());
        let idx = state.records.len();
        state.by_payment_id.insert(record.payment_id.clone(), idx);
        state.records.push(record.clone());
        Ok(UpsertOutcome::Inserted(record))
    }

    async fn get(&self, record_id: Uuid) -> Result<Option<EntitlementRecord>, EntitleError> {
        let state = self.state.lock().await;
        Ok(state.records.iter().find(|r| r.id == record_id).cloned())
    }

    async fn find_by_payment_id(
        &self,
        payment_id: &str,
    ) -> Result<Option<EntitlementRecord>, EntitleError> {
        let state = self.state.lock().await;
        Ok(state
            .by_payment_id
            .get(payment_id)
            .map(|&idx| state.records[idx].clone()))
    }

    async fn find_for_pair(
        &self,
        buyer_id: &str,
        asset_id: &str,
    ) -> Result<Vec<EntitlementRecord>, EntitleError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .iter()
            .rev()
            .filter(|r| r.buyer_id == buyer_id && r.asset_id == asset_id)
            .cloned()
            .collect())
    }

    async fn transition(
        &self,
        record_id: Uuid,
        from: RecordStatus,
        to: RecordStatus,
    ) -> Result<Option<Transition>, EntitleError> {
        let mut state = self.state.lock().await;
        let Some(record) = state.records.iter_mut().find(|r| r.id == record_id) else {
            return Ok(None);
        };

        if record.status != from {
            return Ok(Some(Transition::Unchanged(record.clone())));
        }
        record.status = to;
        record.updated_at = Utc::now();
        Ok(Some(Transition::Applied(record.clone())))
    }

    async fn recent(&self, limit: usize) -> Result<Vec<EntitlementRecord>, EntitleError> {
        let state = self.state.lock().await;
        Ok(state.records.iter().rev().take(limit).cloned().collect())
    }

    async fn stats(&self) -> Result<LedgerStats, EntitleError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .iter()
            .fold(LedgerStats::default(), |mut stats, record| {
                if record.status.is_success() {
                    stats.platform_revenue_minor += record.platform_fee_minor;
                    stats.completed_count += 1;
                } else if record.status == RecordStatus::Pending {
                    stats.pending_count += 1;
                }
                stats
            }))
    }
}

const RECORD_COLUMNS: &str = "id, buyer_id, model_id, amount, platform_fee, seller_earnings, \
     payment_method, status, payment_id, created_at, updated_at";

/// PostgreSQL ledger. The `payment_id` unique constraint is the concurrency primitive.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, EntitleError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| EntitleError::Storage(format!("postgres connect failed: {e}")))?;

        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<(), EntitleError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                id UUID PRIMARY KEY,
                buyer_id TEXT NOT NULL,
                model_id TEXT NOT NULL,
                amount BIGINT NOT NULL CHECK (amount >= 0),
                platform_fee BIGINT NOT NULL CHECK (platform_fee >= 0),
                seller_earnings BIGINT NOT NULL CHECK (seller_earnings >= 0),
                payment_method TEXT NOT NULL,
                status TEXT NOT NULL,
                payment_id TEXT NOT NULL UNIQUE,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                CHECK (platform_fee + seller_earnings = amount)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| EntitleError::Storage(format!("postgres schema create failed: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_transactions_buyer_model ON transactions (buyer_id, model_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| EntitleError::Storage(format!("postgres index create failed: {e}")))?;

        Ok(())
    }

    async fn fetch_one_where(
        &self,
        clause: &str,
        bind: impl ToString,
    ) -> Result<Option<EntitlementRecord>, EntitleError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM transactions WHERE {clause}");
        let row = sqlx::query(&sql)
            .bind(bind.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EntitleError::Storage(format!("postgres select failed: {e}")))?;
        row.as_ref().map(record_from_row).transpose()
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    fn backend_label(&self) -> &'static str {
        "postgres"
    }

    async fn insert_if_absent(&self, entry: NewEntitlement) -> Result<UpsertOutcome, EntitleError> {
        let payment_id = entry.payment_id.clone();
        let record = entry.into_record(Utc::now());
        let sql = format!(
            r#"
            INSERT INTO transactions ({RECORD_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (payment_id) DO NOTHING
            RETURNING {RECORD_COLUMNS}
            "#
        );

        let inserted = sqlx::query(&sql)
            .bind(record.id)
            .bind(&record.buyer_id)
            .bind(&record.asset_id)
            .bind(to_bigint(record.amount_minor)?)
            .bind(to_bigint(record.platform_fee_minor)?)
            .bind(to_bigint(record.seller_earnings_minor)?)
            .bind(record.payment_method.as_str())
            .bind(record.status.as_str())
            .bind(&record.payment_id)
            .bind(record.created_at)
            .bind(record.updated_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EntitleError::LedgerWriteFailed(format!("postgres insert failed: {e}")))?;

        if let Some(row) = inserted {
            return Ok(UpsertOutcome::Inserted(record_from_row(&row)?));
        }

        self.fetch_one_where("payment_id = $1", &payment_id)
            .await?
            .map(UpsertOutcome::Existing)
            .ok_or_else(|| {
                EntitleError::LedgerWriteFailed(format!(
                    "conflict on payment_id '{payment_id}' but no row found"
                ))
            })
    }

    async fn get(&self, record_id: Uuid) -> Result<Option<EntitlementRecord>, EntitleError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM transactions WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EntitleError::Storage(format!("postgres select failed: {e}")))?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn find_by_payment_id(
        &self,
        payment_id: &str,
    ) -> Result<Option<EntitlementRecord>, EntitleError> {
        self.fetch_one_where("payment_id = $1", payment_id).await
    }

    async fn find_for_pair(
        &self,
        buyer_id: &str,
        asset_id: &str,
    ) -> Result<Vec<EntitlementRecord>, EntitleError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM transactions \
             WHERE buyer_id = $1 AND model_id = $2 ORDER BY created_at DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(buyer_id)
            .bind(asset_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EntitleError::Storage(format!("postgres select failed: {e}")))?;
        rows.iter().map(record_from_row).collect()
    }

    async fn transition(
        &self,
        record_id: Uuid,
        from: RecordStatus,
        to: RecordStatus,
    ) -> Result<Option<Transition>, EntitleError> {
        let sql = format!(
            "UPDATE transactions SET status = $3, updated_at = $4 \
             WHERE id = $1 AND status = $2 RETURNING {RECORD_COLUMNS}"
        );
        let updated = sqlx::query(&sql)
            .bind(record_id)
            .bind(from.as_str())
            .bind(to.as_str())
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EntitleError::LedgerWriteFailed(format!("postgres update failed: {e}")))?;

        if let Some(row) = updated {
            return Ok(Some(Transition::Applied(record_from_row(&row)?)));
        }
        Ok(self.get(record_id).await?.map(Transition::Unchanged))
    }

    async fn recent(&self, limit: usize) -> Result<Vec<EntitlementRecord>, EntitleError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM transactions ORDER BY created_at DESC LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EntitleError::Storage(format!("postgres select failed: {e}")))?;
        rows.iter().map(record_from_row).collect()
    }

    async fn stats(&self) -> Result<LedgerStats, EntitleError> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(platform_fee) FILTER (WHERE status IN ('completed', 'approved')), 0)::BIGINT AS revenue,
                COUNT(*) FILTER (WHERE status IN ('completed', 'approved')) AS completed,
                COUNT(*) FILTER (WHERE status = 'pending') AS pending
            FROM transactions
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| EntitleError::Storage(format!("postgres stats failed: {e}")))?;

        Ok(LedgerStats {
            platform_revenue_minor: from_bigint(decode(&row, "revenue")?, "revenue")?,
            completed_count: from_bigint(decode(&row, "completed")?, "completed")?,
            pending_count: from_bigint(decode(&row, "pending")?, "pending")?,
        })
    }
}

/// Catalog backed by the storefront's `models` table.
#[derive(Debug, Clone)]
pub struct PostgresAssetCatalog {
    pool: PgPool,
}

impl PostgresAssetCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AssetCatalog for PostgresAssetCatalog {
    async fn resolve(&self, asset_id: &str) -> Result<AssetRecord, EntitleError> {
        let row = sqlx::query(
            "SELECT id, title, price_minor, seller_id, file_path FROM models WHERE id = $1",
        )
        .bind(asset_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EntitleError::Storage(format!("postgres catalog lookup failed: {e}")))?
        .ok_or_else(|| EntitleError::AssetNotFound(asset_id.to_string()))?;

        Ok(AssetRecord {
            asset_id: decode(&row, "id")?,
            title: decode(&row, "title")?,
            price_minor: from_bigint(decode(&row, "price_minor")?, "price_minor")?,
            owner_id: decode(&row, "seller_id")?,
            storage_path: decode(&row, "file_path")?,
        })
    }
}

fn record_from_row(row: &PgRow) -> Result<EntitlementRecord, EntitleError> {
    let method: String = decode(row, "payment_method")?;
    let status: String = decode(row, "status")?;

    Ok(EntitlementRecord {
        id: decode(row, "id")?,
        buyer_id: decode(row, "buyer_id")?,
        asset_id: decode(row, "model_id")?,
        amount_minor: from_bigint(decode(row, "amount")?, "amount")?,
        platform_fee_minor: from_bigint(decode(row, "platform_fee")?, "platform_fee")?,
        seller_earnings_minor: from_bigint(decode(row, "seller_earnings")?, "seller_earnings")?,
        payment_method: PaymentMethod::parse(&method)?,
        status: RecordStatus::parse(&status)?,
        payment_id: decode(row, "payment_id")?,
        created_at: decode(row, "created_at")?,
        updated_at: decode(row, "updated_at")?,
    })
}

fn decode<'r, T>(row: &'r PgRow, column: &str) -> Result<T, EntitleError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| EntitleError::Storage(format!("postgres decode {column} failed: {e}")))
}

fn to_bigint(value: u64) -> Result<i64, EntitleError> {
    i64::try_from(value)
        .map_err(|_| EntitleError::LedgerWriteFailed("amount exceeds BIGINT range".to_string()))
}

fn from_bigint(value: i64, column: &str) -> Result<u64, EntitleError> {
    u64::try_from(value)
        .map_err(|_| EntitleError::Storage(format!("negative value in column {column}")))
}
