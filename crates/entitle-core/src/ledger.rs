use crate::error::EntitleError;
use crate::types::{
    AssetRecord, EntitlementRecord, FeeSplit, NewEntitlement, PaymentMethod, RecordStatus,
    DEFAULT_COMMISSION_BPS,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Result of a conflict-keyed insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new row was created.
    Inserted(EntitlementRecord),
    /// A row with the same payment id already existed and was left untouched.
    Existing(EntitlementRecord),
}

impl UpsertOutcome {
    pub fn record(&self) -> &EntitlementRecord {
        match self {
            Self::Inserted(record) | Self::Existing(record) => record,
        }
    }

    pub fn into_record(self) -> EntitlementRecord {
        match self {
            Self::Inserted(record) | Self::Existing(record) => record,
        }
    }

    pub fn was_inserted(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

/// Result of a compare-and-set status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Applied(EntitlementRecord),
    /// Current status was not the expected one; row returned as stored.
    Unchanged(EntitlementRecord),
}

/// Aggregate figures for operator views.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LedgerStats {
    pub platform_revenue_minor: u64,
    pub completed_count: u64,
    pub pending_count: u64,
}

/// Storage backend for ledger rows.
///
/// `insert_if_absent` must be atomic with respect to `payment_id`: concurrent calls
/// with the same payment id yield exactly one `Inserted` and the rest `Existing`.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    fn backend_label(&self) -> &'static str;

    async fn insert_if_absent(&self, entry: NewEntitlement) -> Result<UpsertOutcome, EntitleError>;

    async fn get(&self, record_id: Uuid) -> Result<Option<EntitlementRecord>, EntitleError>;

    async fn find_by_payment_id(
        &self,
        payment_id: &str,
    ) -> Result<Option<EntitlementRecord>, EntitleError>;

    /// All rows for a buyer/asset pair, newest first.
    async fn find_for_pair(
        &self,
        buyer_id: &str,
        asset_id: &str,
    ) -> Result<Vec<EntitlementRecord>, EntitleError>;

    /// Compare-and-set status change; `Ok(None)` when the row does not exist.
    async fn transition(
        &self,
        record_id: Uuid,
        from: RecordStatus,
        to: RecordStatus,
    ) -> Result<Option<Transition>, EntitleError>;

    async fn recent(&self, limit: usize) -> Result<Vec<EntitlementRecord>, EntitleError>;

    async fn stats(&self) -> Result<LedgerStats, EntitleError>;
}

/// Change notification published by the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    Inserted { record: EntitlementRecord },
    StatusChanged {
        record: EntitlementRecord,
        previous: RecordStatus,
    },
}

impl LedgerEvent {
    pub fn record(&self) -> &EntitlementRecord {
        match self {
            Self::Inserted { record } | Self::StatusChanged { record, .. } => record,
        }
    }
}

/// Subscription to ledger events for a single buyer.
pub struct LedgerSubscription {
    buyer_id: String,
    rx: broadcast::Receiver<LedgerEvent>,
}

impl LedgerSubscription {
    pub fn buyer_id(&self) -> &str {
        &self.buyer_id
    }

    /// Next event for this buyer; `None` once the ledger is dropped. Lag is skipped.
    pub async fn next(&mut self) -> Option<LedgerEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.record().buyer_id == self.buyer_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(buyer_id = %self.buyer_id, skipped, "ledger subscription lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Why a buyer may download an asset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementReason {
    Purchased,
    Free,
    Owner,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementCheck {
    pub entitled: bool,
    pub reason: Option<EntitlementReason>,
    /// Newest row for the pair is awaiting manual confirmation.
    pub pending: bool,
}

/// Entitlement ledger: fee policy, idempotent writes, lifecycle transitions and
/// change notifications on top of a [`LedgerStore`].
#[derive(Clone)]
pub struct EntitlementLedger {
    store: Arc<dyn LedgerStore>,
    commission_bps: u32,
    events: broadcast::Sender<LedgerEvent>,
}

impl EntitlementLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self::with_commission(store, DEFAULT_COMMISSION_BPS)
    }

    pub fn with_commission(store: Arc<dyn LedgerStore>, commission_bps: u32) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            commission_bps,
            events,
        }
    }

    pub fn backend_label(&self) -> &'static str {
        self.store.backend_label()
    }

    pub fn commission_bps(&self) -> u32 {
        self.commission_bps
    }

    pub fn fee_split(&self, gross_minor: u64) -> FeeSplit {
        FeeSplit::compute(gross_minor, self.commission_bps)
    }

    pub fn subscribe(&self, buyer_id: impl Into<String>) -> LedgerSubscription {
        LedgerSubscription {
            buyer_id: buyer_id.into(),
            rx: self.events.subscribe(),
        }
    }

    /// Record a gateway-approved purchase as `completed`, keyed by payment id.
    ///
    /// A repeated call with the same payment id returns the stored row untouched,
    /// even if the other arguments differ.
    pub async fn upsert_on_approval(
        &self,
        payment_id: &str,
        buyer_id: &str,
        asset_id: &str,
        gross_minor: u64,
        method: PaymentMethod,
    ) -> Result<UpsertOutcome, EntitleError> {
        let entry = NewEntitlement {
            buyer_id: buyer_id.to_string(),
            asset_id: asset_id.to_string(),
            split: self.fee_split(gross_minor),
            payment_method: method,
            status: RecordStatus::Completed,
            payment_id: payment_id.to_string(),
        };

        let outcome = self.store.insert_if_absent(entry).await?;
        match &outcome {
            UpsertOutcome::Inserted(record) => {
                info!(
                    payment_id,
                    buyer_id,
                    asset_id,
                    amount_minor = record.amount_minor,
                    "entitlement recorded"
                );
                self.publish(LedgerEvent::Inserted {
                    record: record.clone(),
                });
            }
            UpsertOutcome::Existing(record) => {
                debug!(
                    payment_id,
                    record_id = %record.id,
                    status = record.status.as_str(),
                    "entitlement already recorded"
                );
            }
        }
        Ok(outcome)
    }

    /// Open a `pending` row for an off-platform payment awaiting manual confirmation.
    pub async fn record_pending_manual(
        &self,
        buyer_id: &str,
        asset_id: &str,
        gross_minor: u64,
        provisional_ref: &str,
        method: PaymentMethod,
    ) -> Result<EntitlementRecord, EntitleError> {
        let entry = NewEntitlement {
            buyer_id: buyer_id.to_string(),
            asset_id: asset_id.to_string(),
            split: self.fee_split(gross_minor),
            payment_method: method,
            status: RecordStatus::Pending,
            payment_id: provisional_ref.to_string(),
        };

        match self.store.insert_if_absent(entry).await? {
            UpsertOutcome::Inserted(record) => {
                info!(
                    record_id = %record.id,
                    buyer_id,
                    asset_id,
                    payment_id = provisional_ref,
                    "manual purchase awaiting confirmation"
                );
                self.publish(LedgerEvent::Inserted {
                    record: record.clone(),
                });
                Ok(record)
            }
            UpsertOutcome::Existing(record) => Ok(record),
        }
    }

    /// `pending -> completed`. Confirming an already completed row is a no-op.
    pub async fn confirm_pending(&self, record_id: Uuid) -> Result<EntitlementRecord, EntitleError> {
        self.finish_pending(record_id, RecordStatus::Completed).await
    }

    /// `pending -> rejected`. Rejecting an already rejected row is a no-op.
    pub async fn reject_pending(&self, record_id: Uuid) -> Result<EntitlementRecord, EntitleError> {
        self.finish_pending(record_id, RecordStatus::Rejected).await
    }

    async fn finish_pending(
        &self,
        record_id: Uuid,
        target: RecordStatus,
    ) -> Result<EntitlementRecord, EntitleError> {
        let transition = self
            .store
            .transition(record_id, RecordStatus::Pending, target)
            .await?
            .ok_or_else(|| EntitleError::RecordNotFound(record_id.to_string()))?;

        match transition {
            Transition::Applied(record) => {
                info!(
                    record_id = %record.id,
                    status = target.as_str(),
                    "pending record settled"
                );
                self.publish(LedgerEvent::StatusChanged {
                    record: record.clone(),
                    previous: RecordStatus::Pending,
                });
                Ok(record)
            }
            Transition::Unchanged(record) if record.status == target => Ok(record),
            Transition::Unchanged(record) => Err(EntitleError::InvalidTransition(format!(
                "record '{}' is '{}', cannot become '{}'",
                record_id,
                record.status.as_str(),
                target.as_str()
            ))),
        }
    }

    /// Free assets, owners and terminal-success purchases are entitled.
    pub async fn has_entitlement(
        &self,
        buyer_id: &str,
        asset: &AssetRecord,
    ) -> Result<bool, EntitleError> {
        Ok(self.check(buyer_id, asset).await?.entitled)
    }

    pub async fn check(
        &self,
        buyer_id: &str,
        asset: &AssetRecord,
    ) -> Result<EntitlementCheck, EntitleError> {
        if asset.is_free() {
            return Ok(EntitlementCheck {
                entitled: true,
                reason: Some(EntitlementReason::Free),
                pending: false,
            });
        }
        if asset.owner_id == buyer_id {
            return Ok(EntitlementCheck {
                entitled: true,
                reason: Some(EntitlementReason::Owner),
                pending: false,
            });
        }

        let records = self.store.find_for_pair(buyer_id, &asset.asset_id).await?;
        let purchased = records.iter().any(|record| record.status.is_success());
        let pending = !purchased
            && records
                .first()
                .map(|newest| newest.status == RecordStatus::Pending)
                .unwrap_or(false);

        Ok(EntitlementCheck {
            entitled: purchased,
            reason: purchased.then_some(EntitlementReason::Purchased),
            pending,
        })
    }

    pub async fn get(&self, record_id: Uuid) -> Result<Option<EntitlementRecord>, EntitleError> {
        self.store.get(record_id).await
    }

    pub async fn find_by_payment_id(
        &self,
        payment_id: &str,
    ) -> Result<Option<EntitlementRecord>, EntitleError> {
        self.store.find_by_payment_id(payment_id).await
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<EntitlementRecord>, EntitleError> {
        self.store.recent(limit).await
    }

    pub async fn stats(&self) -> Result<LedgerStats, EntitleError> {
        self.store.stats().await
    }

    fn publish(&self, event: LedgerEvent) {
        // No subscribers is the normal case on the server side.
        let _ = self.events.send(event);
    }
}

/// Provisional reference for manual purchases, unique per call.
pub fn manual_payment_ref() -> String {
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
    format!("manual_{}_{}", Utc::now().timestamp_millis(), suffix)
}
