use crate::error::EntitleError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Platform commission applied to every purchase, in basis points (10%).
pub const DEFAULT_COMMISSION_BPS: u32 = 1_000;

const BPS_DENOMINATOR: u128 = 10_000;

/// Split of a gross purchase amount between the platform and the asset owner.
///
/// Amounts are integer minor units so `platform_fee + seller_earnings == gross`
/// holds exactly; the fee is rounded half-up to the nearest minor unit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeeSplit {
    pub gross_minor: u64,
    pub platform_fee_minor: u64,
    pub seller_earnings_minor: u64,
}

impl FeeSplit {
    pub fn compute(gross_minor: u64, commission_bps: u32) -> Self {
        let bps = u128::from(commission_bps.min(10_000));
        let fee = (u128::from(gross_minor) * bps + BPS_DENOMINATOR / 2) / BPS_DENOMINATOR;
        // fee <= gross because bps is capped at 100%.
        let platform_fee_minor = u64::try_from(fee).unwrap_or(gross_minor);
        Self {
            gross_minor,
            platform_fee_minor,
            seller_earnings_minor: gross_minor - platform_fee_minor,
        }
    }

    pub fn is_balanced(&self) -> bool {
        self.platform_fee_minor
            .checked_add(self.seller_earnings_minor)
            .map(|sum| sum == self.gross_minor)
            .unwrap_or(false)
    }
}

/// Ledger row lifecycle.
///
/// `Completed` and `Approved` are both terminal success states; `Approved` is kept
/// for rows written by integrations that use the gateway's own vocabulary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Completed,
    Approved,
    Rejected,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Result<Self, EntitleError> {
        match value {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(EntitleError::Serialization(format!(
                "unknown record status '{other}'"
            ))),
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Completed | Self::Approved)
    }
}

/// Payment method tag stored on each ledger row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Mercadopago,
    Paypal,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mercadopago => "mercadopago",
            Self::Paypal => "paypal",
        }
    }

    pub fn parse(value: &str) -> Result<Self, EntitleError> {
        match value {
            "mercadopago" => Ok(Self::Mercadopago),
            "paypal" => Ok(Self::Paypal),
            other => Err(EntitleError::Serialization(format!(
                "unknown payment method '{other}'"
            ))),
        }
    }

    /// Manual settlement rail offered to a buyer based on their profile country.
    pub fn for_country(country: Option<&str>) -> Self {
        match country.map(str::trim) {
            Some(c) if c.eq_ignore_ascii_case("argentina") || c.eq_ignore_ascii_case("ar") => {
                Self::Mercadopago
            }
            _ => Self::Paypal,
        }
    }
}

/// One row of the entitlement ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntitlementRecord {
    pub id: Uuid,
    pub buyer_id: String,
    pub asset_id: String,
    pub amount_minor: u64,
    pub platform_fee_minor: u64,
    pub seller_earnings_minor: u64,
    pub payment_method: PaymentMethod,
    pub status: RecordStatus,
    /// External payment reference; unique across the ledger.
    pub payment_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Row about to be written; ids and timestamps are assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntitlement {
    pub buyer_id: String,
    pub asset_id: String,
    pub split: FeeSplit,
    pub payment_method: PaymentMethod,
    pub status: RecordStatus,
    pub payment_id: String,
}

impl NewEntitlement {
    pub fn into_record(self, now: DateTime<Utc>) -> EntitlementRecord {
        EntitlementRecord {
            id: Uuid::new_v4(),
            buyer_id: self.buyer_id,
            asset_id: self.asset_id,
            amount_minor: self.split.gross_minor,
            platform_fee_minor: self.split.platform_fee_minor,
            seller_earnings_minor: self.split.seller_earnings_minor,
            payment_method: self.payment_method,
            status: self.status,
            payment_id: self.payment_id,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Catalog entry for a purchasable asset. Read-only for this crate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssetRecord {
    pub asset_id: String,
    pub title: String,
    pub price_minor: u64,
    pub owner_id: String,
    /// Object path inside the storage bucket, e.g. `user-1/bracket.stl`.
    pub storage_path: String,
}

impl AssetRecord {
    pub fn is_free(&self) -> bool {
        self.price_minor == 0
    }

    /// Last path segment of the storage location.
    pub fn filename(&self) -> Option<String> {
        self.storage_path
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .map(str::to_string)
    }

    pub fn summary(&self) -> AssetSummary {
        AssetSummary {
            asset_id: self.asset_id.clone(),
            title: self.title.clone(),
            price_minor: self.price_minor,
            owner_id: self.owner_id.clone(),
            storage_path: self.storage_path.clone(),
        }
    }
}

/// Asset details echoed back to the client so it can render a fallback state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AssetSummary {
    pub asset_id: String,
    pub title: String,
    pub price_minor: u64,
    pub owner_id: String,
    pub storage_path: String,
}
