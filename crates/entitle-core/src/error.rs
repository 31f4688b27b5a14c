use thiserror::Error;

/// Entitlement engine errors.
///
/// Variants before `InvalidRequest` mirror the verification failure taxonomy; the
/// orchestrator decides per variant whether a failure is fatal or degrades.
#[derive(Debug, Error)]
pub enum EntitleError {
    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error(
        "Payment not approved (status '{status}', detail '{}')",
        .detail.as_deref().unwrap_or("none")
    )]
    PaymentNotApproved {
        status: String,
        detail: Option<String>,
    },

    #[error("Payment '{0}' missing buyer reference")]
    MissingBuyerReference(String),

    #[error("Payment '{payment_id}' was made for asset '{paid_asset}'")]
    AssetMismatch {
        payment_id: String,
        paid_asset: String,
    },

    #[error("Asset '{0}' not found")]
    AssetNotFound(String),

    #[error("Ledger write failed: {0}")]
    LedgerWriteFailed(String),

    #[error("Credential issuance failed: {0}")]
    CredentialIssuanceFailed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Record '{0}' not found")]
    RecordNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EntitleError {
    pub fn stage_violation(expected: &str, actual: &str) -> Self {
        Self::InvalidTransition(format!(
            "verification stage order violation: expected '{}', got '{}'",
            expected, actual
        ))
    }

    /// Only gateway outages are worth retrying; everything else is terminal for the attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::GatewayUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_gateway_outage_is_retryable() {
        assert!(EntitleError::GatewayUnavailable("timeout".into()).is_retryable());
        assert!(!EntitleError::AssetNotFound("m1".into()).is_retryable());
        assert!(!EntitleError::MissingBuyerReference("pay_1".into()).is_retryable());
    }

    #[test]
    fn rejection_messages_name_the_payment_facts() {
        let not_approved = EntitleError::PaymentNotApproved {
            status: "rejected".into(),
            detail: Some("cc_rejected_other_reason".into()),
        };
        assert_eq!(
            not_approved.to_string(),
            "Payment not approved (status 'rejected', detail 'cc_rejected_other_reason')"
        );
        let mismatch = EntitleError::AssetMismatch {
            payment_id: "pay_1".into(),
            paid_asset: "cheap".into(),
        };
        assert_eq!(mismatch.to_string(), "Payment 'pay_1' was made for asset 'cheap'");
        assert!(!mismatch.is_retryable());
    }
}
