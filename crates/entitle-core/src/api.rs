//! JSON bodies of the verification endpoint, shared by the server and HTTP clients.

use crate::credentials::CredentialSource;
use crate::error::EntitleError;
use crate::gateway::GatewayStatus;
use crate::orchestrator::{EntitledReceipt, VerificationOutcome};
use crate::types::AssetSummary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VerifySuccessBody {
    pub success: bool,
    pub entitled: bool,
    pub signed_url: Option<String>,
    pub filename: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_summary: Option<AssetSummary>,
    pub payment_id: String,
    pub asset_id: String,
    pub credential_source: Option<CredentialSource>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RejectionCode {
    NotApproved,
    MissingBuyerReference,
    AssetMismatch,
    InvalidRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRejectionBody {
    pub error: String,
    pub code: RejectionCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default)]
    pub retryable: bool,
    #[serde(default)]
    pub entitled: bool,
}

/// Verification endpoint response: 200 with a success body or 400 with a rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResponse {
    Success(VerifySuccessBody),
    Rejection(VerifyRejectionBody),
}

impl VerifyResponse {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::Rejection(VerifyRejectionBody {
            error: message.into(),
            code: RejectionCode::InvalidRequest,
            payment_id: None,
            status: None,
            detail: None,
            retryable: false,
            entitled: false,
        })
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::Success(_) => 200,
            Self::Rejection(_) => 400,
        }
    }

    pub fn to_json(&self) -> Result<serde_json::Value, EntitleError> {
        let value = match self {
            Self::Success(body) => serde_json::to_value(body),
            Self::Rejection(body) => serde_json::to_value(body),
        };
        value.map_err(|e| EntitleError::Serialization(e.to_string()))
    }

    /// Decode a response received over HTTP.
    pub fn from_http(status: u16, body: serde_json::Value) -> Result<Self, EntitleError> {
        let decoded = if status == 200 {
            serde_json::from_value(body).map(Self::Success)
        } else if status == 400 {
            serde_json::from_value(body).map(Self::Rejection)
        } else {
            let message = body
                .get("error")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unexpected verification response")
                .to_string();
            return Err(EntitleError::GatewayUnavailable(format!(
                "verification endpoint returned {status}: {message}"
            )));
        };
        decoded.map_err(|e| EntitleError::Serialization(e.to_string()))
    }

    pub fn into_outcome(self) -> Result<VerificationOutcome, EntitleError> {
        match self {
            Self::Success(body) => Ok(VerificationOutcome::Entitled(EntitledReceipt {
                payment_id: body.payment_id,
                asset_id: body.asset_id,
                download_url: body.signed_url,
                filename: body.filename,
                message: body.message,
                asset: body.asset_summary,
                credential_source: body.credential_source,
                expires_at: body.expires_at,
                warnings: body.warnings,
                record: None,
            })),
            Self::Rejection(body) => match body.code {
                RejectionCode::NotApproved => Ok(VerificationOutcome::NotApproved {
                    status: body
                        .status
                        .as_deref()
                        .map(GatewayStatus::from_provider)
                        .unwrap_or(GatewayStatus::Unknown),
                    detail: body.detail,
                    retryable: body.retryable,
                }),
                RejectionCode::MissingBuyerReference => {
                    Ok(VerificationOutcome::MissingBuyerReference {
                        payment_id: body.detail.unwrap_or_default(),
                    })
                }
                RejectionCode::AssetMismatch => Ok(VerificationOutcome::AssetMismatch {
                    payment_id: body.payment_id.unwrap_or_default(),
                    paid_asset: body.detail.unwrap_or_default(),
                }),
                RejectionCode::InvalidRequest => Err(EntitleError::InvalidRequest(body.error)),
            },
        }
    }
}

impl From<VerificationOutcome> for VerifyResponse {
    fn from(outcome: VerificationOutcome) -> Self {
        match outcome {
            VerificationOutcome::Entitled(receipt) => Self::Success(VerifySuccessBody {
                success: true,
                entitled: true,
                signed_url: receipt.download_url,
                filename: receipt.filename,
                message: receipt.message,
                asset_summary: receipt.asset,
                payment_id: receipt.payment_id,
                asset_id: receipt.asset_id,
                credential_source: receipt.credential_source,
                expires_at: receipt.expires_at,
                warnings: receipt.warnings,
            }),
            VerificationOutcome::NotApproved {
                status,
                detail,
                retryable,
            } => Self::Rejection(VerifyRejectionBody {
                error: "Payment not approved".to_string(),
                code: RejectionCode::NotApproved,
                payment_id: None,
                status: Some(status.as_str().to_string()),
                detail,
                retryable,
                entitled: false,
            }),
            VerificationOutcome::MissingBuyerReference { payment_id } => {
                Self::Rejection(VerifyRejectionBody {
                    error: "Payment is missing its buyer reference; contact support".to_string(),
                    code: RejectionCode::MissingBuyerReference,
                    payment_id: None,
                    status: Some(GatewayStatus::Approved.as_str().to_string()),
                    detail: Some(payment_id),
                    retryable: false,
                    entitled: false,
                })
            }
            VerificationOutcome::AssetMismatch {
                payment_id,
                paid_asset,
            } => Self::Rejection(VerifyRejectionBody {
                error: "Payment was made for a different item; contact support".to_string(),
                code: RejectionCode::AssetMismatch,
                payment_id: Some(payment_id),
                status: Some(GatewayStatus::Approved.as_str().to_string()),
                detail: Some(paid_asset),
                retryable: false,
                entitled: false,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejection_body_shape() {
        let response = VerifyResponse::from(VerificationOutcome::NotApproved {
            status: GatewayStatus::Rejected,
            detail: Some("cc_rejected_insufficient_amount".into()),
            retryable: false,
        });
        assert_eq!(response.status_code(), 400);
        assert_eq!(
            response.to_json().unwrap(),
            json!({
                "error": "Payment not approved",
                "code": "not_approved",
                "status": "rejected",
                "detail": "cc_rejected_insufficient_amount",
                "retryable": false,
                "entitled": false
            })
        );
    }

    #[test]
    fn asset_mismatch_survives_the_wire() {
        let outcome = VerificationOutcome::AssetMismatch {
            payment_id: "pay_1".into(),
            paid_asset: "cheap".into(),
        };
        let response = VerifyResponse::from(outcome.clone());
        let body = response.to_json().unwrap();
        assert_eq!(body["code"], "asset_mismatch");
        assert_eq!(body["paymentId"], "pay_1");
        assert_eq!(body["entitled"], false);

        let decoded = VerifyResponse::from_http(400, body)
            .unwrap()
            .into_outcome()
            .unwrap();
        assert_eq!(decoded, outcome);
    }

    #[test]
    fn degraded_success_keeps_null_url() {
        let body = json!({
            "success": true,
            "entitled": true,
            "signedUrl": null,
            "filename": null,
            "message": "Payment confirmed",
            "paymentId": "pay_1",
            "assetId": "m1",
            "credentialSource": null,
            "expiresAt": null
        });
        let outcome = VerifyResponse::from_http(200, body)
            .unwrap()
            .into_outcome()
            .unwrap();
        let VerificationOutcome::Entitled(receipt) = outcome else {
            panic!("expected entitlement");
        };
        assert!(receipt.is_degraded());
        assert!(receipt.warnings.is_empty());
    }

    #[test]
    fn server_errors_surface_as_unavailable() {
        let err = VerifyResponse::from_http(500, json!({"error": "boom"})).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn invalid_request_decodes_to_error() {
        let body = VerifyResponse::invalid_request("Missing paymentReference or assetId")
            .to_json()
            .unwrap();
        let err = VerifyResponse::from_http(400, body)
            .unwrap()
            .into_outcome()
            .unwrap_err();
        assert!(matches!(err, EntitleError::InvalidRequest(_)));
    }
}
