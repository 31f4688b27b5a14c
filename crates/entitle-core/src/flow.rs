use crate::error::EntitleError;

/// Stages of one verification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationStage {
    Received,
    GatewayChecked,
    Rejected,
    LedgerWritten,
    CredentialIssued,
    Responded,
}

impl VerificationStage {
    pub fn name(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::GatewayChecked => "gateway_checked",
            Self::Rejected => "rejected",
            Self::LedgerWritten => "ledger_written",
            Self::CredentialIssued => "credential_issued",
            Self::Responded => "responded",
        }
    }
}

/// Enforces received->gateway_checked->{rejected | ledger_written->{rejected | credential_issued}}->responded.
///
/// Rejection after `ledger_written` covers a payment whose existing row belongs to
/// another asset.
/// A degraded approval still passes through `ledger_written` and `credential_issued`;
/// the stage records that the step ran, not that it succeeded.
#[derive(Debug, Clone)]
pub struct VerificationStageMachine {
    payment_ref: String,
    stage: VerificationStage,
}

impl VerificationStageMachine {
    pub fn new(payment_ref: impl Into<String>) -> Self {
        Self {
            payment_ref: payment_ref.into(),
            stage: VerificationStage::Received,
        }
    }

    pub fn payment_ref(&self) -> &str {
        &self.payment_ref
    }

    pub fn stage(&self) -> VerificationStage {
        self.stage
    }

    pub fn mark_gateway_checked(&mut self) -> Result<(), EntitleError> {
        self.advance(VerificationStage::Received, VerificationStage::GatewayChecked)
    }

    pub fn mark_rejected(&mut self) -> Result<(), EntitleError> {
        match self.stage {
            VerificationStage::GatewayChecked | VerificationStage::LedgerWritten => {
                self.stage = VerificationStage::Rejected;
                Ok(())
            }
            other => Err(EntitleError::stage_violation(
                "gateway_checked|ledger_written",
                other.name(),
            )),
        }
    }

    pub fn mark_ledger_written(&mut self) -> Result<(), EntitleError> {
        self.advance(VerificationStage::GatewayChecked, VerificationStage::LedgerWritten)
    }

    pub fn mark_credential_issued(&mut self) -> Result<(), EntitleError> {
        self.advance(VerificationStage::LedgerWritten, VerificationStage::CredentialIssued)
    }

    pub fn mark_responded(&mut self) -> Result<(), EntitleError> {
        match self.stage {
            VerificationStage::Rejected | VerificationStage::CredentialIssued => {
                self.stage = VerificationStage::Responded;
                Ok(())
            }
            other => Err(EntitleError::stage_violation(
                "rejected|credential_issued",
                other.name(),
            )),
        }
    }

    fn advance(
        &mut self,
        expected_current: VerificationStage,
        next: VerificationStage,
    ) -> Result<(), EntitleError> {
        if self.stage != expected_current {
            return Err(EntitleError::stage_violation(
                expected_current.name(),
                self.stage.name(),
            ));
        }
        self.stage = next;
        Ok(())
    }
}
