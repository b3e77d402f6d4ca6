//! Reasoning and action boundaries
//!
//! Both collaborators are black boxes. Failures surface as `CollaboratorError`
//! and drive mission-level retries.

use async_trait::async_trait;
use dart_kernel::types::MissionId;
use serde::{Deserialize, Serialize};

use crate::error::CollaboratorError;
use crate::types::{Alert, Conflict, Diagnosis, EvidenceSet, RemediationProposal};

/// Input to `diagnose`
#[derive(Debug, Clone)]
pub struct DiagnosisRequest {
    pub mission_id: MissionId,
    pub alert: Alert,
    pub evidence: EvidenceSet,
    /// Compacted evidence
    pub digest: String,
    /// Vendor conflict, if one was raised
    pub conflict: Option<Conflict>,
    pub loop_count: u32,
}

/// Input to `propose_remediation`
#[derive(Debug, Clone)]
pub struct RemediationRequest {
    pub mission_id: MissionId,
    pub alert: Alert,
    pub diagnosis: Diagnosis,
    pub digest: String,
    /// Earlier proposals a human rejected, oldest first
    pub denied: Vec<RemediationProposal>,
}

/// Diagnosis and patch oracle
#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn diagnose(&self, request: &DiagnosisRequest) -> Result<Diagnosis, CollaboratorError>;

    async fn propose_remediation(
        &self,
        request: &RemediationRequest,
    ) -> Result<RemediationProposal, CollaboratorError>;
}

/// What the tool boundary reports after executing a proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionReceipt {
    pub detail: String,
    /// Post-action check; `Some(false)` means the effect is absent
    pub verified: Option<bool>,
}

impl ActionReceipt {
    /// Receipt confirmed by a post-action check
    #[must_use]
    pub fn verified(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            verified: Some(true),
        }
    }

    /// Whether the receipt counts as a failed action
    #[inline]
    #[must_use]
    pub fn is_ineffective(&self) -> bool {
        self.verified == Some(false)
    }
}

/// Executes approved proposals (deploy, ticket, source control)
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, proposal: &RemediationProposal) -> Result<ActionReceipt, CollaboratorError>;
}
