//! Alerts, missions and their archived records

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use dart_kernel::audit::AuditEntry;
use dart_kernel::types::{MissionId, Outcome, Stage};
use serde::{Deserialize, Serialize};

use super::evidence::{Diagnosis, GateVerdict, ProposalOrigin, RemediationProposal, VendorStatus};

/// Alert severity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Incoming incident alert that opens a mission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub source_system: String,
    pub error_code: String,
    pub message: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Alert {
    /// New alert with medium severity
    #[must_use]
    pub fn new(
        source_system: impl Into<String>,
        error_code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            source_system: source_system.into(),
            error_code: error_code.into(),
            message: message.into(),
            severity: Severity::Medium,
            metadata: BTreeMap::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Signature used for memory lookup: `"{error_code} {message}"`
    #[must_use]
    pub fn signature(&self) -> String {
        format!("{} {}", self.error_code, self.message)
    }
}

/// Snapshot of one incident investigation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mission {
    pub id: MissionId,
    pub alert: Alert,
    pub stage: Stage,
    pub loop_count: u32,
    pub max_loops: u32,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    /// In `[0, 1]`
    pub confidence: f64,
    pub outcome: Option<Outcome>,
}

impl Mission {
    /// Fresh mission in `Created`
    #[must_use]
    pub fn new(alert: Alert, max_loops: u32) -> Self {
        Self {
            id: MissionId::new(),
            alert,
            stage: Stage::Created,
            loop_count: 0,
            max_loops,
            created_at: Utc::now(),
            closed_at: None,
            confidence: 0.0,
            outcome: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.stage.is_terminal()
    }
}

/// Why automation stopped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum EscalationReason {
    /// Confidence stayed below threshold through every loop
    LowConfidence { loops: u32, confidence: f64 },
    /// A vendor conflict was never explained
    UnresolvedConflict { severity: f64 },
    /// Proposals were denied until the loop budget ran out
    GateDenied { rationale: String },
    /// No collector produced evidence
    EvidenceUnavailable { loops: u32 },
    /// The reasoning collaborator kept failing
    ReasoningUnavailable { attempts: u32 },
    /// Nobody answered the approval request in time
    ApprovalTimeout { after_ms: u64 },
    /// The remediation failed or did not take effect
    ActionFailed { detail: String },
    /// The mission loop itself misbehaved
    Internal { detail: String },
}

impl std::fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LowConfidence { loops, confidence } => write!(
                f,
                "confidence {confidence:.2} still below threshold after {loops} loops"
            ),
            Self::UnresolvedConflict { severity } => {
                write!(f, "vendor conflict (severity {severity:.2}) left unresolved")
            }
            Self::GateDenied { rationale } => write!(f, "remediation denied: {rationale}"),
            Self::EvidenceUnavailable { loops } => {
                write!(f, "evidence unavailable from every collector across {loops} loops")
            }
            Self::ReasoningUnavailable { attempts } => {
                write!(f, "reasoning service unavailable after {attempts} attempts")
            }
            Self::ApprovalTimeout { after_ms } => {
                write!(f, "approval not received within {after_ms}ms")
            }
            Self::ActionFailed { detail } => write!(f, "remediation failed: {detail}"),
            Self::Internal { detail } => write!(f, "internal error: {detail}"),
        }
    }
}

/// Evaluation summary of one mission
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MissionMetrics {
    pub duration_ms: u64,
    /// Loops consumed (0 when the first pass succeeded)
    pub loop_attempts: u32,
    pub approval_requests: u32,
    pub last_approval: Option<GateVerdict>,
    pub vendor_verdict: Option<VendorStatus>,
    pub deception_detected: bool,
    pub fast_tracked: bool,
    pub remediation_origin: Option<ProposalOrigin>,
    pub evidence_count: usize,
    pub reasoning_calls: u32,
}

/// Final report returned when a mission closes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionReport {
    pub mission_id: MissionId,
    pub outcome: Outcome,
    pub escalation: Option<EscalationReason>,
    /// Human-readable summary derived from the audit trail
    pub summary: String,
    pub confidence: f64,
    pub loop_count: u32,
    pub diagnosis: Option<Diagnosis>,
    pub proposal: Option<RemediationProposal>,
    pub metrics: MissionMetrics,
}

/// Archived, immutable mission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionRecord {
    pub mission: Mission,
    pub audit: Vec<AuditEntry>,
    pub outcome: Outcome,
    pub report: MissionReport,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_joins_code_and_message() {
        let alert = Alert::new("orders-db", "ERROR_DIV_ZERO", "division by zero in revenue view");
        assert_eq!(alert.signature(), "ERROR_DIV_ZERO division by zero in revenue view");
    }

    #[test]
    fn alert_yaml_defaults() {
        let alert: Alert = serde_yaml::from_str(
            "id: a-1\nsource_system: etl\nerror_code: E1\nmessage: boom\n",
        )
        .unwrap();
        assert_eq!(alert.severity, Severity::Medium);
        assert!(alert.metadata.is_empty());
    }

    #[test]
    fn escalation_reason_cites_evidence() {
        let reason = EscalationReason::EvidenceUnavailable { loops: 3 };
        assert!(reason.to_string().contains("evidence unavailable"));
    }
}
