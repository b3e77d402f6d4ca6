//! Evidence, vendor signals, conflicts and remediation proposals

use std::time::Duration;

use chrono::{DateTime, Utc};
use dart_kernel::types::{EvidenceId, ProposalId, SignalId};
use serde::{Deserialize, Serialize};

/// Fixed enumeration of evidence sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvidenceKind {
    Logs,
    Schema,
    DataSample,
    SignatureScan,
}

impl EvidenceKind {
    /// Every kind, in fan-out order
    pub const ALL: [EvidenceKind; 4] = [
        EvidenceKind::Logs,
        EvidenceKind::Schema,
        EvidenceKind::DataSample,
        EvidenceKind::SignatureScan,
    ];

    /// Stable name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceKind::Logs => "logs",
            EvidenceKind::Schema => "schema",
            EvidenceKind::DataSample => "data-sample",
            EvidenceKind::SignatureScan => "signature-scan",
        }
    }
}

impl std::fmt::Display for EvidenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One fetched diagnostic artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub id: EvidenceId,
    pub kind: EvidenceKind,
    /// Where the raw payload lives (path, URL, query id)
    pub payload_ref: String,
    /// Compacted form
    pub summary: String,
    pub matches_known_signature: bool,
    /// How strongly this artifact implies failure, in `[0, 1]`
    pub failure_signal: f64,
}

impl Evidence {
    /// New evidence with no failure signal
    #[must_use]
    pub fn new(kind: EvidenceKind, payload_ref: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            id: EvidenceId::new(),
            kind,
            payload_ref: payload_ref.into(),
            summary: summary.into(),
            matches_known_signature: false,
            failure_signal: 0.0,
        }
    }

    /// Set the failure signal, clamped to `[0, 1]`
    #[inline]
    #[must_use]
    pub fn with_failure_signal(mut self, signal: f64) -> Self {
        self.failure_signal = clamp_unit(signal);
        self
    }

    /// Mark as matching a known signature
    #[inline]
    #[must_use]
    pub fn with_signature_match(mut self, matched: bool) -> Self {
        self.matches_known_signature = matched;
        self
    }
}

/// Evidence merged across collectors and loops
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceSet {
    items: Vec<Evidence>,
}

impl EvidenceSet {
    /// Empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add evidence
    pub fn extend(&mut self, evidence: impl IntoIterator<Item = Evidence>) {
        self.items.extend(evidence);
    }

    /// All items in merge order
    #[must_use]
    pub fn items(&self) -> &[Evidence] {
        &self.items
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Noisy-or combination of every failure signal
    #[must_use]
    pub fn failure_likelihood(&self) -> f64 {
        1.0 - self
            .items
            .iter()
            .map(|e| 1.0 - clamp_unit(e.failure_signal))
            .product::<f64>()
    }

    /// Ids of items that point toward failure
    #[must_use]
    pub fn failing_ids(&self) -> Vec<EvidenceId> {
        self.items
            .iter()
            .filter(|e| e.failure_signal > 0.0)
            .map(|e| e.id)
            .collect()
    }

    /// Compacted digest: at most `limit` lines, strongest failure signals first
    #[must_use]
    pub fn digest(&self, limit: usize) -> String {
        let mut ranked: Vec<&Evidence> = self.items.iter().collect();
        ranked.sort_by(|a, b| b.failure_signal.total_cmp(&a.failure_signal));
        ranked
            .into_iter()
            .take(limit)
            .map(|e| format!("[{}] {}", e.kind, truncate(&e.summary, DIGEST_LINE_CHARS)))
            .collect::<Vec<_>>()
            .join("
")
    }
}

const DIGEST_LINE_CHARS: usize = 160;

fn truncate(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

pub(crate) fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}

/// Status claimed by the vendor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VendorStatus {
    Healthy,
    Degraded,
    /// No usable answer (probe exhausted or timed out)
    Unknown,
}

impl VendorStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            VendorStatus::Healthy => "healthy",
            VendorStatus::Degraded => "degraded",
            VendorStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for VendorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one vendor probe (after retries)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorSignal {
    pub id: SignalId,
    pub status: VendorStatus,
    pub attempts: u32,
    pub latency: Duration,
    pub raw_response: Option<String>,
    pub observed_at: DateTime<Utc>,
}

impl VendorSignal {
    /// Absence of signal
    #[must_use]
    pub fn unknown(attempts: u32, latency: Duration) -> Self {
        Self {
            id: SignalId::new(),
            status: VendorStatus::Unknown,
            attempts,
            latency,
            raw_response: None,
            observed_at: Utc::now(),
        }
    }
}

/// Direction of a vendor/evidence disagreement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Vendor says healthy, evidence implies failure
    HealthyClaimContradicted,
    /// Vendor says degraded, evidence is clean
    DegradedClaimUnsupported,
}

/// Derived disagreement between a vendor claim and the evidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub kind: ConflictKind,
    /// In `[0, 1]`
    pub severity: f64,
    /// Signed adjustment applied to mission confidence
    pub confidence_delta: f64,
    pub evidence_ids: Vec<EvidenceId>,
    pub signal_id: SignalId,
    /// Vendor judged to be lying
    pub deception: bool,
}

/// Risk classification of a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Low,
    Elevated,
    High,
}

impl RiskTier {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::Low => "low",
            RiskTier::Elevated => "elevated",
            RiskTier::High => "high",
        }
    }
}

impl std::fmt::Display for RiskTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a proposal came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalOrigin {
    Reasoning,
    Memory,
}

/// Candidate fix awaiting the safety gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationProposal {
    pub id: ProposalId,
    /// Action text or diff
    pub action: String,
    pub impact_summary: String,
    /// Collaborator's own risk estimate; can only raise the classified tier
    pub declared_tier: Option<RiskTier>,
    pub rollback: String,
    /// Short category such as `create_view` or `config_change`
    pub fix_type: String,
    pub origin: ProposalOrigin,
}

impl RemediationProposal {
    /// Proposal from the reasoning collaborator
    #[must_use]
    pub fn new(action: impl Into<String>, fix_type: impl Into<String>) -> Self {
        Self {
            id: ProposalId::new(),
            action: action.into(),
            impact_summary: String::new(),
            declared_tier: None,
            rollback: String::new(),
            fix_type: fix_type.into(),
            origin: ProposalOrigin::Reasoning,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_impact(mut self, impact: impl Into<String>) -> Self {
        self.impact_summary = impact.into();
        self
    }

    #[inline]
    #[must_use]
    pub fn with_rollback(mut self, rollback: impl Into<String>) -> Self {
        self.rollback = rollback.into();
        self
    }

    #[inline]
    #[must_use]
    pub fn with_declared_tier(mut self, tier: RiskTier) -> Self {
        self.declared_tier = Some(tier);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_origin(mut self, origin: ProposalOrigin) -> Self {
        self.origin = origin;
        self
    }
}

/// Safety gate verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateVerdict {
    AutoApproved,
    PendingApproval,
    Approved,
    Denied,
}

impl GateVerdict {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            GateVerdict::AutoApproved => "auto_approved",
            GateVerdict::PendingApproval => "pending_approval",
            GateVerdict::Approved => "approved",
            GateVerdict::Denied => "denied",
        }
    }
}

impl std::fmt::Display for GateVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human decision on a pending proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Denied,
}

impl From<ApprovalDecision> for GateVerdict {
    fn from(decision: ApprovalDecision) -> Self {
        match decision {
            ApprovalDecision::Approved => GateVerdict::Approved,
            ApprovalDecision::Denied => GateVerdict::Denied,
        }
    }
}

/// Where a diagnosis came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosisSource {
    /// Deterministic signature rule
    Signature,
    /// Reasoning collaborator
    Reasoning,
    /// Recalled past incident
    Memory,
}

/// Root cause hypothesis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub root_cause: String,
    /// In `[0, 1]`
    pub confidence_hint: f64,
    pub source: DiagnosisSource,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noisy_or_combines_signals() {
        let mut set = EvidenceSet::new();
        set.extend([
            Evidence::new(EvidenceKind::Logs, "logs://1", "503 upstream").with_failure_signal(0.5),
            Evidence::new(EvidenceKind::Schema, "schema://1", "column missing").with_failure_signal(0.5),
        ]);
        assert!((set.failure_likelihood() - 0.75).abs() < 1e-9);
        assert!(EvidenceSet::new().failure_likelihood().abs() < 1e-9);
    }

    #[test]
    fn digest_orders_by_signal_and_limits() {
        let mut set = EvidenceSet::new();
        set.extend([
            Evidence::new(EvidenceKind::Logs, "a", "quiet").with_failure_signal(0.1),
            Evidence::new(EvidenceKind::Schema, "b", "column region missing").with_failure_signal(0.9),
            Evidence::new(EvidenceKind::DataSample, "c", "nulls").with_failure_signal(0.4),
        ]);
        let digest = set.digest(2);
        assert_eq!(digest, "[schema] column region missing\n[data-sample] nulls");
    }

    #[test]
    fn failure_signal_is_clamped() {
        let e = Evidence::new(EvidenceKind::Logs, "a", "x").with_failure_signal(7.0);
        assert!((e.failure_signal - 1.0).abs() < f64::EPSILON);
        let e = Evidence::new(EvidenceKind::Logs, "a", "x").with_failure_signal(f64::NAN);
        assert!(e.failure_signal.abs() < f64::EPSILON);
    }

    #[test]
    fn risk_tiers_are_ordered() {
        assert!(RiskTier::Low < RiskTier::Elevated);
        assert!(RiskTier::Elevated < RiskTier::High);
    }
}
