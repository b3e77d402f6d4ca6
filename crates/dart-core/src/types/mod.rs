//! Mission data model

pub mod evidence;
pub mod mission;

pub(crate) use evidence::clamp_unit;
pub use evidence::{
    ApprovalDecision, Conflict, ConflictKind, Diagnosis, DiagnosisSource, Evidence, EvidenceKind,
    EvidenceSet, GateVerdict, ProposalOrigin, RemediationProposal, RiskTier, VendorSignal,
    VendorStatus,
};
pub use mission::{
    Alert, EscalationReason, Mission, MissionMetrics, MissionRecord, MissionReport, Severity,
};
