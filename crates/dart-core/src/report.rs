//! Mission summaries derived from the audit trail

use dart_kernel::audit::{AuditEntry, AuditKind};
use dart_kernel::types::{Outcome, Stage};

use crate::types::{EscalationReason, MissionReport};

const MAX_CITED_WARNINGS: usize = 3;

/// Human-readable summary of a closed mission
///
/// Built only from audit entries plus the terminal outcome, so an archived
/// record can always be re-summarized.
#[must_use]
pub fn summarize(outcome: Outcome, reason: Option<&EscalationReason>, entries: &[AuditEntry]) -> String {
    let mut parts = Vec::new();

    parts.push(match (outcome, reason) {
        (Outcome::Escalated, Some(reason)) => format!("escalated: {reason}"),
        (Outcome::Escalated, None) => "escalated".to_string(),
        (Outcome::Aborted, _) => "aborted by operator".to_string(),
        (Outcome::Resolved, _) => {
            let executed = entries
                .iter()
                .rev()
                .find(|e| e.kind == AuditKind::Decision && e.summary.starts_with("remediation executed"));
            match executed {
                Some(entry) => format!("resolved: {}", entry.summary),
                None => "resolved".to_string(),
            }
        }
    });

    let observations = entries
        .iter()
        .filter(|e| e.kind == AuditKind::Transition && e.summary.ends_with("-> observing"))
        .count();
    if observations > 0 {
        parts.push(format!("{observations} observation pass(es)"));
    }

    let mut warnings: Vec<&str> = Vec::new();
    for entry in entries.iter().filter(|e| e.kind == AuditKind::Warning) {
        if !warnings.contains(&entry.summary.as_str()) {
            warnings.push(&entry.summary);
        }
    }
    if !warnings.is_empty() {
        let total = entries.iter().filter(|e| e.kind == AuditKind::Warning).count();
        let cited: Vec<&str> = warnings.iter().take(MAX_CITED_WARNINGS).copied().collect();
        parts.push(format!("{total} warning(s): {}", cited.join(", ")));
    }

    let conflicts: Vec<&AuditEntry> = entries.iter().filter(|e| e.kind == AuditKind::Conflict).collect();
    if let Some(last) = conflicts.last() {
        parts.push(format!("{} conflict(s), last: {}", conflicts.len(), last.summary));
    }

    if let Some(gate) = entries
        .iter()
        .rev()
        .find(|e| e.kind == AuditKind::Gate && e.stage != Stage::Closed)
    {
        parts.push(format!("gate: {}", gate.summary));
    }

    parts.join("; ")
}

/// Fixed-width table of scenario results
#[must_use]
pub fn render_table(rows: &[(String, MissionReport)]) -> String {
    let name_width = rows
        .iter()
        .map(|(name, _)| name.len())
        .max()
        .unwrap_or(0)
        .max("scenario".len());

    let mut out = format!(
        "{:<name_width$}  {:<9}  {:>5}  {:>9}  {:>8}  {:<9}  {:<9}  {}\n",
        "scenario", "outcome", "loops", "approvals", "duration", "vendor", "origin", "reason"
    );
    for (name, report) in rows {
        let vendor = report
            .metrics
            .vendor_verdict
            .map_or("-".to_string(), |v| v.to_string());
        let vendor = if report.metrics.deception_detected {
            format!("{vendor}*")
        } else {
            vendor
        };
        let origin = match report.metrics.remediation_origin {
            Some(crate::types::ProposalOrigin::Memory) => "memory",
            Some(crate::types::ProposalOrigin::Reasoning) => "reasoning",
            None => "-",
        };
        let reason = report
            .escalation
            .as_ref()
            .map_or_else(|| "-".to_string(), ToString::to_string);
        out.push_str(&format!(
            "{:<name_width$}  {:<9}  {:>5}  {:>9}  {:>7}ms  {:<9}  {:<9}  {}\n",
            name,
            report.outcome.as_str(),
            report.loop_count,
            report.metrics.approval_requests,
            report.metrics.duration_ms,
            vendor,
            origin,
            reason
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use dart_kernel::audit::{AuditDraft, AuditTrail, NullSink};
    use dart_kernel::types::MissionId;
    use std::sync::Arc;

    fn trail() -> AuditTrail {
        let mut trail = AuditTrail::new(MissionId::new(), Arc::new(NullSink));
        trail.append(AuditDraft::new(Stage::Observing, AuditKind::Transition, "commander", "created -> observing"));
        trail.append(AuditDraft::new(Stage::Observing, AuditKind::Warning, "collector", "logs collector timed out after 5000ms"));
        trail.append(AuditDraft::new(Stage::Observing, AuditKind::Warning, "collector", "logs collector timed out after 5000ms"));
        trail.append(AuditDraft::new(Stage::Observing, AuditKind::Transition, "commander", "deciding -> observing"));
        trail
    }

    #[test]
    fn escalation_summary_cites_reason_and_warnings() {
        let trail = trail();
        let reason = EscalationReason::EvidenceUnavailable { loops: 2 };
        let summary = summarize(Outcome::Escalated, Some(&reason), trail.entries());
        assert!(summary.starts_with("escalated: evidence unavailable"));
        assert!(summary.contains("2 observation pass(es)"));
        assert!(summary.contains("2 warning(s): logs collector timed out after 5000ms"));
    }

    #[test]
    fn resolved_summary_uses_executed_decision() {
        let mut trail = trail();
        trail.append(AuditDraft::new(
            Stage::Acting,
            AuditKind::Decision,
            "executor",
            "remediation executed: view patched",
        ));
        let summary = summarize(Outcome::Resolved, None, trail.entries());
        assert!(summary.starts_with("resolved: remediation executed: view patched"));
    }
}
