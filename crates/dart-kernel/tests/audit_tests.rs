use std::sync::Arc;

use dart_kernel::audit::{verify_entries, AuditDraft, AuditKind, AuditTrail, MemorySink};
use dart_kernel::types::{MissionId, Stage};
use dart_kernel::AuditError;

#[test]
fn test_sink_sees_entries_in_sequence_order() {
    let sink = Arc::new(MemorySink::new());
    let mut trail = AuditTrail::new(MissionId::new(), sink.clone());
    let stages = [Stage::Created, Stage::Observing, Stage::Orienting, Stage::Deciding];
    for stage in stages {
        trail.append(AuditDraft::new(stage, AuditKind::Transition, "commander", stage.as_str()));
    }

    let recorded = sink.entries();
    assert_eq!(recorded.len(), 4);
    assert!(recorded.windows(2).all(|w| w[0].sequence + 1 == w[1].sequence));
    assert!(verify_entries(&recorded).is_ok());
}

#[test]
fn test_reordering_breaks_chain() {
    let mut trail = AuditTrail::new(MissionId::new(), Arc::new(MemorySink::new()));
    trail.append(AuditDraft::new(Stage::Acting, AuditKind::Gate, "gate", "pending"));
    trail.append(AuditDraft::new(Stage::Blocked, AuditKind::Gate, "operator", "denied"));

    let mut entries = trail.into_entries();
    entries.swap(0, 1);
    assert!(matches!(
        verify_entries(&entries),
        Err(AuditError::SequenceGap { expected: 0, found: 1 })
    ));
}

#[test]
fn test_serialized_entries_still_verify() {
    let mut trail = AuditTrail::new(MissionId::new(), Arc::new(MemorySink::new()));
    trail.append(
        AuditDraft::new(Stage::Orienting, AuditKind::Conflict, "vendor-liaison", "healthy claim contradicted")
            .with_related("sig"),
    );
    trail.append(AuditDraft::new(Stage::Closed, AuditKind::Outcome, "commander", "escalated"));

    let json = serde_json::to_string(trail.entries()).unwrap();
    let back: Vec<dart_kernel::audit::AuditEntry> = serde_json::from_str(&json).unwrap();
    assert!(verify_entries(&back).is_ok());
}
