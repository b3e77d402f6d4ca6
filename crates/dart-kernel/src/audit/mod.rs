//! Append-only, hash-chained mission audit trail
//!
//! - One [`AuditTrail`] per mission, written only by the task driving that mission
//! - Every entry links to its predecessor through a SHA-256 hash
//! - Entries are forwarded to an [`AuditSink`] as they are appended

pub mod sink;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::AuditError;
use crate::types::{MissionId, Stage};

pub use sink::{AuditSink, ChannelSink, FanoutSink, MemorySink, NullSink, TracingSink};

/// Hash of the (virtual) entry before the first one
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Kind of audited fact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// Stage change
    Transition,
    /// Routing decision (act, loop, escalate, fast-track)
    Decision,
    /// Evidence, vendor signal or memory result merged
    Evidence,
    /// Vendor claim contradicted by evidence
    Conflict,
    /// Safety gate verdict or approval resolution
    Gate,
    /// Partial failure absorbed by the mission
    Warning,
    /// Terminal outcome
    Outcome,
}

impl AuditKind {
    /// Stable lowercase name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::Transition => "transition",
            AuditKind::Decision => "decision",
            AuditKind::Evidence => "evidence",
            AuditKind::Conflict => "conflict",
            AuditKind::Gate => "gate",
            AuditKind::Warning => "warning",
            AuditKind::Outcome => "outcome",
        }
    }
}

impl std::fmt::Display for AuditKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable audit entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub mission_id: MissionId,
    pub stage: Stage,
    pub actor: String,
    pub kind: AuditKind,
    pub summary: String,
    pub related_ids: Vec<String>,
    pub prev_hash: String,
    pub hash: String,
}

/// Entry content before sequencing and hashing
#[derive(Debug, Clone)]
pub struct AuditDraft {
    stage: Stage,
    kind: AuditKind,
    actor: String,
    summary: String,
    related_ids: Vec<String>,
}

impl AuditDraft {
    /// New draft
    #[must_use]
    pub fn new(
        stage: Stage,
        kind: AuditKind,
        actor: impl Into<String>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            kind,
            actor: actor.into(),
            summary: summary.into(),
            related_ids: Vec::new(),
        }
    }

    /// Attach one related identifier
    #[inline]
    #[must_use]
    pub fn with_related(mut self, id: impl ToString) -> Self {
        self.related_ids.push(id.to_string());
        self
    }

    /// Attach several related identifiers
    #[must_use]
    pub fn with_related_all<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.related_ids
            .extend(ids.into_iter().map(|id| id.to_string()));
        self
    }
}

/// Audit trail for one mission
pub struct AuditTrail {
    mission_id: MissionId,
    entries: Vec<AuditEntry>,
    sink: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditTrail")
            .field("mission_id", &self.mission_id)
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl AuditTrail {
    /// Empty trail forwarding to `sink`
    #[must_use]
    pub fn new(mission_id: MissionId, sink: Arc<dyn AuditSink>) -> Self {
        Self {
            mission_id,
            entries: Vec::new(),
            sink,
        }
    }

    /// Mission this trail belongs to
    #[inline]
    #[must_use]
    pub fn mission_id(&self) -> MissionId {
        self.mission_id
    }

    /// Sequence, hash and append a draft; the sink sees the entry afterwards
    pub fn append(&mut self, draft: AuditDraft) -> &AuditEntry {
        let prev_hash = self
            .entries
            .last()
            .map_or_else(|| GENESIS_HASH.to_string(), |e| e.hash.clone());
        let mut entry = AuditEntry {
            sequence: self.entries.len() as u64,
            timestamp: Utc::now(),
            mission_id: self.mission_id,
            stage: draft.stage,
            actor: draft.actor,
            kind: draft.kind,
            summary: draft.summary,
            related_ids: draft.related_ids,
            prev_hash,
            hash: String::new(),
        };
        entry.hash = compute_hash(&entry);
        self.sink.record(&entry);
        self.entries.push(entry);
        &self.entries[self.entries.len() - 1]
    }

    /// All entries in sequence order
    #[inline]
    #[must_use]
    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    /// Number of entries
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was recorded
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries of one kind
    pub fn of_kind(&self, kind: AuditKind) -> impl Iterator<Item = &AuditEntry> {
        self.entries.iter().filter(move |e| e.kind == kind)
    }

    /// Check sequence contiguity and the hash chain
    pub fn verify_integrity(&self) -> Result<(), AuditError> {
        verify_entries(&self.entries)
    }

    /// Consume the trail, keeping the entries
    #[must_use]
    pub fn into_entries(self) -> Vec<AuditEntry> {
        self.entries
    }
}

/// Check sequence contiguity and the hash chain of archived entries
pub fn verify_entries(entries: &[AuditEntry]) -> Result<(), AuditError> {
    let mut prev = GENESIS_HASH;
    for (expected, entry) in (0u64..).zip(entries) {
        if entry.sequence != expected {
            return Err(AuditError::SequenceGap {
                expected,
                found: entry.sequence,
            });
        }
        if entry.prev_hash != prev || entry.hash != compute_hash(entry) {
            return Err(AuditError::IntegrityViolation {
                sequence: entry.sequence,
            });
        }
        prev = entry.hash.as_str();
    }
    Ok(())
}

fn compute_hash(entry: &AuditEntry) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entry.sequence.to_le_bytes());
    hasher.update(entry.timestamp.to_rfc3339().as_bytes());
    hasher.update([0]);
    hasher.update(entry.mission_id.0.to_bytes());
    hasher.update(entry.stage.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(entry.actor.as_bytes());
    hasher.update([0]);
    hasher.update(entry.kind.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(entry.summary.as_bytes());
    hasher.update([0]);
    for id in &entry.related_ids {
        hasher.update(id.as_bytes());
        hasher.update([0]);
    }
    hasher.update(entry.prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trail() -> AuditTrail {
        AuditTrail::new(MissionId::new(), Arc::new(NullSink))
    }

    #[test]
    fn entries_are_chained() {
        let mut trail = trail();
        trail.append(AuditDraft::new(Stage::Created, AuditKind::Transition, "commander", "created -> observing"));
        trail.append(AuditDraft::new(Stage::Observing, AuditKind::Warning, "commander", "schema collector timed out"));

        let entries = trail.entries();
        assert_eq!(entries[0].prev_hash, GENESIS_HASH);
        assert_eq!(entries[1].prev_hash, entries[0].hash);
        assert_eq!(entries[1].sequence, 1);
        assert!(trail.verify_integrity().is_ok());
    }

    #[test]
    fn tampering_is_detected() {
        let mut trail = trail();
        trail.append(AuditDraft::new(Stage::Acting, AuditKind::Gate, "gate", "pending approval"));
        trail.append(AuditDraft::new(Stage::Blocked, AuditKind::Gate, "operator", "approved"));

        let mut entries = trail.into_entries();
        entries[0].summary = "auto approved".into();
        assert_eq!(
            verify_entries(&entries),
            Err(AuditError::IntegrityViolation { sequence: 0 })
        );
    }

    #[test]
    fn missing_entry_is_a_gap() {
        let mut trail = trail();
        for _ in 0..3 {
            trail.append(AuditDraft::new(Stage::Deciding, AuditKind::Decision, "commander", "loop"));
        }
        let mut entries = trail.into_entries();
        entries.remove(1);
        assert_eq!(
            verify_entries(&entries),
            Err(AuditError::SequenceGap { expected: 1, found: 2 })
        );
    }

    #[test]
    fn related_ids_are_kept_in_order() {
        let mut trail = trail();
        let entry = trail.append(
            AuditDraft::new(Stage::Orienting, AuditKind::Conflict, "vendor-liaison", "healthy claim contradicted")
                .with_related("sig-1")
                .with_related_all(["ev-1", "ev-2"]),
        );
        assert_eq!(entry.related_ids, vec!["sig-1", "ev-1", "ev-2"]);
        assert_eq!(trail.of_kind(AuditKind::Conflict).count(), 1);
    }
}
