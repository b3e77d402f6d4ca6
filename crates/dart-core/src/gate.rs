//! Safety gate
//!
//! - Deterministic risk classification over a fixed taxonomy
//! - Pending approval slots, one per mission, released only by `resolve`
//!   (or withdrawn by the mission on timeout or cancellation)
//!
//! Retries, confidence and memory fast-track never bypass the gate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dart_kernel::types::{MissionId, ProposalId};
use dashmap::DashMap;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::RiskRulesConfig;
use crate::error::CollaboratorError;
use crate::types::{ApprovalDecision, GateVerdict, RemediationProposal, RiskTier};

/// One taxonomy rule
#[derive(Debug, Clone)]
pub struct RiskRule {
    pub name: String,
    pattern: Regex,
    pub tier: RiskTier,
}

impl RiskRule {
    /// Compile a case-insensitive rule
    pub fn new(name: impl Into<String>, pattern: &str, tier: RiskTier) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.into(),
            pattern: RegexBuilder::new(pattern).case_insensitive(true).build()?,
            tier,
        })
    }

    /// Rule matching a literal phrase anywhere in a statement
    pub fn keyword(phrase: &str, tier: RiskTier) -> Result<Self, regex::Error> {
        let words: Vec<String> = phrase.split_whitespace().map(regex::escape).collect();
        Self::new(phrase, &format!(r"\b{}\b", words.join(r"\s+")), tier)
    }
}

/// Risk of one action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub tier: RiskTier,
    /// Rule behind the tier; `None` when nothing matched
    pub rule: Option<String>,
}

/// Ordered rule set
///
/// Actions are split into `;`-separated statements. A statement takes the tier of
/// its first high-risk match, else its first low-risk match, else `Elevated`; the
/// action takes the highest statement tier.
#[derive(Debug, Clone)]
pub struct RiskTaxonomy {
    high: Vec<RiskRule>,
    low: Vec<RiskRule>,
}

impl Default for RiskTaxonomy {
    fn default() -> Self {
        let high = [
            ("drop-table", r"\bDROP\s+TABLE\b"),
            ("delete-from", r"\bDELETE\s+FROM\b"),
            ("truncate", r"\bTRUNCATE\b"),
            ("alter-table", r"\bALTER\s+TABLE\b"),
            ("create-table", r"\bCREATE\s+TABLE\b"),
            ("grant-all", r"\bGRANT\s+ALL\b"),
            ("revoke", r"\bREVOKE\b"),
            ("force-push", r"\bFORCE[\s_-]+PUSH\b|\bpush\s+(--force|-f)\b"),
        ];
        let low = [
            ("create-view", r"^\s*CREATE\s+(OR\s+REPLACE\s+)?VIEW\b"),
            ("select", r"^\s*SELECT\b"),
            ("insert", r"^\s*INSERT\s+INTO\b"),
        ];
        Self {
            high: compile(&high, RiskTier::High),
            low: compile(&low, RiskTier::Low),
        }
    }
}

fn compile(rules: &[(&str, &str)], tier: RiskTier) -> Vec<RiskRule> {
    rules
        .iter()
        .filter_map(|(name, pattern)| RiskRule::new(*name, pattern, tier).ok())
        .collect()
}

impl RiskTaxonomy {
    /// Built-in taxonomy plus configured keywords
    #[must_use]
    pub fn from_config(config: &RiskRulesConfig) -> Self {
        let mut taxonomy = Self::default();
        for phrase in &config.high {
            match RiskRule::keyword(phrase, RiskTier::High) {
                Ok(rule) => taxonomy.high.push(rule),
                Err(e) => tracing::warn!(%phrase, error = %e, "ignoring invalid high-risk keyword"),
            }
        }
        for phrase in &config.low {
            match RiskRule::keyword(phrase, RiskTier::Low) {
                Ok(rule) => taxonomy.low.push(rule),
                Err(e) => tracing::warn!(%phrase, error = %e, "ignoring invalid low-risk keyword"),
            }
        }
        taxonomy
    }

    /// Classify action text
    #[must_use]
    pub fn classify(&self, action: &str) -> Classification {
        let mut overall: Option<Classification> = None;
        for statement in action.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let current = self.classify_statement(statement);
            if overall.as_ref().map_or(true, |o| current.tier > o.tier) {
                overall = Some(current);
            }
        }
        overall.unwrap_or(Classification {
            tier: RiskTier::Elevated,
            rule: None,
        })
    }

    fn classify_statement(&self, statement: &str) -> Classification {
        let hit = self
            .high
            .iter()
            .find(|r| r.pattern.is_match(statement))
            .or_else(|| self.low.iter().find(|r| r.pattern.is_match(statement)));
        match hit {
            Some(rule) => Classification {
                tier: rule.tier,
                rule: Some(rule.name.clone()),
            },
            None => Classification {
                tier: RiskTier::Elevated,
                rule: None,
            },
        }
    }
}

/// Gate decision on a proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateEvaluation {
    pub verdict: GateVerdict,
    pub tier: RiskTier,
    pub rule: Option<String>,
}

/// Everything a human needs to decide
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub mission_id: MissionId,
    pub proposal: RemediationProposal,
    pub tier: RiskTier,
    pub rule: Option<String>,
    pub requested_at: DateTime<Utc>,
}

/// Where approval requests are published
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    /// Publish a request; the answer arrives later through `resolve`
    async fn request_approval(&self, request: ApprovalRequest) -> Result<(), CollaboratorError>;
}

/// Human answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub decision: ApprovalDecision,
    pub rationale: String,
}

/// Effect of a `resolve` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveOutcome {
    /// Released the pending proposal
    Applied,
    /// Proposal already settled or superseded; logged no-op
    AlreadyResolved,
    /// Mission never asked for approval
    UnknownMission,
}

/// How the approval wait ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TicketOutcome {
    Resolved(Resolution),
    TimedOut(Duration),
    Cancelled,
}

/// Handle the mission waits on while `Blocked`
#[derive(Debug)]
pub struct GateTicket {
    pub mission_id: MissionId,
    pub proposal_id: ProposalId,
    rx: oneshot::Receiver<Resolution>,
}

impl GateTicket {
    /// Wait for `resolve`, the optional timeout, or cancellation
    pub async fn wait(&mut self, timeout: Option<Duration>, cancel: &CancellationToken) -> TicketOutcome {
        let rx = &mut self.rx;
        let answer = async move {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, rx).await.ok(),
                None => Some(rx.await),
            }
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => TicketOutcome::Cancelled,
            answer = answer => match (answer, timeout) {
                (Some(Ok(resolution)), _) => TicketOutcome::Resolved(resolution),
                // sender dropped: the slot was withdrawn
                (Some(Err(_)), _) => TicketOutcome::Cancelled,
                (None, limit) => TicketOutcome::TimedOut(limit.unwrap_or_default()),
            },
        }
    }

    /// Decision that arrived after `wait` gave up
    pub fn take_resolution(&mut self) -> Option<Resolution> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug)]
struct PendingSlot {
    proposal_id: ProposalId,
    tx: oneshot::Sender<Resolution>,
}

#[derive(Debug, Clone)]
struct ResolvedSlot {
    proposal_id: ProposalId,
    resolution: Option<Resolution>,
}

/// Risk classification plus the pending approval registry
pub struct SafetyGate {
    taxonomy: RiskTaxonomy,
    channel: Arc<dyn ApprovalChannel>,
    pending: DashMap<MissionId, PendingSlot>,
    resolved: DashMap<MissionId, ResolvedSlot>,
}

impl std::fmt::Debug for SafetyGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetyGate")
            .field("pending", &self.pending.len())
            .field("resolved", &self.resolved.len())
            .finish_non_exhaustive()
    }
}

impl SafetyGate {
    #[must_use]
    pub fn new(taxonomy: RiskTaxonomy, channel: Arc<dyn ApprovalChannel>) -> Self {
        Self {
            taxonomy,
            channel,
            pending: DashMap::new(),
            resolved: DashMap::new(),
        }
    }

    #[must_use]
    pub fn taxonomy(&self) -> &RiskTaxonomy {
        &self.taxonomy
    }

    /// Classify a proposal; the declared tier can only raise the result
    #[must_use]
    pub fn evaluate(&self, proposal: &RemediationProposal) -> GateEvaluation {
        let classification = self.taxonomy.classify(&proposal.action);
        let tier = proposal
            .declared_tier
            .map_or(classification.tier, |declared| declared.max(classification.tier));
        let verdict = if tier == RiskTier::Low {
            GateVerdict::AutoApproved
        } else {
            GateVerdict::PendingApproval
        };
        metrics::counter!("dart_gate_verdicts_total", "verdict" => verdict.as_str()).increment(1);
        GateEvaluation {
            verdict,
            tier,
            rule: classification.rule,
        }
    }

    /// Register a pending slot and publish the approval request
    pub async fn submit(
        &self,
        mission_id: MissionId,
        proposal: &RemediationProposal,
        evaluation: &GateEvaluation,
    ) -> Result<GateTicket, CollaboratorError> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            mission_id,
            PendingSlot {
                proposal_id: proposal.id,
                tx,
            },
        );

        let request = ApprovalRequest {
            mission_id,
            proposal: proposal.clone(),
            tier: evaluation.tier,
            rule: evaluation.rule.clone(),
            requested_at: Utc::now(),
        };
        if let Err(err) = self.channel.request_approval(request).await {
            self.pending.remove(&mission_id);
            return Err(err);
        }
        tracing::info!(%mission_id, proposal_id = %proposal.id, tier = %evaluation.tier, "approval requested");

        Ok(GateTicket {
            mission_id,
            proposal_id: proposal.id,
            rx,
        })
    }

    /// Apply a human decision; effective once per pending proposal
    pub fn resolve(
        &self,
        mission_id: MissionId,
        proposal_id: ProposalId,
        decision: ApprovalDecision,
        rationale: impl Into<String>,
    ) -> ResolveOutcome {
        let rationale = rationale.into();
        if let Some((_, slot)) = self
            .pending
            .remove_if(&mission_id, |_, slot| slot.proposal_id == proposal_id)
        {
            let resolution = Resolution { decision, rationale };
            self.resolved.insert(
                mission_id,
                ResolvedSlot {
                    proposal_id: slot.proposal_id,
                    resolution: Some(resolution.clone()),
                },
            );
            let verdict = GateVerdict::from(decision);
            metrics::counter!("dart_gate_verdicts_total", "verdict" => verdict.as_str()).increment(1);
            if slot.tx.send(resolution).is_err() {
                tracing::warn!(%mission_id, "mission stopped waiting before the decision arrived");
            }
            tracing::info!(%mission_id, %proposal_id, %verdict, "approval resolved");
            return ResolveOutcome::Applied;
        }

        let current = self
            .pending
            .get(&mission_id)
            .map(|slot| slot.proposal_id)
            .or_else(|| self.resolved.get(&mission_id).map(|slot| slot.proposal_id));
        if let Some(current) = current {
            tracing::info!(%mission_id, %proposal_id, %current, "resolve for a settled or superseded proposal ignored");
            return ResolveOutcome::AlreadyResolved;
        }

        tracing::warn!(%mission_id, "resolve for a mission with no approval request");
        ResolveOutcome::UnknownMission
    }

    /// Drop a pending slot after timeout or cancellation.
    ///
    /// Returns `false` when no slot was pending, i.e. a `resolve` already consumed it.
    pub fn withdraw(&self, mission_id: MissionId) -> bool {
        let Some((_, slot)) = self.pending.remove(&mission_id) else {
            return false;
        };
        self.resolved.insert(
            mission_id,
            ResolvedSlot {
                proposal_id: slot.proposal_id,
                resolution: None,
            },
        );
        tracing::info!(%mission_id, proposal_id = %slot.proposal_id, "approval request withdrawn");
        true
    }

    /// Release every trace of a closed mission
    pub fn forget(&self, mission_id: MissionId) {
        self.pending.remove(&mission_id);
        self.resolved.remove(&mission_id);
    }

    /// Whether an approval is outstanding
    #[must_use]
    pub fn is_pending(&self, mission_id: MissionId) -> bool {
        self.pending.contains_key(&mission_id)
    }

    /// Number of missions the gate still tracks
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.pending.len() + self.resolved.len()
    }

    /// Last decision applied to a mission, if any
    #[must_use]
    pub fn last_resolution(&self, mission_id: MissionId) -> Option<Resolution> {
        self.resolved.get(&mission_id).and_then(|r| r.resolution.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ApprovalRequest>>);

    #[async_trait]
    impl ApprovalChannel for Recorder {
        async fn request_approval(&self, request: ApprovalRequest) -> Result<(), CollaboratorError> {
            self.0.lock().push(request);
            Ok(())
        }
    }

    fn gate() -> (SafetyGate, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        (SafetyGate::new(RiskTaxonomy::default(), recorder.clone()), recorder)
    }

    #[test]
    fn taxonomy_tiers() {
        let taxonomy = RiskTaxonomy::default();
        assert_eq!(taxonomy.classify("DROP TABLE orders").tier, RiskTier::High);
        assert_eq!(taxonomy.classify("alter table t add column region text").tier, RiskTier::High);
        assert_eq!(taxonomy.classify("git push --force origin main").tier, RiskTier::High);
        assert_eq!(
            taxonomy.classify("CREATE OR REPLACE VIEW v AS SELECT a / NULLIF(b, 0) FROM t").tier,
            RiskTier::Low
        );
        assert_eq!(taxonomy.classify("SELECT 1").tier, RiskTier::Low);
        assert_eq!(taxonomy.classify("UPDATE t SET a = 1").tier, RiskTier::Elevated);
        assert_eq!(taxonomy.classify("").tier, RiskTier::Elevated);
    }

    #[test]
    fn worst_statement_wins() {
        let c = RiskTaxonomy::default().classify("CREATE VIEW v AS SELECT 1; DROP TABLE t");
        assert_eq!(c.tier, RiskTier::High);
        assert_eq!(c.rule.as_deref(), Some("drop-table"));
    }

    #[test]
    fn configured_keywords_extend_taxonomy() {
        let taxonomy = RiskTaxonomy::from_config(&RiskRulesConfig {
            high: vec!["rotate credentials".into()],
            low: vec!["restart worker".into()],
        });
        assert_eq!(taxonomy.classify("Rotate   credentials for etl").tier, RiskTier::High);
        assert_eq!(taxonomy.classify("restart worker pool-3").tier, RiskTier::Low);
    }

    #[test]
    fn declared_tier_only_raises() {
        let (gate, _) = gate();
        let proposal = RemediationProposal::new("SELECT 1", "query").with_declared_tier(RiskTier::High);
        assert_eq!(gate.evaluate(&proposal).verdict, GateVerdict::PendingApproval);

        let proposal = RemediationProposal::new("DROP TABLE t", "ddl").with_declared_tier(RiskTier::Low);
        assert_eq!(gate.evaluate(&proposal).tier, RiskTier::High);
    }

    #[tokio::test]
    async fn resolve_applies_once() {
        let (gate, recorder) = gate();
        let mission_id = MissionId::new();
        let proposal = RemediationProposal::new("ALTER TABLE t ADD COLUMN c int", "ddl");
        let evaluation = gate.evaluate(&proposal);
        let mut ticket = gate.submit(mission_id, &proposal, &evaluation).await.unwrap();
        assert_eq!(recorder.0.lock().len(), 1);
        assert!(gate.is_pending(mission_id));

        assert_eq!(
            gate.resolve(mission_id, proposal.id, ApprovalDecision::Denied, "needs manual patch"),
            ResolveOutcome::Applied
        );
        assert_eq!(
            gate.resolve(mission_id, proposal.id, ApprovalDecision::Approved, "changed my mind"),
            ResolveOutcome::AlreadyResolved
        );

        let outcome = ticket.wait(None, &CancellationToken::new()).await;
        assert_eq!(
            outcome,
            TicketOutcome::Resolved(Resolution {
                decision: ApprovalDecision::Denied,
                rationale: "needs manual patch".into(),
            })
        );
        assert_eq!(
            gate.last_resolution(mission_id).map(|r| r.decision),
            Some(ApprovalDecision::Denied)
        );
    }

    #[test]
    fn unknown_mission_resolve() {
        let (gate, _) = gate();
        assert_eq!(
            gate.resolve(MissionId::new(), ProposalId::new(), ApprovalDecision::Approved, "ok"),
            ResolveOutcome::UnknownMission
        );
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_and_withdraw_turns_resolve_into_noop() {
        let (gate, _) = gate();
        let mission_id = MissionId::new();
        let proposal = RemediationProposal::new("TRUNCATE staging", "ddl");
        let evaluation = gate.evaluate(&proposal);
        let mut ticket = gate.submit(mission_id, &proposal, &evaluation).await.unwrap();

        let outcome = ticket
            .wait(Some(Duration::from_secs(30)), &CancellationToken::new())
            .await;
        assert_eq!(outcome, TicketOutcome::TimedOut(Duration::from_secs(30)));

        assert!(gate.withdraw(mission_id));
        assert!(!gate.is_pending(mission_id));
        assert_eq!(
            gate.resolve(mission_id, proposal.id, ApprovalDecision::Approved, "late"),
            ResolveOutcome::AlreadyResolved
        );
        assert!(ticket.take_resolution().is_none());
    }

    #[tokio::test]
    async fn stale_proposal_id_leaves_the_current_slot_pending() {
        let (gate, _) = gate();
        let mission_id = MissionId::new();
        let first = RemediationProposal::new("ALTER TABLE t ADD COLUMN c int", "ddl");
        let mut ticket = gate.submit(mission_id, &first, &gate.evaluate(&first)).await.unwrap();
        gate.resolve(mission_id, first.id, ApprovalDecision::Denied, "no");
        assert!(matches!(ticket.wait(None, &CancellationToken::new()).await, TicketOutcome::Resolved(_)));

        let second = RemediationProposal::new("DROP TABLE t", "ddl");
        let _ticket = gate.submit(mission_id, &second, &gate.evaluate(&second)).await.unwrap();
        assert_eq!(
            gate.resolve(mission_id, first.id, ApprovalDecision::Approved, "double click"),
            ResolveOutcome::AlreadyResolved
        );
        assert!(gate.is_pending(mission_id));
        assert_eq!(
            gate.resolve(mission_id, second.id, ApprovalDecision::Approved, "ok"),
            ResolveOutcome::Applied
        );
    }

    #[tokio::test]
    async fn withdraw_after_a_lost_race_reports_the_buffered_decision() {
        let (gate, _) = gate();
        let mission_id = MissionId::new();
        let proposal = RemediationProposal::new("TRUNCATE staging", "ddl");
        let mut ticket = gate.submit(mission_id, &proposal, &gate.evaluate(&proposal)).await.unwrap();

        gate.resolve(mission_id, proposal.id, ApprovalDecision::Approved, "just in time");
        assert!(!gate.withdraw(mission_id));
        assert_eq!(
            ticket.take_resolution().map(|r| r.decision),
            Some(ApprovalDecision::Approved)
        );
    }

    #[tokio::test]
    async fn forget_releases_closed_missions() {
        let (gate, _) = gate();
        let mission_id = MissionId::new();
        let proposal = RemediationProposal::new("TRUNCATE staging", "ddl");
        let _ticket = gate.submit(mission_id, &proposal, &gate.evaluate(&proposal)).await.unwrap();
        gate.resolve(mission_id, proposal.id, ApprovalDecision::Denied, "no");
        assert_eq!(gate.tracked(), 1);

        gate.forget(mission_id);
        assert_eq!(gate.tracked(), 0);
        assert_eq!(
            gate.resolve(mission_id, proposal.id, ApprovalDecision::Approved, "late"),
            ResolveOutcome::UnknownMission
        );
    }
}
