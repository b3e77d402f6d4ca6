//! YAML mission scenarios
//!
//! A scenario scripts every collaborator, the human approver included, runs one
//! mission to closure and checks the report against optional expectations.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dart_kernel::audit::MemorySink;
use dart_kernel::types::{MissionId, Outcome};
use serde::{Deserialize, Serialize};

use super::collaborators::{
    QueueApprovals, ScriptedCollector, ScriptedExecutor, ScriptedReasoning, ScriptedVendor, VendorReply,
};
use crate::commander::{Collaborators, Commander};
use crate::config::CommanderConfig;
use crate::error::{ConfigError, MissionError};
use crate::memory::{IncidentSummary, InMemoryStore};
use crate::types::{
    Alert, ApprovalDecision, EvidenceKind, MissionRecord, MissionReport, RemediationProposal, RiskTier,
    VendorStatus,
};

/// One scripted mission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub alert: Alert,
    #[serde(default)]
    pub config: CommanderConfig,
    #[serde(default)]
    pub collectors: Vec<CollectorScript>,
    #[serde(default)]
    pub vendor: VendorScript,
    /// Incidents preloaded into memory
    #[serde(default)]
    pub memory: Vec<RecalledIncident>,
    #[serde(default)]
    pub reasoning: ReasoningScript,
    #[serde(default)]
    pub executor: ExecutorScript,
    /// Answers given to approval requests, in order
    #[serde(default)]
    pub approvals: Vec<ApprovalScript>,
    #[serde(default)]
    pub expect: Option<Expectation>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectorMode {
    #[default]
    Ok,
    Timeout,
    Unavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorScript {
    pub kind: EvidenceKind,
    #[serde(default)]
    pub mode: CollectorMode,
    #[serde(default)]
    pub evidence: Vec<EvidenceScript>,
    #[serde(default)]
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceScript {
    pub summary: String,
    pub failure_signal: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VendorAnswer {
    Healthy,
    Degraded,
    Unknown,
    Unavailable,
    Hang,
}

impl From<VendorAnswer> for VendorReply {
    fn from(answer: VendorAnswer) -> Self {
        match answer {
            VendorAnswer::Healthy => VendorReply::Reports(VendorStatus::Healthy),
            VendorAnswer::Degraded => VendorReply::Reports(VendorStatus::Degraded),
            VendorAnswer::Unknown => VendorReply::Reports(VendorStatus::Unknown),
            VendorAnswer::Unavailable => VendorReply::Unavailable,
            VendorAnswer::Hang => VendorReply::Hangs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorScript {
    /// Answers given before `then`
    #[serde(default)]
    pub replies: Vec<VendorAnswer>,
    pub then: VendorAnswer,
}

impl Default for VendorScript {
    fn default() -> Self {
        Self {
            replies: Vec::new(),
            then: VendorAnswer::Degraded,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecalledIncident {
    pub signature: String,
    pub root_cause: String,
    pub fix_type: String,
    pub fix_action: String,
    #[serde(default)]
    pub rollback: String,
}

impl From<&RecalledIncident> for IncidentSummary {
    fn from(incident: &RecalledIncident) -> Self {
        IncidentSummary {
            incident_id: MissionId::new(),
            signature: incident.signature.clone(),
            root_cause: incident.root_cause.clone(),
            fix_type: incident.fix_type.clone(),
            fix_action: incident.fix_action.clone(),
            rollback: incident.rollback.clone(),
            embedding: Vec::new(),
            timestamp: Utc::now(),
            evidence_digest: String::new(),
            vendor_verdict: VendorStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisScript {
    pub root_cause: String,
    pub confidence_hint: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalScript {
    pub action: String,
    pub fix_type: String,
    #[serde(default)]
    pub impact: String,
    #[serde(default)]
    pub rollback: String,
    #[serde(default)]
    pub declared_tier: Option<RiskTier>,
}

impl From<&ProposalScript> for RemediationProposal {
    fn from(script: &ProposalScript) -> Self {
        let proposal = RemediationProposal::new(script.action.clone(), script.fix_type.clone())
            .with_impact(script.impact.clone())
            .with_rollback(script.rollback.clone());
        match script.declared_tier {
            Some(tier) => proposal.with_declared_tier(tier),
            None => proposal,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReasoningScript {
    #[serde(default)]
    pub unavailable: bool,
    #[serde(default)]
    pub diagnosis: Option<DiagnosisScript>,
    /// Consumed in order; the last one repeats
    #[serde(default)]
    pub proposals: Vec<ProposalScript>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorScript {
    /// Leading executions that fail
    #[serde(default)]
    pub failures: usize,
    /// Every execution reports success but fails verification
    #[serde(default)]
    pub ineffective: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalScript {
    pub decision: ApprovalDecision,
    pub rationale: String,
    #[serde(default)]
    pub after_ms: u64,
}

/// Report fields a scenario pins down
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Expectation {
    pub outcome: Option<Outcome>,
    pub loop_count: Option<u32>,
    pub fast_tracked: Option<bool>,
    pub deception_detected: Option<bool>,
    pub approval_requests: Option<u32>,
}

impl Expectation {
    /// Human-readable mismatches against `report`
    #[must_use]
    pub fn mismatches(&self, report: &MissionReport) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(outcome) = self.outcome.filter(|o| *o != report.outcome) {
            out.push(format!("expected outcome {outcome}, got {}", report.outcome));
        }
        if let Some(loops) = self.loop_count.filter(|l| *l != report.loop_count) {
            out.push(format!("expected {loops} loop(s), got {}", report.loop_count));
        }
        if let Some(fast) = self.fast_tracked.filter(|f| *f != report.metrics.fast_tracked) {
            out.push(format!("expected fast_tracked={fast}"));
        }
        if let Some(deceived) = self
            .deception_detected
            .filter(|d| *d != report.metrics.deception_detected)
        {
            out.push(format!("expected deception_detected={deceived}"));
        }
        if let Some(requests) = self
            .approval_requests
            .filter(|r| *r != report.metrics.approval_requests)
        {
            out.push(format!(
                "expected {requests} approval request(s), got {}",
                report.metrics.approval_requests
            ));
        }
        out
    }
}

/// Result of one scenario run
#[derive(Debug, Clone)]
pub struct ScenarioOutcome {
    pub name: String,
    pub report: MissionReport,
    pub record: Option<MissionRecord>,
    /// Empty when every expectation held
    pub mismatches: Vec<String>,
}

impl ScenarioOutcome {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty()
    }
}

impl Scenario {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let scenario: Self = serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        scenario.config.validate()?;
        Ok(scenario)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Every `.yaml`/`.yml` scenario in `dir`, sorted by file name
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Vec<Self>, ConfigError> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let mut paths: Vec<_> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("yaml" | "yml")))
            .collect();
        paths.sort();
        paths.iter().map(Self::from_path).collect()
    }

    /// Replace the scripted configuration, keeping nothing from the file
    #[must_use]
    pub fn with_config(mut self, config: CommanderConfig) -> Self {
        self.config = config;
        self
    }

    fn collaborators(&self) -> (Collaborators, tokio::sync::mpsc::UnboundedReceiver<crate::gate::ApprovalRequest>) {
        let vendor = ScriptedVendor::scripted(
            self.vendor.replies.iter().map(|r| VendorReply::from(*r)),
            self.vendor.then.into(),
        );
        let memory = InMemoryStore::with_incidents(self.memory.iter().map(IncidentSummary::from));
        let (approvals, rx) = QueueApprovals::new();

        let mut collaborators = Collaborators::new(
            Arc::new(vendor),
            Arc::new(memory),
            Arc::new(self.reasoning_service()),
            Arc::new(self.executor_service()),
            Arc::new(approvals),
        );
        for script in &self.collectors {
            let collector = match script.mode {
                CollectorMode::Ok => ScriptedCollector::returning(
                    script.kind,
                    script.evidence.iter().map(|e| (e.summary.clone(), e.failure_signal)),
                ),
                CollectorMode::Timeout => ScriptedCollector::hanging(script.kind),
                CollectorMode::Unavailable => {
                    ScriptedCollector::unavailable(script.kind, format!("{} backend down", script.kind))
                }
            }
            .with_latency(Duration::from_millis(script.latency_ms));
            collaborators = collaborators.with_collector(Arc::new(collector));
        }
        (collaborators, rx)
    }

    fn reasoning_service(&self) -> ScriptedReasoning {
        if self.reasoning.unavailable {
            return ScriptedReasoning::unavailable();
        }
        let mut reasoning = ScriptedReasoning::default();
        if let Some(d) = &self.reasoning.diagnosis {
            reasoning = reasoning.with_diagnosis(d.root_cause.clone(), d.confidence_hint);
        }
        if let Some((last, leading)) = self.reasoning.proposals.split_last() {
            for proposal in leading {
                reasoning = reasoning.then_proposal(proposal.into());
            }
            reasoning = reasoning.with_proposal(last.into());
        }
        reasoning
    }

    fn executor_service(&self) -> ScriptedExecutor {
        if self.executor.ineffective {
            ScriptedExecutor::ineffective()
        } else {
            ScriptedExecutor::failing_first(self.executor.failures)
        }
    }
}

/// Run one scenario to closure
pub async fn run_scenario(scenario: &Scenario) -> Result<ScenarioOutcome, MissionError> {
    let (collaborators, mut requests) = scenario.collaborators();
    let sink = Arc::new(MemorySink::new());
    let commander = Arc::new(Commander::new(scenario.config.clone(), collaborators)?.with_sink(sink));

    let handle = commander.launch(scenario.alert.clone());
    let approver = {
        let commander = Arc::clone(&commander);
        let mut answers = scenario.approvals.clone().into_iter();
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let answer = answers.next().unwrap_or_else(|| ApprovalScript {
                    decision: ApprovalDecision::Denied,
                    rationale: "no scripted approval left".into(),
                    after_ms: 0,
                });
                if answer.after_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(answer.after_ms)).await;
                }
                commander.resolve(request.mission_id, request.proposal.id, answer.decision, answer.rationale);
            }
        })
    };

    let mission_id = handle.id();
    let report = handle.join().await;
    approver.abort();
    let report = report?;

    let mismatches = scenario
        .expect
        .as_ref()
        .map(|e| e.mismatches(&report))
        .unwrap_or_default();
    tracing::info!(scenario = %scenario.name, outcome = %report.outcome, passed = mismatches.is_empty(), "scenario finished");
    Ok(ScenarioOutcome {
        name: scenario.name.clone(),
        record: commander.archive().get(mission_id),
        report,
        mismatches,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAST_TRACK: &str = r"
name: fast-track
alert:
  id: alert-7
  source_system: revenue-dashboard
  error_code: ERROR_DIV_ZERO
  message: division by zero in revenue view
collectors:
  - kind: logs
    evidence:
      - summary: 'ERROR: division by zero at revenue_view line 12'
        failure_signal: 0.9
memory:
  - signature: ERROR_DIV_ZERO division by zero in revenue view
    root_cause: zero quantity rows
    fix_type: create_view
    fix_action: CREATE OR REPLACE VIEW revenue AS SELECT total / NULLIF(qty, 0) FROM orders
expect:
  outcome: resolved
  loop_count: 0
  fast_tracked: true
";

    #[test]
    fn scenario_yaml_parses_with_defaults() {
        let scenario = Scenario::from_yaml_str(FAST_TRACK).unwrap();
        assert_eq!(scenario.collectors.len(), 1);
        assert_eq!(scenario.collectors[0].mode, CollectorMode::Ok);
        assert_eq!(scenario.vendor.then, VendorAnswer::Degraded);
        assert_eq!(scenario.config, CommanderConfig::default());
    }

    #[tokio::test(start_paused = true)]
    async fn fast_track_scenario_meets_expectations() {
        let scenario = Scenario::from_yaml_str(FAST_TRACK).unwrap();
        let outcome = run_scenario(&scenario).await.unwrap();
        assert!(outcome.passed(), "{:?}", outcome.mismatches);
        assert!(outcome.record.is_some());
    }

    #[test]
    fn mismatches_are_reported() {
        let expectation = Expectation {
            outcome: Some(Outcome::Resolved),
            loop_count: Some(0),
            ..Expectation::default()
        };
        let report = MissionReport {
            mission_id: MissionId::new(),
            outcome: Outcome::Escalated,
            escalation: None,
            summary: String::new(),
            confidence: 0.0,
            loop_count: 3,
            diagnosis: None,
            proposal: None,
            metrics: crate::types::MissionMetrics::default(),
        };
        assert_eq!(expectation.mismatches(&report).len(), 2);
    }
}
