//! Mission simulator
//!
//! Generates seeded random scenarios, runs them concurrently and checks the
//! invariants every closed mission must satisfy, whatever its collaborators did.

use std::collections::BTreeMap;

use dart_kernel::audit::{verify_entries, AuditEntry, AuditKind};
use dart_kernel::state_machine::validate_transition;
use dart_kernel::types::{MissionId, Stage};
use futures::future::join_all;
use rand::{rngs::StdRng, Rng, SeedableRng};

use super::scenario::{
    run_scenario, ApprovalScript, CollectorMode, CollectorScript, DiagnosisScript, EvidenceScript,
    ExecutorScript, ProposalScript, ReasoningScript, RecalledIncident, Scenario, ScenarioOutcome,
    VendorAnswer, VendorScript,
};
use crate::config::{CommanderConfig, RetryConfig};
use crate::error::MissionError;
use crate::types::{Alert, ApprovalDecision, EvidenceKind, MissionRecord};

/// Simulator configuration
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    pub missions: usize,
    pub max_loops: u32,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            missions: 50,
            max_loops: 3,
        }
    }
}

/// Invariant checked on every closed mission
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InvariantCheck {
    MissionArchived,
    AuditChainUnbroken,
    TransitionsInTable,
    LoopBudgetRespected,
    ClosedWithOutcomeEntry,
    GateNeverBypassed,
    DeceptionAudited,
}

/// One broken invariant
#[derive(Debug, Clone)]
pub struct Violation {
    pub scenario: String,
    pub mission_id: Option<MissionId>,
    pub check: InvariantCheck,
    pub details: String,
}

/// Final simulator report
#[derive(Debug, Clone)]
pub struct SimulatorReport {
    pub config: SimulatorConfig,
    pub outcomes: BTreeMap<&'static str, usize>,
    pub violations: Vec<Violation>,
}

impl SimulatorReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    #[must_use]
    pub fn generate_text(&self) -> String {
        let mut report = String::from("=== Mission Simulator Report ===\n\n");
        report.push_str(&format!("Seed: {}\n", self.config.seed));
        report.push_str(&format!("Missions: {}\n", self.config.missions));
        for (outcome, count) in &self.outcomes {
            report.push_str(&format!("  {outcome}: {count}\n"));
        }
        report.push_str(&format!("Violations: {}\n", self.violations.len()));
        for (i, v) in self.violations.iter().enumerate() {
            report.push_str(&format!("{}. [{}] {:?}: {}\n", i + 1, v.scenario, v.check, v.details));
        }
        report.push_str(&format!(
            "\n=== Result: {} ===\n",
            if self.passed() { "PASS" } else { "FAIL" }
        ));
        report
    }
}

/// Run `config.missions` random missions and check every invariant
pub async fn run_simulator(config: SimulatorConfig) -> Result<SimulatorReport, MissionError> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let scenarios: Vec<Scenario> = (0..config.missions)
        .map(|i| generate_scenario(&mut rng, i, config.max_loops))
        .collect();

    let results = join_all(scenarios.iter().map(run_scenario)).await;

    let mut outcomes = BTreeMap::new();
    let mut violations = Vec::new();
    for result in results {
        let outcome = result?;
        *outcomes.entry(outcome.report.outcome.as_str()).or_insert(0) += 1;
        violations.extend(check_invariants(&outcome));
    }
    Ok(SimulatorReport {
        config,
        outcomes,
        violations,
    })
}

/// Invariants of one closed mission
#[must_use]
pub fn check_invariants(outcome: &ScenarioOutcome) -> Vec<Violation> {
    let violation = |check, mission_id, details: String| Violation {
        scenario: outcome.name.clone(),
        mission_id,
        check,
        details,
    };
    let Some(record) = &outcome.record else {
        return vec![violation(
            InvariantCheck::MissionArchived,
            Some(outcome.report.mission_id),
            "closed mission missing from archive".into(),
        )];
    };
    let id = Some(record.mission.id);
    let mut found = Vec::new();

    if let Err(err) = verify_entries(&record.audit) {
        found.push(violation(InvariantCheck::AuditChainUnbroken, id, err.to_string()));
    }
    for entry in record.audit.iter().filter(|e| e.kind == AuditKind::Transition) {
        if let Some(details) = illegal_transition(entry) {
            found.push(violation(InvariantCheck::TransitionsInTable, id, details));
        }
    }
    if record.mission.loop_count > record.mission.max_loops {
        found.push(violation(
            InvariantCheck::LoopBudgetRespected,
            id,
            format!("{} loops > {}", record.mission.loop_count, record.mission.max_loops),
        ));
    }
    let closed_properly = record.mission.stage == Stage::Closed
        && record
            .audit
            .last()
            .is_some_and(|e| e.kind == AuditKind::Outcome && e.stage == Stage::Closed);
    if !closed_properly {
        found.push(violation(
            InvariantCheck::ClosedWithOutcomeEntry,
            id,
            "last audit entry is not the closing outcome".into(),
        ));
    }
    found.extend(
        bypassed_proposals(record)
            .into_iter()
            .map(|p| violation(InvariantCheck::GateNeverBypassed, id, format!("proposal {p} executed without approval"))),
    );
    if outcome.report.metrics.deception_detected
        && !record
            .audit
            .iter()
            .any(|e| e.kind == AuditKind::Conflict && e.summary.contains("vendor is lying"))
    {
        found.push(violation(
            InvariantCheck::DeceptionAudited,
            id,
            "deception flagged but not recorded".into(),
        ));
    }
    found
}

fn illegal_transition(entry: &AuditEntry) -> Option<String> {
    let (from, to) = entry.summary.split_once(" -> ")?;
    let parse = |name: &str| Stage::ALL.iter().copied().find(|s| s.as_str() == name);
    match (parse(from), parse(to)) {
        (Some(from), Some(to)) => validate_transition(from, to).err().map(|e| e.to_string()),
        _ => Some(format!("unparseable transition `{}`", entry.summary)),
    }
}

/// Executed proposals whose last gate verdict required approval that never came
fn bypassed_proposals(record: &MissionRecord) -> Vec<String> {
    let mut bypassed = Vec::new();
    for (i, entry) in record.audit.iter().enumerate() {
        let executed = entry.kind == AuditKind::Decision && entry.summary.starts_with("remediation executed");
        let Some(proposal) = entry.related_ids.first().filter(|_| executed) else {
            continue;
        };
        let gate_entries: Vec<&AuditEntry> = record.audit[..i]
            .iter()
            .filter(|e| e.kind == AuditKind::Gate && e.related_ids.contains(proposal))
            .collect();
        let needed_approval = gate_entries
            .iter()
            .any(|e| e.summary.starts_with("pending_approval"));
        let approved = gate_entries.iter().any(|e| e.summary.starts_with("approved"));
        let auto = gate_entries.iter().any(|e| e.summary.starts_with("auto_approved"));
        if (needed_approval && !approved) || (!needed_approval && !auto) {
            bypassed.push(proposal.clone());
        }
    }
    bypassed
}

const ALERTS: [(&str, &str, &str); 4] = [
    ("revenue-dashboard", "ERROR_DIV_ZERO", "division by zero in revenue view"),
    ("billing-etl", "ERROR_COL_MISSING", "column region does not exist"),
    ("partner-feed", "E503", "upstream returned 503 service unavailable"),
    ("nightly-batch", "E42", "job stalled without output"),
];

fn generate_scenario(rng: &mut StdRng, index: usize, max_loops: u32) -> Scenario {
    let (source, code, message) = ALERTS[rng.random_range(0..ALERTS.len())];
    let mut alert = Alert::new(source, code, message);
    alert.id = format!("sim-{index}");

    let collectors = [EvidenceKind::Logs, EvidenceKind::Schema, EvidenceKind::DataSample]
        .into_iter()
        .map(|kind| {
            let roll: f64 = rng.random();
            let mode = if roll < 0.6 {
                CollectorMode::Ok
            } else if roll < 0.8 {
                CollectorMode::Timeout
            } else {
                CollectorMode::Unavailable
            };
            CollectorScript {
                kind,
                mode,
                evidence: vec![EvidenceScript {
                    summary: format!("{kind} anomaly near {source}: {message}"),
                    failure_signal: rng.random_range(0.2..1.0),
                }],
                latency_ms: rng.random_range(0..10),
            }
        })
        .collect();

    let vendor_answers = [
        VendorAnswer::Healthy,
        VendorAnswer::Degraded,
        VendorAnswer::Unavailable,
    ];
    let vendor = VendorScript {
        replies: if rng.random_bool(0.3) {
            vec![VendorAnswer::Unavailable]
        } else {
            Vec::new()
        },
        then: vendor_answers[rng.random_range(0..vendor_answers.len())],
    };

    let memory = if rng.random_bool(0.3) {
        vec![RecalledIncident {
            signature: alert.signature(),
            root_cause: "previously seen failure".into(),
            fix_type: "create_view".into(),
            fix_action: format!("CREATE OR REPLACE VIEW {source}_v AS SELECT * FROM {source}_safe"),
            rollback: "restore previous view".into(),
        }]
    } else {
        Vec::new()
    };

    let low = ProposalScript {
        action: format!("CREATE OR REPLACE VIEW {source}_v AS SELECT * FROM {source}_clean"),
        fix_type: "create_view".into(),
        impact: "replaces a read-only view".into(),
        rollback: "restore previous view".into(),
        declared_tier: None,
    };
    let high = ProposalScript {
        action: format!("ALTER TABLE {source} ADD COLUMN region TEXT"),
        fix_type: "schema_change".into(),
        impact: "alters a production table".into(),
        rollback: "drop the added column".into(),
        declared_tier: None,
    };
    let reasoning = ReasoningScript {
        unavailable: rng.random_bool(0.15),
        diagnosis: Some(DiagnosisScript {
            root_cause: format!("{code} in {source}"),
            confidence_hint: rng.random_range(0.4..1.0),
        }),
        proposals: vec![if rng.random_bool(0.5) { high } else { low }],
    };

    let approvals = (0..max_loops + 1)
        .map(|_| ApprovalScript {
            decision: if rng.random_bool(0.6) {
                ApprovalDecision::Approved
            } else {
                ApprovalDecision::Denied
            },
            rationale: "simulated reviewer".into(),
            after_ms: rng.random_range(0..20),
        })
        .collect();

    Scenario {
        name: format!("sim-{index}"),
        description: String::new(),
        alert,
        config: simulation_config(rng.random(), max_loops),
        collectors,
        vendor,
        memory,
        reasoning,
        executor: ExecutorScript {
            failures: usize::from(rng.random_bool(0.2)),
            ineffective: false,
        },
        approvals,
        expect: None,
    }
}

fn simulation_config(seed: u64, max_loops: u32) -> CommanderConfig {
    let retry = RetryConfig {
        max_attempts: 3,
        base_delay_ms: 5,
        jitter_fraction: 0.25,
        seed: Some(seed),
    };
    CommanderConfig {
        max_loops,
        collector_timeout_ms: 50,
        vendor_timeout_ms: 50,
        memory_timeout_ms: 50,
        reasoning_timeout_ms: 50,
        action_timeout_ms: 50,
        approval_timeout_ms: Some(1_000),
        ..CommanderConfig::default()
    }
    .with_retry(retry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_is_deterministic() {
        let a = generate_scenario(&mut StdRng::seed_from_u64(7), 0, 3);
        let b = generate_scenario(&mut StdRng::seed_from_u64(7), 0, 3);
        assert_eq!(a.alert.signature(), b.alert.signature());
        assert_eq!(a.vendor.then, b.vendor.then);
        assert_eq!(a.memory.len(), b.memory.len());
        assert_eq!(a.approvals.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_missions_hold_every_invariant() {
        let report = run_simulator(SimulatorConfig {
            seed: 11,
            missions: 20,
            max_loops: 2,
        })
        .await
        .unwrap();
        assert!(report.passed(), "{}", report.generate_text());
        assert_eq!(report.outcomes.values().sum::<usize>(), 20);
    }
}
