//! Mission Commander
//!
//! Drives one mission per task through the OODA loop:
//! 1. **Observe**: evidence fan-out, vendor probe and memory lookup, concurrently
//! 2. **Orient**: merge evidence, reconcile the vendor claim, score confidence
//! 3. **Decide**: act, loop with a wider scope, or escalate
//! 4. **Act**: obtain a proposal, pass the safety gate, execute
//! 5. **Learn**: persist the incident summary
//!
//! Every stage change is checked against the kernel transition table and written
//! to the mission's audit trail. Missions share only the audit sink, the memory
//! store, the gate registry and the archive.

use std::future::Future;
use std::sync::Arc;

use dart_kernel::audit::{AuditDraft, AuditKind, AuditSink, AuditTrail, TracingSink};
use dart_kernel::backoff::{BackoffError, Retried};
use dart_kernel::state_machine::StageMachine;
use dart_kernel::types::{MissionId, Outcome, ProposalId, Stage};
use dart_kernel::StateMachineError;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::CommanderConfig;
use crate::error::{CollaboratorError, MissionError};
use crate::evidence::{fan_out, EvidenceCollector, MissionContext, SignatureMatch, SignatureScanCollector, SignatureScanner};
use crate::gate::{ApprovalChannel, ResolveOutcome, RiskTaxonomy, SafetyGate, TicketOutcome};
use crate::memory::{embed, IncidentSummary, MemoryLookup, MemoryMatch, MemoryOutcome, MemoryStore};
use crate::reasoning::{ActionExecutor, DiagnosisRequest, ReasoningService, RemediationRequest};
use crate::report;
use crate::types::{
    Alert, ApprovalDecision, Conflict, Diagnosis, DiagnosisSource, EscalationReason, EvidenceKind,
    EvidenceSet, GateVerdict, Mission, MissionMetrics, MissionRecord, MissionReport,
    ProposalOrigin, RemediationProposal, VendorSignal, VendorStatus,
};
use crate::vendor::{VendorEndpoint, VendorLiaison};

const ACTOR: &str = "commander";

/// External collaborators of the Commander
#[derive(Clone)]
pub struct Collaborators {
    pub collectors: Vec<Arc<dyn EvidenceCollector>>,
    pub scanner: Arc<SignatureScanner>,
    pub vendor: Arc<dyn VendorEndpoint>,
    pub memory: Arc<dyn MemoryStore>,
    pub reasoning: Arc<dyn ReasoningService>,
    pub executor: Arc<dyn ActionExecutor>,
    pub approvals: Arc<dyn ApprovalChannel>,
}

impl Collaborators {
    /// Collaborators with no evidence collectors and the built-in signature rules
    #[must_use]
    pub fn new(
        vendor: Arc<dyn VendorEndpoint>,
        memory: Arc<dyn MemoryStore>,
        reasoning: Arc<dyn ReasoningService>,
        executor: Arc<dyn ActionExecutor>,
        approvals: Arc<dyn ApprovalChannel>,
    ) -> Self {
        Self {
            collectors: Vec::new(),
            scanner: Arc::new(SignatureScanner::default()),
            vendor,
            memory,
            reasoning,
            executor,
            approvals,
        }
    }

    /// Register an evidence collector
    #[inline]
    #[must_use]
    pub fn with_collector(mut self, collector: Arc<dyn EvidenceCollector>) -> Self {
        self.collectors.push(collector);
        self
    }

    /// Replace the signature scanner
    #[inline]
    #[must_use]
    pub fn with_scanner(mut self, scanner: SignatureScanner) -> Self {
        self.scanner = Arc::new(scanner);
        self
    }
}

/// Closed missions, queryable by id
#[derive(Debug, Default)]
pub struct MissionArchive {
    records: DashMap<MissionId, MissionRecord>,
}

impl MissionArchive {
    #[must_use]
    pub fn get(&self, id: MissionId) -> Option<MissionRecord> {
        self.records.get(&id).map(|r| r.clone())
    }

    /// Ids of every archived mission, oldest first
    #[must_use]
    pub fn ids(&self) -> Vec<MissionId> {
        let mut ids: Vec<_> = self.records.iter().map(|r| *r.key()).collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn insert(&self, record: MissionRecord) {
        self.records.insert(record.mission.id, record);
    }
}

/// Running mission
#[derive(Debug)]
pub struct MissionHandle {
    id: MissionId,
    cancel: CancellationToken,
    join: JoinHandle<MissionReport>,
}

impl MissionHandle {
    #[inline]
    #[must_use]
    pub fn id(&self) -> MissionId {
        self.id
    }

    /// Token that aborts the mission
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Abort the mission; it still closes with a final audit entry
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the mission to close
    pub async fn join(self) -> Result<MissionReport, MissionError> {
        self.join.await.map_err(|e| MissionError::Unavailable {
            collaborator: "mission task",
            reason: e.to_string(),
        })
    }
}

/// The mission commander
pub struct Commander {
    config: CommanderConfig,
    collectors: Vec<Arc<dyn EvidenceCollector>>,
    scanner: Arc<SignatureScanner>,
    liaison: VendorLiaison,
    memory: MemoryLookup,
    reasoning: Arc<dyn ReasoningService>,
    executor: Arc<dyn ActionExecutor>,
    gate: SafetyGate,
    sink: Arc<dyn AuditSink>,
    archive: MissionArchive,
    live: DashMap<MissionId, Stage>,
}

impl std::fmt::Debug for Commander {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Commander")
            .field("config", &self.config)
            .field("collectors", &self.collectors.len())
            .field("gate", &self.gate)
            .field("archived", &self.archive.len())
            .field("live", &self.live.len())
            .finish_non_exhaustive()
    }
}

impl Commander {
    /// Validate the configuration and wire the collaborators
    pub fn new(config: CommanderConfig, collaborators: Collaborators) -> Result<Self, MissionError> {
        config.validate()?;

        let mut collectors = collaborators.collectors;
        if !collectors.iter().any(|c| c.kind() == EvidenceKind::SignatureScan) {
            collectors.push(Arc::new(SignatureScanCollector::new(collaborators.scanner.clone())));
        }

        let liaison = VendorLiaison::new(collaborators.vendor)
            .with_policy(config.vendor_retry.policy())
            .with_attempt_timeout(config.vendor_timeout())
            .with_thresholds(config.conflict_floor, config.deception_threshold);
        let memory = MemoryLookup::new(
            collaborators.memory,
            config.memory_top_k,
            config.memory_timeout(),
            config.memory_hint_similarity,
        );
        let gate = SafetyGate::new(RiskTaxonomy::from_config(&config.risk_rules), collaborators.approvals);

        Ok(Self {
            config,
            collectors,
            scanner: collaborators.scanner,
            liaison,
            memory,
            reasoning: collaborators.reasoning,
            executor: collaborators.executor,
            gate,
            sink: Arc::new(TracingSink),
            archive: MissionArchive::default(),
            live: DashMap::new(),
        })
    }

    /// Send audit entries to `sink` instead of the log
    #[inline]
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn config(&self) -> &CommanderConfig {
        &self.config
    }

    #[must_use]
    pub fn gate(&self) -> &SafetyGate {
        &self.gate
    }

    #[must_use]
    pub fn archive(&self) -> &MissionArchive {
        &self.archive
    }

    /// Current stage of a running mission
    #[must_use]
    pub fn stage_of(&self, id: MissionId) -> Option<Stage> {
        self.live.get(&id).map(|s| *s)
    }

    /// Spawn a mission on its own task
    pub fn launch(self: &Arc<Self>, alert: Alert) -> MissionHandle {
        let mission = Mission::new(alert, self.config.max_loops);
        let id = mission.id;
        let cancel = CancellationToken::new();
        self.live.insert(id, Stage::Created);

        let commander = Arc::clone(self);
        let token = cancel.clone();
        let join = tokio::spawn(async move { commander.drive(mission, token).await });
        MissionHandle { id, cancel, join }
    }

    /// Run a mission on the current task until it closes
    pub async fn run(&self, alert: Alert, cancel: CancellationToken) -> MissionReport {
        let mission = Mission::new(alert, self.config.max_loops);
        self.live.insert(mission.id, Stage::Created);
        self.drive(mission, cancel).await
    }

    /// Human decision on a pending proposal; repeated or stale calls are logged no-ops
    pub fn resolve(
        &self,
        mission_id: MissionId,
        proposal_id: ProposalId,
        decision: ApprovalDecision,
        rationale: impl Into<String>,
    ) -> ResolveOutcome {
        match self.gate.resolve(mission_id, proposal_id, decision, rationale) {
            ResolveOutcome::UnknownMission if self.archive.records.contains_key(&mission_id) => {
                tracing::info!(%mission_id, %proposal_id, "resolve for a closed mission ignored");
                ResolveOutcome::AlreadyResolved
            }
            outcome => outcome,
        }
    }

    #[tracing::instrument(name = "mission", skip_all, fields(mission_id = %mission.id))]
    async fn drive(&self, mission: Mission, cancel: CancellationToken) -> MissionReport {
        tracing::info!(alert = %mission.alert.id, signature = %mission.alert.signature(), "mission started");
        let mut run = MissionRun::new(self, mission, cancel);
        let mut step = Step::Observe;
        loop {
            if run.cancel.is_cancelled() && !matches!(step, Step::Close(..)) {
                step = Step::Close(Outcome::Aborted, None);
            }
            step = match step {
                Step::Observe => run.observe().await,
                Step::Orient => run.orient(),
                Step::Decide => run.decide().await,
                Step::Act => run.act().await,
                Step::Learn => run.learn().await,
                Step::Close(outcome, reason) => break run.close(outcome, reason),
            };
        }
    }
}

#[derive(Debug)]
enum Step {
    Observe,
    Orient,
    Decide,
    Act,
    Learn,
    Close(Outcome, Option<EscalationReason>),
}

/// Mutable state of one mission, owned by its task
struct MissionRun<'a> {
    commander: &'a Commander,
    config: &'a CommanderConfig,
    mission: Mission,
    machine: StageMachine,
    trail: AuditTrail,
    cancel: CancellationToken,
    started: Instant,

    scope: Vec<EvidenceKind>,
    evidence: EvidenceSet,
    signature: Option<SignatureMatch>,
    vendor_signal: Option<VendorSignal>,
    conflict: Option<Conflict>,
    conflict_raised: bool,
    memory_hit: Option<MemoryMatch>,
    fast_track_spent: bool,

    diagnosis: Option<Diagnosis>,
    proposal: Option<RemediationProposal>,
    denied: Vec<RemediationProposal>,

    orient_confidence: f64,
    passes: u32,
    starved_passes: u32,
    reasoning_failed_attempts: Option<u32>,
    failure: Option<EscalationReason>,
    metrics: MissionMetrics,
}

impl<'a> MissionRun<'a> {
    fn new(commander: &'a Commander, mission: Mission, cancel: CancellationToken) -> Self {
        let config = &commander.config;
        Self {
            commander,
            config,
            machine: StageMachine::new(mission.max_loops),
            trail: AuditTrail::new(mission.id, commander.sink.clone()),
            mission,
            cancel,
            started: Instant::now(),
            scope: config.initial_scope.clone(),
            evidence: EvidenceSet::new(),
            signature: None,
            vendor_signal: None,
            conflict: None,
            conflict_raised: false,
            memory_hit: None,
            fast_track_spent: false,
            diagnosis: None,
            proposal: None,
            denied: Vec::new(),
            orient_confidence: 0.0,
            passes: 0,
            starved_passes: 0,
            reasoning_failed_attempts: None,
            failure: None,
            metrics: MissionMetrics::default(),
        }
    }

    fn record(&mut self, kind: AuditKind, summary: impl Into<String>) {
        let stage = self.machine.stage();
        self.trail.append(AuditDraft::new(stage, kind, ACTOR, summary));
    }

    fn record_draft(&mut self, draft: AuditDraft) {
        self.trail.append(draft);
    }

    /// Validated, audited stage change
    fn enter(&mut self, to: Stage) -> Result<(), MissionError> {
        let from = self.machine.advance(to)?;
        self.mission.stage = to;
        self.commander.live.insert(self.mission.id, to);
        tracing::debug!(%from, %to, loop_count = self.machine.loop_count(), "stage transition");
        self.record(AuditKind::Transition, format!("{from} -> {to}"));
        Ok(())
    }

    /// `enter`, closing the mission as escalated on a table violation
    fn enter_or_close(&mut self, to: Stage) -> Option<Step> {
        match self.enter(to) {
            Ok(()) => None,
            Err(err) => self.absorb(err),
        }
    }

    /// Fatal errors close the mission; the rest are audited and the mission carries on
    fn absorb(&mut self, err: MissionError) -> Option<Step> {
        if err.is_fatal() {
            return Some(self.fail(err));
        }
        tracing::warn!(error = %err, "mission continues degraded");
        self.record(AuditKind::Warning, err.to_string());
        None
    }

    fn fail(&mut self, err: MissionError) -> Step {
        match err {
            MissionError::Cancelled => Self::aborted(),
            MissionError::LoopExceeded { .. } => {
                Step::Close(Outcome::Escalated, Some(self.escalation_reason()))
            }
            err => {
                tracing::error!(error = %err, "mission failed");
                Step::Close(
                    Outcome::Escalated,
                    Some(EscalationReason::Internal { detail: err.to_string() }),
                )
            }
        }
    }

    /// Consume a loop and continue with `then`, or escalate when the budget is spent
    fn next_loop(&mut self, cause: &str, then: Step) -> Step {
        match self.machine.consume_loop() {
            Ok(loop_count) => {
                self.mission.loop_count = loop_count;
                self.record(
                    AuditKind::Decision,
                    format!("loop {loop_count}/{}: {cause}", self.machine.max_loops()),
                );
                tracing::info!(loop_count, cause, "mission loops");
                then
            }
            Err(StateMachineError::LoopBudgetExhausted { max_loops }) => {
                let err = MissionError::LoopExceeded { max_loops };
                self.record(AuditKind::Decision, format!("escalate: {err} ({cause})"));
                self.fail(err)
            }
            Err(err) => self.fail(err.into()),
        }
    }

    /// Most specific cause first; the failure of the final step outranks the evidence history
    fn escalation_reason(&self) -> EscalationReason {
        if let Some(reason) = &self.failure {
            return reason.clone();
        }
        if self.passes > 0 && self.starved_passes == self.passes {
            return EscalationReason::EvidenceUnavailable {
                loops: self.machine.loop_count(),
            };
        }
        if let Some(attempts) = self.reasoning_failed_attempts {
            return EscalationReason::ReasoningUnavailable { attempts };
        }
        if let Some(conflict) = self.conflict.as_ref().filter(|c| c.deception) {
            return EscalationReason::UnresolvedConflict { severity: conflict.severity };
        }
        EscalationReason::LowConfidence {
            loops: self.machine.loop_count(),
            confidence: self.mission.confidence,
        }
    }

    fn aborted() -> Step {
        Step::Close(Outcome::Aborted, None)
    }

    async fn observe(&mut self) -> Step {
        if let Some(step) = self.enter_or_close(Stage::Observing) {
            return step;
        }
        self.passes += 1;
        self.diagnosis = None;
        self.failure = None;
        self.reasoning_failed_attempts = None;

        let ctx = MissionContext {
            mission_id: self.mission.id,
            alert: self.mission.alert.clone(),
            loop_count: self.machine.loop_count(),
            scope: self.scope.clone(),
        };
        let signature = self.mission.alert.signature();
        let first_pass = self.passes == 1;
        let commander = self.commander;
        let config = self.config;
        let cancel = self.cancel.clone();

        let memory = async {
            if first_pass {
                Some(commander.memory.lookup(&signature).await)
            } else {
                None
            }
        };
        let branches = async {
            tokio::join!(
                fan_out(&commander.collectors, &ctx, config.collector_timeout()),
                commander.liaison.probe(&config.vendor_target, &cancel),
                memory,
            )
        };
        let (mut fanout, probe, memory) = tokio::select! {
            biased;
            () = cancel.cancelled() => return Self::aborted(),
            joined = branches => joined,
        };
        if probe.cancelled {
            return Self::aborted();
        }

        // signature strength comes from the alert and from tagged log lines
        let mut signature_hit = commander.scanner.scan_alert(&self.mission.alert);
        for evidence in fanout.evidence.iter_mut().filter(|e| e.kind == EvidenceKind::Logs) {
            if let Some(hit) = commander.scanner.tag(evidence) {
                if signature_hit.as_ref().map_or(true, |s| hit.confidence > s.confidence) {
                    signature_hit = Some(hit);
                }
            }
        }
        if signature_hit.is_some() {
            self.signature = signature_hit;
        }

        for warning in &fanout.warnings {
            self.record(AuditKind::Warning, warning.to_string());
        }
        if fanout.evidence.is_empty() && !fanout.warnings.is_empty() {
            self.starved_passes += 1;
        }

        let ids: Vec<_> = fanout.evidence.iter().map(|e| e.id).collect();
        let kinds: Vec<&str> = self.scope.iter().map(EvidenceKind::as_str).collect();
        let summary = format!(
            "{} evidence item(s) from {} collector(s), scope [{}]",
            fanout.evidence.len(),
            fanout.attempted,
            kinds.join(", ")
        );
        self.record_draft(
            AuditDraft::new(Stage::Observing, AuditKind::Evidence, "collectors", summary)
                .with_related_all(ids),
        );
        self.evidence.extend(fanout.evidence);
        self.metrics.evidence_count = self.evidence.len();

        let signal = probe.signal;
        self.metrics.vendor_verdict = Some(signal.status);
        if signal.status == VendorStatus::Unknown {
            self.record_draft(
                AuditDraft::new(
                    Stage::Observing,
                    AuditKind::Warning,
                    "vendor-liaison",
                    format!("vendor signal absent after {} attempt(s)", signal.attempts),
                )
                .with_related(signal.id),
            );
        } else {
            self.record_draft(
                AuditDraft::new(
                    Stage::Observing,
                    AuditKind::Evidence,
                    "vendor-liaison",
                    format!("vendor reports {} after {} attempt(s)", signal.status, signal.attempts),
                )
                .with_related(signal.id),
            );
        }

        match memory {
            Some(MemoryOutcome::Hit(hit)) => {
                self.record_draft(
                    AuditDraft::new(
                        Stage::Observing,
                        AuditKind::Evidence,
                        "memory",
                        format!(
                            "memory recalls incident {} (similarity {:.2})",
                            hit.summary.incident_id, hit.similarity
                        ),
                    )
                    .with_related(hit.summary.incident_id),
                );
                self.memory_hit = Some(hit);
            }
            Some(MemoryOutcome::Miss { best_similarity }) => {
                let best = best_similarity.map_or_else(|| "none".to_string(), |s| format!("{s:.2}"));
                self.record_draft(AuditDraft::new(
                    Stage::Observing,
                    AuditKind::Evidence,
                    "memory",
                    format!("no similar incident (best similarity {best})"),
                ));
            }
            Some(MemoryOutcome::Unavailable(reason)) => {
                self.record_draft(AuditDraft::new(
                    Stage::Observing,
                    AuditKind::Warning,
                    "memory",
                    format!("memory unavailable: {reason}"),
                ));
            }
            None => {}
        }

        self.conflict = commander.liaison.reconcile(&signal, &self.evidence);
        self.vendor_signal = Some(signal);
        if let Some(conflict) = self.conflict.clone() {
            self.conflict_raised = true;
            let summary = if conflict.deception {
                self.metrics.deception_detected = true;
                tracing::warn!(severity = conflict.severity, "vendor claim contradicted; treating vendor as deceptive");
                format!(
                    "vendor claims healthy but evidence implies failure (severity {:.2}); hypothesis: vendor is lying",
                    conflict.severity
                )
            } else {
                format!("{:?} (severity {:.2})", conflict.kind, conflict.severity)
            };
            self.record_draft(
                AuditDraft::new(Stage::Observing, AuditKind::Conflict, "vendor-liaison", summary)
                    .with_related(conflict.signal_id)
                    .with_related_all(conflict.evidence_ids.iter()),
            );
        }

        if let Some(hit) = self.memory_hit.clone() {
            if hit.similarity > self.config.fast_track_similarity && !self.fast_track_spent {
                if self.conflict_raised {
                    self.record(
                        AuditKind::Decision,
                        "fast-track suppressed: vendor conflict forces full diagnosis",
                    );
                } else {
                    self.fast_track_spent = true;
                    self.metrics.fast_tracked = true;
                    self.mission.confidence = hit.similarity;
                    self.diagnosis = Some(Diagnosis {
                        root_cause: hit.summary.root_cause.clone(),
                        confidence_hint: hit.similarity,
                        source: DiagnosisSource::Memory,
                    });
                    self.proposal = Some(hit.recalled_proposal());
                    self.record_draft(
                        AuditDraft::new(
                            Stage::Observing,
                            AuditKind::Decision,
                            ACTOR,
                            format!(
                                "fast-track: replaying fix from incident {} (similarity {:.2})",
                                hit.summary.incident_id, hit.similarity
                            ),
                        )
                        .with_related(hit.summary.incident_id),
                    );
                    return Step::Act;
                }
            }
        }
        Step::Orient
    }

    fn orient(&mut self) -> Step {
        if let Some(step) = self.enter_or_close(Stage::Orienting) {
            return step;
        }

        let signature = self.signature.as_ref().map_or(0.0, |s| s.confidence);
        let volume = (self.evidence.len() as f64 / 3.0).min(1.0);
        let evidence_score = self.evidence.failure_likelihood() * volume;
        let hint = self
            .memory_hit
            .as_ref()
            .map_or(0.0, |m| m.similarity)
            .min(1.0);
        let delta = self.conflict.as_ref().map_or(0.0, |c| c.confidence_delta);

        let mut confidence = signature.max(evidence_score).max(hint * 0.8) + delta;
        if let Some(conflict) = self.conflict.as_ref().filter(|c| c.deception) {
            confidence = confidence.max(conflict.severity);
        }
        let confidence = crate::types::clamp_unit(confidence);
        self.orient_confidence = confidence;
        self.mission.confidence = confidence;

        self.record(
            AuditKind::Decision,
            format!(
                "confidence {confidence:.2} (signature {signature:.2}, evidence {evidence_score:.2}, memory hint {hint:.2}, conflict delta {delta:+.2})"
            ),
        );
        Step::Decide
    }

    async fn decide(&mut self) -> Step {
        if let Some(step) = self.enter_or_close(Stage::Deciding) {
            return step;
        }

        if self.diagnosis.is_none() {
            let confident_signature = self
                .signature
                .as_ref()
                .filter(|s| s.confidence >= self.config.signature_confidence)
                .cloned();
            match confident_signature {
                Some(hit) if !self.conflict_raised => {
                    self.record(
                        AuditKind::Decision,
                        format!("signature {} is conclusive; reasoning skipped", hit.rule),
                    );
                    self.diagnosis = Some(Diagnosis {
                        root_cause: hit.diagnosis,
                        confidence_hint: hit.confidence,
                        source: DiagnosisSource::Signature,
                    });
                }
                _ => match self.full_diagnosis().await {
                    Ok(diagnosis) => self.diagnosis = diagnosis,
                    Err(step) => return step,
                },
            }
        }

        let orient = self.orient_confidence;
        let combined = match &self.diagnosis {
            Some(d) if d.source == DiagnosisSource::Reasoning => {
                let mut combined = 0.4 * orient + 0.6 * d.confidence_hint;
                if let Some(conflict) = self.conflict.as_ref().filter(|c| c.deception) {
                    combined = combined.max(conflict.severity);
                }
                combined
            }
            Some(d) if d.source == DiagnosisSource::Memory => orient.max(d.confidence_hint),
            Some(_) => orient,
            None => orient * 0.5,
        };
        let combined = crate::types::clamp_unit(combined);
        self.mission.confidence = combined;

        if self.diagnosis.is_some() && combined >= self.config.confidence_threshold {
            self.record(
                AuditKind::Decision,
                format!(
                    "act: confidence {combined:.2} >= {:.2}",
                    self.config.confidence_threshold
                ),
            );
            return Step::Act;
        }

        let cause = if self.diagnosis.is_none() {
            "no diagnosis available".to_string()
        } else {
            format!(
                "confidence {combined:.2} below {:.2}",
                self.config.confidence_threshold
            )
        };
        self.expand_scope();
        self.next_loop(&cause, Step::Observe)
    }

    /// Ask the reasoning collaborator; `Ok(None)` when it stayed unavailable
    async fn full_diagnosis(&mut self) -> Result<Option<Diagnosis>, Step> {
        let request = DiagnosisRequest {
            mission_id: self.mission.id,
            alert: self.mission.alert.clone(),
            evidence: self.evidence.clone(),
            digest: self.evidence.digest(self.config.digest_lines),
            conflict: self.conflict.clone(),
            loop_count: self.machine.loop_count(),
        };
        let commander = self.commander;
        let result = self
            .reasoning_call(|| commander.reasoning.diagnose(&request))
            .await;
        match result {
            Ok(retried) => {
                self.metrics.reasoning_calls += attempts(&retried.history);
                let mut diagnosis = retried.value;
                diagnosis.source = DiagnosisSource::Reasoning;
                diagnosis.confidence_hint = crate::types::clamp_unit(diagnosis.confidence_hint);
                self.record(
                    AuditKind::Decision,
                    format!(
                        "full diagnosis: {} (hint {:.2})",
                        diagnosis.root_cause, diagnosis.confidence_hint
                    ),
                );
                Ok(Some(diagnosis))
            }
            Err(BackoffError::Exhausted { attempts, last_error, .. }) => {
                self.metrics.reasoning_calls += attempts;
                self.reasoning_failed_attempts = Some(attempts);
                self.absorb(MissionError::Exhausted {
                    operation: "reasoning",
                    attempts,
                    last_error: last_error.to_string(),
                })
                .map_or(Ok(None), Err)
            }
            Err(BackoffError::Cancelled { .. }) => Err(self.fail(MissionError::Cancelled)),
        }
    }

    fn expand_scope(&mut self) {
        if self.scope.len() < EvidenceKind::ALL.len() {
            self.scope = EvidenceKind::ALL.to_vec();
            self.record(AuditKind::Decision, "scope expanded to every evidence kind");
        }
    }

    async fn act(&mut self) -> Step {
        if let Some(step) = self.enter_or_close(Stage::Acting) {
            return step;
        }

        let proposal = match self.proposal.take() {
            Some(recalled) => recalled,
            None => match self.request_proposal().await {
                Ok(Some(proposal)) => proposal,
                Ok(None) => return self.next_loop("no remediation proposal", Step::Observe),
                Err(step) => return step,
            },
        };

        let evaluation = self.commander.gate.evaluate(&proposal);
        self.metrics.last_approval = Some(evaluation.verdict);
        self.record_draft(
            AuditDraft::new(
                Stage::Acting,
                AuditKind::Gate,
                "safety-gate",
                format!(
                    "{} for {} risk (rule {})",
                    evaluation.verdict,
                    evaluation.tier,
                    evaluation.rule.as_deref().unwrap_or("none")
                ),
            )
            .with_related(proposal.id),
        );

        if evaluation.verdict == GateVerdict::PendingApproval {
            let mut ticket = match self
                .commander
                .gate
                .submit(self.mission.id, &proposal, &evaluation)
                .await
            {
                Ok(ticket) => ticket,
                Err(err) => {
                    let detail = MissionError::Unavailable {
                        collaborator: "approval channel",
                        reason: err.to_string(),
                    }
                    .to_string();
                    self.record(AuditKind::Warning, detail.clone());
                    return Step::Close(
                        Outcome::Escalated,
                        Some(EscalationReason::ActionFailed { detail }),
                    );
                }
            };
            self.metrics.approval_requests += 1;
            if let Some(step) = self.enter_or_close(Stage::Blocked) {
                self.commander.gate.withdraw(self.mission.id);
                return step;
            }

            let waited = ticket.wait(self.config.approval_timeout(), &self.cancel).await;
            let resolution = match waited {
                TicketOutcome::Resolved(resolution) => resolution,
                TicketOutcome::TimedOut(after) => {
                    let after_ms = u64::try_from(after.as_millis()).unwrap_or(u64::MAX);
                    let late = if self.commander.gate.withdraw(self.mission.id) {
                        None
                    } else {
                        ticket.take_resolution()
                    };
                    match late {
                        Some(resolution) => {
                            self.record(
                                AuditKind::Gate,
                                format!("decision arrived as the {after_ms}ms approval window closed"),
                            );
                            resolution
                        }
                        None => {
                            self.record(AuditKind::Gate, format!("approval timed out after {after_ms}ms"));
                            return Step::Close(
                                Outcome::Escalated,
                                Some(EscalationReason::ApprovalTimeout { after_ms }),
                            );
                        }
                    }
                }
                TicketOutcome::Cancelled => {
                    if !self.commander.gate.withdraw(self.mission.id) {
                        if let Some(resolution) = ticket.take_resolution() {
                            let verdict = GateVerdict::from(resolution.decision);
                            self.record(
                                AuditKind::Gate,
                                format!("{verdict} discarded: mission cancelled before it applied"),
                            );
                        }
                    }
                    return self.fail(MissionError::Cancelled);
                }
            };

            let verdict = GateVerdict::from(resolution.decision);
            self.metrics.last_approval = Some(verdict);
            self.record_draft(
                AuditDraft::new(
                    Stage::Blocked,
                    AuditKind::Gate,
                    "operator",
                    format!("{verdict}: {}", resolution.rationale),
                )
                .with_related(proposal.id),
            );
            if let Some(step) = self.enter_or_close(Stage::Acting) {
                return step;
            }
            if resolution.decision == ApprovalDecision::Denied {
                let denial = MissionError::GateDenied {
                    rationale: resolution.rationale.clone(),
                };
                self.failure = Some(EscalationReason::GateDenied {
                    rationale: resolution.rationale,
                });
                self.denied.push(proposal);
                return self.next_loop(&denial.to_string(), Step::Decide);
            }
        }

        self.execute(proposal).await
    }

    /// Ask the reasoning collaborator for a fix; `Ok(None)` when it stayed unavailable
    async fn request_proposal(&mut self) -> Result<Option<RemediationProposal>, Step> {
        let Some(diagnosis) = self.diagnosis.clone() else {
            return Ok(None);
        };
        let request = RemediationRequest {
            mission_id: self.mission.id,
            alert: self.mission.alert.clone(),
            diagnosis,
            digest: self.evidence.digest(self.config.digest_lines),
            denied: self.denied.clone(),
        };
        let commander = self.commander;
        let result = self
            .reasoning_call(|| commander.reasoning.propose_remediation(&request))
            .await;
        match result {
            Ok(retried) => {
                self.metrics.reasoning_calls += attempts(&retried.history);
                let mut proposal = retried.value;
                proposal.origin = ProposalOrigin::Reasoning;
                self.record_draft(
                    AuditDraft::new(
                        Stage::Acting,
                        AuditKind::Decision,
                        "reasoning",
                        format!("proposal {}: {}", proposal.fix_type, proposal.action),
                    )
                    .with_related(proposal.id),
                );
                Ok(Some(proposal))
            }
            Err(BackoffError::Exhausted { attempts, last_error, .. }) => {
                self.metrics.reasoning_calls += attempts;
                self.reasoning_failed_attempts = Some(attempts);
                self.absorb(MissionError::Exhausted {
                    operation: "remediation proposal",
                    attempts,
                    last_error: last_error.to_string(),
                })
                .map_or(Ok(None), Err)
            }
            Err(BackoffError::Cancelled { .. }) => Err(self.fail(MissionError::Cancelled)),
        }
    }

    async fn execute(&mut self, proposal: RemediationProposal) -> Step {
        let timeout = self.config.action_timeout();
        let commander = self.commander;
        let cancel = self.cancel.clone();
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Self::aborted(),
            outcome = tokio::time::timeout(timeout, commander.executor.execute(&proposal)) => outcome,
        };

        let failure = match outcome {
            Ok(Ok(receipt)) if receipt.is_ineffective() => Some(format!(
                "action reported success but verification failed: {}",
                receipt.detail
            )),
            Ok(Ok(receipt)) => {
                self.metrics.remediation_origin = Some(proposal.origin);
                self.record_draft(
                    AuditDraft::new(
                        Stage::Acting,
                        AuditKind::Decision,
                        "executor",
                        format!("remediation executed: {}", receipt.detail),
                    )
                    .with_related(proposal.id),
                );
                None
            }
            Ok(Err(err)) => Some(err.to_string()),
            Err(_) => Some(
                MissionError::Timeout {
                    operation: "action",
                    after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }
                .to_string(),
            ),
        };

        match failure {
            None => {
                self.proposal = Some(proposal);
                Step::Learn
            }
            Some(detail) => {
                self.record_draft(
                    AuditDraft::new(
                        Stage::Acting,
                        AuditKind::Warning,
                        "executor",
                        format!("action failed: {detail}"),
                    )
                    .with_related(proposal.id),
                );
                self.failure = Some(EscalationReason::ActionFailed { detail: detail.clone() });
                self.next_loop(&format!("action failed: {detail}"), Step::Observe)
            }
        }
    }

    async fn learn(&mut self) -> Step {
        if let Some(step) = self.enter_or_close(Stage::Learning) {
            return step;
        }
        let Some(proposal) = self.proposal.clone() else {
            return Step::Close(Outcome::Resolved, None);
        };

        if proposal.origin == ProposalOrigin::Memory {
            self.record(AuditKind::Decision, "recalled fix succeeded; pattern already in memory");
            return Step::Close(Outcome::Resolved, None);
        }

        let signature = self.mission.alert.signature();
        let summary = IncidentSummary {
            incident_id: self.mission.id,
            embedding: embed(&signature),
            signature,
            root_cause: self
                .diagnosis
                .as_ref()
                .map_or_else(String::new, |d| d.root_cause.clone()),
            fix_type: proposal.fix_type.clone(),
            fix_action: proposal.action.clone(),
            rollback: proposal.rollback.clone(),
            timestamp: chrono::Utc::now(),
            evidence_digest: self.evidence.digest(self.config.digest_lines),
            vendor_verdict: self
                .vendor_signal
                .as_ref()
                .map_or(VendorStatus::Unknown, |s| s.status),
        };

        let store = self.commander.memory.store().clone();
        match tokio::time::timeout(self.config.memory_timeout(), store.store(summary)).await {
            Ok(Ok(())) => self.record_draft(AuditDraft::new(
                Stage::Learning,
                AuditKind::Decision,
                "memory",
                "incident summary stored",
            )),
            Ok(Err(err)) => self.record_draft(AuditDraft::new(
                Stage::Learning,
                AuditKind::Warning,
                "memory",
                format!("incident summary not stored: {err}"),
            )),
            Err(_) => self.record_draft(AuditDraft::new(
                Stage::Learning,
                AuditKind::Warning,
                "memory",
                "incident summary not stored: timed out",
            )),
        }
        Step::Close(Outcome::Resolved, None)
    }

    fn close(mut self, outcome: Outcome, reason: Option<EscalationReason>) -> MissionReport {
        if !self.machine.stage().is_terminal() {
            if let Err(err) = self.enter(Stage::Closed) {
                tracing::error!(error = %err, "closing transition rejected");
            }
        }
        let mission_id = self.mission.id;
        let headline = match &reason {
            Some(reason) => format!("mission {outcome}: {reason}"),
            None => format!("mission {outcome}"),
        };
        self.record(AuditKind::Outcome, headline);

        self.mission.outcome = Some(outcome);
        self.mission.closed_at = Some(chrono::Utc::now());
        self.mission.loop_count = self.machine.loop_count();
        self.metrics.loop_attempts = self.machine.loop_count();
        self.metrics.duration_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        metrics::counter!("dart_missions_closed_total", "outcome" => outcome.as_str()).increment(1);

        let report = MissionReport {
            mission_id,
            outcome,
            summary: report::summarize(outcome, reason.as_ref(), self.trail.entries()),
            escalation: reason,
            confidence: self.mission.confidence,
            loop_count: self.machine.loop_count(),
            diagnosis: self.diagnosis.clone(),
            proposal: self.proposal.clone().or_else(|| self.denied.last().cloned()),
            metrics: self.metrics.clone(),
        };
        tracing::info!(outcome = %outcome, loops = report.loop_count, summary = %report.summary, "mission closed");

        self.commander.archive.insert(MissionRecord {
            mission: self.mission,
            audit: self.trail.into_entries(),
            outcome,
            report: report.clone(),
        });
        self.commander.live.remove(&mission_id);
        self.commander.gate.forget(mission_id);
        report
    }

    /// Reasoning call under the reasoning retry policy, each attempt bounded by the reasoning timeout
    async fn reasoning_call<T, F, Fut>(&self, mut call: F) -> Result<Retried<T>, BackoffError<CollaboratorError>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CollaboratorError>>,
    {
        let timeout = self.config.reasoning_timeout();
        let after_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.config
            .reasoning_retry
            .policy()
            .execute(&self.cancel, |_attempt| {
                let call = call();
                async move {
                    match tokio::time::timeout(timeout, call).await {
                        Ok(result) => result,
                        Err(_) => Err(CollaboratorError::Timeout { after_ms }),
                    }
                }
            })
            .await
    }
}

fn attempts(history: &dart_kernel::backoff::AttemptHistory) -> u32 {
    u32::try_from(history.len()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_harness::{ScriptedExecutor, ScriptedReasoning, ScriptedVendor, QueueApprovals};
    use crate::memory::InMemoryStore;

    fn commander(config: CommanderConfig) -> Commander {
        let (approvals, _rx) = QueueApprovals::new();
        let collaborators = Collaborators::new(
            Arc::new(ScriptedVendor::honest()),
            Arc::new(InMemoryStore::new()),
            Arc::new(ScriptedReasoning::default()),
            Arc::new(ScriptedExecutor::default()),
            Arc::new(approvals),
        );
        Commander::new(config, collaborators).unwrap()
    }

    #[test]
    fn invalid_config_is_rejected() {
        let (approvals, _rx) = QueueApprovals::new();
        let collaborators = Collaborators::new(
            Arc::new(ScriptedVendor::honest()),
            Arc::new(InMemoryStore::new()),
            Arc::new(ScriptedReasoning::default()),
            Arc::new(ScriptedExecutor::default()),
            Arc::new(approvals),
        );
        let config = CommanderConfig::default().with_confidence_threshold(2.0);
        assert!(matches!(
            Commander::new(config, collaborators),
            Err(MissionError::Config(_))
        ));
    }

    #[test]
    fn signature_collector_is_registered_by_default() {
        let commander = commander(CommanderConfig::default());
        assert!(commander
            .collectors
            .iter()
            .any(|c| c.kind() == EvidenceKind::SignatureScan));
    }

    #[tokio::test(start_paused = true)]
    async fn pre_cancelled_mission_aborts_with_final_entry() {
        let commander = commander(CommanderConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = commander
            .run(Alert::new("etl", "ERROR_X", "boom"), cancel)
            .await;
        assert_eq!(report.outcome, Outcome::Aborted);

        let record = commander.archive().get(report.mission_id).unwrap();
        let last = record.audit.last().unwrap();
        assert_eq!(last.kind, AuditKind::Outcome);
        assert_eq!(record.mission.stage, Stage::Closed);
        assert!(commander.stage_of(report.mission_id).is_none());
    }
}
