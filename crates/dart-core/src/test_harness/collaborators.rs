//! Scripted collaborators
//!
//! Deterministic stand-ins for every external boundary. Each one records how
//! often it was called so tests can assert on retries and fan-out.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dart_kernel::types::ProposalId;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::CollaboratorError;
use crate::evidence::{EvidenceCollector, MissionContext};
use crate::gate::{ApprovalChannel, ApprovalRequest};
use crate::memory::{IncidentSummary, MemoryMatch, MemoryStore};
use crate::reasoning::{
    ActionExecutor, ActionReceipt, DiagnosisRequest, ReasoningService, RemediationRequest,
};
use crate::types::{Diagnosis, DiagnosisSource, Evidence, EvidenceKind, RemediationProposal, VendorStatus};
use crate::vendor::{HealthReport, VendorEndpoint};

/// Queued answers, then a repeating fallback
#[derive(Debug, Clone)]
struct Script<T> {
    queued: VecDeque<Result<T, CollaboratorError>>,
    fallback: Result<T, CollaboratorError>,
}

impl<T: Clone> Script<T> {
    fn new(fallback: Result<T, CollaboratorError>) -> Self {
        Self {
            queued: VecDeque::new(),
            fallback,
        }
    }

    fn next(&mut self) -> Result<T, CollaboratorError> {
        self.queued.pop_front().unwrap_or_else(|| self.fallback.clone())
    }
}

#[derive(Debug, Clone)]
enum CollectorMode {
    Returns(Vec<(String, f64)>),
    Hangs,
    Unavailable(String),
}

/// Evidence collector with a fixed behavior
#[derive(Debug)]
pub struct ScriptedCollector {
    kind: EvidenceKind,
    mode: CollectorMode,
    latency: Duration,
    calls: AtomicU32,
}

impl ScriptedCollector {
    /// Returns one item per `(summary, failure_signal)` on every fetch
    #[must_use]
    pub fn returning<S: Into<String>>(kind: EvidenceKind, items: impl IntoIterator<Item = (S, f64)>) -> Self {
        Self::with_mode(
            kind,
            CollectorMode::Returns(items.into_iter().map(|(s, f)| (s.into(), f)).collect()),
        )
    }

    /// Never answers; the fan-out timeout cuts it off
    #[must_use]
    pub fn hanging(kind: EvidenceKind) -> Self {
        Self::with_mode(kind, CollectorMode::Hangs)
    }

    /// Fails every fetch
    #[must_use]
    pub fn unavailable(kind: EvidenceKind, reason: impl Into<String>) -> Self {
        Self::with_mode(kind, CollectorMode::Unavailable(reason.into()))
    }

    fn with_mode(kind: EvidenceKind, mode: CollectorMode) -> Self {
        Self {
            kind,
            mode,
            latency: Duration::ZERO,
            calls: AtomicU32::new(0),
        }
    }

    /// Delay before answering
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EvidenceCollector for ScriptedCollector {
    fn kind(&self) -> EvidenceKind {
        self.kind
    }

    async fn fetch(&self, ctx: &MissionContext) -> Result<Vec<Evidence>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match &self.mode {
            CollectorMode::Returns(items) => Ok(items
                .iter()
                .enumerate()
                .map(|(i, (summary, signal))| {
                    Evidence::new(
                        self.kind,
                        format!("{}://{}/{}/{i}", self.kind, ctx.mission_id, ctx.loop_count),
                        summary.clone(),
                    )
                    .with_failure_signal(*signal)
                })
                .collect()),
            CollectorMode::Hangs => {
                std::future::pending::<()>().await;
                Ok(Vec::new())
            }
            CollectorMode::Unavailable(reason) => Err(CollaboratorError::Unavailable(reason.clone())),
        }
    }
}

/// One scripted vendor answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VendorReply {
    Reports(VendorStatus),
    Unavailable,
    Hangs,
}

/// Vendor endpoint with a scripted sequence of answers
#[derive(Debug)]
pub struct ScriptedVendor {
    queued: Mutex<VecDeque<VendorReply>>,
    fallback: VendorReply,
    calls: AtomicU32,
}

impl ScriptedVendor {
    /// Always answers with `status`
    #[must_use]
    pub fn reporting(status: VendorStatus) -> Self {
        Self::scripted([], VendorReply::Reports(status))
    }

    /// Admits the degradation the evidence shows
    #[must_use]
    pub fn honest() -> Self {
        Self::reporting(VendorStatus::Degraded)
    }

    /// Claims health regardless of evidence
    #[must_use]
    pub fn lying() -> Self {
        Self::reporting(VendorStatus::Healthy)
    }

    /// Fails every call
    #[must_use]
    pub fn outage() -> Self {
        Self::scripted([], VendorReply::Unavailable)
    }

    /// Fails `failures` times, then reports `status`
    #[must_use]
    pub fn flaky(failures: usize, status: VendorStatus) -> Self {
        Self::scripted(
            std::iter::repeat(VendorReply::Unavailable).take(failures),
            VendorReply::Reports(status),
        )
    }

    /// Queued replies followed by `fallback` forever
    #[must_use]
    pub fn scripted(replies: impl IntoIterator<Item = VendorReply>, fallback: VendorReply) -> Self {
        Self {
            queued: Mutex::new(replies.into_iter().collect()),
            fallback,
            calls: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VendorEndpoint for ScriptedVendor {
    async fn check_health(&self, target: &str) -> Result<HealthReport, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.queued.lock().pop_front().unwrap_or(self.fallback);
        match reply {
            VendorReply::Reports(status) => Ok(HealthReport {
                status,
                timestamp: Utc::now(),
                message: format!("{target}: {status}"),
            }),
            VendorReply::Unavailable => Err(CollaboratorError::unavailable("vendor endpoint refused connection")),
            VendorReply::Hangs => {
                std::future::pending::<()>().await;
                Err(CollaboratorError::unavailable("unreachable"))
            }
        }
    }
}

/// Reasoning service answering from scripts
#[derive(Debug)]
pub struct ScriptedReasoning {
    diagnoses: Mutex<Script<Diagnosis>>,
    proposals: Mutex<Script<RemediationProposal>>,
    diagnose_calls: AtomicU32,
    proposal_calls: AtomicU32,
    denied_seen: Mutex<Vec<usize>>,
}

impl Default for ScriptedReasoning {
    fn default() -> Self {
        Self::new(
            Ok(Diagnosis {
                root_cause: "unclassified pipeline failure".into(),
                confidence_hint: 0.8,
                source: DiagnosisSource::Reasoning,
            }),
            Ok(RemediationProposal::new("SELECT 1", "noop")),
        )
    }
}

impl ScriptedReasoning {
    fn new(
        diagnosis: Result<Diagnosis, CollaboratorError>,
        proposal: Result<RemediationProposal, CollaboratorError>,
    ) -> Self {
        Self {
            diagnoses: Mutex::new(Script::new(diagnosis)),
            proposals: Mutex::new(Script::new(proposal)),
            diagnose_calls: AtomicU32::new(0),
            proposal_calls: AtomicU32::new(0),
            denied_seen: Mutex::new(Vec::new()),
        }
    }

    /// Every call fails with `Unavailable`
    #[must_use]
    pub fn unavailable() -> Self {
        let err = CollaboratorError::unavailable("reasoning service overloaded");
        Self::new(Err(err.clone()), Err(err))
    }

    /// Diagnosis returned once the queue is drained
    #[must_use]
    pub fn with_diagnosis(self, root_cause: impl Into<String>, confidence_hint: f64) -> Self {
        self.diagnoses.lock().fallback = Ok(Diagnosis {
            root_cause: root_cause.into(),
            confidence_hint,
            source: DiagnosisSource::Reasoning,
        });
        self
    }

    /// Proposal returned once the queue is drained
    #[must_use]
    pub fn with_proposal(self, proposal: RemediationProposal) -> Self {
        self.proposals.lock().fallback = Ok(proposal);
        self
    }

    /// Queue a proposal ahead of the fallback
    #[must_use]
    pub fn then_proposal(self, proposal: RemediationProposal) -> Self {
        self.proposals.lock().queued.push_back(Ok(proposal));
        self
    }

    /// Queue `count` diagnosis failures ahead of the fallback
    #[must_use]
    pub fn failing_diagnoses(self, count: usize) -> Self {
        let mut script = self.diagnoses.lock();
        for _ in 0..count {
            script
                .queued
                .push_back(Err(CollaboratorError::unavailable("reasoning service overloaded")));
        }
        drop(script);
        self
    }

    #[must_use]
    pub fn diagnose_calls(&self) -> u32 {
        self.diagnose_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn proposal_calls(&self) -> u32 {
        self.proposal_calls.load(Ordering::SeqCst)
    }

    /// Length of the denied list seen by each proposal request
    #[must_use]
    pub fn denied_seen(&self) -> Vec<usize> {
        self.denied_seen.lock().clone()
    }
}

#[async_trait]
impl ReasoningService for ScriptedReasoning {
    async fn diagnose(&self, _request: &DiagnosisRequest) -> Result<Diagnosis, CollaboratorError> {
        self.diagnose_calls.fetch_add(1, Ordering::SeqCst);
        self.diagnoses.lock().next()
    }

    async fn propose_remediation(
        &self,
        request: &RemediationRequest,
    ) -> Result<RemediationProposal, CollaboratorError> {
        self.proposal_calls.fetch_add(1, Ordering::SeqCst);
        self.denied_seen.lock().push(request.denied.len());
        let mut proposal = self.proposals.lock().next()?;
        proposal.id = ProposalId::new();
        Ok(proposal)
    }
}

/// Executor that records every proposal it runs
#[derive(Debug)]
pub struct ScriptedExecutor {
    receipts: Mutex<Script<ActionReceipt>>,
    executed: Mutex<Vec<RemediationProposal>>,
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self {
            receipts: Mutex::new(Script::new(Ok(ActionReceipt::verified("applied")))),
            executed: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedExecutor {
    /// Fails the first `count` executions
    #[must_use]
    pub fn failing_first(count: usize) -> Self {
        let executor = Self::default();
        {
            let mut receipts = executor.receipts.lock();
            for _ in 0..count {
                receipts
                    .queued
                    .push_back(Err(CollaboratorError::unavailable("deploy target rejected the change")));
            }
        }
        executor
    }

    /// Reports success but the post-action check fails
    #[must_use]
    pub fn ineffective() -> Self {
        let executor = Self::default();
        executor.receipts.lock().fallback = Ok(ActionReceipt {
            detail: "applied, alert still firing".into(),
            verified: Some(false),
        });
        executor
    }

    /// Proposals executed so far, in order
    #[must_use]
    pub fn executed(&self) -> Vec<RemediationProposal> {
        self.executed.lock().clone()
    }
}

#[async_trait]
impl ActionExecutor for ScriptedExecutor {
    async fn execute(&self, proposal: &RemediationProposal) -> Result<ActionReceipt, CollaboratorError> {
        self.executed.lock().push(proposal.clone());
        let receipt = self.receipts.lock().next()?;
        Ok(ActionReceipt {
            detail: format!("{} ({})", receipt.detail, proposal.fix_type),
            ..receipt
        })
    }
}

/// Approval channel that forwards requests to a test-owned receiver
#[derive(Debug, Clone)]
pub struct QueueApprovals {
    tx: mpsc::UnboundedSender<ApprovalRequest>,
}

impl QueueApprovals {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ApprovalRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ApprovalChannel for QueueApprovals {
    async fn request_approval(&self, request: ApprovalRequest) -> Result<(), CollaboratorError> {
        self.tx
            .send(request)
            .map_err(|_| CollaboratorError::unavailable("approval channel closed"))
    }
}

/// Memory store that is always down
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineMemory;

#[async_trait]
impl MemoryStore for OfflineMemory {
    async fn query(&self, _signature: &str, _top_k: usize) -> Result<Vec<MemoryMatch>, CollaboratorError> {
        Err(CollaboratorError::unavailable("memory store offline"))
    }

    async fn store(&self, _summary: IncidentSummary) -> Result<(), CollaboratorError> {
        Err(CollaboratorError::unavailable("memory store offline"))
    }
}
