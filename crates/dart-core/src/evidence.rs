//! Evidence collectors
//!
//! - `EvidenceCollector` trait over the fixed set of evidence kinds
//! - Concurrent fan-out with a per-collector timeout
//! - Deterministic regex `SignatureScanner` and the collector built on it
//!
//! A collector that times out or reports `Unavailable` becomes a warning,
//! never a mission failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dart_kernel::types::MissionId;
use futures::future::join_all;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::CollaboratorError;
use crate::types::{Alert, Evidence, EvidenceKind};

/// What a collector sees of the mission
#[derive(Debug, Clone)]
pub struct MissionContext {
    pub mission_id: MissionId,
    pub alert: Alert,
    /// Loops consumed before this observation
    pub loop_count: u32,
    /// Evidence kinds requested for this observation
    pub scope: Vec<EvidenceKind>,
}

/// Diagnostic fetcher for one evidence kind
#[async_trait]
pub trait EvidenceCollector: Send + Sync {
    /// Kind this collector produces
    fn kind(&self) -> EvidenceKind;

    /// Fetch zero or more evidence items; the caller applies the timeout
    async fn fetch(&self, ctx: &MissionContext) -> Result<Vec<Evidence>, CollaboratorError>;
}

/// Why a collector contributed nothing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "failure", rename_all = "snake_case")]
pub enum CollectorFailure {
    Timeout { after_ms: u64 },
    Unavailable { reason: String },
}

/// Partial-evidence warning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorWarning {
    pub kind: EvidenceKind,
    pub failure: CollectorFailure,
}

impl std::fmt::Display for CollectorWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.failure {
            CollectorFailure::Timeout { after_ms } => {
                write!(f, "{} collector timed out after {after_ms}ms", self.kind)
            }
            CollectorFailure::Unavailable { reason } => {
                write!(f, "{} collector unavailable: {reason}", self.kind)
            }
        }
    }
}

/// Joined result of one fan-out
#[derive(Debug, Clone, Default)]
pub struct FanoutOutcome {
    pub evidence: Vec<Evidence>,
    pub warnings: Vec<CollectorWarning>,
    /// Collectors launched
    pub attempted: usize,
}

/// Run every collector whose kind is in `ctx.scope`, concurrently, each under `timeout`
pub async fn fan_out(
    collectors: &[Arc<dyn EvidenceCollector>],
    ctx: &MissionContext,
    timeout: Duration,
) -> FanoutOutcome {
    let selected: Vec<_> = collectors
        .iter()
        .filter(|c| ctx.scope.contains(&c.kind()))
        .collect();

    let results = join_all(selected.iter().map(|collector| async move {
        let kind = collector.kind();
        let result = tokio::time::timeout(timeout, collector.fetch(ctx)).await;
        (kind, result)
    }))
    .await;

    let mut outcome = FanoutOutcome {
        attempted: selected.len(),
        ..FanoutOutcome::default()
    };
    for (kind, result) in results {
        match result {
            Ok(Ok(mut items)) => {
                // collectors may not lie about their kind
                items.retain(|e| e.kind == kind);
                tracing::debug!(mission_id = %ctx.mission_id, %kind, count = items.len(), "collector returned");
                outcome.evidence.extend(items);
            }
            Ok(Err(err)) => {
                let failure = match err {
                    CollaboratorError::Timeout { after_ms } => CollectorFailure::Timeout { after_ms },
                    other => CollectorFailure::Unavailable {
                        reason: other.to_string(),
                    },
                };
                tracing::warn!(mission_id = %ctx.mission_id, %kind, "collector failed");
                outcome.warnings.push(CollectorWarning { kind, failure });
            }
            Err(_) => {
                let after_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(mission_id = %ctx.mission_id, %kind, after_ms, "collector timed out");
                outcome.warnings.push(CollectorWarning {
                    kind,
                    failure: CollectorFailure::Timeout { after_ms },
                });
            }
        }
    }
    outcome
}

/// One deterministic signature rule
#[derive(Debug, Clone)]
pub struct SignatureRule {
    pub name: String,
    pattern: Regex,
    /// Root cause to report on match
    pub diagnosis: String,
    /// How much a match can be trusted, in `[0, 1]`
    pub confidence: f64,
    /// Failure signal attached to matching evidence
    pub failure_signal: f64,
}

impl SignatureRule {
    /// Compile a case-insensitive rule
    pub fn new(
        name: impl Into<String>,
        pattern: &str,
        diagnosis: impl Into<String>,
        confidence: f64,
        failure_signal: f64,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.into(),
            pattern: RegexBuilder::new(pattern).case_insensitive(true).build()?,
            diagnosis: diagnosis.into(),
            confidence: crate::types::clamp_unit(confidence),
            failure_signal: crate::types::clamp_unit(failure_signal),
        })
    }
}

/// Rule hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureMatch {
    pub rule: String,
    pub diagnosis: String,
    pub confidence: f64,
    pub failure_signal: f64,
    /// Matched text (first capture group when present)
    pub matched: String,
}

/// Ordered rule set; the first matching rule wins
#[derive(Debug, Clone)]
pub struct SignatureScanner {
    rules: Vec<SignatureRule>,
}

impl Default for SignatureScanner {
    fn default() -> Self {
        Self {
            rules: builtin_rules(),
        }
    }
}

fn builtin_rules() -> Vec<SignatureRule> {
    [
        (
            "division-by-zero",
            r"division by zero",
            "LOGIC_ERROR: DIVISION_BY_ZERO",
            0.92,
            0.9,
        ),
        (
            "column-missing",
            r"column.*(missing|does not exist)",
            "SCHEMA_ERROR: COLUMN_MISSING",
            0.9,
            0.85,
        ),
        (
            "upstream-unavailable",
            r"\b503\b|service unavailable",
            "UPSTREAM_ERROR: SERVICE_UNAVAILABLE",
            0.6,
            0.8,
        ),
        ("error-code", r"(ERROR_[A-Z0-9_]+)", "ERROR_CODE", 0.5, 0.5),
    ]
    .into_iter()
    .filter_map(|(name, pattern, diagnosis, confidence, signal)| {
        SignatureRule::new(name, pattern, diagnosis, confidence, signal).ok()
    })
    .collect()
}

impl SignatureScanner {
    /// Scanner with the built-in rules
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scanner with no rules
    #[must_use]
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Add a rule after the existing ones
    #[must_use]
    pub fn with_rule(mut self, rule: SignatureRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// First matching rule
    #[must_use]
    pub fn scan(&self, text: &str) -> Option<SignatureMatch> {
        self.rules.iter().find_map(|rule| {
            rule.pattern.captures(text).map(|caps| {
                let matched = caps
                    .get(1)
                    .or_else(|| caps.get(0))
                    .map_or_else(String::new, |m| m.as_str().to_string());
                let diagnosis = if rule.name == "error-code" {
                    format!("{}: {matched}", rule.diagnosis)
                } else {
                    rule.diagnosis.clone()
                };
                SignatureMatch {
                    rule: rule.name.clone(),
                    diagnosis,
                    confidence: rule.confidence,
                    failure_signal: rule.failure_signal,
                    matched,
                }
            })
        })
    }

    /// Scan the alert's signature and metadata values
    #[must_use]
    pub fn scan_alert(&self, alert: &Alert) -> Option<SignatureMatch> {
        self.scan(&alert_text(alert))
    }

    /// Mark evidence whose summary matches a rule; returns the hit
    pub fn tag(&self, evidence: &mut Evidence) -> Option<SignatureMatch> {
        let hit = self.scan(&evidence.summary)?;
        evidence.matches_known_signature = true;
        evidence.failure_signal = evidence.failure_signal.max(hit.failure_signal);
        Some(hit)
    }
}

fn alert_text(alert: &Alert) -> String {
    let mut text = alert.signature();
    for value in alert.metadata.values() {
        text.push('\n');
        text.push_str(value);
    }
    text
}

/// Collector that turns a signature hit on the alert into evidence
#[derive(Debug, Clone)]
pub struct SignatureScanCollector {
    scanner: Arc<SignatureScanner>,
}

impl SignatureScanCollector {
    #[must_use]
    pub fn new(scanner: Arc<SignatureScanner>) -> Self {
        Self { scanner }
    }
}

#[async_trait]
impl EvidenceCollector for SignatureScanCollector {
    fn kind(&self) -> EvidenceKind {
        EvidenceKind::SignatureScan
    }

    async fn fetch(&self, ctx: &MissionContext) -> Result<Vec<Evidence>, CollaboratorError> {
        Ok(self
            .scanner
            .scan_alert(&ctx.alert)
            .map(|hit| {
                Evidence::new(
                    EvidenceKind::SignatureScan,
                    format!("alert://{}", ctx.alert.id),
                    format!("{} ({})", hit.diagnosis, hit.rule),
                )
                .with_failure_signal(hit.failure_signal)
                .with_signature_match(true)
            })
            .into_iter()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(scope: Vec<EvidenceKind>) -> MissionContext {
        MissionContext {
            mission_id: MissionId::new(),
            alert: Alert::new("billing", "ERROR_COL_MISSING", "column region is missing"),
            loop_count: 0,
            scope,
        }
    }

    struct Stuck;

    #[async_trait]
    impl EvidenceCollector for Stuck {
        fn kind(&self) -> EvidenceKind {
            EvidenceKind::Schema
        }

        async fn fetch(&self, _ctx: &MissionContext) -> Result<Vec<Evidence>, CollaboratorError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
    }

    #[test]
    fn first_rule_wins() {
        let scanner = SignatureScanner::new();
        let hit = scanner.scan("ERROR_X: Division by zero in view").unwrap();
        assert_eq!(hit.rule, "division-by-zero");
        assert_eq!(hit.diagnosis, "LOGIC_ERROR: DIVISION_BY_ZERO");
    }

    #[test]
    fn error_code_is_captured() {
        let hit = SignatureScanner::new().scan("job failed with ERROR_QUOTA_7").unwrap();
        assert_eq!(hit.matched, "ERROR_QUOTA_7");
        assert_eq!(hit.diagnosis, "ERROR_CODE: ERROR_QUOTA_7");
        assert!(SignatureScanner::new().scan("all good").is_none());
    }

    #[test]
    fn tagging_raises_failure_signal() {
        let scanner = SignatureScanner::new();
        let mut evidence = Evidence::new(EvidenceKind::Logs, "logs://1", "HTTP 503 from vendor")
            .with_failure_signal(0.2);
        assert!(scanner.tag(&mut evidence).is_some());
        assert!(evidence.matches_known_signature);
        assert!((evidence.failure_signal - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn signature_collector_reads_alert() {
        let collector = SignatureScanCollector::new(Arc::new(SignatureScanner::new()));
        let evidence = collector.fetch(&ctx(vec![EvidenceKind::SignatureScan])).await.unwrap();
        assert_eq!(evidence.len(), 1);
        assert!(evidence[0].summary.starts_with("SCHEMA_ERROR: COLUMN_MISSING"));
    }

    #[tokio::test(start_paused = true)]
    async fn fan_out_turns_timeouts_into_warnings() {
        let collectors: Vec<Arc<dyn EvidenceCollector>> = vec![
            Arc::new(Stuck),
            Arc::new(SignatureScanCollector::new(Arc::new(SignatureScanner::new()))),
        ];
        let scope = vec![EvidenceKind::Schema, EvidenceKind::SignatureScan];
        let outcome = fan_out(&collectors, &ctx(scope), Duration::from_millis(50)).await;
        assert_eq!(outcome.attempted, 2);
        assert_eq!(outcome.evidence.len(), 1);
        assert_eq!(
            outcome.warnings,
            vec![CollectorWarning {
                kind: EvidenceKind::Schema,
                failure: CollectorFailure::Timeout { after_ms: 50 },
            }]
        );
    }

    #[tokio::test]
    async fn fan_out_respects_scope() {
        let collectors: Vec<Arc<dyn EvidenceCollector>> = vec![Arc::new(Stuck)];
        let outcome = fan_out(&collectors, &ctx(vec![EvidenceKind::Logs]), Duration::from_millis(1)).await;
        assert_eq!(outcome.attempted, 0);
    }
}
