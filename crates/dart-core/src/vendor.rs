//! Vendor liaison
//!
//! Probes the vendor health endpoint under backoff and checks the claim against the
//! evidence. A vendor may be flaky (transient failures) or dishonest (claims healthy
//! while failing); both are tolerated.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dart_kernel::backoff::{AttemptHistory, BackoffError, BackoffPolicy};
use dart_kernel::types::SignalId;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::CollaboratorError;
use crate::types::{Conflict, ConflictKind, EvidenceSet, VendorSignal, VendorStatus};

/// Vendor answer to a health check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: VendorStatus,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Request/response transport to the vendor
#[async_trait]
pub trait VendorEndpoint: Send + Sync {
    async fn check_health(&self, target: &str) -> Result<HealthReport, CollaboratorError>;
}

/// Probe result plus the attempts behind it
#[derive(Debug, Clone)]
pub struct VendorProbe {
    pub signal: VendorSignal,
    pub history: AttemptHistory,
    /// Probe stopped by the mission cancellation token
    pub cancelled: bool,
}

/// Probes and reconciles vendor claims
#[derive(Clone)]
pub struct VendorLiaison {
    endpoint: Arc<dyn VendorEndpoint>,
    policy: BackoffPolicy,
    attempt_timeout: Duration,
    conflict_floor: f64,
    deception_threshold: f64,
}

impl std::fmt::Debug for VendorLiaison {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VendorLiaison")
            .field("policy", &self.policy)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("conflict_floor", &self.conflict_floor)
            .field("deception_threshold", &self.deception_threshold)
            .finish_non_exhaustive()
    }
}

impl VendorLiaison {
    /// Liaison with 3 attempts, 1s base delay, 25% jitter
    #[must_use]
    pub fn new(endpoint: Arc<dyn VendorEndpoint>) -> Self {
        Self {
            endpoint,
            policy: BackoffPolicy::default(),
            attempt_timeout: Duration::from_secs(5),
            conflict_floor: 0.5,
            deception_threshold: 0.6,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_thresholds(mut self, conflict_floor: f64, deception_threshold: f64) -> Self {
        self.conflict_floor = conflict_floor;
        self.deception_threshold = deception_threshold;
        self
    }

    /// Check vendor health; exhaustion yields an `Unknown` signal
    #[tracing::instrument(skip(self, cancel))]
    pub async fn probe(&self, target: &str, cancel: &CancellationToken) -> VendorProbe {
        let started = Instant::now();
        let endpoint = &self.endpoint;
        let timeout = self.attempt_timeout;

        let result = self
            .policy
            .execute(cancel, |_attempt| async move {
                match tokio::time::timeout(timeout, endpoint.check_health(target)).await {
                    Ok(result) => result,
                    Err(_) => Err(CollaboratorError::Timeout {
                        after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    }),
                }
            })
            .await;
        let latency = started.elapsed();

        match result {
            Ok(retried) => {
                let attempts = u32::try_from(retried.history.len()).unwrap_or(u32::MAX);
                let report = retried.value;
                tracing::info!(status = %report.status, attempts, "vendor answered");
                VendorProbe {
                    signal: VendorSignal {
                        id: SignalId::new(),
                        status: report.status,
                        attempts,
                        latency,
                        raw_response: Some(report.message),
                        observed_at: report.timestamp,
                    },
                    history: retried.history,
                    cancelled: false,
                }
            }
            Err(err) => {
                let cancelled = err.is_cancelled();
                let history = match err {
                    BackoffError::Exhausted { history, last_error, .. } => {
                        tracing::warn!(error = %last_error, "vendor unreachable; treating as unknown");
                        history
                    }
                    BackoffError::Cancelled { history } => history,
                };
                let attempts = u32::try_from(history.len()).unwrap_or(u32::MAX);
                VendorProbe {
                    signal: VendorSignal::unknown(attempts, latency),
                    history,
                    cancelled,
                }
            }
        }
    }

    /// Compare the vendor claim with the evidence-derived failure likelihood
    #[must_use]
    pub fn reconcile(&self, signal: &VendorSignal, evidence: &EvidenceSet) -> Option<Conflict> {
        let likelihood = evidence.failure_likelihood();
        match signal.status {
            VendorStatus::Healthy if likelihood >= self.conflict_floor => {
                let severity = likelihood;
                let deception = severity > self.deception_threshold;
                Some(Conflict {
                    kind: ConflictKind::HealthyClaimContradicted,
                    severity,
                    confidence_delta: if deception { 0.0 } else { -severity / 2.0 },
                    evidence_ids: evidence.failing_ids(),
                    signal_id: signal.id,
                    deception,
                })
            }
            VendorStatus::Degraded
                if !evidence.is_empty() && likelihood < 1.0 - self.conflict_floor =>
            {
                let severity = (1.0 - likelihood) / 2.0;
                Some(Conflict {
                    kind: ConflictKind::DegradedClaimUnsupported,
                    severity,
                    confidence_delta: -severity,
                    evidence_ids: evidence.items().iter().map(|e| e.id).collect(),
                    signal_id: signal.id,
                    deception: false,
                })
            }
            _ => None,
        }
    }
}

/// HTTP adapter for the vendor bot's `POST /a2a/echo` protocol
#[derive(Debug, Clone)]
pub struct HttpVendorEndpoint {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct EchoRequest<'a> {
    request_id: String,
    query: &'static str,
    target: &'a str,
}

#[derive(Debug, Deserialize)]
struct EchoResponse {
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

impl HttpVendorEndpoint {
    /// Endpoint rooted at `base_url` with a per-request timeout
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, CollaboratorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CollaboratorError::unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Parse an echo response body
    pub fn parse_response(body: &str) -> Result<HealthReport, CollaboratorError> {
        let response: EchoResponse = serde_json::from_str(body)
            .map_err(|e| CollaboratorError::InvalidResponse(e.to_string()))?;
        let status = match response.status.to_ascii_uppercase().as_str() {
            "HEALTHY" | "OK" => VendorStatus::Healthy,
            "DEGRADED" | "OUTAGE" | "DOWN" => VendorStatus::Degraded,
            _ => VendorStatus::Unknown,
        };
        Ok(HealthReport {
            status,
            timestamp: response.timestamp.unwrap_or_else(Utc::now),
            message: response.message,
        })
    }
}

#[async_trait]
impl VendorEndpoint for HttpVendorEndpoint {
    async fn check_health(&self, target: &str) -> Result<HealthReport, CollaboratorError> {
        let request = EchoRequest {
            request_id: ulid::Ulid::new().to_string(),
            query: "STATUS_CHECK",
            target,
        };
        let response = self
            .client
            .post(format!("{}/a2a/echo", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CollaboratorError::Timeout { after_ms: 0 }
                } else {
                    CollaboratorError::unavailable(e.to_string())
                }
            })?
            .error_for_status()
            .map_err(|e| CollaboratorError::unavailable(e.to_string()))?;
        let body = response
            .text()
            .await
            .map_err(|e| CollaboratorError::unavailable(e.to_string()))?;
        Self::parse_response(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Evidence, EvidenceKind};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        status: VendorStatus,
    }

    #[async_trait]
    impl VendorEndpoint for Flaky {
        async fn check_health(&self, _target: &str) -> Result<HealthReport, CollaboratorError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(CollaboratorError::unavailable("503 Simulated Network Flakiness"));
            }
            Ok(HealthReport {
                status: self.status,
                timestamp: Utc::now(),
                message: "All systems operational".into(),
            })
        }
    }

    fn liaison(failures: u32, status: VendorStatus) -> VendorLiaison {
        VendorLiaison::new(Arc::new(Flaky {
            failures,
            calls: AtomicU32::new(0),
            status,
        }))
        .with_policy(BackoffPolicy::new(3, Duration::from_secs(1), 0.0))
    }

    fn failing_evidence(signals: &[f64]) -> EvidenceSet {
        let mut set = EvidenceSet::new();
        set.extend(signals.iter().map(|s| {
            Evidence::new(EvidenceKind::Logs, "logs://", "503 from upstream").with_failure_signal(*s)
        }));
        set
    }

    #[tokio::test(start_paused = true)]
    async fn flaky_first_request_recovers() {
        let probe = liaison(1, VendorStatus::Healthy)
            .probe("payments", &CancellationToken::new())
            .await;
        assert_eq!(probe.signal.status, VendorStatus::Healthy);
        assert_eq!(probe.signal.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn outage_yields_unknown() {
        let probe = liaison(10, VendorStatus::Healthy)
            .probe("payments", &CancellationToken::new())
            .await;
        assert_eq!(probe.signal.status, VendorStatus::Unknown);
        assert_eq!(probe.signal.attempts, 3);
        assert!(!probe.cancelled);
    }

    #[test]
    fn healthy_claim_against_failing_evidence_is_deception() {
        let liaison = liaison(0, VendorStatus::Healthy);
        let signal = VendorSignal {
            status: VendorStatus::Healthy,
            ..VendorSignal::unknown(1, Duration::ZERO)
        };
        let conflict = liaison
            .reconcile(&signal, &failing_evidence(&[0.8, 0.8, 0.8]))
            .unwrap();
        assert_eq!(conflict.kind, ConflictKind::HealthyClaimContradicted);
        assert!(conflict.deception);
        assert!((conflict.severity - 0.992).abs() < 1e-9);
        assert_eq!(conflict.evidence_ids.len(), 3);
    }

    #[test]
    fn mild_evidence_is_a_conflict_without_deception() {
        let liaison = liaison(0, VendorStatus::Healthy);
        let signal = VendorSignal {
            status: VendorStatus::Healthy,
            ..VendorSignal::unknown(1, Duration::ZERO)
        };
        let conflict = liaison.reconcile(&signal, &failing_evidence(&[0.55])).unwrap();
        assert!(!conflict.deception);
        assert!(conflict.confidence_delta < 0.0);
        assert!(liaison.reconcile(&signal, &failing_evidence(&[0.2])).is_none());
    }

    #[test]
    fn degraded_claim_with_clean_evidence() {
        let liaison = liaison(0, VendorStatus::Degraded);
        let signal = VendorSignal {
            status: VendorStatus::Degraded,
            ..VendorSignal::unknown(1, Duration::ZERO)
        };
        let conflict = liaison.reconcile(&signal, &failing_evidence(&[0.0])).unwrap();
        assert_eq!(conflict.kind, ConflictKind::DegradedClaimUnsupported);
        assert!((conflict.severity - 0.5).abs() < 1e-9);
        assert!(!conflict.deception);
        // absence of evidence is not clean evidence
        assert!(liaison.reconcile(&signal, &EvidenceSet::new()).is_none());
    }

    #[test]
    fn unknown_signal_never_conflicts() {
        let liaison = liaison(0, VendorStatus::Healthy);
        let signal = VendorSignal::unknown(3, Duration::ZERO);
        assert!(liaison.reconcile(&signal, &failing_evidence(&[1.0])).is_none());
    }

    #[test]
    fn parses_echo_payload() {
        let report = HttpVendorEndpoint::parse_response(
            r#"{"request_id":"r1","status":"HEALTHY","message":"All systems operational"}"#,
        )
        .unwrap();
        assert_eq!(report.status, VendorStatus::Healthy);

        let report = HttpVendorEndpoint::parse_response(r#"{"status":"OUTAGE"}"#).unwrap();
        assert_eq!(report.status, VendorStatus::Degraded);

        assert!(matches!(
            HttpVendorEndpoint::parse_response("not json"),
            Err(CollaboratorError::InvalidResponse(_))
        ));
    }
}
