//! Long-term incident memory
//!
//! - `MemoryStore` trait (similarity search + persistence)
//! - `MemoryLookup`: bounded query used by the Observing phase
//! - `InMemoryStore`: token-hash embeddings with cosine similarity

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dart_kernel::types::MissionId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CollaboratorError;
use crate::types::{ProposalOrigin, RemediationProposal, VendorStatus};

/// Persisted summary of a resolved incident
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentSummary {
    pub incident_id: MissionId,
    pub signature: String,
    pub root_cause: String,
    pub fix_type: String,
    pub fix_action: String,
    #[serde(default)]
    pub rollback: String,
    #[serde(default)]
    pub embedding: Vec<f32>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub evidence_digest: String,
    pub vendor_verdict: VendorStatus,
}

/// One similarity hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryMatch {
    /// In `[0, 1]`
    pub similarity: f64,
    pub summary: IncidentSummary,
}

impl MemoryMatch {
    /// The recalled fix as a fresh proposal
    #[must_use]
    pub fn recalled_proposal(&self) -> RemediationProposal {
        RemediationProposal::new(self.summary.fix_action.clone(), self.summary.fix_type.clone())
            .with_impact(format!("recalled fix for: {}", self.summary.root_cause))
            .with_rollback(self.summary.rollback.clone())
            .with_origin(ProposalOrigin::Memory)
    }
}

/// Similarity search over past incidents
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Best `top_k` matches, most similar first
    async fn query(&self, signature: &str, top_k: usize) -> Result<Vec<MemoryMatch>, CollaboratorError>;

    /// Persist a summary
    async fn store(&self, summary: IncidentSummary) -> Result<(), CollaboratorError>;
}

/// Result of a bounded lookup
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryOutcome {
    /// Best match at or above the hint threshold
    Hit(MemoryMatch),
    /// Nothing similar enough
    Miss { best_similarity: Option<f64> },
    /// Store failed or timed out
    Unavailable(String),
}

impl MemoryOutcome {
    #[must_use]
    pub fn hit(&self) -> Option<&MemoryMatch> {
        match self {
            MemoryOutcome::Hit(m) => Some(m),
            _ => None,
        }
    }
}

/// Bounded memory query
#[derive(Clone)]
pub struct MemoryLookup {
    store: Arc<dyn MemoryStore>,
    top_k: usize,
    timeout: Duration,
    hint_threshold: f64,
}

impl std::fmt::Debug for MemoryLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLookup")
            .field("top_k", &self.top_k)
            .field("timeout", &self.timeout)
            .field("hint_threshold", &self.hint_threshold)
            .finish_non_exhaustive()
    }
}

impl MemoryLookup {
    #[must_use]
    pub fn new(store: Arc<dyn MemoryStore>, top_k: usize, timeout: Duration, hint_threshold: f64) -> Self {
        Self {
            store,
            top_k: top_k.max(1),
            timeout,
            hint_threshold,
        }
    }

    /// Underlying store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn MemoryStore> {
        &self.store
    }

    /// Query with a timeout; failures become `Unavailable`
    pub async fn lookup(&self, signature: &str) -> MemoryOutcome {
        let matches = match tokio::time::timeout(self.timeout, self.store.query(signature, self.top_k)).await {
            Ok(Ok(matches)) => matches,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "memory query failed");
                return MemoryOutcome::Unavailable(err.to_string());
            }
            Err(_) => {
                tracing::warn!(timeout_ms = self.timeout.as_millis() as u64, "memory query timed out");
                return MemoryOutcome::Unavailable(format!("timed out after {:?}", self.timeout));
            }
        };

        let best = matches
            .into_iter()
            .max_by(|a, b| a.similarity.total_cmp(&b.similarity));
        match best {
            Some(best) if best.similarity >= self.hint_threshold => {
                tracing::info!(similarity = best.similarity, incident = %best.summary.incident_id, "memory hit");
                MemoryOutcome::Hit(best)
            }
            best => MemoryOutcome::Miss {
                best_similarity: best.map(|m| m.similarity),
            },
        }
    }
}

const EMBEDDING_DIM: usize = 64;

/// Signed token-hash embedding, L2-normalized
#[must_use]
pub fn embed(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; EMBEDDING_DIM];
    for token in text
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
    {
        let digest = Sha256::digest(token.to_lowercase().as_bytes());
        let bucket = usize::from(u16::from_le_bytes([digest[0], digest[1]])) % EMBEDDING_DIM;
        let sign = if digest[2] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign;
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

/// Cosine similarity of two normalized vectors, clamped to `[0, 1]`
#[must_use]
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    f64::from(dot).clamp(0.0, 1.0)
}

/// Process-local memory store
#[derive(Debug, Default)]
pub struct InMemoryStore {
    incidents: RwLock<Vec<IncidentSummary>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store preloaded with past incidents
    #[must_use]
    pub fn with_incidents(incidents: impl IntoIterator<Item = IncidentSummary>) -> Self {
        let store = Self::new();
        for incident in incidents {
            store.insert(incident);
        }
        store
    }

    fn insert(&self, mut summary: IncidentSummary) {
        if summary.embedding.len() != EMBEDDING_DIM {
            summary.embedding = embed(&summary.signature);
        }
        self.incidents.write().push(summary);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.incidents.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.incidents.read().is_empty()
    }

    /// Snapshot of stored incidents
    #[must_use]
    pub fn incidents(&self) -> Vec<IncidentSummary> {
        self.incidents.read().clone()
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn query(&self, signature: &str, top_k: usize) -> Result<Vec<MemoryMatch>, CollaboratorError> {
        let query = embed(signature);
        let mut matches: Vec<MemoryMatch> = self
            .incidents
            .read()
            .iter()
            .map(|summary| MemoryMatch {
                similarity: cosine(&query, &summary.embedding),
                summary: summary.clone(),
            })
            .collect();
        matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn store(&self, summary: IncidentSummary) -> Result<(), CollaboratorError> {
        self.insert(summary);
        Ok(())
    }
}
