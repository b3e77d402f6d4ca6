//! Commander configuration
//!
//! Thresholds, timeouts and retry policies are tunable rather than fixed. Files are
//! loaded as TOML or YAML depending on their extension; missing fields take defaults.

use std::path::Path;
use std::time::Duration;

use dart_kernel::backoff::BackoffPolicy;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::EvidenceKind;

/// Retry policy as configured
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub jitter_fraction: f64,
    /// Fixed jitter seed
    pub seed: Option<u64>,
}

impl RetryConfig {
    /// Build the runtime policy
    #[must_use]
    pub fn policy(&self) -> BackoffPolicy {
        let policy = BackoffPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            self.jitter_fraction,
        );
        match self.seed {
            Some(seed) => policy.with_seed(seed),
            None => policy,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            jitter_fraction: 0.25,
            seed: None,
        }
    }
}

/// Extra risk keywords layered over the built-in taxonomy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskRulesConfig {
    /// Case-insensitive phrases classified high risk
    pub high: Vec<String>,
    /// Case-insensitive phrases classified low risk
    pub low: Vec<String>,
}

/// Commander configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommanderConfig {
    /// Mission-level loop budget
    pub max_loops: u32,
    /// Combined confidence needed to act
    pub confidence_threshold: f64,
    /// Memory similarity that allows zero-step resolution
    pub fast_track_similarity: f64,
    /// Memory similarity that counts as a confidence hint
    pub memory_hint_similarity: f64,
    /// Rule confidence that lets a signature replace a `diagnose` call
    pub signature_confidence: f64,
    /// Healthy-claim conflict severity above which the vendor is judged to be lying
    pub deception_threshold: f64,
    /// Failure likelihood at which a healthy claim becomes a conflict
    pub conflict_floor: f64,
    /// Memory matches requested per lookup
    pub memory_top_k: usize,
    /// Lines kept in the evidence digest
    pub digest_lines: usize,

    pub collector_timeout_ms: u64,
    pub vendor_timeout_ms: u64,
    pub memory_timeout_ms: u64,
    pub reasoning_timeout_ms: u64,
    pub action_timeout_ms: u64,
    /// Unbounded approval wait when unset
    pub approval_timeout_ms: Option<u64>,

    pub vendor_retry: RetryConfig,
    pub reasoning_retry: RetryConfig,

    /// Evidence kinds fetched on the first loop; later loops fetch every kind
    pub initial_scope: Vec<EvidenceKind>,
    /// Target passed to the vendor health check
    pub vendor_target: String,
    pub risk_rules: RiskRulesConfig,
}

impl Default for CommanderConfig {
    fn default() -> Self {
        Self {
            max_loops: 3,
            confidence_threshold: 0.75,
            fast_track_similarity: 0.9,
            memory_hint_similarity: 0.7,
            signature_confidence: 0.85,
            deception_threshold: 0.6,
            conflict_floor: 0.5,
            memory_top_k: 3,
            digest_lines: 8,
            collector_timeout_ms: 5_000,
            vendor_timeout_ms: 15_000,
            memory_timeout_ms: 2_000,
            reasoning_timeout_ms: 30_000,
            action_timeout_ms: 30_000,
            approval_timeout_ms: None,
            vendor_retry: RetryConfig::default(),
            reasoning_retry: RetryConfig {
                base_delay_ms: 500,
                ..RetryConfig::default()
            },
            initial_scope: vec![EvidenceKind::Logs, EvidenceKind::SignatureScan],
            vendor_target: "vendor".to_string(),
            risk_rules: RiskRulesConfig::default(),
        }
    }
}

impl CommanderConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With loop budget
    #[inline]
    #[must_use]
    pub fn with_max_loops(mut self, max_loops: u32) -> Self {
        self.max_loops = max_loops;
        self
    }

    /// With confidence threshold
    #[inline]
    #[must_use]
    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    /// With approval escalation timeout
    #[inline]
    #[must_use]
    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout_ms = Some(duration_ms(timeout));
        self
    }

    /// With collector timeout
    #[inline]
    #[must_use]
    pub fn with_collector_timeout(mut self, timeout: Duration) -> Self {
        self.collector_timeout_ms = duration_ms(timeout);
        self
    }

    /// With initial evidence scope
    #[inline]
    #[must_use]
    pub fn with_initial_scope(mut self, scope: Vec<EvidenceKind>) -> Self {
        self.initial_scope = scope;
        self
    }

    /// With both retry policies
    #[inline]
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.vendor_retry = retry.clone();
        self.reasoning_retry = retry;
        self
    }

    #[must_use]
    pub fn collector_timeout(&self) -> Duration {
        Duration::from_millis(self.collector_timeout_ms)
    }

    #[must_use]
    pub fn vendor_timeout(&self) -> Duration {
        Duration::from_millis(self.vendor_timeout_ms)
    }

    #[must_use]
    pub fn memory_timeout(&self) -> Duration {
        Duration::from_millis(self.memory_timeout_ms)
    }

    #[must_use]
    pub fn reasoning_timeout(&self) -> Duration {
        Duration::from_millis(self.reasoning_timeout_ms)
    }

    #[must_use]
    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    #[must_use]
    pub fn approval_timeout(&self) -> Option<Duration> {
        self.approval_timeout_ms.map(Duration::from_millis)
    }

    /// Check ranges and orderings
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("confidence_threshold", self.confidence_threshold),
            ("fast_track_similarity", self.fast_track_similarity),
            ("memory_hint_similarity", self.memory_hint_similarity),
            ("signature_confidence", self.signature_confidence),
            ("deception_threshold", self.deception_threshold),
            ("conflict_floor", self.conflict_floor),
            ("vendor_retry.jitter_fraction", self.vendor_retry.jitter_fraction),
            ("reasoning_retry.jitter_fraction", self.reasoning_retry.jitter_fraction),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{value} is outside [0, 1]"),
                });
            }
        }
        if self.memory_hint_similarity > self.fast_track_similarity {
            return Err(ConfigError::Invalid {
                field: "memory_hint_similarity",
                reason: "must not exceed fast_track_similarity".into(),
            });
        }
        if self.vendor_retry.max_attempts == 0 || self.reasoning_retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "max_attempts",
                reason: "retry policies need at least one attempt".into(),
            });
        }
        if self.initial_scope.is_empty() {
            return Err(ConfigError::Invalid {
                field: "initial_scope",
                reason: "at least one evidence kind is required".into(),
            });
        }
        if self.memory_top_k == 0 {
            return Err(ConfigError::Invalid {
                field: "memory_top_k",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }

    /// Parse and validate TOML
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate YAML
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load by extension: `.toml`, `.yaml` or `.yml`
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&text),
            Some("yaml" | "yml") => Self::from_yaml_str(&text),
            _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        assert!(CommanderConfig::default().validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = CommanderConfig::from_toml_str(
            "max_loops = 5\napproval_timeout_ms = 60000\n\n[vendor_retry]\nmax_attempts = 4\n",
        )
        .unwrap();
        assert_eq!(config.max_loops, 5);
        assert_eq!(config.approval_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.vendor_retry.max_attempts, 4);
        assert_eq!(config.vendor_retry.base_delay_ms, 1_000);
        assert_eq!(config.reasoning_retry.base_delay_ms, 500);
    }

    #[test]
    fn yaml_file_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "confidence_threshold: 0.8\ninitial_scope: [logs, schema, data-sample]").unwrap();
        let config = CommanderConfig::from_path(file.path()).unwrap();
        assert!((config.confidence_threshold - 0.8).abs() < f64::EPSILON);
        assert_eq!(config.initial_scope.len(), 3);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        assert!(matches!(
            CommanderConfig::from_path(file.path()),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let err = CommanderConfig::from_toml_str("deception_threshold = 1.5").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "deception_threshold", .. }));
    }

    #[test]
    fn hint_above_fast_track_is_rejected() {
        let config = CommanderConfig {
            memory_hint_similarity: 0.95,
            ..CommanderConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
