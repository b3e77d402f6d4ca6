//! DART Mission Commander (dart-core)
//!
//! Drives an incident from alert to closure:
//! - Concurrent evidence fan-out, vendor probing and memory lookup
//! - Vendor/evidence reconciliation with deception detection
//! - Confidence routing: fast-track, full diagnosis, retry or escalate
//! - A safety gate that suspends high-risk remediation until a human resolves it
//! - A hash-chained audit trail and an archive of closed missions
//!
//! # Example
//!
//! ```rust,ignore
//! use dart_core::prelude::*;
//!
//! # async fn example(collaborators: Collaborators, proposal_id: ProposalId) -> Result<(), MissionError> {
//! let commander = Arc::new(Commander::new(CommanderConfig::default(), collaborators)?);
//! let handle = commander.launch(Alert::new("billing-etl", "ERROR_COL_MISSING", "column region does not exist"));
//!
//! // later, answering the `ApprovalRequest` published for `proposal_id`:
//! commander.resolve(handle.id(), proposal_id, ApprovalDecision::Approved, "reviewed");
//!
//! let report = handle.join().await?;
//! println!("{}: {}", report.outcome, report.summary);
//! # Ok(())
//! # }
//! ```

#![allow(missing_docs)]

pub mod commander;
pub mod config;
pub mod error;
pub mod evidence;
pub mod gate;
pub mod memory;
pub mod reasoning;
pub mod report;
pub mod test_harness;
pub mod types;
pub mod vendor;

pub use commander::{Collaborators, Commander, MissionArchive, MissionHandle};
pub use config::{CommanderConfig, RetryConfig, RiskRulesConfig};
pub use error::{CollaboratorError, ConfigError, MissionError};
pub use evidence::{EvidenceCollector, MissionContext, SignatureScanner};
pub use gate::{ApprovalChannel, ApprovalRequest, ResolveOutcome, RiskTaxonomy, SafetyGate};
pub use memory::{InMemoryStore, IncidentSummary, MemoryStore};
pub use reasoning::{ActionExecutor, ActionReceipt, ReasoningService};
pub use vendor::{HttpVendorEndpoint, VendorEndpoint, VendorLiaison};

/// Prelude module for common imports
pub mod prelude {
    pub use std::sync::Arc;

    pub use dart_kernel::prelude::*;
    pub use tokio_util::sync::CancellationToken;

    pub use crate::types::*;
    pub use crate::{
        ActionExecutor, ApprovalChannel, Collaborators, Commander, CommanderConfig,
        EvidenceCollector, MemoryStore, MissionError, MissionHandle, ReasoningService, ResolveOutcome,
        VendorEndpoint,
    };
}
