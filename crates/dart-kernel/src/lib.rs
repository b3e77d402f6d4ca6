//! DART Kernel (dart-kernel)
//!
//! Runtime-independent building blocks of the mission loop:
//! 1. **Stage table**: which mission stage may follow which, plus the loop budget
//! 2. **Backoff**: exponential backoff with jitter and cancellation
//! 3. **Audit**: append-only, hash-chained mission history and its sinks
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use dart_kernel::prelude::*;
//!
//! let mut machine = StageMachine::new(3);
//! machine.advance(Stage::Observing)?;
//!
//! let policy = BackoffPolicy::new(3, Duration::from_secs(1), 0.25);
//! let probe = policy.execute(&cancel, |attempt| endpoint.check(attempt)).await?;
//! ```

pub mod audit;
pub mod backoff;
pub mod error;
pub mod state_machine;
pub mod types;

pub use error::*;
pub use types::*;

/// Commonly used kernel types
pub mod prelude {
    pub use crate::audit::{
        AuditDraft, AuditEntry, AuditKind, AuditSink, AuditTrail, ChannelSink, FanoutSink,
        MemorySink, NullSink, TracingSink,
    };
    pub use crate::backoff::{AttemptHistory, AttemptOutcome, BackoffError, BackoffPolicy, Retried};
    pub use crate::error::{AuditError, StateMachineError};
    pub use crate::state_machine::{allowed_transitions, validate_transition, StageMachine};
    pub use crate::types::{EvidenceId, MissionId, Outcome, ProposalId, SignalId, Stage};
}
