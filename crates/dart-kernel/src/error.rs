//! Error types for the mission kernel

use crate::types::Stage;

/// Mission stage machine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    /// Transition not present in the table
    #[error("illegal stage transition: {from} -> {to}")]
    IllegalTransition { from: Stage, to: Stage },

    /// Loop budget already spent
    #[error("loop budget exhausted (max loops: {max_loops})")]
    LoopBudgetExhausted { max_loops: u32 },
}

/// Audit trail errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    /// Hash chain broken at the given entry
    #[error("audit integrity violation at sequence {sequence}")]
    IntegrityViolation { sequence: u64 },

    /// Sequence numbers are not contiguous
    #[error("audit sequence gap: expected {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn illegal_transition_display() {
        let err = StateMachineError::IllegalTransition {
            from: Stage::Closed,
            to: Stage::Observing,
        };
        assert_eq!(err.to_string(), "illegal stage transition: closed -> observing");
    }

    #[test]
    fn audit_error_display() {
        let err = AuditError::SequenceGap { expected: 3, found: 5 };
        assert!(err.to_string().contains("expected 3"));
    }
}
