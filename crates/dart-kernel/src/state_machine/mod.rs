//! Mission stage transition table and loop budget
//!
//! The table is the single source of truth for which stage may follow which.
//! Any non-closed stage may close (cancellation or escalation can strike anywhere).

use crate::error::StateMachineError;
use crate::types::Stage;

/// Validates a stage transition.
///
/// Illegal transitions return an error; with the `strict-debug` feature they panic.
pub fn validate_transition(from: Stage, to: Stage) -> Result<(), StateMachineError> {
    if allowed(from, to) {
        Ok(())
    } else {
        #[cfg(feature = "strict-debug")]
        panic!("Illegal stage transition attempted: {:?} -> {:?}", from, to);

        Err(StateMachineError::IllegalTransition { from, to })
    }
}

/// Stages reachable from `from` in one step
pub fn allowed_transitions(from: Stage) -> Vec<Stage> {
    use Stage::*;
    match from {
        Created => vec![Observing, Closed],
        // Acting directly from Observing is the zero-step (memory recall) path
        Observing => vec![Orienting, Acting, Closed],
        Orienting => vec![Deciding, Closed],
        Deciding => vec![Acting, Observing, Closed],
        Acting => vec![Blocked, Learning, Deciding, Observing, Closed],
        Blocked => vec![Acting, Closed],
        Learning => vec![Closed],
        Closed => vec![],
    }
}

fn allowed(from: Stage, to: Stage) -> bool {
    allowed_transitions(from).into_iter().any(|s| s == to)
}

/// Current stage plus a bounded loop counter.
///
/// `loop_count` starts at zero and can never exceed `max_loops`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageMachine {
    stage: Stage,
    loop_count: u32,
    max_loops: u32,
}

impl StageMachine {
    /// New machine in `Created`
    #[inline]
    #[must_use]
    pub fn new(max_loops: u32) -> Self {
        Self {
            stage: Stage::Created,
            loop_count: 0,
            max_loops,
        }
    }

    /// Current stage
    #[inline]
    #[must_use]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Loops consumed so far
    #[inline]
    #[must_use]
    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }

    /// Loop budget
    #[inline]
    #[must_use]
    pub fn max_loops(&self) -> u32 {
        self.max_loops
    }

    /// Whether another loop may be consumed
    #[inline]
    #[must_use]
    pub fn has_loops_left(&self) -> bool {
        self.loop_count < self.max_loops
    }

    /// Move to `to`, returning the previous stage
    pub fn advance(&mut self, to: Stage) -> Result<Stage, StateMachineError> {
        validate_transition(self.stage, to)?;
        let from = self.stage;
        self.stage = to;
        Ok(from)
    }

    /// Consume one loop, returning the new count
    pub fn consume_loop(&mut self) -> Result<u32, StateMachineError> {
        if !self.has_loops_left() {
            return Err(StateMachineError::LoopBudgetExhausted {
                max_loops: self.max_loops,
            });
        }
        self.loop_count += 1;
        Ok(self.loop_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_has_no_exits() {
        assert!(allowed_transitions(Stage::Closed).is_empty());
    }

    #[test]
    fn every_open_stage_can_close() {
        for stage in Stage::ALL.iter().filter(|s| !s.is_terminal()) {
            assert!(validate_transition(*stage, Stage::Closed).is_ok(), "{stage}");
        }
    }

    #[test]
    fn blocked_only_resumes_acting() {
        assert!(validate_transition(Stage::Blocked, Stage::Acting).is_ok());
        assert!(validate_transition(Stage::Blocked, Stage::Learning).is_err());
        assert!(validate_transition(Stage::Blocked, Stage::Deciding).is_err());
    }

    #[test]
    fn loop_budget_is_bounded() {
        let mut machine = StageMachine::new(2);
        assert_eq!(machine.consume_loop(), Ok(1));
        assert_eq!(machine.consume_loop(), Ok(2));
        assert_eq!(
            machine.consume_loop(),
            Err(StateMachineError::LoopBudgetExhausted { max_loops: 2 })
        );
        assert_eq!(machine.loop_count(), 2);
    }

    #[test]
    fn advance_rejects_illegal_step() {
        let mut machine = StageMachine::new(1);
        assert!(machine.advance(Stage::Acting).is_err());
        assert_eq!(machine.stage(), Stage::Created);
        assert_eq!(machine.advance(Stage::Observing), Ok(Stage::Created));
    }
}
