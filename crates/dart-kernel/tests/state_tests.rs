use dart_kernel::state_machine::{allowed_transitions, validate_transition, StageMachine};
use dart_kernel::types::Stage;
use dart_kernel::StateMachineError;
use proptest::prelude::*;

fn any_stage() -> impl Strategy<Value = Stage> {
    prop::sample::select(Stage::ALL.to_vec())
}

#[test]
fn test_observing_transitions() {
    assert!(validate_transition(Stage::Observing, Stage::Orienting).is_ok());
    // zero-step resolution
    assert!(validate_transition(Stage::Observing, Stage::Acting).is_ok());

    assert!(validate_transition(Stage::Observing, Stage::Deciding).is_err());
    assert!(validate_transition(Stage::Observing, Stage::Learning).is_err());
}

#[test]
fn test_acting_transitions() {
    assert!(validate_transition(Stage::Acting, Stage::Blocked).is_ok());
    assert!(validate_transition(Stage::Acting, Stage::Learning).is_ok());
    // denial returns to deciding, execution failure to observing
    assert!(validate_transition(Stage::Acting, Stage::Deciding).is_ok());
    assert!(validate_transition(Stage::Acting, Stage::Observing).is_ok());

    assert!(validate_transition(Stage::Acting, Stage::Orienting).is_err());
}

#[test]
fn test_learning_only_closes() {
    assert_eq!(allowed_transitions(Stage::Learning), vec![Stage::Closed]);
}

#[test]
fn test_happy_path_walk() {
    let mut machine = StageMachine::new(3);
    for to in [
        Stage::Observing,
        Stage::Orienting,
        Stage::Deciding,
        Stage::Acting,
        Stage::Blocked,
        Stage::Acting,
        Stage::Learning,
        Stage::Closed,
    ] {
        machine.advance(to).unwrap();
    }
    assert!(machine.stage().is_terminal());
    assert!(machine.advance(Stage::Observing).is_err());
}

proptest! {
    #[test]
    fn prop_validation_matches_table(from in any_stage(), to in any_stage()) {
        let res = validate_transition(from, to);
        let allowed = allowed_transitions(from);

        if res.is_ok() {
            prop_assert!(allowed.contains(&to));
        } else {
            prop_assert!(!allowed.contains(&to));
            prop_assert_eq!(res, Err(StateMachineError::IllegalTransition { from, to }));
        }
    }

    #[test]
    fn prop_no_stage_returns_to_created(from in any_stage()) {
        prop_assert!(!allowed_transitions(from).contains(&Stage::Created));
    }

    #[test]
    fn prop_loop_count_never_exceeds_budget(max_loops in 0u32..6, tries in 0usize..20) {
        let mut machine = StageMachine::new(max_loops);
        for _ in 0..tries {
            let _ = machine.consume_loop();
            prop_assert!(machine.loop_count() <= machine.max_loops());
        }
    }
}
