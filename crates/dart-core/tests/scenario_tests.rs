use std::path::PathBuf;

use dart_core::test_harness::{run_scenario, run_simulator, Scenario, SimulatorConfig};
use dart_kernel::Outcome;

fn scenario_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../scenarios")
}

#[tokio::test(start_paused = true)]
async fn bundled_scenarios_meet_their_expectations() {
    let scenarios = Scenario::load_dir(scenario_dir()).unwrap();
    assert!(scenarios.len() >= 6);

    for scenario in &scenarios {
        assert!(scenario.expect.is_some(), "{} pins no expectations", scenario.name);
        let outcome = run_scenario(scenario).await.unwrap();
        assert!(
            outcome.passed(),
            "{}: {:?}\n{}",
            outcome.name,
            outcome.mismatches,
            outcome.report.summary
        );
        let record = outcome.record.unwrap();
        assert!(dart_kernel::audit::verify_entries(&record.audit).is_ok());
    }
}

#[tokio::test(start_paused = true)]
async fn approval_timeout_scenario_names_the_timeout() {
    let scenario = Scenario::from_path(scenario_dir().join("approval-timeout.yaml")).unwrap();
    let outcome = run_scenario(&scenario).await.unwrap();

    assert_eq!(outcome.report.outcome, Outcome::Escalated);
    assert!(outcome.report.summary.contains("approval not received within 200ms"));
}

#[tokio::test(start_paused = true)]
async fn seeded_stress_run_holds_every_invariant() {
    let report = run_simulator(SimulatorConfig {
        seed: 7,
        missions: 30,
        max_loops: 2,
    })
    .await
    .unwrap();

    assert!(report.passed(), "{}", report.generate_text());
    assert_eq!(report.outcomes.values().sum::<usize>(), 30);
}
