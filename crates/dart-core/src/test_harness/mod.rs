//! Test harness
//!
//! Scripted collaborators, YAML scenarios and a seeded mission simulator.

pub mod collaborators;
pub mod scenario;
pub mod simulator;

pub use collaborators::*;
pub use scenario::{run_scenario, Expectation, Scenario, ScenarioOutcome};
pub use simulator::{check_invariants, run_simulator, InvariantCheck, SimulatorConfig, SimulatorReport, Violation};
