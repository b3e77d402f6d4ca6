use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use dart_core::report::render_table;
use dart_core::test_harness::{run_scenario, run_simulator, Scenario, SimulatorConfig};
use dart_core::CommanderConfig;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("dart")
        .version(env!("CARGO_PKG_VERSION"))
        .about("DART mission commander")
        .arg(
            Arg::new("config")
                .long("config")
                .env("DART_CONFIG")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Commander configuration (.toml, .yaml or .yml)"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("simulate")
                .about("Run one scripted scenario")
                .arg(
                    Arg::new("scenario")
                        .long("scenario")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Scenario file"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the archived mission record as JSON"),
                ),
        )
        .subcommand(
            Command::new("evaluate")
                .about("Run every scenario in a directory and print a summary table")
                .arg(
                    Arg::new("dir")
                        .long("dir")
                        .default_value("scenarios")
                        .value_parser(value_parser!(PathBuf))
                        .help("Scenario directory"),
                ),
        )
        .subcommand(
            Command::new("stress")
                .about("Run seeded random missions and check invariants")
                .arg(
                    Arg::new("missions")
                        .long("missions")
                        .default_value("50")
                        .value_parser(value_parser!(usize))
                        .help("Number of missions"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                ),
        )
        .subcommand(Command::new("check-config").about("Validate and print the configuration"))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(matches: &ArgMatches) -> Result<Option<CommanderConfig>> {
    matches
        .get_one::<PathBuf>("config")
        .map(|path| {
            CommanderConfig::from_path(path)
                .with_context(|| format!("loading configuration from {}", path.display()))
        })
        .transpose()
}

fn apply_config(scenario: Scenario, config: Option<&CommanderConfig>) -> Scenario {
    match config {
        Some(config) => scenario.with_config(config.clone()),
        None => scenario,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("log-json"));
    let config = load_config(&matches)?;

    match matches.subcommand() {
        Some(("simulate", args)) => {
            let path = args
                .get_one::<PathBuf>("scenario")
                .context("--scenario is required")?;
            let scenario = Scenario::from_path(path)
                .with_context(|| format!("loading scenario {}", path.display()))?;
            let scenario = apply_config(scenario, config.as_ref());
            let outcome = run_scenario(&scenario).await?;

            if args.get_flag("json") {
                println!("{}", serde_json::to_string_pretty(&outcome.record)?);
            } else {
                println!("{}", render_table(&[(outcome.name.clone(), outcome.report.clone())]));
                println!("{}", outcome.report.summary);
            }
            for mismatch in &outcome.mismatches {
                eprintln!("expectation failed: {mismatch}");
            }
            if !outcome.passed() {
                bail!("scenario {} did not meet its expectations", outcome.name);
            }
        }
        Some(("evaluate", args)) => {
            let dir = args.get_one::<PathBuf>("dir").context("--dir is required")?;
            let scenarios = Scenario::load_dir(dir)
                .with_context(|| format!("loading scenarios from {}", dir.display()))?;
            if scenarios.is_empty() {
                bail!("no scenarios found in {}", dir.display());
            }

            let mut rows = Vec::with_capacity(scenarios.len());
            let mut failed = Vec::new();
            for scenario in scenarios {
                let scenario = apply_config(scenario, config.as_ref());
                let outcome = run_scenario(&scenario).await?;
                if !outcome.passed() {
                    failed.push(format!("{}: {}", outcome.name, outcome.mismatches.join("; ")));
                }
                rows.push((outcome.name, outcome.report));
            }
            print!("{}", render_table(&rows));
            for failure in &failed {
                eprintln!("expectation failed: {failure}");
            }
            if !failed.is_empty() {
                bail!("{} scenario(s) failed", failed.len());
            }
        }
        Some(("stress", args)) => {
            let missions = args.get_one::<usize>("missions").copied().unwrap_or(50);
            let seed = args.get_one::<u64>("seed").copied().unwrap_or(42);
            let report = run_simulator(SimulatorConfig {
                seed,
                missions,
                ..SimulatorConfig::default()
            })
            .await?;
            println!("{}", report.generate_text());
            if !report.passed() {
                bail!("{} invariant violation(s)", report.violations.len());
            }
        }
        Some(("check-config", _)) => {
            let config = config.unwrap_or_default();
            config.validate()?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
        _ => unreachable!("subcommand_required"),
    }
    Ok(())
}
