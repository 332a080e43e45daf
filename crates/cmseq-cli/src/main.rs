use anyhow::Result;
use clap::{Parser, Subcommand};
use cmseq_design::structures::SynthesisConfig;
use cmseq_design::{CanonicalStructure, DesignError, Label};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cmseq", version, about = "Counterbalanced sequence-memory session planner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Init {
        #[arg(long, default_value = "session.yaml")]
        path: PathBuf,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        json: bool,
    },
    Start {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        participant: String,
        #[arg(long)]
        debug: bool,
        #[arg(long)]
        json: bool,
    },
    Resume {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        participant: String,
        #[arg(long)]
        run: usize,
        #[arg(long)]
        json: bool,
    },
    Describe {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        participant: String,
        #[arg(long, default_value_t = 1)]
        run: usize,
        #[arg(long)]
        json: bool,
    },
    CatalogValidate {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Synthesize {
        #[arg(long, default_value_t = 12)]
        count: usize,
        #[arg(long, default_value_t = 100_000)]
        iterations: usize,
        #[arg(long, default_value_t = 1000)]
        attempts: usize,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        #[arg(long)]
        json: bool,
    },
    Payout {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        participant: String,
        #[arg(long)]
        run: usize,
        #[arg(long)]
        scores: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Complete {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        participant: String,
        #[arg(long)]
        run: usize,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error(error_code(&err), err.to_string(), error_details(&err)));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Init { path, force, json } => {
            cmseq_runner::write_session_template(&path, force)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "init",
                    "path": display_path(&path),
                })));
            }
            println!("wrote: {}", path.display());
            println!("next: edit {} and fill in all fields marked REQUIRED", path.display());
            println!("next: cmseq catalog-validate --config {}", path.display());
        }
        Commands::Start {
            config,
            participant,
            debug,
            json,
        } => {
            let cfg = cmseq_runner::load_session_config(&config)?;
            let result = cmseq_runner::start_session(&cfg, &participant, debug)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "start",
                    "session": session_result_to_json(&result),
                })));
            }
            print_session(&result);
        }
        Commands::Resume {
            config,
            participant,
            run,
            json,
        } => {
            let cfg = cmseq_runner::load_session_config(&config)?;
            let result = cmseq_runner::resume_session(&cfg, &participant, run)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "resume",
                    "session": session_result_to_json(&result),
                })));
            }
            print_session(&result);
        }
        Commands::Describe {
            config,
            participant,
            run,
            json,
        } => {
            let cfg = cmseq_runner::load_session_config(&config)?;
            let description = cmseq_runner::describe_run(&cfg, &participant, run)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "run": serde_json::to_value(&description)?,
                })));
            }
            print_description(&description);
        }
        Commands::CatalogValidate { config, json } => {
            let cfg = cmseq_runner::load_session_config(&config)?;
            let summary = cmseq_runner::validate_catalog(&cfg)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "catalog-validate",
                    "valid": true,
                    "catalog": serde_json::to_value(&summary)?,
                })));
            }
            println!("root: {}", summary.root.display());
            println!("lang: {}", summary.lang);
            for (name, n) in &summary.categories {
                println!("category: {} ({} items)", name, n);
            }
            println!("structures: {}", summary.structures);
            println!("ok");
        }
        Commands::Synthesize {
            count,
            iterations,
            attempts,
            seed,
            json,
        } => {
            let config = SynthesisConfig {
                count,
                iterations,
                attempts_per_structure: attempts,
            };
            let table = cmseq_runner::synthesize_structures(&config, seed)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "synthesize",
                    "seed": seed,
                    "structures": structures_to_json(&table),
                })));
            }
            for s in &table {
                println!("{}: {:?}", s.label, s.order);
            }
        }
        Commands::Payout {
            config,
            participant,
            run,
            scores,
            json,
        } => {
            let cfg = cmseq_runner::load_session_config(&config)?;
            let result = cmseq_runner::compute_payout(&cfg, &participant, run, &scores)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "payout",
                    "payout": serde_json::to_value(&result)?,
                })));
            }
            println!("participant: {}", result.participant);
            println!("run: {}", result.run);
            println!("reward: {}", join_labels(&result.reward));
            println!("reward_value: {}", result.reward_value);
            println!("payout: {:.2}", result.payout);
            println!("written: {}", result.path.display());
        }
        Commands::Complete {
            config,
            participant,
            run,
            json,
        } => {
            let cfg = cmseq_runner::load_session_config(&config)?;
            let state = cmseq_runner::complete_run(&cfg, &participant, run)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "complete",
                    "state": serde_json::to_value(&state)?,
                })));
            }
            for (run, s) in &state.runs {
                println!("run {}: {} ({})", run, s.status, s.updated_at);
            }
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!("{{\"ok\":false}}"),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

const RUNNER_ERROR_CODES: &[&str] = &[
    "operation_in_progress",
    "participant_exists",
    "plan_digest_mismatch",
    "plan_drift",
    "seed_mismatch",
    "run_completed",
    "run_not_started",
];

fn error_code(err: &anyhow::Error) -> &'static str {
    if let Some(design) = err.downcast_ref::<DesignError>() {
        return design.code();
    }
    let message = err.to_string();
    let prefix = message.split(':').next().unwrap_or_default();
    RUNNER_ERROR_CODES
        .iter()
        .find(|code| **code == prefix)
        .copied()
        .unwrap_or("command_failed")
}

fn error_details(err: &anyhow::Error) -> Value {
    match err.downcast_ref::<DesignError>() {
        Some(DesignError::InfeasibleDesign { component, attempts }) => {
            json!({ "component": component, "attempts": attempts })
        }
        Some(DesignError::MissingSeed { path }) => json!({ "path": path.display().to_string() }),
        Some(DesignError::SeedConflict {
            path,
            existing,
            requested,
        }) => json!({
            "path": path.display().to_string(),
            "existing": existing,
            "requested": requested
        }),
        _ => json!({}),
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Init { json, .. }
        | Commands::Start { json, .. }
        | Commands::Resume { json, .. }
        | Commands::Describe { json, .. }
        | Commands::CatalogValidate { json, .. }
        | Commands::Synthesize { json, .. }
        | Commands::Payout { json, .. }
        | Commands::Complete { json, .. } => *json,
    }
}

fn join_labels(labels: &[Label]) -> String {
    labels.iter().map(|l| l.to_string()).collect::<Vec<_>>().join(",")
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}

fn session_result_to_json(result: &cmseq_runner::SessionResult) -> Value {
    json!({
        "participant": result.participant,
        "participant_dir": display_path(&result.participant_dir),
        "seed": result.seed,
        "run": result.run,
        "plan_digest": result.plan_digest,
        "regenerated": result.regenerated,
        "split": result.plan.split,
        "runs": result.plan.runs.iter().map(|r| json!({
            "run": r.index,
            "labels": r.labels,
            "blocks": r.blocks,
            "reward": r.rewards.reward,
        })).collect::<Vec<_>>(),
    })
}

fn structures_to_json(table: &[CanonicalStructure]) -> Value {
    Value::Array(
        table
            .iter()
            .map(|s| json!({ "label": s.label, "order": s.order }))
            .collect(),
    )
}

fn print_session(result: &cmseq_runner::SessionResult) {
    println!("participant: {}", result.participant);
    println!("participant_dir: {}", result.participant_dir.display());
    println!("seed: {}", result.seed);
    println!("run: {}", result.run);
    println!("plan_digest: {}", result.plan_digest);
    if result.regenerated {
        println!("regenerated: true");
    }
    for run in &result.plan.runs {
        let blocks = run
            .blocks
            .blocks()
            .iter()
            .map(|b| join_labels(b))
            .collect::<Vec<_>>()
            .join(" | ");
        println!("run_{}_blocks: {}", run.index, blocks);
        println!("run_{}_reward: {}", run.index, join_labels(&run.rewards.reward));
    }
}

fn print_description(d: &cmseq_runner::RunDescription) {
    println!("participant: {}", d.participant);
    println!("run: {}", d.run);
    println!("seed: {}", d.seed);
    println!("split: {:?}", d.split);
    println!("labels: {}", join_labels(&d.labels));
    println!("repeated_pairs: {}", d.repeated_pairs.join(","));
    println!("reward: {}", join_labels(&d.reward));
    println!("no_reward: {}", join_labels(&d.no_reward));
    println!("opening_img_txt: {}/{}", d.opening_balance.0, d.opening_balance.1);
    println!("question_img_txt: {}/{}", d.question_balance.0, d.question_balance.1);
    for block in &d.blocks {
        println!("block {}: {}", block.index, join_labels(&block.labels));
        for trial in &block.trials {
            let questions = trial
                .questions
                .iter()
                .map(|q| format!("{}[{}->{} {}]", q.label, q.cue, q.target, q.modality))
                .collect::<Vec<_>>()
                .join(" ");
            println!(
                "  trial {}: {} opening={} questions: {}",
                trial.index,
                join_labels(&trial.order),
                trial.opening,
                questions
            );
        }
    }
    if !d.tones.is_empty() {
        for (label, tone) in &d.tones {
            println!("tone {}: {}", label, tone);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subcommand_accepts_json() {
        let cli = Cli::try_parse_from(["cmseq", "init", "--path", "s.yaml", "--json"]).expect("parse init");
        assert!(command_json_mode(&cli.command));
        let cli = Cli::try_parse_from(["cmseq", "init"]).expect("parse init");
        assert!(!command_json_mode(&cli.command));
        let cli = Cli::try_parse_from(["cmseq", "synthesize", "--count", "6", "--json"]).expect("parse synthesize");
        assert!(command_json_mode(&cli.command));
    }

    #[test]
    fn init_json_reports_written_path() {
        let path = std::env::temp_dir().join(format!("cmseq_cli_init_{}.yaml", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let payload = run_command(Commands::Init {
            path: path.clone(),
            force: false,
            json: true,
        })
        .expect("init")
        .expect("json payload");
        assert_eq!(payload["ok"], json!(true));
        assert_eq!(payload["command"], json!("init"));
        assert_eq!(payload["path"], json!(path.display().to_string()));
        assert!(path.exists());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn runner_error_prefixes_map_to_codes() {
        let err = anyhow::anyhow!("run_not_started: run 2 of participant 6 is not running (status: none)");
        assert_eq!(error_code(&err), "run_not_started");
        let err = anyhow::anyhow!("operation_in_progress: participant locked");
        assert_eq!(error_code(&err), "operation_in_progress");
        let err = anyhow::anyhow!("something else");
        assert_eq!(error_code(&err), "command_failed");
    }
}
