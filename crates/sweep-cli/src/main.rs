use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use sweep_runner::{
    CheckpointState, CheckpointStore, Outcome, Scheduler, SweepConfig, SweepError, SweepReport,
};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "sweep.yaml";

#[derive(Parser)]
#[command(
    name = "sweep",
    version,
    about = "Bounded parallel prefix search driving an external cracking tool"
)]
struct Cli {
    /// Log filter used when RUST_LOG is unset (e.g. `info`, `sweep_runner=debug`).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone, Default)]
struct ConfigArgs {
    /// YAML config file; `sweep.yaml` in the working directory is used when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    tool: Option<PathBuf>,
    #[arg(long)]
    archive: Option<PathBuf>,
    #[arg(long)]
    min_len: Option<u32>,
    #[arg(long)]
    max_len: Option<u32>,
    #[arg(long)]
    alphabet: Option<String>,
    #[arg(long = "length")]
    combination_length: Option<usize>,
    #[arg(long)]
    max_instances: Option<usize>,
    #[arg(long)]
    marker: Option<String>,
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    #[arg(long)]
    work_dir: Option<PathBuf>,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    poll_ms: Option<u64>,
    #[arg(long)]
    grace_ms: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    Run {
        #[command(flatten)]
        config: ConfigArgs,
        /// Resume from the checkpoint without asking.
        #[arg(long, conflicts_with = "fresh")]
        resume: bool,
        /// Discard any checkpoint without asking.
        #[arg(long)]
        fresh: bool,
        /// Line to type on stdin to save progress and exit.
        #[arg(long, default_value = "s")]
        save_token: String,
        /// Do not listen on stdin for save requests.
        #[arg(long)]
        no_listen: bool,
        #[arg(long)]
        json: bool,
    },
    Describe {
        #[command(flatten)]
        config: ConfigArgs,
        #[arg(long)]
        json: bool,
    },
    Locate {
        #[command(flatten)]
        config: ConfigArgs,
        #[arg(long, conflicts_with = "candidate", required_unless_present = "candidate")]
        index: Option<u64>,
        #[arg(long)]
        candidate: Option<String>,
        #[arg(long)]
        json: bool,
    },
    CheckpointClear {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;
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
                emit_json(&json_error(&err));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| anyhow!("invalid log filter '{}': {}", level, e))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_thread_names(true)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("failed to install log subscriber: {}", e))
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            config,
            resume,
            fresh,
            save_token,
            no_listen,
            json,
        } => {
            let config = resolve_config(&config)?;
            config.validate()?;
            let store = config.checkpoint_store();
            let start_index = resolve_start_index(&store, resume, fresh)?;
            let scheduler = Scheduler::new(&config, start_index)?;
            if !no_listen {
                eprintln!(
                    "Type '{}' and press Enter at any time to save progress and exit.",
                    save_token
                );
                sweep_runner::spawn_listener(
                    BufReader::new(io::stdin()),
                    &save_token,
                    scheduler.coordinator(),
                )?;
            }
            let report = scheduler.run()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "report": serde_json::to_value(&report)?,
                })));
            }
            print_report(&report, &store);
        }
        Commands::Describe { config, json } => {
            let config = resolve_config(&config)?;
            let summary = describe(&config)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary,
                })));
            }
            print_summary(&summary);
        }
        Commands::Locate {
            config,
            index,
            candidate,
            json,
        } => {
            let config = resolve_config(&config)?;
            let keyspace = config.keyspace()?;
            let (index, candidate) = match (index, candidate) {
                (Some(index), _) => {
                    let candidate = keyspace.nth(index).ok_or_else(|| {
                        anyhow!("index {} is outside the keyspace (total {})", index, keyspace.total())
                    })?;
                    (index, candidate)
                }
                (None, Some(candidate)) => {
                    let index = keyspace.index_of(&candidate).ok_or_else(|| {
                        anyhow!("'{}' is not a candidate of this keyspace", candidate)
                    })?;
                    (index, candidate)
                }
                (None, None) => return Err(anyhow!("either --index or --candidate is required")),
            };
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "locate",
                    "index": index,
                    "candidate": candidate,
                    "total": keyspace.total(),
                })));
            }
            println!("index: {}", index);
            println!("candidate: {}", candidate);
        }
        Commands::CheckpointClear { config } => {
            let config = resolve_config(&config)?;
            let store = config.checkpoint_store();
            store.delete()?;
            println!("checkpoint cleared: {}", store.path().display());
        }
    }
    Ok(None)
}

fn resolve_config(args: &ConfigArgs) -> Result<SweepConfig> {
    let mut config = match &args.config {
        Some(path) => SweepConfig::from_yaml_file(path)?,
        None if Path::new(DEFAULT_CONFIG).is_file() => {
            SweepConfig::from_yaml_file(Path::new(DEFAULT_CONFIG))?
        }
        None => SweepConfig::default(),
    };
    apply_overrides(&mut config, args);
    tracing::debug!(?config, "resolved configuration");
    Ok(config)
}

fn apply_overrides(config: &mut SweepConfig, args: &ConfigArgs) {
    if let Some(v) = &args.tool {
        config.tool = v.clone();
    }
    if let Some(v) = &args.archive {
        config.archive = v.clone();
    }
    if let Some(v) = args.min_len {
        config.min_len = v;
    }
    if let Some(v) = args.max_len {
        config.max_len = v;
    }
    if let Some(v) = &args.alphabet {
        config.alphabet = v.clone();
    }
    if let Some(v) = args.combination_length {
        config.combination_length = v;
    }
    if let Some(v) = args.max_instances {
        config.max_instances = v;
    }
    if let Some(v) = &args.marker {
        config.success_marker = v.clone();
    }
    if let Some(v) = &args.checkpoint {
        config.checkpoint_path = v.clone();
    }
    if let Some(v) = &args.work_dir {
        config.work_dir = v.clone();
    }
    if let Some(v) = &args.output_dir {
        config.output_dir = v.clone();
    }
    if let Some(v) = args.poll_ms {
        config.poll_interval_ms = v;
    }
    if let Some(v) = args.grace_ms {
        config.grace_period_ms = v;
    }
}

fn resolve_start_index(store: &CheckpointStore, resume: bool, fresh: bool) -> Result<u64> {
    if !store.exists() {
        return Ok(0);
    }
    if fresh {
        store.delete()?;
        eprintln!("Save file removed. Starting from beginning.");
        return Ok(0);
    }
    let resume = resume
        || ask_yes_no(&format!(
            "A save file '{}' was found. Do you want to resume from saved progress? (Y/N): ",
            store.path().display()
        ))?;
    if !resume {
        store.delete()?;
        eprintln!("Save file removed. Starting from beginning.");
        return Ok(0);
    }
    match store.load() {
        Some(index) => {
            eprintln!("Resuming from combination index {}.", index);
            Ok(index)
        }
        None => {
            eprintln!("Save file content invalid. Starting from beginning.");
            Ok(0)
        }
    }
}

fn ask_yes_no(prompt: &str) -> Result<bool> {
    let mut stderr = io::stderr();
    write!(stderr, "{}", prompt)?;
    stderr.flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("y"))
}

fn describe(config: &SweepConfig) -> Result<Value> {
    config.validate()?;
    let keyspace = config.keyspace()?;
    let settings = config.job_settings();
    let first = keyspace.nth(0).unwrap_or_default();
    let last = keyspace.nth(keyspace.total() - 1).unwrap_or_default();
    let checkpoint = match config.checkpoint_store().inspect() {
        CheckpointState::Missing => json!({ "state": "missing" }),
        CheckpointState::Valid(index) => json!({
            "state": "valid",
            "index": index,
            "candidate": keyspace.nth(index),
        }),
        CheckpointState::Corrupt(reason) => json!({ "state": "corrupt", "reason": reason }),
    };
    Ok(json!({
        "tool": config.tool.display().to_string(),
        "archive": config.archive.display().to_string(),
        "alphabet": config.alphabet,
        "combination_length": keyspace.length(),
        "total": keyspace.total(),
        "first_candidate": first,
        "last_candidate": last,
        "max_instances": config.max_instances,
        "success_marker": config.success_marker,
        "command_template": settings.command_line(&settings.constraint_path(&first)),
        "checkpoint_path": config.checkpoint_path.display().to_string(),
        "checkpoint": checkpoint,
        "result_artifact": config.result_artifact_path().display().to_string(),
    }))
}

fn print_summary(summary: &Value) {
    for key in [
        "tool",
        "archive",
        "alphabet",
        "combination_length",
        "total",
        "first_candidate",
        "last_candidate",
        "max_instances",
        "success_marker",
        "checkpoint_path",
        "result_artifact",
    ] {
        match &summary[key] {
            Value::String(s) => println!("{}: {}", key, s),
            other => println!("{}: {}", key, other),
        }
    }
    if let Some(parts) = summary["command_template"].as_array() {
        let parts: Vec<&str> = parts.iter().filter_map(|p| p.as_str()).collect();
        println!("command_template: {}", parts.join(" "));
    }
    let checkpoint = &summary["checkpoint"];
    match checkpoint["state"].as_str() {
        Some("valid") => println!(
            "checkpoint: index {} ({})",
            checkpoint["index"],
            checkpoint["candidate"].as_str().unwrap_or("past end")
        ),
        Some("corrupt") => println!(
            "checkpoint: corrupt ({})",
            checkpoint["reason"].as_str().unwrap_or("unknown")
        ),
        _ => println!("checkpoint: none"),
    }
}

fn print_report(report: &SweepReport, store: &CheckpointStore) {
    match report.outcome {
        Outcome::Found => {
            if let Some(path) = &report.artifact_path {
                println!("Pass file created: {}", path.display());
            }
            if let Some(line) = &report.success_line {
                println!("Found line: {}", line);
            }
        }
        Outcome::Saved => {
            println!(
                "Progress saved at combination index {} in {}. Exiting.",
                report.next_index,
                store.path().display()
            );
        }
        Outcome::Exhausted => {
            println!("Finished processing all combinations without a success line.");
        }
    }
    println!(
        "launched: {} (failed to launch: {}, peak concurrency: {})",
        report.launched, report.launch_failures, report.peak_active
    );
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

/// Error envelope; the code comes from the first `SweepError` in the chain.
fn json_error(err: &anyhow::Error) -> Value {
    let code = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<SweepError>())
        .map(SweepError::code)
        .unwrap_or("command_failed");
    let causes: Vec<String> = err.chain().skip(1).map(|c| c.to_string()).collect();
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": format!("{:#}", err),
            "details": { "causes": causes }
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Locate { json, .. } => *json,
        Commands::CheckpointClear { .. } => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn overrides_replace_file_values() {
        let cli = Cli::try_parse_from([
            "sweep",
            "run",
            "--archive",
            "Addon.rar",
            "--alphabet",
            "ab",
            "--length",
            "3",
            "--max-instances",
            "4",
            "--fresh",
        ])
        .expect("parse");
        let Commands::Run { config: args, fresh, .. } = cli.command else {
            panic!("expected run");
        };
        assert!(fresh);
        let mut config = SweepConfig::default();
        apply_overrides(&mut config, &args);
        assert_eq!(config.archive, PathBuf::from("Addon.rar"));
        assert_eq!(config.max_instances, 4);
        assert_eq!(config.keyspace().expect("keyspace").total(), 8);
        assert_eq!(config.tool, PathBuf::from("crark"));
    }

    #[test]
    fn resume_and_fresh_conflict() {
        assert!(Cli::try_parse_from(["sweep", "run", "--resume", "--fresh"]).is_err());
    }

    #[test]
    fn locate_requires_index_or_candidate() {
        assert!(Cli::try_parse_from(["sweep", "locate"]).is_err());
        assert!(Cli::try_parse_from(["sweep", "locate", "--index", "3"]).is_ok());
    }

    #[test]
    fn describe_reports_keyspace_bounds() {
        let config = SweepConfig {
            archive: PathBuf::from("Addon.rar"),
            alphabet: "ab".to_string(),
            checkpoint_path: PathBuf::from("definitely/not/here/save_progress.txt"),
            ..SweepConfig::default()
        };
        let summary = describe(&config).expect("describe");
        assert_eq!(summary["total"], 4);
        assert_eq!(summary["first_candidate"], "aa");
        assert_eq!(summary["last_candidate"], "bb");
        assert_eq!(summary["checkpoint"]["state"], "missing");
        assert_eq!(summary["result_artifact"], "./pass_Addon.rar.txt");
    }

    #[test]
    fn fresh_start_discards_existing_checkpoint() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path().join("save_progress.txt"));
        store.save(9).expect("save");
        assert_eq!(resolve_start_index(&store, false, true).expect("start"), 0);
        assert!(!store.exists());
        store.save(9).expect("save");
        assert_eq!(resolve_start_index(&store, true, false).expect("start"), 9);
    }

    #[test]
    fn json_errors_carry_the_sweep_error_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").expect("write");
        let store = CheckpointStore::new(blocker.join("save_progress.txt")).with_write_attempts(1);
        let err = anyhow::Error::from(store.save(3).expect_err("save under a file"))
            .context("saving progress");
        let value = json_error(&err);
        assert_eq!(value["ok"], false);
        assert_eq!(value["error"]["code"], "checkpoint_write_failure");
        assert_eq!(value["error"]["details"]["causes"].as_array().map(|c| c.len()), Some(2));

        let plain = json_error(&anyhow!("no archive given"));
        assert_eq!(plain["error"]["code"], "command_failed");
    }
}
