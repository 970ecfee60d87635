use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use pipeseg_runner::{
    LaunchError, LaunchOptions, LaunchOutcome, LaunchParams, LaunchPlan, RunConfig, RunProfile,
    Selection, SplitInfo,
};
use serde_json::{json, Value};
use std::io::{self, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "pipeseg",
    version,
    about = "Launch distributed semi-supervised segmentation training runs"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DatasetArg {
    #[value(name = "levir")]
    Levir,
    #[value(name = "whu")]
    Whu,
}

impl From<DatasetArg> for pipeseg_runner::Dataset {
    fn from(value: DatasetArg) -> Self {
        match value {
            DatasetArg::Levir => pipeseg_runner::Dataset::Levir,
            DatasetArg::Whu => pipeseg_runner::Dataset::Whu,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum MethodArg {
    #[value(name = "unimatch_v2")]
    UniMatchV2,
    #[value(name = "supervised")]
    Supervised,
}

impl From<MethodArg> for pipeseg_runner::Method {
    fn from(value: MethodArg) -> Self {
        match value {
            MethodArg::UniMatchV2 => pipeseg_runner::Method::UniMatchV2,
            MethodArg::Supervised => pipeseg_runner::Method::Supervised,
        }
    }
}

/// Selects the run; flags win over `--profile`, which wins over defaults.
#[derive(Debug, Clone, Args)]
struct RunArgs {
    /// Worker processes per node.
    nproc: u32,
    /// Rendezvous port for the distributed launcher and the training program.
    port: u16,
    #[arg(long, value_enum)]
    dataset: Option<DatasetArg>,
    #[arg(long, value_enum)]
    method: Option<MethodArg>,
    /// Experiment tag, e.g. dinov2_base.
    #[arg(long)]
    exp: Option<String>,
    /// Split fraction directory under splits/<dataset>/, e.g. 40%.
    #[arg(long)]
    split: Option<String>,
    /// YAML file with any of: dataset, method, exp, split, python, master_addr.
    #[arg(long)]
    profile: Option<PathBuf>,
    /// Project root holding configs/, splits/ and the training scripts.
    #[arg(long, default_value = ".")]
    root: PathBuf,
    #[arg(long)]
    python: Option<String>,
    #[arg(long)]
    master_addr: Option<String>,
    /// Leave missing config/split files for the training program to report.
    #[arg(long)]
    no_preflight: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch a training run and mirror its output into <save_dir>/out.log.
    Run(RunArgs),
    /// Resolve paths and print the launch command without running it.
    Describe(RunArgs),
    /// List the split fractions available for a dataset.
    Splits {
        #[arg(long, value_enum, default_value = "levir")]
        dataset: DatasetArg,
        #[arg(long, default_value = ".")]
        root: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

struct CommandResult {
    payload: Option<Value>,
    exit_code: i32,
}

impl CommandResult {
    fn done(payload: Option<Value>) -> Self {
        Self {
            payload,
            exit_code: 0,
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(result) => {
            if let Some(payload) = &result.payload {
                emit_json(payload);
            }
            if result.exit_code != 0 {
                std::process::exit(result.exit_code);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error(error_code(&err), format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

// Logs go to stderr so they never interleave with the mirrored stdout.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(command: Commands) -> Result<CommandResult> {
    match command {
        Commands::Run(args) => run_training(args, io::stdout(), io::stderr()),
        Commands::Describe(args) => {
            let json = args.json;
            let (cfg, params, options) = resolve_run_args(args)?;
            let plan = pipeseg_runner::plan_launch(&cfg, params, &options)?;
            if json {
                return Ok(CommandResult::done(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "plan": plan_to_json(&plan),
                }))));
            }
            print_plan(&plan);
            Ok(CommandResult::done(None))
        }
        Commands::Splits {
            dataset,
            root,
            json,
        } => {
            let dataset: pipeseg_runner::Dataset = dataset.into();
            let splits = pipeseg_runner::describe_splits(&root, dataset);
            if json {
                return Ok(CommandResult::done(Some(json!({
                    "ok": true,
                    "command": "splits",
                    "dataset": dataset.as_str(),
                    "splits": splits,
                }))));
            }
            if splits.is_empty() {
                println!(
                    "no splits found under {}",
                    root.join(pipeseg_runner::paths::splits_dir(dataset)).display()
                );
            }
            for info in &splits {
                print_split(info);
            }
            Ok(CommandResult::done(None))
        }
    }
}

// With --json, stdout carries only the result object, so the child's output
// is mirrored to stderr instead.
fn run_training<O: Write, E: Write>(
    args: RunArgs,
    mut stdout: O,
    mut stderr: E,
) -> Result<CommandResult> {
    let json = args.json;
    let (cfg, params, options) = resolve_run_args(args)?;
    let plan = pipeseg_runner::plan_launch(&cfg, params, &options)?;
    if !json {
        let _ = writeln!(stderr, "save_dir: {}", plan.paths.save_dir.display());
        let _ = writeln!(stderr, "command: {}", plan.command_line());
    }
    let launched = if json {
        pipeseg_runner::run_plan(&plan, &options, &mut stderr)
    } else {
        pipeseg_runner::run_plan(&plan, &options, &mut stdout)
    };
    let outcome = launched.with_context(|| {
        format!("launching {} for {}", cfg.method, plan.paths.save_dir.display())
    })?;
    // Signals have no exit code of their own.
    let exit_code = outcome.exit_code.unwrap_or(1);
    if json {
        return Ok(CommandResult {
            payload: Some(json!({
                "ok": outcome.success(),
                "command": "run",
                "plan": plan_to_json(&plan),
                "outcome": outcome_to_json(&outcome),
            })),
            exit_code,
        });
    }
    let _ = writeln!(stderr, "log: {}", outcome.log_file.display());
    let _ = match outcome.exit_code {
        Some(code) => writeln!(stderr, "exit_code: {}", code),
        None => writeln!(stderr, "exit_code: signal"),
    };
    Ok(CommandResult {
        payload: None,
        exit_code,
    })
}

fn resolve_run_args(args: RunArgs) -> Result<(RunConfig, LaunchParams, LaunchOptions)> {
    let profile = match &args.profile {
        Some(path) => Some(RunProfile::load(path)?),
        None => None,
    };
    let explicit = Selection {
        dataset: args.dataset.map(Into::into),
        method: args.method.map(Into::into),
        exp: args.exp,
        split: args.split,
        python: args.python,
        master_addr: args.master_addr,
    };
    let (cfg, options) =
        pipeseg_runner::merge_selection(explicit, profile, args.root, !args.no_preflight)?;
    let params = LaunchParams::new(args.nproc, args.port)?;
    Ok((cfg, params, options))
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
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

fn error_code(err: &anyhow::Error) -> &'static str {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<LaunchError>())
        .map(LaunchError::code)
        .unwrap_or("command_failed")
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run(args) | Commands::Describe(args) => args.json,
        Commands::Splits { json, .. } => *json,
    }
}

fn plan_to_json(plan: &LaunchPlan) -> Value {
    json!({
        "dataset": plan.config.dataset.as_str(),
        "method": plan.config.method.as_str(),
        "exp": plan.config.experiment_tag,
        "split": plan.config.split,
        "nproc": plan.params.nproc,
        "port": plan.params.port,
        "config": plan.paths.config.display().to_string(),
        "labeled": plan.paths.labeled.display().to_string(),
        "unlabeled": plan.paths.unlabeled.display().to_string(),
        "save_dir": plan.paths.save_dir.display().to_string(),
        "log_file": plan.paths.log_file.display().to_string(),
        "program": plan.spec.program,
        "args": plan.spec.args,
        "command": plan.command_line(),
    })
}

fn outcome_to_json(outcome: &LaunchOutcome) -> Value {
    json!({
        "exit_code": outcome.exit_code,
        "save_dir": outcome.save_dir.display().to_string(),
        "log_file": outcome.log_file.display().to_string(),
        "started_at": outcome.started_at.to_rfc3339(),
        "finished_at": outcome.finished_at.to_rfc3339(),
    })
}

fn print_plan(plan: &LaunchPlan) {
    println!("dataset: {}", plan.config.dataset);
    println!("method: {}", plan.config.method);
    println!("exp: {}", plan.config.experiment_tag);
    println!("split: {}", plan.config.split);
    println!("nproc: {}", plan.params.nproc);
    println!("port: {}", plan.params.port);
    println!("config: {}", plan.paths.config.display());
    println!("labeled: {}", plan.paths.labeled.display());
    println!("unlabeled: {}", plan.paths.unlabeled.display());
    println!("save_dir: {}", plan.paths.save_dir.display());
    println!("log_file: {}", plan.paths.log_file.display());
    println!("command: {}", plan.command_line());
}

fn print_split(info: &SplitInfo) {
    let count = |n: Option<usize>| n.map(|n| n.to_string()).unwrap_or_else(|| "missing".into());
    println!(
        "{}: labeled={} unlabeled={}",
        info.name,
        count(info.labeled_ids),
        count(info.unlabeled_ids)
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_requires_nproc_and_port() {
        assert!(Cli::try_parse_from(["pipeseg", "run"]).is_err());
        assert!(Cli::try_parse_from(["pipeseg", "run", "4"]).is_err());
        assert!(Cli::try_parse_from(["pipeseg", "run", "four", "12345"]).is_err());
        assert!(Cli::try_parse_from(["pipeseg", "run", "4", "12345"]).is_ok());
    }

    #[test]
    fn describe_resolves_reference_run_without_preflight() {
        let cli = Cli::try_parse_from([
            "pipeseg",
            "describe",
            "4",
            "12345",
            "--dataset",
            "levir",
            "--method",
            "unimatch_v2",
            "--exp",
            "dinov2_base",
            "--split",
            "40%",
            "--no-preflight",
        ])
        .expect("parse");
        let args = match cli.command {
            Commands::Describe(args) => args,
            _ => panic!("expected describe"),
        };
        let (cfg, params, options) = resolve_run_args(args).expect("resolve");
        let plan = pipeseg_runner::plan_launch(&cfg, params, &options).expect("plan");
        let value = plan_to_json(&plan);
        assert_eq!(value["save_dir"], "exp/levir/unimatch_v2/dinov2_base/40%");
        assert_eq!(value["labeled"], "splits/levir/40%/labeled.txt");
        let command = value["command"].as_str().expect("command string");
        assert!(command.contains("--master_addr=localhost"), "{}", command);
        assert!(command.ends_with("--port 12345"), "{}", command);
    }

    // `sh -m torch.distributed.launch` fails to open the module name as a
    // script, so the child prints to stderr and exits non-zero.
    #[cfg(unix)]
    #[test]
    fn json_run_keeps_child_output_off_stdout() {
        let root = std::env::temp_dir().join(format!(
            "pipeseg_cli_json_{}_{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock")
                .as_micros()
        ));
        std::fs::create_dir_all(&root).expect("scratch dir");
        let root_arg = root.display().to_string();
        let cli = Cli::try_parse_from([
            "pipeseg",
            "run",
            "1",
            "29500",
            "--python",
            "sh",
            "--root",
            root_arg.as_str(),
            "--no-preflight",
            "--json",
        ])
        .expect("parse");
        let args = match cli.command {
            Commands::Run(args) => args,
            _ => panic!("expected run"),
        };

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let result = run_training(args, &mut stdout, &mut stderr).expect("run");

        assert!(stdout.is_empty(), "{}", String::from_utf8_lossy(&stdout));
        let mirrored = String::from_utf8_lossy(&stderr);
        assert!(mirrored.contains("torch.distributed.launch"), "{}", mirrored);
        assert_ne!(result.exit_code, 0);

        let payload = result.payload.expect("json payload");
        let line = serde_json::to_string(&payload).expect("serialize");
        let reparsed: Value = serde_json::from_str(&line).expect("single json object");
        assert_eq!(reparsed["command"], "run");
        assert_eq!(reparsed["ok"], false);
        assert_eq!(reparsed["outcome"]["exit_code"], result.exit_code);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn unknown_dataset_is_a_usage_error() {
        assert!(Cli::try_parse_from(["pipeseg", "run", "4", "12345", "--dataset", "lvr"]).is_err());
    }

    #[test]
    fn zero_workers_map_to_config_error_code() {
        let cli = Cli::try_parse_from(["pipeseg", "describe", "0", "12345", "--no-preflight"])
            .expect("parse");
        let args = match cli.command {
            Commands::Describe(args) => args,
            _ => panic!("expected describe"),
        };
        let err = resolve_run_args(args).expect_err("zero workers");
        assert_eq!(error_code(&err), "config_invalid");
    }
}
