use crate::config::{LaunchOptions, LaunchParams, RunConfig};
use crate::error::{LaunchError, Result};
use crate::paths::{preflight, ResolvedPaths};
use crate::tee::{pump, TeeWriter};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

pub const DISTRIBUTED_LAUNCH_MODULE: &str = "torch.distributed.launch";
pub const MANIFEST_FILE_NAME: &str = "launch.json";

/// A fully resolved invocation of the distributed training wrapper.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub log_file: PathBuf,
}

impl LaunchSpec {
    pub fn build(
        cfg: &RunConfig,
        params: LaunchParams,
        paths: &ResolvedPaths,
        options: &LaunchOptions,
    ) -> Self {
        let args = vec![
            "-m".to_string(),
            DISTRIBUTED_LAUNCH_MODULE.to_string(),
            format!("--nproc_per_node={}", params.nproc),
            format!("--master_addr={}", options.master_addr),
            format!("--master_port={}", params.port),
            cfg.method.script(),
            "--config".to_string(),
            path_arg(&paths.config),
            "--labeled-id-path".to_string(),
            path_arg(&paths.labeled),
            "--unlabeled-id-path".to_string(),
            path_arg(&paths.unlabeled),
            "--save-path".to_string(),
            path_arg(&paths.save_dir),
            "--port".to_string(),
            params.port.to_string(),
        ];
        Self {
            program: options.python.clone(),
            args,
            cwd: options.root.clone(),
            log_file: paths.log_file.clone(),
        }
    }

    /// Shell-equivalent command line, for display and the manifest.
    pub fn command_line(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(self.args.iter().cloned());
        shell_join(&parts)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.current_dir(&self.cwd);
        cmd.stdin(Stdio::inherit());
        cmd
    }
}

/// Everything a dry run reports, without touching the filesystem.
#[derive(Clone, Debug, Serialize)]
pub struct LaunchPlan {
    pub config: RunConfig,
    pub params: LaunchParams,
    pub paths: ResolvedPaths,
    pub spec: LaunchSpec,
}

impl LaunchPlan {
    pub fn command_line(&self) -> String {
        self.spec.command_line()
    }
}

#[derive(Clone, Debug)]
pub struct LaunchOutcome {
    /// `None` when the child was terminated by a signal.
    pub exit_code: Option<i32>,
    pub save_dir: PathBuf,
    pub log_file: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl LaunchOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Resolve paths and build the invocation; runs preflight when enabled.
pub fn plan_launch(
    cfg: &RunConfig,
    params: LaunchParams,
    options: &LaunchOptions,
) -> Result<LaunchPlan> {
    let paths = ResolvedPaths::resolve(cfg);
    if options.preflight {
        preflight(&options.root, cfg, &paths)?;
    }
    let spec = LaunchSpec::build(cfg, params, &paths, options);
    Ok(LaunchPlan {
        config: cfg.clone(),
        params,
        paths,
        spec,
    })
}

/// Launch the training run, mirroring its output to `terminal`.
pub fn launch_with_terminal<W: Write>(
    cfg: &RunConfig,
    params: LaunchParams,
    options: &LaunchOptions,
    terminal: W,
) -> Result<LaunchOutcome> {
    let plan = plan_launch(cfg, params, options)?;
    run_plan(&plan, options, terminal)
}

/// Create the output directory, start the planned process and tee its
/// output until it exits. The child's exit status is returned uninterpreted.
pub fn run_plan<W: Write>(
    plan: &LaunchPlan,
    options: &LaunchOptions,
    terminal: W,
) -> Result<LaunchOutcome> {
    let cfg = &plan.config;
    let params = plan.params;
    info!(
        dataset = %cfg.dataset,
        method = %cfg.method,
        exp = %cfg.experiment_tag,
        split = %cfg.split,
        nproc = params.nproc,
        port = params.port,
        "resolved training run"
    );

    let save_dir = options.root.join(&plan.paths.save_dir);
    fs::create_dir_all(&save_dir).map_err(|source| LaunchError::CreateDir {
        path: save_dir.clone(),
        source,
    })?;

    let log_path = options.root.join(&plan.paths.log_file);
    let mut log = File::create(&log_path).map_err(|source| LaunchError::Log {
        path: log_path.clone(),
        source,
    })?;

    debug!(command = %plan.command_line(), "spawning distributed launcher");
    let started_at = Utc::now();
    // One pipe for both streams, as with `2>&1 |`, so the log keeps the
    // child's write order.
    let (reader, writer) = io::pipe().map_err(|source| LaunchError::Spawn {
        program: plan.spec.program.clone(),
        source,
    })?;
    let spawned = writer.try_clone().and_then(|stderr_writer| {
        let mut cmd = plan.spec.command();
        cmd.stdout(writer);
        cmd.stderr(stderr_writer);
        cmd.spawn()
    });
    let mut child = match spawned {
        Ok(child) => child,
        Err(source) => {
            let _ = writeln!(log, "failed to start '{}': {}", plan.spec.program, source);
            return Err(LaunchError::Spawn {
                program: plan.spec.program.clone(),
                source,
            });
        }
    };
    info!(pid = child.id(), log = %log_path.display(), "training run started");

    let mut tee = TeeWriter::new(log, terminal);
    let pumped = pump(reader, &mut tee);

    let status = child.wait().map_err(LaunchError::Wait)?;
    if let Some(e) = tee.secondary_error() {
        warn!(error = %e, "terminal mirror stopped; output kept going to the log");
    }
    pumped.map_err(|source| LaunchError::Log {
        path: log_path.clone(),
        source,
    })?;
    let finished_at = Utc::now();

    let outcome = LaunchOutcome {
        exit_code: status.code(),
        save_dir,
        log_file: log_path,
        started_at,
        finished_at,
    };
    info!(exit_code = ?outcome.exit_code, "training run finished");

    let manifest_path = outcome.save_dir.join(MANIFEST_FILE_NAME);
    let manifest = manifest_json(plan, options, &outcome);
    if let Err(e) = atomic_write_json_pretty(&manifest_path, &manifest) {
        warn!(path = %manifest_path.display(), error = %e, "failed to write launch manifest");
    }
    Ok(outcome)
}

fn manifest_json(plan: &LaunchPlan, options: &LaunchOptions, outcome: &LaunchOutcome) -> Value {
    json!({
        "schema_version": "launch_manifest_v1",
        "run": {
            "dataset": plan.config.dataset.as_str(),
            "method": plan.config.method.as_str(),
            "experiment_tag": plan.config.experiment_tag,
            "split": plan.config.split,
        },
        "paths": {
            "config": path_arg(&plan.paths.config),
            "labeled": path_arg(&plan.paths.labeled),
            "unlabeled": path_arg(&plan.paths.unlabeled),
            "save_dir": path_arg(&plan.paths.save_dir),
            "log_file": path_arg(&plan.paths.log_file),
        },
        "nproc": plan.params.nproc,
        "port": plan.params.port,
        "master_addr": options.master_addr,
        "program": plan.spec.program,
        "args": plan.spec.args,
        "command": plan.command_line(),
        "started_at": outcome.started_at.to_rfc3339(),
        "finished_at": outcome.finished_at.to_rfc3339(),
        "exit_code": outcome.exit_code,
    })
}

fn atomic_write_json_pretty(path: &Path, value: &Value) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=%".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
