use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

pub mod config;
pub mod driver;
pub mod params;
pub mod results;
pub mod runner;
pub mod script;
pub mod service;

pub use config::BenchConfig;
pub use driver::{ExperimentDriver, ExperimentKind, Phase};
use params::PatchRecord;

#[derive(Debug)]
pub struct RunResult {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub experiment: ExperimentKind,
    pub outputs: Vec<PathBuf>,
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("failed to create {}", path.display()))
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Anchors a path-like program (`./server`, `bin/client`) to `dir` so it can
/// be spawned from any working directory. Bare names stay on `PATH`.
pub fn resolve_command(command: &[String], dir: &Path) -> Vec<String> {
    let mut resolved = command.to_vec();
    if let Some(program) = resolved.first_mut() {
        let p = Path::new(program.as_str());
        if p.is_relative() && program.contains('/') {
            let base = if dir.is_absolute() {
                dir.to_path_buf()
            } else {
                std::env::current_dir()
                    .map(|cwd| cwd.join(dir))
                    .unwrap_or_else(|_| dir.to_path_buf())
            };
            *program = normalize_path(&base.join(p)).to_string_lossy().to_string();
        }
    }
    resolved
}

fn manifest_path(run_dir: &Path) -> PathBuf {
    run_dir.join("manifest.json")
}

struct RunStatus<'a> {
    status: &'a str,
    outputs: &'a [PathBuf],
    patches: &'a [PatchRecord],
    error: Option<String>,
    binary_stale: bool,
}

fn write_run_manifest(
    run_dir: &Path,
    run_id: &str,
    experiment: ExperimentKind,
    config_digest: &str,
    state: RunStatus<'_>,
) -> Result<()> {
    let payload = json!({
        "schema_version": "colbench_manifest_v1",
        "run_id": run_id,
        "experiment": experiment.number(),
        "experiment_name": experiment.as_str(),
        "status": state.status,
        "config_digest": config_digest,
        "outputs": state
            .outputs
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect::<Vec<_>>(),
        "patches": state.patches,
        "error": state.error,
        "engine_binary_stale": state.binary_stale,
        "runner_version": env!("CARGO_PKG_VERSION"),
        "updated_at": Utc::now().to_rfc3339(),
    });
    atomic_write_json_pretty(&manifest_path(run_dir), &payload)
}

/// Marks the run `failed` unless it is explicitly completed, so a panic or an
/// early return never leaves a manifest stuck at `running`.
struct RunStatusGuard {
    run_dir: PathBuf,
    run_id: String,
    experiment: ExperimentKind,
    config_digest: String,
    done: bool,
}

impl RunStatusGuard {
    fn new(run_dir: &Path, run_id: &str, experiment: ExperimentKind, config_digest: &str) -> Self {
        Self {
            run_dir: run_dir.to_path_buf(),
            run_id: run_id.to_string(),
            experiment,
            config_digest: config_digest.to_string(),
            done: false,
        }
    }

    fn write(&self, state: RunStatus<'_>) -> Result<()> {
        write_run_manifest(
            &self.run_dir,
            &self.run_id,
            self.experiment,
            &self.config_digest,
            state,
        )
    }

    fn complete(&mut self, outputs: &[PathBuf], driver: &ExperimentDriver) -> Result<()> {
        self.write(RunStatus {
            status: "completed",
            outputs,
            patches: driver.patch_log(),
            error: None,
            binary_stale: driver.binary_stale(),
        })?;
        self.done = true;
        Ok(())
    }

    fn fail(&mut self, err: &anyhow::Error, driver: &ExperimentDriver) {
        let _ = self.write(RunStatus {
            status: "failed",
            outputs: &[],
            patches: driver.patch_log(),
            error: Some(format!("{:#}", err)),
            binary_stale: driver.binary_stale(),
        });
        self.done = true;
    }
}

impl Drop for RunStatusGuard {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.write(RunStatus {
                status: "failed",
                outputs: &[],
                patches: &[],
                error: None,
                binary_stale: false,
            });
        }
    }
}

/// Runs one experiment end to end. Result files land in `results_dir`; the
/// run's manifest, resolved config and scratch scripts under
/// `results_dir/runs/<run_id>`.
pub fn run_experiment(kind: ExperimentKind, config: &BenchConfig) -> Result<RunResult> {
    config.validate()?;
    let run_id = format!(
        "run_{}_{}",
        Utc::now().format("%Y%m%d_%H%M%S_%6f"),
        std::process::id()
    );
    let runs_dir = config.results_dir.join("runs");
    ensure_dir(&runs_dir)?;
    let run_dir = runs_dir.join(&run_id);
    fs::create_dir(&run_dir)
        .with_context(|| format!("failed to create run directory {}", run_dir.display()))?;

    let config_digest = config.digest()?;
    atomic_write_json_pretty(
        &run_dir.join("resolved_config.json"),
        &serde_json::to_value(config)?,
    )?;
    atomic_write_bytes(
        &run_dir.join("resolved_config.digest"),
        config_digest.as_bytes(),
    )?;
    let mut guard = RunStatusGuard::new(&run_dir, &run_id, kind, &config_digest);
    guard.write(RunStatus {
        status: "running",
        outputs: &[],
        patches: &[],
        error: None,
        binary_stale: false,
    })?;

    let mut driver = ExperimentDriver::new(config.clone(), &run_dir.join("scratch"));
    match driver.run(kind) {
        Ok(outputs) => {
            guard.complete(&outputs, &driver)?;
            Ok(RunResult {
                run_id,
                run_dir,
                experiment: kind,
                outputs,
            })
        }
        Err(err) => {
            guard.fail(&err, &driver);
            Err(err)
        }
    }
}
