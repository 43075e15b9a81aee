use crate::config::BenchConfig;
use crate::script::WorkloadScript;
use crate::{ensure_dir, resolve_command};
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::Instant;
use tracing::{debug, warn};

const SCRIPT_FILE: &str = "script.dsl";

/// Feeds scripts to the engine client. One invocation is one measurement:
/// the clock covers client startup, every round trip, and client exit.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    client: Vec<String>,
    workdir: PathBuf,
    script_path: PathBuf,
}

impl ScriptRunner {
    pub fn new(config: &BenchConfig, scratch_dir: &Path) -> Self {
        Self {
            client: resolve_command(&config.engine.client, &config.engine.dir),
            workdir: config.engine.dir.clone(),
            script_path: scratch_dir.join(SCRIPT_FILE),
        }
    }

    /// Runs `script` through the client and returns the wall-clock time in
    /// microseconds. A client that exits non-zero still yields a time.
    pub fn run(&self, script: &WorkloadScript) -> Result<u64> {
        self.stage(script)?;
        let started = Instant::now();
        let status = self.invoke()?;
        let elapsed_us = started.elapsed().as_micros() as u64;
        if !status.success() {
            warn!(status = %status, statements = script.len(), "client exited abnormally");
        }
        debug!(elapsed_us, statements = script.len(), "script finished");
        Ok(elapsed_us)
    }

    /// Same delivery as `run` without the clock, for control directives.
    pub fn send(&self, script: &WorkloadScript) -> Result<ExitStatus> {
        self.stage(script)?;
        self.invoke()
    }

    fn stage(&self, script: &WorkloadScript) -> Result<()> {
        if let Some(parent) = self.script_path.parent() {
            ensure_dir(parent)?;
        }
        fs::write(&self.script_path, script.to_text())
            .with_context(|| format!("failed to write {}", self.script_path.display()))
    }

    fn invoke(&self) -> Result<ExitStatus> {
        let program = self
            .client
            .first()
            .ok_or_else(|| anyhow!("client command is empty"))?;
        let input = fs::File::open(&self.script_path)
            .with_context(|| format!("failed to open {}", self.script_path.display()))?;
        let status = Command::new(program)
            .args(&self.client[1..])
            .current_dir(&self.workdir)
            .stdin(Stdio::from(input))
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .status()
            .with_context(|| format!("failed to launch client {:?}", self.client))?;
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "colbench_runner_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("temp dir");
        dir
    }

    fn runner_with_client(dir: &Path, client: &[&str]) -> ScriptRunner {
        let mut config = BenchConfig::default();
        config.engine.dir = dir.to_path_buf();
        config.engine.client = client.iter().map(|s| s.to_string()).collect();
        ScriptRunner::new(&config, &dir.join("scratch"))
    }

    #[test]
    fn run_feeds_script_on_stdin() {
        let dir = temp_dir("stdin");
        let runner = runner_with_client(&dir, &["sh", "-c", "cat > received.dsl"]);
        let script = WorkloadScript::from_lines(["s0=select(db1.tbl3.col2,1,2)", "shutdown"]);
        runner.run(&script).expect("run");
        let received = fs::read_to_string(dir.join("received.dsl")).expect("received");
        assert_eq!(received, script.to_text());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn run_times_the_whole_client_lifetime() {
        let dir = temp_dir("timing");
        let runner = runner_with_client(&dir, &["sh", "-c", "cat > /dev/null; sleep 0.2"]);
        let elapsed = runner
            .run(&WorkloadScript::from_lines(["shutdown"]))
            .expect("run");
        assert!(elapsed >= 200_000, "elapsed {}", elapsed);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn abnormal_client_exit_still_yields_a_time() {
        let dir = temp_dir("abnormal");
        let runner = runner_with_client(&dir, &["sh", "-c", "exit 3"]);
        runner
            .run(&WorkloadScript::from_lines(["bogus("]))
            .expect("time recorded");
        let status = runner
            .send(&WorkloadScript::from_lines(["bogus("]))
            .expect("status");
        assert_eq!(status.code(), Some(3));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_client_binary_is_an_error() {
        let dir = temp_dir("missing");
        let runner = runner_with_client(&dir, &["./no_such_client"]);
        assert!(runner.run(&WorkloadScript::from_lines(["shutdown"])).is_err());
        let _ = fs::remove_dir_all(dir);
    }
}
