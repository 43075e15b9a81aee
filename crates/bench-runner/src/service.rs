use crate::config::{BenchConfig, ReadinessConfig, ReadinessMode};
use crate::params::replace_literal_in_file;
use crate::resolve_command;
use crate::runner::ScriptRunner;
use crate::script::WorkloadScript;
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

const EXIT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{step} failed: {status}")]
    BuildFailed { step: &'static str, status: String },
    #[error("server exited during startup: {0}")]
    StartFailed(String),
    #[error("server not ready after {attempts} probes of {socket}")]
    NotReady { attempts: u32, socket: PathBuf },
    #[error("server already running (pid {0})")]
    AlreadyRunning(u32),
    #[error("no running server to execute scripts against")]
    NotRunning,
    #[error("invalid phase transition {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    AlreadyStopped,
    Graceful,
    Forced,
}

#[cfg(unix)]
fn probe_socket(path: &Path) -> bool {
    std::os::unix::net::UnixStream::connect(path).is_ok()
}

#[cfg(not(unix))]
fn probe_socket(path: &Path) -> bool {
    path.exists()
}

/// Builds the engine and owns its server process. At most one server is
/// alive per controller; dropping the controller terminates it.
pub struct ServiceController {
    engine_dir: PathBuf,
    clean_cmd: Vec<String>,
    build_cmd: Vec<String>,
    server_cmd: Vec<String>,
    server_log: PathBuf,
    socket: PathBuf,
    shutdown: WorkloadScript,
    readiness: ReadinessConfig,
    client: ScriptRunner,
    child: Option<Child>,
    state: ServiceState,
}

impl ServiceController {
    pub fn new(config: &BenchConfig, client: ScriptRunner) -> Self {
        let dir = &config.engine.dir;
        Self {
            engine_dir: dir.clone(),
            clean_cmd: resolve_command(&config.engine.clean, dir),
            build_cmd: resolve_command(&config.engine.build, dir),
            server_cmd: resolve_command(&config.engine.server, dir),
            server_log: config.engine_path(&config.engine.server_log),
            socket: config.engine_path(&config.engine.socket_path),
            shutdown: WorkloadScript::from_lines([config.engine.shutdown_directive.clone()]),
            readiness: config.readiness.clone(),
            client,
            child: None,
            state: ServiceState::Stopped,
        }
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(|c| c.id())
    }

    /// Liveness check on the owned process; reaps it if it has exited.
    pub fn is_running(&mut self) -> bool {
        let exited = match self.child.as_mut() {
            None => return false,
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => Some(status.to_string()),
                Ok(None) => None,
                Err(err) => Some(err.to_string()),
            },
        };
        match exited {
            None => true,
            Some(status) => {
                debug!(status = %status, "server process has exited");
                self.child = None;
                self.state = ServiceState::Stopped;
                false
            }
        }
    }

    pub fn clean(&self) -> Result<()> {
        self.run_quiet("clean", &self.clean_cmd)
    }

    pub fn build(&self) -> Result<()> {
        self.run_quiet("build", &self.build_cmd)
    }

    fn run_quiet(&self, step: &'static str, command: &[String]) -> Result<()> {
        let program = command
            .first()
            .ok_or_else(|| anyhow!("{} command is empty", step))?;
        info!(step, command = ?command, "running engine build step");
        let status = Command::new(program)
            .args(&command[1..])
            .current_dir(&self.engine_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .with_context(|| format!("failed to launch {} command {:?}", step, command))?;
        if !status.success() {
            return Err(LifecycleError::BuildFailed {
                step,
                status: status.to_string(),
            }
            .into());
        }
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(LifecycleError::AlreadyRunning(self.pid().unwrap_or_default()).into());
        }
        let program = self
            .server_cmd
            .first()
            .ok_or_else(|| anyhow!("server command is empty"))?;
        let log = fs::File::create(&self.server_log)
            .with_context(|| format!("failed to create {}", self.server_log.display()))?;
        let log_err = log.try_clone()?;
        self.state = ServiceState::Starting;
        let child = Command::new(program)
            .args(&self.server_cmd[1..])
            .current_dir(&self.engine_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(err) => {
                self.state = ServiceState::Stopped;
                return Err(anyhow::Error::from(err)
                    .context(format!("failed to launch server {:?}", self.server_cmd)));
            }
        };
        info!(pid = child.id(), "server launched");
        self.child = Some(child);
        if let Err(err) = self.wait_ready() {
            self.stop_forced()?;
            return Err(err);
        }
        self.state = ServiceState::Running;
        Ok(())
    }

    fn exit_status(&mut self) -> Option<String> {
        match self.child.as_mut().map(|c| c.try_wait()) {
            Some(Ok(Some(status))) => Some(status.to_string()),
            Some(Err(err)) => Some(err.to_string()),
            Some(Ok(None)) => None,
            None => Some("no process".to_string()),
        }
    }

    fn wait_ready(&mut self) -> Result<()> {
        match self.readiness.mode {
            ReadinessMode::Settle => {
                thread::sleep(Duration::from_millis(self.readiness.settle_ms));
                if let Some(status) = self.exit_status() {
                    return Err(LifecycleError::StartFailed(status).into());
                }
                Ok(())
            }
            ReadinessMode::Probe => {
                let interval = Duration::from_millis(self.readiness.interval_ms);
                for attempt in 1..=self.readiness.attempts {
                    if let Some(status) = self.exit_status() {
                        return Err(LifecycleError::StartFailed(status).into());
                    }
                    if probe_socket(&self.socket) {
                        debug!(attempt, "server accepted readiness probe");
                        return Ok(());
                    }
                    thread::sleep(interval);
                }
                Err(LifecycleError::NotReady {
                    attempts: self.readiness.attempts,
                    socket: self.socket.clone(),
                }
                .into())
            }
        }
    }

    fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_running() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(EXIT_POLL);
        }
    }

    fn grace(&self) -> Duration {
        Duration::from_millis(self.readiness.stop_grace_ms)
    }

    /// Sends the shutdown directive through the client and waits for the
    /// server to exit, killing it once the grace period runs out.
    pub fn stop(&mut self) -> Result<StopOutcome> {
        if !self.is_running() {
            self.state = ServiceState::Stopped;
            return Ok(StopOutcome::AlreadyStopped);
        }
        self.state = ServiceState::Stopping;
        if let Err(err) = self.client.send(&self.shutdown) {
            warn!(error = %err, "failed to deliver shutdown directive");
        }
        if self.wait_for_exit(self.grace()) {
            info!("server stopped");
            return Ok(StopOutcome::Graceful);
        }
        warn!("server ignored shutdown directive, terminating");
        self.stop_forced()?;
        Ok(StopOutcome::Forced)
    }

    pub fn stop_forced(&mut self) -> Result<StopOutcome> {
        let outcome = match self.child.take() {
            None => StopOutcome::AlreadyStopped,
            Some(mut child) => {
                if child.try_wait()?.is_none() {
                    if let Err(err) = child.kill() {
                        if err.kind() != std::io::ErrorKind::InvalidInput {
                            return Err(err.into());
                        }
                    }
                }
                child.wait()?;
                StopOutcome::Forced
            }
        };
        self.state = ServiceState::Stopped;
        Ok(outcome)
    }

    /// For a server already told to shut down by the script it just ran.
    pub fn await_exit(&mut self) -> Result<StopOutcome> {
        if !self.is_running() {
            self.state = ServiceState::Stopped;
            return Ok(StopOutcome::Graceful);
        }
        self.state = ServiceState::Stopping;
        if self.wait_for_exit(self.grace()) {
            return Ok(StopOutcome::Graceful);
        }
        warn!("server did not exit after in-script shutdown, terminating");
        self.stop_forced()
    }

    /// Literal substitution of `old` by `new` in an engine source file, then a
    /// build. The file is left untouched when `old` is absent.
    ///
    /// Untracked: nothing records the previous value or restores it. Sweeps go
    /// through `ParameterPatcher`, which refuses a missing literal instead.
    pub fn patch_and_rebuild(&self, file: &Path, old: &str, new: &str) -> Result<usize> {
        let path = if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.engine_dir.join(file)
        };
        let occurrences = replace_literal_in_file(&path, old, new)?;
        if occurrences == 0 {
            debug!(file = %path.display(), old, "literal not present, source unchanged");
        }
        self.build()?;
        Ok(occurrences)
    }
}

impl Drop for ServiceController {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensure_dir;
    use chrono::Utc;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "colbench_service_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("temp dir");
        dir
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn fake_config(dir: &Path) -> BenchConfig {
        let mut config = BenchConfig::default();
        config.engine.dir = dir.to_path_buf();
        config.engine.clean = vec!["true".to_string()];
        config.engine.build = vec!["true".to_string()];
        config.engine.server = vec!["sleep".to_string(), "30".to_string()];
        config.engine.client = sh("cat > /dev/null");
        config.readiness.mode = ReadinessMode::Settle;
        config.readiness.settle_ms = 0;
        config.readiness.stop_grace_ms = 200;
        config
    }

    fn controller(config: &BenchConfig, dir: &Path) -> ServiceController {
        ServiceController::new(config, ScriptRunner::new(config, &dir.join("scratch")))
    }

    #[test]
    fn stop_is_idempotent_without_a_server() {
        let dir = temp_dir("idle_stop");
        let mut svc = controller(&fake_config(&dir), &dir);
        assert_eq!(svc.stop().expect("first"), StopOutcome::AlreadyStopped);
        assert_eq!(svc.stop().expect("second"), StopOutcome::AlreadyStopped);
        assert_eq!(svc.stop_forced().expect("forced"), StopOutcome::AlreadyStopped);
        assert_eq!(svc.state(), ServiceState::Stopped);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn stubborn_server_is_forced_down_then_stop_is_noop() {
        let dir = temp_dir("forced");
        let mut svc = controller(&fake_config(&dir), &dir);
        svc.start().expect("start");
        assert_eq!(svc.state(), ServiceState::Running);
        assert!(svc.is_running());
        let err = svc.start().expect_err("second start");
        assert!(err.to_string().contains("already running"), "{}", err);
        assert_eq!(svc.stop().expect("stop"), StopOutcome::Forced);
        assert!(!svc.is_running());
        assert_eq!(svc.stop().expect("stop again"), StopOutcome::AlreadyStopped);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn shutdown_directive_reaches_the_server() {
        let dir = temp_dir("graceful");
        let mut config = fake_config(&dir);
        config.engine.server = sh("while [ ! -s directive ]; do sleep 0.05; done");
        config.engine.client = sh("cat > directive");
        config.readiness.stop_grace_ms = 5_000;
        let mut svc = controller(&config, &dir);
        svc.start().expect("start");
        assert_eq!(svc.stop().expect("stop"), StopOutcome::Graceful);
        let directive = fs::read_to_string(dir.join("directive")).expect("directive");
        assert_eq!(directive, "shutdown\n");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn server_that_dies_during_settle_fails_start() {
        let dir = temp_dir("dies");
        let mut config = fake_config(&dir);
        config.engine.server = sh("exit 1");
        config.readiness.settle_ms = 200;
        let mut svc = controller(&config, &dir);
        let err = svc.start().expect_err("start should fail");
        assert!(err.to_string().contains("exited during startup"), "{}", err);
        assert_eq!(svc.state(), ServiceState::Stopped);
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn probe_waits_for_socket() {
        let dir = temp_dir("probe");
        let mut config = fake_config(&dir);
        config.readiness.mode = ReadinessMode::Probe;
        config.readiness.attempts = 3;
        config.readiness.interval_ms = 10;
        config.engine.socket_path = PathBuf::from("engine.sock");

        let mut svc = controller(&config, &dir);
        let err = svc.start().expect_err("no socket yet");
        assert!(err.to_string().contains("not ready"), "{}", err);
        assert!(!svc.is_running());

        let _listener =
            std::os::unix::net::UnixListener::bind(dir.join("engine.sock")).expect("bind");
        svc.start().expect("socket accepts");
        svc.stop_forced().expect("stop");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn failing_build_is_reported() {
        let dir = temp_dir("build_fail");
        let mut config = fake_config(&dir);
        config.engine.build = vec!["false".to_string()];
        let svc = controller(&config, &dir);
        let err = svc.build().expect_err("build fails");
        assert!(err.to_string().contains("build failed"), "{}", err);
        svc.clean().expect("clean still fine");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn patch_and_rebuild_without_match_keeps_source() {
        let dir = temp_dir("patch_noop");
        let svc = controller(&fake_config(&dir), &dir);
        let src = "int query_chunk_size = 6;\n";
        fs::write(dir.join("db_operator.c"), src).expect("write");
        let n = svc
            .patch_and_rebuild(
                Path::new("db_operator.c"),
                "query_chunk_size = 4",
                "query_chunk_size = 8",
            )
            .expect("patch");
        assert_eq!(n, 0);
        assert_eq!(fs::read_to_string(dir.join("db_operator.c")).expect("read"), src);

        let n = svc
            .patch_and_rebuild(
                Path::new("db_operator.c"),
                "query_chunk_size = 6",
                "query_chunk_size = 8",
            )
            .expect("patch");
        assert_eq!(n, 1);
        assert_eq!(
            fs::read_to_string(dir.join("db_operator.c")).expect("read"),
            "int query_chunk_size = 8;\n"
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn await_exit_handles_self_terminating_server() {
        let dir = temp_dir("await");
        let mut config = fake_config(&dir);
        config.engine.server = sh("sleep 0.1");
        config.readiness.stop_grace_ms = 5_000;
        let mut svc = controller(&config, &dir);
        svc.start().expect("start");
        assert_eq!(svc.await_exit().expect("await"), StopOutcome::Graceful);
        assert_eq!(svc.state(), ServiceState::Stopped);
        let _ = fs::remove_dir_all(dir);
    }
}
