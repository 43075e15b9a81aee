use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "colbench.yaml";

/// Resolved harness configuration. Every section falls back to defaults that
/// match the engine's stock checkout, so an empty file is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub engine: EngineConfig,
    pub readiness: ReadinessConfig,
    pub parameters: BTreeMap<String, ParameterDef>,
    pub workload: WorkloadConfig,
    pub results_dir: PathBuf,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            readiness: ReadinessConfig::default(),
            parameters: default_parameters(),
            workload: WorkloadConfig::default(),
            results_dir: PathBuf::from("results"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory the build, server and client commands run in.
    pub dir: PathBuf,
    pub clean: Vec<String>,
    pub build: Vec<String>,
    pub server: Vec<String>,
    pub client: Vec<String>,
    pub server_log: PathBuf,
    pub socket_path: PathBuf,
    pub shutdown_directive: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            clean: vec!["make".to_string(), "clean".to_string()],
            build: vec!["make".to_string()],
            server: vec!["./server".to_string()],
            client: vec!["./client".to_string()],
            server_log: PathBuf::from("server.out"),
            socket_path: PathBuf::from("cs165_unix_socket"),
            shutdown_directive: "shutdown".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessMode {
    /// Poll the engine socket until a connection succeeds.
    Probe,
    /// Sleep a fixed interval, then check the server is still alive.
    Settle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub mode: ReadinessMode,
    pub attempts: u32,
    pub interval_ms: u64,
    pub settle_ms: u64,
    pub stop_grace_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            mode: ReadinessMode::Probe,
            attempts: 50,
            interval_ms: 100,
            settle_ms: 1000,
            stop_grace_ms: 10_000,
        }
    }
}

/// A source-level engine constant. `template` holds the literal text as it
/// appears in `file`, with `{value}` marking where the value sits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterDef {
    pub file: PathBuf,
    pub template: String,
    pub baseline: String,
}

impl ParameterDef {
    pub fn render(&self, value: &str) -> String {
        self.template.replace("{value}", value)
    }
}

fn default_parameters() -> BTreeMap<String, ParameterDef> {
    let mut out = BTreeMap::new();
    let mut add = |name: &str, file: &str, template: &str, baseline: &str| {
        out.insert(
            name.to_string(),
            ParameterDef {
                file: PathBuf::from(file),
                template: template.to_string(),
                baseline: baseline.to_string(),
            },
        );
    };
    add("chunk_size", "db_operator.c", "query_chunk_size = {value}", "6");
    add("fanout", "include/cs165_api.h", "FANOUT {value}", "340");
    add("leaf_size", "include/cs165_api.h", "LEAF_SIZE {value}", "508");
    add("partitions", "db_operator.c", "num_partitions = {value}", "256");
    out
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    pub db: String,
    pub data_dir: PathBuf,
    pub batch_data: String,
    pub select_data: String,
    pub join_left_data: String,
    pub join_right_data: String,
    pub seed: Option<u64>,
    pub scan_steps: usize,
    pub scan_domain_max: i64,
    pub selectivity_steps: usize,
    pub join_steps: usize,
    pub btree_rows: Vec<u64>,
    pub inter_run_pause_ms: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            db: "db1".to_string(),
            data_dir: PathBuf::from("project_tests_1M"),
            batch_data: "data3_batch.csv".to_string(),
            select_data: "data3.csv".to_string(),
            join_left_data: "data3.csv".to_string(),
            join_right_data: "data4.csv".to_string(),
            seed: None,
            scan_steps: 100,
            scan_domain_max: 50_000,
            selectivity_steps: 100,
            join_steps: 10,
            btree_rows: vec![200_000, 400_000, 600_000, 800_000, 1_000_000],
            inter_run_pause_ms: 0,
        }
    }
}

impl WorkloadConfig {
    pub fn data_path(&self, file: &str) -> PathBuf {
        self.data_dir.join(file)
    }
}

impl BenchConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: BenchConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` when given, else `colbench.yaml` in the working directory
    /// if it exists, else the built-in defaults.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::load(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let commands = [
            ("engine.clean", &self.engine.clean),
            ("engine.build", &self.engine.build),
            ("engine.server", &self.engine.server),
            ("engine.client", &self.engine.client),
        ];
        let mut problems = Vec::new();
        for (field, command) in commands {
            if command.is_empty() {
                problems.push(format!("{} must not be empty", field));
            }
        }
        for (name, def) in &self.parameters {
            if !def.template.contains("{value}") {
                problems.push(format!(
                    "parameters.{}.template must contain {{value}}",
                    name
                ));
            }
        }
        if self.workload.scan_steps == 0 {
            problems.push("workload.scan_steps must be > 0".to_string());
        }
        if self.workload.selectivity_steps == 0 {
            problems.push("workload.selectivity_steps must be > 0".to_string());
        }
        if self.workload.join_steps == 0 {
            problems.push("workload.join_steps must be > 0".to_string());
        }
        if self.readiness.mode == ReadinessMode::Probe && self.readiness.attempts == 0 {
            problems.push("readiness.attempts must be > 0 in probe mode".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "invalid config:\n{}",
                problems
                    .iter()
                    .map(|p| format!("  - {}", p))
                    .collect::<Vec<_>>()
                    .join("\n")
            ))
        }
    }

    pub fn engine_path(&self, relative: &Path) -> PathBuf {
        if relative.is_absolute() {
            relative.to_path_buf()
        } else {
            self.engine.dir.join(relative)
        }
    }

    pub fn digest(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(format!("sha256:{}", hex::encode(Sha256::digest(&bytes))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_yields_defaults() {
        let config: BenchConfig = serde_yaml::from_str("{}").expect("parse");
        assert_eq!(config.engine.build, vec!["make".to_string()]);
        assert_eq!(config.workload.scan_steps, 100);
        assert_eq!(config.parameters.len(), 4);
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let yaml = "\
engine:
  dir: /opt/engine
workload:
  seed: 7
  join_steps: 3
";
        let config: BenchConfig = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(config.engine.dir, PathBuf::from("/opt/engine"));
        assert_eq!(config.engine.client, vec!["./client".to_string()]);
        assert_eq!(config.workload.seed, Some(7));
        assert_eq!(config.workload.join_steps, 3);
        assert_eq!(config.workload.selectivity_steps, 100);
    }

    #[test]
    fn validate_reports_every_problem() {
        let mut config = BenchConfig::default();
        config.engine.server.clear();
        config.workload.join_steps = 0;
        config.parameters.insert(
            "bogus".to_string(),
            ParameterDef {
                file: PathBuf::from("x.c"),
                template: "X 1".to_string(),
                baseline: "1".to_string(),
            },
        );
        let msg = config.validate().expect_err("invalid").to_string();
        assert!(msg.contains("engine.server"), "{}", msg);
        assert!(msg.contains("workload.join_steps"), "{}", msg);
        assert!(msg.contains("parameters.bogus.template"), "{}", msg);
    }

    #[test]
    fn parameter_template_renders_value() {
        let config = BenchConfig::default();
        let chunk = &config.parameters["chunk_size"];
        assert_eq!(chunk.render("8"), "query_chunk_size = 8");
        assert_eq!(chunk.render(&chunk.baseline), "query_chunk_size = 6");
    }

    #[test]
    fn digest_changes_with_content() {
        let a = BenchConfig::default();
        let mut b = BenchConfig::default();
        b.workload.seed = Some(1);
        assert_eq!(a.digest().expect("digest"), a.digest().expect("digest"));
        assert_ne!(a.digest().expect("digest"), b.digest().expect("digest"));
    }
}
