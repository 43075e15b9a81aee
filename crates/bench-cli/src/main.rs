use anyhow::Result;
use bench_runner::{BenchConfig, ExperimentKind, RunResult};
use clap::Parser;
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "colbench", version, about = "Column-store engine benchmark runner")]
struct Cli {
    /// 1 chunk size, 2 shared vs individual scans, 3 B-tree node size,
    /// 4 index comparison, 5 join strategy, 6 partition count.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=6))]
    experiment: u8,
    /// Harness config (YAML). Defaults to ./colbench.yaml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let json_mode = cli.json;
    match run(cli) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("run_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run(cli: Cli) -> Result<Option<Value>> {
    let kind = ExperimentKind::from_number(cli.experiment)?;
    let config = BenchConfig::resolve(cli.config.as_deref())?;
    let result = bench_runner::run_experiment(kind, &config)?;
    if cli.json {
        return Ok(Some(json!({
            "ok": true,
            "command": "run",
            "run": run_result_to_json(&result),
            "results_dir": config.results_dir.display().to_string(),
        })));
    }
    println!("experiment: {} ({})", kind.number(), kind.as_str());
    println!("run_id: {}", result.run_id);
    println!("run_dir: {}", result.run_dir.display());
    for output in &result.outputs {
        println!("output: {}", output.display());
    }
    Ok(None)
}

fn run_result_to_json(result: &RunResult) -> Value {
    json!({
        "run_id": result.run_id,
        "run_dir": result.run_dir.display().to_string(),
        "experiment": result.experiment.number(),
        "experiment_name": result.experiment.as_str(),
        "outputs": result
            .outputs
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>(),
    })
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn experiment_flag_defaults_to_one_and_is_bounded() {
        let cli = Cli::try_parse_from(["colbench"]).expect("parse");
        assert_eq!(cli.experiment, 1);
        assert!(!cli.json);
        assert!(cli.config.is_none());
        let cli = Cli::try_parse_from(["colbench", "--experiment", "6", "--json"]).expect("parse");
        assert_eq!(cli.experiment, 6);
        assert!(cli.json);
        assert!(Cli::try_parse_from(["colbench", "--experiment", "7"]).is_err());
        assert!(Cli::try_parse_from(["colbench", "--experiment", "0"]).is_err());
    }

    #[test]
    fn error_envelope_shape() {
        let v = json_error("run_failed", "build failed".to_string(), json!({}));
        assert_eq!(v["ok"], false);
        assert_eq!(v["error"]["code"], "run_failed");
        assert_eq!(v["error"]["message"], "build failed");
    }
}
