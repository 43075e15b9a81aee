use crate::atomic_write_bytes;
use crate::config::{BenchConfig, ParameterDef};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("unknown engine parameter: {0}")]
    UnknownParameter(String),
    #[error("parameter {parameter}: literal '{literal}' not found in {file}")]
    LiteralNotFound {
        parameter: String,
        literal: String,
        file: PathBuf,
    },
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Replaces every whole-token occurrence of `old` with `new`. A match glued to
/// a neighbouring identifier character (`FANOUT 42` inside `FANOUT 420`) is left alone.
pub fn replace_literal(haystack: &str, old: &str, new: &str) -> (String, usize) {
    if old.is_empty() {
        return (haystack.to_string(), 0);
    }
    let guard_start = old.chars().next().map(is_ident_char).unwrap_or(false);
    let guard_end = old.chars().last().map(is_ident_char).unwrap_or(false);

    let mut out = String::with_capacity(haystack.len());
    let mut cursor = 0;
    let mut count = 0;
    for (idx, _) in haystack.match_indices(old) {
        if idx < cursor {
            continue;
        }
        let end = idx + old.len();
        let before_ok = !guard_start
            || haystack[..idx]
                .chars()
                .next_back()
                .map(|c| !is_ident_char(c))
                .unwrap_or(true);
        let after_ok = !guard_end
            || haystack[end..]
                .chars()
                .next()
                .map(|c| !is_ident_char(c))
                .unwrap_or(true);
        if before_ok && after_ok {
            out.push_str(&haystack[cursor..idx]);
            out.push_str(new);
            cursor = end;
            count += 1;
        }
    }
    out.push_str(&haystack[cursor..]);
    (out, count)
}

/// Substitutes `old` with `new` in `path`. Leaves the file untouched and
/// returns 0 when `old` does not occur.
pub fn replace_literal_in_file(path: &Path, old: &str, new: &str) -> Result<usize> {
    let src = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let (patched, count) = replace_literal(&src, old, new);
    if count > 0 && patched != src {
        atomic_write_bytes(path, patched.as_bytes())?;
    }
    Ok(count)
}

fn file_digest(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(format!("sha256:{}", hex::encode(Sha256::digest(&bytes))))
}

#[derive(Debug, Clone, Serialize)]
pub struct PatchRecord {
    pub parameter: String,
    pub file: String,
    pub from: String,
    pub to: String,
    pub occurrences: usize,
    pub digest_before: String,
    pub digest_after: String,
    pub at: String,
}

#[derive(Debug, Clone)]
pub struct EngineParameter {
    pub name: String,
    pub def: ParameterDef,
    pub current: String,
}

/// Owns the engine's source constants for the duration of an experiment.
/// Values are tracked here so callers never pass the previous literal, and
/// anything changed is put back to baseline on `restore_baseline` or drop.
pub struct ParameterPatcher {
    engine_dir: PathBuf,
    params: BTreeMap<String, EngineParameter>,
    log: Vec<PatchRecord>,
}

impl ParameterPatcher {
    pub fn new(config: &BenchConfig) -> Self {
        let params = config
            .parameters
            .iter()
            .map(|(name, def)| {
                (
                    name.clone(),
                    EngineParameter {
                        name: name.clone(),
                        def: def.clone(),
                        current: def.baseline.clone(),
                    },
                )
            })
            .collect();
        Self {
            engine_dir: config.engine.dir.clone(),
            params,
            log: Vec::new(),
        }
    }

    pub fn current(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(|p| p.current.as_str())
    }

    pub fn log(&self) -> &[PatchRecord] {
        &self.log
    }

    fn source_path(&self, def: &ParameterDef) -> PathBuf {
        if def.file.is_absolute() {
            def.file.clone()
        } else {
            self.engine_dir.join(&def.file)
        }
    }

    /// Moves `name` to `value`. Returns whether the source changed; setting the
    /// value already in place is a no-op. The caller owns the rebuild.
    pub fn set(&mut self, name: &str, value: &str) -> Result<bool> {
        let param = self
            .params
            .get(name)
            .ok_or_else(|| PatchError::UnknownParameter(name.to_string()))?
            .clone();
        if param.current == value {
            return Ok(false);
        }
        let path = self.source_path(&param.def);
        let old = param.def.render(&param.current);
        let new = param.def.render(value);
        let digest_before = file_digest(&path)?;
        let occurrences = replace_literal_in_file(&path, &old, &new)?;
        if occurrences == 0 {
            return Err(PatchError::LiteralNotFound {
                parameter: name.to_string(),
                literal: old,
                file: path,
            }
            .into());
        }
        let digest_after = file_digest(&path)?;
        info!(
            parameter = name,
            from = %param.current,
            to = value,
            occurrences,
            "patched engine parameter"
        );
        self.log.push(PatchRecord {
            parameter: name.to_string(),
            file: path.display().to_string(),
            from: param.current.clone(),
            to: value.to_string(),
            occurrences,
            digest_before,
            digest_after,
            at: Utc::now().to_rfc3339(),
        });
        if let Some(p) = self.params.get_mut(name) {
            p.current = value.to_string();
        }
        Ok(true)
    }

    pub fn is_baseline(&self) -> bool {
        self.params.values().all(|p| p.current == p.def.baseline)
    }

    pub fn restore_baseline(&mut self) -> Result<bool> {
        let pending: Vec<(String, String)> = self
            .params
            .values()
            .filter(|p| p.current != p.def.baseline)
            .map(|p| (p.name.clone(), p.def.baseline.clone()))
            .collect();
        let mut changed = false;
        for (name, baseline) in pending {
            changed |= self.set(&name, &baseline)?;
        }
        Ok(changed)
    }
}

impl Drop for ParameterPatcher {
    fn drop(&mut self) {
        if !self.is_baseline() {
            if let Err(err) = self.restore_baseline() {
                warn!(error = %err, "failed to restore engine parameters to baseline");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensure_dir;

    fn temp_engine(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "colbench_params_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir.join("include")).expect("temp engine dir");
        fs::write(
            dir.join("db_operator.c"),
            concat!(
                "int query_chunk_size = 6;\n",
                "int num_partitions = 256;\n",
                "int num_partitions_max = 2560;\n"
            ),
        )
        .expect("write operator source");
        fs::write(
            dir.join("include").join("cs165_api.h"),
            "#define FANOUT 340\n#define LEAF_SIZE 508\n#define FANOUT_HINT 3400\n",
        )
        .expect("write header");
        dir
    }

    fn config_for(dir: &Path) -> BenchConfig {
        let mut config = BenchConfig::default();
        config.engine.dir = dir.to_path_buf();
        config
    }

    #[test]
    fn replace_literal_respects_token_boundaries() {
        let (out, n) = replace_literal(
            "FANOUT 42\nFANOUT 420\nXFANOUT 42\n",
            "FANOUT 42",
            "FANOUT 21",
        );
        assert_eq!(n, 1);
        assert_eq!(out, "FANOUT 21\nFANOUT 420\nXFANOUT 42\n");
    }

    #[test]
    fn replace_literal_replaces_every_definition() {
        let (out, n) = replace_literal("a = 6; b = 6;", "= 6", "= 8");
        assert_eq!(n, 2);
        assert_eq!(out, "a = 8; b = 8;");
    }

    #[test]
    fn replace_literal_in_file_is_noop_when_absent() {
        let dir = temp_engine("absent");
        let path = dir.join("db_operator.c");
        let before = fs::read(&path).expect("read");
        let n = replace_literal_in_file(&path, "query_chunk_size = 99", "query_chunk_size = 2")
            .expect("replace");
        assert_eq!(n, 0);
        assert_eq!(fs::read(&path).expect("read"), before);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn patcher_chains_values_without_caller_tracking() {
        let dir = temp_engine("chain");
        let mut patcher = ParameterPatcher::new(&config_for(&dir));
        for value in ["2", "4", "6", "8"] {
            patcher.set("chunk_size", value).expect("set");
            let src = fs::read_to_string(dir.join("db_operator.c")).expect("read");
            assert!(src.contains(&format!("query_chunk_size = {};", value)), "{}", src);
            assert!(src.contains("num_partitions = 256;"));
        }
        assert_eq!(patcher.current("chunk_size"), Some("8"));
        assert_eq!(patcher.log().len(), 4);
        assert_eq!(patcher.log()[2].from, "4");
        assert_eq!(patcher.log()[2].to, "6");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn patcher_set_to_current_value_is_noop() {
        let dir = temp_engine("noop");
        let mut patcher = ParameterPatcher::new(&config_for(&dir));
        assert!(!patcher.set("fanout", "340").expect("set"));
        assert!(patcher.log().is_empty());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn patcher_leaves_neighbouring_constants_alone() {
        let dir = temp_engine("neighbours");
        let mut patcher = ParameterPatcher::new(&config_for(&dir));
        patcher.set("fanout", "170").expect("fanout");
        patcher.set("leaf_size", "254").expect("leaf");
        patcher.set("partitions", "16").expect("partitions");
        let header = fs::read_to_string(dir.join("include").join("cs165_api.h")).expect("read");
        assert_eq!(
            header,
            "#define FANOUT 170\n#define LEAF_SIZE 254\n#define FANOUT_HINT 3400\n"
        );
        let op = fs::read_to_string(dir.join("db_operator.c")).expect("read");
        assert!(op.contains("num_partitions = 16;"));
        assert!(op.contains("num_partitions_max = 2560;"));
        let record = &patcher.log()[0];
        assert_ne!(record.digest_before, record.digest_after);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn patcher_rejects_missing_literal_and_unknown_names() {
        let dir = temp_engine("missing");
        fs::write(dir.join("db_operator.c"), "int query_chunk_size = 3;\n").expect("rewrite");
        let mut patcher = ParameterPatcher::new(&config_for(&dir));
        let err = patcher.set("chunk_size", "2").expect_err("literal missing");
        assert!(err.to_string().contains("not found"), "{}", err);
        assert_eq!(patcher.current("chunk_size"), Some("6"));
        let err = patcher.set("warp_factor", "9").expect_err("unknown");
        assert!(err.to_string().contains("unknown engine parameter"), "{}", err);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn dropping_patcher_restores_baseline_source() {
        let dir = temp_engine("restore");
        let op_path = dir.join("db_operator.c");
        let original = fs::read_to_string(&op_path).expect("read");
        {
            let mut patcher = ParameterPatcher::new(&config_for(&dir));
            patcher.set("chunk_size", "2").expect("set");
            patcher.set("partitions", "64").expect("set");
            assert_ne!(fs::read_to_string(&op_path).expect("read"), original);
        }
        assert_eq!(fs::read_to_string(&op_path).expect("read"), original);
        let _ = fs::remove_dir_all(dir);
    }
}
