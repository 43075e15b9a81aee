use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::path::Path;

/// Value domain the selectivity ranges are drawn over.
pub const SELECTIVITY_DOMAIN: i64 = 1_000_000;

const SCAN_LOW_SPREAD: i64 = 500;
const SCAN_HIGH_SPREAD: i64 = 25_000;
const JOIN_MID: i64 = SELECTIVITY_DOMAIN / 2;
const JOIN_NARROW_STEP: i64 = 2_500;
const JOIN_WIDE_STEP: i64 = 5_000;

pub const BATCH_OPEN: &str = "batch_queries()";
pub const BATCH_EXECUTE: &str = "batch_execute()";
pub const SHUTDOWN: &str = "shutdown";

/// Ordered DSL statements, one per line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadScript {
    lines: Vec<String>,
}

impl WorkloadScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Wraps the statements between the batch-open and batch-execute markers.
    pub fn batched(&self) -> WorkloadScript {
        let mut lines = Vec::with_capacity(self.lines.len() + 2);
        lines.push(BATCH_OPEN.to_string());
        lines.extend(self.lines.iter().cloned());
        lines.push(BATCH_EXECUTE.to_string());
        WorkloadScript { lines }
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

impl fmt::Display for WorkloadScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    None,
    Sorted,
    Btree,
}

impl IndexKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::None => "none",
            IndexKind::Sorted => "sorted",
            IndexKind::Btree => "btree",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TableSpec {
    pub name: String,
    pub columns: usize,
    pub index_column: String,
    pub index: IndexKind,
}

impl TableSpec {
    pub fn new(name: &str, columns: usize) -> Self {
        Self {
            name: name.to_string(),
            columns,
            index_column: "col1".to_string(),
            index: IndexKind::None,
        }
    }

    pub fn with_index(mut self, column: &str, kind: IndexKind) -> Self {
        self.index_column = column.to_string();
        self.index = kind;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectRange {
    pub low: i64,
    pub high: i64,
}

impl SelectRange {
    pub fn span(&self) -> i64 {
        self.high - self.low
    }

    /// Rescales a range drawn over the full domain to a table holding `rows` rows.
    pub fn scaled(&self, rows: u64) -> SelectRange {
        let rows = rows as i64;
        let scale = |v: i64| (v * rows + SELECTIVITY_DOMAIN / 2) / SELECTIVITY_DOMAIN;
        SelectRange {
            low: scale(self.low),
            high: scale(self.high),
        }
    }
}

pub struct ScanScripts {
    pub individual: WorkloadScript,
    pub shared: WorkloadScript,
}

pub struct JoinPair {
    pub nested: WorkloadScript,
    pub hash: WorkloadScript,
    pub join_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStrategy {
    NestedLoop,
    Hash,
}

impl JoinStrategy {
    fn as_dsl(&self) -> &'static str {
        match self {
            JoinStrategy::NestedLoop => "nested-loop",
            JoinStrategy::Hash => "hash",
        }
    }

    fn tag(&self) -> &'static str {
        match self {
            JoinStrategy::NestedLoop => "n",
            JoinStrategy::Hash => "h",
        }
    }
}

/// Produces DSL workload text. Inputs are not validated; a nonsensical
/// argument yields a well-formed script the engine will reject.
pub struct ScriptGenerator {
    db: String,
    rng: StdRng,
}

impl ScriptGenerator {
    pub fn new(db: &str, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            db: db.to_string(),
            rng,
        }
    }

    fn qualified(&self, table: &str, column: &str) -> String {
        format!("{}.{}.{}", self.db, table, column)
    }

    fn push_table(&self, script: &mut WorkloadScript, table: &TableSpec) {
        script.push(format!(
            "create(tbl,\"{}\",{},{})",
            table.name, self.db, table.columns
        ));
        for k in 1..=table.columns {
            script.push(format!(
                "create(col,\"col{}\",{}.{})",
                k, self.db, table.name
            ));
        }
        if table.index != IndexKind::None {
            script.push(format!(
                "create(idx,{},{},unclustered)",
                self.qualified(&table.name, &table.index_column),
                table.index.as_str()
            ));
        }
    }

    fn load_line(path: &Path, row_limit: Option<u64>) -> String {
        match row_limit {
            Some(rows) => format!("load(\"{}\",{})", path.display(), rows),
            None => format!("load(\"{}\")", path.display()),
        }
    }

    pub fn generate_setup(
        &self,
        table: &TableSpec,
        load_path: &Path,
        row_limit: Option<u64>,
    ) -> WorkloadScript {
        let mut script = WorkloadScript::new();
        script.push(format!("create(db,\"{}\")", self.db));
        self.push_table(&mut script, table);
        script.push(Self::load_line(load_path, row_limit));
        script
    }

    /// Two tables in one database, both loaded, followed by a shutdown so the
    /// engine persists them before the per-step restarts.
    pub fn generate_join_setup(
        &self,
        left: &TableSpec,
        left_path: &Path,
        right: &TableSpec,
        right_path: &Path,
    ) -> WorkloadScript {
        let mut script = WorkloadScript::new();
        script.push(format!("create(db,\"{}\")", self.db));
        self.push_table(&mut script, left);
        self.push_table(&mut script, right);
        script.push(Self::load_line(left_path, None));
        script.push(Self::load_line(right_path, None));
        script.push(SHUTDOWN);
        script
    }

    /// `count` range selects; the shared form runs the very same draws as one batch.
    pub fn generate_scans(
        &mut self,
        table: &str,
        column: &str,
        count: usize,
        domain_max: i64,
    ) -> ScanScripts {
        let target = self.qualified(table, column);
        let mut individual = WorkloadScript::new();
        for i in 0..count {
            let low = self.rng.gen_range(0..=SCAN_LOW_SPREAD);
            let high = self
                .rng
                .gen_range((domain_max - SCAN_HIGH_SPREAD)..=domain_max);
            individual.push(format!("s{}=select({},{},{})", i, target, low, high));
        }
        let shared = individual.batched();
        ScanScripts { individual, shared }
    }

    /// Pair `i` covers `round(domain * (i + 1) / steps)` values at a random offset.
    pub fn generate_selectivity_ranges(&mut self, steps: usize) -> Vec<SelectRange> {
        let n = steps as i64;
        (0..n)
            .map(|i| {
                let span = (2 * SELECTIVITY_DOMAIN * (i + 1) + n) / (2 * n);
                let low = self.rng.gen_range(0..=(SELECTIVITY_DOMAIN - span));
                SelectRange {
                    low,
                    high: low + span,
                }
            })
            .collect()
    }

    pub fn selection_script(
        &self,
        index: usize,
        table: &str,
        column: &str,
        range: SelectRange,
    ) -> WorkloadScript {
        WorkloadScript::from_lines([format!(
            "s{}={}",
            index,
            self.select_expr(table, column, range)
        )])
    }

    fn select_expr(&self, table: &str, column: &str, range: SelectRange) -> String {
        format!(
            "select({},{},{})",
            self.qualified(table, column),
            range.low,
            range.high
        )
    }

    fn join_script(
        &self,
        step: u64,
        prelude: &WorkloadScript,
        strategy: JoinStrategy,
    ) -> WorkloadScript {
        let mut script = prelude.clone();
        let tag = strategy.tag();
        script.push(format!(
            "t1{tag}{n},t2{tag}{n}=join(f1{n},s1{n},f2{n},s2{n},{})",
            strategy.as_dsl(),
            tag = tag,
            n = step
        ));
        script.push(SHUTDOWN);
        script
    }

    /// Both scripts select a window around the domain midpoint of each table,
    /// widening linearly with `step`, then join the fetched values.
    pub fn generate_join_pair(&self, step: u64, left: &str, right: &str) -> JoinPair {
        let s = step as i64;
        let left_range = SelectRange {
            low: JOIN_MID - s * JOIN_WIDE_STEP,
            high: JOIN_MID + s * JOIN_NARROW_STEP,
        };
        let right_range = SelectRange {
            low: JOIN_MID - s * JOIN_NARROW_STEP,
            high: JOIN_MID + s * JOIN_WIDE_STEP,
        };
        let mut prelude = WorkloadScript::new();
        prelude.push(format!(
            "s1{}={}",
            step,
            self.select_expr(left, "col1", left_range)
        ));
        prelude.push(format!(
            "s2{}={}",
            step,
            self.select_expr(right, "col1", right_range)
        ));
        prelude.push(format!(
            "f1{n}=fetch({},s1{n})",
            self.qualified(left, "col1"),
            n = step
        ));
        prelude.push(format!(
            "f2{n}=fetch({},s2{n})",
            self.qualified(right, "col1"),
            n = step
        ));
        JoinPair {
            nested: self.join_script(step, &prelude, JoinStrategy::NestedLoop),
            hash: self.join_script(step, &prelude, JoinStrategy::Hash),
            join_size: left_range.span() as u64,
        }
    }
}
