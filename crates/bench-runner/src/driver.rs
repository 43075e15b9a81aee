use crate::config::BenchConfig;
use crate::params::{ParameterPatcher, PatchRecord};
use crate::results::{Cell, Measurement, ResultSet, ResultWriter};
use crate::runner::ScriptRunner;
use crate::script::{
    IndexKind, JoinStrategy, ScriptGenerator, SelectRange, TableSpec, WorkloadScript,
};
use crate::service::{LifecycleError, ServiceController};
use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

pub const CHUNK_SIZES: [u32; 4] = [2, 4, 6, 8];
pub const NODE_PRESETS: [(u32, u32); 5] =
    [(340, 508), (170, 254), (85, 127), (42, 64), (21, 32)];
pub const PARTITION_COUNTS: [u32; 5] = [256, 128, 64, 32, 16];
pub const INDEX_ORDER: [IndexKind; 3] = [IndexKind::Btree, IndexKind::Sorted, IndexKind::None];

const TABLE_COLUMNS: usize = 4;
const BATCH_TABLE: &str = "tbl3_batch";
const SELECT_TABLE: &str = "tbl3";
const JOIN_RIGHT_TABLE: &str = "tbl4";
const SCAN_COLUMN: &str = "col1";
const SELECT_COLUMN: &str = "col2";
const BTREE_INDEX_COLUMN: &str = "col4";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExperimentKind {
    ChunkSizeSweep,
    SharedVsIndividual,
    BtreeNodeSize,
    IndexComparison,
    JoinStrategy,
    PartitionSweep,
}

impl ExperimentKind {
    pub const ALL: [ExperimentKind; 6] = [
        ExperimentKind::ChunkSizeSweep,
        ExperimentKind::SharedVsIndividual,
        ExperimentKind::BtreeNodeSize,
        ExperimentKind::IndexComparison,
        ExperimentKind::JoinStrategy,
        ExperimentKind::PartitionSweep,
    ];

    pub fn from_number(n: u8) -> Result<Self> {
        Self::ALL
            .get((n as usize).wrapping_sub(1))
            .copied()
            .ok_or_else(|| anyhow!("unknown experiment {}: expected 1-6", n))
    }

    pub fn number(&self) -> u8 {
        match self {
            ExperimentKind::ChunkSizeSweep => 1,
            ExperimentKind::SharedVsIndividual => 2,
            ExperimentKind::BtreeNodeSize => 3,
            ExperimentKind::IndexComparison => 4,
            ExperimentKind::JoinStrategy => 5,
            ExperimentKind::PartitionSweep => 6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentKind::ChunkSizeSweep => "chunk_size_sweep",
            ExperimentKind::SharedVsIndividual => "shared_vs_individual",
            ExperimentKind::BtreeNodeSize => "btree_node_size",
            ExperimentKind::IndexComparison => "index_comparison",
            ExperimentKind::JoinStrategy => "join_strategy",
            ExperimentKind::PartitionSweep => "partition_sweep",
        }
    }
}

/// Where the driver stands in `BUILD → START → SETUP → MEASURE* → STOP → WRITE`.
/// `Stopped` may loop back to `Built` (parameter change) or `Started` (restart).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Built,
    Started,
    SetUp,
    Measuring,
    Stopped,
    Written,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Built => "built",
            Phase::Started => "started",
            Phase::SetUp => "set_up",
            Phase::Measuring => "measuring",
            Phase::Stopped => "stopped",
            Phase::Written => "written",
            Phase::Failed => "failed",
        }
    }

    pub fn can_advance(&self, to: Phase) -> bool {
        use Phase::*;
        matches!(
            (*self, to),
            (Idle, Built)
                | (Built, Built)
                | (Built, Started)
                | (Started, SetUp)
                | (Started, Measuring)
                | (Started, Stopped)
                | (SetUp, Measuring)
                | (SetUp, Stopped)
                | (Measuring, Measuring)
                | (Measuring, Stopped)
                | (Stopped, Built)
                | (Stopped, Started)
                | (Stopped, Written)
        )
    }
}

pub struct ExperimentDriver {
    config: BenchConfig,
    service: ServiceController,
    runner: ScriptRunner,
    patcher: ParameterPatcher,
    scripts: ScriptGenerator,
    phase: Phase,
    stale_build: bool,
    binary_stale: bool,
    pause: Duration,
}

impl ExperimentDriver {
    pub fn new(config: BenchConfig, scratch_dir: &Path) -> Self {
        let runner = ScriptRunner::new(&config, scratch_dir);
        let service = ServiceController::new(&config, runner.clone());
        let patcher = ParameterPatcher::new(&config);
        let scripts = ScriptGenerator::new(&config.workload.db, config.workload.seed);
        let pause = Duration::from_millis(config.workload.inter_run_pause_ms);
        Self {
            config,
            service,
            runner,
            patcher,
            scripts,
            phase: Phase::Idle,
            stale_build: false,
            binary_stale: false,
            pause,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn patch_log(&self) -> &[PatchRecord] {
        self.patcher.log()
    }

    /// True when the engine binary left behind was not rebuilt from baseline source.
    pub fn binary_stale(&self) -> bool {
        self.binary_stale
    }

    fn transition(&mut self, to: Phase) -> Result<()> {
        if !self.phase.can_advance(to) {
            let from = self.phase;
            self.phase = Phase::Failed;
            return Err(LifecycleError::InvalidTransition {
                from: from.as_str(),
                to: to.as_str(),
            }
            .into());
        }
        self.phase = to;
        Ok(())
    }

    fn build(&mut self, clean: bool) -> Result<()> {
        self.transition(Phase::Built)?;
        if clean {
            self.service.clean()?;
        }
        self.service.build()?;
        self.stale_build = false;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.transition(Phase::Started)?;
        if self.stale_build {
            return Err(anyhow!("engine parameters changed since the last build"));
        }
        self.service.start()
    }

    fn stop(&mut self) -> Result<()> {
        self.transition(Phase::Stopped)?;
        self.service.stop()?;
        Ok(())
    }

    /// Only legal with the server down; the next start requires a rebuild.
    fn set_parameter(&mut self, name: &str, value: u32) -> Result<()> {
        if self.service.is_running() {
            let pid = self.service.pid().unwrap_or_default();
            return Err(LifecycleError::AlreadyRunning(pid).into());
        }
        if self.patcher.set(name, &value.to_string())? {
            self.stale_build = true;
        }
        Ok(())
    }

    fn ensure_running(&mut self) -> Result<()> {
        if !self.service.is_running() {
            return Err(LifecycleError::NotRunning.into());
        }
        Ok(())
    }

    fn setup(&mut self, script: &WorkloadScript) -> Result<u64> {
        self.transition(Phase::SetUp)?;
        self.ensure_running()?;
        info!(statements = script.len(), "running setup");
        self.runner.run(script)
    }

    /// Setup whose last statement shuts the server down.
    fn setup_to_exit(&mut self, script: &WorkloadScript) -> Result<u64> {
        let elapsed = self.setup(script)?;
        self.transition(Phase::Stopped)?;
        self.service.await_exit()?;
        Ok(elapsed)
    }

    fn measure(&mut self, script: &WorkloadScript) -> Result<u64> {
        let consecutive = self.phase == Phase::Measuring;
        self.transition(Phase::Measuring)?;
        self.ensure_running()?;
        if consecutive && !self.pause.is_zero() {
            thread::sleep(self.pause);
        }
        self.runner.run(script)
    }

    /// One client invocation per statement, summed.
    fn measure_each(&mut self, script: &WorkloadScript) -> Result<u64> {
        let mut total = 0;
        for line in script.lines() {
            total += self.measure(&WorkloadScript::from_lines([line.clone()]))?;
        }
        Ok(total)
    }

    fn measure_to_exit(&mut self, script: &WorkloadScript) -> Result<u64> {
        let elapsed = self.measure(script)?;
        self.transition(Phase::Stopped)?;
        self.service.await_exit()?;
        Ok(elapsed)
    }

    /// Runs `kind` to completion and writes its files under `results_dir`.
    pub fn run(&mut self, kind: ExperimentKind) -> Result<Vec<PathBuf>> {
        info!(experiment = kind.number(), name = kind.as_str(), "starting experiment");
        let outcome = self.collect(kind).and_then(|sets| self.write(&sets));
        if outcome.is_err() {
            self.phase = Phase::Failed;
            if let Err(err) = self.service.stop_forced() {
                warn!(error = %err, "failed to terminate server after aborted run");
            }
        }
        self.restore_engine();
        outcome
    }

    /// Puts swept constants back to baseline and rebuilds so the binary left
    /// behind matches the source.
    fn restore_engine(&mut self) {
        match self.patcher.restore_baseline() {
            Ok(false) => {}
            Ok(true) => {
                if let Err(err) = self.service.build() {
                    warn!(error = %err, "engine binary still holds swept parameters");
                    self.binary_stale = true;
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to restore engine parameters");
                self.binary_stale = true;
            }
        }
    }

    pub fn collect(&mut self, kind: ExperimentKind) -> Result<Vec<ResultSet>> {
        match kind {
            ExperimentKind::ChunkSizeSweep => self.chunk_size_sweep(),
            ExperimentKind::SharedVsIndividual => self.shared_vs_individual(),
            ExperimentKind::BtreeNodeSize => self.btree_node_size(),
            ExperimentKind::IndexComparison => self.index_comparison(),
            ExperimentKind::JoinStrategy => self.join_strategy(),
            ExperimentKind::PartitionSweep => self.partition_sweep(),
        }
    }

    fn write(&mut self, sets: &[ResultSet]) -> Result<Vec<PathBuf>> {
        self.transition(Phase::Written)?;
        let writer = ResultWriter::new(&self.config.results_dir);
        sets.iter().map(|set| writer.write(set)).collect()
    }

    fn data(&self, file: &str) -> PathBuf {
        self.config.workload.data_path(file)
    }

    fn batch_setup(&self) -> WorkloadScript {
        self.scripts.generate_setup(
            &TableSpec::new(BATCH_TABLE, TABLE_COLUMNS),
            &self.data(&self.config.workload.batch_data),
            None,
        )
    }

    fn scan_labels(&self) -> Vec<Cell> {
        (1..=self.config.workload.scan_steps as u64).map(Cell::Int).collect()
    }

    fn chunk_size_sweep(&mut self) -> Result<Vec<ResultSet>> {
        let steps = self.config.workload.scan_steps;
        let domain = self.config.workload.scan_domain_max;
        let setup = self.batch_setup();
        let scripts: Vec<WorkloadScript> = (1..=steps)
            .map(|count| {
                self.scripts
                    .generate_scans(BATCH_TABLE, SCAN_COLUMN, count, domain)
                    .shared
            })
            .collect();

        let mut series = Vec::with_capacity(CHUNK_SIZES.len());
        for (i, chunk) in CHUNK_SIZES.iter().enumerate() {
            info!(chunk_size = chunk, "chunk size step");
            self.set_parameter("chunk_size", *chunk)?;
            self.build(i == 0)?;
            self.start()?;
            if i == 0 {
                self.setup(&setup)?;
            }
            let mut times = Vec::with_capacity(steps);
            for script in &scripts {
                times.push(self.measure(script)?);
            }
            self.stop()?;
            series.push(times);
        }
        let header = ["num_scans", "c.2", "c.4", "c.6", "c.8"];
        Ok(vec![ResultSet::from_series(
            "shared_scans_chunks_results.csv",
            &header,
            &self.scan_labels(),
            &series,
        )?])
    }

    fn shared_vs_individual(&mut self) -> Result<Vec<ResultSet>> {
        let steps = self.config.workload.scan_steps;
        let domain = self.config.workload.scan_domain_max;
        let setup = self.batch_setup();
        self.build(true)?;
        self.start()?;
        self.setup(&setup)?;

        let mut individual = Vec::with_capacity(steps);
        let mut shared = Vec::with_capacity(steps);
        for count in 1..=steps {
            info!(scans = count, "shared vs individual step");
            let scans = self
                .scripts
                .generate_scans(BATCH_TABLE, SCAN_COLUMN, count, domain);
            individual.push(Measurement::new(count as u64, self.measure_each(&scans.individual)?));
            shared.push(Measurement::new(count as u64, self.measure(&scans.shared)?));
        }
        self.stop()?;
        let header = ["num_scans", "time"];
        Ok(vec![
            ResultSet::from_measurements("shared_scans_threads_results.csv", &header, &shared)?,
            ResultSet::from_measurements("individual_scans_results.csv", &header, &individual)?,
        ])
    }

    fn selection_sweep(&mut self, ranges: &[SelectRange]) -> Result<Vec<u64>> {
        let mut times = Vec::with_capacity(ranges.len());
        for (i, range) in ranges.iter().enumerate() {
            let script = self
                .scripts
                .selection_script(i, SELECT_TABLE, SELECT_COLUMN, *range);
            times.push(self.measure(&script)?);
        }
        Ok(times)
    }

    fn btree_node_size(&mut self) -> Result<Vec<ResultSet>> {
        let ranges = self
            .scripts
            .generate_selectivity_ranges(self.config.workload.selectivity_steps);
        let row_counts = self.config.workload.btree_rows.clone();
        let table = TableSpec::new(SELECT_TABLE, TABLE_COLUMNS)
            .with_index(BTREE_INDEX_COLUMN, IndexKind::Btree);
        let load = self.data(&self.config.workload.select_data);

        let mut including = Vec::with_capacity(NODE_PRESETS.len());
        let mut excluding = Vec::with_capacity(NODE_PRESETS.len());
        for (fanout, leaf) in NODE_PRESETS {
            info!(fanout, leaf_size = leaf, "node size preset");
            self.set_parameter("fanout", fanout)?;
            self.set_parameter("leaf_size", leaf)?;
            let mut with_setup = Vec::with_capacity(row_counts.len());
            let mut without_setup = Vec::with_capacity(row_counts.len());
            for rows in &row_counts {
                info!(rows, "row count step");
                let setup = self.scripts.generate_setup(&table, &load, Some(*rows));
                let scaled: Vec<SelectRange> = ranges.iter().map(|r| r.scaled(*rows)).collect();
                self.build(true)?;
                self.start()?;
                let setup_us = self.setup(&setup)?;
                let select_us: u64 = self.selection_sweep(&scaled)?.iter().sum();
                self.stop()?;
                with_setup.push(setup_us + select_us);
                without_setup.push(select_us);
            }
            including.push(with_setup);
            excluding.push(without_setup);
        }
        let header = ["num_rows", "one", "two", "three", "four", "five"];
        let labels: Vec<Cell> = row_counts.iter().copied().map(Cell::Int).collect();
        Ok(vec![
            ResultSet::from_series("btree_node_size_results.csv", &header, &labels, &including)?,
            ResultSet::from_series("btree_node_size_results_2.csv", &header, &labels, &excluding)?,
        ])
    }

    fn index_comparison(&mut self) -> Result<Vec<ResultSet>> {
        let steps = self.config.workload.selectivity_steps;
        let ranges = self.scripts.generate_selectivity_ranges(steps);
        let load = self.data(&self.config.workload.select_data);

        let mut series = Vec::with_capacity(INDEX_ORDER.len());
        for kind in INDEX_ORDER {
            info!(index = kind.as_str(), "index type step");
            let table = TableSpec::new(SELECT_TABLE, TABLE_COLUMNS).with_index(SELECT_COLUMN, kind);
            let setup = self.scripts.generate_setup(&table, &load, None);
            self.build(true)?;
            self.start()?;
            self.setup(&setup)?;
            series.push(self.selection_sweep(&ranges)?);
            self.stop()?;
        }
        let labels: Vec<Cell> = (0..steps)
            .map(|i| Cell::Float(i as f64 / steps as f64))
            .collect();
        Ok(vec![ResultSet::from_series(
            "index_comparison.csv",
            &["selectivity", "btree", "sorted", "none"],
            &labels,
            &series,
        )?])
    }

    /// Full build/start/setup, then per step one fresh server per strategy,
    /// since every join script ends by shutting the server down.
    fn join_sweep(&mut self, strategies: &[JoinStrategy]) -> Result<(Vec<Cell>, Vec<Vec<u64>>)> {
        let setup = self.scripts.generate_join_setup(
            &TableSpec::new(SELECT_TABLE, TABLE_COLUMNS),
            &self.data(&self.config.workload.join_left_data),
            &TableSpec::new(JOIN_RIGHT_TABLE, TABLE_COLUMNS),
            &self.data(&self.config.workload.join_right_data),
        );
        self.build(true)?;
        self.start()?;
        self.setup_to_exit(&setup)?;

        let steps = self.config.workload.join_steps as u64;
        let mut sizes = Vec::with_capacity(steps as usize);
        let mut series = vec![Vec::with_capacity(steps as usize); strategies.len()];
        for step in 1..=steps {
            let pair = self
                .scripts
                .generate_join_pair(step, SELECT_TABLE, JOIN_RIGHT_TABLE);
            info!(step, join_size = pair.join_size, "join step");
            sizes.push(Cell::Int(pair.join_size));
            for (slot, strategy) in strategies.iter().enumerate() {
                let script = match strategy {
                    JoinStrategy::NestedLoop => &pair.nested,
                    JoinStrategy::Hash => &pair.hash,
                };
                self.start()?;
                series[slot].push(self.measure_to_exit(script)?);
            }
        }
        Ok((sizes, series))
    }

    fn join_strategy(&mut self) -> Result<Vec<ResultSet>> {
        let (sizes, series) = self.join_sweep(&[JoinStrategy::NestedLoop, JoinStrategy::Hash])?;
        Ok(vec![ResultSet::from_series(
            "nested_vs_hash.csv",
            &["join.size", "nested", "hash"],
            &sizes,
            &series,
        )?])
    }

    fn partition_sweep(&mut self) -> Result<Vec<ResultSet>> {
        let mut sizes = Vec::new();
        let mut series = Vec::with_capacity(PARTITION_COUNTS.len());
        for partitions in PARTITION_COUNTS {
            info!(partitions, "partition count step");
            self.set_parameter("partitions", partitions)?;
            let (step_sizes, mut times) = self.join_sweep(&[JoinStrategy::Hash])?;
            sizes = step_sizes;
            series.push(times.remove(0));
        }
        Ok(vec![ResultSet::from_series(
            "partition_sizes.csv",
            &["join.size", "p.256", "p.128", "p.64", "p.32", "p.16"],
            &sizes,
            &series,
        )?])
    }
}
