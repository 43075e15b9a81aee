use crate::{atomic_write_bytes, ensure_dir};
use anyhow::{anyhow, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

/// A numeric CSV field. Nothing recorded needs escaping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Cell {
    Int(u64),
    Float(f64),
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Int(v) => write!(f, "{}", v),
            Cell::Float(v) => write!(f, "{}", v),
        }
    }
}

impl From<u64> for Cell {
    fn from(v: u64) -> Self {
        Cell::Int(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub label: Cell,
    pub elapsed_us: u64,
}

impl Measurement {
    pub fn new(label: impl Into<Cell>, elapsed_us: u64) -> Self {
        Self {
            label: label.into(),
            elapsed_us,
        }
    }
}

/// Rows bound to one output file and its fixed header.
#[derive(Debug, Clone)]
pub struct ResultSet {
    file_name: String,
    header: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl ResultSet {
    pub fn new(file_name: &str, header: &[&str]) -> Self {
        Self {
            file_name: file_name.to_string(),
            header: header.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    /// Two-column set of `(label, time)` rows in measurement order.
    pub fn from_measurements(
        file_name: &str,
        header: &[&str],
        measurements: &[Measurement],
    ) -> Result<Self> {
        let mut set = Self::new(file_name, header);
        for m in measurements {
            set.push_row(vec![m.label, Cell::Int(m.elapsed_us)])?;
        }
        Ok(set)
    }

    /// One row per label, one column per series; every series must cover every label.
    pub fn from_series(
        file_name: &str,
        header: &[&str],
        labels: &[Cell],
        series: &[Vec<u64>],
    ) -> Result<Self> {
        let mut set = Self::new(file_name, header);
        for (name, values) in header.iter().skip(1).zip(series) {
            if values.len() != labels.len() {
                return Err(anyhow!(
                    "{}: series {} has {} values for {} labels",
                    file_name,
                    name,
                    values.len(),
                    labels.len()
                ));
            }
        }
        for (i, label) in labels.iter().enumerate() {
            let mut row = Vec::with_capacity(series.len() + 1);
            row.push(*label);
            row.extend(series.iter().map(|values| Cell::Int(values[i])));
            set.push_row(row)?;
        }
        Ok(set)
    }

    pub fn push_row(&mut self, row: Vec<Cell>) -> Result<()> {
        if row.len() != self.header.len() {
            return Err(anyhow!(
                "{}: row has {} fields, header has {}",
                self.file_name,
                row.len(),
                self.header.len()
            ));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn to_csv(&self) -> String {
        let mut out = self.header.join(",");
        out.push('\n');
        for row in &self.rows {
            let fields: Vec<String> = row.iter().map(|c| c.to_string()).collect();
            out.push_str(&fields.join(","));
            out.push('\n');
        }
        out
    }
}

pub struct ResultWriter {
    dir: PathBuf,
}

impl ResultWriter {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn write(&self, set: &ResultSet) -> Result<PathBuf> {
        ensure_dir(&self.dir)?;
        let path = self.dir.join(set.file_name());
        atomic_write_bytes(&path, set.to_csv().as_bytes())?;
        info!(path = %path.display(), rows = set.rows().len(), "wrote results");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs;

    #[test]
    fn measurements_become_label_time_rows() {
        let set = ResultSet::from_measurements(
            "t.csv",
            &["num_scans", "time"],
            &[Measurement::new(1u64, 250), Measurement::new(2u64, 410)],
        )
        .expect("set");
        assert_eq!(set.to_csv(), "num_scans,time\n1,250\n2,410\n");
    }

    #[test]
    fn series_are_laid_out_column_wise() {
        let labels = [Cell::Float(0.0), Cell::Float(0.5)];
        let set = ResultSet::from_series(
            "idx.csv",
            &["selectivity", "btree", "sorted", "none"],
            &labels,
            &[vec![1, 2], vec![3, 4], vec![5, 6]],
        )
        .expect("set");
        assert_eq!(set.to_csv(), "selectivity,btree,sorted,none\n0,1,3,5\n0.5,2,4,6\n");
    }

    #[test]
    fn ragged_series_are_rejected() {
        let err = ResultSet::from_series(
            "x.csv",
            &["n", "a", "b"],
            &[Cell::Int(1), Cell::Int(2)],
            &[vec![1, 2], vec![3]],
        )
        .expect_err("ragged");
        assert!(err.to_string().contains("series b"), "{}", err);
        let mut set = ResultSet::new("x.csv", &["n", "a"]);
        assert!(set.push_row(vec![Cell::Int(1)]).is_err());
    }

    #[test]
    fn writer_creates_results_dir() {
        let dir = std::env::temp_dir()
            .join(format!(
                "colbench_results_{}_{}",
                std::process::id(),
                Utc::now().timestamp_micros()
            ))
            .join("nested");
        let set =
            ResultSet::from_measurements("w.csv", &["n", "time"], &[Measurement::new(3u64, 9)])
                .expect("set");
        let path = ResultWriter::new(&dir).write(&set).expect("write");
        assert_eq!(fs::read_to_string(&path).expect("read"), "n,time\n3,9\n");
        let _ = fs::remove_dir_all(dir.parent().expect("parent"));
    }
}
