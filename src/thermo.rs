//! Thermo output from LAMMPS log files: one column averaged per temperature.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use trajectory_common::{expand_template, ThermoConfig};

use crate::table;

/// One thermo block: the `Step ...` header and the numeric rows under it.
#[derive(Debug, Clone, PartialEq)]
pub struct ThermoBlock {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl ThermoBlock {
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().map(|r| r[idx]).collect())
    }
}

fn numeric_fields(line: &str) -> Option<Vec<f64>> {
    let fields: Vec<f64> = line
        .split_whitespace()
        .map(|f| f.parse::<f64>().ok())
        .collect::<Option<_>>()?;
    if fields.is_empty() {
        None
    } else {
        Some(fields)
    }
}

/// Collects every thermo block. A block starts at a line whose first word is
/// `Step` and ends at the first line that is not a row of numbers.
pub fn parse_thermo_blocks<R: BufRead>(reader: R, source: &str) -> Result<Vec<ThermoBlock>> {
    let mut blocks = Vec::new();
    let mut current: Option<ThermoBlock> = None;

    for (i, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}:{}", source, i + 1))?;
        if let Some(block) = current.as_mut() {
            if let Some(values) = numeric_fields(&line) {
                if values.len() == block.columns.len() {
                    block.rows.push(values);
                } else {
                    warn!(
                        "{}:{}: thermo row has {} values for {} columns, skipped.",
                        source,
                        i + 1,
                        values.len(),
                        block.columns.len()
                    );
                }
                continue;
            }
            blocks.extend(current.take());
        }
        if line.split_whitespace().next() == Some("Step") {
            current = Some(ThermoBlock {
                columns: line.split_whitespace().map(str::to_string).collect(),
                rows: Vec::new(),
            });
        }
    }
    blocks.extend(current);
    Ok(blocks)
}

/// Mean of `column` over every row of every block in the log file.
pub fn average_column<P: AsRef<Path>>(path: P, column: &str) -> Result<f64> {
    let path_ref = path.as_ref();
    let source = path_ref.display().to_string();
    let file = File::open(path_ref).with_context(|| format!("Failed to open log file: {}", source))?;
    let blocks = parse_thermo_blocks(BufReader::new(file), &source)?;
    if blocks.is_empty() {
        anyhow::bail!("{} contains no thermo output.", source);
    }

    let mut sum = 0.0;
    let mut count = 0usize;
    for block in &blocks {
        let values = block.column(column).ok_or_else(|| {
            anyhow::anyhow!(
                "{}: thermo block has no '{}' column (columns: {}).",
                source,
                column,
                block.columns.join(" ")
            )
        })?;
        sum += values.iter().sum::<f64>();
        count += values.len();
    }
    if count == 0 {
        anyhow::bail!("{} has no thermo rows to average.", source);
    }
    debug!("{}: {} blocks, {} rows", source, blocks.len(), count);
    Ok(sum / count as f64)
}

pub fn run_thermo(config: &ThermoConfig) -> Result<Vec<(f64, f64)>> {
    let mut results = Vec::with_capacity(config.temperatures.len());
    for temp in &config.temperatures {
        let t: f64 = temp
            .parse()
            .map_err(|e| anyhow::anyhow!("thermo temperature '{}': {}", temp, e))?;
        let path = expand_template(&config.path_template, &[("temp", temp.as_str())]);
        let avg = average_column(&path, &config.column)?;
        info!("T={}: mean {} = {}", temp, config.column, avg);
        results.push((t, avg));
    }

    let rows: Vec<Vec<f64>> = results.iter().map(|&(t, v)| vec![t, v]).collect();
    table::write_table(&config.output, Some(&format!("temperature {}", config.column)), &rows)?;
    info!("Thermo averages for {} temperatures saved to {}", results.len(), config.output);
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    const LOG: &str = "\
LAMMPS (7 Aug 2019)
units lj
thermo 1000
Step Temp E_pair Volume
       0          0.2   -2.1   100
    1000   0.21   -2.0   102
Loop time of 1.5 on 4 procs for 1000 steps with 100 atoms

run 2000
Step Temp E_pair Volume
    1000   0.21   -2.0   102
    2000   0.19   -2.2   96
WARNING: something happened
";

    #[test]
    fn blocks_end_at_non_numeric_lines() {
        let blocks = parse_thermo_blocks(Cursor::new(LOG), "log").unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].columns, vec!["Step", "Temp", "E_pair", "Volume"]);
        assert_eq!(blocks[0].rows.len(), 2);
        assert_eq!(blocks[1].column("Volume").unwrap(), vec![102.0, 96.0]);
    }

    #[test]
    fn truncated_last_row_is_skipped() {
        let text = "Step Temp Volume\n0 0.2 10\n100 0.2\n";
        let blocks = parse_thermo_blocks(Cursor::new(text), "log").unwrap();
        assert_eq!(blocks[0].rows, vec![vec![0.0, 0.2, 10.0]]);
    }

    #[test]
    fn averages_over_all_rows_of_all_blocks() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("log.temp0.2"), LOG).unwrap();
        std::fs::write(dir.path().join("log.temp0.45"), "Step Volume\n0 50\n10 70\n").unwrap();
        let config = ThermoConfig {
            path_template: format!("{}/log.temp{{temp}}", dir.path().display()),
            temperatures: vec!["0.2".to_string(), "0.45".to_string()],
            column: "Volume".to_string(),
            output: dir.path().join("Data_area.dat").display().to_string(),
        };
        let results = run_thermo(&config).unwrap();
        assert_eq!(results, vec![(0.2, 100.0), (0.45, 60.0)]);

        let rows = table::read_table(&config.output, 0).unwrap();
        assert_eq!(rows, vec![vec![0.2, 100.0], vec![0.45, 60.0]]);
    }

    #[test]
    fn missing_column_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, "Step Temp\n0 1\n").unwrap();
        let err = average_column(&path, "Volume").unwrap_err();
        assert!(err.to_string().contains("no 'Volume' column"));
    }

    #[test]
    fn log_without_thermo_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, "LAMMPS (7 Aug 2019)\n").unwrap();
        assert!(average_column(&path, "Volume").is_err());
    }
}
