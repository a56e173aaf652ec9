//! Radius of gyration time series averaged over repeated runs and shear
//! directions, one averaged curve per series (strain value).

use anyhow::Result;
use log::{debug, info, warn};
use trajectory_common::{expand_template, GyrationConfig, RgMode};

use crate::table;

/// Averages of one series over all of its run/direction files.
#[derive(Debug, Clone, PartialEq)]
pub struct RgSeries {
    pub label: String,
    pub time: Vec<f64>,
    /// Mean of RG^2.
    pub mean_rg_squared: Vec<f64>,
    /// Mean of RG, i.e. of sqrt(RG^2) per file.
    pub mean_rg: Vec<f64>,
    pub files: usize,
}

impl RgSeries {
    /// (x, y) columns written for the given mode.
    pub fn columns(&self, mode: RgMode) -> (Vec<f64>, &[f64]) {
        match mode {
            RgMode::Squared => (self.time.clone(), self.mean_rg_squared.as_slice()),
            RgMode::Linear => (self.time.clone(), self.mean_rg.as_slice()),
            RgMode::SemiLog => (self.time.iter().map(|t| t.ln()).collect(), self.mean_rg_squared.as_slice()),
        }
    }
}

/// Averages `time rg^2` files that share one time column.
pub fn average_files(label: &str, paths: &[String], skip_rows: usize) -> Result<RgSeries> {
    let mut time: Option<Vec<f64>> = None;
    let mut sum_sq: Vec<f64> = Vec::new();
    let mut sum_lin: Vec<f64> = Vec::new();

    for path in paths {
        let rows = table::read_table(path, skip_rows)?;
        let mut file_time = Vec::with_capacity(rows.len());
        let mut rg2 = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            if row.len() < 2 {
                anyhow::bail!("{}: data row {} needs 'time rg^2' columns.", path, i + 1);
            }
            file_time.push(row[0]);
            rg2.push(row[1]);
        }

        match &time {
            None => {
                sum_sq = vec![0.0; rg2.len()];
                sum_lin = vec![0.0; rg2.len()];
                time = Some(file_time);
            }
            Some(t) if *t != file_time => {
                anyhow::bail!("{} has a different time column than the other '{}' files.", path, label)
            }
            Some(_) => {}
        }
        for ((sq, lin), v) in sum_sq.iter_mut().zip(sum_lin.iter_mut()).zip(&rg2) {
            *sq += v;
            *lin += v.sqrt();
        }
        debug!("Added {} ({} rows) to series '{}'.", path, rg2.len(), label);
    }

    let Some(time) = time else {
        anyhow::bail!("Series '{}' has no files.", label);
    };
    let n = paths.len() as f64;
    Ok(RgSeries {
        label: label.to_string(),
        time,
        mean_rg_squared: sum_sq.into_iter().map(|s| s / n).collect(),
        mean_rg: sum_lin.into_iter().map(|s| s / n).collect(),
        files: paths.len(),
    })
}

/// Files of one series: every run for every direction.
pub fn series_paths(config: &GyrationConfig, series: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for dir in &config.dirs {
        for run in config.runs.0..=config.runs.1 {
            let run = run.to_string();
            paths.push(expand_template(
                &config.path_template,
                &[("run", run.as_str()), ("dir", dir.as_str()), ("series", series)],
            ));
        }
    }
    paths
}

pub fn run_gyration(config: &GyrationConfig, mode: RgMode) -> Result<Vec<RgSeries>> {
    let all: Vec<RgSeries> = config
        .series
        .iter()
        .map(|s| average_files(s, &series_paths(config, s), config.skip_rows))
        .collect::<Result<_>>()?;

    let Some(first) = all.first() else {
        anyhow::bail!("gyration.series is empty.");
    };
    if let Some(other) = all.iter().find(|s| s.time != first.time) {
        anyhow::bail!("Series '{}' and '{}' have different time columns.", first.label, other.label);
    }
    if mode == RgMode::SemiLog && first.time.iter().any(|&t| t <= 0.0) {
        warn!("Semi-log output contains non-positive times; ln(t) is not finite there.");
    }

    let (x, _) = first.columns(mode);
    let ys: Vec<&[f64]> = all.iter().map(|s| s.columns(mode).1).collect();
    let rows: Vec<Vec<f64>> = x
        .iter()
        .enumerate()
        .map(|(i, &xv)| std::iter::once(xv).chain(ys.iter().map(|y| y[i])).collect())
        .collect();
    let x_label = match mode {
        RgMode::SemiLog => "ln(time)",
        _ => "time",
    };
    let y_label = match mode {
        RgMode::Linear => "RG",
        _ => "RG^2",
    };
    let header = std::iter::once(x_label.to_string())
        .chain(all.iter().map(|s| format!("{}(eps={})", y_label, s.label)))
        .collect::<Vec<_>>()
        .join(" ");
    table::write_table(&config.output, Some(&header), &rows)?;
    info!(
        "Averaged {} series ({} files each, mode {:?}) saved to {}",
        all.len(),
        first.files,
        mode,
        config.output
    );
    Ok(all)
}
