//! Whole-system MSD(t) curves from `fix ave/time` vector output, one file per
//! temperature, merged into one table.

use anyhow::{Context, Result};
use log::{debug, info};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use trajectory_common::{expand_template, MsdCurvesConfig};

use crate::table;

/// MSD against timestep for one temperature.
#[derive(Debug, Clone, PartialEq)]
pub struct MsdCurve {
    pub label: String,
    pub timesteps: Vec<u64>,
    pub values: Vec<f64>,
}

/// Parses blocks of `<timestep> <nrows>` followed by `nrows` lines of
/// `<row index> <value>`, keeping the value of row `component`.
pub fn parse_msd_blocks<R: BufRead>(reader: R, source: &str, component: u32) -> Result<Vec<(u64, f64)>> {
    let mut points = Vec::new();
    let mut lines = reader
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l))
        .filter(|(_, l)| l.as_ref().map_or(true, |s| !s.trim().is_empty() && !s.trim_start().starts_with('#')));

    while let Some((line_no, line)) = lines.next() {
        let line = line.with_context(|| format!("Failed to read {}:{}", source, line_no))?;
        let mut fields = line.split_whitespace();
        let (timestep, nrows) = match (fields.next().map(str::parse::<u64>), fields.next().map(str::parse::<usize>)) {
            (Some(Ok(t)), Some(Ok(n))) => (t, n),
            _ => anyhow::bail!("{}:{}: expected '<timestep> <rows>', found '{}'.", source, line_no, line.trim()),
        };

        let mut value = None;
        for _ in 0..nrows {
            let (row_no, row) = lines
                .next()
                .ok_or_else(|| anyhow::anyhow!("{}: block at timestep {} ends early.", source, timestep))?;
            let row = row.with_context(|| format!("Failed to read {}:{}", source, row_no))?;
            let mut cols = row.split_whitespace();
            let index = cols.next().and_then(|s| s.parse::<u32>().ok());
            let v = cols.next().and_then(|s| s.parse::<f64>().ok());
            match (index, v) {
                (Some(index), Some(v)) if index == component => value = Some(v),
                (Some(_), Some(_)) => {}
                _ => anyhow::bail!("{}:{}: invalid row '{}'.", source, row_no, row.trim()),
            }
        }
        let value = value.ok_or_else(|| anyhow::anyhow!(
            "{}: block at timestep {} has no row {}.",
            source,
            timestep,
            component
        ))?;
        points.push((timestep, value));
    }
    Ok(points)
}

pub fn read_msd_curve<P: AsRef<Path>>(path: P, label: &str, component: u32) -> Result<MsdCurve> {
    let path_ref = path.as_ref();
    let file = File::open(path_ref)
        .with_context(|| format!("Failed to open MSD file: {}", path_ref.display()))?;
    let points = parse_msd_blocks(BufReader::new(file), &path_ref.display().to_string(), component)?;
    debug!("{}: {} points", path_ref.display(), points.len());
    let (timesteps, values) = points.into_iter().unzip();
    Ok(MsdCurve { label: label.to_string(), timesteps, values })
}

/// Merges curves sharing one timestep column into rows `timestep v1 v2 ...`.
pub fn merge_curves(curves: &[MsdCurve]) -> Result<Vec<Vec<f64>>> {
    let Some(first) = curves.first() else {
        return Ok(Vec::new());
    };
    for c in &curves[1..] {
        if c.timesteps != first.timesteps {
            anyhow::bail!(
                "MSD curve '{}' has a different timestep sequence than '{}'.",
                c.label,
                first.label
            );
        }
    }
    Ok(first
        .timesteps
        .iter()
        .enumerate()
        .map(|(i, &t)| {
            std::iter::once(t as f64)
                .chain(curves.iter().map(|c| c.values[i]))
                .collect()
        })
        .collect())
}

pub fn run_msd_curves(config: &MsdCurvesConfig) -> Result<Vec<MsdCurve>> {
    let curves = config
        .temperatures
        .iter()
        .map(|temp| {
            let path = expand_template(&config.path_template, &[("temp", temp.as_str())]);
            read_msd_curve(path, temp, config.component)
        })
        .collect::<Result<Vec<_>>>()?;

    let rows = merge_curves(&curves)?;
    let header = std::iter::once("timestep".to_string())
        .chain(curves.iter().map(|c| format!("T={}", c.label)))
        .collect::<Vec<_>>()
        .join(" ");
    table::write_table(&config.output, Some(&header), &rows)?;
    info!("{} MSD curves ({} points each) saved to {}", curves.len(), rows.len(), config.output);
    Ok(curves)
}
