//! Plain-text tables (space separated, numpy `savetxt` style) and the
//! machine-readable propensity export.

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use trajectory_common::{
    EmptyCellValue, ExportFormat, GridParams, NormalizationMode, OutOfRangePolicy, ReferencePosition, Vec2,
};

use crate::dump::integer_value;
use crate::grid::PropensityGrid;

/// One row of the particle table:
/// `initial_x initial_y final_x final_y msd particle_id particle_type`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParticleRow {
    pub initial: Vec2,
    pub final_pos: Vec2,
    pub msd: f64,
    pub id: u64,
    pub atom_type: u32,
}

/// Everything needed to reproduce or re-render one propensity map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropensityMap {
    pub params: GridParams,
    pub reference: ReferencePosition,
    pub normalization: NormalizationMode,
    pub empty_cell: EmptyCellValue,
    pub out_of_range: OutOfRangePolicy,
    /// Number of timestep pairs behind the MSD values (0 when binned from a table).
    pub intervals: u32,
    pub grid: PropensityGrid,
}

/// Formats a float like numpy's default `%.18e` (`1.500000000000000000e+00`).
pub fn format_float(v: f64) -> String {
    if v.is_nan() {
        return "nan".to_string();
    }
    if v.is_infinite() {
        return if v > 0.0 { "inf".to_string() } else { "-inf".to_string() };
    }
    let s = format!("{:.18e}", v);
    match s.split_once('e') {
        Some((mantissa, exp)) => {
            let (sign, digits) = match exp.strip_prefix('-') {
                Some(d) => ('-', d),
                None => ('+', exp),
            };
            format!("{}e{}{:0>2}", mantissa, sign, digits)
        }
        None => s,
    }
}

fn space_writer(file: File) -> csv::Writer<BufWriter<File>> {
    csv::WriterBuilder::new()
        .delimiter(b' ')
        .has_headers(false)
        .flexible(true)
        .from_writer(BufWriter::new(file))
}

fn create(path: &Path) -> Result<File> {
    File::create(path).with_context(|| format!("Failed to create output file: {}", path.display()))
}

/// Writes a numeric table, optionally preceded by a `# header` line.
pub fn write_table<P: AsRef<Path>>(path: P, header: Option<&str>, rows: &[Vec<f64>]) -> Result<()> {
    let path_ref = path.as_ref();
    let mut file = create(path_ref)?;
    if let Some(header) = header {
        writeln!(file, "# {}", header)
            .with_context(|| format!("Failed to write header to {}", path_ref.display()))?;
    }
    let mut writer = space_writer(file);
    for row in rows {
        writer.write_record(row.iter().map(|&v| format_float(v)))?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_particle_table<P: AsRef<Path>>(path: P, rows: &[ParticleRow]) -> Result<()> {
    let path_ref = path.as_ref();
    let mut writer = space_writer(create(path_ref)?);
    for r in rows {
        writer.write_record([
            format_float(r.initial.x),
            format_float(r.initial.y),
            format_float(r.final_pos.x),
            format_float(r.final_pos.y),
            format_float(r.msd),
            format_float(r.id as f64),
            format_float(r.atom_type as f64),
        ])?;
    }
    writer.flush()?;
    info!("Particle table ({} rows) saved to {}", rows.len(), path_ref.display());
    Ok(())
}

/// Reads a whitespace-separated numeric table, skipping blank and `#` lines.
pub fn read_table<P: AsRef<Path>>(path: P, skip_rows: usize) -> Result<Vec<Vec<f64>>> {
    let path_ref = path.as_ref();
    let file = File::open(path_ref)
        .with_context(|| format!("Failed to open table: {}", path_ref.display()))?;
    let mut rows = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate().skip(skip_rows) {
        let line = line.with_context(|| format!("Failed to read {}:{}", path_ref.display(), line_no + 1))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let row = trimmed
            .split_whitespace()
            .map(str::parse::<f64>)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("{}:{}: {} in '{}'", path_ref.display(), line_no + 1, e, trimmed))?;
        rows.push(row);
    }
    Ok(rows)
}

pub fn read_particle_table<P: AsRef<Path>>(path: P) -> Result<Vec<ParticleRow>> {
    let path_ref = path.as_ref();
    read_table(path_ref, 0)?
        .into_iter()
        .enumerate()
        .map(|(i, row)| {
            if row.len() != 7 {
                anyhow::bail!(
                    "{}: row {} has {} columns, expected 7 (initial_x initial_y final_x final_y msd id type).",
                    path_ref.display(),
                    i + 1,
                    row.len()
                );
            }
            let id = integer_value(row[5]).ok_or_else(|| {
                anyhow::anyhow!("{}: row {} has invalid particle id {}.", path_ref.display(), i + 1, row[5])
            })?;
            let atom_type = integer_value(row[6])
                .and_then(|t| u32::try_from(t).ok())
                .ok_or_else(|| {
                    anyhow::anyhow!("{}: row {} has invalid particle type {}.", path_ref.display(), i + 1, row[6])
                })?;
            Ok(ParticleRow {
                initial: Vec2::new(row[0], row[1]),
                final_pos: Vec2::new(row[2], row[3]),
                msd: row[4],
                id,
                atom_type,
            })
        })
        .collect()
}

pub fn write_grid<P: AsRef<Path>>(path: P, grid: &PropensityGrid) -> Result<()> {
    let path_ref = path.as_ref();
    let mut writer = space_writer(create(path_ref)?);
    for row in grid.rows() {
        writer.write_record(row.iter().map(|&v| format_float(v)))?;
    }
    writer.flush()?;
    info!("{}x{} grid saved to {}", grid.resolution, grid.resolution, path_ref.display());
    Ok(())
}

/// Writes the propensity map as `<base>_propensity.{json,bin,msgpack}`.
pub fn export_propensity(map: &PropensityMap, format: ExportFormat, base_filename: &str) -> Result<String> {
    let filename = match format {
        ExportFormat::Json => format!("{}_propensity.json", base_filename),
        ExportFormat::Bincode => format!("{}_propensity.bin", base_filename),
        ExportFormat::Messagepack => format!("{}_propensity.msgpack", base_filename),
    };
    let mut writer = BufWriter::new(create(Path::new(&filename))?);
    match format {
        ExportFormat::Json => serde_json::to_writer(&mut writer, map)
            .context("Error serializing propensity map to JSON")?,
        ExportFormat::Bincode => bincode::serialize_into(&mut writer, map)
            .context("Error serializing propensity map to bincode")?,
        ExportFormat::Messagepack => rmp_serde::encode::write(&mut writer, map)
            .context("Error serializing propensity map to MessagePack")?,
    }
    writer.flush()?;
    info!("Propensity map saved to {} ({:?} format)", filename, format);
    Ok(filename)
}
