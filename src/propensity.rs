use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Instant;
use trajectory_common::{PropensityConfig, ReferencePosition, Snapshot, Vec2};

use crate::dump::{self, DumpReader};
use crate::grid::SpatialBinner;
use crate::msd::{DisplacementAccumulator, MsdResult};
use crate::table::{self, ParticleRow, PropensityMap};

/// Streams the displacement dump once, accumulating every configured pair.
///
/// Only frames still referenced by an unprocessed pair are held in memory.
pub fn accumulate_msd(config: &PropensityConfig, pairs: &[(u64, u64)]) -> Result<MsdResult> {
    let dump_cfg = &config.dump;

    // --- Reference counts: how many pending pairs still need each frame ---
    let mut uses: HashMap<u64, usize> = HashMap::new();
    for &(a, b) in pairs {
        *uses.entry(a).or_insert(0) += 1;
        *uses.entry(b).or_insert(0) += 1;
    }
    let needed_frames = uses.len();

    let mut pending: Vec<(u64, u64)> = pairs.to_vec();
    let mut loaded: HashMap<u64, Snapshot> = HashMap::new();
    let mut accumulator = DisplacementAccumulator::new(config.num_particles);
    let mut reader = DumpReader::open(&dump_cfg.path, dump_cfg.columns.clone())?;

    // --- Progress Bar (one tick per loaded frame) ---
    let progress = ProgressBar::new(needed_frames as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} frames ({percent}%) [{eta}]")?
            .progress_chars("#>-"),
    );

    info!(
        "Accumulating {} intervals over {} frames from {}...",
        pairs.len(),
        needed_frames,
        dump_cfg.path
    );
    // --- Single pass over the dump ---
    while !pending.is_empty() {
        // Frames no pair needs, or already held, are skipped unparsed.
        let next = reader.next_snapshot(
            |t| uses.get(&t).is_some_and(|&u| u > 0) && !loaded.contains_key(&t),
            &dump_cfg.displacement_x,
            &dump_cfg.displacement_y,
        )?;
        let Some(snapshot) = next else {
            // End of file with pairs left: report every timestep never seen.
            let mut missing: Vec<u64> = pending
                .iter()
                .flat_map(|&(a, b)| [a, b])
                .filter(|t| !loaded.contains_key(t))
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            missing.sort_unstable();
            progress.abandon();
            anyhow::bail!("Timesteps {:?} not found in {}.", missing, dump_cfg.path);
        };
        snapshot.ensure_count(config.num_particles)?;
        debug!("Loaded timestep {} ({} particles).", snapshot.timestep, snapshot.len());
        loaded.insert(snapshot.timestep, snapshot);
        progress.inc(1);

        // Pairs whose both frames are now in memory.
        let (ready, rest): (Vec<(u64, u64)>, Vec<(u64, u64)>) = std::mem::take(&mut pending)
            .into_iter()
            .partition(|(a, b)| loaded.contains_key(a) && loaded.contains_key(b));
        pending = rest;

        for (a, b) in ready {
            accumulator.add_interval(&loaded[&a], &loaded[&b])?;
            // Evict frames with no remaining users.
            for t in [a, b] {
                if let Some(count) = uses.get_mut(&t) {
                    *count -= 1;
                    if *count == 0 {
                        loaded.remove(&t);
                    }
                }
            }
        }
    }
    progress.finish_with_message("done");

    accumulator.finish()
}

/// Joins the MSD values with initial and final positions into table rows.
pub fn build_rows(msd: &MsdResult, initial: &Snapshot, final_snap: &Snapshot) -> Result<Vec<ParticleRow>> {
    for snap in [initial, final_snap] {
        if !snap.ids().eq(msd.ids.iter().copied()) {
            anyhow::bail!(
                "Particle ids at timestep {} do not match the displacement frames.",
                snap.timestep
            );
        }
    }
    Ok(initial
        .atoms()
        .iter()
        .zip(final_snap.atoms())
        .zip(&msd.msd)
        .map(|((i, f), &value)| ParticleRow {
            initial: i.pos,
            final_pos: f.pos,
            msd: value,
            id: f.id,
            atom_type: f.atom_type,
        })
        .collect())
}

/// Bins table rows by the configured reference position and normalizes the grid.
pub fn bin_rows(config: &PropensityConfig, rows: &[ParticleRow], intervals: u32) -> Result<PropensityMap> {
    let params = config.get_grid_params();
    let grid_cfg = &config.grid;
    let positions: Vec<Vec2> = rows
        .iter()
        .map(|row| match grid_cfg.reference {
            ReferencePosition::Initial => row.initial,
            ReferencePosition::Final => row.final_pos,
        })
        .collect();
    let ids: Vec<u64> = rows.iter().map(|row| row.id).collect();
    let values: Vec<f64> = rows.iter().map(|row| row.msd).collect();

    let mut binner = SpatialBinner::new(params.clone(), grid_cfg.out_of_range);
    binner
        .add_all(&ids, &positions, &values)
        .with_context(|| format!("Binning by {:?} position failed", grid_cfg.reference))?;
    let mut grid = binner.average(grid_cfg.empty_cell);
    grid.normalize(grid_cfg.normalization);

    Ok(PropensityMap {
        params,
        reference: grid_cfg.reference,
        normalization: grid_cfg.normalization,
        empty_cell: grid_cfg.empty_cell,
        out_of_range: grid_cfg.out_of_range,
        intervals,
        grid,
    })
}

fn write_map(config: &PropensityConfig, map: &PropensityMap) -> Result<()> {
    table::write_grid(&config.output.grid, &map.grid)?;
    if let Some(format) = config.output.format {
        table::export_propensity(map, format, &config.output.base_filename)?;
    }
    Ok(())
}

/// Full pipeline: dump frames -> per-particle MSD table -> normalized grid.
pub fn run_propensity(config: &PropensityConfig) -> Result<PropensityMap> {
    let start_time = Instant::now();
    let dump_cfg = &config.dump;
    let pairs = config.timesteps.resolve_pairs()?;
    let initial_step = config
        .timesteps
        .initial_step(&pairs)
        .ok_or_else(|| anyhow::anyhow!("No initial timestep could be resolved."))?;
    let final_step = config
        .timesteps
        .final_step(&pairs)
        .ok_or_else(|| anyhow::anyhow!("No final timestep could be resolved."))?;

    // --- Displacements ---
    let msd = accumulate_msd(config, &pairs)?;
    info!("Mean squared displacement computed over {} intervals.", msd.intervals);

    // --- Reference positions (wrapped coordinates) ---
    info!("Reading initial positions (timestep {}) from {}", initial_step, dump_cfg.path);
    let initial = dump::read_snapshot(
        &dump_cfg.path,
        dump_cfg.columns.clone(),
        initial_step,
        &dump_cfg.position_x,
        &dump_cfg.position_y,
    )?;
    info!("Reading final positions (timestep {}) from {}", final_step, dump_cfg.final_path());
    let final_snap = dump::read_snapshot(
        dump_cfg.final_path(),
        dump_cfg.columns.clone(),
        final_step,
        &dump_cfg.position_x,
        &dump_cfg.position_y,
    )?;
    initial.ensure_count(config.num_particles)?;
    final_snap.ensure_count(config.num_particles)?;

    // --- Particle table, then grid ---
    let rows = build_rows(&msd, &initial, &final_snap)?;
    table::write_particle_table(&config.output.particle_table, &rows)?;

    let map = bin_rows(config, &rows, msd.intervals)?;
    write_map(config, &map)?;
    info!("Propensity analysis finished in {:.2?}.", start_time.elapsed());
    Ok(map)
}

/// Binning only: reads an existing particle table instead of dump files.
pub fn run_binning(config: &PropensityConfig, table_path: Option<&Path>) -> Result<PropensityMap> {
    let path = table_path.unwrap_or_else(|| Path::new(&config.output.particle_table));
    let rows = table::read_particle_table(path)?;
    info!("Read {} particles from {}", rows.len(), path.display());
    if rows.len() != config.num_particles {
        anyhow::bail!(
            "{} holds {} particles, expected {}.",
            path.display(),
            rows.len(),
            config.num_particles
        );
    }
    let map = bin_rows(config, &rows, 0)?;
    write_map(config, &map)?;
    Ok(map)
}
