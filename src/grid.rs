use anyhow::Result;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use trajectory_common::{EmptyCellValue, GridParams, NormalizationMode, OutOfRangePolicy, Vec2};

/// Where a position falls on the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellLookup {
    Inside(usize, usize),
    /// Outside the box; the nearest edge cell.
    Outside { nearest: (usize, usize) },
    /// NaN coordinate, no meaningful cell.
    Invalid,
}

// Bin of `p` along one axis: floor((p - low) / cell), corrected so that a
// position exactly on the boundary `low + k * cell` lands in bin k.
#[inline(always)]
fn axis_bin(p: f64, low: f64, cell: f64) -> f64 {
    let k = ((p - low) / cell).floor();
    if p >= low + (k + 1.0) * cell {
        k + 1.0
    } else if p < low + k * cell {
        k - 1.0
    } else {
        k
    }
}

// Calculates the (x bin, y bin) for a position.
// The box is half-open: a coordinate equal to the upper bound is outside.
#[inline(always)]
pub fn get_grid_cell(pos: Vec2, params: &GridParams) -> CellLookup {
    if pos.x.is_nan() || pos.y.is_nan() {
        return CellLookup::Invalid;
    }
    let max_idx = (params.resolution - 1) as usize;
    let clamp = |f: f64| if f < 0.0 { 0 } else { (f.min(max_idx as f64) as usize).min(max_idx) };
    let bx = clamp(axis_bin(pos.x, params.x_low, params.cell_width));
    let by = clamp(axis_bin(pos.y, params.y_low, params.cell_height));

    let inside_x = pos.x >= params.x_low && pos.x < params.x_hi;
    let inside_y = pos.y >= params.y_low && pos.y < params.y_hi;
    if inside_x && inside_y {
        CellLookup::Inside(bx, by)
    } else {
        CellLookup::Outside { nearest: (bx, by) }
    }
}

/// Accumulates per-cell sums and counts of a per-particle value.
#[derive(Debug)]
pub struct SpatialBinner {
    params: GridParams,
    policy: OutOfRangePolicy,
    sums: Vec<f64>,
    counts: Vec<u32>,
    clamped: usize,
    dropped: usize,
}

impl SpatialBinner {
    pub fn new(params: GridParams, policy: OutOfRangePolicy) -> Self {
        let num_cells = params.num_cells as usize;
        SpatialBinner {
            params,
            policy,
            sums: vec![0.0; num_cells],
            counts: vec![0; num_cells],
            clamped: 0,
            dropped: 0,
        }
    }

    // Row-major with the x bin as row index.
    #[inline(always)]
    fn flat_index(&self, binx: usize, biny: usize) -> usize {
        binx * self.params.resolution as usize + biny
    }

    /// Adds `value` to the cell holding `pos`, applying the out-of-range policy.
    pub fn add(&mut self, id: u64, pos: Vec2, value: f64) -> Result<()> {
        let (binx, biny) = match (get_grid_cell(pos, &self.params), self.policy) {
            (CellLookup::Inside(bx, by), _) => (bx, by),
            (CellLookup::Outside { nearest }, OutOfRangePolicy::Clamp) => {
                self.clamped += 1;
                nearest
            }
            (CellLookup::Outside { .. } | CellLookup::Invalid, OutOfRangePolicy::Drop)
            | (CellLookup::Invalid, OutOfRangePolicy::Clamp) => {
                self.dropped += 1;
                return Ok(());
            }
            (_, OutOfRangePolicy::Fail) => anyhow::bail!(
                "Particle {} at ({}, {}) lies outside the box [{}, {}) x [{}, {}).",
                id,
                pos.x,
                pos.y,
                self.params.x_low,
                self.params.x_hi,
                self.params.y_low,
                self.params.y_hi
            ),
        };
        let idx = self.flat_index(binx, biny);
        self.sums[idx] += value;
        self.counts[idx] += 1;
        Ok(())
    }

    /// Bins every particle of aligned id/position/value slices.
    pub fn add_all(&mut self, ids: &[u64], positions: &[Vec2], values: &[f64]) -> Result<()> {
        if ids.len() != positions.len() || ids.len() != values.len() {
            anyhow::bail!(
                "Binning inputs differ in length (ids {}, positions {}, values {}).",
                ids.len(),
                positions.len(),
                values.len()
            );
        }
        for ((&id, &pos), &value) in ids.iter().zip(positions).zip(values) {
            self.add(id, pos, value)?;
        }
        if self.clamped > 0 {
            warn!("{} particles outside the box were clamped to edge cells.", self.clamped);
        }
        if self.dropped > 0 {
            warn!("{} particles outside the box were dropped.", self.dropped);
        }
        Ok(())
    }

    /// Averages every occupied cell; empty cells take the configured sentinel.
    pub fn average(self, empty_cell: EmptyCellValue) -> PropensityGrid {
        let empty = empty_cell.value();
        let values: Vec<f64> = self
            .sums
            .iter()
            .zip(&self.counts)
            .map(|(&sum, &count)| if count > 0 { sum / count as f64 } else { empty })
            .collect();
        let occupied = self.counts.iter().filter(|&&c| c > 0).count();
        debug!("Averaged grid: {} of {} cells occupied.", occupied, values.len());
        PropensityGrid {
            resolution: self.params.resolution,
            values,
            counts: self.counts,
            clamped: self.clamped,
            dropped: self.dropped,
        }
    }
}

/// Averaged (and later normalized) R x R grid, row index = x bin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropensityGrid {
    pub resolution: u32,
    /// Empty cells may hold NaN, written as `null` in every export format.
    #[serde(with = "nan_as_null")]
    pub values: Vec<f64>,
    pub counts: Vec<u32>,
    pub clamped: usize,
    pub dropped: usize,
}

impl PropensityGrid {
    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        self.values.chunks(self.resolution as usize)
    }

    /// Global (min, max) over non-NaN cells.
    pub fn value_range(&self) -> Option<(f64, f64)> {
        self.values
            .iter()
            .copied()
            .filter(|v| !v.is_nan())
            .fold(None, |acc, v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }

    /// Remaps every cell with the global min/max. A zero divisor maps all
    /// cells to zero; NaN cells stay NaN.
    pub fn normalize(&mut self, mode: NormalizationMode) {
        let Some((min, max)) = self.value_range() else {
            warn!("Grid holds no values; skipping normalization.");
            return;
        };
        let divisor = match mode {
            NormalizationMode::Legacy => max,
            NormalizationMode::MinMax => max - min,
        };
        debug!("Normalizing grid ({:?}): min {}, max {}.", mode, min, max);
        if divisor == 0.0 {
            warn!("Normalization divisor is zero (min {}, max {}); grid set to zero.", min, max);
        }
        for v in self.values.iter_mut().filter(|v| !v.is_nan()) {
            *v = if divisor == 0.0 { 0.0 } else { (*v - min) / divisor };
        }
    }
}

// JSON has no NaN; empty cells round-trip through `Option<f64>`.
mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        values
            .iter()
            .map(|v| if v.is_nan() { None } else { Some(*v) })
            .collect::<Vec<Option<f64>>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        let values = Vec::<Option<f64>>::deserialize(deserializer)?;
        Ok(values.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
    }
}
