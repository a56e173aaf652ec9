use serde::{Deserialize, Serialize};

/// Grid geometry derived from the configuration, used for every binning call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridParams {
    // Box (lower bound inclusive, upper bound exclusive)
    pub x_low: f64,
    pub y_low: f64,
    pub x_hi: f64,
    pub y_hi: f64,

    // Grid
    pub resolution: u32, // Cells per axis (R)
    pub cell_width: f64,
    pub cell_height: f64,
    pub num_cells: u32, // R * R
}
