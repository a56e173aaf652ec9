pub mod config;
pub mod grid_params;
pub mod snapshot;
pub mod vecmath;

// Re-export key types for easier use by dependent crates
pub use config::{
    expand_template, AnalysisConfig, BoxBounds, DumpConfig, EmptyCellValue, ExportFormat,
    GridConfig, GyrationConfig, MsdCurvesConfig, NormalizationMode, OutOfRangePolicy,
    OutputConfig, PropensityConfig, ReferencePosition, RgMode, ThermoConfig, TimestepConfig,
};
pub use grid_params::GridParams;
pub use snapshot::{Atom, Snapshot};
pub use vecmath::Vec2;
