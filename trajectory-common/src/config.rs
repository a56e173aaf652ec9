use serde::{Deserialize, Serialize};
use anyhow::Result;
use crate::grid_params::GridParams;
use std::path::Path;
use std::str::FromStr;

// Simulation box in the coordinate convention of the binning snapshot
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct BoxBounds {
    pub x_low: f64,
    pub y_low: f64,
    pub x_hi: f64,
    pub y_hi: f64,
}

// Dump files and the columns read from them
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DumpConfig {
    /// Dump holding every frame used for displacements and initial positions.
    pub path: String,
    /// Dump holding the final (binning) positions. Defaults to `path`.
    #[serde(default)]
    pub final_path: Option<String>,
    /// Explicit column names for dumps whose `ITEM: ATOMS` line carries none.
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default = "default_displacement_x")]
    pub displacement_x: String,
    #[serde(default = "default_displacement_y")]
    pub displacement_y: String,
    #[serde(default = "default_position_x")]
    pub position_x: String,
    #[serde(default = "default_position_y")]
    pub position_y: String,
}

impl DumpConfig {
    pub fn final_path(&self) -> &str {
        self.final_path.as_deref().unwrap_or(&self.path)
    }
}

// Timestep pairs for the displacement accumulator
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct TimestepConfig {
    /// Explicit (from, to) pairs. Takes precedence over the range below.
    #[serde(default)]
    pub pairs: Vec<(u64, u64)>,
    #[serde(default)]
    pub start: Option<u64>,
    #[serde(default)]
    pub stop: Option<u64>, // Exclusive
    #[serde(default)]
    pub stride: Option<u64>,
    /// Timestep for initial positions (default: start of the first pair).
    #[serde(default)]
    pub initial: Option<u64>,
    /// Timestep for final positions (default: end of the last pair).
    #[serde(default, rename = "final")]
    pub final_step: Option<u64>,
}

impl TimestepConfig {
    /// Resolves the configured pairs. A range `start..stop` by `stride` yields
    /// consecutive pairs `(s_k, s_k + stride)` for all but the last step.
    pub fn resolve_pairs(&self) -> Result<Vec<(u64, u64)>> {
        if !self.pairs.is_empty() {
            return Ok(self.pairs.clone());
        }
        let (start, stop, stride) = match (self.start, self.stop, self.stride) {
            (Some(start), Some(stop), Some(stride)) => (start, stop, stride),
            _ => anyhow::bail!("timesteps needs either `pairs` or all of `start`, `stop` and `stride`."),
        };
        if stride == 0 {
            anyhow::bail!("timesteps.stride must be greater than 0.");
        }
        let steps: Vec<u64> = (start..stop).step_by(stride as usize).collect();
        let pairs: Vec<(u64, u64)> = steps.windows(2).map(|w| (w[0], w[0] + stride)).collect();
        if pairs.is_empty() {
            anyhow::bail!("timestep range {}..{} by {} yields no pairs.", start, stop, stride);
        }
        Ok(pairs)
    }

    pub fn initial_step(&self, pairs: &[(u64, u64)]) -> Option<u64> {
        self.initial.or_else(|| pairs.first().map(|p| p.0))
    }

    pub fn final_step(&self, pairs: &[(u64, u64)]) -> Option<u64> {
        self.final_step.or_else(|| pairs.last().map(|p| p.1))
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferencePosition {
    Initial,
    Final,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptyCellValue {
    Zero,
    Nan,
}

impl EmptyCellValue {
    pub fn value(self) -> f64 {
        match self {
            EmptyCellValue::Zero => 0.0,
            EmptyCellValue::Nan => f64::NAN,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutOfRangePolicy {
    Fail,
    Clamp,
    Drop,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NormalizationMode {
    /// `(v - min) / max`, matching the historical region files.
    Legacy,
    /// `(v - min) / (max - min)`.
    MinMax,
}

// Binning and normalization settings
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct GridConfig {
    #[serde(default = "default_resolution")]
    pub resolution: u32,
    #[serde(default = "default_reference")]
    pub reference: ReferencePosition,
    #[serde(default = "default_empty_cell")]
    pub empty_cell: EmptyCellValue,
    #[serde(default = "default_out_of_range")]
    pub out_of_range: OutOfRangePolicy,
    #[serde(default = "default_normalization")]
    pub normalization: NormalizationMode,
}

impl Default for GridConfig {
    fn default() -> Self {
        GridConfig {
            resolution: default_resolution(),
            reference: default_reference(),
            empty_cell: default_empty_cell(),
            out_of_range: default_out_of_range(),
            normalization: default_normalization(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Bincode,
    Messagepack,
}

// Output paths for the propensity pipeline
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct OutputConfig {
    /// Per-particle table: initial_x initial_y final_x final_y msd id type
    pub particle_table: String,
    /// Normalized R x R grid
    pub grid: String,
    /// Optional machine-readable export of the whole propensity map.
    #[serde(default)]
    pub format: Option<ExportFormat>,
    #[serde(default = "default_base_filename")]
    pub base_filename: String,
}

// MSD + propensity map analysis
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PropensityConfig {
    pub num_particles: usize,
    pub bounds: BoxBounds,
    pub dump: DumpConfig,
    #[serde(default)]
    pub timesteps: TimestepConfig,
    #[serde(default)]
    pub grid: GridConfig,
    pub output: OutputConfig,
}

impl PropensityConfig {
    /// Converts the configuration into the grid geometry used at runtime.
    pub fn get_grid_params(&self) -> GridParams {
        let b = &self.bounds;
        let resolution = self.grid.resolution;
        let cell_width = (b.x_hi - b.x_low) / resolution as f64;
        let cell_height = (b.y_hi - b.y_low) / resolution as f64;

        GridParams {
            x_low: b.x_low,
            y_low: b.y_low,
            x_hi: b.x_hi,
            y_hi: b.y_hi,
            resolution,
            cell_width,
            cell_height,
            num_cells: resolution * resolution,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.num_particles == 0 {
            anyhow::bail!("propensity.num_particles must be greater than 0.");
        }
        let b = &self.bounds;
        if !(b.x_hi > b.x_low) || !(b.y_hi > b.y_low) {
            anyhow::bail!(
                "propensity.bounds must satisfy x_hi > x_low and y_hi > y_low (got [{}, {}) x [{}, {})).",
                b.x_low, b.x_hi, b.y_low, b.y_hi
            );
        }
        if self.grid.resolution == 0 {
            anyhow::bail!("propensity.grid.resolution must be greater than 0.");
        }
        if self.grid.resolution.checked_mul(self.grid.resolution).is_none() {
            anyhow::bail!(
                "propensity.grid.resolution {} is too large (R * R cells must fit in 32 bits).",
                self.grid.resolution
            );
        }
        let pairs = self.timesteps.resolve_pairs()?;
        if let Some(&(from, to)) = pairs.iter().find(|(from, to)| from == to) {
            anyhow::bail!("timestep pair ({}, {}) compares a frame with itself.", from, to);
        }
        Ok(())
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RgMode {
    /// Average RG^2 against time.
    Squared,
    /// Average RG (square root of each RG^2 sample) against time.
    Linear,
    /// Average RG^2 against ln(time).
    SemiLog,
}

impl FromStr for RgMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "squared" | "1" => Ok(RgMode::Squared),
            "linear" | "2" => Ok(RgMode::Linear),
            "semi-log" | "3" => Ok(RgMode::SemiLog),
            other => Err(format!("unknown RG mode '{}' (expected squared, linear or semi-log)", other)),
        }
    }
}

// MSD(t) curves per temperature
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MsdCurvesConfig {
    /// Path with a `{temp}` placeholder.
    pub path_template: String,
    pub temperatures: Vec<String>,
    /// Row index holding the total MSD in each block.
    #[serde(default = "default_msd_component")]
    pub component: u32,
    pub output: String,
}

// Radius of gyration averaging over runs and shear directions
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct GyrationConfig {
    /// Path with `{run}`, `{dir}` and `{series}` placeholders.
    pub path_template: String,
    /// Inclusive run number range.
    pub runs: (u32, u32),
    pub dirs: Vec<String>,
    pub series: Vec<String>,
    #[serde(default = "default_rg_mode")]
    pub mode: RgMode,
    #[serde(default = "default_rg_skip_rows")]
    pub skip_rows: usize,
    pub output: String,
}

// Thermo column averages per temperature
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ThermoConfig {
    /// Path with a `{temp}` placeholder.
    pub path_template: String,
    pub temperatures: Vec<String>,
    #[serde(default = "default_thermo_column")]
    pub column: String,
    pub output: String,
}

// Main analysis configuration structure, loaded from config.toml.
// Each section is optional; a subcommand fails only if its own section is missing.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct AnalysisConfig {
    #[serde(default)]
    pub propensity: Option<PropensityConfig>,
    #[serde(default)]
    pub msd_curves: Option<MsdCurvesConfig>,
    #[serde(default)]
    pub gyration: Option<GyrationConfig>,
    #[serde(default)]
    pub thermo: Option<ThermoConfig>,
}

impl AnalysisConfig {
    /// Loads the analysis configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();

        let config_str = std::fs::read_to_string(path_ref)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path_ref.display(), e))?;
        let config = Self::from_toml_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Invalid config '{}': {}", path_ref.display(), e))?;
        Ok(config)
    }

    /// Parses and validates a configuration held in memory.
    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        let config: AnalysisConfig = toml::from_str(config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse TOML: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if let Some(p) = &self.propensity {
            p.validate()?;
        }
        if let Some(m) = &self.msd_curves {
            require_placeholders(&m.path_template, &["temp"], "msd_curves.path_template")?;
            if m.temperatures.is_empty() {
                anyhow::bail!("msd_curves.temperatures must not be empty.");
            }
        }
        if let Some(g) = &self.gyration {
            require_placeholders(&g.path_template, &["run", "dir", "series"], "gyration.path_template")?;
            if g.runs.0 > g.runs.1 {
                anyhow::bail!("gyration.runs must be an ascending inclusive range (got {:?}).", g.runs);
            }
            if g.dirs.is_empty() || g.series.is_empty() {
                anyhow::bail!("gyration.dirs and gyration.series must not be empty.");
            }
        }
        if let Some(t) = &self.thermo {
            require_placeholders(&t.path_template, &["temp"], "thermo.path_template")?;
            if t.temperatures.is_empty() {
                anyhow::bail!("thermo.temperatures must not be empty.");
            }
            for temp in &t.temperatures {
                if temp.parse::<f64>().is_err() {
                    anyhow::bail!("thermo temperature '{}' is not a number.", temp);
                }
            }
        }
        Ok(())
    }

    pub fn propensity(&self) -> Result<&PropensityConfig> {
        self.propensity.as_ref().ok_or_else(|| anyhow::anyhow!("config has no [propensity] section."))
    }

    pub fn msd_curves(&self) -> Result<&MsdCurvesConfig> {
        self.msd_curves.as_ref().ok_or_else(|| anyhow::anyhow!("config has no [msd_curves] section."))
    }

    pub fn gyration(&self) -> Result<&GyrationConfig> {
        self.gyration.as_ref().ok_or_else(|| anyhow::anyhow!("config has no [gyration] section."))
    }

    pub fn thermo(&self) -> Result<&ThermoConfig> {
        self.thermo.as_ref().ok_or_else(|| anyhow::anyhow!("config has no [thermo] section."))
    }
}

/// Replaces every `{name}` in `template` with its value.
pub fn expand_template(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{}}}", name), value)
    })
}

fn require_placeholders(template: &str, names: &[&str], field: &str) -> Result<()> {
    for name in names {
        if !template.contains(&format!("{{{}}}", name)) {
            anyhow::bail!("{} must contain the {{{}}} placeholder.", field, name);
        }
    }
    Ok(())
}

// Default functions
fn default_displacement_x() -> String {
    "xu".to_string()
}

fn default_displacement_y() -> String {
    "yu".to_string()
}

fn default_position_x() -> String {
    "x".to_string()
}

fn default_position_y() -> String {
    "y".to_string()
}

fn default_resolution() -> u32 {
    100
}

fn default_reference() -> ReferencePosition {
    ReferencePosition::Final
}

fn default_empty_cell() -> EmptyCellValue {
    EmptyCellValue::Zero
}

fn default_out_of_range() -> OutOfRangePolicy {
    OutOfRangePolicy::Fail
}

fn default_normalization() -> NormalizationMode {
    NormalizationMode::Legacy
}

fn default_base_filename() -> String {
    "propensity".to_string()
}

fn default_msd_component() -> u32 {
    4
}

fn default_rg_mode() -> RgMode {
    RgMode::Squared
}

fn default_rg_skip_rows() -> usize {
    2
}

fn default_thermo_column() -> String {
    "Volume".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROPENSITY: &str = r#"
        [propensity]
        num_particles = 100352

        [propensity.bounds]
        x_low = 298.543
        y_low = 298.543
        x_hi = 703.216
        y_hi = 703.216

        [propensity.dump]
        path = "equil.dump"
        final_path = "remapped.dump"

        [propensity.timesteps]
        start = 50000
        stop = 660000
        stride = 10000

        [propensity.output]
        particle_table = "table.dat"
        grid = "grid.dat"
    "#;

    #[test]
    fn propensity_defaults_and_range_pairs() {
        let config = AnalysisConfig::from_toml_str(PROPENSITY).unwrap();
        let p = config.propensity().unwrap();
        assert_eq!(p.dump.displacement_x, "xu");
        assert_eq!(p.dump.position_y, "y");
        assert_eq!(p.dump.final_path(), "remapped.dump");
        assert_eq!(p.grid.resolution, 100);
        assert_eq!(p.grid.reference, ReferencePosition::Final);
        assert_eq!(p.grid.out_of_range, OutOfRangePolicy::Fail);
        assert_eq!(p.grid.normalization, NormalizationMode::Legacy);

        let pairs = p.timesteps.resolve_pairs().unwrap();
        assert_eq!(pairs.len(), 60);
        assert_eq!(pairs[0], (50000, 60000));
        assert_eq!(pairs[59], (640000, 650000));
        assert_eq!(p.timesteps.initial_step(&pairs), Some(50000));
        assert_eq!(p.timesteps.final_step(&pairs), Some(650000));

        let params = p.get_grid_params();
        assert!((params.cell_width - 4.04673).abs() < 1e-9);
        assert_eq!(params.num_cells, 10_000);
        assert!(config.thermo().is_err());
    }

    #[test]
    fn explicit_pairs_take_precedence() {
        let toml = PROPENSITY.replace("start = 50000", "pairs = [[0, 10], [10, 30]]\nstart = 50000");
        let config = AnalysisConfig::from_toml_str(&toml).unwrap();
        let pairs = config.propensity().unwrap().timesteps.resolve_pairs().unwrap();
        assert_eq!(pairs, vec![(0, 10), (10, 30)]);
    }

    #[test]
    fn invalid_bounds_are_rejected() {
        let toml = PROPENSITY.replace("x_hi = 703.216", "x_hi = 100.0");
        assert!(AnalysisConfig::from_toml_str(&toml).is_err());
    }

    #[test]
    fn oversized_resolution_is_rejected() {
        let grid = |r: u32| format!("{}\n[propensity.grid]\nresolution = {}\n", PROPENSITY, r);
        let err = AnalysisConfig::from_toml_str(&grid(65536)).unwrap_err();
        assert!(err.to_string().contains("too large"), "{}", err);
        let config = AnalysisConfig::from_toml_str(&grid(65535)).unwrap();
        assert_eq!(config.propensity().unwrap().get_grid_params().num_cells, 65535 * 65535);
    }

    #[test]
    fn enum_spellings_parse() {
        let toml = format!(
            "{}\n[propensity.grid]\nresolution = 2\nreference = \"initial\"\nempty_cell = \"nan\"\nout_of_range = \"drop\"\nnormalization = \"min-max\"\n",
            PROPENSITY
        );
        let config = AnalysisConfig::from_toml_str(&toml).unwrap();
        let grid = &config.propensity().unwrap().grid;
        assert_eq!(grid.resolution, 2);
        assert_eq!(grid.reference, ReferencePosition::Initial);
        assert!(grid.empty_cell.value().is_nan());
        assert_eq!(grid.out_of_range, OutOfRangePolicy::Drop);
        assert_eq!(grid.normalization, NormalizationMode::MinMax);
    }

    #[test]
    fn templates_expand_and_require_placeholders() {
        assert_eq!(
            expand_template("shear{run}.{dir}.e{series}.rg", &[("run", "3"), ("dir", "xy"), ("series", "0.1")]),
            "shear3.xy.e0.1.rg"
        );
        let bad = "[thermo]\npath_template = \"log.txt\"\ntemperatures = [\"0.2\"]\noutput = \"o.dat\"\n";
        assert!(AnalysisConfig::from_toml_str(bad).is_err());
        let good = bad.replace("log.txt", "log.{temp}");
        let config = AnalysisConfig::from_toml_str(&good).unwrap();
        assert_eq!(config.thermo().unwrap().column, "Volume");
    }

    #[test]
    fn shipped_config_is_valid() {
        let config = AnalysisConfig::from_toml_str(include_str!("../../config.toml")).unwrap();
        assert_eq!(config.propensity().unwrap().output.format, Some(ExportFormat::Json));
        assert_eq!(config.gyration().unwrap().runs, (1, 40));
        assert_eq!(config.msd_curves().unwrap().temperatures.len(), 10);
        assert_eq!(config.thermo().unwrap().temperatures.len(), 18);
    }

    #[test]
    fn rg_mode_accepts_names_and_legacy_numbers() {
        assert_eq!("squared".parse::<RgMode>().unwrap(), RgMode::Squared);
        assert_eq!("2".parse::<RgMode>().unwrap(), RgMode::Linear);
        assert_eq!("semi-log".parse::<RgMode>().unwrap(), RgMode::SemiLog);
        assert!("4".parse::<RgMode>().is_err());
    }
}
