use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::Parser;

use crate::constants::DEFAULT_DAYS_APART;
use crate::drift::SelectionCriteria;
use crate::inversion::Weighting;

/// OBS clock drift estimation from ambient-noise cross-correlations
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Station table (project code needs_correction lat lon elevation sensor_type [start end])
    #[arg(long, value_name = "FILE")]
    pub stations: PathBuf,

    /// Directory holding the correlation traces STA1_STA2_<epoch>_<days>.<ext>
    #[arg(long, value_name = "DIR")]
    pub data_dir: PathBuf,

    /// Extension of the correlation trace files
    #[arg(long, default_value = "json")]
    pub extension: String,

    /// Time origin of the drift model (RFC 3339)
    #[arg(long, value_name = "TIME")]
    pub reference_time: DateTime<Utc>,

    /// JSON array of processing bands; one default band if omitted
    #[arg(long, value_name = "FILE")]
    pub params: Option<PathBuf>,

    /// Maximum number of shift/inversion iterations
    #[arg(long, default_value_t = 5)]
    pub iterations: usize,

    /// Stop when no drift rate or offset changes by more than this
    #[arg(long, default_value_t = 1e-4)]
    pub tolerance: f64,

    /// Observation weighting in the inversion
    #[arg(long, value_enum, default_value_t = Weighting::Uniform)]
    pub weighting: Weighting,

    /// Flag shifts with a residual above this many seconds as outliers
    #[arg(long, value_name = "SECONDS")]
    pub max_residual: Option<f64>,

    /// Minimum number of correlation periods a station needs; enables station selection
    #[arg(long)]
    pub min_periods: Option<usize>,

    /// Minimum correlations per period for stations needing correction
    #[arg(long, default_value_t = 1)]
    pub min_corr_obs: usize,

    /// Minimum correlations per period for reference stations
    #[arg(long, default_value_t = 1)]
    pub min_corr_land: usize,

    /// Correlations closer than this many days share a period
    #[arg(long, default_value_t = DEFAULT_DAYS_APART)]
    pub days_apart: f64,

    /// Seed the a priori drift from the earliest and latest trace of each pair
    #[arg(long, default_value_t = false)]
    pub seed_from_pairs: bool,

    /// Write the JSON results to a file
    #[arg(long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Write the observation table in CSV format to a file
    #[arg(long, value_name = "FILE")]
    pub write_csv: Option<PathBuf>,

    /// Worker threads for shift estimation (0 = one per core)
    #[arg(long, default_value_t = 0)]
    pub threads: usize,

    /// Verbose logging (DEBUG level)
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}

impl Config {
    /// Station selection settings, if requested
    pub fn selection(&self) -> Option<SelectionCriteria> {
        self.min_periods.map(|min_periods| SelectionCriteria {
            min_periods,
            min_corr_obs: self.min_corr_obs,
            min_corr_land: self.min_corr_land,
            days_apart: self.days_apart,
        })
    }
}
