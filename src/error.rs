// Error types for clock drift estimation
//
// Hard failures only. Expected per-correlation outcomes (separation or SNR
// gate failures) are `correlation::Exclusion` values, not errors.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriftError {
    #[error("invalid coordinate: lat {lat}, lon {lon}")]
    InvalidCoordinate { lat: f64, lon: f64 },

    #[error("window [{start}, {end}] outside trace half [{lower}, {upper})")]
    WindowOutOfBounds {
        start: i64,
        end: i64,
        lower: i64,
        upper: i64,
    },

    #[error("SNR undefined: {0}")]
    UndefinedSnr(String),

    #[error("no a priori drift estimate for station {0}")]
    MissingAprioriDrift(String),

    #[error("station {0} is not connected to a reference station")]
    UnresolvedStation(String),

    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("unsupported trace format in {path}: {reason}")]
    UnsupportedFormat { path: PathBuf, reason: String },

    #[error("unknown station: {0}")]
    UnknownStation(String),

    #[error("invalid station file line {line}: {reason}")]
    InvalidStationFile { line: usize, reason: String },

    #[error("invalid correlation file name {0}")]
    InvalidCorrelationName(String),

    #[error("invalid processing parameters: {0}")]
    InvalidParameters(String),

    #[error("inversion failed: {0}")]
    Inversion(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for DriftError {
    fn from(err: std::io::Error) -> Self {
        DriftError::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DriftError>;
