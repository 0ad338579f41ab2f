// Correlation entities and correlation file discovery
//
// File names follow STA1_STA2_<average date, epoch seconds>_<days>.<ext>.
// One Correlation is created per file and per processing band.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::constants::SECONDS_PER_DAY;
use crate::error::{DriftError, Result};
use crate::snr::Snr;
use crate::station::{Station, StationPair};
use crate::windowing::SignalWindows;

/// Why a correlation produced no apparent shift in a pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Exclusion {
    /// Station separation below `dist_trh` minimum wavelengths
    InsufficientSeparation { ratio: f64 },
    /// Causal or acausal SNR below `snr_trh`
    InsufficientSnr { causal: f64, acausal: f64 },
    /// Noise windows too short or flat to define an SNR
    UndefinedSnr(String),
    /// Hard failure for this correlation (missing trace, bad window, ...)
    Failed(String),
}

impl fmt::Display for Exclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exclusion::InsufficientSeparation { ratio } => {
                write!(f, "insufficient separation ({:.2} wavelengths)", ratio)
            }
            Exclusion::InsufficientSnr { causal, acausal } => {
                write!(f, "insufficient SNR (causal {:.1}, acausal {:.1})", causal, acausal)
            }
            Exclusion::UndefinedSnr(reason) => write!(f, "undefined SNR: {}", reason),
            Exclusion::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// What one shift-estimation pass saw for a correlation
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct ShiftDiagnostics {
    /// Combined a priori shift used to place the windows (s)
    pub apr_dt_cpl: f64,
    pub snr: Option<Snr>,
    /// Only kept when the band asks for detailed responses
    pub windows: Option<SignalWindows>,
    /// Refined causal and acausal peak lags (s)
    pub causal_lag: Option<f64>,
    pub acausal_lag: Option<f64>,
    /// Part of the measured shift finer than `dt_err` (s)
    pub quantization_residual: f64,
    pub exclusion: Option<Exclusion>,
    /// Shift predicted by the drift model after the inversion (s)
    pub predicted: Option<f64>,
    pub residual: Option<f64>,
    pub outlier: bool,
}

/// One noise cross-correlation between two stations, evaluated in one band
#[derive(Debug, Clone, Serialize)]
pub struct Correlation {
    pub station1: String,
    pub station2: String,
    /// Geodesic station separation (m)
    pub separation: f64,
    pub average_date: DateTime<Utc>,
    /// Number of correlated days stacked in the trace
    pub number_days: f64,
    pub path: PathBuf,
    /// Index into the processing-parameter bands
    pub band: usize,
    /// Days between the reference time and `average_date`
    pub t_days: f64,
    /// Apparent shift per pass; NaN where the pass produced no estimate
    pub t_app: Vec<f64>,
    /// Parallel to `t_app`
    pub diagnostics: Vec<ShiftDiagnostics>,
    /// Outcome of the latest pass
    pub exclusion: Option<Exclusion>,
}

impl Correlation {
    pub fn new(
        pair: &StationPair,
        average_date: DateTime<Utc>,
        number_days: f64,
        path: PathBuf,
        band: usize,
        reference_time: DateTime<Utc>,
    ) -> Self {
        Correlation {
            station1: pair.station1.clone(),
            station2: pair.station2.clone(),
            separation: pair.separation,
            average_date,
            number_days,
            path,
            band,
            t_days: days_between(reference_time, average_date),
            t_app: Vec::new(),
            diagnostics: Vec::new(),
            exclusion: None,
        }
    }

    /// Append the result of one pass. Earlier entries are never touched.
    pub fn record(&mut self, t_app: f64, diagnostics: ShiftDiagnostics) {
        self.exclusion = diagnostics.exclusion.clone();
        self.t_app.push(t_app);
        self.diagnostics.push(diagnostics);
    }

    pub fn latest_t_app(&self) -> Option<f64> {
        self.t_app.last().copied()
    }

    pub fn latest_diagnostics(&self) -> Option<&ShiftDiagnostics> {
        self.diagnostics.last()
    }

    pub fn latest_diagnostics_mut(&mut self) -> Option<&mut ShiftDiagnostics> {
        self.diagnostics.last_mut()
    }

    /// Latest pass produced a finite shift that was not flagged as an outlier
    pub fn is_usable(&self) -> bool {
        let finite = self.latest_t_app().map_or(false, f64::is_finite);
        finite && !self.latest_diagnostics().map_or(false, |d| d.outlier)
    }

    pub fn involves(&self, code: &str) -> bool {
        self.station1 == code || self.station2 == code
    }

    pub fn is_pair(&self, a: &str, b: &str) -> bool {
        (self.station1 == a && self.station2 == b) || (self.station1 == b && self.station2 == a)
    }
}

/// Elapsed days from `reference` to `t`
pub fn days_between(reference: DateTime<Utc>, t: DateTime<Utc>) -> f64 {
    (t - reference).num_milliseconds() as f64 / 1000.0 / SECONDS_PER_DAY
}

/// Fields encoded in a correlation file name
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationName {
    pub station1: String,
    pub station2: String,
    pub average_date: DateTime<Utc>,
    pub number_days: f64,
}

/// Parse `STA1_STA2_<epoch>_<days>[.ext]`.
///
/// # Example
/// ```
/// use obs_clockdrift::correlation::parse_correlation_name;
/// let name = parse_correlation_name("O01_KEF_1420070400_10.json").unwrap();
/// assert_eq!(name.station2, "KEF");
/// assert_eq!(name.number_days, 10.0);
/// ```
pub fn parse_correlation_name(file_name: &str) -> Result<CorrelationName> {
    let invalid = || DriftError::InvalidCorrelationName(file_name.to_string());

    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(invalid)?;
    let parts: Vec<&str> = stem.split('_').collect();
    if parts.len() != 4 || parts[0].is_empty() || parts[1].is_empty() {
        return Err(invalid());
    }
    if parts[0] == parts[1] {
        // Autocorrelations carry no inter-station delay
        return Err(invalid());
    }

    let epoch: i64 = parts[2].parse().map_err(|_| invalid())?;
    let average_date = DateTime::from_timestamp(epoch, 0).ok_or_else(invalid)?;
    let number_days: f64 = parts[3].parse().map_err(|_| invalid())?;

    Ok(CorrelationName {
        station1: parts[0].to_string(),
        station2: parts[1].to_string(),
        average_date,
        number_days,
    })
}

/// Index the correlation files of `dir` with the given extension.
///
/// Files naming unknown stations, pairs of two reference stations and dates
/// outside a station's deployment are skipped. Traces are not read here.
pub fn discover_correlations(
    dir: &Path,
    extension: &str,
    stations: &[Station],
    n_bands: usize,
    reference_time: DateTime<Utc>,
) -> Result<Vec<Correlation>> {
    if !dir.is_dir() {
        return Err(DriftError::FileNotFound(dir.to_path_buf()));
    }

    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().and_then(|e| e.to_str()) == Some(extension))
        .collect();
    paths.sort();

    let mut correlations = Vec::new();
    for path in paths {
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let name = match parse_correlation_name(file_name) {
            Ok(name) => name,
            Err(e) => {
                warn!(file = %path.display(), "Skipping correlation file: {}", e);
                continue;
            }
        };

        let lookup = |code: &str| stations.iter().find(|s| s.code == code);
        let (s1, s2) = match (lookup(&name.station1), lookup(&name.station2)) {
            (Some(s1), Some(s2)) => (s1, s2),
            _ => {
                debug!(file = %path.display(), "Stations not in the station table");
                continue;
            }
        };
        if !s1.needs_correction && !s2.needs_correction {
            continue;
        }
        if !s1.deployed_at(name.average_date) || !s2.deployed_at(name.average_date) {
            debug!(file = %path.display(), "Average date outside deployment");
            continue;
        }

        let pair = StationPair::new(s1, s2)?;
        for band in 0..n_bands {
            correlations.push(Correlation::new(
                &pair,
                name.average_date,
                name.number_days,
                path.clone(),
                band,
                reference_time,
            ));
        }
    }

    info!(count = correlations.len(), dir = %dir.display(), "Indexed correlations");
    Ok(correlations)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_time() -> DateTime<Utc> {
        "2014-08-01T00:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_parse_correlation_name() {
        let name = parse_correlation_name("O01_KEF_1420070400_10.json").unwrap();
        assert_eq!(name.station1, "O01");
        assert_eq!(name.station2, "KEF");
        assert_eq!(name.average_date, "2015-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap());
        assert_eq!(name.number_days, 10.0);
    }

    #[test]
    fn test_parse_rejects_bad_names() {
        for bad in ["O01_KEF_10.json", "O01_O01_1420070400_10.json", "O01_KEF_x_10.json", "O01_KEF_1420070400_y.json"] {
            assert!(
                matches!(parse_correlation_name(bad), Err(DriftError::InvalidCorrelationName(_))),
                "{}",
                bad
            );
        }
    }

    #[test]
    fn test_days_between() {
        let t: DateTime<Utc> = "2014-08-11T12:00:00Z".parse().unwrap();
        assert!((days_between(reference_time(), t) - 10.5).abs() < 1e-12);
        assert!(days_between(t, reference_time()) < 0.0);
    }

    #[test]
    fn test_record_appends() {
        let a = Station::new("A", 0, false, 0.0, 0.0);
        let b = Station::new("B", 1, true, 0.0, 1.0);
        let pair = StationPair::new(&a, &b).unwrap();
        let mut c = Correlation::new(&pair, reference_time(), 10.0, PathBuf::from("x"), 0, reference_time());
        assert!(!c.is_usable());

        c.record(0.5, ShiftDiagnostics::default());
        assert!(c.is_usable());

        let excluded = ShiftDiagnostics {
            exclusion: Some(Exclusion::UndefinedSnr("flat".to_string())),
            ..Default::default()
        };
        c.record(f64::NAN, excluded);
        assert_eq!(c.t_app.len(), 2);
        assert_eq!(c.t_app[0], 0.5);
        assert!(!c.is_usable());
        assert!(c.exclusion.is_some());
        assert!(c.is_pair("B", "A"));
        assert!(c.involves("B") && !c.involves("C"));
    }

    #[test]
    fn test_discover_correlations() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "O01_KEF_1420070400_10.json",
            "O01_O02_1420070400_10.json",
            "KEF_REF_1420070400_10.json",
            "O01_XXX_1420070400_10.json",
            "O01_KEF_1400000000_10.json",
            "notes.txt",
            "garbage.json",
        ] {
            std::fs::write(dir.path().join(name), "{}").unwrap();
        }

        let mut stations = vec![
            Station::new("O01", 0, true, 63.3, -23.2),
            Station::new("O02", 1, true, 63.6, -23.0),
            Station::new("KEF", 2, false, 63.9, -22.6),
            Station::new("REF", 3, false, 64.1, -21.9),
        ];
        stations[2].deployed_from = Some("2014-08-01T00:00:00Z".parse().unwrap());

        let found = discover_correlations(dir.path(), "json", &stations, 2, reference_time()).unwrap();
        // O01_KEF and O01_O02 in two bands each. KEF_REF has no OBS, XXX is
        // unknown, 1400000000 predates KEF's deployment.
        assert_eq!(found.len(), 4);
        assert!(found.iter().all(|c| c.t_days > 150.0));
        assert_eq!(found.iter().filter(|c| c.band == 1).count(), 2);
        assert!(found.iter().all(|c| c.separation > 0.0));
    }

    #[test]
    fn test_discover_missing_dir() {
        let result = discover_correlations(Path::new("/nonexistent/dir"), "json", &[], 1, reference_time());
        assert!(matches!(result, Err(DriftError::FileNotFound(_))));
    }
}
